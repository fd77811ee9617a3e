//! 推論結果と学習履歴の要約

use std::fmt;

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::types::{Dataset, Prediction, TrainingLog};

/// 最も確率の高いラベル
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelScore {
    pub label: String,
    pub confidence: f32,
}

/// スコアベクトルからラベルを選ぶ
///
/// 同点の場合は先に現れたラベルを返します。
pub fn argmax_label(scores: &[f32], labels: &[String]) -> Result<LabelScore> {
    if scores.len() != labels.len() || scores.is_empty() {
        return Err(EngineError::LabelMismatch {
            scores: scores.len(),
            labels: labels.len(),
        });
    }

    let mut best = 0;
    for (index, score) in scores.iter().enumerate().skip(1) {
        if *score > scores[best] {
            best = index;
        }
    }

    Ok(LabelScore {
        label: labels[best].clone(),
        confidence: scores[best],
    })
}

/// 精度の要約
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AccuracySummary {
    /// 表示できるデータがない
    NotEnoughData,
    /// 百分率（0〜100）
    Percent { value: f64 },
}

impl AccuracySummary {
    fn from_fraction(fraction: f64) -> Self {
        AccuracySummary::Percent {
            value: fraction * 100.0,
        }
    }

    pub fn percent(&self) -> Option<f64> {
        match self {
            AccuracySummary::NotEnoughData => None,
            AccuracySummary::Percent { value } => Some(*value),
        }
    }
}

impl fmt::Display for AccuracySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccuracySummary::NotEnoughData => write!(f, "not enough data yet"),
            AccuracySummary::Percent { value } => write!(f, "{:.0}%", value),
        }
    }
}

/// 最終エポックの学習精度
pub fn summarize_history(history: &[TrainingLog]) -> AccuracySummary {
    history
        .last()
        .map_or(AccuracySummary::NotEnoughData, |log| {
            AccuracySummary::from_fraction(log.accuracy)
        })
}

/// 自己評価で自分のラベルが最高スコアになった画像の割合
pub fn prediction_accuracy(prediction: &Prediction) -> Result<AccuracySummary> {
    let labels: Vec<String> = prediction.labels.iter().map(|l| l.label.clone()).collect();
    let mut total = 0usize;
    let mut correct = 0usize;

    for label in &prediction.labels {
        for scores in &label.images {
            total += 1;
            if argmax_label(scores, &labels)?.label == label.label {
                correct += 1;
            }
        }
    }

    if total == 0 {
        return Ok(AccuracySummary::NotEnoughData);
    }
    Ok(AccuracySummary::from_fraction(correct as f64 / total as f64))
}

/// データセットの画像枚数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetOverview {
    pub total_images: usize,
    /// 画像のあるラベルのみ（保存順）
    pub labels: Vec<(String, usize)>,
}

pub fn dataset_overview(dataset: &Dataset) -> DatasetOverview {
    let labels = dataset
        .labels
        .iter()
        .filter(|label| !label.images.is_empty())
        .map(|label| (label.name.clone(), label.images.len()))
        .collect();

    DatasetOverview {
        total_images: dataset.total_images(),
        labels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Image, Label, LabelPrediction};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_argmax_label() {
        let labels = names(&["cat", "dog", "bird"]);
        let best = argmax_label(&[0.1, 0.7, 0.2], &labels).unwrap();
        assert_eq!(best.label, "dog");
        assert_eq!(best.confidence, 0.7);

        // 同点は先頭優先
        assert_eq!(argmax_label(&[0.4, 0.4, 0.2], &labels).unwrap().label, "cat");
        assert_eq!(argmax_label(&[0.2, 0.4, 0.4], &labels).unwrap().label, "dog");
    }

    #[test]
    fn test_argmax_label_mismatch() {
        let labels = names(&["cat", "dog"]);
        assert!(matches!(
            argmax_label(&[0.5, 0.3, 0.2], &labels),
            Err(EngineError::LabelMismatch { scores: 3, labels: 2 })
        ));
        assert!(argmax_label(&[], &[]).is_err());
    }

    #[test]
    fn test_summarize_history() {
        assert_eq!(summarize_history(&[]), AccuracySummary::NotEnoughData);
        assert_eq!(summarize_history(&[]).to_string(), "not enough data yet");

        let history = vec![
            TrainingLog { epoch: 0, loss: 1.2, accuracy: 0.5 },
            TrainingLog { epoch: 1, loss: 0.4, accuracy: 0.875 },
        ];
        let summary = summarize_history(&history);
        assert_eq!(summary.percent(), Some(87.5));
        assert_eq!(summary.to_string(), "88%");
    }

    #[test]
    fn test_prediction_accuracy() {
        let prediction = Prediction {
            project_id: 1,
            labels: vec![
                LabelPrediction {
                    label: "cat".to_string(),
                    images: vec![vec![0.9, 0.1], vec![0.3, 0.7]],
                },
                LabelPrediction {
                    label: "dog".to_string(),
                    images: vec![vec![0.2, 0.8], vec![0.1, 0.9]],
                },
            ],
        };
        assert_eq!(prediction_accuracy(&prediction).unwrap().percent(), Some(75.0));

        let empty = Prediction { project_id: 1, labels: Vec::new() };
        assert_eq!(prediction_accuracy(&empty).unwrap(), AccuracySummary::NotEnoughData);
    }

    #[test]
    fn test_dataset_overview() {
        let mut dataset = Dataset::empty(1);
        let mut cat = Label::new("cat");
        cat.images = vec![Image::new(vec![1]), Image::new(vec![2])];
        dataset.labels.push(cat);
        dataset.labels.push(Label::new("dog"));

        let overview = dataset_overview(&dataset);
        assert_eq!(overview.total_images, 2);
        assert_eq!(overview.labels, vec![("cat".to_string(), 2)]);
    }
}
