//! フォルダ単位のラベル付き画像から学習するバイナリ
//!
//! 使い方: quicklabel-train <data_dir> [config.json]
//!
//! `data_dir` 直下のサブディレクトリ名をラベル名として、
//! その中の png / jpg / jpeg 画像を取り込みます。

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use quicklabel::summary::{dataset_overview, prediction_accuracy, summarize_history};
use quicklabel::{init_logging, EngineConfig, Image, Orchestrator, ProjectId};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("info");

    // コマンドライン引数を取得
    let args: Vec<String> = std::env::args().collect();
    let data_dir = match args.get(1) {
        Some(dir) => PathBuf::from(dir),
        None => anyhow::bail!("usage: quicklabel-train <data_dir> [config.json]"),
    };
    let config_path = args
        .get(2)
        .map(PathBuf::from)
        .unwrap_or_else(EngineConfig::default_path);

    let config = EngineConfig::load_or_default(&config_path);
    let orchestrator = Orchestrator::from_config(&config)?;

    let name = data_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("project")
        .to_string();
    let project = orchestrator.datasets().create_project(&name)?;
    import_folders(&orchestrator, project.id, &data_dir)?;

    let dataset = orchestrator.dataset(project.id)?;
    let overview = dataset_overview(&dataset);
    println!("プロジェクト '{}' (id {}): {} 枚", project.name, project.id, overview.total_images);
    for (label, count) in &overview.labels {
        println!("  {}: {} 枚", label, count);
    }

    let outcome = orchestrator.train_model(project.id).await?;
    let info = &outcome.model_info;

    println!("\n学習完了 ({})", info.kind);
    println!("  重み: {}", info.model_ref);
    println!("  最終エポックの学習精度: {}", summarize_history(&info.history));
    println!(
        "  {} of your images are predicted correctly",
        prediction_accuracy(&info.prediction)?
    );

    Ok(())
}

/// ラベルごとのサブディレクトリから画像を取り込む
fn import_folders(orchestrator: &Orchestrator, project_id: ProjectId, data_dir: &Path) -> Result<()> {
    let mut class_dirs: Vec<PathBuf> = std::fs::read_dir(data_dir)
        .with_context(|| format!("Failed to read {}", data_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    class_dirs.sort();

    for class_dir in class_dirs {
        let Some(label) = class_dir.file_name().and_then(|n| n.to_str()) else {
            tracing::warn!("ディレクトリ名を読めません: {}", class_dir.display());
            continue;
        };

        let mut images: Vec<PathBuf> = std::fs::read_dir(&class_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image_file(path))
            .collect();
        images.sort();

        for path in images {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if let Err(e) = orchestrator
                .datasets()
                .append_image(project_id, label, Image::new(bytes))
            {
                tracing::warn!("画像を取り込めません {}: {}", path.display(), e);
            }
        }
    }

    Ok(())
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                ext == "png" || ext == "jpg" || ext == "jpeg"
            })
            .unwrap_or(false)
}
