//! 画像とテンソルの相互変換
//!
//! 任意サイズの画像を正方形にリサイズし、各チャネルを [0, 255] から
//! [`INPUT_MIN`, `INPUT_MAX`] に正規化します。
//!
//! `out = in / 255 * (INPUT_MAX - INPUT_MIN) + INPUT_MIN`
//!
//! 出力は (C, H, W) の順で平坦化された `f32` 列です。副作用はなく、
//! 同じ入力からは常にビット単位で同一の出力が得られます。

use image::{imageops::FilterType, DynamicImage, ImageReader, RgbImage};
use std::io::Cursor;

use crate::error::CodecError;

/// モデル入力の既定サイズ（正方形）
pub const IMAGE_SIZE: usize = 224;

/// チャネル数（RGB）
pub const NUM_CHANNELS: usize = 3;

/// 正規化後の最小値
pub const INPUT_MIN: f32 = -1.0;

/// 正規化後の最大値
pub const INPUT_MAX: f32 = 1.0;

const NORMALIZATION: f32 = (INPUT_MAX - INPUT_MIN) / 255.0;

/// 正規化済み画像テンソル (C, H, W)
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    size: usize,
    data: Vec<f32>,
}

impl ImageTensor {
    /// 既存の値列からテンソルを作成
    pub fn from_values(size: usize, data: Vec<f32>) -> Result<Self, CodecError> {
        let expected = NUM_CHANNELS * size * size;
        if data.len() != expected || size == 0 {
            return Err(CodecError::TensorShape {
                size,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { size, data })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn values(&self) -> &[f32] {
        &self.data
    }

    pub fn into_values(self) -> Vec<f32> {
        self.data
    }
}

/// 画像バイト列をデコードしてテンソルに変換
pub fn encode(bytes: &[u8], size: usize) -> Result<ImageTensor, CodecError> {
    let image = decode_bytes(bytes)?;
    encode_image(&image, size)
}

/// デコード済み画像をテンソルに変換
pub fn encode_image(image: &DynamicImage, size: usize) -> Result<ImageTensor, CodecError> {
    if size == 0 {
        return Err(CodecError::TensorShape {
            size,
            expected: 0,
            actual: 0,
        });
    }

    let rgb = image.to_rgb8();
    let side = size as u32;
    let rgb = if rgb.dimensions() == (side, side) {
        rgb
    } else {
        // Triangle = バイリニア補間
        image::imageops::resize(&rgb, side, side, FilterType::Triangle)
    };

    let mut data = Vec::with_capacity(NUM_CHANNELS * size * size);
    for channel in 0..NUM_CHANNELS {
        for y in 0..side {
            for x in 0..side {
                let value = rgb.get_pixel(x, y)[channel] as f32;
                data.push(value * NORMALIZATION + INPUT_MIN);
            }
        }
    }

    Ok(ImageTensor { size, data })
}

/// テンソルをRGB画像に戻す（サムネイル・デバッグ用）
pub fn decode(tensor: &ImageTensor) -> RgbImage {
    let size = tensor.size;
    let plane = size * size;
    let side = size as u32;

    RgbImage::from_fn(side, side, |x, y| {
        let offset = y as usize * size + x as usize;
        let mut pixel = [0u8; NUM_CHANNELS];
        for (channel, value) in pixel.iter_mut().enumerate() {
            let normalized = tensor.data[channel * plane + offset];
            *value = ((normalized - INPUT_MIN) / NORMALIZATION).round().clamp(0.0, 255.0) as u8;
        }
        image::Rgb(pixel)
    })
}

/// 画像として読めるか検証し、(幅, 高さ) を返す
pub fn dimensions(bytes: &[u8]) -> Result<(u32, u32), CodecError> {
    let image = decode_bytes(bytes)?;
    Ok((image.width(), image.height()))
}

fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CodecError::Image(image::ImageError::IoError(e)))?;
    Ok(reader.decode()?)
}
