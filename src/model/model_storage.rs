//! 重みバンドルの作成と展開
//!
//! Tar.gz形式でモデルの重みとメタデータを1つのバイト列にまとめます。
//! 保存先はストアのblob領域です。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（ネットワーク構成、ラベル順など）
//! - model.bin       - モデルの重み（バイナリ）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Read;
use tar::{Archive, Builder};

use crate::model::model_metadata::WeightsManifest;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// メタデータと重みをTar.gz形式のバイト列にまとめる
pub fn pack_bundle(manifest: &WeightsManifest, model_binary: &[u8]) -> Result<Vec<u8>> {
    // Gzip圧縮を設定
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar_builder = Builder::new(encoder);

    // メタデータをJSONとして追加
    let json_str = manifest.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())
        .context("Failed to add metadata.json to tar")?;

    // モデルバイナリを追加
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)
        .context("Failed to add model.bin to tar")?;

    // tarアーカイブを完成させる
    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish().context("Failed to finalize gzip stream")
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)?;
    Ok(())
}

/// Tar.gzバイト列からメタデータのみを読み込む
pub fn read_manifest(bundle: &[u8]) -> Result<WeightsManifest> {
    let mut archive = Archive::new(GzDecoder::new(bundle));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(METADATA_ENTRY) {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str)?;
            return WeightsManifest::from_json_string(&json_str);
        }
    }

    Err(anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// メタデータと重みを共に読み込む
pub fn unpack_bundle(bundle: &[u8]) -> Result<(WeightsManifest, Vec<u8>)> {
    let mut archive = Archive::new(GzDecoder::new(bundle));

    let mut manifest_opt: Option<WeightsManifest> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    // 両方のファイルを読み込む
    for entry in archive.entries().context("Failed to read tar.gz archive")? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                manifest_opt = Some(WeightsManifest::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (manifest_opt, model_binary_opt) {
        (Some(manifest), Some(binary)) => Ok((manifest, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// メタデータをログに出力
pub fn log_manifest_info(manifest: &WeightsManifest) {
    tracing::info!(
        project_id = manifest.project_id,
        kind = %manifest.network.kind,
        image_size = manifest.network.image_size,
        classes = manifest.network.num_classes,
        labels = %manifest.label_names.join(", "),
        trained_at = %manifest.trained_at,
        "モデルメタデータ"
    );
}
