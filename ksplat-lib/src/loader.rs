use std::path::Path;

use crate::buffer::SplatBuffer;
use crate::compressor::{CompressionOptions, SplatCompressor};
use crate::error::SplatError;
use crate::ply::parse_ply;
use crate::splat_file::parse_splat_file;
use crate::structures::UncompressedSplatList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneFormat {
    Ply,
    Splat,
    KSplat,
}

impl SceneFormat {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SplatError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .ok_or_else(|| {
                SplatError::UnsupportedFormat(format!("'{}' has no extension", path.display()))
            })?;
        match ext.as_str() {
            "ply" => Ok(Self::Ply),
            "splat" => Ok(Self::Splat),
            "ksplat" => Ok(Self::KSplat),
            other => Err(SplatError::UnsupportedFormat(format!(
                "'.{}' ({})",
                other,
                path.display()
            ))),
        }
    }
}

/// Parses a raw (uncompressed) scene. ksplat input is already compressed and
/// is rejected here; use [`load_scene`] for it.
pub fn parse_uncompressed(
    raw_data: &[u8],
    format: SceneFormat,
) -> Result<UncompressedSplatList, SplatError> {
    match format {
        SceneFormat::Ply => parse_ply(raw_data),
        SceneFormat::Splat => parse_splat_file(raw_data),
        SceneFormat::KSplat => Err(SplatError::UnsupportedFormat(
            "ksplat data is already compressed".to_string(),
        )),
    }
}

/// Loads any supported scene into a [`SplatBuffer`], compressing raw input
/// with `options`.
pub fn load_scene(
    raw_data: &[u8],
    format: SceneFormat,
    options: &CompressionOptions,
) -> Result<SplatBuffer, SplatError> {
    match format {
        SceneFormat::KSplat => SplatBuffer::from_bytes(raw_data.to_vec()),
        _ => {
            let list = parse_uncompressed(raw_data, format)?;
            if list.is_empty() {
                return Err(SplatError::EmptyScene);
            }
            tracing::info!(splats = list.len(), ?format, "parsed scene");
            SplatCompressor::new(*options)?.compress(&list)
        }
    }
}

pub fn load_scene_file(
    path: impl AsRef<Path>,
    options: &CompressionOptions,
) -> Result<SplatBuffer, SplatError> {
    let path = path.as_ref();
    let format = SceneFormat::from_path(path)?;
    let raw_data = std::fs::read(path)?;
    load_scene(&raw_data, format, options)
}
