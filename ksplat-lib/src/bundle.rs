//! Multi-scene archive: several ksplat buffers with their placement,
//! zstd-compressed as one stream.
//!
//! Layout before compression: magic `KSPB`, varint version, varint scene
//! count, then per scene 16 little-endian `f32` (column-major transform), a
//! varint byte length and the raw ksplat bytes.

use std::io::{Cursor, Write};

use glam::Mat4;
use zstd::stream::{decode_all, Encoder};

use crate::buffer::SplatBuffer;
use crate::error::SplatError;
use crate::varint::{read_varint, write_varint};

pub const BUNDLE_MAGIC: [u8; 4] = *b"KSPB";
pub const BUNDLE_VERSION: u64 = 1;

#[derive(Debug, Clone)]
pub struct BundleScene {
    pub transform: Mat4,
    pub buffer: SplatBuffer,
}

pub fn serialize_bundle(scenes: &[BundleScene]) -> Vec<u8> {
    let payload: usize = scenes.iter().map(|s| s.buffer.as_bytes().len() + 64 + 10).sum();
    let mut out = Vec::with_capacity(BUNDLE_MAGIC.len() + 20 + payload);
    out.extend_from_slice(&BUNDLE_MAGIC);
    write_varint(&mut out, BUNDLE_VERSION);
    write_varint(&mut out, scenes.len() as u64);
    for scene in scenes {
        out.extend_from_slice(bytemuck::cast_slice(&scene.transform.to_cols_array()));
        let bytes = scene.buffer.as_bytes();
        write_varint(&mut out, bytes.len() as u64);
        out.extend_from_slice(bytes);
    }
    out
}

pub fn deserialize_bundle(data: &[u8]) -> Result<Vec<BundleScene>, SplatError> {
    if data.len() < BUNDLE_MAGIC.len() || data[..4] != BUNDLE_MAGIC {
        return Err(SplatError::InvalidBundle("Invalid magic number".to_string()));
    }
    let mut offset = BUNDLE_MAGIC.len();
    let version = read_varint(data, &mut offset)?;
    if version != BUNDLE_VERSION {
        return Err(SplatError::InvalidBundle(format!(
            "Unsupported version {}",
            version
        )));
    }
    let count = read_varint(data, &mut offset)?;

    let mut scenes = Vec::new();
    for index in 0..count {
        let transform_end = offset + 64;
        let transform_bytes = data.get(offset..transform_end).ok_or_else(|| {
            SplatError::InvalidBundle(format!("Scene {} transform is truncated", index))
        })?;
        let mut cols = [0.0f32; 16];
        for (c, b) in cols.iter_mut().zip(transform_bytes.chunks_exact(4)) {
            *c = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        }
        offset = transform_end;

        let len = usize::try_from(read_varint(data, &mut offset)?)
            .map_err(|e| SplatError::InvalidBundle(format!("Scene length: {}", e)))?;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                SplatError::InvalidBundle(format!(
                    "Scene {} needs {} bytes, {} remain",
                    index,
                    len,
                    data.len() - offset
                ))
            })?;
        let buffer = SplatBuffer::from_bytes(data[offset..end].to_vec())?;
        offset = end;

        scenes.push(BundleScene {
            transform: Mat4::from_cols_array(&cols),
            buffer,
        });
    }
    Ok(scenes)
}

#[inline(never)]
fn compress_zstd(data: &[u8], level: u32, workers: u32) -> Result<Vec<u8>, SplatError> {
    let mut encoder = Encoder::new(Vec::new(), level as i32)
        .map_err(|e| SplatError::ZstdCompress(format!("Encoder creation failed: {}", e)))?;
    encoder
        .multithread(workers)
        .map_err(|e| SplatError::ZstdCompress(format!("Setting multithread failed: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| SplatError::ZstdCompress(format!("Writing data failed: {}", e)))?;

    encoder
        .finish()
        .map_err(|e| SplatError::ZstdCompress(format!("Finalizing compression failed: {}", e)))
}

#[inline(never)]
fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>, SplatError> {
    decode_all(Cursor::new(data))
        .map_err(|e| SplatError::ZstdDecompress(format!("Decompression failed: {}", e)))
}

pub fn compress_bundle(
    scenes: &[BundleScene],
    compression_level: u32,
    workers: u32,
    output: &mut Vec<u8>,
) -> Result<(), SplatError> {
    if scenes.is_empty() {
        return Err(SplatError::EmptyScene);
    }
    let compressed = compress_zstd(&serialize_bundle(scenes), compression_level, workers)?;
    output.clear();
    output.extend_from_slice(&compressed);
    Ok(())
}

pub fn decompress_bundle(data: &[u8]) -> Result<Vec<BundleScene>, SplatError> {
    deserialize_bundle(&decompress_zstd(data)?)
}

cfg_if::cfg_if! {
if #[cfg(feature = "async")] {
    use async_compression::zstd::CParameter;
    use async_compression::Level;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use async_compression::tokio::bufread::ZstdDecoder;
    use async_compression::tokio::write::ZstdEncoder;
    use tokio::io::BufReader;

    #[inline(never)]
    async fn compress_zstd_async(
        data: &[u8],
        level: u32,
        workers: u32,
    ) -> Result<Vec<u8>, SplatError> {
        let mut compressed = Vec::new();
        let params = &[CParameter::nb_workers(workers)];
        let mut encoder = ZstdEncoder::with_quality_and_params(
            &mut compressed,
            Level::Precise(level as i32),
            params,
        );

        encoder.write_all(data)
            .await
            .map_err(|e| SplatError::ZstdCompress(e.to_string()))?;

        encoder.shutdown()
            .await
            .map_err(|e| SplatError::ZstdCompress(e.to_string()))?;

        Ok(compressed)
    }

    #[inline(never)]
    async fn decompress_zstd_async(data: &[u8]) -> Result<Vec<u8>, SplatError> {
        let reader = BufReader::new(Cursor::new(data));
        let mut decoder = ZstdDecoder::new(reader);
        let mut decompressed = Vec::new();

        decoder.read_to_end(&mut decompressed)
            .await
            .map_err(|e| SplatError::ZstdDecompress(e.to_string()))?;

        Ok(decompressed)
    }

    #[inline(never)]
    pub async fn compress_bundle_async(
        scenes: &[BundleScene],
        compression_level: u32,
        workers: u32,
        output: &mut Vec<u8>,
    ) -> Result<(), SplatError> {
        if scenes.is_empty() {
            return Err(SplatError::EmptyScene);
        }
        let compressed =
            compress_zstd_async(&serialize_bundle(scenes), compression_level, workers).await?;
        output.clear();
        output.extend_from_slice(&compressed);
        Ok(())
    }

    #[inline(never)]
    pub async fn decompress_bundle_async(data: &[u8]) -> Result<Vec<BundleScene>, SplatError> {
        let uncompressed = decompress_zstd_async(data).await?;
        deserialize_bundle(&uncompressed)
    }
}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::{CompressionOptions, SplatCompressor};
    use crate::structures::{SplatRecord, UncompressedSplatList};
    use glam::{Quat, Vec3};

    fn scene(offset: f32, level: u8) -> BundleScene {
        let list: UncompressedSplatList = (0..20)
            .map(|i| SplatRecord {
                center: Vec3::new(offset + i as f32, 0.0, 0.0),
                scale: Vec3::splat(0.1),
                rotation: Quat::IDENTITY,
                color: [i as u8, 0, 0, 255],
            })
            .collect();
        let buffer = SplatCompressor::new(CompressionOptions {
            compression_level: level,
            bucket_size: 16,
            ..Default::default()
        })
        .unwrap()
        .compress(&list)
        .unwrap();
        BundleScene {
            transform: Mat4::from_translation(Vec3::new(0.0, offset, 0.0)),
            buffer,
        }
    }

    #[test]
    fn test_compress_decompress_bundle() {
        let scenes = vec![scene(0.0, 0), scene(50.0, 1)];
        let mut packed = Vec::new();
        compress_bundle(&scenes, 3, 1, &mut packed).expect("compress_bundle(...) failed");

        let restored = decompress_bundle(&packed).expect("decompress_bundle(...) failed");
        assert_eq!(restored.len(), 2);
        for (a, b) in scenes.iter().zip(&restored) {
            assert_eq!(a.transform, b.transform);
            assert_eq!(a.buffer.as_bytes(), b.buffer.as_bytes());
        }
    }

    #[test]
    fn test_rejects_corrupt_bundles() {
        assert!(matches!(
            deserialize_bundle(b"NOPE"),
            Err(SplatError::InvalidBundle(_))
        ));

        let raw = serialize_bundle(&[scene(0.0, 0)]);
        assert!(deserialize_bundle(&raw[..raw.len() - 10]).is_err());

        let mut huge = BUNDLE_MAGIC.to_vec();
        write_varint(&mut huge, BUNDLE_VERSION);
        huge.extend_from_slice(&[0xFF; 11]);
        assert!(matches!(
            deserialize_bundle(&huge),
            Err(SplatError::VarintOverflow)
        ));

        assert!(matches!(
            decompress_bundle(b"definitely not zstd"),
            Err(SplatError::ZstdDecompress(_))
        ));
        assert!(matches!(
            compress_bundle(&[], 3, 1, &mut Vec::new()),
            Err(SplatError::EmptyScene)
        ));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_compress_decompress_bundle_async() {
        let scenes = vec![scene(1.0, 1)];
        let mut packed = Vec::new();
        compress_bundle_async(&scenes, 1, 1, &mut packed)
            .await
            .expect("compress_bundle_async failed");

        // Both directions interoperate with the sync codec.
        let restored = decompress_bundle(&packed).expect("decompress_bundle failed");
        assert_eq!(restored[0].buffer.as_bytes(), scenes[0].buffer.as_bytes());
        let restored = decompress_bundle_async(&packed)
            .await
            .expect("decompress_bundle_async failed");
        assert_eq!(restored[0].transform, scenes[0].transform);
    }
}
