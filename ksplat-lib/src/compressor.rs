use foldhash::HashMap;
use foldhash::HashMapExt;
use glam::Vec3;
use zerocopy::IntoBytes;

use crate::buffer::SplatBuffer;
use crate::common::{float_to_half, normalize_quat};
use crate::error::SplatError;
use crate::structures::{
    compression_level, SplatBufferHeader, SplatRecord, UncompressedSplatList, BYTES_PER_BUCKET,
    COMPRESSION_LEVELS, INVALID_SPLAT_COLOR, INVALID_SPLAT_INDEX, INVALID_SPLAT_SCALE,
    VERSION_MAJOR, VERSION_MINOR,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionOptions {
    /// 0 stores raw `f32`, 1 stores half floats and bucket-relative centers.
    pub compression_level: u8,
    /// Splats with opacity below this are dropped.
    pub minimum_alpha: u8,
    /// Side length of one spatial block, in world units.
    pub block_size: f32,
    /// Number of splat slots per bucket.
    pub bucket_size: u32,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            compression_level: 0,
            minimum_alpha: 1,
            block_size: 5.0,
            bucket_size: 256,
        }
    }
}

impl CompressionOptions {
    pub fn validate(&self) -> Result<(), SplatError> {
        compression_level(self.compression_level)
            .map_err(|e| SplatError::InvalidCompressionOptions(e.to_string()))?;
        if self.bucket_size == 0 {
            return Err(SplatError::InvalidCompressionOptions(
                "bucket_size must be positive".to_string(),
            ));
        }
        if !(self.block_size.is_finite() && self.block_size > 0.0) {
            return Err(SplatError::InvalidCompressionOptions(format!(
                "block_size must be a positive finite number, got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    center: Vec3,
    splats: Vec<u32>,
}

#[derive(Debug, Default)]
struct PackedSplats {
    centers: Vec<u8>,
    scales: Vec<u8>,
    colors: Vec<u8>,
    rotations: Vec<u8>,
    bucket_centers: Vec<u8>,
    fill_ranges: Vec<u8>,
}

/// Turns an [`UncompressedSplatList`] into a [`SplatBuffer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SplatCompressor {
    options: CompressionOptions,
}

impl SplatCompressor {
    pub fn new(options: CompressionOptions) -> Result<Self, SplatError> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &CompressionOptions {
        &self.options
    }

    pub fn compress(&self, list: &UncompressedSplatList) -> Result<SplatBuffer, SplatError> {
        list.validate()?;
        if list.is_empty() {
            return Err(SplatError::EmptyScene);
        }

        let splats = collect_valid_splats(list, self.options.minimum_alpha);
        let spatial = self.options.compression_level > 0;
        let buckets = compute_buckets(
            &splats,
            self.options.block_size,
            self.options.bucket_size as usize,
            spatial,
        );
        let packed = self.pack_buckets(&splats, &buckets);
        let header = SplatBufferHeader {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            extra_k: 0,
            compression_level: self.options.compression_level,
            splat_count: (buckets.len() * self.options.bucket_size as usize) as u32,
            bucket_size: self.options.bucket_size,
            bucket_count: buckets.len() as u32,
            bucket_block_size: self.options.block_size,
            bytes_per_bucket: BYTES_PER_BUCKET,
            compression_scale_range: compression_level(self.options.compression_level)?.scale_range,
            fill_range_bytes: packed.fill_ranges.len() as u32,
        };

        tracing::debug!(
            input = list.len(),
            kept = splats.len() - 1,
            buckets = buckets.len(),
            padded = header.splat_count,
            level = header.compression_level,
            "compressed splat list"
        );

        SplatBuffer::from_bytes(serialize_packed_splats(&header, &packed))
    }

    fn pack_buckets(&self, splats: &[SplatRecord], buckets: &[Bucket]) -> PackedSplats {
        let level = self.options.compression_level;
        let layout = &COMPRESSION_LEVELS[level as usize];
        let slot_count = buckets.len() * self.options.bucket_size as usize;
        let scale_range = layout.scale_range as f32;
        let half_block = self.options.block_size / 2.0;

        let mut packed = PackedSplats::default();
        packed.centers.reserve(slot_count * layout.bytes_per_center);
        packed.scales.reserve(slot_count * layout.bytes_per_scale);
        packed.colors.reserve(slot_count * layout.bytes_per_color);
        packed.rotations.reserve(slot_count * layout.bytes_per_rotation);

        for bucket in buckets {
            if level > 0 {
                packed
                    .bucket_centers
                    .extend_from_slice(bytemuck::cast_slice(&bucket.center.to_array()));
            }

            // Real splats are contiguous; the invalid splat and padding sit
            // outside the range.
            let real = |&i: &u32| i != INVALID_SPLAT_INDEX;
            let start = bucket.splats.iter().position(real).unwrap_or(bucket.splats.len());
            let end = bucket.splats.iter().rposition(real).map_or(start, |p| p + 1);
            packed.fill_ranges.extend_from_slice(&(start as u32).to_le_bytes());
            packed.fill_ranges.extend_from_slice(&(end as u32).to_le_bytes());

            for &index in &bucket.splats {
                let (center, scale, rotation, color) = if index == INVALID_SPLAT_INDEX {
                    (
                        bucket.center,
                        [INVALID_SPLAT_SCALE; 3],
                        [1.0, 0.0, 0.0, 0.0],
                        INVALID_SPLAT_COLOR,
                    )
                } else {
                    let splat = &splats[index as usize];
                    let q = splat.rotation;
                    (
                        splat.center,
                        splat.scale.to_array(),
                        normalize_quat([q.w, q.x, q.y, q.z]),
                        splat.color,
                    )
                };

                if level == 0 {
                    packed
                        .centers
                        .extend_from_slice(bytemuck::cast_slice(&center.to_array()));
                    packed.scales.extend_from_slice(bytemuck::cast_slice(&scale));
                    packed.rotations.extend_from_slice(bytemuck::cast_slice(&rotation));
                } else {
                    for axis in 0..3 {
                        let q = quantize_center(
                            center[axis],
                            bucket.center[axis],
                            half_block,
                            scale_range,
                        );
                        packed.centers.extend_from_slice(&q.to_le_bytes());
                    }
                    for s in scale {
                        packed.scales.extend_from_slice(&float_to_half(s).to_le_bytes());
                    }
                    for r in rotation {
                        packed.rotations.extend_from_slice(&float_to_half(r).to_le_bytes());
                    }
                }
                packed.colors.extend_from_slice(&color);
            }
        }

        packed
    }
}

/// Bucket-relative fixed-point encoding of one center coordinate. The
/// reconstruction error is bounded by `half_block / scale_range`.
#[inline]
pub(crate) fn quantize_center(
    value: f32,
    bucket_center: f32,
    half_block: f32,
    scale_range: f32,
) -> u16 {
    let q = ((value - bucket_center) * (scale_range / half_block)).round() + scale_range;
    q.clamp(0.0, 2.0 * scale_range) as u16
}

/// Builds the working set: the invalid splat at [`INVALID_SPLAT_INDEX`]
/// followed by every input splat whose opacity reaches `minimum_alpha`.
fn collect_valid_splats(list: &UncompressedSplatList, minimum_alpha: u8) -> Vec<SplatRecord> {
    let mut splats = Vec::with_capacity(list.len() + 1);
    splats.push(SplatRecord::default());
    splats.extend(list.iter().filter(|s| s.color[3] >= minimum_alpha));
    splats
}

fn compute_buckets(
    splats: &[SplatRecord],
    block_size: f32,
    bucket_size: usize,
    spatial: bool,
) -> Vec<Bucket> {
    let valid = &splats[1..];
    let (min, max) = valid.iter().fold(
        (Vec3::splat(f32::INFINITY), Vec3::splat(f32::NEG_INFINITY)),
        |(min, max), s| (min.min(s.center), max.max(s.center)),
    );
    let (min, max) = if valid.is_empty() {
        (Vec3::ZERO, Vec3::ZERO)
    } else {
        (min, max)
    };

    let block_key = |center: Vec3| -> [u32; 3] {
        if !spatial {
            return [0; 3];
        }
        let rel = ((center - min) / block_size).floor().max(Vec3::ZERO);
        [rel.x as u32, rel.y as u32, rel.z as u32]
    };
    let block_center = |key: [u32; 3]| -> Vec3 {
        if !spatial {
            return (min + max) * 0.5;
        }
        min + (Vec3::new(key[0] as f32, key[1] as f32, key[2] as f32) + 0.5) * block_size
    };

    let mut full: Vec<Bucket> = Vec::new();
    let mut open: Vec<Option<Bucket>> = Vec::new();
    let mut open_by_block: HashMap<[u32; 3], usize> = HashMap::new();

    // The invalid splat rides along with the first real splat's block.
    let first_key = valid.first().map(|s| block_key(s.center)).unwrap_or([0; 3]);

    for (index, splat) in splats.iter().enumerate() {
        let key = if index == INVALID_SPLAT_INDEX as usize {
            first_key
        } else {
            block_key(splat.center)
        };
        let slot = *open_by_block.entry(key).or_insert_with(|| {
            open.push(None);
            open.len() - 1
        });
        let len = {
            let bucket = open[slot].get_or_insert_with(|| Bucket {
                center: block_center(key),
                splats: Vec::with_capacity(bucket_size),
            });
            bucket.splats.push(index as u32);
            bucket.splats.len()
        };
        if len >= bucket_size {
            if let Some(done) = open[slot].take() {
                full.push(done);
            }
        }
    }

    for mut bucket in open.into_iter().flatten() {
        bucket.splats.resize(bucket_size, INVALID_SPLAT_INDEX);
        full.push(bucket);
    }
    full
}

fn serialize_packed_splats(header: &SplatBufferHeader, packed: &PackedSplats) -> Vec<u8> {
    let raw = header.to_raw();
    let header_bytes = raw.as_bytes();
    let data_size = packed.centers.len()
        + packed.scales.len()
        + packed.colors.len()
        + packed.rotations.len()
        + packed.bucket_centers.len()
        + packed.fill_ranges.len();

    let mut out = Vec::with_capacity(header_bytes.len() + data_size);
    out.extend_from_slice(header_bytes);
    out.extend_from_slice(&packed.centers);
    out.extend_from_slice(&packed.scales);
    out.extend_from_slice(&packed.colors);
    out.extend_from_slice(&packed.rotations);
    out.extend_from_slice(&packed.bucket_centers);
    out.extend_from_slice(&packed.fill_ranges);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    fn splat(center: Vec3, color: [u8; 4]) -> SplatRecord {
        SplatRecord {
            center,
            scale: Vec3::ONE,
            rotation: Quat::IDENTITY,
            color,
        }
    }

    fn grid_list(n: usize) -> UncompressedSplatList {
        (0..n)
            .map(|i| {
                let f = i as f32;
                SplatRecord {
                    center: Vec3::new(f * 0.37 - 20.0, (f * 1.3).sin() * 7.0, f * 0.11),
                    scale: Vec3::new(0.1 + f * 0.001, 0.2, 0.05),
                    rotation: Quat::from_rotation_y(f * 0.1),
                    color: [(i % 256) as u8, 20, 30, 255],
                }
            })
            .collect()
    }

    #[test]
    fn test_two_splat_level0_scene() {
        let list: UncompressedSplatList = [
            splat(Vec3::ZERO, [255, 0, 0, 255]),
            splat(Vec3::new(10.0, 0.0, 0.0), [0, 255, 0, 255]),
        ]
        .into_iter()
        .collect();
        let options = CompressionOptions {
            bucket_size: 256,
            ..Default::default()
        };
        let buffer = SplatCompressor::new(options).unwrap().compress(&list).unwrap();

        assert_eq!(buffer.splat_count(), 256);
        assert_eq!(buffer.splat_color(1).unwrap(), [255, 0, 0, 255]);
        assert_eq!(buffer.splat_color(2).unwrap(), [0, 255, 0, 255]);
        assert_eq!(buffer.splat_color(0).unwrap(), INVALID_SPLAT_COLOR);
        assert_eq!(buffer.splat_color(255).unwrap(), INVALID_SPLAT_COLOR);
    }

    #[test]
    fn test_level0_roundtrip_is_bit_exact() {
        let list = grid_list(300);
        let buffer = SplatCompressor::new(CompressionOptions::default())
            .unwrap()
            .compress(&list)
            .unwrap();
        assert_eq!(buffer.splat_count(), 512);

        for (i, original) in list.iter().enumerate() {
            let slot = i + 1;
            let center = buffer.splat_center(slot).unwrap();
            let (scale, rotation) = buffer.splat_scale_and_rotation(slot).unwrap();
            assert_eq!(center.to_array().map(f32::to_bits), original.center.to_array().map(f32::to_bits));
            assert_eq!(scale.to_array().map(f32::to_bits), original.scale.to_array().map(f32::to_bits));
            let q = original.rotation.normalize();
            assert!((rotation.dot(q) - 1.0).abs() < 1e-6);
            assert_eq!(buffer.splat_color(slot).unwrap(), original.color);
        }
    }

    #[test]
    fn test_level1_error_is_bounded() {
        let list = grid_list(1000);
        let options = CompressionOptions {
            compression_level: 1,
            block_size: 4.0,
            bucket_size: 64,
            ..Default::default()
        };
        let buffer = SplatCompressor::new(options).unwrap().compress(&list).unwrap();
        let bound = 2.0 / 32767.0 + 1e-4;

        let mut seen = 0;
        for slot in 0..buffer.splat_count() {
            let color = buffer.splat_color(slot).unwrap();
            if color == INVALID_SPLAT_COLOR {
                continue;
            }
            // Color red channel carries i % 256, green is constant 20.
            assert_eq!(color[1], 20);
            let center = buffer.splat_center(slot).unwrap();
            let original = list
                .iter()
                .filter(|s| s.color[0] == color[0])
                .min_by(|a, b| {
                    a.center
                        .distance(center)
                        .partial_cmp(&b.center.distance(center))
                        .unwrap()
                })
                .unwrap();
            let err = (center - original.center).abs();
            assert!(err.max_element() <= bound, "slot {} error {:?}", slot, err);

            let (scale, rotation) = buffer.splat_scale_and_rotation(slot).unwrap();
            assert!((scale - original.scale).abs().max_element() <= 1e-3);
            assert!(rotation.dot(original.rotation.normalize()).abs() > 0.999);
            seen += 1;
        }
        assert_eq!(seen, 1000);
    }

    #[test]
    fn test_every_bucket_is_padded_to_size() {
        let list = grid_list(150);
        let options = CompressionOptions {
            compression_level: 1,
            block_size: 2.0,
            bucket_size: 16,
            ..Default::default()
        };
        let buffer = SplatCompressor::new(options).unwrap().compress(&list).unwrap();
        let header = buffer.header();
        assert_eq!(header.splat_count, header.bucket_count * 16);

        let invalid = (0..buffer.splat_count())
            .filter(|&i| buffer.splat_color(i).unwrap() == INVALID_SPLAT_COLOR)
            .count();
        // Every slot is either one of the 150 inputs or padding.
        assert_eq!(invalid, buffer.splat_count() - 150);
        for slot in 0..buffer.splat_count() {
            if buffer.splat_color(slot).unwrap() == INVALID_SPLAT_COLOR {
                let (scale, _) = buffer.splat_scale_and_rotation(slot).unwrap();
                assert!((scale.x - INVALID_SPLAT_SCALE).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_minimum_alpha_filters_splats() {
        let list: UncompressedSplatList = [
            splat(Vec3::ZERO, [10, 10, 10, 0]),
            splat(Vec3::ONE, [20, 20, 20, 40]),
            splat(Vec3::NEG_ONE, [30, 30, 30, 200]),
        ]
        .into_iter()
        .collect();
        let options = CompressionOptions {
            minimum_alpha: 50,
            bucket_size: 4,
            ..Default::default()
        };
        let buffer = SplatCompressor::new(options).unwrap().compress(&list).unwrap();
        assert_eq!(buffer.splat_count(), 4);
        assert_eq!(buffer.splat_color(1).unwrap(), [30, 30, 30, 200]);
        assert_eq!(buffer.splat_color(2).unwrap(), INVALID_SPLAT_COLOR);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            SplatCompressor::new(CompressionOptions {
                compression_level: 2,
                ..Default::default()
            }),
            Err(SplatError::InvalidCompressionOptions(_))
        ));
        assert!(matches!(
            SplatCompressor::new(CompressionOptions {
                block_size: 0.0,
                ..Default::default()
            }),
            Err(SplatError::InvalidCompressionOptions(_))
        ));

        let compressor = SplatCompressor::default();
        assert!(matches!(
            compressor.compress(&UncompressedSplatList::new()),
            Err(SplatError::EmptyScene)
        ));

        let mut list = grid_list(3);
        list.scale_2.pop();
        assert!(matches!(
            compressor.compress(&list),
            Err(SplatError::MismatchedArrays(_))
        ));
    }

    #[test]
    fn test_quantize_center_clamps() {
        assert_eq!(quantize_center(0.0, 0.0, 2.5, 32767.0), 32767);
        assert_eq!(quantize_center(100.0, 0.0, 2.5, 32767.0), 65534);
        assert_eq!(quantize_center(-100.0, 0.0, 2.5, 32767.0), 0);
    }
}
