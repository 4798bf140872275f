use glam::{Quat, Vec3};
use zerocopy::byteorder::little_endian::{F32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::SplatError;

pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 1;
pub const HEADER_SIZE_BYTES: usize = 1024;
pub const BYTES_PER_BUCKET: u32 = 12;

/// Index of the synthetic "empty" splat every encoded buffer starts with.
/// Bucket padding references this index instead of carrying its own data.
pub const INVALID_SPLAT_INDEX: u32 = 0;
/// Color written for the invalid splat and every padding slot.
pub const INVALID_SPLAT_COLOR: [u8; 4] = [255, 0, 0, 0];
/// Scale written for the invalid splat and every padding slot.
pub const INVALID_SPLAT_SCALE: f32 = 0.01;

/// Per-level byte widths of each payload attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel {
    pub bytes_per_center: usize,
    pub bytes_per_scale: usize,
    pub bytes_per_color: usize,
    pub bytes_per_rotation: usize,
    pub scale_range: u32,
}

impl CompressionLevel {
    pub const fn bytes_per_splat(&self) -> usize {
        self.bytes_per_center + self.bytes_per_scale + self.bytes_per_color + self.bytes_per_rotation
    }
}

pub const COMPRESSION_LEVELS: [CompressionLevel; 2] = [
    CompressionLevel {
        bytes_per_center: 12,
        bytes_per_scale: 12,
        bytes_per_color: 4,
        bytes_per_rotation: 16,
        scale_range: 1,
    },
    CompressionLevel {
        bytes_per_center: 6,
        bytes_per_scale: 6,
        bytes_per_color: 4,
        bytes_per_rotation: 8,
        scale_range: 32767,
    },
];

pub fn compression_level(level: u8) -> Result<&'static CompressionLevel, SplatError> {
    COMPRESSION_LEVELS
        .get(level as usize)
        .ok_or_else(|| SplatError::InvalidHeader(format!("Unsupported compression level {}", level)))
}

/// On-disk header layout. All multi-byte fields are little-endian.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RawSplatBufferHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub extra_k: u8,
    pub compression_level: u8,
    pub splat_count: U32,
    pub bucket_size: U32,
    pub bucket_count: U32,
    pub bucket_block_size: F32,
    pub bytes_per_bucket: U32,
    pub compression_scale_range: U32,
    pub fill_range_bytes: U32,
    pub reserved: [u8; HEADER_SIZE_BYTES - 32],
}

/// Decoded header values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatBufferHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub extra_k: u8,
    pub compression_level: u8,
    pub splat_count: u32,
    pub bucket_size: u32,
    pub bucket_count: u32,
    pub bucket_block_size: f32,
    pub bytes_per_bucket: u32,
    pub compression_scale_range: u32,
    /// Size of the trailing per-bucket fill table, zero when absent. Each
    /// bucket stores `start, end` (`u32`) slots that hold real splats.
    pub fill_range_bytes: u32,
}

impl SplatBufferHeader {
    pub fn half_bucket_block_size(&self) -> f32 {
        self.bucket_block_size / 2.0
    }

    pub(crate) fn to_raw(self) -> RawSplatBufferHeader {
        RawSplatBufferHeader {
            version_major: self.version_major,
            version_minor: self.version_minor,
            extra_k: self.extra_k,
            compression_level: self.compression_level,
            splat_count: U32::new(self.splat_count),
            bucket_size: U32::new(self.bucket_size),
            bucket_count: U32::new(self.bucket_count),
            bucket_block_size: F32::new(self.bucket_block_size),
            bytes_per_bucket: U32::new(self.bytes_per_bucket),
            compression_scale_range: U32::new(self.compression_scale_range),
            fill_range_bytes: U32::new(self.fill_range_bytes),
            reserved: [0; HEADER_SIZE_BYTES - 32],
        }
    }

    pub(crate) fn from_raw(raw: &RawSplatBufferHeader) -> Result<Self, SplatError> {
        let level = compression_level(raw.compression_level)?;
        let stored_range = raw.compression_scale_range.get();
        Ok(Self {
            version_major: raw.version_major,
            version_minor: raw.version_minor,
            extra_k: raw.extra_k,
            compression_level: raw.compression_level,
            splat_count: raw.splat_count.get(),
            bucket_size: raw.bucket_size.get(),
            bucket_count: raw.bucket_count.get(),
            bucket_block_size: raw.bucket_block_size.get(),
            bytes_per_bucket: raw.bytes_per_bucket.get(),
            compression_scale_range: if stored_range == 0 {
                level.scale_range
            } else {
                stored_range
            },
            fill_range_bytes: raw.fill_range_bytes.get(),
        })
    }
}

/// A single uncompressed splat. Rotation is a `glam` quaternion; color and
/// opacity are in `0..=255`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatRecord {
    pub center: Vec3,
    pub scale: Vec3,
    pub rotation: Quat,
    pub color: [u8; 4],
}

impl Default for SplatRecord {
    fn default() -> Self {
        Self {
            center: Vec3::ZERO,
            scale: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            color: [0; 4],
        }
    }
}

/// Raw splats of one scene as parallel attribute arrays. Rotations follow the
/// PLY convention: `rot_0` is `w`.
#[derive(Debug, Default, Clone)]
pub struct UncompressedSplatList {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub z: Vec<f32>,
    pub scale_0: Vec<f32>,
    pub scale_1: Vec<f32>,
    pub scale_2: Vec<f32>,
    pub rot_0: Vec<f32>,
    pub rot_1: Vec<f32>,
    pub rot_2: Vec<f32>,
    pub rot_3: Vec<f32>,
    pub r: Vec<u8>,
    pub g: Vec<u8>,
    pub b: Vec<u8>,
    pub opacity: Vec<u8>,
}

impl UncompressedSplatList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            x: Vec::with_capacity(capacity),
            y: Vec::with_capacity(capacity),
            z: Vec::with_capacity(capacity),
            scale_0: Vec::with_capacity(capacity),
            scale_1: Vec::with_capacity(capacity),
            scale_2: Vec::with_capacity(capacity),
            rot_0: Vec::with_capacity(capacity),
            rot_1: Vec::with_capacity(capacity),
            rot_2: Vec::with_capacity(capacity),
            rot_3: Vec::with_capacity(capacity),
            r: Vec::with_capacity(capacity),
            g: Vec::with_capacity(capacity),
            b: Vec::with_capacity(capacity),
            opacity: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn push(&mut self, splat: SplatRecord) {
        self.x.push(splat.center.x);
        self.y.push(splat.center.y);
        self.z.push(splat.center.z);
        self.scale_0.push(splat.scale.x);
        self.scale_1.push(splat.scale.y);
        self.scale_2.push(splat.scale.z);
        self.rot_0.push(splat.rotation.w);
        self.rot_1.push(splat.rotation.x);
        self.rot_2.push(splat.rotation.y);
        self.rot_3.push(splat.rotation.z);
        self.r.push(splat.color[0]);
        self.g.push(splat.color[1]);
        self.b.push(splat.color[2]);
        self.opacity.push(splat.color[3]);
    }

    /// Panics if `index` is out of range or the list fails [`Self::validate`].
    pub fn get(&self, index: usize) -> SplatRecord {
        SplatRecord {
            center: Vec3::new(self.x[index], self.y[index], self.z[index]),
            scale: Vec3::new(self.scale_0[index], self.scale_1[index], self.scale_2[index]),
            rotation: Quat::from_xyzw(
                self.rot_1[index],
                self.rot_2[index],
                self.rot_3[index],
                self.rot_0[index],
            ),
            color: [self.r[index], self.g[index], self.b[index], self.opacity[index]],
        }
    }

    pub fn center(&self, index: usize) -> Vec3 {
        Vec3::new(self.x[index], self.y[index], self.z[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = SplatRecord> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Ensures every attribute array has the same length.
    pub fn validate(&self) -> Result<(), SplatError> {
        let expected = self.x.len();
        let columns: [(&str, usize); 14] = [
            ("x", self.x.len()),
            ("y", self.y.len()),
            ("z", self.z.len()),
            ("scale_0", self.scale_0.len()),
            ("scale_1", self.scale_1.len()),
            ("scale_2", self.scale_2.len()),
            ("rot_0", self.rot_0.len()),
            ("rot_1", self.rot_1.len()),
            ("rot_2", self.rot_2.len()),
            ("rot_3", self.rot_3.len()),
            ("r", self.r.len()),
            ("g", self.g.len()),
            ("b", self.b.len()),
            ("opacity", self.opacity.len()),
        ];
        for (name, len) in columns {
            if len != expected {
                return Err(SplatError::MismatchedArrays(format!(
                    "'{}' has {} entries, expected {}",
                    name, len, expected
                )));
            }
        }
        Ok(())
    }
}

impl FromIterator<SplatRecord> for UncompressedSplatList {
    fn from_iter<T: IntoIterator<Item = SplatRecord>>(iter: T) -> Self {
        let mut list = Self::new();
        for splat in iter {
            list.push(splat);
        }
        list
    }
}
