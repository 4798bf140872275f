use std::ops::Range;

use glam::{Mat3, Mat4, Quat, Vec3};
use zerocopy::byteorder::little_endian::{F32, U16, U32};
use zerocopy::FromBytes;

use crate::common::half_to_float;
use crate::error::{check_index, SplatError};
use crate::structures::{
    compression_level, CompressionLevel, RawSplatBufferHeader, SplatBufferHeader,
    HEADER_SIZE_BYTES, INVALID_SPLAT_COLOR, VERSION_MAJOR,
};

/// Zero-copy view of a float attribute that is stored either as `f32` or `f16`.
#[derive(Debug, Clone, Copy)]
pub enum FloatView<'a> {
    Full(&'a [F32]),
    Half(&'a [U16]),
}

impl FloatView<'_> {
    #[inline]
    fn get(&self, i: usize) -> f32 {
        match self {
            FloatView::Full(v) => v[i].get(),
            FloatView::Half(v) => half_to_float(v[i].get()),
        }
    }
}

/// Zero-copy view of the center array.
#[derive(Debug, Clone, Copy)]
pub enum CenterView<'a> {
    Full(&'a [F32]),
    Quantized(&'a [U16]),
}

#[derive(Debug, Clone)]
struct Sections {
    centers: Range<usize>,
    scales: Range<usize>,
    colors: Range<usize>,
    rotations: Range<usize>,
    buckets: Range<usize>,
    fill_ranges: Range<usize>,
}

/// A compressed scene: the 1024-byte header followed by the center, scale,
/// color and rotation arrays, the bucket table at compression level 1 and an
/// optional per-bucket fill table.
#[derive(Debug, Clone)]
pub struct SplatBuffer {
    data: Vec<u8>,
    header: SplatBufferHeader,
    layout: &'static CompressionLevel,
    sections: Sections,
}

impl SplatBuffer {
    /// Takes ownership of an encoded buffer after validating its header and
    /// payload length.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, SplatError> {
        if data.len() < HEADER_SIZE_BYTES {
            return Err(SplatError::InvalidHeader(format!(
                "Buffer is {} bytes, the header alone needs {}",
                data.len(),
                HEADER_SIZE_BYTES
            )));
        }
        let (raw, _) = RawSplatBufferHeader::ref_from_prefix(&data)
            .map_err(|_| SplatError::InvalidHeader("Header does not fit the buffer".to_string()))?;
        let header = SplatBufferHeader::from_raw(raw)?;
        if header.version_major != VERSION_MAJOR {
            return Err(SplatError::InvalidHeader(format!(
                "Unsupported version {}.{}",
                header.version_major, header.version_minor
            )));
        }
        let layout = compression_level(header.compression_level)?;
        let count = header.splat_count as usize;

        if header.compression_level > 0 {
            if header.bucket_size == 0 {
                return Err(SplatError::InvalidHeader("Bucket size is zero".to_string()));
            }
            if !(header.bucket_block_size.is_finite() && header.bucket_block_size > 0.0) {
                return Err(SplatError::InvalidHeader(format!(
                    "Invalid bucket block size {}",
                    header.bucket_block_size
                )));
            }
            let covered = (header.bucket_count as u64) * (header.bucket_size as u64);
            if covered < count as u64 {
                return Err(SplatError::InvalidHeader(format!(
                    "{} buckets of {} cannot hold {} splats",
                    header.bucket_count, header.bucket_size, count
                )));
            }
        }

        let section = |start: usize, width: usize| -> Result<Range<usize>, SplatError> {
            let len = count
                .checked_mul(width)
                .ok_or_else(|| SplatError::InvalidHeader("Splat count overflows".to_string()))?;
            Ok(start..start + len)
        };
        let centers = section(HEADER_SIZE_BYTES, layout.bytes_per_center)?;
        let scales = section(centers.end, layout.bytes_per_scale)?;
        let colors = section(scales.end, layout.bytes_per_color)?;
        let rotations = section(colors.end, layout.bytes_per_rotation)?;
        let bucket_bytes = if header.compression_level > 0 {
            header.bucket_count as usize * 12
        } else {
            0
        };
        let buckets = rotations.end..rotations.end + bucket_bytes;

        let fill_bytes = header.fill_range_bytes as usize;
        if fill_bytes > 0 {
            let covered = (header.bucket_count as u64) * (header.bucket_size as u64);
            if fill_bytes as u64 != header.bucket_count as u64 * 8 || covered < count as u64 {
                return Err(SplatError::InvalidHeader(format!(
                    "Fill table of {} bytes does not match {} buckets of {}",
                    fill_bytes, header.bucket_count, header.bucket_size
                )));
            }
        }
        let fill_ranges = buckets.end..buckets.end + fill_bytes;

        if data.len() < fill_ranges.end {
            return Err(SplatError::InvalidHeader(format!(
                "Payload is too short, need {} bytes, have {}",
                fill_ranges.end,
                data.len()
            )));
        }

        Ok(Self {
            data,
            header,
            layout,
            sections: Sections {
                centers,
                scales,
                colors,
                rotations,
                buckets,
                fill_ranges,
            },
        })
    }

    pub fn header(&self) -> &SplatBufferHeader {
        &self.header
    }

    pub fn compression_level(&self) -> u8 {
        self.header.compression_level
    }

    pub fn bytes_per_splat(&self) -> usize {
        self.layout.bytes_per_splat()
    }

    /// Bucket-padded splat count.
    pub fn splat_count(&self) -> usize {
        self.header.splat_count as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn bytes(&self, range: &Range<usize>) -> &[u8] {
        &self.data[range.clone()]
    }

    fn float_view(&self, range: &Range<usize>) -> Result<FloatView<'_>, SplatError> {
        let bytes = self.bytes(range);
        if self.header.compression_level == 0 {
            <[F32]>::ref_from_bytes(bytes)
                .map(FloatView::Full)
                .map_err(|_| SplatError::InvalidHeader("f32 view has a partial element".to_string()))
        } else {
            <[U16]>::ref_from_bytes(bytes)
                .map(FloatView::Half)
                .map_err(|_| SplatError::InvalidHeader("f16 view has a partial element".to_string()))
        }
    }

    pub fn center_view(&self) -> Result<CenterView<'_>, SplatError> {
        let bytes = self.bytes(&self.sections.centers);
        if self.header.compression_level == 0 {
            <[F32]>::ref_from_bytes(bytes)
                .map(CenterView::Full)
                .map_err(|_| SplatError::InvalidHeader("center view has a partial element".to_string()))
        } else {
            <[U16]>::ref_from_bytes(bytes)
                .map(CenterView::Quantized)
                .map_err(|_| SplatError::InvalidHeader("center view has a partial element".to_string()))
        }
    }

    pub fn scale_view(&self) -> Result<FloatView<'_>, SplatError> {
        self.float_view(&self.sections.scales)
    }

    pub fn rotation_view(&self) -> Result<FloatView<'_>, SplatError> {
        self.float_view(&self.sections.rotations)
    }

    pub fn color_view(&self) -> &[u8] {
        self.bytes(&self.sections.colors)
    }

    fn bucket_view(&self) -> Result<&[F32], SplatError> {
        <[F32]>::ref_from_bytes(self.bytes(&self.sections.buckets))
            .map_err(|_| SplatError::InvalidHeader("bucket view has a partial element".to_string()))
    }

    pub fn bucket_count(&self) -> usize {
        self.header.bucket_count as usize
    }

    pub fn bucket_center(&self, bucket: usize) -> Result<Vec3, SplatError> {
        let table = self.bucket_view()?;
        check_index("bucket", bucket, table.len() / 3)?;
        Ok(Vec3::new(
            table[bucket * 3].get(),
            table[bucket * 3 + 1].get(),
            table[bucket * 3 + 2].get(),
        ))
    }

    #[inline]
    fn decode_center(&self, centers: &CenterView<'_>, buckets: &[F32], i: usize) -> Vec3 {
        match centers {
            CenterView::Full(v) => Vec3::new(v[i * 3].get(), v[i * 3 + 1].get(), v[i * 3 + 2].get()),
            CenterView::Quantized(v) => {
                let range = self.header.compression_scale_range as f32;
                let factor = self.header.half_bucket_block_size() / range;
                let bucket = i / self.header.bucket_size as usize;
                let mut out = [0.0f32; 3];
                for (axis, o) in out.iter_mut().enumerate() {
                    let stored = v[i * 3 + axis].get() as f32;
                    *o = (stored - range) * factor + buckets[bucket * 3 + axis].get();
                }
                Vec3::from_array(out)
            }
        }
    }

    #[inline]
    fn decode_scale_rotation(scales: &FloatView<'_>, rotations: &FloatView<'_>, i: usize) -> (Vec3, Quat) {
        let scale = Vec3::new(scales.get(i * 3), scales.get(i * 3 + 1), scales.get(i * 3 + 2));
        // Stored as w, x, y, z.
        let rotation = Quat::from_xyzw(
            rotations.get(i * 4 + 1),
            rotations.get(i * 4 + 2),
            rotations.get(i * 4 + 3),
            rotations.get(i * 4),
        );
        (scale, rotation)
    }

    pub fn splat_center(&self, index: usize) -> Result<Vec3, SplatError> {
        check_index("splat", index, self.splat_count())?;
        let centers = self.center_view()?;
        let buckets = self.bucket_view()?;
        Ok(self.decode_center(&centers, buckets, index))
    }

    pub fn splat_scale_and_rotation(&self, index: usize) -> Result<(Vec3, Quat), SplatError> {
        check_index("splat", index, self.splat_count())?;
        let scales = self.scale_view()?;
        let rotations = self.rotation_view()?;
        Ok(Self::decode_scale_rotation(&scales, &rotations, index))
    }

    pub fn splat_color(&self, index: usize) -> Result<[u8; 4], SplatError> {
        check_index("splat", index, self.splat_count())?;
        let c = &self.color_view()[index * 4..index * 4 + 4];
        Ok([c[0], c[1], c[2], c[3]])
    }

    /// Whether slot `index` is bucket padding or the invalid splat. Buffers
    /// without a fill table fall back to matching the sentinel color.
    pub fn is_padding(&self, index: usize) -> Result<bool, SplatError> {
        check_index("splat", index, self.splat_count())?;
        if self.sections.fill_ranges.is_empty() {
            return Ok(self.splat_color(index)? == INVALID_SPLAT_COLOR);
        }
        let table = <[U32]>::ref_from_bytes(self.bytes(&self.sections.fill_ranges))
            .map_err(|_| SplatError::InvalidHeader("fill table has a partial element".to_string()))?;
        let bucket_size = self.header.bucket_size as usize;
        let (bucket, slot) = (index / bucket_size, index % bucket_size);
        let start = table[bucket * 2].get() as usize;
        let end = table[bucket * 2 + 1].get() as usize;
        Ok(!(start..end).contains(&slot))
    }

    fn check_destination(&self, len: usize, offset: usize, stride: usize) -> Result<(), SplatError> {
        match offset
            .checked_add(self.splat_count())
            .and_then(|end| end.checked_mul(stride))
        {
            Some(needed) if needed <= len => Ok(()),
            Some(needed) => Err(SplatError::IndexOutOfRange {
                what: "destination element",
                index: needed - 1,
                len,
            }),
            None => Err(SplatError::IndexOutOfRange {
                what: "destination offset",
                index: offset,
                len,
            }),
        }
    }

    /// Writes `x, y, z` for every splat into `out` starting at splat slot
    /// `offset`, optionally transformed.
    pub fn fill_splat_center_array(
        &self,
        out: &mut [f32],
        offset: usize,
        transform: Option<&Mat4>,
    ) -> Result<(), SplatError> {
        self.check_destination(out.len(), offset, 3)?;
        let centers = self.center_view()?;
        let buckets = self.bucket_view()?;
        for i in 0..self.splat_count() {
            let mut center = self.decode_center(&centers, buckets, i);
            if let Some(t) = transform {
                center = t.transform_point3(center);
            }
            let dst = (offset + i) * 3;
            out[dst..dst + 3].copy_from_slice(&center.to_array());
        }
        Ok(())
    }

    /// Writes scales (`x, y, z`) and rotations (`w, x, y, z`). With a
    /// transform, its rotation is pre-multiplied and its scale applied.
    pub fn fill_splat_scale_rotation_array(
        &self,
        scales_out: &mut [f32],
        rotations_out: &mut [f32],
        offset: usize,
        transform: Option<&Mat4>,
    ) -> Result<(), SplatError> {
        self.check_destination(scales_out.len(), offset, 3)?;
        self.check_destination(rotations_out.len(), offset, 4)?;
        let scales = self.scale_view()?;
        let rotations = self.rotation_view()?;
        let parts = transform.map(|t| t.to_scale_rotation_translation());
        for i in 0..self.splat_count() {
            let (mut scale, mut rotation) = Self::decode_scale_rotation(&scales, &rotations, i);
            if let Some((t_scale, t_rotation, _)) = parts {
                scale *= t_scale;
                rotation = (t_rotation * rotation).normalize();
            }
            let s = (offset + i) * 3;
            scales_out[s..s + 3].copy_from_slice(&scale.to_array());
            let r = (offset + i) * 4;
            rotations_out[r..r + 4].copy_from_slice(&[rotation.w, rotation.x, rotation.y, rotation.z]);
        }
        Ok(())
    }

    /// Writes the upper triangle of each 3D covariance
    /// (`xx, xy, xz, yy, yz, zz`), six floats per splat.
    pub fn fill_splat_covariance_array(
        &self,
        out: &mut [f32],
        offset: usize,
        transform: Option<&Mat4>,
    ) -> Result<(), SplatError> {
        self.check_destination(out.len(), offset, 6)?;
        let scales = self.scale_view()?;
        let rotations = self.rotation_view()?;
        let basis = transform.map(|t| Mat3::from_mat4(*t));
        for i in 0..self.splat_count() {
            let (scale, rotation) = Self::decode_scale_rotation(&scales, &rotations, i);
            let mut m = Mat3::from_quat(rotation.normalize()) * Mat3::from_diagonal(scale);
            if let Some(b) = basis {
                m = b * m;
            }
            let cov = m * m.transpose();
            let dst = (offset + i) * 6;
            out[dst..dst + 6].copy_from_slice(&[
                cov.x_axis.x,
                cov.y_axis.x,
                cov.z_axis.x,
                cov.y_axis.y,
                cov.z_axis.y,
                cov.z_axis.z,
            ]);
        }
        Ok(())
    }

    /// Copies RGBA colors; alpha below `minimum_alpha` is zeroed.
    pub fn fill_splat_color_array(
        &self,
        out: &mut [u8],
        offset: usize,
        minimum_alpha: u8,
    ) -> Result<(), SplatError> {
        self.check_destination(out.len(), offset, 4)?;
        let colors = self.color_view();
        let dst = &mut out[offset * 4..(offset + self.splat_count()) * 4];
        dst.copy_from_slice(colors);
        for rgba in dst.chunks_exact_mut(4) {
            if rgba[3] < minimum_alpha {
                rgba[3] = 0;
            }
        }
        Ok(())
    }
}
