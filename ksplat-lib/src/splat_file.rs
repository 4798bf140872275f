//! The legacy raw `.splat` layout: fixed 32-byte rows of
//! `3×f32 position, 3×f32 scale, 4×u8 rgba, 4×u8 quaternion (w, x, y, z)`.

use crate::buffer::SplatBuffer;
use crate::common::{clamp_u8, normalize_quat};
use crate::error::SplatError;
use crate::structures::UncompressedSplatList;

pub const ROW_SIZE_BYTES: usize = 32;

#[inline(always)]
fn read_f32(row: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([row[at], row[at + 1], row[at + 2], row[at + 3]])
}

#[inline]
fn decode_rotation_byte(b: u8) -> f32 {
    (b as f32 - 128.0) / 128.0
}

#[inline]
fn encode_rotation_component(v: f32) -> u8 {
    clamp_u8(v * 128.0 + 128.0)
}

pub fn parse_splat_file(raw_data: &[u8]) -> Result<UncompressedSplatList, SplatError> {
    if raw_data.len() % ROW_SIZE_BYTES != 0 {
        return Err(SplatError::ParseSplatFile(format!(
            "Length {} is not a multiple of the {}-byte row size",
            raw_data.len(),
            ROW_SIZE_BYTES
        )));
    }

    let count = raw_data.len() / ROW_SIZE_BYTES;
    let mut list = UncompressedSplatList::with_capacity(count);
    for row in raw_data.chunks_exact(ROW_SIZE_BYTES) {
        list.x.push(read_f32(row, 0));
        list.y.push(read_f32(row, 4));
        list.z.push(read_f32(row, 8));
        list.scale_0.push(read_f32(row, 12));
        list.scale_1.push(read_f32(row, 16));
        list.scale_2.push(read_f32(row, 20));
        list.r.push(row[24]);
        list.g.push(row[25]);
        list.b.push(row[26]);
        list.opacity.push(row[27]);

        let q = normalize_quat([
            decode_rotation_byte(row[28]),
            decode_rotation_byte(row[29]),
            decode_rotation_byte(row[30]),
            decode_rotation_byte(row[31]),
        ]);
        list.rot_0.push(q[0]);
        list.rot_1.push(q[1]);
        list.rot_2.push(q[2]);
        list.rot_3.push(q[3]);
    }
    Ok(list)
}

/// Writes every real splat of `buffer` as `.splat` rows, skipping bucket
/// padding and the invalid splat.
pub fn write_splat_file(buffer: &SplatBuffer, output: &mut Vec<u8>) -> Result<usize, SplatError> {
    output.clear();
    output.reserve(buffer.splat_count() * ROW_SIZE_BYTES);

    let mut written = 0;
    for i in 0..buffer.splat_count() {
        if buffer.is_padding(i)? {
            continue;
        }
        let color = buffer.splat_color(i)?;
        let center = buffer.splat_center(i)?;
        let (scale, rotation) = buffer.splat_scale_and_rotation(i)?;
        let rotation = rotation.normalize();

        output.extend_from_slice(bytemuck::cast_slice(&center.to_array()));
        output.extend_from_slice(bytemuck::cast_slice(&scale.to_array()));
        output.extend_from_slice(&color);
        output.extend_from_slice(&[
            encode_rotation_component(rotation.w),
            encode_rotation_component(rotation.x),
            encode_rotation_component(rotation.y),
            encode_rotation_component(rotation.z),
        ]);
        written += 1;
    }
    Ok(written)
}
