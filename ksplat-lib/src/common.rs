use half::f16;

pub const ZSTD_MAX_COMPRESSION_LVL: u32 = 22;

/// Degree-0 spherical harmonics basis constant.
pub const SH_C0: f32 = 0.282_094_8;

/// Scale components at or below this are treated as a degenerate splat.
pub const DEGENERATE_SCALE_EPSILON: f32 = 1e-7;

#[inline]
pub(crate) fn clamp_u8(x: f32) -> u8 {
    x.round().clamp(0.0, 255.0) as u8
}

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub(crate) fn float_to_half(x: f32) -> u16 {
    f16::from_f32(x).to_bits()
}

#[inline]
pub(crate) fn half_to_float(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

/// Normalizes a `w, x, y, z` quaternion. A zero quaternion becomes identity.
#[inline]
pub(crate) fn normalize_quat(q: [f32; 4]) -> [f32; 4] {
    let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
    if norm <= f32::EPSILON || !norm.is_finite() {
        return [1.0, 0.0, 0.0, 0.0];
    }
    [q[0] / norm, q[1] / norm, q[2] / norm, q[3] / norm]
}

#[inline]
pub(crate) fn is_degenerate_scale(scale: [f32; 3]) -> bool {
    scale.iter().any(|&s| s <= DEGENERATE_SCALE_EPSILON)
}
