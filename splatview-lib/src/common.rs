use half::f16;

/// Spherical-harmonics band-0 constant used to turn `f_dc_*` into colour.
pub const SH_C0: f32 = 0.282_094_8;

#[inline]
pub(crate) fn clamp_u8(x: f32) -> u8 {
    x.round().clamp(0.0, 255.0) as u8
}

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Same bit layout as GLSL `packHalf2x16`: `a` in the low half, `b` in the high half.
#[inline]
pub fn pack_half_2x16(a: f32, b: f32) -> u32 {
    let lo = f16::from_f32(a).to_bits() as u32;
    let hi = f16::from_f32(b).to_bits() as u32;
    lo | (hi << 16)
}

#[inline]
pub fn unpack_half_2x16(packed: u32) -> (f32, f32) {
    let lo = f16::from_bits((packed & 0xFFFF) as u16).to_f32();
    let hi = f16::from_bits((packed >> 16) as u16).to_f32();
    (lo, hi)
}

#[inline]
pub(crate) fn quantize_unit(x: f32) -> u8 {
    clamp_u8(x * 128.0 + 128.0)
}

#[inline]
pub(crate) fn unquantize_unit(x: u8) -> f32 {
    (x as f32 - 128.0) / 128.0
}

#[inline]
pub(crate) fn normalize_quat(q: (f32, f32, f32, f32)) -> (f32, f32, f32, f32) {
    let norm = (q.0 * q.0 + q.1 * q.1 + q.2 * q.2 + q.3 * q.3).sqrt();
    if norm == 0.0 {
        return (1.0, 0.0, 0.0, 0.0);
    }
    (q.0 / norm, q.1 / norm, q.2 / norm, q.3 / norm)
}

#[inline]
pub(crate) fn round_to_hundredths(x: f32) -> f64 {
    (x as f64 * 100.0).round() / 100.0
}

/// Decodes `%XX` escapes the way `decodeURIComponent` does for ASCII payloads.
pub(crate) fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
