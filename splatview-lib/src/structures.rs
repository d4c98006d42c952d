use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::common::{normalize_quat, quantize_unit, unquantize_unit};

/// Size in bytes of one native splat record.
pub const RECORD_SIZE: usize = 32;
/// First four bytes of an ASCII PLY header.
pub const PLY_MAGIC: [u8; 4] = *b"ply\n";

/// One splat as it travels over the wire.
///
/// Layout: `position` (12) | `scale` (12) | `rgba` (4) | `rotation` (4), little endian.
/// `rotation` is the unit quaternion `(w, x, y, z)` with each component stored as
/// `q * 128 + 128`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SplatRecord {
    pub position: [f32; 3],
    pub scale: [f32; 3],
    pub rgba: [u8; 4],
    pub rotation: [u8; 4],
}

const _: () = assert!(size_of::<SplatRecord>() == RECORD_SIZE);

impl SplatRecord {
    pub fn new(position: [f32; 3], scale: [f32; 3], rgba: [u8; 4], quat_wxyz: [f32; 4]) -> Self {
        let q = normalize_quat((quat_wxyz[0], quat_wxyz[1], quat_wxyz[2], quat_wxyz[3]));
        Self {
            position,
            scale,
            rgba,
            rotation: [
                quantize_unit(q.0),
                quantize_unit(q.1),
                quantize_unit(q.2),
                quantize_unit(q.3),
            ],
        }
    }

    /// Reads record `index` out of a packed buffer. Returns `None` past the last complete record.
    #[inline]
    pub fn read(buffer: &[u8], index: usize) -> Option<Self> {
        let start = index.checked_mul(RECORD_SIZE)?;
        let bytes = buffer.get(start..start + RECORD_SIZE)?;
        Self::read_from_bytes(bytes).ok()
    }

    #[inline]
    pub fn quaternion(&self) -> [f32; 4] {
        self.rotation.map(unquantize_unit)
    }

    /// Upper triangle of `Σ = (S·R)ᵀ(S·R)`: `[σ00, σ01, σ02, σ11, σ12, σ22]`.
    pub fn covariance(&self) -> [f32; 6] {
        let [w, x, y, z] = self.quaternion();
        let s = self.scale;

        #[rustfmt::skip]
        let r = [
            1.0 - 2.0 * (y * y + z * z), 2.0 * (x * y + w * z),       2.0 * (x * z - w * y),
            2.0 * (x * y - w * z),       1.0 - 2.0 * (x * x + z * z), 2.0 * (y * z + w * x),
            2.0 * (x * z + w * y),       2.0 * (y * z - w * x),       1.0 - 2.0 * (x * x + y * y),
        ];
        let m: [f32; 9] = std::array::from_fn(|i| r[i] * s[i / 3]);

        [
            m[0] * m[0] + m[3] * m[3] + m[6] * m[6],
            m[0] * m[1] + m[3] * m[4] + m[6] * m[7],
            m[0] * m[2] + m[3] * m[5] + m[6] * m[8],
            m[1] * m[1] + m[4] * m[4] + m[7] * m[7],
            m[1] * m[2] + m[4] * m[5] + m[7] * m[8],
            m[2] * m[2] + m[5] * m[5] + m[8] * m[8],
        ]
    }
}

/// Number of complete records held by `len` bytes.
#[inline]
pub const fn complete_records(len: usize) -> usize {
    len / RECORD_SIZE
}

/// Resolved once per stream from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplatFormat {
    Native,
    Ply,
}

impl SplatFormat {
    /// Needs at least four bytes to decide; shorter prefixes yield `None`.
    pub fn detect(prefix: &[u8]) -> Option<Self> {
        if prefix.len() < PLY_MAGIC.len() {
            return None;
        }
        if prefix[..4] == PLY_MAGIC {
            Some(SplatFormat::Ply)
        } else {
            Some(SplatFormat::Native)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_offsets() {
        let rec = SplatRecord {
            position: [1.0, 2.0, 3.0],
            scale: [0.1, 0.2, 0.3],
            rgba: [10, 20, 30, 40],
            rotation: [255, 128, 128, 128],
        };
        let bytes = rec.as_bytes();
        assert_eq!(bytes.len(), RECORD_SIZE);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[12..16], &0.1f32.to_le_bytes());
        assert_eq!(&bytes[24..28], &[10, 20, 30, 40]);
        assert_eq!(&bytes[28..32], &[255, 128, 128, 128]);
        assert_eq!(SplatRecord::read(bytes, 0), Some(rec));
        assert_eq!(SplatRecord::read(bytes, 1), None);
    }

    #[test]
    fn identity_rotation_gives_diagonal_covariance() {
        let rec = SplatRecord::new([0.0; 3], [1.0, 2.0, 3.0], [0; 4], [1.0, 0.0, 0.0, 0.0]);
        let cov = rec.covariance();
        assert!((cov[0] - 1.0).abs() < 1e-5);
        assert!((cov[3] - 4.0).abs() < 1e-5);
        assert!((cov[5] - 9.0).abs() < 1e-5);
        assert!(cov[1].abs() < 1e-3 && cov[2].abs() < 1e-3 && cov[4].abs() < 1e-3);
    }

    #[test]
    fn format_detection() {
        assert_eq!(SplatFormat::detect(b"ply\nformat"), Some(SplatFormat::Ply));
        assert_eq!(SplatFormat::detect(&[0u8; 32]), Some(SplatFormat::Native));
        assert_eq!(SplatFormat::detect(b"pl"), None);
    }
}
