use crate::common::{pack_half_2x16, unpack_half_2x16};
use crate::structures::{complete_records, SplatRecord};

/// Texels per row. Each splat occupies two neighbouring texels, so a row holds 1024 splats.
pub const TEXTURE_WIDTH: u32 = 2048;
pub const TEXELS_PER_SPLAT: u32 = 2;

/// `RGBA32UI` payload: texel `2i` is `[x, y, z, rgba]` (floats as raw bits, colour packed
/// little-endian), texel `2i + 1` is `[half(σ00, σ01), half(σ02, σ11), half(σ12, σ22), 0]`.
/// Covariance is scaled by 4 before packing, matching the vertex shader's expectations.
#[derive(Debug, Clone, PartialEq)]
pub struct SplatTexture {
    pub width: u32,
    pub height: u32,
    pub splat_count: usize,
    pub data: Vec<u32>,
}

/// What the GPU sees for one splat, unpacked again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackedSplat {
    pub position: [f32; 3],
    pub rgba: [u8; 4],
    pub covariance: [f32; 6],
}

#[inline]
pub fn texture_height(splat_count: usize) -> u32 {
    let texels = splat_count as u64 * TEXELS_PER_SPLAT as u64;
    texels.div_ceil(TEXTURE_WIDTH as u64).max(1) as u32
}

impl SplatTexture {
    /// Packs the first `record_count` complete records of `buffer`.
    pub fn pack(buffer: &[u8], record_count: usize) -> Self {
        let n = record_count.min(complete_records(buffer.len()));
        let width = TEXTURE_WIDTH;
        let height = texture_height(n);
        let mut data = vec![0u32; width as usize * height as usize * 4];

        for (i, texels) in data.chunks_exact_mut(8).take(n).enumerate() {
            let Some(rec) = SplatRecord::read(buffer, i) else {
                break;
            };
            let sigma = rec.covariance();

            texels[0] = rec.position[0].to_bits();
            texels[1] = rec.position[1].to_bits();
            texels[2] = rec.position[2].to_bits();
            texels[3] = u32::from_le_bytes(rec.rgba);

            texels[4] = pack_half_2x16(4.0 * sigma[0], 4.0 * sigma[1]);
            texels[5] = pack_half_2x16(4.0 * sigma[2], 4.0 * sigma[3]);
            texels[6] = pack_half_2x16(4.0 * sigma[4], 4.0 * sigma[5]);
            texels[7] = 0;
        }

        SplatTexture {
            width,
            height,
            splat_count: n,
            data,
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    /// Unpacks splat `index`; the covariance comes back unscaled.
    pub fn decode(&self, index: usize) -> Option<PackedSplat> {
        if index >= self.splat_count {
            return None;
        }
        let t = &self.data[index * 8..index * 8 + 8];
        let (c0, c1) = unpack_half_2x16(t[4]);
        let (c2, c3) = unpack_half_2x16(t[5]);
        let (c4, c5) = unpack_half_2x16(t[6]);

        Some(PackedSplat {
            position: [f32::from_bits(t[0]), f32::from_bits(t[1]), f32::from_bits(t[2])],
            rgba: t[3].to_le_bytes(),
            covariance: [c0, c1, c2, c3, c4, c5].map(|c| c / 4.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn buffer(n: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..n {
            let f = i as f32;
            let rec = SplatRecord::new(
                [f * 0.5 - 3.0, f.sin() * 10.0, 1e-3 * f],
                [0.05 + f * 0.01, 0.02, 0.3],
                [i as u8, (i * 7) as u8, 255 - i as u8, (i * 3) as u8],
                [1.0, 0.1 * f, -0.2, 0.05],
            );
            out.extend_from_slice(rec.as_bytes());
        }
        out
    }

    #[test]
    fn decode_reconstructs_position_and_colour() {
        let n = 1500;
        let buf = buffer(n);
        let tex = SplatTexture::pack(&buf, n);
        assert_eq!(tex.width, TEXTURE_WIDTH);
        assert_eq!(tex.height, 2);
        assert_eq!(tex.data.len(), (tex.width * tex.height * 4) as usize);

        for i in 0..n {
            let rec = SplatRecord::read(&buf, i).unwrap();
            let packed = tex.decode(i).unwrap();
            assert_eq!(packed.position, rec.position);
            assert_eq!(packed.rgba, rec.rgba);

            for (got, want) in packed.covariance.iter().zip(rec.covariance()) {
                let tol = want.abs() * 2e-3 + 1e-4;
                assert!((got - want).abs() <= tol, "splat {}: {} vs {}", i, got, want);
            }
        }
        assert!(tex.decode(n).is_none());
    }

    #[test]
    fn packing_clamps_to_complete_records() {
        let mut buf = buffer(4);
        buf.extend_from_slice(&[0xAB; 17]);
        let tex = SplatTexture::pack(&buf, 5);
        assert_eq!(tex.splat_count, 4);
        assert_eq!(tex.height, 1);
    }

    #[test]
    fn empty_input_still_has_one_row() {
        let tex = SplatTexture::pack(&[], 0);
        assert_eq!(tex.height, 1);
        assert_eq!(tex.splat_count, 0);
        assert_eq!(tex.as_bytes().len(), TEXTURE_WIDTH as usize * 16);
    }
}
