//! Color management blobs
//!
//! Encoders for the `drm_color_ctm` and `drm_color_lut` kernel structures
//! and the linear resampling used to fit a tone curve to a crtc's lut size.

use crate::backend::drm::error::Error;

/// One entry of a gamma or degamma curve
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LutEntry {
    /// Red channel
    pub r: u16,
    /// Green channel
    pub g: u16,
    /// Blue channel
    pub b: u16,
}

impl LutEntry {
    /// Create a new entry
    pub const fn new(r: u16, g: u16, b: u16) -> Self {
        LutEntry { r, g, b }
    }
}

/// Number of coefficients of a color transformation matrix
pub const CTM_ENTRIES: usize = 9;

/// Encode a row-major 3x3 matrix as `drm_color_ctm`
///
/// Every coefficient is stored as sign-magnitude S31.32 fixed point.
pub fn ctm_blob(matrix: &[f32]) -> Result<Vec<u8>, Error> {
    if matrix.len() != CTM_ENTRIES {
        return Err(Error::InvalidColorMatrix(matrix.len()));
    }

    let mut blob = Vec::with_capacity(CTM_ENTRIES * std::mem::size_of::<u64>());
    for value in matrix {
        blob.extend_from_slice(&ctm_fixed(*value).to_ne_bytes());
    }
    Ok(blob)
}

#[inline]
fn ctm_fixed(value: f32) -> u64 {
    const SCALE: f64 = (1u64 << 32) as f64;
    let value = value as f64;
    if value < 0.0 {
        ((-value * SCALE) as u64) | (1 << 63)
    } else {
        (value * SCALE) as u64
    }
}

/// Encode a curve as an array of `drm_color_lut`
///
/// Returns `None` for an empty curve, which resets the property.
pub fn lut_blob(lut: &[LutEntry]) -> Option<Vec<u8>> {
    if lut.is_empty() {
        return None;
    }

    let mut blob = Vec::with_capacity(lut.len() * 4 * std::mem::size_of::<u16>());
    for entry in lut {
        blob.extend_from_slice(&entry.r.to_ne_bytes());
        blob.extend_from_slice(&entry.g.to_ne_bytes());
        blob.extend_from_slice(&entry.b.to_ne_bytes());
        // reserved
        blob.extend_from_slice(&0u16.to_ne_bytes());
    }
    Some(blob)
}

/// Resample a curve to `size` entries by linear interpolation
#[profiling::function]
pub fn resample_lut(lut: &[LutEntry], size: usize) -> Vec<LutEntry> {
    if lut.is_empty() {
        return Vec::new();
    }
    if lut.len() == size {
        return lut.to_vec();
    }

    let len = lut.len();
    (0..size)
        .map(|i| {
            let base = len * i / size;
            let remaining = (len * i % size) as i64;
            if base < len - 1 {
                let lerp = |a: u16, b: u16| {
                    let (a, b) = (a as i64, b as i64);
                    (a + (b - a) * remaining / size as i64) as u16
                };
                let (low, high) = (lut[base], lut[base + 1]);
                LutEntry {
                    r: lerp(low.r, high.r),
                    g: lerp(low.g, high.g),
                    b: lerp(low.b, high.b),
                }
            } else {
                lut[len - 1]
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctm_values(blob: &[u8]) -> Vec<u64> {
        blob.chunks_exact(8)
            .map(|chunk| u64::from_ne_bytes(chunk.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn ctm_identity() {
        let identity = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let values = ctm_values(&ctm_blob(&identity).unwrap());
        assert_eq!(values.len(), 9);
        assert_eq!(values[0], 1 << 32);
        assert_eq!(values[1], 0);
        assert_eq!(values[4], 1 << 32);
    }

    #[test]
    fn ctm_negative_is_sign_magnitude() {
        let matrix = [-0.5, 0.25, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let values = ctm_values(&ctm_blob(&matrix).unwrap());
        assert_eq!(values[0], (1 << 63) | (1 << 31));
        assert_eq!(values[1], 1 << 30);
    }

    #[test]
    fn ctm_wrong_size() {
        assert!(matches!(ctm_blob(&[]), Err(Error::InvalidColorMatrix(0))));
        assert!(matches!(ctm_blob(&[1.0; 4]), Err(Error::InvalidColorMatrix(4))));
    }

    #[test]
    fn lut_layout() {
        assert!(lut_blob(&[]).is_none());
        let blob = lut_blob(&[LutEntry::new(1, 2, 3), LutEntry::new(4, 5, 6)]).unwrap();
        assert_eq!(blob.len(), 16);
        let words: Vec<u16> = blob
            .chunks_exact(2)
            .map(|chunk| u16::from_ne_bytes([chunk[0], chunk[1]]))
            .collect();
        assert_eq!(words, vec![1, 2, 3, 0, 4, 5, 6, 0]);
    }

    #[test]
    fn resample_identity_and_empty() {
        let lut = vec![LutEntry::new(0, 0, 0), LutEntry::new(100, 100, 100)];
        assert_eq!(resample_lut(&lut, 2), lut);
        assert!(resample_lut(&[], 16).is_empty());
    }

    #[test]
    fn resample_upscale_interpolates() {
        let lut = vec![LutEntry::new(0, 0, 0), LutEntry::new(100, 200, 300)];
        let resampled = resample_lut(&lut, 4);
        assert_eq!(
            resampled,
            vec![
                LutEntry::new(0, 0, 0),
                LutEntry::new(50, 100, 150),
                LutEntry::new(100, 200, 300),
                LutEntry::new(100, 200, 300),
            ]
        );
    }

    #[test]
    fn resample_decreasing_curve() {
        let lut = vec![LutEntry::new(100, 100, 100), LutEntry::new(0, 0, 0)];
        let resampled = resample_lut(&lut, 4);
        assert_eq!(resampled[1], LutEntry::new(50, 50, 50));
    }
}
