//! `IN_FORMATS` blob handling
//!
//! The kernel describes the format/modifier combinations a plane accepts with a
//! `drm_format_modifier_blob`: a header followed by an array of fourcc codes and an
//! array of modifiers. Each modifier carries a 64 bit mask selecting the formats it
//! applies to, relative to its `offset` into the format array.

use drm_fourcc::DrmModifier;

use crate::backend::drm::error::Error;

const HEADER_SIZE: usize = 24;
const MODIFIER_SIZE: usize = 24;
const FORMAT_BLOB_VERSION: u32 = 1;

/// A modifier together with the formats it is valid for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatModifier {
    /// Bitmask of format indices, relative to `offset`
    pub formats: u64,
    /// Index of the first format covered by `formats`
    pub offset: u32,
    /// The modifier
    pub modifier: DrmModifier,
}

impl FormatModifier {
    /// Returns true if the format at `index` of the format array is covered
    #[inline]
    pub fn covers(&self, index: usize) -> bool {
        let Some(bit) = index.checked_sub(self.offset as usize) else {
            return false;
        };
        bit < 64 && self.formats & (1 << bit) != 0
    }
}

/// Decoded `IN_FORMATS` property blob
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatBlob {
    /// Fourcc codes in kernel order
    pub formats: Vec<u32>,
    /// Modifiers and their format masks
    pub modifiers: Vec<FormatModifier>,
}

#[inline]
fn read_u32(data: &[u8], offset: usize) -> Result<u32, Error> {
    data.get(offset..offset + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_ne_bytes)
        .ok_or(Error::InvalidBlob("truncated IN_FORMATS blob"))
}

#[inline]
fn read_u64(data: &[u8], offset: usize) -> Result<u64, Error> {
    data.get(offset..offset + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_ne_bytes)
        .ok_or(Error::InvalidBlob("truncated IN_FORMATS blob"))
}

impl FormatBlob {
    /// Parse the raw blob as returned by the kernel
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidBlob("IN_FORMATS blob shorter than its header"));
        }

        let count_formats = read_u32(data, 8)? as usize;
        let formats_offset = read_u32(data, 12)? as usize;
        let count_modifiers = read_u32(data, 16)? as usize;
        let modifiers_offset = read_u32(data, 20)? as usize;

        let formats = (0..count_formats)
            .map(|i| read_u32(data, formats_offset + i * 4))
            .collect::<Result<Vec<_>, _>>()?;

        let modifiers = (0..count_modifiers)
            .map(|i| {
                let base = modifiers_offset + i * MODIFIER_SIZE;
                Ok(FormatModifier {
                    formats: read_u64(data, base)?,
                    offset: read_u32(data, base + 8)?,
                    // 4 bytes padding
                    modifier: DrmModifier::from(read_u64(data, base + 16)?),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(FormatBlob { formats, modifiers })
    }

    /// Serialize into the kernel layout
    pub fn encode(&self) -> Vec<u8> {
        let formats_offset = HEADER_SIZE;
        let modifiers_offset = formats_offset + self.formats.len() * 4;
        // modifiers are 8 byte aligned
        let modifiers_offset = (modifiers_offset + 7) & !7;

        let mut data = Vec::with_capacity(modifiers_offset + self.modifiers.len() * MODIFIER_SIZE);
        for value in [
            FORMAT_BLOB_VERSION,
            0,
            self.formats.len() as u32,
            formats_offset as u32,
            self.modifiers.len() as u32,
            modifiers_offset as u32,
        ] {
            data.extend_from_slice(&value.to_ne_bytes());
        }
        for format in &self.formats {
            data.extend_from_slice(&format.to_ne_bytes());
        }
        data.resize(modifiers_offset, 0);
        for modifier in &self.modifiers {
            data.extend_from_slice(&modifier.formats.to_ne_bytes());
            data.extend_from_slice(&modifier.offset.to_ne_bytes());
            data.extend_from_slice(&0u32.to_ne_bytes());
            data.extend_from_slice(&u64::from(modifier.modifier).to_ne_bytes());
        }
        data
    }
}
