//! Static pixel-format tables shared by both backends.

#[cfg(feature = "kiln-serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Format {
    #[default]
    Unknown,

    R8Uint,
    R8Sint,
    R8Unorm,
    R8Snorm,
    Rg8Uint,
    Rg8Sint,
    Rg8Unorm,
    Rg8Snorm,
    R16Uint,
    R16Sint,
    R16Unorm,
    R16Snorm,
    R16Float,
    Bgra4Unorm,
    B5G6R5Unorm,
    B5G5R5A1Unorm,
    Rgba8Uint,
    Rgba8Sint,
    Rgba8Unorm,
    Rgba8Snorm,
    Bgra8Unorm,
    Srgba8Unorm,
    Sbgra8Unorm,
    R10G10B10A2Unorm,
    R11G11B10Float,
    Rg16Uint,
    Rg16Sint,
    Rg16Unorm,
    Rg16Snorm,
    Rg16Float,
    R32Uint,
    R32Sint,
    R32Float,
    Rgba16Uint,
    Rgba16Sint,
    Rgba16Unorm,
    Rgba16Snorm,
    Rgba16Float,
    Rg32Uint,
    Rg32Sint,
    Rg32Float,
    Rgb32Uint,
    Rgb32Sint,
    Rgb32Float,
    Rgba32Uint,
    Rgba32Sint,
    Rgba32Float,

    D16Unorm,
    D24UnormS8Uint,
    D32Float,
    D32FloatS8Uint,

    Bc1Unorm,
    Bc1UnormSrgb,
    Bc2Unorm,
    Bc2UnormSrgb,
    Bc3Unorm,
    Bc3UnormSrgb,
    Bc4Unorm,
    Bc4Snorm,
    Bc5Unorm,
    Bc5Snorm,
    Bc6HUfloat,
    Bc6HSfloat,
    Bc7Unorm,
    Bc7UnormSrgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatKind {
    Integer,
    Normalized,
    Float,
    DepthStencil,
}

/// One row of the format table.
#[derive(Debug, Clone, Copy)]
pub struct FormatInfo {
    pub format: Format,
    pub kind: FormatKind,
    pub bytes_per_block: u8,
    /// Compressed formats cover a `block_size`×`block_size` texel footprint.
    pub block_size: u8,
    pub has_depth: bool,
    pub has_stencil: bool,
    pub is_signed: bool,
    pub is_srgb: bool,
}

macro_rules! row {
    ($fmt:ident, $kind:ident, $bpb:expr, $bs:expr, $d:expr, $s:expr, $sg:expr, $srgb:expr) => {
        FormatInfo {
            format: Format::$fmt,
            kind: FormatKind::$kind,
            bytes_per_block: $bpb,
            block_size: $bs,
            has_depth: $d,
            has_stencil: $s,
            is_signed: $sg,
            is_srgb: $srgb,
        }
    };
}

// Indexed by the Format discriminant; `format_info` asserts the invariant.
const FORMAT_INFO: &[FormatInfo] = &[
    row!(Unknown, Integer, 0, 1, false, false, false, false),
    row!(R8Uint, Integer, 1, 1, false, false, false, false),
    row!(R8Sint, Integer, 1, 1, false, false, true, false),
    row!(R8Unorm, Normalized, 1, 1, false, false, false, false),
    row!(R8Snorm, Normalized, 1, 1, false, false, true, false),
    row!(Rg8Uint, Integer, 2, 1, false, false, false, false),
    row!(Rg8Sint, Integer, 2, 1, false, false, true, false),
    row!(Rg8Unorm, Normalized, 2, 1, false, false, false, false),
    row!(Rg8Snorm, Normalized, 2, 1, false, false, true, false),
    row!(R16Uint, Integer, 2, 1, false, false, false, false),
    row!(R16Sint, Integer, 2, 1, false, false, true, false),
    row!(R16Unorm, Normalized, 2, 1, false, false, false, false),
    row!(R16Snorm, Normalized, 2, 1, false, false, true, false),
    row!(R16Float, Float, 2, 1, false, false, true, false),
    row!(Bgra4Unorm, Normalized, 2, 1, false, false, false, false),
    row!(B5G6R5Unorm, Normalized, 2, 1, false, false, false, false),
    row!(B5G5R5A1Unorm, Normalized, 2, 1, false, false, false, false),
    row!(Rgba8Uint, Integer, 4, 1, false, false, false, false),
    row!(Rgba8Sint, Integer, 4, 1, false, false, true, false),
    row!(Rgba8Unorm, Normalized, 4, 1, false, false, false, false),
    row!(Rgba8Snorm, Normalized, 4, 1, false, false, true, false),
    row!(Bgra8Unorm, Normalized, 4, 1, false, false, false, false),
    row!(Srgba8Unorm, Normalized, 4, 1, false, false, false, true),
    row!(Sbgra8Unorm, Normalized, 4, 1, false, false, false, true),
    row!(R10G10B10A2Unorm, Normalized, 4, 1, false, false, false, false),
    row!(R11G11B10Float, Float, 4, 1, false, false, false, false),
    row!(Rg16Uint, Integer, 4, 1, false, false, false, false),
    row!(Rg16Sint, Integer, 4, 1, false, false, true, false),
    row!(Rg16Unorm, Normalized, 4, 1, false, false, false, false),
    row!(Rg16Snorm, Normalized, 4, 1, false, false, true, false),
    row!(Rg16Float, Float, 4, 1, false, false, true, false),
    row!(R32Uint, Integer, 4, 1, false, false, false, false),
    row!(R32Sint, Integer, 4, 1, false, false, true, false),
    row!(R32Float, Float, 4, 1, false, false, true, false),
    row!(Rgba16Uint, Integer, 8, 1, false, false, false, false),
    row!(Rgba16Sint, Integer, 8, 1, false, false, true, false),
    row!(Rgba16Unorm, Normalized, 8, 1, false, false, false, false),
    row!(Rgba16Snorm, Normalized, 8, 1, false, false, true, false),
    row!(Rgba16Float, Float, 8, 1, false, false, true, false),
    row!(Rg32Uint, Integer, 8, 1, false, false, false, false),
    row!(Rg32Sint, Integer, 8, 1, false, false, true, false),
    row!(Rg32Float, Float, 8, 1, false, false, true, false),
    row!(Rgb32Uint, Integer, 12, 1, false, false, false, false),
    row!(Rgb32Sint, Integer, 12, 1, false, false, true, false),
    row!(Rgb32Float, Float, 12, 1, false, false, true, false),
    row!(Rgba32Uint, Integer, 16, 1, false, false, false, false),
    row!(Rgba32Sint, Integer, 16, 1, false, false, true, false),
    row!(Rgba32Float, Float, 16, 1, false, false, true, false),
    row!(D16Unorm, DepthStencil, 2, 1, true, false, false, false),
    row!(D24UnormS8Uint, DepthStencil, 4, 1, true, true, false, false),
    row!(D32Float, DepthStencil, 4, 1, true, false, false, false),
    row!(D32FloatS8Uint, DepthStencil, 8, 1, true, true, false, false),
    row!(Bc1Unorm, Normalized, 8, 4, false, false, false, false),
    row!(Bc1UnormSrgb, Normalized, 8, 4, false, false, false, true),
    row!(Bc2Unorm, Normalized, 16, 4, false, false, false, false),
    row!(Bc2UnormSrgb, Normalized, 16, 4, false, false, false, true),
    row!(Bc3Unorm, Normalized, 16, 4, false, false, false, false),
    row!(Bc3UnormSrgb, Normalized, 16, 4, false, false, false, true),
    row!(Bc4Unorm, Normalized, 8, 4, false, false, false, false),
    row!(Bc4Snorm, Normalized, 8, 4, false, false, true, false),
    row!(Bc5Unorm, Normalized, 16, 4, false, false, false, false),
    row!(Bc5Snorm, Normalized, 16, 4, false, false, true, false),
    row!(Bc6HUfloat, Float, 16, 4, false, false, false, false),
    row!(Bc6HSfloat, Float, 16, 4, false, false, true, false),
    row!(Bc7Unorm, Normalized, 16, 4, false, false, false, false),
    row!(Bc7UnormSrgb, Normalized, 16, 4, false, false, false, true),
];

/// Looks up the table row for `format`.
pub fn format_info(format: Format) -> &'static FormatInfo {
    let entry = &FORMAT_INFO[format as usize];
    debug_assert_eq!(entry.format, format, "format table out of order");
    entry
}

impl Format {
    pub fn info(self) -> &'static FormatInfo {
        format_info(self)
    }

    pub fn has_depth(self) -> bool {
        format_info(self).has_depth
    }

    pub fn has_stencil(self) -> bool {
        format_info(self).has_stencil
    }

    pub fn bytes_per_block(self) -> u32 {
        format_info(self).bytes_per_block as u32
    }

    pub fn block_size(self) -> u32 {
        format_info(self).block_size as u32
    }

    pub fn is_compressed(self) -> bool {
        format_info(self).block_size > 1
    }
}

/// Byte footprint of a (width, height, depth) region in this format,
/// accounting for block compression.
pub fn region_byte_size(format: Format, width: u32, height: u32, depth: u32) -> u64 {
    let info = format_info(format);
    let bs = info.block_size as u32;
    let blocks_x = (width + bs - 1) / bs;
    let blocks_y = (height + bs - 1) / bs;
    blocks_x as u64 * blocks_y as u64 * depth as u64 * info.bytes_per_block as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_rows_match_discriminants() {
        for (idx, entry) in FORMAT_INFO.iter().enumerate() {
            assert_eq!(entry.format as usize, idx, "{:?}", entry.format);
        }
    }

    #[test]
    fn depth_stencil_bits() {
        assert!(Format::D24UnormS8Uint.has_depth());
        assert!(Format::D24UnormS8Uint.has_stencil());
        assert!(Format::D32Float.has_depth());
        assert!(!Format::D32Float.has_stencil());
        assert!(!Format::Rgba8Unorm.has_depth());
    }

    #[test]
    fn compressed_region_sizes() {
        // One BC1 block covers 4x4 texels in 8 bytes.
        assert_eq!(region_byte_size(Format::Bc1Unorm, 4, 4, 1), 8);
        assert_eq!(region_byte_size(Format::Bc1Unorm, 8, 8, 1), 32);
        // Partial blocks round up.
        assert_eq!(region_byte_size(Format::Bc1Unorm, 5, 5, 1), 32);
        assert_eq!(region_byte_size(Format::Rgba8Unorm, 16, 16, 1), 1024);
    }
}
