//! Mappings from the API-agnostic enums to their Direct3D 11 equivalents.

use crate::format::Format;
use crate::types::*;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;

pub(crate) fn dxgi_format(format: Format) -> DXGI_FORMAT {
    match format {
        Format::Unknown => DXGI_FORMAT_UNKNOWN,
        Format::R8Uint => DXGI_FORMAT_R8_UINT,
        Format::R8Sint => DXGI_FORMAT_R8_SINT,
        Format::R8Unorm => DXGI_FORMAT_R8_UNORM,
        Format::R8Snorm => DXGI_FORMAT_R8_SNORM,
        Format::Rg8Uint => DXGI_FORMAT_R8G8_UINT,
        Format::Rg8Sint => DXGI_FORMAT_R8G8_SINT,
        Format::Rg8Unorm => DXGI_FORMAT_R8G8_UNORM,
        Format::Rg8Snorm => DXGI_FORMAT_R8G8_SNORM,
        Format::R16Uint => DXGI_FORMAT_R16_UINT,
        Format::R16Sint => DXGI_FORMAT_R16_SINT,
        Format::R16Unorm => DXGI_FORMAT_R16_UNORM,
        Format::R16Snorm => DXGI_FORMAT_R16_SNORM,
        Format::R16Float => DXGI_FORMAT_R16_FLOAT,
        Format::Bgra4Unorm => DXGI_FORMAT_B4G4R4A4_UNORM,
        Format::B5G6R5Unorm => DXGI_FORMAT_B5G6R5_UNORM,
        Format::B5G5R5A1Unorm => DXGI_FORMAT_B5G5R5A1_UNORM,
        Format::Rgba8Uint => DXGI_FORMAT_R8G8B8A8_UINT,
        Format::Rgba8Sint => DXGI_FORMAT_R8G8B8A8_SINT,
        Format::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        Format::Rgba8Snorm => DXGI_FORMAT_R8G8B8A8_SNORM,
        Format::Bgra8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        Format::Srgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
        Format::Sbgra8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
        Format::R10G10B10A2Unorm => DXGI_FORMAT_R10G10B10A2_UNORM,
        Format::R11G11B10Float => DXGI_FORMAT_R11G11B10_FLOAT,
        Format::Rg16Uint => DXGI_FORMAT_R16G16_UINT,
        Format::Rg16Sint => DXGI_FORMAT_R16G16_SINT,
        Format::Rg16Unorm => DXGI_FORMAT_R16G16_UNORM,
        Format::Rg16Snorm => DXGI_FORMAT_R16G16_SNORM,
        Format::Rg16Float => DXGI_FORMAT_R16G16_FLOAT,
        Format::R32Uint => DXGI_FORMAT_R32_UINT,
        Format::R32Sint => DXGI_FORMAT_R32_SINT,
        Format::R32Float => DXGI_FORMAT_R32_FLOAT,
        Format::Rgba16Uint => DXGI_FORMAT_R16G16B16A16_UINT,
        Format::Rgba16Sint => DXGI_FORMAT_R16G16B16A16_SINT,
        Format::Rgba16Unorm => DXGI_FORMAT_R16G16B16A16_UNORM,
        Format::Rgba16Snorm => DXGI_FORMAT_R16G16B16A16_SNORM,
        Format::Rgba16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
        Format::Rg32Uint => DXGI_FORMAT_R32G32_UINT,
        Format::Rg32Sint => DXGI_FORMAT_R32G32_SINT,
        Format::Rg32Float => DXGI_FORMAT_R32G32_FLOAT,
        Format::Rgb32Uint => DXGI_FORMAT_R32G32B32_UINT,
        Format::Rgb32Sint => DXGI_FORMAT_R32G32B32_SINT,
        Format::Rgb32Float => DXGI_FORMAT_R32G32B32_FLOAT,
        Format::Rgba32Uint => DXGI_FORMAT_R32G32B32A32_UINT,
        Format::Rgba32Sint => DXGI_FORMAT_R32G32B32A32_SINT,
        Format::Rgba32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
        Format::D16Unorm => DXGI_FORMAT_D16_UNORM,
        Format::D24UnormS8Uint => DXGI_FORMAT_D24_UNORM_S8_UINT,
        Format::D32Float => DXGI_FORMAT_D32_FLOAT,
        Format::D32FloatS8Uint => DXGI_FORMAT_D32_FLOAT_S8X24_UINT,
        Format::Bc1Unorm => DXGI_FORMAT_BC1_UNORM,
        Format::Bc1UnormSrgb => DXGI_FORMAT_BC1_UNORM_SRGB,
        Format::Bc2Unorm => DXGI_FORMAT_BC2_UNORM,
        Format::Bc2UnormSrgb => DXGI_FORMAT_BC2_UNORM_SRGB,
        Format::Bc3Unorm => DXGI_FORMAT_BC3_UNORM,
        Format::Bc3UnormSrgb => DXGI_FORMAT_BC3_UNORM_SRGB,
        Format::Bc4Unorm => DXGI_FORMAT_BC4_UNORM,
        Format::Bc4Snorm => DXGI_FORMAT_BC4_SNORM,
        Format::Bc5Unorm => DXGI_FORMAT_BC5_UNORM,
        Format::Bc5Snorm => DXGI_FORMAT_BC5_SNORM,
        Format::Bc6HUfloat => DXGI_FORMAT_BC6H_UF16,
        Format::Bc6HSfloat => DXGI_FORMAT_BC6H_SF16,
        Format::Bc7Unorm => DXGI_FORMAT_BC7_UNORM,
        Format::Bc7UnormSrgb => DXGI_FORMAT_BC7_UNORM_SRGB,
    }
}

/// Format used for the underlying resource. Depth formats that are also
/// sampled must be created typeless so SRV and DSV can reinterpret them.
pub(crate) fn dxgi_resource_format(format: Format, needs_srv: bool) -> DXGI_FORMAT {
    if !needs_srv {
        return dxgi_format(format);
    }
    match format {
        Format::D16Unorm => DXGI_FORMAT_R16_TYPELESS,
        Format::D24UnormS8Uint => DXGI_FORMAT_R24G8_TYPELESS,
        Format::D32Float => DXGI_FORMAT_R32_TYPELESS,
        Format::D32FloatS8Uint => DXGI_FORMAT_R32G8X24_TYPELESS,
        other => dxgi_format(other),
    }
}

/// Format a shader-resource view uses to read `format`, honoring the aspect
/// selection for combined depth/stencil.
pub(crate) fn dxgi_srv_format(format: Format, aspect: ViewAspect) -> DXGI_FORMAT {
    match (format, aspect) {
        (Format::D16Unorm, _) => DXGI_FORMAT_R16_UNORM,
        (Format::D24UnormS8Uint, ViewAspect::StencilOnly) => DXGI_FORMAT_X24_TYPELESS_G8_UINT,
        (Format::D24UnormS8Uint, _) => DXGI_FORMAT_R24_UNORM_X8_TYPELESS,
        (Format::D32Float, _) => DXGI_FORMAT_R32_FLOAT,
        (Format::D32FloatS8Uint, ViewAspect::StencilOnly) => {
            DXGI_FORMAT_X32_TYPELESS_G8X24_UINT
        }
        (Format::D32FloatS8Uint, _) => DXGI_FORMAT_R32_FLOAT_X8X24_TYPELESS,
        (other, _) => dxgi_format(other),
    }
}

pub(crate) fn comparison_func(func: ComparisonFunc) -> D3D11_COMPARISON_FUNC {
    match func {
        ComparisonFunc::Never => D3D11_COMPARISON_NEVER,
        ComparisonFunc::Less => D3D11_COMPARISON_LESS,
        ComparisonFunc::Equal => D3D11_COMPARISON_EQUAL,
        ComparisonFunc::LessOrEqual => D3D11_COMPARISON_LESS_EQUAL,
        ComparisonFunc::Greater => D3D11_COMPARISON_GREATER,
        ComparisonFunc::NotEqual => D3D11_COMPARISON_NOT_EQUAL,
        ComparisonFunc::GreaterOrEqual => D3D11_COMPARISON_GREATER_EQUAL,
        ComparisonFunc::Always => D3D11_COMPARISON_ALWAYS,
    }
}

pub(crate) fn stencil_op(op: StencilOp) -> D3D11_STENCIL_OP {
    match op {
        StencilOp::Keep => D3D11_STENCIL_OP_KEEP,
        StencilOp::Zero => D3D11_STENCIL_OP_ZERO,
        StencilOp::Replace => D3D11_STENCIL_OP_REPLACE,
        StencilOp::IncrementAndClamp => D3D11_STENCIL_OP_INCR_SAT,
        StencilOp::DecrementAndClamp => D3D11_STENCIL_OP_DECR_SAT,
        StencilOp::Invert => D3D11_STENCIL_OP_INVERT,
        StencilOp::IncrementAndWrap => D3D11_STENCIL_OP_INCR,
        StencilOp::DecrementAndWrap => D3D11_STENCIL_OP_DECR,
    }
}

pub(crate) fn stencil_op_desc(desc: StencilOpDesc) -> D3D11_DEPTH_STENCILOP_DESC {
    D3D11_DEPTH_STENCILOP_DESC {
        StencilFailOp: stencil_op(desc.fail_op),
        StencilDepthFailOp: stencil_op(desc.depth_fail_op),
        StencilPassOp: stencil_op(desc.pass_op),
        StencilFunc: comparison_func(desc.func),
    }
}

pub(crate) fn blend_factor(factor: BlendFactor) -> D3D11_BLEND {
    match factor {
        BlendFactor::Zero => D3D11_BLEND_ZERO,
        BlendFactor::One => D3D11_BLEND_ONE,
        BlendFactor::SrcColor => D3D11_BLEND_SRC_COLOR,
        BlendFactor::InvSrcColor => D3D11_BLEND_INV_SRC_COLOR,
        BlendFactor::SrcAlpha => D3D11_BLEND_SRC_ALPHA,
        BlendFactor::InvSrcAlpha => D3D11_BLEND_INV_SRC_ALPHA,
        BlendFactor::DstAlpha => D3D11_BLEND_DEST_ALPHA,
        BlendFactor::InvDstAlpha => D3D11_BLEND_INV_DEST_ALPHA,
        BlendFactor::DstColor => D3D11_BLEND_DEST_COLOR,
        BlendFactor::InvDstColor => D3D11_BLEND_INV_DEST_COLOR,
        BlendFactor::SrcAlphaSaturate => D3D11_BLEND_SRC_ALPHA_SAT,
        BlendFactor::ConstantColor => D3D11_BLEND_BLEND_FACTOR,
        BlendFactor::InvConstantColor => D3D11_BLEND_INV_BLEND_FACTOR,
        BlendFactor::Src1Color => D3D11_BLEND_SRC1_COLOR,
        BlendFactor::InvSrc1Color => D3D11_BLEND_INV_SRC1_COLOR,
        BlendFactor::Src1Alpha => D3D11_BLEND_SRC1_ALPHA,
        BlendFactor::InvSrc1Alpha => D3D11_BLEND_INV_SRC1_ALPHA,
    }
}

pub(crate) fn blend_op(op: BlendOp) -> D3D11_BLEND_OP {
    match op {
        BlendOp::Add => D3D11_BLEND_OP_ADD,
        BlendOp::Subtract => D3D11_BLEND_OP_SUBTRACT,
        BlendOp::ReverseSubtract => D3D11_BLEND_OP_REV_SUBTRACT,
        BlendOp::Min => D3D11_BLEND_OP_MIN,
        BlendOp::Max => D3D11_BLEND_OP_MAX,
    }
}

pub(crate) fn fill_mode(mode: FillMode) -> D3D11_FILL_MODE {
    match mode {
        FillMode::Solid => D3D11_FILL_SOLID,
        FillMode::Wireframe => D3D11_FILL_WIREFRAME,
    }
}

pub(crate) fn cull_mode(mode: CullMode) -> D3D11_CULL_MODE {
    match mode {
        CullMode::Back => D3D11_CULL_BACK,
        CullMode::Front => D3D11_CULL_FRONT,
        CullMode::None => D3D11_CULL_NONE,
    }
}

pub(crate) fn address_mode(mode: SamplerAddressMode) -> D3D11_TEXTURE_ADDRESS_MODE {
    match mode {
        SamplerAddressMode::Repeat => D3D11_TEXTURE_ADDRESS_WRAP,
        SamplerAddressMode::MirroredRepeat => D3D11_TEXTURE_ADDRESS_MIRROR,
        SamplerAddressMode::ClampToEdge => D3D11_TEXTURE_ADDRESS_CLAMP,
        SamplerAddressMode::ClampToBorder => D3D11_TEXTURE_ADDRESS_BORDER,
        SamplerAddressMode::MirrorClampToEdge => D3D11_TEXTURE_ADDRESS_MIRROR_ONCE,
    }
}

/// Packs min/mag/mip filters plus the reduction mode into the single D3D11
/// filter enum. Anisotropy overrides the per-axis filters.
pub(crate) fn sampler_filter(desc: &SamplerDesc) -> D3D11_FILTER {
    let reduction = match desc.reduction_type {
        SamplerReductionType::Standard => D3D11_FILTER_REDUCTION_TYPE_STANDARD,
        SamplerReductionType::Comparison => D3D11_FILTER_REDUCTION_TYPE_COMPARISON,
        SamplerReductionType::Minimum => D3D11_FILTER_REDUCTION_TYPE_MINIMUM,
        SamplerReductionType::Maximum => D3D11_FILTER_REDUCTION_TYPE_MAXIMUM,
    };
    if desc.max_anisotropy > 1.0 {
        // Anisotropic filtering bit plus all-linear base filter bits.
        return D3D11_FILTER(0x55 | (reduction.0 << 7));
    }
    let min = (desc.min_filter == Filter::Linear) as i32;
    let mag = (desc.mag_filter == Filter::Linear) as i32;
    let mip = (desc.mip_filter == Filter::Linear) as i32;
    D3D11_FILTER((min << 4) | (mag << 2) | mip | (reduction.0 << 7))
}

pub(crate) fn primitive_topology(
    primitive: PrimitiveType,
    control_points: u32,
) -> D3D_PRIMITIVE_TOPOLOGY {
    match primitive {
        PrimitiveType::PointList => D3D_PRIMITIVE_TOPOLOGY_POINTLIST,
        PrimitiveType::LineList => D3D_PRIMITIVE_TOPOLOGY_LINELIST,
        PrimitiveType::LineStrip => D3D_PRIMITIVE_TOPOLOGY_LINESTRIP,
        PrimitiveType::TriangleList => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
        PrimitiveType::TriangleStrip => D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP,
        // No fan topology on this API; callers get a not-supported error
        // earlier, this arm keeps the conversion total.
        PrimitiveType::TriangleFan => D3D_PRIMITIVE_TOPOLOGY_UNDEFINED,
        PrimitiveType::TriangleListWithAdjacency => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST_ADJ,
        PrimitiveType::TriangleStripWithAdjacency => D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP_ADJ,
        PrimitiveType::PatchList => D3D_PRIMITIVE_TOPOLOGY(
            D3D_PRIMITIVE_TOPOLOGY_1_CONTROL_POINT_PATCHLIST.0 + control_points.max(1) as i32 - 1,
        ),
    }
}

pub(crate) fn index_format(format: IndexFormat) -> DXGI_FORMAT {
    match format {
        IndexFormat::U16 => DXGI_FORMAT_R16_UINT,
        IndexFormat::U32 => DXGI_FORMAT_R32_UINT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampled_depth_resources_are_typeless() {
        assert_eq!(
            dxgi_resource_format(Format::D24UnormS8Uint, true),
            DXGI_FORMAT_R24G8_TYPELESS
        );
        assert_eq!(
            dxgi_resource_format(Format::D24UnormS8Uint, false),
            DXGI_FORMAT_D24_UNORM_S8_UINT
        );
        assert_eq!(
            dxgi_resource_format(Format::Rgba8Unorm, true),
            DXGI_FORMAT_R8G8B8A8_UNORM
        );
    }

    #[test]
    fn srv_formats_respect_aspect_selection() {
        assert_eq!(
            dxgi_srv_format(Format::D24UnormS8Uint, ViewAspect::DepthOnly),
            DXGI_FORMAT_R24_UNORM_X8_TYPELESS
        );
        assert_eq!(
            dxgi_srv_format(Format::D24UnormS8Uint, ViewAspect::StencilOnly),
            DXGI_FORMAT_X24_TYPELESS_G8_UINT
        );
        assert_eq!(
            dxgi_srv_format(Format::D32FloatS8Uint, ViewAspect::StencilOnly),
            DXGI_FORMAT_X32_TYPELESS_G8X24_UINT
        );
    }

    #[test]
    fn sampler_filter_packs_axis_bits() {
        let mut desc = SamplerDesc {
            min_filter: Filter::Nearest,
            mag_filter: Filter::Nearest,
            mip_filter: Filter::Nearest,
            max_anisotropy: 1.0,
            ..Default::default()
        };
        assert_eq!(sampler_filter(&desc), D3D11_FILTER_MIN_MAG_MIP_POINT);

        desc.min_filter = Filter::Linear;
        desc.mag_filter = Filter::Linear;
        desc.mip_filter = Filter::Linear;
        assert_eq!(sampler_filter(&desc), D3D11_FILTER_MIN_MAG_MIP_LINEAR);

        desc.reduction_type = SamplerReductionType::Comparison;
        assert_eq!(
            sampler_filter(&desc),
            D3D11_FILTER_COMPARISON_MIN_MAG_MIP_LINEAR
        );

        desc.max_anisotropy = 8.0;
        assert_eq!(sampler_filter(&desc), D3D11_FILTER_COMPARISON_ANISOTROPIC);
    }

    #[test]
    fn patch_list_topology_counts_control_points() {
        assert_eq!(
            primitive_topology(PrimitiveType::PatchList, 1),
            D3D_PRIMITIVE_TOPOLOGY_1_CONTROL_POINT_PATCHLIST
        );
        assert_eq!(
            primitive_topology(PrimitiveType::PatchList, 3),
            D3D_PRIMITIVE_TOPOLOGY_3_CONTROL_POINT_PATCHLIST
        );
        assert_eq!(
            primitive_topology(PrimitiveType::PatchList, 32),
            D3D_PRIMITIVE_TOPOLOGY_32_CONTROL_POINT_PATCHLIST
        );
    }
}
