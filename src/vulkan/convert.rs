use crate::types::{
    BlendFactor, BlendOp, ColorMask, ComparisonFunc, CullMode, FillMode, Filter, PrimitiveType,
    RenderTargetBlend, ResourceStates, ResourceType, SamplerAddressMode, SamplerReductionType,
    ShaderStage, ShaderStageMask, ShadingRateCombiner, StencilOp, StencilOpDesc, TextureDimension,
    VariableShadingRate, Viewport,
};
use crate::Format;
use ash::vk;

impl From<Format> for vk::Format {
    fn from(format: Format) -> Self {
        match format {
            Format::Unknown => vk::Format::UNDEFINED,
            Format::R8Uint => vk::Format::R8_UINT,
            Format::R8Sint => vk::Format::R8_SINT,
            Format::R8Unorm => vk::Format::R8_UNORM,
            Format::R8Snorm => vk::Format::R8_SNORM,
            Format::Rg8Uint => vk::Format::R8G8_UINT,
            Format::Rg8Sint => vk::Format::R8G8_SINT,
            Format::Rg8Unorm => vk::Format::R8G8_UNORM,
            Format::Rg8Snorm => vk::Format::R8G8_SNORM,
            Format::R16Uint => vk::Format::R16_UINT,
            Format::R16Sint => vk::Format::R16_SINT,
            Format::R16Unorm => vk::Format::R16_UNORM,
            Format::R16Snorm => vk::Format::R16_SNORM,
            Format::R16Float => vk::Format::R16_SFLOAT,
            Format::Bgra4Unorm => vk::Format::B4G4R4A4_UNORM_PACK16,
            Format::B5G6R5Unorm => vk::Format::B5G6R5_UNORM_PACK16,
            Format::B5G5R5A1Unorm => vk::Format::B5G5R5A1_UNORM_PACK16,
            Format::Rgba8Uint => vk::Format::R8G8B8A8_UINT,
            Format::Rgba8Sint => vk::Format::R8G8B8A8_SINT,
            Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Format::Rgba8Snorm => vk::Format::R8G8B8A8_SNORM,
            Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Format::Srgba8Unorm => vk::Format::R8G8B8A8_SRGB,
            Format::Sbgra8Unorm => vk::Format::B8G8R8A8_SRGB,
            Format::R10G10B10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
            Format::R11G11B10Float => vk::Format::B10G11R11_UFLOAT_PACK32,
            Format::Rg16Uint => vk::Format::R16G16_UINT,
            Format::Rg16Sint => vk::Format::R16G16_SINT,
            Format::Rg16Unorm => vk::Format::R16G16_UNORM,
            Format::Rg16Snorm => vk::Format::R16G16_SNORM,
            Format::Rg16Float => vk::Format::R16G16_SFLOAT,
            Format::R32Uint => vk::Format::R32_UINT,
            Format::R32Sint => vk::Format::R32_SINT,
            Format::R32Float => vk::Format::R32_SFLOAT,
            Format::Rgba16Uint => vk::Format::R16G16B16A16_UINT,
            Format::Rgba16Sint => vk::Format::R16G16B16A16_SINT,
            Format::Rgba16Unorm => vk::Format::R16G16B16A16_UNORM,
            Format::Rgba16Snorm => vk::Format::R16G16B16A16_SNORM,
            Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Format::Rg32Uint => vk::Format::R32G32_UINT,
            Format::Rg32Sint => vk::Format::R32G32_SINT,
            Format::Rg32Float => vk::Format::R32G32_SFLOAT,
            Format::Rgb32Uint => vk::Format::R32G32B32_UINT,
            Format::Rgb32Sint => vk::Format::R32G32B32_SINT,
            Format::Rgb32Float => vk::Format::R32G32B32_SFLOAT,
            Format::Rgba32Uint => vk::Format::R32G32B32A32_UINT,
            Format::Rgba32Sint => vk::Format::R32G32B32A32_SINT,
            Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Format::D16Unorm => vk::Format::D16_UNORM,
            Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
            Format::D32Float => vk::Format::D32_SFLOAT,
            Format::D32FloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
            Format::Bc1Unorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
            Format::Bc1UnormSrgb => vk::Format::BC1_RGBA_SRGB_BLOCK,
            Format::Bc2Unorm => vk::Format::BC2_UNORM_BLOCK,
            Format::Bc2UnormSrgb => vk::Format::BC2_SRGB_BLOCK,
            Format::Bc3Unorm => vk::Format::BC3_UNORM_BLOCK,
            Format::Bc3UnormSrgb => vk::Format::BC3_SRGB_BLOCK,
            Format::Bc4Unorm => vk::Format::BC4_UNORM_BLOCK,
            Format::Bc4Snorm => vk::Format::BC4_SNORM_BLOCK,
            Format::Bc5Unorm => vk::Format::BC5_UNORM_BLOCK,
            Format::Bc5Snorm => vk::Format::BC5_SNORM_BLOCK,
            Format::Bc6HUfloat => vk::Format::BC6H_UFLOAT_BLOCK,
            Format::Bc6HSfloat => vk::Format::BC6H_SFLOAT_BLOCK,
            Format::Bc7Unorm => vk::Format::BC7_UNORM_BLOCK,
            Format::Bc7UnormSrgb => vk::Format::BC7_SRGB_BLOCK,
        }
    }
}

impl From<Filter> for vk::Filter {
    fn from(filter: Filter) -> Self {
        match filter {
            Filter::Nearest => vk::Filter::NEAREST,
            Filter::Linear => vk::Filter::LINEAR,
        }
    }
}

impl From<Filter> for vk::SamplerMipmapMode {
    fn from(filter: Filter) -> Self {
        match filter {
            Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
            Filter::Linear => vk::SamplerMipmapMode::LINEAR,
        }
    }
}

impl From<SamplerAddressMode> for vk::SamplerAddressMode {
    fn from(mode: SamplerAddressMode) -> Self {
        match mode {
            SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            SamplerAddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            SamplerAddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            SamplerAddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
            SamplerAddressMode::MirrorClampToEdge => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
        }
    }
}

impl From<SamplerReductionType> for vk::SamplerReductionMode {
    fn from(reduction: SamplerReductionType) -> Self {
        match reduction {
            SamplerReductionType::Standard | SamplerReductionType::Comparison => {
                vk::SamplerReductionMode::WEIGHTED_AVERAGE
            }
            SamplerReductionType::Minimum => vk::SamplerReductionMode::MIN,
            SamplerReductionType::Maximum => vk::SamplerReductionMode::MAX,
        }
    }
}

impl From<ComparisonFunc> for vk::CompareOp {
    fn from(func: ComparisonFunc) -> Self {
        match func {
            ComparisonFunc::Never => vk::CompareOp::NEVER,
            ComparisonFunc::Less => vk::CompareOp::LESS,
            ComparisonFunc::Equal => vk::CompareOp::EQUAL,
            ComparisonFunc::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            ComparisonFunc::Greater => vk::CompareOp::GREATER,
            ComparisonFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
            ComparisonFunc::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            ComparisonFunc::Always => vk::CompareOp::ALWAYS,
        }
    }
}

impl From<StencilOp> for vk::StencilOp {
    fn from(op: StencilOp) -> Self {
        match op {
            StencilOp::Keep => vk::StencilOp::KEEP,
            StencilOp::Zero => vk::StencilOp::ZERO,
            StencilOp::Replace => vk::StencilOp::REPLACE,
            StencilOp::IncrementAndClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
            StencilOp::DecrementAndClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
            StencilOp::Invert => vk::StencilOp::INVERT,
            StencilOp::IncrementAndWrap => vk::StencilOp::INCREMENT_AND_WRAP,
            StencilOp::DecrementAndWrap => vk::StencilOp::DECREMENT_AND_WRAP,
        }
    }
}

impl From<BlendFactor> for vk::BlendFactor {
    fn from(factor: BlendFactor) -> Self {
        match factor {
            BlendFactor::Zero => vk::BlendFactor::ZERO,
            BlendFactor::One => vk::BlendFactor::ONE,
            BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
            BlendFactor::InvSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendFactor::InvSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
            BlendFactor::InvDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
            BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
            BlendFactor::InvDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            BlendFactor::SrcAlphaSaturate => vk::BlendFactor::SRC_ALPHA_SATURATE,
            BlendFactor::ConstantColor => vk::BlendFactor::CONSTANT_COLOR,
            BlendFactor::InvConstantColor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
            BlendFactor::Src1Color => vk::BlendFactor::SRC1_COLOR,
            BlendFactor::InvSrc1Color => vk::BlendFactor::ONE_MINUS_SRC1_COLOR,
            BlendFactor::Src1Alpha => vk::BlendFactor::SRC1_ALPHA,
            BlendFactor::InvSrc1Alpha => vk::BlendFactor::ONE_MINUS_SRC1_ALPHA,
        }
    }
}

impl From<BlendOp> for vk::BlendOp {
    fn from(op: BlendOp) -> Self {
        match op {
            BlendOp::Add => vk::BlendOp::ADD,
            BlendOp::Subtract => vk::BlendOp::SUBTRACT,
            BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            BlendOp::Min => vk::BlendOp::MIN,
            BlendOp::Max => vk::BlendOp::MAX,
        }
    }
}

impl From<ColorMask> for vk::ColorComponentFlags {
    fn from(mask: ColorMask) -> Self {
        let mut flags = vk::ColorComponentFlags::empty();
        if mask.contains(ColorMask::RED) {
            flags |= vk::ColorComponentFlags::R;
        }
        if mask.contains(ColorMask::GREEN) {
            flags |= vk::ColorComponentFlags::G;
        }
        if mask.contains(ColorMask::BLUE) {
            flags |= vk::ColorComponentFlags::B;
        }
        if mask.contains(ColorMask::ALPHA) {
            flags |= vk::ColorComponentFlags::A;
        }
        flags
    }
}

impl From<RenderTargetBlend> for vk::PipelineColorBlendAttachmentState {
    fn from(blend: RenderTargetBlend) -> Self {
        vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(blend.blend_enable)
            .src_color_blend_factor(blend.src_blend.into())
            .dst_color_blend_factor(blend.dst_blend.into())
            .color_blend_op(blend.blend_op.into())
            .src_alpha_blend_factor(blend.src_blend_alpha.into())
            .dst_alpha_blend_factor(blend.dst_blend_alpha.into())
            .alpha_blend_op(blend.blend_op_alpha.into())
            .color_write_mask(blend.color_write_mask.into())
            .build()
    }
}

impl From<StencilOpDesc> for vk::StencilOpState {
    fn from(desc: StencilOpDesc) -> Self {
        vk::StencilOpState {
            fail_op: desc.fail_op.into(),
            pass_op: desc.pass_op.into(),
            depth_fail_op: desc.depth_fail_op.into(),
            compare_op: desc.func.into(),
            ..Default::default()
        }
    }
}

impl From<PrimitiveType> for vk::PrimitiveTopology {
    fn from(primitive: PrimitiveType) -> Self {
        match primitive {
            PrimitiveType::PointList => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveType::LineList => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveType::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveType::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveType::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            PrimitiveType::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
            PrimitiveType::TriangleListWithAdjacency => {
                vk::PrimitiveTopology::TRIANGLE_LIST_WITH_ADJACENCY
            }
            PrimitiveType::TriangleStripWithAdjacency => {
                vk::PrimitiveTopology::TRIANGLE_STRIP_WITH_ADJACENCY
            }
            PrimitiveType::PatchList => vk::PrimitiveTopology::PATCH_LIST,
        }
    }
}

impl From<FillMode> for vk::PolygonMode {
    fn from(mode: FillMode) -> Self {
        match mode {
            FillMode::Solid => vk::PolygonMode::FILL,
            FillMode::Wireframe => vk::PolygonMode::LINE,
        }
    }
}

impl From<CullMode> for vk::CullModeFlags {
    fn from(mode: CullMode) -> Self {
        match mode {
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::None => vk::CullModeFlags::NONE,
        }
    }
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Hull => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::Domain => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::Pixel => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Amplification => vk::ShaderStageFlags::TASK_NV,
            ShaderStage::Mesh => vk::ShaderStageFlags::MESH_NV,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
            ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
            ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
            ShaderStage::Callable => vk::ShaderStageFlags::CALLABLE_KHR,
        }
    }
}

impl From<ShaderStageMask> for vk::ShaderStageFlags {
    fn from(mask: ShaderStageMask) -> Self {
        let mut flags = vk::ShaderStageFlags::empty();
        let pairs = [
            (ShaderStageMask::VERTEX, vk::ShaderStageFlags::VERTEX),
            (ShaderStageMask::HULL, vk::ShaderStageFlags::TESSELLATION_CONTROL),
            (ShaderStageMask::DOMAIN, vk::ShaderStageFlags::TESSELLATION_EVALUATION),
            (ShaderStageMask::GEOMETRY, vk::ShaderStageFlags::GEOMETRY),
            (ShaderStageMask::PIXEL, vk::ShaderStageFlags::FRAGMENT),
            (ShaderStageMask::AMPLIFICATION, vk::ShaderStageFlags::TASK_NV),
            (ShaderStageMask::MESH, vk::ShaderStageFlags::MESH_NV),
            (ShaderStageMask::COMPUTE, vk::ShaderStageFlags::COMPUTE),
            (ShaderStageMask::RAY_GENERATION, vk::ShaderStageFlags::RAYGEN_KHR),
            (ShaderStageMask::ANY_HIT, vk::ShaderStageFlags::ANY_HIT_KHR),
            (ShaderStageMask::CLOSEST_HIT, vk::ShaderStageFlags::CLOSEST_HIT_KHR),
            (ShaderStageMask::MISS, vk::ShaderStageFlags::MISS_KHR),
            (ShaderStageMask::INTERSECTION, vk::ShaderStageFlags::INTERSECTION_KHR),
            (ShaderStageMask::CALLABLE, vk::ShaderStageFlags::CALLABLE_KHR),
        ];
        for (ours, theirs) in pairs {
            if mask.contains(ours) {
                flags |= theirs;
            }
        }
        flags
    }
}

impl From<TextureDimension> for vk::ImageType {
    fn from(dimension: TextureDimension) -> Self {
        match dimension {
            TextureDimension::Texture1D | TextureDimension::Texture1DArray => vk::ImageType::TYPE_1D,
            TextureDimension::Texture3D => vk::ImageType::TYPE_3D,
            _ => vk::ImageType::TYPE_2D,
        }
    }
}

impl From<TextureDimension> for vk::ImageViewType {
    fn from(dimension: TextureDimension) -> Self {
        match dimension {
            TextureDimension::Texture1D => vk::ImageViewType::TYPE_1D,
            TextureDimension::Texture1DArray => vk::ImageViewType::TYPE_1D_ARRAY,
            TextureDimension::Texture2D | TextureDimension::Texture2DMS => vk::ImageViewType::TYPE_2D,
            TextureDimension::Texture2DArray | TextureDimension::Texture2DMSArray => {
                vk::ImageViewType::TYPE_2D_ARRAY
            }
            TextureDimension::TextureCube => vk::ImageViewType::CUBE,
            TextureDimension::TextureCubeArray => vk::ImageViewType::CUBE_ARRAY,
            TextureDimension::Texture3D => vk::ImageViewType::TYPE_3D,
        }
    }
}

impl From<VariableShadingRate> for vk::Extent2D {
    fn from(rate: VariableShadingRate) -> Self {
        let (width, height) = match rate {
            VariableShadingRate::E1x1 => (1, 1),
            VariableShadingRate::E1x2 => (1, 2),
            VariableShadingRate::E2x1 => (2, 1),
            VariableShadingRate::E2x2 => (2, 2),
            VariableShadingRate::E2x4 => (2, 4),
            VariableShadingRate::E4x2 => (4, 2),
            VariableShadingRate::E4x4 => (4, 4),
        };
        vk::Extent2D { width, height }
    }
}

impl From<ShadingRateCombiner> for vk::FragmentShadingRateCombinerOpKHR {
    fn from(combiner: ShadingRateCombiner) -> Self {
        match combiner {
            ShadingRateCombiner::Passthrough => vk::FragmentShadingRateCombinerOpKHR::KEEP,
            ShadingRateCombiner::Override => vk::FragmentShadingRateCombinerOpKHR::REPLACE,
            ShadingRateCombiner::Min => vk::FragmentShadingRateCombinerOpKHR::MIN,
            ShadingRateCombiner::Max => vk::FragmentShadingRateCombinerOpKHR::MAX,
            ShadingRateCombiner::ApplyRelative => vk::FragmentShadingRateCombinerOpKHR::MUL,
        }
    }
}

impl From<Viewport> for vk::Viewport {
    fn from(viewport: Viewport) -> Self {
        // Flipped so that clip-space +Y is up, matching the other backend.
        vk::Viewport {
            x: viewport.min_x,
            y: viewport.max_y,
            width: viewport.width(),
            height: -viewport.height(),
            min_depth: viewport.min_z,
            max_depth: viewport.max_z,
        }
    }
}

/// Descriptor type for a layout item. Push constants have no descriptor.
pub(crate) fn descriptor_type(ty: ResourceType) -> Option<vk::DescriptorType> {
    let vk_type = match ty {
        ResourceType::TextureSrv => vk::DescriptorType::SAMPLED_IMAGE,
        ResourceType::TextureUav => vk::DescriptorType::STORAGE_IMAGE,
        ResourceType::TypedBufferSrv => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        ResourceType::TypedBufferUav => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        ResourceType::StructuredBufferSrv
        | ResourceType::StructuredBufferUav
        | ResourceType::RawBufferSrv
        | ResourceType::RawBufferUav => vk::DescriptorType::STORAGE_BUFFER,
        ResourceType::ConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        ResourceType::VolatileConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        ResourceType::Sampler => vk::DescriptorType::SAMPLER,
        ResourceType::RayTracingAccelStruct => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        ResourceType::PushConstants => return None,
    };
    Some(vk_type)
}

/// One row of the state-translation table.
struct StateMappingRow {
    state: ResourceStates,
    stage: vk::PipelineStageFlags2,
    access: vk::AccessFlags2,
    layout: vk::ImageLayout,
}

const fn row(
    state: ResourceStates,
    stage: vk::PipelineStageFlags2,
    access: vk::AccessFlags2,
    layout: vk::ImageLayout,
) -> StateMappingRow {
    StateMappingRow {
        state,
        stage,
        access,
        layout,
    }
}

const STATE_MAPPINGS: &[StateMappingRow] = &[
    row(
        ResourceStates::CONSTANT_BUFFER,
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::UNIFORM_READ,
        vk::ImageLayout::UNDEFINED,
    ),
    row(
        ResourceStates::VERTEX_BUFFER,
        vk::PipelineStageFlags2::VERTEX_INPUT,
        vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        vk::ImageLayout::UNDEFINED,
    ),
    row(
        ResourceStates::INDEX_BUFFER,
        vk::PipelineStageFlags2::VERTEX_INPUT,
        vk::AccessFlags2::INDEX_READ,
        vk::ImageLayout::UNDEFINED,
    ),
    row(
        ResourceStates::INDIRECT_ARGUMENT,
        vk::PipelineStageFlags2::DRAW_INDIRECT,
        vk::AccessFlags2::INDIRECT_COMMAND_READ,
        vk::ImageLayout::UNDEFINED,
    ),
    row(
        ResourceStates::SHADER_RESOURCE,
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::SHADER_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    ),
    row(
        ResourceStates::UNORDERED_ACCESS,
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::from_raw(
            vk::AccessFlags2::SHADER_READ.as_raw() | vk::AccessFlags2::SHADER_WRITE.as_raw(),
        ),
        vk::ImageLayout::GENERAL,
    ),
    row(
        ResourceStates::RENDER_TARGET,
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags2::from_raw(
            vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    ),
    row(
        ResourceStates::DEPTH_WRITE,
        vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        vk::AccessFlags2::from_raw(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    ),
    row(
        ResourceStates::DEPTH_READ,
        vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
    ),
    row(
        ResourceStates::STREAM_OUT,
        vk::PipelineStageFlags2::TRANSFORM_FEEDBACK_EXT,
        vk::AccessFlags2::TRANSFORM_FEEDBACK_WRITE_EXT,
        vk::ImageLayout::UNDEFINED,
    ),
    row(
        ResourceStates::COPY_DEST,
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    ),
    row(
        ResourceStates::COPY_SOURCE,
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    ),
    row(
        ResourceStates::RESOLVE_DEST,
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    ),
    row(
        ResourceStates::RESOLVE_SOURCE,
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    ),
    row(
        ResourceStates::PRESENT,
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::NONE,
        vk::ImageLayout::PRESENT_SRC_KHR,
    ),
    row(
        ResourceStates::ACCEL_STRUCT_READ,
        vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw()
                | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
        ),
        vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        vk::ImageLayout::UNDEFINED,
    ),
    row(
        ResourceStates::ACCEL_STRUCT_WRITE,
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        vk::ImageLayout::UNDEFINED,
    ),
    row(
        ResourceStates::ACCEL_STRUCT_BUILD_INPUT,
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::SHADER_READ,
        vk::ImageLayout::UNDEFINED,
    ),
    row(
        ResourceStates::ACCEL_STRUCT_BUILD_BLAS,
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        vk::ImageLayout::UNDEFINED,
    ),
    row(
        ResourceStates::SHADING_RATE_SURFACE,
        vk::PipelineStageFlags2::FRAGMENT_SHADING_RATE_ATTACHMENT_KHR,
        vk::AccessFlags2::FRAGMENT_SHADING_RATE_ATTACHMENT_READ_KHR,
        vk::ImageLayout::FRAGMENT_SHADING_RATE_ATTACHMENT_OPTIMAL_KHR,
    ),
    // Micromap builds share the acceleration-structure build scope.
    row(
        ResourceStates::OPACITY_MICROMAP_WRITE,
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        vk::ImageLayout::UNDEFINED,
    ),
    row(
        ResourceStates::OPACITY_MICROMAP_BUILD_INPUT,
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::SHADER_READ,
        vk::ImageLayout::UNDEFINED,
    ),
];

/// Stage/access/layout for one abstract state mask. ORed state bits OR their
/// stage and access masks; the layout comes from the last matching row with a
/// defined layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VkStateMapping {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

pub(crate) fn map_resource_state(states: ResourceStates) -> VkStateMapping {
    if states == ResourceStates::COMMON {
        return VkStateMapping {
            stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            access: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::GENERAL,
        };
    }
    let mut mapping = VkStateMapping {
        stage: vk::PipelineStageFlags2::empty(),
        access: vk::AccessFlags2::empty(),
        layout: vk::ImageLayout::UNDEFINED,
    };
    for entry in STATE_MAPPINGS {
        if states.contains(entry.state) {
            mapping.stage |= entry.stage;
            mapping.access |= entry.access;
            if entry.layout != vk::ImageLayout::UNDEFINED {
                mapping.layout = entry.layout;
            }
        }
    }
    mapping
}

/// Legacy pipeline-stage flags for devices without synchronization-2. The
/// classic bits occupy the low 32 bits of the extended mask.
pub(crate) fn legacy_stage_flags(stage: vk::PipelineStageFlags2) -> vk::PipelineStageFlags {
    let mut flags = vk::PipelineStageFlags::from_raw(stage.as_raw() as u32);
    if flags.is_empty() {
        flags = vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    flags
}

pub(crate) fn legacy_access_flags(access: vk::AccessFlags2) -> vk::AccessFlags {
    vk::AccessFlags::from_raw(access.as_raw() as u32)
}

/// One classic barrier call carries a single src/dst stage pair. Returns the
/// index of the group for `(src, dst)`, appending a new key when the pair has
/// not been seen yet.
pub(crate) fn legacy_barrier_group(
    keys: &mut Vec<(vk::PipelineStageFlags2, vk::PipelineStageFlags2)>,
    src: vk::PipelineStageFlags2,
    dst: vk::PipelineStageFlags2,
) -> usize {
    if let Some(index) = keys.iter().position(|&(s, d)| s == src && d == dst) {
        index
    } else {
        keys.push((src, dst));
        keys.len() - 1
    }
}

/// Aspect flags a format's data occupies.
pub(crate) fn format_aspect_flags(format: Format) -> vk::ImageAspectFlags {
    let info = crate::format::format_info(format);
    let mut aspects = vk::ImageAspectFlags::empty();
    if info.has_depth {
        aspects |= vk::ImageAspectFlags::DEPTH;
    }
    if info.has_stencil {
        aspects |= vk::ImageAspectFlags::STENCIL;
    }
    if aspects.is_empty() {
        aspects = vk::ImageAspectFlags::COLOR;
    }
    aspects
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_states_or_their_masks() {
        let mapping = map_resource_state(
            ResourceStates::COPY_SOURCE | ResourceStates::SHADER_RESOURCE,
        );
        assert!(mapping.stage.contains(vk::PipelineStageFlags2::TRANSFER));
        assert!(mapping.access.contains(vk::AccessFlags2::TRANSFER_READ));
        assert!(mapping.access.contains(vk::AccessFlags2::SHADER_READ));
    }

    #[test]
    fn buffer_only_states_carry_no_layout() {
        let mapping = map_resource_state(ResourceStates::VERTEX_BUFFER);
        assert_eq!(mapping.layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(mapping.stage, vk::PipelineStageFlags2::VERTEX_INPUT);
    }

    #[test]
    fn barrier_groups_split_by_stage_pair() {
        let mut keys = Vec::new();
        let transfer = vk::PipelineStageFlags2::TRANSFER;
        let fragment = vk::PipelineStageFlags2::FRAGMENT_SHADER;
        let compute = vk::PipelineStageFlags2::COMPUTE_SHADER;

        let a = legacy_barrier_group(&mut keys, transfer, fragment);
        let b = legacy_barrier_group(&mut keys, compute, fragment);
        let c = legacy_barrier_group(&mut keys, transfer, fragment);
        assert_eq!(a, c);
        assert_ne!(a, b);
        // Reversed direction is its own group; stage masks never merge.
        let d = legacy_barrier_group(&mut keys, fragment, transfer);
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[d], (fragment, transfer));
    }

    #[test]
    fn depth_formats_report_their_aspects() {
        assert_eq!(
            format_aspect_flags(Format::D24UnormS8Uint),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            format_aspect_flags(Format::Rgba8Unorm),
            vk::ImageAspectFlags::COLOR
        );
    }
}
