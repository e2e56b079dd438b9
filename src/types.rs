use crate::format::Format;
use crate::traits::{
    AccelStructHandle, BindingLayoutHandle, BindingSetHandle, BufferHandle, FramebufferHandle,
    InputLayoutHandle, SamplerHandle, ShaderHandle, TextureHandle,
};
use bitflags::bitflags;
use std::hash::{Hash, Hasher};

#[cfg(feature = "kiln-serde")]
use serde::{Deserialize, Serialize};

/// Identifies which backend a device was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphicsApi {
    Vulkan,
    D3D11,
}

/// Submission queues exposed by a device. The implicit backend folds
/// everything into `Graphics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum QueueKind {
    #[default]
    Graphics = 0,
    Compute = 1,
    Copy = 2,
}

pub const MAX_QUEUES: usize = 3;

impl QueueKind {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(QueueKind::Graphics),
            1 => Some(QueueKind::Compute),
            2 => Some(QueueKind::Copy),
            _ => None,
        }
    }
}

bitflags! {
    /// Abstract resource states used by the automatic barrier machinery.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceStates: u32 {
        const COMMON                   = 0;
        const CONSTANT_BUFFER          = 1 << 0;
        const VERTEX_BUFFER            = 1 << 1;
        const INDEX_BUFFER             = 1 << 2;
        const INDIRECT_ARGUMENT        = 1 << 3;
        const SHADER_RESOURCE          = 1 << 4;
        const UNORDERED_ACCESS         = 1 << 5;
        const RENDER_TARGET            = 1 << 6;
        const DEPTH_WRITE              = 1 << 7;
        const DEPTH_READ               = 1 << 8;
        const STREAM_OUT               = 1 << 9;
        const COPY_DEST                = 1 << 10;
        const COPY_SOURCE              = 1 << 11;
        const RESOLVE_DEST             = 1 << 12;
        const RESOLVE_SOURCE           = 1 << 13;
        const PRESENT                  = 1 << 14;
        const ACCEL_STRUCT_READ        = 1 << 15;
        const ACCEL_STRUCT_WRITE       = 1 << 16;
        const ACCEL_STRUCT_BUILD_INPUT = 1 << 17;
        const ACCEL_STRUCT_BUILD_BLAS  = 1 << 18;
        const SHADING_RATE_SURFACE     = 1 << 19;
        const OPACITY_MICROMAP_WRITE   = 1 << 20;
        const OPACITY_MICROMAP_BUILD_INPUT = 1 << 21;
    }
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SHADER_RESOURCE     = 1 << 0;
        const RENDER_TARGET       = 1 << 1;
        const UNORDERED_ACCESS    = 1 << 2;
        const SHADING_RATE        = 1 << 3;
        const SHARED              = 1 << 4;
        const TYPELESS            = 1 << 5;
        const VIRTUAL             = 1 << 6;
    }
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX                  = 1 << 0;
        const INDEX                   = 1 << 1;
        const INDIRECT                = 1 << 2;
        const CONSTANT                = 1 << 3;
        const STRUCTURED              = 1 << 4;
        const RAW                     = 1 << 5;
        const TYPED_VIEW              = 1 << 6;
        const ACCEL_STRUCT_BUILD_INPUT = 1 << 7;
        const ACCEL_STRUCT_STORAGE    = 1 << 8;
        const SHADER_BINDING_TABLE    = 1 << 9;
        const SHARED                  = 1 << 10;
        const VIRTUAL                 = 1 << 11;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum TextureDimension {
    Texture1D,
    Texture1DArray,
    #[default]
    Texture2D,
    Texture2DArray,
    TextureCube,
    TextureCubeArray,
    Texture2DMS,
    Texture2DMSArray,
    Texture3D,
}

impl TextureDimension {
    pub fn is_array(self) -> bool {
        matches!(
            self,
            TextureDimension::Texture1DArray
                | TextureDimension::Texture2DArray
                | TextureDimension::TextureCube
                | TextureDimension::TextureCubeArray
                | TextureDimension::Texture2DMSArray
        )
    }

    pub fn is_multisampled(self) -> bool {
        matches!(
            self,
            TextureDimension::Texture2DMS | TextureDimension::Texture2DMSArray
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum CpuAccessMode {
    #[default]
    None,
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub debug_name: String,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub format: Format,
    pub usage: TextureUsage,
    pub initial_state: ResourceStates,
    pub keep_initial_state: bool,
    pub clear_value: Option<Color>,
    pub cpu_access: CpuAccessMode,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            dimension: TextureDimension::Texture2D,
            width: 1,
            height: 1,
            depth: 1,
            array_size: 1,
            mip_levels: 1,
            sample_count: 1,
            format: Format::Rgba8Unorm,
            usage: TextureUsage::SHADER_RESOURCE,
            initial_state: ResourceStates::COMMON,
            keep_initial_state: false,
            clear_value: None,
            cpu_access: CpuAccessMode::None,
        }
    }
}

pub const ALL_MIPS: u32 = u32::MAX;
pub const ALL_ARRAY_SLICES: u32 = u32::MAX;

/// A contiguous (mip, array-slice) window into a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct TextureSubresourceSet {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_array_slice: u32,
    pub array_slice_count: u32,
}

impl Default for TextureSubresourceSet {
    fn default() -> Self {
        Self::all()
    }
}

impl TextureSubresourceSet {
    pub fn all() -> Self {
        Self {
            base_mip: 0,
            mip_count: ALL_MIPS,
            base_array_slice: 0,
            array_slice_count: ALL_ARRAY_SLICES,
        }
    }

    pub fn single(mip: u32, array_slice: u32) -> Self {
        Self {
            base_mip: mip,
            mip_count: 1,
            base_array_slice: array_slice,
            array_slice_count: 1,
        }
    }

    /// Clamps the set against a texture's actual mip/slice counts.
    ///
    /// Render-target and depth-stencil views resolve with `single_mip`, so a
    /// whole-texture set collapses to the base mip only.
    pub fn resolve(&self, desc: &TextureDesc, single_mip: bool) -> Self {
        let base_mip = self.base_mip.min(desc.mip_levels.saturating_sub(1));
        let mip_count = if single_mip {
            1
        } else {
            self.mip_count.min(desc.mip_levels - base_mip)
        };
        let base_slice = self
            .base_array_slice
            .min(desc.array_size.saturating_sub(1));
        let slice_count = self.array_slice_count.min(desc.array_size - base_slice);
        Self {
            base_mip,
            mip_count,
            base_array_slice: base_slice,
            array_slice_count: slice_count,
        }
    }

    pub fn is_entire_texture(&self, desc: &TextureDesc) -> bool {
        self.base_mip == 0
            && self.base_array_slice == 0
            && (self.mip_count == ALL_MIPS || self.mip_count >= desc.mip_levels)
            && (self.array_slice_count == ALL_ARRAY_SLICES
                || self.array_slice_count >= desc.array_size)
    }
}

/// Aspect selection for views of combined depth/stencil formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum ViewAspect {
    #[default]
    AllAspects,
    DepthOnly,
    StencilOnly,
}

/// What a view will be used for. Keys the view caches together with the
/// subresource range and format/dimension overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum AccessIntent {
    ShaderResource,
    UnorderedAccess,
    RenderTarget,
    DepthStencil,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub debug_name: String,
    pub byte_size: u64,
    pub struct_stride: u32,
    pub format: Format,
    pub usage: BufferUsage,
    pub cpu_access: CpuAccessMode,
    pub initial_state: ResourceStates,
    pub keep_initial_state: bool,
    /// Volatile buffers are versioned per write; see the versioning module.
    pub is_volatile: bool,
    pub max_versions: u32,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            byte_size: 0,
            struct_stride: 0,
            format: Format::Unknown,
            usage: BufferUsage::empty(),
            cpu_access: CpuAccessMode::None,
            initial_state: ResourceStates::COMMON,
            keep_initial_state: false,
            is_volatile: false,
            max_versions: 0,
        }
    }
}

/// A byte window into a buffer. `WHOLE_SIZE` selects everything from
/// `byte_offset` to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct BufferRange {
    pub byte_offset: u64,
    pub byte_size: u64,
}

pub const WHOLE_SIZE: u64 = u64::MAX;

impl Default for BufferRange {
    fn default() -> Self {
        Self {
            byte_offset: 0,
            byte_size: WHOLE_SIZE,
        }
    }
}

impl BufferRange {
    pub fn new(byte_offset: u64, byte_size: u64) -> Self {
        Self {
            byte_offset,
            byte_size,
        }
    }

    pub fn resolve(&self, desc: &BufferDesc) -> Self {
        let offset = self.byte_offset.min(desc.byte_size);
        let size = if self.byte_size == WHOLE_SIZE {
            desc.byte_size - offset
        } else {
            self.byte_size.min(desc.byte_size - offset)
        };
        Self {
            byte_offset: offset,
            byte_size: size,
        }
    }

    pub fn is_entire_buffer(&self, desc: &BufferDesc) -> bool {
        self.byte_offset == 0 && (self.byte_size == WHOLE_SIZE || self.byte_size >= desc.byte_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum SamplerAddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
    MirrorClampToEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum SamplerReductionType {
    #[default]
    Standard,
    Comparison,
    Minimum,
    Maximum,
}

#[derive(Debug, Clone)]
pub struct SamplerDesc {
    pub debug_name: String,
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: Filter,
    pub address_u: SamplerAddressMode,
    pub address_v: SamplerAddressMode,
    pub address_w: SamplerAddressMode,
    pub max_anisotropy: f32,
    pub mip_bias: f32,
    pub border_color: Color,
    pub reduction_type: SamplerReductionType,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            mip_filter: Filter::Linear,
            address_u: SamplerAddressMode::ClampToEdge,
            address_v: SamplerAddressMode::ClampToEdge,
            address_w: SamplerAddressMode::ClampToEdge,
            max_anisotropy: 1.0,
            mip_bias: 0.0,
            border_color: Color::BLACK,
            reduction_type: SamplerReductionType::Standard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum ShaderStage {
    Vertex,
    Hull,
    Domain,
    Geometry,
    Pixel,
    Amplification,
    Mesh,
    Compute,
    RayGeneration,
    AnyHit,
    ClosestHit,
    Miss,
    Intersection,
    Callable,
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStageMask: u16 {
        const VERTEX        = 1 << 0;
        const HULL          = 1 << 1;
        const DOMAIN        = 1 << 2;
        const GEOMETRY      = 1 << 3;
        const PIXEL         = 1 << 4;
        const AMPLIFICATION = 1 << 5;
        const MESH          = 1 << 6;
        const COMPUTE       = 1 << 7;
        const RAY_GENERATION = 1 << 8;
        const ANY_HIT       = 1 << 9;
        const CLOSEST_HIT   = 1 << 10;
        const MISS          = 1 << 11;
        const INTERSECTION  = 1 << 12;
        const CALLABLE      = 1 << 13;
        const ALL_GRAPHICS = Self::VERTEX.bits() | Self::HULL.bits() | Self::DOMAIN.bits()
            | Self::GEOMETRY.bits() | Self::PIXEL.bits();
        const ALL_RAY_TRACING = Self::RAY_GENERATION.bits() | Self::ANY_HIT.bits()
            | Self::CLOSEST_HIT.bits() | Self::MISS.bits() | Self::INTERSECTION.bits()
            | Self::CALLABLE.bits();
    }
}

impl ShaderStage {
    pub fn mask(self) -> ShaderStageMask {
        match self {
            ShaderStage::Vertex => ShaderStageMask::VERTEX,
            ShaderStage::Hull => ShaderStageMask::HULL,
            ShaderStage::Domain => ShaderStageMask::DOMAIN,
            ShaderStage::Geometry => ShaderStageMask::GEOMETRY,
            ShaderStage::Pixel => ShaderStageMask::PIXEL,
            ShaderStage::Amplification => ShaderStageMask::AMPLIFICATION,
            ShaderStage::Mesh => ShaderStageMask::MESH,
            ShaderStage::Compute => ShaderStageMask::COMPUTE,
            ShaderStage::RayGeneration => ShaderStageMask::RAY_GENERATION,
            ShaderStage::AnyHit => ShaderStageMask::ANY_HIT,
            ShaderStage::ClosestHit => ShaderStageMask::CLOSEST_HIT,
            ShaderStage::Miss => ShaderStageMask::MISS,
            ShaderStage::Intersection => ShaderStageMask::INTERSECTION,
            ShaderStage::Callable => ShaderStageMask::CALLABLE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShaderDesc {
    pub debug_name: String,
    pub stage: ShaderStage,
    pub entry: String,
}

impl Default for ShaderDesc {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            stage: ShaderStage::Vertex,
            entry: "main".to_string(),
        }
    }
}

/// One `NAME=VALUE` pair selecting a shader permutation, and doubling as a
/// specialization-constant assignment on the explicit backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct ShaderConstant {
    pub name: String,
    pub value: String,
}

impl ShaderConstant {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VertexAttributeDesc {
    pub name: String,
    pub format: Format,
    pub array_size: u32,
    pub buffer_index: u32,
    pub offset: u32,
    /// Stride of one element in the source vertex buffer. Zero means
    /// tightly packed, computed from the attribute formats.
    pub element_stride: u32,
    pub is_instanced: bool,
}

impl Default for VertexAttributeDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            format: Format::Unknown,
            array_size: 1,
            buffer_index: 0,
            offset: 0,
            element_stride: 0,
            is_instanced: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Color = Color::new(0.0, 0.0, 0.0, 1.0);
    pub const TRANSPARENT: Color = Color::new(0.0, 0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::TRANSPARENT
    }
}

impl Hash for Color {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Preserve NaNs and -0.0 vs 0.0.
        self.r.to_bits().hash(state);
        self.g.to_bits().hash(state);
        self.b.to_bits().hash(state);
        self.a.to_bits().hash(state);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct Viewport {
    pub min_x: f32,
    pub max_x: f32,
    pub min_y: f32,
    pub max_y: f32,
    pub min_z: f32,
    pub max_z: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            min_x: 0.0,
            max_x: width,
            min_y: 0.0,
            max_y: height,
            min_z: 0.0,
            max_z: 1.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }
}

impl Hash for Viewport {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for v in [
            self.min_x, self.max_x, self.min_y, self.max_y, self.min_z, self.max_z,
        ] {
            v.to_bits().hash(state);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct Rect {
    pub min_x: i32,
    pub max_x: i32,
    pub min_y: i32,
    pub max_y: i32,
}

impl Rect {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            min_x: 0,
            max_x: width,
            min_y: 0,
            max_y: height,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Hash)]
pub struct ViewportState {
    pub viewports: Vec<Viewport>,
    pub scissors: Vec<Rect>,
}

impl ViewportState {
    pub fn single(viewport: Viewport) -> Self {
        let scissor = Rect {
            min_x: viewport.min_x as i32,
            max_x: viewport.max_x as i32,
            min_y: viewport.min_y as i32,
            max_y: viewport.max_y as i32,
        };
        Self {
            viewports: vec![viewport],
            scissors: vec![scissor],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum PrimitiveType {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
    TriangleListWithAdjacency,
    TriangleStripWithAdjacency,
    PatchList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum CullMode {
    #[default]
    Back,
    Front,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RasterState {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_counter_clockwise: bool,
    pub depth_clip_enable: bool,
    pub scissor_enable: bool,
    pub multisample_enable: bool,
    pub depth_bias: i32,
    pub depth_bias_clamp_bits: u32,
    pub slope_scaled_depth_bias_bits: u32,
    pub conservative_raster_enable: bool,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::Back,
            front_counter_clockwise: false,
            depth_clip_enable: true,
            scissor_enable: false,
            multisample_enable: false,
            depth_bias: 0,
            depth_bias_clamp_bits: 0f32.to_bits(),
            slope_scaled_depth_bias_bits: 0f32.to_bits(),
            conservative_raster_enable: false,
        }
    }
}

impl RasterState {
    pub fn depth_bias_clamp(&self) -> f32 {
        f32::from_bits(self.depth_bias_clamp_bits)
    }

    pub fn slope_scaled_depth_bias(&self) -> f32 {
        f32::from_bits(self.slope_scaled_depth_bias_bits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum BlendFactor {
    Zero,
    #[default]
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DstAlpha,
    InvDstAlpha,
    DstColor,
    InvDstColor,
    SrcAlphaSaturate,
    ConstantColor,
    InvConstantColor,
    Src1Color,
    InvSrc1Color,
    Src1Alpha,
    InvSrc1Alpha,
}

impl BlendFactor {
    /// Whether this factor reads the dynamic blend-constant color.
    pub fn uses_constant_color(self) -> bool {
        matches!(self, BlendFactor::ConstantColor | BlendFactor::InvConstantColor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorMask: u8 {
        const RED   = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE  = 1 << 2;
        const ALPHA = 1 << 3;
        const ALL   = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits() | Self::ALPHA.bits();
    }
}

impl Default for ColorMask {
    fn default() -> Self {
        ColorMask::ALL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetBlend {
    pub blend_enable: bool,
    pub src_blend: BlendFactor,
    pub dst_blend: BlendFactor,
    pub blend_op: BlendOp,
    pub src_blend_alpha: BlendFactor,
    pub dst_blend_alpha: BlendFactor,
    pub blend_op_alpha: BlendOp,
    pub color_write_mask: ColorMask,
}

impl Default for RenderTargetBlend {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_blend: BlendFactor::One,
            dst_blend: BlendFactor::Zero,
            blend_op: BlendOp::Add,
            src_blend_alpha: BlendFactor::One,
            dst_blend_alpha: BlendFactor::Zero,
            blend_op_alpha: BlendOp::Add,
            color_write_mask: ColorMask::ALL,
        }
    }
}

impl RenderTargetBlend {
    pub fn uses_constant_color(&self) -> bool {
        self.blend_enable
            && (self.src_blend.uses_constant_color()
                || self.dst_blend.uses_constant_color()
                || self.src_blend_alpha.uses_constant_color()
                || self.dst_blend_alpha.uses_constant_color())
    }
}

pub const MAX_RENDER_TARGETS: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub targets: [RenderTargetBlend; MAX_RENDER_TARGETS],
    pub alpha_to_coverage_enable: bool,
}

impl BlendState {
    pub fn uses_constant_color(&self, target_count: usize) -> bool {
        self.targets[..target_count.min(MAX_RENDER_TARGETS)]
            .iter()
            .any(RenderTargetBlend::uses_constant_color)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum ComparisonFunc {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    #[default]
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StencilOpDesc {
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub func: ComparisonFunc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_func: ComparisonFunc,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub stencil_ref_value: u8,
    /// When set, the stencil reference is supplied per draw through the
    /// graphics state rather than baked into the pipeline.
    pub dynamic_stencil_ref: bool,
    pub front_face: StencilOpDesc,
    pub back_face: StencilOpDesc,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test_enable: false,
            depth_write_enable: true,
            depth_func: ComparisonFunc::Less,
            stencil_enable: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
            stencil_ref_value: 0,
            dynamic_stencil_ref: false,
            front_face: StencilOpDesc::default(),
            back_face: StencilOpDesc::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Hash)]
pub struct RenderState {
    pub blend: BlendState,
    pub depth_stencil: DepthStencilState,
    pub raster: RasterState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum VariableShadingRate {
    #[default]
    E1x1,
    E1x2,
    E2x1,
    E2x2,
    E2x4,
    E4x2,
    E4x4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum ShadingRateCombiner {
    #[default]
    Passthrough,
    Override,
    Min,
    Max,
    ApplyRelative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VariableRateShadingState {
    pub enabled: bool,
    pub shading_rate: VariableShadingRate,
    pub pipeline_primitive_combiner: ShadingRateCombiner,
    pub image_combiner: ShadingRateCombiner,
}

#[derive(Clone)]
pub struct FramebufferAttachment {
    pub texture: TextureHandle,
    pub subresources: TextureSubresourceSet,
    pub format: Option<Format>,
    pub is_read_only: bool,
}

impl FramebufferAttachment {
    pub fn new(texture: TextureHandle) -> Self {
        Self {
            texture,
            subresources: TextureSubresourceSet::single(0, 0),
            format: None,
            is_read_only: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct FramebufferDesc {
    pub debug_name: String,
    pub color_attachments: Vec<FramebufferAttachment>,
    pub depth_attachment: Option<FramebufferAttachment>,
    pub shading_rate_attachment: Option<FramebufferAttachment>,
}

/// Render-target layout derived from a framebuffer; pipelines are created
/// against this, not against a live framebuffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FramebufferInfo {
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
}

#[derive(Clone, Default)]
pub struct GraphicsPipelineDesc {
    pub debug_name: String,
    pub primitive_type: PrimitiveType,
    pub patch_control_points: u32,
    pub input_layout: Option<InputLayoutHandle>,
    pub vertex_shader: Option<ShaderHandle>,
    pub hull_shader: Option<ShaderHandle>,
    pub domain_shader: Option<ShaderHandle>,
    pub geometry_shader: Option<ShaderHandle>,
    pub pixel_shader: Option<ShaderHandle>,
    pub render_state: RenderState,
    pub shading_rate_state: VariableRateShadingState,
    pub binding_layouts: Vec<BindingLayoutHandle>,
}

#[derive(Clone, Default)]
pub struct ComputePipelineDesc {
    pub debug_name: String,
    pub compute_shader: Option<ShaderHandle>,
    pub binding_layouts: Vec<BindingLayoutHandle>,
}

#[derive(Clone, Default)]
pub struct MeshPipelineDesc {
    pub debug_name: String,
    pub primitive_type: PrimitiveType,
    pub amplification_shader: Option<ShaderHandle>,
    pub mesh_shader: Option<ShaderHandle>,
    pub pixel_shader: Option<ShaderHandle>,
    pub render_state: RenderState,
    pub binding_layouts: Vec<BindingLayoutHandle>,
}

#[derive(Clone)]
pub struct RayTracingHitGroupDesc {
    pub export_name: String,
    pub closest_hit_shader: Option<ShaderHandle>,
    pub any_hit_shader: Option<ShaderHandle>,
    pub intersection_shader: Option<ShaderHandle>,
    pub is_procedural_primitive: bool,
}

#[derive(Clone)]
pub struct RayTracingShaderDesc {
    pub export_name: String,
    pub shader: ShaderHandle,
}

#[derive(Clone, Default)]
pub struct RayTracingPipelineDesc {
    pub debug_name: String,
    pub shaders: Vec<RayTracingShaderDesc>,
    pub hit_groups: Vec<RayTracingHitGroupDesc>,
    pub binding_layouts: Vec<BindingLayoutHandle>,
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub max_recursion_depth: u32,
}

/// Resource classes a binding-layout item can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum ResourceType {
    TextureSrv,
    TextureUav,
    TypedBufferSrv,
    TypedBufferUav,
    StructuredBufferSrv,
    StructuredBufferUav,
    RawBufferSrv,
    RawBufferUav,
    ConstantBuffer,
    VolatileConstantBuffer,
    Sampler,
    PushConstants,
    RayTracingAccelStruct,
}

impl ResourceType {
    /// The flat register class used for slot-offset adjustment. Mirrors the
    /// HLSL register namespaces t/u/b/s.
    pub fn register_class(self) -> RegisterClass {
        match self {
            ResourceType::TextureSrv
            | ResourceType::TypedBufferSrv
            | ResourceType::StructuredBufferSrv
            | ResourceType::RawBufferSrv
            | ResourceType::RayTracingAccelStruct => RegisterClass::ShaderResource,
            ResourceType::TextureUav
            | ResourceType::TypedBufferUav
            | ResourceType::StructuredBufferUav
            | ResourceType::RawBufferUav => RegisterClass::UnorderedAccess,
            ResourceType::ConstantBuffer
            | ResourceType::VolatileConstantBuffer
            | ResourceType::PushConstants => RegisterClass::ConstantBuffer,
            ResourceType::Sampler => RegisterClass::Sampler,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterClass {
    ShaderResource,
    UnorderedAccess,
    ConstantBuffer,
    Sampler,
}

pub const REGISTER_CLASS_COUNT: usize = 4;

impl RegisterClass {
    pub fn index(self) -> usize {
        match self {
            RegisterClass::ShaderResource => 0,
            RegisterClass::UnorderedAccess => 1,
            RegisterClass::ConstantBuffer => 2,
            RegisterClass::Sampler => 3,
        }
    }
}

/// Per-class slot shifts applied when baking a layout to the backend's flat
/// binding namespace. The defaults match the shader-compiler CLI's
/// `--vk-*-shift` defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct BindingOffsets {
    pub shader_resource: u32,
    pub sampler: u32,
    pub constant_buffer: u32,
    pub unordered_access: u32,
}

impl Default for BindingOffsets {
    fn default() -> Self {
        Self {
            shader_resource: 0,
            sampler: 128,
            constant_buffer: 256,
            unordered_access: 384,
        }
    }
}

impl BindingOffsets {
    pub fn offset_for(&self, class: RegisterClass) -> u32 {
        match class {
            RegisterClass::ShaderResource => self.shader_resource,
            RegisterClass::UnorderedAccess => self.unordered_access,
            RegisterClass::ConstantBuffer => self.constant_buffer,
            RegisterClass::Sampler => self.sampler,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct BindingLayoutItem {
    pub slot: u32,
    pub ty: ResourceType,
    /// Byte size for push constants, element count for arrays.
    pub size: u32,
}

impl BindingLayoutItem {
    pub fn texture_srv(slot: u32) -> Self {
        Self { slot, ty: ResourceType::TextureSrv, size: 1 }
    }

    pub fn texture_uav(slot: u32) -> Self {
        Self { slot, ty: ResourceType::TextureUav, size: 1 }
    }

    pub fn structured_buffer_srv(slot: u32) -> Self {
        Self { slot, ty: ResourceType::StructuredBufferSrv, size: 1 }
    }

    pub fn structured_buffer_uav(slot: u32) -> Self {
        Self { slot, ty: ResourceType::StructuredBufferUav, size: 1 }
    }

    pub fn constant_buffer(slot: u32) -> Self {
        Self { slot, ty: ResourceType::ConstantBuffer, size: 1 }
    }

    pub fn volatile_constant_buffer(slot: u32) -> Self {
        Self { slot, ty: ResourceType::VolatileConstantBuffer, size: 1 }
    }

    pub fn sampler(slot: u32) -> Self {
        Self { slot, ty: ResourceType::Sampler, size: 1 }
    }

    pub fn push_constants(slot: u32, byte_size: u32) -> Self {
        Self { slot, ty: ResourceType::PushConstants, size: byte_size }
    }

    pub fn accel_struct(slot: u32) -> Self {
        Self { slot, ty: ResourceType::RayTracingAccelStruct, size: 1 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BindingLayoutDesc {
    pub debug_name: String,
    pub visibility: ShaderStageMask,
    pub register_space: u32,
    /// When enabled, `register_space` selects the descriptor-set index on the
    /// explicit backend. All layouts of one pipeline must agree on this flag.
    pub register_space_is_descriptor_set: bool,
    pub bindings: Vec<BindingLayoutItem>,
    pub binding_offsets: BindingOffsets,
}

#[derive(Debug, Clone)]
pub struct BindlessLayoutDesc {
    pub debug_name: String,
    pub visibility: ShaderStageMask,
    pub first_slot: u32,
    pub max_capacity: u32,
    /// One large descriptor array per register space.
    pub register_spaces: Vec<BindingLayoutItem>,
}

impl Default for BindlessLayoutDesc {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            visibility: ShaderStageMask::empty(),
            first_slot: 0,
            max_capacity: 1024,
            register_spaces: Vec::new(),
        }
    }
}

/// A concrete resource bound at a layout slot.
#[derive(Clone)]
pub enum ResourceBinding {
    None,
    Texture {
        texture: TextureHandle,
        subresources: TextureSubresourceSet,
        format: Option<Format>,
        dimension: Option<TextureDimension>,
    },
    Buffer {
        buffer: BufferHandle,
        range: BufferRange,
        format: Option<Format>,
    },
    ConstantBuffer {
        buffer: BufferHandle,
        range: BufferRange,
    },
    Sampler(SamplerHandle),
    PushConstants {
        byte_size: u32,
    },
    AccelStruct(AccelStructHandle),
}

#[derive(Clone)]
pub struct BindingSetItem {
    pub slot: u32,
    pub ty: ResourceType,
    pub resource: ResourceBinding,
}

impl BindingSetItem {
    pub fn texture_srv(slot: u32, texture: TextureHandle) -> Self {
        Self {
            slot,
            ty: ResourceType::TextureSrv,
            resource: ResourceBinding::Texture {
                texture,
                subresources: TextureSubresourceSet::all(),
                format: None,
                dimension: None,
            },
        }
    }

    pub fn texture_uav(slot: u32, texture: TextureHandle) -> Self {
        Self {
            slot,
            ty: ResourceType::TextureUav,
            resource: ResourceBinding::Texture {
                texture,
                subresources: TextureSubresourceSet::single(0, 0),
                format: None,
                dimension: None,
            },
        }
    }

    pub fn structured_buffer_srv(slot: u32, buffer: BufferHandle) -> Self {
        Self {
            slot,
            ty: ResourceType::StructuredBufferSrv,
            resource: ResourceBinding::Buffer {
                buffer,
                range: BufferRange::default(),
                format: None,
            },
        }
    }

    pub fn structured_buffer_uav(slot: u32, buffer: BufferHandle) -> Self {
        Self {
            slot,
            ty: ResourceType::StructuredBufferUav,
            resource: ResourceBinding::Buffer {
                buffer,
                range: BufferRange::default(),
                format: None,
            },
        }
    }

    pub fn constant_buffer(slot: u32, buffer: BufferHandle) -> Self {
        let ty = if buffer.desc().is_volatile {
            ResourceType::VolatileConstantBuffer
        } else {
            ResourceType::ConstantBuffer
        };
        Self {
            slot,
            ty,
            resource: ResourceBinding::ConstantBuffer {
                buffer,
                range: BufferRange::default(),
            },
        }
    }

    pub fn sampler(slot: u32, sampler: SamplerHandle) -> Self {
        Self {
            slot,
            ty: ResourceType::Sampler,
            resource: ResourceBinding::Sampler(sampler),
        }
    }

    pub fn push_constants(slot: u32, byte_size: u32) -> Self {
        Self {
            slot,
            ty: ResourceType::PushConstants,
            resource: ResourceBinding::PushConstants { byte_size },
        }
    }

    pub fn accel_struct(slot: u32, accel: AccelStructHandle) -> Self {
        Self {
            slot,
            ty: ResourceType::RayTracingAccelStruct,
            resource: ResourceBinding::AccelStruct(accel),
        }
    }
}

#[derive(Clone)]
pub struct BindingSetDesc {
    pub debug_name: String,
    pub bindings: Vec<BindingSetItem>,
    /// When false, the set issues no automatic resource-state requests at
    /// bind time; the caller places states itself.
    pub track_liveness: bool,
}

impl Default for BindingSetDesc {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            bindings: Vec::new(),
            track_liveness: true,
        }
    }
}

#[derive(Clone)]
pub struct VertexBufferBinding {
    pub buffer: BufferHandle,
    pub slot: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum IndexFormat {
    U16,
    #[default]
    U32,
}

#[derive(Clone)]
pub struct IndexBufferBinding {
    pub buffer: BufferHandle,
    pub format: IndexFormat,
    pub offset: u64,
}

#[derive(Clone, Default)]
pub struct GraphicsState {
    pub pipeline: Option<crate::traits::GraphicsPipelineHandle>,
    pub framebuffer: Option<FramebufferHandle>,
    pub viewport: ViewportState,
    pub bindings: Vec<BindingSetHandle>,
    pub vertex_buffers: Vec<VertexBufferBinding>,
    pub index_buffer: Option<IndexBufferBinding>,
    pub indirect_params: Option<BufferHandle>,
    pub blend_constant_color: Color,
    pub dynamic_stencil_ref_value: u8,
    pub shading_rate_state: VariableRateShadingState,
}

#[derive(Clone, Default)]
pub struct ComputeState {
    pub pipeline: Option<crate::traits::ComputePipelineHandle>,
    pub bindings: Vec<BindingSetHandle>,
    pub indirect_params: Option<BufferHandle>,
}

#[derive(Clone, Default)]
pub struct MeshState {
    pub pipeline: Option<crate::traits::MeshPipelineHandle>,
    pub framebuffer: Option<FramebufferHandle>,
    pub viewport: ViewportState,
    pub bindings: Vec<BindingSetHandle>,
    pub blend_constant_color: Color,
}

#[derive(Clone, Default)]
pub struct RayTracingState {
    pub pipeline: Option<crate::traits::RayTracingPipelineHandle>,
    pub bindings: Vec<BindingSetHandle>,
    pub shader_table: Option<crate::traits::ShaderTableHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawArguments {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub start_index_location: u32,
    pub start_vertex_location: i32,
    pub start_instance_location: u32,
}

impl Default for DrawArguments {
    fn default() -> Self {
        Self {
            vertex_count: 0,
            instance_count: 1,
            start_index_location: 0,
            start_vertex_location: 0,
            start_instance_location: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchRaysArguments {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Default for DispatchRaysArguments {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            depth: 1,
        }
    }
}

/// Slice of a texture involved in a copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextureSlice {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    /// Zero means "to the end of the mip".
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_level: u32,
    pub array_slice: u32,
}

impl TextureSlice {
    pub fn resolve(&self, desc: &TextureDesc) -> Self {
        let mip_width = (desc.width >> self.mip_level).max(1);
        let mip_height = (desc.height >> self.mip_level).max(1);
        let mip_depth = (desc.depth >> self.mip_level).max(1);
        Self {
            width: if self.width == 0 { mip_width - self.x } else { self.width },
            height: if self.height == 0 { mip_height - self.y } else { self.height },
            depth: if self.depth == 0 { mip_depth - self.z } else { self.depth },
            ..*self
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandListParameters {
    pub queue_kind: QueueKind,
    /// Default size of one upload-manager chunk.
    pub upload_chunk_size: u64,
    /// Default size of one scratch-manager chunk.
    pub scratch_chunk_size: u64,
    /// Hard cap on total scratch memory a command list may hold.
    pub scratch_max_memory: u64,
    pub enable_auto_barriers: bool,
}

impl Default for CommandListParameters {
    fn default() -> Self {
        Self {
            queue_kind: QueueKind::Graphics,
            upload_chunk_size: 64 * 1024,
            scratch_chunk_size: 64 * 1024,
            scratch_max_memory: 1024 * 1024 * 1024,
            enable_auto_barriers: true,
        }
    }
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccelStructBuildFlags: u32 {
        const ALLOW_UPDATE      = 1 << 0;
        const ALLOW_COMPACTION  = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
        const MINIMIZE_MEMORY   = 1 << 4;
        const PERFORM_UPDATE    = 1 << 5;
    }
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GeometryFlags: u8 {
        const OPAQUE = 1 << 0;
        const NO_DUPLICATE_ANY_HIT = 1 << 1;
    }
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NON_OPAQUE = 1 << 3;
    }
}

#[derive(Clone)]
pub struct GeometryTriangles {
    pub index_buffer: Option<BufferHandle>,
    pub vertex_buffer: Option<BufferHandle>,
    pub index_format: IndexFormat,
    pub vertex_format: Format,
    pub index_offset: u64,
    pub vertex_offset: u64,
    pub index_count: u32,
    pub vertex_count: u32,
    pub vertex_stride: u32,
}

#[derive(Clone)]
pub struct GeometryAabbs {
    pub buffer: Option<BufferHandle>,
    pub offset: u64,
    pub count: u32,
    pub stride: u32,
}

#[derive(Clone)]
pub enum GeometryData {
    Triangles(GeometryTriangles),
    Aabbs(GeometryAabbs),
}

#[derive(Clone)]
pub struct GeometryDesc {
    pub data: GeometryData,
    pub flags: GeometryFlags,
}

/// One TLAS instance entry, laid out to match both backends' wire formats.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceDesc {
    pub transform: [f32; 12],
    /// Packed `instance_id:24 | mask:8`.
    pub instance_id_and_mask: u32,
    /// Packed `sbt_offset:24 | flags:8`.
    pub instance_offset_and_flags: u32,
    pub blas_device_address: u64,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        Self {
            transform: [
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0,
            ],
            instance_id_and_mask: 0xff << 24,
            instance_offset_and_flags: 0,
            blas_device_address: 0,
        }
    }
}

impl InstanceDesc {
    pub fn set_instance_id(&mut self, id: u32) {
        self.instance_id_and_mask = (self.instance_id_and_mask & 0xff00_0000) | (id & 0x00ff_ffff);
    }

    pub fn set_mask(&mut self, mask: u8) {
        self.instance_id_and_mask =
            (self.instance_id_and_mask & 0x00ff_ffff) | ((mask as u32) << 24);
    }

    pub fn set_flags(&mut self, flags: InstanceFlags) {
        self.instance_offset_and_flags =
            (self.instance_offset_and_flags & 0x00ff_ffff) | ((flags.bits() as u32) << 24);
    }
}

#[derive(Clone)]
pub struct AccelStructDesc {
    pub debug_name: String,
    pub is_top_level: bool,
    pub build_flags: AccelStructBuildFlags,
    /// Bottom-level only: the geometries the structure will be built from.
    pub geometries: Vec<GeometryDesc>,
    /// Top-level only: capacity for instances.
    pub max_instances: u32,
    pub is_virtual: bool,
}

impl Default for AccelStructDesc {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            is_top_level: false,
            build_flags: AccelStructBuildFlags::empty(),
            geometries: Vec::new(),
            max_instances: 0,
            is_virtual: false,
        }
    }
}

/// Optional capabilities a device may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    RayTracingAccelStruct,
    RayTracingPipeline,
    Meshlets,
    VariableRateShading,
    ConservativeRasterization,
    VirtualResources,
    ComputeQueue,
    CopyQueue,
    BufferDeviceAddress,
    Synchronization2,
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FormatSupport: u32 {
        const BUFFER         = 1 << 0;
        const VERTEX_BUFFER  = 1 << 1;
        const TEXTURE        = 1 << 2;
        const DEPTH_STENCIL  = 1 << 3;
        const RENDER_TARGET  = 1 << 4;
        const BLENDABLE      = 1 << 5;
        const SHADER_LOAD    = 1 << 6;
        const SHADER_SAMPLE  = 1 << 7;
        const SHADER_UAV_LOAD  = 1 << 8;
        const SHADER_UAV_STORE = 1 << 9;
        const SHADER_ATOMIC  = 1 << 10;
    }
}

/// Feature toggles requested at device creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceFeatures {
    pub ray_tracing: bool,
    pub mesh_shading: bool,
    pub buffer_device_address: bool,
    pub synchronization2: bool,
    pub variable_rate_shading: bool,
    pub conservative_raster: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subresource_set_resolves_whole_texture() {
        let desc = TextureDesc {
            mip_levels: 5,
            array_size: 3,
            ..Default::default()
        };
        let whole = TextureSubresourceSet::default().resolve(&desc, false);
        assert_eq!(whole.base_mip, 0);
        assert_eq!(whole.mip_count, 5);
        assert_eq!(whole.base_array_slice, 0);
        assert_eq!(whole.array_slice_count, 3);
        assert!(whole.is_entire_texture(&desc));
    }

    #[test]
    fn subresource_set_clamps_out_of_range() {
        let desc = TextureDesc {
            mip_levels: 4,
            array_size: 2,
            ..Default::default()
        };
        let set = TextureSubresourceSet {
            base_mip: 9,
            mip_count: 3,
            base_array_slice: 7,
            array_slice_count: 5,
        };
        let resolved = set.resolve(&desc, false);
        assert_eq!(resolved.base_mip, 3);
        assert_eq!(resolved.mip_count, 1);
        assert_eq!(resolved.base_array_slice, 1);
        assert_eq!(resolved.array_slice_count, 1);
    }

    #[test]
    fn render_target_views_collapse_to_one_mip() {
        let desc = TextureDesc {
            mip_levels: 6,
            ..Default::default()
        };
        let set = TextureSubresourceSet {
            base_mip: 2,
            mip_count: ALL_MIPS,
            ..Default::default()
        };
        let resolved = set.resolve(&desc, true);
        assert_eq!(resolved.base_mip, 2);
        assert_eq!(resolved.mip_count, 1);
    }

    #[test]
    fn buffer_range_resolves_whole_size() {
        let desc = BufferDesc {
            byte_size: 1024,
            ..Default::default()
        };
        let whole = BufferRange::default().resolve(&desc);
        assert_eq!(whole.byte_offset, 0);
        assert_eq!(whole.byte_size, 1024);
        assert!(whole.is_entire_buffer(&desc));

        let tail = BufferRange {
            byte_offset: 256,
            byte_size: WHOLE_SIZE,
        }
        .resolve(&desc);
        assert_eq!(tail.byte_size, 768);
        assert!(!tail.is_entire_buffer(&desc));
    }

    #[test]
    fn texture_slice_fills_mip_extent() {
        let desc = TextureDesc {
            width: 64,
            height: 32,
            depth: 1,
            mip_levels: 7,
            ..Default::default()
        };
        let slice = TextureSlice {
            mip_level: 3,
            ..Default::default()
        }
        .resolve(&desc);
        assert_eq!(slice.width, 8);
        assert_eq!(slice.height, 4);
        assert_eq!(slice.depth, 1);
    }

    #[test]
    fn blend_constants_detected_per_target() {
        let mut blend = BlendState::default();
        assert!(!blend.uses_constant_color(MAX_RENDER_TARGETS));

        blend.targets[2].blend_enable = true;
        blend.targets[2].src_blend = BlendFactor::ConstantColor;
        assert!(blend.uses_constant_color(3));
        // A draw that never binds target 2 does not need the constants.
        assert!(!blend.uses_constant_color(2));
    }

    #[test]
    fn instance_desc_packs_id_mask_and_flags() {
        let mut inst = InstanceDesc::default();
        assert_eq!(inst.instance_id_and_mask >> 24, 0xff);

        inst.set_instance_id(0x00ab_cdef);
        inst.set_mask(0x3c);
        inst.set_flags(InstanceFlags::TRIANGLE_CULL_DISABLE);
        assert_eq!(inst.instance_id_and_mask & 0x00ff_ffff, 0x00ab_cdef);
        assert_eq!(inst.instance_id_and_mask >> 24, 0x3c);
        assert_eq!(
            inst.instance_offset_and_flags >> 24,
            InstanceFlags::TRIANGLE_CULL_DISABLE.bits() as u32
        );
    }
}
