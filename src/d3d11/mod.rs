//! Implicit Direct3D 11 backend.
//!
//! Everything executes on the single immediate context; submission ids are
//! backed by a ring of event queries issued at each `execute_command_lists`.
//! Hazard tracking, queue selection and volatile-buffer versioning are all
//! driver concerns here, so the corresponding portions of the API surface
//! collapse to validation plus bookkeeping.

mod binding;
mod command_list;
mod convert;
mod pipeline;
mod resources;

use crate::error::{GpuError, MessageSink, Result};
use crate::format::{format_info, Format};
use crate::permutation::find_permutation_in_blob;
use crate::traits::*;
use crate::types::*;
use binding::{d3d11_buffer, D3D11BindingLayout, D3D11BindingSet};
use command_list::D3D11CommandList;
use convert::*;
use pipeline::{d3d11_texture, D3D11ComputePipeline, D3D11Framebuffer, D3D11GraphicsPipeline};
use resources::{
    D3D11Buffer, D3D11EventQuery, D3D11InputLayout, D3D11Sampler, D3D11Shader, D3D11Texture,
    D3D11TimerQuery,
};
use std::collections::{HashMap, VecDeque};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use windows::core::Interface;
use windows::Win32::Foundation::{BOOL, HMODULE};
use windows::Win32::Graphics::Direct3D::{D3D_DRIVER_TYPE_UNKNOWN, D3D_FEATURE_LEVEL_11_0};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::{CreateDXGIFactory1, IDXGIFactory1};

/// Largest `set_push_constants` payload; backs the shared scratch constant
/// buffer.
const PUSH_CONSTANT_CAPACITY: u32 = 128;

/// Parameters for [`D3D11Device::new`].
#[derive(Clone, Default)]
pub struct D3D11DeviceDesc {
    /// Index into the adapter enumeration; ignored when `existing_context`
    /// is given.
    pub adapter_index: usize,
    pub enable_validation: bool,
    /// Wrap an immediate context the application already owns instead of
    /// creating a fresh device.
    pub existing_context: Option<ID3D11DeviceContext>,
    pub message_callback: Option<crate::error::MessageCallback>,
}

struct SubmissionTracking {
    next_id: u64,
    last_finished: u64,
    /// Event queries issued at submission, oldest first.
    in_flight: VecDeque<(u64, ID3D11Query)>,
    free_queries: Vec<ID3D11Query>,
}

pub(crate) struct D3D11Context {
    pub(crate) device: ID3D11Device,
    pub(crate) immediate: Mutex<ID3D11DeviceContext>,
    pub(crate) annotation: Option<ID3DUserDefinedAnnotation>,
    pub(crate) messages: MessageSink,

    pub(crate) rasterizer_states: Mutex<HashMap<RasterState, ID3D11RasterizerState>>,
    pub(crate) blend_states: Mutex<HashMap<BlendState, ID3D11BlendState>>,
    pub(crate) depth_stencil_states: Mutex<HashMap<DepthStencilState, ID3D11DepthStencilState>>,

    /// Shared dynamic constant buffer, remapped with discard on every
    /// `set_push_constants`.
    pub(crate) push_constant_buffer: ID3D11Buffer,
    pub(crate) push_constant_capacity: u32,

    submissions: Mutex<SubmissionTracking>,
    pub(crate) device_lost: AtomicBool,
}

// The device interfaces are free threaded; the immediate context and every
// cache sit behind a Mutex.
unsafe impl Send for D3D11Context {}
unsafe impl Sync for D3D11Context {}

impl D3D11Context {
    fn mark_lost_on(&self, err: &GpuError) {
        if matches!(err, GpuError::DeviceLost) {
            self.device_lost.store(true, Ordering::Release);
            self.messages.error("device removed");
        }
    }

    fn create_event_query_object(&self) -> Result<ID3D11Query> {
        let desc = D3D11_QUERY_DESC {
            Query: D3D11_QUERY_EVENT,
            MiscFlags: 0,
        };
        let mut query = None;
        unsafe { self.device.CreateQuery(&desc, Some(&mut query)) }?;
        query.ok_or(GpuError::NotSupported("event query creation"))
    }

    /// Checks one event query; `true` once the GPU has passed it. The caller
    /// holds the immediate-context lock.
    fn event_done(&self, immediate: &ID3D11DeviceContext, query: &ID3D11Query) -> Result<bool> {
        let mut done = BOOL(0);
        let result = unsafe {
            immediate.GetData(
                query,
                Some(&mut done as *mut BOOL as *mut c_void),
                std::mem::size_of::<BOOL>() as u32,
                0,
            )
        };
        if let Err(err) = result {
            let err = GpuError::from(err);
            self.mark_lost_on(&err);
            return Err(err);
        }
        // S_FALSE leaves the output untouched.
        Ok(done.as_bool())
    }

    /// Pops finished submissions off the ring and recycles their queries.
    fn retire_submissions(&self) {
        let immediate = self.immediate.lock().unwrap();
        let mut subs = self.submissions.lock().unwrap();
        while let Some((id, query)) = subs.in_flight.front() {
            let id = *id;
            match self.event_done(&immediate, query) {
                Ok(true) => {
                    let (_, query) = subs.in_flight.pop_front().unwrap();
                    subs.last_finished = id;
                    subs.free_queries.push(query);
                }
                Ok(false) => break,
                Err(_) => break,
            }
        }
    }
}

macro_rules! downcast_fn {
    ($name:ident, $handle:ty, $concrete:ty, $what:literal) => {
        pub(crate) fn $name(handle: &$handle) -> Result<&$concrete> {
            handle
                .as_any()
                .downcast_ref::<$concrete>()
                .ok_or(GpuError::NotSupported($what))
        }
    };
}

downcast_fn!(
    d3d11_event_query,
    EventQueryHandle,
    D3D11EventQuery,
    "event query from another backend"
);
downcast_fn!(
    d3d11_timer_query,
    TimerQueryHandle,
    D3D11TimerQuery,
    "timer query from another backend"
);

/// Device over the implicit backend. Thin wrapper around the shared context
/// block that resources hold on to.
pub struct D3D11Device {
    context: Arc<D3D11Context>,
}

impl D3D11Device {
    pub fn new(desc: &D3D11DeviceDesc) -> Result<Self> {
        let (device, immediate) = match &desc.existing_context {
            Some(context) => {
                let device = unsafe {
                    let mut device = None;
                    context.GetDevice(Some(&mut device));
                    device
                }
                .ok_or(GpuError::NotSupported("context without a device"))?;
                (device, context.clone())
            }
            None => {
                let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }?;
                let adapter = unsafe { factory.EnumAdapters1(desc.adapter_index as u32) }
                    .map_err(|_| {
                        GpuError::InvalidArgument(format!(
                            "no adapter at index {}",
                            desc.adapter_index
                        ))
                    })?;
                let mut flags = D3D11_CREATE_DEVICE_FLAG(0);
                if desc.enable_validation {
                    flags |= D3D11_CREATE_DEVICE_DEBUG;
                }
                let levels = [D3D_FEATURE_LEVEL_11_0];
                let mut device = None;
                let mut immediate = None;
                unsafe {
                    D3D11CreateDevice(
                        &adapter,
                        D3D_DRIVER_TYPE_UNKNOWN,
                        HMODULE::default(),
                        flags,
                        Some(&levels),
                        D3D11_SDK_VERSION,
                        Some(&mut device),
                        None,
                        Some(&mut immediate),
                    )
                }?;
                let device = device.ok_or(GpuError::NotSupported("device creation"))?;
                let immediate = immediate.ok_or(GpuError::NotSupported("device creation"))?;
                (device, immediate)
            }
        };

        let annotation = immediate.cast::<ID3DUserDefinedAnnotation>().ok();

        let push_desc = D3D11_BUFFER_DESC {
            ByteWidth: PUSH_CONSTANT_CAPACITY.next_multiple_of(16).max(16),
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            MiscFlags: 0,
            StructureByteStride: 0,
        };
        let mut push_constant_buffer = None;
        unsafe { device.CreateBuffer(&push_desc, None, Some(&mut push_constant_buffer)) }?;
        let push_constant_buffer =
            push_constant_buffer.ok_or(GpuError::NotSupported("push constant scratch buffer"))?;

        Ok(Self {
            context: Arc::new(D3D11Context {
                device,
                immediate: Mutex::new(immediate),
                annotation,
                messages: MessageSink::new(desc.message_callback.clone()),
                rasterizer_states: Mutex::new(HashMap::new()),
                blend_states: Mutex::new(HashMap::new()),
                depth_stencil_states: Mutex::new(HashMap::new()),
                push_constant_buffer,
                push_constant_capacity: PUSH_CONSTANT_CAPACITY,
                submissions: Mutex::new(SubmissionTracking {
                    next_id: 0,
                    last_finished: 0,
                    in_flight: VecDeque::new(),
                    free_queries: Vec::new(),
                }),
                device_lost: AtomicBool::new(false),
            }),
        })
    }
}

fn texture_bind_flags(desc: &TextureDesc) -> u32 {
    let info = format_info(desc.format);
    let mut bind = 0u32;
    if desc.usage.contains(TextureUsage::SHADER_RESOURCE) {
        bind |= D3D11_BIND_SHADER_RESOURCE.0 as u32;
    }
    if desc.usage.contains(TextureUsage::RENDER_TARGET) {
        bind |= if info.has_depth || info.has_stencil {
            D3D11_BIND_DEPTH_STENCIL.0 as u32
        } else {
            D3D11_BIND_RENDER_TARGET.0 as u32
        };
    }
    if desc.usage.contains(TextureUsage::UNORDERED_ACCESS) {
        bind |= D3D11_BIND_UNORDERED_ACCESS.0 as u32;
    }
    bind
}

impl Device for D3D11Device {
    fn graphics_api(&self) -> GraphicsApi {
        GraphicsApi::D3D11
    }

    fn create_texture(&self, desc: TextureDesc) -> Result<TextureHandle> {
        if desc.usage.contains(TextureUsage::VIRTUAL) {
            return Err(GpuError::NotSupported(
                "virtual textures on the implicit backend",
            ));
        }
        if desc.usage.contains(TextureUsage::SHADING_RATE) {
            return Err(GpuError::NotSupported(
                "shading-rate surfaces on the implicit backend",
            ));
        }
        let info = format_info(desc.format);
        let staging = desc.cpu_access != CpuAccessMode::None;
        let usage = if staging {
            D3D11_USAGE_STAGING
        } else {
            D3D11_USAGE_DEFAULT
        };
        let bind_flags = if staging { 0 } else { texture_bind_flags(&desc) };
        let cpu_flags = match desc.cpu_access {
            CpuAccessMode::None => 0,
            CpuAccessMode::Read => D3D11_CPU_ACCESS_READ.0 as u32,
            CpuAccessMode::Write => D3D11_CPU_ACCESS_WRITE.0 as u32,
        };
        let mut misc_flags = 0u32;
        if matches!(
            desc.dimension,
            TextureDimension::TextureCube | TextureDimension::TextureCubeArray
        ) {
            misc_flags |= D3D11_RESOURCE_MISC_TEXTURECUBE.0 as u32;
        }
        let needs_typeless = desc.usage.contains(TextureUsage::SHADER_RESOURCE)
            && (info.has_depth || info.has_stencil);
        let format = dxgi_resource_format(desc.format, needs_typeless);

        let resource: ID3D11Resource = match desc.dimension {
            TextureDimension::Texture1D | TextureDimension::Texture1DArray => {
                let texture_desc = D3D11_TEXTURE1D_DESC {
                    Width: desc.width,
                    MipLevels: desc.mip_levels,
                    ArraySize: desc.array_size,
                    Format: format,
                    Usage: usage,
                    BindFlags: bind_flags,
                    CPUAccessFlags: cpu_flags,
                    MiscFlags: misc_flags,
                };
                let mut texture = None;
                unsafe {
                    self.context
                        .device
                        .CreateTexture1D(&texture_desc, None, Some(&mut texture))
                }?;
                texture
                    .ok_or(GpuError::NotSupported("texture creation"))?
                    .into()
            }
            TextureDimension::Texture3D => {
                let texture_desc = D3D11_TEXTURE3D_DESC {
                    Width: desc.width,
                    Height: desc.height,
                    Depth: desc.depth,
                    MipLevels: desc.mip_levels,
                    Format: format,
                    Usage: usage,
                    BindFlags: bind_flags,
                    CPUAccessFlags: cpu_flags,
                    MiscFlags: misc_flags,
                };
                let mut texture = None;
                unsafe {
                    self.context
                        .device
                        .CreateTexture3D(&texture_desc, None, Some(&mut texture))
                }?;
                texture
                    .ok_or(GpuError::NotSupported("texture creation"))?
                    .into()
            }
            _ => {
                let texture_desc = D3D11_TEXTURE2D_DESC {
                    Width: desc.width,
                    Height: desc.height,
                    MipLevels: desc.mip_levels,
                    ArraySize: desc.array_size,
                    Format: format,
                    SampleDesc: windows::Win32::Graphics::Dxgi::Common::DXGI_SAMPLE_DESC {
                        Count: desc.sample_count,
                        Quality: 0,
                    },
                    Usage: usage,
                    BindFlags: bind_flags,
                    CPUAccessFlags: cpu_flags,
                    MiscFlags: misc_flags,
                };
                let mut texture = None;
                unsafe {
                    self.context
                        .device
                        .CreateTexture2D(&texture_desc, None, Some(&mut texture))
                }?;
                texture
                    .ok_or(GpuError::NotSupported("texture creation"))?
                    .into()
            }
        };

        Ok(Arc::new(D3D11Texture {
            context: self.context.clone(),
            desc,
            resource,
            srvs: Mutex::new(HashMap::new()),
            rtvs: Mutex::new(HashMap::new()),
            dsvs: Mutex::new(HashMap::new()),
            uavs: Mutex::new(HashMap::new()),
            mapped_subresource: Mutex::new(None),
        }))
    }

    fn create_buffer(&self, desc: BufferDesc) -> Result<BufferHandle> {
        if desc.usage.intersects(
            BufferUsage::ACCEL_STRUCT_BUILD_INPUT
                | BufferUsage::ACCEL_STRUCT_STORAGE
                | BufferUsage::SHADER_BINDING_TABLE,
        ) {
            return Err(GpuError::NotSupported(
                "acceleration structures on the implicit backend",
            ));
        }
        if desc.usage.contains(BufferUsage::VIRTUAL) {
            return Err(GpuError::NotSupported(
                "virtual buffers on the implicit backend",
            ));
        }
        if desc.is_volatile && !desc.usage.contains(BufferUsage::CONSTANT) {
            return Err(GpuError::InvalidArgument(format!(
                "volatile buffer '{}' must have constant-buffer usage",
                desc.debug_name
            )));
        }

        let staging = desc.cpu_access == CpuAccessMode::Read;
        let dynamic = desc.is_volatile || desc.cpu_access == CpuAccessMode::Write;
        let mut bind_flags = 0u32;
        if !staging {
            if desc.usage.contains(BufferUsage::VERTEX) {
                bind_flags |= D3D11_BIND_VERTEX_BUFFER.0 as u32;
            }
            if desc.usage.contains(BufferUsage::INDEX) {
                bind_flags |= D3D11_BIND_INDEX_BUFFER.0 as u32;
            }
            if desc.usage.contains(BufferUsage::CONSTANT) {
                bind_flags |= D3D11_BIND_CONSTANT_BUFFER.0 as u32;
            }
            if desc.usage.intersects(
                BufferUsage::STRUCTURED | BufferUsage::RAW | BufferUsage::TYPED_VIEW,
            ) {
                bind_flags |= D3D11_BIND_SHADER_RESOURCE.0 as u32;
                if !dynamic {
                    bind_flags |= D3D11_BIND_UNORDERED_ACCESS.0 as u32;
                }
            }
        }
        let mut misc_flags = 0u32;
        if desc.usage.contains(BufferUsage::STRUCTURED) {
            misc_flags |= D3D11_RESOURCE_MISC_BUFFER_STRUCTURED.0 as u32;
        }
        if desc.usage.contains(BufferUsage::RAW) {
            misc_flags |= D3D11_RESOURCE_MISC_BUFFER_ALLOW_RAW_VIEWS.0 as u32;
        }
        if desc.usage.contains(BufferUsage::INDIRECT) {
            misc_flags |= D3D11_RESOURCE_MISC_DRAWINDIRECT_ARGS.0 as u32;
        }
        let usage = if staging {
            D3D11_USAGE_STAGING
        } else if dynamic {
            D3D11_USAGE_DYNAMIC
        } else {
            D3D11_USAGE_DEFAULT
        };
        let cpu_flags = if staging {
            (D3D11_CPU_ACCESS_READ.0 | D3D11_CPU_ACCESS_WRITE.0) as u32
        } else if dynamic {
            D3D11_CPU_ACCESS_WRITE.0 as u32
        } else {
            0
        };
        // Constant buffers round up to 16-byte multiples.
        let byte_width = if desc.usage.contains(BufferUsage::CONSTANT) {
            (desc.byte_size as u32).next_multiple_of(16)
        } else {
            desc.byte_size as u32
        };
        let buffer_desc = D3D11_BUFFER_DESC {
            ByteWidth: byte_width,
            Usage: usage,
            BindFlags: bind_flags,
            CPUAccessFlags: cpu_flags,
            MiscFlags: misc_flags,
            StructureByteStride: desc.struct_stride,
        };
        let mut buffer = None;
        unsafe {
            self.context
                .device
                .CreateBuffer(&buffer_desc, None, Some(&mut buffer))
        }?;
        let buffer = buffer.ok_or(GpuError::NotSupported("buffer creation"))?;
        Ok(Arc::new(D3D11Buffer {
            context: self.context.clone(),
            desc,
            buffer,
            srvs: Mutex::new(HashMap::new()),
            uavs: Mutex::new(HashMap::new()),
        }))
    }

    fn create_sampler(&self, desc: SamplerDesc) -> Result<SamplerHandle> {
        let sampler_desc = D3D11_SAMPLER_DESC {
            Filter: sampler_filter(&desc),
            AddressU: address_mode(desc.address_u),
            AddressV: address_mode(desc.address_v),
            AddressW: address_mode(desc.address_w),
            MipLODBias: desc.mip_bias,
            MaxAnisotropy: desc.max_anisotropy.max(1.0) as u32,
            ComparisonFunc: if desc.reduction_type == SamplerReductionType::Comparison {
                comparison_func(ComparisonFunc::Less)
            } else {
                comparison_func(ComparisonFunc::Never)
            },
            BorderColor: [
                desc.border_color.r,
                desc.border_color.g,
                desc.border_color.b,
                desc.border_color.a,
            ],
            MinLOD: 0.0,
            MaxLOD: f32::MAX,
        };
        let mut sampler = None;
        unsafe {
            self.context
                .device
                .CreateSamplerState(&sampler_desc, Some(&mut sampler))
        }?;
        let sampler = sampler.ok_or(GpuError::NotSupported("sampler creation"))?;
        Ok(Arc::new(D3D11Sampler { desc, sampler }))
    }

    fn create_shader(
        &self,
        desc: ShaderDesc,
        bytecode: &[u8],
        constants: &[ShaderConstant],
    ) -> Result<ShaderHandle> {
        let resolved = find_permutation_in_blob(bytecode, constants).ok_or_else(|| {
            self.context.messages.error(&format!(
                "shader '{}' has no permutation matching the requested constants",
                desc.debug_name
            ));
            GpuError::InvalidArgument(format!(
                "no matching shader permutation for '{}'",
                desc.debug_name
            ))
        })?;
        Ok(Arc::new(D3D11Shader::create(&self.context, desc, resolved)?))
    }

    fn create_input_layout(&self, attributes: &[VertexAttributeDesc]) -> Result<InputLayoutHandle> {
        Ok(Arc::new(D3D11InputLayout::create(attributes)?))
    }

    fn create_framebuffer(&self, desc: FramebufferDesc) -> Result<FramebufferHandle> {
        Ok(Arc::new(D3D11Framebuffer::create(desc)?))
    }

    fn create_graphics_pipeline(
        &self,
        desc: GraphicsPipelineDesc,
        framebuffer_info: &FramebufferInfo,
    ) -> Result<GraphicsPipelineHandle> {
        Ok(Arc::new(D3D11GraphicsPipeline::create(
            &self.context,
            desc,
            framebuffer_info,
        )?))
    }

    fn create_compute_pipeline(&self, desc: ComputePipelineDesc) -> Result<ComputePipelineHandle> {
        let shader = desc
            .compute_shader
            .as_ref()
            .ok_or_else(|| GpuError::InvalidArgument("compute pipeline without a shader".into()))?;
        if shader.desc().stage != ShaderStage::Compute {
            return Err(GpuError::InvalidArgument(format!(
                "shader '{}' is not a compute shader",
                shader.desc().debug_name
            )));
        }
        Ok(Arc::new(D3D11ComputePipeline { desc }))
    }

    fn create_mesh_pipeline(
        &self,
        _desc: MeshPipelineDesc,
        _framebuffer_info: &FramebufferInfo,
    ) -> Result<MeshPipelineHandle> {
        Err(GpuError::NotSupported("mesh shading on the implicit backend"))
    }

    fn create_ray_tracing_pipeline(
        &self,
        _desc: RayTracingPipelineDesc,
    ) -> Result<RayTracingPipelineHandle> {
        Err(GpuError::NotSupported("ray tracing on the implicit backend"))
    }

    fn create_binding_layout(&self, desc: BindingLayoutDesc) -> Result<BindingLayoutHandle> {
        Ok(Arc::new(D3D11BindingLayout { desc }))
    }

    fn create_bindless_layout(&self, _desc: BindlessLayoutDesc) -> Result<BindingLayoutHandle> {
        Err(GpuError::NotSupported(
            "bindless layouts on the implicit backend",
        ))
    }

    fn create_binding_set(
        &self,
        desc: BindingSetDesc,
        layout: &BindingLayoutHandle,
    ) -> Result<BindingSetHandle> {
        Ok(Arc::new(D3D11BindingSet::create(desc, layout)?))
    }

    fn create_descriptor_table(
        &self,
        _layout: &BindingLayoutHandle,
    ) -> Result<DescriptorTableHandle> {
        Err(GpuError::NotSupported(
            "descriptor tables on the implicit backend",
        ))
    }

    fn resize_descriptor_table(
        &self,
        _table: &DescriptorTableHandle,
        _new_size: u32,
        _keep_contents: bool,
    ) -> Result<()> {
        Err(GpuError::NotSupported(
            "descriptor tables on the implicit backend",
        ))
    }

    fn write_descriptor_table(
        &self,
        _table: &DescriptorTableHandle,
        _item: &BindingSetItem,
    ) -> Result<()> {
        Err(GpuError::NotSupported(
            "descriptor tables on the implicit backend",
        ))
    }

    fn create_event_query(&self) -> Result<EventQueryHandle> {
        let query = self.context.create_event_query_object()?;
        Ok(Arc::new(D3D11EventQuery {
            query,
            armed: Mutex::new(false),
        }))
    }

    fn set_event_query(&self, query: &EventQueryHandle, _queue: QueueKind) -> Result<()> {
        let query = d3d11_event_query(query)?;
        let immediate = self.context.immediate.lock().unwrap();
        unsafe { immediate.End(&query.query) };
        *query.armed.lock().unwrap() = true;
        Ok(())
    }

    fn poll_event_query(&self, query: &EventQueryHandle) -> Result<bool> {
        let query = d3d11_event_query(query)?;
        if !*query.armed.lock().unwrap() {
            return Ok(true);
        }
        let immediate = self.context.immediate.lock().unwrap();
        self.context.event_done(&immediate, &query.query)
    }

    fn wait_event_query(&self, query: &EventQueryHandle) -> Result<bool> {
        loop {
            match self.poll_event_query(query) {
                Ok(true) => return Ok(true),
                Ok(false) => std::thread::yield_now(),
                Err(GpuError::DeviceLost) => return Ok(false),
                Err(err) => return Err(err),
            }
        }
    }

    fn reset_event_query(&self, query: &EventQueryHandle) -> Result<()> {
        let query = d3d11_event_query(query)?;
        *query.armed.lock().unwrap() = false;
        Ok(())
    }

    fn create_timer_query(&self) -> Result<TimerQueryHandle> {
        let make = |kind| -> Result<ID3D11Query> {
            let desc = D3D11_QUERY_DESC {
                Query: kind,
                MiscFlags: 0,
            };
            let mut query = None;
            unsafe { self.context.device.CreateQuery(&desc, Some(&mut query)) }?;
            query.ok_or(GpuError::NotSupported("timer query creation"))
        };
        Ok(Arc::new(D3D11TimerQuery {
            disjoint: make(D3D11_QUERY_TIMESTAMP_DISJOINT)?,
            start: make(D3D11_QUERY_TIMESTAMP)?,
            end: make(D3D11_QUERY_TIMESTAMP)?,
            state: Mutex::new(Default::default()),
        }))
    }

    fn poll_timer_query(&self, query: &TimerQueryHandle) -> Result<bool> {
        let timer = d3d11_timer_query(query)?;
        let mut state = timer.state.lock().unwrap();
        if !state.started {
            return Err(GpuError::Misuse("timer query was never begun".into()));
        }
        if state.resolved {
            return Ok(true);
        }
        let immediate = self.context.immediate.lock().unwrap();
        // Frequency is never written as zero; it doubles as the "data was
        // produced" sentinel since S_FALSE leaves the output untouched.
        let mut disjoint = D3D11_QUERY_DATA_TIMESTAMP_DISJOINT::default();
        unsafe {
            immediate.GetData(
                &timer.disjoint,
                Some(&mut disjoint as *mut _ as *mut c_void),
                std::mem::size_of::<D3D11_QUERY_DATA_TIMESTAMP_DISJOINT>() as u32,
                0,
            )
        }?;
        if disjoint.Frequency == 0 {
            return Ok(false);
        }
        let mut begin = 0u64;
        let mut finish = 0u64;
        let mut got_begin = false;
        let mut got_finish = false;
        unsafe {
            immediate.GetData(
                &timer.start,
                Some(&mut begin as *mut u64 as *mut c_void),
                std::mem::size_of::<u64>() as u32,
                0,
            )
        }?;
        if begin != 0 {
            got_begin = true;
        }
        unsafe {
            immediate.GetData(
                &timer.end,
                Some(&mut finish as *mut u64 as *mut c_void),
                std::mem::size_of::<u64>() as u32,
                0,
            )
        }?;
        if finish != 0 {
            got_finish = true;
        }
        if !got_begin || !got_finish {
            return Ok(false);
        }
        state.time_seconds = if disjoint.Disjoint.as_bool() {
            0.0
        } else {
            finish.wrapping_sub(begin) as f32 / disjoint.Frequency as f32
        };
        state.resolved = true;
        Ok(true)
    }

    fn get_timer_query_time(&self, query: &TimerQueryHandle) -> Result<f32> {
        loop {
            if self.poll_timer_query(query)? {
                break;
            }
            std::thread::yield_now();
        }
        let timer = d3d11_timer_query(query)?;
        let state = timer.state.lock().unwrap();
        Ok(state.time_seconds)
    }

    fn reset_timer_query(&self, query: &TimerQueryHandle) -> Result<()> {
        let timer = d3d11_timer_query(query)?;
        *timer.state.lock().unwrap() = Default::default();
        Ok(())
    }

    fn create_accel_struct(&self, _desc: AccelStructDesc) -> Result<AccelStructHandle> {
        Err(GpuError::NotSupported(
            "acceleration structures on the implicit backend",
        ))
    }

    fn get_accel_struct_memory_requirements(&self, _desc: &AccelStructDesc) -> Result<u64> {
        Err(GpuError::NotSupported(
            "acceleration structures on the implicit backend",
        ))
    }

    fn create_heap(&self, _capacity: u64, _debug_name: &str) -> Result<HeapHandle> {
        Err(GpuError::NotSupported("heaps on the implicit backend"))
    }

    fn bind_buffer_memory(
        &self,
        _buffer: &BufferHandle,
        _heap: &HeapHandle,
        _offset: u64,
    ) -> Result<()> {
        Err(GpuError::NotSupported("heaps on the implicit backend"))
    }

    fn bind_texture_memory(
        &self,
        _texture: &TextureHandle,
        _heap: &HeapHandle,
        _offset: u64,
    ) -> Result<()> {
        Err(GpuError::NotSupported("heaps on the implicit backend"))
    }

    fn bind_accel_struct_memory(
        &self,
        _accel: &AccelStructHandle,
        _heap: &HeapHandle,
        _offset: u64,
    ) -> Result<()> {
        Err(GpuError::NotSupported("heaps on the implicit backend"))
    }

    fn map_buffer(&self, buffer: &BufferHandle, access: CpuAccessMode) -> Result<*mut u8> {
        let buffer = d3d11_buffer(buffer)?;
        let map_type = match access {
            CpuAccessMode::Read => D3D11_MAP_READ,
            CpuAccessMode::Write if buffer.desc.cpu_access == CpuAccessMode::Read => {
                D3D11_MAP_WRITE
            }
            CpuAccessMode::Write => D3D11_MAP_WRITE_DISCARD,
            CpuAccessMode::None => {
                return Err(GpuError::InvalidArgument(
                    "map access mode must be Read or Write".into(),
                ))
            }
        };
        let immediate = self.context.immediate.lock().unwrap();
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { immediate.Map(&buffer.buffer, 0, map_type, 0, Some(&mut mapped)) }?;
        Ok(mapped.pData as *mut u8)
    }

    fn unmap_buffer(&self, buffer: &BufferHandle) -> Result<()> {
        let buffer = d3d11_buffer(buffer)?;
        let immediate = self.context.immediate.lock().unwrap();
        unsafe { immediate.Unmap(&buffer.buffer, 0) };
        Ok(())
    }

    fn map_staging_texture(
        &self,
        texture: &TextureHandle,
        array_slice: u32,
        mip_level: u32,
        access: CpuAccessMode,
    ) -> Result<(*mut u8, u64)> {
        let texture = d3d11_texture(texture)?;
        if texture.desc.cpu_access == CpuAccessMode::None {
            return Err(GpuError::InvalidArgument(format!(
                "texture '{}' is not a staging texture",
                texture.desc.debug_name
            )));
        }
        let map_type = match access {
            CpuAccessMode::Read => D3D11_MAP_READ,
            CpuAccessMode::Write => D3D11_MAP_WRITE,
            CpuAccessMode::None => {
                return Err(GpuError::InvalidArgument(
                    "map access mode must be Read or Write".into(),
                ))
            }
        };
        let subresource = texture.subresource_index(mip_level, array_slice);
        let immediate = self.context.immediate.lock().unwrap();
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            immediate.Map(
                &texture.resource,
                subresource,
                map_type,
                0,
                Some(&mut mapped),
            )
        }?;
        *texture.mapped_subresource.lock().unwrap() = Some(subresource);
        Ok((mapped.pData as *mut u8, mapped.RowPitch as u64))
    }

    fn unmap_staging_texture(&self, texture: &TextureHandle) -> Result<()> {
        let texture = d3d11_texture(texture)?;
        let subresource = texture
            .mapped_subresource
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| GpuError::Misuse("staging texture is not mapped".into()))?;
        let immediate = self.context.immediate.lock().unwrap();
        unsafe { immediate.Unmap(&texture.resource, subresource) };
        Ok(())
    }

    fn create_command_list(&self, params: CommandListParameters) -> Result<CommandListHandle> {
        Ok(Box::new(D3D11CommandList::new(self.context.clone(), params)))
    }

    fn execute_command_lists(
        &self,
        lists: &mut [&mut dyn CommandList],
        _queue: QueueKind,
    ) -> Result<u64> {
        if self.context.device_lost.load(Ordering::Acquire) {
            return Err(GpuError::DeviceLost);
        }
        for list in lists.iter_mut() {
            let list = list
                .as_any_mut()
                .downcast_mut::<D3D11CommandList>()
                .ok_or(GpuError::NotSupported("command list from another backend"))?;
            if list.is_open() {
                return Err(GpuError::Misuse(
                    "command list must be closed before submission".into(),
                ));
            }
        }
        // Work already ran at record time; submission is a flush plus a
        // fence-equivalent event query.
        let query = {
            let mut subs = self.context.submissions.lock().unwrap();
            subs.free_queries.pop()
        };
        let query = match query {
            Some(query) => query,
            None => self.context.create_event_query_object()?,
        };
        let immediate = self.context.immediate.lock().unwrap();
        unsafe {
            immediate.End(&query);
            immediate.Flush();
        }
        let mut subs = self.context.submissions.lock().unwrap();
        subs.next_id += 1;
        let id = subs.next_id;
        subs.in_flight.push_back((id, query));
        Ok(id)
    }

    fn queue_wait_for_command_list(
        &self,
        _wait_queue: QueueKind,
        _exec_queue: QueueKind,
        _instance_id: u64,
    ) -> Result<()> {
        // All queue kinds fold into the one immediate context, which always
        // executes in submission order.
        Ok(())
    }

    fn wait_for_idle(&self) -> Result<bool> {
        if self.context.device_lost.load(Ordering::Acquire) {
            return Ok(false);
        }
        let query = self.context.create_event_query_object()?;
        {
            let immediate = self.context.immediate.lock().unwrap();
            unsafe {
                immediate.End(&query);
                immediate.Flush();
            }
        }
        loop {
            let immediate = self.context.immediate.lock().unwrap();
            match self.context.event_done(&immediate, &query) {
                Ok(true) => break,
                Ok(false) => {
                    drop(immediate);
                    std::thread::yield_now();
                }
                Err(GpuError::DeviceLost) => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        self.run_garbage_collection();
        Ok(true)
    }

    fn run_garbage_collection(&self) {
        self.context.retire_submissions();
    }

    fn query_feature_support(&self, _feature: Feature) -> bool {
        false
    }

    fn query_format_support(&self, format: Format) -> FormatSupport {
        let Ok(bits) = (unsafe { self.context.device.CheckFormatSupport(dxgi_format(format)) })
        else {
            return FormatSupport::empty();
        };
        let has = |flag: D3D11_FORMAT_SUPPORT| bits & flag.0 as u32 != 0;
        let mut support = FormatSupport::empty();
        if has(D3D11_FORMAT_SUPPORT_BUFFER) {
            support |= FormatSupport::BUFFER;
        }
        if has(D3D11_FORMAT_SUPPORT_IA_VERTEX_BUFFER) {
            support |= FormatSupport::VERTEX_BUFFER;
        }
        if has(D3D11_FORMAT_SUPPORT_TEXTURE2D) {
            support |= FormatSupport::TEXTURE;
        }
        if has(D3D11_FORMAT_SUPPORT_DEPTH_STENCIL) {
            support |= FormatSupport::DEPTH_STENCIL;
        }
        if has(D3D11_FORMAT_SUPPORT_RENDER_TARGET) {
            support |= FormatSupport::RENDER_TARGET;
        }
        if has(D3D11_FORMAT_SUPPORT_BLENDABLE) {
            support |= FormatSupport::BLENDABLE;
        }
        if has(D3D11_FORMAT_SUPPORT_SHADER_LOAD) {
            support |= FormatSupport::SHADER_LOAD;
        }
        if has(D3D11_FORMAT_SUPPORT_SHADER_SAMPLE) {
            support |= FormatSupport::SHADER_SAMPLE;
        }
        if has(D3D11_FORMAT_SUPPORT_TYPED_UNORDERED_ACCESS_VIEW) {
            support |= FormatSupport::SHADER_UAV_LOAD | FormatSupport::SHADER_UAV_STORE;
        }
        support
    }

    fn queue_last_finished_id(&self, _queue: QueueKind) -> u64 {
        self.context.retire_submissions();
        self.context.submissions.lock().unwrap().last_finished
    }
}
