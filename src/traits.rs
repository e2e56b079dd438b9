//! Trait-typed public API. Each backend module provides concrete
//! implementations; applications only see these traits plus the descriptor
//! types. Resources are held in `Arc` strong handles, and a command list
//! retains a strong reference to everything it records against until that
//! submission is observed complete.

use crate::error::Result;
use crate::format::Format;
use crate::types::*;
use std::any::Any;
use std::sync::Arc;

pub trait Resource: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

pub trait Texture: Resource {
    fn desc(&self) -> &TextureDesc;
}

pub trait Buffer: Resource {
    fn desc(&self) -> &BufferDesc;

    /// GPU virtual address, when the backend exposes one.
    fn device_address(&self) -> u64 {
        0
    }
}

pub trait Sampler: Resource {
    fn desc(&self) -> &SamplerDesc;
}

pub trait Shader: Resource {
    fn desc(&self) -> &ShaderDesc;

    /// Byte-identical source bytecode, on backends that retain it.
    fn bytecode(&self) -> Option<&[u8]>;

    /// Specialization constants this shader was created with, if any.
    fn constants(&self) -> &[ShaderConstant] {
        &[]
    }
}

pub trait InputLayout: Resource {
    fn attributes(&self) -> &[VertexAttributeDesc];
}

pub trait Framebuffer: Resource {
    fn desc(&self) -> &FramebufferDesc;
    fn info(&self) -> &FramebufferInfo;
}

pub trait GraphicsPipeline: Resource {
    fn desc(&self) -> &GraphicsPipelineDesc;
    fn framebuffer_info(&self) -> &FramebufferInfo;
    fn shader_mask(&self) -> ShaderStageMask;
}

pub trait ComputePipeline: Resource {
    fn desc(&self) -> &ComputePipelineDesc;
}

pub trait MeshPipeline: Resource {
    fn desc(&self) -> &MeshPipelineDesc;
    fn framebuffer_info(&self) -> &FramebufferInfo;
    fn shader_mask(&self) -> ShaderStageMask;
}

pub trait RayTracingPipeline: Resource {
    fn desc(&self) -> &RayTracingPipelineDesc;

    /// Creates a shader table bound to this pipeline.
    fn create_shader_table(&self) -> Result<ShaderTableHandle>;
}

/// Mutable dispatch table for ray tracing. Entries name exported shaders or
/// hit groups of the owning pipeline.
pub trait ShaderTable: Resource {
    fn set_ray_generation(&mut self, export_name: &str) -> Result<()>;
    fn add_miss_shader(&mut self, export_name: &str) -> Result<()>;
    fn add_hit_group(&mut self, export_name: &str) -> Result<()>;
    fn add_callable_shader(&mut self, export_name: &str) -> Result<()>;
    fn clear_miss_shaders(&mut self);
    fn clear_hit_groups(&mut self);
}

pub trait BindingLayout: Resource {
    fn desc(&self) -> Option<&BindingLayoutDesc>;
    fn bindless_desc(&self) -> Option<&BindlessLayoutDesc>;
}

pub trait BindingSet: Resource {
    fn desc(&self) -> &BindingSetDesc;
    fn layout(&self) -> &BindingLayoutHandle;
}

/// Bindless descriptor array; written in place, read lock-free by the GPU.
pub trait DescriptorTable: Resource {
    fn layout(&self) -> &BindingLayoutHandle;
    fn capacity(&self) -> u32;
}

pub trait EventQuery: Resource {}

pub trait TimerQuery: Resource {}

pub trait AccelStruct: Resource {
    fn desc(&self) -> &AccelStructDesc;
    fn device_address(&self) -> u64;
}

pub trait Heap: Resource {
    fn capacity(&self) -> u64;
}

pub type TextureHandle = Arc<dyn Texture>;
pub type BufferHandle = Arc<dyn Buffer>;
pub type SamplerHandle = Arc<dyn Sampler>;
pub type ShaderHandle = Arc<dyn Shader>;
pub type InputLayoutHandle = Arc<dyn InputLayout>;
pub type FramebufferHandle = Arc<dyn Framebuffer>;
pub type GraphicsPipelineHandle = Arc<dyn GraphicsPipeline>;
pub type ComputePipelineHandle = Arc<dyn ComputePipeline>;
pub type MeshPipelineHandle = Arc<dyn MeshPipeline>;
pub type RayTracingPipelineHandle = Arc<dyn RayTracingPipeline>;
pub type ShaderTableHandle = Arc<std::sync::Mutex<dyn ShaderTable>>;
pub type BindingLayoutHandle = Arc<dyn BindingLayout>;
pub type BindingSetHandle = Arc<dyn BindingSet>;
pub type DescriptorTableHandle = Arc<dyn DescriptorTable>;
pub type EventQueryHandle = Arc<dyn EventQuery>;
pub type TimerQueryHandle = Arc<dyn TimerQuery>;
pub type AccelStructHandle = Arc<dyn AccelStruct>;
pub type HeapHandle = Arc<dyn Heap>;
pub type DeviceHandle = Arc<dyn Device>;

/// Recorded GPU work. A command list is recorded from exactly one thread at
/// a time; distinct lists may be recorded concurrently.
pub trait CommandList: Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    /// Drops all cached pipeline/binding state without touching tracked
    /// resource states.
    fn clear_state(&mut self);

    fn clear_texture_float(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        color: Color,
    ) -> Result<()>;
    fn clear_texture_uint(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        value: u32,
    ) -> Result<()>;
    fn clear_depth_stencil_texture(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        depth: Option<f32>,
        stencil: Option<u8>,
    ) -> Result<()>;
    fn clear_buffer_uint(&mut self, buffer: &BufferHandle, value: u32) -> Result<()>;

    fn copy_texture(
        &mut self,
        dst: &TextureHandle,
        dst_slice: TextureSlice,
        src: &TextureHandle,
        src_slice: TextureSlice,
    ) -> Result<()>;
    fn resolve_texture(
        &mut self,
        dst: &TextureHandle,
        dst_subresources: TextureSubresourceSet,
        src: &TextureHandle,
        src_subresources: TextureSubresourceSet,
    ) -> Result<()>;
    fn write_texture(
        &mut self,
        dst: &TextureHandle,
        array_slice: u32,
        mip_level: u32,
        data: &[u8],
        row_pitch: u64,
    ) -> Result<()>;

    fn write_buffer(&mut self, buffer: &BufferHandle, data: &[u8], dst_offset: u64) -> Result<()>;
    fn copy_buffer(
        &mut self,
        dst: &BufferHandle,
        dst_offset: u64,
        src: &BufferHandle,
        src_offset: u64,
        byte_size: u64,
    ) -> Result<()>;

    fn set_push_constants(&mut self, data: &[u8]) -> Result<()>;

    fn set_graphics_state(&mut self, state: &GraphicsState) -> Result<()>;
    fn set_compute_state(&mut self, state: &ComputeState) -> Result<()>;
    fn set_mesh_state(&mut self, state: &MeshState) -> Result<()>;
    fn set_ray_tracing_state(&mut self, state: &RayTracingState) -> Result<()>;

    fn draw(&mut self, args: DrawArguments) -> Result<()>;
    fn draw_indexed(&mut self, args: DrawArguments) -> Result<()>;
    fn draw_indirect(&mut self, offset_bytes: u64, draw_count: u32) -> Result<()>;
    fn draw_indexed_indirect(&mut self, offset_bytes: u64, draw_count: u32) -> Result<()>;
    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()>;
    fn dispatch_indirect(&mut self, offset_bytes: u64) -> Result<()>;
    fn dispatch_mesh(&mut self, x: u32, y: u32, z: u32) -> Result<()>;
    fn dispatch_rays(&mut self, args: DispatchRaysArguments) -> Result<()>;

    fn build_bottom_level_accel_struct(
        &mut self,
        accel: &AccelStructHandle,
        geometries: &[GeometryDesc],
        build_flags: AccelStructBuildFlags,
    ) -> Result<()>;
    fn build_top_level_accel_struct(
        &mut self,
        accel: &AccelStructHandle,
        instances: &[InstanceDesc],
        build_flags: AccelStructBuildFlags,
    ) -> Result<()>;
    fn compact_bottom_level_accel_structs(&mut self) -> Result<()>;

    fn begin_timer_query(&mut self, query: &TimerQueryHandle) -> Result<()>;
    fn end_timer_query(&mut self, query: &TimerQueryHandle) -> Result<()>;
    fn begin_marker(&mut self, name: &str);
    fn end_marker(&mut self);

    fn set_enable_automatic_barriers(&mut self, enable: bool);
    fn set_resource_states_for_binding_set(&mut self, binding_set: &BindingSetHandle);
    fn begin_tracking_texture_state(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        state: ResourceStates,
    );
    fn begin_tracking_buffer_state(&mut self, buffer: &BufferHandle, state: ResourceStates);
    fn set_texture_state(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        state: ResourceStates,
    );
    fn set_buffer_state(&mut self, buffer: &BufferHandle, state: ResourceStates);
    fn set_permanent_texture_state(&mut self, texture: &TextureHandle, state: ResourceStates);
    fn set_permanent_buffer_state(&mut self, buffer: &BufferHandle, state: ResourceStates);
    fn set_enable_uav_barriers_for_texture(&mut self, texture: &TextureHandle, enable: bool);
    fn set_enable_uav_barriers_for_buffer(&mut self, buffer: &BufferHandle, enable: bool);
    fn commit_barriers(&mut self) -> Result<()>;
}

pub type CommandListHandle = Box<dyn CommandList>;

/// Factory and submission hub. All methods are callable concurrently from
/// multiple threads.
pub trait Device: Send + Sync {
    fn graphics_api(&self) -> GraphicsApi;

    fn create_texture(&self, desc: TextureDesc) -> Result<TextureHandle>;
    fn create_buffer(&self, desc: BufferDesc) -> Result<BufferHandle>;
    fn create_sampler(&self, desc: SamplerDesc) -> Result<SamplerHandle>;
    fn create_shader(
        &self,
        desc: ShaderDesc,
        bytecode: &[u8],
        constants: &[ShaderConstant],
    ) -> Result<ShaderHandle>;
    fn create_input_layout(&self, attributes: &[VertexAttributeDesc]) -> Result<InputLayoutHandle>;
    fn create_framebuffer(&self, desc: FramebufferDesc) -> Result<FramebufferHandle>;

    fn create_graphics_pipeline(
        &self,
        desc: GraphicsPipelineDesc,
        framebuffer_info: &FramebufferInfo,
    ) -> Result<GraphicsPipelineHandle>;
    fn create_compute_pipeline(&self, desc: ComputePipelineDesc) -> Result<ComputePipelineHandle>;
    fn create_mesh_pipeline(
        &self,
        desc: MeshPipelineDesc,
        framebuffer_info: &FramebufferInfo,
    ) -> Result<MeshPipelineHandle>;
    fn create_ray_tracing_pipeline(
        &self,
        desc: RayTracingPipelineDesc,
    ) -> Result<RayTracingPipelineHandle>;

    fn create_binding_layout(&self, desc: BindingLayoutDesc) -> Result<BindingLayoutHandle>;
    fn create_bindless_layout(&self, desc: BindlessLayoutDesc) -> Result<BindingLayoutHandle>;
    fn create_binding_set(
        &self,
        desc: BindingSetDesc,
        layout: &BindingLayoutHandle,
    ) -> Result<BindingSetHandle>;
    fn create_descriptor_table(&self, layout: &BindingLayoutHandle)
        -> Result<DescriptorTableHandle>;
    /// No-op when `new_size <= max_capacity`.
    fn resize_descriptor_table(
        &self,
        table: &DescriptorTableHandle,
        new_size: u32,
        keep_contents: bool,
    ) -> Result<()>;
    fn write_descriptor_table(&self, table: &DescriptorTableHandle, item: &BindingSetItem)
        -> Result<()>;

    fn create_event_query(&self) -> Result<EventQueryHandle>;
    fn set_event_query(&self, query: &EventQueryHandle, queue: QueueKind) -> Result<()>;
    fn poll_event_query(&self, query: &EventQueryHandle) -> Result<bool>;
    fn wait_event_query(&self, query: &EventQueryHandle) -> Result<bool>;
    fn reset_event_query(&self, query: &EventQueryHandle) -> Result<()>;

    fn create_timer_query(&self) -> Result<TimerQueryHandle>;
    fn poll_timer_query(&self, query: &TimerQueryHandle) -> Result<bool>;
    /// Seconds between the begin and end timestamps; blocks until available.
    fn get_timer_query_time(&self, query: &TimerQueryHandle) -> Result<f32>;
    fn reset_timer_query(&self, query: &TimerQueryHandle) -> Result<()>;

    fn create_accel_struct(&self, desc: AccelStructDesc) -> Result<AccelStructHandle>;
    fn get_accel_struct_memory_requirements(&self, desc: &AccelStructDesc) -> Result<u64>;

    fn create_heap(&self, capacity: u64, debug_name: &str) -> Result<HeapHandle>;
    fn bind_buffer_memory(&self, buffer: &BufferHandle, heap: &HeapHandle, offset: u64)
        -> Result<()>;
    fn bind_texture_memory(
        &self,
        texture: &TextureHandle,
        heap: &HeapHandle,
        offset: u64,
    ) -> Result<()>;
    fn bind_accel_struct_memory(
        &self,
        accel: &AccelStructHandle,
        heap: &HeapHandle,
        offset: u64,
    ) -> Result<()>;

    /// Maps a CPU-accessible buffer. The application must have synchronized
    /// with any prior GPU use.
    fn map_buffer(&self, buffer: &BufferHandle, access: CpuAccessMode) -> Result<*mut u8>;
    fn unmap_buffer(&self, buffer: &BufferHandle) -> Result<()>;
    fn map_staging_texture(
        &self,
        texture: &TextureHandle,
        array_slice: u32,
        mip_level: u32,
        access: CpuAccessMode,
    ) -> Result<(*mut u8, u64)>;
    fn unmap_staging_texture(&self, texture: &TextureHandle) -> Result<()>;

    fn create_command_list(&self, params: CommandListParameters) -> Result<CommandListHandle>;

    /// Submits the given closed command lists to `queue` and returns the new
    /// submission id.
    fn execute_command_lists(
        &self,
        lists: &mut [&mut dyn CommandList],
        queue: QueueKind,
    ) -> Result<u64>;

    /// Makes the next submission on `wait_queue` wait until `exec_queue`
    /// has finished submission `instance_id`.
    fn queue_wait_for_command_list(
        &self,
        wait_queue: QueueKind,
        exec_queue: QueueKind,
        instance_id: u64,
    ) -> Result<()>;

    /// Drains all queues. Returns `false` iff the device is lost.
    fn wait_for_idle(&self) -> Result<bool>;

    /// Retires completed submissions and recycles their command buffers and
    /// upload chunks.
    fn run_garbage_collection(&self);

    fn query_feature_support(&self, feature: Feature) -> bool;
    fn query_format_support(&self, format: Format) -> FormatSupport;

    /// Largest submission id known complete on `queue`.
    fn queue_last_finished_id(&self, queue: QueueKind) -> u64;
}

impl dyn Device {
    /// Convenience wrapper for submitting a single command list.
    pub fn execute_command_list(
        &self,
        list: &mut dyn CommandList,
        queue: QueueKind,
    ) -> Result<u64> {
        self.execute_command_lists(&mut [list], queue)
    }
}
