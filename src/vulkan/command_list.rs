//! Command list recording: the state machine over one Vulkan command
//! buffer, automatic barrier placement, upload/scratch suballocation, and
//! volatile constant-buffer versioning.

use super::accel;
use super::convert::{legacy_access_flags, legacy_stage_flags, map_resource_state};
use super::descriptor::VulkanBindingSet;
use super::pipeline::VulkanShaderTable;
use super::queue::{TrackedCommandBuffer, VulkanQueue};
use super::resources::{align_u64, VulkanTexture};
use super::DeviceShared;
use crate::binding::{compute_binding_diff, BindingSlotRanges, DiffableBinding};
use crate::error::{GpuError, Result};
use crate::format::format_info;
use crate::state_tracking::{ResourceStateTracker, TrackingId};
use crate::traits::{
    AccelStructHandle, BindingSetHandle, BufferHandle, CommandList, FramebufferHandle,
    TextureHandle, TimerQueryHandle,
};
use crate::types::*;
use crate::upload::{BufferChunk, ChunkAllocator, UploadManager};
use crate::versioning::make_version;
use ash::vk;
use std::any::Any;
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;
use vk_mem::Alloc;

/// One upload or scratch backing buffer. Host chunks stay mapped for their
/// whole lifetime.
pub(crate) struct ChunkBuffer {
    shared: Arc<DeviceShared>,
    pub buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
    pub mapped: *mut u8,
    pub address: u64,
}

unsafe impl Send for ChunkBuffer {}

impl ChunkBuffer {
    /// Copies `data` into the chunk and flushes it for device reads.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        debug_assert!(!self.mapped.is_null());
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mapped.add(offset as usize),
                data.len(),
            );
        }
        self.shared
            .allocator
            .flush_allocation(&self.allocation, offset as usize, data.len())?;
        Ok(())
    }
}

impl Drop for ChunkBuffer {
    fn drop(&mut self) {
        unsafe {
            self.shared
                .allocator
                .destroy_buffer(self.buffer, &mut self.allocation)
        };
    }
}

/// Creates chunk buffers for one upload manager.
pub(crate) struct ChunkFactory {
    shared: Arc<DeviceShared>,
    usage: vk::BufferUsageFlags,
    host_visible: bool,
}

impl ChunkAllocator for ChunkFactory {
    type Buffer = ChunkBuffer;

    fn create_chunk(&mut self, size: u64) -> Result<BufferChunk<ChunkBuffer>> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let create = vk_mem::AllocationCreateInfo {
            usage: if self.host_visible {
                vk_mem::MemoryUsage::AutoPreferHost
            } else {
                vk_mem::MemoryUsage::Auto
            },
            flags: if self.host_visible {
                vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };
        let (buffer, allocation) =
            unsafe { self.shared.allocator.create_buffer(&info, &create) }?;
        let alloc_info = self.shared.allocator.get_allocation_info(&allocation);
        let mapped = alloc_info.mapped_data as *mut u8;
        let address = if self
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            unsafe {
                self.shared.device.get_buffer_device_address(
                    &vk::BufferDeviceAddressInfo::builder().buffer(buffer),
                )
            }
        } else {
            0
        };
        Ok(BufferChunk::new(
            ChunkBuffer {
                shared: self.shared.clone(),
                buffer,
                allocation,
                mapped,
                address,
            },
            size,
        ))
    }
}

/// What commit_barriers needs to translate a texture barrier record.
struct TextureBarrierInfo {
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
    array_size: u32,
}

/// Binding-set view fed to the diff.
struct BoundSet {
    handle: BindingSetHandle,
    ranges: BindingSlotRanges,
}

impl DiffableBinding for BoundSet {
    fn identity(&self) -> usize {
        Arc::as_ptr(&self.handle) as *const () as usize
    }

    fn slot_ranges(&self) -> BindingSlotRanges {
        self.ranges
    }
}

fn same_handle<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum PipelineKind {
    Graphics,
    Compute,
    Mesh,
    RayTracing,
}

/// Layout metadata of the last bound pipeline, for push constants and
/// descriptor-set rebinds.
#[derive(Clone, Copy)]
struct ActiveLayout {
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    push_stages: vk::ShaderStageFlags,
    push_size: u32,
}

pub struct VulkanCommandList {
    shared: Arc<DeviceShared>,
    queue: Arc<VulkanQueue>,
    params: CommandListParameters,

    current: Option<TrackedCommandBuffer>,
    is_open: bool,
    recording_id: u64,
    recording_version: u64,

    tracker: ResourceStateTracker,
    auto_barriers: bool,
    texture_infos: HashMap<TrackingId, TextureBarrierInfo>,
    buffer_infos: HashMap<TrackingId, vk::Buffer>,

    upload: UploadManager<ChunkFactory>,
    scratch: UploadManager<ChunkFactory>,

    /// Every volatile version claimed by this recording, keyed by tracking
    /// id. The last version per buffer is the one draws bind; all of them
    /// must be promoted at submission or their tokens stay pending forever.
    volatile_versions: HashMap<TrackingId, (BufferHandle, Vec<u32>)>,
    /// Bumped on every volatile write; compared against the per-kind
    /// generation below to re-bind descriptor sets with fresh offsets.
    volatile_generation: u64,
    bound_generation: HashMap<PipelineKind, u64>,

    graphics: Option<GraphicsState>,
    compute: Option<ComputeState>,
    mesh: Option<MeshState>,
    ray_tracing: Option<RayTracingState>,
    active_layout: Option<ActiveLayout>,
    open_framebuffer: Option<FramebufferHandle>,

    sbt_regions: Option<[vk::StridedDeviceAddressRegionKHR; 4]>,
    sbt_version: u64,
}

// The raw pointers inside chunk buffers never leave this struct.
unsafe impl Send for VulkanCommandList {}

impl VulkanCommandList {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        queue: Arc<VulkanQueue>,
        params: CommandListParameters,
    ) -> Self {
        let mut upload_usage = vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER;
        if shared.features.buffer_device_address {
            upload_usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
        if shared.accel.is_some() {
            upload_usage |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        }
        if shared.ray_pipeline.is_some() {
            upload_usage |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
        }
        let upload = UploadManager::new(
            ChunkFactory {
                shared: shared.clone(),
                usage: upload_usage,
                host_visible: true,
            },
            params.upload_chunk_size,
            0,
        );
        let scratch = UploadManager::new(
            ChunkFactory {
                shared: shared.clone(),
                usage: vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                host_visible: false,
            },
            params.scratch_chunk_size,
            params.scratch_max_memory,
        );
        let auto_barriers = params.enable_auto_barriers;
        Self {
            tracker: ResourceStateTracker::new(shared.messages.clone()),
            shared,
            queue,
            params,
            current: None,
            is_open: false,
            recording_id: 0,
            recording_version: 0,
            auto_barriers,
            texture_infos: HashMap::new(),
            buffer_infos: HashMap::new(),
            upload,
            scratch,
            volatile_versions: HashMap::new(),
            volatile_generation: 0,
            bound_generation: HashMap::new(),
            graphics: None,
            compute: None,
            mesh: None,
            ray_tracing: None,
            active_layout: None,
            open_framebuffer: None,
            sbt_regions: None,
            sbt_version: 0,
        }
    }

    fn cmd(&self) -> Result<vk::CommandBuffer> {
        match (&self.current, self.is_open) {
            (Some(tracked), true) => Ok(tracked.buffer),
            _ => Err(GpuError::Misuse("command list is not open".into())),
        }
    }

    fn retain(&mut self, resource: impl Any + Send + Sync) {
        if let Some(tracked) = &mut self.current {
            tracked.referenced.push(Box::new(resource));
        }
    }

    /// Registers a texture with the tracker and the barrier-translation map.
    fn track_texture(&mut self, texture: &TextureHandle) -> Result<TrackingId> {
        let vk_texture = super::vk_texture(texture)?;
        let id = vk_texture.tracking;
        if !self.tracker.is_tracking_texture(id) && !self.tracker.is_tracking_buffer(id) {
            if vk_texture.is_staging() {
                // Staging textures are buffer-backed; track the buffer.
                self.tracker.begin_tracking_buffer(
                    id,
                    vk_texture.desc.initial_state,
                    vk_texture.desc.keep_initial_state,
                );
                self.buffer_infos
                    .insert(id, vk_texture.staging.as_ref().unwrap().buffer);
            } else {
                self.tracker.begin_tracking_texture(
                    id,
                    vk_texture.desc.mip_levels,
                    vk_texture.desc.array_size,
                    vk_texture.desc.initial_state,
                    vk_texture.desc.keep_initial_state,
                );
                self.texture_infos.insert(
                    id,
                    TextureBarrierInfo {
                        image: vk_texture.image,
                        aspect: super::convert::format_aspect_flags(vk_texture.desc.format),
                        mip_levels: vk_texture.desc.mip_levels,
                        array_size: vk_texture.desc.array_size,
                    },
                );
            }
            self.retain(texture.clone());
        }
        Ok(id)
    }

    fn track_buffer(&mut self, buffer: &BufferHandle) -> Result<TrackingId> {
        let vk_buffer = super::vk_buffer(buffer)?;
        let id = vk_buffer.tracking;
        if !self.tracker.is_tracking_buffer(id) {
            self.tracker.begin_tracking_buffer(
                id,
                vk_buffer.desc.initial_state,
                vk_buffer.desc.keep_initial_state,
            );
            self.buffer_infos.insert(id, vk_buffer.buffer);
            self.retain(buffer.clone());
        }
        Ok(id)
    }

    fn track_accel(&mut self, accel: &AccelStructHandle) -> Result<TrackingId> {
        let vk_accel = super::vk_accel_struct(accel)?;
        let id = vk_accel.tracking;
        if !self.tracker.is_tracking_buffer(id) {
            self.tracker
                .begin_tracking_buffer(id, ResourceStates::COMMON, false);
            self.buffer_infos.insert(id, vk_accel.buffer);
            self.retain(accel.clone());
        }
        Ok(id)
    }

    fn require_texture(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        state: ResourceStates,
    ) -> Result<()> {
        let id = self.track_texture(texture)?;
        if self.auto_barriers {
            if self.texture_infos.contains_key(&id) {
                self.tracker.require_texture_state(id, subresources, state);
            } else {
                self.tracker.require_buffer_state(id, state);
            }
        }
        Ok(())
    }

    fn require_buffer(&mut self, buffer: &BufferHandle, state: ResourceStates) -> Result<()> {
        let vk_buffer = super::vk_buffer(buffer)?;
        if vk_buffer.volatile.is_some() || vk_buffer.desc.cpu_access != CpuAccessMode::None {
            // Host-visible memory needs no barriers.
            self.retain(buffer.clone());
            return Ok(());
        }
        let id = self.track_buffer(buffer)?;
        if self.auto_barriers {
            self.tracker.require_buffer_state(id, state);
        }
        Ok(())
    }

    fn require_accel(&mut self, accel: &AccelStructHandle, state: ResourceStates) -> Result<()> {
        let id = self.track_accel(accel)?;
        if self.auto_barriers {
            self.tracker.require_buffer_state(id, state);
        }
        Ok(())
    }

    fn end_render_pass(&mut self) -> Result<()> {
        if self.open_framebuffer.is_some() {
            let cmd = self.cmd()?;
            unsafe { self.shared.device.cmd_end_render_pass(cmd) };
            self.open_framebuffer = None;
            // Raster state must be re-established inside a new pass.
            self.graphics = None;
            self.mesh = None;
        }
        Ok(())
    }

    fn upload_bytes(&mut self, data: &[u8], align: u64) -> Result<(vk::Buffer, u64, u64)> {
        let last_finished = self.shared.last_finished_snapshot();
        let sub = self
            .upload
            .suballocate(data.len() as u64, align, self.recording_version, &last_finished)?
            .ok_or(GpuError::OutOfSlots("upload memory"))?;
        let offset = sub.offset;
        sub.buffer.write(offset, data)?;
        Ok((sub.buffer.buffer, offset, sub.buffer.address + offset))
    }

    fn scratch_device_address(&mut self, size: u64, align: u64) -> Result<u64> {
        let last_finished = self.shared.last_finished_snapshot();
        let sub = self
            .scratch
            .suballocate(size, align, self.recording_version, &last_finished)?
            .ok_or(GpuError::OutOfSlots("scratch memory"))?;
        Ok(sub.buffer.address + sub.offset)
    }

    /// Dynamic offsets for a set's volatile constant buffers, in binding
    /// order. Every volatile buffer must have been written in this recording.
    fn volatile_offsets(&self, set: &VulkanBindingSet) -> Result<Vec<u32>> {
        let mut offsets = Vec::with_capacity(set.volatile_buffers.len());
        for buffer in &set.volatile_buffers {
            let vk_buffer = super::vk_buffer(buffer)?;
            let tracking = vk_buffer.tracking;
            let version = self
                .volatile_versions
                .get(&tracking)
                .and_then(|(_, versions)| versions.last().copied())
                .ok_or_else(|| {
                    GpuError::Misuse(format!(
                        "volatile buffer '{}' used before being written in this command list",
                        vk_buffer.desc.debug_name
                    ))
                })?;
            let stride = vk_buffer.volatile_tracking()?.aligned_version_size;
            offsets.push((version as u64 * stride) as u32);
        }
        Ok(offsets)
    }

    fn bind_one_set(&mut self, set_index: u32, handle: &BindingSetHandle) -> Result<()> {
        let layout = self
            .active_layout
            .ok_or_else(|| GpuError::Misuse("no pipeline bound".into()))?;
        let cmd = self.cmd()?;
        let vk_set = super::vk_binding_set(handle)?;
        let offsets = self.volatile_offsets(vk_set)?;
        unsafe {
            self.shared.device.cmd_bind_descriptor_sets(
                cmd,
                layout.bind_point,
                layout.layout,
                set_index,
                &[vk_set.set],
                &offsets,
            );
        }
        let volatile: Vec<BufferHandle> = vk_set.volatile_buffers.clone();
        self.retain(handle.clone());
        for buffer in volatile {
            self.retain(buffer);
        }
        Ok(())
    }

    /// Re-binds every set of the active state when a volatile write happened
    /// since the last bind, so draws see the freshly claimed versions.
    fn refresh_volatile_bindings(&mut self, kind: PipelineKind) -> Result<()> {
        if self.bound_generation.get(&kind).copied() == Some(self.volatile_generation) {
            return Ok(());
        }
        let bindings: Vec<BindingSetHandle> = match kind {
            PipelineKind::Graphics => {
                self.graphics.as_ref().map(|s| s.bindings.clone())
            }
            PipelineKind::Compute => self.compute.as_ref().map(|s| s.bindings.clone()),
            PipelineKind::Mesh => self.mesh.as_ref().map(|s| s.bindings.clone()),
            PipelineKind::RayTracing => {
                self.ray_tracing.as_ref().map(|s| s.bindings.clone())
            }
        }
        .ok_or_else(|| GpuError::Misuse("no state set for this draw or dispatch".into()))?;
        for (index, set) in bindings.iter().enumerate() {
            self.bind_one_set(index as u32, set)?;
        }
        self.bound_generation.insert(kind, self.volatile_generation);
        Ok(())
    }

    fn bind_changed_sets(
        &mut self,
        kind: PipelineKind,
        previous: &[BindingSetHandle],
        next: &[BindingSetHandle],
        allow_covered_unbind_elision: bool,
    ) -> Result<()> {
        let wrap = |sets: &[BindingSetHandle]| -> Result<Vec<Option<BoundSet>>> {
            sets.iter()
                .map(|s| {
                    Ok(Some(BoundSet {
                        handle: s.clone(),
                        ranges: super::vk_binding_set(s)?.slot_ranges,
                    }))
                })
                .collect()
        };
        let current = wrap(previous)?;
        let new = wrap(next)?;
        let diff = compute_binding_diff(&current, &new, allow_covered_unbind_elision);
        // Descriptor sets have no unbind on this backend; stale sets are
        // simply left bound and overwritten by the next bind at that index.
        for &index in &diff.to_bind {
            self.bind_one_set(index as u32, &next[index])?;
        }
        self.bound_generation.insert(kind, self.volatile_generation);
        Ok(())
    }

    fn require_binding_set_states(&mut self, set: &BindingSetHandle) -> Result<()> {
        let desc = set.desc().clone();
        for item in &desc.bindings {
            match (&item.resource, item.ty) {
                (ResourceBinding::Texture { texture, subresources, .. }, ty) => {
                    let state = if ty == ResourceType::TextureUav {
                        ResourceStates::UNORDERED_ACCESS
                    } else {
                        ResourceStates::SHADER_RESOURCE
                    };
                    self.require_texture(texture, *subresources, state)?;
                }
                (ResourceBinding::Buffer { buffer, .. }, ty) => {
                    let state = match ty.register_class() {
                        RegisterClass::UnorderedAccess => ResourceStates::UNORDERED_ACCESS,
                        _ => ResourceStates::SHADER_RESOURCE,
                    };
                    self.require_buffer(buffer, state)?;
                }
                (ResourceBinding::ConstantBuffer { buffer, .. }, _) => {
                    self.require_buffer(buffer, ResourceStates::CONSTANT_BUFFER)?;
                }
                (ResourceBinding::AccelStruct(accel), _) => {
                    self.require_accel(accel, ResourceStates::ACCEL_STRUCT_READ)?;
                }
                (ResourceBinding::Sampler(sampler), _) => {
                    self.retain(sampler.clone());
                }
                (ResourceBinding::PushConstants { .. }, _) | (ResourceBinding::None, _) => {}
            }
        }
        Ok(())
    }

    /// Uploads the shader table's group handles and records the four strided
    /// regions for `dispatch_rays`.
    fn build_shader_table(&mut self, table: &crate::traits::ShaderTableHandle) -> Result<()> {
        let guard = table.lock().unwrap();
        let vk_table = guard
            .as_any()
            .downcast_ref::<VulkanShaderTable>()
            .ok_or_else(|| GpuError::InvalidArgument("foreign shader table".into()))?;
        let raygen = vk_table.ray_generation.ok_or_else(|| {
            GpuError::Misuse("shader table has no ray generation entry".into())
        })?;

        let props = &self.shared.rt_properties;
        let stride = align_u64(
            props.shader_group_handle_size as u64,
            props.shader_group_handle_alignment as u64,
        );
        let base_align = props.shader_group_base_alignment as u64;

        let sections: [&[u32]; 4] = [
            std::slice::from_ref(&raygen),
            &vk_table.miss,
            &vk_table.hit_groups,
            &vk_table.callable,
        ];
        let mut blob = Vec::new();
        let mut section_offsets = [0u64; 4];
        for (i, groups) in sections.iter().enumerate() {
            let aligned = align_u64(blob.len() as u64, base_align) as usize;
            blob.resize(aligned, 0);
            section_offsets[i] = aligned as u64;
            for &group in groups.iter() {
                let handle = vk_table.handle_bytes(group);
                let entry_start = blob.len();
                blob.extend_from_slice(handle);
                blob.resize(entry_start + stride as usize, 0);
            }
        }
        let section_sizes = [
            stride,
            vk_table.miss.len() as u64 * stride,
            vk_table.hit_groups.len() as u64 * stride,
            vk_table.callable.len() as u64 * stride,
        ];
        let version = vk_table.version;
        drop(guard);

        let (_, _, base_address) = self.upload_bytes(&blob, base_align)?;
        let region = |offset: u64, size: u64| vk::StridedDeviceAddressRegionKHR {
            device_address: if size == 0 { 0 } else { base_address + offset },
            stride,
            size,
        };
        self.sbt_regions = Some([
            region(section_offsets[0], section_sizes[0]),
            region(section_offsets[1], section_sizes[1]),
            region(section_offsets[2], section_sizes[2]),
            region(section_offsets[3], section_sizes[3]),
        ]);
        self.sbt_version = version;
        Ok(())
    }

    /// Byte offset of `(x, y, z)` inside a staging texture subresource, plus
    /// the buffer row length and image height to describe the full mip.
    fn staging_copy_layout(
        texture: &VulkanTexture,
        slice: &TextureSlice,
    ) -> Result<(u64, u32, u32)> {
        let (base, _) = texture.staging_region(slice.array_slice, slice.mip_level)?;
        let info = format_info(texture.desc.format);
        let bs = info.block_size as u32;
        let mip_width = (texture.desc.width >> slice.mip_level).max(1);
        let mip_height = (texture.desc.height >> slice.mip_level).max(1);
        let blocks_x = (mip_width + bs - 1) / bs;
        let blocks_y = (mip_height + bs - 1) / bs;
        let row_pitch = blocks_x as u64 * info.bytes_per_block as u64;
        let slice_pitch = row_pitch * blocks_y as u64;
        let offset = base
            + slice.z as u64 * slice_pitch
            + (slice.y / bs) as u64 * row_pitch
            + (slice.x / bs) as u64 * info.bytes_per_block as u64;
        Ok((offset, blocks_x * bs, blocks_y * bs))
    }

    fn image_layers(texture: &VulkanTexture, slice: &TextureSlice) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: super::convert::format_aspect_flags(texture.desc.format),
            mip_level: slice.mip_level,
            base_array_layer: slice.array_slice,
            layer_count: 1,
        }
    }

    // Called by the device once this list's command buffer is handed to the
    // queue: promotes upload chunks and volatile versions to submitted.
    pub(crate) fn take_for_submission(&mut self) -> Result<TrackedCommandBuffer> {
        if self.is_open {
            return Err(GpuError::Misuse(
                "command list must be closed before execution".into(),
            ));
        }
        self.current
            .take()
            .ok_or_else(|| GpuError::Misuse("command list has not recorded anything".into()))
    }

    pub(crate) fn submitted(&mut self, submission_id: u64) {
        let queue = self.params.queue_kind;
        self.upload
            .submit_chunks(queue, self.recording_id, submission_id);
        self.scratch
            .submit_chunks(queue, self.recording_id, submission_id);
        for (buffer, versions) in self.volatile_versions.values() {
            if let Ok(vk_buffer) = super::vk_buffer(buffer) {
                if let Some(volatile) = &vk_buffer.volatile {
                    for version in versions {
                        volatile.versions.mark_submitted(
                            *version,
                            queue,
                            self.recording_id,
                            submission_id,
                        );
                    }
                }
            }
        }
        self.volatile_versions.clear();
    }

    pub(crate) fn queue_kind(&self) -> QueueKind {
        self.params.queue_kind
    }
}

impl CommandList for VulkanCommandList {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn open(&mut self) -> Result<()> {
        if self.is_open {
            return Err(GpuError::Misuse("command list is already open".into()));
        }
        if self.current.is_some() {
            return Err(GpuError::Misuse(
                "command list was closed but never executed".into(),
            ));
        }
        let mut tracked = self.queue.acquire_command_buffer()?;
        unsafe {
            self.shared.device.begin_command_buffer(
                tracked.buffer,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )
        }?;
        self.recording_id = self.queue.next_recording_id();
        tracked.recording_id = self.recording_id;
        self.recording_version =
            make_version(self.recording_id, self.params.queue_kind, false);
        self.current = Some(tracked);
        self.is_open = true;
        self.tracker.reset();
        self.texture_infos.clear();
        self.buffer_infos.clear();
        self.volatile_versions.clear();
        self.bound_generation.clear();
        self.auto_barriers = self.params.enable_auto_barriers;
        self.clear_state();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let cmd = self.cmd()?;
        self.end_render_pass()?;
        self.tracker.restore_initial_states();
        self.commit_barriers()?;
        unsafe { self.shared.device.end_command_buffer(cmd) }?;
        self.is_open = false;
        self.clear_state();
        Ok(())
    }

    fn clear_state(&mut self) {
        // Tracked resource states survive; only bound state is dropped.
        if self.open_framebuffer.is_some() {
            if let Ok(cmd) = self.cmd() {
                unsafe { self.shared.device.cmd_end_render_pass(cmd) };
            }
            self.open_framebuffer = None;
        }
        self.graphics = None;
        self.compute = None;
        self.mesh = None;
        self.ray_tracing = None;
        self.active_layout = None;
        self.sbt_regions = None;
        self.bound_generation.clear();
    }

    fn clear_texture_float(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        color: Color,
    ) -> Result<()> {
        self.end_render_pass()?;
        self.require_texture(texture, subresources, ResourceStates::COPY_DEST)?;
        self.commit_barriers()?;
        let cmd = self.cmd()?;
        let vk_texture = super::vk_texture(texture)?;
        let range = vk_texture.subresource_range(subresources);
        unsafe {
            self.shared.device.cmd_clear_color_image(
                cmd,
                vk_texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue {
                    float32: [color.r, color.g, color.b, color.a],
                },
                &[range],
            );
        }
        Ok(())
    }

    fn clear_texture_uint(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        value: u32,
    ) -> Result<()> {
        self.end_render_pass()?;
        self.require_texture(texture, subresources, ResourceStates::COPY_DEST)?;
        self.commit_barriers()?;
        let cmd = self.cmd()?;
        let vk_texture = super::vk_texture(texture)?;
        let range = vk_texture.subresource_range(subresources);
        unsafe {
            self.shared.device.cmd_clear_color_image(
                cmd,
                vk_texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { uint32: [value; 4] },
                &[range],
            );
        }
        Ok(())
    }

    fn clear_depth_stencil_texture(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        depth: Option<f32>,
        stencil: Option<u8>,
    ) -> Result<()> {
        if depth.is_none() && stencil.is_none() {
            return Ok(());
        }
        self.end_render_pass()?;
        self.require_texture(texture, subresources, ResourceStates::COPY_DEST)?;
        self.commit_barriers()?;
        let cmd = self.cmd()?;
        let vk_texture = super::vk_texture(texture)?;
        let mut range = vk_texture.subresource_range(subresources);
        let mut aspect = vk::ImageAspectFlags::empty();
        if depth.is_some() {
            aspect |= vk::ImageAspectFlags::DEPTH;
        }
        if stencil.is_some() {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }
        range.aspect_mask &= aspect;
        unsafe {
            self.shared.device.cmd_clear_depth_stencil_image(
                cmd,
                vk_texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearDepthStencilValue {
                    depth: depth.unwrap_or(0.0),
                    stencil: stencil.unwrap_or(0) as u32,
                },
                &[range],
            );
        }
        Ok(())
    }

    fn clear_buffer_uint(&mut self, buffer: &BufferHandle, value: u32) -> Result<()> {
        self.end_render_pass()?;
        self.require_buffer(buffer, ResourceStates::COPY_DEST)?;
        self.commit_barriers()?;
        let cmd = self.cmd()?;
        let vk_buffer = super::vk_buffer(buffer)?;
        unsafe {
            self.shared
                .device
                .cmd_fill_buffer(cmd, vk_buffer.buffer, 0, vk::WHOLE_SIZE, value);
        }
        Ok(())
    }

    fn copy_texture(
        &mut self,
        dst: &TextureHandle,
        dst_slice: TextureSlice,
        src: &TextureHandle,
        src_slice: TextureSlice,
    ) -> Result<()> {
        self.end_render_pass()?;
        let src_staging = super::vk_texture(src)?.is_staging();
        let dst_staging = super::vk_texture(dst)?.is_staging();

        self.require_texture(
            src,
            TextureSubresourceSet::single(src_slice.mip_level, src_slice.array_slice),
            ResourceStates::COPY_SOURCE,
        )?;
        self.require_texture(
            dst,
            TextureSubresourceSet::single(dst_slice.mip_level, dst_slice.array_slice),
            ResourceStates::COPY_DEST,
        )?;
        self.commit_barriers()?;

        let cmd = self.cmd()?;
        let src_t = super::vk_texture(src)?;
        let dst_t = super::vk_texture(dst)?;
        let src_res = src_slice.resolve(&src_t.desc);
        let dst_res = dst_slice.resolve(&dst_t.desc);
        let extent = vk::Extent3D {
            width: src_res.width,
            height: src_res.height,
            depth: src_res.depth,
        };

        match (src_staging, dst_staging) {
            (false, false) => {
                let region = vk::ImageCopy {
                    src_subresource: Self::image_layers(src_t, &src_res),
                    src_offset: vk::Offset3D {
                        x: src_res.x as i32,
                        y: src_res.y as i32,
                        z: src_res.z as i32,
                    },
                    dst_subresource: Self::image_layers(dst_t, &dst_res),
                    dst_offset: vk::Offset3D {
                        x: dst_res.x as i32,
                        y: dst_res.y as i32,
                        z: dst_res.z as i32,
                    },
                    extent,
                };
                unsafe {
                    self.shared.device.cmd_copy_image(
                        cmd,
                        src_t.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_t.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            }
            (true, false) => {
                let (offset, row_length, image_height) =
                    Self::staging_copy_layout(src_t, &src_res)?;
                let region = vk::BufferImageCopy {
                    buffer_offset: offset,
                    buffer_row_length: row_length,
                    buffer_image_height: image_height,
                    image_subresource: Self::image_layers(dst_t, &dst_res),
                    image_offset: vk::Offset3D {
                        x: dst_res.x as i32,
                        y: dst_res.y as i32,
                        z: dst_res.z as i32,
                    },
                    image_extent: extent,
                };
                unsafe {
                    self.shared.device.cmd_copy_buffer_to_image(
                        cmd,
                        src_t.staging.as_ref().unwrap().buffer,
                        dst_t.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            }
            (false, true) => {
                let (offset, row_length, image_height) =
                    Self::staging_copy_layout(dst_t, &dst_res)?;
                let region = vk::BufferImageCopy {
                    buffer_offset: offset,
                    buffer_row_length: row_length,
                    buffer_image_height: image_height,
                    image_subresource: Self::image_layers(src_t, &src_res),
                    image_offset: vk::Offset3D {
                        x: src_res.x as i32,
                        y: src_res.y as i32,
                        z: src_res.z as i32,
                    },
                    image_extent: extent,
                };
                unsafe {
                    self.shared.device.cmd_copy_image_to_buffer(
                        cmd,
                        src_t.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_t.staging.as_ref().unwrap().buffer,
                        &[region],
                    );
                }
            }
            (true, true) => {
                let (src_offset, src_len) =
                    src_t.staging_region(src_res.array_slice, src_res.mip_level)?;
                let (dst_offset, dst_len) =
                    dst_t.staging_region(dst_res.array_slice, dst_res.mip_level)?;
                let region = vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size: src_len.min(dst_len),
                };
                unsafe {
                    self.shared.device.cmd_copy_buffer(
                        cmd,
                        src_t.staging.as_ref().unwrap().buffer,
                        dst_t.staging.as_ref().unwrap().buffer,
                        &[region],
                    );
                }
            }
        }
        Ok(())
    }

    fn resolve_texture(
        &mut self,
        dst: &TextureHandle,
        dst_subresources: TextureSubresourceSet,
        src: &TextureHandle,
        src_subresources: TextureSubresourceSet,
    ) -> Result<()> {
        self.end_render_pass()?;
        self.require_texture(src, src_subresources, ResourceStates::RESOLVE_SOURCE)?;
        self.require_texture(dst, dst_subresources, ResourceStates::RESOLVE_DEST)?;
        self.commit_barriers()?;

        let cmd = self.cmd()?;
        let src_t = super::vk_texture(src)?;
        let dst_t = super::vk_texture(dst)?;
        let src_range = src_subresources.resolve(&src_t.desc, false);
        let dst_range = dst_subresources.resolve(&dst_t.desc, false);

        let mut regions = Vec::new();
        for mip in 0..src_range.mip_count.min(dst_range.mip_count) {
            let src_mip = src_range.base_mip + mip;
            let dst_mip = dst_range.base_mip + mip;
            regions.push(vk::ImageResolve {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: super::convert::format_aspect_flags(src_t.desc.format),
                    mip_level: src_mip,
                    base_array_layer: src_range.base_array_slice,
                    layer_count: src_range.array_slice_count,
                },
                src_offset: vk::Offset3D::default(),
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: super::convert::format_aspect_flags(dst_t.desc.format),
                    mip_level: dst_mip,
                    base_array_layer: dst_range.base_array_slice,
                    layer_count: dst_range.array_slice_count,
                },
                dst_offset: vk::Offset3D::default(),
                extent: vk::Extent3D {
                    width: (dst_t.desc.width >> dst_mip).max(1),
                    height: (dst_t.desc.height >> dst_mip).max(1),
                    depth: 1,
                },
            });
        }
        unsafe {
            self.shared.device.cmd_resolve_image(
                cmd,
                src_t.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_t.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            );
        }
        Ok(())
    }

    fn write_texture(
        &mut self,
        dst: &TextureHandle,
        array_slice: u32,
        mip_level: u32,
        data: &[u8],
        row_pitch: u64,
    ) -> Result<()> {
        self.end_render_pass()?;
        let dst_t = super::vk_texture(dst)?;
        let desc = dst_t.desc.clone();
        let info = format_info(desc.format);
        let bs = info.block_size as u32;
        let mip_width = (desc.width >> mip_level).max(1);
        let mip_height = (desc.height >> mip_level).max(1);
        let mip_depth = (desc.depth >> mip_level).max(1);
        let blocks_x = (mip_width + bs - 1) / bs;
        let blocks_y = (mip_height + bs - 1) / bs;
        let tight_row = blocks_x as u64 * info.bytes_per_block as u64;
        let rows = blocks_y as u64 * mip_depth as u64;
        let source_pitch = if row_pitch == 0 { tight_row } else { row_pitch };
        if (data.len() as u64) < (rows - 1) * source_pitch + tight_row {
            return Err(GpuError::InvalidArgument(format!(
                "write_texture data for '{}' is too small",
                desc.debug_name
            )));
        }

        if dst_t.is_staging() {
            // Staging writes go straight through the persistent mapping.
            let (offset, len) = dst_t.staging_region(array_slice, mip_level)?;
            let staging = dst_t.staging.as_ref().unwrap();
            if tight_row * rows > len {
                return Err(GpuError::InvalidArgument(
                    "write_texture overflows the staging subresource".into(),
                ));
            }
            for row in 0..rows {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr().add((row * source_pitch) as usize),
                        staging
                            .mapped
                            .add((offset + row * tight_row) as usize),
                        tight_row as usize,
                    );
                }
            }
            let allocation = staging.allocation.lock().unwrap();
            self.shared
                .allocator
                .flush_allocation(&allocation, offset as usize, (tight_row * rows) as usize)?;
            self.retain(dst.clone());
            return Ok(());
        }

        // Repack into a tightly pitched upload region, then copy on device.
        let total = tight_row * rows;
        let last_finished = self.shared.last_finished_snapshot();
        let sub = self
            .upload
            .suballocate(total, 16, self.recording_version, &last_finished)?
            .ok_or(GpuError::OutOfSlots("upload memory"))?;
        let upload_offset = sub.offset;
        for row in 0..rows {
            let start = (row * source_pitch) as usize;
            sub.buffer.write(
                upload_offset + row * tight_row,
                &data[start..start + tight_row as usize],
            )?;
        }
        let upload_buffer = sub.buffer.buffer;

        self.require_texture(
            dst,
            TextureSubresourceSet::single(mip_level, array_slice),
            ResourceStates::COPY_DEST,
        )?;
        self.commit_barriers()?;

        let cmd = self.cmd()?;
        let dst_t = super::vk_texture(dst)?;
        let region = vk::BufferImageCopy {
            buffer_offset: upload_offset,
            buffer_row_length: blocks_x * bs,
            buffer_image_height: blocks_y * bs,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: super::convert::format_aspect_flags(desc.format),
                mip_level,
                base_array_layer: array_slice,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: mip_width,
                height: mip_height,
                depth: mip_depth,
            },
        };
        unsafe {
            self.shared.device.cmd_copy_buffer_to_image(
                cmd,
                upload_buffer,
                dst_t.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        Ok(())
    }

    fn write_buffer(&mut self, buffer: &BufferHandle, data: &[u8], dst_offset: u64) -> Result<()> {
        let vk_buffer = super::vk_buffer(buffer)?;
        if let Some(volatile) = &vk_buffer.volatile {
            if dst_offset != 0 {
                return Err(GpuError::InvalidArgument(
                    "volatile buffers are written whole, at offset zero".into(),
                ));
            }
            if data.len() as u64 > vk_buffer.desc.byte_size {
                return Err(GpuError::InvalidArgument(format!(
                    "write of {} bytes exceeds volatile buffer '{}'",
                    data.len(),
                    vk_buffer.desc.debug_name
                )));
            }
            let last_finished = self.shared.last_finished_snapshot();
            let version = volatile
                .versions
                .claim(self.params.queue_kind, self.recording_id, &last_finished)
                .ok_or(GpuError::OutOfSlots("volatile buffer versions"))?;
            let offset = version as u64 * volatile.aligned_version_size;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    vk_buffer.mapped.add(offset as usize),
                    data.len(),
                );
            }
            {
                let allocation = vk_buffer.allocation.lock().unwrap();
                if let Some(allocation) = allocation.as_ref() {
                    self.shared
                        .allocator
                        .flush_allocation(allocation, offset as usize, data.len())?;
                }
            }
            let tracking = vk_buffer.tracking;
            self.volatile_versions
                .entry(tracking)
                .or_insert_with(|| (buffer.clone(), Vec::new()))
                .1
                .push(version);
            self.volatile_generation += 1;
            self.retain(buffer.clone());
            return Ok(());
        }

        self.end_render_pass()?;
        self.require_buffer(buffer, ResourceStates::COPY_DEST)?;
        self.commit_barriers()?;
        let cmd = self.cmd()?;
        let vk_buffer = super::vk_buffer(buffer)?;

        // Small aligned writes inline into the command buffer; larger ones
        // stage through an upload chunk.
        if data.len() <= 65536 && data.len() % 4 == 0 && dst_offset % 4 == 0 {
            unsafe {
                self.shared
                    .device
                    .cmd_update_buffer(cmd, vk_buffer.buffer, dst_offset, data);
            }
            return Ok(());
        }
        let dst_vk = vk_buffer.buffer;
        let (src_buffer, src_offset, _) = self.upload_bytes(data, 4)?;
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size: data.len() as u64,
        };
        unsafe {
            self.shared
                .device
                .cmd_copy_buffer(cmd, src_buffer, dst_vk, &[region]);
        }
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        dst: &BufferHandle,
        dst_offset: u64,
        src: &BufferHandle,
        src_offset: u64,
        byte_size: u64,
    ) -> Result<()> {
        self.end_render_pass()?;
        self.require_buffer(src, ResourceStates::COPY_SOURCE)?;
        self.require_buffer(dst, ResourceStates::COPY_DEST)?;
        self.commit_barriers()?;
        let cmd = self.cmd()?;
        let src_vk = super::vk_buffer(src)?.buffer;
        let dst_vk = super::vk_buffer(dst)?.buffer;
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size: byte_size,
        };
        unsafe {
            self.shared
                .device
                .cmd_copy_buffer(cmd, src_vk, dst_vk, &[region]);
        }
        Ok(())
    }

    fn set_push_constants(&mut self, data: &[u8]) -> Result<()> {
        let cmd = self.cmd()?;
        let layout = self
            .active_layout
            .ok_or_else(|| GpuError::Misuse("no pipeline bound".into()))?;
        if data.len() as u32 > layout.push_size {
            return Err(GpuError::InvalidArgument(format!(
                "push constant write of {} bytes exceeds the declared {} bytes",
                data.len(),
                layout.push_size
            )));
        }
        unsafe {
            self.shared.device.cmd_push_constants(
                cmd,
                layout.layout,
                layout.push_stages,
                0,
                data,
            );
        }
        Ok(())
    }

    fn set_graphics_state(&mut self, state: &GraphicsState) -> Result<()> {
        let pipeline_handle = state
            .pipeline
            .clone()
            .ok_or_else(|| GpuError::Misuse("graphics state needs a pipeline".into()))?;
        let framebuffer_handle = state
            .framebuffer
            .clone()
            .ok_or_else(|| GpuError::Misuse("graphics state needs a framebuffer".into()))?;

        // State requirements first, so the barriers land before the pass.
        if self.auto_barriers {
            let fb_desc = framebuffer_handle.desc().clone();
            for attachment in &fb_desc.color_attachments {
                self.require_texture(
                    &attachment.texture,
                    attachment.subresources,
                    ResourceStates::RENDER_TARGET,
                )?;
            }
            if let Some(attachment) = &fb_desc.depth_attachment {
                let target = if attachment.is_read_only {
                    ResourceStates::DEPTH_READ
                } else {
                    ResourceStates::DEPTH_WRITE
                };
                self.require_texture(&attachment.texture, attachment.subresources, target)?;
            }
            if let Some(attachment) = &fb_desc.shading_rate_attachment {
                self.require_texture(
                    &attachment.texture,
                    attachment.subresources,
                    ResourceStates::SHADING_RATE_SURFACE,
                )?;
            }
            for set in &state.bindings {
                if set.desc().track_liveness {
                    self.require_binding_set_states(set)?;
                }
            }
            for vb in &state.vertex_buffers {
                self.require_buffer(&vb.buffer, ResourceStates::VERTEX_BUFFER)?;
            }
            if let Some(ib) = &state.index_buffer {
                self.require_buffer(&ib.buffer, ResourceStates::INDEX_BUFFER)?;
            }
            if let Some(indirect) = &state.indirect_params {
                self.require_buffer(indirect, ResourceStates::INDIRECT_ARGUMENT)?;
            }
        }
        self.commit_barriers()?;

        let cmd = self.cmd()?;
        let pipeline = super::vk_graphics_pipeline(&pipeline_handle)?;
        let vk_framebuffer = super::vk_framebuffer(&framebuffer_handle)?;
        let previous = self.graphics.take();

        let framebuffer_changed = match &self.open_framebuffer {
            Some(open) => !same_handle(open, &framebuffer_handle),
            None => true,
        };
        let pipeline_changed = previous
            .as_ref()
            .and_then(|p| p.pipeline.as_ref())
            .map_or(true, |prev| !same_handle(prev, &pipeline_handle));
        let stage_mask_changed = previous
            .as_ref()
            .and_then(|p| p.pipeline.as_ref())
            .map_or(true, |prev| prev.shader_mask() != pipeline.shader_mask);

        if framebuffer_changed {
            self.end_render_pass()?;
            unsafe {
                self.shared.device.cmd_begin_render_pass(
                    cmd,
                    &vk::RenderPassBeginInfo::builder()
                        .render_pass(vk_framebuffer.render_pass)
                        .framebuffer(vk_framebuffer.framebuffer)
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D::default(),
                            extent: vk::Extent2D {
                                width: vk_framebuffer.info.width,
                                height: vk_framebuffer.info.height,
                            },
                        }),
                    vk::SubpassContents::INLINE,
                );
            }
            self.open_framebuffer = Some(framebuffer_handle.clone());
            self.retain(framebuffer_handle.clone());
        }

        let (layout, uses_blend_constants, uses_dynamic_stencil_ref) = {
            let p = pipeline;
            (
                ActiveLayout {
                    layout: p.pipeline_layout,
                    bind_point: vk::PipelineBindPoint::GRAPHICS,
                    push_stages: p.push_constant_stages,
                    push_size: p.push_constant_size,
                },
                p.uses_blend_constants,
                p.uses_dynamic_stencil_ref,
            )
        };
        if pipeline_changed {
            unsafe {
                self.shared.device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.pipeline,
                );
            }
            self.retain(pipeline_handle.clone());
        }
        self.active_layout = Some(layout);

        if !state.viewport.viewports.is_empty() {
            let viewports: Vec<vk::Viewport> = state
                .viewport
                .viewports
                .iter()
                .map(|v| (*v).into())
                .collect();
            unsafe { self.shared.device.cmd_set_viewport(cmd, 0, &viewports) };
        }
        if !state.viewport.scissors.is_empty() {
            let scissors: Vec<vk::Rect2D> = state
                .viewport
                .scissors
                .iter()
                .map(|r| vk::Rect2D {
                    offset: vk::Offset2D {
                        x: r.min_x,
                        y: r.min_y,
                    },
                    extent: vk::Extent2D {
                        width: (r.max_x - r.min_x).max(0) as u32,
                        height: (r.max_y - r.min_y).max(0) as u32,
                    },
                })
                .collect();
            unsafe { self.shared.device.cmd_set_scissor(cmd, 0, &scissors) };
        }
        if uses_blend_constants {
            let c = state.blend_constant_color;
            unsafe {
                self.shared
                    .device
                    .cmd_set_blend_constants(cmd, &[c.r, c.g, c.b, c.a]);
            }
        }
        if uses_dynamic_stencil_ref {
            unsafe {
                self.shared.device.cmd_set_stencil_reference(
                    cmd,
                    vk::StencilFaceFlags::FRONT_AND_BACK,
                    state.dynamic_stencil_ref_value as u32,
                );
            }
        }
        if state.shading_rate_state.enabled {
            let loader = self
                .shared
                .shading_rate
                .as_ref()
                .ok_or(GpuError::NotSupported("variable rate shading"))?;
            let combiners: [vk::FragmentShadingRateCombinerOpKHR; 2] = [
                state.shading_rate_state.pipeline_primitive_combiner.into(),
                state.shading_rate_state.image_combiner.into(),
            ];
            let fragment_size: vk::Extent2D = state.shading_rate_state.shading_rate.into();
            unsafe {
                (loader.cmd_set_fragment_shading_rate_khr)(cmd, &fragment_size, &combiners);
            }
        }

        let previous_bindings = previous.map(|p| p.bindings).unwrap_or_default();
        self.bind_changed_sets(
            PipelineKind::Graphics,
            &previous_bindings,
            &state.bindings,
            !framebuffer_changed && !stage_mask_changed,
        )?;

        for vb in &state.vertex_buffers {
            let vk_vb = super::vk_buffer(&vb.buffer)?.buffer;
            unsafe {
                self.shared
                    .device
                    .cmd_bind_vertex_buffers(cmd, vb.slot, &[vk_vb], &[vb.offset]);
            }
            self.retain(vb.buffer.clone());
        }
        if let Some(ib) = &state.index_buffer {
            let vk_ib = super::vk_buffer(&ib.buffer)?.buffer;
            let index_type = match ib.format {
                IndexFormat::U16 => vk::IndexType::UINT16,
                IndexFormat::U32 => vk::IndexType::UINT32,
            };
            unsafe {
                self.shared
                    .device
                    .cmd_bind_index_buffer(cmd, vk_ib, ib.offset, index_type);
            }
            self.retain(ib.buffer.clone());
        }
        if let Some(indirect) = &state.indirect_params {
            self.retain(indirect.clone());
        }

        self.graphics = Some(state.clone());
        Ok(())
    }

    fn set_compute_state(&mut self, state: &ComputeState) -> Result<()> {
        let pipeline_handle = state
            .pipeline
            .clone()
            .ok_or_else(|| GpuError::Misuse("compute state needs a pipeline".into()))?;
        self.end_render_pass()?;

        if self.auto_barriers {
            for set in &state.bindings {
                if set.desc().track_liveness {
                    self.require_binding_set_states(set)?;
                }
            }
            if let Some(indirect) = &state.indirect_params {
                self.require_buffer(indirect, ResourceStates::INDIRECT_ARGUMENT)?;
            }
        }
        self.commit_barriers()?;

        let cmd = self.cmd()?;
        let pipeline = super::vk_compute_pipeline(&pipeline_handle)?;
        let previous = self.compute.take();
        let pipeline_changed = previous
            .as_ref()
            .and_then(|p| p.pipeline.as_ref())
            .map_or(true, |prev| !same_handle(prev, &pipeline_handle));

        self.active_layout = Some(ActiveLayout {
            layout: pipeline.pipeline_layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            push_stages: pipeline.push_constant_stages,
            push_size: pipeline.push_constant_size,
        });
        if pipeline_changed {
            unsafe {
                self.shared.device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    pipeline.pipeline,
                );
            }
            self.retain(pipeline_handle.clone());
        }

        let previous_bindings = previous.map(|p| p.bindings).unwrap_or_default();
        self.bind_changed_sets(
            PipelineKind::Compute,
            &previous_bindings,
            &state.bindings,
            true,
        )?;

        if let Some(indirect) = &state.indirect_params {
            self.retain(indirect.clone());
        }
        self.compute = Some(state.clone());
        Ok(())
    }

    fn set_mesh_state(&mut self, state: &MeshState) -> Result<()> {
        let pipeline_handle = state
            .pipeline
            .clone()
            .ok_or_else(|| GpuError::Misuse("mesh state needs a pipeline".into()))?;
        let framebuffer_handle = state
            .framebuffer
            .clone()
            .ok_or_else(|| GpuError::Misuse("mesh state needs a framebuffer".into()))?;

        if self.auto_barriers {
            let fb_desc = framebuffer_handle.desc().clone();
            for attachment in &fb_desc.color_attachments {
                self.require_texture(
                    &attachment.texture,
                    attachment.subresources,
                    ResourceStates::RENDER_TARGET,
                )?;
            }
            if let Some(attachment) = &fb_desc.depth_attachment {
                let target = if attachment.is_read_only {
                    ResourceStates::DEPTH_READ
                } else {
                    ResourceStates::DEPTH_WRITE
                };
                self.require_texture(&attachment.texture, attachment.subresources, target)?;
            }
            for set in &state.bindings {
                if set.desc().track_liveness {
                    self.require_binding_set_states(set)?;
                }
            }
        }
        self.commit_barriers()?;

        let cmd = self.cmd()?;
        let pipeline = super::vk_mesh_pipeline(&pipeline_handle)?;
        let vk_framebuffer = super::vk_framebuffer(&framebuffer_handle)?;
        let previous = self.mesh.take();

        let framebuffer_changed = match &self.open_framebuffer {
            Some(open) => !same_handle(open, &framebuffer_handle),
            None => true,
        };
        let pipeline_changed = previous
            .as_ref()
            .and_then(|p| p.pipeline.as_ref())
            .map_or(true, |prev| !same_handle(prev, &pipeline_handle));
        let stage_mask_changed = previous
            .as_ref()
            .and_then(|p| p.pipeline.as_ref())
            .map_or(true, |prev| prev.shader_mask() != pipeline.shader_mask);

        if framebuffer_changed {
            self.end_render_pass()?;
            unsafe {
                self.shared.device.cmd_begin_render_pass(
                    cmd,
                    &vk::RenderPassBeginInfo::builder()
                        .render_pass(vk_framebuffer.render_pass)
                        .framebuffer(vk_framebuffer.framebuffer)
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D::default(),
                            extent: vk::Extent2D {
                                width: vk_framebuffer.info.width,
                                height: vk_framebuffer.info.height,
                            },
                        }),
                    vk::SubpassContents::INLINE,
                );
            }
            self.open_framebuffer = Some(framebuffer_handle.clone());
            self.retain(framebuffer_handle.clone());
        }

        self.active_layout = Some(ActiveLayout {
            layout: pipeline.pipeline_layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            push_stages: pipeline.push_constant_stages,
            push_size: pipeline.push_constant_size,
        });
        let uses_blend_constants = pipeline.uses_blend_constants;
        if pipeline_changed {
            unsafe {
                self.shared.device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.pipeline,
                );
            }
            self.retain(pipeline_handle.clone());
        }

        if !state.viewport.viewports.is_empty() {
            let viewports: Vec<vk::Viewport> = state
                .viewport
                .viewports
                .iter()
                .map(|v| (*v).into())
                .collect();
            unsafe { self.shared.device.cmd_set_viewport(cmd, 0, &viewports) };
        }
        if !state.viewport.scissors.is_empty() {
            let scissors: Vec<vk::Rect2D> = state
                .viewport
                .scissors
                .iter()
                .map(|r| vk::Rect2D {
                    offset: vk::Offset2D {
                        x: r.min_x,
                        y: r.min_y,
                    },
                    extent: vk::Extent2D {
                        width: (r.max_x - r.min_x).max(0) as u32,
                        height: (r.max_y - r.min_y).max(0) as u32,
                    },
                })
                .collect();
            unsafe { self.shared.device.cmd_set_scissor(cmd, 0, &scissors) };
        }
        if uses_blend_constants {
            let c = state.blend_constant_color;
            unsafe {
                self.shared
                    .device
                    .cmd_set_blend_constants(cmd, &[c.r, c.g, c.b, c.a]);
            }
        }

        let previous_bindings = previous.map(|p| p.bindings).unwrap_or_default();
        self.bind_changed_sets(
            PipelineKind::Mesh,
            &previous_bindings,
            &state.bindings,
            !framebuffer_changed && !stage_mask_changed,
        )?;

        self.mesh = Some(state.clone());
        Ok(())
    }

    fn set_ray_tracing_state(&mut self, state: &RayTracingState) -> Result<()> {
        let pipeline_handle = state
            .pipeline
            .clone()
            .ok_or_else(|| GpuError::Misuse("ray tracing state needs a pipeline".into()))?;
        let table = state
            .shader_table
            .clone()
            .ok_or_else(|| GpuError::Misuse("ray tracing state needs a shader table".into()))?;
        self.end_render_pass()?;

        if self.auto_barriers {
            for set in &state.bindings {
                if set.desc().track_liveness {
                    self.require_binding_set_states(set)?;
                }
            }
        }
        self.commit_barriers()?;

        let cmd = self.cmd()?;
        let pipeline = super::vk_ray_tracing_pipeline(&pipeline_handle)?;
        let previous = self.ray_tracing.take();
        let pipeline_changed = previous
            .as_ref()
            .and_then(|p| p.pipeline.as_ref())
            .map_or(true, |prev| !same_handle(prev, &pipeline_handle));

        self.active_layout = Some(ActiveLayout {
            layout: pipeline.pipeline_layout,
            bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
            push_stages: pipeline.push_constant_stages,
            push_size: pipeline.push_constant_size,
        });
        if pipeline_changed {
            unsafe {
                self.shared.device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::RAY_TRACING_KHR,
                    pipeline.pipeline,
                );
            }
            self.retain(pipeline_handle.clone());
        }

        let previous_bindings = previous.map(|p| p.bindings).unwrap_or_default();
        self.bind_changed_sets(
            PipelineKind::RayTracing,
            &previous_bindings,
            &state.bindings,
            true,
        )?;

        self.build_shader_table(&table)?;
        self.ray_tracing = Some(state.clone());
        Ok(())
    }

    fn draw(&mut self, args: DrawArguments) -> Result<()> {
        self.refresh_volatile_bindings(PipelineKind::Graphics)?;
        let cmd = self.cmd()?;
        unsafe {
            self.shared.device.cmd_draw(
                cmd,
                args.vertex_count,
                args.instance_count,
                args.start_vertex_location as u32,
                args.start_instance_location,
            );
        }
        Ok(())
    }

    fn draw_indexed(&mut self, args: DrawArguments) -> Result<()> {
        self.refresh_volatile_bindings(PipelineKind::Graphics)?;
        let cmd = self.cmd()?;
        unsafe {
            self.shared.device.cmd_draw_indexed(
                cmd,
                args.vertex_count,
                args.instance_count,
                args.start_index_location,
                args.start_vertex_location,
                args.start_instance_location,
            );
        }
        Ok(())
    }

    fn draw_indirect(&mut self, offset_bytes: u64, draw_count: u32) -> Result<()> {
        self.refresh_volatile_bindings(PipelineKind::Graphics)?;
        let cmd = self.cmd()?;
        let indirect = self
            .graphics
            .as_ref()
            .and_then(|s| s.indirect_params.clone())
            .ok_or_else(|| GpuError::Misuse("graphics state has no indirect buffer".into()))?;
        let buffer = super::vk_buffer(&indirect)?.buffer;
        unsafe {
            self.shared.device.cmd_draw_indirect(
                cmd,
                buffer,
                offset_bytes,
                draw_count,
                std::mem::size_of::<vk::DrawIndirectCommand>() as u32,
            );
        }
        Ok(())
    }

    fn draw_indexed_indirect(&mut self, offset_bytes: u64, draw_count: u32) -> Result<()> {
        self.refresh_volatile_bindings(PipelineKind::Graphics)?;
        let cmd = self.cmd()?;
        let indirect = self
            .graphics
            .as_ref()
            .and_then(|s| s.indirect_params.clone())
            .ok_or_else(|| GpuError::Misuse("graphics state has no indirect buffer".into()))?;
        let buffer = super::vk_buffer(&indirect)?.buffer;
        unsafe {
            self.shared.device.cmd_draw_indexed_indirect(
                cmd,
                buffer,
                offset_bytes,
                draw_count,
                std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u32,
            );
        }
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.refresh_volatile_bindings(PipelineKind::Compute)?;
        let cmd = self.cmd()?;
        unsafe { self.shared.device.cmd_dispatch(cmd, x, y, z) };
        Ok(())
    }

    fn dispatch_indirect(&mut self, offset_bytes: u64) -> Result<()> {
        self.refresh_volatile_bindings(PipelineKind::Compute)?;
        let cmd = self.cmd()?;
        let indirect = self
            .compute
            .as_ref()
            .and_then(|s| s.indirect_params.clone())
            .ok_or_else(|| GpuError::Misuse("compute state has no indirect buffer".into()))?;
        let buffer = super::vk_buffer(&indirect)?.buffer;
        unsafe {
            self.shared
                .device
                .cmd_dispatch_indirect(cmd, buffer, offset_bytes);
        }
        Ok(())
    }

    fn dispatch_mesh(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.refresh_volatile_bindings(PipelineKind::Mesh)?;
        let cmd = self.cmd()?;
        let loader = self
            .shared
            .mesh
            .as_ref()
            .ok_or(GpuError::NotSupported("mesh shading"))?;
        // The NV entry point takes a flat task count.
        unsafe { loader.cmd_draw_mesh_tasks(cmd, x * y * z, 0) };
        Ok(())
    }

    fn dispatch_rays(&mut self, args: DispatchRaysArguments) -> Result<()> {
        // Rebuild the device-side table when it mutated since the last bind.
        if let Some(state) = &self.ray_tracing {
            if let Some(table) = state.shader_table.clone() {
                let stale = {
                    let guard = table.lock().unwrap();
                    guard
                        .as_any()
                        .downcast_ref::<VulkanShaderTable>()
                        .map_or(false, |t| t.version != self.sbt_version)
                };
                if stale {
                    self.build_shader_table(&table)?;
                }
            }
        }
        self.refresh_volatile_bindings(PipelineKind::RayTracing)?;
        let cmd = self.cmd()?;
        let loader = self
            .shared
            .ray_pipeline
            .as_ref()
            .ok_or(GpuError::NotSupported("ray tracing pipelines"))?;
        let regions = self
            .sbt_regions
            .ok_or_else(|| GpuError::Misuse("ray tracing state was never set".into()))?;
        unsafe {
            loader.cmd_trace_rays(
                cmd,
                &regions[0],
                &regions[1],
                &regions[2],
                &regions[3],
                args.width,
                args.height,
                args.depth,
            );
        }
        Ok(())
    }

    fn build_bottom_level_accel_struct(
        &mut self,
        accel: &AccelStructHandle,
        geometries: &[GeometryDesc],
        build_flags: AccelStructBuildFlags,
    ) -> Result<()> {
        self.end_render_pass()?;
        let loader = self
            .shared
            .accel
            .clone()
            .ok_or(GpuError::NotSupported("acceleration structures"))?;
        let vk_accel = super::vk_accel_struct(accel)?;
        let dst = vk_accel.raw();
        let scratch_size = if build_flags.contains(AccelStructBuildFlags::PERFORM_UPDATE) {
            vk_accel.update_scratch_size
        } else {
            vk_accel.build_scratch_size
        };

        let mut vk_geometries = Vec::with_capacity(geometries.len());
        let mut ranges = Vec::with_capacity(geometries.len());
        for geometry in geometries {
            let (vk_geometry, primitives) = accel::translate_geometry(geometry)?;
            vk_geometries.push(vk_geometry);
            ranges.push(vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: primitives,
                primitive_offset: 0,
                first_vertex: 0,
                transform_offset: 0,
            });
            match &geometry.data {
                GeometryData::Triangles(t) => {
                    if let Some(vb) = &t.vertex_buffer {
                        self.require_buffer(vb, ResourceStates::ACCEL_STRUCT_BUILD_INPUT)?;
                    }
                    if let Some(ib) = &t.index_buffer {
                        self.require_buffer(ib, ResourceStates::ACCEL_STRUCT_BUILD_INPUT)?;
                    }
                }
                GeometryData::Aabbs(a) => {
                    if let Some(b) = &a.buffer {
                        self.require_buffer(b, ResourceStates::ACCEL_STRUCT_BUILD_INPUT)?;
                    }
                }
            }
        }
        self.require_accel(accel, ResourceStates::ACCEL_STRUCT_WRITE)?;
        self.commit_barriers()?;

        let scratch_alignment = self.shared.scratch_alignment.max(1);
        let scratch = self.scratch_device_address(scratch_size, scratch_alignment)?;
        let cmd = self.cmd()?;

        let mode = if build_flags.contains(AccelStructBuildFlags::PERFORM_UPDATE) {
            vk::BuildAccelerationStructureModeKHR::UPDATE
        } else {
            vk::BuildAccelerationStructureModeKHR::BUILD
        };
        let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(accel::build_flags(build_flags))
            .mode(mode)
            .dst_acceleration_structure(dst)
            .geometries(&vk_geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch,
            })
            .build();
        if mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
            info.src_acceleration_structure = dst;
        }
        unsafe { loader.cmd_build_acceleration_structures(cmd, &[info], &[&ranges]) };
        Ok(())
    }

    fn build_top_level_accel_struct(
        &mut self,
        accel: &AccelStructHandle,
        instances: &[InstanceDesc],
        build_flags: AccelStructBuildFlags,
    ) -> Result<()> {
        self.end_render_pass()?;
        let loader = self
            .shared
            .accel
            .clone()
            .ok_or(GpuError::NotSupported("acceleration structures"))?;
        let vk_accel = super::vk_accel_struct(accel)?;
        if instances.len() as u32 > vk_accel.desc.max_instances {
            return Err(GpuError::InvalidArgument(format!(
                "{} instances exceed the declared capacity {} of '{}'",
                instances.len(),
                vk_accel.desc.max_instances,
                vk_accel.desc.debug_name
            )));
        }
        let dst = vk_accel.raw();
        let scratch_size = vk_accel.build_scratch_size;

        let (_, _, instance_address) = self.upload_bytes(bytemuck::cast_slice(instances), 16)?;
        self.require_accel(accel, ResourceStates::ACCEL_STRUCT_WRITE)?;
        self.commit_barriers()?;

        let scratch_alignment = self.shared.scratch_alignment.max(1);
        let scratch = self.scratch_device_address(scratch_size, scratch_alignment)?;
        let cmd = self.cmd()?;

        let geometries = [accel::instances_geometry(instance_address)];
        let ranges = [vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: instances.len() as u32,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        }];
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(accel::build_flags(build_flags))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(dst)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch,
            })
            .build();
        unsafe { loader.cmd_build_acceleration_structures(cmd, &[info], &[&ranges]) };
        Ok(())
    }

    fn compact_bottom_level_accel_structs(&mut self) -> Result<()> {
        // Compaction needs the compacted sizes read back on the host before
        // the destination structures can be created; that readback pipeline
        // is not wired up, so the request is acknowledged and skipped.
        self.shared
            .messages
            .warning("acceleration structure compaction requested but not performed");
        Ok(())
    }

    fn begin_timer_query(&mut self, query: &TimerQueryHandle) -> Result<()> {
        let cmd = self.cmd()?;
        let vk_query = super::vk_timer_query(query)?;
        {
            let mut state = vk_query.state.lock().unwrap();
            state.started = true;
            state.resolved = false;
        }
        unsafe {
            self.shared.device.cmd_reset_query_pool(
                cmd,
                self.shared.timer_query_pool,
                vk_query.slot,
                2,
            );
            self.shared.device.cmd_write_timestamp(
                cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.shared.timer_query_pool,
                vk_query.slot,
            );
        }
        self.retain(query.clone());
        Ok(())
    }

    fn end_timer_query(&mut self, query: &TimerQueryHandle) -> Result<()> {
        let cmd = self.cmd()?;
        let vk_query = super::vk_timer_query(query)?;
        unsafe {
            self.shared.device.cmd_write_timestamp(
                cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.shared.timer_query_pool,
                vk_query.slot + 1,
            );
        }
        self.retain(query.clone());
        Ok(())
    }

    fn begin_marker(&mut self, name: &str) {
        if let (Some(debug_utils), Ok(cmd)) = (&self.shared.debug_utils, self.cmd()) {
            if let Ok(label) = CString::new(name) {
                let info = vk::DebugUtilsLabelEXT::builder().label_name(&label);
                unsafe { debug_utils.cmd_begin_debug_utils_label(cmd, &info) };
            }
        }
    }

    fn end_marker(&mut self) {
        if let (Some(debug_utils), Ok(cmd)) = (&self.shared.debug_utils, self.cmd()) {
            unsafe { debug_utils.cmd_end_debug_utils_label(cmd) };
        }
    }

    fn set_enable_automatic_barriers(&mut self, enable: bool) {
        self.auto_barriers = enable;
    }

    fn set_resource_states_for_binding_set(&mut self, binding_set: &BindingSetHandle) {
        if let Err(err) = self.require_binding_set_states(binding_set) {
            self.shared
                .messages
                .warning(&format!("set_resource_states_for_binding_set: {}", err));
        }
    }

    fn begin_tracking_texture_state(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        state: ResourceStates,
    ) {
        if let Ok(vk_texture) = super::vk_texture(texture) {
            let id = vk_texture.tracking;
            if !self.tracker.is_tracking_texture(id) {
                self.tracker.begin_tracking_texture(
                    id,
                    vk_texture.desc.mip_levels,
                    vk_texture.desc.array_size,
                    vk_texture.desc.initial_state,
                    vk_texture.desc.keep_initial_state,
                );
                self.texture_infos.insert(
                    id,
                    TextureBarrierInfo {
                        image: vk_texture.image,
                        aspect: super::convert::format_aspect_flags(vk_texture.desc.format),
                        mip_levels: vk_texture.desc.mip_levels,
                        array_size: vk_texture.desc.array_size,
                    },
                );
                self.retain(texture.clone());
            }
            // The caller is asserting the actual layout of these
            // subresources; record it without emitting a barrier.
            self.tracker.set_texture_state(id, subresources, state);
        }
    }

    fn begin_tracking_buffer_state(&mut self, buffer: &BufferHandle, state: ResourceStates) {
        if let Ok(vk_buffer) = super::vk_buffer(buffer) {
            let id = vk_buffer.tracking;
            if !self.tracker.is_tracking_buffer(id) {
                self.tracker.begin_tracking_buffer(
                    id,
                    state,
                    vk_buffer.desc.keep_initial_state,
                );
                self.buffer_infos.insert(id, vk_buffer.buffer);
                self.retain(buffer.clone());
            }
        }
    }

    fn set_texture_state(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        state: ResourceStates,
    ) {
        if let Ok(id) = self.track_texture(texture) {
            self.tracker.require_texture_state(id, subresources, state);
        }
    }

    fn set_buffer_state(&mut self, buffer: &BufferHandle, state: ResourceStates) {
        if let Ok(id) = self.track_buffer(buffer) {
            self.tracker.require_buffer_state(id, state);
        }
    }

    fn set_permanent_texture_state(&mut self, texture: &TextureHandle, state: ResourceStates) {
        if let Ok(id) = self.track_texture(texture) {
            self.tracker.set_permanent_texture_state(id, state);
        }
    }

    fn set_permanent_buffer_state(&mut self, buffer: &BufferHandle, state: ResourceStates) {
        if let Ok(id) = self.track_buffer(buffer) {
            self.tracker.set_permanent_buffer_state(id, state);
        }
    }

    fn set_enable_uav_barriers_for_texture(&mut self, texture: &TextureHandle, enable: bool) {
        if let Ok(id) = self.track_texture(texture) {
            self.tracker.set_enable_uav_barriers_for_texture(id, enable);
        }
    }

    fn set_enable_uav_barriers_for_buffer(&mut self, buffer: &BufferHandle, enable: bool) {
        if let Ok(id) = self.track_buffer(buffer) {
            self.tracker.set_enable_uav_barriers_for_buffer(id, enable);
        }
    }

    fn commit_barriers(&mut self) -> Result<()> {
        if !self.tracker.has_pending_barriers() {
            return Ok(());
        }
        // Barriers are illegal inside a render pass.
        self.end_render_pass()?;
        let cmd = self.cmd()?;

        if self.shared.features.synchronization2 {
            let mut image_barriers = Vec::new();
            for barrier in self.tracker.texture_barriers() {
                let Some(info) = self.texture_infos.get(&barrier.id) else {
                    continue;
                };
                let before = map_resource_state(barrier.before);
                let after = map_resource_state(barrier.after);
                // The contents before the first transition out of Common are
                // undefined; discarding them lets the driver skip a decompress.
                let old_layout = if barrier.before == ResourceStates::COMMON {
                    vk::ImageLayout::UNDEFINED
                } else {
                    before.layout
                };
                let range = if barrier.entire_texture {
                    vk::ImageSubresourceRange {
                        aspect_mask: info.aspect,
                        base_mip_level: 0,
                        level_count: info.mip_levels,
                        base_array_layer: 0,
                        layer_count: info.array_size,
                    }
                } else {
                    vk::ImageSubresourceRange {
                        aspect_mask: info.aspect,
                        base_mip_level: barrier.mip_level,
                        level_count: 1,
                        base_array_layer: barrier.array_slice,
                        layer_count: 1,
                    }
                };
                image_barriers.push(
                    vk::ImageMemoryBarrier2::builder()
                        .src_stage_mask(before.stage)
                        .src_access_mask(before.access)
                        .dst_stage_mask(after.stage)
                        .dst_access_mask(after.access)
                        .old_layout(old_layout)
                        .new_layout(after.layout)
                        .image(info.image)
                        .subresource_range(range)
                        .build(),
                );
            }
            let mut buffer_barriers = Vec::new();
            for barrier in self.tracker.buffer_barriers() {
                let Some(buffer) = self.buffer_infos.get(&barrier.id) else {
                    continue;
                };
                let before = map_resource_state(barrier.before);
                let after = map_resource_state(barrier.after);
                buffer_barriers.push(
                    vk::BufferMemoryBarrier2::builder()
                        .src_stage_mask(before.stage)
                        .src_access_mask(before.access)
                        .dst_stage_mask(after.stage)
                        .dst_access_mask(after.access)
                        .buffer(*buffer)
                        .offset(0)
                        .size(vk::WHOLE_SIZE)
                        .build(),
                );
            }
            if !image_barriers.is_empty() || !buffer_barriers.is_empty() {
                let dependency = vk::DependencyInfo::builder()
                    .image_memory_barriers(&image_barriers)
                    .buffer_memory_barriers(&buffer_barriers);
                unsafe { self.shared.device.cmd_pipeline_barrier2(cmd, &dependency) };
            }
        } else {
            // Grouped by (src, dst) stage pair; a single OR-ed call would
            // serialize every listed stage against every other.
            let mut keys = Vec::new();
            let mut image_groups: Vec<Vec<vk::ImageMemoryBarrier>> = Vec::new();
            let mut buffer_groups: Vec<Vec<vk::BufferMemoryBarrier>> = Vec::new();
            for barrier in self.tracker.texture_barriers() {
                let Some(info) = self.texture_infos.get(&barrier.id) else {
                    continue;
                };
                let before = map_resource_state(barrier.before);
                let after = map_resource_state(barrier.after);
                let group =
                    super::convert::legacy_barrier_group(&mut keys, before.stage, after.stage);
                if group == image_groups.len() {
                    image_groups.push(Vec::new());
                    buffer_groups.push(Vec::new());
                }
                let old_layout = if barrier.before == ResourceStates::COMMON {
                    vk::ImageLayout::UNDEFINED
                } else {
                    before.layout
                };
                let range = if barrier.entire_texture {
                    vk::ImageSubresourceRange {
                        aspect_mask: info.aspect,
                        base_mip_level: 0,
                        level_count: info.mip_levels,
                        base_array_layer: 0,
                        layer_count: info.array_size,
                    }
                } else {
                    vk::ImageSubresourceRange {
                        aspect_mask: info.aspect,
                        base_mip_level: barrier.mip_level,
                        level_count: 1,
                        base_array_layer: barrier.array_slice,
                        layer_count: 1,
                    }
                };
                image_groups[group].push(
                    vk::ImageMemoryBarrier::builder()
                        .src_access_mask(legacy_access_flags(before.access))
                        .dst_access_mask(legacy_access_flags(after.access))
                        .old_layout(old_layout)
                        .new_layout(after.layout)
                        .image(info.image)
                        .subresource_range(range)
                        .build(),
                );
            }
            for barrier in self.tracker.buffer_barriers() {
                let Some(buffer) = self.buffer_infos.get(&barrier.id) else {
                    continue;
                };
                let before = map_resource_state(barrier.before);
                let after = map_resource_state(barrier.after);
                let group =
                    super::convert::legacy_barrier_group(&mut keys, before.stage, after.stage);
                if group == image_groups.len() {
                    image_groups.push(Vec::new());
                    buffer_groups.push(Vec::new());
                }
                buffer_groups[group].push(
                    vk::BufferMemoryBarrier::builder()
                        .src_access_mask(legacy_access_flags(before.access))
                        .dst_access_mask(legacy_access_flags(after.access))
                        .buffer(*buffer)
                        .offset(0)
                        .size(vk::WHOLE_SIZE)
                        .build(),
                );
            }
            for (group, (src, dst)) in keys.iter().enumerate() {
                unsafe {
                    self.shared.device.cmd_pipeline_barrier(
                        cmd,
                        legacy_stage_flags(*src),
                        legacy_stage_flags(*dst),
                        vk::DependencyFlags::empty(),
                        &[],
                        &buffer_groups[group],
                        &image_groups[group],
                    );
                }
            }
        }
        self.tracker.clear_barriers();
        Ok(())
    }
}
