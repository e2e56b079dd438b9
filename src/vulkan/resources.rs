//! Concrete resource objects backed by `ash` + `vk-mem`, each with its own
//! lazily filled view cache.

use super::DeviceShared;
use crate::error::{GpuError, Result};
use crate::permutation::find_permutation_in_blob;
use crate::state_tracking::TrackingId;
use crate::traits::{
    Buffer, EventQuery, Heap, InputLayout, Resource, Sampler, Shader, Texture, TimerQuery,
};
use crate::types::*;
use crate::versioning::VersionTracking;
use crate::Format;
use ash::vk;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use vk_mem::Alloc;

static TRACKING_IDS: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_tracking_id() -> TrackingId {
    TRACKING_IDS.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn align_u64(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

/// Key of one cached image view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TextureViewKey {
    pub subresources: TextureSubresourceSet,
    pub format: Format,
    pub dimension: TextureDimension,
    pub intent: AccessIntent,
    pub aspect: ViewAspect,
}

/// Stencil reads land in `.g` on the implicit backend while the stencil
/// aspect here returns them in the first component; route R into g so
/// shaders read the same channel on both.
pub(crate) fn view_component_mapping(
    intent: AccessIntent,
    aspect: ViewAspect,
) -> vk::ComponentMapping {
    if intent == AccessIntent::ShaderResource && aspect == ViewAspect::StencilOnly {
        vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::R,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        }
    } else {
        vk::ComponentMapping::default()
    }
}

pub struct VulkanTexture {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) desc: TextureDesc,
    pub(crate) image: vk::Image,
    pub(crate) allocation: Mutex<Option<vk_mem::Allocation>>,
    /// Staging textures are buffer-backed; `image` is null for them.
    pub(crate) staging: Option<StagingStorage>,
    pub(crate) views: Mutex<HashMap<TextureViewKey, vk::ImageView>>,
    pub(crate) tracking: TrackingId,
}

pub(crate) struct StagingStorage {
    pub buffer: vk::Buffer,
    pub allocation: Mutex<vk_mem::Allocation>,
    pub mapped: *mut u8,
    /// Byte offset of each (array_slice, mip) region, slice-major.
    pub subresource_offsets: Vec<u64>,
    pub total_size: u64,
}

unsafe impl Send for StagingStorage {}
unsafe impl Sync for StagingStorage {}

// Allocations are plain tokens into the allocator; the mutexes above guard
// every mutation.
unsafe impl Send for VulkanTexture {}
unsafe impl Sync for VulkanTexture {}

impl VulkanTexture {
    pub(crate) fn is_staging(&self) -> bool {
        self.staging.is_some()
    }

    /// Byte offset and length of one subresource inside a staging texture.
    pub(crate) fn staging_region(&self, array_slice: u32, mip_level: u32) -> Result<(u64, u64)> {
        let staging = self
            .staging
            .as_ref()
            .ok_or_else(|| GpuError::Misuse("texture has no staging storage".into()))?;
        let index = (array_slice * self.desc.mip_levels + mip_level) as usize;
        if index >= staging.subresource_offsets.len() {
            return Err(GpuError::InvalidArgument(format!(
                "subresource (mip {}, slice {}) out of range for '{}'",
                mip_level, array_slice, self.desc.debug_name
            )));
        }
        let start = staging.subresource_offsets[index];
        let end = staging
            .subresource_offsets
            .get(index + 1)
            .copied()
            .unwrap_or(staging.total_size);
        Ok((start, end - start))
    }

    /// Returns the cached view for `key`, creating it on first use. Concurrent
    /// callers observe one creation and the same handle.
    pub(crate) fn get_view(&self, key: TextureViewKey) -> Result<vk::ImageView> {
        let mut views = self.views.lock().unwrap();
        if let Some(view) = views.get(&key) {
            return Ok(*view);
        }

        let single_mip = matches!(
            key.intent,
            AccessIntent::RenderTarget | AccessIntent::DepthStencil
        ) || key.intent == AccessIntent::UnorderedAccess;
        let range = key.subresources.resolve(&self.desc, single_mip);

        let mut aspect = super::convert::format_aspect_flags(key.format);
        match key.aspect {
            ViewAspect::AllAspects => {}
            ViewAspect::DepthOnly => aspect &= vk::ImageAspectFlags::DEPTH,
            ViewAspect::StencilOnly => aspect &= vk::ImageAspectFlags::STENCIL,
        }
        // Sampling a combined depth/stencil image needs a single aspect.
        if key.intent == AccessIntent::ShaderResource
            && aspect.contains(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
        {
            aspect = vk::ImageAspectFlags::DEPTH;
        }

        let layer_count = if key.dimension.is_array() || key.dimension == TextureDimension::TextureCube
        {
            range.array_slice_count
        } else {
            1
        };
        let components = view_component_mapping(key.intent, key.aspect);

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(key.dimension.into())
            .format(key.format.into())
            .components(components)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: range.base_mip,
                level_count: range.mip_count,
                base_array_layer: range.base_array_slice,
                layer_count,
            });

        let view = unsafe { self.shared.device.create_image_view(&view_info, None) }?;
        self.shared
            .set_debug_name(view, &format!("{}/view", self.desc.debug_name));
        views.insert(key, view);
        Ok(view)
    }

    pub(crate) fn subresource_range(
        &self,
        subresources: TextureSubresourceSet,
    ) -> vk::ImageSubresourceRange {
        let range = subresources.resolve(&self.desc, false);
        vk::ImageSubresourceRange {
            aspect_mask: super::convert::format_aspect_flags(self.desc.format),
            base_mip_level: range.base_mip,
            level_count: range.mip_count,
            base_array_layer: range.base_array_slice,
            layer_count: range.array_slice_count,
        }
    }
}

impl Resource for VulkanTexture {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Texture for VulkanTexture {
    fn desc(&self) -> &TextureDesc {
        &self.desc
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            for (_, view) in self.views.lock().unwrap().drain() {
                self.shared.device.destroy_image_view(view, None);
            }
            if let Some(staging) = &self.staging {
                let mut allocation = staging.allocation.lock().unwrap();
                self.shared
                    .allocator
                    .destroy_buffer(staging.buffer, &mut allocation);
            } else if let Some(mut allocation) = self.allocation.lock().unwrap().take() {
                self.shared.allocator.destroy_image(self.image, &mut allocation);
            } else if self.image != vk::Image::null() {
                // Heap-placed images own no allocator block.
                self.shared.device.destroy_image(self.image, None);
            }
        }
    }
}

/// State of one volatile buffer shared between the device and the command
/// lists that write it.
pub(crate) struct VolatileTracking {
    pub versions: VersionTracking,
    pub aligned_version_size: u64,
}

pub struct VulkanBuffer {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) desc: BufferDesc,
    pub(crate) buffer: vk::Buffer,
    pub(crate) allocation: Mutex<Option<vk_mem::Allocation>>,
    /// Persistent mapping for host-visible buffers, null otherwise.
    pub(crate) mapped: *mut u8,
    pub(crate) address: u64,
    pub(crate) volatile: Option<VolatileTracking>,
    pub(crate) views: Mutex<HashMap<BufferViewKey, vk::BufferView>>,
    pub(crate) tracking: TrackingId,
}

/// Key of one cached typed buffer view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BufferViewKey {
    pub format: Format,
    pub byte_offset: u64,
    pub byte_size: u64,
}

unsafe impl Send for VulkanBuffer {}
unsafe impl Sync for VulkanBuffer {}

impl VulkanBuffer {
    pub(crate) fn volatile_tracking(&self) -> Result<&VolatileTracking> {
        self.volatile.as_ref().ok_or_else(|| {
            GpuError::Misuse(format!("buffer '{}' is not volatile", self.desc.debug_name))
        })
    }

    /// Cached typed view over `range`, for texel-buffer bindings.
    pub(crate) fn get_typed_view(&self, format: Format, range: BufferRange) -> Result<vk::BufferView> {
        let range = range.resolve(&self.desc);
        let format = if format == Format::Unknown {
            self.desc.format
        } else {
            format
        };
        let key = BufferViewKey {
            format,
            byte_offset: range.byte_offset,
            byte_size: range.byte_size,
        };
        let mut views = self.views.lock().unwrap();
        if let Some(view) = views.get(&key) {
            return Ok(*view);
        }
        let view = unsafe {
            self.shared.device.create_buffer_view(
                &vk::BufferViewCreateInfo::builder()
                    .buffer(self.buffer)
                    .format(format.into())
                    .offset(range.byte_offset)
                    .range(range.byte_size),
                None,
            )
        }?;
        views.insert(key, view);
        Ok(view)
    }
}

impl Resource for VulkanBuffer {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Buffer for VulkanBuffer {
    fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    fn device_address(&self) -> u64 {
        self.address
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            for (_, view) in self.views.lock().unwrap().drain() {
                self.shared.device.destroy_buffer_view(view, None);
            }
            if let Some(mut allocation) = self.allocation.lock().unwrap().take() {
                self.shared.allocator.destroy_buffer(self.buffer, &mut allocation);
            } else if self.buffer != vk::Buffer::null() {
                self.shared.device.destroy_buffer(self.buffer, None);
            }
        }
    }
}

pub struct VulkanSampler {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) desc: SamplerDesc,
    pub(crate) sampler: vk::Sampler,
}

impl Resource for VulkanSampler {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Sampler for VulkanSampler {
    fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

impl Drop for VulkanSampler {
    fn drop(&mut self) {
        unsafe { self.shared.device.destroy_sampler(self.sampler, None) };
    }
}

pub struct VulkanShader {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) desc: ShaderDesc,
    pub(crate) module: vk::ShaderModule,
    pub(crate) constants: Vec<ShaderConstant>,
}

impl VulkanShader {
    /// Resolves the permutation for `constants` inside `bytecode` (which may
    /// be a plain SPIR-V stream or a permutation blob) and builds the module.
    pub(crate) fn create(
        shared: Arc<DeviceShared>,
        desc: ShaderDesc,
        bytecode: &[u8],
        constants: &[ShaderConstant],
    ) -> Result<Self> {
        let spirv = find_permutation_in_blob(bytecode, constants).ok_or_else(|| {
            shared.messages.error(&format!(
                "shader '{}' has no permutation matching the requested constants",
                desc.debug_name
            ));
            GpuError::InvalidArgument(format!(
                "no matching shader permutation for '{}'",
                desc.debug_name
            ))
        })?;
        if spirv.len() % 4 != 0 {
            return Err(GpuError::InvalidArgument(format!(
                "shader '{}' bytecode length {} is not a multiple of 4",
                desc.debug_name,
                spirv.len()
            )));
        }
        let words: Vec<u32> = spirv
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let module = unsafe {
            shared
                .device
                .create_shader_module(&vk::ShaderModuleCreateInfo::builder().code(&words), None)
        }?;
        shared.set_debug_name(module, &desc.debug_name);
        Ok(Self {
            shared,
            desc,
            module,
            constants: constants.to_vec(),
        })
    }
}

impl Resource for VulkanShader {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Shader for VulkanShader {
    fn desc(&self) -> &ShaderDesc {
        &self.desc
    }

    fn bytecode(&self) -> Option<&[u8]> {
        None
    }

    fn constants(&self) -> &[ShaderConstant] {
        &self.constants
    }
}

impl Drop for VulkanShader {
    fn drop(&mut self) {
        unsafe { self.shared.device.destroy_shader_module(self.module, None) };
    }
}

pub struct VulkanInputLayout {
    pub(crate) attributes: Vec<VertexAttributeDesc>,
    pub(crate) vk_bindings: Vec<vk::VertexInputBindingDescription>,
    pub(crate) vk_attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VulkanInputLayout {
    pub(crate) fn create(attributes: &[VertexAttributeDesc]) -> Result<Self> {
        let mut bindings: HashMap<u32, vk::VertexInputBindingDescription> = HashMap::new();
        let mut vk_attributes = Vec::with_capacity(attributes.len());
        let mut location = 0u32;

        for attribute in attributes {
            let element_size = crate::format::format_info(attribute.format).bytes_per_block as u32;
            let stride = if attribute.element_stride != 0 {
                attribute.element_stride
            } else {
                attribute.offset + element_size * attribute.array_size
            };
            let binding = bindings
                .entry(attribute.buffer_index)
                .or_insert(vk::VertexInputBindingDescription {
                    binding: attribute.buffer_index,
                    stride,
                    input_rate: if attribute.is_instanced {
                        vk::VertexInputRate::INSTANCE
                    } else {
                        vk::VertexInputRate::VERTEX
                    },
                });
            binding.stride = binding.stride.max(stride);

            // Matrix attributes occupy consecutive locations.
            for element in 0..attribute.array_size {
                vk_attributes.push(vk::VertexInputAttributeDescription {
                    location,
                    binding: attribute.buffer_index,
                    format: attribute.format.into(),
                    offset: attribute.offset + element * element_size,
                });
                location += 1;
            }
        }

        let mut vk_bindings: Vec<_> = bindings.into_values().collect();
        vk_bindings.sort_by_key(|b| b.binding);

        Ok(Self {
            attributes: attributes.to_vec(),
            vk_bindings,
            vk_attributes,
        })
    }
}

impl Resource for VulkanInputLayout {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl InputLayout for VulkanInputLayout {
    fn attributes(&self) -> &[VertexAttributeDesc] {
        &self.attributes
    }
}

/// Event queries record the (queue, submission id) pair they were set on and
/// resolve against that queue's timeline.
pub struct VulkanEventQuery {
    pub(crate) state: Mutex<Option<(QueueKind, u64)>>,
}

impl Resource for VulkanEventQuery {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl EventQuery for VulkanEventQuery {}

/// One pair of timestamp slots in the device's shared query pool.
pub struct VulkanTimerQuery {
    pub(crate) shared: Arc<DeviceShared>,
    /// Index of the begin timestamp; the end timestamp is `slot + 1`.
    pub(crate) slot: u32,
    pub(crate) state: Mutex<TimerQueryState>,
}

#[derive(Default)]
pub(crate) struct TimerQueryState {
    pub started: bool,
    pub resolved: bool,
    pub time_seconds: f32,
}

impl Resource for VulkanTimerQuery {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TimerQuery for VulkanTimerQuery {}

impl Drop for VulkanTimerQuery {
    fn drop(&mut self) {
        self.shared.release_timer_slot(self.slot);
    }
}

pub struct VulkanHeap {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) capacity: u64,
}

impl Resource for VulkanHeap {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Heap for VulkanHeap {
    fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl Drop for VulkanHeap {
    fn drop(&mut self) {
        unsafe { self.shared.device.free_memory(self.memory, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stencil_srv_routes_first_component_into_g() {
        let mapping =
            view_component_mapping(AccessIntent::ShaderResource, ViewAspect::StencilOnly);
        assert_eq!(mapping.g, vk::ComponentSwizzle::R);
        assert_eq!(mapping.r, vk::ComponentSwizzle::IDENTITY);
        assert_eq!(mapping.b, vk::ComponentSwizzle::IDENTITY);
        assert_eq!(mapping.a, vk::ComponentSwizzle::IDENTITY);
    }

    #[test]
    fn non_stencil_views_keep_identity_swizzle() {
        let identity = vk::ComponentMapping::default();
        let depth =
            view_component_mapping(AccessIntent::ShaderResource, ViewAspect::DepthOnly);
        assert_eq!(depth.g, identity.g);
        // Attachments never swizzle, even on the stencil aspect.
        let dsv = view_component_mapping(AccessIntent::DepthStencil, ViewAspect::StencilOnly);
        assert_eq!(dsv.g, identity.g);
        assert_eq!(dsv.r, identity.r);
    }
}
