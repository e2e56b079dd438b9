//! Binding layouts, binding sets, and bindless descriptor tables. Slot and
//! pool-size metadata is computed once at creation; set time only binds.

use super::convert::descriptor_type;
use super::resources::{TextureViewKey, VulkanBuffer, VulkanSampler, VulkanTexture};
use super::{vk_accel_struct, DeviceShared};
use crate::binding::BindingSlotRanges;
use crate::error::{GpuError, Result};
use crate::traits::{
    BindingLayout, BindingLayoutHandle, BindingSet, DescriptorTable, Resource,
};
use crate::types::*;
use crate::Format;
use ash::vk;
use std::any::Any;
use std::sync::{Arc, Mutex};

pub struct VulkanBindingLayout {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) desc: Option<BindingLayoutDesc>,
    pub(crate) bindless: Option<BindlessLayoutDesc>,
    pub(crate) set_layout: vk::DescriptorSetLayout,
    pub(crate) pool_sizes: Vec<vk::DescriptorPoolSize>,
    pub(crate) push_constant_size: u32,
    pub(crate) push_constant_stages: vk::ShaderStageFlags,
    pub(crate) slot_ranges: BindingSlotRanges,
}

impl VulkanBindingLayout {
    pub(crate) fn create(shared: Arc<DeviceShared>, desc: BindingLayoutDesc) -> Result<Self> {
        let visibility: vk::ShaderStageFlags = desc.visibility.into();
        let mut bindings = Vec::with_capacity(desc.bindings.len());
        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        let mut push_constant_size = 0u32;

        for item in &desc.bindings {
            let Some(ty) = descriptor_type(item.ty) else {
                push_constant_size = push_constant_size.max(item.size);
                continue;
            };
            let class = item.ty.register_class();
            let slot = item.slot + desc.binding_offsets.offset_for(class);
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(slot)
                    .descriptor_type(ty)
                    .descriptor_count(item.size.max(1))
                    .stage_flags(visibility)
                    .build(),
            );
            match pool_sizes.iter_mut().find(|p| p.ty == ty) {
                Some(pool) => pool.descriptor_count += item.size.max(1),
                None => pool_sizes.push(vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: item.size.max(1),
                }),
            }
        }

        let set_layout = unsafe {
            shared.device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings),
                None,
            )
        }?;
        shared.set_debug_name(set_layout, &desc.debug_name);

        let slot_ranges = BindingSlotRanges::from_layout(&desc);
        Ok(Self {
            shared,
            push_constant_stages: visibility,
            desc: Some(desc),
            bindless: None,
            set_layout,
            pool_sizes,
            push_constant_size,
            slot_ranges,
        })
    }

    pub(crate) fn create_bindless(
        shared: Arc<DeviceShared>,
        desc: BindlessLayoutDesc,
    ) -> Result<Self> {
        let visibility: vk::ShaderStageFlags = desc.visibility.into();
        let mut bindings = Vec::with_capacity(desc.register_spaces.len());
        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        let mut flags = Vec::with_capacity(desc.register_spaces.len());

        for (space, item) in desc.register_spaces.iter().enumerate() {
            let ty = descriptor_type(item.ty).ok_or_else(|| {
                GpuError::InvalidArgument(
                    "push constants cannot appear in a bindless layout".into(),
                )
            })?;
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(space as u32)
                    .descriptor_type(ty)
                    .descriptor_count(desc.max_capacity)
                    .stage_flags(visibility)
                    .build(),
            );
            // Slots may be written sparsely; the GPU only reads live entries.
            flags.push(vk::DescriptorBindingFlags::PARTIALLY_BOUND);
            match pool_sizes.iter_mut().find(|p| p.ty == ty) {
                Some(pool) => pool.descriptor_count += desc.max_capacity,
                None => pool_sizes.push(vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: desc.max_capacity,
                }),
            }
        }

        let mut binding_flags =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&flags);
        let set_layout = unsafe {
            shared.device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder()
                    .bindings(&bindings)
                    .push_next(&mut binding_flags),
                None,
            )
        }?;
        shared.set_debug_name(set_layout, &desc.debug_name);

        Ok(Self {
            shared,
            push_constant_stages: visibility,
            desc: None,
            bindless: Some(desc),
            set_layout,
            pool_sizes,
            push_constant_size: 0,
            slot_ranges: BindingSlotRanges::default(),
        })
    }
}

impl Resource for VulkanBindingLayout {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl BindingLayout for VulkanBindingLayout {
    fn desc(&self) -> Option<&BindingLayoutDesc> {
        self.desc.as_ref()
    }

    fn bindless_desc(&self) -> Option<&BindlessLayoutDesc> {
        self.bindless.as_ref()
    }
}

impl Drop for VulkanBindingLayout {
    fn drop(&mut self) {
        unsafe {
            self.shared
                .device
                .destroy_descriptor_set_layout(self.set_layout, None)
        };
    }
}

pub struct VulkanBindingSet {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) desc: BindingSetDesc,
    pub(crate) layout: BindingLayoutHandle,
    pub(crate) pool: vk::DescriptorPool,
    pub(crate) set: vk::DescriptorSet,
    /// Volatile constant buffers in binding order; their dynamic offsets are
    /// resolved per bind from the recording command list's version map.
    pub(crate) volatile_buffers: Vec<crate::traits::BufferHandle>,
    pub(crate) slot_ranges: BindingSlotRanges,
}

impl VulkanBindingSet {
    pub(crate) fn create(
        shared: Arc<DeviceShared>,
        desc: BindingSetDesc,
        layout: &BindingLayoutHandle,
    ) -> Result<Self> {
        let vk_layout = super::vk_binding_layout(layout)?;
        let layout_desc = vk_layout.desc.as_ref().ok_or_else(|| {
            GpuError::InvalidArgument("binding sets require a non-bindless layout".into())
        })?;

        let (pool, set) = allocate_set(&shared, vk_layout)?;
        shared.set_debug_name(set, &desc.debug_name);

        let mut volatile_buffers: Vec<(u32, crate::traits::BufferHandle)> = Vec::new();
        for item in &desc.bindings {
            if !layout_desc
                .bindings
                .iter()
                .any(|b| b.slot == item.slot && b.ty == item.ty)
            {
                return Err(GpuError::InvalidArgument(format!(
                    "binding set '{}' item at slot {} has no layout counterpart",
                    desc.debug_name, item.slot
                )));
            }
            let binding =
                item.slot + layout_desc.binding_offsets.offset_for(item.ty.register_class());
            write_descriptor(&shared, set, binding, 0, item)?;

            if item.ty == ResourceType::VolatileConstantBuffer {
                if let ResourceBinding::ConstantBuffer { buffer, .. } = &item.resource {
                    volatile_buffers.push((binding, buffer.clone()));
                }
            }
        }
        // Dynamic offsets are consumed in binding-number order at bind time.
        volatile_buffers.sort_by_key(|(binding, _)| *binding);
        let volatile_buffers = volatile_buffers.into_iter().map(|(_, b)| b).collect();

        Ok(Self {
            shared,
            desc,
            layout: layout.clone(),
            pool,
            set,
            volatile_buffers,
            slot_ranges: vk_layout.slot_ranges,
        })
    }
}

impl Resource for VulkanBindingSet {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl BindingSet for VulkanBindingSet {
    fn desc(&self) -> &BindingSetDesc {
        &self.desc
    }

    fn layout(&self) -> &BindingLayoutHandle {
        &self.layout
    }
}

impl Drop for VulkanBindingSet {
    fn drop(&mut self) {
        unsafe { self.shared.device.destroy_descriptor_pool(self.pool, None) };
    }
}

/// Pre-allocated at `max_capacity`; writes update single descriptors in
/// place and reads are lock-free on the GPU timeline.
pub struct VulkanDescriptorTable {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) layout: BindingLayoutHandle,
    pub(crate) pool: vk::DescriptorPool,
    pub(crate) set: vk::DescriptorSet,
    pub(crate) capacity: u32,
    /// Strong references keeping written resources alive, indexed by slot.
    pub(crate) retained: Mutex<Vec<Option<ResourceBinding>>>,
}

impl VulkanDescriptorTable {
    pub(crate) fn create(shared: Arc<DeviceShared>, layout: &BindingLayoutHandle) -> Result<Self> {
        let vk_layout = super::vk_binding_layout(layout)?;
        let bindless = vk_layout.bindless.as_ref().ok_or_else(|| {
            GpuError::InvalidArgument("descriptor tables require a bindless layout".into())
        })?;
        let (pool, set) = allocate_set(&shared, vk_layout)?;
        shared.set_debug_name(set, &bindless.debug_name);
        let capacity = bindless.max_capacity;
        Ok(Self {
            shared,
            layout: layout.clone(),
            pool,
            set,
            capacity,
            retained: Mutex::new(vec![None; capacity as usize]),
        })
    }

    pub(crate) fn write(&self, item: &BindingSetItem) -> Result<()> {
        let vk_layout = super::vk_binding_layout(&self.layout)?;
        let bindless = vk_layout.bindless.as_ref().unwrap();
        if item.slot >= self.capacity {
            return Err(GpuError::InvalidArgument(format!(
                "descriptor table write at slot {} exceeds capacity {}",
                item.slot, self.capacity
            )));
        }
        let space = bindless
            .register_spaces
            .iter()
            .position(|s| s.ty.register_class() == item.ty.register_class())
            .ok_or_else(|| {
                GpuError::InvalidArgument(
                    "descriptor table write does not match any register space".into(),
                )
            })?;
        write_descriptor(&self.shared, self.set, space as u32, item.slot, item)?;
        self.retained.lock().unwrap()[item.slot as usize] = Some(item.resource.clone());
        Ok(())
    }
}

impl Resource for VulkanDescriptorTable {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl DescriptorTable for VulkanDescriptorTable {
    fn layout(&self) -> &BindingLayoutHandle {
        &self.layout
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Drop for VulkanDescriptorTable {
    fn drop(&mut self) {
        unsafe { self.shared.device.destroy_descriptor_pool(self.pool, None) };
    }
}

fn allocate_set(
    shared: &DeviceShared,
    layout: &VulkanBindingLayout,
) -> Result<(vk::DescriptorPool, vk::DescriptorSet)> {
    let pool = unsafe {
        shared.device.create_descriptor_pool(
            &vk::DescriptorPoolCreateInfo::builder()
                .max_sets(1)
                .pool_sizes(&layout.pool_sizes),
            None,
        )
    }?;
    let set_layouts = [layout.set_layout];
    let sets = unsafe {
        shared.device.allocate_descriptor_sets(
            &vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .set_layouts(&set_layouts),
        )
    };
    match sets {
        Ok(sets) => Ok((pool, sets[0])),
        Err(err) => {
            unsafe { shared.device.destroy_descriptor_pool(pool, None) };
            Err(err.into())
        }
    }
}

/// Writes one binding-set item into `set` at `(binding, array_element)`.
pub(crate) fn write_descriptor(
    shared: &DeviceShared,
    set: vk::DescriptorSet,
    binding: u32,
    array_element: u32,
    item: &BindingSetItem,
) -> Result<()> {
    let Some(ty) = descriptor_type(item.ty) else {
        // Push constants are set on the pipeline layout, not the set.
        return Ok(());
    };
    let mut write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(array_element)
        .descriptor_type(ty);

    let image_info;
    let buffer_info;
    let texel_view;
    let accel_handle;
    let mut accel_write;

    match &item.resource {
        ResourceBinding::None => return Ok(()),
        ResourceBinding::Texture {
            texture,
            subresources,
            format,
            dimension,
        } => {
            let vk_texture: &VulkanTexture = super::vk_texture(texture)?;
            let is_uav = item.ty == ResourceType::TextureUav;
            let view = vk_texture.get_view(TextureViewKey {
                subresources: *subresources,
                format: format.unwrap_or(vk_texture.desc.format),
                dimension: dimension.unwrap_or(vk_texture.desc.dimension),
                intent: if is_uav {
                    AccessIntent::UnorderedAccess
                } else {
                    AccessIntent::ShaderResource
                },
                aspect: ViewAspect::AllAspects,
            })?;
            image_info = [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view,
                image_layout: if is_uav {
                    vk::ImageLayout::GENERAL
                } else {
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                },
            }];
            write = write.image_info(&image_info);
            unsafe {
                shared.device.update_descriptor_sets(&[write.build()], &[]);
            }
        }
        ResourceBinding::Buffer {
            buffer,
            range,
            format,
        } => {
            let vk_buffer: &VulkanBuffer = super::vk_buffer(buffer)?;
            match item.ty {
                ResourceType::TypedBufferSrv | ResourceType::TypedBufferUav => {
                    texel_view = [vk_buffer.get_typed_view(format.unwrap_or(Format::Unknown), *range)?];
                    write = write.texel_buffer_view(&texel_view);
                    unsafe {
                        shared.device.update_descriptor_sets(&[write.build()], &[]);
                    }
                }
                _ => {
                    let range = range.resolve(&vk_buffer.desc);
                    buffer_info = [vk::DescriptorBufferInfo {
                        buffer: vk_buffer.buffer,
                        offset: range.byte_offset,
                        range: range.byte_size,
                    }];
                    write = write.buffer_info(&buffer_info);
                    unsafe {
                        shared.device.update_descriptor_sets(&[write.build()], &[]);
                    }
                }
            }
        }
        ResourceBinding::ConstantBuffer { buffer, range } => {
            let vk_buffer: &VulkanBuffer = super::vk_buffer(buffer)?;
            let (offset, size) = if let Some(volatile) = &vk_buffer.volatile {
                // Dynamic offsets select the version at bind time.
                (0, volatile.aligned_version_size.min(vk_buffer.desc.byte_size))
            } else {
                let range = range.resolve(&vk_buffer.desc);
                (range.byte_offset, range.byte_size)
            };
            buffer_info = [vk::DescriptorBufferInfo {
                buffer: vk_buffer.buffer,
                offset,
                range: size,
            }];
            write = write.buffer_info(&buffer_info);
            unsafe {
                shared.device.update_descriptor_sets(&[write.build()], &[]);
            }
        }
        ResourceBinding::Sampler(sampler) => {
            let vk_sampler: &VulkanSampler = super::vk_sampler(sampler)?;
            image_info = [vk::DescriptorImageInfo {
                sampler: vk_sampler.sampler,
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            }];
            write = write.image_info(&image_info);
            unsafe {
                shared.device.update_descriptor_sets(&[write.build()], &[]);
            }
        }
        ResourceBinding::PushConstants { .. } => return Ok(()),
        ResourceBinding::AccelStruct(accel) => {
            accel_handle = [vk_accel_struct(accel)?.raw()];
            accel_write = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                .acceleration_structures(&accel_handle)
                .build();
            // The count is normally inferred from the info arrays; the accel
            // payload travels on the pNext chain instead.
            let mut write = write.push_next(&mut accel_write);
            write.descriptor_count = 1;
            unsafe {
                shared.device.update_descriptor_sets(&[write.build()], &[]);
            }
        }
    }
    Ok(())
}
