//! Ray tracing acceleration structures. Geometry translation is shared
//! between the size query at creation and the build commands.

use super::resources::next_tracking_id;
use super::DeviceShared;
use crate::error::{GpuError, Result};
use crate::traits::{AccelStruct, Resource};
use crate::types::*;
use ash::vk;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use vk_mem::Alloc;

pub(crate) fn build_flags(flags: AccelStructBuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut result = vk::BuildAccelerationStructureFlagsKHR::empty();
    if flags.contains(AccelStructBuildFlags::ALLOW_UPDATE) {
        result |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    if flags.contains(AccelStructBuildFlags::ALLOW_COMPACTION) {
        result |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
    }
    if flags.contains(AccelStructBuildFlags::PREFER_FAST_TRACE) {
        result |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    }
    if flags.contains(AccelStructBuildFlags::PREFER_FAST_BUILD) {
        result |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD;
    }
    if flags.contains(AccelStructBuildFlags::MINIMIZE_MEMORY) {
        result |= vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY;
    }
    result
}

fn geometry_flags(flags: GeometryFlags) -> vk::GeometryFlagsKHR {
    let mut result = vk::GeometryFlagsKHR::empty();
    if flags.contains(GeometryFlags::OPAQUE) {
        result |= vk::GeometryFlagsKHR::OPAQUE;
    }
    if flags.contains(GeometryFlags::NO_DUPLICATE_ANY_HIT) {
        result |= vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION;
    }
    result
}

fn buffer_address(buffer: &Option<crate::traits::BufferHandle>, offset: u64) -> Result<u64> {
    match buffer {
        Some(buffer) => Ok(super::vk_buffer(buffer)?.address + offset),
        None => Ok(0),
    }
}

/// Translates one geometry into its Vulkan description and primitive count.
/// Buffer addresses are resolved when present; the size query passes descs
/// without buffers and gets null addresses, which is what it expects.
pub(crate) fn translate_geometry(
    geometry: &GeometryDesc,
) -> Result<(vk::AccelerationStructureGeometryKHR, u32)> {
    match &geometry.data {
        GeometryData::Triangles(triangles) => {
            let indexed = triangles.index_buffer.is_some();
            let vk_triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                .vertex_format(triangles.vertex_format.into())
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: buffer_address(
                        &triangles.vertex_buffer,
                        triangles.vertex_offset,
                    )?,
                })
                .vertex_stride(triangles.vertex_stride as u64)
                .max_vertex(triangles.vertex_count.saturating_sub(1))
                .index_type(if indexed {
                    match triangles.index_format {
                        IndexFormat::U16 => vk::IndexType::UINT16,
                        IndexFormat::U32 => vk::IndexType::UINT32,
                    }
                } else {
                    vk::IndexType::NONE_KHR
                })
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: buffer_address(&triangles.index_buffer, triangles.index_offset)?,
                })
                .build();
            let primitives = if indexed {
                triangles.index_count / 3
            } else {
                triangles.vertex_count / 3
            };
            Ok((
                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        triangles: vk_triangles,
                    })
                    .flags(geometry_flags(geometry.flags))
                    .build(),
                primitives,
            ))
        }
        GeometryData::Aabbs(aabbs) => {
            let vk_aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::builder()
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: buffer_address(&aabbs.buffer, aabbs.offset)?,
                })
                .stride(aabbs.stride as u64)
                .build();
            Ok((
                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::AABBS)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs: vk_aabbs })
                    .flags(geometry_flags(geometry.flags))
                    .build(),
                aabbs.count,
            ))
        }
    }
}

/// The instances geometry of a top-level build reading packed
/// [`InstanceDesc`] records at `instance_address`.
pub(crate) fn instances_geometry(instance_address: u64) -> vk::AccelerationStructureGeometryKHR {
    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instance_address,
                })
                .build(),
        })
        .build()
}

pub(crate) struct AccelSizes {
    pub structure: u64,
    pub build_scratch: u64,
    pub update_scratch: u64,
}

pub(crate) fn query_sizes(shared: &DeviceShared, desc: &AccelStructDesc) -> Result<AccelSizes> {
    let loader = shared
        .accel
        .as_ref()
        .ok_or(GpuError::NotSupported("acceleration structures"))?;

    let mut geometries = Vec::new();
    let mut max_counts = Vec::new();
    if desc.is_top_level {
        geometries.push(instances_geometry(0));
        max_counts.push(desc.max_instances);
    } else {
        for geometry in &desc.geometries {
            let (vk_geometry, count) = translate_geometry(geometry)?;
            geometries.push(vk_geometry);
            max_counts.push(count);
        }
    }

    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(if desc.is_top_level {
            vk::AccelerationStructureTypeKHR::TOP_LEVEL
        } else {
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
        })
        .flags(build_flags(desc.build_flags))
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries)
        .build();

    let sizes = unsafe {
        loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &max_counts,
        )
    };
    Ok(AccelSizes {
        structure: sizes.acceleration_structure_size,
        build_scratch: sizes.build_scratch_size,
        update_scratch: sizes.update_scratch_size,
    })
}

pub struct VulkanAccelStruct {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) desc: AccelStructDesc,
    pub(crate) buffer: vk::Buffer,
    pub(crate) allocation: Mutex<Option<vk_mem::Allocation>>,
    /// Null until memory is bound for virtual structures.
    raw: Mutex<vk::AccelerationStructureKHR>,
    address: AtomicU64,
    pub(crate) size: u64,
    pub(crate) build_scratch_size: u64,
    pub(crate) update_scratch_size: u64,
    pub(crate) tracking: crate::state_tracking::TrackingId,
}

unsafe impl Send for VulkanAccelStruct {}
unsafe impl Sync for VulkanAccelStruct {}

impl VulkanAccelStruct {
    pub(crate) fn create(shared: Arc<DeviceShared>, desc: AccelStructDesc) -> Result<Self> {
        let sizes = query_sizes(&shared, &desc)?;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(sizes.structure)
            .usage(
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (buffer, allocation) = if desc.is_virtual {
            let buffer = unsafe { shared.device.create_buffer(&buffer_info, None) }?;
            (buffer, None)
        } else {
            let create = vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::Auto,
                ..Default::default()
            };
            let (buffer, allocation) =
                unsafe { shared.allocator.create_buffer(&buffer_info, &create) }?;
            (buffer, Some(allocation))
        };
        shared.set_debug_name(buffer, &desc.debug_name);

        let result = Self {
            shared,
            desc,
            buffer,
            allocation: Mutex::new(allocation),
            raw: Mutex::new(vk::AccelerationStructureKHR::null()),
            address: AtomicU64::new(0),
            size: sizes.structure,
            build_scratch_size: sizes.build_scratch,
            update_scratch_size: sizes.update_scratch,
            tracking: next_tracking_id(),
        };
        if !result.desc.is_virtual {
            result.create_structure()?;
        }
        Ok(result)
    }

    fn create_structure(&self) -> Result<()> {
        let loader = self
            .shared
            .accel
            .as_ref()
            .ok_or(GpuError::NotSupported("acceleration structures"))?;
        let raw = unsafe {
            loader.create_acceleration_structure(
                &vk::AccelerationStructureCreateInfoKHR::builder()
                    .buffer(self.buffer)
                    .offset(0)
                    .size(self.size)
                    .ty(if self.desc.is_top_level {
                        vk::AccelerationStructureTypeKHR::TOP_LEVEL
                    } else {
                        vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
                    }),
                None,
            )
        }?;
        let address = unsafe {
            loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                    .acceleration_structure(raw),
            )
        };
        *self.raw.lock().unwrap() = raw;
        self.address.store(address, Ordering::Release);
        Ok(())
    }

    /// Binds heap memory under a virtual structure and creates the Vulkan
    /// object. Must happen before the first build.
    pub(crate) fn bind_memory(&self, memory: vk::DeviceMemory, offset: u64) -> Result<()> {
        if !self.desc.is_virtual {
            return Err(GpuError::Misuse(
                "bind_accel_struct_memory requires a virtual acceleration structure".into(),
            ));
        }
        if *self.raw.lock().unwrap() != vk::AccelerationStructureKHR::null() {
            return Err(GpuError::Misuse(
                "acceleration structure memory is already bound".into(),
            ));
        }
        unsafe { self.shared.device.bind_buffer_memory(self.buffer, memory, offset) }?;
        self.create_structure()
    }

    pub(crate) fn raw(&self) -> vk::AccelerationStructureKHR {
        *self.raw.lock().unwrap()
    }
}

impl Resource for VulkanAccelStruct {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl AccelStruct for VulkanAccelStruct {
    fn desc(&self) -> &AccelStructDesc {
        &self.desc
    }

    fn device_address(&self) -> u64 {
        self.address.load(Ordering::Acquire)
    }
}

impl Drop for VulkanAccelStruct {
    fn drop(&mut self) {
        let raw = *self.raw.lock().unwrap();
        if raw != vk::AccelerationStructureKHR::null() {
            if let Some(loader) = self.shared.accel.as_ref() {
                unsafe { loader.destroy_acceleration_structure(raw, None) };
            }
        }
        let mut allocation = self.allocation.lock().unwrap();
        match allocation.take() {
            Some(mut allocation) => unsafe {
                self.shared.allocator.destroy_buffer(self.buffer, &mut allocation)
            },
            None => unsafe { self.shared.device.destroy_buffer(self.buffer, None) },
        }
    }
}
