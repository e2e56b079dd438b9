//! Explicit Vulkan backend: `ash` for the API surface, `vk-mem` for memory,
//! one timeline semaphore per queue for submission tracking.
//!
//! The device is split into a thin public [`VulkanDevice`] and an internal
//! [`DeviceShared`] that every resource holds an `Arc` to. Resources outlive
//! the command lists that record against them; the shared block outlives
//! everything created from it.

mod accel;
mod command_list;
mod convert;
mod descriptor;
mod pipeline;
mod queue;
mod resources;

use crate::error::{GpuError, MessageSink, Result};
use crate::format::{format_info, Format};
use crate::traits::*;
use crate::types::*;
use crate::versioning::VersionTracking;
use ash::extensions::{ext, khr, nv};
use ash::vk;
use ash::vk::Handle;
use ash::Entry;
use command_list::VulkanCommandList;
use descriptor::{VulkanBindingLayout, VulkanBindingSet, VulkanDescriptorTable};
use pipeline::{
    VulkanComputePipeline, VulkanFramebuffer, VulkanGraphicsPipeline, VulkanMeshPipeline,
    VulkanRayTracingPipeline,
};
use queue::VulkanQueue;
use resources::{
    align_u64, next_tracking_id, StagingStorage, VolatileTracking, VulkanBuffer,
    VulkanEventQuery, VulkanHeap, VulkanInputLayout, VulkanSampler, VulkanShader, VulkanTexture,
    VulkanTimerQuery,
};
use std::ffi::{c_char, c_void, CStr, CString};
use std::mem::ManuallyDrop;
use vk_mem::Alloc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Two timestamps per timer query.
const TIMER_QUERY_COUNT: u32 = 1024;

/// Parameters for [`VulkanDevice::new`].
#[derive(Clone, Default)]
pub struct VulkanDeviceDesc {
    /// Index into the physical-device enumeration.
    pub device_id: usize,
    pub enable_validation: bool,
    /// Capabilities to enable when the implementation supports them. Toggles
    /// the implementation cannot satisfy are silently downgraded; the final
    /// set is answered by `query_feature_support`.
    pub features: DeviceFeatures,
    pub message_callback: Option<crate::error::MessageCallback>,
}

/// Ray-tracing limits copied out of the pipeline properties at startup.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_base_alignment: u32,
    pub shader_group_handle_alignment: u32,
}

struct TimerSlots {
    free: Vec<u32>,
    next: u32,
}

pub(crate) struct DeviceShared {
    // Field order is load-bearing for Drop.
    pub(crate) allocator: ManuallyDrop<vk_mem::Allocator>,
    pub(crate) queues: [Option<Arc<VulkanQueue>>; MAX_QUEUES],
    pub(crate) device: ash::Device,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) instance: ash::Instance,
    #[allow(dead_code)]
    pub(crate) entry: Entry,

    pub(crate) messages: MessageSink,
    pub(crate) features: DeviceFeatures,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) rt_properties: RayTracingProperties,
    pub(crate) scratch_alignment: u64,
    pub(crate) shading_rate_texel_size: vk::Extent2D,
    pub(crate) timestamp_period: f32,

    pub(crate) accel: Option<khr::AccelerationStructure>,
    pub(crate) ray_pipeline: Option<khr::RayTracingPipeline>,
    pub(crate) mesh: Option<nv::MeshShader>,
    /// Raw fn table; ash 0.37 has no high-level wrapper for this extension.
    pub(crate) shading_rate: Option<vk::KhrFragmentShadingRateFn>,
    pub(crate) debug_utils: Option<ext::DebugUtils>,
    debug_messenger: vk::DebugUtilsMessengerEXT,

    /// Bound in place of holes when register spaces select descriptor sets.
    pub(crate) empty_set_layout: vk::DescriptorSetLayout,
    pub(crate) timer_query_pool: vk::QueryPool,
    timer_slots: Mutex<TimerSlots>,

    pub(crate) device_lost: AtomicBool,
}

// Raw Vulkan handles and the loader tables are freely shareable; every
// mutable piece above sits behind a Mutex or an atomic.
unsafe impl Send for DeviceShared {}
unsafe impl Sync for DeviceShared {}

impl DeviceShared {
    /// The queue serving `kind`. Kinds without a dedicated queue fold into
    /// the graphics queue.
    pub(crate) fn queue(&self, kind: QueueKind) -> Arc<VulkanQueue> {
        match &self.queues[kind.index()] {
            Some(queue) => queue.clone(),
            None => self.queues[QueueKind::Graphics.index()]
                .clone()
                .expect("graphics queue exists for the lifetime of the device"),
        }
    }

    /// Last finished submission id per queue kind, folded queues included.
    pub(crate) fn last_finished_snapshot(&self) -> [u64; MAX_QUEUES] {
        let mut snapshot = [0u64; MAX_QUEUES];
        for (index, slot) in snapshot.iter_mut().enumerate() {
            if let Some(kind) = QueueKind::from_index(index) {
                *slot = self.queue(kind).last_finished_id();
            }
        }
        snapshot
    }

    pub(crate) fn set_debug_name<T: Handle>(&self, object: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        if name.is_empty() {
            return;
        }
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(T::TYPE)
            .object_handle(object.as_raw())
            .object_name(&name);
        unsafe {
            let _ = debug_utils.debug_utils_set_object_name(self.device.handle(), &info);
        }
    }

    pub(crate) fn allocate_timer_slot(&self) -> Result<u32> {
        let mut slots = self.timer_slots.lock().unwrap();
        if let Some(slot) = slots.free.pop() {
            return Ok(slot);
        }
        let slot = slots.next * 2;
        if slot + 1 >= TIMER_QUERY_COUNT {
            return Err(GpuError::OutOfSlots("timer query slots"));
        }
        slots.next += 1;
        Ok(slot)
    }

    pub(crate) fn release_timer_slot(&self, slot: u32) {
        self.timer_slots.lock().unwrap().free.push(slot);
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            // Queues destroy their command pools and timeline semaphores.
            for queue in self.queues.iter_mut() {
                queue.take();
            }
            self.device.destroy_query_pool(self.timer_query_pool, None);
            self.device
                .destroy_descriptor_set_layout(self.empty_set_layout, None);
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            if let Some(debug_utils) = &self.debug_utils {
                if self.debug_messenger != vk::DebugUtilsMessengerEXT::null() {
                    debug_utils.destroy_debug_utils_messenger(self.debug_messenger, None);
                }
            }
            self.instance.destroy_instance(None);
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

downcast_fn!(vk_texture, TextureHandle, VulkanTexture, "texture from another backend");
downcast_fn!(vk_buffer, BufferHandle, VulkanBuffer, "buffer from another backend");
downcast_fn!(vk_sampler, SamplerHandle, VulkanSampler, "sampler from another backend");
downcast_fn!(vk_shader, ShaderHandle, VulkanShader, "shader from another backend");
downcast_fn!(
    vk_input_layout,
    InputLayoutHandle,
    VulkanInputLayout,
    "input layout from another backend"
);
downcast_fn!(
    vk_framebuffer,
    FramebufferHandle,
    VulkanFramebuffer,
    "framebuffer from another backend"
);
downcast_fn!(
    vk_graphics_pipeline,
    GraphicsPipelineHandle,
    VulkanGraphicsPipeline,
    "graphics pipeline from another backend"
);
downcast_fn!(
    vk_compute_pipeline,
    ComputePipelineHandle,
    VulkanComputePipeline,
    "compute pipeline from another backend"
);
downcast_fn!(
    vk_mesh_pipeline,
    MeshPipelineHandle,
    VulkanMeshPipeline,
    "mesh pipeline from another backend"
);
downcast_fn!(
    vk_ray_tracing_pipeline,
    RayTracingPipelineHandle,
    VulkanRayTracingPipeline,
    "ray tracing pipeline from another backend"
);
downcast_fn!(
    vk_binding_layout,
    BindingLayoutHandle,
    VulkanBindingLayout,
    "binding layout from another backend"
);
downcast_fn!(
    vk_binding_set,
    BindingSetHandle,
    VulkanBindingSet,
    "binding set from another backend"
);
downcast_fn!(
    vk_accel_struct,
    AccelStructHandle,
    VulkanAccelStruct,
    "acceleration structure from another backend"
);
downcast_fn!(
    vk_timer_query,
    TimerQueryHandle,
    VulkanTimerQuery,
    "timer query from another backend"
);
downcast_fn!(
    vk_event_query,
    EventQueryHandle,
    VulkanEventQuery,
    "event query from another backend"
);
downcast_fn!(vk_heap, HeapHandle, VulkanHeap, "heap from another backend");

use accel::VulkanAccelStruct;

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();
    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("{}", message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("{}", message);
    } else {
        log::debug!("{}", message);
    }
    vk::FALSE
}

pub struct VulkanDevice {
    shared: Arc<DeviceShared>,
}

/// Creates a Vulkan device and returns it behind the backend-neutral trait.
pub fn create_device(desc: &VulkanDeviceDesc) -> Result<DeviceHandle> {
    Ok(Arc::new(VulkanDevice::new(desc)?))
}

impl VulkanDevice {
    pub fn new(desc: &VulkanDeviceDesc) -> Result<Self> {
        let messages = MessageSink::new(desc.message_callback.clone());

        let entry = unsafe { Entry::load() }?;

        let mut inst_layers: Vec<*const c_char> = Vec::new();
        let mut inst_exts: Vec<*const c_char> = Vec::new();
        if desc.enable_validation {
            let available = entry.enumerate_instance_layer_properties()?;
            if available.iter().any(|prop| {
                let name = unsafe { CStr::from_ptr(prop.layer_name.as_ptr()) };
                name == VALIDATION_LAYER
            }) {
                inst_layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                messages.warning("validation requested but the Khronos layer is not installed");
            }
            inst_exts.push(ext::DebugUtils::name().as_ptr());
        }

        let app_info = vk::ApplicationInfo {
            api_version: vk::make_api_version(0, 1, 3, 0),
            ..Default::default()
        };
        let instance = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::builder()
                    .application_info(&app_info)
                    .enabled_layer_names(&inst_layers)
                    .enabled_extension_names(&inst_exts),
                None,
            )
        }?;

        match Self::init_device(desc, messages, entry, instance) {
            Ok(device) => Ok(device),
            Err(err) => Err(err),
        }
    }

    fn init_device(
        desc: &VulkanDeviceDesc,
        messages: MessageSink,
        entry: Entry,
        instance: ash::Instance,
    ) -> Result<Self> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }?;
        let Some(&physical_device) = physical_devices.get(desc.device_id) else {
            unsafe { instance.destroy_instance(None) };
            return Err(GpuError::InvalidArgument(format!(
                "device index {} out of range ({} devices present)",
                desc.device_id,
                physical_devices.len()
            )));
        };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let api_13 = vk::api_version_major(properties.api_version) > 1
            || vk::api_version_minor(properties.api_version) >= 3;
        let api_12 = api_13 || vk::api_version_minor(properties.api_version) >= 2;
        if vk::api_version_major(properties.api_version) == 1 && !api_12 {
            unsafe { instance.destroy_instance(None) };
            return Err(GpuError::NotSupported("Vulkan 1.2"));
        }

        // Queue families: one graphics queue always; dedicated compute and
        // copy queues only when a distinct family provides them.
        let family_props =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let mut gfx_family = None;
        let mut compute_family = None;
        let mut copy_family = None;
        for (index, prop) in family_props.iter().enumerate() {
            let index = index as u32;
            if prop.queue_flags.contains(vk::QueueFlags::GRAPHICS) && gfx_family.is_none() {
                gfx_family = Some(index);
            } else if prop.queue_flags.contains(vk::QueueFlags::COMPUTE)
                && compute_family.is_none()
            {
                compute_family = Some(index);
            } else if prop.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && copy_family.is_none()
            {
                copy_family = Some(index);
            }
        }
        let Some(gfx_family) = gfx_family else {
            unsafe { instance.destroy_instance(None) };
            return Err(GpuError::NotSupported("graphics queue family"));
        };

        let priorities = [1.0];
        let mut unique_families = vec![gfx_family];
        unique_families.extend(compute_family);
        unique_families.extend(copy_family);
        let queue_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        // Device extensions, filtered against what the driver offers.
        let available_exts =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }?;
        let has_ext = |name: &CStr| {
            available_exts
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        };
        let ray_tracing_exts = desc.features.ray_tracing
            && has_ext(khr::AccelerationStructure::name())
            && has_ext(khr::RayTracingPipeline::name())
            && has_ext(vk::KhrDeferredHostOperationsFn::name());
        let mesh_ext = desc.features.mesh_shading && has_ext(nv::MeshShader::name());
        let vrs_ext = desc.features.variable_rate_shading
            && has_ext(vk::KhrFragmentShadingRateFn::name());
        let conservative_ext = desc.features.conservative_raster
            && has_ext(vk::ExtConservativeRasterizationFn::name());

        let mut device_exts: Vec<*const c_char> = Vec::new();
        if ray_tracing_exts {
            device_exts.push(khr::AccelerationStructure::name().as_ptr());
            device_exts.push(khr::RayTracingPipeline::name().as_ptr());
            device_exts.push(vk::KhrDeferredHostOperationsFn::name().as_ptr());
        }
        if mesh_ext {
            device_exts.push(nv::MeshShader::name().as_ptr());
        }
        if vrs_ext {
            device_exts.push(vk::KhrFragmentShadingRateFn::name().as_ptr());
        }
        if conservative_ext {
            device_exts.push(vk::ExtConservativeRasterizationFn::name().as_ptr());
        }

        // Query supported features, then enable the supported subset of what
        // was requested.
        let mut query12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut query13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut query_accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut query_rt = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut query_mesh = vk::PhysicalDeviceMeshShaderFeaturesNV::default();
        let mut query_vrs = vk::PhysicalDeviceFragmentShadingRateFeaturesKHR::default();
        let mut feature_query =
            vk::PhysicalDeviceFeatures2::builder().push_next(&mut query12);
        if api_13 {
            feature_query = feature_query.push_next(&mut query13);
        }
        if ray_tracing_exts {
            feature_query = feature_query
                .push_next(&mut query_accel)
                .push_next(&mut query_rt);
        }
        if mesh_ext {
            feature_query = feature_query.push_next(&mut query_mesh);
        }
        if vrs_ext {
            feature_query = feature_query.push_next(&mut query_vrs);
        }
        let mut feature_query = feature_query.build();
        unsafe { instance.get_physical_device_features2(physical_device, &mut feature_query) };
        let base_supported = feature_query.features;

        if query12.timeline_semaphore != vk::TRUE {
            unsafe { instance.destroy_instance(None) };
            return Err(GpuError::NotSupported("timeline semaphores"));
        }

        let ray_tracing = ray_tracing_exts
            && query_accel.acceleration_structure == vk::TRUE
            && query_rt.ray_tracing_pipeline == vk::TRUE;
        let mesh_shading = mesh_ext && query_mesh.mesh_shader == vk::TRUE;
        let variable_rate_shading = vrs_ext
            && query_vrs.pipeline_fragment_shading_rate == vk::TRUE
            && query_vrs.attachment_fragment_shading_rate == vk::TRUE;
        let buffer_device_address = (desc.features.buffer_device_address || ray_tracing)
            && query12.buffer_device_address == vk::TRUE;
        let synchronization2 = desc.features.synchronization2
            && api_13
            && query13.synchronization2 == vk::TRUE;

        if ray_tracing && !buffer_device_address {
            unsafe { instance.destroy_instance(None) };
            return Err(GpuError::NotSupported("bufferDeviceAddress for ray tracing"));
        }

        let features = DeviceFeatures {
            ray_tracing,
            mesh_shading,
            buffer_device_address,
            synchronization2,
            variable_rate_shading,
            conservative_raster: conservative_ext,
        };

        let base_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(base_supported.sampler_anisotropy == vk::TRUE)
            .fill_mode_non_solid(base_supported.fill_mode_non_solid == vk::TRUE)
            .geometry_shader(base_supported.geometry_shader == vk::TRUE)
            .tessellation_shader(base_supported.tessellation_shader == vk::TRUE)
            .multi_draw_indirect(base_supported.multi_draw_indirect == vk::TRUE)
            .independent_blend(base_supported.independent_blend == vk::TRUE)
            .depth_clamp(base_supported.depth_clamp == vk::TRUE)
            .fragment_stores_and_atomics(base_supported.fragment_stores_and_atomics == vk::TRUE)
            .build();
        let mut enable2 = vk::PhysicalDeviceFeatures2::builder()
            .features(base_features)
            .build();
        let mut enable12 = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .buffer_device_address(buffer_device_address)
            .descriptor_indexing(query12.descriptor_indexing == vk::TRUE)
            .sampler_filter_minmax(query12.sampler_filter_minmax == vk::TRUE)
            .build();
        let mut enable13 = vk::PhysicalDeviceVulkan13Features::builder()
            .synchronization2(synchronization2)
            .build();
        let mut enable_accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
            .acceleration_structure(true)
            .build();
        let mut enable_rt = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder()
            .ray_tracing_pipeline(true)
            .build();
        let mut enable_mesh = vk::PhysicalDeviceMeshShaderFeaturesNV::builder()
            .mesh_shader(true)
            .task_shader(query_mesh.task_shader == vk::TRUE)
            .build();
        let mut enable_vrs = vk::PhysicalDeviceFragmentShadingRateFeaturesKHR::builder()
            .pipeline_fragment_shading_rate(true)
            .attachment_fragment_shading_rate(true)
            .build();

        let mut device_ci = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_exts)
            .push_next(&mut enable2)
            .push_next(&mut enable12);
        if api_13 {
            device_ci = device_ci.push_next(&mut enable13);
        }
        if ray_tracing {
            device_ci = device_ci.push_next(&mut enable_accel).push_next(&mut enable_rt);
        }
        if mesh_shading {
            device_ci = device_ci.push_next(&mut enable_mesh);
        }
        if variable_rate_shading {
            device_ci = device_ci.push_next(&mut enable_vrs);
        }

        let device =
            match unsafe { instance.create_device(physical_device, &device_ci, None) } {
                Ok(device) => device,
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(err.into());
                }
            };

        // From here on cleanup runs through DeviceShared::drop.
        Self::finish_device(
            desc,
            messages,
            entry,
            instance,
            physical_device,
            properties,
            device,
            features,
            (gfx_family, compute_family, copy_family),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_device(
        desc: &VulkanDeviceDesc,
        messages: MessageSink,
        entry: Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        properties: vk::PhysicalDeviceProperties,
        device: ash::Device,
        features: DeviceFeatures,
        families: (u32, Option<u32>, Option<u32>),
    ) -> Result<Self> {
        let (gfx_family, compute_family, copy_family) = families;

        let make_queue = |family: u32, kind: QueueKind| -> Result<Arc<VulkanQueue>> {
            let raw = unsafe { device.get_device_queue(family, 0) };
            Ok(Arc::new(VulkanQueue::new(device.clone(), raw, family, kind)?))
        };
        let queues: [Option<Arc<VulkanQueue>>; MAX_QUEUES] = [
            Some(make_queue(gfx_family, QueueKind::Graphics)?),
            compute_family
                .map(|family| make_queue(family, QueueKind::Compute))
                .transpose()?,
            copy_family
                .map(|family| make_queue(family, QueueKind::Copy))
                .transpose()?,
        ];

        let accel = features
            .ray_tracing
            .then(|| khr::AccelerationStructure::new(&instance, &device));
        let ray_pipeline = features
            .ray_tracing
            .then(|| khr::RayTracingPipeline::new(&instance, &device));
        let mesh = features
            .mesh_shading
            .then(|| nv::MeshShader::new(&instance, &device));
        let shading_rate = features.variable_rate_shading.then(|| {
            vk::KhrFragmentShadingRateFn::load(|name| unsafe {
                std::mem::transmute(instance.get_device_proc_addr(device.handle(), name.as_ptr()))
            })
        });

        // Extension limits come from one chained properties query.
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut vrs_props = vk::PhysicalDeviceFragmentShadingRatePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::builder();
        if features.ray_tracing {
            props2 = props2.push_next(&mut rt_props).push_next(&mut accel_props);
        }
        if features.variable_rate_shading {
            props2 = props2.push_next(&mut vrs_props);
        }
        let mut props2 = props2.build();
        unsafe { instance.get_physical_device_properties2(physical_device, &mut props2) };

        let rt_properties = RayTracingProperties {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
        };
        let scratch_alignment = match accel_props.min_acceleration_structure_scratch_offset_alignment
        {
            0 => 256,
            value => value as u64,
        };
        let shading_rate_texel_size =
            match vrs_props.min_fragment_shading_rate_attachment_texel_size {
                vk::Extent2D {
                    width: 0,
                    height: 0,
                } => vk::Extent2D {
                    width: 16,
                    height: 16,
                },
                extent => extent,
            };

        let allocator = vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
            &instance,
            &device,
            physical_device,
        ))?;

        let (debug_utils, debug_messenger) = if desc.enable_validation {
            let debug_utils = ext::DebugUtils::new(&entry, &instance);
            let messenger_ci = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));
            let messenger = unsafe {
                debug_utils.create_debug_utils_messenger(&messenger_ci, None)
            }
            .unwrap_or(vk::DebugUtilsMessengerEXT::null());
            (Some(debug_utils), messenger)
        } else {
            (None, vk::DebugUtilsMessengerEXT::null())
        };

        let empty_set_layout = unsafe {
            device.create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::builder(), None)
        }?;
        let timer_query_pool = unsafe {
            device.create_query_pool(
                &vk::QueryPoolCreateInfo::builder()
                    .query_type(vk::QueryType::TIMESTAMP)
                    .query_count(TIMER_QUERY_COUNT),
                None,
            )
        }?;

        let shared = Arc::new(DeviceShared {
            allocator: ManuallyDrop::new(allocator),
            queues,
            device,
            physical_device,
            instance,
            entry,
            messages,
            features,
            timestamp_period: properties.limits.timestamp_period,
            properties,
            rt_properties,
            scratch_alignment,
            shading_rate_texel_size,
            accel,
            ray_pipeline,
            mesh,
            shading_rate,
            debug_utils,
            debug_messenger,
            empty_set_layout,
            timer_query_pool,
            timer_slots: Mutex::new(TimerSlots {
                free: Vec::new(),
                next: 0,
            }),
            device_lost: AtomicBool::new(false),
        });
        Ok(Self { shared })
    }

    fn note_device_lost(&self, err: &GpuError) {
        if matches!(err, GpuError::DeviceLost) {
            self.shared.device_lost.store(true, Ordering::Release);
        }
    }

    /// Slice-major `(array_slice, mip)` offsets for a buffer-backed staging
    /// texture, each region holding tightly packed block rows.
    fn staging_layout(desc: &TextureDesc) -> (Vec<u64>, u64) {
        let info = format_info(desc.format);
        let bs = info.block_size as u32;
        let bpb = info.bytes_per_block as u64;
        let mut offsets = Vec::with_capacity((desc.array_size * desc.mip_levels) as usize);
        let mut total = 0u64;
        for _slice in 0..desc.array_size {
            for mip in 0..desc.mip_levels {
                total = align_u64(total, 16);
                offsets.push(total);
                let width = (desc.width >> mip).max(1);
                let height = (desc.height >> mip).max(1);
                let depth = (desc.depth >> mip).max(1);
                let blocks_x = ((width + bs - 1) / bs) as u64;
                let blocks_y = ((height + bs - 1) / bs) as u64;
                total += blocks_x * bpb * blocks_y * depth as u64;
            }
        }
        (offsets, total.max(4))
    }

    fn create_staging_texture(&self, desc: TextureDesc) -> Result<TextureHandle> {
        let (subresource_offsets, total_size) = Self::staging_layout(&desc);
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(total_size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let access = if desc.cpu_access == CpuAccessMode::Read {
            vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
        } else {
            vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
        };
        let create = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferHost,
            flags: vk_mem::AllocationCreateFlags::MAPPED | access,
            ..Default::default()
        };
        let (buffer, allocation) =
            unsafe { self.shared.allocator.create_buffer(&buffer_info, &create) }?;
        let alloc_info = self.shared.allocator.get_allocation_info(&allocation);
        self.shared.set_debug_name(buffer, &desc.debug_name);

        Ok(Arc::new(VulkanTexture {
            shared: self.shared.clone(),
            desc,
            image: vk::Image::null(),
            allocation: Mutex::new(None),
            staging: Some(StagingStorage {
                buffer,
                allocation: Mutex::new(allocation),
                mapped: alloc_info.mapped_data as *mut u8,
                subresource_offsets,
                total_size,
            }),
            views: Mutex::new(Default::default()),
            tracking: next_tracking_id(),
        }))
    }

    fn buffer_usage_flags(&self, desc: &BufferDesc) -> vk::BufferUsageFlags {
        let mut usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        if desc.usage.contains(BufferUsage::VERTEX) {
            usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if desc.usage.contains(BufferUsage::INDEX) {
            usage |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if desc.usage.contains(BufferUsage::INDIRECT) {
            usage |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        if desc.usage.contains(BufferUsage::CONSTANT) {
            usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if desc.usage.intersects(BufferUsage::STRUCTURED | BufferUsage::RAW) {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if desc.usage.contains(BufferUsage::TYPED_VIEW) {
            usage |= vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
                | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;
        }
        if self.shared.features.ray_tracing {
            if desc.usage.contains(BufferUsage::ACCEL_STRUCT_BUILD_INPUT) {
                usage |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
            }
            if desc.usage.contains(BufferUsage::ACCEL_STRUCT_STORAGE) {
                usage |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
            }
            if desc.usage.contains(BufferUsage::SHADER_BINDING_TABLE) {
                usage |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
            }
        }
        if self.shared.features.buffer_device_address {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
        usage
    }

    fn create_volatile_buffer(&self, desc: BufferDesc) -> Result<BufferHandle> {
        if desc.max_versions == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "volatile buffer '{}' needs max_versions > 0",
                desc.debug_name
            )));
        }
        if !desc.usage.contains(BufferUsage::CONSTANT) {
            return Err(GpuError::InvalidArgument(format!(
                "volatile buffer '{}' must carry constant-buffer usage",
                desc.debug_name
            )));
        }
        let alignment = self
            .shared
            .properties
            .limits
            .min_uniform_buffer_offset_alignment
            .max(1);
        let aligned_version_size = align_u64(desc.byte_size, alignment);
        let total = aligned_version_size * desc.max_versions as u64;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(total)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let create = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferHost,
            flags: vk_mem::AllocationCreateFlags::MAPPED
                | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ..Default::default()
        };
        let (buffer, allocation) =
            unsafe { self.shared.allocator.create_buffer(&buffer_info, &create) }?;
        let alloc_info = self.shared.allocator.get_allocation_info(&allocation);
        self.shared.set_debug_name(buffer, &desc.debug_name);

        let max_versions = desc.max_versions;
        Ok(Arc::new(VulkanBuffer {
            shared: self.shared.clone(),
            desc,
            buffer,
            allocation: Mutex::new(Some(allocation)),
            mapped: alloc_info.mapped_data as *mut u8,
            address: 0,
            volatile: Some(VolatileTracking {
                versions: VersionTracking::new(max_versions),
                aligned_version_size,
            }),
            views: Mutex::new(Default::default()),
            tracking: next_tracking_id(),
        }))
    }

    fn device_local_memory_type(&self) -> Result<u32> {
        let props = unsafe {
            self.shared
                .instance
                .get_physical_device_memory_properties(self.shared.physical_device)
        };
        (0..props.memory_type_count)
            .find(|&index| {
                props.memory_types[index as usize]
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            })
            .ok_or(GpuError::NotSupported("device-local memory type"))
    }
}

fn border_color(color: Color) -> vk::BorderColor {
    if color.a < 0.5 {
        vk::BorderColor::FLOAT_TRANSPARENT_BLACK
    } else if color.r < 0.5 && color.g < 0.5 && color.b < 0.5 {
        vk::BorderColor::FLOAT_OPAQUE_BLACK
    } else {
        vk::BorderColor::FLOAT_OPAQUE_WHITE
    }
}

impl Device for VulkanDevice {
    fn graphics_api(&self) -> GraphicsApi {
        GraphicsApi::Vulkan
    }

    fn create_texture(&self, desc: TextureDesc) -> Result<TextureHandle> {
        if desc.cpu_access != CpuAccessMode::None {
            return self.create_staging_texture(desc);
        }
        let info = format_info(desc.format);
        let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        if desc.usage.contains(TextureUsage::SHADER_RESOURCE) {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if desc.usage.contains(TextureUsage::UNORDERED_ACCESS) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        if desc.usage.contains(TextureUsage::RENDER_TARGET) {
            usage |= if info.has_depth || info.has_stencil {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
            };
        }
        if desc.usage.contains(TextureUsage::SHADING_RATE) {
            usage |= vk::ImageUsageFlags::FRAGMENT_SHADING_RATE_ATTACHMENT_KHR;
        }
        let mut flags = vk::ImageCreateFlags::empty();
        if matches!(
            desc.dimension,
            TextureDimension::TextureCube | TextureDimension::TextureCubeArray
        ) {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }
        if desc.usage.contains(TextureUsage::TYPELESS) {
            flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
        }
        let image_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(desc.dimension.into())
            .format(desc.format.into())
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_size)
            .samples(pipeline::sample_count_flags(desc.sample_count))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let (image, allocation) = if desc.usage.contains(TextureUsage::VIRTUAL) {
            let image = unsafe { self.shared.device.create_image(&image_info, None) }?;
            (image, None)
        } else {
            let create = vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::Auto,
                ..Default::default()
            };
            let (image, allocation) =
                unsafe { self.shared.allocator.create_image(&image_info, &create) }?;
            (image, Some(allocation))
        };
        self.shared.set_debug_name(image, &desc.debug_name);

        Ok(Arc::new(VulkanTexture {
            shared: self.shared.clone(),
            desc,
            image,
            allocation: Mutex::new(allocation),
            staging: None,
            views: Mutex::new(Default::default()),
            tracking: next_tracking_id(),
        }))
    }

    fn create_buffer(&self, desc: BufferDesc) -> Result<BufferHandle> {
        if desc.byte_size == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "buffer '{}' has zero size",
                desc.debug_name
            )));
        }
        if desc.is_volatile {
            return self.create_volatile_buffer(desc);
        }
        let usage = self.buffer_usage_flags(&desc);
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.byte_size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (buffer, allocation, mapped) = if desc.usage.contains(BufferUsage::VIRTUAL) {
            let buffer = unsafe { self.shared.device.create_buffer(&buffer_info, None) }?;
            (buffer, None, std::ptr::null_mut())
        } else {
            let (memory_usage, flags) = match desc.cpu_access {
                CpuAccessMode::None => (
                    vk_mem::MemoryUsage::Auto,
                    vk_mem::AllocationCreateFlags::empty(),
                ),
                CpuAccessMode::Write => (
                    vk_mem::MemoryUsage::AutoPreferHost,
                    vk_mem::AllocationCreateFlags::MAPPED
                        | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ),
                CpuAccessMode::Read => (
                    vk_mem::MemoryUsage::AutoPreferHost,
                    vk_mem::AllocationCreateFlags::MAPPED
                        | vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                ),
            };
            let create = vk_mem::AllocationCreateInfo {
                usage: memory_usage,
                flags,
                ..Default::default()
            };
            let (buffer, allocation) =
                unsafe { self.shared.allocator.create_buffer(&buffer_info, &create) }?;
            let mapped = if desc.cpu_access == CpuAccessMode::None {
                std::ptr::null_mut()
            } else {
                self.shared.allocator.get_allocation_info(&allocation).mapped_data as *mut u8
            };
            (buffer, Some(allocation), mapped)
        };
        let address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            && !desc.usage.contains(BufferUsage::VIRTUAL)
        {
            unsafe {
                self.shared.device.get_buffer_device_address(
                    &vk::BufferDeviceAddressInfo::builder().buffer(buffer),
                )
            }
        } else {
            0
        };
        self.shared.set_debug_name(buffer, &desc.debug_name);

        Ok(Arc::new(VulkanBuffer {
            shared: self.shared.clone(),
            desc,
            buffer,
            allocation: Mutex::new(allocation),
            mapped,
            address,
            volatile: None,
            views: Mutex::new(Default::default()),
            tracking: next_tracking_id(),
        }))
    }

    fn create_sampler(&self, desc: SamplerDesc) -> Result<SamplerHandle> {
        let mut reduction = vk::SamplerReductionModeCreateInfo::builder()
            .reduction_mode(desc.reduction_type.into())
            .build();
        let mut info = vk::SamplerCreateInfo::builder()
            .mag_filter(desc.mag_filter.into())
            .min_filter(desc.min_filter.into())
            .mipmap_mode(desc.mip_filter.into())
            .address_mode_u(desc.address_u.into())
            .address_mode_v(desc.address_v.into())
            .address_mode_w(desc.address_w.into())
            .mip_lod_bias(desc.mip_bias)
            .anisotropy_enable(desc.max_anisotropy > 1.0)
            .max_anisotropy(desc.max_anisotropy.max(1.0))
            .compare_enable(desc.reduction_type == SamplerReductionType::Comparison)
            .compare_op(vk::CompareOp::LESS)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(border_color(desc.border_color));
        if matches!(
            desc.reduction_type,
            SamplerReductionType::Minimum | SamplerReductionType::Maximum
        ) {
            info = info.push_next(&mut reduction);
        }
        let sampler = unsafe { self.shared.device.create_sampler(&info, None) }?;
        self.shared.set_debug_name(sampler, &desc.debug_name);
        Ok(Arc::new(VulkanSampler {
            shared: self.shared.clone(),
            desc,
            sampler,
        }))
    }

    fn create_shader(
        &self,
        desc: ShaderDesc,
        bytecode: &[u8],
        constants: &[ShaderConstant],
    ) -> Result<ShaderHandle> {
        Ok(Arc::new(VulkanShader::create(
            self.shared.clone(),
            desc,
            bytecode,
            constants,
        )?))
    }

    fn create_input_layout(&self, attributes: &[VertexAttributeDesc]) -> Result<InputLayoutHandle> {
        Ok(Arc::new(VulkanInputLayout::create(attributes)?))
    }

    fn create_framebuffer(&self, desc: FramebufferDesc) -> Result<FramebufferHandle> {
        Ok(Arc::new(VulkanFramebuffer::create(self.shared.clone(), desc)?))
    }

    fn create_graphics_pipeline(
        &self,
        desc: GraphicsPipelineDesc,
        framebuffer_info: &FramebufferInfo,
    ) -> Result<GraphicsPipelineHandle> {
        Ok(Arc::new(VulkanGraphicsPipeline::create(
            self.shared.clone(),
            desc,
            framebuffer_info,
        )?))
    }

    fn create_compute_pipeline(&self, desc: ComputePipelineDesc) -> Result<ComputePipelineHandle> {
        Ok(Arc::new(VulkanComputePipeline::create(
            self.shared.clone(),
            desc,
        )?))
    }

    fn create_mesh_pipeline(
        &self,
        desc: MeshPipelineDesc,
        framebuffer_info: &FramebufferInfo,
    ) -> Result<MeshPipelineHandle> {
        Ok(Arc::new(VulkanMeshPipeline::create(
            self.shared.clone(),
            desc,
            framebuffer_info,
        )?))
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: RayTracingPipelineDesc,
    ) -> Result<RayTracingPipelineHandle> {
        Ok(Arc::new(VulkanRayTracingPipeline::create(
            self.shared.clone(),
            desc,
        )?))
    }

    fn create_binding_layout(&self, desc: BindingLayoutDesc) -> Result<BindingLayoutHandle> {
        Ok(Arc::new(VulkanBindingLayout::create(
            self.shared.clone(),
            desc,
        )?))
    }

    fn create_bindless_layout(&self, desc: BindlessLayoutDesc) -> Result<BindingLayoutHandle> {
        Ok(Arc::new(VulkanBindingLayout::create_bindless(
            self.shared.clone(),
            desc,
        )?))
    }

    fn create_binding_set(
        &self,
        desc: BindingSetDesc,
        layout: &BindingLayoutHandle,
    ) -> Result<BindingSetHandle> {
        Ok(Arc::new(VulkanBindingSet::create(
            self.shared.clone(),
            desc,
            layout,
        )?))
    }

    fn create_descriptor_table(
        &self,
        layout: &BindingLayoutHandle,
    ) -> Result<DescriptorTableHandle> {
        Ok(Arc::new(VulkanDescriptorTable::create(
            self.shared.clone(),
            layout,
        )?))
    }

    fn resize_descriptor_table(
        &self,
        table: &DescriptorTableHandle,
        new_size: u32,
        _keep_contents: bool,
    ) -> Result<()> {
        let vk_table = table
            .as_any()
            .downcast_ref::<VulkanDescriptorTable>()
            .ok_or(GpuError::NotSupported("descriptor table from another backend"))?;
        if new_size <= vk_table.capacity {
            return Ok(());
        }
        Err(GpuError::InvalidArgument(format!(
            "descriptor tables are preallocated; cannot grow from {} to {}",
            vk_table.capacity, new_size
        )))
    }

    fn write_descriptor_table(
        &self,
        table: &DescriptorTableHandle,
        item: &BindingSetItem,
    ) -> Result<()> {
        let vk_table = table
            .as_any()
            .downcast_ref::<VulkanDescriptorTable>()
            .ok_or(GpuError::NotSupported("descriptor table from another backend"))?;
        vk_table.write(item)
    }

    fn create_event_query(&self) -> Result<EventQueryHandle> {
        Ok(Arc::new(VulkanEventQuery {
            state: Mutex::new(None),
        }))
    }

    fn set_event_query(&self, query: &EventQueryHandle, queue: QueueKind) -> Result<()> {
        let vk_query = vk_event_query(query)?;
        let submitted = self.shared.queue(queue).last_submitted_id();
        *vk_query.state.lock().unwrap() = Some((queue, submitted));
        Ok(())
    }

    fn poll_event_query(&self, query: &EventQueryHandle) -> Result<bool> {
        let vk_query = vk_event_query(query)?;
        let Some((queue, id)) = *vk_query.state.lock().unwrap() else {
            return Ok(false);
        };
        let vk_queue = self.shared.queue(queue);
        let finished = vk_queue
            .update_last_finished()
            .unwrap_or_else(|_| vk_queue.last_finished_id());
        Ok(finished >= id)
    }

    fn wait_event_query(&self, query: &EventQueryHandle) -> Result<bool> {
        let vk_query = vk_event_query(query)?;
        let Some((queue, id)) = *vk_query.state.lock().unwrap() else {
            return Ok(true);
        };
        match self.shared.queue(queue).wait_for_submission(id) {
            Ok(()) => Ok(true),
            Err(GpuError::DeviceLost) => {
                self.shared.device_lost.store(true, Ordering::Release);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn reset_event_query(&self, query: &EventQueryHandle) -> Result<()> {
        *vk_event_query(query)?.state.lock().unwrap() = None;
        Ok(())
    }

    fn create_timer_query(&self) -> Result<TimerQueryHandle> {
        let slot = self.shared.allocate_timer_slot()?;
        Ok(Arc::new(VulkanTimerQuery {
            shared: self.shared.clone(),
            slot,
            state: Mutex::new(Default::default()),
        }))
    }

    fn poll_timer_query(&self, query: &TimerQueryHandle) -> Result<bool> {
        let vk_query = vk_timer_query(query)?;
        {
            let state = vk_query.state.lock().unwrap();
            if state.resolved {
                return Ok(true);
            }
            if !state.started {
                return Ok(false);
            }
        }
        let mut timestamps = [0u64; 2];
        let result = unsafe {
            self.shared.device.get_query_pool_results(
                self.shared.timer_query_pool,
                vk_query.slot,
                2,
                &mut timestamps,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        match result {
            Ok(()) => {
                let ticks = timestamps[1].wrapping_sub(timestamps[0]);
                let mut state = vk_query.state.lock().unwrap();
                state.time_seconds =
                    ticks as f32 * self.shared.timestamp_period / 1_000_000_000.0;
                state.resolved = true;
                Ok(true)
            }
            Err(vk::Result::NOT_READY) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn get_timer_query_time(&self, query: &TimerQueryHandle) -> Result<f32> {
        let vk_query = vk_timer_query(query)?;
        {
            let state = vk_query.state.lock().unwrap();
            if state.resolved {
                return Ok(state.time_seconds);
            }
            if !state.started {
                return Ok(0.0);
            }
        }
        let mut timestamps = [0u64; 2];
        unsafe {
            self.shared.device.get_query_pool_results(
                self.shared.timer_query_pool,
                vk_query.slot,
                2,
                &mut timestamps,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }?;
        let ticks = timestamps[1].wrapping_sub(timestamps[0]);
        let mut state = vk_query.state.lock().unwrap();
        state.time_seconds = ticks as f32 * self.shared.timestamp_period / 1_000_000_000.0;
        state.resolved = true;
        Ok(state.time_seconds)
    }

    fn reset_timer_query(&self, query: &TimerQueryHandle) -> Result<()> {
        let vk_query = vk_timer_query(query)?;
        let mut state = vk_query.state.lock().unwrap();
        state.started = false;
        state.resolved = false;
        state.time_seconds = 0.0;
        Ok(())
    }

    fn create_accel_struct(&self, desc: AccelStructDesc) -> Result<AccelStructHandle> {
        Ok(Arc::new(VulkanAccelStruct::create(
            self.shared.clone(),
            desc,
        )?))
    }

    fn get_accel_struct_memory_requirements(&self, desc: &AccelStructDesc) -> Result<u64> {
        Ok(accel::query_sizes(&self.shared, desc)?.structure)
    }

    fn create_heap(&self, capacity: u64, debug_name: &str) -> Result<HeapHandle> {
        let memory_type_index = self.device_local_memory_type()?;
        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut info = vk::MemoryAllocateInfo::builder()
            .allocation_size(capacity)
            .memory_type_index(memory_type_index);
        if self.shared.features.buffer_device_address {
            info = info.push_next(&mut flags_info);
        }
        let memory = unsafe { self.shared.device.allocate_memory(&info, None) }?;
        self.shared.set_debug_name(memory, debug_name);
        Ok(Arc::new(VulkanHeap {
            shared: self.shared.clone(),
            memory,
            capacity,
        }))
    }

    fn bind_buffer_memory(
        &self,
        buffer: &BufferHandle,
        heap: &HeapHandle,
        offset: u64,
    ) -> Result<()> {
        let vk_buf = vk_buffer(buffer)?;
        let vk_heap = vk_heap(heap)?;
        if !vk_buf.desc.usage.contains(BufferUsage::VIRTUAL) {
            return Err(GpuError::Misuse(format!(
                "buffer '{}' was not created virtual",
                vk_buf.desc.debug_name
            )));
        }
        unsafe {
            self.shared
                .device
                .bind_buffer_memory(vk_buf.buffer, vk_heap.memory, offset)
        }?;
        Ok(())
    }

    fn bind_texture_memory(
        &self,
        texture: &TextureHandle,
        heap: &HeapHandle,
        offset: u64,
    ) -> Result<()> {
        let vk_tex = vk_texture(texture)?;
        let vk_heap = vk_heap(heap)?;
        if !vk_tex.desc.usage.contains(TextureUsage::VIRTUAL) {
            return Err(GpuError::Misuse(format!(
                "texture '{}' was not created virtual",
                vk_tex.desc.debug_name
            )));
        }
        unsafe {
            self.shared
                .device
                .bind_image_memory(vk_tex.image, vk_heap.memory, offset)
        }?;
        Ok(())
    }

    fn bind_accel_struct_memory(
        &self,
        accel: &AccelStructHandle,
        heap: &HeapHandle,
        offset: u64,
    ) -> Result<()> {
        let vk_accel = vk_accel_struct(accel)?;
        let vk_heap = vk_heap(heap)?;
        vk_accel.bind_memory(vk_heap.memory, offset)
    }

    fn map_buffer(&self, buffer: &BufferHandle, access: CpuAccessMode) -> Result<*mut u8> {
        let vk_buf = vk_buffer(buffer)?;
        if vk_buf.mapped.is_null() {
            return Err(GpuError::Misuse(format!(
                "buffer '{}' is not CPU accessible",
                vk_buf.desc.debug_name
            )));
        }
        if access == CpuAccessMode::Read {
            if let Some(allocation) = vk_buf.allocation.lock().unwrap().as_ref() {
                self.shared.allocator.invalidate_allocation(
                    allocation,
                    0,
                    vk_buf.desc.byte_size as usize,
                )?;
            }
        }
        Ok(vk_buf.mapped)
    }

    fn unmap_buffer(&self, buffer: &BufferHandle) -> Result<()> {
        let vk_buf = vk_buffer(buffer)?;
        if vk_buf.mapped.is_null() {
            return Err(GpuError::Misuse(format!(
                "buffer '{}' is not CPU accessible",
                vk_buf.desc.debug_name
            )));
        }
        if let Some(allocation) = vk_buf.allocation.lock().unwrap().as_ref() {
            self.shared.allocator.flush_allocation(
                allocation,
                0,
                vk_buf.desc.byte_size as usize,
            )?;
        }
        Ok(())
    }

    fn map_staging_texture(
        &self,
        texture: &TextureHandle,
        array_slice: u32,
        mip_level: u32,
        access: CpuAccessMode,
    ) -> Result<(*mut u8, u64)> {
        let vk_tex = vk_texture(texture)?;
        let staging = vk_tex.staging.as_ref().ok_or_else(|| {
            GpuError::Misuse(format!(
                "texture '{}' is not a staging texture",
                vk_tex.desc.debug_name
            ))
        })?;
        let (offset, length) = vk_tex.staging_region(array_slice, mip_level)?;
        if access == CpuAccessMode::Read {
            let allocation = staging.allocation.lock().unwrap();
            self.shared
                .allocator
                .invalidate_allocation(&allocation, offset as usize, length as usize)?;
        }
        let info = format_info(vk_tex.desc.format);
        let bs = info.block_size as u32;
        let mip_width = (vk_tex.desc.width >> mip_level).max(1);
        let blocks_x = ((mip_width + bs - 1) / bs) as u64;
        let row_pitch = blocks_x * info.bytes_per_block as u64;
        Ok((unsafe { staging.mapped.add(offset as usize) }, row_pitch))
    }

    fn unmap_staging_texture(&self, texture: &TextureHandle) -> Result<()> {
        let vk_tex = vk_texture(texture)?;
        let staging = vk_tex.staging.as_ref().ok_or_else(|| {
            GpuError::Misuse(format!(
                "texture '{}' is not a staging texture",
                vk_tex.desc.debug_name
            ))
        })?;
        let allocation = staging.allocation.lock().unwrap();
        self.shared
            .allocator
            .flush_allocation(&allocation, 0, staging.total_size as usize)?;
        Ok(())
    }

    fn create_command_list(&self, params: CommandListParameters) -> Result<CommandListHandle> {
        let queue = self.shared.queue(params.queue_kind);
        Ok(Box::new(VulkanCommandList::new(
            self.shared.clone(),
            queue,
            params,
        )))
    }

    fn execute_command_lists(
        &self,
        lists: &mut [&mut dyn CommandList],
        queue: QueueKind,
    ) -> Result<u64> {
        if self.shared.device_lost.load(Ordering::Acquire) {
            return Err(GpuError::DeviceLost);
        }
        let vk_queue = self.shared.queue(queue);
        let mut tracked = Vec::with_capacity(lists.len());
        for list in lists.iter_mut() {
            let vk_list = list
                .as_any_mut()
                .downcast_mut::<VulkanCommandList>()
                .ok_or(GpuError::NotSupported("command list from another backend"))?;
            if vk_list.queue_kind() != queue {
                return Err(GpuError::Misuse(format!(
                    "command list was created for the {:?} queue",
                    vk_list.queue_kind()
                )));
            }
            tracked.push(vk_list.take_for_submission()?);
        }
        let submission_id = match vk_queue.submit(tracked) {
            Ok(id) => id,
            Err(err) => {
                self.note_device_lost(&err);
                return Err(err);
            }
        };
        for list in lists.iter_mut() {
            if let Some(vk_list) = list.as_any_mut().downcast_mut::<VulkanCommandList>() {
                vk_list.submitted(submission_id);
            }
        }
        Ok(submission_id)
    }

    fn queue_wait_for_command_list(
        &self,
        wait_queue: QueueKind,
        exec_queue: QueueKind,
        instance_id: u64,
    ) -> Result<()> {
        if wait_queue == exec_queue {
            return Err(GpuError::Misuse(
                "cross-queue wait requires two distinct queues".into(),
            ));
        }
        let waiter = self.shared.queue(wait_queue);
        let executor = self.shared.queue(exec_queue);
        if Arc::ptr_eq(&waiter, &executor) {
            // Both kinds fold onto one family, which already executes
            // submissions in order.
            return Ok(());
        }
        waiter.add_wait(executor.timeline, instance_id);
        Ok(())
    }

    fn wait_for_idle(&self) -> Result<bool> {
        for queue in self.shared.queues.iter().flatten() {
            match queue.wait_idle() {
                Ok(()) => {}
                Err(GpuError::DeviceLost) => {
                    self.shared.device_lost.store(true, Ordering::Release);
                    return Ok(false);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(!self.shared.device_lost.load(Ordering::Acquire))
    }

    fn run_garbage_collection(&self) {
        for queue in self.shared.queues.iter().flatten() {
            if let Err(err) = queue.update_last_finished() {
                self.note_device_lost(&err);
            }
        }
    }

    fn query_feature_support(&self, feature: Feature) -> bool {
        match feature {
            Feature::RayTracingAccelStruct => self.shared.accel.is_some(),
            Feature::RayTracingPipeline => self.shared.ray_pipeline.is_some(),
            Feature::Meshlets => self.shared.mesh.is_some(),
            Feature::VariableRateShading => self.shared.shading_rate.is_some(),
            Feature::ConservativeRasterization => self.shared.features.conservative_raster,
            Feature::VirtualResources => true,
            Feature::ComputeQueue => self.shared.queues[QueueKind::Compute.index()].is_some(),
            Feature::CopyQueue => self.shared.queues[QueueKind::Copy.index()].is_some(),
            Feature::BufferDeviceAddress => self.shared.features.buffer_device_address,
            Feature::Synchronization2 => self.shared.features.synchronization2,
        }
    }

    fn query_format_support(&self, format: Format) -> FormatSupport {
        if format == Format::Unknown {
            return FormatSupport::empty();
        }
        let props = unsafe {
            self.shared.instance.get_physical_device_format_properties(
                self.shared.physical_device,
                format.into(),
            )
        };
        let mut support = FormatSupport::empty();
        let buffer = props.buffer_features;
        if buffer.contains(vk::FormatFeatureFlags::UNIFORM_TEXEL_BUFFER) {
            support |= FormatSupport::BUFFER | FormatSupport::SHADER_LOAD;
        }
        if buffer.contains(vk::FormatFeatureFlags::VERTEX_BUFFER) {
            support |= FormatSupport::VERTEX_BUFFER;
        }
        if buffer.contains(vk::FormatFeatureFlags::STORAGE_TEXEL_BUFFER) {
            support |= FormatSupport::SHADER_UAV_LOAD | FormatSupport::SHADER_UAV_STORE;
        }
        if buffer.contains(vk::FormatFeatureFlags::STORAGE_TEXEL_BUFFER_ATOMIC) {
            support |= FormatSupport::SHADER_ATOMIC;
        }
        let optimal = props.optimal_tiling_features;
        if optimal.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE) {
            support |= FormatSupport::TEXTURE | FormatSupport::SHADER_LOAD;
        }
        if optimal.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
            support |= FormatSupport::SHADER_SAMPLE;
        }
        if optimal.contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT) {
            support |= FormatSupport::RENDER_TARGET;
        }
        if optimal.contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND) {
            support |= FormatSupport::BLENDABLE;
        }
        if optimal.contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT) {
            support |= FormatSupport::DEPTH_STENCIL;
        }
        if optimal.contains(vk::FormatFeatureFlags::STORAGE_IMAGE) {
            support |= FormatSupport::SHADER_UAV_LOAD | FormatSupport::SHADER_UAV_STORE;
        }
        if optimal.contains(vk::FormatFeatureFlags::STORAGE_IMAGE_ATOMIC) {
            support |= FormatSupport::SHADER_ATOMIC;
        }
        support
    }

    fn queue_last_finished_id(&self, queue: QueueKind) -> u64 {
        let vk_queue = self.shared.queue(queue);
        vk_queue
            .update_last_finished()
            .unwrap_or_else(|_| vk_queue.last_finished_id())
    }
}
