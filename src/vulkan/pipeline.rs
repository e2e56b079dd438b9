//! Framebuffers, pipeline layouts, and the four pipeline kinds. Render
//! passes always load and store; clears go through explicit clear commands.

use super::resources::{TextureViewKey, VulkanInputLayout, VulkanShader};
use super::DeviceShared;
use crate::error::{GpuError, Result};
use crate::traits::{
    Framebuffer, GraphicsPipeline, ComputePipeline, MeshPipeline, RayTracingPipeline,
    Resource, ShaderHandle, ShaderTable, ShaderTableHandle,
};
use crate::types::*;
use ash::vk;
use std::any::Any;
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Arc, Mutex};

pub(crate) fn sample_count_flags(samples: u32) -> vk::SampleCountFlags {
    vk::SampleCountFlags::from_raw(samples.max(1))
}

pub struct VulkanFramebuffer {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) desc: FramebufferDesc,
    pub(crate) info: FramebufferInfo,
    pub(crate) render_pass: vk::RenderPass,
    pub(crate) framebuffer: vk::Framebuffer,
}

impl VulkanFramebuffer {
    pub(crate) fn create(shared: Arc<DeviceShared>, desc: FramebufferDesc) -> Result<Self> {
        let mut attachments: Vec<vk::AttachmentDescription2> = Vec::new();
        let mut views: Vec<vk::ImageView> = Vec::new();
        let mut color_refs: Vec<vk::AttachmentReference2> = Vec::new();
        let mut info = FramebufferInfo::default();

        for attachment in &desc.color_attachments {
            let texture = super::vk_texture(&attachment.texture)?;
            let format = attachment.format.unwrap_or(texture.desc.format);
            let mip = attachment.subresources.base_mip;
            info.color_formats.push(format);
            info.width = (texture.desc.width >> mip).max(1);
            info.height = (texture.desc.height >> mip).max(1);
            info.sample_count = texture.desc.sample_count;

            views.push(texture.get_view(TextureViewKey {
                subresources: attachment.subresources,
                format,
                dimension: texture.desc.dimension,
                intent: AccessIntent::RenderTarget,
                aspect: ViewAspect::AllAspects,
            })?);
            color_refs.push(
                vk::AttachmentReference2::builder()
                    .attachment(attachments.len() as u32)
                    .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .build(),
            );
            attachments.push(
                vk::AttachmentDescription2::builder()
                    .format(format.into())
                    .samples(sample_count_flags(texture.desc.sample_count))
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .build(),
            );
        }

        let mut depth_ref = vk::AttachmentReference2::default();
        if let Some(attachment) = &desc.depth_attachment {
            let texture = super::vk_texture(&attachment.texture)?;
            let format = attachment.format.unwrap_or(texture.desc.format);
            let mip = attachment.subresources.base_mip;
            info.depth_format = Some(format);
            info.width = (texture.desc.width >> mip).max(1);
            info.height = (texture.desc.height >> mip).max(1);
            info.sample_count = texture.desc.sample_count;

            let layout = if attachment.is_read_only {
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            } else {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            };
            views.push(texture.get_view(TextureViewKey {
                subresources: attachment.subresources,
                format,
                dimension: texture.desc.dimension,
                intent: AccessIntent::DepthStencil,
                aspect: ViewAspect::AllAspects,
            })?);
            depth_ref = vk::AttachmentReference2::builder()
                .attachment(attachments.len() as u32)
                .layout(layout)
                .aspect_mask(super::convert::format_aspect_flags(format))
                .build();
            attachments.push(
                vk::AttachmentDescription2::builder()
                    .format(format.into())
                    .samples(sample_count_flags(texture.desc.sample_count))
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::LOAD)
                    .stencil_store_op(vk::AttachmentStoreOp::STORE)
                    .initial_layout(layout)
                    .final_layout(layout)
                    .build(),
            );
        }

        let mut shading_rate_ref = vk::AttachmentReference2::default();
        let mut shading_rate_info = vk::FragmentShadingRateAttachmentInfoKHR::default();
        if let Some(attachment) = &desc.shading_rate_attachment {
            let texture = super::vk_texture(&attachment.texture)?;
            let format = attachment.format.unwrap_or(texture.desc.format);
            views.push(texture.get_view(TextureViewKey {
                subresources: attachment.subresources,
                format,
                dimension: texture.desc.dimension,
                intent: AccessIntent::ShaderResource,
                aspect: ViewAspect::AllAspects,
            })?);
            shading_rate_ref = vk::AttachmentReference2::builder()
                .attachment(attachments.len() as u32)
                .layout(vk::ImageLayout::FRAGMENT_SHADING_RATE_ATTACHMENT_OPTIMAL_KHR)
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .build();
            attachments.push(
                vk::AttachmentDescription2::builder()
                    .format(format.into())
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .initial_layout(vk::ImageLayout::FRAGMENT_SHADING_RATE_ATTACHMENT_OPTIMAL_KHR)
                    .final_layout(vk::ImageLayout::FRAGMENT_SHADING_RATE_ATTACHMENT_OPTIMAL_KHR)
                    .build(),
            );
            shading_rate_info = vk::FragmentShadingRateAttachmentInfoKHR::builder()
                .fragment_shading_rate_attachment(&shading_rate_ref)
                .shading_rate_attachment_texel_size(shared.shading_rate_texel_size)
                .build();
        }

        let mut subpass = vk::SubpassDescription2::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.depth_attachment.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        if desc.shading_rate_attachment.is_some() {
            subpass = subpass.push_next(&mut shading_rate_info);
        }
        let subpasses = [subpass.build()];

        let render_pass = unsafe {
            shared.device.create_render_pass2(
                &vk::RenderPassCreateInfo2::builder()
                    .attachments(&attachments)
                    .subpasses(&subpasses),
                None,
            )
        }?;

        let framebuffer = unsafe {
            shared.device.create_framebuffer(
                &vk::FramebufferCreateInfo::builder()
                    .render_pass(render_pass)
                    .attachments(&views)
                    .width(info.width)
                    .height(info.height)
                    .layers(1),
                None,
            )
        };
        let framebuffer = match framebuffer {
            Ok(fb) => fb,
            Err(err) => {
                unsafe { shared.device.destroy_render_pass(render_pass, None) };
                return Err(err.into());
            }
        };
        shared.set_debug_name(framebuffer, &desc.debug_name);

        Ok(Self {
            shared,
            desc,
            info,
            render_pass,
            framebuffer,
        })
    }
}

impl Resource for VulkanFramebuffer {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Framebuffer for VulkanFramebuffer {
    fn desc(&self) -> &FramebufferDesc {
        &self.desc
    }

    fn info(&self) -> &FramebufferInfo {
        &self.info
    }
}

impl Drop for VulkanFramebuffer {
    fn drop(&mut self) {
        unsafe {
            self.shared.device.destroy_framebuffer(self.framebuffer, None);
            self.shared.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// Builds a render pass compatible with any framebuffer matching `info`.
/// Compatibility only depends on formats and sample counts, so pipelines can
/// be created against this without a live framebuffer.
pub(crate) fn compatible_render_pass(
    shared: &DeviceShared,
    info: &FramebufferInfo,
) -> Result<vk::RenderPass> {
    let mut attachments: Vec<vk::AttachmentDescription2> = Vec::new();
    let mut color_refs: Vec<vk::AttachmentReference2> = Vec::new();
    for format in &info.color_formats {
        color_refs.push(
            vk::AttachmentReference2::builder()
                .attachment(attachments.len() as u32)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .build(),
        );
        attachments.push(
            vk::AttachmentDescription2::builder()
                .format((*format).into())
                .samples(sample_count_flags(info.sample_count))
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .build(),
        );
    }
    let mut depth_ref = vk::AttachmentReference2::default();
    if let Some(format) = info.depth_format {
        depth_ref = vk::AttachmentReference2::builder()
            .attachment(attachments.len() as u32)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .aspect_mask(super::convert::format_aspect_flags(format))
            .build();
        attachments.push(
            vk::AttachmentDescription2::builder()
                .format(format.into())
                .samples(sample_count_flags(info.sample_count))
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::LOAD)
                .stencil_store_op(vk::AttachmentStoreOp::STORE)
                .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build(),
        );
    }
    let mut subpass = vk::SubpassDescription2::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if info.depth_format.is_some() {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }
    let subpasses = [subpass.build()];
    let render_pass = unsafe {
        shared.device.create_render_pass2(
            &vk::RenderPassCreateInfo2::builder()
                .attachments(&attachments)
                .subpasses(&subpasses),
            None,
        )
    }?;
    Ok(render_pass)
}

/// Pipeline layout plus the push-constant range metadata bind time needs.
pub(crate) struct PipelineLayoutInfo {
    pub layout: vk::PipelineLayout,
    pub push_constant_stages: vk::ShaderStageFlags,
    pub push_constant_size: u32,
    pub set_count: u32,
}

/// Builds a pipeline layout from the binding layouts of a pipeline desc.
/// With `register_space_is_descriptor_set`, each layout lands at the set
/// index named by its register space and gaps are filled with an empty set
/// layout; otherwise layouts occupy sequential set indices.
pub(crate) fn build_pipeline_layout(
    shared: &DeviceShared,
    binding_layouts: &[crate::traits::BindingLayoutHandle],
) -> Result<PipelineLayoutInfo> {
    let mut set_layouts: Vec<vk::DescriptorSetLayout> = Vec::new();
    let mut push_constant_size = 0u32;
    let mut push_constant_stages = vk::ShaderStageFlags::empty();

    let spaces_are_sets = binding_layouts
        .first()
        .and_then(|l| l.desc())
        .map_or(false, |d| d.register_space_is_descriptor_set);

    for handle in binding_layouts {
        let layout = super::vk_binding_layout(handle)?;
        if layout.push_constant_size > 0 {
            push_constant_size = push_constant_size.max(layout.push_constant_size);
            push_constant_stages |= layout.push_constant_stages;
        }
        let set_index = match (spaces_are_sets, layout.desc.as_ref()) {
            (true, Some(desc)) => desc.register_space as usize,
            _ => set_layouts.len(),
        };
        if set_index >= set_layouts.len() {
            set_layouts.resize(set_index + 1, shared.empty_set_layout);
        }
        set_layouts[set_index] = layout.set_layout;
    }

    let mut create = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
    let ranges;
    if push_constant_size > 0 {
        ranges = [vk::PushConstantRange {
            stage_flags: push_constant_stages,
            offset: 0,
            size: push_constant_size,
        }];
        create = create.push_constant_ranges(&ranges);
    }
    let layout = unsafe { shared.device.create_pipeline_layout(&create, None) }?;
    Ok(PipelineLayoutInfo {
        layout,
        push_constant_stages,
        push_constant_size,
        set_count: set_layouts.len() as u32,
    })
}

fn shader_stage<'a>(
    shader: &ShaderHandle,
    stage: vk::ShaderStageFlags,
    entry: &'a CString,
) -> Result<vk::PipelineShaderStageCreateInfo> {
    let vk_shader: &VulkanShader = super::vk_shader(shader)?;
    Ok(vk::PipelineShaderStageCreateInfo::builder()
        .stage(stage)
        .module(vk_shader.module)
        .name(entry)
        .build())
}

fn rasterization_state(raster: &RasterState) -> vk::PipelineRasterizationStateCreateInfo {
    vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(!raster.depth_clip_enable)
        .polygon_mode(raster.fill_mode.into())
        .cull_mode(raster.cull_mode.into())
        .front_face(if raster.front_counter_clockwise {
            vk::FrontFace::COUNTER_CLOCKWISE
        } else {
            vk::FrontFace::CLOCKWISE
        })
        .depth_bias_enable(raster.depth_bias != 0 || raster.slope_scaled_depth_bias_bits != 0)
        .depth_bias_constant_factor(raster.depth_bias as f32)
        .depth_bias_clamp(f32::from_bits(raster.depth_bias_clamp_bits))
        .depth_bias_slope_factor(f32::from_bits(raster.slope_scaled_depth_bias_bits))
        .line_width(1.0)
        .build()
}

fn depth_stencil_state(state: &DepthStencilState) -> vk::PipelineDepthStencilStateCreateInfo {
    let mut front: vk::StencilOpState = state.front_face.into();
    let mut back: vk::StencilOpState = state.back_face.into();
    front.compare_mask = state.stencil_read_mask as u32;
    front.write_mask = state.stencil_write_mask as u32;
    front.reference = state.stencil_ref_value as u32;
    back.compare_mask = state.stencil_read_mask as u32;
    back.write_mask = state.stencil_write_mask as u32;
    back.reference = state.stencil_ref_value as u32;
    vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(state.depth_test_enable)
        .depth_write_enable(state.depth_write_enable)
        .depth_compare_op(state.depth_func.into())
        .stencil_test_enable(state.stencil_enable)
        .front(front)
        .back(back)
        .build()
}

fn blend_attachments(
    blend: &BlendState,
    target_count: usize,
) -> Vec<vk::PipelineColorBlendAttachmentState> {
    blend.targets[..target_count.min(MAX_RENDER_TARGETS)]
        .iter()
        .map(|t| (*t).into())
        .collect()
}

pub struct VulkanGraphicsPipeline {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) desc: GraphicsPipelineDesc,
    pub(crate) framebuffer_info: FramebufferInfo,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) pipeline_layout: vk::PipelineLayout,
    pub(crate) render_pass: vk::RenderPass,
    pub(crate) shader_mask: ShaderStageMask,
    pub(crate) push_constant_stages: vk::ShaderStageFlags,
    pub(crate) push_constant_size: u32,
    pub(crate) uses_blend_constants: bool,
    pub(crate) uses_dynamic_stencil_ref: bool,
    pub(crate) set_count: u32,
}

impl VulkanGraphicsPipeline {
    pub(crate) fn create(
        shared: Arc<DeviceShared>,
        desc: GraphicsPipelineDesc,
        framebuffer_info: &FramebufferInfo,
    ) -> Result<Self> {
        let framebuffer_info = framebuffer_info.clone();
        let entry = CString::new("main").unwrap();

        let mut stages = Vec::new();
        let mut shader_mask = ShaderStageMask::empty();
        let stage_table: [(&Option<ShaderHandle>, vk::ShaderStageFlags, ShaderStageMask); 5] = [
            (&desc.vertex_shader, vk::ShaderStageFlags::VERTEX, ShaderStageMask::VERTEX),
            (
                &desc.hull_shader,
                vk::ShaderStageFlags::TESSELLATION_CONTROL,
                ShaderStageMask::HULL,
            ),
            (
                &desc.domain_shader,
                vk::ShaderStageFlags::TESSELLATION_EVALUATION,
                ShaderStageMask::DOMAIN,
            ),
            (&desc.geometry_shader, vk::ShaderStageFlags::GEOMETRY, ShaderStageMask::GEOMETRY),
            (&desc.pixel_shader, vk::ShaderStageFlags::FRAGMENT, ShaderStageMask::PIXEL),
        ];
        for (shader, vk_stage, mask) in stage_table {
            if let Some(shader) = shader {
                stages.push(shader_stage(shader, vk_stage, &entry)?);
                shader_mask |= mask;
            }
        }

        let (vertex_bindings, vertex_attributes): (&[_], &[_]) = match &desc.input_layout {
            Some(layout) => {
                let input: &VulkanInputLayout = super::vk_input_layout(layout)?;
                (&input.vk_bindings, &input.vk_attributes)
            }
            None => (&[], &[]),
        };
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(vertex_bindings)
            .vertex_attribute_descriptions(vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(desc.primitive_type.into());
        let tessellation = vk::PipelineTessellationStateCreateInfo::builder()
            .patch_control_points(desc.patch_control_points);

        // Viewports and scissors are always dynamic.
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let mut raster = rasterization_state(&desc.render_state.raster);
        let conservative = vk::PipelineRasterizationConservativeStateCreateInfoEXT::builder()
            .conservative_rasterization_mode(vk::ConservativeRasterizationModeEXT::OVERESTIMATE)
            .build();
        if desc.render_state.raster.conservative_raster_enable {
            if !shared.features.conservative_raster {
                return Err(GpuError::NotSupported("conservative rasterization"));
            }
            raster.p_next = &conservative as *const _ as *const std::ffi::c_void;
        }

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(sample_count_flags(framebuffer_info.sample_count))
            .alpha_to_coverage_enable(desc.render_state.blend.alpha_to_coverage_enable);

        let depth_stencil = depth_stencil_state(&desc.render_state.depth_stencil);

        let attachments =
            blend_attachments(&desc.render_state.blend, framebuffer_info.color_formats.len());
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&attachments);

        let mut dynamic_states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let uses_blend_constants = desc
            .render_state
            .blend
            .uses_constant_color(framebuffer_info.color_formats.len());
        if uses_blend_constants {
            dynamic_states.push(vk::DynamicState::BLEND_CONSTANTS);
        }
        let uses_dynamic_stencil_ref = desc.render_state.depth_stencil.dynamic_stencil_ref;
        if uses_dynamic_stencil_ref {
            dynamic_states.push(vk::DynamicState::STENCIL_REFERENCE);
        }
        if desc.shading_rate_state.enabled {
            if !shared.features.variable_rate_shading {
                return Err(GpuError::NotSupported("variable rate shading"));
            }
            dynamic_states.push(vk::DynamicState::FRAGMENT_SHADING_RATE_KHR);
        }
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states);

        let layout_info = build_pipeline_layout(&shared, &desc.binding_layouts)?;
        let render_pass = match compatible_render_pass(&shared, &framebuffer_info) {
            Ok(render_pass) => render_pass,
            Err(err) => {
                unsafe { shared.device.destroy_pipeline_layout(layout_info.layout, None) };
                return Err(err);
            }
        };

        let create = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .tessellation_state(&tessellation)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout_info.layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipeline = unsafe {
            shared
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create], None)
        };
        let pipeline = match pipeline {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                unsafe {
                    shared.device.destroy_render_pass(render_pass, None);
                    shared.device.destroy_pipeline_layout(layout_info.layout, None);
                }
                return Err(err.into());
            }
        };
        shared.set_debug_name(pipeline, &desc.debug_name);

        Ok(Self {
            shared,
            desc,
            framebuffer_info,
            pipeline,
            pipeline_layout: layout_info.layout,
            render_pass,
            shader_mask,
            push_constant_stages: layout_info.push_constant_stages,
            push_constant_size: layout_info.push_constant_size,
            uses_blend_constants,
            uses_dynamic_stencil_ref,
            set_count: layout_info.set_count,
        })
    }
}

impl Resource for VulkanGraphicsPipeline {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl GraphicsPipeline for VulkanGraphicsPipeline {
    fn desc(&self) -> &GraphicsPipelineDesc {
        &self.desc
    }

    fn framebuffer_info(&self) -> &FramebufferInfo {
        &self.framebuffer_info
    }

    fn shader_mask(&self) -> ShaderStageMask {
        self.shader_mask
    }
}

impl Drop for VulkanGraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.shared.device.destroy_pipeline(self.pipeline, None);
            self.shared.device.destroy_render_pass(self.render_pass, None);
            self.shared
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}

pub struct VulkanComputePipeline {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) desc: ComputePipelineDesc,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) pipeline_layout: vk::PipelineLayout,
    pub(crate) push_constant_stages: vk::ShaderStageFlags,
    pub(crate) push_constant_size: u32,
    pub(crate) set_count: u32,
}

impl VulkanComputePipeline {
    pub(crate) fn create(shared: Arc<DeviceShared>, desc: ComputePipelineDesc) -> Result<Self> {
        let shader = desc
            .compute_shader
            .as_ref()
            .ok_or_else(|| GpuError::InvalidArgument("compute pipeline needs a shader".into()))?;
        let entry = CString::new("main").unwrap();
        let stage = shader_stage(shader, vk::ShaderStageFlags::COMPUTE, &entry)?;
        let layout_info = build_pipeline_layout(&shared, &desc.binding_layouts)?;

        let create = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout_info.layout)
            .build();
        let pipeline = unsafe {
            shared
                .device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create], None)
        };
        let pipeline = match pipeline {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                unsafe { shared.device.destroy_pipeline_layout(layout_info.layout, None) };
                return Err(err.into());
            }
        };
        shared.set_debug_name(pipeline, &desc.debug_name);

        Ok(Self {
            shared,
            desc,
            pipeline,
            pipeline_layout: layout_info.layout,
            push_constant_stages: layout_info.push_constant_stages,
            push_constant_size: layout_info.push_constant_size,
            set_count: layout_info.set_count,
        })
    }
}

impl Resource for VulkanComputePipeline {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ComputePipeline for VulkanComputePipeline {
    fn desc(&self) -> &ComputePipelineDesc {
        &self.desc
    }
}

impl Drop for VulkanComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.shared.device.destroy_pipeline(self.pipeline, None);
            self.shared
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}

pub struct VulkanMeshPipeline {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) desc: MeshPipelineDesc,
    pub(crate) framebuffer_info: FramebufferInfo,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) pipeline_layout: vk::PipelineLayout,
    pub(crate) render_pass: vk::RenderPass,
    pub(crate) shader_mask: ShaderStageMask,
    pub(crate) push_constant_stages: vk::ShaderStageFlags,
    pub(crate) push_constant_size: u32,
    pub(crate) uses_blend_constants: bool,
    pub(crate) set_count: u32,
}

impl VulkanMeshPipeline {
    pub(crate) fn create(
        shared: Arc<DeviceShared>,
        desc: MeshPipelineDesc,
        framebuffer_info: &FramebufferInfo,
    ) -> Result<Self> {
        if !shared.features.mesh_shading {
            return Err(GpuError::NotSupported("mesh shading"));
        }
        let framebuffer_info = framebuffer_info.clone();
        let entry = CString::new("main").unwrap();

        let mut stages = Vec::new();
        let mut shader_mask = ShaderStageMask::empty();
        if let Some(shader) = &desc.amplification_shader {
            stages.push(shader_stage(shader, vk::ShaderStageFlags::TASK_NV, &entry)?);
            shader_mask |= ShaderStageMask::AMPLIFICATION;
        }
        if let Some(shader) = &desc.mesh_shader {
            stages.push(shader_stage(shader, vk::ShaderStageFlags::MESH_NV, &entry)?);
            shader_mask |= ShaderStageMask::MESH;
        }
        if let Some(shader) = &desc.pixel_shader {
            stages.push(shader_stage(shader, vk::ShaderStageFlags::FRAGMENT, &entry)?);
            shader_mask |= ShaderStageMask::PIXEL;
        }

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let raster = rasterization_state(&desc.render_state.raster);
        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(sample_count_flags(framebuffer_info.sample_count))
            .alpha_to_coverage_enable(desc.render_state.blend.alpha_to_coverage_enable);
        let depth_stencil = depth_stencil_state(&desc.render_state.depth_stencil);
        let attachments =
            blend_attachments(&desc.render_state.blend, framebuffer_info.color_formats.len());
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&attachments);

        let mut dynamic_states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let uses_blend_constants = desc
            .render_state
            .blend
            .uses_constant_color(framebuffer_info.color_formats.len());
        if uses_blend_constants {
            dynamic_states.push(vk::DynamicState::BLEND_CONSTANTS);
        }
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states);

        let layout_info = build_pipeline_layout(&shared, &desc.binding_layouts)?;
        let render_pass = match compatible_render_pass(&shared, &framebuffer_info) {
            Ok(render_pass) => render_pass,
            Err(err) => {
                unsafe { shared.device.destroy_pipeline_layout(layout_info.layout, None) };
                return Err(err);
            }
        };

        let create = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout_info.layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipeline = unsafe {
            shared
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create], None)
        };
        let pipeline = match pipeline {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                unsafe {
                    shared.device.destroy_render_pass(render_pass, None);
                    shared.device.destroy_pipeline_layout(layout_info.layout, None);
                }
                return Err(err.into());
            }
        };
        shared.set_debug_name(pipeline, &desc.debug_name);

        Ok(Self {
            shared,
            desc,
            framebuffer_info,
            pipeline,
            pipeline_layout: layout_info.layout,
            render_pass,
            shader_mask,
            push_constant_stages: layout_info.push_constant_stages,
            push_constant_size: layout_info.push_constant_size,
            uses_blend_constants,
            set_count: layout_info.set_count,
        })
    }
}

impl Resource for VulkanMeshPipeline {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl MeshPipeline for VulkanMeshPipeline {
    fn desc(&self) -> &MeshPipelineDesc {
        &self.desc
    }

    fn framebuffer_info(&self) -> &FramebufferInfo {
        &self.framebuffer_info
    }

    fn shader_mask(&self) -> ShaderStageMask {
        self.shader_mask
    }
}

impl Drop for VulkanMeshPipeline {
    fn drop(&mut self) {
        unsafe {
            self.shared.device.destroy_pipeline(self.pipeline, None);
            self.shared.device.destroy_render_pass(self.render_pass, None);
            self.shared
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}

pub struct VulkanRayTracingPipeline {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) desc: RayTracingPipelineDesc,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) pipeline_layout: vk::PipelineLayout,
    pub(crate) push_constant_stages: vk::ShaderStageFlags,
    pub(crate) push_constant_size: u32,
    pub(crate) set_count: u32,
    /// Opaque shader-group handles, one per group, each
    /// `shader_group_handle_size` bytes, in group declaration order.
    pub(crate) group_handles: Vec<u8>,
    /// Export name to group index.
    pub(crate) group_indices: HashMap<String, u32>,
}

impl VulkanRayTracingPipeline {
    pub(crate) fn create(shared: Arc<DeviceShared>, desc: RayTracingPipelineDesc) -> Result<Self> {
        let ray_pipeline = shared
            .ray_pipeline
            .as_ref()
            .ok_or(GpuError::NotSupported("ray tracing pipelines"))?;
        let entry = CString::new("main").unwrap();

        let mut stages = Vec::new();
        let mut groups = Vec::new();
        let mut group_indices = HashMap::new();

        for shader in &desc.shaders {
            let stage_flags: vk::ShaderStageFlags = shader.shader.desc().stage.into();
            let stage_index = stages.len() as u32;
            stages.push(shader_stage(&shader.shader, stage_flags, &entry)?);
            group_indices.insert(shader.export_name.clone(), groups.len() as u32);
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(stage_index)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR)
                    .build(),
            );
        }

        for group in &desc.hit_groups {
            let mut closest_hit = vk::SHADER_UNUSED_KHR;
            let mut any_hit = vk::SHADER_UNUSED_KHR;
            let mut intersection = vk::SHADER_UNUSED_KHR;
            if let Some(shader) = &group.closest_hit_shader {
                closest_hit = stages.len() as u32;
                stages.push(shader_stage(
                    shader,
                    vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                    &entry,
                )?);
            }
            if let Some(shader) = &group.any_hit_shader {
                any_hit = stages.len() as u32;
                stages.push(shader_stage(shader, vk::ShaderStageFlags::ANY_HIT_KHR, &entry)?);
            }
            if let Some(shader) = &group.intersection_shader {
                intersection = stages.len() as u32;
                stages.push(shader_stage(
                    shader,
                    vk::ShaderStageFlags::INTERSECTION_KHR,
                    &entry,
                )?);
            }
            group_indices.insert(group.export_name.clone(), groups.len() as u32);
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .ty(if group.is_procedural_primitive {
                        vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
                    } else {
                        vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
                    })
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(closest_hit)
                    .any_hit_shader(any_hit)
                    .intersection_shader(intersection)
                    .build(),
            );
        }

        let layout_info = build_pipeline_layout(&shared, &desc.binding_layouts)?;

        let create = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth.max(1))
            .layout(layout_info.layout)
            .build();
        let pipeline = unsafe {
            ray_pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create],
                None,
            )
        };
        let pipeline = match pipeline {
            Ok(pipelines) => pipelines[0],
            Err(err) => {
                unsafe { shared.device.destroy_pipeline_layout(layout_info.layout, None) };
                return Err(err.into());
            }
        };
        shared.set_debug_name(pipeline, &desc.debug_name);

        let handle_size = shared.rt_properties.shader_group_handle_size as usize;
        let group_handles = unsafe {
            ray_pipeline.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                groups.len() as u32,
                groups.len() * handle_size,
            )
        }?;

        Ok(Self {
            shared,
            desc,
            pipeline,
            pipeline_layout: layout_info.layout,
            push_constant_stages: layout_info.push_constant_stages,
            push_constant_size: layout_info.push_constant_size,
            set_count: layout_info.set_count,
            group_handles,
            group_indices,
        })
    }

    fn handle_of(&self, export_name: &str) -> Result<Vec<u8>> {
        let index = *self.group_indices.get(export_name).ok_or_else(|| {
            GpuError::InvalidArgument(format!("no shader group named '{}'", export_name))
        })? as usize;
        let size = self.shared.rt_properties.shader_group_handle_size as usize;
        Ok(self.group_handles[index * size..(index + 1) * size].to_vec())
    }
}

impl Resource for VulkanRayTracingPipeline {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RayTracingPipeline for VulkanRayTracingPipeline {
    fn desc(&self) -> &RayTracingPipelineDesc {
        &self.desc
    }

    fn create_shader_table(&self) -> Result<ShaderTableHandle> {
        Ok(Arc::new(Mutex::new(VulkanShaderTable {
            handles: self.group_handles.clone(),
            indices: self.group_indices.clone(),
            handle_size: self.shared.rt_properties.shader_group_handle_size,
            ray_generation: None,
            miss: Vec::new(),
            hit_groups: Vec::new(),
            callable: Vec::new(),
            version: 0,
        })))
    }
}

impl Drop for VulkanRayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            self.shared.device.destroy_pipeline(self.pipeline, None);
            self.shared
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}

/// Snapshot of the owning pipeline's group handles; dispatch assembles the
/// device-side table from these bytes in upload memory.
pub struct VulkanShaderTable {
    handles: Vec<u8>,
    indices: HashMap<String, u32>,
    pub(crate) handle_size: u32,
    pub(crate) ray_generation: Option<u32>,
    pub(crate) miss: Vec<u32>,
    pub(crate) hit_groups: Vec<u32>,
    pub(crate) callable: Vec<u32>,
    /// Bumped on every mutation so a recording command list can tell when
    /// its uploaded copy went stale.
    pub(crate) version: u64,
}

impl VulkanShaderTable {
    fn index_of(&self, export_name: &str) -> Result<u32> {
        self.indices.get(export_name).copied().ok_or_else(|| {
            GpuError::InvalidArgument(format!("no shader group named '{}'", export_name))
        })
    }

    pub(crate) fn handle_bytes(&self, group_index: u32) -> &[u8] {
        let size = self.handle_size as usize;
        &self.handles[group_index as usize * size..(group_index as usize + 1) * size]
    }
}

impl Resource for VulkanShaderTable {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ShaderTable for VulkanShaderTable {
    fn set_ray_generation(&mut self, export_name: &str) -> Result<()> {
        self.ray_generation = Some(self.index_of(export_name)?);
        self.version += 1;
        Ok(())
    }

    fn add_miss_shader(&mut self, export_name: &str) -> Result<()> {
        let index = self.index_of(export_name)?;
        self.miss.push(index);
        self.version += 1;
        Ok(())
    }

    fn add_hit_group(&mut self, export_name: &str) -> Result<()> {
        let index = self.index_of(export_name)?;
        self.hit_groups.push(index);
        self.version += 1;
        Ok(())
    }

    fn add_callable_shader(&mut self, export_name: &str) -> Result<()> {
        let index = self.index_of(export_name)?;
        self.callable.push(index);
        self.version += 1;
        Ok(())
    }

    fn clear_miss_shaders(&mut self) {
        self.miss.clear();
        self.version += 1;
    }

    fn clear_hit_groups(&mut self) {
        self.hit_groups.clear();
        self.version += 1;
    }
}
