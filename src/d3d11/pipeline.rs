//! Framebuffers and pipelines for the implicit backend.
//!
//! The API has no monolithic pipeline object; a graphics pipeline here is
//! the bundle of stage shaders plus rasterizer/blend/depth-stencil state
//! objects interned on the device by structural hash.

use crate::d3d11::convert::*;
use crate::d3d11::resources::{D3D11InputLayout, D3D11Shader, D3D11Texture, TextureViewKey};
use crate::d3d11::D3D11Context;
use crate::error::{GpuError, Result};
use crate::traits::*;
use crate::types::*;
use std::any::Any;
use std::sync::Arc;
use windows::core::PCSTR;
use windows::Win32::Graphics::Direct3D11::*;

pub struct D3D11Framebuffer {
    pub(crate) desc: FramebufferDesc,
    pub(crate) info: FramebufferInfo,
    pub(crate) rtvs: Vec<ID3D11RenderTargetView>,
    pub(crate) dsv: Option<ID3D11DepthStencilView>,
}

impl D3D11Framebuffer {
    pub(crate) fn create(desc: FramebufferDesc) -> Result<Self> {
        let mut info = FramebufferInfo::default();
        let mut rtvs = Vec::with_capacity(desc.color_attachments.len());
        for attachment in &desc.color_attachments {
            let texture = d3d11_texture(&attachment.texture)?;
            let key = TextureViewKey::new(
                AccessIntent::RenderTarget,
                &texture.desc,
                attachment.subresources,
                attachment.format,
                ViewAspect::AllAspects,
            );
            rtvs.push(texture.get_rtv(key)?);
            info.color_formats
                .push(attachment.format.unwrap_or(texture.desc.format));
            let mip_width = (texture.desc.width >> key.base_mip).max(1);
            let mip_height = (texture.desc.height >> key.base_mip).max(1);
            info.width = info.width.max(mip_width);
            info.height = info.height.max(mip_height);
            info.sample_count = texture.desc.sample_count;
        }
        let dsv = match &desc.depth_attachment {
            Some(attachment) => {
                let texture = d3d11_texture(&attachment.texture)?;
                let mut key = TextureViewKey::new(
                    AccessIntent::DepthStencil,
                    &texture.desc,
                    attachment.subresources,
                    attachment.format,
                    ViewAspect::AllAspects,
                );
                key.read_only = attachment.is_read_only;
                info.depth_format = Some(attachment.format.unwrap_or(texture.desc.format));
                let mip_width = (texture.desc.width >> key.base_mip).max(1);
                let mip_height = (texture.desc.height >> key.base_mip).max(1);
                info.width = info.width.max(mip_width);
                info.height = info.height.max(mip_height);
                info.sample_count = texture.desc.sample_count;
                Some(texture.get_dsv(key)?)
            }
            None => None,
        };
        if desc.shading_rate_attachment.is_some() {
            return Err(GpuError::NotSupported(
                "shading-rate attachments on the implicit backend",
            ));
        }
        if info.sample_count == 0 {
            info.sample_count = 1;
        }
        Ok(Self {
            desc,
            info,
            rtvs,
            dsv,
        })
    }
}

// Same shareability argument as the resources module: plain COM pointers.
unsafe impl Send for D3D11Framebuffer {}
unsafe impl Sync for D3D11Framebuffer {}
unsafe impl Send for D3D11GraphicsPipeline {}
unsafe impl Sync for D3D11GraphicsPipeline {}

impl Resource for D3D11Framebuffer {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Framebuffer for D3D11Framebuffer {
    fn desc(&self) -> &FramebufferDesc {
        &self.desc
    }

    fn info(&self) -> &FramebufferInfo {
        &self.info
    }
}

pub struct D3D11GraphicsPipeline {
    pub(crate) desc: GraphicsPipelineDesc,
    pub(crate) framebuffer_info: FramebufferInfo,
    pub(crate) shader_mask: ShaderStageMask,
    pub(crate) uses_blend_constants: bool,
    pub(crate) requires_dynamic_stencil_ref: bool,
    pub(crate) rasterizer: ID3D11RasterizerState,
    pub(crate) blend: ID3D11BlendState,
    pub(crate) depth_stencil: ID3D11DepthStencilState,
    pub(crate) input_layout: Option<ID3D11InputLayout>,
}

impl D3D11GraphicsPipeline {
    pub(crate) fn create(
        context: &Arc<D3D11Context>,
        desc: GraphicsPipelineDesc,
        framebuffer_info: &FramebufferInfo,
    ) -> Result<Self> {
        if desc.primitive_type == PrimitiveType::TriangleFan {
            return Err(GpuError::NotSupported(
                "triangle fans on the implicit backend",
            ));
        }
        let mut shader_mask = ShaderStageMask::empty();
        for shader in [
            &desc.vertex_shader,
            &desc.hull_shader,
            &desc.domain_shader,
            &desc.geometry_shader,
            &desc.pixel_shader,
        ]
        .into_iter()
        .flatten()
        {
            shader_mask |= shader.desc().stage.mask();
        }

        let rasterizer = context.intern_rasterizer_state(&desc.render_state.raster)?;
        let blend = context.intern_blend_state(&desc.render_state.blend)?;
        let depth_stencil =
            context.intern_depth_stencil_state(&desc.render_state.depth_stencil)?;

        let input_layout = match (&desc.input_layout, &desc.vertex_shader) {
            (Some(layout), Some(shader)) => {
                let layout = layout
                    .as_any()
                    .downcast_ref::<D3D11InputLayout>()
                    .ok_or(GpuError::NotSupported("input layout from another backend"))?;
                let shader = shader
                    .as_any()
                    .downcast_ref::<D3D11Shader>()
                    .ok_or(GpuError::NotSupported("shader from another backend"))?;
                Some(realize_input_layout(context, layout, &shader.bytecode)?)
            }
            (Some(_), None) => {
                return Err(GpuError::InvalidArgument(
                    "input layout requires a vertex shader".into(),
                ))
            }
            _ => None,
        };

        let uses_blend_constants = desc
            .render_state
            .blend
            .uses_constant_color(framebuffer_info.color_formats.len());
        let requires_dynamic_stencil_ref = desc.render_state.depth_stencil.dynamic_stencil_ref;

        Ok(Self {
            desc,
            framebuffer_info: framebuffer_info.clone(),
            shader_mask,
            uses_blend_constants,
            requires_dynamic_stencil_ref,
            rasterizer,
            blend,
            depth_stencil,
            input_layout,
        })
    }
}

impl Resource for D3D11GraphicsPipeline {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl GraphicsPipeline for D3D11GraphicsPipeline {
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

pub struct D3D11ComputePipeline {
    pub(crate) desc: ComputePipelineDesc,
}

impl Resource for D3D11ComputePipeline {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ComputePipeline for D3D11ComputePipeline {
    fn desc(&self) -> &ComputePipelineDesc {
        &self.desc
    }
}

/// Builds (or reuses) the backend input-layout object against a vertex
/// shader's input signature.
fn realize_input_layout(
    context: &D3D11Context,
    layout: &D3D11InputLayout,
    vertex_bytecode: &[u8],
) -> Result<ID3D11InputLayout> {
    let mut cached = layout.layout.lock().unwrap();
    if let Some(existing) = cached.as_ref() {
        return Ok(existing.clone());
    }
    // Semantic strings must stay alive until CreateInputLayout returns.
    let semantics: Vec<std::ffi::CString> = layout
        .attributes
        .iter()
        .map(|attribute| {
            std::ffi::CString::new(attribute.name.clone()).map_err(|_| {
                GpuError::InvalidArgument(format!(
                    "vertex attribute name '{}' contains a NUL byte",
                    attribute.name
                ))
            })
        })
        .collect::<Result<_>>()?;
    let mut elements = Vec::with_capacity(layout.attributes.len());
    for (attribute, semantic) in layout.attributes.iter().zip(&semantics) {
        for index in 0..attribute.array_size {
            elements.push(D3D11_INPUT_ELEMENT_DESC {
                SemanticName: PCSTR(semantic.as_ptr() as *const u8),
                SemanticIndex: index,
                Format: dxgi_format(attribute.format),
                InputSlot: attribute.buffer_index,
                AlignedByteOffset: attribute.offset + index * attribute.format.bytes_per_block(),
                InputSlotClass: if attribute.is_instanced {
                    D3D11_INPUT_PER_INSTANCE_DATA
                } else {
                    D3D11_INPUT_PER_VERTEX_DATA
                },
                InstanceDataStepRate: u32::from(attribute.is_instanced),
            });
        }
    }
    let mut object = None;
    unsafe {
        context
            .device
            .CreateInputLayout(&elements, vertex_bytecode, Some(&mut object))
    }?;
    let object = object.ok_or(GpuError::NotSupported("input layout creation"))?;
    *cached = Some(object.clone());
    Ok(object)
}

pub(crate) fn d3d11_texture(handle: &TextureHandle) -> Result<&D3D11Texture> {
    handle
        .as_any()
        .downcast_ref::<D3D11Texture>()
        .ok_or(GpuError::NotSupported("texture from another backend"))
}

impl D3D11Context {
    pub(crate) fn intern_rasterizer_state(
        &self,
        state: &RasterState,
    ) -> Result<ID3D11RasterizerState> {
        let mut cache = self.rasterizer_states.lock().unwrap();
        if let Some(existing) = cache.get(state) {
            return Ok(existing.clone());
        }
        let desc = D3D11_RASTERIZER_DESC {
            FillMode: fill_mode(state.fill_mode),
            CullMode: cull_mode(state.cull_mode),
            FrontCounterClockwise: state.front_counter_clockwise.into(),
            DepthBias: state.depth_bias,
            DepthBiasClamp: state.depth_bias_clamp(),
            SlopeScaledDepthBias: state.slope_scaled_depth_bias(),
            DepthClipEnable: state.depth_clip_enable.into(),
            ScissorEnable: state.scissor_enable.into(),
            MultisampleEnable: state.multisample_enable.into(),
            AntialiasedLineEnable: false.into(),
        };
        if state.conservative_raster_enable {
            return Err(GpuError::NotSupported(
                "conservative rasterization on the implicit backend",
            ));
        }
        let mut object = None;
        unsafe { self.device.CreateRasterizerState(&desc, Some(&mut object)) }?;
        let object = object.ok_or(GpuError::NotSupported("rasterizer state creation"))?;
        cache.insert(state.clone(), object.clone());
        Ok(object)
    }

    pub(crate) fn intern_blend_state(&self, state: &BlendState) -> Result<ID3D11BlendState> {
        let mut cache = self.blend_states.lock().unwrap();
        if let Some(existing) = cache.get(state) {
            return Ok(existing.clone());
        }
        let mut desc = D3D11_BLEND_DESC {
            AlphaToCoverageEnable: state.alpha_to_coverage_enable.into(),
            IndependentBlendEnable: true.into(),
            ..Default::default()
        };
        for (target, out) in state.targets.iter().zip(desc.RenderTarget.iter_mut()) {
            *out = D3D11_RENDER_TARGET_BLEND_DESC {
                BlendEnable: target.blend_enable.into(),
                SrcBlend: blend_factor(target.src_blend),
                DestBlend: blend_factor(target.dst_blend),
                BlendOp: blend_op(target.blend_op),
                SrcBlendAlpha: blend_factor(target.src_blend_alpha),
                DestBlendAlpha: blend_factor(target.dst_blend_alpha),
                BlendOpAlpha: blend_op(target.blend_op_alpha),
                RenderTargetWriteMask: target.color_write_mask.bits(),
            };
        }
        let mut object = None;
        unsafe { self.device.CreateBlendState(&desc, Some(&mut object)) }?;
        let object = object.ok_or(GpuError::NotSupported("blend state creation"))?;
        cache.insert(state.clone(), object.clone());
        Ok(object)
    }

    pub(crate) fn intern_depth_stencil_state(
        &self,
        state: &DepthStencilState,
    ) -> Result<ID3D11DepthStencilState> {
        let mut cache = self.depth_stencil_states.lock().unwrap();
        if let Some(existing) = cache.get(state) {
            return Ok(existing.clone());
        }
        let desc = D3D11_DEPTH_STENCIL_DESC {
            DepthEnable: state.depth_test_enable.into(),
            DepthWriteMask: if state.depth_write_enable {
                D3D11_DEPTH_WRITE_MASK_ALL
            } else {
                D3D11_DEPTH_WRITE_MASK_ZERO
            },
            DepthFunc: comparison_func(state.depth_func),
            StencilEnable: state.stencil_enable.into(),
            StencilReadMask: state.stencil_read_mask,
            StencilWriteMask: state.stencil_write_mask,
            FrontFace: stencil_op_desc(state.front_face),
            BackFace: stencil_op_desc(state.back_face),
        };
        let mut object = None;
        unsafe {
            self.device
                .CreateDepthStencilState(&desc, Some(&mut object))
        }?;
        let object = object.ok_or(GpuError::NotSupported("depth stencil state creation"))?;
        cache.insert(state.clone(), object.clone());
        Ok(object)
    }
}
