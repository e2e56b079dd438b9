//! Command list for the implicit backend.
//!
//! The underlying API executes immediately on the device's single context,
//! so "recording" applies state and issues work right away under the context
//! mutex; `execute_command_lists` only flushes and assigns the submission
//! id. Hazards are driver-managed, which turns the whole barrier surface
//! into no-ops apart from the UAV-overlap scope counter.

use crate::d3d11::binding::{d3d11_buffer, D3D11BindingSet};
use crate::d3d11::convert::*;
use crate::d3d11::pipeline::{d3d11_texture, D3D11ComputePipeline, D3D11Framebuffer, D3D11GraphicsPipeline};
use crate::d3d11::resources::{
    BufferViewKey, D3D11Shader, D3D11TimerQuery, ShaderObject, TextureViewKey,
};
use crate::d3d11::D3D11Context;
use crate::error::{GpuError, Result};
use crate::format::format_info;
use crate::traits::*;
use crate::types::*;
use std::any::Any;
use std::sync::Arc;
use windows::core::PCWSTR;
use windows::Win32::Graphics::Direct3D11::*;

const DRAW_INDIRECT_STRIDE: u64 = 16;
const DRAW_INDEXED_INDIRECT_STRIDE: u64 = 20;

pub struct D3D11CommandList {
    context: Arc<D3D11Context>,
    open: bool,
    current_graphics: Option<GraphicsPipelineHandle>,
    current_compute: Option<ComputePipelineHandle>,
    current_framebuffer: Option<FramebufferHandle>,
    current_graphics_bindings: Vec<BindingSetHandle>,
    current_compute_bindings: Vec<BindingSetHandle>,
    /// Register slot and visibility of the push-constants declaration in the
    /// currently bound sets, if any.
    push_constant_target: Option<(u32, ShaderStageMask)>,
    indirect_buffer: Option<BufferHandle>,
    /// Saturating scope counter; see `set_enable_uav_barriers_for_*`.
    uav_overlap_count: u32,
    valid_graphics: bool,
    valid_compute: bool,
}

impl D3D11CommandList {
    /// Upload and scratch sizing in `params` has no meaning here; writes go
    /// through `UpdateSubresource` and driver-renamed dynamic buffers.
    pub(crate) fn new(context: Arc<D3D11Context>, _params: CommandListParameters) -> Self {
        Self {
            context,
            open: false,
            current_graphics: None,
            current_compute: None,
            current_framebuffer: None,
            current_graphics_bindings: Vec::new(),
            current_compute_bindings: Vec::new(),
            push_constant_target: None,
            indirect_buffer: None,
            uav_overlap_count: 0,
            valid_graphics: false,
            valid_compute: false,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    fn require_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(GpuError::Misuse("command list is not open".into()))
        }
    }

    fn require_graphics(&self) -> Result<()> {
        if self.valid_graphics {
            Ok(())
        } else {
            Err(GpuError::Misuse("no graphics state is bound".into()))
        }
    }

    fn require_compute(&self) -> Result<()> {
        if self.valid_compute {
            Ok(())
        } else {
            Err(GpuError::Misuse("no compute state is bound".into()))
        }
    }

    /// Applies one binding set to every graphics stage in its visibility.
    fn apply_graphics_binding_set(&self, set: &D3D11BindingSet) {
        let immediate = self.context.immediate.lock().unwrap();
        let stages = [
            (ShaderStageMask::VERTEX, 0),
            (ShaderStageMask::HULL, 1),
            (ShaderStageMask::DOMAIN, 2),
            (ShaderStageMask::GEOMETRY, 3),
            (ShaderStageMask::PIXEL, 4),
        ];
        unsafe {
            for (mask, stage) in stages {
                if !set.visibility.contains(mask) {
                    continue;
                }
                for (slot, srv) in &set.srvs {
                    let views = [Some(srv.clone())];
                    match stage {
                        0 => immediate.VSSetShaderResources(*slot, Some(&views)),
                        1 => immediate.HSSetShaderResources(*slot, Some(&views)),
                        2 => immediate.DSSetShaderResources(*slot, Some(&views)),
                        3 => immediate.GSSetShaderResources(*slot, Some(&views)),
                        _ => immediate.PSSetShaderResources(*slot, Some(&views)),
                    }
                }
                for (slot, buffer) in &set.constant_buffers {
                    let buffers = [Some(buffer.clone())];
                    match stage {
                        0 => immediate.VSSetConstantBuffers(*slot, Some(&buffers)),
                        1 => immediate.HSSetConstantBuffers(*slot, Some(&buffers)),
                        2 => immediate.DSSetConstantBuffers(*slot, Some(&buffers)),
                        3 => immediate.GSSetConstantBuffers(*slot, Some(&buffers)),
                        _ => immediate.PSSetConstantBuffers(*slot, Some(&buffers)),
                    }
                }
                for (slot, sampler) in &set.samplers {
                    let samplers = [Some(sampler.clone())];
                    match stage {
                        0 => immediate.VSSetSamplers(*slot, Some(&samplers)),
                        1 => immediate.HSSetSamplers(*slot, Some(&samplers)),
                        2 => immediate.DSSetSamplers(*slot, Some(&samplers)),
                        3 => immediate.GSSetSamplers(*slot, Some(&samplers)),
                        _ => immediate.PSSetSamplers(*slot, Some(&samplers)),
                    }
                }
            }
        }
    }

    fn apply_compute_binding_set(&self, set: &D3D11BindingSet) {
        if !set.visibility.contains(ShaderStageMask::COMPUTE) {
            return;
        }
        let immediate = self.context.immediate.lock().unwrap();
        unsafe {
            for (slot, srv) in &set.srvs {
                immediate.CSSetShaderResources(*slot, Some(&[Some(srv.clone())]));
            }
            for (slot, buffer) in &set.constant_buffers {
                immediate.CSSetConstantBuffers(*slot, Some(&[Some(buffer.clone())]));
            }
            for (slot, sampler) in &set.samplers {
                immediate.CSSetSamplers(*slot, Some(&[Some(sampler.clone())]));
            }
            for (slot, uav) in &set.uavs {
                let views = [Some(uav.clone())];
                immediate.CSSetUnorderedAccessViews(*slot, 1, Some(views.as_ptr()), None);
            }
        }
    }

    fn downcast_binding_set<'a>(set: &'a BindingSetHandle) -> Result<&'a D3D11BindingSet> {
        set.as_any()
            .downcast_ref::<D3D11BindingSet>()
            .ok_or(GpuError::NotSupported("binding set from another backend"))
    }

    fn update_push_constant_target(&mut self, bindings: &[BindingSetHandle]) -> Result<()> {
        self.push_constant_target = None;
        for set in bindings {
            let set = Self::downcast_binding_set(set)?;
            if let Some((slot, _)) = set.push_constants {
                self.push_constant_target = Some((slot, set.visibility));
            }
        }
        Ok(())
    }
}

impl CommandList for D3D11CommandList {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(GpuError::Misuse("command list is already open".into()));
        }
        self.open = true;
        self.clear_state();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.require_open()?;
        self.open = false;
        self.clear_state();
        Ok(())
    }

    fn clear_state(&mut self) {
        self.current_graphics = None;
        self.current_compute = None;
        self.current_framebuffer = None;
        self.current_graphics_bindings.clear();
        self.current_compute_bindings.clear();
        self.push_constant_target = None;
        self.indirect_buffer = None;
        self.valid_graphics = false;
        self.valid_compute = false;
        if self.open {
            let immediate = self.context.immediate.lock().unwrap();
            unsafe { immediate.ClearState() };
        }
    }

    fn clear_texture_float(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        color: Color,
    ) -> Result<()> {
        self.require_open()?;
        let d3d_texture = d3d11_texture(texture)?;
        let resolved = subresources.resolve(&d3d_texture.desc, false);
        let rgba = [color.r, color.g, color.b, color.a];
        let immediate = self.context.immediate.lock().unwrap();
        if d3d_texture.desc.usage.contains(TextureUsage::RENDER_TARGET) {
            let info = format_info(d3d_texture.desc.format);
            if info.has_depth || info.has_stencil {
                drop(immediate);
                return self.clear_depth_stencil_texture(
                    texture,
                    subresources,
                    Some(color.r),
                    Some(0),
                );
            }
            for mip in 0..resolved.mip_count {
                let key = TextureViewKey::new(
                    AccessIntent::RenderTarget,
                    &d3d_texture.desc,
                    TextureSubresourceSet {
                        base_mip: resolved.base_mip + mip,
                        mip_count: 1,
                        base_array_slice: resolved.base_array_slice,
                        array_slice_count: resolved.array_slice_count,
                    },
                    None,
                    ViewAspect::AllAspects,
                );
                let rtv = d3d_texture.get_rtv(key)?;
                unsafe { immediate.ClearRenderTargetView(&rtv, rgba.as_ptr()) };
            }
            Ok(())
        } else if d3d_texture
            .desc
            .usage
            .contains(TextureUsage::UNORDERED_ACCESS)
        {
            for mip in 0..resolved.mip_count {
                let key = TextureViewKey::new(
                    AccessIntent::UnorderedAccess,
                    &d3d_texture.desc,
                    TextureSubresourceSet {
                        base_mip: resolved.base_mip + mip,
                        mip_count: 1,
                        base_array_slice: resolved.base_array_slice,
                        array_slice_count: resolved.array_slice_count,
                    },
                    None,
                    ViewAspect::AllAspects,
                );
                let uav = d3d_texture.get_uav(key)?;
                unsafe { immediate.ClearUnorderedAccessViewFloat(&uav, rgba.as_ptr()) };
            }
            Ok(())
        } else {
            Err(GpuError::InvalidArgument(format!(
                "texture '{}' is neither a render target nor UAV-capable",
                d3d_texture.desc.debug_name
            )))
        }
    }

    fn clear_texture_uint(
        &mut self,
        texture: &TextureHandle,
        subresources: TextureSubresourceSet,
        value: u32,
    ) -> Result<()> {
        self.require_open()?;
        let d3d_texture = d3d11_texture(texture)?;
        if !d3d_texture
            .desc
            .usage
            .contains(TextureUsage::UNORDERED_ACCESS)
        {
            return Err(GpuError::InvalidArgument(format!(
                "integer clears need UAV usage on texture '{}'",
                d3d_texture.desc.debug_name
            )));
        }
        let resolved = subresources.resolve(&d3d_texture.desc, false);
        let values = [value; 4];
        let immediate = self.context.immediate.lock().unwrap();
        for mip in 0..resolved.mip_count {
            let key = TextureViewKey::new(
                AccessIntent::UnorderedAccess,
                &d3d_texture.desc,
                TextureSubresourceSet {
                    base_mip: resolved.base_mip + mip,
                    mip_count: 1,
                    base_array_slice: resolved.base_array_slice,
                    array_slice_count: resolved.array_slice_count,
                },
                None,
                ViewAspect::AllAspects,
            );
            let uav = d3d_texture.get_uav(key)?;
            unsafe { immediate.ClearUnorderedAccessViewUint(&uav, values.as_ptr()) };
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
        self.require_open()?;
        if depth.is_none() && stencil.is_none() {
            return Ok(());
        }
        let d3d_texture = d3d11_texture(texture)?;
        let resolved = subresources.resolve(&d3d_texture.desc, false);
        let mut flags = 0u32;
        if depth.is_some() {
            flags |= D3D11_CLEAR_DEPTH.0 as u32;
        }
        if stencil.is_some() {
            flags |= D3D11_CLEAR_STENCIL.0 as u32;
        }
        let immediate = self.context.immediate.lock().unwrap();
        for mip in 0..resolved.mip_count {
            let key = TextureViewKey::new(
                AccessIntent::DepthStencil,
                &d3d_texture.desc,
                TextureSubresourceSet {
                    base_mip: resolved.base_mip + mip,
                    mip_count: 1,
                    base_array_slice: resolved.base_array_slice,
                    array_slice_count: resolved.array_slice_count,
                },
                None,
                ViewAspect::AllAspects,
            );
            let dsv = d3d_texture.get_dsv(key)?;
            unsafe {
                immediate.ClearDepthStencilView(
                    &dsv,
                    flags,
                    depth.unwrap_or(1.0),
                    stencil.unwrap_or(0),
                )
            };
        }
        Ok(())
    }

    fn clear_buffer_uint(&mut self, buffer: &BufferHandle, value: u32) -> Result<()> {
        self.require_open()?;
        let d3d_buffer = d3d11_buffer(buffer)?;
        if !d3d_buffer.desc.usage.intersects(
            BufferUsage::STRUCTURED | BufferUsage::RAW | BufferUsage::TYPED_VIEW,
        ) {
            return Err(GpuError::InvalidArgument(format!(
                "buffer '{}' cannot have unordered views",
                d3d_buffer.desc.debug_name
            )));
        }
        let key = BufferViewKey {
            format: d3d_buffer.desc.format,
            byte_offset: 0,
            byte_size: d3d_buffer.desc.byte_size,
            raw: d3d_buffer.desc.usage.contains(BufferUsage::RAW),
        };
        let uav = d3d_buffer.get_uav(key)?;
        let values = [value; 4];
        let immediate = self.context.immediate.lock().unwrap();
        unsafe { immediate.ClearUnorderedAccessViewUint(&uav, values.as_ptr()) };
        Ok(())
    }

    fn copy_texture(
        &mut self,
        dst: &TextureHandle,
        dst_slice: TextureSlice,
        src: &TextureHandle,
        src_slice: TextureSlice,
    ) -> Result<()> {
        self.require_open()?;
        let d3d_dst = d3d11_texture(dst)?;
        let d3d_src = d3d11_texture(src)?;
        let src_resolved = src_slice.resolve(&d3d_src.desc);
        let dst_resolved = dst_slice.resolve(&d3d_dst.desc);
        let src_box = D3D11_BOX {
            left: src_resolved.x,
            top: src_resolved.y,
            front: src_resolved.z,
            right: src_resolved.x + src_resolved.width,
            bottom: src_resolved.y + src_resolved.height,
            back: src_resolved.z + src_resolved.depth,
        };
        let immediate = self.context.immediate.lock().unwrap();
        unsafe {
            immediate.CopySubresourceRegion(
                &d3d_dst.resource,
                d3d_dst.subresource_index(dst_resolved.mip_level, dst_resolved.array_slice),
                dst_resolved.x,
                dst_resolved.y,
                dst_resolved.z,
                &d3d_src.resource,
                d3d_src.subresource_index(src_resolved.mip_level, src_resolved.array_slice),
                Some(&src_box),
            );
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
        self.require_open()?;
        let d3d_dst = d3d11_texture(dst)?;
        let d3d_src = d3d11_texture(src)?;
        let dst_resolved = dst_subresources.resolve(&d3d_dst.desc, false);
        let src_resolved = src_subresources.resolve(&d3d_src.desc, false);
        if dst_resolved.mip_count != src_resolved.mip_count
            || dst_resolved.array_slice_count != src_resolved.array_slice_count
        {
            return Err(GpuError::InvalidArgument(
                "resolve source and destination subresources differ in shape".into(),
            ));
        }
        let format = dxgi_format(d3d_dst.desc.format);
        let immediate = self.context.immediate.lock().unwrap();
        for mip in 0..dst_resolved.mip_count {
            for slice in 0..dst_resolved.array_slice_count {
                unsafe {
                    immediate.ResolveSubresource(
                        &d3d_dst.resource,
                        d3d_dst.subresource_index(
                            dst_resolved.base_mip + mip,
                            dst_resolved.base_array_slice + slice,
                        ),
                        &d3d_src.resource,
                        d3d_src.subresource_index(
                            src_resolved.base_mip + mip,
                            src_resolved.base_array_slice + slice,
                        ),
                        format,
                    );
                }
            }
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
        self.require_open()?;
        let d3d_dst = d3d11_texture(dst)?;
        let info = format_info(d3d_dst.desc.format);
        let mip_height = (d3d_dst.desc.height >> mip_level).max(1);
        let block_rows = (mip_height + info.block_size as u32 - 1) / info.block_size as u32;
        let depth_pitch = row_pitch * block_rows as u64;
        let immediate = self.context.immediate.lock().unwrap();
        unsafe {
            immediate.UpdateSubresource(
                &d3d_dst.resource,
                d3d_dst.subresource_index(mip_level, array_slice),
                None,
                data.as_ptr() as *const _,
                row_pitch as u32,
                depth_pitch as u32,
            );
        }
        Ok(())
    }

    fn write_buffer(&mut self, buffer: &BufferHandle, data: &[u8], dst_offset: u64) -> Result<()> {
        self.require_open()?;
        let d3d_buffer = d3d11_buffer(buffer)?;
        if dst_offset + data.len() as u64 > d3d_buffer.desc.byte_size {
            return Err(GpuError::InvalidArgument(format!(
                "write of {} bytes at {} overruns buffer '{}'",
                data.len(),
                dst_offset,
                d3d_buffer.desc.debug_name
            )));
        }
        let immediate = self.context.immediate.lock().unwrap();
        let dynamic = d3d_buffer.desc.is_volatile
            || d3d_buffer.desc.cpu_access == CpuAccessMode::Write;
        if dynamic {
            // Dynamic buffers rename on discard; the driver versions them.
            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            unsafe {
                immediate.Map(
                    &d3d_buffer.buffer,
                    0,
                    D3D11_MAP_WRITE_DISCARD,
                    0,
                    Some(&mut mapped),
                )
            }?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    (mapped.pData as *mut u8).add(dst_offset as usize),
                    data.len(),
                );
                immediate.Unmap(&d3d_buffer.buffer, 0);
            }
        } else if d3d_buffer.desc.usage.contains(BufferUsage::CONSTANT) {
            // Partial updates of constant buffers need an 11.1 context.
            if dst_offset != 0 || data.len() as u64 != d3d_buffer.desc.byte_size {
                return Err(GpuError::Misuse(format!(
                    "constant buffer '{}' must be written whole",
                    d3d_buffer.desc.debug_name
                )));
            }
            unsafe {
                immediate.UpdateSubresource(
                    &d3d_buffer.buffer,
                    0,
                    None,
                    data.as_ptr() as *const _,
                    0,
                    0,
                );
            }
        } else {
            let dst_box = D3D11_BOX {
                left: dst_offset as u32,
                top: 0,
                front: 0,
                right: (dst_offset + data.len() as u64) as u32,
                bottom: 1,
                back: 1,
            };
            unsafe {
                immediate.UpdateSubresource(
                    &d3d_buffer.buffer,
                    0,
                    Some(&dst_box),
                    data.as_ptr() as *const _,
                    0,
                    0,
                );
            }
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
        self.require_open()?;
        let d3d_dst = d3d11_buffer(dst)?;
        let d3d_src = d3d11_buffer(src)?;
        let src_box = D3D11_BOX {
            left: src_offset as u32,
            top: 0,
            front: 0,
            right: (src_offset + byte_size) as u32,
            bottom: 1,
            back: 1,
        };
        let immediate = self.context.immediate.lock().unwrap();
        unsafe {
            immediate.CopySubresourceRegion(
                &d3d_dst.buffer,
                0,
                dst_offset as u32,
                0,
                0,
                &d3d_src.buffer,
                0,
                Some(&src_box),
            );
        }
        Ok(())
    }

    fn set_push_constants(&mut self, data: &[u8]) -> Result<()> {
        self.require_open()?;
        let Some((slot, visibility)) = self.push_constant_target else {
            return Err(GpuError::Misuse(
                "no push-constants declaration in the bound binding sets".into(),
            ));
        };
        if data.len() > self.context.push_constant_capacity as usize {
            return Err(GpuError::InvalidArgument(format!(
                "push constants of {} bytes exceed the {}-byte limit",
                data.len(),
                self.context.push_constant_capacity
            )));
        }
        let immediate = self.context.immediate.lock().unwrap();
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            immediate.Map(
                &self.context.push_constant_buffer,
                0,
                D3D11_MAP_WRITE_DISCARD,
                0,
                Some(&mut mapped),
            )
        }?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.pData as *mut u8, data.len());
            immediate.Unmap(&self.context.push_constant_buffer, 0);
        }
        let buffers = [Some(self.context.push_constant_buffer.clone())];
        unsafe {
            if visibility.contains(ShaderStageMask::VERTEX) {
                immediate.VSSetConstantBuffers(slot, Some(&buffers));
            }
            if visibility.contains(ShaderStageMask::HULL) {
                immediate.HSSetConstantBuffers(slot, Some(&buffers));
            }
            if visibility.contains(ShaderStageMask::DOMAIN) {
                immediate.DSSetConstantBuffers(slot, Some(&buffers));
            }
            if visibility.contains(ShaderStageMask::GEOMETRY) {
                immediate.GSSetConstantBuffers(slot, Some(&buffers));
            }
            if visibility.contains(ShaderStageMask::PIXEL) {
                immediate.PSSetConstantBuffers(slot, Some(&buffers));
            }
            if visibility.contains(ShaderStageMask::COMPUTE) {
                immediate.CSSetConstantBuffers(slot, Some(&buffers));
            }
        }
        Ok(())
    }

    fn set_graphics_state(&mut self, state: &GraphicsState) -> Result<()> {
        self.require_open()?;
        let pipeline_handle = state
            .pipeline
            .clone()
            .ok_or_else(|| GpuError::Misuse("graphics state has no pipeline".into()))?;
        let pipeline = pipeline_handle
            .as_any()
            .downcast_ref::<D3D11GraphicsPipeline>()
            .ok_or(GpuError::NotSupported("pipeline from another backend"))?;
        let framebuffer_handle = state
            .framebuffer
            .clone()
            .ok_or_else(|| GpuError::Misuse("graphics state has no framebuffer".into()))?;
        let framebuffer = framebuffer_handle
            .as_any()
            .downcast_ref::<D3D11Framebuffer>()
            .ok_or(GpuError::NotSupported("framebuffer from another backend"))?;

        let pipeline_changed = !self
            .current_graphics
            .as_ref()
            .map(|current| Arc::ptr_eq(current, &pipeline_handle))
            .unwrap_or(false);
        let framebuffer_changed = !self
            .current_framebuffer
            .as_ref()
            .map(|current| Arc::ptr_eq(current, &framebuffer_handle))
            .unwrap_or(false);

        {
            let immediate = self.context.immediate.lock().unwrap();
            unsafe {
                if pipeline_changed {
                    immediate.IASetPrimitiveTopology(primitive_topology(
                        pipeline.desc.primitive_type,
                        pipeline.desc.patch_control_points,
                    ));
                    immediate.IASetInputLayout(pipeline.input_layout.as_ref());
                    bind_graphics_shaders(&immediate, pipeline)?;
                    immediate.RSSetState(&pipeline.rasterizer);
                }
                let blend_factor = [
                    state.blend_constant_color.r,
                    state.blend_constant_color.g,
                    state.blend_constant_color.b,
                    state.blend_constant_color.a,
                ];
                immediate.OMSetBlendState(
                    &pipeline.blend,
                    if pipeline.uses_blend_constants {
                        Some(blend_factor.as_ptr())
                    } else {
                        None
                    },
                    u32::MAX,
                );
                let stencil_ref = if pipeline.requires_dynamic_stencil_ref {
                    state.dynamic_stencil_ref_value
                } else {
                    pipeline.desc.render_state.depth_stencil.stencil_ref_value
                };
                immediate.OMSetDepthStencilState(&pipeline.depth_stencil, stencil_ref as u32);
                if framebuffer_changed {
                    let rtvs: Vec<Option<ID3D11RenderTargetView>> =
                        framebuffer.rtvs.iter().cloned().map(Some).collect();
                    immediate.OMSetRenderTargets(
                        if rtvs.is_empty() { None } else { Some(&rtvs) },
                        framebuffer.dsv.as_ref(),
                    );
                }
                let viewports: Vec<D3D11_VIEWPORT> = state
                    .viewport
                    .viewports
                    .iter()
                    .map(|viewport| D3D11_VIEWPORT {
                        TopLeftX: viewport.min_x,
                        TopLeftY: viewport.min_y,
                        Width: viewport.width(),
                        Height: viewport.height(),
                        MinDepth: viewport.min_z,
                        MaxDepth: viewport.max_z,
                    })
                    .collect();
                if !viewports.is_empty() {
                    immediate.RSSetViewports(Some(&viewports));
                }
                let scissors: Vec<windows::Win32::Foundation::RECT> = state
                    .viewport
                    .scissors
                    .iter()
                    .map(|rect| windows::Win32::Foundation::RECT {
                        left: rect.min_x,
                        top: rect.min_y,
                        right: rect.max_x,
                        bottom: rect.max_y,
                    })
                    .collect();
                if !scissors.is_empty() {
                    immediate.RSSetScissorRects(Some(&scissors));
                }
                for binding in &state.vertex_buffers {
                    let d3d_vb = d3d11_buffer(&binding.buffer)?;
                    let stride = pipeline
                        .desc
                        .input_layout
                        .as_ref()
                        .and_then(|layout| {
                            layout
                                .as_any()
                                .downcast_ref::<crate::d3d11::resources::D3D11InputLayout>()
                        })
                        .and_then(|layout| layout.strides.get(&binding.slot).copied())
                        .unwrap_or(0);
                    let buffers = [Some(d3d_vb.buffer.clone())];
                    let strides = [stride];
                    let offsets = [binding.offset as u32];
                    immediate.IASetVertexBuffers(
                        binding.slot,
                        1,
                        Some(buffers.as_ptr()),
                        Some(strides.as_ptr()),
                        Some(offsets.as_ptr()),
                    );
                }
                if let Some(binding) = &state.index_buffer {
                    let d3d_ib = d3d11_buffer(&binding.buffer)?;
                    immediate.IASetIndexBuffer(
                        &d3d_ib.buffer,
                        index_format(binding.format),
                        binding.offset as u32,
                    );
                }
            }
        }

        // Bind only the sets that changed since the previous state.
        for (index, set) in state.bindings.iter().enumerate() {
            let unchanged = self
                .current_graphics_bindings
                .get(index)
                .map(|current| Arc::ptr_eq(current, set))
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            self.apply_graphics_binding_set(Self::downcast_binding_set(set)?);
        }
        self.update_push_constant_target(&state.bindings)?;

        self.current_graphics = Some(pipeline_handle);
        self.current_framebuffer = Some(framebuffer_handle);
        self.current_graphics_bindings = state.bindings.clone();
        self.indirect_buffer = state.indirect_params.clone();
        self.current_compute = None;
        self.current_compute_bindings.clear();
        self.valid_graphics = true;
        self.valid_compute = false;
        Ok(())
    }

    fn set_compute_state(&mut self, state: &ComputeState) -> Result<()> {
        self.require_open()?;
        let pipeline_handle = state
            .pipeline
            .clone()
            .ok_or_else(|| GpuError::Misuse("compute state has no pipeline".into()))?;
        let pipeline = pipeline_handle
            .as_any()
            .downcast_ref::<D3D11ComputePipeline>()
            .ok_or(GpuError::NotSupported("pipeline from another backend"))?;
        let shader = pipeline
            .desc
            .compute_shader
            .as_ref()
            .ok_or_else(|| GpuError::Misuse("compute pipeline has no shader".into()))?;
        let shader = shader
            .as_any()
            .downcast_ref::<D3D11Shader>()
            .ok_or(GpuError::NotSupported("shader from another backend"))?;
        {
            let immediate = self.context.immediate.lock().unwrap();
            match &shader.object {
                ShaderObject::Compute(object) => unsafe {
                    immediate.CSSetShader(object, None);
                },
                _ => return Err(GpuError::Misuse("shader is not a compute shader".into())),
            }
        }
        for (index, set) in state.bindings.iter().enumerate() {
            let unchanged = self
                .current_compute_bindings
                .get(index)
                .map(|current| Arc::ptr_eq(current, set))
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            self.apply_compute_binding_set(Self::downcast_binding_set(set)?);
        }
        self.update_push_constant_target(&state.bindings)?;
        self.current_compute = Some(pipeline_handle);
        self.current_compute_bindings = state.bindings.clone();
        self.indirect_buffer = state.indirect_params.clone();
        self.current_graphics = None;
        self.current_graphics_bindings.clear();
        self.valid_compute = true;
        self.valid_graphics = false;
        Ok(())
    }

    fn set_mesh_state(&mut self, _state: &MeshState) -> Result<()> {
        Err(GpuError::NotSupported("mesh shading on the implicit backend"))
    }

    fn set_ray_tracing_state(&mut self, _state: &RayTracingState) -> Result<()> {
        Err(GpuError::NotSupported("ray tracing on the implicit backend"))
    }

    fn draw(&mut self, args: DrawArguments) -> Result<()> {
        self.require_open()?;
        self.require_graphics()?;
        let immediate = self.context.immediate.lock().unwrap();
        unsafe {
            immediate.DrawInstanced(
                args.vertex_count,
                args.instance_count,
                args.start_vertex_location.max(0) as u32,
                args.start_instance_location,
            );
        }
        Ok(())
    }

    fn draw_indexed(&mut self, args: DrawArguments) -> Result<()> {
        self.require_open()?;
        self.require_graphics()?;
        let immediate = self.context.immediate.lock().unwrap();
        unsafe {
            immediate.DrawIndexedInstanced(
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
        self.require_open()?;
        self.require_graphics()?;
        let buffer = self
            .indirect_buffer
            .clone()
            .ok_or_else(|| GpuError::Misuse("no indirect-argument buffer is bound".into()))?;
        let d3d_buffer = d3d11_buffer(&buffer)?;
        let immediate = self.context.immediate.lock().unwrap();
        // No multi-draw on this API; one call per entry.
        for index in 0..draw_count as u64 {
            unsafe {
                immediate.DrawInstancedIndirect(
                    &d3d_buffer.buffer,
                    (offset_bytes + index * DRAW_INDIRECT_STRIDE) as u32,
                );
            }
        }
        Ok(())
    }

    fn draw_indexed_indirect(&mut self, offset_bytes: u64, draw_count: u32) -> Result<()> {
        self.require_open()?;
        self.require_graphics()?;
        let buffer = self
            .indirect_buffer
            .clone()
            .ok_or_else(|| GpuError::Misuse("no indirect-argument buffer is bound".into()))?;
        let d3d_buffer = d3d11_buffer(&buffer)?;
        let immediate = self.context.immediate.lock().unwrap();
        for index in 0..draw_count as u64 {
            unsafe {
                immediate.DrawIndexedInstancedIndirect(
                    &d3d_buffer.buffer,
                    (offset_bytes + index * DRAW_INDEXED_INDIRECT_STRIDE) as u32,
                );
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.require_open()?;
        self.require_compute()?;
        let immediate = self.context.immediate.lock().unwrap();
        unsafe { immediate.Dispatch(x, y, z) };
        Ok(())
    }

    fn dispatch_indirect(&mut self, offset_bytes: u64) -> Result<()> {
        self.require_open()?;
        self.require_compute()?;
        let buffer = self
            .indirect_buffer
            .clone()
            .ok_or_else(|| GpuError::Misuse("no indirect-argument buffer is bound".into()))?;
        let d3d_buffer = d3d11_buffer(&buffer)?;
        let immediate = self.context.immediate.lock().unwrap();
        unsafe { immediate.DispatchIndirect(&d3d_buffer.buffer, offset_bytes as u32) };
        Ok(())
    }

    fn dispatch_mesh(&mut self, _x: u32, _y: u32, _z: u32) -> Result<()> {
        Err(GpuError::NotSupported("mesh shading on the implicit backend"))
    }

    fn dispatch_rays(&mut self, _args: DispatchRaysArguments) -> Result<()> {
        Err(GpuError::NotSupported("ray tracing on the implicit backend"))
    }

    fn build_bottom_level_accel_struct(
        &mut self,
        _accel: &AccelStructHandle,
        _geometries: &[GeometryDesc],
        _build_flags: AccelStructBuildFlags,
    ) -> Result<()> {
        Err(GpuError::NotSupported(
            "acceleration structures on the implicit backend",
        ))
    }

    fn build_top_level_accel_struct(
        &mut self,
        _accel: &AccelStructHandle,
        _instances: &[InstanceDesc],
        _build_flags: AccelStructBuildFlags,
    ) -> Result<()> {
        Err(GpuError::NotSupported(
            "acceleration structures on the implicit backend",
        ))
    }

    fn compact_bottom_level_accel_structs(&mut self) -> Result<()> {
        Err(GpuError::NotSupported(
            "acceleration structures on the implicit backend",
        ))
    }

    fn begin_timer_query(&mut self, query: &TimerQueryHandle) -> Result<()> {
        self.require_open()?;
        let timer = query
            .as_any()
            .downcast_ref::<D3D11TimerQuery>()
            .ok_or(GpuError::NotSupported("timer query from another backend"))?;
        let immediate = self.context.immediate.lock().unwrap();
        unsafe {
            immediate.Begin(&timer.disjoint);
            immediate.End(&timer.start);
        }
        let mut state = timer.state.lock().unwrap();
        state.started = true;
        state.resolved = false;
        Ok(())
    }

    fn end_timer_query(&mut self, query: &TimerQueryHandle) -> Result<()> {
        self.require_open()?;
        let timer = query
            .as_any()
            .downcast_ref::<D3D11TimerQuery>()
            .ok_or(GpuError::NotSupported("timer query from another backend"))?;
        let immediate = self.context.immediate.lock().unwrap();
        unsafe {
            immediate.End(&timer.end);
            immediate.End(&timer.disjoint);
        }
        Ok(())
    }

    fn begin_marker(&mut self, name: &str) {
        if let Some(annotation) = &self.context.annotation {
            let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
            let _immediate = self.context.immediate.lock().unwrap();
            unsafe { annotation.BeginEvent(PCWSTR(wide.as_ptr())) };
        }
    }

    fn end_marker(&mut self) {
        if let Some(annotation) = &self.context.annotation {
            let _immediate = self.context.immediate.lock().unwrap();
            unsafe { annotation.EndEvent() };
        }
    }

    // Hazards are driver-managed on this backend; the state-tracking surface
    // collapses to no-ops except for the UAV-overlap scope counter.

    fn set_enable_automatic_barriers(&mut self, _enable: bool) {}

    fn set_resource_states_for_binding_set(&mut self, _binding_set: &BindingSetHandle) {}

    fn begin_tracking_texture_state(
        &mut self,
        _texture: &TextureHandle,
        _subresources: TextureSubresourceSet,
        _state: ResourceStates,
    ) {
    }

    fn begin_tracking_buffer_state(&mut self, _buffer: &BufferHandle, _state: ResourceStates) {}

    fn set_texture_state(
        &mut self,
        _texture: &TextureHandle,
        _subresources: TextureSubresourceSet,
        _state: ResourceStates,
    ) {
    }

    fn set_buffer_state(&mut self, _buffer: &BufferHandle, _state: ResourceStates) {}

    fn set_permanent_texture_state(&mut self, _texture: &TextureHandle, _state: ResourceStates) {}

    fn set_permanent_buffer_state(&mut self, _buffer: &BufferHandle, _state: ResourceStates) {}

    fn set_enable_uav_barriers_for_texture(&mut self, _texture: &TextureHandle, enable: bool) {
        self.adjust_uav_overlap(enable);
    }

    fn set_enable_uav_barriers_for_buffer(&mut self, _buffer: &BufferHandle, enable: bool) {
        self.adjust_uav_overlap(enable);
    }

    fn commit_barriers(&mut self) -> Result<()> {
        Ok(())
    }
}

impl D3D11CommandList {
    /// Disabling UAV barriers enters the overlap scope, enabling leaves it.
    /// The counter saturates at zero on underflow.
    fn adjust_uav_overlap(&mut self, enable: bool) {
        if enable {
            self.uav_overlap_count = self.uav_overlap_count.saturating_sub(1);
        } else {
            self.uav_overlap_count += 1;
        }
    }
}

fn bind_graphics_shaders(
    immediate: &ID3D11DeviceContext,
    pipeline: &D3D11GraphicsPipeline,
) -> Result<()> {
    fn object(handle: &Option<ShaderHandle>) -> Result<Option<ShaderObject>> {
        match handle {
            None => Ok(None),
            Some(shader) => {
                let shader = shader
                    .as_any()
                    .downcast_ref::<D3D11Shader>()
                    .ok_or(GpuError::NotSupported("shader from another backend"))?;
                Ok(Some(shader.object.clone()))
            }
        }
    }
    let wrong_stage = || GpuError::Misuse("shader was compiled for a different stage".into());
    unsafe {
        match object(&pipeline.desc.vertex_shader)? {
            Some(ShaderObject::Vertex(shader)) => immediate.VSSetShader(&shader, None),
            None => immediate.VSSetShader(None::<&ID3D11VertexShader>, None),
            Some(_) => return Err(wrong_stage()),
        }
        match object(&pipeline.desc.hull_shader)? {
            Some(ShaderObject::Hull(shader)) => immediate.HSSetShader(&shader, None),
            None => immediate.HSSetShader(None::<&ID3D11HullShader>, None),
            Some(_) => return Err(wrong_stage()),
        }
        match object(&pipeline.desc.domain_shader)? {
            Some(ShaderObject::Domain(shader)) => immediate.DSSetShader(&shader, None),
            None => immediate.DSSetShader(None::<&ID3D11DomainShader>, None),
            Some(_) => return Err(wrong_stage()),
        }
        match object(&pipeline.desc.geometry_shader)? {
            Some(ShaderObject::Geometry(shader)) => immediate.GSSetShader(&shader, None),
            None => immediate.GSSetShader(None::<&ID3D11GeometryShader>, None),
            Some(_) => return Err(wrong_stage()),
        }
        match object(&pipeline.desc.pixel_shader)? {
            Some(ShaderObject::Pixel(shader)) => immediate.PSSetShader(&shader, None),
            None => immediate.PSSetShader(None::<&ID3D11PixelShader>, None),
            Some(_) => return Err(wrong_stage()),
        }
    }
    Ok(())
}
