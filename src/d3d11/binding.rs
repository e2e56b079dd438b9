//! Binding layouts and sets for the implicit backend.
//!
//! No descriptor-set objects exist here: baking a layout resolves every item
//! to a flat register slot (`offset_for(register class) + slot`), and a
//! binding set resolves the concrete views up front so binds are plain
//! slot/view pairs.

use crate::d3d11::pipeline::d3d11_texture;
use crate::d3d11::resources::{BufferViewKey, D3D11Buffer, D3D11Sampler, TextureViewKey};
use crate::error::{GpuError, Result};
use crate::traits::*;
use crate::types::*;
use std::any::Any;
use windows::Win32::Graphics::Direct3D11::*;

pub struct D3D11BindingLayout {
    pub(crate) desc: BindingLayoutDesc,
}

impl Resource for D3D11BindingLayout {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl BindingLayout for D3D11BindingLayout {
    fn desc(&self) -> Option<&BindingLayoutDesc> {
        Some(&self.desc)
    }

    fn bindless_desc(&self) -> Option<&BindlessLayoutDesc> {
        None
    }
}

pub struct D3D11BindingSet {
    pub(crate) desc: BindingSetDesc,
    pub(crate) layout: BindingLayoutHandle,
    pub(crate) visibility: ShaderStageMask,
    pub(crate) srvs: Vec<(u32, ID3D11ShaderResourceView)>,
    pub(crate) uavs: Vec<(u32, ID3D11UnorderedAccessView)>,
    pub(crate) constant_buffers: Vec<(u32, ID3D11Buffer)>,
    pub(crate) samplers: Vec<(u32, ID3D11SamplerState)>,
    /// Register slot and byte size of the push-constants item, if declared.
    pub(crate) push_constants: Option<(u32, u32)>,
}

// The baked views are plain COM pointers; the set itself is immutable after
// creation.
unsafe impl Send for D3D11BindingSet {}
unsafe impl Sync for D3D11BindingSet {}

impl D3D11BindingSet {
    pub(crate) fn create(desc: BindingSetDesc, layout: &BindingLayoutHandle) -> Result<Self> {
        let layout_desc = layout
            .desc()
            .ok_or(GpuError::NotSupported("bindless layouts as binding sets"))?
            .clone();
        let mut set = Self {
            desc: BindingSetDesc {
                debug_name: String::new(),
                bindings: Vec::new(),
                track_liveness: desc.track_liveness,
            },
            layout: layout.clone(),
            visibility: layout_desc.visibility,
            srvs: Vec::new(),
            uavs: Vec::new(),
            constant_buffers: Vec::new(),
            samplers: Vec::new(),
            push_constants: None,
        };
        for item in &desc.bindings {
            let declared = layout_desc
                .bindings
                .iter()
                .find(|binding| binding.slot == item.slot && binding.ty == item.ty)
                .ok_or_else(|| {
                    GpuError::InvalidArgument(format!(
                        "binding {:?} at slot {} is not declared by layout '{}'",
                        item.ty, item.slot, layout_desc.debug_name
                    ))
                })?;
            let register = layout_desc
                .binding_offsets
                .offset_for(declared.ty.register_class())
                + declared.slot;
            set.bake(item, register)?;
        }
        // Retain the bound resources for the set's lifetime.
        set.desc = desc;
        Ok(set)
    }

    fn bake(&mut self, item: &BindingSetItem, register: u32) -> Result<()> {
        match (&item.resource, item.ty) {
            (
                ResourceBinding::Texture {
                    texture,
                    subresources,
                    format,
                    ..
                },
                ResourceType::TextureSrv,
            ) => {
                let texture = d3d11_texture(texture)?;
                let key = TextureViewKey::new(
                    AccessIntent::ShaderResource,
                    &texture.desc,
                    *subresources,
                    *format,
                    ViewAspect::AllAspects,
                );
                self.srvs.push((register, texture.get_srv(key)?));
            }
            (
                ResourceBinding::Texture {
                    texture,
                    subresources,
                    format,
                    ..
                },
                ResourceType::TextureUav,
            ) => {
                let texture = d3d11_texture(texture)?;
                let key = TextureViewKey::new(
                    AccessIntent::UnorderedAccess,
                    &texture.desc,
                    *subresources,
                    *format,
                    ViewAspect::AllAspects,
                );
                self.uavs.push((register, texture.get_uav(key)?));
            }
            (ResourceBinding::Buffer { buffer, range, format }, ty) => {
                let d3d_buffer = d3d11_buffer(buffer)?;
                let resolved = range.resolve(&d3d_buffer.desc);
                let key = BufferViewKey {
                    format: format.unwrap_or(d3d_buffer.desc.format),
                    byte_offset: resolved.byte_offset,
                    byte_size: resolved.byte_size,
                    raw: matches!(ty, ResourceType::RawBufferSrv | ResourceType::RawBufferUav),
                };
                match ty {
                    ResourceType::TypedBufferSrv
                    | ResourceType::StructuredBufferSrv
                    | ResourceType::RawBufferSrv => {
                        self.srvs.push((register, d3d_buffer.get_srv(key)?));
                    }
                    ResourceType::TypedBufferUav
                    | ResourceType::StructuredBufferUav
                    | ResourceType::RawBufferUav => {
                        self.uavs.push((register, d3d_buffer.get_uav(key)?));
                    }
                    _ => {
                        return Err(GpuError::InvalidArgument(format!(
                            "buffer resource bound as {:?}",
                            ty
                        )))
                    }
                }
            }
            (
                ResourceBinding::ConstantBuffer { buffer, .. },
                ResourceType::ConstantBuffer | ResourceType::VolatileConstantBuffer,
            ) => {
                // Sub-range constant-buffer binds need 11.1 contexts; whole
                // buffers are bound and ranges are a validation-layer concern.
                let d3d_buffer = d3d11_buffer(buffer)?;
                self.constant_buffers
                    .push((register, d3d_buffer.buffer.clone()));
            }
            (ResourceBinding::Sampler(sampler), ResourceType::Sampler) => {
                let sampler = sampler
                    .as_any()
                    .downcast_ref::<D3D11Sampler>()
                    .ok_or(GpuError::NotSupported("sampler from another backend"))?;
                self.samplers.push((register, sampler.sampler.clone()));
            }
            (ResourceBinding::PushConstants { byte_size }, ResourceType::PushConstants) => {
                self.push_constants = Some((register, *byte_size));
            }
            (ResourceBinding::AccelStruct(_), _) => {
                return Err(GpuError::NotSupported(
                    "acceleration structures on the implicit backend",
                ))
            }
            (ResourceBinding::None, _) => {}
            (_, ty) => {
                return Err(GpuError::InvalidArgument(format!(
                    "resource does not match binding type {:?}",
                    ty
                )))
            }
        }
        Ok(())
    }
}

impl Resource for D3D11BindingSet {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl BindingSet for D3D11BindingSet {
    fn desc(&self) -> &BindingSetDesc {
        &self.desc
    }

    fn layout(&self) -> &BindingLayoutHandle {
        &self.layout
    }
}

pub(crate) fn d3d11_buffer(handle: &BufferHandle) -> Result<&D3D11Buffer> {
    handle
        .as_any()
        .downcast_ref::<D3D11Buffer>()
        .ok_or(GpuError::NotSupported("buffer from another backend"))
}
