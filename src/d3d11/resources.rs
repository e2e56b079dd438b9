//! Textures, buffers, samplers, shaders and queries for the implicit
//! backend. Views are lazily created and cached on the owning resource.

use crate::d3d11::convert::*;
use crate::d3d11::D3D11Context;
use crate::error::{GpuError, Result};
use crate::format::{format_info, Format};
use crate::traits::*;
use crate::types::*;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;

/// Key of one cached texture view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TextureViewKey {
    pub intent: AccessIntent,
    pub format: Format,
    pub aspect: ViewAspect,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_slice: u32,
    pub slice_count: u32,
    pub read_only: bool,
}

impl TextureViewKey {
    pub(crate) fn new(
        intent: AccessIntent,
        desc: &TextureDesc,
        subresources: TextureSubresourceSet,
        format: Option<Format>,
        aspect: ViewAspect,
    ) -> Self {
        let single_mip = matches!(
            intent,
            AccessIntent::RenderTarget | AccessIntent::DepthStencil | AccessIntent::UnorderedAccess
        );
        let resolved = subresources.resolve(desc, single_mip);
        Self {
            intent,
            format: format.unwrap_or(desc.format),
            aspect,
            base_mip: resolved.base_mip,
            mip_count: resolved.mip_count,
            base_slice: resolved.base_array_slice,
            slice_count: resolved.array_slice_count,
            read_only: false,
        }
    }
}

pub struct D3D11Texture {
    pub(crate) context: Arc<D3D11Context>,
    pub(crate) desc: TextureDesc,
    pub(crate) resource: ID3D11Resource,
    pub(crate) srvs: Mutex<HashMap<TextureViewKey, ID3D11ShaderResourceView>>,
    pub(crate) rtvs: Mutex<HashMap<TextureViewKey, ID3D11RenderTargetView>>,
    pub(crate) dsvs: Mutex<HashMap<TextureViewKey, ID3D11DepthStencilView>>,
    pub(crate) uavs: Mutex<HashMap<TextureViewKey, ID3D11UnorderedAccessView>>,
    /// Subresource index currently mapped through `map_staging_texture`.
    pub(crate) mapped_subresource: Mutex<Option<u32>>,
}

// COM pointers are reference counted and the interfaces used here are free
// threaded; every mutable piece sits behind a Mutex.
unsafe impl Send for D3D11Texture {}
unsafe impl Sync for D3D11Texture {}
unsafe impl Send for D3D11Buffer {}
unsafe impl Sync for D3D11Buffer {}
unsafe impl Send for D3D11Sampler {}
unsafe impl Sync for D3D11Sampler {}
unsafe impl Send for D3D11Shader {}
unsafe impl Sync for D3D11Shader {}
unsafe impl Send for D3D11InputLayout {}
unsafe impl Sync for D3D11InputLayout {}
unsafe impl Send for D3D11EventQuery {}
unsafe impl Sync for D3D11EventQuery {}
unsafe impl Send for D3D11TimerQuery {}
unsafe impl Sync for D3D11TimerQuery {}

impl D3D11Texture {
    pub(crate) fn subresource_index(&self, mip: u32, array_slice: u32) -> u32 {
        array_slice * self.desc.mip_levels + mip
    }

    pub(crate) fn get_srv(&self, key: TextureViewKey) -> Result<ID3D11ShaderResourceView> {
        let mut cache = self.srvs.lock().unwrap();
        if let Some(view) = cache.get(&key) {
            return Ok(view.clone());
        }
        let mut desc = D3D11_SHADER_RESOURCE_VIEW_DESC {
            Format: dxgi_srv_format(key.format, key.aspect),
            ..Default::default()
        };
        match self.desc.dimension {
            TextureDimension::Texture1D => {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURE1D;
                desc.Anonymous.Texture1D = D3D11_TEX1D_SRV {
                    MostDetailedMip: key.base_mip,
                    MipLevels: key.mip_count,
                };
            }
            TextureDimension::Texture1DArray => {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURE1DARRAY;
                desc.Anonymous.Texture1DArray = D3D11_TEX1D_ARRAY_SRV {
                    MostDetailedMip: key.base_mip,
                    MipLevels: key.mip_count,
                    FirstArraySlice: key.base_slice,
                    ArraySize: key.slice_count,
                };
            }
            TextureDimension::Texture2D => {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURE2D;
                desc.Anonymous.Texture2D = D3D11_TEX2D_SRV {
                    MostDetailedMip: key.base_mip,
                    MipLevels: key.mip_count,
                };
            }
            TextureDimension::Texture2DArray => {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURE2DARRAY;
                desc.Anonymous.Texture2DArray = D3D11_TEX2D_ARRAY_SRV {
                    MostDetailedMip: key.base_mip,
                    MipLevels: key.mip_count,
                    FirstArraySlice: key.base_slice,
                    ArraySize: key.slice_count,
                };
            }
            TextureDimension::TextureCube => {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURECUBE;
                desc.Anonymous.TextureCube = D3D11_TEXCUBE_SRV {
                    MostDetailedMip: key.base_mip,
                    MipLevels: key.mip_count,
                };
            }
            TextureDimension::TextureCubeArray => {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURECUBEARRAY;
                desc.Anonymous.TextureCubeArray = D3D11_TEXCUBE_ARRAY_SRV {
                    MostDetailedMip: key.base_mip,
                    MipLevels: key.mip_count,
                    First2DArrayFace: key.base_slice,
                    NumCubes: key.slice_count / 6,
                };
            }
            TextureDimension::Texture2DMS => {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURE2DMS;
            }
            TextureDimension::Texture2DMSArray => {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURE2DMSARRAY;
                desc.Anonymous.Texture2DMSArray = D3D11_TEX2DMS_ARRAY_SRV {
                    FirstArraySlice: key.base_slice,
                    ArraySize: key.slice_count,
                };
            }
            TextureDimension::Texture3D => {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURE3D;
                desc.Anonymous.Texture3D = D3D11_TEX3D_SRV {
                    MostDetailedMip: key.base_mip,
                    MipLevels: key.mip_count,
                };
            }
        }
        let mut view = None;
        unsafe {
            self.context
                .device
                .CreateShaderResourceView(&self.resource, Some(&desc), Some(&mut view))
        }?;
        let view = view.ok_or(GpuError::NotSupported("shader resource view creation"))?;
        cache.insert(key, view.clone());
        Ok(view)
    }

    pub(crate) fn get_rtv(&self, key: TextureViewKey) -> Result<ID3D11RenderTargetView> {
        let mut cache = self.rtvs.lock().unwrap();
        if let Some(view) = cache.get(&key) {
            return Ok(view.clone());
        }
        let mut desc = D3D11_RENDER_TARGET_VIEW_DESC {
            Format: dxgi_format(key.format),
            ..Default::default()
        };
        if self.desc.dimension.is_multisampled() {
            if self.desc.dimension.is_array() {
                desc.ViewDimension = D3D11_RTV_DIMENSION_TEXTURE2DMSARRAY;
                desc.Anonymous.Texture2DMSArray = D3D11_TEX2DMS_ARRAY_RTV {
                    FirstArraySlice: key.base_slice,
                    ArraySize: key.slice_count,
                };
            } else {
                desc.ViewDimension = D3D11_RTV_DIMENSION_TEXTURE2DMS;
            }
        } else if self.desc.dimension == TextureDimension::Texture3D {
            desc.ViewDimension = D3D11_RTV_DIMENSION_TEXTURE3D;
            desc.Anonymous.Texture3D = D3D11_TEX3D_RTV {
                MipSlice: key.base_mip,
                FirstWSlice: 0,
                WSize: u32::MAX,
            };
        } else if self.desc.dimension.is_array() {
            desc.ViewDimension = D3D11_RTV_DIMENSION_TEXTURE2DARRAY;
            desc.Anonymous.Texture2DArray = D3D11_TEX2D_ARRAY_RTV {
                MipSlice: key.base_mip,
                FirstArraySlice: key.base_slice,
                ArraySize: key.slice_count,
            };
        } else {
            desc.ViewDimension = D3D11_RTV_DIMENSION_TEXTURE2D;
            desc.Anonymous.Texture2D = D3D11_TEX2D_RTV {
                MipSlice: key.base_mip,
            };
        }
        let mut view = None;
        unsafe {
            self.context
                .device
                .CreateRenderTargetView(&self.resource, Some(&desc), Some(&mut view))
        }?;
        let view = view.ok_or(GpuError::NotSupported("render target view creation"))?;
        cache.insert(key, view.clone());
        Ok(view)
    }

    pub(crate) fn get_dsv(&self, key: TextureViewKey) -> Result<ID3D11DepthStencilView> {
        let mut cache = self.dsvs.lock().unwrap();
        if let Some(view) = cache.get(&key) {
            return Ok(view.clone());
        }
        let info = format_info(self.desc.format);
        let mut flags = 0;
        if key.read_only {
            flags |= D3D11_DSV_READ_ONLY_DEPTH.0 as u32;
            if info.has_stencil {
                flags |= D3D11_DSV_READ_ONLY_STENCIL.0 as u32;
            }
        }
        let mut desc = D3D11_DEPTH_STENCIL_VIEW_DESC {
            Format: dxgi_format(self.desc.format),
            Flags: flags,
            ..Default::default()
        };
        if self.desc.dimension.is_multisampled() {
            if self.desc.dimension.is_array() {
                desc.ViewDimension = D3D11_DSV_DIMENSION_TEXTURE2DMSARRAY;
                desc.Anonymous.Texture2DMSArray = D3D11_TEX2DMS_ARRAY_DSV {
                    FirstArraySlice: key.base_slice,
                    ArraySize: key.slice_count,
                };
            } else {
                desc.ViewDimension = D3D11_DSV_DIMENSION_TEXTURE2DMS;
            }
        } else if self.desc.dimension.is_array() {
            desc.ViewDimension = D3D11_DSV_DIMENSION_TEXTURE2DARRAY;
            desc.Anonymous.Texture2DArray = D3D11_TEX2D_ARRAY_DSV {
                MipSlice: key.base_mip,
                FirstArraySlice: key.base_slice,
                ArraySize: key.slice_count,
            };
        } else {
            desc.ViewDimension = D3D11_DSV_DIMENSION_TEXTURE2D;
            desc.Anonymous.Texture2D = D3D11_TEX2D_DSV {
                MipSlice: key.base_mip,
            };
        }
        let mut view = None;
        unsafe {
            self.context
                .device
                .CreateDepthStencilView(&self.resource, Some(&desc), Some(&mut view))
        }?;
        let view = view.ok_or(GpuError::NotSupported("depth stencil view creation"))?;
        cache.insert(key, view.clone());
        Ok(view)
    }

    pub(crate) fn get_uav(&self, key: TextureViewKey) -> Result<ID3D11UnorderedAccessView> {
        let mut cache = self.uavs.lock().unwrap();
        if let Some(view) = cache.get(&key) {
            return Ok(view.clone());
        }
        let mut desc = D3D11_UNORDERED_ACCESS_VIEW_DESC {
            Format: dxgi_format(key.format),
            ..Default::default()
        };
        if self.desc.dimension == TextureDimension::Texture3D {
            desc.ViewDimension = D3D11_UAV_DIMENSION_TEXTURE3D;
            desc.Anonymous.Texture3D = D3D11_TEX3D_UAV {
                MipSlice: key.base_mip,
                FirstWSlice: 0,
                WSize: u32::MAX,
            };
        } else if self.desc.dimension.is_array() {
            desc.ViewDimension = D3D11_UAV_DIMENSION_TEXTURE2DARRAY;
            desc.Anonymous.Texture2DArray = D3D11_TEX2D_ARRAY_UAV {
                MipSlice: key.base_mip,
                FirstArraySlice: key.base_slice,
                ArraySize: key.slice_count,
            };
        } else {
            desc.ViewDimension = D3D11_UAV_DIMENSION_TEXTURE2D;
            desc.Anonymous.Texture2D = D3D11_TEX2D_UAV {
                MipSlice: key.base_mip,
            };
        }
        let mut view = None;
        unsafe {
            self.context
                .device
                .CreateUnorderedAccessView(&self.resource, Some(&desc), Some(&mut view))
        }?;
        let view = view.ok_or(GpuError::NotSupported("unordered access view creation"))?;
        cache.insert(key, view.clone());
        Ok(view)
    }
}

impl Resource for D3D11Texture {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Texture for D3D11Texture {
    fn desc(&self) -> &TextureDesc {
        &self.desc
    }
}

/// Key of one cached typed or structured buffer view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BufferViewKey {
    pub format: Format,
    pub byte_offset: u64,
    pub byte_size: u64,
    pub raw: bool,
}

pub struct D3D11Buffer {
    pub(crate) context: Arc<D3D11Context>,
    pub(crate) desc: BufferDesc,
    pub(crate) buffer: ID3D11Buffer,
    pub(crate) srvs: Mutex<HashMap<BufferViewKey, ID3D11ShaderResourceView>>,
    pub(crate) uavs: Mutex<HashMap<BufferViewKey, ID3D11UnorderedAccessView>>,
}

impl D3D11Buffer {
    fn view_measure(&self, key: &BufferViewKey) -> (u32, u32, DXGI_FORMAT) {
        // Typed views count elements of the view format, structured views
        // count structs, raw views count 32-bit words.
        if key.raw {
            let first = (key.byte_offset / 4) as u32;
            let count = (key.byte_size / 4) as u32;
            (first, count, DXGI_FORMAT_R32_TYPELESS)
        } else if self.desc.struct_stride > 0 {
            let stride = self.desc.struct_stride as u64;
            (
                (key.byte_offset / stride) as u32,
                (key.byte_size / stride) as u32,
                DXGI_FORMAT_UNKNOWN,
            )
        } else {
            let element = format_info(key.format).bytes_per_block.max(1) as u64;
            (
                (key.byte_offset / element) as u32,
                (key.byte_size / element) as u32,
                dxgi_format(key.format),
            )
        }
    }

    pub(crate) fn get_srv(&self, key: BufferViewKey) -> Result<ID3D11ShaderResourceView> {
        let mut cache = self.srvs.lock().unwrap();
        if let Some(view) = cache.get(&key) {
            return Ok(view.clone());
        }
        let (first, count, format) = self.view_measure(&key);
        let desc = D3D11_SHADER_RESOURCE_VIEW_DESC {
            Format: format,
            ViewDimension: D3D11_SRV_DIMENSION_BUFFEREX,
            Anonymous: D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                BufferEx: D3D11_BUFFEREX_SRV {
                    FirstElement: first,
                    NumElements: count,
                    Flags: if key.raw { D3D11_BUFFEREX_SRV_FLAG_RAW.0 as u32 } else { 0 },
                },
            },
        };
        let mut view = None;
        unsafe {
            self.context
                .device
                .CreateShaderResourceView(&self.buffer, Some(&desc), Some(&mut view))
        }?;
        let view = view.ok_or(GpuError::NotSupported("buffer shader resource view"))?;
        cache.insert(key, view.clone());
        Ok(view)
    }

    pub(crate) fn get_uav(&self, key: BufferViewKey) -> Result<ID3D11UnorderedAccessView> {
        let mut cache = self.uavs.lock().unwrap();
        if let Some(view) = cache.get(&key) {
            return Ok(view.clone());
        }
        let (first, count, format) = self.view_measure(&key);
        let desc = D3D11_UNORDERED_ACCESS_VIEW_DESC {
            Format: format,
            ViewDimension: D3D11_UAV_DIMENSION_BUFFER,
            Anonymous: D3D11_UNORDERED_ACCESS_VIEW_DESC_0 {
                Buffer: D3D11_BUFFER_UAV {
                    FirstElement: first,
                    NumElements: count,
                    Flags: if key.raw { D3D11_BUFFER_UAV_FLAG_RAW.0 as u32 } else { 0 },
                },
            },
        };
        let mut view = None;
        unsafe {
            self.context
                .device
                .CreateUnorderedAccessView(&self.buffer, Some(&desc), Some(&mut view))
        }?;
        let view = view.ok_or(GpuError::NotSupported("buffer unordered access view"))?;
        cache.insert(key, view.clone());
        Ok(view)
    }
}

impl Resource for D3D11Buffer {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Buffer for D3D11Buffer {
    fn desc(&self) -> &BufferDesc {
        &self.desc
    }
}

pub struct D3D11Sampler {
    pub(crate) desc: SamplerDesc,
    pub(crate) sampler: ID3D11SamplerState,
}

impl Resource for D3D11Sampler {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Sampler for D3D11Sampler {
    fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

/// Compiled shader object for one stage. The implicit API has one interface
/// per stage rather than a generic module.
#[derive(Clone)]
pub(crate) enum ShaderObject {
    Vertex(ID3D11VertexShader),
    Hull(ID3D11HullShader),
    Domain(ID3D11DomainShader),
    Geometry(ID3D11GeometryShader),
    Pixel(ID3D11PixelShader),
    Compute(ID3D11ComputeShader),
}

pub struct D3D11Shader {
    pub(crate) desc: ShaderDesc,
    /// Retained so input layouts can be validated against the vertex
    /// signature, and for the bytecode round-trip contract.
    pub(crate) bytecode: Vec<u8>,
    pub(crate) object: ShaderObject,
}

impl D3D11Shader {
    pub(crate) fn create(
        context: &D3D11Context,
        desc: ShaderDesc,
        bytecode: &[u8],
    ) -> Result<Self> {
        let device = &context.device;
        let object = unsafe {
            match desc.stage {
                ShaderStage::Vertex => {
                    let mut shader = None;
                    device.CreateVertexShader(bytecode, None, Some(&mut shader))?;
                    ShaderObject::Vertex(
                        shader.ok_or(GpuError::NotSupported("vertex shader creation"))?,
                    )
                }
                ShaderStage::Hull => {
                    let mut shader = None;
                    device.CreateHullShader(bytecode, None, Some(&mut shader))?;
                    ShaderObject::Hull(
                        shader.ok_or(GpuError::NotSupported("hull shader creation"))?,
                    )
                }
                ShaderStage::Domain => {
                    let mut shader = None;
                    device.CreateDomainShader(bytecode, None, Some(&mut shader))?;
                    ShaderObject::Domain(
                        shader.ok_or(GpuError::NotSupported("domain shader creation"))?,
                    )
                }
                ShaderStage::Geometry => {
                    let mut shader = None;
                    device.CreateGeometryShader(bytecode, None, Some(&mut shader))?;
                    ShaderObject::Geometry(
                        shader.ok_or(GpuError::NotSupported("geometry shader creation"))?,
                    )
                }
                ShaderStage::Pixel => {
                    let mut shader = None;
                    device.CreatePixelShader(bytecode, None, Some(&mut shader))?;
                    ShaderObject::Pixel(
                        shader.ok_or(GpuError::NotSupported("pixel shader creation"))?,
                    )
                }
                ShaderStage::Compute => {
                    let mut shader = None;
                    device.CreateComputeShader(bytecode, None, Some(&mut shader))?;
                    ShaderObject::Compute(
                        shader.ok_or(GpuError::NotSupported("compute shader creation"))?,
                    )
                }
                _ => {
                    return Err(GpuError::NotSupported(
                        "shader stage on the implicit backend",
                    ))
                }
            }
        };
        Ok(Self {
            desc,
            bytecode: bytecode.to_vec(),
            object,
        })
    }
}

impl Resource for D3D11Shader {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Shader for D3D11Shader {
    fn desc(&self) -> &ShaderDesc {
        &self.desc
    }

    fn bytecode(&self) -> Option<&[u8]> {
        Some(&self.bytecode)
    }
}

pub struct D3D11InputLayout {
    pub(crate) attributes: Vec<VertexAttributeDesc>,
    /// Stride per vertex-buffer slot, derived from the attributes.
    pub(crate) strides: HashMap<u32, u32>,
    /// The backend object needs a vertex signature; it is created on first
    /// use with a graphics pipeline and reused afterwards.
    pub(crate) layout: Mutex<Option<ID3D11InputLayout>>,
}

impl D3D11InputLayout {
    pub(crate) fn create(attributes: &[VertexAttributeDesc]) -> Result<Self> {
        let mut strides = HashMap::new();
        for attribute in attributes {
            if attribute.format == Format::Unknown {
                return Err(GpuError::InvalidArgument(format!(
                    "vertex attribute '{}' has no format",
                    attribute.name
                )));
            }
            let stride = if attribute.element_stride > 0 {
                attribute.element_stride
            } else {
                attribute.offset + attribute.format.bytes_per_block() * attribute.array_size
            };
            let entry = strides.entry(attribute.buffer_index).or_insert(0);
            *entry = (*entry).max(stride);
        }
        Ok(Self {
            attributes: attributes.to_vec(),
            strides,
            layout: Mutex::new(None),
        })
    }
}

impl Resource for D3D11InputLayout {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl InputLayout for D3D11InputLayout {
    fn attributes(&self) -> &[VertexAttributeDesc] {
        &self.attributes
    }
}

pub struct D3D11EventQuery {
    pub(crate) query: ID3D11Query,
    /// Set when the query has been ended on the context.
    pub(crate) armed: Mutex<bool>,
}

impl Resource for D3D11EventQuery {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl EventQuery for D3D11EventQuery {}

#[derive(Default)]
pub(crate) struct TimerQueryState {
    pub started: bool,
    pub resolved: bool,
    pub time_seconds: f32,
}

pub struct D3D11TimerQuery {
    pub(crate) disjoint: ID3D11Query,
    pub(crate) start: ID3D11Query,
    pub(crate) end: ID3D11Query,
    pub(crate) state: Mutex<TimerQueryState>,
}

impl Resource for D3D11TimerQuery {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TimerQuery for D3D11TimerQuery {}
