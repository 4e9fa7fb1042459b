//! Plain-data model of the Direct3D 12 structures the analysis consumes.
//!
//! Only the fields that carry object identities, GPU virtual addresses or descriptor handles are
//! modelled; everything else a real API call carries is irrelevant to subcapture bookkeeping.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::key::ObjectKey;

bitflags! {
    /// `D3D12_RESOURCE_FLAGS`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ResourceFlags: u32 {
        const ALLOW_RENDER_TARGET = 0x1;
        const ALLOW_DEPTH_STENCIL = 0x2;
        const ALLOW_UNORDERED_ACCESS = 0x4;
        const DENY_SHADER_RESOURCE = 0x8;
        const ALLOW_CROSS_ADAPTER = 0x10;
        const ALLOW_SIMULTANEOUS_ACCESS = 0x20;
        const VIDEO_DECODE_REFERENCE_ONLY = 0x40;
        const VIDEO_ENCODE_REFERENCE_ONLY = 0x80;
        const RAYTRACING_ACCELERATION_STRUCTURE = 0x100;
    }
}

/// `D3D12_DESCRIPTOR_RANGE_OFFSET_APPEND`.
pub const DESCRIPTOR_RANGE_OFFSET_APPEND: u32 = 0xffff_ffff;

/// `NumDescriptors` value of an unbounded descriptor range.
pub const UNBOUNDED_DESCRIPTOR_RANGE: u32 = u32::MAX;

/// `D3D12_SHADER_IDENTIFIER_SIZE_IN_BYTES`.
pub const SHADER_IDENTIFIER_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

impl DescriptorHeapKind {
    /// Whether descriptors of this heap can be referenced from root descriptor tables.
    pub fn is_shader_visible_kind(self) -> bool {
        matches!(self, Self::CbvSrvUav | Self::Sampler)
    }
}

/// Pipeline a root argument is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindPoint {
    Compute,
    Graphics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorRangeKind {
    Srv,
    Uav,
    Cbv,
    Sampler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorRange {
    pub kind: DescriptorRangeKind,
    pub num_descriptors: u32,
    pub base_shader_register: u32,
    pub register_space: u32,
    pub offset_in_descriptors_from_table_start: u32,
}

impl DescriptorRange {
    pub fn is_unbounded(&self) -> bool {
        self.num_descriptors == UNBOUNDED_DESCRIPTOR_RANGE
    }
}

/// Kind of a root descriptor (a GPU virtual address bound directly in the root signature).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RootViewKind {
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootParameter {
    DescriptorTable { ranges: Vec<DescriptorRange> },
    Constants { num_32bit_values: u32 },
    View { kind: RootViewKind },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSignatureDesc {
    pub parameters: Vec<RootParameter>,
}

/// View description passed to `Create*View` / `CreateSampler`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewDesc {
    ConstantBuffer {
        buffer_location: u64,
        size: u32,
    },
    ShaderResource {
        resource: Option<ObjectKey>,
    },
    /// SRV with `D3D12_SRV_DIMENSION_RAYTRACING_ACCELERATION_STRUCTURE`; the resource is null and
    /// the structure is addressed by GPU virtual address.
    AccelerationStructure {
        location: u64,
    },
    UnorderedAccess {
        resource: Option<ObjectKey>,
        counter_resource: Option<ObjectKey>,
    },
    RenderTarget {
        resource: Option<ObjectKey>,
    },
    DepthStencil {
        resource: Option<ObjectKey>,
    },
    Sampler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBufferView {
    pub buffer_location: u64,
    pub size_in_bytes: u32,
    pub format: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexBufferView {
    pub buffer_location: u64,
    pub size_in_bytes: u32,
    pub stride_in_bytes: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceBarrier {
    Transition {
        resource: ObjectKey,
    },
    Aliasing {
        before: Option<ObjectKey>,
        after: Option<ObjectKey>,
    },
    UnorderedAccess {
        resource: Option<ObjectKey>,
    },
}

impl ResourceBarrier {
    pub fn resources(&self) -> impl Iterator<Item = ObjectKey> {
        let (a, b) = match *self {
            Self::Transition { resource } => (Some(resource), None),
            Self::Aliasing { before, after } => (before, after),
            Self::UnorderedAccess { resource } => (resource, None),
        };
        a.into_iter().chain(b)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuAddressRange {
    pub start_address: u64,
    pub size_in_bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuAddressRangeAndStride {
    pub start_address: u64,
    pub size_in_bytes: u64,
    pub stride_in_bytes: u64,
}

/// `D3D12_DISPATCH_RAYS_DESC`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRaysDesc {
    pub ray_generation_shader_record: GpuAddressRange,
    pub miss_shader_table: GpuAddressRangeAndStride,
    pub hit_group_table: GpuAddressRangeAndStride,
    pub callable_shader_table: GpuAddressRangeAndStride,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl DispatchRaysDesc {
    /// Size of the native structure, including its trailing padding.
    pub const SIZE_BYTES: usize = 104;

    /// Decode the native little-endian layout. Returns `None` if `bytes` is too short.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE_BYTES {
            return None;
        }
        let u64_at = |offset: usize| read_u64_le(bytes, offset);
        let u32_at = |offset: usize| read_u32_le(bytes, offset);
        let range_and_stride = |offset: usize| -> Option<GpuAddressRangeAndStride> {
            Some(GpuAddressRangeAndStride {
                start_address: u64_at(offset)?,
                size_in_bytes: u64_at(offset + 8)?,
                stride_in_bytes: u64_at(offset + 16)?,
            })
        };
        Some(Self {
            ray_generation_shader_record: GpuAddressRange {
                start_address: u64_at(0)?,
                size_in_bytes: u64_at(8)?,
            },
            miss_shader_table: range_and_stride(16)?,
            hit_group_table: range_and_stride(40)?,
            callable_shader_table: range_and_stride(64)?,
            width: u32_at(88)?,
            height: u32_at(92)?,
            depth: u32_at(96)?,
        })
    }

    /// The four shader-binding-table ranges as `(start, size, stride)` triples.
    ///
    /// The ray generation record has no stride; its size is reported as the stride so it is
    /// treated as a single record.
    pub fn shader_tables(&self) -> [GpuAddressRangeAndStride; 4] {
        [
            GpuAddressRangeAndStride {
                start_address: self.ray_generation_shader_record.start_address,
                size_in_bytes: self.ray_generation_shader_record.size_in_bytes,
                stride_in_bytes: self.ray_generation_shader_record.size_in_bytes,
            },
            self.miss_shader_table,
            self.hit_group_table,
            self.callable_shader_table,
        ]
    }
}

/// `D3D12_ELEMENTS_LAYOUT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementsLayout {
    Array,
    ArrayOfPointers,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeometryDesc {
    Triangles {
        transform: u64,
        index_buffer: u64,
        vertex_buffer: u64,
    },
    ProceduralAabbs {
        aabbs: u64,
    },
}

impl GeometryDesc {
    pub fn addresses(&self) -> impl Iterator<Item = u64> {
        let list = match *self {
            Self::Triangles {
                transform,
                index_buffer,
                vertex_buffer,
            } => [transform, index_buffer, vertex_buffer],
            Self::ProceduralAabbs { aabbs } => [aabbs, 0, 0],
        };
        list.into_iter().filter(|&address| address != 0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccelerationStructureInputs {
    TopLevel {
        instance_descs: u64,
        num_descs: u32,
        layout: ElementsLayout,
    },
    BottomLevel {
        geometries: Vec<GeometryDesc>,
    },
}

/// `D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_DESC`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildAccelerationStructureDesc {
    pub dest_acceleration_structure_data: u64,
    /// Non-zero only for `PERFORM_UPDATE` builds.
    #[serde(default)]
    pub source_acceleration_structure_data: u64,
    pub scratch_acceleration_structure_data: u64,
    pub inputs: AccelerationStructureInputs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccelerationStructureCopyMode {
    Clone,
    Compact,
    VisualizationDecodeForTools,
    Serialize,
    Deserialize,
}

/// `D3D12_RAYTRACING_INSTANCE_DESC`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RaytracingInstanceDesc {
    pub transform: [f32; 12],
    pub instance_id_and_mask: u32,
    pub contribution_and_flags: u32,
    pub acceleration_structure: u64,
}

impl RaytracingInstanceDesc {
    pub const SIZE_BYTES: usize = core::mem::size_of::<Self>();

    /// Decode one instance from `bytes`. `bytes` does not need to be aligned.
    pub fn read(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::SIZE_BYTES)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }
}

/// `D3D12_INDIRECT_ARGUMENT_DESC`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndirectArgument {
    Draw,
    DrawIndexed,
    Dispatch,
    VertexBufferView {
        slot: u32,
    },
    IndexBufferView,
    Constant {
        root_parameter_index: u32,
        dest_offset_in_32bit_values: u32,
        num_32bit_values: u32,
    },
    ConstantBufferView {
        root_parameter_index: u32,
    },
    ShaderResourceView {
        root_parameter_index: u32,
    },
    UnorderedAccessView {
        root_parameter_index: u32,
    },
    DispatchRays,
    DispatchMesh,
}

impl IndirectArgument {
    /// Bytes this argument occupies inside one indirect command record.
    pub fn size_bytes(&self) -> u64 {
        match *self {
            Self::Draw => 16,
            Self::DrawIndexed => 20,
            Self::Dispatch | Self::DispatchMesh => 12,
            Self::VertexBufferView { .. } | Self::IndexBufferView => 16,
            Self::Constant {
                num_32bit_values, ..
            } => 4 * u64::from(num_32bit_values),
            Self::ConstantBufferView { .. }
            | Self::ShaderResourceView { .. }
            | Self::UnorderedAccessView { .. } => 8,
            Self::DispatchRays => DispatchRaysDesc::SIZE_BYTES as u64,
        }
    }

    /// Whether the argument embeds GPU virtual addresses that must be resolved to objects.
    pub fn references_resources(&self) -> bool {
        matches!(
            self,
            Self::VertexBufferView { .. }
                | Self::IndexBufferView
                | Self::ConstantBufferView { .. }
                | Self::ShaderResourceView { .. }
                | Self::UnorderedAccessView { .. }
                | Self::DispatchRays
        )
    }
}

/// `D3D12_COMMAND_SIGNATURE_DESC`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSignatureDesc {
    pub byte_stride: u32,
    pub arguments: Vec<IndirectArgument>,
}

pub(crate) fn read_u64_le(bytes: &[u8], offset: usize) -> Option<u64> {
    let end = offset.checked_add(8)?;
    let chunk: [u8; 8] = bytes.get(offset..end)?.try_into().ok()?;
    Some(u64::from_le_bytes(chunk))
}

pub(crate) fn read_u32_le(bytes: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let chunk: [u8; 4] = bytes.get(offset..end)?.try_into().ok()?;
    Some(u32::from_le_bytes(chunk))
}
