//! The recorded API calls the analysis consumes.
//!
//! Every call is a variant of one closed [`Command`] enum; consumers dispatch with a single
//! `match`. Object identities are [`ObjectKey`]s, GPU addresses and descriptor handles are the
//! raw capture-time values. Fields prefixed with `player_` carry what the replaying device
//! returned for the same call and are only present in traces recorded during replay.

use serde::{Deserialize, Serialize};

use crate::d3d12::{
    AccelerationStructureCopyMode, BindPoint, BuildAccelerationStructureDesc,
    CommandSignatureDesc, DescriptorHeapKind, DispatchRaysDesc, IndexBufferView, ResourceBarrier,
    ResourceFlags, RootSignatureDesc, RootViewKind, VertexBufferView, ViewDesc,
};
use crate::key::{CommandKey, ObjectKey};
use crate::shader_identifier::ShaderIdentifier;

/// One command of the capture stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub key: CommandKey,
    #[serde(flatten)]
    pub command: Command,
}

impl CommandRecord {
    pub fn new(key: u64, command: Command) -> Self {
        Self {
            key: CommandKey(key),
            command,
        }
    }
}

/// A `(start handle, count)` run of descriptors passed to `CopyDescriptors`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorHandleRun {
    pub start: u64,
    pub count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    // Device and object lifetime.
    CreateHeap {
        heap: ObjectKey,
        size: u64,
    },
    CreateCommittedResource {
        resource: ObjectKey,
        size: u64,
        #[serde(default)]
        flags: ResourceFlags,
    },
    CreatePlacedResource {
        resource: ObjectKey,
        heap: ObjectKey,
        heap_offset: u64,
        size: u64,
        #[serde(default)]
        flags: ResourceFlags,
    },
    GetGpuVirtualAddress {
        resource: ObjectKey,
        address: u64,
        #[serde(default)]
        player_address: Option<u64>,
    },
    CreateDescriptorHeap {
        heap: ObjectKey,
        kind: DescriptorHeapKind,
        num_descriptors: u32,
        /// `GetDescriptorHandleIncrementSize` for `kind` on the capturing device.
        increment: u32,
        #[serde(default)]
        player_increment: Option<u32>,
    },
    GetCpuDescriptorHandleForHeapStart {
        heap: ObjectKey,
        handle: u64,
        #[serde(default)]
        player_handle: Option<u64>,
    },
    GetGpuDescriptorHandleForHeapStart {
        heap: ObjectKey,
        handle: u64,
        #[serde(default)]
        player_handle: Option<u64>,
    },
    /// Any of `CreateConstantBufferView`, `Create{Shader,Unordered}ResourceView`,
    /// `Create{RenderTarget,DepthStencil}View` and `CreateSampler`.
    CreateView {
        dest: u64,
        desc: ViewDesc,
    },
    CopyDescriptors {
        dest_ranges: Vec<DescriptorHandleRun>,
        src_ranges: Vec<DescriptorHandleRun>,
    },
    CopyDescriptorsSimple {
        num_descriptors: u32,
        dest: u64,
        src: u64,
    },
    CreateRootSignature {
        root_signature: ObjectKey,
        desc: RootSignatureDesc,
    },
    /// `Create{Graphics,Compute}PipelineState` and `CreatePipelineState`.
    CreatePipelineState {
        pipeline: ObjectKey,
        #[serde(default)]
        root_signature: Option<ObjectKey>,
    },
    CreateStateObject {
        state_object: ObjectKey,
        /// Root signatures and existing collections referenced by the subobjects.
        #[serde(default)]
        subobjects: Vec<ObjectKey>,
    },
    AddToStateObject {
        state_object: ObjectKey,
        parent: ObjectKey,
        #[serde(default)]
        subobjects: Vec<ObjectKey>,
    },
    GetShaderIdentifier {
        state_object: ObjectKey,
        export_name: String,
        identifier: ShaderIdentifier,
        #[serde(default)]
        player_identifier: Option<ShaderIdentifier>,
    },
    CreateCommandSignature {
        signature: ObjectKey,
        #[serde(default)]
        root_signature: Option<ObjectKey>,
        desc: CommandSignatureDesc,
    },
    CreateCommandAllocator {
        allocator: ObjectKey,
    },
    CreateCommandList {
        list: ObjectKey,
        allocator: ObjectKey,
    },
    CreateCommandQueue {
        queue: ObjectKey,
    },
    CreateFence {
        fence: ObjectKey,
        #[serde(default)]
        initial_value: u64,
    },
    /// Final `Release` of an object.
    Release {
        object: ObjectKey,
    },
    /// CPU write into mapped resource memory.
    WriteResourceMemory {
        resource: ObjectKey,
        offset: u64,
        data: Vec<u8>,
    },

    // Command list recording.
    Reset {
        list: ObjectKey,
        allocator: ObjectKey,
        #[serde(default)]
        initial_state: Option<ObjectKey>,
    },
    Close {
        list: ObjectKey,
    },
    SetDescriptorHeaps {
        list: ObjectKey,
        heaps: Vec<ObjectKey>,
    },
    SetRootSignature {
        list: ObjectKey,
        bind_point: BindPoint,
        root_signature: ObjectKey,
    },
    SetRootDescriptorTable {
        list: ObjectKey,
        bind_point: BindPoint,
        parameter_index: u32,
        base_descriptor: u64,
    },
    /// `Set{Compute,Graphics}Root{ConstantBuffer,ShaderResource,UnorderedAccess}View`.
    SetRootView {
        list: ObjectKey,
        bind_point: BindPoint,
        parameter_index: u32,
        kind: RootViewKind,
        address: u64,
    },
    IaSetIndexBuffer {
        list: ObjectKey,
        #[serde(default)]
        view: Option<IndexBufferView>,
    },
    IaSetVertexBuffers {
        list: ObjectKey,
        start_slot: u32,
        views: Vec<VertexBufferView>,
    },
    OmSetRenderTargets {
        list: ObjectKey,
        render_targets: Vec<u64>,
        #[serde(default)]
        depth_stencil: Option<u64>,
    },
    ClearRenderTargetView {
        list: ObjectKey,
        view: u64,
    },
    ClearDepthStencilView {
        list: ObjectKey,
        view: u64,
    },
    /// `ClearUnorderedAccessView{Uint,Float}`.
    ClearUnorderedAccessView {
        list: ObjectKey,
        view_gpu: u64,
        view_cpu: u64,
        resource: ObjectKey,
    },
    SetPipelineState {
        list: ObjectKey,
        pipeline: ObjectKey,
    },
    SetPipelineState1 {
        list: ObjectKey,
        state_object: ObjectKey,
    },
    ResourceBarrier {
        list: ObjectKey,
        barriers: Vec<ResourceBarrier>,
    },
    CopyBufferRegion {
        list: ObjectKey,
        dest: ObjectKey,
        src: ObjectKey,
    },
    CopyResource {
        list: ObjectKey,
        dest: ObjectKey,
        src: ObjectKey,
    },
    CopyTextureRegion {
        list: ObjectKey,
        dest: ObjectKey,
        src: ObjectKey,
    },
    ResolveSubresource {
        list: ObjectKey,
        dest: ObjectKey,
        src: ObjectKey,
    },
    DiscardResource {
        list: ObjectKey,
        resource: ObjectKey,
    },
    WriteBufferImmediate {
        list: ObjectKey,
        addresses: Vec<u64>,
    },
    BuildRaytracingAccelerationStructure {
        list: ObjectKey,
        desc: BuildAccelerationStructureDesc,
    },
    CopyRaytracingAccelerationStructure {
        list: ObjectKey,
        dest: u64,
        source: u64,
        mode: AccelerationStructureCopyMode,
    },
    DispatchRays {
        list: ObjectKey,
        desc: DispatchRaysDesc,
    },
    ExecuteIndirect {
        list: ObjectKey,
        signature: ObjectKey,
        max_command_count: u32,
        argument_buffer: ObjectKey,
        argument_buffer_offset: u64,
        #[serde(default)]
        count_buffer: Option<ObjectKey>,
        #[serde(default)]
        count_buffer_offset: u64,
    },
    InitializeMetaCommand {
        list: ObjectKey,
        meta_command: ObjectKey,
        #[serde(default)]
        resources: Vec<ObjectKey>,
    },
    ExecuteMetaCommand {
        list: ObjectKey,
        meta_command: ObjectKey,
        #[serde(default)]
        resources: Vec<ObjectKey>,
    },

    // Queues and synchronization.
    ExecuteCommandLists {
        queue: ObjectKey,
        lists: Vec<ObjectKey>,
    },
    QueueSignal {
        queue: ObjectKey,
        fence: ObjectKey,
        value: u64,
    },
    QueueWait {
        queue: ObjectKey,
        fence: ObjectKey,
        value: u64,
    },
    /// `ID3D12Fence::Signal` from the CPU.
    FenceSignal {
        fence: ObjectKey,
        value: u64,
    },
    Present {
        swap_chain: ObjectKey,
    },
}

impl Command {
    /// The command list a recording command is recorded into.
    pub fn command_list(&self) -> Option<ObjectKey> {
        use Command::*;
        match *self {
            Reset { list, .. }
            | Close { list }
            | SetDescriptorHeaps { list, .. }
            | SetRootSignature { list, .. }
            | SetRootDescriptorTable { list, .. }
            | SetRootView { list, .. }
            | IaSetIndexBuffer { list, .. }
            | IaSetVertexBuffers { list, .. }
            | OmSetRenderTargets { list, .. }
            | ClearRenderTargetView { list, .. }
            | ClearDepthStencilView { list, .. }
            | ClearUnorderedAccessView { list, .. }
            | SetPipelineState { list, .. }
            | SetPipelineState1 { list, .. }
            | ResourceBarrier { list, .. }
            | CopyBufferRegion { list, .. }
            | CopyResource { list, .. }
            | CopyTextureRegion { list, .. }
            | ResolveSubresource { list, .. }
            | DiscardResource { list, .. }
            | WriteBufferImmediate { list, .. }
            | BuildRaytracingAccelerationStructure { list, .. }
            | CopyRaytracingAccelerationStructure { list, .. }
            | DispatchRays { list, .. }
            | ExecuteIndirect { list, .. }
            | InitializeMetaCommand { list, .. }
            | ExecuteMetaCommand { list, .. } => Some(list),
            _ => None,
        }
    }

    pub fn is_queue_command(&self) -> bool {
        matches!(
            self,
            Self::ExecuteCommandLists { .. } | Self::QueueSignal { .. } | Self::QueueWait { .. }
        )
    }

    /// API-level name, used for summaries and log fields.
    pub fn name(&self) -> &'static str {
        use Command::*;
        match self {
            CreateHeap { .. } => "CreateHeap",
            CreateCommittedResource { .. } => "CreateCommittedResource",
            CreatePlacedResource { .. } => "CreatePlacedResource",
            GetGpuVirtualAddress { .. } => "GetGPUVirtualAddress",
            CreateDescriptorHeap { .. } => "CreateDescriptorHeap",
            GetCpuDescriptorHandleForHeapStart { .. } => "GetCPUDescriptorHandleForHeapStart",
            GetGpuDescriptorHandleForHeapStart { .. } => "GetGPUDescriptorHandleForHeapStart",
            CreateView { .. } => "CreateView",
            CopyDescriptors { .. } => "CopyDescriptors",
            CopyDescriptorsSimple { .. } => "CopyDescriptorsSimple",
            CreateRootSignature { .. } => "CreateRootSignature",
            CreatePipelineState { .. } => "CreatePipelineState",
            CreateStateObject { .. } => "CreateStateObject",
            AddToStateObject { .. } => "AddToStateObject",
            GetShaderIdentifier { .. } => "GetShaderIdentifier",
            CreateCommandSignature { .. } => "CreateCommandSignature",
            CreateCommandAllocator { .. } => "CreateCommandAllocator",
            CreateCommandList { .. } => "CreateCommandList",
            CreateCommandQueue { .. } => "CreateCommandQueue",
            CreateFence { .. } => "CreateFence",
            Release { .. } => "Release",
            WriteResourceMemory { .. } => "WriteResourceMemory",
            Reset { .. } => "Reset",
            Close { .. } => "Close",
            SetDescriptorHeaps { .. } => "SetDescriptorHeaps",
            SetRootSignature { .. } => "SetRootSignature",
            SetRootDescriptorTable { .. } => "SetRootDescriptorTable",
            SetRootView { .. } => "SetRootView",
            IaSetIndexBuffer { .. } => "IASetIndexBuffer",
            IaSetVertexBuffers { .. } => "IASetVertexBuffers",
            OmSetRenderTargets { .. } => "OMSetRenderTargets",
            ClearRenderTargetView { .. } => "ClearRenderTargetView",
            ClearDepthStencilView { .. } => "ClearDepthStencilView",
            ClearUnorderedAccessView { .. } => "ClearUnorderedAccessView",
            SetPipelineState { .. } => "SetPipelineState",
            SetPipelineState1 { .. } => "SetPipelineState1",
            ResourceBarrier { .. } => "ResourceBarrier",
            CopyBufferRegion { .. } => "CopyBufferRegion",
            CopyResource { .. } => "CopyResource",
            CopyTextureRegion { .. } => "CopyTextureRegion",
            ResolveSubresource { .. } => "ResolveSubresource",
            DiscardResource { .. } => "DiscardResource",
            WriteBufferImmediate { .. } => "WriteBufferImmediate",
            BuildRaytracingAccelerationStructure { .. } => "BuildRaytracingAccelerationStructure",
            CopyRaytracingAccelerationStructure { .. } => "CopyRaytracingAccelerationStructure",
            DispatchRays { .. } => "DispatchRays",
            ExecuteIndirect { .. } => "ExecuteIndirect",
            InitializeMetaCommand { .. } => "InitializeMetaCommand",
            ExecuteMetaCommand { .. } => "ExecuteMetaCommand",
            ExecuteCommandLists { .. } => "ExecuteCommandLists",
            QueueSignal { .. } => "Signal",
            QueueWait { .. } => "Wait",
            FenceSignal { .. } => "ID3D12Fence::Signal",
            Present { .. } => "Present",
        }
    }
}
