//! Per-command extraction of everything a recorded command list depends on.

use std::collections::HashMap;

use tracing::warn;

use crate::address::{DescriptorHandleService, GpuAddressService, HandleKind};
use crate::command::{Command, CommandRecord};
use crate::d3d12::{AccelerationStructureInputs, BindPoint, DescriptorHeapKind, RootViewKind};
use crate::descriptor_state::DescriptorService;
use crate::error::AnalysisError;
use crate::execute_indirect::{ExecuteIndirectService, IndirectCall};
use crate::key::{AsLocation, CommandKey, DescriptorSlot, ObjectKey};
use crate::raytracing::RaytracingDependencyService;
use crate::readback::ReadbackQueue;
use crate::restore_set::RestoreSet;
use crate::root_signature::RootSignatureService;

/// State a command list carries between recording commands. Cleared by `Reset`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandListInfo {
    pub compute_root_signature: Option<ObjectKey>,
    pub graphics_root_signature: Option<ObjectKey>,
    pub view_descriptor_heap: Option<ObjectKey>,
    pub sampler_descriptor_heap: Option<ObjectKey>,
}

impl CommandListInfo {
    pub fn root_signature(&self, bind_point: BindPoint) -> Option<ObjectKey> {
        match bind_point {
            BindPoint::Compute => self.compute_root_signature,
            BindPoint::Graphics => self.graphics_root_signature,
        }
    }
}

/// The session services a handler reads from and records into.
pub struct AnalysisContext<'a> {
    pub addresses: &'a GpuAddressService,
    pub handles: &'a DescriptorHandleService,
    pub descriptors: &'a DescriptorService,
    pub root_signatures: &'a mut RootSignatureService,
    pub raytracing: &'a mut RaytracingDependencyService,
    pub execute_indirect: &'a mut ExecuteIndirectService,
    pub readbacks: &'a mut ReadbackQueue,
    pub restore: &'a mut RestoreSet,
}

impl AnalysisContext<'_> {
    fn add_address(&mut self, address: u64) -> Option<(ObjectKey, u64)> {
        if address == 0 {
            return None;
        }
        let resolved = self.addresses.resolve(address)?;
        self.restore.add_object(resolved.0);
        Some(resolved)
    }

    /// Add a resource referenced by GPU address; a top-level acceleration structure also pulls
    /// in the build that produced it.
    fn add_shader_resource_address(&mut self, address: u64) {
        let Some((resource, offset)) = self.add_address(address) else {
            return;
        };
        if let Some(build) = self
            .raytracing
            .tlas_build_at(AsLocation::new(resource, offset))
        {
            self.restore.add_tlas(build);
        }
    }

    pub(crate) fn add_descriptor(&mut self, slot: DescriptorSlot) {
        let Some(state) = self.descriptors.get(slot).copied() else {
            warn!(
                heap = %slot.heap,
                index = slot.index,
                "descriptor state not found; skipped"
            );
            return;
        };
        self.restore.add_descriptor(slot);
        self.restore.add_object(slot.heap);
        self.restore.add_objects(state.resources());
        if let Some(address) = state.acceleration_structure {
            self.add_shader_resource_address(address);
        }
    }

    fn add_descriptor_handle(&mut self, kind: HandleKind, handle: u64) {
        match self.handles.resolve(kind, handle) {
            Some(slot) => self.add_descriptor(slot),
            None => warn!(handle, ?kind, "descriptor handle not found"),
        }
    }
}

/// Analyzes recording commands on behalf of a restore set.
#[derive(Debug, Default)]
pub struct BindingAnalyzer {
    lists: HashMap<ObjectKey, CommandListInfo>,
}

impl BindingAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command_list(&self, list: ObjectKey) -> Option<&CommandListInfo> {
        self.lists.get(&list)
    }

    pub fn destroy(&mut self, list: ObjectKey) {
        self.lists.remove(&list);
    }

    /// Analyze one recording command. Commands that do not record into a command list are
    /// ignored.
    pub fn analyze(
        &mut self,
        record: &CommandRecord,
        ctx: &mut AnalysisContext<'_>,
    ) -> Result<(), AnalysisError> {
        let key = record.key;
        match &record.command {
            Command::Reset {
                list,
                allocator,
                initial_state,
            } => {
                self.lists.insert(*list, CommandListInfo::default());
                ctx.restore.add_object(*allocator);
                ctx.restore.add_objects(*initial_state);
            }
            Command::Close { .. } => {}
            Command::SetDescriptorHeaps { list, heaps } => {
                let info = self.lists.entry(*list).or_default();
                for &heap in heaps {
                    match ctx.handles.heap(heap).map(|h| h.kind) {
                        Some(DescriptorHeapKind::Sampler) => {
                            info.sampler_descriptor_heap = Some(heap);
                        }
                        Some(_) => info.view_descriptor_heap = Some(heap),
                        None => warn!(heap = %heap, "SetDescriptorHeaps with unknown heap"),
                    }
                    ctx.restore.add_object(heap);
                }
            }
            Command::SetRootSignature {
                list,
                bind_point,
                root_signature,
            } => {
                let info = self.lists.entry(*list).or_default();
                match bind_point {
                    BindPoint::Compute => info.compute_root_signature = Some(*root_signature),
                    BindPoint::Graphics => info.graphics_root_signature = Some(*root_signature),
                }
                ctx.restore.add_object(*root_signature);
            }
            Command::SetRootDescriptorTable {
                list,
                bind_point,
                parameter_index,
                base_descriptor,
            } => {
                self.descriptor_table(
                    key,
                    *list,
                    *bind_point,
                    *parameter_index,
                    *base_descriptor,
                    ctx,
                )?;
            }
            Command::SetRootView { kind, address, .. } => match kind {
                RootViewKind::ShaderResource => ctx.add_shader_resource_address(*address),
                RootViewKind::ConstantBuffer | RootViewKind::UnorderedAccess => {
                    ctx.add_address(*address);
                }
            },
            Command::IaSetIndexBuffer { view, .. } => {
                if let Some(view) = view {
                    ctx.add_address(view.buffer_location);
                }
            }
            Command::IaSetVertexBuffers { views, .. } => {
                for view in views {
                    ctx.add_address(view.buffer_location);
                }
            }
            Command::OmSetRenderTargets {
                render_targets,
                depth_stencil,
                ..
            } => {
                for &handle in render_targets.iter().chain(depth_stencil) {
                    ctx.add_descriptor_handle(HandleKind::Cpu, handle);
                }
            }
            Command::ClearRenderTargetView { view, .. }
            | Command::ClearDepthStencilView { view, .. } => {
                ctx.add_descriptor_handle(HandleKind::Cpu, *view);
            }
            Command::ClearUnorderedAccessView {
                view_gpu,
                view_cpu,
                resource,
                ..
            } => {
                ctx.add_descriptor_handle(HandleKind::Gpu, *view_gpu);
                ctx.add_descriptor_handle(HandleKind::Cpu, *view_cpu);
                ctx.restore.add_object(*resource);
            }
            Command::SetPipelineState { pipeline, .. } => {
                ctx.restore.add_object(*pipeline);
            }
            Command::SetPipelineState1 { state_object, .. } => {
                ctx.restore.add_object(*state_object);
                if let Some(references) = ctx.raytracing.state_object_references(*state_object) {
                    ctx.restore.add_objects(references.iter().copied());
                }
            }
            Command::ResourceBarrier { barriers, .. } => {
                for barrier in barriers {
                    ctx.restore.add_objects(barrier.resources());
                }
            }
            Command::CopyBufferRegion { dest, src, .. }
            | Command::CopyResource { dest, src, .. }
            | Command::CopyTextureRegion { dest, src, .. }
            | Command::ResolveSubresource { dest, src, .. } => {
                ctx.restore.add_objects([*dest, *src]);
            }
            Command::DiscardResource { resource, .. } => {
                ctx.restore.add_object(*resource);
            }
            Command::WriteBufferImmediate { addresses, .. } => {
                for &address in addresses {
                    ctx.add_address(address);
                }
            }
            Command::BuildRaytracingAccelerationStructure { desc, .. } => {
                ctx.add_address(desc.dest_acceleration_structure_data);
                ctx.add_address(desc.scratch_acceleration_structure_data);
                let source = ctx.add_address(desc.source_acceleration_structure_data);
                if let Some((resource, offset)) = source {
                    ctx.restore.add_as_source(AsLocation::new(resource, offset));
                }
                match &desc.inputs {
                    AccelerationStructureInputs::TopLevel { instance_descs, .. } => {
                        ctx.add_address(*instance_descs);
                        ctx.restore.add_tlas(key);
                    }
                    AccelerationStructureInputs::BottomLevel { geometries } => {
                        for address in geometries.iter().flat_map(|g| g.addresses()) {
                            ctx.add_address(address);
                        }
                    }
                }
            }
            Command::CopyRaytracingAccelerationStructure { dest, source, .. } => {
                ctx.add_address(*dest);
                if let Some((resource, offset)) = ctx.add_address(*source) {
                    let location = AsLocation::new(resource, offset);
                    ctx.restore.add_as_source(location);
                    if let Some(build) = ctx.raytracing.tlas_build_at(location) {
                        ctx.restore.add_tlas(build);
                    }
                }
            }
            Command::DispatchRays { list, desc } => {
                let tables = ctx.raytracing.track_shader_tables(
                    key,
                    Some(*list),
                    desc,
                    ctx.addresses,
                    ctx.readbacks,
                );
                ctx.restore.add_objects(tables);
            }
            Command::ExecuteIndirect {
                list,
                signature,
                max_command_count,
                argument_buffer,
                argument_buffer_offset,
                count_buffer,
                count_buffer_offset,
            } => {
                ctx.restore.add_objects([*signature, *argument_buffer]);
                ctx.restore.add_objects(*count_buffer);
                let call = IndirectCall {
                    signature: *signature,
                    max_command_count: *max_command_count,
                    argument_buffer: *argument_buffer,
                    argument_buffer_offset: *argument_buffer_offset,
                    count_buffer: *count_buffer,
                    count_buffer_offset: *count_buffer_offset,
                };
                ctx.execute_indirect.track(key, *list, &call, ctx.readbacks)?;
            }
            Command::InitializeMetaCommand {
                meta_command,
                resources,
                ..
            }
            | Command::ExecuteMetaCommand {
                meta_command,
                resources,
                ..
            } => {
                ctx.restore.add_object(*meta_command);
                ctx.restore.add_objects(resources.iter().copied());
            }
            _ => {}
        }
        Ok(())
    }

    /// Add the descriptors a `SetRootDescriptorTable` can reach. For an unbounded range that is
    /// every slot of the heap ever written; never-written slots have no state to restore.
    fn descriptor_table(
        &mut self,
        command: CommandKey,
        list: ObjectKey,
        bind_point: BindPoint,
        parameter_index: u32,
        base_descriptor: u64,
        ctx: &mut AnalysisContext<'_>,
    ) -> Result<(), AnalysisError> {
        let Some(slot) = ctx.handles.resolve(HandleKind::Gpu, base_descriptor) else {
            warn!(
                command = %command,
                handle = base_descriptor,
                "descriptor table base handle not found"
            );
            return Ok(());
        };
        let root_signature = self
            .lists
            .get(&list)
            .and_then(|info| info.root_signature(bind_point))
            .ok_or(AnalysisError::MissingRootSignature {
                command,
                list,
                what: "SetRootDescriptorTable",
            })?;
        let Some(heap) = ctx.handles.heap(slot.heap) else {
            return Ok(());
        };
        let heap_size = heap.num_descriptors;
        let sampler = heap.kind == DescriptorHeapKind::Sampler;
        ctx.restore.add_object(slot.heap);

        let table = ctx.root_signatures.descriptor_table_indexes(
            root_signature,
            slot.heap,
            parameter_index,
            slot.index,
            heap_size,
            sampler,
        )?;
        if table.unbounded {
            // Bindless: any populated slot may be read.
            let populated: Vec<u32> = ctx.descriptors.populated(slot.heap).collect();
            for index in populated {
                ctx.add_descriptor(DescriptorSlot::new(slot.heap, index));
            }
        }
        for index in table.indexes {
            ctx.add_descriptor(DescriptorSlot::new(slot.heap, index));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::d3d12::{
        BuildAccelerationStructureDesc, DescriptorRange, DescriptorRangeKind, ElementsLayout,
        ResourceFlags, RootParameter, RootSignatureDesc, ViewDesc, DESCRIPTOR_RANGE_OFFSET_APPEND,
        UNBOUNDED_DESCRIPTOR_RANGE,
    };
    use crate::descriptor_state::DescriptorState;
    use crate::readback::MemoryReadbackDevice;

    const LIST: ObjectKey = ObjectKey(1);
    const HEAP: ObjectKey = ObjectKey(2);
    const RS: ObjectKey = ObjectKey(3);
    const GPU_BASE: u64 = 0x50_0000;
    const INCREMENT: u32 = 32;

    struct Fixture {
        addresses: GpuAddressService,
        handles: DescriptorHandleService,
        descriptors: DescriptorService,
        root_signatures: RootSignatureService,
        raytracing: RaytracingDependencyService,
        execute_indirect: ExecuteIndirectService,
        readbacks: ReadbackQueue,
        restore: RestoreSet,
        binding: BindingAnalyzer,
    }

    impl Fixture {
        fn new(ranges: Vec<DescriptorRange>) -> Self {
            let mut handles = DescriptorHandleService::new();
            handles.create_heap(HEAP, DescriptorHeapKind::CbvSrvUav, 64, INCREMENT);
            handles
                .add_capture_start(HEAP, HandleKind::Gpu, GPU_BASE)
                .unwrap();
            let mut descriptors = DescriptorService::new();
            descriptors.create_heap(HEAP, 64);
            let mut root_signatures = RootSignatureService::new();
            root_signatures.create(
                RS,
                RootSignatureDesc {
                    parameters: vec![RootParameter::DescriptorTable { ranges }],
                },
            );
            Self {
                addresses: GpuAddressService::new(),
                handles,
                descriptors,
                root_signatures,
                raytracing: RaytracingDependencyService::new(),
                execute_indirect: ExecuteIndirectService::new(),
                readbacks: ReadbackQueue::new(Box::new(MemoryReadbackDevice::default())),
                restore: RestoreSet::new(),
                binding: BindingAnalyzer::new(),
            }
        }

        fn srv(&mut self, index: u32, resource: u32) {
            let state = DescriptorState::from_view(
                &ViewDesc::ShaderResource {
                    resource: Some(ObjectKey(resource)),
                },
                &self.addresses,
            );
            self.descriptors
                .write(DescriptorSlot::new(HEAP, index), state);
        }

        fn run(&mut self, key: u64, command: Command) -> Result<(), AnalysisError> {
            let mut ctx = AnalysisContext {
                addresses: &self.addresses,
                handles: &self.handles,
                descriptors: &self.descriptors,
                root_signatures: &mut self.root_signatures,
                raytracing: &mut self.raytracing,
                execute_indirect: &mut self.execute_indirect,
                readbacks: &mut self.readbacks,
                restore: &mut self.restore,
            };
            self.binding
                .analyze(&CommandRecord::new(key, command), &mut ctx)
        }

        fn bind(&mut self) {
            self.run(
                1,
                Command::SetDescriptorHeaps {
                    list: LIST,
                    heaps: vec![HEAP],
                },
            )
            .unwrap();
            self.run(
                2,
                Command::SetRootSignature {
                    list: LIST,
                    bind_point: BindPoint::Compute,
                    root_signature: RS,
                },
            )
            .unwrap();
        }

        fn set_table(&mut self, key: u64, base_index: u32) -> Result<(), AnalysisError> {
            self.run(
                key,
                Command::SetRootDescriptorTable {
                    list: LIST,
                    bind_point: BindPoint::Compute,
                    parameter_index: 0,
                    base_descriptor: GPU_BASE + u64::from(base_index * INCREMENT),
                },
            )
        }
    }

    fn range(num: u32) -> DescriptorRange {
        DescriptorRange {
            kind: DescriptorRangeKind::Srv,
            num_descriptors: num,
            base_shader_register: 0,
            register_space: 0,
            offset_in_descriptors_from_table_start: DESCRIPTOR_RANGE_OFFSET_APPEND,
        }
    }

    #[test]
    fn bounded_table_adds_only_covered_slots() {
        let mut fixture = Fixture::new(vec![range(2)]);
        for index in 0..6 {
            fixture.srv(index, 100 + index);
        }
        fixture.bind();
        fixture.set_table(3, 2).unwrap();

        let slots: Vec<u32> = fixture.restore.descriptors.iter().map(|s| s.index).collect();
        assert_eq!(slots, vec![2, 3]);
        assert!(fixture.restore.objects.contains(&ObjectKey(102)));
        assert!(fixture.restore.objects.contains(&ObjectKey(103)));
        assert!(!fixture.restore.objects.contains(&ObjectKey(104)));
        assert!(fixture.restore.objects.contains(&HEAP));
        assert!(fixture.restore.objects.contains(&RS));
    }

    #[test]
    fn unbounded_table_adds_every_populated_slot() {
        let mut fixture = Fixture::new(vec![range(UNBOUNDED_DESCRIPTOR_RANGE)]);
        for index in [0, 7, 40, 63] {
            fixture.srv(index, 200 + index);
        }
        fixture.bind();
        fixture.set_table(3, 10).unwrap();

        let slots: Vec<u32> = fixture.restore.descriptors.iter().map(|s| s.index).collect();
        assert_eq!(slots, vec![0, 7, 40, 63]);
    }

    #[test]
    fn missing_descriptor_state_is_skipped() {
        let mut fixture = Fixture::new(vec![range(3)]);
        fixture.srv(0, 300);
        fixture.bind();
        fixture.set_table(3, 0).unwrap();
        assert_eq!(fixture.restore.descriptors.len(), 1);
    }

    #[test]
    fn table_without_root_signature_is_an_error() {
        let mut fixture = Fixture::new(vec![range(1)]);
        assert!(matches!(
            fixture.set_table(3, 0),
            Err(AnalysisError::MissingRootSignature { .. })
        ));
    }

    #[test]
    fn root_srv_on_tlas_pulls_in_its_build() {
        let mut fixture = Fixture::new(vec![range(1)]);
        fixture.addresses.create_resource(
            ObjectKey(20),
            0x1000,
            ResourceFlags::RAYTRACING_ACCELERATION_STRUCTURE,
        );
        fixture
            .addresses
            .add_capture_address(ObjectKey(20), 0x80_0000)
            .unwrap();
        fixture.raytracing.track_build(
            CommandKey(10),
            LIST,
            &BuildAccelerationStructureDesc {
                dest_acceleration_structure_data: 0x80_0000,
                source_acceleration_structure_data: 0,
                scratch_acceleration_structure_data: 0,
                inputs: AccelerationStructureInputs::TopLevel {
                    instance_descs: 0,
                    num_descs: 0,
                    layout: ElementsLayout::Array,
                },
            },
            &fixture.addresses,
            &mut fixture.readbacks,
        );
        fixture
            .run(
                11,
                Command::SetRootView {
                    list: LIST,
                    bind_point: BindPoint::Compute,
                    parameter_index: 1,
                    kind: RootViewKind::ShaderResource,
                    address: 0x80_0000,
                },
            )
            .unwrap();
        assert!(fixture.restore.tlases.contains(&CommandKey(10)));
        assert!(fixture.restore.objects.contains(&ObjectKey(20)));
    }
}
