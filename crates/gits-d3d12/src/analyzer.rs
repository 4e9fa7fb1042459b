//! One subcapture analysis session over a capture stream.
//!
//! Commands are fed in capture order through [`SubcaptureAnalyzer::process`]. Object
//! bookkeeping (addresses, descriptor heaps, root signatures, acceleration structure builds)
//! runs for every command. Recording commands are buffered per command list until the range
//! starts; inside the range they are analyzed, after replaying whatever was buffered for their
//! list. When the range ends, outstanding readbacks are drained and the report is assembled.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info, warn};

use crate::address::{DescriptorHandleService, GpuAddressService, HandleKind};
use crate::binding::{AnalysisContext, BindingAnalyzer};
use crate::command::{Command, CommandRecord, DescriptorHandleRun};
use crate::command_list::{CommandListReplayBuffer, RestoreAction};
use crate::config::{PolicyKind, SubcaptureConfig, SubcaptureRange};
use crate::descriptor_state::{DescriptorService, DescriptorState};
use crate::error::AnalysisError;
use crate::execute_indirect::dispatch_rays_file::DispatchRaysRecord;
use crate::execute_indirect::ExecuteIndirectService;
use crate::gpu_execution::{GpuExecutionTracker, QueueEvent};
use crate::key::{AsLocation, CommandKey, DescriptorSlot, ObjectKey};
use crate::policy::AnalysisPolicy;
use crate::raytracing::RaytracingDependencyService;
use crate::readback::{CompletedReadback, ReadbackDevice, ReadbackPurpose, ReadbackQueue};
use crate::report::{ReportSection, SubcaptureAnalysisReport};
use crate::restore_set::{ParentGraph, RestoreSet};
use crate::root_signature::RootSignatureService;
use crate::shader_identifier::ShaderIdentifierRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangePhase {
    Before,
    Inside { first_command: CommandKey },
    Done,
}

pub struct SubcaptureAnalyzer {
    range: SubcaptureRange,
    policy: Box<dyn AnalysisPolicy>,
    addresses: GpuAddressService,
    handles: DescriptorHandleService,
    descriptors: DescriptorService,
    root_signatures: RootSignatureService,
    raytracing: RaytracingDependencyService,
    execute_indirect: ExecuteIndirectService,
    shader_identifiers: ShaderIdentifierRegistry,
    readbacks: ReadbackQueue,
    tracker: GpuExecutionTracker,
    buffer: CommandListReplayBuffer,
    binding: BindingAnalyzer,
    restore: RestoreSet,
    parents: ParentGraph,
    created_in_range: HashSet<ObjectKey>,
    frame: u32,
    executions_in_frame: u32,
    phase: RangePhase,
    range_start: Option<CommandKey>,
    dispatch_rays: Vec<DispatchRaysRecord>,
    report: Option<SubcaptureAnalysisReport>,
}

impl SubcaptureAnalyzer {
    pub fn new(
        range: SubcaptureRange,
        policy: PolicyKind,
        dump_lookup: bool,
        device: Box<dyn ReadbackDevice>,
    ) -> Self {
        Self {
            range,
            policy: policy.policy(),
            addresses: GpuAddressService::new(),
            handles: DescriptorHandleService::new(),
            descriptors: DescriptorService::new(),
            root_signatures: RootSignatureService::new(),
            raytracing: RaytracingDependencyService::new(),
            execute_indirect: ExecuteIndirectService::new(),
            shader_identifiers: ShaderIdentifierRegistry::new(dump_lookup),
            readbacks: ReadbackQueue::new(device),
            tracker: GpuExecutionTracker::new(),
            buffer: CommandListReplayBuffer::new(),
            binding: BindingAnalyzer::new(),
            restore: RestoreSet::new(),
            parents: ParentGraph::new(),
            created_in_range: HashSet::new(),
            frame: 1,
            executions_in_frame: 0,
            phase: RangePhase::Before,
            range_start: None,
            dispatch_rays: Vec::new(),
            report: None,
        }
    }

    pub fn from_config(config: &SubcaptureConfig, device: Box<dyn ReadbackDevice>) -> Self {
        Self::new(config.range, config.policy, config.dump_lookup, device)
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn phase(&self) -> RangePhase {
        self.phase
    }

    pub fn addresses(&self) -> &GpuAddressService {
        &self.addresses
    }

    pub fn handles(&self) -> &DescriptorHandleService {
        &self.handles
    }

    pub fn shader_identifiers(&self) -> &ShaderIdentifierRegistry {
        &self.shader_identifiers
    }

    pub fn restore_set(&self) -> &RestoreSet {
        &self.restore
    }

    /// `DispatchRays` arguments discovered in indirect argument buffers.
    pub fn dispatch_rays(&self) -> &[DispatchRaysRecord] {
        &self.dispatch_rays
    }

    pub fn report_sections(&self) -> &'static [ReportSection] {
        self.policy.report_sections()
    }

    pub fn process(&mut self, record: &CommandRecord) -> Result<(), AnalysisError> {
        if self.phase == RangePhase::Done {
            return Ok(());
        }
        if self.phase == RangePhase::Before && self.starts_range(&record.command) {
            self.enter_range(record.key)?;
        }

        self.track(record)?;
        match &record.command {
            Command::ExecuteCommandLists { queue, lists } => {
                self.execute(record.key, *queue, lists)?;
            }
            Command::QueueSignal {
                queue,
                fence,
                value,
            } => {
                let ready = self.tracker.submit(QueueEvent::Signal {
                    command: record.key,
                    queue: *queue,
                    fence: *fence,
                    value: *value,
                });
                self.on_executed(ready)?;
            }
            Command::QueueWait {
                queue,
                fence,
                value,
            } => {
                let ready = self.tracker.submit(QueueEvent::Wait {
                    command: record.key,
                    queue: *queue,
                    fence: *fence,
                    value: *value,
                });
                self.on_executed(ready)?;
            }
            Command::FenceSignal { fence, value } => {
                let ready = self.tracker.cpu_signal(*fence, *value);
                self.on_executed(ready)?;
            }
            Command::Present { .. } => {
                let finished = self.frame;
                self.frame += 1;
                self.executions_in_frame = 0;
                debug!(frame = finished, "frame presented");
                if matches!(self.range, SubcaptureRange::Frames { end, .. } if end == finished)
                    && matches!(self.phase, RangePhase::Inside { .. })
                {
                    self.exit_range()?;
                }
            }
            command => {
                if let Some(list) = command.command_list() {
                    self.record_list_command(list, record)?;
                }
            }
        }
        Ok(())
    }

    /// Finish the session and hand out the report. A range still open at the end of the stream
    /// is closed here.
    pub fn finish(mut self) -> Result<SubcaptureAnalysisReport, AnalysisError> {
        match self.phase {
            RangePhase::Before => {
                warn!(range = %self.range, frames = self.frame, "subcapture range never reached");
                Ok(SubcaptureAnalysisReport::default())
            }
            RangePhase::Inside { .. } => {
                self.exit_range()?;
                Ok(self.report.take().unwrap_or_default())
            }
            RangePhase::Done => Ok(self.report.take().unwrap_or_default()),
        }
    }

    /// The report, once the range has been left.
    pub fn report(&self) -> Option<&SubcaptureAnalysisReport> {
        self.report.as_ref()
    }

    fn starts_range(&self, command: &Command) -> bool {
        match self.range {
            SubcaptureRange::Frames { start, .. } => self.frame >= start,
            SubcaptureRange::ExecutionRange { frame, start, .. } => {
                self.frame == frame
                    && matches!(command, Command::ExecuteCommandLists { .. })
                    && self.executions_in_frame + 1 == start
            }
        }
    }

    fn enter_range(&mut self, first_command: CommandKey) -> Result<(), AnalysisError> {
        info!(range = %self.range, frame = self.frame, command = %first_command, "entering subcapture range");
        self.phase = RangePhase::Inside { first_command };
        self.range_start = Some(first_command);
        self.buffer.enter_range();
        self.restore.clear();
        self.root_signatures.reset_retrieved();

        // Queue work still blocked on the GPU at the range start has to be re-issued.
        let pending: Vec<QueueEvent> = self.tracker.pending().into_iter().cloned().collect();
        for event in pending {
            self.restore.add_queue_command(event.command());
            if let QueueEvent::Execute { lists, .. } = event {
                for list in lists {
                    self.restore_list(list)?;
                }
            }
        }
        Ok(())
    }

    fn exit_range(&mut self) -> Result<(), AnalysisError> {
        loop {
            let done = self.readbacks.flush()?;
            if done.is_empty() {
                break;
            }
            self.route_readbacks(done)?;
        }
        self.buffer.exit_range();
        self.phase = RangePhase::Done;

        let mut report = self.build_report();
        self.policy.finalize(&mut report);
        info!(
            policy = %self.policy.kind(),
            command_lists = report.command_lists.len(),
            objects = report.objects.len(),
            descriptors = report.descriptors.len(),
            tlases = report.tlases.len(),
            blases = report.blases.len(),
            "subcapture range analyzed"
        );
        self.report = Some(report);
        Ok(())
    }

    fn in_range(&self) -> bool {
        matches!(self.phase, RangePhase::Inside { .. })
    }

    fn created(&mut self, key: ObjectKey) {
        if self.in_range() {
            self.created_in_range.insert(key);
        }
    }

    /// Bookkeeping that runs for every command regardless of the range.
    fn track(&mut self, record: &CommandRecord) -> Result<(), AnalysisError> {
        match &record.command {
            Command::CreateHeap { heap, size } => {
                self.addresses.create_heap(*heap, *size);
                self.created(*heap);
            }
            Command::CreateCommittedResource {
                resource,
                size,
                flags,
            } => {
                self.addresses.create_resource(*resource, *size, *flags);
                self.created(*resource);
            }
            Command::CreatePlacedResource {
                resource,
                heap,
                heap_offset,
                size,
                flags,
            } => {
                self.addresses
                    .create_placed_resource(*heap, *heap_offset, *resource, *size, *flags);
                self.parents.add(*resource, *heap);
                self.created(*resource);
            }
            Command::GetGpuVirtualAddress {
                resource, address, ..
            } => {
                self.addresses.add_capture_address(*resource, *address)?;
            }
            Command::CreateDescriptorHeap {
                heap,
                kind,
                num_descriptors,
                increment,
                ..
            } => {
                self.handles
                    .create_heap(*heap, *kind, *num_descriptors, *increment);
                self.descriptors.create_heap(*heap, *num_descriptors);
                self.created(*heap);
            }
            Command::GetCpuDescriptorHandleForHeapStart { heap, handle, .. } => {
                self.handles
                    .add_capture_start(*heap, HandleKind::Cpu, *handle)?;
            }
            Command::GetGpuDescriptorHandleForHeapStart { heap, handle, .. } => {
                self.handles
                    .add_capture_start(*heap, HandleKind::Gpu, *handle)?;
            }
            Command::CreateView { dest, desc } => {
                let Some(slot) = self.handles.resolve(HandleKind::Cpu, *dest) else {
                    warn!(command = %record.key, handle = *dest, "view created at unknown descriptor handle");
                    return Ok(());
                };
                let state = DescriptorState::from_view(desc, &self.addresses);
                if self.descriptors.write(slot, state) {
                    self.root_signatures.invalidate_heap(slot.heap);
                }
            }
            Command::CopyDescriptors {
                dest_ranges,
                src_ranges,
            } => {
                let dest = self.resolve_runs(dest_ranges);
                let src = self.resolve_runs(src_ranges);
                let (Some(dest), Some(src)) = (dest, src) else {
                    warn!(command = %record.key, "CopyDescriptors with unknown descriptor handles");
                    return Ok(());
                };
                self.descriptors.copy_ranges(&dest, &src);
                for (slot, _) in dest {
                    self.root_signatures.invalidate_heap(slot.heap);
                }
            }
            Command::CopyDescriptorsSimple {
                num_descriptors,
                dest,
                src,
            } => {
                let dest_slot = self.handles.resolve(HandleKind::Cpu, *dest);
                let src_slot = self.handles.resolve(HandleKind::Cpu, *src);
                let (Some(dest), Some(src)) = (dest_slot, src_slot) else {
                    warn!(command = %record.key, "CopyDescriptorsSimple with unknown descriptor handles");
                    return Ok(());
                };
                self.descriptors.copy(dest, src, *num_descriptors);
                self.root_signatures.invalidate_heap(dest.heap);
            }
            Command::CreateRootSignature {
                root_signature,
                desc,
            } => {
                self.root_signatures.create(*root_signature, desc.clone());
                self.created(*root_signature);
            }
            Command::CreatePipelineState {
                pipeline,
                root_signature,
            } => {
                if let Some(root_signature) = root_signature {
                    self.parents.add(*pipeline, *root_signature);
                }
                self.created(*pipeline);
            }
            Command::CreateStateObject {
                state_object,
                subobjects,
            } => {
                self.raytracing
                    .create_state_object(*state_object, subobjects);
                for &subobject in subobjects {
                    self.parents.add(*state_object, subobject);
                }
                self.created(*state_object);
            }
            Command::AddToStateObject {
                state_object,
                parent,
                subobjects,
            } => {
                self.raytracing
                    .add_to_state_object(*state_object, *parent, subobjects);
                for &subobject in subobjects.iter().chain([parent]) {
                    self.parents.add(*state_object, subobject);
                }
                self.created(*state_object);
            }
            Command::GetShaderIdentifier {
                export_name,
                identifier,
                ..
            } => {
                self.shader_identifiers
                    .add_capture(record.key, *identifier, export_name);
            }
            Command::CreateCommandSignature {
                signature,
                root_signature,
                desc,
            } => {
                self.execute_indirect
                    .create_command_signature(*signature, desc.clone());
                if let Some(root_signature) = root_signature {
                    self.parents.add(*signature, *root_signature);
                }
                self.created(*signature);
            }
            Command::CreateCommandAllocator { allocator } => self.created(*allocator),
            Command::CreateCommandList { list, allocator } => {
                self.parents.add(*list, *allocator);
                self.created(*list);
            }
            Command::CreateCommandQueue { queue } => self.created(*queue),
            Command::CreateFence {
                fence,
                initial_value,
            } => {
                self.tracker.create_fence(*fence, *initial_value);
                self.created(*fence);
            }
            Command::Release { object } => self.release(*object),
            Command::WriteResourceMemory {
                resource,
                offset,
                data,
            } => self.readbacks.observe_write(*resource, *offset, data),
            Command::Reset { list, .. } => self.readbacks.reset_command_list(*list),
            Command::BuildRaytracingAccelerationStructure { list, desc } => {
                self.raytracing.track_build(
                    record.key,
                    *list,
                    desc,
                    &self.addresses,
                    &mut self.readbacks,
                );
            }
            Command::CopyRaytracingAccelerationStructure { dest, source, .. } => {
                if self
                    .raytracing
                    .track_copy(*dest, *source, &self.addresses)
                    .is_none()
                {
                    debug!(command = %record.key, "acceleration structure copy with unknown addresses");
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn resolve_runs(&self, runs: &[DescriptorHandleRun]) -> Option<Vec<(DescriptorSlot, u32)>> {
        runs.iter()
            .map(|run| {
                self.handles
                    .resolve(HandleKind::Cpu, run.start)
                    .map(|slot| (slot, run.count))
            })
            .collect()
    }

    fn release(&mut self, object: ObjectKey) {
        self.addresses.destroy(object);
        if self.handles.heap(object).is_some() {
            self.handles.destroy(object);
            self.descriptors.destroy_heap(object);
            self.root_signatures.invalidate_heap(object);
        }
        self.root_signatures.destroy(object);
        self.raytracing.destroy(object);
        self.execute_indirect.destroy(object);
        self.buffer.destroy(object);
        self.binding.destroy(object);
        // The report closes over parents of everything the range touched, released or not.
        if !self.in_range() {
            self.parents.remove(object);
        }
    }

    fn record_list_command(
        &mut self,
        list: ObjectKey,
        record: &CommandRecord,
    ) -> Result<(), AnalysisError> {
        if !self.in_range() {
            self.buffer.buffer(list, record);
            return Ok(());
        }
        self.restore.add_object(list);
        if let RestoreAction::Replay(commands) = self.buffer.begin_command(list, &record.command) {
            self.replay(list, &commands)?;
        }
        self.analyze(record)
    }

    fn restore_list(&mut self, list: ObjectKey) -> Result<(), AnalysisError> {
        if let RestoreAction::Replay(commands) = self.buffer.restore(list) {
            self.replay(list, &commands)?;
        }
        Ok(())
    }

    fn replay(&mut self, list: ObjectKey, commands: &[CommandRecord]) -> Result<(), AnalysisError> {
        debug!(command_list = %list, commands = commands.len(), "restoring buffered commands");
        self.restore.add_command_list(list);
        for command in commands {
            self.analyze(command)?;
        }
        Ok(())
    }

    fn context(&mut self) -> (&dyn AnalysisPolicy, &mut BindingAnalyzer, AnalysisContext<'_>) {
        (
            self.policy.as_ref(),
            &mut self.binding,
            AnalysisContext {
                addresses: &self.addresses,
                handles: &self.handles,
                descriptors: &self.descriptors,
                root_signatures: &mut self.root_signatures,
                raytracing: &mut self.raytracing,
                execute_indirect: &mut self.execute_indirect,
                readbacks: &mut self.readbacks,
                restore: &mut self.restore,
            },
        )
    }

    fn analyze(&mut self, record: &CommandRecord) -> Result<(), AnalysisError> {
        let (policy, binding, mut ctx) = self.context();
        policy.analyze(binding, record, &mut ctx)
    }

    fn execute(
        &mut self,
        command: CommandKey,
        queue: ObjectKey,
        lists: &[ObjectKey],
    ) -> Result<(), AnalysisError> {
        self.executions_in_frame += 1;
        if self.in_range() {
            self.restore.add_object(queue);
            for &list in lists {
                self.restore_list(list)?;
            }
        }
        let ready = self.tracker.submit(QueueEvent::Execute {
            command,
            queue,
            lists: lists.to_vec(),
        });
        self.on_executed(ready)?;

        if let SubcaptureRange::ExecutionRange { frame, end, .. } = self.range {
            if self.in_range() && self.frame == frame && self.executions_in_frame == end {
                self.exit_range()?;
            }
        }
        Ok(())
    }

    /// Queue events the GPU has reached: stage readbacks of executed lists.
    fn on_executed(&mut self, events: Vec<QueueEvent>) -> Result<(), AnalysisError> {
        for event in events {
            if let QueueEvent::Execute { queue, lists, .. } = event {
                for list in lists {
                    self.readbacks.submit_command_list(queue, list);
                }
            }
        }
        let done = self.readbacks.poll()?;
        self.route_readbacks(done)
    }

    fn route_readbacks(&mut self, done: Vec<CompletedReadback>) -> Result<(), AnalysisError> {
        for readback in done {
            if self
                .raytracing
                .on_readback(&readback, &self.addresses, &mut self.readbacks)
            {
                continue;
            }
            if let ReadbackPurpose::ShaderTable { dispatch, stride } = readback.purpose {
                let references = RaytracingDependencyService::scan_shader_table(
                    &readback.bytes,
                    stride,
                    &self.addresses,
                    &self.handles,
                );
                debug!(
                    dispatch = %dispatch,
                    objects = references.objects.len(),
                    descriptors = references.descriptors.len(),
                    "shader table scanned"
                );
                let (_, _, mut ctx) = self.context();
                ctx.restore.add_objects(references.objects);
                for slot in references.descriptors {
                    ctx.add_descriptor(slot);
                }
                continue;
            }
            let Some(resolution) = self
                .execute_indirect
                .on_readback(&readback, &self.addresses)
            else {
                continue;
            };
            self.restore.add_objects(resolution.objects);
            for desc in resolution.dispatch_rays {
                let tables = self.raytracing.track_shader_tables(
                    resolution.command,
                    None,
                    &desc,
                    &self.addresses,
                    &mut self.readbacks,
                );
                self.restore.add_objects(tables);
                self.dispatch_rays.push(DispatchRaysRecord {
                    command: resolution.command,
                    desc,
                });
            }
        }
        Ok(())
    }

    fn build_report(&mut self) -> SubcaptureAnalysisReport {
        let range_start = self.range_start.unwrap_or_default();
        let mut report = SubcaptureAnalysisReport {
            command_lists: self.restore.command_lists.clone(),
            queue_commands: self.restore.queue_commands.clone(),
            descriptors: self.restore.descriptors.clone(),
            ..Default::default()
        };

        let mut as_roots: BTreeSet<AsLocation> = self.restore.as_sources.clone();
        for &build in &self.restore.tlases {
            for blas in self.raytracing.blases_of(build) {
                self.restore.blases.insert(blas);
            }
            // Builds recorded inside the range are part of the subcapture itself.
            if build < range_start {
                report.tlases.insert(build);
                as_roots.extend(self.raytracing.tlas_destination(build));
            }
        }
        as_roots.extend(self.restore.blases.iter().copied());
        for root in &as_roots {
            report
                .as_sources
                .extend(self.raytracing.source_closure(*root));
        }
        report.as_sources.extend(self.restore.as_sources.iter().copied());
        self.restore.as_sources.extend(report.as_sources.iter().copied());
        report.blases = self.restore.blases.clone();

        let roots = self
            .restore
            .objects
            .iter()
            .copied()
            .chain(self.restore.command_lists.iter().copied())
            .chain(self.restore.descriptors.iter().map(|slot| slot.heap))
            .chain(as_roots.iter().map(|location| location.resource))
            .chain(report.as_sources.iter().map(|location| location.resource));
        report.objects = self
            .parents
            .closure(roots)
            .into_iter()
            .filter(|key| !self.created_in_range.contains(key))
            .collect();
        report
    }
}
