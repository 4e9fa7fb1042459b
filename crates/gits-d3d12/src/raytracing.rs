//! Acceleration-structure and state-object dependency tracking.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::address::{DescriptorHandleService, GpuAddressService, HandleKind};
use crate::d3d12::{
    AccelerationStructureInputs, BuildAccelerationStructureDesc, DispatchRaysDesc,
    ElementsLayout, RaytracingInstanceDesc, SHADER_IDENTIFIER_SIZE,
};
use crate::key::{AsLocation, CommandKey, DescriptorSlot, ObjectKey};
use crate::readback::{CompletedReadback, ReadbackPurpose, ReadbackQueue, ReadbackRequest};

const POINTER_SIZE: u64 = 8;

/// Objects and descriptors discovered inside shader binding tables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShaderTableReferences {
    pub objects: BTreeSet<ObjectKey>,
    pub descriptors: BTreeSet<DescriptorSlot>,
}

#[derive(Clone, Debug, Default)]
pub struct RaytracingDependencyService {
    /// Latest top-level build written to each location.
    tlas_by_location: HashMap<AsLocation, CommandKey>,
    /// Destination of each top-level build.
    tlas_destinations: HashMap<CommandKey, AsLocation>,
    /// Bottom-level structures referenced by each top-level build's instances.
    tlas_blases: HashMap<CommandKey, BTreeSet<AsLocation>>,
    /// Structures each location was copied from or updated from.
    sources: HashMap<AsLocation, BTreeSet<AsLocation>>,
    state_objects: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
}

impl RaytracingDependencyService {
    pub fn new() -> Self {
        Self::default()
    }

    fn locate(addresses: &GpuAddressService, address: u64) -> Option<AsLocation> {
        addresses
            .resolve(address)
            .map(|(resource, offset)| AsLocation::new(resource, offset))
    }

    /// Track a build recorded into `command_list`.
    ///
    /// For top-level builds this records a readback of the instance buffer (or of its pointer
    /// array) that is staged once the command list executes.
    pub fn track_build(
        &mut self,
        command: CommandKey,
        command_list: ObjectKey,
        desc: &BuildAccelerationStructureDesc,
        addresses: &GpuAddressService,
        readbacks: &mut ReadbackQueue,
    ) {
        let Some(dest) = Self::locate(addresses, desc.dest_acceleration_structure_data) else {
            warn!(
                command = %command,
                address = desc.dest_acceleration_structure_data,
                "acceleration structure destination not found"
            );
            return;
        };
        if desc.source_acceleration_structure_data != 0 {
            match Self::locate(addresses, desc.source_acceleration_structure_data) {
                Some(source) if source != dest => {
                    self.sources.entry(dest).or_default().insert(source);
                }
                Some(_) => {}
                None => debug!(command = %command, "update source not found"),
            }
        }

        match desc.inputs {
            AccelerationStructureInputs::TopLevel {
                instance_descs,
                num_descs,
                layout,
            } => {
                self.tlas_by_location.insert(dest, command);
                self.tlas_destinations.insert(command, dest);
                self.tlas_blases.entry(command).or_default();
                if num_descs == 0 {
                    return;
                }
                let Some((resource, offset)) = addresses.resolve(instance_descs) else {
                    warn!(
                        command = %command,
                        address = instance_descs,
                        "instance descs buffer not found"
                    );
                    return;
                };
                let element_size = match layout {
                    ElementsLayout::Array => RaytracingInstanceDesc::SIZE_BYTES as u64,
                    ElementsLayout::ArrayOfPointers => POINTER_SIZE,
                };
                readbacks.record(
                    command_list,
                    ReadbackRequest {
                        resource,
                        offset,
                        size: element_size * u64::from(num_descs),
                    },
                    ReadbackPurpose::TlasInstances {
                        build: command,
                        layout,
                        count: num_descs,
                    },
                );
            }
            AccelerationStructureInputs::BottomLevel { .. } => {
                // A rebuild in place invalidates any earlier top-level build at this location.
                self.tlas_by_location.remove(&dest);
            }
        }
    }

    /// Track `CopyRaytracingAccelerationStructure`. Returns the resolved `(dest, source)`.
    pub fn track_copy(
        &mut self,
        dest: u64,
        source: u64,
        addresses: &GpuAddressService,
    ) -> Option<(AsLocation, AsLocation)> {
        let dest = Self::locate(addresses, dest)?;
        let source = Self::locate(addresses, source)?;
        if dest == source {
            return Some((dest, source));
        }
        self.sources.entry(dest).or_default().insert(source);
        match self.tlas_by_location.get(&source).copied() {
            Some(build) => {
                self.tlas_by_location.insert(dest, build);
            }
            None => {
                self.tlas_by_location.remove(&dest);
            }
        }
        Some((dest, source))
    }

    /// Consume an instance-buffer readback.
    ///
    /// Returns `true` if the readback was one of ours.
    pub fn on_readback(
        &mut self,
        readback: &CompletedReadback,
        addresses: &GpuAddressService,
        readbacks: &mut ReadbackQueue,
    ) -> bool {
        match readback.purpose {
            ReadbackPurpose::TlasInstances {
                build,
                layout: ElementsLayout::Array,
                count,
            } => {
                for desc in readback
                    .bytes
                    .chunks_exact(RaytracingInstanceDesc::SIZE_BYTES)
                    .take(count as usize)
                    .filter_map(RaytracingInstanceDesc::read)
                {
                    self.add_instance(build, &desc, addresses);
                }
                true
            }
            ReadbackPurpose::TlasInstances {
                build,
                layout: ElementsLayout::ArrayOfPointers,
                count,
            } => {
                let pointers = readback
                    .bytes
                    .chunks_exact(POINTER_SIZE as usize)
                    .take(count as usize)
                    .filter_map(|chunk| chunk.try_into().ok().map(u64::from_le_bytes));
                for pointer in pointers.filter(|&pointer| pointer != 0) {
                    let Some((resource, offset)) = addresses.resolve(pointer) else {
                        debug!(build = %build, pointer, "instance desc pointer not found");
                        continue;
                    };
                    readbacks.stage_now(
                        ReadbackRequest {
                            resource,
                            offset,
                            size: RaytracingInstanceDesc::SIZE_BYTES as u64,
                        },
                        ReadbackPurpose::TlasInstance { build },
                    );
                }
                true
            }
            ReadbackPurpose::TlasInstance { build } => {
                if let Some(desc) = RaytracingInstanceDesc::read(&readback.bytes) {
                    self.add_instance(build, &desc, addresses);
                }
                true
            }
            _ => false,
        }
    }

    fn add_instance(
        &mut self,
        build: CommandKey,
        desc: &RaytracingInstanceDesc,
        addresses: &GpuAddressService,
    ) {
        if desc.acceleration_structure == 0 {
            return;
        }
        match Self::locate(addresses, desc.acceleration_structure) {
            Some(blas) => {
                self.tlas_blases.entry(build).or_default().insert(blas);
            }
            None => debug!(
                build = %build,
                address = desc.acceleration_structure,
                "instance references an unknown bottom-level structure"
            ),
        }
    }

    /// Top-level build whose result currently lives at `location`.
    pub fn tlas_build_at(&self, location: AsLocation) -> Option<CommandKey> {
        self.tlas_by_location.get(&location).copied()
    }

    pub fn tlas_destination(&self, build: CommandKey) -> Option<AsLocation> {
        self.tlas_destinations.get(&build).copied()
    }

    pub fn blases_of(&self, build: CommandKey) -> impl Iterator<Item = AsLocation> + '_ {
        self.tlas_blases.get(&build).into_iter().flatten().copied()
    }

    /// Every location `location` was (transitively) copied or updated from.
    pub fn source_closure(&self, location: AsLocation) -> BTreeSet<AsLocation> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![location];
        while let Some(current) = stack.pop() {
            for source in self.sources.get(&current).into_iter().flatten() {
                if visited.insert(*source) {
                    stack.push(*source);
                }
            }
        }
        visited
    }

    pub fn create_state_object(&mut self, state_object: ObjectKey, subobjects: &[ObjectKey]) {
        self.state_objects
            .insert(state_object, subobjects.iter().copied().collect());
    }

    /// `AddToStateObject`: the new object references everything its parent did.
    pub fn add_to_state_object(
        &mut self,
        state_object: ObjectKey,
        parent: ObjectKey,
        subobjects: &[ObjectKey],
    ) {
        let mut keys = self
            .state_objects
            .get(&parent)
            .cloned()
            .unwrap_or_default();
        keys.insert(parent);
        keys.extend(subobjects.iter().copied());
        self.state_objects.insert(state_object, keys);
    }

    pub fn state_object_references(&self, state_object: ObjectKey) -> Option<&BTreeSet<ObjectKey>> {
        self.state_objects.get(&state_object)
    }

    pub fn destroy(&mut self, key: ObjectKey) {
        self.state_objects.remove(&key);
        self.tlas_by_location
            .retain(|location, _| location.resource != key);
    }

    /// Record readbacks of the four shader tables of a `DispatchRays`.
    ///
    /// With a command list the copies are staged when the list executes; without one (tables
    /// found in an indirect argument buffer that already executed) they are staged right away.
    /// Returns the resources backing the tables.
    pub fn track_shader_tables(
        &mut self,
        dispatch: CommandKey,
        command_list: Option<ObjectKey>,
        desc: &DispatchRaysDesc,
        addresses: &GpuAddressService,
        readbacks: &mut ReadbackQueue,
    ) -> BTreeSet<ObjectKey> {
        let mut resources = BTreeSet::new();
        for table in desc.shader_tables() {
            if table.start_address == 0 || table.size_in_bytes == 0 {
                continue;
            }
            let Some((resource, offset)) = addresses.resolve(table.start_address) else {
                warn!(
                    dispatch = %dispatch,
                    address = table.start_address,
                    "shader table buffer not found"
                );
                continue;
            };
            resources.insert(resource);
            let request = ReadbackRequest {
                resource,
                offset,
                size: table.size_in_bytes,
            };
            let purpose = ReadbackPurpose::ShaderTable {
                dispatch,
                stride: table.stride_in_bytes,
            };
            match command_list {
                Some(list) => readbacks.record(list, request, purpose),
                None => {
                    readbacks.stage_now(request, purpose);
                }
            }
        }
        resources
    }

    /// Scan a shader table's local root arguments for GPU addresses and descriptor handles.
    pub fn scan_shader_table(
        bytes: &[u8],
        stride: u64,
        addresses: &GpuAddressService,
        handles: &DescriptorHandleService,
    ) -> ShaderTableReferences {
        let mut references = ShaderTableReferences::default();
        let stride = if stride == 0 {
            bytes.len()
        } else {
            stride as usize
        };
        if stride == 0 {
            return references;
        }
        for record in bytes.chunks(stride) {
            let Some(arguments) = record.get(SHADER_IDENTIFIER_SIZE..) else {
                continue;
            };
            for word in arguments.chunks_exact(8) {
                let Ok(word) = <[u8; 8]>::try_from(word) else {
                    continue;
                };
                let value = u64::from_le_bytes(word);
                if value == 0 {
                    continue;
                }
                if let Some((resource, _)) = addresses.resolve(value) {
                    references.objects.insert(resource);
                } else if let Some(slot) = handles.resolve(HandleKind::Gpu, value) {
                    references.descriptors.insert(slot);
                }
            }
        }
        references
    }
}
