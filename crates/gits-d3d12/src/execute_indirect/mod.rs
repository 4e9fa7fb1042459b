//! Object references hidden in `ExecuteIndirect` argument buffers.
//!
//! The arguments only exist once the GPU has produced them, so each `ExecuteIndirect` whose
//! command signature carries address-bearing arguments stages a readback of its argument
//! buffer (and of the count buffer, if any). Records are then walked with the signature's
//! argument layout.

pub mod dispatch_rays_file;

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::address::GpuAddressService;
use crate::d3d12::{
    read_u32_le, read_u64_le, CommandSignatureDesc, DispatchRaysDesc, IndirectArgument,
};
use crate::error::AnalysisError;
use crate::key::{CommandKey, ObjectKey};
use crate::readback::{CompletedReadback, ReadbackPurpose, ReadbackQueue, ReadbackRequest};

/// Buffers of one `ExecuteIndirect` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndirectCall {
    pub signature: ObjectKey,
    pub max_command_count: u32,
    pub argument_buffer: ObjectKey,
    pub argument_buffer_offset: u64,
    pub count_buffer: Option<ObjectKey>,
    pub count_buffer_offset: u64,
}

/// What an argument buffer referenced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndirectResolution {
    pub command: CommandKey,
    pub objects: BTreeSet<ObjectKey>,
    pub dispatch_rays: Vec<DispatchRaysDesc>,
}

#[derive(Debug)]
struct PendingIndirect {
    desc: CommandSignatureDesc,
    max_command_count: u32,
    arguments: Option<Vec<u8>>,
    awaiting_count: bool,
    count: Option<u32>,
}

#[derive(Debug, Default)]
pub struct ExecuteIndirectService {
    signatures: HashMap<ObjectKey, CommandSignatureDesc>,
    pending: HashMap<CommandKey, PendingIndirect>,
}

fn record_stride(desc: &CommandSignatureDesc) -> u64 {
    let packed: u64 = desc.arguments.iter().map(IndirectArgument::size_bytes).sum();
    u64::from(desc.byte_stride).max(packed)
}

impl ExecuteIndirectService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_command_signature(&mut self, signature: ObjectKey, desc: CommandSignatureDesc) {
        self.signatures.insert(signature, desc);
    }

    pub fn signature(&self, signature: ObjectKey) -> Option<&CommandSignatureDesc> {
        self.signatures.get(&signature)
    }

    pub fn destroy(&mut self, signature: ObjectKey) {
        self.signatures.remove(&signature);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Record the readbacks an `ExecuteIndirect` needs into `command_list`.
    ///
    /// Returns `false` if the signature has no arguments that reference objects.
    pub fn track(
        &mut self,
        command: CommandKey,
        command_list: ObjectKey,
        call: &IndirectCall,
        readbacks: &mut ReadbackQueue,
    ) -> Result<bool, AnalysisError> {
        let desc = self.signatures.get(&call.signature).ok_or(
            AnalysisError::UnknownCommandSignature {
                command,
                signature: call.signature,
            },
        )?;
        if !desc.arguments.iter().any(IndirectArgument::references_resources) {
            return Ok(false);
        }
        if call.max_command_count == 0 {
            return Ok(false);
        }

        readbacks.record(
            command_list,
            ReadbackRequest {
                resource: call.argument_buffer,
                offset: call.argument_buffer_offset,
                size: record_stride(desc) * u64::from(call.max_command_count),
            },
            ReadbackPurpose::IndirectArguments { command },
        );
        if let Some(count_buffer) = call.count_buffer {
            readbacks.record(
                command_list,
                ReadbackRequest {
                    resource: count_buffer,
                    offset: call.count_buffer_offset,
                    size: 4,
                },
                ReadbackPurpose::IndirectCount { command },
            );
        }
        self.pending.insert(
            command,
            PendingIndirect {
                desc: desc.clone(),
                max_command_count: call.max_command_count,
                arguments: None,
                awaiting_count: call.count_buffer.is_some(),
                count: None,
            },
        );
        Ok(true)
    }

    /// Consume an argument or count buffer readback. Returns the resolution once every buffer
    /// of the call has arrived.
    pub fn on_readback(
        &mut self,
        readback: &CompletedReadback,
        addresses: &GpuAddressService,
    ) -> Option<IndirectResolution> {
        let command = match readback.purpose {
            ReadbackPurpose::IndirectArguments { command } => {
                let pending = self.pending.get_mut(&command)?;
                pending.arguments = Some(readback.bytes.clone());
                command
            }
            ReadbackPurpose::IndirectCount { command } => {
                let pending = self.pending.get_mut(&command)?;
                pending.awaiting_count = false;
                pending.count = read_u32_le(&readback.bytes, 0);
                if pending.count.is_none() {
                    warn!(command = %command, "indirect count buffer readback too short");
                }
                command
            }
            _ => return None,
        };

        let ready = self
            .pending
            .get(&command)
            .is_some_and(|pending| pending.arguments.is_some() && !pending.awaiting_count);
        if !ready {
            return None;
        }
        let pending = self.pending.remove(&command)?;
        let count = pending
            .count
            .map_or(pending.max_command_count, |count| {
                count.min(pending.max_command_count)
            });
        let arguments = pending.arguments.unwrap_or_default();
        let mut resolution = resolve_arguments(&pending.desc, &arguments, count, addresses);
        resolution.command = command;
        Some(resolution)
    }
}

/// Walk `count` records of `bytes` laid out per `desc` and resolve every GPU address argument.
pub fn resolve_arguments(
    desc: &CommandSignatureDesc,
    bytes: &[u8],
    count: u32,
    addresses: &GpuAddressService,
) -> IndirectResolution {
    let mut resolution = IndirectResolution::default();
    let stride = record_stride(desc) as usize;
    if stride == 0 {
        return resolution;
    }

    let resolve = |address: u64, objects: &mut BTreeSet<ObjectKey>| {
        if address == 0 {
            return;
        }
        match addresses.resolve(address) {
            Some((resource, _)) => {
                objects.insert(resource);
            }
            None => debug!(address, "indirect argument address not found"),
        }
    };

    for record in bytes.chunks(stride).take(count as usize) {
        let mut cursor = 0usize;
        for argument in &desc.arguments {
            match argument {
                IndirectArgument::VertexBufferView { .. }
                | IndirectArgument::IndexBufferView
                | IndirectArgument::ConstantBufferView { .. }
                | IndirectArgument::ShaderResourceView { .. }
                | IndirectArgument::UnorderedAccessView { .. } => {
                    if let Some(address) = read_u64_le(record, cursor) {
                        resolve(address, &mut resolution.objects);
                    }
                }
                IndirectArgument::DispatchRays => {
                    let rays = record
                        .get(cursor..)
                        .and_then(DispatchRaysDesc::from_le_bytes);
                    if let Some(rays) = rays {
                        for table in rays.shader_tables() {
                            resolve(table.start_address, &mut resolution.objects);
                        }
                        resolution.dispatch_rays.push(rays);
                    }
                }
                IndirectArgument::Draw
                | IndirectArgument::DrawIndexed
                | IndirectArgument::Dispatch
                | IndirectArgument::DispatchMesh
                | IndirectArgument::Constant { .. } => {}
            }
            cursor += argument.size_bytes() as usize;
        }
    }
    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::d3d12::ResourceFlags;
    use crate::readback::MemoryReadbackDevice;

    const LIST: ObjectKey = ObjectKey(50);

    fn addresses() -> GpuAddressService {
        let mut addresses = GpuAddressService::new();
        addresses.create_resource(ObjectKey(1), 0x1000, ResourceFlags::empty());
        addresses.add_capture_address(ObjectKey(1), 0x10_0000).unwrap();
        addresses.create_resource(ObjectKey(2), 0x1000, ResourceFlags::empty());
        addresses.add_capture_address(ObjectKey(2), 0x20_0000).unwrap();
        addresses
    }

    fn cbv_signature() -> CommandSignatureDesc {
        CommandSignatureDesc {
            byte_stride: 8,
            arguments: vec![IndirectArgument::ConstantBufferView {
                root_parameter_index: 0,
            }],
        }
    }

    #[test]
    fn cbv_records_resolve_only_registered_addresses() {
        let mut bytes = Vec::new();
        bytes.extend(0x10_0040u64.to_le_bytes());
        bytes.extend(0u64.to_le_bytes());
        bytes.extend(0xdead_0000u64.to_le_bytes());
        let resolution = resolve_arguments(&cbv_signature(), &bytes, 3, &addresses());
        assert_eq!(resolution.objects.into_iter().collect::<Vec<_>>(), vec![ObjectKey(1)]);
    }

    #[test]
    fn mixed_records_skip_non_address_arguments() {
        let desc = CommandSignatureDesc {
            byte_stride: 0,
            arguments: vec![
                IndirectArgument::Constant {
                    root_parameter_index: 1,
                    dest_offset_in_32bit_values: 0,
                    num_32bit_values: 2,
                },
                IndirectArgument::VertexBufferView { slot: 0 },
                IndirectArgument::DrawIndexed,
            ],
        };
        let mut record = vec![0xffu8; 8];
        record.extend(0x20_0000u64.to_le_bytes());
        record.extend([0u8; 8]);
        record.extend([0xffu8; 20]);
        let resolution = resolve_arguments(&desc, &record, 1, &addresses());
        assert_eq!(resolution.objects.into_iter().collect::<Vec<_>>(), vec![ObjectKey(2)]);
    }

    #[test]
    fn dispatch_rays_arguments_yield_shader_tables() {
        let desc = CommandSignatureDesc {
            byte_stride: DispatchRaysDesc::SIZE_BYTES as u32,
            arguments: vec![IndirectArgument::DispatchRays],
        };
        let mut bytes = vec![0u8; DispatchRaysDesc::SIZE_BYTES];
        bytes[0..8].copy_from_slice(&0x10_0000u64.to_le_bytes());
        bytes[8..16].copy_from_slice(&64u64.to_le_bytes());
        bytes[40..48].copy_from_slice(&0x20_0100u64.to_le_bytes());
        let resolution = resolve_arguments(&desc, &bytes, 1, &addresses());
        assert_eq!(resolution.objects.len(), 2);
        assert_eq!(resolution.dispatch_rays.len(), 1);
        assert_eq!(resolution.dispatch_rays[0].hit_group_table.start_address, 0x20_0100);
    }

    #[test]
    fn count_buffer_caps_the_walk() {
        let addresses = addresses();
        let mut device = MemoryReadbackDevice::default();
        let mut bytes = Vec::new();
        bytes.extend(0x10_0000u64.to_le_bytes());
        bytes.extend(0x20_0000u64.to_le_bytes());
        device.write(ObjectKey(7), 0, &bytes);
        device.write(ObjectKey(8), 0, &1u32.to_le_bytes());
        let mut readbacks = ReadbackQueue::new(Box::new(device));

        let mut service = ExecuteIndirectService::new();
        service.create_command_signature(ObjectKey(9), cbv_signature());
        let call = IndirectCall {
            signature: ObjectKey(9),
            max_command_count: 2,
            argument_buffer: ObjectKey(7),
            argument_buffer_offset: 0,
            count_buffer: Some(ObjectKey(8)),
            count_buffer_offset: 0,
        };
        assert!(service.track(CommandKey(3), LIST, &call, &mut readbacks).unwrap());
        readbacks.submit_command_list(ObjectKey(60), LIST);

        let resolutions: Vec<IndirectResolution> = readbacks
            .flush()
            .unwrap()
            .iter()
            .filter_map(|readback| service.on_readback(readback, &addresses))
            .collect();
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].command, CommandKey(3));
        assert_eq!(
            resolutions[0].objects.iter().copied().collect::<Vec<_>>(),
            vec![ObjectKey(1)]
        );
        assert_eq!(service.pending(), 0);
    }

    #[test]
    fn unknown_signature_is_an_error() {
        let mut service = ExecuteIndirectService::new();
        let mut readbacks = ReadbackQueue::new(Box::new(MemoryReadbackDevice::default()));
        let call = IndirectCall {
            signature: ObjectKey(1),
            max_command_count: 1,
            argument_buffer: ObjectKey(2),
            argument_buffer_offset: 0,
            count_buffer: None,
            count_buffer_offset: 0,
        };
        assert!(matches!(
            service.track(CommandKey(1), LIST, &call, &mut readbacks),
            Err(AnalysisError::UnknownCommandSignature { .. })
        ));
    }
}
