//! Capture->player translation during replay.
//!
//! Replay feeds the same command stream it is executing, now carrying the values the replaying
//! device returned (`player_*` fields). Raw addresses and handles embedded in buffers the CPU
//! never sees decoded (indirect arguments, shader tables) are patched on the GPU through the
//! sorted tables built here; [`patch_gpu_addresses`] and [`patch_shader_identifiers`] are the
//! CPU rendition of that kernel.

use std::collections::HashMap;

use tracing::debug;

use crate::address::{AddressMapping, DescriptorHandleService, GpuAddressService, HandleKind};
use crate::command::{Command, CommandRecord};
use crate::d3d12::SHADER_IDENTIFIER_SIZE;
use crate::error::AddressError;
use crate::key::ObjectKey;
use crate::shader_identifier::{ShaderIdentifier, ShaderIdentifierMapping, ShaderIdentifierRegistry};

#[derive(Debug)]
pub struct ReplayTranslator {
    addresses: GpuAddressService,
    handles: DescriptorHandleService,
    shader_identifiers: ShaderIdentifierRegistry,
    player_increments: HashMap<ObjectKey, u32>,
}

impl ReplayTranslator {
    pub fn new(dump_lookup: bool) -> Self {
        Self {
            addresses: GpuAddressService::new(),
            handles: DescriptorHandleService::new(),
            shader_identifiers: ShaderIdentifierRegistry::new(dump_lookup),
            player_increments: HashMap::new(),
        }
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

    /// Learn whatever `record` tells about either address space. Commands without addresses,
    /// handles or identifiers are ignored.
    pub fn process(&mut self, record: &CommandRecord) -> Result<(), AddressError> {
        match &record.command {
            Command::CreateHeap { heap, size } => self.addresses.create_heap(*heap, *size),
            Command::CreateCommittedResource {
                resource,
                size,
                flags,
            } => self.addresses.create_resource(*resource, *size, *flags),
            Command::CreatePlacedResource {
                resource,
                heap,
                heap_offset,
                size,
                flags,
            } => self
                .addresses
                .create_placed_resource(*heap, *heap_offset, *resource, *size, *flags),
            Command::GetGpuVirtualAddress {
                resource,
                address,
                player_address,
            } => {
                self.addresses.add_capture_address(*resource, *address)?;
                if let Some(player_address) = player_address {
                    self.addresses.add_player_address(*resource, *player_address);
                }
            }
            Command::CreateDescriptorHeap {
                heap,
                kind,
                num_descriptors,
                increment,
                player_increment,
            } => {
                self.handles
                    .create_heap(*heap, *kind, *num_descriptors, *increment);
                self.player_increments
                    .insert(*heap, player_increment.unwrap_or(*increment));
            }
            Command::GetCpuDescriptorHandleForHeapStart {
                heap,
                handle,
                player_handle,
            } => self.heap_start(*heap, HandleKind::Cpu, *handle, *player_handle)?,
            Command::GetGpuDescriptorHandleForHeapStart {
                heap,
                handle,
                player_handle,
            } => self.heap_start(*heap, HandleKind::Gpu, *handle, *player_handle)?,
            Command::GetShaderIdentifier {
                export_name,
                identifier,
                player_identifier,
                ..
            } => {
                self.shader_identifiers
                    .add_capture(record.key, *identifier, export_name);
                if let Some(player) = player_identifier {
                    self.shader_identifiers
                        .add_player(record.key, *player, export_name);
                }
            }
            Command::Release { object } => {
                self.addresses.destroy(*object);
                if self.player_increments.remove(object).is_some() {
                    self.handles.destroy(*object);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn heap_start(
        &mut self,
        heap: ObjectKey,
        kind: HandleKind,
        handle: u64,
        player_handle: Option<u64>,
    ) -> Result<(), AddressError> {
        self.handles.add_capture_start(heap, kind, handle)?;
        let Some(player_handle) = player_handle else {
            return Ok(());
        };
        let increment = self
            .player_increments
            .get(&heap)
            .copied()
            .ok_or(AddressError::UnknownDescriptorHeap(heap))?;
        self.handles
            .add_player_start(heap, kind, player_handle, increment)
    }

    pub fn translate_gpu_address(&self, capture_address: u64) -> Option<u64> {
        if capture_address == 0 {
            return Some(0);
        }
        self.addresses.translate(capture_address)
    }

    pub fn translate_cpu_handle(&self, capture_handle: u64) -> Option<u64> {
        self.handles.translate(HandleKind::Cpu, capture_handle)
    }

    pub fn translate_gpu_handle(&self, capture_handle: u64) -> Option<u64> {
        self.handles.translate(HandleKind::Gpu, capture_handle)
    }

    pub fn translate_shader_identifier(
        &self,
        capture: &ShaderIdentifier,
    ) -> Option<ShaderIdentifier> {
        self.shader_identifiers.translate(capture)
    }

    /// The GPU virtual address patch table, sorted by capture start.
    pub fn address_table(&self) -> Vec<AddressMapping> {
        let mut rows = self.addresses.mappings();
        rows.sort_by_key(|row| row.capture_start);
        rows
    }

    /// The GPU descriptor handle patch table, sorted by capture start.
    ///
    /// Handles and virtual addresses are separate spaces whose ranges may coincide, so each
    /// gets its own table.
    pub fn handle_table(&self) -> Vec<AddressMapping> {
        let mut rows = self.handles.gpu_mappings();
        rows.sort_by_key(|row| row.capture_start);
        rows
    }

    pub fn shader_identifier_table(&self) -> Vec<ShaderIdentifierMapping> {
        self.shader_identifiers.mappings()
    }

    /// `address_table` laid out as the patch kernel reads it.
    pub fn address_table_bytes(&self) -> Vec<u8> {
        let rows = self.address_table();
        bytemuck::cast_slice(rows.as_slice()).to_vec()
    }

    pub fn handle_table_bytes(&self) -> Vec<u8> {
        let rows = self.handle_table();
        bytemuck::cast_slice(rows.as_slice()).to_vec()
    }

    pub fn shader_identifier_table_bytes(&self) -> Vec<u8> {
        let rows = self.shader_identifier_table();
        bytemuck::cast_slice(rows.as_slice()).to_vec()
    }
}

fn lookup(table: &[AddressMapping], value: u64) -> Option<&AddressMapping> {
    let index = table.partition_point(|row| row.capture_start <= value);
    let row = table.get(index.checked_sub(1)?)?;
    (value - row.capture_start < row.size).then_some(row)
}

/// Rewrite every value found in `table` to its player value. `table` is one of
/// [`ReplayTranslator::address_table`] or [`ReplayTranslator::handle_table`]. Zero and unknown
/// values are left alone. Returns the number of patched values.
pub fn patch_gpu_addresses(table: &[AddressMapping], values: &mut [u64]) -> usize {
    let mut patched = 0;
    for value in values.iter_mut().filter(|value| **value != 0) {
        if let Some(row) = lookup(table, *value) {
            *value = row.player_start + (*value - row.capture_start);
            patched += 1;
        }
    }
    patched
}

/// Rewrite the shader identifier at the start of every `stride`-byte record of `records`.
/// Returns the number of patched records.
pub fn patch_shader_identifiers(
    table: &[ShaderIdentifierMapping],
    records: &mut [u8],
    stride: usize,
) -> usize {
    if stride < SHADER_IDENTIFIER_SIZE {
        return 0;
    }
    let mut patched = 0;
    for record in records.chunks_mut(stride) {
        let Some(capture) = ShaderIdentifier::read(record) else {
            continue;
        };
        if capture.is_zero() {
            continue;
        }
        let words = capture.words();
        match table.binary_search_by_key(&words, |row| row.capture.words()) {
            Ok(index) => {
                record[..SHADER_IDENTIFIER_SIZE].copy_from_slice(&table[index].player.0);
                patched += 1;
            }
            Err(_) => debug!(identifier = ?capture, "shader identifier not in patch table"),
        }
    }
    patched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::d3d12::{DescriptorHeapKind, ResourceFlags};
    use pretty_assertions::assert_eq;

    fn id(byte: u8) -> ShaderIdentifier {
        ShaderIdentifier([byte; SHADER_IDENTIFIER_SIZE])
    }

    fn feed(translator: &mut ReplayTranslator, commands: Vec<Command>) {
        for (key, command) in commands.into_iter().enumerate() {
            translator
                .process(&CommandRecord::new(key as u64 + 1, command))
                .unwrap();
        }
    }

    fn translator() -> ReplayTranslator {
        let mut translator = ReplayTranslator::new(true);
        feed(
            &mut translator,
            vec![
                Command::CreateCommittedResource {
                    resource: ObjectKey(1),
                    size: 0x1000,
                    flags: ResourceFlags::empty(),
                },
                Command::GetGpuVirtualAddress {
                    resource: ObjectKey(1),
                    address: 0x10_0000,
                    player_address: Some(0x90_0000),
                },
                Command::CreateHeap {
                    heap: ObjectKey(2),
                    size: 0x10000,
                },
                Command::CreatePlacedResource {
                    resource: ObjectKey(3),
                    heap: ObjectKey(2),
                    heap_offset: 0x2000,
                    size: 0x1000,
                    flags: ResourceFlags::empty(),
                },
                Command::GetGpuVirtualAddress {
                    resource: ObjectKey(3),
                    address: 0x40_2000,
                    player_address: Some(0x70_2000),
                },
                Command::CreateDescriptorHeap {
                    heap: ObjectKey(4),
                    kind: DescriptorHeapKind::CbvSrvUav,
                    num_descriptors: 16,
                    increment: 32,
                    player_increment: Some(64),
                },
                Command::GetCpuDescriptorHandleForHeapStart {
                    heap: ObjectKey(4),
                    handle: 0x1000,
                    player_handle: Some(0x8000),
                },
                Command::GetShaderIdentifier {
                    state_object: ObjectKey(5),
                    export_name: "RayGen".to_string(),
                    identifier: id(0xaa),
                    player_identifier: Some(id(0x11)),
                },
                Command::GetShaderIdentifier {
                    state_object: ObjectKey(5),
                    export_name: "Miss".to_string(),
                    identifier: id(0x33),
                    player_identifier: Some(id(0x22)),
                },
            ],
        );
        translator
    }

    #[test]
    fn translates_committed_and_placed_addresses() {
        let translator = translator();
        assert_eq!(translator.translate_gpu_address(0x10_0010), Some(0x90_0010));
        assert_eq!(translator.translate_gpu_address(0x40_2800), Some(0x70_2800));
        assert_eq!(translator.translate_gpu_address(0), Some(0));
        assert_eq!(translator.translate_gpu_address(0x20_0000), None);
    }

    #[test]
    fn translates_handles_across_increment_sizes() {
        let translator = translator();
        assert_eq!(translator.translate_cpu_handle(0x1000 + 3 * 32), Some(0x8000 + 3 * 64));
        assert_eq!(translator.translate_gpu_handle(0x1000), None);
    }

    #[test]
    fn translates_shader_identifiers_and_keeps_export_names() {
        let translator = translator();
        assert_eq!(translator.translate_shader_identifier(&id(0xaa)), Some(id(0x11)));
        assert_eq!(
            translator.shader_identifiers().capture_export_name(&id(0x33)),
            Some("Miss")
        );
    }

    #[test]
    fn address_table_is_sorted_and_patches_buffers() {
        let translator = translator();
        let table = translator.address_table();
        assert!(table
            .windows(2)
            .all(|pair| pair[0].capture_start < pair[1].capture_start));

        let mut values = [0x10_0008, 0, 0x40_2000, 0x20_0000];
        assert_eq!(patch_gpu_addresses(&table, &mut values), 2);
        assert_eq!(values, [0x90_0008, 0, 0x70_2000, 0x20_0000]);
    }

    fn disjoint(table: &[AddressMapping]) -> bool {
        table
            .windows(2)
            .all(|pair| pair[0].capture_start + pair[0].size <= pair[1].capture_start)
    }

    #[test]
    fn addresses_and_handles_get_separate_tables() {
        let mut translator = ReplayTranslator::new(false);
        feed(
            &mut translator,
            vec![
                Command::CreateCommittedResource {
                    resource: ObjectKey(1),
                    size: 0x1000,
                    flags: ResourceFlags::empty(),
                },
                Command::GetGpuVirtualAddress {
                    resource: ObjectKey(1),
                    address: 0x10_0000,
                    player_address: Some(0x90_0000),
                },
                Command::CreateDescriptorHeap {
                    heap: ObjectKey(2),
                    kind: DescriptorHeapKind::CbvSrvUav,
                    num_descriptors: 64,
                    increment: 32,
                    player_increment: Some(32),
                },
                // Inside the resource's capture range.
                Command::GetGpuDescriptorHandleForHeapStart {
                    heap: ObjectKey(2),
                    handle: 0x10_0400,
                    player_handle: Some(0x50_0000),
                },
            ],
        );

        let addresses = translator.address_table();
        let handles = translator.handle_table();
        assert_eq!(addresses.len(), 1);
        assert_eq!(handles.len(), 1);
        assert!(disjoint(&addresses));
        assert!(disjoint(&handles));

        let mut values = [0x10_0400];
        assert_eq!(patch_gpu_addresses(&addresses, &mut values), 1);
        assert_eq!(values, [0x90_0400]);
        let mut values = [0x10_0400];
        assert_eq!(patch_gpu_addresses(&handles, &mut values), 1);
        assert_eq!(values, [0x50_0000]);
        assert_eq!(translator.translate_gpu_handle(0x10_0420), Some(0x50_0020));
    }

    #[test]
    fn table_bytes_match_row_layout() {
        let translator = translator();
        let bytes = translator.address_table_bytes();
        assert_eq!(bytes.len(), translator.address_table().len() * 24);
        assert_eq!(&bytes[..8], &translator.address_table()[0].capture_start.to_le_bytes());
    }

    #[test]
    fn patches_identifiers_in_shader_records() {
        let translator = translator();
        let table = translator.shader_identifier_table();
        let stride = 64;
        let mut records = vec![0u8; stride * 3];
        records[..32].copy_from_slice(&id(0xaa).0);
        records[32..40].copy_from_slice(&0x10_0000u64.to_le_bytes());
        records[stride..stride + 32].copy_from_slice(&id(0x33).0);
        records[2 * stride..2 * stride + 32].copy_from_slice(&id(0x77).0);

        assert_eq!(patch_shader_identifiers(&table, &mut records, stride), 2);
        assert_eq!(&records[..32], &id(0x11).0);
        assert_eq!(&records[32..40], &0x10_0000u64.to_le_bytes());
        assert_eq!(&records[stride..stride + 32], &id(0x22).0);
        assert_eq!(&records[2 * stride..2 * stride + 32], &id(0x77).0);
    }
}
