use std::collections::HashMap;

use tracing::{debug, warn};

use super::interval::{AddressIntervalIndex, AddressMapping, AddressSpace};
use crate::d3d12::DescriptorHeapKind;
use crate::error::AddressError;
use crate::key::{DescriptorSlot, ObjectKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Cpu,
    Gpu,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    pub key: ObjectKey,
    pub kind: DescriptorHeapKind,
    pub num_descriptors: u32,
    /// Descriptor handle increment on the capturing device.
    pub capture_increment: u32,
    /// Descriptor handle increment on the replaying device, once known.
    pub player_increment: Option<u32>,
}

/// Descriptor heap handle bookkeeping: maps CPU and GPU descriptor handles to heap slots and
/// translates capture handles into replay handles.
#[derive(Clone, Debug, Default)]
pub struct DescriptorHandleService {
    heaps: HashMap<ObjectKey, DescriptorHeapInfo>,
    cpu: AddressIntervalIndex,
    gpu: AddressIntervalIndex,
}

impl DescriptorHandleService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_heap(
        &mut self,
        heap: ObjectKey,
        kind: DescriptorHeapKind,
        num_descriptors: u32,
        capture_increment: u32,
    ) {
        self.heaps.insert(
            heap,
            DescriptorHeapInfo {
                key: heap,
                kind,
                num_descriptors,
                capture_increment,
                player_increment: None,
            },
        );
    }

    pub fn heap(&self, heap: ObjectKey) -> Option<&DescriptorHeapInfo> {
        self.heaps.get(&heap)
    }

    fn index_mut(&mut self, kind: HandleKind) -> &mut AddressIntervalIndex {
        match kind {
            HandleKind::Cpu => &mut self.cpu,
            HandleKind::Gpu => &mut self.gpu,
        }
    }

    fn index(&self, kind: HandleKind) -> &AddressIntervalIndex {
        match kind {
            HandleKind::Cpu => &self.cpu,
            HandleKind::Gpu => &self.gpu,
        }
    }

    /// Record the capture-time start handle of `heap`.
    pub fn add_capture_start(
        &mut self,
        heap: ObjectKey,
        kind: HandleKind,
        handle: u64,
    ) -> Result<(), AddressError> {
        let info = self
            .heaps
            .get(&heap)
            .ok_or(AddressError::UnknownDescriptorHeap(heap))?;
        let size = u64::from(info.num_descriptors) * u64::from(info.capture_increment);
        self.index_mut(kind).add_allocation(heap, handle, size);
        Ok(())
    }

    /// Record the replay-time start handle of `heap` and the replaying device's increment.
    pub fn add_player_start(
        &mut self,
        heap: ObjectKey,
        kind: HandleKind,
        handle: u64,
        player_increment: u32,
    ) -> Result<(), AddressError> {
        let info = self
            .heaps
            .get_mut(&heap)
            .ok_or(AddressError::UnknownDescriptorHeap(heap))?;
        info.player_increment.get_or_insert(player_increment);
        self.index_mut(kind).set_player_address(heap, handle);
        Ok(())
    }

    pub fn destroy(&mut self, heap: ObjectKey) {
        self.heaps.remove(&heap);
        self.cpu.destroy(heap);
        self.gpu.destroy(heap);
    }

    /// Resolve a capture-time handle to the descriptor slot it addresses.
    pub fn resolve(&self, kind: HandleKind, handle: u64) -> Option<DescriptorSlot> {
        let record = self.index(kind).query(handle, AddressSpace::Capture)?;
        let info = self.heaps.get(&record.key)?;
        if info.capture_increment == 0 {
            return None;
        }
        let index = (handle - record.capture_start) / u64::from(info.capture_increment);
        Some(DescriptorSlot::new(record.key, index as u32))
    }

    /// Translate a capture-time handle into the replay handle addressing the same slot.
    pub fn translate(&self, kind: HandleKind, handle: u64) -> Option<u64> {
        let record = self.index(kind).query(handle, AddressSpace::Capture)?;
        let info = self.heaps.get(&record.key)?;
        let player_start = record.player_start?;
        let player_increment = info.player_increment?;
        if info.capture_increment == 0 {
            return None;
        }
        let offset = handle - record.capture_start;
        let index = offset / u64::from(info.capture_increment);
        let remainder = offset % u64::from(info.capture_increment);
        if remainder != 0 {
            debug!(heap = %record.key, handle, "descriptor handle not aligned to a slot");
        }
        Some(player_start + index * u64::from(player_increment))
    }

    /// Linear capture->player rows for GPU handles.
    ///
    /// Heaps whose increments differ between capture and replay cannot be patched with a
    /// linear delta and are left out.
    pub fn gpu_mappings(&self) -> Vec<AddressMapping> {
        self.gpu
            .mappings()
            .into_iter()
            .filter(|row| {
                let Some(record) = self.gpu.query(row.capture_start, AddressSpace::Capture) else {
                    return false;
                };
                let Some(info) = self.heaps.get(&record.key) else {
                    return false;
                };
                let linear = info.player_increment == Some(info.capture_increment);
                if !linear {
                    warn!(
                        heap = %record.key,
                        capture_increment = info.capture_increment,
                        player_increment = ?info.player_increment,
                        "descriptor heap increments differ; handles need per-slot translation"
                    );
                }
                linear
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> DescriptorHandleService {
        let mut service = DescriptorHandleService::new();
        service.create_heap(ObjectKey(3), DescriptorHeapKind::CbvSrvUav, 16, 32);
        service
            .add_capture_start(ObjectKey(3), HandleKind::Gpu, 0x4000)
            .unwrap();
        service
            .add_capture_start(ObjectKey(3), HandleKind::Cpu, 0x7000)
            .unwrap();
        service
    }

    #[test]
    fn handles_resolve_to_slots() {
        let service = service();
        assert_eq!(
            service.resolve(HandleKind::Gpu, 0x4000 + 5 * 32),
            Some(DescriptorSlot::new(ObjectKey(3), 5))
        );
        assert_eq!(
            service.resolve(HandleKind::Cpu, 0x7000 + 15 * 32),
            Some(DescriptorSlot::new(ObjectKey(3), 15))
        );
        assert_eq!(service.resolve(HandleKind::Gpu, 0x4000 + 16 * 32), None);
    }

    #[test]
    fn translation_honors_player_increment() {
        let mut service = service();
        service
            .add_player_start(ObjectKey(3), HandleKind::Gpu, 0x9000, 64)
            .unwrap();
        assert_eq!(
            service.translate(HandleKind::Gpu, 0x4000 + 2 * 32),
            Some(0x9000 + 2 * 64)
        );
        assert!(service.gpu_mappings().is_empty());
    }

    #[test]
    fn unknown_heap_is_an_error() {
        let mut service = DescriptorHandleService::new();
        assert!(matches!(
            service.add_capture_start(ObjectKey(1), HandleKind::Cpu, 0x10),
            Err(AddressError::UnknownDescriptorHeap(ObjectKey(1)))
        ));
    }
}
