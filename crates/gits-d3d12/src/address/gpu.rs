use std::collections::HashMap;

use tracing::debug;

use super::interval::{
    AddressIntervalIndex, AddressMapping, AddressSpace, AllocationRecord, PlacedAllocation,
};
use crate::d3d12::ResourceFlags;
use crate::error::AddressError;
use crate::key::ObjectKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingResource {
    size: u64,
    flags: ResourceFlags,
    placement: Option<(ObjectKey, u64)>,
}

/// GPU virtual address bookkeeping for resources and heaps.
///
/// Resources are announced when created; their address range becomes queryable once the
/// address itself is observed (`GetGPUVirtualAddress` while capturing or replaying).
#[derive(Clone, Debug, Default)]
pub struct GpuAddressService {
    index: AddressIntervalIndex,
    resources: HashMap<ObjectKey, PendingResource>,
}

impl GpuAddressService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self) -> &AddressIntervalIndex {
        &self.index
    }

    pub fn create_heap(&mut self, heap: ObjectKey, size: u64) {
        self.index.add_heap(heap, size);
    }

    pub fn create_resource(&mut self, resource: ObjectKey, size: u64, flags: ResourceFlags) {
        self.resources.insert(
            resource,
            PendingResource {
                size,
                flags,
                placement: None,
            },
        );
    }

    pub fn create_placed_resource(
        &mut self,
        heap: ObjectKey,
        heap_offset: u64,
        resource: ObjectKey,
        size: u64,
        flags: ResourceFlags,
    ) {
        self.resources.insert(
            resource,
            PendingResource {
                size,
                flags,
                placement: Some((heap, heap_offset)),
            },
        );
    }

    /// Record the capture-time address of `resource`.
    pub fn add_capture_address(
        &mut self,
        resource: ObjectKey,
        address: u64,
    ) -> Result<(), AddressError> {
        let Some(pending) = self.resources.get(&resource).copied() else {
            debug!(resource = %resource, address, "capture address for an unknown resource");
            return Ok(());
        };
        match pending.placement {
            Some((heap, heap_offset)) => self.index.add_placed_allocation(PlacedAllocation {
                heap,
                key: resource,
                heap_offset,
                capture_address: address,
                size: pending.size,
                flags: pending.flags,
            }),
            None => {
                self.index.add_allocation(resource, address, pending.size);
                Ok(())
            }
        }
    }

    /// Record the replay-time address of `resource`.
    pub fn add_player_address(&mut self, resource: ObjectKey, address: u64) {
        self.index.set_player_address(resource, address);
    }

    pub fn destroy(&mut self, key: ObjectKey) {
        self.resources.remove(&key);
        self.index.destroy(key);
    }

    pub fn query(&self, address: u64, space: AddressSpace) -> Option<&AllocationRecord> {
        self.index.query(address, space)
    }

    /// Resolve a capture address to `(resource, offset into resource)`.
    pub fn resolve(&self, capture_address: u64) -> Option<(ObjectKey, u64)> {
        if capture_address == 0 {
            return None;
        }
        let record = self.index.query(capture_address, AddressSpace::Capture)?;
        Some((record.key, capture_address - record.capture_start))
    }

    /// Translate a capture address to the replay address space.
    pub fn translate(&self, capture_address: u64) -> Option<u64> {
        let record = self.index.query(capture_address, AddressSpace::Capture)?;
        let player_start = record.player_start?;
        Some(player_start + (capture_address - record.capture_start))
    }

    pub fn mappings(&self) -> Vec<AddressMapping> {
        self.index.mappings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_resource_translates_after_both_addresses_are_known() {
        let mut service = GpuAddressService::new();
        service.create_resource(ObjectKey(7), 256, ResourceFlags::empty());
        service.add_capture_address(ObjectKey(7), 0x10_0000).unwrap();
        assert_eq!(service.resolve(0x10_0010), Some((ObjectKey(7), 0x10)));
        assert_eq!(service.translate(0x10_0010), None);

        service.add_player_address(ObjectKey(7), 0x20_0000);
        assert_eq!(service.translate(0x10_0010), Some(0x20_0010));
    }

    #[test]
    fn placed_resources_go_through_their_heap() {
        let mut service = GpuAddressService::new();
        service.create_heap(ObjectKey(1), 0x10000);
        service.create_placed_resource(
            ObjectKey(1),
            0x100,
            ObjectKey(2),
            0x100,
            ResourceFlags::empty(),
        );
        service.add_capture_address(ObjectKey(2), 0x5100).unwrap();
        service.add_player_address(ObjectKey(2), 0x9100);
        assert_eq!(service.translate(0x5180), Some(0x9180));
        assert_eq!(
            service.mappings(),
            vec![AddressMapping {
                capture_start: 0x5000,
                player_start: 0x9000,
                size: 0x10000
            }]
        );

        service.destroy(ObjectKey(1));
        assert_eq!(service.resolve(0x5180), None);
    }

    #[test]
    fn null_address_never_resolves() {
        let service = GpuAddressService::new();
        assert_eq!(service.resolve(0), None);
    }
}
