//! Contents of every descriptor slot, as last written by `Create*View` or `CopyDescriptors`.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::address::GpuAddressService;
use crate::d3d12::ViewDesc;
use crate::key::{DescriptorSlot, ObjectKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    ConstantBuffer,
    ShaderResource,
    AccelerationStructure,
    UnorderedAccess,
    RenderTarget,
    DepthStencil,
    Sampler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorState {
    pub kind: DescriptorKind,
    pub resource: Option<ObjectKey>,
    /// UAV counter buffer.
    pub counter_resource: Option<ObjectKey>,
    /// Capture GPU address of the acceleration structure an SRV points at.
    pub acceleration_structure: Option<u64>,
}

impl DescriptorState {
    /// Build the state for `desc`. Constant buffer views carry only a GPU address, which is
    /// resolved to its resource here while the address is still live.
    pub fn from_view(desc: &ViewDesc, addresses: &GpuAddressService) -> Self {
        let state = |kind, resource| Self {
            kind,
            resource,
            counter_resource: None,
            acceleration_structure: None,
        };
        match *desc {
            ViewDesc::ConstantBuffer {
                buffer_location, ..
            } => {
                let resource = addresses.resolve(buffer_location).map(|(key, _)| key);
                if resource.is_none() && buffer_location != 0 {
                    debug!(address = buffer_location, "constant buffer view address not found");
                }
                state(DescriptorKind::ConstantBuffer, resource)
            }
            ViewDesc::ShaderResource { resource } => state(DescriptorKind::ShaderResource, resource),
            ViewDesc::AccelerationStructure { location } => Self {
                acceleration_structure: Some(location),
                ..state(DescriptorKind::AccelerationStructure, None)
            },
            ViewDesc::UnorderedAccess {
                resource,
                counter_resource,
            } => Self {
                counter_resource,
                ..state(DescriptorKind::UnorderedAccess, resource)
            },
            ViewDesc::RenderTarget { resource } => state(DescriptorKind::RenderTarget, resource),
            ViewDesc::DepthStencil { resource } => state(DescriptorKind::DepthStencil, resource),
            ViewDesc::Sampler => state(DescriptorKind::Sampler, None),
        }
    }

    pub fn resources(&self) -> impl Iterator<Item = ObjectKey> {
        self.resource.into_iter().chain(self.counter_resource)
    }
}

/// Slot-level view of every descriptor heap.
#[derive(Clone, Debug, Default)]
pub struct DescriptorService {
    heaps: HashMap<ObjectKey, HeapSlots>,
}

#[derive(Clone, Debug, Default)]
struct HeapSlots {
    num_descriptors: u32,
    slots: BTreeMap<u32, DescriptorState>,
}

impl DescriptorService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_heap(&mut self, heap: ObjectKey, num_descriptors: u32) {
        self.heaps.insert(
            heap,
            HeapSlots {
                num_descriptors,
                slots: BTreeMap::new(),
            },
        );
    }

    pub fn destroy_heap(&mut self, heap: ObjectKey) {
        self.heaps.remove(&heap);
    }

    pub fn num_descriptors(&self, heap: ObjectKey) -> Option<u32> {
        self.heaps.get(&heap).map(|slots| slots.num_descriptors)
    }

    /// Write one slot. Out-of-range indices are ignored.
    pub fn write(&mut self, slot: DescriptorSlot, state: DescriptorState) -> bool {
        let Some(heap) = self.heaps.get_mut(&slot.heap) else {
            debug!(heap = %slot.heap, "descriptor write into unknown heap");
            return false;
        };
        if slot.index >= heap.num_descriptors {
            debug!(heap = %slot.heap, index = slot.index, "descriptor write past end of heap");
            return false;
        }
        heap.slots.insert(slot.index, state);
        true
    }

    pub fn get(&self, slot: DescriptorSlot) -> Option<&DescriptorState> {
        self.heaps.get(&slot.heap)?.slots.get(&slot.index)
    }

    /// Indices of every written slot of `heap`, ascending.
    pub fn populated(&self, heap: ObjectKey) -> impl Iterator<Item = u32> + '_ {
        self.heaps
            .get(&heap)
            .into_iter()
            .flat_map(|slots| slots.slots.keys().copied())
    }

    /// `CopyDescriptorsSimple`: copy `count` consecutive slots. Empty source slots clear the
    /// destination.
    pub fn copy(&mut self, dest: DescriptorSlot, src: DescriptorSlot, count: u32) {
        let copied: Vec<Option<DescriptorState>> = (0..count)
            .map(|i| {
                let index = src.index.checked_add(i)?;
                self.get(DescriptorSlot::new(src.heap, index)).copied()
            })
            .collect();
        let Some(heap) = self.heaps.get_mut(&dest.heap) else {
            debug!(heap = %dest.heap, "descriptor copy into unknown heap");
            return;
        };
        for (i, state) in (0u32..).zip(copied) {
            let Some(index) = dest.index.checked_add(i) else {
                break;
            };
            if index >= heap.num_descriptors {
                break;
            }
            match state {
                Some(state) => heap.slots.insert(index, state),
                None => heap.slots.remove(&index),
            };
        }
    }

    /// `CopyDescriptors`: destination and source are lists of `(start, count)` ranges that are
    /// walked in lockstep; the total counts are expected to match.
    pub fn copy_ranges(
        &mut self,
        dest: &[(DescriptorSlot, u32)],
        src: &[(DescriptorSlot, u32)],
    ) {
        let expand = |ranges: &[(DescriptorSlot, u32)]| -> Vec<DescriptorSlot> {
            ranges
                .iter()
                .flat_map(|&(start, count)| {
                    (0..count).filter_map(move |i| {
                        Some(DescriptorSlot::new(start.heap, start.index.checked_add(i)?))
                    })
                })
                .collect()
        };
        for (dest, src) in expand(dest).into_iter().zip(expand(src)) {
            self.copy(dest, src, 1);
        }
    }
}
