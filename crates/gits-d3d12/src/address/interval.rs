use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytemuck::{Pod, Zeroable};
use tracing::{debug, warn};

use crate::d3d12::ResourceFlags;
use crate::error::AddressError;
use crate::key::ObjectKey;

/// Which of the two address spaces a query refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    /// Addresses observed while capturing.
    Capture,
    /// Addresses observed while replaying.
    Player,
}

/// One traced allocation: a resource, or a descriptor heap's handle range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationRecord {
    pub key: ObjectKey,
    pub capture_start: u64,
    /// Populated once the replay-side address has been observed.
    pub player_start: Option<u64>,
    pub size: u64,
    /// Owning heap for placed allocations.
    pub heap: Option<ObjectKey>,
    /// Index of the layer a placed allocation was assigned to.
    pub layer: Option<usize>,
    pub flags: ResourceFlags,
    /// Placed allocations whose capture range overlaps this one.
    pub intersecting: BTreeSet<ObjectKey>,
}

impl AllocationRecord {
    pub fn start(&self, space: AddressSpace) -> Option<u64> {
        match space {
            AddressSpace::Capture => Some(self.capture_start),
            AddressSpace::Player => self.player_start,
        }
    }

    pub fn end(&self, space: AddressSpace) -> Option<u64> {
        self.start(space).map(|start| start.saturating_add(self.size))
    }

    pub fn capture_end(&self) -> u64 {
        self.capture_start.saturating_add(self.size)
    }

    pub fn contains(&self, address: u64, space: AddressSpace) -> bool {
        match (self.start(space), self.end(space)) {
            (Some(start), Some(end)) => start <= address && address < end,
            _ => false,
        }
    }

    pub fn is_placed(&self) -> bool {
        self.heap.is_some()
    }

    fn denies_shader_resource(&self) -> bool {
        self.flags.contains(ResourceFlags::DENY_SHADER_RESOURCE)
    }
}

/// Aggregate address range of a heap, derived from the resources placed in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapRecord {
    pub key: ObjectKey,
    pub size: u64,
    pub capture_start: Option<u64>,
    pub player_start: Option<u64>,
}

impl HeapRecord {
    pub fn capture_end(&self) -> Option<u64> {
        self.capture_start.map(|start| start.saturating_add(self.size))
    }
}

/// Description of a resource placed inside a heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlacedAllocation {
    pub heap: ObjectKey,
    pub key: ObjectKey,
    pub heap_offset: u64,
    pub capture_address: u64,
    pub size: u64,
    pub flags: ResourceFlags,
}

/// One row of the capture->player translation table consumed by the GPU patching kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AddressMapping {
    pub capture_start: u64,
    pub player_start: u64,
    pub size: u64,
}

#[derive(Clone, Debug, Default)]
struct Layer {
    capture: BTreeMap<u64, ObjectKey>,
    player: BTreeMap<u64, ObjectKey>,
}

impl Layer {
    fn map(&self, space: AddressSpace) -> &BTreeMap<u64, ObjectKey> {
        match space {
            AddressSpace::Capture => &self.capture,
            AddressSpace::Player => &self.player,
        }
    }
}

/// Interval index from capture/player addresses to the allocation that owns them.
///
/// Non-placed allocations never overlap each other. Placed allocations may alias inside their
/// heap; they are spread over layers so that every layer stays overlap-free, and aliasing
/// allocations are linked through [`AllocationRecord::intersecting`].
#[derive(Clone, Debug, Default)]
pub struct AddressIntervalIndex {
    records: HashMap<ObjectKey, AllocationRecord>,
    capture: BTreeMap<u64, ObjectKey>,
    player: BTreeMap<u64, ObjectKey>,
    layers: Vec<Layer>,
    heaps: HashMap<ObjectKey, HeapRecord>,
    placed_by_heap: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
}

impl AddressIntervalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: ObjectKey) -> Option<&AllocationRecord> {
        self.records.get(&key)
    }

    pub fn heap(&self, key: ObjectKey) -> Option<&HeapRecord> {
        self.heaps.get(&key)
    }

    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.values()
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Register a non-placed allocation.
    ///
    /// A zero address or an already registered key is ignored: the same resource may report its
    /// address many times.
    pub fn add_allocation(&mut self, key: ObjectKey, capture_address: u64, size: u64) {
        if capture_address == 0 || self.records.contains_key(&key) {
            return;
        }
        let end = capture_address.saturating_add(size);
        let stale = overlapping(&self.capture, &self.records, capture_address, end);
        for stale_key in stale {
            warn!(
                key = %key,
                stale = %stale_key,
                capture_address,
                "allocation overlaps a live allocation; dropping the stale record"
            );
            self.remove_record(stale_key);
        }

        self.capture.insert(capture_address, key);
        self.records.insert(
            key,
            AllocationRecord {
                key,
                capture_start: capture_address,
                player_start: None,
                size,
                heap: None,
                layer: None,
                flags: ResourceFlags::empty(),
                intersecting: BTreeSet::new(),
            },
        );
    }

    /// Register a heap that placed allocations can live in.
    pub fn add_heap(&mut self, key: ObjectKey, size: u64) {
        self.heaps.entry(key).or_insert(HeapRecord {
            key,
            size,
            capture_start: None,
            player_start: None,
        });
    }

    /// Register an allocation placed inside `placed.heap`, assigning it to the first layer where
    /// it does not overlap anything and linking it with every allocation it aliases.
    pub fn add_placed_allocation(&mut self, placed: PlacedAllocation) -> Result<(), AddressError> {
        if placed.capture_address == 0 || self.records.contains_key(&placed.key) {
            return Ok(());
        }
        let heap = self
            .heaps
            .get_mut(&placed.heap)
            .ok_or(AddressError::UnknownHeap {
                heap: placed.heap,
                resource: placed.key,
            })?;
        let heap_start = placed
            .capture_address
            .checked_sub(placed.heap_offset)
            .ok_or(AddressError::HeapOffsetOutOfRange {
                heap: placed.heap,
                resource: placed.key,
                heap_offset: placed.heap_offset,
            })?;
        match heap.capture_start {
            None => heap.capture_start = Some(heap_start),
            Some(existing) if existing != heap_start => warn!(
                heap = %placed.heap,
                resource = %placed.key,
                existing,
                derived = heap_start,
                "placed resource disagrees with its heap's capture address"
            ),
            Some(_) => {}
        }

        let start = placed.capture_address;
        let end = start.saturating_add(placed.size);
        let mut assigned = None;
        let mut intersecting = BTreeSet::new();
        for (layer_index, layer) in self.layers.iter().enumerate() {
            let hits = overlapping(&layer.capture, &self.records, start, end);
            if hits.is_empty() {
                assigned.get_or_insert(layer_index);
            }
            intersecting.extend(hits);
        }
        let layer = match assigned {
            Some(layer) => layer,
            None => {
                self.layers.push(Layer::default());
                self.layers.len() - 1
            }
        };

        for other in &intersecting {
            if let Some(record) = self.records.get_mut(other) {
                record.intersecting.insert(placed.key);
            }
        }
        self.layers[layer].capture.insert(start, placed.key);
        self.placed_by_heap
            .entry(placed.heap)
            .or_default()
            .insert(placed.key);
        self.records.insert(
            placed.key,
            AllocationRecord {
                key: placed.key,
                capture_start: start,
                player_start: None,
                size: placed.size,
                heap: Some(placed.heap),
                layer: Some(layer),
                flags: placed.flags,
                intersecting,
            },
        );
        Ok(())
    }

    /// Record the replay-side address of `key`. Only the first observation counts.
    pub fn set_player_address(&mut self, key: ObjectKey, player_address: u64) {
        let Some(record) = self.records.get_mut(&key) else {
            debug!(key = %key, player_address, "player address for an untracked allocation");
            return;
        };
        if record.player_start.is_some() || player_address == 0 {
            return;
        }
        record.player_start = Some(player_address);

        match (record.heap, record.layer) {
            (Some(heap_key), Some(layer)) => {
                self.layers[layer].player.insert(player_address, key);
                let offset_in_heap = self
                    .heaps
                    .get(&heap_key)
                    .and_then(|heap| heap.capture_start)
                    .and_then(|heap_start| record.capture_start.checked_sub(heap_start));
                if let (Some(heap), Some(offset)) = (self.heaps.get_mut(&heap_key), offset_in_heap)
                {
                    if heap.player_start.is_none() {
                        heap.player_start = player_address.checked_sub(offset);
                    }
                }
            }
            _ => {
                self.player.insert(player_address, key);
            }
        }
    }

    /// Remove `key`. Destroying a heap removes every allocation placed inside it first.
    pub fn destroy(&mut self, key: ObjectKey) {
        if self.heaps.remove(&key).is_some() {
            if let Some(placed) = self.placed_by_heap.remove(&key) {
                for child in placed {
                    self.remove_record(child);
                }
            }
        }
        self.remove_record(key);
    }

    fn remove_record(&mut self, key: ObjectKey) {
        let Some(record) = self.records.remove(&key) else {
            return;
        };
        let (capture_map, player_map) = match record.layer {
            Some(layer) => {
                let layer = &mut self.layers[layer];
                (&mut layer.capture, &mut layer.player)
            }
            None => (&mut self.capture, &mut self.player),
        };
        if capture_map.get(&record.capture_start) == Some(&key) {
            capture_map.remove(&record.capture_start);
        }
        if let Some(player_start) = record.player_start {
            if player_map.get(&player_start) == Some(&key) {
                player_map.remove(&player_start);
            }
        }
        for other in &record.intersecting {
            if let Some(neighbor) = self.records.get_mut(other) {
                neighbor.intersecting.remove(&key);
            }
        }
        if let Some(heap) = record.heap {
            if let Some(placed) = self.placed_by_heap.get_mut(&heap) {
                placed.remove(&key);
            }
        }
    }

    /// Find the allocation containing `address`.
    ///
    /// Non-placed allocations are searched first, then every layer in order. When the placed
    /// hit aliases other allocations, the widest candidate (largest end address) that does not
    /// deny shader resource access wins; equal ends resolve to the smallest key.
    pub fn query(&self, address: u64, space: AddressSpace) -> Option<&AllocationRecord> {
        let map = match space {
            AddressSpace::Capture => &self.capture,
            AddressSpace::Player => &self.player,
        };
        if let Some(record) = self.lookup(map, address, space) {
            return Some(record);
        }

        let hit = self
            .layers
            .iter()
            .find_map(|layer| self.lookup(layer.map(space), address, space))?;
        if hit.intersecting.is_empty() {
            return Some(hit);
        }

        let candidates = std::iter::once(hit).chain(
            hit.intersecting
                .iter()
                .filter_map(|key| self.records.get(key))
                .filter(|record| record.contains(address, space)),
        );
        candidates.min_by_key(|record| {
            (
                record.denies_shader_resource(),
                std::cmp::Reverse(record.end(space)),
                record.key,
            )
        })
    }

    fn lookup(
        &self,
        map: &BTreeMap<u64, ObjectKey>,
        address: u64,
        space: AddressSpace,
    ) -> Option<&AllocationRecord> {
        let (_, key) = map.range(..=address).next_back()?;
        self.records
            .get(key)
            .filter(|record| record.contains(address, space))
    }

    /// Capture->player translation rows, sorted by `capture_start`.
    ///
    /// Non-placed allocations contribute one row each; placed allocations are covered by one
    /// row per heap, since every resource in a heap shares the heap's delta.
    pub fn mappings(&self) -> Vec<AddressMapping> {
        let mut rows: Vec<AddressMapping> = self
            .capture
            .values()
            .filter_map(|key| self.records.get(key))
            .filter_map(|record| {
                Some(AddressMapping {
                    capture_start: record.capture_start,
                    player_start: record.player_start?,
                    size: record.size,
                })
            })
            .collect();
        rows.extend(self.heaps.values().filter_map(|heap| {
            Some(AddressMapping {
                capture_start: heap.capture_start?,
                player_start: heap.player_start?,
                size: heap.size,
            })
        }));
        rows.sort_by_key(|row| row.capture_start);
        rows
    }
}

/// Keys in `map` whose capture range overlaps `[start, end)`.
fn overlapping(
    map: &BTreeMap<u64, ObjectKey>,
    records: &HashMap<ObjectKey, AllocationRecord>,
    start: u64,
    end: u64,
) -> Vec<ObjectKey> {
    let mut hits = Vec::new();
    if let Some((_, key)) = map.range(..start).next_back() {
        if records
            .get(key)
            .is_some_and(|record| record.capture_end() > start)
        {
            hits.push(*key);
        }
    }
    if start < end {
        hits.extend(map.range(start..end).map(|(_, key)| *key));
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAP: ObjectKey = ObjectKey(1);

    fn placed(key: u32, offset: u64, size: u64, flags: ResourceFlags) -> PlacedAllocation {
        PlacedAllocation {
            heap: HEAP,
            key: ObjectKey(key),
            heap_offset: offset,
            capture_address: 0x1000 + offset,
            size,
            flags,
        }
    }

    fn aliased_heap(r1_flags: ResourceFlags) -> AddressIntervalIndex {
        let mut index = AddressIntervalIndex::new();
        index.add_heap(HEAP, 1000);
        index
            .add_placed_allocation(placed(10, 0, 100, r1_flags))
            .unwrap();
        index
            .add_placed_allocation(placed(11, 50, 100, ResourceFlags::empty()))
            .unwrap();
        index
    }

    #[test]
    fn overlapping_placed_allocations_link_each_other() {
        let index = aliased_heap(ResourceFlags::empty());
        let r1 = index.get(ObjectKey(10)).unwrap();
        let r2 = index.get(ObjectKey(11)).unwrap();
        assert_eq!(r1.layer, Some(0));
        assert_eq!(r2.layer, Some(1));
        assert!(r1.intersecting.contains(&ObjectKey(11)));
        assert!(r2.intersecting.contains(&ObjectKey(10)));
        assert_eq!(index.heap(HEAP).unwrap().capture_start, Some(0x1000));
    }

    #[test]
    fn aliased_query_prefers_widest_allowed_view() {
        // R2 ends further out, so it wins unless it is the one denying shader access.
        let index = aliased_heap(ResourceFlags::empty());
        let hit = index.query(0x1000 + 60, AddressSpace::Capture).unwrap();
        assert_eq!(hit.key, ObjectKey(11));

        let mut index = AddressIntervalIndex::new();
        index.add_heap(HEAP, 1000);
        index
            .add_placed_allocation(placed(10, 0, 100, ResourceFlags::empty()))
            .unwrap();
        index
            .add_placed_allocation(placed(11, 50, 100, ResourceFlags::DENY_SHADER_RESOURCE))
            .unwrap();
        let hit = index.query(0x1000 + 60, AddressSpace::Capture).unwrap();
        assert_eq!(hit.key, ObjectKey(10));

        // Outside the overlap only the owner matches.
        let hit = index.query(0x1000 + 10, AddressSpace::Capture).unwrap();
        assert_eq!(hit.key, ObjectKey(10));
    }

    #[test]
    fn widest_non_denied_beats_wider_denied() {
        let mut index = AddressIntervalIndex::new();
        index.add_heap(HEAP, 1000);
        index
            .add_placed_allocation(placed(20, 0, 100, ResourceFlags::DENY_SHADER_RESOURCE))
            .unwrap();
        index
            .add_placed_allocation(placed(21, 0, 200, ResourceFlags::empty()))
            .unwrap();
        let hit = index.query(0x1000 + 50, AddressSpace::Capture).unwrap();
        assert_eq!(hit.key, ObjectKey(21));
    }

    #[test]
    fn equal_ends_pick_smallest_key() {
        let mut index = AddressIntervalIndex::new();
        index.add_heap(HEAP, 1000);
        index
            .add_placed_allocation(placed(31, 0, 100, ResourceFlags::empty()))
            .unwrap();
        index
            .add_placed_allocation(placed(30, 0, 100, ResourceFlags::empty()))
            .unwrap();
        let hit = index.query(0x1000 + 5, AddressSpace::Capture).unwrap();
        assert_eq!(hit.key, ObjectKey(30));
    }

    #[test]
    fn duplicate_key_is_ignored() {
        let mut index = AddressIntervalIndex::new();
        index.add_allocation(ObjectKey(5), 0x2000, 64);
        index.add_allocation(ObjectKey(5), 0x3000, 64);
        assert_eq!(
            index.query(0x2000 + 1, AddressSpace::Capture).unwrap().key,
            ObjectKey(5)
        );
        assert!(index.query(0x3000 + 1, AddressSpace::Capture).is_none());
    }

    #[test]
    fn zero_address_is_ignored() {
        let mut index = AddressIntervalIndex::new();
        index.add_allocation(ObjectKey(5), 0, 64);
        assert!(index.is_empty());
    }

    #[test]
    fn query_misses_gaps_and_range_end() {
        let mut index = AddressIntervalIndex::new();
        index.add_allocation(ObjectKey(1), 0x1000, 0x100);
        index.add_allocation(ObjectKey(2), 0x2000, 0x100);
        assert!(index.query(0x0fff, AddressSpace::Capture).is_none());
        assert!(index.query(0x1100, AddressSpace::Capture).is_none());
        assert_eq!(
            index.query(0x10ff, AddressSpace::Capture).unwrap().key,
            ObjectKey(1)
        );
        assert_eq!(
            index.query(0x2000, AddressSpace::Capture).unwrap().key,
            ObjectKey(2)
        );
    }

    #[test]
    fn overlapping_non_placed_allocation_evicts_stale_record() {
        let mut index = AddressIntervalIndex::new();
        index.add_allocation(ObjectKey(1), 0x1000, 0x100);
        index.add_allocation(ObjectKey(2), 0x1080, 0x100);
        assert!(index.get(ObjectKey(1)).is_none());
        assert_eq!(
            index.query(0x1090, AddressSpace::Capture).unwrap().key,
            ObjectKey(2)
        );
    }

    #[test]
    fn player_address_is_set_once_and_queryable() {
        let mut index = AddressIntervalIndex::new();
        index.add_allocation(ObjectKey(1), 0x1000, 0x100);
        index.set_player_address(ObjectKey(1), 0x9000);
        index.set_player_address(ObjectKey(1), 0xa000);
        let record = index.query(0x9010, AddressSpace::Player).unwrap();
        assert_eq!(record.player_start, Some(0x9000));
        assert!(index.query(0xa010, AddressSpace::Player).is_none());
    }

    #[test]
    fn placed_player_address_resolves_heap_start() {
        let mut index = aliased_heap(ResourceFlags::empty());
        index.set_player_address(ObjectKey(11), 0x8000 + 50);
        let heap = index.heap(HEAP).unwrap();
        assert_eq!(heap.player_start, Some(0x8000));
        assert_eq!(heap.capture_end(), Some(0x1000 + 1000));
        assert_eq!(
            index.mappings(),
            vec![AddressMapping {
                capture_start: 0x1000,
                player_start: 0x8000,
                size: 1000
            }]
        );
    }

    #[test]
    fn destroying_heap_cascades_to_placed_allocations() {
        let mut index = aliased_heap(ResourceFlags::empty());
        let other_heap = ObjectKey(2);
        index.add_heap(other_heap, 4096);
        index
            .add_placed_allocation(PlacedAllocation {
                heap: other_heap,
                key: ObjectKey(40),
                heap_offset: 0,
                capture_address: 0x1000 + 60,
                size: 8,
                flags: ResourceFlags::empty(),
            })
            .unwrap();
        assert!(index
            .get(ObjectKey(40))
            .unwrap()
            .intersecting
            .contains(&ObjectKey(10)));

        index.destroy(HEAP);
        assert!(index.get(ObjectKey(10)).is_none());
        assert!(index.get(ObjectKey(11)).is_none());
        assert!(index.heap(HEAP).is_none());
        assert!(index.get(ObjectKey(40)).unwrap().intersecting.is_empty());
        assert!(index.query(0x1000 + 10, AddressSpace::Capture).is_none());
    }

    #[test]
    fn placed_allocation_requires_known_heap() {
        let mut index = AddressIntervalIndex::new();
        let err = index
            .add_placed_allocation(placed(10, 0, 100, ResourceFlags::empty()))
            .unwrap_err();
        assert!(matches!(err, AddressError::UnknownHeap { .. }));
    }

    #[test]
    fn mappings_are_sorted_and_skip_unresolved() {
        let mut index = AddressIntervalIndex::new();
        index.add_allocation(ObjectKey(3), 0x3000, 0x10);
        index.add_allocation(ObjectKey(1), 0x1000, 0x10);
        index.add_allocation(ObjectKey(2), 0x2000, 0x10);
        index.set_player_address(ObjectKey(3), 0x30);
        index.set_player_address(ObjectKey(1), 0x10);
        let starts: Vec<u64> = index.mappings().iter().map(|m| m.capture_start).collect();
        assert_eq!(starts, vec![0x1000, 0x3000]);
    }
}
