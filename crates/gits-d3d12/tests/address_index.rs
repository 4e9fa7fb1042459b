use std::cmp::Reverse;

use gits_d3d12::address::{AddressIntervalIndex, AddressSpace, PlacedAllocation};
use gits_d3d12::d3d12::ResourceFlags;
use gits_d3d12::ObjectKey;
use proptest::prelude::*;

const HEAP: ObjectKey = ObjectKey(1000);
const HEAP_BASE: u64 = 0x1000_0000;
const HEAP_SIZE: u64 = 0x10_0000;
const PLAYER_DELTA: u64 = 0x8000_0000;

fn placed(key: u32, heap_offset: u64, size: u64, flags: ResourceFlags) -> PlacedAllocation {
    PlacedAllocation {
        heap: HEAP,
        key: ObjectKey(key),
        heap_offset,
        capture_address: HEAP_BASE + heap_offset,
        size,
        flags,
    }
}

fn build_heap(placements: &[(u64, u64)]) -> AddressIntervalIndex {
    let mut index = AddressIntervalIndex::new();
    index.add_heap(HEAP, HEAP_SIZE);
    for (i, &(offset, size)) in placements.iter().enumerate() {
        index
            .add_placed_allocation(placed(i as u32 + 1, offset, size, ResourceFlags::empty()))
            .unwrap();
    }
    index
}

/// Non-placed allocations laid out back to back with gaps: `(gap, size)` pairs.
fn build_linear(layout: &[(u64, u64)]) -> (AddressIntervalIndex, Vec<(ObjectKey, u64, u64)>) {
    let mut index = AddressIntervalIndex::new();
    let mut allocations = Vec::new();
    let mut cursor = 0x1_0000;
    for (i, &(gap, size)) in layout.iter().enumerate() {
        let key = ObjectKey(i as u32 + 1);
        let start = cursor + gap;
        index.add_allocation(key, start, size);
        allocations.push((key, start, size));
        cursor = start + size;
    }
    (index, allocations)
}

fn placements() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..HEAP_SIZE / 2, 1u64..0x8000), 1..24)
}

fn linear_layout() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..0x1000, 1u64..0x4000), 1..32)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn non_placed_allocations_resolve_to_their_owner(layout in linear_layout()) {
        let (index, allocations) = build_linear(&layout);
        for &(key, start, size) in &allocations {
            for probe in [start, start + size / 2, start + size - 1] {
                let record = index.query(probe, AddressSpace::Capture);
                prop_assert_eq!(record.map(|r| r.key), Some(key));
            }
        }
        let (_, last_start, last_size) = allocations[allocations.len() - 1];
        prop_assert!(index.query(last_start + last_size, AddressSpace::Capture).is_none());
    }

    #[test]
    fn mappings_are_sorted_and_disjoint(layout in linear_layout()) {
        let (mut index, allocations) = build_linear(&layout);
        for &(key, start, _) in &allocations {
            index.set_player_address(key, start + PLAYER_DELTA);
        }
        let rows = index.mappings();
        prop_assert_eq!(rows.len(), allocations.len());
        for pair in rows.windows(2) {
            prop_assert!(pair[0].capture_start + pair[0].size <= pair[1].capture_start);
        }
        for row in &rows {
            prop_assert_eq!(row.player_start, row.capture_start + PLAYER_DELTA);
        }
    }

    #[test]
    fn layers_never_hold_overlapping_allocations(placements in placements()) {
        let index = build_heap(&placements);
        let records: Vec<_> = index.records().collect();
        for a in &records {
            for b in &records {
                if a.key == b.key {
                    continue;
                }
                let overlap = a.capture_start < b.capture_end() && b.capture_start < a.capture_end();
                if overlap {
                    prop_assert_ne!(a.layer, b.layer);
                    prop_assert!(a.intersecting.contains(&b.key));
                    prop_assert!(b.intersecting.contains(&a.key));
                } else {
                    prop_assert!(!a.intersecting.contains(&b.key));
                }
            }
        }
        prop_assert!(index.layer_count() <= placements.len());
    }

    #[test]
    fn aliased_query_picks_widest_then_smallest_key(placements in placements()) {
        let index = build_heap(&placements);
        for &(offset, size) in &placements {
            let address = HEAP_BASE + offset + size / 2;
            let expected = placements
                .iter()
                .enumerate()
                .filter(|(_, &(o, s))| HEAP_BASE + o <= address && address < HEAP_BASE + o + s)
                .map(|(i, &(o, s))| (Reverse(o + s), i as u32 + 1))
                .min()
                .map(|(_, key)| ObjectKey(key));
            let first = index.query(address, AddressSpace::Capture).map(|r| r.key);
            let second = index.query(address, AddressSpace::Capture).map(|r| r.key);
            prop_assert_eq!(first, expected);
            prop_assert_eq!(first, second);
        }
    }

    #[test]
    fn destroying_the_heap_removes_every_placed_allocation(placements in placements()) {
        let mut index = build_heap(&placements);
        index.destroy(HEAP);
        prop_assert!(index.is_empty());
        for &(offset, _) in &placements {
            prop_assert!(index.query(HEAP_BASE + offset, AddressSpace::Capture).is_none());
        }
    }
}

#[test]
fn overlapping_placed_resources_follow_deny_flag() {
    for deny_second in [false, true] {
        let mut index = AddressIntervalIndex::new();
        index.add_heap(ObjectKey(1), 1000);
        let heap_base = 0x1000;
        let second_flags = if deny_second {
            ResourceFlags::DENY_SHADER_RESOURCE
        } else {
            ResourceFlags::empty()
        };
        for (key, offset, flags) in [(2, 0, ResourceFlags::empty()), (3, 50, second_flags)] {
            index
                .add_placed_allocation(PlacedAllocation {
                    heap: ObjectKey(1),
                    key: ObjectKey(key),
                    heap_offset: offset,
                    capture_address: heap_base + offset,
                    size: 100,
                    flags,
                })
                .unwrap();
        }

        let hit = index.query(heap_base + 60, AddressSpace::Capture).unwrap();
        let expected = if deny_second { ObjectKey(2) } else { ObjectKey(3) };
        assert_eq!(hit.key, expected);
        assert!(index.get(ObjectKey(2)).unwrap().intersecting.contains(&ObjectKey(3)));
        assert!(index.get(ObjectKey(3)).unwrap().intersecting.contains(&ObjectKey(2)));
    }
}

#[test]
fn duplicate_allocation_key_is_a_no_op() {
    let mut index = AddressIntervalIndex::new();
    index.add_allocation(ObjectKey(5), 0x2000, 64);
    index.add_allocation(ObjectKey(5), 0x3000, 64);
    assert!(index.query(0x3000 + 1, AddressSpace::Capture).is_none());
    assert_eq!(
        index.query(0x2000 + 1, AddressSpace::Capture).map(|r| r.key),
        Some(ObjectKey(5))
    );
    assert_eq!(index.len(), 1);
}
