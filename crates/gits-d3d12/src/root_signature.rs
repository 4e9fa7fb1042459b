//! Root signature layouts and descriptor-table range resolution.

use std::collections::{HashMap, HashSet};

use crate::d3d12::{
    DescriptorRangeKind, RootParameter, RootSignatureDesc, DESCRIPTOR_RANGE_OFFSET_APPEND,
};
use crate::error::RootSignatureError;
use crate::key::ObjectKey;

/// Descriptor indices a table binding makes live that were not reported before.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescriptorTableIndexes {
    /// Heap indices covered by bounded ranges.
    pub indexes: Vec<u32>,
    /// Set when the table has an unbounded range: any slot of the heap may be read.
    pub unbounded: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RootSignatureService {
    signatures: HashMap<ObjectKey, RootSignatureDesc>,
    /// `(heap, range start) -> length` of the prefix already reported.
    bounded_retrieved: HashMap<(ObjectKey, u32), u32>,
    unbounded_retrieved: HashSet<(ObjectKey, u32)>,
}

impl RootSignatureService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, root_signature: ObjectKey, desc: RootSignatureDesc) {
        self.signatures.insert(root_signature, desc);
    }

    pub fn get(&self, root_signature: ObjectKey) -> Option<&RootSignatureDesc> {
        self.signatures.get(&root_signature)
    }

    pub fn destroy(&mut self, root_signature: ObjectKey) {
        self.signatures.remove(&root_signature);
    }

    /// Forget what was reported for `heap`; called whenever one of its slots is rewritten.
    pub fn invalidate_heap(&mut self, heap: ObjectKey) {
        self.bounded_retrieved.retain(|(key, _), _| *key != heap);
        self.unbounded_retrieved.retain(|(key, _)| *key != heap);
    }

    /// Forget everything reported so far.
    pub fn reset_retrieved(&mut self) {
        self.bounded_retrieved.clear();
        self.unbounded_retrieved.clear();
    }

    /// Resolve the slots a descriptor table parameter covers when bound at `base_index` of
    /// `heap`.
    ///
    /// `sampler` selects sampler ranges (sampler heap binding) or view ranges. Ranges with an
    /// explicit offset start there; `DESCRIPTOR_RANGE_OFFSET_APPEND` ranges follow the previous
    /// range. Unbounded ranges run to the end of the heap. Only indices not reported by an
    /// earlier call for the same heap and range start are returned.
    pub fn descriptor_table_indexes(
        &mut self,
        root_signature: ObjectKey,
        heap: ObjectKey,
        parameter_index: u32,
        base_index: u32,
        heap_size: u32,
        sampler: bool,
    ) -> Result<DescriptorTableIndexes, RootSignatureError> {
        let desc = self
            .signatures
            .get(&root_signature)
            .ok_or(RootSignatureError::Unknown(root_signature))?;
        let parameter = desc.parameters.get(parameter_index as usize).ok_or(
            RootSignatureError::ParameterOutOfRange {
                root_signature,
                parameter_index,
                parameter_count: desc.parameters.len(),
            },
        )?;
        let RootParameter::DescriptorTable { ranges } = parameter else {
            return Err(RootSignatureError::NotADescriptorTable {
                root_signature,
                parameter_index,
            });
        };

        let mut result = DescriptorTableIndexes::default();
        let mut next_offset = 0u32;
        for range in ranges {
            let offset = if range.offset_in_descriptors_from_table_start
                == DESCRIPTOR_RANGE_OFFSET_APPEND
            {
                next_offset
            } else {
                range.offset_in_descriptors_from_table_start
            };
            let start = base_index.saturating_add(offset);
            let count = if range.is_unbounded() {
                heap_size.saturating_sub(start)
            } else {
                range.num_descriptors
            };
            next_offset = offset.saturating_add(count);

            if (range.kind == DescriptorRangeKind::Sampler) != sampler {
                continue;
            }
            if range.is_unbounded() {
                if self.unbounded_retrieved.insert((heap, start)) {
                    result.unbounded = true;
                }
                continue;
            }
            let retrieved = self.bounded_retrieved.entry((heap, start)).or_insert(0);
            if count <= *retrieved {
                continue;
            }
            let end = start.saturating_add(count).min(heap_size);
            let from = start.saturating_add(*retrieved);
            result.indexes.extend(from..end);
            *retrieved = count;
        }
        Ok(result)
    }
}
