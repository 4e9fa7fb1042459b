use core::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a traced native object (resource, heap, root signature, command list, ...).
///
/// Keys are unique for the lifetime of the object they name and are only reused after the
/// object was released.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ObjectKey(pub u32);

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one recorded API call in the capture stream.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CommandKey(pub u64);

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single descriptor slot inside a descriptor heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DescriptorSlot {
    pub heap: ObjectKey,
    pub index: u32,
}

impl DescriptorSlot {
    pub const fn new(heap: ObjectKey, index: u32) -> Self {
        Self { heap, index }
    }
}

/// Location of an acceleration structure: the backing buffer and a byte offset into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsLocation {
    pub resource: ObjectKey,
    pub offset: u64,
}

impl AsLocation {
    pub const fn new(resource: ObjectKey, offset: u64) -> Self {
        Self { resource, offset }
    }
}
