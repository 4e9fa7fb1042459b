//! The accumulated result of one analysis pass.

use std::collections::{BTreeSet, HashMap};

use crate::key::{AsLocation, CommandKey, DescriptorSlot, ObjectKey};

/// Everything that has to exist at the restore point. Insertion is idempotent and the sets only
/// grow until [`RestoreSet::clear`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreSet {
    pub objects: BTreeSet<ObjectKey>,
    pub descriptors: BTreeSet<DescriptorSlot>,
    pub command_lists: BTreeSet<ObjectKey>,
    pub queue_commands: BTreeSet<CommandKey>,
    pub tlases: BTreeSet<CommandKey>,
    pub blases: BTreeSet<AsLocation>,
    pub as_sources: BTreeSet<AsLocation>,
}

impl RestoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&mut self, key: ObjectKey) -> bool {
        self.objects.insert(key)
    }

    pub fn add_objects(&mut self, keys: impl IntoIterator<Item = ObjectKey>) {
        self.objects.extend(keys);
    }

    pub fn add_descriptor(&mut self, slot: DescriptorSlot) -> bool {
        self.descriptors.insert(slot)
    }

    pub fn add_command_list(&mut self, list: ObjectKey) -> bool {
        self.command_lists.insert(list)
    }

    pub fn add_queue_command(&mut self, command: CommandKey) -> bool {
        self.queue_commands.insert(command)
    }

    pub fn add_tlas(&mut self, build: CommandKey) -> bool {
        self.tlases.insert(build)
    }

    pub fn add_blas(&mut self, location: AsLocation) -> bool {
        self.blases.insert(location)
    }

    pub fn add_as_source(&mut self, location: AsLocation) -> bool {
        self.as_sources.insert(location)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Structural containment between objects: a placed resource needs its heap, a pipeline its
/// root signature, a command list its allocator.
#[derive(Clone, Debug, Default)]
pub struct ParentGraph {
    parents: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
}

impl ParentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, child: ObjectKey, parent: ObjectKey) {
        if child != parent {
            self.parents.entry(child).or_default().insert(parent);
        }
    }

    pub fn parents(&self, child: ObjectKey) -> impl Iterator<Item = ObjectKey> + '_ {
        self.parents.get(&child).into_iter().flatten().copied()
    }

    pub fn remove(&mut self, child: ObjectKey) {
        self.parents.remove(&child);
    }

    /// `roots` plus every transitive parent. Cycles terminate.
    pub fn closure(&self, roots: impl IntoIterator<Item = ObjectKey>) -> BTreeSet<ObjectKey> {
        let mut visited = BTreeSet::new();
        let mut stack: Vec<ObjectKey> = roots.into_iter().collect();
        while let Some(key) = stack.pop() {
            if !visited.insert(key) {
                continue;
            }
            stack.extend(self.parents(key).filter(|parent| !visited.contains(parent)));
        }
        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_is_idempotent() {
        let mut set = RestoreSet::new();
        assert!(set.add_object(ObjectKey(4)));
        assert!(!set.add_object(ObjectKey(4)));
        set.add_objects([ObjectKey(4), ObjectKey(4)]);
        assert_eq!(set.objects.len(), 1);
    }

    #[test]
    fn closure_follows_chains() {
        let mut graph = ParentGraph::new();
        graph.add(ObjectKey(1), ObjectKey(2));
        graph.add(ObjectKey(2), ObjectKey(3));
        graph.add(ObjectKey(10), ObjectKey(11));
        let closure: Vec<u32> = graph.closure([ObjectKey(1)]).into_iter().map(|k| k.0).collect();
        assert_eq!(closure, vec![1, 2, 3]);
    }

    #[test]
    fn closure_terminates_on_cycles() {
        let mut graph = ParentGraph::new();
        graph.add(ObjectKey(1), ObjectKey(2));
        graph.add(ObjectKey(2), ObjectKey(1));
        let closure = graph.closure([ObjectKey(1)]);
        assert_eq!(closure.len(), 2);
    }
}
