//! Per-command-list buffering of recorded commands ahead of the subcapture range.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::command::{Command, CommandRecord};
use crate::key::ObjectKey;

/// What [`CommandListReplayBuffer::begin_command`] decided for one in-range command.
#[derive(Debug, PartialEq)]
pub enum RestoreAction {
    /// Nothing to replay: the list was already restored, or has nothing buffered.
    None,
    /// Replay these previously buffered commands, in order, before the current one.
    Replay(Vec<CommandRecord>),
}

/// Holds every recording command seen before the subcapture range, per command list.
///
/// Outside the range commands are buffered, and a `Reset` drops what was buffered for that
/// list. Inside the range the first command touching a list triggers a replay of its buffered
/// commands, unless that first command is a `Reset`: the list then starts from a clean slate
/// and nothing recorded earlier is needed.
#[derive(Debug, Default)]
pub struct CommandListReplayBuffer {
    buffered: HashMap<ObjectKey, Vec<CommandRecord>>,
    in_range: bool,
    reset_in_range: HashSet<ObjectKey>,
    restored: BTreeSet<ObjectKey>,
}

impl CommandListReplayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_range(&self) -> bool {
        self.in_range
    }

    /// Buffer a recording command seen outside the range.
    pub fn buffer(&mut self, list: ObjectKey, record: &CommandRecord) {
        let commands = self.buffered.entry(list).or_default();
        if matches!(record.command, Command::Reset { .. }) {
            commands.clear();
        }
        commands.push(record.clone());
    }

    pub fn buffered_len(&self, list: ObjectKey) -> usize {
        self.buffered.get(&list).map_or(0, Vec::len)
    }

    pub fn enter_range(&mut self) {
        self.in_range = true;
        self.reset_in_range.clear();
        self.restored.clear();
    }

    pub fn exit_range(&mut self) {
        self.in_range = false;
    }

    /// Called for every in-range recording command, before it is analyzed.
    pub fn begin_command(&mut self, list: ObjectKey, command: &Command) -> RestoreAction {
        if self.reset_in_range.contains(&list) || self.restored.contains(&list) {
            return RestoreAction::None;
        }
        if matches!(command, Command::Reset { .. }) {
            debug!(command_list = %list, "command list reset inside range; buffered commands skipped");
            self.reset_in_range.insert(list);
            return RestoreAction::None;
        }
        self.restore(list)
    }

    /// Restore `list` because it is executed (or referenced) inside the range.
    pub fn restore(&mut self, list: ObjectKey) -> RestoreAction {
        if self.reset_in_range.contains(&list) || !self.restored.insert(list) {
            return RestoreAction::None;
        }
        match self.buffered.get(&list) {
            Some(commands) if !commands.is_empty() => RestoreAction::Replay(commands.clone()),
            _ => RestoreAction::None,
        }
    }

    /// Lists whose pre-range commands were replayed during this range.
    pub fn restored_lists(&self) -> impl Iterator<Item = ObjectKey> + '_ {
        self.restored
            .iter()
            .copied()
            .filter(|list| self.buffered.get(list).is_some_and(|c| !c.is_empty()))
    }

    pub fn destroy(&mut self, list: ObjectKey) {
        self.buffered.remove(&list);
    }
}
