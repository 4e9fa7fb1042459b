//! Queue-level execution order ahead of the subcapture range.
//!
//! `Wait` blocks everything submitted after it on the same queue until the fence reaches the
//! awaited value. The tracker keeps the blocked tail of each queue and releases events as
//! signals arrive, so callers see submissions in GPU order rather than CPU recording order.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::key::{CommandKey, ObjectKey};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    Execute {
        command: CommandKey,
        queue: ObjectKey,
        lists: Vec<ObjectKey>,
    },
    Signal {
        command: CommandKey,
        queue: ObjectKey,
        fence: ObjectKey,
        value: u64,
    },
    Wait {
        command: CommandKey,
        queue: ObjectKey,
        fence: ObjectKey,
        value: u64,
    },
}

impl QueueEvent {
    pub fn command(&self) -> CommandKey {
        match *self {
            Self::Execute { command, .. }
            | Self::Signal { command, .. }
            | Self::Wait { command, .. } => command,
        }
    }

    pub fn queue(&self) -> ObjectKey {
        match *self {
            Self::Execute { queue, .. } | Self::Signal { queue, .. } | Self::Wait { queue, .. } => {
                queue
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct GpuExecutionTracker {
    fences: HashMap<ObjectKey, u64>,
    pending: BTreeMap<ObjectKey, VecDeque<QueueEvent>>,
}

impl GpuExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_fence(&mut self, fence: ObjectKey, initial_value: u64) {
        self.fences.insert(fence, initial_value);
    }

    pub fn fence_value(&self, fence: ObjectKey) -> u64 {
        self.fences.get(&fence).copied().unwrap_or(0)
    }

    /// Submit a queue event. Returns every event that executes as a result, in order.
    pub fn submit(&mut self, event: QueueEvent) -> Vec<QueueEvent> {
        self.pending
            .entry(event.queue())
            .or_default()
            .push_back(event);
        self.drain()
    }

    /// `ID3D12Fence::Signal` from the CPU.
    pub fn cpu_signal(&mut self, fence: ObjectKey, value: u64) -> Vec<QueueEvent> {
        self.fences.insert(fence, value);
        self.drain()
    }

    fn drain(&mut self) -> Vec<QueueEvent> {
        let mut executed = Vec::new();
        loop {
            let mut progressed = false;
            for events in self.pending.values_mut() {
                while let Some(front) = events.front() {
                    if let QueueEvent::Wait { fence, value, .. } = *front {
                        if self.fences.get(&fence).copied().unwrap_or(0) < value {
                            break;
                        }
                    }
                    let Some(event) = events.pop_front() else {
                        break;
                    };
                    if let QueueEvent::Signal { fence, value, .. } = event {
                        self.fences.insert(fence, value);
                    }
                    executed.push(event);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        self.pending.retain(|_, events| !events.is_empty());
        executed
    }

    /// Events still blocked behind an unsatisfied wait, in capture order.
    pub fn pending(&self) -> Vec<&QueueEvent> {
        let mut events: Vec<&QueueEvent> = self.pending.values().flatten().collect();
        events.sort_by_key(|event| event.command());
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q1: ObjectKey = ObjectKey(1);
    const Q2: ObjectKey = ObjectKey(2);
    const FENCE: ObjectKey = ObjectKey(10);

    fn execute(command: u64, queue: ObjectKey, list: u32) -> QueueEvent {
        QueueEvent::Execute {
            command: CommandKey(command),
            queue,
            lists: vec![ObjectKey(list)],
        }
    }

    #[test]
    fn unblocked_events_execute_immediately() {
        let mut tracker = GpuExecutionTracker::new();
        let done = tracker.submit(execute(1, Q1, 100));
        assert_eq!(done, vec![execute(1, Q1, 100)]);
        assert!(tracker.pending().is_empty());
    }

    #[test]
    fn wait_blocks_queue_until_signal_from_other_queue() {
        let mut tracker = GpuExecutionTracker::new();
        tracker.create_fence(FENCE, 0);
        let wait = QueueEvent::Wait {
            command: CommandKey(1),
            queue: Q1,
            fence: FENCE,
            value: 1,
        };
        assert!(tracker.submit(wait.clone()).is_empty());
        assert!(tracker.submit(execute(2, Q1, 100)).is_empty());
        assert_eq!(tracker.pending().len(), 2);

        let signal = QueueEvent::Signal {
            command: CommandKey(3),
            queue: Q2,
            fence: FENCE,
            value: 1,
        };
        let done = tracker.submit(signal.clone());
        let commands: Vec<u64> = done.iter().map(|e| e.command().0).collect();
        assert_eq!(commands, vec![3, 1, 2]);
        assert!(tracker.pending().is_empty());
    }

    #[test]
    fn cpu_signal_releases_waits() {
        let mut tracker = GpuExecutionTracker::new();
        tracker.submit(QueueEvent::Wait {
            command: CommandKey(1),
            queue: Q1,
            fence: FENCE,
            value: 5,
        });
        tracker.submit(execute(2, Q1, 100));
        assert!(tracker.cpu_signal(FENCE, 4).is_empty());
        assert_eq!(tracker.cpu_signal(FENCE, 5).len(), 2);
        assert_eq!(tracker.fence_value(FENCE), 5);
    }
}
