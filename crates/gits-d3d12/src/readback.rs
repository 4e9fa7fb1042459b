//! Staged GPU->CPU readbacks.
//!
//! Some data the analysis needs only exists on the GPU once a command list has executed:
//! top-level instance buffers, indirect argument buffers and shader binding tables. A copy is
//! recorded alongside the command that consumes the buffer, staged on the device when the
//! command list executes, and handed back to the analysis thread over a channel. Nothing is
//! mutated from the device's completion context.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tracing::{debug, warn};

use crate::d3d12::ElementsLayout;
use crate::error::ReadbackError;
use crate::key::{CommandKey, ObjectKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadbackTicket(pub u64);

/// Byte range `[offset, offset + size)` of `resource` to copy back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadbackRequest {
    pub resource: ObjectKey,
    pub offset: u64,
    pub size: u64,
}

/// Consumer of a readback's bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadbackPurpose {
    TlasInstances {
        build: CommandKey,
        layout: ElementsLayout,
        count: u32,
    },
    /// A single instance desc referenced from an array-of-pointers instance buffer.
    TlasInstance {
        build: CommandKey,
    },
    ShaderTable {
        dispatch: CommandKey,
        stride: u64,
    },
    IndirectArguments {
        command: CommandKey,
    },
    IndirectCount {
        command: CommandKey,
    },
}

/// Queue submission a staged copy was appended to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmitPoint {
    pub queue: ObjectKey,
    pub fence_value: u64,
}

#[derive(Debug)]
pub struct ReadbackCompletion {
    pub ticket: ReadbackTicket,
    pub result: Result<Vec<u8>, String>,
}

/// Completion handle passed to a [`ReadbackDevice`]. It may be moved to any thread.
///
/// Dropping a sink without completing it reports a failed readback.
#[derive(Debug)]
pub struct ReadbackSink {
    ticket: ReadbackTicket,
    sender: Option<Sender<ReadbackCompletion>>,
}

impl ReadbackSink {
    pub fn ticket(&self) -> ReadbackTicket {
        self.ticket
    }

    pub fn complete(mut self, bytes: Vec<u8>) {
        self.send(Ok(bytes));
    }

    pub fn fail(mut self, message: impl Into<String>) {
        self.send(Err(message.into()));
    }

    fn send(&mut self, result: Result<Vec<u8>, String>) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(ReadbackCompletion {
                ticket: self.ticket,
                result,
            });
        }
    }
}

impl Drop for ReadbackSink {
    fn drop(&mut self) {
        self.send(Err("readback dropped before completion".to_string()));
    }
}

/// The GPU resource-dump primitive: copy a byte range of a resource into CPU memory once the
/// submission it was appended to has finished executing.
pub trait ReadbackDevice {
    fn stage(&mut self, request: ReadbackRequest, submit: SubmitPoint, sink: ReadbackSink);

    /// Captured CPU writes into mapped resource memory.
    fn observe_write(&mut self, _resource: ObjectKey, _offset: u64, _data: &[u8]) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadbackState {
    /// Copy issued, waiting for the submission's fence.
    Staged(SubmitPoint),
    /// Fence signaled and bytes received; not yet consumed.
    Ready,
}

#[derive(Debug)]
pub struct CompletedReadback {
    pub ticket: ReadbackTicket,
    pub request: ReadbackRequest,
    pub purpose: ReadbackPurpose,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct InFlight {
    request: ReadbackRequest,
    purpose: ReadbackPurpose,
    state: ReadbackState,
    bytes: Vec<u8>,
}

/// Tracks every readback of one analysis session.
///
/// Lifecycle per readback: recorded with a command list, `Staged` when that command list is
/// submitted, `Ready` once the device delivers the bytes, and gone again (idle) after the bytes
/// are handed out by [`ReadbackQueue::poll`] or [`ReadbackQueue::flush`].
pub struct ReadbackQueue {
    device: Box<dyn ReadbackDevice>,
    sender: Sender<ReadbackCompletion>,
    receiver: Receiver<ReadbackCompletion>,
    next_ticket: u64,
    recorded: HashMap<ObjectKey, Vec<(ReadbackRequest, ReadbackPurpose)>>,
    executed: HashSet<ObjectKey>,
    queue_fences: HashMap<ObjectKey, u64>,
    in_flight: BTreeMap<ReadbackTicket, InFlight>,
}

impl ReadbackQueue {
    pub fn new(device: Box<dyn ReadbackDevice>) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            device,
            sender,
            receiver,
            next_ticket: 1,
            recorded: HashMap::new(),
            executed: HashSet::new(),
            queue_fences: HashMap::new(),
            in_flight: BTreeMap::new(),
        }
    }

    pub fn observe_write(&mut self, resource: ObjectKey, offset: u64, data: &[u8]) {
        self.device.observe_write(resource, offset, data);
    }

    /// Record a copy into `command_list`; it is staged each time the list is submitted.
    pub fn record(
        &mut self,
        command_list: ObjectKey,
        request: ReadbackRequest,
        purpose: ReadbackPurpose,
    ) {
        self.recorded
            .entry(command_list)
            .or_default()
            .push((request, purpose));
    }

    /// Drop the copies recorded into `command_list` (the list was reset).
    pub fn reset_command_list(&mut self, command_list: ObjectKey) {
        self.recorded.remove(&command_list);
        self.executed.remove(&command_list);
    }

    /// Stage every copy recorded into `command_list` as part of a submission to `queue`.
    pub fn submit_command_list(&mut self, queue: ObjectKey, command_list: ObjectKey) {
        self.executed.insert(command_list);
        let Some(recorded) = self.recorded.get(&command_list) else {
            return;
        };
        let recorded = recorded.clone();
        let fence = self.queue_fences.entry(queue).or_insert(0);
        *fence += 1;
        let submit = SubmitPoint {
            queue,
            fence_value: *fence,
        };
        for (request, purpose) in recorded {
            self.stage_at(request, purpose, submit);
        }
    }

    /// Stage a copy immediately, outside any command list.
    pub fn stage_now(
        &mut self,
        request: ReadbackRequest,
        purpose: ReadbackPurpose,
    ) -> ReadbackTicket {
        let submit = SubmitPoint {
            queue: ObjectKey(0),
            fence_value: 0,
        };
        self.stage_at(request, purpose, submit)
    }

    fn stage_at(
        &mut self,
        request: ReadbackRequest,
        purpose: ReadbackPurpose,
        submit: SubmitPoint,
    ) -> ReadbackTicket {
        let ticket = ReadbackTicket(self.next_ticket);
        self.next_ticket += 1;
        self.in_flight.insert(
            ticket,
            InFlight {
                request,
                purpose,
                state: ReadbackState::Staged(submit),
                bytes: Vec::new(),
            },
        );
        debug!(
            ticket = ticket.0,
            resource = %request.resource,
            offset = request.offset,
            size = request.size,
            "staged readback"
        );
        self.device.stage(
            request,
            submit,
            ReadbackSink {
                ticket,
                sender: Some(self.sender.clone()),
            },
        );
        ticket
    }

    pub fn state(&self, ticket: ReadbackTicket) -> Option<ReadbackState> {
        self.in_flight.get(&ticket).map(|entry| entry.state)
    }

    /// Number of readbacks still waiting for their bytes.
    pub fn outstanding(&self) -> usize {
        self.in_flight
            .values()
            .filter(|entry| matches!(entry.state, ReadbackState::Staged(_)))
            .count()
    }

    fn accept(&mut self, completion: ReadbackCompletion) -> Result<(), ReadbackError> {
        let Some(entry) = self.in_flight.get_mut(&completion.ticket) else {
            debug!(ticket = completion.ticket.0, "completion for an unknown readback");
            return Ok(());
        };
        match completion.result {
            Ok(bytes) => {
                entry.bytes = bytes;
                entry.state = ReadbackState::Ready;
                Ok(())
            }
            Err(message) => Err(ReadbackError::Device {
                ticket: completion.ticket.0,
                message,
            }),
        }
    }

    fn take_ready(&mut self) -> Vec<CompletedReadback> {
        let ready: Vec<ReadbackTicket> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.state == ReadbackState::Ready)
            .map(|(ticket, _)| *ticket)
            .collect();
        ready
            .into_iter()
            .filter_map(|ticket| {
                let entry = self.in_flight.remove(&ticket)?;
                Some(CompletedReadback {
                    ticket,
                    request: entry.request,
                    purpose: entry.purpose,
                    bytes: entry.bytes,
                })
            })
            .collect()
    }

    /// Collect readbacks that completed so far without blocking.
    pub fn poll(&mut self) -> Result<Vec<CompletedReadback>, ReadbackError> {
        while let Ok(completion) = self.receiver.try_recv() {
            self.accept(completion)?;
        }
        Ok(self.take_ready())
    }

    /// Stage copies of command lists that were recorded but never submitted, then block until
    /// every staged readback is ready.
    pub fn flush(&mut self) -> Result<Vec<CompletedReadback>, ReadbackError> {
        let never_executed: Vec<ObjectKey> = self
            .recorded
            .keys()
            .filter(|list| !self.executed.contains(list))
            .copied()
            .collect();
        for list in never_executed {
            warn!(
                command_list = %list,
                "command list with pending readbacks was never executed; reading back current contents"
            );
            self.submit_command_list(ObjectKey(0), list);
        }

        while self.outstanding() > 0 {
            match self.receiver.recv() {
                Ok(completion) => self.accept(completion)?,
                Err(_) => {
                    return Err(ReadbackError::Disconnected {
                        outstanding: self.outstanding(),
                    })
                }
            }
        }
        Ok(self.take_ready())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompletionMode {
    /// Complete inside `stage`.
    #[default]
    Inline,
    /// Complete from a worker thread, like a driver fence callback would.
    Worker,
}

/// CPU model of resource memory, populated from captured mapped-memory writes.
///
/// Bytes that were never written read back as zero.
#[derive(Debug, Default)]
pub struct MemoryReadbackDevice {
    memory: HashMap<ObjectKey, Vec<u8>>,
    mode: CompletionMode,
}

impl MemoryReadbackDevice {
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            memory: HashMap::new(),
            mode,
        }
    }

    pub fn write(&mut self, resource: ObjectKey, offset: u64, data: &[u8]) {
        let Ok(offset) = usize::try_from(offset) else {
            warn!(resource = %resource, offset, "write offset exceeds host address space");
            return;
        };
        let end = offset + data.len();
        let memory = self.memory.entry(resource).or_default();
        if memory.len() < end {
            memory.resize(end, 0);
        }
        memory[offset..end].copy_from_slice(data);
    }

    pub fn read(&self, request: &ReadbackRequest) -> Vec<u8> {
        let mut out = vec![0u8; request.size as usize];
        if let Some(memory) = self.memory.get(&request.resource) {
            let start = (request.offset as usize).min(memory.len());
            let end = (request.offset.saturating_add(request.size) as usize).min(memory.len());
            out[..end - start].copy_from_slice(&memory[start..end]);
        }
        out
    }
}

impl ReadbackDevice for MemoryReadbackDevice {
    fn stage(&mut self, request: ReadbackRequest, _submit: SubmitPoint, sink: ReadbackSink) {
        let bytes = self.read(&request);
        match self.mode {
            CompletionMode::Inline => sink.complete(bytes),
            CompletionMode::Worker => {
                thread::spawn(move || sink.complete(bytes));
            }
        }
    }

    fn observe_write(&mut self, resource: ObjectKey, offset: u64, data: &[u8]) {
        self.write(resource, offset, data);
    }
}
