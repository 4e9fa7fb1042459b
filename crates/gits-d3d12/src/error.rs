use std::io;

use thiserror::Error;

use crate::key::{CommandKey, ObjectKey};

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("resource {resource} placed in unknown heap {heap}")]
    UnknownHeap { heap: ObjectKey, resource: ObjectKey },
    #[error(
        "resource {resource} placed at heap offset 0x{heap_offset:x} below the start of heap {heap}"
    )]
    HeapOffsetOutOfRange {
        heap: ObjectKey,
        resource: ObjectKey,
        heap_offset: u64,
    },
    #[error("descriptor heap {0} was never created")]
    UnknownDescriptorHeap(ObjectKey),
}

#[derive(Debug, Error)]
pub enum ReadbackError {
    #[error("readback device reported failure for ticket {ticket}: {message}")]
    Device { ticket: u64, message: String },
    #[error(
        "readback of resource {resource} range 0x{offset:x}+0x{size:x} is outside the resource"
    )]
    OutOfBounds {
        resource: ObjectKey,
        offset: u64,
        size: u64,
    },
    #[error("readback completion channel closed with {outstanding} readbacks outstanding")]
    Disconnected { outstanding: usize },
}

#[derive(Debug, Error)]
pub enum RootSignatureError {
    #[error("root signature {0} was never created")]
    Unknown(ObjectKey),
    #[error(
        "root parameter {parameter_index} out of range for root signature {root_signature} ({parameter_count} parameters)"
    )]
    ParameterOutOfRange {
        root_signature: ObjectKey,
        parameter_index: u32,
        parameter_count: usize,
    },
    #[error("root parameter {parameter_index} of root signature {root_signature} is not a descriptor table")]
    NotADescriptorTable {
        root_signature: ObjectKey,
        parameter_index: u32,
    },
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("manifest line {line}: {message}")]
    Parse { line: usize, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid subcapture range {0:?} (expected `N`, `A-B` or `cl:FRAME:A-B`)")]
    InvalidRange(String),
    #[error("invalid analysis policy {0:?} (expected `bounded` or `unbounded`)")]
    InvalidPolicy(String),
}

/// Failures that abort an analysis session: the capture stream is internally inconsistent or a
/// collaborator failed in a way that would make the restore set silently wrong.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Readback(#[from] ReadbackError),
    #[error(transparent)]
    RootSignature(#[from] RootSignatureError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("command {command}: unknown command signature {signature}")]
    UnknownCommandSignature {
        command: CommandKey,
        signature: ObjectKey,
    },
    #[error("command {command}: command list {list} has no root signature bound for {what}")]
    MissingRootSignature {
        command: CommandKey,
        list: ObjectKey,
        what: &'static str,
    },
}
