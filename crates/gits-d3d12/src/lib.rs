//! `gits-d3d12` decides what a DirectX 12 subcapture has to restore, and maps captured GPU
//! addresses onto the replay device.
//!
//! Currently this crate provides:
//! - Capture/player interval indices for GPU virtual addresses and descriptor handles,
//!   including placed resources that alias inside a heap (see [`address`]).
//! - A single-pass analysis session over a recorded command stream that produces the restore
//!   manifest for a frame or submission range (see [`SubcaptureAnalyzer`]).
//! - Replay-side translation and the patch tables for addresses and shader identifiers
//!   embedded in GPU buffers (see [`ReplayTranslator`]).

mod analyzer;
mod binding;
mod command_list;
mod descriptor_state;
mod error;
mod gpu_execution;
mod key;
mod policy;
mod raytracing;
mod replay;
mod restore_set;
mod root_signature;

pub mod address;
pub mod command;
pub mod config;
pub mod d3d12;
pub mod execute_indirect;
pub mod readback;
pub mod report;
pub mod shader_identifier;

pub use analyzer::{RangePhase, SubcaptureAnalyzer};
pub use binding::{AnalysisContext, BindingAnalyzer, CommandListInfo};
pub use command::{Command, CommandRecord};
pub use command_list::{CommandListReplayBuffer, RestoreAction};
pub use config::{PolicyKind, SubcaptureConfig, SubcaptureRange};
pub use descriptor_state::{DescriptorKind, DescriptorService, DescriptorState};
pub use error::{
    AddressError, AnalysisError, ConfigError, ReadbackError, ReportError, RootSignatureError,
};
pub use gpu_execution::{GpuExecutionTracker, QueueEvent};
pub use key::{AsLocation, CommandKey, DescriptorSlot, ObjectKey};
pub use policy::{AnalysisPolicy, BoundedPolicy, UnboundedPolicy};
pub use raytracing::{RaytracingDependencyService, ShaderTableReferences};
pub use replay::{patch_gpu_addresses, patch_shader_identifiers, ReplayTranslator};
pub use report::{AnalysisManifest, ReportSection, SubcaptureAnalysisReport};
pub use restore_set::{ParentGraph, RestoreSet};
pub use root_signature::{DescriptorTableIndexes, RootSignatureService};
pub use shader_identifier::{ShaderIdentifier, ShaderIdentifierRegistry};
