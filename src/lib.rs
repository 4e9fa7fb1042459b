//! GITS DirectX 12 subcapture tooling.
//!
//! The analysis and address-remapping core lives in [`d3d12`]; [`subcapture`] loads traces and
//! drives one analysis session from the command line.

pub use gits_d3d12 as d3d12;
pub use gits_subcapture as subcapture;
