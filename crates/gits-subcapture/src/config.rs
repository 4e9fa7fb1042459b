use std::env;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use gits_d3d12::{PolicyKind, SubcaptureConfig, SubcaptureRange};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "gits-subcapture",
    version,
    about = "Analyze a DirectX 12 capture and write the subcapture restore manifest."
)]
pub struct Cli {
    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `GITS_LOG`.
    #[arg(long, global = true, env = "GITS_LOG")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CliCommand {
    /// Run one analysis pass and write the manifest.
    Analyze(AnalyzeArgs),
    /// Print per-kind command counts and the frame count of a trace.
    Inspect(InspectArgs),
}

#[derive(Debug, Clone, Args)]
pub struct AnalyzeArgs {
    /// Trace to analyze (one JSON command record per line)
    pub trace: PathBuf,

    /// Frames (`5`, `3-7`) or submissions of one frame (`cl:<frame>:<first>-<last>`), 1-based.
    ///
    /// Environment variable: `GITS_SUBCAPTURE_RANGE`.
    #[arg(long, env = "GITS_SUBCAPTURE_RANGE")]
    pub range: SubcaptureRange,

    /// `bounded` restores only what the range references, `unbounded` restores every object.
    ///
    /// Environment variable: `GITS_SUBCAPTURE_POLICY`.
    #[arg(long, env = "GITS_SUBCAPTURE_POLICY", default_value_t = PolicyKind::Bounded)]
    pub policy: PolicyKind,

    /// Manifest path (defaults to "<trace stem>.subcapture.txt" next to the trace)
    ///
    /// Environment variable: `GITS_SUBCAPTURE_OUTPUT`.
    #[arg(long, short, value_name = "PATH", env = "GITS_SUBCAPTURE_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Write `DispatchRays` arguments found in indirect argument buffers to this file
    #[arg(long, value_name = "PATH")]
    pub dispatch_rays_output: Option<PathBuf>,

    /// Keep shader export names so identifiers can be logged by name
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub dump_lookup: bool,
}

#[derive(Debug, Clone, Args)]
pub struct InspectArgs {
    /// Trace to inspect
    pub trace: PathBuf,
}

impl AnalyzeArgs {
    pub fn into_config(self) -> SubcaptureConfig {
        let output = self
            .output
            .unwrap_or_else(|| self.trace.with_extension("subcapture.txt"));
        SubcaptureConfig {
            range: self.range,
            policy: self.policy,
            dump_lookup: self.dump_lookup,
            output,
            dispatch_rays_output: self.dispatch_rays_output,
        }
    }
}

impl Cli {
    /// Effective log filter: `--log-level`/`GITS_LOG`, then `RUST_LOG`, then `info`.
    pub fn log_filter(&self) -> String {
        self.log_level
            .clone()
            .or_else(|| env::var("RUST_LOG").ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "info".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn analyze_defaults_output_next_to_trace() {
        let cli = Cli::try_parse_from([
            "gits-subcapture",
            "analyze",
            "captures/game.jsonl",
            "--range",
            "3-4",
        ])
        .unwrap();
        let CliCommand::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        let config = args.into_config();
        assert_eq!(config.range, SubcaptureRange::Frames { start: 3, end: 4 });
        assert_eq!(config.policy, PolicyKind::Bounded);
        assert_eq!(config.output, Path::new("captures/game.subcapture.txt"));
        assert!(!config.dump_lookup);
    }

    #[test]
    fn analyze_accepts_every_option() {
        let cli = Cli::try_parse_from([
            "gits-subcapture",
            "--log-level",
            "debug",
            "analyze",
            "t.jsonl",
            "--range",
            "cl:2:1-3",
            "--policy",
            "unbounded",
            "-o",
            "out.txt",
            "--dispatch-rays-output",
            "rays.txt",
            "--dump-lookup",
        ])
        .unwrap();
        assert_eq!(cli.log_filter(), "debug");
        let CliCommand::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        let config = args.into_config();
        assert_eq!(config.policy, PolicyKind::Unbounded);
        assert_eq!(config.output, Path::new("out.txt"));
        assert_eq!(config.dispatch_rays_output.as_deref(), Some(Path::new("rays.txt")));
        assert!(config.dump_lookup);
    }

    #[test]
    fn malformed_range_is_rejected() {
        let err = Cli::try_parse_from(["gits-subcapture", "analyze", "t.jsonl", "--range", "4-2"])
            .unwrap_err();
        assert!(err.to_string().contains("4-2"));
    }
}
