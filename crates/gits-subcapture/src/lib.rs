//! Trace loading and single analysis runs behind the `gits-subcapture` binary.

pub mod config;
mod trace;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use gits_d3d12::execute_indirect::dispatch_rays_file::{write_records, DispatchRaysRecord};
use gits_d3d12::readback::{CompletionMode, MemoryReadbackDevice};
use gits_d3d12::{
    CommandRecord, RangePhase, ReportSection, SubcaptureAnalysisReport, SubcaptureAnalyzer,
    SubcaptureConfig,
};
use tracing::{debug, info};

pub use trace::{TraceLoadError, TraceReader, TraceSummary};

/// What one [`analyze`] run produced.
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub report: SubcaptureAnalysisReport,
    pub sections: &'static [ReportSection],
    /// Records read before the range closed.
    pub commands: usize,
    pub dispatch_rays: Vec<DispatchRaysRecord>,
}

impl AnalysisOutcome {
    /// One-line summary printed by the binary.
    pub fn summary(&self) -> String {
        format!(
            "{} command lists, {} queue commands, {} objects, {} descriptors, {} tlases, {} blases, {} as sources",
            self.report.command_lists.len(),
            self.report.queue_commands.len(),
            self.report.objects.len(),
            self.report.descriptors.len(),
            self.report.tlases.len(),
            self.report.blases.len(),
            self.report.as_sources.len(),
        )
    }
}

/// Run one analysis session over `records` without writing anything.
pub fn run_session<I>(config: &SubcaptureConfig, records: I) -> anyhow::Result<AnalysisOutcome>
where
    I: IntoIterator<Item = Result<CommandRecord, TraceLoadError>>,
{
    let device = MemoryReadbackDevice::new(CompletionMode::Worker);
    let mut analyzer = SubcaptureAnalyzer::from_config(config, Box::new(device));
    let mut commands = 0;
    for record in records {
        let record = record?;
        commands += 1;
        analyzer.process(&record).with_context(|| {
            format!("analyzing command {} ({})", record.key, record.command.name())
        })?;
        if analyzer.phase() == RangePhase::Done {
            debug!(command = %record.key, "range closed; remaining records skipped");
            break;
        }
    }
    let sections = analyzer.report_sections();
    let dispatch_rays = analyzer.dispatch_rays().to_vec();
    let report = analyzer.finish()?;
    Ok(AnalysisOutcome {
        report,
        sections,
        commands,
        dispatch_rays,
    })
}

/// Analyze the trace at `trace` and write the outputs named in `config`.
pub fn analyze(config: &SubcaptureConfig, trace: &Path) -> anyhow::Result<AnalysisOutcome> {
    info!(trace = %trace.display(), range = %config.range, policy = %config.policy, "analyzing trace");
    let outcome = run_session(config, TraceReader::open(trace)?)?;

    outcome
        .report
        .write_to_path(&config.output, outcome.sections)
        .with_context(|| format!("writing manifest {}", config.output.display()))?;
    info!(path = %config.output.display(), "manifest written");

    if let Some(path) = &config.dispatch_rays_output {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut out = BufWriter::new(file);
        write_records(&mut out, &outcome.dispatch_rays)
            .and_then(|()| out.flush())
            .with_context(|| format!("writing {}", path.display()))?;
        info!(
            path = %path.display(),
            records = outcome.dispatch_rays.len(),
            "indirect dispatch rays written"
        );
    }
    Ok(outcome)
}

/// Count the commands of the trace at `trace` by kind.
pub fn inspect(trace: &Path) -> anyhow::Result<TraceSummary> {
    let mut summary = TraceSummary::default();
    for record in TraceReader::open(trace)? {
        summary.add(&record?);
    }
    Ok(summary)
}
