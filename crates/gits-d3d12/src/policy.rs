//! How much an analysis session tracks, chosen once per session.

use std::fmt;

use crate::binding::{AnalysisContext, BindingAnalyzer};
use crate::command::CommandRecord;
use crate::config::PolicyKind;
use crate::error::AnalysisError;
use crate::report::{ReportSection, SubcaptureAnalysisReport};

pub trait AnalysisPolicy: fmt::Debug {
    fn kind(&self) -> PolicyKind;

    /// Analyze one in-range recording command (or a replayed buffered one).
    fn analyze(
        &self,
        binding: &mut BindingAnalyzer,
        record: &CommandRecord,
        ctx: &mut AnalysisContext<'_>,
    ) -> Result<(), AnalysisError>;

    /// Sections of the manifest this policy writes.
    fn report_sections(&self) -> &'static [ReportSection];

    /// Last adjustments to the report before it is written.
    fn finalize(&self, _report: &mut SubcaptureAnalysisReport) {}
}

/// Full binding analysis: the manifest lists exactly the objects the range needs.
#[derive(Clone, Copy, Debug, Default)]
pub struct BoundedPolicy;

impl AnalysisPolicy for BoundedPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Bounded
    }

    fn analyze(
        &self,
        binding: &mut BindingAnalyzer,
        record: &CommandRecord,
        ctx: &mut AnalysisContext<'_>,
    ) -> Result<(), AnalysisError> {
        binding.analyze(record, ctx)
    }

    fn report_sections(&self) -> &'static [ReportSection] {
        &ReportSection::ALL
    }
}

/// Command-list subcapture: only command lists and queue commands are tracked, every object
/// is restored.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnboundedPolicy;

impl AnalysisPolicy for UnboundedPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Unbounded
    }

    fn analyze(
        &self,
        _binding: &mut BindingAnalyzer,
        _record: &CommandRecord,
        _ctx: &mut AnalysisContext<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn report_sections(&self) -> &'static [ReportSection] {
        &[
            ReportSection::CommandListKeys,
            ReportSection::CommandQueueCommands,
        ]
    }

    fn finalize(&self, report: &mut SubcaptureAnalysisReport) {
        report.objects.clear();
        report.descriptors.clear();
        report.tlases.clear();
        report.blases.clear();
        report.as_sources.clear();
    }
}

impl PolicyKind {
    pub fn policy(self) -> Box<dyn AnalysisPolicy> {
        match self {
            Self::Bounded => Box::new(BoundedPolicy),
            Self::Unbounded => Box::new(UnboundedPolicy),
        }
    }
}
