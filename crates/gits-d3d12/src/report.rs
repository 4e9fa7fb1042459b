//! The subcapture analysis manifest read by the restore pass.
//!
//! Plain text. Each section starts with its header line and is followed by one record per
//! line: a decimal integer, or two space-separated decimal integers for descriptor slots and
//! acceleration-structure locations. Sections always appear in [`ReportSection::ALL`] order.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;

use crate::error::ReportError;
use crate::key::{AsLocation, CommandKey, DescriptorSlot, ObjectKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReportSection {
    CommandListKeys,
    CommandQueueCommands,
    Objects,
    Descriptors,
    Tlases,
    Blases,
    AsSources,
}

impl ReportSection {
    pub const ALL: [Self; 7] = [
        Self::CommandListKeys,
        Self::CommandQueueCommands,
        Self::Objects,
        Self::Descriptors,
        Self::Tlases,
        Self::Blases,
        Self::AsSources,
    ];

    pub fn header(self) -> &'static str {
        match self {
            Self::CommandListKeys => "COMMAND_LIST_KEYS",
            Self::CommandQueueCommands => "COMMAND_QUEUE_COMMANDS",
            Self::Objects => "OBJECTS",
            Self::Descriptors => "DESCRIPTORS",
            Self::Tlases => "TLASES",
            Self::Blases => "BLASES",
            Self::AsSources => "AS_SOURCES",
        }
    }

    pub fn from_header(line: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|section| section.header() == line)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubcaptureAnalysisReport {
    pub command_lists: BTreeSet<ObjectKey>,
    pub queue_commands: BTreeSet<CommandKey>,
    pub objects: BTreeSet<ObjectKey>,
    pub descriptors: BTreeSet<DescriptorSlot>,
    pub tlases: BTreeSet<CommandKey>,
    pub blases: BTreeSet<AsLocation>,
    pub as_sources: BTreeSet<AsLocation>,
}

impl SubcaptureAnalysisReport {
    /// Write `sections` (kept in canonical order regardless of the order given).
    pub fn write(
        &self,
        out: &mut impl Write,
        sections: &[ReportSection],
    ) -> Result<(), ReportError> {
        for section in ReportSection::ALL {
            if !sections.contains(&section) {
                continue;
            }
            writeln!(out, "{}", section.header())?;
            match section {
                ReportSection::CommandListKeys => {
                    for key in &self.command_lists {
                        writeln!(out, "{key}")?;
                    }
                }
                ReportSection::CommandQueueCommands => {
                    for key in &self.queue_commands {
                        writeln!(out, "{key}")?;
                    }
                }
                ReportSection::Objects => {
                    for key in &self.objects {
                        writeln!(out, "{key}")?;
                    }
                }
                ReportSection::Descriptors => {
                    for slot in &self.descriptors {
                        writeln!(out, "{} {}", slot.heap, slot.index)?;
                    }
                }
                ReportSection::Tlases => {
                    for key in &self.tlases {
                        writeln!(out, "{key}")?;
                    }
                }
                ReportSection::Blases => {
                    for location in &self.blases {
                        writeln!(out, "{} {}", location.resource, location.offset)?;
                    }
                }
                ReportSection::AsSources => {
                    for location in &self.as_sources {
                        writeln!(out, "{} {}", location.resource, location.offset)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn write_to_path(
        &self,
        path: impl AsRef<Path>,
        sections: &[ReportSection],
    ) -> Result<(), ReportError> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write(&mut out, sections)?;
        out.flush()?;
        Ok(())
    }

    pub fn to_manifest_string(&self, sections: &[ReportSection]) -> String {
        let mut out = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write(&mut out, sections);
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// A manifest as read back by the restore side.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnalysisManifest {
    pub report: SubcaptureAnalysisReport,
    /// Sections present in the file, in file order.
    pub sections: Vec<ReportSection>,
}

impl AnalysisManifest {
    /// Whether the manifest bounds the set of objects to restore. Without an `OBJECTS`
    /// section every object is restored.
    pub fn is_bounded(&self) -> bool {
        self.sections.contains(&ReportSection::Objects)
    }

    pub fn parse(input: impl BufRead) -> Result<Self, ReportError> {
        let mut manifest = Self::default();
        let mut current: Option<ReportSection> = None;
        for (index, line) in input.lines().enumerate() {
            let line = line?;
            let line_number = index + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let error = |message: String| ReportError::Parse {
                line: line_number,
                message,
            };

            if let Some(section) = ReportSection::from_header(line) {
                if current.is_some_and(|previous| previous >= section) {
                    return Err(error(format!("section {line} out of order")));
                }
                manifest.sections.push(section);
                current = Some(section);
                continue;
            }
            let section =
                current.ok_or_else(|| error(format!("record {line:?} before any section")))?;
            let fields: Vec<u64> = line
                .split(' ')
                .map(|field| field.parse::<u64>())
                .collect::<Result<_, _>>()
                .map_err(|e| error(format!("{line:?}: {e}")))?;
            let key = |value: u64| {
                u32::try_from(value)
                    .map(ObjectKey)
                    .map_err(|_| error(format!("object key {value} out of range")))
            };
            let report = &mut manifest.report;
            match (section, fields.as_slice()) {
                (ReportSection::CommandListKeys, &[list]) => {
                    report.command_lists.insert(key(list)?);
                }
                (ReportSection::CommandQueueCommands, &[command]) => {
                    report.queue_commands.insert(CommandKey(command));
                }
                (ReportSection::Objects, &[object]) => {
                    report.objects.insert(key(object)?);
                }
                (ReportSection::Tlases, &[build]) => {
                    report.tlases.insert(CommandKey(build));
                }
                (ReportSection::Descriptors, &[heap, index]) => {
                    let index = u32::try_from(index)
                        .map_err(|_| error(format!("descriptor index {index} out of range")))?;
                    report
                        .descriptors
                        .insert(DescriptorSlot::new(key(heap)?, index));
                }
                (ReportSection::Blases, &[resource, offset]) => {
                    report.blases.insert(AsLocation::new(key(resource)?, offset));
                }
                (ReportSection::AsSources, &[resource, offset]) => {
                    report
                        .as_sources
                        .insert(AsLocation::new(key(resource)?, offset));
                }
                (section, fields) => {
                    return Err(error(format!(
                        "{} record with {} fields",
                        section.header(),
                        fields.len()
                    )))
                }
            }
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn report() -> SubcaptureAnalysisReport {
        SubcaptureAnalysisReport {
            command_lists: [ObjectKey(7)].into(),
            queue_commands: [CommandKey(90), CommandKey(91)].into(),
            objects: [ObjectKey(1), ObjectKey(2)].into(),
            descriptors: [DescriptorSlot::new(ObjectKey(2), 5)].into(),
            tlases: [CommandKey(40)].into(),
            blases: [AsLocation::new(ObjectKey(3), 256)].into(),
            as_sources: [AsLocation::new(ObjectKey(4), 0)].into(),
        }
    }

    #[test]
    fn sections_are_written_in_fixed_order() {
        let mut shuffled = ReportSection::ALL;
        shuffled.reverse();
        let text = report().to_manifest_string(&shuffled);
        assert_eq!(
            text,
            "COMMAND_LIST_KEYS\n7\nCOMMAND_QUEUE_COMMANDS\n90\n91\nOBJECTS\n1\n2\n\
             DESCRIPTORS\n2 5\nTLASES\n40\nBLASES\n3 256\nAS_SOURCES\n4 0\n"
        );
    }

    #[test]
    fn parse_reads_back_what_was_written() {
        let text = report().to_manifest_string(&ReportSection::ALL);
        let manifest = AnalysisManifest::parse(text.as_bytes()).unwrap();
        assert_eq!(manifest.report, report());
        assert!(manifest.is_bounded());
    }

    #[test]
    fn unbounded_manifest_has_no_object_section() {
        let text = report().to_manifest_string(&[
            ReportSection::CommandListKeys,
            ReportSection::CommandQueueCommands,
        ]);
        let manifest = AnalysisManifest::parse(text.as_bytes()).unwrap();
        assert!(!manifest.is_bounded());
        assert!(manifest.report.objects.is_empty());
    }

    #[test]
    fn parse_errors_carry_line_numbers() {
        let err = AnalysisManifest::parse("OBJECTS\n1\nx\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ReportError::Parse { line: 3, .. }));

        let err = AnalysisManifest::parse("OBJECTS\nCOMMAND_LIST_KEYS\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ReportError::Parse { line: 2, .. }));

        let err = AnalysisManifest::parse("1\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ReportError::Parse { line: 1, .. }));
    }

    #[test]
    fn writes_to_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subcapture.txt");
        report().write_to_path(&path, &ReportSection::ALL).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("COMMAND_LIST_KEYS\n7\n"));
    }
}
