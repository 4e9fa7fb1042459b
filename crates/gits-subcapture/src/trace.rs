use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use gits_d3d12::{Command, CommandRecord};

#[derive(Debug, thiserror::Error)]
pub enum TraceLoadError {
    #[error("failed to read trace {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}:{line}: malformed command record: {source}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Streams [`CommandRecord`]s from a JSON-lines trace: one record per line, blank lines and
/// lines starting with `#` are skipped.
pub struct TraceReader<R> {
    lines: Lines<R>,
    path: PathBuf,
    line: usize,
}

impl TraceReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceLoadError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| TraceLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufReader::new(file), path))
    }
}

impl<R: BufRead> TraceReader<R> {
    /// `path` is only used in error messages.
    pub fn new(reader: R, path: impl Into<PathBuf>) -> Self {
        Self {
            lines: reader.lines(),
            path: path.into(),
            line: 0,
        }
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = Result<CommandRecord, TraceLoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(source) => {
                    return Some(Err(TraceLoadError::Io {
                        path: self.path.clone(),
                        source,
                    }))
                }
            };
            self.line += 1;
            let text = line.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            return Some(serde_json::from_str(text).map_err(|source| TraceLoadError::Parse {
                path: self.path.clone(),
                line: self.line,
                source,
            }));
        }
    }
}

/// Per-kind command counts of a trace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceSummary {
    pub commands: usize,
    pub frames: u32,
    pub by_kind: BTreeMap<&'static str, usize>,
}

impl TraceSummary {
    pub fn add(&mut self, record: &CommandRecord) {
        self.commands += 1;
        *self.by_kind.entry(record.command.name()).or_default() += 1;
        if matches!(record.command, Command::Present { .. }) {
            self.frames += 1;
        }
    }
}

impl fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "commands: {}", self.commands)?;
        writeln!(f, "frames: {}", self.frames)?;
        for (kind, count) in &self.by_kind {
            writeln!(f, "  {kind}: {count}")?;
        }
        Ok(())
    }
}
