use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;

/// Portion of the capture stream a subcapture covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubcaptureRange {
    /// Frames `start..=end`, 1-based; a frame ends with its `Present`.
    Frames { start: u32, end: u32 },
    /// The `start..=end`-th `ExecuteCommandLists` calls (1-based) of frame `frame`.
    ExecutionRange { frame: u32, start: u32, end: u32 },
}

fn parse_span(text: &str) -> Option<(u32, u32)> {
    let (start, end) = match text.split_once('-') {
        Some((start, end)) => (start.trim().parse().ok()?, end.trim().parse().ok()?),
        None => {
            let value = text.trim().parse().ok()?;
            (value, value)
        }
    };
    (start >= 1 && end >= start).then_some((start, end))
}

impl FromStr for SubcaptureRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidRange(s.to_string());
        if let Some(rest) = s.strip_prefix("cl:") {
            let (frame, span) = rest.split_once(':').ok_or_else(invalid)?;
            let frame: u32 = frame.trim().parse().map_err(|_| invalid())?;
            if frame == 0 {
                return Err(invalid());
            }
            let (start, end) = parse_span(span).ok_or_else(invalid)?;
            return Ok(Self::ExecutionRange { frame, start, end });
        }
        let (start, end) = parse_span(s).ok_or_else(invalid)?;
        Ok(Self::Frames { start, end })
    }
}

impl fmt::Display for SubcaptureRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Frames { start, end } if start == end => write!(f, "{start}"),
            Self::Frames { start, end } => write!(f, "{start}-{end}"),
            Self::ExecutionRange { frame, start, end } => write!(f, "cl:{frame}:{start}-{end}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PolicyKind {
    /// Restore only what the range references.
    #[default]
    Bounded,
    /// Restore command lists and queue state; everything else is restored wholesale.
    Unbounded,
}

impl FromStr for PolicyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bounded" => Ok(Self::Bounded),
            "unbounded" => Ok(Self::Unbounded),
            _ => Err(ConfigError::InvalidPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bounded => "bounded",
            Self::Unbounded => "unbounded",
        })
    }
}

/// Everything one analysis run needs to know.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubcaptureConfig {
    pub range: SubcaptureRange,
    pub policy: PolicyKind,
    /// Keep shader export names so identifiers can be reported by name.
    pub dump_lookup: bool,
    /// Manifest destination.
    pub output: PathBuf,
    /// Side-channel file for `DispatchRays` arguments found in indirect argument buffers.
    pub dispatch_rays_output: Option<PathBuf>,
}

impl SubcaptureConfig {
    pub fn new(range: SubcaptureRange, output: impl Into<PathBuf>) -> Self {
        Self {
            range,
            policy: PolicyKind::default(),
            dump_lookup: false,
            output: output.into(),
            dispatch_rays_output: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frame_ranges() {
        assert_eq!(
            "5".parse::<SubcaptureRange>().unwrap(),
            SubcaptureRange::Frames { start: 5, end: 5 }
        );
        assert_eq!(
            "3-7".parse::<SubcaptureRange>().unwrap(),
            SubcaptureRange::Frames { start: 3, end: 7 }
        );
    }

    #[test]
    fn parses_execution_ranges() {
        let range: SubcaptureRange = "cl:4:2-3".parse().unwrap();
        assert_eq!(
            range,
            SubcaptureRange::ExecutionRange {
                frame: 4,
                start: 2,
                end: 3
            }
        );
        assert_eq!(range.to_string(), "cl:4:2-3");
    }

    #[test]
    fn rejects_malformed_ranges() {
        for text in ["", "0", "7-3", "a-b", "cl:4", "cl:0:1", "cl:x:1-2", "1-"] {
            assert!(
                matches!(
                    text.parse::<SubcaptureRange>(),
                    Err(ConfigError::InvalidRange(_))
                ),
                "{text:?} should be rejected"
            );
        }
    }

    #[test]
    fn parses_policies() {
        assert_eq!("Bounded".parse::<PolicyKind>().unwrap(), PolicyKind::Bounded);
        assert_eq!("unbounded".parse::<PolicyKind>().unwrap(), PolicyKind::Unbounded);
        assert!("optimize".parse::<PolicyKind>().is_err());
    }
}
