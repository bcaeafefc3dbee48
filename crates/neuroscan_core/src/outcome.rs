//! Classification labels, job outcomes and the correction rule.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::InvalidLabel;

/// Closed set of classification labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Tumor,
    NoTumor,
}

impl Label {
    pub const ALL: [Label; 2] = [Label::NoTumor, Label::Tumor];

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Tumor => "Tumor",
            Label::NoTumor => "No Tumor",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive; `_`, `-` and runs of whitespace count as one separator.
impl FromStr for Label {
    type Err = InvalidLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded = s
            .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
            .filter(|part| !part.is_empty())
            .map(str::to_ascii_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        match folded.as_str() {
            "tumor" => Ok(Label::Tumor),
            "no tumor" => Ok(Label::NoTumor),
            _ => Err(InvalidLabel(s.to_string())),
        }
    }
}

/// Terminal result of a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    label: Label,
    elapsed: Duration,
}

impl Outcome {
    pub(crate) fn new(label: Label, elapsed: Duration) -> Self {
        Self { label, elapsed }
    }

    pub fn label(&self) -> Label {
        self.label
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// `(original, corrected)` when the user's choice disagrees with the
    /// prediction; `None` when it confirms it.
    pub fn correction(&self, corrected: Label) -> Option<(Label, Label)> {
        (corrected != self.label).then_some((self.label, corrected))
    }
}
