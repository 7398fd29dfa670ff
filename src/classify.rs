//! Decide from a job's captured log whether it succeeded. The exit code is
//! not consulted here: ORCA can exit 0 after logging a fatal error, and a job
//! killed at the wall-clock limit leaves a truncated log with no signature
//! at all.

use std::{fmt::Display, path::Path};

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::error::{Error, IoContext, Result};

/// failure strings observed in ORCA logs, checked in this order
pub static DEFAULT_SIGNATURES: &[&str] = &[
    "aborting the run",
    "Error termination",
    "The MDCI module",
    "mdci_state.cpp",
    "orca_mdci_mpi",
    "not enough slots",
    "illegal state",
    "Segmentation fault",
    "Signal: Aborted",
];

pub const DEFAULT_EXCERPT_LINES: usize = 25;

/// A case-insensitive failure pattern
#[derive(Clone, Debug)]
pub struct Signature {
    pub pattern: String,
    matcher: Matcher,
}

#[derive(Clone, Debug)]
enum Matcher {
    /// lowercased needle
    Substring(String),
    Regex(Regex),
}

impl Signature {
    pub fn substring(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_owned(),
            matcher: Matcher::Substring(pattern.to_lowercase()),
        }
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                Error::Config(format!("bad signature regex `{pattern}`: {e}"))
            })?;
        Ok(Self {
            pattern: pattern.to_owned(),
            matcher: Matcher::Regex(re),
        })
    }

    /// `lower` must be `text` lowercased, shared across substring checks so
    /// a long log is only lowercased once
    fn matches(&self, text: &str, lower: &str) -> bool {
        match &self.matcher {
            Matcher::Substring(needle) => lower.contains(needle.as_str()),
            Matcher::Regex(re) => re.is_match(text),
        }
    }
}

#[derive(Deserialize)]
struct RawSignatures {
    version: u32,
    #[serde(default)]
    signature: Vec<RawSignature>,
}

#[derive(Deserialize)]
struct RawSignature {
    pattern: String,
    #[serde(default)]
    regex: bool,
}

/// The ordered, versioned list of failure signatures
#[derive(Clone, Debug)]
pub struct Signatures {
    pub version: u32,
    pub entries: Vec<Signature>,
}

impl Default for Signatures {
    fn default() -> Self {
        Self {
            version: 1,
            entries: DEFAULT_SIGNATURES
                .iter()
                .map(|p| Signature::substring(p))
                .collect(),
        }
    }
}

impl Signatures {
    /// load a TOML signature list like
    ///
    /// ```text
    /// version = 2
    ///
    /// [[signature]]
    /// pattern = "Segmentation fault"
    ///
    /// [[signature]]
    /// pattern = 'SCF NOT CONVERGED AFTER \d+ CYCLES'
    /// regex = true
    /// ```
    pub fn load(filename: impl AsRef<Path>) -> Result<Self> {
        let filename = filename.as_ref();
        let contents = std::fs::read_to_string(filename).at(filename)?;
        let raw: RawSignatures =
            toml::from_str(&contents).map_err(|e| Error::Toml {
                path: filename.to_owned(),
                source: e,
            })?;
        let mut entries = Vec::with_capacity(raw.signature.len());
        for s in raw.signature {
            if s.pattern.is_empty() {
                return Err(Error::Config(format!(
                    "empty signature pattern in {}",
                    filename.display()
                )));
            }
            entries.push(if s.regex {
                Signature::regex(&s.pattern)?
            } else {
                Signature::substring(&s.pattern)
            });
        }
        Ok(Self {
            version: raw.version,
            entries,
        })
    }

    /// every signature found in `text`, in list order
    pub fn find_all(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        self.entries
            .iter()
            .filter(|s| s.matches(text, &lower))
            .map(|s| s.pattern.clone())
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FailureReason {
    Signature,
    NoTerminalMarker,
    SpawnFailed(String),
    StageFailed(String),
    ArchiveFailed(String),
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Signature => write!(f, "signature match"),
            FailureReason::NoTerminalMarker => write!(f, "no terminal marker"),
            FailureReason::SpawnFailed(e) => write!(f, "spawn failed: {e}"),
            FailureReason::StageFailed(e) => write!(f, "staging failed: {e}"),
            FailureReason::ArchiveFailed(e) => {
                write!(f, "archiving failed: {e}")
            }
        }
    }
}

/// Evidence that a unit failed
#[derive(Clone, Debug, PartialEq)]
pub struct FailureRecord {
    pub unit_id: usize,
    pub reason: FailureReason,

    /// every matched signature. the first is the one reported
    pub matched: Vec<String>,

    /// the last lines of the log
    pub excerpt: Vec<String>,
}

impl FailureRecord {
    /// a failure with no log evidence behind it
    pub fn bare(unit_id: usize, reason: FailureReason) -> Self {
        Self {
            unit_id,
            reason,
            matched: Vec::new(),
            excerpt: Vec::new(),
        }
    }

    pub fn primary(&self) -> Option<&str> {
        self.matched.first().map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Succeeded,
    Failed(FailureRecord),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

/// The pure text classifier
#[derive(Clone, Debug)]
pub struct Classifier {
    pub signatures: Signatures,

    /// line that a complete run always prints. `None` disables the check
    pub terminal_marker: Option<String>,

    pub excerpt_lines: usize,
}

impl Classifier {
    pub fn new(
        signatures: Signatures,
        terminal_marker: Option<String>,
        excerpt_lines: usize,
    ) -> Self {
        Self {
            signatures,
            terminal_marker,
            excerpt_lines,
        }
    }

    pub fn classify(&self, unit_id: usize, text: &str) -> Outcome {
        let matched = self.signatures.find_all(text);
        let reason = if !matched.is_empty() {
            FailureReason::Signature
        } else if !self.has_marker(text) {
            FailureReason::NoTerminalMarker
        } else {
            return Outcome::Succeeded;
        };
        Outcome::Failed(FailureRecord {
            unit_id,
            reason,
            matched,
            excerpt: tail(text, self.excerpt_lines),
        })
    }

    /// read the log at `path` and classify it. a missing or unreadable log
    /// is treated as empty, which can only fail
    pub fn classify_file(&self, unit_id: usize, path: &Path) -> Outcome {
        let text = match std::fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                log::warn!("failed to read {} with {e}", path.display());
                String::new()
            }
        };
        self.classify(unit_id, &text)
    }

    fn has_marker(&self, text: &str) -> bool {
        match &self.terminal_marker {
            Some(marker) => {
                text.to_lowercase().contains(&marker.to_lowercase())
            }
            None => true,
        }
    }
}

/// the last `n` lines of `text`
pub fn tail(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|s| s.to_string()).collect()
}
