//! Mutants and their verdicts.

use serde::{Deserialize, Serialize};

pub type MutantId = String;
pub type TestId = String;

/// A position in a source file (1-based line, 0-based column).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub start: Position,
    pub end: Position,
}

/// One candidate corruption of the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutant {
    pub id: MutantId,
    pub file_name: String,
    #[serde(default)]
    pub mutator_name: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub replacement: String,
    /// Executed at module load rather than per test.
    #[serde(default, rename = "static")]
    pub is_static: bool,
    /// Pre-assigned status, e.g. `Ignored` set by configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MutantStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
}

impl Mutant {
    pub fn new(id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            mutator_name: String::new(),
            location: Location::default(),
            replacement: String::new(),
            is_static: false,
            status: None,
            status_reason: None,
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.status == Some(MutantStatus::Ignored)
    }
}

/// Terminal verdict of a mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutantStatus {
    Killed,
    Survived,
    NoCoverage,
    Timeout,
    CompileError,
    RuntimeError,
    Error,
    Ignored,
}

impl MutantStatus {
    /// Counts towards the mutation score as detected.
    pub fn is_detected(&self) -> bool {
        matches!(self, Self::Killed | Self::Timeout)
    }

    /// Counts towards the mutation score as undetected.
    pub fn is_undetected(&self) -> bool {
        matches!(self, Self::Survived | Self::NoCoverage)
    }
}

impl std::fmt::Display for MutantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Killed => "Killed",
            Self::Survived => "Survived",
            Self::NoCoverage => "NoCoverage",
            Self::Timeout => "Timeout",
            Self::CompileError => "CompileError",
            Self::RuntimeError => "RuntimeError",
            Self::Error => "Error",
            Self::Ignored => "Ignored",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of testing one mutant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutantResult {
    pub id: MutantId,
    pub file_name: String,
    pub status: MutantStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub killed_by: Vec<TestId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub covered_by: Vec<TestId>,
    /// Non-skipped tests executed, when the mutant was run at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests_completed: Option<usize>,
}

impl MutantResult {
    pub fn new(mutant: &Mutant, status: MutantStatus) -> Self {
        Self {
            id: mutant.id.clone(),
            file_name: mutant.file_name.clone(),
            status,
            status_reason: None,
            killed_by: Vec::new(),
            covered_by: Vec::new(),
            tests_completed: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.status_reason = Some(reason.into());
        self
    }
}
