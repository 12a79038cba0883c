use serde::Serialize;
use thiserror::Error;

/// Failure taxonomy shared by the client and the sync/flatten engines.
///
/// Engines pass these around inside `anyhow::Error`; [`FailureKind::classify`]
/// recovers the category when a per-item failure is recorded in a report.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous markup at line {line}: {message}")]
    ConversionAmbiguity { line: usize, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    NotFound,
    ConversionAmbiguity,
    Filesystem,
    Configuration,
    /// A remote page whose sanitized folder is already bound to another page.
    Collision,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::NotFound => "not_found",
            Self::ConversionAmbiguity => "conversion_ambiguity",
            Self::Filesystem => "filesystem",
            Self::Configuration => "configuration",
            Self::Collision => "collision",
        }
    }

    /// Errors without a `SyncError` in their chain are treated as filesystem
    /// failures, since everything else in the engines is io plumbing.
    pub fn classify(error: &anyhow::Error) -> Self {
        for cause in error.chain() {
            if let Some(sync) = cause.downcast_ref::<SyncError>() {
                return match sync {
                    SyncError::Transport(_) => Self::Transport,
                    SyncError::NotFound(_) => Self::NotFound,
                    SyncError::ConversionAmbiguity { .. } => Self::ConversionAmbiguity,
                    SyncError::Filesystem(_) => Self::Filesystem,
                    SyncError::Configuration(_) => Self::Configuration,
                };
            }
        }
        Self::Filesystem
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ItemFailure {
    pub subject: String,
    pub kind: FailureKind,
    pub detail: String,
}

impl ItemFailure {
    pub fn new(subject: impl Into<String>, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            kind,
            detail: detail.into(),
        }
    }

    pub fn from_error(subject: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            subject: subject.into(),
            kind: FailureKind::classify(error),
            detail: format!("{error:#}"),
        }
    }
}
