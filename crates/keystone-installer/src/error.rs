use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A required pre-existing path is missing or has insufficient
    /// permissions. Raised before anything is mutated.
    PathCheck,
    /// Extraction, ticket registration or job descriptor write failed.
    Install,
    /// A requested job start or stop failed.
    JobControl,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PathCheck => "path check",
            Self::Install => "install",
            Self::JobControl => "job control",
        }
    }
}

/// The single error an orchestration run reports before aborting.
#[derive(Debug, Error)]
#[error("{package}: root={root}: {message}")]
pub struct KeystoneError {
    pub kind: FailureKind,
    pub package: String,
    pub root: String,
    pub message: String,
}
