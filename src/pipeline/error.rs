//! Error types for the render pipeline

use std::fmt;

/// Errors returned by a rasterization engine
#[derive(Debug, thiserror::Error)]
pub enum EngineFault {
    #[cfg(feature = "mupdf")]
    #[error("PDF engine: {0}")]
    Pdf(#[from] mupdf::error::Error),

    #[error("{detail}")]
    Generic { detail: String },
}

impl EngineFault {
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic { detail: msg.into() }
    }
}

/// Coarse classification of pipeline failures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Staging or backing-store I/O failed
    Io,
    /// The document could not be opened, or has no pages
    MalformedDocument,
    /// A single page failed to rasterize
    Render,
    /// The run was stopped on request
    Cancelled,
    /// Caller bug, e.g. an out-of-range page index
    ContractViolation,
}

impl FailureKind {
    /// Whether a failure of this kind ends the whole run
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::Render)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Io => "io",
            Self::MalformedDocument => "malformed document",
            Self::Render => "render",
            Self::Cancelled => "cancelled",
            Self::ContractViolation => "contract violation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed document: {detail}")]
    MalformedDocument { detail: String },

    #[error("page {page} failed to render: {detail}")]
    Render { page: usize, detail: String },

    #[error("page {page} could not be spilled or restored: {detail}")]
    Spill { page: usize, detail: String },

    #[error("load cancelled")]
    Cancelled,

    #[error("contract violation: {detail}")]
    ContractViolation { detail: String },

    #[error("a load for {origin:?} is already running")]
    AlreadyRunning { origin: String },

    #[error("load worker exited without reporting an outcome")]
    WorkerLost,
}

impl PipelineError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedDocument { detail: msg.into() }
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation { detail: msg.into() }
    }

    pub fn render(page: usize, msg: impl Into<String>) -> Self {
        Self::Render {
            page,
            detail: msg.into(),
        }
    }

    /// Map onto the failure taxonomy
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Io(_) | Self::Spill { .. } | Self::WorkerLost => FailureKind::Io,
            Self::MalformedDocument { .. } => FailureKind::MalformedDocument,
            Self::Render { .. } => FailureKind::Render,
            Self::Cancelled => FailureKind::Cancelled,
            Self::ContractViolation { .. } | Self::AlreadyRunning { .. } => {
                FailureKind::ContractViolation
            }
        }
    }

    /// Page the failure is attached to, if any
    #[must_use]
    pub fn page(&self) -> Option<usize> {
        match self {
            Self::Render { page, .. } | Self::Spill { page, .. } => Some(*page),
            _ => None,
        }
    }
}
