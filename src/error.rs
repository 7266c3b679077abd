//! Typed errors with stable i18n keys.
//!
//! Every operation the facade exposes fails with an [`Error`] carrying a
//! stable key (e.g. `error.document_not_found`) that the shell resolves to a
//! localized message. Pipeline failures additionally carry the [`Phase`] they
//! occurred in so only the matching status column on the document row is
//! touched.

use thiserror::Error;

/// Pipeline phase a dependency failure is attributed to.
///
/// Parsing and splitting failures mark `parsing_status = failed` and leave
/// embedding pending; embedding and persist failures keep parsing completed
/// and mark `embedding_status = failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Parsing,
    Embedding,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Parsing => write!(f, "parsing"),
            Phase::Embedding => write!(f, "embedding"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("document not found: {0}")]
    DocumentNotFound(i64),

    #[error("library not found: {0}")]
    LibraryNotFound(i64),

    #[error("duplicate document content in library {library_id}: {hash}")]
    DuplicateDocument { library_id: i64, hash: String },

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("embedding dimension mismatch: store has {store}, config wants {config}")]
    DimensionMismatch { store: usize, config: usize },

    #[error("file missing on disk: {0}")]
    FileMissing(String),

    #[error("{phase} failed: {cause}")]
    Pipeline { phase: Phase, cause: anyhow::Error },

    #[error("cancelled")]
    Cancelled,

    #[error("rename failed: {0}")]
    RenameFailed(String),

    #[error("store initialization failed: {0}")]
    StoreInit(anyhow::Error),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Stable key the shell uses for i18n lookup.
    pub fn error_key(&self) -> &'static str {
        match self {
            Error::DocumentNotFound(_) => "error.document_not_found",
            Error::LibraryNotFound(_) => "error.library_not_found",
            Error::DuplicateDocument { .. } => "error.document_duplicate",
            Error::UnsupportedFileType(_) => "error.document_file_type_not_supported",
            Error::Validation(_) => "error.invalid_argument",
            Error::DimensionMismatch { .. } => "error.embedding_dimension_mismatch",
            Error::FileMissing(_) => "error.document_file_missing",
            Error::Pipeline { .. } => "error.document_process_failed",
            Error::Cancelled => "error.cancelled",
            Error::RenameFailed(_) => "error.document_rename_failed",
            Error::StoreInit(_) => "error.store_init_failed",
            Error::Db(_) => "error.database",
            Error::Io(_) => "error.io",
            Error::Other(_) => "error.internal",
        }
    }

    /// Phase tag for pipeline failures, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::Pipeline { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Wrap an arbitrary failure as a parsing-phase pipeline error.
    pub fn parsing(err: impl Into<anyhow::Error>) -> Self {
        Error::Pipeline {
            phase: Phase::Parsing,
            cause: err.into(),
        }
    }

    /// Wrap an arbitrary failure as an embedding-phase pipeline error.
    pub fn embedding(err: impl Into<anyhow::Error>) -> Self {
        Error::Pipeline {
            phase: Phase::Embedding,
            cause: err.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_keys_stable() {
        assert_eq!(
            Error::UnsupportedFileType("exe".into()).error_key(),
            "error.document_file_type_not_supported"
        );
        assert_eq!(
            Error::DocumentNotFound(1).error_key(),
            "error.document_not_found"
        );
        assert_eq!(
            Error::RenameFailed("x".into()).error_key(),
            "error.document_rename_failed"
        );
    }

    #[test]
    fn test_phase_tagging() {
        let e = Error::parsing(anyhow::anyhow!("no text extracted"));
        assert_eq!(e.phase(), Some(Phase::Parsing));
        let e = Error::embedding(anyhow::anyhow!("api down"));
        assert_eq!(e.phase(), Some(Phase::Embedding));
        assert_eq!(Error::Cancelled.phase(), None);
    }
}
