//! Error types for crosstalk.
//!
//! All errors are strongly typed using thiserror. Component-local failures
//! (a single backend call, one unparseable judgment) are handled at the
//! component boundary and downgraded to recorded findings; the variants here
//! are the failures that propagate to callers. There is no code path that
//! converts a failed evaluation into "assume resolved".

use thiserror::Error;

use crate::backend::BackendError;
use crate::ensemble::{BackendFailure, ClauseClash};
use crate::rule::CompilationError;

/// Errors raised while decomposing a document into blocks.
#[derive(Debug, Error)]
pub enum DecompositionError {
    /// The reconstructed blocks do not cover the source document.
    ///
    /// Raised by the judgment-assisted path and the pre-tagged bypass path
    /// when concatenating the returned blocks diverges from the source text.
    #[error(
        "Decomposition integrity failure for '{source_id}': blocks diverge from the \
         source at byte {offset} (reconstructed {reconstructed_len} of {source_len} bytes)"
    )]
    Integrity {
        /// Corpus identifier of the document being decomposed.
        source_id: String,
        /// Byte offset of the first divergence.
        offset: usize,
        /// Total bytes covered by the returned blocks.
        reconstructed_len: usize,
        /// Total bytes in the source document.
        source_len: usize,
    },

    /// The backend's decomposition response could not be parsed.
    #[error("Decomposition response for '{source_id}' is unparseable: {reason}")]
    Unparseable {
        /// Corpus identifier of the document being decomposed.
        source_id: String,
        /// Parse failure detail, including a snippet of the raw response.
        reason: String,
    },

    /// A single returned block failed field validation.
    #[error("Decomposition block {index} for '{source_id}' is invalid: {reason}")]
    InvalidBlock {
        /// Corpus identifier of the document being decomposed.
        source_id: String,
        /// Position of the offending block in the response.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },
}

/// Top-level error type for crosstalk.
#[derive(Debug, Error)]
pub enum CrosstalkError {
    /// Decomposition failed; no blocks were produced.
    #[error("Decomposition error: {0}")]
    Decomposition(#[from] DecompositionError),

    /// A rule set failed consistency checking before use.
    #[error("Rule compilation error: {0}")]
    Compilation(#[from] CompilationError),

    /// A backend call failed in a context where it cannot be downgraded
    /// to a recorded finding (e.g. an exploration pass after retries).
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Every backend in an ensemble evaluation failed. Fatal to that
    /// evaluation only; the caller decides whether to retry with a
    /// different backend list.
    #[error("Ensemble unavailable: all {attempted} backend(s) failed")]
    EnsembleUnavailable {
        /// How many backends were attempted.
        attempted: usize,
        /// Per-backend failure records, in dispatch order.
        failures: Vec<BackendFailure>,
    },

    /// The foundational layer failed its own internal-consistency check.
    ///
    /// Raised at construction time, before any evaluation using the layer
    /// can proceed.
    #[error(
        "Foundational layer '{layer}' is internally inconsistent: {} clause clash(es)",
        clashes.len()
    )]
    FoundationalInconsistency {
        /// Name of the offending foundation.
        layer: String,
        /// Each mandate/prohibition tension found between clauses.
        clashes: Vec<ClauseClash>,
    },

    /// The caller cancelled an in-flight evaluation. No partial result
    /// was committed.
    #[error("Evaluation cancelled by caller")]
    Cancelled,

    /// Invariant violation inside the library.
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl CrosstalkError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same call could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_retryable(),
            Self::EnsembleUnavailable { .. } => true,
            Self::Decomposition(_)
            | Self::Compilation(_)
            | Self::FoundationalInconsistency { .. }
            | Self::Cancelled
            | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for crosstalk operations.
pub type CrosstalkResult<T> = Result<T, CrosstalkError>;
