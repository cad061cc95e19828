//! Backend capability: accept a judgment request, return a structured
//! judgment or fail.
//!
//! Every component in this crate that needs model judgment consumes the one
//! [`Backend`] trait. Concrete backends differ only in how they render a
//! request and parse a response; callers hold `Arc<dyn Backend>` values and
//! never a provider-specific type. Backends must be safe for concurrent use
//! by multiple simultaneous evaluations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod scripted;
pub use scripted::ScriptedBackend;

#[cfg(feature = "http")]
pub mod openai;
#[cfg(feature = "http")]
pub use openai::OpenAiCompatibleBackend;

/// Errors from a single backend call.
///
/// Recorded, not fatal — unless the failing backend is the last one
/// standing in an ensemble.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport-level failure (connection, HTTP status, stream cut).
    #[error("Backend '{backend}' transport failure: {message}")]
    Transport {
        /// Backend name.
        backend: String,
        /// Transport detail.
        message: String,
    },

    /// The call did not complete within its deadline.
    #[error("Backend '{backend}' timed out after {elapsed_ms}ms")]
    Timeout {
        /// Backend name.
        backend: String,
        /// Elapsed time before giving up.
        elapsed_ms: u64,
    },

    /// The response arrived but could not be parsed into a verdict.
    #[error("Backend '{backend}' returned a malformed response: {message}")]
    Malformed {
        /// Backend name.
        backend: String,
        /// Parse failure detail.
        message: String,
        /// Raw response text, retained for audit.
        raw: String,
    },

    /// The call was abandoned because the caller cancelled the evaluation.
    #[error("Backend '{backend}' call cancelled")]
    Cancelled {
        /// Backend name.
        backend: String,
    },
}

impl BackendError {
    /// Name of the backend that failed.
    #[must_use]
    pub fn backend(&self) -> &str {
        match self {
            Self::Transport { backend, .. }
            | Self::Timeout { backend, .. }
            | Self::Malformed { backend, .. }
            | Self::Cancelled { backend } => backend,
        }
    }

    /// Returns true if retrying the same call could plausibly succeed.
    /// A malformed response is deterministic enough that retrying is the
    /// rule engine's decision, not an automatic one.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}

/// Result type for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// What kind of judgment a request is asking for.
///
/// Backends may use this to pick parsing strategies; the prompt itself is
/// already fully rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Score one block pair under one rule. Response is a score object.
    PairRule {
        /// Rule id being evaluated.
        rule: String,
    },
    /// Decide whether a three-layer composition resolves cleanly.
    /// Response is a resolution verdict with a conflict list.
    Composition,
    /// Open-ended exploration pass over a whole document.
    Exploration {
        /// Pass sequence number (1-based).
        pass: u32,
    },
    /// Propose block boundaries and classifications for a document.
    Decomposition,
}

/// A rendered judgment request plus structured metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeRequest {
    /// What the request is asking for.
    pub kind: RequestKind,
    /// The fully rendered judgment prompt.
    pub prompt: String,
    /// Backend-agnostic metadata (document source, rule id, pair ids).
    pub metadata: BTreeMap<String, String>,
}

impl JudgeRequest {
    /// Creates a request with empty metadata.
    #[must_use]
    pub fn new(kind: RequestKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attaches a metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One reported conflict inside a composition verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// The layer entry the conflict originates from.
    pub source: String,
    /// The layer entry it conflicts with.
    pub target: String,
    /// What the contradiction is.
    pub description: String,
    /// What information or change would resolve it, if the backend said.
    pub resolution_hint: Option<String>,
}

impl ConflictReport {
    /// Semantic dedup key: blake3 over the normalized endpoint pair.
    ///
    /// Two backends describing the same clash in different words still
    /// collapse to one report; the key ignores description wording.
    #[must_use]
    pub fn semantic_key(&self) -> [u8; 32] {
        fn normalize(s: &str) -> String {
            s.split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()
        }
        // Direction-insensitive: (a, b) and (b, a) are the same clash.
        let mut ends = [normalize(&self.source), normalize(&self.target)];
        ends.sort();
        let mut hasher = blake3::Hasher::new();
        hasher.update(ends[0].as_bytes());
        hasher.update(&[0]);
        hasher.update(ends[1].as_bytes());
        *hasher.finalize().as_bytes()
    }
}

/// A structured, backend-independent judgment.
///
/// `raw` always carries the unparsed response text so non-determinism is
/// auditable rather than hidden. The structured fields are filled when the
/// request kind calls for them (`Composition`); other kinds are consumed by
/// their callers from `raw`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the composition resolves cleanly. `None` for request kinds
    /// that do not produce a resolution verdict.
    pub resolved: Option<bool>,
    /// Conflicts the backend reported.
    pub conflicts: Vec<ConflictReport>,
    /// Free-text rationale, if the backend offered one.
    pub rationale: Option<String>,
    /// Resolved output, when `resolved` is `Some(true)`.
    pub output: Option<String>,
    /// Raw response text, retained for audit.
    pub raw: String,
}

impl Verdict {
    /// A verdict that only carries raw response text.
    #[must_use]
    pub fn raw_only(raw: impl Into<String>) -> Self {
        Self {
            resolved: None,
            conflicts: Vec::new(),
            rationale: None,
            output: None,
            raw: raw.into(),
        }
    }

    /// A clean composition verdict with an optional resolved output.
    #[must_use]
    pub fn resolved_with(output: Option<String>, raw: impl Into<String>) -> Self {
        Self {
            resolved: Some(true),
            conflicts: Vec::new(),
            rationale: None,
            output,
            raw: raw.into(),
        }
    }

    /// An unresolved composition verdict carrying the reported conflicts.
    #[must_use]
    pub fn unresolved(conflicts: Vec<ConflictReport>, raw: impl Into<String>) -> Self {
        Self {
            resolved: Some(false),
            conflicts,
            rationale: None,
            output: None,
            raw: raw.into(),
        }
    }
}

/// Cooperative cancellation token shared between a caller and its
/// outstanding backend calls.
///
/// Cancellation is observed, not preemptive: dispatch layers check the
/// token before starting work, and long-running backends should poll it
/// between transport attempts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// The backend capability.
///
/// Implementations must be safe for concurrent use: a single backend value
/// may serve multiple simultaneous evaluations.
pub trait Backend: Send + Sync {
    /// Stable identity used for provenance and error records.
    fn name(&self) -> &str;

    /// Performs one judgment call.
    fn judge(&self, request: &JudgeRequest, cancel: &CancelToken) -> BackendResult<Verdict>;
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backend({})", self.name())
    }
}

/// Parses a composition judgment response into a structured [`Verdict`].
///
/// Shared by every backend implementation: the response contract is a JSON
/// object `{"has_conflict": bool, "conflicts": [...], "output": ...}`,
/// optionally fenced. Fail-stop on unparseable responses — a backend that
/// cannot produce the contract contributes an error, not a silent pass.
///
/// # Errors
/// `BackendError::Malformed` when the response is not valid JSON or lacks
/// the `has_conflict` field.
pub fn parse_composition(backend: &str, raw: &str) -> BackendResult<Verdict> {
    let extracted = extract_json(raw);
    let value: serde_json::Value =
        serde_json::from_str(extracted).map_err(|e| BackendError::Malformed {
            backend: backend.to_string(),
            message: format!("invalid JSON: {e}"),
            raw: raw.to_string(),
        })?;

    let has_conflict = value
        .get("has_conflict")
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| BackendError::Malformed {
            backend: backend.to_string(),
            message: "missing boolean field 'has_conflict'".to_string(),
            raw: raw.to_string(),
        })?;

    let conflicts = value
        .get("conflicts")
        .and_then(serde_json::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(ConflictReport {
                        source: item.get("source")?.as_str()?.to_string(),
                        target: item.get("target")?.as_str()?.to_string(),
                        description: item
                            .get("description")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        resolution_hint: item
                            .get("resolution_hint")
                            .and_then(serde_json::Value::as_str)
                            .map(ToString::to_string),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let output = value
        .get("output")
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string);
    let rationale = value
        .get("rationale")
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string);

    Ok(Verdict {
        resolved: Some(!has_conflict),
        conflicts,
        rationale,
        output,
        raw: raw.to_string(),
    })
}

/// Strips a markdown code fence from a response, if present.
///
/// Backends frequently wrap JSON in ```` ```json ```` fences despite being
/// told not to; every parser in this crate goes through here first.
#[must_use]
pub fn extract_json(text: &str) -> &str {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?```").expect("fence regex is valid")
    });
    let trimmed = text.trim();
    match fence.captures(trimmed) {
        Some(caps) => caps.get(1).map_or(trimmed, |m| m.as_str().trim()),
        None => trimmed,
    }
}
