//! Findings: the output records of every evaluation path.
//!
//! A finding is one detected (or suspected) interference, with enough
//! provenance to audit where it came from: which blocks, which rule, which
//! backend, which pass, and the raw judgment text when a backend was
//! involved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::severity::{Epistemic, FindingSeverity, Severity};

/// What a finding is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSubject {
    /// A block pair, from the rule path.
    Pair {
        /// First block of the pair.
        a: BlockId,
        /// Second block of the pair.
        b: BlockId,
    },
    /// A single block.
    Block(BlockId),
    /// The whole document, from the exploratory path.
    Document,
}

impl FindingSubject {
    /// True if the finding involves the given block.
    #[must_use]
    pub fn involves(&self, id: BlockId) -> bool {
        match self {
            Self::Pair { a, b } => *a == id || *b == id,
            Self::Block(b) => *b == id,
            Self::Document => false,
        }
    }
}

/// Where a finding came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Backend that produced the judgment; `None` for structural findings.
    pub backend: Option<String>,
    /// True if no backend call was involved.
    #[serde(rename = "static")]
    pub is_static: bool,
    /// Raw judgment text, retained so non-determinism is auditable.
    pub raw_response: Option<String>,
    /// When the finding was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl Provenance {
    /// Provenance for a pure structural evaluation.
    #[must_use]
    pub fn structural() -> Self {
        Self {
            backend: None,
            is_static: true,
            raw_response: None,
            recorded_at: Utc::now(),
        }
    }

    /// Provenance for a backend judgment.
    #[must_use]
    pub fn judgment(backend: impl Into<String>, raw_response: impl Into<String>) -> Self {
        Self {
            backend: Some(backend.into()),
            is_static: false,
            raw_response: Some(raw_response.into()),
            recorded_at: Utc::now(),
        }
    }
}

/// One detected interference, or one recorded evaluation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// What the finding is about.
    pub subject: FindingSubject,
    /// The rule that produced it; `None` for exploratory findings.
    pub rule: Option<String>,
    /// Interference class slug, or the backend's own freeform label for
    /// exploratory findings.
    pub category: String,
    /// Severity, on whichever scale produced the finding.
    pub severity: FindingSeverity,
    /// Raw evaluation outcome in `[0.0, 1.0]`, when the path scores.
    pub score: Option<f32>,
    /// What the interference is.
    pub explanation: String,
    /// Where the finding came from.
    pub provenance: Provenance,
    /// Exploration pass number (1-based); `None` outside the
    /// exploratory path.
    pub pass: Option<u32>,
}

impl Finding {
    /// A finding from a structural rule evaluation.
    #[must_use]
    pub fn structural(
        a: BlockId,
        b: BlockId,
        rule: impl Into<String>,
        category: impl Into<String>,
        severity: Severity,
        score: f32,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            subject: FindingSubject::Pair { a, b },
            rule: Some(rule.into()),
            category: category.into(),
            severity: FindingSeverity::Impact(severity),
            score: Some(score),
            explanation: explanation.into(),
            provenance: Provenance::structural(),
            pass: None,
        }
    }

    /// A finding from a judgment-based rule evaluation.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn judgment(
        a: BlockId,
        b: BlockId,
        rule: impl Into<String>,
        category: impl Into<String>,
        severity: Severity,
        score: f32,
        explanation: impl Into<String>,
        backend: impl Into<String>,
        raw_response: impl Into<String>,
    ) -> Self {
        Self {
            subject: FindingSubject::Pair { a, b },
            rule: Some(rule.into()),
            category: category.into(),
            severity: FindingSeverity::Impact(severity),
            score: Some(score),
            explanation: explanation.into(),
            provenance: Provenance::judgment(backend, raw_response),
            pass: None,
        }
    }

    /// A recorded evaluation failure: the judgment response could not be
    /// turned into a verdict. Severity `Unknown`, never dropped.
    #[must_use]
    pub fn unknown(
        a: BlockId,
        b: BlockId,
        rule: impl Into<String>,
        category: impl Into<String>,
        explanation: impl Into<String>,
        backend: impl Into<String>,
        raw_response: Option<String>,
    ) -> Self {
        Self {
            subject: FindingSubject::Pair { a, b },
            rule: Some(rule.into()),
            category: category.into(),
            severity: FindingSeverity::Impact(Severity::Unknown),
            score: None,
            explanation: explanation.into(),
            provenance: Provenance {
                backend: Some(backend.into()),
                is_static: false,
                raw_response,
                recorded_at: Utc::now(),
            },
            pass: None,
        }
    }

    /// A finding from an exploratory pass, on the epistemic scale.
    #[must_use]
    pub fn exploratory(
        category: impl Into<String>,
        confidence: Epistemic,
        explanation: impl Into<String>,
        backend: impl Into<String>,
        pass: u32,
    ) -> Self {
        Self {
            subject: FindingSubject::Document,
            rule: None,
            category: category.into(),
            severity: FindingSeverity::Epistemic(confidence),
            score: None,
            explanation: explanation.into(),
            provenance: Provenance {
                backend: Some(backend.into()),
                is_static: false,
                raw_response: None,
                recorded_at: Utc::now(),
            },
            pass: Some(pass),
        }
    }

    /// Severity-weighted score used for ranking rule findings.
    ///
    /// Exploratory findings have no score and rank at zero here; they are
    /// ranked on their own scale by the exploration output.
    #[must_use]
    pub fn weighted_score(&self) -> f32 {
        match (self.score, self.severity.impact()) {
            (Some(score), Some(severity)) => score * severity.weight(),
            _ => 0.0,
        }
    }
}
