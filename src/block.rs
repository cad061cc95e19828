//! Classified blocks of a source document.
//!
//! A block is a contiguous unit of document text with a classification:
//! which trust tier it belongs to, what kind of directive it carries, and
//! what behavior it governs. Blocks are produced once per decomposition run
//! and are immutable; re-decomposing a changed document yields fresh ids.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving block ids (UUIDv5).
const BLOCK_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5c, 0x1a, 0x0d, 0x8e, 0x3b, 0x42, 0x4f, 0x6a, 0x9d, 0x11, 0x2e, 0x70, 0xc4, 0x55, 0x8f,
    0x21,
]);

/// Unique identifier for a block.
///
/// Derived deterministically from `(source, ordinal, text)`: decomposing the
/// same document twice yields the same ids, while any text change yields new
/// ones. Ids are never re-used for different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(Uuid);

impl BlockId {
    /// Derives the id for a block at `ordinal` within `source` with `text`.
    #[must_use]
    pub fn derive(source: &str, ordinal: usize, text: &str) -> Self {
        let mut name = Vec::with_capacity(source.len() + text.len() + 24);
        name.extend_from_slice(source.as_bytes());
        name.push(0);
        name.extend_from_slice(&ordinal.to_le_bytes());
        name.push(0);
        name.extend_from_slice(text.as_bytes());
        Self(Uuid::new_v5(&BLOCK_NAMESPACE, &name))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A block's trust/mutability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Invariant rules. The constitution; must be internally consistent.
    Foundational,
    /// Contextual knowledge. Mutable; internal conflicts are expected
    /// and reported, not rejected.
    Contextual,
    /// Per-query input. Untrusted.
    Candidate,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Foundational => "foundational",
            Self::Contextual => "contextual",
            Self::Candidate => "candidate",
        };
        write!(f, "{s}")
    }
}

/// The deontic modality of a block's directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// "always", "must", "required".
    Mandate,
    /// "never", "do not", "must not".
    Prohibition,
    /// Recommendations without directive force.
    Guidance,
    /// Declarative content; no directive at all.
    Information,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Mandate => "mandate",
            Self::Prohibition => "prohibition",
            Self::Guidance => "guidance",
            Self::Information => "information",
        };
        write!(f, "{s}")
    }
}

/// A classified, contiguous segment of a source document.
///
/// `text` is the raw snapshot including trailing separators, so that
/// concatenating a document's blocks in ordinal order reproduces the source
/// exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Stable identifier, derived from `(source, ordinal, text)`.
    pub id: BlockId,
    /// Corpus identifier of the originating document.
    pub source: String,
    /// Position within the decomposition (0-based).
    pub ordinal: usize,
    /// Immutable raw text snapshot.
    pub text: String,
    /// Trust tier.
    pub tier: Tier,
    /// Open classification tag, e.g. "tool-usage", "identity".
    pub category: String,
    /// Directive force of the block.
    pub modality: Modality,
    /// Topic/tool identifiers this block governs.
    pub scope: BTreeSet<String>,
    /// Explicit precedence annotations, in order of appearance.
    pub priority_markers: Vec<String>,
}

impl Block {
    /// Creates a block with the given position and tier; classification
    /// fields start at their neutral defaults.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        ordinal: usize,
        text: impl Into<String>,
        tier: Tier,
    ) -> Self {
        let source = source.into();
        let text = text.into();
        let id = BlockId::derive(&source, ordinal, &text);
        Self {
            id,
            source,
            ordinal,
            text,
            tier,
            category: "general".to_string(),
            modality: Modality::Information,
            scope: BTreeSet::new(),
            priority_markers: Vec::new(),
        }
    }

    /// Sets the category tag.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Sets the modality.
    #[must_use]
    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = modality;
        self
    }

    /// Sets the governed scope.
    #[must_use]
    pub fn with_scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the ordered priority markers.
    #[must_use]
    pub fn with_priority_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    /// True if this block shares any scope entry with another.
    #[must_use]
    pub fn scopes_overlap(&self, other: &Self) -> bool {
        self.scope.intersection(&other.scope).next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_across_runs() {
        let a = BlockId::derive("corpus/v1", 3, "Always respond in English.");
        let b = BlockId::derive("corpus/v1", 3, "Always respond in English.");
        assert_eq!(a, b);
    }

    #[test]
    fn text_change_yields_new_id() {
        let a = BlockId::derive("corpus/v1", 3, "Always respond in English.");
        let b = BlockId::derive("corpus/v1", 3, "Always respond in French.");
        assert_ne!(a, b);
    }

    #[test]
    fn ordinal_participates_in_identity() {
        let a = BlockId::derive("corpus/v1", 0, "same text");
        let b = BlockId::derive("corpus/v1", 1, "same text");
        assert_ne!(a, b);
    }

    #[test]
    fn scopes_overlap_on_shared_entry() {
        let a = Block::new("s", 0, "a", Tier::Foundational).with_scope(["git", "security"]);
        let b = Block::new("s", 1, "b", Tier::Contextual).with_scope(["security"]);
        let c = Block::new("s", 2, "c", Tier::Contextual).with_scope(["formatting"]);
        assert!(a.scopes_overlap(&b));
        assert!(!a.scopes_overlap(&c));
    }

    #[test]
    fn block_serde_round_trip() {
        let block = Block::new("corpus/v1", 0, "NEVER push to main.", Tier::Foundational)
            .with_category("policy")
            .with_modality(Modality::Prohibition)
            .with_scope(["git"])
            .with_priority_markers(["NEVER"]);
        let json = serde_json::to_string(&block).unwrap();
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
    }
}
