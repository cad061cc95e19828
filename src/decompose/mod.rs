//! Document decomposition: turning a source document into classified blocks.
//!
//! Three paths produce blocks:
//! - [`heuristic::decompose`] — structural splitting, no backend cost;
//! - [`AssistedDecomposer`](assisted::AssistedDecomposer) — a backend
//!   proposes boundaries and classifications;
//! - [`from_segments`] — pre-tagged boundaries supplied by the caller
//!   (testing, pre-segmented input).
//!
//! Every path holds the same integrity contract: the produced blocks cover
//! the source text exactly, without gaps or overlaps, so concatenating them
//! in ordinal order reproduces the document byte for byte. Decomposition
//! never reads or writes the interference index.

use serde::{Deserialize, Serialize};

use crate::block::{Block, Modality, Tier};
use crate::error::{CrosstalkResult, DecompositionError};
use crate::rule::extract_priority_markers;

pub mod assisted;
pub mod heuristic;

pub use assisted::AssistedDecomposer;

/// A source document plus its declared trust tier.
///
/// Tier is usually document-scoped in simple uses; mixed documents go
/// through the assisted path or [`from_segments`], both of which can tag
/// tiers per block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Corpus identifier, e.g. "agent-prompt/v2.1".
    pub source: String,
    /// The raw document text.
    pub text: String,
    /// Tier applied to blocks that carry no tier annotation of their own.
    pub tier: Tier,
}

impl Document {
    /// Creates a document.
    #[must_use]
    pub fn new(source: impl Into<String>, text: impl Into<String>, tier: Tier) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
            tier,
        }
    }
}

/// A pre-tagged segment for the bypass path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Raw segment text, including its separators.
    pub text: String,
    /// Tier override; `None` inherits the document tier.
    pub tier: Option<Tier>,
    /// Classification tag.
    pub category: String,
    /// Directive force.
    pub modality: Modality,
    /// Governed scope.
    pub scope: Vec<String>,
}

impl Segment {
    /// Creates a segment with neutral classification.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tier: None,
            category: "general".to_string(),
            modality: Modality::Information,
            scope: Vec::new(),
        }
    }

    /// Sets the tier override.
    #[must_use]
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
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
}

/// Builds blocks from caller-supplied boundaries.
///
/// # Errors
/// `DecompositionError::Integrity` if the segments do not reconstruct the
/// document text exactly.
pub fn from_segments(document: &Document, segments: &[Segment]) -> CrosstalkResult<Vec<Block>> {
    let texts: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
    verify_reconstruction(&document.source, &document.text, &texts)?;

    let blocks = segments
        .iter()
        .enumerate()
        .map(|(ordinal, segment)| {
            let markers = extract_priority_markers(&segment.text);
            Block::new(
                document.source.clone(),
                ordinal,
                segment.text.clone(),
                segment.tier.unwrap_or(document.tier),
            )
            .with_category(segment.category.clone())
            .with_modality(segment.modality)
            .with_scope(segment.scope.iter().cloned())
            .with_priority_markers(markers)
        })
        .collect();

    Ok(blocks)
}

/// Checks that `parts`, concatenated in order, reproduce `original` exactly.
///
/// # Errors
/// `DecompositionError::Integrity` carrying the byte offset of the first
/// divergence.
pub fn verify_reconstruction(
    source: &str,
    original: &str,
    parts: &[&str],
) -> Result<(), DecompositionError> {
    let mut offset = 0usize;
    let original_bytes = original.as_bytes();
    let reconstructed_len: usize = parts.iter().map(|p| p.len()).sum();

    for part in parts {
        let part_bytes = part.as_bytes();
        let end = offset + part_bytes.len();
        if end > original_bytes.len() || &original_bytes[offset..end] != part_bytes {
            let divergence = part_bytes
                .iter()
                .enumerate()
                .position(|(i, byte)| {
                    original_bytes.get(offset + i) != Some(byte)
                })
                .map_or(offset + part_bytes.len(), |i| offset + i);
            return Err(DecompositionError::Integrity {
                source_id: source.to_string(),
                offset: divergence,
                reconstructed_len,
                source_len: original.len(),
            });
        }
        offset = end;
    }

    if offset != original.len() {
        return Err(DecompositionError::Integrity {
            source_id: source.to_string(),
            offset,
            reconstructed_len,
            source_len: original.len(),
        });
    }

    Ok(())
}
