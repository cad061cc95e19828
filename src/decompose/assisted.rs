//! Judgment-assisted decomposition.
//!
//! A backend proposes block boundaries and classifications for a document.
//! The backend's split is never trusted blindly: the returned blocks must
//! reconstruct the source text exactly, and any gap, overlap, or edit fails
//! the decomposition instead of silently accepting a garbled split.

use serde::Deserialize;

use crate::backend::{Backend, CancelToken, JudgeRequest, RequestKind};
use crate::block::{Block, Modality, Tier};
use crate::error::{CrosstalkResult, DecompositionError};
use crate::rule::{extract_priority_markers, CompiledRuleSet};

use super::{verify_reconstruction, Document};

const DECOMPOSE_TEMPLATE: &str = "\
You are an instruction-document analyst. Break the following document into
contiguous, non-overlapping blocks and classify each one.

## Classification schema

### tier (trust class of the block)
- foundational: invariant rules, core identity. Must be internally consistent.
- contextual: domain knowledge and guidance. May conflict.
- candidate: per-query or per-session input. Untrusted.

### modality (directive force)
- prohibition: \"never\", \"do not\", \"must not\"
- mandate: \"always\", \"must\", \"required\"
- guidance: recommendations without hard directive force
- information: declarative content, no directive

### scope
List the behavior topics the block governs (e.g. \"git\", \"security\",
\"tool-usage\").

{scope_guidance}

## Critical requirement

The \"text\" fields must be the EXACT source text, byte for byte, in
document order, covering the whole document with no gaps and no overlaps.
Include every blank line and separator in exactly one block. Do not rewrite,
trim, or normalize anything.

## Document

{document}

## Output format

Respond with a JSON array only. No explanation outside the JSON.

[
  {
    \"text\": \"<exact text of this block>\",
    \"tier\": \"<foundational|contextual|candidate>\",
    \"category\": \"<freeform tag, e.g. identity, policy, tool-definition>\",
    \"modality\": \"<prohibition|mandate|guidance|information>\",
    \"scope\": [\"<topic>\", \"<topic>\"]
  }
]";

#[derive(Debug, Deserialize)]
struct RawBlock {
    text: String,
    tier: Option<Tier>,
    #[serde(default)]
    category: Option<String>,
    modality: Option<Modality>,
    #[serde(default)]
    scope: Vec<String>,
}

/// Backend-assisted decomposer.
///
/// Builds the decomposition prompt, parses the response, and enforces the
/// reconstruction contract. The prompt can be guided by a rule set so the
/// backend pays attention to the scope dimensions the rules care about.
#[derive(Debug, Clone)]
pub struct AssistedDecomposer {
    scope_guidance: String,
}

impl AssistedDecomposer {
    /// A decomposer guided by a rule set's interference interests.
    #[must_use]
    pub fn new(rules: &CompiledRuleSet) -> Self {
        let mut lines = vec![
            "The evaluation rules care about these interference patterns; \
             pay attention to blocks that could trigger them:"
                .to_string(),
        ];
        for rule in rules.rules() {
            lines.push(format!("- {}: {}", rule.id, rule.description));
        }
        Self {
            scope_guidance: lines.join("\n"),
        }
    }

    /// A decomposer with no rule-set guidance.
    #[must_use]
    pub fn unguided() -> Self {
        Self {
            scope_guidance: "No specific scope guidance; classify all dimensions.".to_string(),
        }
    }

    /// Builds the judgment request for a document.
    #[must_use]
    pub fn build_request(&self, document: &Document) -> JudgeRequest {
        let prompt = DECOMPOSE_TEMPLATE
            .replace("{scope_guidance}", &self.scope_guidance)
            .replace("{document}", &document.text);
        JudgeRequest::new(RequestKind::Decomposition, prompt)
            .with_meta("document", document.source.clone())
    }

    /// Parses a backend response into blocks and validates reconstruction.
    ///
    /// Exposed separately so callers can route the backend call themselves
    /// and still get the same parsing and integrity checks.
    ///
    /// # Errors
    /// `DecompositionError::Unparseable` for malformed JSON,
    /// `DecompositionError::InvalidBlock` for empty block text, and
    /// `DecompositionError::Integrity` when the blocks do not reproduce
    /// the document.
    pub fn parse_response(
        &self,
        document: &Document,
        raw: &str,
    ) -> Result<Vec<Block>, DecompositionError> {
        let extracted = crate::backend::extract_json(raw);
        let raw_blocks: Vec<RawBlock> =
            serde_json::from_str(extracted).map_err(|e| DecompositionError::Unparseable {
                source_id: document.source.clone(),
                reason: format!("{e}; response starts: {}", snippet(raw)),
            })?;

        for (index, raw_block) in raw_blocks.iter().enumerate() {
            if raw_block.text.is_empty() {
                return Err(DecompositionError::InvalidBlock {
                    source_id: document.source.clone(),
                    index,
                    reason: "empty text".to_string(),
                });
            }
        }

        let texts: Vec<&str> = raw_blocks.iter().map(|b| b.text.as_str()).collect();
        verify_reconstruction(&document.source, &document.text, &texts)?;

        Ok(raw_blocks
            .into_iter()
            .enumerate()
            .map(|(ordinal, raw_block)| {
                let markers = extract_priority_markers(&raw_block.text);
                Block::new(
                    document.source.clone(),
                    ordinal,
                    raw_block.text,
                    raw_block.tier.unwrap_or(document.tier),
                )
                .with_category(raw_block.category.unwrap_or_else(|| "general".to_string()))
                .with_modality(raw_block.modality.unwrap_or(Modality::Information))
                .with_scope(raw_block.scope)
                .with_priority_markers(markers)
            })
            .collect())
    }

    /// Runs the full assisted decomposition through a backend.
    ///
    /// # Errors
    /// Backend failures propagate as `CrosstalkError::Backend`; parse and
    /// integrity failures as `CrosstalkError::Decomposition`.
    pub fn decompose(
        &self,
        document: &Document,
        backend: &dyn Backend,
        cancel: &CancelToken,
    ) -> CrosstalkResult<Vec<Block>> {
        let request = self.build_request(document);
        let verdict = backend.judge(&request, cancel)?;
        Ok(self.parse_response(document, &verdict.raw)?)
    }
}

fn snippet(raw: &str) -> String {
    let trimmed = raw.trim();
    let cut = trimmed
        .char_indices()
        .nth(200)
        .map_or(trimmed.len(), |(i, _)| i);
    trimmed[..cut].to_string()
}
