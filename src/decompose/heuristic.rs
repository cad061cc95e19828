//! Structural decomposer: splits raw document text into blocks without any
//! backend call.
//!
//! Splitting is driven by markdown structure (headings start blocks, code
//! fences stay whole, blank lines end paragraphs) and classification is
//! regex best-effort. The split is lossless: every byte of the source lands
//! in exactly one block, so concatenating blocks in ordinal order
//! reproduces the document exactly. Separator lines attach to the block
//! they follow.

use std::sync::OnceLock;

use regex::Regex;

use crate::block::{Block, Modality};
use crate::rule::extract_priority_markers;

use super::Document;

/// Splits a document into classified blocks. Infallible and deterministic.
#[must_use]
pub fn decompose(document: &Document) -> Vec<Block> {
    split_lossless(&document.text)
        .into_iter()
        .enumerate()
        .map(|(ordinal, chunk)| {
            let trimmed = chunk.trim();
            let markers = extract_priority_markers(trimmed);
            Block::new(document.source.clone(), ordinal, chunk.clone(), document.tier)
                .with_category(classify_category(trimmed))
                .with_modality(classify_modality(trimmed))
                .with_scope(extract_scope(trimmed))
                .with_priority_markers(markers)
        })
        .collect()
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#{1,3}\s+").expect("heading regex is valid"))
}

/// Splits text into chunks whose concatenation equals the input exactly.
fn split_lossless(text: &str) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_has_content = false;
    let mut in_fence = false;

    fn flush(current: &mut String, current_has_content: &mut bool, chunks: &mut Vec<String>) {
        if !current.is_empty() {
            chunks.push(std::mem::take(current));
        }
        *current_has_content = false;
    }

    for line in text.split_inclusive('\n') {
        let stripped = line.trim();

        if stripped.starts_with("```") {
            if in_fence {
                // Closing fence ends the code block.
                current.push_str(line);
                flush(&mut current, &mut current_has_content, &mut chunks);
                in_fence = false;
            } else {
                // Opening fence: close out any running paragraph first.
                if current_has_content {
                    flush(&mut current, &mut current_has_content, &mut chunks);
                }
                current.push_str(line);
                current_has_content = true;
                in_fence = true;
            }
            continue;
        }

        if in_fence {
            current.push_str(line);
            continue;
        }

        if heading_re().is_match(line) {
            if current_has_content {
                flush(&mut current, &mut current_has_content, &mut chunks);
            }
            current.push_str(line);
            current_has_content = true;
            continue;
        }

        if stripped.is_empty() {
            // Blank lines attach to the paragraph they follow.
            current.push_str(line);
            if current_has_content {
                flush(&mut current, &mut current_has_content, &mut chunks);
            }
            continue;
        }

        current.push_str(line);
        current_has_content = true;
    }

    if !current.is_empty() {
        if current_has_content || chunks.is_empty() {
            chunks.push(current);
        } else {
            // Trailing blank-only text folds into the last block.
            let last = chunks.last_mut().expect("chunks non-empty");
            last.push_str(&current);
        }
    }

    chunks
}

pub(crate) fn classify_modality(text: &str) -> Modality {
    static PROHIBITION: OnceLock<Regex> = OnceLock::new();
    static MANDATE: OnceLock<Regex> = OnceLock::new();
    static GUIDANCE: OnceLock<Regex> = OnceLock::new();

    let prohibition = PROHIBITION.get_or_init(|| {
        Regex::new(r"\b(NEVER|MUST NOT|DO NOT|DON'T|REFUSE|FORBIDDEN)\b")
            .expect("prohibition regex is valid")
    });
    // "MUST NOT" never reaches this check: the prohibition match wins first.
    let mandate = MANDATE.get_or_init(|| {
        Regex::new(r"\b(MUST|ALWAYS|REQUIRED|SHALL)\b").expect("mandate regex is valid")
    });
    let guidance = GUIDANCE.get_or_init(|| {
        Regex::new(r"\b(SHOULD|PREFER|RECOMMENDED?|CONSIDER|MAY|CAN|ALLOWED|OPTIONAL)\b")
            .expect("guidance regex is valid")
    });

    let upper = text.to_uppercase();
    // Most restrictive directive wins when a block mixes modalities.
    if prohibition.is_match(&upper) {
        Modality::Prohibition
    } else if mandate.is_match(&upper) {
        Modality::Mandate
    } else if guidance.is_match(&upper) {
        Modality::Guidance
    } else {
        Modality::Information
    }
}

fn classify_category(text: &str) -> &'static str {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            // Identity checked first: "you are a" is a strong signal.
            ("identity", r"\b(identity|who you are|you are an?)\b"),
            ("policy", r"\b(security|policy|safety|content.?policy|credentials?|secrets?)\b"),
            ("tool-definition", r"\b(tool|function|command|bash|glob|grep|read|write|edit)\b"),
            ("workflow", r"\b(workflow|step|process|procedure)\b"),
            ("context", r"\b(context|environment|platform|directory|working dir)\b"),
            ("meta", r"\b(formatting|output format|markdown|rendering)\b"),
        ]
        .into_iter()
        .map(|(tag, pattern)| {
            (
                tag,
                Regex::new(pattern).expect("category regex is valid"),
            )
        })
        .collect()
    });

    let lower = text.to_lowercase();
    for (tag, regex) in patterns {
        if regex.is_match(&lower) {
            return tag;
        }
    }
    "behavioral-constraint"
}

pub(crate) fn extract_scope(text: &str) -> Vec<String> {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            ("security", r"\b(security|safety|auth|credentials?|secrets?|vulnerability)\b"),
            ("git", r"\b(git|commit|branch|push|pull|merge|rebase)\b"),
            ("tool-usage", r"\b(tool|function|bash|glob|grep|read|write|edit)\b"),
            ("file-operations", r"\b(files?|directory|path|create|delete)\b"),
            ("communication", r"\b(output|respond|display|message|user|communicate)\b"),
            ("task-management", r"\b(todo|task|plan|progress|tracking)\b"),
        ]
        .into_iter()
        .map(|(scope, pattern)| {
            (
                scope,
                Regex::new(pattern).expect("scope regex is valid"),
            )
        })
        .collect()
    });

    let lower = text.to_lowercase();
    let mut scopes: Vec<String> = patterns
        .iter()
        .filter(|(_, regex)| regex.is_match(&lower))
        .map(|(scope, _)| (*scope).to_string())
        .collect();
    if scopes.is_empty() {
        scopes.push("general".to_string());
    }
    scopes
}
