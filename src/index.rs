//! The interference index: sparse findings over `(block_a, block_b, rule)`.
//!
//! Only pairs that passed a rule's pre-filter may gain an entry, so absence
//! of an entry is not evidence of no conflict — only that the pre-filter
//! excluded the pair. Sparseness is what bounds evaluation cost for
//! realistic documents.
//!
//! Entries merge keyed by `(a, b, rule)`: completion order of concurrent
//! evaluations never causes lost updates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::finding::{Finding, FindingSubject};
use crate::severity::Severity;

/// Canonical entry key: the pair is unordered, so endpoints are stored
/// sorted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    a: BlockId,
    b: BlockId,
    rule: String,
}

impl EntryKey {
    fn new(a: BlockId, b: BlockId, rule: &str) -> Self {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        Self {
            a,
            b,
            rule: rule.to_string(),
        }
    }
}

/// Sparse map of findings keyed by `(block_a, block_b, rule)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "IndexSnapshot", from = "IndexSnapshot")]
pub struct InterferenceIndex {
    block_ids: Vec<BlockId>,
    rule_ids: Vec<String>,
    entries: BTreeMap<EntryKey, Finding>,
}

impl InterferenceIndex {
    /// Creates an empty index over the given block and rule axes.
    #[must_use]
    pub fn new(block_ids: Vec<BlockId>, rule_ids: Vec<String>) -> Self {
        Self {
            block_ids,
            rule_ids,
            entries: BTreeMap::new(),
        }
    }

    /// Inserts (or replaces) the finding for a pair under a rule.
    ///
    /// The pair is canonicalized, so `(a, b)` and `(b, a)` address the same
    /// cell. Returns the displaced finding, if any.
    pub fn insert(&mut self, a: BlockId, b: BlockId, rule: &str, finding: Finding) -> Option<Finding> {
        self.entries.insert(EntryKey::new(a, b, rule), finding)
    }

    /// The finding for a pair under a rule, if recorded.
    #[must_use]
    pub fn get(&self, a: BlockId, b: BlockId, rule: &str) -> Option<&Finding> {
        self.entries.get(&EntryKey::new(a, b, rule))
    }

    /// True if the pair has an entry under the rule.
    #[must_use]
    pub fn contains(&self, a: BlockId, b: BlockId, rule: &str) -> bool {
        self.get(a, b, rule).is_some()
    }

    /// All findings, in key order.
    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.entries.values()
    }

    /// Number of recorded findings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no finding is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Logical shape: `(n_blocks, n_blocks, n_rules)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize, usize) {
        let n = self.block_ids.len();
        (n, n, self.rule_ids.len())
    }

    /// Absorbs every entry of `other`, keyed — later merges win per cell.
    pub fn merge(&mut self, other: Self) {
        self.entries.extend(other.entries);
    }

    /// Findings grouped by impact severity. Exploratory-scale findings
    /// never appear here; the index holds the rule path only.
    #[must_use]
    pub fn by_severity(&self) -> BTreeMap<Severity, Vec<&Finding>> {
        let mut grouped: BTreeMap<Severity, Vec<&Finding>> = BTreeMap::new();
        for finding in self.entries.values() {
            if let Some(severity) = finding.severity.impact() {
                grouped.entry(severity).or_default().push(finding);
            }
        }
        grouped
    }

    /// Findings grouped by rule id.
    #[must_use]
    pub fn by_rule(&self) -> BTreeMap<&str, Vec<&Finding>> {
        let mut grouped: BTreeMap<&str, Vec<&Finding>> = BTreeMap::new();
        for (key, finding) in &self.entries {
            grouped.entry(key.rule.as_str()).or_default().push(finding);
        }
        grouped
    }

    /// All findings involving a specific block.
    #[must_use]
    pub fn by_block(&self, id: BlockId) -> Vec<&Finding> {
        self.entries
            .values()
            .filter(|f| f.subject.involves(id))
            .collect()
    }

    /// Top `n` findings by severity-weighted score, descending.
    #[must_use]
    pub fn top(&self, n: usize) -> Vec<&Finding> {
        let mut ranked: Vec<&Finding> = self.entries.values().collect();
        ranked.sort_by(|x, y| {
            y.weighted_score()
                .partial_cmp(&x.weighted_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(n);
        ranked
    }

    /// Aggregate score: max severity-weighted score across all entries.
    #[must_use]
    pub fn summary_score(&self) -> f32 {
        self.entries
            .values()
            .map(Finding::weighted_score)
            .fold(0.0, f32::max)
    }

    /// Fraction of possible cells with an entry. For a symmetric index
    /// with no self-pairs there are `n * (n - 1) / 2 * r` possible cells.
    #[must_use]
    pub fn density(&self) -> f32 {
        let n = self.block_ids.len();
        let r = self.rule_ids.len();
        let possible = n * n.saturating_sub(1) / 2 * r;
        if possible == 0 {
            return 0.0;
        }
        self.entries.len() as f32 / possible as f32
    }

    /// Human-readable summary of the recorded interference.
    #[must_use]
    pub fn summary_report(&self) -> String {
        if self.entries.is_empty() {
            return "No interference detected.".to_string();
        }

        let (n, _, r) = self.shape();
        let mut lines = vec![
            format!(
                "Interference index: ({n}, {n}, {r}) shape, {} entr{}",
                self.entries.len(),
                if self.entries.len() == 1 { "y" } else { "ies" }
            ),
            format!("Summary score: {:.2}", self.summary_score()),
            format!("Density: {:.1}%", self.density() * 100.0),
            String::new(),
        ];

        let grouped = self.by_severity();
        for severity in [
            Severity::Critical,
            Severity::Major,
            Severity::Minor,
            Severity::Unknown,
        ] {
            let Some(findings) = grouped.get(&severity) else {
                continue;
            };
            lines.push(format!("  {severity}: {} finding(s)", findings.len()));
            let mut ranked = findings.clone();
            ranked.sort_by(|x, y| {
                y.weighted_score()
                    .partial_cmp(&x.weighted_score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for finding in ranked.iter().take(5) {
                if let FindingSubject::Pair { a, b } = finding.subject {
                    let rule = finding.rule.as_deref().unwrap_or("-");
                    let score = finding
                        .score
                        .map_or_else(|| "-".to_string(), |s| format!("{s:.2}"));
                    lines.push(format!("    {a} <-> {b} [{rule}]: {score}"));
                    if !finding.explanation.is_empty() {
                        let mut expl = finding.explanation.clone();
                        if expl.len() > 120 {
                            let cut = expl
                                .char_indices()
                                .nth(120)
                                .map_or(expl.len(), |(i, _)| i);
                            expl.truncate(cut);
                        }
                        lines.push(format!("      {expl}"));
                    }
                }
            }
        }

        lines.join("\n")
    }
}

/// JSON-safe shape of the index: a findings list plus its axes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexSnapshot {
    block_ids: Vec<BlockId>,
    rule_ids: Vec<String>,
    findings: Vec<Finding>,
}

impl From<InterferenceIndex> for IndexSnapshot {
    fn from(index: InterferenceIndex) -> Self {
        Self {
            block_ids: index.block_ids,
            rule_ids: index.rule_ids,
            findings: index.entries.into_values().collect(),
        }
    }
}

impl From<IndexSnapshot> for InterferenceIndex {
    fn from(snapshot: IndexSnapshot) -> Self {
        let mut index = Self::new(snapshot.block_ids, snapshot.rule_ids);
        for finding in snapshot.findings {
            if let (FindingSubject::Pair { a, b }, Some(rule)) =
                (finding.subject, finding.rule.clone())
            {
                index.insert(a, b, &rule, finding);
            }
        }
        index
    }
}
