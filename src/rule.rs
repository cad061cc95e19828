//! The rule language for interference detection.
//!
//! A rule identifies one interference class between two blocks. Rules come
//! in two flavors: structural (pure predicates, no backend cost, fully
//! reproducible) and judgment-based (a prompt template dispatched to a
//! backend). Rule sets must compile before use; compilation reports every
//! problem at once rather than the first.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::{Block, Modality};
use crate::severity::Severity;

/// How two blocks interfere with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// The same action is both required and forbidden.
    DirectContradiction,
    /// Two blocks regulate the same behavior with redundant or
    /// subtly different instructions.
    ScopeOverlap,
    /// Competing precedence annotations with no declared winner.
    PriorityAmbiguity,
    /// One block depends on or overrides another without declaring it.
    ImplicitDependency,
    /// Substantially identical text in two places.
    VerbatimDuplication,
}

impl RuleKind {
    /// Snake-case slug used as the finding category for this class.
    #[must_use]
    pub const fn slug(self) -> &'static str {
        match self {
            Self::DirectContradiction => "direct_contradiction",
            Self::ScopeOverlap => "scope_overlap",
            Self::PriorityAmbiguity => "priority_ambiguity",
            Self::ImplicitDependency => "implicit_dependency",
            Self::VerbatimDuplication => "verbatim_duplication",
        }
    }
}

/// Structural checks: pure functions over a block pair, no backend cost.
///
/// This is a closed set on purpose — determinism is a property of the
/// structural subset and these are tested exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralCheck {
    /// Both blocks carry precedence annotations; shared marker vocabulary
    /// suggests competing priority claims.
    PriorityMarkers,
    /// Token-overlap similarity between the two texts.
    VerbatimDuplication,
}

impl StructuralCheck {
    /// Scores a block pair in `[0.0, 1.0]`.
    #[must_use]
    pub fn score(self, a: &Block, b: &Block) -> f32 {
        match self {
            Self::PriorityMarkers => score_priority_markers(a, b),
            Self::VerbatimDuplication => score_verbatim_duplication(a, b),
        }
    }
}

/// How a rule evaluates a pre-filtered pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evaluation {
    /// Pure predicate; always run first, zero backend cost.
    Structural(StructuralCheck),
    /// Judgment request template with `{block_a}` and `{block_b}`
    /// placeholders, dispatched to a backend.
    Judgment {
        /// The prompt template.
        template: String,
    },
}

/// A single rule for detecting interference between blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule identifier, e.g. "mandate-prohibition-conflict".
    pub id: String,
    /// The interference class this rule detects.
    pub kind: RuleKind,
    /// Human description of what the rule catches.
    pub description: String,
    /// Impact severity assigned when the rule triggers.
    pub severity: Severity,
    /// Pre-filter: only evaluate pairs with shared scope entries.
    pub requires_scope_overlap: bool,
    /// Pre-filter: block A must have this modality (`None` = any).
    pub modality_a: Option<Modality>,
    /// Pre-filter: block B must have this modality (`None` = any).
    pub modality_b: Option<Modality>,
    /// Minimum score (exclusive) for the rule to produce a finding.
    pub threshold: f32,
    /// Structural predicate or judgment template.
    pub evaluation: Evaluation,
}

impl Rule {
    /// Pre-filter: does this rule apply to this ordered block pair?
    ///
    /// Cheap by construction; this is what bounds evaluation cost to the
    /// pairs with genuine scope/modality tension.
    #[must_use]
    pub fn applies_to(&self, a: &Block, b: &Block) -> bool {
        if self.requires_scope_overlap && !a.scopes_overlap(b) {
            return false;
        }
        if let Some(m) = self.modality_a {
            if a.modality != m {
                return false;
            }
        }
        if let Some(m) = self.modality_b {
            if b.modality != m {
                return false;
            }
        }
        true
    }

    /// Maps a raw evaluation outcome to a severity level.
    ///
    /// `None` means the outcome is below this rule's detection threshold
    /// and no finding is recorded.
    #[must_use]
    pub fn severity_of(&self, score: f32) -> Option<Severity> {
        (score > self.threshold).then_some(self.severity)
    }

    /// True if evaluating this rule needs a backend call.
    #[must_use]
    pub const fn needs_judgment(&self) -> bool {
        matches!(self.evaluation, Evaluation::Judgment { .. })
    }

    /// Renders the judgment prompt for a block pair.
    ///
    /// Returns `None` for structural rules.
    #[must_use]
    pub fn render_prompt(&self, a: &Block, b: &Block) -> Option<String> {
        match &self.evaluation {
            Evaluation::Judgment { template } => Some(
                template
                    .replace("{block_a}", &a.text)
                    .replace("{block_b}", &b.text),
            ),
            Evaluation::Structural(_) => None,
        }
    }
}

/// Raised when a rule set fails consistency checking.
#[derive(Debug, Error)]
#[error(
    "Rule set '{set}' failed compilation with {} problem(s): {}",
    problems.len(),
    problems.join("; ")
)]
pub struct CompilationError {
    /// Name of the offending rule set.
    pub set: String,
    /// Every problem found, not just the first.
    pub problems: Vec<String>,
}

/// An unvalidated collection of rules. Must be compiled before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Rule set name, used in provenance and error messages.
    pub name: String,
    /// The rules, in declaration order.
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Creates an empty rule set.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    /// Adds a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Validates internal consistency and returns a [`CompiledRuleSet`].
    ///
    /// Checks: unique non-empty ids, judgment templates carry both
    /// placeholders, thresholds are finite and in `[0.0, 1.0]`.
    ///
    /// # Errors
    /// `CompilationError` listing all problems found.
    pub fn compile(self) -> Result<CompiledRuleSet, CompilationError> {
        let mut problems = Vec::new();
        let mut seen: BTreeSet<&str> = BTreeSet::new();

        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                problems.push("rule with empty id".to_string());
            } else if !seen.insert(rule.id.as_str()) {
                problems.push(format!("duplicate rule id: '{}'", rule.id));
            }

            if let Evaluation::Judgment { template } = &rule.evaluation {
                for placeholder in ["{block_a}", "{block_b}"] {
                    if !template.contains(placeholder) {
                        problems.push(format!(
                            "rule '{}': judgment template is missing the {placeholder} placeholder",
                            rule.id
                        ));
                    }
                }
            }

            if !rule.threshold.is_finite() || !(0.0..=1.0).contains(&rule.threshold) {
                problems.push(format!(
                    "rule '{}': threshold {} is outside [0.0, 1.0]",
                    rule.id, rule.threshold
                ));
            }
        }

        if problems.is_empty() {
            Ok(CompiledRuleSet {
                name: self.name,
                rules: self.rules,
            })
        } else {
            Err(CompilationError {
                set: self.name,
                problems,
            })
        }
    }
}

/// A validated, ready-to-execute rule set.
///
/// Created only via [`RuleSet::compile`]. The existence of this value is
/// the guarantee that the engine can run these rules without hitting
/// structural surprises.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledRuleSet {
    name: String,
    rules: Vec<Rule>,
}

impl CompiledRuleSet {
    /// The rule set name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All rules, in declaration order.
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Rules that run as pure predicates.
    pub fn structural_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| !r.needs_judgment())
    }

    /// Rules that need a backend.
    pub fn judgment_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.needs_judgment())
    }

    /// All `(a, b, rule)` triples that pass pre-filtering.
    ///
    /// Considers unordered pairs only — no self-pairs, no duplicates. Both
    /// orientations are checked for rules with asymmetric modality filters,
    /// so a (Prohibition, Mandate) pair still meets a Mandate/Prohibition
    /// rule.
    #[must_use]
    pub fn applicable_pairs<'a>(
        &'a self,
        blocks: &'a [Block],
    ) -> Vec<(&'a Block, &'a Block, &'a Rule)> {
        let mut triples = Vec::new();
        for (i, a) in blocks.iter().enumerate() {
            for b in &blocks[i + 1..] {
                for rule in &self.rules {
                    if rule.applies_to(a, b) {
                        triples.push((a, b, rule));
                    } else if rule.modality_a != rule.modality_b && rule.applies_to(b, a) {
                        triples.push((b, a, rule));
                    }
                }
            }
        }
        triples
    }
}

// ---------------------------------------------------------------------------
// Structural scoring
// ---------------------------------------------------------------------------

fn marker_regex() -> &'static Regex {
    static MARKERS: OnceLock<Regex> = OnceLock::new();
    MARKERS.get_or_init(|| {
        Regex::new(r"\b(IMPORTANT|CRITICAL|MUST|NEVER|ALWAYS|REQUIRED)\b")
            .expect("marker regex is valid")
    })
}

/// Extracts precedence annotations in order of appearance, deduplicated.
#[must_use]
pub fn extract_priority_markers(text: &str) -> Vec<String> {
    let upper = text.to_uppercase();
    let mut seen = BTreeSet::new();
    let mut markers = Vec::new();
    for m in marker_regex().find_iter(&upper) {
        if seen.insert(m.as_str().to_string()) {
            markers.push(m.as_str().to_string());
        }
    }
    markers
}

fn score_priority_markers(a: &Block, b: &Block) -> f32 {
    let markers_a: BTreeSet<String> = extract_priority_markers(&a.text).into_iter().collect();
    let markers_b: BTreeSet<String> = extract_priority_markers(&b.text).into_iter().collect();

    if markers_a.is_empty() || markers_b.is_empty() {
        return 0.0;
    }

    let shared = markers_a.intersection(&markers_b).count();
    if shared == 0 {
        // Different markers: mild ambiguity.
        return 0.1;
    }

    // Both claim priority with the same vocabulary.
    (0.3 + 0.1 * shared as f32).min(1.0)
}

fn score_verbatim_duplication(a: &Block, b: &Block) -> f32 {
    let ratio = token_similarity(&a.text, &b.text);
    if ratio < 0.5 {
        return 0.0;
    }
    // 0.5 similarity scores 0.0; identical text scores 1.0.
    (ratio - 0.5) * 2.0
}

/// Multiset token overlap (Dice coefficient) over whitespace tokens.
fn token_similarity(a: &str, b: &str) -> f32 {
    use std::collections::HashMap;

    let tokens_a: Vec<&str> = a.split_whitespace().collect();
    let tokens_b: Vec<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in &tokens_a {
        *counts.entry(t).or_insert(0) += 1;
    }
    let mut common = 0usize;
    for t in &tokens_b {
        if let Some(c) = counts.get_mut(t) {
            if *c > 0 {
                *c -= 1;
                common += 1;
            }
        }
    }

    2.0 * common as f32 / (tokens_a.len() + tokens_b.len()) as f32
}

// ---------------------------------------------------------------------------
// Built-in rules
// ---------------------------------------------------------------------------

const MANDATE_PROHIBITION_TEMPLATE: &str = "\
You are analyzing two blocks from an instruction document for interference.

## Block A
{block_a}

## Block B
{block_b}

## Task
Does Block A require something that Block B forbids, or vice versa? This is
a direct contradiction if the same action is both required and forbidden,
even when the two blocks frame it in different contexts.

Respond with JSON only:
{
  \"score\": <float 0.0 to 1.0, where 1.0 = certain contradiction>,
  \"explanation\": \"<why this is or isn't a require/forbid conflict>\"
}";

const SCOPE_OVERLAP_TEMPLATE: &str = "\
You are analyzing two blocks from an instruction document for interference.

## Block A
{block_a}

## Block B
{block_b}

## Task
Do these blocks regulate the same behavior with overlapping or redundant
instructions? Score higher if the overlap creates ambiguity about which
instruction takes precedence, or if they give subtly different guidance on
the same topic.

Respond with JSON only:
{
  \"score\": <float 0.0 to 1.0, where 1.0 = highly ambiguous overlap>,
  \"explanation\": \"<what overlaps and whether it creates ambiguity>\"
}";

const IMPLICIT_DEPENDENCY_TEMPLATE: &str = "\
You are analyzing two blocks from an instruction document for interference.

## Block A
{block_a}

## Block B
{block_b}

## Task
Does Block A implicitly depend on or override Block B (or vice versa)
without declaring the relationship? An undeclared dependency exists when one
block's instructions only make sense in the context of the other, or when
one block silently narrows or broadens the other's scope.

Respond with JSON only:
{
  \"score\": <float 0.0 to 1.0, where 1.0 = strong undeclared dependency>,
  \"explanation\": \"<what the implicit relationship is>\"
}";

/// The built-in rule catalogue: one rule per interference class.
#[must_use]
pub fn builtin_rules() -> Vec<Rule> {
    vec![
        Rule {
            id: "mandate-prohibition-conflict".to_string(),
            kind: RuleKind::DirectContradiction,
            description: "One block mandates an action that another block prohibits \
                          (e.g. 'always use X' vs 'never use X')."
                .to_string(),
            severity: Severity::Critical,
            requires_scope_overlap: true,
            modality_a: Some(Modality::Mandate),
            modality_b: Some(Modality::Prohibition),
            threshold: 0.5,
            evaluation: Evaluation::Judgment {
                template: MANDATE_PROHIBITION_TEMPLATE.to_string(),
            },
        },
        Rule {
            id: "scope-overlap-redundancy".to_string(),
            kind: RuleKind::ScopeOverlap,
            description: "Two blocks regulate the same behavior with overlapping or \
                          redundant instructions, potentially creating ambiguity."
                .to_string(),
            severity: Severity::Major,
            requires_scope_overlap: true,
            modality_a: None,
            modality_b: None,
            threshold: 0.5,
            evaluation: Evaluation::Judgment {
                template: SCOPE_OVERLAP_TEMPLATE.to_string(),
            },
        },
        Rule {
            id: "priority-marker-ambiguity".to_string(),
            kind: RuleKind::PriorityAmbiguity,
            description: "Multiple blocks use precedence annotations (IMPORTANT, MUST, \
                          NEVER) on potentially competing instructions without \
                          declaring which wins."
                .to_string(),
            severity: Severity::Minor,
            requires_scope_overlap: false,
            modality_a: None,
            modality_b: None,
            threshold: 0.0,
            evaluation: Evaluation::Structural(StructuralCheck::PriorityMarkers),
        },
        Rule {
            id: "implicit-dependency-undeclared".to_string(),
            kind: RuleKind::ImplicitDependency,
            description: "One block implicitly depends on or overrides another without \
                          declaring the relationship."
                .to_string(),
            severity: Severity::Major,
            requires_scope_overlap: true,
            modality_a: None,
            modality_b: None,
            threshold: 0.5,
            evaluation: Evaluation::Judgment {
                template: IMPLICIT_DEPENDENCY_TEMPLATE.to_string(),
            },
        },
        Rule {
            id: "verbatim-duplication".to_string(),
            kind: RuleKind::VerbatimDuplication,
            description: "Two blocks contain substantially identical text. Repetition \
                          may be intentional reinforcement or accidental, and raises \
                          the question of whether position affects priority."
                .to_string(),
            severity: Severity::Minor,
            requires_scope_overlap: false,
            modality_a: None,
            modality_b: None,
            threshold: 0.0,
            evaluation: Evaluation::Structural(StructuralCheck::VerbatimDuplication),
        },
    ]
}

/// A rule set containing all built-in rules.
#[must_use]
pub fn default_rule_set() -> RuleSet {
    RuleSet {
        name: "crosstalk-builtin".to_string(),
        rules: builtin_rules(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Tier;

    fn block(ordinal: usize, text: &str, modality: Modality, scope: &[&str]) -> Block {
        Block::new("test", ordinal, text, Tier::Contextual)
            .with_modality(modality)
            .with_scope(scope.iter().copied())
    }

    #[test]
    fn builtin_rules_compile() {
        let compiled = default_rule_set().compile().unwrap();
        assert_eq!(compiled.rules().len(), 5);
        assert_eq!(compiled.structural_rules().count(), 2);
        assert_eq!(compiled.judgment_rules().count(), 3);
    }

    #[test]
    fn duplicate_ids_fail_compilation() {
        let rule = builtin_rules().remove(0);
        let err = RuleSet::new("dupes")
            .with_rule(rule.clone())
            .with_rule(rule)
            .compile()
            .unwrap_err();
        assert_eq!(err.problems.len(), 1);
        assert!(err.problems[0].contains("duplicate"));
    }

    #[test]
    fn compilation_reports_all_problems_at_once() {
        let mut bad_template = builtin_rules().remove(0);
        bad_template.id = "missing-placeholders".to_string();
        bad_template.evaluation = Evaluation::Judgment {
            template: "no placeholders here".to_string(),
        };
        let mut bad_threshold = builtin_rules().remove(4);
        bad_threshold.threshold = 1.5;

        let err = RuleSet::new("broken")
            .with_rule(bad_template)
            .with_rule(bad_threshold)
            .compile()
            .unwrap_err();
        // Two missing placeholders plus one threshold problem.
        assert_eq!(err.problems.len(), 3);
    }

    #[test]
    fn prefilter_requires_scope_overlap() {
        let rule = &builtin_rules()[0];
        let a = block(0, "always do x", Modality::Mandate, &["x"]);
        let b = block(1, "never do x", Modality::Prohibition, &["x"]);
        let c = block(2, "never do y", Modality::Prohibition, &["y"]);
        assert!(rule.applies_to(&a, &b));
        assert!(!rule.applies_to(&a, &c));
    }

    #[test]
    fn prefilter_checks_modalities() {
        let rule = &builtin_rules()[0];
        let a = block(0, "always do x", Modality::Mandate, &["x"]);
        let b = block(1, "you can do x", Modality::Guidance, &["x"]);
        assert!(!rule.applies_to(&a, &b));
    }

    #[test]
    fn applicable_pairs_checks_both_orientations() {
        let compiled = RuleSet::new("one")
            .with_rule(builtin_rules().remove(0))
            .compile()
            .unwrap();
        // Prohibition first, mandate second: the asymmetric filter only
        // matches the reversed orientation.
        let blocks = vec![
            block(0, "never do x", Modality::Prohibition, &["x"]),
            block(1, "always do x", Modality::Mandate, &["x"]),
        ];
        let pairs = compiled.applicable_pairs(&blocks);
        assert_eq!(pairs.len(), 1);
        let (a, b, _) = pairs[0];
        assert_eq!(a.modality, Modality::Mandate);
        assert_eq!(b.modality, Modality::Prohibition);
    }

    #[test]
    fn severity_of_respects_threshold() {
        let rule = &builtin_rules()[0];
        assert_eq!(rule.severity_of(0.9), Some(Severity::Critical));
        assert_eq!(rule.severity_of(0.5), None);
        assert_eq!(rule.severity_of(0.2), None);
    }

    #[test]
    fn render_prompt_substitutes_both_blocks() {
        let rule = &builtin_rules()[0];
        let a = block(0, "ALPHA TEXT", Modality::Mandate, &["x"]);
        let b = block(1, "BETA TEXT", Modality::Prohibition, &["x"]);
        let prompt = rule.render_prompt(&a, &b).unwrap();
        assert!(prompt.contains("ALPHA TEXT"));
        assert!(prompt.contains("BETA TEXT"));
        assert!(!prompt.contains("{block_a}"));
    }

    #[test]
    fn marker_extraction_keeps_order() {
        let markers = extract_priority_markers("NEVER do this. It is IMPORTANT. Never again.");
        assert_eq!(markers, vec!["NEVER", "IMPORTANT"]);
    }

    #[test]
    fn shared_markers_score_higher_than_disjoint() {
        let a = block(0, "IMPORTANT: commit often", Modality::Mandate, &[]);
        let b = block(1, "IMPORTANT: never commit secrets", Modality::Prohibition, &[]);
        let c = block(2, "CRITICAL: review first", Modality::Mandate, &[]);
        let d = block(3, "plain prose", Modality::Information, &[]);

        let shared = StructuralCheck::PriorityMarkers.score(&a, &b);
        let disjoint = StructuralCheck::PriorityMarkers.score(&a, &c);
        let none = StructuralCheck::PriorityMarkers.score(&a, &d);
        assert!(shared > disjoint);
        assert!(disjoint > none);
        assert_eq!(none, 0.0);
    }

    #[test]
    fn identical_text_scores_full_duplication() {
        let a = block(0, "Use the staging database for tests.", Modality::Guidance, &[]);
        let b = block(1, "Use the staging database for tests.", Modality::Guidance, &[]);
        let c = block(2, "Completely unrelated sentence entirely.", Modality::Guidance, &[]);

        assert!((StructuralCheck::VerbatimDuplication.score(&a, &b) - 1.0).abs() < f32::EPSILON);
        assert_eq!(StructuralCheck::VerbatimDuplication.score(&a, &c), 0.0);
    }
}
