//! End-to-end pipeline scenarios: decompose, pre-filter, evaluate, report.

use std::sync::Arc;

use crosstalk::decompose::{heuristic, Document};
use crosstalk::{
    Backend, Block, CancelToken, Epistemic, Finding, FindingSeverity, Modality, RuleEngine,
    RuleSet, ScriptedBackend, Severity, Tier, Verdict,
};

fn contradiction_rule_set() -> crosstalk::CompiledRuleSet {
    let rule = crosstalk::builtin_rules()
        .into_iter()
        .find(|r| r.id == "mandate-prohibition-conflict")
        .unwrap();
    RuleSet::new("contradiction-only")
        .with_rule(rule)
        .compile()
        .unwrap()
}

fn block(ordinal: usize, text: &str, modality: Modality, scope: &[&str]) -> Block {
    Block::new("scenario", ordinal, text, Tier::Contextual)
        .with_modality(modality)
        .with_scope(scope.iter().copied())
}

#[test]
fn direct_contradiction_produces_exactly_one_critical_finding() {
    let blocks = vec![
        block(0, "Always run formatting before committing.", Modality::Mandate, &["x"]),
        block(1, "Never run formatting.", Modality::Prohibition, &["x"]),
    ];
    let rules = contradiction_rule_set();
    let backend: Arc<dyn Backend> = Arc::new(ScriptedBackend::always(
        "judge",
        Verdict::raw_only(r#"{"score": 0.95, "explanation": "formatting is both required and forbidden"}"#),
    ));

    let index = RuleEngine::default()
        .evaluate(&blocks, &rules, &backend, &CancelToken::new())
        .unwrap();

    assert_eq!(index.len(), 1);
    let finding = index
        .get(blocks[0].id, blocks[1].id, "mandate-prohibition-conflict")
        .unwrap();
    assert_eq!(finding.severity, FindingSeverity::Impact(Severity::Critical));
    assert!(!finding.provenance.is_static);
}

#[test]
fn prefilter_soundness_no_entry_and_no_backend_call_for_excluded_pairs() {
    // Same modal tension but disjoint scopes: the pre-filter excludes the
    // pair, so the rule must neither call the backend nor index anything.
    let blocks = vec![
        block(0, "Always run formatting.", Modality::Mandate, &["formatting"]),
        block(1, "Never push to main.", Modality::Prohibition, &["git"]),
    ];
    let rules = contradiction_rule_set();
    let scripted = Arc::new(ScriptedBackend::always(
        "judge",
        Verdict::raw_only(r#"{"score": 1.0, "explanation": "would flag anything"}"#),
    ));
    let backend: Arc<dyn Backend> = Arc::clone(&scripted) as Arc<dyn Backend>;

    let index = RuleEngine::default()
        .evaluate(&blocks, &rules, &backend, &CancelToken::new())
        .unwrap();

    assert!(index.is_empty());
    assert!(!index.contains(blocks[0].id, blocks[1].id, "mandate-prohibition-conflict"));
    assert_eq!(scripted.calls(), 0);
}

#[test]
fn clean_control_document_yields_no_critical_or_major_structural_findings() {
    let text = "\
# Response style

Respond in complete sentences.

Keep answers under three paragraphs.

Cite the source for every quoted figure.
";
    let document = Document::new("clean/v1", text, Tier::Contextual);
    let blocks = heuristic::decompose(&document);
    let rules = crosstalk::default_rule_set().compile().unwrap();

    let index = RuleEngine::default().evaluate_structural(&blocks, &rules);
    for finding in index.findings() {
        let severity = finding.severity.impact().unwrap();
        assert!(
            severity < Severity::Major,
            "clean document produced {severity} finding: {}",
            finding.explanation
        );
    }
}

#[test]
fn clean_control_composition_resolves_on_every_backend() {
    use crosstalk::{ContextLayer, EnsembleEvaluator, EvaluationRequest, Foundation};

    let foundation = Foundation::new(
        "style-rules",
        vec![
            "Respond in complete sentences.".to_string(),
            "Cite the source for every quoted figure.".to_string(),
        ],
    )
    .unwrap();
    let context = ContextLayer::new(
        "style-kb",
        vec!["Answers stay under three paragraphs.".to_string()],
    );
    let request = EvaluationRequest::new(foundation, context, "Summarize the quarterly report.");

    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(ScriptedBackend::always(
            "a",
            Verdict::resolved_with(Some("summary".to_string()), "raw"),
        )),
        Arc::new(ScriptedBackend::always("b", Verdict::resolved_with(None, "raw"))),
    ];
    let result = EnsembleEvaluator::default()
        .evaluate(&request, &backends, &CancelToken::new())
        .unwrap();

    assert!(result.resolved);
    assert!(result
        .verdicts
        .iter()
        .all(|v| v.verdict.resolved == Some(true)));
    assert!(result.backend_errors.is_empty());
}

#[test]
fn structural_pass_is_reproducible() {
    let text = "# A\nIMPORTANT: always lint.\n\n# B\nIMPORTANT: never lint generated code.\n";
    let document = Document::new("repro/v1", text, Tier::Contextual);
    let blocks = heuristic::decompose(&document);
    let rules = crosstalk::default_rule_set().compile().unwrap();
    let engine = RuleEngine::default();

    let first = engine.evaluate_structural(&blocks, &rules);
    let second = engine.evaluate_structural(&blocks, &rules);

    let firsts: Vec<(Option<f32>, String)> = first
        .findings()
        .map(|f| (f.score, f.explanation.clone()))
        .collect();
    let seconds: Vec<(Option<f32>, String)> = second
        .findings()
        .map(|f| (f.score, f.explanation.clone()))
        .collect();
    assert_eq!(firsts, seconds);
    assert!(!firsts.is_empty());
}

#[test]
fn severity_scales_never_cross_compare() {
    let alarming = Finding::exploratory(
        "hunch",
        Epistemic::Alarming,
        "something smells off",
        "explorer",
        1,
    );
    let a = crosstalk::BlockId::derive("s", 0, "a");
    let b = crosstalk::BlockId::derive("s", 1, "b");
    let minor = Finding::structural(a, b, "verbatim-duplication", "verbatim_duplication",
        Severity::Minor, 0.6, "duplicated");

    // Independently orderable within a scale...
    assert!(
        FindingSeverity::Epistemic(Epistemic::Alarming)
            > FindingSeverity::Epistemic(Epistemic::Curious)
    );
    assert!(FindingSeverity::Impact(Severity::Major) > FindingSeverity::Impact(Severity::Minor));
    // ...but never against each other.
    assert_eq!(alarming.severity.partial_cmp(&minor.severity), None);
    assert_eq!(minor.severity.partial_cmp(&alarming.severity), None);
}

#[test]
fn index_serialization_carries_static_flag_and_rule_ids() {
    let blocks = vec![
        block(0, "IMPORTANT: always review. MUST pass CI.", Modality::Mandate, &["review"]),
        block(1, "IMPORTANT: reviews MUST be fast.", Modality::Mandate, &["review"]),
    ];
    let rules = crosstalk::default_rule_set().compile().unwrap();
    let index = RuleEngine::default().evaluate_structural(&blocks, &rules);
    assert!(!index.is_empty());

    let json = serde_json::to_string(&index).unwrap();
    assert!(json.contains("\"static\":true"));
    assert!(json.contains("priority-marker-ambiguity"));

    let back: crosstalk::InterferenceIndex = serde_json::from_str(&json).unwrap();
    assert_eq!(back.len(), index.len());
}
