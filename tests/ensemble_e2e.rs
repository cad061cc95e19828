//! Ensemble evaluation end-to-end: OR-gate behavior, partial failure,
//! timeouts, and total unavailability.

use std::sync::Arc;
use std::time::Duration;

use crosstalk::{
    Backend, BackendError, BackendResult, CancelToken, ConflictReport, ContextLayer,
    CrosstalkError, EnsembleConfig, EnsembleEvaluator, EvaluationRequest, Foundation,
    JudgeRequest, ScriptedBackend, Verdict,
};

/// A backend that sleeps past any reasonable deadline before answering.
struct SlowBackend {
    name: String,
    delay: Duration,
}

impl Backend for SlowBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn judge(&self, _request: &JudgeRequest, _cancel: &CancelToken) -> BackendResult<Verdict> {
        std::thread::sleep(self.delay);
        Ok(Verdict::resolved_with(None, "too late"))
    }
}

fn request() -> EvaluationRequest {
    let foundation = Foundation::new(
        "base",
        vec!["Surface conflicts instead of resolving them silently.".to_string()],
    )
    .unwrap();
    let context = ContextLayer::new(
        "kb",
        vec![
            "Production deploys require a change ticket.".to_string(),
            "Emergency fixes skip the change ticket.".to_string(),
        ],
    );
    EvaluationRequest::new(foundation, context, "Can I hotfix production right now?")
}

fn resolved(name: &str) -> Arc<dyn Backend> {
    Arc::new(ScriptedBackend::always(
        name,
        Verdict::resolved_with(Some("file the ticket after".to_string()), "raw"),
    ))
}

fn unresolved(name: &str) -> Arc<dyn Backend> {
    Arc::new(ScriptedBackend::always(
        name,
        Verdict::unresolved(
            vec![ConflictReport {
                source: "Production deploys require a change ticket.".to_string(),
                target: "Emergency fixes skip the change ticket.".to_string(),
                description: "ticket requirement is both mandatory and waived".to_string(),
                resolution_hint: Some("define what counts as an emergency".to_string()),
            }],
            "raw",
        ),
    ))
}

#[test]
fn or_gate_monotonicity() {
    let evaluator = EnsembleEvaluator::default();
    let cancel = CancelToken::new();

    // All resolved: the ensemble resolves.
    let all_resolved = vec![resolved("a"), resolved("b")];
    let result = evaluator.evaluate(&request(), &all_resolved, &cancel).unwrap();
    assert!(result.resolved);

    // Adding one unresolved verdict flips the gate.
    let with_flag = vec![resolved("a"), resolved("b"), unresolved("c")];
    let result = evaluator.evaluate(&request(), &with_flag, &cancel).unwrap();
    assert!(!result.resolved);
    assert_eq!(result.conflicts.len(), 1);

    // Removing the only unresolved verdict flips it back.
    let back_to_clean = vec![resolved("a"), resolved("b")];
    let result = evaluator.evaluate(&request(), &back_to_clean, &cancel).unwrap();
    assert!(result.resolved);
    assert!(result.conflicts.is_empty());
}

#[test]
fn partial_failure_tolerance_timeout_recorded_not_fatal() {
    let evaluator = EnsembleEvaluator::new(EnsembleConfig {
        per_backend_timeout: Duration::from_millis(50),
    });
    let backends: Vec<Arc<dyn Backend>> = vec![
        resolved("healthy"),
        Arc::new(SlowBackend {
            name: "sleepy".to_string(),
            delay: Duration::from_secs(2),
        }),
    ];

    let result = evaluator
        .evaluate(&request(), &backends, &CancelToken::new())
        .unwrap();

    assert!(result.resolved);
    assert_eq!(result.verdicts.len(), 1);
    assert_eq!(result.verdicts[0].backend, "healthy");
    assert_eq!(result.backend_errors.len(), 1);
    assert_eq!(result.backend_errors[0].backend, "sleepy");
    assert!(result.backend_errors[0].error.contains("timed out"));
}

#[test]
fn all_backends_failing_is_fatal_not_resolved() {
    let evaluator = EnsembleEvaluator::new(EnsembleConfig {
        per_backend_timeout: Duration::from_millis(50),
    });
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(ScriptedBackend::new("down").push_transport_error("refused")),
        Arc::new(SlowBackend {
            name: "sleepy".to_string(),
            delay: Duration::from_secs(2),
        }),
    ];

    let err = evaluator
        .evaluate(&request(), &backends, &CancelToken::new())
        .unwrap_err();

    let CrosstalkError::EnsembleUnavailable { attempted, failures } = err else {
        panic!("expected EnsembleUnavailable, got {err:?}");
    };
    assert_eq!(attempted, 2);
    assert_eq!(failures.len(), 2);
}

#[test]
fn conflicts_union_across_backends_dedups_semantically() {
    // Two backends report the same clash with different wording plus one
    // unique clash: the union holds two conflicts, not three.
    let first: Arc<dyn Backend> = unresolved("a");
    let second: Arc<dyn Backend> = Arc::new(ScriptedBackend::always(
        "b",
        Verdict::unresolved(
            vec![
                ConflictReport {
                    source: "Emergency fixes skip the change ticket.".to_string(),
                    target: "Production deploys require a change ticket.".to_string(),
                    description: "same clash, reversed endpoints".to_string(),
                    resolution_hint: None,
                },
                ConflictReport {
                    source: "entry 9".to_string(),
                    target: "entry 10".to_string(),
                    description: "a different clash".to_string(),
                    resolution_hint: None,
                },
            ],
            "raw",
        ),
    ));

    let result = EnsembleEvaluator::default()
        .evaluate(&request(), &[first, second], &CancelToken::new())
        .unwrap();
    assert!(!result.resolved);
    assert_eq!(result.conflicts.len(), 2);
}

#[test]
fn result_serializes_with_per_backend_provenance() {
    let backends = vec![resolved("a"), unresolved("b")];
    let result = EnsembleEvaluator::default()
        .evaluate(&request(), &backends, &CancelToken::new())
        .unwrap();

    let json = serde_json::to_string(&result).unwrap();
    assert!(json.contains("\"resolved\":false"));
    assert!(json.contains("\"backend\":\"a\""));
    assert!(json.contains("\"backend\":\"b\""));
    assert!(json.contains("resolution_hint"));
}

#[test]
fn foundation_failure_precedes_any_evaluation() {
    let err = Foundation::new(
        "inconsistent",
        vec![
            "Always write the audit log file.".to_string(),
            "Never write files.".to_string(),
        ],
    )
    .unwrap_err();

    assert!(matches!(
        err,
        CrosstalkError::FoundationalInconsistency { .. }
    ));
}
