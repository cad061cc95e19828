//! Exploration session end-to-end: convergence accounting, rotation, and
//! the provenance trail.

use std::sync::Arc;

use crosstalk::decompose::Document;
use crosstalk::{
    Backend, CancelToken, ExplorationSession, ExplorationState, ScriptedBackend, SessionConfig,
    SessionStatus, Termination, Tier, Verdict,
};

fn document() -> Document {
    Document::new(
        "explore/doc",
        "Always answer briefly.\n\nNever answer briefly when citing sources.\n",
        Tier::Contextual,
    )
}

fn pass_json(description: &str, confidence: &str, continue_exploring: bool) -> String {
    format!(
        r#"{{
            "findings": [
                {{"description": "{description}", "location": "top",
                  "category": "contradiction", "confidence": "{confidence}"}}
            ],
            "unexplored": [],
            "continue_exploring": {continue_exploring},
            "rationale": "test pass"
        }}"#
    )
}

fn decline_only_json() -> String {
    r#"{"findings": [], "unexplored": [], "continue_exploring": false,
        "rationale": "nothing new"}"#
        .to_string()
}

#[test]
fn converged_exactly_at_the_threshold_not_before() {
    let session = ExplorationSession::new(SessionConfig {
        decline_threshold: 3,
        max_passes: 10,
        retry: crosstalk::RetryPolicy::none(),
    });
    let backend: Arc<dyn Backend> = Arc::new(
        ScriptedBackend::new("model")
            .push_raw(pass_json("first sweep", "notable", true))
            .push_raw(pass_json("second sweep", "curious", true))
            .push_raw(pass_json("still something", "concerning", false))
            .push_raw(pass_json("a late catch", "curious", false))
            .push_raw(decline_only_json()),
    );

    let mut state = ExplorationState::new();
    // Drive pass by pass so intermediate states are observable.
    for expected_status in [
        SessionStatus::Exploring, // pass 1: continue
        SessionStatus::Exploring, // pass 2: continue
        SessionStatus::Exploring, // pass 3: decline #1
        SessionStatus::Exploring, // pass 4: decline #2
        SessionStatus::Converged, // pass 5: decline #3
    ] {
        session
            .run_pass(&mut state, &document(), &backend, &CancelToken::new())
            .unwrap();
        assert_eq!(state.status(), expected_status);
    }
    assert_eq!(state.passes().len(), 5);
    // Declining passes that still found things contributed their findings.
    assert_eq!(state.finding_count(), 4);
}

#[test]
fn driver_reports_converged_with_pass_count() {
    let backend: Arc<dyn Backend> = Arc::new(ScriptedBackend::always(
        "model",
        Verdict::raw_only(decline_only_json()),
    ));
    let mut state = ExplorationState::new();
    let termination = ExplorationSession::default()
        .run(&document(), &[backend], &mut state, &CancelToken::new())
        .unwrap();
    assert_eq!(termination, Termination::Converged { passes: 3 });
}

#[test]
fn budget_exhaustion_is_surfaced_distinctly() {
    let backend: Arc<dyn Backend> = Arc::new(ScriptedBackend::always(
        "model",
        Verdict::raw_only(pass_json("more", "curious", true)),
    ));
    let mut state = ExplorationState::new();
    let termination = ExplorationSession::new(SessionConfig {
        decline_threshold: 3,
        max_passes: 2,
        retry: crosstalk::RetryPolicy::none(),
    })
    .run(&document(), &[backend], &mut state, &CancelToken::new())
    .unwrap();

    assert_eq!(termination, Termination::BudgetExhausted { passes: 2 });
    assert_ne!(termination, Termination::Converged { passes: 2 });
    assert_eq!(state.status(), SessionStatus::Exploring);
}

#[test]
fn provenance_trail_names_each_backend_and_decision() {
    let fast = Arc::new(ScriptedBackend::always(
        "model-fast",
        Verdict::raw_only(pass_json("breadth sweep", "notable", true)),
    ));
    let deep = Arc::new(ScriptedBackend::always(
        "model-deep",
        Verdict::raw_only(decline_only_json()),
    ));
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::clone(&fast) as Arc<dyn Backend>,
        Arc::clone(&deep) as Arc<dyn Backend>,
    ];

    let mut state = ExplorationState::new();
    ExplorationSession::new(SessionConfig {
        decline_threshold: 2,
        max_passes: 6,
        retry: crosstalk::RetryPolicy::none(),
    })
    .run(&document(), &backends, &mut state, &CancelToken::new())
    .unwrap();

    // Serialized state is the provenance trail: ordered passes with
    // backend identity and the continue decision.
    let json = serde_json::to_string(&state).unwrap();
    assert!(json.contains("model-fast"));
    assert!(json.contains("model-deep"));
    assert!(json.contains("continue_exploring"));

    let back: ExplorationState = serde_json::from_str(&json).unwrap();
    assert_eq!(back.passes().len(), state.passes().len());
    for (i, pass) in back.passes().iter().enumerate() {
        assert_eq!(pass.pass_number as usize, i + 1);
    }
}

#[test]
fn second_pass_request_instructs_against_restating() {
    let session = ExplorationSession::default();
    let mut state = ExplorationState::new();
    let backend: Arc<dyn Backend> = Arc::new(ScriptedBackend::always(
        "model",
        Verdict::raw_only(pass_json("duplicated guidance", "concerning", true)),
    ));
    session
        .run_pass(&mut state, &document(), &backend, &CancelToken::new())
        .unwrap();

    let request = session.build_request(&document(), &state);
    assert!(request.prompt.contains("DO NOT repeat"));
    assert!(request.prompt.contains("duplicated guidance"));
}
