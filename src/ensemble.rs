//! Multi-backend ensemble evaluation of a three-layer composition.
//!
//! One judgment request goes to every configured backend concurrently, and
//! the verdicts aggregate through an OR-gate: any backend reporting
//! unresolved conflicts makes the ensemble unresolved. A missed conflict
//! causes silent bad behavior downstream while a spurious flag only costs
//! review time, so the gate is deliberately not a majority vote.
//!
//! Partial backend failure never aborts the evaluation; the gate is
//! computed over the backends that responded, and failures are recorded.
//! Only the total loss of every backend fails the evaluation — there is no
//! fallback to "assume resolved".

use std::fmt;
use std::thread;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{
    parse_composition, Backend, BackendError, CancelToken, ConflictReport, JudgeRequest,
    RequestKind, Verdict,
};
use crate::decompose::heuristic::{classify_modality, extract_scope};
use crate::block::Modality;
use crate::error::{CrosstalkError, CrosstalkResult};

const JUDGE_TEMPLATE: &str = "\
You are a neutral evaluation judge for a query resolution system.

Your task: examine whether the contextual knowledge contains conflicts that
would prevent cleanly resolving the query. Either surface the conflicts or
resolve the query — never do both, never do neither.

## Foundational rules (invariant — the authority for this evaluation)

{foundation}

## Contextual knowledge (may contain internal conflicts)

{context}

## Query

{query}

## Instructions

1. Read all contextual entries carefully.
2. Identify any entries that, together, create an unsatisfiable constraint
   for this specific query. A conflict exists when one entry recommends or
   requires something that another entry prohibits or contradicts, and both
   constraints apply to resolving this query.
3. If conflicts exist: set has_conflict to true, describe each conflict
   (which entries conflict, what the contradiction is, what information or
   change would resolve it), and leave output null — do not attempt to
   resolve the query.
4. If no conflicts exist: set has_conflict to false and resolve the query
   according to the foundational rules and contextual knowledge.

Respond with valid JSON only. No explanation outside the JSON.

{
  \"has_conflict\": <bool>,
  \"conflicts\": [
    {
      \"source\": \"<the entry that creates the conflict>\",
      \"target\": \"<the entry it conflicts with>\",
      \"description\": \"<what the contradiction is and why it affects this query>\",
      \"resolution_hint\": \"<what would resolve this, or null>\"
    }
  ],
  \"output\": <string or null>
}";

/// A mandate/prohibition tension between two foundational clauses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClauseClash {
    /// Index of the mandating clause.
    pub mandate: usize,
    /// Index of the prohibiting clause.
    pub prohibition: usize,
    /// Scope entries the two clauses share.
    pub shared_scope: Vec<String>,
}

impl fmt::Display for ClauseClash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clause {} mandates while clause {} prohibits on shared scope [{}]",
            self.mandate,
            self.prohibition,
            self.shared_scope.join(", ")
        )
    }
}

/// The foundational layer: invariant rules, validated internally consistent
/// at construction.
///
/// The check is the deterministic structural subset — heuristic modality
/// classification of each clause, then pairwise mandate/prohibition tension
/// on shared specific scope. A foundation that fails the check cannot be
/// constructed; evaluations can therefore assume their authority layer is
/// coherent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Foundation {
    name: String,
    clauses: Vec<String>,
}

impl Foundation {
    /// Validates the clauses and constructs the layer.
    ///
    /// # Errors
    /// `CrosstalkError::FoundationalInconsistency` listing every clause
    /// clash found. A failed self-consistency check is an error, not a
    /// silent pass.
    pub fn new(
        name: impl Into<String>,
        clauses: Vec<String>,
    ) -> CrosstalkResult<Self> {
        let name = name.into();
        let clashes = clause_clashes(&clauses);
        if clashes.is_empty() {
            Ok(Self { name, clauses })
        } else {
            Err(CrosstalkError::FoundationalInconsistency {
                layer: name,
                clashes,
            })
        }
    }

    /// The layer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The validated clauses.
    #[must_use]
    pub fn clauses(&self) -> &[String] {
        &self.clauses
    }
}

fn clause_clashes(clauses: &[String]) -> Vec<ClauseClash> {
    let classified: Vec<(Modality, Vec<String>)> = clauses
        .iter()
        .map(|c| (classify_modality(c), extract_scope(c)))
        .collect();

    let mut clashes = Vec::new();
    for i in 0..classified.len() {
        for j in i + 1..classified.len() {
            let (mandate, prohibition) = match (classified[i].0, classified[j].0) {
                (Modality::Mandate, Modality::Prohibition) => (i, j),
                (Modality::Prohibition, Modality::Mandate) => (j, i),
                _ => continue,
            };
            // The "general" fallback tag is not a real shared scope.
            let shared: Vec<String> = classified[i]
                .1
                .iter()
                .filter(|s| *s != "general" && classified[j].1.contains(s))
                .cloned()
                .collect();
            if !shared.is_empty() {
                clashes.push(ClauseClash {
                    mandate,
                    prohibition,
                    shared_scope: shared,
                });
            }
        }
    }
    clashes
}

/// The contextual layer: domain knowledge that may conflict internally.
/// Conflicts here are expected and reported, never rejected up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLayer {
    /// Layer name, for conflict location references.
    pub name: String,
    /// Knowledge entries.
    pub entries: Vec<String>,
}

impl ContextLayer {
    /// Creates a contextual layer.
    #[must_use]
    pub fn new(name: impl Into<String>, entries: Vec<String>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }
}

/// One concrete three-layer composition to evaluate.
///
/// Constructed per evaluation call, immutable, discarded afterwards; the
/// foundation is the only piece meant to be reused across calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    /// Invariant rules (already validated at construction).
    pub foundation: Foundation,
    /// Contextual knowledge.
    pub context: ContextLayer,
    /// The candidate query.
    pub query: String,
}

impl EvaluationRequest {
    /// Assembles a composition.
    #[must_use]
    pub fn new(foundation: Foundation, context: ContextLayer, query: impl Into<String>) -> Self {
        Self {
            foundation,
            context,
            query: query.into(),
        }
    }

    /// Renders the judge prompt for this composition.
    #[must_use]
    pub fn render(&self) -> JudgeRequest {
        fn bullets(items: &[String]) -> String {
            if items.is_empty() {
                return "(none)".to_string();
            }
            items
                .iter()
                .map(|item| format!("- {item}"))
                .collect::<Vec<_>>()
                .join("\n")
        }

        let prompt = JUDGE_TEMPLATE
            .replace("{foundation}", &bullets(self.foundation.clauses()))
            .replace("{context}", &bullets(&self.context.entries))
            .replace("{query}", &self.query);

        JudgeRequest::new(RequestKind::Composition, prompt)
            .with_meta("foundation", self.foundation.name().to_string())
            .with_meta("context", self.context.name.clone())
    }
}

/// A recorded per-backend failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    /// Backend name.
    pub backend: String,
    /// Failure description.
    pub error: String,
}

/// One responding backend's verdict, kept for provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendVerdict {
    /// Backend name.
    pub backend: String,
    /// The verdict as returned.
    pub verdict: Verdict,
}

/// Aggregated result of one ensemble evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleResult {
    /// False as soon as any responding backend reported conflicts.
    pub resolved: bool,
    /// Union of reported conflicts, deduplicated by semantic key.
    pub conflicts: Vec<ConflictReport>,
    /// Resolved output, when every responder resolved. Taken from the
    /// first responder — all agreed the composition is clean, so the
    /// choice is arbitrary by design.
    pub output: Option<String>,
    /// Every responding backend's verdict, in dispatch order.
    pub verdicts: Vec<BackendVerdict>,
    /// Every failed backend, in dispatch order.
    pub backend_errors: Vec<BackendFailure>,
}

/// Ensemble configuration.
#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    /// Independent per-backend deadline; a slow backend does not delay
    /// the others, it just misses the gate.
    pub per_backend_timeout: Duration,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            per_backend_timeout: Duration::from_secs(60),
        }
    }
}

/// Dispatches one composition to many backends and aggregates the verdicts.
#[derive(Debug, Clone, Default)]
pub struct EnsembleEvaluator {
    config: EnsembleConfig,
}

impl EnsembleEvaluator {
    /// Creates an evaluator with the given configuration.
    #[must_use]
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }

    /// Evaluates one composition across all backends concurrently.
    ///
    /// # Errors
    /// - `CrosstalkError::Internal` for an empty backend list (caller bug);
    /// - `CrosstalkError::Cancelled` when the token fires — no partial
    ///   result is returned;
    /// - `CrosstalkError::EnsembleUnavailable` when every backend failed.
    pub fn evaluate(
        &self,
        request: &EvaluationRequest,
        backends: &[Arc<dyn Backend>],
        cancel: &CancelToken,
    ) -> CrosstalkResult<EnsembleResult> {
        if backends.is_empty() {
            return Err(CrosstalkError::internal(
                "ensemble evaluation requires at least one backend",
            ));
        }
        if cancel.is_cancelled() {
            return Err(CrosstalkError::Cancelled);
        }

        let judge_request = request.render();
        debug!(
            backends = backends.len(),
            foundation = request.foundation.name(),
            "dispatching ensemble evaluation"
        );

        // One thread per backend; each reply channel is awaited against an
        // independent deadline. A verdict arriving after its deadline lands
        // on a disconnected channel and is discarded, never merged.
        let mut calls = Vec::with_capacity(backends.len());
        for (idx, backend) in backends.iter().enumerate() {
            let (tx, rx) = bounded::<Result<Verdict, BackendError>>(1);
            let backend = Arc::clone(backend);
            let judge_request = judge_request.clone();
            let cancel = cancel.clone();
            let name = backend.name().to_string();
            thread::Builder::new()
                .name(format!("crosstalk-ensemble-{idx}"))
                .spawn(move || {
                    let result = backend.judge(&judge_request, &cancel);
                    let _ = tx.send(result);
                })
                .expect("failed to spawn crosstalk ensemble worker");
            calls.push((name, rx));
        }

        let deadline = Instant::now() + self.config.per_backend_timeout;
        let mut verdicts: Vec<BackendVerdict> = Vec::new();
        let mut failures: Vec<BackendFailure> = Vec::new();

        for (name, rx) in calls {
            let outcome = match rx.recv_deadline(deadline) {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout {
                    backend: name.clone(),
                    elapsed_ms: self.config.per_backend_timeout.as_millis().min(u128::from(u64::MAX))
                        as u64,
                }),
            };

            match outcome {
                Ok(verdict) => match upgrade(&name, verdict) {
                    Ok(verdict) => verdicts.push(BackendVerdict {
                        backend: name,
                        verdict,
                    }),
                    Err(error) => {
                        warn!(backend = %name, %error, "backend verdict unusable");
                        failures.push(BackendFailure {
                            backend: name,
                            error: error.to_string(),
                        });
                    }
                },
                Err(error) => {
                    warn!(backend = %name, %error, "backend failed");
                    failures.push(BackendFailure {
                        backend: name,
                        error: error.to_string(),
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(CrosstalkError::Cancelled);
        }

        if verdicts.is_empty() {
            return Err(CrosstalkError::EnsembleUnavailable {
                attempted: backends.len(),
                failures,
            });
        }

        Ok(aggregate(verdicts, failures))
    }
}

/// Ensures a verdict carries a resolution flag, parsing the raw response
/// if the backend left the structured fields empty.
fn upgrade(name: &str, verdict: Verdict) -> Result<Verdict, BackendError> {
    if verdict.resolved.is_some() {
        return Ok(verdict);
    }
    parse_composition(name, &verdict.raw)
}

/// OR-gate over conflict detection.
fn aggregate(verdicts: Vec<BackendVerdict>, failures: Vec<BackendFailure>) -> EnsembleResult {
    let any_unresolved = verdicts
        .iter()
        .any(|v| v.verdict.resolved == Some(false));

    if any_unresolved {
        let mut seen = std::collections::BTreeSet::new();
        let mut conflicts = Vec::new();
        for entry in &verdicts {
            for conflict in &entry.verdict.conflicts {
                if seen.insert(conflict.semantic_key()) {
                    conflicts.push(conflict.clone());
                }
            }
        }
        info!(
            conflicts = conflicts.len(),
            responders = verdicts.len(),
            "ensemble unresolved"
        );
        EnsembleResult {
            resolved: false,
            conflicts,
            output: None,
            verdicts,
            backend_errors: failures,
        }
    } else {
        let output = verdicts.iter().find_map(|v| v.verdict.output.clone());
        info!(responders = verdicts.len(), "ensemble resolved");
        EnsembleResult {
            resolved: true,
            conflicts: Vec::new(),
            output,
            verdicts,
            backend_errors: failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;

    fn foundation() -> Foundation {
        Foundation::new(
            "base",
            vec![
                "Surface conflicts instead of resolving them silently.".to_string(),
                "Treat every contextual entry as equally authoritative.".to_string(),
            ],
        )
        .unwrap()
    }

    fn request() -> EvaluationRequest {
        EvaluationRequest::new(
            foundation(),
            ContextLayer::new(
                "kb",
                vec![
                    "Deploys happen on Fridays.".to_string(),
                    "Deploys are forbidden on Fridays.".to_string(),
                ],
            ),
            "When can I deploy?",
        )
    }

    fn conflict(source: &str, target: &str) -> ConflictReport {
        ConflictReport {
            source: source.to_string(),
            target: target.to_string(),
            description: "contradictory deploy windows".to_string(),
            resolution_hint: None,
        }
    }

    fn arc(backend: ScriptedBackend) -> Arc<dyn Backend> {
        Arc::new(backend)
    }

    #[test]
    fn consistent_foundation_constructs() {
        assert_eq!(foundation().clauses().len(), 2);
    }

    #[test]
    fn clashing_foundation_fails_construction() {
        let err = Foundation::new(
            "bad",
            vec![
                "Always push every commit to the remote.".to_string(),
                "Never push commits to the remote.".to_string(),
            ],
        )
        .unwrap_err();
        let CrosstalkError::FoundationalInconsistency { layer, clashes } = err else {
            panic!("expected foundational inconsistency");
        };
        assert_eq!(layer, "bad");
        assert_eq!(clashes.len(), 1);
        assert!(clashes[0].shared_scope.contains(&"git".to_string()));
    }

    #[test]
    fn all_resolved_gates_to_resolved() {
        let backends = vec![
            arc(ScriptedBackend::always(
                "a",
                Verdict::resolved_with(Some("Friday".to_string()), "raw-a"),
            )),
            arc(ScriptedBackend::always(
                "b",
                Verdict::resolved_with(None, "raw-b"),
            )),
        ];
        let result = EnsembleEvaluator::default()
            .evaluate(&request(), &backends, &CancelToken::new())
            .unwrap();
        assert!(result.resolved);
        assert_eq!(result.output.as_deref(), Some("Friday"));
        assert_eq!(result.verdicts.len(), 2);
        assert!(result.backend_errors.is_empty());
    }

    #[test]
    fn single_unresolved_verdict_flips_the_gate() {
        let backends = vec![
            arc(ScriptedBackend::always(
                "a",
                Verdict::resolved_with(Some("Friday".to_string()), "raw-a"),
            )),
            arc(ScriptedBackend::always(
                "b",
                Verdict::unresolved(vec![conflict("entry 1", "entry 2")], "raw-b"),
            )),
        ];
        let result = EnsembleEvaluator::default()
            .evaluate(&request(), &backends, &CancelToken::new())
            .unwrap();
        assert!(!result.resolved);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.output, None);
    }

    #[test]
    fn conflicts_dedup_by_semantic_key() {
        let backends = vec![
            arc(ScriptedBackend::always(
                "a",
                Verdict::unresolved(vec![conflict("entry 1", "entry 2")], "raw-a"),
            )),
            arc(ScriptedBackend::always(
                "b",
                // Same endpoints, reversed and re-worded.
                Verdict::unresolved(vec![conflict("Entry 2", "entry  1")], "raw-b"),
            )),
        ];
        let result = EnsembleEvaluator::default()
            .evaluate(&request(), &backends, &CancelToken::new())
            .unwrap();
        assert_eq!(result.conflicts.len(), 1);
    }

    #[test]
    fn partial_failure_uses_remaining_verdicts() {
        let backends = vec![
            arc(ScriptedBackend::always(
                "healthy",
                Verdict::resolved_with(Some("ok".to_string()), "raw"),
            )),
            arc(ScriptedBackend::new("broken").push_transport_error("connection refused")),
        ];
        let result = EnsembleEvaluator::default()
            .evaluate(&request(), &backends, &CancelToken::new())
            .unwrap();
        assert!(result.resolved);
        assert_eq!(result.verdicts.len(), 1);
        assert_eq!(result.backend_errors.len(), 1);
        assert_eq!(result.backend_errors[0].backend, "broken");
    }

    #[test]
    fn all_backends_failing_is_fatal() {
        let backends = vec![
            arc(ScriptedBackend::new("a").push_transport_error("down")),
            arc(ScriptedBackend::new("b").push_timeout(1000)),
        ];
        let err = EnsembleEvaluator::default()
            .evaluate(&request(), &backends, &CancelToken::new())
            .unwrap_err();
        let CrosstalkError::EnsembleUnavailable { attempted, failures } = err else {
            panic!("expected ensemble unavailable");
        };
        assert_eq!(attempted, 2);
        assert_eq!(failures.len(), 2);
    }

    #[test]
    fn raw_composition_responses_are_parsed() {
        let raw = r#"{"has_conflict": true, "conflicts": [
            {"source": "entry 1", "target": "entry 2", "description": "clash"}
        ], "output": null}"#;
        let backends = vec![arc(ScriptedBackend::always("a", Verdict::raw_only(raw)))];
        let result = EnsembleEvaluator::default()
            .evaluate(&request(), &backends, &CancelToken::new())
            .unwrap();
        assert!(!result.resolved);
        assert_eq!(result.conflicts.len(), 1);
    }

    #[test]
    fn unparseable_raw_counts_as_failure() {
        let backends = vec![
            arc(ScriptedBackend::always("a", Verdict::raw_only("looks fine to me"))),
            arc(ScriptedBackend::always(
                "b",
                Verdict::resolved_with(None, "raw"),
            )),
        ];
        let result = EnsembleEvaluator::default()
            .evaluate(&request(), &backends, &CancelToken::new())
            .unwrap();
        assert!(result.resolved);
        assert_eq!(result.backend_errors.len(), 1);
        assert_eq!(result.backend_errors[0].backend, "a");
    }

    #[test]
    fn empty_backend_list_is_an_error() {
        let err = EnsembleEvaluator::default()
            .evaluate(&request(), &[], &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, CrosstalkError::Internal { .. }));
    }

    #[test]
    fn cancellation_returns_no_result() {
        let backends = vec![arc(ScriptedBackend::always(
            "a",
            Verdict::resolved_with(None, "raw"),
        ))];
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = EnsembleEvaluator::default()
            .evaluate(&request(), &backends, &cancel)
            .unwrap_err();
        assert!(matches!(err, CrosstalkError::Cancelled));
    }

    #[test]
    fn request_render_contains_all_layers() {
        let judge_request = request().render();
        assert_eq!(judge_request.kind, RequestKind::Composition);
        assert!(judge_request.prompt.contains("Surface conflicts"));
        assert!(judge_request.prompt.contains("Deploys happen on Fridays."));
        assert!(judge_request.prompt.contains("When can I deploy?"));
    }
}
