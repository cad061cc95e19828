//! Convergent exploration: open-ended passes over a document until the
//! findings dry up.
//!
//! Where the rule engine checks what a designer thought to write rules for,
//! the exploration session asks a backend to wander through the document
//! and report what it finds — then sends the next pass (on a different
//! backend) armed with the accumulated map and explicit instructions not to
//! restate it. Convergence is decided by consecutive declines: a pass that
//! says "another pass won't help" counts against continuation even when it
//! still contributed findings, because declining is about marginal value
//! going forward, not about this pass's yield.

use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{extract_json, Backend, BackendError, CancelToken, JudgeRequest, RequestKind};
use crate::decompose::Document;
use crate::engine::RetryPolicy;
use crate::error::{CrosstalkError, CrosstalkResult};
use crate::finding::Finding;
use crate::severity::Epistemic;

const FIRST_PASS_TEMPLATE: &str = "\
You are exploring an instruction document. Not auditing it against rules —
just reading it carefully and noting what you find interesting.

\"Interesting\" is deliberately vague. Trust your judgment. You might notice
instructions that contradict each other, rules stated twice in different
places, undeclared assumptions, scope ambiguities, surprising structure, or
interactions between distant parts of the document. If something is boring
and straightforward, do not manufacture interest.

After documenting what you found, document what you did NOT explore: areas
you skimmed, questions you did not pursue. This is as valuable as your
findings.

Finally: should another explorer follow you? Be honest — if you think you
covered it, say so.

## Document

{document}

## Output format

Respond with JSON only.

{
  \"findings\": [
    {
      \"description\": \"<what's interesting>\",
      \"location\": \"<where in the document — quote key phrases>\",
      \"category\": \"<your own label for what kind of thing this is>\",
      \"confidence\": \"<curious|notable|concerning|alarming>\"
    }
  ],
  \"unexplored\": [
    {\"description\": \"<what you didn't dig into>\",
     \"why_interesting\": \"<why it might be worth exploring>\"}
  ],
  \"continue_exploring\": <true|false>,
  \"rationale\": \"<why another pass would or wouldn't help>\"
}";

const SUBSEQUENT_PASS_TEMPLATE: &str = "\
You are exploring an instruction document. Previous explorers have been
through it and left you their map. Your job is to go where they didn't.

DO NOT repeat their findings. They found what they found. You are looking
for what they missed, what they flagged as unexplored, and anything their
framing caused them to overlook. Restating a known finding is a contract
violation, not a contribution.

Previous explorers noted these areas as unexplored:

{unexplored}

Their cumulative findings ({finding_count} total across {pass_count} pass(es)):

{findings}

## When to stop

Be honest about diminishing returns. Set continue_exploring to false if
most of what you found is refinement of existing findings, or if the prior
passes already covered the major structural and semantic territory. Saying
\"enough\" is a finding in itself.

## Document

{document}

## Output format

Respond with JSON only. Confidence values must be lowercase.

{
  \"findings\": [
    {
      \"description\": \"<what's interesting>\",
      \"location\": \"<where in the document — quote key phrases>\",
      \"category\": \"<your own label for what kind of thing this is>\",
      \"confidence\": \"<curious|notable|concerning|alarming>\"
    }
  ],
  \"unexplored\": [
    {\"description\": \"<what you didn't dig into>\",
     \"why_interesting\": \"<why it might be worth exploring>\"}
  ],
  \"continue_exploring\": <true|false>,
  \"rationale\": \"<why another pass would or wouldn't help>\"
}";

/// Something a pass noticed but did not dig into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnexploredNote {
    /// What was not explored.
    pub description: String,
    /// Why it might be worth exploring.
    pub why_interesting: String,
}

/// Output of a single exploration pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    /// Pass sequence number (1-based), assigned from state position —
    /// never from the backend's own claim.
    pub pass_number: u32,
    /// Backend that produced the pass, for provenance.
    pub backend: String,
    /// New findings from this pass.
    pub findings: Vec<Finding>,
    /// Territory this pass flagged for successors.
    pub unexplored: Vec<UnexploredNote>,
    /// The backend's judgment on whether another pass would find more.
    pub continue_exploring: bool,
    /// Why continuation would or wouldn't help.
    pub rationale: Option<String>,
}

/// Session states. `Converged` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Still worth sending passes.
    Exploring,
    /// Consecutive declines reached the threshold.
    Converged,
}

/// Why a session stopped. The two outcomes are distinct and surfaced
/// distinctly: convergence means the exploration ran dry, budget
/// exhaustion means it was cut off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The decline counter hit the threshold.
    Converged {
        /// Total passes run.
        passes: u32,
    },
    /// The maximum pass count was hit before convergence.
    BudgetExhausted {
        /// Total passes run.
        passes: u32,
    },
}

/// Accumulated exploration record. Append-only: state changes only by
/// recording a completed pass, never by rewriting history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplorationState {
    passes: Vec<PassReport>,
    consecutive_declines: u32,
    status: Option<SessionStatus>,
}

impl ExplorationState {
    /// A fresh state with no passes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded passes, in order.
    #[must_use]
    pub fn passes(&self) -> &[PassReport] {
        &self.passes
    }

    /// Every finding across all passes.
    #[must_use]
    pub fn all_findings(&self) -> Vec<&Finding> {
        self.passes.iter().flat_map(|p| p.findings.iter()).collect()
    }

    /// Total finding count.
    #[must_use]
    pub fn finding_count(&self) -> usize {
        self.passes.iter().map(|p| p.findings.len()).sum()
    }

    /// Unexplored notes from the latest pass only — earlier passes'
    /// territory was presumably covered by their successors.
    #[must_use]
    pub fn latest_unexplored(&self) -> &[UnexploredNote] {
        self.passes.last().map_or(&[], |p| &p.unexplored)
    }

    /// Current consecutive-decline count.
    #[must_use]
    pub fn consecutive_declines(&self) -> u32 {
        self.consecutive_declines
    }

    /// Current session status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.unwrap_or(SessionStatus::Exploring)
    }

    /// The pass number the next pass will get (1-based).
    #[must_use]
    pub fn next_pass_number(&self) -> u32 {
        self.passes.len() as u32 + 1
    }

    /// Appends a completed pass and updates the decline counter.
    ///
    /// A declining pass counts toward convergence even when it reported
    /// findings; a continuing pass resets the counter.
    pub fn record(&mut self, report: PassReport, decline_threshold: u32) {
        if report.continue_exploring {
            self.consecutive_declines = 0;
        } else {
            self.consecutive_declines += 1;
        }
        self.passes.push(report);
        if self.consecutive_declines >= decline_threshold.max(1) {
            self.status = Some(SessionStatus::Converged);
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Consecutive declines required to converge.
    pub decline_threshold: u32,
    /// Maximum passes before the session stops as budget-exhausted.
    pub max_passes: u32,
    /// Retry policy for transient backend errors within one pass.
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            decline_threshold: 3,
            max_passes: 8,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    description: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    confidence: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(default)]
    findings: Vec<RawFinding>,
    #[serde(default)]
    unexplored: Vec<UnexploredNote>,
    continue_exploring: bool,
    #[serde(default)]
    rationale: Option<String>,
}

/// Driver for convergent exploration.
#[derive(Debug, Clone, Default)]
pub struct ExplorationSession {
    config: SessionConfig,
}

impl ExplorationSession {
    /// Creates a session with the given configuration.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    /// Builds the judgment request for the next pass. The first pass gets
    /// the bare document; later passes get the accumulated map and the
    /// do-not-restate instruction.
    #[must_use]
    pub fn build_request(&self, document: &Document, state: &ExplorationState) -> JudgeRequest {
        let pass = state.next_pass_number();
        let prompt = if pass == 1 {
            FIRST_PASS_TEMPLATE.replace("{document}", &document.text)
        } else {
            let findings = state
                .all_findings()
                .iter()
                .map(|f| {
                    let backend = f.provenance.backend.as_deref().unwrap_or("unknown");
                    format!("- [{}] ({backend}) {}", f.category, f.explanation)
                })
                .collect::<Vec<_>>()
                .join("\n");
            let unexplored = state
                .latest_unexplored()
                .iter()
                .map(|u| format!("- {}: {}", u.description, u.why_interesting))
                .collect::<Vec<_>>()
                .join("\n");
            SUBSEQUENT_PASS_TEMPLATE
                .replace("{document}", &document.text)
                .replace("{finding_count}", &state.finding_count().to_string())
                .replace("{pass_count}", &state.passes().len().to_string())
                .replace(
                    "{findings}",
                    if findings.is_empty() { "(none recorded)" } else { findings.as_str() },
                )
                .replace(
                    "{unexplored}",
                    if unexplored.is_empty() { "(none recorded)" } else { unexplored.as_str() },
                )
        };

        JudgeRequest::new(RequestKind::Exploration { pass }, prompt)
            .with_meta("document", document.source.clone())
    }

    /// Parses a backend response into a [`PassReport`].
    ///
    /// # Errors
    /// `BackendError::Malformed` when the response is not the expected
    /// JSON shape.
    pub fn parse_report(
        &self,
        state: &ExplorationState,
        backend: &str,
        raw: &str,
    ) -> Result<PassReport, BackendError> {
        let extracted = extract_json(raw);
        let parsed: RawReport =
            serde_json::from_str(extracted).map_err(|e| BackendError::Malformed {
                backend: backend.to_string(),
                message: format!("exploration report: {e}"),
                raw: raw.to_string(),
            })?;

        let pass_number = state.next_pass_number();
        let findings = parsed
            .findings
            .into_iter()
            .map(|f| {
                let confidence = f
                    .confidence
                    .as_deref()
                    .map_or(Epistemic::Curious, Epistemic::from_label);
                let explanation = match f.location {
                    Some(location) if !location.is_empty() => {
                        format!("{} (at: {location})", f.description)
                    }
                    _ => f.description,
                };
                Finding::exploratory(
                    f.category.unwrap_or_else(|| "uncategorized".to_string()),
                    confidence,
                    explanation,
                    backend,
                    pass_number,
                )
            })
            .collect();

        Ok(PassReport {
            pass_number,
            backend: backend.to_string(),
            findings,
            unexplored: parsed.unexplored,
            continue_exploring: parsed.continue_exploring,
            rationale: parsed.rationale,
        })
    }

    /// Runs one pass: build the request, dispatch with bounded retry,
    /// parse, and append to the state.
    ///
    /// # Errors
    /// Backend failure after retries propagates; the state keeps every
    /// previously completed pass.
    pub fn run_pass(
        &self,
        state: &mut ExplorationState,
        document: &Document,
        backend: &Arc<dyn Backend>,
        cancel: &CancelToken,
    ) -> CrosstalkResult<PassReport> {
        if cancel.is_cancelled() {
            return Err(CrosstalkError::Cancelled);
        }

        let request = self.build_request(document, state);
        let verdict = self.call_with_retry(backend, &request, cancel)?;
        let report = self.parse_report(state, backend.name(), &verdict.raw)?;

        debug!(
            pass = report.pass_number,
            backend = %report.backend,
            findings = report.findings.len(),
            declines = state.consecutive_declines(),
            "exploration pass complete"
        );

        state.record(report.clone(), self.config.decline_threshold);
        Ok(report)
    }

    /// Drives passes until convergence or budget exhaustion, rotating
    /// through the backend list so successive passes see different
    /// judgment biases. The same backend never runs twice in a row unless
    /// the list has length 1.
    ///
    /// # Errors
    /// - `CrosstalkError::Internal` for an empty backend list;
    /// - pass failures propagate after retries, with completed passes
    ///   preserved in `state`.
    pub fn run(
        &self,
        document: &Document,
        backends: &[Arc<dyn Backend>],
        state: &mut ExplorationState,
        cancel: &CancelToken,
    ) -> CrosstalkResult<Termination> {
        if backends.is_empty() {
            return Err(CrosstalkError::internal(
                "exploration requires at least one backend",
            ));
        }

        while state.status() == SessionStatus::Exploring
            && state.next_pass_number() <= self.config.max_passes
        {
            let rotation = (state.next_pass_number() as usize - 1) % backends.len();
            self.run_pass(state, document, &backends[rotation], cancel)?;
        }

        let passes = state.passes().len() as u32;
        let termination = if state.status() == SessionStatus::Converged {
            info!(passes, "exploration converged");
            Termination::Converged { passes }
        } else {
            info!(passes, max = self.config.max_passes, "exploration budget exhausted");
            Termination::BudgetExhausted { passes }
        };
        Ok(termination)
    }

    fn call_with_retry(
        &self,
        backend: &Arc<dyn Backend>,
        request: &JudgeRequest,
        cancel: &CancelToken,
    ) -> CrosstalkResult<crate::backend::Verdict> {
        let attempts = self.config.retry.max_attempts.max(1);
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(CrosstalkError::Cancelled);
            }
            match backend.judge(request, cancel) {
                Ok(verdict) => return Ok(verdict),
                Err(error) => {
                    failures += 1;
                    if !error.is_retryable() || failures >= attempts {
                        return Err(error.into());
                    }
                    thread::sleep(self.config.retry.backoff(failures));
                }
            }
        }
    }
}
