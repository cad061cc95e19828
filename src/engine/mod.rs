//! The rule engine: pre-filtered pairwise evaluation of blocks.
//!
//! For every unordered block pair and every rule, the rule's pre-filter
//! decides whether evaluation happens at all; only pairs with genuine
//! scope/modality tension proceed. Structural rules run first (pure,
//! reproducible, free); judgment rules run on the residual pair set through
//! a bounded worker pool. Results merge into the interference index keyed
//! by `(a, b, rule)`, so completion order never loses updates.
//!
//! A judgment response that cannot be parsed into a score is recorded as an
//! `Unknown`-severity finding — never dropped, never treated as "no
//! conflict". The same downgrade applies when a backend call exhausts its
//! retries.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backend::{
    extract_json, Backend, BackendError, CancelToken, JudgeRequest, RequestKind, Verdict,
};
use crate::block::{Block, BlockId};
use crate::error::{CrosstalkError, CrosstalkResult};
use crate::finding::Finding;
use crate::index::InterferenceIndex;
use crate::rule::{CompiledRuleSet, Evaluation, Rule};

mod pool;
use pool::WorkerPool;

/// Bounded retry with multiplicative backoff for transient backend errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Backoff multiplier per further attempt.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// No retries: every error is final on the first attempt.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Backoff before the attempt following failure number `failure`
    /// (1-based).
    #[must_use]
    pub fn backoff(&self, failure: u32) -> Duration {
        self.initial_backoff * self.multiplier.pow(failure.saturating_sub(1))
    }
}

/// Rule engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Judgment dispatch concurrency.
    pub workers: usize,
    /// Maximum queued judgment jobs before submission blocks.
    pub queue_capacity: usize,
    /// Retry policy for transient backend errors.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    score: f32,
    #[serde(default)]
    explanation: Option<String>,
}

struct JobResult {
    a: BlockId,
    b: BlockId,
    rule: Rule,
    outcome: Result<Verdict, BackendError>,
}

/// Pre-filtered pairwise evaluator producing an [`InterferenceIndex`].
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    config: EngineConfig,
}

impl RuleEngine {
    /// Creates an engine with the given configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Runs the structural rules only. No backend calls, fully
    /// reproducible for a given `(blocks, rules)` pair.
    #[must_use]
    pub fn evaluate_structural(
        &self,
        blocks: &[Block],
        rules: &CompiledRuleSet,
    ) -> InterferenceIndex {
        let mut index = new_index(blocks, rules);
        let mut evaluated = 0usize;

        for (a, b, rule) in rules.applicable_pairs(blocks) {
            let Evaluation::Structural(check) = &rule.evaluation else {
                continue;
            };
            evaluated += 1;
            let score = check.score(a, b);
            if let Some(severity) = rule.severity_of(score) {
                let finding = Finding::structural(
                    a.id,
                    b.id,
                    rule.id.clone(),
                    rule.kind.slug(),
                    severity,
                    score,
                    format!("Structural check: {}", rule.id),
                );
                index.insert(a.id, b.id, &rule.id, finding);
            }
        }

        debug!(
            blocks = blocks.len(),
            evaluated,
            findings = index.len(),
            "structural pass complete"
        );
        index
    }

    /// The `(a, b, rule, request)` judgment work remaining after
    /// pre-filtering, for callers that route backend calls themselves.
    #[must_use]
    pub fn pending_judgment<'a>(
        &self,
        blocks: &'a [Block],
        rules: &'a CompiledRuleSet,
    ) -> Vec<(&'a Block, &'a Block, &'a Rule, JudgeRequest)> {
        rules
            .applicable_pairs(blocks)
            .into_iter()
            .filter_map(|(a, b, rule)| {
                let prompt = rule.render_prompt(a, b)?;
                let request = JudgeRequest::new(
                    RequestKind::PairRule {
                        rule: rule.id.clone(),
                    },
                    prompt,
                )
                .with_meta("block_a", a.id.to_string())
                .with_meta("block_b", b.id.to_string());
                Some((a, b, rule, request))
            })
            .collect()
    }

    /// Full evaluation: structural pass, then judgment rules through the
    /// worker pool.
    ///
    /// # Errors
    /// `CrosstalkError::Cancelled` when the token fires; a cancelled
    /// evaluation commits no partial index. Individual backend failures do
    /// not error — they are recorded as `Unknown`-severity findings.
    pub fn evaluate(
        &self,
        blocks: &[Block],
        rules: &CompiledRuleSet,
        backend: &Arc<dyn Backend>,
        cancel: &CancelToken,
    ) -> CrosstalkResult<InterferenceIndex> {
        if cancel.is_cancelled() {
            return Err(CrosstalkError::Cancelled);
        }

        let mut index = self.evaluate_structural(blocks, rules);

        let pending = self.pending_judgment(blocks, rules);
        debug!(
            pending = pending.len(),
            backend = backend.name(),
            "dispatching judgment rules"
        );
        if pending.is_empty() {
            return Ok(index);
        }

        let (tx, rx) = unbounded::<JobResult>();
        let expected = pending.len();
        {
            let pool = WorkerPool::start(
                "crosstalk-judge",
                self.config.workers,
                self.config.queue_capacity,
            );
            for (a, b, rule, request) in pending {
                let job = JudgeJob {
                    a: a.id,
                    b: b.id,
                    rule: rule.clone(),
                    request,
                    backend: Arc::clone(backend),
                    cancel: cancel.clone(),
                    retry: self.config.retry.clone(),
                };
                let tx = tx.clone();
                pool.submit(move || {
                    let result = job.run();
                    let _ = tx.send(result);
                });
            }
            // Pool drop joins the workers once the queue drains.
        }
        drop(tx);

        let mut results = Vec::with_capacity(expected);
        while let Ok(result) = rx.recv() {
            results.push(result);
        }

        if cancel.is_cancelled() {
            return Err(CrosstalkError::Cancelled);
        }

        for result in results {
            record_outcome(&mut index, result, backend.name());
        }
        Ok(index)
    }
}

fn record_outcome(index: &mut InterferenceIndex, result: JobResult, backend: &str) {
    let JobResult { a, b, rule, outcome } = result;
    match outcome {
        Ok(verdict) => match parse_score(&verdict.raw) {
            Ok(response) => {
                let score = response.score.clamp(0.0, 1.0);
                if let Some(severity) = rule.severity_of(score) {
                    let finding = Finding::judgment(
                        a,
                        b,
                        rule.id.clone(),
                        rule.kind.slug(),
                        severity,
                        score,
                        response
                            .explanation
                            .unwrap_or_else(|| format!("Rule {} triggered", rule.id)),
                        backend,
                        verdict.raw.clone(),
                    );
                    index.insert(a, b, &rule.id, finding);
                }
            }
            Err(reason) => {
                warn!(rule = %rule.id, %reason, "judgment response unparseable");
                let finding = Finding::unknown(
                    a,
                    b,
                    rule.id.clone(),
                    rule.kind.slug(),
                    format!("Judgment response could not be parsed: {reason}"),
                    backend,
                    Some(verdict.raw.clone()),
                );
                index.insert(a, b, &rule.id, finding);
            }
        },
        Err(BackendError::Cancelled { .. }) => {
            // The evaluation-level cancellation check already covers this;
            // an individually cancelled job records nothing.
        }
        Err(error) => {
            warn!(rule = %rule.id, %error, "judgment call failed after retries");
            let finding = Finding::unknown(
                a,
                b,
                rule.id.clone(),
                rule.kind.slug(),
                format!("Judgment call failed: {error}"),
                backend,
                None,
            );
            index.insert(a, b, &rule.id, finding);
        }
    }
}

struct JudgeJob {
    a: BlockId,
    b: BlockId,
    rule: Rule,
    request: JudgeRequest,
    backend: Arc<dyn Backend>,
    cancel: CancelToken,
    retry: RetryPolicy,
}

impl JudgeJob {
    fn run(self) -> JobResult {
        let outcome = self.call_with_retry();
        JobResult {
            a: self.a,
            b: self.b,
            rule: self.rule,
            outcome,
        }
    }

    fn call_with_retry(&self) -> Result<Verdict, BackendError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut failures = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(BackendError::Cancelled {
                    backend: self.backend.name().to_string(),
                });
            }
            match self.backend.judge(&self.request, &self.cancel) {
                Ok(verdict) => return Ok(verdict),
                Err(error) => {
                    failures += 1;
                    if !error.is_retryable() || failures >= attempts {
                        return Err(error);
                    }
                    thread::sleep(self.retry.backoff(failures));
                }
            }
        }
    }
}

fn parse_score(raw: &str) -> Result<ScoreResponse, String> {
    let extracted = extract_json(raw);
    let response: ScoreResponse =
        serde_json::from_str(extracted).map_err(|e| e.to_string())?;
    if !response.score.is_finite() {
        return Err("score is not a finite number".to_string());
    }
    Ok(response)
}

fn new_index(blocks: &[Block], rules: &CompiledRuleSet) -> InterferenceIndex {
    InterferenceIndex::new(
        blocks.iter().map(|b| b.id).collect(),
        rules.rules().iter().map(|r| r.id.clone()).collect(),
    )
}
