//! Deterministic scripted backend.
//!
//! Judgment-based outcomes are externally-observed facts; tests exercise
//! them through this backend instead of a live provider. Each call pops the
//! next scripted step, so a test controls the exact sequence of verdicts
//! and failures an evaluation observes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Backend, BackendError, BackendResult, CancelToken, JudgeRequest, Verdict};

#[derive(Debug, Clone)]
enum Step {
    Verdict(Verdict),
    Transport(String),
    Timeout(u64),
    Malformed { message: String, raw: String },
}

/// A backend that replays a scripted sequence of verdicts and failures.
///
/// When the script runs out, the fallback verdict (if any) is returned for
/// every further call; otherwise the call fails with a transport error so
/// an under-scripted test fails loudly instead of passing on accident.
#[derive(Debug)]
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Option<Verdict>,
    requests: Mutex<Vec<JudgeRequest>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    /// Creates a backend with an empty script and no fallback.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a backend that answers every call with the same verdict.
    #[must_use]
    pub fn always(name: impl Into<String>, verdict: Verdict) -> Self {
        let mut backend = Self::new(name);
        backend.fallback = Some(verdict);
        backend
    }

    /// Queues a verdict.
    #[must_use]
    pub fn push_verdict(self, verdict: Verdict) -> Self {
        self.script
            .lock()
            .expect("script lock")
            .push_back(Step::Verdict(verdict));
        self
    }

    /// Queues a raw-text-only verdict.
    #[must_use]
    pub fn push_raw(self, raw: impl Into<String>) -> Self {
        self.push_verdict(Verdict::raw_only(raw))
    }

    /// Queues a transport failure.
    #[must_use]
    pub fn push_transport_error(self, message: impl Into<String>) -> Self {
        self.script
            .lock()
            .expect("script lock")
            .push_back(Step::Transport(message.into()));
        self
    }

    /// Queues a timeout failure.
    #[must_use]
    pub fn push_timeout(self, elapsed_ms: u64) -> Self {
        self.script
            .lock()
            .expect("script lock")
            .push_back(Step::Timeout(elapsed_ms));
        self
    }

    /// Queues a malformed-response failure.
    #[must_use]
    pub fn push_malformed(self, message: impl Into<String>, raw: impl Into<String>) -> Self {
        self.script
            .lock()
            .expect("script lock")
            .push_back(Step::Malformed {
                message: message.into(),
                raw: raw.into(),
            });
        self
    }

    /// Number of judge calls received so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Snapshot of every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<JudgeRequest> {
        self.requests.lock().expect("request lock").clone()
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn judge(&self, request: &JudgeRequest, cancel: &CancelToken) -> BackendResult<Verdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("request lock")
            .push(request.clone());

        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled {
                backend: self.name.clone(),
            });
        }

        let step = self.script.lock().expect("script lock").pop_front();
        match step {
            Some(Step::Verdict(v)) => Ok(v),
            Some(Step::Transport(message)) => Err(BackendError::Transport {
                backend: self.name.clone(),
                message,
            }),
            Some(Step::Timeout(elapsed_ms)) => Err(BackendError::Timeout {
                backend: self.name.clone(),
                elapsed_ms,
            }),
            Some(Step::Malformed { message, raw }) => Err(BackendError::Malformed {
                backend: self.name.clone(),
                message,
                raw,
            }),
            None => match &self.fallback {
                Some(v) => Ok(v.clone()),
                None => Err(BackendError::Transport {
                    backend: self.name.clone(),
                    message: "script exhausted".to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RequestKind;

    fn request() -> JudgeRequest {
        JudgeRequest::new(RequestKind::Composition, "judge this")
    }

    #[test]
    fn replays_script_in_order() {
        let backend = ScriptedBackend::new("fake")
            .push_raw("first")
            .push_transport_error("flaky")
            .push_raw("third");
        let cancel = CancelToken::new();

        assert_eq!(backend.judge(&request(), &cancel).unwrap().raw, "first");
        assert!(backend.judge(&request(), &cancel).is_err());
        assert_eq!(backend.judge(&request(), &cancel).unwrap().raw, "third");
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn exhausted_script_fails_loudly() {
        let backend = ScriptedBackend::new("fake");
        let err = backend.judge(&request(), &CancelToken::new()).unwrap_err();
        assert!(err.to_string().contains("script exhausted"));
    }

    #[test]
    fn fallback_answers_forever() {
        let backend = ScriptedBackend::always("fake", Verdict::resolved_with(None, "ok"));
        let cancel = CancelToken::new();
        for _ in 0..5 {
            assert_eq!(
                backend.judge(&request(), &cancel).unwrap().resolved,
                Some(true)
            );
        }
    }

    #[test]
    fn cancelled_token_short_circuits() {
        let backend = ScriptedBackend::new("fake").push_raw("never seen");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = backend.judge(&request(), &cancel).unwrap_err();
        assert!(matches!(err, BackendError::Cancelled { .. }));
    }

    #[test]
    fn records_requests_for_assertions() {
        let backend = ScriptedBackend::new("fake").push_raw("ok");
        let req = request().with_meta("document", "corpus/v1");
        backend.judge(&req, &CancelToken::new()).unwrap();
        let seen = backend.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].metadata.get("document").unwrap(), "corpus/v1");
    }
}
