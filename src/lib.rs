//! # Crosstalk — interference detection for layered instruction documents
//!
//! Crosstalk finds contradictions, redundant overlaps, ambiguous precedence,
//! and undeclared dependencies inside an instruction document ("prompt")
//! before it is handed to an executing model. The model that executes a
//! contradictory instruction set will silently resolve the contradiction
//! rather than report it, so detection has to happen in a separate
//! evaluation pass: structurally where a cheap deterministic check
//! suffices, and via model judgment where it doesn't.
//!
//! ## Core concepts
//!
//! - **Block**: a classified, contiguous segment of a source document
//! - **Rule**: one interference class, with a cheap pre-filter that bounds
//!   what gets evaluated
//! - **InterferenceIndex**: sparse findings over `(block, block, rule)`
//! - **Ensemble**: one composition judged by many backends, OR-gated
//! - **Exploration**: convergent open-ended passes beyond the rule set
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use crosstalk::{
//!     decompose::{heuristic, Document},
//!     Backend, CancelToken, RuleEngine, Tier,
//! };
//!
//! let document = Document::new("agent/v1", prompt_text, Tier::Contextual);
//! let blocks = heuristic::decompose(&document);
//! let rules = crosstalk::default_rule_set().compile()?;
//!
//! // Structural pass: free, deterministic.
//! let engine = RuleEngine::default();
//! let index = engine.evaluate_structural(&blocks, &rules);
//! println!("{}", index.summary_report());
//!
//! // Full pass: judgment rules through a backend.
//! let backend: Arc<dyn Backend> = make_backend();
//! let index = engine.evaluate(&blocks, &rules, &backend, &CancelToken::new())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod backend;
pub mod block;
pub mod error;
pub mod finding;
pub mod index;
pub mod rule;
pub mod severity;

// Evaluation paths
pub mod decompose;
pub mod engine;
pub mod ensemble;
pub mod explore;
pub mod registry;

// Re-export primary types at crate root for convenience
pub use backend::{
    Backend, BackendError, BackendResult, CancelToken, ConflictReport, JudgeRequest, RequestKind,
    ScriptedBackend, Verdict,
};
pub use block::{Block, BlockId, Modality, Tier};
pub use error::{CrosstalkError, CrosstalkResult, DecompositionError};
pub use finding::{Finding, FindingSubject, Provenance};
pub use index::InterferenceIndex;
pub use rule::{
    builtin_rules, default_rule_set, CompilationError, CompiledRuleSet, Evaluation, Rule,
    RuleKind, RuleSet, StructuralCheck,
};
pub use severity::{Epistemic, FindingSeverity, Severity};

pub use decompose::{AssistedDecomposer, Document, Segment};
pub use engine::{EngineConfig, RetryPolicy, RuleEngine};
pub use ensemble::{
    BackendFailure, BackendVerdict, ClauseClash, ContextLayer, EnsembleConfig, EnsembleEvaluator,
    EnsembleResult, EvaluationRequest, Foundation,
};
pub use explore::{
    ExplorationSession, ExplorationState, PassReport, SessionConfig, SessionStatus, Termination,
    UnexploredNote,
};
pub use registry::{BackendProfile, BackendRegistry, DomainScore, SelectionConstraints};

#[cfg(feature = "http")]
pub use backend::openai::{OpenAiCompatibleBackend, OpenAiConfig};
