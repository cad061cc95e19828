//! Backend profile registry: empirically-grounded backend selection.
//!
//! A profile records what is known about one backend configuration —
//! per-domain detection performance, cost, disqualifying issues. The
//! registry answers "which backends should evaluate this domain, under
//! this budget?" and produces the rotation order the exploration session
//! uses. Profiles are data only; constructing the actual [`Backend`]
//! values stays with the caller.
//!
//! [`Backend`]: crate::backend::Backend

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Typical token counts for one judge call, used for cost estimates.
const AVG_INPUT_TOKENS: f64 = 1500.0;
const AVG_OUTPUT_TOKENS: f64 = 500.0;

/// Empirical performance on one domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainScore {
    /// Fraction of seeded conflicts detected.
    pub detection_rate: f32,
    /// Fraction of clean inputs incorrectly flagged.
    pub false_positive_rate: f32,
    /// Number of characterization trials behind the numbers.
    pub trials: u32,
}

/// Everything the registry knows about one backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendProfile {
    /// Registry name (unique).
    pub name: String,
    /// Provider-facing model identifier.
    pub model_id: String,
    /// Provider label, e.g. "openrouter".
    pub provider: String,
    /// Per-domain characterization data.
    pub domain_scores: BTreeMap<String, DomainScore>,
    /// Known behavioral issues worth a caller's attention.
    pub known_issues: Vec<String>,
    /// Excluded from selection by default.
    pub disqualified: bool,
    /// Cost per million input tokens, if known.
    pub cost_per_million_input: Option<f64>,
    /// Cost per million output tokens, if known.
    pub cost_per_million_output: Option<f64>,
}

impl BackendProfile {
    /// Creates a minimal profile.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        model_id: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model_id: model_id.into(),
            provider: provider.into(),
            domain_scores: BTreeMap::new(),
            known_issues: Vec::new(),
            disqualified: false,
            cost_per_million_input: None,
            cost_per_million_output: None,
        }
    }

    /// Records a domain score.
    #[must_use]
    pub fn with_domain_score(mut self, domain: impl Into<String>, score: DomainScore) -> Self {
        self.domain_scores.insert(domain.into(), score);
        self
    }

    /// Sets pricing per million tokens.
    #[must_use]
    pub fn with_cost(mut self, input: f64, output: f64) -> Self {
        self.cost_per_million_input = Some(input);
        self.cost_per_million_output = Some(output);
        self
    }

    /// Marks the profile disqualified.
    #[must_use]
    pub fn disqualify(mut self, issue: impl Into<String>) -> Self {
        self.disqualified = true;
        self.known_issues.push(issue.into());
        self
    }

    /// Estimated cost of a single judge call with typical token counts.
    /// `None` when pricing is unknown.
    #[must_use]
    pub fn estimated_cost_per_call(&self) -> Option<f64> {
        let input = self.cost_per_million_input?;
        let output = self.cost_per_million_output?;
        Some(input * AVG_INPUT_TOKENS / 1_000_000.0 + output * AVG_OUTPUT_TOKENS / 1_000_000.0)
    }
}

/// Filters applied during selection.
#[derive(Debug, Clone)]
pub struct SelectionConstraints {
    /// Reject profiles whose estimated cost per call exceeds this.
    /// Unknown cost passes — lack of data is not a penalty.
    pub budget_per_call: Option<f64>,
    /// Minimum detection rate on the requested domain. Unmeasured
    /// domains pass.
    pub min_detection_rate: f32,
    /// Maximum false-positive rate on the requested domain. Unmeasured
    /// domains pass.
    pub max_false_positive_rate: f32,
    /// Include profiles marked disqualified.
    pub include_disqualified: bool,
}

impl Default for SelectionConstraints {
    fn default() -> Self {
        Self {
            budget_per_call: None,
            min_detection_rate: 0.0,
            max_false_positive_rate: 1.0,
            include_disqualified: false,
        }
    }
}

/// Registry of backend profiles with domain-aware selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendRegistry {
    profiles: Vec<BackendProfile>,
}

impl BackendRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or overwrites a profile by name. Insertion order is kept for
    /// profiles that are not overwritten.
    pub fn register(&mut self, profile: BackendProfile) {
        match self.profiles.iter_mut().find(|p| p.name == profile.name) {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
    }

    /// Looks up a profile by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BackendProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// All profiles, in insertion order.
    #[must_use]
    pub fn profiles(&self) -> &[BackendProfile] {
        &self.profiles
    }

    /// Ranks profiles for a domain, best first.
    ///
    /// Profiles with a score on the domain sort by detection rate
    /// descending, then estimated cost ascending; unmeasured profiles sort
    /// to the end in insertion order.
    #[must_use]
    pub fn select(&self, domain: &str, constraints: &SelectionConstraints) -> Vec<&BackendProfile> {
        let mut measured: Vec<(&BackendProfile, DomainScore)> = Vec::new();
        let mut unmeasured: Vec<&BackendProfile> = Vec::new();

        for profile in &self.profiles {
            if profile.disqualified && !constraints.include_disqualified {
                continue;
            }
            if let (Some(budget), Some(cost)) =
                (constraints.budget_per_call, profile.estimated_cost_per_call())
            {
                if cost > budget {
                    continue;
                }
            }
            match profile.domain_scores.get(domain) {
                Some(score) => {
                    if score.detection_rate < constraints.min_detection_rate
                        || score.false_positive_rate > constraints.max_false_positive_rate
                    {
                        continue;
                    }
                    measured.push((profile, *score));
                }
                None => unmeasured.push(profile),
            }
        }

        measured.sort_by(|(pa, sa), (pb, sb)| {
            sb.detection_rate
                .partial_cmp(&sa.detection_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let ca = pa.estimated_cost_per_call().unwrap_or(f64::MAX);
                    let cb = pb.estimated_cost_per_call().unwrap_or(f64::MAX);
                    ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        measured
            .into_iter()
            .map(|(profile, _)| profile)
            .chain(unmeasured)
            .collect()
    }

    /// Rotation order for an exploration session on a domain: the selected
    /// profile names, best first. Diversity of judgment biases is the
    /// point, so every qualifying profile appears once.
    #[must_use]
    pub fn rotation(&self, domain: &str, constraints: &SelectionConstraints) -> Vec<String> {
        self.select(domain, constraints)
            .into_iter()
            .map(|p| p.name.clone())
            .collect()
    }
}
