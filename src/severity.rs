//! Severity scales for findings.
//!
//! Two independent scales are in play and are deliberately not
//! interoperable:
//!
//! - **Impact** ([`Severity`]): how badly a rule finding would misbehave at
//!   execution time. Produced by the rule path.
//! - **Epistemic** ([`Epistemic`]): how confident an exploratory pass is
//!   that it found something real. Produced by the exploration path.
//!
//! [`FindingSeverity`] wraps one or the other. Comparison across scales
//! yields `None`; no conversion function exists anywhere in this crate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Impact severity for rule findings.
///
/// Ordering is by impact: `Unknown < Minor < Major < Critical`. `Unknown`
/// marks a finding whose judgment response could not be parsed into a
/// verdict; it is recorded rather than dropped so that evaluation failures
/// are auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Evaluation produced no usable verdict; the pair remains suspect.
    Unknown,
    /// Maintenance risk only.
    Minor,
    /// Misbehavior under identifiable conditions.
    Major,
    /// Structurally guaranteed misbehavior.
    Critical,
}

impl Severity {
    /// Weight used for severity-weighted aggregate scoring.
    #[must_use]
    pub const fn weight(self) -> f32 {
        match self {
            Self::Critical => 1.0,
            Self::Major => 0.6,
            Self::Unknown => 0.5,
            Self::Minor => 0.3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Epistemic confidence for exploratory findings.
///
/// Ordering is by confidence: `Curious < Notable < Concerning < Alarming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Epistemic {
    /// Worth a look, probably benign.
    Curious,
    /// Deserves attention.
    Notable,
    /// Likely a real problem.
    Concerning,
    /// Almost certainly a real problem.
    Alarming,
}

impl Epistemic {
    /// Parse a backend-reported confidence label. Unrecognized labels map
    /// to `Curious` so a sloppy backend cannot inflate confidence.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "alarming" => Self::Alarming,
            "concerning" => Self::Concerning,
            "notable" => Self::Notable,
            _ => Self::Curious,
        }
    }
}

impl fmt::Display for Epistemic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Curious => "curious",
            Self::Notable => "notable",
            Self::Concerning => "concerning",
            Self::Alarming => "alarming",
        };
        write!(f, "{s}")
    }
}

/// The severity of a finding, on whichever scale produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    /// Impact scale, from the rule path.
    Impact(Severity),
    /// Epistemic-confidence scale, from the exploration path.
    Epistemic(Epistemic),
}

impl FindingSeverity {
    /// Returns the impact severity, if this finding is on the impact scale.
    #[must_use]
    pub const fn impact(self) -> Option<Severity> {
        match self {
            Self::Impact(s) => Some(s),
            Self::Epistemic(_) => None,
        }
    }

    /// Returns the epistemic confidence, if this finding is on that scale.
    #[must_use]
    pub const fn epistemic(self) -> Option<Epistemic> {
        match self {
            Self::Epistemic(e) => Some(e),
            Self::Impact(_) => None,
        }
    }
}

impl PartialOrd for FindingSeverity {
    /// Orders within a scale only. Cross-scale comparison returns `None`:
    /// an `Alarming` hunch and a `Minor` impact are not commensurable.
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Impact(a), Self::Impact(b)) => a.partial_cmp(b),
            (Self::Epistemic(a), Self::Epistemic(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Impact(s) => write!(f, "{s}"),
            Self::Epistemic(e) => write!(f, "{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impact_orders_by_severity() {
        assert!(Severity::Critical > Severity::Major);
        assert!(Severity::Major > Severity::Minor);
        assert!(Severity::Minor > Severity::Unknown);
    }

    #[test]
    fn epistemic_orders_by_confidence() {
        assert!(Epistemic::Alarming > Epistemic::Concerning);
        assert!(Epistemic::Concerning > Epistemic::Notable);
        assert!(Epistemic::Notable > Epistemic::Curious);
    }

    #[test]
    fn scales_do_not_cross_compare() {
        let impact = FindingSeverity::Impact(Severity::Minor);
        let epistemic = FindingSeverity::Epistemic(Epistemic::Alarming);
        assert_eq!(impact.partial_cmp(&epistemic), None);
        assert_eq!(epistemic.partial_cmp(&impact), None);
    }

    #[test]
    fn same_scale_compares() {
        let a = FindingSeverity::Impact(Severity::Critical);
        let b = FindingSeverity::Impact(Severity::Minor);
        assert!(a > b);

        let c = FindingSeverity::Epistemic(Epistemic::Curious);
        let d = FindingSeverity::Epistemic(Epistemic::Notable);
        assert!(c < d);
    }

    #[test]
    fn unrecognized_label_stays_curious() {
        assert_eq!(Epistemic::from_label("CATASTROPHIC"), Epistemic::Curious);
        assert_eq!(Epistemic::from_label(" Alarming "), Epistemic::Alarming);
    }

    #[test]
    fn serde_round_trip() {
        let sev = FindingSeverity::Impact(Severity::Major);
        let json = serde_json::to_string(&sev).unwrap();
        assert!(json.contains("impact"));
        let back: FindingSeverity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sev);
    }
}
