//! Table-driven risk scoring.
//!
//! A score is the sum of independent, bounded contributions, one per
//! attribute of the event, clamped to `[0, 1]` and rounded to four decimal
//! places. Scoring is a pure function of the [`RiskPolicy`] and the
//! [`RiskSignals`]; the engine supplies the only stateful input (whether the
//! network origin is unfamiliar for this actor).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entry::{ActorType, Outcome};

/// Event attributes that feed the score.
#[derive(Debug, Clone, Copy)]
pub struct RiskSignals<'a> {
    /// Dotted action name.
    pub action: &'a str,
    /// How the action ended.
    pub outcome: Outcome,
    /// Kind of actor.
    pub actor_type: ActorType,
    /// The actor has a known origin history and this origin is not in it.
    pub unfamiliar_origin: bool,
    /// Resource category.
    pub resource_type: &'a str,
}

/// Attribute-to-weight tables.
///
/// Action and resource tables are looked up by exact name first, then by
/// the segment before the first `.` (so `session.*` can be weighted as a
/// family). Unlisted names fall back to the respective default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskPolicy {
    /// Sensitivity of specific actions.
    pub action_weights: BTreeMap<String, f64>,
    /// Sensitivity of actions missing from the table.
    pub default_action_weight: f64,
    /// Contribution per outcome.
    pub outcome_weights: BTreeMap<Outcome, f64>,
    /// Contribution per actor type.
    pub actor_type_weights: BTreeMap<ActorType, f64>,
    /// Contribution when the origin is unfamiliar for the actor.
    pub unfamiliar_origin_weight: f64,
    /// Sensitivity of resource categories.
    pub resource_weights: BTreeMap<String, f64>,
    /// Sensitivity of resource categories missing from the table.
    pub default_resource_weight: f64,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        let action_weights = [
            ("session.reuse_detected", 0.6),
            ("key.rotate", 0.3),
            ("audit.export", 0.3),
            ("audit.retention_sweep", 0.2),
            ("session.revoke", 0.2),
            ("session.issue", 0.1),
            ("session.refresh", 0.1),
            ("token.verify", 0.05),
        ];
        let resource_weights = [
            ("signing_key", 0.2),
            ("financial", 0.2),
            ("health", 0.2),
            ("payment", 0.2),
            ("personal", 0.15),
            ("audit_log", 0.15),
            ("session", 0.1),
            ("token", 0.05),
        ];
        Self {
            action_weights: to_table(&action_weights),
            default_action_weight: 0.1,
            outcome_weights: [(Outcome::Success, 0.0), (Outcome::Failure, 0.3), (Outcome::Error, 0.15)]
                .into_iter()
                .collect(),
            actor_type_weights: [
                (ActorType::User, 0.05),
                (ActorType::Service, 0.0),
                (ActorType::System, 0.0),
                (ActorType::Anonymous, 0.2),
            ]
            .into_iter()
            .collect(),
            unfamiliar_origin_weight: 0.15,
            resource_weights: to_table(&resource_weights),
            default_resource_weight: 0.0,
        }
    }
}

fn to_table(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(name, weight)| ((*name).to_owned(), *weight)).collect()
}

fn lookup(table: &BTreeMap<String, f64>, name: &str, default: f64) -> f64 {
    if let Some(weight) = table.get(name) {
        return *weight;
    }
    name.split_once('.')
        .and_then(|(family, _)| table.get(&format!("{family}.*")).or_else(|| table.get(family)))
        .copied()
        .unwrap_or(default)
}

impl RiskPolicy {
    /// Scores an event. Always returns a value in `[0, 1]`.
    #[must_use]
    pub fn score(&self, signals: &RiskSignals<'_>) -> f64 {
        let contributions = [
            lookup(&self.action_weights, signals.action, self.default_action_weight),
            self.outcome_weights.get(&signals.outcome).copied().unwrap_or(0.0),
            self.actor_type_weights.get(&signals.actor_type).copied().unwrap_or(0.0),
            if signals.unfamiliar_origin { self.unfamiliar_origin_weight } else { 0.0 },
            lookup(&self.resource_weights, signals.resource_type, self.default_resource_weight),
        ];
        // NaN weights contribute nothing.
        let total: f64 = contributions.iter().filter(|w| w.is_finite()).map(|w| w.max(0.0)).sum();
        quantize(total.clamp(0.0, 1.0))
    }
}

/// Rounds to four decimal places so scores survive text serialization.
#[must_use]
pub fn quantize(score: f64) -> f64 {
    (score * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn signals(action: &str, outcome: Outcome) -> RiskSignals<'_> {
        RiskSignals {
            action,
            outcome,
            actor_type: ActorType::User,
            unfamiliar_origin: false,
            resource_type: "session",
        }
    }

    #[test]
    fn test_reuse_detection_is_high_risk() {
        let score = RiskPolicy::default().score(&signals("session.reuse_detected", Outcome::Failure));
        assert!(score >= 0.9, "score was {score}");
    }

    #[test]
    fn test_routine_verification_is_low_risk() {
        let mut s = signals("token.verify", Outcome::Success);
        s.actor_type = ActorType::Service;
        s.resource_type = "token";
        assert!(RiskPolicy::default().score(&s) < 0.2);
    }

    #[test]
    fn test_failure_and_unfamiliar_origin_add_up() {
        let policy = RiskPolicy::default();
        let base = policy.score(&signals("token.verify", Outcome::Success));
        let failed = policy.score(&signals("token.verify", Outcome::Failure));
        let mut odd = signals("token.verify", Outcome::Failure);
        odd.unfamiliar_origin = true;
        let failed_odd = policy.score(&odd);
        assert!(base < failed && failed < failed_odd);
    }

    #[test]
    fn test_family_wildcard_applies_to_unlisted_action() {
        let mut policy = RiskPolicy::default();
        policy.action_weights.insert("billing.*".into(), 0.5);
        let score = policy.score(&RiskSignals {
            action: "billing.refund",
            outcome: Outcome::Success,
            actor_type: ActorType::Service,
            unfamiliar_origin: false,
            resource_type: "invoice",
        });
        assert_eq!(score, 0.5);
    }

    #[test]
    fn test_score_is_deterministic() {
        let policy = RiskPolicy::default();
        let s = signals("key.rotate", Outcome::Error);
        assert_eq!(policy.score(&s), policy.score(&s));
    }

    proptest! {
        #[test]
        fn score_is_always_in_unit_interval(
            action_weight in -5.0f64..5.0,
            origin_weight in -5.0f64..5.0,
            unfamiliar in any::<bool>(),
            action in "[a-z]{1,8}(\\.[a-z]{1,8})?",
        ) {
            let mut policy = RiskPolicy::default();
            policy.default_action_weight = action_weight;
            policy.unfamiliar_origin_weight = origin_weight;
            let score = policy.score(&RiskSignals {
                action: &action,
                outcome: Outcome::Failure,
                actor_type: ActorType::Anonymous,
                unfamiliar_origin: unfamiliar,
                resource_type: "payment",
            });
            prop_assert!((0.0..=1.0).contains(&score));
        }
    }
}
