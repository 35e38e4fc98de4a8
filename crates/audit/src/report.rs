//! Compliance reports and anomaly detection.
//!
//! Two anomaly signals are computed over the report period:
//!
//! - **High activity rate**: an actor produced more than
//!   [`rate_threshold`](crate::AuditConfig::rate_threshold) entries within any window of
//!   [`rate_window`](crate::AuditConfig::rate_window). Reported once per actor, for the busiest
//!   window.
//! - **First-time action**: an actor performed an action for the first time after already having
//!   performed at least [`first_action_min_prior`](crate::AuditConfig::first_action_min_prior)
//!   distinct other actions. The actor's history before the period counts towards both sides.
//!
//! The first-time signal is deliberately simple and can be noisy for actors
//! whose role legitimately changes; consumers should treat it as a hint.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_storage::ConfigError;

use crate::{
    compliance::ComplianceRegime,
    config::AuditConfig,
    engine::AuditEngine,
    entry::{AuditLogEntry, Outcome},
    error::Result,
    store::{AuditQuery, SortOrder},
};

/// Half-open reporting interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPeriod {
    /// First instant included.
    pub start: DateTime<Utc>,
    /// First instant excluded.
    pub end: DateTime<Utc>,
}

impl ReportPeriod {
    /// Creates a period.
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Occurrences of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCount {
    /// Action name.
    pub action: String,
    /// Entries with this action.
    pub count: usize,
}

/// Per-regime totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegimeSummary {
    /// Entries tagged with the regime.
    pub events: usize,
    /// Of which high risk.
    pub high_risk_events: usize,
    /// Of which failed.
    pub failure_events: usize,
}

/// Behaviour worth a human look.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// Too many entries from one actor in a short window.
    HighActivityRate {
        /// The actor.
        actor_id: String,
        /// Timestamp of the first entry in the busiest window.
        window_start: DateTime<Utc>,
        /// Entries in that window.
        count: usize,
    },
    /// An established actor did something new.
    FirstTimeAction {
        /// The actor.
        actor_id: String,
        /// The new action.
        action: String,
        /// Entry where it first appeared.
        entry_id: Uuid,
        /// When it first appeared.
        timestamp: DateTime<Utc>,
        /// Distinct actions the actor had performed before.
        prior_distinct_actions: usize,
    },
}

/// Summary of audit activity for a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    /// Covered interval.
    pub period: ReportPeriod,
    /// Regimes the report was restricted to; empty means all entries.
    pub regimes: BTreeSet<ComplianceRegime>,
    /// When the report was produced.
    pub generated_at: DateTime<Utc>,
    /// Entries in scope.
    pub total_events: usize,
    /// Entries at or above the high-risk threshold.
    pub high_risk_events: usize,
    /// Entries with a `failure` outcome.
    pub failure_events: usize,
    /// Distinct actor ids.
    pub distinct_actors: usize,
    /// Most frequent actions, most frequent first.
    pub top_actions: Vec<ActionCount>,
    /// Totals per regime.
    pub by_regime: BTreeMap<ComplianceRegime, RegimeSummary>,
    /// Detected anomalies.
    pub anomalies: Vec<Anomaly>,
}

impl AuditEngine {
    /// Builds a compliance report for `period`.
    ///
    /// Entries are in scope when they fall in the period and, if `regimes`
    /// is non-empty, carry at least one of the listed regimes.
    ///
    /// # Errors
    ///
    /// [`AuditError::Config`](crate::AuditError::Config) for an empty or
    /// inverted period, or a store error.
    #[tracing::instrument(skip(self, regimes), fields(start = %period.start, end = %period.end))]
    pub async fn generate_compliance_report(
        &self,
        period: ReportPeriod,
        regimes: &[ComplianceRegime],
    ) -> Result<ComplianceReport> {
        if period.start >= period.end {
            return Err(ConfigError::Invalid(format!(
                "report period start {} is not before end {}",
                period.start, period.end
            ))
            .into());
        }

        self.flush_for_read().await;
        let history = self
            .inner
            .store
            .query(&AuditQuery::builder().end(period.end).order(SortOrder::Ascending).build())
            .await?
            .entries;

        let regimes: BTreeSet<ComplianceRegime> = regimes.iter().copied().collect();
        let in_scope = |entry: &AuditLogEntry| {
            period.contains(entry.timestamp)
                && (regimes.is_empty() || !entry.compliance_flags.is_disjoint(&regimes))
        };

        let config = &self.inner.config;
        let threshold = config.high_risk_threshold;
        let scoped: Vec<&AuditLogEntry> = history.iter().filter(|e| in_scope(e)).collect();

        let mut action_counts: HashMap<&str, usize> = HashMap::new();
        let mut actors: HashSet<&str> = HashSet::new();
        let mut by_regime: BTreeMap<ComplianceRegime, RegimeSummary> = BTreeMap::new();
        let listed: Vec<ComplianceRegime> =
            if regimes.is_empty() { ComplianceRegime::ALL.to_vec() } else { regimes.iter().copied().collect() };
        for regime in &listed {
            by_regime.insert(*regime, RegimeSummary::default());
        }

        let mut high_risk_events = 0;
        let mut failure_events = 0;
        for entry in &scoped {
            let high = entry.risk_score >= threshold;
            let failed = entry.outcome == Outcome::Failure;
            high_risk_events += usize::from(high);
            failure_events += usize::from(failed);
            *action_counts.entry(entry.action.as_str()).or_default() += 1;
            actors.insert(entry.actor.id.as_str());

            for regime in &entry.compliance_flags {
                if let Some(summary) = by_regime.get_mut(regime) {
                    summary.events += 1;
                    summary.high_risk_events += usize::from(high);
                    summary.failure_events += usize::from(failed);
                }
            }
        }

        let mut top_actions: Vec<ActionCount> = action_counts
            .into_iter()
            .map(|(action, count)| ActionCount { action: action.to_owned(), count })
            .collect();
        top_actions.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.action.cmp(&b.action)));
        top_actions.truncate(config.top_actions);

        let mut anomalies = rate_anomalies(&scoped, config);
        anomalies.extend(first_time_anomalies(&history, in_scope, config));

        Ok(ComplianceReport {
            period,
            regimes,
            generated_at: self.inner.clock.now(),
            total_events: scoped.len(),
            high_risk_events,
            failure_events,
            distinct_actors: actors.len(),
            top_actions,
            by_regime,
            anomalies,
        })
    }
}

/// Busiest window per actor, reported if it exceeds the threshold.
///
/// `entries` must be in ascending timestamp order.
fn rate_anomalies(entries: &[&AuditLogEntry], config: &AuditConfig) -> Vec<Anomaly> {
    let window = chrono::Duration::from_std(config.rate_window).unwrap_or(chrono::Duration::MAX);

    let mut per_actor: BTreeMap<&str, Vec<DateTime<Utc>>> = BTreeMap::new();
    for entry in entries {
        per_actor.entry(entry.actor.id.as_str()).or_default().push(entry.timestamp);
    }

    let mut anomalies = Vec::new();
    for (actor_id, times) in per_actor {
        let mut start = 0;
        let mut busiest = (0, 0);
        for end in 0..times.len() {
            while times[end] - times[start] >= window {
                start += 1;
            }
            let count = end - start + 1;
            if count > busiest.0 {
                busiest = (count, start);
            }
        }
        if busiest.0 > config.rate_threshold {
            anomalies.push(Anomaly::HighActivityRate {
                actor_id: actor_id.to_owned(),
                window_start: times[busiest.1],
                count: busiest.0,
            });
        }
    }
    anomalies
}

/// New actions by established actors.
///
/// `history` must be in ascending timestamp order and cover everything
/// before the period end.
fn first_time_anomalies(
    history: &[AuditLogEntry],
    in_scope: impl Fn(&AuditLogEntry) -> bool,
    config: &AuditConfig,
) -> Vec<Anomaly> {
    let mut seen: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut anomalies = Vec::new();
    for entry in history {
        let actions = seen.entry(entry.actor.id.as_str()).or_default();
        let prior = actions.len();
        let is_new = actions.insert(entry.action.as_str());
        if is_new && prior >= config.first_action_min_prior && in_scope(entry) {
            anomalies.push(Anomaly::FirstTimeAction {
                actor_id: entry.actor.id.clone(),
                action: entry.action.clone(),
                entry_id: entry.id,
                timestamp: entry.timestamp,
                prior_distinct_actions: prior,
            });
        }
    }
    anomalies
}
