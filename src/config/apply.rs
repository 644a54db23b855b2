//! Versioned configuration store with simulation-gated commits.
//!
//! Versions form an append-only log; the head is the latest committed
//! version. Rollback copies an older spec into a new head instead of
//! rewriting history, keeping the log auditable.

use super::spec::EngineConfigSpec;
use crate::error::{Error, Result};
use crate::lock_ignoring_poison;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// How many net-new business rules a candidate may introduce before the
/// default simulator rejects it.
const DEFAULT_RULE_DELTA_BUDGET: i64 = 20;

/// One committed configuration; immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigVersion {
    pub version: u64,
    pub spec: EngineConfigSpec,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub parent_version: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub actor: String,
    pub dry_run: bool,
    pub force: bool,
}

impl ApplyOptions {
    pub fn actor<S: AsRef<str>>(actor: S) -> Self {
        Self {
            actor: actor.as_ref().into(),
            ..Self::default()
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Simulator verdict on a candidate configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimImpact {
    pub acceptable: bool,
    pub rule_delta: i64,
}

/// Quantifies the change between the head spec and a candidate. The store
/// respects the verdict unless the caller forces the commit.
pub trait Simulator: Send + Sync {
    fn compare(&self, previous: &EngineConfigSpec, candidate: &EngineConfigSpec) -> SimImpact;
}

/// Default heuristic: reject when the business-rule count grows by more
/// than the configured budget.
#[derive(Debug, Clone)]
pub struct RuleCountSimulator {
    budget: i64,
}

impl Default for RuleCountSimulator {
    fn default() -> Self {
        Self {
            budget: DEFAULT_RULE_DELTA_BUDGET,
        }
    }
}

impl RuleCountSimulator {
    pub fn new(budget: i64) -> Self {
        Self { budget }
    }
}

impl Simulator for RuleCountSimulator {
    fn compare(&self, previous: &EngineConfigSpec, candidate: &EngineConfigSpec) -> SimImpact {
        let rule_delta = rule_count(candidate) as i64 - rule_count(previous) as i64;

        SimImpact {
            acceptable: rule_delta <= self.budget,
            rule_delta,
        }
    }
}

fn rule_count(spec: &EngineConfigSpec) -> usize {
    spec.policies
        .as_ref()
        .and_then(|policies| policies.business_rules.as_ref())
        .map(Vec::len)
        .unwrap_or(0)
}

/// Result of an apply or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// The committed version number; `0` for a dry run.
    pub version: u64,
    pub impact: SimImpact,
}

/// In-memory, serialized configuration store. Concurrent applies are
/// linearized by the log mutex; versions are strictly monotonic from 1.
pub struct ConfigStore {
    versions: Mutex<Vec<ConfigVersion>>,
    simulator: Box<dyn Simulator>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::with_simulator(Box::new(RuleCountSimulator::default()))
    }

    pub fn with_simulator(simulator: Box<dyn Simulator>) -> Self {
        Self {
            versions: Mutex::new(Vec::new()),
            simulator,
        }
    }

    /// The latest committed version, if any.
    pub fn head(&self) -> Option<ConfigVersion> {
        lock_ignoring_poison(&self.versions).last().cloned()
    }

    pub fn version(&self, version: u64) -> Option<ConfigVersion> {
        lock_ignoring_poison(&self.versions)
            .iter()
            .find(|stored| stored.version == version)
            .cloned()
    }

    pub fn history(&self) -> Vec<ConfigVersion> {
        lock_ignoring_poison(&self.versions).clone()
    }

    /// Validates the candidate, consults the simulator against the current
    /// head, and appends a new version unless this is a dry run. An
    /// unacceptable impact fails with `SimulationRejected` unless forced;
    /// dry runs always return with the store untouched and `version = 0`.
    #[tracing::instrument(skip(self, candidate))]
    pub fn apply(&self, candidate: EngineConfigSpec, opts: ApplyOptions) -> Result<ApplyOutcome> {
        candidate.validate()?;

        let mut versions = lock_ignoring_poison(&self.versions);

        let previous = versions
            .last()
            .map(|head| head.spec.clone())
            .unwrap_or_default();
        let impact = self.simulator.compare(&previous, &candidate);

        if !impact.acceptable && !opts.force && !opts.dry_run {
            return Err(Error::SimulationRejected(format!(
                "rule delta {} exceeds the simulator budget",
                impact.rule_delta
            )));
        }

        if opts.dry_run {
            return Ok(ApplyOutcome { version: 0, impact });
        }

        let parent_version = versions.last().map(|head| head.version).unwrap_or(0);
        let version = parent_version + 1;

        versions.push(ConfigVersion {
            version,
            spec: candidate,
            actor: opts.actor,
            timestamp: Utc::now(),
            parent_version,
        });

        tracing::debug!("Committed config {{ version: {version}, parent: {parent_version} }}");

        Ok(ApplyOutcome { version, impact })
    }

    /// Re-commits the spec of `target` as a new head. History is never
    /// mutated; the new version's parent is the head at rollback time.
    #[tracing::instrument(skip(self))]
    pub fn rollback<S: AsRef<str> + std::fmt::Debug>(
        &self,
        target: u64,
        actor: S,
    ) -> Result<ApplyOutcome> {
        let mut versions = lock_ignoring_poison(&self.versions);

        let spec = versions
            .iter()
            .find(|stored| stored.version == target)
            .map(|stored| stored.spec.clone())
            .ok_or_else(|| Error::InvalidInput(format!("unknown config version: {target}")))?;

        let previous = versions
            .last()
            .map(|head| head.spec.clone())
            .unwrap_or_default();
        let impact = self.simulator.compare(&previous, &spec);

        let parent_version = versions.last().map(|head| head.version).unwrap_or(0);
        let version = parent_version + 1;

        versions.push(ConfigVersion {
            version,
            spec,
            actor: actor.as_ref().into(),
            timestamp: Utc::now(),
            parent_version,
        });

        Ok(ApplyOutcome { version, impact })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{PoliciesConfig, PolicyRuleSpec};

    fn spec_with_rules(count: usize) -> EngineConfigSpec {
        let rules = (0..count)
            .map(|index| PolicyRuleSpec {
                id: format!("rule-{index}"),
                ..PolicyRuleSpec::default()
            })
            .collect();

        EngineConfigSpec {
            policies: Some(PoliciesConfig {
                business_rules: Some(rules),
            }),
            ..EngineConfigSpec::default()
        }
    }

    fn concurrency_spec(workers: usize) -> EngineConfigSpec {
        serde_json::from_str(&format!(r#"{{ "global": {{ "max_concurrency": {workers} }} }}"#))
            .unwrap()
    }

    #[test]
    fn versions_are_strictly_monotonic() {
        let store = ConfigStore::new();

        let first = store
            .apply(concurrency_spec(1), ApplyOptions::actor("t"))
            .unwrap();
        let second = store
            .apply(concurrency_spec(2), ApplyOptions::actor("t"))
            .unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(store.head().unwrap().version, 2);
        assert_eq!(store.head().unwrap().parent_version, 1);
    }

    #[test]
    fn oversized_rule_delta_is_rejected_unless_forced() {
        let store = ConfigStore::new();
        let candidate = spec_with_rules(25);

        let rejected = store.apply(candidate.clone(), ApplyOptions::actor("t"));
        assert!(matches!(rejected, Err(Error::SimulationRejected(_))));
        assert!(store.head().is_none());

        let forced = store
            .apply(candidate, ApplyOptions::actor("t").force())
            .unwrap();
        assert_eq!(forced.version, 1);
        assert_eq!(forced.impact.rule_delta, 25);
        assert!(!forced.impact.acceptable);
    }

    #[test]
    fn delta_is_relative_to_the_head() {
        let store = ConfigStore::new();

        store
            .apply(spec_with_rules(15), ApplyOptions::actor("t"))
            .unwrap();
        // 15 → 30 is a delta of 15, within budget.
        let outcome = store
            .apply(spec_with_rules(30), ApplyOptions::actor("t"))
            .unwrap();

        assert_eq!(outcome.impact.rule_delta, 15);
        assert!(outcome.impact.acceptable);
    }

    #[test]
    fn dry_run_leaves_the_store_untouched() {
        let store = ConfigStore::new();
        store
            .apply(concurrency_spec(1), ApplyOptions::actor("t"))
            .unwrap();

        let outcome = store
            .apply(spec_with_rules(25), ApplyOptions::actor("t").dry_run())
            .unwrap();

        assert_eq!(outcome.version, 0);
        assert_eq!(outcome.impact.rule_delta, 25);
        assert_eq!(store.head().unwrap().version, 1);
        assert_eq!(store.history().len(), 1);
    }

    #[test]
    fn invalid_candidate_is_rejected_before_simulation() {
        let store = ConfigStore::new();

        let result = store.apply(concurrency_spec(0), ApplyOptions::actor("t"));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(store.head().is_none());
    }

    #[test]
    fn rollback_appends_a_deep_equal_copy() {
        let store = ConfigStore::new();

        store
            .apply(concurrency_spec(1), ApplyOptions::actor("a"))
            .unwrap();
        store
            .apply(concurrency_spec(2), ApplyOptions::actor("a"))
            .unwrap();

        let outcome = store.rollback(1, "r").unwrap();
        assert_eq!(outcome.version, 3);

        let head = store.head().unwrap();
        assert_eq!(head.spec, store.version(1).unwrap().spec);
        assert_eq!(head.parent_version, 2);
        assert_eq!(head.actor, "r");

        // History keeps the older versions unchanged.
        assert_eq!(store.version(1).unwrap().spec, concurrency_spec(1));
        assert_eq!(store.version(2).unwrap().spec, concurrency_spec(2));
        assert_eq!(store.history().len(), 3);
    }

    #[test]
    fn rollback_to_unknown_version_fails() {
        let store = ConfigStore::new();

        assert!(matches!(
            store.rollback(7, "r"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn custom_simulator_is_consulted() {
        struct RejectAll;

        impl Simulator for RejectAll {
            fn compare(&self, _: &EngineConfigSpec, _: &EngineConfigSpec) -> SimImpact {
                SimImpact {
                    acceptable: false,
                    rule_delta: 0,
                }
            }
        }

        let store = ConfigStore::with_simulator(Box::new(RejectAll));

        assert!(matches!(
            store.apply(concurrency_spec(1), ApplyOptions::actor("t")),
            Err(Error::SimulationRejected(_))
        ));
    }

    #[test]
    fn versions_serialize_with_snake_case_fields() {
        let store = ConfigStore::new();
        store
            .apply(concurrency_spec(4), ApplyOptions::actor("ops"))
            .unwrap();

        let head = store.head().unwrap();
        let json = serde_json::to_value(&head).unwrap();

        assert_eq!(json["version"], 1);
        assert_eq!(json["parent_version"], 0);
        assert_eq!(json["actor"], "ops");
        assert_eq!(json["spec"]["global"]["max_concurrency"], 4);
        assert!(json["timestamp"].is_string());

        let round_tripped: ConfigVersion = serde_json::from_value(json).unwrap();
        assert_eq!(round_tripped, head);
    }
}
