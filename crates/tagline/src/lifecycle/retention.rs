//! Retention policies and the inline evaluator that enforces them.
//!
//! Retention is planned with every append, scoped to the keys the append
//! touched. The resulting [`PruneMark`]s travel in the append's WAL record, so
//! recovery replays exactly the prunes that happened live, whatever policies
//! are configured at restart. There is no background sweep.

use crate::error::{Result, TagError};
use crate::tag::{PruneMark, TagVersion, Timestamp};
use crate::timeline::{Entity, TagTimeline};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

/// Entity type of the built-in metric policy.
pub const METRIC_TYPE: &str = "metric";

/// Entity type of the built-in session policy.
pub const SESSION_TYPE: &str = "session";

const HOUR_NANOS: i64 = 3_600 * 1_000_000_000;

/// Which entities a policy applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PolicySelector {
    /// Every entity of this type.
    EntityType(String),
    /// Every entity in this dataset.
    Dataset(String),
}

/// Per-key limits applied by a policy. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionLimits {
    /// Maximum number of versions kept per key; zero behaves like one.
    pub max_versions_per_key: Option<usize>,
    /// Versions older than `now - max_age_nanos` are dropped, except the
    /// newest version of the key.
    pub max_age_nanos: Option<i64>,
}

impl RetentionLimits {
    /// Keeps everything.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Caps the number of versions per key.
    pub fn with_max_versions(mut self, max_versions: usize) -> Self {
        self.max_versions_per_key = Some(max_versions);
        self
    }

    /// Caps the age of versions.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_nanos = Some(i64::try_from(max_age.as_nanos()).unwrap_or(i64::MAX));
        self
    }

    /// Returns true if no limit is set.
    pub fn is_unlimited(&self) -> bool {
        self.max_versions_per_key.is_none() && self.max_age_nanos.is_none()
    }
}

/// A selector and the limits it applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Entities the policy applies to.
    pub selector: PolicySelector,
    /// Limits applied to every key of those entities.
    pub limits: RetentionLimits,
}

impl RetentionPolicy {
    /// Policy for all entities of `entity_type`.
    pub fn for_type(entity_type: impl Into<String>, limits: RetentionLimits) -> Self {
        Self {
            selector: PolicySelector::EntityType(entity_type.into()),
            limits,
        }
    }

    /// Policy for all entities in `dataset`.
    pub fn for_dataset(dataset: impl Into<String>, limits: RetentionLimits) -> Self {
        Self {
            selector: PolicySelector::Dataset(dataset.into()),
            limits,
        }
    }
}

/// The configured policies of a store.
///
/// Resolution order is entity type, then dataset, then the unlimited default,
/// so exactly one policy applies to any entity.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    by_type: HashMap<String, RetentionLimits>,
    by_dataset: HashMap<String, RetentionLimits>,
}

impl PolicySet {
    /// An empty set; every entity is unlimited.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults carried over from the original deployment: `metric` keeps
    /// 1000 versions for 24 hours, `session` keeps 50 versions for 7 days.
    pub fn builtin() -> Self {
        Self::new()
            .with_policy(RetentionPolicy {
                selector: PolicySelector::EntityType(METRIC_TYPE.to_string()),
                limits: RetentionLimits {
                    max_versions_per_key: Some(1000),
                    max_age_nanos: Some(24 * HOUR_NANOS),
                },
            })
            .with_policy(RetentionPolicy {
                selector: PolicySelector::EntityType(SESSION_TYPE.to_string()),
                limits: RetentionLimits {
                    max_versions_per_key: Some(50),
                    max_age_nanos: Some(7 * 24 * HOUR_NANOS),
                },
            })
    }

    /// Adds a policy, replacing any policy with the same selector.
    pub fn with_policy(mut self, policy: RetentionPolicy) -> Self {
        self.insert(policy);
        self
    }

    /// Adds a policy and returns the limits it replaced.
    pub fn insert(&mut self, policy: RetentionPolicy) -> Option<RetentionLimits> {
        match policy.selector {
            PolicySelector::EntityType(entity_type) => {
                self.by_type.insert(entity_type, policy.limits)
            }
            PolicySelector::Dataset(dataset) => self.by_dataset.insert(dataset, policy.limits),
        }
    }

    /// Removes the policy for `selector`.
    pub fn remove(&mut self, selector: &PolicySelector) -> Option<RetentionLimits> {
        match selector {
            PolicySelector::EntityType(entity_type) => self.by_type.remove(entity_type),
            PolicySelector::Dataset(dataset) => self.by_dataset.remove(dataset),
        }
    }

    /// Resolves the limits for an entity.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::RetentionViolation`] when the entity has neither a
    /// dataset nor a type to select a policy by.
    pub fn resolve(&self, dataset: &str, entity_type: &str) -> Result<RetentionLimits> {
        if dataset.is_empty() && entity_type.is_empty() {
            return Err(TagError::RetentionViolation(
                "entity has no dataset or type to select a policy".to_string(),
            ));
        }
        Ok(self
            .by_type
            .get(entity_type)
            .or_else(|| self.by_dataset.get(dataset))
            .copied()
            .unwrap_or_default())
    }

    /// All configured policies.
    pub fn policies(&self) -> Vec<RetentionPolicy> {
        let types = self
            .by_type
            .iter()
            .map(|(t, limits)| RetentionPolicy::for_type(t.clone(), *limits));
        let datasets = self
            .by_dataset
            .iter()
            .map(|(d, limits)| RetentionPolicy::for_dataset(d.clone(), *limits));
        types.chain(datasets).collect()
    }

    /// Number of configured policies.
    pub fn len(&self) -> usize {
        self.by_type.len() + self.by_dataset.len()
    }

    /// Returns true if no policy is configured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies one entity's limits to the keys touched by a write.
#[derive(Debug, Clone, Copy)]
pub struct RetentionEvaluator {
    limits: RetentionLimits,
    now: Timestamp,
}

impl RetentionEvaluator {
    /// Creates an evaluator for the given limits at time `now`.
    pub fn new(limits: RetentionLimits, now: Timestamp) -> Self {
        Self { limits, now }
    }

    /// Resolves the policy for `entity`.
    ///
    /// A failed lookup is logged and yields `None`: the write proceeds
    /// without pruning.
    pub fn for_entity(policies: &PolicySet, entity: &Entity, now: Timestamp) -> Option<Self> {
        match policies.resolve(&entity.dataset, &entity.entity_type) {
            Ok(limits) => Some(Self::new(limits, now)),
            Err(err) => {
                warn!("Skipping retention for entity {}: {}", entity.id, err);
                None
            }
        }
    }

    /// Decides what to prune once `incoming` lands on `timeline`.
    ///
    /// Only keys present in `incoming` are examined. The count limit drops
    /// the oldest versions first, then the age limit drops versions older
    /// than `now - max_age`. The newest version of a key always survives.
    /// Nothing is modified; the marks are logged with the write and then
    /// applied with [`TagTimeline::prune_through`].
    pub fn plan(&self, timeline: &TagTimeline, incoming: &[TagVersion]) -> Vec<PruneMark> {
        if self.limits.is_unlimited() {
            return Vec::new();
        }

        let cutoff = self
            .limits
            .max_age_nanos
            .map(|max_age| self.now.saturating_sub(max_age));
        let touched: BTreeSet<&str> = incoming.iter().map(|v| v.key.as_str()).collect();
        let examined = touched.len();

        let mut marks = Vec::new();
        for key in touched {
            let added = incoming.iter().filter(|v| v.key == key);
            let total = timeline.key_version_count(key) + added.clone().count();
            let over_count = self
                .limits
                .max_versions_per_key
                .map_or(0, |max| total.saturating_sub(max.max(1)));

            let mut through = None;
            for (position, version) in timeline.versions_of(key).chain(added).enumerate() {
                let expired = cutoff.is_some_and(|cutoff| version.timestamp < cutoff);
                if position + 1 >= total || (position >= over_count && !expired) {
                    break;
                }
                through = Some(version.order_key());
            }

            if let Some(through) = through {
                marks.push(PruneMark {
                    key: key.to_string(),
                    through,
                });
            }
        }

        if !marks.is_empty() {
            debug!("Retention pruning {} of {} touched keys", marks.len(), examined);
        }
        marks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagMutation;

    fn timeline_with(key: &str, timestamps: &[i64]) -> TagTimeline {
        let mut timeline = TagTimeline::default();
        for &ts in timestamps {
            let versions = timeline
                .prepare(&[TagMutation::set(key, ts.to_string()).at(ts)], None, 0, 0)
                .unwrap();
            timeline.apply(versions);
        }
        timeline
    }

    /// Plans and applies retention for one more write of `key` at `ts`.
    fn write_and_prune(
        timeline: &mut TagTimeline,
        evaluator: &RetentionEvaluator,
        key: &str,
        ts: i64,
    ) -> Vec<TagVersion> {
        let versions = timeline
            .prepare(&[TagMutation::set(key, ts.to_string()).at(ts)], None, 0, 0)
            .unwrap();
        let marks = evaluator.plan(timeline, &versions);
        timeline.apply(versions);
        marks.iter().flat_map(|mark| timeline.prune_through(mark)).collect()
    }

    fn timestamps(timeline: &TagTimeline, key: &str) -> Vec<i64> {
        timeline.versions_of(key).map(|v| v.timestamp).collect()
    }

    #[test]
    fn test_resolution_precedence() {
        let policies = PolicySet::new()
            .with_policy(RetentionPolicy::for_type(
                "metric",
                RetentionLimits::unlimited().with_max_versions(10),
            ))
            .with_policy(RetentionPolicy::for_dataset(
                "telemetry",
                RetentionLimits::unlimited().with_max_versions(20),
            ));

        let by_type = policies.resolve("telemetry", "metric").unwrap();
        assert_eq!(by_type.max_versions_per_key, Some(10));

        let by_dataset = policies.resolve("telemetry", "sensor").unwrap();
        assert_eq!(by_dataset.max_versions_per_key, Some(20));

        let default = policies.resolve("other", "sensor").unwrap();
        assert!(default.is_unlimited());

        assert!(matches!(
            policies.resolve("", ""),
            Err(TagError::RetentionViolation(_))
        ));
    }

    #[test]
    fn test_insert_replaces_same_selector() {
        let mut policies = PolicySet::builtin();
        assert_eq!(policies.len(), 2);

        let previous = policies.insert(RetentionPolicy::for_type(
            METRIC_TYPE,
            RetentionLimits::unlimited().with_max_versions(5),
        ));
        assert_eq!(previous.and_then(|l| l.max_versions_per_key), Some(1000));
        assert_eq!(policies.len(), 2);
        assert_eq!(
            policies.resolve("", METRIC_TYPE).unwrap().max_versions_per_key,
            Some(5)
        );

        policies.remove(&PolicySelector::EntityType(SESSION_TYPE.to_string()));
        assert_eq!(policies.policies().len(), 1);
    }

    #[test]
    fn test_count_limit_keeps_newest() {
        let mut timeline = timeline_with("value", &[1, 2, 3, 4]);
        let evaluator = RetentionEvaluator::new(RetentionLimits::unlimited().with_max_versions(2), 0);

        let pruned = write_and_prune(&mut timeline, &evaluator, "value", 5);
        assert_eq!(pruned.iter().map(|v| v.timestamp).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(timestamps(&timeline, "value"), vec![4, 5]);
    }

    #[test]
    fn test_plan_does_not_modify() {
        let timeline = timeline_with("value", &[1, 2, 3]);
        let evaluator = RetentionEvaluator::new(RetentionLimits::unlimited().with_max_versions(1), 0);
        let incoming = timeline
            .prepare(&[TagMutation::set("value", "4").at(4)], None, 0, 0)
            .unwrap();

        let marks = evaluator.plan(&timeline, &incoming);
        assert_eq!(
            marks,
            vec![PruneMark {
                key: "value".to_string(),
                through: (3, 3),
            }]
        );
        assert_eq!(timeline.key_version_count("value"), 3);
    }

    #[test]
    fn test_plan_reaches_into_incoming_batch() {
        let timeline = timeline_with("value", &[1]);
        let evaluator = RetentionEvaluator::new(RetentionLimits::unlimited().with_max_versions(1), 0);
        let incoming = timeline
            .prepare(
                &[
                    TagMutation::set("value", "2").at(2),
                    TagMutation::set("value", "3").at(3),
                ],
                None,
                0,
                0,
            )
            .unwrap();

        let marks = evaluator.plan(&timeline, &incoming);
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].through, incoming[0].order_key());

        let mut timeline = timeline;
        timeline.apply(incoming);
        timeline.prune_through(&marks[0]);
        assert_eq!(timestamps(&timeline, "value"), vec![3]);
    }

    #[test]
    fn test_zero_max_versions_keeps_latest() {
        let mut timeline = timeline_with("value", &[1, 2]);
        let evaluator = RetentionEvaluator::new(RetentionLimits::unlimited().with_max_versions(0), 0);

        write_and_prune(&mut timeline, &evaluator, "value", 3);
        assert_eq!(timeline.key_version_count("value"), 1);
        assert_eq!(timeline.latest_value("value"), Some("3"));
    }

    #[test]
    fn test_age_limit_never_drops_latest() {
        let limits = RetentionLimits {
            max_versions_per_key: None,
            max_age_nanos: Some(5),
        };

        // Everything is older than now - max_age.
        let mut timeline = timeline_with("value", &[10, 20]);
        let pruned =
            write_and_prune(&mut timeline, &RetentionEvaluator::new(limits, 1_000), "value", 30);
        assert_eq!(pruned.len(), 2);
        assert_eq!(timeline.latest_value("value"), Some("30"));

        let mut timeline = timeline_with("value", &[10, 20]);
        write_and_prune(&mut timeline, &RetentionEvaluator::new(limits, 30), "value", 30);
        assert_eq!(timestamps(&timeline, "value"), vec![30]);

        let mut timeline = timeline_with("value", &[10, 20]);
        write_and_prune(&mut timeline, &RetentionEvaluator::new(limits, 25), "value", 30);
        assert_eq!(timestamps(&timeline, "value"), vec![20, 30]);
    }

    #[test]
    fn test_untouched_keys_are_not_pruned() {
        let mut timeline = timeline_with("a", &[1, 2, 3]);
        let evaluator = RetentionEvaluator::new(RetentionLimits::unlimited().with_max_versions(1), 0);

        let pruned = write_and_prune(&mut timeline, &evaluator, "b", 4);
        assert!(pruned.is_empty());
        assert_eq!(timeline.key_version_count("a"), 3);
    }

    #[test]
    fn test_unlimited_plans_nothing() {
        let timeline = timeline_with("value", &[1, 2, 3]);
        let incoming = timeline
            .prepare(&[TagMutation::set("value", "4").at(4)], None, 0, 0)
            .unwrap();
        let evaluator = RetentionEvaluator::new(RetentionLimits::unlimited(), i64::MAX);
        assert!(evaluator.plan(&timeline, &incoming).is_empty());
    }

    #[test]
    fn test_for_entity_fails_open() {
        let entity = Entity::new(crate::tag::EntityId::generate(), "", "", Vec::new(), 0);
        assert!(RetentionEvaluator::for_entity(&PolicySet::builtin(), &entity, 0).is_none());

        let entity = Entity::new(crate::tag::EntityId::generate(), "", METRIC_TYPE, Vec::new(), 0);
        assert!(RetentionEvaluator::for_entity(&PolicySet::builtin(), &entity, 0).is_some());
    }
}
