//! Per-shard timeline index.
//!
//! Two structures are kept in step with the timelines of a shard:
//!
//! - an ordered per-entity index `(timestamp, sequence) -> key`, used for
//!   time-ordered history across keys and for finding the keys a diff has to
//!   compare;
//! - a time-bucketed change index `bucket -> FeedKey -> Change`, used by the
//!   change feed to start scanning at the bucket containing `since` instead
//!   of visiting every entity.
//!
//! Both are updated in the same critical section as the timeline append and
//! the retention prune that follows it.
//!
//! Neither structure answers per-key lookups. A `(key, timestamp)` point or
//! range query is served by the entity's [`TagTimeline`](crate::timeline::TagTimeline),
//! whose per-key streams are ordered by `(timestamp, sequence)`.

use crate::error::Result;
use crate::query::Cancellation;
use crate::tag::{EntityId, Sequence, TagVersion, Timestamp};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

/// Position of a change in the global feed order.
///
/// Ordered by timestamp, then entity id, then sequence, which is a total order
/// across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeedKey {
    /// Timestamp of the version.
    pub timestamp: Timestamp,
    /// Entity that changed.
    pub entity_id: EntityId,
    /// Per-entity sequence of the version.
    pub sequence: Sequence,
}

impl FeedKey {
    /// The smallest key at `timestamp`.
    pub fn lowest_at(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            entity_id: EntityId::MIN,
            sequence: 0,
        }
    }
}

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Entity that changed.
    pub entity_id: EntityId,
    /// Tag key.
    pub key: String,
    /// New value, or `None` for a delete.
    pub value: Option<String>,
    /// Timestamp of the version.
    pub timestamp: Timestamp,
    /// Per-entity sequence of the version.
    pub sequence: Sequence,
}

impl Change {
    fn from_version(entity_id: EntityId, version: &TagVersion) -> Self {
        Self {
            entity_id,
            key: version.key.clone(),
            value: version.set_value().map(str::to_string),
            timestamp: version.timestamp,
            sequence: version.sequence,
        }
    }

    /// Position of this change in the feed.
    pub fn feed_key(&self) -> FeedKey {
        FeedKey {
            timestamp: self.timestamp,
            entity_id: self.entity_id,
            sequence: self.sequence,
        }
    }
}

/// Ordered and time-bucketed index over the retained versions of a shard.
#[derive(Debug)]
pub struct TimelineIndex {
    bucket_width: i64,
    entities: HashMap<EntityId, BTreeMap<(Timestamp, Sequence), String>>,
    buckets: BTreeMap<i64, BTreeMap<FeedKey, Change>>,
    len: usize,
}

impl TimelineIndex {
    /// Creates an empty index with buckets `bucket_width` nanoseconds wide.
    pub fn new(bucket_width: i64) -> Self {
        Self {
            bucket_width: bucket_width.max(1),
            entities: HashMap::new(),
            buckets: BTreeMap::new(),
            len: 0,
        }
    }

    /// Bucket containing `ts`.
    pub fn bucket_of(&self, ts: Timestamp) -> i64 {
        ts.div_euclid(self.bucket_width)
    }

    /// Bucket width in nanoseconds.
    pub fn bucket_width(&self) -> i64 {
        self.bucket_width
    }

    /// Indexes a newly appended version.
    pub fn insert(&mut self, entity_id: EntityId, version: &TagVersion) {
        let previous = self
            .entities
            .entry(entity_id)
            .or_default()
            .insert(version.order_key(), version.key.clone());
        if previous.is_none() {
            self.len += 1;
        }

        let change = Change::from_version(entity_id, version);
        self.buckets
            .entry(self.bucket_of(version.timestamp))
            .or_default()
            .insert(change.feed_key(), change);
    }

    /// Drops a pruned version.
    pub fn remove(&mut self, entity_id: EntityId, version: &TagVersion) {
        if let Some(versions) = self.entities.get_mut(&entity_id) {
            if versions.remove(&version.order_key()).is_some() {
                self.len -= 1;
            }
            if versions.is_empty() {
                self.entities.remove(&entity_id);
            }
        }

        let feed_key = FeedKey {
            timestamp: version.timestamp,
            entity_id,
            sequence: version.sequence,
        };
        self.remove_feed_entry(feed_key);
    }

    /// Drops every entry of a deleted entity. Returns the number removed.
    pub fn remove_entity(&mut self, entity_id: EntityId) -> usize {
        let Some(versions) = self.entities.remove(&entity_id) else {
            return 0;
        };
        for &(timestamp, sequence) in versions.keys() {
            self.remove_feed_entry(FeedKey {
                timestamp,
                entity_id,
                sequence,
            });
        }
        self.len -= versions.len();
        versions.len()
    }

    fn remove_feed_entry(&mut self, feed_key: FeedKey) {
        let bucket_id = self.bucket_of(feed_key.timestamp);
        if let Some(bucket) = self.buckets.get_mut(&bucket_id) {
            bucket.remove(&feed_key);
            if bucket.is_empty() {
                self.buckets.remove(&bucket_id);
            }
        }
    }

    /// Returns up to `limit` `(timestamp, sequence, key)` entries of one
    /// entity in time order, strictly after `after` and within the inclusive
    /// `[from, to]` window.
    pub fn entity_versions(
        &self,
        entity_id: EntityId,
        after: Option<(Timestamp, Sequence)>,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
        limit: usize,
    ) -> Vec<(Timestamp, Sequence, String)> {
        let Some(versions) = self.entities.get(&entity_id) else {
            return Vec::new();
        };

        let lower = match (after, from) {
            (Some(after), Some(from)) if after >= (from, 0) => Bound::Excluded(after),
            (_, Some(from)) => Bound::Included((from, 0)),
            (Some(after), None) => Bound::Excluded(after),
            (None, None) => Bound::Unbounded,
        };
        let upper = match to {
            Some(to) => Bound::Included((to, Sequence::MAX)),
            None => Bound::Unbounded,
        };
        if is_inverted(&lower, &upper) {
            return Vec::new();
        }

        versions
            .range((lower, upper))
            .take(limit)
            .map(|(&(ts, seq), key)| (ts, seq, key.clone()))
            .collect()
    }

    /// Keys of `entity_id` with a retained version in `(lo, hi]`.
    pub fn keys_changed_between(
        &self,
        entity_id: EntityId,
        lo: Timestamp,
        hi: Timestamp,
    ) -> BTreeSet<String> {
        if lo >= hi {
            return BTreeSet::new();
        }
        let Some(versions) = self.entities.get(&entity_id) else {
            return BTreeSet::new();
        };
        versions
            .range((
                Bound::Excluded((lo, Sequence::MAX)),
                Bound::Included((hi, Sequence::MAX)),
            ))
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Returns up to `limit` changes ordered by [`FeedKey`], starting at
    /// `lower`.
    ///
    /// The scan begins at the bucket containing the lower bound's timestamp.
    ///
    /// # Errors
    ///
    /// Fails if `cancel` fires mid-scan; nothing is modified.
    pub fn changes_after(
        &self,
        lower: Bound<FeedKey>,
        limit: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<Change>> {
        let mut changes = Vec::new();
        if limit == 0 {
            return Ok(changes);
        }

        let start_bucket = match &lower {
            Bound::Included(key) | Bound::Excluded(key) => self.bucket_of(key.timestamp),
            Bound::Unbounded => i64::MIN,
        };

        for bucket in self.buckets.range(start_bucket..).map(|(_, bucket)| bucket) {
            for change in bucket.range((lower, Bound::Unbounded)).map(|(_, c)| c) {
                cancel.check()?;
                changes.push(change.clone());
                if changes.len() >= limit {
                    return Ok(changes);
                }
            }
        }

        Ok(changes)
    }

    /// Number of indexed versions.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of non-empty time buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of entities with at least one indexed version.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

/// True when `(lower, upper)` would make `BTreeMap::range` panic or can
/// contain nothing.
fn is_inverted<T: Ord>(lower: &Bound<T>, upper: &Bound<T>) -> bool {
    match (lower, upper) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
        (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
        (Bound::Included(lo), Bound::Excluded(hi))
        | (Bound::Excluded(lo), Bound::Included(hi))
        | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagOp;

    const HOUR: i64 = 3_600_000_000_000;

    fn set(key: &str, value: &str, timestamp: i64, sequence: u64) -> TagVersion {
        TagVersion {
            timestamp,
            key: key.to_string(),
            value: value.to_string(),
            op: TagOp::Set,
            sequence,
        }
    }

    #[test]
    fn test_bucket_of_negative_timestamps() {
        let index = TimelineIndex::new(10);
        assert_eq!(index.bucket_of(0), 0);
        assert_eq!(index.bucket_of(9), 0);
        assert_eq!(index.bucket_of(10), 1);
        assert_eq!(index.bucket_of(-1), -1);
        assert_eq!(index.bucket_width(), 10);

        // Zero-width buckets are widened to one nanosecond.
        let index = TimelineIndex::new(0);
        assert_eq!(index.bucket_width(), 1);
        assert_eq!(index.bucket_of(7), 7);
    }

    #[test]
    fn test_changes_ordered_across_buckets_and_entities() {
        let mut index = TimelineIndex::new(HOUR);
        let a = EntityId::from_bytes([1; 16]);
        let b = EntityId::from_bytes([2; 16]);

        index.insert(b, &set("x", "1", 2 * HOUR + 5, 1));
        index.insert(a, &set("y", "1", 5, 1));
        index.insert(a, &set("y", "2", 2 * HOUR + 5, 2));
        index.insert(b, &set("x", "2", HOUR, 2));

        let changes = index
            .changes_after(Bound::Unbounded, 10, &Cancellation::none())
            .unwrap();
        let keys: Vec<FeedKey> = changes.iter().map(Change::feed_key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[2].entity_id, a); // same timestamp, smaller id first

        let since = index
            .changes_after(Bound::Included(FeedKey::lowest_at(HOUR)), 10, &Cancellation::none())
            .unwrap();
        assert_eq!(since.len(), 3);

        let after_first = index
            .changes_after(Bound::Excluded(since[0].feed_key()), 1, &Cancellation::none())
            .unwrap();
        assert_eq!(after_first, vec![since[1].clone()]);
    }

    #[test]
    fn test_remove_drops_empty_buckets() {
        let mut index = TimelineIndex::new(HOUR);
        let id = EntityId::generate();
        let old = set("v", "1", 0, 1);
        let new = set("v", "2", 3 * HOUR, 2);
        index.insert(id, &old);
        index.insert(id, &new);
        assert_eq!(index.bucket_count(), 2);

        index.remove(id, &old);
        assert_eq!(index.bucket_count(), 1);
        assert_eq!(index.len(), 1);

        assert_eq!(index.remove_entity(id), 1);
        assert!(index.is_empty());
        assert_eq!(index.bucket_count(), 0);
        assert_eq!(index.entity_count(), 0);
    }

    #[test]
    fn test_entity_versions_window() {
        let mut index = TimelineIndex::new(HOUR);
        let id = EntityId::generate();
        for i in 1..=6u64 {
            let key = if i % 2 == 0 { "even" } else { "odd" };
            index.insert(id, &set(key, "x", i as i64 * 10, i));
        }

        let all = index.entity_versions(id, None, None, None, 100);
        assert_eq!(all.len(), 6);

        let window = index.entity_versions(id, None, Some(20), Some(40), 100);
        assert_eq!(window.iter().map(|e| e.0).collect::<Vec<_>>(), vec![20, 30, 40]);

        let resumed = index.entity_versions(id, Some((30, 3)), Some(20), Some(40), 100);
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].2, "even");

        // Cursor past the window and an inverted window must not panic.
        assert!(index.entity_versions(id, Some((40, 4)), None, Some(40), 100).is_empty());
        assert!(index.entity_versions(id, None, Some(50), Some(10), 100).is_empty());
    }

    #[test]
    fn test_keys_changed_between() {
        let mut index = TimelineIndex::new(HOUR);
        let id = EntityId::generate();
        index.insert(id, &set("a", "1", 10, 1));
        index.insert(id, &set("b", "1", 20, 2));
        index.insert(id, &set("c", "1", 30, 3));

        let keys = index.keys_changed_between(id, 10, 20);
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["b".to_string()]);
        assert!(index.keys_changed_between(id, 20, 20).is_empty());
        assert!(index.keys_changed_between(id, 30, 10).is_empty());
    }

    #[test]
    fn test_cancelled_scan() {
        let mut index = TimelineIndex::new(HOUR);
        index.insert(EntityId::generate(), &set("a", "1", 10, 1));

        let cancel = Cancellation::cancellable();
        cancel.cancel();
        assert!(index.changes_after(Bound::Unbounded, 10, &cancel).is_err());
    }
}
