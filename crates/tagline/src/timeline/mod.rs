//! Entities and their append-only tag timelines.
//!
//! A [`TagTimeline`] keeps one ordered stream per tag key. Versions within a
//! stream are strictly increasing in `(timestamp, sequence)`; the only way a
//! stream shrinks is retention pruning from its oldest end.

pub mod filter;
pub mod index;

use crate::error::{Result, TagError};
use crate::tag::{
    validate_key, EntityId, PruneMark, Sequence, TagMutation, TagOp, TagVersion, Timestamp,
};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Key to value mapping of the most recent `Set` version of every key.
pub type CurrentView = BTreeMap<String, String>;

/// Versions of a single key, oldest first.
#[derive(Debug, Clone, Default)]
struct KeyStream {
    versions: VecDeque<TagVersion>,
}

impl KeyStream {
    fn last(&self) -> Option<&TagVersion> {
        self.versions.back()
    }

    /// Index of the first version ordered after `(ts, seq)`.
    fn position_after(&self, ts: Timestamp, seq: Sequence) -> usize {
        self.versions
            .partition_point(|v| v.order_key() <= (ts, seq))
    }

    fn as_of(&self, ts: Timestamp) -> Option<&TagVersion> {
        match self.versions.partition_point(|v| v.timestamp <= ts) {
            0 => None,
            idx => self.versions.get(idx - 1),
        }
    }

    /// Drops versions ordered at or before `(ts, seq)`, never the newest one.
    fn drain_through(&mut self, ts: Timestamp, seq: Sequence) -> Vec<TagVersion> {
        let end = self
            .position_after(ts, seq)
            .min(self.versions.len().saturating_sub(1));
        self.versions.drain(..end).collect()
    }
}

/// Append-only, per-key ordered log of an entity's tag versions.
#[derive(Debug, Clone)]
pub struct TagTimeline {
    streams: BTreeMap<String, KeyStream>,
    next_sequence: Sequence,
    last_write: Timestamp,
}

impl Default for TagTimeline {
    fn default() -> Self {
        Self::starting_at(0)
    }
}

impl TagTimeline {
    /// Creates an empty timeline whose untimed writes are stamped no earlier
    /// than `created_at`.
    pub fn starting_at(created_at: Timestamp) -> Self {
        Self {
            streams: BTreeMap::new(),
            next_sequence: 1,
            last_write: created_at,
        }
    }

    /// Rebuilds a timeline from persisted versions.
    ///
    /// Versions are grouped by key and sorted; counters never move below what
    /// the versions themselves imply.
    pub fn restore(
        versions: Vec<TagVersion>,
        next_sequence: Sequence,
        last_write: Timestamp,
    ) -> Self {
        let mut timeline = Self {
            streams: BTreeMap::new(),
            next_sequence,
            last_write,
        };
        let mut sorted = versions;
        sorted.sort_by_key(TagVersion::order_key);
        timeline.apply(sorted);
        timeline
    }

    /// Validates a batch of mutations and assigns timestamps and sequences.
    ///
    /// Nothing is modified; the returned versions are handed to
    /// [`TagTimeline::apply`] once they are durable. Mutations without a
    /// timestamp take `batch_ts`, or `max(now, last write)` when no batch
    /// timestamp is given.
    ///
    /// # Errors
    ///
    /// The whole batch is rejected with [`TagError::InvalidTimestamp`] if any
    /// timestamp is negative, precedes `created_at`, or is older than the
    /// key's latest version (including earlier mutations of the same batch).
    /// An empty batch or invalid key is [`TagError::InvalidTag`].
    pub fn prepare(
        &self,
        mutations: &[TagMutation],
        batch_ts: Option<Timestamp>,
        now: Timestamp,
        created_at: Timestamp,
    ) -> Result<Vec<TagVersion>> {
        if mutations.is_empty() {
            return Err(TagError::InvalidTag(
                "append requires at least one tag".to_string(),
            ));
        }

        let default_ts = batch_ts.unwrap_or_else(|| now.max(self.last_write));
        let mut pending: HashMap<&str, Timestamp> = HashMap::new();
        let mut sequence = self.next_sequence;
        let mut versions = Vec::with_capacity(mutations.len());

        for mutation in mutations {
            validate_key(&mutation.key)?;
            let key = mutation.key.as_str();
            let ts = mutation.timestamp.unwrap_or(default_ts);

            if ts < 0 {
                return Err(TagError::invalid_timestamp(
                    key,
                    format!("timestamp {} is negative", ts),
                ));
            }
            if ts < created_at {
                return Err(TagError::invalid_timestamp(
                    key,
                    format!("timestamp {} precedes entity creation at {}", ts, created_at),
                ));
            }
            let last = pending
                .get(key)
                .copied()
                .or_else(|| self.latest(key).map(|v| v.timestamp));
            if let Some(last) = last {
                if ts < last {
                    return Err(TagError::invalid_timestamp(
                        key,
                        format!("timestamp {} is older than the latest version at {}", ts, last),
                    ));
                }
            }
            pending.insert(key, ts);

            let value = match mutation.op {
                TagOp::Set => mutation.value.clone(),
                TagOp::Delete => String::new(),
            };
            versions.push(TagVersion {
                timestamp: ts,
                key: mutation.key.clone(),
                value,
                op: mutation.op,
                sequence,
            });
            sequence += 1;
        }

        Ok(versions)
    }

    /// Appends versions produced by [`TagTimeline::prepare`] (or replayed
    /// from the log).
    pub fn apply(&mut self, versions: Vec<TagVersion>) {
        for version in versions {
            self.next_sequence = self.next_sequence.max(version.sequence + 1);
            self.last_write = self.last_write.max(version.timestamp);
            self.streams
                .entry(version.key.clone())
                .or_default()
                .versions
                .push_back(version);
        }
    }

    /// Returns the most recent version of `key`, set or delete.
    pub fn latest(&self, key: &str) -> Option<&TagVersion> {
        self.streams.get(key).and_then(KeyStream::last)
    }

    /// Returns the current value of `key`, or `None` if it was never set or
    /// its latest version is a delete.
    pub fn latest_value(&self, key: &str) -> Option<&str> {
        self.latest(key).and_then(TagVersion::set_value)
    }

    /// Iterates the retained versions of `key`, oldest first.
    pub fn versions_of<'a>(&'a self, key: &str) -> impl DoubleEndedIterator<Item = &'a TagVersion> + 'a {
        self.streams
            .get(key)
            .into_iter()
            .flat_map(|stream| stream.versions.iter())
    }

    /// Returns the last version of `key` with `timestamp <= ts`.
    pub fn version_as_of(&self, key: &str, ts: Timestamp) -> Option<&TagVersion> {
        self.streams.get(key).and_then(|stream| stream.as_of(ts))
    }

    /// Returns the version of `key` with exactly this timestamp and sequence.
    pub fn find(&self, key: &str, ts: Timestamp, seq: Sequence) -> Option<&TagVersion> {
        let stream = self.streams.get(key)?;
        stream
            .versions
            .binary_search_by_key(&(ts, seq), TagVersion::order_key)
            .ok()
            .and_then(|idx| stream.versions.get(idx))
    }

    /// Returns up to `limit` versions of `key` ordered after `after`, within
    /// the inclusive `[from, to]` window.
    pub fn versions_in(
        &self,
        key: &str,
        after: Option<(Timestamp, Sequence)>,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
        limit: usize,
    ) -> Vec<TagVersion> {
        let Some(stream) = self.streams.get(key) else {
            return Vec::new();
        };
        let start = match after {
            Some((ts, seq)) => stream.position_after(ts, seq),
            None => 0,
        };
        stream
            .versions
            .range(start..)
            .skip_while(|v| from.is_some_and(|from| v.timestamp < from))
            .take_while(|v| to.map_or(true, |to| v.timestamp <= to))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Builds the current view from the newest version of each key.
    pub fn current_view(&self) -> CurrentView {
        self.streams
            .iter()
            .filter_map(|(key, stream)| {
                stream
                    .last()
                    .and_then(TagVersion::set_value)
                    .map(|value| (key.clone(), value.to_string()))
            })
            .collect()
    }

    /// Iterates the keys that have at least one retained version.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    /// Iterates every retained version, grouped by key.
    pub fn all_versions(&self) -> impl Iterator<Item = &TagVersion> {
        self.streams.values().flat_map(|stream| stream.versions.iter())
    }

    /// Number of retained versions of `key`.
    pub fn key_version_count(&self, key: &str) -> usize {
        self.streams.get(key).map_or(0, |stream| stream.versions.len())
    }

    /// Number of retained versions across all keys.
    pub fn version_count(&self) -> usize {
        self.streams.values().map(|stream| stream.versions.len()).sum()
    }

    /// Sequence the next appended version will receive.
    pub fn next_sequence(&self) -> Sequence {
        self.next_sequence
    }

    /// Highest timestamp ever appended (or the creation time).
    pub fn last_write(&self) -> Timestamp {
        self.last_write
    }

    /// Applies a retention mark: removes versions of `mark.key` ordered at
    /// or before `mark.through`, keeping the newest. Returns what was removed.
    pub fn prune_through(&mut self, mark: &PruneMark) -> Vec<TagVersion> {
        let (ts, seq) = mark.through;
        self.streams
            .get_mut(&mark.key)
            .map(|stream| stream.drain_through(ts, seq))
            .unwrap_or_default()
    }
}

/// An entity and its timeline.
#[derive(Debug, Clone)]
pub struct Entity {
    /// Immutable id.
    pub id: EntityId,
    /// Dataset the entity belongs to.
    pub dataset: String,
    /// Entity type.
    pub entity_type: String,
    /// Opaque content supplied at creation.
    pub content: Vec<u8>,
    /// Creation timestamp; no version may precede it.
    pub created_at: Timestamp,
    /// Tag versions.
    pub timeline: TagTimeline,
}

impl Entity {
    /// Creates an entity with an empty timeline.
    pub fn new(
        id: EntityId,
        dataset: impl Into<String>,
        entity_type: impl Into<String>,
        content: Vec<u8>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            dataset: dataset.into(),
            entity_type: entity_type.into(),
            content,
            created_at,
            timeline: TagTimeline::starting_at(created_at),
        }
    }
}
