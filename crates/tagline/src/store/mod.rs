//! The sharded tag store.
//!
//! Entities are routed to one of `shard_count` shards by an xxh64 hash of
//! their id. Each shard owns its WAL, checkpoint, timeline index and
//! existence filter, so shards never contend with each other; within a shard
//! writes to the same entity are serialized by the entity's own lock.
//!
//! # Directory layout
//!
//! ```text
//! {dir}/shard_000/wal/segment_0000000000000000.wal
//! {dir}/shard_000/checkpoint.ckpt
//! {dir}/shard_001/...
//! ```

pub mod config;
mod shard;

pub use config::{RetryConfig, StoreConfig};

use crate::error::{Result, TagError};
use crate::lifecycle::{PolicySet, RetentionLimits, RetentionPolicy};
use crate::query::feed::{self, ChangePage, FeedToken};
use crate::query::history::{History, HistoryQuery, VersionSource};
use crate::query::snapshot::{self, KeyDiff};
use crate::query::Cancellation;
use crate::tag::{
    current_timestamp_nanos, EntityId, Sequence, TagMutation, TagVersion, Timestamp,
    VersionHandle,
};
use crate::timeline::{CurrentView, Entity};
use shard::Shard;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Metadata of a live entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    /// Entity id.
    pub id: EntityId,
    /// Dataset the entity belongs to.
    pub dataset: String,
    /// Entity type.
    pub entity_type: String,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Opaque content supplied at creation.
    pub content: Vec<u8>,
    /// Number of keys with at least one retained version.
    pub key_count: usize,
    /// Number of retained versions.
    pub version_count: usize,
    /// Highest timestamp written.
    pub last_write: Timestamp,
}

/// Store-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of shards.
    pub shard_count: usize,
    /// Live entities.
    pub entity_count: usize,
    /// Retained versions across all entities.
    pub version_count: usize,
    /// Non-empty change-feed buckets across all shards.
    pub bucket_count: usize,
    /// Insertions into the existence filters since they were last built.
    pub filter_insertions: usize,
    /// Shards currently refusing writes.
    pub read_only_shards: Vec<usize>,
}

/// Temporal tag store.
///
/// All operations take `&self`; share the store between threads with an
/// [`Arc`].
pub struct TagStore {
    dir: PathBuf,
    config: StoreConfig,
    shards: Vec<Arc<Shard>>,
    policies: RwLock<PolicySet>,
}

impl TagStore {
    /// Opens (or creates) a store in `dir`, recovering every shard from its
    /// checkpoint and WAL.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created or a checkpoint is
    /// damaged.
    pub fn open(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let shard_count = config.shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for id in 0..shard_count {
            let shard_dir = dir.join(format!("shard_{:03}", id));
            shards.push(Arc::new(Shard::open(id, shard_dir, &config)?));
        }

        info!(
            "Opened tag store at {} with {} shards",
            dir.display(),
            shard_count
        );

        Ok(Self {
            dir,
            policies: RwLock::new(config.policies.clone()),
            config,
            shards,
        })
    }

    /// Root directory of the store.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard an entity is routed to.
    pub fn shard_of(&self, entity_id: EntityId) -> usize {
        (entity_id.shard_hash() % self.shards.len() as u64) as usize
    }

    fn shard(&self, entity_id: EntityId) -> &Arc<Shard> {
        &self.shards[self.shard_of(entity_id)]
    }

    fn shard_by_id(&self, shard: usize) -> Result<&Arc<Shard>> {
        self.shards.get(shard).ok_or_else(|| TagError::StorageIo {
            shard,
            reason: format!("no such shard (store has {})", self.shards.len()),
        })
    }

    /// Creates an entity with optional initial tags and returns its id.
    ///
    /// The creation time is now, or the earliest explicit timestamp among the
    /// initial tags if that is earlier.
    ///
    /// # Errors
    ///
    /// [`TagError::InvalidTimestamp`] or [`TagError::InvalidTag`] for a bad
    /// initial tag, [`TagError::StorageIo`] if the shard cannot log the
    /// creation.
    pub fn create_entity(
        &self,
        dataset: impl Into<String>,
        entity_type: impl Into<String>,
        tags: &[TagMutation],
        content: Vec<u8>,
    ) -> Result<EntityId> {
        let entity_id = EntityId::generate();
        let created_at = tags
            .iter()
            .filter_map(|tag| tag.timestamp)
            .fold(current_timestamp_nanos(), Timestamp::min);
        let entity = Entity::new(entity_id, dataset, entity_type, content, created_at);

        let policies = shard::read(&self.policies);
        self.shard(entity_id)
            .create_entity(entity, tags, &policies)?;
        Ok(entity_id)
    }

    /// Atomically appends a batch of tag mutations to an entity.
    ///
    /// Untimed mutations take `timestamp` if given, otherwise the later of
    /// now and the entity's last write. Either every mutation becomes visible
    /// or none does. Retention runs on the touched keys before returning.
    ///
    /// # Errors
    ///
    /// - [`TagError::NotFound`] if the entity does not exist
    /// - [`TagError::InvalidTimestamp`] if a timestamp would reorder a key
    /// - [`TagError::ConcurrentModification`] if the entity stayed locked
    ///   past the retry budget
    /// - [`TagError::StorageIo`] if the shard is or becomes read-only
    pub fn append_tags(
        &self,
        entity_id: EntityId,
        tags: &[TagMutation],
        timestamp: Option<Timestamp>,
    ) -> Result<Vec<VersionHandle>> {
        let policies = shard::read(&self.policies);
        self.shard(entity_id).append_tags(
            entity_id,
            tags,
            timestamp,
            &policies,
            &self.config.retry,
        )
    }

    /// Parses wire tags (`key:value` or `ts|key:value`) and appends them.
    pub fn append_wire_tags<S: AsRef<str>>(
        &self,
        entity_id: EntityId,
        tags: &[S],
    ) -> Result<Vec<VersionHandle>> {
        let mutations = tags
            .iter()
            .map(|tag| TagMutation::parse(tag.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        self.append_tags(entity_id, &mutations, None)
    }

    /// Current value of every key.
    pub fn get_latest(&self, entity_id: EntityId) -> Result<CurrentView> {
        self.shard(entity_id)
            .read_entity(entity_id, |entity| Ok(entity.timeline.current_view()))
    }

    /// Current value of one key.
    pub fn get_tag(&self, entity_id: EntityId, key: &str) -> Result<Option<String>> {
        let shard = self.shard(entity_id);
        if !shard.maybe_contains(entity_id, key)? {
            return Ok(None);
        }
        shard.read_entity(entity_id, |entity| {
            Ok(entity.timeline.latest_value(key).map(str::to_string))
        })
    }

    /// Value of one key as of `ts`.
    ///
    /// # Errors
    ///
    /// [`TagError::NotFound`] if the entity does not exist or `ts` precedes
    /// its creation.
    pub fn get_tag_as_of(
        &self,
        entity_id: EntityId,
        key: &str,
        ts: Timestamp,
    ) -> Result<Option<String>> {
        let shard = self.shard(entity_id);
        let maybe_present = shard.maybe_contains(entity_id, key)?;
        shard.read_entity(entity_id, |entity| {
            if maybe_present {
                snapshot::value_as_of(entity, key, ts)
            } else if ts < entity.created_at {
                Err(TagError::NotFound(entity_id))
            } else {
                Ok(None)
            }
        })
    }

    /// Snapshot of the entity as of `ts`.
    ///
    /// # Errors
    ///
    /// [`TagError::NotFound`] if the entity does not exist or `ts` precedes
    /// its creation; [`TagError::Cancelled`] or
    /// [`TagError::DeadlineExceeded`] if `cancel` fires.
    pub fn get_as_of(
        &self,
        entity_id: EntityId,
        ts: Timestamp,
        cancel: &Cancellation,
    ) -> Result<CurrentView> {
        cancel.check()?;
        self.shard(entity_id)
            .read_entity(entity_id, |entity| snapshot::as_of(entity, ts, cancel))
    }

    /// Lazy stream of an entity's raw versions.
    ///
    /// # Errors
    ///
    /// [`TagError::NotFound`] if the entity does not exist when called. If it
    /// is deleted while the stream is consumed, the next page fetch yields
    /// `NotFound`.
    pub fn get_history(
        &self,
        entity_id: EntityId,
        query: HistoryQuery,
        cancel: Cancellation,
    ) -> Result<History<ShardVersions>> {
        let shard = Arc::clone(self.shard(entity_id));
        shard.read_entity(entity_id, |_| Ok(()))?;
        Ok(History::new(
            ShardVersions { shard },
            entity_id,
            query,
            self.config.history_page_size,
            cancel,
        ))
    }

    /// Keys whose value as of `t1` differs from their value as of `t2`.
    pub fn get_diff(
        &self,
        entity_id: EntityId,
        t1: Timestamp,
        t2: Timestamp,
        cancel: &Cancellation,
    ) -> Result<Vec<KeyDiff>> {
        cancel.check()?;
        let shard = self.shard(entity_id);
        shard.read_entity(entity_id, |entity| {
            let state = shard.read_state();
            snapshot::diff(entity, &state.index, t1, t2, cancel)
        })
    }

    /// Up to `limit` changes at or after `since`, continuing after `token`.
    ///
    /// Changes come back ordered by `(timestamp, entity id, sequence)`.
    /// Passing the returned `next_token` fetches the following page; passing
    /// the same token again returns the same page.
    pub fn get_changes_since(
        &self,
        since: Timestamp,
        limit: usize,
        token: Option<FeedToken>,
        cancel: &Cancellation,
    ) -> Result<ChangePage> {
        let lower = feed::lower_bound(since, token);
        let mut pages = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            cancel.check()?;
            pages.push(shard.changes(lower, limit, cancel)?);
        }
        Ok(feed::merge_pages(pages, limit, token))
    }

    /// Deletes an entity, its timeline and its index entries.
    pub fn delete_entity(&self, entity_id: EntityId) -> Result<()> {
        self.shard(entity_id)
            .delete_entity(entity_id, &self.config.retry)
    }

    /// Metadata of a live entity.
    pub fn get_entity(&self, entity_id: EntityId) -> Result<EntityInfo> {
        self.shard(entity_id).read_entity(entity_id, |entity| {
            Ok(EntityInfo {
                id: entity.id,
                dataset: entity.dataset.clone(),
                entity_type: entity.entity_type.clone(),
                created_at: entity.created_at,
                content: entity.content.clone(),
                key_count: entity.timeline.keys().count(),
                version_count: entity.timeline.version_count(),
                last_write: entity.timeline.last_write(),
            })
        })
    }

    /// Replaces the policy for the policy's selector and returns the limits
    /// it replaced. Applies to subsequent writes.
    ///
    /// The policy itself lives in memory only. Versions it prunes stay pruned
    /// across a reopen, since each write logs its own prune marks.
    pub fn update_policy(&self, policy: RetentionPolicy) -> Option<RetentionLimits> {
        info!("Updating retention policy {:?}", policy.selector);
        shard::write(&self.policies).insert(policy)
    }

    /// The current retention policies.
    pub fn policies(&self) -> PolicySet {
        shard::read(&self.policies).clone()
    }

    /// Checkpoints every writable shard and truncates their WAL.
    ///
    /// # Errors
    ///
    /// Every shard is attempted; the first failure is returned.
    pub fn checkpoint(&self) -> Result<()> {
        let mut first_error = None;
        for shard in &self.shards {
            if let Err(err) = shard.checkpoint() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Rebuilds every shard's existence filter from live data, clearing
    /// bits left by deleted entities. Returns the number of pairs inserted.
    pub fn rebuild_filters(&self) -> usize {
        self.shards.iter().map(|shard| shard.rebuild_filter()).sum()
    }

    /// Returns true if the shard refuses writes after a storage failure.
    pub fn is_read_only(&self, shard: usize) -> bool {
        self.shards
            .get(shard)
            .is_some_and(|shard| shard.is_read_only())
    }

    /// Operator action: gives a read-only shard a fresh WAL, makes it
    /// writable and checkpoints it.
    pub fn reopen_shard(&self, shard: usize) -> Result<()> {
        let shard = self.shard_by_id(shard)?;
        info!(
            "Reopening shard {} at {}",
            shard.id(),
            shard.dir().display()
        );
        shard.reopen()
    }

    /// Store-wide counters.
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            shard_count: self.shards.len(),
            ..StoreStats::default()
        };
        for shard in &self.shards {
            let shard_stats = shard.stats();
            stats.entity_count += shard_stats.entities;
            stats.version_count += shard_stats.versions;
            stats.bucket_count += shard_stats.buckets;
            stats.filter_insertions += shard_stats.filter_insertions;
            if shard.is_read_only() {
                stats.read_only_shards.push(shard.id());
            }
        }
        stats
    }
}

/// [`VersionSource`] reading an entity's versions from its shard.
pub struct ShardVersions {
    shard: Arc<Shard>,
}

impl VersionSource for ShardVersions {
    fn page(
        &self,
        entity_id: EntityId,
        query: &HistoryQuery,
        after: Option<(Timestamp, Sequence)>,
        limit: usize,
    ) -> Result<Vec<TagVersion>> {
        self.shard.read_entity(entity_id, |entity| {
            if let Some(key) = &query.key {
                return Ok(entity
                    .timeline
                    .versions_in(key, after, query.from, query.to, limit));
            }
            let state = self.shard.read_state();
            Ok(state
                .index
                .entity_versions(entity_id, after, query.from, query.to, limit)
                .into_iter()
                .filter_map(|(ts, seq, key)| entity.timeline.find(&key, ts, seq).cloned())
                .collect())
        })
    }
}
