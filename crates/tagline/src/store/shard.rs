//! One shard of the store: the entities routed to it, their index and
//! existence filter, and the WAL that makes their mutations durable.
//!
//! # Locking
//!
//! Locks are always taken in this order, never the reverse:
//!
//! ```text
//! gate → entity → wal → state
//! ```
//!
//! Writers hold `gate` shared for the whole mutation. Checkpoints and filter
//! rebuilds hold it exclusively, which waits out in-flight writes without
//! blocking readers. Readers take `state` only long enough to clone an
//! entity handle, then lock the entity itself.

use crate::checkpoint;
use crate::error::{Result, TagError};
use crate::lifecycle::{PolicySet, RetentionEvaluator};
use crate::query::Cancellation;
use crate::store::config::{RetryConfig, StoreConfig};
use crate::tag::{
    current_timestamp_nanos, EntityId, PruneMark, TagMutation, TagVersion, Timestamp,
    VersionHandle,
};
use crate::timeline::filter::ExistenceFilter;
use crate::timeline::index::{Change, FeedKey, TimelineIndex};
use crate::timeline::{Entity, TagTimeline};
use crate::wal::{Wal, WalConfig, WalRecord};
use std::collections::HashMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::thread;
use tracing::{debug, error, info, warn};

/// WAL directory name inside a shard directory.
const WAL_DIR: &str = "wal";

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|err| err.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|err| err.into_inner())
}

/// An entity behind its exclusive write section.
pub(crate) struct EntitySlot {
    pub(crate) entity: Entity,
    /// Set once the entity is deleted; handles cloned before the delete must
    /// not observe it.
    pub(crate) retired: bool,
}

pub(crate) type EntityCell = Mutex<EntitySlot>;

fn new_cell(entity: Entity) -> Arc<EntityCell> {
    Arc::new(Mutex::new(EntitySlot {
        entity,
        retired: false,
    }))
}

/// Shared, shard-wide structures.
pub(crate) struct ShardState {
    pub(crate) entities: HashMap<EntityId, Arc<EntityCell>>,
    pub(crate) index: TimelineIndex,
    pub(crate) filter: ExistenceFilter,
}

impl ShardState {
    fn new(bucket_width: i64, filter_capacity: usize) -> Self {
        Self {
            entities: HashMap::new(),
            index: TimelineIndex::new(bucket_width),
            filter: ExistenceFilter::new(filter_capacity),
        }
    }

    /// Makes an applied write visible to the index and filter.
    fn publish(&mut self, entity_id: EntityId, inserted: &[TagVersion], pruned: &[TagVersion]) {
        for version in inserted {
            self.index.insert(entity_id, version);
            self.filter.insert(&entity_id, &version.key);
        }
        for version in pruned {
            self.index.remove(entity_id, version);
        }
    }

    /// Applies one logged record during recovery. Retention is replayed from
    /// the record's marks, never re-evaluated.
    fn replay(&mut self, record: WalRecord) {
        match record {
            WalRecord::CreateEntity {
                lsn,
                entity_id,
                dataset,
                entity_type,
                created_at,
                content,
                versions,
                pruned,
            } => {
                if self.entities.contains_key(&entity_id) {
                    warn!("WAL lsn {} recreates existing entity {}; skipped", lsn, entity_id);
                    return;
                }
                let mut entity = Entity::new(entity_id, dataset, entity_type, content, created_at);
                let removed = apply_to_timeline(&mut entity, versions.clone(), &pruned);
                self.publish(entity_id, &versions, &removed);
                self.entities.insert(entity_id, new_cell(entity));
            }
            WalRecord::AppendTags {
                lsn,
                entity_id,
                versions,
                pruned,
            } => {
                let Some(cell) = self.entities.get(&entity_id).cloned() else {
                    warn!("WAL lsn {} appends to unknown entity {}; skipped", lsn, entity_id);
                    return;
                };
                let mut slot = lock(&cell);
                let removed = apply_to_timeline(&mut slot.entity, versions.clone(), &pruned);
                self.publish(entity_id, &versions, &removed);
            }
            WalRecord::DeleteEntity { entity_id, .. } => {
                self.entities.remove(&entity_id);
                self.index.remove_entity(entity_id);
            }
        }
    }
}

/// Decides the retention marks a write of `versions` triggers under the
/// entity's current policy.
fn plan_retention(
    entity: &Entity,
    versions: &[TagVersion],
    policies: &PolicySet,
    now: Timestamp,
) -> Vec<PruneMark> {
    RetentionEvaluator::for_entity(policies, entity, now)
        .map(|evaluator| evaluator.plan(&entity.timeline, versions))
        .unwrap_or_default()
}

/// Appends versions to the entity's timeline, then applies the marks logged
/// with them. Returns the pruned versions.
fn apply_to_timeline(
    entity: &mut Entity,
    versions: Vec<TagVersion>,
    marks: &[PruneMark],
) -> Vec<TagVersion> {
    entity.timeline.apply(versions);
    marks
        .iter()
        .flat_map(|mark| entity.timeline.prune_through(mark))
        .collect()
}

/// Counters reported by [`Shard::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ShardStats {
    pub(crate) entities: usize,
    pub(crate) versions: usize,
    pub(crate) buckets: usize,
    pub(crate) filter_insertions: usize,
}

pub(crate) struct Shard {
    id: usize,
    dir: PathBuf,
    wal_config: WalConfig,
    filter_capacity: usize,
    gate: RwLock<()>,
    wal: Mutex<Wal>,
    state: RwLock<ShardState>,
    read_only: AtomicBool,
}

impl Shard {
    /// Opens a shard directory: loads its checkpoint, replays newer WAL
    /// records, then starts a fresh WAL segment.
    pub(crate) fn open(id: usize, dir: PathBuf, config: &StoreConfig) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut state = ShardState::new(config.bucket_width_nanos(), config.filter_capacity);

        let mut covered_lsn = 0;
        if let Some(image) = checkpoint::load(&checkpoint::checkpoint_path(&dir))? {
            covered_lsn = image.lsn;
            for entity in image.entities {
                let versions: Vec<TagVersion> = entity.timeline.all_versions().cloned().collect();
                state.publish(entity.id, &versions, &[]);
                state.entities.insert(entity.id, new_cell(entity));
            }
        }

        let wal_dir = dir.join(WAL_DIR);
        let mut last_lsn = covered_lsn;
        let mut replayed = 0usize;
        for record in Wal::recover(&wal_dir)? {
            if record.lsn() <= covered_lsn {
                continue;
            }
            last_lsn = last_lsn.max(record.lsn());
            state.replay(record);
            replayed += 1;
        }

        let mut wal = Wal::new(&wal_dir, config.wal.clone())?;
        wal.advance_lsn(last_lsn);

        info!(
            "Opened shard {} with {} entities (checkpoint lsn {}, {} WAL records replayed)",
            id,
            state.entities.len(),
            covered_lsn,
            replayed
        );

        Ok(Self {
            id,
            dir,
            wal_config: config.wal.clone(),
            filter_capacity: config.filter_capacity,
            gate: RwLock::new(()),
            wal: Mutex::new(wal),
            state: RwLock::new(state),
            read_only: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(TagError::StorageIo {
                shard: self.id,
                reason: "shard is read-only".to_string(),
            });
        }
        Ok(())
    }

    /// Switches the shard to read-only and converts `err` for the caller.
    fn fail(&self, context: &str, err: TagError) -> TagError {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            error!(
                "Shard {} is now read-only after {} failure: {}",
                self.id, context, err
            );
        }
        TagError::StorageIo {
            shard: self.id,
            reason: format!("{}: {}", context, err),
        }
    }

    /// Durably logs one record.
    fn log(&self, record: WalRecord) -> Result<u64> {
        let mut wal = lock(&self.wal);
        let lsn = wal
            .append(record)
            .map_err(|err| self.fail("WAL append", err))?;
        wal.sync().map_err(|err| self.fail("WAL sync", err))?;
        Ok(lsn)
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, ShardState> {
        read(&self.state)
    }

    fn cell(&self, entity_id: EntityId) -> Result<Arc<EntityCell>> {
        read(&self.state)
            .entities
            .get(&entity_id)
            .cloned()
            .ok_or(TagError::NotFound(entity_id))
    }

    fn cells(&self) -> Vec<Arc<EntityCell>> {
        read(&self.state).entities.values().cloned().collect()
    }

    /// Acquires an entity's write section with bounded exponential backoff.
    fn lock_for_write<'a>(
        &self,
        cell: &'a EntityCell,
        entity_id: EntityId,
        retry: &RetryConfig,
    ) -> Result<MutexGuard<'a, EntitySlot>> {
        let attempts = retry.max_attempts.max(1);
        for attempt in 0..attempts {
            match cell.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(err)) => return Ok(err.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if attempt + 1 < attempts {
                        thread::sleep(retry.backoff(attempt));
                    }
                }
            }
        }
        debug!(
            "Gave up locking entity {} after {} attempts",
            entity_id, attempts
        );
        Err(TagError::ConcurrentModification {
            entity_id,
            attempts,
        })
    }

    /// Runs `f` on a live entity under its lock.
    pub(crate) fn read_entity<R>(
        &self,
        entity_id: EntityId,
        f: impl FnOnce(&Entity) -> Result<R>,
    ) -> Result<R> {
        let cell = self.cell(entity_id)?;
        let slot = lock(&cell);
        if slot.retired {
            return Err(TagError::NotFound(entity_id));
        }
        f(&slot.entity)
    }

    /// Existence filter lookup. Fails if the entity does not exist.
    pub(crate) fn maybe_contains(&self, entity_id: EntityId, key: &str) -> Result<bool> {
        let state = read(&self.state);
        if !state.entities.contains_key(&entity_id) {
            return Err(TagError::NotFound(entity_id));
        }
        Ok(state.filter.maybe_contains(&entity_id, key))
    }

    pub(crate) fn create_entity(
        &self,
        mut entity: Entity,
        mutations: &[TagMutation],
        policies: &PolicySet,
    ) -> Result<()> {
        let _gate = read(&self.gate);
        self.ensure_writable()?;

        let now = current_timestamp_nanos();
        let entity_id = entity.id;
        let versions = if mutations.is_empty() {
            Vec::new()
        } else {
            entity
                .timeline
                .prepare(mutations, None, now, entity.created_at)?
        };

        let marks = plan_retention(&entity, &versions, policies, now);

        self.log(
            WalRecord::create_entity(
                entity_id,
                entity.dataset.clone(),
                entity.entity_type.clone(),
                entity.created_at,
                entity.content.clone(),
                versions.clone(),
            )
            .with_pruned(marks.clone()),
        )?;

        let pruned = apply_to_timeline(&mut entity, versions.clone(), &marks);
        let mut state = write(&self.state);
        state.publish(entity_id, &versions, &pruned);
        state.entities.insert(entity_id, new_cell(entity));
        Ok(())
    }

    pub(crate) fn append_tags(
        &self,
        entity_id: EntityId,
        mutations: &[TagMutation],
        batch_ts: Option<Timestamp>,
        policies: &PolicySet,
        retry: &RetryConfig,
    ) -> Result<Vec<VersionHandle>> {
        let _gate = read(&self.gate);
        self.ensure_writable()?;

        let cell = self.cell(entity_id)?;
        let mut slot = self.lock_for_write(&cell, entity_id, retry)?;
        if slot.retired {
            return Err(TagError::NotFound(entity_id));
        }

        let now = current_timestamp_nanos();
        let versions =
            slot.entity
                .timeline
                .prepare(mutations, batch_ts, now, slot.entity.created_at)?;

        let marks = plan_retention(&slot.entity, &versions, policies, now);

        self.log(WalRecord::append_tags(entity_id, versions.clone()).with_pruned(marks.clone()))?;

        let handles = versions
            .iter()
            .map(|version| VersionHandle::new(entity_id, version))
            .collect();
        let pruned = apply_to_timeline(&mut slot.entity, versions.clone(), &marks);
        write(&self.state).publish(entity_id, &versions, &pruned);
        Ok(handles)
    }

    pub(crate) fn delete_entity(&self, entity_id: EntityId, retry: &RetryConfig) -> Result<()> {
        let _gate = read(&self.gate);
        self.ensure_writable()?;

        let cell = self.cell(entity_id)?;
        let mut slot = self.lock_for_write(&cell, entity_id, retry)?;
        if slot.retired {
            return Err(TagError::NotFound(entity_id));
        }

        self.log(WalRecord::delete_entity(entity_id, current_timestamp_nanos()))?;

        slot.retired = true;
        slot.entity.timeline = TagTimeline::default();
        let mut state = write(&self.state);
        state.entities.remove(&entity_id);
        let removed = state.index.remove_entity(entity_id);
        debug!(
            "Deleted entity {} from shard {} ({} index entries)",
            entity_id, self.id, removed
        );
        Ok(())
    }

    pub(crate) fn changes(
        &self,
        lower: Bound<FeedKey>,
        limit: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<Change>> {
        read(&self.state).index.changes_after(lower, limit, cancel)
    }

    /// Writes a checkpoint of every live entity and truncates the WAL
    /// segments it covers. Returns the covered LSN.
    pub(crate) fn checkpoint(&self) -> Result<u64> {
        let _gate = write(&self.gate);
        self.ensure_writable()?;

        let mut wal = lock(&self.wal);
        wal.sync().map_err(|err| self.fail("WAL sync", err))?;
        let lsn = wal.current_lsn().saturating_sub(1);

        let entities: Vec<Entity> = self
            .cells()
            .iter()
            .filter_map(|cell| {
                let slot = lock(cell);
                (!slot.retired).then(|| slot.entity.clone())
            })
            .collect();

        checkpoint::write(&checkpoint::checkpoint_path(&self.dir), lsn, &entities)
            .map_err(|err| self.fail("checkpoint write", err))?;
        wal.rotate().map_err(|err| self.fail("WAL rotate", err))?;
        let removed = wal
            .truncate(lsn)
            .map_err(|err| self.fail("WAL truncate", err))?;

        debug!(
            "Shard {} checkpointed at lsn {}; removed {} WAL segments",
            self.id, lsn, removed
        );
        Ok(lsn)
    }

    /// Recreates the existence filter from live data. Returns the number of
    /// `(entity, key)` pairs inserted.
    pub(crate) fn rebuild_filter(&self) -> usize {
        let _gate = write(&self.gate);

        let mut pairs = Vec::new();
        for cell in self.cells() {
            let slot = lock(&cell);
            if slot.retired {
                continue;
            }
            pairs.extend(
                slot.entity
                    .timeline
                    .keys()
                    .map(|key| (slot.entity.id, key.to_string())),
            );
        }

        let mut filter = ExistenceFilter::new(pairs.len().max(self.filter_capacity));
        for (entity_id, key) in &pairs {
            filter.insert(entity_id, key);
        }
        write(&self.state).filter = filter;

        debug!("Rebuilt filter of shard {} with {} pairs", self.id, pairs.len());
        pairs.len()
    }

    /// Replaces the WAL of a read-only shard, makes the shard writable again
    /// and checkpoints the in-memory state so it is durable under the new log.
    pub(crate) fn reopen(&self) -> Result<()> {
        {
            let _gate = write(&self.gate);
            let mut wal = lock(&self.wal);
            let last_lsn = wal.current_lsn().saturating_sub(1);

            let mut fresh = Wal::new(self.dir.join(WAL_DIR), self.wal_config.clone())?;
            fresh.advance_lsn(last_lsn);
            *wal = fresh;

            self.read_only.store(false, Ordering::Release);
            info!("Shard {} reopened at lsn {}", self.id, last_lsn + 1);
        }
        self.checkpoint().map(|_| ())
    }

    pub(crate) fn stats(&self) -> ShardStats {
        let state = read(&self.state);
        ShardStats {
            entities: state.entities.len(),
            versions: state.index.len(),
            buckets: state.index.bucket_count(),
            filter_insertions: state.filter.len(),
        }
    }
}
