//! Tagline - Alopex Temporal Tag Store
//!
//! This crate provides the storage engine behind a temporal entity store: every
//! entity carries an append-only timeline of timestamped tag versions, and
//! retention limits are enforced inline on the write path instead of by a
//! background sweep.
//!
//! # Components
//!
//! - [`Wal`]: Durable, CRC-protected write-ahead log of mutations
//! - [`TagTimeline`]: Per-entity ordered log of tag versions
//! - [`RetentionEvaluator`]: Inline pruning of the keys touched by a write
//! - [`TimelineIndex`]: Per-entity ordered index plus time-bucketed change index
//! - [`ExistenceFilter`]: Bloom filter short-circuiting lookups of unknown keys
//! - [`TagStore`]: Sharded engine exposing as-of, history, diff and change feed queries
//!
//! # Write path
//!
//! ```text
//! AppendTags → entity lock → WAL append + sync → timeline append → prune touched keys → index + filter
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_tagline::{StoreConfig, TagMutation, TagStore};
//!
//! let store = TagStore::open("/var/lib/tagline", StoreConfig::default())?;
//! let id = store.create_entity("metrics", "sensor", &[TagMutation::parse("unit:celsius")?], Vec::new())?;
//!
//! store.append_tags(id, &[TagMutation::set("value", "21.5")], None)?;
//! let view = store.get_latest(id)?;
//! assert_eq!(view.get("value").map(String::as_str), Some("21.5"));
//! ```

#![deny(missing_docs)]

mod codec;

pub mod checkpoint;
pub mod error;
pub mod lifecycle;
pub mod query;
pub mod store;
pub mod tag;
pub mod timeline;
pub mod wal;

pub use error::{Result, TagError};
pub use lifecycle::retention::{
    PolicySelector, PolicySet, RetentionEvaluator, RetentionLimits, RetentionPolicy,
};
pub use query::feed::{ChangePage, FeedToken};
pub use query::history::{History, HistoryQuery, VersionSource};
pub use query::snapshot::KeyDiff;
pub use query::Cancellation;
pub use store::{EntityInfo, RetryConfig, ShardVersions, StoreConfig, StoreStats, TagStore};
pub use tag::{
    EntityId, PruneMark, Sequence, TagMutation, TagOp, TagVersion, Timestamp, VersionHandle,
};
pub use timeline::filter::ExistenceFilter;
pub use timeline::index::{Change, FeedKey, TimelineIndex};
pub use timeline::{CurrentView, Entity, TagTimeline};
pub use wal::{SyncMode, Wal, WalConfig, WalRecord};
