//! Lazy, paged iteration over an entity's raw version stream.

use crate::error::Result;
use crate::query::Cancellation;
use crate::tag::{EntityId, Sequence, TagVersion, Timestamp};
use std::collections::VecDeque;

/// Filters for a history scan. All bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Restrict to one key.
    pub key: Option<String>,
    /// Earliest timestamp returned.
    pub from: Option<Timestamp>,
    /// Latest timestamp returned.
    pub to: Option<Timestamp>,
}

impl HistoryQuery {
    /// Every version of every key.
    pub fn all() -> Self {
        Self::default()
    }

    /// Every version of one key.
    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Sets the earliest timestamp.
    pub fn since(mut self, ts: Timestamp) -> Self {
        self.from = Some(ts);
        self
    }

    /// Sets the latest timestamp.
    pub fn until(mut self, ts: Timestamp) -> Self {
        self.to = Some(ts);
        self
    }
}

/// Supplies pages of versions to a [`History`].
pub trait VersionSource {
    /// Returns up to `limit` versions matching `query`, ordered by
    /// `(timestamp, sequence)` and strictly after `after`.
    fn page(
        &self,
        entity_id: EntityId,
        query: &HistoryQuery,
        after: Option<(Timestamp, Sequence)>,
        limit: usize,
    ) -> Result<Vec<TagVersion>>;
}

/// Finite, restartable iterator over an entity's versions in increasing
/// `(timestamp, sequence)` order.
///
/// Versions are fetched a page at a time, so the stream reflects appends and
/// prunes that happen while it is consumed. Iteration stops after the first
/// error.
pub struct History<S> {
    source: S,
    entity_id: EntityId,
    query: HistoryQuery,
    page_size: usize,
    cancel: Cancellation,
    cursor: Option<(Timestamp, Sequence)>,
    buffer: VecDeque<TagVersion>,
    exhausted: bool,
    failed: bool,
}

impl<S: VersionSource> History<S> {
    /// Creates a history positioned before the first version.
    pub fn new(
        source: S,
        entity_id: EntityId,
        query: HistoryQuery,
        page_size: usize,
        cancel: Cancellation,
    ) -> Self {
        Self {
            source,
            entity_id,
            query,
            page_size: page_size.max(1),
            cancel,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            failed: false,
        }
    }

    /// Rewinds to the first version.
    pub fn restart(&mut self) {
        self.resume_from(None);
    }

    /// Continues after `cursor`, as returned by [`History::cursor`].
    pub fn resume_from(&mut self, cursor: Option<(Timestamp, Sequence)>) {
        self.cursor = cursor;
        self.buffer.clear();
        self.exhausted = false;
        self.failed = false;
    }

    /// Order key of the last version yielded.
    pub fn cursor(&self) -> Option<(Timestamp, Sequence)> {
        self.cursor
    }

    /// The query being iterated.
    pub fn query(&self) -> &HistoryQuery {
        &self.query
    }

    fn fill(&mut self) -> Result<()> {
        self.cancel.check()?;
        let after = self.buffer.back().map(TagVersion::order_key).or(self.cursor);
        let page = self
            .source
            .page(self.entity_id, &self.query, after, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<S: VersionSource> Iterator for History<S> {
    type Item = Result<TagVersion>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.failed = true;
                return Some(Err(err));
            }
        }
        let version = self.buffer.pop_front()?;
        self.cursor = Some(version.order_key());
        Some(Ok(version))
    }
}
