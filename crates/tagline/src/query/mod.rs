//! Read-side query executors: as-of snapshots, history, diff and the change
//! feed.
//!
//! Every scan accepts a [`Cancellation`] and checks it per scanned item, so a
//! caller can abandon a long read without leaving shared state half-updated.
//! Reads never touch the WAL.

pub mod feed;
pub mod history;
pub mod snapshot;

use crate::error::{Result, TagError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline and/or cancel flag observed by read operations.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    deadline: Option<Instant>,
    flag: Option<Arc<AtomicBool>>,
}

impl Cancellation {
    /// A signal that never fires.
    pub fn none() -> Self {
        Self::default()
    }

    /// Fires once `timeout` has elapsed from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            flag: None,
        }
    }

    /// A signal that fires when [`Cancellation::cancel`] is called on it or
    /// any of its clones.
    pub fn cancellable() -> Self {
        Self {
            deadline: None,
            flag: Some(Arc::new(AtomicBool::new(false))),
        }
    }

    /// Adds a deadline to an existing signal.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Requests cancellation. No effect on signals built without a flag.
    pub fn cancel(&self) {
        if let Some(flag) = &self.flag {
            flag.store(true, Ordering::Release);
        }
    }

    /// Returns true once the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// Fails with [`TagError::Cancelled`] or [`TagError::DeadlineExceeded`]
    /// once the signal has fired.
    pub fn check(&self) -> Result<()> {
        if self
            .flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
        {
            return Err(TagError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(TagError::DeadlineExceeded);
        }
        Ok(())
    }
}
