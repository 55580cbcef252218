//! Lifecycle management: retention policies enforced inline on writes.

pub mod retention;

pub use retention::{PolicySelector, PolicySet, RetentionEvaluator, RetentionLimits, RetentionPolicy};
