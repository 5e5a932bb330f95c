//! Error types for the jobscript runtime
//!
//! Every error that crosses a module boundary is a [`JobError`]: a category,
//! a stable textual code, a human-readable message, and a metadata bag that
//! downstream consumers can serialize onto the wire. Sentinel conditions
//! (idempotent drop, concurrency limit, quota, oversized scripts) are
//! distinguished by their codes so callers can branch without string matching
//! on messages.

pub mod types;

pub use types::{codes, ErrorCategory, FieldError, JobError};

/// Convenience alias used throughout the crate.
pub type JobResult<T> = std::result::Result<T, JobError>;
