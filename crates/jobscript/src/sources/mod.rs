//! Script source providers
//!
//! A [`SourceProvider`] enumerates and fetches script artifacts. Two
//! concrete providers ship with the runtime: a filesystem walker and a
//! database table reader. Providers hold no cross-call state; concurrent
//! fetches are safe.

mod db;
mod fs;

pub use db::{DbSourceProvider, PlaceholderStyle};
pub use fs::FileSystemSourceProvider;

use async_trait::async_trait;

use crate::context::ExecContext;
use crate::errors::JobResult;
use crate::model::ScriptInfo;

/// Contract shared by every script source.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Fetch one script's raw bytes by path.
    async fn get_script(&self, path: &str) -> JobResult<Vec<u8>>;

    /// Enumerate all available scripts, honoring cancellation between
    /// items.
    async fn list_scripts(&self, ctx: &ExecContext) -> JobResult<Vec<ScriptInfo>>;
}
