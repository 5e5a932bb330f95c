//! Filesystem source provider
//!
//! Walks a directory tree, streaming each regular file in fixed-size chunks
//! with an optional per-file size ceiling. Ignore rules (globs and exact
//! relative paths) prune matching directories and skip matching files. The
//! walk checks cancellation before every file read and yields cooperatively
//! between files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use glob::Pattern;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::context::ExecContext;
use crate::errors::{codes, JobError, JobResult};
use crate::model::ScriptInfo;

use super::SourceProvider;

const READ_CHUNK_BYTES: usize = 32 * 1024;

/// Discovers scripts under a root directory.
pub struct FileSystemSourceProvider {
    root: PathBuf,
    max_file_size: u64,
    ignore_globs: Vec<Pattern>,
    ignore_paths: Vec<PathBuf>,
    // Open/close accounting: the walk must never leak a handle, success or
    // failure. Exposed for tests.
    opens: AtomicU64,
    closes: AtomicU64,
}

impl FileSystemSourceProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_file_size: 0,
            ignore_globs: Vec::new(),
            ignore_paths: Vec::new(),
            opens: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        }
    }

    /// Per-script size ceiling in bytes; zero disables the check.
    pub fn with_max_file_size(mut self, limit: u64) -> Self {
        self.max_file_size = limit;
        self
    }

    /// Skip files or directories matching any glob pattern. Patterns match
    /// against walk-relative paths with `/` separators.
    pub fn with_ignore_globs<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let raw = pattern.as_ref();
            if raw.is_empty() {
                continue;
            }
            match Pattern::new(raw) {
                Ok(compiled) => self.ignore_globs.push(compiled),
                Err(e) => warn!(pattern = raw, error = %e, "ignoring invalid glob pattern"),
            }
        }
        self
    }

    /// Skip exact relative paths (files or directories) during discovery.
    pub fn with_ignore_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for path in paths {
            let raw = path.as_ref();
            if raw.is_empty() {
                continue;
            }
            self.ignore_paths.push(clean_relative(Path::new(raw)));
        }
        self
    }

    /// Outstanding file handles: opens minus closes. Zero after any
    /// completed walk.
    pub fn open_handle_balance(&self) -> u64 {
        self.opens.load(Ordering::SeqCst) - self.closes.load(Ordering::SeqCst)
    }

    fn should_ignore(&self, relative: &Path) -> bool {
        let slash_path = to_slash(relative);
        if self
            .ignore_globs
            .iter()
            .any(|pattern| pattern.matches(&slash_path))
        {
            return true;
        }
        let cleaned = clean_relative(relative);
        self.ignore_paths.iter().any(|p| *p == cleaned)
    }

    /// Resolve a caller-supplied path against the root. Accepts both
    /// root-joined paths (as published in [`ScriptInfo`]) and root-relative
    /// ones.
    fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if let Ok(stripped) = candidate.strip_prefix(&self.root) {
            return self.root.join(stripped);
        }
        if candidate.is_absolute() {
            return candidate.to_path_buf();
        }
        self.root.join(candidate)
    }

    async fn read_file(&self, ctx: &ExecContext, path: &Path) -> JobResult<Vec<u8>> {
        ctx.check()?;

        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            JobError::external(
                codes::SCRIPT_READ_ERROR,
                format!("failed to read file {}", path.display()),
            )
            .with_source(e)
        })?;
        self.opens.fetch_add(1, Ordering::SeqCst);

        let result = self.read_chunks(ctx, path, &mut file).await;

        // Dropping the handle closes it on every exit path.
        drop(file);
        self.closes.fetch_add(1, Ordering::SeqCst);

        result
    }

    async fn read_chunks(
        &self,
        ctx: &ExecContext,
        path: &Path,
        file: &mut tokio::fs::File,
    ) -> JobResult<Vec<u8>> {
        let display = path.display().to_string();

        let mut initial = 0usize;
        if let Ok(meta) = file.metadata().await {
            let size = meta.len();
            if self.max_file_size > 0 && size > self.max_file_size {
                return Err(JobError::script_too_large(&display, size, self.max_file_size));
            }
            initial = usize::try_from(size).unwrap_or(0);
        }

        let mut buf = Vec::with_capacity(initial);
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        let mut total: u64 = 0;

        loop {
            ctx.check()?;

            let n = file.read(&mut chunk).await.map_err(|e| {
                JobError::external(
                    codes::SCRIPT_READ_ERROR,
                    format!("failed to read file {display}"),
                )
                .with_source(e)
            })?;
            if n == 0 {
                break;
            }

            total += n as u64;
            if self.max_file_size > 0 && total > self.max_file_size {
                return Err(JobError::script_too_large(
                    &display,
                    total,
                    self.max_file_size,
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        Ok(buf)
    }
}

#[async_trait]
impl SourceProvider for FileSystemSourceProvider {
    async fn get_script(&self, path: &str) -> JobResult<Vec<u8>> {
        let resolved = self.resolve(path);
        self.read_file(&ExecContext::background(), &resolved).await
    }

    async fn list_scripts(&self, ctx: &ExecContext) -> JobResult<Vec<ScriptInfo>> {
        let mut scripts = Vec::new();
        // Depth-first, lexically ordered walk; ignored directories are
        // pruned rather than descended into.
        let mut pending: Vec<PathBuf> = vec![PathBuf::new()];

        while let Some(relative_dir) = pending.pop() {
            ctx.check()?;

            let absolute_dir = self.root.join(&relative_dir);
            let mut reader = tokio::fs::read_dir(&absolute_dir).await.map_err(|e| {
                JobError::external(
                    codes::SCRIPT_READ_ERROR,
                    format!("failed to read directory {}", absolute_dir.display()),
                )
                .with_source(e)
            })?;

            let mut entries = Vec::new();
            while let Some(entry) = reader.next_entry().await.map_err(|e| {
                JobError::external(
                    codes::SCRIPT_READ_ERROR,
                    format!("failed to read directory {}", absolute_dir.display()),
                )
                .with_source(e)
            })? {
                entries.push(entry);
            }
            entries.sort_by_key(|e| e.file_name());

            let mut subdirs = Vec::new();
            for entry in entries {
                ctx.check()?;

                let relative = relative_dir.join(entry.file_name());
                let file_type = entry.file_type().await.map_err(|e| {
                    JobError::external(
                        codes::SCRIPT_READ_ERROR,
                        format!("failed to stat {}", entry.path().display()),
                    )
                    .with_source(e)
                })?;

                if self.should_ignore(&relative) {
                    debug!(path = %relative.display(), "ignoring entry");
                    continue;
                }

                if file_type.is_dir() {
                    subdirs.push(relative);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let content = self.read_file(ctx, &entry.path()).await?;
                let id = entry.file_name().to_string_lossy().into_owned();
                scripts.push(ScriptInfo {
                    id,
                    path: self.root.join(&relative).to_string_lossy().into_owned(),
                    content,
                });

                // Yield between files so long walks stay cooperative.
                tokio::task::yield_now().await;
            }

            // Push in reverse so lexically-first directories walk first.
            for dir in subdirs.into_iter().rev() {
                pending.push(dir);
            }
        }

        ctx.check()?;
        Ok(scripts)
    }
}

fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/")
}

fn clean_relative(path: &Path) -> PathBuf {
    path.components().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, FileSystemSourceProvider) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.sh"), "echo a").unwrap();
        fs::write(dir.path().join("b.js"), "console.log('b')").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/c.sql"), "SELECT 1;").unwrap();
        fs::create_dir(dir.path().join("skipme")).unwrap();
        fs::write(dir.path().join("skipme/d.sh"), "echo d").unwrap();
        let provider = FileSystemSourceProvider::new(dir.path());
        (dir, provider)
    }

    #[tokio::test]
    async fn lists_scripts_recursively() {
        let (_dir, provider) = fixture();
        let scripts = provider
            .list_scripts(&ExecContext::background())
            .await
            .unwrap();

        let ids: Vec<&str> = scripts.iter().map(|s| s.id.as_str()).collect();
        assert!(ids.contains(&"a.sh"));
        assert!(ids.contains(&"b.js"));
        assert!(ids.contains(&"c.sql"));
        assert!(ids.contains(&"d.sh"));
    }

    #[tokio::test]
    async fn get_script_accepts_published_paths() {
        let (_dir, provider) = fixture();
        let scripts = provider
            .list_scripts(&ExecContext::background())
            .await
            .unwrap();
        let a = scripts.iter().find(|s| s.id == "a.sh").unwrap();

        let content = provider.get_script(&a.path).await.unwrap();
        assert_eq!(content, b"echo a");

        // Root-relative paths work too.
        let content = provider.get_script("a.sh").await.unwrap();
        assert_eq!(content, b"echo a");
    }

    #[tokio::test]
    async fn ignore_globs_skip_files_and_prune_directories() {
        let (dir, _) = fixture();
        let provider = FileSystemSourceProvider::new(dir.path())
            .with_ignore_globs(["*.js", "skipme"]);

        let scripts = provider
            .list_scripts(&ExecContext::background())
            .await
            .unwrap();
        let ids: Vec<&str> = scripts.iter().map(|s| s.id.as_str()).collect();
        assert!(ids.contains(&"a.sh"));
        assert!(!ids.contains(&"b.js"));
        assert!(!ids.contains(&"d.sh"), "pruned directory was descended");
    }

    #[tokio::test]
    async fn ignore_paths_skip_exact_entries() {
        let (dir, _) = fixture();
        let provider =
            FileSystemSourceProvider::new(dir.path()).with_ignore_paths(["nested/c.sql"]);

        let scripts = provider
            .list_scripts(&ExecContext::background())
            .await
            .unwrap();
        assert!(!scripts.iter().any(|s| s.id == "c.sql"));
    }

    #[tokio::test]
    async fn oversized_script_fails_the_walk() {
        let (dir, _) = fixture();
        fs::write(dir.path().join("huge.sh"), vec![b'x'; 4096]).unwrap();
        let provider = FileSystemSourceProvider::new(dir.path()).with_max_file_size(1024);

        let err = provider
            .list_scripts(&ExecContext::background())
            .await
            .unwrap_err();
        assert!(err.is_script_too_large());
        // No handle leaked on the failure path.
        assert_eq!(provider.open_handle_balance(), 0);
    }

    #[tokio::test]
    async fn handles_are_balanced_after_walks() {
        let (_dir, provider) = fixture();
        provider
            .list_scripts(&ExecContext::background())
            .await
            .unwrap();
        assert_eq!(provider.open_handle_balance(), 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_walk() {
        let (_dir, provider) = fixture();
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let ctx = ExecContext::with_token(token);

        let err = provider.list_scripts(&ctx).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let (_dir, provider) = fixture();
        let err = provider.get_script("does-not-exist.sh").await.unwrap_err();
        assert_eq!(err.code, codes::SCRIPT_READ_ERROR);
    }
}
