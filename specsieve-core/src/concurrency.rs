//! Thread pools for page extraction and region rendering, and the
//! cross-process file locks that serialize correction writers and
//! regeneration passes.
//!
//! Pages fan out on the page pool with `par_iter`, which keeps input order in
//! the collected results. Region renders run inside a second, smaller pool so
//! the number of live bitmaps never exceeds its size.

use anyhow::{Context, Result};
use fs2::FileExt;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Named pool with at least one thread
pub fn build_pool(threads: usize, name: &'static str) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(move |i| format!("{name}-{i}"))
        .build()
        .with_context(|| format!("Failed to build {name} thread pool"))
}

/// Caps simultaneous bitmap rendering
pub struct RenderPool {
    pool: ThreadPool,
}

impl RenderPool {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            pool: build_pool(capacity, "render")?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run one render job on the pool, blocking the caller until it finishes
    pub fn run<R, F>(&self, job: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(job)
    }
}

/// Exclusive advisory lock on a lock file, held until drop.
///
/// Each acquisition opens its own handle, so two threads of one process
/// exclude each other just like two processes do.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock at `path` is free
    pub fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn par_iter_keeps_input_order() {
        let pool = build_pool(8, "test").unwrap();
        let items: Vec<u64> = (0..50).collect();
        let out: Vec<u64> = pool.install(|| {
            items
                .par_iter()
                .map(|v| {
                    // Later items finish first
                    thread::sleep(Duration::from_micros(50 - *v));
                    v * 2
                })
                .collect()
        });
        assert_eq!(out, (0..50).map(|v| v * 2).collect::<Vec<_>>());
    }

    #[test]
    fn render_pool_caps_concurrency() {
        let pages = build_pool(8, "test").unwrap();
        let renders = RenderPool::new(2).unwrap();
        assert_eq!(renders.capacity(), 2);

        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: Vec<usize> = (0..16).collect();

        pages.install(|| {
            items.par_iter().for_each(|_| {
                renders.run(|| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            });
        });

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn file_lock_excludes_other_handles_until_dropped() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("locks").join("dev-1.lock");

        let held = FileLock::acquire(&path).unwrap();
        assert_eq!(held.path(), path.as_path());
        let other = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        assert!(other.try_lock_exclusive().is_err());

        drop(held);
        assert!(other.try_lock_exclusive().is_ok());
        FileExt::unlock(&other).unwrap();
    }

    #[test]
    fn zero_threads_means_one() {
        assert_eq!(RenderPool::new(0).unwrap().capacity(), 1);
    }
}
