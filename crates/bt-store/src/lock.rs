//! Whole-store mutual exclusion.
//!
//! Across processes the lock is a marker file created with `create_new`;
//! waiters poll for it to disappear. Within a process the lock is reentrant:
//! a thread already holding it may acquire it again, and the marker is only
//! removed when the outermost guard drops.

use std::cell::Cell;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use bt_types::{StoreError, TuneError, TuneResult};
use chrono::{DateTime, Utc};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Waiting and recovery policy for the store lock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub poll_interval: Duration,
    /// Give up with [`StoreError::LockTimeout`] after this long. `None` waits
    /// forever.
    pub timeout: Option<Duration>,
    /// A marker older than this is assumed abandoned by a crashed holder and
    /// removed. `None` never breaks a marker.
    pub stale_after: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            timeout: Some(Duration::from_secs(300)),
            stale_after: Some(Duration::from_secs(600)),
        }
    }
}

/// Contents of the marker file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockMarker {
    pub owner: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    owner: Uuid,
    config: LockConfig,
    depth: ReentrantMutex<Cell<usize>>,
}

impl StoreLock {
    pub fn new(path: impl Into<PathBuf>, config: LockConfig) -> Self {
        Self {
            path: path.into(),
            owner: Uuid::new_v4(),
            config,
            depth: ReentrantMutex::new(Cell::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Block until this process holds the lock. `timeout` bounds the whole
    /// wait, both behind other threads of this process and behind other
    /// processes.
    pub fn acquire(&self) -> TuneResult<LockGuard<'_>> {
        let started = Instant::now();
        let held = match self.config.timeout {
            Some(timeout) => self
                .depth
                .try_lock_for(timeout)
                .ok_or_else(|| self.timed_out(started.elapsed()))?,
            None => self.depth.lock(),
        };
        if held.get() == 0 {
            self.create_marker(started)?;
        }
        held.set(held.get() + 1);
        Ok(LockGuard { lock: self, held })
    }

    /// Current nesting depth on this thread's hold, zero when not held.
    pub fn depth(&self) -> usize {
        self.depth.try_lock().map(|held| held.get()).unwrap_or(0)
    }

    fn timed_out(&self, waited: Duration) -> TuneError {
        StoreError::LockTimeout {
            path: self.path.display().to_string(),
            waited_ms: waited.as_millis(),
        }
        .into()
    }

    fn create_marker(&self, started: Instant) -> TuneResult<()> {
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    let marker = LockMarker {
                        owner: self.owner,
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    file.write_all(&serde_json::to_vec(&marker)?)?;
                    file.sync_all()?;
                    debug!(path = %self.path.display(), owner = %self.owner, "lock acquired");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.break_if_stale()? {
                        continue;
                    }
                    if let Some(timeout) = self.config.timeout {
                        let waited = started.elapsed();
                        if waited >= timeout {
                            return Err(self.timed_out(waited));
                        }
                    }
                    std::thread::sleep(self.config.poll_interval);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the marker if it has outlived `stale_after`. Returns whether
    /// the caller should retry creating its own marker.
    ///
    /// Breaking is serialized through a second `.breaking` marker and the
    /// staleness check is repeated under it, so two waiters that both saw
    /// the abandoned marker cannot each remove one and both proceed.
    fn break_if_stale(&self) -> TuneResult<bool> {
        let Some(stale_after) = self.config.stale_after else {
            return Ok(false);
        };
        if !is_stale(&self.path, stale_after) {
            return Ok(false);
        }
        let Some(_breaker) = self.begin_breaking(stale_after)? else {
            return Ok(false);
        };
        let Some(age) = marker_age(&self.path)? else {
            return Ok(true);
        };
        if age < stale_after {
            return Ok(false);
        }
        let seen = read_marker(&self.path);
        let seen_owner = seen.as_ref().map(|m| m.owner);
        let claim = self.claim_marker(|aside| {
            read_marker(aside).map(|m| m.owner) == seen_owner && is_stale(aside, stale_after)
        })?;
        match claim {
            Claim::Taken => {
                warn!(
                    path = %self.path.display(),
                    age_secs = age.as_secs(),
                    holder = ?seen.as_ref().map(|m| (m.owner, m.pid)),
                    "broke stale store lock"
                );
                Ok(true)
            }
            Claim::Gone => Ok(true),
            Claim::Returned => Ok(false),
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("store.lock");
        self.path.with_file_name(format!("{name}.{suffix}"))
    }

    /// Take the right to break a stale marker. `None` while another waiter
    /// holds it; a breaker left behind by a crash is removed once stale.
    fn begin_breaking(&self, stale_after: Duration) -> io::Result<Option<Breaker>> {
        let path = self.sibling("breaking");
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(Breaker { path })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if is_stale(&path, stale_after) {
                    warn!(path = %path.display(), "removing abandoned lock breaker");
                    if let Err(e) = fs::remove_file(&path) {
                        debug!(path = %path.display(), error = %e, "breaker already gone");
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Atomically move the marker to a private name, then delete it if
    /// `expected` accepts the moved file. Anything else is linked back;
    /// `hard_link` never overwrites a marker created in the meantime.
    fn claim_marker(&self, expected: impl Fn(&Path) -> bool) -> io::Result<Claim> {
        let aside = self.sibling(&format!("aside.{}", Uuid::new_v4().simple()));
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Claim::Gone),
            Err(e) => return Err(e),
        }
        if expected(&aside) {
            fs::remove_file(&aside)?;
            return Ok(Claim::Taken);
        }
        let restored = fs::hard_link(&aside, &self.path);
        fs::remove_file(&aside)?;
        match restored {
            Ok(()) => Ok(Claim::Returned),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(
                    path = %self.path.display(),
                    "store lock was taken while a marker was set aside"
                );
                Ok(Claim::Returned)
            }
            Err(e) => Err(e),
        }
    }

    fn release_marker(&self) {
        let ours = |aside: &Path| read_marker(aside).is_some_and(|m| m.owner == self.owner);
        match self.claim_marker(ours) {
            Ok(Claim::Taken) => {
                debug!(path = %self.path.display(), owner = %self.owner, "lock released")
            }
            Ok(Claim::Gone) => warn!(path = %self.path.display(), "lock marker vanished while held"),
            Ok(Claim::Returned) => warn!(
                path = %self.path.display(),
                "lock was broken while held; leaving the new holder's marker"
            ),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove lock marker"),
        }
    }
}

/// Outcome of [`StoreLock::claim_marker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Taken,
    /// No marker was there to move.
    Gone,
    Returned,
}

/// Removes the `.breaking` marker on drop.
struct Breaker {
    path: PathBuf,
}

impl Drop for Breaker {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock breaker");
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    matches!(marker_age(path), Ok(Some(age)) if age >= stale_after)
}

/// Age from the marker's own timestamp, or from the file's mtime while the
/// holder is still writing it. `None` when there is no marker.
fn marker_age(path: &Path) -> io::Result<Option<Duration>> {
    if let Some(marker) = read_marker(path) {
        let age = Utc::now().signed_duration_since(marker.acquired_at);
        return Ok(Some(age.to_std().unwrap_or(Duration::ZERO)));
    }
    match fs::metadata(path) {
        Ok(meta) => {
            let modified = meta.modified()?;
            Ok(Some(
                SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO),
            ))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read and parse a lock marker, `None` if absent or not yet written.
pub fn read_marker(path: &Path) -> Option<LockMarker> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Held lock. Dropping the outermost guard removes the marker.
pub struct LockGuard<'a> {
    lock: &'a StoreLock,
    held: ReentrantMutexGuard<'a, Cell<usize>>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let depth = self.held.get().saturating_sub(1);
        self.held.set(depth);
        if depth == 0 {
            self.lock.release_marker();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn quick() -> LockConfig {
        LockConfig {
            poll_interval: Duration::from_millis(5),
            timeout: Some(Duration::from_millis(200)),
            stale_after: None,
        }
    }

    #[test]
    fn reentrant_within_a_thread() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lock");
        let lock = StoreLock::new(&path, quick());
        {
            let _outer = lock.acquire().unwrap();
            assert!(path.exists());
            {
                let _inner = lock.acquire().unwrap();
                assert_eq!(lock.depth(), 2);
            }
            assert!(path.exists());
            assert_eq!(lock.depth(), 1);
            assert_eq!(read_marker(&path).unwrap().owner, lock.owner());
        }
        assert!(!path.exists());
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn second_holder_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lock");
        let first = StoreLock::new(&path, quick());
        let second = StoreLock::new(&path, quick());
        let _held = first.acquire().unwrap();
        let err = second.acquire().err().unwrap();
        assert!(matches!(
            err,
            bt_types::TuneError::Store(StoreError::LockTimeout { .. })
        ));
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lock");
        let first = Arc::new(StoreLock::new(&path, quick()));
        let guard = first.acquire().unwrap();

        let waiter_path = path.clone();
        let waiter = std::thread::spawn(move || {
            let config = LockConfig {
                timeout: Some(Duration::from_secs(5)),
                ..quick()
            };
            let second = StoreLock::new(waiter_path, config);
            let _guard = second.acquire().unwrap();
            second.owner()
        });
        std::thread::sleep(Duration::from_millis(30));
        drop(guard);
        let owner = waiter.join().unwrap();
        assert_ne!(owner, first.owner());
    }

    #[test]
    fn stale_marker_is_broken() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lock");
        let abandoned = LockMarker {
            owner: Uuid::new_v4(),
            pid: 0,
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        fs::write(&path, serde_json::to_vec(&abandoned).unwrap()).unwrap();

        let lock = StoreLock::new(
            &path,
            LockConfig {
                stale_after: Some(Duration::from_secs(60)),
                ..quick()
            },
        );
        let _guard = lock.acquire().unwrap();
        assert_eq!(read_marker(&path).unwrap().owner, lock.owner());
    }

    #[test]
    fn fresh_marker_is_respected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lock");
        let live = LockMarker {
            owner: Uuid::new_v4(),
            pid: 1,
            acquired_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_vec(&live).unwrap()).unwrap();
        let lock = StoreLock::new(
            &path,
            LockConfig {
                stale_after: Some(Duration::from_secs(60)),
                ..quick()
            },
        );
        assert!(lock.acquire().is_err());
        assert_eq!(read_marker(&path).unwrap(), live);
    }

    fn abandoned_marker(path: &Path) -> LockMarker {
        let abandoned = LockMarker {
            owner: Uuid::new_v4(),
            pid: 0,
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        fs::write(path, serde_json::to_vec(&abandoned).unwrap()).unwrap();
        abandoned
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn racing_waiters_break_a_stale_marker_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Barrier;

        for _ in 0..20 {
            let dir = tempdir().unwrap();
            let path = dir.path().join("store.lock");
            abandoned_marker(&path);

            let waiters = 8;
            let barrier = Arc::new(Barrier::new(waiters));
            let inside = Arc::new(AtomicUsize::new(0));
            let most = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..waiters)
                .map(|_| {
                    let path = path.clone();
                    let barrier = Arc::clone(&barrier);
                    let inside = Arc::clone(&inside);
                    let most = Arc::clone(&most);
                    std::thread::spawn(move || {
                        let lock = StoreLock::new(
                            path,
                            LockConfig {
                                poll_interval: Duration::from_millis(1),
                                timeout: Some(Duration::from_secs(10)),
                                stale_after: Some(Duration::from_secs(60)),
                            },
                        );
                        barrier.wait();
                        let _guard = lock.acquire().unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        most.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(most.load(Ordering::SeqCst), 1);
            assert!(leftovers(dir.path()).is_empty(), "{:?}", leftovers(dir.path()));
        }
    }

    #[test]
    fn marker_that_changed_hands_is_put_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lock");
        let lock = StoreLock::new(&path, quick());
        let live = LockMarker {
            owner: Uuid::new_v4(),
            pid: 1,
            acquired_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_vec(&live).unwrap()).unwrap();

        let expected_owner = Uuid::new_v4();
        let claim = lock
            .claim_marker(|aside| read_marker(aside).map(|m| m.owner) == Some(expected_owner))
            .unwrap();
        assert_eq!(claim, Claim::Returned);
        assert_eq!(read_marker(&path).unwrap(), live);
        assert_eq!(leftovers(dir.path()), vec!["store.lock".to_string()]);

        fs::remove_file(&path).unwrap();
        assert_eq!(lock.claim_marker(|_| true).unwrap(), Claim::Gone);
    }

    #[test]
    fn release_leaves_a_replacement_marker_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lock");
        let lock = StoreLock::new(&path, quick());
        let guard = lock.acquire().unwrap();
        let replacement = abandoned_marker(&path);
        drop(guard);
        assert_eq!(read_marker(&path).unwrap(), replacement);
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn abandoned_breaker_does_not_block_forever() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lock");
        abandoned_marker(&path);
        let breaker = dir.path().join("store.lock.breaking");
        fs::write(&breaker, b"").unwrap();

        // A zero threshold makes the just-written breaker stale at once.
        let lock = StoreLock::new(
            &path,
            LockConfig {
                stale_after: Some(Duration::ZERO),
                timeout: Some(Duration::from_secs(5)),
                ..quick()
            },
        );
        let _guard = lock.acquire().unwrap();
        assert_eq!(read_marker(&path).unwrap().owner, lock.owner());
        assert!(!breaker.exists());
    }

    #[test]
    fn waiting_behind_another_thread_times_out() {
        let dir = tempdir().unwrap();
        let lock = Arc::new(StoreLock::new(dir.path().join("store.lock"), quick()));
        let _held = lock.acquire().unwrap();

        let shared = Arc::clone(&lock);
        let timed_out = std::thread::spawn(move || {
            matches!(
                shared.acquire(),
                Err(bt_types::TuneError::Store(StoreError::LockTimeout { .. }))
            )
        })
        .join()
        .unwrap();
        assert!(timed_out);
        assert_eq!(lock.depth(), 1);
    }
}
