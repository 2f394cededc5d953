//! The authoritative job table.
//!
//! Every mutation takes the whole-store lock, reloads the latest snapshot
//! from disk, applies one transition and writes the result atomically
//! (temp file, fsync, rename) before releasing. Readers load the committed
//! file without locking; a rename never exposes a partial write.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use bt_types::{JobStatus, ParameterSpace, SpaceError, StoreError, TuneResult};
use ndarray::{ArrayView1, Axis};
use tracing::{debug, info};
use uuid::Uuid;

use crate::grid::halton_grid;
use crate::lock::{LockConfig, LockGuard, StoreLock};
use crate::snapshot::ExperimentSnapshot;

pub const STORE_FILE: &str = "experiment.json";
pub const LOCK_FILE: &str = "experiment.lock";

#[derive(Debug)]
pub struct ExperimentStore {
    dir: PathBuf,
    file: PathBuf,
    lock: StoreLock,
}

impl ExperimentStore {
    /// Open the experiment in `dir`, creating it with `grid_size` quasi-random
    /// candidates if it does not exist yet. An existing experiment must have
    /// been created with the same parameter space.
    pub fn create_or_open(
        dir: impl AsRef<Path>,
        space: &ParameterSpace,
        grid_size: usize,
        grid_seed: u64,
        lock_config: LockConfig,
    ) -> TuneResult<Self> {
        space.validate()?;
        let store = Self::at(dir.as_ref(), lock_config)?;
        {
            let _guard = store.lock.acquire()?;
            if store.file.exists() {
                let existing = store.load()?;
                if existing.space() != space {
                    return Err(StoreError::SpaceMismatch.into());
                }
                info!(dir = %store.dir.display(), jobs = existing.len(), "opened experiment");
            } else {
                let grid = halton_grid(grid_size, space.dimension(), grid_seed);
                let snapshot = ExperimentSnapshot::with_candidates(space.clone(), grid);
                store.persist(&snapshot)?;
                info!(
                    dir = %store.dir.display(),
                    grid_size,
                    dim = space.dimension(),
                    "created experiment"
                );
            }
        }
        Ok(store)
    }

    /// Open an existing experiment.
    pub fn open(dir: impl AsRef<Path>, lock_config: LockConfig) -> TuneResult<Self> {
        let store = Self::at(dir.as_ref(), lock_config)?;
        store.load()?;
        Ok(store)
    }

    fn at(dir: &Path, lock_config: LockConfig) -> TuneResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file: dir.join(STORE_FILE),
            lock: StoreLock::new(dir.join(LOCK_FILE), lock_config),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Hold the store lock across several operations. Mutations made while
    /// the guard lives re-enter it.
    pub fn lock(&self) -> TuneResult<LockGuard<'_>> {
        self.lock.acquire()
    }

    /// The last committed state.
    pub fn snapshot(&self) -> TuneResult<ExperimentSnapshot> {
        self.load()
    }

    fn load(&self) -> TuneResult<ExperimentSnapshot> {
        let bytes = fs::read(&self.file)?;
        let snapshot: ExperimentSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                message: format!("{}: {e}", self.file.display()),
            })?;
        snapshot.check()?;
        Ok(snapshot)
    }

    fn persist(&self, snapshot: &ExperimentSnapshot) -> TuneResult<()> {
        let tmp = self
            .dir
            .join(format!("{STORE_FILE}.tmp.{}", Uuid::new_v4().simple()));
        let result = (|| -> TuneResult<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(snapshot)?)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.file)?;
            Ok(())
        })();
        if result.is_err() {
            match fs::remove_file(&tmp) {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    debug!(path = %tmp.display(), error = %e, "could not remove temp file")
                }
                _ => {}
            }
        }
        result
    }

    /// Lock, reload, apply `f`, persist.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut ExperimentSnapshot) -> TuneResult<T>,
    ) -> TuneResult<T> {
        let _guard = self.lock.acquire()?;
        let mut snapshot = self.load()?;
        let out = f(&mut snapshot)?;
        self.persist(&snapshot)?;
        Ok(out)
    }

    fn transition(
        &self,
        id: usize,
        to: JobStatus,
        apply: impl FnOnce(&mut ExperimentSnapshot),
    ) -> TuneResult<()> {
        self.update(|snapshot| {
            snapshot.check_id(id)?;
            let from = snapshot.status[id];
            if !from.can_transition_to(to) {
                return Err(StoreError::InvalidTransition { id, from, to }.into());
            }
            snapshot.status[id] = to;
            apply(snapshot);
            Ok(())
        })?;
        info!(id, status = %to, "job transition");
        Ok(())
    }

    /// Add a proposed point as a new Candidate row and return its id.
    pub fn append(&self, point: &[f64]) -> TuneResult<usize> {
        let id = self.update(|snapshot| {
            let expected = snapshot.points.ncols();
            if point.len() != expected {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: point.len(),
                }
                .into());
            }
            if let Some((index, &value)) = point
                .iter()
                .enumerate()
                .find(|(_, v)| !(0.0..=1.0).contains(*v))
            {
                return Err(SpaceError::OutOfUnitRange { index, value }.into());
            }
            let row = ArrayView1::from(point);
            snapshot
                .points
                .push(Axis(0), row)
                .map_err(|e| StoreError::Corrupt {
                    message: e.to_string(),
                })?;
            snapshot.status.push(JobStatus::Candidate);
            snapshot.values.push(None);
            snapshot.durations.push(None);
            snapshot.handles.push(None);
            Ok(snapshot.len() - 1)
        })?;
        info!(id, "appended candidate");
        Ok(id)
    }

    pub fn mark_submitted(&self, id: usize, handle: Option<String>) -> TuneResult<()> {
        self.transition(id, JobStatus::Submitted, |snapshot| {
            snapshot.handles[id] = handle;
        })
    }

    pub fn mark_running(&self, id: usize) -> TuneResult<()> {
        self.transition(id, JobStatus::Running, |_| {})
    }

    /// Record the outcome. `value` may be non-finite to report a constraint
    /// violation.
    pub fn mark_complete(&self, id: usize, value: f64, duration: f64) -> TuneResult<()> {
        self.transition(id, JobStatus::Complete, |snapshot| {
            snapshot.values[id] = Some(value);
            snapshot.durations[id] = Some(duration);
        })?;
        debug!(id, value, duration, "recorded result");
        Ok(())
    }

    pub fn mark_broken(&self, id: usize) -> TuneResult<()> {
        self.transition(id, JobStatus::Broken, |_| {})
    }

    /// Return a submitted or running job whose process was found dead to
    /// the candidate pool.
    pub fn mark_candidate(&self, id: usize) -> TuneResult<()> {
        self.transition(id, JobStatus::Candidate, |snapshot| {
            snapshot.handles[id] = None;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bt_types::TuneError;
    use std::time::Duration;
    use tempfile::tempdir;

    fn space() -> ParameterSpace {
        ParameterSpace::new()
            .add_real("x", -5.0, 10.0)
            .add_real("y", 0.0, 15.0)
    }

    fn quick_lock() -> LockConfig {
        LockConfig {
            poll_interval: Duration::from_millis(2),
            timeout: Some(Duration::from_secs(10)),
            stale_after: None,
        }
    }

    fn store(dir: &Path) -> ExperimentStore {
        ExperimentStore::create_or_open(dir, &space(), 16, 3, quick_lock()).unwrap()
    }

    #[test]
    fn creation_fills_the_grid() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.len(), 16);
        assert_eq!(snap.candidates().len(), 16);
        assert_eq!(snap.points().ncols(), 2);
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn opening_releases_the_lock_for_other_handles() {
        let dir = tempdir().unwrap();
        let impatient = LockConfig {
            timeout: Some(Duration::from_millis(20)),
            ..quick_lock()
        };
        let created =
            ExperimentStore::create_or_open(dir.path(), &space(), 8, 1, impatient).unwrap();
        let reopened =
            ExperimentStore::create_or_open(dir.path(), &space(), 8, 1, impatient).unwrap();
        assert_ne!(created.lock.owner(), reopened.lock.owner());
        drop(reopened.lock().unwrap());
        created.mark_submitted(0, None).unwrap();
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn reopening_keeps_state_and_checks_space() {
        let dir = tempdir().unwrap();
        let first = store(dir.path());
        first.mark_submitted(0, Some("job-0".into())).unwrap();

        let again = store(dir.path());
        assert_eq!(again.snapshot().unwrap().status()[0], JobStatus::Submitted);

        let other = ParameterSpace::new().add_real("x", 0.0, 1.0);
        let err = ExperimentStore::create_or_open(dir.path(), &other, 16, 3, quick_lock())
            .err()
            .unwrap();
        assert!(matches!(err, TuneError::Store(StoreError::SpaceMismatch)));
    }

    #[test]
    fn full_lifecycle_round_trips() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.mark_submitted(2, Some("pid:7".into())).unwrap();
        store.mark_running(2).unwrap();
        store.mark_complete(2, 1.25, 4.0).unwrap();
        store.mark_submitted(3, None).unwrap();
        store.mark_running(3).unwrap();
        store.mark_complete(3, f64::NAN, 0.5).unwrap();
        store.mark_broken(4).unwrap();
        let written = store.snapshot().unwrap();

        let reopened = ExperimentStore::open(dir.path(), quick_lock()).unwrap();
        let read = reopened.snapshot().unwrap();
        assert_eq!(read.status(), written.status());
        assert_eq!(read.points(), written.points());
        assert_eq!(read.durations(), written.durations());
        assert_eq!(read.handles(), written.handles());
        assert_eq!(read.values()[2], Some(1.25));
        assert!(read.values()[3].unwrap().is_nan());
        assert_eq!(read.complete(), vec![2, 3]);
        assert_eq!(read.broken(), vec![4]);
        assert_eq!(read.best(), Some((2, 1.25)));
        assert!(read.record(3).unwrap().violates_constraint(None));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let err = store.mark_complete(0, 1.0, 1.0).err().unwrap();
        assert!(matches!(
            err,
            TuneError::Store(StoreError::InvalidTransition {
                id: 0,
                from: JobStatus::Candidate,
                to: JobStatus::Complete
            })
        ));
        store.mark_submitted(0, None).unwrap();
        store.mark_running(0).unwrap();
        store.mark_complete(0, 1.0, 1.0).unwrap();
        assert!(store.mark_complete(0, 2.0, 1.0).is_err());
        assert!(store.mark_broken(0).is_err());
        assert_eq!(store.snapshot().unwrap().values()[0], Some(1.0));
        assert!(matches!(
            store.mark_running(99).err().unwrap(),
            TuneError::Store(StoreError::JobNotFound { id: 99 })
        ));
    }

    #[test]
    fn dead_job_returns_to_candidates() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.mark_submitted(5, Some("pid:1".into())).unwrap();
        store.mark_running(5).unwrap();
        assert_eq!(store.snapshot().unwrap().pending(), vec![5]);
        store.mark_candidate(5).unwrap();
        let snap = store.snapshot().unwrap();
        assert!(snap.pending().is_empty());
        assert_eq!(snap.status()[5], JobStatus::Candidate);
        assert_eq!(snap.handles()[5], None);
    }

    #[test]
    fn append_validates_and_returns_next_id() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert_eq!(store.append(&[0.25, 0.75]).unwrap(), 16);
        assert_eq!(store.append(&[1.0, 0.0]).unwrap(), 17);
        assert!(store.append(&[0.5]).is_err());
        assert!(store.append(&[0.5, 1.5]).is_err());
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.len(), 18);
        assert_eq!(snap.points().row(16).to_vec(), vec![0.25, 0.75]);
        assert_eq!(snap.status()[17], JobStatus::Candidate);
    }

    #[test]
    fn held_lock_allows_nested_mutations() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        {
            let _guard = store.lock().unwrap();
            let id = store.append(&[0.5, 0.5]).unwrap();
            store.mark_submitted(id, None).unwrap();
            assert!(dir.path().join(LOCK_FILE).exists());
        }
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert_eq!(store.snapshot().unwrap().pending(), vec![16]);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        for id in 0..5 {
            store.mark_submitted(id, None).unwrap();
        }
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![STORE_FILE.to_string()]);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::write(store.file(), b"{ not json").unwrap();
        assert!(matches!(
            store.snapshot().err().unwrap(),
            TuneError::Store(StoreError::Corrupt { .. })
        ));
    }
}
