#![allow(clippy::module_name_repetitions)]
//! Instance lock: at most one supervisor (and therefore one agent) per
//! instance. The lock file is removed on drop.

use fs2::FileExt;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        // Brief retries cover a racing reader holding the file open.
        for _ in 0..10 {
            if !self.path.exists() || fs::remove_file(&self.path).is_ok() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Honor MESHRUN_SKIP_LOCK=1, for wrappers that already serialize launches.
pub fn should_acquire_lock() -> bool {
    env::var("MESHRUN_SKIP_LOCK").ok().as_deref() != Some("1")
}

/// Candidate lock file locations, in order: an explicit override, the runtime
/// dir, the temp dir, /tmp.
pub fn candidate_lock_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(p) = env::var("MESHRUN_LOCK_FILE") {
        if !p.is_empty() {
            paths.push(PathBuf::from(p));
            return paths;
        }
    }
    if let Ok(rt) = env::var("XDG_RUNTIME_DIR") {
        if !rt.is_empty() {
            paths.push(PathBuf::from(rt).join("meshrun.lock"));
        }
    }
    paths.push(env::temp_dir().join("meshrun.lock"));
    let tmp = PathBuf::from("/tmp/meshrun.lock");
    if !paths.contains(&tmp) {
        paths.push(tmp);
    }
    paths
}

/// Acquire a non-blocking exclusive lock at the first workable candidate.
/// A held lock surfaces as WouldBlock so the caller can map it to a distinct
/// exit code.
pub fn acquire_lock() -> io::Result<InstanceLock> {
    let mut last_err: Option<io::Error> = None;
    for p in candidate_lock_paths() {
        match acquire_lock_at(&p) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(e),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::other("no candidate lock location was usable")))
}

/// Acquire a lock at a specific path (also the test seam).
pub fn acquire_lock_at(p: &Path) -> io::Result<InstanceLock> {
    if let Some(parent) = p.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(p)?;
    match f.try_lock_exclusive() {
        Ok(()) => Ok(InstanceLock {
            file: f,
            path: p.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            format!("another meshrun instance already holds {}", p.display()),
        )),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let td = tempfile::tempdir().unwrap();
        let p = td.path().join("meshrun.lock");
        let first = acquire_lock_at(&p).unwrap();
        let err = acquire_lock_at(&p).expect_err("second acquisition must fail");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        drop(first);
        let again = acquire_lock_at(&p).expect("lock should be reacquirable after drop");
        assert_eq!(again.path(), p.as_path());
    }

    #[test]
    fn test_drop_removes_lock_file() {
        let td = tempfile::tempdir().unwrap();
        let p = td.path().join("meshrun.lock");
        {
            let _lock = acquire_lock_at(&p).unwrap();
            assert!(p.exists());
        }
        assert!(!p.exists(), "lock file should be removed on drop");
    }

    #[test]
    fn test_candidate_paths_override_wins() {
        let td = tempfile::tempdir().unwrap();
        let wanted = td.path().join("explicit.lock");
        std::env::set_var("MESHRUN_LOCK_FILE", &wanted);
        let paths = candidate_lock_paths();
        std::env::remove_var("MESHRUN_LOCK_FILE");
        assert_eq!(paths, vec![wanted]);
    }

    #[test]
    fn test_should_acquire_lock_env() {
        std::env::remove_var("MESHRUN_SKIP_LOCK");
        assert!(should_acquire_lock());
        std::env::set_var("MESHRUN_SKIP_LOCK", "1");
        assert!(!should_acquire_lock());
        std::env::remove_var("MESHRUN_SKIP_LOCK");
    }
}
