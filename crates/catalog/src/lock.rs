use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

const LOCK_FILE: &str = "catalog.lock";

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

#[derive(Debug)]
pub enum LockError {
    Held {
        path: PathBuf,
        holder: Option<u32>,
    },
    Io(std::io::Error),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Held {
                path,
                holder: Some(pid),
            } => write!(f, "another run (pid {}) holds the lock at {:?}", pid, path),
            LockError::Held { path, holder: None } => {
                write!(f, "another run holds the lock at {:?}", path)
            }
            LockError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for LockError {}

impl From<std::io::Error> for LockError {
    fn from(err: std::io::Error) -> Self {
        LockError::Io(err)
    }
}

impl RunLock {
    pub fn acquire(dir: &Path) -> Result<RunLock, LockError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        if let Some(lock) = Self::try_create(&path)? {
            return Ok(lock);
        }
        // A lock left behind by a dead process must not wedge every later
        // run. A holder that cannot be verified keeps the lock respected.
        if let Some(pid) = read_holder(&path) {
            if !holder_alive(pid) {
                warn!("Removing stale lock {:?} left by pid {}", path, pid);
                if fs::remove_file(&path).is_ok() {
                    if let Some(lock) = Self::try_create(&path)? {
                        return Ok(lock);
                    }
                }
            }
        }
        Err(LockError::Held {
            holder: read_holder(&path),
            path,
        })
    }

    fn try_create(path: &Path) -> Result<Option<RunLock>, LockError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if let Err(err) = writeln!(file, "{}", std::process::id()) {
            let _ = fs::remove_file(path);
            return Err(err.into());
        }
        Ok(Some(RunLock {
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {:?}: {}", self.path, err);
        }
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

// Without /proc there is nothing to check against, so the holder counts as
// alive.
fn holder_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if !proc_root.exists() {
        return true;
    }
    proc_root.join(pid.to_string()).exists()
}
