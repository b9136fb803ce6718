use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance is already running (pid {pid}); remove {path} if this is not the case")]
    AlreadyRunning { pid: i32, path: PathBuf },

    #[error("failed to access lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// PID-stamped marker file that keeps a second process from starting.
///
/// The marker is removed by [`InstanceLock::release`] or on drop, whichever
/// comes first. Releasing more than once is a no-op.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    released: AtomicBool,
}

impl InstanceLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        match fs::read_to_string(&path) {
            Ok(content) => match parse_pid(&content) {
                Some(pid) if !is_own_pid(pid) && is_alive(pid) => {
                    return Err(LockError::AlreadyRunning {
                        pid,
                        path: path.clone(),
                    });
                }
                owner => {
                    warn!(
                        "Removing stale lock file {} (owner {:?} is not running)",
                        path.display(),
                        owner
                    );
                    remove_if_present(&path).map_err(io_err)?;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        create_marker(&path)?;
        info!("Acquired instance lock: {}", path.display());

        Ok(Self {
            path,
            released: AtomicBool::new(false),
        })
    }

    /// Remove the marker. Only the first call touches the filesystem.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match remove_if_present(&self.path) {
            Ok(()) => info!("Released instance lock: {}", self.path.display()),
            Err(e) => warn!("Failed to remove lock file {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Create the marker and stamp it with our pid. Creation fails if the file
/// exists, so two processes racing past the stale check cannot both win.
fn create_marker(path: &Path) -> Result<(), LockError> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let pid = fs::read_to_string(path)
                .ok()
                .and_then(|content| parse_pid(&content))
                .unwrap_or(0);
            return Err(LockError::AlreadyRunning {
                pid,
                path: path.to_path_buf(),
            });
        }
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    write!(file, "{}", std::process::id()).map_err(|source| LockError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_pid(content: &str) -> Option<i32> {
    content.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

/// A marker left behind under our own pid, e.g. by an earlier run in a
/// container where the bot is always pid 1.
fn is_own_pid(pid: i32) -> bool {
    u32::try_from(pid).is_ok_and(|pid| pid == std::process::id())
}

/// Signal-0 existence check. EPERM means the process exists but belongs
/// to another user.
fn is_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
