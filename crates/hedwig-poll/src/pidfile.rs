use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PidLockError {
    #[error("poll process already running with pid {pid} ({})", path.display())]
    AlreadyRunning { pid: i32, path: PathBuf },

    #[error("pid file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive ownership of the poll process PID file. The file is removed
/// when the lock is dropped.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    pid: i32,
}

impl PidLock {
    /// Take the lock, replacing a PID file left by a process that no longer
    /// exists.
    pub fn acquire(path: &Path) -> Result<Self, PidLockError> {
        let io_err = |source| PidLockError::Io {
            path: path.to_path_buf(),
            source,
        };
        let pid = std::process::id() as i32;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match contents.trim().parse::<i32>() {
                Ok(other) if other != pid && process_alive(other) => {
                    return Err(PidLockError::AlreadyRunning {
                        pid: other,
                        path: path.to_path_buf(),
                    });
                }
                Ok(other) => {
                    info!("removing stale pid file {} (pid {other})", path.display());
                    remove_if_present(path).map_err(io_err)?;
                }
                Err(_) => {
                    warn!("removing unreadable pid file {}", path.display());
                    remove_if_present(path).map_err(io_err)?;
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        // create_new: a racing process that wrote the file since we checked wins.
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let other = std::fs::read_to_string(path)
                    .ok()
                    .and_then(|c| c.trim().parse().ok())
                    .unwrap_or(0);
                return Err(PidLockError::AlreadyRunning {
                    pid: other,
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(io_err(e)),
        };
        writeln!(file, "{pid}").map_err(io_err)?;

        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        // Only remove the file if it is still ours.
        let ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| c.trim().parse::<i32>().ok())
            == Some(self.pid);
        if ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("cannot remove pid file {}: {e}", self.path.display());
            }
        }
    }
}

/// Signal 0 checks for existence. EPERM means the process exists but
/// belongs to someone else.
fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
