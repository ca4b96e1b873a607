//! PID file handling for single-instance startup and clean shutdown.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write our PID. A stale file left by a dead process is reaped; a live
    /// process holding the file refuses startup.
    pub fn acquire(path: &Path) -> std::io::Result<Self> {
        if let Ok(existing) = std::fs::read_to_string(path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if process_alive(pid) {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("another instance is running (pid {pid})"),
                    ));
                }
                warn!(pid, "reaping stale pid file");
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, std::process::id().to_string())?;
        info!(path = %path.display(), pid = std::process::id(), "pid file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn release(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to remove pid file: {e}");
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// kill(pid, 0) probes liveness without sending a signal.
fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let result = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status();
        matches!(result, Ok(status) if status.success())
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_writes_current_pid_and_release_removes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("countbot.pid");
        let pidfile = PidFile::acquire(&path).unwrap();
        let stored: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(stored, std::process::id());
        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_refuses_second_acquire() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("countbot.pid");
        let _held = PidFile::acquire(&path).unwrap();
        // Our own PID is alive, so a second acquire must refuse.
        assert!(PidFile::acquire(&path).is_err());
    }

    #[test]
    fn stale_pid_is_reaped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("countbot.pid");
        // A PID that can't be alive (beyond pid_max on any sane system).
        std::fs::write(&path, "4194999").unwrap();
        let pidfile = PidFile::acquire(&path);
        assert!(pidfile.is_ok());
    }
}
