//! Data-directory lock
//!
//! sled allows one process per database. The orchestrator writes
//! `<data_dir>/.cloudburst.lock` holding its PID and refuses to start while
//! a live cloudburst process owns the file. A lock whose PID is gone (or
//! belongs to some other program after PID reuse) is stale and replaced.

use anyhow::{bail, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = ".cloudburst.lock";

/// Held for the life of the process; removed on drop.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    pid: u32,
    held: bool,
}

impl ProcessLock {
    pub fn acquire<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        let path = data_dir.join(LOCK_FILE_NAME);

        match Self::holder(&path) {
            Some(pid) if pid != std::process::id() && Self::is_cloudburst(pid) => bail!(
                "data directory {} is in use by cloudburst (PID {pid}); stop it or remove {}",
                data_dir.display(),
                path.display()
            ),
            Some(pid) => {
                tracing::info!(stale_pid = pid, "Replacing stale cloudburst lock");
                fs::remove_file(&path)
                    .with_context(|| format!("removing stale lock {}", path.display()))?;
            }
            None if path.exists() => {
                tracing::warn!(path = %path.display(), "Unreadable lock file, replacing");
                fs::remove_file(&path)
                    .with_context(|| format!("removing unreadable lock {}", path.display()))?;
            }
            None => {}
        }

        let pid = std::process::id();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("creating lock {}", path.display()))?;
        writeln!(file, "{pid}").context("writing PID to lock file")?;

        tracing::debug!(pid, path = %path.display(), "Data directory locked");
        Ok(Self {
            path,
            pid,
            held: true,
        })
    }

    /// PID recorded in an existing lock file.
    fn holder(path: &Path) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    #[cfg(target_os = "linux")]
    fn is_cloudburst(pid: u32) -> bool {
        fs::read(format!("/proc/{pid}/cmdline"))
            .map(|cmdline| String::from_utf8_lossy(&cmdline).contains("cloudburst"))
            .unwrap_or(false)
    }

    /// Without /proc there is no cheap liveness probe; assume the holder lives.
    #[cfg(not(target_os = "linux"))]
    fn is_cloudburst(_pid: u32) -> bool {
        true
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Remove everything in the locked data directory except the lock file.
    /// Only reachable through a held lock, so a running instance's
    /// database is never wiped from under it.
    pub fn clear_data_dir(&self) -> Result<usize> {
        let data_dir = self.path.parent().context("lock file has no parent")?;
        let mut removed = 0;
        for entry in fs::read_dir(data_dir)
            .with_context(|| format!("listing {}", data_dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path == self.path {
                continue;
            }
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            }
            .with_context(|| format!("removing {}", path.display()))?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Data directory unlocked"),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove lock file"),
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}
