//! Process detachment and pid file handling.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[cfg(unix)]
    #[error("fork failed: {0}")]
    Fork(#[from] nix::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Detach from the terminal via the double-fork pattern.
///
/// The working directory becomes `/` and the standard streams are
/// redirected to `/dev/null`, so relative paths must be resolved first
/// (see [`AgentConfig::make_paths_absolute`]).
///
/// [`AgentConfig::make_paths_absolute`]: crate::config::AgentConfig::make_paths_absolute
///
/// # Safety
///
/// Must be called before the Tokio runtime (or any other thread) exists.
/// `fork()` in a multi-threaded process only duplicates the calling thread.
///
/// Returns `Ok(false)` on platforms without `fork`.
#[allow(unsafe_code)]
pub fn daemonize() -> Result<bool, DaemonError> {
    #[cfg(unix)]
    {
        use nix::unistd::{ForkResult, fork, setsid};

        // SAFETY: single-threaded; the runtime has not been built yet.
        match unsafe { fork() }? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }

        setsid()?;

        // SAFETY: still single-threaded in the first child.
        match unsafe { fork() }? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }

        std::env::set_current_dir("/")?;
        redirect_stdio()?;
        Ok(true)
    }

    #[cfg(not(unix))]
    {
        Ok(false)
    }
}

#[cfg(unix)]
fn redirect_stdio() -> Result<(), DaemonError> {
    use std::os::fd::AsRawFd;

    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in 0..=2 {
        nix::unistd::dup2(null.as_raw_fd(), fd)?;
    }
    Ok(())
}

/// Pid file removed when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path` (temp file + rename).
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        std::fs::write(&tmp, format!("{}\n", std::process::id()))?;
        std::fs::rename(&tmp, &path)?;

        tracing::info!(path = %path.display(), "PID file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
            }
        }
    }
}
