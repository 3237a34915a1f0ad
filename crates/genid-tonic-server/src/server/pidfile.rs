use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

/// A PID file that is removed when dropped.
///
/// Creation refuses to overwrite a file naming a process that is still
/// running, so two servers cannot be started against the same path. A file
/// left behind by a crashed process is replaced.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(pid) = read_pid(path)? {
            if process_alive(pid) {
                bail!(
                    "{} names running process {pid}; is another server running?",
                    path.display()
                );
            }
        }

        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write pid file {}", path.display()))?;

        #[cfg(feature = "tracing")]
        tracing::info!("wrote pid file {}", path.display());

        Ok(Self {
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(_e) = fs::remove_file(&self.path) {
            #[cfg(feature = "tracing")]
            tracing::warn!("failed to remove pid file {}: {}", self.path.display(), _e);
        }
    }
}

/// Reads a PID. A missing or unparsable file counts as no PID.
fn read_pid(path: &Path) -> anyhow::Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(raw.trim().parse().ok()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read pid file {}", path.display())),
    }
}

/// Probes `pid` with signal 0. A permission error still means the process
/// exists. PIDs outside the positive `pid_t` range name process groups or
/// nothing at all, so they count as dead.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_own_pid_and_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genid.pid");

        let pid_file = PidFile::create(&path).unwrap();
        assert_eq!(pid_file.path(), path);
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id()));

        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn replaces_stale_or_garbage_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genid.pid");

        fs::write(&path, "not a pid").unwrap();
        let pid_file = PidFile::create(&path).unwrap();
        drop(pid_file);

        fs::write(&path, format!("{}\n", u32::MAX)).unwrap();
        let _pid_file = PidFile::create(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn liveness_follows_signal_zero() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
        assert!(!process_alive(i32::MAX as u32 + 1));
    }

    #[cfg(unix)]
    #[test]
    fn exited_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!process_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn refuses_a_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genid.pid");
        fs::write(&path, std::process::id().to_string()).unwrap();

        assert!(PidFile::create(&path).is_err());
        // The existing file is left alone.
        assert!(path.exists());
    }
}
