//! External generator process supervision
//!
//! Owns the spectrum generator child process: writes the transient config
//! artifact it is pointed at, spawns it with stdout piped back to us, and
//! handles termination and reaping on every exit path. The generator is
//! invoked as `<program> -p <config>` and streams raw little-endian frames
//! on stdout until terminated.

use std::io::Write;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::BitFormat;

/// How long the generator gets to honor SIGTERM before SIGKILL
const TERM_GRACE: Duration = Duration::from_secs(2);
const REAP_POLL: Duration = Duration::from_millis(20);

/// Error type for generator startup
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to create generator config file: {0}")]
    CreateArtifact(#[source] std::io::Error),

    #[error("failed to write generator config file: {0}")]
    WriteArtifact(#[source] std::io::Error),

    #[error("failed to spawn generator `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("generator spawned without a stdout pipe")]
    MissingStdout,
}

/// Transient config file handed to the generator.
///
/// The file lives exactly as long as this handle, so startup unwind and
/// session stop both delete it through `Drop`.
pub struct ConfigArtifact {
    file: NamedTempFile,
}

impl ConfigArtifact {
    /// Write the key/value document the generator expects: bar count, raw
    /// output to stdout, and the requested sample depth.
    pub fn write(bars: usize, bit_format: BitFormat) -> Result<Self, SpawnError> {
        let mut file = tempfile::Builder::new()
            .prefix("cavatina-")
            .suffix(".conf")
            .tempfile()
            .map_err(SpawnError::CreateArtifact)?;

        write!(
            file,
            "[general]\nbars = {bars}\n[output]\nmethod = raw\nraw_target = /dev/stdout\nbit_format = {bit_format}\n"
        )
        .map_err(SpawnError::WriteArtifact)?;
        file.as_file().sync_all().map_err(SpawnError::WriteArtifact)?;

        debug!("wrote generator config to {}", file.path().display());
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Handle to a running generator child process.
///
/// The `Child` sits behind a mutex so the decode thread can reap
/// non-blockingly on its own exit while the controller performs the
/// blocking shutdown; neither path holds the lock across the pipe read.
#[derive(Debug)]
pub struct Generator {
    child: Mutex<Child>,
    pid: u32,
    program: String,
}

impl Generator {
    /// Spawn the generator with its stdout piped to the returned read end.
    ///
    /// The child gets `PR_SET_PDEATHSIG = SIGTERM`, so it cannot outlive a
    /// supervisor that dies without running the shutdown path.
    pub fn spawn(program: &str, config_path: &Path) -> Result<(Self, ChildStdout), SpawnError> {
        use std::os::unix::process::CommandExt;

        let mut command = Command::new(program);
        command
            .arg("-p")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        unsafe {
            command.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
            program: program.to_string(),
            source,
        })?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SpawnError::MissingStdout);
            }
        };
        let pid = child.id();
        debug!("spawned generator `{}` (pid {})", program, pid);

        Ok((
            Self {
                child: Mutex::new(child),
                pid,
                program: program.to_string(),
            },
            stdout,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Graceful, blocking shutdown: SIGTERM, a bounded wait, SIGKILL as the
    /// fallback, then a final reap. Killing the writer closes the pipe,
    /// which is what unblocks a decode read in progress.
    pub fn shutdown(&self) {
        let mut child = match self.child.lock() {
            Ok(child) => child,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Already exited and reaped (e.g. the decode loop saw EOF first)
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }

        // SAFETY: `child` has not been reaped, so the pid still names our
        // child and cannot have been reused.
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }

        let deadline = Instant::now() + TERM_GRACE;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("generator `{}` exited: {}", self.program, status);
                    return;
                }
                Ok(None) => std::thread::sleep(REAP_POLL),
                Err(err) => {
                    warn!("failed to poll generator `{}`: {}", self.program, err);
                    break;
                }
            }
        }

        warn!(
            "generator `{}` (pid {}) ignored SIGTERM, killing",
            self.program, self.pid
        );
        if let Err(err) = child.kill() {
            warn!("failed to kill generator `{}`: {}", self.program, err);
        }
        match child.wait() {
            Ok(status) => debug!("generator `{}` exited: {}", self.program, status),
            Err(err) => warn!("failed to reap generator `{}`: {}", self.program, err),
        }
    }

    /// Non-blocking reap, used by the decode loop on its way out so an
    /// already-dead generator does not linger as a zombie until `stop`.
    pub fn reap(&self) {
        if let Ok(mut child) = self.child.try_lock() {
            match child.try_wait() {
                Ok(Some(status)) => debug!("generator `{}` exited: {}", self.program, status),
                Ok(None) => debug!("generator `{}` still running, deferring reap", self.program),
                Err(err) => warn!("failed to poll generator `{}`: {}", self.program, err),
            }
        }
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_matches_wire_format() {
        let artifact = ConfigArtifact::write(64, BitFormat::Bits16).unwrap();
        let text = std::fs::read_to_string(artifact.path()).unwrap();
        assert_eq!(
            text,
            "[general]\nbars = 64\n[output]\nmethod = raw\nraw_target = /dev/stdout\nbit_format = 16bit\n"
        );
    }

    #[test]
    fn test_artifact_8bit() {
        let artifact = ConfigArtifact::write(32, BitFormat::Bits8).unwrap();
        let text = std::fs::read_to_string(artifact.path()).unwrap();
        assert!(text.contains("bars = 32\n"));
        assert!(text.contains("bit_format = 8bit\n"));
    }

    #[test]
    fn test_artifact_removed_on_drop() {
        let path = {
            let artifact = ConfigArtifact::write(16, BitFormat::Bits8).unwrap();
            artifact.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_spawn_missing_program() {
        let artifact = ConfigArtifact::write(16, BitFormat::Bits16).unwrap();
        let err = Generator::spawn("cavatina-no-such-generator", artifact.path()).unwrap_err();
        assert!(matches!(err, SpawnError::Spawn { .. }));
    }
}
