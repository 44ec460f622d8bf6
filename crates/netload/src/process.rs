//! Managed child processes with captured output.
//!
//! A [`Cmd`] runs one shell command on a [`Host`]. Foreground commands are
//! reaped before the constructor returns; background commands keep running
//! until [`Cmd::process`] is called or the handle is dropped. Output is
//! drained by reader threads so a chatty child never blocks on a full pipe.
//!
//! Each child is placed in its own process group and signals go to the whole
//! group, so `sh -c` wrappers cannot leave the real workload behind.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{LoadError, Result};
use crate::host::Host;

/// How long a process gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

type Sink = Arc<Mutex<Vec<u8>>>;

/// A child process started from a shell command string.
pub struct Cmd {
    cmd: String,
    host: Host,
    child: Option<Child>,
    status: Option<ExitStatus>,
    stdout: Sink,
    stderr: Sink,
    readers: Vec<thread::JoinHandle<()>>,
}

impl Cmd {
    /// Runs `cmd` in the foreground and waits for it to finish.
    ///
    /// A non-zero exit status is an error carrying the captured stderr.
    pub fn run(cmd: &str, host: &Host) -> Result<Self> {
        let mut proc = Self::spawn(cmd, host)?;
        proc.reap(false, None)?;
        proc.check_status()?;
        Ok(proc)
    }

    /// Starts `cmd` in the background and returns immediately.
    pub fn background(cmd: &str, host: &Host) -> Result<Self> {
        let proc = Self::spawn(cmd, host)?;
        tracing::debug!(cmd = %proc.cmd, host = %proc.host, "started background command");
        Ok(proc)
    }

    fn spawn(cmd: &str, host: &Host) -> Result<Self> {
        let mut command = host.command(cmd);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command.spawn().map_err(|source| LoadError::Spawn {
            cmd: cmd.to_string(),
            source,
        })?;

        let stdout: Sink = Arc::default();
        let stderr: Sink = Arc::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(drain(pipe, stdout.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(drain(pipe, stderr.clone()));
        }

        Ok(Self {
            cmd: cmd.to_string(),
            host: host.clone(),
            child: Some(child),
            status: None,
            stdout,
            stderr,
            readers,
        })
    }

    /// The command string this process was started from.
    pub fn command(&self) -> &str {
        &self.cmd
    }

    /// Output captured so far (complete once the process has been reaped).
    pub fn stdout(&self) -> String {
        snapshot(&self.stdout)
    }

    pub fn stderr(&self) -> String {
        snapshot(&self.stderr)
    }

    /// Exit status, if the process has been reaped.
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Reaps the process, optionally terminating it first.
    ///
    /// Waits up to `timeout` for the process to exit, then kills it. Calling
    /// this again after the process has been reaped returns the cached status
    /// without signalling anything. With `fail` set, a non-zero exit status is
    /// reported as [`LoadError::CommandFailed`].
    pub fn process(&mut self, terminate: bool, fail: bool, timeout: Duration) -> Result<ExitStatus> {
        let status = self.reap(terminate, Some(timeout))?;
        if fail {
            self.check_status()?;
        }
        Ok(status)
    }

    fn reap(&mut self, terminate: bool, timeout: Option<Duration>) -> Result<ExitStatus> {
        let Some(mut child) = self.child.take() else {
            return self.status.ok_or_else(|| LoadError::Wait {
                cmd: self.cmd.clone(),
                source: std::io::Error::other("process was never started"),
            });
        };

        if terminate {
            signal_group(&child, libc::SIGTERM);
        }

        let waited = match timeout {
            Some(t) => wait_with_timeout(&mut child, t),
            None => child.wait().map(Some),
        }
        .map_err(|source| LoadError::Wait {
            cmd: self.cmd.clone(),
            source,
        })?;

        let status = match waited {
            Some(status) => status,
            None => {
                tracing::warn!(cmd = %self.cmd, "process didn't exit in time, killing");
                signal_group(&child, libc::SIGKILL);
                let _ = child.kill();
                child.wait().map_err(|source| LoadError::Wait {
                    cmd: self.cmd.clone(),
                    source,
                })?
            }
        };

        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        self.status = Some(status);
        Ok(status)
    }

    fn check_status(&self) -> Result<()> {
        match self.status {
            Some(status) if !status.success() => Err(LoadError::CommandFailed {
                cmd: self.cmd.clone(),
                code: status.code(),
                stderr: self.stderr().trim().to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl Drop for Cmd {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Err(e) = self.reap(true, Some(DEFAULT_GRACE)) {
                tracing::warn!(cmd = %self.cmd, error = %e, "failed to reap process on drop");
            }
        }
    }
}

impl std::fmt::Debug for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cmd")
            .field("cmd", &self.cmd)
            .field("host", &self.host)
            .field("running", &self.child.is_some())
            .field("status", &self.status)
            .finish()
    }
}

/// A background command scoped to a block.
///
/// When the guard is dropped the process is reaped: terminated, or, with
/// `exit_wait`, given the grace period to exit on its own first.
pub struct Bkg {
    proc: Cmd,
    exit_wait: bool,
}

impl Bkg {
    pub fn new(cmd: &str, host: &Host, exit_wait: bool) -> Result<Self> {
        Ok(Self {
            proc: Cmd::background(cmd, host)?,
            exit_wait,
        })
    }

    /// Reaps the process now and reports what the drop would only log.
    ///
    /// With `exit_wait` the process must exit on its own within the grace
    /// period and with a zero status; otherwise it is terminated.
    pub fn finish(mut self) -> Result<ExitStatus> {
        let exit_wait = self.exit_wait;
        self.proc.process(!exit_wait, exit_wait, DEFAULT_GRACE)
    }

    /// Drops the guard, terminating the process even if `exit_wait` was set.
    pub fn abort(mut self) {
        self.exit_wait = false;
    }
}

impl std::ops::Deref for Bkg {
    type Target = Cmd;

    fn deref(&self) -> &Cmd {
        &self.proc
    }
}

impl Drop for Bkg {
    fn drop(&mut self) {
        if let Err(e) = self.proc.process(!self.exit_wait, false, DEFAULT_GRACE) {
            tracing::warn!(cmd = %self.proc.cmd, error = %e, "background command cleanup failed");
        }
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R, sink: Sink) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&buf[..n]),
            }
        }
    })
}

fn snapshot(sink: &Sink) -> String {
    let bytes = sink.lock().unwrap_or_else(PoisonError::into_inner);
    String::from_utf8_lossy(&bytes).into_owned()
}

fn signal_group(child: &Child, sig: libc::c_int) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: the child was spawned with `process_group(0)`, so its pid is
    // also its process group id. Signalling a group that already exited is a
    // harmless ESRCH.
    unsafe {
        libc::kill(-pgid, sig);
    }
}

/// Wait for a child process with a timeout. `Ok(None)` means it is still running.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}
