//! Background mount workers and the readiness handshake with their parent.
//!
//! The parent re-executes the current binary with `--foreground
//! --notify-pid=<parent pid>` and waits, bounded by a timeout, until the
//! worker either sends `SIGUSR1` or exits. The worker mounts, detaches its
//! standard descriptors, starts a new session and only then signals.

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{self, Pid};
use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Signal a worker sends once it is mounted and detached.
pub const READY_SIGNAL: Signal = Signal::SIGUSR1;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pid of the last process that sent [`READY_SIGNAL`].
static READY_FROM: AtomicI32 = AtomicI32::new(0);
static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_ready(
    _signal: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    if info.is_null() {
        return;
    }
    // SAFETY: the kernel hands SA_SIGINFO handlers a valid siginfo_t.
    let sender = unsafe { sender_pid(&*info) };
    READY_FROM.store(sender, Ordering::SeqCst);
}

extern "C" fn on_terminate(_signal: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn sender_pid(info: &libc::siginfo_t) -> libc::pid_t {
    info.si_pid()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn sender_pid(info: &libc::siginfo_t) -> libc::pid_t {
    info.si_pid
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("cannot locate the current executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("failed to install handler for {signal}: {source}")]
    Signal {
        signal: Signal,
        #[source]
        source: Errno,
    },

    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for worker {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("worker {pid} did not signal readiness within {timeout:?}")]
    Timeout { pid: u32, timeout: Duration },

    #[error("failed to redirect standard streams to {}: {source}", .path.display())]
    Stdio {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start a new session: {0}")]
    Session(#[source] Errno),

    #[error("failed to notify process {pid}: {source}")]
    Notify {
        pid: u32,
        #[source]
        source: Errno,
    },
}

/// How the waiting parent learned the worker's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The worker signalled that it is mounted and serving.
    Ready,
    /// The worker exited before signalling, with this status.
    Exited(i32),
}

/// Command line that re-launches this program as a mount worker.
#[derive(Debug, Clone)]
pub struct Relaunch {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Relaunch {
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(|a| a.as_ref().to_os_string()).collect(),
        }
    }

    /// Re-launch the running executable with `args`.
    pub fn current_exe<I, S>(args: I) -> Result<Self, DaemonError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = std::env::current_exe().map_err(DaemonError::CurrentExe)?;
        Ok(Self::new(program, args))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// The worker command, told to stay in the foreground and notify `pid`.
    pub fn worker_command(&self, notify_pid: u32) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--foreground")
            .arg(format!("--notify-pid={}", notify_pid));
        command
    }
}

/// Spawn the worker and wait until it is ready, exits or runs out of time.
///
/// Only [`READY_SIGNAL`] sent by the spawned worker itself counts as
/// readiness. A worker that misses the deadline is sent `SIGTERM`.
pub fn spawn_and_wait(relaunch: &Relaunch, timeout: Duration) -> Result<Readiness, DaemonError> {
    READY_FROM.store(0, Ordering::SeqCst);
    let on_ready = SigAction::new(
        SigHandler::SigAction(on_ready),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    install(READY_SIGNAL, &on_ready)?;

    let parent = std::process::id();
    let mut child = relaunch
        .worker_command(parent)
        .spawn()
        .map_err(|source| DaemonError::Spawn {
            program: relaunch.program.clone(),
            source,
        })?;
    let pid = child.id();
    info!("Spawned mount worker {} (notify pid {})", pid, parent);

    let is_ready = || READY_FROM.load(Ordering::SeqCst) == pid as i32;

    let deadline = Instant::now() + timeout;
    loop {
        if is_ready() {
            info!("Mount worker {} is ready", pid);
            return Ok(Readiness::Ready);
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                // The signal may land between the check above and the exit.
                if is_ready() {
                    return Ok(Readiness::Ready);
                }
                let code = exit_code(status);
                warn!("Mount worker {} exited before readiness ({})", pid, code);
                return Ok(Readiness::Exited(code));
            }
            Ok(None) => {}
            Err(source) => return Err(DaemonError::Wait { pid, source }),
        }

        if Instant::now() >= deadline {
            terminate(&mut child);
            return Err(DaemonError::Timeout { pid, timeout });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn terminate(child: &mut Child) {
    let pid = child.id();
    warn!("Mount worker {} timed out, sending SIGTERM", pid);
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if e != Errno::ESRCH {
            warn!("SIGTERM to worker {} failed: {}", pid, e);
        }
    }
    if let Err(e) = child.wait() {
        debug!("Reaping worker {} failed: {}", pid, e);
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

/// Route `SIGINT` and `SIGTERM` to [`termination_requested`].
///
/// A mount worker calls this before attaching, so a `SIGTERM` sent by a
/// parent that gave up waiting still leads to an orderly unmount.
pub fn install_termination_handlers() -> Result<(), DaemonError> {
    let action = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    install(Signal::SIGINT, &action)?;
    install(Signal::SIGTERM, &action)
}

/// Whether `SIGINT` or `SIGTERM` arrived since the handlers were installed.
pub fn termination_requested() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

fn install(signal: Signal, action: &SigAction) -> Result<(), DaemonError> {
    // SAFETY: both handlers only store into atomics.
    unsafe { signal::sigaction(signal, action) }
        .map(|_| ())
        .map_err(|source| DaemonError::Signal { signal, source })
}

/// Point stdin at `/dev/null` and stdout/stderr at `log_path` (appending).
pub fn detach_stdio(log_path: &Path) -> Result<(), DaemonError> {
    let stdio_err = |path: &Path, source: io::Error| DaemonError::Stdio {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| stdio_err(log_path, e))?;
    }
    let null = File::open("/dev/null").map_err(|e| stdio_err(Path::new("/dev/null"), e))?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| stdio_err(log_path, e))?;

    for (file, target) in [
        (&null, libc::STDIN_FILENO),
        (&log, libc::STDOUT_FILENO),
        (&log, libc::STDERR_FILENO),
    ] {
        unistd::dup2(file.as_raw_fd(), target)
            .map_err(|e| stdio_err(log_path, io::Error::from(e)))?;
    }
    Ok(())
}

/// Leave the controlling terminal's session.
pub fn new_session() -> Result<(), DaemonError> {
    match unistd::setsid() {
        Ok(sid) => {
            debug!("Started session {}", sid);
            Ok(())
        }
        // Already a group leader, e.g. started by hand from a shell.
        Err(Errno::EPERM) => {
            debug!("setsid: already a process group leader");
            Ok(())
        }
        Err(e) => Err(DaemonError::Session(e)),
    }
}

/// Tell the waiting parent that the mount is ready.
pub fn notify_parent(pid: u32) -> Result<(), DaemonError> {
    signal::kill(Pid::from_raw(pid as i32), READY_SIGNAL)
        .map_err(|source| DaemonError::Notify { pid, source })?;
    debug!("Sent readiness signal to {}", pid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_command_appends_notify_flags() {
        let relaunch = Relaunch::new("/usr/bin/origin", ["--config", "/etc/o.toml", "mount", "A"]);
        let command = relaunch.worker_command(4242);
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(
            args,
            vec![
                "--config",
                "/etc/o.toml",
                "mount",
                "A",
                "--foreground",
                "--notify-pid=4242"
            ]
        );
        assert_eq!(command.get_program(), "/usr/bin/origin");
    }

    #[test]
    fn test_exit_code_of_signalled_process() {
        assert_eq!(exit_code(ExitStatus::from_raw(7 << 8)), 7);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGTERM)), 128 + libc::SIGTERM);
    }

    #[test]
    fn test_notify_unknown_pid_fails() {
        // pid_max is far below this on every supported platform.
        assert!(matches!(
            notify_parent(0x3fff_ffff),
            Err(DaemonError::Notify { .. })
        ));
    }
}
