//! Process control: option wire-up, restarts, attach/detach and waiting.
//!
//! These are thin wrappers over the corresponding ptrace and `wait(2)` requests. None of
//! them is called implicitly by the rest of the crate; the driving loop decides when a
//! tracee runs.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use nix::errno::Errno;
use nix::sys::ptrace;
use tracing::{debug, info, trace};

use crate::error::{Result, ResultExt};
use crate::tracee::{self, Pid, Tracee};

pub use nix::sys::ptrace::Options;

/// Trace options this crate knows how to classify.
pub type TraceOptions = Options;

/// Every option whose stops [`Classifier`](crate::event::Classifier) can decode, in the
/// order they are retried when the kernel rejects a request.
pub const SUPPORTED_OPTIONS: [Options; 7] = [
    Options::PTRACE_O_TRACESYSGOOD,
    Options::PTRACE_O_TRACEFORK,
    Options::PTRACE_O_TRACEVFORK,
    Options::PTRACE_O_TRACECLONE,
    Options::PTRACE_O_TRACEEXEC,
    Options::PTRACE_O_TRACEEXIT,
    Options::PTRACE_O_TRACEVFORKDONE,
];

/// Union of [`SUPPORTED_OPTIONS`].
pub fn supported_options() -> Options {
    SUPPORTED_OPTIONS.iter().fold(Options::empty(), |acc, &opt| acc | opt)
}

/// Restart requests, which resume stopped tracees.
///
/// The restart mode determines the possible subsequent stops of the restarted tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Restart {
    Step,
    Continue,
    Syscall,
}

impl Default for Restart {
    fn default() -> Self {
        Restart::Syscall
    }
}

impl Restart {
    fn request(self) -> libc::c_uint {
        match self {
            Restart::Step => libc::PTRACE_SINGLESTEP,
            Restart::Continue => libc::PTRACE_CONT,
            Restart::Syscall => libc::PTRACE_SYSCALL,
        }
    }
}

/// Request `options` for the stopped tracee `pid`.
///
/// If the kernel rejects the full set with `EINVAL`, the options are requested again one
/// at a time, dropping each flag the kernel refuses. Returns the options in effect.
pub fn setup(pid: Pid, options: TraceOptions) -> Result<TraceOptions> {
    setup_with(pid, options, |options| ptrace::setoptions(pid, options))
}

fn setup_with<F>(pid: Pid, options: TraceOptions, mut setoptions: F) -> Result<TraceOptions>
where
    F: FnMut(Options) -> nix::Result<()>,
{
    let options = options & supported_options();

    match setoptions(options) {
        Ok(()) => {
            debug!(pid = pid.as_raw(), ?options, "set trace options");
            return Ok(options);
        },
        Err(Errno::EINVAL) => {},
        Err(err) => return Err(err).died_if_esrch(pid),
    }

    let mut effective = Options::empty();
    let mut applied = true;

    for &flag in SUPPORTED_OPTIONS.iter().filter(|&&flag| options.contains(flag)) {
        match setoptions(effective | flag) {
            Ok(()) => {
                effective |= flag;
                applied = true;
            },
            Err(Errno::EINVAL) => {
                info!(pid = pid.as_raw(), ?flag, "kernel rejected trace option, masking it");
                applied = false;
            },
            Err(err) => return Err(err).died_if_esrch(pid),
        }
    }

    if !applied {
        setoptions(effective).died_if_esrch(pid)?;
    }

    debug!(pid = pid.as_raw(), requested = ?options, ?effective, "set masked trace options");

    Ok(effective)
}

/// Resume the stopped tracee `pid`, delivering `signal` if nonzero.
///
/// Signals are raw numbers so that real-time signals can be passed through. Any
/// [`Tracee`] snapshot of `pid` is stale afterwards.
pub fn restart(pid: Pid, restart: Restart, signal: Option<i32>) -> Result<()> {
    trace!(pid = pid.as_raw(), ?restart, ?signal, "restarting tracee");

    tracee::resumed(pid);
    request(restart.request(), pid, signal)
}

/// Detach from the stopped tracee `pid`, delivering `signal` if nonzero.
pub fn detach(pid: Pid, signal: Option<i32>) -> Result<()> {
    debug!(pid = pid.as_raw(), ?signal, "detaching from tracee");

    tracee::resumed(pid);
    request(libc::PTRACE_DETACH, pid, signal)
}

/// Kill the tracee `pid` with `PTRACE_KILL`.
pub fn kill(pid: Pid) -> Result<()> {
    debug!(pid = pid.as_raw(), "killing tracee");

    tracee::resumed(pid);
    ptrace::kill(pid).died_if_esrch(pid)
}

/// Attach to the running process `pid`. This will deliver a `SIGSTOP`.
///
/// The tracee may not be considered stopped until it has been seen to stop via a wait.
pub fn attach(pid: Pid) -> Result<()> {
    debug!(pid = pid.as_raw(), "attaching to tracee");

    ptrace::attach(pid).died_if_esrch(pid)
}

/// Ask to be traced by the parent process.
pub fn traceme() -> Result<()> {
    Ok(ptrace::traceme()?)
}

/// Spawn `cmd` as a tracee.
///
/// The child requests `PTRACE_TRACEME` after `fork()` and pre-`exec()`, so it stops with
/// a `SIGTRAP` once its `execve()` succeeds. Trace options should be set at that stop.
pub fn spawn(cmd: &mut Command) -> Result<Child> {
    unsafe {
        cmd.pre_exec(|| ptrace::traceme().map_err(|err| io::Error::from_raw_os_error(err as i32)))
    };

    let child = cmd.spawn()?;

    debug!(pid = child.id(), "spawned tracee");

    Ok(child)
}

pub use crate::event::fetch_event_message;

/// Block until some child or tracee changes state, returning its raw wait status.
///
/// Returns `None` if there is nothing left to wait on.
pub fn wait_any() -> Result<Option<(Pid, i32)>> {
    wait_pid(Pid::from_raw(-1))
}

/// Block until `pid` changes state, returning its raw wait status.
///
/// Returns `None` if `pid` is not a child or tracee of the caller.
pub fn wait_for(pid: Pid) -> Result<Option<i32>> {
    Ok(wait_pid(pid)?.map(|(_, status)| status))
}

fn wait_pid(pid: Pid) -> Result<Option<(Pid, i32)>> {
    let mut status = 0;
    let res = unsafe { libc::waitpid(pid.as_raw(), &mut status, libc::__WALL) };

    match Errno::result(res) {
        Ok(waited) => Ok(Some((Pid::from_raw(waited), status))),
        Err(Errno::ECHILD) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn request(req: libc::c_uint, pid: Pid, signal: Option<i32>) -> Result<()> {
    let data = signal.unwrap_or(0) as libc::c_long;
    let res = unsafe {
        libc::ptrace(req, pid.as_raw(), std::ptr::null_mut::<libc::c_void>(), data)
    };

    Errno::result(res).map(drop).died_if_esrch(pid)
}

impl Tracee {
    /// Resume the tracee, invalidating its snapshot first.
    pub fn restart(&mut self, mode: Restart, signal: Option<i32>) -> Result<()> {
        self.invalidate();

        restart(self.pid(), mode, signal)
    }

    /// Detach from the tracee, invalidating its snapshot first.
    pub fn detach(&mut self, signal: Option<i32>) -> Result<()> {
        self.invalidate();

        detach(self.pid(), signal)
    }

    /// Request `options` for the tracee. See [`setup()`].
    pub fn set_options(&self, options: TraceOptions) -> Result<TraceOptions> {
        setup(self.pid(), options)
    }
}
