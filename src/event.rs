//! Classification of `wait(2)` statuses into trace events.

use std::convert::TryFrom;
use std::fmt;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use tracing::trace;

use crate::context::EventKind;
use crate::error::{Result, ResultExt};
use crate::tracee::Pid;

/// Bit OR-ed into the stop signal of a syscall-stop under `PTRACE_O_TRACESYSGOOD`.
const SYSGOOD_BIT: i32 = 0x80;

/// One classified ptrace event.
///
/// Signals are raw numbers, since real-time signals have no [`Signal`] variant. See
/// [`Event::signal()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// Exited normally with `code`.
    Exited { code: i32 },

    /// Killed by `signal`.
    Terminated { signal: i32, core_dumped: bool },

    /// Syscall-entry or -exit stop. Which one is for the caller to track.
    SyscallStop,

    Forked { child: Pid },
    VForked { child: Pid },
    Cloned { child: Pid },

    /// Stopped after a successful `execve()`. `old` is the thread ID the exec was
    /// issued from, which differs from the stopped PID when a non-leader thread execs.
    Execd { old: Pid },

    VForkDone { child: Pid },

    /// About to exit, with the pending wait status.
    ExitIntent { status: ExitStatus },

    /// Stopped by a job-control signal.
    GroupStop { signal: i32 },

    /// Signal-delivery-stop.
    GenuineSignal { signal: i32 },

    /// `SIGTRAP` without event bits: a breakpoint, a post-`execve()` trap without
    /// `PTRACE_O_TRACEEXEC`, a syscall-stop without `PTRACE_O_TRACESYSGOOD`, or a
    /// user-sent `SIGTRAP`.
    GenuineTrap,

    /// A status matching none of the above.
    Unknown { status: i32 },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Exited { .. } => EventKind::Exited,
            Event::Terminated { .. } => EventKind::Terminated,
            Event::SyscallStop => EventKind::SyscallStop,
            Event::Forked { .. } => EventKind::Forked,
            Event::VForked { .. } => EventKind::VForked,
            Event::Cloned { .. } => EventKind::Cloned,
            Event::Execd { .. } => EventKind::Execd,
            Event::VForkDone { .. } => EventKind::VForkDone,
            Event::ExitIntent { .. } => EventKind::ExitIntent,
            Event::GroupStop { .. } => EventKind::GroupStop,
            Event::GenuineSignal { .. } => EventKind::GenuineSignal,
            Event::GenuineTrap => EventKind::GenuineTrap,
            Event::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// Raw number of the signal the event carries, if any.
    pub fn signal_number(&self) -> Option<i32> {
        match *self {
            Event::Terminated { signal, .. } |
            Event::GroupStop { signal } |
            Event::GenuineSignal { signal } => Some(signal),
            Event::GenuineTrap => Some(libc::SIGTRAP),
            _ => None,
        }
    }

    /// Signal the event carries, if any and if it is a standard signal.
    pub fn signal(&self) -> Option<Signal> {
        self.signal_number().and_then(|sig| Signal::try_from(sig).ok())
    }

    /// New task reported by a fork, vfork or clone event.
    pub fn child(&self) -> Option<Pid> {
        match *self {
            Event::Forked { child } |
            Event::VForked { child } |
            Event::Cloned { child } |
            Event::VForkDone { child } => Some(child),
            _ => None,
        }
    }

    /// True if the tracee no longer exists.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Exited { .. } | Event::Terminated { .. })
    }

    /// Signal to deliver on restart so that the tracee sees what it would have seen
    /// untraced.
    ///
    /// A [`Event::GenuineTrap`] yields `None`. It also stands for the post-`execve()`
    /// trap and for syscall-stops without `PTRACE_O_TRACESYSGOOD`, which an untraced
    /// process never sees. Drivers that know a trap came from the tracee itself deliver
    /// `SIGTRAP` explicitly.
    pub fn pending_signal(&self) -> Option<i32> {
        match *self {
            Event::GenuineSignal { signal } => Some(signal),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Exited { code } => write!(f, "{} ({})", self.kind(), code),
            Event::Terminated { signal, core_dumped } => {
                write!(f, "{} ({}{})", self.kind(), signal, if *core_dumped { ", core dumped" } else { "" })
            },
            Event::Forked { child } |
            Event::VForked { child } |
            Event::Cloned { child } |
            Event::VForkDone { child } => write!(f, "{} (child = {})", self.kind(), child),
            Event::Execd { old } => write!(f, "{} (old = {})", self.kind(), old),
            Event::ExitIntent { status } => write!(f, "{} ({:?})", self.kind(), status),
            Event::GroupStop { signal } |
            Event::GenuineSignal { signal } => write!(f, "{} ({})", self.kind(), signal),
            Event::Unknown { status } => write!(f, "{} ({:#x})", self.kind(), status),
            Event::SyscallStop | Event::GenuineTrap => write!(f, "{}", self.kind()),
        }
    }
}

/// Decoded exit-intent status, as reported by `PTRACE_EVENT_EXIT`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    Code(i32),
    Signaled { signal: i32, core_dumped: bool },
}

impl ExitStatus {
    pub fn parse(status: u16) -> Self {
        // The bit layout of the word `status` is:
        //
        //   15                         8   7                     0
        //    +-------------------------+---+---------------------+
        //    |        exit_code        | c |       sig_no        |
        //    +-------------------------+---+---------------------+
        //
        // If `status[6:0]` is nonzero, the task is being killed by `sig_no`, and a set
        // `status[7]` bit flags a core dump. Otherwise it is a normal exit with exit code
        // `status[15:8]`.
        let sig_no = i32::from(status & 0x7f);

        if sig_no == 0 {
            ExitStatus::Code(i32::from(status >> 8))
        } else {
            let core_dumped = status & 0x80 != 0;
            ExitStatus::Signaled { signal: sig_no, core_dumped }
        }
    }
}

/// Decides the [`Event`] of a raw `wait(2)` status.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Classifier {
    detect_group_stop: bool,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether stops by `SIGSTOP`, `SIGTSTP`, `SIGTTIN` and `SIGTTOU` are
    /// examined for group-stops. This costs a `PTRACE_GETSIGINFO` per such stop.
    ///
    /// Defaults to `false`.
    pub fn detect_group_stop(mut self, detect: bool) -> Self {
        self.detect_group_stop = detect;
        self
    }

    /// Classify `status`, as returned by `wait(2)` for `pid`.
    ///
    /// The only requests made to the kernel are `PTRACE_GETEVENTMSG` for ptrace-event
    /// stops, and `PTRACE_GETSIGINFO` for possible group-stops when enabled.
    pub fn classify(&self, pid: Pid, status: i32) -> Result<Event> {
        self.classify_with(pid, status, fetch_event_message)
    }

    /// Like [`Classifier::classify()`], with a caller-supplied event message source.
    pub fn classify_with<F>(&self, pid: Pid, status: i32, event_message: F) -> Result<Event>
    where
        F: FnOnce(Pid) -> Result<u64>,
    {
        let event = if libc::WIFEXITED(status) {
            Event::Exited { code: libc::WEXITSTATUS(status) }
        } else if libc::WIFSIGNALED(status) {
            Event::Terminated {
                signal: libc::WTERMSIG(status),
                core_dumped: libc::WCOREDUMP(status),
            }
        } else if libc::WIFSTOPPED(status) {
            let sig = libc::WSTOPSIG(status);

            if sig == libc::SIGTRAP | SYSGOOD_BIT {
                Event::SyscallStop
            } else if sig == libc::SIGTRAP {
                match status >> 16 {
                    0 => Event::GenuineTrap,
                    code => ptrace_event(pid, code, status, event_message)?,
                }
            } else if self.detect_group_stop && is_group_stop(pid, sig)? {
                Event::GroupStop { signal: sig }
            } else {
                Event::GenuineSignal { signal: sig }
            }
        } else {
            Event::Unknown { status }
        };

        trace!(pid = pid.as_raw(), status, %event, "classified wait status");

        Ok(event)
    }
}

/// Classify `status` without group-stop detection.
pub fn classify(pid: Pid, status: i32) -> Result<Event> {
    Classifier::new().classify(pid, status)
}

/// Fetch the message of the last ptrace-event-stop, as `PTRACE_GETEVENTMSG`.
pub fn fetch_event_message(pid: Pid) -> Result<u64> {
    let msg = ptrace::getevent(pid).died_if_esrch(pid)?;

    Ok(msg as u64)
}

fn ptrace_event<F>(pid: Pid, code: i32, status: i32, event_message: F) -> Result<Event>
where
    F: FnOnce(Pid) -> Result<u64>,
{
    // Messages carrying a task ID are a `pid_t` widened to `unsigned long`.
    let to_pid = |msg: u64| Pid::from_raw(msg as u32 as i32);

    let event = match code {
        libc::PTRACE_EVENT_FORK => Event::Forked { child: to_pid(event_message(pid)?) },
        libc::PTRACE_EVENT_VFORK => Event::VForked { child: to_pid(event_message(pid)?) },
        libc::PTRACE_EVENT_CLONE => Event::Cloned { child: to_pid(event_message(pid)?) },
        libc::PTRACE_EVENT_VFORK_DONE => Event::VForkDone { child: to_pid(event_message(pid)?) },
        libc::PTRACE_EVENT_EXEC => Event::Execd { old: to_pid(event_message(pid)?) },
        libc::PTRACE_EVENT_EXIT => {
            // Only the low 16-bit word of the pending wait status is meaningful.
            let status = event_message(pid)? as u16;
            Event::ExitIntent { status: ExitStatus::parse(status) }
        },
        _ => Event::Unknown { status },
    };

    Ok(event)
}

// Check if a stop with a stopping signal is a group-stop.
//
// From the manual:
//
//     If PTRACE_GETSIGINFO fails with EINVAL, then it is definitely a
//     group-stop.  (Other failure codes are possible, such as ESRCH
//     ("no such process") if a SIGKILL killed the tracee.)
//
fn is_group_stop(pid: Pid, sig: i32) -> Result<bool> {
    match sig {
        libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU => {
            match ptrace::getsiginfo(pid) {
                Err(Errno::EINVAL) => Ok(true),
                Err(err) => Err(err).died_if_esrch(pid),
                Ok(_) => Ok(false),
            }
        },
        _ => Ok(false),
    }
}
