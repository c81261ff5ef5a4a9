use std::io;

use nix::errno::Errno;

use crate::context::EventKind;
use crate::tracee::Pid;


pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by a failing event callback.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not determine the syscall ABI of tracee = {pid}")]
    UnknownAbi { pid: Pid },

    #[error("No register snapshot for tracee = {pid}, refresh it at the current stop first")]
    StaleState { pid: Pid },

    #[error("Index {index} is out of range (limit = {max})")]
    OutOfRange { index: usize, max: usize },

    #[error("Bad address {addr:#x} in tracee = {pid}")]
    AddressFault { pid: Pid, addr: u64 },

    #[error("No memory transfer mechanism is available for tracee = {pid}")]
    Unsupported { pid: Pid },

    #[error("Tracee = {pid} is gone or not stopped")]
    ProcessGone { pid: Pid, source: nix::Error },

    #[error("Transferred {transferred} of {requested} bytes at {addr:#x} in tracee = {pid}")]
    PartialTransfer {
        pid: Pid,
        addr: u64,
        requested: usize,
        transferred: usize,
    },

    #[error("Error handlers are registered with on_error(), not as event handlers")]
    ErrorKindHandler,

    #[error("Callback for {kind} events failed")]
    Callback {
        kind: EventKind,
        source: CallbackError,
    },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the tracee vanished or left its ptrace-stop.
    pub fn process_gone(&self) -> bool {
        matches!(self, Error::ProcessGone { .. })
    }

    /// Number of bytes moved before a transfer stopped short, if this is a partial transfer.
    pub fn transferred(&self) -> Option<usize> {
        if let Error::PartialTransfer { transferred, .. } = self {
            Some(*transferred)
        } else {
            None
        }
    }
}

pub(crate) trait ResultExt<T> {
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, nix::Error> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::ProcessGone { pid, source }
            } else {
                Error::OS(source)
            }
        })
    }
}

pub(crate) trait MemoryResultExt<T> {
    /// Like [`ResultExt::died_if_esrch`], but also maps the errno values a memory
    /// access reports for unmapped or protected pages.
    fn faulted_at(self, pid: Pid, addr: u64) -> Result<T>;
}

impl<T> MemoryResultExt<T> for std::result::Result<T, nix::Error> {
    fn faulted_at(self, pid: Pid, addr: u64) -> Result<T> {
        self.map_err(|source| match source {
            Errno::EFAULT | Errno::EIO => Error::AddressFault { pid, addr },
            Errno::ESRCH => Error::ProcessGone { pid, source },
            _ => Error::OS(source),
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}

pub(crate) use internal_error;
