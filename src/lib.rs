//! ABI-aware register, memory and event access for `ptrace(2)` tracers.
//!
//! A [`Tracee`] caches the registers of one stopped task and the [`Abi`] they imply.
//! Syscall accessors and memory transfers go through that cache, so reads and writes
//! use the layout and word width of the tracee rather than of the tracer. Wait statuses
//! are turned into [`Event`]s by a [`Classifier`], and a [`Context`] dispatches them to
//! per-kind handlers.
//!
//! Nothing here resumes a tracee on its own. See [`trace`] for the process control
//! requests a driving loop uses.

pub mod abi;
pub mod context;
pub mod error;
pub mod event;
pub mod memory;
pub mod syscall;
pub mod syscalls;
pub mod trace;
pub mod tracee;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "x86_64")]
pub mod x86;

pub use abi::{Abi, Bitness, Registers};
pub use context::{Context, EventKind, Flow, Handlers};
pub use error::Error;
pub use event::{Classifier, Event, ExitStatus};
pub use memory::RemoteString;
pub use nix::sys::signal::Signal;
pub use syscall::Return;
pub use trace::{Restart, TraceOptions};
pub use tracee::{Pid, Tracee};
