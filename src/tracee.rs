//! Per-tracee register cache.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use tracing::{debug, trace};

use crate::abi::{Abi, Arch, Bitness, Native, Registers};
use crate::error::{Error, Result};

pub use nix::unistd::Pid;

thread_local! {
    // Resumes issued by this thread, per tracee. Ptrace requests are per-thread, so a
    // tracee can only be resumed by the thread that owns its snapshot.
    static RESUMES: RefCell<HashMap<Pid, u64>> = RefCell::new(HashMap::new());
}

/// Record that `pid` was resumed (or detached, or killed) by this thread.
///
/// Every snapshot taken before the call is stale afterwards.
pub(crate) fn resumed(pid: Pid) {
    RESUMES.with(|resumes| *resumes.borrow_mut().entry(pid).or_insert(0) += 1);
}

fn generation(pid: Pid) -> u64 {
    RESUMES.with(|resumes| resumes.borrow().get(&pid).copied().unwrap_or(0))
}

/// Cached register state of one stopped tracee.
///
/// The snapshot is only coherent with the kernel between the stop that produced it and
/// the next restart of the tracee. Nothing refreshes it implicitly: call
/// [`Tracee::refresh()`] once per stop, before any stop-dependent read.
///
/// Any resume of the tracee through this crate, by [`Tracee::restart()`] or by the
/// pid-level functions in [`trace`](crate::trace), makes the snapshot stale.
///
/// A `Tracee` is owned by the thread tracing it, and is neither `Send` nor `Sync`:
/// ptrace requests are only honored when made by that thread.
#[derive(Clone)]
pub struct Tracee {
    pid: Pid,
    snapshot: Option<Snapshot>,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

#[derive(Clone)]
pub(crate) struct Snapshot {
    pub(crate) regs: Registers,
    pub(crate) abi: Abi,
    generation: u64,
}

impl Tracee {
    /// Begin tracking `pid`. No kernel request is made until the first refresh.
    pub fn new(pid: Pid) -> Self {
        let _not_send = PhantomData;

        Self { pid, snapshot: None, _not_send }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Fetch the current registers and re-resolve the ABI.
    ///
    /// On failure the previous snapshot, if any, is left untouched.
    pub fn refresh(&mut self) -> Result<()> {
        let regs = Native::fetch_registers(self.pid)?;
        let abi = Native::resolve(&regs).ok_or(Error::UnknownAbi { pid: self.pid })?;

        match &self.snapshot {
            Some(old) if old.abi != abi => {
                debug!(pid = self.pid.as_raw(), from = %old.abi, to = %abi, "tracee changed ABI");
            },
            _ => {
                trace!(pid = self.pid.as_raw(), %abi, "refreshed registers");
            },
        }

        let generation = generation(self.pid);
        self.snapshot = Some(Snapshot { regs, abi, generation });

        Ok(())
    }

    /// Drop the cached snapshot, e.g. before restarting the tracee.
    pub fn invalidate(&mut self) {
        self.snapshot = None;
    }

    pub fn is_fresh(&self) -> bool {
        self.snapshot().is_ok()
    }

    /// ABI resolved at the last refresh.
    pub fn abi(&self) -> Result<Abi> {
        Ok(self.snapshot()?.abi)
    }

    pub fn bitness(&self) -> Result<Bitness> {
        Ok(self.abi()?.bitness())
    }

    /// Last fetched register snapshot.
    pub fn registers(&self) -> Result<&Registers> {
        Ok(&self.snapshot()?.regs)
    }

    /// Replace the tracee's registers wholesale, and the snapshot with them.
    ///
    /// Like every stop-dependent access, this needs a fresh snapshot.
    pub fn set_registers(&mut self, regs: Registers) -> Result<()> {
        let abi = Native::resolve(&regs).ok_or(Error::UnknownAbi { pid: self.pid })?;
        self.snapshot()?;
        Native::store_registers(self.pid, &regs)?;

        let generation = generation(self.pid);
        self.snapshot = Some(Snapshot { regs, abi, generation });

        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Result<&Snapshot> {
        let current = generation(self.pid);

        match &self.snapshot {
            Some(snapshot) if snapshot.generation == current => Ok(snapshot),
            _ => Err(Error::StaleState { pid: self.pid }),
        }
    }

    pub(crate) fn snapshot_mut(&mut self) -> Result<&mut Snapshot> {
        let pid = self.pid;
        let current = generation(pid);

        match &mut self.snapshot {
            Some(snapshot) if snapshot.generation == current => Ok(snapshot),
            _ => Err(Error::StaleState { pid }),
        }
    }
}

impl fmt::Debug for Tracee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracee")
            .field("pid", &self.pid)
            .field("abi", &self.snapshot.as_ref().map(|s| s.abi))
            .finish()
    }
}
