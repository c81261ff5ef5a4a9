//! Syscall number, argument and return value access on a refreshed [`Tracee`].

use nix::errno::Errno;
use tracing::debug;

use crate::abi::{Arch, Native};
use crate::error::{Error, Result};
use crate::syscalls;
use crate::tracee::Tracee;

/// Largest errno the kernel encodes in a syscall return register.
const MAX_ERRNO: i64 = 4095;

/// Decoded syscall result: `(value, 0)` on success, `(-1, errno)` on failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Return {
    pub value: i64,
    pub errno: i32,
}

impl Return {
    /// Split the raw, sign-extended return register.
    pub fn decode(raw: i64) -> Self {
        if (-MAX_ERRNO..0).contains(&raw) {
            Self { value: -1, errno: -raw as i32 }
        } else {
            Self { value: raw, errno: 0 }
        }
    }

    /// Value the return register must hold to report this result.
    pub fn encode(self) -> i64 {
        if self.errno != 0 {
            -i64::from(self.errno)
        } else {
            self.value
        }
    }

    pub fn is_error(&self) -> bool {
        self.errno != 0
    }

    pub fn errno(&self) -> Option<Errno> {
        if self.is_error() {
            Some(Errno::from_i32(self.errno))
        } else {
            None
        }
    }
}

impl From<Return> for (i64, i32) {
    fn from(ret: Return) -> Self {
        (ret.value, ret.errno)
    }
}

fn check_index(tracee: &Tracee, index: usize) -> Result<()> {
    let max = tracee.abi()?.max_args();

    if index >= max {
        return Err(Error::OutOfRange { index, max });
    }

    Ok(())
}

impl Tracee {
    /// Syscall number at the last refresh.
    pub fn read_syscall_number(&self) -> Result<i64> {
        let snap = self.snapshot()?;
        let raw = Native::syscall_number(&snap.regs, snap.abi);

        Ok(snap.abi.sign_extend(raw))
    }

    /// Name of the current syscall in the table of the resolved ABI.
    pub fn syscall_name(&self) -> Result<Option<&'static str>> {
        let abi = self.abi()?;
        let number = self.read_syscall_number()?;

        Ok(syscalls::lookup_name(number, abi))
    }

    /// Argument `index`, counting from 0.
    pub fn read_argument(&self, index: usize) -> Result<i64> {
        check_index(self, index)?;

        let snap = self.snapshot()?;
        let raw = Native::argument(&snap.regs, snap.abi, index);

        Ok(snap.abi.sign_extend(raw))
    }

    /// All arguments of the current syscall.
    pub fn read_arguments(&self) -> Result<Vec<i64>> {
        let max = self.abi()?.max_args();

        (0..max).map(|i| self.read_argument(i)).collect()
    }

    /// Return value at a syscall-exit-stop, decoded as `(value, errno)`.
    pub fn read_return(&self) -> Result<Return> {
        let snap = self.snapshot()?;
        let raw = Native::return_value(&snap.regs, snap.abi);

        Ok(Return::decode(snap.abi.sign_extend(raw)))
    }

    /// Change the syscall number. Only meaningful at a syscall-entry-stop.
    pub fn write_syscall_number(&mut self, number: i64) -> Result<()> {
        let pid = self.pid();
        let snap = self.snapshot_mut()?;
        let value = snap.abi.truncate(number);

        debug!(pid = pid.as_raw(), number, "writing syscall number");

        Native::write_syscall_number(pid, &mut snap.regs, snap.abi, value)
    }

    /// Change argument `index`. Only meaningful at a syscall-entry-stop.
    pub fn write_argument(&mut self, index: usize, value: i64) -> Result<()> {
        check_index(self, index)?;

        let pid = self.pid();
        let snap = self.snapshot_mut()?;
        let raw = snap.abi.truncate(value);

        debug!(pid = pid.as_raw(), index, value, "writing syscall argument");

        Native::write_argument(pid, &mut snap.regs, snap.abi, index, raw)
    }

    /// Change the syscall result. A nonzero `errno` takes precedence over `value`.
    pub fn write_return(&mut self, value: i64, errno: i32) -> Result<()> {
        let pid = self.pid();
        let snap = self.snapshot_mut()?;
        let raw = snap.abi.truncate(Return { value, errno }.encode());

        debug!(pid = pid.as_raw(), value, errno, "writing syscall return");

        Native::write_return_value(pid, &mut snap.regs, snap.abi, raw)
    }
}
