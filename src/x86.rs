use memoffset::offset_of;
use nix::sys::ptrace;

use crate::abi::{Abi, Arch};
use crate::error::{internal_error, Result, ResultExt};
use crate::tracee::Pid;

/// Code segment selector of a task in 64-bit mode.
const CS_64: u64 = 0x33;

/// Code segment selector of a task in 32-bit compat mode.
const CS_32: u64 = 0x23;

/// Flag marking an x32 syscall number in `orig_rax`.
pub const X32_SYSCALL_BIT: u64 = 0x4000_0000;

/// x86_64 kernel: native, i386 compat and x32 tracees.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum X86 {}

/// Offsets of the registers used by syscalls, in the virtual `user` area.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Reg {
    Rax,
    OrigRax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    R8,
    R9,
    R10,
}

impl Reg {
    // `user_regs_struct` sits at the start of `struct user`.
    fn user_offset(self) -> u64 {
        let off = match self {
            Reg::Rax => offset_of!(libc::user_regs_struct, rax),
            Reg::OrigRax => offset_of!(libc::user_regs_struct, orig_rax),
            Reg::Rbx => offset_of!(libc::user_regs_struct, rbx),
            Reg::Rcx => offset_of!(libc::user_regs_struct, rcx),
            Reg::Rdx => offset_of!(libc::user_regs_struct, rdx),
            Reg::Rsi => offset_of!(libc::user_regs_struct, rsi),
            Reg::Rdi => offset_of!(libc::user_regs_struct, rdi),
            Reg::Rbp => offset_of!(libc::user_regs_struct, rbp),
            Reg::R8 => offset_of!(libc::user_regs_struct, r8),
            Reg::R9 => offset_of!(libc::user_regs_struct, r9),
            Reg::R10 => offset_of!(libc::user_regs_struct, r10),
        };

        off as u64
    }

    fn get(self, regs: &libc::user_regs_struct) -> u64 {
        match self {
            Reg::Rax => regs.rax,
            Reg::OrigRax => regs.orig_rax,
            Reg::Rbx => regs.rbx,
            Reg::Rcx => regs.rcx,
            Reg::Rdx => regs.rdx,
            Reg::Rsi => regs.rsi,
            Reg::Rdi => regs.rdi,
            Reg::Rbp => regs.rbp,
            Reg::R8 => regs.r8,
            Reg::R9 => regs.r9,
            Reg::R10 => regs.r10,
        }
    }

    fn set(self, regs: &mut libc::user_regs_struct, value: u64) {
        let slot = match self {
            Reg::Rax => &mut regs.rax,
            Reg::OrigRax => &mut regs.orig_rax,
            Reg::Rbx => &mut regs.rbx,
            Reg::Rcx => &mut regs.rcx,
            Reg::Rdx => &mut regs.rdx,
            Reg::Rsi => &mut regs.rsi,
            Reg::Rdi => &mut regs.rdi,
            Reg::Rbp => &mut regs.rbp,
            Reg::R8 => &mut regs.r8,
            Reg::R9 => &mut regs.r9,
            Reg::R10 => &mut regs.r10,
        };

        *slot = value;
    }
}

const ARGS_64: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::R10, Reg::R8, Reg::R9];
const ARGS_32: [Reg; 6] = [Reg::Rbx, Reg::Rcx, Reg::Rdx, Reg::Rsi, Reg::Rdi, Reg::Rbp];

fn argument_reg(abi: Abi, index: usize) -> Option<Reg> {
    match abi {
        Abi::I386 => ARGS_32.get(index).copied(),
        _ => ARGS_64.get(index).copied(),
    }
}

// Compat tasks keep 32-bit values in 64-bit slots; sign-extend so that e.g. a
// syscall number of -1 still reads as -1 to the kernel.
fn widen(abi: Abi, value: u64) -> u64 {
    abi.sign_extend(value) as u64
}

fn poke_user(pid: Pid, regs: &mut libc::user_regs_struct, reg: Reg, value: u64) -> Result<()> {
    let off = reg.user_offset();

    // SAFETY: `off` is an in-bounds offset into the `user` area, and the kernel treats
    // `data` as a plain word, never dereferencing it.
    let res = unsafe {
        ptrace::write_user(pid, off as ptrace::AddressType, value as *mut libc::c_void)
    };
    res.died_if_esrch(pid)?;

    reg.set(regs, value);

    Ok(())
}

impl Arch for X86 {
    type Registers = libc::user_regs_struct;

    const NATIVE_ABI: Abi = Abi::X86_64;
    const SUPPORTED_ABIS: &'static [Abi] = &[Abi::X86_64, Abi::I386, Abi::X32];

    fn fetch_registers(pid: Pid) -> Result<Self::Registers> {
        ptrace::getregs(pid).died_if_esrch(pid)
    }

    fn store_registers(pid: Pid, regs: &Self::Registers) -> Result<()> {
        ptrace::setregs(pid, *regs).died_if_esrch(pid)
    }

    fn resolve(regs: &Self::Registers) -> Option<Abi> {
        match regs.cs {
            CS_64 if regs.orig_rax & X32_SYSCALL_BIT != 0 && regs.orig_rax != u64::MAX => Some(Abi::X32),
            CS_64 => Some(Abi::X86_64),
            CS_32 => Some(Abi::I386),
            _ => None,
        }
    }

    fn syscall_number(regs: &Self::Registers, _abi: Abi) -> u64 {
        regs.orig_rax
    }

    fn argument(regs: &Self::Registers, abi: Abi, index: usize) -> u64 {
        argument_reg(abi, index).map_or(0, |reg| reg.get(regs))
    }

    fn return_value(regs: &Self::Registers, _abi: Abi) -> u64 {
        regs.rax
    }

    fn write_syscall_number(pid: Pid, regs: &mut Self::Registers, abi: Abi, value: u64) -> Result<()> {
        poke_user(pid, regs, Reg::OrigRax, widen(abi, value))
    }

    fn write_argument(pid: Pid, regs: &mut Self::Registers, abi: Abi, index: usize, value: u64) -> Result<()> {
        match argument_reg(abi, index) {
            Some(reg) => poke_user(pid, regs, reg, value),
            None => internal_error!("argument index unchecked by caller"),
        }
    }

    fn write_return_value(pid: Pid, regs: &mut Self::Registers, abi: Abi, value: u64) -> Result<()> {
        poke_user(pid, regs, Reg::Rax, widen(abi, value))
    }
}
