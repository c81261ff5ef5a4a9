use std::mem::{self, MaybeUninit};

use nix::errno::Errno;

use crate::abi::{Abi, Arch};
use crate::error::{internal_error, Result, ResultExt};
use crate::tracee::Pid;

/// Defined in `include/uapi/linux/elf.h`.
const NT_PRSTATUS: libc::c_int = 0x1;
const NT_ARM_SYSTEM_CALL: libc::c_int = 0x404;

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct user_pt_regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64
}

/// Register set of a 32-bit compat task, `struct pt_regs` in `arch/arm/include/uapi/asm/ptrace.h`.
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct arm_pt_regs {
    pub uregs: [u32; 18],
}

/// `NT_PRSTATUS` register set, whose layout depends on the personality of the tracee.
#[derive(Clone, Copy, Debug)]
pub enum Registers {
    Aarch64(user_pt_regs),
    Arm(arm_pt_regs),
}

/// r7 carries the syscall number in the Arm EABI.
const ARM_SYSCALL_REG: usize = 7;

/// x8 carries the syscall number on aarch64.
const AARCH64_SYSCALL_REG: usize = 8;

/// aarch64 kernel: native and Arm compat tracees.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Aarch64 {}

fn get_regset(pid: Pid, regset: libc::c_int, iov: &mut libc::iovec) -> Result<()> {
    let res = unsafe {
        libc::ptrace(libc::PTRACE_GETREGSET, pid.as_raw(), regset, iov as *mut _ as *mut libc::c_void)
    };

    Errno::result(res).died_if_esrch(pid)?;

    Ok(())
}

fn set_regset(pid: Pid, regset: libc::c_int, iov: &mut libc::iovec) -> Result<()> {
    let res = unsafe {
        libc::ptrace(libc::PTRACE_SETREGSET, pid.as_raw(), regset, iov as *mut _ as *mut libc::c_void)
    };

    Errno::result(res).died_if_esrch(pid)?;

    Ok(())
}

fn check_index(index: usize) -> Result<()> {
    if index >= crate::abi::MAX_ARGS {
        internal_error!("argument index unchecked by caller");
    }

    Ok(())
}

impl Arch for Aarch64 {
    type Registers = Registers;

    const NATIVE_ABI: Abi = Abi::Aarch64;
    const SUPPORTED_ABIS: &'static [Abi] = &[Abi::Aarch64, Abi::Arm];

    fn fetch_registers(pid: Pid) -> Result<Self::Registers> {
        // The buffer fits the larger, native layout. The kernel shrinks `iov_len` to the
        // size of the set it filled, which tells us the personality.
        let mut data = MaybeUninit::<user_pt_regs>::zeroed();
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: mem::size_of::<user_pt_regs>(),
        };

        get_regset(pid, NT_PRSTATUS, &mut iov)?;

        // SAFETY: zero-initialized, and both layouts are plain integers.
        let data = unsafe { data.assume_init() };

        if iov.iov_len == mem::size_of::<user_pt_regs>() {
            Ok(Registers::Aarch64(data))
        } else if iov.iov_len == mem::size_of::<arm_pt_regs>() {
            // SAFETY: `arm_pt_regs` is a prefix-sized, plain-integer view of the same bytes.
            let arm = unsafe { *(&data as *const user_pt_regs as *const arm_pt_regs) };
            Ok(Registers::Arm(arm))
        } else {
            Err(crate::error::Error::UnknownAbi { pid })
        }
    }

    fn store_registers(pid: Pid, regs: &Self::Registers) -> Result<()> {
        let mut regs = *regs;

        let mut iov = match &mut regs {
            Registers::Aarch64(r) => libc::iovec {
                iov_base: r as *mut _ as *mut libc::c_void,
                iov_len: mem::size_of::<user_pt_regs>(),
            },
            Registers::Arm(r) => libc::iovec {
                iov_base: r as *mut _ as *mut libc::c_void,
                iov_len: mem::size_of::<arm_pt_regs>(),
            },
        };

        set_regset(pid, NT_PRSTATUS, &mut iov)
    }

    fn resolve(regs: &Self::Registers) -> Option<Abi> {
        match regs {
            Registers::Aarch64(_) => Some(Abi::Aarch64),
            Registers::Arm(_) => Some(Abi::Arm),
        }
    }

    fn syscall_number(regs: &Self::Registers, _abi: Abi) -> u64 {
        match regs {
            Registers::Aarch64(r) => r.regs[AARCH64_SYSCALL_REG],
            Registers::Arm(r) => u64::from(r.uregs[ARM_SYSCALL_REG]),
        }
    }

    fn argument(regs: &Self::Registers, _abi: Abi, index: usize) -> u64 {
        match regs {
            Registers::Aarch64(r) => r.regs.get(index).copied().unwrap_or(0),
            Registers::Arm(r) => r.uregs.get(index).copied().map_or(0, u64::from),
        }
    }

    fn return_value(regs: &Self::Registers, _abi: Abi) -> u64 {
        match regs {
            Registers::Aarch64(r) => r.regs[0],
            Registers::Arm(r) => u64::from(r.uregs[0]),
        }
    }

    fn write_syscall_number(pid: Pid, regs: &mut Self::Registers, _abi: Abi, value: u64) -> Result<()> {
        // Changing x8/r7 has no effect once the kernel latched the number on entry.
        let mut nr = value as i32;
        let mut iov = libc::iovec {
            iov_base: &mut nr as *mut i32 as *mut libc::c_void,
            iov_len: mem::size_of::<i32>(),
        };

        set_regset(pid, NT_ARM_SYSTEM_CALL, &mut iov)?;

        match regs {
            Registers::Aarch64(r) => r.regs[AARCH64_SYSCALL_REG] = value,
            Registers::Arm(r) => r.uregs[ARM_SYSCALL_REG] = value as u32,
        }

        Ok(())
    }

    fn write_argument(pid: Pid, regs: &mut Self::Registers, _abi: Abi, index: usize, value: u64) -> Result<()> {
        check_index(index)?;

        let mut updated = *regs;
        match &mut updated {
            Registers::Aarch64(r) => r.regs[index] = value,
            Registers::Arm(r) => r.uregs[index] = value as u32,
        }

        Self::store_registers(pid, &updated)?;
        *regs = updated;

        Ok(())
    }

    fn write_return_value(pid: Pid, regs: &mut Self::Registers, _abi: Abi, value: u64) -> Result<()> {
        let mut updated = *regs;
        match &mut updated {
            Registers::Aarch64(r) => r.regs[0] = value,
            Registers::Arm(r) => r.uregs[0] = value as u32,
        }

        Self::store_registers(pid, &updated)?;
        *regs = updated;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compat_layout_size() {
        assert_eq!(mem::size_of::<arm_pt_regs>(), 72);
        assert_eq!(mem::size_of::<user_pt_regs>(), 34 * 8);
    }

    #[test]
    fn test_resolve_by_layout() {
        let native = Registers::Aarch64(user_pt_regs { regs: [0; 31], sp: 0, pc: 0, pstate: 0 });
        let compat = Registers::Arm(arm_pt_regs { uregs: [0; 18] });

        assert_eq!(Aarch64::resolve(&native), Some(Abi::Aarch64));
        assert_eq!(Aarch64::resolve(&compat), Some(Abi::Arm));
    }

    #[test]
    fn test_syscall_registers() {
        let mut uregs = [0; 18];
        uregs[0] = 0xffff_fff2;
        uregs[1] = 0xbad;
        uregs[7] = 20;
        let compat = Registers::Arm(arm_pt_regs { uregs });

        assert_eq!(Aarch64::syscall_number(&compat, Abi::Arm), 20);
        assert_eq!(Aarch64::argument(&compat, Abi::Arm, 1), 0xbad);
        assert_eq!(Abi::Arm.sign_extend(Aarch64::return_value(&compat, Abi::Arm)), -14);
    }
}
