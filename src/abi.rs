//! Syscall ABIs, and the per-target register layout that decides between them.
//!
//! A tracee's ABI is a property of one stop, not of the process: a 64-bit process can
//! issue a 32-bit compat syscall, and an `execve()` can swap the whole personality. The
//! [`Tracee`](crate::Tracee) cache therefore resolves it again on every refresh.

use std::fmt;
use std::str::FromStr;

use crate::error::Result;
use crate::tracee::Pid;

/// Upper bound on syscall arguments for every supported ABI.
pub const MAX_ARGS: usize = 6;

/// Syscall ABI of a stopped tracee: architecture, word width and calling convention.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Abi {
    /// 64-bit x86, `syscall` instruction.
    X86_64,

    /// 32-bit x86 compat mode under a 64-bit kernel.
    I386,

    /// x32: 64-bit registers, 32-bit pointers.
    X32,

    /// 64-bit Arm.
    Aarch64,

    /// 32-bit Arm EABI compat mode under a 64-bit kernel.
    Arm,
}

/// Machine word width of an ABI.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Bitness {
    ThirtyTwo,
    SixtyFour,
}

impl Bitness {
    pub fn bits(self) -> u32 {
        match self {
            Bitness::ThirtyTwo => 32,
            Bitness::SixtyFour => 64,
        }
    }
}

impl Abi {
    pub const ALL: [Abi; 5] = [Abi::X86_64, Abi::I386, Abi::X32, Abi::Aarch64, Abi::Arm];

    /// ABI of a process running natively on the build target.
    pub fn native() -> Abi {
        Native::NATIVE_ABI
    }

    /// ABIs a tracee may use on the build target.
    pub fn supported() -> &'static [Abi] {
        Native::SUPPORTED_ABIS
    }

    pub fn name(self) -> &'static str {
        match self {
            Abi::X86_64 => "x86_64",
            Abi::I386 => "i386",
            Abi::X32 => "x32",
            Abi::Aarch64 => "aarch64",
            Abi::Arm => "arm",
        }
    }

    /// Width of a pointer in the tracee's address space.
    pub fn bitness(self) -> Bitness {
        match self {
            Abi::X86_64 | Abi::Aarch64 => Bitness::SixtyFour,
            Abi::I386 | Abi::X32 | Abi::Arm => Bitness::ThirtyTwo,
        }
    }

    /// Size of a tracee pointer, in bytes.
    pub fn word_size(self) -> usize {
        (self.bitness().bits() / 8) as usize
    }

    pub fn max_args(self) -> usize {
        MAX_ARGS
    }

    /// Width of the registers carrying syscall arguments and return values.
    ///
    /// This differs from [`Abi::bitness()`] for x32, which passes 64-bit values.
    pub fn register_bitness(self) -> Bitness {
        match self {
            Abi::X86_64 | Abi::X32 | Abi::Aarch64 => Bitness::SixtyFour,
            Abi::I386 | Abi::Arm => Bitness::ThirtyTwo,
        }
    }

    /// Interpret a raw register as a signed machine word of this ABI.
    pub fn sign_extend(self, raw: u64) -> i64 {
        match self.register_bitness() {
            Bitness::SixtyFour => raw as i64,
            Bitness::ThirtyTwo => raw as u32 as i32 as i64,
        }
    }

    /// Narrow a signed value to the register width of this ABI.
    pub fn truncate(self, value: i64) -> u64 {
        match self.register_bitness() {
            Bitness::SixtyFour => value as u64,
            Bitness::ThirtyTwo => value as u32 as u64,
        }
    }

    /// Decode a pointer-sized little-endian word read from tracee memory.
    pub fn decode_pointer(self, bytes: &[u8]) -> Option<u64> {
        match self.bitness() {
            Bitness::SixtyFour => {
                let mut word = [0; 8];
                word.copy_from_slice(bytes.get(..8)?);
                Some(u64::from_le_bytes(word))
            },
            Bitness::ThirtyTwo => {
                let mut word = [0; 4];
                word.copy_from_slice(bytes.get(..4)?);
                Some(u64::from(u32::from_le_bytes(word)))
            },
        }
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unknown ABI name: {0}")]
pub struct ParseAbiError(String);

impl FromStr for Abi {
    type Err = ParseAbiError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Abi::ALL
            .iter()
            .copied()
            .find(|abi| abi.name() == s)
            .ok_or_else(|| ParseAbiError(s.to_owned()))
    }
}

/// Register layout and syscall calling conventions of one build target.
///
/// Exactly one implementation exists per supported `target_arch`, selected as [`Native`].
/// All register values cross this interface as raw, zero-extended `u64`s; the
/// [`Abi`] width helpers give them meaning.
pub trait Arch {
    /// Raw register snapshot as delivered by the kernel.
    type Registers: Clone;

    const NATIVE_ABI: Abi;
    const SUPPORTED_ABIS: &'static [Abi];

    fn fetch_registers(pid: Pid) -> Result<Self::Registers>;

    fn store_registers(pid: Pid, regs: &Self::Registers) -> Result<()>;

    /// Decide which ABI `regs` were captured under, or `None` if the layout is
    /// unrecognized.
    fn resolve(regs: &Self::Registers) -> Option<Abi>;

    fn syscall_number(regs: &Self::Registers, abi: Abi) -> u64;

    fn argument(regs: &Self::Registers, abi: Abi, index: usize) -> u64;

    fn return_value(regs: &Self::Registers, abi: Abi) -> u64;

    /// Change the syscall number in the kernel, then in `regs`.
    fn write_syscall_number(pid: Pid, regs: &mut Self::Registers, abi: Abi, value: u64) -> Result<()>;

    /// Change one argument register in the kernel, then in `regs`.
    fn write_argument(pid: Pid, regs: &mut Self::Registers, abi: Abi, index: usize, value: u64) -> Result<()>;

    /// Change the return value register in the kernel, then in `regs`.
    fn write_return_value(pid: Pid, regs: &mut Self::Registers, abi: Abi, value: u64) -> Result<()>;
}

#[cfg(target_arch = "x86_64")]
pub type Native = crate::x86::X86;

#[cfg(target_arch = "aarch64")]
pub type Native = crate::aarch64::Aarch64;

/// Register state of a tracee on the build target.
pub type Registers = <Native as Arch>::Registers;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("tether supports only x86_64 and aarch64 targets");
