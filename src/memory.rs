//! Reading and writing tracee memory.
//!
//! Bulk transfers use `process_vm_readv(2)`/`process_vm_writev(2)`. When the kernel
//! lacks them (`ENOSYS`), the same call falls back to word-at-a-time
//! `PTRACE_PEEKDATA`/`PTRACE_POKEDATA`. Callers see byte-granular, unaligned
//! semantics either way.

use std::borrow::Cow;
use std::io::{IoSlice, IoSliceMut};
use std::mem;

use lazy_static::lazy_static;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::uio::{self, RemoteIoVec};
use nix::unistd::{sysconf, SysconfVar};
use tracing::trace;

use crate::error::{internal_error, Error, MemoryResultExt, Result};
use crate::tracee::{Pid, Tracee};

/// Width of one `PTRACE_PEEKDATA` transfer: a tracer `long`.
const WORD_SIZE: usize = mem::size_of::<libc::c_long>();

/// Remote iovecs per `process_vm_*` call (`UIO_MAXIOV`).
const IOV_MAX: usize = 1024;

const FALLBACK_PAGE_SIZE: usize = 4096;

lazy_static! {
    static ref PAGE_SIZE: usize = match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    };
}

fn page_size() -> usize {
    *PAGE_SIZE
}

/// Split `[addr, addr + len)` into iovecs that never cross a page.
///
/// The kernel only reports partial transfers at iovec granularity, so one iovec per
/// page lets a short transfer stop exactly at the first inaccessible page.
fn page_iovecs(addr: u64, len: usize) -> Vec<RemoteIoVec> {
    let page = page_size();
    let mut iovs = vec![];
    let mut base = addr as usize;
    let mut left = len;

    while left > 0 {
        let in_page = page - (base & (page - 1));
        let chunk = in_page.min(left);

        iovs.push(RemoteIoVec { base, len: chunk });

        base = base.wrapping_add(chunk);
        left -= chunk;
    }

    iovs
}

fn check_span(addr: u64, len: usize) -> Result<()> {
    let end = (addr as usize).checked_add(len);

    if end.is_none() {
        return Err(Error::OutOfRange { index: len, max: usize::MAX - addr as usize });
    }

    Ok(())
}

/// Read a tracer word from tracee memory, as `PTRACE_PEEKDATA`.
pub fn peek_word(pid: Pid, addr: u64) -> Result<u64> {
    let word = ptrace::read(pid, addr as ptrace::AddressType)
        .faulted_at(pid, addr)?;

    Ok(word as u64)
}

/// Write a tracer word to tracee memory, as `PTRACE_POKEDATA`.
pub fn poke_word(pid: Pid, addr: u64, word: u64) -> Result<()> {
    // SAFETY: `POKEDATA` passes `data` by value; the kernel never dereferences it.
    let res = unsafe {
        ptrace::write(pid, addr as ptrace::AddressType, word as *mut libc::c_void)
    };

    res.faulted_at(pid, addr)
}

// `faulted_at()` passes `ENOSYS` along as `OS`.
fn is_enosys(err: &Error) -> bool {
    matches!(err, Error::OS(Errno::ENOSYS))
}

/// Read tracee memory with `process_vm_readv(2)` only.
///
/// Returns the number of bytes read, which is short if an inaccessible page was hit
/// after some progress. Fails with [`Error::Unsupported`] if the kernel lacks the call.
pub fn read_vm(pid: Pid, addr: u64, buf: &mut [u8]) -> Result<usize> {
    check_span(addr, buf.len())?;

    let iovs = page_iovecs(addr, buf.len());
    let mut total = 0;

    for batch in iovs.chunks(IOV_MAX) {
        let want: usize = batch.iter().map(|iov| iov.len).sum();
        let local = &mut buf[total..total + want];

        let res = uio::process_vm_readv(pid, &mut [IoSliceMut::new(local)], batch);

        match res {
            Ok(n) => {
                total += n;

                if n < want {
                    trace!(pid = pid.as_raw(), addr, total, "short process_vm_readv");
                    break;
                }
            },
            Err(Errno::ENOSYS) => return Err(Error::Unsupported { pid }),
            Err(err) if total == 0 => return Err(err).faulted_at(pid, addr),
            Err(err) => {
                trace!(pid = pid.as_raw(), addr, total, %err, "process_vm_readv stopped");
                break;
            },
        }
    }

    Ok(total)
}

/// Read tracee memory one `PTRACE_PEEKDATA` word at a time.
pub fn read_words(pid: Pid, addr: u64, buf: &mut [u8]) -> Result<usize> {
    check_span(addr, buf.len())?;

    let mut total = 0;

    while total < buf.len() {
        let cur = addr + total as u64;
        let offset = (cur as usize) % WORD_SIZE;
        let aligned = cur - offset as u64;

        let word = match peek_word(pid, aligned) {
            Ok(word) => word,
            Err(err) if is_enosys(&err) => return Err(Error::Unsupported { pid }),
            Err(err) if total == 0 => return Err(err),
            Err(err) => {
                trace!(pid = pid.as_raw(), addr, total, %err, "word read stopped");
                break;
            },
        };

        let bytes = word.to_ne_bytes();
        let n = (WORD_SIZE - offset).min(buf.len() - total);
        buf[total..total + n].copy_from_slice(&bytes[offset..offset + n]);
        total += n;
    }

    Ok(total)
}

/// Write tracee memory with `process_vm_writev(2)` only.
///
/// Like `process_vm_writev(2)` itself, this cannot write to read-only mappings.
pub fn write_vm(pid: Pid, addr: u64, data: &[u8]) -> Result<usize> {
    check_span(addr, data.len())?;

    let iovs = page_iovecs(addr, data.len());
    let mut total = 0;

    for batch in iovs.chunks(IOV_MAX) {
        let want: usize = batch.iter().map(|iov| iov.len).sum();
        let local = &data[total..total + want];

        let res = uio::process_vm_writev(pid, &[IoSlice::new(local)], batch);

        match res {
            Ok(n) => {
                total += n;

                if n < want {
                    trace!(pid = pid.as_raw(), addr, total, "short process_vm_writev");
                    break;
                }
            },
            Err(Errno::ENOSYS) => return Err(Error::Unsupported { pid }),
            Err(err) if total == 0 => return Err(err).faulted_at(pid, addr),
            Err(err) => {
                trace!(pid = pid.as_raw(), addr, total, %err, "process_vm_writev stopped");
                break;
            },
        }
    }

    Ok(total)
}

/// Write tracee memory one `PTRACE_POKEDATA` word at a time.
///
/// Unaligned edges are merged into the existing words with a read-modify-write.
pub fn write_words(pid: Pid, addr: u64, data: &[u8]) -> Result<usize> {
    check_span(addr, data.len())?;

    let mut total = 0;

    while total < data.len() {
        let cur = addr + total as u64;
        let offset = (cur as usize) % WORD_SIZE;
        let aligned = cur - offset as u64;
        let n = (WORD_SIZE - offset).min(data.len() - total);

        let res = if n == WORD_SIZE {
            let mut bytes = [0; WORD_SIZE];
            bytes.copy_from_slice(&data[total..total + n]);
            poke_word(pid, aligned, u64::from_ne_bytes(bytes))
        } else {
            peek_word(pid, aligned).and_then(|word| {
                let mut bytes = word.to_ne_bytes();
                bytes[offset..offset + n].copy_from_slice(&data[total..total + n]);
                poke_word(pid, aligned, u64::from_ne_bytes(bytes))
            })
        };

        match res {
            Ok(()) => total += n,
            Err(err) if is_enosys(&err) => return Err(Error::Unsupported { pid }),
            Err(err) if total == 0 => return Err(err),
            Err(err) => {
                trace!(pid = pid.as_raw(), addr, total, %err, "word write stopped");
                break;
            },
        }
    }

    Ok(total)
}

/// Read with the bulk mechanism, falling back to words if it is unavailable.
pub fn read(pid: Pid, addr: u64, buf: &mut [u8]) -> Result<usize> {
    read_with(pid, addr, buf, read_vm, read_words)
}

/// Write with the bulk mechanism, falling back to words if it is unavailable.
pub fn write(pid: Pid, addr: u64, data: &[u8]) -> Result<usize> {
    write_with(pid, addr, data, write_vm, write_words)
}

fn read_with<V, W>(pid: Pid, addr: u64, buf: &mut [u8], vm: V, words: W) -> Result<usize>
where
    V: FnOnce(Pid, u64, &mut [u8]) -> Result<usize>,
    W: FnOnce(Pid, u64, &mut [u8]) -> Result<usize>,
{
    match vm(pid, addr, buf) {
        Err(Error::Unsupported { .. }) => {
            trace!(pid = pid.as_raw(), addr, len = buf.len(), "process_vm_readv unsupported, reading words");
            words(pid, addr, buf)
        },
        res => res,
    }
}

fn write_with<V, W>(pid: Pid, addr: u64, data: &[u8], vm: V, words: W) -> Result<usize>
where
    V: FnOnce(Pid, u64, &[u8]) -> Result<usize>,
    W: FnOnce(Pid, u64, &[u8]) -> Result<usize>,
{
    match vm(pid, addr, data) {
        Err(Error::Unsupported { .. }) => {
            trace!(pid = pid.as_raw(), addr, len = data.len(), "process_vm_writev unsupported, writing words");
            words(pid, addr, data)
        },
        res => res,
    }
}

/// A string copied out of tracee memory.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteString {
    bytes: Vec<u8>,
    terminated: bool,
}

impl RemoteString {
    /// Bytes before the terminator, or before the read limit.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// True if a NUL was found within the read limit.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

impl Tracee {
    /// Read up to `buf.len()` bytes at `addr`, returning the count read.
    ///
    /// A short count means an inaccessible page was reached after some progress.
    pub fn read_block_into(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        self.snapshot()?;

        let n = read(self.pid(), addr, buf)?;

        if n == 0 && !buf.is_empty() {
            return Err(Error::AddressFault { pid: self.pid(), addr });
        }

        Ok(n)
    }

    /// Read exactly `len` bytes at `addr`, embedded NULs included.
    pub fn read_block(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0; len];
        let n = self.read_block_into(addr, &mut data)?;

        if n < len {
            return Err(Error::PartialTransfer {
                pid: self.pid(),
                addr,
                requested: len,
                transferred: n,
            });
        }

        Ok(data)
    }

    /// Write all of `data` at `addr`, returning the count written.
    pub fn write_block(&mut self, addr: u64, data: &[u8]) -> Result<usize> {
        self.snapshot()?;

        let n = write(self.pid(), addr, data)?;

        if n == 0 && !data.is_empty() {
            return Err(Error::AddressFault { pid: self.pid(), addr });
        }

        if n < data.len() {
            return Err(Error::PartialTransfer {
                pid: self.pid(),
                addr,
                requested: data.len(),
                transferred: n,
            });
        }

        Ok(n)
    }

    /// Copy a NUL-terminated string at `addr`, reading at most `max_len` bytes.
    ///
    /// Reads never cross a page boundary past the terminator. If an inaccessible page is
    /// reached before a terminator, fails with [`Error::PartialTransfer`] carrying the
    /// count of bytes copied, or [`Error::AddressFault`] if none were.
    pub fn read_cstring(&self, addr: u64, max_len: usize) -> Result<RemoteString> {
        self.snapshot()?;

        let page = page_size();
        let mut bytes = Vec::new();
        let mut chunk = vec![0; page];

        while bytes.len() < max_len {
            let cur = (addr as usize)
                .checked_add(bytes.len())
                .ok_or(Error::AddressFault { pid: self.pid(), addr })?;
            let in_page = page - (cur & (page - 1));
            let want = in_page.min(max_len - bytes.len());

            let n = match read(self.pid(), cur as u64, &mut chunk[..want]) {
                Ok(n) => n,
                Err(Error::AddressFault { .. }) if !bytes.is_empty() => 0,
                Err(err) => return Err(err),
            };

            if let Some(nul) = chunk[..n].iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..nul]);
                return Ok(RemoteString { bytes, terminated: true });
            }

            bytes.extend_from_slice(&chunk[..n]);

            if n < want {
                if bytes.is_empty() {
                    return Err(Error::AddressFault { pid: self.pid(), addr });
                }

                return Err(Error::PartialTransfer {
                    pid: self.pid(),
                    addr,
                    requested: max_len,
                    transferred: bytes.len(),
                });
            }
        }

        Ok(RemoteString { bytes, terminated: false })
    }

    /// Read a pointer-sized word at `addr`, at the width of the resolved ABI.
    pub fn read_pointer(&self, addr: u64) -> Result<u64> {
        let abi = self.abi()?;
        let bytes = self.read_block(addr, abi.word_size())?;

        match abi.decode_pointer(&bytes) {
            Some(ptr) => Ok(ptr),
            None => internal_error!("short pointer read"),
        }
    }

    /// Read string `index` of a NULL-terminated array of string pointers at `addr`.
    ///
    /// Returns `None` at the NULL sentinel, without reading any string memory.
    pub fn read_string_array(&self, addr: u64, index: usize, max_len: usize) -> Result<Option<RemoteString>> {
        let word_size = self.abi()?.word_size();
        let max = usize::MAX / word_size;

        let slot = index
            .checked_mul(word_size)
            .and_then(|off| addr.checked_add(off as u64))
            .ok_or(Error::OutOfRange { index, max })?;

        let ptr = self.read_pointer(slot)?;

        if ptr == 0 {
            return Ok(None);
        }

        self.read_cstring(ptr, max_len).map(Some)
    }

    /// Read every string of a NULL-terminated array, such as `execve()`'s `argv`.
    ///
    /// Fails with [`Error::OutOfRange`] if no sentinel is found within `max_count` entries.
    pub fn read_strings(&self, addr: u64, max_count: usize, max_len: usize) -> Result<Vec<RemoteString>> {
        let mut strings = vec![];

        for index in 0..max_count {
            match self.read_string_array(addr, index, max_len)? {
                Some(s) => strings.push(s),
                None => return Ok(strings),
            }
        }

        Err(Error::OutOfRange { index: max_count, max: max_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_iovecs_split_at_boundary() {
        let page = page_size() as u64;
        let iovs = page_iovecs(page - 16, 32);

        assert_eq!(iovs.len(), 2);
        assert_eq!(iovs[0].base, (page - 16) as usize);
        assert_eq!(iovs[0].len, 16);
        assert_eq!(iovs[1].base, page as usize);
        assert_eq!(iovs[1].len, 16);
    }

    #[test]
    fn test_page_iovecs_within_page() {
        let iovs = page_iovecs(0x1000, 10);

        assert_eq!(iovs.len(), 1);
        assert_eq!(iovs[0].len, 10);
    }

    #[test]
    fn test_page_iovecs_empty() {
        assert!(page_iovecs(0x1000, 0).is_empty());
    }

    #[test]
    fn test_span_overflow() {
        assert!(matches!(check_span(u64::MAX - 1, 8), Err(Error::OutOfRange { .. })));
        assert!(check_span(0x1000, 8).is_ok());
    }

    fn unsupported(pid: Pid) -> Result<usize> {
        Err(Error::Unsupported { pid })
    }

    #[test]
    fn test_read_falls_back_to_words() {
        let pid = Pid::from_raw(1234);
        let mut buf = [0; 4];

        let n = read_with(
            pid,
            0x1000,
            &mut buf,
            |pid, _, _| unsupported(pid),
            |_, addr, buf| {
                assert_eq!(addr, 0x1000);
                buf.copy_from_slice(b"pink");
                Ok(buf.len())
            },
        )
        .unwrap();

        assert_eq!(n, 4);
        assert_eq!(&buf, b"pink");
    }

    #[test]
    fn test_write_falls_back_to_words() {
        let pid = Pid::from_raw(1234);
        let mut written = vec![];

        let n = write_with(pid, 0x1000, b"floyd", |pid, _, _| unsupported(pid), |_, _, data| {
            written.extend_from_slice(data);
            Ok(data.len())
        })
        .unwrap();

        assert_eq!(n, 5);
        assert_eq!(written, b"floyd".to_vec());
    }

    #[test]
    fn test_no_transfer_mechanism() {
        let pid = Pid::from_raw(1234);
        let mut buf = [0; 4];

        let err = read_with(pid, 0x1000, &mut buf, |pid, _, _| unsupported(pid), |pid, _, _| unsupported(pid))
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }), "{err:?}");

        let err = write_with(pid, 0x1000, b"pink", |pid, _, _| unsupported(pid), |pid, _, _| unsupported(pid))
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }), "{err:?}");
    }

    #[test]
    fn test_bulk_failures_are_not_retried() {
        let pid = Pid::from_raw(1234);
        let mut buf = [0; 4];

        let err = read_with(
            pid,
            0x8,
            &mut buf,
            |pid, addr, _| Err(Error::AddressFault { pid, addr }),
            |_, _, _| panic!("fell back after a fault"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::AddressFault { addr: 0x8, .. }), "{err:?}");

        let n = write_with(pid, 0x1000, b"pink", |_, _, _| Ok(2), |_, _, _| panic!("fell back after progress"))
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_remote_string() {
        let s = RemoteString { bytes: b"pink".to_vec(), terminated: true };

        assert_eq!(s.len(), 4);
        assert!(s.is_terminated());
        assert_eq!(s.to_string_lossy(), "pink");
    }
}
