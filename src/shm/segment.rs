//! Memory-mapped pool backing files.
//!
//! A [`Segment`] owns one shared, writable mapping of a backing file on a
//! tmpfs mount. Everything stored inside a segment addresses other shared
//! state by byte offset from the segment base, never by absolute pointer,
//! so two processes may map the same file at different addresses.

use std::ffi::c_void;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use rustix::fs::{self, Gid, Mode, OFlags};
use rustix::mm::{self, Advice, MapFlags, ProtFlags};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A shared mapping of a pool backing file.
pub struct Segment {
    #[allow(dead_code)]
    fd: OwnedFd,
    base: NonNull<u8>,
    len: usize,
    path: PathBuf,
}

// SAFETY: the mapping is plain shared memory; all mutation of its contents
// goes through raw pointers whose synchronization is the caller's concern
// (atomics and skirmishes). The fields of Segment itself are immutable
// after construction.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Creates the backing file, sizes it to `len` bytes and maps it shared.
    ///
    /// The file is sparse; tmpfs commits pages on first touch. `mode` and
    /// `gid` are applied when given, so that other processes of the session
    /// can attach.
    pub fn create(path: &Path, len: usize, mode: Option<u32>, gid: Option<u32>) -> Result<Self> {
        let fd = fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC,
            Mode::from_bits_truncate(mode.unwrap_or(0o600)),
        )?;

        if let Some(mode) = mode {
            fs::fchmod(&fd, Mode::from_bits_truncate(mode))?;
        }
        if let Some(gid) = gid {
            if let Err(err) = fs::fchown(&fd, None, Some(Gid::from_raw(gid))) {
                warn!(path = %path.display(), gid, %err, "failed to set group on backing file");
            }
        }

        fs::ftruncate(&fd, len as u64)?;

        let base = Self::map(&fd, len)?;
        debug!(path = %path.display(), len, "created shared segment");

        Ok(Segment {
            fd,
            base,
            len,
            path: path.to_path_buf(),
        })
    }

    /// Maps an existing backing file shared, using its current size.
    pub fn open(path: &Path) -> Result<Self> {
        let fd = fs::open(path, OFlags::RDWR, Mode::empty())?;
        let stat = fs::fstat(&fd)?;
        let len = stat.st_size as usize;
        if len == 0 {
            return Err(Error::InvalidSegment(format!(
                "{} is empty",
                path.display()
            )));
        }

        let base = Self::map(&fd, len)?;
        debug!(path = %path.display(), len, "attached shared segment");

        Ok(Segment {
            fd,
            base,
            len,
            path: path.to_path_buf(),
        })
    }

    fn map(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>> {
        // SAFETY: mapping a fresh region chosen by the kernel; we own fd.
        let addr = unsafe {
            mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )?
        };
        NonNull::new(addr as *mut u8)
            .ok_or_else(|| Error::InvalidSegment("mmap returned null".into()))
    }

    /// Base address of the mapping.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Length of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a live segment).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves an offset to a typed pointer into the mapping.
    ///
    /// # Safety
    ///
    /// `off` must be within the mapping, aligned for `T`, and `off + size_of::<T>()`
    /// must not exceed the mapping length. The caller is responsible for the
    /// aliasing discipline of whatever lives there.
    #[inline]
    pub unsafe fn at<T>(&self, off: u32) -> *mut T {
        debug_assert!(off as usize + std::mem::size_of::<T>() <= self.len);
        debug_assert_eq!(off as usize % std::mem::align_of::<T>(), 0);
        // SAFETY: bounds and alignment guaranteed by the caller.
        unsafe { self.base.as_ptr().add(off as usize).cast::<T>() }
    }

    /// Returns freed whole pages in `[off, off + len)` to the kernel.
    ///
    /// Uses `MADV_REMOVE`, which punches a hole in the tmpfs file. Failure
    /// is logged and ignored; the range stays allocated but valid.
    pub fn punch(&self, off: u32, len: usize) {
        let off = off as usize;
        if off + len > self.len {
            return;
        }
        // SAFETY: range is within our own mapping.
        let res = unsafe {
            mm::madvise(
                self.base.as_ptr().add(off) as *mut c_void,
                len,
                Advice::LinuxRemove,
            )
        };
        if let Err(err) = res {
            debug!(off, len, %err, "MADV_REMOVE failed");
        }
    }

    /// Unlinks the backing file. The mapping stays valid until drop.
    pub fn unlink(&self) {
        if let Err(err) = fs::unlink(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to unlink backing file");
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: base/len describe a mapping we created and nobody else
        // unmapped; handles into the segment keep the Segment alive via Arc.
        if let Err(err) = unsafe { mm::munmap(self.base.as_ptr() as *mut c_void, self.len) } {
            warn!(path = %self.path.display(), %err, "failed to unmap segment");
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        let pid = rustix::process::getpid().as_raw_nonzero().get();
        std::env::temp_dir().join(format!("fusion-segment-{tag}-{pid}"))
    }

    #[test]
    fn create_and_reopen_sees_writes() {
        let path = temp_path("roundtrip");
        let a = Segment::create(&path, 8192, None, None).unwrap();
        unsafe {
            *a.at::<u64>(128) = 0xfeed_beef_cafe_f00d;
        }

        let b = Segment::open(&path).unwrap();
        assert_eq!(b.len(), 8192);
        let got = unsafe { *b.at::<u64>(128) };
        assert_eq!(got, 0xfeed_beef_cafe_f00d);

        a.unlink();
    }

    #[test]
    fn open_missing_fails() {
        let path = temp_path("missing");
        let _ = std::fs::remove_file(&path);
        assert!(Segment::open(&path).is_err());
    }

    #[test]
    fn punch_keeps_range_readable() {
        let path = temp_path("punch");
        let seg = Segment::create(&path, 16384, None, None).unwrap();
        unsafe {
            *seg.at::<u32>(4096) = 77;
        }
        seg.punch(4096, 4096);
        // Hole-punched pages read back as zero.
        let got = unsafe { *seg.at::<u32>(4096) };
        assert_eq!(got, 0);
        seg.unlink();
    }
}
