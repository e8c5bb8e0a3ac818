//! Raw backing region for a buddy pool
//!
//! A [`Region`] is one contiguous, read/write, anonymous mapping obtained from
//! the OS in a single call and returned in a single call. It has no partial
//! release: the pool built on top of it never gives pages back early.
//!
//! Block headers live inside the region. They are copied in and out by value
//! through [`Region::header`] and [`Region::set_header`]; no reference into the
//! region is ever handed out, so payload pointers held by callers never alias a
//! live Rust reference.

use core::fmt;
use core::mem::{align_of, ManuallyDrop};
use core::ptr::NonNull;
use std::io;

#[cfg(feature = "log")]
use log::{debug, error};

use crate::buddy::buddy_block::{BlockHeader, RawHeader, HEADER_SIZE};
use crate::is_aligned;

#[derive(Debug)]
pub enum RegionError {
    MapFailed(io::Error),
    UnmapFailed(io::Error),
    InvalidLength(usize),
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::MapFailed(e) => write!(f, "region map failed: {e}"),
            RegionError::UnmapFailed(e) => write!(f, "region unmap failed: {e}"),
            RegionError::InvalidLength(len) => write!(f, "invalid region length {len:#x}"),
        }
    }
}

impl std::error::Error for RegionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegionError::MapFailed(e) | RegionError::UnmapFailed(e) => Some(e),
            RegionError::InvalidLength(_) => None,
        }
    }
}

/// Report an unrecoverable environment failure and terminate the process.
///
/// A pool whose backing region cannot be mapped or unmapped cannot be handed
/// back to the caller in any usable state.
#[cold]
#[allow(unused_variables)]
pub(crate) fn environment_failure(context: &str, err: RegionError) -> ! {
    error!("buddy pool: {}: {}", context, err);
    std::process::abort()
}

/// An owned, contiguous mapping of raw memory.
#[derive(Debug)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Map `len` bytes of zeroed, read/write memory.
    pub fn map(len: usize) -> Result<Self, RegionError> {
        if len == 0 {
            return Err(RegionError::InvalidLength(len));
        }
        // Safety: len is non-zero; the mapping is released exactly once by
        // `unmap` or `Drop`.
        let base = unsafe { sys::map(len) }.map_err(RegionError::MapFailed)?;
        debug!(
            "buddy pool: mapped region [{:#x}, {:#x})",
            base.as_ptr() as usize,
            base.as_ptr() as usize + len
        );
        Ok(Self { base, len })
    }

    /// Release the whole mapping.
    pub fn unmap(self) -> Result<(), RegionError> {
        let this = ManuallyDrop::new(self);
        // Safety: `this` is never used again and its Drop does not run.
        unsafe { sys::unmap(this.base, this.len) }.map_err(RegionError::UnmapFailed)
    }

    /// Start of the mapping.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of `addr` from the base, if it falls inside the mapping.
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        let base = self.base.as_ptr() as usize;
        if addr >= base && addr < base + self.len {
            Some(addr - base)
        } else {
            None
        }
    }

    /// Pointer to the byte at `offset`.
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.len, "offset {offset:#x} outside region");
        // Safety: offset is inside the mapping, so the result is non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    fn check_header(&self, offset: usize) {
        assert!(
            offset + HEADER_SIZE <= self.len,
            "block header at {:#x} exceeds region length {:#x}",
            offset,
            self.len
        );
        assert!(
            is_aligned(offset, align_of::<RawHeader>()),
            "block header at {:#x} is misaligned",
            offset
        );
    }

    /// Read the block header stored at `offset`.
    pub(crate) fn header(&self, offset: usize) -> BlockHeader {
        self.check_header(offset);
        // Safety: bounds and alignment checked above; every bit pattern is a
        // valid `RawHeader`.
        let raw = unsafe { self.base.as_ptr().add(offset).cast::<RawHeader>().read() };
        BlockHeader::from_raw(raw)
    }

    /// Overwrite the block header stored at `offset`.
    pub(crate) fn set_header(&mut self, offset: usize, header: BlockHeader) {
        self.check_header(offset);
        // Safety: bounds and alignment checked above.
        unsafe {
            self.base
                .as_ptr()
                .add(offset)
                .cast::<RawHeader>()
                .write(header.into_raw())
        };
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Safety: Drop runs at most once and `unmap` skips it.
        if let Err(e) = unsafe { sys::unmap(self.base, self.len) } {
            environment_failure("releasing region on drop", RegionError::UnmapFailed(e));
        }
    }
}

#[cfg(all(unix, not(miri)))]
mod sys {
    use core::ptr::NonNull;
    use std::io;

    #[cfg(target_os = "linux")]
    const EXTRA_FLAGS: libc::c_int = libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    const EXTRA_FLAGS: libc::c_int = 0;

    pub(super) unsafe fn map(len: usize) -> io::Result<NonNull<u8>> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | EXTRA_FLAGS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
    }

    pub(super) unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // Safety: FFI call to munmap.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(any(not(unix), miri))]
mod sys {
    use core::ptr::NonNull;
    use std::alloc::Layout;
    use std::io;

    const FALLBACK_PAGE_SIZE: usize = 0x1000;

    pub(super) unsafe fn map(len: usize) -> io::Result<NonNull<u8>> {
        let layout = Layout::from_size_align(len, FALLBACK_PAGE_SIZE).map_err(io::Error::other)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "alloc returned null"))
    }

    pub(super) unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        let layout = Layout::from_size_align(len, FALLBACK_PAGE_SIZE).map_err(io::Error::other)?;
        // Safety: ptr was returned by `map` with the same layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }
}
