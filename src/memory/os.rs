use std::fmt;
use std::ptr::NonNull;

/// Minimum alignment of any allocation obtained from the OS layer.
pub(crate) const OS_MIN_ALIGN: usize = 0x100;

#[derive(Debug)]
pub enum OsMemError {
    AllocationFailed(std::io::Error),
}

impl fmt::Display for OsMemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsMemError::AllocationFailed(e) => write!(f, "aligned allocation failed: {e}"),
        }
    }
}

impl std::error::Error for OsMemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OsMemError::AllocationFailed(e) => Some(e),
        }
    }
}

/// Abstract interface for OS-level aligned allocation.
///
/// Precondition on the collaborator: two live allocations never share an
/// address.  The manager's index bookkeeping treats a duplicate address as
/// corruption.
pub(crate) trait OsMemOps {
    /// Allocate `size` bytes whose address is a multiple of `align`.
    /// `align` must be a power of two and at least pointer-sized.
    /// Content of the returned region is undefined.
    unsafe fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, OsMemError>;

    /// Release an allocation previously obtained from [`alloc_aligned`]
    /// (same `size` and `align`).
    ///
    /// [`alloc_aligned`]: OsMemOps::alloc_aligned
    unsafe fn release(ptr: NonNull<u8>, size: usize, align: usize);
}

pub(crate) struct PlatformOsMem;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, OsMemError, OsMemOps, PlatformOsMem};
    use std::io;

    impl OsMemOps for PlatformOsMem {
        unsafe fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, OsMemError> {
            debug_assert!(
                align.is_power_of_two() && align >= std::mem::size_of::<*mut u8>(),
                "alloc_aligned: invalid alignment {align}"
            );
            if size == 0 {
                return Err(OsMemError::AllocationFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size allocation",
                )));
            }

            let mut out: *mut libc::c_void = std::ptr::null_mut();
            // Safety: FFI call to posix_memalign; `out` is a valid out-pointer.
            let rc = unsafe { libc::posix_memalign(&mut out, align, size) };
            if rc != 0 {
                return Err(OsMemError::AllocationFailed(io::Error::from_raw_os_error(
                    rc,
                )));
            }

            NonNull::new(out.cast::<u8>()).ok_or_else(|| {
                OsMemError::AllocationFailed(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "posix_memalign returned null",
                ))
            })
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize, _align: usize) {
            // Safety: FFI call to free; ptr came from posix_memalign.
            unsafe { libc::free(ptr.as_ptr().cast::<libc::c_void>()) };
        }
    }
}

#[cfg(all(windows, not(any(loom, miri))))]
mod windows {
    use super::{NonNull, OsMemError, OsMemOps, PlatformOsMem};
    use std::io;

    impl OsMemOps for PlatformOsMem {
        unsafe fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, OsMemError> {
            debug_assert!(
                align.is_power_of_two() && align >= std::mem::size_of::<*mut u8>(),
                "alloc_aligned: invalid alignment {align}"
            );
            if size == 0 {
                return Err(OsMemError::AllocationFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size allocation",
                )));
            }

            // Safety: FFI call to _aligned_malloc.
            let ptr = unsafe { libc::aligned_malloc(size, align) };

            NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
                OsMemError::AllocationFailed(io::Error::last_os_error())
            })
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize, _align: usize) {
            // Safety: FFI call to _aligned_free; ptr came from aligned_malloc.
            unsafe { libc::aligned_free(ptr.as_ptr().cast::<libc::c_void>()) };
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed allocation (no libc calls)
//
// Under `cfg(loom)` model runs and under Miri we back every allocation with
// `std::alloc` so the borrow/provenance checkers can track it.  Sufficient
// for testing the bookkeeping logic; real alignment syscall behaviour is
// covered by the platform implementations in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl OsMemOps for PlatformOsMem {
    unsafe fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, OsMemError> {
        if size == 0 {
            return Err(OsMemError::AllocationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size allocation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, align)
            .map_err(|e| OsMemError::AllocationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            OsMemError::AllocationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = std::alloc::Layout::from_size_align(size, align)
            .expect("release called with a layout that alloc_aligned accepted");
        // Safety: ptr was allocated with the same layout via `alloc_aligned`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}
