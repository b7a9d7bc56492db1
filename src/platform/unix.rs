//! Unix virtual memory backend over `mmap`/`mprotect`/`madvise`/`munmap`.

use core::ptr::{self, NonNull};

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE};

use super::MemoryProtection;

impl MemoryProtection {
    fn to_unix_flags(self) -> libc::c_int {
        match self {
            MemoryProtection::None => PROT_NONE,
            MemoryProtection::ReadOnly => PROT_READ,
            MemoryProtection::ReadWrite => PROT_READ | PROT_WRITE,
            MemoryProtection::ReadExecute => PROT_READ | PROT_EXEC,
            MemoryProtection::ReadWriteExecute => PROT_READ | PROT_WRITE | PROT_EXEC,
        }
    }
}

pub(super) fn query_page_size() -> usize {
    // SAFETY: sysconf has no memory preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn map(size: usize, prot: libc::c_int) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }

    // SAFETY: anonymous private mapping with no address hint; the kernel
    // picks the placement and the fd/offset pair is ignored.
    let ptr = unsafe {
        libc::mmap(ptr::null_mut(), size, prot, MAP_PRIVATE | MAP_ANONYMOUS, -1, 0)
    };

    if ptr == MAP_FAILED {
        None
    } else {
        NonNull::new(ptr.cast::<u8>())
    }
}

pub(super) fn reserve(size: usize) -> Option<NonNull<u8>> {
    // Reservations carry no access permissions until committed.
    map(size, PROT_NONE)
}

pub(super) unsafe fn release(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: caller passes a range previously returned by mmap.
    unsafe { libc::munmap(ptr.as_ptr().cast(), size) == 0 }
}

pub(super) unsafe fn commit(ptr: NonNull<u8>, size: usize, protection: MemoryProtection) -> bool {
    // Unix pages on first access; "committing" is restoring the protection
    // that reserve/decommit removed.
    // SAFETY: caller passes a page-aligned subrange of a live mapping.
    unsafe { libc::mprotect(ptr.as_ptr().cast(), size, protection.to_unix_flags()) == 0 }
}

pub(super) unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> bool {
    #[cfg(target_os = "linux")]
    const DISCARD_ADVICE: libc::c_int = libc::MADV_DONTNEED;
    #[cfg(not(target_os = "linux"))]
    const DISCARD_ADVICE: libc::c_int = libc::MADV_FREE;

    // SAFETY: caller passes a page-aligned subrange of a live mapping with
    // no outstanding references.
    unsafe {
        if libc::madvise(ptr.as_ptr().cast(), size, DISCARD_ADVICE) != 0 {
            return false;
        }
        // Safe mode: fault on any access to the discarded range instead of
        // silently re-paging it.
        libc::mprotect(ptr.as_ptr().cast(), size, PROT_NONE) == 0
    }
}

pub(super) fn alloc(size: usize, protection: MemoryProtection) -> Option<NonNull<u8>> {
    map(size, protection.to_unix_flags())
}

pub(super) unsafe fn free(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: caller passes a range previously returned by mmap.
    unsafe { libc::munmap(ptr.as_ptr().cast(), size) == 0 }
}
