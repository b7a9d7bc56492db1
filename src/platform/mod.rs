//! Virtual memory interface supplied by the host platform.
//!
//! The allocators treat this module as an opaque collaborator: address space
//! can be reserved without backing pages, committed and decommitted in
//! page-sized subranges, or obtained committed in one step. All operations
//! report failure with `None`/`false`; they never panic.
//!
//! On platforms where commit/decommit is not a first-class kernel concept
//! (unix mmap always pages on first access), the unix implementation runs in
//! "safe mode": decommit issues a discard advisory and drops the page
//! protection to none, commit restores read/write protection. This keeps
//! accidental access to decommitted regions faulting instead of silently
//! re-paging them.

use core::ptr::NonNull;
use std::sync::LazyLock;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix as imp;
    } else if #[cfg(windows)] {
        mod windows;
        use windows as imp;
    } else {
        compile_error!("no virtual memory backend for this platform");
    }
}

/// Page protection for committed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryProtection {
    /// No access; touching the range faults.
    None,
    /// Read-only access.
    ReadOnly,
    /// Read and write access.
    ReadWrite,
    /// Read and execute access.
    ReadExecute,
    /// Read, write, and execute access.
    ReadWriteExecute,
}

static PAGE_SIZE: LazyLock<usize> = LazyLock::new(imp::query_page_size);

/// The operating system page size, queried once and cached.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Reserves `size` bytes of address space with no access permissions.
///
/// The range cannot be read or written until [`commit`]ted. `size` is
/// expected to be page-aligned; the kernel rounds it up otherwise.
pub fn reserve(size: usize) -> Option<NonNull<u8>> {
    imp::reserve(size)
}

/// Returns a reserved range to the operating system.
///
/// # Safety
/// `ptr`/`size` must denote exactly the range returned by a prior
/// [`reserve`], with no live references into it.
pub unsafe fn release(ptr: NonNull<u8>, size: usize) -> bool {
    unsafe { imp::release(ptr, size) }
}

/// Makes a page-aligned subrange of a reservation accessible.
///
/// Subranges may be committed repeatedly; committing an already-committed
/// page is not an error.
///
/// # Safety
/// `ptr`/`size` must lie within a range obtained from [`reserve`].
pub unsafe fn commit(ptr: NonNull<u8>, size: usize, protection: MemoryProtection) -> bool {
    unsafe { imp::commit(ptr, size, protection) }
}

/// Marks a page-aligned subrange inaccessible and allows the OS to reclaim
/// its backing pages. The range stays reserved and can be re-committed.
///
/// # Safety
/// `ptr`/`size` must lie within a range obtained from [`reserve`] or
/// [`alloc`], with no live references into it.
pub unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> bool {
    unsafe { imp::decommit(ptr, size) }
}

/// Reserves and commits `size` bytes in one step.
pub fn alloc(size: usize, protection: MemoryProtection) -> Option<NonNull<u8>> {
    imp::alloc(size, protection)
}

/// Inverse of [`alloc`].
///
/// # Safety
/// `ptr`/`size` must denote exactly the range returned by a prior [`alloc`],
/// with no live references into it.
pub unsafe fn free(ptr: NonNull<u8>, size: usize) -> bool {
    unsafe { imp::free(ptr, size) }
}
