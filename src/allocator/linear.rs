//! Linear allocator over a caller-provided buffer.

use core::alloc::Layout;
use core::cell::Cell;
use core::ptr::{self, NonNull};

use super::{bump_from_buffer, RegionAllocator};
use crate::error::{AllocError, AllocErrorKind, AllocResult};

/// Carves allocations linearly out of a fixed, caller-owned buffer.
///
/// There is no per-allocation overhead and the buffer contents are never
/// touched by the allocator itself. Memory is reclaimed wholesale with
/// [`reset`](Self::reset); [`release`](Self::release) forgets the buffer
/// without freeing it (the caller owns it).
///
/// The allocator is single-threaded: cursors live in `Cell`s, every
/// operation takes `&self`, and the type is deliberately `!Sync`.
pub struct LinearAllocator {
    /// Buffer base address; zero iff uninitialized.
    buffer: Cell<usize>,
    buffer_size: Cell<usize>,
    allocated_size: Cell<usize>,
    /// Offset of the most recent allocation, for in-place reallocation.
    /// `buffer_size` doubles as the "no allocation yet" sentinel.
    last_alloc_offset: Cell<usize>,
}

impl LinearAllocator {
    /// Creates an uninitialized allocator.
    ///
    /// Only the buffer base tells whether we are initialized; everything
    /// else is set by [`initialize`](Self::initialize).
    #[inline]
    pub const fn new() -> Self {
        Self {
            buffer: Cell::new(0),
            buffer_size: Cell::new(0),
            allocated_size: Cell::new(0),
            last_alloc_offset: Cell::new(0),
        }
    }

    /// Creates an allocator over `buffer` in one step.
    ///
    /// # Safety
    /// See [`initialize`](Self::initialize).
    pub unsafe fn with_buffer(buffer: *mut u8, buffer_size: usize) -> AllocResult<Self> {
        let allocator = Self::new();
        unsafe { allocator.initialize(buffer, buffer_size)? };
        Ok(allocator)
    }

    /// Adopts `buffer` as the allocation region.
    ///
    /// Rejects a second initialization, null buffers, zero sizes and sizes
    /// beyond the counter range; on rejection the allocator stays
    /// uninitialized.
    ///
    /// # Safety
    /// `buffer` must be valid for reads and writes of `buffer_size` bytes
    /// for as long as this allocator (or any allocation made from it) is in
    /// use, and must not be deallocated before [`release`](Self::release).
    pub unsafe fn initialize(&self, buffer: *mut u8, buffer_size: usize) -> AllocResult<()> {
        if self.is_initialized() {
            return Err(AllocError::new(AllocErrorKind::AlreadyInitialized));
        }

        if buffer.is_null() {
            return Err(AllocError::invalid_layout("null buffer"));
        }
        if buffer_size == 0 || buffer_size > isize::MAX as usize {
            return Err(AllocError::invalid_layout("buffer size out of range"));
        }

        self.buffer.set(buffer as usize);
        self.buffer_size.set(buffer_size);
        self.allocated_size.set(0);
        self.last_alloc_offset.set(buffer_size);

        #[cfg(feature = "logging")]
        tracing::trace!(capacity = buffer_size, "linear allocator initialized");

        Ok(())
    }

    /// Logically frees every allocation by rewinding the cursor.
    ///
    /// Previously returned pointers stop being owned immediately even though
    /// the buffer memory itself is untouched.
    pub fn reset(&self) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::uninitialized());
        }

        self.allocated_size.set(0);
        self.last_alloc_offset.set(self.buffer_size.get());
        Ok(())
    }

    /// Forgets the buffer and returns to the uninitialized state.
    ///
    /// The buffer is caller-owned and is not freed.
    pub fn release(&self) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::uninitialized());
        }

        self.buffer.set(0);
        Ok(())
    }

    /// True once [`initialize`](Self::initialize) has succeeded.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.buffer.get() != 0
    }

    /// Bytes currently allocated, alignment padding included.
    #[inline]
    pub fn allocated_size(&self) -> usize {
        self.allocated_size.get()
    }

    /// Total buffer capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer_size.get()
    }

    fn allocate_impl(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        if !self.is_initialized() {
            return Err(AllocError::uninitialized());
        }
        if layout.size() == 0 {
            return Err(AllocError::invalid_layout("zero-sized request"));
        }

        let used = self.allocated_size.get();
        let (start, new_used) = bump_from_buffer(
            self.buffer.get(),
            self.buffer_size.get(),
            used,
            layout.size(),
            layout.align(),
        )
        .ok_or(AllocError::out_of_memory(layout))?;

        self.allocated_size.set(new_used);
        self.last_alloc_offset.set(start - self.buffer.get());

        // SAFETY: start lies inside the non-null buffer.
        Ok(unsafe { NonNull::new_unchecked(start as *mut u8) })
    }
}

impl Default for LinearAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the allocator hands out pointers into the caller's buffer,
// advancing a cursor so returned ranges never overlap; deallocate is a no-op
// by contract.
unsafe impl RegionAllocator for LinearAllocator {
    #[inline]
    unsafe fn allocate(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        self.allocate_impl(layout)
    }

    #[inline]
    unsafe fn deallocate(&self, _ptr: *mut u8, _size: usize) {
        // Not supported, does nothing.
    }

    #[inline]
    unsafe fn reallocate(
        &self,
        old_ptr: *mut u8,
        old_size: usize,
        new_layout: Layout,
    ) -> AllocResult<NonNull<u8>> {
        if !self.is_initialized() {
            return Err(AllocError::uninitialized());
        }
        if new_layout.size() == 0 {
            return Err(AllocError::invalid_layout("zero-sized request"));
        }

        let last_allocation = self.buffer.get() + self.last_alloc_offset.get();
        if last_allocation == old_ptr as usize {
            // Resizing the most recent allocation in place. Shrinking makes
            // the delta wrap to a very large value, which wraps new_used
            // back below the current cursor; one unsigned comparison then
            // covers both directions.
            let delta = new_layout.size().wrapping_sub(old_size);
            let new_used = self.allocated_size.get().wrapping_add(delta);
            if new_used > self.buffer_size.get() {
                return Err(AllocError::out_of_memory(new_layout));
            }

            self.allocated_size.set(new_used);
            // Nothing to copy since we re-use the same memory.
            // SAFETY: old_ptr equals a previously returned allocation start.
            return Ok(unsafe { NonNull::new_unchecked(old_ptr) });
        }

        // Not the last allocation: fresh allocation plus copy. The old
        // region is not freed.
        let new_ptr = self.allocate_impl(new_layout)?;

        let bytes_to_copy = old_size.min(new_layout.size());
        if bytes_to_copy > 0 {
            // SAFETY: caller guarantees old_ptr is live for old_size bytes;
            // new_ptr was just carved after it, so the ranges are disjoint.
            unsafe { ptr::copy_nonoverlapping(old_ptr, new_ptr.as_ptr(), bytes_to_copy) };
        }

        Ok(new_ptr)
    }

    fn is_owner_of(&self, ptr: *const u8) -> bool {
        if !self.is_initialized() {
            return false;
        }

        crate::utils::is_ptr_in_range(ptr, self.buffer.get(), self.allocated_size.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    fn buffer(len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    #[test]
    fn starts_uninitialized() {
        let alloc = LinearAllocator::new();
        assert!(!alloc.is_initialized());
        assert!(unsafe { alloc.allocate(layout(1, 1)) }.is_err());
        assert!(alloc.reset().is_err());
        assert!(alloc.release().is_err());
        assert!(!alloc.is_owner_of(core::ptr::null()));
    }

    #[test]
    fn initialize_validates_arguments() {
        let mut buf = buffer(64);
        let alloc = LinearAllocator::new();

        unsafe {
            assert!(alloc.initialize(core::ptr::null_mut(), 64).is_err());
            assert!(alloc.initialize(buf.as_mut_ptr(), 0).is_err());
            assert!(!alloc.is_initialized());

            alloc.initialize(buf.as_mut_ptr(), 64).unwrap();
            assert!(alloc.is_initialized());

            // Double initialization is rejected without disturbing state.
            let err = alloc.initialize(buf.as_mut_ptr(), 64).unwrap_err();
            assert_eq!(err.kind(), AllocErrorKind::AlreadyInitialized);
        }
    }

    #[test]
    fn fills_the_buffer_exactly() {
        let mut buf = buffer(1024);
        let alloc = unsafe { LinearAllocator::with_buffer(buf.as_mut_ptr(), 1024).unwrap() };

        unsafe {
            let p0 = alloc.allocate(layout(2, 1)).unwrap();
            assert_eq!(p0.as_ptr(), buf.as_mut_ptr());
            assert_eq!(alloc.allocated_size(), 2);

            let p1 = alloc.allocate(layout(1022, 1)).unwrap();
            assert_eq!(p1.as_ptr() as usize, buf.as_ptr() as usize + 2);
            assert_eq!(alloc.allocated_size(), 1024);

            assert!(alloc.allocate(layout(1, 1)).is_err());
            assert_eq!(alloc.allocated_size(), 1024);
        }
    }

    #[test]
    fn respects_alignment() {
        let mut buf = buffer(1024);
        let alloc = unsafe { LinearAllocator::with_buffer(buf.as_mut_ptr(), 1024).unwrap() };

        unsafe {
            let p0 = alloc.allocate(layout(2, 8)).unwrap();
            assert_eq!(p0.as_ptr() as usize % 8, 0);

            let p1 = alloc.allocate(layout(2, 16)).unwrap();
            assert_eq!(p1.as_ptr() as usize % 16, 0);
            assert_ne!(p0, p1);
        }
    }

    #[test]
    fn ownership_follows_the_cursor() {
        let mut buf = buffer(64);
        let alloc = unsafe { LinearAllocator::with_buffer(buf.as_mut_ptr(), 64).unwrap() };

        unsafe {
            assert!(!alloc.is_owner_of(core::ptr::null()));

            let p = alloc.allocate(layout(2, 1)).unwrap();
            assert!(alloc.is_owner_of(p.as_ptr()));
            assert!(alloc.is_owner_of(p.as_ptr().add(1)));
            assert!(!alloc.is_owner_of(p.as_ptr().add(2)));

            // Logically freed memory stops being owned even though the
            // caller's buffer is still there.
            alloc.reset().unwrap();
            assert!(!alloc.is_owner_of(p.as_ptr()));
            assert_eq!(alloc.allocated_size(), 0);
        }
    }

    #[test]
    fn deallocate_is_a_noop() {
        let mut buf = buffer(64);
        let alloc = unsafe { LinearAllocator::with_buffer(buf.as_mut_ptr(), 64).unwrap() };

        unsafe {
            let p = alloc.allocate(layout(8, 1)).unwrap();
            alloc.deallocate(p.as_ptr(), 8);
            assert_eq!(alloc.allocated_size(), 8);
            assert!(alloc.is_owner_of(p.as_ptr()));
        }
    }

    #[test]
    fn reallocate_fast_path() {
        let mut buf = buffer(1024);
        let alloc = unsafe { LinearAllocator::with_buffer(buf.as_mut_ptr(), 1024).unwrap() };

        unsafe {
            let p = alloc.allocate(layout(2, 1)).unwrap();

            // Growing the last allocation resizes in place.
            let q = alloc.reallocate(p.as_ptr(), 2, layout(8, 1)).unwrap();
            assert_eq!(q, p);
            assert_eq!(alloc.allocated_size(), 8);

            // Null old pointer behaves like a plain allocation.
            let r = alloc.reallocate(core::ptr::null_mut(), 0, layout(4, 1)).unwrap();
            assert_ne!(r, p);
            assert_eq!(alloc.allocated_size(), 12);

            // p is no longer the last allocation: allocate-and-copy.
            let s = alloc.reallocate(p.as_ptr(), 8, layout(12, 1)).unwrap();
            assert_ne!(s, p);
            assert_ne!(s, r);
            assert_eq!(alloc.allocated_size(), 24);
        }
    }

    #[test]
    fn reallocate_grow_then_shrink_restores_size() {
        let mut buf = buffer(256);
        let alloc = unsafe { LinearAllocator::with_buffer(buf.as_mut_ptr(), 256).unwrap() };

        unsafe {
            let p = alloc.allocate(layout(16, 1)).unwrap();
            let before = alloc.allocated_size();

            let q = alloc.reallocate(p.as_ptr(), 16, layout(64, 1)).unwrap();
            assert_eq!(q, p);
            assert_eq!(alloc.allocated_size(), before + 48);

            let r = alloc.reallocate(q.as_ptr(), 64, layout(16, 1)).unwrap();
            assert_eq!(r, p);
            assert_eq!(alloc.allocated_size(), before);
        }
    }

    #[test]
    fn reallocate_copies_contents() {
        let mut buf = buffer(256);
        let alloc = unsafe { LinearAllocator::with_buffer(buf.as_mut_ptr(), 256).unwrap() };

        unsafe {
            let p = alloc.allocate(layout(4, 1)).unwrap();
            p.as_ptr().copy_from_nonoverlapping([1u8, 2, 3, 4].as_ptr(), 4);

            // Force the copy path by making another allocation in between.
            let _ = alloc.allocate(layout(1, 1)).unwrap();
            let q = alloc.reallocate(p.as_ptr(), 4, layout(8, 1)).unwrap();
            assert_ne!(q, p);
            assert_eq!(core::slice::from_raw_parts(q.as_ptr(), 4), &[1, 2, 3, 4]);
        }
    }

    #[test]
    fn reallocate_fast_path_overflow_fails_cleanly() {
        let mut buf = buffer(64);
        let alloc = unsafe { LinearAllocator::with_buffer(buf.as_mut_ptr(), 64).unwrap() };

        unsafe {
            let p = alloc.allocate(layout(8, 1)).unwrap();
            let err = alloc.reallocate(p.as_ptr(), 8, layout(128, 1)).unwrap_err();
            assert_eq!(err.kind(), AllocErrorKind::OutOfMemory);
            // Failure leaves the cursor untouched.
            assert_eq!(alloc.allocated_size(), 8);
        }
    }

    #[test]
    fn release_forgets_the_buffer() {
        let mut buf = buffer(64);
        let alloc = unsafe { LinearAllocator::with_buffer(buf.as_mut_ptr(), 64).unwrap() };

        alloc.release().unwrap();
        assert!(!alloc.is_initialized());

        // The buffer can be adopted again after release.
        unsafe { alloc.initialize(buf.as_mut_ptr(), 64).unwrap() };
        assert!(alloc.is_initialized());
    }
}
