//! Linear allocator over an internally managed virtual memory range.

use core::alloc::Layout;
use core::cell::Cell;
use core::ptr::{self, NonNull};

use super::{bump_from_buffer, RegionAllocator};
use crate::error::{AllocError, AllocErrorKind, AllocResult};
use crate::platform::{self, MemoryProtection};
use crate::utils::align_up;

/// Linear allocator that reserves its address range up front and commits
/// pages lazily as the cursor advances.
///
/// Unlike [`LinearAllocator`](super::LinearAllocator) no buffer is provided
/// by the caller: [`initialize`](Self::initialize) reserves `capacity` bytes
/// of address space with no access permissions, allocations commit pages on
/// demand, [`reset`](Self::reset) decommits everything, and
/// [`release`](Self::release) (or drop) returns the reservation to the OS.
///
/// The allocator is single-threaded and `!Sync`.
pub struct VMemLinearAllocator {
    /// Reservation base address; zero iff uninitialized.
    buffer: Cell<usize>,
    buffer_size: Cell<usize>,
    allocated_size: Cell<usize>,
    /// Offset of the most recent allocation, for in-place reallocation.
    last_alloc_offset: Cell<usize>,
    /// Committed prefix length; always a whole multiple of the page size.
    committed_size: Cell<usize>,
    /// Page size queried from the VM layer at initialization.
    page_size: Cell<usize>,
}

impl VMemLinearAllocator {
    /// Creates an uninitialized allocator.
    #[inline]
    pub const fn new() -> Self {
        Self {
            buffer: Cell::new(0),
            buffer_size: Cell::new(0),
            allocated_size: Cell::new(0),
            last_alloc_offset: Cell::new(0),
            committed_size: Cell::new(0),
            page_size: Cell::new(0),
        }
    }

    /// Reserves `capacity` bytes and returns the initialized allocator.
    pub fn with_capacity(capacity: usize) -> AllocResult<Self> {
        let allocator = Self::new();
        allocator.initialize(capacity)?;
        Ok(allocator)
    }

    /// Reserves `capacity` bytes of address space with no access.
    ///
    /// Rejects a second initialization, capacities smaller than one page and
    /// capacities beyond the counter range; on rejection the allocator stays
    /// uninitialized.
    pub fn initialize(&self, capacity: usize) -> AllocResult<()> {
        if self.is_initialized() {
            return Err(AllocError::new(AllocErrorKind::AlreadyInitialized));
        }

        let page_size = platform::page_size();
        if capacity < page_size || capacity > isize::MAX as usize {
            return Err(AllocError::invalid_layout("capacity out of range"));
        }

        let ptr = platform::reserve(capacity)
            .ok_or(AllocError::new(AllocErrorKind::ReserveFailed))?;

        self.buffer.set(ptr.as_ptr() as usize);
        self.buffer_size.set(capacity);
        self.allocated_size.set(0);
        self.last_alloc_offset.set(capacity);
        self.committed_size.set(0);
        self.page_size.set(page_size);

        #[cfg(feature = "logging")]
        tracing::trace!(capacity, page_size, "virtual memory range reserved");

        Ok(())
    }

    /// Rewinds the cursor and decommits every committed page.
    pub fn reset(&self) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::uninitialized());
        }

        let committed = self.committed_size.get();
        if committed != 0 {
            let base = self.buffer.get() as *mut u8;
            // SAFETY: [base, base + committed) is a committed prefix of our
            // reservation and the caller of reset has given up every
            // allocation in it.
            let ok = unsafe { platform::decommit(NonNull::new_unchecked(base), committed) };
            if !ok {
                return Err(AllocError::new(AllocErrorKind::DecommitFailed));
            }
        }

        self.allocated_size.set(0);
        self.last_alloc_offset.set(self.buffer_size.get());
        self.committed_size.set(0);

        #[cfg(feature = "logging")]
        tracing::trace!(decommitted = committed, "linear region reset");

        Ok(())
    }

    /// Returns the whole reservation to the OS and uninitializes.
    ///
    /// Committed pages do not need a separate decommit; releasing the
    /// reservation reclaims them.
    pub fn release(&self) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::uninitialized());
        }

        let base = self.buffer.get() as *mut u8;
        // SAFETY: base/buffer_size denote exactly our reservation; the
        // allocator is the only referent.
        let ok = unsafe {
            platform::release(NonNull::new_unchecked(base), self.buffer_size.get())
        };
        if !ok {
            return Err(AllocError::new(AllocErrorKind::ReserveFailed)
                .with_message("failed to release reservation"));
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

    /// Bytes currently committed; a whole multiple of the page size.
    #[inline]
    pub fn committed_size(&self) -> usize {
        self.committed_size.get()
    }

    /// Total reserved capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer_size.get()
    }

    /// Grows the committed prefix to cover `new_used` bytes.
    ///
    /// The cursor is untouched; on failure the observable state is exactly
    /// the pre-call state.
    fn commit_to(&self, new_used: usize) -> AllocResult<()> {
        let committed = self.committed_size.get();
        if new_used <= committed {
            return Ok(());
        }

        let commit_ptr = (self.buffer.get() + committed) as *mut u8;
        let commit_size = align_up(new_used - committed, self.page_size.get());

        // SAFETY: the commit range starts at the end of the committed
        // prefix and stays within the reservation (the kernel backs the
        // trailing partial page of an unaligned capacity).
        let ok = unsafe {
            platform::commit(
                NonNull::new_unchecked(commit_ptr),
                commit_size,
                MemoryProtection::ReadWrite,
            )
        };
        if !ok {
            return Err(AllocError::new(AllocErrorKind::CommitFailed));
        }

        self.committed_size.set(committed + commit_size);

        #[cfg(feature = "logging")]
        tracing::trace!(committed = committed + commit_size, "commit grew");

        Ok(())
    }

    fn allocate_impl(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        if !self.is_initialized() {
            return Err(AllocError::uninitialized());
        }
        if layout.size() == 0 {
            return Err(AllocError::invalid_layout("zero-sized request"));
        }

        let (start, new_used) = bump_from_buffer(
            self.buffer.get(),
            self.buffer_size.get(),
            self.allocated_size.get(),
            layout.size(),
            layout.align(),
        )
        .ok_or(AllocError::out_of_memory(layout))?;

        // Commit before publishing the new cursor so a refused commit leaves
        // the allocator untouched.
        self.commit_to(new_used)?;

        self.allocated_size.set(new_used);
        self.last_alloc_offset.set(start - self.buffer.get());

        // SAFETY: start lies inside the non-null reservation.
        Ok(unsafe { NonNull::new_unchecked(start as *mut u8) })
    }
}

impl Default for VMemLinearAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VMemLinearAllocator {
    fn drop(&mut self) {
        if self.is_initialized() {
            let _ = self.release();
        }
    }
}

// SAFETY: the allocator owns its reservation exclusively; no state is
// shared with other instances, so moving it between threads is sound.
unsafe impl Send for VMemLinearAllocator {}

// SAFETY: bump discipline over the committed prefix of a private
// reservation; deallocate is a no-op by contract.
unsafe impl RegionAllocator for VMemLinearAllocator {
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
            // In-place resize of the most recent allocation; the shrink case
            // rides the unsigned wraparound (see LinearAllocator).
            let delta = new_layout.size().wrapping_sub(old_size);
            let new_used = self.allocated_size.get().wrapping_add(delta);
            if new_used > self.buffer_size.get() {
                return Err(AllocError::out_of_memory(new_layout));
            }

            self.commit_to(new_used)?;

            self.allocated_size.set(new_used);
            // SAFETY: old_ptr equals a previously returned allocation start.
            return Ok(unsafe { NonNull::new_unchecked(old_ptr) });
        }

        let new_ptr = self.allocate_impl(new_layout)?;

        let bytes_to_copy = old_size.min(new_layout.size());
        if bytes_to_copy > 0 {
            // SAFETY: caller guarantees old_ptr is live for old_size bytes;
            // the fresh allocation cannot overlap it.
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
