//! Stack-frame allocator over one reserved virtual memory range.
//!
//! Same frame discipline as [`StackFrameAllocator`](super::StackFrameAllocator)
//! but without segmenting: a single contiguous reservation is committed
//! lazily as the cursor advances, frames are plain offsets into it, and
//! popping rewinds the cursor to the frame record. Committed pages persist
//! across pops; [`decommit_slack`](VMemStackFrameAllocator::decommit_slack)
//! hands idle pages back to the OS on request.

use core::alloc::Layout;
use core::cell::Cell;
use core::mem;
use core::ptr::{self, NonNull};

use super::{bump_from_buffer, AllocatorFrame, FrameRecord, RegionAllocator};
use crate::error::{AllocError, AllocErrorKind, AllocResult};
use crate::platform::{self, MemoryProtection};
use crate::utils::{align_up, is_aligned_to, is_ptr_in_range};

/// Stack-frame allocator backed by one lazily committed reservation.
///
/// [`initialize`](Self::initialize) reserves a page-aligned capacity with no
/// access permissions; allocations commit pages on demand. Allocation
/// requires a live frame. [`release`](Self::release) (or drop) returns the
/// reservation, refusing while frames are live.
///
/// The allocator is single-threaded and `!Sync`.
pub struct VMemStackFrameAllocator {
    /// Reservation base address; zero iff uninitialized.
    buffer: Cell<usize>,
    /// Innermost live frame record.
    live_frame: Cell<*mut FrameRecord>,
    buffer_size: Cell<usize>,
    allocated_size: Cell<usize>,
    /// Committed prefix length; always a whole multiple of the page size.
    committed_size: Cell<usize>,
    /// Offset of the most recent allocation, for in-place reallocation.
    last_alloc_offset: Cell<usize>,
    /// Page size queried from the VM layer at initialization.
    page_size: Cell<usize>,
}

impl VMemStackFrameAllocator {
    /// Creates an uninitialized allocator.
    #[inline]
    pub const fn new() -> Self {
        Self {
            buffer: Cell::new(0),
            live_frame: Cell::new(ptr::null_mut()),
            buffer_size: Cell::new(0),
            allocated_size: Cell::new(0),
            committed_size: Cell::new(0),
            last_alloc_offset: Cell::new(0),
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
    /// `capacity` must be page-aligned, at least one page, and within the
    /// counter range; on rejection the allocator stays uninitialized.
    pub fn initialize(&self, capacity: usize) -> AllocResult<()> {
        if self.is_initialized() {
            return Err(AllocError::new(AllocErrorKind::AlreadyInitialized));
        }

        let page_size = platform::page_size();
        if capacity < page_size
            || !is_aligned_to(capacity, page_size)
            || capacity > isize::MAX as usize
        {
            return Err(AllocError::invalid_layout("capacity not page-aligned"));
        }

        let ptr = platform::reserve(capacity)
            .ok_or(AllocError::new(AllocErrorKind::ReserveFailed))?;

        self.buffer.set(ptr.as_ptr() as usize);
        self.live_frame.set(ptr::null_mut());
        self.buffer_size.set(capacity);
        self.allocated_size.set(0);
        self.committed_size.set(0);
        self.last_alloc_offset.set(capacity);
        self.page_size.set(page_size);

        #[cfg(feature = "logging")]
        tracing::trace!(capacity, page_size, "stack frame range reserved");

        Ok(())
    }

    /// Returns the reservation to the OS and uninitializes.
    ///
    /// Refused while frames are live (the allocator leaks instead of
    /// corrupting the caller). Committed pages need no separate decommit.
    pub fn release(&self) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::uninitialized());
        }
        if self.has_live_frame() {
            return Err(AllocError::new(AllocErrorKind::LiveFrame));
        }

        let base = self.buffer.get() as *mut u8;
        // SAFETY: base/buffer_size denote exactly our reservation; no frame
        // is live so nothing points into it.
        let ok = unsafe {
            platform::release(NonNull::new_unchecked(base), self.buffer_size.get())
        };
        if !ok {
            return Err(AllocError::new(AllocErrorKind::ReserveFailed)
                .with_message("failed to release reservation"));
        }

        self.buffer.set(0);
        self.live_frame.set(ptr::null_mut());
        self.buffer_size.set(0);
        self.allocated_size.set(0);
        self.committed_size.set(0);
        self.last_alloc_offset.set(0);
        Ok(())
    }

    /// Decommits committed-but-unused pages beyond `min_slack` bytes.
    ///
    /// The releasable tail `committed - used - min_slack` is rounded down to
    /// a whole page multiple and decommitted from the end of the committed
    /// prefix. `min_slack` must be page-aligned.
    pub fn decommit_slack(&self, min_slack: usize) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::uninitialized());
        }

        let page_size = self.page_size.get();
        if !is_aligned_to(min_slack, page_size) || min_slack > isize::MAX as usize {
            return Err(AllocError::invalid_layout("slack not page-aligned"));
        }

        let committed = self.committed_size.get();
        let slack = committed - self.allocated_size.get();

        if slack > min_slack {
            // Round down to a whole page multiple.
            let decommit_size = (slack - min_slack) & !(page_size - 1);
            if decommit_size != 0 {
                let tail = (self.buffer.get() + committed - decommit_size) as *mut u8;
                // SAFETY: the tail range is a committed, page-aligned suffix
                // of the committed prefix, entirely past the cursor.
                let ok = unsafe {
                    platform::decommit(NonNull::new_unchecked(tail), decommit_size)
                };
                if !ok {
                    return Err(AllocError::new(AllocErrorKind::DecommitFailed));
                }

                self.committed_size.set(committed - decommit_size);

                #[cfg(feature = "logging")]
                tracing::trace!(decommitted = decommit_size, "slack returned to the OS");
            }
        }

        Ok(())
    }

    /// True once [`initialize`](Self::initialize) has succeeded.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.buffer.get() != 0
    }

    /// True while at least one frame is live.
    #[inline]
    pub fn has_live_frame(&self) -> bool {
        !self.live_frame.get().is_null()
    }

    /// Bytes currently allocated, frame records and padding included.
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

    /// Per-frame bookkeeping cost in bytes.
    #[inline]
    pub fn frame_overhead(&self) -> usize {
        mem::size_of::<FrameRecord>()
    }

    /// Pushes a frame and returns its owning handle.
    ///
    /// On failure (uninitialized allocator, out of memory) an inert handle
    /// is returned; check [`can_pop`](AllocatorFrame::can_pop).
    pub fn push_frame(&self) -> AllocatorFrame<'_> {
        if !self.is_initialized() {
            return AllocatorFrame::new();
        }

        let record = match self.allocate_impl(Layout::new::<FrameRecord>()) {
            Ok(ptr) => ptr.as_ptr().cast::<FrameRecord>(),
            // Failed to allocate our frame, out of memory?
            Err(_) => return AllocatorFrame::new(),
        };

        // SAFETY: record points at freshly allocated, committed memory.
        unsafe { ptr::write(record, FrameRecord { prev: self.live_frame.get() }) };
        self.live_frame.set(record);

        AllocatorFrame::live(self as *const Self as *const (), Self::pop_impl, record)
    }

    /// Pops `frame`; equivalent to [`AllocatorFrame::pop`].
    pub fn pop_frame(&self, frame: &mut AllocatorFrame<'_>) -> bool {
        frame.pop()
    }

    /// Grows the committed prefix to cover `new_used` bytes; see
    /// `VMemLinearAllocator::commit_to`.
    fn commit_to(&self, new_used: usize) -> AllocResult<()> {
        let committed = self.committed_size.get();
        if new_used <= committed {
            return Ok(());
        }

        let commit_ptr = (self.buffer.get() + committed) as *mut u8;
        let commit_size = align_up(new_used - committed, self.page_size.get());

        // SAFETY: the commit range extends the committed prefix and stays
        // within the page-aligned reservation.
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
        Ok(())
    }

    fn allocate_impl(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
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

    /// Pop routine invoked through the handle's function pointer.
    unsafe fn pop_impl(allocator: *const (), record: *mut FrameRecord) -> bool {
        // SAFETY: the handle's lifetime ties `allocator` to a live Self.
        let this = unsafe { &*(allocator as *const Self) };

        if !this.is_initialized() {
            return false;
        }

        // Only the innermost frame may be popped.
        if record != this.live_frame.get() {
            return false;
        }

        // SAFETY: record is the live frame record, written at push time.
        this.live_frame.set(unsafe { (*record).prev });

        // Rewind the cursor to the record; committed pages stay committed
        // until decommit_slack is asked for them.
        this.allocated_size.set(record as usize - this.buffer.get());

        true
    }
}

impl Default for VMemStackFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VMemStackFrameAllocator {
    fn drop(&mut self) {
        if self.is_initialized() {
            // Leaks if frames are still live.
            let _ = self.release();
        }
    }
}

// SAFETY: the allocator owns its reservation exclusively; the Cell fields
// keep it !Sync, moving it between threads is sound.
unsafe impl Send for VMemStackFrameAllocator {}

// SAFETY: bump discipline over the committed prefix of a private
// reservation; deallocate is a no-op by contract.
unsafe impl RegionAllocator for VMemStackFrameAllocator {
    unsafe fn allocate(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        if !self.is_initialized() {
            return Err(AllocError::uninitialized());
        }
        if layout.size() == 0 {
            return Err(AllocError::invalid_layout("zero-sized request"));
        }
        if !self.has_live_frame() {
            // Need at least a single live frame.
            return Err(AllocError::new(AllocErrorKind::FrameMismatch));
        }

        self.allocate_impl(layout)
    }

    #[inline]
    unsafe fn deallocate(&self, _ptr: *mut u8, _size: usize) {
        // Not supported, does nothing.
    }

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
        if !self.has_live_frame() {
            return Err(AllocError::new(AllocErrorKind::FrameMismatch));
        }

        let last_allocation = self.buffer.get() + self.last_alloc_offset.get();
        if last_allocation == old_ptr as usize {
            // In-place resize of the most recent allocation; shrink rides
            // the unsigned wraparound (see LinearAllocator).
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

        is_ptr_in_range(ptr, self.buffer.get(), self.allocated_size.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::page_size;

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn starts_uninitialized() {
        let alloc = VMemStackFrameAllocator::new();
        assert!(!alloc.is_initialized());
        assert!(!alloc.push_frame().can_pop());
        assert!(alloc.decommit_slack(0).is_err());
    }

    #[test]
    fn initialize_requires_page_aligned_capacity() {
        let page = page_size();
        let alloc = VMemStackFrameAllocator::new();

        assert!(alloc.initialize(page - 1).is_err());
        assert!(alloc.initialize(page + 1).is_err());
        assert!(!alloc.is_initialized());

        alloc.initialize(page * 4).unwrap();
        assert!(alloc.is_initialized());
        assert_eq!(
            alloc.initialize(page * 4).unwrap_err().kind(),
            AllocErrorKind::AlreadyInitialized
        );
    }

    #[test]
    fn frames_rewind_the_cursor() {
        let page = page_size();
        let alloc = VMemStackFrameAllocator::with_capacity(page * 16).unwrap();
        let frame_overhead = alloc.frame_overhead();

        {
            let _frame = alloc.push_frame();
            assert!(alloc.has_live_frame());
            assert_eq!(alloc.allocated_size(), frame_overhead);

            let p = unsafe { alloc.allocate(layout(2, 1)).unwrap() };
            unsafe { p.as_ptr().write_bytes(0xCD, 2) };
            assert_eq!(alloc.allocated_size(), 2 + frame_overhead);
            assert!(alloc.is_owner_of(p.as_ptr()));
        }

        assert_eq!(alloc.allocated_size(), 0);
        assert!(!alloc.has_live_frame());
    }

    #[test]
    fn allocation_requires_a_live_frame() {
        let page = page_size();
        let alloc = VMemStackFrameAllocator::with_capacity(page * 2).unwrap();
        let err = unsafe { alloc.allocate(layout(8, 1)).unwrap_err() };
        assert_eq!(err.kind(), AllocErrorKind::FrameMismatch);
    }

    #[test]
    fn nested_frames_pop_lifo() {
        let page = page_size();
        let alloc = VMemStackFrameAllocator::with_capacity(page * 8).unwrap();

        let mut outer = alloc.push_frame();
        unsafe { alloc.allocate(layout(32, 1)).unwrap() };
        let after_outer = alloc.allocated_size();

        let mut inner = alloc.push_frame();
        unsafe { alloc.allocate(layout(64, 1)).unwrap() };

        let before = alloc.allocated_size();
        assert!(!outer.pop());
        assert!(outer.can_pop());
        assert_eq!(alloc.allocated_size(), before);

        assert!(inner.pop());
        assert_eq!(alloc.allocated_size(), after_outer);

        assert!(outer.pop());
        assert_eq!(alloc.allocated_size(), 0);
        assert!(!alloc.has_live_frame());
    }

    #[test]
    fn commit_grows_and_survives_pops() {
        let page = page_size();
        let alloc = VMemStackFrameAllocator::with_capacity(page * 16).unwrap();

        {
            let _frame = alloc.push_frame();
            let p = unsafe { alloc.allocate(layout(page * 3, 1)).unwrap() };
            unsafe { p.as_ptr().write_bytes(0xEE, page * 3) };
            assert!(alloc.committed_size() >= page * 3);
            assert_eq!(alloc.committed_size() % page, 0);
        }

        // Popping rewinds the cursor but keeps pages committed.
        assert_eq!(alloc.allocated_size(), 0);
        assert!(alloc.committed_size() >= page * 3);
    }

    #[test]
    fn decommit_slack_returns_idle_pages() {
        let page = page_size();
        let alloc = VMemStackFrameAllocator::with_capacity(page * 16).unwrap();

        {
            let _frame = alloc.push_frame();
            unsafe { alloc.allocate(layout(page * 4, 1)).unwrap() };
        }
        let committed = alloc.committed_size();
        assert!(committed >= page * 4);

        // Unaligned slack is rejected.
        assert!(alloc.decommit_slack(1).is_err());
        assert_eq!(alloc.committed_size(), committed);

        // Keep two pages of slack around.
        alloc.decommit_slack(page * 2).unwrap();
        assert_eq!(alloc.committed_size(), page * 2);

        // Full pop plus zero min_slack drains the committed range entirely.
        alloc.decommit_slack(0).unwrap();
        assert_eq!(alloc.committed_size(), 0);

        // The range recommits transparently on the next use.
        let _frame = alloc.push_frame();
        let p = unsafe { alloc.allocate(layout(16, 1)).unwrap() };
        unsafe { p.as_ptr().write_bytes(0x11, 16) };
        assert_eq!(alloc.committed_size(), page);
    }

    #[test]
    fn decommit_slack_keeps_used_pages() {
        let page = page_size();
        let alloc = VMemStackFrameAllocator::with_capacity(page * 8).unwrap();

        let _frame = alloc.push_frame();
        let p = unsafe { alloc.allocate(layout(page + 16, 1)).unwrap() };
        unsafe { p.as_ptr().write_bytes(0x42, page + 16) };

        alloc.decommit_slack(0).unwrap();
        // Pages covering live allocations must stay readable.
        assert_eq!(alloc.committed_size(), page * 2);
        unsafe {
            assert_eq!(*p.as_ptr(), 0x42);
            assert_eq!(*p.as_ptr().add(page + 15), 0x42);
        }
    }

    #[test]
    fn reallocate_in_place_and_copy_paths() {
        let page = page_size();
        let alloc = VMemStackFrameAllocator::with_capacity(page * 8).unwrap();
        let _frame = alloc.push_frame();

        unsafe {
            let p = alloc.allocate(layout(8, 1)).unwrap();
            let before = alloc.allocated_size();

            let q = alloc.reallocate(p.as_ptr(), 8, layout(page, 1)).unwrap();
            assert_eq!(q, p);
            assert_eq!(alloc.allocated_size(), before + page - 8);

            let r = alloc.reallocate(q.as_ptr(), page, layout(8, 1)).unwrap();
            assert_eq!(r, p);
            assert_eq!(alloc.allocated_size(), before);

            // Another allocation in between forces the copy path.
            r.as_ptr().copy_from_nonoverlapping([7u8, 7, 7, 7, 7, 7, 7, 7].as_ptr(), 8);
            let _ = alloc.allocate(layout(1, 1)).unwrap();
            let s = alloc.reallocate(r.as_ptr(), 8, layout(64, 1)).unwrap();
            assert_ne!(s, r);
            assert_eq!(core::slice::from_raw_parts(s.as_ptr(), 8), &[7u8; 8]);
        }
    }

    #[test]
    fn release_refuses_under_live_frames() {
        let page = page_size();
        let alloc = VMemStackFrameAllocator::with_capacity(page * 2).unwrap();

        let mut frame = alloc.push_frame();
        assert_eq!(alloc.release().unwrap_err().kind(), AllocErrorKind::LiveFrame);
        assert!(alloc.is_initialized());

        assert!(frame.pop());
        alloc.release().unwrap();
        assert!(!alloc.is_initialized());
    }

    #[test]
    fn exhaustion_is_reported_cleanly() {
        let page = page_size();
        let alloc = VMemStackFrameAllocator::with_capacity(page).unwrap();

        let _frame = alloc.push_frame();
        let available = page - alloc.frame_overhead();
        unsafe {
            alloc.allocate(layout(available, 1)).unwrap();
            let err = alloc.allocate(layout(1, 1)).unwrap_err();
            assert_eq!(err.kind(), AllocErrorKind::OutOfMemory);
            assert_eq!(alloc.allocated_size(), page);
        }
    }
}
