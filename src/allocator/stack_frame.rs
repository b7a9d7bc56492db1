//! Multi-segment stack-frame allocator.
//!
//! Allocations are grouped into frames pushed and popped in LIFO order.
//! Memory comes from segments: contiguous buffers either obtained from the
//! virtual memory layer on demand or registered by the caller. Popping a
//! frame rewinds to the frame record, recycling every segment that was
//! filled after it onto a free list for reuse.
//!
//! ## Invariants
//!
//! - Every segment is on exactly one of the two intrusive lists (live or
//!   free); the live list head is the segment allocations are served from.
//! - `live_frame` is null iff `live_segment` is null.
//! - A frame record allocated in a fresh segment sits immediately after the
//!   segment header with zero padding (enforced below by the alignment
//!   assertion); the pop walk relies on its offset being exactly zero to
//!   recycle the segment wholesale.

use core::alloc::Layout;
use core::cell::Cell;
use core::mem;
use core::ptr::{self, NonNull};

use super::{bump_from_buffer, can_satisfy, AllocatorFrame, FrameRecord, RegionAllocator};
use crate::error::{AllocError, AllocErrorKind, AllocResult};
use crate::platform::{self, MemoryProtection};
use crate::utils::{is_aligned_to, is_ptr_in_range};

/// Minimum alignment of segment buffers; leaves the low bits of a segment
/// address free for flags.
const SEGMENT_MIN_ALIGNMENT: usize = 8;

/// Header placed at the start of every segment.
///
/// The link pointer and the flag bits share one word: the flags occupy the
/// low bits (always zero in a pointer aligned to [`SEGMENT_MIN_ALIGNMENT`]),
/// the link the remaining bits. Depending on which list the segment is on,
/// the link points to the next live or next free segment.
#[repr(C)]
struct SegmentHeader {
    packed: usize,
    segment_size: usize,
    allocated_size: usize,
}

impl SegmentHeader {
    const FLAGS_MASK: usize = SEGMENT_MIN_ALIGNMENT - 1;
    const EXTERNALLY_MANAGED: usize = 0x1;

    fn new(segment_size: usize) -> Self {
        Self { packed: 0, segment_size, allocated_size: 0 }
    }

    /// Start of the user buffer, right after the header.
    #[inline]
    fn buffer_base(&self) -> usize {
        self as *const Self as usize + mem::size_of::<Self>()
    }

    /// User buffer capacity (total size minus the header).
    #[inline]
    fn buffer_size(&self) -> usize {
        self.segment_size - mem::size_of::<Self>()
    }

    #[inline]
    fn link(&self) -> *mut SegmentHeader {
        (self.packed & !Self::FLAGS_MASK) as *mut SegmentHeader
    }

    #[inline]
    fn set_link(&mut self, next: *mut SegmentHeader) {
        debug_assert!(is_aligned_to(next as usize, SEGMENT_MIN_ALIGNMENT));
        self.packed = next as usize | (self.packed & Self::FLAGS_MASK);
    }

    #[inline]
    fn is_externally_managed(&self) -> bool {
        self.packed & Self::EXTERNALLY_MANAGED != 0
    }

    #[inline]
    fn set_externally_managed(&mut self, value: bool) {
        self.packed = (self.packed & !Self::EXTERNALLY_MANAGED)
            | if value { Self::EXTERNALLY_MANAGED } else { 0 };
    }
}

// A frame record allocated in a fresh segment must land immediately after
// the header, with no alignment padding in between.
const _: () = assert!(mem::align_of::<FrameRecord>() == mem::align_of::<SegmentHeader>());

/// Stack-frame allocator over a chain of segments.
///
/// Allocation requires a live frame (see [`push_frame`](Self::push_frame));
/// all memory returns to the free list when the matching frame is popped,
/// and segments are reused across push/pop cycles. Callers can donate
/// buffers with [`register_segment`](Self::register_segment); donated
/// buffers are never freed by the allocator.
///
/// The allocator is single-threaded and `!Sync`.
pub struct StackFrameAllocator {
    /// Head of the live list: the segment allocations are served from.
    live_segment: Cell<*mut SegmentHeader>,
    /// Innermost live frame record.
    live_frame: Cell<*mut FrameRecord>,
    /// Head of the free list, unordered.
    free_segments: Cell<*mut SegmentHeader>,
    /// Minimum size for segments obtained from the VM layer; zero iff
    /// uninitialized.
    default_segment_size: Cell<usize>,
    /// Offset of the most recent allocation within the live segment's
    /// buffer, for in-place reallocation.
    last_alloc_offset: Cell<usize>,
}

impl StackFrameAllocator {
    /// Creates an uninitialized allocator.
    #[inline]
    pub const fn new() -> Self {
        Self {
            live_segment: Cell::new(ptr::null_mut()),
            live_frame: Cell::new(ptr::null_mut()),
            free_segments: Cell::new(ptr::null_mut()),
            default_segment_size: Cell::new(0),
            last_alloc_offset: Cell::new(0),
        }
    }

    /// Creates an allocator with the given default segment size in one step.
    pub fn with_segment_size(segment_size: usize) -> AllocResult<Self> {
        let allocator = Self::new();
        allocator.initialize(segment_size)?;
        Ok(allocator)
    }

    /// Sets the default segment size and readies the allocator.
    ///
    /// `segment_size` is the minimum size of segments obtained from the VM
    /// layer; oversized requests get a segment large enough for themselves.
    pub fn initialize(&self, segment_size: usize) -> AllocResult<()> {
        if self.is_initialized() {
            return Err(AllocError::new(AllocErrorKind::AlreadyInitialized));
        }

        if segment_size == 0 || segment_size > isize::MAX as usize {
            return Err(AllocError::invalid_layout("segment size out of range"));
        }

        self.live_segment.set(ptr::null_mut());
        self.live_frame.set(ptr::null_mut());
        self.free_segments.set(ptr::null_mut());
        self.default_segment_size.set(segment_size);
        self.last_alloc_offset.set(segment_size);

        #[cfg(feature = "logging")]
        tracing::trace!(segment_size, "stack frame allocator initialized");

        Ok(())
    }

    /// Frees every internally-allocated segment and uninitializes.
    ///
    /// Refused while frames are live: releasing under a live frame would
    /// corrupt the caller, so the allocator leaks instead. Externally
    /// managed segments are left to their owners.
    pub fn release(&self) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::uninitialized());
        }
        if self.has_live_frame() {
            return Err(AllocError::new(AllocErrorKind::LiveFrame));
        }

        debug_assert!(self.live_segment.get().is_null());

        let mut segment = self.free_segments.get();
        while !segment.is_null() {
            // SAFETY: segments on the free list are live headers we placed
            // there; the link is read before the memory is freed.
            unsafe {
                let next = (*segment).link();
                if !(*segment).is_externally_managed() {
                    let size = (*segment).segment_size;
                    let _ = platform::free(NonNull::new_unchecked(segment.cast::<u8>()), size);
                }
                segment = next;
            }
        }

        self.free_segments.set(ptr::null_mut());
        self.default_segment_size.set(0);
        Ok(())
    }

    /// True once [`initialize`](Self::initialize) has succeeded.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.default_segment_size.get() != 0
    }

    /// True while at least one frame is live.
    #[inline]
    pub fn has_live_frame(&self) -> bool {
        !self.live_frame.get().is_null()
    }

    /// Bytes currently allocated across all live segments, frame records and
    /// alignment padding included.
    ///
    /// Walks the live list; not intended for hot paths.
    pub fn allocated_size(&self) -> usize {
        let mut total = 0;
        let mut segment = self.live_segment.get();
        while !segment.is_null() {
            // SAFETY: live-list segments are valid headers.
            unsafe {
                total += (*segment).allocated_size;
                segment = (*segment).link();
            }
        }
        total
    }

    /// Per-frame bookkeeping cost in bytes.
    #[inline]
    pub fn frame_overhead(&self) -> usize {
        mem::size_of::<FrameRecord>()
    }

    /// Per-segment bookkeeping cost in bytes.
    #[inline]
    pub fn segment_overhead(&self) -> usize {
        mem::size_of::<SegmentHeader>()
    }

    /// Donates a caller-owned buffer as a segment.
    ///
    /// The buffer must be aligned to at least 8 bytes and larger than the
    /// segment header. It goes onto the free list marked externally managed:
    /// the allocator will carve allocations from it but never free it.
    ///
    /// # Safety
    /// `buffer` must be valid for reads and writes of `buffer_size` bytes
    /// until this allocator is released; the caller must not touch it while
    /// the allocator holds it.
    pub unsafe fn register_segment(&self, buffer: *mut u8, buffer_size: usize) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::uninitialized());
        }

        if buffer.is_null() {
            return Err(AllocError::invalid_layout("null buffer"));
        }
        if buffer_size <= mem::size_of::<SegmentHeader>() || buffer_size > isize::MAX as usize {
            return Err(AllocError::invalid_layout("buffer smaller than segment header"));
        }
        if !is_aligned_to(buffer as usize, SEGMENT_MIN_ALIGNMENT) {
            return Err(AllocError::invalid_layout("buffer misaligned"));
        }

        let header = buffer.cast::<SegmentHeader>();
        // SAFETY: the buffer is valid, large enough and suitably aligned for
        // in-place construction of the header.
        unsafe {
            ptr::write(header, SegmentHeader::new(buffer_size));
            (*header).set_link(self.free_segments.get());
            (*header).set_externally_managed(true);
        }
        self.free_segments.set(header);

        #[cfg(feature = "logging")]
        tracing::trace!(size = buffer_size, "external segment registered");

        Ok(())
    }

    /// Pushes a frame and returns its owning handle.
    ///
    /// The frame record is allocated through the ordinary path, so the push
    /// may acquire a new segment. On failure (uninitialized allocator, out
    /// of memory) an inert handle is returned; check
    /// [`can_pop`](AllocatorFrame::can_pop).
    pub fn push_frame(&self) -> AllocatorFrame<'_> {
        if !self.is_initialized() {
            return AllocatorFrame::new();
        }

        let record = match self.allocate_impl(Layout::new::<FrameRecord>()) {
            Ok(ptr) => ptr.as_ptr().cast::<FrameRecord>(),
            // Failed to allocate our frame, out of memory?
            Err(_) => return AllocatorFrame::new(),
        };

        // SAFETY: record points at freshly allocated, suitably aligned
        // memory inside a live segment.
        unsafe { ptr::write(record, FrameRecord { prev: self.live_frame.get() }) };
        self.live_frame.set(record);

        AllocatorFrame::live(self as *const Self as *const (), Self::pop_impl, record)
    }

    /// Pops `frame`; equivalent to [`AllocatorFrame::pop`].
    pub fn pop_frame(&self, frame: &mut AllocatorFrame<'_>) -> bool {
        frame.pop()
    }

    /// Finds a segment able to satisfy the request: the live segment if it
    /// can, else the first fitting free-list segment (moved to the live
    /// list), else a new segment from the VM layer.
    fn find_free_segment(&self, size: usize, alignment: usize) -> AllocResult<NonNull<SegmentHeader>> {
        let live = self.live_segment.get();
        if !live.is_null() {
            // SAFETY: the live head is a valid header.
            let fits = unsafe {
                can_satisfy(
                    (*live).buffer_base(),
                    (*live).buffer_size(),
                    (*live).allocated_size,
                    size,
                    alignment,
                )
            };
            if fits {
                // SAFETY: checked non-null above.
                return Ok(unsafe { NonNull::new_unchecked(live) });
            }
        }

        let mut prev: *mut SegmentHeader = ptr::null_mut();
        let mut segment = self.free_segments.get();
        while !segment.is_null() {
            // SAFETY: free-list segments are valid headers; links are only
            // rewritten after the scan position has moved past them.
            unsafe {
                let next = (*segment).link();
                if can_satisfy(
                    (*segment).buffer_base(),
                    (*segment).buffer_size(),
                    (*segment).allocated_size,
                    size,
                    alignment,
                ) {
                    // Unlink from the free list and make it the live head.
                    if prev.is_null() {
                        self.free_segments.set(next);
                    } else {
                        (*prev).set_link(next);
                    }
                    (*segment).set_link(self.live_segment.get());
                    self.live_segment.set(segment);
                    return Ok(NonNull::new_unchecked(segment));
                }
                prev = segment;
                segment = next;
            }
        }

        // Failed to find a segment with enough space, get a new one.
        let segment = self.allocate_segment(size, alignment)?;
        // SAFETY: allocate_segment returned a freshly constructed header.
        unsafe { (*segment.as_ptr()).set_link(self.live_segment.get()) };
        self.live_segment.set(segment.as_ptr());
        Ok(segment)
    }

    /// Obtains a new segment from the VM layer, sized to guarantee the
    /// request fits even after the header and worst-case alignment padding.
    fn allocate_segment(&self, size: usize, alignment: usize) -> AllocResult<NonNull<SegmentHeader>> {
        let header_size = mem::size_of::<SegmentHeader>();
        let desired = size
            .checked_add(alignment)
            .and_then(|s| s.checked_add(header_size))
            .and_then(|s| s.checked_add(alignment - 1))
            .ok_or(AllocError::new(AllocErrorKind::SizeOverflow))?
            & !(alignment - 1);
        let segment_size = desired.max(self.default_segment_size.get());

        let ptr = platform::alloc(segment_size, MemoryProtection::ReadWrite)
            .ok_or(AllocError::new(AllocErrorKind::OutOfMemory))?;
        debug_assert!(is_aligned_to(ptr.as_ptr() as usize, SEGMENT_MIN_ALIGNMENT));

        #[cfg(feature = "logging")]
        tracing::trace!(segment_size, "segment acquired");

        let header = ptr.as_ptr().cast::<SegmentHeader>();
        // SAFETY: the mapping is committed, read-write and page-aligned.
        unsafe { ptr::write(header, SegmentHeader::new(segment_size)) };
        // SAFETY: just written.
        Ok(unsafe { NonNull::new_unchecked(header) })
    }

    fn allocate_impl(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        let segment = self.find_free_segment(layout.size(), layout.align())?.as_ptr();

        // SAFETY: find_free_segment returned a valid live header that can
        // satisfy this request.
        unsafe {
            let base = (*segment).buffer_base();
            let (start, new_used) = bump_from_buffer(
                base,
                (*segment).buffer_size(),
                (*segment).allocated_size,
                layout.size(),
                layout.align(),
            )
            .ok_or(AllocError::out_of_memory(layout))?;

            (*segment).allocated_size = new_used;
            self.last_alloc_offset.set(start - base);

            Ok(NonNull::new_unchecked(start as *mut u8))
        }
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

        // Walk the live list from the head. Segments filled entirely after
        // the frame go back to the free list; the segment holding the record
        // is rewound to it, or recycled wholesale when the record sat at the
        // very start of its buffer (the zero-padding invariant).
        let mut live = this.live_segment.get();
        let mut free = this.free_segments.get();

        while !live.is_null() {
            // SAFETY: live-list segments are valid headers; the link is
            // re-pointed only after it has been read.
            unsafe {
                let next = (*live).link();
                let base = (*live).buffer_base();

                if is_ptr_in_range(record.cast::<u8>(), base, (*live).allocated_size) {
                    let popped_used = record as usize - base;
                    if popped_used == 0 {
                        // The whole segment is popped, recycle it.
                        (*live).set_link(free);
                        (*live).allocated_size = 0;
                        free = live;
                        live = next;
                    } else {
                        (*live).allocated_size = popped_used;
                    }
                    break;
                }

                // The frame is in an earlier segment; this one drains.
                (*live).set_link(free);
                (*live).allocated_size = 0;
                free = live;
                live = next;
            }
        }

        this.live_segment.set(live);
        this.free_segments.set(free);

        debug_assert_eq!(this.live_frame.get().is_null(), this.live_segment.get().is_null());

        true
    }
}

impl Default for StackFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StackFrameAllocator {
    fn drop(&mut self) {
        if self.is_initialized() {
            // Leaks if frames are still live; release refuses to free under
            // a live frame.
            let _ = self.release();
        }
    }
}

// SAFETY: the allocator exclusively owns every segment it links; the raw
// header pointers never alias another allocator's memory, so moving the
// whole allocator to another thread is sound. The Cell fields keep it !Sync.
unsafe impl Send for StackFrameAllocator {}

// SAFETY: bump discipline within exclusively owned segments; deallocate is a
// no-op by contract.
unsafe impl RegionAllocator for StackFrameAllocator {
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

        let live = self.live_segment.get();
        if !live.is_null() {
            // SAFETY: the live head is a valid header.
            let (base, used, capacity) = unsafe {
                ((*live).buffer_base(), (*live).allocated_size, (*live).buffer_size())
            };

            if base + self.last_alloc_offset.get() == old_ptr as usize {
                // In-place resize of the most recent allocation, scoped to
                // the current segment; shrink rides the unsigned wraparound.
                let delta = new_layout.size().wrapping_sub(old_size);
                let new_used = used.wrapping_add(delta);
                if new_used <= capacity {
                    // SAFETY: live is a valid header.
                    unsafe { (*live).allocated_size = new_used };
                    // SAFETY: old_ptr equals a previously returned start.
                    return Ok(unsafe { NonNull::new_unchecked(old_ptr) });
                }
                // Not enough space in the live segment; fall through to a
                // fresh allocation and copy.
            }
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

    /// Walks the live list; not intended for hot paths.
    fn is_owner_of(&self, ptr: *const u8) -> bool {
        if !self.is_initialized() {
            return false;
        }

        let mut segment = self.live_segment.get();
        while !segment.is_null() {
            // SAFETY: live-list segments are valid headers.
            unsafe {
                if is_ptr_in_range(ptr, (*segment).buffer_base(), (*segment).allocated_size) {
                    return true;
                }
                segment = (*segment).link();
            }
        }
        false
    }
}
