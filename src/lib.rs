//! # region-alloc
//!
//! Region-based memory allocators that carve allocations linearly out of
//! pre-reserved byte buffers and release them in bulk.
//!
//! Built for callers that can amortize deallocation — frame-scoped scratch
//! memory in simulation loops, per-request pools in servers, per-phase
//! working sets in batch pipelines — by discarding many objects at once
//! instead of tracking them individually. Freeing an individual allocation
//! is always a no-op; memory comes back by resetting a linear region,
//! popping a frame, or releasing the allocator.
//!
//! ## Variants
//!
//! - [`LinearAllocator`] — bump pointer over a caller-provided buffer,
//!   reclaimed with [`reset`](LinearAllocator::reset).
//! - [`VMemLinearAllocator`] — bump pointer over a reserved virtual memory
//!   range, committing pages on demand and decommitting on reset.
//! - [`StackFrameAllocator`] — nested LIFO frames across a chain of
//!   segments, growing segment by segment and recycling drained ones.
//! - [`VMemStackFrameAllocator`] — LIFO frames within one reserved range,
//!   with [`decommit_slack`](VMemStackFrameAllocator::decommit_slack) to
//!   hand idle pages back to the OS.
//!
//! All variants share the [`RegionAllocator`] contract; frames are owned by
//! move-only [`AllocatorFrame`] handles that pop on drop.
//!
//! ## Example
//!
//! ```
//! use region_alloc::{RegionAllocator, StackFrameAllocator};
//! use std::alloc::Layout;
//!
//! let alloc = StackFrameAllocator::with_segment_size(64 * 1024)?;
//!
//! let mut frame = alloc.push_frame();
//! let scratch = unsafe { alloc.allocate(Layout::from_size_align(256, 16)?)? };
//! // ... use the scratch memory for this frame's work ...
//! # let _ = scratch;
//! frame.pop(); // everything allocated in the frame is released at once
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Threading
//!
//! Allocators are single-owner and single-threaded: operations take `&self`
//! through interior mutability and the types are `!Sync`. Distinct
//! instances can live on distinct threads without interference.
//!
//! ## Features
//!
//! - `logging` — lifecycle events (initialize, release, segment and commit
//!   growth) through the `tracing` facade; nothing on the allocation fast
//!   path.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod allocator;
pub mod error;
pub mod platform;
pub mod utils;

pub use crate::allocator::{
    AllocatorFrame, LinearAllocator, RegionAllocator, StackFrameAllocator, VMemLinearAllocator,
    VMemStackFrameAllocator,
};
pub use crate::error::{AllocError, AllocErrorKind, AllocResult};

/// Convenient re-exports of the commonly used types.
pub mod prelude {
    pub use crate::allocator::{
        AllocatorFrame, LinearAllocator, RegionAllocator, StackFrameAllocator,
        VMemLinearAllocator, VMemStackFrameAllocator,
    };
    pub use crate::error::{AllocError, AllocErrorKind, AllocResult};
    pub use crate::platform::MemoryProtection;
}
