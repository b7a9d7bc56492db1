//! Allocation error type shared by all allocator variants.
//!
//! Every fallible operation in this crate reports failure through
//! [`AllocError`]; nothing panics or aborts in release builds, and a failed
//! operation never mutates allocator state.

use core::alloc::Layout;
use core::fmt;

/// Classification of an allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocErrorKind {
    /// The buffer, segment or reservation cannot hold the request.
    OutOfMemory,
    /// Alignment padding or size addition overflowed the address space.
    SizeOverflow,
    /// Invalid request: zero size, or a size beyond the counter range.
    InvalidLayout,
    /// The allocator has not been initialized.
    Uninitialized,
    /// The allocator is already initialized.
    AlreadyInitialized,
    /// The virtual memory layer refused to reserve address space.
    ReserveFailed,
    /// The virtual memory layer refused to commit pages.
    CommitFailed,
    /// The virtual memory layer refused to decommit pages.
    DecommitFailed,
    /// The operation is not permitted while frames are outstanding.
    LiveFrame,
    /// The frame is not the innermost live frame, or no frame is live.
    FrameMismatch,
}

impl AllocErrorKind {
    /// Static description of the failure class.
    pub const fn as_str(self) -> &'static str {
        match self {
            AllocErrorKind::OutOfMemory => "out of memory",
            AllocErrorKind::SizeOverflow => "size overflow",
            AllocErrorKind::InvalidLayout => "invalid layout",
            AllocErrorKind::Uninitialized => "allocator is not initialized",
            AllocErrorKind::AlreadyInitialized => "allocator is already initialized",
            AllocErrorKind::ReserveFailed => "virtual memory reservation failed",
            AllocErrorKind::CommitFailed => "virtual memory commit failed",
            AllocErrorKind::DecommitFailed => "virtual memory decommit failed",
            AllocErrorKind::LiveFrame => "operation refused while frames are live",
            AllocErrorKind::FrameMismatch => "frame is not the innermost live frame",
        }
    }
}

impl fmt::Display for AllocErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by allocator operations.
///
/// Carries the failure class, the layout of the request when one was
/// involved, and an optional static message for context.
#[derive(Debug, Clone, Copy)]
pub struct AllocError {
    kind: AllocErrorKind,
    layout: Option<Layout>,
    message: Option<&'static str>,
}

impl AllocError {
    /// Creates an error of the given kind with no request layout attached.
    #[inline]
    pub const fn new(kind: AllocErrorKind) -> Self {
        Self { kind, layout: None, message: None }
    }

    /// Creates an error of the given kind for a specific request layout.
    #[inline]
    pub const fn with_layout(kind: AllocErrorKind, layout: Layout) -> Self {
        Self { kind, layout: Some(layout), message: None }
    }

    /// Attaches a static context message.
    #[inline]
    pub const fn with_message(mut self, message: &'static str) -> Self {
        self.message = Some(message);
        self
    }

    /// The failure class.
    #[inline]
    pub const fn kind(&self) -> AllocErrorKind {
        self.kind
    }

    /// The layout of the failed request, if the failure was request-shaped.
    #[inline]
    pub const fn layout(&self) -> Option<Layout> {
        self.layout
    }

    /// True for exhaustion failures (buffer full, commit refused).
    #[inline]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(
            self.kind,
            AllocErrorKind::OutOfMemory | AllocErrorKind::ReserveFailed | AllocErrorKind::CommitFailed
        )
    }

    /// True for caller-misuse failures.
    #[inline]
    pub const fn is_misuse(&self) -> bool {
        matches!(
            self.kind,
            AllocErrorKind::InvalidLayout
                | AllocErrorKind::Uninitialized
                | AllocErrorKind::AlreadyInitialized
                | AllocErrorKind::LiveFrame
                | AllocErrorKind::FrameMismatch
        )
    }

    // Shorthand constructors for the common cases.

    #[inline]
    pub(crate) const fn uninitialized() -> Self {
        Self::new(AllocErrorKind::Uninitialized)
    }

    #[inline]
    pub(crate) const fn invalid_layout(message: &'static str) -> Self {
        Self::new(AllocErrorKind::InvalidLayout).with_message(message)
    }

    #[inline]
    pub(crate) const fn out_of_memory(layout: Layout) -> Self {
        Self::with_layout(AllocErrorKind::OutOfMemory, layout)
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocation failed: {}", self.kind)?;
        if let Some(layout) = self.layout {
            write!(f, " ({} bytes, alignment {})", layout.size(), layout.align())?;
        }
        if let Some(message) = self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AllocError {}

/// Result type for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;
