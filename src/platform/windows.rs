//! Windows virtual memory backend over `VirtualAlloc`/`VirtualFree`.

use core::mem;
use core::ptr::{self, NonNull};

use winapi::shared::basetsd::SIZE_T;
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
use winapi::um::winnt::{
    MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
};

use super::MemoryProtection;

impl MemoryProtection {
    fn to_windows_flags(self) -> u32 {
        match self {
            MemoryProtection::None => PAGE_NOACCESS,
            MemoryProtection::ReadOnly => PAGE_READONLY,
            MemoryProtection::ReadWrite => PAGE_READWRITE,
            MemoryProtection::ReadExecute => PAGE_EXECUTE_READ,
            MemoryProtection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
        }
    }
}

pub(super) fn query_page_size() -> usize {
    // SAFETY: GetSystemInfo fills the out-parameter unconditionally.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info.dwPageSize as usize
    }
}

pub(super) fn reserve(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }

    // SAFETY: reserving address space only; no pages are touched.
    let ptr = unsafe {
        VirtualAlloc(ptr::null_mut(), size as SIZE_T, MEM_RESERVE, PAGE_NOACCESS)
    };
    NonNull::new(ptr.cast::<u8>())
}

pub(super) unsafe fn release(ptr: NonNull<u8>, _size: usize) -> bool {
    // MEM_RELEASE requires a zero size and the exact reservation base.
    // SAFETY: caller passes the base of a prior reservation.
    unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) != 0 }
}

pub(super) unsafe fn commit(ptr: NonNull<u8>, size: usize, protection: MemoryProtection) -> bool {
    // SAFETY: caller passes a page-aligned subrange of a prior reservation.
    let committed = unsafe {
        VirtualAlloc(
            ptr.as_ptr().cast(),
            size as SIZE_T,
            MEM_COMMIT,
            protection.to_windows_flags(),
        )
    };
    !committed.is_null()
}

pub(super) unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: caller passes a page-aligned committed subrange.
    unsafe { VirtualFree(ptr.as_ptr().cast(), size as SIZE_T, MEM_DECOMMIT) != 0 }
}

pub(super) fn alloc(size: usize, protection: MemoryProtection) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }

    // SAFETY: reserve-and-commit in one call, kernel-chosen placement.
    let ptr = unsafe {
        VirtualAlloc(
            ptr::null_mut(),
            size as SIZE_T,
            MEM_RESERVE | MEM_COMMIT,
            protection.to_windows_flags(),
        )
    };
    NonNull::new(ptr.cast::<u8>())
}

pub(super) unsafe fn free(ptr: NonNull<u8>, _size: usize) -> bool {
    // SAFETY: caller passes the base of a prior alloc.
    unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) != 0 }
}
