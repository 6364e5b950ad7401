//! Kernel heap bring-up.
//!
//! On bare metal the global allocator is a `linked_list_allocator` heap
//! backed by a static region inside the kernel image. Host builds use the
//! system allocator (see `lib.rs`), so this module is a no-op there.

/// Kernel heap size: 4 MiB.
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[cfg(target_os = "none")]
#[repr(align(4096))]
struct HeapArea([u8; HEAP_SIZE]);

#[cfg(target_os = "none")]
static mut HEAP_AREA: HeapArea = HeapArea([0; HEAP_SIZE]);

/// Hand the static heap area to the global allocator. Must run before the
/// first allocation and exactly once.
#[cfg(target_os = "none")]
pub fn init() {
    let start = &raw mut HEAP_AREA as *mut u8;
    // SAFETY: HEAP_AREA is a static region used for nothing else, and this
    // function runs once during early boot before any allocation.
    unsafe {
        crate::get_allocator().lock().init(start, HEAP_SIZE);
    }
}

#[cfg(not(target_os = "none"))]
pub fn init() {}
