//! Safe single-initialization global state.
//!
//! Provides a safe alternative to `static mut` for global state that is
//! written exactly once during boot and read for the rest of the kernel's
//! lifetime (the `Kernel` root, most prominently, which interrupt handlers
//! must be able to reach without taking parameters).

use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;

/// A cell that can be written to only once.
///
/// Similar to `std::sync::OnceLock` but works in no_std environments.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    /// Create a new empty cell.
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: A non-null pointer means `set()` previously stored a
            // valid heap allocation via `Box::into_raw()`. The Acquire load
            // synchronizes-with the Release in `set()`, so the pointed-to
            // value is fully initialized. The allocation is never freed
            // (single-init, leaked on purpose), so the reference stays valid
            // for the lifetime of the cell.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell with a value.
    ///
    /// Returns `Ok(())` on first initialization, `Err(value)` if the cell
    /// was already set.
    pub fn set(&self, value: T) -> Result<(), T> {
        let boxed = Box::new(value);
        let ptr = Box::into_raw(boxed);

        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // Lost the race (or already set): reclaim the box and hand
                // the value back to the caller.
                // SAFETY: `ptr` came from `Box::into_raw` two lines above and
                // was rejected by the compare_exchange, so no other code has
                // seen it. Reconstructing the Box is the unique owner.
                let boxed = unsafe { Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }

    /// Whether the cell has been initialized.
    pub fn is_initialized(&self) -> bool {
        !self.inner.load(Ordering::Acquire).is_null()
    }
}

// SAFETY: OnceLock hands out only shared references after a Release/Acquire
// handoff; T: Send + Sync makes cross-thread sharing of those references
// sound.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}
// SAFETY: Ownership of the boxed T moves with the cell.
unsafe impl<T: Send> Send for OnceLock<T> {}
