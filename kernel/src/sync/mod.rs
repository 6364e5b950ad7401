//! Synchronization primitives shared across the kernel.

pub mod once_lock;

pub use once_lock::OnceLock;
