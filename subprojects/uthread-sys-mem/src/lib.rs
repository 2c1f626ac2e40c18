//! Page-granular memory for the user-space thread runtime.
//!
//! - [`alignment`]: page size discovery and rounding helpers.
//! - [`mman`]: thin wrappers over `mmap`, `munmap` and `mprotect`.
//! - [`stack`]: thread stacks with a guard page.
//! - [`page`]: single pages that stay inaccessible until explicitly opened.

pub mod alignment;
pub mod mman;
pub mod page;
pub mod stack;

pub use mman::{MapError, Protection, ProtectError, UnmapError};
pub use page::ProtectedPage;
pub use stack::{AllocError, StackMemory};
