//! `brkalloc` is a `malloc`-style dynamic memory allocator for a single
//! threaded process. It hands out raw 8 byte aligned payloads backed by two
//! different kinds of OS memory:
//!
//! - A contiguous heap obtained by moving the program break. Small requests
//!   are carved out of it with a best-fit search over an intrusive list of
//!   blocks; splitting and forward coalescing keep fragmentation in check.
//!
//! - Private anonymous mappings. Requests whose total footprint reaches
//!   [`MMAP_THRESHOLD`] each get their own mapping, which is returned to the
//!   kernel the moment they are freed.
//!
//! ```text
//!                 Heap (contiguous, grows by moving the break)
//!               +------------------------------------------------+
//! heap start -> | Alloc  | Free       | Alloc   | Free           | <- break
//!               +------------------------------------------------+
//!                 each block: [ header | payload ]
//!
//!                 Mapped blocks (one anonymous mapping each)
//!                 +----------------+      +----------------+
//! mapped start -> |     Mapped     | ---> |     Mapped     | ---> (end)
//!                 +----------------+      +----------------+
//! ```
//!
//! The four entry points are [`Brkalloc::malloc`], [`Brkalloc::free`],
//! [`Brkalloc::calloc`] and [`Brkalloc::realloc`], with the usual POSIX
//! semantics. See [`Brkalloc`] for the safety contract: the allocator owns
//! the program break exclusively for as long as it lives.

use std::ptr::NonNull;

mod align;
mod allocator;
mod header;
mod heap;
mod mmap;
mod platform;
mod realloc;

/// Non-null pointer to `T`. Used instead of `*mut T` wherever a link can be
/// absent, so the compiler makes us write code for the `None` case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use align::ALIGNMENT;
pub use allocator::{Brkalloc, MMAP_THRESHOLD};
pub use heap::INITIAL_HEAP;
pub use platform::{PlatformMemory, System};
