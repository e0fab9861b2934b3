//! The break-managed heap. One contiguous region claimed from the program
//! break, carved into blocks whose headers double as an intrusive singly
//! linked list. Because the region is contiguous, a block's successor
//! always starts exactly `total_size` bytes after its own header, and the
//! list order is the address order:
//!
//! ```text
//!               +--------+---------+--------+--------------------+
//! heap start -> | Alloc  |  Free   | Alloc  |        Free        | <- break
//!               +--------+---------+--------+--------------------+
//!                   |         ^        |               ^
//!                   +---------+        +---------------+
//!                     next links = address arithmetic
//! ```
//!
//! Placement is best-fit: the smallest free block that can hold the request
//! wins, earliest one on ties. Every block visited during the search is
//! coalesced with its free successors first, so candidates are judged at
//! their maximal extent and holes left behind by out-of-order frees heal on
//! the next traversal. When nothing fits, the heap grows at the break: a
//! free tail block is extended in place, anything else gets a fresh block
//! appended after it.
//!
//! The heap is never returned to the OS. Freed blocks keep their header and
//! flip to `Free` for reuse.

use std::ptr::NonNull;

use crate::{
    header::{blocks, total_size, BlockStatus, Header, META},
    platform::{fatal, PlatformMemory},
    Pointer,
};

/// Bytes claimed from the program break the first time the heap is
/// touched.
pub const INITIAL_HEAP: usize = 128 * 1024;

/// The break-managed block list. `start` never changes once the heap
/// exists; growth happens at the tail.
pub(crate) struct Heap {
    pub start: Pointer<Header>,
}

impl Heap {
    pub const fn new() -> Self {
        Self { start: None }
    }

    /// Walks the list checking that `block` is one of ours. The freeing
    /// and reallocation paths ignore anything that fails this check.
    pub unsafe fn contains(&self, block: NonNull<Header>) -> bool {
        blocks(self.start).any(|current| current == block)
    }

    /// Claims [`INITIAL_HEAP`] bytes from the break and installs a single
    /// free block spanning all of them.
    unsafe fn preallocate<P: PlatformMemory>(&mut self, platform: &mut P) {
        self.start = Some(request_space(platform, None, INITIAL_HEAP));
    }

    /// Best-fit search for a free block with a total size of at least
    /// `block_size` bytes. Every visited block is coalesced before
    /// inspection. Besides the winner, if any, this reports the last block
    /// of the list so the caller can extend the heap on a miss.
    pub unsafe fn find_best_fit(
        &mut self,
        block_size: usize,
    ) -> (Pointer<Header>, Pointer<Header>) {
        let mut best: Pointer<Header> = None;
        let mut last: Pointer<Header> = None;
        let mut current = self.start;

        while let Some(block) = current {
            coalesce(block);

            if block.as_ref().is_free() && block.as_ref().total_size() >= block_size {
                if best.map_or(true, |best| block.as_ref().size < best.as_ref().size) {
                    best = Some(block);
                }
            }

            last = current;
            current = block.as_ref().next;
        }

        (best, last)
    }

    /// Produces a block for `size` payload bytes and returns its payload
    /// address. A fitting free block is reused and split down to the
    /// request; otherwise the heap grows at the break.
    ///
    /// # Safety
    ///
    /// `size` must be nonzero and already aligned. `platform` must be the
    /// one this heap has been growing on.
    pub unsafe fn allocate<P: PlatformMemory>(
        &mut self,
        platform: &mut P,
        size: usize,
    ) -> NonNull<u8> {
        if self.start.is_none() {
            self.preallocate(platform);
        }

        let block_size = total_size(size);
        let (best, last) = self.find_best_fit(block_size);

        let block = match best {
            Some(mut block) => {
                block.as_mut().status = BlockStatus::Alloc;
                if block.as_ref().size > block_size {
                    split_block(block, block_size);
                }
                block
            }
            None => {
                let mut block = request_space(platform, last, block_size);
                block.as_mut().status = BlockStatus::Alloc;
                block
            }
        };

        Header::payload_address_of(block)
    }

    /// Releases the block behind `address` for reuse and merges it with
    /// any free successors. Pointers whose header is not reachable from
    /// the heap start are ignored.
    ///
    /// # Safety
    ///
    /// `address` must be a payload pointer produced by this allocator.
    pub unsafe fn free(&mut self, address: NonNull<u8>) {
        let mut block = Header::from_payload_address(address);

        if !self.contains(block) {
            return;
        }

        block.as_mut().status = BlockStatus::Free;
        coalesce(block);
    }
}

/// Grows the heap by moving the program break. A free tail block is
/// extended in place, so the returned block may be `last` itself;
/// otherwise a fresh free block of `block_size` total bytes is written at
/// the old break and linked after `last`.
///
/// A refused break advancement takes the process down.
pub(crate) unsafe fn request_space<P: PlatformMemory>(
    platform: &mut P,
    last: Pointer<Header>,
    block_size: usize,
) -> NonNull<Header> {
    match last {
        Some(mut tail) if tail.as_ref().is_free() => {
            let increment = block_size - tail.as_ref().total_size();
            if platform.advance_break(increment).is_none() {
                fatal("sbrk");
            }
            tail.as_mut().size += increment;
            tail
        }
        _ => {
            let Some(address) = platform.advance_break(block_size) else {
                fatal("sbrk");
            };

            let block = address.cast::<Header>();
            block.as_ptr().write(Header {
                size: block_size - META,
                status: BlockStatus::Free,
                next: None,
            });

            if let Some(mut tail) = last {
                tail.as_mut().next = Some(block);
            }

            block
        }
    }
}

/// Splits `block` so that it occupies exactly `block_size` bytes including
/// its header, with the surplus becoming a new free block right after it:
///
/// ```text
/// +--------+------------------------+      +--------+-------+--------+-----+
/// | Header |                        |  ->  | Header |       | Header |     |
/// +--------+------------------------+      +--------+-------+--------+-----+
///                                                               new free block
/// ```
///
/// The status of the first half is whatever the caller already set.
/// Callers only split blocks whose payload is strictly larger than
/// `block_size`, which keeps the surplus size above zero.
pub(crate) unsafe fn split_block(mut block: NonNull<Header>, block_size: usize) {
    let address = block.as_ptr().cast::<u8>().add(block_size);
    let new_block = address.cast::<Header>();

    new_block.write(Header {
        size: block.as_ref().size - block_size,
        status: BlockStatus::Free,
        next: block.as_ref().next,
    });

    block.as_mut().size = block_size - META;
    block.as_mut().next = Some(NonNull::new_unchecked(new_block));
}

/// Whether `block` can absorb its successor: both must be free, and a
/// successor must exist.
pub(crate) unsafe fn is_coalescable(block: NonNull<Header>) -> bool {
    block.as_ref().is_free()
        && block
            .as_ref()
            .next
            .is_some_and(|next| next.as_ref().is_free())
}

/// Merges `block` with its immediate successor, if the pair is
/// coalescable. Adjacency makes this a pure header update: the successor's
/// header and payload become payload of `block`.
pub(crate) unsafe fn coalesce_step(mut block: NonNull<Header>) {
    if !is_coalescable(block) {
        return;
    }

    let next = block.as_ref().next.unwrap_unchecked();
    block.as_mut().size += next.as_ref().total_size();
    block.as_mut().next = next.as_ref().next;
}

/// Absorbs successors into `block` until its neighbor is in use or the
/// list ends.
pub(crate) unsafe fn coalesce(block: NonNull<Header>) {
    while is_coalescable(block) {
        coalesce_step(block);
    }
}
