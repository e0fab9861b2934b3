//! Large blocks bypass the heap entirely: each one lives in its own
//! private anonymous mapping and goes back to the kernel the moment it is
//! freed. The blocks are chained through their headers into a plain LIFO
//! list; unlike heap blocks their addresses are unrelated, so the links
//! carry real information here:
//!
//! ```text
//!            +--------------------+       +--------------------+
//! start ---> | Header |  payload  | ----> | Header |  payload  | ---> (end)
//!            +--------------------+       +--------------------+
//!              newest mapping                oldest mapping
//! ```

use std::ptr::NonNull;

use crate::{
    header::{total_size, BlockStatus, Header, META},
    platform::{fatal, PlatformMemory},
    Pointer,
};

/// The list of individually mapped blocks. Insertion happens at the head,
/// removal anywhere by pointer identity.
pub(crate) struct MappedList {
    pub start: Pointer<Header>,
}

impl MappedList {
    pub const fn new() -> Self {
        Self { start: None }
    }

    /// Maps a fresh block for `size` payload bytes, pushes it at the list
    /// head and returns its payload address.
    ///
    /// # Safety
    ///
    /// `size` must be nonzero and already aligned.
    pub unsafe fn allocate<P: PlatformMemory>(
        &mut self,
        platform: &mut P,
        size: usize,
    ) -> NonNull<u8> {
        let length = total_size(size);

        let Some(address) = platform.map(length) else {
            fatal("mmap");
        };

        let block = address.cast::<Header>();
        block.as_ptr().write(Header {
            size: length - META,
            status: BlockStatus::Mapped,
            next: self.start,
        });

        self.start = Some(block);
        Header::payload_address_of(block)
    }

    /// Unlinks the block behind `address` and returns its mapping to the
    /// kernel. A pointer whose block is not on the list falls through
    /// without touching anything.
    ///
    /// # Safety
    ///
    /// `address` must be a payload pointer produced by this allocator.
    pub unsafe fn free<P: PlatformMemory>(&mut self, platform: &mut P, address: NonNull<u8>) {
        let block = Header::from_payload_address(address);

        let mut previous: Pointer<Header> = None;
        let mut current = self.start;

        while let Some(node) = current {
            if node == block {
                match previous {
                    Some(mut previous) => previous.as_mut().next = node.as_ref().next,
                    None => self.start = node.as_ref().next,
                }

                platform.unmap(node.cast(), node.as_ref().total_size());
                return;
            }

            previous = current;
            current = node.as_ref().next;
        }
    }
}
