//! Reallocation. The mapped flavor is a plain allocate-copy-unmap. The
//! heap flavor works much harder to avoid moving bytes: it first tries to
//! grow in place by absorbing free successors, then, when the block is the
//! heap tail, by claiming more break space, and only relocates the payload
//! once both fall through.

use std::{cmp, ptr, ptr::NonNull};

use crate::{
    allocator::Brkalloc,
    header::{total_size, BlockStatus, Header},
    heap::{coalesce_step, is_coalescable, request_space, split_block},
    platform::PlatformMemory,
};

impl<P: PlatformMemory> Brkalloc<P> {
    /// Moves a mapped block into a fresh allocation of `size` bytes, which
    /// lands wherever the threshold sends it, and returns the old mapping
    /// to the kernel.
    pub(crate) unsafe fn reallocate_mapped(
        &mut self,
        address: NonNull<u8>,
        size: usize,
    ) -> *mut u8 {
        let block = Header::from_payload_address(address);

        let new_address = self.malloc(size);
        ptr::copy_nonoverlapping(
            address.as_ptr(),
            new_address,
            cmp::min(block.as_ref().size, size),
        );
        self.mapped.free(&mut self.platform, address);

        new_address
    }

    /// Resizes a heap block to `size` payload bytes.
    ///
    /// The ladder, from cheapest to most expensive:
    ///
    /// 1. A request at or above the mapping threshold leaves the
    ///    break-managed region for good and gets its own mapping.
    /// 2. The block poses as free and absorbs free successors one at a
    ///    time until the request fits. If it does, any surplus is split
    ///    off again and the caller keeps their pointer.
    /// 3. A tail block with nothing left to absorb is handled by
    ///    [`Self::reallocate_tail`], which can stretch the heap itself.
    /// 4. Otherwise the payload moves to a freshly placed block.
    ///
    /// Returns null when `address` does not belong to this heap.
    pub(crate) unsafe fn reallocate_heap(&mut self, address: NonNull<u8>, size: usize) -> *mut u8 {
        let mut block = Header::from_payload_address(address);
        let block_size = total_size(size);

        if !self.heap.contains(block) {
            return ptr::null_mut();
        }

        if block_size >= self.threshold {
            let new_address = self.mapped.allocate(&mut self.platform, size);
            ptr::copy_nonoverlapping(
                address.as_ptr(),
                new_address.as_ptr(),
                cmp::min(block.as_ref().size, size),
            );
            self.heap.free(address);
            return new_address.as_ptr();
        }

        let old_size = block.as_ref().size;

        block.as_mut().status = BlockStatus::Free;
        while block.as_ref().total_size() < block_size && is_coalescable(block) {
            coalesce_step(block);
        }
        block.as_mut().status = BlockStatus::Alloc;

        if block.as_ref().total_size() >= block_size {
            if block.as_ref().size > block_size {
                split_block(block, block_size);
            }
            return address.as_ptr();
        }

        if block.as_ref().next.is_none() {
            return self.reallocate_tail(block, address, old_size, block_size);
        }

        // The grow attempt may have absorbed free successors it cannot
        // use after all; hand the surplus back before relocating.
        if block.as_ref().size != old_size {
            split_block(block, total_size(old_size));
        }

        let new_address = self.heap.allocate(&mut self.platform, size);
        ptr::copy_nonoverlapping(
            address.as_ptr(),
            new_address.as_ptr(),
            cmp::min(block.as_ref().size, size),
        );
        self.heap.free(address);

        new_address.as_ptr()
    }

    /// The block is the heap tail and growing in place fell short. A free
    /// block elsewhere in the heap may still fit; failing that, extending
    /// the break stretches the tail block itself, so the caller's pointer
    /// stays valid without copying a single byte.
    unsafe fn reallocate_tail(
        &mut self,
        mut block: NonNull<Header>,
        address: NonNull<u8>,
        old_size: usize,
        block_size: usize,
    ) -> *mut u8 {
        block.as_mut().status = BlockStatus::Free;

        let (best, last) = self.heap.find_best_fit(block_size);

        let Some(mut new_block) = best else {
            let mut extended = request_space(&mut self.platform, last, block_size);
            extended.as_mut().status = BlockStatus::Alloc;
            return address.as_ptr();
        };

        new_block.as_mut().status = BlockStatus::Alloc;
        let new_address = Header::payload_address_of(new_block);

        // The search may have merged the tail into an earlier free block;
        // source and destination can overlap in that case.
        ptr::copy(address.as_ptr(), new_address.as_ptr(), old_size);
        self.heap.free(address);

        new_address.as_ptr()
    }
}
