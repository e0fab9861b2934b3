use std::{
    mem,
    ptr::{self, NonNull},
};

use crate::{
    align::align,
    header::{total_size, BlockStatus, Header},
    heap::Heap,
    mmap::MappedList,
    platform::{PlatformMemory, System},
};

/// Requests whose total block size reaches this many bytes are served by
/// anonymous mappings instead of the heap.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

/// A `malloc`-style allocator for a single threaded process.
///
/// Small requests are placed on a contiguous heap that grows by moving the
/// program break; requests of [`MMAP_THRESHOLD`] total bytes or more each
/// get a private anonymous mapping. Freed mappings go straight back to the
/// kernel, freed heap blocks are kept for reuse and the break never moves
/// backwards.
///
/// All methods take `&mut self` and there is no internal synchronization.
///
/// # Examples
///
/// ```no_run
/// use brkalloc::Brkalloc;
///
/// unsafe {
///     let mut allocator = Brkalloc::new();
///
///     let address = allocator.malloc(64).cast::<u64>();
///     address.write(42);
///     assert_eq!(address.read(), 42);
///
///     allocator.free(address.cast());
/// }
/// ```
pub struct Brkalloc<P: PlatformMemory = System> {
    pub(crate) platform: P,
    pub(crate) heap: Heap,
    pub(crate) mapped: MappedList,
    pub(crate) threshold: usize,
}

impl Brkalloc<System> {
    /// Builds an allocator backed by the real program break and kernel
    /// mappings.
    ///
    /// # Safety
    ///
    /// The allocator assumes exclusive ownership of the program break for
    /// its entire lifetime. Nothing else in the process, including the
    /// global allocator of the Rust runtime, may move the break while this
    /// instance is alive.
    pub unsafe fn new() -> Self {
        Self::with_platform(System)
    }
}

impl<P: PlatformMemory> Brkalloc<P> {
    /// Builds an allocator on top of the given memory primitives.
    ///
    /// # Safety
    ///
    /// Same contract as [`Brkalloc::new`]: the platform's break belongs
    /// exclusively to this instance while it is alive.
    pub unsafe fn with_platform(platform: P) -> Self {
        Self {
            platform,
            heap: Heap::new(),
            mapped: MappedList::new(),
            threshold: MMAP_THRESHOLD,
        }
    }

    /// Allocates `size` bytes and returns an 8 byte aligned pointer to
    /// them, or null when `size` is zero. The bytes are uninitialized.
    ///
    /// # Safety
    ///
    /// The returned pointer may only be released or resized through this
    /// same instance.
    pub unsafe fn malloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        let size = align(size);

        if total_size(size) < self.threshold {
            self.heap.allocate(&mut self.platform, size).as_ptr()
        } else {
            self.mapped.allocate(&mut self.platform, size).as_ptr()
        }
    }

    /// Releases an allocation. Null is a no-op. A heap pointer that is not
    /// on the heap list, such as a stale pointer whose block was merged
    /// away, is silently ignored.
    ///
    /// # Safety
    ///
    /// `address` must be null or a pointer produced by this instance that
    /// the caller no longer reads or writes through.
    pub unsafe fn free(&mut self, address: *mut u8) {
        let Some(address) = NonNull::new(address) else {
            return;
        };

        let block = Header::from_payload_address(address);

        if block.as_ref().status == BlockStatus::Mapped {
            self.mapped.free(&mut self.platform, address);
        } else {
            self.heap.free(address);
        }
    }

    /// Allocates zeroed memory for `count` elements of `size` bytes each,
    /// or null when the product is zero.
    ///
    /// For the duration of the inner allocation the mapping threshold
    /// drops to one page, steering any request that spans a page towards a
    /// fresh mapping. The payload is zeroed explicitly either way. The
    /// `count * size` multiplication wraps on overflow; callers validate
    /// extreme element counts themselves.
    ///
    /// # Safety
    ///
    /// Same contract as [`Brkalloc::malloc`].
    pub unsafe fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let total_bytes = count.wrapping_mul(size);

        let page_size = self.platform.page_size();
        let address = self.with_threshold(page_size, |allocator| unsafe {
            allocator.malloc(total_bytes)
        });

        if !address.is_null() {
            ptr::write_bytes(address, 0, total_bytes);
        }

        address
    }

    /// Resizes an allocation:
    ///
    /// - null `address` behaves like [`Brkalloc::malloc`],
    /// - zero `size` behaves like [`Brkalloc::free`] and returns null,
    /// - a pointer to a block that is already free, or to a heap block this
    ///   instance does not know, yields null without touching anything,
    /// - otherwise the payload is kept, in place whenever neighboring free
    ///   space or a break extension allows it, and the possibly moved
    ///   payload address is returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`Brkalloc::free`]; on success the old pointer is
    /// invalid and only the returned one may be used.
    pub unsafe fn realloc(&mut self, address: *mut u8, size: usize) -> *mut u8 {
        let Some(address) = NonNull::new(address) else {
            return self.malloc(size);
        };

        if size == 0 {
            self.free(address.as_ptr());
            return ptr::null_mut();
        }

        let size = align(size);
        let block = Header::from_payload_address(address);

        match block.as_ref().status {
            BlockStatus::Free => ptr::null_mut(),
            BlockStatus::Mapped => self.reallocate_mapped(address, size),
            BlockStatus::Alloc => self.reallocate_heap(address, size),
        }
    }

    /// Runs `operation` with the mapping threshold swapped out, putting
    /// the previous value back on the way out.
    fn with_threshold<T>(
        &mut self,
        threshold: usize,
        operation: impl FnOnce(&mut Self) -> T,
    ) -> T {
        let previous = mem::replace(&mut self.threshold, threshold);
        let result = operation(self);
        self.threshold = previous;
        result
    }
}

#[cfg(test)]
impl<P: PlatformMemory> Brkalloc<P> {
    /// Asserts the structural invariants of both lists: heap blocks are
    /// adjacent in address order and never mapped, mapped blocks are
    /// always mapped, all sizes are aligned.
    pub(crate) unsafe fn check_consistency(&self) {
        use crate::{align::ALIGNMENT, header::blocks};

        let mut previous: Option<NonNull<Header>> = None;

        for block in blocks(self.heap.start) {
            assert_eq!(block.as_ref().size % ALIGNMENT, 0);
            assert_ne!(block.as_ref().status, BlockStatus::Mapped);

            if let Some(previous) = previous {
                let expected = previous
                    .as_ptr()
                    .cast::<u8>()
                    .add(previous.as_ref().total_size());
                assert_eq!(block.as_ptr().cast::<u8>(), expected);
            }

            previous = Some(block);
        }

        for block in blocks(self.mapped.start) {
            assert_eq!(block.as_ref().status, BlockStatus::Mapped);
            assert_eq!(block.as_ref().size % ALIGNMENT, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{
        align::ALIGNMENT,
        header::{blocks, META},
        platform::Simulated,
    };

    unsafe fn block_of(address: *mut u8) -> NonNull<Header> {
        Header::from_payload_address(NonNull::new(address).unwrap())
    }

    unsafe fn simulated() -> Brkalloc<Simulated> {
        Brkalloc::with_platform(Simulated::new())
    }

    #[test]
    fn malloc_zero_returns_null() {
        unsafe {
            let mut allocator = simulated();
            assert!(allocator.malloc(0).is_null());
        }
    }

    #[test]
    fn malloc_one_returns_an_aligned_heap_byte() {
        unsafe {
            let mut allocator = simulated();

            let address = allocator.malloc(1);

            assert_eq!(address as usize % ALIGNMENT, 0);
            assert_eq!(block_of(address).as_ref().size, ALIGNMENT);
            assert_eq!(block_of(address).as_ref().status, BlockStatus::Alloc);
        }
    }

    #[test]
    fn threshold_splits_requests_between_heap_and_mappings() {
        unsafe {
            let mut allocator = simulated();

            // Largest request whose total footprint stays below the
            // threshold.
            let heap_backed = allocator.malloc(MMAP_THRESHOLD - META - ALIGNMENT);
            assert_eq!(block_of(heap_backed).as_ref().status, BlockStatus::Alloc);

            // One alignment step further and the total reaches the
            // threshold.
            let mapped = allocator.malloc(MMAP_THRESHOLD - META);
            assert_eq!(block_of(mapped).as_ref().status, BlockStatus::Mapped);

            allocator.free(mapped);
        }
    }

    #[test]
    fn free_tolerates_null_and_repeated_calls() {
        unsafe {
            let mut allocator = simulated();

            allocator.free(ptr::null_mut());

            let a = allocator.malloc(104);
            let _b = allocator.malloc(104);
            allocator.free(a);
            allocator.free(a);

            // The slot is still reusable afterwards.
            assert_eq!(allocator.malloc(104), a);
        }
    }

    #[test]
    fn calloc_zeroes_and_prefers_mappings_for_page_spanning_requests() {
        unsafe {
            let mut allocator = simulated();

            // 8 KiB spans a page, so it lands in a mapping even though it
            // is far below the normal threshold.
            let mapped = allocator.calloc(1024, 8);
            assert_eq!(block_of(mapped).as_ref().status, BlockStatus::Mapped);
            for i in 0..8192 {
                assert_eq!(mapped.add(i).read(), 0);
            }

            // Tiny requests stay on the heap even during the override.
            let small = allocator.calloc(4, 8);
            assert_eq!(block_of(small).as_ref().status, BlockStatus::Alloc);
            for i in 0..32 {
                assert_eq!(small.add(i).read(), 0);
            }

            // The override is gone afterwards.
            assert_eq!(allocator.threshold, MMAP_THRESHOLD);
            let heap_backed = allocator.malloc(8192);
            assert_eq!(block_of(heap_backed).as_ref().status, BlockStatus::Alloc);

            allocator.free(mapped);
        }
    }

    #[test]
    fn calloc_zero_elements_returns_null() {
        unsafe {
            let mut allocator = simulated();
            assert!(allocator.calloc(0, 64).is_null());
            assert!(allocator.calloc(64, 0).is_null());
        }
    }

    #[test]
    fn realloc_null_allocates() {
        unsafe {
            let mut allocator = simulated();

            let address = allocator.realloc(ptr::null_mut(), 104);

            assert!(!address.is_null());
            assert_eq!(block_of(address).as_ref().size, 104);
        }
    }

    #[test]
    fn realloc_to_zero_frees() {
        unsafe {
            let mut allocator = simulated();

            let address = allocator.malloc(104);
            assert!(allocator.realloc(address, 0).is_null());

            // Everything merged back into the preallocated span.
            let heap: Vec<_> = blocks(allocator.heap.start).collect();
            assert_eq!(heap.len(), 1);
            assert!(heap[0].as_ref().is_free());
        }
    }

    #[test]
    fn realloc_of_a_free_block_yields_null() {
        unsafe {
            let mut allocator = simulated();

            let address = allocator.malloc(104);
            allocator.free(address);

            assert!(allocator.realloc(address, 64).is_null());
        }
    }

    #[cfg(not(miri))]
    #[test]
    fn system_backed_mappings_round_trip() {
        unsafe {
            // Stays strictly on the mapped path, the process break is
            // never touched.
            let mut allocator = Brkalloc::new();

            let address = allocator.malloc(200_000);
            assert!(!address.is_null());
            assert_eq!(block_of(address).as_ref().status, BlockStatus::Mapped);

            ptr::write_bytes(address, 0x7F, 200_000);
            assert_eq!(address.add(199_999).read(), 0x7F);

            allocator.free(address);
            assert!(allocator.mapped.start.is_none());
        }
    }

    #[derive(Clone, Debug)]
    enum Op {
        Malloc(usize),
        Calloc(usize, usize),
        Realloc(usize, usize),
        Free(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (1usize..4096).prop_map(Op::Malloc),
            1 => (140_000usize..200_000).prop_map(Op::Malloc),
            1 => ((1usize..64), (1usize..64)).prop_map(|(count, size)| Op::Calloc(count, size)),
            2 => ((0usize..16), (1usize..8192)).prop_map(|(slot, size)| Op::Realloc(slot, size)),
            1 => ((0usize..16), (140_000usize..180_000))
                .prop_map(|(slot, size)| Op::Realloc(slot, size)),
            2 => (0usize..16).prop_map(Op::Free),
        ]
    }

    /// After a heap placement the search has coalesced every block it
    /// visited, so no two neighboring free blocks may remain.
    unsafe fn assert_no_adjacent_free(allocator: &Brkalloc<Simulated>) {
        let mut previous_free = false;
        for block in blocks(allocator.heap.start) {
            let free = block.as_ref().is_free();
            assert!(!(previous_free && free));
            previous_free = free;
        }
    }

    proptest! {
        // Miri is really slow, a couple of sequences already find pointer
        // mistakes.
        #![proptest_config(ProptestConfig::with_cases(if cfg!(miri) { 2 } else { 64 }))]

        /// Model check: random call sequences against a shadow list of
        /// live allocations. Payload bytes are stamped per allocation and
        /// verified before every release or resize, and the structural
        /// invariants are checked after every call.
        #[test]
        fn random_workloads_preserve_payloads_and_layout(
            ops in proptest::collection::vec(op_strategy(), 1..40),
        ) {
            unsafe {
                let mut allocator = simulated();
                let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();
                let mut stamp: u8 = 1;

                for op in ops {
                    match op {
                        Op::Malloc(size) => {
                            let address = allocator.malloc(size);
                            prop_assert!(!address.is_null());
                            prop_assert_eq!(address as usize % ALIGNMENT, 0);

                            ptr::write_bytes(address, stamp, size);
                            live.push((address, size, stamp));
                            stamp = stamp.wrapping_add(1).max(1);

                            allocator.check_consistency();
                            if block_of(address).as_ref().status == BlockStatus::Alloc {
                                assert_no_adjacent_free(&allocator);
                            }
                        }
                        Op::Calloc(count, size) => {
                            let address = allocator.calloc(count, size);
                            prop_assert!(!address.is_null());

                            for i in 0..count * size {
                                prop_assert_eq!(address.add(i).read(), 0);
                            }

                            ptr::write_bytes(address, stamp, count * size);
                            live.push((address, count * size, stamp));
                            stamp = stamp.wrapping_add(1).max(1);

                            allocator.check_consistency();
                        }
                        Op::Realloc(slot, new_size) => {
                            if live.is_empty() {
                                continue;
                            }
                            let slot = slot % live.len();
                            let (address, size, fill) = live[slot];

                            let moved = allocator.realloc(address, new_size);
                            prop_assert!(!moved.is_null());

                            for i in 0..size.min(new_size) {
                                prop_assert_eq!(moved.add(i).read(), fill);
                            }

                            ptr::write_bytes(moved, fill, new_size);
                            live[slot] = (moved, new_size, fill);

                            allocator.check_consistency();
                        }
                        Op::Free(slot) => {
                            if live.is_empty() {
                                continue;
                            }
                            let (address, size, fill) = live.remove(slot % live.len());

                            for i in 0..size {
                                prop_assert_eq!(address.add(i).read(), fill);
                            }

                            allocator.free(address);
                            allocator.check_consistency();
                        }
                    }
                }

                for (address, size, fill) in live.drain(..) {
                    for i in 0..size {
                        prop_assert_eq!(address.add(i).read(), fill);
                    }
                    allocator.free(address);
                    allocator.check_consistency();
                }

                // One more full traversal merges whatever forward-only
                // coalescing left behind, collapsing the heap back into a
                // single free span that accounts for every break byte.
                let probe = allocator.malloc(8);
                allocator.free(probe);

                let heap: Vec<_> = blocks(allocator.heap.start).collect();
                prop_assert_eq!(heap.len(), 1);
                prop_assert!(heap[0].as_ref().is_free());
                prop_assert_eq!(
                    heap[0].as_ref().total_size(),
                    allocator.platform.break_usage()
                );
                prop_assert!(allocator.mapped.start.is_none());
            }
        }
    }
}
