use super::fatal::fatal;
use super::token_pool::{PoolRef, TokenPool};
use std::collections::BTreeSet;
use std::ptr::NonNull;

/// One size class: a growable array of token pools sharing a block size.
///
/// Pools are kept partitioned by state in the order full | free | empty:
/// `free_index` marks the full/free boundary, and empty pools accumulate at
/// the tail.  State transitions are repaired with a single swap, so the
/// partition costs O(1) per allocation or free.  When enough empty pools
/// have gathered (`sweep_hysteresis`), they are returned to the OS.
pub(crate) struct SizeClass {
    pool_size: usize,
    block_size: usize,
    align: bool,
    class_index: usize,
    sweep_hysteresis: f64,
    pools: Vec<TokenPool>,
    free_index: usize,
    pub(crate) aligned: bool,
}

impl SizeClass {
    pub(crate) fn new(
        pool_size: usize,
        block_size: usize,
        align: bool,
        class_index: usize,
        sweep_hysteresis: f64,
    ) -> Self {
        Self {
            pool_size,
            block_size,
            align,
            class_index,
            sweep_hysteresis,
            pools: Vec::new(),
            free_index: 0,
            aligned: true,
        }
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Pools at indices below this are full.
    pub(crate) fn full_count(&self) -> usize {
        self.free_index
    }

    pub(crate) fn empty_tail(&self) -> usize {
        let mut n = 0;
        for pool in self.pools.iter().rev() {
            // Safety: the manager lock serializes all pool access.
            if unsafe { pool.as_ref().is_empty() } {
                n += 1;
            } else {
                break;
            }
        }
        n
    }

    /// Grant one block.  Appends a fresh pool when no pool has space left;
    /// new pools are registered in `pool_index` (a duplicate address means
    /// the address space is corrupt and is fatal).
    pub(crate) fn alloc_one(&mut self, pool_index: &mut BTreeSet<usize>) -> NonNull<u8> {
        if self.free_index == self.pools.len() {
            let pool = TokenPool::create(
                self.pool_size,
                self.block_size,
                self.align,
                self.class_index,
            );
            let r = pool.as_ref();
            // Safety: freshly created pool, lock held by caller.
            unsafe { r.set_slot(self.pools.len()) };
            if unsafe { !r.is_aligned() } {
                self.aligned = false;
            }
            if !pool_index.insert(r.base_addr()) {
                fatal!("failed registering pool address {:#x}", r.base_addr());
            }
            self.pools.push(pool);
        }

        let child = self.pools[self.free_index].as_ref();
        // Safety: the manager lock serializes all pool access.
        let ptr = unsafe { child.alloc_one() };
        if unsafe { child.is_full() } {
            self.free_index += 1;
        }
        ptr
    }

    /// Free `ptr` into `pool`, maintaining the state partition.
    ///
    /// The full→free bookkeeping runs before the token push: the push
    /// overwrites the 0 sentinel that identifies a full pool.
    ///
    /// # Safety
    /// Caller holds the manager lock; `pool` belongs to this class and `ptr`
    /// is a live allocation from it.
    pub(crate) unsafe fn free_block(
        &mut self,
        pool: PoolRef,
        ptr: NonNull<u8>,
        pool_index: &mut BTreeSet<usize>,
    ) {
        // Safety: upheld by caller.
        unsafe {
            if pool.is_full() {
                self.full_to_free(pool);
            }
            pool.free_one(ptr);
            if pool.is_empty() {
                self.free_to_empty(pool, pool_index);
            }
        }
    }

    /// A child left the full state: swap it to the free side of the boundary.
    unsafe fn full_to_free(&mut self, child: PoolRef) {
        debug_assert!(self.free_index > 0);
        self.free_index -= 1;

        let child_index = unsafe { child.slot() };
        let swap_index = self.free_index;
        self.pools.swap(child_index, swap_index);
        // Safety: lock held by caller; both slots are in range.
        unsafe {
            self.pools[child_index].as_ref().set_slot(child_index);
            self.pools[swap_index].as_ref().set_slot(swap_index);
        }
    }

    /// A child became empty: move it into the empty tail, then sweep if the
    /// empty/used ratio exceeds the hysteresis.
    unsafe fn free_to_empty(&mut self, child: PoolRef, pool_index: &mut BTreeSet<usize>) {
        let child_index = unsafe { child.slot() };
        let mut empty_tail = self.empty_tail();
        if empty_tail < self.pools.len() {
            let swap_index = self.pools.len() - empty_tail - 1;
            if child_index < swap_index {
                self.pools.swap(child_index, swap_index);
                // Safety: lock held by caller; both slots are in range.
                unsafe {
                    self.pools[child_index].as_ref().set_slot(child_index);
                    self.pools[swap_index].as_ref().set_slot(swap_index);
                }
                empty_tail += 1;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        if empty_tail as f64 > (self.pools.len() - empty_tail) as f64 * self.sweep_hysteresis {
            while let Some(last) = self.pools.last() {
                let r = last.as_ref();
                // Safety: lock held by caller.
                if unsafe { !r.is_empty() } {
                    break;
                }
                if !pool_index.remove(&r.base_addr()) {
                    fatal!("failed removing pool address {:#x}", r.base_addr());
                }
                self.pools.pop();
            }
            debug_assert!(self.free_index <= self.pools.len());
        }
    }

    pub(crate) fn total_alloc(&self) -> usize {
        // Safety: the manager lock serializes all pool access.
        self.pools
            .iter()
            .map(|p| unsafe { p.as_ref().total_alloc() })
            .sum()
    }

    pub(crate) fn total_instances(&self) -> usize {
        // Safety: the manager lock serializes all pool access.
        self.pools
            .iter()
            .map(|p| unsafe { p.as_ref().total_instances() })
            .sum()
    }

    pub(crate) fn total_space(&self) -> usize {
        // Safety: the manager lock serializes all pool access.
        self.pools
            .iter()
            .map(|p| unsafe { p.as_ref().total_space() })
            .sum()
    }

    pub(crate) fn for_each_instance(&self, f: &mut impl FnMut(NonNull<u8>, usize)) {
        for pool in &self.pools {
            // Safety: the manager lock serializes all pool access.
            unsafe { pool.as_ref().for_each_live(f) };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const POOL: usize = 4096;
    const BLOCK: usize = 256;

    fn new_class() -> (SizeClass, BTreeSet<usize>) {
        (SizeClass::new(POOL, BLOCK, true, 0, 0.125), BTreeSet::new())
    }

    /// Blocks one pool can hand out, determined by filling a scratch pool.
    fn usable_blocks() -> usize {
        let mut scratch = SizeClass::new(POOL, BLOCK, true, 0, 0.125);
        let mut scratch_index = BTreeSet::new();
        let mut n = 1;
        scratch.alloc_one(&mut scratch_index);
        let base = scratch_index.iter().next().copied().unwrap();
        // Safety: Test code.
        let pool = unsafe { PoolRef::from_base_addr(base) };
        // Safety: Test code.
        while unsafe { !pool.is_full() } {
            scratch.alloc_one(&mut scratch_index);
            n += 1;
        }
        n
    }

    /// Assert the full | free | empty ordering and slot bookkeeping.
    fn assert_partition(class: &SizeClass) {
        let size = class.pool_count();
        let tail = class.empty_tail();
        for (i, pool) in class.pools.iter().enumerate() {
            let r = pool.as_ref();
            // Safety: Test code.
            unsafe {
                assert_eq!(r.slot(), i, "slot bookkeeping out of sync at {i}");
                if i < class.free_index {
                    assert!(r.is_full(), "pool {i} below free_index is not full");
                } else {
                    assert!(!r.is_full(), "pool {i} at/above free_index is full");
                }
                if i >= size - tail {
                    assert!(r.is_empty(), "pool {i} in the empty tail is not empty");
                }
            }
        }
        assert!(class.free_index <= size);
    }

    #[test]
    fn test_alloc_creates_and_registers_pool() {
        let (mut class, mut index) = new_class();
        assert_eq!(class.pool_count(), 0);
        let ptr = class.alloc_one(&mut index);
        assert_eq!(class.pool_count(), 1);
        assert_eq!(index.len(), 1);
        let base = index.iter().next().copied().unwrap();
        let addr = ptr.as_ptr() as usize;
        assert!(addr > base && addr < base + POOL);
        assert_partition(&class);
    }

    #[test]
    fn test_fill_spills_into_second_pool() {
        let (mut class, mut index) = new_class();
        let per_pool = usable_blocks();

        let mut ptrs = Vec::new();
        for _ in 0..per_pool {
            ptrs.push(class.alloc_one(&mut index));
        }
        assert_eq!(class.pool_count(), 1);
        assert_eq!(class.full_count(), 1);

        ptrs.push(class.alloc_one(&mut index));
        assert_eq!(class.pool_count(), 2);
        assert_eq!(index.len(), 2);
        assert_partition(&class);
    }

    #[test]
    fn test_free_from_full_restores_boundary() {
        let (mut class, mut index) = new_class();
        let per_pool = usable_blocks();

        let mut ptrs = Vec::new();
        for _ in 0..per_pool + 1 {
            ptrs.push(class.alloc_one(&mut index));
        }
        // Pool 0 full, pool 1 partially free.
        assert_eq!(class.full_count(), 1);

        // Free one block of the full pool: it must swap back across the
        // boundary in O(1).
        let victim = ptrs.remove(0);
        let base = victim.as_ptr() as usize & !(POOL - 1);
        // Safety: Test code.
        let pool = unsafe { PoolRef::from_base_addr(base) };
        unsafe { class.free_block(pool, victim, &mut index) };
        assert_eq!(class.full_count(), 0);
        assert_partition(&class);
    }

    #[test]
    fn test_sweep_discards_empty_pools() {
        let (mut class, mut index) = new_class();
        let per_pool = usable_blocks();

        // Build several pools' worth of allocations.
        let mut ptrs = Vec::new();
        for _ in 0..per_pool * 5 {
            ptrs.push(class.alloc_one(&mut index));
        }
        let peak_pools = class.pool_count();
        assert!(peak_pools >= 5);

        // Free everything; the sweep fires as the empty ratio climbs.
        for ptr in ptrs {
            let base = ptr.as_ptr() as usize & !(POOL - 1);
            // Safety: Test code.
            let pool = unsafe { PoolRef::from_base_addr(base) };
            unsafe { class.free_block(pool, ptr, &mut index) };
        }

        // With everything freed the hysteresis bound allows at most
        // ceil(non_empty * h) + 1 retained empties; non_empty is 0.
        assert!(
            class.pool_count() <= 1,
            "sweep retained {} empty pools",
            class.pool_count()
        );
        assert_eq!(index.len(), class.pool_count());
        assert_eq!(class.total_alloc(), 0);
        assert_partition(&class);
    }

    #[test]
    fn test_interleaved_partition_invariant() {
        let (mut class, mut index) = new_class();
        let mut live = Vec::new();

        // Deterministic interleaving: bursts of allocs with periodic frees.
        for round in 0..200usize {
            for _ in 0..(round % 7) + 1 {
                live.push(class.alloc_one(&mut index));
            }
            if round % 3 == 0 {
                for _ in 0..(round % 5) {
                    if let Some(ptr) = live.pop() {
                        let base = ptr.as_ptr() as usize & !(POOL - 1);
                        // Safety: Test code.
                        let pool = unsafe { PoolRef::from_base_addr(base) };
                        unsafe { class.free_block(pool, ptr, &mut index) };
                    }
                }
            }
            assert_partition(&class);
            assert_eq!(class.total_instances(), live.len());
        }

        for ptr in live.drain(..) {
            let base = ptr.as_ptr() as usize & !(POOL - 1);
            // Safety: Test code.
            let pool = unsafe { PoolRef::from_base_addr(base) };
            unsafe { class.free_block(pool, ptr, &mut index) };
        }
        assert_eq!(class.total_instances(), 0);
        assert_partition(&class);
    }

    #[test]
    fn test_totals_and_iteration() {
        let (mut class, mut index) = new_class();
        let mut ptrs = Vec::new();
        for _ in 0..10 {
            ptrs.push(class.alloc_one(&mut index));
        }
        assert_eq!(class.total_alloc(), 10 * BLOCK);
        assert_eq!(class.total_instances(), 10);
        assert_eq!(class.total_space(), class.pool_count() * (POOL + (POOL / BLOCK) * 2));

        let mut visited = Vec::new();
        class.for_each_instance(&mut |p, space| {
            assert_eq!(space, BLOCK);
            visited.push(p.as_ptr() as usize);
        });
        let mut expected: Vec<usize> = ptrs.iter().map(|p| p.as_ptr() as usize).collect();
        visited.sort_unstable();
        expected.sort_unstable();
        assert_eq!(visited, expected);
    }
}
