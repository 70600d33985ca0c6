use super::fatal::fatal;
use super::os::{OsMemOps, PlatformOsMem, OS_MIN_ALIGN};
use super::size_class::SizeClass;
use super::stats;
use super::token_pool::{PoolRef, MAX_STACK_SIZE};
use crate::sync::{Arc, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ptr::NonNull;

/// Configuration for [`PoolManager`]. All fields have sensible defaults.
#[derive(Clone, Debug)]
pub struct PoolManagerConfig {
    /// Size of every token pool. Must be a power of two. Default: 64KB.
    pub pool_size: usize,

    /// Smallest managed block size. Default: 8.
    pub min_block_size: usize,

    /// Largest managed block size; bigger requests go straight to the OS.
    /// Default: 16KB.
    pub max_block_size: usize,

    /// Size-ladder density: `m` yields roughly `2^m` block sizes per
    /// power-of-two range. Default: 1 (… 16, 24, 32, 48, 64, 96 …).
    pub stepping_method: usize,

    /// Align every pool to `pool_size` so a block pointer can be reversed to
    /// its pool by masking the low address bits. Default: true.
    pub full_align: bool,

    /// Empty pools are returned to the OS once
    /// `empty > (total - empty) * sweep_hysteresis`. Default: 0.125.
    pub sweep_hysteresis: f64,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            pool_size: 0x10000,
            min_block_size: 8,
            max_block_size: 1024 * 16,
            stepping_method: 1,
            full_align: true,
            sweep_hysteresis: 0.125,
        }
    }
}

/// Generate the exponential block-size ladder.
///
/// The mask starts as the all-ones value `(1 << (m+1)) - 1`, shifted up until
/// it is at least `min_block_size` and shifting it once more would not clip
/// into `min_block_size`. Sizes then step by `size_inc` (initially
/// `min_block_size`); whenever an emitted size exceeds the mask, both mask
/// and increment double. `m = 1` yields 8, 16, 24, 32, 48, 64, 96, 128, …
fn block_size_ladder(
    min_block_size: usize,
    max_block_size: usize,
    stepping_method: usize,
) -> Vec<usize> {
    let mut size_mask = (1usize << (stepping_method + 1)) - 1;
    let mut size_inc = min_block_size;
    while size_mask < min_block_size || (size_mask << 1) & min_block_size != 0 {
        size_mask <<= 1;
    }

    let mut sizes = Vec::new();
    let mut block_size = min_block_size;
    while block_size <= max_block_size {
        sizes.push(block_size);
        if block_size > size_mask {
            size_mask <<= 1;
            size_inc <<= 1;
        }
        block_size += size_inc;
    }
    sizes
}

/// Everything behind the manager's mutex.
struct Inner {
    pool_size: usize,
    min_block_size: usize,
    max_block_size: usize,
    /// All pools of all classes are aligned to `pool_size`. Monotonically
    /// falls to false; while true the bitmask fast path is valid for every
    /// live pool.
    aligned: bool,
    classes: Vec<SizeClass>,
    /// Cached block size per class, for the linear fit scan.
    block_sizes: Vec<usize>,
    /// Base addresses of all live token pools, ordered. "Largest key ≤ ptr"
    /// resolves a pointer to its pool when the fast path is unavailable.
    pool_index: BTreeSet<usize>,
    /// Oversize allocations served by the OS: address → requested bytes.
    external: BTreeMap<usize, usize>,
}

impl Inner {
    fn new(config: &PoolManagerConfig) -> Self {
        if !config.pool_size.is_power_of_two() {
            fatal!("pool_size {} is not a power of two", config.pool_size);
        }
        if config.min_block_size == 0 {
            fatal!("min_block_size must be non-zero");
        }
        if config.min_block_size > config.max_block_size {
            fatal!(
                "min_block_size {} exceeds max_block_size {}",
                config.min_block_size,
                config.max_block_size
            );
        }
        if config.pool_size / config.min_block_size > MAX_STACK_SIZE {
            fatal!(
                "pool_size {} with min_block_size {} exceeds {} blocks per pool",
                config.pool_size,
                config.min_block_size,
                MAX_STACK_SIZE
            );
        }

        let block_sizes = block_size_ladder(
            config.min_block_size,
            config.max_block_size,
            config.stepping_method,
        );
        let classes = block_sizes
            .iter()
            .enumerate()
            .map(|(i, &block_size)| {
                SizeClass::new(
                    config.pool_size,
                    block_size,
                    config.full_align,
                    i,
                    config.sweep_hysteresis,
                )
            })
            .collect();

        Self {
            pool_size: config.pool_size,
            min_block_size: config.min_block_size,
            max_block_size: config.max_block_size,
            aligned: true,
            classes,
            block_sizes,
            pool_index: BTreeSet::new(),
            external: BTreeMap::new(),
        }
    }

    /// Resolve through the ordered pool index: largest pool base ≤ ptr, if
    /// ptr actually lands inside that pool.
    fn resolve_pool_slow(&self, ptr: *const u8) -> Option<PoolRef> {
        let addr = ptr as usize;
        let base = self.pool_index.range(..=addr).next_back().copied()?;
        if addr - base < self.pool_size {
            // Safety: base is a live pool registered in the index.
            Some(unsafe { PoolRef::from_base_addr(base) })
        } else {
            None
        }
    }

    /// Fast bitmask resolution. Only valid while every live pool is aligned;
    /// `current_size` must be the granted size of the pointer.
    fn resolve_pool_fast(&self, ptr: *const u8, current_size: usize) -> Option<PoolRef> {
        if current_size <= self.max_block_size && self.aligned {
            // Safety: an aligned manager means the mask lands on a pool base.
            Some(unsafe { PoolRef::from_base_addr(ptr as usize & !(self.pool_size - 1)) })
        } else {
            None
        }
    }

    fn mem_alloc(&mut self, requested: usize) -> (NonNull<u8>, usize) {
        for (i, &block_size) in self.block_sizes.iter().enumerate() {
            if requested <= block_size {
                let class = &mut self.classes[i];
                let ptr = class.alloc_one(&mut self.pool_index);
                self.aligned &= class.aligned;
                return (ptr, block_size);
            }
        }

        // Oversize: served by the OS, tracked in the external map.
        let ptr = match unsafe { PlatformOsMem::alloc_aligned(requested, OS_MIN_ALIGN) } {
            Ok(ptr) => ptr,
            Err(e) => fatal!("failed allocating {requested} bytes: {e}"),
        };
        if self.external.insert(ptr.as_ptr() as usize, requested).is_some() {
            fatal!("failed registering external address {ptr:p}");
        }
        stats::EXTERNAL_BYTES.add(requested);
        stats::EXTERNAL_LIVE.add(1);
        (ptr, requested)
    }

    fn free_internal(&mut self, pool: PoolRef, ptr: NonNull<u8>) {
        // Safety: the manager lock is held; pool was resolved from the live
        // index or via the (validated) aligned fast path.
        unsafe {
            let class = &mut self.classes[pool.class_index()];
            class.free_block(pool, ptr, &mut self.pool_index);
        }
    }

    fn free_external(&mut self, ptr: NonNull<u8>) {
        let Some(size) = self.external.remove(&(ptr.as_ptr() as usize)) else {
            fatal!("attempt to free invalid memory ({ptr:p})");
        };
        stats::sub_saturating(&stats::EXTERNAL_BYTES, size);
        stats::sub_saturating(&stats::EXTERNAL_LIVE, 1);
        // Safety: ptr came from the OS layer with this size and alignment.
        unsafe { PlatformOsMem::release(ptr, size, OS_MIN_ALIGN) };
    }

    fn mem_free(&mut self, ptr: NonNull<u8>, current_size: Option<usize>) {
        if let Some(pool) = current_size.and_then(|sz| self.resolve_pool_fast(ptr.as_ptr(), sz)) {
            self.free_internal(pool, ptr);
        } else if let Some(pool) = self.resolve_pool_slow(ptr.as_ptr()) {
            self.free_internal(pool, ptr);
        } else {
            self.free_external(ptr);
        }
    }

    fn mem_realloc(
        &mut self,
        ptr: NonNull<u8>,
        current_size: Option<usize>,
        requested: usize,
    ) -> (NonNull<u8>, usize) {
        let pool = current_size
            .and_then(|sz| self.resolve_pool_fast(ptr.as_ptr(), sz))
            .or_else(|| self.resolve_pool_slow(ptr.as_ptr()));

        if let Some(pool) = pool {
            // Safety: lock held; pool is live.
            let current_block = unsafe { pool.block_size() };
            if requested > current_block {
                let (new_ptr, granted) = self.mem_alloc(requested);
                // Safety: old block holds current_block bytes; the new grant
                // is larger. Distinct blocks never overlap.
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), current_block);
                }
                self.free_internal(pool, ptr);
                (new_ptr, granted)
            } else {
                // Size reduction: move only when a smaller class fits.
                let fit = match self.block_sizes.iter().position(|&bs| requested <= bs) {
                    Some(i) => i,
                    None => fatal!("no size class fits {requested} bytes"),
                };
                if self.block_sizes[fit] != current_block {
                    let new_ptr = self.classes[fit].alloc_one(&mut self.pool_index);
                    self.aligned &= self.classes[fit].aligned;
                    // Safety: requested ≤ both grants; blocks never overlap.
                    unsafe {
                        std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), requested);
                    }
                    self.free_internal(pool, ptr);
                    (new_ptr, self.block_sizes[fit])
                } else {
                    // Same block size: keep current location.
                    (ptr, current_block)
                }
            }
        } else if requested <= self.max_block_size {
            // Old block is external, new size fits the pools.
            let (new_ptr, granted) = self.mem_alloc(requested);
            // Safety: the external block is larger than max_block_size and
            // thus than `requested`.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), requested);
            }
            self.free_external(ptr);
            (new_ptr, granted)
        } else {
            // Neither old nor new size is pool-managed.
            let Some(&current_bytes) = self.external.get(&(ptr.as_ptr() as usize)) else {
                fatal!("could not retrieve current external allocation ({ptr:p})");
            };

            // Requested less but not significantly less: keep the block.
            if requested < current_bytes && requested >= current_bytes >> 1 {
                return (ptr, current_bytes);
            }

            let new_ptr = match unsafe { PlatformOsMem::alloc_aligned(requested, OS_MIN_ALIGN) } {
                Ok(p) => p,
                Err(e) => fatal!("failed allocating {requested} bytes: {e}"),
            };
            if self
                .external
                .insert(new_ptr.as_ptr() as usize, requested)
                .is_some()
            {
                fatal!("failed registering external address {new_ptr:p}");
            }
            stats::EXTERNAL_BYTES.add(requested);
            stats::EXTERNAL_LIVE.add(1);

            let copy_bytes = requested.min(current_bytes);
            // Safety: copy_bytes fits both blocks; they never overlap.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_bytes);
            }
            self.free_external(ptr);
            (new_ptr, requested)
        }
    }

    fn granted_space(&self, ptr: *const u8) -> usize {
        if let Some(pool) = self.resolve_pool_slow(ptr) {
            // Safety: lock held; pool is live.
            unsafe { pool.block_size() }
        } else {
            self.external.get(&(ptr as usize)).copied().unwrap_or(0)
        }
    }

    fn internal_total_alloc(&self) -> usize {
        self.classes.iter().map(SizeClass::total_alloc).sum()
    }

    fn external_total_alloc(&self) -> usize {
        self.external.values().sum()
    }

    fn total_instances(&self) -> usize {
        self.external.len()
            + self
                .classes
                .iter()
                .map(SizeClass::total_instances)
                .sum::<usize>()
    }

    fn total_space(&self) -> usize {
        self.classes.iter().map(SizeClass::total_space).sum()
    }
}

/// Pool-based dynamic memory manager.
///
/// Requests up to `max_block_size` are rounded up to the nearest ladder size
/// and served O(1) from token pools; larger requests fall through to the OS
/// and are tracked in a side map. Every public operation is serialized
/// behind one mutex, so the manager can be shared freely between threads.
pub struct PoolManager {
    inner: Mutex<Inner>,
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new(PoolManagerConfig::default())
    }
}

impl PoolManager {
    /// Create a manager. Fatal on invalid configuration.
    #[must_use]
    pub fn new(config: PoolManagerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::new(&config)),
        }
    }

    /// Allocate `requested` bytes (must be non-zero). Returns the pointer
    /// and the granted size, which is at least `requested`.
    pub fn alloc(&self, requested: usize) -> (NonNull<u8>, usize) {
        assert!(requested > 0, "zero-size allocation; use realloc/free for release semantics");
        self.inner.lock().unwrap().mem_alloc(requested)
    }

    /// Resize an allocation. `requested == 0` frees and returns `None`.
    /// The prefix up to the smaller of the old and new requested sizes is
    /// preserved.
    ///
    /// # Safety
    /// `ptr` is a live allocation of this manager and is not used again
    /// unless returned unchanged.
    pub unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        requested: usize,
    ) -> Option<(NonNull<u8>, usize)> {
        let mut inner = self.inner.lock().unwrap();
        if requested == 0 {
            inner.mem_free(ptr, None);
            None
        } else {
            Some(inner.mem_realloc(ptr, None, requested))
        }
    }

    /// Like [`realloc`], with the pointer's granted size supplied so an
    /// aligned manager can skip the index lookup. `current_size == 0` means
    /// `ptr` may not be freed or reallocated: the call degenerates to a
    /// fresh allocation (or, with `requested == 0`, to a no-op).
    ///
    /// # Safety
    /// If `current_size != 0` it is the granted size of `ptr`, and `ptr` is
    /// a live allocation of this manager.
    ///
    /// [`realloc`]: PoolManager::realloc
    pub unsafe fn realloc_hinted(
        &self,
        ptr: NonNull<u8>,
        current_size: usize,
        requested: usize,
    ) -> Option<(NonNull<u8>, usize)> {
        let mut inner = self.inner.lock().unwrap();
        if requested == 0 {
            if current_size != 0 {
                inner.mem_free(ptr, Some(current_size));
            }
            None
        } else if current_size != 0 {
            Some(inner.mem_realloc(ptr, Some(current_size), requested))
        } else {
            Some(inner.mem_alloc(requested))
        }
    }

    /// Release an allocation.
    ///
    /// # Safety
    /// `ptr` is a live allocation of this manager and is not used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.inner.lock().unwrap().mem_free(ptr, None);
    }

    /// Like [`free`], with the granted size supplied. `current_size == 0`
    /// is a no-op.
    ///
    /// # Safety
    /// If `current_size != 0` it is the granted size of `ptr`, and `ptr` is
    /// a live allocation of this manager, not used afterwards.
    ///
    /// [`free`]: PoolManager::free
    pub unsafe fn free_hinted(&self, ptr: NonNull<u8>, current_size: usize) {
        if current_size != 0 {
            self.inner.lock().unwrap().mem_free(ptr, Some(current_size));
        }
    }

    /// Granted size of a live allocation; 0 if the pointer is not tracked.
    pub fn granted_space(&self, ptr: *const u8) -> usize {
        self.inner.lock().unwrap().granted_space(ptr)
    }

    /// Sum of granted sizes across pool-managed and external allocations.
    pub fn total_granted_space(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.internal_total_alloc() + inner.external_total_alloc()
    }

    /// Count of live allocations.
    pub fn total_instances(&self) -> usize {
        self.inner.lock().unwrap().total_instances()
    }

    /// OS footprint of all live token pools.
    pub fn total_space(&self) -> usize {
        self.inner.lock().unwrap().total_space()
    }

    /// Visit every live allocation with its granted size.
    ///
    /// The snapshot is taken under the lock and the callback runs outside
    /// it, so the callback may call back into the manager.
    pub fn for_each_instance<F: FnMut(NonNull<u8>, usize)>(&self, mut f: F) {
        let snapshot: Vec<(usize, usize)> = {
            let inner = self.inner.lock().unwrap();
            let mut nodes = Vec::with_capacity(inner.total_instances());
            for (&addr, &size) in &inner.external {
                nodes.push((addr, size));
            }
            let mut collect = |ptr: NonNull<u8>, space: usize| {
                nodes.push((ptr.as_ptr() as usize, space));
            };
            for class in &inner.classes {
                class.for_each_instance(&mut collect);
            }
            nodes
        };

        for (addr, size) in snapshot {
            // Safety: snapshot addresses come from live allocations.
            f(unsafe { NonNull::new_unchecked(addr as *mut u8) }, size);
        }
    }

    /// Point-in-time status report.
    pub fn status(&self) -> Status {
        let inner = self.inner.lock().unwrap();
        Status {
            pool_size: inner.pool_size,
            min_block_size: inner.min_block_size,
            max_block_size: inner.max_block_size,
            aligned: inner.aligned,
            pool_count: inner.pool_index.len(),
            external_count: inner.external.len(),
            internal_granted: inner.internal_total_alloc(),
            external_granted: inner.external_total_alloc(),
            total_space: inner.total_space(),
            classes: inner
                .classes
                .iter()
                .map(|class| ClassStatus {
                    block_size: class.block_size(),
                    pools: class.pool_count(),
                    full: class.full_count(),
                    empty: class.empty_tail(),
                    granted: class.total_alloc(),
                })
                .collect(),
        }
    }

    /// Verify that bitmask and index resolution agree for `ptr` (valid only
    /// while the manager is aligned).
    #[cfg(test)]
    pub(crate) fn resolution_agrees(&self, ptr: *const u8) -> bool {
        let inner = self.inner.lock().unwrap();
        if !inner.aligned {
            return true;
        }
        let masked = ptr as usize & !(inner.pool_size - 1);
        match inner.resolve_pool_slow(ptr) {
            Some(pool) => pool.base_addr() == masked,
            None => false,
        }
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        // A fatal diagnostic may have poisoned the lock; the teardown report
        // still runs on whatever state is left.
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let leaking_bytes = inner.internal_total_alloc() + inner.external_total_alloc();
        if leaking_bytes > 0 {
            let leaking_instances = inner.total_instances();
            eprintln!(
                "tokpool warning: detected {leaking_instances} instances with a total of \
                 {leaking_bytes} bytes leaking space"
            );
        }
        // Pool memory is reclaimed when the classes drop. External blocks
        // are left in place: the caller may still hold those pointers.
        for &size in inner.external.values() {
            stats::sub_saturating(&stats::EXTERNAL_BYTES, size);
            stats::sub_saturating(&stats::EXTERNAL_LIVE, 1);
        }
    }
}

/// Per-class line of a [`Status`] report.
#[derive(Clone, Debug)]
pub struct ClassStatus {
    pub block_size: usize,
    pub pools: usize,
    pub full: usize,
    pub empty: usize,
    pub granted: usize,
}

/// Snapshot of a manager's state, printable as a multi-line report.
#[derive(Clone, Debug)]
pub struct Status {
    pub pool_size: usize,
    pub min_block_size: usize,
    pub max_block_size: usize,
    pub aligned: bool,
    pub pool_count: usize,
    pub external_count: usize,
    pub internal_granted: usize,
    pub external_granted: usize,
    pub total_space: usize,
    pub classes: Vec<ClassStatus>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pool_size:              {}", self.pool_size)?;
        writeln!(f, "size classes:           {}", self.classes.len())?;
        writeln!(f, "token pools:            {}", self.pool_count)?;
        writeln!(f, "external allocs:        {}", self.external_count)?;
        writeln!(f, "min_block_size:         {}", self.min_block_size)?;
        writeln!(f, "max_block_size:         {}", self.max_block_size)?;
        writeln!(f, "aligned:                {}", self.aligned)?;
        writeln!(f, "total external granted: {}", self.external_granted)?;
        writeln!(f, "total internal granted: {}", self.internal_granted)?;
        writeln!(f, "total pool space:       {}", self.total_space)?;
        for class in self.classes.iter().filter(|c| c.pools > 0) {
            writeln!(
                f,
                "  block size {:>6}: {} pools ({} full, {} empty), {} bytes granted",
                class.block_size, class.pools, class.full, class.empty, class.granted
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Process-global singleton
// ---------------------------------------------------------------------------

crate::sync::static_mutex! {
    static GLOBAL: crate::sync::Mutex<Option<Arc<PoolManager>>> = crate::sync::Mutex::new(None);
}

/// Process-global manager with default parameters.
///
/// [`open`] is idempotent and safe under concurrent first use; every other
/// entry point is fatal before `open`. [`close`] tears the singleton down
/// (emitting the leak warning if allocations are still live); the caller is
/// responsible for not racing `close` against ongoing operations.
///
/// [`open`]: GlobalPoolManager::open
/// [`close`]: GlobalPoolManager::close
pub struct GlobalPoolManager;

impl GlobalPoolManager {
    pub fn open() {
        let mut slot = GLOBAL.lock().unwrap();
        if slot.is_none() {
            *slot = Some(Arc::new(PoolManager::default()));
        }
    }

    pub fn close() {
        let taken = GLOBAL.lock().unwrap().take();
        drop(taken);
    }

    fn instance() -> Arc<PoolManager> {
        let instance = GLOBAL.lock().unwrap().as_ref().map(Arc::clone);
        match instance {
            Some(manager) => manager,
            None => fatal!(
                "manager was not initialized; call GlobalPoolManager::open() at the \
                 beginning of your program"
            ),
        }
    }

    pub fn alloc(requested: usize) -> (NonNull<u8>, usize) {
        Self::instance().alloc(requested)
    }

    /// # Safety
    /// See [`PoolManager::realloc`].
    pub unsafe fn realloc(ptr: NonNull<u8>, requested: usize) -> Option<(NonNull<u8>, usize)> {
        // Safety: forwarded contract.
        unsafe { Self::instance().realloc(ptr, requested) }
    }

    /// # Safety
    /// See [`PoolManager::realloc_hinted`].
    pub unsafe fn realloc_hinted(
        ptr: NonNull<u8>,
        current_size: usize,
        requested: usize,
    ) -> Option<(NonNull<u8>, usize)> {
        // Safety: forwarded contract.
        unsafe { Self::instance().realloc_hinted(ptr, current_size, requested) }
    }

    /// # Safety
    /// See [`PoolManager::free`].
    pub unsafe fn free(ptr: NonNull<u8>) {
        // Safety: forwarded contract.
        unsafe { Self::instance().free(ptr) };
    }

    /// # Safety
    /// See [`PoolManager::free_hinted`].
    pub unsafe fn free_hinted(ptr: NonNull<u8>, current_size: usize) {
        // Safety: forwarded contract.
        unsafe { Self::instance().free_hinted(ptr, current_size) };
    }

    pub fn granted_space(ptr: *const u8) -> usize {
        Self::instance().granted_space(ptr)
    }

    pub fn total_granted_space() -> usize {
        Self::instance().total_granted_space()
    }

    pub fn total_instances() -> usize {
        Self::instance().total_instances()
    }

    pub fn total_space() -> usize {
        Self::instance().total_space()
    }

    pub fn for_each_instance<F: FnMut(NonNull<u8>, usize)>(f: F) {
        Self::instance().for_each_instance(f);
    }

    pub fn status() -> Status {
        Self::instance().status()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_default_stepping() {
        let sizes = block_size_ladder(8, 16384, 1);
        assert_eq!(
            sizes,
            vec![
                8, 16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048,
                3072, 4096, 6144, 8192, 12288, 16384
            ]
        );
    }

    #[test]
    fn test_ladder_strictly_increasing() {
        for m in 0..4 {
            let sizes = block_size_ladder(8, 1 << 20, m);
            for pair in sizes.windows(2) {
                assert!(pair[0] < pair[1], "ladder not increasing at m={m}: {pair:?}");
            }
            assert_eq!(sizes[0], 8);
        }
    }

    #[test]
    fn test_ladder_density_doubles_with_stepping() {
        // Count sizes in [1024, 2048): 2^m of them.
        for m in 1..4 {
            let sizes = block_size_ladder(8, 1 << 16, m);
            let octave = sizes.iter().filter(|&&s| (1024..2048).contains(&s)).count();
            assert_eq!(octave, 1 << m, "wrong density for m={m}");
        }
    }

    #[test]
    fn test_granted_sizes_follow_ladder() {
        let manager = PoolManager::default();
        let requests = [8usize, 9, 16, 17, 24, 25, 32, 33, 48, 49];
        let expected = [8usize, 16, 16, 24, 24, 32, 32, 48, 48, 64];

        let mut ptrs = Vec::new();
        for (&req, &exp) in requests.iter().zip(&expected) {
            let (ptr, granted) = manager.alloc(req);
            assert_eq!(granted, exp, "request {req} granted {granted}, want {exp}");
            assert_eq!(manager.granted_space(ptr.as_ptr()), exp);
            ptrs.push(ptr);
        }
        assert_eq!(
            manager.total_granted_space(),
            expected.iter().sum::<usize>()
        );

        for ptr in ptrs {
            // Safety: Test code.
            unsafe { manager.free(ptr) };
        }
        assert_eq!(manager.total_instances(), 0);
        assert_eq!(manager.total_granted_space(), 0);
    }

    #[test]
    fn test_bulk_small_allocations() {
        let manager = PoolManager::default();
        let mut ptrs = Vec::with_capacity(10_000);
        for _ in 0..10_000 {
            let (ptr, granted) = manager.alloc(8);
            assert_eq!(granted, 8);
            ptrs.push(ptr);
        }
        assert_eq!(manager.total_granted_space(), 80_000);
        assert_eq!(manager.total_instances(), 10_000);

        for ptr in ptrs {
            // Safety: Test code.
            unsafe { manager.free(ptr) };
        }
        assert_eq!(manager.total_instances(), 0);
    }

    #[test]
    fn test_realloc_zero_frees() {
        let manager = PoolManager::default();
        let (ptr, _) = manager.alloc(100);
        assert_eq!(manager.total_instances(), 1);
        // Safety: Test code.
        let result = unsafe { manager.realloc(ptr, 0) };
        assert!(result.is_none());
        assert_eq!(manager.total_instances(), 0);
    }

    #[test]
    fn test_realloc_grow_preserves_contents() {
        let manager = PoolManager::default();
        let (ptr, granted) = manager.alloc(24);
        // Safety: Test code.
        unsafe {
            for i in 0..24 {
                ptr.as_ptr().add(i).write(i as u8);
            }
            let (new_ptr, new_granted) = manager.realloc(ptr, 1000).unwrap();
            assert!(new_granted >= 1000);
            assert_ne!(new_ptr, ptr);
            for i in 0..24 {
                assert_eq!(new_ptr.as_ptr().add(i).read(), i as u8);
            }
            assert_eq!(granted, 24);
            assert_eq!(manager.total_instances(), 1);
            manager.free(new_ptr);
        }
    }

    #[test]
    fn test_realloc_shrink_moves_to_smaller_class() {
        let manager = PoolManager::default();
        let (ptr, granted) = manager.alloc(1000);
        assert_eq!(granted, 1024);
        // Safety: Test code.
        unsafe {
            ptr.as_ptr().write(0x7F);
            let (new_ptr, new_granted) = manager.realloc(ptr, 10).unwrap();
            assert_eq!(new_granted, 16);
            assert_ne!(new_ptr, ptr);
            assert_eq!(new_ptr.as_ptr().read(), 0x7F);
            manager.free(new_ptr);
        }
    }

    #[test]
    fn test_realloc_same_class_keeps_location() {
        let manager = PoolManager::default();
        let (ptr, granted) = manager.alloc(45);
        assert_eq!(granted, 48);
        // Safety: Test code.
        unsafe {
            let (same_ptr, same_granted) = manager.realloc(ptr, 40).unwrap();
            assert_eq!(same_ptr, ptr);
            assert_eq!(same_granted, 48);
            manager.free(ptr);
        }
    }

    #[test]
    fn test_external_allocation_roundtrip() {
        let manager = PoolManager::default();
        let (ptr, granted) = manager.alloc(1_000_000);
        assert_eq!(granted, 1_000_000);
        assert_eq!(ptr.as_ptr() as usize % OS_MIN_ALIGN, 0);
        assert_eq!(manager.granted_space(ptr.as_ptr()), 1_000_000);
        assert_eq!(manager.total_granted_space(), 1_000_000);
        // Safety: Test code.
        unsafe { manager.free(ptr) };
        assert_eq!(manager.total_instances(), 0);
    }

    #[test]
    fn test_external_realloc_keep_when_at_least_half() {
        let manager = PoolManager::default();
        let (ptr, _) = manager.alloc(1_000_000);
        // Safety: Test code.
        unsafe {
            // Shrink to 600,000: ≥ half, block is kept as-is.
            let (same_ptr, granted) = manager.realloc(ptr, 600_000).unwrap();
            assert_eq!(same_ptr, ptr);
            assert_eq!(granted, 1_000_000);

            // Shrink below half: a fresh external block is allocated.
            let (new_ptr, new_granted) = manager.realloc(same_ptr, 100_000).unwrap();
            assert_ne!(new_ptr, same_ptr);
            assert_eq!(new_granted, 100_000);
            manager.free(new_ptr);
        }
    }

    #[test]
    fn test_oversize_realloc_with_wide_ladder() {
        // A ladder reaching 256KB: the 100,000-byte shrink lands internally.
        let manager = PoolManager::new(PoolManagerConfig {
            pool_size: 1 << 19,
            max_block_size: 1 << 18,
            ..PoolManagerConfig::default()
        });
        let (ptr, granted) = manager.alloc(1_000_000);
        assert_eq!(granted, 1_000_000);
        // Safety: Test code.
        unsafe {
            let (same_ptr, granted) = manager.realloc(ptr, 600_000).unwrap();
            assert_eq!(same_ptr, ptr);
            assert_eq!(granted, 1_000_000);

            let (new_ptr, granted) = manager.realloc(same_ptr, 100_000).unwrap();
            assert_ne!(new_ptr, same_ptr);
            assert_eq!(granted, 131_072);
            manager.free(new_ptr);
        }
        assert_eq!(manager.total_instances(), 0);
    }

    #[test]
    fn test_external_grow_copies_contents() {
        let manager = PoolManager::default();
        let (ptr, _) = manager.alloc(100_000);
        // Safety: Test code.
        unsafe {
            for i in 0..64 {
                ptr.as_ptr().add(i).write(i as u8);
            }
            let (new_ptr, granted) = manager.realloc(ptr, 400_000).unwrap();
            assert_eq!(granted, 400_000);
            for i in 0..64 {
                assert_eq!(new_ptr.as_ptr().add(i).read(), i as u8);
            }
            manager.free(new_ptr);
        }
    }

    #[test]
    fn test_external_to_internal_realloc() {
        let manager = PoolManager::default();
        let (ptr, _) = manager.alloc(50_000);
        // Safety: Test code.
        unsafe {
            ptr.as_ptr().write(0x42);
            let (new_ptr, granted) = manager.realloc(ptr, 100).unwrap();
            assert_eq!(granted, 128);
            assert_eq!(new_ptr.as_ptr().read(), 0x42);
            manager.free(new_ptr);
        }
        assert_eq!(manager.total_instances(), 0);
    }

    #[test]
    fn test_hinted_free_uses_fast_path() {
        let manager = PoolManager::default();
        let (ptr, granted) = manager.alloc(64);
        // Safety: Test code.
        unsafe { manager.free_hinted(ptr, granted) };
        assert_eq!(manager.total_instances(), 0);
    }

    #[test]
    fn test_hinted_zero_current_size_is_fresh_alloc() {
        let manager = PoolManager::default();
        let (ptr, _) = manager.alloc(64);
        // current_size == 0: the pointer must be left untouched.
        // Safety: Test code.
        let (fresh, granted) = unsafe { manager.realloc_hinted(ptr, 0, 32) }.unwrap();
        assert_eq!(granted, 32);
        assert_ne!(fresh, ptr);
        assert_eq!(manager.total_instances(), 2);
        // Safety: Test code.
        unsafe {
            manager.free_hinted(ptr, 0); // no-op
            assert_eq!(manager.total_instances(), 2);
            manager.free(ptr);
            manager.free(fresh);
        }
        assert_eq!(manager.total_instances(), 0);
    }

    #[test]
    fn test_granted_space_untracked_pointer() {
        let manager = PoolManager::default();
        let unrelated = Box::new(0u8);
        assert_eq!(manager.granted_space(&*unrelated as *const u8), 0);
    }

    #[test]
    fn test_fast_and_slow_resolution_agree() {
        let manager = PoolManager::default();
        let mut ptrs = Vec::new();
        for size in [8usize, 24, 100, 1000, 16000] {
            for _ in 0..10 {
                ptrs.push(manager.alloc(size).0);
            }
        }
        for ptr in &ptrs {
            assert!(manager.resolution_agrees(ptr.as_ptr()));
        }
        for ptr in ptrs {
            // Safety: Test code.
            unsafe { manager.free(ptr) };
        }
    }

    #[test]
    fn test_internal_pointer_alignment() {
        let manager = PoolManager::default();
        for size in [8usize, 24, 48, 256, 4096] {
            let (ptr, granted) = manager.alloc(size);
            let align = 1usize << granted.trailing_zeros().min(8);
            assert_eq!(
                ptr.as_ptr() as usize % align,
                0,
                "block of granted size {granted} not {align}-byte aligned"
            );
            // Safety: Test code.
            unsafe { manager.free(ptr) };
        }
    }

    #[test]
    fn test_leak_totals_before_discard() {
        let manager = PoolManager::default();
        let (_a, ga) = manager.alloc(8);
        let (_b, gb) = manager.alloc(20);
        let (_c, gc) = manager.alloc(131_072);
        assert_eq!((ga, gb, gc), (8, 24, 131_072));
        assert_eq!(manager.total_instances(), 3);
        assert_eq!(manager.total_granted_space(), 131_104);
        // Dropping with live allocations emits the leak warning to stderr.
        drop(manager);
    }

    #[test]
    fn test_for_each_instance_snapshot() {
        let manager = PoolManager::default();
        let mut expected = Vec::new();
        for size in [8usize, 100, 3000, 40_000] {
            let (ptr, granted) = manager.alloc(size);
            expected.push((ptr.as_ptr() as usize, granted));
        }

        let mut visited = Vec::new();
        manager.for_each_instance(|ptr, space| {
            // Re-entering the manager from the callback must not deadlock.
            assert_eq!(manager.granted_space(ptr.as_ptr()), space);
            visited.push((ptr.as_ptr() as usize, space));
        });

        expected.sort_unstable();
        visited.sort_unstable();
        assert_eq!(expected, visited);
        assert_eq!(
            manager.total_granted_space(),
            expected.iter().map(|&(_, s)| s).sum::<usize>()
        );

        for (addr, _) in expected {
            // Safety: Test code.
            unsafe { manager.free(NonNull::new(addr as *mut u8).unwrap()) };
        }
    }

    #[test]
    fn test_status_report() {
        let manager = PoolManager::default();
        let (ptr, _) = manager.alloc(64);
        let (ext, _) = manager.alloc(100_000);

        let status = manager.status();
        assert_eq!(status.pool_size, 0x10000);
        assert_eq!(status.external_count, 1);
        assert_eq!(status.pool_count, 1);
        assert!(status.aligned);
        assert_eq!(status.external_granted, 100_000);
        assert_eq!(status.internal_granted, 64);

        let report = status.to_string();
        assert!(report.contains("external allocs:        1"));
        assert!(report.contains("block size     64"));

        // Safety: Test code.
        unsafe {
            manager.free(ptr);
            manager.free(ext);
        }
    }

    #[test]
    #[should_panic(expected = "attempt to free invalid memory")]
    fn test_free_unknown_pointer_is_fatal() {
        let manager = PoolManager::default();
        let stray = Box::leak(Box::new([0u8; 64]));
        // Safety: Test code (the pointer is valid memory, just not ours).
        unsafe { manager.free(NonNull::new(stray.as_mut_ptr()).unwrap()) };
    }

    #[test]
    #[should_panic(expected = "is not a power of two")]
    fn test_config_pool_size_not_power_of_two() {
        drop(PoolManager::new(PoolManagerConfig {
            pool_size: 0x10001,
            ..PoolManagerConfig::default()
        }));
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_config_too_many_blocks_per_pool() {
        drop(PoolManager::new(PoolManagerConfig {
            pool_size: 1 << 20,
            min_block_size: 8,
            ..PoolManagerConfig::default()
        }));
    }

    #[test]
    #[should_panic(expected = "zero-size allocation")]
    fn test_alloc_zero_is_misuse() {
        let manager = PoolManager::default();
        let _ = manager.alloc(0);
    }

    #[test]
    fn test_global_open_close_roundtrip() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        GlobalPoolManager::open();
        // Second open is a no-op.
        GlobalPoolManager::open();

        let (ptr, granted) = GlobalPoolManager::alloc(100);
        assert_eq!(granted, 128);
        assert_eq!(GlobalPoolManager::granted_space(ptr.as_ptr()), 128);
        assert_eq!(GlobalPoolManager::total_instances(), 1);
        assert!(GlobalPoolManager::total_space() > 0);
        // Safety: Test code.
        unsafe { GlobalPoolManager::free(ptr) };
        assert_eq!(GlobalPoolManager::total_instances(), 0);

        let status = GlobalPoolManager::status();
        assert_eq!(status.pool_size, 0x10000);

        GlobalPoolManager::close();
    }

    #[test]
    fn test_global_use_before_open_is_fatal() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        GlobalPoolManager::close();
        let result = std::panic::catch_unwind(|| GlobalPoolManager::total_instances());
        let err = result.expect_err("entry point before open must be fatal");
        let msg = err.downcast_ref::<String>().cloned().unwrap_or_default();
        assert!(
            msg.contains("manager was not initialized"),
            "unexpected panic message: {msg}"
        );
    }
}
