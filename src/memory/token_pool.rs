use super::fatal::fatal;
use super::os::{OsMemOps, PlatformOsMem, OS_MIN_ALIGN};
use super::stats;
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Hard limit on blocks per pool: tokens are u16 block indices.
pub(crate) const MAX_STACK_SIZE: usize = 0x10000;

/// Pool header, stored in the leading bytes of the pool region itself.
///
/// The u16 token stack follows immediately after the header; header plus
/// stack occupy the pool's reserved prefix, whose blocks are never handed
/// out.  Because the header *is* the pool's first bytes, an aligned pool can
/// be recovered from any pointer inside it by masking off the low address
/// bits.
///
/// Token stack discipline: entries at `[0, stack_index)` are tokens held by
/// live allocations; entries at `[stack_index, stack_size)` are free tokens,
/// with a 0 sentinel at `stack_index` once none remain.  Valid tokens are
/// block indices in `[reserved_blocks, stack_size)` and are never 0 (block 0
/// always holds this header).
struct PoolHeader {
    pool_size: usize,
    block_size: usize,
    stack_size: u32,
    stack_index: u32,
    reserved_blocks: u32,
    aligned: bool,
    class_index: usize,
    slot: usize,
    #[cfg(debug_assertions)]
    live: FixedBitSet,
}

/// Borrowed, copyable view of a pool.
///
/// All pool state lives behind the top manager's mutex; every method that
/// touches it is `unsafe fn` and requires the caller to hold that lock (or
/// otherwise have exclusive access, as tests do).
#[derive(Clone, Copy)]
pub(crate) struct PoolRef(NonNull<PoolHeader>);

impl PoolRef {
    /// Reconstruct a pool view from its base address.
    ///
    /// # Safety
    /// `addr` must be the base address of a live pool created by
    /// [`TokenPool::create`].
    pub(crate) unsafe fn from_base_addr(addr: usize) -> Self {
        debug_assert!(addr != 0);
        // Safety: addr is a live pool base per the caller's contract.
        Self(unsafe { NonNull::new_unchecked(addr as *mut PoolHeader) })
    }

    pub(crate) fn base_addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    unsafe fn hdr<'a>(self) -> &'a PoolHeader {
        // Safety: exclusivity upheld by the caller.
        unsafe { &*self.0.as_ptr() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn hdr_mut<'a>(self) -> &'a mut PoolHeader {
        // Safety: exclusivity upheld by the caller.
        unsafe { &mut *self.0.as_ptr() }
    }

    /// Pointer to the token stack (right past the header, inside the pool).
    unsafe fn stack_ptr(self) -> *mut u16 {
        // Safety: the reserved prefix always covers header + stack.
        unsafe {
            self.0
                .as_ptr()
                .cast::<u8>()
                .add(std::mem::size_of::<PoolHeader>())
                .cast::<u16>()
        }
    }

    unsafe fn stack_at(self, i: usize) -> u16 {
        debug_assert!(i < unsafe { self.hdr() }.stack_size as usize);
        // Safety: i is within the stack per the assert above.
        unsafe { *self.stack_ptr().add(i) }
    }

    unsafe fn set_stack_at(self, i: usize, token: u16) {
        debug_assert!(i < unsafe { self.hdr() }.stack_size as usize);
        // Safety: i is within the stack per the assert above.
        unsafe { *self.stack_ptr().add(i) = token };
    }

    #[allow(dead_code)]
    pub(crate) unsafe fn pool_size(self) -> usize {
        unsafe { self.hdr() }.pool_size
    }

    pub(crate) unsafe fn block_size(self) -> usize {
        unsafe { self.hdr() }.block_size
    }

    #[allow(dead_code)]
    pub(crate) unsafe fn stack_size(self) -> usize {
        unsafe { self.hdr() }.stack_size as usize
    }

    #[allow(dead_code)]
    pub(crate) unsafe fn reserved_blocks(self) -> usize {
        unsafe { self.hdr() }.reserved_blocks as usize
    }

    pub(crate) unsafe fn is_aligned(self) -> bool {
        unsafe { self.hdr() }.aligned
    }

    pub(crate) unsafe fn class_index(self) -> usize {
        unsafe { self.hdr() }.class_index
    }

    pub(crate) unsafe fn slot(self) -> usize {
        unsafe { self.hdr() }.slot
    }

    pub(crate) unsafe fn set_slot(self, slot: usize) {
        unsafe { self.hdr_mut() }.slot = slot;
    }

    /// A pool is full when the slot at the stack cursor holds the 0 sentinel.
    pub(crate) unsafe fn is_full(self) -> bool {
        let idx = unsafe { self.hdr() }.stack_index as usize;
        unsafe { self.stack_at(idx) == 0 }
    }

    pub(crate) unsafe fn is_empty(self) -> bool {
        unsafe { self.hdr() }.stack_index == 0
    }

    /// Pop the top free token and hand out its block.
    ///
    /// # Safety
    /// Caller holds the manager lock and the pool is not full.
    pub(crate) unsafe fn alloc_one(self) -> NonNull<u8> {
        let idx = unsafe { self.hdr() }.stack_index as usize;
        let token = unsafe { self.stack_at(idx) } as usize;
        debug_assert!(token != 0, "allocation from a full pool");

        let h = unsafe { self.hdr_mut() };
        h.stack_index += 1;
        #[cfg(debug_assertions)]
        h.live.insert(token);

        let ptr = unsafe { self.0.as_ptr().cast::<u8>().add(token * h.block_size) };
        debug_assert!(
            token >= h.reserved_blocks as usize,
            "granted block overlaps the reserved prefix"
        );
        // Safety: base is non-null and token * block_size < pool_size.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Push the block holding `ptr` back onto the token stack.
    ///
    /// The caller is responsible for observing the full→free and free→empty
    /// transitions: `is_full` must be sampled *before* this call (the token
    /// write at the new stack top overwrites the 0 sentinel that marks a
    /// full pool), `is_empty` after.
    ///
    /// # Safety
    /// Caller holds the manager lock; `ptr` is a live allocation from this
    /// pool.
    pub(crate) unsafe fn free_one(self, ptr: NonNull<u8>) {
        let offset = ptr.as_ptr() as usize - self.base_addr();

        #[cfg(debug_assertions)]
        {
            let h = unsafe { self.hdr() };
            assert!(h.stack_index > 0, "free on an empty pool");
            assert!(
                offset < h.pool_size,
                "pointer {ptr:p} is outside its pool"
            );
        }

        let token = offset / unsafe { self.hdr() }.block_size;

        #[cfg(debug_assertions)]
        {
            let h = unsafe { self.hdr_mut() };
            assert!(
                token >= h.reserved_blocks as usize,
                "attempt to free a reserved block (pointer {ptr:p})"
            );
            assert!(
                h.live.contains(token),
                "double free detected for pointer {ptr:p} (token {token})"
            );
            h.live.set(token, false);
        }

        let h = unsafe { self.hdr_mut() };
        h.stack_index -= 1;
        let idx = h.stack_index as usize;
        #[allow(clippy::cast_possible_truncation)]
        unsafe {
            self.set_stack_at(idx, token as u16)
        };
    }

    /// Bytes currently granted out of this pool.
    pub(crate) unsafe fn total_alloc(self) -> usize {
        let h = unsafe { self.hdr() };
        h.block_size * h.stack_index as usize
    }

    pub(crate) unsafe fn total_instances(self) -> usize {
        unsafe { self.hdr() }.stack_index as usize
    }

    /// OS footprint attributed to this pool.
    pub(crate) unsafe fn total_space(self) -> usize {
        let h = unsafe { self.hdr() };
        h.pool_size + h.stack_size as usize * std::mem::size_of::<u16>()
    }

    /// Visit every live allocation: tokens below the stack cursor.
    pub(crate) unsafe fn for_each_live(self, f: &mut impl FnMut(NonNull<u8>, usize)) {
        let h = unsafe { self.hdr() };
        for i in 0..h.stack_index as usize {
            let token = unsafe { self.stack_at(i) } as usize;
            // Safety: live tokens address blocks inside the pool.
            let ptr = unsafe {
                NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().add(token * h.block_size))
            };
            f(ptr, h.block_size);
        }
    }
}

/// Owning handle for one pool region.  The region is a single OS allocation;
/// dropping the handle returns it in one call.
pub(crate) struct TokenPool {
    hdr: NonNull<PoolHeader>,
    os_align: usize,
}

// Safety: TokenPool owns its region; access is serialized by the manager.
unsafe impl Send for TokenPool {}

impl TokenPool {
    /// Allocate and initialize a pool region.
    ///
    /// With `align` set the region is aligned to `pool_size` itself, which
    /// makes the bitmask pointer→pool recovery valid; otherwise only
    /// [`OS_MIN_ALIGN`] is requested.  Fatal on invalid geometry or OS
    /// out-of-memory.
    pub(crate) fn create(
        pool_size: usize,
        block_size: usize,
        align: bool,
        class_index: usize,
    ) -> Self {
        if !pool_size.is_power_of_two() {
            fatal!("pool_size {pool_size} is not a power of two");
        }
        let stack_size = pool_size / block_size;
        if stack_size > MAX_STACK_SIZE {
            fatal!("stack size {stack_size} exceeds {MAX_STACK_SIZE}");
        }
        let reserved_bytes =
            std::mem::size_of::<PoolHeader>() + std::mem::size_of::<u16>() * stack_size;
        let reserved_blocks =
            reserved_bytes / block_size + usize::from(reserved_bytes % block_size > 0);
        if stack_size < reserved_blocks + 1 {
            fatal!("pool_size {pool_size} is too small for block_size {block_size}");
        }

        let os_align = if align { pool_size } else { OS_MIN_ALIGN };
        // Safety: size and alignment validated above.
        let region = match unsafe { PlatformOsMem::alloc_aligned(pool_size, os_align) } {
            Ok(ptr) => ptr,
            Err(e) => fatal!("failed allocating pool of {pool_size} bytes: {e}"),
        };

        let hdr = region.cast::<PoolHeader>();
        let aligned = region.as_ptr() as usize & (pool_size - 1) == 0;

        #[allow(clippy::cast_possible_truncation)]
        // Safety: the region is at least reserved_bytes long; header and
        // stack writes stay inside it.
        unsafe {
            hdr.as_ptr().write(PoolHeader {
                pool_size,
                block_size,
                stack_size: stack_size as u32,
                stack_index: 0,
                reserved_blocks: reserved_blocks as u32,
                aligned,
                class_index,
                slot: 0,
                #[cfg(debug_assertions)]
                live: FixedBitSet::with_capacity(stack_size),
            });
            let stack = region
                .as_ptr()
                .add(std::mem::size_of::<PoolHeader>())
                .cast::<u16>();
            for i in 0..stack_size {
                let token = i + reserved_blocks;
                *stack.add(i) = if token < stack_size { token as u16 } else { 0 };
            }
        }

        stats::POOL_BYTES.add(pool_size);
        stats::POOLS_LIVE.add(1);

        Self { hdr, os_align }
    }

    pub(crate) fn as_ref(&self) -> PoolRef {
        PoolRef(self.hdr)
    }
}

impl Drop for TokenPool {
    fn drop(&mut self) {
        // Safety: sole owner of the region; header is dropped in place
        // before the region is returned to the OS.
        unsafe {
            let pool_size = (*self.hdr.as_ptr()).pool_size;
            std::ptr::drop_in_place(self.hdr.as_ptr());
            PlatformOsMem::release(self.hdr.cast::<u8>(), pool_size, self.os_align);
            stats::sub_saturating(&stats::POOL_BYTES, pool_size);
            stats::sub_saturating(&stats::POOLS_LIVE, 1);
        }
    }
}
