//! Tiered allocator: thread-local small pool, lock-free bump arena, general
//! host allocation. Tier is chosen purely from requested size; callers never
//! pick a tier directly.
//!
//! Every "root" allocation (`flags.is_root`) is published into the global
//! [`crate::registry::PointerRegistry`] and, unless the caller opts out,
//! into the global [`crate::tree::TrackingTree`] so the background sweeper
//! can reclaim it once its lifetime expires and nothing references it.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::atomics::Counter64;
use crate::error::{TtakError, TtakResult};
use crate::header::{fatal_corruption, flag, AllocationTier, BlockHeader, CANARY};
use crate::registry::PointerRegistry;
use crate::time::NEVER;
use crate::tree::TrackingTree;

/// Explicit size-class table for the small pool, resolving the
/// "bit-packed vs explicit table" design question in favor of a plain
/// lookup: the page header still carries a corruption-detecting magic, but
/// the class index is a separate `u8`, never folded into it.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 48, 64, 80, 96, 112, 128];

const SMALL_POOL_MAX: usize = 128;
const BUMP_ARENA_MAX: usize = 16 * 1024;

fn size_class_index(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&c| size <= c)
}

fn tier_for(size: usize) -> AllocationTier {
    if size <= SMALL_POOL_MAX {
        AllocationTier::SmallPool
    } else if size <= BUMP_ARENA_MAX {
        AllocationTier::BumpArena
    } else {
        AllocationTier::General
    }
}

/// Flags requested by a caller at allocation time; distinct from the header
/// bit flags so callers don't need to know the header's bit layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocFlags {
    pub is_const: bool,
    pub is_volatile: bool,
    pub allow_direct_access: bool,
    pub is_root: bool,
    pub strict_check: bool,
    pub is_huge: bool,
}

impl AllocFlags {
    fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.is_const {
            bits |= flag::IS_CONST;
        }
        if self.is_volatile {
            bits |= flag::IS_VOLATILE;
        }
        if self.allow_direct_access {
            bits |= flag::ALLOW_DIRECT_ACCESS;
        }
        if self.is_root {
            bits |= flag::IS_ROOT;
        }
        if self.strict_check {
            bits |= flag::STRICT_CHECK;
        }
        if self.is_huge {
            bits |= flag::IS_HUGE;
        }
        bits
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    pub small_pool_max: usize,
    pub bump_arena_max: usize,
    pub bump_arena_region: usize,
    pub hot_pointer_threshold: u64,
    pub huge_pages: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            small_pool_max: SMALL_POOL_MAX,
            bump_arena_max: BUMP_ARENA_MAX,
            bump_arena_region: 4 * 1024 * 1024,
            hot_pointer_threshold: 1_000_000,
            huge_pages: false,
        }
    }
}

fn header_layout_for(size: usize) -> (Layout, usize, usize) {
    let header_layout = Layout::new::<BlockHeader>();
    let (combined, user_offset) = header_layout
        .extend(Layout::array::<u8>(size).expect("size overflow"))
        .expect("layout overflow");
    let (combined, canary_offset) = combined
        .extend(Layout::new::<u64>())
        .expect("layout overflow");
    (combined.pad_to_align(), user_offset, canary_offset)
}

/// The layout actually backing a block of `size` bytes. Every small-pool
/// slab is sized to its class maximum, not the requested size, so any two
/// allocations in the same class produce interchangeable slabs; the
/// freelist is keyed on class alone and must never hand back a slab
/// smaller than what the class promises.
fn host_layout_for(tier: AllocationTier, size: usize) -> Layout {
    match tier {
        AllocationTier::SmallPool => {
            let class = size_class_index(size).expect("size within small pool bound");
            header_layout_for(SIZE_CLASSES[class]).0
        }
        AllocationTier::BumpArena | AllocationTier::General => header_layout_for(size).0,
    }
}

/// Lock-free bump region. Never reclaims individual allocations; the whole
/// region is released with the allocator.
struct BumpArena {
    base: NonNull<u8>,
    layout: Layout,
    cursor: AtomicUsize,
    capacity: usize,
}

unsafe impl Send for BumpArena {}
unsafe impl Sync for BumpArena {}

impl BumpArena {
    fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, 64).expect("bad bump arena layout");
        let base = unsafe { alloc(layout) };
        let base = NonNull::new(base).expect("bump arena allocation failed");
        Self {
            base,
            layout,
            cursor: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Bumps the cursor by `total` bytes (64-byte aligned), returning the
    /// base pointer of the reserved region, or `None` if the arena is full.
    fn bump(&self, total: usize) -> Option<NonNull<u8>> {
        let aligned = (total + 63) & !63;
        loop {
            let cur = self.cursor.load(Ordering::Relaxed);
            let next = cur.checked_add(aligned)?;
            if next > self.capacity {
                return None;
            }
            if self
                .cursor
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(cur)) });
            }
        }
    }
}

impl Drop for BumpArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

thread_local! {
    /// One LIFO free-list per size class. Populated lazily.
    static SMALL_POOLS: RefCell<Vec<Vec<NonNull<u8>>>> =
        RefCell::new((0..SIZE_CLASSES.len()).map(|_| Vec::new()).collect());

    /// Re-entrancy guard: prevents recursive allocator calls (e.g. from a
    /// `tracing` subscriber that itself allocates) from deadlocking.
    static IN_ALLOCATOR: RefCell<bool> = const { RefCell::new(false) };
}

fn with_reentrancy_guard<R>(f: impl FnOnce() -> R) -> Option<R> {
    let already_in = IN_ALLOCATOR.with(|flag| {
        let mut flag = flag.borrow_mut();
        let was = *flag;
        *flag = true;
        was
    });
    if already_in {
        return None;
    }
    let result = f();
    IN_ALLOCATOR.with(|flag| *flag.borrow_mut() = false);
    Some(result)
}

/// Owns every allocator-global piece of state: usage accounting, the bump
/// region, and the registry/tree a "root" allocation publishes into.
pub struct Allocator {
    config: AllocatorConfig,
    usage_bytes: Counter64,
    high_watermark: u64,
    bump: BumpArena,
    pub registry: Arc<PointerRegistry>,
    pub tree: Arc<TrackingTree>,
    trace_enabled: AtomicBool,
}

impl Allocator {
    pub fn new(config: AllocatorConfig, registry: Arc<PointerRegistry>, tree: Arc<TrackingTree>) -> Self {
        Self {
            bump: BumpArena::new(config.bump_arena_region),
            high_watermark: config.bump_arena_region as u64 * 4,
            config,
            usage_bytes: Counter64::new(0),
            registry,
            tree,
            trace_enabled: AtomicBool::new(false),
        }
    }

    pub fn usage_bytes(&self) -> u64 {
        self.usage_bytes.load()
    }

    pub fn pressure_high(&self) -> bool {
        self.usage_bytes() > self.high_watermark
    }

    pub fn set_trace(&self, on: bool) {
        self.trace_enabled.store(on, Ordering::Release);
    }

    fn header_of(ptr: *mut u8) -> *mut BlockHeader {
        unsafe { ptr.sub(std::mem::size_of::<BlockHeader>()) as *mut BlockHeader }
    }

    fn user_ptr_of(header: *mut BlockHeader) -> *mut u8 {
        unsafe { (header as *mut u8).add(std::mem::size_of::<BlockHeader>()) }
    }

    fn canary_end_ptr(user_ptr: *mut u8, size: usize) -> *mut u64 {
        unsafe { user_ptr.add(size) as *mut u64 }
    }

    /// Allocates `size` bytes with the given lifetime (`None` = never
    /// expires) and flags. Returns `nil` (`None`) on failure; one retry
    /// after `autoclean` is attempted by the caller-visible wrapper, not
    /// here (this is the raw tiered allocation primitive).
    pub fn alloc(
        &self,
        size: usize,
        lifetime_ticks: Option<u64>,
        now: u64,
        flags: AllocFlags,
    ) -> TtakResult<*mut u8> {
        if size == 0 {
            return Err(TtakError::InvalidArgument("zero-sized allocation"));
        }

        let tier = tier_for(size);
        let layout = host_layout_for(tier, size);

        let header_ptr = match tier {
            AllocationTier::SmallPool => self.alloc_small(size, layout)?,
            AllocationTier::BumpArena => self
                .bump
                .bump(layout.size())
                .map(|p| p.as_ptr() as *mut BlockHeader)
                .ok_or(TtakError::OutOfMemory("bump arena exhausted"))?,
            AllocationTier::General => self.alloc_general(layout, flags.is_huge)?,
        };

        let expires_tick = lifetime_ticks
            .map(|l| now.saturating_add(l))
            .unwrap_or(NEVER);

        unsafe {
            std::ptr::write(
                header_ptr,
                BlockHeader::new(size, now, expires_tick, tier, flags.to_bits()),
            );
        }

        let user_ptr = Self::user_ptr_of(header_ptr);
        unsafe {
            std::ptr::write(Self::canary_end_ptr(user_ptr, size), CANARY);
        }

        self.usage_bytes.add(layout.size() as u64);

        if flags.is_root {
            self.registry.put(user_ptr as usize, header_ptr as usize);
            let _ = self.tree.add(user_ptr as usize, size, expires_tick, true);
        }

        if self.trace_enabled.load(Ordering::Relaxed) {
            tracing::debug!(event = "alloc", ptr = ?user_ptr, size, tier = ?tier, tick = now);
        }

        Ok(user_ptr)
    }

    fn alloc_small(&self, size: usize, layout: Layout) -> TtakResult<*mut BlockHeader> {
        let class = size_class_index(size).expect("size within small pool bound");
        let reused = SMALL_POOLS.with(|pools| pools.borrow_mut()[class].pop());
        if let Some(ptr) = reused {
            return Ok(ptr.as_ptr() as *mut BlockHeader);
        }
        let raw = unsafe { alloc(layout) };
        NonNull::new(raw)
            .map(|p| p.as_ptr() as *mut BlockHeader)
            .ok_or(TtakError::OutOfMemory("small pool host allocation failed"))
    }

    fn alloc_general(&self, layout: Layout, huge: bool) -> TtakResult<*mut BlockHeader> {
        if huge
            && self.config.huge_pages
            && let Some(ptr) = self.alloc_huge(layout)
        {
            return Ok(ptr as *mut BlockHeader);
        }
        // Huge-page request failed or not requested; fall through to a
        // normal mapping rather than failing the whole allocation.
        let raw = unsafe {
            let mut out: *mut libc::c_void = std::ptr::null_mut();
            let align = layout.align().max(std::mem::size_of::<usize>());
            let rc = libc::posix_memalign(&mut out, align, layout.size());
            if rc != 0 {
                std::ptr::null_mut()
            } else {
                out as *mut u8
            }
        };
        NonNull::new(raw)
            .map(|p| p.as_ptr() as *mut BlockHeader)
            .ok_or(TtakError::OutOfMemory("general host allocation failed"))
    }

    fn alloc_huge(&self, layout: Layout) -> Option<*mut u8> {
        let len = layout.size();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            None
        } else {
            Some(ptr as *mut u8)
        }
    }

    /// Fast-path validated access: magic, `freed == false`, expiry, and
    /// `allow_direct_access`. Bumps `access_count` on success. Any magic or
    /// canary mismatch is fatal, never a `None`.
    ///
    /// # Safety
    /// `user_ptr` must be `null` or a pointer previously returned by
    /// [`Self::alloc`]/[`Self::dup`]/[`Self::realloc`] on this allocator
    /// and not yet passed to [`Self::free`].
    pub unsafe fn access(&self, user_ptr: *mut u8, now: u64) -> Option<*mut u8> {
        if user_ptr.is_null() {
            return None;
        }
        let header_ptr = Self::header_of(user_ptr);
        let header = unsafe { &*header_ptr };

        if !header.validate() {
            fatal_corruption(user_ptr, "header magic/checksum mismatch");
        }
        if header.has_flag(flag::STRICT_CHECK) {
            let canary = unsafe { Self::canary_end_ptr(user_ptr, header.size()).read() };
            if header.canary_start() != CANARY || canary != CANARY {
                fatal_corruption(user_ptr, "canary mismatch");
            }
        }

        if header.is_freed_fast() {
            return None;
        }
        if header.expires_tick() != NEVER && header.expires_tick() < now {
            return None;
        }
        if !header.has_flag(flag::ALLOW_DIRECT_ACCESS) {
            return None;
        }

        header.bump_access_count();
        Some(user_ptr)
    }

    /// Idempotent free: a second call on an already-freed block is a no-op.
    ///
    /// # Safety
    /// `user_ptr` must be `null` or a pointer previously returned by
    /// [`Self::alloc`]/[`Self::dup`]/[`Self::realloc`] on this allocator.
    pub unsafe fn free(&self, user_ptr: *mut u8) {
        if user_ptr.is_null() {
            return;
        }
        let header_ptr = Self::header_of(user_ptr);
        let header = unsafe { &*header_ptr };
        if !header.mark_freed() {
            return;
        }

        self.registry.delete(user_ptr as usize);

        let size = header.size();
        let tier = header.allocation_tier();
        let layout = host_layout_for(tier, size);
        self.usage_bytes.sub_saturating(layout.size() as u64);

        match tier {
            AllocationTier::SmallPool => {
                if let Some(class) = size_class_index(size) {
                    SMALL_POOLS.with(|pools| {
                        pools.borrow_mut()[class]
                            .push(unsafe { NonNull::new_unchecked(header_ptr as *mut u8) })
                    });
                }
            }
            AllocationTier::BumpArena => {
                // Never individually reclaimed; the row stays live until
                // the whole bump region is dropped.
            }
            AllocationTier::General => {
                unsafe { dealloc(header_ptr as *mut u8, layout) };
            }
        }
    }

    /// # Safety
    /// `user_ptr` must be a pointer previously returned by
    /// [`Self::alloc`]/[`Self::dup`]/[`Self::realloc`] on this allocator
    /// and not yet passed to [`Self::free`].
    pub unsafe fn realloc(
        &self,
        user_ptr: *mut u8,
        new_size: usize,
        lifetime_ticks: Option<u64>,
        now: u64,
        flags: AllocFlags,
    ) -> TtakResult<*mut u8> {
        let header_ptr = Self::header_of(user_ptr);
        let header = unsafe { &*header_ptr };
        if !header.validate() {
            fatal_corruption(user_ptr, "header magic/checksum mismatch on realloc");
        }
        let old_size = header.size();
        let new_ptr = self.alloc(new_size, lifetime_ticks, now, flags)?;
        let copy_len = old_size.min(new_size);
        unsafe {
            std::ptr::copy_nonoverlapping(user_ptr, new_ptr, copy_len);
            self.free(user_ptr);
        }
        Ok(new_ptr)
    }

    /// # Safety
    /// `src` must be valid for reads of `size` bytes.
    pub unsafe fn dup(
        &self,
        src: *const u8,
        size: usize,
        lifetime_ticks: Option<u64>,
        now: u64,
        flags: AllocFlags,
    ) -> TtakResult<*mut u8> {
        let new_ptr = self.alloc(size, lifetime_ticks, now, flags)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src, new_ptr, size);
        }
        Ok(new_ptr)
    }

    /// Snapshot of root allocations that are either expired or "hot"
    /// (access count past `hot_pointer_threshold`).
    pub fn inspect_dirty(&self, now: u64) -> Vec<usize> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|&(user_ptr, header_ptr)| {
                let header = unsafe { &*(header_ptr as *const BlockHeader) };
                let expired = header.expires_tick() != NEVER && header.expires_tick() < now;
                let hot = header.access_count() > self.config.hot_pointer_threshold;
                let _ = user_ptr;
                expired || hot
            })
            .map(|(user_ptr, _)| user_ptr)
            .collect()
    }

    /// Frees every entry `inspect_dirty` would return. Retried once on a
    /// transient failure (there is nothing to retry against here since
    /// `free` cannot fail, but the shape matches the allocator-wide retry
    /// contract used by `alloc`).
    pub fn autoclean(&self, now: u64) -> usize {
        let dirty = self.inspect_dirty(now);
        let count = dirty.len();
        for ptr in dirty {
            unsafe { self.free(ptr as *mut u8) };
        }
        count
    }
}

/// Runs `f` only if this thread is not already inside an allocator call;
/// used by collaborators that must avoid recursive bootstrap allocation.
pub fn guarded<R>(f: impl FnOnce() -> R) -> Option<R> {
    with_reentrancy_guard(f)
}
