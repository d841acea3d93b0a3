//! Epoch-based memory reclamation.
//!
//! Generalizes the single-epoch collector this crate was bootstrapped from
//! (one global epoch plus a flat garbage `Vec`, advanced from `Guard::drop`)
//! into the tiered design the rest of the crate needs: a 16x16 grid of
//! Treiber-stack buckets so retiring threads and retiring generations each
//! land in their own cell, and thread records that are registered once and
//! never freed — reclaimers walk the thread list concurrently with
//! registration and must always see valid memory, so deregistration only
//! clears the `active` flag rather than unlinking the record.
//!
//! ```ignore
//! let domain = EbrDomain::new();
//! let handle = domain.register_thread();
//!
//! let guard = handle.enter();
//! // ... read shared AtomicPtrs protected by this domain ...
//! guard.retire(ptr);
//! drop(guard); // exits the epoch
//!
//! domain.reclaim();
//! ```

use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

const GRID: usize = 16;

/// One registered thread's epoch bookkeeping. Allocated once via
/// `Box::leak` and never freed — see DESIGN.md for why this is load-bearing
/// rather than a leak bug.
struct ThreadRecord {
    logical_tid: u64,
    local_epoch: AtomicU32,
    active: AtomicBool,
    next: AtomicPtr<ThreadRecord>,
}

/// Type-erased retired pointer awaiting cleanup.
struct Garbage {
    ptr: *mut u8,
    cleanup: unsafe fn(*mut u8),
    next: AtomicPtr<Garbage>,
}

unsafe impl Send for Garbage {}

/// Type-erased deleter that reconstructs and drops a `Box<T>`.
unsafe fn drop_box<T>(ptr: *mut u8) {
    unsafe {
        drop(Box::from_raw(ptr as *mut T));
    }
}

#[derive(Default)]
struct Bucket {
    head: AtomicPtr<Garbage>,
}

impl Bucket {
    /// Treiber-stack push.
    fn push(&self, node: *mut Garbage) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Atomically takes the whole stack, leaving the bucket empty.
    fn take_all(&self) -> *mut Garbage {
        self.head.swap(std::ptr::null_mut(), Ordering::AcqRel)
    }
}

/// Owns the global epoch, the (never-shrinking) thread registry, and the
/// 16x16 retired-node grid. One domain per logical "collection" of shared
/// pointers that reclaim together.
pub struct EbrDomain {
    global_epoch: AtomicU32,
    thread_list: AtomicPtr<ThreadRecord>,
    next_tid: AtomicU64,
    buckets: [[Bucket; GRID]; GRID],
    reclaiming: AtomicBool,
}

impl EbrDomain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            global_epoch: AtomicU32::new(0),
            thread_list: AtomicPtr::new(std::ptr::null_mut()),
            next_tid: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| std::array::from_fn(|_| Bucket::default())),
            reclaiming: AtomicBool::new(false),
        })
    }

    /// Registers the calling thread, handing back an [`EbrHandle`] it
    /// should keep for the rest of its lifetime.
    pub fn register_thread(self: &Arc<Self>) -> EbrHandle {
        let logical_tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let record = Box::leak(Box::new(ThreadRecord {
            logical_tid,
            local_epoch: AtomicU32::new(u32::MAX),
            active: AtomicBool::new(false),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }));

        loop {
            let head = self.thread_list.load(Ordering::Acquire);
            record.next.store(head, Ordering::Relaxed);
            if self
                .thread_list
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        EbrHandle {
            domain: Arc::clone(self),
            record,
        }
    }

    fn current_epoch(&self) -> u32 {
        self.global_epoch.load(Ordering::Acquire)
    }

    fn bucket_for(&self, tid: u64, generation: u32) -> &Bucket {
        let x = (tid % GRID as u64) as usize;
        let y = ((tid / GRID as u64) as u32).wrapping_add(generation) as usize % GRID;
        &self.buckets[x][y]
    }

    /// Attempts to advance the global epoch and drain buckets that are now
    /// provably past every active reader. Single-writer via a trylock: a
    /// concurrent `reclaim` call simply returns `false` rather than
    /// blocking. A failed safety check is not an error, just a deferral,
    /// and this is safe to call even before any thread has registered.
    pub fn reclaim(&self) -> bool {
        if self
            .reclaiming
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        let did_advance = self.reclaim_locked();
        self.reclaiming.store(false, Ordering::Release);
        did_advance
    }

    fn reclaim_locked(&self) -> bool {
        let g = self.current_epoch();
        fence(Ordering::SeqCst);

        let mut cursor = self.thread_list.load(Ordering::Acquire);
        while !cursor.is_null() {
            let record = unsafe { &*cursor };
            if record.active.load(Ordering::Acquire) && record.local_epoch.load(Ordering::Acquire) < g
            {
                // An active reader hasn't observed the current epoch yet;
                // advancing now would be unsafe. Defer.
                return false;
            }
            cursor = record.next.load(Ordering::Acquire);
        }

        self.global_epoch.fetch_add(1, Ordering::Release);

        for row in &self.buckets {
            for bucket in row {
                let mut node = bucket.take_all();
                while !node.is_null() {
                    let garbage = unsafe { Box::from_raw(node) };
                    node = garbage.next.load(Ordering::Relaxed);
                    unsafe { (garbage.cleanup)(garbage.ptr) };
                }
            }
        }

        true
    }
}

/// Per-thread handle obtained from [`EbrDomain::register_thread`].
pub struct EbrHandle {
    domain: Arc<EbrDomain>,
    record: &'static ThreadRecord,
}

impl EbrHandle {
    /// Pins the current thread to the domain's epoch, returning an RAII
    /// [`Guard`] that unpins on drop.
    pub fn enter(&self) -> Guard<'_> {
        self.enter_raw();
        Guard { handle: self }
    }

    /// Low-level pin, without the RAII guard. Exposed so a blocking future
    /// wait can `exit_raw` before sleeping and `enter_raw` again on wakeup
    /// without dropping and re-registering the handle.
    pub fn enter_raw(&self) {
        let epoch = self.domain.current_epoch();
        self.record.local_epoch.store(epoch, Ordering::Release);
        self.record.active.store(true, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    pub fn exit_raw(&self) {
        self.record.active.store(false, Ordering::Release);
    }

    /// Retires `ptr` (must come from `Box::into_raw`) for deferred cleanup
    /// once it is safe.
    pub fn retire<T>(&self, ptr: *mut T) {
        let generation = self.domain.current_epoch();
        let node = Box::into_raw(Box::new(Garbage {
            ptr: ptr as *mut u8,
            cleanup: drop_box::<T>,
            next: AtomicPtr::new(std::ptr::null_mut()),
        }));
        self.domain
            .bucket_for(self.record.logical_tid, generation)
            .push(node);
    }

    pub fn logical_tid(&self) -> u64 {
        self.record.logical_tid
    }
}

impl Drop for EbrHandle {
    fn drop(&mut self) {
        // Deregistration only clears `active`; the record itself is never
        // freed (see module docs).
        self.record.active.store(false, Ordering::Release);
    }
}

/// RAII proof that the calling thread is pinned to the domain's epoch.
pub struct Guard<'a> {
    handle: &'a EbrHandle,
}

impl Guard<'_> {
    pub fn retire<T>(&self, ptr: *mut T) {
        self.handle.retire(ptr);
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.handle.exit_raw();
    }
}
