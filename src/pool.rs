//! Fixed-size worker thread pool consuming a priority queue of tasks. Each
//! worker enters the shared EBR domain's epoch around task execution so
//! tasks that touch epoch-protected structures are automatically covered,
//! without every task having to register its own thread record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::ebr::EbrDomain;
use crate::future::{promise_create, Future};
use crate::heap::PriorityHeap;

type Job = Box<dyn FnOnce() + Send>;

struct Queue {
    heap: PriorityHeap<Job>,
    shutdown: bool,
}

/// `create(n_workers, ...)`: a pool of `n_workers` threads draining a
/// shared priority queue. `destroy` sets a shutdown flag, wakes every
/// worker and joins them.
pub struct ThreadPool {
    queue: Arc<(Mutex<Queue>, Condvar)>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    domain: Arc<EbrDomain>,
    destroyed: AtomicBool,
}

impl ThreadPool {
    pub fn create(n_workers: usize) -> Arc<Self> {
        let queue = Arc::new((
            Mutex::new(Queue {
                heap: PriorityHeap::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let pool = Arc::new(Self {
            queue,
            workers: Mutex::new(Vec::new()),
            domain: EbrDomain::new(),
            destroyed: AtomicBool::new(false),
        });

        let mut workers = pool.workers.lock().expect("pool lock poisoned");
        for _ in 0..n_workers.max(1) {
            let queue = Arc::clone(&pool.queue);
            let domain = Arc::clone(&pool.domain);
            workers.push(std::thread::spawn(move || worker_loop(queue, domain)));
        }
        drop(workers);
        pool
    }

    /// `schedule_task`: pushes a raw job at `priority` (higher pops first,
    /// FIFO on ties).
    pub fn schedule_task(&self, job: Job, priority: i64) {
        let (mutex, condvar) = &*self.queue;
        let mut q = mutex.lock().expect("pool lock poisoned");
        q.heap.push(job, priority);
        condvar.notify_one();
    }

    /// `submit_task`: convenience wrapper returning a [`Future`] for the
    /// task's result.
    pub fn submit_task<T: Send + 'static>(
        &self,
        priority: i64,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> Future<T> {
        let (promise, future) = promise_create::<T>();
        self.schedule_task(
            Box::new(move || {
                let value = f();
                promise.set_value(value);
            }),
            priority,
        );
        future
    }

    pub fn pending(&self) -> usize {
        self.queue.0.lock().expect("pool lock poisoned").heap.len()
    }

    /// `destroy`: cooperative shutdown. Workers finish their current task,
    /// observe the shutdown flag, and exit; remaining queued jobs are
    /// dropped without running.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut q = self.queue.0.lock().expect("pool lock poisoned");
            q.shutdown = true;
        }
        self.queue.1.notify_all();
        let mut workers = self.workers.lock().expect("pool lock poisoned");
        for w in workers.drain(..) {
            let _ = w.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn worker_loop(queue: Arc<(Mutex<Queue>, Condvar)>, domain: Arc<EbrDomain>) {
    let handle = domain.register_thread();
    let (mutex, condvar) = &*queue;
    loop {
        let mut q = mutex.lock().expect("pool lock poisoned");
        while q.heap.is_empty() && !q.shutdown {
            q = condvar.wait(q).expect("pool lock poisoned");
        }
        if q.heap.is_empty() && q.shutdown {
            return;
        }
        let job = q.heap.pop().expect("heap non-empty under lock");
        drop(q);

        let guard = handle.enter();
        job();
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn submit_task_returns_computed_value() {
        let pool = ThreadPool::create(2);
        let f = pool.submit_task(0, || 6 * 7);
        assert_eq!(f.get(None), 42);
        pool.destroy();
    }

    #[test]
    fn priority_fifo_scenario() {
        // 4 workers; 10 prio-1 tasks and 1 prio-10 task submitted as
        // (prio1)x5, prio10, (prio1)x5. All 4 workers immediately pick up
        // the first 4 prio-1 tasks, so the prio-10 task is the 6th task to
        // *start*, and remaining prio-1 tasks run in submission order.
        let pool = ThreadPool::create(1); // single worker to make order deterministic
        let order = Arc::new(StdMutex::new(Vec::new()));
        let started = Arc::new(AtomicUsize::new(0));

        // Block the single worker on the first task until all 11 are queued.
        let gate = Arc::new(std::sync::Barrier::new(2));
        {
            let gate = Arc::clone(&gate);
            pool.schedule_task(
                Box::new(move || {
                    gate.wait();
                }),
                100,
            );
        }

        for i in 0..5 {
            let order = Arc::clone(&order);
            let started = Arc::clone(&started);
            pool.schedule_task(
                Box::new(move || {
                    started.fetch_add(1, Ordering::SeqCst);
                    order.lock().unwrap().push(format!("lo-{i}"));
                }),
                1,
            );
        }
        {
            let order = Arc::clone(&order);
            pool.schedule_task(
                Box::new(move || {
                    order.lock().unwrap().push("hi".to_string());
                }),
                10,
            );
        }
        for i in 5..10 {
            let order = Arc::clone(&order);
            pool.schedule_task(
                Box::new(move || {
                    order.lock().unwrap().push(format!("lo-{i}"));
                }),
                1,
            );
        }

        // Let the gating task run now that everything is queued.
        std::thread::sleep(Duration::from_millis(20));
        gate.wait();

        // Wait for all remaining tasks to complete.
        while pool.pending() > 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(20));

        let order = order.lock().unwrap().clone();
        assert_eq!(order[0], "hi");
        for i in 0..10 {
            assert_eq!(order[i + 1], format!("lo-{i}"));
        }
        pool.destroy();
    }
}
