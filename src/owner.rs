//! Owner sandbox: a named-resource / named-function registry dispatched
//! under a read lock, gated by policy flags. Used by collaborators (e.g.
//! the search applications' on-disk ledger) as an actor — record writes and
//! persistence are registered as named functions dispatched through one
//! owner so no direct cross-thread access to the guarded state is ever
//! taken.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::{TtakError, TtakResult};
use crate::time::now_ns;

#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyFlags {
    pub deny_threading: bool,
    pub deny_volatile: bool,
    pub deny_external_pointers: bool,
}

pub type Resource = usize;
pub type DispatchFn = Box<dyn Fn(Resource, &[u8]) -> TtakResult<Vec<u8>> + Send + Sync>;

struct FuncEntry {
    func: DispatchFn,
    spawns_threads: bool,
    touches_volatile: bool,
    touches_external: bool,
}

/// A policy-gated actor over named resources and named functions.
pub struct Owner {
    resources: RwLock<HashMap<String, Resource>>,
    functions: RwLock<HashMap<String, FuncEntry>>,
    policy: PolicyFlags,
    creation_tick: u64,
    call_count: AtomicU64,
}

impl Owner {
    pub fn create(policy: PolicyFlags) -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
            policy,
            creation_tick: now_ns(),
            call_count: AtomicU64::new(0),
        }
    }

    pub fn creation_tick(&self) -> u64 {
        self.creation_tick
    }

    pub fn register_resource(&self, name: &str, resource: Resource) -> TtakResult<()> {
        let mut map = self.resources.write().expect("owner lock poisoned");
        if map.contains_key(name) {
            return Err(TtakError::InvalidArgument("resource name already registered"));
        }
        map.insert(name.to_string(), resource);
        Ok(())
    }

    /// `spawns_threads`/`touches_volatile`/`touches_external` describe what
    /// the function *would* do, so `execute` can refuse it up front against
    /// this owner's policy rather than trusting the function body to check.
    pub fn register_func(
        &self,
        name: &str,
        func: DispatchFn,
        spawns_threads: bool,
        touches_volatile: bool,
        touches_external: bool,
    ) -> TtakResult<()> {
        let mut map = self.functions.write().expect("owner lock poisoned");
        if map.contains_key(name) {
            return Err(TtakError::InvalidArgument("function name already registered"));
        }
        map.insert(
            name.to_string(),
            FuncEntry {
                func,
                spawns_threads,
                touches_volatile,
                touches_external,
            },
        );
        Ok(())
    }

    /// Looks up `func_name`/`resource_name` under a read lock and dispatches
    /// `func(resource, args)`, refusing the call if it conflicts with this
    /// owner's policy flags.
    pub fn execute(&self, func_name: &str, resource_name: &str, args: &[u8]) -> TtakResult<Vec<u8>> {
        let resources = self.resources.read().expect("owner lock poisoned");
        let resource = *resources
            .get(resource_name)
            .ok_or(TtakError::InvalidArgument("unknown resource"))?;
        drop(resources);

        let functions = self.functions.read().expect("owner lock poisoned");
        let entry = functions
            .get(func_name)
            .ok_or(TtakError::InvalidArgument("unknown function"))?;

        if self.policy.deny_threading && entry.spawns_threads {
            return Err(TtakError::InvalidArgument("policy denies thread spawning"));
        }
        if self.policy.deny_volatile && entry.touches_volatile {
            return Err(TtakError::InvalidArgument("policy denies volatile memory access"));
        }
        if self.policy.deny_external_pointers && entry.touches_external {
            return Err(TtakError::InvalidArgument("policy denies external pointer access"));
        }

        self.call_count.fetch_add(1, Ordering::Relaxed);
        (entry.func)(resource, args)
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Destroys the owner, releasing every registered resource through
    /// `release`.
    pub fn destroy(&self, release: impl Fn(Resource)) {
        let mut resources = self.resources.write().expect("owner lock poisoned");
        for (_, resource) in resources.drain() {
            release(resource);
        }
        self.functions.write().expect("owner lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn deny_threading_blocks_thread_spawning_func() {
        let owner = Owner::create(PolicyFlags {
            deny_threading: true,
            ..Default::default()
        });
        owner.register_resource("ledger", 0x1000).unwrap();
        owner
            .register_func("alloc_fn", Box::new(|_r, _a| Ok(vec![1])), false, false, false)
            .unwrap();
        owner
            .register_func("spawn_fn", Box::new(|_r, _a| Ok(vec![2])), true, false, false)
            .unwrap();

        assert!(owner.execute("alloc_fn", "ledger", &[]).is_ok());
        assert!(owner.execute("spawn_fn", "ledger", &[]).is_err());
    }

    #[test]
    fn destroy_releases_every_resource() {
        let owner = Owner::create(PolicyFlags::default());
        owner.register_resource("a", 1).unwrap();
        owner.register_resource("b", 2).unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let released2 = Arc::clone(&released);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        owner.destroy(move |r| {
            seen2.lock().unwrap().push(r);
            released2.store(true, Ordering::Relaxed);
        });

        assert!(released.load(Ordering::Relaxed));
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let owner = Owner::create(PolicyFlags::default());
        owner.register_resource("a", 1).unwrap();
        assert!(owner.register_resource("a", 2).is_err());
    }
}
