//! Resolver dispatch: maps a fault instruction pointer to source-level
//! location metadata. Symbol resolution itself is out of scope for this
//! crate; it only owns the dispatch seam an adapter plugs a resolver into,
//! one per `adapter_id`.

use memwatch_common::AdapterId;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Location {
    pub file: Option<String>,
    pub function: Option<String>,
    pub line: Option<u32>,
}

pub trait Resolver: Send + Sync {
    fn resolve(&self, fault_ip: u64) -> Option<Location>;
}

#[derive(Default)]
pub struct ResolverTable {
    resolvers: Mutex<HashMap<AdapterId, Arc<dyn Resolver>>>,
}

impl ResolverTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter_id: AdapterId, resolver: Arc<dyn Resolver>) {
        self.resolvers.lock().unwrap().insert(adapter_id, resolver);
    }

    pub fn unregister(&self, adapter_id: AdapterId) {
        self.resolvers.lock().unwrap().remove(&adapter_id);
    }

    /// Resolve `fault_ip` through the adapter's registered resolver. A soft
    /// `timeout` bounds how long the worker waits: resolvers are expected
    /// to be synchronous and fast (symbol table lookups), but a slow or
    /// wedged resolver must not stall event delivery. The call itself runs
    /// on a dedicated thread so a resolver that never returns degrades this
    /// one event's `where` to `None` instead of wedging the worker that
    /// drains the ring for every other event too.
    pub fn resolve(&self, adapter_id: AdapterId, fault_ip: u64, timeout: Duration) -> Option<Location> {
        let resolver = self.resolvers.lock().unwrap().get(&adapter_id).cloned()?;
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(resolver.resolve(fault_ip));
        });
        rx.recv_timeout(timeout).unwrap_or(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver(Location);
    impl Resolver for FixedResolver {
        fn resolve(&self, _fault_ip: u64) -> Option<Location> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn unregistered_adapter_resolves_to_none() {
        let table = ResolverTable::new();
        assert!(table
            .resolve(AdapterId(1), 0x1000, Duration::from_millis(5))
            .is_none());
    }

    #[test]
    fn registered_resolver_is_invoked() {
        let table = ResolverTable::new();
        table.register(
            AdapterId(1),
            Arc::new(FixedResolver(Location {
                file: Some("main.py".into()),
                function: Some("handler".into()),
                line: Some(42),
            })),
        );
        let loc = table
            .resolve(AdapterId(1), 0x1000, Duration::from_millis(50))
            .unwrap();
        assert_eq!(loc.line, Some(42));
    }

    #[test]
    fn unregister_removes_the_resolver() {
        let table = ResolverTable::new();
        table.register(AdapterId(1), Arc::new(FixedResolver(Location::default())));
        table.unregister(AdapterId(1));
        assert!(table
            .resolve(AdapterId(1), 0x1000, Duration::from_millis(5))
            .is_none());
    }

    struct BlockingResolver;
    impl Resolver for BlockingResolver {
        fn resolve(&self, _fault_ip: u64) -> Option<Location> {
            std::thread::sleep(Duration::from_secs(60));
            Some(Location::default())
        }
    }

    #[test]
    fn a_resolver_that_blocks_past_its_timeout_yields_none_without_blocking_the_caller() {
        let table = ResolverTable::new();
        table.register(AdapterId(1), Arc::new(BlockingResolver));

        let started = std::time::Instant::now();
        let result = table.resolve(AdapterId(1), 0x1000, Duration::from_millis(20));
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
