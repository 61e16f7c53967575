use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// Handlers registered per message or event kind. Dispatch snapshots the
/// list so handlers can register more handlers without deadlocking.
pub struct HandlerTable<K, H: ?Sized> {
    handlers: RwLock<HashMap<K, Vec<Arc<H>>>>,
}

impl<K, H> HandlerTable<K, H>
where
    K: Eq + Hash + Copy,
    H: ?Sized,
{
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, kind: K, handler: Arc<H>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.entry(kind).or_default().push(handler);
    }

    pub fn handlers_for(&self, kind: K) -> Vec<Arc<H>> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.get(&kind).cloned().unwrap_or_default()
    }

    pub fn count(&self, kind: K) -> usize {
        self.handlers_for(kind).len()
    }
}

impl<K, H> Default for HandlerTable<K, H>
where
    K: Eq + Hash + Copy,
    H: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> &'static str;
    }

    struct Hello;
    impl Greeter for Hello {
        fn greet(&self) -> &'static str {
            "hello"
        }
    }

    #[test]
    fn handlers_are_keyed_by_kind() {
        let table: HandlerTable<u8, dyn Greeter> = HandlerTable::new();
        table.register(1, Arc::new(Hello));
        table.register(1, Arc::new(Hello));

        assert_eq!(table.count(1), 2);
        assert_eq!(table.count(2), 0);
        assert!(table.handlers_for(1).iter().all(|h| h.greet() == "hello"));
    }
}
