use crate::prelude::*;

use std::any::Any;

/// Name of the built-in slot holding the graph client, published by the
/// engine so wrapper code can run ad-hoc queries.
pub const GRAPH_DRIVER_SLOT: &str = "graph_driver";

/// Named cross-worker values, the sole supported channel for inter-worker
/// state. Slots are registered before the engine starts; the engine neither
/// clones nor synchronizes slot values, so anything mutable inside a slot
/// must bring its own locking.
#[derive(Default)]
pub struct SharedState {
    slots: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value under `name`, replacing any previous slot.
    pub fn insert<T: Send + Sync + 'static>(&self, name: impl Into<String>, value: T) {
        self.insert_arc(name, Arc::new(value));
    }

    pub fn insert_arc(&self, name: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        let name = name.into();
        let mut slots = self.slots.write().unwrap();
        if slots.insert(name.clone(), value).is_some() {
            debug!(slot = %name, "shared state slot replaced");
        }
    }

    /// Typed access to a slot. `None` if the slot is absent or holds a
    /// different type.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        let slots = self.slots.read().unwrap();
        slots.get(name).cloned()?.downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.read().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn typed_slot_round_trip() {
        let state = SharedState::new();
        state.insert("counter", AtomicI64::new(0));
        let counter = state.get::<AtomicI64>("counter").unwrap();
        counter.fetch_add(5, Ordering::Relaxed);
        assert_eq!(
            state
                .get::<AtomicI64>("counter")
                .unwrap()
                .load(Ordering::Relaxed),
            5
        );
    }

    #[test]
    fn wrong_type_yields_none() {
        let state = SharedState::new();
        state.insert("name", "hello".to_string());
        assert!(state.get::<i64>("name").is_none());
        assert_eq!(*state.get::<String>("name").unwrap(), "hello");
    }

    #[test]
    fn missing_slot_yields_none() {
        let state = SharedState::new();
        assert!(state.get::<String>("absent").is_none());
        assert!(!state.contains("absent"));
    }
}
