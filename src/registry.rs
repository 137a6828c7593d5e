//! Naming a holder, owning it for the engine's lifetime, and safely replacing or
//! destroying it under concurrent access (spec.md §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::Lazy;

use crate::engine::{Engine, FactoryHandle};
use crate::error::{Error, Result};
use crate::holder::Holder;

/// The process-wide engine-init lock (spec.md §5): serializes engine-handle creation and
/// destruction, and registry mutations that touch the engine's catalog, across every
/// connection in the process.
static GLOBAL_INIT_LOCK: Lazy<Arc<Mutex<()>>> = Lazy::new(|| Arc::new(Mutex::new(())));

pub fn global_init_lock() -> Arc<Mutex<()>> {
    GLOBAL_INIT_LOCK.clone()
}

/// `(name, holder, factory_handle, close_flag)` from spec.md §3, plus the weak
/// back-reference to the owning connection (spec.md §9, "Weak back-references").
struct Registration {
    holder: Arc<Holder>,
    factory_handle: FactoryHandle,
    closed: AtomicBool,
    owner: Weak<()>,
}

impl Registration {
    /// Idempotent close (spec.md §8 property 9): the first call tears down the engine-side
    /// factory; later calls are no-ops. If the owning connection is already gone, the
    /// factory has already been torn down by the connection's own shutdown and this is a
    /// no-op too (spec.md §9).
    fn close(&self, engine: &dyn Engine) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.owner.strong_count() == 0 {
            return;
        }
        if let Err(e) = engine.unregister_scan(self.factory_handle) {
            log::warn!("failed to close scan registration: {e}");
        }
    }
}

/// Maps name → Registration for one connection. Mutations that touch the engine's catalog
/// go through the process-wide engine-init lock (spec.md §5); the map itself has its own
/// lock serializing registry-local bookkeeping.
pub struct HolderRegistry {
    engine: Arc<dyn Engine>,
    entries: Mutex<HashMap<String, Registration>>,
    init_lock: Arc<Mutex<()>>,
    alive: Weak<()>,
}

impl HolderRegistry {
    pub fn new(engine: Arc<dyn Engine>, init_lock: Arc<Mutex<()>>, alive: Weak<()>) -> Self {
        Self {
            engine,
            entries: Mutex::new(HashMap::new()),
            init_lock,
            alive,
        }
    }

    /// Algorithm from spec.md §4.2, "Algorithm for replace": the old and new factory
    /// handles are both live while the map swap happens, so any concurrent scan sees a
    /// consistent source; the old entry is closed only after the lock is released.
    pub fn register(&self, name: &str, holder: Arc<Holder>, replace: bool) -> Result<()> {
        let _init_guard = self.init_lock.lock().unwrap();

        let old = {
            let mut entries = self.entries.lock().unwrap();
            if entries.contains_key(name) && !replace {
                return Err(Error::name_in_use(name));
            }
            let old = entries.remove(name);

            let factory_handle = self.engine.register_scan(name, holder.clone())?;
            entries.insert(
                name.to_string(),
                Registration {
                    holder,
                    factory_handle,
                    closed: AtomicBool::new(false),
                    owner: self.alive.clone(),
                },
            );
            old
        };

        drop(_init_guard);

        if let Some(old) = old {
            old.close(self.engine.as_ref());
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let removed = self.entries.lock().unwrap().remove(name);
        if let Some(entry) = removed {
            entry.close(self.engine.as_ref());
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Holder>> {
        self.entries.lock().unwrap().get(name).map(|e| e.holder.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }

    /// Called on connection shutdown (spec.md §4.2).
    pub fn close_all(&self) {
        let drained: Vec<Registration> = self.entries.lock().unwrap().drain().map(|(_, v)| v).collect();
        for entry in drained {
            entry.close(self.engine.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reference::ReferenceEngine;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn dummy_holder() -> Arc<Holder> {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        Arc::new(Holder::ArrowTable(crate::holder::ArrowTableHolder::new(
            schema,
            vec![],
        )))
    }

    #[test]
    fn double_close_is_a_no_op() {
        let engine: Arc<dyn Engine> = Arc::new(ReferenceEngine::new());
        let alive = Arc::new(());
        let registry = HolderRegistry::new(engine, Arc::new(Mutex::new(())), Arc::downgrade(&alive));
        registry.register("t", dummy_holder(), true).unwrap();
        registry.unregister("t").unwrap();
        // unregistering again is a no-op, not an error.
        assert!(registry.unregister("t").is_ok());
    }

    #[test]
    fn replace_without_flag_fails_on_collision() {
        let engine: Arc<dyn Engine> = Arc::new(ReferenceEngine::new());
        let alive = Arc::new(());
        let registry = HolderRegistry::new(engine, Arc::new(Mutex::new(())), Arc::downgrade(&alive));
        registry.register("t", dummy_holder(), true).unwrap();
        let err = registry.register("t", dummy_holder(), false).unwrap_err();
        assert_eq!(err.status, crate::error::Status::NameInUse);
    }

    #[test]
    fn replace_swaps_visible_holder() {
        let engine: Arc<dyn Engine> = Arc::new(ReferenceEngine::new());
        let alive = Arc::new(());
        let registry = HolderRegistry::new(engine, Arc::new(Mutex::new(())), Arc::downgrade(&alive));
        registry.register("t", dummy_holder(), true).unwrap();
        let second = dummy_holder();
        registry.register("t", second.clone(), true).unwrap();
        assert!(Arc::ptr_eq(&registry.lookup("t").unwrap(), &second));
    }
}
