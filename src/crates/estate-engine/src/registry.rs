//! Name-to-worker lookup with availability flags.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::worker::Worker;

struct WorkerEntry {
    worker: Arc<dyn Worker>,
    enabled: bool,
}

/// Registry populated at startup and handed to the engine.
///
/// Lookup of an unknown or disabled name yields
/// [`EngineError::WorkerNotAvailable`], which the scheduler records as a
/// non-retryable step failure.
#[derive(Default)]
pub struct WorkerRegistry {
    entries: RwLock<HashMap<String, WorkerEntry>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker under its own name, enabled. Re-registering a name
    /// replaces the previous worker.
    pub fn register(&self, worker: Arc<dyn Worker>) {
        let name = worker.name().to_string();
        tracing::debug!(worker = %name, "registering worker");
        self.entries
            .write()
            .insert(name, WorkerEntry { worker, enabled: true });
    }

    /// Flip a worker's availability. Returns false for unknown names.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.entries.write().get_mut(name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Resolve an available worker by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Worker>> {
        let entries = self.entries.read();
        match entries.get(name) {
            Some(entry) if entry.enabled => Ok(Arc::clone(&entry.worker)),
            Some(_) => Err(EngineError::WorkerNotAvailable(format!("{name} (disabled)"))),
            None => Err(EngineError::WorkerNotAvailable(name.to_string())),
        }
    }

    /// Whether a name resolves to an enabled worker.
    pub fn is_available(&self, name: &str) -> bool {
        self.entries
            .read()
            .get(name)
            .map(|e| e.enabled)
            .unwrap_or(false)
    }

    /// Names of enabled workers, highest priority first, ties by name.
    pub fn available_names(&self) -> Vec<String> {
        let entries = self.entries.read();
        let mut names: Vec<(u32, String)> = entries
            .iter()
            .filter(|(_, e)| e.enabled)
            .map(|(name, e)| (e.worker.priority(), name.clone()))
            .collect();
        names.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        names.into_iter().map(|(_, name)| name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{WorkerContext, WorkerError, WorkerInput, WorkerOutput};
    use async_trait::async_trait;
    use serde_json::json;

    struct NamedWorker {
        name: &'static str,
        priority: u32,
    }

    #[async_trait]
    impl Worker for NamedWorker {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        async fn execute(
            &self,
            _ctx: &WorkerContext,
            _input: WorkerInput,
        ) -> std::result::Result<WorkerOutput, WorkerError> {
            Ok(WorkerOutput::new(json!({}), 1.0))
        }
    }

    fn registry() -> WorkerRegistry {
        let registry = WorkerRegistry::new();
        registry.register(Arc::new(NamedWorker {
            name: "price_search",
            priority: 90,
        }));
        registry.register(Arc::new(NamedWorker {
            name: "finance",
            priority: 70,
        }));
        registry.register(Arc::new(NamedWorker {
            name: "legal",
            priority: 80,
        }));
        registry
    }

    #[test]
    fn lookup_unknown_and_disabled_yield_not_available() {
        let registry = registry();

        assert!(registry.get("price_search").is_ok());
        assert!(matches!(
            registry.get("ghost"),
            Err(EngineError::WorkerNotAvailable(_))
        ));

        assert!(registry.set_enabled("finance", false));
        assert!(matches!(
            registry.get("finance"),
            Err(EngineError::WorkerNotAvailable(_))
        ));
        assert!(!registry.is_available("finance"));
    }

    #[test]
    fn available_names_sorted_by_priority() {
        let registry = registry();
        assert_eq!(
            registry.available_names(),
            vec!["price_search", "legal", "finance"]
        );

        registry.set_enabled("legal", false);
        assert_eq!(registry.available_names(), vec!["price_search", "finance"]);
    }

    #[test]
    fn set_enabled_unknown_name_is_false() {
        let registry = registry();
        assert!(!registry.set_enabled("ghost", true));
    }
}
