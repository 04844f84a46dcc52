//! Domain specialist workers for the estate workflow engine.
//!
//! Concrete [`Worker`](estate_engine::Worker) implementations for the
//! real-estate assistant: price search, financing, location analysis and
//! legal review. All of them are deterministic; an LLM-backed variant can
//! wrap any of them without changing the registry contract.

pub mod finance;
pub mod legal;
pub mod location;
pub mod price_search;

pub use finance::FinanceWorker;
pub use legal::LegalWorker;
pub use location::LocationWorker;
pub use price_search::PriceSearchWorker;

use estate_engine::WorkerRegistry;
use std::sync::Arc;

/// A registry with every built-in specialist registered and enabled.
pub fn builtin_registry() -> WorkerRegistry {
    let registry = WorkerRegistry::new();
    registry.register(Arc::new(PriceSearchWorker::new()));
    registry.register(Arc::new(FinanceWorker::new()));
    registry.register(Arc::new(LocationWorker::new()));
    registry.register(Arc::new(LegalWorker::new()));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_orders_by_priority() {
        let registry = builtin_registry();
        assert_eq!(
            registry.available_names(),
            vec!["price_search", "legal", "finance", "location"]
        );
    }
}
