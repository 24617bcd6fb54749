//! Factory registry mapping implementation identifiers to constructors.
//!
//! Definitions are resolved by [`CollectorDefinition::implementation_id`]:
//! the `collectorclass` key when present, otherwise the collector name.
//!
//! [`CollectorDefinition::implementation_id`]: crate::config::CollectorDefinition::implementation_id

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::collector::agent::AgentCollector;
use crate::collector::exec::ExecCollector;
use crate::collector::tcp::TcpCollector;
use crate::collector::{Collector, CollectorContext, CollectorError};

/// Constructor for one collector implementation.
pub type CollectorFactory =
    Arc<dyn Fn(CollectorContext) -> Result<Box<dyn Collector>, CollectorError> + Send + Sync>;

/// Registry of collector constructors.
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    factories: BTreeMap<String, CollectorFactory>,
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

impl CollectorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in collectors (`tcp`, `exec`, `agent`).
    pub fn with_builtins() -> Self {
        Self::new()
            .register("tcp", TcpCollector::from_context)
            .register("exec", ExecCollector::from_context)
            .register("agent", AgentCollector::from_context)
    }

    /// Register a constructor under `id`, replacing any previous one.
    #[must_use]
    pub fn register<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(CollectorContext) -> Result<Box<dyn Collector>, CollectorError>
            + Send
            + Sync
            + 'static,
    {
        let id = id.into().to_lowercase().replace('-', "_");
        self.factories.insert(id, Arc::new(factory));
        self
    }

    /// Resolve and construct the implementation for a context's definition.
    pub fn instantiate(&self, ctx: CollectorContext) -> Result<Box<dyn Collector>, CollectorError> {
        let id = ctx.definition.implementation_id();
        let factory = self
            .factories
            .get(&id)
            .ok_or(CollectorError::UnknownImplementation(id))?;
        factory(ctx)
    }

    /// Returns true if `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Registered identifiers in sorted order.
    pub fn ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectorDefinition;
    use crate::queue::DeliveryQueue;

    struct Noop(String);

    #[async_trait::async_trait]
    impl Collector for Noop {
        fn name(&self) -> &str {
            &self.0
        }

        async fn collect(&mut self) -> Result<(), CollectorError> {
            Ok(())
        }
    }

    fn noop(ctx: CollectorContext) -> Result<Box<dyn Collector>, CollectorError> {
        Ok(Box::new(Noop(ctx.name().to_string())))
    }

    fn ctx(def: CollectorDefinition) -> CollectorContext {
        let (sink, _rx) = DeliveryQueue::bounded(8);
        CollectorContext::new(def, sink)
    }

    #[test]
    fn test_builtins_registered() {
        let registry = CollectorRegistry::with_builtins();
        assert_eq!(registry.ids(), vec!["agent", "exec", "tcp"]);
    }

    #[test]
    fn test_resolve_by_name_and_class() {
        let registry = CollectorRegistry::new().register("demo-stub", noop);
        assert!(registry.contains("demo_stub"));

        let by_name = registry
            .instantiate(ctx(CollectorDefinition::new("demo_stub")))
            .unwrap();
        assert_eq!(by_name.name(), "demo_stub");

        let by_class = registry
            .instantiate(ctx(CollectorDefinition::new("redis").with_class("DEMO-STUB")))
            .unwrap();
        assert_eq!(by_class.name(), "redis");
    }

    #[test]
    fn test_unknown_implementation() {
        let registry = CollectorRegistry::new();
        let err = registry
            .instantiate(ctx(CollectorDefinition::new("mystery")))
            .err()
            .unwrap();
        assert!(matches!(err, CollectorError::UnknownImplementation(id) if id == "mystery"));
    }
}
