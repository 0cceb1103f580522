//! Topic → handler dispatch table.
//!
//! The registry is built at startup and shared with the consumer loop behind
//! an `Arc`. Reads take a shared lock; registration takes the exclusive lock.
//! At most one handler is registered per topic: registering a second one
//! replaces the first, and the replacement is reported (return value, warning
//! log, and [`HandlerRegistry::replacement_count`]).

use crate::handler::Handler;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Errors from registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The handler cannot be registered
    #[error("Invalid handler: {0}")]
    InvalidHandler(String),
}

/// Thread-safe map from topic name to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    replacements: AtomicU64,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its topic.
    ///
    /// Returns the handler it replaced, if any.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidHandler`] if the handler's topic is empty.
    pub fn register(
        &self,
        handler: Arc<dyn Handler>,
    ) -> Result<Option<Arc<dyn Handler>>, RegistryError> {
        let topic = handler.topic().to_string();
        if topic.trim().is_empty() {
            return Err(RegistryError::InvalidHandler(
                "handler topic must not be empty".to_string(),
            ));
        }

        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.clone(), handler);

        if previous.is_some() {
            self.replacements.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(topic = %topic, "Replaced existing handler");
        } else {
            tracing::info!(topic = %topic, "Registered handler");
        }

        Ok(previous)
    }

    /// Handler for `topic`, if one is registered.
    #[must_use]
    pub fn get_handler(&self, topic: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    /// Whether a handler is registered for `topic`.
    #[must_use]
    pub fn has_handler(&self, topic: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }

    /// Registered topics in lexicographic order.
    #[must_use]
    pub fn list_topics(&self) -> BTreeSet<String> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many registrations replaced an existing handler.
    #[must_use]
    pub fn replacement_count(&self) -> u64 {
        self.replacements.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("topics", &self.list_topics())
            .field("replacements", &self.replacement_count())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broker::BrokerMessage;
    use crate::handler::{HandlerContext, HandlerFuture};

    struct Named {
        topic: &'static str,
    }

    impl Handler for Named {
        fn topic(&self) -> &str {
            self.topic
        }

        fn handle<'a>(&'a self, _ctx: &'a HandlerContext, _message: &'a BrokerMessage) -> HandlerFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    fn named(topic: &'static str) -> Arc<dyn Handler> {
        Arc::new(Named { topic })
    }

    #[test]
    fn register_and_lookup() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(named("intake.received")).unwrap();
        registry.register(named("validation.completed")).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.has_handler("intake.received"));
        assert!(registry.get_handler("payment.completed").is_none());
        assert_eq!(
            registry.list_topics().into_iter().collect::<Vec<_>>(),
            vec!["intake.received".to_string(), "validation.completed".to_string()]
        );
    }

    #[test]
    fn empty_topic_is_rejected() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.register(named("")),
            Err(RegistryError::InvalidHandler(_))
        ));
        assert!(matches!(
            registry.register(named("  ")),
            Err(RegistryError::InvalidHandler(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn last_registration_wins() {
        let registry = HandlerRegistry::new();
        let first = named("intake.received");
        let second = named("intake.received");

        assert!(registry.register(Arc::clone(&first)).unwrap().is_none());
        let replaced = registry.register(Arc::clone(&second)).unwrap().unwrap();

        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(
            &registry.get_handler("intake.received").unwrap(),
            &second
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.replacement_count(), 1);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let registry = Arc::new(HandlerRegistry::new());
        let topics = ["intake.received", "validation.completed", "enrollment.completed"];

        std::thread::scope(|scope| {
            for topic in topics {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    for _ in 0..50 {
                        registry.register(named(topic)).unwrap();
                        assert!(registry.get_handler(topic).is_some());
                    }
                });
            }
        });

        assert_eq!(registry.len(), topics.len());
        assert_eq!(registry.replacement_count(), 49 * 3);
    }
}
