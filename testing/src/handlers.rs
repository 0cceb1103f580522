//! Handlers with scripted behavior for consumer-loop tests.

use pharmonico_core::broker::BrokerMessage;
use pharmonico_core::handler::{Handler, HandlerContext, HandlerError, HandlerFuture};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// One invocation seen by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Correlation id from the handler context
    pub correlation_id: String,
    /// The message handled
    pub message: BrokerMessage,
}

/// Records every message it handles and succeeds.
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    topic: String,
    delay: Option<Duration>,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl RecordingHandler {
    /// Handler for `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            delay: None,
            deliveries: Arc::default(),
        }
    }

    /// Sleep for `delay` before recording each message.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Everything handled so far.
    #[must_use]
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of messages handled.
    #[must_use]
    pub fn count(&self) -> usize {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Handler for RecordingHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn handle<'a>(&'a self, ctx: &'a HandlerContext, message: &'a BrokerMessage) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.deliveries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Delivery {
                    correlation_id: ctx.correlation_id().to_string(),
                    message: message.clone(),
                });
            Ok(())
        })
    }
}

/// Fails every message with [`HandlerError::Rejected`].
#[derive(Debug, Clone)]
pub struct FailingHandler {
    topic: String,
    reason: String,
}

impl FailingHandler {
    /// Handler for `topic` failing with `reason`.
    #[must_use]
    pub fn new(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

impl Handler for FailingHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn handle<'a>(&'a self, _ctx: &'a HandlerContext, _message: &'a BrokerMessage) -> HandlerFuture<'a> {
        Box::pin(async move { Err(HandlerError::Rejected(self.reason.clone())) })
    }
}

/// Panics on every message.
#[derive(Debug, Clone)]
pub struct PanickingHandler {
    topic: String,
}

impl PanickingHandler {
    /// Handler for `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

impl Handler for PanickingHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    #[allow(clippy::panic)]
    fn handle<'a>(&'a self, _ctx: &'a HandlerContext, message: &'a BrokerMessage) -> HandlerFuture<'a> {
        Box::pin(async move {
            if message.offset >= 0 {
                panic!("handler exploded at offset {}", message.offset);
            }
            Ok(())
        })
    }
}
