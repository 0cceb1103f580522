//! The contract every workflow stage implements.
//!
//! A handler consumes one topic. When [`Handler::handle`] returns `Ok`, the
//! stage's state change is persisted and its successor envelope (if any) is
//! published. An `Err` sends the original message to the dead-letter topic.
//!
//! Delivery is at-least-once, so handlers must tolerate replays: re-applying
//! a stage that already ran must leave state unchanged.

use crate::broker::{BrokerError, BrokerMessage};
use crate::coordination::CoordinationError;
use crate::envelope::EnvelopeError;
use crate::prescription::StoreError;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::watch;

/// Errors a handler can report. The display text becomes the dead-letter reason.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The message is not a valid envelope or payload
    #[error("Decode failed: {0}")]
    Decode(#[from] EnvelopeError),

    /// A referenced entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity
        entity: &'static str,
        /// Its id
        id: String,
    },

    /// The document store failed
    #[error("Store failed: {0}")]
    Store(#[from] StoreError),

    /// Publishing the successor envelope failed
    #[error("Publish failed: {0}")]
    Publish(#[from] BrokerError),

    /// A coordination primitive was unavailable
    #[error("Coordination failed: {0}")]
    Coordination(#[from] CoordinationError),

    /// The stage cannot proceed with this input
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The handler panicked
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Boxed future returned by [`Handler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Per-message context supplied by the consumer loop.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    correlation_id: String,
    received_at: DateTime<Utc>,
    shutdown: watch::Receiver<bool>,
}

impl HandlerContext {
    /// Context for one message.
    #[must_use]
    pub const fn new(
        correlation_id: String,
        received_at: DateTime<Utc>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            correlation_id,
            received_at,
            shutdown,
        }
    }

    /// Context that never observes shutdown. Useful for direct invocation.
    #[must_use]
    pub fn detached(correlation_id: impl Into<String>) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(correlation_id.into(), Utc::now(), rx)
    }

    /// Correlation id extracted from the message.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// When the loop received the message.
    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Whether the worker has been asked to stop. Long-running handlers may
    /// check this between steps; the message itself is always finished.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// A workflow stage bound to one topic.
///
/// Object safe; the registry stores handlers as `Arc<dyn Handler>`.
///
/// # Example
///
/// ```
/// use pharmonico_core::broker::BrokerMessage;
/// use pharmonico_core::handler::{Handler, HandlerContext, HandlerFuture};
///
/// struct Audit;
///
/// impl Handler for Audit {
///     fn topic(&self) -> &str {
///         "shipment.delivered"
///     }
///
///     fn handle<'a>(&'a self, ctx: &'a HandlerContext, message: &'a BrokerMessage) -> HandlerFuture<'a> {
///         Box::pin(async move {
///             tracing::info!(correlation_id = %ctx.correlation_id(), offset = message.offset, "audited");
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait Handler: Send + Sync {
    /// The topic this handler consumes. Must be non-empty and constant.
    fn topic(&self) -> &str;

    /// Process one message.
    ///
    /// # Errors
    ///
    /// Any [`HandlerError`] dead-letters the message with the error text.
    fn handle<'a>(&'a self, ctx: &'a HandlerContext, message: &'a BrokerMessage) -> HandlerFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_context_is_not_shutting_down() {
        let ctx = HandlerContext::detached("c1");
        assert_eq!(ctx.correlation_id(), "c1");
        assert!(!ctx.is_shutting_down());
    }

    #[test]
    fn context_observes_shutdown() {
        let (tx, rx) = watch::channel(false);
        let ctx = HandlerContext::new("c1".to_string(), Utc::now(), rx);
        assert!(!ctx.is_shutting_down());
        let _ = tx.send(true);
        assert!(ctx.is_shutting_down());
    }

    #[test]
    fn error_text_is_the_dead_letter_reason() {
        let err = HandlerError::NotFound {
            entity: "prescription",
            id: "rx_1".to_string(),
        };
        assert_eq!(err.to_string(), "prescription not found: rx_1");
    }
}
