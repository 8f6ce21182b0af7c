//! Outbound notification seam.
//!
//! The router only knows that a [`Notifier`] can deliver a line of text.
//! The production implementation is
//! [`crate::infrastructure::webhook::WebhookDispatcher`]; tests use the
//! generated `MockNotifier`.

use async_trait::async_trait;
use thiserror::Error;

/// Failure of a single outbound notification.  Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No webhook URL is configured.  No network call was made.
    #[error("webhook delivery is not configured")]
    FeatureDisabled,

    #[error("webhook call timed out")]
    Timeout,

    /// The endpoint answered with a non-2xx status.
    #[error("webhook rejected the payload with HTTP {status}")]
    Rejected { status: u16 },

    /// Connection, TLS, or protocol failure.
    #[error("webhook transport error: {0}")]
    Transport(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers `text` once.
    async fn send(&self, text: &str) -> Result<(), DispatchError>;
}
