//! Outbound webhook delivery over HTTP.
//!
//! [`WebhookDispatcher`] is the production [`Notifier`]: one `POST` of a
//! plain-text body to the configured URL, bounded by the configured timeout,
//! never retried.

use async_trait::async_trait;
use reqwest::{header, Client};
use tracing::debug;

use crate::application::notifier::{DispatchError, Notifier};
use crate::domain::WebhookConfig;

pub struct WebhookDispatcher {
    client: Client,
    config: WebhookConfig,
}

impl std::fmt::Debug for WebhookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookDispatcher")
            .field("enabled", &self.config.is_enabled())
            .field("timeout", &self.config.timeout)
            .finish()
    }
}

impl WebhookDispatcher {
    /// Builds the HTTP client.  Succeeds even when no URL is configured.
    ///
    /// # Errors
    ///
    /// Fails only if the TLS backend cannot be initialised.
    pub fn new(config: WebhookConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("bus-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Notifier for WebhookDispatcher {
    async fn send(&self, text: &str) -> Result<(), DispatchError> {
        let url = self
            .config
            .url
            .as_deref()
            .ok_or(DispatchError::FeatureDisabled)?;

        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(text.to_owned())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        debug!(%status, "webhook responded");
        if status.is_success() {
            Ok(())
        } else {
            Err(DispatchError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

fn classify(err: reqwest::Error) -> DispatchError {
    if err.is_timeout() {
        DispatchError::Timeout
    } else {
        DispatchError::Transport(err.to_string())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use tokio::net::TcpListener;

    use super::*;

    type Captured = Arc<Mutex<Vec<String>>>;

    /// Serves `app` on an ephemeral loopback port and returns its URL.
    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    fn dispatcher(url: Option<String>, timeout: Duration) -> WebhookDispatcher {
        WebhookDispatcher::new(WebhookConfig { url, timeout }).unwrap()
    }

    #[tokio::test]
    async fn test_no_url_is_feature_disabled() {
        // Arrange
        let d = dispatcher(None, Duration::from_secs(1));

        // Act
        let result = d.send("hello").await;

        // Assert
        assert_eq!(result, Err(DispatchError::FeatureDisabled));
    }

    #[tokio::test]
    async fn test_posts_plain_text_body() {
        // Arrange
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route(
                "/hook",
                post(|State(c): State<Captured>, body: String| async move {
                    c.lock().unwrap().push(body);
                    StatusCode::NO_CONTENT
                }),
            )
            .with_state(Arc::clone(&captured));
        let d = dispatcher(Some(serve(app).await), Duration::from_secs(5));

        // Act
        let result = d.send("boss spotted at 120,44").await;

        // Assert
        assert_eq!(result, Ok(()));
        assert_eq!(*captured.lock().unwrap(), vec!["boss spotted at 120,44".to_string()]);
    }

    #[tokio::test]
    async fn test_non_2xx_is_rejected_with_status() {
        let app = Router::new().route("/hook", post(|| async { StatusCode::TOO_MANY_REQUESTS }));
        let d = dispatcher(Some(serve(app).await), Duration::from_secs(5));

        let result = d.send("x").await;

        assert_eq!(result, Err(DispatchError::Rejected { status: 429 }));
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let app = Router::new().route(
            "/hook",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK
            }),
        );
        let d = dispatcher(Some(serve(app).await), Duration::from_millis(100));

        let result = d.send("x").await;

        assert_eq!(result, Err(DispatchError::Timeout));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        // Arrange: grab a free port, then close it again
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let d = dispatcher(Some(format!("http://{addr}/hook")), Duration::from_secs(2));

        // Act
        let result = d.send("x").await;

        // Assert
        assert!(matches!(result, Err(DispatchError::Transport(_))), "got {result:?}");
    }
}
