//! HTTP notifier posting JSON requests to the remote endpoint.
//!
//! Each request is POSTed to `<url>/<route>` with an optional `X-API-Key`
//! header.
//!
//! # Retry Policy
//!
//! - **5xx errors**: Retry (server temporarily unavailable)
//! - **Network errors**: Retry (timeout, connection refused)
//! - **4xx errors**: Do NOT retry (client error, invalid request)

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tracing::Instrument;

use super::{Notifier, Request, Route, backoff_delay};
use crate::config::{NotifierConfig, SecretString, resolve_env_vars};
use crate::error::{ConfigError, NotifyError};
use crate::event::EventType;

/// Backoff base delay for webhook retries.
const WEBHOOK_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Maximum backoff delay for webhook retries.
const WEBHOOK_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Maximum number of attempts per request.
const WEBHOOK_MAX_RETRIES: u32 = 3;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// JSON body sent for every request.
#[derive(Debug, Clone, Serialize)]
pub struct WirePayload<'a> {
    pub route: Route,
    pub event: EventType,
    /// RFC 3339 time the request was sent.
    pub timestamp: String,
    pub payload: &'a serde_json::Value,
}

impl<'a> WirePayload<'a> {
    pub fn from_request(request: &'a Request) -> Self {
        Self {
            route: request.route,
            event: request.event,
            timestamp: Utc::now().to_rfc3339(),
            payload: &request.payload,
        }
    }
}

/// Notifier delivering requests over HTTP.
pub struct WebhookNotifier {
    /// HTTP client (connection pooling, request timeout).
    client: reqwest::Client,
    /// Base URL; the route is appended per request.
    base_url: SecretString,
    /// Headers included in every request (secrets resolved).
    headers: HeaderMap,
}

impl WebhookNotifier {
    /// Build a notifier from configuration, resolving `${VAR}` references.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if an environment variable is
    /// missing, the URL is invalid, or the API key is not a valid header value.
    pub fn from_config(config: &NotifierConfig) -> Result<Self, ConfigError> {
        let url = resolve_env_vars(&config.url)
            .map_err(|e| ConfigError::ValidationError(format!("notifier.url: {}", e)))?;
        reqwest::Url::parse(&url).map_err(|e| {
            ConfigError::ValidationError(format!("notifier.url: invalid URL: {}", e))
        })?;

        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            let resolved = api_key
                .resolve()
                .map_err(|e| ConfigError::ValidationError(format!("notifier.api_key: {}", e)))?;
            let mut value = HeaderValue::from_str(resolved.expose()).map_err(|_| {
                ConfigError::ValidationError("notifier.api_key: invalid header value".to_string())
            })?;
            value.set_sensitive(true);
            headers.insert(HeaderName::from_static(API_KEY_HEADER), value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::ValidationError(format!("notifier: {}", e)))?;

        Ok(Self {
            client,
            base_url: SecretString::new(url.trim_end_matches('/').to_string()),
            headers,
        })
    }

    fn endpoint(&self, route: Route) -> String {
        format!("{}/{}", self.base_url.expose(), route)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn notifier_type(&self) -> &str {
        "webhook"
    }

    async fn send(&self, request: &Request) -> Result<(), NotifyError> {
        let span = tracing::info_span!(
            "send_webhook",
            route = %request.route,
            event = %request.event
        );

        async {
            let body = serde_json::to_string(&WirePayload::from_request(request)).map_err(|e| {
                NotifyError::SendFailed(format!("JSON serialization error: {}", e))
            })?;
            tracing::trace!(body_len = body.len(), "Request body built");

            let route = request.route.as_str();
            let endpoint = self.endpoint(request.route);

            for attempt in 0..WEBHOOK_MAX_RETRIES {
                match self
                    .client
                    .post(&endpoint)
                    .headers(self.headers.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone())
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => {
                        tracing::debug!("Request delivered");
                        metrics::counter!("trigwatch_notify_sent_total", "route" => route)
                            .increment(1);
                        return Ok(());
                    }
                    Ok(response) if response.status().is_client_error() => {
                        let status = response.status();
                        tracing::error!(
                            status = %status,
                            "Notifier returned client error, not retrying"
                        );
                        metrics::counter!("trigwatch_notify_errors_total", "route" => route)
                            .increment(1);
                        metrics::counter!("trigwatch_notify_failed_total", "route" => route)
                            .increment(1);
                        return Err(NotifyError::SendFailed(format!("client error: {}", status)));
                    }
                    Ok(response) => {
                        tracing::warn!(
                            attempt = attempt,
                            status = %response.status(),
                            "Notifier returned server error, retrying"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            attempt = attempt,
                            error = %e.without_url(),
                            "Failed to reach notifier, retrying"
                        );
                    }
                }

                if attempt < WEBHOOK_MAX_RETRIES - 1 {
                    let delay = backoff_delay(attempt, WEBHOOK_BACKOFF_BASE, WEBHOOK_BACKOFF_MAX);
                    tracing::debug!(delay_ms = delay.as_millis(), "Waiting before retry");
                    tokio::time::sleep(delay).await;
                }
            }

            tracing::error!(
                max_retries = WEBHOOK_MAX_RETRIES,
                "Failed to deliver request after all retries"
            );
            metrics::counter!("trigwatch_notify_errors_total", "route" => route).increment(1);
            metrics::counter!("trigwatch_notify_failed_total", "route" => route).increment(1);
            Err(NotifyError::MaxRetriesExceeded)
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose URL or API key in debug output.
        f.debug_struct("WebhookNotifier")
            .field("base_url", &self.base_url)
            .field("has_api_key", &self.headers.contains_key(API_KEY_HEADER))
            .finish()
    }
}
