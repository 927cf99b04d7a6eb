//! Notifier used when no remote endpoint is configured.

use async_trait::async_trait;
use tracing::info;

use super::{Notifier, Request};
use crate::error::NotifyError;

/// Logs each request instead of delivering it.
///
/// The payload body is only logged for requests built with `log_payload`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn notifier_type(&self) -> &str {
        "log"
    }

    async fn send(&self, request: &Request) -> Result<(), NotifyError> {
        if request.log_payload {
            info!(
                route = %request.route,
                event = %request.event,
                payload = %request.payload,
                "No notifier configured, request not delivered"
            );
        } else {
            info!(
                route = %request.route,
                event = %request.event,
                "No notifier configured, request not delivered"
            );
        }
        Ok(())
    }
}
