//! Notifier trait definition.

use async_trait::async_trait;

use super::Request;
use crate::error::NotifyError;

/// Delivery backend for queued requests.
///
/// Implementations must be `Send + Sync` to work across async tasks.
/// Each notifier manages its own retry/backoff logic internally.
///
/// # Example
///
/// ```ignore
/// use trigwatch::notify::{Notifier, Request};
///
/// struct Stdout;
///
/// #[async_trait]
/// impl Notifier for Stdout {
///     fn notifier_type(&self) -> &str { "stdout" }
///     async fn send(&self, request: &Request) -> Result<(), NotifyError> {
///         println!("{}", request.payload);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Type of the notifier (e.g., "webhook", "log").
    fn notifier_type(&self) -> &str;

    /// Deliver a request.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Request delivered
    /// * `Err(NotifyError)` - Failed after all retries
    async fn send(&self, request: &Request) -> Result<(), NotifyError>;
}

impl std::fmt::Debug for dyn Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("type", &self.notifier_type())
            .finish()
    }
}
