use async_trait::async_trait;

use crate::error::ProviderError;
use crate::message::PushMessage;

/// Largest batch the provider accepts in one call.
pub const MAX_PROVIDER_BATCH: usize = 500;

/// Client for the external push provider.
#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Send one message and return the provider's message id.
    ///
    /// With `validate_only` the provider checks the message without delivering it.
    async fn send(&self, message: &PushMessage, validate_only: bool)
    -> Result<String, ProviderError>;

    /// Send up to [`MAX_PROVIDER_BATCH`] messages.
    ///
    /// The outer error means the call as a whole failed. Otherwise the result
    /// has one entry per message, in input order.
    async fn send_each(
        &self,
        messages: &[PushMessage],
    ) -> Result<Vec<Result<String, ProviderError>>, ProviderError>;
}
