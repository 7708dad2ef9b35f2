use std::sync::Arc;

use beacon_common::types::{NotificationType, PendingNotification, Priority};

use crate::error::{ErrorClass, GatewayError, ProviderError, ProviderErrorCode};
use crate::message::{PushMessage, build_message, message_for};
use crate::provider::{MAX_PROVIDER_BATCH, PushProvider};

/// Result of delivering one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { provider_id: String },
    Rejected { error: ProviderError, class: ErrorClass },
}

impl SendOutcome {
    fn from_result(result: Result<String, ProviderError>) -> Self {
        match result {
            Ok(provider_id) => SendOutcome::Delivered { provider_id },
            Err(error) => {
                let class = error.class();
                SendOutcome::Rejected { error, class }
            }
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered { .. })
    }
}

/// Per-item outcomes of a batch send, in input order.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub results: Vec<SendOutcome>,
    pub success_count: usize,
    pub failure_count: usize,
}

/// Token validation verdict from a provider dry run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenValidation {
    pub valid: bool,
    pub error: Option<ProviderError>,
}

/// Delivery gateway over a [`PushProvider`].
#[derive(Clone)]
pub struct DeliveryGateway {
    provider: Arc<dyn PushProvider>,
    chunk_size: usize,
}

impl DeliveryGateway {
    pub fn new(provider: Arc<dyn PushProvider>) -> Self {
        Self {
            provider,
            chunk_size: MAX_PROVIDER_BATCH,
        }
    }

    /// Deliver a single notification.
    pub async fn send(&self, notification: &PendingNotification) -> SendOutcome {
        if notification.device_token.trim().is_empty() {
            return SendOutcome::from_result(Err(ProviderError::new(
                ProviderErrorCode::InvalidArgument,
                "device token is empty",
            )));
        }

        let message = message_for(notification);
        let outcome = SendOutcome::from_result(self.provider.send(&message, false).await);

        match &outcome {
            SendOutcome::Delivered { provider_id } => tracing::debug!(
                notification_id = %notification.id,
                provider_id = %provider_id,
                "Notification delivered"
            ),
            SendOutcome::Rejected { error, class } => tracing::warn!(
                notification_id = %notification.id,
                code = %error.code,
                class = ?class,
                error = %error.message,
                "Provider rejected notification"
            ),
        }

        outcome
    }

    /// Deliver many notifications, chunked to the provider's batch limit.
    ///
    /// Returns exactly one outcome per input item, in input order. If any
    /// provider call fails as a whole the entire batch is reported as failed.
    pub async fn send_batch(
        &self,
        notifications: &[PendingNotification],
    ) -> Result<BatchReport, GatewayError> {
        let messages: Vec<PushMessage> = notifications.iter().map(message_for).collect();
        let mut results = Vec::with_capacity(messages.len());

        for chunk in messages.chunks(self.chunk_size) {
            let responses = self
                .provider
                .send_each(chunk)
                .await
                .map_err(GatewayError::BatchFailed)?;

            if responses.len() != chunk.len() {
                return Err(GatewayError::ResultCountMismatch {
                    expected: chunk.len(),
                    actual: responses.len(),
                });
            }

            results.extend(responses.into_iter().map(SendOutcome::from_result));
        }

        let success_count = results.iter().filter(|r| r.is_delivered()).count();
        let failure_count = results.len() - success_count;

        tracing::info!(success_count, failure_count, "Batch sent");

        Ok(BatchReport {
            results,
            success_count,
            failure_count,
        })
    }

    /// Ask the provider to validate a token without delivering anything.
    pub async fn validate_token(&self, device_token: &str) -> TokenValidation {
        let message = build_message(
            device_token,
            NotificationType::Data,
            "validation",
            "validation",
            &serde_json::Value::Null,
            Priority::Normal,
        );

        match self.provider.send(&message, true).await {
            Ok(_) => TokenValidation {
                valid: true,
                error: None,
            },
            Err(error) => TokenValidation {
                valid: error.class() != ErrorClass::TokenInvalid,
                error: Some(error),
            },
        }
    }

    /// Classify a provider error identifier.
    pub fn classify_error(identifier: &str) -> ErrorClass {
        ProviderErrorCode::from_identifier(identifier).classify()
    }
}
