use beacon_common::error::AppError;
use thiserror::Error;

/// Provider error identifiers, resolved from the provider's wire codes.
///
/// Both the legacy `messaging/*` identifiers and the FCM HTTP v1 status codes
/// map onto the same variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorCode {
    InvalidRegistrationToken,
    RegistrationTokenNotRegistered,
    InternalError,
    ServerUnavailable,
    Timeout,
    InvalidArgument,
    MessageRateExceeded,
    SenderIdMismatch,
    ThirdPartyAuthError,
    Authentication,
    Unknown,
}

/// How the dispatcher must treat a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The device token is dead. Record it and never retry.
    TokenInvalid,
    /// Transient provider trouble. Retry within the queue's attempt cap.
    Retryable,
    /// Anything else. Terminal without retry.
    Permanent,
}

impl ProviderErrorCode {
    pub fn from_identifier(identifier: &str) -> Self {
        match identifier {
            "messaging/invalid-registration-token" => Self::InvalidRegistrationToken,
            "messaging/registration-token-not-registered" | "UNREGISTERED" => {
                Self::RegistrationTokenNotRegistered
            }
            "messaging/internal-error" | "INTERNAL" => Self::InternalError,
            "messaging/server-unavailable" | "UNAVAILABLE" => Self::ServerUnavailable,
            "messaging/timeout" | "DEADLINE_EXCEEDED" => Self::Timeout,
            "messaging/invalid-argument" | "INVALID_ARGUMENT" => Self::InvalidArgument,
            "messaging/message-rate-exceeded" | "QUOTA_EXCEEDED" => Self::MessageRateExceeded,
            "messaging/mismatched-credential" | "SENDER_ID_MISMATCH" => Self::SenderIdMismatch,
            "messaging/third-party-auth-error" | "THIRD_PARTY_AUTH_ERROR" => {
                Self::ThirdPartyAuthError
            }
            "messaging/authentication-error" | "UNAUTHENTICATED" | "PERMISSION_DENIED" => {
                Self::Authentication
            }
            _ => Self::Unknown,
        }
    }

    /// Canonical identifier, stored as `last_error` prefix and logged.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRegistrationToken => "messaging/invalid-registration-token",
            Self::RegistrationTokenNotRegistered => "messaging/registration-token-not-registered",
            Self::InternalError => "messaging/internal-error",
            Self::ServerUnavailable => "messaging/server-unavailable",
            Self::Timeout => "messaging/timeout",
            Self::InvalidArgument => "messaging/invalid-argument",
            Self::MessageRateExceeded => "messaging/message-rate-exceeded",
            Self::SenderIdMismatch => "messaging/mismatched-credential",
            Self::ThirdPartyAuthError => "messaging/third-party-auth-error",
            Self::Authentication => "messaging/authentication-error",
            Self::Unknown => "messaging/unknown-error",
        }
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::InvalidRegistrationToken | Self::RegistrationTokenNotRegistered => {
                ErrorClass::TokenInvalid
            }
            Self::InternalError | Self::ServerUnavailable | Self::Timeout => ErrorClass::Retryable,
            Self::InvalidArgument
            | Self::MessageRateExceeded
            | Self::SenderIdMismatch
            | Self::ThirdPartyAuthError
            | Self::Authentication
            | Self::Unknown => ErrorClass::Permanent,
        }
    }
}

impl std::fmt::Display for ProviderErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by the push provider for one message (or one call).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: ProviderErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.code.classify()
    }
}

/// Errors raised by the gateway itself rather than per message.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The batch call as a whole failed; no item has a known outcome.
    #[error("batch send failed: {0}")]
    BatchFailed(ProviderError),

    #[error("provider returned {actual} results for {expected} messages")]
    ResultCountMismatch { expected: usize, actual: usize },
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError::Provider(err.to_string())
    }
}
