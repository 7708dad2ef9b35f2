use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Returned when a stored or submitted string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// What the provider should render on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum NotificationType {
    /// Display payload only.
    #[default]
    Notification,
    /// Key/value data only, handled by the app.
    Data,
    /// Display payload plus key/value data.
    Both,
}

/// Delivery priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Queue ordering weight. Higher weights are served first.
    pub fn weight(self) -> u32 {
        match self {
            Priority::Normal => 5,
            Priority::High => 10,
        }
    }
}

/// Lifecycle status of a row in `pending_notifications`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Processing,
    Failed,
}

/// Terminal outcome recorded in the delivery history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    Failed,
    InvalidToken,
}

/// A notification waiting for (or undergoing) delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingNotification {
    pub id: Uuid,
    pub device_token: String,
    pub title: String,
    pub body: String,
    /// JSON object; values are stringified when the provider message is built.
    pub additional_data: serde_json::Value,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
    pub status: PendingStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable, append-only record of a terminal delivery outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub original_id: Option<Uuid>,
    pub device_token: String,
    pub title: String,
    pub body: String,
    pub additional_data: serde_json::Value,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub outcome: DeliveryOutcome,
    pub attempts: i32,
    /// `{"id": "<provider message id>"}` for sent notifications.
    pub provider_response: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// A device token the provider reported as invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvalidTokenRecord {
    pub device_token: String,
    pub reason: Option<String>,
    pub marked_at: DateTime<Utc>,
}

/// A notification as submitted by a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewNotification {
    pub device_token: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub additional_data: Option<serde_json::Value>,
    #[serde(default)]
    pub notification_type: NotificationType,
    #[serde(default)]
    pub priority: Priority,
    /// Future-dated sends are held until the scheduler sweep promotes them.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::Notification => write!(f, "notification"),
            NotificationType::Data => write!(f, "data"),
            NotificationType::Both => write!(f, "both"),
        }
    }
}

impl FromStr for NotificationType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notification" => Ok(NotificationType::Notification),
            "data" => Ok(NotificationType::Data),
            "both" => Ok(NotificationType::Both),
            other => Err(UnknownVariant {
                kind: "notification type",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

impl FromStr for Priority {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(UnknownVariant {
                kind: "priority",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingStatus::Pending => write!(f, "pending"),
            PendingStatus::Processing => write!(f, "processing"),
            PendingStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryOutcome::Sent => write!(f, "sent"),
            DeliveryOutcome::Failed => write!(f, "failed"),
            DeliveryOutcome::InvalidToken => write!(f, "invalid_token"),
        }
    }
}
