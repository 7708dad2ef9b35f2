//! Provider message construction.
//!
//! Messages serialize to the FCM HTTP v1 `message` object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use beacon_common::types::{NotificationType, PendingNotification, Priority};

/// A message ready to be handed to the push provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<DisplayPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,
    pub android: AndroidConfig,
    pub apns: ApnsConfig,
}

/// Title/body rendered by the device's notification tray.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayPayload {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AndroidConfig {
    pub priority: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApnsConfig {
    pub headers: BTreeMap<String, String>,
}

/// Build a provider message for one device.
///
/// - `Notification` sets only the display payload.
/// - `Data` sets only key/value data: `title`, `body` and the stringified extras.
/// - `Both` sets the display payload plus the stringified extras.
pub fn build_message(
    token: &str,
    notification_type: NotificationType,
    title: &str,
    body: &str,
    data: &serde_json::Value,
    priority: Priority,
) -> PushMessage {
    let (notification, data) = match notification_type {
        NotificationType::Notification => (Some(display(title, body)), None),
        NotificationType::Data => {
            // Extras never shadow the notification's own title and body
            let mut map = stringify_data(data);
            map.insert("title".to_string(), title.to_string());
            map.insert("body".to_string(), body.to_string());
            (None, Some(map))
        }
        NotificationType::Both => (Some(display(title, body)), Some(stringify_data(data))),
    };

    let (android_priority, apns_priority) = match priority {
        Priority::High => ("high", "10"),
        Priority::Normal => ("normal", "5"),
    };

    PushMessage {
        token: token.to_string(),
        notification,
        data,
        android: AndroidConfig {
            priority: android_priority.to_string(),
        },
        apns: ApnsConfig {
            headers: BTreeMap::from([("apns-priority".to_string(), apns_priority.to_string())]),
        },
    }
}

/// Build the provider message for a stored notification.
pub fn message_for(notification: &PendingNotification) -> PushMessage {
    build_message(
        &notification.device_token,
        notification.notification_type,
        &notification.title,
        &notification.body,
        &notification.additional_data,
        notification.priority,
    )
}

fn display(title: &str, body: &str) -> DisplayPayload {
    DisplayPayload {
        title: title.to_string(),
        body: body.to_string(),
    }
}

/// Flatten arbitrary JSON extras into the string map the provider requires.
///
/// Objects keep their keys with every value stringified. A JSON-encoded object
/// inside a string is decoded first; any other scalar lands under `data`.
pub fn stringify_data(value: &serde_json::Value) -> BTreeMap<String, String> {
    match value {
        serde_json::Value::Null => BTreeMap::new(),
        serde_json::Value::Object(obj) => obj
            .iter()
            .map(|(key, value)| (key.clone(), stringify_value(value)))
            .collect(),
        serde_json::Value::String(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(parsed @ serde_json::Value::Object(_)) => stringify_data(&parsed),
            _ => BTreeMap::from([("data".to_string(), raw.clone())]),
        },
        other => BTreeMap::from([("data".to_string(), other.to_string())]),
    }
}

fn stringify_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
