//! Firebase Cloud Messaging HTTP v1 client.
//!
//! Batches are fanned out as concurrent single sends (the v1 API has no batch
//! endpoint), with results kept in input order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use beacon_common::config::AppConfig;

use crate::error::{ProviderError, ProviderErrorCode};
use crate::message::PushMessage;
use crate::provider::PushProvider;

const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How the client obtains its OAuth bearer token.
#[derive(Clone)]
pub enum FcmAuth {
    /// Pre-issued token (emulators, tests, short-lived jobs).
    Static(String),
    /// Google application-default credentials.
    ApplicationDefault(Arc<dyn gcp_auth::TokenProvider>),
}

/// FCM v1 push provider.
pub struct FcmClient {
    http: Client,
    endpoint: String,
    project_id: String,
    auth: FcmAuth,
    concurrency: usize,
}

#[derive(Debug, Deserialize)]
struct FcmSendResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct FcmErrorResponse {
    error: FcmErrorBody,
}

#[derive(Debug, Deserialize)]
struct FcmErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    details: Vec<FcmErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct FcmErrorDetail {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
}

impl FcmClient {
    /// `timeout` bounds each provider request end to end.
    pub fn new(
        project_id: impl Into<String>,
        endpoint: impl Into<String>,
        auth: FcmAuth,
        concurrency: usize,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(CONNECT_TIMEOUT))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            auth,
            concurrency: concurrency.max(1),
        })
    }

    /// Build a client from application configuration.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let auth = match &config.fcm_access_token {
            Some(token) => FcmAuth::Static(token.clone()),
            None => FcmAuth::ApplicationDefault(gcp_auth::provider().await?),
        };

        let client = Self::new(
            config.fcm_project_id.clone(),
            config.fcm_endpoint.clone(),
            auth,
            config.fcm_send_concurrency,
            Duration::from_secs(config.fcm_timeout_secs),
        )
        .map_err(|e| anyhow::anyhow!("Failed to create FCM HTTP client: {}", e))?;

        tracing::info!(
            project_id = %config.fcm_project_id,
            timeout_secs = config.fcm_timeout_secs,
            "FCM client configured"
        );
        Ok(client)
    }

    fn send_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/messages:send",
            self.endpoint, self.project_id
        )
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        match &self.auth {
            FcmAuth::Static(token) => Ok(token.clone()),
            FcmAuth::ApplicationDefault(provider) => provider
                .token(&[FCM_SCOPE])
                .await
                .map(|token| token.as_str().to_string())
                .map_err(|e| ProviderError::new(ProviderErrorCode::Authentication, e.to_string())),
        }
    }

    async fn post_message(
        &self,
        bearer: &str,
        message: &PushMessage,
        validate_only: bool,
    ) -> Result<String, ProviderError> {
        let response = self
            .http
            .post(self.send_url())
            .bearer_auth(bearer)
            .json(&json!({ "validate_only": validate_only, "message": message }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            let body: FcmSendResponse = response.json().await.map_err(transport_error)?;
            return Ok(body.name);
        }

        let raw = response.text().await.unwrap_or_default();
        Err(parse_error_body(status, &raw))
    }
}

#[async_trait]
impl PushProvider for FcmClient {
    async fn send(
        &self,
        message: &PushMessage,
        validate_only: bool,
    ) -> Result<String, ProviderError> {
        let bearer = self.access_token().await?;
        self.post_message(&bearer, message, validate_only).await
    }

    async fn send_each(
        &self,
        messages: &[PushMessage],
    ) -> Result<Vec<Result<String, ProviderError>>, ProviderError> {
        let bearer = self.access_token().await?;

        // Boxed up front so the stream stays Send under async_trait
        let sends: Vec<_> = messages
            .iter()
            .map(|message| Box::pin(self.post_message(&bearer, message, false)))
            .collect();
        let results = futures::stream::iter(sends)
            .buffered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        Ok(results)
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    let code = if err.is_timeout() {
        ProviderErrorCode::Timeout
    } else if err.is_connect() || err.is_request() {
        ProviderErrorCode::ServerUnavailable
    } else {
        ProviderErrorCode::InternalError
    };
    ProviderError::new(code, err.to_string())
}

/// Resolve an FCM error response into a provider error.
///
/// The detail `errorCode` wins over the top-level status. `INVALID_ARGUMENT`
/// that names the registration token is treated as an invalid token.
fn parse_error_body(status: StatusCode, raw: &str) -> ProviderError {
    let Ok(parsed) = serde_json::from_str::<FcmErrorResponse>(raw) else {
        let code = match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderErrorCode::MessageRateExceeded,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderErrorCode::Authentication,
            StatusCode::SERVICE_UNAVAILABLE => ProviderErrorCode::ServerUnavailable,
            StatusCode::GATEWAY_TIMEOUT => ProviderErrorCode::Timeout,
            s if s.is_server_error() => ProviderErrorCode::InternalError,
            _ => ProviderErrorCode::Unknown,
        };
        return ProviderError::new(code, format!("HTTP {}: {}", status.as_u16(), raw));
    };

    let identifier = parsed
        .error
        .details
        .iter()
        .find_map(|d| d.error_code.clone())
        .unwrap_or_else(|| parsed.error.status.clone());

    let mut code = ProviderErrorCode::from_identifier(&identifier);
    if code == ProviderErrorCode::InvalidArgument
        && parsed
            .error
            .message
            .to_lowercase()
            .contains("registration token")
    {
        code = ProviderErrorCode::InvalidRegistrationToken;
    }

    ProviderError::new(code, parsed.error.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unregistered_detail() {
        let raw = r#"{
            "error": {
                "code": 404,
                "message": "Requested entity was not found.",
                "status": "NOT_FOUND",
                "details": [{
                    "@type": "type.googleapis.com/google.firebase.fcm.v1.FcmError",
                    "errorCode": "UNREGISTERED"
                }]
            }
        }"#;
        let err = parse_error_body(StatusCode::NOT_FOUND, raw);
        assert_eq!(err.code, ProviderErrorCode::RegistrationTokenNotRegistered);
        assert_eq!(err.message, "Requested entity was not found.");
    }

    #[test]
    fn test_parse_invalid_argument_naming_token() {
        let raw = r#"{"error": {"code": 400, "message": "The registration token is not a valid FCM registration token", "status": "INVALID_ARGUMENT"}}"#;
        let err = parse_error_body(StatusCode::BAD_REQUEST, raw);
        assert_eq!(err.code, ProviderErrorCode::InvalidRegistrationToken);
    }

    #[test]
    fn test_parse_non_json_server_error() {
        let err = parse_error_body(StatusCode::SERVICE_UNAVAILABLE, "upstream connect error");
        assert_eq!(err.code, ProviderErrorCode::ServerUnavailable);

        let err = parse_error_body(StatusCode::BAD_GATEWAY, "<html>");
        assert_eq!(err.code, ProviderErrorCode::InternalError);
    }

    #[test]
    fn test_send_url() {
        let client = FcmClient::new(
            "demo",
            "http://localhost:9099/",
            FcmAuth::Static("t".to_string()),
            4,
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(
            client.send_url(),
            "http://localhost:9099/v1/projects/demo/messages:send"
        );
    }
}
