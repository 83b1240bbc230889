use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::events::{EventEnvelope, EventKind, EventSink};

// --- Constants ---
const SIGNATURE_HEADER_NAME: &str = "x-signature-sha256";
const TIMESTAMP_HEADER_NAME: &str = "x-request-timestamp";
const BODY_PREVIEW_LIMIT: usize = 512;

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(
    rename_all = "SCREAMING_SNAKE_CASE",
    tag = "errorCode",
    content = "message"
)]
pub enum WebhookError {
    #[error("Network error during webhook dispatch: {0}")]
    Network(String),

    #[error("Failed to construct webhook request: {0}")]
    RequestConstruction(String),

    #[error("HMAC signature generation failed: {0}")]
    HmacGeneration(String),

    #[error("HTTP error from endpoint: status {status}, body: {body_preview}")]
    Http { status: u16, body_preview: String },
}

/// Signs `timestamp.body` with HMAC-SHA256, hex encoded.
pub fn sign_payload(secret: &str, timestamp: &str, body: &str) -> Result<String, WebhookError> {
    if secret.is_empty() {
        return Err(WebhookError::HmacGeneration(
            "HMAC secret cannot be empty".to_string(),
        ));
    }

    type HmacSha256 = Hmac<sha2::Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::HmacGeneration(format!("Failed to initialize HMAC: {e}")))?;

    mac.update(format!("{timestamp}.{body}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Fires each event once at a single endpoint. Failures are logged, never retried.
#[derive(Clone)]
pub struct WebhookEventSink {
    http_client: reqwest::Client,
    url: String,
    hmac_secret: Option<String>,
}

impl WebhookEventSink {
    pub fn new(url: String, hmac_secret: Option<String>, timeout: Duration) -> Result<Self, WebhookError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WebhookError::RequestConstruction(e.to_string()))?;

        Ok(Self {
            http_client,
            url,
            hmac_secret,
        })
    }

    fn headers(&self, body: &str) -> Result<HeaderMap, WebhookError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );

        if let Some(secret) = &self.hmac_secret {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| {
                    WebhookError::RequestConstruction(format!(
                        "Failed to get system time for timestamp: {e}"
                    ))
                })?
                .as_secs()
                .to_string();

            let signature = sign_payload(secret, &timestamp, body)?;

            let signature_value = HeaderValue::from_str(&signature).map_err(|e| {
                WebhookError::RequestConstruction(format!(
                    "Invalid header value for '{SIGNATURE_HEADER_NAME}': {e}"
                ))
            })?;
            let timestamp_value = HeaderValue::from_str(&timestamp).map_err(|e| {
                WebhookError::RequestConstruction(format!(
                    "Invalid header value for '{TIMESTAMP_HEADER_NAME}': {e}"
                ))
            })?;

            headers.insert(HeaderName::from_static(SIGNATURE_HEADER_NAME), signature_value);
            headers.insert(HeaderName::from_static(TIMESTAMP_HEADER_NAME), timestamp_value);
        }

        Ok(headers)
    }

    pub async fn deliver(&self, payload: &EventEnvelope) -> Result<u16, WebhookError> {
        let body = serde_json::to_string(payload)
            .map_err(|e| WebhookError::RequestConstruction(e.to_string()))?;
        let headers = self.headers(&body)?;

        let response = self
            .http_client
            .post(&self.url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| WebhookError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let body_preview = response
            .text()
            .await
            .map(|mut text| {
                if text.len() > BODY_PREVIEW_LIMIT {
                    let mut end = BODY_PREVIEW_LIMIT;
                    while !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    text.truncate(end);
                    text.push_str("...");
                }
                text
            })
            .unwrap_or_else(|_| "No body or failed to read body".to_string());

        Err(WebhookError::Http {
            status: status.as_u16(),
            body_preview,
        })
    }
}

impl EventSink for WebhookEventSink {
    async fn notify(&self, kind: EventKind, payload: EventEnvelope) {
        let sink = self.clone();
        // delivery runs off the worker's path
        tokio::spawn(async move {
            match sink.deliver(&payload).await {
                Ok(status) => tracing::debug!(
                    event_id = payload.event_id,
                    kind = %kind,
                    status = status,
                    "Webhook delivered"
                ),
                Err(e) => tracing::warn!(
                    event_id = payload.event_id,
                    kind = %kind,
                    url = sink.url,
                    error = %e,
                    "Webhook delivery failed"
                ),
            }
        });
    }
}
