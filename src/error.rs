// src/error.rs
use axum::{
    body::Bytes,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Body returned to the client for every failed proxy request.
///
/// `details` is only populated for statuses below 500 so that internal
/// upstream error bodies never leak to callers.
#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub message: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// A non-success response from the upstream provider.
///
/// Produced once at the HTTP-client boundary (`proxy::send`) and consumed by
/// pattern matching everywhere else.
#[derive(Error, Debug, Clone)]
#[error("Request failed with status code {}", status.as_u16())]
pub struct UpstreamError {
    pub status: StatusCode,
    /// Parsed `retry-after` header, in seconds.
    pub retry_after: Option<u64>,
    pub body: Bytes,
}

impl UpstreamError {
    pub fn is_rate_limited(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS
    }

    /// The upstream body as JSON when it parses, otherwise as a plain string.
    pub fn body_value(&self) -> Value {
        serde_json::from_slice(&self.body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.body).into_owned()))
    }
}

/// Represents the errors that can occur in the proxy.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration validation failed: {message}")]
    ConfigValidation {
        message: String,
        field: Option<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    YamlParsing(#[from] serde_yaml::Error),

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No available API keys for model {model}")]
    NoAvailableKeys { model: String },

    #[error("Circuit breaker is OPEN")]
    CircuitOpen,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Upstream request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn config_validation(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    /// Status of the upstream response this error carries, if any.
    pub fn upstream_status(&self) -> Option<StatusCode> {
        match self {
            Self::Upstream(upstream) => Some(upstream.status),
            _ => None,
        }
    }

    /// Status code sent to the client: the upstream status when there is one,
    /// 400 for unparseable client bodies, 500 otherwise.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Upstream(upstream) => upstream.status,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        let status = self.status_code();
        let details = match self {
            Self::Upstream(upstream) if status.as_u16() < 500 => Some(upstream.body_value()),
            _ => None,
        };
        ErrorBody {
            message: self.to_string(),
            status: status.as_u16(),
            details,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self.to_error_body())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::io;

    async fn check_response(
        error: AppError,
        expected_status: StatusCode,
        expected_message_substring: &str,
        expect_details: bool,
    ) -> Value {
        let response = error.into_response();
        assert_eq!(response.status(), expected_status, "Status code mismatch");

        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read response body");
        let body_json: Value = serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            panic!(
                "Response body is not valid JSON: {}. Body: {}",
                e,
                String::from_utf8_lossy(&bytes)
            )
        });

        assert_eq!(body_json["status"], expected_status.as_u16());
        let message = body_json["message"]
            .as_str()
            .expect("JSON 'message' field is not a string or missing");
        assert!(
            message.contains(expected_message_substring),
            "Expected message '{message}' to contain '{expected_message_substring}'"
        );
        assert_eq!(
            body_json.get("details").is_some(),
            expect_details,
            "Unexpected presence of 'details' in {body_json}"
        );
        body_json
    }

    #[tokio::test]
    async fn test_into_response_no_keys() {
        check_response(
            AppError::NoAvailableKeys {
                model: "gpt-4o".to_string(),
            },
            StatusCode::INTERNAL_SERVER_ERROR,
            "No available API keys for model gpt-4o",
            false,
        )
        .await;
    }

    #[tokio::test]
    async fn test_into_response_circuit_open() {
        check_response(
            AppError::CircuitOpen,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Circuit breaker is OPEN",
            false,
        )
        .await;
    }

    #[tokio::test]
    async fn test_into_response_upstream_client_error_includes_details() {
        let body = check_response(
            AppError::Upstream(UpstreamError {
                status: StatusCode::BAD_REQUEST,
                retry_after: None,
                body: Bytes::from_static(br#"{"error":{"message":"bad model"}}"#),
            }),
            StatusCode::BAD_REQUEST,
            "Request failed with status code 400",
            true,
        )
        .await;
        assert_eq!(body["details"]["error"]["message"], "bad model");
    }

    #[tokio::test]
    async fn test_into_response_upstream_rate_limit_keeps_status() {
        let body = check_response(
            AppError::Upstream(UpstreamError {
                status: StatusCode::TOO_MANY_REQUESTS,
                retry_after: Some(5),
                body: Bytes::from_static(b"slow down"),
            }),
            StatusCode::TOO_MANY_REQUESTS,
            "status code 429",
            true,
        )
        .await;
        assert_eq!(body["details"], "slow down");
    }

    #[tokio::test]
    async fn test_into_response_upstream_server_error_hides_details() {
        check_response(
            AppError::Upstream(UpstreamError {
                status: StatusCode::BAD_GATEWAY,
                retry_after: None,
                body: Bytes::from_static(b"internal stack trace"),
            }),
            StatusCode::BAD_GATEWAY,
            "status code 502",
            false,
        )
        .await;
    }

    #[tokio::test]
    async fn test_into_response_invalid_request() {
        check_response(
            AppError::InvalidRequest("Invalid JSON".to_string()),
            StatusCode::BAD_REQUEST,
            "Invalid JSON",
            false,
        )
        .await;
    }

    #[tokio::test]
    async fn test_into_response_io() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        check_response(
            AppError::Io(io_error),
            StatusCode::INTERNAL_SERVER_ERROR,
            "File not found",
            false,
        )
        .await;
    }

    #[test]
    fn test_upstream_status_only_for_upstream_errors() {
        let upstream = AppError::Upstream(UpstreamError {
            status: StatusCode::TOO_MANY_REQUESTS,
            retry_after: None,
            body: Bytes::new(),
        });
        assert_eq!(upstream.upstream_status(), Some(StatusCode::TOO_MANY_REQUESTS));
        assert_eq!(AppError::Timeout(Duration::from_secs(30)).upstream_status(), None);
        assert_eq!(AppError::CircuitOpen.upstream_status(), None);
    }
}
