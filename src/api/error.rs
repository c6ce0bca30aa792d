use reqwest::StatusCode;
use thiserror::Error;

use crate::util::is_local_endpoint_url;

/// Failure talking to the chat service.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("cannot reach local chat endpoint '{url}': {source}. Start your local server or update ADCHAT_API_URL.")]
    LocalUnreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("cannot reach chat endpoint '{url}': {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to '{url}' timed out: {source}")]
    Timeout {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-success status. `message` is the server's `error` field when it sent one.
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    #[error("unexpected response body from '{url}': {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to '{url}' failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn from_status(status: StatusCode, server_message: Option<String>) -> Self {
        let message = server_message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("API error {}", status.as_u16()));
        Self::Status { status, message }
    }
}

pub(crate) fn map_request_error(error: reqwest::Error, request_url: &str) -> ApiError {
    let url = request_url.to_string();
    if error.is_connect() && is_local_endpoint_url(request_url) {
        return ApiError::LocalUnreachable { url, source: error };
    }
    if error.is_connect() {
        return ApiError::Unreachable { url, source: error };
    }
    if error.is_timeout() {
        return ApiError::Timeout { url, source: error };
    }
    if error.is_decode() {
        return ApiError::Decode { url, source: error };
    }
    ApiError::Request { url, source: error }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_prefers_server_message() {
        let err = ApiError::from_status(StatusCode::FORBIDDEN, Some("Forbidden".to_string()));
        assert_eq!(err.to_string(), "Forbidden");
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_status_error_falls_back_to_code() {
        let err = ApiError::from_status(StatusCode::BAD_GATEWAY, Some("   ".to_string()));
        assert_eq!(err.to_string(), "API error 502");
        let err = ApiError::from_status(StatusCode::NOT_FOUND, None);
        assert_eq!(err.to_string(), "API error 404");
    }
}
