//! Error types and JSON error responses for the dev server

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Reason attached to the error raised when the backend fails to compile
pub const FATAL_COMPILE_REASON: &str = "Fatal error while compiling.";

/// Errors that end a development session (or are logged, outside strict mode)
#[derive(Debug, thiserror::Error)]
pub enum DevError {
    /// The backend bundle could not be compiled
    #[error("{0}")]
    FatalCompile(String),

    /// The backend process could not be launched
    #[error("Failed to spawn backend '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A file watcher could not be installed
    #[error("Failed to watch {path}: {source}")]
    Watch {
        path: String,
        #[source]
        source: notify::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DevError {
    pub fn is_fatal_compile(&self) -> bool {
        matches!(self, DevError::FatalCompile(_))
    }
}

/// Error codes reported by the dev server
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request to the backend failed
    ProxyFailed,
    /// Failed to read a compiled asset
    AssetUnavailable,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::ProxyFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::AssetUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyErrorCode::ProxyFailed => "PROXY_FAILED",
            ProxyErrorCode::AssetUnavailable => "ASSET_UNAVAILABLE",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    /// Error detail, passed through verbatim
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_str(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_compile_message() {
        let err = DevError::FatalCompile(FATAL_COMPILE_REASON.to_string());
        assert_eq!(err.to_string(), "Fatal error while compiling.");
        assert!(err.is_fatal_compile());
    }

    #[test]
    fn test_spawn_error_names_command() {
        let err = DevError::Spawn {
            command: "node".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.to_string().contains("'node'"));
        assert!(!err.is_fatal_compile());
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::ProxyFailed, "connection refused");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"PROXY_FAILED\""));
        assert!(json.contains("\"message\":\"connection refused\""));
        assert!(json.contains("\"status\":500"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::ProxyFailed, "boom");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }
}
