//! Lifecycle errors and JSON error responses for the admin API

use crate::api::ApiError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::fmt;

/// Kind of remote resource a lookup was searching for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Droplet,
    Snapshot,
    SshKey,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Droplet => "droplet",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::SshKey => "ssh key",
        })
    }
}

/// Errors from spinning a logical server's instance up or down
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("could not find {kind}: {name}")]
    NotFound { kind: ResourceKind, name: String },

    #[error("no boot image for {0}: no snapshot found and no image configured")]
    ImageNotFound(String),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("{kind} action {action_id} errored")]
    ActionFailed { kind: &'static str, action_id: u64 },

    #[error("droplet {0} disappeared while powering off")]
    Vanished(String),

    #[error("droplet {name} has no {family} address")]
    NoAddress { name: String, family: &'static str },
}

impl ComputeError {
    /// Resource-not-found is an expected outcome, not a failure
    pub fn is_not_found(&self) -> bool {
        match self {
            ComputeError::NotFound { .. } => true,
            ComputeError::Api(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Error codes for admin API errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// No logical server with that name
    UnknownServer,
    /// Controller did not answer in time (busy with a spin-up or spin-down)
    ServerBusy,
    /// Controller has stopped
    ServerStopped,
    /// Unknown route
    NotFound,
}

impl AdminErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminErrorCode::UnknownServer => StatusCode::NOT_FOUND,
            AdminErrorCode::ServerBusy => StatusCode::SERVICE_UNAVAILABLE,
            AdminErrorCode::ServerStopped => StatusCode::GONE,
            AdminErrorCode::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Get the error code as a string for the X-Dospin-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            AdminErrorCode::Unauthorized => "UNAUTHORIZED",
            AdminErrorCode::UnknownServer => "UNKNOWN_SERVER",
            AdminErrorCode::ServerBusy => "SERVER_BUSY",
            AdminErrorCode::ServerStopped => "SERVER_STOPPED",
            AdminErrorCode::NotFound => "NOT_FOUND",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: AdminErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: AdminErrorCode, message: impl Into<String>) -> Self {
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
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Dospin-Error header
pub fn json_error_response(code: AdminErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Dospin-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}
