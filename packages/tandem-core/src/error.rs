//! Centralized error types for the Tandem core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Gives every error a machine-readable code
//! - Maps application errors to HTTP status codes for the HTTP handler

use std::io;
use std::net::SocketAddr;

use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordinator Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failures returned by [`Coordinator`](crate::coordinator::Coordinator) operations.
///
/// Lookup misses are ordinary results, not faults: a device may disconnect
/// at any time and a client may name a group that was never created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// No playlist group with this name exists.
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// No device with this client id is registered.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Writing persisted state failed.
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl ErrorCode for CoordinatorError {
    fn code(&self) -> &'static str {
        match self {
            Self::GroupNotFound(_) => "group_not_found",
            Self::DeviceNotFound(_) => "device_not_found",
            Self::Persistence(_) => "persistence_failed",
        }
    }
}

/// Convenient Result alias for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

// ─────────────────────────────────────────────────────────────────────────────
// Server Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failures that prevent a reactor from starting or keep it from running.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be created or bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The readiness primitive could not be created or registered.
    #[error("poll setup failed: {0}")]
    Poll(#[source] io::Error),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A reactor thread could not be started or panicked.
    #[error("reactor thread failed: {0}")]
    Thread(String),
}

impl ErrorCode for ServerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind_failed",
            Self::Poll(_) => "poll_failed",
            Self::Config(_) => "invalid_config",
            Self::Thread(_) => "thread_failed",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Application Error
// ─────────────────────────────────────────────────────────────────────────────

/// Application-wide error type surfaced to protocol clients.
///
/// Protocol layers translate this into their own error responses; the HTTP
/// handler uses [`TandemError::http_status`] and the JSON body below.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum TandemError {
    /// Requested playlist group does not exist.
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// Requested device is not connected.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Requested file or path does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request path escapes the served directory.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Request method is not supported.
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// Request head exceeded the size limit.
    #[error("Request too large")]
    RequestTooLarge,

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TandemError {
    /// Maps the error to an HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::GroupNotFound(_) | Self::DeviceNotFound(_) | Self::NotFound(_) => 404,
            Self::Forbidden(_) => 403,
            Self::InvalidRequest(_) => 400,
            Self::MethodNotAllowed(_) => 405,
            Self::RequestTooLarge => 413,
            Self::Internal(_) => 500,
        }
    }
}

impl ErrorCode for TandemError {
    fn code(&self) -> &'static str {
        match self {
            Self::GroupNotFound(_) => "group_not_found",
            Self::DeviceNotFound(_) => "device_not_found",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidRequest(_) => "invalid_request",
            Self::MethodNotAllowed(_) => "method_not_allowed",
            Self::RequestTooLarge => "request_too_large",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<CoordinatorError> for TandemError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::GroupNotFound(name) => Self::GroupNotFound(name),
            CoordinatorError::DeviceNotFound(id) => Self::DeviceNotFound(id),
            CoordinatorError::Persistence(msg) => Self::Internal(msg),
        }
    }
}

/// Convenient Result alias for request handling.
pub type TandemResult<T> = Result<T, TandemError>;

/// JSON body for error responses.
#[derive(Serialize)]
pub(crate) struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub status: u16,
}

impl From<&TandemError> for ErrorBody {
    fn from(err: &TandemError) -> Self {
        Self {
            error: err.code(),
            message: err.to_string(),
            status: err.http_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_errors_map_to_not_found() {
        let err: TandemError = CoordinatorError::GroupNotFound("kitchen".into()).into();
        assert_eq!(err.code(), "group_not_found");
        assert_eq!(err.http_status(), 404);

        let err: TandemError = CoordinatorError::DeviceNotFound("00:04:20".into()).into();
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn persistence_failure_is_internal() {
        let err: TandemError = CoordinatorError::Persistence("disk full".into()).into();
        assert_eq!(err.code(), "internal_error");
        assert_eq!(err.http_status(), 500);
    }

    #[test]
    fn error_body_serializes_code_and_status() {
        let err = TandemError::Forbidden("/html/../secret".into());
        let json = serde_json::to_value(ErrorBody::from(&err)).unwrap();
        assert_eq!(json["error"], "forbidden");
        assert_eq!(json["status"], 403);
    }

    #[test]
    fn server_error_codes() {
        let err = ServerError::Config("max_connections must be >= 1".into());
        assert_eq!(err.code(), "invalid_config");
    }
}
