//! Centralized error types for the Castellan core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error kinds using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the Castellan daemon.
///
/// Each variant is a disjoint error kind; command paths surface these
/// verbatim to the HTTP layer, which maps them through [`status_code`].
///
/// [`status_code`]: CastellanError::status_code
#[derive(Debug, Error)]
pub enum CastellanError {
    /// Input outside its contract (range, format).
    #[error("invalid value for {field}: {message}")]
    Validation {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable description of the violation.
        message: String,
    },

    /// A player identifier fails the bus-name format rules.
    #[error("invalid bus name {busname:?}: {reason}")]
    InvalidBusName {
        busname: String,
        reason: &'static str,
    },

    /// The entity's current capability set does not support the operation.
    #[error("player does not support {required}")]
    Capability {
        /// The capability flag that would be required, e.g. `CanGoNext`.
        required: &'static str,
    },

    /// A power action was requested that the operator has not enabled.
    #[error("action not allowed")]
    NotAllowed { action: &'static str },

    /// No cached player with this bus name.
    #[error("no player with bus name {busname}")]
    PlayerNotFound { busname: String },

    /// No cached audio client with this stream name.
    #[error("no audio client named {name}")]
    ClientNotFound { name: String },

    /// Mutating operation attempted in system scope.
    #[error("can not act on system units: {unit}")]
    PermissionSystem { unit: String },

    /// Mutating operation on a user unit outside the managed whitelist.
    #[error("cannot act on unmanaged user unit: {unit}")]
    PermissionUser { unit: String },

    /// The addressed subsystem is disabled by configuration.
    #[error("subsystem {subsystem} is not enabled")]
    Disabled { subsystem: &'static str },

    /// An upstream call exceeded its deadline.
    #[error("upstream call timed out")]
    Timeout,

    /// Any other wrapped upstream failure.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl CastellanError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_failed",
            Self::InvalidBusName { .. } => "invalid_bus_name",
            Self::Capability { .. } => "capability_missing",
            Self::NotAllowed { .. } => "action_not_allowed",
            Self::PlayerNotFound { .. } => "player_not_found",
            Self::ClientNotFound { .. } => "client_not_found",
            Self::PermissionSystem { .. } => "permission_system",
            Self::PermissionUser { .. } => "permission_user",
            Self::Disabled { .. } => "subsystem_disabled",
            Self::Timeout => "timeout",
            Self::Upstream(_) => "upstream_error",
        }
    }

    /// Maps the error kind to an HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } | Self::InvalidBusName { .. } | Self::Capability { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::NotAllowed { .. } | Self::PermissionSystem { .. } | Self::PermissionUser { .. } => {
                StatusCode::FORBIDDEN
            }
            Self::PlayerNotFound { .. } | Self::ClientNotFound { .. } | Self::Disabled { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::Timeout | Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for core operations.
pub type CastellanResult<T> = Result<T, CastellanError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for CastellanError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<zbus::Error> for CastellanError {
    fn from(err: zbus::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<zbus::fdo::Error> for CastellanError {
    fn from(err: zbus::fdo::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}
