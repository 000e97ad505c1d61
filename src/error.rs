//! Error types for the provisioning engine.
//!
//! Using thiserror for ergonomic error definitions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::backend::BackendError;

/// Errors from the DHCP handling path.
///
/// `Ignore` is not a fault: the packet was seen and deliberately left
/// unanswered. The server loop counts it separately and never logs it above
/// debug. Backend errors keep their not-found distinction so the loop can
/// meter them apart.
#[derive(Error, Debug)]
pub enum DhcpError {
    #[error("malformed packet: {0}")]
    Parse(String),

    #[error("ignoring packet: {0}")]
    Ignore(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl DhcpError {
    pub fn ignore(reason: impl Into<String>) -> Self {
        Self::Ignore(reason.into())
    }
}

/// Errors surfaced by the HTTP handlers.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("no hardware record for {0}")]
    NotFound(String),

    #[error("backend failure: {0}")]
    Backend(#[source] BackendError),

    #[error("upstream fetch failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("template rendering failed: {0}")]
    Template(#[from] minijinja::Error),
}

impl From<BackendError> for AppError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound(key) => Self::NotFound(key),
            other => Self::Backend(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidMac(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Backend(_) | Self::Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        };

        if status.is_server_error() {
            tracing::error!("{self}");
        } else {
            tracing::debug!("{self}");
        }

        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_not_found_becomes_404() {
        let err: AppError = BackendError::NotFound("aa:bb".into()).into();
        assert!(matches!(err, AppError::NotFound(_)));
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn backend_transient_becomes_500() {
        let err: AppError = BackendError::Malformed("oops".into()).into();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn invalid_mac_becomes_400() {
        let resp = AppError::InvalidMac("nope".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
