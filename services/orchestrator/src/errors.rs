//! Error taxonomy (§7): one `thiserror` enum per component, mapped to HTTP
//! status only at the Control API boundary (`ControlApiError`). Internal
//! handler callbacks never propagate these — they are logged and swallowed
//! at the call site instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::http::response::{bad_request, internal_error, not_found};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway not started")]
    NotStarted,
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] orch_protocol::CodecError),
    #[error("transport send failed: {0}")]
    Send(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("pilot not found (db_name={db_name:?}, ip={ip:?})")]
    PilotNotFound {
        db_name: Option<String>,
        ip: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("backend row not found")]
    NotFound,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("run {0} not found")]
    RunNotFound(i64),
    #[error("pilot {0} not found in backend")]
    PilotNotFound(i64),
    #[error("session {0} has no subject protocol runs")]
    EmptySession(i64),
}

/// The only error type that crosses the HTTP boundary (§7, §4.H): maps input
/// errors to 400, unresolved identities to 404, everything else to 500,
/// the same three-way split as the original's `api.py` `except` clauses.
#[derive(Debug, Error)]
pub enum ControlApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl From<ControllerError> for ControlApiError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::RunNotFound(_)
            | ControllerError::PilotNotFound(_)
            | ControllerError::Registry(_)
            | ControllerError::Backend(BackendError::NotFound) => {
                ControlApiError::NotFound(err.to_string())
            }
            other => ControlApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ControlApiError {
    fn into_response(self) -> Response {
        match self {
            ControlApiError::BadRequest(message) => bad_request(message),
            ControlApiError::NotFound(message) => not_found(message),
            ControlApiError::Internal(message) => internal_error(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_api_error_status_codes_match_taxonomy() {
        assert_eq!(
            ControlApiError::BadRequest("x".into())
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ControlApiError::NotFound("x".into())
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ControlApiError::Internal("x".into())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn run_not_found_maps_to_404() {
        let api_err: ControlApiError = ControllerError::RunNotFound(7).into();
        assert!(matches!(api_err, ControlApiError::NotFound(_)));
    }

    #[test]
    fn backend_transport_error_maps_to_500() {
        let api_err: ControlApiError =
            ControllerError::Backend(BackendError::Http { status: 503, body: "down".into() })
                .into();
        assert!(matches!(api_err, ControlApiError::Internal(_)));
    }
}
