use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("api key is not registered")]
    UnknownApiKey,
    #[error("client '{0}' holds no control grant")]
    ControlNotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match self {
            RelayError::UnknownApiKey | RelayError::ControlNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let code = match status.as_u16() {
            400 => "bad_request",
            404 => "not_found",
            _ => "internal_error",
        }
        .to_string();

        let body = ErrorBody {
            code,
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
