use assay_core::AssayError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

/// Error returned by HTTP handlers, rendered as `{"error": "...", "kind": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    /// The request was well-formed JSON but semantically invalid.
    BadRequest(String),
    Assay(AssayError),
}

impl From<AssayError> for ApiError {
    fn from(err: AssayError) -> Self {
        ApiError::Assay(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Assay(err) => match err {
                AssayError::NotFound(_) => StatusCode::NOT_FOUND,
                AssayError::InvalidTransition { .. } => StatusCode::CONFLICT,
                AssayError::Unroutable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                AssayError::Json(_) => StatusCode::BAD_REQUEST,
                AssayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Assay(err) => err.kind(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "{msg}"),
            ApiError::Assay(err) => write!(f, "{err}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %self, "Request failed");
        }
        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        (status, Json(body)).into_response()
    }
}
