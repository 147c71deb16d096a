use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use fnrun_common::{ErrorKind, FnrunError};
use serde_json::json;
use tracing::error;

/// Status code for a failure of the given kind, shared by API errors and
/// failed invocation responses.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::RouteConflict | ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::InvalidRequest | ErrorKind::Config => StatusCode::BAD_REQUEST,
        ErrorKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::CodeNotFound
        | ErrorKind::ImageUnavailable
        | ErrorKind::ProvisionFailed
        | ErrorKind::Crashed
        | ErrorKind::StoreError
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug)]
pub struct AppError(pub FnrunError);

impl From<FnrunError> for AppError {
    fn from(err: FnrunError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        // Outside an invocation a missing handler is a missing resource
        let status = match kind {
            ErrorKind::CodeNotFound => StatusCode::NOT_FOUND,
            other => status_for(other),
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }

        let body = json!({
            "error": self.0.to_string(),
            "kind": kind,
        });
        (status, Json(body)).into_response()
    }
}
