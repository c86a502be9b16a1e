//! HTTP surface: admission middleware and the standalone admission service.

mod middleware;
mod server;
mod service;

pub use middleware::{
    admission_middleware, admit, admit_with, client_id, AdmissionState, Rejection,
};
pub use server::HttpServer;
pub use service::{router, CheckRequest};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::TollgateError;

/// A `TollgateError` rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(pub TollgateError);

impl From<TollgateError> for ApiError {
    fn from(err: TollgateError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self.0 {
            TollgateError::UnknownCategory(_) => (StatusCode::BAD_REQUEST, "Unknown Category"),
            TollgateError::Config(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            TollgateError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"),
            TollgateError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
        };

        (
            status,
            Json(json!({
                "error": error,
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}
