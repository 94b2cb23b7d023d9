//! # Error Handling
//!
//! Custom error types and their conversion to HTTP responses.
//!
//! ## Error Categories:
//! - **BadRequest**: the client sent an invalid upload (400)
//! - **ModelInit**: the engine could not be constructed with any precision
//!   candidate (500)
//! - **Internal**: transcription or other server-side failures (500)
//!
//! ## Response Format:
//! Every error body is `{"detail": <message>}`, the same shape for client
//! and server errors, so callers have one field to read.

use crate::transcription::LoadError;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid or missing data
    BadRequest(String),

    /// Engine construction failed after exhausting precision candidates
    ModelInit(String),

    /// Server-side failures (transcription errors, I/O problems)
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "{}", msg),
            AppError::ModelInit(msg) => write!(f, "Model initialization failed: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, detail) = match self {
            AppError::BadRequest(msg) => {
                (actix_web::http::StatusCode::BAD_REQUEST, msg.clone())
            }
            AppError::ModelInit(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                msg.clone(),
            ),
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({ "detail": detail }))
    }
}

/// Transcription and I/O failures inside a request become 500s.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Initialization failures carry their own category so the log line and the
/// response make clear the model, not the request, is the problem.
impl From<LoadError> for AppError {
    fn from(err: LoadError) -> Self {
        AppError::ModelInit(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let bad = AppError::BadRequest("Missing audio file.".to_string());
        assert_eq!(bad.error_response().status(), 400);

        let init = AppError::ModelInit("no candidates".to_string());
        assert_eq!(init.error_response().status(), 500);

        let internal = AppError::Internal("decode failed".to_string());
        assert_eq!(internal.error_response().status(), 500);
    }

    #[test]
    fn test_bad_request_detail_is_verbatim() {
        let err = AppError::BadRequest("Empty audio file.".to_string());
        assert_eq!(err.to_string(), "Empty audio file.");
    }
}
