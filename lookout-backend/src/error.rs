use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use lookout_db::DbError;
use serde::Serialize;

use crate::views::ViewError;

/// API error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
  pub error: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub details: Option<String>,
}

impl ErrorResponse {
  pub fn new(error: impl Into<String>) -> Self {
    Self {
      error: error.into(),
      details: None,
    }
  }

  pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
    Self {
      error: error.into(),
      details: Some(details.into()),
    }
  }
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
  DatabaseError(DbError),
  ViewError(ViewError),
  ValidationError(String),
}

fn database_response(db_err: &DbError) -> (StatusCode, &'static str) {
  match db_err {
    DbError::ServerNotFound => (StatusCode::NOT_FOUND, "Server not found"),
    DbError::PlayerNotFound => (StatusCode::NOT_FOUND, "Player not found"),
    DbError::Closed => (
      StatusCode::SERVICE_UNAVAILABLE,
      "Storage is shutting down. Please try again later.",
    ),
    DbError::Sqlite(_) | DbError::Connection(_) => {
      // Don't expose internal database errors
      tracing::error!("Internal database error: {:?}", db_err);
      (
        StatusCode::INTERNAL_SERVER_ERROR,
        "An internal error occurred. Please try again later.",
      )
    }
  }
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    match self {
      AppError::DatabaseError(db_err) => {
        tracing::debug!(?db_err, "Database error occurred");
        let (status, message) = database_response(&db_err);
        (status, Json(ErrorResponse::new(message))).into_response()
      }
      AppError::ViewError(ViewError::Database(db_err)) => {
        let (status, message) = database_response(&db_err);
        (status, Json(ErrorResponse::new(message))).into_response()
      }
      AppError::ViewError(err @ ViewError::MissingScope(_)) => {
        let error_response = ErrorResponse::with_details("Missing scope", err.to_string());
        (StatusCode::BAD_REQUEST, Json(error_response)).into_response()
      }
      AppError::ViewError(ViewError::Serialize(err)) => {
        tracing::error!(error = %err, "Failed to serialize view");
        (
          StatusCode::INTERNAL_SERVER_ERROR,
          Json(ErrorResponse::new("An internal error occurred. Please try again later.")),
        )
          .into_response()
      }
      AppError::ValidationError(msg) => {
        tracing::warn!(validation_error = %msg, "Validation failed");
        let error_response = ErrorResponse::new(msg);
        (StatusCode::BAD_REQUEST, Json(error_response)).into_response()
      }
    }
  }
}

impl From<DbError> for AppError {
  fn from(err: DbError) -> Self {
    AppError::DatabaseError(err)
  }
}

impl From<ViewError> for AppError {
  fn from(err: ViewError) -> Self {
    AppError::ViewError(err)
  }
}

impl From<crate::validation::ValidationError> for AppError {
  fn from(err: crate::validation::ValidationError) -> Self {
    AppError::ValidationError(err.to_string())
  }
}
