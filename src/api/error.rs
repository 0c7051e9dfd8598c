//! Error taxonomy for backend calls.
//!
//! Every network-facing call resolves to `Result<T, ApiError>`. The
//! [`ErrorKind`] is decided once, by [`classify`], from what the transport
//! observed; callers branch on the kind and never inspect the error shape.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// What the transport observed for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
  /// No response was received. `aborted` is set when the attempt was cut off
  /// by its timeout.
  NoResponse { aborted: bool },
  /// The server answered with a non-success status.
  Status(u16),
}

/// Closed set of error classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
  NetworkError,
  Timeout,
  ServerError,
  Unauthorized,
  NotFound,
  ValidationError,
  Unknown,
}

/// The user action an error message is shown for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  FetchList,
  FetchOne,
  Create,
  Update,
  Delete,
}

impl ErrorKind {
  /// Whether another attempt could plausibly succeed.
  pub fn is_retryable(self) -> bool {
    matches!(
      self,
      ErrorKind::NetworkError | ErrorKind::Timeout | ErrorKind::ServerError
    )
  }

  /// Terminal kinds that make a queued operation moot rather than failed.
  pub fn is_moot(self) -> bool {
    matches!(self, ErrorKind::NotFound | ErrorKind::ValidationError)
  }

  /// Default message for an error of this kind.
  pub fn default_message(self) -> &'static str {
    match self {
      ErrorKind::NetworkError => "Network error. Please check your connection and try again.",
      ErrorKind::Timeout => "Request timed out. Please try again.",
      ErrorKind::ServerError => "Server error. Please try again later.",
      ErrorKind::Unauthorized => "Unauthorized. Please login again.",
      ErrorKind::NotFound => "Requested resource not found.",
      ErrorKind::ValidationError => "Invalid data provided.",
      ErrorKind::Unknown => "Something went wrong. Please try again.",
    }
  }

  /// Message shown to the user when `action` failed with this kind.
  pub fn user_message(self, action: Action) -> &'static str {
    match (self, action) {
      (ErrorKind::Unauthorized, _) => "Session expired. Please log in again.",
      (ErrorKind::ServerError, Action::FetchList) => {
        "Server temporarily unavailable. Please try again."
      }
      (ErrorKind::ServerError, _) => "Server error. Please try again.",
      (ErrorKind::Timeout, Action::FetchList) => {
        "Request timed out. Please check your connection."
      }
      (ErrorKind::NetworkError, Action::FetchList) => {
        "No internet connection. Please check your network."
      }
      (ErrorKind::NetworkError, Action::FetchOne) => {
        "No internet connection. Unable to load expense."
      }
      (ErrorKind::NotFound, Action::FetchOne) => "Expense not found.",
      (ErrorKind::NotFound, Action::Delete) => "Expense not found or already deleted.",
      (ErrorKind::ValidationError, Action::Create | Action::Update) => {
        "Invalid expense data. Please check your input."
      }
      (_, Action::FetchList) => "Failed to load expenses.",
      (_, Action::FetchOne) => "Failed to load expense details.",
      (_, Action::Create) => "Failed to create expense.",
      (_, Action::Update) => "Failed to update expense.",
      (_, Action::Delete) => "Failed to delete expense.",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorKind::NetworkError => "NETWORK_ERROR",
      ErrorKind::Timeout => "TIMEOUT",
      ErrorKind::ServerError => "SERVER_ERROR",
      ErrorKind::Unauthorized => "UNAUTHORIZED",
      ErrorKind::NotFound => "NOT_FOUND",
      ErrorKind::ValidationError => "VALIDATION_ERROR",
      ErrorKind::Unknown => "UNKNOWN",
    };
    f.write_str(name)
  }
}

/// Map a raw failure to exactly one classification.
pub fn classify(failure: Failure) -> ErrorKind {
  match failure {
    Failure::NoResponse { aborted: true } => ErrorKind::Timeout,
    Failure::NoResponse { aborted: false } => ErrorKind::NetworkError,
    Failure::Status(401) => ErrorKind::Unauthorized,
    Failure::Status(404) => ErrorKind::NotFound,
    Failure::Status(422) => ErrorKind::ValidationError,
    Failure::Status(500 | 502 | 503 | 504) => ErrorKind::ServerError,
    Failure::Status(_) => ErrorKind::Unknown,
  }
}

/// A classified backend failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ApiError {
  pub kind: ErrorKind,
  pub status: Option<u16>,
  pub message: String,
}

impl ApiError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      status: None,
      message: message.into(),
    }
  }

  /// Build an error from a raw failure using the kind's default message.
  pub fn from_failure(failure: Failure) -> Self {
    let kind = classify(failure);
    let status = match failure {
      Failure::Status(status) => Some(status),
      Failure::NoResponse { .. } => None,
    };
    Self {
      kind,
      status,
      message: kind.default_message().to_string(),
    }
  }

  pub fn is_retryable(&self) -> bool {
    self.kind.is_retryable()
  }
}

impl From<reqwest::Error> for ApiError {
  fn from(err: reqwest::Error) -> Self {
    match err.status() {
      Some(status) => Self::from_failure(Failure::Status(status.as_u16())),
      None if err.is_decode() => Self::new(
        ErrorKind::Unknown,
        format!("Failed to parse response: {}", err),
      ),
      None => Self::from_failure(Failure::NoResponse {
        aborted: err.is_timeout(),
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_no_response_classification() {
    assert_eq!(
      classify(Failure::NoResponse { aborted: true }),
      ErrorKind::Timeout
    );
    assert_eq!(
      classify(Failure::NoResponse { aborted: false }),
      ErrorKind::NetworkError
    );
  }

  #[test]
  fn test_status_classification() {
    assert_eq!(classify(Failure::Status(401)), ErrorKind::Unauthorized);
    assert_eq!(classify(Failure::Status(404)), ErrorKind::NotFound);
    assert_eq!(classify(Failure::Status(422)), ErrorKind::ValidationError);
    for status in [500, 502, 503, 504] {
      assert_eq!(classify(Failure::Status(status)), ErrorKind::ServerError);
    }
    for status in [400, 403, 429, 501, 505] {
      assert_eq!(classify(Failure::Status(status)), ErrorKind::Unknown);
    }
  }

  #[test]
  fn test_retryable_flags() {
    assert!(ErrorKind::NetworkError.is_retryable());
    assert!(ErrorKind::Timeout.is_retryable());
    assert!(ErrorKind::ServerError.is_retryable());
    assert!(!ErrorKind::Unauthorized.is_retryable());
    assert!(!ErrorKind::NotFound.is_retryable());
    assert!(!ErrorKind::ValidationError.is_retryable());
    assert!(!ErrorKind::Unknown.is_retryable());
  }

  #[test]
  fn test_from_failure_keeps_status() {
    let err = ApiError::from_failure(Failure::Status(503));
    assert_eq!(err.kind, ErrorKind::ServerError);
    assert_eq!(err.status, Some(503));

    let err = ApiError::from_failure(Failure::NoResponse { aborted: false });
    assert_eq!(err.status, None);
  }

  #[test]
  fn test_user_messages_depend_on_action() {
    assert_eq!(
      ErrorKind::NotFound.user_message(Action::Delete),
      "Expense not found or already deleted."
    );
    assert_eq!(
      ErrorKind::Unauthorized.user_message(Action::Create),
      "Session expired. Please log in again."
    );
    assert_eq!(
      ErrorKind::Unknown.user_message(Action::FetchList),
      "Failed to load expenses."
    );
  }
}
