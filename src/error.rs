//! Error taxonomy shared by the transport, the query controller and the
//! mutation coordinator.

use thiserror::Error;

/// Failure of a fetch or a mutation.
///
/// Errors are `Clone` because a single in-flight fetch may be awaited by
/// several callers, and because the last fetch error is kept on the cache
/// entry so observers can render it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  /// The request never produced an HTTP response (connect, timeout, reset).
  #[error("network error: {0}")]
  Network(String),

  /// 5xx response from the server.
  #[error("server error ({status}): {message}")]
  Server { status: u16, message: String },

  /// 4xx response other than 409. Never retried.
  #[error("validation error ({status}): {message}")]
  Validation { status: u16, message: String },

  /// The entity was changed elsewhere (HTTP 409).
  #[error("conflict: {0}")]
  Conflict(String),

  #[error("unknown error: {0}")]
  Unknown(String),
}

impl CacheError {
  /// Classify an HTTP status code returned by the transport.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      409 => Self::Conflict(message),
      400..=499 => Self::Validation { status, message },
      500..=599 => Self::Server { status, message },
      _ => Self::Unknown(format!("unexpected status {}: {}", status, message)),
    }
  }

  /// Whether a failed fetch is worth one more attempt.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Network(_) | Self::Server { .. })
  }

  pub fn is_conflict(&self) -> bool {
    matches!(self, Self::Conflict(_))
  }

  /// HTTP-equivalent status, when there was a response at all.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Server { status, .. } | Self::Validation { status, .. } => Some(*status),
      Self::Conflict(_) => Some(409),
      Self::Network(_) | Self::Unknown(_) => None,
    }
  }
}
