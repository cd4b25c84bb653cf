//! Who is logged in. The cache layer reads the session, it never manages it.

use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::fleet::types::{Session, UserRole};

/// Source of the current user and bearer token.
pub trait SessionProvider: Send + Sync {
  /// Current authenticated user, if any.
  fn session(&self) -> Option<Session>;

  /// Bearer token to attach to API requests.
  fn token(&self) -> Option<String>;

  /// The server rejected the token (HTTP 401).
  fn on_unauthorized(&self);

  fn user_id(&self) -> Option<String> {
    self.session().map(|session| session.user_id)
  }

  fn role(&self) -> Option<UserRole> {
    self.session().map(|session| session.role)
  }
}

struct SessionState {
  session: Option<Session>,
  token: Option<String>,
}

/// Session fixed at startup from configuration and environment.
///
/// A 401 drops both the user and the token, like a logout.
#[derive(Clone)]
pub struct StaticSession {
  state: Arc<RwLock<SessionState>>,
}

impl StaticSession {
  pub fn new(session: Option<Session>, token: Option<String>) -> Self {
    Self {
      state: Arc::new(RwLock::new(SessionState { session, token })),
    }
  }

  pub fn anonymous() -> Self {
    Self::new(None, None)
  }

  pub fn is_authenticated(&self) -> bool {
    self.read(|state| state.token.is_some())
  }

  fn read<T>(&self, f: impl FnOnce(&SessionState) -> T) -> T {
    match self.state.read() {
      Ok(state) => f(&state),
      Err(poisoned) => f(&poisoned.into_inner()),
    }
  }
}

impl SessionProvider for StaticSession {
  fn session(&self) -> Option<Session> {
    self.read(|state| state.session.clone())
  }

  fn token(&self) -> Option<String> {
    self.read(|state| state.token.clone())
  }

  fn on_unauthorized(&self) {
    warn!("API rejected credentials, dropping session");
    let mut state = match self.state.write() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    state.session = None;
    state.token = None;
  }
}
