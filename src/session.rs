//! Who is logged in. The mock backend has no auth endpoint, so a login is a
//! username lookup plus a plaintext password comparison.

use color_eyre::Result;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{ApiError, ExpenseApi, ResourceKey, User};
use crate::cache::RequestExecutor;
use crate::db::{KeyValueStore, USER_KEY};

#[derive(Debug, Error)]
pub enum LoginError {
  #[error("User not found")]
  UserNotFound,
  #[error("Invalid password")]
  InvalidPassword,
  #[error(transparent)]
  Api(#[from] ApiError),
  #[error("failed to store session: {0}")]
  Storage(color_eyre::Report),
}

pub struct Session {
  storage: Arc<dyn KeyValueStore>,
}

impl Session {
  pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
    Self { storage }
  }

  pub async fn login(
    &self,
    executor: &RequestExecutor,
    api: &dyn ExpenseApi,
    username: &str,
    password: &str,
  ) -> Result<User, LoginError> {
    let key = ResourceKey::UserByName {
      username: username.to_string(),
    };
    let users = executor
      .execute_cached(&key, || api.find_users(username))
      .await?
      .data;

    let user = users.into_iter().next().ok_or(LoginError::UserNotFound)?;
    if user.password != password {
      warn!(username, "login rejected");
      return Err(LoginError::InvalidPassword);
    }

    let json = serde_json::to_string(&user).map_err(|e| LoginError::Storage(e.into()))?;
    self.storage.set(USER_KEY, &json).map_err(LoginError::Storage)?;
    info!(user_id = %user.id, "logged in");
    Ok(user)
  }

  /// Forget the user and everything cached on their behalf.
  pub fn logout(&self, executor: &RequestExecutor) -> Result<()> {
    self.storage.remove(USER_KEY)?;
    executor.cache().clear()?;
    info!("logged out");
    Ok(())
  }

  pub fn current_user(&self) -> Result<Option<User>> {
    match self.storage.get(USER_KEY)? {
      Some(json) => Ok(Some(serde_json::from_str(&json)?)),
      None => Ok(None),
    }
  }
}
