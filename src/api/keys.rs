//! Cache keys for backend resources.

use sha2::{Digest, Sha256};

use crate::cache::QueryKey;

/// Logical identity of a cacheable backend response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceKey {
  /// `GET /expenses`
  AllExpenses,
  /// `GET /expenses/{id}`
  Expense { id: String },
  /// `GET /users?username=`
  UserByName { username: String },
}

impl QueryKey for ResourceKey {
  fn cache_hash(&self) -> String {
    let input = match self {
      Self::AllExpenses => "expenses".to_string(),
      Self::Expense { id } => format!("expense:{}", id.trim()),
      // The backend matches usernames exactly, so the key does too
      Self::UserByName { username } => format!("user:{}", username),
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    match self {
      Self::AllExpenses => "all expenses".to_string(),
      Self::Expense { id } => format!("expense #{}", id),
      Self::UserByName { username } => format!("user by username {}", username),
    }
  }
}
