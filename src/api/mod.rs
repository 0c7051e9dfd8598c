//! Backend access: REST client, domain types and error classification.

pub mod client;
pub mod error;
pub mod keys;
pub mod types;

pub use client::{ExpenseApi, HttpExpenseApi};
pub use error::{Action, ApiError, ErrorKind};
pub use keys::ResourceKey;
pub use types::{spending_summary, Expense, NewExpense, User};
