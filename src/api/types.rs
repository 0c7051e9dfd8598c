//! Domain types exchanged with the expenses backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Categories offered when recording an expense.
pub const EXPENSE_CATEGORIES: &[&str] = &[
  "Food",
  "Food & Dining",
  "Transportation",
  "Shopping",
  "Entertainment",
  "Housing",
  "Utilities",
  "Healthcare",
  "Education",
  "Travel",
  "Clothes",
  "Other",
];

/// An expense record as held by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
  pub id: String,
  #[serde(default)]
  pub created_at: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(deserialize_with = "deserialize_amount")]
  pub amount: f64,
  #[serde(default)]
  pub description: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub date: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_id: Option<String>,
}

impl Expense {
  /// Local stand-in for an expense whose creation is still queued.
  pub fn provisional(id: &str, data: &NewExpense) -> Self {
    Self {
      id: id.to_string(),
      created_at: data.created_at.clone(),
      name: data.name.clone(),
      amount: data.amount,
      description: data.description.clone(),
      category: Some(data.category.clone()),
      date: Some(data.date.clone()),
      user_id: Some(data.user_id.clone()),
    }
  }

  /// Apply a queued update to the local copy.
  pub fn apply(&mut self, data: &NewExpense) {
    self.name = data.name.clone();
    self.amount = data.amount;
    self.description = data.description.clone();
    self.category = Some(data.category.clone());
    self.date = Some(data.date.clone());
    self.user_id = Some(data.user_id.clone());
  }
}

/// Body of a create or update request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewExpense {
  pub amount: f64,
  pub description: String,
  pub category: String,
  pub date: String,
  pub user_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  pub created_at: String,
}

impl NewExpense {
  /// Build a validated request body stamped with the submission time.
  pub fn new(
    amount: f64,
    description: impl Into<String>,
    category: impl Into<String>,
    date: Option<String>,
    user_id: impl Into<String>,
    name: Option<String>,
  ) -> Result<Self, String> {
    let now = Utc::now();
    let expense = Self {
      amount,
      description: description.into().trim().to_string(),
      category: category.into(),
      date: date.unwrap_or_else(|| now.format("%Y-%m-%d").to_string()),
      user_id: user_id.into(),
      name,
      created_at: now.to_rfc3339(),
    };
    expense.validate()?;
    Ok(expense)
  }

  /// Check the fields the entry form requires.
  pub fn validate(&self) -> Result<(), String> {
    if !self.amount.is_finite() || self.amount <= 0.0 {
      return Err("Please enter a valid amount".to_string());
    }
    if self.description.trim().is_empty() {
      return Err("Description is required".to_string());
    }
    if !EXPENSE_CATEGORIES.contains(&self.category.as_str()) {
      return Err(format!(
        "Unknown category '{}'. Expected one of: {}",
        self.category,
        EXPENSE_CATEGORIES.join(", ")
      ));
    }
    if chrono::NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").is_err()
      && DateTime::parse_from_rfc3339(&self.date).is_err()
    {
      return Err(format!("Invalid date '{}'", self.date));
    }
    Ok(())
  }
}

/// A user account as returned by `GET /users`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
  pub id: String,
  pub username: String,
  #[serde(default)]
  pub password: String,
  #[serde(default)]
  pub created_at: String,
}

/// The backend stores amounts either as numbers or numeric strings.
fn deserialize_amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Amount {
    Number(f64),
    Text(String),
  }

  match Amount::deserialize(deserializer)? {
    Amount::Number(n) => Ok(n),
    Amount::Text(s) => Ok(s.trim().parse().unwrap_or(0.0)),
  }
}

/// Spending in one category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryTotal {
  pub category: String,
  pub amount: f64,
  pub count: usize,
  pub percentage: f64,
}

/// Dashboard totals over a set of expenses.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpendingSummary {
  pub total: f64,
  pub count: usize,
  /// Sorted by amount, largest first
  pub categories: Vec<CategoryTotal>,
}

/// Aggregate expenses by category. Non-positive amounts are ignored.
pub fn spending_summary(expenses: &[Expense]) -> SpendingSummary {
  let mut by_category: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
  let mut total = 0.0;
  let mut count = 0;

  for expense in expenses.iter().filter(|e| e.amount > 0.0) {
    let category = expense.category.as_deref().unwrap_or("Other");
    let entry = by_category.entry(category).or_insert((0.0, 0));
    entry.0 += expense.amount;
    entry.1 += 1;
    total += expense.amount;
    count += 1;
  }

  let mut categories: Vec<CategoryTotal> = by_category
    .into_iter()
    .map(|(category, (amount, count))| CategoryTotal {
      category: category.to_string(),
      amount,
      count,
      percentage: if total > 0.0 {
        amount / total * 100.0
      } else {
        0.0
      },
    })
    .collect();
  categories.sort_by(|a, b| b.amount.total_cmp(&a.amount));

  SpendingSummary {
    total,
    count,
    categories,
  }
}
