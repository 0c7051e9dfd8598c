//! In-memory backend used by the sync tests.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Mutex;
use std::time::Duration;

use crate::api::error::Failure;
use crate::api::{ApiError, Expense, ExpenseApi, NewExpense, User};

type Predicate = Box<dyn Fn(&str) -> bool + Send>;

#[derive(Default)]
struct FakeState {
  records: Vec<Expense>,
  users: Vec<User>,
  created: Vec<Expense>,
  deleted: Vec<String>,
  calls: usize,
  next_id: u32,
  failure: Option<Failure>,
  fail_when: Option<(Predicate, Failure)>,
  delay: Option<Duration>,
}

/// Backend double: keeps records in memory and fails on demand.
#[derive(Default)]
pub struct FakeApi {
  state: Mutex<FakeState>,
}

pub fn new_expense(description: &str) -> NewExpense {
  NewExpense::new(
    12.5,
    description,
    "Food",
    Some("2025-02-11".to_string()),
    "1",
    None,
  )
  .unwrap()
}

pub fn expense(id: &str, description: &str) -> Expense {
  let mut record = Expense::provisional(id, &new_expense(description));
  record.created_at = "2025-02-11T00:00:00Z".to_string();
  record
}

impl FakeApi {
  pub fn with_records(records: Vec<Expense>) -> Self {
    let api = Self::default();
    api.state.lock().unwrap().records = records;
    api
  }

  pub fn add_user(&self, username: &str, password: &str) {
    let mut state = self.state.lock().unwrap();
    let id = (state.users.len() + 1).to_string();
    state.users.push(User {
      id,
      username: username.to_string(),
      password: password.to_string(),
      created_at: String::new(),
    });
  }

  /// Every call fails with `failure` until [`FakeApi::recover`].
  pub fn fail_all(&self, failure: Failure) {
    self.state.lock().unwrap().failure = Some(failure);
  }

  /// Creates and updates whose description matches fail with `failure`.
  pub fn fail_when(&self, predicate: impl Fn(&str) -> bool + Send + 'static, failure: Failure) {
    self.state.lock().unwrap().fail_when = Some((Box::new(predicate), failure));
  }

  pub fn recover(&self) {
    let mut state = self.state.lock().unwrap();
    state.failure = None;
    state.fail_when = None;
  }

  pub fn set_delay(&self, delay: Duration) {
    self.state.lock().unwrap().delay = Some(delay);
  }

  pub fn calls(&self) -> usize {
    self.state.lock().unwrap().calls
  }

  pub fn created(&self) -> Vec<Expense> {
    self.state.lock().unwrap().created.clone()
  }

  pub fn deleted(&self) -> Vec<String> {
    self.state.lock().unwrap().deleted.clone()
  }

  pub fn records(&self) -> Vec<Expense> {
    self.state.lock().unwrap().records.clone()
  }

  /// Count the call, wait out the configured delay, then apply failures.
  async fn begin(&self, description: Option<&str>) -> Result<(), ApiError> {
    let delay = {
      let mut state = self.state.lock().unwrap();
      state.calls += 1;
      state.delay
    };
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    let state = self.state.lock().unwrap();
    if let Some(failure) = state.failure {
      return Err(ApiError::from_failure(failure));
    }
    if let (Some((predicate, failure)), Some(description)) = (&state.fail_when, description) {
      if predicate(description) {
        return Err(ApiError::from_failure(*failure));
      }
    }
    Ok(())
  }
}

impl ExpenseApi for FakeApi {
  fn list_expenses(&self) -> BoxFuture<'_, Result<Vec<Expense>, ApiError>> {
    async move {
      self.begin(None).await?;
      Ok(self.records())
    }
    .boxed()
  }

  fn get_expense<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Expense, ApiError>> {
    async move {
      self.begin(None).await?;
      self
        .records()
        .into_iter()
        .find(|e| e.id == id)
        .ok_or_else(|| ApiError::from_failure(Failure::Status(404)))
    }
    .boxed()
  }

  fn create_expense<'a>(
    &'a self,
    data: &'a NewExpense,
  ) -> BoxFuture<'a, Result<Expense, ApiError>> {
    async move {
      self.begin(Some(&data.description)).await?;
      let mut state = self.state.lock().unwrap();
      state.next_id += 1;
      let record = Expense::provisional(&format!("srv-{}", state.next_id), data);
      state.records.insert(0, record.clone());
      state.created.push(record.clone());
      Ok(record)
    }
    .boxed()
  }

  fn update_expense<'a>(
    &'a self,
    id: &'a str,
    data: &'a NewExpense,
  ) -> BoxFuture<'a, Result<Expense, ApiError>> {
    async move {
      self.begin(Some(&data.description)).await?;
      let mut state = self.state.lock().unwrap();
      let record = state
        .records
        .iter_mut()
        .find(|e| e.id == id)
        .ok_or_else(|| ApiError::from_failure(Failure::Status(404)))?;
      record.apply(data);
      Ok(record.clone())
    }
    .boxed()
  }

  fn delete_expense<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ApiError>> {
    async move {
      self.begin(None).await?;
      let mut state = self.state.lock().unwrap();
      let index = state
        .records
        .iter()
        .position(|e| e.id == id)
        .ok_or_else(|| ApiError::from_failure(Failure::Status(404)))?;
      state.records.remove(index);
      state.deleted.push(id.to_string());
      Ok(())
    }
    .boxed()
  }

  fn find_users<'a>(&'a self, username: &'a str) -> BoxFuture<'a, Result<Vec<User>, ApiError>> {
    async move {
      self.begin(None).await?;
      Ok(
        self
          .state
          .lock()
          .unwrap()
          .users
          .iter()
          .filter(|u| u.username == username)
          .cloned()
          .collect(),
      )
    }
    .boxed()
  }
}
