use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::api::error::{ApiError, ErrorKind, Failure};
use crate::api::types::{Expense, NewExpense, User};
use crate::config::Config;

/// Single-attempt calls against the expenses backend.
///
/// Retries, caching and offline handling are layered on top by the caller.
pub trait ExpenseApi: Send + Sync {
  fn list_expenses(&self) -> BoxFuture<'_, Result<Vec<Expense>, ApiError>>;

  fn get_expense<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Expense, ApiError>>;

  fn create_expense<'a>(&'a self, data: &'a NewExpense)
    -> BoxFuture<'a, Result<Expense, ApiError>>;

  fn update_expense<'a>(
    &'a self,
    id: &'a str,
    data: &'a NewExpense,
  ) -> BoxFuture<'a, Result<Expense, ApiError>>;

  fn delete_expense<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ApiError>>;

  fn find_users<'a>(&'a self, username: &'a str) -> BoxFuture<'a, Result<Vec<User>, ApiError>>;
}

/// REST client for the expenses backend
#[derive(Clone)]
pub struct HttpExpenseApi {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpExpenseApi {
  pub fn new(config: &Config) -> color_eyre::Result<Self> {
    Self::with_base_url(
      &config.api.base_url,
      Duration::from_secs(config.api.timeout_secs),
    )
  }

  pub fn with_base_url(base_url: &str, timeout: Duration) -> color_eyre::Result<Self> {
    // A trailing slash makes `join` append instead of replacing the last segment
    let mut base = base_url.trim_end_matches('/').to_string();
    base.push('/');
    let base_url = Url::parse(&base)
      .map_err(|e| color_eyre::eyre::eyre!("Invalid API base URL {}: {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn url(&self, path: &str) -> Result<Url, ApiError> {
    self
      .base_url
      .join(path)
      .map_err(|e| ApiError::new(ErrorKind::Unknown, format!("Invalid endpoint {}: {}", path, e)))
  }

  /// Send a request and return the response if its status is a success.
  async fn send(
    &self,
    method: Method,
    url: Url,
    body: Option<&NewExpense>,
  ) -> Result<reqwest::Response, ApiError> {
    debug!(%method, %url, "sending request");

    let mut request = self.client.request(method.clone(), url.clone());
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await?;
    let status = response.status();
    debug!(%method, %url, %status, "received response");

    if status.is_success() {
      Ok(response)
    } else {
      Err(ApiError::from_failure(Failure::Status(status.as_u16())))
    }
  }

  async fn send_json<T: DeserializeOwned>(
    &self,
    method: Method,
    url: Url,
    body: Option<&NewExpense>,
  ) -> Result<T, ApiError> {
    let response = self.send(method, url, body).await?;
    Ok(response.json().await?)
  }
}

impl ExpenseApi for HttpExpenseApi {
  fn list_expenses(&self) -> BoxFuture<'_, Result<Vec<Expense>, ApiError>> {
    async move {
      let url = self.url("expenses")?;
      self.send_json(Method::GET, url, None).await
    }
    .boxed()
  }

  fn get_expense<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Expense, ApiError>> {
    async move {
      let url = self.url(&format!("expenses/{}", id))?;
      self.send_json(Method::GET, url, None).await
    }
    .boxed()
  }

  fn create_expense<'a>(
    &'a self,
    data: &'a NewExpense,
  ) -> BoxFuture<'a, Result<Expense, ApiError>> {
    async move {
      let url = self.url("expenses")?;
      self.send_json(Method::POST, url, Some(data)).await
    }
    .boxed()
  }

  fn update_expense<'a>(
    &'a self,
    id: &'a str,
    data: &'a NewExpense,
  ) -> BoxFuture<'a, Result<Expense, ApiError>> {
    async move {
      let url = self.url(&format!("expenses/{}", id))?;
      self.send_json(Method::PUT, url, Some(data)).await
    }
    .boxed()
  }

  fn delete_expense<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ApiError>> {
    async move {
      let url = self.url(&format!("expenses/{}", id))?;
      self.send(Method::DELETE, url, None).await?;
      Ok(())
    }
    .boxed()
  }

  fn find_users<'a>(&'a self, username: &'a str) -> BoxFuture<'a, Result<Vec<User>, ApiError>> {
    async move {
      let mut url = self.url("users")?;
      url.query_pairs_mut().append_pair("username", username);

      // The mock backend answers an unmatched filter with 404 rather than []
      match self.send_json(Method::GET, url, None).await {
        Err(err) if err.status == Some(StatusCode::NOT_FOUND.as_u16()) => Ok(Vec::new()),
        other => other,
      }
    }
    .boxed()
  }
}
