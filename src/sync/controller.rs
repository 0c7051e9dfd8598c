//! The expense data controller: the one entry point the UI calls.
//!
//! It composes the request executor, the pending-operation queue and the
//! connectivity monitor. Reads go through the executor (retry, then cache).
//! Mutations go straight to the backend while online and into the queue while
//! offline, with the local view updated immediately in the offline case.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connectivity::{ConnectivityMonitor, NetworkState, Transition};
use super::queue::{
  OperationPayload, PendingOperation, PendingQueue, ReplaySummary, LOCAL_ID_PREFIX,
};
use super::state::QueryState;
use crate::api::{Action, ApiError, ErrorKind, Expense, ExpenseApi, NewExpense, ResourceKey};
use crate::cache::{CacheStore, RequestExecutor};
use crate::config::Config;
use crate::db::{KeyValueStore, EXPENSES_SNAPSHOT_KEY, LAST_SYNC_KEY};

/// Whether `id` belongs to a record that only exists locally so far.
pub fn is_provisional(id: &str) -> bool {
  id.starts_with(LOCAL_ID_PREFIX)
}

/// Apply queued operations to a list fetched from the backend or cache.
fn overlay(mut records: Vec<Expense>, pending: &[PendingOperation]) -> Vec<Expense> {
  for op in pending {
    match &op.payload {
      OperationPayload::Create(data) => {
        if !records.iter().any(|r| r.id == op.id) {
          records.insert(0, Expense::provisional(&op.id, data));
        }
      }
      OperationPayload::Update { id, expense } => {
        if let Some(record) = records.iter_mut().find(|r| r.id == *id) {
          record.apply(expense);
        }
      }
      OperationPayload::Delete { id } => records.retain(|r| r.id != *id),
    }
  }
  records
}

/// A message for the user about the last action.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
  pub kind: Option<ErrorKind>,
  pub message: String,
}

/// Everything the UI renders from.
#[derive(Debug, Clone, Default)]
pub struct ViewState {
  pub expenses: QueryState<Vec<Expense>>,
  pub current: QueryState<Expense>,
  pub notice: Option<Notice>,
}

impl ViewState {
  pub fn expenses(&self) -> &[Expense] {
    self.expenses.data().map(Vec::as_slice).unwrap_or_default()
  }
}

/// Sync indicator state, published on a watch channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
  pub is_offline: bool,
  pub pending_count: usize,
  pub is_syncing: bool,
  pub last_sync: Option<DateTime<Utc>>,
}

/// The last complete list the backend returned, kept current with the
/// mutations it has confirmed since.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSnapshot {
  expenses: Vec<Expense>,
  /// When the backend produced the list
  fetched_at: DateTime<Utc>,
}

pub struct ExpenseController {
  api: Arc<dyn ExpenseApi>,
  storage: Arc<dyn KeyValueStore>,
  executor: RequestExecutor,
  queue: PendingQueue,
  monitor: ConnectivityMonitor,
  view: Mutex<ViewState>,
  snapshot: Mutex<Option<ListSnapshot>>,
  max_age: chrono::Duration,
  status: watch::Sender<SyncStatus>,
}

impl ExpenseController {
  pub fn new(
    api: Arc<dyn ExpenseApi>,
    storage: Arc<dyn KeyValueStore>,
    config: &Config,
    network: NetworkState,
  ) -> Arc<Self> {
    let executor = RequestExecutor::new(CacheStore::new(storage.clone()))
      .with_policy(config.retry.policy())
      .with_max_age(config.cache.max_age());
    let queue = PendingQueue::new(storage.clone()).with_max_retries(config.queue.max_retries);

    let (status, _rx) = watch::channel(SyncStatus {
      is_offline: !network.is_online(),
      ..SyncStatus::default()
    });

    Arc::new(Self {
      api,
      storage,
      executor,
      queue,
      monitor: ConnectivityMonitor::new(network),
      view: Mutex::new(ViewState::default()),
      snapshot: Mutex::new(None),
      max_age: config.cache.max_age(),
      status,
    })
  }

  pub fn executor(&self) -> &RequestExecutor {
    &self.executor
  }

  pub fn api(&self) -> &dyn ExpenseApi {
    self.api.as_ref()
  }

  /// Snapshot of the render state.
  pub fn view(&self) -> ViewState {
    self.lock_view().clone()
  }

  pub fn status(&self) -> SyncStatus {
    self.status.borrow().clone()
  }

  pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
    self.status.subscribe()
  }

  pub fn is_offline(&self) -> bool {
    self.status.borrow().is_offline
  }

  pub async fn pending_operations(&self) -> Vec<PendingOperation> {
    self.queue.snapshot().await
  }

  fn lock_view(&self) -> MutexGuard<'_, ViewState> {
    // Poisoning is ignored; the view is plain data
    self.view.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn lock_snapshot(&self) -> MutexGuard<'_, Option<ListSnapshot>> {
    self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_offline(&self, offline: bool) {
    self.status.send_if_modified(|s| {
      let changed = s.is_offline != offline;
      s.is_offline = offline;
      changed
    });
  }

  fn set_notice(&self, kind: Option<ErrorKind>, message: impl Into<String>) {
    let message = message.into();
    debug!(?kind, %message, "notice");
    self.lock_view().notice = Some(Notice { kind, message });
  }

  async fn publish_pending(&self) {
    let count = self.queue.len().await;
    self.status.send_modify(|s| s.pending_count = count);
  }

  fn record_sync(&self, at: DateTime<Utc>) {
    if let Err(e) = self.storage.set(LAST_SYNC_KEY, &at.to_rfc3339()) {
      warn!(error = %e, "failed to persist last sync time");
    }
    self.status.send_modify(|s| s.last_sync = Some(at));
  }

  /// Restore queued operations and the last sync time after a restart.
  pub async fn load_pending(&self) -> color_eyre::Result<usize> {
    let count = self.queue.load().await?;

    let last_sync = self
      .storage
      .get(LAST_SYNC_KEY)?
      .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
      .map(|dt| dt.with_timezone(&Utc));
    self.status.send_modify(|s| {
      s.pending_count = count;
      s.last_sync = last_sync;
    });

    // Seed the list from the last known snapshot, then layer queued effects on top
    let snapshot = self.read_snapshot();
    if snapshot.is_some() || count > 0 {
      let (records, synced_at) = snapshot
        .as_ref()
        .map(|s| (s.expenses.clone(), Some(s.fetched_at)))
        .unwrap_or_default();
      self.show_list(records, synced_at, true).await;
    }
    *self.lock_snapshot() = snapshot;

    Ok(count)
  }

  fn read_snapshot(&self) -> Option<ListSnapshot> {
    let json = match self.storage.get(EXPENSES_SNAPSHOT_KEY) {
      Ok(json) => json?,
      Err(e) => {
        warn!(error = %e, "failed to read expense snapshot");
        return None;
      }
    };
    match serde_json::from_str(&json) {
      Ok(snapshot) => Some(snapshot),
      Err(e) => {
        warn!(error = %e, "ignoring unreadable expense snapshot");
        None
      }
    }
  }

  fn write_snapshot(&self, snapshot: ListSnapshot) {
    let result = serde_json::to_string(&snapshot)
      .map_err(|e| color_eyre::eyre::eyre!("Failed to serialize expense snapshot: {}", e))
      .and_then(|json| self.storage.set(EXPENSES_SNAPSHOT_KEY, &json));
    if let Err(e) = result {
      warn!(error = %e, "failed to persist expense snapshot");
    }
    *self.lock_snapshot() = Some(snapshot);
  }

  /// Apply a backend-confirmed mutation to the list snapshot.
  ///
  /// The cached list response is rewritten only while the snapshot is within
  /// the cache max age; an older snapshot never re-enters the cache.
  fn confirm(&self, change: impl FnOnce(&mut Vec<Expense>)) {
    let updated = {
      let mut guard = self.lock_snapshot();
      let Some(snapshot) = guard.as_mut() else {
        return;
      };
      change(&mut snapshot.expenses);
      snapshot.clone()
    };

    if Utc::now() - updated.fetched_at <= self.max_age {
      let cache = self.executor.cache();
      if let Err(e) = cache.put(&ResourceKey::AllExpenses, &updated.expenses) {
        warn!(error = %e, "failed to update cached expense list");
      }
    }
    self.write_snapshot(updated);
  }

  /// Publish `records` with queued operations layered on top.
  async fn show_list(
    &self,
    records: Vec<Expense>,
    synced_at: Option<DateTime<Utc>>,
    stale: bool,
  ) -> Vec<Expense> {
    loop {
      let revision = self.queue.revision();
      let merged = overlay(records.clone(), &self.queue.snapshot().await);
      {
        let mut view = self.lock_view();
        // Retry if an operation was queued after the snapshot was taken
        if self.queue.revision() == revision {
          view.expenses.succeed(merged.clone(), synced_at, stale);
          return merged;
        }
      }
    }
  }

  /// Load the expense list, optionally only one user's expenses.
  pub async fn fetch_expenses(&self, user_id: Option<&str>) -> Result<Vec<Expense>, ApiError> {
    let had_data = {
      let mut view = self.lock_view();
      view.expenses.start_loading();
      view.notice = None;
      view.expenses.data().is_some_and(|d| !d.is_empty())
    };

    let result = self
      .executor
      .execute_cached(&ResourceKey::AllExpenses, || self.api.list_expenses())
      .await;

    match result {
      Ok(fetched) => {
        let stale = fetched.is_stale();
        let synced_at = if stale {
          fetched.cached_at
        } else {
          Some(Utc::now())
        };

        let mut records = fetched.data;
        if let Some(fetched_at) = synced_at {
          // The snapshot always holds the unfiltered list
          self.write_snapshot(ListSnapshot {
            expenses: records.clone(),
            fetched_at,
          });
        }
        if let Some(user_id) = user_id {
          records.retain(|e| e.user_id.as_deref() == Some(user_id));
        }
        let records = self.show_list(records, synced_at, stale).await;

        if let (false, Some(at)) = (stale, synced_at) {
          self.record_sync(at);
        }
        info!(count = records.len(), stale, "expenses loaded");
        Ok(records)
      }
      Err(err) => {
        let message = if err.kind == ErrorKind::NetworkError && had_data {
          "Unable to refresh. Showing cached data."
        } else {
          err.kind.user_message(Action::FetchList)
        };
        if err.kind == ErrorKind::NetworkError {
          self.set_offline(true);
        }
        {
          let mut view = self.lock_view();
          view.expenses.fail(err.kind, message);
          view.notice = Some(Notice {
            kind: Some(err.kind),
            message: message.to_string(),
          });
        }
        warn!(kind = %err.kind, "failed to load expenses");
        Err(err)
      }
    }
  }

  /// Load one expense. Falls back to the locally held list when the backend fails.
  pub async fn fetch_expense(&self, id: &str) -> Result<Expense, ApiError> {
    self.lock_view().current.start_loading();

    let local = self
      .lock_view()
      .expenses()
      .iter()
      .find(|e| e.id == id)
      .cloned();

    if is_provisional(id) {
      return match local {
        Some(expense) => {
          self
            .lock_view()
            .current
            .succeed(expense.clone(), None, true);
          Ok(expense)
        }
        None => {
          let err = ApiError::new(ErrorKind::NotFound, "Expense not found.");
          self.lock_view().current.fail(err.kind, &err.message);
          Err(err)
        }
      };
    }

    let key = ResourceKey::Expense { id: id.to_string() };
    let result = self
      .executor
      .execute_cached(&key, || self.api.get_expense(id))
      .await;
    match result {
      Ok(fetched) => {
        let synced_at = fetched.cached_at.or_else(|| Some(Utc::now()));
        let stale = fetched.is_stale();
        self
          .lock_view()
          .current
          .succeed(fetched.data.clone(), synced_at, stale);
        Ok(fetched.data)
      }
      Err(err) => match local {
        Some(expense) if err.kind != ErrorKind::NotFound => {
          {
            let mut view = self.lock_view();
            view.current.succeed(expense.clone(), None, true);
            view.notice = Some(Notice {
              kind: Some(ErrorKind::NetworkError),
              message: "Showing cached data (offline)".to_string(),
            });
          }
          Ok(expense)
        }
        _ => {
          let message = err.kind.user_message(Action::FetchOne);
          {
            let mut view = self.lock_view();
            view.current.fail(err.kind, message);
            view.notice = Some(Notice {
              kind: Some(err.kind),
              message: message.to_string(),
            });
          }
          Err(err)
        }
      },
    }
  }

  /// Create an expense. While offline the returned record is provisional.
  pub async fn create_expense(&self, data: NewExpense) -> Result<Expense, ApiError> {
    self.lock_view().notice = None;

    if self.is_offline() {
      return Ok(self.create_offline(data).await);
    }

    let result = self.executor.execute(|| self.api.create_expense(&data)).await;
    match result {
      Ok(created) => {
        let expense = created.data;
        self
          .lock_view()
          .expenses
          .data_or_default()
          .insert(0, expense.clone());
        let confirmed = expense.clone();
        self.confirm(move |list| list.insert(0, confirmed));
        info!(id = %expense.id, "expense created");
        Ok(expense)
      }
      Err(err) if err.kind == ErrorKind::NetworkError => {
        // One hop to the offline path; it never touches the network
        info!("network unavailable, queueing create");
        self.set_offline(true);
        Ok(self.create_offline(data).await)
      }
      Err(err) => {
        self.set_notice(Some(err.kind), err.kind.user_message(Action::Create));
        Err(err)
      }
    }
  }

  async fn create_offline(&self, data: NewExpense) -> Expense {
    let operation = self
      .queue
      .enqueue(OperationPayload::Create(data.clone()))
      .await;
    let expense = Expense::provisional(&operation.id, &data);
    {
      let mut view = self.lock_view();
      // A concurrent refresh may already have overlaid it
      let list = view.expenses.data_or_default();
      if !list.iter().any(|e| e.id == expense.id) {
        list.insert(0, expense.clone());
      }
    }
    self.publish_pending().await;
    expense
  }

  /// Replace an expense's fields.
  pub async fn update_expense(&self, id: &str, data: NewExpense) -> Result<Expense, ApiError> {
    self.lock_view().notice = None;

    if self.is_offline() || is_provisional(id) {
      return self.update_offline(id, data).await;
    }

    let result = self.executor.execute(|| self.api.update_expense(id, &data)).await;
    match result {
      Ok(updated) => {
        let expense = updated.data;
        self.replace_local(id, expense.clone());
        self.confirm(|list| {
          if let Some(record) = list.iter_mut().find(|e| e.id == id) {
            *record = expense.clone();
          }
        });
        Ok(expense)
      }
      Err(err) if err.kind == ErrorKind::NetworkError => {
        info!("network unavailable, queueing update");
        self.set_offline(true);
        self.update_offline(id, data).await
      }
      Err(err) => {
        self.set_notice(Some(err.kind), err.kind.user_message(Action::Update));
        Err(err)
      }
    }
  }

  async fn update_offline(&self, id: &str, data: NewExpense) -> Result<Expense, ApiError> {
    let updated = {
      let mut view = self.lock_view();
      let record = view
        .expenses
        .data_mut()
        .and_then(|list| list.iter_mut().find(|e| e.id == id));
      match record {
        Some(record) => {
          record.apply(&data);
          Some(record.clone())
        }
        None => None,
      }
    };

    let Some(expense) = updated else {
      let err = ApiError::new(ErrorKind::NotFound, "Expense not found.");
      self.set_notice(Some(err.kind), err.kind.user_message(Action::FetchOne));
      return Err(err);
    };

    self
      .queue
      .enqueue(OperationPayload::Update {
        id: id.to_string(),
        expense: data,
      })
      .await;
    self.publish_pending().await;
    Ok(expense)
  }

  /// Delete an expense.
  pub async fn delete_expense(&self, id: &str) -> Result<(), ApiError> {
    self.lock_view().notice = None;

    if self.is_offline() || is_provisional(id) {
      self.delete_offline(id).await;
      return Ok(());
    }

    let result = self.executor.execute(|| self.api.delete_expense(id)).await;
    match result {
      Ok(_) => {
        self.remove_local(id);
        self.confirm(|list| list.retain(|e| e.id != id));
        info!(id, "expense deleted");
        Ok(())
      }
      Err(err) if err.kind == ErrorKind::NotFound => {
        // Already gone: the desired end state holds
        self.remove_local(id);
        self.confirm(|list| list.retain(|e| e.id != id));
        self.set_notice(Some(err.kind), err.kind.user_message(Action::Delete));
        Ok(())
      }
      Err(err) if err.kind == ErrorKind::NetworkError => {
        info!("network unavailable, queueing delete");
        self.set_offline(true);
        self.delete_offline(id).await;
        Ok(())
      }
      Err(err) => {
        self.set_notice(Some(err.kind), err.kind.user_message(Action::Delete));
        Err(err)
      }
    }
  }

  async fn delete_offline(&self, id: &str) {
    self.remove_local(id);

    // A record that never reached the backend only needs its create withdrawn
    if is_provisional(id) && self.queue.cancel(id).await.is_some() {
      debug!(id, "withdrew queued create");
    } else {
      self
        .queue
        .enqueue(OperationPayload::Delete { id: id.to_string() })
        .await;
    }
    self.publish_pending().await;
  }

  fn remove_local(&self, id: &str) {
    let mut view = self.lock_view();
    if let Some(list) = view.expenses.data_mut() {
      list.retain(|e| e.id != id);
    }
    if view.current.data().is_some_and(|e| e.id == id) {
      view.current = QueryState::Empty;
    }
  }

  fn replace_local(&self, id: &str, expense: Expense) {
    let mut view = self.lock_view();
    if let Some(record) = view
      .expenses
      .data_mut()
      .and_then(|list| list.iter_mut().find(|e| e.id == id))
    {
      *record = expense.clone();
    }
    if view.current.data().is_some_and(|e| e.id == id) {
      view.current.succeed(expense, Some(Utc::now()), false);
    }
  }

  /// Replay queued operations and reconcile the view with the results.
  pub async fn sync_pending(&self) -> ReplaySummary {
    self.status.send_modify(|s| s.is_syncing = true);

    let summary = self.queue.replay(&self.executor, self.api.as_ref()).await;

    for (provisional_id, expense) in &summary.created {
      self.replace_local(provisional_id, expense.clone());
      self.confirm(|list| {
        if !list.iter().any(|e| e.id == expense.id) {
          list.insert(0, expense.clone());
        }
      });
    }
    self.publish_pending().await;

    let replayed = summary.succeeded + summary.moot + summary.dropped.len();
    if replayed > 0 {
      // Pick up server-side ids and anything changed elsewhere
      if let Err(err) = self.fetch_expenses(None).await {
        debug!(kind = %err.kind, "refresh after sync failed");
      }
    }

    if let Some(message) = summary.failure_message() {
      let message = if summary.remaining.is_empty() {
        message
      } else {
        format!("{}. {} will be retried.", message, summary.remaining.len())
      };
      self.set_notice(None, message);
    } else if !summary.remaining.is_empty() {
      self.set_notice(
        Some(ErrorKind::NetworkError),
        format!(
          "{} operations synced successfully. {} failed and will be retried.",
          summary.succeeded,
          summary.remaining.len()
        ),
      );
    } else if replayed > 0 {
      self.set_offline(false);
    }

    self.status.send_modify(|s| s.is_syncing = false);
    summary
  }

  /// Feed a reachability change. Returns the replay task when a reconnect
  /// started one; at most one replay runs at a time.
  pub async fn on_network_change(
    self: &Arc<Self>,
    state: NetworkState,
  ) -> Option<JoinHandle<ReplaySummary>> {
    let transition = self.monitor.update(state);
    match transition {
      Transition::WentOffline => {
        self.set_offline(true);
        None
      }
      Transition::Unchanged => None,
      Transition::CameOnline => {
        self.set_offline(false);
        if self.queue.is_empty().await {
          return None;
        }
        let Some(guard) = self.monitor.try_begin_replay() else {
          debug!("replay already in flight");
          return None;
        };

        let controller = Arc::clone(self);
        Some(tokio::spawn(async move {
          let _guard = guard;
          controller.sync_pending().await
        }))
      }
    }
  }

  /// Re-run the list fetch if the last failure was a network error.
  pub async fn retry_last(&self) -> Option<Result<Vec<Expense>, ApiError>> {
    let kind = self.lock_view().notice.as_ref().and_then(|n| n.kind);
    self.clear_error();
    if kind == Some(ErrorKind::NetworkError) {
      Some(self.fetch_expenses(None).await)
    } else {
      None
    }
  }

  pub fn clear_error(&self) {
    self.lock_view().notice = None;
  }
}
