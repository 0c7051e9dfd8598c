//! Durable FIFO of mutations recorded while offline.
//!
//! Operations are appended by [`PendingQueue::enqueue`] and resubmitted by
//! [`PendingQueue::replay`]. The whole queue is rewritten to storage after
//! every change, so an interrupted replay pass loses at most the outcome of
//! the operation that was in flight (it is sent again on the next pass).

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, Expense, ExpenseApi, NewExpense};
use crate::cache::RequestExecutor;
use crate::db::{KeyValueStore, PENDING_OPERATIONS_KEY};

/// Prefix of locally generated operation ids. Provisional records share the id.
pub const LOCAL_ID_PREFIX: &str = "tmp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

/// What a queued operation does when replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "UPPERCASE")]
pub enum OperationPayload {
  Create(NewExpense),
  Update { id: String, expense: NewExpense },
  Delete { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
  pub id: String,
  #[serde(flatten)]
  pub payload: OperationPayload,
  pub enqueued_at: DateTime<Utc>,
  #[serde(default)]
  pub retry_count: u32,
}

impl PendingOperation {
  pub fn kind(&self) -> OperationKind {
    match self.payload {
      OperationPayload::Create(_) => OperationKind::Create,
      OperationPayload::Update { .. } => OperationKind::Update,
      OperationPayload::Delete { .. } => OperationKind::Delete,
    }
  }

  /// The expense id this operation targets, if it targets an existing one.
  pub fn target_id(&self) -> Option<&str> {
    match &self.payload {
      OperationPayload::Create(_) => None,
      OperationPayload::Update { id, .. } | OperationPayload::Delete { id } => Some(id),
    }
  }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default)]
pub struct ReplaySummary {
  /// Operations the backend accepted
  pub succeeded: usize,
  /// Operations dropped because the backend said they no longer apply
  pub moot: usize,
  /// Operations dropped after exhausting their retry budget
  pub dropped: Vec<PendingOperation>,
  /// Operations kept for the next pass, in queue order
  pub remaining: Vec<PendingOperation>,
  /// Provisional id and server record for each replayed create
  pub created: Vec<(String, Expense)>,
}

impl ReplaySummary {
  pub fn is_noop(&self) -> bool {
    self.succeeded == 0 && self.moot == 0 && self.dropped.is_empty()
  }

  /// One user-facing notice covering every dropped operation.
  pub fn failure_message(&self) -> Option<String> {
    match self.dropped.len() {
      0 => None,
      1 => Some("1 operation failed and was dropped".to_string()),
      n => Some(format!("{} operations failed and were dropped", n)),
    }
  }
}

#[derive(Default)]
struct QueueState {
  operations: Vec<PendingOperation>,
  last_id: i64,
  /// Operation currently being sent by a replay pass
  in_flight: Option<String>,
  /// In-flight creates whose provisional record was deleted meanwhile
  cancelled: HashSet<String>,
}

impl QueueState {
  fn next_id(&mut self) -> String {
    let now = Utc::now().timestamp_millis();
    self.last_id = now.max(self.last_id + 1);
    format!("{}{}", LOCAL_ID_PREFIX, self.last_id)
  }

  fn position(&self, id: &str) -> Option<usize> {
    self.operations.iter().position(|op| op.id == id)
  }

  /// Point queued updates and deletes of a provisional record at its server id.
  fn remap_target(&mut self, provisional_id: &str, server_id: &str) {
    for op in &mut self.operations {
      match &mut op.payload {
        OperationPayload::Update { id, .. } | OperationPayload::Delete { id }
          if *id == provisional_id =>
        {
          *id = server_id.to_string();
        }
        _ => {}
      }
    }
  }
}

/// Pending-operation queue. All state transitions go through one lock.
pub struct PendingQueue {
  storage: Arc<dyn KeyValueStore>,
  state: Mutex<QueueState>,
  /// Serializes replay passes
  replay_lock: Mutex<()>,
  /// Bumped on every change to the stored operations
  revision: AtomicU64,
  max_retries: u32,
}

impl PendingQueue {
  pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
    Self {
      storage,
      state: Mutex::new(QueueState::default()),
      replay_lock: Mutex::new(()),
      revision: AtomicU64::new(0),
      max_retries: 3,
    }
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries.max(1);
    self
  }

  /// Restore the queue from storage, replacing the in-memory state.
  pub async fn load(&self) -> Result<usize> {
    let operations: Vec<PendingOperation> = match self.storage.get(PENDING_OPERATIONS_KEY)? {
      Some(json) => serde_json::from_str(&json)
        .map_err(|e| eyre!("Failed to parse pending operations: {}", e))?,
      None => Vec::new(),
    };

    let last_id = operations
      .iter()
      .filter_map(|op| op.id.strip_prefix(LOCAL_ID_PREFIX)?.parse::<i64>().ok())
      .max()
      .unwrap_or(0);

    let mut state = self.state.lock().await;
    state.last_id = state.last_id.max(last_id);
    state.operations = operations;
    self.revision.fetch_add(1, Ordering::AcqRel);
    info!(count = state.operations.len(), "loaded pending operations");
    Ok(state.operations.len())
  }

  /// Append an operation and persist the queue.
  pub async fn enqueue(&self, payload: OperationPayload) -> PendingOperation {
    let mut state = self.state.lock().await;
    let operation = PendingOperation {
      id: state.next_id(),
      payload,
      enqueued_at: Utc::now(),
      retry_count: 0,
    };
    state.operations.push(operation.clone());
    self.persist(&state.operations);

    info!(
      id = %operation.id,
      kind = ?operation.kind(),
      pending = state.operations.len(),
      "queued operation"
    );
    operation
  }

  /// Remove an operation that has not been replayed yet.
  pub async fn cancel(&self, id: &str) -> Option<PendingOperation> {
    let mut state = self.state.lock().await;
    let index = state.position(id)?;
    let operation = state.operations.remove(index);
    if state.in_flight.as_deref() == Some(id) {
      state.cancelled.insert(id.to_string());
    }
    self.persist(&state.operations);

    info!(id, kind = ?operation.kind(), "cancelled pending operation");
    Some(operation)
  }

  pub async fn len(&self) -> usize {
    self.state.lock().await.operations.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }

  /// Current operations in queue order.
  pub async fn snapshot(&self) -> Vec<PendingOperation> {
    self.state.lock().await.operations.clone()
  }

  /// Resubmit every queued operation once, in FIFO order.
  ///
  /// Operations enqueued while the pass runs are kept for the next pass.
  /// Passes never overlap: a second caller waits for the first to finish.
  pub async fn replay(&self, executor: &RequestExecutor, api: &dyn ExpenseApi) -> ReplaySummary {
    let _pass = self.replay_lock.lock().await;

    let batch = {
      let mut state = self.state.lock().await;
      state.in_flight = None;
      state.cancelled.clear();
      state.operations.clone()
    };

    let mut summary = ReplaySummary::default();
    if batch.is_empty() {
      debug!("replay requested with an empty queue");
      return summary;
    }
    info!(count = batch.len(), "replaying pending operations");

    for id in batch.iter().map(|op| op.id.clone()) {
      // Re-read: earlier creates in this pass may have remapped its target id
      let operation = {
        let mut state = self.state.lock().await;
        let Some(index) = state.position(&id) else {
          // Cancelled before its turn
          continue;
        };
        state.in_flight = Some(id.clone());
        state.operations[index].clone()
      };

      let outcome = Self::send(executor, api, &operation).await;

      let mut state = self.state.lock().await;
      state.in_flight = None;
      let cancelled = state.cancelled.remove(&operation.id);

      match outcome {
        Ok(created) => {
          summary.succeeded += 1;
          if let Some(index) = state.position(&operation.id) {
            state.operations.remove(index);
          }
          if let Some(expense) = created {
            if cancelled {
              // Deleted locally while the create was in flight: undo it remotely.
              let id = state.next_id();
              state.operations.push(PendingOperation {
                id,
                payload: OperationPayload::Delete {
                  id: expense.id.clone(),
                },
                enqueued_at: Utc::now(),
                retry_count: 0,
              });
            } else {
              state.remap_target(&operation.id, &expense.id);
              summary.created.push((operation.id.clone(), expense));
            }
          }
          debug!(id = %operation.id, "replayed operation");
        }
        Err(err) if err.kind.is_moot() => {
          summary.moot += 1;
          if let Some(index) = state.position(&operation.id) {
            state.operations.remove(index);
          }
          info!(id = %operation.id, kind = %err.kind, "dropping operation that no longer applies");
        }
        Err(err) => {
          let retry_count = operation.retry_count + 1;
          if let Some(index) = state.position(&operation.id) {
            if retry_count < self.max_retries {
              state.operations[index].retry_count = retry_count;
              debug!(
                id = %operation.id,
                retry_count,
                kind = %err.kind,
                "operation kept for next pass"
              );
            } else {
              let mut dropped = state.operations.remove(index);
              dropped.retry_count = retry_count;
              warn!(
                id = %operation.id,
                retry_count,
                kind = %err.kind,
                "operation exceeded retry budget, dropping"
              );
              summary.dropped.push(dropped);
            }
          }
        }
      }

      self.persist(&state.operations);
    }

    summary.remaining = self.snapshot().await;
    info!(
      succeeded = summary.succeeded,
      moot = summary.moot,
      dropped = summary.dropped.len(),
      remaining = summary.remaining.len(),
      "replay pass finished"
    );
    summary
  }

  /// One attempt at the backend call behind `operation`. Creates return the server record.
  async fn send(
    executor: &RequestExecutor,
    api: &dyn ExpenseApi,
    operation: &PendingOperation,
  ) -> Result<Option<Expense>, ApiError> {
    match &operation.payload {
      OperationPayload::Create(data) => executor
        .attempt(api.create_expense(data))
        .await
        .map(Some),
      OperationPayload::Update { id, expense } => executor
        .attempt(api.update_expense(id, expense))
        .await
        .map(|_| None),
      OperationPayload::Delete { id } => executor
        .attempt(api.delete_expense(id))
        .await
        .map(|_| None),
    }
  }

  /// Changes whenever the set of queued operations changes.
  pub fn revision(&self) -> u64 {
    self.revision.load(Ordering::Acquire)
  }

  /// Replace the stored queue with `operations`.
  fn persist(&self, operations: &[PendingOperation]) {
    self.revision.fetch_add(1, Ordering::AcqRel);
    let result = serde_json::to_string(operations)
      .map_err(|e| eyre!("Failed to serialize pending operations: {}", e))
      .and_then(|json| self.storage.set(PENDING_OPERATIONS_KEY, &json));

    if let Err(e) = result {
      error!(error = %e, "failed to persist pending operations");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStore;
  use crate::db::MemoryStore;
  use crate::api::error::Failure;
  use crate::sync::testing::{new_expense, FakeApi};

  fn sequence(id: &str) -> i64 {
    id.strip_prefix(LOCAL_ID_PREFIX).unwrap().parse().unwrap()
  }

  fn setup() -> (Arc<MemoryStore>, PendingQueue, RequestExecutor) {
    let kv = Arc::new(MemoryStore::new());
    let queue = PendingQueue::new(kv.clone());
    let executor = RequestExecutor::new(CacheStore::new(kv.clone()));
    (kv, queue, executor)
  }

  #[tokio::test]
  async fn test_enqueue_persists_in_order_with_unique_ids() {
    let (kv, queue, _) = setup();

    let a = queue.enqueue(OperationPayload::Create(new_expense("a"))).await;
    let b = queue.enqueue(OperationPayload::Create(new_expense("b"))).await;
    let c = queue
      .enqueue(OperationPayload::Delete { id: "5".into() })
      .await;

    assert!(sequence(&a.id) < sequence(&b.id));
    assert!(sequence(&b.id) < sequence(&c.id));

    let stored: Vec<PendingOperation> =
      serde_json::from_str(&kv.get(PENDING_OPERATIONS_KEY).unwrap().unwrap()).unwrap();
    let ids: Vec<_> = stored.iter().map(|op| op.id.clone()).collect();
    assert_eq!(ids, vec![a.id, b.id, c.id]);
    assert_eq!(stored[2].kind(), OperationKind::Delete);
  }

  #[tokio::test]
  async fn test_queue_survives_reload() {
    let (kv, queue, _) = setup();
    let op = queue.enqueue(OperationPayload::Create(new_expense("a"))).await;

    let reloaded = PendingQueue::new(kv.clone());
    assert_eq!(reloaded.load().await.unwrap(), 1);
    assert_eq!(reloaded.snapshot().await, vec![op.clone()]);

    // Ids keep increasing after a reload
    let next = reloaded
      .enqueue(OperationPayload::Delete { id: "1".into() })
      .await;
    assert!(sequence(&next.id) > sequence(&op.id));
  }

  #[tokio::test]
  async fn test_replay_all_succeed_empties_queue() {
    let (kv, queue, executor) = setup();
    let api = FakeApi::default();
    for name in ["a", "b", "c"] {
      queue.enqueue(OperationPayload::Create(new_expense(name))).await;
    }

    let summary = queue.replay(&executor, &api).await;
    assert_eq!(summary.succeeded, 3);
    assert!(summary.remaining.is_empty());
    assert_eq!(summary.created.len(), 3);
    assert!(queue.is_empty().await);
    assert_eq!(kv.get(PENDING_OPERATIONS_KEY).unwrap().as_deref(), Some("[]"));

    // Creates went out in enqueue order
    let descriptions: Vec<_> = api
      .created()
      .iter()
      .map(|e| e.description.clone())
      .collect();
    assert_eq!(descriptions, vec!["a", "b", "c"]);
  }

  #[tokio::test]
  async fn test_replay_of_empty_queue_is_noop() {
    let (_, queue, executor) = setup();
    let api = FakeApi::default();

    let summary = queue.replay(&executor, &api).await;
    assert!(summary.is_noop());
    assert!(summary.remaining.is_empty());
    assert_eq!(api.calls(), 0);
  }

  #[tokio::test]
  async fn test_retryable_failure_dropped_after_three_passes() {
    let (_, queue, executor) = setup();
    let api = FakeApi::default();
    api.fail_all(Failure::NoResponse { aborted: false });
    queue.enqueue(OperationPayload::Create(new_expense("a"))).await;

    for pass in 1..=2 {
      let summary = queue.replay(&executor, &api).await;
      assert!(summary.dropped.is_empty());
      assert_eq!(summary.remaining.len(), 1);
      assert_eq!(summary.remaining[0].retry_count, pass);
    }

    let summary = queue.replay(&executor, &api).await;
    assert_eq!(summary.dropped.len(), 1);
    assert_eq!(summary.dropped[0].retry_count, 3);
    assert_eq!(
      summary.failure_message().as_deref(),
      Some("1 operation failed and was dropped")
    );
    assert!(queue.is_empty().await);

    // No fourth attempt
    queue.replay(&executor, &api).await;
    assert_eq!(api.calls(), 3);
  }

  #[tokio::test]
  async fn test_delete_of_missing_resource_is_moot() {
    let (_, queue, executor) = setup();
    let api = FakeApi::default();
    api.fail_all(Failure::Status(404));
    queue
      .enqueue(OperationPayload::Delete { id: "gone".into() })
      .await;

    let summary = queue.replay(&executor, &api).await;
    assert_eq!(summary.moot, 1);
    assert_eq!(summary.succeeded, 0);
    assert!(summary.dropped.is_empty());
    assert!(summary.failure_message().is_none());
    assert!(queue.is_empty().await);
  }

  #[tokio::test]
  async fn test_mixed_outcomes_keep_fifo_order() {
    let (_, queue, executor) = setup();
    let api = FakeApi::default();
    let first = queue.enqueue(OperationPayload::Create(new_expense("fail"))).await;
    queue.enqueue(OperationPayload::Create(new_expense("ok"))).await;
    let third = queue
      .enqueue(OperationPayload::Update {
        id: "3".into(),
        expense: new_expense("fail too"),
      })
      .await;
    api.fail_when(|description| description.starts_with("fail"), Failure::Status(503));

    let summary = queue.replay(&executor, &api).await;
    assert_eq!(summary.succeeded, 1);
    let remaining: Vec<_> = summary.remaining.iter().map(|op| op.id.clone()).collect();
    assert_eq!(remaining, vec![first.id, third.id]);
  }

  #[tokio::test]
  async fn test_unauthorized_counts_against_budget() {
    let (_, queue, executor) = setup();
    let api = FakeApi::default();
    api.fail_all(Failure::Status(401));
    queue.enqueue(OperationPayload::Create(new_expense("a"))).await;

    let summary = queue.replay(&executor, &api).await;
    assert_eq!(summary.remaining[0].retry_count, 1);
    assert_eq!(summary.moot, 0);
  }

  #[tokio::test]
  async fn test_cancel_removes_before_replay() {
    let (_, queue, executor) = setup();
    let api = FakeApi::default();
    let op = queue.enqueue(OperationPayload::Create(new_expense("a"))).await;

    assert_eq!(queue.cancel(&op.id).await.map(|o| o.id), Some(op.id.clone()));
    assert!(queue.cancel(&op.id).await.is_none());

    let summary = queue.replay(&executor, &api).await;
    assert!(summary.is_noop());
    assert_eq!(api.calls(), 0);
  }

  #[tokio::test]
  async fn test_enqueue_during_replay_is_kept() {
    let (kv, queue, executor) = setup();
    let queue = Arc::new(queue);
    let api = Arc::new(FakeApi::default());
    api.set_delay(std::time::Duration::from_millis(50));
    queue.enqueue(OperationPayload::Create(new_expense("a"))).await;

    let replay = {
      let queue = queue.clone();
      let api = api.clone();
      let executor = executor.clone();
      tokio::spawn(async move { queue.replay(&executor, api.as_ref()).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let late = queue
      .enqueue(OperationPayload::Delete { id: "9".into() })
      .await;

    let summary = replay.await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.remaining.len(), 1);
    assert_eq!(summary.remaining[0].id, late.id);

    let stored: Vec<PendingOperation> =
      serde_json::from_str(&kv.get(PENDING_OPERATIONS_KEY).unwrap().unwrap()).unwrap();
    assert_eq!(stored, vec![late]);
  }

  #[tokio::test]
  async fn test_cancel_while_in_flight_deletes_created_record() {
    let (_, queue, executor) = setup();
    let queue = Arc::new(queue);
    let api = Arc::new(FakeApi::default());
    api.set_delay(std::time::Duration::from_millis(50));
    let op = queue.enqueue(OperationPayload::Create(new_expense("a"))).await;

    let replay = {
      let queue = queue.clone();
      let api = api.clone();
      let executor = executor.clone();
      tokio::spawn(async move { queue.replay(&executor, api.as_ref()).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(queue.cancel(&op.id).await.is_some());

    let summary = replay.await.unwrap();
    assert!(summary.created.is_empty());
    let remaining = queue.snapshot().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].kind(), OperationKind::Delete);
    assert_eq!(remaining[0].target_id(), Some(api.created()[0].id.as_str()));
  }

  #[tokio::test]
  async fn test_update_of_provisional_record_follows_server_id() {
    let (_, queue, executor) = setup();
    let api = FakeApi::default();
    let create = queue.enqueue(OperationPayload::Create(new_expense("draft"))).await;
    queue
      .enqueue(OperationPayload::Update {
        id: create.id.clone(),
        expense: new_expense("final"),
      })
      .await;

    let summary = queue.replay(&executor, &api).await;
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.created[0].0, create.id);
    let records = api.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, summary.created[0].1.id);
    assert_eq!(records[0].description, "final");
  }

  #[tokio::test(start_paused = true)]
  async fn test_abandoned_replay_keeps_stored_queue_consistent() {
    let (kv, queue, executor) = setup();
    let queue = Arc::new(queue);
    let api = Arc::new(FakeApi::default());
    api.set_delay(std::time::Duration::from_millis(50));
    queue.enqueue(OperationPayload::Create(new_expense("first"))).await;
    let second = queue
      .enqueue(OperationPayload::Create(new_expense("second")))
      .await;

    let replay = {
      let queue = queue.clone();
      let api = api.clone();
      let executor = executor.clone();
      tokio::spawn(async move { queue.replay(&executor, api.as_ref()).await })
    };

    // First create done at 50ms, second still in flight
    tokio::time::sleep(std::time::Duration::from_millis(75)).await;
    replay.abort();
    assert!(replay.await.unwrap_err().is_cancelled());

    let stored: Vec<PendingOperation> =
      serde_json::from_str(&kv.get(PENDING_OPERATIONS_KEY).unwrap().unwrap()).unwrap();
    assert_eq!(stored, vec![second.clone()]);
    assert_eq!(api.created().len(), 1);

    // The next pass picks up where the abandoned one stopped
    let summary = queue.replay(&executor, api.as_ref()).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(api.created().len(), 2);
    assert!(queue.is_empty().await);
  }

  #[tokio::test]
  async fn test_revision_tracks_changes() {
    let (_, queue, _) = setup();
    let start = queue.revision();

    let op = queue.enqueue(OperationPayload::Delete { id: "1".into() }).await;
    let after_enqueue = queue.revision();
    assert!(after_enqueue > start);

    queue.cancel(&op.id).await;
    assert!(queue.revision() > after_enqueue);
  }

  #[test]
  fn test_persisted_shape() {
    let op = PendingOperation {
      id: "tmp-1".into(),
      payload: OperationPayload::Delete { id: "4".into() },
      enqueued_at: Utc::now(),
      retry_count: 0,
    };
    let json = serde_json::to_value(&op).unwrap();
    assert_eq!(json["type"], "DELETE");
    assert_eq!(json["data"]["id"], "4");
    assert_eq!(json["retryCount"], 0);
  }
}
