//! Durable FIFO of deferred writes.

use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::mutation::{MutationKind, MutationStatus, PendingMutation};
use crate::api::Created;
use crate::config::QueueConfig;
use crate::error::{SyncError, SyncResult};
use crate::event::Notifier;
use crate::store::{load_all, save_all, LocalStore, Table};

/// Why a drain stopped before the queue was empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStop {
  /// The next mutation's precondition is not met yet
  NotReady(Uuid),
  /// A failed mutation is waiting for the user to discard or retry it
  BlockedByFailure(Uuid),
  /// A transient error; the mutation stays pending for the next trigger
  Transient(Uuid),
  /// The session expired; nothing after this point was attempted
  SessionExpired(Uuid),
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub committed: Vec<Uuid>,
  pub failed: Vec<Uuid>,
  /// Server-assigned ids of created resources, by mutation
  pub created: Vec<(Uuid, String)>,
  pub stopped: Option<DrainStop>,
}

/// Persistent queue of writes made while their precondition was unmet.
///
/// Mutations replay strictly oldest first, one at a time. A committed mutation
/// is removed from the store; a failed one stays until the user discards or
/// retries it, and blocks everything queued after it.
pub struct MutationQueue {
  store: Arc<dyn LocalStore>,
  mutations: watch::Sender<Vec<PendingMutation>>,
  drain_lock: Mutex<()>,
  next_seq: AtomicU64,
  policy: QueueConfig,
  notifier: Notifier,
}

impl MutationQueue {
  /// Load the queue from the store.
  ///
  /// A mutation left `InFlight` by an interrupted session is reset to
  /// `Pending`; leftover `Committed` records are dropped.
  pub fn open(store: Arc<dyn LocalStore>, policy: QueueConfig, notifier: Notifier) -> SyncResult<Self> {
    let mut mutations: Vec<PendingMutation> = load_all(store.as_ref(), Table::PendingMutations)?;
    mutations.retain(|m| m.status != MutationStatus::Committed);
    for m in mutations.iter_mut().filter(|m| m.status == MutationStatus::InFlight) {
      warn!(mutation_id = %m.id, "Resetting interrupted mutation to pending");
      m.status = MutationStatus::Pending;
    }
    mutations.sort_by_key(|m| (m.created_at, m.seq));

    let next_seq = mutations.iter().map(|m| m.seq + 1).max().unwrap_or(0);
    debug!(count = mutations.len(), "Loaded mutation queue");

    let queue = Self {
      store,
      mutations: watch::channel(mutations).0,
      drain_lock: Mutex::new(()),
      next_seq: AtomicU64::new(next_seq),
      policy,
      notifier,
    };
    queue.persist()?;
    Ok(queue)
  }

  /// Queue a write. It is persisted before this returns.
  pub fn enqueue(&self, kind: MutationKind, payload: Value) -> SyncResult<Uuid> {
    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
    let mutation = PendingMutation::new(kind, payload, seq);
    let id = mutation.id;

    self.mutations.send_modify(|all| all.push(mutation));
    if let Err(e) = self.persist() {
      self.mutations.send_modify(|all| all.retain(|m| m.id != id));
      return Err(e);
    }

    info!(mutation_id = %id, kind = kind.label(), "Queued mutation");
    Ok(id)
  }

  /// Mutations still waiting to be replayed, oldest first.
  pub fn peek_pending(&self) -> Vec<PendingMutation> {
    self.filtered(|m| matches!(m.status, MutationStatus::Pending | MutationStatus::InFlight))
  }

  /// Mutations that gave up and need a user decision.
  pub fn failed(&self) -> Vec<PendingMutation> {
    self.filtered(|m| m.status == MutationStatus::Failed)
  }

  pub fn get(&self, id: Uuid) -> Option<PendingMutation> {
    self.mutations.borrow().iter().find(|m| m.id == id).cloned()
  }

  /// Observe the queue contents.
  pub fn subscribe(&self) -> watch::Receiver<Vec<PendingMutation>> {
    self.mutations.subscribe()
  }

  fn filtered(&self, pred: impl Fn(&PendingMutation) -> bool) -> Vec<PendingMutation> {
    self.mutations.borrow().iter().filter(|m| pred(m)).cloned().collect()
  }

  /// Drop a mutation on the user's request. In-flight mutations cannot be discarded.
  pub fn discard(&self, id: Uuid) -> SyncResult<bool> {
    let mut removed = false;
    self.mutations.send_if_modified(|all| {
      let before = all.len();
      all.retain(|m| m.id != id || m.status == MutationStatus::InFlight);
      removed = all.len() != before;
      removed
    });
    if removed {
      info!(mutation_id = %id, "Discarded mutation");
      self.persist()?;
    }
    Ok(removed)
  }

  /// Give a failed mutation another chance on the next drain.
  pub fn retry(&self, id: Uuid) -> SyncResult<bool> {
    let changed = self.mutations.send_if_modified(|all| {
      match all.iter_mut().find(|m| m.id == id && m.status == MutationStatus::Failed) {
        Some(m) => {
          m.status = MutationStatus::Pending;
          m.attempts = 0;
          m.last_error = None;
          true
        }
        None => false,
      }
    });
    if changed {
      self.persist()?;
    }
    Ok(changed)
  }

  /// Replay every pending mutation.
  pub async fn drain<F, Fut>(&self, replay: F) -> SyncResult<DrainReport>
  where
    F: FnMut(PendingMutation) -> Fut,
    Fut: Future<Output = SyncResult<Created>>,
  {
    self.drain_when(|_| true, replay).await
  }

  /// Replay pending mutations in creation order while `ready` holds.
  ///
  /// Stops at the first mutation that is not ready, failed earlier, or fails
  /// now; nothing after that point is attempted so later writes never run
  /// ahead of the ones they may depend on.
  pub async fn drain_when<R, F, Fut>(&self, ready: R, mut replay: F) -> SyncResult<DrainReport>
  where
    R: Fn(&PendingMutation) -> bool,
    F: FnMut(PendingMutation) -> Fut,
    Fut: Future<Output = SyncResult<Created>>,
  {
    let _guard = self.drain_lock.lock().await;
    let mut report = DrainReport::default();

    loop {
      let Some(next) = self.mutations.borrow().first().cloned() else {
        break;
      };

      if next.status == MutationStatus::Failed {
        debug!(mutation_id = %next.id, "Drain blocked by failed mutation");
        report.stopped = Some(DrainStop::BlockedByFailure(next.id));
        break;
      }
      if !ready(&next) {
        debug!(mutation_id = %next.id, "Precondition not met, stopping drain");
        report.stopped = Some(DrainStop::NotReady(next.id));
        break;
      }

      self.set_status(next.id, MutationStatus::InFlight)?;
      debug!(mutation_id = %next.id, kind = next.kind.label(), "Replaying mutation");

      match replay(next.clone()).await {
        Ok(outcome) => {
          self.commit(&next, &outcome, &mut report)?;
        }
        Err(SyncError::SessionExpired) => {
          warn!(mutation_id = %next.id, "Session expired during drain, aborting");
          self.set_status(next.id, MutationStatus::Pending)?;
          report.stopped = Some(DrainStop::SessionExpired(next.id));
          break;
        }
        Err(e) => {
          if self.record_failure(&next, &e)? {
            report.failed.push(next.id);
            report.stopped = Some(DrainStop::BlockedByFailure(next.id));
          } else {
            report.stopped = Some(DrainStop::Transient(next.id));
          }
          break;
        }
      }
    }

    Ok(report)
  }

  fn commit(&self, mutation: &PendingMutation, outcome: &Created, report: &mut DrainReport) -> SyncResult<()> {
    self.mutations.send_modify(|all| all.retain(|m| m.id != mutation.id));
    self.persist()?;
    report.committed.push(mutation.id);

    let label = mutation.kind.label();
    match outcome {
      Created::New(_) => {
        let server_id = outcome.id();
        info!(mutation_id = %mutation.id, server_id = ?server_id, "Mutation committed");
        let message = match &server_id {
          Some(id) => {
            report.created.push((mutation.id, id.clone()));
            format!("Your {} was saved (id {}).", label, id)
          }
          None => format!("Your {} was saved.", label),
        };
        self.notifier.success("Saved", message);
      }
      Created::AlreadyExists(detail) => {
        info!(mutation_id = %mutation.id, "Mutation target already exists");
        self.notifier.info("Already saved", detail.clone());
      }
    }
    Ok(())
  }

  /// Count a failed attempt. Returns `true` if the mutation is now `Failed`.
  fn record_failure(&self, mutation: &PendingMutation, error: &SyncError) -> SyncResult<bool> {
    let attempts = mutation.attempts + 1;
    let limit = if error.is_transient() {
      self.policy.max_transient_attempts
    } else {
      self.policy.max_terminal_attempts
    };
    let failed = attempts >= limit;

    self.mutations.send_modify(|all| {
      if let Some(m) = all.iter_mut().find(|m| m.id == mutation.id) {
        m.attempts = attempts;
        m.last_error = Some(error.to_string());
        m.status = if failed {
          MutationStatus::Failed
        } else {
          MutationStatus::Pending
        };
      }
    });
    self.persist()?;

    let label = mutation.kind.label();
    if failed {
      warn!(mutation_id = %mutation.id, attempts, "Mutation failed: {}", error);
      self.notifier.error(
        format!("Could not save your {}", label),
        format!("{} Discard it or try again.", error.user_message()),
      );
    } else {
      warn!(mutation_id = %mutation.id, attempts, "Mutation will be retried: {}", error);
      self.notifier.warning(
        "Sync paused",
        format!("Your {} will be sent when the connection recovers. {}", label, error.user_message()),
      );
    }
    Ok(failed)
  }

  fn set_status(&self, id: Uuid, status: MutationStatus) -> SyncResult<()> {
    self.mutations.send_modify(|all| {
      if let Some(m) = all.iter_mut().find(|m| m.id == id) {
        m.status = status;
      }
    });
    self.persist()
  }

  fn persist(&self) -> SyncResult<()> {
    let snapshot = self.mutations.borrow().clone();
    save_all(self.store.as_ref(), Table::PendingMutations, &snapshot)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ApiError;
  use crate::event::drain_notifications;
  use crate::store::MemoryStore;
  use serde_json::json;
  use std::sync::Mutex as StdMutex;
  use std::time::Duration;

  fn queue_on(store: Arc<dyn LocalStore>) -> MutationQueue {
    MutationQueue::open(store, QueueConfig::default(), Notifier::new()).unwrap()
  }

  fn new_queue() -> MutationQueue {
    queue_on(Arc::new(MemoryStore::new()))
  }

  #[tokio::test]
  async fn test_replays_in_creation_order() {
    let queue = new_queue();
    let a = queue.enqueue(MutationKind::CreateListing, json!({"name": "A"})).unwrap();
    let b = queue.enqueue(MutationKind::AddCartLine, json!({"item": "B"})).unwrap();

    let order = Arc::new(StdMutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let report = queue
      .drain(move |m| {
        let seen = Arc::clone(&seen);
        async move {
          // A is slower than B; order must still hold
          let delay = if m.kind == MutationKind::CreateListing { 20 } else { 1 };
          tokio::time::sleep(Duration::from_millis(delay)).await;
          seen.lock().unwrap().push(m.id);
          Ok(Created::New(json!({"id": m.id.to_string()})))
        }
      })
      .await
      .unwrap();

    assert_eq!(*order.lock().unwrap(), vec![a, b]);
    assert_eq!(report.committed, vec![a, b]);
    assert!(report.stopped.is_none());
    assert!(queue.peek_pending().is_empty());
  }

  #[tokio::test]
  async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    let id = {
      let store = Arc::new(crate::store::SqliteStore::open(Some(&path)).unwrap());
      let queue = queue_on(store);
      queue
        .enqueue(MutationKind::CreateListing, json!({"name": "Excavator"}))
        .unwrap()
    };

    let store = Arc::new(crate::store::SqliteStore::open(Some(&path)).unwrap());
    let queue = queue_on(store);
    let pending = queue.peek_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].payload["name"], "Excavator");
  }

  #[tokio::test]
  async fn test_committed_mutation_is_not_replayed_again() {
    let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
    let queue = queue_on(Arc::clone(&store));
    queue.enqueue(MutationKind::AddCartLine, json!({"item": "5"})).unwrap();

    let calls = Arc::new(StdMutex::new(0));
    let replay = |calls: Arc<StdMutex<i32>>| {
      move |_m: PendingMutation| {
        let calls = Arc::clone(&calls);
        async move {
          *calls.lock().unwrap() += 1;
          Ok::<_, SyncError>(Created::New(json!({"id": "line-1"})))
        }
      }
    };

    let first = queue.drain(replay(Arc::clone(&calls))).await.unwrap();
    assert_eq!(first.created.len(), 1);
    let second = queue.drain(replay(Arc::clone(&calls))).await.unwrap();
    assert!(second.committed.is_empty());
    assert_eq!(*calls.lock().unwrap(), 1);

    // And not after a restart either
    assert!(queue_on(store).peek_pending().is_empty());
  }

  #[tokio::test]
  async fn test_session_expiry_aborts_drain() {
    let queue = new_queue();
    let m1 = queue.enqueue(MutationKind::AddCartLine, json!({"n": 1})).unwrap();
    let m2 = queue.enqueue(MutationKind::AddCartLine, json!({"n": 2})).unwrap();
    let m3 = queue.enqueue(MutationKind::AddCartLine, json!({"n": 3})).unwrap();

    let attempted = Arc::new(StdMutex::new(Vec::new()));
    let seen = Arc::clone(&attempted);
    let report = queue
      .drain(move |m| {
        let seen = Arc::clone(&seen);
        async move {
          seen.lock().unwrap().push(m.id);
          if m.payload["n"] == 2 {
            Err(SyncError::SessionExpired)
          } else {
            Ok(Created::New(Value::Null))
          }
        }
      })
      .await
      .unwrap();

    assert_eq!(report.committed, vec![m1]);
    assert_eq!(report.stopped, Some(DrainStop::SessionExpired(m2)));
    assert_eq!(*attempted.lock().unwrap(), vec![m1, m2]);

    let pending = queue.peek_pending();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, m2);
    assert_eq!(pending[0].status, MutationStatus::Pending);
    assert_eq!(pending[0].attempts, 0);
    assert_eq!(pending[1].id, m3);
    assert!(queue.failed().is_empty());
  }

  #[tokio::test]
  async fn test_validation_error_fails_and_blocks() {
    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();
    let queue = MutationQueue::open(Arc::new(MemoryStore::new()), QueueConfig::default(), notifier).unwrap();
    let bad = queue.enqueue(MutationKind::CreateListing, json!({})).unwrap();
    let later = queue.enqueue(MutationKind::AddCartLine, json!({})).unwrap();

    let report = queue
      .drain(|_m| async { Err(SyncError::Api(ApiError::new(400, "name is required"))) })
      .await
      .unwrap();
    assert_eq!(report.failed, vec![bad]);
    assert_eq!(report.stopped, Some(DrainStop::BlockedByFailure(bad)));

    let failed = queue.get(bad).unwrap();
    assert_eq!(failed.status, MutationStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert_eq!(queue.get(later).unwrap().status, MutationStatus::Pending);

    let notes = drain_notifications(&mut rx);
    assert_eq!(notes.len(), 1);
    assert!(notes[0].message.contains("name is required"));

    // Still blocked on the next trigger
    let again = queue
      .drain(|_m| async { Ok(Created::New(Value::Null)) })
      .await
      .unwrap();
    assert!(again.committed.is_empty());
    assert_eq!(again.stopped, Some(DrainStop::BlockedByFailure(bad)));

    // Discarding unblocks the queue
    assert!(queue.discard(bad).unwrap());
    let after = queue
      .drain(|_m| async { Ok(Created::New(Value::Null)) })
      .await
      .unwrap();
    assert_eq!(after.committed, vec![later]);
  }

  #[tokio::test]
  async fn test_transient_error_stays_pending_until_limit() {
    let policy = QueueConfig {
      max_terminal_attempts: 1,
      max_transient_attempts: 2,
    };
    let queue = MutationQueue::open(Arc::new(MemoryStore::new()), policy, Notifier::new()).unwrap();
    let id = queue.enqueue(MutationKind::AddCartLine, json!({})).unwrap();

    let offline = |_m: PendingMutation| async { Err::<Created, _>(SyncError::Network("offline".into())) };

    let first = queue.drain(offline).await.unwrap();
    assert_eq!(first.stopped, Some(DrainStop::Transient(id)));
    assert_eq!(queue.get(id).unwrap().status, MutationStatus::Pending);
    assert_eq!(queue.get(id).unwrap().attempts, 1);

    let second = queue.drain(offline).await.unwrap();
    assert_eq!(second.failed, vec![id]);
    assert_eq!(queue.get(id).unwrap().status, MutationStatus::Failed);

    assert!(queue.retry(id).unwrap());
    let retried = queue.get(id).unwrap();
    assert_eq!(retried.status, MutationStatus::Pending);
    assert_eq!(retried.attempts, 0);
  }

  #[tokio::test]
  async fn test_conflict_commits_as_already_existing() {
    let queue = new_queue();
    let id = queue.enqueue(MutationKind::CreateListing, json!({})).unwrap();
    let report = queue
      .drain(|_m| async { Ok(Created::AlreadyExists("Listing already exists".into())) })
      .await
      .unwrap();
    assert_eq!(report.committed, vec![id]);
    assert!(report.created.is_empty());
  }

  #[tokio::test]
  async fn test_drain_stops_at_unready_mutation() {
    let queue = new_queue();
    let cart = queue.enqueue(MutationKind::AddCartLine, json!({})).unwrap();
    let listing = queue.enqueue(MutationKind::CreateListing, json!({})).unwrap();
    let cart_after = queue.enqueue(MutationKind::AddCartLine, json!({})).unwrap();

    let report = queue
      .drain_when(
        |m| m.kind != MutationKind::CreateListing,
        |_m| async { Ok(Created::New(Value::Null)) },
      )
      .await
      .unwrap();

    assert_eq!(report.committed, vec![cart]);
    assert_eq!(report.stopped, Some(DrainStop::NotReady(listing)));
    let ids: Vec<Uuid> = queue.peek_pending().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![listing, cart_after]);
  }

  #[test]
  fn test_interrupted_mutation_is_reset_on_open() {
    let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
    let mut stuck = PendingMutation::new(MutationKind::AddCartLine, json!({}), 0);
    stuck.status = MutationStatus::InFlight;
    let mut done = PendingMutation::new(MutationKind::AddCartLine, json!({}), 1);
    done.status = MutationStatus::Committed;
    save_all(store.as_ref(), Table::PendingMutations, &[stuck.clone(), done]).unwrap();

    let queue = queue_on(store);
    let pending = queue.peek_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, stuck.id);
    assert_eq!(pending[0].status, MutationStatus::Pending);
  }

  #[test]
  fn test_new_mutations_follow_reloaded_ones() {
    let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
    let first = queue_on(Arc::clone(&store))
      .enqueue(MutationKind::AddCartLine, json!({}))
      .unwrap();
    let queue = queue_on(store);
    let second = queue.enqueue(MutationKind::AddCartLine, json!({})).unwrap();

    let pending = queue.peek_pending();
    assert_eq!(pending[0].id, first);
    assert_eq!(pending[1].id, second);
    assert!(pending[1].seq > pending[0].seq);
  }
}
