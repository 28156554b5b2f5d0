//! Request/response matching by correlation id.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle};
use uuid::Uuid;

/// Default time a registration may stay unanswered.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Why a pending request did not get a response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("No response for {id} within {timeout:?}")]
    Timeout { id: String, timeout: Duration },
    #[error("Request {id} rejected: {reason}")]
    Rejected { id: String, reason: String },
    #[error("Request {0} abandoned")]
    Abandoned(String),
}

/// Generate a time-ordered unique id (UUID v7).
#[must_use]
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

struct Entry<T> {
    tx: oneshot::Sender<Result<T, CorrelationError>>,
    timer: JoinHandle<()>,
    /// Distinguishes re-registrations of the same id.
    generation: u64,
}

type Entries<T> = Arc<Mutex<HashMap<String, Entry<T>>>>;

/// Table of in-flight requests keyed by correlation id.
///
/// Every registration is removed after the timeout even if nobody waits on it.
pub struct CorrelationTable<T> {
    entries: Entries<T>,
    generations: Arc<AtomicU64>,
    timeout: Duration,
}

impl<T> Clone for CorrelationTable<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            generations: Arc::clone(&self.generations),
            timeout: self.timeout,
        }
    }
}

impl<T: Send + 'static> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_TIMEOUT)
    }
}

impl<T: Send + 'static> CorrelationTable<T> {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    /// Register a pending request.
    ///
    /// Uses `id` when given, otherwise a fresh [`generate_id`]. Registering an
    /// id that is already pending abandons the older registration.
    /// Must be called from within a tokio runtime.
    pub fn register(&self, id: Option<String>) -> PendingResponse<T> {
        let id = id.unwrap_or_else(generate_id);
        let (tx, rx) = oneshot::channel();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        let timer = {
            let entries = Arc::clone(&self.entries);
            let id = id.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                expire(&entries, id, generation, timeout);
            })
        };

        let entry = Entry {
            tx,
            timer,
            generation,
        };
        if let Some(old) = lock(&self.entries).insert(id.clone(), entry) {
            old.timer.abort();
            let _ = old.tx.send(Err(CorrelationError::Abandoned(id.clone())));
        }

        PendingResponse { id, rx }
    }

    /// Fulfill a pending request. Returns `false` if `id` is not pending.
    pub fn resolve(&self, id: &str, payload: T) -> bool {
        self.complete(id, Ok(payload))
    }

    /// Fail a pending request. Returns `false` if `id` is not pending.
    pub fn reject(&self, id: &str, reason: impl Into<String>) -> bool {
        self.complete(
            id,
            Err(CorrelationError::Rejected {
                id: id.to_string(),
                reason: reason.into(),
            }),
        )
    }

    /// Fail every pending request, e.g. when the channel closes.
    pub fn reject_all(&self, reason: &str) {
        let drained: Vec<_> = lock(&self.entries).drain().collect();
        for (id, entry) in drained {
            entry.timer.abort();
            let _ = entry.tx.send(Err(CorrelationError::Rejected {
                id,
                reason: reason.to_string(),
            }));
        }
    }

    /// Whether `id` is still pending.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        lock(&self.entries).contains_key(id)
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn complete(&self, id: &str, result: Result<T, CorrelationError>) -> bool {
        let Some(entry) = lock(&self.entries).remove(id) else {
            return false;
        };
        entry.timer.abort();
        let _ = entry.tx.send(result);
        true
    }
}

/// Time out the registration of `id` made under `generation`. A newer
/// registration of the same id is left alone.
fn expire<T>(
    entries: &Mutex<HashMap<String, Entry<T>>>,
    id: String,
    generation: u64,
    timeout: Duration,
) -> bool {
    let expired = {
        let mut entries = lock(entries);
        match entries.get(&id) {
            Some(entry) if entry.generation == generation => entries.remove(&id),
            _ => None,
        }
    };
    let Some(entry) = expired else {
        return false;
    };
    tracing::debug!(%id, "correlation entry timed out");
    let _ = entry.tx.send(Err(CorrelationError::Timeout { id, timeout }));
    true
}

fn lock<T>(entries: &Mutex<HashMap<String, Entry<T>>>) -> std::sync::MutexGuard<'_, HashMap<String, Entry<T>>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a registered request.
#[derive(Debug)]
pub struct PendingResponse<T> {
    id: String,
    rx: oneshot::Receiver<Result<T, CorrelationError>>,
}

impl<T> PendingResponse<T> {
    /// The correlation id to put on the outbound frame.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response, the rejection or the timeout.
    ///
    /// # Errors
    /// Returns the rejection or timeout reason.
    pub async fn wait(self) -> Result<T, CorrelationError> {
        self.rx
            .await
            .unwrap_or(Err(CorrelationError::Abandoned(self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_resolve_delivers_payload() {
        let table = CorrelationTable::<u32>::default();
        let pending = table.register(Some("req-1".into()));
        assert_eq!(pending.id(), "req-1");
        assert!(table.resolve("req-1", 7));
        assert_eq!(assert_ok!(pending.wait().await), 7);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_reject_delivers_reason() {
        let table = CorrelationTable::<u32>::default();
        let pending = table.register(None);
        let id = pending.id().to_string();
        assert!(table.reject(&id, "nope"));
        let err = assert_err!(pending.wait().await);
        assert!(matches!(err, CorrelationError::Rejected { reason, .. } if reason == "nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_once_and_removes_entry() {
        let table = CorrelationTable::<u32>::new(Duration::from_millis(5000));
        let pending = table.register(Some("slow".into()));

        tokio::time::sleep(Duration::from_millis(4999)).await;
        assert!(table.contains("slow"));

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!table.contains("slow"));
        let err = assert_err!(pending.wait().await);
        assert!(matches!(err, CorrelationError::Timeout { .. }));

        // Late responses are no-ops.
        assert!(!table.resolve("slow", 1));
        assert!(!table.reject("slow", "late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unawaited_entry_still_expires() {
        let table = CorrelationTable::<()>::new(Duration::from_millis(100));
        drop(table.register(None));
        assert_eq!(table.len(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_reject_all_drains() {
        let table = CorrelationTable::<()>::default();
        let a = table.register(None);
        let b = table.register(None);
        table.reject_all("closed");
        assert!(table.is_empty());
        assert_err!(a.wait().await);
        assert_err!(b.wait().await);
    }

    #[tokio::test]
    async fn test_stale_timer_leaves_reregistered_id_alone() {
        let timeout = Duration::from_millis(5000);
        let table = CorrelationTable::<u32>::new(timeout);
        let first = table.register(Some("dup".into()));
        let second = table.register(Some("dup".into()));
        assert!(matches!(
            assert_err!(first.wait().await),
            CorrelationError::Abandoned(_)
        ));

        // The first registration's timer firing late must not touch the second.
        assert!(!expire(&table.entries, "dup".to_string(), 0, timeout));
        assert!(table.contains("dup"));

        assert!(expire(&table.entries, "dup".to_string(), 1, timeout));
        assert!(matches!(
            assert_err!(second.wait().await),
            CorrelationError::Timeout { .. }
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_generated_ids_are_v7() {
        let first = generate_id();
        let second = generate_id();
        assert_ne!(first, second);
        let parsed = Uuid::parse_str(&first).unwrap();
        assert_eq!(parsed.get_version_num(), 7);
    }
}
