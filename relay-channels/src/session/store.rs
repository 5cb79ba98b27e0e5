//! In-memory view of the persisted session map.

use crate::message::ThreadKey;
use crate::session::{SessionBackend, SessionMap, SessionRecord};
use relay_common::config::CorruptStatePolicy;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Default bound on a single durable write.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Session store error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session state at {location} is corrupt: {reason}")]
    CorruptState { location: String, reason: String },

    #[error("Failed to persist sessions: {0}")]
    Persistence(#[source] relay_common::Error),

    #[error("Session file {path} is in use by another relay instance")]
    Locked { path: String },

    #[error("Session write timed out after {0:?}")]
    Timeout(Duration),
}

/// Durable mapping from thread key to assistant session.
///
/// Readers only ever see committed state: a mutation builds the next map,
/// persists it through the backend, and publishes it in memory only after the
/// write succeeded. A failed write therefore leaves memory exactly as it was.
/// Mutations are serialized by a writer lock regardless of how callers order
/// themselves.
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    committed: RwLock<Arc<SessionMap>>,
    writer: Arc<Mutex<()>>,
    write_timeout: Duration,
}

impl SessionStore {
    /// Load the store from `backend`.
    ///
    /// Nothing persisted yet means an empty store. Unparsable state is handled
    /// per `policy`: refused with [`StoreError::CorruptState`], or moved aside
    /// and replaced by an empty store. It is never discarded silently.
    pub fn load(
        backend: Arc<dyn SessionBackend>,
        policy: CorruptStatePolicy,
    ) -> Result<Self, StoreError> {
        let location = backend.location();

        let sessions = match backend.load() {
            Ok(Some(sessions)) => sessions,
            Ok(None) => SessionMap::new(),
            Err(e) if e.is_parse() => match policy {
                CorruptStatePolicy::Refuse => {
                    tracing::error!(
                        location = %location,
                        error = %e,
                        "Session state is corrupt; refusing to start"
                    );
                    return Err(StoreError::CorruptState {
                        location,
                        reason: e.to_string(),
                    });
                }
                CorruptStatePolicy::Quarantine => {
                    let moved = backend.quarantine().map_err(StoreError::Persistence)?;
                    tracing::warn!(
                        location = %location,
                        quarantined_to = ?moved,
                        error = %e,
                        "Session state is corrupt; moved it aside and starting empty"
                    );
                    SessionMap::new()
                }
            },
            Err(e) => return Err(StoreError::Persistence(e)),
        };

        tracing::info!(location = %location, sessions = sessions.len(), "Session store loaded");

        Ok(Self {
            backend,
            committed: RwLock::new(Arc::new(sessions)),
            writer: Arc::new(Mutex::new(())),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// Set the bound on a single durable write.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Where the sessions are persisted.
    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Look up the session recorded for a thread.
    pub fn get(&self, key: &ThreadKey) -> Option<SessionRecord> {
        self.current().get(key).cloned()
    }

    /// Number of threads with a recorded session.
    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    /// Copy of the committed map.
    pub fn snapshot(&self) -> SessionMap {
        (*self.current()).clone()
    }

    /// Record `record` as the session of `key` and persist the whole store.
    ///
    /// Returns once the write is durable. Writing the record already stored
    /// for `key` is a no-op.
    pub async fn put(&self, key: ThreadKey, record: SessionRecord) -> Result<(), StoreError> {
        let guard = self.lock_writer().await?;

        let current = self.current();
        if current.get(&key) == Some(&record) {
            tracing::debug!(thread_key = %key, "Session unchanged, skipping write");
            return Ok(());
        }

        let mut next = (*current).clone();
        next.insert(key, record);
        self.commit(next, guard).await
    }

    /// Forget the session of `key`. Returns whether one was recorded.
    pub async fn remove(&self, key: &ThreadKey) -> Result<bool, StoreError> {
        let guard = self.lock_writer().await?;

        let current = self.current();
        if !current.contains_key(key) {
            return Ok(false);
        }

        let mut next = (*current).clone();
        next.remove(key);
        self.commit(next, guard).await?;
        Ok(true)
    }

    /// Acquire the writer lock, giving up after the write timeout.
    async fn lock_writer(&self) -> Result<OwnedMutexGuard<()>, StoreError> {
        tokio::time::timeout(self.write_timeout, self.writer.clone().lock_owned())
            .await
            .map_err(|_| {
                tracing::warn!(
                    location = %self.backend.location(),
                    "Previous session write still pending; giving up"
                );
                StoreError::Timeout(self.write_timeout)
            })
    }

    fn current(&self) -> Arc<SessionMap> {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persist `next` and publish it. Must be called with the writer lock held.
    async fn commit(
        &self,
        next: SessionMap,
        guard: OwnedMutexGuard<()>,
    ) -> Result<(), StoreError> {
        let next = Arc::new(next);
        let backend = self.backend.clone();
        let snapshot = next.clone();
        let mut write = tokio::task::spawn_blocking(move || backend.save(&snapshot));

        match tokio::time::timeout(self.write_timeout, &mut write).await {
            Ok(Ok(Ok(()))) => {
                *self
                    .committed
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = next;
                drop(guard);
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(StoreError::Persistence(e)),
            Ok(Err(join)) => Err(StoreError::Persistence(relay_common::Error::Internal(
                format!("session writer panicked: {join}"),
            ))),
            Err(_) => {
                // The blocking write cannot be cancelled; keep other writers
                // out until it finishes so two saves never overlap. If it
                // lands, the file holds a map that was never published, so
                // rewrite it from the committed one.
                let backend = self.backend.clone();
                let committed = self.current();
                tokio::spawn(async move {
                    if let Ok(Ok(())) = write.await {
                        reconcile(backend, committed).await;
                    }
                    drop(guard);
                });
                Err(StoreError::Timeout(self.write_timeout))
            }
        }
    }
}

/// Bring the backend back in line with the committed map after a timed-out
/// write landed late.
async fn reconcile(backend: Arc<dyn SessionBackend>, committed: Arc<SessionMap>) {
    let location = backend.location();
    let result = tokio::task::spawn_blocking(move || backend.save(&committed)).await;
    match result {
        Ok(Ok(())) => {
            tracing::info!(location = %location, "Rolled back late session write");
        }
        Ok(Err(e)) => {
            tracing::error!(
                location = %location,
                error = %e,
                "Failed to roll back late session write; next save will retry"
            );
        }
        Err(e) => {
            tracing::error!(location = %location, error = %e, "Session rollback panicked");
        }
    }
}
