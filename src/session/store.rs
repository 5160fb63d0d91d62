//! Session store — concurrency-safe map from user to their single pending delivery.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Stable identity of the requesting chat user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A staged upload waiting for delivery or a device choice.
///
/// The session exclusively owns the files it points at. Sessions are never
/// patched: a new upload replaces the whole record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSession {
    pub user_id: UserId,
    /// File that will be attached (converted output, or the original).
    pub staged_file: PathBuf,
    /// File as uploaded, kept for cleanup after conversion.
    pub original_file: PathBuf,
    /// Sanitized upload name, shown to the user and used in the mail subject.
    pub display_name: String,
    /// Per-upload directory holding both files, removed on cleanup when empty.
    pub staging_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl PendingSession {
    pub fn new(
        user_id: UserId,
        staged_file: PathBuf,
        original_file: PathBuf,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            staged_file,
            original_file,
            display_name: display_name.into(),
            staging_dir: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_staging_dir(mut self, dir: PathBuf) -> Self {
        self.staging_dir = Some(dir);
        self
    }

    /// Whether the session has been pending longer than `max_age`.
    pub fn is_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(max_age).is_ok_and(|age| now - self.created_at > age)
    }

    /// Unlink the staged and original files plus the staging directory.
    ///
    /// Missing files are logged and otherwise ignored.
    pub async fn cleanup(&self) {
        self.cleanup_except(None).await;
    }

    /// Unlink this session's files, leaving any path that `keep` also owns.
    pub async fn cleanup_except(&self, keep: Option<&PendingSession>) {
        let owned_by_keep = |path: &Path| {
            keep.is_some_and(|k| k.staged_file == path || k.original_file == path)
        };

        if !owned_by_keep(&self.staged_file) {
            remove_silently(&self.staged_file).await;
        }
        if self.original_file != self.staged_file && !owned_by_keep(&self.original_file) {
            remove_silently(&self.original_file).await;
        }
        if let Some(dir) = &self.staging_dir {
            let shared = keep.is_some_and(|k| k.staging_dir.as_deref() == Some(dir.as_path()));
            if !shared {
                remove_staging_dir(dir).await;
            }
        }
    }
}

/// Remove a file, downgrading any failure to a warning.
pub async fn remove_silently(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Could not delete file");
    }
}

/// Remove an emptied upload directory, then its per-user parent if nothing
/// else is left in it.
pub async fn remove_staging_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir(dir).await {
        debug!(dir = %dir.display(), error = %e, "Staging directory not removed");
        return;
    }
    // Fails while the user has other uploads staged.
    if let Some(parent) = dir.parent() {
        let _ = tokio::fs::remove_dir(parent).await;
    }
}

/// Storage seam for pending sessions.
///
/// All access to pending sessions goes through these operations; none of them
/// touch the session's files.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store `session` for its user, replacing any previous one (last write wins).
    /// Returns the replaced session so the caller can clean it up.
    async fn put(&self, session: PendingSession) -> Option<PendingSession>;

    /// Read the user's session without consuming it.
    async fn get(&self, user_id: UserId) -> Option<PendingSession>;

    /// Atomically read and remove the user's session. At most one caller
    /// observes a given session.
    async fn take_and_clear(&self, user_id: UserId) -> Option<PendingSession>;

    /// Atomically remove and return every session older than `max_age`.
    async fn take_expired(&self, max_age: Duration) -> Vec<PendingSession>;

    async fn len(&self) -> usize;
}

/// In-process session store behind a single async `RwLock`.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<UserId, PendingSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, session: PendingSession) -> Option<PendingSession> {
        debug!(user_id = %session.user_id, file = %session.display_name, "Caching pending session");
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.user_id, session)
    }

    async fn get(&self, user_id: UserId) -> Option<PendingSession> {
        self.sessions.read().await.get(&user_id).cloned()
    }

    async fn take_and_clear(&self, user_id: UserId) -> Option<PendingSession> {
        self.sessions.write().await.remove(&user_id)
    }

    async fn take_expired(&self, max_age: Duration) -> Vec<PendingSession> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let expired: Vec<UserId> = sessions
            .values()
            .filter(|s| s.is_older_than(max_age, now))
            .map(|s| s.user_id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .collect()
    }

    async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Spawn a background task that discards sessions older than `max_age`.
pub fn spawn_sweep_task(
    store: Arc<dyn SessionStore>,
    max_age: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let expired = store.take_expired(max_age).await;
            if expired.is_empty() {
                continue;
            }
            futures::future::join_all(expired.iter().map(|s| s.cleanup())).await;
            info!(count = expired.len(), "Discarded stale pending sessions");
        }
    })
}
