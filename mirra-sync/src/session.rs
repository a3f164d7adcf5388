//! Server-side sessions and the session store
//!
//! One session per synchronization run, holding the staging directories
//! and the index being built. The store is the only state shared across
//! connection handlers; map access stays short and never performs IO
//! while holding the lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use mirra_index::SyncIndex;
use mirra_proto::FileRecord;

use crate::errors::{Result, SyncError};
use crate::staging::Stager;

/// Session store tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle timeout after which a session refuses further operations.
    pub timeout: Duration,
    /// Minimum spacing between session creations; a floodgate, not a
    /// capacity limiter.
    pub min_create_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            min_create_interval: Duration::from_millis(100),
        }
    }
}

/// State for one client's synchronization run.
pub struct Session {
    id: String,
    created_at: Instant,
    last_access: Instant,
    root: PathBuf,
    index_dir: PathBuf,
    session_dir: PathBuf,
    /// Index being built during this session; populated by `GetSyncList`.
    pub index: Option<SyncIndex>,
    pub stager: Stager,
    /// Conflicts recorded during reconciliation, echoed on finish.
    pub conflicts: Vec<FileRecord>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// On-disk scratch directory holding this session's shadow dirs.
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Refresh the idle clock. Every protocol operation touching the
    /// session calls this after the expiry check passes.
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn expired(&self, timeout: Duration) -> bool {
        self.last_access.elapsed() > timeout
    }
}

/// Thread-safe registry of in-flight sessions, keyed by session id.
pub struct SessionStore {
    config: SessionConfig,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    /// Serializes creations and carries the last creation time.
    create_gate: Mutex<Option<Instant>>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            create_gate: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a session with fresh shadow directories under the root's
    /// index directory. Creation is serialized and spaced by
    /// `min_create_interval`; callers arriving too fast sleep inside the
    /// gate.
    pub async fn create(
        &self,
        root: impl Into<PathBuf>,
        index_dir: impl Into<PathBuf>,
    ) -> Result<Arc<Mutex<Session>>> {
        {
            let mut gate = self.create_gate.lock().await;
            if let Some(last) = *gate {
                let elapsed = last.elapsed();
                if elapsed < self.config.min_create_interval {
                    tokio::time::sleep(self.config.min_create_interval - elapsed).await;
                }
            }
            *gate = Some(Instant::now());
        }

        let root = root.into();
        let index_dir = index_dir.into();
        let id = uuid::Uuid::new_v4().simple().to_string();

        let session_dir = index_dir.join("sessions").join(&id);
        let incoming_dir = session_dir.join("incoming");
        let removal_dir = session_dir.join("removal");
        fs::create_dir_all(&session_dir).await?;

        let stager = Stager::new(root.clone(), incoming_dir, removal_dir);
        stager.prepare().await?;

        let now = Instant::now();
        let session = Arc::new(Mutex::new(Session {
            id: id.clone(),
            created_at: now,
            last_access: now,
            root,
            index_dir,
            session_dir,
            index: None,
            stager,
            conflicts: Vec::new(),
        }));

        self.sessions.write().await.insert(id.clone(), session.clone());
        info!("Created session {}", id);
        Ok(session)
    }

    /// Look up a session without touching it.
    pub async fn get(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Look up a session, enforce expiry and refresh the idle clock.
    /// Expired sessions are evicted and reported as such.
    pub async fn acquire(&self, id: &str) -> Result<Arc<Mutex<Session>>> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| SyncError::SessionNotFound(id.to_string()))?;

        {
            let mut guard = session.lock().await;
            if guard.expired(self.config.timeout) {
                drop(guard);
                self.remove(id).await;
                warn!("Session {} expired", id);
                return Err(SyncError::SessionExpired(id.to_string()));
            }
            guard.touch();
        }

        Ok(session)
    }

    /// Drop a session from the store and delete its scratch directory,
    /// including any staged data it never committed.
    pub async fn remove(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        let removed = self.sessions.write().await.remove(id);
        if let Some(session) = &removed {
            let dir = session.lock().await.session_dir().to_path_buf();
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove session directory {:?}: {}", dir, e),
            }
            debug!("Removed session {}", id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Evict every expired session. Called by the background reaper to
    /// bound store growth; expiry is still checked per operation.
    pub async fn evict_expired(&self) -> usize {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions.keys().cloned().collect()
        };

        let mut evicted = 0usize;
        for id in ids {
            let expired = match self.get(&id).await {
                Some(session) => session.lock().await.expired(self.config.timeout),
                None => continue,
            };
            if expired {
                self.remove(&id).await;
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!("Evicted {} expired sessions", evicted);
        }
        evicted
    }
}
