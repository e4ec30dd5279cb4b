//! Session persistence
//!
//! One JSON file per account under the session directory, holding the
//! cookie/local-storage snapshot from the last verified login. Snapshots
//! expire after a fixed age and are discarded after repeated restore
//! failures so a stale session cannot wedge an account.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::browser::control::{PageControl, PageState};
use crate::browser::errors::BrowserError;

/// A persisted authenticated session for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub email: String,
    pub state: PageState,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl SessionSnapshot {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

/// File-backed snapshot store with per-account locking.
pub struct SessionStore {
    dir: PathBuf,
    max_age: Duration,
    max_restore_failures: u32,
    locks: DashMap<String, Arc<Mutex<()>>>,
    restore_failures: DashMap<String, u32>,
}

impl SessionStore {
    pub fn new(dir: PathBuf, max_age: Duration, max_restore_failures: u32) -> Self {
        Self {
            dir,
            max_age,
            max_restore_failures,
            locks: DashMap::new(),
            restore_failures: DashMap::new(),
        }
    }

    fn lock_for(&self, email: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(email.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn path_for(&self, email: &str) -> PathBuf {
        let name: String = email
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' || c == '@' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.session"))
    }

    /// Load a usable snapshot, or `None` when missing, expired, invalidated,
    /// or unreadable. Corrupt and expired files are deleted on sight.
    pub async fn restore(&self, email: &str) -> Option<SessionSnapshot> {
        let lock = self.lock_for(email);
        let _guard = lock.lock().await;

        let path = self.path_for(email);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(_) => return None,
        };
        let snapshot: SessionSnapshot = match serde_json::from_slice(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(email, error = %e, "corrupt session file, removing");
                let _ = tokio::fs::remove_file(&path).await;
                return None;
            }
        };
        if !snapshot.valid {
            debug!(email, "session snapshot marked invalid");
            return None;
        }
        if snapshot.age(Utc::now()) > self.max_age {
            info!(email, "session snapshot expired, removing");
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }
        Some(snapshot)
    }

    /// Capture the page's current state and write it as a fresh snapshot.
    pub async fn persist(
        &self,
        email: &str,
        page: &dyn PageControl,
    ) -> Result<SessionSnapshot, BrowserError> {
        let state = page.snapshot_state().await?;
        let now = Utc::now();
        let snapshot = SessionSnapshot {
            email: email.to_string(),
            state,
            created_at: now,
            last_used: now,
            valid: true,
        };
        self.write(email, &snapshot).await?;
        self.restore_failures.remove(email);
        info!(email, "session snapshot persisted");
        Ok(snapshot)
    }

    /// Apply a snapshot to a fresh page before navigating to the site.
    pub async fn apply(
        &self,
        snapshot: &SessionSnapshot,
        page: &dyn PageControl,
    ) -> Result<(), BrowserError> {
        page.restore_state(&snapshot.state).await
    }

    /// Record a successful restore, refreshing `last_used` without touching
    /// the creation time so the age ceiling still applies.
    pub async fn mark_used(&self, email: &str) {
        self.restore_failures.remove(email);
        let lock = self.lock_for(email);
        let _guard = lock.lock().await;
        let path = self.path_for(email);
        if let Ok(raw) = tokio::fs::read(&path).await {
            if let Ok(mut snapshot) = serde_json::from_slice::<SessionSnapshot>(&raw) {
                snapshot.last_used = Utc::now();
                if let Ok(encoded) = serde_json::to_vec_pretty(&snapshot) {
                    let _ = tokio::fs::write(&path, encoded).await;
                }
            }
        }
    }

    /// Mark the snapshot unusable after a failed restore. The file is
    /// deleted outright once the failure limit is reached.
    pub async fn invalidate(&self, email: &str) {
        let failures = {
            let mut entry = self.restore_failures.entry(email.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        let lock = self.lock_for(email);
        let _guard = lock.lock().await;
        let path = self.path_for(email);

        if failures >= self.max_restore_failures {
            warn!(email, failures, "restore failure limit reached, deleting session");
            let _ = tokio::fs::remove_file(&path).await;
            self.restore_failures.remove(email);
            return;
        }

        if let Ok(raw) = tokio::fs::read(&path).await {
            if let Ok(mut snapshot) = serde_json::from_slice::<SessionSnapshot>(&raw) {
                snapshot.valid = false;
                if let Ok(encoded) = serde_json::to_vec_pretty(&snapshot) {
                    let _ = tokio::fs::write(&path, encoded).await;
                }
            }
        }
        info!(email, failures, "session snapshot invalidated");
    }

    /// Remove the snapshot file entirely.
    pub async fn delete(&self, email: &str) {
        let lock = self.lock_for(email);
        let _guard = lock.lock().await;
        let _ = tokio::fs::remove_file(self.path_for(email)).await;
        self.restore_failures.remove(email);
    }

    async fn write(&self, email: &str, snapshot: &SessionSnapshot) -> Result<(), BrowserError> {
        let lock = self.lock_for(email);
        let _guard = lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let encoded = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| BrowserError::ScriptError(format!("snapshot encode: {e}")))?;
        tokio::fs::write(self.path_for(email), encoded).await?;
        Ok(())
    }
}
