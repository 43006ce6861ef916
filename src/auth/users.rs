//! User identity mapping, persisted as a single JSON file.
//!
//! Users are created on first identity exchange and never deleted by the
//! control plane. The whole map is rewritten atomically (temp file +
//! rename) on every mutation; mutations are rare enough that this is
//! cheaper than carrying a database.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A control-plane user, keyed by the derived internal id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Internal id, derived deterministically from the GitHub id.
    pub id: String,
    /// External GitHub user id.
    pub github_id: u64,
    /// GitHub login handle.
    pub login: String,
    /// Email address captured at exchange time.
    pub email: String,
    /// Organization the user's usage is accounted against.
    pub org_id: String,
    /// Plan label. New users start on `free`.
    pub plan: String,
    /// First exchange timestamp.
    pub created_at: DateTime<Utc>,
}

/// File-backed user store guarded by a readers-writer lock.
pub struct UserStore {
    path: PathBuf,
    users: RwLock<HashMap<String, User>>,
}

impl UserStore {
    /// Load the store from `path`, starting empty when the file is absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let users = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("failed to parse user store {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to read user store {}: {e}",
                    path.display()
                ))
            }
        };

        info!(path = %path.display(), count = users.len(), "user store loaded");
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    /// Look up a user by internal id.
    pub async fn get(&self, id: &str) -> Option<User> {
        self.users.read().await.get(id).cloned()
    }

    /// Look up the user owning an org.
    pub async fn find_by_org(&self, org_id: &str) -> Option<User> {
        self.users
            .read()
            .await
            .values()
            .find(|u| u.org_id == org_id)
            .cloned()
    }

    /// Look up a user by external GitHub id.
    pub async fn find_by_github(&self, github_id: u64) -> Option<User> {
        self.users
            .read()
            .await
            .values()
            .find(|u| u.github_id == github_id)
            .cloned()
    }

    /// Fetch the user for a GitHub identity, creating it on first contact.
    ///
    /// The internal id and org id are both derived deterministically from
    /// the GitHub id, so repeated exchanges are idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when persisting a newly created user fails.
    pub async fn get_or_create(
        &self,
        github_id: u64,
        login: &str,
        email: &str,
    ) -> Result<User> {
        let id = derive_user_id(github_id);

        let mut users = self.users.write().await;
        if let Some(existing) = users.get(&id) {
            return Ok(existing.clone());
        }

        let user = User {
            id: id.clone(),
            github_id,
            login: login.to_owned(),
            email: email.to_owned(),
            org_id: derive_org_id(github_id),
            plan: "free".to_owned(),
            created_at: Utc::now(),
        };
        users.insert(id, user.clone());
        persist(&self.path, &users)?;

        info!(user_id = %user.id, login = %user.login, "user created");
        Ok(user)
    }

    /// Number of known users.
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    /// Whether the store has no users.
    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }
}

/// Derive the internal user id from the external identity id.
pub fn derive_user_id(github_id: u64) -> String {
    format!("user-gh-{github_id}")
}

/// Derive the org id from the external identity id.
pub fn derive_org_id(github_id: u64) -> String {
    format!("org-gh-{github_id}")
}

/// Write the full map to a `.tmp` sibling, then rename over the target to
/// avoid partial reads.
fn persist(path: &Path, users: &HashMap<String, User>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let rendered = serde_json::to_string_pretty(users).context("failed to encode user store")?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, rendered)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename user store to {}", path.display()))?;

    debug!(path = %path.display(), "user store persisted");
    Ok(())
}
