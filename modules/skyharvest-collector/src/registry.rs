use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::Result;
use crate::store::{self, safe_name};

/// Durable, union-only set of discovered handles.
///
/// Readers share the lock; writers hold it exclusively and replace the file
/// by atomic rename. Updates are unions, so writer order does not matter.
/// The lock covers every task holding this instance; separate processes
/// writing the same directory rely on the rename alone.
pub struct ParticipantRegistry {
    users_dir: PathBuf,
    lock: RwLock<()>,
}

impl ParticipantRegistry {
    pub fn new(users_dir: impl Into<PathBuf>) -> Self {
        Self {
            users_dir: users_dir.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn global_path(&self) -> PathBuf {
        self.users_dir.join("discovered_users.json")
    }

    pub fn topic_path(&self, keyword: &str) -> PathBuf {
        self.users_dir
            .join(format!("discovered_users_{}.json", safe_name(keyword)))
    }

    /// Current global set.
    pub async fn read(&self) -> Result<BTreeSet<String>> {
        let _guard = self.lock.read().await;
        read_handles(self.global_path()).await
    }

    pub async fn read_topic(&self, keyword: &str) -> Result<BTreeSet<String>> {
        let _guard = self.lock.read().await;
        read_handles(self.topic_path(keyword)).await
    }

    /// Union `handles` into the global set (and the topic set when given).
    /// Returns how many handles were new to the global set.
    pub async fn update<I, S>(&self, handles: I, topic: Option<&str>) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let incoming: BTreeSet<String> = handles
            .into_iter()
            .map(Into::into)
            .filter(|h: &String| !h.is_empty())
            .collect();
        if incoming.is_empty() {
            return Ok(0);
        }

        let _guard = self.lock.write().await;
        let added = union_into(self.global_path(), incoming.clone()).await?;
        if let Some(keyword) = topic {
            union_into(self.topic_path(keyword), incoming).await?;
        }
        if added > 0 {
            info!(added, "Discovered users updated");
        }
        Ok(added)
    }
}

async fn read_handles(path: PathBuf) -> Result<BTreeSet<String>> {
    Ok(tokio::task::spawn_blocking(move || read_handles_blocking(&path)).await?)
}

/// A corrupt registry reads as empty; the next update rewrites it whole.
fn read_handles_blocking(path: &Path) -> BTreeSet<String> {
    match store::read_json_blocking::<Vec<String>>(path) {
        Ok(Some(handles)) => handles.into_iter().collect(),
        Ok(None) => BTreeSet::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable registry file, treating as empty");
            BTreeSet::new()
        }
    }
}

/// Caller holds the write lock.
async fn union_into(path: PathBuf, incoming: BTreeSet<String>) -> Result<usize> {
    tokio::task::spawn_blocking(move || -> Result<usize> {
        let mut current = read_handles_blocking(&path);
        let before = current.len();
        current.extend(incoming);
        let added = current.len() - before;
        if added == 0 {
            return Ok(0);
        }
        let sorted: Vec<&String> = current.iter().collect();
        store::atomic_write(&path, &serde_json::to_vec_pretty(&sorted)?)?;
        Ok(added)
    })
    .await?
}
