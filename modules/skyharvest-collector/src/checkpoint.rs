use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use skyharvest_common::{Actor, ContentItem, Target, TimeRange};

use crate::error::Result;
use crate::store::{self, ArtifactPaths};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub target: Target,
    #[serde(default)]
    pub time_range: TimeRange,
    pub total_results: usize,
    pub collected_at: DateTime<Utc>,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
}

/// The persisted form of a job result, a checkpoint, or one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub metadata: ArtifactMetadata,
    #[serde(default)]
    pub items: Vec<ContentItem>,
    #[serde(default)]
    pub participants: Vec<Actor>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Where a resumed job's state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeSource {
    Batches,
    Temp,
    Final,
}

#[derive(Debug, Clone)]
pub struct ResumeState {
    pub items: Vec<ContentItem>,
    pub participants: Vec<Actor>,
    pub cursor: Option<String>,
    pub next_batch: u32,
    pub source: ResumeSource,
}

/// Per-job checkpoint persistence.
///
/// Single mode overwrites one temp artifact per batch. Worker mode writes
/// numbered batch artifacts that are never overwritten; resume replays them.
pub struct CheckpointStore {
    paths: ArtifactPaths,
    target: Target,
    range: TimeRange,
    worker_id: Option<usize>,
    next_batch: u32,
}

impl CheckpointStore {
    pub fn new(paths: ArtifactPaths, target: Target, range: TimeRange, worker_id: Option<usize>) -> Self {
        Self {
            paths,
            target,
            range,
            worker_id,
            next_batch: 1,
        }
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    pub fn is_worker(&self) -> bool {
        self.worker_id.is_some()
    }

    fn metadata(&self, total: usize, is_final: bool, batch_number: Option<u32>) -> ArtifactMetadata {
        ArtifactMetadata {
            target: self.target.clone(),
            time_range: self.range,
            total_results: total,
            collected_at: Utc::now(),
            is_final,
            batch_number,
            worker_id: self.worker_id,
        }
    }

    /// Load prior state: pending batches, then the temp checkpoint, then
    /// the final artifact. Corrupt files are skipped with a warning.
    pub async fn load(&mut self) -> Result<Option<ResumeState>> {
        if self.is_worker() {
            if let Some(state) = self.replay_batches().await? {
                self.next_batch = state.next_batch;
                return Ok(Some(state));
            }
        } else if let Some(artifact) = self.read_artifact(self.paths.temp()).await {
            return Ok(Some(self.state_from(artifact, ResumeSource::Temp)));
        }

        if let Some(artifact) = self.read_artifact(self.paths.final_path().to_path_buf()).await {
            return Ok(Some(self.state_from(artifact, ResumeSource::Final)));
        }
        Ok(None)
    }

    fn state_from(&self, artifact: Artifact, source: ResumeSource) -> ResumeState {
        let (items, participants) = dedupe(artifact.items, artifact.participants);
        ResumeState {
            items,
            participants,
            cursor: artifact.cursor,
            next_batch: self.next_batch,
            source,
        }
    }

    async fn read_artifact(&self, path: PathBuf) -> Option<Artifact> {
        match store::read_json::<Artifact>(&path).await {
            Ok(found) => found,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable checkpoint");
                None
            }
        }
    }

    async fn replay_batches(&self) -> Result<Option<ResumeState>> {
        let batches = self.paths.list_batches()?;
        let Some((last_number, _)) = batches.last() else {
            return Ok(None);
        };
        let next_batch = last_number + 1;

        let mut items = Vec::new();
        let mut participants = Vec::new();
        let mut cursor = None;
        for (n, path) in &batches {
            let Some(batch) = self.read_artifact(path.clone()).await else {
                continue;
            };
            items.extend(batch.items);
            participants.extend(batch.participants);
            if batch.cursor.is_some() {
                cursor = batch.cursor;
            }
            tracing::debug!(batch = n, "Replayed batch");
        }

        let (items, participants) = dedupe(items, participants);
        info!(
            batches = batches.len(),
            items = items.len(),
            "Resuming from batch artifacts"
        );
        Ok(Some(ResumeState {
            items,
            participants,
            cursor,
            next_batch,
            source: ResumeSource::Batches,
        }))
    }

    /// Single mode: overwrite the temp checkpoint with everything so far.
    pub async fn save_temp(
        &self,
        items: &[ContentItem],
        participants: &[Actor],
        cursor: Option<&str>,
    ) -> Result<PathBuf> {
        let artifact = Artifact {
            metadata: self.metadata(items.len(), false, None),
            items: items.to_vec(),
            participants: participants.to_vec(),
            cursor: cursor.map(str::to_string),
        };
        let path = self.paths.temp();
        store::atomic_write_json(&path, &artifact).await?;
        Ok(path)
    }

    /// Worker mode: write the items since the previous batch as a new batch.
    pub async fn save_batch(
        &mut self,
        new_items: &[ContentItem],
        new_participants: &[Actor],
        cursor: Option<&str>,
    ) -> Result<PathBuf> {
        let number = self.next_batch;
        let artifact = Artifact {
            metadata: self.metadata(new_items.len(), false, Some(number)),
            items: new_items.to_vec(),
            participants: new_participants.to_vec(),
            cursor: cursor.map(str::to_string),
        };
        let path = self.paths.batch(number);
        store::write_new_json(&path, &artifact).await?;
        self.next_batch += 1;
        Ok(path)
    }

    /// Write the final artifact, then drop every intermediate one.
    pub async fn finalize(
        &self,
        items: &[ContentItem],
        participants: &[Actor],
        cursor: Option<&str>,
    ) -> Result<PathBuf> {
        let artifact = Artifact {
            metadata: self.metadata(items.len(), true, None),
            items: items.to_vec(),
            participants: participants.to_vec(),
            cursor: cursor.map(str::to_string),
        };
        let path = self.paths.final_path().to_path_buf();
        store::atomic_write_json(&path, &artifact).await?;

        store::remove_if_exists(&self.paths.temp()).await?;
        for (_, batch) in self.paths.list_batches()? {
            store::remove_if_exists(&batch).await?;
        }
        Ok(path)
    }
}

/// First occurrence wins for both items (by uri) and actors (by handle).
pub fn dedupe(items: Vec<ContentItem>, participants: Vec<Actor>) -> (Vec<ContentItem>, Vec<Actor>) {
    let mut seen = HashSet::new();
    let items = items
        .into_iter()
        .filter(|item| seen.insert(item.uri.clone()))
        .collect();
    let mut handles = HashSet::new();
    let participants = participants
        .into_iter()
        .filter(|actor| handles.insert(actor.handle.clone()))
        .collect();
    (items, participants)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::item;

    fn store_in(dir: &std::path::Path, worker: Option<usize>) -> CheckpointStore {
        let target = Target::keyword("rust");
        let range = TimeRange::unbounded();
        let paths = ArtifactPaths::for_target(dir, &target, &range, worker);
        CheckpointStore::new(paths, target, range, worker)
    }

    #[tokio::test]
    async fn fresh_store_has_nothing_to_resume() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), None);
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn temp_checkpoint_wins_over_final() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), None);
        store.finalize(&[item("at://a/1")], &[], None).await.unwrap();
        store
            .save_temp(&[item("at://a/1"), item("at://a/2")], &[], Some("c2"))
            .await
            .unwrap();

        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.source, ResumeSource::Temp);
        assert_eq!(state.items.len(), 2);
        assert_eq!(state.cursor.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn batches_replay_in_order_and_skip_corrupt_ones() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), Some(0));
        store.save_batch(&[item("at://a/1")], &[], Some("c1")).await.unwrap();
        store.save_batch(&[item("at://a/2")], &[], Some("c2")).await.unwrap();
        std::fs::write(store.paths().batch(3), b"{ not json").unwrap();

        let mut reopened = store_in(dir.path(), Some(0));
        let state = reopened.load().await.unwrap().unwrap();
        assert_eq!(state.source, ResumeSource::Batches);
        let uris: Vec<_> = state.items.iter().map(|i| i.uri.as_str()).collect();
        assert_eq!(uris, vec!["at://a/1", "at://a/2"]);
        assert_eq!(state.cursor.as_deref(), Some("c2"));
        // Numbering continues past the corrupt file rather than clobbering it.
        assert_eq!(state.next_batch, 4);
    }

    #[tokio::test]
    async fn finalize_removes_intermediates() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), Some(2));
        store.save_batch(&[item("at://a/1")], &[], Some("c1")).await.unwrap();
        let path = store.finalize(&[item("at://a/1")], &[], None).await.unwrap();

        assert!(path.exists());
        assert!(store.paths().list_batches().unwrap().is_empty());

        let artifact: Artifact = store::read_json(&path).await.unwrap().unwrap();
        assert!(artifact.metadata.is_final);
        assert_eq!(artifact.metadata.worker_id, Some(2));
        assert_eq!(artifact.metadata.total_results, 1);
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let mut first = item("at://a/1");
        first.text = "first".into();
        let mut second = item("at://a/1");
        second.text = "second".into();
        let (items, _) = dedupe(vec![first, second, item("at://a/2")], vec![]);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].text, "first");
    }
}
