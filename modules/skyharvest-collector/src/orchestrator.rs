//! Parallel collection: one identity, one time window and one isolated job per
//! worker, merged into a single corpus afterwards.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use skyharvest_common::{Actor, ContentItem, Identity, Target, TimeRange, TimeWindow};

use crate::checkpoint::{dedupe, CheckpointStore};
use crate::error::{CollectError, Result};
use crate::job::{CollectionJob, HarvestDeps, JobResult};
use crate::stats::HarvestStats;
use crate::store::{self, ArtifactPaths};
use crate::traits::Connector;

#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub worker_id: usize,
    pub username: String,
    pub window: TimeWindow,
    pub collected: usize,
    pub error: Option<String>,
}

impl WorkerOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct AggregateResult {
    pub target: Target,
    pub items: Vec<ContentItem>,
    pub participants: Vec<Actor>,
    /// Per-worker outcomes in worker-id order.
    pub workers: Vec<WorkerOutcome>,
    pub errors: Vec<String>,
    /// Handles the merged registry update added.
    pub new_participants: usize,
    /// `None` when no worker produced anything to merge.
    pub final_path: Option<PathBuf>,
    pub stats: HarvestStats,
}

/// Items and participants one worker produced.
#[derive(Debug, Clone)]
pub struct WorkerArtifact {
    pub worker_id: usize,
    pub items: Vec<ContentItem>,
    pub participants: Vec<Actor>,
}

pub struct Orchestrator {
    connector: Arc<dyn Connector>,
    deps: HarvestDeps,
}

impl Orchestrator {
    pub fn new(connector: Arc<dyn Connector>, deps: HarvestDeps) -> Self {
        Self { connector, deps }
    }

    /// Run `target` across `identities[i] ↔ windows[i]` concurrently and
    /// merge the results. A failing worker contributes nothing and is reported
    /// in `errors`; it never aborts its siblings.
    pub async fn run_parallel(
        &self,
        target: &Target,
        limit: usize,
        identities: &[Identity],
        windows: &[TimeWindow],
    ) -> Result<AggregateResult> {
        let workers = identities.len().min(windows.len());
        if workers == 0 {
            return Err(CollectError::Other(anyhow::anyhow!(
                "parallel run needs at least one identity and one window"
            )));
        }
        if identities.len() != windows.len() {
            warn!(
                identities = identities.len(),
                windows = windows.len(),
                "Identity and window counts differ, using {workers} workers"
            );
        }
        let per_worker = if limit == 0 { 0 } else { limit.div_ceil(workers) };
        let run_id = Uuid::new_v4();
        info!(%run_id, %target, workers, per_worker, "Starting parallel collection");

        let mut tasks = JoinSet::new();
        for (identity, window) in identities.iter().zip(windows).take(workers) {
            let connector = self.connector.clone();
            let deps = self.deps.clone();
            let target = target.clone();
            let identity = identity.clone();
            let window = *window;
            tasks.spawn(async move {
                info!(%run_id, worker_id = window.worker_id, username = %identity.username, %window, "Worker starting");
                let result: Result<JobResult> = async {
                    let api = connector.connect(&identity).await?;
                    CollectionJob::new(api, deps)
                        .for_worker(window.worker_id)
                        .run(&target, per_worker, window.range())
                        .await
                }
                .await;
                (identity, window, result)
            });
        }

        let mut outcomes = Vec::with_capacity(workers);
        let mut results: Vec<(usize, JobResult)> = Vec::new();
        let mut errors = Vec::new();
        let mut stats = HarvestStats::default();

        while let Some(joined) = tasks.join_next().await {
            let (identity, window, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(%run_id, error = %e, "Worker task panicked");
                    errors.push(format!("worker task failed: {e}"));
                    stats.jobs_failed += 1;
                    continue;
                }
            };
            match result {
                Ok(result) => {
                    info!(%run_id, worker_id = window.worker_id, items = result.items.len(), "Worker finished");
                    stats += &result.stats;
                    stats.jobs_succeeded += 1;
                    outcomes.push(WorkerOutcome {
                        worker_id: window.worker_id,
                        username: identity.username,
                        window,
                        collected: result.items.len(),
                        error: None,
                    });
                    results.push((window.worker_id, result));
                }
                Err(e) => {
                    error!(%run_id, worker_id = window.worker_id, error = %e, "Worker failed");
                    errors.push(format!("worker {} ({}): {e}", window.worker_id, identity.username));
                    stats.jobs_failed += 1;
                    outcomes.push(WorkerOutcome {
                        worker_id: window.worker_id,
                        username: identity.username,
                        window,
                        collected: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        outcomes.sort_by_key(|o| o.worker_id);

        let worker_paths: Vec<PathBuf> = results.iter().map(|(_, r)| r.final_path.clone()).collect();
        let artifacts = results
            .into_iter()
            .map(|(worker_id, result)| WorkerArtifact {
                worker_id,
                items: result.items,
                participants: result.participants,
            })
            .collect();
        let (items, participants) = merge_artifacts(artifacts);

        let mut final_path = None;
        if !worker_paths.is_empty() {
            let range = overall_range(windows);
            let paths = ArtifactPaths::for_target(&self.deps.data_dir, target, &range, None);
            let merged = CheckpointStore::new(paths, target.clone(), range, None);
            final_path = Some(merged.finalize(&items, &participants, None).await?);
            for path in &worker_paths {
                store::remove_if_exists(path).await?;
            }
        }

        let topic = match target {
            Target::Keyword { keyword, .. } => Some(keyword.as_str()),
            _ => None,
        };
        let new_participants = self
            .deps
            .registry
            .update(participants.iter().map(|a| a.handle.clone()), topic)
            .await?;
        stats.registry_additions += new_participants as u32;

        info!(
            %run_id,
            items = items.len(),
            participants = participants.len(),
            failed = errors.len(),
            "Parallel collection merged"
        );

        Ok(AggregateResult {
            target: target.clone(),
            items,
            participants,
            workers: outcomes,
            errors,
            new_participants,
            final_path,
            stats,
        })
    }
}

/// Union worker artifacts in worker-id order; the first occurrence of a uri
/// or handle wins. The input order does not matter.
pub fn merge_artifacts(mut artifacts: Vec<WorkerArtifact>) -> (Vec<ContentItem>, Vec<Actor>) {
    artifacts.sort_by_key(|a| a.worker_id);
    let mut items = Vec::new();
    let mut participants = Vec::new();
    for artifact in artifacts {
        items.extend(artifact.items);
        participants.extend(artifact.participants);
    }
    dedupe(items, participants)
}

/// Earliest start to latest end across `windows`.
fn overall_range(windows: &[TimeWindow]) -> TimeRange {
    TimeRange::new(
        windows.iter().map(|w| w.start).min(),
        windows.iter().map(|w| w.end).max(),
    )
}
