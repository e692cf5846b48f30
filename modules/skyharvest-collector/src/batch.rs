//! Crawl the participant registry: one author job per discovered handle.
//!
//! Handles are read once from `users/discovered_users.json`. With
//! `skip_existing`, a handle whose author artifact is already on disk is left
//! alone. In parallel mode the handle list is split into contiguous shares,
//! one per identity, and each share runs on its own connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use skyharvest_common::{Identity, Target, TimeRange};

use crate::error::Result;
use crate::job::{CollectionJob, HarvestDeps};
use crate::stats::HarvestStats;
use crate::store::ArtifactPaths;
use crate::traits::{Connector, PlatformApi};

/// What one batch worker did with its share of handles.
#[derive(Debug, Clone)]
pub struct BatchShare {
    pub worker_id: usize,
    pub username: String,
    pub assigned: usize,
    pub collected: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// Handles read from the registry.
    pub discovered: usize,
    /// Handles skipped because their artifact already exists.
    pub skipped: usize,
    /// One entry per worker, in worker-id order. Empty in single mode.
    pub shares: Vec<BatchShare>,
    pub errors: Vec<String>,
    pub stats: HarvestStats,
}

pub struct BatchCollector {
    deps: HarvestDeps,
    /// Pause between consecutive handles on one connection.
    user_gap: Duration,
}

impl BatchCollector {
    pub fn new(deps: HarvestDeps, user_gap: Duration) -> Self {
        Self { deps, user_gap }
    }

    /// Registry handles still to crawl, in registry (sorted) order, plus the
    /// number skipped.
    pub async fn pending_handles(&self, skip_existing: bool) -> Result<(Vec<String>, usize)> {
        let discovered = self.deps.registry.read().await?;
        if !skip_existing {
            return Ok((discovered.into_iter().collect(), 0));
        }
        let total = discovered.len();
        let pending: Vec<String> = discovered
            .into_iter()
            .filter(|handle| !self.already_collected(handle))
            .collect();
        let skipped = total - pending.len();
        Ok((pending, skipped))
    }

    fn already_collected(&self, handle: &str) -> bool {
        let target = Target::author(handle);
        let range = TimeRange::unbounded();
        ArtifactPaths::for_target(&self.deps.data_dir, &target, &range, None)
            .final_path()
            .exists()
    }

    /// Crawl every pending handle on one connection.
    pub async fn collect(
        &self,
        api: Arc<dyn PlatformApi>,
        posts_per_user: usize,
        skip_existing: bool,
    ) -> Result<BatchResult> {
        let (handles, skipped) = self.pending_handles(skip_existing).await?;
        let discovered = handles.len() + skipped;
        if discovered == 0 {
            warn!("No discovered users yet, run a keyword or feed collection first");
        }
        info!(discovered, skipped, pending = handles.len(), "Starting batch collection");

        let stats = crawl(api, self.deps.clone(), &handles, posts_per_user, self.user_gap).await?;
        Ok(BatchResult {
            discovered,
            skipped,
            stats,
            ..Default::default()
        })
    }

    /// Split pending handles across `identities` and crawl the shares
    /// concurrently. A worker that cannot connect, or whose session expires,
    /// stops alone; its remaining handles stay pending for the next run.
    pub async fn collect_parallel(
        &self,
        connector: Arc<dyn Connector>,
        identities: &[Identity],
        posts_per_user: usize,
        skip_existing: bool,
    ) -> Result<BatchResult> {
        let (handles, skipped) = self.pending_handles(skip_existing).await?;
        let mut result = BatchResult {
            discovered: handles.len() + skipped,
            skipped,
            ..Default::default()
        };
        if identities.is_empty() || handles.is_empty() {
            warn!(
                identities = identities.len(),
                pending = handles.len(),
                "Nothing to split, batch collection skipped"
            );
            return Ok(result);
        }

        let shares = split_handles(handles, identities.len());
        info!(
            workers = identities.len(),
            skipped,
            "Starting parallel batch collection"
        );

        let mut tasks = JoinSet::new();
        for (identity, share) in identities.iter().zip(shares) {
            let connector = connector.clone();
            let deps = self.deps.clone();
            let identity = identity.clone();
            let gap = self.user_gap;
            tasks.spawn(async move {
                let assigned = share.len();
                info!(worker_id = identity.worker_id, username = %identity.username, assigned, "Batch worker starting");
                let outcome: Result<HarvestStats> = async {
                    let api = connector.connect(&identity).await?;
                    crawl(api, deps, &share, posts_per_user, gap).await
                }
                .await;
                (identity, assigned, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (identity, assigned, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Batch worker task panicked");
                    result.errors.push(format!("batch worker task failed: {e}"));
                    continue;
                }
            };
            let (collected, error) = match outcome {
                Ok(stats) => {
                    let collected = stats.jobs_succeeded as usize;
                    result.stats += &stats;
                    (collected, None)
                }
                Err(e) => {
                    error!(worker_id = identity.worker_id, error = %e, "Batch worker failed");
                    result
                        .errors
                        .push(format!("worker {} ({}): {e}", identity.worker_id, identity.username));
                    (0, Some(e.to_string()))
                }
            };
            result.shares.push(BatchShare {
                worker_id: identity.worker_id,
                username: identity.username,
                assigned,
                collected,
                error,
            });
        }
        result.shares.sort_by_key(|s| s.worker_id);

        info!(
            users = result.stats.jobs_succeeded,
            failed = result.stats.jobs_failed,
            workers_failed = result.errors.len(),
            "Parallel batch collection completed"
        );
        Ok(result)
    }
}

/// One author job per handle, in order. A failing handle is counted and
/// skipped; an authentication failure ends the crawl.
async fn crawl(
    api: Arc<dyn PlatformApi>,
    deps: HarvestDeps,
    handles: &[String],
    posts_per_user: usize,
    gap: Duration,
) -> Result<HarvestStats> {
    let mut stats = HarvestStats::default();
    let total = handles.len();

    for (i, handle) in handles.iter().enumerate() {
        info!(%handle, "Processing user {}/{total}", i + 1);
        let mut job = CollectionJob::new(api.clone(), deps.clone());
        match job
            .run(&Target::author(handle), posts_per_user, TimeRange::unbounded())
            .await
        {
            Ok(result) => {
                stats += &result.stats;
                stats.jobs_succeeded += 1;
            }
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => {
                error!(%handle, error = %e, "User collection failed");
                stats.jobs_failed += 1;
            }
        }
        if i + 1 < total && !gap.is_zero() {
            tokio::time::sleep(gap).await;
        }
    }
    Ok(stats)
}

/// Contiguous shares whose sizes differ by at most one; earlier workers take
/// the remainder.
pub fn split_handles(handles: Vec<String>, workers: usize) -> Vec<Vec<String>> {
    if workers == 0 {
        return Vec::new();
    }
    let base = handles.len() / workers;
    let remainder = handles.len() % workers;
    let mut rest = handles.into_iter();
    (0..workers)
        .map(|i| {
            let take = base + usize::from(i < remainder);
            rest.by_ref().take(take).collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{identity, post, MockConnector, MockPlatform};
    use bsky_client::FeedViewPost;
    use skyharvest_common::CollectorSettings;

    fn handles(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn feed_of(did: &str, handle: &str) -> Vec<FeedViewPost> {
        vec![FeedViewPost::new(post(did, handle, "1"))]
    }

    #[test]
    fn split_gives_earlier_workers_the_remainder() {
        let shares = split_handles(handles(&["a", "b", "c", "d", "e"]), 2);
        assert_eq!(shares, vec![handles(&["a", "b", "c"]), handles(&["d", "e"])]);
        assert_eq!(split_handles(handles(&["a"]), 3)[2], Vec::<String>::new());
        assert!(split_handles(handles(&["a"]), 0).is_empty());
    }

    #[tokio::test]
    async fn collects_each_registry_handle_once() {
        let dir = tempfile::tempdir().unwrap();
        let deps = HarvestDeps::for_data_dir(dir.path(), CollectorSettings::default());
        deps.registry
            .update(handles(&["a.test", "b.test"]), None)
            .await
            .unwrap();
        let mock = Arc::new(
            MockPlatform::new()
                .on_author_feed("a.test", feed_of("did:plc:a", "a.test"))
                .on_author_feed("b.test", feed_of("did:plc:b", "b.test")),
        );

        let result = BatchCollector::new(deps, Duration::ZERO)
            .collect(mock.clone(), 100, true)
            .await
            .unwrap();

        assert_eq!(result.discovered, 2);
        assert_eq!(result.skipped, 0);
        assert_eq!(result.stats.jobs_succeeded, 2);
        assert_eq!(mock.calls("author_feed"), 2);
        assert!(dir.path().join("users/posts/a_test_posts.json").exists());
    }

    #[tokio::test]
    async fn skip_existing_leaves_collected_handles_alone() {
        let dir = tempfile::tempdir().unwrap();
        let deps = HarvestDeps::for_data_dir(dir.path(), CollectorSettings::default());
        deps.registry
            .update(handles(&["a.test", "b.test"]), None)
            .await
            .unwrap();
        let mock = Arc::new(
            MockPlatform::new()
                .on_author_feed("a.test", feed_of("did:plc:a", "a.test"))
                .on_author_feed("b.test", feed_of("did:plc:b", "b.test")),
        );
        let collector = BatchCollector::new(deps, Duration::ZERO);
        collector.collect(mock.clone(), 100, true).await.unwrap();

        let again = collector.collect(mock.clone(), 100, true).await.unwrap();
        assert_eq!(again.skipped, 2);
        assert_eq!(again.stats.jobs_succeeded, 0);
        assert_eq!(mock.calls("author_feed"), 2);

        let forced = collector.collect(mock.clone(), 100, false).await.unwrap();
        assert_eq!(forced.skipped, 0);
        assert_eq!(forced.stats.jobs_succeeded, 2);
    }

    #[tokio::test]
    async fn parallel_batch_splits_handles_and_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let deps = HarvestDeps::for_data_dir(dir.path(), CollectorSettings::default());
        deps.registry
            .update(handles(&["a.test", "b.test", "c.test"]), None)
            .await
            .unwrap();
        let platform = Arc::new(
            MockPlatform::new()
                .on_author_feed("a.test", feed_of("did:plc:a", "a.test"))
                .on_author_feed("b.test", feed_of("did:plc:b", "b.test"))
                .on_author_feed("c.test", feed_of("did:plc:c", "c.test")),
        );
        let connector = Arc::new(MockConnector::new(platform).reject("w1.test"));
        let identities = vec![identity(0, "w0.test"), identity(1, "w1.test")];

        let result = BatchCollector::new(deps, Duration::ZERO)
            .collect_parallel(connector, &identities, 100, true)
            .await
            .unwrap();

        // w0 takes a.test and b.test; w1 would have taken c.test.
        assert_eq!(result.shares.len(), 2);
        assert_eq!(result.shares[0].assigned, 2);
        assert_eq!(result.shares[0].collected, 2);
        assert_eq!(result.shares[1].assigned, 1);
        assert!(result.shares[1].error.is_some());
        assert_eq!(result.errors.len(), 1);
        assert!(dir.path().join("users/posts/b_test_posts.json").exists());
        assert!(!dir.path().join("users/posts/c_test_posts.json").exists());
    }
}
