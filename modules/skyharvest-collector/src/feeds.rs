use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bsky_client::GeneratorView;
use tracing::{error, info};

use skyharvest_common::{Target, TimeRange};

use crate::error::Result;
use crate::job::{CollectionJob, HarvestDeps};
use crate::stats::HarvestStats;
use crate::store;
use crate::traits::PlatformApi;

/// Feed discovery plus one feed job per discovered feed.
pub struct FeedCollector {
    api: Arc<dyn PlatformApi>,
    deps: HarvestDeps,
    /// Pause between consecutive feed jobs.
    feed_gap: Duration,
}

impl FeedCollector {
    /// `rate_limit_delay` is the per-request delay; feeds are spaced by twice that.
    pub fn new(api: Arc<dyn PlatformApi>, deps: HarvestDeps, rate_limit_delay: Duration) -> Self {
        Self {
            api,
            deps,
            feed_gap: rate_limit_delay * 2,
        }
    }

    pub fn suggested_feeds_path(&self) -> PathBuf {
        self.deps.data_dir.join("feeds").join("suggested_feeds.json")
    }

    /// Page through suggested feed generators (`limit` 0 = all of them) and
    /// save the list as a JSON array.
    pub async fn collect_suggested_feeds(&self, limit: usize) -> Result<Vec<GeneratorView>> {
        let page_size = self.deps.settings.page_size.clamp(1, bsky_client::MAX_PAGE_SIZE);
        let mut feeds: Vec<GeneratorView> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut calls = 0u32;

        loop {
            let requested = if limit == 0 {
                page_size
            } else {
                page_size.min(u32::try_from(limit - feeds.len()).unwrap_or(u32::MAX))
            };
            let page = self.api.suggested_feeds(requested, cursor.as_deref()).await?;
            calls += 1;
            let exhausted = page.items.is_empty() || page.cursor.is_none() || page.cursor == cursor;
            for feed in page.items {
                if !feeds.iter().any(|f| f.uri == feed.uri) {
                    feeds.push(feed);
                }
            }
            cursor = page.cursor;
            if exhausted || (limit > 0 && feeds.len() >= limit) {
                break;
            }
        }
        if limit > 0 {
            feeds.truncate(limit);
        }

        store::atomic_write_json(&self.suggested_feeds_path(), &feeds).await?;
        info!(feeds = feeds.len(), calls, "Suggested feeds saved");
        Ok(feeds)
    }

    /// Discover up to `feeds_limit` feeds, then collect `posts_per_feed` items
    /// from each in turn. A failing feed is counted and skipped unless the
    /// session itself is gone.
    pub async fn collect_all_feeds(
        &self,
        feeds_limit: usize,
        posts_per_feed: usize,
    ) -> Result<HarvestStats> {
        let feeds = self.collect_suggested_feeds(feeds_limit).await?;
        let mut stats = HarvestStats::default();
        let total = feeds.len();

        for (i, feed) in feeds.iter().enumerate() {
            info!(feed = %feed.uri, name = %feed.display_name, "Processing feed {}/{total}", i + 1);
            let mut job = CollectionJob::new(self.api.clone(), self.deps.clone());
            match job
                .run(&Target::feed(&feed.uri), posts_per_feed, TimeRange::unbounded())
                .await
            {
                Ok(result) => {
                    stats += &result.stats;
                    stats.jobs_succeeded += 1;
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    error!(feed = %feed.uri, error = %e, "Feed collection failed");
                    stats.jobs_failed += 1;
                }
            }
            if i + 1 < total && !self.feed_gap.is_zero() {
                tokio::time::sleep(self.feed_gap).await;
            }
        }

        info!(
            succeeded = stats.jobs_succeeded,
            total,
            "Feed collection completed"
        );
        Ok(stats)
    }
}
