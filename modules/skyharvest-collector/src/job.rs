//! One unit of collection work: a keyword search, an author feed or a feed.
//!
//! A job pages through its target, expands each unseen post through the
//! `TreeBuilder`, checkpoints every `batch_size` new items and writes one
//! final artifact. Re-running a job with the same parameters resumes from
//! whatever the previous run checkpointed.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bsky_client::{FeedViewPost, Page, SearchParams, SearchSort};
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use skyharvest_common::{
    format_timestamp, parse_timestamp, Actor, CollectorSettings, ContentItem, SearchFilters,
    SortOrder, Target, TimeRange,
};

use crate::checkpoint::{CheckpointStore, ResumeSource};
use crate::error::Result;
use crate::expand::{ExpandSettings, TreeBuilder};
use crate::registry::ParticipantRegistry;
use crate::relation::{classify, relation_of};
use crate::stats::HarvestStats;
use crate::store::ArtifactPaths;
use crate::traits::PlatformApi;

/// Long-lived, cloneable resources shared by every job in a run.
#[derive(Clone, TypedBuilder)]
pub struct HarvestDeps {
    #[builder(setter(into))]
    pub data_dir: PathBuf,
    pub registry: Arc<ParticipantRegistry>,
    #[builder(default)]
    pub settings: CollectorSettings,
}

impl HarvestDeps {
    /// Deps rooted at `data_dir`, with the registry in `<data_dir>/users`.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>, settings: CollectorSettings) -> Self {
        let data_dir = data_dir.into();
        let registry = Arc::new(ParticipantRegistry::new(data_dir.join("users")));
        Self {
            data_dir,
            registry,
            settings,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Resuming,
    Fetching,
    Saving,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub target: Target,
    pub items: Vec<ContentItem>,
    pub participants: Vec<Actor>,
    pub final_path: PathBuf,
    /// Continuation cursor at termination; `None` when the stream ran out.
    pub cursor: Option<String>,
    pub stats: HarvestStats,
}

pub struct CollectionJob {
    api: Arc<dyn PlatformApi>,
    deps: HarvestDeps,
    worker_id: Option<usize>,
    state: JobState,
}

/// Accumulated job state between pages.
struct Progress {
    items: Vec<ContentItem>,
    participants: Vec<Actor>,
    seen: HashSet<String>,
    handles: HashSet<String>,
    cursor: Option<String>,
    saved_items: usize,
    saved_participants: usize,
}

impl Progress {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            participants: Vec::new(),
            seen: HashSet::new(),
            handles: HashSet::new(),
            cursor: None,
            saved_items: 0,
            saved_participants: 0,
        }
    }

    fn absorb_participants(&mut self, actors: impl IntoIterator<Item = Actor>) {
        for actor in actors {
            if self.handles.insert(actor.handle.clone()) {
                self.participants.push(actor);
            }
        }
    }

    fn push(&mut self, item: ContentItem) {
        self.seen.insert(item.uri.clone());
        self.items.push(item);
    }

    fn unsaved_handles(&self) -> Vec<String> {
        self.participants[self.saved_participants..]
            .iter()
            .map(|a| a.handle.clone())
            .collect()
    }
}

impl CollectionJob {
    pub fn new(api: Arc<dyn PlatformApi>, deps: HarvestDeps) -> Self {
        Self {
            api,
            deps,
            worker_id: None,
            state: JobState::Created,
        }
    }

    /// Run as parallel worker `worker_id`: worker-scoped paths and
    /// immutable batch checkpoints.
    pub fn for_worker(mut self, worker_id: usize) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    fn transition(&mut self, label: &Label<'_>, next: JobState) {
        debug!(job = %label, from = ?self.state, to = ?next, "Job state");
        self.state = next;
    }

    /// Collect up to `limit` items (`0` = unbounded) of `target` within `range`.
    pub async fn run(&mut self, target: &Target, limit: usize, range: TimeRange) -> Result<JobResult> {
        let label = Label {
            target,
            worker_id: self.worker_id,
        };
        match self.collect(&label, target, limit, range).await {
            Ok(result) => {
                self.transition(&label, JobState::Done);
                info!(
                    job = %label,
                    items = result.items.len(),
                    participants = result.participants.len(),
                    path = %result.final_path.display(),
                    "Job complete"
                );
                Ok(result)
            }
            Err(e) => {
                self.transition(&label, JobState::Failed);
                error!(job = %label, error = %e, "Job failed, checkpointed progress kept on disk");
                Err(e)
            }
        }
    }

    async fn collect(
        &mut self,
        label: &Label<'_>,
        target: &Target,
        limit: usize,
        range: TimeRange,
    ) -> Result<JobResult> {
        let settings = self.deps.settings.clone();
        let batch_size = settings.batch_size.max(1);
        let paths = ArtifactPaths::for_target(&self.deps.data_dir, target, &range, self.worker_id);
        let mut checkpoints = CheckpointStore::new(paths, target.clone(), range, self.worker_id);
        let builder = TreeBuilder::new(self.api.clone(), ExpandSettings::from(&settings));
        let topic = match target {
            Target::Keyword { keyword, .. } => Some(keyword.as_str()),
            _ => None,
        };
        let mut stats = HarvestStats::default();
        let mut progress = Progress::new();

        self.transition(label, JobState::Resuming);
        if let Some(state) = checkpoints.load().await? {
            info!(
                job = %label,
                source = ?state.source,
                items = state.items.len(),
                cursor = state.cursor.as_deref().unwrap_or("-"),
                "Resuming from checkpoint"
            );
            for item in state.items {
                progress.push(item);
            }
            progress.absorb_participants(state.participants);
            progress.cursor = state.cursor;
            // Restored state is already on disk in some form.
            progress.saved_items = progress.items.len();
            progress.saved_participants = progress.participants.len();
            if state.source == ResumeSource::Final && progress.cursor.is_none() {
                debug!(job = %label, "Final artifact found, re-walking from the start");
            }
        }

        let page_size = settings.page_size.clamp(1, bsky_client::MAX_PAGE_SIZE);
        loop {
            let collected = progress.items.len();
            if limit > 0 && collected >= limit {
                break;
            }
            let requested = if limit == 0 {
                page_size
            } else {
                page_size.min(u32::try_from(limit - collected).unwrap_or(u32::MAX))
            };

            self.transition(label, JobState::Fetching);
            let request_cursor = progress.cursor.clone();
            let page = match self
                .fetch_page(target, &range, requested, request_cursor.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) if e.is_auth() => return Err(e.into()),
                Err(e) => {
                    warn!(job = %label, error = %e, "Page fetch failed, ending pagination");
                    break;
                }
            };
            stats.malformed_skipped += page.skipped as u32;

            if is_stale_author_page(target, &range, &page) {
                info!(job = %label, "Author feed is older than the time range, stopping");
                progress.cursor = None;
                break;
            }

            for entry in &page.items {
                let post = &entry.post;
                if progress.seen.contains(&post.uri) {
                    stats.duplicates_skipped += 1;
                    continue;
                }
                if !in_range(target, &range, entry) {
                    stats.out_of_range += 1;
                    continue;
                }

                let reposted = entry.is_repost();
                let relation = relation_of(post, reposted);
                let context = classify(target, &relation, &post.author.handle);
                let Some(expanded) = builder
                    .expand(post, reposted, context, &HashSet::new())
                    .await?
                else {
                    continue;
                };

                let mut item = expanded.item;
                if let Some(keyword) = topic {
                    item.search_keyword = Some(keyword.to_string());
                }
                progress.push(item);
                progress.absorb_participants(expanded.participants);
                stats.items_collected += 1;

                if progress.items.len() - progress.saved_items >= batch_size {
                    self.transition(label, JobState::Saving);
                    self.save(&mut checkpoints, &mut progress, request_cursor.as_deref(), topic, &mut stats)
                        .await?;
                    self.transition(label, JobState::Fetching);
                }
            }

            let exhausted = page.cursor.is_none() || page.cursor == request_cursor;
            progress.cursor = page.cursor;
            debug!(
                job = %label,
                collected = progress.items.len(),
                cursor = progress.cursor.as_deref().unwrap_or("-"),
                "Page processed"
            );
            if exhausted {
                progress.cursor = None;
                break;
            }
        }

        self.transition(label, JobState::Finalizing);
        let final_path = checkpoints
            .finalize(&progress.items, &progress.participants, progress.cursor.as_deref())
            .await?;
        let added = self
            .deps
            .registry
            .update(progress.unsaved_handles(), topic)
            .await?;
        stats.registry_additions += added as u32;
        builder.record_stats(&mut stats);

        Ok(JobResult {
            target: target.clone(),
            items: progress.items,
            participants: progress.participants,
            final_path,
            cursor: progress.cursor,
            stats,
        })
    }

    /// Checkpoint progress since the previous save, then union the new
    /// participants into the registry.
    async fn save(
        &self,
        checkpoints: &mut CheckpointStore,
        progress: &mut Progress,
        cursor: Option<&str>,
        topic: Option<&str>,
        stats: &mut HarvestStats,
    ) -> Result<()> {
        let path = if checkpoints.is_worker() {
            checkpoints
                .save_batch(
                    &progress.items[progress.saved_items..],
                    &progress.participants[progress.saved_participants..],
                    cursor,
                )
                .await?
        } else {
            checkpoints
                .save_temp(&progress.items, &progress.participants, cursor)
                .await?
        };
        stats.batches_written += 1;
        debug!(path = %path.display(), items = progress.items.len(), "Checkpoint written");

        let added = self
            .deps
            .registry
            .update(progress.unsaved_handles(), topic)
            .await?;
        stats.registry_additions += added as u32;

        progress.saved_items = progress.items.len();
        progress.saved_participants = progress.participants.len();
        Ok(())
    }

    async fn fetch_page(
        &self,
        target: &Target,
        range: &TimeRange,
        limit: u32,
        cursor: Option<&str>,
    ) -> bsky_client::Result<Page<FeedViewPost>> {
        match target {
            Target::Keyword { keyword, filters } => {
                let params = search_params(keyword, filters, range, limit);
                let page = self.api.search(&params, cursor).await?;
                Ok(Page {
                    items: page.items.into_iter().map(FeedViewPost::new).collect(),
                    cursor: page.cursor,
                    skipped: page.skipped,
                })
            }
            Target::Author { handle } => self.api.author_feed(handle, limit, cursor).await,
            Target::Feed { uri } => self.api.feed(uri, limit, cursor).await,
        }
    }
}

pub fn search_params(
    keyword: &str,
    filters: &SearchFilters,
    range: &TimeRange,
    limit: u32,
) -> SearchParams {
    SearchParams {
        q: keyword.to_string(),
        limit,
        author: filters.author.clone(),
        domain: filters.domain.clone(),
        lang: filters.lang.clone(),
        mentions: filters.mentions.clone(),
        tag: filters.tag.clone(),
        url: filters.url.clone(),
        since: range.since.as_ref().map(format_timestamp),
        until: range.until.as_ref().map(format_timestamp),
        sort: filters.sort.map(|s| match s {
            SortOrder::Top => SearchSort::Top,
            SortOrder::Latest => SearchSort::Latest,
        }),
    }
}

fn created_at(entry: &FeedViewPost) -> Option<chrono::DateTime<chrono::Utc>> {
    let post = &entry.post;
    post.record
        .created_at
        .as_deref()
        .or(post.indexed_at.as_deref())
        .and_then(parse_timestamp)
}

/// Search filters by time server-side; author and feed listings are filtered
/// here. Items without a usable timestamp are kept.
fn in_range(target: &Target, range: &TimeRange, entry: &FeedViewPost) -> bool {
    if matches!(target, Target::Keyword { .. }) || range.is_unbounded() {
        return true;
    }
    created_at(entry).map_or(true, |ts| range.contains(&ts))
}

/// Author feeds are newest-first: once a whole page predates `since`,
/// nothing later will match.
fn is_stale_author_page(target: &Target, range: &TimeRange, page: &Page<FeedViewPost>) -> bool {
    let (Target::Author { .. }, Some(since)) = (target, range.since) else {
        return false;
    };
    page.items
        .iter()
        .filter_map(created_at)
        .max()
        .is_some_and(|newest| newest < since)
}

/// `keyword:rust#2` style job label for logs.
struct Label<'a> {
    target: &'a Target,
    worker_id: Option<usize>,
}

impl fmt::Display for Label<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.worker_id {
            Some(id) => write!(f, "{}#{id}", self.target),
            None => write!(f, "{}", self.target),
        }
    }
}
