//! Recursive interaction-tree expansion.
//!
//! `TreeBuilder::expand` turns one post into a `ContentItem`, fetching as much
//! of its interaction graph as the item's `ExpansionContext` allows:
//!
//! - full: every liker and reposter, every quote and reply (each expanded
//!   again as `RECURSIVE`);
//! - shallow: one page of likers/reposters/quotes, harvested for
//!   participants only, plus a depth-1 thread for the reply count;
//! - counts only: one page of each and a deeper thread, for counts.
//!
//! The set of uris on the current path is cloned on each descent, so sibling
//! branches do not see each other's visits. Leaf failures degrade to empty
//! results; only authentication failures propagate.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bsky_client::{BskyError, Page, PostView, QuoteRef, ThreadViewPost};
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use skyharvest_common::{
    Actor, Children, CollectorSettings, ContentItem, Counts, ExpansionContext, ExpansionPolicy,
    QuotedPost,
};

use crate::error::{CollectError, Result};
use crate::relation::{actor_of, bare_item, quoted_summary, relation_of};
use crate::stats::HarvestStats;
use crate::traits::PlatformApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandSettings {
    pub page_size: u32,
    pub reply_thread_depth: u32,
    pub shallow_thread_depth: u32,
}

impl Default for ExpandSettings {
    fn default() -> Self {
        Self::from(&CollectorSettings::default())
    }
}

impl From<&CollectorSettings> for ExpandSettings {
    fn from(s: &CollectorSettings) -> Self {
        Self {
            page_size: s.page_size.clamp(1, bsky_client::MAX_PAGE_SIZE),
            reply_thread_depth: s.reply_thread_depth,
            shallow_thread_depth: s.shallow_thread_depth,
        }
    }
}

/// One expanded item plus every participant its subtree surfaced.
#[derive(Debug, Clone)]
pub struct Expanded {
    pub item: ContentItem,
    pub participants: Vec<Actor>,
}

#[derive(Default)]
struct Counters {
    branch_failures: AtomicU32,
    quote_lookups: AtomicU32,
    malformed: AtomicU32,
}

pub struct TreeBuilder {
    api: Arc<dyn PlatformApi>,
    settings: ExpandSettings,
    /// Quoted-post summaries by uri, including misses. Lives as long as the job.
    quote_cache: Mutex<HashMap<String, Option<QuotedPost>>>,
    counters: Counters,
}

impl TreeBuilder {
    pub fn new(api: Arc<dyn PlatformApi>, settings: ExpandSettings) -> Self {
        Self {
            api,
            settings,
            quote_cache: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Add this builder's counters to `stats`.
    pub fn record_stats(&self, stats: &mut HarvestStats) {
        stats.branch_failures += self.counters.branch_failures.swap(0, Ordering::Relaxed);
        stats.quote_lookups += self.counters.quote_lookups.swap(0, Ordering::Relaxed);
        stats.malformed_skipped += self.counters.malformed.swap(0, Ordering::Relaxed);
    }

    /// Expand `post` under `context`. `reposted` is the listing-level repost
    /// marker. Returns `None` when `post` is already on the current path.
    pub fn expand<'a>(
        &'a self,
        post: &'a PostView,
        reposted: bool,
        context: ExpansionContext,
        visited: &'a HashSet<String>,
    ) -> BoxFuture<'a, Result<Option<Expanded>>> {
        async move {
            if visited.contains(&post.uri) {
                debug!(uri = %post.uri, "Skipping already-visited post");
                return Ok(None);
            }
            let mut path = visited.clone();
            path.insert(post.uri.clone());

            let mut relation = relation_of(post, reposted);
            let quoted = match post.quote_ref() {
                Some(quote) if relation.is_quote => self.resolve_quote(quote).await?,
                _ => None,
            };
            if relation.is_quote && relation.original_author.is_none() {
                relation.original_author = quoted.as_ref().map(|q| q.author_handle.clone());
            }

            let mut item = bare_item(post, relation, context);
            item.quoted = quoted;

            let mut participants = own_participants(post, item.quoted.as_ref());
            match context.policy() {
                ExpansionPolicy::Full => {
                    participants.extend(self.expand_full(post, &mut item, &path).await?)
                }
                ExpansionPolicy::Shallow => {
                    participants.extend(self.expand_shallow(&mut item).await?)
                }
                ExpansionPolicy::CountsOnly => self.expand_counts(&mut item).await?,
            }

            Ok(Some(Expanded { item, participants }))
        }
        .boxed()
    }

    async fn expand_full(
        &self,
        post: &PostView,
        item: &mut ContentItem,
        path: &HashSet<String>,
    ) -> Result<Vec<Actor>> {
        let api = &self.api;
        let uri = post.uri.as_str();
        let page = self.settings.page_size;

        let likes: Vec<Actor> = self
            .drain("likes", uri, |cursor| async move {
                api.likes(uri, page, cursor.as_deref()).await
            })
            .await?
            .iter()
            .map(actor_of)
            .collect();
        let reposts: Vec<Actor> = self
            .drain("reposts", uri, |cursor| async move {
                api.reposted_by(uri, page, cursor.as_deref()).await
            })
            .await?
            .iter()
            .map(actor_of)
            .collect();
        let quote_posts = self
            .drain("quotes", uri, |cursor| async move {
                api.quotes(uri, page, cursor.as_deref()).await
            })
            .await?;

        let mut participants = Vec::with_capacity(likes.len() + reposts.len());
        participants.extend(likes.iter().cloned());
        participants.extend(reposts.iter().cloned());

        let mut quotes = Vec::new();
        for quote in &quote_posts {
            if let Some(child) = self
                .expand(quote, false, ExpansionContext::Recursive, path)
                .await?
            {
                participants.extend(child.participants);
                quotes.push(child.item);
            }
        }

        let mut replies = Vec::new();
        if let Some(thread) = self.thread(uri, self.settings.reply_thread_depth).await? {
            for reply in thread.reply_posts() {
                if let Some(child) = self
                    .expand(&reply.post, false, ExpansionContext::Recursive, path)
                    .await?
                {
                    participants.extend(child.participants);
                    replies.push(child.item);
                }
            }
        }

        item.counts = Counts {
            like: likes.len() as u64,
            repost: reposts.len() as u64,
            quote: quotes.len() as u64,
            reply: replies.len() as u64,
        };
        item.children = Some(Children {
            likes,
            reposts,
            quotes,
            replies,
        });
        Ok(participants)
    }

    async fn expand_shallow(&self, item: &mut ContentItem) -> Result<Vec<Actor>> {
        let uri = item.uri.as_str();
        let page = self.settings.page_size;

        let likes = self.first_page("likes", uri, self.api.likes(uri, page, None)).await?;
        let reposts = self
            .first_page("reposts", uri, self.api.reposted_by(uri, page, None))
            .await?;
        let quotes = self.first_page("quotes", uri, self.api.quotes(uri, page, None)).await?;
        let reply = self.reply_count(uri, self.settings.shallow_thread_depth).await?;

        item.counts = Counts {
            like: likes.len() as u64,
            repost: reposts.len() as u64,
            quote: quotes.len() as u64,
            reply,
        };
        Ok(likes.iter().chain(reposts.iter()).map(actor_of).collect())
    }

    async fn expand_counts(&self, item: &mut ContentItem) -> Result<()> {
        let uri = item.uri.as_str();
        let page = self.settings.page_size;

        let like = self.first_page("likes", uri, self.api.likes(uri, page, None)).await?.len();
        let repost = self
            .first_page("reposts", uri, self.api.reposted_by(uri, page, None))
            .await?
            .len();
        let quote = self.first_page("quotes", uri, self.api.quotes(uri, page, None)).await?.len();
        let reply = self.reply_count(uri, self.settings.reply_thread_depth).await?;

        item.counts = Counts {
            like: like as u64,
            repost: repost as u64,
            quote: quote as u64,
            reply,
        };
        Ok(())
    }

    /// Summary of a quoted post: from the cache, from the hydrated view, or
    /// from one by-uri lookup. Misses are cached too.
    async fn resolve_quote(&self, quote: QuoteRef) -> Result<Option<QuotedPost>> {
        if let Some(hit) = self.quote_cache.lock().await.get(&quote.uri) {
            return Ok(hit.clone());
        }

        let summary = match (&quote.author_handle, &quote.author_did) {
            (Some(handle), Some(did)) => Some(QuotedPost {
                uri: quote.uri.clone(),
                author_handle: handle.clone(),
                author_id: did.clone(),
                text: quote.text.clone().unwrap_or_default(),
                created_at: quote.created_at.clone(),
            }),
            _ => {
                self.counters.quote_lookups.fetch_add(1, Ordering::Relaxed);
                match self.api.get_by_uris(std::slice::from_ref(&quote.uri)).await {
                    Ok(posts) => posts
                        .iter()
                        .find(|p| p.uri == quote.uri)
                        .map(quoted_summary),
                    Err(e) => {
                        self.absorb("quoted post", &quote.uri, e)?;
                        None
                    }
                }
            }
        };

        self.quote_cache
            .lock()
            .await
            .insert(quote.uri, summary.clone());
        Ok(summary)
    }

    async fn thread(&self, uri: &str, depth: u32) -> Result<Option<ThreadViewPost>> {
        match self.api.thread(uri, depth).await {
            Ok(thread) => Ok(thread),
            Err(e) => {
                self.absorb("thread", uri, e)?;
                Ok(None)
            }
        }
    }

    async fn reply_count(&self, uri: &str, depth: u32) -> Result<u64> {
        Ok(self
            .thread(uri, depth)
            .await?
            .map(|t| t.replies.len() as u64)
            .unwrap_or(0))
    }

    async fn first_page<T>(
        &self,
        what: &'static str,
        uri: &str,
        fetch: impl Future<Output = bsky_client::Result<Page<T>>>,
    ) -> Result<Vec<T>> {
        match fetch.await {
            Ok(page) => {
                self.note_malformed(page.skipped);
                Ok(page.items)
            }
            Err(e) => {
                self.absorb(what, uri, e)?;
                Ok(Vec::new())
            }
        }
    }

    /// Page through a listing until the cursor runs out. A failed page keeps
    /// whatever earlier pages returned.
    async fn drain<T, F, Fut>(&self, what: &'static str, uri: &str, mut fetch: F) -> Result<Vec<T>>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = bsky_client::Result<Page<T>>>,
    {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            match fetch(cursor.clone()).await {
                Ok(page) => {
                    self.note_malformed(page.skipped);
                    let exhausted =
                        page.items.is_empty() || page.cursor.is_none() || page.cursor == cursor;
                    out.extend(page.items);
                    if exhausted {
                        break;
                    }
                    cursor = page.cursor;
                }
                Err(e) => {
                    self.absorb(what, uri, e)?;
                    break;
                }
            }
        }
        Ok(out)
    }

    fn note_malformed(&self, skipped: usize) {
        if skipped > 0 {
            self.counters
                .malformed
                .fetch_add(skipped as u32, Ordering::Relaxed);
        }
    }

    /// Swallow a leaf failure, unless the session itself is gone.
    fn absorb(&self, what: &'static str, uri: &str, err: BskyError) -> Result<()> {
        if err.is_auth() {
            return Err(CollectError::from(err));
        }
        warn!(what, uri, error = %err, "Sub-fetch failed, continuing with partial data");
        self.counters.branch_failures.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Actors seen on the post itself: its author (the original author for a
/// repost) and the quoted author when known.
fn own_participants(post: &PostView, quoted: Option<&QuotedPost>) -> Vec<Actor> {
    let mut out = vec![actor_of(&post.author)];
    if let Some(q) = quoted.filter(|q| q.author_handle != post.author.handle) {
        out.push(Actor {
            id: q.author_id.clone(),
            handle: q.author_handle.clone(),
            display_name: None,
            labels: Vec::new(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{actor, bare_quote_of, post, MockPlatform};

    fn builder(mock: MockPlatform) -> (TreeBuilder, Arc<MockPlatform>) {
        let mock = Arc::new(mock);
        (TreeBuilder::new(mock.clone(), ExpandSettings::default()), mock)
    }

    #[tokio::test]
    async fn visited_uri_emits_nothing() {
        let p = post("did:plc:a", "a.test", "1");
        let (builder, mock) = builder(MockPlatform::new());
        let visited = HashSet::from([p.uri.clone()]);

        let out = builder
            .expand(&p, false, ExpansionContext::Recursive, &visited)
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(mock.total_calls(), 0);
    }

    #[tokio::test]
    async fn counts_only_keeps_no_detail() {
        let p = post("did:plc:a", "a.test", "1");
        let likers: Vec<_> = (0..3).map(|i| actor(&format!("l{i}.test"))).collect();
        let (builder, _) = builder(MockPlatform::new().on_likes(&p.uri, likers));

        let out = builder
            .expand(&p, false, ExpansionContext::AuthorFeedOther, &HashSet::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.item.counts.like, 3);
        assert!(out.item.children.is_none());
        // Likers are counted, not harvested; the author still is.
        let handles: Vec<_> = out.participants.iter().map(|a| a.handle.as_str()).collect();
        assert_eq!(handles, vec!["a.test"]);
    }

    #[tokio::test]
    async fn leaf_failure_degrades_to_zero() {
        let p = post("did:plc:a", "a.test", "1");
        let (builder, _) = builder(MockPlatform::new().fail_likes(&p.uri));

        let out = builder
            .expand(&p, false, ExpansionContext::OwnOriginal, &HashSet::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.item.counts.like, 0);
        assert!(out.item.children.is_some());

        let mut stats = HarvestStats::default();
        builder.record_stats(&mut stats);
        assert_eq!(stats.branch_failures, 1);
    }

    #[tokio::test]
    async fn auth_failure_propagates() {
        let p = post("did:plc:a", "a.test", "1");
        let (builder, _) = builder(MockPlatform::new().expire_session());

        let err = builder
            .expand(&p, false, ExpansionContext::OwnOriginal, &HashSet::new())
            .await
            .unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn quote_without_author_is_looked_up_once() {
        let quoted = post("did:plc:q", "q.test", "orig");
        let q1 = bare_quote_of(post("did:plc:a", "a.test", "1"), &quoted);
        let q2 = bare_quote_of(post("did:plc:b", "b.test", "2"), &quoted);
        let (builder, mock) = builder(MockPlatform::new().with_post(quoted.clone()));

        for p in [&q1, &q2] {
            let out = builder
                .expand(p, false, ExpansionContext::AuthorFeedOther, &HashSet::new())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(out.item.relation.original_author.as_deref(), Some("q.test"));
            assert_eq!(out.item.quoted.as_ref().unwrap().author_id, "did:plc:q");
            assert!(out.participants.iter().any(|a| a.handle == "q.test"));
        }
        assert_eq!(mock.calls("get_by_uris"), 1);
    }
}
