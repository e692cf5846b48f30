// Test mocks for the collector.
//
// Two mocks matching the two trait boundaries:
// - MockPlatform (PlatformApi): in-memory network, offset cursors, call counters
// - MockConnector (Connector): username → MockPlatform, with rejected logins
//
// Plus fixture helpers for posts, actors, quotes, replies and content items.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bsky_client::{
    BskyError, FeedViewPost, GeneratorView, Page, PostRecord, PostView, ProfileView, ReplyRef,
    Result, SearchParams, StrongRef, ThreadNode, ThreadViewPost,
};
use serde_json::json;

use skyharvest_common::{parse_timestamp, ContentItem, ExpansionContext, Identity};

use crate::traits::{Connector, PlatformApi};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Timestamp given to fixture posts unless overridden.
pub const FIXTURE_CREATED_AT: &str = "2024-02-02T12:00:00.000Z";

pub fn post_uri(did: &str, rkey: &str) -> String {
    format!("at://{did}/app.bsky.feed.post/{rkey}")
}

pub fn actor(handle: &str) -> ProfileView {
    ProfileView {
        did: format!("did:plc:{}", handle.replace('.', "-")),
        handle: handle.to_string(),
        display_name: None,
        labels: Vec::new(),
        indexed_at: None,
    }
}

/// `n` distinct actors named `<prefix>-<i>.test`.
pub fn actors(prefix: &str, n: usize) -> Vec<ProfileView> {
    (0..n).map(|i| actor(&format!("{prefix}-{i}.test"))).collect()
}

pub fn post(did: &str, handle: &str, rkey: &str) -> PostView {
    PostView {
        uri: post_uri(did, rkey),
        cid: format!("cid-{rkey}"),
        author: ProfileView {
            did: did.to_string(),
            ..actor(handle)
        },
        record: PostRecord {
            text: format!("post {rkey} by {handle}"),
            created_at: Some(FIXTURE_CREATED_AT.to_string()),
            embed: None,
            reply: None,
        },
        embed: None,
        like_count: None,
        repost_count: None,
        reply_count: None,
        quote_count: None,
        indexed_at: Some(FIXTURE_CREATED_AT.to_string()),
    }
}

pub fn post_at(did: &str, handle: &str, rkey: &str, created_at: &str) -> PostView {
    let mut p = post(did, handle, rkey);
    p.record.created_at = Some(created_at.to_string());
    p
}

/// Embed `quoted` in `p`, with a hydrated view that names the quoted author.
pub fn quote_of(p: PostView, quoted: &PostView) -> PostView {
    let mut p = bare_quote_of(p, quoted);
    p.embed = Some(json!({
        "$type": "app.bsky.embed.record#view",
        "record": {
            "$type": "app.bsky.embed.record#viewRecord",
            "uri": quoted.uri,
            "cid": quoted.cid,
            "author": {"did": quoted.author.did, "handle": quoted.author.handle},
            "value": {"text": quoted.record.text, "createdAt": quoted.record.created_at},
        }
    }));
    p
}

/// Embed `quoted` in `p` by reference only; the author has to be looked up.
pub fn bare_quote_of(mut p: PostView, quoted: &PostView) -> PostView {
    p.record.embed = Some(json!({
        "$type": "app.bsky.embed.record",
        "record": {"uri": quoted.uri, "cid": quoted.cid},
    }));
    p
}

pub fn reply_to(mut p: PostView, root: &str, parent: &str) -> PostView {
    p.record.reply = Some(ReplyRef {
        parent: StrongRef {
            uri: parent.to_string(),
            cid: None,
        },
        root: StrongRef {
            uri: root.to_string(),
            cid: None,
        },
    });
    p
}

/// Feed entry showing `p` as reposted by the feed owner.
pub fn reposted(p: PostView) -> FeedViewPost {
    FeedViewPost {
        post: p,
        reason: Some(json!({"$type": "app.bsky.feed.defs#reasonRepost"})),
    }
}

pub fn generator(uri: &str, name: &str) -> GeneratorView {
    GeneratorView {
        uri: uri.to_string(),
        cid: format!("cid-{name}"),
        did: "did:web:feeds.test".to_string(),
        creator: actor("feeds.test"),
        display_name: name.to_string(),
        description: None,
        like_count: None,
        indexed_at: None,
    }
}

/// Minimal content item for persistence tests.
pub fn item(uri: &str) -> ContentItem {
    ContentItem {
        uri: uri.to_string(),
        cid: "cid".to_string(),
        author_handle: "a.test".to_string(),
        author_id: "did:plc:a".to_string(),
        author_display_name: None,
        text: String::new(),
        url: None,
        created_at: Some(FIXTURE_CREATED_AT.to_string()),
        indexed_at: None,
        relation: Default::default(),
        quoted: None,
        counts: Default::default(),
        children: None,
        source_context: ExpansionContext::SearchOriginal,
        search_keyword: None,
    }
}

pub fn identity(worker_id: usize, username: &str) -> Identity {
    Identity {
        worker_id,
        username: username.to_string(),
        password: "hunter2".to_string(),
        app_password: None,
    }
}

// ---------------------------------------------------------------------------
// MockPlatform
// ---------------------------------------------------------------------------

/// In-memory network. Unregistered uris return empty listings; cursors are
/// stringified offsets. Builder pattern: `.on_search()`, `.on_likes()`, ...
#[derive(Default)]
pub struct MockPlatform {
    posts: HashMap<String, PostView>,
    searches: HashMap<String, Vec<PostView>>,
    author_feeds: HashMap<String, Vec<FeedViewPost>>,
    feeds: HashMap<String, Vec<FeedViewPost>>,
    suggested: Vec<GeneratorView>,
    likes: HashMap<String, Vec<ProfileView>>,
    reposts: HashMap<String, Vec<ProfileView>>,
    quotes: HashMap<String, Vec<PostView>>,
    replies: HashMap<String, Vec<PostView>>,
    failing_likes: HashSet<String>,
    failing_threads: HashSet<String>,
    session_expired: bool,
    search_pages_before_expiry: Option<usize>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `p` resolvable by uri and as a thread root.
    pub fn with_post(mut self, p: PostView) -> Self {
        self.posts.insert(p.uri.clone(), p);
        self
    }

    pub fn on_search(mut self, query: &str, posts: Vec<PostView>) -> Self {
        self.searches.insert(query.to_string(), posts);
        self
    }

    pub fn on_author_feed(mut self, handle: &str, entries: Vec<FeedViewPost>) -> Self {
        self.author_feeds.insert(handle.to_string(), entries);
        self
    }

    pub fn on_feed(mut self, uri: &str, entries: Vec<FeedViewPost>) -> Self {
        self.feeds.insert(uri.to_string(), entries);
        self
    }

    pub fn on_suggested_feeds(mut self, feeds: Vec<GeneratorView>) -> Self {
        self.suggested = feeds;
        self
    }

    pub fn on_likes(mut self, uri: &str, likers: Vec<ProfileView>) -> Self {
        self.likes.insert(uri.to_string(), likers);
        self
    }

    pub fn on_reposts(mut self, uri: &str, reposters: Vec<ProfileView>) -> Self {
        self.reposts.insert(uri.to_string(), reposters);
        self
    }

    pub fn on_quotes(mut self, uri: &str, quotes: Vec<PostView>) -> Self {
        self.quotes.insert(uri.to_string(), quotes);
        self
    }

    /// Direct replies returned in `uri`'s thread.
    pub fn on_replies(mut self, uri: &str, replies: Vec<PostView>) -> Self {
        self.replies.insert(uri.to_string(), replies);
        self
    }

    pub fn fail_likes(mut self, uri: &str) -> Self {
        self.failing_likes.insert(uri.to_string());
        self
    }

    pub fn fail_thread(mut self, uri: &str) -> Self {
        self.failing_threads.insert(uri.to_string());
        self
    }

    /// Every call fails with an authentication error.
    pub fn expire_session(mut self) -> Self {
        self.session_expired = true;
        self
    }

    /// Search calls after the first `pages` fail with an authentication error.
    pub fn expire_search_after(mut self, pages: usize) -> Self {
        self.search_pages_before_expiry = Some(pages);
        self
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Count the call and report how many of this method came before it.
    fn record(&self, method: &'static str) -> Result<usize> {
        let mut calls = self.calls.lock().unwrap();
        let count = calls.entry(method).or_insert(0);
        let before = *count;
        *count += 1;
        if self.session_expired {
            return Err(BskyError::Auth("ExpiredToken: mock session expired".into()));
        }
        Ok(before)
    }
}

fn paginate<T: Clone>(all: &[T], limit: u32, cursor: Option<&str>) -> Page<T> {
    let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
    let end = (start + limit.max(1) as usize).min(all.len());
    let items = all.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
    let next = (end < all.len()).then(|| end.to_string());
    Page::new(items, next)
}

fn within(p: &PostView, since: Option<&str>, until: Option<&str>) -> bool {
    let Some(created) = p.record.created_at.as_deref().and_then(parse_timestamp) else {
        return true;
    };
    let after_since = since
        .and_then(parse_timestamp)
        .map_or(true, |s| created >= s);
    let before_until = until
        .and_then(parse_timestamp)
        .map_or(true, |u| created < u);
    after_since && before_until
}

#[async_trait]
impl PlatformApi for MockPlatform {
    async fn search(&self, params: &SearchParams, cursor: Option<&str>) -> Result<Page<PostView>> {
        let before = self.record("search")?;
        if self
            .search_pages_before_expiry
            .is_some_and(|pages| before >= pages)
        {
            return Err(BskyError::Auth("ExpiredToken: mock session expired".into()));
        }
        let matching: Vec<PostView> = self
            .searches
            .get(&params.q)
            .map(|posts| {
                posts
                    .iter()
                    .filter(|p| within(p, params.since.as_deref(), params.until.as_deref()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(paginate(&matching, params.limit, cursor))
    }

    async fn author_feed(
        &self,
        actor: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<FeedViewPost>> {
        self.record("author_feed")?;
        let entries = self.author_feeds.get(actor).cloned().unwrap_or_default();
        Ok(paginate(&entries, limit, cursor))
    }

    async fn likes(&self, uri: &str, limit: u32, cursor: Option<&str>) -> Result<Page<ProfileView>> {
        self.record("likes")?;
        if self.failing_likes.contains(uri) {
            return Err(BskyError::Network(format!("mock: likes for {uri} unavailable")));
        }
        let likers = self.likes.get(uri).cloned().unwrap_or_default();
        Ok(paginate(&likers, limit, cursor))
    }

    async fn reposted_by(
        &self,
        uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<ProfileView>> {
        self.record("reposted_by")?;
        let reposters = self.reposts.get(uri).cloned().unwrap_or_default();
        Ok(paginate(&reposters, limit, cursor))
    }

    async fn quotes(&self, uri: &str, limit: u32, cursor: Option<&str>) -> Result<Page<PostView>> {
        self.record("quotes")?;
        let quotes = self.quotes.get(uri).cloned().unwrap_or_default();
        Ok(paginate(&quotes, limit, cursor))
    }

    async fn thread(&self, uri: &str, _depth: u32) -> Result<Option<ThreadViewPost>> {
        self.record("thread")?;
        if self.failing_threads.contains(uri) {
            return Err(BskyError::Network(format!("mock: thread for {uri} unavailable")));
        }
        let Some(root) = self.posts.get(uri).cloned() else {
            return Ok(None);
        };
        let replies = self
            .replies
            .get(uri)
            .map(|posts| {
                posts
                    .iter()
                    .map(|p| {
                        ThreadNode::Post(ThreadViewPost {
                            post: p.clone(),
                            replies: Vec::new(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(ThreadViewPost {
            post: root,
            replies,
        }))
    }

    async fn feed(
        &self,
        feed_uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<FeedViewPost>> {
        self.record("feed")?;
        let entries = self.feeds.get(feed_uri).cloned().unwrap_or_default();
        Ok(paginate(&entries, limit, cursor))
    }

    async fn suggested_feeds(
        &self,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<GeneratorView>> {
        self.record("suggested_feeds")?;
        Ok(paginate(&self.suggested, limit, cursor))
    }

    async fn get_by_uris(&self, uris: &[String]) -> Result<Vec<PostView>> {
        self.record("get_by_uris")?;
        Ok(uris
            .iter()
            .filter_map(|uri| self.posts.get(uri).cloned())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MockConnector
// ---------------------------------------------------------------------------

/// Hands each identity its own platform by username; rejected usernames fail
/// to authenticate. Unknown usernames get the fallback platform.
pub struct MockConnector {
    fallback: Arc<MockPlatform>,
    platforms: HashMap<String, Arc<MockPlatform>>,
    rejected: HashSet<String>,
    connects: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new(fallback: Arc<MockPlatform>) -> Self {
        Self {
            fallback,
            platforms: HashMap::new(),
            rejected: HashSet::new(),
            connects: Mutex::new(Vec::new()),
        }
    }

    pub fn on_identity(mut self, username: &str, platform: Arc<MockPlatform>) -> Self {
        self.platforms.insert(username.to_string(), platform);
        self
    }

    pub fn reject(mut self, username: &str) -> Self {
        self.rejected.insert(username.to_string());
        self
    }

    /// Usernames connected so far, in call order.
    pub fn connected(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, identity: &Identity) -> crate::Result<Arc<dyn PlatformApi>> {
        self.connects.lock().unwrap().push(identity.username.clone());
        if self.rejected.contains(&identity.username) {
            return Err(crate::CollectError::Authentication(format!(
                "mock: {} rejected",
                identity.username
            )));
        }
        let platform: Arc<dyn PlatformApi> = self
            .platforms
            .get(&identity.username)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(platform)
    }
}
