use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- Pagination ---

/// One page of a paginated XRPC listing. `cursor == None` ends the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub cursor: Option<String>,
    /// Entries dropped because they failed to decode.
    pub skipped: usize,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, cursor: Option<String>) -> Self {
        Self {
            items,
            cursor,
            skipped: 0,
        }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self::new(items, None)
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), None)
    }

    pub fn with_skipped(mut self, skipped: usize) -> Self {
        self.skipped = skipped;
        self
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self::empty()
    }
}

// --- Session ---

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CreateSessionInput<'a> {
    pub identifier: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub did: String,
    pub handle: String,
    pub access_jwt: String,
    #[serde(default)]
    pub refresh_jwt: Option<String>,
}

// --- Actors ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub val: String,
    #[serde(default)]
    pub src: Option<String>,
}

/// `app.bsky.actor.defs#profileView` (and the basic variant, which is a subset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub did: String,
    pub handle: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub indexed_at: Option<String>,
}

// --- Posts ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub parent: StrongRef,
    pub root: StrongRef,
}

/// The `app.bsky.feed.post` record carried inside a post view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRef>,
}

/// `app.bsky.feed.defs#postView`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub uri: String,
    pub cid: String,
    pub author: ProfileView,
    #[serde(default)]
    pub record: PostRecord,
    /// Hydrated embed view (`app.bsky.embed.*#view`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<Value>,
    #[serde(default)]
    pub like_count: Option<u64>,
    #[serde(default)]
    pub repost_count: Option<u64>,
    #[serde(default)]
    pub reply_count: Option<u64>,
    #[serde(default)]
    pub quote_count: Option<u64>,
    #[serde(default)]
    pub indexed_at: Option<String>,
}

/// A quote reference pulled out of a post's embed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuoteRef {
    pub uri: String,
    /// The remaining fields come from the hydrated view and may be absent.
    pub author_handle: Option<String>,
    pub author_did: Option<String>,
    pub text: Option<String>,
    pub created_at: Option<String>,
}

const EMBED_RECORD: &str = "app.bsky.embed.record";
const EMBED_RECORD_WITH_MEDIA: &str = "app.bsky.embed.recordWithMedia";
const REASON_REPOST: &str = "app.bsky.feed.defs#reasonRepost";

impl PostView {
    /// The quoted post, if this post embeds one (plain or with media).
    pub fn quote_ref(&self) -> Option<QuoteRef> {
        let embed = self.record.embed.as_ref()?;
        let uri_pointer = match embed.get("$type").and_then(Value::as_str)? {
            EMBED_RECORD => "/record/uri",
            EMBED_RECORD_WITH_MEDIA => "/record/record/uri",
            _ => return None,
        };
        let uri = embed.pointer(uri_pointer)?.as_str()?.to_string();

        // recordWithMedia views nest the record view one level deeper.
        let view_record = self.embed.as_ref().and_then(|view| {
            [view.pointer("/record/record"), view.pointer("/record")]
                .into_iter()
                .flatten()
                .find(|r| r.get("uri").and_then(Value::as_str) == Some(uri.as_str()))
        });
        let field = |pointer: &str| {
            view_record
                .and_then(|r| r.pointer(pointer))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Some(QuoteRef {
            author_handle: field("/author/handle"),
            author_did: field("/author/did"),
            text: field("/value/text"),
            created_at: field("/value/createdAt"),
            uri,
        })
    }

    pub fn is_reply(&self) -> bool {
        self.record.reply.is_some()
    }
}

/// `app.bsky.feed.defs#feedViewPost`: a post plus the reason it is in the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedViewPost {
    pub post: PostView,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,
}

impl FeedViewPost {
    pub fn new(post: PostView) -> Self {
        Self { post, reason: None }
    }

    /// True when the feed owner reposted this post rather than authoring it.
    pub fn is_repost(&self) -> bool {
        self.reason
            .as_ref()
            .and_then(|r| r.get("$type"))
            .and_then(Value::as_str)
            == Some(REASON_REPOST)
    }
}

// --- Threads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum ThreadNode {
    #[serde(rename = "app.bsky.feed.defs#threadViewPost")]
    Post(ThreadViewPost),
    #[serde(rename = "app.bsky.feed.defs#notFoundPost")]
    NotFound { uri: String },
    #[serde(rename = "app.bsky.feed.defs#blockedPost")]
    Blocked { uri: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadViewPost {
    pub post: PostView,
    #[serde(default)]
    pub replies: Vec<ThreadNode>,
}

impl ThreadViewPost {
    /// Direct replies that resolved to visible posts.
    pub fn reply_posts(&self) -> impl Iterator<Item = &ThreadViewPost> {
        self.replies.iter().filter_map(|node| match node {
            ThreadNode::Post(p) => Some(p),
            _ => None,
        })
    }
}

// --- Feed generators ---

/// `app.bsky.feed.defs#generatorView`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorView {
    pub uri: String,
    pub cid: String,
    pub did: String,
    pub creator: ProfileView,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub like_count: Option<u64>,
    #[serde(default)]
    pub indexed_at: Option<String>,
}

// --- Search ---

/// Sort order accepted by `app.bsky.feed.searchPosts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSort {
    Top,
    Latest,
}

impl SearchSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchSort::Top => "top",
            SearchSort::Latest => "latest",
        }
    }
}

/// Query parameters for `app.bsky.feed.searchPosts`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchParams {
    pub q: String,
    pub limit: u32,
    pub author: Option<String>,
    pub domain: Option<String>,
    pub lang: Option<String>,
    pub mentions: Option<String>,
    pub tag: Option<String>,
    pub url: Option<String>,
    /// RFC 3339 lower bound (inclusive).
    pub since: Option<String>,
    /// RFC 3339 upper bound (exclusive).
    pub until: Option<String>,
    pub sort: Option<SearchSort>,
}

impl SearchParams {
    pub(crate) fn to_query(&self, cursor: Option<&str>) -> Vec<(&'static str, String)> {
        let mut query = vec![("q", self.q.clone()), ("limit", self.limit.to_string())];
        let optional = [
            ("author", &self.author),
            ("domain", &self.domain),
            ("lang", &self.lang),
            ("mentions", &self.mentions),
            ("tag", &self.tag),
            ("url", &self.url),
            ("since", &self.since),
            ("until", &self.until),
        ];
        for (key, value) in optional {
            if let Some(v) = value {
                query.push((key, v.clone()));
            }
        }
        if let Some(sort) = self.sort {
            query.push(("sort", sort.as_str().to_string()));
        }
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }
        query
    }
}

// --- Raw XRPC response envelopes ---

#[derive(Deserialize)]
pub(crate) struct SearchPostsResponse {
    #[serde(default)]
    pub posts: Vec<Value>,
    pub cursor: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct FeedResponse {
    #[serde(default)]
    pub feed: Vec<Value>,
    pub cursor: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct LikesResponse {
    #[serde(default)]
    pub likes: Vec<Value>,
    pub cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RepostedByResponse {
    #[serde(default)]
    pub reposted_by: Vec<Value>,
    pub cursor: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct QuotesResponse {
    #[serde(default)]
    pub posts: Vec<Value>,
    pub cursor: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ThreadResponse {
    pub thread: ThreadNode,
}

#[derive(Deserialize)]
pub(crate) struct PostsResponse {
    #[serde(default)]
    pub posts: Vec<Value>,
}

#[derive(Deserialize)]
pub(crate) struct SuggestedFeedsResponse {
    #[serde(default)]
    pub feeds: Vec<Value>,
    pub cursor: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct LikeEntry {
    pub actor: ProfileView,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post_json(embed: Value, view_embed: Option<Value>) -> PostView {
        let mut v = json!({
            "uri": "at://did:plc:a/app.bsky.feed.post/1",
            "cid": "cid1",
            "author": {"did": "did:plc:a", "handle": "a.test"},
            "record": {"text": "hi", "createdAt": "2024-03-01T00:00:00Z", "embed": embed},
        });
        if let Some(e) = view_embed {
            v["embed"] = e;
        }
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn plain_record_embed_without_view_has_no_author() {
        let post = post_json(
            json!({"$type": "app.bsky.embed.record", "record": {"uri": "at://q/1", "cid": "c"}}),
            None,
        );
        assert_eq!(
            post.quote_ref(),
            Some(QuoteRef {
                uri: "at://q/1".into(),
                ..Default::default()
            })
        );
    }

    #[test]
    fn hydrated_view_supplies_quote_author() {
        let post = post_json(
            json!({"$type": "app.bsky.embed.record", "record": {"uri": "at://q/1", "cid": "c"}}),
            Some(json!({
                "$type": "app.bsky.embed.record#view",
                "record": {
                    "$type": "app.bsky.embed.record#viewRecord",
                    "uri": "at://q/1",
                    "author": {"did": "did:plc:q", "handle": "q.test"},
                    "value": {"text": "quoted text", "createdAt": "2024-02-02T00:00:00Z"}
                }
            })),
        );
        let quote = post.quote_ref().unwrap();
        assert_eq!(quote.author_handle.as_deref(), Some("q.test"));
        assert_eq!(quote.author_did.as_deref(), Some("did:plc:q"));
        assert_eq!(quote.text.as_deref(), Some("quoted text"));
    }

    #[test]
    fn record_with_media_reads_nested_uri() {
        let post = post_json(
            json!({
                "$type": "app.bsky.embed.recordWithMedia",
                "record": {"record": {"uri": "at://q/2", "cid": "c"}},
                "media": {"$type": "app.bsky.embed.images", "images": []}
            }),
            None,
        );
        let quote = post.quote_ref().unwrap();
        assert_eq!(quote.uri, "at://q/2");
        assert!(quote.author_handle.is_none());
    }

    #[test]
    fn image_embed_is_not_a_quote() {
        let post = post_json(json!({"$type": "app.bsky.embed.images", "images": []}), None);
        assert!(post.quote_ref().is_none());
    }

    #[test]
    fn repost_reason_is_detected() {
        let post = post_json(Value::Null, None);
        let mut item = FeedViewPost::new(post);
        assert!(!item.is_repost());
        item.reason = Some(json!({"$type": "app.bsky.feed.defs#reasonRepost"}));
        assert!(item.is_repost());
    }

    #[test]
    fn thread_tolerates_unknown_and_missing_replies() {
        let thread: ThreadNode = serde_json::from_value(json!({
            "$type": "app.bsky.feed.defs#threadViewPost",
            "post": {
                "uri": "at://a/1", "cid": "c",
                "author": {"did": "did:plc:a", "handle": "a.test"},
                "record": {"text": "root"}
            },
            "replies": [
                {"$type": "app.bsky.feed.defs#notFoundPost", "uri": "at://gone", "notFound": true},
                {"$type": "app.bsky.feed.defs#somethingNew"},
                {
                    "$type": "app.bsky.feed.defs#threadViewPost",
                    "post": {
                        "uri": "at://b/1", "cid": "c",
                        "author": {"did": "did:plc:b", "handle": "b.test"},
                        "record": {"text": "reply"}
                    }
                }
            ]
        }))
        .unwrap();

        let ThreadNode::Post(view) = thread else {
            panic!("expected thread view");
        };
        assert_eq!(view.replies.len(), 3);
        let visible: Vec<_> = view.reply_posts().map(|r| r.post.uri.as_str()).collect();
        assert_eq!(visible, vec!["at://b/1"]);
    }

    #[test]
    fn search_query_includes_only_set_filters() {
        let params = SearchParams {
            q: "rust".into(),
            limit: 100,
            lang: Some("en".into()),
            since: Some("2024-02-01T00:00:00Z".into()),
            sort: Some(SearchSort::Latest),
            ..Default::default()
        };
        let query = params.to_query(Some("abc"));
        let keys: Vec<_> = query.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["q", "limit", "lang", "since", "sort", "cursor"]);
    }
}
