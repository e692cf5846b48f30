pub mod error;
pub mod types;

pub use error::{BskyError, Result};
pub use types::{
    FeedViewPost, GeneratorView, Label, Page, PostRecord, PostView, ProfileView, QuoteRef,
    ReplyRef, SearchParams, SearchSort, Session, StrongRef, ThreadNode, ThreadViewPost,
};

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use types::{
    CreateSessionInput, FeedResponse, LikeEntry, LikesResponse, PostsResponse, QuotesResponse,
    RepostedByResponse, SearchPostsResponse, SuggestedFeedsResponse, ThreadResponse,
};

pub const DEFAULT_HOST: &str = "https://bsky.social";

/// Upper bound the app view accepts for `limit` on list endpoints.
pub const MAX_PAGE_SIZE: u32 = 100;

/// `app.bsky.feed.getPosts` accepts at most this many URIs per call.
const MAX_POSTS_PER_LOOKUP: usize = 25;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BskyClient {
    client: reqwest::Client,
    host: String,
    session: Option<Session>,
}

impl BskyClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.into().trim_end_matches('/').to_string(),
            session: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Open a session with `com.atproto.server.createSession`.
    ///
    /// The primary password is tried first. When it is rejected and an app
    /// password is available, that is tried before giving up.
    pub async fn login(
        &mut self,
        identifier: &str,
        password: &str,
        app_password: Option<&str>,
    ) -> Result<&Session> {
        let primary = self.create_session(identifier, password).await;
        let session = match (primary, app_password) {
            (Ok(session), _) => session,
            (Err(err), Some(app_password)) if err.is_auth() => {
                tracing::warn!(identifier, error = %err, "Primary password rejected, trying app password");
                self.create_session(identifier, app_password).await?
            }
            (Err(err), _) => return Err(err),
        };

        tracing::info!(identifier, did = %session.did, "Bluesky session established");
        Ok(&*self.session.insert(session))
    }

    async fn create_session(&self, identifier: &str, password: &str) -> Result<Session> {
        let url = format!("{}/xrpc/com.atproto.server.createSession", self.host);
        let resp = self
            .client
            .post(&url)
            .json(&CreateSessionInput {
                identifier,
                password,
            })
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match BskyError::from_response(status.as_u16(), &body) {
                // Any rejection of credentials is an auth failure here.
                BskyError::Api { status: 400, message } => BskyError::Auth(message),
                other => other,
            });
        }

        Ok(resp.json().await?)
    }

    /// GET an XRPC query endpoint with the session's bearer token.
    async fn xrpc_get<T: DeserializeOwned>(&self, nsid: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/xrpc/{}", self.host, nsid);
        let mut req = self.client.get(&url).query(query).timeout(REQUEST_TIMEOUT);
        if let Some(session) = &self.session {
            req = req.bearer_auth(&session.access_jwt);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BskyError::from_response(status.as_u16(), &body));
        }

        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn search_posts(
        &self,
        params: &SearchParams,
        cursor: Option<&str>,
    ) -> Result<Page<PostView>> {
        let resp: SearchPostsResponse = self
            .xrpc_get("app.bsky.feed.searchPosts", &params.to_query(cursor))
            .await?;
        Ok(decode_page(resp.posts, resp.cursor, "post"))
    }

    pub async fn author_feed(
        &self,
        actor: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<FeedViewPost>> {
        let query = paged_query(("actor", actor), limit, cursor);
        let resp: FeedResponse = self.xrpc_get("app.bsky.feed.getAuthorFeed", &query).await?;
        Ok(decode_page(resp.feed, resp.cursor, "feed item"))
    }

    pub async fn feed(
        &self,
        feed_uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<FeedViewPost>> {
        let query = paged_query(("feed", feed_uri), limit, cursor);
        let resp: FeedResponse = self.xrpc_get("app.bsky.feed.getFeed", &query).await?;
        Ok(decode_page(resp.feed, resp.cursor, "feed item"))
    }

    /// Actors who liked `uri`.
    pub async fn likes(
        &self,
        uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<ProfileView>> {
        let query = paged_query(("uri", uri), limit, cursor);
        let resp: LikesResponse = self.xrpc_get("app.bsky.feed.getLikes", &query).await?;
        let likes = decode_page::<LikeEntry>(resp.likes, resp.cursor, "like");
        let skipped = likes.skipped;
        let actors = likes.items.into_iter().map(|like| like.actor).collect();
        Ok(Page::new(actors, likes.cursor).with_skipped(skipped))
    }

    pub async fn reposted_by(
        &self,
        uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<ProfileView>> {
        let query = paged_query(("uri", uri), limit, cursor);
        let resp: RepostedByResponse = self.xrpc_get("app.bsky.feed.getRepostedBy", &query).await?;
        Ok(decode_page(resp.reposted_by, resp.cursor, "profile"))
    }

    pub async fn quotes(
        &self,
        uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<PostView>> {
        let query = paged_query(("uri", uri), limit, cursor);
        let resp: QuotesResponse = self.xrpc_get("app.bsky.feed.getQuotes", &query).await?;
        Ok(decode_page(resp.posts, resp.cursor, "post"))
    }

    /// Thread rooted at `uri`, `depth` levels of replies deep.
    /// Deleted or blocked roots come back as `None`.
    pub async fn thread(&self, uri: &str, depth: u32) -> Result<Option<ThreadViewPost>> {
        let query = [("uri", uri.to_string()), ("depth", depth.to_string())];
        match self
            .xrpc_get::<ThreadResponse>("app.bsky.feed.getPostThread", &query)
            .await
        {
            Ok(ThreadResponse {
                thread: ThreadNode::Post(view),
            }) => Ok(Some(view)),
            Ok(_) => Ok(None),
            Err(BskyError::Api { status: 400, message }) if is_not_found(&message) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Hydrate posts by URI. Unknown URIs are simply absent from the result.
    pub async fn posts(&self, uris: &[String]) -> Result<Vec<PostView>> {
        let mut out = Vec::with_capacity(uris.len());
        for chunk in uris.chunks(MAX_POSTS_PER_LOOKUP) {
            let query: Vec<(&str, String)> = chunk.iter().map(|u| ("uris", u.clone())).collect();
            let resp: PostsResponse = self.xrpc_get("app.bsky.feed.getPosts", &query).await?;
            out.extend(decode_page::<PostView>(resp.posts, None, "post").items);
        }
        Ok(out)
    }

    pub async fn suggested_feeds(
        &self,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<GeneratorView>> {
        let mut query = vec![("limit", limit.min(MAX_PAGE_SIZE).to_string())];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }
        let resp: SuggestedFeedsResponse = self
            .xrpc_get("app.bsky.feed.getSuggestedFeeds", &query)
            .await?;
        Ok(decode_page(resp.feeds, resp.cursor, "feed generator"))
    }
}

fn paged_query<'a>(
    subject: (&'a str, &str),
    limit: u32,
    cursor: Option<&str>,
) -> Vec<(&'a str, String)> {
    let mut query = vec![
        (subject.0, subject.1.to_string()),
        ("limit", limit.clamp(1, MAX_PAGE_SIZE).to_string()),
    ];
    if let Some(c) = cursor {
        query.push(("cursor", c.to_string()));
    }
    query
}

fn is_not_found(message: &str) -> bool {
    message.to_ascii_lowercase().contains("not found")
}

/// Decode list entries one at a time so a single malformed entry does not
/// sink the whole page.
fn decode_page<T: DeserializeOwned>(raw: Vec<Value>, cursor: Option<String>, kind: &str) -> Page<T> {
    let total = raw.len();
    let items: Vec<T> = raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!(kind, error = %e, "Skipping malformed entry");
                None
            }
        })
        .collect();
    let skipped = total - items.len();
    Page::new(items, cursor).with_skipped(skipped)
}

/// Web permalink for a post.
///
/// `at://did:plc:xxx/app.bsky.feed.post/rkey` → `https://bsky.app/profile/<handle>/post/rkey`
pub fn permalink(uri: &str, handle: &str) -> Option<String> {
    let rkey = uri.rsplit('/').next().filter(|r| !r.is_empty())?;
    Some(format!("https://bsky.app/profile/{handle}/post/{rkey}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn permalink_uses_rkey_and_handle() {
        assert_eq!(
            permalink("at://did:plc:abc/app.bsky.feed.post/3kxyz", "alice.bsky.social").as_deref(),
            Some("https://bsky.app/profile/alice.bsky.social/post/3kxyz")
        );
        assert_eq!(permalink("at://did:plc:abc/", "a"), None);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let raw = vec![
            json!({"did": "did:plc:a", "handle": "a.test"}),
            json!({"handle": 7}),
            json!({"did": "did:plc:b", "handle": "b.test", "displayName": "B"}),
        ];
        let page: Page<ProfileView> = decode_page(raw, Some("next".into()), "profile");
        let handles: Vec<_> = page.items.iter().map(|a| a.handle.as_str()).collect();
        assert_eq!(handles, vec!["a.test", "b.test"]);
        assert_eq!(page.skipped, 1);
        assert_eq!(page.cursor.as_deref(), Some("next"));
    }

    #[test]
    fn paged_query_clamps_limit() {
        let query = paged_query(("uri", "at://x"), 500, None);
        assert_eq!(query[1], ("limit", "100".to_string()));
        let query = paged_query(("uri", "at://x"), 0, Some("c1"));
        assert_eq!(query[1], ("limit", "1".to_string()));
        assert_eq!(query[2], ("cursor", "c1".to_string()));
    }

    #[test]
    fn host_trailing_slash_is_trimmed() {
        let client = BskyClient::new("https://bsky.social/");
        assert_eq!(client.host(), "https://bsky.social");
        assert!(client.session().is_none());
    }
}
