// Trait seams for the collector.
//
// PlatformApi: every read the engine makes against the network.
// Connector: turns one Identity into an authenticated PlatformApi. Each
//   worker task calls it once and owns the result; nothing is shared.
//
// Tests swap in MockPlatform / MockConnector from `testing`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bsky_client::{
    BskyClient, FeedViewPost, GeneratorView, Page, PostView, ProfileView, Result, SearchParams,
    ThreadViewPost,
};
use skyharvest_common::Identity;

// ---------------------------------------------------------------------------
// PlatformApi
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn search(&self, params: &SearchParams, cursor: Option<&str>) -> Result<Page<PostView>>;

    async fn author_feed(
        &self,
        actor: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<FeedViewPost>>;

    async fn likes(&self, uri: &str, limit: u32, cursor: Option<&str>) -> Result<Page<ProfileView>>;

    async fn reposted_by(
        &self,
        uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<ProfileView>>;

    async fn quotes(&self, uri: &str, limit: u32, cursor: Option<&str>) -> Result<Page<PostView>>;

    /// `None` when the root post is gone or blocked.
    async fn thread(&self, uri: &str, depth: u32) -> Result<Option<ThreadViewPost>>;

    async fn feed(
        &self,
        feed_uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<FeedViewPost>>;

    async fn suggested_feeds(&self, limit: u32, cursor: Option<&str>)
        -> Result<Page<GeneratorView>>;

    async fn get_by_uris(&self, uris: &[String]) -> Result<Vec<PostView>>;
}

#[async_trait]
impl PlatformApi for BskyClient {
    async fn search(&self, params: &SearchParams, cursor: Option<&str>) -> Result<Page<PostView>> {
        self.search_posts(params, cursor).await
    }

    async fn author_feed(
        &self,
        actor: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<FeedViewPost>> {
        BskyClient::author_feed(self, actor, limit, cursor).await
    }

    async fn likes(&self, uri: &str, limit: u32, cursor: Option<&str>) -> Result<Page<ProfileView>> {
        BskyClient::likes(self, uri, limit, cursor).await
    }

    async fn reposted_by(
        &self,
        uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<ProfileView>> {
        BskyClient::reposted_by(self, uri, limit, cursor).await
    }

    async fn quotes(&self, uri: &str, limit: u32, cursor: Option<&str>) -> Result<Page<PostView>> {
        BskyClient::quotes(self, uri, limit, cursor).await
    }

    async fn thread(&self, uri: &str, depth: u32) -> Result<Option<ThreadViewPost>> {
        BskyClient::thread(self, uri, depth).await
    }

    async fn feed(
        &self,
        feed_uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<FeedViewPost>> {
        BskyClient::feed(self, feed_uri, limit, cursor).await
    }

    async fn suggested_feeds(
        &self,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<GeneratorView>> {
        BskyClient::suggested_feeds(self, limit, cursor).await
    }

    async fn get_by_uris(&self, uris: &[String]) -> Result<Vec<PostView>> {
        self.posts(uris).await
    }
}

// ---------------------------------------------------------------------------
// Paced: fixed pre-request delay
// ---------------------------------------------------------------------------

/// Sleeps a fixed delay before every call it forwards.
pub struct Paced {
    inner: Arc<dyn PlatformApi>,
    delay: Duration,
}

impl Paced {
    pub fn new(inner: Arc<dyn PlatformApi>, delay: Duration) -> Self {
        Self { inner, delay }
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl PlatformApi for Paced {
    async fn search(&self, params: &SearchParams, cursor: Option<&str>) -> Result<Page<PostView>> {
        self.pause().await;
        self.inner.search(params, cursor).await
    }

    async fn author_feed(
        &self,
        actor: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<FeedViewPost>> {
        self.pause().await;
        self.inner.author_feed(actor, limit, cursor).await
    }

    async fn likes(&self, uri: &str, limit: u32, cursor: Option<&str>) -> Result<Page<ProfileView>> {
        self.pause().await;
        self.inner.likes(uri, limit, cursor).await
    }

    async fn reposted_by(
        &self,
        uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<ProfileView>> {
        self.pause().await;
        self.inner.reposted_by(uri, limit, cursor).await
    }

    async fn quotes(&self, uri: &str, limit: u32, cursor: Option<&str>) -> Result<Page<PostView>> {
        self.pause().await;
        self.inner.quotes(uri, limit, cursor).await
    }

    async fn thread(&self, uri: &str, depth: u32) -> Result<Option<ThreadViewPost>> {
        self.pause().await;
        self.inner.thread(uri, depth).await
    }

    async fn feed(
        &self,
        feed_uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<FeedViewPost>> {
        self.pause().await;
        self.inner.feed(feed_uri, limit, cursor).await
    }

    async fn suggested_feeds(
        &self,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<GeneratorView>> {
        self.pause().await;
        self.inner.suggested_feeds(limit, cursor).await
    }

    async fn get_by_uris(&self, uris: &[String]) -> Result<Vec<PostView>> {
        self.pause().await;
        self.inner.get_by_uris(uris).await
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Connector: Send + Sync {
    /// Authenticate `identity` and hand back a client owned by the caller.
    async fn connect(&self, identity: &Identity) -> crate::Result<Arc<dyn PlatformApi>>;
}

/// Production connector: one `BskyClient` session per identity, paced.
pub struct BskyConnector {
    host: String,
    delay: Duration,
}

impl BskyConnector {
    pub fn new(host: impl Into<String>, delay: Duration) -> Self {
        Self {
            host: host.into(),
            delay,
        }
    }
}

#[async_trait]
impl Connector for BskyConnector {
    async fn connect(&self, identity: &Identity) -> crate::Result<Arc<dyn PlatformApi>> {
        let mut client = BskyClient::new(self.host.clone());
        client
            .login(
                &identity.username,
                &identity.password,
                identity.app_password.as_deref(),
            )
            .await?;
        tracing::info!(worker_id = identity.worker_id, username = %identity.username, "Worker authenticated");
        Ok(Arc::new(Paced::new(Arc::new(client), self.delay)))
    }
}
