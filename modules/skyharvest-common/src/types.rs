use std::fmt;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// --- Expansion policy ---

/// Why an item is being expanded. Each context maps to exactly one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpansionContext {
    OwnOriginal,
    SearchOriginal,
    SearchNonoriginal,
    FeedOriginal,
    FeedNonoriginal,
    Recursive,
    AuthorFeedOther,
}

/// How much of an item's interaction graph gets fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionPolicy {
    /// Every liker/reposter, every quote and reply, recursively.
    Full,
    /// One page of likers/reposters/quotes for participants; shallow thread for replies.
    Shallow,
    /// One page of each for counts only; nothing retained.
    CountsOnly,
}

impl ExpansionContext {
    pub fn policy(self) -> ExpansionPolicy {
        match self {
            ExpansionContext::OwnOriginal
            | ExpansionContext::Recursive
            | ExpansionContext::SearchOriginal
            | ExpansionContext::FeedOriginal => ExpansionPolicy::Full,
            ExpansionContext::SearchNonoriginal | ExpansionContext::FeedNonoriginal => {
                ExpansionPolicy::Shallow
            }
            ExpansionContext::AuthorFeedOther => ExpansionPolicy::CountsOnly,
        }
    }
}

impl fmt::Display for ExpansionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExpansionContext::OwnOriginal => "OWN_ORIGINAL",
            ExpansionContext::SearchOriginal => "SEARCH_ORIGINAL",
            ExpansionContext::SearchNonoriginal => "SEARCH_NONORIGINAL",
            ExpansionContext::FeedOriginal => "FEED_ORIGINAL",
            ExpansionContext::FeedNonoriginal => "FEED_NONORIGINAL",
            ExpansionContext::Recursive => "RECURSIVE",
            ExpansionContext::AuthorFeedOther => "AUTHOR_FEED_OTHER",
        };
        f.write_str(s)
    }
}

// --- Content ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub handle: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub is_reply: bool,
    pub is_repost: bool,
    pub is_quote: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_author: Option<String>,
}

impl Relation {
    /// Authored as a standalone post: not a reply, quote or repost.
    pub fn is_original(&self) -> bool {
        !(self.is_reply || self.is_quote || self.is_repost)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub like: u64,
    pub repost: u64,
    pub quote: u64,
    pub reply: u64,
}

/// Summary of a quoted post, resolved once per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotedPost {
    pub uri: String,
    pub author_handle: String,
    pub author_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Children {
    pub likes: Vec<Actor>,
    pub reposts: Vec<Actor>,
    pub quotes: Vec<ContentItem>,
    pub replies: Vec<ContentItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub uri: String,
    pub cid: String,
    pub author_handle: String,
    pub author_id: String,
    #[serde(default)]
    pub author_display_name: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub indexed_at: Option<String>,
    #[serde(default)]
    pub relation: Relation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted: Option<QuotedPost>,
    #[serde(default)]
    pub counts: Counts,
    /// Present only for fully expanded items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Children>,
    pub source_context: ExpansionContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_keyword: Option<String>,
}

impl ContentItem {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        self.created_at.as_deref().and_then(parse_timestamp)
    }
}

// --- Time ---

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Half-open `[since, until)` filter; either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn new(since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        Self { since, until }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.since.is_none() && self.until.is_none()
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        self.since.map_or(true, |s| *ts >= s) && self.until.map_or(true, |u| *ts < u)
    }

    /// `_<since>_to_<until>` (dates only), or empty when unbounded.
    pub fn file_suffix(&self) -> String {
        if self.is_unbounded() {
            return String::new();
        }
        let since = self
            .since
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "start".to_string());
        let until = self
            .until
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "end".to_string());
        format!("_{since}_to_{until}")
    }
}

/// A sub-range owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub worker_id: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(Some(self.start), Some(self.end))
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker {}: {} → {}",
            self.worker_id,
            format_timestamp(&self.start),
            format_timestamp(&self.end)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PartitionStrategy {
    Equal,
    Overlap { percent: f64 },
    Weighted { base: f64 },
    Custom { windows: Vec<(DateTime<Utc>, DateTime<Utc>)> },
}

impl PartitionStrategy {
    pub const DEFAULT_WEIGHT_BASE: f64 = 2.0;

    pub fn name(&self) -> &'static str {
        match self {
            PartitionStrategy::Equal => "equal",
            PartitionStrategy::Overlap { .. } => "overlap",
            PartitionStrategy::Weighted { .. } => "weighted",
            PartitionStrategy::Custom { .. } => "custom",
        }
    }
}

// --- Targets ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Top,
    Latest,
}

/// Optional search-endpoint filters for keyword targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortOrder>,
}

/// What a collection job pages through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Target {
    Keyword {
        keyword: String,
        #[serde(default)]
        filters: SearchFilters,
    },
    Author {
        handle: String,
    },
    Feed {
        uri: String,
    },
}

impl Target {
    pub fn keyword(keyword: impl Into<String>) -> Self {
        Target::Keyword {
            keyword: keyword.into(),
            filters: SearchFilters::default(),
        }
    }

    pub fn author(handle: impl Into<String>) -> Self {
        Target::Author {
            handle: handle.into(),
        }
    }

    pub fn feed(uri: impl Into<String>) -> Self {
        Target::Feed { uri: uri.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Target::Keyword { .. } => "keyword",
            Target::Author { .. } => "author",
            Target::Feed { .. } => "feed",
        }
    }

    /// The keyword, handle or feed uri.
    pub fn subject(&self) -> &str {
        match self {
            Target::Keyword { keyword, .. } => keyword,
            Target::Author { handle } => handle,
            Target::Feed { uri } => uri,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.subject())
    }
}

// --- Identities ---

/// One network account. Each parallel worker owns exactly one.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub worker_id: usize,
    pub username: String,
    pub password: String,
    pub app_password: Option<String>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("worker_id", &self.worker_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("app_password", &self.app_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
