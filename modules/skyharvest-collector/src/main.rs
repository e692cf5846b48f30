use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use skyharvest_collector::{
    partition, BatchCollector, BatchResult, BskyConnector, CollectionJob, Connector,
    FeedCollector, HarvestDeps, HarvestStats, Orchestrator, PlatformApi,
};
use skyharvest_common::settings::load_settings;
use skyharvest_common::{
    parse_timestamp, CollectorSettings, Config, SearchFilters, SortOrder, Target, TimeRange,
};

#[derive(Parser)]
#[command(name = "skyharvest", version, about = "Recursive, resumable Bluesky collector")]
struct Cli {
    /// TOML file with collector tuning (batch size, page size, thread depths).
    #[arg(long, global = true, env = "SKYHARVEST_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search posts by one or more keywords; keywords run concurrently.
    Keyword {
        #[arg(required = true)]
        keywords: Vec<String>,
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Collect an account's posts and reposts.
    Author {
        handle: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Collect the posts of one feed generator.
    Feed {
        uri: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Save the suggested feed generators.
    Feeds {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Discover suggested feeds and collect each in turn.
    AllFeeds {
        #[arg(long, default_value_t = 50)]
        feeds_limit: usize,
        #[arg(long, default_value_t = 500)]
        posts_per_feed: usize,
    },
    /// Collect posts for every handle in the discovered-users registry.
    Batch {
        #[arg(long, default_value_t = 1000)]
        posts_per_user: usize,
        /// Recollect handles whose posts file already exists.
        #[arg(long = "no-skip-existing", action = ArgAction::SetFalse)]
        skip_existing: bool,
        /// Split the handles across all configured accounts.
        #[arg(long)]
        parallel: bool,
    },
    /// Show configured accounts and partitioning without connecting.
    Accounts,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Maximum items to collect; 0 = unbounded. Defaults per target kind.
    #[arg(long)]
    limit: Option<usize>,
    /// Inclusive start (RFC 3339 or YYYY-MM-DD).
    #[arg(long)]
    since: Option<String>,
    /// Exclusive end (RFC 3339 or YYYY-MM-DD).
    #[arg(long)]
    until: Option<String>,
    /// Split the time range across all configured accounts.
    #[arg(long)]
    parallel: bool,
    /// equal | overlap | weighted | custom (default: TIME_DIVISION_STRATEGY).
    #[arg(long)]
    strategy: Option<String>,
    #[arg(long)]
    overlap_percent: Option<f64>,
}

#[derive(Args, Clone, Default)]
struct FilterArgs {
    #[arg(long)]
    author: Option<String>,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    lang: Option<String>,
    #[arg(long)]
    mentions: Option<String>,
    #[arg(long)]
    tag: Option<String>,
    #[arg(long)]
    url: Option<String>,
    #[arg(long, value_enum)]
    sort: Option<SortArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Top,
    Latest,
}

impl From<FilterArgs> for SearchFilters {
    fn from(f: FilterArgs) -> Self {
        SearchFilters {
            author: f.author,
            domain: f.domain,
            lang: f.lang,
            mentions: f.mentions,
            tag: f.tag,
            url: f.url,
            sort: f.sort.map(|s| match s {
                SortArg::Top => SortOrder::Top,
                SortArg::Latest => SortOrder::Latest,
            }),
        }
    }
}

/// Log filter and output format, read from the environment after `.env`
/// has been loaded.
#[derive(Debug, PartialEq, Eq)]
struct LogSettings {
    filter: String,
    json: bool,
}

impl LogSettings {
    const DEFAULT_FILTER: &'static str = "skyharvest=info,bsky_client=info";

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            filter: lookup("RUST_LOG")
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| Self::DEFAULT_FILTER.to_string()),
            json: lookup("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
        }
    }
}

fn init_tracing(settings: &LogSettings) -> Result<()> {
    let filter = EnvFilter::try_new(&settings.filter)
        .or_else(|_| EnvFilter::try_new(LogSettings::DEFAULT_FILTER))?;
    if settings.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env may carry RUST_LOG / LOG_FORMAT, so load it before tracing.
    dotenvy::dotenv().ok();
    init_tracing(&LogSettings::from_lookup(|key| std::env::var(key).ok()))?;
    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    let settings = match &cli.settings {
        Some(path) => load_settings(path)?,
        None => CollectorSettings::default(),
    };
    let connector: Arc<dyn Connector> =
        Arc::new(BskyConnector::new(config.host.clone(), config.rate_limit_delay));
    let app = App {
        deps: HarvestDeps::for_data_dir(config.data_dir.clone(), settings),
        config,
        connector,
    };

    let stats = match cli.command {
        Command::Keyword {
            keywords,
            run,
            filters,
        } => app.run_keywords(keywords, run, filters.into()).await?,
        Command::Author { handle, run } => {
            let limit = run.limit.unwrap_or(app.config.default_user_posts_limit);
            app.run_one(Target::author(handle), limit, &run).await?
        }
        Command::Feed { uri, run } => {
            let limit = run.limit.unwrap_or(app.config.default_keyword_limit);
            app.run_one(Target::feed(uri), limit, &run).await?
        }
        Command::Feeds { limit } => {
            let feeds = app.feed_collector().await?.collect_suggested_feeds(limit).await?;
            info!(feeds = feeds.len(), "Suggested feeds collected");
            HarvestStats::default()
        }
        Command::AllFeeds {
            feeds_limit,
            posts_per_feed,
        } => {
            app.feed_collector()
                .await?
                .collect_all_feeds(feeds_limit, posts_per_feed)
                .await?
        }
        Command::Batch {
            posts_per_user,
            skip_existing,
            parallel,
        } => app.run_batch(posts_per_user, skip_existing, parallel).await?,
        Command::Accounts => {
            app.print_accounts();
            return Ok(());
        }
    };

    info!("{stats}");
    if stats.jobs_failed > 0 && stats.jobs_succeeded == 0 {
        bail!("all {} jobs failed", stats.jobs_failed);
    }
    Ok(())
}

struct App {
    config: Config,
    deps: HarvestDeps,
    connector: Arc<dyn Connector>,
}

impl App {
    async fn primary_api(&self) -> Result<Arc<dyn PlatformApi>> {
        let identity = self
            .config
            .primary_account()
            .context("No account configured: set BLUESKY_USERNAME and BLUESKY_PASSWORD")?;
        Ok(self.connector.connect(identity).await?)
    }

    async fn feed_collector(&self) -> Result<FeedCollector> {
        Ok(FeedCollector::new(
            self.primary_api().await?,
            self.deps.clone(),
            self.config.rate_limit_delay,
        ))
    }

    async fn run_keywords(
        &self,
        keywords: Vec<String>,
        run: RunArgs,
        filters: SearchFilters,
    ) -> Result<HarvestStats> {
        let limit = run.limit.unwrap_or(self.config.default_keyword_limit);
        // One shared session for every keyword in single mode.
        let api = if run.parallel {
            None
        } else {
            Some(self.primary_api().await?)
        };

        let jobs = keywords.into_iter().map(|keyword| {
            let target = Target::Keyword {
                keyword,
                filters: filters.clone(),
            };
            let api = api.clone();
            let run = &run;
            async move {
                let outcome = self.run_target(api, &target, limit, run).await;
                (target, outcome)
            }
        });

        let mut stats = HarvestStats::default();
        for (target, outcome) in futures::future::join_all(jobs).await {
            match outcome {
                Ok(job_stats) => stats += &job_stats,
                Err(e) => {
                    error!(%target, error = %e, "Collection failed");
                    stats.jobs_failed += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn run_one(&self, target: Target, limit: usize, run: &RunArgs) -> Result<HarvestStats> {
        let api = if run.parallel {
            None
        } else {
            Some(self.primary_api().await?)
        };
        match self.run_target(api, &target, limit, run).await {
            Ok(stats) => Ok(stats),
            Err(e) => {
                error!(%target, error = %e, "Collection failed");
                Ok(HarvestStats {
                    jobs_failed: 1,
                    ..Default::default()
                })
            }
        }
    }

    /// One target, either as a single job on `api` or split across every
    /// configured account when `api` is `None`.
    async fn run_target(
        &self,
        api: Option<Arc<dyn PlatformApi>>,
        target: &Target,
        limit: usize,
        run: &RunArgs,
    ) -> Result<HarvestStats> {
        let since = parse_flag("--since", run.since.as_deref())?;
        let until = parse_flag("--until", run.until.as_deref())?;

        let Some(api) = api else {
            return self.run_parallel(target, limit, since, until, run).await;
        };

        let mut job = CollectionJob::new(api, self.deps.clone());
        let result = job.run(target, limit, TimeRange::new(since, until)).await?;
        let mut stats = result.stats;
        stats.jobs_succeeded += 1;
        info!(
            %target,
            items = result.items.len(),
            path = %result.final_path.display(),
            "Collection saved"
        );
        Ok(stats)
    }

    async fn run_parallel(
        &self,
        target: &Target,
        limit: usize,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        run: &RunArgs,
    ) -> Result<HarvestStats> {
        let identities = &self.config.accounts;
        if identities.is_empty() {
            bail!("Parallel mode needs at least one configured account");
        }
        let start = match since {
            Some(since) => since,
            None => parse_timestamp(&self.deps.settings.default_since).with_context(|| {
                format!("Invalid default_since: {}", self.deps.settings.default_since)
            })?,
        };
        let end = until.unwrap_or_else(Utc::now);
        if end <= start {
            bail!("--until must be after --since");
        }

        let strategy = self
            .config
            .partition_strategy(run.strategy.as_deref(), run.overlap_percent)?;
        let windows = partition(start, end, identities.len(), &strategy);

        let orchestrator = Orchestrator::new(self.connector.clone(), self.deps.clone());
        let result = orchestrator
            .run_parallel(target, limit, identities, &windows)
            .await?;

        for worker in &result.workers {
            match &worker.error {
                None => info!(
                    worker_id = worker.worker_id,
                    username = %worker.username,
                    collected = worker.collected,
                    "Worker done"
                ),
                Some(e) => warn!(
                    worker_id = worker.worker_id,
                    username = %worker.username,
                    error = %e,
                    "Worker failed"
                ),
            }
        }
        if let Some(path) = &result.final_path {
            info!(
                %target,
                items = result.items.len(),
                new_participants = result.new_participants,
                path = %path.display(),
                "Merged collection saved"
            );
        }
        Ok(result.stats)
    }

    async fn run_batch(
        &self,
        posts_per_user: usize,
        skip_existing: bool,
        parallel: bool,
    ) -> Result<HarvestStats> {
        let collector = BatchCollector::new(self.deps.clone(), self.config.rate_limit_delay);
        let result: BatchResult = if parallel {
            if self.config.accounts.is_empty() {
                bail!("Parallel mode needs at least one configured account");
            }
            collector
                .collect_parallel(
                    self.connector.clone(),
                    &self.config.accounts,
                    posts_per_user,
                    skip_existing,
                )
                .await?
        } else {
            collector
                .collect(self.primary_api().await?, posts_per_user, skip_existing)
                .await?
        };

        for share in &result.shares {
            match &share.error {
                None => info!(
                    worker_id = share.worker_id,
                    username = %share.username,
                    assigned = share.assigned,
                    collected = share.collected,
                    "Batch worker done"
                ),
                Some(e) => warn!(
                    worker_id = share.worker_id,
                    username = %share.username,
                    assigned = share.assigned,
                    error = %e,
                    "Batch worker failed"
                ),
            }
        }
        info!(
            discovered = result.discovered,
            skipped = result.skipped,
            "Batch collection finished"
        );
        let mut stats = result.stats;
        stats.jobs_failed += result.errors.len() as u32;
        Ok(stats)
    }

    fn print_accounts(&self) {
        let config = &self.config;
        println!("Configured accounts: {}", config.accounts.len());
        for account in &config.accounts {
            println!("  worker {}: {}", account.worker_id, account.username);
        }
        println!("Parallel workers: {}", config.parallel_workers);
        println!("Time division strategy: {}", config.time_division_strategy);
        if config.time_division_strategy == "overlap" {
            println!("Time overlap percent: {}%", config.time_overlap_percent);
        }
        if config.time_division_strategy == "custom" {
            for (i, (start, end)) in config.custom_time_windows.iter().enumerate() {
                println!("  window {i}: {start} .. {end}");
            }
        }
    }
}

fn parse_flag(flag: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|raw| parse_timestamp(raw).with_context(|| format!("Invalid {flag}: {raw}")))
        .transpose()
}
