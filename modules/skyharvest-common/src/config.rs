use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ConfigError;
use crate::types::{parse_timestamp, Identity, PartitionStrategy};

/// Username shipped in the sample `.env`; treated as "not configured".
const PLACEHOLDER_USERNAME: &str = "account1.bsky.social";

/// Application configuration loaded from environment variables.
/// Holds credentials and env-specific knobs; collector tuning lives in the
/// TOML `CollectorSettings`.
#[derive(Debug, Clone)]
pub struct Config {
    // Network
    pub host: String,
    pub accounts: Vec<Identity>,

    // Storage
    pub data_dir: PathBuf,

    // Pacing
    pub rate_limit_delay: Duration,

    // Default limits
    pub default_keyword_limit: usize,
    pub default_user_posts_limit: usize,

    // Parallel mode
    pub parallel_workers: usize,
    pub time_division_strategy: String,
    pub time_overlap_percent: f64,
    pub custom_time_windows: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.log_keys();
        Ok(config)
    }

    /// Build from an arbitrary key lookup. `from_env` passes the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let accounts = load_accounts(&var)?;

        let mut parallel_workers = parse_or(&var, "PARALLEL_WORKERS", 3usize)?;
        if !accounts.is_empty() && parallel_workers != accounts.len() {
            tracing::warn!(
                parallel_workers,
                accounts = accounts.len(),
                "PARALLEL_WORKERS does not match account count, using account count"
            );
            parallel_workers = accounts.len();
        }

        let delay_secs: f64 = parse_or(&var, "RATE_LIMIT_DELAY", 0.1)?;
        if !(delay_secs.is_finite() && delay_secs >= 0.0) {
            return Err(invalid("RATE_LIMIT_DELAY", delay_secs.to_string(), "must be >= 0"));
        }

        let time_overlap_percent: f64 = parse_or(&var, "TIME_OVERLAP_PERCENT", 10.0)?;
        check_overlap_percent("TIME_OVERLAP_PERCENT", time_overlap_percent)?;

        let custom_time_windows = match var("CUSTOM_TIME_WINDOWS") {
            Some(raw) => parse_custom_windows(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            host: var("BSKY_HOST").unwrap_or_else(|| "https://bsky.social".to_string()),
            accounts,
            data_dir: PathBuf::from(var("DATA_DIR").unwrap_or_else(|| "data".to_string())),
            rate_limit_delay: Duration::from_secs_f64(delay_secs),
            default_keyword_limit: parse_or(&var, "DEFAULT_KEYWORD_LIMIT", 1000)?,
            default_user_posts_limit: parse_or(&var, "DEFAULT_USER_POSTS_LIMIT", 10000)?,
            parallel_workers,
            time_division_strategy: var("TIME_DIVISION_STRATEGY")
                .unwrap_or_else(|| "weighted".to_string())
                .to_lowercase(),
            time_overlap_percent,
            custom_time_windows,
        })
    }

    /// The primary account, used for single-worker runs.
    pub fn primary_account(&self) -> Option<&Identity> {
        self.accounts.first()
    }

    /// Resolve a strategy name (from the CLI or env) into a partition strategy.
    pub fn partition_strategy(
        &self,
        name: Option<&str>,
        overlap_percent: Option<f64>,
    ) -> Result<PartitionStrategy, ConfigError> {
        let name = name.unwrap_or(&self.time_division_strategy);
        match name {
            "equal" => Ok(PartitionStrategy::Equal),
            "overlap" => {
                let percent = overlap_percent.unwrap_or(self.time_overlap_percent);
                check_overlap_percent("overlap_percent", percent)?;
                Ok(PartitionStrategy::Overlap { percent })
            }
            "weighted" => Ok(PartitionStrategy::Weighted {
                base: PartitionStrategy::DEFAULT_WEIGHT_BASE,
            }),
            "custom" => Ok(PartitionStrategy::Custom {
                windows: self.custom_time_windows.clone(),
            }),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }

    /// Log which credentials are present without exposing them.
    fn log_keys(&self) {
        fn preview(val: &str) -> String {
            let n = val.chars().count().min(5);
            let head: String = val.chars().take(n).collect();
            format!("{}...({} chars)", head, val.len())
        }

        tracing::info!("Config loaded:");
        tracing::info!("  BSKY_HOST: {}", self.host);
        tracing::info!("  DATA_DIR: {}", self.data_dir.display());
        if self.accounts.is_empty() {
            tracing::info!("  accounts: <not set>");
        }
        for account in &self.accounts {
            tracing::info!(
                "  worker {}: {} password={} app_password={}",
                account.worker_id,
                account.username,
                preview(&account.password),
                account
                    .app_password
                    .as_deref()
                    .map(preview)
                    .unwrap_or_else(|| "<not set>".to_string())
            );
        }
    }
}

fn load_accounts(var: &impl Fn(&str) -> Option<String>) -> Result<Vec<Identity>, ConfigError> {
    let usernames = split_list(var("MULTI_ACCOUNT_USERNAMES"));
    let multi_configured = usernames
        .first()
        .is_some_and(|u| !u.is_empty() && u != PLACEHOLDER_USERNAME);

    if !multi_configured {
        return Ok(match (var("BLUESKY_USERNAME"), var("BLUESKY_PASSWORD")) {
            (Some(username), Some(password)) => vec![Identity {
                worker_id: 0,
                username,
                password,
                app_password: var("BLUESKY_APP_PASSWORD"),
            }],
            _ => Vec::new(),
        });
    }

    let passwords = split_list(var("MULTI_ACCOUNT_PASSWORDS"));
    if usernames.len() != passwords.len() {
        return Err(ConfigError::AccountMismatch {
            usernames: usernames.len(),
            passwords: passwords.len(),
        });
    }
    let app_passwords = split_list(var("MULTI_ACCOUNT_APP_PASSWORDS"));

    Ok(usernames
        .into_iter()
        .zip(passwords)
        .enumerate()
        .filter(|(_, (u, p))| !u.is_empty() && !p.is_empty())
        .map(|(i, (username, password))| Identity {
            worker_id: i,
            username,
            password,
            app_password: app_passwords.get(i).filter(|p| !p.is_empty()).cloned(),
        })
        .collect())
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
        .unwrap_or_default()
}

/// `start..end,start..end`
fn parse_custom_windows(raw: &str) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| -> Result<_, ConfigError> {
            let (start, end) = pair
                .split_once("..")
                .ok_or_else(|| invalid("CUSTOM_TIME_WINDOWS", pair.to_string(), "expected start..end"))?;
            let start = parse_timestamp(start)
                .ok_or_else(|| invalid("CUSTOM_TIME_WINDOWS", start.to_string(), "bad timestamp"))?;
            let end = parse_timestamp(end)
                .ok_or_else(|| invalid("CUSTOM_TIME_WINDOWS", end.to_string(), "bad timestamp"))?;
            Ok((start, end))
        })
        .collect()
}

fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, raw.clone(), e.to_string())),
        None => Ok(default),
    }
}

/// Overlap beyond 100% starts windows before the range; below 0% opens gaps.
fn check_overlap_percent(key: &'static str, percent: f64) -> Result<(), ConfigError> {
    if (0.0..=100.0).contains(&percent) {
        Ok(())
    } else {
        Err(invalid(key, percent.to_string(), "must be between 0 and 100"))
    }
}

fn invalid(key: &'static str, value: String, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = config(&[]).unwrap();
        assert_eq!(config.host, "https://bsky.social");
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.rate_limit_delay, Duration::from_millis(100));
        assert_eq!(config.default_keyword_limit, 1000);
        assert_eq!(config.default_user_posts_limit, 10000);
        assert_eq!(config.parallel_workers, 3);
        assert_eq!(config.time_division_strategy, "weighted");
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn placeholder_multi_account_falls_back_to_single() {
        let config = config(&[
            ("MULTI_ACCOUNT_USERNAMES", "account1.bsky.social,account2.bsky.social"),
            ("MULTI_ACCOUNT_PASSWORDS", "x,y"),
            ("BLUESKY_USERNAME", "me.bsky.social"),
            ("BLUESKY_PASSWORD", "pw"),
            ("BLUESKY_APP_PASSWORD", "app"),
        ])
        .unwrap();
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.accounts[0].username, "me.bsky.social");
        assert_eq!(config.accounts[0].app_password.as_deref(), Some("app"));
        // One account means one worker regardless of PARALLEL_WORKERS.
        assert_eq!(config.parallel_workers, 1);
    }

    #[test]
    fn account_count_overrides_parallel_workers() {
        let config = config(&[
            ("MULTI_ACCOUNT_USERNAMES", "a.test, b.test"),
            ("MULTI_ACCOUNT_PASSWORDS", "pa,pb"),
            ("MULTI_ACCOUNT_APP_PASSWORDS", ",app-b"),
            ("PARALLEL_WORKERS", "5"),
        ])
        .unwrap();
        assert_eq!(config.parallel_workers, 2);
        assert_eq!(config.accounts[1].worker_id, 1);
        assert_eq!(config.accounts[1].username, "b.test");
        assert_eq!(config.accounts[0].app_password, None);
        assert_eq!(config.accounts[1].app_password.as_deref(), Some("app-b"));
    }

    #[test]
    fn mismatched_multi_account_lists_are_rejected() {
        let err = config(&[
            ("MULTI_ACCOUNT_USERNAMES", "a.test,b.test"),
            ("MULTI_ACCOUNT_PASSWORDS", "pa"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::AccountMismatch { usernames: 2, passwords: 1 }));
    }

    #[test]
    fn custom_windows_parse() {
        let config = config(&[(
            "CUSTOM_TIME_WINDOWS",
            "2024-02-01..2024-03-01, 2024-03-01T00:00:00Z..2024-04-01T00:00:00Z",
        )])
        .unwrap();
        assert_eq!(config.custom_time_windows.len(), 2);
        let strategy = config.partition_strategy(Some("custom"), None).unwrap();
        assert!(matches!(strategy, PartitionStrategy::Custom { ref windows } if windows.len() == 2));
    }

    #[test]
    fn bad_numbers_name_the_key() {
        let err = config(&[("PARALLEL_WORKERS", "many")]).unwrap_err();
        assert!(err.to_string().contains("PARALLEL_WORKERS"));
    }

    #[test]
    fn strategy_resolution() {
        let config = config(&[("TIME_OVERLAP_PERCENT", "20")]).unwrap();
        assert_eq!(
            config.partition_strategy(Some("overlap"), None).unwrap(),
            PartitionStrategy::Overlap { percent: 20.0 }
        );
        assert_eq!(
            config.partition_strategy(None, None).unwrap(),
            PartitionStrategy::Weighted { base: 2.0 }
        );
        assert!(config.partition_strategy(Some("random"), None).is_err());
    }

    #[test]
    fn overlap_percent_must_stay_within_the_range() {
        let err = config(&[("TIME_OVERLAP_PERCENT", "150")]).unwrap_err();
        assert!(err.to_string().contains("TIME_OVERLAP_PERCENT"));

        let config = config(&[]).unwrap();
        for bad in [150.0, -5.0, f64::NAN] {
            let err = config.partition_strategy(Some("overlap"), Some(bad)).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { key: "overlap_percent", .. }));
        }
        assert_eq!(
            config.partition_strategy(Some("overlap"), Some(100.0)).unwrap(),
            PartitionStrategy::Overlap { percent: 100.0 }
        );
    }
}
