use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Collector tuning, optionally loaded from a TOML file.
/// Credentials and paths stay in the environment (`Config`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorSettings {
    /// New items between checkpoints.
    pub batch_size: usize,
    /// Page size for every list fetch (platform maximum is 100).
    pub page_size: u32,
    /// Thread depth for full and counts-only reply fetches.
    pub reply_thread_depth: u32,
    /// Thread depth for shallow reply counts.
    pub shallow_thread_depth: u32,
    /// Start of the range when no `--since` is given in parallel mode.
    pub default_since: String,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            page_size: 100,
            reply_thread_depth: 10,
            shallow_thread_depth: 1,
            default_since: "2024-02-01T00:00:00Z".to_string(),
        }
    }
}

/// Load and parse a TOML settings file.
pub fn load_settings(path: &Path) -> Result<CollectorSettings> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
    let settings: CollectorSettings = toml::from_str(&content)
        .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
    if settings.batch_size == 0 {
        anyhow::bail!("batch_size must be at least 1 in {}", path.display());
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "batch_size = 25\nreply_thread_depth = 4").unwrap();

        let settings = load_settings(file.path()).unwrap();
        assert_eq!(settings.batch_size, 25);
        assert_eq!(settings.reply_thread_depth, 4);
        assert_eq!(settings.page_size, 100);
        assert_eq!(settings.default_since, "2024-02-01T00:00:00Z");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "batch_sise = 25").unwrap();
        assert!(load_settings(file.path()).is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "batch_size = 0").unwrap();
        assert!(load_settings(file.path()).is_err());
    }
}
