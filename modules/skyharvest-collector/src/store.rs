//! On-disk layout and atomic JSON persistence.
//!
//! Every artifact is written to a temp file in the destination directory and
//! renamed into place, so readers never see a partial file. Blocking IO runs
//! on the blocking pool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use skyharvest_common::{Target, TimeRange};

use crate::error::{CollectError, Result};

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_\-]").expect("valid regex"));

/// File-system safe form of a keyword, handle or feed uri.
pub fn safe_name(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches("at://");
    UNSAFE_CHARS.replace_all(trimmed, "_").into_owned()
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Where one job's final and intermediate artifacts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    final_path: PathBuf,
}

impl ArtifactPaths {
    pub fn for_target(
        data_dir: &Path,
        target: &Target,
        range: &TimeRange,
        worker_id: Option<usize>,
    ) -> Self {
        let suffix = range.file_suffix();
        let worker = worker_id.map(|i| format!("_worker_{i}")).unwrap_or_default();
        let final_path = match target {
            Target::Keyword { keyword, .. } => data_dir
                .join("keywords")
                .join(format!("search_{}{suffix}{worker}.json", safe_name(keyword))),
            Target::Author { handle } => data_dir
                .join("users")
                .join("posts")
                .join(format!("{}{suffix}{worker}_posts.json", safe_name(handle))),
            // Feed listings are not time-ranged in their file names.
            Target::Feed { uri } => data_dir
                .join("feeds")
                .join(format!("feed_{}{worker}.json", safe_name(uri))),
        };
        Self { final_path }
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn dir(&self) -> &Path {
        self.final_path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn stem(&self) -> String {
        self.final_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Single-worker checkpoint, overwritten at each batch.
    pub fn temp(&self) -> PathBuf {
        self.dir().join(format!("{}_temp.json", self.stem()))
    }

    /// Worker-mode batch artifact `n`, written once.
    pub fn batch(&self, n: u32) -> PathBuf {
        self.dir().join(format!("{}_batch_{n}.json", self.stem()))
    }

    /// Existing batch artifacts in numeric (not lexical) order.
    pub fn list_batches(&self) -> Result<Vec<(u32, PathBuf)>> {
        let dir = self.dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_batch_", self.stem());
        let mut batches = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let number = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(n) = number {
                batches.push((n, path));
            }
        }
        batches.sort_by_key(|(n, _)| *n);
        Ok(batches)
    }
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

fn temp_in(path: &Path) -> Result<tempfile::NamedTempFile> {
    let dir = path
        .parent()
        .ok_or_else(|| CollectError::Checkpoint(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir)?;
    Ok(tempfile::NamedTempFile::new_in(dir)?)
}

/// Write `bytes` to `path` by temp-file-then-rename, replacing any existing file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut temp = temp_in(path)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| CollectError::Io(e.error))?;
    Ok(())
}

/// Like `atomic_write`, but refuses to replace an existing file.
pub fn atomic_write_new(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut temp = temp_in(path)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist_noclobber(path).map_err(|e| {
        CollectError::Checkpoint(format!("refusing to overwrite {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

/// Serialize then atomically replace `path` on the blocking pool.
pub async fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || atomic_write(&path, &bytes)).await?
}

/// Serialize then write `path` once; fails if it already exists.
pub async fn write_new_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || atomic_write_new(&path, &bytes)).await?
}

/// Read and parse `path`. Missing files are `Ok(None)`.
pub async fn read_json<T: DeserializeOwned + Send + 'static>(path: &Path) -> Result<Option<T>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_json_blocking(&path)).await?
}

pub fn read_json_blocking<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Remove a file if present.
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn names_are_sanitized() {
        assert_eq!(safe_name("climate change"), "climate_change");
        assert_eq!(safe_name("alice.bsky.social"), "alice_bsky_social");
        assert_eq!(
            safe_name("at://did:plc:z72/app.bsky.feed.generator/whats-hot"),
            "did_plc_z72_app_bsky_feed_generator_whats-hot"
        );
    }

    #[test]
    fn layout_per_target() {
        let data = Path::new("data");
        let range = TimeRange::new(
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
            Some(Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap()),
        );

        let kw = ArtifactPaths::for_target(data, &Target::keyword("open source"), &range, Some(1));
        assert_eq!(
            kw.final_path(),
            Path::new("data/keywords/search_open_source_2024-02-01_to_2024-02-03_worker_1.json")
        );
        assert_eq!(
            kw.batch(12),
            Path::new("data/keywords/search_open_source_2024-02-01_to_2024-02-03_worker_1_batch_12.json")
        );

        let author =
            ArtifactPaths::for_target(data, &Target::author("a.test"), &TimeRange::unbounded(), None);
        assert_eq!(author.final_path(), Path::new("data/users/posts/a_test_posts.json"));
        assert_eq!(author.temp(), Path::new("data/users/posts/a_test_posts_temp.json"));
    }

    #[test]
    fn batches_sort_numerically() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::for_target(dir.path(), &Target::keyword("k"), &TimeRange::unbounded(), Some(0));
        std::fs::create_dir_all(paths.dir()).unwrap();
        for n in [10, 2, 1] {
            std::fs::write(paths.batch(n), b"{}").unwrap();
        }
        std::fs::write(paths.dir().join("unrelated_batch_3.json"), b"{}").unwrap();

        let found: Vec<u32> = paths.list_batches().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(found, vec![1, 2, 10]);
    }

    #[test]
    fn noclobber_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        atomic_write_new(&path, b"1").unwrap();
        assert!(atomic_write_new(&path, b"2").is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"1");

        atomic_write(&path, b"3").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"3");
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<Vec<String>> = read_json(&dir.path().join("nope.json")).await.unwrap();
        assert!(value.is_none());
    }
}
