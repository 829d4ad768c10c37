use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("pre-processed data {} is missing; run `judgebook preprocess` for this week first", .path.display())]
    Missing { path: PathBuf },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed cache file {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    /// The file already existed and was left as is.
    pub deduplicated: bool,
}

/// Write-once JSON files, one per (platform, week, contest). Written by
/// `preprocess`, read-only during `grade`.
#[derive(Debug, Clone)]
pub struct RankingCacheStore {
    root: PathBuf,
}

impl RankingCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn file_name(platform: &str, week_num: u32, contest_id: &str) -> String {
        let contest: String = contest_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{platform}_{week_num}_{contest}.json")
    }

    pub fn path_for(&self, platform: &str, week_num: u32, contest_id: &str) -> PathBuf {
        self.root.join(Self::file_name(platform, week_num, contest_id))
    }

    pub async fn exists(&self, platform: &str, week_num: u32, contest_id: &str) -> Result<bool, CacheError> {
        let path = self.path_for(platform, week_num, contest_id);
        fs::try_exists(&path)
            .await
            .map_err(|source| CacheError::Io { path, source })
    }

    /// Atomic temp-file + rename; an existing file is never replaced.
    pub async fn store_once(
        &self,
        platform: &str,
        week_num: u32,
        contest_id: &str,
        bytes: &[u8],
    ) -> Result<StoredArtifact, CacheError> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self.path_for(platform, week_num, contest_id);
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| CacheError::Io { path, source }
        };

        fs::create_dir_all(&self.root).await.map_err(io(&self.root))?;

        let artifact = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            path: path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&path).await.map_err(io(&path))? {
            return Ok(artifact(true));
        }

        let temp_path = self.root.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io(&temp_path))?;
        file.write_all(bytes).await.map_err(io(&temp_path))?;
        file.flush().await.map_err(io(&temp_path))?;
        drop(file);

        // a concurrent preprocess may have won the race
        if fs::try_exists(&path).await.map_err(io(&path))? {
            let _ = fs::remove_file(&temp_path).await;
            return Ok(artifact(true));
        }

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(artifact(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io(&path)(err))
            }
        }
    }

    pub async fn store_json<T: Serialize + ?Sized>(
        &self,
        platform: &str,
        week_num: u32,
        contest_id: &str,
        value: &T,
    ) -> Result<StoredArtifact, CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|source| CacheError::Malformed {
            path: self.path_for(platform, week_num, contest_id),
            source,
        })?;
        self.store_once(platform, week_num, contest_id, &bytes).await
    }

    pub async fn load<T: DeserializeOwned>(
        &self,
        platform: &str,
        week_num: u32,
        contest_id: &str,
    ) -> Result<T, CacheError> {
        let path = self.path_for(platform, week_num, contest_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::Missing { path })
            }
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| CacheError::Malformed { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            RankingCacheStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn file_names_follow_platform_week_contest() {
        assert_eq!(
            RankingCacheStore::file_name("Leetcode", 3, "weekly-contest-276"),
            "Leetcode_3_weekly-contest-276.json"
        );
        assert_eq!(RankingCacheStore::file_name("X", 1, "a/b c"), "X_1_a_b_c.json");
    }

    #[tokio::test]
    async fn second_store_keeps_first_contents() {
        let dir = tempdir().expect("tempdir");
        let store = RankingCacheStore::new(dir.path().join("cache"));

        let first = store
            .store_once("Leetcode", 2, "weekly-contest-276", br#"{"alice":["1"]}"#)
            .await
            .expect("first store");
        let second = store
            .store_once("Leetcode", 2, "weekly-contest-276", br#"{"alice":["1","2"]}"#)
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.path, second.path);
        let loaded: BTreeMap<String, Vec<String>> = store
            .load("Leetcode", 2, "weekly-contest-276")
            .await
            .expect("load");
        assert_eq!(loaded["alice"], vec!["1".to_string()]);
        assert!(store.exists("Leetcode", 2, "weekly-contest-276").await.expect("exists"));
    }

    #[tokio::test]
    async fn missing_file_is_a_typed_error() {
        let dir = tempdir().expect("tempdir");
        let store = RankingCacheStore::new(dir.path());
        let err = store
            .load::<serde_json::Value>("Leetcode", 4, "biweekly-contest-70")
            .await
            .expect_err("missing");
        match err {
            CacheError::Missing { path } => {
                assert!(path.ends_with("Leetcode_4_biweekly-contest-70.json"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
