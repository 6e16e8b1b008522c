//! Scan persistence: image, analysis JSON and summary under one timestamp.
//!
//! Every record lives under `<prefix>/<timestamp>/`:
//! - `mri_<timestamp>.<ext>` (original upload)
//! - `summary_<timestamp>.txt`
//! - `context_<timestamp>.json` (written last; its presence marks the record complete)

pub mod memory;
pub mod s3;
pub mod sigv4;

pub use memory::InMemoryScanStore;
pub use s3::S3ScanStore;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use thiserror::Error;

use crate::config::{NeuroscanConfig, StorageBackend};
use crate::error::ErrorKind;
use crate::models::{ScanImage, ScanRecord, ScanTags};
use crate::timestamp::ScanTimestamp;

/// Upper bound on how far `claim` walks forward from the candidate second.
const MAX_CLAIM_ATTEMPTS: usize = 600;

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Scan not found: {0}")]
    NotFound(String),

    #[error("Storage request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Storage {operation} failed with status {status}: {body}")]
    Http {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("Stored artifact is malformed: {0}")]
    Malformed(String),

    #[error("Storage credentials unavailable: {0}")]
    Credentials(String),

    #[error("Storage misconfigured: {0}")]
    Config(String),

    #[error("No free timestamp within {attempts}s of {candidate}")]
    ClaimExhausted { candidate: String, attempts: usize },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Transport(e) if e.is_timeout() => ErrorKind::Timeout,
            StoreError::Transport(_) => ErrorKind::Transport,
            _ => ErrorKind::Storage,
        }
    }
}

/// Image bytes as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub bytes: Bytes,
    pub content_type: String,
}

// ============================================================================
// Key layout
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Image { extension: String },
    Summary,
    Context,
}

#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Listing prefix covering every record.
    pub fn root(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }

    pub fn folder(&self, ts: &ScanTimestamp) -> String {
        format!("{}{}/", self.root(), ts)
    }

    pub fn context_key(&self, ts: &ScanTimestamp) -> String {
        format!("{}context_{}.json", self.folder(ts), ts)
    }

    pub fn summary_key(&self, ts: &ScanTimestamp) -> String {
        format!("{}summary_{}.txt", self.folder(ts), ts)
    }

    pub fn image_key(&self, ts: &ScanTimestamp, extension: &str) -> String {
        format!("{}mri_{}.{}", self.folder(ts), ts, extension)
    }

    /// Map an object key back to its record and artifact. Keys outside the
    /// layout (stray uploads, other tools' files) yield `None`.
    pub fn classify(&self, key: &str) -> Option<(ScanTimestamp, Artifact)> {
        let rest = key.strip_prefix(&self.root())?;
        let (folder, file) = rest.split_once('/')?;
        let ts = ScanTimestamp::parse(folder).ok()?;

        let artifact = if file == format!("context_{}.json", ts) {
            Artifact::Context
        } else if file == format!("summary_{}.txt", ts) {
            Artifact::Summary
        } else {
            let ext = file.strip_prefix(&format!("mri_{}.", ts))?;
            if ext.is_empty() || ext.contains('/') {
                return None;
            }
            Artifact::Image {
                extension: ext.to_ascii_lowercase(),
            }
        };
        Some((ts, artifact))
    }
}

// ============================================================================
// Store trait
// ============================================================================

#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Write all three artifacts for `timestamp` and return the public image
    /// URL. Re-running with the same timestamp overwrites. On failure nothing
    /// from this call stays visible.
    async fn put(
        &self,
        timestamp: &ScanTimestamp,
        image: &ScanImage,
        analysis: &Value,
        summary: &str,
        tags: &ScanTags,
    ) -> Result<String, StoreError>;

    async fn get(&self, timestamp: &ScanTimestamp) -> Result<ScanRecord, StoreError>;

    async fn image(&self, timestamp: &ScanTimestamp) -> Result<StoredImage, StoreError>;

    /// Whether any artifact exists under `timestamp`, complete or not.
    async fn exists(&self, timestamp: &ScanTimestamp) -> Result<bool, StoreError>;

    /// Timestamps of complete records, in no particular order.
    async fn timestamps(&self) -> Result<Vec<ScanTimestamp>, StoreError>;

    /// Backend name for logging and `/health`.
    fn name(&self) -> &str;

    /// Newest-first stream of complete records. Each call starts a fresh
    /// listing; records are fetched one at a time as the stream is polled.
    fn list(&self) -> BoxStream<'_, Result<ScanRecord, StoreError>> {
        let keys = async move {
            let mut keys = self.timestamps().await?;
            keys.sort_unstable_by(|a, b| b.cmp(a));
            keys.dedup();
            Ok::<_, StoreError>(stream::iter(keys.into_iter().map(Ok)))
        };

        stream::once(keys)
            .try_flatten()
            .try_filter_map(move |ts| async move {
                match self.get(&ts).await {
                    Ok(record) => Ok(Some(record)),
                    // deleted between listing and fetch
                    Err(StoreError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .boxed()
    }

    async fn latest(&self) -> Result<Option<ScanRecord>, StoreError> {
        self.list().try_next().await
    }
}

/// Build the store selected by `[storage] backend`.
pub fn create_store_from_config(
    config: &NeuroscanConfig,
) -> Result<Arc<dyn ScanStore>, StoreError> {
    match config.storage.backend {
        StorageBackend::S3 => {
            let creds = sigv4::AwsCredentials::from_env()?;
            Ok(Arc::new(S3ScanStore::new(config.storage.clone(), creds)?))
        }
        StorageBackend::Memory => Ok(Arc::new(InMemoryScanStore::new(memory_base_url(config)))),
    }
}

/// Base of the image URLs handed out by the memory backend: the configured
/// `storage.public_base_url`, else the server's own address with wildcard
/// binds mapped to loopback.
pub fn memory_base_url(config: &NeuroscanConfig) -> String {
    if let Some(base) = config.storage.public_base_url.as_deref().map(str::trim) {
        if !base.is_empty() {
            return base.trim_end_matches('/').to_string();
        }
    }
    let host = match config.http.host.as_str() {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" | "[::]" => "[::1]",
        other => other,
    };
    format!("http://{}:{}", host, config.http.port)
}

// ============================================================================
// Timestamp claims
// ============================================================================

/// Process-wide reservations that keep concurrent uploads from minting the
/// same timestamp.
#[derive(Clone, Default)]
pub struct TimestampClaims {
    reserved: Arc<Mutex<BTreeSet<ScanTimestamp>>>,
}

/// A reserved timestamp. The reservation ends when this is dropped.
#[derive(Debug)]
pub struct ClaimedTimestamp {
    timestamp: ScanTimestamp,
    reserved: Arc<Mutex<BTreeSet<ScanTimestamp>>>,
}

impl ClaimedTimestamp {
    pub fn timestamp(&self) -> &ScanTimestamp {
        &self.timestamp
    }
}

impl Drop for ClaimedTimestamp {
    fn drop(&mut self) {
        lock(&self.reserved).remove(&self.timestamp);
    }
}

fn lock(set: &Mutex<BTreeSet<ScanTimestamp>>) -> MutexGuard<'_, BTreeSet<ScanTimestamp>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TimestampClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `candidate`, or the first later second that is neither
    /// reserved here nor already present in `store`.
    pub async fn claim(
        &self,
        store: &dyn ScanStore,
        candidate: ScanTimestamp,
    ) -> Result<ClaimedTimestamp, StoreError> {
        let mut ts = candidate.clone();

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            if !lock(&self.reserved).insert(ts.clone()) {
                ts = ts.next_second();
                continue;
            }

            // From here on the reservation is released by the guard's Drop.
            let claimed = ClaimedTimestamp {
                timestamp: ts.clone(),
                reserved: self.reserved.clone(),
            };
            if !store.exists(&ts).await? {
                if ts != candidate {
                    tracing::debug!(candidate = %candidate, claimed = %ts, "Timestamp collision resolved");
                }
                return Ok(claimed);
            }
            drop(claimed);
            ts = ts.next_second();
        }

        Err(StoreError::ClaimExhausted {
            candidate: candidate.to_string(),
            attempts: MAX_CLAIM_ATTEMPTS,
        })
    }

    pub fn is_reserved(&self, ts: &ScanTimestamp) -> bool {
        lock(&self.reserved).contains(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(s: &str) -> ScanTimestamp {
        ScanTimestamp::parse(s).unwrap()
    }

    fn tags() -> ScanTags {
        ScanTags {
            tumor_type: "none".into(),
            tumor_size: "N/A".into(),
        }
    }

    #[test]
    fn test_memory_base_url_prefers_public_base_url() {
        let mut config = NeuroscanConfig::default();
        config.http.host = "0.0.0.0".into();
        config.http.port = 8080;
        assert_eq!(memory_base_url(&config), "http://127.0.0.1:8080");

        config.storage.public_base_url = Some("https://scans.example.org/".into());
        assert_eq!(memory_base_url(&config), "https://scans.example.org");

        config.storage.public_base_url = None;
        config.http.host = "10.0.0.5".into();
        assert_eq!(memory_base_url(&config), "http://10.0.0.5:8080");
    }

    #[test]
    fn test_key_layout_matches_saved_folder_convention() {
        let layout = KeyLayout::new("saved/");
        let t = ts("20240101_120000");
        assert_eq!(layout.context_key(&t), "saved/20240101_120000/context_20240101_120000.json");
        assert_eq!(layout.summary_key(&t), "saved/20240101_120000/summary_20240101_120000.txt");
        assert_eq!(layout.image_key(&t, "jpg"), "saved/20240101_120000/mri_20240101_120000.jpg");

        let bare = KeyLayout::new("");
        assert_eq!(bare.folder(&t), "20240101_120000/");
    }

    #[test]
    fn test_classify_recognizes_only_layout_keys() {
        let layout = KeyLayout::new("saved");
        let t = ts("20240101_120000");

        assert_eq!(
            layout.classify("saved/20240101_120000/mri_20240101_120000.PNG"),
            Some((t.clone(), Artifact::Image { extension: "png".into() }))
        );
        assert_eq!(
            layout.classify("saved/20240101_120000/context_20240101_120000.json"),
            Some((t.clone(), Artifact::Context))
        );
        assert_eq!(
            layout.classify("saved/20240101_120000/summary_20240101_120000.txt"),
            Some((t, Artifact::Summary))
        );

        assert_eq!(layout.classify("saved/20240101_120000/notes.txt"), None);
        assert_eq!(layout.classify("saved/20240101_120000/context_20231231_000000.json"), None);
        assert_eq!(layout.classify("saved/latest/context_latest.json"), None);
        assert_eq!(layout.classify("other/20240101_120000/context_20240101_120000.json"), None);
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_restartable() {
        let store = InMemoryScanStore::new("http://localhost:5000");
        let image = ScanImage::new(vec![1u8, 2, 3], Some("a.jpg"));
        for key in ["20240101_120000", "20240301_080000", "20231231_235959"] {
            store
                .put(&ts(key), &image, &json!({"k": key}), "summary", &tags())
                .await
                .unwrap();
        }

        let first: Vec<String> = store
            .list()
            .map_ok(|r| r.timestamp.to_string())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(first, vec!["20240301_080000", "20240101_120000", "20231231_235959"]);

        let again: Vec<ScanRecord> = store.list().try_collect().await.unwrap();
        assert_eq!(again.len(), 3);

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.timestamp.as_str(), "20240301_080000");
    }

    #[tokio::test]
    async fn test_latest_on_empty_store_is_none() {
        let store = InMemoryScanStore::new("http://localhost:5000");
        assert!(store.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_steps_past_existing_records() {
        let store = InMemoryScanStore::new("http://localhost:5000");
        let image = ScanImage::new(vec![1u8], None);
        store
            .put(&ts("20240101_120000"), &image, &json!({}), "s", &tags())
            .await
            .unwrap();

        let claims = TimestampClaims::new();
        let claimed = claims.claim(&store, ts("20240101_120000")).await.unwrap();
        assert_eq!(claimed.timestamp().as_str(), "20240101_120001");
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_distinct_until_released() {
        let store = InMemoryScanStore::new("http://localhost:5000");
        let claims = TimestampClaims::new();

        let a = claims.claim(&store, ts("20240101_120000")).await.unwrap();
        let b = claims.claim(&store, ts("20240101_120000")).await.unwrap();
        assert_eq!(a.timestamp().as_str(), "20240101_120000");
        assert_eq!(b.timestamp().as_str(), "20240101_120001");

        drop(a);
        assert!(!claims.is_reserved(&ts("20240101_120000")));
        assert!(claims.is_reserved(&ts("20240101_120001")));

        let c = claims.claim(&store, ts("20240101_120000")).await.unwrap();
        assert_eq!(c.timestamp().as_str(), "20240101_120000");
    }
}
