//! Process-local scan store for development and tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{ScanStore, StoreError, StoredImage};
use crate::models::{ScanImage, ScanRecord, ScanTags};
use crate::timestamp::ScanTimestamp;

struct StoredScan {
    image: ScanImage,
    analysis: Value,
    summary: String,
    tags: ScanTags,
}

/// Keeps records in a `BTreeMap` keyed by timestamp. Image URLs point back
/// at the server's `/history/{timestamp}/image` proxy.
pub struct InMemoryScanStore {
    scans: RwLock<BTreeMap<ScanTimestamp, StoredScan>>,
    public_base_url: String,
}

impl InMemoryScanStore {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            scans: RwLock::new(BTreeMap::new()),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn image_url(&self, ts: &ScanTimestamp) -> String {
        format!("{}/history/{}/image", self.public_base_url, ts)
    }

    pub async fn len(&self) -> usize {
        self.scans.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.scans.read().await.is_empty()
    }
}

#[async_trait]
impl ScanStore for InMemoryScanStore {
    async fn put(
        &self,
        timestamp: &ScanTimestamp,
        image: &ScanImage,
        analysis: &Value,
        summary: &str,
        tags: &ScanTags,
    ) -> Result<String, StoreError> {
        self.scans.write().await.insert(
            timestamp.clone(),
            StoredScan {
                image: image.clone(),
                analysis: analysis.clone(),
                summary: summary.to_string(),
                tags: tags.clone(),
            },
        );
        Ok(self.image_url(timestamp))
    }

    async fn get(&self, timestamp: &ScanTimestamp) -> Result<ScanRecord, StoreError> {
        let scans = self.scans.read().await;
        let scan = scans
            .get(timestamp)
            .ok_or_else(|| StoreError::NotFound(timestamp.to_string()))?;
        Ok(ScanRecord {
            timestamp: timestamp.clone(),
            image_url: self.image_url(timestamp),
            analysis: scan.analysis.clone(),
            summary: scan.summary.clone(),
            tags: scan.tags.clone(),
        })
    }

    async fn image(&self, timestamp: &ScanTimestamp) -> Result<StoredImage, StoreError> {
        let scans = self.scans.read().await;
        let scan = scans
            .get(timestamp)
            .ok_or_else(|| StoreError::NotFound(timestamp.to_string()))?;
        Ok(StoredImage {
            bytes: scan.image.bytes.clone(),
            content_type: scan.image.content_type.clone(),
        })
    }

    async fn exists(&self, timestamp: &ScanTimestamp) -> Result<bool, StoreError> {
        Ok(self.scans.read().await.contains_key(timestamp))
    }

    async fn timestamps(&self) -> Result<Vec<ScanTimestamp>, StoreError> {
        Ok(self.scans.read().await.keys().cloned().collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
