//! History subsystem: newest-first listing and single-record lookups.

use futures::{StreamExt, TryStreamExt};
use neuroscan_core::storage::StoredImage;
use neuroscan_core::{NeuroscanError, ScanRecord, ScanStore, ScanTimestamp};
use serde_json::Value;

/// Up to `limit` records, newest first. Records are fetched lazily, so a
/// small limit only reads that many records from the store.
pub async fn list_history(
    store: &dyn ScanStore,
    limit: Option<usize>,
) -> Result<Value, NeuroscanError> {
    let records: Vec<ScanRecord> = store
        .list()
        .take(limit.unwrap_or(usize::MAX))
        .try_collect()
        .await?;

    tracing::debug!(count = records.len(), "History listed");
    to_json(&records)
}

pub async fn history_item(store: &dyn ScanStore, timestamp: &str) -> Result<Value, NeuroscanError> {
    let ts = ScanTimestamp::parse(timestamp)?;
    let record = store.get(&ts).await?;
    to_json(&record)
}

pub async fn history_image(
    store: &dyn ScanStore,
    timestamp: &str,
) -> Result<StoredImage, NeuroscanError> {
    let ts = ScanTimestamp::parse(timestamp)?;
    Ok(store.image(&ts).await?)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, NeuroscanError> {
    serde_json::to_value(value).map_err(|e| NeuroscanError::Other(e.to_string()))
}
