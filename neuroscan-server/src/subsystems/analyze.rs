//! Analyze subsystem: upload → analysis → timestamp claim → persist.
//!
//! The model calls and the timestamp claim run under the client's `analyze`
//! in-flight ticket and stop as soon as the ticket is cancelled. The store
//! write itself is never interrupted: once `put` starts it either completes
//! or cleans up after itself.

use axum::extract::Multipart;
use axum::http::StatusCode;
use bytes::Bytes;
use neuroscan_core::storage::KeyLayout;
use neuroscan_core::{GuardError, NeuroscanError, OperationKind, ScanImage};
use serde_json::{json, Map, Value};

use crate::http::HttpState;

/// Parsed `multipart/form-data` body of `/analyze_mri`.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Bytes,
    pub context: Option<String>,
}

/// Pull the `file` (and optional `context`) fields out of the form.
pub async fn read_upload(mut multipart: Multipart) -> Result<Upload, (StatusCode, String)> {
    let mut file: Option<(String, Bytes)> = None;
    let mut context = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (e.status(), e.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or_default().trim().to_string();
                let bytes = field.bytes().await.map_err(|e| (e.status(), e.body_text()))?;
                file = Some((file_name, bytes));
            }
            Some("context") => {
                context = Some(field.text().await.map_err(|e| (e.status(), e.body_text()))?);
            }
            _ => {}
        }
    }

    match file {
        Some((file_name, bytes)) if !file_name.is_empty() => Ok(Upload {
            file_name,
            bytes,
            context,
        }),
        _ => Err((StatusCode::BAD_REQUEST, "No file provided".to_string())),
    }
}

pub async fn analyze_and_store(
    state: &HttpState,
    client: &str,
    upload: Upload,
) -> Result<Value, NeuroscanError> {
    let ticket = state.guard.begin(client, OperationKind::Analyze)?;
    let image = ScanImage::new(upload.bytes, Some(&upload.file_name));

    tracing::info!(
        client = %client,
        file = %upload.file_name,
        bytes = image.bytes.len(),
        "Analyzing uploaded scan"
    );

    let outcome = ticket
        .run(state.analysis.analyze(&image, upload.context.as_deref()))
        .await??;

    let claimed = ticket
        .run(
            state
                .claims
                .claim(state.store.as_ref(), outcome.timestamp.clone()),
        )
        .await??;

    if ticket.is_cancelled() {
        return Err(GuardError::Cancelled {
            kind: OperationKind::Analyze,
        }
        .into());
    }

    let ts = claimed.timestamp();
    let image_url = state
        .store
        .put(ts, &image, &outcome.analysis_json, &outcome.summary, &outcome.tags)
        .await?;

    let layout = KeyLayout::new(&state.config.storage.prefix);
    let mut body = match outcome.analysis_json {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    body.insert("message".into(), json!("Files uploaded successfully"));
    body.insert("timestamp".into(), json!(ts));
    body.insert("image_url".into(), json!(image_url));
    body.insert("json_file".into(), json!(layout.context_key(ts)));
    body.insert("image_file".into(), json!(layout.image_key(ts, &image.extension)));
    body.insert("summary_file".into(), json!(layout.summary_key(ts)));
    body.insert("summary".into(), json!(outcome.summary));
    body.insert("tags".into(), json!(outcome.tags));

    tracing::info!(timestamp = %ts, image_url = %image_url, "Scan stored");
    Ok(Value::Object(body))
}
