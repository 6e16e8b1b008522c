use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::models::analysis::Analysis;
use crate::timestamp::ScanTimestamp;

/// Badge projection of an analysis, shown in history listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTags {
    pub tumor_type: String,
    pub tumor_size: String,
}

impl ScanTags {
    pub fn from_analysis(analysis: &Analysis) -> Self {
        let detection = &analysis.tumor_detection;
        let tumor_size = if detection.present && !detection.size_description.trim().is_empty() {
            detection.size_description.trim().to_string()
        } else {
            "N/A".to_string()
        };
        Self {
            tumor_type: detection.tumor_type.to_string(),
            tumor_size,
        }
    }

    /// Best-effort projection from stored JSON that may predate the typed schema.
    pub fn from_context(context: &serde_json::Value) -> Self {
        if let Ok(analysis) = serde_json::from_value::<Analysis>(context.clone()) {
            return Self::from_analysis(&analysis);
        }
        let detection = &context["tumor_detection"];
        let present = detection["present"].as_bool().unwrap_or(false);
        let text = |key: &str| detection[key].as_str().map(str::to_string);
        Self {
            tumor_type: if present {
                text("type").unwrap_or_else(|| "unknown".to_string())
            } else {
                "none".to_string()
            },
            tumor_size: text("size_description")
                .filter(|_| present)
                .unwrap_or_else(|| "N/A".to_string()),
        }
    }
}

/// One persisted analysis, in the shape served by `/history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub timestamp: ScanTimestamp,
    #[serde(rename = "mri_url")]
    pub image_url: String,
    /// Analysis JSON exactly as stored.
    #[serde(rename = "context")]
    pub analysis: serde_json::Value,
    pub summary: String,
    pub tags: ScanTags,
}

impl ScanRecord {
    pub fn parsed_analysis(&self) -> Option<Analysis> {
        serde_json::from_value(self.analysis.clone()).ok()
    }
}

/// An uploaded image with its detected content type.
#[derive(Debug, Clone)]
pub struct ScanImage {
    pub bytes: Bytes,
    pub content_type: String,
    pub extension: String,
}

impl ScanImage {
    pub fn new(bytes: impl Into<Bytes>, file_name: Option<&str>) -> Self {
        let extension = file_name
            .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
            .filter(|ext| content_type_for(ext).is_some())
            .unwrap_or_else(|| "jpg".to_string());
        let content_type = content_type_for(&extension)
            .unwrap_or("image/jpeg")
            .to_string();
        Self {
            bytes: bytes.into(),
            content_type,
            extension,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// MIME type for the image extensions the vision API accepts.
pub fn content_type_for(extension: &str) -> Option<&'static str> {
    match extension {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}
