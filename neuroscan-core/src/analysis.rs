//! Analysis requestor: one image in, validated findings plus summary out.
//!
//! Two model calls per scan: a vision call that must return the analysis JSON,
//! then a text call that summarizes it. Nothing is persisted here.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AnalysisConfig;
use crate::error::ErrorKind;
use crate::gemini::{GenerativeModel, ModelError, Prompt};
use crate::models::{Analysis, AnalysisShapeError, ScanImage, ScanTags};
use crate::timestamp::ScanTimestamp;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("{0}")]
    Validation(String),

    #[error("Model request failed: {0}")]
    Transport(#[source] ModelError),

    #[error("Model response could not be used: {reason}")]
    MalformedResponse { reason: String, raw: String },
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Validation(_) => ErrorKind::Validation,
            AnalysisError::Transport(e) if e.is_timeout() => ErrorKind::Timeout,
            AnalysisError::Transport(_) => ErrorKind::Transport,
            AnalysisError::MalformedResponse { .. } => ErrorKind::MalformedResponse,
        }
    }

    /// Raw model text for malformed replies, echoed to clients for debugging.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            AnalysisError::MalformedResponse { raw, .. } if !raw.is_empty() => Some(raw),
            _ => None,
        }
    }
}

impl From<ModelError> for AnalysisError {
    fn from(e: ModelError) -> Self {
        if e.is_malformed() {
            AnalysisError::MalformedResponse {
                reason: e.to_string(),
                raw: String::new(),
            }
        } else {
            AnalysisError::Transport(e)
        }
    }
}

/// Result of a successful analysis, ready to be persisted.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    /// Candidate key, minted when the analysis finished.
    pub timestamp: ScanTimestamp,
    pub analysis: Analysis,
    /// `analysis` as the JSON document that gets stored.
    pub analysis_json: Value,
    pub summary: String,
    pub tags: ScanTags,
}

type Clock = Arc<dyn Fn() -> ScanTimestamp + Send + Sync>;

pub struct AnalysisRequestor {
    model: Arc<dyn GenerativeModel>,
    volume: AnalysisConfig,
    timeout: Option<Duration>,
    clock: Clock,
}

impl AnalysisRequestor {
    pub fn new(model: Arc<dyn GenerativeModel>, volume: AnalysisConfig) -> Self {
        Self {
            model,
            volume,
            timeout: None,
            clock: Arc::new(ScanTimestamp::now),
        }
    }

    /// Bound each model call, on top of the client's own timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_clock(mut self, clock: impl Fn() -> ScanTimestamp + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub async fn analyze(
        &self,
        image: &ScanImage,
        context: Option<&str>,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        if image.is_empty() {
            return Err(AnalysisError::Validation("Uploaded image is empty".to_string()));
        }

        let prompt = Prompt::text(self.analysis_prompt(context))
            .with_image(image.content_type.clone(), image.bytes.clone())
            .expect_json();

        debug!(
            model = self.model.name(),
            bytes = image.bytes.len(),
            content_type = %image.content_type,
            "Requesting scan analysis"
        );
        let raw = self.call(prompt).await?;

        let analysis = Analysis::from_model_reply(&raw).map_err(|e| {
            warn!(error = %e, "Model reply rejected");
            AnalysisError::MalformedResponse {
                reason: match e {
                    AnalysisShapeError::NoJson => "Model response is not valid JSON".to_string(),
                    other => other.to_string(),
                },
                raw: raw.clone(),
            }
        })?;

        let analysis_json = serde_json::to_value(&analysis).map_err(|e| {
            AnalysisError::MalformedResponse {
                reason: e.to_string(),
                raw: raw.clone(),
            }
        })?;

        let summary = self.summarize(&analysis_json).await?;
        let tags = ScanTags::from_analysis(&analysis);
        let timestamp = (self.clock)();

        info!(
            timestamp = %timestamp,
            tumor_type = %tags.tumor_type,
            "Scan analysis complete"
        );

        Ok(AnalysisOutcome {
            timestamp,
            analysis,
            analysis_json,
            summary,
            tags,
        })
    }

    async fn summarize(&self, analysis_json: &Value) -> Result<String, AnalysisError> {
        let pretty = serde_json::to_string_pretty(analysis_json).unwrap_or_default();
        let summary = self
            .call(Prompt::text(format!(
                "Summarize this analysis (2-3 sentences):\n{}",
                pretty
            )))
            .await?;

        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Err(AnalysisError::MalformedResponse {
                reason: "Summary is empty".to_string(),
                raw: summary,
            });
        }
        Ok(summary)
    }

    async fn call(&self, prompt: Prompt) -> Result<String, AnalysisError> {
        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.model.generate(prompt))
                .await
                .map_err(|_| ModelError::Timeout { limit })?,
            None => self.model.generate(prompt).await,
        };
        Ok(reply?)
    }

    fn analysis_prompt(&self, context: Option<&str>) -> String {
        let v = &self.volume;
        let mut prompt = format!(
            r#"Please analyze this MRI brain scan image and provide:

1. Detection of any visible brain tumors (location, size, characteristics) and what type they are (glioma, meningioma, pituitary). The image may not have a tumor at all. If there is a tumor, give the predicted X Y Z integer coordinates of where it is located. The dimensions of the scan are x={x}, y={y}, z={z}.
2. Assessment of gray matter loss or abnormalities (regions affected, severity). There may not be any gray matter loss at all.
3. Other notable abnormalities (if present).
4. Recommended follow-up actions based on findings.

Be very brief in analysis but accurate. Output your analysis as a JSON object only, without extra text or code block formatting, using exactly this shape:
{{
  "tumor_detection": {{
    "present": true | false,
    "type": "glioma" | "meningioma" | "pituitary" | "none",
    "confidence_percentage": 0-100,
    "location": "...",
    "size_description": "...",
    "coordinates": {{ "x": int, "y": int, "z": int }} | null,
    "key_features": ["..."],
    "distinguishers": ["..."]
  }},
  "gray_matter": {{
    "abnormalities": true | false,
    "regions_affected": "...",
    "severity": "none" | "mild" | "moderate" | "severe"
  }},
  "other_abnormalities": "...",
  "differential_diagnosis": [
    {{ "type": "...", "confidence_percentage": 0-100, "key_features": ["..."], "distinguishers": ["..."] }}
  ],
  "follow_up_actions": "..."
}}"#,
            x = v.volume_x,
            y = v.volume_y,
            z = v.volume_z,
        );

        if let Some(extra) = context.map(str::trim).filter(|c| !c.is_empty()) {
            prompt.push_str("\n\nAdditional clinical context from the requester:\n");
            prompt.push_str(extra);
        }
        prompt
    }
}
