//! Chat requestor: answers questions grounded in one stored analysis.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::ErrorKind;
use crate::gemini::{GenerativeModel, ModelError, Prompt};
use crate::storage::{ScanStore, StoreError};
use crate::timestamp::ScanTimestamp;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("No analysis context found for {0}")]
    NotFound(String),

    #[error("Model request failed: {0}")]
    Transport(#[source] ModelError),

    #[error("Model response could not be used: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Store(StoreError),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Validation(_) => ErrorKind::Validation,
            ChatError::NotFound(_) => ErrorKind::NotFound,
            ChatError::Transport(e) if e.is_timeout() => ErrorKind::Timeout,
            ChatError::Transport(_) => ErrorKind::Transport,
            ChatError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            ChatError::Store(e) => e.kind(),
        }
    }
}

impl From<ModelError> for ChatError {
    fn from(e: ModelError) -> Self {
        if e.is_malformed() {
            ChatError::MalformedResponse(e.to_string())
        } else {
            ChatError::Transport(e)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub response: String,
    /// The record the answer was grounded in.
    pub timestamp: ScanTimestamp,
}

pub struct ChatRequestor {
    model: Arc<dyn GenerativeModel>,
    store: Arc<dyn ScanStore>,
    timeout: Option<Duration>,
}

impl ChatRequestor {
    pub fn new(model: Arc<dyn GenerativeModel>, store: Arc<dyn ScanStore>) -> Self {
        Self {
            model,
            store,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Answer `prompt` about the record at `timestamp`, or the newest record
    /// when none is given. The record is resolved before any model call.
    pub async fn ask(
        &self,
        prompt: &str,
        timestamp: Option<&ScanTimestamp>,
    ) -> Result<ChatReply, ChatError> {
        let question = prompt.trim();
        if question.is_empty() {
            return Err(ChatError::Validation("No prompt provided".to_string()));
        }

        let record = match timestamp {
            Some(ts) => self.store.get(ts).await.map_err(|e| match e {
                StoreError::NotFound(_) => ChatError::NotFound(ts.to_string()),
                other => ChatError::Store(other),
            })?,
            None => self
                .store
                .latest()
                .await
                .map_err(ChatError::Store)?
                .ok_or_else(|| ChatError::NotFound("latest scan".to_string()))?,
        };

        debug!(timestamp = %record.timestamp, model = self.model.name(), "Asking grounded question");
        let request = Prompt::text(grounded_prompt(&record.analysis, question));
        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.model.generate(request))
                .await
                .map_err(|_| ModelError::Timeout { limit })?,
            None => self.model.generate(request).await,
        }?;

        let response = reply.trim().to_string();
        if response.is_empty() {
            return Err(ChatError::MalformedResponse("Model returned an empty answer".to_string()));
        }

        info!(timestamp = %record.timestamp, chars = response.len(), "Chat answered");
        Ok(ChatReply {
            response,
            timestamp: record.timestamp,
        })
    }
}

pub fn grounded_prompt(analysis: &Value, question: &str) -> String {
    let context = serde_json::to_string_pretty(analysis).unwrap_or_else(|_| analysis.to_string());
    format!(
        "You are a medical AI assistant.\n{}\nUser Question: {}\nAnswer clearly and concisely, no markdown.",
        context, question
    )
}
