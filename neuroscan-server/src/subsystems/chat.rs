//! Chat subsystem: resolves the grounding record and asks the model.

use neuroscan_core::{NeuroscanError, OperationKind, ScanTimestamp};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::http::HttpState;

#[derive(Debug, Deserialize, Default)]
pub struct ChatRequest {
    #[serde(default)]
    pub prompt: String,
    /// Record to ground the answer in; the newest record when absent.
    #[serde(default)]
    pub timestamp: Option<String>,
}

pub async fn answer(
    state: &HttpState,
    client: &str,
    req: ChatRequest,
) -> Result<Value, NeuroscanError> {
    let timestamp = match req.timestamp.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => Some(ScanTimestamp::parse(raw)?),
        _ => None,
    };

    let ticket = state.guard.begin(client, OperationKind::Chat)?;
    let reply = ticket
        .run(state.chat.ask(&req.prompt, timestamp.as_ref()))
        .await??;

    Ok(json!({
        "response": reply.response,
        "timestamp": reply.timestamp,
    }))
}
