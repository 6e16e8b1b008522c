//! Viewer subsystem: launches the external 3D scan viewer.
//!
//! The viewer runs detached from the request: `/run-viewer` returns as soon
//! as the process is spawned. The client's `viewer` in-flight slot stays taken
//! until the process exits, and cancelling it terminates the viewer.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use neuroscan_core::config::ViewerConfig;
use neuroscan_core::models::Coordinates;
use neuroscan_core::{NeuroscanError, OperationKind, ScanStore};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::http::HttpState;

fn default_scan_dir() -> String {
    "scan".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerRequest {
    #[serde(default = "default_scan_dir")]
    pub scan_dir: String,
    #[serde(default)]
    pub tumor_coords: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Resolve the client's `scan_dir` under `viewer.scans_root`.
///
/// Only the configured root is shell-expanded. Request input must be a plain
/// relative path: absolute paths, `..`, `~` and `$VARS` are refused.
pub fn resolve_scan_dir(config: &ViewerConfig, scan_dir: &str) -> Result<PathBuf, NeuroscanError> {
    let scan_dir = scan_dir.trim();
    if scan_dir.is_empty() {
        return Err(NeuroscanError::Validation("scanDir must not be empty".to_string()));
    }
    if scan_dir.contains('$') || scan_dir.starts_with('~') {
        return Err(NeuroscanError::Validation(
            "scanDir must be a plain path relative to the scans root".to_string(),
        ));
    }

    let relative = Path::new(scan_dir);
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !plain {
        return Err(NeuroscanError::Validation(
            "scanDir must stay inside the scans root".to_string(),
        ));
    }

    let root = shellexpand::full(&config.scans_root)
        .map(|r| r.into_owned())
        .unwrap_or_else(|_| config.scans_root.clone());
    Ok(Path::new(&root).join(relative))
}

/// `<command> <args…> <scan_dir> [--tumor-coords x y z]`
pub fn build_command(
    config: &ViewerConfig,
    scan_dir: &Path,
    coords: Option<Coordinates>,
) -> ViewerCommand {
    let mut args = config.args.clone();
    args.push(scan_dir.display().to_string());
    if let Some(c) = coords {
        args.extend([
            "--tumor-coords".to_string(),
            c.x.to_string(),
            c.y.to_string(),
            c.z.to_string(),
        ]);
    }
    ViewerCommand {
        program: config.command.clone(),
        args,
    }
}

/// Tumor coordinates recorded in a stored analysis, if a tumor was found.
pub fn coordinates_from_context(context: &Value) -> Option<Coordinates> {
    let detection = &context["tumor_detection"];
    if !detection["present"].as_bool().unwrap_or(false) {
        return None;
    }
    serde_json::from_value(detection["coordinates"].clone()).ok()
}

async fn latest_coordinates(store: &dyn ScanStore) -> Option<Coordinates> {
    match store.latest().await {
        Ok(Some(record)) => coordinates_from_context(&record.analysis),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Could not read latest analysis for viewer coordinates");
            None
        }
    }
}

pub async fn launch(
    state: &HttpState,
    client: &str,
    req: ViewerRequest,
) -> Result<Value, NeuroscanError> {
    let scan_dir = resolve_scan_dir(&state.config.viewer, &req.scan_dir)?;
    let is_dir = tokio::fs::metadata(&scan_dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        tracing::debug!(path = %scan_dir.display(), "Viewer scan directory missing");
        return Err(NeuroscanError::NotFound(format!(
            "Scan directory '{}' not found",
            req.scan_dir.trim()
        )));
    }

    let ticket = state.guard.begin(client, OperationKind::Viewer)?;

    let coords = match req.tumor_coords {
        Some(c) => Some(c),
        None => latest_coordinates(state.store.as_ref()).await,
    };
    let command = build_command(&state.config.viewer, &scan_dir, coords);

    tracing::info!(
        program = %command.program,
        args = ?command.args,
        "Launching viewer"
    );

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| {
            NeuroscanError::Other(format!("Failed to launch viewer '{}': {}", command.program, e))
        })?;

    let pid = child.id();
    tokio::spawn(async move {
        let outcome = ticket.run(child.wait()).await;
        match outcome {
            Ok(Ok(status)) => tracing::info!(?pid, %status, "Viewer exited"),
            Ok(Err(e)) => tracing::warn!(?pid, error = %e, "Failed to wait for viewer"),
            Err(_cancelled) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(?pid, error = %e, "Failed to stop viewer");
                } else {
                    tracing::info!(?pid, "Viewer stopped on request");
                }
            }
        }
    });

    Ok(json!({
        "success": true,
        "message": format!("Viewer launched for {}", req.scan_dir.trim()),
        "tumorCoords": coords,
    }))
}
