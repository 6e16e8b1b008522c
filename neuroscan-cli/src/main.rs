//! neuroscan: command-line client for the NeuroScan server
//!
//! Plays the part of the browser UI: uploads scans, chats about the current
//! scan, browses history and keeps the "current scan" selection on local disk.
//!
//! # Subcommands
//! - `analyze <file> [--context <text>]`           upload, analyze, select the new scan
//! - `chat <question> [--timestamp <ts>]`          ask about the selected (or given) scan
//! - `history [-n <limit>] [--tumor-type <t>] [--json]`
//! - `select <timestamp>` / `current` / `clear`    manage the selection
//! - `viewer [--scan-dir <dir>] [--coords x y z]`  launch the 3D viewer
//! - `cancel <analyze|chat|viewer>`                cancel this client's outstanding request
//! - `status`                                      show server health

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use neuroscan_core::models::Coordinates;
use neuroscan_core::{
    ClientSelection, FileSelectionStore, ImagePreview, ScanRecord, ScanTimestamp, SelectionStore,
};
use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use serde_json::{json, Value};

const DEFAULT_SERVER: &str = "http://127.0.0.1:5000";
const DEFAULT_STATE_FILE: &str = "~/.neuroscan/selection.json";
const CLIENT_ID_HEADER: &str = "x-client-id";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "neuroscan", version, about = "NeuroScan MRI analysis client")]
struct Cli {
    /// NeuroScan server URL
    #[arg(long, env = "NEUROSCAN_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Where the current-scan selection is kept
    #[arg(long, env = "NEUROSCAN_STATE_FILE", default_value = DEFAULT_STATE_FILE)]
    state_file: String,

    /// Client id sent as X-Client-Id (default: persisted next to the state file)
    #[arg(long, env = "NEUROSCAN_CLIENT_ID")]
    client_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload an MRI image for analysis and select the stored result
    Analyze {
        file: PathBuf,

        /// Extra clinical context passed to the model
        #[arg(long)]
        context: Option<String>,
    },

    /// Ask a question about a stored analysis
    Chat {
        question: String,

        /// Scan to ask about (default: the current selection)
        #[arg(long)]
        timestamp: Option<String>,
    },

    /// List stored scans, newest first
    History {
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Only show scans with this tumor type (glioma, meningioma, pituitary, none)
        #[arg(long)]
        tumor_type: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Make a stored scan the current selection
    Select { timestamp: String },

    /// Show the current selection
    Current,

    /// Forget the current selection
    Clear,

    /// Launch the 3D viewer on the server host
    Viewer {
        #[arg(long, default_value = "scan")]
        scan_dir: String,

        /// Tumor coordinates (default: taken from the latest analysis)
        #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"])]
        coords: Option<Vec<i32>>,
    },

    /// Cancel this client's outstanding request of the given kind
    Cancel { kind: String },

    /// Show NeuroScan server status
    Status,
}

// ============================================================================
// HTTP client
// ============================================================================

struct Api {
    http: Client,
    server: String,
    client_id: String,
}

impl Api {
    fn new(server: &str, client_id: String, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            server: server.trim_end_matches('/').to_string(),
            client_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    fn send(&self, req: RequestBuilder) -> anyhow::Result<Value> {
        let resp = req
            .header(CLIENT_ID_HEADER, &self.client_id)
            .send()
            .with_context(|| format!("connection failed to {}", self.server))?;
        into_json(resp)
    }
}

fn into_json(resp: Response) -> anyhow::Result<Value> {
    let status = resp.status();
    let text = resp.text().unwrap_or_default();
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
    if !status.is_success() {
        bail!("{}", error_message(status.as_u16(), &body, &text));
    }
    Ok(body)
}

/// Human-readable message for a failed request: the server's `{error}` if
/// it sent one, otherwise the raw body.
pub fn error_message(status: u16, body: &Value, raw: &str) -> String {
    let detail = body["error"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| raw.trim().to_string());
    match status {
        404 => format!("not found: {}", detail),
        409 => format!("busy or cancelled: {}", detail),
        _ => format!("server returned {}: {}", status, detail),
    }
}

// ============================================================================
// Client id and selection helpers
// ============================================================================

/// Stable per-installation client id, created on first use.
fn load_or_create_client_id(state_file: &Path) -> anyhow::Result<String> {
    let path = state_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .join("client_id");

    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    std::fs::write(&path, &id).with_context(|| format!("cannot write {}", path.display()))?;
    Ok(id)
}

/// Record a successful upload as the current selection.
pub fn select_uploaded(
    store: &dyn SelectionStore,
    response: &Value,
    file: &Path,
) -> anyhow::Result<ScanTimestamp> {
    let raw = response["timestamp"]
        .as_str()
        .context("server response has no timestamp")?;
    let ts = ScanTimestamp::parse(raw)?;
    let file = std::fs::canonicalize(file).unwrap_or_else(|_| file.to_path_buf());
    store.set_current(ClientSelection::uploaded(ts.clone(), file))?;
    Ok(ts)
}

/// Explicit `--timestamp` wins; otherwise the current selection, if any.
pub fn chat_timestamp(
    explicit: Option<&str>,
    selection: Option<&ClientSelection>,
) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| selection.map(|s| s.current_timestamp.to_string()))
}

pub fn filter_by_tumor_type(records: Vec<ScanRecord>, tumor_type: Option<&str>) -> Vec<ScanRecord> {
    match tumor_type {
        Some(wanted) => records
            .into_iter()
            .filter(|r| r.tags.tumor_type.eq_ignore_ascii_case(wanted.trim()))
            .collect(),
        None => records,
    }
}

pub fn history_line(record: &ScanRecord, current: Option<&ScanTimestamp>) -> String {
    let marker = if current == Some(&record.timestamp) { "*" } else { " " };
    format!(
        "{} {}  [{} | {}]  {}",
        marker, record.timestamp, record.tags.tumor_type, record.tags.tumor_size, record.summary
    )
}

// ============================================================================
// Commands
// ============================================================================

fn do_analyze(
    api: &Api,
    store: &dyn SelectionStore,
    file: &Path,
    context: Option<String>,
) -> anyhow::Result<()> {
    let mut form = multipart::Form::new()
        .file("file", file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    if let Some(ctx) = context {
        form = form.text("context", ctx);
    }

    let body = api.send(api.http.post(api.url("/analyze_mri")).multipart(form))?;
    let ts = select_uploaded(store, &body, file)?;

    println!("Scan stored as {}", ts);
    println!("Image:   {}", body["image_url"].as_str().unwrap_or("?"));
    println!(
        "Tumor:   {} ({})",
        body["tags"]["tumorType"].as_str().unwrap_or("?"),
        body["tags"]["tumorSize"].as_str().unwrap_or("?")
    );
    println!("\n{}", body["summary"].as_str().unwrap_or(""));
    Ok(())
}

fn do_chat(
    api: &Api,
    store: &dyn SelectionStore,
    question: &str,
    timestamp: Option<&str>,
) -> anyhow::Result<()> {
    let selection = store.get_current()?;
    let mut request = json!({ "prompt": question });
    if let Some(ts) = chat_timestamp(timestamp, selection.as_ref()) {
        request["timestamp"] = json!(ts);
    }

    let body = api.send(api.http.post(api.url("/chat")).json(&request))?;
    println!("{}", body["response"].as_str().unwrap_or(""));
    Ok(())
}

fn do_history(
    api: &Api,
    store: &dyn SelectionStore,
    limit: Option<usize>,
    tumor_type: Option<&str>,
    json_output: bool,
) -> anyhow::Result<()> {
    let mut req = api.http.get(api.url("/history"));
    // filtering happens client-side, so a limit would cut matches short
    if let (Some(n), None) = (limit, tumor_type) {
        req = req.query(&[("limit", n)]);
    }

    let body = api.send(req)?;
    let records: Vec<ScanRecord> =
        serde_json::from_value(body).context("failed to parse history response")?;
    let mut records = filter_by_tumor_type(records, tumor_type);
    if let Some(n) = limit {
        records.truncate(n);
    }

    if json_output {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        eprintln!("No scans found");
        return Ok(());
    }

    let current = store.get_current()?.map(|s| s.current_timestamp);
    for record in &records {
        println!("{}", history_line(record, current.as_ref()));
    }
    Ok(())
}

fn do_select(api: &Api, store: &dyn SelectionStore, timestamp: &str) -> anyhow::Result<()> {
    let ts = ScanTimestamp::parse(timestamp)?;
    let body = api.send(api.http.get(api.url(&format!("/history/{}", ts))))?;
    let record: ScanRecord =
        serde_json::from_value(body).context("failed to parse history item")?;

    store.set_current(ClientSelection::from_record(&record))?;
    println!("Selected {}", record.timestamp);
    println!("Image:   {}", record.image_url);
    Ok(())
}

fn do_current(store: &dyn SelectionStore) -> anyhow::Result<()> {
    match store.get_current()? {
        Some(selection) => {
            println!("Current scan: {}", selection.current_timestamp);
            match selection.current_image_preview {
                Some(ImagePreview::LocalFile(path)) => println!("Preview:      {}", path.display()),
                Some(ImagePreview::Remote(url)) => println!("Preview:      {}", url),
                None => {}
            }
        }
        None => println!("No scan selected"),
    }
    Ok(())
}

fn do_viewer(api: &Api, scan_dir: &str, coords: Option<Vec<i32>>) -> anyhow::Result<()> {
    let mut request = json!({ "scanDir": scan_dir });
    if let Some(c) = coords.as_deref() {
        let [x, y, z] = c else {
            bail!("--coords takes exactly three values");
        };
        request["tumorCoords"] = json!(Coordinates { x: *x, y: *y, z: *z });
    }

    let body = api.send(api.http.post(api.url("/run-viewer")).json(&request))?;
    println!("{}", body["message"].as_str().unwrap_or("Viewer launched"));
    Ok(())
}

fn do_cancel(api: &Api, kind: &str) -> anyhow::Result<()> {
    let body = api.send(api.http.delete(api.url(&format!("/inflight/{}", kind))))?;
    if body["cancelled"].as_bool().unwrap_or(false) {
        println!("Cancelled outstanding {} request", kind);
    } else {
        println!("No outstanding {} request", kind);
    }
    Ok(())
}

fn do_status(api: &Api) -> anyhow::Result<()> {
    let body = api.send(api.http.get(api.url("/health")))?;
    println!("NeuroScan server: {}", body["status"].as_str().unwrap_or("unknown"));
    println!("Version:          {}", body["version"].as_str().unwrap_or("?"));
    println!("Storage:          {}", body["storage"].as_str().unwrap_or("?"));
    println!("Model:            {}", body["model"].as_str().unwrap_or("?"));
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn run(cli: Cli) -> anyhow::Result<()> {
    let store = FileSelectionStore::from_user_path(&cli.state_file);

    // selection-only commands never touch the network
    match &cli.command {
        Commands::Current => return do_current(&store),
        Commands::Clear => {
            store.clear()?;
            println!("Selection cleared");
            return Ok(());
        }
        _ => {}
    }

    let client_id = match cli.client_id {
        Some(id) => id,
        None => load_or_create_client_id(store.path())?,
    };
    // analysis runs two model calls back to back
    let timeout = match cli.command {
        Commands::Analyze { .. } | Commands::Chat { .. } => Duration::from_secs(300),
        _ => Duration::from_secs(30),
    };
    let api = Api::new(&cli.server, client_id, timeout)?;

    match cli.command {
        Commands::Analyze { file, context } => do_analyze(&api, &store, &file, context),
        Commands::Chat {
            question,
            timestamp,
        } => do_chat(&api, &store, &question, timestamp.as_deref()),
        Commands::History {
            limit,
            tumor_type,
            json,
        } => do_history(&api, &store, limit, tumor_type.as_deref(), json),
        Commands::Select { timestamp } => do_select(&api, &store, &timestamp),
        Commands::Viewer { scan_dir, coords } => do_viewer(&api, &scan_dir, coords),
        Commands::Cancel { kind } => do_cancel(&api, &kind),
        Commands::Status => do_status(&api),
        Commands::Current | Commands::Clear => Ok(()),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("neuroscan: {:#}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
