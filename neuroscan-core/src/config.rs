use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NeuroscanConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConfig {
    pub model: String,
    pub base_url: String,
    pub timeout_seconds: u64,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout_seconds: 120,
            temperature: 0.4,
            top_p: 0.95,
            top_k: 64,
            max_output_tokens: 8192,
        }
    }
}

/// Dimensions of the scan volume the model is told to place coordinates in.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct AnalysisConfig {
    pub volume_x: u32,
    pub volume_y: u32,
    pub volume_z: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            volume_x: 401,
            volume_y: 200,
            volume_z: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub bucket: String,
    pub region: String,
    pub prefix: String,
    /// S3-compatible endpoint (MinIO, LocalStack). Enables path-style addressing.
    pub endpoint_url: Option<String>,
    pub public_base_url: Option<String>,
    pub cleanup_retries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            bucket: String::new(),
            region: "us-east-1".to_string(),
            prefix: "saved".to_string(),
            endpoint_url: None,
            public_base_url: None,
            cleanup_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ViewerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub scans_root: String,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec!["viewer.py".to_string()],
            scans_root: "./scans".to_string(),
        }
    }
}

impl NeuroscanConfig {
    /// Load `path` (TOML), then apply `NEUROSCAN__SECTION__KEY` overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("NEUROSCAN").separator("__"))
            .build()?;
        s.try_deserialize()
    }
}
