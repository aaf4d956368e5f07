use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the analysis service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Object storage configuration
    pub blob: BlobConfig,
    /// Vision model configuration
    pub vision: VisionConfig,
    /// Batch upload configuration
    #[serde(default)]
    pub batch: BatchConfig,
    /// Trash retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,
    /// API configuration
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// S3-compatible object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfig {
    /// Bucket holding uploaded photos
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, R2, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Base URL under which stored objects are publicly reachable.
    /// Derived from bucket/region/endpoint when absent.
    pub public_base_url: Option<String>,
    /// Prefix prepended to every object key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Vision model configuration (OpenAI-compatible chat completions API)
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    /// API base URL, without the trailing `/chat/completions`
    #[serde(default = "default_vision_api_base")]
    pub api_base: String,
    /// Bearer token for the API
    pub api_key: String,
    /// Model identifier
    #[serde(default = "default_vision_model")]
    pub model: String,
    /// Maximum tokens in the generated assessment
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-image request timeout in seconds
    #[serde(default = "default_vision_timeout_secs")]
    pub timeout_secs: u64,
}

/// Batch upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Maximum images accepted in one upload
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    /// Images analyzed at the same time (1 = sequential)
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,
    /// Locale used when the request carries none
    #[serde(default = "default_locale")]
    pub default_locale: String,
}

/// Trash retention configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Days a record stays in the trash before it is purged
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    /// Run the sweeper on a schedule inside the service
    #[serde(default = "default_true")]
    pub sweep_enabled: bool,
    /// Seconds between scheduled sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum request body size for uploads
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Shared secret for the maintenance endpoints (disabled when unset)
    pub maintenance_token: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "analysis-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "analyses".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_vision_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_vision_timeout_secs() -> u64 {
    60
}

fn default_max_images() -> usize {
    20
}

fn default_batch_concurrency() -> usize {
    1
}

fn default_locale() -> String {
    "zh-TW".to_string()
}

fn default_window_days() -> u32 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024 // 50MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "analysis-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("api.host", "0.0.0.0")?
            .set_default("api.port", 8080)?
            // Add config file if present
            .add_source(config::File::with_name("config/analysis").required(false))
            .add_source(config::File::with_name("/etc/siteeye/analysis").required(false))
            // Override with environment variables
            // ANALYSIS__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("ANALYSIS")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("api.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get the vision request timeout as Duration
    pub fn vision_timeout(&self) -> Duration {
        Duration::from_secs(self.vision.timeout_secs)
    }

    /// Get the trash retention window as Duration
    pub fn retention_window(&self) -> Duration {
        self.retention.window()
    }

    /// Get the interval between scheduled sweeps as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention.sweep_interval_secs)
    }
}

impl DatabaseConfig {
    /// Pool acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle connection lifetime as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl RetentionConfig {
    /// Retention window as Duration
    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.window_days) * 24 * 60 * 60)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_images: default_max_images(),
            concurrency: default_batch_concurrency(),
            default_locale: default_locale(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            sweep_enabled: true,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}
