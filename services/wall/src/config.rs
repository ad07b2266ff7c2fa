use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the wall service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Which storage backend to run against
    #[serde(default)]
    pub backend: BackendConfig,
    /// S3 configuration (durable backend)
    pub s3: Option<S3Config>,
    /// Database configuration (durable backend)
    pub database: Option<DatabaseConfig>,
    /// Local fallback backend configuration
    #[serde(default)]
    pub local: LocalConfig,
    /// Retention policy
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Upload handling
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Change feed configuration
    #[serde(default)]
    pub feed: FeedConfig,
    /// API configuration
    #[serde(default)]
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

/// Storage backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// PostgreSQL records + S3 blobs
    Durable,
    /// Single JSON document on local disk, blobs inlined
    #[default]
    Local,
    /// Process memory, lost on restart
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for photo storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL for a bucket served directly (CDN, public-read bucket).
    /// When unset, URLs are presigned.
    pub public_base_url: Option<String>,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
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

/// Local fallback backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Directory holding the photo document
    #[serde(default = "default_local_dir")]
    pub dir: PathBuf,
}

/// Retention policy
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Maximum number of live photos; the oldest are evicted beyond this
    #[serde(default = "default_max_photos")]
    pub max_photos: u64,
}

/// Upload handling
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Maximum concurrent blob uploads
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

/// How the change feed learns about changes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    /// Push when the backend supports it, poll otherwise
    #[default]
    Auto,
    Push,
    Poll,
}

/// Change feed configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub mode: FeedMode,
    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Full reconcile interval while in push mode, in seconds
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// Consecutive failed subscription attempts before falling back to polling
    #[serde(default = "default_max_push_failures")]
    pub max_push_failures: u32,
    /// Base delay between resubscription attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay between resubscription attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Events buffered per subscriber before it is told to resync
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// API configuration
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
}

// Default value functions
fn default_service_name() -> String {
    "event-wall".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
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

fn default_local_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_photos() -> u64 {
    500
}

fn default_upload_concurrency() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_resync_interval_secs() -> u64 {
    30
}

fn default_max_push_failures() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    250
}

fn default_reconnect_max_delay_ms() -> u64 {
    10_000
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/wall").required(false))
            .add_source(config::File::with_name("/etc/event-wall/wall").required(false))
            // Override with environment variables
            // WALL__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("WALL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retention.max_photos == 0 {
            anyhow::bail!("retention.max_photos must be at least 1");
        }
        if self.ingest.upload_concurrency == 0 {
            anyhow::bail!("ingest.upload_concurrency must be at least 1");
        }
        if self.feed.channel_capacity == 0 {
            anyhow::bail!("feed.channel_capacity must be at least 1");
        }
        if self.feed.poll_interval_ms == 0 {
            anyhow::bail!("feed.poll_interval_ms must be at least 1");
        }
        if self.feed.resync_interval_secs == 0 {
            anyhow::bail!("feed.resync_interval_secs must be at least 1");
        }
        if self.backend.kind == BackendKind::Durable {
            if self.database.is_none() {
                anyhow::bail!("durable backend requires a [database] section");
            }
            if self.s3.is_none() {
                anyhow::bail!("durable backend requires an [s3] section");
            }
        }
        Ok(())
    }
}

impl S3Config {
    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.presigned_url_expiry_secs)
    }
}

impl FeedConfig {
    /// Never zero; timers cannot tick at a zero period
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Never zero
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
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

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            dir: default_local_dir(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_photos: default_max_photos(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: default_upload_concurrency(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            mode: FeedMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            resync_interval_secs: default_resync_interval_secs(),
            max_push_failures: default_max_push_failures(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}
