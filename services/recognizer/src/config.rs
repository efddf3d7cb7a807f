use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the recognizer service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Drop directory watcher configuration
    #[serde(default)]
    pub watcher: WatcherConfig,
    /// Plate detection configuration
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Archive and audit log configuration
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Archive retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
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
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus metrics port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Drop directory watcher configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Directory the capture process writes images into
    #[serde(default = "default_drop_dir")]
    pub drop_dir: PathBuf,
    /// Accepted file extensions (case-insensitive, without dot)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Upper bound on waiting for a file to stop growing, in milliseconds
    #[serde(default = "default_stability_timeout_ms")]
    pub stability_timeout_ms: u64,
    /// Interval between file size polls, in milliseconds
    #[serde(default = "default_stability_poll_ms")]
    pub stability_poll_ms: u64,
    /// Capacity of the notification queue feeding the processing worker
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Delay before re-establishing a failed watch, in seconds
    #[serde(default = "default_restart_backoff_secs")]
    pub restart_backoff_secs: u64,
}

/// Plate detection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Number of largest contours inspected per image
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Douglas-Peucker tolerance in pixels
    #[serde(default = "default_polygon_epsilon")]
    pub polygon_epsilon: f64,
    /// Canny hysteresis low threshold
    #[serde(default = "default_canny_low")]
    pub canny_low: f32,
    /// Canny hysteresis high threshold
    #[serde(default = "default_canny_high")]
    pub canny_high: f32,
    /// Bilateral filter window size in pixels (0 disables smoothing)
    #[serde(default = "default_bilateral_window")]
    pub bilateral_window: u32,
    /// Bilateral filter intensity sigma
    #[serde(default = "default_bilateral_sigma")]
    pub bilateral_sigma_color: f32,
    /// Bilateral filter spatial sigma
    #[serde(default = "default_bilateral_sigma")]
    pub bilateral_sigma_spatial: f32,
    /// TrueType font for printing the plate text on annotated frames;
    /// frames carry only the rectangle when unset
    #[serde(default)]
    pub label_font: Option<PathBuf>,
    /// OCR backend configuration
    #[serde(default)]
    pub ocr: OcrConfig,
}

/// OCR backend selection
#[derive(Debug, Clone, Deserialize)]
pub struct OcrConfig {
    /// Backend name: "command" or "tesseract"
    #[serde(default = "default_ocr_backend")]
    pub backend: String,
    /// Program run by the command backend
    #[serde(default = "default_ocr_program")]
    pub program: String,
    /// Arguments for the command backend; `{input}` is replaced by the crop path
    #[serde(default = "default_ocr_args")]
    pub args: Vec<String>,
    /// Directory for temporary crop files
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Tesseract data path (tesseract backend)
    pub tessdata: Option<String>,
    /// Tesseract language (tesseract backend)
    #[serde(default = "default_ocr_language")]
    pub language: String,
}

/// Archive configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Root of the date/hour partitioned archive tree
    #[serde(default = "default_archive_root")]
    pub root: PathBuf,
    /// Root served as static files; API image paths are relative to it
    #[serde(default = "default_public_root")]
    pub public_root: PathBuf,
    /// JPEG quality for annotated images
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Plain-text audit log of recognized plates
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
}

/// Retention configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Archived images older than this are deleted, in days
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    /// Time between sweeps, in hours
    #[serde(default = "default_sweep_interval_hours")]
    pub sweep_interval_hours: u64,
    /// Time before retrying a failed sweep, in minutes
    #[serde(default = "default_retry_interval_mins")]
    pub retry_interval_mins: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
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
    /// Page size used when a request gives none
    #[serde(default = "default_page_size")]
    pub default_limit: u32,
    /// Upper bound on requested page size
    #[serde(default = "default_max_page_size")]
    pub max_limit: u32,
}

// Default value functions
fn default_service_name() -> String {
    "plate-recognizer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_drop_dir() -> PathBuf {
    PathBuf::from("capture")
}

fn default_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string()]
}

fn default_stability_timeout_ms() -> u64 {
    5_000
}

fn default_stability_poll_ms() -> u64 {
    500
}

fn default_queue_size() -> usize {
    256
}

fn default_restart_backoff_secs() -> u64 {
    5
}

fn default_top_k() -> usize {
    30
}

fn default_polygon_epsilon() -> f64 {
    10.0
}

fn default_canny_low() -> f32 {
    30.0
}

fn default_canny_high() -> f32 {
    200.0
}

fn default_bilateral_window() -> u32 {
    11
}

fn default_bilateral_sigma() -> f32 {
    17.0
}

fn default_ocr_backend() -> String {
    "command".to_string()
}

fn default_ocr_program() -> String {
    "tesseract".to_string()
}

fn default_ocr_args() -> Vec<String> {
    ["{input}", "stdout", "--psm", "7"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("plate-recognizer")
}

fn default_ocr_language() -> String {
    "eng".to_string()
}

fn default_archive_root() -> PathBuf {
    PathBuf::from("static/archive")
}

fn default_public_root() -> PathBuf {
    PathBuf::from("static")
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("license_plates.txt")
}

fn default_max_age_days() -> u64 {
    10
}

fn default_sweep_interval_hours() -> u64 {
    24
}

fn default_retry_interval_mins() -> u64 {
    60
}

fn default_database_url() -> String {
    "sqlite://plates.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5000
}

fn default_page_size() -> u32 {
    50
}

fn default_max_page_size() -> u32 {
    500
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/recognizer").required(false))
            .add_source(config::File::with_name("/etc/platewatch/recognizer").required(false))
            // Override with environment variables
            // RECOGNIZER__WATCHER__DROP_DIR -> watcher.drop_dir
            .add_source(
                config::Environment::with_prefix("RECOGNIZER")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("watcher.extensions")
                    .with_list_parse_key("detector.ocr.args")
                    .with_list_parse_key("api.cors_origins"),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.watcher.drop_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "watcher.drop_dir".to_string(),
            ));
        }

        if self.watcher.extensions.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "watcher.extensions".to_string(),
            ));
        }

        if self.watcher.stability_poll_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "watcher.stability_poll_ms".to_string(),
                message: "Poll interval must be greater than 0".to_string(),
            });
        }

        if self.watcher.stability_timeout_ms < self.watcher.stability_poll_ms {
            return Err(ConfigValidationError::InvalidValue {
                field: "watcher.stability_timeout_ms".to_string(),
                message: "Timeout must not be shorter than the poll interval".to_string(),
            });
        }

        if self.watcher.queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "watcher.queue_size".to_string(),
                message: "Queue size must be greater than 0".to_string(),
            });
        }

        if self.detector.top_k == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.top_k".to_string(),
                message: "At least one contour must be inspected".to_string(),
            });
        }

        if self.detector.polygon_epsilon <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.polygon_epsilon".to_string(),
                message: "Epsilon must be greater than 0".to_string(),
            });
        }

        if self.detector.canny_low < 0.0 || self.detector.canny_high < self.detector.canny_low {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.canny_high".to_string(),
                message: "High threshold must not be below the low threshold".to_string(),
            });
        }

        if self.detector.bilateral_window > 0
            && (self.detector.bilateral_sigma_color <= 0.0
                || self.detector.bilateral_sigma_spatial <= 0.0)
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.bilateral_sigma_color".to_string(),
                message: "Bilateral sigmas must be greater than 0".to_string(),
            });
        }

        if let Some(font) = &self.detector.label_font {
            if !font.is_file() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "detector.label_font".to_string(),
                    message: format!("Font file {} does not exist", font.display()),
                });
            }
        }

        if !(1..=100).contains(&self.archive.jpeg_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "archive.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        if self.retention.max_age_days == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "retention.max_age_days".to_string(),
                message: "Retention must be at least one day".to_string(),
            });
        }

        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "database.url".to_string(),
            ));
        }

        Ok(())
    }
}

impl WatcherConfig {
    /// Get stability timeout as Duration
    pub fn stability_timeout(&self) -> Duration {
        Duration::from_millis(self.stability_timeout_ms)
    }

    /// Get stability poll interval as Duration
    pub fn stability_poll(&self) -> Duration {
        Duration::from_millis(self.stability_poll_ms)
    }

    /// Get watch restart backoff as Duration
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs)
    }
}

impl RetentionConfig {
    /// Get maximum archive age as Duration
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_days * 24 * 60 * 60)
    }

    /// Get sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_hours * 60 * 60)
    }

    /// Get retry interval after a failed sweep as Duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_mins * 60)
    }
}

impl DatabaseConfig {
    /// Get connection acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            drop_dir: default_drop_dir(),
            extensions: default_extensions(),
            stability_timeout_ms: default_stability_timeout_ms(),
            stability_poll_ms: default_stability_poll_ms(),
            queue_size: default_queue_size(),
            restart_backoff_secs: default_restart_backoff_secs(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            polygon_epsilon: default_polygon_epsilon(),
            canny_low: default_canny_low(),
            canny_high: default_canny_high(),
            bilateral_window: default_bilateral_window(),
            bilateral_sigma_color: default_bilateral_sigma(),
            bilateral_sigma_spatial: default_bilateral_sigma(),
            label_font: None,
            ocr: OcrConfig::default(),
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            backend: default_ocr_backend(),
            program: default_ocr_program(),
            args: default_ocr_args(),
            scratch_dir: default_scratch_dir(),
            tessdata: None,
            language: default_ocr_language(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: default_archive_root(),
            public_root: default_public_root(),
            jpeg_quality: default_jpeg_quality(),
            audit_log: default_audit_log(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            sweep_interval_hours: default_sweep_interval_hours(),
            retry_interval_mins: default_retry_interval_mins(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            run_migrations: default_true(),
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
            default_limit: default_page_size(),
            max_limit: default_max_page_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            watcher: WatcherConfig::default(),
            detector: DetectorConfig::default(),
            archive: ArchiveConfig::default(),
            retention: RetentionConfig::default(),
            database: DatabaseConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
