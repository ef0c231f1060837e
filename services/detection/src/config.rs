use crate::artifact_locator::TieBreak;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the detection service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Temporary upload storage
    #[serde(default)]
    pub uploads: UploadsConfig,
    /// External detector process
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Result artifact discovery
    #[serde(default)]
    pub locator: LocatorConfig,
    /// S3 configuration
    pub s3: S3Config,
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
    /// Metrics port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
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
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Serve the upload and result directories under /uploads and /runs
    #[serde(default = "default_true")]
    pub serve_static: bool,
}

/// Temporary upload storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadsConfig {
    /// Directory inbound images are written to
    #[serde(default = "default_uploads_dir")]
    pub dir: PathBuf,
}

/// External detector process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Executable to launch
    #[serde(default = "default_detector_program")]
    pub program: String,
    /// Arguments placed before the image path
    #[serde(default = "default_detector_args")]
    pub args: Vec<String>,
    /// Working directory for the child (inherits ours when unset)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Run limit in seconds; 0 lets the detector run unbounded
    #[serde(default = "default_detector_timeout_secs")]
    pub timeout_secs: u64,
    /// Detector runs allowed at once. With 1, result attribution is exact.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

/// Artifact locator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LocatorConfig {
    /// Roots holding per-run result directories, in priority order
    #[serde(default = "default_search_roots")]
    pub search_roots: Vec<PathBuf>,
    /// Directories scanned for loose result images
    #[serde(default = "default_fallback_dirs")]
    pub fallback_dirs: Vec<PathBuf>,
    /// Delay between detector exit and the first directory scan
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// How equally-recent run directories are ordered
    #[serde(default)]
    pub tie_break: TieBreak,
    /// Accepted result image extensions (case-insensitive)
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for result images
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix results are published under
    #[serde(default = "default_folder")]
    pub folder: String,
    /// Public base URL for published objects; presigned URLs are returned when unset
    pub public_base_url: Option<String>,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Per-operation timeout applied by the SDK client
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "detection-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5002
}

fn default_true() -> bool {
    true
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024 // 20MB
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_detector_program() -> String {
    "python".to_string()
}

fn default_detector_args() -> Vec<String> {
    vec!["yolov8/detect.py".to_string()]
}

fn default_detector_timeout_secs() -> u64 {
    300
}

fn default_max_concurrent_jobs() -> usize {
    1
}

fn default_search_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("runs/detect")]
}

fn default_fallback_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("runs")]
}

fn default_grace_period_ms() -> u64 {
    1500
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "webp"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_folder() -> String {
    "detections".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    7 * 24 * 3600 // SigV4 maximum
}

fn default_upload_timeout_secs() -> u64 {
    60
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "detection-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/detection").required(false))
            .add_source(config::File::with_name("/etc/nier/detection").required(false))
            // Override with environment variables
            // DETECTION__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("DETECTION")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("detector.args")
                    .with_list_parse_key("locator.search_roots")
                    .with_list_parse_key("locator.fallback_dirs")
                    .with_list_parse_key("locator.image_extensions")
                    .with_list_parse_key("api.cors_origins"),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot reject on its own
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.detector.program.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("detector.program".into()));
        }
        if self.detector.max_concurrent_jobs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.max_concurrent_jobs".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.locator.image_extensions.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "locator.image_extensions".into(),
            ));
        }
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".into()));
        }
        if self.s3.part_size_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.part_size_bytes".into(),
                message: "must be greater than zero".into(),
            });
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

impl DetectorConfig {
    /// Run limit, `None` when unbounded
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Directories relative search paths are resolved against, in priority
    /// order: the detector's working directory, the service's working
    /// directory, then the directory holding the service executable.
    pub fn search_bases(&self, service_dir: &Path, exe_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut bases = Vec::with_capacity(3);
        if let Some(ref dir) = self.working_dir {
            bases.push(service_dir.join(dir));
        }
        bases.push(service_dir.to_path_buf());
        if let Some(dir) = exe_dir {
            bases.push(dir.to_path_buf());
        }
        dedup(bases)
    }
}

impl LocatorConfig {
    /// Get grace period as Duration
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Resolve each relative root against every base in turn and drop
    /// duplicates, keeping first occurrence.
    pub fn resolved_search_roots(&self, bases: &[PathBuf]) -> Vec<PathBuf> {
        resolve_all(&self.search_roots, bases)
    }

    /// Resolve fallback directories like search roots, followed by `upload_dir`.
    pub fn resolved_fallback_dirs(&self, bases: &[PathBuf], upload_dir: &Path) -> Vec<PathBuf> {
        let mut dirs = self.fallback_dirs.clone();
        dirs.push(upload_dir.to_path_buf());
        resolve_all(&dirs, bases)
    }
}

fn resolve_all(paths: &[PathBuf], bases: &[PathBuf]) -> Vec<PathBuf> {
    let mut resolved = Vec::with_capacity(paths.len() * bases.len().max(1));
    for path in paths {
        if path.is_absolute() {
            resolved.push(path.clone());
        } else {
            resolved.extend(bases.iter().map(|base| base.join(path)));
        }
    }
    dedup(resolved)
}

fn dedup(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut unique: Vec<PathBuf> = Vec::with_capacity(paths.len());
    for path in paths {
        if !unique.contains(&path) {
            unique.push(path);
        }
    }
    unique
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

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
            serve_static: true,
        }
    }
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            dir: default_uploads_dir(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            program: default_detector_program(),
            args: default_detector_args(),
            working_dir: None,
            timeout_secs: default_detector_timeout_secs(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            search_roots: default_search_roots(),
            fallback_dirs: default_fallback_dirs(),
            grace_period_ms: default_grace_period_ms(),
            tie_break: TieBreak::default(),
            image_extensions: default_image_extensions(),
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
