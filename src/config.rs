//! Service configuration and validation.
//!
//! Settings come from built-in defaults, an optional TOML file named by
//! `CODE_ANALYZER_CONFIG`, and finally environment variable overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::UnpackLimits;
use crate::error::{Error, Result};

/// Environment variable naming an optional TOML settings file.
pub const CONFIG_PATH_ENV: &str = "CODE_ANALYZER_CONFIG";

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the API listens on.
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Default tracing filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_api_port() -> u16 {
    3006
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            log_level: default_log_level(),
        }
    }
}

/// Upload handling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Base directory for per-run workspaces.
    #[serde(default = "default_upload_dir")]
    pub dir: PathBuf,
    /// Host path that maps to `dir` when the service itself runs in a container.
    #[serde(default)]
    pub host_dir: Option<PathBuf>,
    /// Maximum accepted archive size in bytes.
    #[serde(default = "default_max_upload_size")]
    pub max_size: usize,
    /// Maximum total size of the unpacked files in bytes.
    #[serde(default = "default_max_unpacked_size")]
    pub max_unpacked_size: u64,
    /// Maximum number of entries an archive may hold.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("/tmp/code-analyzer")
}

fn default_max_upload_size() -> usize {
    100 * 1024 * 1024
}

fn default_max_unpacked_size() -> u64 {
    UnpackLimits::default().max_bytes
}

fn default_max_entries() -> usize {
    UnpackLimits::default().max_entries
}

impl UploadConfig {
    /// Caps applied while unpacking an archive.
    pub fn unpack_limits(&self) -> UnpackLimits {
        UnpackLimits {
            max_entries: self.max_entries,
            max_bytes: self.max_unpacked_size,
        }
    }

    /// Translates a path under `dir` to the equivalent host path.
    ///
    /// Volume mounts are resolved by the container daemon, so when this
    /// service itself runs in a container they must name host paths.
    pub fn host_path(&self, path: &Path) -> PathBuf {
        match &self.host_dir {
            Some(host_dir) => match path.strip_prefix(&self.dir) {
                Ok(rest) => host_dir.join(rest),
                Err(_) => path.to_path_buf(),
            },
            None => path.to_path_buf(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: default_upload_dir(),
            host_dir: None,
            max_size: default_max_upload_size(),
            max_unpacked_size: default_max_unpacked_size(),
            max_entries: default_max_entries(),
        }
    }
}

/// Container sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Memory ceiling passed to the container runtime (e.g. `512m`).
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    /// CPU ceiling in cores.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    /// Timeout for individual runtime commands (pull, run, rm).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// First host port handed out to sessions.
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// Last host port handed out to sessions (inclusive).
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Maximum number of concurrently running sandboxes. Extra requests queue.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Number of console lines kept per session.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// Host the readiness probe and tests use to reach published ports.
    #[serde(default = "default_probe_host")]
    pub probe_host: String,
    /// Mount point of the code tree inside the container.
    #[serde(default = "default_container_workdir")]
    pub container_workdir: String,
}

fn default_memory_limit() -> String {
    "512m".to_string()
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_command_timeout() -> u64 {
    300
}

fn default_port_range_start() -> u16 {
    20000
}

fn default_port_range_end() -> u16 {
    20999
}

fn default_max_sessions() -> usize {
    4
}

fn default_log_capacity() -> usize {
    200
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

fn default_container_workdir() -> String {
    "/app".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            command_timeout_secs: default_command_timeout(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            max_sessions: default_max_sessions(),
            log_capacity: default_log_capacity(),
            probe_host: default_probe_host(),
            container_workdir: default_container_workdir(),
        }
    }
}

impl SandboxConfig {
    /// Returns the runtime command timeout as a Duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Number of ports in the configured range.
    pub fn port_count(&self) -> usize {
        if self.port_range_end < self.port_range_start {
            0
        } else {
            (self.port_range_end - self.port_range_start) as usize + 1
        }
    }
}

/// Readiness probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Total time a sandbox gets to become healthy.
    /// npm installs routinely take 90s+, hence the generous default.
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    /// Delay between readiness attempts.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Upper bound on a single readiness request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_health_timeout() -> u64 {
    180
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    5
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            health_timeout_secs: default_health_timeout(),
            poll_interval_ms: default_poll_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ProbeConfig {
    /// Returns the health budget as a Duration.
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    /// Returns the polling interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the per-request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Generated test execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Program and leading arguments; the test file path is appended.
    #[serde(default = "default_runner_command")]
    pub command: Vec<String>,
    /// Extension given to the materialized test file.
    #[serde(default = "default_test_extension")]
    pub file_extension: String,
    /// Hard limit on a single test run.
    #[serde(default = "default_test_timeout")]
    pub timeout_secs: u64,
    /// Captured output beyond this many bytes is truncated.
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: usize,
}

fn default_runner_command() -> Vec<String> {
    vec!["node".to_string()]
}

fn default_test_extension() -> String {
    "mjs".to_string()
}

fn default_test_timeout() -> u64 {
    60
}

fn default_max_log_bytes() -> usize {
    64 * 1024
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: default_runner_command(),
            file_extension: default_test_extension(),
            timeout_secs: default_test_timeout(),
            max_log_bytes: default_max_log_bytes(),
        }
    }
}

impl ExecutorConfig {
    /// Returns the test timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Reasoning service settings. Only the collaborators read these.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key sent as `x-api-key`.
    #[serde(default)]
    pub api_key: String,
    /// Base URL of the Messages API.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Model identifier.
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Response token ceiling.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Timeout for one collaborator call.
    #[serde(default = "default_llm_timeout")]
    pub request_timeout_secs: u64,
}

fn default_llm_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_llm_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_llm_timeout() -> u64 {
    300
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_llm_timeout(),
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &mask_secret(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl LlmConfig {
    /// Returns the request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Masks all but the first 8 characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let prefix: String = secret.chars().take(8).collect();
    format!("{}***", prefix)
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl Settings {
    /// Loads settings from the optional TOML file and process environment.
    pub fn load() -> Result<Self> {
        let mut settings = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Parses settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid config file {}: {}", path.display(), e)))
    }

    /// Applies environment overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("API_PORT") {
            self.server.port = parse_env("API_PORT", &v)?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.server.log_level = v.to_lowercase();
        }
        if let Some(v) = lookup("ANTHROPIC_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = lookup("ANTHROPIC_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = lookup("ANTHROPIC_MODEL_ID") {
            self.llm.model = v;
        }
        if let Some(v) = lookup("SANDBOX_TIMEOUT") {
            self.sandbox.command_timeout_secs = parse_env("SANDBOX_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("SANDBOX_MEMORY_LIMIT") {
            self.sandbox.memory_limit = v;
        }
        if let Some(v) = lookup("SANDBOX_CPU_LIMIT") {
            self.sandbox.cpu_limit = parse_env("SANDBOX_CPU_LIMIT", &v)?;
        }
        if let Some(v) = lookup("SANDBOX_MAX_SESSIONS") {
            self.sandbox.max_sessions = parse_env("SANDBOX_MAX_SESSIONS", &v)?;
        }
        if let Some(v) = lookup("UPLOAD_DIR") {
            self.upload.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HOST_UPLOAD_DIR") {
            self.upload.host_dir = if v.is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
        if let Some(v) = lookup("MAX_UPLOAD_SIZE") {
            self.upload.max_size = parse_env("MAX_UPLOAD_SIZE", &v)?;
        }
        if let Some(v) = lookup("MAX_UNPACKED_SIZE") {
            self.upload.max_unpacked_size = parse_env("MAX_UNPACKED_SIZE", &v)?;
        }
        if let Some(v) = lookup("MAX_ARCHIVE_ENTRIES") {
            self.upload.max_entries = parse_env("MAX_ARCHIVE_ENTRIES", &v)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value '{}' for {}", value, key)))
}

fn is_valid_memory_limit(limit: &str) -> bool {
    let limit = limit.trim().to_lowercase();
    let digits = limit.trim_end_matches(['b', 'k', 'm', 'g']);
    let suffix_len = limit.len() - digits.len();
    !digits.is_empty() && suffix_len <= 1 && digits.chars().all(|c| c.is_ascii_digit())
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.port_count() == 0 {
            result.add_error("port_range_end must not be below port_range_start");
        }

        if self.max_sessions == 0 {
            result.add_error("max_sessions must be at least 1");
        } else if self.max_sessions > self.port_count() {
            result.add_error("max_sessions cannot exceed the number of ports in the range");
        }

        if self.cpu_limit <= 0.0 {
            result.add_error("cpu_limit must be positive");
        }

        if !is_valid_memory_limit(&self.memory_limit) {
            result.add_error(format!(
                "memory_limit '{}' is not of the form <number>[b|k|m|g]",
                self.memory_limit
            ));
        }

        if self.log_capacity == 0 {
            result.add_warning("log_capacity = 0 means failures carry no console output");
        }

        result
    }
}

impl Validate for ProbeConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.poll_interval_ms == 0 {
            result.add_error("poll_interval_ms must be positive");
        }

        if self.poll_interval() >= self.health_timeout() {
            result.add_error("poll_interval must be less than health_timeout");
        }

        if self.health_timeout() > Duration::from_secs(1800) {
            result.add_warning("health_timeout over 30 minutes may indicate a misconfiguration");
        }

        result
    }
}

impl Validate for ExecutorConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.command.is_empty() || self.command[0].trim().is_empty() {
            result.add_error("executor command cannot be empty");
        }

        if self.timeout_secs == 0 {
            result.add_error("executor timeout_secs must be positive");
        }

        if self.max_log_bytes < 256 {
            result.add_warning("max_log_bytes below 256 leaves little room for test output");
        }

        result
    }
}

impl Validate for Settings {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        result.merge(self.sandbox.validate());
        result.merge(self.probe.validate());
        result.merge(self.executor.validate());

        if self.llm.api_key.is_empty() {
            result.add_warning("ANTHROPIC_API_KEY is not set; analysis requests will fail");
        }

        if self.upload.max_size == 0 {
            result.add_error("max upload size must be positive");
        }
        if self.upload.max_unpacked_size == 0 || self.upload.max_entries == 0 {
            result.add_error("archive unpack limits must be positive");
        }

        result
    }
}
