use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use admissions_cache::{MemoizerConfig, RedisConfig};
use admissions_jobs::{QueueConfig, QueueOverrides};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Shared by the cache and the job queues
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: MemoizerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        if self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.cache.poll_interval_ms == 0 || self.cache.lock_ttl_secs == 0 {
            return Err("cache.lock_ttl_secs and cache.poll_interval_ms must be > 0".into());
        }
        if !self.webhook.path.starts_with('/') {
            return Err("webhook.path must start with '/'".into());
        }
        if self.webhook.provider.trim().is_empty() {
            return Err("webhook.provider must not be empty".into());
        }
        if self.rate_limit.enabled && (self.rate_limit.limit == 0 || self.rate_limit.window_ms == 0)
        {
            return Err("rate_limit.limit and rate_limit.window_ms must be > 0".into());
        }
        for queue in self.queues.resolve() {
            queue.validate().map_err(|e| e.to_string())?;
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    3000
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

/// Inbound webhook settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Sender name; the signature is read from `X-<provider>-Hmac-SHA256`
    #[serde(default = "default_webhook_provider")]
    pub provider: String,
    /// Shared HMAC secret. Without it every delivery is rejected.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_webhook_path")]
    pub path: String,
}

fn default_webhook_provider() -> String {
    "Thinkific".into()
}
fn default_webhook_path() -> String {
    "/api/webhooks/enrollment".into()
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            provider: default_webhook_provider(),
            secret: None,
            path: default_webhook_path(),
        }
    }
}

impl WebhookConfig {
    /// Lower-cased signature header name (header lookup is case-insensitive).
    pub fn signature_header(&self) -> String {
        format!("x-{}-hmac-sha256", self.provider.trim().to_ascii_lowercase())
    }
}

/// Per-queue overrides on top of the built-in presets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueuesConfig {
    #[serde(default)]
    pub export: QueueOverrides,
    #[serde(default)]
    pub notification_email: QueueOverrides,
    #[serde(default)]
    pub enrollment: QueueOverrides,
}

impl QueuesConfig {
    pub fn export(&self) -> QueueConfig {
        self.export.apply(QueueConfig::export())
    }

    pub fn notification_email(&self) -> QueueConfig {
        self.notification_email
            .apply(QueueConfig::notification_email())
    }

    pub fn enrollment(&self) -> QueueConfig {
        self.enrollment.apply(QueueConfig::enrollment())
    }

    pub fn resolve(&self) -> [QueueConfig; 3] {
        [self.export(), self.notification_email(), self.enrollment()]
    }
}

/// SMTP settings for notification email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Without a host, the notification email worker is not started
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default = "default_email_from")]
    pub from: String,
    #[serde(default = "default_company_name")]
    pub company_name: String,
}

fn default_smtp_port() -> u16 {
    587
}
fn default_email_from() -> String {
    "no-reply@localhost".into()
}
fn default_company_name() -> String {
    "TAFTA".into()
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            from: default_email_from(),
            company_name: default_company_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_dir")]
    pub output_dir: PathBuf,
    /// URL prefix the output directory is served under
    #[serde(default = "default_download_base")]
    pub download_base: String,
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("public/exports")
}
fn default_download_base() -> String {
    "/exports".into()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_export_dir(),
            download_base: default_download_base(),
        }
    }
}

/// Limits for the `/api` routes, per client address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_rate_limit")]
    pub limit: u32,
    #[serde(default = "default_rate_limit_window_ms")]
    pub window_ms: u64,
}

fn default_rate_limit_enabled() -> bool {
    true
}
fn default_rate_limit() -> u32 {
    100
}
fn default_rate_limit_window_ms() -> u64 {
    60_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            limit: default_rate_limit(),
            window_ms: default_rate_limit_window_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Load `path` (or `admissions.toml` when present) and apply environment
    /// overrides such as `ADMISSIONS__REDIS__URL`.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let file = PathBuf::from(path.unwrap_or("admissions.toml"));
        if file.exists() {
            builder = builder.add_source(File::from(file));
        } else if path.is_some() {
            return Err(format!("config file not found: {}", file.display()));
        }
        builder = builder.add_source(
            Environment::with_prefix("ADMISSIONS")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
