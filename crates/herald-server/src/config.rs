use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use herald_cache::{DailyCutover, ProxyCachePolicy};
use herald_core::{NormalizerOptions, UnknownFilterPolicy};
use herald_sources::{PostgresSourceConfig, ReportClientConfig};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Endpoint catalog location
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    /// Redis backing for the full-dataset cache
    #[serde(default)]
    pub redis: RedisConfig,
    /// Full-dataset cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Reverse-proxy cache zones and purge directories
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Backend connections and timeouts
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.cache.ttl_secs == 0 {
            return Err("cache.ttl_secs must be > 0".into());
        }
        if self.cache.refresh_concurrency == 0 {
            return Err("cache.refresh_concurrency must be > 0".into());
        }
        if self.proxy.short_ttl_secs == 0 {
            return Err("proxy.short_ttl_secs must be > 0".into());
        }
        if self.proxy.short_zone.is_empty() || self.proxy.daily_zone.is_empty() {
            return Err("proxy zone names must not be empty".into());
        }
        DailyCutover::new(self.proxy.cutover_hour, &self.proxy.time_zone)
            .map_err(|e| format!("proxy: {e}"))?;

        // The request timeout wraps adapter calls and must not cut them short
        let request = self.sources.request_timeout_ms;
        let postgres = &self.sources.postgres;
        if postgres.is_configured() && request < postgres.query_timeout_ms {
            return Err(format!(
                "sources.request_timeout_ms ({request}) is shorter than \
                 sources.postgres.query_timeout_ms ({})",
                postgres.query_timeout_ms
            ));
        }
        let report = &self.sources.report;
        if report.is_configured() && request < report.timeout_ms {
            return Err(format!(
                "sources.request_timeout_ms ({request}) is shorter than \
                 sources.report.timeout_ms ({})",
                report.timeout_ms
            ));
        }
        if self.normalizer.identifier_width == Some(0) {
            return Err("normalizer.identifier_width must be > 0 when set".into());
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.sources.request_timeout_ms)
    }

    pub fn dataset_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    /// Proxy policy with the time zone resolved.
    pub fn proxy_policy(&self) -> Result<ProxyCachePolicy, String> {
        Ok(ProxyCachePolicy {
            short_zone: self.proxy.short_zone.clone(),
            short_ttl: Duration::from_secs(self.proxy.short_ttl_secs),
            daily_zone: self.proxy.daily_zone.clone(),
            cutover: DailyCutover::new(self.proxy.cutover_hour, &self.proxy.time_zone)?,
            key_prefix: self.proxy.key_prefix.clone(),
        })
    }

    pub fn normalizer_options(&self) -> NormalizerOptions {
        NormalizerOptions {
            identifier_width: self.normalizer.identifier_width,
            ..NormalizerOptions::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Path of the endpoint catalog (TOML)
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
    /// Reload the catalog when the file changes
    #[serde(default = "default_true")]
    pub watch: bool,
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("endpoints.toml")
}

fn default_true() -> bool {
    true
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
            watch: default_true(),
        }
    }
}

/// Redis configuration for the shared dataset cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (falls back to an in-process store without it)
    #[serde(default)]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Serve flagged endpoints from the full-dataset cache
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Dataset entry TTL in seconds
    #[serde(default = "default_dataset_ttl_secs")]
    pub ttl_secs: u64,

    /// Endpoints refreshed in parallel by refresh-all
    #[serde(default = "default_refresh_concurrency")]
    pub refresh_concurrency: usize,

    /// Interval of the daemon's refresh-all loop in seconds
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_dataset_ttl_secs() -> u64 {
    86_400 // 1 day
}

fn default_refresh_concurrency() -> usize {
    4
}

fn default_refresh_interval_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ttl_secs: default_dataset_ttl_secs(),
            refresh_concurrency: default_refresh_concurrency(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_short_zone")]
    pub short_zone: String,
    #[serde(default = "default_short_ttl_secs")]
    pub short_ttl_secs: u64,
    #[serde(default = "default_daily_zone")]
    pub daily_zone: String,
    /// Local hour at which daily-zone responses expire
    #[serde(default = "default_cutover_hour")]
    pub cutover_hour: u32,
    /// IANA time zone of the cutover hour
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Proxy cache directories scanned by purge
    #[serde(default)]
    pub cache_dirs: Vec<PathBuf>,
}

fn default_short_zone() -> String {
    herald_cache::proxy::DEFAULT_SHORT_ZONE.into()
}

fn default_short_ttl_secs() -> u64 {
    600
}

fn default_daily_zone() -> String {
    herald_cache::proxy::DEFAULT_DAILY_ZONE.into()
}

fn default_cutover_hour() -> u32 {
    7
}

fn default_time_zone() -> String {
    "Europe/Istanbul".into()
}

fn default_key_prefix() -> String {
    herald_cache::proxy::DEFAULT_KEY_PREFIX.into()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            short_zone: default_short_zone(),
            short_ttl_secs: default_short_ttl_secs(),
            daily_zone: default_daily_zone(),
            cutover_hour: default_cutover_hour(),
            time_zone: default_time_zone(),
            key_prefix: default_key_prefix(),
            cache_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Outer timeout applied to every source fetch
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Relational-B (PostgreSQL)
    #[serde(default)]
    pub postgres: PostgresSourceConfig,
    /// Analytics report REST API
    #[serde(default)]
    pub report: ReportClientConfig,
}

fn default_request_timeout_ms() -> u64 {
    330_000
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            postgres: PostgresSourceConfig::default(),
            report: ReportClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// `reject` or `match-nothing`
    #[serde(default)]
    pub unknown_keys: UnknownFilterPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Zero-pad numeric identifier codes to this width
    #[serde(default)]
    pub identifier_width: Option<usize>,
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
    use config::{Config, Environment, File, FileFormat};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "herald.toml";

    /// Loads settings from an optional TOML file overlaid with `HERALD__*` variables.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let file = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if file.exists() {
            builder = builder.add_source(File::from(file).format(FileFormat::Toml));
        } else if path.is_some() {
            return Err(format!("config file not found: {}", file.display()));
        }
        // e.g. HERALD__REDIS__URL=redis://cache:6379
        builder = builder.add_source(
            Environment::with_prefix("HERALD")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let merged: AppConfig = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    /// Parses settings from a TOML string, without environment overrides.
    pub fn load_config_str(content: &str) -> Result<AppConfig, String> {
        let merged: AppConfig = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .map_err(|e| format!("config build error: {e}"))?
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::loader::load_config_str;
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        let policy = config.proxy_policy().unwrap();
        assert_eq!(policy.short_zone, "shortcache");
        assert_eq!(policy.cutover.hour(), 7);
        assert_eq!(config.filters.unknown_keys, UnknownFilterPolicy::Reject);
    }

    #[test]
    fn test_parse_sections() {
        let config = load_config_str(
            r#"
[redis]
enabled = true
url = "redis://cache:6379"

[proxy]
time_zone = "Europe/Berlin"
cutover_hour = 6
cache_dirs = ["/var/cache/nginx/short", "/var/cache/nginx/daily"]

[filters]
unknown_keys = "match-nothing"

[normalizer]
identifier_width = 5
"#,
        )
        .unwrap();
        assert!(config.redis.enabled);
        assert_eq!(config.proxy.cache_dirs.len(), 2);
        assert_eq!(config.filters.unknown_keys, UnknownFilterPolicy::MatchNothing);
        assert_eq!(config.normalizer_options().identifier_width, Some(5));
    }

    #[test]
    fn test_rejects_short_request_timeout() {
        let mut config = AppConfig::default();
        config.sources.report.base_url = "https://reports.example.com/api".into();
        config.sources.report.timeout_ms = 300_000;
        config.sources.request_timeout_ms = 60_000;
        let err = config.validate().unwrap_err();
        assert!(err.contains("request_timeout_ms"));
    }

    #[test]
    fn test_rejects_unknown_time_zone() {
        let mut config = AppConfig::default();
        config.proxy.time_zone = "Europe/Atlantis".into();
        assert!(config.validate().unwrap_err().contains("time zone"));
    }
}
