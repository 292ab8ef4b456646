//! Reverse-proxy cache coordination.
//!
//! The proxy sits in front of the service and stores responses on its own;
//! this module decides per response whether it may be stored, in which zone
//! and for how long, and removes stored responses on demand.
//!
//! Cached relational endpoints go to the short zone with a fixed TTL. Cached
//! report endpoints go to the daily zone and stay valid until the next
//! cutover (a fixed wall-clock hour in a named time zone), however recently
//! they were fetched. Live endpoints are never stored.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, info, warn};

use herald_config::{CacheTier, EndpointConfig, SourceKind};
use herald_core::FilterSet;

use crate::metrics;
use crate::store::CacheError;

pub const DEFAULT_KEY_PREFIX: &str = "/api/v3/report/";
pub const DEFAULT_SHORT_ZONE: &str = "shortcache";
pub const DEFAULT_DAILY_ZONE: &str = "dailycache";

/// Bytes of a cache file searched for its `KEY:` line.
const HEADER_SCAN_BYTES: usize = 2048;

/// Freshness that resets once per day at a fixed local hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyCutover {
    hour: u32,
    tz: Tz,
}

impl Default for DailyCutover {
    fn default() -> Self {
        Self {
            hour: 7,
            tz: chrono_tz::Europe::Istanbul,
        }
    }
}

impl DailyCutover {
    /// `hour` in 0..24, `time_zone` an IANA name such as `Europe/Istanbul`.
    pub fn new(hour: u32, time_zone: &str) -> Result<Self, String> {
        if hour > 23 {
            return Err(format!("cutover hour {hour} is out of range"));
        }
        let tz = time_zone
            .parse::<Tz>()
            .map_err(|e| format!("unknown time zone '{time_zone}': {e}"))?;
        Ok(Self { hour, tz })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn time_zone(&self) -> Tz {
        self.tz
    }

    /// Most recent cutover at or before `now`.
    #[must_use]
    pub fn last_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.with_timezone(&self.tz).date_naive();
        let cutover = self.on_date(today);
        if cutover <= now {
            return cutover;
        }
        today
            .pred_opt()
            .map(|d| self.on_date(d))
            .unwrap_or(cutover - chrono::Duration::days(1))
    }

    /// First cutover strictly after `now`.
    #[must_use]
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.with_timezone(&self.tz).date_naive();
        let cutover = self.on_date(today);
        if cutover > now {
            return cutover;
        }
        today
            .succ_opt()
            .map(|d| self.on_date(d))
            .unwrap_or(cutover + chrono::Duration::days(1))
    }

    /// True when `fetched_at` predates the most recent cutover.
    #[must_use]
    pub fn is_stale(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        fetched_at < self.last_before(now)
    }

    fn on_date(&self, date: NaiveDate) -> DateTime<Utc> {
        let Some(local) = date.and_hms_opt(self.hour, 0, 0) else {
            return date.and_time(chrono::NaiveTime::MIN).and_utc();
        };
        // a cutover inside a DST gap moves to the first valid instant after it
        self.tz
            .from_local_datetime(&local)
            .earliest()
            .or_else(|| {
                self.tz
                    .from_local_datetime(&(local + chrono::Duration::hours(1)))
                    .earliest()
            })
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| local.and_utc())
    }
}

impl std::fmt::Display for DailyCutover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:00 {}", self.hour, self.tz.name())
    }
}

/// How long a proxy may keep a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheValidity {
    NoStore,
    Fixed(Duration),
    DailyCutover(DailyCutover),
}

/// Per-response caching decision handed to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCacheDirective {
    /// Proxy cache zone, `None` for uncacheable responses.
    pub zone: Option<String>,
    pub validity: CacheValidity,
    pub cache_key: String,
    /// Seconds the response may be served from the proxy, computed at decision time.
    pub max_age_secs: Option<u64>,
}

impl ProxyCacheDirective {
    /// Response headers the proxy branches on.
    #[must_use]
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        let cache_control = match self.max_age_secs {
            Some(secs) if self.zone.is_some() => format!("public, max-age={secs}"),
            _ => "no-store".to_string(),
        };
        vec![
            ("Cache-Control", cache_control),
            ("X-Cache-Zone", self.zone.clone().unwrap_or_else(|| "none".into())),
            ("X-Cache-Key", self.cache_key.clone()),
        ]
    }

    /// Short policy label for response diagnostics.
    #[must_use]
    pub fn policy_label(&self) -> String {
        match self.validity {
            CacheValidity::NoStore => "no-store".into(),
            CacheValidity::Fixed(ttl) => format!("fixed {}s", ttl.as_secs()),
            CacheValidity::DailyCutover(cutover) => format!("daily until {cutover}"),
        }
    }

    /// Whether a response stored at `stored_at` may still be served at `now`.
    #[must_use]
    pub fn is_fresh(&self, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.validity {
            CacheValidity::NoStore => false,
            CacheValidity::Fixed(ttl) => (now - stored_at)
                .to_std()
                .is_ok_and(|elapsed| elapsed < ttl),
            CacheValidity::DailyCutover(cutover) => !cutover.is_stale(stored_at, now),
        }
    }
}

/// Zones and validity rules of the proxy tier.
#[derive(Debug, Clone)]
pub struct ProxyCachePolicy {
    pub short_zone: String,
    pub short_ttl: Duration,
    pub daily_zone: String,
    pub cutover: DailyCutover,
    /// Path prefix of report requests, the start of every proxy cache key.
    pub key_prefix: String,
}

impl Default for ProxyCachePolicy {
    fn default() -> Self {
        Self {
            short_zone: DEFAULT_SHORT_ZONE.into(),
            short_ttl: Duration::from_secs(600),
            daily_zone: DEFAULT_DAILY_ZONE.into(),
            cutover: DailyCutover::default(),
            key_prefix: DEFAULT_KEY_PREFIX.into(),
        }
    }
}

/// What a purge removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeScope {
    All,
    Endpoint(String),
}

impl std::fmt::Display for PurgeScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Endpoint(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub files_scanned: usize,
    pub files_removed: usize,
    pub bytes_removed: u64,
}

/// Management-plane access to the proxy's stored responses.
#[async_trait]
pub trait ProxyPurger: Send + Sync {
    /// Removes stored responses in `scope`. Purging nothing is a success.
    async fn purge(&self, scope: &PurgeScope) -> Result<PurgeReport, CacheError>;
}

/// Computes directives and forwards purges to a [`ProxyPurger`].
pub struct ProxyCacheCoordinator {
    policy: ProxyCachePolicy,
    purger: Arc<dyn ProxyPurger>,
}

impl ProxyCacheCoordinator {
    pub fn new(policy: ProxyCachePolicy, purger: Arc<dyn ProxyPurger>) -> Self {
        Self { policy, purger }
    }

    pub fn policy(&self) -> &ProxyCachePolicy {
        &self.policy
    }

    /// Deterministic cache key of a request: parameters sorted by name.
    #[must_use]
    pub fn request_key(
        &self,
        endpoint: &str,
        info_type: &str,
        filters: &FilterSet,
        page: usize,
        page_size: usize,
    ) -> String {
        let page = page.to_string();
        let page_size = page_size.to_string();
        let mut params: Vec<(&str, &str)> = filters.iter().collect();
        params.extend([
            ("info_type", info_type),
            ("page", page.as_str()),
            ("page_size", page_size.as_str()),
        ]);
        params.sort_unstable();

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}{endpoint}?{query}", self.policy.key_prefix)
    }

    /// Directive for one response of `endpoint`.
    #[must_use]
    pub fn directive_for(
        &self,
        endpoint: &EndpointConfig,
        request_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> ProxyCacheDirective {
        let cache_key = request_key.into();
        match (endpoint.behavior.tier, endpoint.behavior.source) {
            (CacheTier::Live, _) => ProxyCacheDirective {
                zone: None,
                validity: CacheValidity::NoStore,
                cache_key,
                max_age_secs: None,
            },
            (CacheTier::Cached, SourceKind::Report) => {
                let cutover = self.policy.cutover;
                let max_age = (cutover.next_after(now) - now).num_seconds().max(0);
                ProxyCacheDirective {
                    zone: Some(self.policy.daily_zone.clone()),
                    validity: CacheValidity::DailyCutover(cutover),
                    cache_key,
                    max_age_secs: u64::try_from(max_age).ok(),
                }
            }
            (CacheTier::Cached, _) => ProxyCacheDirective {
                zone: Some(self.policy.short_zone.clone()),
                validity: CacheValidity::Fixed(self.policy.short_ttl),
                cache_key,
                max_age_secs: Some(self.policy.short_ttl.as_secs()),
            },
        }
    }

    /// Removes stored proxy responses. Idempotent.
    pub async fn purge(&self, scope: &PurgeScope) -> Result<PurgeReport, CacheError> {
        let report = self.purger.purge(scope).await?;
        metrics::record_purge(report.files_removed);
        info!(
            scope = %scope,
            files = report.files_removed,
            bytes = report.bytes_removed,
            "Proxy cache purged"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for ProxyCacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCacheCoordinator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Purges an nginx-style file cache.
///
/// Every cache file carries its key on a `KEY: ` line near the start. An
/// endpoint purge removes the files whose key is the endpoint's path, or that
/// path followed by `?` or `/`.
#[derive(Debug, Clone)]
pub struct NginxFsPurger {
    directories: Vec<PathBuf>,
    key_prefix: String,
}

impl NginxFsPurger {
    pub fn new(directories: Vec<PathBuf>, key_prefix: impl Into<String>) -> Self {
        Self {
            directories,
            key_prefix: key_prefix.into(),
        }
    }

    fn purge_blocking(&self, scope: &PurgeScope) -> PurgeReport {
        let endpoint_path = match scope {
            PurgeScope::All => None,
            PurgeScope::Endpoint(name) => Some(format!("{}{name}", self.key_prefix)),
        };

        let mut report = PurgeReport::default();
        for dir in &self.directories {
            if !dir.is_dir() {
                debug!(dir = %dir.display(), "Proxy cache directory missing, nothing to purge");
                continue;
            }
            let mut files = Vec::new();
            collect_files(dir, &mut files);
            for file in files {
                report.files_scanned += 1;
                let matches = match &endpoint_path {
                    None => true,
                    Some(path) => {
                        read_cache_key(&file).is_some_and(|key| key_belongs_to(&key, path))
                    }
                };
                if !matches {
                    continue;
                }
                let size = fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
                match fs::remove_file(&file) {
                    Ok(()) => {
                        report.files_removed += 1;
                        report.bytes_removed += size;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(file = %file.display(), error = %e, "Failed to remove cache file");
                    }
                }
            }
        }
        report
    }
}

#[async_trait]
impl ProxyPurger for NginxFsPurger {
    async fn purge(&self, scope: &PurgeScope) -> Result<PurgeReport, CacheError> {
        let purger = self.clone();
        let scope = scope.clone();
        tokio::task::spawn_blocking(move || purger.purge_blocking(&scope))
            .await
            .map_err(|e| CacheError::Unavailable(format!("purge task failed: {e}")))
    }
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to read cache directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => collect_files(&path, files),
            Ok(t) if t.is_file() => files.push(path),
            _ => {}
        }
    }
}

fn read_cache_key(file: &Path) -> Option<String> {
    let mut header = Vec::with_capacity(HEADER_SCAN_BYTES);
    fs::File::open(file)
        .ok()?
        .take(HEADER_SCAN_BYTES as u64)
        .read_to_end(&mut header)
        .ok()?;

    let marker = b"KEY: ";
    let start = header.windows(marker.len()).position(|w| w == marker)? + marker.len();
    let end = header[start..]
        .iter()
        .position(|b| *b == b'\n' || *b == b'\r')
        .map_or(header.len(), |p| start + p);
    Some(String::from_utf8_lossy(&header[start..end]).into_owned())
}

fn key_belongs_to(key: &str, endpoint_path: &str) -> bool {
    key.strip_prefix(endpoint_path)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('?') || rest.starts_with('/'))
}
