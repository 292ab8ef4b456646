//! Endpoint policy resolution over a hot-swappable catalog snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{debug, info};

use herald_core::HeraldError;

use crate::endpoint::{EndpointConfig, RawEndpoint};
use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    endpoints: IndexMap<String, RawEndpoint>,
}

/// Immutable set of validated endpoints.
#[derive(Debug, Clone, Default)]
pub struct EndpointCatalog {
    endpoints: IndexMap<String, Arc<EndpointConfig>>,
}

impl EndpointCatalog {
    /// Parses and validates a TOML catalog. Any invalid endpoint fails the whole catalog.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawCatalog = toml::from_str(content)?;
        let mut endpoints = IndexMap::with_capacity(raw.endpoints.len());
        for (name, raw_endpoint) in raw.endpoints {
            let config = EndpointConfig::from_raw(name.clone(), raw_endpoint)?;
            endpoints.insert(name, Arc::new(config));
        }
        Ok(Self { endpoints })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Builds a catalog from already validated endpoints.
    #[must_use]
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = EndpointConfig>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| (e.name.clone(), Arc::new(e)))
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<EndpointConfig>> {
        self.endpoints.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EndpointConfig>> {
        self.endpoints.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Resolves endpoint names to their configuration.
///
/// Holds the catalog behind an `ArcSwap`: readers get a consistent snapshot
/// per request and a reload never blocks them.
pub struct EndpointRegistry {
    inner: ArcSwap<EndpointCatalog>,
    path: Option<PathBuf>,
}

impl EndpointRegistry {
    pub fn new(catalog: EndpointCatalog) -> Self {
        Self {
            inner: ArcSwap::from_pointee(catalog),
            path: None,
        }
    }

    /// Loads the catalog from `path` and remembers the path for reloads.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let catalog = EndpointCatalog::from_file(&path)?;
        info!(path = %path.display(), endpoints = catalog.len(), "Loaded endpoint catalog");
        Ok(Self {
            inner: ArcSwap::from_pointee(catalog),
            path: Some(path),
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current catalog snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<EndpointCatalog> {
        self.inner.load_full()
    }

    /// Returns the configuration of `name` or `EndpointNotFound`.
    pub fn resolve(&self, name: &str) -> Result<Arc<EndpointConfig>, HeraldError> {
        self.inner
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| HeraldError::endpoint_not_found(name))
    }

    /// All configured endpoints in catalog order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<EndpointConfig>> {
        self.inner.load().iter().cloned().collect()
    }

    /// Atomically replaces the catalog.
    pub fn replace(&self, catalog: EndpointCatalog) {
        debug!(endpoints = catalog.len(), "Swapping endpoint catalog");
        self.inner.store(Arc::new(catalog));
    }

    /// Re-reads the catalog file. On error the current snapshot stays in place.
    pub fn reload(&self) -> Result<usize, ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoPath)?;
        let catalog = EndpointCatalog::from_file(path)?;
        let count = catalog.len();
        self.replace(catalog);
        info!(path = %path.display(), endpoints = count, "Reloaded endpoint catalog");
        Ok(count)
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("path", &self.path)
            .field("endpoints", &self.inner.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
[endpoints.inventory]
behavior = "relational-b-cached"
page_size = 50
full_dataset_cache = true

[endpoints.inventory.relational]
table = "inventory"

[endpoints.inventory.filters.region]
column = "region"

[endpoints.sales]
behavior = "report-cached"

[endpoints.sales.report]
report_id = "D0C5"
viz_keys = { summary = "K52" }
"#;

    #[test]
    fn test_resolve() {
        let registry = EndpointRegistry::new(EndpointCatalog::from_toml_str(CATALOG).unwrap());
        let inventory = registry.resolve("inventory").unwrap();
        assert_eq!(inventory.page_size, 50);
        assert!(matches!(
            registry.resolve("missing"),
            Err(HeraldError::EndpointNotFound { .. })
        ));
        let names: Vec<_> = registry.all().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["inventory", "sales"]);
    }

    #[test]
    fn test_invalid_endpoint_fails_catalog() {
        let err = EndpointCatalog::from_toml_str(
            r#"
[endpoints.broken]
behavior = "livepg"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Endpoint(_)));
    }

    #[test]
    fn test_reload_keeps_snapshot_on_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("endpoints.toml");
        std::fs::write(&path, CATALOG).unwrap();

        let registry = EndpointRegistry::from_path(&path).unwrap();
        let before = registry.snapshot();
        assert_eq!(before.len(), 2);

        std::fs::write(&path, "[endpoints.bad]\nbehavior = 1").unwrap();
        assert!(registry.reload().is_err());
        assert_eq!(registry.snapshot().len(), 2);

        std::fs::write(
            &path,
            "[endpoints.only]\nbehavior = \"livesql\"\n\
             [endpoints.only.relational]\ntable = \"t\"\n",
        )
        .unwrap();
        assert_eq!(registry.reload().unwrap(), 1);
        assert!(registry.resolve("inventory").is_err());
        // a snapshot taken earlier is unaffected by the swap
        assert!(before.get("inventory").is_some());
    }
}
