//! Endpoint configuration model.
//!
//! Endpoints are declared as `[endpoints.<name>]` tables. The raw TOML shape is
//! deserialized into [`RawEndpoint`] and then validated into an immutable
//! [`EndpointConfig`]; a relational behavior must carry a relational
//! descriptor and no report-only fields, and the other way around.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use herald_core::{FilterField, HeraldError};

/// Page size used when an endpoint does not declare one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// The only info type relational endpoints offer.
pub const SUMMARY_INFO_TYPE: &str = "summary";

/// Backend family serving an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Relational source A (SQL Server).
    RelationalA,
    /// Relational source B (PostgreSQL).
    RelationalB,
    /// Analytics report export.
    Report,
}

impl SourceKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RelationalA => "relational-a",
            Self::RelationalB => "relational-b",
            Self::Report => "report",
        }
    }

    #[must_use]
    pub fn is_relational(&self) -> bool {
        matches!(self, Self::RelationalA | Self::RelationalB)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache tier fronting an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Live,
    Cached,
}

impl CacheTier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Cached => "cached",
        }
    }
}

/// Source and cache tier of an endpoint, one of six combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Behavior {
    pub source: SourceKind,
    pub tier: CacheTier,
}

impl Behavior {
    #[must_use]
    pub const fn new(source: SourceKind, tier: CacheTier) -> Self {
        Self { source, tier }
    }

    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.tier == CacheTier::Cached
    }

    /// Every valid behavior, in a stable order.
    #[must_use]
    pub fn all() -> [Behavior; 6] {
        use CacheTier::*;
        use SourceKind::*;
        [
            Self::new(RelationalA, Live),
            Self::new(RelationalA, Cached),
            Self::new(RelationalB, Live),
            Self::new(RelationalB, Cached),
            Self::new(Report, Live),
            Self::new(Report, Cached),
        ]
    }
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source, self.tier.as_str())
    }
}

impl FromStr for Behavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use CacheTier::*;
        use SourceKind::*;
        let behavior = match s.trim().to_ascii_lowercase().as_str() {
            "relational-a-live" | "livesql" => Self::new(RelationalA, Live),
            "relational-a-cached" | "cachesql" => Self::new(RelationalA, Cached),
            "relational-b-live" | "livepg" => Self::new(RelationalB, Live),
            "relational-b-cached" | "cachepg" => Self::new(RelationalB, Cached),
            "report-live" | "livemstr" => Self::new(Report, Live),
            "report-cached" | "cachemstr" => Self::new(Report, Cached),
            other => return Err(format!("unknown behavior '{other}'")),
        };
        Ok(behavior)
    }
}

impl TryFrom<String> for Behavior {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Behavior> for String {
    fn from(value: Behavior) -> Self {
        value.to_string()
    }
}

/// Where an endpoint's data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceDescriptor {
    Relational {
        schema: String,
        table: String,
    },
    Report {
        report_id: String,
        /// Info type to visualization key.
        viz_keys: IndexMap<String, String>,
    },
}

/// Relational connection descriptor as written in the catalog.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRelational {
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
}

/// Report descriptor as written in the catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct RawReport {
    pub report_id: String,
    #[serde(default)]
    pub viz_keys: IndexMap<String, String>,
}

/// Endpoint table exactly as deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEndpoint {
    pub behavior: Behavior,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub full_dataset_cache: bool,
    #[serde(default)]
    pub relational: Option<RawRelational>,
    #[serde(default)]
    pub report: Option<RawReport>,
    #[serde(default)]
    pub filters: IndexMap<String, FilterField>,
}

/// Validated, immutable endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointConfig {
    pub name: String,
    pub behavior: Behavior,
    pub description: Option<String>,
    pub descriptor: SourceDescriptor,
    pub filters: IndexMap<String, FilterField>,
    pub page_size: usize,
    pub full_dataset_cache: bool,
}

impl EndpointConfig {
    /// Validates a raw catalog entry.
    pub fn from_raw(name: impl Into<String>, raw: RawEndpoint) -> Result<Self, HeraldError> {
        let name = name.into();
        let invalid = |msg: String| HeraldError::invalid_configuration(&name, msg);

        if !valid_name(&name) {
            return Err(invalid(format!("endpoint name '{name}' is not a valid identifier")));
        }

        let page_size = raw.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(invalid("page_size must be >= 1".into()));
        }

        let descriptor = match (raw.behavior.source.is_relational(), raw.relational, raw.report) {
            (true, Some(rel), None) => {
                let schema = rel.schema.unwrap_or_else(|| default_schema(raw.behavior.source));
                for ident in [&schema, &rel.table] {
                    if !valid_identifier(ident) {
                        return Err(invalid(format!("'{ident}' is not a valid SQL identifier")));
                    }
                }
                if let Some((key, _)) = raw.filters.iter().find(|(_, f)| f.report_filter.is_some())
                {
                    return Err(invalid(format!(
                        "filter '{key}' declares a report filter on a relational endpoint"
                    )));
                }
                SourceDescriptor::Relational {
                    schema,
                    table: rel.table,
                }
            }
            (false, None, Some(report)) => {
                if report.report_id.trim().is_empty() {
                    return Err(invalid("report_id must not be empty".into()));
                }
                if report.viz_keys.is_empty() {
                    return Err(invalid("report endpoints need at least one viz key".into()));
                }
                if let Some((key, _)) = raw.filters.iter().find(|(_, f)| f.report_filter.is_none())
                {
                    return Err(invalid(format!("filter '{key}' has no report filter id")));
                }
                SourceDescriptor::Report {
                    report_id: report.report_id,
                    viz_keys: report.viz_keys,
                }
            }
            (true, _, Some(_)) => {
                return Err(invalid(format!(
                    "behavior '{}' cannot carry a report descriptor",
                    raw.behavior
                )));
            }
            (false, Some(_), _) => {
                return Err(invalid(format!(
                    "behavior '{}' cannot carry a relational descriptor",
                    raw.behavior
                )));
            }
            (_, None, None) => {
                return Err(invalid(format!(
                    "behavior '{}' needs a source descriptor",
                    raw.behavior
                )));
            }
        };

        for (key, field) in &raw.filters {
            if let Some(column) = &field.column
                && raw.behavior.source.is_relational()
                && !valid_identifier(column)
            {
                return Err(invalid(format!(
                    "filter '{key}' maps to invalid column '{column}'"
                )));
            }
        }

        Ok(Self {
            name,
            behavior: raw.behavior,
            description: raw.description,
            descriptor,
            filters: raw.filters,
            page_size,
            full_dataset_cache: raw.full_dataset_cache,
        })
    }

    /// Info types this endpoint can serve.
    #[must_use]
    pub fn info_types(&self) -> Vec<&str> {
        match &self.descriptor {
            SourceDescriptor::Relational { .. } => vec![SUMMARY_INFO_TYPE],
            SourceDescriptor::Report { viz_keys, .. } => {
                viz_keys.keys().map(String::as_str).collect()
            }
        }
    }

    /// Fails with `UnsupportedInfoType` unless the endpoint offers `info_type`.
    pub fn check_info_type(&self, info_type: &str) -> Result<(), HeraldError> {
        if self.info_types().contains(&info_type) {
            Ok(())
        } else {
            Err(HeraldError::unsupported_info_type(&self.name, info_type))
        }
    }

    /// Visualization key for a report info type.
    #[must_use]
    pub fn viz_key(&self, info_type: &str) -> Option<&str> {
        match &self.descriptor {
            SourceDescriptor::Report { viz_keys, .. } => {
                viz_keys.get(info_type).map(String::as_str)
            }
            SourceDescriptor::Relational { .. } => None,
        }
    }

    /// Whether rows should be served from the full-dataset cache.
    #[must_use]
    pub fn uses_dataset_cache(&self) -> bool {
        self.full_dataset_cache
    }
}

fn default_schema(source: SourceKind) -> String {
    match source {
        SourceKind::RelationalA => "dbo".into(),
        _ => "public".into(),
    }
}

/// SQL identifiers: ASCII alphanumerics and underscores, not starting with a digit.
#[must_use]
pub fn valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && !value.starts_with(|c: char| c.is_ascii_digit())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn valid_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
