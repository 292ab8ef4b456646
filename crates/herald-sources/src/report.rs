//! Analytics report source.
//!
//! Reports are exported one visualization at a time as CSV. Filters travel as
//! a view filter: equality becomes `Equals`, lists become `In` (element ids
//! are the value prefixed with `h`), and a lower/upper bound pair on the same
//! report filter becomes a `Between` on dates. Anything else cannot be
//! expressed by the report API and is rejected as a query error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use url::Url;

use herald_config::{SourceDescriptor, SourceKind};
use herald_core::{CellValue, FilterOp, HeraldError, Predicate, RawTable};

use crate::{FetchOutcome, FetchRequest, SourceAdapter};

const SOURCE_ID: &str = "report";

/// One visualization export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub report_id: String,
    pub viz_key: String,
    pub view_filter: Option<Value>,
}

/// A visualization of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualizationInfo {
    pub key: String,
    pub name: String,
}

/// A filter declared by a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFilterInfo {
    pub key: String,
    pub name: String,
    /// Snake-case request parameter suggested for this filter.
    pub suggested_param: String,
}

/// Result of report introspection, used by configuration tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDescription {
    pub report_id: String,
    pub visualizations: Vec<VisualizationInfo>,
    pub filters: Vec<ReportFilterInfo>,
    /// `summary` and `detail` mapped to the first two visualizations.
    pub suggested_viz_keys: IndexMap<String, String>,
}

/// Client for the report API.
#[async_trait]
pub trait ReportClient: Send + Sync {
    /// Exports a visualization and returns the raw CSV bytes.
    async fn export(&self, request: &ExportRequest) -> Result<Vec<u8>, HeraldError>;

    /// Lists visualizations and filters of a report.
    async fn describe(&self, report_id: &str) -> Result<ReportDescription, HeraldError>;
}

/// Settings of [`HttpReportClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportClientConfig {
    /// REST API root, e.g. `https://reports.example.com/api`.
    pub base_url: String,
    pub project_id: String,
    /// Session token obtained outside this process.
    pub auth_token: String,
    pub timeout_ms: u64,
}

impl Default for ReportClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            project_id: String::new(),
            auth_token: String::new(),
            timeout_ms: 300_000,
        }
    }
}

impl ReportClientConfig {
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty()
    }
}

/// [`ReportClient`] over the report server's REST API.
pub struct HttpReportClient {
    http_client: Client,
    base_url: String,
    config: ReportClientConfig,
}

#[derive(Deserialize)]
struct InstanceResponse {
    mid: String,
}

impl HttpReportClient {
    pub fn new(config: ReportClientConfig) -> Result<Self, HeraldError> {
        Url::parse(&config.base_url).map_err(|e| {
            HeraldError::source_unavailable(SOURCE_ID, format!("invalid base url: {e}"))
        })?;
        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| {
                HeraldError::source_unavailable(
                    SOURCE_ID,
                    format!("failed to create HTTP client: {e}"),
                )
            })?;
        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, format!("{}{path}", self.base_url))
            .header("X-MSTR-AuthToken", &self.config.auth_token)
            .header("X-MSTR-ProjectID", &self.config.project_id)
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, HeraldError> {
        let response = builder
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, &body))
    }

    fn map_transport_error(&self, err: reqwest::Error) -> HeraldError {
        if err.is_timeout() {
            HeraldError::source_timeout(SOURCE_ID, self.config.timeout_ms)
        } else {
            HeraldError::source_unavailable(SOURCE_ID, err.to_string())
        }
    }
}

#[async_trait]
impl ReportClient for HttpReportClient {
    #[instrument(skip(self, request), fields(report = %request.report_id, viz = %request.viz_key))]
    async fn export(&self, request: &ExportRequest) -> Result<Vec<u8>, HeraldError> {
        let mut body = json!({});
        if let Some(filter) = &request.view_filter {
            body["viewFilter"] = filter.clone();
        }
        let instance: InstanceResponse = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/dossiers/{}/instances", request.report_id),
                )
                .json(&body),
            )
            .await?
            .json()
            .await
            .map_err(|e| {
                HeraldError::source_query(SOURCE_ID, format!("bad instance response: {e}"))
            })?;
        debug!(instance = %instance.mid, "Created report instance");

        let bytes = self
            .send(self.request(
                reqwest::Method::POST,
                &format!(
                    "/documents/{}/instances/{}/visualizations/{}/csv",
                    request.report_id, instance.mid, request.viz_key
                ),
            ))
            .await?
            .bytes()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        Ok(bytes.to_vec())
    }

    async fn describe(&self, report_id: &str) -> Result<ReportDescription, HeraldError> {
        let definition: Value = self
            .send(self.request(
                reqwest::Method::GET,
                &format!("/dossiers/{report_id}/definition"),
            ))
            .await?
            .json()
            .await
            .map_err(|e| HeraldError::source_query(SOURCE_ID, format!("bad definition: {e}")))?;
        Ok(parse_definition(report_id, &definition))
    }
}

fn map_status(status: StatusCode, body: &str) -> HeraldError {
    let excerpt: String = body.chars().take(200).collect();
    let message = format!("HTTP {}: {excerpt}", status.as_u16());
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || status.is_server_error()
    {
        HeraldError::source_unavailable(SOURCE_ID, message)
    } else {
        HeraldError::source_query(SOURCE_ID, message)
    }
}

fn parse_definition(report_id: &str, definition: &Value) -> ReportDescription {
    let root = definition.get("definition").unwrap_or(definition);
    let chapters = root
        .get("chapters")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let text = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);

    let visualizations: Vec<VisualizationInfo> = chapters
        .iter()
        .flat_map(|c| c.get("pages").and_then(Value::as_array).into_iter().flatten())
        .flat_map(|p| {
            p.get("visualizations")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
        })
        .filter_map(|v| {
            Some(VisualizationInfo {
                key: text(v, "key")?,
                name: text(v, "name").unwrap_or_default(),
            })
        })
        .collect();

    let filters = chapters
        .iter()
        .flat_map(|c| c.get("filters").and_then(Value::as_array).into_iter().flatten())
        .filter_map(|f| {
            let name = text(f, "name").unwrap_or_default();
            Some(ReportFilterInfo {
                key: text(f, "key")?,
                suggested_param: suggest_param_name(&name),
                name,
            })
        })
        .collect();

    let suggested_viz_keys = ["summary", "detail"]
        .into_iter()
        .zip(visualizations.iter())
        .map(|(info_type, viz)| (info_type.to_string(), viz.key.clone()))
        .collect();

    ReportDescription {
        report_id: report_id.to_string(),
        visualizations,
        filters,
        suggested_viz_keys,
    }
}

fn suggest_param_name(display_name: &str) -> String {
    display_name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Adapter for report endpoints.
pub struct ReportAdapter {
    client: Arc<dyn ReportClient>,
    timeout: Duration,
}

impl ReportAdapter {
    pub fn new(client: Arc<dyn ReportClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Lists visualizations and filters of a report.
    pub async fn describe(&self, report_id: &str) -> Result<ReportDescription, HeraldError> {
        self.client.describe(report_id).await
    }
}

#[async_trait]
impl SourceAdapter for ReportAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Report
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(
        skip(self, request),
        fields(endpoint = %request.endpoint.name, info_type = %request.info_type)
    )]
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, HeraldError> {
        let endpoint = &request.endpoint;
        let SourceDescriptor::Report { report_id, viz_keys } = &endpoint.descriptor else {
            return Err(HeraldError::source_query(
                SOURCE_ID,
                format!("endpoint '{}' has no report descriptor", endpoint.name),
            ));
        };
        let viz_key = viz_keys
            .get(&request.info_type)
            .ok_or_else(|| HeraldError::unsupported_info_type(&endpoint.name, &request.info_type))?;

        let view_filter = if request.want_full {
            None
        } else {
            build_view_filter(&request.predicates.predicates)?
        };

        let started = Instant::now();
        let bytes = self
            .client
            .export(&ExportRequest {
                report_id: report_id.clone(),
                viz_key: viz_key.clone(),
                view_filter,
            })
            .await?;
        let table = decode_csv(&bytes)?;
        debug!(rows = table.len(), bytes = bytes.len(), "Decoded report export");

        Ok(FetchOutcome {
            table,
            duration: started.elapsed(),
        })
    }
}

/// Translates predicates into the report API's view filter.
pub fn build_view_filter(predicates: &[Predicate]) -> Result<Option<Value>, HeraldError> {
    let mut groups: IndexMap<&str, Vec<&Predicate>> = IndexMap::new();
    for predicate in predicates {
        let filter_id = predicate.report_filter.as_deref().ok_or_else(|| {
            HeraldError::source_query(
                SOURCE_ID,
                format!("filter '{}' has no report filter id", predicate.key),
            )
        })?;
        groups.entry(filter_id).or_default().push(predicate);
    }

    let mut operands = Vec::new();
    for (filter_id, mut group) in groups {
        let lower = group.iter().position(|p| p.op == FilterOp::Gte);
        let upper = group.iter().position(|p| p.op == FilterOp::Lte);
        if let (Some(lo), Some(hi)) = (lower, upper) {
            operands.push(json!({
                "operator": "Between",
                "operands": [
                    {"type": "filter", "id": filter_id},
                    {
                        "type": "constants",
                        "dataType": "Date",
                        "values": [group[lo].value, group[hi].value]
                    }
                ]
            }));
            let (first, second) = if lo > hi { (lo, hi) } else { (hi, lo) };
            group.remove(first);
            group.remove(second);
        }

        for predicate in group {
            let (operator, values) = match predicate.op {
                FilterOp::Eq => ("Equals", vec![predicate.value.as_str()]),
                FilterOp::In => ("In", predicate.values()),
                other => {
                    return Err(HeraldError::source_query(
                        SOURCE_ID,
                        format!(
                            "operator '{other}' on '{}' is not supported by report filters",
                            predicate.key
                        ),
                    ));
                }
            };
            let elements: Vec<Value> = values
                .into_iter()
                .map(|v| json!({"id": format!("h{v}")}))
                .collect();
            operands.push(json!({
                "operator": operator,
                "operands": [
                    {"type": "filter", "id": filter_id},
                    {"type": "elements", "elements": elements}
                ]
            }));
        }
    }

    Ok((!operands.is_empty()).then(|| json!({ "operands": operands })))
}

/// Decodes a CSV export (UTF-16 with BOM, or UTF-8) into a raw table.
pub fn decode_csv(bytes: &[u8]) -> Result<RawTable, HeraldError> {
    let text = decode_text(bytes)?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| HeraldError::normalization(format!("invalid CSV header: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| HeraldError::normalization(format!("invalid CSV record: {e}")))?;
        rows.push(record.iter().map(CellValue::infer).collect());
    }
    Ok(RawTable::new(columns, rows))
}

fn decode_text(bytes: &[u8]) -> Result<String, HeraldError> {
    let utf16 = |body: &[u8], little_endian: bool| -> Result<String, HeraldError> {
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| {
                if little_endian {
                    u16::from_le_bytes([pair[0], pair[1]])
                } else {
                    u16::from_be_bytes([pair[0], pair[1]])
                }
            })
            .collect();
        String::from_utf16(&units)
            .map_err(|e| HeraldError::normalization(format!("invalid UTF-16 export: {e}")))
    };

    match bytes {
        [0xFF, 0xFE, rest @ ..] => utf16(rest, true),
        [0xFE, 0xFF, rest @ ..] => utf16(rest, false),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8(rest.to_vec())
            .map_err(|e| HeraldError::normalization(format!("invalid UTF-8 export: {e}"))),
        _ => match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(_) if bytes.len() % 2 == 0 => {
                warn!("Report export has no BOM and is not UTF-8, assuming UTF-16LE");
                utf16(bytes, true)
            }
            Err(e) => Err(HeraldError::normalization(format!("undecodable export: {e}"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn utf16_with_bom(text: &str) -> Vec<u8> {
        let mut out = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }

    fn predicate(key: &str, op: FilterOp, value: &str) -> Predicate {
        Predicate {
            key: key.into(),
            column: None,
            report_filter: Some(format!("F_{key}")),
            op,
            value: value.into(),
        }
    }

    #[test]
    fn test_view_filter_equals_and_in() {
        let filter = build_view_filter(&[
            predicate("agency", FilterOp::Eq, "1042"),
            predicate("region", FilterOp::In, "EMEA, APAC"),
        ])
        .unwrap()
        .unwrap();
        assert_eq!(filter["operands"][0]["operator"], "Equals");
        assert_eq!(
            filter["operands"][0]["operands"][1]["elements"][0]["id"],
            "h1042"
        );
        assert_eq!(filter["operands"][1]["operator"], "In");
        assert_eq!(
            filter["operands"][1]["operands"][1]["elements"][1]["id"],
            "hAPAC"
        );
    }

    #[test]
    fn test_view_filter_date_range() {
        let filter = build_view_filter(&[
            predicate("date", FilterOp::Lte, "2024-03-31"),
            predicate("date", FilterOp::Gte, "2024-03-01"),
        ])
        .unwrap()
        .unwrap();
        let operands = filter["operands"].as_array().unwrap();
        assert_eq!(operands.len(), 1);
        assert_eq!(operands[0]["operator"], "Between");
        assert_eq!(
            operands[0]["operands"][1]["values"],
            json!(["2024-03-01", "2024-03-31"])
        );
    }

    #[test]
    fn test_view_filter_rejects_unsupported_operators() {
        let err = build_view_filter(&[predicate("date", FilterOp::Gte, "2024-03-01")]).unwrap_err();
        assert!(matches!(err, HeraldError::SourceQueryError { .. }));
        let err = build_view_filter(&[predicate("name", FilterOp::Contains, "x")]).unwrap_err();
        assert!(err.to_string().contains("contains"));
    }

    #[test]
    fn test_no_predicates_no_filter() {
        assert_eq!(build_view_filter(&[]).unwrap(), None);
    }

    #[test]
    fn test_decode_utf16_csv() {
        let table = decode_csv(&utf16_with_bom("Region,Şube,Amount\nEMEA,İzmir,12\nAPAC,,3.5\n"))
            .unwrap();
        assert_eq!(table.columns, vec!["Region", "Şube", "Amount"]);
        assert_eq!(table.rows[0][1], CellValue::from("İzmir"));
        assert_eq!(table.rows[0][2], CellValue::Integer(12));
        assert_eq!(table.rows[1][1], CellValue::Null);
        assert_eq!(table.rows[1][2], CellValue::Float(3.5));
    }

    #[test]
    fn test_decode_utf8_csv() {
        let table = decode_csv(b"\xEF\xBB\xBFa,b\n1,x\n").unwrap();
        assert_eq!(table.columns, vec!["a", "b"]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_parse_definition() {
        let definition = json!({
            "definition": {
                "chapters": [{
                    "filters": [{"key": "F1", "name": "Agency Code"}],
                    "pages": [{
                        "visualizations": [
                            {"key": "K52", "name": "Summary grid"},
                            {"key": "K60", "name": "Detail grid"}
                        ]
                    }]
                }]
            }
        });
        let description = parse_definition("D1", &definition);
        assert_eq!(description.visualizations.len(), 2);
        assert_eq!(description.filters[0].suggested_param, "agency_code");
        assert_eq!(description.suggested_viz_keys["summary"], "K52");
        assert_eq!(description.suggested_viz_keys["detail"], "K60");
    }

    fn client(server: &MockServer) -> HttpReportClient {
        HttpReportClient::new(ReportClientConfig {
            base_url: format!("{}/api", server.uri()),
            project_id: "P1".into(),
            auth_token: "token".into(),
            timeout_ms: 5_000,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_http_export_flow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/dossiers/D1/instances"))
            .and(header("X-MSTR-AuthToken", "token"))
            .and(body_json(json!({"viewFilter": {"operands": []}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"mid": "M9"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/documents/D1/instances/M9/visualizations/K52/csv"))
            .and(header("X-MSTR-ProjectID", "P1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(utf16_with_bom("a\n1\n")))
            .expect(1)
            .mount(&server)
            .await;

        let bytes = client(&server)
            .export(&ExportRequest {
                report_id: "D1".into(),
                viz_key: "K52".into(),
                view_filter: Some(json!({"operands": []})),
            })
            .await
            .unwrap();
        assert_eq!(decode_csv(&bytes).unwrap().rows[0][0], CellValue::Integer(1));
    }

    #[tokio::test]
    async fn test_http_error_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/dossiers/AUTH/instances"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/dossiers/BAD/instances"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad filter"))
            .mount(&server)
            .await;

        let client = client(&server);
        let export = |id: &str| ExportRequest {
            report_id: id.into(),
            viz_key: "K1".into(),
            view_filter: None,
        };
        assert!(matches!(
            client.export(&export("AUTH")).await,
            Err(HeraldError::SourceUnavailable { .. })
        ));
        let err = client.export(&export("BAD")).await.unwrap_err();
        assert!(matches!(err, HeraldError::SourceQueryError { .. }));
        assert!(err.to_string().contains("bad filter"));
    }

    #[tokio::test]
    async fn test_http_timeout_is_source_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/dossiers/SLOW/definition"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;
        let client = HttpReportClient::new(ReportClientConfig {
            base_url: format!("{}/api", server.uri()),
            timeout_ms: 50,
            ..Default::default()
        })
        .unwrap();
        let err = client.describe("SLOW").await.unwrap_err();
        assert!(err.is_timeout());
    }
}
