//! Source fetchers (ArcGIS, XLSX, Socrata, CKAN) and the canonical field normalizer.

use std::io::Cursor;

use async_trait::async_trait;
use calamine::{Data, Reader, Xlsx};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use permit_core::{PermitRecord, RawRecord, Trade};
use permit_storage::{get_json, FetchError, HttpTransport, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "permit-adapters";

pub const ARCGIS_PAGE_SIZE: usize = 2000;
/// Highest `resultOffset` ever requested from an ArcGIS layer.
pub const ARCGIS_MAX_OFFSET: usize = 100_000;
pub const DEFAULT_SOCRATA_LIMIT: usize = 5000;
pub const DEFAULT_CKAN_LIMIT: usize = 5000;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{context}: {source}")]
    Fetch {
        context: String,
        #[source]
        source: FetchError,
    },
    #[error("ArcGIS count query returned 0 permits; re-run manually: {query_url}")]
    ZeroCount { query_url: String },
    #[error("unexpected response from {url}: {message}")]
    Contract { url: String, message: String },
    #[error("spreadsheet {url} could not be read: {message}")]
    Spreadsheet { url: String, message: String },
    #[error("invalid source url {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

impl AdapterError {
    fn fetch(context: impl Into<String>, source: FetchError) -> Self {
        AdapterError::Fetch {
            context: context.into(),
            source,
        }
    }

    fn contract(url: impl ToString, message: impl Into<String>) -> Self {
        AdapterError::Contract {
            url: url.to_string(),
            message: message.into(),
        }
    }

    /// Upstream reported no rows at all for the window.
    pub fn is_empty_result(&self) -> bool {
        matches!(self, AdapterError::ZeroCount { .. })
    }
}

/// Inclusive lower bound and reference "now" for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub since: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl FetchWindow {
    pub fn lookback(now: DateTime<Utc>, lookback: Duration) -> Self {
        Self {
            since: now - lookback,
            now,
        }
    }
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn kind(&self) -> &'static str;

    /// URL shown in logs and run reports.
    fn endpoint(&self) -> &str;

    async fn fetch(&self, http: &dyn HttpTransport, window: &FetchWindow) -> Result<Vec<RawRecord>, AdapterError>;
}

fn parse_url(raw: &str, params: &[(&str, String)]) -> Result<Url, AdapterError> {
    let parsed = if params.is_empty() {
        Url::parse(raw)
    } else {
        Url::parse_with_params(raw, params)
    };
    parsed.map_err(|e| AdapterError::InvalidUrl {
        url: raw.to_string(),
        message: e.to_string(),
    })
}

/// Lowercase alphanumerics only, so `Permit No`, `permit_no` and `PERMITNO` compare equal.
pub fn normalize_key(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn aliases(list: &[&str]) -> Vec<String> {
    list.iter().map(|a| normalize_key(a)).collect()
}

/// Ordered alias lists per canonical field; earlier aliases win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAliases {
    pub permit_id: Vec<String>,
    pub issue_date: Vec<String>,
    pub description: Vec<String>,
    pub address: Vec<String>,
    pub zipcode: Vec<String>,
    pub valuation: Vec<String>,
    pub contractor: Vec<String>,
    pub applicant: Vec<String>,
}

impl Default for FieldAliases {
    fn default() -> Self {
        Self {
            permit_id: aliases(&[
                "permit_number",
                "permitnum",
                "permit_no",
                "permit_id",
                "permit",
                "case_number",
                "record_id",
                "event_id",
            ]),
            issue_date: aliases(&[
                "issue_date",
                "issued_date",
                "date_issued",
                "issuedate_dt",
                "permit_issue_date",
                "issued",
                "issued_on",
            ]),
            description: aliases(&[
                "work_description",
                "description",
                "work_type",
                "permit_type",
                "permit_type_desc",
                "project_description",
                "work_class",
                "comments",
            ]),
            address: aliases(&[
                "address",
                "site_address",
                "project_address",
                "original_address1",
                "street_address",
                "full_address",
                "permit_address",
                "location",
            ]),
            zipcode: aliases(&["zipcode", "zip", "zip5", "original_zip", "postal_code", "site_zip"]),
            valuation: aliases(&[
                "valuation",
                "total_valuation",
                "total_job_valuation",
                "job_value",
                "declared_valuation",
                "estimated_cost",
                "project_value",
                "construction_value",
                "value",
            ]),
            contractor: aliases(&[
                "contractor",
                "contractor_name",
                "contractor_company_name",
                "contractor_trade_name",
                "business_name",
                "company_name",
            ]),
            applicant: aliases(&["applicant", "applicant_name", "applicant_org", "owner", "owner_name"]),
        }
    }
}

/// Per-source alias additions, taken from the source registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldAliasOverrides {
    #[serde(default)]
    pub permit_id: Vec<String>,
    #[serde(default)]
    pub issue_date: Vec<String>,
    #[serde(default)]
    pub description: Vec<String>,
    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default)]
    pub zipcode: Vec<String>,
    #[serde(default)]
    pub valuation: Vec<String>,
    #[serde(default)]
    pub contractor: Vec<String>,
    #[serde(default)]
    pub applicant: Vec<String>,
}

fn prepend(base: &mut Vec<String>, extra: &[String]) {
    if extra.is_empty() {
        return;
    }
    let mut merged = extra.iter().map(|a| normalize_key(a)).collect::<Vec<_>>();
    merged.extend(base.drain(..).filter(|a| !extra.iter().any(|e| normalize_key(e) == *a)));
    *base = merged;
}

impl FieldAliases {
    /// Source-specific aliases are tried before the defaults.
    pub fn with_overrides(mut self, overrides: &FieldAliasOverrides) -> Self {
        prepend(&mut self.permit_id, &overrides.permit_id);
        prepend(&mut self.issue_date, &overrides.issue_date);
        prepend(&mut self.description, &overrides.description);
        prepend(&mut self.address, &overrides.address);
        prepend(&mut self.zipcode, &overrides.zipcode);
        prepend(&mut self.valuation, &overrides.valuation);
        prepend(&mut self.contractor, &overrides.contractor);
        prepend(&mut self.applicant, &overrides.applicant);
        self
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn find_field_key<'a>(raw: &'a RawRecord, aliases: &[String]) -> Option<(&'a String, &'a JsonValue)> {
    aliases.iter().find_map(|alias| {
        raw.iter()
            .find(|(key, value)| normalize_key(key) == *alias && !is_blank(value))
    })
}

/// First non-blank value whose key matches one of `aliases`, in alias order.
pub fn find_field<'a>(raw: &'a RawRecord, aliases: &[String]) -> Option<&'a JsonValue> {
    find_field_key(raw, aliases).map(|(_, value)| value)
}

fn value_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Some(i.to_string()),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => Some(format!("{}", f as i64)),
            _ => Some(n.to_string()),
        },
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn text_field(raw: &RawRecord, aliases: &[String]) -> Option<String> {
    find_field(raw, aliases).and_then(value_text)
}

/// Ordered keyword table; the first substring hit decides the trade.
pub const TRADE_KEYWORDS: &[(&str, Trade)] = &[
    ("elect", Trade::Electrical),
    ("plumb", Trade::Plumbing),
    ("hvac", Trade::Hvac),
    ("mech", Trade::Hvac),
    ("air", Trade::Hvac),
    ("roof", Trade::Roofing),
    ("pool", Trade::Pool),
];

pub fn classify_trade(text: &str) -> Trade {
    let lower = text.to_lowercase();
    TRADE_KEYWORDS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, trade)| *trade)
        .unwrap_or(Trade::General)
}

/// Currency-ish text to a number. Blank or unparseable input is `None`, never zero.
pub fn parse_valuation(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let digits = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect::<String>();
            if digits.is_empty() {
                None
            } else {
                digits.parse::<f64>().ok()
            }
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"];

/// Accepts epoch milliseconds (ArcGIS) and the textual forms the open-data portals emit.
pub fn parse_issue_date(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        JsonValue::String(s) => parse_date_text(s.trim()),
        _ => None,
    }
}

fn parse_date_text(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingPermitId,
    MissingIssueDate,
    BeforeCutoff,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOutcome {
    pub records: Vec<PermitRecord>,
    pub missing_permit_id: usize,
    pub missing_issue_date: usize,
    pub before_cutoff: usize,
}

impl NormalizeOutcome {
    pub fn rejected(&self) -> usize {
        self.missing_permit_id + self.missing_issue_date + self.before_cutoff
    }
}

/// Maps raw source rows onto [`PermitRecord`] for one source system.
#[derive(Debug, Clone)]
pub struct Normalizer {
    source_system: String,
    aliases: FieldAliases,
    cutoff: Option<DateTime<Utc>>,
}

impl Normalizer {
    pub fn new(source_system: impl Into<String>, aliases: FieldAliases) -> Self {
        Self {
            source_system: source_system.into(),
            aliases,
            cutoff: None,
        }
    }

    pub fn with_cutoff(mut self, cutoff: DateTime<Utc>) -> Self {
        self.cutoff = Some(cutoff);
        self
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<PermitRecord, Rejection> {
        let permit_id = text_field(raw, &self.aliases.permit_id).ok_or(Rejection::MissingPermitId)?;
        let issue_date = find_field(raw, &self.aliases.issue_date)
            .and_then(parse_issue_date)
            .ok_or(Rejection::MissingIssueDate)?;
        if self.cutoff.is_some_and(|cutoff| issue_date < cutoff) {
            return Err(Rejection::BeforeCutoff);
        }

        let description = text_field(raw, &self.aliases.description);

        Ok(PermitRecord {
            source_system: self.source_system.clone(),
            permit_id,
            issue_date,
            trade: description.as_deref().map(classify_trade).unwrap_or(Trade::General),
            description,
            address: text_field(raw, &self.aliases.address),
            zipcode: text_field(raw, &self.aliases.zipcode),
            valuation: find_field(raw, &self.aliases.valuation).and_then(parse_valuation),
            contractor: text_field(raw, &self.aliases.contractor),
            applicant: text_field(raw, &self.aliases.applicant),
            raw: JsonValue::Object(raw.clone()),
        })
    }

    pub fn normalize_all(&self, raws: &[RawRecord]) -> NormalizeOutcome {
        let mut outcome = NormalizeOutcome::default();
        for raw in raws {
            match self.normalize(raw) {
                Ok(record) => outcome.records.push(record),
                Err(Rejection::MissingPermitId) => outcome.missing_permit_id += 1,
                Err(Rejection::MissingIssueDate) => outcome.missing_issue_date += 1,
                Err(Rejection::BeforeCutoff) => outcome.before_cutoff += 1,
            }
        }
        outcome
    }
}

#[derive(Debug, Deserialize)]
struct ArcGisErrorBody {
    code: Option<i64>,
    message: Option<String>,
    #[serde(default)]
    details: Vec<String>,
}

impl ArcGisErrorBody {
    fn describe(&self) -> String {
        let mut out = format!(
            "ArcGIS error {}: {}",
            self.code.map(|c| c.to_string()).unwrap_or_else(|| "?".into()),
            self.message.as_deref().unwrap_or("no message")
        );
        if !self.details.is_empty() {
            out.push_str(&format!(" ({})", self.details.join("; ")));
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct ArcGisCountResponse {
    count: Option<u64>,
    error: Option<ArcGisErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ArcGisFeature {
    #[serde(default)]
    attributes: RawRecord,
}

#[derive(Debug, Deserialize)]
struct ArcGisPage {
    features: Option<Vec<ArcGisFeature>>,
    #[serde(rename = "exceededTransferLimit", default)]
    exceeded_transfer_limit: bool,
    error: Option<ArcGisErrorBody>,
}

#[derive(Debug, Clone)]
pub struct ArcGisFetcher {
    layer_url: String,
    date_field: String,
    page_size: usize,
    max_offset: usize,
}

impl ArcGisFetcher {
    pub fn new(layer_url: impl Into<String>, date_field: impl Into<String>) -> Self {
        Self {
            layer_url: layer_url.into(),
            date_field: date_field.into(),
            page_size: ARCGIS_PAGE_SIZE,
            max_offset: ARCGIS_MAX_OFFSET,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn query_endpoint(&self) -> String {
        let trimmed = self.layer_url.trim_end_matches('/');
        if trimmed.ends_with("/query") {
            trimmed.to_string()
        } else {
            format!("{trimmed}/query")
        }
    }

    pub fn where_clause(&self, since: DateTime<Utc>) -> String {
        format!("{} > {}", self.date_field, since.timestamp_millis())
    }

    pub fn count_url(&self, since: DateTime<Utc>) -> Result<Url, AdapterError> {
        parse_url(
            &self.query_endpoint(),
            &[
                ("where", self.where_clause(since)),
                ("returnCountOnly", "true".to_string()),
                ("f", "json".to_string()),
            ],
        )
    }

    pub fn page_url(&self, since: DateTime<Utc>, offset: usize) -> Result<Url, AdapterError> {
        parse_url(
            &self.query_endpoint(),
            &[
                ("where", self.where_clause(since)),
                ("outFields", "*".to_string()),
                ("f", "json".to_string()),
                ("resultOffset", offset.to_string()),
                ("resultRecordCount", self.page_size.to_string()),
                ("orderByFields", format!("{} DESC", self.date_field)),
            ],
        )
    }

    async fn count(&self, http: &dyn HttpTransport, since: DateTime<Utc>) -> Result<u64, AdapterError> {
        let url = self.count_url(since)?;
        let body: ArcGisCountResponse = get_json(http, &url, &[])
            .await
            .map_err(|e| AdapterError::fetch(format!("ArcGIS count query {url}"), e))?;
        if let Some(err) = body.error {
            return Err(AdapterError::contract(&url, err.describe()));
        }
        let count = body
            .count
            .ok_or_else(|| AdapterError::contract(&url, "count-only response has no `count`"))?;
        if count == 0 {
            return Err(AdapterError::ZeroCount {
                query_url: url.to_string(),
            });
        }
        Ok(count)
    }
}

#[async_trait]
impl SourceFetcher for ArcGisFetcher {
    fn kind(&self) -> &'static str {
        "arcgis"
    }

    fn endpoint(&self) -> &str {
        &self.layer_url
    }

    async fn fetch(&self, http: &dyn HttpTransport, window: &FetchWindow) -> Result<Vec<RawRecord>, AdapterError> {
        let total = self.count(http, window.since).await?;
        info!(layer = %self.layer_url, total, "ArcGIS count query");

        let mut records = Vec::with_capacity(total.min((self.max_offset + self.page_size) as u64) as usize);
        let mut offset = 0usize;
        loop {
            if offset > self.max_offset {
                warn!(
                    layer = %self.layer_url,
                    offset,
                    fetched = records.len(),
                    "offset safety bound reached, stopping pagination"
                );
                break;
            }

            let url = self.page_url(window.since, offset)?;
            let page: ArcGisPage = get_json(http, &url, &[])
                .await
                .map_err(|e| AdapterError::fetch(format!("ArcGIS page at offset {offset}"), e))?;
            if let Some(err) = page.error {
                return Err(AdapterError::contract(&url, err.describe()));
            }
            let features = page
                .features
                .ok_or_else(|| AdapterError::contract(&url, format!("page at offset {offset} has no `features`")))?;

            let returned = features.len();
            debug!(offset, returned, exceeded = page.exceeded_transfer_limit, "ArcGIS page");
            records.extend(features.into_iter().map(|f| f.attributes));

            if returned < self.page_size {
                break;
            }
            offset += self.page_size;
        }

        Ok(records)
    }
}

#[derive(Debug, Clone)]
pub struct XlsxFetcher {
    url: String,
    date_aliases: Vec<String>,
}

impl XlsxFetcher {
    pub fn new(url: impl Into<String>, date_aliases: Vec<String>) -> Self {
        Self {
            url: url.into(),
            date_aliases,
        }
    }
}

fn cell_to_json(cell: &Data) -> Option<JsonValue> {
    match cell {
        Data::String(s) => Some(JsonValue::String(s.clone())),
        Data::Float(f) => serde_json::Number::from_f64(*f).map(JsonValue::Number),
        Data::Int(i) => Some(JsonValue::from(*i)),
        Data::Bool(b) => Some(JsonValue::Bool(*b)),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|naive| JsonValue::String(naive.format("%Y-%m-%dT%H:%M:%S").to_string())),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(JsonValue::String(s.clone())),
        Data::Error(_) | Data::Empty => None,
    }
}

/// Excel stores dates as fractional days since 1899-12-30.
pub fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial <= 0.0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    epoch.checked_add_signed(Duration::milliseconds((serial * 86_400_000.0).round() as i64))
}

/// First worksheet as objects keyed by the header row.
pub fn parse_first_sheet(bytes: &[u8]) -> Result<Vec<RawRecord>, String> {
    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| "workbook has no worksheets".to_string())?
        .map_err(|e| e.to_string())?;

    let mut rows = range.rows();
    let Some(header) = rows.find(|row| row.iter().any(|c| !matches!(c, Data::Empty))) else {
        return Ok(Vec::new());
    };
    let columns = header
        .iter()
        .map(|c| c.to_string().trim().to_string())
        .collect::<Vec<_>>();

    let mut records = Vec::new();
    for row in rows {
        let mut record = RawRecord::new();
        for (column, cell) in columns.iter().zip(row.iter()) {
            if column.is_empty() {
                continue;
            }
            if let Some(value) = cell_to_json(cell) {
                record.insert(column.clone(), value);
            }
        }
        if !record.is_empty() {
            records.push(record);
        }
    }
    Ok(records)
}

/// Rewrites serial-number dates to ISO text and drops rows dated before `since`.
pub fn filter_rows_since(rows: Vec<RawRecord>, date_aliases: &[String], since: DateTime<Utc>) -> Vec<RawRecord> {
    rows.into_iter()
        .filter_map(|mut row| {
            let (key, value) = find_field_key(&row, date_aliases).map(|(k, v)| (k.clone(), v.clone()))?;
            if let JsonValue::Number(n) = &value {
                let naive = n.as_f64().and_then(excel_serial_to_datetime)?;
                row.insert(key.clone(), JsonValue::String(naive.format("%Y-%m-%dT%H:%M:%S").to_string()));
            }
            let issued = row.get(&key).and_then(parse_issue_date)?;
            (issued >= since).then_some(row)
        })
        .collect()
}

#[async_trait]
impl SourceFetcher for XlsxFetcher {
    fn kind(&self) -> &'static str {
        "xlsx"
    }

    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, http: &dyn HttpTransport, window: &FetchWindow) -> Result<Vec<RawRecord>, AdapterError> {
        let url = parse_url(&self.url, &[])?;
        let resp = http
            .get(&url, &[])
            .await
            .map_err(|e| AdapterError::fetch(format!("downloading spreadsheet {url}"), e))?;
        let rows = parse_first_sheet(&resp.body).map_err(|message| AdapterError::Spreadsheet {
            url: self.url.clone(),
            message,
        })?;
        let parsed = rows.len();
        let kept = filter_rows_since(rows, &self.date_aliases, window.since);
        info!(url = %self.url, parsed, kept = kept.len(), "spreadsheet rows");
        Ok(kept)
    }
}

#[derive(Debug, Clone)]
pub struct SocrataFetcher {
    resource_url: String,
    order_field: String,
    limit: usize,
    app_token: Option<String>,
}

impl SocrataFetcher {
    pub fn new(resource_url: impl Into<String>, order_field: impl Into<String>, limit: usize) -> Self {
        Self {
            resource_url: resource_url.into(),
            order_field: order_field.into(),
            limit,
            app_token: None,
        }
    }

    pub fn with_app_token(mut self, token: Option<String>) -> Self {
        self.app_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn query_url(&self) -> Result<Url, AdapterError> {
        let trimmed = self.resource_url.trim_end_matches('/');
        let base = if trimmed.ends_with(".json") {
            trimmed.to_string()
        } else {
            format!("{trimmed}.json")
        };
        parse_url(
            &base,
            &[
                ("$limit", self.limit.to_string()),
                ("$order", format!("{} DESC", self.order_field)),
            ],
        )
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        self.app_token
            .iter()
            .map(|token| ("X-App-Token".to_string(), token.clone()))
            .collect()
    }
}

#[async_trait]
impl SourceFetcher for SocrataFetcher {
    fn kind(&self) -> &'static str {
        "socrata"
    }

    fn endpoint(&self) -> &str {
        &self.resource_url
    }

    async fn fetch(&self, http: &dyn HttpTransport, _window: &FetchWindow) -> Result<Vec<RawRecord>, AdapterError> {
        let url = self.query_url()?;
        let rows: Vec<JsonValue> = get_json(http, &url, &self.headers())
            .await
            .map_err(|e| AdapterError::fetch(format!("Socrata query {url}"), e))?;
        rows.into_iter()
            .map(|row| match row {
                JsonValue::Object(map) => Ok(map),
                other => Err(AdapterError::contract(
                    &url,
                    format!("expected an array of objects, found element {other}"),
                )),
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct CkanResponse {
    success: bool,
    result: Option<CkanResult>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct CkanResult {
    records: Option<Vec<RawRecord>>,
}

#[derive(Debug, Clone)]
pub struct CkanFetcher {
    search_url: String,
    resource_id: String,
    limit: usize,
    sort: Option<String>,
}

impl CkanFetcher {
    pub fn new(search_url: impl Into<String>, resource_id: impl Into<String>, limit: usize) -> Self {
        Self {
            search_url: search_url.into(),
            resource_id: resource_id.into(),
            limit,
            sort: None,
        }
    }

    pub fn with_sort(mut self, sort: Option<String>) -> Self {
        self.sort = sort;
        self
    }

    pub fn query_url(&self) -> Result<Url, AdapterError> {
        let mut params = vec![
            ("resource_id", self.resource_id.clone()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(sort) = &self.sort {
            params.push(("sort", sort.clone()));
        }
        parse_url(&self.search_url, &params)
    }
}

#[async_trait]
impl SourceFetcher for CkanFetcher {
    fn kind(&self) -> &'static str {
        "ckan"
    }

    fn endpoint(&self) -> &str {
        &self.search_url
    }

    async fn fetch(&self, http: &dyn HttpTransport, _window: &FetchWindow) -> Result<Vec<RawRecord>, AdapterError> {
        let url = self.query_url()?;
        let body: CkanResponse = get_json(http, &url, &[])
            .await
            .map_err(|e| AdapterError::fetch(format!("CKAN datastore_search {url}"), e))?;
        if !body.success {
            let detail = body.error.map(|e| e.to_string()).unwrap_or_else(|| "no error detail".into());
            return Err(AdapterError::contract(&url, format!("success=false: {detail}")));
        }
        body.result
            .and_then(|r| r.records)
            .ok_or_else(|| AdapterError::contract(&url, "response has no result.records"))
    }
}

fn default_page_size() -> usize {
    ARCGIS_PAGE_SIZE
}

fn default_socrata_limit() -> usize {
    DEFAULT_SOCRATA_LIMIT
}

fn default_ckan_limit() -> usize {
    DEFAULT_CKAN_LIMIT
}

/// Kind-specific settings of one feed, tagged by `kind` in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FeedKind {
    Arcgis {
        date_field: String,
        #[serde(default = "default_page_size")]
        page_size: usize,
    },
    Xlsx {
        #[serde(default)]
        date_field: Option<String>,
    },
    Socrata {
        order_field: String,
        #[serde(default = "default_socrata_limit")]
        limit: usize,
    },
    Ckan {
        resource_id: String,
        #[serde(default = "default_ckan_limit")]
        limit: usize,
        #[serde(default)]
        sort: Option<String>,
    },
}

impl FeedKind {
    pub fn name(&self) -> &'static str {
        match self {
            FeedKind::Arcgis { .. } => "arcgis",
            FeedKind::Xlsx { .. } => "xlsx",
            FeedKind::Socrata { .. } => "socrata",
            FeedKind::Ckan { .. } => "ckan",
        }
    }
}

/// Shared inputs for building any fetcher.
#[derive(Debug, Clone, Default)]
pub struct FetcherSettings {
    pub socrata_app_token: Option<String>,
}

pub fn build_fetcher(
    kind: &FeedKind,
    url: &str,
    aliases: &FieldAliases,
    settings: &FetcherSettings,
) -> Box<dyn SourceFetcher> {
    match kind {
        FeedKind::Arcgis { date_field, page_size } => {
            Box::new(ArcGisFetcher::new(url, date_field.clone()).with_page_size(*page_size))
        }
        FeedKind::Xlsx { date_field } => {
            let mut date_aliases = aliases.issue_date.clone();
            if let Some(field) = date_field {
                prepend(&mut date_aliases, std::slice::from_ref(field));
            }
            Box::new(XlsxFetcher::new(url, date_aliases))
        }
        FeedKind::Socrata { order_field, limit } => Box::new(
            SocrataFetcher::new(url, order_field.clone(), *limit)
                .with_app_token(settings.socrata_app_token.clone()),
        ),
        FeedKind::Ckan {
            resource_id,
            limit,
            sort,
        } => Box::new(CkanFetcher::new(url, resource_id.clone(), *limit).with_sort(sort.clone())),
    }
}
