//! Core domain model and normalization rules for broker snapshot sync.
//!
//! Everything in here is pure: no filesystem, no database. Raw values coming
//! out of snapshot bundles are turned into the typed records below before any
//! persistence code sees them.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "bsync-core";

/// Values the extractor writes when a field has no content.
const NULL_SENTINELS: &[&str] = &["", "-", "null", "none", "nan", "n/a"];

/// One sub-broker scheduled for extraction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Dedup key: the roster identifier, or the name when there is none.
    pub id: String,
    pub name: String,
    /// Identifier exactly as the roster carried it; `None` for a blank cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roster_id: Option<String>,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            roster_id: Some(id.clone()),
            id,
            name: name.into(),
        }
    }

    /// A unit without a separate identifier is keyed by its display name.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            roster_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Started,
    Completed,
    Failed,
}

/// One recognized line of the extractor's execution log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub unit: String,
    pub outcome: Outcome,
    pub detail: Option<String>,
    /// 1-based line number in the log file.
    pub line_no: usize,
}

/// Units that have to be extracted again, in roster order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryRoster {
    units: Vec<WorkUnit>,
}

impl RetryRoster {
    pub fn new(units: Vec<WorkUnit>) -> Self {
        Self { units }
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn into_units(self) -> Vec<WorkUnit> {
        self.units
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("invalid document number {0:?}")]
    InvalidDocument(String),
    #[error("invalid date {0:?}")]
    InvalidDate(String),
    #[error("invalid amount {0:?}")]
    InvalidAmount(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocumentKind {
    Cpf,
    Cnpj,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Cpf => "CPF",
            DocumentKind::Cnpj => "CNPJ",
        }
    }
}

/// A taxpayer document reduced to its digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Document {
    digits: String,
    kind: DocumentKind,
}

impl Document {
    /// Strips formatting (`"CPF: 123.456.789-00"` -> `12345678900`) and
    /// checks the length: 11 digits for a CPF, 14 for a CNPJ.
    pub fn parse(raw: &str) -> Result<Self, NormalizationError> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        let kind = match digits.len() {
            11 => DocumentKind::Cpf,
            14 => DocumentKind::Cnpj,
            _ => return Err(NormalizationError::InvalidDocument(raw.trim().to_string())),
        };
        Ok(Self { digits, kind })
    }

    pub fn digits(&self) -> &str {
        &self.digits
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digits)
    }
}

/// UTF-8 when valid, otherwise Windows-1252: the extractor writes its
/// log and older bundles in the host's legacy code page.
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes).0,
    }
}

pub fn is_null_sentinel(raw: &str) -> bool {
    let trimmed = raw.trim();
    NULL_SENTINELS
        .iter()
        .any(|sentinel| trimmed.eq_ignore_ascii_case(sentinel))
}

/// Trimmed text, or `None` for empty and sentinel values.
pub fn clean_text(raw: &str) -> Option<String> {
    if is_null_sentinel(raw) {
        None
    } else {
        Some(raw.trim().to_string())
    }
}

/// Parses the date shapes the extractor emits into a `NaiveDate`.
///
/// Accepted: `dd/mm/yyyy`, `yyyy-mm-dd`, RFC 3339 timestamps and naive
/// `yyyy-mm-ddTHH:MM:SS` timestamps (only the date part is kept).
pub fn parse_date(raw: &str) -> Result<Option<NaiveDate>, NormalizationError> {
    let Some(value) = clean_text(raw) else {
        return Ok(None);
    };

    for fmt in ["%d/%m/%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(&value, fmt) {
            return Ok(Some(date));
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(&value) {
        return Ok(Some(ts.date_naive()));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(&value, fmt) {
            return Ok(Some(ts.date()));
        }
    }

    Err(NormalizationError::InvalidDate(value))
}

/// Parses `1234.56`, `1.234,56` and `R$ 1.234,56` style amounts.
pub fn parse_amount(raw: &str) -> Result<Option<f64>, NormalizationError> {
    let Some(value) = clean_text(raw) else {
        return Ok(None);
    };
    let compact: String = value
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let canonical = if compact.contains(',') {
        compact.replace('.', "").replace(',', ".")
    } else {
        compact
    };
    match canonical.parse::<f64>() {
        Ok(amount) if amount.is_finite() => Ok(Some(amount)),
        _ => Err(NormalizationError::InvalidAmount(value)),
    }
}

/// Days between a due date and the reference date; never negative.
pub fn delay_days(due: NaiveDate, as_of: NaiveDate) -> i64 {
    (as_of - due).num_days().max(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCategory {
    Client,
    Proposal,
    Defaulter,
    Product,
}

impl RecordCategory {
    pub fn table(self) -> &'static str {
        match self {
            RecordCategory::Client => "clients",
            RecordCategory::Proposal => "proposals",
            RecordCategory::Defaulter => "defaulters_detailed",
            RecordCategory::Product => "products_clients",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductLine {
    Life,
    Pension,
}

/// Row of the `clients` table, keyed by `(tenant, document)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub document: Document,
    /// Portal-side client id, only used to resolve references inside a bundle.
    pub source_id: Option<String>,
    pub name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub address_number: Option<String>,
    pub address_complement: Option<String>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub holder_document: Option<String>,
    pub sex: Option<String>,
    pub marital_status: Option<String>,
    pub id_number: Option<String>,
    pub id_issuer: Option<String>,
    pub income: Option<String>,
    pub profession: Option<String>,
}

impl Client {
    pub const UNKNOWN_NAME: &'static str = "Cliente não informado";

    /// Minimal row created when a proposal or product references a client
    /// that no clients section has described yet.
    pub fn placeholder(document: Document, name: Option<String>) -> Self {
        Self {
            document,
            source_id: None,
            name: Some(name.unwrap_or_else(|| Self::UNKNOWN_NAME.to_string())),
            birth_date: None,
            phone: None,
            email: None,
            address: None,
            address_number: None,
            address_complement: None,
            district: None,
            city: None,
            state: None,
            postal_code: None,
            holder_document: None,
            sex: None,
            marital_status: None,
            id_number: None,
            id_issuer: None,
            income: None,
            profession: None,
        }
    }
}

/// Row of the `proposals` table, keyed by `(tenant, proposal_number)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_number: String,
    pub document: Document,
    pub client_name: Option<String>,
    pub product: Option<String>,
    pub business_line: Option<String>,
    pub created_on: Option<NaiveDate>,
    pub proposal_status: Option<String>,
    pub payment_method: Option<String>,
    pub amount: f64,
    pub due_date: NaiveDate,
    pub competency: Option<String>,
    pub payment_status: Option<String>,
    pub pending_reason: Option<String>,
    pub status_date: Option<NaiveDate>,
}

/// Row of the `defaulters_detailed` table.
///
/// Keyed by `(tenant, client, proposal_number, certificate_number, competency)`;
/// the key parts are empty strings rather than nulls so the key stays comparable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaulterDetail {
    pub document: Document,
    pub client_name: Option<String>,
    pub business_line: Option<String>,
    pub product_name: Option<String>,
    pub proposal_number: String,
    pub certificate_number: String,
    pub competency: String,
    pub original_due_date: Option<NaiveDate>,
    pub current_due_date: Option<NaiveDate>,
    pub contribution_value: f64,
    pub payment_status: Option<String>,
    pub payment_method: Option<String>,
    pub delay_days: i64,
}

/// Row of the `products_clients` table.
///
/// Keyed by `(tenant, client, proposal_number, certificate_number, coverage_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductClient {
    pub document: Document,
    pub line: ProductLine,
    pub business_line: Option<String>,
    pub product_type: Option<String>,
    pub proposal_number: String,
    pub certificate_number: String,
    pub product_status: Option<String>,
    pub coverage_name: String,
    pub insured_capital: f64,
    pub coverage_payment_period: Option<String>,
    pub due_day: Option<String>,
    pub last_payment: Option<NaiveDate>,
    pub next_payment: Option<NaiveDate>,
    pub paid_installments: Option<String>,
    pub pending_installments: Option<String>,
    pub payment_frequency: Option<String>,
}

/// A record dropped during normalization, reported but never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRecord {
    pub category: RecordCategory,
    /// Name of the bundle section the record came from.
    pub section: String,
    /// 0-based position inside that section.
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    Cancelled,
    NotOverdue,
}

/// A well-formed record that is intentionally not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilteredRecord {
    pub category: RecordCategory,
    pub section: String,
    pub index: usize,
    pub reason: FilterReason,
}

/// Typed handoff contract from bundle parsing into the synchronizer.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct NormalizedBundle {
    pub unit_name: Option<String>,
    pub captured_at: Option<NaiveDateTime>,
    pub clients: Vec<Client>,
    pub proposals: Vec<Proposal>,
    pub defaulters: Vec<DefaulterDetail>,
    pub products: Vec<ProductClient>,
    pub rejected: Vec<RejectedRecord>,
    pub filtered: Vec<FilteredRecord>,
}

impl NormalizedBundle {
    pub fn record_count(&self) -> usize {
        self.clients.len() + self.proposals.len() + self.defaulters.len() + self.products.len()
    }
}
