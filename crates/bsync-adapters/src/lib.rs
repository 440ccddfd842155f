//! Snapshot bundle format: section parsing, file naming and record normalization.

use std::borrow::Cow;
use std::collections::HashMap;

use bsync_core::{
    clean_text, decode_text, delay_days, parse_amount, parse_date, Client, DefaulterDetail, Document,
    FilterReason, FilteredRecord, NormalizationError, NormalizedBundle, ProductClient, ProductLine,
    Proposal, RecordCategory, RejectedRecord,
};
use bsync_storage::BUNDLE_SUFFIX;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bsync-adapters";

const FILE_PREFIX: &str = "Extracao_";
const CAPTURE_STAMP_FORMAT: &str = "%Y-%m-%d %H-%M-%S";
const PENSION_LINE: &str = "Previdência";
const PENSION_COVERAGE: &str = "Plano de Previdência";
const PENSION_STATUS: &str = "Ativo";
const CANCELLED_STATUS: &str = "CANCELADO";

type JsonObject = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Clients,
    Proposals,
    PendingPayments,
    LifeProducts,
    PensionProducts,
    Unknown,
}

impl SectionKind {
    /// Classify a section by the sheet name the extractor gave it.
    pub fn classify(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains("clientes") {
            SectionKind::Clients
        } else if name.contains("propostas") || name.contains("status") {
            SectionKind::Proposals
        } else if name.contains("pendentes") || name.contains("inadimplentes") {
            SectionKind::PendingPayments
        } else if name.contains("produtos") && name.contains("vida") {
            SectionKind::LifeProducts
        } else if name.contains("produtos")
            && (name.contains("previdencia") || name.contains("previdência"))
        {
            SectionKind::PensionProducts
        } else {
            SectionKind::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawSection {
    pub name: String,
    pub kind: SectionKind,
    pub records: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawBundle {
    pub sections: Vec<RawSection>,
}

impl RawBundle {
    /// Records of every section of `kind`, in file order.
    pub fn records(&self, kind: SectionKind) -> impl Iterator<Item = &JsonValue> {
        self.sections
            .iter()
            .filter(move |section| section.kind == kind)
            .flat_map(|section| section.records.iter())
    }

    /// Like [`RawBundle::records`], with each record's section name and
    /// position inside that section.
    pub fn located_records(
        &self,
        kind: SectionKind,
    ) -> impl Iterator<Item = (&str, usize, &JsonValue)> {
        self.sections
            .iter()
            .filter(move |section| section.kind == kind)
            .flat_map(|section| {
                section
                    .records
                    .iter()
                    .enumerate()
                    .map(move |(index, record)| (section.name.as_str(), index, record))
            })
    }
}

#[derive(Debug, Error)]
pub enum BundleParseError {
    #[error("bundle is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected bundle shape: {0}")]
    UnexpectedShape(String),
}

/// Bundles are written as UTF-8; older ones use Windows-1252.
pub fn decode_bundle_text(bytes: &[u8]) -> Cow<'_, str> {
    decode_text(bytes)
}

/// Parse the `[{"name": ..., "data": [...]}, ...]` layout of a bundle.
pub fn parse_raw_bundle(bytes: &[u8]) -> Result<RawBundle, BundleParseError> {
    let text = decode_bundle_text(bytes);
    let root: JsonValue = serde_json::from_str(&text)?;
    let JsonValue::Array(elements) = root else {
        return Err(BundleParseError::UnexpectedShape(
            "top level is not an array of sections".to_string(),
        ));
    };

    let mut sections = Vec::new();
    for (position, element) in elements.into_iter().enumerate() {
        let JsonValue::Object(mut object) = element else {
            continue;
        };
        let Some(name) = object.get("name").and_then(JsonValue::as_str).map(str::to_string) else {
            continue;
        };
        let records = match object.remove("data") {
            None | Some(JsonValue::Null) => Vec::new(),
            Some(JsonValue::Array(records)) => records,
            Some(_) => {
                return Err(BundleParseError::UnexpectedShape(format!(
                    "section {position} ({name}) has non-array data"
                )))
            }
        };
        sections.push(RawSection {
            kind: SectionKind::classify(&name),
            name,
            records,
        });
    }
    Ok(RawBundle { sections })
}

/// What a bundle's file name says about its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleName {
    pub unit_name: Option<String>,
    pub captured_at: Option<NaiveDateTime>,
}

/// Split `Extracao_<Unit_Name>_<YYYY-MM-DD>_<HH-MM-SS>_backup.json`.
pub fn parse_bundle_file_name(file_name: &str) -> BundleName {
    let stem = file_name.strip_suffix(BUNDLE_SUFFIX).unwrap_or(file_name);
    let stem = stem.strip_prefix(FILE_PREFIX).unwrap_or(stem);
    let parts: Vec<&str> = stem.split('_').collect();

    let (name_parts, captured_at) = match parts.as_slice() {
        [name @ .., day, time] if !name.is_empty() => {
            match NaiveDateTime::parse_from_str(&format!("{day} {time}"), CAPTURE_STAMP_FORMAT) {
                Ok(stamp) => (name, Some(stamp)),
                Err(_) => (parts.as_slice(), None),
            }
        }
        _ => (parts.as_slice(), None),
    };

    let joined = name_parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    BundleName {
        unit_name: clean_text(&title_case(&joined)),
        captured_at,
    }
}

/// Uppercase the first letter of every word and lowercase the rest.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut previous_is_letter = false;
    for ch in input.chars() {
        if ch.is_alphabetic() {
            if previous_is_letter {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            previous_is_letter = true;
        } else {
            out.push(ch);
            previous_is_letter = false;
        }
    }
    out
}

/// Stable identifier for a bundle's content, independent of where it lives.
pub fn bundle_id(content_hash: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("bsync:bundle:{content_hash}").as_bytes(),
    )
}

/// Turn raw sections into typed records.
///
/// Records that fail validation are rejected one by one; the rest of the
/// bundle is unaffected. Overdue calculations use the bundle's capture date,
/// or `fallback_as_of` when the file name carries no timestamp.
pub fn normalize_bundle(
    raw: &RawBundle,
    name: &BundleName,
    fallback_as_of: NaiveDate,
) -> NormalizedBundle {
    let as_of = name
        .captured_at
        .map(|stamp| stamp.date())
        .unwrap_or(fallback_as_of);
    let mut bundle = NormalizedBundle {
        unit_name: name.unit_name.clone(),
        captured_at: name.captured_at,
        ..Default::default()
    };
    let mut documents_by_source_id: HashMap<String, Document> = HashMap::new();

    for (section, index, value) in raw.located_records(SectionKind::Clients) {
        match as_object(value).and_then(normalize_client) {
            Ok(client) => {
                if let Some(source_id) = &client.source_id {
                    documents_by_source_id.insert(source_id.clone(), client.document.clone());
                }
                bundle.clients.push(client);
            }
            Err(err) => reject(&mut bundle, RecordCategory::Client, section, index, err),
        }
    }

    for (section, index, value) in raw.located_records(SectionKind::Proposals) {
        match as_object(value).and_then(|r| normalize_proposal(r, &documents_by_source_id)) {
            Ok(proposal) => bundle.proposals.push(proposal),
            Err(err) => reject(&mut bundle, RecordCategory::Proposal, section, index, err),
        }
    }

    for (section, index, value) in raw.located_records(SectionKind::PendingPayments) {
        let normalized = as_object(value)
            .and_then(|r| normalize_defaulter(r, &documents_by_source_id, as_of));
        match normalized {
            Ok(Some(detail)) => bundle.defaulters.push(detail),
            Ok(None) => bundle.filtered.push(FilteredRecord {
                category: RecordCategory::Defaulter,
                section: section.to_string(),
                index,
                reason: FilterReason::NotOverdue,
            }),
            Err(err) => reject(&mut bundle, RecordCategory::Defaulter, section, index, err),
        }
    }

    let product_sections = [
        (SectionKind::LifeProducts, ProductLine::Life),
        (SectionKind::PensionProducts, ProductLine::Pension),
    ];
    for (kind, line) in product_sections {
        for (section, index, value) in raw.located_records(kind) {
            let normalized =
                as_object(value).and_then(|r| normalize_product(r, line, &documents_by_source_id));
            match normalized {
                Ok(Some(product)) => bundle.products.push(product),
                Ok(None) => bundle.filtered.push(FilteredRecord {
                    category: RecordCategory::Product,
                    section: section.to_string(),
                    index,
                    reason: FilterReason::Cancelled,
                }),
                Err(err) => reject(&mut bundle, RecordCategory::Product, section, index, err),
            }
        }
    }

    bundle
}

fn reject(
    bundle: &mut NormalizedBundle,
    category: RecordCategory,
    section: &str,
    index: usize,
    err: NormalizationError,
) {
    bundle.rejected.push(RejectedRecord {
        category,
        section: section.to_string(),
        index,
        reason: err.to_string(),
    });
}

fn as_object(value: &JsonValue) -> Result<&JsonObject, NormalizationError> {
    value
        .as_object()
        .ok_or(NormalizationError::MissingField("record object"))
}

fn text(record: &JsonObject, key: &str) -> Option<String> {
    match record.get(key)? {
        JsonValue::String(s) => clean_text(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn date(record: &JsonObject, key: &str) -> Result<Option<NaiveDate>, NormalizationError> {
    match record.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => parse_date(s),
        Some(other) => Err(NormalizationError::InvalidDate(other.to_string())),
    }
}

fn amount(record: &JsonObject, key: &str) -> Result<Option<f64>, NormalizationError> {
    match record.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| NormalizationError::InvalidAmount(n.to_string())),
        Some(JsonValue::String(s)) => parse_amount(s),
        Some(other) => Err(NormalizationError::InvalidAmount(other.to_string())),
    }
}

fn document_field(record: &JsonObject, key: &str) -> Result<Option<Document>, NormalizationError> {
    text(record, key)
        .map(|raw| Document::parse(&raw))
        .transpose()
}

fn referenced_document(
    record: &JsonObject,
    documents_by_source_id: &HashMap<String, Document>,
) -> Option<Document> {
    text(record, "id_cliente").and_then(|id| documents_by_source_id.get(&id).cloned())
}

fn normalize_client(record: &JsonObject) -> Result<Client, NormalizationError> {
    let document = document_field(record, "documento")?.ok_or(NormalizationError::MissingField("documento"))?;
    Ok(Client {
        document,
        source_id: text(record, "id_cliente"),
        name: text(record, "nome"),
        birth_date: date(record, "data_nascimento")?,
        phone: text(record, "telefone"),
        email: text(record, "email"),
        address: text(record, "endereco"),
        address_number: text(record, "numero"),
        address_complement: text(record, "complemento"),
        district: text(record, "bairro"),
        city: text(record, "cidade"),
        state: text(record, "uf"),
        postal_code: text(record, "cep"),
        holder_document: text(record, "titular_cpf"),
        sex: text(record, "sexo"),
        marital_status: text(record, "estado_civil"),
        id_number: text(record, "numero_documento"),
        id_issuer: text(record, "orgao_expedidor"),
        income: text(record, "renda_patrimonio"),
        profession: text(record, "profissao"),
    })
}

fn normalize_proposal(
    record: &JsonObject,
    documents_by_source_id: &HashMap<String, Document>,
) -> Result<Proposal, NormalizationError> {
    let proposal_number = text(record, "proposta").ok_or(NormalizationError::MissingField("proposta"))?;
    let document = match referenced_document(record, documents_by_source_id) {
        Some(document) => document,
        None => document_field(record, "cpf")?.ok_or(NormalizationError::MissingField("cpf"))?,
    };
    let due_date = date(record, "vencimento")?.ok_or(NormalizationError::MissingField("vencimento"))?;

    Ok(Proposal {
        proposal_number,
        document,
        client_name: text(record, "nome"),
        product: text(record, "produto"),
        business_line: text(record, "linha_negocio"),
        created_on: date(record, "criada_em")?,
        proposal_status: text(record, "status_proposta"),
        payment_method: text(record, "forma_pagamento"),
        amount: amount(record, "valor")?.unwrap_or(0.0),
        due_date,
        competency: text(record, "competencia"),
        payment_status: text(record, "status_pagamento"),
        pending_reason: text(record, "motivo_pendencia"),
        status_date: date(record, "data")?,
    })
}

fn normalize_defaulter(
    record: &JsonObject,
    documents_by_source_id: &HashMap<String, Document>,
    as_of: NaiveDate,
) -> Result<Option<DefaulterDetail>, NormalizationError> {
    let document = match document_field(record, "cpf_cliente")? {
        Some(document) => document,
        None => referenced_document(record, documents_by_source_id)
            .ok_or(NormalizationError::MissingField("cpf_cliente"))?,
    };
    let original_due_date = date(record, "vencimento_original")?;
    let current_due_date = date(record, "vencimento_atual")?;
    let contribution_value = amount(record, "contribuicao")?.unwrap_or(0.0);

    let delay = current_due_date
        .or(original_due_date)
        .map(|due| delay_days(due, as_of))
        .unwrap_or(0);
    if delay <= 0 {
        return Ok(None);
    }

    Ok(Some(DefaulterDetail {
        document,
        client_name: text(record, "nome_cliente"),
        business_line: text(record, "linha_negocio"),
        product_name: text(record, "produto"),
        proposal_number: text(record, "numero_proposta").unwrap_or_default(),
        certificate_number: text(record, "numero_certificado").unwrap_or_default(),
        competency: text(record, "competencia").unwrap_or_default(),
        original_due_date,
        current_due_date,
        contribution_value,
        payment_status: text(record, "status_pagamento"),
        payment_method: text(record, "forma_pagamento"),
        delay_days: delay,
    }))
}

fn normalize_product(
    record: &JsonObject,
    line: ProductLine,
    documents_by_source_id: &HashMap<String, Document>,
) -> Result<Option<ProductClient>, NormalizationError> {
    let product_status = match line {
        ProductLine::Life => text(record, "situacao_produto"),
        ProductLine::Pension => {
            Some(text(record, "situacao_produto").unwrap_or_else(|| PENSION_STATUS.to_string()))
        }
    };
    if product_status
        .as_deref()
        .is_some_and(|status| status.eq_ignore_ascii_case(CANCELLED_STATUS))
    {
        return Ok(None);
    }

    let document = referenced_document(record, documents_by_source_id)
        .ok_or(NormalizationError::MissingField("id_cliente"))?;
    let proposal_number = text(record, "numero_proposta").unwrap_or_default();

    let product = match line {
        ProductLine::Life => ProductClient {
            document,
            line,
            business_line: text(record, "linha_negocio"),
            product_type: text(record, "tipo_produto"),
            certificate_number: text(record, "numero_certificado").unwrap_or_default(),
            proposal_number,
            product_status,
            coverage_name: text(record, "nome_cobertura").unwrap_or_default(),
            insured_capital: amount(record, "capital_segurado")?.unwrap_or(0.0),
            coverage_payment_period: text(record, "periodo_pagamento_cobertura"),
            due_day: text(record, "dia_vencimento"),
            last_payment: date(record, "ultimo_pagamento")?,
            next_payment: date(record, "proximo_pagamento")?,
            paid_installments: text(record, "quantidade_parcelas_pagas"),
            pending_installments: text(record, "quantidade_parcelas_pendentes"),
            payment_frequency: text(record, "periodicidade_pagamentos"),
        },
        ProductLine::Pension => {
            let last_payment = match date(record, "ultima_contribuicao")? {
                Some(day) => Some(day),
                None => date(record, "ultimo_pagamento")?,
            };
            ProductClient {
                document,
                line,
                business_line: Some(
                    text(record, "linha_negocio").unwrap_or_else(|| PENSION_LINE.to_string()),
                ),
                product_type: text(record, "tipo_produto"),
                certificate_number: text(record, "numero_certificado")
                    .unwrap_or_else(|| proposal_number.clone()),
                proposal_number,
                product_status,
                coverage_name: text(record, "nome_cobertura")
                    .unwrap_or_else(|| PENSION_COVERAGE.to_string()),
                insured_capital: amount(record, "reserva_bruta")?.unwrap_or(0.0),
                coverage_payment_period: text(record, "periodo_pagamento_cobertura"),
                due_day: text(record, "dia_vencimento"),
                last_payment,
                next_payment: None,
                paid_installments: text(record, "quantidade_parcelas_pagas"),
                pending_installments: text(record, "quantidade_parcelas_pendentes"),
                payment_frequency: text(record, "periodicidade_pagamentos"),
            }
        }
    };
    Ok(Some(product))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn bundle_from(value: JsonValue) -> RawBundle {
        parse_raw_bundle(value.to_string().as_bytes()).expect("parse")
    }

    #[test]
    fn sections_are_classified_by_name() {
        assert_eq!(SectionKind::classify("Clientes"), SectionKind::Clients);
        assert_eq!(SectionKind::classify("Status Propostas"), SectionKind::Proposals);
        assert_eq!(
            SectionKind::classify("Pagamentos Pendentes"),
            SectionKind::PendingPayments
        );
        assert_eq!(SectionKind::classify("Produtos Vida"), SectionKind::LifeProducts);
        assert_eq!(
            SectionKind::classify("Produtos Previdencia"),
            SectionKind::PensionProducts
        );
        assert_eq!(
            SectionKind::classify("Produtos Previdência"),
            SectionKind::PensionProducts
        );
        assert_eq!(SectionKind::classify("Resumo"), SectionKind::Unknown);
    }

    #[test]
    fn file_name_yields_unit_and_capture_time() {
        let name = parse_bundle_file_name("Extracao_ALFA_SEGUROS_LTDA_2025-01-10_08-30-00_backup.json");
        assert_eq!(name.unit_name.as_deref(), Some("Alfa Seguros Ltda"));
        assert_eq!(
            name.captured_at,
            Some(day(2025, 1, 10).and_hms_opt(8, 30, 0).unwrap())
        );
    }

    #[test]
    fn file_name_without_timestamp_keeps_every_part() {
        let name = parse_bundle_file_name("Extracao_BETA_CORRETORA_backup.json");
        assert_eq!(name.unit_name.as_deref(), Some("Beta Corretora"));
        assert_eq!(name.captured_at, None);
    }

    #[test]
    fn title_case_matches_word_boundaries() {
        assert_eq!(title_case("JOÃO D'ÁVILA-SEGUROS"), "João D'Ávila-Seguros");
    }

    #[test]
    fn non_array_bundles_are_rejected() {
        let err = parse_raw_bundle(br#"{"name": "Clientes"}"#).unwrap_err();
        assert!(matches!(err, BundleParseError::UnexpectedShape(_)));
        let err = parse_raw_bundle(b"[{").unwrap_err();
        assert!(matches!(err, BundleParseError::Json(_)));
    }

    #[test]
    fn legacy_code_page_bundles_are_decoded() {
        let bytes = b"[{\"name\": \"Clientes\", \"data\": [{\"nome\": \"Jos\xE9\"}]}]";
        let raw = parse_raw_bundle(bytes).expect("parse");
        let record = raw.records(SectionKind::Clients).next().unwrap();
        assert_eq!(record["nome"], "José");
    }

    #[test]
    fn id_map_resolves_products_and_proposals() {
        let raw = bundle_from(json!([
            {"name": "Clientes", "data": [
                {"id_cliente": 7, "nome": "Ana", "documento": "CPF: 111.222.333-44"}
            ]},
            {"name": "Status Propostas", "data": [
                {"proposta": "P-1", "id_cliente": 7, "vencimento": "05/01/2025", "valor": "1.234,50"}
            ]},
            {"name": "Produtos Vida", "data": [
                {"id_cliente": 7, "numero_proposta": "P-1", "nome_cobertura": "Morte", "capital_segurado": 50000}
            ]}
        ]));
        let name = parse_bundle_file_name("Extracao_ALFA_2025-01-10_08-30-00_backup.json");
        let bundle = normalize_bundle(&raw, &name, day(2030, 1, 1));

        assert!(bundle.rejected.is_empty(), "{:?}", bundle.rejected);
        assert_eq!(bundle.clients[0].document.digits(), "11122233344");
        assert_eq!(bundle.proposals[0].document.digits(), "11122233344");
        assert_eq!(bundle.proposals[0].amount, 1234.5);
        assert_eq!(bundle.products[0].insured_capital, 50000.0);
        assert_eq!(bundle.products[0].document.digits(), "11122233344");
    }

    #[test]
    fn invalid_records_are_rejected_individually() {
        let raw = bundle_from(json!([
            {"name": "Clientes", "data": [
                {"nome": "Ok", "documento": "12345678900"},
                {"nome": "Short", "documento": "123"},
                {"nome": "Bad date", "documento": "98765432100", "data_nascimento": "32/13/1990"},
                "not an object"
            ]}
        ]));
        let bundle = normalize_bundle(&raw, &parse_bundle_file_name("x_backup.json"), day(2025, 1, 1));

        assert_eq!(bundle.clients.len(), 1);
        assert_eq!(bundle.rejected.len(), 3);
        assert_eq!(
            bundle.rejected.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn bookkeeping_names_the_section_of_each_record() {
        let raw = bundle_from(json!([
            {"name": "Clientes", "data": [{"id_cliente": "c1", "documento": "12345678900"}]},
            {"name": "Produtos Vida", "data": [
                {"id_cliente": "c1", "situacao_produto": "CANCELADO"},
                {"id_cliente": "missing"}
            ]},
            {"name": "Produtos Previdência", "data": [
                {"id_cliente": "c1", "situacao_produto": "Cancelado"},
                {"id_cliente": "missing"}
            ]}
        ]));
        let bundle = normalize_bundle(&raw, &parse_bundle_file_name("x_backup.json"), day(2025, 1, 1));

        let filtered: Vec<_> = bundle.filtered.iter().map(|f| (f.section.as_str(), f.index)).collect();
        assert_eq!(filtered, vec![("Produtos Vida", 0), ("Produtos Previdência", 0)]);
        let rejected: Vec<_> = bundle.rejected.iter().map(|r| (r.section.as_str(), r.index)).collect();
        assert_eq!(rejected, vec![("Produtos Vida", 1), ("Produtos Previdência", 1)]);
    }

    #[test]
    fn proposal_without_due_date_is_rejected() {
        let raw = bundle_from(json!([
            {"name": "Status Propostas", "data": [
                {"proposta": "P-9", "cpf": "12345678900", "vencimento": ""}
            ]}
        ]));
        let bundle = normalize_bundle(&raw, &parse_bundle_file_name("x_backup.json"), day(2025, 1, 1));
        assert!(bundle.proposals.is_empty());
        assert_eq!(bundle.rejected[0].reason, "missing required field `vencimento`");
    }

    #[test]
    fn overdue_is_measured_against_capture_date() {
        let raw = bundle_from(json!([
            {"name": "Pagamentos Pendentes", "data": [
                {"cpf_cliente": "123.456.789-00", "numero_proposta": "P-1", "competencia": "12/2024",
                 "vencimento_original": "01/01/2025", "contribuicao": 10.5},
                {"cpf_cliente": "123.456.789-00", "numero_proposta": "P-2", "competencia": "01/2025",
                 "vencimento_original": "20/01/2025"}
            ]}
        ]));
        let name = parse_bundle_file_name("Extracao_ALFA_2025-01-10_08-30-00_backup.json");
        let bundle = normalize_bundle(&raw, &name, day(2099, 1, 1));

        assert_eq!(bundle.defaulters.len(), 1);
        assert_eq!(bundle.defaulters[0].delay_days, 9);
        assert_eq!(bundle.defaulters[0].certificate_number, "");
        assert_eq!(bundle.filtered.len(), 1);
        assert_eq!(bundle.filtered[0].reason, FilterReason::NotOverdue);
    }

    #[test]
    fn cancelled_products_are_filtered_and_pension_defaults_apply() {
        let raw = bundle_from(json!([
            {"name": "Clientes", "data": [{"id_cliente": "c1", "documento": "12345678900"}]},
            {"name": "Produtos Vida", "data": [
                {"id_cliente": "c1", "situacao_produto": "Cancelado"}
            ]},
            {"name": "Produtos Previdencia", "data": [
                {"id_cliente": "c1", "numero_proposta": "PR-1", "reserva_bruta": "2500,00",
                 "ultima_contribuicao": "2024-12-01"}
            ]}
        ]));
        let bundle = normalize_bundle(&raw, &parse_bundle_file_name("x_backup.json"), day(2025, 1, 1));

        assert_eq!(bundle.filtered[0].reason, FilterReason::Cancelled);
        let pension = &bundle.products[0];
        assert_eq!(pension.line, ProductLine::Pension);
        assert_eq!(pension.certificate_number, "PR-1");
        assert_eq!(pension.coverage_name, "Plano de Previdência");
        assert_eq!(pension.product_status.as_deref(), Some("Ativo"));
        assert_eq!(pension.business_line.as_deref(), Some("Previdência"));
        assert_eq!(pension.insured_capital, 2500.0);
        assert_eq!(pension.last_payment, Some(day(2024, 12, 1)));
        assert_eq!(pension.next_payment, None);
    }

    #[test]
    fn products_need_a_known_client() {
        let raw = bundle_from(json!([
            {"name": "Produtos Vida", "data": [{"id_cliente": "ghost"}]}
        ]));
        let bundle = normalize_bundle(&raw, &parse_bundle_file_name("x_backup.json"), day(2025, 1, 1));
        assert!(bundle.products.is_empty());
        assert_eq!(bundle.rejected[0].category, RecordCategory::Product);
    }

    #[test]
    fn bundle_ids_follow_content() {
        assert_eq!(bundle_id("abc"), bundle_id("abc"));
        assert_ne!(bundle_id("abc"), bundle_id("abd"));
    }
}
