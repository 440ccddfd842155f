//! Roster files: the tabular list of units handed to the extractor.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bsync_core::WorkUnit;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const NAME_COLUMNS: &[&str] = &["nome", "name"];
const ID_COLUMNS: &[&str] = &["cnpj", "id"];

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("roster file {0} not found")]
    Missing(PathBuf),
    #[error("roster file {0} has no units")]
    Empty(PathBuf),
    #[error("roster file {path} has no `{column}` column")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("unsupported roster format for {0} (expected .csv, .yaml, .yml or .json)")]
    UnsupportedFormat(PathBuf),
    #[error("reading roster {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing roster {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterFormat {
    Csv,
    Yaml,
    Json,
}

impl RosterFormat {
    pub fn from_path(path: &Path) -> Result<Self, RosterError> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("csv") => Ok(RosterFormat::Csv),
            Some("yaml") | Some("yml") => Ok(RosterFormat::Yaml),
            Some("json") => Ok(RosterFormat::Json),
            _ => Err(RosterError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Units in file order, plus whether the file carried an identifier column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Roster {
    pub units: Vec<WorkUnit>,
    pub has_ids: bool,
}

pub async fn load_roster(path: &Path) -> Result<Roster, RosterError> {
    let format = RosterFormat::from_path(path)?;
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(RosterError::Missing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(RosterError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let roster = parse_roster(&bytes, format, path)?;
    if roster.units.is_empty() {
        return Err(RosterError::Empty(path.to_path_buf()));
    }
    Ok(roster)
}

pub fn parse_roster(bytes: &[u8], format: RosterFormat, path: &Path) -> Result<Roster, RosterError> {
    let parse_err = |message: String| RosterError::Parse {
        path: path.to_path_buf(),
        message,
    };
    match format {
        RosterFormat::Csv => parse_csv(bytes, path),
        RosterFormat::Yaml => {
            let rows: Vec<HashMap<String, Option<Cell>>> =
                serde_yaml::from_slice(bytes).map_err(|e| parse_err(e.to_string()))?;
            rows_to_roster(rows, path)
        }
        RosterFormat::Json => {
            let rows: Vec<HashMap<String, Option<Cell>>> =
                serde_json::from_slice(bytes).map_err(|e| parse_err(e.to_string()))?;
            rows_to_roster(rows, path)
        }
    }
}

fn parse_csv(bytes: &[u8], path: &Path) -> Result<Roster, RosterError> {
    let header_line = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let delimiter = if header_line.contains(&b';') && !header_line.contains(&b',') {
        b';'
    } else {
        b','
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let parse_err = |err: csv::Error| RosterError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    let headers = reader.headers().map_err(parse_err)?.clone();
    let find = |candidates: &[&str]| {
        headers.iter().position(|header| {
            let header = header.trim_start_matches('\u{feff}');
            candidates.iter().any(|c| header.eq_ignore_ascii_case(c))
        })
    };
    let name_col = find(NAME_COLUMNS).ok_or_else(|| RosterError::MissingColumn {
        path: path.to_path_buf(),
        column: "nome",
    })?;
    let id_col = find(ID_COLUMNS);

    let mut units = Vec::new();
    for record in reader.records() {
        let record = record.map_err(parse_err)?;
        let name = record.get(name_col).unwrap_or_default();
        let id = id_col.and_then(|col| record.get(col));
        if let Some(unit) = make_unit(name, id) {
            units.push(unit);
        }
    }
    Ok(Roster {
        units,
        has_ids: id_col.is_some(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Cell {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
}

impl Cell {
    fn into_text(self) -> String {
        match self {
            Cell::Text(text) => text,
            Cell::Integer(value) => value.to_string(),
            Cell::Float(value) => value.to_string(),
            Cell::Flag(value) => value.to_string(),
        }
    }
}

fn rows_to_roster(rows: Vec<HashMap<String, Option<Cell>>>, path: &Path) -> Result<Roster, RosterError> {
    let mut units = Vec::new();
    let mut has_ids = false;
    let mut saw_name_column = rows.is_empty();

    for row in rows {
        let mut name = None;
        let mut id = None;
        for (key, cell) in row {
            let key = key.trim();
            if NAME_COLUMNS.iter().any(|c| key.eq_ignore_ascii_case(c)) {
                saw_name_column = true;
                name = cell.map(Cell::into_text);
            } else if ID_COLUMNS.iter().any(|c| key.eq_ignore_ascii_case(c)) {
                has_ids = true;
                id = cell.map(Cell::into_text);
            }
        }
        if let Some(unit) = make_unit(name.as_deref().unwrap_or_default(), id.as_deref()) {
            units.push(unit);
        }
    }

    if !saw_name_column {
        return Err(RosterError::MissingColumn {
            path: path.to_path_buf(),
            column: "nome",
        });
    }
    Ok(Roster { units, has_ids })
}

fn make_unit(name: &str, id: Option<&str>) -> Option<WorkUnit> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    match id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => Some(WorkUnit::new(id, name)),
        None => Some(WorkUnit::named(name)),
    }
}

#[derive(Debug, Serialize)]
struct RosterRowOut<'a> {
    nome: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cnpj: Option<&'a str>,
}

/// Render units with the same columns the input roster used.
pub fn render_roster(units: &[WorkUnit], has_ids: bool, format: RosterFormat) -> anyhow::Result<Vec<u8>> {
    let rows: Vec<RosterRowOut<'_>> = units
        .iter()
        .map(|unit| RosterRowOut {
            nome: &unit.name,
            cnpj: has_ids.then(|| unit.roster_id.as_deref().unwrap_or_default()),
        })
        .collect();

    let bytes = match format {
        RosterFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            if has_ids {
                writer.write_record(["nome", "cnpj"])?;
            } else {
                writer.write_record(["nome"])?;
            }
            for row in &rows {
                match row.cnpj {
                    Some(cnpj) => writer.write_record([row.nome, cnpj])?,
                    None => writer.write_record([row.nome])?,
                }
            }
            writer.into_inner().map_err(|err| anyhow::anyhow!(err.to_string()))?
        }
        RosterFormat::Yaml => serde_yaml::to_string(&rows)?.into_bytes(),
        RosterFormat::Json => serde_json::to_vec_pretty(&rows)?,
    };
    Ok(bytes)
}
