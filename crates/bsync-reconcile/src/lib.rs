//! Execution-log reconciliation: which roster units still need an extraction run.

use std::collections::{BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bsync_core::{decode_text, LogEvent, Outcome, RetryRoster, WorkUnit};
use bsync_storage::write_atomic;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

mod roster;

pub use roster::{load_roster, parse_roster, render_roster, Roster, RosterError, RosterFormat};

pub const CRATE_NAME: &str = "bsync-reconcile";

pub const DEFAULT_EXCLUDED_UNIT: &str = "OUTLIER CORRETORA LTDA";

const COMPLETED_PATTERN: &str = r"Extração concluída para (.*)!";
const STARTED_PATTERN: &str = r"PROCESSANDO CORRETORA\s+\d+/\d+:\s*(.+)";
const FAILED_PATTERN: &str = r"ERRO CRÍTICO ao processar (.+?):\s*(.*)";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error("completed-marker pattern `{pattern}` is invalid: {reason}")]
    Marker { pattern: String, reason: String },
    #[error("reading execution log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing retry roster {path}: {message}")]
    Write { path: PathBuf, message: String },
}

fn compile(pattern: &str) -> Result<Regex, ReconcileError> {
    Regex::new(pattern).map_err(|err| ReconcileError::Marker {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    })
}

/// Patterns recognized in the extractor's log. Only `completed` drives the retry roster.
#[derive(Debug, Clone)]
pub struct LogMarkers {
    completed: Regex,
    started: Regex,
    failed: Regex,
}

impl LogMarkers {
    pub fn standard() -> Result<Self, ReconcileError> {
        Ok(Self {
            completed: compile(COMPLETED_PATTERN)?,
            started: compile(STARTED_PATTERN)?,
            failed: compile(FAILED_PATTERN)?,
        })
    }

    /// The pattern's first capture group must hold the unit display name.
    pub fn with_completed_pattern(pattern: &str) -> Result<Self, ReconcileError> {
        let completed = compile(pattern)?;
        if completed.captures_len() < 2 {
            return Err(ReconcileError::Marker {
                pattern: pattern.to_string(),
                reason: "no capture group for the unit name".to_string(),
            });
        }
        Ok(Self {
            completed,
            ..Self::standard()?
        })
    }

    fn classify(&self, line: &str, line_no: usize) -> Option<LogEvent> {
        let event = |unit: &str, outcome, detail: Option<&str>| {
            let unit = unit.trim();
            (!unit.is_empty()).then(|| LogEvent {
                unit: unit.to_string(),
                outcome,
                detail: detail.map(str::trim).filter(|d| !d.is_empty()).map(str::to_string),
                line_no,
            })
        };

        if let Some(caps) = self.completed.captures(line) {
            return event(caps.get(1)?.as_str(), Outcome::Completed, None);
        }
        if let Some(caps) = self.failed.captures(line) {
            return event(
                caps.get(1)?.as_str(),
                Outcome::Failed,
                caps.get(2).map(|m| m.as_str()),
            );
        }
        if let Some(caps) = self.started.captures(line) {
            return event(caps.get(1)?.as_str(), Outcome::Started, None);
        }
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionLog {
    events: Vec<LogEvent>,
    skipped_lines: usize,
}

impl ExecutionLog {
    /// Each line is decoded on its own (UTF-8, else Windows-1252), so a log
    /// appended to by hosts with different code pages still parses.
    /// Unrecognized lines are counted, never fatal. Blank lines are ignored.
    pub fn parse(bytes: &[u8], markers: &LogMarkers) -> Self {
        let mut log = Self::default();
        for (idx, raw) in bytes.split(|b| *b == b'\n').enumerate() {
            let line = decode_text(raw);
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            match markers.classify(line, idx + 1) {
                Some(event) => log.events.push(event),
                None => log.skipped_lines += 1,
            }
        }
        log
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Names with at least one completed event, regardless of any failures around it.
    pub fn completed_units(&self) -> HashSet<&str> {
        self.events
            .iter()
            .filter(|event| event.outcome == Outcome::Completed)
            .map(|event| event.unit.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub retry: RetryRoster,
    pub roster_size: usize,
    pub completed: usize,
    /// Completed names that match nothing in the roster, sorted.
    pub stale_log_units: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    excluded: HashSet<String>,
}

impl Reconciler {
    pub fn new<I, S>(excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            excluded: excluded
                .into_iter()
                .map(|name| name.as_ref().trim().to_lowercase())
                .filter(|name| !name.is_empty())
                .collect(),
        }
    }

    /// Dedup by identifier (first occurrence wins) and drop excluded units.
    pub fn prepare_roster(&self, units: &[WorkUnit]) -> Vec<WorkUnit> {
        let mut seen = HashSet::new();
        units
            .iter()
            .filter(|unit| !self.excluded.contains(&unit.name.trim().to_lowercase()))
            .filter(|unit| seen.insert(unit.id.trim().to_string()))
            .cloned()
            .collect()
    }

    pub fn reconcile(&self, roster: &[WorkUnit], log: &ExecutionLog) -> Reconciliation {
        let prepared = self.prepare_roster(roster);
        let completed = log.completed_units();

        let is_done = |unit: &WorkUnit| {
            completed.contains(unit.name.trim()) || completed.contains(unit.id.trim())
        };
        let pending: Vec<WorkUnit> = prepared.iter().filter(|u| !is_done(u)).cloned().collect();

        let known: HashSet<&str> = roster
            .iter()
            .flat_map(|unit| [unit.name.trim(), unit.id.trim()])
            .collect();
        let stale_log_units: BTreeSet<&str> = completed
            .iter()
            .copied()
            .filter(|name| !known.contains(name))
            .collect();

        Reconciliation {
            roster_size: prepared.len(),
            completed: prepared.len() - pending.len(),
            retry: RetryRoster::new(pending),
            stale_log_units: stale_log_units.into_iter().map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Pending { retry: RetryRoster },
    NothingToRetry,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    pub roster_size: usize,
    pub completed: usize,
    pub pending: usize,
    pub stale_log_units: Vec<String>,
    pub skipped_lines: usize,
    pub retry_roster_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub roster_path: PathBuf,
    pub log_path: PathBuf,
    pub retry_roster_path: PathBuf,
    pub excluded_names: Vec<String>,
    pub completed_marker: Option<String>,
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        Self {
            roster_path: std::env::var("BSYNC_ROSTER")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("corretoras.csv")),
            log_path: std::env::var("BSYNC_EXECUTION_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("execucoes.log")),
            retry_roster_path: std::env::var("BSYNC_RETRY_ROSTER")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("corretoras_para_rerodar.csv")),
            excluded_names: std::env::var("BSYNC_EXCLUDED_UNITS")
                .map(|raw| parse_name_list(&raw))
                .unwrap_or_else(|_| vec![DEFAULT_EXCLUDED_UNIT.to_string()]),
            completed_marker: std::env::var("BSYNC_COMPLETED_PATTERN")
                .ok()
                .filter(|p| !p.trim().is_empty()),
        }
    }
}

pub fn parse_name_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

async fn read_execution_log(path: &Path, markers: &LogMarkers) -> Result<ExecutionLog, ReconcileError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(ExecutionLog::parse(&bytes, markers)),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "execution log not found; every roster unit will be retried");
            Ok(ExecutionLog::default())
        }
        Err(source) => Err(ReconcileError::Log {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Load roster and log, compute the retry set and rewrite (or clear) the retry roster file.
pub async fn run_reconcile(config: &ReconcileConfig) -> Result<ReconcileReport, ReconcileError> {
    let span = info_span!("reconcile", roster = %config.roster_path.display());
    reconcile_files(config).instrument(span).await
}

async fn reconcile_files(config: &ReconcileConfig) -> Result<ReconcileReport, ReconcileError> {
    let output_format = RosterFormat::from_path(&config.retry_roster_path)?;
    let roster = load_roster(&config.roster_path).await?;
    let markers = match config.completed_marker.as_deref() {
        Some(pattern) => LogMarkers::with_completed_pattern(pattern)?,
        None => LogMarkers::standard()?,
    };
    let log = read_execution_log(&config.log_path, &markers).await?;
    if log.skipped_lines() > 0 {
        info!(skipped = log.skipped_lines(), "ignored unrecognized execution log lines");
    }

    let reconciliation = Reconciler::new(&config.excluded_names).reconcile(&roster.units, &log);
    for name in &reconciliation.stale_log_units {
        warn!(unit = %name, "completed unit in log is not in the roster");
    }

    let write_err = |message: String| ReconcileError::Write {
        path: config.retry_roster_path.clone(),
        message,
    };
    let pending = reconciliation.retry.len();
    let outcome = if reconciliation.retry.is_empty() {
        match tokio::fs::remove_file(&config.retry_roster_path).await {
            Ok(()) => info!(path = %config.retry_roster_path.display(), "removed stale retry roster"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(write_err(err.to_string())),
        }
        ReconcileOutcome::NothingToRetry
    } else {
        let bytes = render_roster(reconciliation.retry.units(), roster.has_ids, output_format)
            .map_err(|err| write_err(format!("{err:#}")))?;
        write_atomic(&config.retry_roster_path, &bytes)
            .await
            .map_err(|err| write_err(format!("{err:#}")))?;
        ReconcileOutcome::Pending {
            retry: reconciliation.retry,
        }
    };

    info!(
        roster_size = reconciliation.roster_size,
        completed = reconciliation.completed,
        pending,
        "reconciliation finished"
    );

    Ok(ReconcileReport {
        outcome,
        roster_size: reconciliation.roster_size,
        completed: reconciliation.completed,
        pending,
        stale_log_units: reconciliation.stale_log_units,
        skipped_lines: log.skipped_lines(),
        retry_roster_path: config.retry_roster_path.clone(),
    })
}
