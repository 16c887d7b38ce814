//! File-backed status ledger.
//!
//! One CSV row per target with the columns in [`LEDGER_COLUMNS`]. Every
//! upsert rewrites the whole file to `<path>.tmp`, syncs it, and renames it
//! over the previous ledger, so the file on disk is always a complete
//! snapshot. The ledger is single-writer: one engine per path.

use crate::error::{Error, Result};
use crate::graph::KitGraph;
use crate::types::{Status, StatusRecord, TargetId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LEDGER_COLUMNS: [&str; 7] = [
    "target_id",
    "kit",
    "status",
    "exit_code",
    "started_at",
    "finished_at",
    "output_path",
];

/// Records as loaded from disk, keyed by identity.
pub type LedgerRecords = HashMap<TargetId, StatusRecord>;

#[derive(Debug)]
pub struct StatusLedger {
    path: PathBuf,
    rows: Vec<StatusRecord>,
    index: HashMap<TargetId, usize>,
}

impl StatusLedger {
    /// Read the ledger at `path`. A missing file is an empty ledger; anything
    /// unreadable is a [`Error::StateCorruptionError`], never silently dropped.
    pub fn load(path: &Path) -> Result<LedgerRecords> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no ledger yet");
                return Ok(LedgerRecords::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let header = reader
            .headers()
            .map_err(|e| csv_corruption(path, &e))?
            .clone();
        if header.iter().ne(LEDGER_COLUMNS.iter().copied()) {
            return Err(Error::corruption(
                path,
                Some(1),
                format!(
                    "expected header '{}', found '{}'",
                    LEDGER_COLUMNS.join(","),
                    header.iter().collect::<Vec<_>>().join(",")
                ),
            ));
        }

        let mut records = LedgerRecords::new();
        for row in reader.records() {
            let row = row.map_err(|e| csv_corruption(path, &e))?;
            let line = row.position().map(|p| p.line());
            let record = parse_row(&row).map_err(|reason| Error::corruption(path, line, reason))?;
            if records.contains_key(&record.id) {
                return Err(Error::corruption(
                    path,
                    line,
                    format!("duplicate row for {}", record.id),
                ));
            }
            records.insert(record.id.clone(), record);
        }

        debug!(path = %path.display(), rows = records.len(), "ledger loaded");
        Ok(records)
    }

    /// Initial status map for a run, one record per graph node in node order.
    ///
    /// Targets missing from the ledger start PENDING. RUNNING rows are left
    /// over from a run that never finished and go back to PENDING. Rows for
    /// identities no longer in the graph are dropped. Output paths always
    /// come from the current definitions.
    pub fn reconcile(graph: &KitGraph, mut loaded: LedgerRecords) -> Vec<StatusRecord> {
        let records: Vec<StatusRecord> = graph
            .targets()
            .iter()
            .map(|target| match loaded.remove(&target.id) {
                Some(mut rec) => {
                    if rec.status == Status::Running {
                        debug!(id = %rec.id, "interrupted target reset to PENDING");
                        rec.reset();
                    }
                    rec.output_path = target.output_path.clone();
                    rec
                }
                None => StatusRecord::pending(target.id.clone(), target.output_path.clone()),
            })
            .collect();

        if !loaded.is_empty() {
            debug!(stale = loaded.len(), "dropping ledger rows for targets not in this request");
        }
        records
    }

    /// In-memory ledger seeded with `rows`. Nothing is written until the first upsert.
    pub fn new(path: impl Into<PathBuf>, rows: Vec<StatusRecord>) -> Self {
        let index = rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Self {
            path: path.into(),
            rows,
            index,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[StatusRecord] {
        &self.rows
    }

    pub fn get(&self, id: &TargetId) -> Option<&StatusRecord> {
        self.index.get(id).map(|&i| &self.rows[i])
    }

    /// Replace (or append) one record and durably commit the whole ledger.
    pub fn upsert(&mut self, record: StatusRecord) -> Result<()> {
        match self.index.get(&record.id) {
            Some(&i) => self.rows[i] = record,
            None => {
                self.index.insert(record.id.clone(), self.rows.len());
                self.rows.push(record);
            }
        }
        self.commit()
    }

    fn commit(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = tmp_path(&self.path);
        let mut writer = csv::Writer::from_writer(File::create(&tmp)?);
        writer
            .write_record(LEDGER_COLUMNS)
            .map_err(std::io::Error::from)?;
        for rec in &self.rows {
            writer
                .write_record(render_row(rec))
                .map_err(std::io::Error::from)?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), rows = self.rows.len(), "ledger committed");
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn csv_corruption(path: &Path, err: &csv::Error) -> Error {
    let line = err.position().map(|p| p.line());
    Error::corruption(path, line, err.to_string())
}

fn render_row(rec: &StatusRecord) -> [String; 7] {
    [
        rec.id.to_string(),
        rec.id.kit().to_string(),
        rec.status.to_string(),
        rec.exit_code.map(|c| c.to_string()).unwrap_or_default(),
        render_time(rec.started_at),
        render_time(rec.finished_at),
        rec.output_path.display().to_string(),
    ]
}

fn render_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_default()
}

fn parse_row(row: &csv::StringRecord) -> std::result::Result<StatusRecord, String> {
    if row.len() != LEDGER_COLUMNS.len() {
        return Err(format!(
            "expected {} columns, found {}",
            LEDGER_COLUMNS.len(),
            row.len()
        ));
    }

    let id = TargetId::parse(&row[0]).ok_or_else(|| format!("invalid target id '{}'", &row[0]))?;
    if id.kit() != &row[1] {
        return Err(format!("kit column '{}' does not match {}", &row[1], id));
    }
    let status = Status::from_token(&row[2]).ok_or_else(|| format!("unknown status '{}'", &row[2]))?;
    let exit_code = match &row[3] {
        "" => None,
        s => Some(
            s.parse::<i32>()
                .map_err(|_| format!("invalid exit code '{s}'"))?,
        ),
    };

    Ok(StatusRecord {
        id,
        status,
        exit_code,
        started_at: parse_time(&row[4])?,
        finished_at: parse_time(&row[5])?,
        output_path: PathBuf::from(&row[6]),
    })
}

fn parse_time(s: &str) -> std::result::Result<Option<DateTime<Utc>>, String> {
    if s.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| format!("invalid timestamp '{s}': {e}"))
}
