// 📦 Staging Loader - award transactions from the spending system
//
// Two staging tables (grants, contracts), each keyed by the spending system's
// unique transaction key. Initial snapshots insert every row; delta files
// carry `correction_delete_ind` (D = delete, C = upsert in place).
//
// One transaction per input file. Malformed rows are skipped with a warning,
// a missing file is a no-op, and a file that fails midway rolls back without
// affecting files committed before it.

use crate::db::{Store, TableSpec};
use crate::error::ReconError;
use crate::sources::parse_amount;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ============================================================================
// STAGING TABLES
// ============================================================================

pub const ASSISTANCE_STAGING: TableSpec = TableSpec::new(
    "usaspending_assistance",
    "CREATE TABLE IF NOT EXISTS {table} (
        assistance_transaction_unique_key TEXT PRIMARY KEY,
        assistance_award_unique_key TEXT,
        federal_action_obligation REAL NOT NULL DEFAULT 0,
        total_outlayed_amount_for_overall_award REAL NOT NULL DEFAULT 0,
        action_date_fiscal_year INTEGER,
        prime_award_transaction_place_of_performance_cd_current TEXT,
        cfda_number TEXT,
        assistance_type_code TEXT
    )",
    &["CREATE INDEX IF NOT EXISTS idx_{table}_program ON {table}(cfda_number, action_date_fiscal_year)"],
);

pub const CONTRACT_STAGING: TableSpec = TableSpec::new(
    "usaspending_contract",
    "CREATE TABLE IF NOT EXISTS {table} (
        contract_transaction_unique_key TEXT PRIMARY KEY,
        contract_award_unique_key TEXT,
        federal_action_obligation REAL NOT NULL DEFAULT 0,
        total_outlayed_amount_for_overall_award REAL NOT NULL DEFAULT 0,
        action_date_fiscal_year INTEGER,
        prime_award_transaction_place_of_performance_cd_current TEXT,
        funding_agency_code TEXT,
        funding_agency_name TEXT,
        funding_sub_agency_code TEXT,
        funding_sub_agency_name TEXT,
        funding_office_code TEXT,
        funding_office_name TEXT,
        award_type_code TEXT
    )",
    &["CREATE INDEX IF NOT EXISTS idx_{table}_office ON {table}(funding_office_code, action_date_fiscal_year)"],
);

const UPSERT_ASSISTANCE: &str = "INSERT INTO usaspending_assistance (
        assistance_transaction_unique_key, assistance_award_unique_key,
        federal_action_obligation, total_outlayed_amount_for_overall_award,
        action_date_fiscal_year, prime_award_transaction_place_of_performance_cd_current,
        cfda_number, assistance_type_code
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(assistance_transaction_unique_key) DO UPDATE SET
        assistance_award_unique_key = excluded.assistance_award_unique_key,
        federal_action_obligation = excluded.federal_action_obligation,
        total_outlayed_amount_for_overall_award = excluded.total_outlayed_amount_for_overall_award,
        action_date_fiscal_year = excluded.action_date_fiscal_year,
        prime_award_transaction_place_of_performance_cd_current =
            excluded.prime_award_transaction_place_of_performance_cd_current,
        cfda_number = excluded.cfda_number,
        assistance_type_code = excluded.assistance_type_code";

const UPSERT_CONTRACT: &str = "INSERT INTO usaspending_contract (
        contract_transaction_unique_key, contract_award_unique_key,
        federal_action_obligation, total_outlayed_amount_for_overall_award,
        action_date_fiscal_year, prime_award_transaction_place_of_performance_cd_current,
        funding_agency_code, funding_agency_name, funding_sub_agency_code,
        funding_sub_agency_name, funding_office_code, funding_office_name, award_type_code
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
    ON CONFLICT(contract_transaction_unique_key) DO UPDATE SET
        contract_award_unique_key = excluded.contract_award_unique_key,
        federal_action_obligation = excluded.federal_action_obligation,
        total_outlayed_amount_for_overall_award = excluded.total_outlayed_amount_for_overall_award,
        action_date_fiscal_year = excluded.action_date_fiscal_year,
        prime_award_transaction_place_of_performance_cd_current =
            excluded.prime_award_transaction_place_of_performance_cd_current,
        funding_agency_code = excluded.funding_agency_code,
        funding_agency_name = excluded.funding_agency_name,
        funding_sub_agency_code = excluded.funding_sub_agency_code,
        funding_sub_agency_name = excluded.funding_sub_agency_name,
        funding_office_code = excluded.funding_office_code,
        funding_office_name = excluded.funding_office_name,
        award_type_code = excluded.award_type_code";

// ============================================================================
// AWARD KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwardKind {
    /// Grants and other financial assistance (carry a registry program number)
    Assistance,
    /// Procurement contracts (carry funding office identifiers)
    Contract,
}

impl AwardKind {
    pub fn table(&self) -> &'static TableSpec {
        match self {
            AwardKind::Assistance => &ASSISTANCE_STAGING,
            AwardKind::Contract => &CONTRACT_STAGING,
        }
    }

    pub fn key_column(&self) -> &'static str {
        match self {
            AwardKind::Assistance => "assistance_transaction_unique_key",
            AwardKind::Contract => "contract_transaction_unique_key",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AwardKind::Assistance => "assistance",
            AwardKind::Contract => "contract",
        }
    }
}

// ============================================================================
// STAGED TRANSACTION
// ============================================================================

/// One live row per transaction key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedTransaction {
    pub transaction_key: String,
    pub award_key: Option<String>,
    pub obligation: f64,
    pub outlay: f64,
    pub fiscal_year: Option<i64>,
    pub place_of_performance: Option<String>,
    pub detail: AwardDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwardDetail {
    Grant {
        cfda_number: Option<String>,
        assistance_type_code: Option<String>,
    },
    Contract {
        funding_agency_code: Option<String>,
        funding_agency_name: Option<String>,
        funding_sub_agency_code: Option<String>,
        funding_sub_agency_name: Option<String>,
        funding_office_code: Option<String>,
        funding_office_name: Option<String>,
        award_type_code: Option<String>,
    },
}

impl StagedTransaction {
    pub fn kind(&self) -> AwardKind {
        match self.detail {
            AwardDetail::Grant { .. } => AwardKind::Assistance,
            AwardDetail::Contract { .. } => AwardKind::Contract,
        }
    }

    /// Insert, or replace in place when the key is already staged.
    /// Returns true when the key was new.
    pub fn upsert(&self, conn: &Connection) -> Result<bool> {
        let existed = is_staged(conn, self.kind(), &self.transaction_key)?;
        match &self.detail {
            AwardDetail::Grant {
                cfda_number,
                assistance_type_code,
            } => {
                conn.execute(
                    UPSERT_ASSISTANCE,
                    params![
                        self.transaction_key,
                        self.award_key,
                        self.obligation,
                        self.outlay,
                        self.fiscal_year,
                        self.place_of_performance,
                        cfda_number,
                        assistance_type_code,
                    ],
                )?;
            }
            AwardDetail::Contract {
                funding_agency_code,
                funding_agency_name,
                funding_sub_agency_code,
                funding_sub_agency_name,
                funding_office_code,
                funding_office_name,
                award_type_code,
            } => {
                conn.execute(
                    UPSERT_CONTRACT,
                    params![
                        self.transaction_key,
                        self.award_key,
                        self.obligation,
                        self.outlay,
                        self.fiscal_year,
                        self.place_of_performance,
                        funding_agency_code,
                        funding_agency_name,
                        funding_sub_agency_code,
                        funding_sub_agency_name,
                        funding_office_code,
                        funding_office_name,
                        award_type_code,
                    ],
                )?;
            }
        }
        Ok(!existed)
    }
}

fn is_staged(conn: &Connection, kind: AwardKind, key: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE {} = ?1",
                kind.table().name,
                kind.key_column()
            ),
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Remove the row for `key`; returns the number of rows removed (0 or 1)
pub fn delete_staged(conn: &Connection, kind: AwardKind, key: &str) -> Result<usize> {
    let removed = conn.execute(
        &format!(
            "DELETE FROM {} WHERE {} = ?1",
            kind.table().name,
            kind.key_column()
        ),
        [key],
    )?;
    Ok(removed)
}

// ============================================================================
// RAW CSV ROW
// ============================================================================

/// Column set shared by grant and contract files; extra columns are ignored
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAwardRow {
    assistance_transaction_unique_key: Option<String>,
    assistance_award_unique_key: Option<String>,
    contract_transaction_unique_key: Option<String>,
    contract_award_unique_key: Option<String>,
    federal_action_obligation: Option<String>,
    total_outlayed_amount_for_overall_award: Option<String>,
    action_date_fiscal_year: Option<String>,
    prime_award_transaction_place_of_performance_cd_current: Option<String>,
    cfda_number: Option<String>,
    assistance_type_code: Option<String>,
    funding_agency_code: Option<String>,
    funding_agency_name: Option<String>,
    funding_sub_agency_code: Option<String>,
    funding_sub_agency_name: Option<String>,
    funding_office_code: Option<String>,
    funding_office_name: Option<String>,
    award_type_code: Option<String>,
    correction_delete_ind: Option<String>,
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionIndicator {
    Delete,
    Change,
}

impl CorrectionIndicator {
    /// `D` deletes; `C` or blank upserts
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw.map(str::trim).unwrap_or("") {
            "D" | "d" => Some(CorrectionIndicator::Delete),
            "C" | "c" | "" => Some(CorrectionIndicator::Change),
            _ => None,
        }
    }
}

impl RawAwardRow {
    fn transaction_key(&self, kind: AwardKind) -> Option<String> {
        let key = match kind {
            AwardKind::Assistance => &self.assistance_transaction_unique_key,
            AwardKind::Contract => &self.contract_transaction_unique_key,
        };
        present(key.clone())
    }

    fn into_staged(self, kind: AwardKind, source_name: &str) -> Result<StagedTransaction, ReconError> {
        let transaction_key = self
            .transaction_key(kind)
            .ok_or_else(|| ReconError::malformed(source_name, "missing transaction key"))?;

        let obligation = parse_amount(
            source_name,
            "federal_action_obligation",
            self.federal_action_obligation.as_deref(),
        )?;
        let outlay = parse_amount(
            source_name,
            "total_outlayed_amount_for_overall_award",
            self.total_outlayed_amount_for_overall_award.as_deref(),
        )?;
        let fiscal_year = match present(self.action_date_fiscal_year) {
            None => None,
            Some(year) => Some(year.parse::<i64>().map_err(|_| {
                ReconError::malformed(source_name, format!("fiscal year is not an integer: '{}'", year))
            })?),
        };
        let place_of_performance = present(self.prime_award_transaction_place_of_performance_cd_current);

        let (award_key, detail) = match kind {
            AwardKind::Assistance => (
                present(self.assistance_award_unique_key),
                AwardDetail::Grant {
                    cfda_number: present(self.cfda_number),
                    assistance_type_code: present(self.assistance_type_code),
                },
            ),
            AwardKind::Contract => (
                present(self.contract_award_unique_key),
                AwardDetail::Contract {
                    funding_agency_code: present(self.funding_agency_code),
                    funding_agency_name: present(self.funding_agency_name),
                    funding_sub_agency_code: present(self.funding_sub_agency_code),
                    funding_sub_agency_name: present(self.funding_sub_agency_name),
                    funding_office_code: present(self.funding_office_code),
                    funding_office_name: present(self.funding_office_name),
                    award_type_code: present(self.award_type_code),
                },
            ),
        };

        Ok(StagedTransaction {
            transaction_key,
            award_key,
            obligation,
            outlay,
            fiscal_year,
            place_of_performance,
            detail,
        })
    }
}

// ============================================================================
// FILE REPORTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Initial,
    Delta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FileOutcome {
    Committed,
    Missing,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub kind: AwardKind,
    pub mode: LoadMode,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub outcome: FileOutcome,
}

impl FileReport {
    fn new(path: &Path, kind: AwardKind, mode: LoadMode) -> Self {
        FileReport {
            path: path.to_path_buf(),
            kind,
            mode,
            inserted: 0,
            updated: 0,
            deleted: 0,
            skipped: 0,
            outcome: FileOutcome::Committed,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.outcome == FileOutcome::Committed
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RowCounts {
    inserted: usize,
    updated: usize,
    deleted: usize,
    skipped: usize,
}

// ============================================================================
// STAGING LOADER
// ============================================================================

pub struct StagingLoader<'a> {
    store: &'a mut Store,
}

impl<'a> StagingLoader<'a> {
    pub fn new(store: &'a mut Store) -> Self {
        StagingLoader { store }
    }

    /// Insert every row of full-snapshot files (re-staging a key replaces it)
    pub fn load_initial(&mut self, kind: AwardKind, files: &[PathBuf]) -> Vec<FileReport> {
        files
            .iter()
            .map(|path| self.load_file(kind, LoadMode::Initial, path))
            .collect()
    }

    /// Apply delete/change records in file order
    pub fn load_delta(&mut self, kind: AwardKind, files: &[PathBuf]) -> Vec<FileReport> {
        files
            .iter()
            .map(|path| self.load_file(kind, LoadMode::Delta, path))
            .collect()
    }

    fn load_file(&mut self, kind: AwardKind, mode: LoadMode, path: &Path) -> FileReport {
        let mut report = FileReport::new(path, kind, mode);

        if !path.exists() {
            warn!(file = %path.display(), "staging input not found, skipping");
            report.outcome = FileOutcome::Missing;
            return report;
        }

        let unit = format!("staging:{}:{}", kind.as_str(), path.display());
        match self
            .store
            .unit(&unit, |conn| apply_file(conn, kind, mode, path))
        {
            Ok(counts) => {
                info!(
                    file = %path.display(),
                    kind = kind.as_str(),
                    inserted = counts.inserted,
                    updated = counts.updated,
                    deleted = counts.deleted,
                    skipped = counts.skipped,
                    "staging file committed"
                );
                report.inserted = counts.inserted;
                report.updated = counts.updated;
                report.deleted = counts.deleted;
                report.skipped = counts.skipped;
            }
            Err(e) => {
                report.outcome = FileOutcome::Failed(format!("{:#}", e));
            }
        }
        report
    }
}

fn apply_file(conn: &Connection, kind: AwardKind, mode: LoadMode, path: &Path) -> Result<RowCounts> {
    kind.table().ensure(conn)?;

    let source_name = path.display().to_string();
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", source_name))?;

    let mut counts = RowCounts::default();

    for (idx, result) in rdr.deserialize::<RawAwardRow>().enumerate() {
        let line = idx + 2;
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                warn!(file = %source_name, line, error = %e, "skipping unreadable row");
                counts.skipped += 1;
                continue;
            }
        };

        let indicator = match mode {
            LoadMode::Initial => CorrectionIndicator::Change,
            LoadMode::Delta => match CorrectionIndicator::parse(raw.correction_delete_ind.as_deref()) {
                Some(indicator) => indicator,
                None => {
                    warn!(
                        file = %source_name,
                        line,
                        indicator = ?raw.correction_delete_ind,
                        "skipping row with unknown correction indicator"
                    );
                    counts.skipped += 1;
                    continue;
                }
            },
        };

        if indicator == CorrectionIndicator::Delete {
            match raw.transaction_key(kind) {
                Some(key) => counts.deleted += delete_staged(conn, kind, &key)?,
                None => {
                    warn!(file = %source_name, line, "skipping delete without transaction key");
                    counts.skipped += 1;
                }
            }
            continue;
        }

        match raw.into_staged(kind, &source_name) {
            Ok(staged) => {
                if staged.upsert(conn)? {
                    counts.inserted += 1;
                } else {
                    counts.updated += 1;
                }
            }
            Err(e) => {
                warn!(file = %source_name, line, error = %e, "skipping malformed row");
                counts.skipped += 1;
            }
        }
    }

    Ok(counts)
}

/// CSV files directly inside `dir`, in lexical order; a missing directory is empty
pub fn source_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        info!(dir = %dir.display(), "no staging directory");
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|ext| ext.eq_ignore_ascii_case("csv"))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Read back one staged row (used by tests and audits)
pub fn get_staged(conn: &Connection, kind: AwardKind, key: &str) -> Result<Option<StagedTransaction>> {
    if !crate::db::table_exists(conn, kind.table().name)? {
        return Ok(None);
    }
    let staged = match kind {
        AwardKind::Assistance => conn
            .query_row(
                "SELECT assistance_transaction_unique_key, assistance_award_unique_key,
                        federal_action_obligation, total_outlayed_amount_for_overall_award,
                        action_date_fiscal_year,
                        prime_award_transaction_place_of_performance_cd_current,
                        cfda_number, assistance_type_code
                 FROM usaspending_assistance WHERE assistance_transaction_unique_key = ?1",
                [key],
                |row| {
                    Ok(StagedTransaction {
                        transaction_key: row.get(0)?,
                        award_key: row.get(1)?,
                        obligation: row.get(2)?,
                        outlay: row.get(3)?,
                        fiscal_year: row.get(4)?,
                        place_of_performance: row.get(5)?,
                        detail: AwardDetail::Grant {
                            cfda_number: row.get(6)?,
                            assistance_type_code: row.get(7)?,
                        },
                    })
                },
            )
            .optional()?,
        AwardKind::Contract => conn
            .query_row(
                "SELECT contract_transaction_unique_key, contract_award_unique_key,
                        federal_action_obligation, total_outlayed_amount_for_overall_award,
                        action_date_fiscal_year,
                        prime_award_transaction_place_of_performance_cd_current,
                        funding_agency_code, funding_agency_name, funding_sub_agency_code,
                        funding_sub_agency_name, funding_office_code, funding_office_name,
                        award_type_code
                 FROM usaspending_contract WHERE contract_transaction_unique_key = ?1",
                [key],
                |row| {
                    Ok(StagedTransaction {
                        transaction_key: row.get(0)?,
                        award_key: row.get(1)?,
                        obligation: row.get(2)?,
                        outlay: row.get(3)?,
                        fiscal_year: row.get(4)?,
                        place_of_performance: row.get(5)?,
                        detail: AwardDetail::Contract {
                            funding_agency_code: row.get(6)?,
                            funding_agency_name: row.get(7)?,
                            funding_sub_agency_code: row.get(8)?,
                            funding_sub_agency_name: row.get(9)?,
                            funding_office_code: row.get(10)?,
                            funding_office_name: row.get(11)?,
                            award_type_code: row.get(12)?,
                        },
                    })
                },
            )
            .optional()?,
    };
    Ok(staged)
}
