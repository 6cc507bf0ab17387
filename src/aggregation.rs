// 📊 Aggregation Engine - obligation and outlay summaries from staging
//
// Grants group by (program number, fiscal year, assistance type); contracts
// carry no program number and group by (funding office, fiscal year). Each
// pass rebuilds its tables through shadow tables inside one unit, so a
// second run over unchanged staging data yields identical rows.

use crate::config::RunConfig;
use crate::db::{replace_table, table_exists, Store, TableSpec};
use crate::staging::{ASSISTANCE_STAGING, CONTRACT_STAGING};
use anyhow::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

// ============================================================================
// AGGREGATE TABLES
// ============================================================================

pub const ASSISTANCE_OBLIGATIONS: TableSpec = TableSpec::new(
    "usaspending_assistance_obligation_aggregation",
    "CREATE TABLE IF NOT EXISTS {table} (
        cfda_number TEXT NOT NULL,
        action_date_fiscal_year INTEGER NOT NULL,
        assistance_type_code TEXT NOT NULL,
        total_obligations REAL NOT NULL,
        PRIMARY KEY (cfda_number, action_date_fiscal_year, assistance_type_code)
    )",
    &[],
);

pub const CONTRACT_OBLIGATIONS: TableSpec = TableSpec::new(
    "usaspending_contract_obligation_aggregation",
    "CREATE TABLE IF NOT EXISTS {table} (
        funding_office_code TEXT NOT NULL,
        action_date_fiscal_year INTEGER NOT NULL,
        total_obligations REAL NOT NULL,
        PRIMARY KEY (funding_office_code, action_date_fiscal_year)
    )",
    &[],
);

pub const ASSISTANCE_OUTLAYS: TableSpec = TableSpec::new(
    "usaspending_assistance_outlay_aggregation",
    "CREATE TABLE IF NOT EXISTS {table} (
        cfda_number TEXT NOT NULL,
        action_date_fiscal_year INTEGER NOT NULL,
        assistance_type_code TEXT NOT NULL,
        total_outlays REAL NOT NULL,
        PRIMARY KEY (cfda_number, action_date_fiscal_year, assistance_type_code)
    )",
    &[],
);

pub const CONTRACT_OUTLAYS: TableSpec = TableSpec::new(
    "usaspending_contract_outlay_aggregation",
    "CREATE TABLE IF NOT EXISTS {table} (
        funding_office_code TEXT NOT NULL,
        action_date_fiscal_year INTEGER NOT NULL,
        total_outlays REAL NOT NULL,
        PRIMARY KEY (funding_office_code, action_date_fiscal_year)
    )",
    &[],
);

pub const CONTRACT_PROGRAM_OBLIGATIONS: TableSpec = TableSpec::new(
    "usaspending_contract_program_obligation",
    "CREATE TABLE IF NOT EXISTS {table} (
        program_id TEXT NOT NULL,
        action_date_fiscal_year INTEGER NOT NULL,
        total_obligations REAL NOT NULL,
        PRIMARY KEY (program_id, action_date_fiscal_year)
    )",
    &[],
);

/// Every aggregate table with its ordering key, in fingerprint order
const FINGERPRINT_TABLES: [(&TableSpec, &str); 5] = [
    (&ASSISTANCE_OBLIGATIONS, "cfda_number, action_date_fiscal_year, assistance_type_code"),
    (&CONTRACT_OBLIGATIONS, "funding_office_code, action_date_fiscal_year"),
    (&ASSISTANCE_OUTLAYS, "cfda_number, action_date_fiscal_year, assistance_type_code"),
    (&CONTRACT_OUTLAYS, "funding_office_code, action_date_fiscal_year"),
    (&CONTRACT_PROGRAM_OBLIGATIONS, "program_id, action_date_fiscal_year"),
];

// ============================================================================
// CONTRACT OFFICE → PROGRAM MAPPING
// ============================================================================

/// Attribution of office-level contract totals to programs
pub trait ContractOfficeMapping {
    fn program_for_office(&self, office_code: &str) -> Option<String>;
}

/// Attributes nothing; contract totals stay at the office level
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOfficeMapping;

impl ContractOfficeMapping for NoOfficeMapping {
    fn program_for_office(&self, _office_code: &str) -> Option<String> {
        None
    }
}

/// Fixed office code → program id table
#[derive(Debug, Default, Clone)]
pub struct TableOfficeMapping {
    offices: HashMap<String, String>,
}

impl TableOfficeMapping {
    pub fn new(offices: HashMap<String, String>) -> Self {
        TableOfficeMapping { offices }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.contract_office_programs.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.offices.is_empty()
    }
}

impl ContractOfficeMapping for TableOfficeMapping {
    fn program_for_office(&self, office_code: &str) -> Option<String> {
        self.offices.get(office_code).cloned()
    }
}

// ============================================================================
// AGGREGATION ENGINE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationReport {
    pub assistance_obligation_rows: usize,
    pub contract_obligation_rows: usize,
    pub assistance_outlay_rows: usize,
    pub contract_outlay_rows: usize,
    pub contract_program_rows: usize,
}

pub struct AggregationEngine<'a> {
    store: &'a mut Store,
    office_mapping: Box<dyn ContractOfficeMapping + 'a>,
}

impl<'a> AggregationEngine<'a> {
    pub fn new(store: &'a mut Store) -> Self {
        AggregationEngine {
            store,
            office_mapping: Box::new(NoOfficeMapping),
        }
    }

    pub fn with_office_mapping(mut self, mapping: impl ContractOfficeMapping + 'a) -> Self {
        self.office_mapping = Box::new(mapping);
        self
    }

    /// Rebuild every aggregate table from current staging contents
    pub fn aggregate(&mut self) -> Result<AggregationReport> {
        let mapping = &self.office_mapping;
        let (assistance_obligation_rows, contract_obligation_rows, contract_program_rows) =
            self.store.unit("aggregate:obligations", |conn| {
                ensure_staging(conn)?;
                let assistance = rebuild_assistance(conn, &ASSISTANCE_OBLIGATIONS, "federal_action_obligation")?;
                let contract = rebuild_contract(conn, &CONTRACT_OBLIGATIONS, "federal_action_obligation")?;
                let mapped = rebuild_contract_programs(conn, mapping.as_ref())?;
                Ok((assistance, contract, mapped))
            })?;

        let (assistance_outlay_rows, contract_outlay_rows) =
            self.store.unit("aggregate:outlays", |conn| {
                ensure_staging(conn)?;
                let assistance = rebuild_assistance(
                    conn,
                    &ASSISTANCE_OUTLAYS,
                    "total_outlayed_amount_for_overall_award",
                )?;
                let contract = rebuild_contract(
                    conn,
                    &CONTRACT_OUTLAYS,
                    "total_outlayed_amount_for_overall_award",
                )?;
                Ok((assistance, contract))
            })?;

        let report = AggregationReport {
            assistance_obligation_rows,
            contract_obligation_rows,
            assistance_outlay_rows,
            contract_outlay_rows,
            contract_program_rows,
        };
        info!(
            assistance_obligations = report.assistance_obligation_rows,
            contract_obligations = report.contract_obligation_rows,
            assistance_outlays = report.assistance_outlay_rows,
            contract_outlays = report.contract_outlay_rows,
            contract_programs = report.contract_program_rows,
            "aggregation complete"
        );
        Ok(report)
    }
}

fn ensure_staging(conn: &Connection) -> Result<()> {
    ASSISTANCE_STAGING.ensure(conn)?;
    CONTRACT_STAGING.ensure(conn)
}

fn rebuild_assistance(conn: &Connection, spec: &TableSpec, amount_column: &str) -> Result<usize> {
    replace_table(conn, spec, |conn, shadow| {
        let total_column = total_column(spec);
        let inserted = conn.execute(
            &format!(
                "INSERT INTO {shadow} (cfda_number, action_date_fiscal_year, assistance_type_code, {total})
                 SELECT cfda_number, action_date_fiscal_year, assistance_type_code, SUM({amount})
                 FROM usaspending_assistance
                 WHERE cfda_number IS NOT NULL AND cfda_number <> ''
                   AND action_date_fiscal_year IS NOT NULL
                   AND assistance_type_code IS NOT NULL AND assistance_type_code <> ''
                 GROUP BY cfda_number, action_date_fiscal_year, assistance_type_code
                 ORDER BY cfda_number, action_date_fiscal_year, assistance_type_code",
                shadow = shadow,
                total = total_column,
                amount = amount_column
            ),
            [],
        )?;
        debug!(table = spec.name, rows = inserted, "rebuilt");
        Ok(inserted)
    })
}

fn rebuild_contract(conn: &Connection, spec: &TableSpec, amount_column: &str) -> Result<usize> {
    replace_table(conn, spec, |conn, shadow| {
        let total_column = total_column(spec);
        let inserted = conn.execute(
            &format!(
                "INSERT INTO {shadow} (funding_office_code, action_date_fiscal_year, {total})
                 SELECT funding_office_code, action_date_fiscal_year, SUM({amount})
                 FROM usaspending_contract
                 WHERE funding_office_code IS NOT NULL AND funding_office_code <> ''
                   AND action_date_fiscal_year IS NOT NULL
                 GROUP BY funding_office_code, action_date_fiscal_year
                 ORDER BY funding_office_code, action_date_fiscal_year",
                shadow = shadow,
                total = total_column,
                amount = amount_column
            ),
            [],
        )?;
        debug!(table = spec.name, rows = inserted, "rebuilt");
        Ok(inserted)
    })
}

fn total_column(spec: &TableSpec) -> &'static str {
    if spec.name.contains("_outlay_") {
        "total_outlays"
    } else {
        "total_obligations"
    }
}

/// Attribute office-level contract obligations to programs. Must run after
/// the contract obligation table is rebuilt in the same unit.
fn rebuild_contract_programs(conn: &Connection, mapping: &dyn ContractOfficeMapping) -> Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT funding_office_code, action_date_fiscal_year, total_obligations
         FROM usaspending_contract_obligation_aggregation
         ORDER BY funding_office_code, action_date_fiscal_year",
    )?;
    let office_rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut totals: BTreeMap<(String, i64), f64> = BTreeMap::new();
    for (office, year, amount) in office_rows {
        if let Some(program_id) = mapping.program_for_office(&office) {
            *totals.entry((program_id, year)).or_insert(0.0) += amount;
        }
    }

    replace_table(conn, &CONTRACT_PROGRAM_OBLIGATIONS, |conn, shadow| {
        let mut insert = conn.prepare(&format!(
            "INSERT INTO {} (program_id, action_date_fiscal_year, total_obligations) VALUES (?1, ?2, ?3)",
            shadow
        ))?;
        for ((program_id, year), amount) in &totals {
            insert.execute(params![program_id, year, amount])?;
        }
        Ok(totals.len())
    })
}

// ============================================================================
// FINGERPRINT
// ============================================================================

/// Hex SHA-256 over every aggregate row in key order. Tables not yet built
/// contribute only their name.
pub fn aggregate_fingerprint(conn: &Connection) -> Result<String> {
    let mut hasher = Sha256::new();

    for (spec, order_by) in FINGERPRINT_TABLES {
        hasher.update(spec.name.as_bytes());
        hasher.update(b"\n");
        if !table_exists(conn, spec.name)? {
            continue;
        }

        let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY {}", spec.name, order_by))?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for idx in 0..column_count {
                let cell = match row.get_ref(idx)? {
                    rusqlite::types::ValueRef::Null => "NULL".to_string(),
                    rusqlite::types::ValueRef::Integer(i) => i.to_string(),
                    rusqlite::types::ValueRef::Real(f) => format!("{:016x}", f.to_bits()),
                    rusqlite::types::ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
                    rusqlite::types::ValueRef::Blob(b) => format!("{:?}", b),
                };
                hasher.update(cell.as_bytes());
                hasher.update(b"|");
            }
            hasher.update(b"\n");
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}
