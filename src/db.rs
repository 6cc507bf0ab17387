// 🗄️ Relational store - the single system of record for a reconciliation run
//
// Every logical unit of work (one staging file, one aggregation pass, one
// reference-table rebuild) runs inside `Store::unit`, so a reader never sees
// a half-applied result. Tables that are rebuilt from scratch go through
// `replace_table`: rows are staged into a shadow table that is swapped in
// by rename inside the same transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, error};

// ============================================================================
// TABLE SPECS (durable contract between runs - column names are fixed)
// ============================================================================

/// DDL for a table, with `{table}` standing in for the table name
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    ddl: &'static str,
    indexes: &'static [&'static str],
}

impl TableSpec {
    pub const fn new(
        name: &'static str,
        ddl: &'static str,
        indexes: &'static [&'static str],
    ) -> Self {
        TableSpec { name, ddl, indexes }
    }

    pub fn create_sql(&self, table: &str) -> String {
        self.ddl.replace("{table}", table)
    }

    pub fn shadow_name(&self) -> String {
        format!("{}__next", self.name)
    }

    fn index_sql(&self) -> impl Iterator<Item = String> + '_ {
        self.indexes.iter().map(|idx| idx.replace("{table}", self.name))
    }

    /// Create the live table and its indexes if absent
    pub fn ensure(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&self.create_sql(self.name))
            .with_context(|| format!("Failed to create table {}", self.name))?;
        for idx in self.index_sql() {
            conn.execute_batch(&idx)?;
        }
        Ok(())
    }
}

pub const AGENCY: TableSpec = TableSpec::new(
    "agency",
    "CREATE TABLE IF NOT EXISTS {table} (
        id INTEGER PRIMARY KEY,
        agency_name TEXT,
        tier_1_agency_id INTEGER,
        tier_2_agency_id INTEGER,
        is_cfo_act_agency INTEGER DEFAULT 0
    )",
    &[],
);

pub const PROGRAM: TableSpec = TableSpec::new(
    "program",
    "CREATE TABLE IF NOT EXISTS {table} (
        id TEXT PRIMARY KEY,
        agency_id INTEGER,
        name TEXT,
        popular_name TEXT,
        objective TEXT,
        sam_url TEXT,
        usaspending_awards_hash TEXT,
        usaspending_awards_url TEXT,
        grants_url TEXT,
        program_type TEXT,
        is_subpart_f BOOLEAN,
        rules_regulations TEXT
    )",
    &["CREATE INDEX IF NOT EXISTS idx_{table}_agency ON {table}(agency_id)"],
);

pub const CATEGORY: TableSpec = TableSpec::new(
    "category",
    "CREATE TABLE IF NOT EXISTS {table} (
        id TEXT NOT NULL,
        type TEXT NOT NULL,
        name TEXT NOT NULL,
        parent_id TEXT,
        PRIMARY KEY(id, type)
    )",
    &[],
);

pub const PROGRAM_TO_CATEGORY: TableSpec = TableSpec::new(
    "program_to_category",
    "CREATE TABLE IF NOT EXISTS {table} (
        program_id TEXT NOT NULL,
        category_id TEXT NOT NULL,
        category_type TEXT NOT NULL,
        PRIMARY KEY (program_id, category_id, category_type)
    )",
    &["CREATE INDEX IF NOT EXISTS idx_{table}_category ON {table}(category_id, category_type)"],
);

pub const PROGRAM_SAM_SPENDING: TableSpec = TableSpec::new(
    "program_sam_spending",
    "CREATE TABLE IF NOT EXISTS {table} (
        program_id TEXT NOT NULL,
        assistance_type TEXT,
        fiscal_year INTEGER NOT NULL,
        is_actual INTEGER NOT NULL,
        amount REAL NOT NULL,
        PRIMARY KEY (program_id, assistance_type, fiscal_year, is_actual)
    )",
    &[],
);

pub const OTHER_PROGRAM_SPENDING: TableSpec = TableSpec::new(
    "other_program_spending",
    "CREATE TABLE IF NOT EXISTS {table} (
        program_id TEXT NOT NULL,
        fiscal_year INTEGER NOT NULL,
        outlays REAL NOT NULL DEFAULT 0,
        forgone_revenue REAL NOT NULL DEFAULT 0,
        source TEXT,
        PRIMARY KEY (program_id, fiscal_year)
    )",
    &[],
);

pub const IMPROPER_PAYMENT_MAPPING: TableSpec = TableSpec::new(
    "improper_payment_mapping",
    "CREATE TABLE IF NOT EXISTS {table} (
        program_id TEXT NOT NULL,
        improper_payment_program_name TEXT NOT NULL,
        outlays REAL,
        improper_payment_amount REAL,
        insufficient_documentation_amount REAL,
        high_priority_program INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (program_id, improper_payment_program_name)
    )",
    &["CREATE INDEX IF NOT EXISTS idx_{table}_name ON {table}(improper_payment_program_name)"],
);

pub const RUN_LOG: TableSpec = TableSpec::new(
    "run_log",
    "CREATE TABLE IF NOT EXISTS {table} (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id TEXT UNIQUE NOT NULL,
        run_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        event_type TEXT NOT NULL,
        unit TEXT NOT NULL,
        data TEXT NOT NULL
    )",
    &[
        "CREATE INDEX IF NOT EXISTS idx_{table}_unit ON {table}(unit)",
        "CREATE INDEX IF NOT EXISTS idx_{table}_run ON {table}(run_id)",
    ],
);

/// Reference and fact tables created up front (staging and aggregate tables
/// are owned by their engines)
const DURABLE_TABLES: [TableSpec; 8] = [
    AGENCY,
    PROGRAM,
    CATEGORY,
    PROGRAM_TO_CATEGORY,
    PROGRAM_SAM_SPENDING,
    OTHER_PROGRAM_SPENDING,
    IMPROPER_PAYMENT_MAPPING,
    RUN_LOG,
];

// ============================================================================
// EVENT (audit trail - one row per unit of work)
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub unit: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(run_id: &str, event_type: &str, unit: &str, data: serde_json::Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            unit: unit.to_string(),
            data,
        }
    }
}

pub const EVENT_UNIT_COMMITTED: &str = "unit_committed";
pub const EVENT_UNIT_ROLLED_BACK: &str = "unit_rolled_back";

// ============================================================================
// STORE
// ============================================================================

/// Explicit connection object, scoped to one reconciliation run
pub struct Store {
    conn: Connection,
    run_id: String,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        // WAL for crash recovery
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Store {
            conn,
            run_id: uuid::Uuid::new_v4().to_string(),
        };
        store.setup_schema()?;
        Ok(store)
    }

    fn setup_schema(&self) -> Result<()> {
        for spec in DURABLE_TABLES {
            spec.ensure(&self.conn)?;
        }
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run `work` as one atomic unit. On `Err` the transaction is dropped
    /// (rolled back) and the prior committed state is untouched.
    pub fn unit<T>(
        &mut self,
        name: &str,
        work: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        debug!(unit = name, "unit started");
        let tx = self.conn.transaction()?;
        match work(&tx) {
            Ok(value) => {
                tx.commit()
                    .with_context(|| format!("Failed to commit unit '{}'", name))?;
                self.record(EVENT_UNIT_COMMITTED, name, serde_json::json!({}));
                Ok(value)
            }
            Err(e) => {
                drop(tx);
                error!(unit = name, error = %e, "unit rolled back");
                self.record(
                    EVENT_UNIT_ROLLED_BACK,
                    name,
                    serde_json::json!({ "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    /// Append an audit event; a failed write never fails the caller
    pub fn record(&self, event_type: &str, unit: &str, data: serde_json::Value) {
        let event = Event::new(&self.run_id, event_type, unit, data);
        if let Err(e) = insert_event(&self.conn, &event) {
            error!(unit, error = %e, "failed to write run_log event");
        }
    }

    pub fn events_for_unit(&self, unit: &str) -> Result<Vec<Event>> {
        get_events_for_unit(&self.conn, unit)
    }

    pub fn count_rows(&self, table: &str) -> Result<i64> {
        count_rows(&self.conn, table)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        table_exists(&self.conn, table)
    }
}

// ============================================================================
// REPLACE-ALL (shadow table + rename)
// ============================================================================

/// Rebuild `spec` from scratch: `fill` writes into the shadow table named by
/// its second argument, then the shadow replaces the live table. Must be
/// called inside a unit so the swap commits atomically.
pub fn replace_table<T>(
    conn: &Connection,
    spec: &TableSpec,
    fill: impl FnOnce(&Connection, &str) -> Result<T>,
) -> Result<T> {
    let shadow = spec.shadow_name();
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", shadow))?;
    conn.execute_batch(&spec.create_sql(&shadow))?;

    let filled = fill(conn, &shadow)?;

    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {live};
         ALTER TABLE {shadow} RENAME TO {live};",
        live = spec.name,
        shadow = shadow
    ))
    .with_context(|| format!("Failed to swap shadow table for {}", spec.name))?;
    for idx in spec.index_sql() {
        conn.execute_batch(&idx)?;
    }
    Ok(filled)
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
        row.get(0)
    })?;
    Ok(count)
}

// ============================================================================
// RUN LOG
// ============================================================================

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO run_log (event_id, run_id, timestamp, event_type, unit, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            event.run_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.unit,
            data_json,
        ],
    )?;

    Ok(())
}

pub fn get_events_for_unit(conn: &Connection, unit: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, run_id, timestamp, event_type, unit, data
         FROM run_log
         WHERE unit = ?1
         ORDER BY id",
    )?;

    let rows = stmt
        .query_map([unit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(event_id, run_id, timestamp, event_type, unit, data)| {
            Ok(Event {
                event_id,
                run_id,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .context("Invalid run_log timestamp")?
                    .with_timezone(&Utc),
                event_type,
                unit,
                data: serde_json::from_str(&data).context("Invalid run_log payload")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_schema_setup_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.setup_schema().unwrap();

        for spec in DURABLE_TABLES {
            assert!(store.table_exists(spec.name).unwrap(), "{} missing", spec.name);
        }
        assert_eq!(store.count_rows("agency").unwrap(), 0);

        println!("✅ Schema setup test PASSED");
    }

    #[test]
    fn test_unit_commits_and_logs() {
        let mut store = Store::open_in_memory().unwrap();

        store
            .unit("seed", |conn| {
                conn.execute(
                    "INSERT INTO agency (id, agency_name, tier_1_agency_id) VALUES (1, 'A', 1)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.count_rows("agency").unwrap(), 1);
        let events = store.events_for_unit("seed").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_UNIT_COMMITTED);
        assert_eq!(events[0].run_id, store.run_id());
    }

    #[test]
    fn test_failed_unit_rolls_back_entirely() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .unit("seed", |conn| {
                conn.execute("INSERT INTO agency (id, agency_name) VALUES (1, 'Kept')", [])?;
                Ok(())
            })
            .unwrap();

        let result: Result<()> = store.unit("broken", |conn| {
            conn.execute("INSERT INTO agency (id, agency_name) VALUES (2, 'Lost')", [])?;
            conn.execute("DELETE FROM agency WHERE id = 1", [])?;
            Err(anyhow!("source went away"))
        });

        assert!(result.is_err());
        let names: Vec<String> = store
            .conn()
            .prepare("SELECT agency_name FROM agency ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(names, vec!["Kept".to_string()]);

        let events = store.events_for_unit("broken").unwrap();
        assert_eq!(events[0].event_type, EVENT_UNIT_ROLLED_BACK);
        assert_eq!(events[0].data["error"], "source went away");
    }

    #[test]
    fn test_replace_table_swaps_atomically() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .unit("seed", |conn| {
                conn.execute("INSERT INTO agency (id, agency_name) VALUES (1, 'Old')", [])?;
                Ok(())
            })
            .unwrap();

        // A failing rebuild leaves the old table in place
        let failed: Result<()> = store.unit("rebuild-fail", |conn| {
            replace_table(conn, &AGENCY, |conn, shadow| {
                conn.execute(
                    &format!("INSERT INTO {} (id, agency_name) VALUES (2, 'New')", shadow),
                    [],
                )?;
                Err(anyhow!("boom"))
            })
        });
        assert!(failed.is_err());
        assert_eq!(store.count_rows("agency").unwrap(), 1);
        assert!(!store.table_exists("agency__next").unwrap());

        let inserted = store
            .unit("rebuild", |conn| {
                replace_table(conn, &AGENCY, |conn, shadow| {
                    conn.execute(
                        &format!("INSERT INTO {} (id, agency_name) VALUES (2, 'New')", shadow),
                        [],
                    )?;
                    Ok(1usize)
                })
            })
            .unwrap();

        assert_eq!(inserted, 1);
        let name: String = store
            .conn()
            .query_row("SELECT agency_name FROM agency", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "New");
        assert!(!store.table_exists("agency__next").unwrap());

        println!("✅ Replace-all test PASSED");
    }

    #[test]
    fn test_open_file_store_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("database.db");
        let store = Store::open(&path).unwrap();
        assert!(path.exists());
        assert!(store.table_exists("program").unwrap());
    }
}
