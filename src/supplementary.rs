// 📎 Supplementary Loader - curated spreadsheets merged after the registry
//
// Both inputs are optional. An absent file is logged once and the store is
// not touched. A present file commits as one unit after every row has been
// processed; bad rows are skipped with a warning.

use crate::db::{replace_table, Store, IMPROPER_PAYMENT_MAPPING, OTHER_PROGRAM_SPENDING};
use crate::entities::agency::AgencyRegistry;
use crate::entities::category::{slug, Category, CategoryType, ProgramCategoryLink};
use crate::entities::program::{program_exists, Program, ProgramType};
use crate::error::ReconError;
use crate::sources::parse_currency;
use anyhow::{Context, Result};
use csv::StringRecord;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplementReport {
    pub inserted: usize,
    pub skipped: usize,
    /// Spending rows (additional programs) or mapping rows (improper payments)
    pub facts: usize,
}

// ============================================================================
// ADDITIONAL PROGRAMS (tax expenditures, interest, ...)
// ============================================================================

/// Header positions for the additional-programs file
struct AdditionalColumns {
    id: usize,
    name: Option<usize>,
    program_type: Option<usize>,
    agency: Option<usize>,
    subagency: Option<usize>,
    category: Option<usize>,
    subcategory: Option<usize>,
    description: Option<usize>,
    assistance_type: Option<usize>,
    /// fiscal year → (outlays column, forgone revenue column)
    years: Vec<(i64, Option<usize>, Option<usize>)>,
}

impl AdditionalColumns {
    fn from_headers(headers: &StringRecord) -> Result<Self, ReconError> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        // Some exports leave the id column header as a stray backtick
        let id = find("id")
            .or_else(|| find("`"))
            .ok_or_else(|| ReconError::malformed("additional programs", "no id column"))?;

        let mut years: BTreeSet<i64> = BTreeSet::new();
        for header in headers.iter() {
            if let Some(year) = year_prefix(header, "_outlays").or_else(|| year_prefix(header, "_foregone_revenue")) {
                years.insert(year);
            }
        }

        Ok(AdditionalColumns {
            id,
            name: find("name"),
            program_type: find("type"),
            agency: find("agency"),
            subagency: find("subagency"),
            category: find("category"),
            subcategory: find("subcategory"),
            description: find("description"),
            assistance_type: find("assistance_type"),
            years: years
                .into_iter()
                .map(|y| {
                    (
                        y,
                        find(&format!("{}_outlays", y)),
                        find(&format!("{}_foregone_revenue", y)),
                    )
                })
                .collect(),
        })
    }
}

fn year_prefix(header: &str, suffix: &str) -> Option<i64> {
    let year = header.trim().strip_suffix(suffix)?;
    if year.len() == 4 {
        year.parse().ok()
    } else {
        None
    }
}

fn cell(record: &StringRecord, idx: Option<usize>) -> Option<&str> {
    idx.and_then(|i| record.get(i))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Load curated non-registry programs with their per-year spending
pub fn load_additional_programs(store: &mut Store, path: &Path) -> Result<Option<SupplementReport>> {
    if !path.exists() {
        info!(file = %path.display(), "additional programs file not found, skipping");
        return Ok(None);
    }

    let source = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let columns = AdditionalColumns::from_headers(rdr.headers()?)?;

    let mut records: Vec<(usize, StringRecord)> = Vec::new();
    let mut unreadable = 0;
    for (idx, result) in rdr.records().enumerate() {
        match result {
            Ok(record) => records.push((idx + 2, record)),
            Err(e) => {
                warn!(file = %source, line = idx + 2, error = %e, "skipping unreadable row");
                unreadable += 1;
            }
        }
    }

    // The spending table mirrors the file: rows dropped or blanked by the
    // curators disappear on the next load
    let report = store.unit("supplementary:additional_programs", |conn| {
        replace_table(conn, &OTHER_PROGRAM_SPENDING, |conn, spending_table| {
            let mut registry = AgencyRegistry::load(conn)?;
            let mut report = SupplementReport {
                skipped: unreadable,
                ..SupplementReport::default()
            };

            for (line, record) in &records {
                match load_additional_row(conn, &mut registry, &columns, record, &source, spending_table) {
                    Ok(facts) => {
                        report.inserted += 1;
                        report.facts += facts;
                    }
                    Err(e) => {
                        let row_level = e
                            .downcast_ref::<ReconError>()
                            .map(ReconError::is_row_level)
                            .unwrap_or(false);
                        if !row_level {
                            return Err(e);
                        }
                        warn!(file = %source, line = *line, error = %e, "skipping program row");
                        report.skipped += 1;
                    }
                }
            }
            Ok(report)
        })
    })?;

    info!(
        file = %source,
        inserted = report.inserted,
        skipped = report.skipped,
        spending_rows = report.facts,
        "additional programs loaded"
    );
    Ok(Some(report))
}

fn load_additional_row(
    conn: &Connection,
    registry: &mut AgencyRegistry,
    columns: &AdditionalColumns,
    record: &StringRecord,
    source: &str,
    spending_table: &str,
) -> Result<usize> {
    let id = cell(record, Some(columns.id)).ok_or_else(|| ReconError::malformed(source, "row without id"))?;
    let name = cell(record, columns.name).unwrap_or(id);
    let program_type = match cell(record, columns.program_type) {
        Some(raw) => ProgramType::parse(raw).map_err(|e| ReconError::malformed(source, e.to_string()))?,
        None => ProgramType::Other,
    };
    let agency_name = cell(record, columns.agency)
        .ok_or_else(|| ReconError::malformed(source, format!("program {} has no agency", id)))?;

    // Parse amounts before writing anything for this row
    let mut spending = Vec::new();
    for (year, outlays_idx, forgone_idx) in &columns.years {
        let outlays = cell(record, *outlays_idx).map(parse_currency).transpose()?.flatten();
        let forgone = cell(record, *forgone_idx).map(parse_currency).transpose()?.flatten();
        if outlays.is_none() && forgone.is_none() {
            continue;
        }
        spending.push((*year, outlays.unwrap_or(0.0), forgone.unwrap_or(0.0)));
    }

    let mut agency_id = registry.resolve_or_create(conn, agency_name)?;
    if let Some(subagency) = cell(record, columns.subagency) {
        agency_id = registry.resolve_or_create_child(conn, subagency, agency_id)?;
    }

    Program::curated(id, agency_id, name, cell(record, columns.description), program_type).insert(conn)?;

    if let Some(category) = cell(record, columns.category) {
        let parent = Category::top_level(slug(category), CategoryType::Category, category);
        let mut target = parent.id.clone();
        if !parent.id.is_empty() {
            parent.ensure(conn)?;
            if let Some(subcategory) = cell(record, columns.subcategory).filter(|s| !slug(s).is_empty()) {
                let child = Category::child(slug(subcategory), CategoryType::Category, subcategory, parent.id.clone());
                child.ensure(conn)?;
                target = child.id;
            }
            ProgramCategoryLink::new(id, target, CategoryType::Category).insert(conn)?;
        }
    }

    if let Some(assistance_type) = cell(record, columns.assistance_type) {
        let category = Category::top_level(slug(assistance_type), CategoryType::Assistance, assistance_type);
        if !category.id.is_empty() {
            category.ensure(conn)?;
            ProgramCategoryLink::new(id, category.id, CategoryType::Assistance).insert(conn)?;
        }
    }

    for (year, outlays, forgone_revenue) in &spending {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {}
                    (program_id, fiscal_year, outlays, forgone_revenue, source)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                spending_table
            ),
            params![id, year, outlays, forgone_revenue, source],
        )?;
    }

    Ok(spending.len())
}

// ============================================================================
// IMPROPER PAYMENT MAPPING
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImproperPaymentRow {
    program_id: Option<String>,
    improper_payment_program_name: Option<String>,
    outlays: Option<String>,
    improper_payment_amount: Option<String>,
    insufficient_documentation_amount: Option<String>,
    high_priority_program: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImproperPaymentMapping {
    pub program_id: String,
    pub improper_payment_program_name: String,
    pub outlays: Option<f64>,
    pub improper_payment_amount: Option<f64>,
    pub insufficient_documentation_amount: Option<f64>,
    pub high_priority_program: bool,
}

impl ImproperPaymentRow {
    fn into_mapping(self, source: &str) -> Result<ImproperPaymentMapping, ReconError> {
        let program_id = self
            .program_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ReconError::malformed(source, "row without program_id"))?;
        let name = self
            .improper_payment_program_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ReconError::malformed(source, format!("program {} has no improper payment name", program_id)))?;

        let amount = |raw: Option<String>| -> Result<Option<f64>, ReconError> {
            match raw {
                Some(raw) => parse_currency(&raw),
                None => Ok(None),
            }
        };

        Ok(ImproperPaymentMapping {
            outlays: amount(self.outlays)?,
            improper_payment_amount: amount(self.improper_payment_amount)?,
            insufficient_documentation_amount: amount(self.insufficient_documentation_amount)?,
            high_priority_program: parse_flag(self.high_priority_program.as_deref()),
            program_id,
            improper_payment_program_name: name,
        })
    }
}

fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|s| s.trim().to_lowercase()).as_deref(),
        Some("1") | Some("1.0") | Some("true") | Some("yes") | Some("y")
    )
}

impl ImproperPaymentMapping {
    fn upsert_into(&self, conn: &Connection, table: &str) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (
                    program_id, improper_payment_program_name, outlays, improper_payment_amount,
                    insufficient_documentation_amount, high_priority_program
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                table
            ),
            params![
                self.program_id,
                self.improper_payment_program_name,
                self.outlays,
                self.improper_payment_amount,
                self.insufficient_documentation_amount,
                self.high_priority_program as i64,
            ],
        )?;
        Ok(())
    }
}

/// Replace the improper-payment mapping with the file's rows for programs
/// that already exist
pub fn load_improper_payment_mapping(store: &mut Store, path: &Path) -> Result<Option<SupplementReport>> {
    if !path.exists() {
        info!(file = %path.display(), "improper payment mapping not found, skipping");
        return Ok(None);
    }

    let source = path.display().to_string();
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", source))?;

    let mut rows = Vec::new();
    let mut skipped = 0;
    for (idx, result) in rdr.deserialize::<ImproperPaymentRow>().enumerate() {
        match result.map_err(|e| ReconError::malformed(source.as_str(), e.to_string())) {
            Ok(raw) => match raw.into_mapping(&source) {
                Ok(mapping) => rows.push(mapping),
                Err(e) => {
                    warn!(file = %source, line = idx + 2, error = %e, "skipping improper payment row");
                    skipped += 1;
                }
            },
            Err(e) => {
                warn!(file = %source, line = idx + 2, error = %e, "skipping unreadable row");
                skipped += 1;
            }
        }
    }

    let report = store.unit("supplementary:improper_payment_mapping", |conn| {
        replace_table(conn, &IMPROPER_PAYMENT_MAPPING, |conn, shadow| {
            let mut report = SupplementReport {
                skipped,
                ..SupplementReport::default()
            };
            for mapping in &rows {
                if !program_exists(conn, &mapping.program_id)? {
                    let e = ReconError::ReferentialIntegrity {
                        entity: "improper_payment_mapping",
                        id: mapping.improper_payment_program_name.clone(),
                        target: "program",
                        target_id: mapping.program_id.clone(),
                    };
                    warn!(error = %e, "skipping improper payment row");
                    report.skipped += 1;
                    continue;
                }
                mapping.upsert_into(conn, shadow)?;
                report.inserted += 1;
                report.facts += 1;
            }
            Ok(report)
        })
    })?;

    info!(file = %source, inserted = report.inserted, skipped = report.skipped, "improper payment mapping loaded");
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{OtherProgramKind, Resolver};
    use std::fs;

    fn seed_program(store: &mut Store, id: &str) {
        store
            .unit("seed", |conn| {
                conn.execute(
                    "INSERT INTO agency (id, agency_name, tier_1_agency_id, is_cfo_act_agency)
                     VALUES (100000000, 'Department of Agriculture', 100000000, 1)",
                    [],
                )?;
                Program::curated(id, 100000000, "Seeded", None, ProgramType::AssistanceListing).insert(conn)?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_missing_files_do_not_touch_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open_in_memory().unwrap();

        let additional = load_additional_programs(&mut store, &dir.path().join("absent.csv")).unwrap();
        let improper = load_improper_payment_mapping(&mut store, &dir.path().join("absent.csv")).unwrap();

        assert!(additional.is_none());
        assert!(improper.is_none());
        assert_eq!(store.count_rows("run_log").unwrap(), 0);
    }

    #[test]
    fn test_load_additional_programs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("additional-programs.csv");
        fs::write(
            &path,
            "id,name,type,agency,subagency,category,subcategory,description,assistance_type,2023_outlays,2023_foregone_revenue\n\
TX001,Tax Credit,tax_expenditure,Department of the Treasury,,Economics,Tax Policy,Tax credit description,Tax Expenditures,0,\"$2,000,000\"\n\
I001,Interest Program,interest,department of the treasury,,Economics,Debt Management,Interest program description,Interest,5000000,0\n\
BAD1,Broken,loan,Department of the Treasury,,,,,,,\n\
BAD2,Broken Amount,interest,Department of the Treasury,,,,,,lots,\n",
        )
        .unwrap();

        let mut store = Store::open_in_memory().unwrap();
        let report = load_additional_programs(&mut store, &path).unwrap().unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.facts, 2);

        // One agency created, reused for the second row
        assert_eq!(store.count_rows("agency").unwrap(), 1);
        let cfo: i64 = store
            .conn()
            .query_row("SELECT is_cfo_act_agency FROM agency", [], |row| row.get(0))
            .unwrap();
        assert_eq!(cfo, 1);

        // Economics + two subcategories + two assistance types
        assert_eq!(store.count_rows("category").unwrap(), 5);
        assert_eq!(store.count_rows("program_to_category").unwrap(), 4);

        let resolver = Resolver::new(&store);
        let tax = resolver
            .other_program_obligations("TX001", &["2023"], OtherProgramKind::TaxExpenditure)
            .unwrap();
        let json = serde_json::to_value(&tax).unwrap();
        assert_eq!(json[0]["forgone_revenue"], 2000000.0);

        let source: String = store
            .conn()
            .query_row(
                "SELECT source FROM other_program_spending WHERE program_id = 'I001'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(source, "additional-programs.csv");

        println!("✅ Additional programs test PASSED");
    }

    #[test]
    fn test_load_improper_payment_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("improper.csv");
        fs::write(
            &path,
            "program_id,improper_payment_program_name,outlays,improper_payment_amount,insufficient_documentation_amount,high_priority_program\n\
10.001,Program A,\"$1,000,000\",\"$50,000\",\"$10,000\",1\n\
10.002,Program B,\"$2,000,000\",\"$100,000\",\"$20,000\",0\n\
10.001,Program C,not money,,,0\n",
        )
        .unwrap();

        let mut store = Store::open_in_memory().unwrap();
        seed_program(&mut store, "10.001");

        let report = load_improper_payment_mapping(&mut store, &path).unwrap().unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 2);

        let (outlays, improper, high): (f64, f64, i64) = store
            .conn()
            .query_row(
                "SELECT outlays, improper_payment_amount, high_priority_program
                 FROM improper_payment_mapping WHERE program_id = '10.001'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(outlays, 1_000_000.0);
        assert_eq!(improper, 50_000.0);
        assert_eq!(high, 1);

        // Reloading replaces rather than duplicating
        load_improper_payment_mapping(&mut store, &path).unwrap();
        assert_eq!(store.count_rows("improper_payment_mapping").unwrap(), 1);
    }

    #[test]
    fn test_reload_drops_rows_removed_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let additional = dir.path().join("additional-programs.csv");
        let improper = dir.path().join("improper.csv");
        let header = "id,name,type,agency,2023_outlays,2023_foregone_revenue\n";
        fs::write(
            &additional,
            format!(
                "{}TX001,Tax Credit,tax_expenditure,Department of the Treasury,0,\"$25,000,000\"\n\
I001,Interest Program,interest,Department of the Treasury,5000000,\n",
                header
            ),
        )
        .unwrap();
        fs::write(
            &improper,
            "program_id,improper_payment_program_name,improper_payment_amount\n10.001,Program A,$50\n",
        )
        .unwrap();

        let mut store = Store::open_in_memory().unwrap();
        seed_program(&mut store, "10.001");
        load_additional_programs(&mut store, &additional).unwrap();
        load_improper_payment_mapping(&mut store, &improper).unwrap();
        assert_eq!(store.count_rows("other_program_spending").unwrap(), 2);
        assert_eq!(store.count_rows("improper_payment_mapping").unwrap(), 1);

        // TX001 dropped, I001's year blanked, improper file emptied
        fs::write(
            &additional,
            format!("{}I001,Interest Program,interest,Department of the Treasury,,\n", header),
        )
        .unwrap();
        fs::write(&improper, "program_id,improper_payment_program_name,improper_payment_amount\n").unwrap();

        let report = load_additional_programs(&mut store, &additional).unwrap().unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.facts, 0);
        load_improper_payment_mapping(&mut store, &improper).unwrap();

        assert_eq!(store.count_rows("other_program_spending").unwrap(), 0);
        assert_eq!(store.count_rows("improper_payment_mapping").unwrap(), 0);
        let resolver = Resolver::new(&store);
        assert!(resolver
            .other_program_obligations("TX001", &["2023"], OtherProgramKind::TaxExpenditure)
            .unwrap()
            .is_empty());

        println!("✅ Supplementary reload test PASSED");
    }

    #[test]
    fn test_unreadable_row_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("additional-programs.csv");
        let mut contents = b"id,name,type,agency\nA1,First,other,Department of Energy\n".to_vec();
        contents.extend_from_slice(b"A2,Bad \xff Name,other,Department of Energy\n");
        contents.extend_from_slice(b"A3,Third,other,Department of Energy\n");
        fs::write(&path, contents).unwrap();

        let mut store = Store::open_in_memory().unwrap();
        let report = load_additional_programs(&mut store, &path).unwrap().unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 1);
        assert!(program_exists(store.conn(), "A1").unwrap());
        assert!(!program_exists(store.conn(), "A2").unwrap());
        assert!(program_exists(store.conn(), "A3").unwrap());
    }

    #[test]
    fn test_year_columns() {
        assert_eq!(year_prefix("2023_outlays", "_outlays"), Some(2023));
        assert_eq!(year_prefix("2023_foregone_revenue", "_foregone_revenue"), Some(2023));
        assert_eq!(year_prefix("total_outlays", "_outlays"), None);
        assert!(parse_flag(Some("1")));
        assert!(parse_flag(Some("True")));
        assert!(!parse_flag(Some("0")));
        assert!(!parse_flag(None));
    }
}
