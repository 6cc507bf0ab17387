// 🔀 Multi-Source Obligation Resolver
//
// Two independent figures exist for a program/year: the registry's
// self-reported obligations and the totals aggregated from award
// transactions. Both are kept; the resolver exposes them side by side and
// never folds one into the other. A missing row is "no data", not zero.
//
// Per-year series are returned as `{x: year, ...}` records ready for charts.

use crate::db::{table_exists, Store};
use crate::entities::program::ProgramType;
use crate::error::ReconError;
use anyhow::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const ASSISTANCE_OBLIGATION_TABLE: &str = "usaspending_assistance_obligation_aggregation";
const ASSISTANCE_OUTLAY_TABLE: &str = "usaspending_assistance_outlay_aggregation";
const CONTRACT_PROGRAM_TABLE: &str = "usaspending_contract_program_obligation";

// ============================================================================
// RESULT SHAPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistanceObligation {
    /// Fiscal year
    pub x: String,
    pub sam_actual: Option<f64>,
    pub usa_spending_actual: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtherProgramKind {
    TaxExpenditure,
    Interest,
}

impl TryFrom<ProgramType> for OtherProgramKind {
    type Error = ReconError;

    fn try_from(program_type: ProgramType) -> Result<Self, Self::Error> {
        match program_type {
            ProgramType::TaxExpenditure => Ok(OtherProgramKind::TaxExpenditure),
            ProgramType::Interest => Ok(OtherProgramKind::Interest),
            other => Err(ReconError::UnknownProgramType(other.as_str().to_string())),
        }
    }
}

/// Serialized shape depends on the kind: only tax expenditures carry
/// `forgone_revenue`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OtherProgramObligation {
    TaxExpenditure {
        x: String,
        outlays: f64,
        forgone_revenue: f64,
    },
    Interest {
        x: String,
        outlays: f64,
    },
}

impl OtherProgramObligation {
    pub fn outlays(&self) -> f64 {
        match self {
            OtherProgramObligation::TaxExpenditure { outlays, .. } => *outlays,
            OtherProgramObligation::Interest { outlays, .. } => *outlays,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlayPoint {
    pub x: String,
    pub outlay: f64,
    pub obligation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractObligation {
    pub x: String,
    pub total_obligations: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactSource {
    Registry,
    Aggregation,
}

/// One raw figure as observed in a single source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObligationFact {
    pub program_id: String,
    pub source: FactSource,
    pub assistance_type: Option<String>,
    pub fiscal_year: i64,
    pub is_actual: bool,
    pub amount: f64,
}

// ============================================================================
// RESOLVER
// ============================================================================

pub struct Resolver<'a> {
    conn: &'a Connection,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a Store) -> Self {
        Resolver { conn: store.conn() }
    }

    pub fn from_connection(conn: &'a Connection) -> Self {
        Resolver { conn }
    }

    /// One record per requested year with both sources side by side
    pub fn assistance_program_obligations<S: AsRef<str>>(
        &self,
        program_id: &str,
        fiscal_years: &[S],
    ) -> Result<Vec<AssistanceObligation>> {
        fiscal_years
            .iter()
            .map(|year| -> Result<AssistanceObligation> {
                let year = year.as_ref();
                let (sam_actual, usa_spending_actual) = match parse_year(year) {
                    Some(y) => (
                        self.registry_actual(program_id, y)?,
                        self.aggregated_obligation(program_id, y)?,
                    ),
                    None => (None, None),
                };
                Ok(AssistanceObligation {
                    x: year.to_string(),
                    sam_actual,
                    usa_spending_actual,
                })
            })
            .collect()
    }

    /// Curated spending figures for tax-expenditure and interest programs.
    /// Years without a row are omitted.
    pub fn other_program_obligations<S: AsRef<str>>(
        &self,
        program_id: &str,
        fiscal_years: &[S],
        kind: OtherProgramKind,
    ) -> Result<Vec<OtherProgramObligation>> {
        let mut records = Vec::new();
        for year in fiscal_years {
            let year = year.as_ref();
            let Some(y) = parse_year(year) else { continue };
            let row: Option<(f64, f64)> = optional_row(
                self.conn,
                "SELECT outlays, forgone_revenue FROM other_program_spending
                 WHERE program_id = ?1 AND fiscal_year = ?2",
                params![program_id, y],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if let Some((outlays, forgone_revenue)) = row {
                records.push(match kind {
                    OtherProgramKind::TaxExpenditure => OtherProgramObligation::TaxExpenditure {
                        x: year.to_string(),
                        outlays,
                        forgone_revenue,
                    },
                    OtherProgramKind::Interest => OtherProgramObligation::Interest {
                        x: year.to_string(),
                        outlays,
                    },
                });
            }
        }
        Ok(records)
    }

    /// Aggregated outlay and obligation per year; years missing from the
    /// aggregates are omitted
    pub fn outlays_data<S: AsRef<str>>(&self, program_id: &str, fiscal_years: &[S]) -> Result<Vec<OutlayPoint>> {
        let mut points = Vec::new();
        for year in fiscal_years {
            let year = year.as_ref();
            let Some(y) = parse_year(year) else { continue };
            let outlay = self.aggregated_sum(ASSISTANCE_OUTLAY_TABLE, "total_outlays", program_id, y)?;
            let obligation = self.aggregated_obligation(program_id, y)?;
            if let (Some(outlay), Some(obligation)) = (outlay, obligation) {
                points.push(OutlayPoint {
                    x: year.to_string(),
                    outlay,
                    obligation,
                });
            }
        }
        Ok(points)
    }

    /// Per-program obligation for one year plus the grand total. Each
    /// program takes the registry actual, else the aggregated total, else
    /// the registry estimate; programs with none of these are left out.
    pub fn assistance_listing_obligations<S: AsRef<str>>(
        &self,
        program_ids: &[S],
        fiscal_year: &str,
    ) -> Result<(BTreeMap<String, f64>, f64)> {
        let mut by_program = BTreeMap::new();
        let Some(year) = parse_year(fiscal_year) else {
            return Ok((by_program, 0.0));
        };

        for program_id in program_ids {
            let program_id = program_id.as_ref();
            let amount = match self.registry_actual(program_id, year)? {
                Some(actual) => Some(actual),
                None => match self.aggregated_obligation(program_id, year)? {
                    Some(aggregated) => Some(aggregated),
                    None => self.registry_estimate(program_id, year)?,
                },
            };
            if let Some(amount) = amount {
                by_program.insert(program_id.to_string(), amount);
            }
        }

        let total = by_program.values().sum();
        Ok((by_program, total))
    }

    /// Raw figures from both sources, for audit
    pub fn obligation_facts(&self, program_id: &str) -> Result<Vec<ObligationFact>> {
        let mut facts = Vec::new();

        let mut stmt = self.conn.prepare(
            "SELECT assistance_type, fiscal_year, is_actual, amount FROM program_sam_spending
             WHERE program_id = ?1
             ORDER BY fiscal_year, is_actual DESC, assistance_type",
        )?;
        let registry = stmt.query_map([program_id], |row| {
            Ok(ObligationFact {
                program_id: program_id.to_string(),
                source: FactSource::Registry,
                assistance_type: row.get(0)?,
                fiscal_year: row.get(1)?,
                is_actual: row.get::<_, i64>(2)? != 0,
                amount: row.get(3)?,
            })
        })?;
        for fact in registry {
            facts.push(fact?);
        }

        if table_exists(self.conn, ASSISTANCE_OBLIGATION_TABLE)? {
            let mut stmt = self.conn.prepare(
                "SELECT assistance_type_code, action_date_fiscal_year, total_obligations
                 FROM usaspending_assistance_obligation_aggregation
                 WHERE cfda_number = ?1
                 ORDER BY action_date_fiscal_year, assistance_type_code",
            )?;
            let aggregated = stmt.query_map([program_id], |row| {
                Ok(ObligationFact {
                    program_id: program_id.to_string(),
                    source: FactSource::Aggregation,
                    assistance_type: row.get(0)?,
                    fiscal_year: row.get(1)?,
                    is_actual: true,
                    amount: row.get(2)?,
                })
            })?;
            for fact in aggregated {
                facts.push(fact?);
            }
        }

        Ok(facts)
    }

    /// Contract obligations attributed to the program through the office mapping
    pub fn contract_program_obligations<S: AsRef<str>>(
        &self,
        program_id: &str,
        fiscal_years: &[S],
    ) -> Result<Vec<ContractObligation>> {
        let mut records = Vec::new();
        for year in fiscal_years {
            let year = year.as_ref();
            let Some(y) = parse_year(year) else { continue };
            let total = self.aggregated_sum(CONTRACT_PROGRAM_TABLE, "total_obligations", program_id, y)?;
            if let Some(total_obligations) = total {
                records.push(ContractObligation {
                    x: year.to_string(),
                    total_obligations,
                });
            }
        }
        Ok(records)
    }

    // ========================================================================
    // LOOKUPS
    // ========================================================================

    fn registry_figure(&self, program_id: &str, year: i64, is_actual: bool) -> Result<Option<f64>> {
        let sum: Option<f64> = self.conn.query_row(
            "SELECT SUM(amount) FROM program_sam_spending
             WHERE program_id = ?1 AND fiscal_year = ?2 AND is_actual = ?3",
            params![program_id, year, is_actual as i64],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    fn registry_actual(&self, program_id: &str, year: i64) -> Result<Option<f64>> {
        self.registry_figure(program_id, year, true)
    }

    fn registry_estimate(&self, program_id: &str, year: i64) -> Result<Option<f64>> {
        self.registry_figure(program_id, year, false)
    }

    fn aggregated_obligation(&self, program_id: &str, year: i64) -> Result<Option<f64>> {
        self.aggregated_sum(ASSISTANCE_OBLIGATION_TABLE, "total_obligations", program_id, year)
    }

    /// SUM over all rows of an aggregate table for one program/year;
    /// `None` when the table is absent or holds no matching row
    fn aggregated_sum(&self, table: &str, column: &str, program_id: &str, year: i64) -> Result<Option<f64>> {
        if !table_exists(self.conn, table)? {
            return Ok(None);
        }
        let key_column = if table == CONTRACT_PROGRAM_TABLE {
            "program_id"
        } else {
            "cfda_number"
        };
        let sum: Option<f64> = self.conn.query_row(
            &format!(
                "SELECT SUM({}) FROM {} WHERE {} = ?1 AND action_date_fiscal_year = ?2",
                column, table, key_column
            ),
            params![program_id, year],
            |row| row.get(0),
        )?;
        Ok(sum)
    }
}

fn parse_year(year: &str) -> Option<i64> {
    year.trim().parse().ok()
}

fn optional_row<T, P, F>(conn: &Connection, sql: &str, params: P, map: F) -> Result<Option<T>>
where
    P: rusqlite::Params,
    F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    use rusqlite::OptionalExtension;
    Ok(conn.query_row(sql, params, map).optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationEngine;

    fn seed(store: &mut Store) {
        store
            .unit("seed", |conn| {
                conn.execute_batch(
                    "INSERT INTO program_sam_spending VALUES
                        ('10.001', '01', 2023, 1, 1000000),
                        ('10.001', '01', 2024, 0, 1200000),
                        ('10.002', '01', 2024, 0, 300),
                        ('10.003', '01', 2024, 1, 50);
                     INSERT INTO other_program_spending VALUES
                        ('TX001', 2023, 0, 2000000, 'additional-programs.csv'),
                        ('I001', 2023, 5000000, 0, 'additional-programs.csv');",
                )?;
                crate::staging::ASSISTANCE_STAGING.ensure(conn)?;
                conn.execute_batch(
                    "INSERT INTO usaspending_assistance VALUES
                        ('trans123', 'award123', 100000, 80000, 2023, 'CA01', '10.001', '02'),
                        ('trans124', 'award124', 900, 400, 2024, 'CA01', '10.002', '02'),
                        ('trans125', 'award125', 100, 100, 2024, 'CA01', '10.002', '03');",
                )?;
                Ok(())
            })
            .unwrap();
        AggregationEngine::new(store).aggregate().unwrap();
    }

    #[test]
    fn test_assistance_program_obligations_side_by_side() {
        let mut store = Store::open_in_memory().unwrap();
        seed(&mut store);
        let resolver = Resolver::new(&store);

        let records = resolver
            .assistance_program_obligations("10.001", &["2023", "2024"])
            .unwrap();

        assert_eq!(
            records[0],
            AssistanceObligation {
                x: "2023".to_string(),
                sam_actual: Some(1_000_000.0),
                usa_spending_actual: Some(100000.0),
            }
        );
        assert_eq!(records[1].sam_actual, None);
        assert_eq!(records[1].usa_spending_actual, None);

        let json = serde_json::to_value(&records[1]).unwrap();
        assert!(json["sam_actual"].is_null());

        println!("✅ Side-by-side obligations test PASSED");
    }

    #[test]
    fn test_other_program_key_presence() {
        let mut store = Store::open_in_memory().unwrap();
        seed(&mut store);
        let resolver = Resolver::new(&store);

        let interest = resolver
            .other_program_obligations("I001", &["2022", "2023"], OtherProgramKind::Interest)
            .unwrap();
        assert_eq!(interest.len(), 1);
        let json = serde_json::to_value(&interest).unwrap();
        assert_eq!(json[0]["x"], "2023");
        assert_eq!(json[0]["outlays"], 5000000.0);
        assert!(json[0].get("forgone_revenue").is_none());

        let tax = resolver
            .other_program_obligations("TX001", &["2023"], OtherProgramKind::TaxExpenditure)
            .unwrap();
        let json = serde_json::to_value(&tax).unwrap();
        assert_eq!(json[0]["outlays"], 0.0);
        assert_eq!(json[0]["forgone_revenue"], 2000000.0);
    }

    #[test]
    fn test_other_program_kind_from_program_type() {
        assert_eq!(
            OtherProgramKind::try_from(ProgramType::Interest).unwrap(),
            OtherProgramKind::Interest
        );
        assert!(OtherProgramKind::try_from(ProgramType::AssistanceListing).is_err());
    }

    #[test]
    fn test_outlays_data_omits_missing_years() {
        let mut store = Store::open_in_memory().unwrap();
        seed(&mut store);
        let resolver = Resolver::new(&store);

        let points = resolver.outlays_data("10.002", &["2023", "2024"]).unwrap();
        assert_eq!(
            points,
            vec![OutlayPoint {
                x: "2024".to_string(),
                outlay: 500.0,
                obligation: 1000.0,
            }]
        );
    }

    #[test]
    fn test_assistance_listing_obligations_precedence() {
        let mut store = Store::open_in_memory().unwrap();
        seed(&mut store);
        let resolver = Resolver::new(&store);

        let (by_program, total) = resolver
            .assistance_listing_obligations(&["10.001", "10.002", "10.003", "99.999"], "2024")
            .unwrap();

        // 10.001: estimate only; 10.002: aggregate beats estimate; 10.003: actual
        assert_eq!(by_program["10.001"], 1_200_000.0);
        assert_eq!(by_program["10.002"], 1000.0);
        assert_eq!(by_program["10.003"], 50.0);
        assert!(!by_program.contains_key("99.999"));
        assert_eq!(total, 1_201_050.0);
    }

    #[test]
    fn test_empty_batch_is_zero() {
        let store = Store::open_in_memory().unwrap();
        let resolver = Resolver::new(&store);
        let empty: [&str; 0] = [];

        for year in ["2022", "2023", "2024"] {
            let (by_program, total) = resolver.assistance_listing_obligations(&empty, year).unwrap();
            assert!(by_program.is_empty());
            assert_eq!(total, 0.0);
        }
    }

    #[test]
    fn test_missing_aggregates_are_no_data() {
        let store = Store::open_in_memory().unwrap();
        let resolver = Resolver::new(&store);

        let records = resolver.assistance_program_obligations("10.001", &["2023"]).unwrap();
        assert_eq!(records[0].usa_spending_actual, None);
        assert!(resolver.outlays_data("10.001", &["2023"]).unwrap().is_empty());
        assert!(resolver
            .contract_program_obligations("10.001", &["2023"])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_obligation_facts_keep_both_sources() {
        let mut store = Store::open_in_memory().unwrap();
        seed(&mut store);
        let resolver = Resolver::new(&store);

        let facts = resolver.obligation_facts("10.001").unwrap();
        assert_eq!(facts.len(), 3);
        assert_eq!(facts.iter().filter(|f| f.source == FactSource::Registry).count(), 2);
        let aggregated = facts.iter().find(|f| f.source == FactSource::Aggregation).unwrap();
        assert_eq!(aggregated.amount, 100000.0);
        assert_eq!(aggregated.assistance_type.as_deref(), Some("02"));
    }
}
