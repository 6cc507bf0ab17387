// 🏛️ Agency Entity - two-level federal organization hierarchy
//
// Rebuilt from scratch on every run from the registry's organization records.
// A tier-1 department points at itself; sub-agencies point at their
// department (tier 1) and themselves (tier 2).

use crate::constants::CFO_ACT_AGENCY_NAMES;
use crate::db::{replace_table, Store, AGENCY};
use crate::error::ReconError;
use crate::sources::OrganizationRecord;
use anyhow::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

// ============================================================================
// AGENCY ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agency {
    pub id: i64,

    /// Display name (mapped from the registry's agency name when known)
    pub name: String,

    /// Department this agency rolls up to (self for a department)
    pub tier_1_agency_id: Option<i64>,

    pub tier_2_agency_id: Option<i64>,

    pub is_cfo_act_agency: bool,
}

impl Agency {
    pub fn new(id: i64, name: String, tier_1_agency_id: Option<i64>, tier_2_agency_id: Option<i64>) -> Self {
        let is_cfo_act_agency = is_cfo_act_name(&name);
        Agency {
            id,
            name,
            tier_1_agency_id,
            tier_2_agency_id,
            is_cfo_act_agency,
        }
    }

    /// Build from one organization record. `display_names` maps the
    /// registry's upper-case agency name to the display name.
    pub fn from_record(
        record: &OrganizationRecord,
        display_names: &HashMap<String, String>,
    ) -> Result<Self, ReconError> {
        let id = parse_org_key(record.org_key.as_deref(), "orgKey")?
            .ok_or_else(|| ReconError::malformed("organizations", "record without orgKey"))?;
        let tier_1 = parse_org_key(record.l1_org_key.as_deref(), "l1OrgKey")?;
        let tier_2 = parse_org_key(record.l2_org_key.as_deref(), "l2OrgKey")?;

        let name = record
            .agency_name
            .as_ref()
            .and_then(|agency_name| display_names.get(agency_name))
            .cloned()
            .or_else(|| record.name.clone())
            .ok_or_else(|| ReconError::malformed("organizations", format!("agency {} has no name", id)))?;

        Ok(Agency::new(id, name, tier_1, tier_2))
    }

    fn insert_into(&self, conn: &Connection, table: &str) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, agency_name, tier_1_agency_id, tier_2_agency_id, is_cfo_act_agency)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                table
            ),
            params![
                self.id,
                self.name,
                self.tier_1_agency_id,
                self.tier_2_agency_id,
                self.is_cfo_act_agency as i64,
            ],
        )?;
        Ok(())
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        self.insert_into(conn, AGENCY.name)
    }
}

pub fn is_cfo_act_name(display_name: &str) -> bool {
    CFO_ACT_AGENCY_NAMES.contains(&display_name)
}

fn parse_org_key(raw: Option<&str>, field: &str) -> Result<Option<i64>, ReconError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ReconError::malformed("organizations", format!("{} is not numeric: '{}'", field, s))),
    }
}

// ============================================================================
// BUILD (replace-all)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgencyReport {
    pub inserted: usize,
    pub skipped: usize,
}

/// Replace the agency table with the given organization records. Records
/// whose tier-1 department is not inserted by the same rebuild are skipped.
pub fn build_agencies(
    store: &mut Store,
    records: &[OrganizationRecord],
    display_names: &HashMap<String, String>,
) -> Result<AgencyReport> {
    let mut report = AgencyReport::default();
    let mut agencies = Vec::with_capacity(records.len());
    for record in records {
        match Agency::from_record(record, display_names) {
            Ok(agency) => agencies.push(agency),
            Err(e) => {
                warn!(error = %e, "skipping organization record");
                report.skipped += 1;
            }
        }
    }

    let accepted = accepted_agencies(&agencies);

    let inserted = store.unit("reference:agency", |conn| {
        replace_table(conn, &AGENCY, |conn, shadow| {
            let mut inserted = 0;
            for agency in agencies.iter().filter(|a| accepted.contains(&a.id)) {
                agency.insert_into(conn, shadow)?;
                inserted += 1;
            }
            Ok(inserted)
        })
    })?;

    report.skipped += agencies.len() - inserted;
    report.inserted = inserted;
    info!(inserted = report.inserted, skipped = report.skipped, "agencies rebuilt");
    Ok(report)
}

/// Ids whose tier-1 chain stays inside the accepted set. Dropping a dangling
/// record can strand the agencies pointing at it, so repeat until stable.
fn accepted_agencies(agencies: &[Agency]) -> HashSet<i64> {
    let mut accepted: HashSet<i64> = agencies.iter().map(|a| a.id).collect();
    loop {
        let dangling: Vec<&Agency> = agencies
            .iter()
            .filter(|a| accepted.contains(&a.id))
            .filter(|a| a.tier_1_agency_id.is_some_and(|parent| !accepted.contains(&parent)))
            .collect();
        if dangling.is_empty() {
            return accepted;
        }
        for agency in dangling {
            let e = ReconError::ReferentialIntegrity {
                entity: "agency",
                id: agency.id.to_string(),
                target: "agency",
                target_id: agency.tier_1_agency_id.map(|id| id.to_string()).unwrap_or_default(),
            };
            warn!(error = %e, "skipping agency");
            accepted.remove(&agency.id);
        }
    }
}

// ============================================================================
// AGENCY REGISTRY (lookups over the committed table)
// ============================================================================

pub struct AgencyRegistry {
    agencies: Vec<Agency>,
}

impl AgencyRegistry {
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut stmt = conn.prepare(
            "SELECT id, agency_name, tier_1_agency_id, tier_2_agency_id, is_cfo_act_agency
             FROM agency ORDER BY id",
        )?;
        let agencies = stmt
            .query_map([], |row| {
                Ok(Agency {
                    id: row.get(0)?,
                    name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    tier_1_agency_id: row.get(2)?,
                    tier_2_agency_id: row.get(3)?,
                    is_cfo_act_agency: row.get::<_, Option<i64>>(4)?.unwrap_or(0) != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AgencyRegistry { agencies })
    }

    pub fn find_by_id(&self, id: i64) -> Option<&Agency> {
        self.agencies.iter().find(|a| a.id == id)
    }

    /// Case-insensitive display-name lookup
    pub fn find_by_name(&self, name: &str) -> Option<&Agency> {
        let wanted = name.trim().to_lowercase();
        self.agencies.iter().find(|a| a.name.to_lowercase() == wanted)
    }

    pub fn next_id(&self) -> i64 {
        self.agencies.iter().map(|a| a.id).max().unwrap_or(0) + 1
    }

    /// Find by name, or create a tier-1 agency with the next free id
    pub fn resolve_or_create(&mut self, conn: &Connection, name: &str) -> Result<i64> {
        if let Some(agency) = self.find_by_name(name) {
            return Ok(agency.id);
        }
        let id = self.next_id();
        let agency = Agency::new(id, name.trim().to_string(), Some(id), None);
        agency.insert(conn)?;
        info!(agency_id = id, name = %agency.name, "created agency");
        self.agencies.push(agency);
        Ok(id)
    }

    /// Find by name, or create a sub-agency under `parent_id`
    pub fn resolve_or_create_child(&mut self, conn: &Connection, name: &str, parent_id: i64) -> Result<i64> {
        if let Some(agency) = self.find_by_name(name) {
            return Ok(agency.id);
        }
        let id = self.next_id();
        let agency = Agency::new(id, name.trim().to_string(), Some(parent_id), Some(id));
        agency.insert(conn)?;
        info!(agency_id = id, parent_id, name = %agency.name, "created sub-agency");
        self.agencies.push(agency);
        Ok(id)
    }

    pub fn count(&self) -> usize {
        self.agencies.len()
    }
}
