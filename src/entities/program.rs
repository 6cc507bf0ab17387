// 📋 Program Entity - registry assistance listings and curated programs
//
// Registry programs are keyed by program number and rebuilt on every run
// together with their self-reported obligation figures. Curated programs
// (tax expenditures, interest) are added afterwards by the supplementary
// loader and share the same table.

use crate::constants::{fill_url, GRANTS_SEARCH_URL, PROGRAM_TYPE_MAPPING, SAM_LISTING_URL, USASPENDING_SEARCH_URL};
use crate::db::{replace_table, Store, PROGRAM, PROGRAM_SAM_SPENDING};
use crate::entities::category::{category_exists, CategoryType, ProgramCategoryLink};
use crate::error::ReconError;
use crate::sources::{clean_text, AssistanceListing};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

// ============================================================================
// PROGRAM TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramType {
    AssistanceListing,
    TaxExpenditure,
    Interest,
    Other,
}

impl ProgramType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramType::AssistanceListing => "assistance_listing",
            ProgramType::TaxExpenditure => "tax_expenditure",
            ProgramType::Interest => "interest",
            ProgramType::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ReconError> {
        match raw.trim().to_lowercase().as_str() {
            "assistance_listing" => Ok(ProgramType::AssistanceListing),
            "tax_expenditure" => Ok(ProgramType::TaxExpenditure),
            "interest" => Ok(ProgramType::Interest),
            "other" => Ok(ProgramType::Other),
            _ => Err(ReconError::UnknownProgramType(raw.to_string())),
        }
    }

    /// Label shown to readers; falls back to the stored tag
    pub fn display_name(&self) -> &'static str {
        PROGRAM_TYPE_MAPPING
            .iter()
            .find(|(tag, _)| *tag == self.as_str())
            .map(|(_, label)| *label)
            .unwrap_or_else(|| self.as_str())
    }
}

// ============================================================================
// PROGRAM ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Registry program number (e.g. "10.001") or curated identifier
    pub id: String,
    pub agency_id: Option<i64>,
    pub name: String,
    pub popular_name: Option<String>,
    pub objective: Option<String>,
    pub sam_url: Option<String>,
    pub usaspending_awards_hash: Option<String>,
    pub usaspending_awards_url: Option<String>,
    pub grants_url: Option<String>,
    pub program_type: ProgramType,
    pub is_subpart_f: bool,
    pub rules_regulations: Option<String>,
}

impl Program {
    /// Minimal curated program (no registry links)
    pub fn curated(id: &str, agency_id: i64, name: &str, description: Option<&str>, program_type: ProgramType) -> Self {
        Program {
            id: id.trim().to_string(),
            agency_id: Some(agency_id),
            name: clean_text(name),
            popular_name: None,
            objective: description.map(clean_text).filter(|d| !d.is_empty()),
            sam_url: None,
            usaspending_awards_hash: None,
            usaspending_awards_url: None,
            grants_url: None,
            program_type,
            is_subpart_f: false,
            rules_regulations: None,
        }
    }

    pub fn from_listing(listing: &AssistanceListing, search_hashes: &HashMap<String, String>) -> Result<Self, ReconError> {
        let data = &listing.data;
        let id = data
            .program_number
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ReconError::malformed("assistance listings", format!("listing '{}' has no program number", listing.id)))?
            .to_string();

        let agency_id = match data.organization_id.as_deref() {
            None => None,
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
                ReconError::malformed("assistance listings", format!("program {} organization id '{}'", id, raw))
            })?),
        };

        let hash = search_hashes.get(&id).cloned();

        Ok(Program {
            agency_id,
            name: data.title.as_deref().map(clean_text).unwrap_or_default(),
            popular_name: data.popular_name().map(clean_text),
            objective: data.objective.as_deref().map(clean_text),
            sam_url: (!listing.id.is_empty()).then(|| fill_url(SAM_LISTING_URL, &listing.id)),
            usaspending_awards_url: hash.as_deref().map(|h| fill_url(USASPENDING_SEARCH_URL, h)),
            usaspending_awards_hash: hash,
            grants_url: Some(fill_url(GRANTS_SEARCH_URL, &id)),
            program_type: ProgramType::AssistanceListing,
            is_subpart_f: data.is_subpart_f(),
            rules_regulations: data.rules_regulations().map(clean_text),
            id,
        })
    }

    fn insert_into(&self, conn: &Connection, table: &str) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (
                    id, agency_id, name, popular_name, objective, sam_url,
                    usaspending_awards_hash, usaspending_awards_url, grants_url,
                    program_type, is_subpart_f, rules_regulations
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                table
            ),
            params![
                self.id,
                self.agency_id,
                self.name,
                self.popular_name,
                self.objective,
                self.sam_url,
                self.usaspending_awards_hash,
                self.usaspending_awards_url,
                self.grants_url,
                self.program_type.as_str(),
                self.is_subpart_f,
                self.rules_regulations,
            ],
        )?;
        Ok(())
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        self.insert_into(conn, PROGRAM.name)
    }
}

pub fn get_program(conn: &Connection, id: &str) -> Result<Option<Program>> {
    let program = conn
        .query_row(
            "SELECT id, agency_id, name, popular_name, objective, sam_url,
                    usaspending_awards_hash, usaspending_awards_url, grants_url,
                    program_type, is_subpart_f, rules_regulations
             FROM program WHERE id = ?1",
            [id],
            |row| {
                let program_type: Option<String> = row.get(9)?;
                Ok(Program {
                    id: row.get(0)?,
                    agency_id: row.get(1)?,
                    name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    popular_name: row.get(3)?,
                    objective: row.get(4)?,
                    sam_url: row.get(5)?,
                    usaspending_awards_hash: row.get(6)?,
                    usaspending_awards_url: row.get(7)?,
                    grants_url: row.get(8)?,
                    program_type: program_type
                        .as_deref()
                        .and_then(|t| ProgramType::parse(t).ok())
                        .unwrap_or(ProgramType::Other),
                    is_subpart_f: row.get::<_, Option<bool>>(10)?.unwrap_or(false),
                    rules_regulations: row.get(11)?,
                })
            },
        )
        .optional()?;
    Ok(program)
}

pub fn program_ids_of_type(conn: &Connection, program_type: ProgramType) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM program WHERE program_type = ?1 ORDER BY id")?;
    let ids = stmt
        .query_map([program_type.as_str()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

pub fn program_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM program WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

// ============================================================================
// REGISTRY LOAD (replace-all)
// ============================================================================

/// Key of one registry obligation figure: (assistance type, fiscal year, is actual)
type FactKey = (Option<String>, i64, bool);

/// Self-reported obligation figures of one listing, summed per key
fn registry_facts(listing: &AssistanceListing) -> BTreeMap<FactKey, f64> {
    let mut facts = BTreeMap::new();
    for entry in &listing.data.financial.obligations {
        let assistance_type = entry
            .assistance_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        for value in &entry.values {
            if let Some(actual) = value.actual {
                *facts.entry((assistance_type.clone(), value.year, true)).or_insert(0.0) += actual;
            }
            if let Some(estimate) = value.estimate {
                *facts.entry((assistance_type.clone(), value.year, false)).or_insert(0.0) += estimate;
            }
        }
    }
    facts
}

fn registry_links(listing: &AssistanceListing, program_id: &str) -> Vec<ProgramCategoryLink> {
    let data = &listing.data;
    let mut links = Vec::new();
    for entry in &data.financial.obligations {
        if let Some(code) = entry.assistance_type.as_deref().filter(|c| !c.trim().is_empty()) {
            links.push(ProgramCategoryLink::new(program_id, code.trim(), CategoryType::Assistance));
        }
    }
    for code in &data.eligibility.applicant.types {
        links.push(ProgramCategoryLink::new(program_id, code.trim(), CategoryType::Applicant));
    }
    for code in &data.eligibility.beneficiary.types {
        links.push(ProgramCategoryLink::new(program_id, code.trim(), CategoryType::Beneficiary));
    }
    links
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramReport {
    pub inserted: usize,
    pub skipped: usize,
    pub facts: usize,
    pub links: usize,
    pub orphans_pruned: usize,
}

/// Replace `program` and `program_sam_spending` from registry listings and
/// link each program to its assistance, applicant and beneficiary
/// categories. Listings whose agency is not in the agency table are skipped.
pub fn load_registry_programs(
    store: &mut Store,
    listings: &[AssistanceListing],
    search_hashes: &HashMap<String, String>,
) -> Result<ProgramReport> {
    let report = store.unit("reference:program", |conn| {
        let mut stmt = conn.prepare("SELECT id FROM agency")?;
        let agencies = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<HashSet<i64>, _>>()?;

        let mut report = ProgramReport::default();
        let mut accepted: Vec<(&AssistanceListing, Program)> = Vec::new();

        for listing in listings {
            let program = match Program::from_listing(listing, search_hashes) {
                Ok(program) => program,
                Err(e) => {
                    warn!(error = %e, "skipping listing");
                    report.skipped += 1;
                    continue;
                }
            };
            match program.agency_id {
                Some(agency_id) if agencies.contains(&agency_id) => accepted.push((listing, program)),
                other => {
                    let e = ReconError::ReferentialIntegrity {
                        entity: "program",
                        id: program.id.clone(),
                        target: "agency",
                        target_id: other.map(|id| id.to_string()).unwrap_or_else(|| "none".to_string()),
                    };
                    warn!(error = %e, "skipping program");
                    report.skipped += 1;
                }
            }
        }

        report.inserted = replace_table(conn, &PROGRAM, |conn, shadow| {
            for (_, program) in &accepted {
                program.insert_into(conn, shadow)?;
            }
            Ok(accepted.len())
        })?;

        report.facts = replace_table(conn, &PROGRAM_SAM_SPENDING, |conn, shadow| {
            let mut insert = conn.prepare(&format!(
                "INSERT INTO {} (program_id, assistance_type, fiscal_year, is_actual, amount)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                shadow
            ))?;
            let mut written = 0;
            for (listing, program) in &accepted {
                for ((assistance_type, year, is_actual), amount) in registry_facts(listing) {
                    insert.execute(params![program.id, assistance_type, year, is_actual as i64, amount])?;
                    written += 1;
                }
            }
            Ok(written)
        })?;

        // Curated rows for programs that no longer exist; the supplementary
        // loads that follow re-add the ones still listed
        report.orphans_pruned = conn.execute(
            "DELETE FROM other_program_spending WHERE program_id NOT IN (SELECT id FROM program)",
            [],
        )? + conn.execute(
            "DELETE FROM improper_payment_mapping WHERE program_id NOT IN (SELECT id FROM program)",
            [],
        )?;

        for (listing, program) in &accepted {
            for link in registry_links(listing, &program.id) {
                if !category_exists(conn, &link.category_id, link.category_type)? {
                    debug!(program_id = %program.id, category = %link.category_id, "no such category");
                    continue;
                }
                if link.insert(conn)? {
                    report.links += 1;
                }
            }
        }

        Ok(report)
    })?;

    info!(
        inserted = report.inserted,
        skipped = report.skipped,
        facts = report.facts,
        links = report.links,
        orphans_pruned = report.orphans_pruned,
        "registry programs loaded"
    );
    Ok(report)
}
