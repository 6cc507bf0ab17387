// 🏷️ Category Entity - controlled vocabularies and the budget-function tree
//
// Categories are keyed by (id, type). Registry vocabularies keep their
// element codes as ids; the curated program → category → subcategory file
// derives ids from display names by slugging, so the same name always lands
// on the same row.
//
// Hierarchy is two levels at most. A subcategory is written only after its
// parent exists with the same type.

use crate::db::{replace_table, Store, CATEGORY, PROGRAM_TO_CATEGORY};
use crate::error::ReconError;
use crate::sources::{clean_text, Dictionary, VocabularyElement};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

// ============================================================================
// CATEGORY TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryType {
    /// Registry assistance types (two levels: type → sub-type)
    Assistance,

    /// Registry applicant eligibility types
    Applicant,

    /// Registry beneficiary eligibility types
    Beneficiary,

    /// Budget function → sub-function tree from the curated mapping file
    Category,
}

impl CategoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryType::Assistance => "assistance",
            CategoryType::Applicant => "applicant",
            CategoryType::Beneficiary => "beneficiary",
            CategoryType::Category => "category",
        }
    }

    /// Dictionary vocabulary id → category type
    pub fn from_vocabulary(vocabulary_id: &str) -> Option<Self> {
        match vocabulary_id {
            "assistance_type" => Some(CategoryType::Assistance),
            "applicant_types" => Some(CategoryType::Applicant),
            "beneficiary_types" => Some(CategoryType::Beneficiary),
            _ => None,
        }
    }
}

// ============================================================================
// CATEGORY ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub category_type: CategoryType,
    pub name: String,
    /// None for a top-level category
    pub parent_id: Option<String>,
}

impl Category {
    pub fn top_level(id: impl Into<String>, category_type: CategoryType, name: impl Into<String>) -> Self {
        Category {
            id: id.into(),
            category_type,
            name: name.into(),
            parent_id: None,
        }
    }

    pub fn child(
        id: impl Into<String>,
        category_type: CategoryType,
        name: impl Into<String>,
        parent_id: impl Into<String>,
    ) -> Self {
        Category {
            id: id.into(),
            category_type,
            name: name.into(),
            parent_id: Some(parent_id.into()),
        }
    }

    fn insert_into(&self, conn: &Connection, table: &str) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, type, name, parent_id) VALUES (?1, ?2, ?3, ?4)",
                table
            ),
            params![self.id, self.category_type.as_str(), self.name, self.parent_id],
        )?;
        Ok(())
    }

    /// Insert unless a category with the same (id, type) already exists.
    /// Returns true when a row was written.
    pub fn ensure(&self, conn: &Connection) -> Result<bool> {
        if let Some(parent) = &self.parent_id {
            if !category_exists(conn, parent, self.category_type)? {
                return Err(ReconError::ReferentialIntegrity {
                    entity: "category",
                    id: self.id.clone(),
                    target: "parent category",
                    target_id: parent.clone(),
                }
                .into());
            }
        }
        let written = conn.execute(
            "INSERT OR IGNORE INTO category (id, type, name, parent_id) VALUES (?1, ?2, ?3, ?4)",
            params![self.id, self.category_type.as_str(), self.name, self.parent_id],
        )?;
        Ok(written > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramCategoryLink {
    pub program_id: String,
    pub category_id: String,
    pub category_type: CategoryType,
}

impl ProgramCategoryLink {
    pub fn new(program_id: impl Into<String>, category_id: impl Into<String>, category_type: CategoryType) -> Self {
        ProgramCategoryLink {
            program_id: program_id.into(),
            category_id: category_id.into(),
            category_type,
        }
    }

    /// Insert without checking either end; duplicates are ignored
    pub fn insert(&self, conn: &Connection) -> Result<bool> {
        let written = conn.execute(
            "INSERT OR IGNORE INTO program_to_category (program_id, category_id, category_type)
             VALUES (?1, ?2, ?3)",
            params![self.program_id, self.category_id, self.category_type.as_str()],
        )?;
        Ok(written > 0)
    }
}

/// Categories plus the program links that reference them
#[derive(Debug, Clone, Default)]
pub struct CategoryGraph {
    pub categories: Vec<Category>,
    pub links: Vec<ProgramCategoryLink>,
}

impl CategoryGraph {
    pub fn top_level(&self) -> impl Iterator<Item = &Category> {
        self.categories.iter().filter(|c| c.parent_id.is_none())
    }

    pub fn children_of<'a>(&'a self, parent_id: &'a str) -> impl Iterator<Item = &'a Category> + 'a {
        self.categories
            .iter()
            .filter(move |c| c.parent_id.as_deref() == Some(parent_id))
    }
}

// ============================================================================
// SLUG
// ============================================================================

/// URL-safe identifier: lower-case ASCII alphanumerics, every run of other
/// characters collapsed to one hyphen, no leading or trailing hyphen.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}

// ============================================================================
// BUILDERS
// ============================================================================

/// Assistance, applicant and beneficiary vocabularies from the registry
/// dictionary. `assistance_type_names` maps registry labels to display names.
pub fn build_categories(dictionary: &Dictionary, assistance_type_names: &HashMap<String, String>) -> Vec<Category> {
    let mut categories = Vec::new();

    for vocabulary in &dictionary.embedded.lists {
        let Some(category_type) = CategoryType::from_vocabulary(&vocabulary.id) else {
            continue;
        };

        for element in &vocabulary.elements {
            let name = match category_type {
                CategoryType::Assistance => assistance_type_names
                    .get(&element.value)
                    .cloned()
                    .unwrap_or_else(|| clean_text(&element.value)),
                _ => clean_text(&element.value),
            };
            categories.push(Category::top_level(element.element_id.clone(), category_type, name));

            if category_type == CategoryType::Assistance {
                for sub in element.elements.iter().flatten() {
                    categories.push(sub_type(sub, &element.element_id));
                }
            }
        }
    }

    categories
}

fn sub_type(element: &VocabularyElement, parent_id: &str) -> Category {
    Category::child(
        element.element_id.clone(),
        CategoryType::Assistance,
        clean_text(&element.value),
        parent_id,
    )
}

/// One row of the curated program → category → subcategory file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMappingRow {
    pub program_id: String,
    pub category: String,
    pub subcategory: String,
}

impl CategoryMappingRow {
    pub fn new(program_id: &str, category: &str, subcategory: &str) -> Self {
        CategoryMappingRow {
            program_id: program_id.trim().to_string(),
            category: category.trim().to_string(),
            subcategory: subcategory.trim().to_string(),
        }
    }
}

/// Budget-function tree from curated rows. Parents are deduplicated,
/// names that slug the same are one category (last name wins), and every
/// row yields one link from its program to its subcategory.
pub fn build_categories_from_csv(rows: &[CategoryMappingRow]) -> CategoryGraph {
    let mut graph = CategoryGraph::default();
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut seen_links: HashSet<ProgramCategoryLink> = HashSet::new();

    let mut upsert = |graph: &mut CategoryGraph, category: Category| match position.get(&category.id) {
        Some(&idx) => graph.categories[idx].name = category.name,
        None => {
            position.insert(category.id.clone(), graph.categories.len());
            graph.categories.push(category);
        }
    };

    for row in rows {
        let parent_id = slug(&row.category);
        let child_id = slug(&row.subcategory);
        if row.program_id.is_empty() || parent_id.is_empty() || child_id.is_empty() {
            warn!(program_id = %row.program_id, "skipping incomplete category mapping row");
            continue;
        }

        upsert(
            &mut graph,
            Category::top_level(parent_id.clone(), CategoryType::Category, row.category.clone()),
        );
        upsert(
            &mut graph,
            Category::child(child_id.clone(), CategoryType::Category, row.subcategory.clone(), parent_id),
        );

        let link = ProgramCategoryLink::new(row.program_id.clone(), child_id, CategoryType::Category);
        if seen_links.insert(link.clone()) {
            graph.links.push(link);
        }
    }

    graph
}

/// Read the mapping file (program, category, subcategory; header optional)
pub fn read_category_mapping(path: &Path) -> Result<Vec<CategoryMappingRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut rows = Vec::new();
    for (idx, record) in rdr.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(file = %path.display(), line = idx + 1, error = %e, "skipping unreadable category mapping row");
                continue;
            }
        };
        if record.len() < 3 {
            warn!(file = %path.display(), line = idx + 1, "skipping short category mapping row");
            continue;
        }
        if idx == 0 && looks_like_header(&record[0]) {
            continue;
        }
        rows.push(CategoryMappingRow::new(&record[0], &record[1], &record[2]));
    }
    Ok(rows)
}

fn looks_like_header(first: &str) -> bool {
    let first = first.trim().to_lowercase();
    first.contains("program") || first == "id" || first == "cfda"
}

// ============================================================================
// PERSISTENCE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryReport {
    pub inserted: usize,
    pub skipped: usize,
}

/// Replace the category table with `categories` and reset program links.
/// Parents are written before children; a child whose parent is absent is
/// skipped.
pub fn install_categories(store: &mut Store, categories: &[Category]) -> Result<CategoryReport> {
    let mut ordered: Vec<&Category> = categories.iter().filter(|c| c.parent_id.is_none()).collect();
    ordered.extend(categories.iter().filter(|c| c.parent_id.is_some()));

    let report = store.unit("reference:category", |conn| {
        let report = replace_table(conn, &CATEGORY, |conn, shadow| {
            let mut report = CategoryReport::default();
            let mut written: HashSet<(String, CategoryType)> = HashSet::new();

            for category in &ordered {
                if let Some(parent) = &category.parent_id {
                    if !written.contains(&(parent.clone(), category.category_type)) {
                        let e = ReconError::ReferentialIntegrity {
                            entity: "category",
                            id: category.id.clone(),
                            target: "parent category",
                            target_id: parent.clone(),
                        };
                        warn!(error = %e, "skipping category");
                        report.skipped += 1;
                        continue;
                    }
                }
                category.insert_into(conn, shadow)?;
                written.insert((category.id.clone(), category.category_type));
                report.inserted += 1;
            }
            Ok(report)
        })?;

        // Links point into the old category rows; they are rebuilt by the
        // program loaders that follow
        replace_table(conn, &PROGRAM_TO_CATEGORY, |_, _| Ok(()))?;
        Ok(report)
    })?;

    info!(inserted = report.inserted, skipped = report.skipped, "categories rebuilt");
    Ok(report)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReport {
    pub inserted: usize,
    pub skipped: usize,
}

/// Add program links whose program and category both exist
pub fn link_programs(store: &mut Store, links: &[ProgramCategoryLink]) -> Result<LinkReport> {
    let report = store.unit("reference:program_to_category", |conn| {
        let mut report = LinkReport::default();
        for link in links {
            if let Err(e) = check_link(conn, link) {
                warn!(error = %e, "skipping program link");
                report.skipped += 1;
                continue;
            }
            if link.insert(conn)? {
                report.inserted += 1;
            }
        }
        Ok(report)
    })?;

    info!(inserted = report.inserted, skipped = report.skipped, "program links added");
    Ok(report)
}

fn check_link(conn: &Connection, link: &ProgramCategoryLink) -> Result<(), ReconError> {
    let program: Option<String> = conn
        .query_row("SELECT id FROM program WHERE id = ?1", [&link.program_id], |row| row.get(0))
        .optional()?;
    if program.is_none() {
        return Err(ReconError::ReferentialIntegrity {
            entity: "program_to_category",
            id: link.category_id.clone(),
            target: "program",
            target_id: link.program_id.clone(),
        });
    }
    if !category_exists(conn, &link.category_id, link.category_type)? {
        return Err(ReconError::ReferentialIntegrity {
            entity: "program_to_category",
            id: link.program_id.clone(),
            target: "category",
            target_id: link.category_id.clone(),
        });
    }
    Ok(())
}

pub fn category_exists(conn: &Connection, id: &str, category_type: CategoryType) -> Result<bool, ReconError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM category WHERE id = ?1 AND type = ?2",
            params![id, category_type.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Every stored category of one type, parents first then by id
pub fn categories_of_type(conn: &Connection, category_type: CategoryType) -> Result<Vec<Category>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, parent_id FROM category
         WHERE type = ?1
         ORDER BY parent_id IS NOT NULL, id",
    )?;
    let rows = stmt
        .query_map([category_type.as_str()], |row| {
            Ok(Category {
                id: row.get(0)?,
                category_type,
                name: row.get(1)?,
                parent_id: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows() -> Vec<CategoryMappingRow> {
        vec![
            CategoryMappingRow::new("10.001", "Education", "Higher Education"),
            CategoryMappingRow::new("10.002", "Education", "K-12 Education"),
            CategoryMappingRow::new("10.003", "Health", "Public Health"),
        ]
    }

    fn sample_dictionary() -> Dictionary {
        serde_json::from_str(
            r#"{"_embedded": {"jSONObjectList": [
                {"id": "assistance_type", "elements": [
                    {"element_id": "01", "value": "FORMULA GRANTS",
                     "elements": [{"element_id": "01A", "value": "Formula Grant Sub-type"}]},
                    {"element_id": "02", "value": "PROJECT GRANTS", "elements": []}
                ]},
                {"id": "applicant_types", "elements": [
                    {"element_id": "01", "value": "State Government"},
                    {"element_id": "02", "value": "Local Government"}
                ]},
                {"id": "beneficiary_types", "elements": [
                    {"element_id": "01", "value": "Individual/Family"}
                ]},
                {"id": "functional_codes", "elements": [
                    {"element_id": "X", "value": "Ignored"}
                ]}
            ]}}"#,
        )
        .unwrap()
    }

    fn assistance_names() -> HashMap<String, String> {
        HashMap::from([("FORMULA GRANTS".to_string(), "Formula Grants".to_string())])
    }

    fn seed_program(store: &mut Store, id: &str) {
        store
            .unit("seed", |conn| {
                conn.execute("INSERT INTO program (id, name) VALUES (?1, 'Seeded')", [id])?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Income Security"), "income-security");
        assert_eq!(slug(""), "");
        assert_eq!(slug("K-12 Education"), "k-12-education");
        assert_eq!(slug("Health & Human Services"), "health-human-services");
        assert_eq!(slug("  --Sample Category, Name!  "), "sample-category-name");
        assert_eq!(slug("!!!"), "");
    }

    #[test]
    fn test_csv_hierarchy() {
        let graph = build_categories_from_csv(&sample_rows());

        let parents: Vec<&str> = graph.top_level().map(|c| c.name.as_str()).collect();
        assert_eq!(parents, vec!["Education", "Health"]);
        assert_eq!(graph.children_of("education").count(), 2);
        assert_eq!(graph.children_of("health").count(), 1);
        assert_eq!(graph.links.len(), 3);
        assert_eq!(graph.links[1].category_id, "k-12-education");

        println!("✅ Category hierarchy test PASSED");
    }

    #[test]
    fn test_slug_collision_is_one_category() {
        let rows = vec![
            CategoryMappingRow::new("10.001", "Income Security", "Housing"),
            CategoryMappingRow::new("10.002", "income security", "Housing"),
            CategoryMappingRow::new("10.002", "income security", "Housing"),
        ];
        let graph = build_categories_from_csv(&rows);

        assert_eq!(graph.top_level().count(), 1);
        assert_eq!(graph.top_level().next().unwrap().name, "income security");
        assert_eq!(graph.links.len(), 2);
    }

    #[test]
    fn test_dictionary_vocabularies() {
        let categories = build_categories(&sample_dictionary(), &assistance_names());

        assert_eq!(categories.len(), 6);
        let formula = categories
            .iter()
            .find(|c| c.id == "01" && c.category_type == CategoryType::Assistance)
            .unwrap();
        assert_eq!(formula.name, "Formula Grants");

        let sub = categories.iter().find(|c| c.id == "01A").unwrap();
        assert_eq!(sub.parent_id.as_deref(), Some("01"));

        let project = categories
            .iter()
            .find(|c| c.id == "02" && c.category_type == CategoryType::Assistance)
            .unwrap();
        assert_eq!(project.name, "PROJECT GRANTS");

        assert!(categories
            .iter()
            .filter(|c| c.category_type != CategoryType::Assistance)
            .all(|c| c.parent_id.is_none()));
    }

    #[test]
    fn test_install_writes_parents_first_and_skips_orphans() {
        let mut store = Store::open_in_memory().unwrap();
        let categories = vec![
            Category::child("higher-education", CategoryType::Category, "Higher Education", "education"),
            Category::top_level("education", CategoryType::Category, "Education"),
            Category::child("orphan", CategoryType::Category, "Orphan", "missing"),
            // Same id under a different type is a different category
            Category::child("x", CategoryType::Assistance, "X", "education"),
        ];

        let report = install_categories(&mut store, &categories).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(store.count_rows("category").unwrap(), 2);

        let stored = categories_of_type(store.conn(), CategoryType::Category).unwrap();
        assert_eq!(stored[0].id, "education");
        assert_eq!(stored[1].parent_id.as_deref(), Some("education"));
    }

    #[test]
    fn test_reinstall_replaces_and_clears_links() {
        let mut store = Store::open_in_memory().unwrap();
        let graph = build_categories_from_csv(&sample_rows());
        install_categories(&mut store, &graph.categories).unwrap();
        seed_program(&mut store, "10.001");
        link_programs(&mut store, &graph.links).unwrap();
        assert_eq!(store.count_rows("program_to_category").unwrap(), 1);

        install_categories(&mut store, &graph.categories).unwrap();
        assert_eq!(store.count_rows("category").unwrap(), 5);
        assert_eq!(store.count_rows("program_to_category").unwrap(), 0);
    }

    #[test]
    fn test_link_programs_requires_both_ends() {
        let mut store = Store::open_in_memory().unwrap();
        let graph = build_categories_from_csv(&sample_rows());
        install_categories(&mut store, &graph.categories).unwrap();
        seed_program(&mut store, "10.001");
        seed_program(&mut store, "10.002");

        let mut links = graph.links.clone();
        links.push(ProgramCategoryLink::new("10.001", "no-such-category", CategoryType::Category));

        let report = link_programs(&mut store, &links).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 2);
    }

    #[test]
    fn test_ensure_requires_parent() {
        let mut store = Store::open_in_memory().unwrap();
        let result = store.unit("ensure", |conn| {
            Category::child("tax-policy", CategoryType::Category, "Tax Policy", "economics").ensure(conn)
        });
        assert!(result.is_err());

        let written = store
            .unit("ensure", |conn| {
                Category::top_level("economics", CategoryType::Category, "Economics").ensure(conn)?;
                Category::child("tax-policy", CategoryType::Category, "Tax Policy", "economics").ensure(conn)
            })
            .unwrap();
        assert!(written);
        assert_eq!(store.count_rows("category").unwrap(), 2);
    }

    #[test]
    fn test_read_mapping_with_and_without_header() {
        let dir = tempfile::tempdir().unwrap();
        let with_header = dir.path().join("with.csv");
        std::fs::write(
            &with_header,
            "program_number,function,sub_function\n10.001,Education,Higher Education\n",
        )
        .unwrap();
        let without_header = dir.path().join("without.csv");
        std::fs::write(
            &without_header,
            "10.001,Education,Higher Education\n10.002,Education,\"K-12 Education\"\n",
        )
        .unwrap();

        assert_eq!(read_category_mapping(&with_header).unwrap().len(), 1);
        let rows = read_category_mapping(&without_header).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].subcategory, "K-12 Education");
    }

    #[test]
    fn test_read_mapping_skips_unreadable_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.csv");
        let mut contents = b"10.001,Education,Higher Education\n".to_vec();
        contents.extend_from_slice(b"10.002,Health,Bad \xff Care\n");
        contents.extend_from_slice(b"10.003,Health,Public Health\n");
        std::fs::write(&path, contents).unwrap();

        let rows = read_category_mapping(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].program_id, "10.001");
        assert_eq!(rows[1].program_id, "10.003");

        let graph = build_categories_from_csv(&rows);
        assert_eq!(graph.links.len(), 2);
    }
}
