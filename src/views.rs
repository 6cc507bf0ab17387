// 🖼️ Read models handed to the site generator
//
// Shapes are fixed by the consumer: category trees with `/category/<slug>`
// permalinks, applicant-type counts, and improper-payment summaries whose
// related programs link to `/program/<id>`.

use crate::entities::category::{categories_of_type, CategoryType};
use anyhow::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub title: String,
    pub permalink: String,
    pub subcategories: Vec<CategoryNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicantTypeCount {
    pub title: String,
    pub total_num_programs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedProgram {
    pub id: String,
    pub name: String,
    pub permalink: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImproperPaymentSummary {
    pub name: String,
    pub outlays: Option<f64>,
    pub improper_payments: Option<f64>,
    pub insufficient_payment: Option<f64>,
    pub high_priority: bool,
    pub related_programs: Vec<RelatedProgram>,
}

pub fn category_permalink(category_id: &str) -> String {
    format!("/category/{}", category_id)
}

pub fn program_permalink(program_id: &str) -> String {
    format!("/program/{}", program_id)
}

/// Budget-function tree, top-level categories and their subcategories by name
pub fn category_hierarchy(conn: &Connection) -> Result<Vec<CategoryNode>> {
    let categories = categories_of_type(conn, CategoryType::Category)?;

    let mut children: BTreeMap<&str, Vec<CategoryNode>> = BTreeMap::new();
    for category in &categories {
        if let Some(parent) = category.parent_id.as_deref() {
            children.entry(parent).or_default().push(CategoryNode {
                title: category.name.clone(),
                permalink: category_permalink(&category.id),
                subcategories: Vec::new(),
            });
        }
    }

    let mut tree: Vec<CategoryNode> = categories
        .iter()
        .filter(|c| c.parent_id.is_none())
        .map(|c| {
            let mut subcategories = children.remove(c.id.as_str()).unwrap_or_default();
            subcategories.sort_by(|a, b| a.title.cmp(&b.title));
            CategoryNode {
                title: c.name.clone(),
                permalink: category_permalink(&c.id),
                subcategories,
            }
        })
        .collect();
    tree.sort_by(|a, b| a.title.cmp(&b.title));
    Ok(tree)
}

/// Number of the given programs open to each applicant type, most common first
pub fn applicant_type_list<S: AsRef<str>>(conn: &Connection, program_ids: &[S]) -> Result<Vec<ApplicantTypeCount>> {
    let wanted: HashSet<&str> = program_ids.iter().map(|id| id.as_ref()).collect();
    if wanted.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT c.name, l.program_id
         FROM program_to_category l
         JOIN category c ON c.id = l.category_id AND c.type = l.category_type
         WHERE l.category_type = ?1",
    )?;
    let links = stmt
        .query_map([CategoryType::Applicant.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut programs_by_type: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    for (title, program_id) in links {
        if wanted.contains(program_id.as_str()) {
            programs_by_type.entry(title).or_default().insert(program_id);
        }
    }

    let mut counts: Vec<ApplicantTypeCount> = programs_by_type
        .into_iter()
        .map(|(title, programs)| ApplicantTypeCount {
            title,
            total_num_programs: programs.len(),
        })
        .collect();
    counts.sort_by(|a, b| {
        b.total_num_programs
            .cmp(&a.total_num_programs)
            .then_with(|| a.title.cmp(&b.title))
    });
    Ok(counts)
}

/// Improper-payment programs a program maps to, each with the other
/// programs that share that mapping
pub fn improper_payment_info(conn: &Connection, program_id: &str) -> Result<Vec<ImproperPaymentSummary>> {
    let mut stmt = conn.prepare(
        "SELECT improper_payment_program_name, outlays, improper_payment_amount,
                insufficient_documentation_amount, high_priority_program
         FROM improper_payment_mapping
         WHERE program_id = ?1
         ORDER BY improper_payment_program_name",
    )?;
    let mappings = stmt
        .query_map([program_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<f64>>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, i64>(4)? != 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut related_stmt = conn.prepare(
        "SELECT p.id, p.name
         FROM improper_payment_mapping m
         JOIN program p ON p.id = m.program_id
         WHERE m.improper_payment_program_name = ?1 AND m.program_id <> ?2
         ORDER BY p.id",
    )?;

    let mut summaries = Vec::with_capacity(mappings.len());
    for (name, outlays, improper_payments, insufficient_payment, high_priority) in mappings {
        let related_programs = related_stmt
            .query_map([name.as_str(), program_id], |row| {
                let id: String = row.get(0)?;
                let program_name: Option<String> = row.get(1)?;
                Ok(RelatedProgram {
                    permalink: program_permalink(&id),
                    name: program_name.unwrap_or_default(),
                    id,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        summaries.push(ImproperPaymentSummary {
            name,
            outlays,
            improper_payments,
            insufficient_payment,
            high_priority,
            related_programs,
        });
    }
    Ok(summaries)
}
