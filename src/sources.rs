// 📥 Upstream documents - registry listings, controlled vocabularies,
// organization hierarchy, spending-search hashes
//
// The extraction layer writes these to disk; this module only models and
// reads them. Fields are optional wherever the registry is known to omit them.

use crate::error::ReconError;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::Path;

// ============================================================================
// REGISTRY LISTING (one document per program)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AssistanceListing {
    /// Registry document id (used in the public listing URL)
    #[serde(default)]
    pub id: String,
    pub data: ListingData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListingData {
    pub program_number: Option<String>,
    pub title: Option<String>,
    #[serde(deserialize_with = "opt_string_or_number")]
    pub organization_id: Option<String>,
    pub objective: Option<String>,
    pub alternative_names: Option<Vec<String>>,
    pub compliance: Compliance,
    pub financial: Financial,
    pub eligibility: Eligibility,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Compliance {
    #[serde(rename = "CFR200Requirements")]
    pub cfr200_requirements: Cfr200Requirements,
    pub documents: ComplianceDocuments,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Cfr200Requirements {
    pub questions: Vec<ComplianceQuestion>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComplianceQuestion {
    pub code: String,
    pub is_selected: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComplianceDocuments {
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Financial {
    pub obligations: Vec<ObligationEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObligationEntry {
    pub assistance_type: Option<String>,
    pub values: Vec<ObligationValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObligationValue {
    pub year: i64,
    #[serde(default)]
    pub actual: Option<f64>,
    #[serde(default)]
    pub estimate: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Eligibility {
    pub applicant: TypeList,
    pub beneficiary: TypeList,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TypeList {
    pub types: Vec<String>,
}

impl ListingData {
    pub fn is_subpart_f(&self) -> bool {
        self.compliance
            .cfr200_requirements
            .questions
            .iter()
            .any(|q| q.code == "subpartF" && q.is_selected == Some(true))
    }

    pub fn popular_name(&self) -> Option<&str> {
        self.alternative_names
            .as_ref()
            .and_then(|names| names.iter().find(|n| !n.trim().is_empty()))
            .map(|n| n.as_str())
    }

    pub fn rules_regulations(&self) -> Option<&str> {
        self.compliance.documents.description.as_deref()
    }
}

// ============================================================================
// CONTROLLED VOCABULARIES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Dictionary {
    #[serde(rename = "_embedded")]
    pub embedded: DictionaryEmbedded,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DictionaryEmbedded {
    #[serde(rename = "jSONObjectList", default)]
    pub lists: Vec<Vocabulary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Vocabulary {
    pub id: String,
    #[serde(default)]
    pub elements: Vec<VocabularyElement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VocabularyElement {
    pub element_id: String,
    pub value: String,
    #[serde(default)]
    pub elements: Option<Vec<VocabularyElement>>,
}

// ============================================================================
// ORGANIZATION HIERARCHY
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationRecord {
    #[serde(deserialize_with = "opt_string_or_number", default)]
    pub org_key: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub agency_name: Option<String>,
    #[serde(rename = "l1OrgKey", deserialize_with = "opt_string_or_number", default)]
    pub l1_org_key: Option<String>,
    #[serde(rename = "l2OrgKey", deserialize_with = "opt_string_or_number", default)]
    pub l2_org_key: Option<String>,
}

/// Accept `"123"`, `123` or `null` for identifier fields
fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// ============================================================================
// READERS
// ============================================================================

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let value = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(value)
}

pub fn read_listings(path: &Path) -> Result<Vec<AssistanceListing>> {
    read_json(path)
}

pub fn read_dictionary(path: &Path) -> Result<Dictionary> {
    read_json(path)
}

pub fn read_organizations(path: &Path) -> Result<Vec<OrganizationRecord>> {
    read_json(path)
}

/// Program number → spending-search hash; absent file means no links
pub fn read_search_hashes(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    read_json(path)
}

// ============================================================================
// FIELD CLEANING
// ============================================================================

/// Drop line breaks and collapse runs of spaces
pub fn clean_text(raw: &str) -> String {
    let without_breaks: String = raw.chars().filter(|c| *c != '\n' && *c != '\r').collect();
    without_breaks.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a transaction amount. Missing or blank → 0.0; anything else must be
/// a finite number.
pub fn parse_amount(source_name: &str, field: &str, raw: Option<&str>) -> Result<f64, ReconError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(0.0),
        Some(s) => s
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ReconError::malformed(source_name, format!("{} is not numeric: '{}'", field, s))),
    }
}

/// Parse currency-formatted text such as `"$1,000,000"` or `"($5.25)"`.
/// Blank → `None`.
pub fn parse_currency(raw: &str) -> Result<Option<f64>, ReconError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let (negative, body) = if trimmed.starts_with('(') && trimmed.ends_with(')') {
        (true, &trimmed[1..trimmed.len() - 1])
    } else if let Some(rest) = trimmed.strip_prefix('-') {
        (true, rest)
    } else {
        (false, trimmed)
    };

    let digits: String = body
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    let value = digits
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ReconError::malformed("currency", format!("not an amount: '{}'", raw)))?;

    Ok(Some(if negative { -value } else { value }))
}
