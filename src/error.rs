// ⚠️ Error taxonomy for a reconciliation run
//
// Row-level problems (malformed records, dangling references) are counted and
// logged by the loaders; they only become values of this type when a caller
// asks for a single record to be validated.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconError {
    /// A source row or field could not be parsed
    #[error("malformed record in {source_name}: {detail}")]
    MalformedRecord { source_name: String, detail: String },

    /// A row references a parent entity that does not exist
    #[error("{entity} '{id}' references missing {target} '{target_id}'")]
    ReferentialIntegrity {
        entity: &'static str,
        id: String,
        target: &'static str,
        target_id: String,
    },

    /// A required input file was not present
    #[error("input not found: {0}")]
    MissingInput(String),

    #[error("unknown program type: {0}")]
    UnknownProgramType(String),

    #[error("SQLite error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ReconError {
    pub fn malformed(source_name: impl Into<String>, detail: impl Into<String>) -> Self {
        ReconError::MalformedRecord {
            source_name: source_name.into(),
            detail: detail.into(),
        }
    }

    /// True for errors that only invalidate one row, never the whole unit
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            ReconError::MalformedRecord { .. } | ReconError::ReferentialIntegrity { .. }
        )
    }
}
