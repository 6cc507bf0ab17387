// Assistance Reconciliation - Core Library
// Exposes every engine for the CLI and the integration tests

pub mod db;
pub mod error;
pub mod config;
pub mod constants;
pub mod sources;        // Upstream documents (registry, dictionary, organizations)
pub mod staging;        // Staging Loader - award transactions
pub mod aggregation;    // Aggregation Engine - obligation/outlay summaries
pub mod entities;       // Reference Builder - agencies, categories, programs
pub mod resolver;       // Multi-Source Obligation Resolver
pub mod supplementary;  // Supplementary Loader - curated spreadsheets
pub mod views;          // Read models for the site generator
pub mod pipeline;       // One reconciliation run

// Re-export commonly used types
pub use db::{replace_table, Event, Store, TableSpec};
pub use error::ReconError;
pub use config::{RunConfig, SourcePaths};
pub use staging::{AwardKind, FileOutcome, FileReport, StagingLoader};
pub use aggregation::{
    aggregate_fingerprint, AggregationEngine, AggregationReport, ContractOfficeMapping,
    NoOfficeMapping, TableOfficeMapping,
};
pub use entities::{
    Agency, AgencyRegistry, Category, CategoryGraph, CategoryType, Program, ProgramCategoryLink,
    ProgramType,
};
pub use resolver::{
    AssistanceObligation, ObligationFact, OtherProgramKind, OtherProgramObligation, OutlayPoint,
    Resolver,
};
pub use supplementary::{load_additional_programs, load_improper_payment_mapping, SupplementReport};
pub use pipeline::{ReconciliationRun, RunSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
