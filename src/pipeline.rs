// 🚀 Reconciliation run - every stage, in dependency order
//
// Mandatory stages (agencies, categories, registry programs) abort the run
// on failure because everything downstream references them. Later stages
// are contained: a failure is logged and recorded in the summary, and the
// run moves on with whatever earlier units committed.

use crate::aggregation::{aggregate_fingerprint, AggregationEngine, AggregationReport, TableOfficeMapping};
use crate::config::RunConfig;
use crate::db::Store;
use crate::entities::agency::{build_agencies, AgencyReport};
use crate::entities::category::{
    build_categories, build_categories_from_csv, install_categories, link_programs, read_category_mapping,
    CategoryGraph, CategoryReport, LinkReport,
};
use crate::entities::program::{load_registry_programs, program_ids_of_type, ProgramReport, ProgramType};
use crate::error::ReconError;
use crate::resolver::Resolver;
use crate::sources::{read_dictionary, read_listings, read_organizations, read_search_hashes};
use crate::staging::{source_files, AwardKind, FileOutcome, FileReport, StagingLoader};
use crate::supplementary::{load_additional_programs, load_improper_payment_mapping, SupplementReport};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const EVENT_RUN_COMPLETED: &str = "run_completed";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub agencies: AgencyReport,
    pub categories: CategoryReport,
    pub programs: ProgramReport,
    pub category_links: Option<LinkReport>,
    pub staging: Vec<FileReport>,
    pub aggregation: Option<AggregationReport>,
    pub aggregate_fingerprint: Option<String>,
    pub additional_programs: Option<SupplementReport>,
    pub improper_payments: Option<SupplementReport>,
    /// Resolved obligations across all registry programs, per configured fiscal year
    pub obligation_totals: BTreeMap<String, f64>,
    /// Contained stage failures, as "stage: error"
    pub failures: Vec<String>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
            && self
                .staging
                .iter()
                .all(|f| !matches!(f.outcome, FileOutcome::Failed(_)))
    }
}

/// One reconciliation run. Owns the store; dropping the run closes it.
pub struct ReconciliationRun {
    store: Store,
    config: RunConfig,
}

impl ReconciliationRun {
    pub fn open(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let path = config.database_path();
        let store = Store::open(&path)?;
        info!(database = %path.display(), run_id = store.run_id(), "store opened");
        Ok(ReconciliationRun { store, config })
    }

    pub fn with_store(store: Store, config: RunConfig) -> Self {
        ReconciliationRun { store, config }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn execute(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary {
            run_id: self.store.run_id().to_string(),
            ..RunSummary::default()
        };

        // ---- mandatory reference stages ----
        summary.agencies = self.build_agencies().context("agency rebuild failed")?;
        let graph = self.mapping_graph(&mut summary.failures);
        summary.categories = self.build_categories(&graph).context("category rebuild failed")?;
        summary.programs = self.load_programs().context("registry program load failed")?;

        // ---- contained stages ----
        summary.category_links = contained(
            "category links",
            link_programs(&mut self.store, &graph.links),
            &mut summary.failures,
        );

        summary.staging = self.load_staging(&mut summary.failures);

        let mapping = TableOfficeMapping::from_config(&self.config);
        if mapping.is_empty() {
            info!("no contract office mapping configured, contract obligations stay at office level");
        }
        summary.aggregation = contained(
            "aggregation",
            AggregationEngine::new(&mut self.store)
                .with_office_mapping(mapping)
                .aggregate(),
            &mut summary.failures,
        );
        summary.aggregate_fingerprint = contained(
            "aggregate fingerprint",
            aggregate_fingerprint(self.store.conn()),
            &mut summary.failures,
        );

        let additional = self.source(&self.config.sources.additional_programs);
        summary.additional_programs = contained(
            "additional programs",
            load_additional_programs(&mut self.store, &additional),
            &mut summary.failures,
        )
        .flatten();

        let improper = self.source(&self.config.sources.improper_payment_mapping);
        summary.improper_payments = contained(
            "improper payment mapping",
            load_improper_payment_mapping(&mut self.store, &improper),
            &mut summary.failures,
        )
        .flatten();

        summary.obligation_totals = contained(
            "obligation totals",
            self.obligation_totals(),
            &mut summary.failures,
        )
        .unwrap_or_default();

        self.store.record(
            EVENT_RUN_COMPLETED,
            "run",
            serde_json::to_value(&summary).unwrap_or(serde_json::Value::Null),
        );
        info!(
            run_id = %summary.run_id,
            failures = summary.failures.len(),
            "reconciliation run complete"
        );
        Ok(summary)
    }

    fn source(&self, path: &Path) -> PathBuf {
        self.config.resolve(path)
    }

    fn required(&self, path: &Path) -> Result<PathBuf> {
        let resolved = self.source(path);
        if !resolved.exists() {
            return Err(ReconError::MissingInput(resolved.display().to_string()).into());
        }
        Ok(resolved)
    }

    fn build_agencies(&mut self) -> Result<AgencyReport> {
        let path = self.required(&self.config.sources.organizations)?;
        let records = read_organizations(&path)?;
        let names = self.config.agency_display_names();
        build_agencies(&mut self.store, &records, &names)
    }

    /// Curated budget-function tree; an absent or unreadable file yields
    /// an empty graph
    fn mapping_graph(&self, failures: &mut Vec<String>) -> CategoryGraph {
        let path = self.source(&self.config.sources.category_mapping);
        if !path.exists() {
            info!(file = %path.display(), "category mapping not found, skipping");
            return CategoryGraph::default();
        }
        contained("category mapping", read_category_mapping(&path), failures)
            .map(|rows| build_categories_from_csv(&rows))
            .unwrap_or_default()
    }

    fn build_categories(&mut self, graph: &CategoryGraph) -> Result<CategoryReport> {
        let path = self.required(&self.config.sources.dictionary)?;
        let dictionary = read_dictionary(&path)?;
        let mut categories = build_categories(&dictionary, &self.config.assistance_type_display_names());
        categories.extend(graph.categories.iter().cloned());
        install_categories(&mut self.store, &categories)
    }

    fn load_programs(&mut self) -> Result<ProgramReport> {
        let path = self.required(&self.config.sources.assistance_listings)?;
        let listings = read_listings(&path)?;
        let hashes = read_search_hashes(&self.source(&self.config.sources.usaspending_hashes))?;
        load_registry_programs(&mut self.store, &listings, &hashes)
    }

    /// Grand total of resolved obligations over every registry program, for
    /// each configured fiscal year
    fn obligation_totals(&self) -> Result<BTreeMap<String, f64>> {
        let conn = self.store.conn();
        let programs = program_ids_of_type(conn, ProgramType::AssistanceListing)?;
        let resolver = Resolver::from_connection(conn);
        let mut totals = BTreeMap::new();
        for year in &self.config.fiscal_years {
            let (_, total) = resolver.assistance_listing_obligations(&programs, year)?;
            totals.insert(year.clone(), total);
        }
        Ok(totals)
    }

    /// Initial snapshots for both award kinds, then deltas in file order
    fn load_staging(&mut self, failures: &mut Vec<String>) -> Vec<FileReport> {
        let sources = &self.config.sources;
        let initial = [
            (AwardKind::Assistance, self.config.resolve(&sources.assistance_initial_dir)),
            (AwardKind::Contract, self.config.resolve(&sources.contract_initial_dir)),
        ];
        let delta = [
            (AwardKind::Assistance, self.config.resolve(&sources.assistance_delta_dir)),
            (AwardKind::Contract, self.config.resolve(&sources.contract_delta_dir)),
        ];

        let mut reports = Vec::new();
        for (kind, dir) in initial {
            if let Some(files) = contained("staging listing", source_files(&dir), failures) {
                reports.extend(StagingLoader::new(&mut self.store).load_initial(kind, &files));
            }
        }
        for (kind, dir) in delta {
            if let Some(files) = contained("staging listing", source_files(&dir), failures) {
                reports.extend(StagingLoader::new(&mut self.store).load_delta(kind, &files));
            }
        }

        for report in &reports {
            if let FileOutcome::Failed(reason) = &report.outcome {
                warn!(file = %report.path.display(), reason = %reason, "staging file rolled back");
            }
        }
        reports
    }
}

/// Log and record a failure of a non-mandatory stage
fn contained<T>(stage: &str, result: Result<T>, failures: &mut Vec<String>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            error!(stage, error = %format!("{:#}", e), "stage failed, continuing");
            failures.push(format!("{}: {:#}", stage, e));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_mandatory_input_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            data_dir: dir.path().to_path_buf(),
            ..RunConfig::default()
        };
        let mut run = ReconciliationRun::with_store(Store::open_in_memory().unwrap(), config);

        let err = run.execute().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconError>(),
            Some(ReconError::MissingInput(_))
        ));
        assert_eq!(run.store().count_rows("agency").unwrap(), 0);
    }

    #[test]
    fn test_contained_records_failure() {
        let mut failures = Vec::new();
        let ok: Option<u8> = contained("ok", Ok(1), &mut failures);
        let failed: Option<u8> = contained("broken", Err(anyhow::anyhow!("no luck")), &mut failures);

        assert_eq!(ok, Some(1));
        assert!(failed.is_none());
        assert_eq!(failures, vec!["broken: no luck".to_string()]);
    }
}
