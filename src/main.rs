use anyhow::Result;
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use assistance_recon::{ReconciliationRun, RunConfig};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();

    // assistance-recon [config.toml]
    let config = match args.get(1) {
        Some(path) => RunConfig::from_path(&PathBuf::from(path))?,
        None => RunConfig::default(),
    };

    println!("🗄️  Assistance Reconciliation v{}", assistance_recon::VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut run = ReconciliationRun::open(config)?;
    let summary = run.execute()?;

    println!("\n✓ Agencies:        {} ({} skipped)", summary.agencies.inserted, summary.agencies.skipped);
    println!("✓ Categories:      {} ({} skipped)", summary.categories.inserted, summary.categories.skipped);
    println!("✓ Programs:        {} ({} skipped)", summary.programs.inserted, summary.programs.skipped);
    println!("✓ Staging files:   {}", summary.staging.len());
    if let Some(fingerprint) = &summary.aggregate_fingerprint {
        println!("✓ Aggregates:      {}", fingerprint);
    }
    for (year, total) in &summary.obligation_totals {
        println!("✓ FY{} obligations: {:.2}", year, total);
    }

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if summary.is_clean() {
        println!("🎉 Run {} complete", summary.run_id);
    } else {
        println!("⚠️  Run {} complete with failures:", summary.run_id);
        for failure in &summary.failures {
            println!("   - {}", failure);
        }
    }

    Ok(())
}
