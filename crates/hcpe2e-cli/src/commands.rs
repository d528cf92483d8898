use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use hcpe2e_config::HarnessConfig;
use hcpe2e_domain::LabelFilter;
use hcpe2e_harness::registry::Skipped;
use hcpe2e_harness::{
    junit, load_shared_setup, run_suite as run_selection, sweep, Catalog, CloudCleaner, Harness, LocationFilter,
    RunReport, Selection, SweepOptions, SweepSelection, TestSummary,
};
use tracing::{info, warn};

use crate::cli::{CleanupArgs, ListOutput};
use crate::output;

// ── List ──────────────────────────────────────────────────────────────────────

pub fn list(filter: &LabelFilter, suite: Option<&str>, format: ListOutput) -> Result<()> {
    let catalog = Catalog::builtin()?;
    let tests: Vec<TestSummary> = catalog.matching(suite, filter)?.into_iter().map(TestSummary::from).collect();
    match format {
        ListOutput::Text => print!("{}", output::render_tests(&tests)),
        ListOutput::Json => println!("{}", serde_json::to_string_pretty(&tests)?),
    }
    Ok(())
}

// ── Run ───────────────────────────────────────────────────────────────────────

/// Run one test; returns whether it passed.
pub async fn run_test(name: &str) -> Result<bool> {
    let config = HarnessConfig::from_env().context("failed to read configuration from the environment")?;
    let catalog = Catalog::builtin()?;
    let test = catalog.test(name)?.clone();

    let mut selection = Selection::default();
    match config.environment.admits(&test.labels, config.uses_local_frontend()) {
        Ok(()) => selection.tests.push(test),
        Err(reason) => selection.skipped.push(Skipped { name: test.name.clone(), reason }),
    }

    let report = execute(config, name, selection, 1).await?;
    print!("{}", output::render_report(&report));
    Ok(report.is_success())
}

/// Run a suite, optionally writing JUnit; returns whether every test passed.
pub async fn run_suite(
    name: &str,
    filter: &LabelFilter,
    junit_path: Option<PathBuf>,
    parallelism: usize,
) -> Result<bool> {
    if parallelism == 0 {
        bail!("--parallelism must be at least 1");
    }
    let config = HarnessConfig::from_env().context("failed to read configuration from the environment")?;
    let catalog = Catalog::builtin()?;
    let selection = catalog.select(Some(name), filter, config.environment, config.uses_local_frontend())?;
    if selection.tests.is_empty() && selection.skipped.is_empty() {
        bail!("no tests in suite {:?} match label filter {}", name, filter);
    }

    let report = execute(config, name, selection, parallelism).await?;
    if let Some(path) = junit_path {
        junit::write(&path, &report).with_context(|| format!("failed to write JUnit report to {}", path.display()))?;
        info!(path = %path.display(), "wrote JUnit report");
    }
    print!("{}", output::render_report(&report));
    Ok(report.is_success())
}

/// Connect, load the shared cluster when the selection needs it, and run.
/// Anything suite setup deployed is deleted afterwards, even when setup fails.
async fn execute(config: HarnessConfig, suite: &str, selection: Selection, parallelism: usize) -> Result<RunReport> {
    let mut harness = Harness::connect(config).await.context("failed to connect to Azure")?;
    if selection.needs_shared_cluster() {
        let loaded = load_shared_setup(
            harness.config(),
            harness.arm(),
            harness.subscription_id(),
            Path::new("."),
            harness.suite_resources(),
        )
        .await;
        let setup = match loaded {
            Ok(setup) => setup,
            Err(e) => {
                harness.teardown_suite().await;
                return Err(anyhow::Error::new(e).context("failed to load the shared cluster setup"));
            }
        };
        info!(resource_group = setup.resource_group(), cluster = setup.cluster_name(), "loaded shared cluster setup");
        harness = harness.with_setup(setup);
    }

    let harness = Arc::new(harness);
    let report = run_selection(harness.clone(), suite, selection, parallelism).await;
    let teardown = harness.teardown_suite().await;
    for e in &teardown.errors {
        warn!(error = %e, "suite cleanup failed");
    }
    Ok(report?)
}

// ── Cleanup ───────────────────────────────────────────────────────────────────

/// Sweep leftover resource groups; returns whether every deletion succeeded.
pub async fn cleanup(args: CleanupArgs) -> Result<bool> {
    let config = HarnessConfig::from_env().context("failed to read configuration from the environment")?;
    let selection = if args.expired {
        SweepSelection::Expired(args.evaluation_time.unwrap_or_else(Utc::now))
    } else if args.tracked {
        let dir = config
            .shared_dir
            .clone()
            .context("--tracked requires SHARED_DIR to be set")?;
        SweepSelection::Tracked(dir)
    } else {
        SweepSelection::Named(args.resource_group.clone())
    };
    let opts = SweepOptions {
        selection,
        locations: LocationFilter {
            include: args.include_location.iter().cloned().collect(),
            exclude: args.exclude_location.iter().cloned().collect(),
        },
        dry_run: args.dry_run,
    };

    let mode = args.cleanup_mode();
    let harness = Harness::connect(config).await.context("failed to connect to Azure")?;
    let cleaner = CloudCleaner::new(harness.arm().clone(), harness.hcp(), harness.subscription_id(), mode, args.timeout);
    info!(mode = %mode, timeout = ?args.timeout, dry_run = args.dry_run, "starting resource group cleanup");

    let report = sweep(Arc::new(cleaner), &opts).await?;
    print!("{}", output::render_sweep(&report, args.dry_run));
    Ok(report.errors.is_empty())
}
