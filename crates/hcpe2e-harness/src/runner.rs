use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::context::Harness;
use crate::error::HarnessError;
use crate::registry::{Selection, TestCase};
use crate::tracker::TeardownReport;

pub const DEFAULT_PARALLELISM: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Passed,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct TestResult {
    pub name:     String,
    pub outcome:  Outcome,
    pub duration: Duration,
    /// Cleanup failures. Reported, but they do not fail the test.
    pub teardown: TeardownReport,
}

impl TestResult {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub suite:      String,
    pub started_at: DateTime<Utc>,
    pub duration:   Duration,
    pub results:    Vec<TestResult>,
}

impl RunReport {
    fn count(&self, f: impl Fn(&Outcome) -> bool) -> usize {
        self.results.iter().filter(|r| f(&r.outcome)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped(_)))
    }

    pub fn teardown_errors(&self) -> usize {
        self.results.iter().map(|r| r.teardown.errors.len()).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Shared-cluster tests need the setup loaded before anything runs.
pub fn check_preconditions(harness: &Harness, selection: &Selection) -> Result<(), HarnessError> {
    if selection.needs_shared_cluster() && harness.setup().is_none() {
        let names: Vec<&str> = selection
            .tests
            .iter()
            .filter(|t| t.labels.requires_shared_cluster())
            .map(|t| t.name.as_str())
            .collect();
        return Err(HarnessError::Precondition(format!(
            "shared cluster setup is not populated but selected tests require it: {}",
            names.join(", ")
        )));
    }
    Ok(())
}

/// Run the selection with at most `parallelism` tests at a time.
/// Results come back in selection order; skipped tests are listed last.
pub async fn run_suite(
    harness: Arc<Harness>,
    suite: &str,
    selection: Selection,
    parallelism: usize,
) -> Result<RunReport, HarnessError> {
    check_preconditions(&harness, &selection)?;
    let started_at = Utc::now();
    let clock = Instant::now();
    info!(suite, tests = selection.tests.len(), skipped = selection.skipped.len(), parallelism, "starting run");

    let permits = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut tasks = JoinSet::new();
    let mut spawned = HashMap::new();
    for (index, test) in selection.tests.into_iter().enumerate() {
        let harness = harness.clone();
        let permits = permits.clone();
        let suite = suite.to_string();
        let name = test.name.clone();
        let handle = tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            run_test(harness, &suite, test).await
        });
        spawned.insert(handle.id(), (index, name));
    }

    let mut results: Vec<(usize, TestResult)> = Vec::new();
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, result)) => {
                if let Some((index, _)) = spawned.remove(&id) {
                    results.push((index, result));
                }
            }
            Err(e) => {
                let Some((index, name)) = spawned.remove(&e.id()) else {
                    error!(error = %e, "unknown test task failed");
                    continue;
                };
                error!(test = %name, error = %e, "test task failed outside the test body");
                let message = if e.is_panic() {
                    format!("test harness panicked: {}", panic_message(e.into_panic()))
                } else {
                    format!("test task cancelled: {}", e)
                };
                results.push((index, TestResult {
                    name,
                    outcome:  Outcome::Failed(message),
                    duration: clock.elapsed(),
                    teardown: TeardownReport::default(),
                }));
            }
        }
    }
    results.sort_by_key(|(index, _)| *index);
    let mut results: Vec<TestResult> = results.into_iter().map(|(_, r)| r).collect();
    results.extend(selection.skipped.into_iter().map(|s| TestResult {
        name:     s.name,
        outcome:  Outcome::Skipped(s.reason),
        duration: Duration::ZERO,
        teardown: TeardownReport::default(),
    }));

    let report = RunReport { suite: suite.to_string(), started_at, duration: clock.elapsed(), results };
    info!(
        suite,
        passed = report.passed(),
        failed = report.failed(),
        skipped = report.skipped(),
        teardown_errors = report.teardown_errors(),
        "run finished"
    );
    Ok(report)
}

/// Run one test and always tear it down. A panicking body fails the test.
pub async fn run_test(harness: Arc<Harness>, suite: &str, test: TestCase) -> TestResult {
    let span = info_span!("test", name = %test.name);
    let ctx = harness.context(vec![suite.to_string(), test.name.clone()]);
    let clock = Instant::now();

    async move {
        info!("test started");
        let body = (test.body)(ctx.clone());
        let outcome = match tokio::spawn(body.in_current_span()).await {
            Ok(Ok(())) => Outcome::Passed,
            Ok(Err(e)) => Outcome::Failed(format!("{:#}", e)),
            Err(e) if e.is_panic() => Outcome::Failed(format!("test panicked: {}", panic_message(e.into_panic()))),
            Err(e) => Outcome::Failed(format!("test task cancelled: {}", e)),
        };
        match &outcome {
            Outcome::Passed => info!("test passed"),
            Outcome::Failed(message) => error!(error = %message, "test failed"),
            Outcome::Skipped(_) => {}
        }

        let teardown = ctx.teardown().await;
        if !teardown.is_clean() {
            warn!(errors = teardown.errors.len(), "teardown left resources behind");
        }
        TestResult { name: test.name, outcome, duration: clock.elapsed(), teardown }
    }
    .instrument(span)
    .await
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}
