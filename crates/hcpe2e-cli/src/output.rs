use std::time::Duration;

use hcpe2e_harness::{Outcome, RunReport, SweepReport, TestSummary};

/// Render the test list as aligned text.
pub fn render_tests(tests: &[TestSummary]) -> String {
    if tests.is_empty() {
        return "No tests match.".to_string();
    }
    let width = tests.iter().map(|t| t.name.len()).max().unwrap_or(0);
    let mut out = String::new();
    for t in tests {
        out.push_str(&format!("{:<width$}  [{}]\n", t.name, t.labels.join(", "), width = width));
        out.push_str(&format!("{:<width$}  {}\n", "", t.description, width = width));
    }
    out
}

/// Per-test lines followed by a one-line summary.
pub fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    for r in &report.results {
        let line = match &r.outcome {
            Outcome::Passed => format!("PASS  {} ({})", r.name, format_duration(r.duration)),
            Outcome::Failed(message) => format!("FAIL  {} ({})\n      {}", r.name, format_duration(r.duration), message),
            Outcome::Skipped(reason) => format!("SKIP  {}: {}", r.name, reason),
        };
        out.push_str(&line);
        out.push('\n');
        for e in &r.teardown.errors {
            out.push_str(&format!("      cleanup: {}\n", e));
        }
    }
    out.push_str(&format!(
        "\n{}: {} passed, {} failed, {} skipped in {}",
        report.suite,
        report.passed(),
        report.failed(),
        report.skipped(),
        format_duration(report.duration),
    ));
    if report.teardown_errors() > 0 {
        out.push_str(&format!(" ({} cleanup errors)", report.teardown_errors()));
    }
    out.push('\n');
    out
}

pub fn render_sweep(report: &SweepReport, dry_run: bool) -> String {
    if report.selected.is_empty() {
        return "No resource groups selected.".to_string();
    }
    let mut out = String::new();
    if dry_run {
        for name in &report.selected {
            out.push_str(&format!("would delete {}\n", name));
        }
        return out;
    }
    for name in &report.deleted {
        out.push_str(&format!("deleted {}\n", name));
    }
    for e in &report.errors {
        out.push_str(&format!("error   {}\n", e));
    }
    out
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0..=59 => format!("{}.{:01}s", secs, d.subsec_millis() / 100),
        60..=3599 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}
