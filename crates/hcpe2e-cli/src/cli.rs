use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use hcpe2e_domain::LabelFilter;
use hcpe2e_harness::{CleanupMode, DEFAULT_PARALLELISM};

#[derive(Debug, Parser)]
#[command(
    name = "hcpe2e",
    about = "End-to-end tests for hosted control plane clusters",
    version
)]
pub struct Cli {
    /// Only consider tests whose labels match this expression.
    #[arg(long, env = "LABEL_FILTER", global = true)]
    pub label_filter: Option<LabelFilter>,

    /// Log output format. Levels come from RUST_LOG.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List registered tests.
    List {
        /// Only tests in this suite.
        #[arg(long)]
        suite: Option<String>,

        #[arg(long, default_value = "text")]
        output: ListOutput,
    },

    /// Run a single test by name.
    RunTest {
        name: String,
    },

    /// Run every test in a suite.
    RunSuite {
        name: String,

        /// Write a JUnit XML report here.
        #[arg(long)]
        junit: Option<PathBuf>,

        /// Maximum number of tests running at once.
        #[arg(long, default_value_t = DEFAULT_PARALLELISM)]
        parallelism: usize,
    },

    /// Delete leftover test resource groups.
    Cleanup(CleanupArgs),
}

#[derive(Debug, clap::Args)]
#[command(group(
    ArgGroup::new("target")
        .required(true)
        .args(["resource_group", "expired", "tracked"]),
))]
pub struct CleanupArgs {
    /// Resource group to delete. Repeatable.
    #[arg(long)]
    pub resource_group: Vec<String>,

    /// Delete e2e resource groups whose deleteAfter tag has passed.
    #[arg(long)]
    pub expired: bool,

    /// Delete resource groups recorded by test runs in SHARED_DIR.
    #[arg(long)]
    pub tracked: bool,

    /// Only touch groups in these locations.
    #[arg(long, conflicts_with = "exclude_location")]
    pub include_location: Vec<String>,

    /// Skip groups in these locations.
    #[arg(long)]
    pub exclude_location: Vec<String>,

    #[arg(long, conflicts_with = "is_development")]
    pub mode: Option<ModeArg>,

    /// Development environments have no resource provider; implies `--mode no-rp`.
    #[arg(long)]
    pub is_development: bool,

    /// Per resource group deletion timeout, e.g. 60m or 1h30m.
    #[arg(long, default_value = "60m", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Reference time for `--expired` (RFC3339). Defaults to now.
    #[arg(long, value_parser = parse_time)]
    pub evaluation_time: Option<DateTime<Utc>>,

    /// Print what would be deleted and stop.
    #[arg(long)]
    pub dry_run: bool,
}

impl CleanupArgs {
    pub fn cleanup_mode(&self) -> CleanupMode {
        match (self.mode, self.is_development) {
            (_, true) | (Some(ModeArg::NoRp), _) => CleanupMode::NoRp,
            _ => CleanupMode::Standard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListOutput {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Standard,
    NoRp,
}

/// Parse `90s`, `45m`, `2h`, or combinations such as `1h30m`.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let mut total = 0u64;
    let mut digits = String::new();
    for c in s.trim().chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits.parse().map_err(|_| format!("invalid duration {:?}", s))?;
        digits.clear();
        total += match c {
            's' => n,
            'm' => n * 60,
            'h' => n * 60 * 60,
            other => return Err(format!("invalid duration unit {:?} in {:?}", other, s)),
        };
    }
    if !digits.is_empty() || total == 0 {
        return Err(format!("invalid duration {:?}: expected e.g. 60m or 1h30m", s));
    }
    Ok(Duration::from_secs(total))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC3339 time {:?}: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("hcpe2e").chain(args.iter().copied()))
    }

    fn cleanup(args: &[&str]) -> CleanupArgs {
        let mut full = vec!["cleanup"];
        full.extend_from_slice(args);
        match parse(&full).unwrap().command {
            Command::Cleanup(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("60m").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("60").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn run_suite_defaults() {
        match parse(&["run-suite", "critical"]).unwrap().command {
            Command::RunSuite { name, junit, parallelism } => {
                assert_eq!(name, "critical");
                assert!(junit.is_none());
                assert_eq!(parallelism, DEFAULT_PARALLELISM);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn label_filter_is_parsed_globally() {
        let cli = parse(&["list", "--label-filter", "Critical && !Slow"]).unwrap();
        assert_eq!(cli.label_filter.unwrap().as_str(), "Critical && !Slow");
        assert!(parse(&["list", "--label-filter", "NotALabel"]).is_err());
    }

    #[test]
    fn cleanup_needs_exactly_one_target() {
        assert!(parse(&["cleanup"]).is_err());
        assert!(parse(&["cleanup", "--expired", "--tracked"]).is_err());
        assert!(parse(&["cleanup", "--resource-group", "rg-a", "--expired"]).is_err());
        assert_eq!(cleanup(&["--resource-group", "rg-a", "--resource-group", "rg-b"]).resource_group, vec!["rg-a", "rg-b"]);
    }

    #[test]
    fn cleanup_location_filters_are_exclusive() {
        assert!(parse(&["cleanup", "--expired", "--include-location", "uksouth", "--exclude-location", "westus3"]).is_err());
        assert_eq!(cleanup(&["--expired", "--exclude-location", "westus3"]).exclude_location, vec!["westus3"]);
    }

    #[test]
    fn development_implies_no_rp_and_conflicts_with_mode() {
        assert_eq!(cleanup(&["--expired"]).cleanup_mode(), CleanupMode::Standard);
        assert_eq!(cleanup(&["--expired", "--mode", "no-rp"]).cleanup_mode(), CleanupMode::NoRp);
        assert_eq!(cleanup(&["--expired", "--is-development"]).cleanup_mode(), CleanupMode::NoRp);
        assert!(parse(&["cleanup", "--expired", "--is-development", "--mode", "standard"]).is_err());
    }

    #[test]
    fn cleanup_timeout_and_evaluation_time() {
        let args = cleanup(&["--expired", "--timeout", "2h", "--evaluation-time", "2026-01-02T03:04:05Z"]);
        assert_eq!(args.timeout, Duration::from_secs(7200));
        assert_eq!(args.evaluation_time.unwrap().to_rfc3339(), "2026-01-02T03:04:05+00:00");
        assert_eq!(cleanup(&["--expired"]).timeout, Duration::from_secs(3600));
        assert!(parse(&["cleanup", "--expired", "--evaluation-time", "yesterday"]).is_err());
    }
}
