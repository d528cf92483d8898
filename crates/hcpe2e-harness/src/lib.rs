pub mod artifacts;
pub mod cleanup;
pub mod context;
pub mod error;
pub mod junit;
pub mod registry;
pub mod runner;
pub mod scenarios;
pub mod setup;
pub mod timing;
pub mod tracker;
pub mod verify;

pub use cleanup::{sweep, CleanupMode, CloudCleaner, LocationFilter, SweepOptions, SweepReport, SweepSelection};
pub use context::{Harness, TestContext};
pub use error::{HarnessError, VerifyError};
pub use registry::{Catalog, Selection, Suite, TestCase, TestSummary};
pub use runner::{run_suite, run_test, Outcome, RunReport, TestResult, DEFAULT_PARALLELISM};
pub use setup::load_shared_setup;
pub use timing::TimingRecorder;
pub use tracker::{ResourceCleaner, ResourceTracker, TeardownReport};
