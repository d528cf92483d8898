use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hcpe2e_domain::{DomainError, Environment, Label, LabelFilter, LabelSet};
use serde::Serialize;

use crate::context::TestContext;
use crate::error::HarnessError;

pub type TestFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type TestBody = Arc<dyn Fn(TestContext) -> TestFuture + Send + Sync>;

/// A named, labelled test body.
#[derive(Clone)]
pub struct TestCase {
    pub name:        String,
    pub description: String,
    pub labels:      LabelSet,
    pub body:        TestBody,
}

impl TestCase {
    pub fn new<F, Fut>(name: &str, description: &str, labels: impl IntoIterator<Item = Label>, body: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name:        name.to_string(),
            description: description.to_string(),
            labels:      LabelSet::new(labels),
            body:        Arc::new(move |ctx| Box::pin(body(ctx))),
        }
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

/// What `list` prints for one test.
#[derive(Debug, Clone, Serialize)]
pub struct TestSummary {
    pub name:        String,
    pub description: String,
    pub labels:      Vec<String>,
}

impl From<&TestCase> for TestSummary {
    fn from(t: &TestCase) -> Self {
        Self {
            name:        t.name.clone(),
            description: t.description.clone(),
            labels:      t.labels.iter().map(|l| l.as_str().to_string()).collect(),
        }
    }
}

/// A named label filter over the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct Suite {
    pub name:        &'static str,
    pub description: &'static str,
    pub filter:      &'static str,
}

pub const BUILTIN_SUITES: &[Suite] = &[
    Suite { name: "all",               description: "every registered test",                   filter: "" },
    Suite { name: "self-provisioning", description: "tests that create everything they need", filter: "RequireNothing" },
    Suite { name: "happy-path",        description: "tests against the shared cluster",        filter: "RequireHappyPath || RequireHappyPathInfra" },
    Suite { name: "critical",          description: "critical severity tests",                 filter: "Critical" },
    Suite { name: "negative",          description: "tests expecting the service to refuse",   filter: "Negative" },
];

impl Suite {
    pub fn label_filter(&self) -> Result<LabelFilter, DomainError> {
        LabelFilter::parse(self.filter)
    }
}

/// A test that selection dropped, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Skipped {
    pub name:   String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Selection {
    pub tests:   Vec<TestCase>,
    pub skipped: Vec<Skipped>,
}

impl Selection {
    pub fn needs_shared_cluster(&self) -> bool {
        self.tests.iter().any(|t| t.labels.requires_shared_cluster())
    }
}

// ── Catalog ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Catalog {
    tests:  Vec<TestCase>,
    suites: Vec<Suite>,
}

impl Catalog {
    /// Test names must be unique.
    pub fn new(tests: Vec<TestCase>) -> Result<Self, HarnessError> {
        let mut seen = HashSet::new();
        for t in &tests {
            if !seen.insert(t.name.as_str()) {
                return Err(DomainError::DuplicateTest(t.name.clone()).into());
            }
        }
        Ok(Self { tests, suites: BUILTIN_SUITES.to_vec() })
    }

    /// Catalog of the built-in scenarios.
    pub fn builtin() -> Result<Self, HarnessError> {
        Self::new(crate::scenarios::all())
    }

    pub fn tests(&self) -> &[TestCase] {
        &self.tests
    }

    pub fn suites(&self) -> &[Suite] {
        &self.suites
    }

    pub fn test(&self, name: &str) -> Result<&TestCase, HarnessError> {
        self.tests
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| HarnessError::UnknownTest(name.to_string()))
    }

    pub fn suite(&self, name: &str) -> Result<&Suite, HarnessError> {
        self.suites
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| HarnessError::UnknownSuite(name.to_string()))
    }

    /// Tests in `suite` (or the whole catalog) matching `filter`.
    pub fn matching(&self, suite: Option<&str>, filter: &LabelFilter) -> Result<Vec<&TestCase>, HarnessError> {
        let suite_filter = match suite {
            Some(name) => self.suite(name)?.label_filter()?,
            None => LabelFilter::match_all(),
        };
        Ok(self
            .tests
            .iter()
            .filter(|t| suite_filter.matches(&t.labels) && filter.matches(&t.labels))
            .collect())
    }

    /// Matching tests split by whether the environment admits them.
    pub fn select(
        &self,
        suite: Option<&str>,
        filter: &LabelFilter,
        environment: Environment,
        local_frontend: bool,
    ) -> Result<Selection, HarnessError> {
        let mut selection = Selection::default();
        for t in self.matching(suite, filter)? {
            match environment.admits(&t.labels, local_frontend) {
                Ok(()) => selection.tests.push(t.clone()),
                Err(reason) => selection.skipped.push(Skipped { name: t.name.clone(), reason }),
            }
        }
        Ok(selection)
    }
}
