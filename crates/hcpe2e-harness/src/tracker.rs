use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use hcpe2e_cloud::CloudError;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Prefix of the marker files an out-of-process sweep uses to find groups.
pub const TRACKED_MARKER_PREFIX: &str = "tracked-resource-group_";

/// Deletes the things a test registered. Every method has delete-if-exists
/// semantics.
#[async_trait]
pub trait ResourceCleaner: Send + Sync {
    async fn delete_resource(&self, id: &str) -> Result<(), CloudError>;

    async fn delete_resource_group(&self, name: &str) -> Result<(), CloudError>;

    async fn delete_application(&self, object_id: &str) -> Result<(), CloudError>;
}

#[derive(Debug, Default)]
struct Inner {
    resources:       Vec<String>,
    resource_groups: Vec<String>,
    applications:    Vec<String>,
}

/// Failures from one teardown. Never turns a passed test into a failed one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TeardownReport {
    pub deleted: usize,
    pub errors:  Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn record(&mut self, what: &str, result: Result<(), CloudError>) {
        match result {
            Ok(()) => self.deleted += 1,
            Err(e) if e.is_ignorable_cleanup() => {
                debug!(what, "already gone");
                self.deleted += 1;
            }
            Err(e) => {
                warn!(what, error = %e, "cleanup failed");
                self.errors.push(format!("{}: {}", what, e));
            }
        }
    }
}

/// Per-test registry of created cloud resources.
///
/// Clones share state. Teardown drains the registry, so tearing down twice
/// deletes nothing the second time.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    inner:      Arc<RwLock<Inner>>,
    shared_dir: Option<PathBuf>,
}

impl ResourceTracker {
    pub fn new(shared_dir: Option<PathBuf>) -> Self {
        Self { inner: Arc::default(), shared_dir }
    }

    pub async fn track_resource_group(&self, name: &str) {
        {
            let mut guard = self.inner.write().await;
            if guard.resource_groups.iter().any(|rg| rg == name) {
                return;
            }
            guard.resource_groups.push(name.to_string());
        }
        if let Some(dir) = &self.shared_dir {
            if let Err(e) = write_marker(dir, name) {
                warn!(resource_group = name, error = %e, "failed writing resource group cleanup marker");
            }
        }
        debug!(resource_group = name, "tracking resource group");
    }

    /// Track a specific resource by full ARM ID. Deleted before any group.
    pub async fn track_resource(&self, id: &str) {
        self.inner.write().await.resources.push(id.to_string());
    }

    /// Track an app registration by object ID.
    pub async fn track_application(&self, object_id: &str) {
        self.inner.write().await.applications.push(object_id.to_string());
    }

    pub async fn resource_groups(&self) -> Vec<String> {
        self.inner.read().await.resource_groups.clone()
    }

    pub async fn is_empty(&self) -> bool {
        let guard = self.inner.read().await;
        guard.resources.is_empty() && guard.resource_groups.is_empty() && guard.applications.is_empty()
    }

    /// Delete everything tracked: specific resources newest first, then
    /// resource groups in parallel, then app registrations.
    pub async fn teardown(&self, cleaner: Arc<dyn ResourceCleaner>) -> TeardownReport {
        let Inner { resources, resource_groups, applications } = std::mem::take(&mut *self.inner.write().await);
        let mut report = TeardownReport::default();

        for id in resources.iter().rev() {
            report.record(id, cleaner.delete_resource(id).await);
        }

        let mut tasks = JoinSet::new();
        for name in resource_groups {
            let cleaner = cleaner.clone();
            tasks.spawn(async move {
                let result = cleaner.delete_resource_group(&name).await;
                (name, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, result)) => report.record(&format!("resource group {}", name), result),
                Err(e) => report.errors.push(format!("resource group cleanup task failed: {}", e)),
            }
        }

        for object_id in &applications {
            report.record(&format!("app registration {}", object_id), cleaner.delete_application(object_id).await);
        }

        info!(deleted = report.deleted, failed = report.errors.len(), "teardown finished");
        report
    }
}

fn write_marker(dir: &Path, resource_group: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(format!("{}{}", TRACKED_MARKER_PREFIX, resource_group)), b"")
}

/// Resource groups named by marker files in `dir`.
pub fn read_markers(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str().and_then(|n| n.strip_prefix(TRACKED_MARKER_PREFIX)) else {
            continue;
        };
        if !name.is_empty() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
