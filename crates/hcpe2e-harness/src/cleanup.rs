use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hcpe2e_cloud::clusters::HCP_API_VERSION;
use hcpe2e_cloud::identities::IDENTITY_API_VERSION;
use hcpe2e_cloud::network::NETWORK_API_VERSION;
use hcpe2e_cloud::resource_groups::RESOURCE_GROUPS_API_VERSION;
use hcpe2e_cloud::{
    ArmClient, CloudError, GraphClient, HcpClient, PollPolicy, RequestOptions, ResourceGroup,
    ResourceGroupsClient,
};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::HarnessError;
use crate::timing::TimingRecorder;
use crate::tracker::{read_markers, ResourceCleaner, TRACKED_MARKER_PREFIX};

pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How a resource group is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupMode {
    /// Delete HCP clusters through the resource provider first.
    #[default]
    Standard,
    /// The resource provider is gone: force-delete managed groups directly.
    NoRp,
}

impl FromStr for CleanupMode {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(CleanupMode::Standard),
            "no-rp" => Ok(CleanupMode::NoRp),
            other => Err(HarnessError::Precondition(format!("invalid cleanup workflow: {}", other))),
        }
    }
}

impl std::fmt::Display for CleanupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupMode::Standard => f.write_str("standard"),
            CleanupMode::NoRp     => f.write_str("no-rp"),
        }
    }
}

/// API version ARM expects when deleting `id` directly.
pub fn api_version_for(id: &str) -> &'static str {
    let lower = id.to_ascii_lowercase();
    if lower.contains("/providers/microsoft.redhatopenshift/") {
        HCP_API_VERSION
    } else if lower.contains("/providers/microsoft.managedidentity/") {
        IDENTITY_API_VERSION
    } else if lower.contains("/providers/microsoft.network/") {
        NETWORK_API_VERSION
    } else {
        RESOURCE_GROUPS_API_VERSION
    }
}

type CleanupFuture<'a> = Pin<Box<dyn Future<Output = Result<(), CloudError>> + Send + 'a>>;

// ── Cloud cleaner ─────────────────────────────────────────────────────────────

/// Deletes tracked resources in the cloud with the configured workflow.
#[derive(Clone)]
pub struct CloudCleaner {
    arm:             ArmClient,
    resource_groups: ResourceGroupsClient,
    hcp:             HcpClient,
    graph:           GraphClient,
    mode:            CleanupMode,
    policy:          PollPolicy,
    timing:          Option<TimingRecorder>,
}

impl CloudCleaner {
    pub fn new(arm: ArmClient, hcp: HcpClient, subscription_id: &str, mode: CleanupMode, timeout: Duration) -> Self {
        Self {
            resource_groups: ResourceGroupsClient::new(arm.clone(), subscription_id),
            graph: GraphClient::new(arm.clone()),
            arm,
            hcp,
            mode,
            policy: PollPolicy::with_timeout(timeout),
            timing: None,
        }
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Record each group cleanup as a timing step.
    pub fn with_timing(mut self, recorder: TimingRecorder) -> Self {
        self.timing = Some(recorder);
        self
    }

    pub fn mode(&self) -> CleanupMode {
        self.mode
    }

    pub fn resource_groups(&self) -> &ResourceGroupsClient {
        &self.resource_groups
    }

    pub async fn cleanup_resource_group(&self, name: &str) -> Result<(), CloudError> {
        let (step, work): (String, CleanupFuture<'_>) = match self.mode {
            CleanupMode::Standard => (format!("Clean up resource group {}", name), Box::pin(self.cleanup_standard(name))),
            CleanupMode::NoRp => (format!("Clean up resource group {} (no RP)", name), Box::pin(self.cleanup_no_rp(name))),
        };
        match &self.timing {
            Some(recorder) => recorder.step(step, work).await,
            None => work.await,
        }
    }

    /// Delete every HCP cluster, make sure no managed group was left behind,
    /// then delete the group.
    async fn cleanup_standard(&self, name: &str) -> Result<(), CloudError> {
        info!(resource_group = name, "deleting all hcp clusters in resource group");
        self.hcp
            .delete_all_clusters(name, &self.policy)
            .await
            .map_err(|e| e.context("failed to cleanup resource group"))?;

        let managed = self
            .resource_groups
            .managed_by_clusters_in(name)
            .await
            .map_err(|e| e.context("failed to search for managed resource groups"))?;
        if !managed.is_empty() {
            return Err(CloudError::Cleanup(format!(
                "found {} managed resource groups left behind HCP clusters in {}",
                managed.len(),
                name
            )));
        }
        info!(resource_group = name, "no left behind managed resource groups found");

        self.resource_groups
            .delete(name, false, &self.policy)
            .await
            .map_err(|e| e.context("failed to cleanup resource group"))
    }

    /// Force-delete the managed groups of the clusters in `name`, then the group.
    async fn cleanup_no_rp(&self, name: &str) -> Result<(), CloudError> {
        let managed = self
            .resource_groups
            .managed_by_clusters_in(name)
            .await
            .map_err(|e| e.context("failed to search for managed resource groups"))?;

        for group in &managed {
            info!(resource_group = %group.name, parent = name, "deleting managed resource group");
            match self.resource_groups.delete(&group.name, true, &self.policy).await {
                Ok(()) => {}
                Err(e) if e.is_ignorable_cleanup() => {
                    info!(resource_group = %group.name, "ignoring not found resource group");
                }
                Err(e) => {
                    return Err(e.context(format!("failed to cleanup managed resource group {:?}", group.name)));
                }
            }
        }

        self.resource_groups
            .delete(name, false, &self.policy)
            .await
            .map_err(|e| e.context("failed to cleanup resource group"))
    }
}

#[async_trait]
impl ResourceCleaner for CloudCleaner {
    async fn delete_resource(&self, id: &str) -> Result<(), CloudError> {
        if id.to_ascii_lowercase().contains("/providers/microsoft.redhatopenshift/") {
            return self.hcp.delete_by_id(id, &self.policy).await;
        }
        let url = format!("{}?api-version={}", self.arm.management_url(id), api_version_for(id));
        self.arm
            .delete_and_wait(&url, &self.policy, &RequestOptions::management())
            .await
    }

    async fn delete_resource_group(&self, name: &str) -> Result<(), CloudError> {
        self.cleanup_resource_group(name).await
    }

    async fn delete_application(&self, object_id: &str) -> Result<(), CloudError> {
        self.graph.delete_application(object_id).await
    }
}

// ── Out-of-band sweep ─────────────────────────────────────────────────────────

/// Which resource groups a sweep considers. Exactly one source per sweep.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepSelection {
    Named(Vec<String>),
    /// E2E groups whose `deleteAfter` tag is earlier than this time.
    Expired(DateTime<Utc>),
    /// Groups named by marker files in this directory.
    Tracked(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct LocationFilter {
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
}

impl LocationFilter {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn admits(&self, location: &str) -> bool {
        let location = location.to_ascii_lowercase();
        if !self.include.is_empty() && !self.include.iter().any(|l| l.eq_ignore_ascii_case(&location)) {
            return false;
        }
        !self.exclude.iter().any(|l| l.eq_ignore_ascii_case(&location))
    }
}

#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub selection: SweepSelection,
    pub locations: LocationFilter,
    pub dry_run:   bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub selected: Vec<String>,
    pub deleted:  Vec<String>,
    pub errors:   Vec<String>,
}

/// Resolve the selection to group names, applying location filters.
pub async fn select_resource_groups(
    resource_groups: &ResourceGroupsClient,
    opts: &SweepOptions,
) -> Result<Vec<String>, HarnessError> {
    let names = match &opts.selection {
        SweepSelection::Named(names) => names.clone(),
        SweepSelection::Tracked(dir) => {
            let names = read_markers(dir).map_err(|e| HarnessError::io(dir, e))?;
            if names.is_empty() {
                return Err(HarnessError::Precondition(format!(
                    "no {}* files found in {:?}",
                    TRACKED_MARKER_PREFIX,
                    dir.display().to_string()
                )));
            }
            names
        }
        SweepSelection::Expired(at) => {
            let expired = resource_groups.list_expired(*at).await?;
            return Ok(filter_by_location(expired, &opts.locations));
        }
    };

    if opts.locations.is_empty() {
        return Ok(names);
    }
    let mut groups = Vec::new();
    for name in names {
        match resource_groups.get(&name).await {
            Ok(group) => groups.push(group),
            Err(e) if e.is_not_found() => info!(resource_group = %name, "resource group not found, skipping"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filter_by_location(groups, &opts.locations))
}

fn filter_by_location(groups: Vec<ResourceGroup>, filter: &LocationFilter) -> Vec<String> {
    groups
        .into_iter()
        .filter(|rg| {
            let keep = filter.admits(&rg.location);
            if !keep {
                info!(resource_group = %rg.name, location = %rg.location, "skipping resource group outside location filter");
            }
            keep
        })
        .map(|rg| rg.name)
        .collect()
}

/// Select resource groups and delete them in parallel with `cleaner`'s workflow.
pub async fn sweep(cleaner: Arc<CloudCleaner>, opts: &SweepOptions) -> Result<SweepReport, HarnessError> {
    let selected = select_resource_groups(cleaner.resource_groups(), opts).await?;
    let mut report = SweepReport { selected: selected.clone(), ..Default::default() };
    if opts.dry_run {
        for name in &selected {
            info!(resource_group = %name, mode = %cleaner.mode(), "dry run: would delete resource group");
        }
        return Ok(report);
    }

    let mut tasks = JoinSet::new();
    for name in selected {
        let cleaner = cleaner.clone();
        tasks.spawn(async move {
            let result = cleaner.cleanup_resource_group(&name).await;
            (name, result)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => report.deleted.push(name),
            Ok((name, Err(e))) if e.is_ignorable_cleanup() => {
                info!(resource_group = %name, "ignoring not found resource group");
                report.deleted.push(name);
            }
            Ok((name, Err(e))) => {
                warn!(resource_group = %name, error = %e, "resource group cleanup failed");
                report.errors.push(format!("{}: {}", name, e));
            }
            Err(e) => report.errors.push(format!("cleanup task failed: {}", e)),
        }
    }
    report.deleted.sort();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcpe2e_cloud::{BaseUrls, RpEndpoint};
    use serde_json::json;
    use wiremock::{
        matchers::{method, path, path_regex, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn cleaner(server: &MockServer, mode: CleanupMode) -> CloudCleaner {
        let arm = ArmClient::with_static_token("t", BaseUrls::single(&server.uri()));
        let hcp = HcpClient::new(arm.clone(), "sub", RpEndpoint::Arm);
        CloudCleaner::new(arm, hcp, "sub", mode, Duration::from_secs(5))
            .with_policy(PollPolicy::new(Duration::from_millis(10), Duration::from_secs(5)))
    }

    fn managed_group(parent: &str) -> serde_json::Value {
        json!({
            "name": format!("{}-c1-managed", parent),
            "location": "uksouth",
            "managedBy": format!(
                "/subscriptions/sub/resourceGroups/{}/providers/Microsoft.RedHatOpenShift/hcpOpenShiftClusters/c1",
                parent
            )
        })
    }

    async fn mount_no_vnets(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path_regex(r"/providers/Microsoft\.Network/virtualNetworks$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .mount(server)
            .await;
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("no-rp".parse::<CleanupMode>().unwrap(), CleanupMode::NoRp);
        assert_eq!(CleanupMode::default().to_string(), "standard");
        let err = "fast".parse::<CleanupMode>().unwrap_err();
        assert!(err.to_string().contains("invalid cleanup workflow: fast"));
    }

    #[test]
    fn api_versions_by_provider() {
        assert_eq!(
            api_version_for("/subscriptions/s/resourceGroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities/x"),
            IDENTITY_API_VERSION
        );
        assert_eq!(api_version_for("/subscriptions/s/resourceGroups/rg"), RESOURCE_GROUPS_API_VERSION);
    }

    #[test]
    fn location_filter() {
        let include = LocationFilter { include: ["uksouth".to_string()].into(), ..Default::default() };
        assert!(include.admits("UKSouth"));
        assert!(!include.admits("eastus"));
        let exclude = LocationFilter { exclude: ["eastus".to_string()].into(), ..Default::default() };
        assert!(exclude.admits("uksouth"));
        assert!(!exclude.admits("eastus"));
    }

    #[tokio::test]
    async fn standard_refuses_when_managed_group_is_left_behind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub/resourceGroups/rg-1/providers/Microsoft.RedHatOpenShift/hcpOpenShiftClusters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub/resourcegroups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [managed_group("rg-1")]})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = cleaner(&server, CleanupMode::Standard)
            .cleanup_resource_group("rg-1")
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("found 1 managed resource groups left behind HCP clusters in rg-1"),
            "got: {}",
            err
        );
    }

    #[tokio::test]
    async fn no_rp_force_deletes_managed_groups_then_parent() {
        let server = MockServer::start().await;
        mount_no_vnets(&server).await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub/resourcegroups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [
                managed_group("rg-1"),
                {"name": "rg-1", "location": "uksouth"}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/subscriptions/sub/resourcegroups/rg-1-c1-managed"))
            .and(query_param(
                "forceDeletionTypes",
                "Microsoft.Compute/virtualMachines,Microsoft.Compute/virtualMachineScaleSets",
            ))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/subscriptions/sub/resourcegroups/rg-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        cleaner(&server, CleanupMode::NoRp)
            .cleanup_resource_group("rg-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tracked_sweep_without_markers_fails() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let opts = SweepOptions {
            selection: SweepSelection::Tracked(dir.path().to_path_buf()),
            locations: LocationFilter::default(),
            dry_run:   true,
        };
        let err = sweep(Arc::new(cleaner(&server, CleanupMode::Standard)), &opts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no tracked-resource-group_* files found"), "got: {}", err);
    }

    #[tokio::test]
    async fn expired_dry_run_selects_without_deleting() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub/resourcegroups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [
                {"name": "old", "location": "uksouth", "tags": {
                    "e2e.aro-hcp-ci.redhat.com": "true",
                    "deleteAfter.aro-hcp-ci.redhat.com": "2020-01-01T00:00:00Z"
                }},
                {"name": "old-elsewhere", "location": "eastus", "tags": {
                    "e2e.aro-hcp-ci.redhat.com": "true",
                    "deleteAfter.aro-hcp-ci.redhat.com": "2020-01-01T00:00:00Z"
                }},
                {"name": "fresh", "location": "uksouth", "tags": {
                    "e2e.aro-hcp-ci.redhat.com": "true",
                    "deleteAfter.aro-hcp-ci.redhat.com": "2999-01-01T00:00:00Z"
                }}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let opts = SweepOptions {
            selection: SweepSelection::Expired(Utc::now()),
            locations: LocationFilter { exclude: ["eastus".to_string()].into(), ..Default::default() },
            dry_run:   true,
        };
        let report = sweep(Arc::new(cleaner(&server, CleanupMode::Standard)), &opts)
            .await
            .unwrap();
        assert_eq!(report.selected, vec!["old"]);
        assert!(report.deleted.is_empty());
    }
}
