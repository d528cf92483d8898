use std::path::PathBuf;
use std::sync::Arc;

use hcpe2e_cloud::resource_groups::DEFAULT_RESOURCE_GROUP_TTL;
use hcpe2e_cloud::{
    decode_claims, Application, ArmClient, BreakglassClient, Deployment, DeploymentRequest, DeploymentScope,
    DeploymentsClient, GraphClient, HcpClient, IdentityClient, KubeClient, NetworkClient, Principal,
    ResourceGroup, ResourceGroupsClient, Scope, ServicePrincipal,
};
use hcpe2e_config::HarnessConfig;
use hcpe2e_domain::{random_suffix, unique_name, SetupModel, RESOURCE_GROUP_MAX_LEN};
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifacts::collect_debug_info;
use crate::cleanup::{CleanupMode, CloudCleaner, DEFAULT_CLEANUP_TIMEOUT};
use crate::error::HarnessError;
use crate::timing::{operations_from_arm, TimingRecorder};
use crate::tracker::{ResourceCleaner, ResourceTracker, TeardownReport};

/// Prefix of app registrations created by tests.
pub const APP_REGISTRATION_PREFIX: &str = "aro-hcp-e2e-";

// ── Harness ───────────────────────────────────────────────────────────────────

/// Run-wide state, built once and shared by every test through an `Arc`.
pub struct Harness {
    config:          HarnessConfig,
    arm:             ArmClient,
    subscription_id: String,
    setup:           Option<Arc<SetupModel>>,
    run_id:          Uuid,
    cleaner:         Option<Arc<dyn ResourceCleaner>>,
    /// Resources suite setup created for this run.
    suite_resources: ResourceTracker,
}

impl Harness {
    /// Select a credential and resolve the subscription by display name.
    pub async fn connect(config: HarnessConfig) -> Result<Self, HarnessError> {
        let arm = ArmClient::new(&config);
        let subscription_id = hcpe2e_cloud::find_subscription_id(&arm, &config.subscription_name).await?;
        info!(subscription = %config.subscription_name, subscription_id, "resolved subscription");
        Ok(Self::with_clients(config, arm, subscription_id))
    }

    pub fn with_clients(config: HarnessConfig, arm: ArmClient, subscription_id: impl Into<String>) -> Self {
        let suite_resources = ResourceTracker::new(config.shared_dir.clone());
        Self {
            config,
            arm,
            subscription_id: subscription_id.into(),
            setup: None,
            run_id: Uuid::new_v4(),
            cleaner: None,
            suite_resources,
        }
    }

    pub fn with_setup(mut self, setup: SetupModel) -> Self {
        self.setup = Some(Arc::new(setup));
        self
    }

    /// Replace the cloud cleaner used at teardown.
    pub fn with_cleaner(mut self, cleaner: Arc<dyn ResourceCleaner>) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn arm(&self) -> &ArmClient {
        &self.arm
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn setup(&self) -> Option<&Arc<SetupModel>> {
        self.setup.as_ref()
    }

    pub fn resource_groups(&self) -> ResourceGroupsClient {
        ResourceGroupsClient::new(self.arm.clone(), &self.subscription_id)
    }

    pub fn deployments(&self) -> DeploymentsClient {
        DeploymentsClient::new(self.arm.clone(), &self.subscription_id)
    }

    pub fn hcp(&self) -> HcpClient {
        HcpClient::from_config(self.arm.clone(), &self.subscription_id, &self.config)
    }

    pub fn identities(&self) -> IdentityClient {
        IdentityClient::new(self.arm.clone(), &self.subscription_id)
    }

    pub fn network(&self) -> NetworkClient {
        NetworkClient::new(self.arm.clone(), &self.subscription_id)
    }

    pub fn graph(&self) -> GraphClient {
        GraphClient::new(self.arm.clone())
    }

    pub fn cloud_cleaner(&self, mode: CleanupMode) -> CloudCleaner {
        CloudCleaner::new(self.arm.clone(), self.hcp(), &self.subscription_id, mode, DEFAULT_CLEANUP_TIMEOUT)
    }

    pub fn suite_resources(&self) -> &ResourceTracker {
        &self.suite_resources
    }

    /// Delete what suite setup created, e.g. a cluster deployed from the
    /// fallback template. Runs after every test has finished.
    pub async fn teardown_suite(&self) -> TeardownReport {
        if self.suite_resources.is_empty().await {
            return TeardownReport::default();
        }
        if self.config.skip_cleanup {
            info!("skipping suite resource cleanup");
            return TeardownReport::default();
        }
        info!("deleting suite resources");
        let cleaner: Arc<dyn ResourceCleaner> = match &self.cleaner {
            Some(cleaner) => cleaner.clone(),
            None => Arc::new(self.cloud_cleaner(CleanupMode::Standard)),
        };
        let report = self.suite_resources.teardown(cleaner).await;
        if !report.is_clean() {
            warn!(errors = report.errors.len(), "suite teardown left resources behind");
        }
        report
    }

    /// A fresh context for one test.
    pub fn context(self: &Arc<Self>, identifier: Vec<String>) -> TestContext {
        let name = identifier.last().cloned().unwrap_or_default();
        TestContext {
            harness: self.clone(),
            name,
            tracker: ResourceTracker::new(self.config.shared_dir.clone()),
            timing: TimingRecorder::start(identifier),
        }
    }
}

// ── Test context ──────────────────────────────────────────────────────────────

/// Per-test handle. Clones share the tracker and timing recorder.
#[derive(Clone)]
pub struct TestContext {
    harness: Arc<Harness>,
    name:    String,
    tracker: ResourceTracker,
    timing:  TimingRecorder,
}

impl TestContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn harness(&self) -> &Arc<Harness> {
        &self.harness
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.harness.config
    }

    pub fn location(&self) -> &str {
        &self.harness.config.location
    }

    pub fn subscription_id(&self) -> &str {
        &self.harness.subscription_id
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    pub fn timing(&self) -> &TimingRecorder {
        &self.timing
    }

    pub fn resource_groups(&self) -> ResourceGroupsClient {
        self.harness.resource_groups()
    }

    pub fn deployments(&self) -> DeploymentsClient {
        self.harness.deployments()
    }

    pub fn hcp(&self) -> HcpClient {
        self.harness.hcp()
    }

    pub fn identities(&self) -> IdentityClient {
        self.harness.identities()
    }

    pub fn graph(&self) -> GraphClient {
        self.harness.graph()
    }

    /// Shared cluster description; an error when suite setup did not load one.
    pub fn setup(&self) -> Result<Arc<SetupModel>, HarnessError> {
        self.harness
            .setup
            .clone()
            .ok_or_else(|| HarnessError::Precondition("shared cluster setup has not been loaded".into()))
    }

    /// Create an E2E-tagged group named `<prefix>-<6 random>` and track it.
    /// The group is tracked before it is created.
    pub async fn new_resource_group(&self, prefix: &str) -> Result<ResourceGroup, HarnessError> {
        let name = unique_name(prefix, RESOURCE_GROUP_MAX_LEN);
        self.tracker.track_resource_group(&name).await;
        info!(resource_group = %name, "creating resource group");
        let rg = self
            .resource_groups()
            .create_e2e(&name, self.location(), DEFAULT_RESOURCE_GROUP_TTL)
            .await
            .map_err(|e| e.context("failed to create resource group"))?;
        Ok(rg)
    }

    /// Create an app registration with a service principal. The application
    /// is tracked by object ID.
    pub async fn new_app_registration(&self) -> Result<(Application, ServicePrincipal), HarnessError> {
        let display_name = format!("{}{}", APP_REGISTRATION_PREFIX, random_suffix(10));
        info!(app_name = %display_name, "creating app registration");
        let graph = self.graph();
        let app = graph
            .create_application(&display_name)
            .await
            .map_err(|e| e.context("failed to create app registration"))?;
        self.tracker.track_application(&app.id).await;
        let sp = graph
            .create_service_principal(&app.app_id)
            .await
            .map_err(|e| e.context("failed to create service principal"))?;
        Ok((app, sp))
    }

    /// Run a template deployment and record its operations in the timing data.
    pub async fn deploy(&self, request: DeploymentRequest) -> Result<Deployment, HarnessError> {
        let deployments = self.deployments();
        let step = format!("Deploy {}", request.describe());
        let deployment = self.timing.step(step, deployments.create_and_wait(&request)).await?;

        if let DeploymentScope::ResourceGroup(rg) = &request.scope {
            match deployments.list_operations(rg, &request.name).await {
                Ok(raw) => match operations_from_arm(&raw) {
                    Ok(ops) => self.timing.record_deployment(rg, &request.name, ops).await,
                    Err(e) => warn!(deployment = %request.name, error = %e, "skipping deployment timing"),
                },
                Err(e) => warn!(deployment = %request.name, error = %e, "failed to list deployment operations"),
            }
        }
        Ok(deployment)
    }

    /// Admin kubeconfig from the resource provider, wrapped in a client.
    pub async fn admin_kube_client(&self, resource_group: &str, cluster: &str) -> Result<KubeClient, HarnessError> {
        let kubeconfig = self
            .hcp()
            .request_admin_credential(resource_group, cluster, &Default::default())
            .await?;
        self.kube_client(&kubeconfig)
    }

    /// TLS verification is skipped in the development environment.
    pub fn kube_client(&self, kubeconfig: &str) -> Result<KubeClient, HarnessError> {
        Ok(KubeClient::from_kubeconfig(kubeconfig, self.config().environment.is_development())?)
    }

    /// Admin API client acting as the identity behind the management token.
    pub async fn breakglass(&self) -> Result<BreakglassClient, HarnessError> {
        let address = self.config().admin_api_address()?;
        let token = self.harness.arm.token(Scope::Management).await?;
        let principal = Principal::from_claims(&decode_claims(&token)?)?;
        Ok(BreakglassClient::new(address, principal, self.config().environment.is_development())?)
    }

    fn timing_dirs(&self) -> Vec<PathBuf> {
        let config = self.config();
        let mut dirs = Vec::new();
        if let Some(shared) = &config.shared_dir {
            dirs.push(shared.clone());
        }
        if let Some(artifacts) = &config.artifact_dir {
            dirs.push(artifacts.join("test-timing"));
        }
        dirs
    }

    /// Collect debug artifacts, delete everything tracked and write timing data.
    /// Failures are reported, never raised.
    pub async fn teardown(&self) -> TeardownReport {
        let report = self.timing.step("Delete created resources", self.delete_created_resources()).await;
        if let Err(e) = self.timing.commit(&self.timing_dirs()).await {
            warn!(error = %e, "failed to write timing metadata");
        }
        report
    }

    async fn delete_created_resources(&self) -> TeardownReport {
        if let Some(artifact_dir) = &self.config().artifact_dir {
            let groups = self.tracker.resource_groups().await;
            for e in collect_debug_info(&self.deployments(), artifact_dir, &groups, Some(self.timing.clone())).await {
                warn!(error = %e, "debug info collection failed");
            }
        }

        if self.config().skip_cleanup {
            info!("skipping resource cleanup");
            return TeardownReport::default();
        }

        info!("deleting created resources");
        let cleaner: Arc<dyn ResourceCleaner> = match &self.harness.cleaner {
            Some(cleaner) => cleaner.clone(),
            None => Arc::new(self.harness.cloud_cleaner(CleanupMode::Standard).with_timing(self.timing.clone())),
        };
        let report = self.tracker.teardown(cleaner).await;
        info!("finished deleting created resources");
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tracker::tests::RecordingCleaner;
    use hcpe2e_cloud::BaseUrls;
    use serde_json::json;
    use wiremock::{
        matchers::{method, path, path_regex},
        Mock, MockServer, ResponseTemplate,
    };

    pub(crate) fn config(vars: &[(&str, &str)]) -> HarnessConfig {
        let vars: Vec<(String, String)> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        HarnessConfig::from_lookup(|key| vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())).unwrap()
    }

    pub(crate) fn harness(server: &MockServer, vars: &[(&str, &str)]) -> Harness {
        let arm = ArmClient::with_static_token("t", BaseUrls::single(&server.uri()));
        Harness::with_clients(config(vars), arm, "sub")
    }

    #[tokio::test]
    async fn setup_is_a_precondition() {
        let server = MockServer::start().await;
        let ctx = Arc::new(harness(&server, &[])).context(vec!["t".into()]);
        let err = ctx.setup().unwrap_err();
        assert!(matches!(err, HarnessError::Precondition(_)));
    }

    #[tokio::test]
    async fn new_resource_group_is_tagged_and_tracked() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/subscriptions/sub/resourcegroups/rg-del-mi-[a-z0-9]{6}$"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "name": "rg-del-mi-x", "location": "uksouth"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().to_str().unwrap().to_string();
        let ctx = Arc::new(harness(&server, &[("SHARED_DIR", &shared)])).context(vec!["t".into()]);
        ctx.new_resource_group("rg-del-mi").await.unwrap();

        let tracked = ctx.tracker().resource_groups().await;
        assert_eq!(tracked.len(), 1);
        assert!(tracked[0].starts_with("rg-del-mi-"));
        assert_eq!(tracked[0].len(), "rg-del-mi-".len() + 6);
        assert_eq!(crate::tracker::read_markers(dir.path()).unwrap(), tracked);

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["tags"]["e2e.aro-hcp-ci.redhat.com"], "true");
        assert!(body["tags"]["deleteAfter.aro-hcp-ci.redhat.com"].is_string());
    }

    #[tokio::test]
    async fn long_resource_group_prefix_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"name": "x", "location": "uksouth"})))
            .mount(&server)
            .await;
        let ctx = Arc::new(harness(&server, &[])).context(vec!["t".into()]);
        ctx.new_resource_group(&"very-long-prefix-".repeat(5)).await.unwrap();

        let tracked = ctx.tracker().resource_groups().await;
        assert!(tracked[0].len() <= RESOURCE_GROUP_MAX_LEN, "got: {}", tracked[0]);
        assert!(tracked[0].starts_with("very-long-prefix-"));
    }

    #[tokio::test]
    async fn suite_teardown_deletes_setup_groups_once() {
        let server = MockServer::start().await;
        let cleaner = Arc::new(RecordingCleaner::default());
        let h = harness(&server, &[]).with_cleaner(cleaner.clone());
        assert!(h.teardown_suite().await.is_clean());
        assert!(cleaner.calls().is_empty());

        h.suite_resources().track_resource_group("e2e-bicep-abc").await;
        let report = h.teardown_suite().await;
        assert_eq!(report.deleted, 1);
        assert_eq!(cleaner.calls(), vec!["group:e2e-bicep-abc"]);

        h.teardown_suite().await;
        assert_eq!(cleaner.calls().len(), 1);
    }

    #[tokio::test]
    async fn suite_teardown_honors_skip_cleanup() {
        let server = MockServer::start().await;
        let cleaner = Arc::new(RecordingCleaner::default());
        let h = harness(&server, &[("ARO_E2E_SKIP_CLEANUP", "true")]).with_cleaner(cleaner.clone());
        h.suite_resources().track_resource_group("e2e-bicep-abc").await;
        h.teardown_suite().await;
        assert!(cleaner.calls().is_empty());
    }

    #[tokio::test]
    async fn teardown_uses_the_cleaner_and_writes_timing() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let artifacts = dir.path().to_str().unwrap().to_string();
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub/resourcegroups/rg-1/providers/Microsoft.Resources/deployments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .mount(&server)
            .await;

        let cleaner = Arc::new(RecordingCleaner::default());
        let harness = harness(&server, &[("ARTIFACT_DIR", &artifacts)]).with_cleaner(cleaner.clone());
        let ctx = Arc::new(harness).context(vec!["suite".into(), "t".into()]);
        ctx.tracker().track_resource_group("rg-1").await;

        let report = ctx.teardown().await;
        assert!(report.is_clean());
        assert_eq!(cleaner.calls(), vec!["group:rg-1"]);
        assert!(dir.path().join("resourcegroups/rg-1/deployments.yaml").exists());
        let timing_files: Vec<_> = std::fs::read_dir(dir.path().join("test-timing")).unwrap().collect();
        assert_eq!(timing_files.len(), 1);
    }

    #[tokio::test]
    async fn skip_cleanup_deletes_nothing() {
        let server = MockServer::start().await;
        let cleaner = Arc::new(RecordingCleaner::default());
        let harness = harness(&server, &[("ARO_E2E_SKIP_CLEANUP", "true")]).with_cleaner(cleaner.clone());
        let ctx = Arc::new(harness).context(vec!["t".into()]);
        ctx.tracker().track_resource_group("rg-1").await;
        ctx.teardown().await;
        assert!(cleaner.calls().is_empty());
    }
}
