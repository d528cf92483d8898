use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hcpe2e_cloud::resource_groups::DEFAULT_RESOURCE_GROUP_TTL;
use hcpe2e_cloud::{ArmClient, Deployment, DeploymentRequest, DeploymentsClient, HcpClient, ResourceGroupsClient};
use hcpe2e_config::{load_setup_file, write_setup_file, HarnessConfig};
use hcpe2e_domain::{random_suffix, ClusterEntry, CustomerEnv, E2ESetup, NodePoolEntry, SetupModel};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::HarnessError;
use crate::tracker::ResourceTracker;

pub const FALLBACK_DEPLOYMENT_NAME: &str = "aro-hcp-e2e-setup";
pub const FALLBACK_DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(45 * 60);
pub const FALLBACK_NODE_POOL: &str = "nodepool-1";
pub const FALLBACK_SETUP_NAME: &str = "e2e-bicep-default";
const TEMPLATE_DIR: &str = "test-artifacts/generated-test-artifacts";
const SETUP_OUTPUT: &str = "test-artifacts/e2e-setup.json";

/// Load the shared setup from `SETUP_FILEPATH`, or deploy a fresh cluster from
/// the fallback template when that is configured.
///
/// A deployed cluster's resource group goes into `suite_resources` before it
/// is created, so the caller can delete it at suite teardown even when the
/// deployment fails. A loaded file tracks nothing.
///
/// `root` is the directory `test-artifacts/` lives in.
pub async fn load_shared_setup(
    config: &HarnessConfig,
    arm: &ArmClient,
    subscription_id: &str,
    root: &Path,
    suite_resources: &ResourceTracker,
) -> Result<SetupModel, HarnessError> {
    let loaded = match &config.setup_file {
        Some(path) => load_setup_file(path).map_err(HarnessError::from),
        None => Err(HarnessError::Precondition("SETUP_FILEPATH is not set".into())),
    };
    let err = match loaded {
        Ok(model) => return Ok(model),
        Err(e) => e,
    };

    let Some(template) = &config.fallback_template else {
        return Err(HarnessError::Precondition(format!(
            "failed to load e2e setup file and FALLBACK_TO_BICEP is not set: {}",
            err
        )));
    };
    warn!(error = %err, template, "failed to load e2e setup file, falling back to template deployment");
    let fallback = FallbackSetup { root: root.to_path_buf(), template: template.clone(), location: config.location.clone() };
    let hcp = HcpClient::from_config(arm.clone(), subscription_id, config);
    fallback.create(arm, subscription_id, &hcp, suite_resources).await
}

/// Deploys a complete cluster from a pre-built ARM template.
#[derive(Debug, Clone)]
pub struct FallbackSetup {
    pub root:     PathBuf,
    pub template: String,
    pub location: String,
}

impl FallbackSetup {
    pub fn template_path(&self) -> PathBuf {
        self.root.join(TEMPLATE_DIR).join(format!("{}.json", self.template))
    }

    pub async fn create(
        &self,
        arm: &ArmClient,
        subscription_id: &str,
        hcp: &HcpClient,
        tracker: &ResourceTracker,
    ) -> Result<SetupModel, HarnessError> {
        let cluster_name = format!("e2e-cluster-{}", random_suffix(8));
        let resource_group = format!("e2e-bicep-{}", random_suffix(12));

        let template_path = self.template_path();
        let raw = std::fs::read_to_string(&template_path).map_err(|e| HarnessError::io(&template_path, e))?;
        let template: Value = serde_json::from_str(&raw).map_err(|e| {
            HarnessError::Precondition(format!("failed to read pre-built ARM template {}: {}", template_path.display(), e))
        })?;

        info!(resource_group, cluster = %cluster_name, "creating shared cluster from template");
        tracker.track_resource_group(&resource_group).await;

        ResourceGroupsClient::new(arm.clone(), subscription_id)
            .create_e2e(&resource_group, &self.location, DEFAULT_RESOURCE_GROUP_TTL)
            .await
            .map_err(|e| e.context("failed to create resource group"))?;

        let request = DeploymentRequest::in_resource_group(FALLBACK_DEPLOYMENT_NAME, &resource_group, template)
            .parameter("clusterName", cluster_name.as_str())
            .timeout(FALLBACK_DEPLOYMENT_TIMEOUT);
        let deployment = DeploymentsClient::new(arm.clone(), subscription_id)
            .create_and_wait(&request)
            .await
            .map_err(|e| e.context("failed to deploy ARM template"))?;

        let uamis = json_output(&deployment, "userAssignedIdentitiesValue")?;
        let identity_uamis: BTreeMap<String, Value> = match json_output(&deployment, "identityValue")? {
            Value::Null => BTreeMap::new(),
            other => serde_json::from_value(other)
                .map_err(|e| HarnessError::Precondition(format!("failed to decode identityValue: {}", e)))?,
        };

        let cluster = hcp
            .get_cluster(&resource_group, &cluster_name)
            .await
            .map_err(|e| e.context("failed to get cluster ARM data"))?;
        let node_pool = hcp
            .get_node_pool(&resource_group, &cluster_name, FALLBACK_NODE_POOL)
            .await
            .map_err(|e| e.context("failed to get nodepool ARM data"))?;

        let setup = SetupModel {
            e2e_setup:    E2ESetup { name: FALLBACK_SETUP_NAME.into(), tags: vec![FALLBACK_SETUP_NAME.into()] },
            customer_env: CustomerEnv {
                resource_group,
                vnet_name: "customer-vnet".into(),
                nsg_name: "customer-nsg".into(),
                uamis,
                identity_uamis,
            },
            cluster:      ClusterEntry { name: cluster_name, arm_data: to_value(&cluster)? },
            nodepools:    vec![NodePoolEntry { name: FALLBACK_NODE_POOL.into(), arm_data: to_value(&node_pool)? }],
        };
        setup.validate()?;

        let output = self.root.join(SETUP_OUTPUT);
        if let Err(e) = write_setup_file(&output, &setup) {
            warn!(path = %output.display(), error = %e, "failed to write setup file");
        }
        Ok(setup)
    }
}

/// A template output that is either a JSON object or a string holding JSON.
/// A missing output or an empty string is `Null`.
fn json_output(deployment: &Deployment, key: &str) -> Result<Value, HarnessError> {
    let value: Option<Value> = deployment.output(key).ok();
    match value {
        None => Ok(Value::Null),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(Value::Null),
        Some(Value::String(s)) => serde_json::from_str(&s)
            .map_err(|e| HarnessError::Precondition(format!("failed to decode output {}: {}", key, e))),
        Some(other) => Ok(other),
    }
}

fn to_value<T: serde::Serialize>(v: &T) -> Result<Value, HarnessError> {
    serde_json::to_value(v).map_err(|e| HarnessError::Internal(format!("encoding ARM data: {}", e)))
}
