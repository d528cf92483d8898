use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use hcpe2e_cloud::{ClusterParams, DeploymentRequest, HcpCluster, PollPolicy};
use hcpe2e_domain::suffix_name;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::TestContext;

/// ARM template for the network and managed identities a cluster needs.
pub const CUSTOMER_INFRA_TEMPLATE: &str = include_str!("../../templates/customer-infra.json");

pub const CLUSTER_CREATE_TIMEOUT: Duration = Duration::from_secs(45 * 60);
pub const CLUSTER_DELETE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Outputs of the customer infrastructure template.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfra {
    pub subnet_id:                      String,
    pub network_security_group_id:      String,
    pub user_assigned_identities_value: Value,
    #[serde(default)]
    pub identity_value:                 BTreeMap<String, Value>,
}

impl CustomerInfra {
    pub fn cluster_params(&self, resource_group: &str, cluster_name: &str) -> ClusterParams {
        ClusterParams {
            cluster_name:           cluster_name.to_string(),
            managed_resource_group: suffix_name(resource_group, "managed", 64),
            subnet_id:              self.subnet_id.clone(),
            nsg_id:                 self.network_security_group_id.clone(),
            user_assigned_profile:  Some(self.user_assigned_identities_value.clone()),
            identity:               Some(json!({
                "type": "UserAssigned",
                "userAssignedIdentities": self.identity_value,
            })),
            ..Default::default()
        }
    }
}

pub async fn deploy_customer_infra(ctx: &TestContext, resource_group: &str, cluster_name: &str) -> anyhow::Result<CustomerInfra> {
    let template: Value = serde_json::from_str(CUSTOMER_INFRA_TEMPLATE).context("customer infra template is not valid JSON")?;
    let request = DeploymentRequest::in_resource_group("customer-infra", resource_group, template)
        .parameter("clusterName", cluster_name)
        .timeout(CLUSTER_CREATE_TIMEOUT);
    let deployment = ctx.deploy(request).await.context("failed to deploy customer infrastructure")?;
    deployment
        .outputs::<CustomerInfra>()
        .context("customer infrastructure outputs are incomplete")
}

/// Deploy customer infrastructure into `resource_group` and create a cluster on it.
pub async fn create_cluster(ctx: &TestContext, resource_group: &str, cluster_name: &str) -> anyhow::Result<HcpCluster> {
    let infra = deploy_customer_infra(ctx, resource_group, cluster_name).await?;
    let body = infra.cluster_params(resource_group, cluster_name).to_body(ctx.location());
    ctx.hcp()
        .create_cluster(resource_group, cluster_name, &body, &PollPolicy::with_timeout(CLUSTER_CREATE_TIMEOUT))
        .await
        .with_context(|| format!("failed to create cluster {}", cluster_name))
}
