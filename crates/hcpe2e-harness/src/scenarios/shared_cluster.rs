use std::time::Duration;

use anyhow::{ensure, Context};
use hcpe2e_cloud::PollPolicy;
use hcpe2e_domain::{random_suffix, Label, SetupModel};
use serde_json::json;

use super::customer::{deploy_customer_infra, CLUSTER_CREATE_TIMEOUT};
use super::negative::expect_error_containing;
use crate::context::TestContext;
use crate::registry::TestCase;
use crate::verify::{verify_all, AllNodesReady, ApiReachable, ClusterVerifier, Eventually, NodeCount};

/// Substrings the service uses when refusing identities that another cluster holds.
pub const REUSED_IDENTITY_ERRORS: &[&str] = &[
    "already in use",
    "already used",
    "already associated",
    "cannot be reused",
    "conflict",
    "duplicate",
];

const NODES_READY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub(super) fn tests() -> Vec<TestCase> {
    vec![
        TestCase::new(
            "shared-cluster-healthy",
            "the shared cluster's API answers and all expected nodes are ready",
            [Label::RequireHappyPath, Label::Critical, Label::Positive, Label::AroRpApiCompatible],
            shared_cluster_healthy,
        ),
        TestCase::new(
            "shared-cluster-node-pools-provisioned",
            "every node pool of the shared cluster finished provisioning",
            [Label::RequireHappyPath, Label::High, Label::Positive, Label::AroRpApiCompatible],
            node_pools_provisioned,
        ),
        TestCase::new(
            "cluster-rejects-reused-identities",
            "a second cluster may not use the shared cluster's managed identities",
            [Label::RequireHappyPathInfra, Label::High, Label::Negative, Label::AroRpApiCompatible],
            reused_identities_rejected,
        ),
    ]
}

/// Nodes the shared cluster should have: the sum of its node pools' replicas.
fn expected_nodes(setup: &SetupModel) -> usize {
    setup
        .nodepools
        .iter()
        .filter_map(|np| np.arm_data["properties"]["replicas"].as_u64())
        .map(|n| n as usize)
        .sum()
}

async fn shared_cluster_healthy(ctx: TestContext) -> anyhow::Result<()> {
    let setup = ctx.setup()?;
    let kube = ctx
        .admin_kube_client(setup.resource_group(), setup.cluster_name())
        .await
        .context("failed to get admin credentials for the shared cluster")?;

    let mut verifiers: Vec<Box<dyn ClusterVerifier>> = vec![
        Box::new(ApiReachable),
        Box::new(Eventually { inner: Box::new(AllNodesReady), policy: PollPolicy::with_timeout(NODES_READY_TIMEOUT) }),
    ];
    let nodes = expected_nodes(&setup);
    if nodes > 0 {
        verifiers.push(Box::new(NodeCount(nodes)));
    }
    verify_all(&verifiers, &kube).await?;
    Ok(())
}

async fn node_pools_provisioned(ctx: TestContext) -> anyhow::Result<()> {
    let setup = ctx.setup()?;
    let hcp = ctx.hcp();
    let mut unfinished = Vec::new();
    for name in setup.nodepool_names() {
        let np = hcp
            .get_node_pool(setup.resource_group(), setup.cluster_name(), name)
            .await
            .with_context(|| format!("failed to get node pool {}", name))?;
        if np.provisioning_state() != Some("Succeeded") {
            unfinished.push(format!("{} ({})", name, np.provisioning_state().unwrap_or("no state")));
        }
    }
    ensure!(unfinished.is_empty(), "node pools not provisioned: {}", unfinished.join(", "));
    Ok(())
}

async fn reused_identities_rejected(ctx: TestContext) -> anyhow::Result<()> {
    let setup = ctx.setup()?;
    let rg = ctx.new_resource_group("reuse-identities").await?;
    let cluster_name = format!("cluster-reuse-ids-{}", random_suffix(6));
    let infra = deploy_customer_infra(&ctx, &rg.name, &cluster_name).await?;

    let mut params = infra.cluster_params(&rg.name, &cluster_name);
    params.user_assigned_profile = Some(setup.customer_env.uamis.clone());
    params.identity = Some(json!({
        "type": "UserAssigned",
        "userAssignedIdentities": setup.customer_env.identity_uamis.keys().map(|id| (id.clone(), json!({}))).collect::<serde_json::Map<_, _>>(),
    }));

    let result = ctx
        .hcp()
        .create_cluster(&rg.name, &cluster_name, &params.to_body(ctx.location()), &PollPolicy::with_timeout(CLUSTER_CREATE_TIMEOUT))
        .await;
    expect_error_containing(result, REUSED_IDENTITY_ERRORS).context("creating a cluster with the shared cluster's identities")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::harness;
    use std::sync::Arc;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const FIXTURE: &str = include_str!("../../tests/fixtures/e2e-setup.json");

    fn setup() -> SetupModel {
        serde_json::from_str(FIXTURE).unwrap()
    }

    #[test]
    fn expected_nodes_sums_replicas() {
        let mut s = setup();
        assert_eq!(expected_nodes(&s), 2);
        s.nodepools.push(hcpe2e_domain::NodePoolEntry { name: "np-2".into(), arm_data: json!({"properties": {"replicas": 3}}) });
        s.nodepools.push(hcpe2e_domain::NodePoolEntry { name: "np-3".into(), arm_data: json!({}) });
        assert_eq!(expected_nodes(&s), 5);
    }

    #[tokio::test]
    async fn unfinished_node_pool_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/subscriptions/sub/resourceGroups/e2e-shared-rg/providers/Microsoft.RedHatOpenShift/hcpOpenShiftClusters/e2e-shared-cluster/nodePools/np-1",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "np-1", "properties": {"provisioningState": "Updating"}
            })))
            .mount(&server)
            .await;
        let h = Arc::new(harness(&server, &[("AROHCP_ENV", "int")]).with_setup(setup()));
        let err = node_pools_provisioned(h.context(vec!["t".into()])).await.unwrap_err();
        assert!(err.to_string().contains("np-1 (Updating)"), "got: {}", err);
    }

    #[tokio::test]
    async fn shared_tests_need_setup() {
        let server = MockServer::start().await;
        let h = Arc::new(harness(&server, &[]));
        let err = shared_cluster_healthy(h.context(vec!["t".into()])).await.unwrap_err();
        assert!(err.to_string().contains("shared cluster setup has not been loaded"));
    }
}
