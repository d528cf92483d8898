use anyhow::{bail, ensure, Context};
use hcpe2e_cloud::PollPolicy;
use hcpe2e_domain::Label;
use tracing::info;

use super::customer::{create_cluster, CLUSTER_DELETE_TIMEOUT};
use crate::context::TestContext;
use crate::registry::TestCase;

const DELETED_IDENTITIES_CLUSTER: &str = "del-mi-cluster";
const LIFECYCLE_CLUSTER: &str = "e2e-lifecycle";

pub(super) fn tests() -> Vec<TestCase> {
    vec![
        TestCase::new(
            "cluster-lifecycle",
            "creates customer infrastructure and a cluster, then deletes the cluster",
            [Label::RequireNothing, Label::Critical, Label::Positive, Label::CreateCluster, Label::Slow],
            cluster_lifecycle,
        ),
        TestCase::new(
            "delete-cluster-after-identities-removed",
            "deletes a cluster whose managed identities were deleted first",
            [
                Label::RequireNothing,
                Label::High,
                Label::Positive,
                Label::CreateCluster,
                Label::AroRpApiCompatible,
                Label::Slow,
            ],
            delete_cluster_after_identities_removed,
        ),
    ]
}

/// Message the resource provider returns for a cluster that does not exist.
pub(super) fn cluster_not_found_message(cluster: &str, resource_group: &str) -> String {
    format!("The resource 'hcpOpenShiftClusters/{}' under resource group '{}' was not found.", cluster, resource_group)
}

async fn expect_cluster_gone(ctx: &TestContext, resource_group: &str, cluster: &str) -> anyhow::Result<()> {
    match ctx.hcp().get_cluster(resource_group, cluster).await {
        Ok(c) => bail!(
            "cluster {} still exists after deletion (provisioningState {:?})",
            cluster,
            c.provisioning_state().unwrap_or("unknown")
        ),
        Err(e) if e.is_not_found() => {
            let expected = cluster_not_found_message(cluster, resource_group);
            ensure!(e.to_string().contains(&expected), "expected {:?} in: {}", expected, e);
            Ok(())
        }
        Err(e) => Err(e).context("unexpected error reading the deleted cluster"),
    }
}

async fn cluster_lifecycle(ctx: TestContext) -> anyhow::Result<()> {
    let rg = ctx.new_resource_group("e2e-lifecycle").await?;
    let cluster = create_cluster(&ctx, &rg.name, LIFECYCLE_CLUSTER).await?;
    ensure!(
        cluster.provisioning_state() == Some("Succeeded"),
        "cluster finished creating in state {:?}",
        cluster.provisioning_state()
    );

    ctx.hcp()
        .delete_cluster(&rg.name, LIFECYCLE_CLUSTER, &PollPolicy::with_timeout(CLUSTER_DELETE_TIMEOUT))
        .await
        .context("failed to delete cluster")?;
    expect_cluster_gone(&ctx, &rg.name, LIFECYCLE_CLUSTER).await
}

async fn delete_cluster_after_identities_removed(ctx: TestContext) -> anyhow::Result<()> {
    let rg = ctx.new_resource_group("rg-del-mi").await?;
    create_cluster(&ctx, &rg.name, DELETED_IDENTITIES_CLUSTER).await?;

    let cluster = ctx
        .hcp()
        .get_cluster(&rg.name, DELETED_IDENTITIES_CLUSTER)
        .await
        .context("failed to read the created cluster")?;
    let identities = cluster.managed_identity_ids();
    ensure!(!identities.is_empty(), "cluster references no managed identities");

    let policy = PollPolicy::default();
    let identity_client = ctx.identities();
    for id in &identities {
        identity_client
            .delete_by_id(id, &policy)
            .await
            .with_context(|| format!("failed to delete managed identity {}", id))?;
    }
    info!(count = identities.len(), "deleted the cluster's managed identities");

    ctx.hcp()
        .delete_cluster(&rg.name, DELETED_IDENTITIES_CLUSTER, &PollPolicy::with_timeout(CLUSTER_DELETE_TIMEOUT))
        .await
        .context("cluster deletion failed after its managed identities were removed")?;
    expect_cluster_gone(&ctx, &rg.name, DELETED_IDENTITIES_CLUSTER).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::harness;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use wiremock::{
        matchers::{method, path_regex},
        Mock, MockServer, ResponseTemplate,
    };

    const IDENTITY_ROOT: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities";

    fn cluster_body() -> Value {
        json!({
            "id": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.RedHatOpenShift/hcpOpenShiftClusters/del-mi-cluster",
            "name": DELETED_IDENTITIES_CLUSTER,
            "location": "uksouth",
            "identity": {
                "type": "UserAssigned",
                "userAssignedIdentities": { format!("{}/c-service", IDENTITY_ROOT): {} }
            },
            "properties": {
                "provisioningState": "Succeeded",
                "platform": {"operatorsAuthentication": {"userAssignedIdentities": {
                    "controlPlaneOperators": {"ingress": format!("{}/c-ingress", IDENTITY_ROOT)},
                    "serviceManagedIdentity": format!("{}/c-service", IDENTITY_ROOT)
                }}}
            }
        })
    }

    async fn mount_infra(server: &MockServer) {
        Mock::given(method("PUT"))
            .and(path_regex(r"^/subscriptions/sub/resourcegroups/rg-del-mi-[a-z0-9]{6}$"))
            .respond_with(|req: &wiremock::Request| {
                ResponseTemplate::new(201).set_body_json(json!({"name": segment(req, 4), "location": "uksouth"}))
            })
            .mount(server)
            .await;
        let deployment = json!({
            "name": "customer-infra",
            "properties": {
                "provisioningState": "Succeeded",
                "outputs": {
                    "subnetId": {"type": "String", "value": "/subnets/customer-subnet"},
                    "networkSecurityGroupId": {"type": "String", "value": "/nsgs/customer-nsg"},
                    "userAssignedIdentitiesValue": {"type": "Object", "value": {
                        "controlPlaneOperators": {"ingress": format!("{}/c-ingress", IDENTITY_ROOT)},
                        "serviceManagedIdentity": format!("{}/c-service", IDENTITY_ROOT)
                    }},
                    "identityValue": {"type": "Object", "value": { format!("{}/c-service", IDENTITY_ROOT): {} }}
                }
            }
        });
        Mock::given(method("PUT"))
            .and(path_regex(r"/deployments/customer-infra$"))
            .respond_with(ResponseTemplate::new(201).set_body_json(deployment.clone()))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"/deployments/customer-infra$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(deployment))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex(r"/hcpOpenShiftClusters/del-mi-cluster$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster_body()))
            .expect(1)
            .mount(server)
            .await;
    }

    /// Path segment `n` of the request, counting the empty one before the leading slash.
    fn segment(req: &wiremock::Request, n: usize) -> &str {
        req.url.path().split('/').nth(n).unwrap_or_default()
    }

    fn not_found(rg_hint: &str) -> ResponseTemplate {
        ResponseTemplate::new(404).set_body_json(json!({"error": {
            "code": "ResourceNotFound",
            "message": cluster_not_found_message(DELETED_IDENTITIES_CLUSTER, rg_hint)
        }}))
    }

    #[tokio::test]
    async fn identities_are_deleted_before_the_cluster() {
        let server = MockServer::start().await;
        mount_infra(&server).await;
        Mock::given(method("GET"))
            .and(path_regex(r"/hcpOpenShiftClusters/del-mi-cluster$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster_body()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"/userAssignedIdentities/c-(ingress|service)$"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"/hcpOpenShiftClusters/del-mi-cluster$"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path_regex(r"/hcpOpenShiftClusters/del-mi-cluster$"))
            .respond_with(|req: &wiremock::Request| not_found(segment(req, 4)))
            .mount(&server)
            .await;

        let h = Arc::new(harness(&server, &[("AROHCP_ENV", "int")]));
        let ctx = h.context(vec!["t".into()]);
        delete_cluster_after_identities_removed(ctx.clone()).await.unwrap();
        assert_eq!(ctx.tracker().resource_groups().await.len(), 1);
    }

    #[tokio::test]
    async fn surviving_cluster_fails_the_scenario() {
        let server = MockServer::start().await;
        mount_infra(&server).await;
        Mock::given(method("GET"))
            .and(path_regex(r"/hcpOpenShiftClusters/del-mi-cluster$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster_body()))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let h = Arc::new(harness(&server, &[("AROHCP_ENV", "int")]));
        let err = delete_cluster_after_identities_removed(h.context(vec!["t".into()])).await.unwrap_err();
        assert!(err.to_string().contains("still exists after deletion"), "got: {:#}", err);
    }

    #[test]
    fn not_found_message_names_cluster_and_group() {
        assert_eq!(
            cluster_not_found_message("c1", "rg1"),
            "The resource 'hcpOpenShiftClusters/c1' under resource group 'rg1' was not found."
        );
    }
}
