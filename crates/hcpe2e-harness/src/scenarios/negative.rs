use std::fmt::Display;

use anyhow::{bail, Context};
use hcpe2e_cloud::{NodePoolParams, PollPolicy};
use hcpe2e_domain::{unique_name, Label, RESOURCE_GROUP_MAX_LEN};

use crate::context::TestContext;
use crate::registry::TestCase;

/// Cluster name that never exists in any test resource group.
pub const NON_EXISTING_CLUSTER: &str = "non-existing-cluster";

/// Messages the service has answered a node pool create under a missing
/// cluster with. They differ between service revisions and environments;
/// confirm against the live API when one stops matching.
pub const MISSING_CLUSTER_NODE_POOL_ERRORS: &[&str] = &[
    "Cannot create resource while parent resource is",
    "InternalServerError",
    "status 500",
];

pub(super) fn tests() -> Vec<TestCase> {
    vec![
        TestCase::new(
            "node-pool-on-missing-cluster",
            "creating a node pool under a cluster that does not exist is refused",
            [Label::RequireNothing, Label::Negative, Label::Medium, Label::AroRpApiCompatible],
            node_pool_on_missing_cluster,
        ),
        TestCase::new(
            "resource-group-delete-is-idempotent",
            "deleting a resource group that does not exist succeeds, twice",
            [Label::RequireNothing, Label::Low, Label::Positive],
            delete_missing_resource_group,
        ),
    ]
}

/// Require `result` to be an error whose text contains one of `expected`,
/// compared case-insensitively. Any other outcome is an error naming what
/// actually happened.
pub fn expect_error_containing<T, E: Display>(result: Result<T, E>, expected: &[&str]) -> anyhow::Result<()> {
    let err = match result {
        Ok(_) => bail!("expected an error containing one of {:?}, but the request succeeded", expected),
        Err(e) => e.to_string(),
    };
    let lowered = err.to_ascii_lowercase();
    if expected.iter().any(|want| lowered.contains(&want.to_ascii_lowercase())) {
        return Ok(());
    }
    bail!("error {:?} contains none of {:?}", err, expected)
}

async fn node_pool_on_missing_cluster(ctx: TestContext) -> anyhow::Result<()> {
    let rg = ctx.new_resource_group("rg-np-missing-cluster").await?;
    let params = NodePoolParams { node_pool_name: "np-1".into(), ..Default::default() };
    let result = ctx
        .hcp()
        .create_node_pool(&rg.name, NON_EXISTING_CLUSTER, &params.node_pool_name, &params.to_body(ctx.location()), &PollPolicy::default())
        .await;
    expect_error_containing(result, MISSING_CLUSTER_NODE_POOL_ERRORS)
        .with_context(|| format!("node pool create under cluster {:?}", NON_EXISTING_CLUSTER))
}

async fn delete_missing_resource_group(ctx: TestContext) -> anyhow::Result<()> {
    let name = unique_name("rg-never-created", RESOURCE_GROUP_MAX_LEN);
    let groups = ctx.resource_groups();
    let policy = PollPolicy::default();
    for attempt in 1..=2 {
        groups
            .delete(&name, false, &policy)
            .await
            .with_context(|| format!("delete attempt {} of missing resource group {}", attempt, name))?;
    }
    Ok(())
}
