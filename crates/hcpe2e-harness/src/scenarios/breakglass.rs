use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use hcpe2e_cloud::{KubeClient, PollPolicy};
use hcpe2e_domain::Label;
use tracing::info;

use crate::context::TestContext;
use crate::error::VerifyError;
use crate::registry::TestCase;
use crate::verify::{
    verify_all, AccessRevoked, ApiReachable, ClusterVerifier, Denied, Eventually, PermissionCheck, WhoAmI,
};

const SESSION_TTL: Duration = Duration::from_secs(2 * 60);
const READ_ONLY_GROUP: &str = "aro-sre-pso";
const CLUSTER_ADMIN_GROUP: &str = "aro-sre-csa";

/// A principal that never owns the sessions this test opens.
const OTHER_OWNER: &str = "e2e-other-principal";

fn settle_policy() -> PollPolicy {
    PollPolicy::new(Duration::from_secs(5), Duration::from_secs(2 * 60))
}

pub(super) fn tests() -> Vec<TestCase> {
    vec![TestCase::new(
        "breakglass-session-permissions",
        "breakglass sessions grant exactly their group's permissions on the shared cluster",
        [
            Label::RequireHappyPath,
            Label::High,
            Label::Positive,
            Label::CoreInfraService,
            Label::DevelopmentOnly,
            Label::AroRpApiCompatible,
        ],
        breakglass_session_permissions,
    )]
}

fn list(group: &str, resource: &str) -> PermissionCheck {
    PermissionCheck::new("list", group, "v1", resource)
}

/// Reads both SRE groups hold.
fn common_reads() -> Vec<PermissionCheck> {
    vec![
        list("", "nodes"),
        list("", "namespaces"),
        list("", "pods").in_namespace("kube-system"),
        list("", "configmaps").in_namespace("kube-system"),
        list("", "services"),
        list("", "events"),
        list("apps", "deployments"),
        list("apps", "daemonsets"),
        list("apps", "statefulsets"),
        list("rbac.authorization.k8s.io", "clusterroles"),
        list("storage.k8s.io", "storageclasses"),
        list("", "persistentvolumeclaims"),
    ]
}

/// Operations only the cluster-admin group may perform.
fn privileged_operations() -> Vec<PermissionCheck> {
    vec![
        PermissionCheck::new("create", "", "v1", "pods").in_namespace("default"),
        PermissionCheck::new("delete", "", "v1", "pods").in_namespace("default"),
        PermissionCheck::new("create", "", "v1", "namespaces"),
        PermissionCheck::new("create", "apps", "v1", "deployments").in_namespace("default"),
        PermissionCheck::new("delete", "apps", "v1", "deployments").in_namespace("default"),
        list("", "secrets").in_namespace("kube-system"),
    ]
}

fn read_only_verifiers() -> Vec<Box<dyn ClusterVerifier>> {
    let mut v: Vec<Box<dyn ClusterVerifier>> = vec![Box::new(ApiReachable)];
    v.extend(common_reads().into_iter().map(|c| Box::new(c) as Box<dyn ClusterVerifier>));
    v.extend(privileged_operations().into_iter().map(|c| Box::new(Denied(c)) as Box<dyn ClusterVerifier>));
    v
}

fn cluster_admin_verifiers() -> Vec<Box<dyn ClusterVerifier>> {
    let mut v: Vec<Box<dyn ClusterVerifier>> = vec![Box::new(ApiReachable)];
    v.extend(
        common_reads()
            .into_iter()
            .chain(privileged_operations())
            .map(|c| Box::new(c) as Box<dyn ClusterVerifier>),
    );
    v
}

async fn breakglass_session_permissions(ctx: TestContext) -> anyhow::Result<()> {
    let setup = ctx.setup()?;
    let cluster_id = ctx.hcp().cluster_id(setup.resource_group(), setup.cluster_name());
    let admin = ctx.breakglass().await.context("failed to build the admin API client")?;

    for (group, verifiers) in [
        (READ_ONLY_GROUP, read_only_verifiers()),
        (CLUSTER_ADMIN_GROUP, cluster_admin_verifiers()),
    ] {
        let session = admin
            .create_credentials(&cluster_id, group, SESSION_TTL)
            .await
            .with_context(|| format!("failed to create {} breakglass session", group))?;
        let kube = ctx.kube_client(&session.kubeconfig)?;
        exercise_session(&kube, group, &verifiers, session.expires_at, settle_policy())
            .await
            .with_context(|| format!("{} breakglass session", group))?;
    }
    Ok(())
}

/// Identity, permissions, then revocation once the session expires.
async fn exercise_session(
    kube: &KubeClient,
    group: &str,
    verifiers: &[Box<dyn ClusterVerifier>],
    expires_at: DateTime<Utc>,
    policy: PollPolicy,
) -> Result<(), VerifyError> {
    let identity = WhoAmI { username: None, groups: vec![group.to_string()] };
    Eventually { inner: Box::new(identity), policy }.verify(kube).await?;
    not_owned_by(kube, OTHER_OWNER).await?;
    verify_all(verifiers, kube).await?;

    wait_for_expiry(expires_at).await;
    Eventually { inner: Box::new(AccessRevoked), policy }.verify(kube).await
}

/// The session must not report `other` as its user.
async fn not_owned_by(kube: &KubeClient, other: &str) -> Result<(), VerifyError> {
    let claim = WhoAmI { username: Some(other.to_string()), groups: Vec::new() };
    match claim.verify(kube).await {
        Ok(()) => Err(VerifyError::UnexpectedSuccess { check: format!("session owned by {}", other) }),
        Err(VerifyError::Mismatch { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn wait_for_expiry(expires_at: DateTime<Utc>) {
    if let Ok(left) = (expires_at - Utc::now()).to_std() {
        info!(%expires_at, "waiting for breakglass session to expire");
        tokio::time::sleep(left).await;
    }
}
