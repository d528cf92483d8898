use std::time::Duration;

use anyhow::{bail, ensure, Context};
use chrono::Utc;
use hcpe2e_cloud::{poll_until, CloudError, HcpClient, KubeClient, PollPolicy, PollStatus};
use hcpe2e_domain::Label;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

use super::customer::create_cluster;
use crate::context::TestContext;
use crate::registry::TestCase;

const CLUSTER_NAME: &str = "ea-cluster";
const EXTERNAL_AUTH_NAME: &str = "external-auth";
const EXTERNAL_AUTH_TYPE: &str = "Microsoft.RedHatOpenShift/hcpOpenShiftClusters/externalAuths";
const SUBJECT_PREFIX: &str = "prefix-";
const CLIENT_SECRET_NAMESPACE: &str = "openshift-config";
const CLIENT_SECRET_NAME: &str = "oidc-client-secret";

const EXTERNAL_AUTH_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const SECRET_LIFETIME_HOURS: i64 = 24;

pub(super) fn tests() -> Vec<TestCase> {
    vec![TestCase::new(
        "external-auth-console",
        "creates a cluster with an Entra external auth config and waits for its console URL",
        [Label::RequireNothing, Label::Critical, Label::Positive, Label::CreateCluster, Label::Slow],
        external_auth_console,
    )]
}

fn console_url_policy() -> PollPolicy {
    PollPolicy::new(Duration::from_secs(10), Duration::from_secs(10 * 60))
}

/// External auth trusting Entra tokens issued for `client_id`, with a
/// confidential console client and a public CLI client.
pub fn external_auth_body(tenant_id: &str, client_id: &str) -> Value {
    let client = |component: &str, kind: &str| {
        json!({
            "clientId":  client_id,
            "component": { "name": component, "authClientNamespace": "openshift-console" },
            "type":      kind,
        })
    };
    json!({
        "properties": {
            "issuer": {
                "url":       format!("https://login.microsoftonline.com/{}/v2.0", tenant_id),
                "audiences": [client_id],
            },
            "claim": {
                "mappings": {
                    "username": { "claim": "sub", "prefixPolicy": "Prefix", "prefix": SUBJECT_PREFIX },
                    "groups":   { "claim": "groups" },
                }
            },
            "clients": [client("console", "Confidential"), client("cli", "Public")],
        }
    })
}

/// Wait until the cluster reports a console URL.
pub(crate) async fn wait_for_console_url(
    hcp: &HcpClient,
    resource_group: &str,
    cluster: &str,
    policy: &PollPolicy,
) -> Result<String, CloudError> {
    poll_until(&format!("console URL of {}", cluster), policy, || async move {
        let current = hcp.get_cluster(resource_group, cluster).await?;
        Ok(match current.console_url().filter(|u| !u.is_empty()) {
            Some(url) => PollStatus::Succeeded(url.to_string()),
            None => PollStatus::Pending(format!(
                "no console URL yet (provisioningState {})",
                current.provisioning_state().unwrap_or("unknown")
            )),
        })
    })
    .await
}

/// Store the console client's secret where the cluster's OAuth setup reads it,
/// replacing an earlier one.
pub(crate) async fn store_client_secret(kube: &KubeClient, secret: &str) -> Result<(), CloudError> {
    let collection = format!("/api/v1/namespaces/{}/secrets", CLIENT_SECRET_NAMESPACE);
    let body = json!({
        "apiVersion": "v1",
        "kind":       "Secret",
        "metadata":   { "name": CLIENT_SECRET_NAME, "namespace": CLIENT_SECRET_NAMESPACE },
        "stringData": { "clientSecret": secret },
    });
    match kube.request(Method::POST, &collection, Some(&body)).await {
        Ok(_) => Ok(()),
        Err(e) if e.status() == Some(409) => {
            let item = format!("{}/{}", collection, CLIENT_SECRET_NAME);
            kube.request(Method::PUT, &item, Some(&body)).await.map(|_| ())
        }
        Err(e) => Err(e),
    }
}

async fn external_auth_console(ctx: TestContext) -> anyhow::Result<()> {
    let tenant_id = ctx.config().tenant_id()?.to_string();
    let rg = ctx.new_resource_group("external-auth-cluster").await?;
    create_cluster(&ctx, &rg.name, CLUSTER_NAME).await?;
    let hcp = ctx.hcp();

    let (app, _sp) = ctx.new_app_registration().await?;
    let now = Utc::now();
    let password = ctx
        .graph()
        .add_password(&app.id, "external-auth-pass", now, now + chrono::Duration::hours(SECRET_LIFETIME_HOURS))
        .await
        .context("failed to add a client secret to the app registration")?;
    let Some(secret) = password.secret_text else {
        bail!("Graph returned no secret text for app {}", app.app_id);
    };

    hcp.create_external_auth(
        &rg.name,
        CLUSTER_NAME,
        EXTERNAL_AUTH_NAME,
        &external_auth_body(&tenant_id, &app.app_id),
        &PollPolicy::with_timeout(EXTERNAL_AUTH_TIMEOUT),
    )
    .await
    .context("failed to create external auth")?;

    let created = hcp
        .get_external_auth(&rg.name, CLUSTER_NAME, EXTERNAL_AUTH_NAME)
        .await
        .context("failed to read external auth")?;
    ensure!(
        created["properties"]["provisioningState"] == "Succeeded",
        "external auth is in state {}",
        created["properties"]["provisioningState"]
    );
    ensure!(created["type"] == EXTERNAL_AUTH_TYPE, "external auth has type {}", created["type"]);

    let kube = ctx.admin_kube_client(&rg.name, CLUSTER_NAME).await?;
    store_client_secret(&kube, &secret)
        .await
        .context("failed to store the console client secret")?;

    let console = wait_for_console_url(&hcp, &rg.name, CLUSTER_NAME, &console_url_policy())
        .await
        .context("cluster never reported a console URL")?;
    ensure!(console.starts_with("https://"), "console URL {:?} is not https", console);
    info!(console_url = %console, "console URL populated");

    hcp.delete_external_auth(&rg.name, CLUSTER_NAME, EXTERNAL_AUTH_NAME, &PollPolicy::with_timeout(EXTERNAL_AUTH_TIMEOUT))
        .await
        .context("failed to delete external auth")?;
    match hcp.get_external_auth(&rg.name, CLUSTER_NAME, EXTERNAL_AUTH_NAME).await {
        Ok(_) => bail!("external auth {} still exists after deletion", EXTERNAL_AUTH_NAME),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e).context("unexpected error reading the deleted external auth"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::tests::kube;
    use hcpe2e_cloud::{ArmClient, BaseUrls, RpEndpoint};
    use wiremock::{
        matchers::{body_partial_json, method, path, path_regex},
        Mock, MockServer, ResponseTemplate,
    };

    #[test]
    fn body_trusts_the_tenant_issuer_for_both_clients() {
        let body = external_auth_body("tenant-1", "app-1");
        let props = &body["properties"];
        assert_eq!(props["issuer"]["url"], "https://login.microsoftonline.com/tenant-1/v2.0");
        assert_eq!(props["issuer"]["audiences"], json!(["app-1"]));
        assert_eq!(props["claim"]["mappings"]["username"]["prefix"], SUBJECT_PREFIX);
        let clients = props["clients"].as_array().unwrap();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0]["component"]["name"], "console");
        assert_eq!(clients[0]["type"], "Confidential");
        assert_eq!(clients[1]["component"]["name"], "cli");
        assert_eq!(clients[1]["type"], "Public");
    }

    fn cluster(console: Option<&str>) -> Value {
        let mut properties = json!({"provisioningState": "Succeeded"});
        if let Some(url) = console {
            properties["console"] = json!({"url": url});
        }
        json!({"id": "/c", "name": CLUSTER_NAME, "properties": properties})
    }

    fn hcp(server: &MockServer) -> HcpClient {
        HcpClient::new(ArmClient::with_static_token("t", BaseUrls::single(&server.uri())), "sub", RpEndpoint::Arm)
    }

    #[tokio::test]
    async fn console_url_is_awaited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"/hcpOpenShiftClusters/ea-cluster$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster(None)))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"/hcpOpenShiftClusters/ea-cluster$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster(Some("https://console.example.com"))))
            .mount(&server)
            .await;

        let policy = PollPolicy::new(Duration::from_millis(10), Duration::from_secs(5));
        let url = wait_for_console_url(&hcp(&server), "rg", CLUSTER_NAME, &policy).await.unwrap();
        assert_eq!(url, "https://console.example.com");
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_console_url_times_out_with_last_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"/hcpOpenShiftClusters/ea-cluster$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster(Some(""))))
            .mount(&server)
            .await;

        let policy = PollPolicy::new(Duration::from_millis(10), Duration::from_millis(200));
        let err = wait_for_console_url(&hcp(&server), "rg", CLUSTER_NAME, &policy).await.unwrap_err();
        assert!(err.is_timeout(), "got: {}", err);
        assert!(err.to_string().contains("no console URL yet"), "got: {}", err);
    }

    #[tokio::test]
    async fn existing_client_secret_is_replaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/openshift-config/secrets"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "kind": "Status", "status": "Failure", "reason": "AlreadyExists", "code": 409
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/namespaces/openshift-config/secrets/oidc-client-secret"))
            .and(body_partial_json(json!({"stringData": {"clientSecret": "s3cret"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"kind": "Secret"})))
            .expect(1)
            .mount(&server)
            .await;
        store_client_secret(&kube(&server), "s3cret").await.unwrap();
    }

    #[tokio::test]
    async fn client_secret_errors_propagate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "kind": "Status", "status": "Failure", "reason": "Forbidden", "code": 403
            })))
            .mount(&server)
            .await;
        let err = store_client_secret(&kube(&server), "s3cret").await.unwrap_err();
        assert!(err.is_forbidden(), "got: {}", err);
    }
}
