use std::collections::{BTreeMap, BTreeSet};

use chrono::{SecondsFormat, Utc};
use hcpe2e_config::HarnessConfig;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::info;

use crate::arm::{ArmClient, ArmResponse, RequestOptions};
use crate::error::CloudError;
use crate::wait::PollPolicy;

pub const HCP_API_VERSION: &str = "2024-06-10-preview";
pub const HCP_RESOURCE_TYPE: &str = "Microsoft.RedHatOpenShift/hcpOpenShiftClusters";

const DEV_IDENTITY_URL: &str = "https://dummyhost.identity.azure.net";
const USER_ASSIGNED_SEGMENT: &str = "/providers/microsoft.managedidentity/userassignedidentities/";

/// Where resource-provider calls are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpEndpoint {
    /// Through ARM, as customers do.
    Arm,
    /// Straight to a frontend at this address, bypassing ARM.
    Frontend(String),
}

// ── Resource models ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HcpCluster {
    #[serde(default)]
    pub id:         String,
    pub name:       String,
    #[serde(default)]
    pub location:   String,
    #[serde(default)]
    pub identity:   Value,
    #[serde(default)]
    pub properties: Value,
}

impl HcpCluster {
    pub fn provisioning_state(&self) -> Option<&str> {
        self.properties["provisioningState"].as_str()
    }

    pub fn api_url(&self) -> Option<&str> {
        self.properties["api"]["url"].as_str()
    }

    pub fn console_url(&self) -> Option<&str> {
        self.properties["console"]["url"].as_str()
    }

    pub fn managed_resource_group(&self) -> Option<&str> {
        self.properties["platform"]["managedResourceGroup"].as_str()
    }

    /// Every user-assigned managed identity the cluster references, from its
    /// `identity` block and its operator authentication profile. Deduplicated
    /// case-insensitively.
    pub fn managed_identity_ids(&self) -> Vec<String> {
        let mut found: BTreeMap<String, String> = BTreeMap::new();
        if let Some(assigned) = self.identity["userAssignedIdentities"].as_object() {
            for id in assigned.keys() {
                found.entry(id.to_ascii_lowercase()).or_insert_with(|| id.clone());
            }
        }
        let profile = &self.properties["platform"]["operatorsAuthentication"]["userAssignedIdentities"];
        collect_identity_ids(profile, &mut found);
        found.into_values().collect()
    }
}

fn collect_identity_ids(v: &Value, out: &mut BTreeMap<String, String>) {
    match v {
        Value::String(s) if s.to_ascii_lowercase().contains(USER_ASSIGNED_SEGMENT) => {
            out.entry(s.to_ascii_lowercase()).or_insert_with(|| s.clone());
        }
        Value::Object(map) => map.values().for_each(|x| collect_identity_ids(x, out)),
        Value::Array(items) => items.iter().for_each(|x| collect_identity_ids(x, out)),
        _ => {}
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePool {
    #[serde(default)]
    pub id:         String,
    pub name:       String,
    #[serde(default)]
    pub properties: Value,
}

impl NodePool {
    pub fn provisioning_state(&self) -> Option<&str> {
        self.properties["provisioningState"].as_str()
    }

    pub fn replicas(&self) -> Option<u64> {
        self.properties["replicas"].as_u64()
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// HCP clusters, node pools, external auths and credentials.
#[derive(Clone)]
pub struct HcpClient {
    arm:             ArmClient,
    subscription_id: String,
    endpoint:        RpEndpoint,
}

impl HcpClient {
    pub fn new(arm: ArmClient, subscription_id: &str, endpoint: RpEndpoint) -> Self {
        Self { arm, subscription_id: subscription_id.to_string(), endpoint }
    }

    /// Frontend endpoint in development, ARM elsewhere.
    pub fn from_config(arm: ArmClient, subscription_id: &str, config: &HarnessConfig) -> Self {
        let endpoint = if config.uses_local_frontend() {
            RpEndpoint::Frontend(config.frontend_address.clone())
        } else {
            RpEndpoint::Arm
        };
        Self::new(arm, subscription_id, endpoint)
    }

    pub fn endpoint(&self) -> &RpEndpoint {
        &self.endpoint
    }

    fn options(&self) -> RequestOptions {
        let opts = RequestOptions::management();
        match self.endpoint {
            RpEndpoint::Arm => opts,
            RpEndpoint::Frontend(_) => {
                let system_data = json!({
                    "createdBy":     "e2e-test",
                    "createdByType": "Application",
                    "createdAt":     Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                });
                opts.with_header("X-Ms-Arm-Resource-System-Data", system_data.to_string())
                    .with_header("X-Ms-Identity-Url", DEV_IDENTITY_URL)
            }
        }
    }

    fn base(&self) -> &str {
        match &self.endpoint {
            RpEndpoint::Arm => self.arm.base().management.trim_end_matches('/'),
            RpEndpoint::Frontend(addr) => addr.trim_end_matches('/'),
        }
    }

    pub fn cluster_id(&self, resource_group: &str, cluster: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}",
            self.subscription_id, resource_group, HCP_RESOURCE_TYPE, cluster
        )
    }

    fn url(&self, resource_path: &str) -> String {
        format!("{}{}?api-version={}", self.base(), resource_path, HCP_API_VERSION)
    }

    fn cluster_url(&self, rg: &str, cluster: &str) -> String {
        self.url(&self.cluster_id(rg, cluster))
    }

    fn node_pool_url(&self, rg: &str, cluster: &str, node_pool: &str) -> String {
        self.url(&format!("{}/nodePools/{}", self.cluster_id(rg, cluster), node_pool))
    }

    fn external_auth_url(&self, rg: &str, cluster: &str, name: &str) -> String {
        self.url(&format!("{}/externalAuths/{}", self.cluster_id(rg, cluster), name))
    }

    async fn get_typed<T: serde::de::DeserializeOwned>(&self, url: &str, what: &str) -> Result<T, CloudError> {
        let body = self.arm.get_json(url, &self.options()).await?;
        serde_json::from_value(body).map_err(|e| CloudError::decode(what, e))
    }

    // ── Clusters ──────────────────────────────────────────────────────────────

    pub async fn get_cluster(&self, rg: &str, cluster: &str) -> Result<HcpCluster, CloudError> {
        self.get_typed(&self.cluster_url(rg, cluster), "hcpOpenShiftCluster").await
    }

    pub async fn list_clusters(&self, rg: &str) -> Result<Vec<HcpCluster>, CloudError> {
        let url = format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/{}?api-version={}",
            self.base(),
            self.subscription_id,
            rg,
            HCP_RESOURCE_TYPE,
            HCP_API_VERSION
        );
        self.arm
            .list_all(&url, &self.options())
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| CloudError::decode("hcpOpenShiftCluster", e)))
            .collect()
    }

    /// Start a create without waiting; the caller polls or deletes.
    pub async fn begin_create_cluster(&self, rg: &str, cluster: &str, body: &Value) -> Result<ArmResponse, CloudError> {
        let url = self.cluster_url(rg, cluster);
        self.arm
            .execute(Method::PUT, &url, Some(body), &self.options())
            .await?
            .into_result("PUT", &url)
            .map_err(|e| e.context(format!("failed starting cluster creation {:?} in resourcegroup={:?}", cluster, rg)))
    }

    pub async fn create_cluster(
        &self,
        rg: &str,
        cluster: &str,
        body: &Value,
        policy: &PollPolicy,
    ) -> Result<HcpCluster, CloudError> {
        info!(cluster, resource_group = rg, "starting HCP cluster creation");
        let url = self.cluster_url(rg, cluster);
        let created = self
            .arm
            .put_and_wait(&url, body, policy, &self.options())
            .await
            .map_err(|e| {
                e.context(format!("failed waiting for cluster={:?} in resourcegroup={:?} to finish creating", cluster, rg))
            })?;
        serde_json::from_value(created).map_err(|e| CloudError::decode("hcpOpenShiftCluster", e))
    }

    pub async fn delete_cluster(&self, rg: &str, cluster: &str, policy: &PollPolicy) -> Result<(), CloudError> {
        self.arm
            .delete_and_wait(&self.cluster_url(rg, cluster), policy, &self.options())
            .await
            .map_err(|e| {
                e.context(format!("failed waiting for hcpCluster={:?} in resourcegroup={:?} to finish deleting", cluster, rg))
            })?;
        info!(cluster, resource_group = rg, "deleted HCP cluster");
        Ok(())
    }

    /// Delete a cluster, node pool or external auth by full resource ID.
    pub async fn delete_by_id(&self, id: &str, policy: &PollPolicy) -> Result<(), CloudError> {
        self.arm
            .delete_and_wait(&self.url(id), policy, &self.options())
            .await
            .map_err(|e| e.context(format!("failed deleting {}", id)))
    }

    /// Delete every cluster in the group in parallel. Returns how many were found.
    pub async fn delete_all_clusters(&self, rg: &str, policy: &PollPolicy) -> Result<usize, CloudError> {
        let clusters = match self.list_clusters(rg).await {
            Ok(c) => c,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e.context(format!("failed listing clusters in resourcegroup={:?}", rg))),
        };
        let count = clusters.len();
        let mut tasks = JoinSet::new();
        for cluster in clusters {
            let client = self.clone();
            let rg = rg.to_string();
            let policy = *policy;
            tasks.spawn(async move { client.delete_cluster(&rg, &cluster.name, &policy).await });
        }
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(CloudError::InvalidRequest(format!("cluster delete task failed: {}", e))),
            }
        }
        CloudError::join(errors)?;
        Ok(count)
    }

    // ── Credentials ───────────────────────────────────────────────────────────

    /// Request an admin kubeconfig through the resource provider.
    pub async fn request_admin_credential(&self, rg: &str, cluster: &str, policy: &PollPolicy) -> Result<String, CloudError> {
        let url = self.url(&format!("{}/requestadmincredential", self.cluster_id(rg, cluster)));
        let result = self
            .arm
            .post_and_wait(&url, None, policy, &self.options())
            .await
            .map_err(|e| {
                e.context(format!("failed waiting for hcpCluster={:?} in resourcegroup={:?} to finish getting creds", cluster, rg))
            })?;
        result["kubeconfig"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CloudError::decode("admin credential", "kubeconfig content is missing"))
    }

    // ── Node pools ────────────────────────────────────────────────────────────

    pub async fn create_node_pool(
        &self,
        rg: &str,
        cluster: &str,
        node_pool: &str,
        body: &Value,
        policy: &PollPolicy,
    ) -> Result<NodePool, CloudError> {
        let url = self.node_pool_url(rg, cluster, node_pool);
        let created = self.arm.put_and_wait(&url, body, policy, &self.options()).await.map_err(|e| {
            e.context(format!(
                "failed waiting for nodepool={:?} for cluster {:?} in resourcegroup={:?} to finish creating",
                node_pool, cluster, rg
            ))
        })?;
        serde_json::from_value(created).map_err(|e| CloudError::decode("nodePool", e))
    }

    pub async fn get_node_pool(&self, rg: &str, cluster: &str, node_pool: &str) -> Result<NodePool, CloudError> {
        self.get_typed(&self.node_pool_url(rg, cluster, node_pool), "nodePool").await
    }

    pub async fn list_node_pools(&self, rg: &str, cluster: &str) -> Result<Vec<NodePool>, CloudError> {
        let url = self.url(&format!("{}/nodePools", self.cluster_id(rg, cluster)));
        self.arm
            .list_all(&url, &self.options())
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| CloudError::decode("nodePool", e)))
            .collect()
    }

    pub async fn delete_node_pool(&self, rg: &str, cluster: &str, node_pool: &str, policy: &PollPolicy) -> Result<(), CloudError> {
        self.arm
            .delete_and_wait(&self.node_pool_url(rg, cluster, node_pool), policy, &self.options())
            .await
            .map_err(|e| {
                e.context(format!(
                    "failed waiting for nodepool={:?} for cluster {:?} in resourcegroup={:?} to finish deleting",
                    node_pool, cluster, rg
                ))
            })
    }

    // ── External auths ────────────────────────────────────────────────────────

    pub async fn create_external_auth(
        &self,
        rg: &str,
        cluster: &str,
        name: &str,
        body: &Value,
        policy: &PollPolicy,
    ) -> Result<Value, CloudError> {
        let url = self.external_auth_url(rg, cluster, name);
        self.arm.put_and_wait(&url, body, policy, &self.options()).await.map_err(|e| {
            e.context(format!(
                "failed waiting for externalAuth={:?} for cluster {:?} in resourcegroup={:?} to finish creating",
                name, cluster, rg
            ))
        })
    }

    pub async fn get_external_auth(&self, rg: &str, cluster: &str, name: &str) -> Result<Value, CloudError> {
        self.arm.get_json(&self.external_auth_url(rg, cluster, name), &self.options()).await
    }

    pub async fn delete_external_auth(&self, rg: &str, cluster: &str, name: &str, policy: &PollPolicy) -> Result<(), CloudError> {
        self.arm
            .delete_and_wait(&self.external_auth_url(rg, cluster, name), policy, &self.options())
            .await
    }
}

/// Unique identity IDs of several clusters.
pub fn identity_ids_of<'a>(clusters: impl IntoIterator<Item = &'a HcpCluster>) -> BTreeSet<String> {
    clusters.into_iter().flat_map(|c| c.managed_identity_ids()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::tests::{client, fast};
    use crate::arm::BaseUrls;
    use wiremock::{
        matchers::{header, header_exists, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const CLUSTER: &str =
        "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.RedHatOpenShift/hcpOpenShiftClusters/c1";

    fn mi(name: &str) -> String {
        format!("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities/{}", name)
    }

    fn cluster_json() -> Value {
        json!({
            "id": CLUSTER,
            "name": "c1",
            "location": "uksouth",
            "identity": {"type": "UserAssigned", "userAssignedIdentities": {
                mi("control-plane"): {}, mi("service"): {}
            }},
            "properties": {
                "provisioningState": "Succeeded",
                "platform": {"operatorsAuthentication": {"userAssignedIdentities": {
                    "controlPlaneOperators": {"control-plane": mi("control-plane"), "ingress": mi("ingress")},
                    "dataPlaneOperators": {"disk-csi-driver": mi("dp-disk-csi-driver")},
                    "serviceManagedIdentity": mi("service")
                }}}
            }
        })
    }

    #[test]
    fn managed_identity_ids_are_collected_and_deduplicated() {
        let cluster: HcpCluster = serde_json::from_value(cluster_json()).unwrap();
        let ids = cluster.managed_identity_ids();
        assert_eq!(ids.len(), 4, "got: {:?}", ids);
        assert!(ids.contains(&mi("dp-disk-csi-driver")));
        assert!(ids.contains(&mi("service")));
    }

    #[tokio::test]
    async fn create_and_delete_cluster_via_arm() {
        let server = MockServer::start().await;
        let op_url = format!("{}/operations/create-c1", server.uri());
        Mock::given(method("PUT"))
            .and(path(CLUSTER))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("Azure-AsyncOperation", op_url.as_str())
                    .set_body_json(json!({"name": "c1", "properties": {"provisioningState": "Accepted"}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operations/create-c1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "Succeeded"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(CLUSTER))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster_json()))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(CLUSTER))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let hcp = HcpClient::new(client(&server), "sub", RpEndpoint::Arm);
        let created = hcp.create_cluster("rg", "c1", &json!({}), &fast()).await.unwrap();
        assert_eq!(created.provisioning_state(), Some("Succeeded"));
        hcp.delete_cluster("rg", "c1", &fast()).await.unwrap();
    }

    #[tokio::test]
    async fn node_pool_on_missing_cluster_surfaces_cloud_message() {
        let server = MockServer::start().await;
        let message = "The resource 'hcpOpenShiftClusters/non-existing-cluster' under resource group 'rg' was not found.";
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": "ResourceNotFound", "message": message}
            })))
            .mount(&server)
            .await;
        let hcp = HcpClient::new(client(&server), "sub", RpEndpoint::Arm);
        let err = hcp
            .create_node_pool("rg", "non-existing-cluster", "np-1", &json!({}), &fast())
            .await
            .unwrap_err();
        assert!(err.to_string().contains(message), "got: {}", err);
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn frontend_requests_carry_development_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CLUSTER))
            .and(header("X-Ms-Identity-Url", DEV_IDENTITY_URL))
            .and(header_exists("X-Ms-Arm-Resource-System-Data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster_json()))
            .expect(1)
            .mount(&server)
            .await;
        // ARM is unreachable; only the frontend may be called.
        let arm = ArmClient::with_static_token("t", BaseUrls::single("http://127.0.0.1:9"));
        let hcp = HcpClient::new(arm, "sub", RpEndpoint::Frontend(server.uri()));
        let cluster = hcp.get_cluster("rg", "c1").await.unwrap();
        assert_eq!(cluster.name, "c1");
    }

    #[tokio::test]
    async fn delete_all_clusters_deletes_each() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.RedHatOpenShift/hcpOpenShiftClusters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [
                {"name": "c1"}, {"name": "c2"}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;
        let hcp = HcpClient::new(client(&server), "sub", RpEndpoint::Arm);
        assert_eq!(hcp.delete_all_clusters("rg", &fast()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn admin_credential_is_read_from_operation_result() {
        let server = MockServer::start().await;
        let loc = format!("{}/operationresults/cred", server.uri());
        Mock::given(method("POST"))
            .and(path(format!("{}/requestadmincredential", CLUSTER)))
            .respond_with(ResponseTemplate::new(202).insert_header("Location", loc.as_str()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operationresults/cred"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"kubeconfig": "apiVersion: v1"})))
            .mount(&server)
            .await;
        let hcp = HcpClient::new(client(&server), "sub", RpEndpoint::Arm);
        let kubeconfig = hcp.request_admin_credential("rg", "c1", &fast()).await.unwrap();
        assert_eq!(kubeconfig, "apiVersion: v1");
    }
}
