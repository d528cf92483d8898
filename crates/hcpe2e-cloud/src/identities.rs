use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::arm::{ArmClient, RequestOptions};
use crate::error::CloudError;
use crate::wait::PollPolicy;

pub const IDENTITY_API_VERSION: &str = "2023-01-31";

/// Control-plane operators that each need their own identity.
pub const CONTROL_PLANE_OPERATORS: &[&str] = &[
    "cluster-api-azure",
    "control-plane",
    "cloud-controller-manager",
    "ingress",
    "disk-csi-driver",
    "file-csi-driver",
    "image-registry",
    "cloud-network-config",
    "kms",
];

/// Data-plane operators, provisioned with a `dp-` prefix.
pub const DATA_PLANE_OPERATORS: &[&str] = &["disk-csi-driver", "file-csi-driver", "image-registry"];

pub const SERVICE_IDENTITY: &str = "service";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAssignedIdentity {
    #[serde(default)]
    pub id:         String,
    pub name:       String,
    #[serde(default)]
    pub location:   String,
    #[serde(default)]
    pub properties: IdentityProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityProperties {
    #[serde(default)]
    pub principal_id: Option<String>,
    #[serde(default)]
    pub client_id:    Option<String>,
    #[serde(default)]
    pub tenant_id:    Option<String>,
}

/// Names of every identity a default cluster needs, `<prefix>-<operator>`.
pub fn default_identity_names(prefix: &str) -> Vec<String> {
    CONTROL_PLANE_OPERATORS
        .iter()
        .map(|op| format!("{}-{}", prefix, op))
        .chain(DATA_PLANE_OPERATORS.iter().map(|op| format!("{}-dp-{}", prefix, op)))
        .chain(std::iter::once(format!("{}-{}", prefix, SERVICE_IDENTITY)))
        .collect()
}

#[derive(Clone)]
pub struct IdentityClient {
    arm:             ArmClient,
    subscription_id: String,
}

impl IdentityClient {
    pub fn new(arm: ArmClient, subscription_id: &str) -> Self {
        Self { arm, subscription_id: subscription_id.to_string() }
    }

    pub fn identity_id(&self, resource_group: &str, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ManagedIdentity/userAssignedIdentities/{}",
            self.subscription_id, resource_group, name
        )
    }

    fn url(&self, id: &str) -> String {
        format!("{}?api-version={}", self.arm.management_url(id), IDENTITY_API_VERSION)
    }

    pub async fn create(&self, resource_group: &str, name: &str, location: &str) -> Result<UserAssignedIdentity, CloudError> {
        let url = self.url(&self.identity_id(resource_group, name));
        let body = json!({ "location": location });
        let resp = self
            .arm
            .execute(reqwest::Method::PUT, &url, Some(&body), &RequestOptions::management())
            .await?
            .into_result("PUT", &url)?;
        info!(identity = name, resource_group, "created managed identity");
        serde_json::from_value(resp.body).map_err(|e| CloudError::decode("userAssignedIdentity", e))
    }

    pub async fn get(&self, resource_group: &str, name: &str) -> Result<UserAssignedIdentity, CloudError> {
        self.get_by_id(&self.identity_id(resource_group, name)).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<UserAssignedIdentity, CloudError> {
        let body = self.arm.get_json(&self.url(id), &RequestOptions::management()).await?;
        serde_json::from_value(body).map_err(|e| CloudError::decode("userAssignedIdentity", e))
    }

    pub async fn list(&self, resource_group: &str) -> Result<Vec<UserAssignedIdentity>, CloudError> {
        let url = self.url(&format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ManagedIdentity/userAssignedIdentities",
            self.subscription_id, resource_group
        ));
        self.arm
            .list_all(&url, &RequestOptions::management())
            .await?
            .into_iter()
            .map(|v: Value| serde_json::from_value(v).map_err(|e| CloudError::decode("userAssignedIdentity", e)))
            .collect()
    }

    /// Delete by full resource ID; a missing identity is success.
    pub async fn delete_by_id(&self, id: &str, policy: &PollPolicy) -> Result<(), CloudError> {
        self.arm
            .delete_and_wait(&self.url(id), policy, &RequestOptions::management())
            .await
            .map_err(|e| e.context(format!("failed deleting managed identity {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::tests::{client, fast};
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    #[test]
    fn default_names_cover_every_operator() {
        let names = default_identity_names("c1");
        assert_eq!(names.len(), CONTROL_PLANE_OPERATORS.len() + DATA_PLANE_OPERATORS.len() + 1);
        assert!(names.contains(&"c1-dp-disk-csi-driver".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("c1-service"));
    }

    #[tokio::test]
    async fn create_parses_principal() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities/mi-1"))
            .and(query_param("api-version", IDENTITY_API_VERSION))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "name": "mi-1",
                "location": "uksouth",
                "properties": {"principalId": "p-1", "clientId": "c-1"}
            })))
            .mount(&server)
            .await;
        let identities = IdentityClient::new(client(&server), "sub");
        let mi = identities.create("rg", "mi-1", "uksouth").await.unwrap();
        assert_eq!(mi.properties.principal_id.as_deref(), Some("p-1"));
    }

    #[tokio::test]
    async fn delete_missing_identity_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let identities = IdentityClient::new(client(&server), "sub");
        let id = identities.identity_id("rg", "gone");
        identities.delete_by_id(&id, &fast()).await.unwrap();
    }
}
