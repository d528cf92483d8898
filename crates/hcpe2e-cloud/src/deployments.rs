use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::arm::{ArmClient, RequestOptions};
use crate::error::CloudError;
use crate::wait::{await_completion, PollPolicy, ProvisioningStateOperation, STANDARD_POLL_INTERVAL};

pub const DEPLOYMENTS_API_VERSION: &str = "2021-04-01";
pub const DEFAULT_DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentScope {
    ResourceGroup(String),
    Subscription,
}

/// An ARM template deployment to create and wait for.
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub name:               String,
    pub scope:              DeploymentScope,
    /// Required for subscription scope, optional otherwise.
    pub location:           Option<String>,
    pub template:           Value,
    pub parameters:         BTreeMap<String, Value>,
    pub timeout:            Duration,
    pub poll_interval:      Duration,
    pub debug_detail_level: String,
}

impl DeploymentRequest {
    pub fn in_resource_group(name: &str, resource_group: &str, template: Value) -> Self {
        Self::new(name, DeploymentScope::ResourceGroup(resource_group.to_string()), template)
    }

    pub fn at_subscription(name: &str, location: &str, template: Value) -> Self {
        let mut req = Self::new(name, DeploymentScope::Subscription, template);
        req.location = Some(location.to_string());
        req
    }

    fn new(name: &str, scope: DeploymentScope, template: Value) -> Self {
        Self {
            name: name.to_string(),
            scope,
            location: None,
            template,
            parameters: BTreeMap::new(),
            timeout: DEFAULT_DEPLOYMENT_TIMEOUT,
            poll_interval: STANDARD_POLL_INTERVAL,
            debug_detail_level: "requestContent".into(),
        }
    }

    pub fn parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), CloudError> {
        if self.name.trim().is_empty() {
            return Err(CloudError::InvalidRequest("deployment name must be specified".into()));
        }
        match &self.scope {
            DeploymentScope::ResourceGroup(rg) if rg.trim().is_empty() => Err(CloudError::InvalidRequest(
                "resource group name must be specified for resource-group scoped deployments".into(),
            )),
            DeploymentScope::Subscription if self.location.as_deref().map_or(true, |l| l.trim().is_empty()) => {
                Err(CloudError::InvalidRequest(
                    "location must be specified for subscription-scoped deployments".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// ARM request body. Parameters are wrapped as `{"<key>": {"value": ..}}`.
    pub fn body(&self) -> Value {
        let parameters: Map<String, Value> = self
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), json!({ "value": v })))
            .collect();
        let mut body = json!({
            "properties": {
                "mode": "Incremental",
                "template": self.template,
                "parameters": parameters,
                "debugSetting": { "detailLevel": self.debug_detail_level },
            }
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }
        body
    }

    pub fn describe(&self) -> String {
        match &self.scope {
            DeploymentScope::ResourceGroup(rg) => format!("deployment {:?} in resourcegroup={:?}", self.name, rg),
            DeploymentScope::Subscription => format!("deployment {:?} at subscription scope", self.name),
        }
    }
}

/// A finished deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub id:                 String,
    pub name:               String,
    pub provisioning_state: String,
    raw_outputs:            Value,
}

impl Deployment {
    pub fn from_value(v: &Value) -> Self {
        Self {
            id:                 v["id"].as_str().unwrap_or_default().to_string(),
            name:               v["name"].as_str().unwrap_or_default().to_string(),
            provisioning_state: v["properties"]["provisioningState"].as_str().unwrap_or_default().to_string(),
            raw_outputs:        v["properties"]["outputs"].clone(),
        }
    }

    /// Decode all outputs into `T`, keyed by output name.
    pub fn outputs<T: DeserializeOwned>(&self) -> Result<T, CloudError> {
        let flattened: Map<String, Value> = self
            .raw_outputs
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v["value"].clone())).collect())
            .unwrap_or_default();
        serde_json::from_value(Value::Object(flattened))
            .map_err(|e| CloudError::decode(format!("outputs of deployment {}", self.name), e))
    }

    /// Decode a single output's value.
    pub fn output<T: DeserializeOwned>(&self, key: &str) -> Result<T, CloudError> {
        let value = self
            .raw_outputs
            .get(key)
            .and_then(|o| o.get("value"))
            .ok_or_else(|| CloudError::NotFound(format!("output {:?} of deployment {}", key, self.name)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| CloudError::decode(format!("output {:?} of deployment {}", key, self.name), e))
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DeploymentsClient {
    arm:             ArmClient,
    subscription_id: String,
}

impl DeploymentsClient {
    pub fn new(arm: ArmClient, subscription_id: &str) -> Self {
        Self { arm, subscription_id: subscription_id.to_string() }
    }

    fn base_url(&self, scope: &DeploymentScope) -> String {
        match scope {
            DeploymentScope::ResourceGroup(rg) => self.arm.management_url(&format!(
                "/subscriptions/{}/resourcegroups/{}/providers/Microsoft.Resources/deployments",
                self.subscription_id, rg
            )),
            DeploymentScope::Subscription => self.arm.management_url(&format!(
                "/subscriptions/{}/providers/Microsoft.Resources/deployments",
                self.subscription_id
            )),
        }
    }

    fn url(&self, scope: &DeploymentScope, name: &str) -> String {
        format!("{}/{}?api-version={}", self.base_url(scope), name, DEPLOYMENTS_API_VERSION)
    }

    /// Submit the deployment and wait for a terminal provisioning state.
    /// Never retried: a failed deployment is reported with the cloud's detail.
    pub async fn create_and_wait(&self, req: &DeploymentRequest) -> Result<Deployment, CloudError> {
        req.validate()?;
        let url = self.url(&req.scope, &req.name);
        let options = RequestOptions::management();

        self.arm
            .put(&url, &req.body())
            .await?
            .into_result("PUT", &url)
            .map_err(|e| e.context(format!("failed creating {}", req.describe())))?;

        let op = ProvisioningStateOperation::new(self.arm.clone(), &url, options, req.describe());
        let policy = PollPolicy::new(req.poll_interval, req.timeout);
        let finished = await_completion(op, &policy).await?;
        let deployment = Deployment::from_value(&finished);
        info!(deployment = %deployment.name, state = %deployment.provisioning_state, "deployment finished");
        Ok(deployment)
    }

    pub async fn get(&self, scope: &DeploymentScope, name: &str) -> Result<Deployment, CloudError> {
        let body = self.arm.get_json(&self.url(scope, name), &RequestOptions::management()).await?;
        Ok(Deployment::from_value(&body))
    }

    pub async fn list(&self, resource_group: &str) -> Result<Vec<Deployment>, CloudError> {
        let items = self.list_raw(resource_group).await?;
        Ok(items.iter().map(Deployment::from_value).collect())
    }

    /// Deployments in the group as ARM returned them.
    pub async fn list_raw(&self, resource_group: &str) -> Result<Vec<Value>, CloudError> {
        let url = format!(
            "{}?api-version={}",
            self.base_url(&DeploymentScope::ResourceGroup(resource_group.to_string())),
            DEPLOYMENTS_API_VERSION
        );
        self.arm.list_all(&url, &RequestOptions::management()).await
    }

    /// Per-resource operations of a deployment; useful when it failed.
    pub async fn list_operations(&self, resource_group: &str, name: &str) -> Result<Vec<Value>, CloudError> {
        let url = format!(
            "{}/{}/operations?api-version={}",
            self.base_url(&DeploymentScope::ResourceGroup(resource_group.to_string())),
            name,
            DEPLOYMENTS_API_VERSION
        );
        self.arm.list_all(&url, &RequestOptions::management()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::tests::client;
    use serde::Deserialize;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const DEPLOYMENT: &str =
        "/subscriptions/sub/resourcegroups/rg/providers/Microsoft.Resources/deployments/aro-hcp-e2e-setup";

    #[test]
    fn validation_messages() {
        let err = DeploymentRequest::in_resource_group("", "rg", json!({})).validate().unwrap_err();
        assert!(err.to_string().contains("deployment name must be specified"));
        let err = DeploymentRequest::in_resource_group("d", "", json!({})).validate().unwrap_err();
        assert!(err.to_string().contains("resource group name must be specified"));
        let err = DeploymentRequest::at_subscription("d", "", json!({})).validate().unwrap_err();
        assert!(err.to_string().contains("location must be specified"));
        assert!(DeploymentRequest::at_subscription("d", "uksouth", json!({})).validate().is_ok());
    }

    #[test]
    fn body_wraps_parameters() {
        let body = DeploymentRequest::in_resource_group("d", "rg", json!({"resources": []}))
            .parameter("clusterName", "e2e-cluster-abc")
            .body();
        assert_eq!(body["properties"]["parameters"]["clusterName"]["value"], "e2e-cluster-abc");
        assert_eq!(body["properties"]["mode"], "Incremental");
        assert_eq!(body["properties"]["debugSetting"]["detailLevel"], "requestContent");
        assert!(body.get("location").is_none());
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct SetupOutputs {
        user_assigned_identities_value: Value,
        identity_value:                 Value,
    }

    #[test]
    fn outputs_decode_into_typed_struct() {
        let dep = Deployment::from_value(&json!({
            "name": "d",
            "properties": {
                "provisioningState": "Succeeded",
                "outputs": {
                    "userAssignedIdentitiesValue": {"type": "Object", "value": {"a": 1}},
                    "identityValue": {"type": "Object", "value": {"b": 2}}
                }
            }
        }));
        let out: SetupOutputs = dep.outputs().unwrap();
        assert_eq!(out.user_assigned_identities_value["a"], 1);
        assert_eq!(out.identity_value["b"], 2);
        assert_eq!(dep.output::<Value>("identityValue").unwrap()["b"], 2);
    }

    #[test]
    fn missing_output_is_decode_error() {
        let dep = Deployment::from_value(&json!({"name": "d", "properties": {"outputs": {}}}));
        let err = dep.outputs::<SetupOutputs>().unwrap_err();
        assert!(matches!(err, CloudError::Decode { .. }), "got: {}", err);
    }

    #[tokio::test]
    async fn create_and_wait_polls_to_success() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(DEPLOYMENT))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "name": "aro-hcp-e2e-setup",
                "properties": {"provisioningState": "Accepted"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(DEPLOYMENT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "aro-hcp-e2e-setup",
                "properties": {"provisioningState": "Running"}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(DEPLOYMENT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "aro-hcp-e2e-setup",
                "properties": {
                    "provisioningState": "Succeeded",
                    "outputs": {"identityValue": {"type": "String", "value": "x"}}
                }
            })))
            .mount(&server)
            .await;

        let req = DeploymentRequest::in_resource_group("aro-hcp-e2e-setup", "rg", json!({}))
            .poll_interval(Duration::from_millis(10));
        let dep = DeploymentsClient::new(client(&server), "sub").create_and_wait(&req).await.unwrap();
        assert_eq!(dep.provisioning_state, "Succeeded");
        assert_eq!(dep.output::<String>("identityValue").unwrap(), "x");
    }

    #[tokio::test]
    async fn failed_deployment_surfaces_detail() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(DEPLOYMENT))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "properties": {"provisioningState": "Accepted"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(DEPLOYMENT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "properties": {
                    "provisioningState": "Failed",
                    "error": {
                        "code": "DeploymentFailed",
                        "message": "At least one resource deployment operation failed.",
                        "details": [{"code": "SubnetInUse", "message": "subnet is in use"}]
                    }
                }
            })))
            .mount(&server)
            .await;
        let req = DeploymentRequest::in_resource_group("aro-hcp-e2e-setup", "rg", json!({}))
            .poll_interval(Duration::from_millis(10));
        let err = DeploymentsClient::new(client(&server), "sub").create_and_wait(&req).await.unwrap_err();
        assert!(matches!(err, CloudError::OperationFailed { .. }), "got: {}", err);
        assert!(err.to_string().contains("SubnetInUse: subnet is in use"), "got: {}", err);
    }
}
