use serde_json::Value;
use tracing::{debug, info};

use crate::arm::{ArmClient, RequestOptions};
use crate::error::CloudError;
use crate::wait::PollPolicy;

pub const NETWORK_API_VERSION: &str = "2024-05-01";

/// Virtual network and subnet operations within one subscription.
#[derive(Clone)]
pub struct NetworkClient {
    arm:             ArmClient,
    subscription_id: String,
}

impl NetworkClient {
    pub fn new(arm: ArmClient, subscription_id: &str) -> Self {
        Self { arm, subscription_id: subscription_id.to_string() }
    }

    fn vnets_url(&self, resource_group: &str) -> String {
        self.arm.management_url(&format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks",
            self.subscription_id, resource_group
        ))
    }

    pub async fn list_vnets(&self, resource_group: &str) -> Result<Vec<Value>, CloudError> {
        let url = format!("{}?api-version={}", self.vnets_url(resource_group), NETWORK_API_VERSION);
        self.arm.list_all(&url, &RequestOptions::management()).await
    }

    pub async fn list_subnets(&self, resource_group: &str, vnet: &str) -> Result<Vec<Value>, CloudError> {
        let url = format!(
            "{}/{}/subnets?api-version={}",
            self.vnets_url(resource_group),
            vnet,
            NETWORK_API_VERSION
        );
        self.arm.list_all(&url, &RequestOptions::management()).await
    }

    /// Remove the NSG association from every subnet in the group.
    ///
    /// Attached NSGs block resource-group deletion. A group that no longer
    /// exists has nothing to detach. Returns the number of subnets updated.
    pub async fn detach_subnet_nsgs(&self, resource_group: &str, policy: &PollPolicy) -> Result<usize, CloudError> {
        let vnets = match self.list_vnets(resource_group).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => {
                return Err(e.context(format!("failed listing vnets in resource group {}", resource_group)));
            }
        };

        let mut detached = 0;
        for vnet in vnets {
            let Some(vnet_name) = vnet["name"].as_str() else { continue };
            let subnets = self
                .list_subnets(resource_group, vnet_name)
                .await
                .map_err(|e| e.context(format!("failed listing subnets in resource group {}", resource_group)))?;

            for mut subnet in subnets {
                let Some(subnet_name) = subnet["name"].as_str().map(str::to_string) else { continue };
                let has_nsg = subnet["properties"]["networkSecurityGroup"]["id"].is_string();
                if !has_nsg {
                    continue;
                }
                if let Some(props) = subnet.get_mut("properties").and_then(Value::as_object_mut) {
                    props.remove("networkSecurityGroup");
                }
                let url = format!(
                    "{}/{}/subnets/{}?api-version={}",
                    self.vnets_url(resource_group),
                    vnet_name,
                    subnet_name,
                    NETWORK_API_VERSION
                );
                debug!(resource_group, vnet = vnet_name, subnet = %subnet_name, "detaching NSG from subnet");
                self.arm
                    .put_and_wait(&url, &subnet, policy, &RequestOptions::management())
                    .await
                    .map_err(|e| {
                        e.context(format!(
                            "failed detaching NSG from subnet {} in resource group {}",
                            subnet_name, resource_group
                        ))
                    })?;
                detached += 1;
            }
        }
        if detached > 0 {
            info!(resource_group, detached, "detached NSGs from subnets");
        }
        Ok(detached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::tests::{client, fast};
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const VNETS: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks";

    #[tokio::test]
    async fn detaches_only_subnets_with_nsg() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(VNETS))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"name": "customer-vnet", "properties": {"subnets": []}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/customer-vnet/subnets", VNETS)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"name": "with-nsg", "properties": {
                        "addressPrefix": "10.0.0.0/24",
                        "networkSecurityGroup": {"id": "/nsg/customer-nsg"}
                    }},
                    {"name": "plain", "properties": {"addressPrefix": "10.0.1.0/24"}}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("{}/customer-vnet/subnets/with-nsg", VNETS)))
            .and(body_json(json!({"name": "with-nsg", "properties": {"addressPrefix": "10.0.0.0/24"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "with-nsg",
                "properties": {"provisioningState": "Succeeded"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let net = NetworkClient::new(client(&server), "sub");
        assert_eq!(net.detach_subnet_nsgs("rg", &fast()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_group_has_nothing_to_detach() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(VNETS))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": "ResourceGroupNotFound", "message": "Resource group 'rg' could not be found."}
            })))
            .mount(&server)
            .await;
        let net = NetworkClient::new(client(&server), "sub");
        assert_eq!(net.detach_subnet_nsgs("rg", &fast()).await.unwrap(), 0);
    }
}
