use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::arm::{ArmClient, RequestOptions};
use crate::error::CloudError;
use crate::network::NetworkClient;
use crate::wait::PollPolicy;

pub const RESOURCE_GROUPS_API_VERSION: &str = "2021-04-01";

/// Marks a group as created by the E2E harness.
pub const E2E_TAG: &str = "e2e.aro-hcp-ci.redhat.com";
/// RFC3339 time after which a sweep may delete the group.
pub const DELETE_AFTER_TAG: &str = "deleteAfter.aro-hcp-ci.redhat.com";

pub const MIN_RESOURCE_GROUP_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_RESOURCE_GROUP_TTL: Duration = Duration::from_secs(4 * 60 * 60);
pub const RESOURCE_GROUP_CREATE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

const FORCE_DELETION_TYPES: &str =
    "Microsoft.Compute/virtualMachines,Microsoft.Compute/virtualMachineScaleSets";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    #[serde(default)]
    pub id:         String,
    pub name:       String,
    #[serde(default)]
    pub location:   String,
    #[serde(default)]
    pub tags:       BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_by: Option<String>,
    #[serde(default)]
    pub properties: ResourceGroupProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupProperties {
    #[serde(default)]
    pub provisioning_state: Option<String>,
}

impl ResourceGroup {
    pub fn is_e2e(&self) -> bool {
        self.tags.get(E2E_TAG).map(String::as_str) == Some("true")
    }

    /// Parsed `deleteAfter` tag. `None` when absent, `Some(Err)` when unparsable.
    pub fn delete_after(&self) -> Option<Result<DateTime<Utc>, chrono::ParseError>> {
        self.tags
            .get(DELETE_AFTER_TAG)
            .map(|v| DateTime::parse_from_rfc3339(v).map(|t| t.with_timezone(&Utc)))
    }

    /// True when this is a managed group owned by an HCP cluster in `resource_group`.
    pub fn is_managed_by_cluster_in(&self, resource_group: &str) -> bool {
        let pattern = format!(
            "/resourcegroups/{}/providers/microsoft.redhatopenshift/hcpopenshiftclusters/",
            resource_group.to_ascii_lowercase()
        );
        self.managed_by
            .as_deref()
            .map(|m| m.to_ascii_lowercase().contains(&pattern))
            .unwrap_or(false)
    }
}

/// Tags every harness-created group carries.
pub fn e2e_tags(ttl: Duration, now: DateTime<Utc>) -> Result<BTreeMap<String, String>, CloudError> {
    if ttl < MIN_RESOURCE_GROUP_TTL {
        return Err(CloudError::InvalidRequest(format!(
            "resourceGroupTTL must be at least an hour, got {:?}",
            ttl
        )));
    }
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| CloudError::InvalidRequest(format!("resourceGroupTTL out of range: {}", e)))?;
    let delete_after = (now + ttl).to_rfc3339_opts(SecondsFormat::Secs, true);
    Ok(BTreeMap::from([
        (E2E_TAG.to_string(), "true".to_string()),
        (DELETE_AFTER_TAG.to_string(), delete_after),
    ]))
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ResourceGroupsClient {
    arm:             ArmClient,
    subscription_id: String,
}

impl ResourceGroupsClient {
    pub fn new(arm: ArmClient, subscription_id: &str) -> Self {
        Self { arm, subscription_id: subscription_id.to_string() }
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    fn url(&self, name: &str) -> String {
        self.arm.management_url(&format!(
            "/subscriptions/{}/resourcegroups/{}?api-version={}",
            self.subscription_id, name, RESOURCE_GROUPS_API_VERSION
        ))
    }

    pub async fn create(
        &self,
        name: &str,
        location: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceGroup, CloudError> {
        let url = self.url(name);
        let body = json!({ "location": location, "tags": tags });
        let fut = self.arm.put(&url, &body);
        let resp = tokio::time::timeout(RESOURCE_GROUP_CREATE_TIMEOUT, fut)
            .await
            .map_err(|_| CloudError::Timeout {
                operation:   format!("create resource group {}", name),
                waited:      RESOURCE_GROUP_CREATE_TIMEOUT,
                last_status: None,
            })??
            .into_result("PUT", &url)?;
        info!(resource_group = name, location, "created resource group");
        serde_json::from_value(resp.body).map_err(|e| CloudError::decode("resource group", e))
    }

    /// Create a group tagged for the E2E sweeper, expiring after `ttl`.
    pub async fn create_e2e(&self, name: &str, location: &str, ttl: Duration) -> Result<ResourceGroup, CloudError> {
        let tags = e2e_tags(ttl, Utc::now())?;
        self.create(name, location, &tags).await
    }

    pub async fn get(&self, name: &str) -> Result<ResourceGroup, CloudError> {
        let body = self.arm.get_json(&self.url(name), &RequestOptions::management()).await?;
        serde_json::from_value(body).map_err(|e| CloudError::decode("resource group", e))
    }

    /// List groups in the subscription, optionally with an OData `$filter`.
    pub async fn list(&self, filter: Option<&str>) -> Result<Vec<ResourceGroup>, CloudError> {
        let base = self
            .arm
            .management_url(&format!("/subscriptions/{}/resourcegroups", self.subscription_id));
        let mut params = vec![("api-version", RESOURCE_GROUPS_API_VERSION)];
        if let Some(f) = filter {
            params.push(("$filter", f));
        }
        let url = reqwest::Url::parse_with_params(&base, &params)
            .map_err(|e| CloudError::InvalidRequest(format!("resource group list url: {}", e)))?;
        self.arm
            .list_all(url.as_str(), &RequestOptions::management())
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| CloudError::decode("resource group", e)))
            .collect()
    }

    /// E2E-tagged groups whose `deleteAfter` is earlier than `now`.
    /// Groups with an unparsable expiry are skipped.
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ResourceGroup>, CloudError> {
        let filter = format!("tagName eq '{}' and tagValue eq 'true'", E2E_TAG);
        let groups = self
            .list(Some(&filter))
            .await
            .map_err(|e| e.context("failed listing resource groups"))?;
        Ok(groups
            .into_iter()
            .filter(|rg| match rg.delete_after() {
                Some(Ok(expiry)) => expiry < now,
                Some(Err(e)) => {
                    warn!(resource_group = %rg.name, error = %e, "skipping group with unparsable deleteAfter tag");
                    false
                }
                None => false,
            })
            .collect())
    }

    /// Managed groups left behind by HCP clusters that lived in `resource_group`.
    pub async fn managed_by_clusters_in(&self, resource_group: &str) -> Result<Vec<ResourceGroup>, CloudError> {
        Ok(self
            .list(None)
            .await?
            .into_iter()
            .filter(|rg| rg.is_managed_by_cluster_in(resource_group))
            .collect())
    }

    /// Delete a group and wait. Subnet NSGs are detached first. `force`
    /// also force-deletes virtual machines and scale sets. A group that is
    /// already gone counts as deleted.
    pub async fn delete(&self, name: &str, force: bool, policy: &PollPolicy) -> Result<(), CloudError> {
        NetworkClient::new(self.arm.clone(), &self.subscription_id)
            .detach_subnet_nsgs(name, policy)
            .await
            .map_err(|e| e.context(format!("failed to detach NSGs from subnets in resource group {}", name)))?;

        let mut url = self.url(name);
        if force {
            url = format!("{}&forceDeletionTypes={}", url, FORCE_DELETION_TYPES);
        }
        self.arm
            .delete_and_wait(&url, policy, &RequestOptions::management())
            .await
            .map_err(|e| e.context(format!("failed waiting for resourcegroup={:?} to finish deleting", name)))?;
        info!(resource_group = name, force, "deleted resource group");
        Ok(())
    }
}
