use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::DomainError;

// ── Shared cluster setup ──────────────────────────────────────────────────────

/// Description of the pre-provisioned cluster that shared-cluster tests run
/// against. Loaded once per run and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupModel {
    #[serde(rename = "E2ESetup", default)]
    pub e2e_setup: E2ESetup,
    #[serde(rename = "CustomerEnv", default)]
    pub customer_env: CustomerEnv,
    #[serde(rename = "Cluster", default)]
    pub cluster: ClusterEntry,
    #[serde(rename = "Nodepools", default)]
    pub nodepools: Vec<NodePoolEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct E2ESetup {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerEnv {
    #[serde(rename = "CustomerRGName", default)]
    pub resource_group: String,
    #[serde(rename = "CustomerVNetName", default)]
    pub vnet_name: String,
    #[serde(rename = "CustomerNSGName", default)]
    pub nsg_name: String,
    /// Operator identities profile, passed through to cluster bodies as-is.
    #[serde(rename = "UAMIs", default)]
    pub uamis: Value,
    /// Resource ID → identity entry for the cluster's `identity` block.
    #[serde(rename = "IdentityUAMIs", default)]
    pub identity_uamis: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterEntry {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "ARMData", default)]
    pub arm_data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePoolEntry {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "ARMData", default)]
    pub arm_data: Value,
}

impl SetupModel {
    /// Check the fields every shared-cluster test dereferences.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.customer_env.resource_group.trim().is_empty() {
            return Err(DomainError::InvalidSetup("CustomerEnv.CustomerRGName is empty".into()));
        }
        if self.cluster.name.trim().is_empty() {
            return Err(DomainError::InvalidSetup("Cluster.Name is empty".into()));
        }
        if let Some(np) = self.nodepools.iter().find(|np| np.name.trim().is_empty()) {
            return Err(DomainError::InvalidSetup(format!(
                "node pool entry with empty Name (ARMData: {})",
                np.arm_data
            )));
        }
        Ok(())
    }

    pub fn resource_group(&self) -> &str {
        &self.customer_env.resource_group
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster.name
    }

    pub fn nodepool_names(&self) -> impl Iterator<Item = &str> {
        self.nodepools.iter().map(|np| np.name.as_str())
    }
}
