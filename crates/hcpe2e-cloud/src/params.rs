use std::collections::BTreeMap;

use serde_json::{json, Value};

/// Operator identities wired into a cluster's platform profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatorIdentities {
    /// Operator name → user-assigned identity resource ID.
    pub control_plane:    BTreeMap<String, String>,
    pub data_plane:       BTreeMap<String, String>,
    pub service_identity: Option<String>,
}

impl OperatorIdentities {
    pub fn profile(&self) -> Value {
        let mut profile = json!({
            "controlPlaneOperators": self.control_plane,
            "dataPlaneOperators":    self.data_plane,
        });
        if let Some(id) = &self.service_identity {
            profile["serviceManagedIdentity"] = json!(id);
        }
        profile
    }

    /// `identity` block listing every identity as user-assigned.
    pub fn identity_block(&self) -> Value {
        let assigned: BTreeMap<&str, Value> = self
            .control_plane
            .values()
            .chain(self.service_identity.iter())
            .map(|id| (id.as_str(), json!({})))
            .collect();
        json!({ "type": "UserAssigned", "userAssignedIdentities": assigned })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkParams {
    pub network_type: String,
    pub pod_cidr:     String,
    pub service_cidr: String,
    pub machine_cidr: String,
    pub host_prefix:  u32,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            network_type: "OVNKubernetes".into(),
            pod_cidr:     "10.128.0.0/14".into(),
            service_cidr: "172.30.0.0/16".into(),
            machine_cidr: "10.0.0.0/16".into(),
            host_prefix:  23,
        }
    }
}

/// Inputs for an HCP cluster create request.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterParams {
    pub cluster_name:           String,
    pub openshift_version:      String,
    pub channel_group:          String,
    pub managed_resource_group: String,
    pub subnet_id:              String,
    pub nsg_id:                 String,
    pub network:                NetworkParams,
    pub api_visibility:         String,
    pub authorized_cidrs:       Vec<String>,
    pub image_registry_state:   String,
    pub identities:             OperatorIdentities,
    /// Passed through verbatim when set; takes precedence over `identities`.
    pub user_assigned_profile:  Option<Value>,
    pub identity:               Option<Value>,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            cluster_name:           String::new(),
            openshift_version:      "4.19".into(),
            channel_group:          "stable".into(),
            managed_resource_group: String::new(),
            subnet_id:              String::new(),
            nsg_id:                 String::new(),
            network:                NetworkParams::default(),
            api_visibility:         "Public".into(),
            authorized_cidrs:       Vec::new(),
            image_registry_state:   "Enabled".into(),
            identities:             OperatorIdentities::default(),
            user_assigned_profile:  None,
            identity:               None,
        }
    }
}

impl ClusterParams {
    /// ARM body for `PUT hcpOpenShiftClusters/{name}`.
    pub fn to_body(&self, location: &str) -> Value {
        let operators = self
            .user_assigned_profile
            .clone()
            .unwrap_or_else(|| self.identities.profile());
        let identity = self
            .identity
            .clone()
            .unwrap_or_else(|| self.identities.identity_block());
        let mut api = json!({ "visibility": self.api_visibility });
        if !self.authorized_cidrs.is_empty() {
            api["authorizedCidrs"] = json!(self.authorized_cidrs);
        }
        json!({
            "location": location,
            "identity": identity,
            "properties": {
                "version": { "id": self.openshift_version, "channelGroup": self.channel_group },
                "platform": {
                    "managedResourceGroup":    self.managed_resource_group,
                    "subnetId":                self.subnet_id,
                    "networkSecurityGroupId":  self.nsg_id,
                    "operatorsAuthentication": { "userAssignedIdentities": operators },
                },
                "network": {
                    "networkType": self.network.network_type,
                    "podCidr":     self.network.pod_cidr,
                    "serviceCidr": self.network.service_cidr,
                    "machineCidr": self.network.machine_cidr,
                    "hostPrefix":  self.network.host_prefix,
                },
                "api": api,
                "clusterImageRegistry": { "state": self.image_registry_state },
            }
        })
    }
}

/// Inputs for a node pool create request.
#[derive(Debug, Clone, PartialEq)]
pub struct NodePoolParams {
    pub node_pool_name:    String,
    pub openshift_version: String,
    pub channel_group:     String,
    pub replicas:          u32,
    pub vm_size:           String,
    pub os_disk_size_gib:  u32,
    pub disk_storage_type: String,
}

impl Default for NodePoolParams {
    fn default() -> Self {
        Self {
            node_pool_name:    "nodepool-1".into(),
            openshift_version: "4.19".into(),
            channel_group:     "stable".into(),
            replicas:          2,
            vm_size:           "Standard_D8s_v3".into(),
            os_disk_size_gib:  64,
            disk_storage_type: "StandardSSD_LRS".into(),
        }
    }
}

impl NodePoolParams {
    pub fn to_body(&self, location: &str) -> Value {
        json!({
            "location": location,
            "properties": {
                "version":  { "id": self.openshift_version, "channelGroup": self.channel_group },
                "replicas": self.replicas,
                "platform": {
                    "vmSize": self.vm_size,
                    "osDisk": {
                        "sizeGiB":                self.os_disk_size_gib,
                        "diskStorageAccountType": self.disk_storage_type,
                    },
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_body_carries_identities() {
        let mut params = ClusterParams {
            cluster_name:           "c1".into(),
            managed_resource_group: "rg-c1-managed".into(),
            ..Default::default()
        };
        params.identities.control_plane.insert("ingress".into(), "/id/ingress".into());
        params.identities.data_plane.insert("disk-csi-driver".into(), "/id/dp-disk".into());
        params.identities.service_identity = Some("/id/service".into());

        let body = params.to_body("uksouth");
        let ops = &body["properties"]["platform"]["operatorsAuthentication"]["userAssignedIdentities"];
        assert_eq!(ops["controlPlaneOperators"]["ingress"], "/id/ingress");
        assert_eq!(ops["serviceManagedIdentity"], "/id/service");
        assert!(body["identity"]["userAssignedIdentities"].get("/id/ingress").is_some());
        assert!(body["identity"]["userAssignedIdentities"].get("/id/dp-disk").is_none());
        assert_eq!(body["properties"]["platform"]["managedResourceGroup"], "rg-c1-managed");
        assert!(body["properties"]["api"].get("authorizedCidrs").is_none());
    }

    #[test]
    fn node_pool_body_defaults() {
        let body = NodePoolParams::default().to_body("uksouth");
        assert_eq!(body["properties"]["replicas"], 2);
        assert_eq!(body["properties"]["platform"]["vmSize"], "Standard_D8s_v3");
    }
}
