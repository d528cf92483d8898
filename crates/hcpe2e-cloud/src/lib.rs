//! REST clients for the cloud APIs the harness drives: ARM, Microsoft Graph,
//! the admin API and Kubernetes. Every call is a plain HTTPS request.

pub mod arm;
pub mod auth;
pub mod breakglass;
pub mod clusters;
pub mod deployments;
pub mod error;
pub mod graph;
pub mod identities;
pub mod kube;
pub mod network;
pub mod params;
pub mod resource_groups;
pub mod subscriptions;
pub mod wait;

pub use arm::{ArmClient, ArmResponse, BaseUrls, RequestOptions};
pub use auth::{decode_claims, Scope, TokenProvider};
pub use breakglass::{BreakglassClient, BreakglassCredential, Principal, PrincipalType};
pub use clusters::{HcpClient, HcpCluster, NodePool, RpEndpoint};
pub use deployments::{Deployment, DeploymentRequest, DeploymentScope, DeploymentsClient};
pub use error::CloudError;
pub use graph::{Application, GraphClient, PasswordCredential, ServicePrincipal};
pub use identities::{IdentityClient, UserAssignedIdentity};
pub use kube::{KubeClient, Kubeconfig, NodeSummary, ResourceAttributes, UserInfo};
pub use network::NetworkClient;
pub use params::{ClusterParams, NetworkParams, NodePoolParams, OperatorIdentities};
pub use resource_groups::{ResourceGroup, ResourceGroupsClient};
pub use subscriptions::find_subscription_id;
pub use wait::{await_completion, poll_until, Operation, PollPolicy, PollStatus};
