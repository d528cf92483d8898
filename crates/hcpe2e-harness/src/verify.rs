//! Composable checks run against a cluster through its kubeconfig.
//!
//! Positive checks must pass. Negative checks must fail with an
//! authorization denial: any other failure is reported as the wrong error
//! kind. [`verify_all`] runs every check and aggregates the failures.

use std::fmt;
use std::future::Future;
use std::sync::Mutex;

use async_trait::async_trait;
use hcpe2e_cloud::{poll_until, CloudError, KubeClient, PollPolicy, PollStatus, ResourceAttributes};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::VerifyError;

#[async_trait]
pub trait ClusterVerifier: Send + Sync {
    fn name(&self) -> String;

    async fn verify(&self, kube: &KubeClient) -> Result<(), VerifyError>;
}

/// Run every verifier; failures are collected, never short-circuited.
pub async fn verify_all(verifiers: &[Box<dyn ClusterVerifier>], kube: &KubeClient) -> Result<(), VerifyError> {
    let mut failures = Vec::new();
    for v in verifiers {
        match v.verify(kube).await {
            Ok(()) => debug!(check = %v.name(), "verification passed"),
            Err(e) => failures.push(e),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(VerifyError::Aggregate(failures))
    }
}

/// Re-run `attempt` under the cloud waiter until it passes or the policy's
/// timeout expires. The final error wraps the last failure.
pub async fn eventually<F, Fut>(check: &str, policy: PollPolicy, mut attempt: F) -> Result<(), VerifyError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<(), VerifyError>> + Send,
{
    let last: Mutex<Option<VerifyError>> = Mutex::new(None);
    let slot = &last;
    let outcome = poll_until(check, &policy, move || {
        let fut = attempt();
        async move {
            match fut.await {
                Ok(()) => Ok(PollStatus::Succeeded(())),
                Err(e) => {
                    debug!(check, error = %e, "check not passing yet");
                    let status = e.to_string();
                    if let Ok(mut guard) = slot.lock() {
                        *guard = Some(e);
                    }
                    Ok(PollStatus::Pending(status))
                }
            }
        }
    })
    .await;

    match outcome {
        Ok(()) => Ok(()),
        Err(CloudError::Timeout { waited, .. }) => {
            let last = last
                .into_inner()
                .ok()
                .flatten()
                .unwrap_or_else(|| VerifyError::mismatch(check, "attempt still running at the deadline"));
            Err(VerifyError::Eventually { check: check.to_string(), waited, last: Box::new(last) })
        }
        Err(e) => Err(VerifyError::request(check, e)),
    }
}

/// Turn the outcome of a request that should be denied into a verdict.
pub fn expect_denied<T>(check: &str, result: Result<T, CloudError>) -> Result<(), VerifyError> {
    match result {
        Ok(_) => Err(VerifyError::UnexpectedSuccess { check: check.to_string() }),
        Err(e) if e.is_forbidden() => Ok(()),
        Err(e) => Err(VerifyError::WrongErrorKind { check: check.to_string(), source: e }),
    }
}

/// Like [`expect_denied`], but a rejected credential (401) also counts.
pub fn expect_rejected<T>(check: &str, result: Result<T, CloudError>) -> Result<(), VerifyError> {
    match result {
        Err(e) if e.is_unauthorized() => Ok(()),
        other => expect_denied(check, other),
    }
}

// ── Cluster health ────────────────────────────────────────────────────────────

pub struct ApiReachable;

#[async_trait]
impl ClusterVerifier for ApiReachable {
    fn name(&self) -> String {
        "api reachable".into()
    }

    async fn verify(&self, kube: &KubeClient) -> Result<(), VerifyError> {
        let version = kube.version().await.map_err(|e| VerifyError::request(self.name(), e))?;
        if version.is_empty() {
            return Err(VerifyError::mismatch(self.name(), "/version returned no gitVersion"));
        }
        Ok(())
    }
}

pub struct NodeCount(pub usize);

#[async_trait]
impl ClusterVerifier for NodeCount {
    fn name(&self) -> String {
        format!("node count is {}", self.0)
    }

    async fn verify(&self, kube: &KubeClient) -> Result<(), VerifyError> {
        let nodes = kube.list_nodes().await.map_err(|e| VerifyError::request(self.name(), e))?;
        if nodes.len() != self.0 {
            return Err(VerifyError::mismatch(self.name(), format!("found {} nodes", nodes.len())));
        }
        Ok(())
    }
}

pub struct AllNodesReady;

#[async_trait]
impl ClusterVerifier for AllNodesReady {
    fn name(&self) -> String {
        "all nodes ready".into()
    }

    async fn verify(&self, kube: &KubeClient) -> Result<(), VerifyError> {
        let nodes = kube.list_nodes().await.map_err(|e| VerifyError::request(self.name(), e))?;
        if nodes.is_empty() {
            return Err(VerifyError::mismatch(self.name(), "cluster has no nodes"));
        }
        let not_ready: Vec<&str> = nodes.iter().filter(|n| !n.ready).map(|n| n.name.as_str()).collect();
        if !not_ready.is_empty() {
            return Err(VerifyError::mismatch(self.name(), format!("nodes not ready: {}", not_ready.join(", "))));
        }
        Ok(())
    }
}

/// A Deployment has as many ready replicas as it asks for.
pub struct DeploymentReady {
    pub namespace: String,
    pub name:      String,
}

impl DeploymentReady {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

#[async_trait]
impl ClusterVerifier for DeploymentReady {
    fn name(&self) -> String {
        format!("deployment {}/{} ready", self.namespace, self.name)
    }

    async fn verify(&self, kube: &KubeClient) -> Result<(), VerifyError> {
        let deployment = kube
            .get_deployment(&self.namespace, &self.name)
            .await
            .map_err(|e| VerifyError::request(self.name(), e))?;
        let desired = deployment["spec"]["replicas"].as_u64().unwrap_or(1);
        let ready = deployment["status"]["readyReplicas"].as_u64().unwrap_or(0);
        if ready < desired {
            return Err(VerifyError::mismatch(self.name(), format!("{}/{} replicas ready", ready, desired)));
        }
        Ok(())
    }
}

/// The caller's identity carries the expected groups.
pub struct WhoAmI {
    pub username: Option<String>,
    pub groups:   Vec<String>,
}

#[async_trait]
impl ClusterVerifier for WhoAmI {
    fn name(&self) -> String {
        "whoami".into()
    }

    async fn verify(&self, kube: &KubeClient) -> Result<(), VerifyError> {
        let user = kube.who_am_i().await.map_err(|e| VerifyError::request(self.name(), e))?;
        if let Some(expected) = &self.username {
            if &user.username != expected {
                return Err(VerifyError::mismatch(
                    self.name(),
                    format!("username is {:?}, expected {:?}", user.username, expected),
                ));
            }
        }
        let missing: Vec<&str> = self
            .groups
            .iter()
            .filter(|g| !user.groups.contains(g))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(VerifyError::mismatch(
                self.name(),
                format!("missing groups {:?}; user has {:?}", missing, user.groups),
            ));
        }
        Ok(())
    }
}

// ── Authorization ─────────────────────────────────────────────────────────────

/// One verb on one resource, checked by access review and by the real request.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionCheck {
    pub verb:        String,
    pub group:       String,
    pub version:     String,
    pub resource:    String,
    pub subresource: String,
    pub namespace:   String,
    pub name:        String,
}

impl PermissionCheck {
    pub fn new(verb: &str, group: &str, version: &str, resource: &str) -> Self {
        Self {
            verb:        verb.into(),
            group:       group.into(),
            version:     version.into(),
            resource:    resource.into(),
            subresource: String::new(),
            namespace:   String::new(),
            name:        String::new(),
        }
    }

    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    pub fn subresource(mut self, subresource: &str) -> Self {
        self.subresource = subresource.into();
        self
    }

    pub fn attributes(&self) -> ResourceAttributes {
        ResourceAttributes {
            namespace:   self.namespace.clone(),
            verb:        self.verb.clone(),
            group:       self.group.clone(),
            resource:    self.resource.clone(),
            subresource: self.subresource.clone(),
            name:        self.name.clone(),
        }
    }

    /// REST path the verb acts on.
    pub fn path(&self) -> String {
        let mut path = if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        if !self.namespace.is_empty() {
            path.push_str(&format!("/namespaces/{}", self.namespace));
        }
        path.push('/');
        path.push_str(&self.resource);
        if !self.name.is_empty() && self.verb != "create" {
            path.push('/');
            path.push_str(&self.name);
        }
        if !self.subresource.is_empty() {
            path.push('/');
            path.push_str(&self.subresource);
        }
        path
    }

    fn method(&self) -> Method {
        match self.verb.as_str() {
            "create" => Method::POST,
            "update" => Method::PUT,
            "patch" => Method::PATCH,
            "delete" | "deletecollection" => Method::DELETE,
            _ => Method::GET,
        }
    }

    fn is_read(&self) -> bool {
        matches!(self.verb.as_str(), "get" | "list")
    }

    /// Send the request the verb stands for. Mutating verbs carry a minimal
    /// body; authorization is decided before the body is validated.
    pub async fn issue(&self, kube: &KubeClient) -> Result<Value, CloudError> {
        let method = self.method();
        let body = match method {
            Method::POST | Method::PUT => Some(json!({ "metadata": { "name": self.name } })),
            Method::PATCH => Some(json!({})),
            _ => None,
        };
        kube.request(method, &self.path(), body.as_ref()).await
    }
}

impl fmt::Display for PermissionCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.verb)?;
        if !self.group.is_empty() {
            write!(f, "{}/", self.group)?;
        }
        write!(f, "{}", self.resource)?;
        if !self.subresource.is_empty() {
            write!(f, "/{}", self.subresource)?;
        }
        if !self.namespace.is_empty() {
            write!(f, " in {}", self.namespace)?;
        }
        Ok(())
    }
}

/// Positive form: the review allows it and, for reads, the request succeeds.
#[async_trait]
impl ClusterVerifier for PermissionCheck {
    fn name(&self) -> String {
        format!("can {}", self)
    }

    async fn verify(&self, kube: &KubeClient) -> Result<(), VerifyError> {
        let allowed = kube
            .can_i(&self.attributes())
            .await
            .map_err(|e| VerifyError::request(self.name(), e))?;
        if !allowed {
            return Err(VerifyError::mismatch(self.name(), "access review denied the request"));
        }
        if self.is_read() {
            self.issue(kube).await.map_err(|e| VerifyError::request(self.name(), e))?;
        }
        Ok(())
    }
}

/// Negative form of a [`PermissionCheck`]: both the review and the request
/// must deny it.
pub struct Denied(pub PermissionCheck);

#[async_trait]
impl ClusterVerifier for Denied {
    fn name(&self) -> String {
        format!("cannot {}", self.0)
    }

    async fn verify(&self, kube: &KubeClient) -> Result<(), VerifyError> {
        let name = self.name();
        let allowed = kube
            .can_i(&self.0.attributes())
            .await
            .map_err(|e| VerifyError::request(&name, e))?;
        if allowed {
            return Err(VerifyError::UnexpectedSuccess { check: name });
        }
        expect_denied(&name, self.0.issue(kube).await)
    }
}

/// The credential no longer works: listing namespaces is refused with 401 or 403.
pub struct AccessRevoked;

#[async_trait]
impl ClusterVerifier for AccessRevoked {
    fn name(&self) -> String {
        "access revoked".into()
    }

    async fn verify(&self, kube: &KubeClient) -> Result<(), VerifyError> {
        expect_rejected(&self.name(), kube.request(Method::GET, "/api/v1/namespaces", None).await)
    }
}

/// Retry a verifier until it passes.
pub struct Eventually {
    pub inner:  Box<dyn ClusterVerifier>,
    pub policy: PollPolicy,
}

#[async_trait]
impl ClusterVerifier for Eventually {
    fn name(&self) -> String {
        format!("eventually {}", self.inner.name())
    }

    async fn verify(&self, kube: &KubeClient) -> Result<(), VerifyError> {
        eventually(&self.inner.name(), self.policy, || self.inner.verify(kube)).await
    }
}
