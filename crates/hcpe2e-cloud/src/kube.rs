use base64::Engine;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::CloudError;

// ── Kubeconfig ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(default)]
    pub clusters:        Vec<NamedCluster>,
    #[serde(default)]
    pub users:           Vec<NamedUser>,
    #[serde(default)]
    pub contexts:        Vec<NamedContext>,
    #[serde(default)]
    pub current_context: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    pub name:    String,
    pub cluster: ClusterEntry,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    pub server:                     String,
    #[serde(default)]
    pub certificate_authority_data: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify:   bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: UserEntry,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    #[serde(default)]
    pub token:                   Option<String>,
    #[serde(default)]
    pub client_certificate_data: Option<String>,
    #[serde(default)]
    pub client_key_data:         Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    pub name:    String,
    pub context: ContextEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextEntry {
    pub cluster: String,
    pub user:    String,
}

impl Kubeconfig {
    pub fn parse(text: &str) -> Result<Self, CloudError> {
        serde_yaml::from_str(text).map_err(|e| CloudError::decode("kubeconfig", e))
    }

    /// Cluster and user of the current context, or of the first context
    /// when none is selected.
    pub fn resolve(&self) -> Result<(&ClusterEntry, &UserEntry), CloudError> {
        let context = match &self.current_context {
            Some(name) => self.contexts.iter().find(|c| &c.name == name),
            None => self.contexts.first(),
        }
        .ok_or_else(|| CloudError::decode("kubeconfig", "no usable context"))?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| CloudError::decode("kubeconfig", format!("cluster {:?} not found", context.context.cluster)))?;
        let user = self
            .users
            .iter()
            .find(|u| u.name == context.context.user)
            .map(|u| &u.user)
            .ok_or_else(|| CloudError::decode("kubeconfig", format!("user {:?} not found", context.context.user)))?;
        Ok((cluster, user))
    }
}

fn decode_b64(what: &str, data: &str) -> Result<Vec<u8>, CloudError> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| CloudError::decode(what, e))
}

// ── API types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSummary {
    pub name:  String,
    pub ready: bool,
}

fn node_summary(node: &Value) -> NodeSummary {
    let ready = node["status"]["conditions"]
        .as_array()
        .map(|conds| {
            conds
                .iter()
                .any(|c| c["type"] == "Ready" && c["status"] == "True")
        })
        .unwrap_or(false);
    NodeSummary {
        name: node["metadata"]["name"].as_str().unwrap_or_default().to_string(),
        ready,
    }
}

/// Attributes of a `SelfSubjectAccessReview`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAttributes {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace:   String,
    pub verb:        String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group:       String,
    pub resource:    String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subresource: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name:        String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub groups:   Vec<String>,
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Minimal Kubernetes REST client authenticated from a kubeconfig.
#[derive(Clone)]
pub struct KubeClient {
    http:   reqwest::Client,
    server: String,
    token:  Option<String>,
}

impl KubeClient {
    /// `insecure` skips TLS verification regardless of the kubeconfig.
    pub fn from_kubeconfig(text: &str, insecure: bool) -> Result<Self, CloudError> {
        let config = Kubeconfig::parse(text)?;
        let (cluster, user) = config.resolve()?;

        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure || cluster.insecure_skip_tls_verify);
        if let Some(ca) = &cluster.certificate_authority_data {
            let pem = decode_b64("certificate-authority-data", ca)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| CloudError::decode("certificate-authority-data", e))?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&user.client_certificate_data, &user.client_key_data) {
            let mut pem = decode_b64("client-certificate-data", cert)?;
            pem.extend(decode_b64("client-key-data", key)?);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| CloudError::decode("client certificate", e))?;
            builder = builder.identity(identity);
        }
        let http = builder
            .build()
            .map_err(|e| CloudError::InvalidRequest(format!("building kube client: {}", e)))?;
        Ok(Self {
            http,
            server: cluster.server.trim_end_matches('/').to_string(),
            token:  user.token.clone(),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Issue a raw request. Non-2xx answers become [`CloudError::Api`] with the
    /// Kubernetes `Status.reason` as the error code.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, CloudError> {
        let url = format!("{}{}", self.server, path);
        debug!(%method, url, "kube request");
        let mut req = self.http.request(method.clone(), &url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let transport = |e: reqwest::Error| CloudError::Transport {
            method: method.to_string(),
            url:    url.clone(),
            source: e,
        };
        let resp = req.send().await.map_err(transport)?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(transport)?;
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        if (200..300).contains(&status) {
            Ok(value)
        } else {
            Err(status_error(method.as_str(), &url, status, &value))
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value, CloudError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn version(&self) -> Result<String, CloudError> {
        let v = self.get("/version").await?;
        Ok(v["gitVersion"].as_str().unwrap_or_default().to_string())
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeSummary>, CloudError> {
        let list = self.get("/api/v1/nodes").await?;
        Ok(list["items"]
            .as_array()
            .map(|items| items.iter().map(node_summary).collect())
            .unwrap_or_default())
    }

    pub async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Value, CloudError> {
        self.get(&format!("/apis/apps/v1/namespaces/{}/deployments/{}", namespace, name))
            .await
    }

    pub async fn create_deployment(&self, namespace: &str, body: &Value) -> Result<Value, CloudError> {
        self.request(Method::POST, &format!("/apis/apps/v1/namespaces/{}/deployments", namespace), Some(body))
            .await
    }

    pub async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), CloudError> {
        match self
            .request(Method::DELETE, &format!("/apis/apps/v1/namespaces/{}/deployments/{}", namespace, name), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Whether the API server says the caller may perform `attrs`.
    pub async fn can_i(&self, attrs: &ResourceAttributes) -> Result<bool, CloudError> {
        let body = json!({
            "apiVersion": "authorization.k8s.io/v1",
            "kind":       "SelfSubjectAccessReview",
            "spec":       { "resourceAttributes": attrs },
        });
        let review = self
            .request(Method::POST, "/apis/authorization.k8s.io/v1/selfsubjectaccessreviews", Some(&body))
            .await?;
        Ok(review["status"]["allowed"].as_bool().unwrap_or(false))
    }

    pub async fn who_am_i(&self) -> Result<UserInfo, CloudError> {
        let body = json!({
            "apiVersion": "authentication.k8s.io/v1",
            "kind":       "SelfSubjectReview",
        });
        let review = self
            .request(Method::POST, "/apis/authentication.k8s.io/v1/selfsubjectreviews", Some(&body))
            .await?;
        serde_json::from_value(review["status"]["userInfo"].clone()).map_err(|e| CloudError::decode("userInfo", e))
    }
}

fn status_error(method: &str, url: &str, status: u16, body: &Value) -> CloudError {
    let (code, message) = match body {
        Value::Object(_) if body["kind"] == "Status" => (
            body["reason"].as_str().unwrap_or("Unknown").to_string(),
            body["message"].as_str().unwrap_or_default().to_string(),
        ),
        Value::String(text) => ("Unknown".to_string(), text.trim().to_string()),
        _ => ("Unknown".to_string(), body.to_string()),
    };
    CloudError::Api {
        method: method.to_string(),
        url: url.to_string(),
        status,
        code,
        message,
        correlation_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn kubeconfig(server: &str) -> String {
        format!(
            "apiVersion: v1
kind: Config
current-context: admin
clusters:
- name: c1
  cluster:
    server: {}
contexts:
- name: admin
  context:
    cluster: c1
    user: admin
users:
- name: admin
  user:
    token: kube-token
",
            server
        )
    }

    #[test]
    fn resolve_fails_for_unknown_user() {
        let cfg = Kubeconfig::parse(
            "contexts:\n- name: a\n  context: {cluster: c, user: u}\nclusters:\n- name: c\n  cluster: {server: https://x}\n",
        )
        .unwrap();
        assert!(cfg.resolve().is_err());
    }

    #[tokio::test]
    async fn nodes_are_listed_with_readiness() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/nodes"))
            .and(header("authorization", "Bearer kube-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [
                {"metadata": {"name": "n1"}, "status": {"conditions": [{"type": "Ready", "status": "True"}]}},
                {"metadata": {"name": "n2"}, "status": {"conditions": [{"type": "Ready", "status": "False"}]}}
            ]})))
            .mount(&server)
            .await;
        let kube = KubeClient::from_kubeconfig(&kubeconfig(&server.uri()), false).unwrap();
        let nodes = kube.list_nodes().await.unwrap();
        assert_eq!(nodes, vec![
            NodeSummary { name: "n1".into(), ready: true },
            NodeSummary { name: "n2".into(), ready: false },
        ]);
    }

    #[tokio::test]
    async fn forbidden_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "kind": "Status", "reason": "Forbidden", "code": 403,
                "message": "secrets is forbidden: User \"system:anonymous\" cannot list resource"
            })))
            .mount(&server)
            .await;
        let kube = KubeClient::from_kubeconfig(&kubeconfig(&server.uri()), false).unwrap();
        let err = kube.get("/api/v1/secrets").await.unwrap_err();
        assert!(err.is_forbidden());
        assert_eq!(err.code(), Some("Forbidden"));
    }

    #[tokio::test]
    async fn access_review_and_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apis/authorization.k8s.io/v1/selfsubjectaccessreviews"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"status": {"allowed": true}})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/apis/authentication.k8s.io/v1/selfsubjectreviews"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"status": {"userInfo": {
                "username": "system:admin", "groups": ["system:masters", "system:authenticated"]
            }}})))
            .mount(&server)
            .await;
        let kube = KubeClient::from_kubeconfig(&kubeconfig(&server.uri()), false).unwrap();
        let attrs = ResourceAttributes { verb: "list".into(), resource: "pods".into(), ..Default::default() };
        assert!(kube.can_i(&attrs).await.unwrap());
        let me = kube.who_am_i().await.unwrap();
        assert!(me.groups.contains(&"system:masters".to_string()));
    }
}
