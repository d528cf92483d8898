use std::sync::Arc;

use hcpe2e_config::HarnessConfig;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::auth::{select_provider, Scope, StaticToken, TokenProvider};
use crate::error::CloudError;
use crate::wait::{
    await_completion, is_terminal_state, provisioning_state, ArmOperation, PollPolicy,
    ProvisioningStateOperation,
};

const CORRELATION_HEADER: &str = "x-ms-correlation-request-id";
const CLIENT_REQUEST_HEADER: &str = "x-ms-client-request-id";

// ── Base URLs (overridden in tests) ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BaseUrls {
    pub management: String,
    pub login:      String,
    pub graph:      String,
}

impl Default for BaseUrls {
    fn default() -> Self {
        Self {
            management: "https://management.azure.com".into(),
            login:      "https://login.microsoftonline.com".into(),
            graph:      "https://graph.microsoft.com".into(),
        }
    }
}

impl BaseUrls {
    /// Every endpoint pointed at one server; used with mock servers.
    pub fn single(url: &str) -> Self {
        let url = url.trim_end_matches('/').to_string();
        Self { management: url.clone(), login: url.clone(), graph: url }
    }
}

// ── Request options ───────────────────────────────────────────────────────────

/// Per-request authentication scope and extra headers.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// `None` sends the request without a bearer token.
    pub auth:    Option<Scope>,
    pub headers: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn management() -> Self {
        Self { auth: Some(Scope::Management), headers: Vec::new() }
    }

    pub fn graph() -> Self {
        Self { auth: Some(Scope::Graph), headers: Vec::new() }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ArmResponse {
    pub status:          u16,
    /// JSON body; a non-JSON body is kept as a string, an empty one as null.
    pub body:            Value,
    pub async_operation: Option<String>,
    pub location:        Option<String>,
    pub correlation_id:  Option<String>,
    pub headers:         HeaderMap,
}

impl ArmResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// URL to poll for a long-running operation, if the service gave one.
    pub fn poll_url(&self) -> Option<&str> {
        self.async_operation.as_deref().or(self.location.as_deref())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Turn a non-2xx response into a [`CloudError::Api`].
    pub fn into_result(self, method: &str, url: &str) -> Result<Self, CloudError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(CloudError::api(method, url, self.status, &self.body, self.correlation_id))
        }
    }
}

// ── ArmClient ─────────────────────────────────────────────────────────────────

/// Thin REST client for Azure Resource Manager and friends. Cheap to clone;
/// clones share the HTTP pool and the token cache.
#[derive(Clone)]
pub struct ArmClient {
    http:  reqwest::Client,
    token: Arc<dyn TokenProvider>,
    base:  BaseUrls,
}

impl ArmClient {
    /// Build a client with the credential selected from `config`.
    pub fn new(config: &HarnessConfig) -> Self {
        let http = reqwest::Client::new();
        let base = BaseUrls::default();
        let token = select_provider(config, &base.login, http.clone());
        Self { http, token, base }
    }

    pub fn with_token_provider(token: Arc<dyn TokenProvider>, base: BaseUrls) -> Self {
        Self { http: reqwest::Client::new(), token, base }
    }

    /// Client with a fixed bearer token and custom base URLs.
    pub fn with_static_token(token: &str, base: BaseUrls) -> Self {
        Self::with_token_provider(Arc::new(StaticToken(token.to_string())), base)
    }

    pub fn base(&self) -> &BaseUrls {
        &self.base
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub async fn token(&self, scope: Scope) -> Result<String, CloudError> {
        self.token.token(scope).await
    }

    /// `path` is appended to the management endpoint as-is.
    pub fn management_url(&self, path: &str) -> String {
        format!("{}{}", self.base.management, path)
    }

    pub fn graph_url(&self, path: &str) -> String {
        format!("{}/v1.0{}", self.base.graph, path)
    }

    // ── HTTP verbs ────────────────────────────────────────────────────────────

    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        options: &RequestOptions,
    ) -> Result<ArmResponse, CloudError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!(%method, url, request_id, "Azure request");
        let mut req = self.http.request(method.clone(), url).header(CLIENT_REQUEST_HEADER, request_id.as_str());
        if let Some(scope) = options.auth {
            req = req.bearer_auth(self.token(scope).await?);
        }
        for (name, value) in &options.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let transport = |e: reqwest::Error| CloudError::Transport {
            method: method.to_string(),
            url:    url.to_string(),
            source: e,
        };
        let resp = req.send().await.map_err(transport)?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        let async_operation = header("Azure-AsyncOperation");
        let location = header("Location");
        let correlation_id = header(CORRELATION_HEADER);

        let text = resp.text().await.map_err(transport)?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(ArmResponse { status, body, async_operation, location, correlation_id, headers })
    }

    pub async fn put(&self, url: &str, body: &Value) -> Result<ArmResponse, CloudError> {
        self.execute(Method::PUT, url, Some(body), &RequestOptions::management()).await
    }

    /// GET and fail on any non-2xx status.
    pub async fn get_json(&self, url: &str, options: &RequestOptions) -> Result<Value, CloudError> {
        Ok(self.execute(Method::GET, url, None, options).await?.into_result("GET", url)?.body)
    }

    /// GET a paged ARM collection, following `nextLink`.
    pub async fn list_all(&self, url: &str, options: &RequestOptions) -> Result<Vec<Value>, CloudError> {
        let mut items = Vec::new();
        let mut next = Some(url.to_string());
        while let Some(page_url) = next.take() {
            let page = self.get_json(&page_url, options).await?;
            if let Some(values) = page["value"].as_array() {
                items.extend(values.iter().cloned());
            }
            next = page["nextLink"].as_str().map(|s| s.to_string());
        }
        Ok(items)
    }

    // ── Long-running operations ───────────────────────────────────────────────

    /// Send a mutating request and wait for the resource to settle.
    ///
    /// A poll URL in the response is followed with [`ArmOperation`] and the
    /// resource is re-read afterwards. Without one, a non-terminal
    /// `provisioningState` is polled on `url` itself.
    pub async fn send_and_wait(
        &self,
        method: Method,
        url: &str,
        body: &Value,
        policy: &PollPolicy,
        options: &RequestOptions,
    ) -> Result<Value, CloudError> {
        let name = format!("{} {}", method, url);
        let resp = self
            .execute(method.clone(), url, Some(body), options)
            .await?
            .into_result(method.as_str(), url)?;

        if let (201 | 202, Some(op_url)) = (resp.status, resp.poll_url()) {
            let op = ArmOperation::new(self.clone(), op_url, options.clone(), name);
            await_completion(op, policy).await?;
            return self.get_json(url, options).await;
        }
        match provisioning_state(&resp.body) {
            Some(state) if !is_terminal_state(state) => {
                let op = ProvisioningStateOperation::new(self.clone(), url, options.clone(), name);
                await_completion(op, policy).await
            }
            _ => Ok(resp.body),
        }
    }

    pub async fn put_and_wait(
        &self,
        url: &str,
        body: &Value,
        policy: &PollPolicy,
        options: &RequestOptions,
    ) -> Result<Value, CloudError> {
        self.send_and_wait(Method::PUT, url, body, policy, options).await
    }

    /// DELETE with delete-if-exists semantics: a missing resource is success.
    pub async fn delete_and_wait(
        &self,
        url: &str,
        policy: &PollPolicy,
        options: &RequestOptions,
    ) -> Result<(), CloudError> {
        let resp = match self
            .execute(Method::DELETE, url, None, options)
            .await?
            .into_result("DELETE", url)
        {
            Ok(resp) => resp,
            Err(e) if e.is_not_found() => {
                debug!(url, "already deleted");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let (201 | 202, Some(op_url)) = (resp.status, resp.poll_url()) {
            let op = ArmOperation::new(self.clone(), op_url, options.clone(), format!("DELETE {}", url));
            await_completion(op, policy).await?;
        }
        Ok(())
    }

    /// POST an action and wait for its result body.
    pub async fn post_and_wait(
        &self,
        url: &str,
        body: Option<&Value>,
        policy: &PollPolicy,
        options: &RequestOptions,
    ) -> Result<Value, CloudError> {
        let resp = self
            .execute(Method::POST, url, body, options)
            .await?
            .into_result("POST", url)?;
        match (resp.status, resp.poll_url()) {
            (201 | 202, Some(op_url)) => {
                let op = ArmOperation::new(self.clone(), op_url, options.clone(), format!("POST {}", url));
                await_completion(op, policy).await
            }
            _ => Ok(resp.body),
        }
    }
}
