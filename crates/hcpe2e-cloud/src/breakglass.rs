use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::CloudError;
use crate::wait::{await_completion, Operation, PollPolicy, PollStatus};

pub const PRINCIPAL_NAME_HEADER: &str = "X-Ms-Client-Principal-Name";
pub const PRINCIPAL_TYPE_HEADER: &str = "X-Ms-Client-Principal-Type";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_READY_TIMEOUT: Duration = Duration::from_secs(60);
const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalType {
    DstsUser,
    AadServicePrincipal,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::DstsUser            => "dstsUser",
            PrincipalType::AadServicePrincipal => "aadServicePrincipal",
        }
    }
}

/// Caller identity the admin API expects in request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub kind: PrincipalType,
}

impl Principal {
    /// Derive the principal from bearer-token claims: users by `upn`,
    /// applications by `oid`.
    pub fn from_claims(claims: &Value) -> Result<Self, CloudError> {
        let invalid = |msg: String| CloudError::decode("token claims", msg);
        let id_type = claims["idtyp"]
            .as_str()
            .ok_or_else(|| invalid("idtyp claim missing or not a string in token".into()))?;
        match id_type {
            "user" => {
                let upn = claims["upn"]
                    .as_str()
                    .ok_or_else(|| invalid("upn claim missing or not a string for user identity".into()))?;
                Ok(Principal { name: upn.to_string(), kind: PrincipalType::DstsUser })
            }
            "app" => {
                let oid = claims["oid"]
                    .as_str()
                    .ok_or_else(|| invalid("oid claim missing or not a string for app identity".into()))?;
                Ok(Principal { name: oid.to_string(), kind: PrincipalType::AadServicePrincipal })
            }
            other => Err(invalid(format!("unknown identity type {:?} in token claims", other))),
        }
    }
}

/// A ready breakglass session.
#[derive(Debug, Clone)]
pub struct BreakglassCredential {
    pub kubeconfig: String,
    pub expires_at: DateTime<Utc>,
}

/// Client for the admin API breakglass endpoints.
#[derive(Clone)]
pub struct BreakglassClient {
    http:      reqwest::Client,
    admin_url: String,
    principal: Principal,
    policy:    PollPolicy,
}

impl BreakglassClient {
    /// `insecure` skips TLS verification, for self-signed development endpoints.
    pub fn new(admin_url: &str, principal: Principal, insecure: bool) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| CloudError::InvalidRequest(format!("building admin API client: {}", e)))?;
        Ok(Self {
            http,
            admin_url: admin_url.trim_end_matches('/').to_string(),
            principal,
            policy: PollPolicy::new(SESSION_POLL_INTERVAL, SESSION_READY_TIMEOUT),
        })
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The same client, acting on behalf of another principal.
    pub fn for_principal(&self, principal: Principal) -> Self {
        Self { principal, ..self.clone() }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header(PRINCIPAL_NAME_HEADER, self.principal.name.as_str())
            .header(PRINCIPAL_TYPE_HEADER, self.principal.kind.as_str())
    }

    /// Open a session for `group` on the cluster and wait for its kubeconfig.
    pub async fn create_credentials(
        &self,
        cluster_id: &str,
        group: &str,
        ttl: Duration,
    ) -> Result<BreakglassCredential, CloudError> {
        let endpoint = format!("{}/admin/v1/hcp{}/breakglass", self.admin_url, cluster_id);
        info!(cluster_id, group, "creating breakglass session");
        let location = self
            .start_session(&endpoint, group, ttl)
            .await
            .map_err(|e| e.context("failed to create SRE breakglass session"))?;

        let op = SessionOperation {
            client: self.clone(),
            url:    format!("{}{}", self.admin_url, location),
        };
        await_completion(op, &self.policy)
            .await
            .map_err(|e| e.context(format!("failed to get ready session kubeconfig from {}", location)))
    }

    async fn start_session(&self, endpoint: &str, group: &str, ttl: Duration) -> Result<String, CloudError> {
        let body = json!({ "group": group, "ttl": format_go_duration(ttl) });
        let resp = self
            .request(reqwest::Method::POST, endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport("POST", endpoint, e))?;
        let status = resp.status().as_u16();
        let location = resp
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if status != 202 {
            let text = resp.text().await.map_err(|e| transport("POST", endpoint, e))?;
            return Err(status_error("POST", endpoint, status, text));
        }
        location.ok_or_else(|| CloudError::InvalidRequest("no Location header in response".into()))
    }
}

fn transport(method: &str, url: &str, source: reqwest::Error) -> CloudError {
    CloudError::Transport { method: method.to_string(), url: url.to_string(), source }
}

/// Non-success admin API response; the body is JSON when the API sends an error object.
fn status_error(method: &str, url: &str, status: u16, text: String) -> CloudError {
    let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
    CloudError::api(method, url, status, &body, None)
}

struct SessionOperation {
    client: BreakglassClient,
    url:    String,
}

#[async_trait]
impl Operation for SessionOperation {
    type Output = BreakglassCredential;

    fn describe(&self) -> String {
        format!("breakglass session {}", self.url)
    }

    async fn poll(&mut self) -> Result<PollStatus<BreakglassCredential>, CloudError> {
        let resp = self
            .client
            .request(reqwest::Method::GET, &self.url)
            .send()
            .await
            .map_err(|e| transport("GET", &self.url, e))?;
        let status = resp.status().as_u16();
        let expires = resp
            .headers()
            .get("Expires")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.map_err(|e| transport("GET", &self.url, e))?;

        match status {
            202 => {
                debug!(url = %self.url, "breakglass session not ready");
                Ok(PollStatus::Pending(body.trim().to_string()))
            }
            200 => {
                let expires = expires.unwrap_or_default();
                let expires_at = DateTime::parse_from_rfc3339(&expires)
                    .map_err(|e| CloudError::decode("expiration header", e))?
                    .with_timezone(&Utc);
                Ok(PollStatus::Succeeded(BreakglassCredential { kubeconfig: body, expires_at }))
            }
            other => Err(status_error("GET", &self.url, other, body)),
        }
    }
}

/// Render a duration the way the admin API parses it, e.g. `1h0m0s`.
pub fn format_go_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}
