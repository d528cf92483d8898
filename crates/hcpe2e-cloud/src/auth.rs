use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use hcpe2e_config::HarnessConfig;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::CloudError;

/// Audience a token is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Management,
    Graph,
}

impl Scope {
    pub fn resource(&self) -> &'static str {
        match self {
            Scope::Management => "https://management.azure.com",
            Scope::Graph      => "https://graph.microsoft.com",
        }
    }

    pub fn default_scope(&self) -> String {
        format!("{}/.default", self.resource())
    }
}

// ── Token provider ────────────────────────────────────────────────────────────

/// Abstraction over Azure token acquisition. One provider is shared by every
/// client in the process, so tokens are cached once per scope.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, scope: Scope) -> Result<String, CloudError>;

    fn kind(&self) -> &'static str;
}

#[derive(Default)]
struct TokenCache {
    tokens: Mutex<HashMap<Scope, (String, Instant)>>,
}

impl TokenCache {
    async fn get(&self, scope: Scope) -> Option<String> {
        let guard = self.tokens.lock().await;
        guard
            .get(&scope)
            .filter(|(_, expiry)| Instant::now() < *expiry)
            .map(|(tok, _)| tok.clone())
    }

    async fn put(&self, scope: Scope, token: &str, expires_in: u64) {
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));
        self.tokens.lock().await.insert(scope, (token.to_string(), expiry));
    }
}

// ── Service Principal ─────────────────────────────────────────────────────────

pub struct ServicePrincipalTokenProvider {
    tenant_id:     String,
    client_id:     String,
    client_secret: String,
    login_base:    String,
    client:        reqwest::Client,
    cache:         TokenCache,
}

impl ServicePrincipalTokenProvider {
    pub fn new(
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        login_base: &str,
        client: reqwest::Client,
    ) -> Self {
        Self {
            tenant_id:     tenant_id.to_string(),
            client_id:     client_id.to_string(),
            client_secret: client_secret.to_string(),
            login_base:    login_base.trim_end_matches('/').to_string(),
            client,
            cache:         TokenCache::default(),
        }
    }
}

#[async_trait]
impl TokenProvider for ServicePrincipalTokenProvider {
    async fn token(&self, scope: Scope) -> Result<String, CloudError> {
        if let Some(tok) = self.cache.get(scope).await {
            return Ok(tok);
        }

        let url = format!("{}/{}/oauth2/v2.0/token", self.login_base, self.tenant_id);
        let scope_param = scope.default_scope();
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope_param.as_str()),
        ];
        let resp: Value = self
            .client
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| CloudError::Auth(format!("SP token request: {}", e)))?
            .json()
            .await
            .map_err(|e| CloudError::Auth(format!("SP token decode: {}", e)))?;

        let tok = resp["access_token"]
            .as_str()
            .ok_or_else(|| CloudError::Auth(format!("SP token: no access_token in response: {}", resp)))?
            .to_string();
        let expires_in = resp["expires_in"].as_u64().unwrap_or(3600);
        self.cache.put(scope, &tok, expires_in).await;
        debug!(?scope, "acquired service principal token");
        Ok(tok)
    }

    fn kind(&self) -> &'static str {
        "service-principal"
    }
}

// ── Managed Identity (IMDS) ───────────────────────────────────────────────────

pub struct ManagedIdentityTokenProvider {
    client_id: Option<String>,
    client:    reqwest::Client,
    cache:     TokenCache,
}

impl ManagedIdentityTokenProvider {
    pub fn new(client_id: Option<String>, client: reqwest::Client) -> Self {
        Self { client_id, client, cache: TokenCache::default() }
    }
}

#[async_trait]
impl TokenProvider for ManagedIdentityTokenProvider {
    async fn token(&self, scope: Scope) -> Result<String, CloudError> {
        if let Some(tok) = self.cache.get(scope).await {
            return Ok(tok);
        }

        let resource = format!("{}/", scope.resource());
        let mut query = vec![("api-version", "2018-02-01"), ("resource", resource.as_str())];
        if let Some(cid) = self.client_id.as_deref() {
            query.push(("client_id", cid));
        }
        let resp: Value = self
            .client
            .get("http://169.254.169.254/metadata/identity/oauth2/token")
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await
            .map_err(|e| CloudError::Auth(format!("IMDS token request: {}", e)))?
            .json()
            .await
            .map_err(|e| CloudError::Auth(format!("IMDS token decode: {}", e)))?;

        let tok = resp["access_token"]
            .as_str()
            .ok_or_else(|| CloudError::Auth(format!("IMDS token: no access_token: {}", resp)))?
            .to_string();
        let expires_in = resp["expires_in"]
            .as_str()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(3600);
        self.cache.put(scope, &tok, expires_in).await;
        Ok(tok)
    }

    fn kind(&self) -> &'static str {
        "managed-identity"
    }
}

// ── Azure CLI ─────────────────────────────────────────────────────────────────

pub struct AzureCliTokenProvider {
    tenant_id: Option<String>,
    cache:     TokenCache,
}

impl AzureCliTokenProvider {
    pub fn new(tenant_id: Option<String>) -> Self {
        Self { tenant_id, cache: TokenCache::default() }
    }
}

#[async_trait]
impl TokenProvider for AzureCliTokenProvider {
    async fn token(&self, scope: Scope) -> Result<String, CloudError> {
        if let Some(tok) = self.cache.get(scope).await {
            return Ok(tok);
        }

        let mut cmd = Command::new("az");
        cmd.args(["account", "get-access-token", "--resource", scope.resource(), "--output", "json"]);
        if let Some(tenant) = self.tenant_id.as_deref() {
            cmd.args(["--tenant", tenant]);
        }
        let output = cmd.output().await.map_err(|e| {
            CloudError::Auth(format!(
                "az CLI not found: {}. Install Azure CLI or configure service principal credentials.",
                e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CloudError::Auth(format!(
                "az account get-access-token failed: {}. Run 'az login' first.",
                stderr.trim()
            )));
        }

        let resp: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| CloudError::Auth(format!("az CLI output parse: {}", e)))?;
        let tok = resp["accessToken"]
            .as_str()
            .ok_or_else(|| CloudError::Auth("az CLI: no accessToken in output".into()))?
            .to_string();
        // CLI output carries an absolute expiry in local time; cache for a fixed 15m instead.
        self.cache.put(scope, &tok, 15 * 60).await;
        Ok(tok)
    }

    fn kind(&self) -> &'static str {
        "azure-cli"
    }
}

// ── Static (tests) ────────────────────────────────────────────────────────────

pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self, _scope: Scope) -> Result<String, CloudError> {
        Ok(self.0.clone())
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}

// ── Selection ─────────────────────────────────────────────────────────────────

/// Pick the token provider for this run:
/// 1. `LOCAL_DEVELOPMENT` set → Azure CLI
/// 2. tenant + client ID + secret → Service Principal
/// 3. `IDENTITY_ENDPOINT` env var → Managed Identity (IMDS)
/// 4. Otherwise → Azure CLI
pub fn select_provider(
    config: &HarnessConfig,
    login_base: &str,
    client: reqwest::Client,
) -> Arc<dyn TokenProvider> {
    let provider: Arc<dyn TokenProvider> = if config.local_development {
        Arc::new(AzureCliTokenProvider::new(config.tenant_id.clone()))
    } else if let (Some(tenant), Some(cid), Some(cs)) = (
        config.tenant_id.as_deref(),
        config.client_id.as_deref(),
        config.client_secret.as_deref(),
    ) {
        Arc::new(ServicePrincipalTokenProvider::new(tenant, cid, cs, login_base, client))
    } else if std::env::var("IDENTITY_ENDPOINT").is_ok() {
        Arc::new(ManagedIdentityTokenProvider::new(config.client_id.clone(), client))
    } else {
        Arc::new(AzureCliTokenProvider::new(config.tenant_id.clone()))
    };
    info!(provider = provider.kind(), "selected Azure credential");
    provider
}

// ── Token claims ──────────────────────────────────────────────────────────────

/// Decode the (unverified) claims section of a JWT.
pub fn decode_claims(token: &str) -> Result<Value, CloudError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| CloudError::decode("token claims", "token is not a JWT"))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| CloudError::decode("token claims", e))?;
    serde_json::from_slice(&bytes).map_err(|e| CloudError::decode("token claims", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{body_string_contains, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn jwt(claims: &Value) -> String {
        let enc = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!("{}.{}.sig", enc.encode(b"{\"alg\":\"none\"}"), enc.encode(claims.to_string()))
    }

    #[tokio::test]
    async fn service_principal_token_is_cached_per_scope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("management.azure.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "mgmt-token",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("graph.microsoft.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "graph-token",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let sp = ServicePrincipalTokenProvider::new(
            "tenant-1",
            "client",
            "secret",
            &server.uri(),
            reqwest::Client::new(),
        );
        assert_eq!(sp.token(Scope::Management).await.unwrap(), "mgmt-token");
        assert_eq!(sp.token(Scope::Management).await.unwrap(), "mgmt-token");
        assert_eq!(sp.token(Scope::Graph).await.unwrap(), "graph-token");
    }

    #[tokio::test]
    async fn service_principal_missing_token_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_client"
            })))
            .mount(&server)
            .await;
        let sp = ServicePrincipalTokenProvider::new("t", "c", "s", &server.uri(), reqwest::Client::new());
        let err = sp.token(Scope::Management).await.unwrap_err();
        assert!(matches!(err, CloudError::Auth(_)), "got: {}", err);
    }

    #[test]
    fn decode_claims_reads_payload() {
        let token = jwt(&serde_json::json!({"idtyp": "app", "oid": "1234"}));
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims["oid"], "1234");
    }

    #[test]
    fn decode_claims_rejects_non_jwt() {
        assert!(decode_claims("opaque").is_err());
    }

    #[test]
    fn local_development_selects_cli() {
        let config = HarnessConfig::from_lookup(|k| match k {
            "LOCAL_DEVELOPMENT" => Some("1".into()),
            "AZURE_TENANT_ID" => Some("t".into()),
            "AZURE_CLIENT_ID" => Some("c".into()),
            "AZURE_CLIENT_SECRET" => Some("s".into()),
            _ => None,
        })
        .unwrap();
        let provider = select_provider(&config, "http://login", reqwest::Client::new());
        assert_eq!(provider.kind(), "azure-cli");
    }

    #[test]
    fn credentials_select_service_principal() {
        let config = HarnessConfig::from_lookup(|k| match k {
            "AZURE_TENANT_ID" => Some("t".into()),
            "AZURE_CLIENT_ID" => Some("c".into()),
            "AZURE_CLIENT_SECRET" => Some("s".into()),
            _ => None,
        })
        .unwrap();
        let provider = select_provider(&config, "http://login", reqwest::Client::new());
        assert_eq!(provider.kind(), "service-principal");
    }
}
