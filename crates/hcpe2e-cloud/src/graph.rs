use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::arm::{ArmClient, RequestOptions};
use crate::error::CloudError;

/// An app registration in Microsoft Graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Object ID, used for updates and deletion.
    pub id:           String,
    pub app_id:       String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordCredential {
    pub key_id:          String,
    #[serde(default)]
    pub secret_text:     Option<String>,
    #[serde(default)]
    pub start_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date_time:   Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePrincipal {
    pub id:     String,
    pub app_id: String,
}

/// Microsoft Graph v1.0 app registrations and service principals.
#[derive(Clone)]
pub struct GraphClient {
    arm: ArmClient,
}

impl GraphClient {
    pub fn new(arm: ArmClient) -> Self {
        Self { arm }
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, CloudError> {
        let url = self.arm.graph_url(path);
        let resp = self
            .arm
            .execute(method.clone(), &url, body, &RequestOptions::graph())
            .await?
            .into_result(method.as_str(), &url)?;
        Ok(resp.body)
    }

    pub async fn create_application(&self, display_name: &str) -> Result<Application, CloudError> {
        let body = json!({ "displayName": display_name, "signInAudience": "AzureADMyOrg" });
        let created = self.send(Method::POST, "/applications", Some(&body)).await?;
        let app: Application = serde_json::from_value(created).map_err(|e| CloudError::decode("application", e))?;
        info!(app_id = %app.app_id, display_name, "created app registration");
        Ok(app)
    }

    /// Add a client secret valid for `[start, end)`.
    pub async fn add_password(
        &self,
        object_id: &str,
        display_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<PasswordCredential, CloudError> {
        let body = json!({
            "passwordCredential": {
                "displayName":   display_name,
                "startDateTime": start.to_rfc3339(),
                "endDateTime":   end.to_rfc3339(),
            }
        });
        let created = self
            .send(Method::POST, &format!("/applications/{}/addPassword", object_id), Some(&body))
            .await?;
        serde_json::from_value(created).map_err(|e| CloudError::decode("passwordCredential", e))
    }

    pub async fn create_service_principal(&self, app_id: &str) -> Result<ServicePrincipal, CloudError> {
        let body = json!({ "appId": app_id });
        let created = self.send(Method::POST, "/servicePrincipals", Some(&body)).await?;
        serde_json::from_value(created).map_err(|e| CloudError::decode("servicePrincipal", e))
    }

    /// Delete an app registration; one that is already gone is success.
    pub async fn delete_application(&self, object_id: &str) -> Result<(), CloudError> {
        match self.send(Method::DELETE, &format!("/applications/{}", object_id), None).await {
            Ok(_) => {
                info!(object_id, "deleted app registration");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(object_id, "app registration already deleted");
                Ok(())
            }
            Err(e) => Err(e.context(format!("failed deleting app registration {}", object_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::tests::client;
    use chrono::Duration;
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[tokio::test]
    async fn create_application_and_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/applications"))
            .and(body_partial_json(json!({"displayName": "e2e-app"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "obj-1", "appId": "app-1", "displayName": "e2e-app"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/applications/obj-1/addPassword"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keyId": "k-1", "secretText": "s3cret"
            })))
            .mount(&server)
            .await;

        let graph = GraphClient::new(client(&server));
        let app = graph.create_application("e2e-app").await.unwrap();
        assert_eq!(app.app_id, "app-1");
        let now = Utc::now();
        let secret = graph.add_password(&app.id, "e2e", now, now + Duration::hours(2)).await.unwrap();
        assert_eq!(secret.secret_text.as_deref(), Some("s3cret"));
    }

    #[tokio::test]
    async fn delete_missing_application_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1.0/applications/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": "Request_ResourceNotFound", "message": "does not exist"}
            })))
            .expect(2)
            .mount(&server)
            .await;
        let graph = GraphClient::new(client(&server));
        graph.delete_application("gone").await.unwrap();
        graph.delete_application("gone").await.unwrap();
    }
}
