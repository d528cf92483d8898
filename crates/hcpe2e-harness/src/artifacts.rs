use std::path::{Path, PathBuf};

use hcpe2e_cloud::DeploymentsClient;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::HarnessError;
use crate::timing::{operations_from_arm, TimingRecorder};

/// Directory holding the debug artifacts of one resource group.
pub fn resource_group_dir(artifact_dir: &Path, resource_group: &str) -> PathBuf {
    artifact_dir.join("resourcegroups").join(resource_group)
}

/// Write every deployment in `resource_group` and its operations as YAML
/// under the artifact directory. Operations also land in `timing`.
pub async fn collect_resource_group(
    deployments: &DeploymentsClient,
    artifact_dir: &Path,
    resource_group: &str,
    timing: Option<&TimingRecorder>,
) -> Result<(), HarnessError> {
    let dir = resource_group_dir(artifact_dir, resource_group);
    info!(resource_group, "collecting deployments");
    let all = deployments
        .list_raw(resource_group)
        .await
        .map_err(|e| e.context(format!("failed to list deployments in {:?}", resource_group)))?;
    write_yaml(&dir.join("deployments.yaml"), &all).await?;

    for deployment in &all {
        let Some(name) = deployment["name"].as_str() else { continue };
        info!(resource_group, deployment = name, "collecting operations");
        let operations = deployments
            .list_operations(resource_group, name)
            .await
            .map_err(|e| e.context(format!("failed to list operations in {:?}", name)))?;
        write_yaml(&dir.join(format!("deployment-operations-{}.yaml", name)), &operations).await?;

        if let Some(recorder) = timing {
            match operations_from_arm(&operations) {
                Ok(ops) => recorder.record_deployment(resource_group, name, ops).await,
                Err(e) => warn!(resource_group, deployment = name, error = %e, "skipping deployment timing"),
            }
        }
    }
    Ok(())
}

/// Collect artifacts for all groups in parallel. Failures are returned, never raised.
pub async fn collect_debug_info(
    deployments: &DeploymentsClient,
    artifact_dir: &Path,
    resource_groups: &[String],
    timing: Option<TimingRecorder>,
) -> Vec<String> {
    info!("collecting debug info");
    let mut tasks = JoinSet::new();
    for rg in resource_groups {
        let deployments = deployments.clone();
        let artifact_dir = artifact_dir.to_path_buf();
        let rg = rg.clone();
        let timing = timing.clone();
        tasks.spawn(async move {
            let work = collect_resource_group(&deployments, &artifact_dir, &rg, timing.as_ref());
            let result = match &timing {
                Some(recorder) => recorder.step(format!("Collect debug info for resource group {}", rg), work).await,
                None => work.await,
            };
            (rg, result)
        });
    }

    let mut errors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((rg, Err(e))) => {
                warn!(resource_group = %rg, error = %e, "failed to collect debug info");
                errors.push(format!("{}: {}", rg, e));
            }
            Err(e) => errors.push(format!("debug info task failed: {}", e)),
        }
    }
    info!(failed = errors.len(), "finished collecting debug info");
    errors
}

async fn write_yaml(path: &Path, items: &[Value]) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| HarnessError::io(parent, e))?;
    }
    let encoded = serde_yaml::to_string(items)?;
    tokio::fs::write(path, encoded).await.map_err(|e| HarnessError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcpe2e_cloud::{ArmClient, BaseUrls};
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const DEPLOYMENTS: &str = "/subscriptions/sub/resourcegroups/rg-1/providers/Microsoft.Resources/deployments";

    #[tokio::test]
    async fn writes_deployments_and_operations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEPLOYMENTS))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [
                {"name": "infra", "properties": {"provisioningState": "Succeeded"}}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/infra/operations", DEPLOYMENTS)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [
                {"properties": {
                    "provisioningOperation": "Create",
                    "timestamp": "2025-11-05T13:16:20Z",
                    "duration": "PT12S",
                    "targetResource": {"id": "/subscriptions/sub/resourceGroups/rg-1/providers/Microsoft.Network/virtualNetworks/customer-vnet"}
                }}
            ]})))
            .mount(&server)
            .await;

        let arm = ArmClient::with_static_token("t", BaseUrls::single(&server.uri()));
        let deployments = DeploymentsClient::new(arm, "sub");
        let dir = tempfile::tempdir().unwrap();
        let recorder = TimingRecorder::start(vec!["t".into()]);

        let errors = collect_debug_info(&deployments, dir.path(), &["rg-1".to_string()], Some(recorder.clone())).await;
        assert!(errors.is_empty(), "got: {:?}", errors);

        let rg_dir = resource_group_dir(dir.path(), "rg-1");
        let listed = std::fs::read_to_string(rg_dir.join("deployments.yaml")).unwrap();
        assert!(listed.contains("infra"));
        let ops = std::fs::read_to_string(rg_dir.join("deployment-operations-infra.yaml")).unwrap();
        assert!(ops.contains("customer-vnet"));

        let timing = recorder.snapshot().await;
        assert_eq!(timing.deployments["rg-1"]["infra"][0].duration, "PT12S");
        assert_eq!(timing.steps[0].name, "Collect debug info for resource group rg-1");
    }

    #[tokio::test]
    async fn failures_are_reported_per_group() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": {"code": "InternalServerError", "message": "boom"}
            })))
            .mount(&server)
            .await;
        let arm = ArmClient::with_static_token("t", BaseUrls::single(&server.uri()));
        let dir = tempfile::tempdir().unwrap();
        let errors = collect_debug_info(&DeploymentsClient::new(arm, "sub"), dir.path(), &["rg-1".into()], None).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("rg-1: "), "got: {:?}", errors);
    }
}
