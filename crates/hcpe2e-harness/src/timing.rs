use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::HarnessError;

/// Timing of one test, written once the test finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecTimingMetadata {
    pub identifier:  Vec<String>,
    pub started_at:  String,
    pub finished_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps:       Vec<StepTiming>,
    /// resource group → deployment → operations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployments: BTreeMap<String, BTreeMap<String, Vec<Operation>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTiming {
    pub name:        String,
    pub started_at:  String,
    pub finished_at: String,
}

/// One ARM deployment operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub operation_type:  String,
    pub start_timestamp: String,
    /// ISO 8601 duration as reported by ARM, e.g. `PT3M12.98S`.
    pub duration:        String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource:        Option<OperationResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResource {
    pub resource_type:  String,
    pub resource_group: String,
    pub name:           String,
}

/// Split an ARM resource ID into (resource group, type, name).
///
/// `/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/v/subnets/a`
/// gives `("rg", "Microsoft.Network/virtualNetworks/subnets", "a")`.
pub fn parse_resource_id(id: &str) -> Option<OperationResource> {
    let segments: Vec<&str> = id.trim_matches('/').split('/').collect();
    let rg_at = segments.iter().position(|s| s.eq_ignore_ascii_case("resourceGroups"))?;
    let resource_group = segments.get(rg_at + 1)?.to_string();
    let providers_at = segments.iter().rposition(|s| s.eq_ignore_ascii_case("providers"))?;
    let rest = segments.get(providers_at + 1..)?;
    let (namespace, pairs) = rest.split_first()?;
    if pairs.is_empty() || pairs.len() % 2 != 0 {
        return None;
    }
    let mut resource_type = namespace.to_string();
    for pair in pairs.chunks(2) {
        resource_type.push('/');
        resource_type.push_str(pair[0]);
    }
    Some(OperationResource { resource_type, resource_group, name: pairs[pairs.len() - 1].to_string() })
}

/// Convert raw deployment operations from ARM. Items without properties are skipped.
pub fn operations_from_arm(items: &[Value]) -> Result<Vec<Operation>, HarnessError> {
    let mut operations = Vec::new();
    for item in items {
        let Some(props) = item.get("properties") else { continue };
        let resource = match props["targetResource"]["id"].as_str() {
            Some(id) => Some(parse_resource_id(id).ok_or_else(|| {
                HarnessError::Internal(format!("failed to parse resource id: {}", id))
            })?),
            None => None,
        };
        operations.push(Operation {
            operation_type:  props["provisioningOperation"].as_str().unwrap_or_default().to_string(),
            start_timestamp: props["timestamp"].as_str().unwrap_or_default().to_string(),
            duration:        props["duration"].as_str().unwrap_or_default().to_string(),
            resource,
        });
    }
    Ok(operations)
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// File name for a test's timing data, keyed by the YAML of its identifier.
pub fn timing_file_name(identifier: &[String]) -> Result<String, HarnessError> {
    let encoded = serde_yaml::to_string(identifier)?;
    let digest = Sha256::digest(encoded.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!("timing-metadata-{}.yaml", hex))
}

// ── Recorder ──────────────────────────────────────────────────────────────────

/// Collects step and deployment timings for one test. Clones share state.
#[derive(Debug, Clone)]
pub struct TimingRecorder {
    inner: Arc<Mutex<SpecTimingMetadata>>,
}

impl TimingRecorder {
    pub fn start(identifier: Vec<String>) -> Self {
        let metadata = SpecTimingMetadata { identifier, started_at: now(), ..Default::default() };
        Self { inner: Arc::new(Mutex::new(metadata)) }
    }

    /// Run `fut` as a named step and record how long it took.
    pub async fn step<F, T>(&self, name: impl Into<String>, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let name = name.into();
        let started_at = now();
        let out = fut.await;
        self.inner.lock().await.steps.push(StepTiming { name, started_at, finished_at: now() });
        out
    }

    pub async fn record_deployment(&self, resource_group: &str, deployment: &str, operations: Vec<Operation>) {
        self.inner
            .lock()
            .await
            .deployments
            .entry(resource_group.to_string())
            .or_default()
            .insert(deployment.to_string(), operations);
    }

    pub async fn snapshot(&self) -> SpecTimingMetadata {
        self.inner.lock().await.clone()
    }

    /// Stamp the finish time and write the file to every directory given.
    /// Returns the paths written; a directory that fails is logged and skipped.
    pub async fn commit(&self, dirs: &[PathBuf]) -> Result<Vec<PathBuf>, HarnessError> {
        let metadata = {
            let mut guard = self.inner.lock().await;
            guard.finished_at = now();
            guard.clone()
        };
        let encoded = serde_yaml::to_string(&metadata)?;
        let file_name = timing_file_name(&metadata.identifier)?;

        let mut written = Vec::new();
        for dir in dirs {
            let output = dir.join(&file_name);
            match write_file(dir, &output, &encoded).await {
                Ok(()) => {
                    info!(path = %output.display(), "wrote timing metadata");
                    written.push(output);
                }
                Err(e) => warn!(path = %output.display(), error = %e, "failed to write timing metadata"),
            }
        }
        Ok(written)
    }
}

async fn write_file(dir: &Path, output: &Path, contents: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(output, contents).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nested_resource_ids() {
        let r = parse_resource_id(
            "/subscriptions/s/resourceGroups/rg-1/providers/Microsoft.Network/virtualNetworks/vnet/subnets/default",
        )
        .unwrap();
        assert_eq!(r.resource_group, "rg-1");
        assert_eq!(r.resource_type, "Microsoft.Network/virtualNetworks/subnets");
        assert_eq!(r.name, "default");
        assert!(parse_resource_id("/subscriptions/s").is_none());
    }

    #[test]
    fn converts_arm_operations() {
        let items = vec![
            json!({"properties": {
                "provisioningOperation": "Create",
                "timestamp": "2025-11-05T13:16:20Z",
                "duration": "PT3M12.9S",
                "targetResource": {"id": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.KeyVault/vaults/kv"}
            }}),
            json!({"properties": {
                "provisioningOperation": "EvaluateDeploymentOutput",
                "timestamp": "2025-11-05T13:20:00Z",
                "duration": "PT1S"
            }}),
            json!({"id": "no-properties"}),
        ];
        let ops = operations_from_arm(&items).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].resource.as_ref().unwrap().resource_type, "Microsoft.KeyVault/vaults");
        assert!(ops[1].resource.is_none());
    }

    #[test]
    fn file_name_depends_only_on_identifier() {
        let a = timing_file_name(&["suite".into(), "test a".into()]).unwrap();
        let b = timing_file_name(&["suite".into(), "test a".into()]).unwrap();
        let c = timing_file_name(&["suite".into(), "test b".into()]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("timing-metadata-") && a.ends_with(".yaml"));
        assert_eq!(a.len(), "timing-metadata-".len() + 64 + ".yaml".len());
    }

    #[tokio::test]
    async fn commit_writes_to_every_directory() {
        let shared = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let recorder = TimingRecorder::start(vec!["e2e".into(), "delete resource group".into()]);
        let value = recorder.step("Clean up resource group rg-1", async { 7 }).await;
        assert_eq!(value, 7);
        recorder.record_deployment("rg-1", "infra", vec![]).await;

        let dirs = vec![shared.path().to_path_buf(), artifacts.path().join("test-timing")];
        let written = recorder.commit(&dirs).await.unwrap();
        assert_eq!(written.len(), 2);

        let decoded: SpecTimingMetadata =
            serde_yaml::from_str(&std::fs::read_to_string(&written[1]).unwrap()).unwrap();
        assert_eq!(decoded.steps.len(), 1);
        assert_eq!(decoded.steps[0].name, "Clean up resource group rg-1");
        assert!(decoded.deployments["rg-1"].contains_key("infra"));
        assert!(!decoded.finished_at.is_empty());
    }
}
