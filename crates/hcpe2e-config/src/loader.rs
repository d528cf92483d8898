use std::path::Path;

use hcpe2e_domain::SetupModel;
use tracing::{debug, info};

use crate::error::ConfigError;

/// Read and validate the shared-cluster setup file.
///
/// The file is the JSON document written by the setup stage:
/// ```text
/// { "E2ESetup": {..}, "CustomerEnv": {..}, "Cluster": {..}, "Nodepools": [..] }
/// ```
pub fn load_setup_file(path: &Path) -> Result<SetupModel, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let model: SetupModel = serde_json::from_str(&content).map_err(|e| ConfigError::Json {
        path: path.display().to_string(),
        source: e,
    })?;
    model.validate().map_err(|e| ConfigError::Invalid {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    debug!(
        path = %path.display(),
        cluster = %model.cluster_name(),
        resource_group = %model.resource_group(),
        "loaded setup file"
    );
    Ok(model)
}

/// Write `model` as pretty JSON, creating parent directories.
pub fn write_setup_file(path: &Path, model: &SetupModel) -> Result<(), ConfigError> {
    let io_err = |e| ConfigError::Io { path: path.display().to_string(), source: e };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(model).map_err(|e| ConfigError::Json {
        path: path.display().to_string(),
        source: e,
    })?;
    std::fs::write(path, json).map_err(io_err)?;
    info!(path = %path.display(), "wrote setup file");
    Ok(())
}
