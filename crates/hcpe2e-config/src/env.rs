use std::path::PathBuf;

use hcpe2e_domain::Environment;
use tracing::debug;

use crate::error::ConfigError;

const DEFAULT_SUBSCRIPTION: &str = "FallbackSubscription";
const DEFAULT_LOCATION: &str = "uksouth";
const DEFAULT_FRONTEND_ADDRESS: &str = "http://localhost:8443";
const DEFAULT_PULL_SECRET_PATH: &str = "/var/run/aro-hcp-qe-pull-secret";
const DEFAULT_FALLBACK_TEMPLATE: &str = "demo";

/// Run-wide settings read once from the process environment.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    /// Display name of the subscription tests run in (`CUSTOMER_SUBSCRIPTION`).
    pub subscription_name: String,
    pub tenant_id:         Option<String>,
    pub client_id:         Option<String>,
    pub client_secret:     Option<String>,
    pub location:          String,
    pub environment:       Environment,
    /// `LOCAL_DEVELOPMENT` set: authenticate with the az CLI.
    pub local_development: bool,
    /// Resource-provider endpoint used in the development environment.
    pub frontend_address:  String,
    pub admin_api_address: Option<String>,
    pub artifact_dir:      Option<PathBuf>,
    pub shared_dir:        Option<PathBuf>,
    pub setup_file:        Option<PathBuf>,
    /// Template name to deploy when no setup file can be loaded.
    pub fallback_template: Option<String>,
    pub skip_cleanup:      bool,
    pub pull_secret_path:  PathBuf,
}

impl HarnessConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = match lookup("AROHCP_ENV") {
            Some(raw) => raw.parse::<Environment>().map_err(|e| ConfigError::InvalidEnv {
                var:     "AROHCP_ENV",
                value:   raw.clone(),
                message: e.to_string(),
            })?,
            None => Environment::Development,
        };

        let skip_cleanup = match lookup("ARO_E2E_SKIP_CLEANUP") {
            Some(raw) => parse_bool("ARO_E2E_SKIP_CLEANUP", &raw)?,
            None => false,
        };

        let fallback_template = lookup("FALLBACK_TO_BICEP").map(|v| {
            let v = v.trim().to_string();
            if v.is_empty() { DEFAULT_FALLBACK_TEMPLATE.to_string() } else { v }
        });

        let config = Self {
            subscription_name: non_empty("CUSTOMER_SUBSCRIPTION")
                .unwrap_or_else(|| DEFAULT_SUBSCRIPTION.to_string()),
            tenant_id:         non_empty("AZURE_TENANT_ID"),
            client_id:         non_empty("AZURE_CLIENT_ID"),
            client_secret:     non_empty("AZURE_CLIENT_SECRET"),
            location:          non_empty("LOCATION").unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            environment,
            local_development: lookup("LOCAL_DEVELOPMENT").is_some(),
            frontend_address:  non_empty("FRONTEND_ADDRESS")
                .unwrap_or_else(|| DEFAULT_FRONTEND_ADDRESS.to_string()),
            admin_api_address: non_empty("ADMIN_API_ADDRESS"),
            artifact_dir:      non_empty("ARTIFACT_DIR").map(PathBuf::from),
            shared_dir:        non_empty("SHARED_DIR").map(PathBuf::from),
            setup_file:        non_empty("SETUP_FILEPATH").map(PathBuf::from),
            fallback_template,
            skip_cleanup,
            pull_secret_path:  non_empty("ARO_HCP_QE_PULL_SECRET_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PULL_SECRET_PATH)),
        };
        debug!(
            environment = %config.environment,
            location = %config.location,
            subscription = %config.subscription_name,
            "harness configuration loaded"
        );
        Ok(config)
    }

    /// Resource-provider calls bypass ARM and go to the local frontend.
    pub fn uses_local_frontend(&self) -> bool {
        self.environment.is_development()
    }

    pub fn tenant_id(&self) -> Result<&str, ConfigError> {
        self.tenant_id.as_deref().ok_or(ConfigError::MissingEnv("AZURE_TENANT_ID"))
    }

    pub fn admin_api_address(&self) -> Result<&str, ConfigError> {
        self.admin_api_address
            .as_deref()
            .ok_or(ConfigError::MissingEnv("ADMIN_API_ADDRESS"))
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" => Ok(true),
        "" | "0" | "f" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value:   raw.to_string(),
            message: "expected a boolean".into(),
        }),
    }
}
