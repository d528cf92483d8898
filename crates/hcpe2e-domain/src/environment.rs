use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::labels::{Label, LabelSet};

/// Deployment environment a run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Integration,
    Staging,
    Production,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }

    /// Decide whether a test with `labels` may run here.
    ///
    /// `local_frontend` is true when resource-provider calls go straight to a
    /// locally running frontend instead of through ARM; only tests that talk
    /// exclusively through the public API are eligible then.
    pub fn admits(&self, labels: &LabelSet, local_frontend: bool) -> Result<(), String> {
        if labels.contains(Label::IntegrationOnly) && *self != Environment::Integration {
            return Err(format!("IntegrationOnly test skipped in {} environment", self));
        }
        if labels.contains(Label::DevelopmentOnly) && *self != Environment::Development {
            return Err(format!("DevelopmentOnly test skipped in {} environment", self));
        }
        if local_frontend && !labels.contains(Label::AroRpApiCompatible) {
            return Err("test is not AroRpApiCompatible and cannot run against a local frontend".into());
        }
        Ok(())
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Integration => write!(f, "int"),
            Environment::Staging     => write!(f, "stg"),
            Environment::Production  => write!(f, "prod"),
        }
    }
}

impl FromStr for Environment {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "dev" | "development" => Ok(Environment::Development),
            "int" | "integration"      => Ok(Environment::Integration),
            "stg" | "stage" | "staging" => Ok(Environment::Staging),
            "prod" | "production"      => Ok(Environment::Production),
            other => Err(DomainError::UnknownEnvironment(other.to_string())),
        }
    }
}
