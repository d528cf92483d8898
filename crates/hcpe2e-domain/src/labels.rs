use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ── Label ─────────────────────────────────────────────────────────────────────

/// Static classification attached to a test case at definition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Label {
    // environment requirement
    RequireNothing,
    RequireHappyPath,
    RequireHappyPathInfra,

    // severity
    Critical,
    High,
    Medium,
    Low,

    // polarity
    Positive,
    Negative,

    // scope
    AroRpApiCompatible,
    IntegrationOnly,
    DevelopmentOnly,

    // informational
    CoreInfraService,
    CreateCluster,
    ExternalEntra,
    Slow,
}

impl Label {
    pub const ALL: [Label; 16] = [
        Label::RequireNothing,
        Label::RequireHappyPath,
        Label::RequireHappyPathInfra,
        Label::Critical,
        Label::High,
        Label::Medium,
        Label::Low,
        Label::Positive,
        Label::Negative,
        Label::AroRpApiCompatible,
        Label::IntegrationOnly,
        Label::DevelopmentOnly,
        Label::CoreInfraService,
        Label::CreateCluster,
        Label::ExternalEntra,
        Label::Slow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::RequireNothing        => "RequireNothing",
            Label::RequireHappyPath      => "RequireHappyPath",
            Label::RequireHappyPathInfra => "RequireHappyPathInfra",
            Label::Critical              => "Critical",
            Label::High                  => "High",
            Label::Medium                => "Medium",
            Label::Low                   => "Low",
            Label::Positive              => "Positive",
            Label::Negative              => "Negative",
            Label::AroRpApiCompatible    => "AroRpApiCompatible",
            Label::IntegrationOnly       => "IntegrationOnly",
            Label::DevelopmentOnly       => "DevelopmentOnly",
            Label::CoreInfraService      => "CoreInfraService",
            Label::CreateCluster         => "CreateCluster",
            Label::ExternalEntra         => "ExternalEntra",
            Label::Slow                  => "Slow",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = DomainError;

    /// Label names match case-insensitively; anything outside the vocabulary is an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Label::ALL
            .iter()
            .copied()
            .find(|l| l.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| DomainError::UnknownLabel(wanted.to_string()))
    }
}

// ── LabelSet ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSet(BTreeSet<Label>);

impl LabelSet {
    pub fn new(labels: impl IntoIterator<Item = Label>) -> Self {
        LabelSet(labels.into_iter().collect())
    }

    pub fn contains(&self, label: Label) -> bool {
        self.0.contains(&label)
    }

    pub fn iter(&self) -> impl Iterator<Item = Label> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The test creates everything it needs inside its own body.
    pub fn is_self_provisioning(&self) -> bool {
        self.contains(Label::RequireNothing)
    }

    /// The test runs against the pre-provisioned shared cluster.
    pub fn requires_shared_cluster(&self) -> bool {
        self.contains(Label::RequireHappyPath) || self.contains(Label::RequireHappyPathInfra)
    }
}

impl FromIterator<Label> for LabelSet {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        LabelSet::new(iter)
    }
}

impl std::fmt::Display for LabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Label::as_str).collect();
        write!(f, "{}", names.join(","))
    }
}
