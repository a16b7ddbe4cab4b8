//! Risk levels and finding classifiers

use serde::{Deserialize, Serialize};

/// Risk level attached to a finding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    /// Informational, no direct exposure
    #[default]
    Info,
    /// Worth reviewing
    Medium,
    /// Significant exposure
    High,
    /// Immediate action required
    Critical,
}

impl RiskLevel {
    /// Get numeric value for sorting/comparison
    pub fn as_number(&self) -> u8 {
        match self {
            RiskLevel::Info => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
            RiskLevel::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Info => "INFO",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classifier for the condition a finding describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingType {
    /// An open port running a risky service
    ExposedService,
    /// Credential-like tokens seen in a cleartext payload
    CredentialLeak,
    /// Unencrypted HTTP traffic
    HttpTraffic,
    /// Unusual volume of external destinations in one batch
    NetworkActivity,
}

impl FindingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingType::ExposedService => "EXPOSED_SERVICE",
            FindingType::CredentialLeak => "CREDENTIAL_LEAK",
            FindingType::HttpTraffic => "HTTP_TRAFFIC",
            FindingType::NetworkActivity => "NETWORK_ACTIVITY",
        }
    }
}

impl std::fmt::Display for FindingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
