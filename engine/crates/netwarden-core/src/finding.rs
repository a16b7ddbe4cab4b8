//! Finding definitions - conclusions produced by the rule engine

use crate::model::PacketInfo;
use crate::risk::{FindingType, RiskLevel};
use serde::{Deserialize, Serialize};

/// One security-relevant conclusion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFinding {
    /// Port the finding concerns, 0 if not port-specific
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub risk: RiskLevel,
    /// Stable human text for the underlying condition
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Suggested remediation
    #[serde(default)]
    pub action: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FindingType>,
    /// Address the finding is about, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl SecurityFinding {
    /// Create a new finding builder
    pub fn builder(risk: RiskLevel, summary: impl Into<String>) -> FindingBuilder {
        FindingBuilder::new(risk, summary)
    }

    /// Structured dedup key
    pub fn key(&self) -> FindingKey {
        FindingKey {
            kind: self.kind,
            port: self.port,
            subject: self.subject.clone(),
        }
    }
}

/// Builder for constructing findings
pub struct FindingBuilder {
    finding: SecurityFinding,
}

impl FindingBuilder {
    pub fn new(risk: RiskLevel, summary: impl Into<String>) -> Self {
        Self {
            finding: SecurityFinding {
                port: 0,
                risk,
                summary: summary.into(),
                detail: None,
                action: String::new(),
                kind: None,
                subject: None,
            },
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.finding.port = port;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.finding.detail = Some(detail.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.finding.action = action.into();
        self
    }

    pub fn kind(mut self, kind: FindingType) -> Self {
        self.finding.kind = Some(kind);
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.finding.subject = Some(subject.into());
        self
    }

    pub fn build(self) -> SecurityFinding {
        self.finding
    }
}

/// Dedup key `(type, port, subject)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FindingKey {
    pub kind: Option<FindingType>,
    pub port: u16,
    pub subject: Option<String>,
}

/// Output of one analysis call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// New findings for this call only, in rule evaluation order
    #[serde(default)]
    pub findings: Vec<SecurityFinding>,
    /// Input packets with `location` resolved, one-to-one and in input order
    #[serde(default)]
    pub enriched_packets: Vec<PacketInfo>,
}

impl AnalysisResult {
    /// Highest risk among the findings
    pub fn max_risk(&self) -> Option<RiskLevel> {
        self.findings.iter().map(|f| f.risk).max()
    }

    pub fn count_by_risk(&self, risk: RiskLevel) -> usize {
        self.findings.iter().filter(|f| f.risk == risk).count()
    }
}
