//! Session state: the rolling packet buffer and the finding history

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use netwarden_core::model::UNRESOLVED_LOCATION;
use netwarden_core::{Error, FindingKey, PacketInfo, PacketKey, SecurityFinding};

/// Which findings count as duplicates of one another
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Same `(type, port, subject)`
    #[default]
    Structured,
    /// Exactly equal summary text
    Summary,
}

impl FromStr for DedupPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "structured" => Ok(DedupPolicy::Structured),
            "summary" => Ok(DedupPolicy::Summary),
            other => Err(Error::InvalidConfig {
                key: "analysis.dedup".into(),
                message: format!("unknown dedup policy '{}'", other),
            }),
        }
    }
}

// ── Packet Buffer ────────────────────────────────────────────────────────────

/// Bounded buffer of the most recent packets, oldest evicted first
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    packets: VecDeque<PacketInfo>,
    capacity: usize,
}

impl PacketBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, packet: PacketInfo) {
        if self.packets.len() == self.capacity {
            self.packets.pop_front();
        }
        self.packets.push_back(packet);
    }

    /// The `n` newest packets, oldest first
    pub fn recent(&self, n: usize) -> Vec<PacketInfo> {
        let skip = self.packets.len().saturating_sub(n);
        self.packets.iter().skip(skip).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<PacketInfo> {
        self.packets.iter().cloned().collect()
    }

    /// Copy resolved locations back onto buffered packets by `PacketKey`.
    ///
    /// Location is set once; packets already enriched keep their tag.
    /// Packets evicted since the batch was taken are skipped. Returns the
    /// number of packets updated.
    pub fn merge_enriched(&mut self, enriched: &[PacketInfo]) -> usize {
        let locations: HashMap<PacketKey, &str> = enriched
            .iter()
            .filter(|p| p.is_enriched())
            .map(|p| (p.key(), p.location.as_str()))
            .collect();
        if locations.is_empty() {
            return 0;
        }

        let mut updated = 0;
        for packet in self
            .packets
            .iter_mut()
            .filter(|p| p.location.is_empty() || p.location == UNRESOLVED_LOCATION)
        {
            if let Some(location) = locations.get(&packet.key()) {
                packet.location = location.to_string();
                updated += 1;
            }
        }
        updated
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ── Finding Log ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    Structured(FindingKey),
    Summary(String),
}

/// Append-only, deduplicated finding history for one session
#[derive(Debug, Clone, Default)]
pub struct FindingLog {
    policy: DedupPolicy,
    findings: Vec<SecurityFinding>,
    index: HashSet<DedupKey>,
}

impl FindingLog {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    /// Append the findings not seen before; returns those that were new
    pub fn merge(
        &mut self,
        findings: impl IntoIterator<Item = SecurityFinding>,
    ) -> Vec<SecurityFinding> {
        let mut added = Vec::new();
        for finding in findings {
            let key = match self.policy {
                DedupPolicy::Structured => DedupKey::Structured(finding.key()),
                DedupPolicy::Summary => DedupKey::Summary(finding.summary.clone()),
            };
            if self.index.insert(key) {
                self.findings.push(finding.clone());
                added.push(finding);
            }
        }
        added
    }

    pub fn all(&self) -> &[SecurityFinding] {
        &self.findings
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }
}
