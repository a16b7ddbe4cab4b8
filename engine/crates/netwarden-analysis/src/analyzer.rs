//! Security analyzer - runs every rule over one batch of ports and packets

use std::collections::HashSet;
use std::sync::Arc;

use netwarden_common::Config;
use netwarden_core::{AnalysisResult, PacketInfo, PortResult, SecurityFinding};
use tracing::debug;

use crate::enrich::GeoEnricher;
use crate::rules::{
    BatchRule, CleartextHttpRule, CredentialRule, NetworkActivityRule, PacketRule, PortRuleTable,
};

/// Rule engine over port results and captured packets
pub struct SecurityAnalyzer {
    enricher: Arc<GeoEnricher>,
    port_rules: PortRuleTable,
    packet_rules: Vec<Box<dyn PacketRule>>,
    batch_rules: Vec<Box<dyn BatchRule>>,
}

impl SecurityAnalyzer {
    /// Analyzer with the built-in rule set
    pub fn new(enricher: Arc<GeoEnricher>) -> Self {
        Self {
            enricher,
            port_rules: PortRuleTable::default(),
            packet_rules: vec![
                Box::new(CleartextHttpRule),
                Box::new(CredentialRule::default()),
            ],
            batch_rules: vec![Box::new(NetworkActivityRule::default())],
        }
    }

    /// Analyzer configured from the `[analysis]` and `[geo]` sections
    pub fn from_config(config: &Config) -> Self {
        let enricher = Arc::new(GeoEnricher::from_settings(&config.geo));
        Self {
            enricher,
            port_rules: PortRuleTable::default(),
            packet_rules: vec![
                Box::new(CleartextHttpRule),
                Box::new(CredentialRule::from_settings(&config.analysis)),
            ],
            batch_rules: vec![Box::new(NetworkActivityRule::new(
                config.analysis.external_destination_threshold,
            ))],
        }
    }

    /// Analyzer with no rules at all
    pub fn empty(enricher: Arc<GeoEnricher>) -> Self {
        Self {
            enricher,
            port_rules: PortRuleTable::new(Vec::new()),
            packet_rules: Vec::new(),
            batch_rules: Vec::new(),
        }
    }

    pub fn with_port_rules(mut self, table: PortRuleTable) -> Self {
        self.port_rules = table;
        self
    }

    pub fn with_packet_rule(mut self, rule: impl PacketRule + 'static) -> Self {
        self.packet_rules.push(Box::new(rule));
        self
    }

    pub fn with_batch_rule(mut self, rule: impl BatchRule + 'static) -> Self {
        self.batch_rules.push(Box::new(rule));
        self
    }

    pub fn enricher(&self) -> &Arc<GeoEnricher> {
        &self.enricher
    }

    /// Analyze one batch.
    ///
    /// Either input may be empty. Findings come out in rule order (ports,
    /// then packets, then batch rules) with duplicates by `FindingKey`
    /// removed, first wins. `enriched_packets` mirrors `packets` one-to-one.
    /// Never fails.
    pub async fn analyze(&self, ports: &[PortResult], packets: &[PacketInfo]) -> AnalysisResult {
        let mut enriched_packets = Vec::with_capacity(packets.len());
        for packet in packets {
            let mut packet = packet.clone();
            packet.location = self.enricher.locate_packet(&packet).await;
            enriched_packets.push(packet);
        }

        let mut findings = FindingSet::default();
        findings.extend(self.port_rules.evaluate(ports));

        for packet in &enriched_packets {
            for rule in &self.packet_rules {
                if let Some(finding) = rule.evaluate(packet) {
                    findings.push(finding);
                }
            }
        }

        for rule in &self.batch_rules {
            findings.extend(rule.evaluate(&enriched_packets));
        }

        let findings = findings.into_vec();
        debug!(
            "Analyzed {} ports and {} packets: {} findings",
            ports.len(),
            packets.len(),
            findings.len()
        );

        AnalysisResult {
            findings,
            enriched_packets,
        }
    }
}

#[derive(Default)]
struct FindingSet {
    seen: HashSet<netwarden_core::FindingKey>,
    findings: Vec<SecurityFinding>,
}

impl FindingSet {
    fn push(&mut self, finding: SecurityFinding) {
        if self.seen.insert(finding.key()) {
            self.findings.push(finding);
        }
    }

    fn extend(&mut self, findings: impl IntoIterator<Item = SecurityFinding>) {
        for finding in findings {
            self.push(finding);
        }
    }

    fn into_vec(self) -> Vec<SecurityFinding> {
        self.findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::{LOCAL, UNKNOWN};
    use chrono::{TimeZone, Utc};
    use netwarden_core::{FindingType, Protocol, RiskLevel};

    fn analyzer() -> SecurityAnalyzer {
        SecurityAnalyzer::new(Arc::new(GeoEnricher::offline()))
    }

    fn packet(n: i64, dst: &str, dst_port: u16, payload: &str) -> PacketInfo {
        PacketInfo {
            timestamp: Utc.timestamp_opt(1_700_000_000 + n, 0).unwrap(),
            source: "192.168.1.10".into(),
            destination: dst.into(),
            src_port: Some(50000),
            dst_port: Some(dst_port),
            protocol: Protocol::Tcp,
            payload: payload.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_credential_payload_yields_one_critical() {
        let packets = vec![packet(0, "203.0.113.9", 8080, "login=admin&password=1234")];
        let result = analyzer().analyze(&[], &packets).await;

        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].risk, RiskLevel::Critical);
        assert_eq!(result.findings[0].kind, Some(FindingType::CredentialLeak));
    }

    #[tokio::test]
    async fn test_benign_payload_yields_nothing() {
        let packets = vec![packet(0, "192.168.1.1", 8443, "hello world")];
        let result = analyzer().analyze(&[], &packets).await;
        assert!(result.findings.is_empty());
    }

    #[tokio::test]
    async fn test_exposed_telnet() {
        let analyzer = analyzer();

        let open = analyzer.analyze(&[PortResult::open(23)], &[]).await;
        assert!(open
            .findings
            .iter()
            .any(|f| f.port == 23 && f.risk >= RiskLevel::High));

        let closed = analyzer.analyze(&[PortResult::closed(23)], &[]).await;
        assert!(closed.findings.is_empty());
    }

    #[tokio::test]
    async fn test_enrichment_is_one_to_one_in_order() {
        let packets = vec![
            packet(0, "192.168.1.1", 443, ""),
            packet(0, "192.168.1.1", 443, ""),
            packet(1, "8.8.8.8", 53, ""),
            PacketInfo::default(),
        ];
        let result = analyzer().analyze(&[], &packets).await;

        assert_eq!(result.enriched_packets.len(), packets.len());
        for (input, output) in packets.iter().zip(&result.enriched_packets) {
            assert_eq!(input.key(), output.key());
            assert!(!output.location.is_empty());
        }
        assert_eq!(result.enriched_packets[0].location, LOCAL);
        assert_eq!(result.enriched_packets[2].location, UNKNOWN);
    }

    #[tokio::test]
    async fn test_deterministic_and_deduplicated() {
        let ports = vec![PortResult::open(80), PortResult::open(53)];
        let packets: Vec<PacketInfo> = ["8.8.8.8", "1.1.1.1", "9.9.9.9", "4.4.4.4", "8.8.8.8"]
            .iter()
            .enumerate()
            .map(|(n, dst)| packet(n as i64, dst, 80, "user=x"))
            .collect();

        let analyzer = analyzer();
        let first = analyzer.analyze(&ports, &packets).await;
        let second = analyzer.analyze(&ports, &packets).await;
        assert_eq!(first, second);

        // two port rules, HTTP + credential per distinct destination, one batch finding
        assert_eq!(first.findings.len(), 2 + 4 * 2 + 1);
        let keys: HashSet<_> = first.findings.iter().map(|f| f.key()).collect();
        assert_eq!(keys.len(), first.findings.len());

        assert_eq!(first.findings[0].port, 80);
        assert_eq!(first.findings[0].kind, Some(FindingType::ExposedService));
        assert_eq!(
            first.findings.last().unwrap().kind,
            Some(FindingType::NetworkActivity)
        );
    }

    #[tokio::test]
    async fn test_legacy_capture_records_are_analyzed() {
        let packets: Vec<PacketInfo> = serde_json::from_str(
            r#"[{"timestamp": "15:04:05.000", "source": "192.168.1.10", "dest": "203.0.113.9",
                 "protocol": "TCP", "length": 120, "info": "51000 -> 80",
                 "payload": "login=admin&password=1234", "location": "??"},
                {"timestamp": "15:04:06.000", "protocol": null, "length": -1}]"#,
        )
        .unwrap();

        let result = analyzer().analyze(&[], &packets).await;
        assert_eq!(result.enriched_packets.len(), 2);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].kind, Some(FindingType::CredentialLeak));
    }

    #[tokio::test]
    async fn test_custom_rules() {
        struct IcmpRule;

        impl PacketRule for IcmpRule {
            fn name(&self) -> &str {
                "icmp"
            }

            fn evaluate(&self, packet: &PacketInfo) -> Option<SecurityFinding> {
                (packet.protocol == Protocol::Icmp).then(|| {
                    SecurityFinding::builder(RiskLevel::Info, "ICMP seen")
                        .kind(FindingType::NetworkActivity)
                        .subject(packet.source.clone())
                        .build()
                })
            }
        }

        let analyzer = SecurityAnalyzer::empty(Arc::new(GeoEnricher::offline()))
            .with_packet_rule(IcmpRule);
        let mut ping = packet(0, "192.168.1.1", 0, "");
        ping.protocol = Protocol::Icmp;

        let result = analyzer.analyze(&[PortResult::open(23)], &[ping]).await;
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].summary, "ICMP seen");
    }
}
