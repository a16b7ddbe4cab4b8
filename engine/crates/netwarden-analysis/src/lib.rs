//! NetWarden analysis - turns port results and captured packets into
//! security findings
//!
//! The [`SecurityAnalyzer`] is stateless per call apart from the location
//! cache held by its [`GeoEnricher`]. Merging findings into a session history
//! is the caller's job.

pub mod analyzer;
pub mod enrich;
pub mod rules;

pub use analyzer::SecurityAnalyzer;
pub use enrich::{classify, AddressClass, GeoEnricher, IpApiProvider, LocationProvider};
pub use rules::{
    BatchRule, CleartextHttpRule, CredentialPattern, CredentialRule, NetworkActivityRule,
    PacketRule, PortRule, PortRuleTable,
};
