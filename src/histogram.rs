use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved key inside an ASN's IP map: scans that decoded but carried no A answers.
pub const EMPTY_KEY: &str = "empty";
/// Sentinel key occasionally present in older captures; never a real address.
pub const UNDEFINED_KEY: &str = "undefined";
/// Bucket name the unknown ASN code is folded into during aggregation.
pub const UNKNOWN_BUCKET: &str = "unknown";

/// One domain's accumulated resolution behavior across every vantage point
/// that referenced it. Serializes to the wire shape
/// `{"name": d, "<asn>": {"<ip>": n, ..., "empty": n}, "failed": n}`.
///
/// Immutable once emitted; counts only grow while the owning scan file is
/// being streamed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainAggregate {
    pub name: String,
    /// Lines whose payload could not be decoded at all.
    #[serde(default)]
    pub failed: u64,
    #[serde(flatten)]
    pub asns: BTreeMap<String, BTreeMap<String, u64>>,
}

impl DomainAggregate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failed: 0,
            asns: BTreeMap::new(),
        }
    }

    pub fn record_answer(&mut self, asn: &str, ip: String) {
        *self
            .asns
            .entry(asn.to_string())
            .or_default()
            .entry(ip)
            .or_insert(0) += 1;
    }

    pub fn record_empty(&mut self, asn: &str) {
        *self
            .asns
            .entry(asn.to_string())
            .or_default()
            .entry(EMPTY_KEY.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    /// Every count in the histogram, including `empty`, excluding `failed`.
    pub fn total_count(&self) -> u64 {
        self.asns.values().flat_map(|ips| ips.values()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_matches_aggregate_format() {
        let mut agg = DomainAggregate::new("example.com");
        agg.record_answer("AS100", "192.0.2.1".to_string());
        agg.record_answer("AS100", "192.0.2.1".to_string());
        agg.record_empty("AS200");
        agg.record_failed();

        let json = serde_json::to_string(&agg).unwrap();
        assert_eq!(
            json,
            r#"{"name":"example.com","failed":1,"AS100":{"192.0.2.1":2},"AS200":{"empty":1}}"#
        );

        let back: DomainAggregate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, agg);
    }

    #[test]
    fn missing_failed_defaults_to_zero() {
        let agg: DomainAggregate =
            serde_json::from_str(r#"{"name":"example.com","AS100":{"192.0.2.1":3}}"#).unwrap();
        assert_eq!(agg.failed, 0);
        assert_eq!(agg.total_count(), 3);
    }
}
