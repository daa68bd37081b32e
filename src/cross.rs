use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

use crate::histogram::{DomainAggregate, EMPTY_KEY, UNDEFINED_KEY, UNKNOWN_BUCKET};
use crate::lookup::{AsnTable, UNKNOWN_ASN};
use crate::utils::format_number;

/// Resolved-ASN fractions must strictly exceed this share of the source
/// ASN's total to survive.
pub const NOISE_FLOOR: f64 = 0.01;

/// Coarsening width used to match answer addresses against IP clusters.
const CLUSTER_PREFIX_BITS: u8 = 24;

/// Source ASN -> resolved ASN -> fraction of that source's resolutions.
pub type DominantAsnMap = BTreeMap<String, BTreeMap<String, f64>>;

/// Externally computed clusterings: domain -> cluster index, and cluster
/// index -> member IP prefixes. Both load once and are read-only.
pub struct ClusterIndex {
    domains: HashMap<String, usize>,
    ips: HashMap<String, HashSet<String>>,
}

impl ClusterIndex {
    pub fn load(domain_path: &Path, ip_path: &Path) -> Result<Self> {
        let file = File::open(domain_path)
            .with_context(|| format!("failed to open domain clusters {:?}", domain_path))?;
        let clusters: Vec<Option<Vec<String>>> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse domain clusters {:?}", domain_path))?;
        let mut domains = HashMap::new();
        for (idx, cluster) in clusters.into_iter().enumerate() {
            let Some(cluster) = cluster else { continue };
            for domain in cluster {
                domains.insert(domain, idx);
            }
        }

        let file = File::open(ip_path)
            .with_context(|| format!("failed to open IP clusters {:?}", ip_path))?;
        let raw: HashMap<String, Vec<String>> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse IP clusters {:?}", ip_path))?;
        let ips: HashMap<String, HashSet<String>> = raw
            .into_iter()
            .map(|(idx, prefixes)| (idx, prefixes.into_iter().collect()))
            .collect();

        info!(
            component = "clusters",
            domains = domains.len(),
            clusters = ips.len(),
            "Cluster assignments loaded"
        );
        Ok(Self { domains, ips })
    }

    /// Member prefixes of the domain's assigned cluster. `None` when the
    /// domain has no assignment or the cluster has no known IP membership;
    /// such domains are rejected from cross-reference collapsing.
    pub fn member_prefixes(&self, domain: &str) -> Option<&HashSet<String>> {
        let idx = self.domains.get(domain)?;
        self.ips.get(&idx.to_string())
    }
}

/// Recompute one domain's per-source-ASN distribution over *resolved* ASNs,
/// restricted to answer addresses inside the domain's own IP cluster.
///
/// Restricting to cluster members strips background noise from shared
/// infrastructure; re-resolving through the (possibly refreshed) lookup
/// table gives the ASN the cluster dominantly lands on.
pub fn collapse_cross(
    agg: &DomainAggregate,
    table: &AsnTable,
    members: &HashSet<String>,
) -> DominantAsnMap {
    let mut output = DominantAsnMap::new();
    for (source_asn, bucket) in &agg.asns {
        if source_asn == UNKNOWN_BUCKET {
            continue;
        }
        // The denominator counts everything this source ASN saw, member or not.
        let total: u64 = bucket.values().sum();
        if total == 0 {
            continue;
        }

        let mut mapped: BTreeMap<&str, u64> = BTreeMap::new();
        for (ip, count) in bucket {
            if ip == EMPTY_KEY || ip == UNDEFINED_KEY || ip.contains(':') {
                continue;
            }
            let Some(key) = table.prefix(ip, CLUSTER_PREFIX_BITS) else {
                continue;
            };
            if !members.contains(&key) {
                continue;
            }
            *mapped.entry(table.lookup(ip)).or_insert(0) += count;
        }

        let mut fractions = BTreeMap::new();
        for (resolved, count) in mapped {
            if resolved == UNKNOWN_ASN {
                continue;
            }
            if count as f64 > total as f64 * NOISE_FLOOR {
                fractions.insert(resolved.to_string(), count as f64 / total as f64);
            }
        }
        if !fractions.is_empty() {
            output.insert(source_asn.clone(), fractions);
        }
    }
    output
}

/// Cross-reference an aggregate JSONL stream against domain and IP clusters,
/// emitting `["<domain>", {"<source-asn>": {"<resolved-asn>": fraction}}]`
/// lines. Domains without usable cluster data are counted and skipped.
pub fn run_cross(
    input: &Path,
    table_path: &Path,
    domain_clusters: &Path,
    ip_clusters: &Path,
    output: &Path,
) -> Result<()> {
    let start = Instant::now();
    let table = AsnTable::load(table_path)?;
    let clusters = ClusterIndex::load(domain_clusters, ip_clusters)?;

    info!(
        action = "start",
        component = "cross",
        input = ?input,
        "Starting cluster cross-reference"
    );

    let reader = BufReader::new(
        File::open(input).with_context(|| format!("failed to open aggregate file {:?}", input))?,
    );
    let mut out = BufWriter::new(
        File::create(output)
            .with_context(|| format!("failed to create output file {:?}", output))?,
    );

    let mut written = 0u64;
    let mut rejected = 0u64;
    for line in reader.lines() {
        let line = line.context("failed to read aggregate stream")?;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(agg) = serde_json::from_str::<DomainAggregate>(&line) else {
            continue;
        };
        let Some(members) = clusters.member_prefixes(&agg.name) else {
            rejected += 1;
            continue;
        };
        let collapsed = collapse_cross(&agg, &table, members);
        serde_json::to_writer(&mut out, &(&agg.name, &collapsed))
            .context("failed to write cross-reference result")?;
        out.write_all(b"\n")
            .context("failed to write cross-reference result")?;
        written += 1;
    }
    out.flush().context("failed to flush output")?;

    if rejected > 0 {
        warn!(
            component = "cross",
            rejected = %format_number(rejected),
            "Domains with no usable cluster assignment"
        );
    }
    info!(
        action = "complete",
        component = "cross",
        written = %format_number(written),
        rejected,
        duration_ms = start.elapsed().as_millis(),
        "Cluster cross-reference complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn table() -> AsnTable {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(
            tmp,
            r#"{{"198.18.0.0/24": "AS64500", "198.18.1.0/24": "AS64501"}}"#
        )
        .unwrap();
        tmp.flush().unwrap();
        AsnTable::load(tmp.path()).unwrap()
    }

    fn members(prefixes: &[&str]) -> HashSet<String> {
        prefixes.iter().map(|p| p.to_string()).collect()
    }

    fn bucket(agg: &mut DomainAggregate, asn: &str, ips: &[(&str, u64)]) {
        for (ip, count) in ips {
            agg.asns
                .entry(asn.to_string())
                .or_default()
                .insert(ip.to_string(), *count);
        }
    }

    #[test]
    fn one_percent_is_not_above_the_noise_floor() {
        let mut agg = DomainAggregate::new("example.com");
        bucket(
            &mut agg,
            "AS100",
            &[("198.18.0.1", 990), ("198.18.1.1", 10)],
        );
        let out = collapse_cross(
            &agg,
            &table(),
            &members(&["198.18.0.0/24", "198.18.1.0/24"]),
        );
        let fractions = &out["AS100"];
        assert_eq!(fractions.len(), 1);
        assert!((fractions["AS64500"] - 0.99).abs() < 1e-9);
    }

    #[test]
    fn unknown_resolved_asn_is_never_emitted() {
        // 203.0.113.0/24 is a cluster member but absent from the table.
        let mut agg = DomainAggregate::new("example.com");
        bucket(&mut agg, "AS100", &[("203.0.113.5", 100)]);
        let out = collapse_cross(&agg, &table(), &members(&["203.0.113.0/24"]));
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_source_bucket_is_skipped() {
        let mut agg = DomainAggregate::new("example.com");
        bucket(&mut agg, "unknown", &[("198.18.0.1", 100)]);
        let out = collapse_cross(&agg, &table(), &members(&["198.18.0.0/24"]));
        assert!(out.is_empty());
    }

    #[test]
    fn sentinels_count_toward_the_denominator_only() {
        let mut agg = DomainAggregate::new("example.com");
        bucket(
            &mut agg,
            "AS100",
            &[("198.18.0.1", 50), ("empty", 40), ("2001:db8::1", 10)],
        );
        let out = collapse_cross(&agg, &table(), &members(&["198.18.0.0/24"]));
        assert!((out["AS100"]["AS64500"] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn non_member_addresses_are_filtered_out() {
        let mut agg = DomainAggregate::new("example.com");
        bucket(
            &mut agg,
            "AS100",
            &[("198.18.0.1", 60), ("198.18.1.1", 40)],
        );
        let out = collapse_cross(&agg, &table(), &members(&["198.18.0.0/24"]));
        let fractions = &out["AS100"];
        assert_eq!(fractions.len(), 1);
        assert!((fractions["AS64500"] - 0.6).abs() < 1e-9);
    }

    #[test]
    fn unclustered_domains_are_rejected_not_zeroed() {
        let dir = tempdir().unwrap();

        let table_path = dir.path().join("table.json");
        std::fs::write(&table_path, r#"{"198.18.0.0/24": "AS64500"}"#).unwrap();
        let domain_clusters = dir.path().join("clusters.json");
        std::fs::write(&domain_clusters, r#"[null, ["a.example"], ["b.example"]]"#).unwrap();
        let ip_clusters = dir.path().join("clusters.ips.json");
        // Cluster 2 has no IP membership, so b.example is rejected too.
        std::fs::write(&ip_clusters, r#"{"1": ["198.18.0.0/24"]}"#).unwrap();

        let input = dir.path().join("aggregates.jsonl");
        let mut file = File::create(&input).unwrap();
        for name in ["a.example", "b.example", "c.example"] {
            let mut agg = DomainAggregate::new(name);
            bucket(&mut agg, "AS100", &[("198.18.0.1", 10)]);
            writeln!(file, "{}", serde_json::to_string(&agg).unwrap()).unwrap();
        }

        let output = dir.path().join("cross.jsonl");
        run_cross(&input, &table_path, &domain_clusters, &ip_clusters, &output).unwrap();

        let text = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], r#"["a.example",{"AS100":{"AS64500":1.0}}]"#);
    }
}
