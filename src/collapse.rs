use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::histogram::{DomainAggregate, EMPTY_KEY};
use crate::utils::format_number;

/// Share of total resolutions the majority IP set must exceed.
pub const MAJORITY_SHARE: f64 = 0.67;

/// Lines pulled from the aggregate stream per parallel batch.
const CHUNK: usize = 1024;

/// Per-ASN `(good, bad)` grading against the majority IP set.
pub type MajorityResult = BTreeMap<String, (u64, u64)>;

/// Grade each ASN in one domain's histogram against the domain's majority
/// IP set: the minimal set of its most-resolved IPs whose combined share
/// exceeds [`MAJORITY_SHARE`] of all resolutions.
///
/// Domains are typically served from a small stable set of IPs; counts that
/// land outside that set are anomaly candidates. The sort is keyed on
/// `(-count, ip)` so equal-count boundaries are deterministic.
pub fn collapse_domain(agg: &DomainAggregate) -> MajorityResult {
    let mut iptotals: BTreeMap<&str, u64> = BTreeMap::new();
    let mut empty_total = 0u64;
    for bucket in agg.asns.values() {
        for (ip, count) in bucket {
            if ip == EMPTY_KEY {
                empty_total += count;
            } else {
                *iptotals.entry(ip).or_insert(0) += count;
            }
        }
    }

    let total: u64 = iptotals.values().sum();
    let threshold = total as f64 * MAJORITY_SHARE;

    let mut sorted: Vec<(&str, u64)> = iptotals.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut majority: HashSet<&str> = HashSet::new();
    let mut running = 0u64;
    let mut boundary = 0u64;
    for (ip, count) in &sorted {
        running += count;
        boundary = *count;
        majority.insert(*ip);
        if running as f64 > threshold {
            break;
        }
    }

    debug!(
        component = "collapse",
        domain = %agg.name,
        majority = majority.len(),
        ips = sorted.len(),
        "Majority set computed"
    );
    if empty_total > boundary {
        // Empty responses would sort ahead of the majority boundary: most
        // scans for this domain got no answer at all.
        warn!(component = "collapse", domain = %agg.name, empty = empty_total, "Empty responses outweigh the majority set");
    }

    let mut graded = MajorityResult::new();
    for (asn, bucket) in &agg.asns {
        let mut good = 0u64;
        let mut bad = 0u64;
        for (ip, count) in bucket {
            if ip == EMPTY_KEY {
                continue;
            }
            if majority.contains(ip.as_str()) {
                good += count;
            } else {
                bad += count;
            }
        }
        if good + bad > 0 {
            graded.insert(asn.clone(), (good, bad));
        }
    }
    graded
}

/// Collapse an aggregate JSONL stream into `["<domain>", {"<asn>": [good, bad]}]`
/// lines. Input is consumed in bounded chunks, each chunk graded in parallel,
/// results written back in input order.
pub fn run_collapse(input: &Path, output: &Path, workers: Option<usize>) -> Result<()> {
    let start = Instant::now();
    let workers = workers.unwrap_or_else(|| num_cpus::get().min(8));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("failed to build worker pool")?;

    info!(
        action = "start",
        component = "collapse",
        workers,
        input = ?input,
        "Starting majority collapse"
    );

    let reader = BufReader::new(
        File::open(input).with_context(|| format!("failed to open aggregate file {:?}", input))?,
    );
    let mut out = BufWriter::new(
        File::create(output)
            .with_context(|| format!("failed to create output file {:?}", output))?,
    );

    let mut lines = reader.lines();
    let mut collapsed = 0u64;
    let mut skipped = 0u64;
    loop {
        let mut chunk = Vec::with_capacity(CHUNK);
        while chunk.len() < CHUNK {
            match lines.next() {
                Some(line) => {
                    let line = line.context("failed to read aggregate stream")?;
                    if !line.trim().is_empty() {
                        chunk.push(line);
                    }
                }
                None => break,
            }
        }
        if chunk.is_empty() {
            break;
        }

        let results: Vec<Option<(String, MajorityResult)>> = pool.install(|| {
            chunk
                .par_iter()
                .map(|line| {
                    let agg: DomainAggregate = serde_json::from_str(line).ok()?;
                    let graded = collapse_domain(&agg);
                    Some((agg.name, graded))
                })
                .collect()
        });

        for result in results {
            match result {
                Some((name, graded)) => {
                    serde_json::to_writer(&mut out, &(&name, &graded))
                        .context("failed to write collapse result")?;
                    out.write_all(b"\n").context("failed to write collapse result")?;
                    collapsed += 1;
                }
                None => skipped += 1,
            }
        }
    }
    out.flush().context("failed to flush output")?;

    info!(
        action = "complete",
        component = "collapse",
        collapsed = %format_number(collapsed),
        skipped,
        duration_ms = start.elapsed().as_millis(),
        "Majority collapse complete"
    );
    Ok(())
}
