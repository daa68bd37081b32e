use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::info;

use crate::utils::format_number;

/// Keep only hosts whose /24 also appeared in a previous run's host list.
/// Hosts that moved networks between runs are poor anchors for longitudinal
/// comparison, so scans are restricted to the long-lived intersection.
pub fn run_filter(hosts: &Path, old_hosts: &Path, output: &Path) -> Result<()> {
    info!(
        action = "start",
        component = "filter",
        "Loading previous host list"
    );
    let then = fs::read_to_string(old_hosts)
        .with_context(|| format!("failed to read host list {:?}", old_hosts))?;
    let mut seen: HashSet<u32> = HashSet::new();
    for line in then.lines() {
        if let Some(key) = class_c(line) {
            seen.insert(key);
        }
    }
    info!(
        component = "filter",
        networks = seen.len(),
        "Previous host list indexed"
    );

    let reader = BufReader::new(
        File::open(hosts).with_context(|| format!("failed to open host list {:?}", hosts))?,
    );
    let mut out = BufWriter::new(
        File::create(output)
            .with_context(|| format!("failed to create output file {:?}", output))?,
    );
    let mut total = 0u64;
    let mut kept = 0u64;
    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read host list {:?}", hosts))?;
        if line.is_empty() {
            continue;
        }
        total += 1;
        if class_c(&line).is_some_and(|key| seen.contains(&key)) {
            out.write_all(line.as_bytes())
                .context("failed to write intersection")?;
            out.write_all(b"\n").context("failed to write intersection")?;
            kept += 1;
        }
    }
    out.flush().context("failed to flush output")?;

    let share = if total == 0 {
        0.0
    } else {
        kept as f64 / total as f64 * 100.0
    };
    info!(
        action = "complete",
        component = "filter",
        kept = %format_number(kept),
        total = %format_number(total),
        "Intersection is {:.1}% of the original",
        share
    );
    Ok(())
}

/// /24 network key of a host line; lines may carry a `/prefix` suffix.
fn class_c(line: &str) -> Option<u32> {
    let ip = line.split('/').next()?.trim();
    let addr: Ipv4Addr = ip.parse().ok()?;
    Some(u32::from(addr) & 0xffff_ff00)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn keeps_hosts_from_surviving_networks() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old-hosts.txt");
        fs::write(&old, "10.0.0.1\n192.0.2.5/24\n").unwrap();
        let current = dir.path().join("hosts.txt");
        fs::write(&current, "10.0.0.200\n10.0.1.1\n192.0.2.9\nnot-an-ip\n").unwrap();

        let output = dir.path().join("intersection.txt");
        run_filter(&current, &old, &output).unwrap();

        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "10.0.0.200\n192.0.2.9\n"
        );
    }

    #[test]
    fn class_c_handles_prefixed_lines() {
        assert_eq!(class_c("10.1.2.3"), Some(u32::from(Ipv4Addr::new(10, 1, 2, 0))));
        assert_eq!(class_c("10.1.2.3/24"), class_c("10.1.2.250"));
        assert_eq!(class_c(""), None);
        assert_eq!(class_c("host.example"), None);
    }
}
