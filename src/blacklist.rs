use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::info;

use crate::decode::decode_response;

/// Scan a calibration capture of a known canary domain and collect the
/// vantage points whose recursive answers do not contain the expected
/// address. Those sources are interfering with resolution and are excluded
/// from aggregation entirely.
///
/// Records that fail to decode are skipped, not blacklisted: absence of
/// evidence is not evidence of malice.
pub fn build_blacklist(path: &Path, canary: Ipv4Addr) -> Result<HashSet<String>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open calibration file {:?}", path))?;
    let reader = BufReader::new(file);

    info!(
        action = "start",
        component = "blacklist",
        canary = %canary,
        "Generating server filter list"
    );

    let mut blacklist = HashSet::new();
    let mut scanned = 0u64;
    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read {:?}", path))?;
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() != 3 {
            continue;
        }
        scanned += 1;
        let Ok(response) = decode_response(parts[2]) else {
            continue;
        };
        if response.recursion_available
            && response.answer_count > 0
            && !response.answers.contains(&canary)
        {
            blacklist.insert(parts[0].to_string());
        }
    }

    info!(
        action = "complete",
        component = "blacklist",
        scanned,
        blacklisted = blacklist.len(),
        "Server filter list ready"
    );
    Ok(blacklist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::encode_response;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CANARY: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

    fn run(lines: &[String]) -> HashSet<String> {
        let mut tmp = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(tmp, "{}", line).unwrap();
        }
        tmp.flush().unwrap();
        build_blacklist(tmp.path(), CANARY).unwrap()
    }

    #[test]
    fn hijacking_vantage_point_is_blacklisted() {
        let bad = encode_response("canary.test", true, &[Ipv4Addr::new(203, 0, 113, 9)]);
        let good = encode_response("canary.test", true, &[CANARY]);
        let set = run(&[
            format!("10.0.0.1,canary.test,{}", bad),
            format!("10.0.0.2,canary.test,{}", good),
        ]);
        assert!(set.contains("10.0.0.1"));
        assert!(!set.contains("10.0.0.2"));
    }

    #[test]
    fn mixed_answers_with_canary_pass() {
        let mixed = encode_response(
            "canary.test",
            true,
            &[Ipv4Addr::new(203, 0, 113, 9), CANARY],
        );
        let set = run(&[format!("10.0.0.3,canary.test,{}", mixed)]);
        assert!(set.is_empty());
    }

    #[test]
    fn non_recursive_and_empty_responses_pass() {
        let no_ra = encode_response("canary.test", false, &[Ipv4Addr::new(203, 0, 113, 9)]);
        let empty = encode_response("canary.test", true, &[]);
        let set = run(&[
            format!("10.0.0.4,canary.test,{}", no_ra),
            format!("10.0.0.5,canary.test,{}", empty),
        ]);
        assert!(set.is_empty());
    }

    #[test]
    fn undecodable_records_are_skipped() {
        let set = run(&[
            "10.0.0.6,canary.test,nothex".to_string(),
            "malformed line without fields".to_string(),
        ]);
        assert!(set.is_empty());
    }
}
