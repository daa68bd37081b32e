use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use crate::args::OutputFormat;
use crate::blacklist::build_blacklist;
use crate::decode::decode_response;
use crate::histogram::{DomainAggregate, UNKNOWN_BUCKET};
use crate::lookup::{AsnTable, UNKNOWN_ASN};
use crate::utils::format_number;
use crate::writer::{cleanup_caches, tmp_path, MapWriter};

/// One scan capture in the work queue: the capture itself, its private
/// aggregate cache, and the optional domain-index file beside it.
struct ScanFile {
    path: PathBuf,
    cache: PathBuf,
    index: Option<PathBuf>,
}

#[derive(Default)]
struct FileStats {
    attributed: u64,
    dropped: u64,
}

/// Aggregate a run directory of scan captures into per-domain resolution
/// histograms and compile them into a single output artifact.
///
/// Files are pulled from a sorted work queue strictly one at a time; each
/// file's state is flushed to its cache and released before the next file
/// starts, so peak memory and open handles stay bounded however large the
/// corpus is. A file whose cache already exists is not reprocessed, which
/// makes a restart after partial failure cheap.
pub fn run_aggregate(
    rundir: &Path,
    table_path: &Path,
    output: &Path,
    format: OutputFormat,
    blacklist_path: Option<&Path>,
    canary: Option<Ipv4Addr>,
) -> Result<()> {
    let start = Instant::now();
    let table = AsnTable::load(table_path)?;
    let blacklist = match (blacklist_path, canary) {
        (Some(path), Some(canary)) => build_blacklist(path, canary)?,
        _ => HashSet::new(),
    };

    let queue = enumerate_scan_files(rundir)?;
    info!(
        action = "start",
        component = "aggregate",
        files = queue.len(),
        rundir = ?rundir,
        "Starting aggregation"
    );

    let mut processed = 0u64;
    let mut resumed = 0u64;
    let mut attributed = 0u64;
    let mut dropped = 0u64;
    for (n, file) in queue.iter().enumerate() {
        if file.cache.exists() {
            resumed += 1;
        } else {
            let stats = aggregate_file(file, &table, &blacklist)?;
            attributed += stats.attributed;
            dropped += stats.dropped;
            processed += 1;
        }
        if (n + 1) % 100 == 0 {
            info!(
                component = "aggregate",
                done = n + 1,
                total = queue.len(),
                "Aggregation progress"
            );
        }
    }

    let domains = match format {
        OutputFormat::Map => compile_map(&queue, output)?,
        OutputFormat::Lines => compile_lines(&queue, output)?,
    };
    let caches: Vec<PathBuf> = queue.iter().map(|f| f.cache.clone()).collect();
    cleanup_caches(&caches);

    info!(
        action = "complete",
        component = "aggregate",
        files = processed,
        resumed,
        domains = %format_number(domains),
        lines = %format_number(attributed),
        dropped = %format_number(dropped),
        duration_ms = start.elapsed().as_millis(),
        "Aggregation complete"
    );
    Ok(())
}

fn enumerate_scan_files(rundir: &Path) -> Result<Vec<ScanFile>> {
    let entries = fs::read_dir(rundir)
        .with_context(|| format!("failed to read run directory {:?}", rundir))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {:?}", rundir))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".csv") else {
            continue;
        };
        let index = rundir.join(format!("{}.json", stem));
        files.push(ScanFile {
            path: rundir.join(name),
            cache: rundir.join(format!("{}.asn.json", name)),
            index: index.exists().then_some(index),
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Stream one scan file into per-domain aggregates and flush them to the
/// file's private cache. The cache is written under a temporary name and
/// renamed on completion, so an interrupted run never leaves a cache that
/// claims to be complete.
fn aggregate_file(
    file: &ScanFile,
    table: &AsnTable,
    blacklist: &HashSet<String>,
) -> Result<FileStats> {
    let domains: Option<Vec<String>> = match &file.index {
        Some(path) => {
            let reader = BufReader::new(
                File::open(path)
                    .with_context(|| format!("failed to open domain index {:?}", path))?,
            );
            Some(
                serde_json::from_reader(reader)
                    .with_context(|| format!("failed to parse domain index {:?}", path))?,
            )
        }
        None => None,
    };

    let mut into: BTreeMap<String, DomainAggregate> = BTreeMap::new();
    if let Some(domains) = &domains {
        // Seed every indexed domain so zero-traffic domains still emit an
        // aggregate.
        for domain in domains {
            into.entry(domain.clone())
                .or_insert_with(|| DomainAggregate::new(domain.clone()));
        }
    }

    let reader = BufReader::new(
        File::open(&file.path)
            .with_context(|| format!("failed to open scan file {:?}", file.path))?,
    );
    let mut stats = FileStats::default();
    for line in reader.lines() {
        let line =
            line.with_context(|| format!("failed to read scan file {:?}", file.path))?;
        if process_line(&line, domains.as_deref(), table, blacklist, &mut into) {
            stats.attributed += 1;
        } else {
            stats.dropped += 1;
        }
    }

    let tmp = tmp_path(&file.cache);
    {
        let mut out = BufWriter::new(
            File::create(&tmp)
                .with_context(|| format!("failed to create aggregate cache {:?}", tmp))?,
        );
        for agg in into.values() {
            serde_json::to_writer(&mut out, agg).context("failed to write aggregate cache")?;
            out.write_all(b"\n").context("failed to write aggregate cache")?;
        }
        out.flush().context("failed to flush aggregate cache")?;
    }
    fs::rename(&tmp, &file.cache)
        .with_context(|| format!("failed to finalize aggregate cache {:?}", file.cache))?;

    debug!(
        component = "aggregate",
        file = ?file.path,
        domains = into.len(),
        lines = stats.attributed,
        "Scan file aggregated"
    );
    Ok(stats)
}

/// Attribute one scan line. Returns false when the line is dropped
/// (malformed, unresolvable, or blacklisted).
fn process_line(
    line: &str,
    domains: Option<&[String]>,
    table: &AsnTable,
    blacklist: &HashSet<String>,
    into: &mut BTreeMap<String, DomainAggregate>,
) -> bool {
    let parts: Vec<&str> = line.split(',').collect();
    let (source, expected, payload) = match (parts.len(), domains) {
        (4, Some(domains)) => {
            let Ok(idx) = parts[1].trim().parse::<usize>() else {
                return false;
            };
            let Some(domain) = domains.get(idx) else {
                return false;
            };
            (parts[0], domain.as_str(), parts[3])
        }
        (3, None) if !parts[1].is_empty() => (parts[0], parts[1], parts[2]),
        _ => return false,
    };

    if blacklist.contains(source) {
        return false;
    }

    let mut asn = table.lookup(source);
    if asn == UNKNOWN_ASN {
        asn = UNKNOWN_BUCKET;
    }

    match decode_response(payload) {
        Err(_) => entry(into, expected).record_failed(),
        Ok(response) => {
            // Credit the question name the packet actually carries, so an
            // index/domain mismatch cannot contaminate another domain's bucket.
            let name = match response.question.as_deref() {
                Some(q) if !q.is_empty() => q,
                _ => expected,
            };
            let agg = entry(into, name);
            if response.answers.is_empty() {
                agg.record_empty(asn);
            } else {
                for ip in &response.answers {
                    agg.record_answer(asn, ip.to_string());
                }
            }
        }
    }
    true
}

fn entry<'a>(
    into: &'a mut BTreeMap<String, DomainAggregate>,
    name: &str,
) -> &'a mut DomainAggregate {
    into.entry(name.to_string())
        .or_insert_with(|| DomainAggregate::new(name))
}

fn compile_map(queue: &[ScanFile], output: &Path) -> Result<u64> {
    info!(
        action = "compile",
        component = "aggregate",
        format = "map",
        output = ?output,
        "Writing compiled map"
    );
    let mut writer = MapWriter::create(output, queue.len())?;
    for file in queue {
        let reader = BufReader::new(
            File::open(&file.cache)
                .with_context(|| format!("failed to open aggregate cache {:?}", file.cache))?,
        );
        for line in reader.lines() {
            let line = line
                .with_context(|| format!("failed to read aggregate cache {:?}", file.cache))?;
            if line.is_empty() {
                continue;
            }
            let record: serde_json::Value = serde_json::from_str(&line)
                .with_context(|| format!("malformed aggregate cache {:?}", file.cache))?;
            let name = record
                .get("name")
                .and_then(|v| v.as_str())
                .with_context(|| format!("aggregate record without a name in {:?}", file.cache))?;
            writer.write_entry(name, &line)?;
        }
    }
    writer.finish()
}

fn compile_lines(queue: &[ScanFile], output: &Path) -> Result<u64> {
    info!(
        action = "compile",
        component = "aggregate",
        format = "lines",
        output = ?output,
        "Writing aggregate stream"
    );
    let tmp = tmp_path(output);
    let mut out = BufWriter::new(
        File::create(&tmp).with_context(|| format!("failed to create output file {:?}", tmp))?,
    );
    let mut domains = 0u64;
    for file in queue {
        let reader = BufReader::new(
            File::open(&file.cache)
                .with_context(|| format!("failed to open aggregate cache {:?}", file.cache))?,
        );
        for line in reader.lines() {
            let line = line
                .with_context(|| format!("failed to read aggregate cache {:?}", file.cache))?;
            if line.is_empty() {
                continue;
            }
            out.write_all(line.as_bytes())
                .context("failed to write aggregate stream")?;
            out.write_all(b"\n").context("failed to write aggregate stream")?;
            domains += 1;
        }
    }
    out.flush().context("failed to flush output")?;
    fs::rename(&tmp, output)
        .with_context(|| format!("failed to finalize output file {:?}", output))?;
    Ok(domains)
}
