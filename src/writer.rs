use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Streams per-domain records into a single compiled JSON map,
/// `{"length": N, "<domain>": <record>, ...}`, without holding more than one
/// record in memory.
///
/// Entries are appended in queue order through a buffered sink: each write
/// either lands in the buffer or blocks until the file drains, so output
/// order is strict and memory stays bounded on long domain lists. The map is
/// assembled under a temporary name and only renamed into place by
/// [`finish`](MapWriter::finish); an aborted run never leaves a compiled file
/// claiming success.
pub struct MapWriter {
    out: BufWriter<File>,
    tmp: PathBuf,
    path: PathBuf,
    entries: u64,
}

impl MapWriter {
    pub fn create(path: &Path, length: usize) -> Result<Self> {
        let tmp = tmp_path(path);
        let file = File::create(&tmp)
            .with_context(|| format!("failed to create output file {:?}", tmp))?;
        let mut out = BufWriter::new(file);
        write!(out, "{{\"length\":{}", length).context("failed to write map header")?;
        Ok(Self {
            out,
            tmp,
            path: path.to_path_buf(),
            entries: 0,
        })
    }

    /// Append one entry. `record` must already be a complete JSON value.
    pub fn write_entry(&mut self, name: &str, record: &str) -> Result<()> {
        let key = serde_json::to_string(name).context("failed to encode domain key")?;
        self.out.write_all(b",").context("failed to write map entry")?;
        self.out
            .write_all(key.as_bytes())
            .context("failed to write map entry")?;
        self.out.write_all(b":").context("failed to write map entry")?;
        self.out
            .write_all(record.as_bytes())
            .context("failed to write map entry")?;
        self.entries += 1;
        Ok(())
    }

    /// Close the map, flush, and rename it into place. Returns the entry count.
    pub fn finish(mut self) -> Result<u64> {
        self.out.write_all(b"}").context("failed to close map")?;
        self.out.flush().context("failed to flush compiled map")?;
        fs::rename(&self.tmp, &self.path)
            .with_context(|| format!("failed to finalize output file {:?}", self.path))?;
        Ok(self.entries)
    }
}

pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Remove per-file aggregate caches once the compiled output is finalized.
/// Failures are logged and do not fail the run.
pub fn cleanup_caches(paths: &[PathBuf]) {
    info!(
        action = "cleanup",
        component = "writer",
        caches = paths.len(),
        "Cleaning up per-file caches"
    );
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            warn!(component = "writer", path = ?path, error = %e, "Failed to remove cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn compiled_map_is_valid_json_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.json");

        let mut writer = MapWriter::create(&path, 2).unwrap();
        writer
            .write_entry("a.example", r#"{"name":"a.example","failed":0}"#)
            .unwrap();
        writer
            .write_entry("b.example", r#"{"name":"b.example","failed":1}"#)
            .unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(r#"{"length":2,"a.example":"#));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["length"], 2);
        assert_eq!(value["b.example"]["failed"], 1);
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn aborted_map_leaves_no_output() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.json");
        let writer = MapWriter::create(&path, 1).unwrap();
        drop(writer);
        assert!(!path.exists());
    }

    #[test]
    fn cleanup_ignores_missing_caches() {
        let dir = tempdir().unwrap();
        let present = dir.path().join("a.asn.json");
        fs::write(&present, "x").unwrap();
        let missing = dir.path().join("b.asn.json");
        cleanup_caches(&[present.clone(), missing]);
        assert!(!present.exists());
    }
}
