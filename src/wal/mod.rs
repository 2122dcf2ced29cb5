//! Append-only, segment-rotating write-ahead log.
//!
//! A WAL lives in a directory. Inside that directory, records are appended to
//! a sequence of physically size-capped files (`00000000.<ext>`,
//! `00000001.<ext>`, ...). Sealing/rotating an entire WAL (renaming its
//! directory so the cache can start a fresh one) is handled one level up by
//! the cache, not by this module — see `Wal::delete_dir`/`scan_dir`, which
//! operate on paths rather than open handles so they still work after a
//! directory has been renamed out from under a closed `Wal`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::config::SyncMode;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::record::{self, ReadOutcome, WalRecord};

#[derive(Debug, Clone)]
pub struct WalOptions {
    pub segment_size: u64,
    pub sync_mode: SyncMode,
    pub file_ext: String,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            segment_size: 16 * 1024 * 1024,
            sync_mode: SyncMode::EveryWrite,
            file_ext: "WSG".to_string(),
        }
    }
}

/// A single open WAL directory, actively accepting appends.
pub struct Wal {
    dir: PathBuf,
    options: WalOptions,
    file: File,
    file_index: u32,
    file_len: u64,
    bytes_since_sync: u64,
    metrics: Arc<Metrics>,
}

fn file_name(index: u32, ext: &str) -> String {
    format!("{index:08}.{ext}")
}

fn list_segment_files(dir: &Path, ext: &str) -> Result<Vec<(u32, PathBuf)>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir).map_err(|e| Error::io("read_dir", e))? {
        let entry = entry.map_err(|e| Error::io("read_dir entry", e))?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some(ext) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if let Ok(idx) = stem.parse::<u32>() {
                out.push((idx, path));
            }
        }
    }
    out.sort_by_key(|(idx, _)| *idx);
    Ok(out)
}

impl Wal {
    /// Opens (creating if necessary) the WAL directory at `dir`, positioned
    /// to append after whatever records are already there.
    pub fn open(dir: impl Into<PathBuf>, options: WalOptions, metrics: Arc<Metrics>) -> Result<Self> {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            metrics.wal_errors.inc();
            return Err(Error::io("create wal dir", e));
        }
        let files = list_segment_files(&dir, &options.file_ext)?;
        let (file_index, file_len) = match files.last() {
            Some((idx, path)) => {
                let len = match fs::metadata(path) {
                    Ok(meta) => meta.len(),
                    Err(e) => {
                        metrics.wal_errors.inc();
                        return Err(Error::io("stat wal file", e));
                    }
                };
                (*idx, len)
            }
            None => (0, 0),
        };
        let path = dir.join(file_name(file_index, &options.file_ext));
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                metrics.wal_errors.inc();
                return Err(Error::io("open wal file", e));
            }
        };
        Ok(Self {
            dir,
            options,
            file,
            file_index,
            file_len,
            bytes_since_sync: 0,
            metrics,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn file_ext(&self) -> &str {
        &self.options.file_ext
    }

    /// Appends one record, rolling to a new physical file if the current one
    /// has grown past `segment_size`. Returns the number of bytes written.
    pub fn write(&mut self, record: &WalRecord) -> Result<usize> {
        if self.file_len >= self.options.segment_size {
            self.roll_file()?;
        }
        let framed = record::frame(record)?;
        if let Err(e) = self.file.write_all(&framed) {
            self.metrics.wal_errors.inc();
            return Err(Error::io("wal append", e));
        }
        self.file_len += framed.len() as u64;
        self.bytes_since_sync += framed.len() as u64;

        match self.options.sync_mode {
            SyncMode::EveryWrite => self.sync()?,
            SyncMode::EveryNBytes(n) if self.bytes_since_sync >= n => self.sync()?,
            _ => {}
        }
        Ok(framed.len())
    }

    fn roll_file(&mut self) -> Result<()> {
        if let Err(e) = self.file.sync_all() {
            self.metrics.wal_errors.inc();
            return Err(Error::io("wal sync before roll", e));
        }
        self.file_index += 1;
        self.file_len = 0;
        let path = self.dir.join(file_name(self.file_index, &self.options.file_ext));
        self.file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                self.metrics.wal_errors.inc();
                return Err(Error::io("open rolled wal file", e));
            }
        };
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        if let Err(e) = self.file.sync_all() {
            self.metrics.wal_errors.inc();
            return Err(Error::io("wal sync", e));
        }
        self.bytes_since_sync = 0;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

/// Reads every valid record found across all segment files in `dir`, in file
/// and append order. Stops at the first truncated or corrupt frame found in a
/// given file (and does not look at later files) since a crash only ever
/// leaves a torn tail on the last file being written.
pub fn scan_dir(dir: &Path, ext: &str, metrics: &Metrics) -> Result<Vec<WalRecord>> {
    let mut out = Vec::new();
    let files = list_segment_files(dir, ext)?;
    for (_, path) in files {
        let mut buf = Vec::new();
        File::open(&path)
            .map_err(|e| Error::io("open wal file for scan", e))?
            .read_to_end(&mut buf)
            .map_err(|e| Error::io("read wal file for scan", e))?;
        let mut offset = 0usize;
        loop {
            match record::read_one(&buf[offset..]) {
                ReadOutcome::Record(rec, consumed) => {
                    out.push(rec);
                    offset += consumed;
                }
                ReadOutcome::Truncated => break,
                ReadOutcome::Corrupt { reason, .. } => {
                    metrics.corruption_events.inc();
                    warn!(file = %path.display(), offset, reason, "wal record corrupt, stopping scan");
                    break;
                }
            }
        }
    }
    Ok(out)
}

/// Deletes a WAL directory by path. Deliberately a free function rather than
/// a method on `Wal`, since the directory being deleted is almost always a
/// sealed segment that was closed (and possibly renamed) long before this
/// is called.
pub fn delete_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|e| Error::io("delete wal dir", e))?;
    }
    Ok(())
}

/// Finds sibling sealed-segment directories named `<stem>.<tag>` next to
/// `active_dir`, sorted by tag ascending.
pub fn find_sealed_siblings(active_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let parent = match active_dir.parent() {
        Some(p) => p,
        None => return Ok(Vec::new()),
    };
    let stem = active_dir
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("wal")
        .to_string();
    let prefix = format!("{stem}.");
    let mut out = Vec::new();
    if !parent.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(parent).map_err(|e| Error::io("read_dir for sealed scan", e))? {
        let entry = entry.map_err(|e| Error::io("read_dir entry", e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
            if let Some(tag_str) = name.strip_prefix(&prefix) {
                if let Ok(tag) = tag_str.parse::<u64>() {
                    out.push((tag, path));
                }
            }
        }
    }
    out.sort_by_key(|(tag, _)| *tag);
    Ok(out)
}

/// Monotone tag generator for sealed-segment directory names: always at
/// least 1 greater than the previous tag, even if the wall clock hasn't
/// moved (or has gone backwards).
pub struct TagSource {
    last: u64,
}

impl TagSource {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    pub fn next(&mut self, now_nanos: u64) -> u64 {
        let candidate = now_nanos.max(self.last + 1);
        self.last = candidate;
        candidate
    }
}

impl Default for TagSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_and_scan_round_trips() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join("wal");
        let metrics = Arc::new(Metrics::default());
        let mut wal = Wal::open(&wal_dir, WalOptions::default(), metrics.clone()).unwrap();
        for i in 0..5 {
            wal.write(&WalRecord {
                key: format!("k{i}"),
                value: vec![i as u8; 4],
            })
            .unwrap();
        }
        wal.close().unwrap();

        let records = scan_dir(&wal_dir, "WSG", &metrics).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[3].key, "k3");
    }

    #[test]
    fn rolls_to_new_file_past_segment_size() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join("wal");
        let options = WalOptions {
            segment_size: 10,
            ..WalOptions::default()
        };
        let metrics = Arc::new(Metrics::default());
        let mut wal = Wal::open(&wal_dir, options, metrics).unwrap();
        for i in 0..10 {
            wal.write(&WalRecord {
                key: format!("k{i}"),
                value: vec![0u8; 8],
            })
            .unwrap();
        }
        wal.close().unwrap();
        let files = list_segment_files(&wal_dir, "WSG").unwrap();
        assert!(files.len() > 1, "expected multiple rolled files, got {}", files.len());
    }

    #[test]
    fn scan_stops_at_truncated_tail() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join("wal");
        let metrics = Arc::new(Metrics::default());
        let mut wal = Wal::open(&wal_dir, WalOptions::default(), metrics.clone()).unwrap();
        wal.write(&WalRecord { key: "a".into(), value: vec![1] }).unwrap();
        wal.write(&WalRecord { key: "b".into(), value: vec![2] }).unwrap();
        wal.close().unwrap();

        let path = wal_dir.join("00000000.WSG");
        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        fs::write(&path, &bytes).unwrap();

        let records = scan_dir(&wal_dir, "WSG", &metrics).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "a");
    }

    #[test]
    fn scan_corrupt_record_increments_metric_and_stops() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join("wal");
        let metrics = Arc::new(Metrics::default());
        let mut wal = Wal::open(&wal_dir, WalOptions::default(), metrics.clone()).unwrap();
        wal.write(&WalRecord { key: "a".into(), value: vec![1] }).unwrap();
        wal.write(&WalRecord { key: "b".into(), value: vec![2] }).unwrap();
        wal.close().unwrap();

        let path = wal_dir.join("00000000.WSG");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF; // flip a byte in the second record's trailing CRC
        fs::write(&path, &bytes).unwrap();

        let records = scan_dir(&wal_dir, "WSG", &metrics).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "a");
        assert_eq!(metrics.snapshot().corruption_events, 1);
    }

    #[test]
    fn tag_source_is_monotone_even_without_clock_movement() {
        let mut src = TagSource::new();
        let a = src.next(100);
        let b = src.next(100);
        let c = src.next(50);
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn finds_sealed_siblings_sorted() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join("wal");
        fs::create_dir_all(dir.path().join("wal.20")).unwrap();
        fs::create_dir_all(dir.path().join("wal.5")).unwrap();
        fs::create_dir_all(&wal_dir).unwrap();
        let sealed = find_sealed_siblings(&wal_dir).unwrap();
        assert_eq!(sealed.iter().map(|(t, _)| *t).collect::<Vec<_>>(), vec![5, 20]);
    }
}
