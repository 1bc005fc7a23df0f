//! Filesystem store: one gzip jsonlines file per (topic, calendar hour)
//!
//! Records are newline-delimited JSON, gzip-compressed as written. The
//! encoder is sync-flushed after every record so a crash loses at most the
//! trailing record. Rotation is monotonic: when the active hour rolls over,
//! the previous bucket's writer is closed and a new one opened. No
//! compaction or merge.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use tracing::{debug, info};

use crate::{Store, StoreError};

struct GzipFile {
    path: PathBuf,
    encoder: GzEncoder<File>,
}

impl GzipFile {
    fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), "opened bucket");
        Ok(Self {
            path: path.to_path_buf(),
            encoder: GzEncoder::new(file, Compression::default()),
        })
    }

    fn write_record(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        self.encoder.write_all(bytes)?;
        self.encoder.write_all(b"\n")?;
        self.encoder.flush()?;
        Ok(())
    }

    fn close(mut self) -> Result<(), StoreError> {
        debug!(path = %self.path.display(), "closing bucket");
        self.encoder.try_finish()?;
        Ok(())
    }
}

pub struct FsStore {
    base: PathBuf,
    files: HashMap<String, GzipFile>,
}

impl FsStore {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            files: HashMap::new(),
        })
    }

    fn bucket_path(&self, topic: &str, at: DateTime<Utc>) -> PathBuf {
        self.base
            .join(format!("{}-{}.jsonlines.gz", topic, at.format("%Y%m%d%H")))
    }

    fn insert_at(
        &mut self,
        topic: &str,
        record: &Value,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let path = self.bucket_path(topic, at);

        // Hour rollover: retire the previous bucket's writer first
        if let Some(open) = self.files.get(topic) {
            if open.path != path {
                if let Some(old) = self.files.remove(topic) {
                    old.close()?;
                }
            }
        }

        if !self.files.contains_key(topic) {
            self.files.insert(topic.to_string(), GzipFile::open(&path)?);
        }
        let writer = self
            .files
            .get_mut(topic)
            .expect("writer inserted above");
        writer.write_record(&serde_json::to_vec(record)?)
    }
}

impl Store for FsStore {
    fn insert(&mut self, topic: &str, record: &Value) -> Result<(), StoreError> {
        self.insert_at(topic, record, Utc::now())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        for (_, file) in self.files.drain() {
            file.close()?;
        }
        Ok(())
    }
}

impl Drop for FsStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
