// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Rolling cache of recently applied tipsets plus its on-disk journal. The
//! file holds one JSON record per line, height ascending, truncated to the
//! newest [`MAX_STORE_TIPSET_COUNT`] entries, and is replaced atomically so a
//! crash mid-flush never leaves a torn file.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ChainEpoch, Tipset};

pub const MAX_STORE_TIPSET_COUNT: usize = 1000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tipset file: {0}")]
    Io(#[from] std::io::Error),
    #[error("tipset record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TipsetRecord {
    pub height: ChainEpoch,
    pub key: String,
    pub cids: Vec<String>,
}

impl TipsetRecord {
    pub fn from_tipset(ts: &Tipset) -> Self {
        let cids: Vec<String> = ts.cids().iter().map(|c| c.to_string()).collect();
        TipsetRecord {
            height: ts.epoch(),
            key: cids.join(","),
            cids,
        }
    }

    /// Same height and same block-cid set, order ignored.
    pub fn matches(&self, ts: &Tipset) -> bool {
        if self.height != ts.epoch() || self.cids.len() != ts.cids().len() {
            return false;
        }
        ts.cids()
            .iter()
            .all(|c| self.cids.iter().any(|s| s == &c.to_string()))
    }
}

pub struct TipsetCache {
    cache: Mutex<HashMap<ChainEpoch, TipsetRecord>>,
    path: PathBuf,
}

impl TipsetCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TipsetCache {
            cache: Mutex::new(HashMap::new()),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the journal into the cache, creating the file when missing.
    /// Returns the records newest-first, the order the ancestor walk wants.
    pub fn load(&self) -> Result<Vec<TipsetRecord>, Error> {
        if !self.path.exists() {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::File::create(&self.path)?;
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str::<TipsetRecord>(&line)?);
        }
        let mut cache = self.cache.lock();
        cache.clear();
        for record in &records {
            cache.insert(record.height, record.clone());
        }
        records.sort_by_key(|r| std::cmp::Reverse(r.height));
        Ok(records)
    }

    pub fn add(&self, record: TipsetRecord) {
        self.cache.lock().insert(record.height, record);
    }

    pub fn get(&self, height: ChainEpoch) -> Option<TipsetRecord> {
        self.cache.lock().get(&height).cloned()
    }

    pub fn remove(&self, height: ChainEpoch) {
        self.cache.lock().remove(&height);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Records newest-first.
    pub fn records_desc(&self) -> Vec<TipsetRecord> {
        let mut records: Vec<TipsetRecord> = self.cache.lock().values().cloned().collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.height));
        records
    }

    /// Drop entries that fell out of the rolling window below `head_height`.
    pub fn reduce(&self, head_height: ChainEpoch) {
        let floor = head_height - MAX_STORE_TIPSET_COUNT as ChainEpoch;
        self.cache.lock().retain(|height, _| *height >= floor);
    }

    /// Write the cache to disk: height ascending, newest
    /// [`MAX_STORE_TIPSET_COUNT`] records, atomic replace via rename.
    pub fn flush(&self) -> Result<(), Error> {
        let mut records: Vec<TipsetRecord> = self.cache.lock().values().cloned().collect();
        records.sort_by_key(|r| r.height);
        if records.len() > MAX_STORE_TIPSET_COUNT {
            let cut = records.len() - MAX_STORE_TIPSET_COUNT;
            records.drain(..cut);
        }
        let tmp = self.path.with_extension("tmp");
        if let Some(dir) = tmp.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = fs::File::create(&tmp)?;
        for record in &records {
            serde_json::to_writer(&mut file, record)?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_api::mock_tipset;

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tipsets.json");

        let cache = TipsetCache::new(&path);
        assert!(cache.load().unwrap().is_empty());
        for i in 0..5 {
            cache.add(TipsetRecord::from_tipset(&mock_tipset(i as u64, i)));
        }
        cache.flush().unwrap();

        let reloaded = TipsetCache::new(&path);
        let records = reloaded.load().unwrap();
        assert_eq!(records.len(), 5);
        // newest first
        assert_eq!(records[0].height, 4);
        assert_eq!(records[4].height, 0);
    }

    #[test]
    fn flush_truncates_to_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tipsets.json");
        let cache = TipsetCache::new(&path);
        for i in 0..(MAX_STORE_TIPSET_COUNT + 50) {
            cache.add(TipsetRecord::from_tipset(&mock_tipset(i as u64, i as i64)));
        }
        cache.flush().unwrap();

        let reloaded = TipsetCache::new(&path);
        let records = reloaded.load().unwrap();
        assert_eq!(records.len(), MAX_STORE_TIPSET_COUNT);
        // oldest entries were dropped
        assert_eq!(records.last().unwrap().height, 50);
    }

    #[test]
    fn reduce_drops_stale_heights() {
        let cache = TipsetCache::new("/nonexistent/unused");
        for i in 0..10 {
            cache.add(TipsetRecord::from_tipset(&mock_tipset(i as u64, i)));
        }
        cache.reduce(MAX_STORE_TIPSET_COUNT as ChainEpoch + 5);
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn record_matching_ignores_cid_order() {
        let ts = mock_tipset(7, 42);
        let record = TipsetRecord::from_tipset(&ts);
        assert!(record.matches(&ts));
        assert!(!record.matches(&mock_tipset(8, 42)));
        assert!(!record.matches(&mock_tipset(7, 43)));
    }
}
