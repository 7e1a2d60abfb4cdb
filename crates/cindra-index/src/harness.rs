//! File-driven batch harnesses.
//!
//! Plain-text workloads for exercising a tree: whitespace-separated
//! integer keys, optionally prefixed per pair with `i` (insert) or `d`
//! (delete) in batch mode. The stored value is the key-derived record id.

use crate::key::{IndexKey, KeyComparator};
use crate::tree::BPlusTree;
use cindra_common::{CindraError, PageId, RecordId, Result};
use std::path::Path;

/// Derives the record id stored for an integer key.
pub fn record_id_for_key(key: u64) -> RecordId {
    RecordId::new(PageId::new(0, (key >> 16) as u32), key as u16)
}

fn parse_key(token: &str) -> Result<u64> {
    token
        .parse::<u64>()
        .map_err(|_| CindraError::Internal(format!("bad key token '{token}'")))
}

impl<K, C> BPlusTree<K, C>
where
    K: IndexKey + From<u64>,
    C: KeyComparator<K>,
{
    /// Inserts every integer key found in the file. Returns the number of
    /// keys actually inserted (duplicates in the file count as skipped).
    pub fn insert_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let contents = std::fs::read_to_string(path)?;
        let mut inserted = 0;
        for token in contents.split_whitespace() {
            let key = parse_key(token)?;
            if self.insert(&K::from(key), record_id_for_key(key))? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Removes every integer key found in the file. Returns the number of
    /// keys processed.
    pub fn remove_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let contents = std::fs::read_to_string(path)?;
        let mut removed = 0;
        for token in contents.split_whitespace() {
            let key = parse_key(token)?;
            self.remove(&K::from(key))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Applies a mixed workload: tokens come in `i <key>` / `d <key>`
    /// pairs. Returns the number of operations applied.
    pub fn batch_ops_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let contents = std::fs::read_to_string(path)?;
        let mut tokens = contents.split_whitespace();
        let mut applied = 0;
        while let Some(op) = tokens.next() {
            let token = tokens.next().ok_or_else(|| {
                CindraError::Internal(format!("operation '{op}' is missing its key"))
            })?;
            let key = parse_key(token)?;
            match op {
                "i" => {
                    self.insert(&K::from(key), record_id_for_key(key))?;
                }
                "d" => {
                    self.remove(&K::from(key))?;
                }
                other => {
                    return Err(CindraError::Internal(format!(
                        "unknown batch operation '{other}'"
                    )));
                }
            }
            applied += 1;
        }
        Ok(applied)
    }
}
