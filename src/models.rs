/// Data Models Module
///
/// This module defines the core data structures passed between the stages of a
/// harvesting cycle: the block batch handed to the adapter, the persisted
/// progress cursor, and the destination table of the loaded snapshots.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HarvestError, Result};

/// A block number paired with its timestamp (unix seconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub block_number: u64,
    pub timestamp: u64,
}

impl BlockRecord {
    pub fn new(block_number: u64, timestamp: u64) -> Self {
        Self { block_number, timestamp }
    }

    pub fn block_time(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.timestamp).ok().and_then(|ts| DateTime::from_timestamp(ts, 0))
    }
}

/// Ordered blocks for one cycle. Block numbers are strictly increasing; an empty
/// batch means there is nothing left to harvest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockBatch {
    records: Vec<BlockRecord>,
}

impl BlockBatch {
    pub fn new(records: Vec<BlockRecord>) -> Result<Self> {
        if let Some(pair) = records.windows(2).find(|w| w[1].block_number <= w[0].block_number) {
            return Err(HarvestError::InvalidBatch(format!(
                "block {} follows block {}",
                pair[1].block_number, pair[0].block_number
            )));
        }
        Ok(Self { records })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[BlockRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_block(&self) -> Option<u64> {
        self.records.first().map(|r| r.block_number)
    }

    pub fn last_block(&self) -> Option<u64> {
        self.records.last().map(|r| r.block_number)
    }

    /// `(first, last)` block numbers of a non-empty batch
    pub fn span(&self) -> Option<(u64, u64)> {
        self.first_block().zip(self.last_block())
    }
}

/// Persisted high-water mark for one protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCursor {
    pub protocol: String,
    pub last_block_number: Option<u64>,
}

impl ProgressCursor {
    /// Cursor for a protocol that has never committed a cycle
    pub fn absent(protocol: impl Into<String>) -> Self {
        Self { protocol: protocol.into(), last_block_number: None }
    }

    pub fn at(protocol: impl Into<String>, block_number: u64) -> Self {
        Self { protocol: protocol.into(), last_block_number: Some(block_number) }
    }

    /// Cursor moved to `block_number`. Moving backwards is refused.
    pub fn advanced_to(&self, block_number: u64) -> Result<Self> {
        match self.last_block_number {
            Some(last) if block_number < last => Err(HarvestError::Progress(format!(
                "refusing to rewind cursor for '{}' from {} to {}",
                self.protocol, last, block_number
            ))),
            _ => Ok(Self::at(self.protocol.clone(), block_number)),
        }
    }
}

/// Destination of the TVL snapshots for one protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub database: String,
    pub table: String,
    pub location: PathBuf,
}

impl TableTarget {
    pub fn for_protocol(chain_name: &str, protocol: &str, storage_root: &Path) -> Self {
        let table = format!("{}_tvl_by_user", protocol);
        let location = storage_root.join("raw").join(chain_name).join(&table);

        Self { database: format!("{}_raw", chain_name), table, location }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

/// Connection status information displayed at startup
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub endpoint: String,
    pub chain_id: u64,
    pub head: u64,
}
