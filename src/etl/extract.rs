/// Extract Module
///
/// Determines the next contiguous batch of blocks after the stored cursor and
/// fetches their timestamps from the chain.
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{HarvestError, Result};
use crate::models::{BlockBatch, ProgressCursor};
use crate::rpc::ChainClient;

/// Source of the next block batch for a cursor
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// An empty batch means the cursor already sits at the confirmed head.
    async fn next_batch(&self, cursor: &ProgressCursor) -> Result<BlockBatch>;
}

/// Range sizing and retry settings
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub batch_size: usize,
    pub block_stride: u64,
    pub start_block: u64,
    pub confirmations: u64,
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl FetchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size,
            block_stride: config.block_stride,
            start_block: config.start_block,
            confirmations: config.confirmations,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            block_stride: 1,
            start_block: 0,
            confirmations: 0,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

pub struct BlockRangeFetcher {
    client: Arc<dyn ChainClient>,
    settings: FetchSettings,
}

impl BlockRangeFetcher {
    pub fn new(client: Arc<dyn ChainClient>, settings: FetchSettings) -> Self {
        Self { client, settings }
    }

    /// First block the next batch should contain
    fn start_for(&self, cursor: &ProgressCursor) -> Option<u64> {
        match cursor.last_block_number {
            Some(last) => last.checked_add(self.settings.block_stride),
            None => Some(self.settings.start_block),
        }
    }

    /// Block numbers of the batch starting at `start`, bounded by `safe_head`
    fn plan(&self, start: u64, safe_head: u64) -> Vec<u64> {
        if start > safe_head {
            return Vec::new();
        }

        (start..=safe_head).step_by(self.settings.block_stride as usize).take(self.settings.batch_size).collect()
    }

    /// Run a chain call, retrying transient failures with linear backoff
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry_count = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(HarvestError::ChainUnavailable(message)) => {
                    retry_count += 1;

                    if retry_count > self.settings.max_retries {
                        return Err(HarvestError::ChainUnavailable(format!(
                            "{} failed after {} retries: {}",
                            what, self.settings.max_retries, message
                        )));
                    }

                    tracing::warn!(
                        "{} failed, retrying ({}/{}): {}",
                        what,
                        retry_count,
                        self.settings.max_retries,
                        message
                    );

                    tokio::time::sleep(self.settings.retry_delay * retry_count as u32).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[async_trait]
impl BlockSource for BlockRangeFetcher {
    async fn next_batch(&self, cursor: &ProgressCursor) -> Result<BlockBatch> {
        let Some(start) = self.start_for(cursor) else {
            return Ok(BlockBatch::empty());
        };

        let head = self.with_retries("eth_blockNumber", || self.client.latest_block_number()).await?;
        let safe_head = head.saturating_sub(self.settings.confirmations);

        let numbers = self.plan(start, safe_head);
        if numbers.is_empty() {
            tracing::info!("Cursor for {} is at the confirmed head ({})", cursor.protocol, safe_head);
            return Ok(BlockBatch::empty());
        }

        let records = self.with_retries("eth_getBlockByNumber", || self.client.block_timestamps(&numbers)).await?;
        let batch = BlockBatch::new(records)?;

        if let (Some(first), Some(last)) = (batch.records().first(), batch.records().last()) {
            tracing::info!(
                "Fetched {} blocks for {}: {} ({}) to {} ({})",
                batch.len(),
                cursor.protocol,
                first.block_number,
                first.block_time().map(|t| t.to_rfc3339()).unwrap_or_default(),
                last.block_number,
                last.block_time().map(|t| t.to_rfc3339()).unwrap_or_default()
            );
        }

        Ok(batch)
    }
}
