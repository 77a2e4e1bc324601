/// ETL Module
///
/// The stages of one harvesting cycle:
/// - Extract: fetch the next block batch after the cursor from the chain RPC
/// - Stage: hand the batch to the protocol adapter through the filesystem
/// - Adapter: run the external TVL computation under a timeout
/// - Load: append the adapter output to the partitioned snapshot table
pub mod adapter;
pub mod extract;
pub mod load;
pub mod stage;

pub use adapter::{AdapterInvoker, ShellAdapter};
pub use extract::{BlockRangeFetcher, BlockSource, FetchSettings};
pub use load::{Committed, ParquetTableLoader, SnapshotLoader};
pub use stage::{CycleArtifacts, StagingArea};
