/// Pipeline Module
///
/// Orchestrates the harvesting cycle: Fetch → Stage → Compute → Load → Advance → Cleanup.
/// A cycle either commits completely (snapshot appended, then cursor advanced) or
/// is treated as not having happened. Staging artifacts never outlive their cycle.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::db::ProgressStore;
use crate::error::{AdapterFailure, HarvestError, Result};
use crate::etl::{AdapterInvoker, BlockSource, Committed, CycleArtifacts, SnapshotLoader, StagingArea};
use crate::models::{BlockBatch, ProgressCursor, TableTarget};

/// Pipeline execution statistics
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub cycles_committed: usize,
    pub blocks_processed: usize,
    pub rows_appended: usize,
    pub partitions_written: usize,
    pub last_block: Option<u64>,
    pub elapsed_time: Duration,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks_per_second(&self) -> f64 {
        let secs = self.elapsed_time.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.blocks_processed as f64 / secs
        }
    }

    fn record(&mut self, report: &CycleReport) {
        self.cycles_committed += 1;
        self.blocks_processed += report.blocks;
        self.rows_appended += report.rows;
        self.partitions_written += report.partitions;
        self.last_block = Some(report.last_block);
    }
}

/// States of one harvesting cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Fetching,
    Staging,
    Computing,
    Loading,
    Advancing,
    Cleanup,
    Done,
    Failed,
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleState::Idle => write!(f, "Idle"),
            CycleState::Fetching => write!(f, "Fetching"),
            CycleState::Staging => write!(f, "Staging"),
            CycleState::Computing => write!(f, "Computing"),
            CycleState::Loading => write!(f, "Loading"),
            CycleState::Advancing => write!(f, "Advancing"),
            CycleState::Cleanup => write!(f, "Cleanup"),
            CycleState::Done => write!(f, "Done"),
            CycleState::Failed => write!(f, "Failed"),
        }
    }
}

/// What a committed cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub blocks: usize,
    pub first_block: u64,
    pub last_block: u64,
    pub rows: usize,
    pub partitions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Committed(CycleReport),
    /// The fetcher returned an empty batch
    Exhausted,
}

/// Result of a fetch-only run
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Staged { path: PathBuf, first_block: u64, last_block: u64 },
    Exhausted,
}

/// Harvesting orchestrator for one protocol
pub struct Orchestrator {
    protocol: String,
    partition_column: String,
    target: TableTarget,
    staging: StagingArea,
    progress: Arc<dyn ProgressStore>,
    fetcher: Arc<dyn BlockSource>,
    adapter: Arc<dyn AdapterInvoker>,
    loader: Arc<dyn SnapshotLoader>,
    state: CycleState,
}

impl Orchestrator {
    /// Create a new orchestrator instance
    pub fn new(
        config: &Config,
        protocol: impl Into<String>,
        progress: Arc<dyn ProgressStore>,
        fetcher: Arc<dyn BlockSource>,
        adapter: Arc<dyn AdapterInvoker>,
        loader: Arc<dyn SnapshotLoader>,
    ) -> Self {
        let protocol = protocol.into();

        Self {
            partition_column: config.partition_column.clone(),
            target: TableTarget::for_protocol(&config.chain_name, &protocol, &config.storage_root),
            staging: StagingArea::new(&config.staging_dir, &protocol),
            protocol,
            progress,
            fetcher,
            adapter,
            loader,
            state: CycleState::Idle,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn target(&self) -> &TableTarget {
        &self.target
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    fn enter(&mut self, next: CycleState) {
        tracing::debug!(protocol = %self.protocol, "{} -> {}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: HarvestError) -> HarvestError {
        self.report(&err);
        self.state = CycleState::Failed;
        err
    }

    fn report(&self, err: &HarvestError) {
        tracing::error!(
            protocol = %self.protocol,
            state = %self.state,
            kind = err.kind(),
            retryable = err.is_retryable(),
            operator_attention = err.needs_operator(),
            "Cycle failed: {}",
            err
        );
    }

    /// Run cycles until history is exhausted. The first failure stops the run.
    pub async fn run_all(&mut self) -> Result<RunStats> {
        let start_time = Instant::now();
        let mut stats = RunStats::new();

        tracing::info!("Starting continuous harvest for {} into {}", self.protocol, self.target.qualified_name());

        loop {
            match self.run_cycle().await? {
                CycleOutcome::Committed(report) => {
                    stats.record(&report);
                    println!(
                        "   📊 Cycle {}: blocks {}..={} | {} rows | {} partitions",
                        stats.cycles_committed, report.first_block, report.last_block, report.rows, report.partitions
                    );
                }
                CycleOutcome::Exhausted => break,
            }
        }

        stats.elapsed_time = start_time.elapsed();
        self.print_final_stats(&stats);

        Ok(stats)
    }

    /// One full fetch → compute → load → advance cycle
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.enter(CycleState::Fetching);

        let fetched = self.fetch().await;
        let (cursor, batch) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => return Err(self.fail(e)),
        };

        if batch.is_empty() {
            tracing::info!("No more blocks to fetch for {}", self.protocol);
            self.enter(CycleState::Done);
            return Ok(CycleOutcome::Exhausted);
        }

        self.enter(CycleState::Staging);
        let artifacts = match self.staging.stage(&batch) {
            Ok(artifacts) => artifacts,
            Err(e) => return Err(self.fail(e)),
        };

        let committed = self.compute_load_advance(&cursor, &batch, &artifacts).await;
        if let Err(e) = &committed {
            self.report(e);
        }

        self.enter(CycleState::Cleanup);
        artifacts.cleanup();

        match committed {
            Ok(report) => {
                self.enter(CycleState::Idle);
                Ok(CycleOutcome::Committed(report))
            }
            Err(e) => {
                self.enter(CycleState::Failed);
                Err(e)
            }
        }
    }

    async fn fetch(&self) -> Result<(ProgressCursor, BlockBatch)> {
        let cursor = self.progress.read(&self.protocol).await?;
        tracing::info!("Resuming {} after block {:?}", self.protocol, cursor.last_block_number);

        let batch = self.fetcher.next_batch(&cursor).await?;
        Ok((cursor, batch))
    }

    async fn compute_load_advance(
        &mut self,
        cursor: &ProgressCursor,
        batch: &BlockBatch,
        artifacts: &CycleArtifacts,
    ) -> Result<CycleReport> {
        let (first_block, last_block) =
            batch.span().ok_or_else(|| HarvestError::InvalidBatch("cannot compute an empty batch".into()))?;

        self.enter(CycleState::Computing);
        let run = self.adapter.run(artifacts).await?;
        if !run.success() {
            tracing::error!("Adapter stderr:\n{}", run.stderr_tail());
            return Err(AdapterFailure::NonZeroExit { code: run.exit_code, stderr_tail: run.stderr_tail() }.into());
        }

        self.enter(CycleState::Loading);
        let committed =
            self.loader.append(&run.output, &self.partition_column, &self.target, Some((first_block, last_block))).await?;

        self.enter(CycleState::Advancing);
        let next = cursor.advanced_to(last_block)?;
        self.progress.write(&next).await?;
        tracing::info!("Cursor for {} advanced to {}", self.protocol, last_block);

        Ok(CycleReport {
            blocks: batch.len(),
            first_block,
            last_block,
            rows: committed.rows,
            partitions: committed.partitions.len(),
        })
    }

    /// Fetch the next batch and leave it staged for a separate adapter run.
    /// The cursor is not touched.
    pub async fn fetch_only(&mut self) -> Result<FetchOutcome> {
        self.enter(CycleState::Fetching);

        let fetched = self.fetch().await;
        let (_, batch) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => return Err(self.fail(e)),
        };

        let Some((first_block, last_block)) = batch.span() else {
            tracing::info!("No more blocks to fetch for {}", self.protocol);
            self.enter(CycleState::Done);
            return Ok(FetchOutcome::Exhausted);
        };

        self.enter(CycleState::Staging);
        let path = match self.staging.stage(&batch) {
            Ok(artifacts) => artifacts.keep(),
            Err(e) => return Err(self.fail(e)),
        };

        tracing::info!("Blocks {}..={} staged at {}", first_block, last_block, path.display());
        self.enter(CycleState::Done);
        Ok(FetchOutcome::Staged { path, first_block, last_block })
    }

    /// Load an existing adapter output without running the adapter.
    ///
    /// When the staged batch from a fetch-only run is still present, the cursor
    /// advances to its last block and both artifacts are removed. On failure the
    /// artifacts stay so the load can be retried.
    pub async fn load_only(&mut self) -> Result<Committed> {
        let artifacts = self.staging.adopt();

        match self.load_existing(&artifacts).await {
            Ok(committed) => {
                self.enter(CycleState::Cleanup);
                artifacts.cleanup();
                self.enter(CycleState::Done);
                Ok(committed)
            }
            Err(e) => {
                artifacts.keep();
                Err(self.fail(e))
            }
        }
    }

    async fn load_existing(&mut self, artifacts: &CycleArtifacts) -> Result<Committed> {
        let span = self.staging.read_staged_batch()?.and_then(|batch| batch.span());

        self.enter(CycleState::Loading);
        let committed =
            self.loader.append(artifacts.output_path(), &self.partition_column, &self.target, span).await?;

        match span {
            Some((_, last_block)) => {
                self.enter(CycleState::Advancing);
                let cursor = self.progress.read(&self.protocol).await?;
                self.progress.write(&cursor.advanced_to(last_block)?).await?;
                tracing::info!("Cursor for {} advanced to {}", self.protocol, last_block);
            }
            None => tracing::warn!(
                "No staged batch at {}, cursor for {} left unchanged",
                self.staging.input_path().display(),
                self.protocol
            ),
        }

        Ok(committed)
    }

    /// Print final statistics
    fn print_final_stats(&self, stats: &RunStats) {
        println!("\n📊 Harvest Statistics ({}):", self.protocol);
        println!("   ⏱️  Total time: {:.2}s", stats.elapsed_time.as_secs_f64());
        println!("   🔁 Cycles committed: {}", stats.cycles_committed);
        println!("   📦 Blocks processed: {}", stats.blocks_processed);
        println!("   💾 Rows appended: {} ({} partitions)", stats.rows_appended, stats.partitions_written);
        if let Some(last) = stats.last_block {
            println!("   📍 Cursor: {}", last);
        }
        println!("   ⚡ Speed: {:.2} blocks/sec", stats.blocks_per_second());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::progress::memory::MemoryProgressStore;
    use crate::etl::adapter::AdapterRun;
    use crate::etl::extract::{fake::FakeChain, BlockRangeFetcher, FetchSettings};
    use crate::models::BlockRecord;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    /// Hands out the queued batches in order, then empty batches. Records every cursor it saw.
    #[derive(Default)]
    struct ScriptedSource {
        batches: Mutex<Vec<BlockBatch>>,
        requests: Mutex<Vec<Option<u64>>>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<BlockBatch>) -> Self {
            Self { batches: Mutex::new(batches), requests: Mutex::default() }
        }

        fn requests(&self) -> Vec<Option<u64>> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BlockSource for ScriptedSource {
        async fn next_batch(&self, cursor: &ProgressCursor) -> Result<BlockBatch> {
            self.requests.lock().unwrap().push(cursor.last_block_number);
            let mut batches = self.batches.lock().unwrap();
            Ok(if batches.is_empty() { BlockBatch::empty() } else { batches.remove(0) })
        }
    }

    enum Behaviour {
        /// exit 0 after writing `rows` rows with a timestamp column
        Succeed { rows: usize },
        Exit(i32),
        TimeOut,
        /// exit 0 without writing any output
        Silent,
    }

    struct FakeAdapter {
        behaviour: Behaviour,
        /// whether the staged batch existed when the adapter ran
        saw_input: Mutex<Vec<bool>>,
    }

    impl FakeAdapter {
        fn new(behaviour: Behaviour) -> Self {
            Self { behaviour, saw_input: Mutex::default() }
        }
    }

    #[async_trait]
    impl AdapterInvoker for FakeAdapter {
        async fn run(&self, staged: &CycleArtifacts) -> Result<AdapterRun> {
            self.saw_input.lock().unwrap().push(staged.input_path().exists());

            let exit_code = match self.behaviour {
                Behaviour::Succeed { rows } => {
                    let mut body = String::from("user,lpvalue,timestamp\n");
                    for i in 0..rows {
                        body.push_str(&format!("0x{:02x},{},1711000000\n", i, i * 10));
                    }
                    std::fs::write(staged.output_path(), body).unwrap();
                    0
                }
                Behaviour::Exit(code) => {
                    std::fs::write(staged.output_path(), "partial").unwrap();
                    code
                }
                Behaviour::TimeOut => {
                    return Err(AdapterFailure::TimedOut(Duration::from_secs(1)).into());
                }
                Behaviour::Silent => 0,
            };

            Ok(AdapterRun {
                exit_code: Some(exit_code),
                output: staged.output_path().to_path_buf(),
                stdout: String::new(),
                stderr: "boom".into(),
                elapsed: Duration::ZERO,
            })
        }
    }

    /// Counts appended rows without touching storage, optionally rejecting appends
    #[derive(Default)]
    struct RecordingLoader {
        reject: bool,
        appended: Mutex<Vec<(usize, Option<(u64, u64)>)>>,
    }

    #[async_trait]
    impl SnapshotLoader for RecordingLoader {
        async fn append(
            &self,
            artifact: &Path,
            partition_column: &str,
            _target: &TableTarget,
            batch_span: Option<(u64, u64)>,
        ) -> Result<Committed> {
            let body = std::fs::read_to_string(artifact).map_err(|e| HarvestError::artifact(artifact, e.to_string()))?;
            let mut lines = body.lines();
            let header = lines.next().unwrap_or_default();
            if !header.split(',').any(|c| c == partition_column) {
                return Err(HarvestError::artifact(artifact, "missing partition column"));
            }
            if self.reject {
                return Err(HarvestError::StorageCommitFailure("catalog rejected append".into()));
            }

            let rows = lines.count();
            self.appended.lock().unwrap().push((rows, batch_span));
            Ok(Committed { rows, partitions: vec!["1711000000".into()], files: Vec::new() })
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        config: Config,
        progress: Arc<MemoryProgressStore>,
    }

    impl Harness {
        fn new(progress: MemoryProgressStore) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = Config {
                chain_name: "linea".into(),
                rpc_url: "http://localhost:8545".into(),
                log_level: crate::config::LogLevel::Info,
                partition_column: "timestamp".into(),
                staging_dir: dir.path().join("adapters"),
                storage_root: dir.path().join("warehouse"),
                progress_dir: dir.path().join("progress"),
                database_url: None,
                adapter_command: "true".into(),
                adapter_timeout: Duration::from_secs(1),
                batch_size: 11,
                block_stride: 1,
                start_block: 100,
                confirmations: 0,
                max_retries: 0,
                retry_delay: Duration::from_millis(1),
                rpc_timeout: Duration::from_secs(1),
            };
            Self { _dir: dir, config, progress: Arc::new(progress) }
        }

        fn orchestrator(
            &self,
            fetcher: Arc<dyn BlockSource>,
            adapter: Arc<dyn AdapterInvoker>,
            loader: Arc<dyn SnapshotLoader>,
        ) -> Orchestrator {
            Orchestrator::new(&self.config, "x", self.progress.clone(), fetcher, adapter, loader)
        }
    }

    fn blocks(range: std::ops::RangeInclusive<u64>) -> BlockBatch {
        BlockBatch::new(range.map(|n| BlockRecord::new(n, 1_711_000_000 + n)).collect()).unwrap()
    }

    fn assert_no_artifacts(orchestrator: &Orchestrator) {
        assert!(!orchestrator.staging().input_path().exists());
        assert!(!orchestrator.staging().output_path().exists());
    }

    #[tokio::test]
    async fn test_first_cycle_commits_and_next_fetch_resumes() {
        let harness = Harness::new(MemoryProgressStore::default());
        let source = Arc::new(ScriptedSource::new(vec![blocks(100..=110)]));
        let adapter = Arc::new(FakeAdapter::new(Behaviour::Succeed { rows: 5 }));
        let loader = Arc::new(RecordingLoader::default());
        let mut orchestrator = harness.orchestrator(source.clone(), adapter.clone(), loader.clone());

        let outcome = orchestrator.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Committed(CycleReport { blocks: 11, first_block: 100, last_block: 110, rows: 5, partitions: 1 })
        );
        assert_eq!(harness.progress.last_block("x"), Some(110));
        assert_eq!(loader.appended.lock().unwrap().as_slice(), &[(5, Some((100, 110)))]);
        assert_eq!(adapter.saw_input.lock().unwrap().as_slice(), &[true]);
        assert_no_artifacts(&orchestrator);
        assert_eq!(orchestrator.state(), CycleState::Idle);

        // next cycle asks from the committed boundary
        assert_eq!(orchestrator.run_cycle().await.unwrap(), CycleOutcome::Exhausted);
        assert_eq!(source.requests(), vec![None, Some(110)]);
    }

    #[tokio::test]
    async fn test_next_fetch_starts_after_committed_block() {
        let harness = Harness::new(MemoryProgressStore::default());
        let fetcher = Arc::new(BlockRangeFetcher::new(
            Arc::new(FakeChain::new(130)),
            FetchSettings { batch_size: 11, start_block: 100, ..FetchSettings::default() },
        ));
        let mut orchestrator = harness.orchestrator(
            fetcher.clone(),
            Arc::new(FakeAdapter::new(Behaviour::Succeed { rows: 5 })),
            Arc::new(RecordingLoader::default()),
        );

        orchestrator.run_cycle().await.unwrap();
        assert_eq!(harness.progress.last_block("x"), Some(110));

        let next = fetcher.next_batch(&harness.progress.read("x").await.unwrap()).await.unwrap();
        assert_eq!(next.first_block(), Some(111));
    }

    #[tokio::test]
    async fn test_continuous_run_until_exhausted() {
        let harness = Harness::new(MemoryProgressStore::default());
        let source = Arc::new(ScriptedSource::new(vec![blocks(100..=110), blocks(111..=121), blocks(122..=125)]));
        let mut orchestrator = harness.orchestrator(
            source.clone(),
            Arc::new(FakeAdapter::new(Behaviour::Succeed { rows: 2 })),
            Arc::new(RecordingLoader::default()),
        );

        let stats = orchestrator.run_all().await.unwrap();
        assert_eq!(stats.cycles_committed, 3);
        assert_eq!(stats.blocks_processed, 26);
        assert_eq!(stats.rows_appended, 6);
        assert_eq!(stats.last_block, Some(125));
        assert_eq!(harness.progress.last_block("x"), Some(125));
        assert_eq!(source.requests(), vec![None, Some(110), Some(121), Some(125)]);
        assert_eq!(orchestrator.state(), CycleState::Done);
        assert_no_artifacts(&orchestrator);
    }

    #[tokio::test]
    async fn test_empty_batch_leaves_cursor_untouched() {
        let harness = Harness::new(MemoryProgressStore::with_cursor(ProgressCursor::at("x", 110)));
        let mut orchestrator = harness.orchestrator(
            Arc::new(ScriptedSource::default()),
            Arc::new(FakeAdapter::new(Behaviour::Succeed { rows: 1 })),
            Arc::new(RecordingLoader::default()),
        );

        let stats = orchestrator.run_all().await.unwrap();
        assert_eq!(stats.cycles_committed, 0);
        assert_eq!(harness.progress.last_block("x"), Some(110));
        assert_eq!(harness.progress.write_count(), 0);
        assert_eq!(orchestrator.state(), CycleState::Done);
    }

    #[tokio::test]
    async fn test_adapter_failure_keeps_cursor_and_removes_artifacts() {
        let harness = Harness::new(MemoryProgressStore::with_cursor(ProgressCursor::at("x", 99)));
        let loader = Arc::new(RecordingLoader::default());
        let mut orchestrator = harness.orchestrator(
            Arc::new(ScriptedSource::new(vec![blocks(100..=110), blocks(111..=120)])),
            Arc::new(FakeAdapter::new(Behaviour::Exit(1))),
            loader.clone(),
        );

        let err = orchestrator.run_all().await.unwrap_err();
        assert!(matches!(err, HarvestError::AdapterFailure(AdapterFailure::NonZeroExit { code: Some(1), .. })));
        assert_eq!(harness.progress.last_block("x"), Some(99));
        assert!(loader.appended.lock().unwrap().is_empty());
        assert_eq!(orchestrator.state(), CycleState::Failed);
        assert_no_artifacts(&orchestrator);
    }

    #[tokio::test]
    async fn test_adapter_timeout_fails_cycle() {
        let harness = Harness::new(MemoryProgressStore::with_cursor(ProgressCursor::at("x", 99)));
        let mut orchestrator = harness.orchestrator(
            Arc::new(ScriptedSource::new(vec![blocks(100..=110)])),
            Arc::new(FakeAdapter::new(Behaviour::TimeOut)),
            Arc::new(RecordingLoader::default()),
        );

        let err = orchestrator.run_all().await.unwrap_err();
        assert!(matches!(err, HarvestError::AdapterFailure(AdapterFailure::TimedOut(_))));
        assert_eq!(harness.progress.last_block("x"), Some(99));
        assert_no_artifacts(&orchestrator);
    }

    #[tokio::test]
    async fn test_missing_output_is_artifact_error() {
        let harness = Harness::new(MemoryProgressStore::default());
        let mut orchestrator = harness.orchestrator(
            Arc::new(ScriptedSource::new(vec![blocks(100..=110)])),
            Arc::new(FakeAdapter::new(Behaviour::Silent)),
            Arc::new(RecordingLoader::default()),
        );

        let err = orchestrator.run_cycle().await.unwrap_err();
        assert!(err.needs_operator());
        assert_eq!(harness.progress.last_block("x"), None);
        assert_no_artifacts(&orchestrator);
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_cursor() {
        let harness = Harness::new(MemoryProgressStore::default());
        let mut orchestrator = harness.orchestrator(
            Arc::new(ScriptedSource::new(vec![blocks(100..=110)])),
            Arc::new(FakeAdapter::new(Behaviour::Succeed { rows: 3 })),
            Arc::new(RecordingLoader { reject: true, ..RecordingLoader::default() }),
        );

        let err = orchestrator.run_cycle().await.unwrap_err();
        assert!(matches!(err, HarvestError::StorageCommitFailure(_)));
        assert_eq!(harness.progress.write_count(), 0);
        assert_no_artifacts(&orchestrator);
    }

    #[tokio::test]
    async fn test_chain_unavailable_aborts_before_staging() {
        let harness = Harness::new(MemoryProgressStore::with_cursor(ProgressCursor::at("x", 10)));
        let adapter = Arc::new(FakeAdapter::new(Behaviour::Succeed { rows: 1 }));
        let fetcher = Arc::new(BlockRangeFetcher::new(
            Arc::new(FakeChain::failing(500, 5)),
            FetchSettings { max_retries: 1, retry_delay: Duration::from_millis(1), ..FetchSettings::default() },
        ));
        let mut orchestrator = harness.orchestrator(fetcher, adapter.clone(), Arc::new(RecordingLoader::default()));

        let err = orchestrator.run_all().await.unwrap_err();
        assert!(matches!(err, HarvestError::ChainUnavailable(_)));
        assert!(adapter.saw_input.lock().unwrap().is_empty());
        assert_eq!(harness.progress.last_block("x"), Some(10));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_releases_artifacts() {
        struct HangingAdapter;

        #[async_trait]
        impl AdapterInvoker for HangingAdapter {
            async fn run(&self, _staged: &CycleArtifacts) -> Result<AdapterRun> {
                std::future::pending().await
            }
        }

        let harness = Harness::new(MemoryProgressStore::default());
        let mut orchestrator = harness.orchestrator(
            Arc::new(ScriptedSource::new(vec![blocks(100..=110)])),
            Arc::new(HangingAdapter),
            Arc::new(RecordingLoader::default()),
        );

        let cancelled = tokio::time::timeout(Duration::from_millis(50), orchestrator.run_cycle()).await;
        assert!(cancelled.is_err());
        assert_eq!(orchestrator.state(), CycleState::Computing);
        assert_no_artifacts(&orchestrator);
        assert_eq!(harness.progress.last_block("x"), None);
    }

    #[tokio::test]
    async fn test_fetch_then_load_only() {
        let harness = Harness::new(MemoryProgressStore::with_cursor(ProgressCursor::at("x", 99)));
        let loader = Arc::new(RecordingLoader::default());
        let mut orchestrator = harness.orchestrator(
            Arc::new(ScriptedSource::new(vec![blocks(100..=110)])),
            Arc::new(FakeAdapter::new(Behaviour::Exit(1))),
            loader.clone(),
        );

        let outcome = orchestrator.fetch_only().await.unwrap();
        let FetchOutcome::Staged { path, first_block, last_block } = outcome else {
            panic!("expected a staged batch");
        };
        assert_eq!((first_block, last_block), (100, 110));
        assert!(path.exists());
        assert_eq!(harness.progress.last_block("x"), Some(99));

        // adapter run out of band
        std::fs::write(orchestrator.staging().output_path(), "user,timestamp\n0xa,1\n0xb,1\n").unwrap();

        let committed = orchestrator.load_only().await.unwrap();
        assert_eq!(committed.rows, 2);
        assert_eq!(loader.appended.lock().unwrap().as_slice(), &[(2, Some((100, 110)))]);
        assert_eq!(harness.progress.last_block("x"), Some(110));
        assert_no_artifacts(&orchestrator);
    }

    #[tokio::test]
    async fn test_load_only_failure_keeps_artifacts() {
        let harness = Harness::new(MemoryProgressStore::default());
        let mut orchestrator = harness.orchestrator(
            Arc::new(ScriptedSource::default()),
            Arc::new(FakeAdapter::new(Behaviour::Silent)),
            Arc::new(RecordingLoader::default()),
        );
        let output = orchestrator.staging().output_path().to_path_buf();
        std::fs::create_dir_all(output.parent().unwrap()).unwrap();
        std::fs::write(&output, "user,lpvalue\n0xa,1\n").unwrap();

        let err = orchestrator.load_only().await.unwrap_err();
        assert!(err.needs_operator());
        assert!(output.exists());
        assert_eq!(orchestrator.state(), CycleState::Failed);
    }

    #[tokio::test]
    async fn test_load_only_without_staged_batch_keeps_cursor() {
        let harness = Harness::new(MemoryProgressStore::with_cursor(ProgressCursor::at("x", 50)));
        let mut orchestrator = harness.orchestrator(
            Arc::new(ScriptedSource::default()),
            Arc::new(FakeAdapter::new(Behaviour::Silent)),
            Arc::new(RecordingLoader::default()),
        );
        let output = orchestrator.staging().output_path().to_path_buf();
        std::fs::create_dir_all(output.parent().unwrap()).unwrap();
        std::fs::write(&output, "user,timestamp\n0xa,1\n").unwrap();

        orchestrator.load_only().await.unwrap();
        assert_eq!(harness.progress.last_block("x"), Some(50));
        assert_eq!(harness.progress.write_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_only_when_exhausted_stages_nothing() {
        let harness = Harness::new(MemoryProgressStore::default());
        let mut orchestrator = harness.orchestrator(
            Arc::new(ScriptedSource::default()),
            Arc::new(FakeAdapter::new(Behaviour::Silent)),
            Arc::new(RecordingLoader::default()),
        );

        assert_eq!(orchestrator.fetch_only().await.unwrap(), FetchOutcome::Exhausted);
        assert!(!orchestrator.staging().input_path().exists());
    }

    #[test]
    fn test_blocks_per_second() {
        let stats = RunStats { blocks_processed: 10, elapsed_time: Duration::from_secs(2), ..RunStats::new() };
        assert_eq!(stats.blocks_per_second(), 5.0);
        assert_eq!(RunStats::new().blocks_per_second(), 0.0);
    }
}
