/// Stage Module
///
/// Files exchanged with the protocol adapter. The staged block batch and the
/// adapter's output live only for one cycle: `CycleArtifacts` removes both
/// when the cycle ends, whether it committed, failed, or was cancelled.
use arrow::array::{Array, ArrayRef, AsArray, UInt64Array};
use arrow::compute::cast;
use arrow::csv::{reader::Format, ReaderBuilder, WriterBuilder};
use arrow::datatypes::{DataType, Field, Schema, UInt64Type};
use arrow::record_batch::RecordBatch;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{HarvestError, Result};
use crate::models::{BlockBatch, BlockRecord};

/// Where the adapter reads its blocks, relative to its working directory
pub const STAGED_BATCH_FILE: &str = "src/hourly_blocks.csv";
/// Where the adapter writes its result, relative to its working directory
pub const ADAPTER_OUTPUT_FILE: &str = "outputData.csv";

/// Fixed artifact locations for one protocol's adapter
#[derive(Debug, Clone)]
pub struct StagingArea {
    workdir: PathBuf,
    input: PathBuf,
    output: PathBuf,
}

impl StagingArea {
    pub fn new(staging_dir: &Path, protocol: &str) -> Self {
        let workdir = staging_dir.join(protocol);
        Self { input: workdir.join(STAGED_BATCH_FILE), output: workdir.join(ADAPTER_OUTPUT_FILE), workdir }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// Write `batch` for the adapter and take ownership of this cycle's artifacts.
    ///
    /// A leftover output file from an earlier run is removed first so it can never
    /// be mistaken for the output of this cycle.
    pub fn stage(&self, batch: &BlockBatch) -> Result<CycleArtifacts> {
        match std::fs::remove_file(&self.output) {
            Ok(()) => tracing::warn!("Removed stale adapter output {}", self.output.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(HarvestError::Staging { path: self.output.clone(), source: e }),
        }

        let artifacts = self.adopt();
        write_batch_csv(&self.input, batch)?;

        tracing::debug!("Staged {} blocks at {}", batch.len(), self.input.display());
        Ok(artifacts)
    }

    /// Take ownership of whatever artifacts already exist (load-only runs).
    pub fn adopt(&self) -> CycleArtifacts {
        CycleArtifacts { workdir: self.workdir.clone(), input: self.input.clone(), output: self.output.clone(), armed: true }
    }

    /// The staged batch left by a fetch-only run, if any
    pub fn read_staged_batch(&self) -> Result<Option<BlockBatch>> {
        if !self.input.exists() {
            return Ok(None);
        }
        read_batch_csv(&self.input).map(Some)
    }
}

/// Scoped ownership of one cycle's staging files. Dropping it deletes them.
#[derive(Debug)]
pub struct CycleArtifacts {
    workdir: PathBuf,
    input: PathBuf,
    output: PathBuf,
    armed: bool,
}

impl CycleArtifacts {
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// Leave the files in place, returning the staged batch path
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        self.input.clone()
    }

    pub fn cleanup(mut self) {
        self.remove_all();
    }

    fn remove_all(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        for path in [&self.input, &self.output] {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!("Removed {}", path.display()),
                // adapter may have failed before writing output
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!("Nothing to remove at {}", path.display())
                }
                Err(e) => tracing::warn!("Failed to remove staging artifact {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for CycleArtifacts {
    fn drop(&mut self) {
        self.remove_all();
    }
}

fn batch_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("block_number", DataType::UInt64, false),
        // same value under the name adapters read
        Field::new("number", DataType::UInt64, false),
        Field::new("timestamp", DataType::UInt64, false),
    ]))
}

/// Write `batch` as CSV with header `block_number,number,timestamp`
pub fn write_batch_csv(path: &Path, batch: &BlockBatch) -> Result<()> {
    let staging_err = |source: std::io::Error| HarvestError::Staging { path: path.to_path_buf(), source };
    let arrow_err = |e: arrow::error::ArrowError| staging_err(std::io::Error::new(ErrorKind::Other, e.to_string()));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(staging_err)?;
    }

    let numbers: ArrayRef = Arc::new(UInt64Array::from_iter_values(batch.records().iter().map(|r| r.block_number)));
    let timestamps: ArrayRef = Arc::new(UInt64Array::from_iter_values(batch.records().iter().map(|r| r.timestamp)));
    let record_batch =
        RecordBatch::try_new(batch_schema(), vec![numbers.clone(), numbers, timestamps]).map_err(arrow_err)?;

    let mut out = BufWriter::new(File::create(path).map_err(staging_err)?);
    {
        let mut writer = WriterBuilder::new().with_header(true).build(&mut out);
        writer.write(&record_batch).map_err(arrow_err)?;
    }
    out.flush().map_err(staging_err)?;

    Ok(())
}

/// Read a staged batch back. Accepts `number` when `block_number` is absent.
pub fn read_batch_csv(path: &Path) -> Result<BlockBatch> {
    let artifact_err = |message: String| HarvestError::artifact(path, message);

    let open = || File::open(path).map_err(|e| artifact_err(e.to_string()));
    let (schema, _) = Format::default()
        .with_header(true)
        .infer_schema(open()?, None)
        .map_err(|e| artifact_err(e.to_string()))?;

    let number_column = ["block_number", "number"]
        .into_iter()
        .find(|name| schema.column_with_name(name).is_some())
        .ok_or_else(|| artifact_err("missing block_number column".into()))?;
    if schema.column_with_name("timestamp").is_none() {
        return Err(artifact_err("missing timestamp column".into()));
    }

    let reader = ReaderBuilder::new(Arc::new(schema))
        .with_header(true)
        .build(open()?)
        .map_err(|e| artifact_err(e.to_string()))?;

    let mut records = Vec::new();
    for chunk in reader {
        let chunk = chunk.map_err(|e| artifact_err(e.to_string()))?;
        let numbers = u64_column(&chunk, number_column).map_err(artifact_err)?;
        let timestamps = u64_column(&chunk, "timestamp").map_err(artifact_err)?;

        records.extend(numbers.values().iter().zip(timestamps.values().iter()).map(|(n, t)| BlockRecord::new(*n, *t)));
    }

    BlockBatch::new(records)
}

fn u64_column(chunk: &RecordBatch, name: &str) -> std::result::Result<UInt64Array, String> {
    let column = chunk.column_by_name(name).ok_or_else(|| format!("missing {} column", name))?;
    let column = cast(column, &DataType::UInt64).map_err(|e| format!("column {}: {}", name, e))?;
    if column.null_count() > 0 {
        return Err(format!("column {} has empty or negative values", name));
    }
    Ok(column.as_primitive::<UInt64Type>().clone())
}
