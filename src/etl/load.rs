/// Load Module
///
/// Appends the adapter's tabular output to the partitioned snapshot table.
/// Each distinct value of the partition column becomes a Hive-style directory
/// (`{column}={value}`) holding one parquet file per loaded batch.
use arrow::array::{Array, ArrayRef, BooleanArray};
use arrow::compute::filter_record_batch;
use arrow::csv::{reader::Format, ReaderBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use async_trait::async_trait;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{HarvestError, Result};
use crate::models::TableTarget;

/// Parquet key-value metadata key holding `{database}.{table}`
pub const TABLE_METADATA_KEY: &str = "tvl_snapshot_table";

/// Directory name used for rows whose partition value is null
pub const HIVE_DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// Result of a successful append
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Committed {
    pub rows: usize,
    pub partitions: Vec<String>,
    pub files: Vec<PathBuf>,
}

#[async_trait]
pub trait SnapshotLoader: Send + Sync {
    /// Append `artifact` to `target`. `batch_span` identifies the block batch the
    /// artifact was computed from, when known.
    async fn append(
        &self,
        artifact: &Path,
        partition_column: &str,
        target: &TableTarget,
        batch_span: Option<(u64, u64)>,
    ) -> Result<Committed>;
}

#[derive(Debug, Clone)]
pub struct ParquetTableLoader {
    compression: Compression,
}

impl Default for ParquetTableLoader {
    fn default() -> Self {
        Self { compression: Compression::SNAPPY }
    }
}

impl ParquetTableLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn append_blocking(
        &self,
        artifact: &Path,
        partition_column: &str,
        target: &TableTarget,
        batch_span: Option<(u64, u64)>,
    ) -> Result<Committed> {
        let table_schema = existing_table_schema(&target.location)?;
        let (schema, batches) = read_artifact(artifact, partition_column, table_schema.as_deref())?;

        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        if rows == 0 {
            tracing::warn!("Adapter output {} has no rows, nothing to append", artifact.display());
            return Ok(Committed::default());
        }

        let partitions =
            split_by_partition(&batches, partition_column).map_err(|e| HarvestError::artifact(artifact, e.to_string()))?;

        // a known batch span gives a stable name, so reloading the batch replaces its files
        let file_name = match batch_span {
            Some((first, last)) => format!("part-{}-{}.parquet", first, last),
            None => format!("part-{}.parquet", uuid::Uuid::new_v4()),
        };

        let mut committed = Committed { rows, ..Committed::default() };
        for (value, parts) in &partitions {
            let dir = target.location.join(format!("{}={}", partition_column, value));
            let path = self
                .write_partition(&dir, &file_name, schema.clone(), parts, target)
                .map_err(|e| HarvestError::StorageCommitFailure(format!("{}: {}", dir.display(), e)))?;

            committed.partitions.push(value.clone());
            committed.files.push(path);
        }

        tracing::info!(
            "Appended {} rows to {} across {} partitions",
            committed.rows,
            target.qualified_name(),
            committed.partitions.len()
        );
        Ok(committed)
    }

    fn write_partition(
        &self,
        dir: &Path,
        file_name: &str,
        schema: SchemaRef,
        parts: &[RecordBatch],
        target: &TableTarget,
    ) -> std::result::Result<PathBuf, String> {
        std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;

        let tmp = dir.join(format!(".{}.tmp", file_name));
        let path = dir.join(file_name);

        let props = WriterProperties::builder()
            .set_compression(self.compression)
            .set_key_value_metadata(Some(vec![KeyValue::new(TABLE_METADATA_KEY.to_string(), target.qualified_name())]))
            .build();

        let written = (|| -> std::result::Result<(), String> {
            let file = File::create(&tmp).map_err(|e| e.to_string())?;
            let mut writer = ArrowWriter::try_new(file, schema, Some(props)).map_err(|e| e.to_string())?;
            for part in parts {
                writer.write(part).map_err(|e| e.to_string())?;
            }
            let file = writer.into_inner().map_err(|e| e.to_string())?;
            file.sync_all().map_err(|e| e.to_string())?;
            std::fs::rename(&tmp, &path).map_err(|e| e.to_string())
        })();

        if let Err(e) = written {
            if let Err(rm) = std::fs::remove_file(&tmp) {
                tracing::debug!("Could not remove partial file {}: {}", tmp.display(), rm);
            }
            return Err(e);
        }

        Ok(path)
    }
}

#[async_trait]
impl SnapshotLoader for ParquetTableLoader {
    async fn append(
        &self,
        artifact: &Path,
        partition_column: &str,
        target: &TableTarget,
        batch_span: Option<(u64, u64)>,
    ) -> Result<Committed> {
        let loader = self.clone();
        let artifact = artifact.to_path_buf();
        let partition_column = partition_column.to_string();
        let target = target.clone();

        tokio::task::spawn_blocking(move || loader.append_blocking(&artifact, &partition_column, &target, batch_span))
            .await
            .map_err(|e| HarvestError::StorageCommitFailure(format!("load task aborted: {}", e)))?
    }
}

/// Arrow schema of a file already committed under `location`, if the table has any
fn existing_table_schema(location: &Path) -> Result<Option<SchemaRef>> {
    let storage_err = |e: &dyn std::fmt::Display| {
        HarvestError::StorageCommitFailure(format!("reading table schema under {}: {}", location.display(), e))
    };

    let partitions = match std::fs::read_dir(location) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(storage_err(&e)),
    };

    for partition in partitions {
        let partition = partition.map_err(|e| storage_err(&e))?.path();
        if !partition.is_dir() {
            continue;
        }

        for file in std::fs::read_dir(&partition).map_err(|e| storage_err(&e))? {
            let file = file.map_err(|e| storage_err(&e))?.path();
            let committed = file
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("part-") && n.ends_with(".parquet"))
                .unwrap_or(false);
            if !committed || !file.is_file() {
                continue;
            }

            let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(&file).map_err(|e| storage_err(&e))?)
                .map_err(|e| storage_err(&e))?;
            return Ok(Some(builder.schema().clone()));
        }
    }

    Ok(None)
}

/// Column types for this append. Columns the table already has keep the table's
/// type; new integer value columns are widened to `Float64` and untyped (all-empty)
/// columns become `Utf8`, so later appends with fractional or textual values still fit.
fn resolve_schema(inferred: &Schema, table: Option<&Schema>, partition_column: &str) -> Schema {
    let fields: Vec<Field> = inferred
        .fields()
        .iter()
        .map(|field| {
            let data_type = match table.and_then(|t| t.field_with_name(field.name()).ok()) {
                Some(existing) => existing.data_type().clone(),
                None => match field.data_type() {
                    DataType::Null => DataType::Utf8,
                    t if t.is_integer() && field.name() != partition_column => DataType::Float64,
                    t => t.clone(),
                },
            };
            Field::new(field.name(), data_type, true)
        })
        .collect();

    Schema::new(fields)
}

/// Parse the adapter CSV, failing fast when the partition column is missing
fn read_artifact(
    path: &Path,
    partition_column: &str,
    table_schema: Option<&Schema>,
) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let open = || {
        File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HarvestError::artifact(path, "adapter output not found"),
            _ => HarvestError::artifact(path, e.to_string()),
        })
    };

    let (schema, _) = Format::default()
        .with_header(true)
        .infer_schema(open()?, None)
        .map_err(|e| HarvestError::artifact(path, e.to_string()))?;

    if schema.fields().is_empty() {
        return Err(HarvestError::artifact(path, "adapter output is empty"));
    }
    if schema.column_with_name(partition_column).is_none() {
        let columns: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        return Err(HarvestError::artifact(
            path,
            format!("partition column '{}' not in [{}]", partition_column, columns.join(", ")),
        ));
    }

    let schema = Arc::new(resolve_schema(&schema, table_schema, partition_column));
    let reader = ReaderBuilder::new(schema.clone())
        .with_header(true)
        .build(open()?)
        .map_err(|e| HarvestError::artifact(path, e.to_string()))?;

    let batches = reader
        .collect::<std::result::Result<Vec<_>, ArrowError>>()
        .map_err(|e| HarvestError::artifact(path, format!("does not match table schema: {}", e)))?;

    Ok((schema, batches))
}

fn split_by_partition(
    batches: &[RecordBatch],
    column: &str,
) -> std::result::Result<BTreeMap<String, Vec<RecordBatch>>, ArrowError> {
    let mut partitions: BTreeMap<String, Vec<RecordBatch>> = BTreeMap::new();

    for batch in batches {
        let values = batch.column(batch.schema().index_of(column)?).clone();
        let keys =
            (0..batch.num_rows()).map(|row| partition_value(&values, row)).collect::<std::result::Result<Vec<_>, _>>()?;

        let distinct: BTreeSet<&String> = keys.iter().collect();
        for key in distinct {
            let mask = BooleanArray::from(keys.iter().map(|k| k == key).collect::<Vec<bool>>());
            partitions.entry(key.clone()).or_default().push(filter_record_batch(batch, &mask)?);
        }
    }

    Ok(partitions)
}

fn partition_value(values: &ArrayRef, row: usize) -> std::result::Result<String, ArrowError> {
    if values.is_null(row) {
        return Ok(HIVE_DEFAULT_PARTITION.to_string());
    }
    Ok(escape_partition_value(&array_value_to_string(values, row)?))
}

/// Percent-encode characters that cannot appear in a partition directory name
fn escape_partition_value(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_control() || "\"#%'*/:=?\\{[]^".contains(c) {
            for byte in c.to_string().bytes() {
                escaped.push_str(&format!("%{:02X}", byte));
            }
        } else {
            escaped.push(c);
        }
    }
    escaped
}
