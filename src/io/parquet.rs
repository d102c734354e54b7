//! Parquet shard encoding and the in-memory table helpers built on Arrow.
//!
//! This module provides:
//! - **Shard encoding**: [`encode_batch`] serializes one `RecordBatch` to a
//!   self-contained Parquet file held in memory, ready for an object-store put
//! - **Lazy decoding**: [`read_batches`] returns a pull-based reader over an
//!   encoded shard yielding windows of at most `batch_size` rows
//! - **Schema-union merge**: [`diagonal_concat`] concatenates batches whose
//!   column sets differ, padding missing columns with nulls
//!
//! Shards are small by construction (one conversion chunk or one finding
//! batch), so a shard's bytes are fetched whole while its rows are still
//! decoded window by window.

use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, StringArray, new_null_array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build()
}

/// Serialize `batch` as a complete Parquet file.
///
/// # Errors
/// Returns an error if the writer cannot be created or the batch fails to encode.
pub fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer = ArrowWriter::try_new(&mut cursor, batch.schema(), Some(writer_properties()))
        .context("create ArrowWriter")?;
    writer.write(batch).context("write batch to parquet")?;
    writer.close().context("close ArrowWriter")?;
    Ok(cursor.into_inner())
}

/// Open a pull-based reader over an encoded shard.
///
/// Nothing is decoded until the reader is advanced; each step decodes at most
/// `batch_size` rows (0 is treated as 1).
///
/// # Errors
/// Returns an error if the bytes are not a readable Parquet file.
pub fn read_batches(data: impl Into<Bytes>, batch_size: usize) -> Result<ParquetRecordBatchReader> {
    ParquetRecordBatchReaderBuilder::try_new(data.into())
        .context("open ParquetRecordBatchReader")?
        .with_batch_size(batch_size.max(1))
        .build()
        .context("build ParquetRecordBatchReader")
}

/// Decode every row of an encoded shard.
///
/// # Errors
/// Returns an error if the shard cannot be opened or a batch fails to decode.
pub fn decode_all(data: impl Into<Bytes>) -> Result<Vec<RecordBatch>> {
    let reader = read_batches(data, 64 * 1024)?;
    let mut out = Vec::new();
    for batch in reader {
        out.push(batch.context("read next batch")?);
    }
    Ok(out)
}

/// Concatenate batches over the union of their columns.
///
/// The merged schema lists every column in first-seen order, all as nullable
/// `Utf8`; a batch lacking a column contributes nulls for it. The row count
/// is the sum of the inputs. An empty input yields an empty, column-less batch.
///
/// # Errors
/// Returns an error if a column cannot be cast to `Utf8`.
pub fn diagonal_concat(batches: &[RecordBatch]) -> Result<RecordBatch> {
    let mut names: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for batch in batches {
        for field in batch.schema().fields() {
            if !positions.contains_key(field.name()) {
                positions.insert(field.name().clone(), names.len());
                names.push(field.name().clone());
            }
        }
    }

    let schema: SchemaRef = Arc::new(Schema::new(
        names
            .iter()
            .map(|n| Field::new(n, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));
    let total_rows: usize = batches.iter().map(RecordBatch::num_rows).sum();

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(names.len());
    for name in &names {
        let mut parts: Vec<ArrayRef> = Vec::with_capacity(batches.len());
        for batch in batches {
            let part = match batch.column_by_name(name) {
                Some(col) if col.data_type() == &DataType::Utf8 => Arc::clone(col),
                Some(col) => cast(col.as_ref(), &DataType::Utf8)
                    .with_context(|| format!("cast column {name} to Utf8"))?,
                None => new_null_array(&DataType::Utf8, batch.num_rows()),
            };
            parts.push(part);
        }
        let refs: Vec<&dyn Array> = parts.iter().map(AsRef::as_ref).collect();
        let merged = if refs.is_empty() {
            new_null_array(&DataType::Utf8, 0)
        } else {
            arrow::compute::concat(&refs).with_context(|| format!("concatenate column {name}"))?
        };
        columns.push(merged);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(total_rows));
    RecordBatch::try_new_with_options(schema, columns, &options).context("assemble merged table")
}

/// Borrow a column as a string array, if present and of type `Utf8`.
#[must_use]
pub fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    batch
        .column_by_name(name)?
        .as_any()
        .downcast_ref::<StringArray>()
}

/// Value of a string cell, treating nulls as absent.
#[must_use]
pub fn cell<'a>(column: Option<&'a StringArray>, row: usize) -> Option<&'a str> {
    let column = column?;
    if column.is_null(row) {
        None
    } else {
        Some(column.value(row))
    }
}

/// Append constant string columns to `batch`, replacing same-named columns.
///
/// # Errors
/// Returns an error if the resulting batch is inconsistent.
pub fn with_constant_columns(batch: &RecordBatch, constants: &[(&str, &str)]) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<Field> = Vec::new();
    let mut columns: Vec<ArrayRef> = Vec::new();
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        if constants.iter().any(|(name, _)| field.name() == name) {
            continue;
        }
        fields.push(Field::clone(field));
        columns.push(Arc::clone(column));
    }
    for (name, value) in constants {
        fields.push(Field::new(*name, DataType::Utf8, false));
        columns.push(Arc::new(StringArray::from(vec![*value; batch.num_rows()])));
    }
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), columns, &options)
        .context("stamp constant columns")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(cols: &[(&str, Vec<&str>)]) -> RecordBatch {
        let fields: Vec<Field> = cols
            .iter()
            .map(|(n, _)| Field::new(*n, DataType::Utf8, false))
            .collect();
        let arrays: Vec<ArrayRef> = cols
            .iter()
            .map(|(_, v)| Arc::new(StringArray::from(v.clone())) as ArrayRef)
            .collect();
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).expect("valid batch")
    }

    #[test]
    fn encode_then_read_in_windows() -> Result<()> {
        let values: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        let b = batch(&[("x", refs)]);
        let bytes = encode_batch(&b)?;
        let windows: Vec<usize> = read_batches(bytes, 4)?
            .map(|r| r.map(|b| b.num_rows()))
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(windows, vec![4, 4, 2]);
        Ok(())
    }

    #[test]
    fn diagonal_concat_pads_missing_columns() -> Result<()> {
        let a = batch(&[("id", vec!["1", "2"]), ("field_name", vec!["f", "g"])]);
        let b = batch(&[("id", vec!["3"]), ("field_1", vec!["h"])]);
        let merged = diagonal_concat(&[a, b])?;
        assert_eq!(merged.num_rows(), 3);
        let names: Vec<_> = merged.schema().fields().iter().map(|f| f.name().clone()).collect();
        assert_eq!(names, vec!["id", "field_name", "field_1"]);
        let f1 = string_column(&merged, "field_1");
        assert_eq!(cell(f1, 0), None);
        assert_eq!(cell(f1, 2), Some("h"));
        let fname = string_column(&merged, "field_name");
        assert_eq!(cell(fname, 1), Some("g"));
        assert_eq!(cell(fname, 2), None);
        Ok(())
    }

    #[test]
    fn diagonal_concat_of_nothing_is_empty() -> Result<()> {
        let merged = diagonal_concat(&[])?;
        assert_eq!(merged.num_rows(), 0);
        assert_eq!(merged.num_columns(), 0);
        Ok(())
    }

    #[test]
    fn constant_columns_replace_existing() -> Result<()> {
        let b = batch(&[("phase", vec!["old"]), ("v", vec!["1"])]);
        let stamped = with_constant_columns(&b, &[("phase", "Logical"), ("submission_id", "7")])?;
        assert_eq!(cell(string_column(&stamped, "phase"), 0), Some("Logical"));
        assert_eq!(cell(string_column(&stamped, "submission_id"), 0), Some("7"));
        assert_eq!(stamped.num_columns(), 3);
        Ok(())
    }
}
