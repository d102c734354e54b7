//! CSV I/O for submissions and reports.
//!
//! This module provides:
//! - **Streaming ingestion** in fixed-size row chunks: [`CsvChunks`] yields Arrow
//!   [`RecordBatch`]es of at most `rows_per_chunk` rows without ever holding the
//!   whole file
//! - **Report output**: [`write_csv_table`] renders a `RecordBatch` as CSV with
//!   an optional leading annotation record
//!
//! # Design notes
//! - Every column is read as a string. Blank cells stay `""` and are never
//!   turned into nulls, so downstream rules can tell a blank value from an
//!   absent one.
//! - Chunking is **row-count based** (header excluded), not byte-range based.

use anyhow::{Context, Result, bail};
use arrow::array::{Array, ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use csv::{StringRecord, WriterBuilder};
use std::io::Read;
use std::sync::Arc;

/// Streaming reader that turns a delimited text table into row chunks.
///
/// The first record is the header and defines the (all-`Utf8`, non-nullable)
/// schema shared by every chunk. Construct with [`CsvChunks::new`] and iterate.
pub struct CsvChunks<R: Read> {
    reader: csv::Reader<R>,
    schema: SchemaRef,
    rows_per_chunk: usize,
    rows_read: u64,
    record: StringRecord,
    done: bool,
}

impl<R: Read> CsvChunks<R> {
    /// Open a chunked reader over `source`.
    ///
    /// `rows_per_chunk == 0` is treated as 1.
    ///
    /// # Errors
    /// Returns an error if the source is empty, if the header cannot be read
    /// or decoded as UTF-8, or if it names no column or the same column twice.
    pub fn new(source: R, rows_per_chunk: usize) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(source);
        let headers = reader.headers().context("read CSV header")?.clone();
        if headers.iter().all(|name| name.trim().is_empty()) {
            bail!("CSV source has no header row");
        }

        let mut fields = Vec::with_capacity(headers.len());
        for (idx, name) in headers.iter().enumerate() {
            if headers.iter().take(idx).any(|prev| prev == name) {
                bail!("duplicate CSV column {name:?}");
            }
            fields.push(Field::new(name, DataType::Utf8, false));
        }

        Ok(Self {
            reader,
            schema: Arc::new(Schema::new(fields)),
            rows_per_chunk: rows_per_chunk.max(1),
            rows_read: 0,
            record: StringRecord::new(),
            done: false,
        })
    }

    /// Schema shared by every chunk.
    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    /// Data rows read so far.
    #[must_use]
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    fn next_chunk(&mut self) -> Result<Option<RecordBatch>> {
        let width = self.schema.fields().len();
        let mut columns: Vec<Vec<String>> = (0..width)
            .map(|_| Vec::with_capacity(self.rows_per_chunk))
            .collect();
        let mut rows = 0usize;

        while rows < self.rows_per_chunk {
            let more = self
                .reader
                .read_record(&mut self.record)
                .with_context(|| format!("parse CSV record #{}", self.rows_read + 1))?;
            if !more {
                self.done = true;
                break;
            }
            for (col, value) in columns.iter_mut().zip(self.record.iter()) {
                col.push(value.to_string());
            }
            rows += 1;
            self.rows_read += 1;
        }

        if rows == 0 {
            return Ok(None);
        }

        let arrays: Vec<ArrayRef> = columns
            .into_iter()
            .map(|col| Arc::new(StringArray::from(col)) as ArrayRef)
            .collect();
        let batch = RecordBatch::try_new(self.schema(), arrays).context("assemble CSV chunk")?;
        Ok(Some(batch))
    }
}

impl<R: Read> Iterator for CsvChunks<R> {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Render `table` as CSV bytes.
///
/// When `annotation` is given it is written as a single-field record before
/// the header. Columns must be `Utf8`; nulls render as empty cells.
///
/// # Errors
/// Returns an error if a column is not a string column or serialization fails.
pub fn write_csv_table(table: &RecordBatch, annotation: Option<&str>) -> Result<Vec<u8>> {
    let mut wtr = WriterBuilder::new().flexible(true).from_writer(Vec::new());
    if let Some(note) = annotation {
        wtr.write_record([note]).context("write report annotation")?;
    }

    let schema = table.schema();
    if table.num_columns() > 0 {
        wtr.write_record(schema.fields().iter().map(|f| f.name().as_str()))
            .context("write report header")?;
    }

    let columns: Vec<&StringArray> = table
        .columns()
        .iter()
        .zip(schema.fields())
        .map(|(col, field)| {
            col.as_any()
                .downcast_ref::<StringArray>()
                .with_context(|| format!("report column {} is not a string column", field.name()))
        })
        .collect::<Result<_>>()?;

    for row in 0..table.num_rows() {
        let cells = columns
            .iter()
            .map(|col| if col.is_null(row) { "" } else { col.value(row) });
        wtr.write_record(cells)
            .with_context(|| format!("serialize report row #{}", row + 1))?;
    }
    wtr.flush()?;
    wtr.into_inner()
        .map_err(|e| anyhow::anyhow!("finish report buffer: {}", e.error()))
}
