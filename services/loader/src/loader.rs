//! Bulk loader.
//!
//! Batches are serialized to PostgreSQL text COPY format in the target
//! table's declared column order and streamed through the warehouse's bulk
//! copy primitive. Missing and NaN values are written as `0` so the payload
//! never carries a null marker.

use crate::error::IngestError;
use crate::retry::RetryPolicy;
use crate::tables::TargetTable;
use crate::warehouse::Warehouse;
use arrow::array::{
    Array, AsArray, Float32Array, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Float32Type, Float64Type, Int32Type, Int64Type};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use bytes::Bytes;
use std::fmt::{self, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, instrument};

const ZERO: &str = "0";

enum Cell<'a> {
    I32(&'a Int32Array),
    I64(&'a Int64Array),
    F32(&'a Float32Array),
    F64(&'a Float64Array),
    Text(&'a StringArray),
    Other(ArrayFormatter<'a>),
}

fn write_float(out: &mut String, v: f64) -> fmt::Result {
    if v.is_nan() {
        out.push_str(ZERO);
        Ok(())
    } else if v.is_infinite() {
        out.push_str(if v > 0.0 { "Infinity" } else { "-Infinity" });
        Ok(())
    } else {
        write!(out, "{v}")
    }
}

fn write_text(out: &mut String, value: &str, delimiter: char) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c == delimiter => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}

impl Cell<'_> {
    fn write(&self, out: &mut String, row: usize, delimiter: char) -> fmt::Result {
        match self {
            Cell::I32(a) if a.is_valid(row) => write!(out, "{}", a.value(row)),
            Cell::I64(a) if a.is_valid(row) => write!(out, "{}", a.value(row)),
            Cell::F32(a) if a.is_valid(row) => {
                let v = a.value(row);
                if v.is_finite() {
                    // shortest f32 representation, not its f64 widening
                    write!(out, "{v}")
                } else {
                    write_float(out, v as f64)
                }
            }
            Cell::F64(a) if a.is_valid(row) => write_float(out, a.value(row)),
            Cell::Text(a) if a.is_valid(row) => {
                write_text(out, a.value(row), delimiter);
                Ok(())
            }
            Cell::Other(f) => write!(out, "{}", f.value(row)),
            _ => {
                out.push_str(ZERO);
                Ok(())
            }
        }
    }
}

/// Serialize `batch` in `table`'s column order as delimited text rows
pub fn encode_batch(
    batch: &RecordBatch,
    table: &TargetTable,
    delimiter: char,
) -> Result<String, ArrowError> {
    let options = FormatOptions::default().with_null(ZERO);
    let schema = batch.schema();

    let mut cells = Vec::with_capacity(table.columns.len());
    for name in &table.columns {
        let array = batch.column(schema.index_of(name)?).as_ref();
        let cell = match array.data_type() {
            DataType::Int32 => Cell::I32(array.as_primitive::<Int32Type>()),
            DataType::Int64 => Cell::I64(array.as_primitive::<Int64Type>()),
            DataType::Float32 => Cell::F32(array.as_primitive::<Float32Type>()),
            DataType::Float64 => Cell::F64(array.as_primitive::<Float64Type>()),
            DataType::Utf8 => Cell::Text(array.as_string::<i32>()),
            _ => Cell::Other(ArrayFormatter::try_new(array, &options)?),
        };
        cells.push(cell);
    }

    let mut out = String::with_capacity(batch.num_rows() * cells.len() * 10);
    let to_arrow = |e: fmt::Error| ArrowError::ExternalError(Box::new(e));
    for row in 0..batch.num_rows() {
        for (idx, cell) in cells.iter().enumerate() {
            if idx > 0 {
                out.push(delimiter);
            }
            cell.write(&mut out, row, delimiter).map_err(to_arrow)?;
        }
        out.push('\n');
    }
    Ok(out)
}

/// First line of a serialized payload, for diagnostics
pub fn first_line(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .position(|b| *b == b'\n')
        .unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Streams prepared batches into the warehouse
pub struct BulkLoader {
    warehouse: Arc<dyn Warehouse>,
    delimiter: char,
    retry: RetryPolicy,
}

impl BulkLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, delimiter: char, retry: RetryPolicy) -> Self {
        Self {
            warehouse,
            delimiter,
            retry,
        }
    }

    /// Copy `batch` into `table`; returns rows written. Zero-row batches are
    /// never sent.
    #[instrument(skip(self, batch, table), fields(table = %table.name, rows = batch.num_rows()))]
    pub async fn load(&self, batch: &RecordBatch, table: &TargetTable) -> Result<u64, IngestError> {
        if batch.num_rows() == 0 {
            return Ok(0);
        }

        let payload = encode_batch(batch, table, self.delimiter)
            .map(Bytes::from)
            .map_err(|source| IngestError::Assemble {
                table: table.name.clone(),
                source,
            })?;

        let started = Instant::now();
        let result = self
            .retry
            .run("bulk copy", || {
                self.warehouse
                    .copy_in(table, self.delimiter, payload.clone())
            })
            .await;

        match result {
            Ok(rows) => {
                metrics::histogram!("ingest.copy.duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                metrics::counter!("ingest.rows.copied").increment(rows);
                debug!(rows = rows, bytes = payload.len(), "Batch copied");
                Ok(rows)
            }
            Err(source) => {
                let first_line = first_line(&payload);
                error!(
                    table = %table.name,
                    first_line = %first_line,
                    error = %source,
                    "Bulk copy failed"
                );
                Err(IngestError::BulkLoad {
                    table: table.name.clone(),
                    first_line,
                    source,
                })
            }
        }
    }
}
