//! Target sample tables and row assembly.

use crate::config::SampleKind;
use crate::path_meta::Modality;
use crate::reader::SampleChunk;
use arrow::array::{Array, ArrayRef, Int32Array};
use arrow::datatypes::{Field, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

pub const VEHICLE_ID: &str = "vehicle_id";
pub const SENSOR_ID: &str = "sensor_id";
pub const RUN_ID: &str = "run_id";
pub const TIME_STAMP: &str = "time_stamp";
pub const CHANNEL: &str = "channel";
pub const AMPLITUDE: &str = "amplitude";

/// A warehouse table and the column order bulk copies are written in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTable {
    pub name: String,
    pub columns: Vec<String>,
}

impl TargetTable {
    fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn audio() -> Self {
        Self::new("audio_data", &[VEHICLE_ID, SENSOR_ID, TIME_STAMP, AMPLITUDE])
    }

    pub fn seismic() -> Self {
        Self::new("seismic_data", &[VEHICLE_ID, SENSOR_ID, TIME_STAMP, AMPLITUDE])
    }

    pub fn for_kind(kind: SampleKind) -> Self {
        match kind {
            SampleKind::Audio => Self::audio(),
            SampleKind::Seismic => Self::seismic(),
        }
    }

    /// Accelerometer table with the merged axis columns in declared order
    pub fn accelerometer<S: AsRef<str>>(axes: &[S]) -> Self {
        let mut columns = vec![
            VEHICLE_ID.to_string(),
            SENSOR_ID.to_string(),
            TIME_STAMP.to_string(),
        ];
        columns.extend(axes.iter().map(|a| a.as_ref().to_string()));
        Self {
            name: "accel_data".to_string(),
            columns,
        }
    }

    /// Columnar-dataset variants carry the run id, and seismic a channel
    pub fn m3nvc(modality: Modality) -> Self {
        match modality {
            Modality::Audio => Self::new(
                "m3nvc_audio_data",
                &[VEHICLE_ID, SENSOR_ID, RUN_ID, TIME_STAMP, AMPLITUDE],
            ),
            Modality::Seismic => Self::new(
                "m3nvc_seismic_data",
                &[VEHICLE_ID, SENSOR_ID, RUN_ID, TIME_STAMP, CHANNEL, AMPLITUDE],
            ),
        }
    }
}

/// Resolved keys attached to every row of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowKeys {
    pub vehicle_id: i32,
    pub sensor_id: i32,
    pub run_id: Option<u32>,
}

/// Lay out a chunk in the table's column order, repeating the keys per row
pub fn assemble(
    table: &TargetTable,
    keys: &RowKeys,
    chunk: SampleChunk,
) -> Result<RecordBatch, ArrowError> {
    let rows = chunk.num_rows();
    let repeat = |value: i32| -> ArrayRef { Arc::new(Int32Array::from(vec![value; rows])) };

    let mut fields = Vec::with_capacity(table.columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(table.columns.len());

    for column in &table.columns {
        let array = match column.as_str() {
            VEHICLE_ID => repeat(keys.vehicle_id),
            SENSOR_ID => repeat(keys.sensor_id),
            RUN_ID => {
                let run_id = keys.run_id.ok_or_else(|| {
                    ArrowError::InvalidArgumentError(format!(
                        "{} requires a run id",
                        table.name
                    ))
                })?;
                let run_id = i32::try_from(run_id).map_err(|_| {
                    ArrowError::InvalidArgumentError(format!("run id {run_id} out of range"))
                })?;
                repeat(run_id)
            }
            TIME_STAMP => Arc::new(chunk.time_stamp.clone()) as ArrayRef,
            other => chunk.column(other).cloned().ok_or_else(|| {
                ArrowError::SchemaError(format!(
                    "column '{other}' of {} not produced by reader",
                    table.name
                ))
            })?,
        };
        let nullable = !matches!(column.as_str(), VEHICLE_ID | SENSOR_ID | RUN_ID | TIME_STAMP);
        fields.push(Field::new(column, array.data_type().clone(), nullable));
        arrays.push(array);
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
}
