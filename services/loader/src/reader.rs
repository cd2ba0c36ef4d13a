//! Chunked readers for flat CSV recordings and columnar snapshots.
//!
//! Flat files carry no time axis, so timestamps are synthesized from a fixed
//! sampling period and carried across chunk boundaries. Columnar snapshots
//! carry absolute timestamps which are sorted and shifted so every file's
//! own timeline starts at zero.

use crate::config::FlatSourceConfig;
use crate::error::IngestError;
use crate::path_meta::Modality;
use crate::tables::{AMPLITUDE, CHANNEL};
use arrow::array::{Array, ArrayRef, AsArray, Float64Array, StringArray};
use arrow::compute::{
    cast, concat, concat_batches, filter, filter_record_batch, is_not_null, sort_to_indices, take,
    take_record_batch,
};
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Value columns of one chunk plus their relative timestamps
#[derive(Debug, Clone)]
pub struct SampleChunk {
    pub time_stamp: Float64Array,
    pub columns: Vec<(String, ArrayRef)>,
}

impl SampleChunk {
    pub fn num_rows(&self) -> usize {
        self.time_stamp.len()
    }

    pub fn column(&self, name: &str) -> Option<&ArrayRef> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    /// Split into consecutive chunks of at most `max_rows` rows
    pub fn split(self, max_rows: usize) -> Vec<SampleChunk> {
        let total = self.num_rows();
        if total <= max_rows {
            return vec![self];
        }

        (0..total)
            .step_by(max_rows)
            .map(|offset| {
                let len = max_rows.min(total - offset);
                SampleChunk {
                    time_stamp: self.time_stamp.slice(offset, len),
                    columns: self
                        .columns
                        .iter()
                        .map(|(name, array)| (name.clone(), array.slice(offset, len)))
                        .collect(),
                }
            })
            .collect()
    }
}

/// Fixed-rate timestamps, zero-based per file, continuous across chunks
#[derive(Debug, Clone)]
pub struct TimestampSynthesizer {
    period: f64,
    emitted: u64,
}

impl TimestampSynthesizer {
    pub fn new(period: f64) -> Self {
        Self { period, emitted: 0 }
    }

    /// Timestamps for the next `rows` samples
    pub fn next_block(&mut self, rows: usize) -> Float64Array {
        let start = self.emitted;
        self.emitted += rows as u64;
        Float64Array::from_iter_values((0..rows as u64).map(|i| (start + i) as f64 * self.period))
    }

    /// Samples stamped so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

/// Typed column layout of a flat CSV source
#[derive(Debug, Clone)]
pub struct CsvLayout {
    schema: SchemaRef,
    delimiter: u8,
    /// (file column index, output column name), sorted by index
    outputs: Vec<(usize, String)>,
}

impl CsvLayout {
    pub fn new(schema: SchemaRef, delimiter: u8, mut outputs: Vec<(usize, String)>) -> Self {
        outputs.sort_by_key(|(idx, _)| *idx);
        Self {
            schema,
            delimiter,
            outputs,
        }
    }

    /// Layout of a configured source; the value column is loaded as `amplitude`
    pub fn from_source(source: &FlatSourceConfig) -> Self {
        let fields: Vec<Field> = source
            .columns
            .iter()
            .map(|c| Field::new(&c.name, c.column_type.data_type(), true))
            .collect();
        let value_idx = source
            .columns
            .iter()
            .position(|c| c.name == source.value_column)
            .unwrap_or(0);

        Self::new(
            Arc::new(Schema::new(fields)),
            source.delimiter as u8,
            vec![(value_idx, AMPLITUDE.to_string())],
        )
    }

    /// A single untyped numeric column
    pub fn single_column(name: &str, delimiter: u8) -> Self {
        let schema = Schema::new(vec![Field::new(name, DataType::Float64, true)]);
        Self::new(Arc::new(schema), delimiter, vec![(0, name.to_string())])
    }

    fn projection(&self) -> Vec<usize> {
        self.outputs.iter().map(|(idx, _)| *idx).collect()
    }
}

/// Streams a headerless CSV file in batches of at most `chunk_size` rows
pub struct ChunkedCsvReader {
    path: PathBuf,
    inner: arrow::csv::Reader<File>,
    names: Vec<String>,
    timestamps: TimestampSynthesizer,
}

impl std::fmt::Debug for ChunkedCsvReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedCsvReader")
            .field("path", &self.path)
            .field("emitted", &self.timestamps.emitted())
            .finish()
    }
}

impl ChunkedCsvReader {
    /// Open `path`; returns `None` for a zero-byte file
    pub fn open(
        path: &Path,
        layout: &CsvLayout,
        sample_period: f64,
        chunk_size: usize,
    ) -> Result<Option<Self>, IngestError> {
        let metadata = std::fs::metadata(path).map_err(|source| IngestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if metadata.len() == 0 {
            return Ok(None);
        }

        let file = File::open(path).map_err(|source| IngestError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let inner = arrow::csv::ReaderBuilder::new(layout.schema.clone())
            .with_header(false)
            .with_delimiter(layout.delimiter)
            .with_batch_size(chunk_size)
            .with_projection(layout.projection())
            .build(file)
            .map_err(|source| IngestError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Some(Self {
            path: path.to_path_buf(),
            inner,
            names: layout.outputs.iter().map(|(_, n)| n.clone()).collect(),
            timestamps: TimestampSynthesizer::new(sample_period),
        }))
    }
}

impl Iterator for ChunkedCsvReader {
    type Item = Result<SampleChunk, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let batch = match self.inner.next()? {
                Ok(batch) => batch,
                Err(source) => {
                    return Some(Err(IngestError::Read {
                        path: self.path.clone(),
                        source,
                    }))
                }
            };
            if batch.num_rows() == 0 {
                continue;
            }

            let time_stamp = self.timestamps.next_block(batch.num_rows());
            let columns = self
                .names
                .iter()
                .cloned()
                .zip(batch.columns().iter().cloned())
                .collect();

            return Some(Ok(SampleChunk {
                time_stamp,
                columns,
            }));
        }
    }
}

/// Read one numeric column of a whole CSV file
pub fn read_column(path: &Path, layout: &CsvLayout) -> Result<ArrayRef, IngestError> {
    let read_err = |source| IngestError::Read {
        path: path.to_path_buf(),
        source,
    };

    let Some(reader) = ChunkedCsvReader::open(path, layout, 1.0, 64 * 1024)? else {
        return Ok(Arc::new(Float64Array::from(Vec::<f64>::new())));
    };

    let mut parts: Vec<ArrayRef> = Vec::new();
    for chunk in reader {
        let chunk = chunk?;
        if let Some((_, array)) = chunk.columns.into_iter().next() {
            parts.push(array);
        }
    }

    if parts.is_empty() {
        return Ok(Arc::new(Float64Array::from(Vec::<f64>::new())));
    }
    let refs: Vec<&dyn Array> = parts.iter().map(|a| a.as_ref()).collect();
    concat(&refs).map_err(read_err)
}

/// Absolute timestamps as float seconds
fn timestamp_seconds(array: &ArrayRef) -> Result<Float64Array, ArrowError> {
    match array.data_type() {
        DataType::Timestamp(unit, _) => {
            let scale = match unit {
                TimeUnit::Second => 1.0,
                TimeUnit::Millisecond => 1e3,
                TimeUnit::Microsecond => 1e6,
                TimeUnit::Nanosecond => 1e9,
            };
            let raw = cast(array, &DataType::Int64)?;
            Ok(raw
                .as_primitive::<Int64Type>()
                .unary::<_, Float64Type>(|v| v as f64 / scale))
        }
        dt if dt.is_numeric() => Ok(cast(array, &DataType::Float64)?
            .as_primitive::<Float64Type>()
            .clone()),
        other => Err(ArrowError::CastError(format!(
            "timestamp column of type {other} is not numeric"
        ))),
    }
}

/// Sort `batch` by its absolute timestamp column and return the sorted batch
/// with timestamps relative to the earliest sample. Rows without a timestamp
/// are dropped.
pub fn normalize_timeline(
    batch: &RecordBatch,
    timestamp_column: &str,
) -> Result<(RecordBatch, Float64Array), ArrowError> {
    let idx = batch.schema().index_of(timestamp_column)?;
    let mut batch = batch.clone();
    let mut seconds = timestamp_seconds(batch.column(idx))?;

    if seconds.null_count() > 0 {
        let mask = is_not_null(&seconds)?;
        batch = filter_record_batch(&batch, &mask)?;
        seconds = filter(&seconds, &mask)?.as_primitive::<Float64Type>().clone();
    }
    if seconds.is_empty() {
        return Ok((batch, seconds));
    }

    let indices = sort_to_indices(&seconds, None, None)?;
    let batch = take_record_batch(&batch, &indices)?;
    let sorted = take(&seconds, &indices, None)?;
    let sorted = sorted.as_primitive::<Float64Type>();

    let origin = sorted.value(0);
    Ok((batch, sorted.unary::<_, Float64Type>(|v| v - origin)))
}

/// Read a columnar sensor snapshot into load-ready chunks.
///
/// Audio keeps the first numeric value column as `amplitude`. Seismic turns
/// every numeric value column into its own channel, channel-major. Returns
/// `None` when the snapshot has no rows.
pub fn read_snapshot(
    path: &Path,
    timestamp_column: &str,
    modality: Modality,
    chunk_size: usize,
) -> Result<Option<Vec<SampleChunk>>, IngestError> {
    let read_err = |source| IngestError::Read {
        path: path.to_path_buf(),
        source,
    };
    let parquet_err = |source| IngestError::Parquet {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_err)?;
    let schema = builder.schema().clone();
    let reader = builder.with_batch_size(chunk_size).build().map_err(parquet_err)?;

    let batches = reader.collect::<Result<Vec<_>, _>>().map_err(read_err)?;
    let batch = concat_batches(&schema, &batches).map_err(read_err)?;
    if batch.num_rows() == 0 {
        return Ok(None);
    }

    if schema.index_of(timestamp_column).is_err() {
        return Err(IngestError::MissingColumn {
            path: path.to_path_buf(),
            column: timestamp_column.to_string(),
        });
    }

    let (batch, time_stamp) = normalize_timeline(&batch, timestamp_column).map_err(read_err)?;
    if time_stamp.is_empty() {
        return Ok(None);
    }

    let mut values = Vec::new();
    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        if field.name() == timestamp_column || !field.data_type().is_numeric() {
            continue;
        }
        values.push((field.name().clone(), cast(array, &DataType::Float32).map_err(read_err)?));
    }

    let missing_amplitude = || IngestError::MissingColumn {
        path: path.to_path_buf(),
        column: AMPLITUDE.to_string(),
    };

    let chunks = match modality {
        Modality::Audio => {
            let (_, amplitude) = values.into_iter().next().ok_or_else(missing_amplitude)?;
            SampleChunk {
                time_stamp,
                columns: vec![(AMPLITUDE.to_string(), amplitude)],
            }
            .split(chunk_size)
        }
        Modality::Seismic => {
            if values.is_empty() {
                return Err(missing_amplitude());
            }
            let rows = time_stamp.len();
            values
                .into_iter()
                .flat_map(|(channel, amplitude)| {
                    let channel: ArrayRef =
                        Arc::new(StringArray::from(vec![channel.as_str(); rows]));
                    SampleChunk {
                        time_stamp: time_stamp.clone(),
                        columns: vec![
                            (CHANNEL.to_string(), channel),
                            (AMPLITUDE.to_string(), amplitude),
                        ],
                    }
                    .split(chunk_size)
                })
                .collect()
        }
    };

    debug!(path = %path.display(), chunks = chunks.len(), "Snapshot read");
    Ok(Some(chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use arrow::array::{Float32Array, TimestampMillisecondArray};
    use parquet::arrow::ArrowWriter;
    use std::fs;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_timestamps_carry_across_chunks() {
        let mut synth = TimestampSynthesizer::new(0.01);
        let first = synth.next_block(500_000);
        let second = synth.next_block(500_000);
        let third = synth.next_block(3);

        assert_eq!(first.value(0), 0.0);
        assert!(approx(second.value(0), 5000.0));
        assert!(approx(third.value(0), 10000.0));
        assert!(approx(third.value(2), 10000.02));
        assert_eq!(synth.emitted(), 1_000_003);
    }

    #[test]
    fn test_csv_reader_chunks_and_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aud.csv");
        fs::write(&path, "0.5,9\n0.25,9\n-0.5,9\n1.0,9\n0.75,9\n").unwrap();

        let config = Config::default();
        let layout = CsvLayout::from_source(&config.mod_vehicle.sources[1]);
        let reader = ChunkedCsvReader::open(&path, &layout, 0.5, 2).unwrap().unwrap();
        let chunks: Vec<_> = reader.collect::<Result<_, _>>().unwrap();

        assert_eq!(
            chunks.iter().map(SampleChunk::num_rows).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert_eq!(chunks[2].time_stamp.value(0), 2.0);

        let amplitude = chunks[1].column(AMPLITUDE).unwrap();
        let amplitude = amplitude.as_any().downcast_ref::<Float32Array>().unwrap();
        assert_eq!(amplitude.values().to_vec(), vec![-0.5, 1.0]);
        assert_eq!(chunks[1].columns.len(), 1);
    }

    #[test]
    fn test_csv_space_delimited() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ehz.csv");
        fs::write(&path, "12\n-4\n7\n").unwrap();

        let config = Config::default();
        let layout = CsvLayout::from_source(&config.mod_vehicle.sources[2]);
        let reader = ChunkedCsvReader::open(&path, &layout, 0.01, 100).unwrap().unwrap();
        let chunks: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].num_rows(), 3);
    }

    #[test]
    fn test_empty_csv_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aud16000.csv");
        fs::write(&path, "").unwrap();

        let layout = CsvLayout::from_source(&Config::default().mod_vehicle.sources[0]);
        assert!(ChunkedCsvReader::open(&path, &layout, 0.1, 10).unwrap().is_none());
    }

    #[test]
    fn test_parse_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aud16000.csv");
        fs::write(&path, "0.1\nnot-a-number\n").unwrap();

        let layout = CsvLayout::from_source(&Config::default().mod_vehicle.sources[0]);
        let reader = ChunkedCsvReader::open(&path, &layout, 0.1, 10).unwrap().unwrap();
        let result: Result<Vec<_>, _> = reader.collect();
        assert!(matches!(result, Err(IngestError::Read { .. })));
    }

    #[test]
    fn test_absolute_to_relative() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("timestamp", DataType::Float64, true),
            Field::new("value", DataType::Float32, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float64Array::from(vec![105.2, 100.0, 110.5])),
                Arc::new(Float32Array::from(vec![2.0, 1.0, 3.0])),
            ],
        )
        .unwrap();

        let (sorted, relative) = normalize_timeline(&batch, "timestamp").unwrap();

        let expected = [0.0, 5.2, 10.5];
        for (got, want) in relative.values().iter().zip(expected) {
            assert!(approx(*got, want), "{got} != {want}");
        }
        let values = sorted.column(1).as_primitive::<arrow::datatypes::Float32Type>();
        assert_eq!(values.values().to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_timestamp_units_and_nulls() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Millisecond, None),
            true,
        )]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(TimestampMillisecondArray::from(vec![
                Some(3_500),
                None,
                Some(1_000),
            ]))],
        )
        .unwrap();

        let (sorted, relative) = normalize_timeline(&batch, "timestamp").unwrap();
        assert_eq!(sorted.num_rows(), 2);
        assert_eq!(relative.values().to_vec(), vec![0.0, 2.5]);
    }

    fn write_parquet(path: &Path, batch: &RecordBatch) {
        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
        writer.write(batch).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_seismic_snapshot_melts_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run1_rs1_geo.parquet");
        let schema = Arc::new(Schema::new(vec![
            Field::new("timestamp", DataType::Float64, false),
            Field::new("EHZ", DataType::Float64, false),
            Field::new("EHN", DataType::Float64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float64Array::from(vec![11.0, 10.0, 12.0])),
                Arc::new(Float64Array::from(vec![0.2, 0.1, 0.3])),
                Arc::new(Float64Array::from(vec![-0.2, -0.1, -0.3])),
            ],
        )
        .unwrap();
        write_parquet(&path, &batch);

        let chunks = read_snapshot(&path, "timestamp", Modality::Seismic, 2)
            .unwrap()
            .unwrap();

        // two channels of three rows, two rows per chunk
        assert_eq!(
            chunks.iter().map(SampleChunk::num_rows).collect::<Vec<_>>(),
            vec![2, 1, 2, 1]
        );
        let channel = chunks[2].column(CHANNEL).unwrap();
        assert_eq!(channel.as_string::<i32>().value(0), "EHN");
        assert_eq!(chunks[1].time_stamp.value(0), 2.0);

        let amplitude = chunks[0]
            .column(AMPLITUDE)
            .unwrap()
            .as_primitive::<arrow::datatypes::Float32Type>();
        assert!(approx(amplitude.value(0) as f64, 0.1));
    }

    #[test]
    fn test_audio_snapshot_without_rows_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run1_rs1_mic.parquet");
        let schema = Arc::new(Schema::new(vec![
            Field::new("timestamp", DataType::Float64, false),
            Field::new("audio", DataType::Float32, false),
        ]));
        let batch = RecordBatch::new_empty(schema);
        write_parquet(&path, &batch);

        assert!(read_snapshot(&path, "timestamp", Modality::Audio, 10)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_split_respects_ceiling() {
        let chunk = SampleChunk {
            time_stamp: Float64Array::from_iter_values((0..7).map(f64::from)),
            columns: vec![],
        };
        let parts = chunk.split(3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].time_stamp.value(0), 6.0);
    }
}
