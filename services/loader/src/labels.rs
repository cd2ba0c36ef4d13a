//! Per-scene run labels.
//!
//! Each M3N-VC scene carries a small table mapping run ids to the vehicle (or
//! vehicles) present during that run. The resolved label is used as the
//! vehicle name of every file in the run.

use crate::config::LabelOverride;
use crate::error::IngestError;
use arrow::array::{Array, ArrayRef, AsArray, GenericListArray, OffsetSizeTrait};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Int64Type};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Separator used when a run lists several vehicles
pub const LABEL_JOINER: &str = "+";

/// run id -> label for one scene. A run whose first row carries no label
/// stays claimed as unlabeled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLabelMap {
    labels: HashMap<u32, Option<String>>,
}

fn string_values(array: &ArrayRef) -> Result<Vec<Option<String>>, ArrowError> {
    let strings = cast(array, &DataType::Utf8)?;
    Ok(strings
        .as_string::<i32>()
        .iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

fn list_values<O: OffsetSizeTrait>(
    list: &GenericListArray<O>,
) -> Result<Vec<Option<String>>, ArrowError> {
    let mut out = Vec::with_capacity(list.len());
    for row in 0..list.len() {
        if list.is_null(row) {
            out.push(None);
            continue;
        }
        let parts: Vec<String> = string_values(&list.value(row))?
            .into_iter()
            .flatten()
            .collect();
        out.push(Some(parts.join(LABEL_JOINER)));
    }
    Ok(out)
}

fn label_values(array: &ArrayRef) -> Result<Vec<Option<String>>, ArrowError> {
    match array.data_type() {
        DataType::List(_) => list_values(array.as_list::<i32>()),
        DataType::LargeList(_) => list_values(array.as_list::<i64>()),
        _ => string_values(array),
    }
}

impl RunLabelMap {
    /// A scene without metadata
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from a single batch
    pub fn from_batch(
        batch: &RecordBatch,
        run_column: &str,
        label_column: &str,
    ) -> Result<Self, ArrowError> {
        let mut map = Self::empty();
        map.absorb(batch, run_column, label_column)?;
        Ok(map)
    }

    /// Add the rows of `batch`; the first row of a run decides its label
    fn absorb(
        &mut self,
        batch: &RecordBatch,
        run_column: &str,
        label_column: &str,
    ) -> Result<(), ArrowError> {
        let schema = batch.schema();
        let runs = cast(
            batch.column(schema.index_of(run_column)?),
            &DataType::Int64,
        )?;
        let runs = runs.as_primitive::<Int64Type>();
        let labels = label_values(batch.column(schema.index_of(label_column)?))?;

        for (run, label) in runs.iter().zip(labels) {
            let Some(Ok(run)) = run.map(u32::try_from) else {
                continue;
            };
            let label = label.filter(|l| !l.is_empty());
            self.labels.entry(run).or_insert(label);
        }
        Ok(())
    }

    /// Read a scene's run-label Parquet table
    pub fn load(path: &Path, run_column: &str, label_column: &str) -> Result<Self, IngestError> {
        let file = File::open(path).map_err(|source| IngestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(file).map_err(|source| IngestError::Parquet {
                path: path.to_path_buf(),
                source,
            })?;

        for column in [run_column, label_column] {
            if builder.schema().index_of(column).is_err() {
                return Err(IngestError::MissingColumn {
                    path: path.to_path_buf(),
                    column: column.to_string(),
                });
            }
        }

        let reader = builder.build().map_err(|source| IngestError::Parquet {
            path: path.to_path_buf(),
            source,
        })?;

        let read_err = |source| IngestError::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut map = Self::empty();
        for batch in reader {
            let batch = batch.map_err(read_err)?;
            map.absorb(&batch, run_column, label_column)
                .map_err(read_err)?;
        }

        debug!(path = %path.display(), runs = map.len(), "Loaded run labels");
        Ok(map)
    }

    /// Apply fixed labels; overrides replace whatever the scene says
    pub fn with_overrides(mut self, overrides: &[LabelOverride]) -> Self {
        for o in overrides {
            self.labels.insert(o.run_id, Some(o.label.clone()));
        }
        self
    }

    pub fn resolve(&self, run_id: u32) -> Option<&str> {
        self.labels.get(&run_id)?.as_deref()
    }

    /// Number of runs with a usable label
    pub fn len(&self) -> usize {
        self.labels.values().filter(|l| l.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use arrow::array::{Int64Array, ListBuilder, StringArray, StringBuilder};
    use arrow::datatypes::{Field, Schema};
    use parquet::arrow::ArrowWriter;
    use std::sync::Arc;

    fn list_batch(rows: Vec<(i64, Option<Vec<&str>>)>) -> RecordBatch {
        let mut builder = ListBuilder::new(StringBuilder::new());
        for (_, labels) in &rows {
            match labels {
                Some(labels) => {
                    for label in labels {
                        builder.values().append_value(label);
                    }
                    builder.append(true);
                }
                None => builder.append(false),
            }
        }
        let runs = Int64Array::from(rows.iter().map(|(r, _)| *r).collect::<Vec<_>>());
        RecordBatch::try_from_iter(vec![
            ("run_id", Arc::new(runs) as ArrayRef),
            ("label", Arc::new(builder.finish()) as ArrayRef),
        ])
        .unwrap()
    }

    #[test]
    fn test_list_labels_are_joined_in_order() {
        let batch = list_batch(vec![(1, Some(vec!["gle350", "mustang"])), (2, Some(vec!["cx30"]))]);
        let map = RunLabelMap::from_batch(&batch, "run_id", "label").unwrap();
        assert_eq!(map.resolve(1), Some("gle350+mustang"));
        assert_eq!(map.resolve(2), Some("cx30"));
    }

    #[test]
    fn test_duplicate_runs_keep_first() {
        let batch = RecordBatch::try_from_iter(vec![
            (
                "run_id",
                Arc::new(Int64Array::from(vec![4, 4, 5])) as ArrayRef,
            ),
            (
                "label",
                Arc::new(StringArray::from(vec!["miata", "tesla", "cx30"])) as ArrayRef,
            ),
        ])
        .unwrap();
        let map = RunLabelMap::from_batch(&batch, "run_id", "label").unwrap();
        assert_eq!(map.resolve(4), Some("miata"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_unlabeled_first_row_claims_run() {
        let batch = RecordBatch::try_from_iter(vec![
            (
                "run_id",
                Arc::new(Int64Array::from(vec![4, 4])) as ArrayRef,
            ),
            (
                "label",
                Arc::new(StringArray::from(vec![None, Some("tesla")])) as ArrayRef,
            ),
        ])
        .unwrap();
        let map = RunLabelMap::from_batch(&batch, "run_id", "label").unwrap();
        assert_eq!(map.resolve(4), None);
        assert!(map.is_empty());

        let map = map.with_overrides(&[LabelOverride {
            run_id: 4,
            label: "background".to_string(),
        }]);
        assert_eq!(map.resolve(4), Some("background"));
    }

    #[test]
    fn test_null_labels_leave_run_unlabeled() {
        let batch = list_batch(vec![(3, None), (6, Some(vec![]))]);
        let map = RunLabelMap::from_batch(&batch, "run_id", "label").unwrap();
        assert!(map.is_empty());
        assert_eq!(map.resolve(3), None);
    }

    #[test]
    fn test_overrides_win() {
        let batch = list_batch(vec![(8, Some(vec!["mustang"])), (1, Some(vec!["cx30"]))]);
        let overrides = Config::default().m3nvc.label_overrides;

        let map = RunLabelMap::from_batch(&batch, "run_id", "label")
            .unwrap()
            .with_overrides(&overrides);

        assert_eq!(map.resolve(8), Some("background"));
        assert_eq!(map.resolve(9), Some("background"));
        assert_eq!(map.resolve(1), Some("cx30"));
        assert_eq!(map.resolve(7), None);
    }

    #[test]
    fn test_missing_column_is_error() {
        let batch = list_batch(vec![(1, Some(vec!["cx30"]))]);
        assert!(RunLabelMap::from_batch(&batch, "run", "label").is_err());
    }

    #[test]
    fn test_load_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_labels.parquet");

        let batch = list_batch(vec![(1, Some(vec!["gle350", "mustang"])), (1, Some(vec!["miata"]))]);
        let schema = Arc::new(Schema::new(vec![
            Field::new("run_id", DataType::Int64, true),
            Field::new(
                "label",
                DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
                true,
            ),
        ]));
        let mut writer = ArrowWriter::try_new(File::create(&path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let map = RunLabelMap::load(&path, "run_id", "label").unwrap();
        assert_eq!(map.resolve(1), Some("gle350+mustang"));

        let err = RunLabelMap::load(&path, "run_id", "vehicles").unwrap_err();
        assert!(matches!(err, IngestError::MissingColumn { .. }));
    }
}
