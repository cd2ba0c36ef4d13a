//! Tri-axial record sets.
//!
//! Accelerometer recordings are split into one single-column file per axis
//! stored side by side. A set is only loadable when every axis file is
//! present and all of them have the same number of samples; rows are then
//! joined by position.

use crate::config::{SiblingConfig, TriAxialConfig};
use crate::error::{IngestError, SkipReason};
use crate::path_meta::Extraction;
use crate::reader::{read_column, CsvLayout, SampleChunk, TimestampSynthesizer};
use crate::tables::TargetTable;
use arrow::array::{Array, ArrayRef};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Keep the first primary file of each directory
pub fn set_primaries<I>(primaries: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut seen = HashSet::new();
    primaries
        .into_iter()
        .filter(|p| {
            let dir = p.parent().map(Path::to_path_buf).unwrap_or_default();
            seen.insert(dir)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct TriAxialMerger {
    siblings: Vec<SiblingConfig>,
    delimiter: u8,
    sample_period: f64,
    chunk_size: usize,
}

impl TriAxialMerger {
    pub fn new(config: &TriAxialConfig, chunk_size: usize) -> Self {
        Self {
            siblings: config.siblings.clone(),
            delimiter: config.delimiter as u8,
            sample_period: config.sample_period,
            chunk_size,
        }
    }

    /// Destination table, axis columns in declared order
    pub fn table(&self) -> TargetTable {
        let columns: Vec<&str> = self.siblings.iter().map(|s| s.column.as_str()).collect();
        TargetTable::accelerometer(&columns)
    }

    /// Merge the set containing `primary` into load-ready chunks.
    ///
    /// A missing sibling skips the whole set; differing row counts are an
    /// error.
    pub fn merge(&self, primary: &Path) -> Result<Extraction<Vec<SampleChunk>>, IngestError> {
        let dir = primary.parent().unwrap_or_else(|| Path::new(""));

        let mut paths = Vec::with_capacity(self.siblings.len());
        for sibling in &self.siblings {
            let path = dir.join(&sibling.file_name);
            if !path.is_file() {
                return Ok(Extraction::Skipped(SkipReason::MissingSibling(
                    sibling.file_name.clone(),
                )));
            }
            paths.push(path);
        }

        let mut columns: Vec<(String, ArrayRef)> = Vec::with_capacity(self.siblings.len());
        for (sibling, path) in self.siblings.iter().zip(&paths) {
            let layout = CsvLayout::single_column(&sibling.column, self.delimiter);
            let array = read_column(path, &layout)?;

            if let Some((_, expected)) = columns.first() {
                if array.len() != expected.len() {
                    return Err(IngestError::RowCountMismatch {
                        dir: dir.to_path_buf(),
                        column: sibling.column.clone(),
                        expected: expected.len(),
                        found: array.len(),
                    });
                }
            }
            columns.push((sibling.column.clone(), array));
        }

        let rows = columns.first().map(|(_, a)| a.len()).unwrap_or(0);
        if rows == 0 {
            return Ok(Extraction::Skipped(SkipReason::Empty));
        }

        debug!(dir = %dir.display(), rows = rows, "Merged tri-axial set");
        let merged = SampleChunk {
            time_stamp: TimestampSynthesizer::new(self.sample_period).next_block(rows),
            columns,
        };
        Ok(Extraction::Resolved(merged.split(self.chunk_size)))
    }
}
