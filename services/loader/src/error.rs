//! Error taxonomy and per-unit outcomes.
//!
//! Components never swallow failures: they return either a [`FileOutcome`]
//! (loaded or skipped with a reason) or an [`IngestError`], and the pipeline
//! decides whether to continue with the next file or abort the run.

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the storage collaborator
#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("Storage connection failed: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("Storage query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("Bulk copy into {table} failed: {source}")]
    Copy {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("No {kind} id returned for '{name}'")]
    IdentityUnresolved { kind: String, name: String },
}

/// SQLSTATE codes worth another attempt: deadlock, lock unavailable,
/// serialization failure, admin shutdown
const TRANSIENT_SQLSTATES: &[&str] = &["40P01", "55P03", "40001", "57P01"];

fn sqlx_is_connection_level(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
    )
}

fn sqlx_is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref()))
            .unwrap_or(false),
        _ => false,
    }
}

impl WarehouseError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            WarehouseError::Connection(_) => true,
            WarehouseError::Query(source) | WarehouseError::Copy { source, .. } => {
                sqlx_is_transient(source)
            }
            WarehouseError::IdentityUnresolved { .. } => false,
        }
    }

    /// Whether the storage collaborator itself is unusable
    pub fn is_connection_level(&self) -> bool {
        match self {
            WarehouseError::Connection(_) => true,
            WarehouseError::Query(source) | WarehouseError::Copy { source, .. } => {
                sqlx_is_connection_level(source)
            }
            WarehouseError::IdentityUnresolved { .. } => false,
        }
    }
}

/// Failure of a single ingestion unit (file or tri-axial set)
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: ArrowError,
    },

    #[error("Failed to read Parquet file {path}: {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: ParquetError,
    },

    #[error("Column '{column}' missing or not usable in {path}")]
    MissingColumn { path: PathBuf, column: String },

    #[error(
        "Row count mismatch in {dir}: '{column}' has {found} rows, expected {expected}"
    )]
    RowCountMismatch {
        dir: PathBuf,
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("Failed to assemble batch for {table}: {source}")]
    Assemble {
        table: String,
        #[source]
        source: ArrowError,
    },

    #[error("Bulk load into {table} failed (first line: {first_line:?}): {source}")]
    BulkLoad {
        table: String,
        first_line: String,
        #[source]
        source: WarehouseError,
    },

    #[error("Reader task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IngestError {
    /// Connection-level failures abort the whole run; everything else only
    /// fails the current unit
    pub fn is_fatal_for_run(&self) -> bool {
        match self {
            IngestError::Warehouse(err) => err.is_connection_level(),
            IngestError::BulkLoad { source, .. } => source.is_connection_level(),
            _ => false,
        }
    }
}

/// Why a unit was excluded from ingestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The dataset marker segment is not in the path
    NoMarker(String),
    /// Fewer segments than required follow the marker
    TooFewSegments { needed: usize, found: usize },
    /// File name does not follow the run/sensor/modality convention
    FilenamePattern(String),
    /// Modality code outside the recognized set
    UnknownModality(String),
    /// Source file has no bytes or no rows
    Empty,
    /// A tri-axial sibling is absent
    MissingSibling(String),
    /// Run has no label in the scene metadata and no override
    UnlabeledRun(u32),
}

impl SkipReason {
    /// Silent skips are expected artifacts and only logged at debug level
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            SkipReason::FilenamePattern(_) | SkipReason::UnknownModality(_)
        )
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoMarker(marker) => write!(f, "marker segment '{marker}' not in path"),
            SkipReason::TooFewSegments { needed, found } => write!(
                f,
                "{found} segment(s) after marker, {needed} needed"
            ),
            SkipReason::FilenamePattern(name) => {
                write!(f, "file name '{name}' does not match run<N>_rs<N>_<mod>")
            }
            SkipReason::UnknownModality(code) => write!(f, "unrecognized modality '{code}'"),
            SkipReason::Empty => write!(f, "source file is empty"),
            SkipReason::MissingSibling(name) => write!(f, "sibling file '{name}' is missing"),
            SkipReason::UnlabeledRun(run_id) => write!(f, "run {run_id} has no label"),
        }
    }
}

/// Result of one successfully handled unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Loaded { rows: u64 },
    Skipped(SkipReason),
}
