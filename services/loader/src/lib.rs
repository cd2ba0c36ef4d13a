//! LVC Warehouse Loader
//!
//! Batch ingestion of vehicle sensor recordings into the LVC PostgreSQL
//! warehouse. Recordings arrive as flat CSV files laid out by
//! `<vehicle>/<sensor>` directories, as per-axis accelerometer files that
//! must be joined sample by sample, and as columnar run snapshots grouped by
//! scene with a separate run-label table.
//!
//! ## Features
//!
//! - **Dictionary keys**: vehicle and sensor names become stable integer ids,
//!   created on first sight and safe under concurrent workers
//! - **Bounded memory**: flat recordings stream through fixed-size chunks with
//!   continuous synthesized timestamps
//! - **Bulk transfer**: every chunk is written with a single `COPY ... FROM
//!   STDIN`, never row by row
//! - **Typed outcomes**: each file is loaded, skipped with a reason, or
//!   failed; only a lost storage connection stops the run
//!
//! ## Architecture
//!
//! ```text
//!  Dataset tree            Path metadata          Identity resolver
//! ┌──────────────┐        ┌──────────────┐       ┌──────────────┐
//! │ MOD_vehicle/ │───────▶│ vehicle,     │──────▶│ vehicle_ids  │
//! │ M3NVC/       │        │ sensor, run  │       │ sensor_ids   │
//! └──────────────┘        └──────────────┘       └──────────────┘
//!        │                       ▲                      │
//!        ▼                       │                      ▼
//! ┌──────────────┐        ┌──────────────┐       ┌──────────────┐
//! │ Chunked      │        │ Run labels   │       │ Bulk loader  │
//! │ reader /     │───────────────────────────────▶│ (COPY)       │
//! │ tri-axial    │        └──────────────┘       └──────────────┘
//! └──────────────┘
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod labels;
pub mod loader;
pub mod path_meta;
pub mod pipeline;
pub mod reader;
pub mod retry;
pub mod tables;
pub mod triaxial;
pub mod warehouse;

pub use config::Config;
pub use error::{FileOutcome, IngestError, SkipReason, WarehouseError};
pub use identity::{IdentityKind, IdentityResolver};
pub use labels::RunLabelMap;
pub use loader::BulkLoader;
pub use path_meta::{Extraction, MarkerPathParser, PathStrategy, RunFilePathParser};
pub use pipeline::{Pipeline, RunSummary};
pub use tables::TargetTable;
pub use triaxial::TriAxialMerger;
pub use warehouse::{MemoryWarehouse, PgWarehouse, Warehouse};
