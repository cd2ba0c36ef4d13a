//! Ingestion orchestrator.
//!
//! A run walks each configured dataset, turns every discovered file (or
//! tri-axial set) into an independent unit of work and drives up to
//! `ingest.workers` units concurrently. Each unit ends as loaded, skipped or
//! failed; only connection-level storage failures stop the run.

use crate::config::{Config, FlatSourceConfig, TriAxialConfig};
use crate::discovery::{discover, subdirectories, FileFilter, PatternError};
use crate::error::{FileOutcome, IngestError, SkipReason, WarehouseError};
use crate::identity::{IdentityKind, IdentityResolver};
use crate::labels::RunLabelMap;
use crate::loader::BulkLoader;
use crate::path_meta::{Extraction, MarkerPathParser, PathStrategy, RunFilePathParser};
use crate::reader::{read_snapshot, ChunkedCsvReader, CsvLayout, SampleChunk};
use crate::retry::RetryPolicy;
use crate::tables::{assemble, RowKeys, TargetTable};
use crate::triaxial::{set_primaries, TriAxialMerger};
use crate::warehouse::Warehouse;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// A unit that failed without stopping the run
#[derive(Debug, Clone, Serialize)]
pub struct FailedUnit {
    pub path: PathBuf,
    pub error: String,
}

/// Totals of one ingestion run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub loaded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub rows_copied: u64,
    pub failures: Vec<FailedUnit>,
}

impl RunSummary {
    fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            loaded: 0,
            skipped: 0,
            failed: 0,
            rows_copied: 0,
            failures: Vec::new(),
        }
    }

    /// Account for one finished unit. Returns the error back when it must
    /// abort the run.
    fn record(
        &mut self,
        path: &Path,
        outcome: Result<FileOutcome, IngestError>,
    ) -> Result<(), IngestError> {
        match outcome {
            Ok(FileOutcome::Loaded { rows }) => {
                self.loaded += 1;
                self.rows_copied += rows;
                metrics::counter!("ingest.units.loaded").increment(1);
                info!(path = %path.display(), rows = rows, "Loaded");
            }
            Ok(FileOutcome::Skipped(reason)) => {
                self.skipped += 1;
                metrics::counter!("ingest.units.skipped").increment(1);
                if reason.is_silent() {
                    debug!(path = %path.display(), reason = %reason, "Skipped");
                } else {
                    warn!(path = %path.display(), reason = %reason, "Skipped");
                }
            }
            Err(e) => {
                self.failed += 1;
                metrics::counter!("ingest.units.failed").increment(1);
                if e.is_fatal_for_run() {
                    error!(path = %path.display(), error = %e, "Storage unavailable, aborting run");
                    return Err(e);
                }
                error!(path = %path.display(), error = %e, "Failed");
                self.failures.push(FailedUnit {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

fn skipped(reason: SkipReason) -> Result<FileOutcome, IngestError> {
    Ok(FileOutcome::Skipped(reason))
}

/// Drives every configured dataset into the warehouse
pub struct Pipeline {
    config: Config,
    resolver: IdentityResolver,
    loader: BulkLoader,
    retry: RetryPolicy,
    vehicle_paths: MarkerPathParser,
    run_files: RunFilePathParser,
    flat_filters: Vec<FileFilter>,
    accel_filter: Option<FileFilter>,
    run_filter: FileFilter,
}

impl Pipeline {
    /// Build a pipeline over `warehouse`; fails only on malformed file patterns
    pub fn new(config: Config, warehouse: Arc<dyn Warehouse>) -> Result<Self, PatternError> {
        let retry = RetryPolicy::from_config(&config);

        let flat_filters = config
            .mod_vehicle
            .sources
            .iter()
            .map(|s| FileFilter::new(&s.file_name))
            .collect::<Result<Vec<_>, _>>()?;
        let accel_filter = config
            .mod_vehicle
            .accelerometer
            .as_ref()
            .map(|a| FileFilter::new(&a.primary))
            .transpose()?;
        let run_filter =
            FileFilter::new(&config.m3nvc.file_glob)?.excluding(&config.m3nvc.excluded)?;

        Ok(Self {
            resolver: IdentityResolver::new(warehouse.clone()),
            loader: BulkLoader::new(warehouse, config.ingest.delimiter, retry.clone()),
            retry,
            vehicle_paths: MarkerPathParser::new(config.mod_vehicle.marker.clone()),
            run_files: RunFilePathParser::new(config.m3nvc.marker.clone()),
            flat_filters,
            accel_filter,
            run_filter,
            config,
        })
    }

    /// Ingest every configured dataset
    pub async fn run(&self) -> Result<RunSummary, IngestError> {
        let mut summary = RunSummary::start();
        info!(run_id = %summary.run_id, "Ingestion run started");

        if let Some(root) = &self.config.mod_vehicle.root {
            self.ingest_flat_sources(root, &mut summary).await?;
            if let Some(accel) = &self.config.mod_vehicle.accelerometer {
                self.ingest_tri_axial(root, accel, &mut summary).await?;
            }
        }
        if let Some(root) = &self.config.m3nvc.root {
            self.ingest_m3nvc(root, &mut summary).await?;
        }

        summary.finish();
        info!(
            run_id = %summary.run_id,
            loaded = summary.loaded,
            skipped = summary.skipped,
            failed = summary.failed,
            rows = summary.rows_copied,
            "Ingestion run finished"
        );
        Ok(summary)
    }

    async fn process_all<I, Fut>(&self, units: I, summary: &mut RunSummary) -> Result<(), IngestError>
    where
        I: IntoIterator<Item = (PathBuf, Fut)>,
        Fut: Future<Output = Result<FileOutcome, IngestError>>,
    {
        let mut outcomes = stream::iter(units)
            .map(|(path, unit)| async move { (path, unit.await) })
            .buffer_unordered(self.config.ingest.workers);

        while let Some((path, outcome)) = outcomes.next().await {
            summary.record(&path, outcome)?;
        }
        Ok(())
    }

    async fn resolve(&self, kind: IdentityKind, name: &str) -> Result<i32, WarehouseError> {
        self.retry
            .run("identity resolution", || self.resolver.resolve(kind, name))
            .await
    }

    async fn row_keys(
        &self,
        vehicle: &str,
        sensor: &str,
        run_id: Option<u32>,
    ) -> Result<RowKeys, IngestError> {
        Ok(RowKeys {
            vehicle_id: self.resolve(IdentityKind::Vehicle, vehicle).await?,
            sensor_id: self.resolve(IdentityKind::Sensor, sensor).await?,
            run_id,
        })
    }

    async fn load_chunk(
        &self,
        table: &TargetTable,
        keys: &RowKeys,
        chunk: SampleChunk,
    ) -> Result<u64, IngestError> {
        let batch = assemble(table, keys, chunk).map_err(|source| IngestError::Assemble {
            table: table.name.clone(),
            source,
        })?;
        self.loader.load(&batch, table).await
    }

    async fn load_chunks(
        &self,
        table: &TargetTable,
        keys: &RowKeys,
        chunks: Vec<SampleChunk>,
    ) -> Result<FileOutcome, IngestError> {
        let mut rows = 0;
        for chunk in chunks {
            rows += self.load_chunk(table, keys, chunk).await?;
        }
        Ok(FileOutcome::Loaded { rows })
    }

    async fn ingest_flat_sources(
        &self,
        root: &Path,
        summary: &mut RunSummary,
    ) -> Result<(), IngestError> {
        for (source, filter) in self.config.mod_vehicle.sources.iter().zip(&self.flat_filters) {
            let files = discover(root, filter);
            info!(source = %source.file_name, files = files.len(), "Ingesting flat source");

            let units = files
                .into_iter()
                .map(|path| (path.clone(), self.load_flat_file(path, source)));
            self.process_all(units, summary).await?;
        }
        Ok(())
    }

    /// Stream one CSV recording into its sample table, one chunk at a time
    #[instrument(skip(self, path, source), fields(path = %path.display()))]
    async fn load_flat_file(
        &self,
        path: PathBuf,
        source: &FlatSourceConfig,
    ) -> Result<FileOutcome, IngestError> {
        let location = match self.vehicle_paths.extract(&path) {
            Extraction::Resolved(location) => location,
            Extraction::Skipped(reason) => return skipped(reason),
        };

        let table = TargetTable::for_kind(source.kind);
        let layout = CsvLayout::from_source(source);
        let period = source.sample_period;
        let chunk_size = self.config.ingest.chunk_size;

        let (tx, mut rx) = mpsc::channel::<Result<SampleChunk, IngestError>>(1);
        let reader_path = path.clone();
        let reader = tokio::task::spawn_blocking(move || -> Result<bool, IngestError> {
            let Some(chunks) = ChunkedCsvReader::open(&reader_path, &layout, period, chunk_size)?
            else {
                return Ok(false);
            };
            for chunk in chunks {
                let failed = chunk.is_err();
                // receiver gone means the loading side already gave up
                if tx.blocking_send(chunk).is_err() || failed {
                    break;
                }
            }
            Ok(true)
        });

        // Keys are resolved on the first chunk so empty files never create
        // dictionary entries.
        let mut keys = None;
        let mut rows = 0;
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            let row_keys = match keys {
                Some(keys) => keys,
                None => {
                    let resolved = self
                        .row_keys(&location.vehicle, &location.sensor, None)
                        .await?;
                    debug!(
                        vehicle = %location.vehicle,
                        sensor = %location.sensor,
                        vehicle_id = resolved.vehicle_id,
                        sensor_id = resolved.sensor_id,
                        "Keys resolved"
                    );
                    *keys.insert(resolved)
                }
            };
            rows += self.load_chunk(&table, &row_keys, chunk).await?;
        }

        let opened = reader.await??;
        if !opened || keys.is_none() {
            return skipped(SkipReason::Empty);
        }
        Ok(FileOutcome::Loaded { rows })
    }

    async fn ingest_tri_axial(
        &self,
        root: &Path,
        accel: &TriAxialConfig,
        summary: &mut RunSummary,
    ) -> Result<(), IngestError> {
        let Some(filter) = &self.accel_filter else {
            return Ok(());
        };
        let primaries = set_primaries(discover(root, filter));
        info!(sets = primaries.len(), "Ingesting tri-axial sets");

        let merger = TriAxialMerger::new(accel, self.config.ingest.chunk_size);
        let units = primaries
            .into_iter()
            .map(|primary| (primary.clone(), self.load_tri_axial_set(primary, &merger)));
        self.process_all(units, summary).await
    }

    #[instrument(skip(self, primary, merger), fields(path = %primary.display()))]
    async fn load_tri_axial_set(
        &self,
        primary: PathBuf,
        merger: &TriAxialMerger,
    ) -> Result<FileOutcome, IngestError> {
        let location = match self.vehicle_paths.extract(&primary) {
            Extraction::Resolved(location) => location,
            Extraction::Skipped(reason) => return skipped(reason),
        };

        let worker = merger.clone();
        let merged = tokio::task::spawn_blocking(move || worker.merge(&primary)).await??;
        let chunks = match merged {
            Extraction::Resolved(chunks) => chunks,
            Extraction::Skipped(reason) => return skipped(reason),
        };

        let keys = self
            .row_keys(&location.vehicle, &location.sensor, None)
            .await?;
        self.load_chunks(&merger.table(), &keys, chunks).await
    }

    async fn ingest_m3nvc(&self, root: &Path, summary: &mut RunSummary) -> Result<(), IngestError> {
        let scenes = subdirectories(root).map_err(|source| IngestError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        // Scenes run one after another; files within a scene in parallel
        for scene in scenes {
            let labels = self.scene_labels(&scene, summary).await?;
            let files = discover(&scene, &self.run_filter);
            info!(
                scene = %scene.display(),
                files = files.len(),
                labeled_runs = labels.len(),
                "Ingesting scene"
            );

            let units = files
                .into_iter()
                .map(|path| (path.clone(), self.load_run_file(path, &labels)));
            self.process_all(units, summary).await?;
        }
        Ok(())
    }

    /// Run labels of one scene with the configured overrides applied
    async fn scene_labels(
        &self,
        scene: &Path,
        summary: &mut RunSummary,
    ) -> Result<RunLabelMap, IngestError> {
        let m3nvc = &self.config.m3nvc;
        let path = scene.join(&m3nvc.label_file);

        let labels = if path.is_file() {
            let (label_path, run_column, label_column) =
                (path.clone(), m3nvc.run_column.clone(), m3nvc.label_column.clone());
            let loaded = tokio::task::spawn_blocking(move || {
                RunLabelMap::load(&label_path, &run_column, &label_column)
            })
            .await?;
            match loaded {
                Ok(labels) => labels,
                Err(e) => {
                    // an unreadable label table fails on its own; the scene
                    // still loads the runs its overrides cover
                    summary.record(&path, Err(e))?;
                    RunLabelMap::empty()
                }
            }
        } else {
            warn!(scene = %scene.display(), "Scene has no run labels, using overrides only");
            RunLabelMap::empty()
        };

        Ok(labels.with_overrides(&m3nvc.label_overrides))
    }

    #[instrument(skip(self, path, labels), fields(path = %path.display()))]
    async fn load_run_file(
        &self,
        path: PathBuf,
        labels: &RunLabelMap,
    ) -> Result<FileOutcome, IngestError> {
        let run = match self.run_files.extract(&path) {
            Extraction::Resolved(run) => run,
            Extraction::Skipped(reason) => return skipped(reason),
        };
        let Some(label) = labels.resolve(run.run_id) else {
            return skipped(SkipReason::UnlabeledRun(run.run_id));
        };

        let timestamp_column = self.config.m3nvc.timestamp_column.clone();
        let chunk_size = self.config.ingest.chunk_size;
        let modality = run.modality;
        let chunks = tokio::task::spawn_blocking(move || {
            read_snapshot(&path, &timestamp_column, modality, chunk_size)
        })
        .await??;
        let Some(chunks) = chunks else {
            return skipped(SkipReason::Empty);
        };

        let keys = self.row_keys(label, &run.sensor, Some(run.run_id)).await?;
        debug!(
            scene = %run.scene,
            run_id = run.run_id,
            vehicle = %label,
            sensor = %run.sensor,
            modality = modality.as_str(),
            "Loading run file"
        );
        self.load_chunks(&TargetTable::m3nvc(modality), &keys, chunks)
            .await
    }
}
