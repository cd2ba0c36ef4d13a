use arrow::datatypes::DataType;
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Sampling period of 16 kHz acoustic recordings
pub const ACOUSTIC_PERIOD: f64 = 0.0000625;
/// Sampling period of 100 Hz seismic recordings
pub const SEISMIC_PERIOD: f64 = 0.01;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Main configuration for the loader
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Ingestion tuning
    #[serde(default)]
    pub ingest: IngestConfig,
    /// MOD_vehicle flat-file dataset
    #[serde(default)]
    pub mod_vehicle: ModVehicleConfig,
    /// M3N-VC columnar dataset
    #[serde(default)]
    pub m3nvc: M3nvcConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port; no exporter when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
    /// Count rows in memory instead of writing to PostgreSQL
    #[serde(default)]
    pub dry_run: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub dbname: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    /// Environment variable holding the database password
    #[serde(default = "default_password_env")]
    pub password_env: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// Ingestion tuning shared by every dataset
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Maximum rows per bulk copy
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Files processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Field delimiter of the bulk copy payload
    #[serde(default = "default_copy_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Bounded exponential backoff around transient storage failures
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Give up once this much time has been spent retrying
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

/// Which sample table a flat source feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Audio,
    Seismic,
}

/// Explicit numeric type of a CSV column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Float32,
    Float64,
    Int32,
    Int64,
}

impl ColumnType {
    pub fn data_type(self) -> DataType {
        match self {
            ColumnType::Float32 => DataType::Float32,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Int32 => DataType::Int32,
            ColumnType::Int64 => DataType::Int64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// One flat CSV family under the MOD_vehicle tree, e.g. every `ehz.csv`
#[derive(Debug, Clone, Deserialize)]
pub struct FlatSourceConfig {
    /// File name (or glob) matched anywhere under the dataset root
    pub file_name: String,
    pub kind: SampleKind,
    #[serde(default = "default_csv_delimiter")]
    pub delimiter: char,
    /// Every column of the file, in file order
    pub columns: Vec<ColumnConfig>,
    /// Column loaded as `amplitude`
    #[serde(default = "default_value_column")]
    pub value_column: String,
    /// Seconds between consecutive samples
    pub sample_period: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiblingConfig {
    /// Output column in the accelerometer table
    pub column: String,
    /// Sibling file name in the primary file's directory
    pub file_name: String,
}

/// Tri-axial record sets split across one file per axis
#[derive(Debug, Clone, Deserialize)]
pub struct TriAxialConfig {
    /// Glob matched against file names to find candidate sets
    pub primary: String,
    /// Output columns in table order
    pub siblings: Vec<SiblingConfig>,
    #[serde(default = "default_csv_delimiter")]
    pub delimiter: char,
    pub sample_period: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModVehicleConfig {
    /// Dataset root; the dataset is not ingested when unset
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Path segment that precedes `<vehicle>/<sensor>`
    #[serde(default = "default_mod_marker")]
    pub marker: String,
    #[serde(default = "default_flat_sources")]
    pub sources: Vec<FlatSourceConfig>,
    #[serde(default = "default_accelerometer")]
    pub accelerometer: Option<TriAxialConfig>,
}

/// Run identifier whose label is fixed regardless of scene metadata
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LabelOverride {
    pub run_id: u32,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct M3nvcConfig {
    /// Dataset root; the dataset is not ingested when unset
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Path segment that precedes `<scene>`
    #[serde(default = "default_m3nvc_marker")]
    pub marker: String,
    /// Glob matched against sensor file names
    #[serde(default = "default_m3nvc_glob")]
    pub file_glob: String,
    /// File name globs that are never sensor files
    #[serde(default = "default_excluded")]
    pub excluded: Vec<String>,
    /// Run-label table at the root of each scene
    #[serde(default = "default_label_file")]
    pub label_file: String,
    #[serde(default = "default_run_column")]
    pub run_column: String,
    #[serde(default = "default_label_column")]
    pub label_column: String,
    /// Embedded absolute timestamp column of sensor files
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    #[serde(default = "default_label_overrides")]
    pub label_overrides: Vec<LabelOverride>,
}

// Default value functions
fn default_service_name() -> String {
    "lvc-loader".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "lvc_db".to_string()
}

fn default_db_user() -> String {
    "lvc_toolkit".to_string()
}

fn default_password_env() -> String {
    "DB_PASSWORD".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_chunk_size() -> usize {
    500_000
}

fn default_workers() -> usize {
    4
}

fn default_copy_delimiter() -> char {
    ','
}

fn default_csv_delimiter() -> char {
    ','
}

fn default_initial_interval_ms() -> u64 {
    200
}

fn default_max_interval_ms() -> u64 {
    5_000
}

fn default_max_elapsed_secs() -> u64 {
    60
}

fn default_value_column() -> String {
    "amplitude".to_string()
}

fn default_mod_marker() -> String {
    "MOD_vehicle".to_string()
}

fn default_m3nvc_marker() -> String {
    "M3NVC".to_string()
}

fn default_m3nvc_glob() -> String {
    "*.parquet".to_string()
}

fn default_excluded() -> Vec<String> {
    vec!["*label*".to_string(), "*gps*".to_string(), "*disp*".to_string()]
}

fn default_label_file() -> String {
    "run_labels.parquet".to_string()
}

fn default_run_column() -> String {
    "run_id".to_string()
}

fn default_label_column() -> String {
    "label".to_string()
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

fn default_label_overrides() -> Vec<LabelOverride> {
    [8, 9]
        .into_iter()
        .map(|run_id| LabelOverride {
            run_id,
            label: "background".to_string(),
        })
        .collect()
}

fn amplitude(column_type: ColumnType) -> ColumnConfig {
    ColumnConfig {
        name: "amplitude".to_string(),
        column_type,
    }
}

fn default_flat_sources() -> Vec<FlatSourceConfig> {
    vec![
        // IOBT audio
        FlatSourceConfig {
            file_name: "aud16000.csv".to_string(),
            kind: SampleKind::Audio,
            delimiter: ',',
            columns: vec![amplitude(ColumnType::Float32)],
            value_column: default_value_column(),
            sample_period: ACOUSTIC_PERIOD,
        },
        // FOCAL audio carries a second raw column that is not loaded
        FlatSourceConfig {
            file_name: "aud.csv".to_string(),
            kind: SampleKind::Audio,
            delimiter: ',',
            columns: vec![
                amplitude(ColumnType::Float32),
                ColumnConfig {
                    name: "raw".to_string(),
                    column_type: ColumnType::Float32,
                },
            ],
            value_column: default_value_column(),
            sample_period: ACOUSTIC_PERIOD,
        },
        // IOBT and FOCAL geophone
        FlatSourceConfig {
            file_name: "ehz.csv".to_string(),
            kind: SampleKind::Seismic,
            delimiter: ' ',
            columns: vec![amplitude(ColumnType::Float32)],
            value_column: default_value_column(),
            sample_period: SEISMIC_PERIOD,
        },
    ]
}

fn default_accelerometer() -> Option<TriAxialConfig> {
    let sibling = |column: &str, file_name: &str| SiblingConfig {
        column: column.to_string(),
        file_name: file_name.to_string(),
    };
    Some(TriAxialConfig {
        primary: "accx.csv".to_string(),
        siblings: vec![
            sibling("accel_x", "accx.csv"),
            sibling("accel_y", "accy.csv"),
            sibling("accel_z", "accz.csv"),
        ],
        delimiter: ',',
        sample_period: SEISMIC_PERIOD,
    })
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
            dry_run: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            dbname: default_db_name(),
            user: default_db_user(),
            password_env: default_password_env(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            workers: default_workers(),
            delimiter: default_copy_delimiter(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            max_elapsed_secs: default_max_elapsed_secs(),
        }
    }
}

impl Default for ModVehicleConfig {
    fn default() -> Self {
        Self {
            root: None,
            marker: default_mod_marker(),
            sources: default_flat_sources(),
            accelerometer: default_accelerometer(),
        }
    }
}

impl Default for M3nvcConfig {
    fn default() -> Self {
        Self {
            root: None,
            marker: default_m3nvc_marker(),
            file_glob: default_m3nvc_glob(),
            excluded: default_excluded(),
            label_file: default_label_file(),
            run_column: default_run_column(),
            label_column: default_label_column(),
            timestamp_column: default_timestamp_column(),
            label_overrides: default_label_overrides(),
        }
    }
}

impl Config {
    /// Load configuration from config files and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/loader").required(false))
            .add_source(config::File::with_name("/etc/lvc/loader").required(false))
            // LVC__DATABASE__HOST -> database.host
            .add_source(
                config::Environment::with_prefix("LVC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.chunk_size == 0 {
            return Err(ConfigError::invalid("ingest.chunk_size", "must be positive"));
        }
        if self.ingest.workers == 0 {
            return Err(ConfigError::invalid("ingest.workers", "must be positive"));
        }
        check_delimiter("ingest.delimiter", self.ingest.delimiter)?;

        for (idx, source) in self.mod_vehicle.sources.iter().enumerate() {
            let key = format!("mod_vehicle.sources[{idx}]");
            check_delimiter(&format!("{key}.delimiter"), source.delimiter)?;
            check_period(&format!("{key}.sample_period"), source.sample_period)?;
            if !source.columns.iter().any(|c| c.name == source.value_column) {
                return Err(ConfigError::invalid(
                    format!("{key}.value_column"),
                    format!("'{}' is not one of the declared columns", source.value_column),
                ));
            }
        }

        if let Some(ref accel) = self.mod_vehicle.accelerometer {
            check_delimiter("mod_vehicle.accelerometer.delimiter", accel.delimiter)?;
            check_period("mod_vehicle.accelerometer.sample_period", accel.sample_period)?;
            if accel.siblings.is_empty() {
                return Err(ConfigError::invalid(
                    "mod_vehicle.accelerometer.siblings",
                    "at least one sibling is required",
                ));
            }
            let mut seen = HashSet::new();
            for sibling in &accel.siblings {
                if !seen.insert(sibling.column.as_str()) {
                    return Err(ConfigError::invalid(
                        "mod_vehicle.accelerometer.siblings",
                        format!("duplicate output column '{}'", sibling.column),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn retry_initial_interval(&self) -> Duration {
        Duration::from_millis(self.ingest.retry.initial_interval_ms)
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_millis(self.ingest.retry.max_interval_ms)
    }

    pub fn retry_max_elapsed(&self) -> Duration {
        Duration::from_secs(self.ingest.retry.max_elapsed_secs)
    }
}

impl DatabaseConfig {
    /// Connection options with the password taken from the environment
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.user);

        match std::env::var(&self.password_env) {
            Ok(password) => options.password(&password),
            Err(_) => {
                tracing::warn!(
                    variable = %self.password_env,
                    "Database password variable not set, connecting without password"
                );
                options
            }
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn check_delimiter(key: &str, delimiter: char) -> Result<(), ConfigError> {
    if !delimiter.is_ascii() || delimiter == '\n' || delimiter == '\r' {
        return Err(ConfigError::invalid(
            key,
            format!("{delimiter:?} is not a single-byte field delimiter"),
        ));
    }
    Ok(())
}

fn check_period(key: &str, period: f64) -> Result<(), ConfigError> {
    if !(period.is_finite() && period > 0.0) {
        return Err(ConfigError::invalid(key, format!("{period} is not a positive period")));
    }
    Ok(())
}
