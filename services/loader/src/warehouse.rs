//! Storage collaborator.
//!
//! The pipeline only needs two primitives from the warehouse: an atomic
//! get-or-create for dictionary names and a bulk copy of a pre-formatted
//! buffer. [`PgWarehouse`] implements them on PostgreSQL; [`MemoryWarehouse`]
//! keeps everything in process for dry runs and tests.

use crate::config::DatabaseConfig;
use crate::error::WarehouseError;
use crate::identity::IdentityKind;
use crate::tables::TargetTable;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

/// SQLSTATE of a unique constraint violation
const UNIQUE_VIOLATION: &str = "23505";

/// Storage session shared by every component of a run
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Id of `name` in the `kind` dictionary, inserting it if absent. At most
    /// one row per distinct name is ever created, whatever the concurrency.
    async fn get_or_create_identity(
        &self,
        kind: IdentityKind,
        name: &str,
    ) -> Result<i32, WarehouseError>;

    /// Bulk copy a text-format payload into `table`; returns rows copied
    async fn copy_in(
        &self,
        table: &TargetTable,
        delimiter: char,
        payload: Bytes,
    ) -> Result<u64, WarehouseError>;

    /// Release the session
    async fn close(&self);
}

/// PostgreSQL warehouse over a connection pool
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    /// Create a new warehouse session with connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_with(config.connect_options())
            .await
            .map_err(WarehouseError::Connection)?;

        info!(
            host = %config.host,
            database = %config.dbname,
            "Connected to PostgreSQL warehouse"
        );

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn select_identity(
        &self,
        kind: IdentityKind,
        name: &str,
    ) -> Result<Option<i32>, WarehouseError> {
        sqlx::query_scalar::<_, i32>(&select_sql(kind))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(WarehouseError::Query)
    }
}

fn select_sql(kind: IdentityKind) -> String {
    format!(
        "SELECT {id} FROM {table} WHERE {name} = $1 ORDER BY {id} LIMIT 1",
        id = kind.id_column(),
        table = kind.table(),
        name = kind.name_column(),
    )
}

fn insert_sql(kind: IdentityKind) -> String {
    format!(
        "INSERT INTO {table} ({name}) VALUES ($1) RETURNING {id}",
        id = kind.id_column(),
        table = kind.table(),
        name = kind.name_column(),
    )
}

/// `COPY` statement for a target table in its declared column order
pub fn copy_statement(table: &TargetTable, delimiter: char) -> String {
    let delimiter = if delimiter == '\'' {
        "''".to_string()
    } else {
        delimiter.to_string()
    };
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text, DELIMITER '{}')",
        table.name,
        table.columns.join(", "),
        delimiter
    )
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

#[async_trait]
impl Warehouse for PgWarehouse {
    #[instrument(skip(self))]
    async fn get_or_create_identity(
        &self,
        kind: IdentityKind,
        name: &str,
    ) -> Result<i32, WarehouseError> {
        let mut tx = self.pool.begin().await.map_err(WarehouseError::Connection)?;

        // Serializes creators of the same name across every session,
        // whether or not the dictionary carries a unique constraint.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{}", kind.table(), name))
            .execute(&mut *tx)
            .await
            .map_err(WarehouseError::Query)?;

        let existing = sqlx::query_scalar::<_, i32>(&select_sql(kind))
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(WarehouseError::Query)?;

        if let Some(id) = existing {
            tx.commit().await.map_err(WarehouseError::Query)?;
            return Ok(id);
        }

        let inserted = sqlx::query_scalar::<_, i32>(&insert_sql(kind))
            .bind(name)
            .fetch_one(&mut *tx)
            .await;

        match inserted {
            Ok(id) => {
                tx.commit().await.map_err(WarehouseError::Query)?;
                debug!(kind = %kind, name = %name, id = id, "Created dictionary entry");
                Ok(id)
            }
            Err(e) if is_unique_violation(&e) => {
                // Lost a race against a writer outside the advisory lock
                drop(tx);
                warn!(kind = %kind, name = %name, "Uniqueness conflict, re-reading id");
                self.select_identity(kind, name)
                    .await?
                    .ok_or_else(|| WarehouseError::IdentityUnresolved {
                        kind: kind.to_string(),
                        name: name.to_string(),
                    })
            }
            Err(e) => Err(WarehouseError::Query(e)),
        }
    }

    #[instrument(skip(self, table, payload), fields(table = %table.name, bytes = payload.len()))]
    async fn copy_in(
        &self,
        table: &TargetTable,
        delimiter: char,
        payload: Bytes,
    ) -> Result<u64, WarehouseError> {
        let copy_err = |source| WarehouseError::Copy {
            table: table.name.clone(),
            source,
        };

        let statement = copy_statement(table, delimiter);
        let mut conn = self.pool.acquire().await.map_err(copy_err)?;
        let mut copy = conn.copy_in_raw(&statement).await.map_err(copy_err)?;

        let sent = copy.send(payload).await.map(|_| ());
        if let Err(e) = sent {
            if let Err(abort_err) = copy.abort(e.to_string()).await {
                debug!(error = %abort_err, "Abort after failed copy reported an error");
            }
            return Err(copy_err(e));
        }

        copy.finish().await.map_err(copy_err)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Warehouse connection pool closed");
    }
}

/// Rows copied into one table of a [`MemoryWarehouse`]
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub row_count: u64,
}

/// In-process warehouse.
///
/// Dictionary ids are assigned sequentially from 1. Copied payloads are
/// parsed back into text fields, or only counted when built with
/// [`MemoryWarehouse::counting`].
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    identities: Mutex<HashMap<IdentityKind, Vec<String>>>,
    tables: Mutex<HashMap<String, MemoryTable>>,
    retain_rows: bool,
}

impl MemoryWarehouse {
    /// Warehouse that keeps every copied row
    pub fn new() -> Self {
        Self {
            retain_rows: true,
            ..Default::default()
        }
    }

    /// Warehouse that only counts copied rows
    pub fn counting() -> Self {
        Self::default()
    }

    /// Names of a dictionary in id order
    pub fn identities(&self, kind: IdentityKind) -> Vec<String> {
        self.identities.lock().get(&kind).cloned().unwrap_or_default()
    }

    /// Snapshot of one table
    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.tables.lock().get(name).cloned()
    }

    /// Rows copied per table
    pub fn row_counts(&self) -> HashMap<String, u64> {
        self.tables
            .lock()
            .iter()
            .map(|(name, table)| (name.clone(), table.row_count))
            .collect()
    }
}

/// Split one text-format line, undoing backslash escapes
fn parse_text_line(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => current.push('\n'),
                Some('r') => current.push('\r'),
                Some('t') => current.push('\t'),
                Some(other) => current.push(other),
                None => {}
            }
        } else if c == delimiter {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);
    fields
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn get_or_create_identity(
        &self,
        kind: IdentityKind,
        name: &str,
    ) -> Result<i32, WarehouseError> {
        tokio::task::yield_now().await;

        let mut identities = self.identities.lock();
        let names = identities.entry(kind).or_default();
        let idx = match names.iter().position(|n| n == name) {
            Some(idx) => idx,
            None => {
                names.push(name.to_string());
                names.len() - 1
            }
        };
        Ok(idx as i32 + 1)
    }

    async fn copy_in(
        &self,
        table: &TargetTable,
        delimiter: char,
        payload: Bytes,
    ) -> Result<u64, WarehouseError> {
        let text = String::from_utf8_lossy(&payload);
        let lines: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();

        let mut tables = self.tables.lock();
        let entry = tables.entry(table.name.clone()).or_default();
        if entry.columns.is_empty() {
            entry.columns = table.columns.clone();
        }
        entry.row_count += lines.len() as u64;
        if self.retain_rows {
            entry
                .rows
                .extend(lines.iter().map(|line| parse_text_line(line, delimiter)));
        }

        Ok(lines.len() as u64)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_meta::Modality;

    #[test]
    fn test_copy_statement_lists_columns_in_order() {
        let statement = copy_statement(&TargetTable::m3nvc(Modality::Seismic), ',');
        assert_eq!(
            statement,
            "COPY m3nvc_seismic_data (vehicle_id, sensor_id, run_id, time_stamp, channel, amplitude) \
             FROM STDIN WITH (FORMAT text, DELIMITER ',')"
        );
    }

    #[test]
    fn test_identity_sql() {
        assert_eq!(
            insert_sql(IdentityKind::Sensor),
            "INSERT INTO sensor_ids (sensor) VALUES ($1) RETURNING sensor_id"
        );
        assert!(select_sql(IdentityKind::Vehicle).starts_with("SELECT vehicle_id FROM vehicle_ids"));
    }

    #[test]
    fn test_parse_text_line_unescapes() {
        assert_eq!(
            parse_text_line(r"1,a\,b,c\\d", ','),
            vec!["1".to_string(), "a,b".to_string(), r"c\d".to_string()]
        );
    }

    #[tokio::test]
    async fn test_memory_copy_counts_and_retains() {
        let warehouse = MemoryWarehouse::new();
        let rows = warehouse
            .copy_in(&TargetTable::audio(), ',', Bytes::from_static(b"1,1,0,0.5\n1,1,0.1,0.25\n"))
            .await
            .unwrap();
        assert_eq!(rows, 2);

        let table = warehouse.table("audio_data").unwrap();
        assert_eq!(table.rows[1], vec!["1", "1", "0.1", "0.25"]);

        let counting = MemoryWarehouse::counting();
        counting
            .copy_in(&TargetTable::audio(), ',', Bytes::from_static(b"1,1,0,0.5\n"))
            .await
            .unwrap();
        assert!(counting.table("audio_data").unwrap().rows.is_empty());
        assert_eq!(counting.row_counts()["audio_data"], 1);
    }

    /// Runs against a real database only when `LVC_TEST_DATABASE_URL` is set
    #[tokio::test]
    async fn test_postgres_get_or_create_is_idempotent() {
        let Ok(url) = std::env::var("LVC_TEST_DATABASE_URL") else {
            return;
        };
        let pool = PgPool::connect(&url).await.unwrap();
        for ddl in [
            "CREATE TABLE IF NOT EXISTS vehicle_ids (vehicle_id SERIAL PRIMARY KEY, vehicle VARCHAR(50))",
            "CREATE TABLE IF NOT EXISTS sensor_ids (sensor_id SERIAL PRIMARY KEY, sensor VARCHAR(8))",
        ] {
            sqlx::query(ddl).execute(&pool).await.unwrap();
        }
        let warehouse = PgWarehouse::from_pool(pool);

        let name = format!("test-{}", uuid::Uuid::new_v4());
        let first = warehouse
            .get_or_create_identity(IdentityKind::Vehicle, &name)
            .await
            .unwrap();
        let second = warehouse
            .get_or_create_identity(IdentityKind::Vehicle, &name)
            .await
            .unwrap();
        assert_eq!(first, second);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vehicle_ids WHERE vehicle = $1")
            .bind(&name)
            .fetch_one(warehouse.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
        warehouse.close().await;
    }
}
