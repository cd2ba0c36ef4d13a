//! Bulk copy round trip against a live PostgreSQL.
//!
//! Skipped unless `LVC_TEST_DATABASE_URL` points at a database the test may
//! create and drop tables in.

use arrow::array::{ArrayRef, Float32Array, Float64Array, Int32Array};
use arrow::record_batch::RecordBatch;
use lvc_loader::retry::RetryPolicy;
use lvc_loader::{BulkLoader, PgWarehouse, TargetTable, Warehouse};
use sqlx::postgres::PgPool;
use std::sync::Arc;

#[tokio::test]
async fn test_copy_round_trip_preserves_rows() {
    let Ok(url) = std::env::var("LVC_TEST_DATABASE_URL") else {
        return;
    };
    let pool = PgPool::connect(&url).await.unwrap();

    let name = format!("roundtrip_{}", uuid::Uuid::new_v4().simple());
    sqlx::query(&format!(
        "CREATE TABLE {name} (vehicle_id INTEGER, sensor_id INTEGER, time_stamp DOUBLE PRECISION, amplitude REAL)"
    ))
    .execute(&pool)
    .await
    .unwrap();

    let table = TargetTable {
        name: name.clone(),
        columns: ["vehicle_id", "sensor_id", "time_stamp", "amplitude"]
            .iter()
            .map(|c| c.to_string())
            .collect(),
    };

    let rows = 1000;
    let amplitudes: Vec<Option<f32>> = (0..rows)
        .map(|i| if i % 100 == 0 { None } else { Some(i as f32 * 0.001 - 0.5) })
        .collect();
    let batch = RecordBatch::try_from_iter(vec![
        ("vehicle_id", Arc::new(Int32Array::from(vec![3; rows])) as ArrayRef),
        ("sensor_id", Arc::new(Int32Array::from(vec![4; rows])) as ArrayRef),
        (
            "time_stamp",
            Arc::new(Float64Array::from_iter_values((0..rows).map(|i| i as f64 * 0.0000625)))
                as ArrayRef,
        ),
        ("amplitude", Arc::new(Float32Array::from(amplitudes.clone())) as ArrayRef),
    ])
    .unwrap();

    let warehouse = Arc::new(PgWarehouse::from_pool(pool.clone()));
    let loader = BulkLoader::new(warehouse.clone(), ',', RetryPolicy::none());
    let copied = loader.load(&batch, &table).await.unwrap();
    assert_eq!(copied, rows as u64);

    let stored: Vec<(i32, i32, f64, f32)> = sqlx::query_as(&format!(
        "SELECT vehicle_id, sensor_id, time_stamp, amplitude FROM {name} ORDER BY time_stamp"
    ))
    .fetch_all(&pool)
    .await
    .unwrap();

    sqlx::query(&format!("DROP TABLE {name}"))
        .execute(&pool)
        .await
        .unwrap();
    warehouse.close().await;

    assert_eq!(stored.len(), rows);
    for (i, (vehicle, sensor, ts, amp)) in stored.into_iter().enumerate() {
        assert_eq!((vehicle, sensor), (3, 4));
        assert!((ts - i as f64 * 0.0000625).abs() < 1e-6);
        let expected = amplitudes[i].unwrap_or(0.0);
        assert!((amp - expected).abs() < 1e-6);
    }
}
