use anyhow::{Context, Result};
use lvc_loader::config::Config;
use lvc_loader::{MemoryWarehouse, PgWarehouse, Pipeline, Warehouse};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        dry_run = config.service.dry_run,
        "Starting LVC warehouse loader"
    );

    // Initialize metrics
    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    if config.mod_vehicle.root.is_none() && config.m3nvc.root.is_none() {
        warn!("No dataset root configured, nothing to ingest");
    }

    let warehouse: Arc<dyn Warehouse> = if config.service.dry_run {
        Arc::new(MemoryWarehouse::counting())
    } else {
        Arc::new(
            PgWarehouse::connect(&config.database)
                .await
                .context("Failed to connect to warehouse")?,
        )
    };

    let pipeline = Pipeline::new(config, warehouse.clone()).context("Invalid file pattern")?;
    let result = pipeline.run().await;

    // The session is released whether or not the run completed
    warehouse.close().await;

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Ingestion run aborted");
            return Err(e).context("Ingestion run aborted");
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to serialize run summary")?
    );

    info!("LVC warehouse loader finished");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}
