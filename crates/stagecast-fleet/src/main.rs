// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! stagecast-fleet server binary.
//!
//! Connects to PostgreSQL and the local Docker daemon, applies the schema,
//! and runs the fleet control plane until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stagecast_fleet::Config;
use stagecast_fleet::driver::DockerDriver;
use stagecast_fleet::runtime::FleetRuntime;
use stagecast_fleet::store::PostgresStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stagecast_fleet=info,info")),
        )
        .init();

    // Load .env in development; ignored if absent.
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("failed to load configuration")?;

    let store = PostgresStore::connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    store
        .apply_schema()
        .await
        .context("failed to apply database schema")?;
    info!("Database schema applied");

    let driver = DockerDriver::connect().context("failed to connect to container runtime")?;

    let runtime = FleetRuntime::builder()
        .store(Arc::new(store))
        .driver(Arc::new(driver))
        .image(config.image.clone())
        .base_port(config.base_port)
        .port_range(config.port_range)
        .stop_grace(config.stop_grace)
        .reconcile_interval(config.reconcile_interval)
        .sweep_interval(config.sweep_interval)
        .build()?
        .start()
        .await?;

    info!(
        image = %config.image,
        base_port = config.base_port,
        "stagecast-fleet running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;
    Ok(())
}
