//! Health probes.
//!
//! The local probe runs `PRAGMA integrity_check`; the service is healthy
//! exactly when SQLite answers `ok`. The remote probe polls a running
//! server's `/api/health` until it reports healthy, for use after deploys.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::Duration;

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    /// `healthy` or `unhealthy`.
    pub status: String,
    /// `ok`, or the integrity/connection error.
    pub database: String,
    pub version: String,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

pub async fn check(pool: &SqlitePool) -> HealthReport {
    let database = match integrity_check(pool).await {
        Ok(result) => result,
        Err(e) => format!("error: {}", e),
    };
    let status = if database == "ok" { "healthy" } else { "unhealthy" };
    HealthReport {
        status: status.to_string(),
        database,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// Returns `ok` or the problems SQLite reported, joined.
pub async fn integrity_check(pool: &SqlitePool) -> Result<String> {
    let rows: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
        .fetch_all(pool)
        .await?;
    Ok(rows.join("; "))
}

/// `newsdesk health`: exits non-zero when unhealthy.
pub async fn run_health(config: &Config) -> Result<()> {
    if !config.db.path.exists() {
        bail!("database not found: {}", config.db.path.display());
    }
    let pool = db::connect(config).await?;
    let report = check(&pool).await;
    pool.close().await;

    println!("health");
    println!("  status: {}", report.status);
    println!("  database: {}", report.database);
    println!("  version: {}", report.version);

    if !report.is_healthy() {
        bail!("database integrity check failed");
    }
    Ok(())
}

/// `newsdesk health --url`: polls until healthy or attempts run out.
pub async fn run_health_poll(url: &str, attempts: u32, interval: Duration) -> Result<()> {
    let endpoint = format!("{}/api/health", url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    for attempt in 1..=attempts.max(1) {
        match poll_once(&client, &endpoint).await {
            Ok(report) if report.is_healthy() => {
                println!("healthy after {} attempt(s) (version {})", attempt, report.version);
                return Ok(());
            }
            Ok(report) => {
                tracing::info!(attempt, database = %report.database, "server reports unhealthy");
            }
            Err(e) => {
                tracing::info!(attempt, error = %e, "health endpoint not reachable yet");
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    bail!("{} did not become healthy after {} attempts", endpoint, attempts)
}

async fn poll_once(client: &reqwest::Client, endpoint: &str) -> Result<HealthReport> {
    // 503 still carries a report body
    let response = client.get(endpoint).send().await?;
    Ok(response.json().await?)
}
