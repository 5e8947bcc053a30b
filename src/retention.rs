//! Age-based cleanup of old articles.
//!
//! Deletes articles published more than `retention.max_age_days` ago along
//! with their FTS rows, and ingest run records of the same age. Chat history
//! is never deleted; sources attached to old answers keep their copied
//! title and URL.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CleanupReport {
    pub articles_deleted: u64,
    pub runs_deleted: u64,
}

pub async fn cleanup(pool: &SqlitePool, max_age_days: i64, now: i64) -> Result<CleanupReport> {
    let cutoff = now - max_age_days * 86_400;

    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM articles_fts WHERE article_id IN (SELECT id FROM articles WHERE published_at < ?)",
    )
    .bind(cutoff)
    .execute(&mut *tx)
    .await?;

    let articles = sqlx::query("DELETE FROM articles WHERE published_at < ?")
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

    let runs = sqlx::query("DELETE FROM ingest_runs WHERE started_at < ?")
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(CleanupReport {
        articles_deleted: articles.rows_affected(),
        runs_deleted: runs.rows_affected(),
    })
}

pub async fn run_cleanup(config: &Config, dry_run: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let now = chrono::Utc::now().timestamp();
    let max_age = config.retention.max_age_days;

    if dry_run {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles WHERE published_at < ?")
            .bind(now - max_age * 86_400)
            .fetch_one(&pool)
            .await?;
        println!("cleanup (dry-run)");
        println!("  articles older than {} days: {}", max_age, count);
        pool.close().await;
        return Ok(());
    }

    let report = cleanup(&pool, max_age, now).await?;
    tracing::info!(
        articles = report.articles_deleted,
        runs = report.runs_deleted,
        "retention cleanup finished"
    );

    println!("cleanup");
    println!("  articles deleted: {}", report.articles_deleted);
    println!("  ingest runs deleted: {}", report.runs_deleted);

    pool.close().await;
    Ok(())
}
