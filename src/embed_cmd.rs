use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::config::{Config, EmbeddingConfig};
use crate::db;
use crate::embedding::{self, InputType};
use crate::models::article_text;

#[derive(Debug, Default, Clone, Copy)]
pub struct EmbedReport {
    pub pending: u64,
    pub embedded: u64,
    pub failed: u64,
}

/// Embed articles that have no vector yet, newest first.
///
/// Failed batches are counted and skipped; they stay pending for the next run.
pub async fn embed_pending_articles(
    config: &Config,
    pool: &SqlitePool,
    limit: Option<usize>,
) -> Result<EmbedReport> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let pending = find_pending_articles(pool, limit).await?;
    let mut report = EmbedReport {
        pending: pending.len() as u64,
        ..Default::default()
    };

    for batch in pending.chunks(config.embedding.batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

        match embedding::embed_with_fallback(&config.embedding, &texts, InputType::Document).await {
            Ok(embedded) => {
                for (item, vec) in batch.iter().zip(embedded.vectors.iter()) {
                    store_embedding(pool, item.article_id, &embedded.model, vec).await?;
                    report.embedded += 1;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, batch = batch.len(), "embedding batch failed");
                report.failed += batch.len() as u64;
            }
        }
    }

    Ok(report)
}

pub async fn run_embed_pending(config: &Config, limit: Option<usize>, dry_run: bool) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    check_provider(&config.embedding)?;

    let pool = db::connect(config).await?;

    if dry_run {
        let pending = find_pending_articles(&pool, limit).await?;
        println!("embed pending (dry-run)");
        println!("  articles needing embeddings: {}", pending.len());
        pool.close().await;
        return Ok(());
    }

    let report = embed_pending_articles(config, &pool, limit).await?;

    println!("embed pending");
    if report.pending == 0 {
        println!("  all articles up to date");
    } else {
        println!("  total pending: {}", report.pending);
        println!("  embedded: {}", report.embedded);
        println!("  failed: {}", report.failed);
    }

    pool.close().await;
    Ok(())
}

/// Clear every stored vector and embed all articles again.
pub async fn run_embed_rebuild(config: &Config) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    check_provider(&config.embedding)?;

    let pool = db::connect(config).await?;

    sqlx::query("UPDATE articles SET embedding = NULL, embedding_model = NULL")
        .execute(&pool)
        .await?;
    println!("embed rebuild: cleared existing embeddings");

    let report = embed_pending_articles(config, &pool, None).await?;

    println!("embed rebuild");
    println!("  total articles: {}", report.pending);
    println!("  embedded: {}", report.embedded);
    println!("  failed: {}", report.failed);

    pool.close().await;
    Ok(())
}

/// Fails early when the primary provider cannot be built, unless a fallback
/// can take over.
fn check_provider(config: &EmbeddingConfig) -> Result<()> {
    match embedding::create_provider(config) {
        Ok(provider) => {
            tracing::info!(
                provider = %config.provider,
                model = provider.model_name(),
                dims = provider.dims(),
                "embedding provider ready"
            );
            Ok(())
        }
        Err(e) => match &config.fallback {
            Some(fallback) => {
                tracing::warn!(error = %e, "primary embedding provider unavailable");
                embedding::create_provider(fallback).map(|_| ())
            }
            None => Err(e),
        },
    }
}

struct PendingArticle {
    article_id: i64,
    text: String,
}

async fn find_pending_articles(pool: &SqlitePool, limit: Option<usize>) -> Result<Vec<PendingArticle>> {
    let limit_val = limit.map(|l| l as i64).unwrap_or(-1);

    let rows = sqlx::query(
        r#"
        SELECT id, title, description
        FROM articles
        WHERE embedding IS NULL
        ORDER BY published_at DESC, id ASC
        LIMIT ?
        "#,
    )
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let title: String = row.get("title");
            let description: Option<String> = row.get("description");
            PendingArticle {
                article_id: row.get("id"),
                text: article_text(&title, description.as_deref()),
            }
        })
        .collect())
}

async fn store_embedding(pool: &SqlitePool, article_id: i64, model: &str, vec: &[f32]) -> Result<()> {
    sqlx::query("UPDATE articles SET embedding = ?, embedding_model = ? WHERE id = ?")
        .bind(embedding::vec_to_blob(vec))
        .bind(model)
        .bind(article_id)
        .execute(pool)
        .await?;
    Ok(())
}
