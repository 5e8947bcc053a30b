//! Ingestion pipeline orchestration.
//!
//! Coordinates the ingest flow: NewsAPI fetch → URL normalization →
//! dedup by URL hash → storage (row + FTS entry) → optional inline tagging
//! and embedding. Every run is recorded in `ingest_runs`. Inline tagging and
//! embedding are non-fatal; a failed fetch is alerted via Telegram when
//! notifications are configured.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use url::Url;

use crate::config::Config;
use crate::db;
use crate::embed_cmd;
use crate::models::NewArticle;
use crate::newsapi::NewsApiClient;
use crate::notify::Notifier;
use crate::tagging;

/// Outcome of storing one batch of articles.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InsertReport {
    pub inserted_ids: Vec<i64>,
    pub duplicates: u64,
}

/// Outcome of a full ingest run.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub fetched: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub tagged: u64,
    pub embedded: u64,
    pub errors: Vec<String>,
}

pub async fn run_ingest(config: &Config, query: Option<String>, dry_run: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let client = NewsApiClient::new(&config.newsapi)?;

    if dry_run {
        let (articles, errors) = fetch_all(&client, config, query.as_deref()).await;
        let mut seen = std::collections::HashSet::new();
        let mut unique = 0u64;
        for a in &articles {
            let hash = url_hash(&a.url);
            if !hash_exists(&pool, &hash).await? && seen.insert(hash) {
                unique += 1;
            }
        }
        println!("ingest (dry-run)");
        println!("  fetched: {} articles", articles.len());
        println!("  new: {}", unique);
        for e in &errors {
            println!("  error: {}", e);
        }
        pool.close().await;
        return Ok(());
    }

    let report = ingest_with_client(config, &pool, &client, query.as_deref()).await?;

    println!("ingest");
    println!("  fetched: {} articles", report.fetched);
    println!("  inserted: {}", report.inserted);
    println!("  duplicates: {}", report.duplicates);
    if config.tagging.inline {
        println!("  tagged: {}", report.tagged);
    }
    if config.embedding.is_enabled() {
        println!("  embedded: {}", report.embedded);
    }
    for e in &report.errors {
        println!("  error: {}", e);
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Runs one ingest cycle with an explicit client.
///
/// Fails only when every fetch failed; partial failures are reported in
/// [`IngestReport::errors`].
pub async fn ingest_with_client(
    config: &Config,
    pool: &SqlitePool,
    client: &NewsApiClient,
    query: Option<&str>,
) -> Result<IngestReport> {
    let started_at = chrono::Utc::now().timestamp();
    let run_id: i64 = sqlx::query_scalar("INSERT INTO ingest_runs (started_at) VALUES (?) RETURNING id")
        .bind(started_at)
        .fetch_one(pool)
        .await?;

    let (articles, errors) = fetch_all(client, config, query).await;
    let requests = if query.is_some() {
        1
    } else {
        config.newsapi.queries.len() + config.newsapi.categories.len()
    };

    if !errors.is_empty() && errors.len() >= requests {
        let message = errors.join("; ");
        finish_run(pool, run_id, 0, 0, 0, Some(&message)).await?;
        if config.notify.alert_on_ingest_failure {
            if let Some(notifier) = Notifier::from_config(&config.notify) {
                let text = format!("newsdesk ingest failed: {}", message);
                if let Err(e) = notifier.send(&text).await {
                    tracing::warn!(error = %e, "failed to send ingest failure alert");
                }
            }
        }
        bail!("ingest failed: {}", message);
    }

    let insert = insert_articles(pool, &articles).await?;
    let mut report = IngestReport {
        fetched: articles.len() as u64,
        inserted: insert.inserted_ids.len() as u64,
        duplicates: insert.duplicates,
        errors,
        ..Default::default()
    };

    tracing::info!(
        fetched = report.fetched,
        inserted = report.inserted,
        duplicates = report.duplicates,
        "ingest batch stored"
    );

    if config.tagging.inline && report.inserted > 0 {
        match tagging::tag_pending(config, pool, report.inserted as usize).await {
            Ok(t) => report.tagged = t.tagged,
            Err(e) => tracing::warn!(error = %e, "inline tagging failed"),
        }
    }

    if config.embedding.is_enabled() && report.inserted > 0 {
        match embed_cmd::embed_pending_articles(config, pool, Some(report.inserted as usize)).await {
            Ok(e) => report.embedded = e.embedded,
            Err(e) => tracing::warn!(error = %e, "inline embedding failed"),
        }
    }

    let partial = if report.errors.is_empty() {
        None
    } else {
        Some(report.errors.join("; "))
    };
    finish_run(
        pool,
        run_id,
        report.fetched,
        report.inserted,
        report.duplicates,
        partial.as_deref(),
    )
    .await?;

    Ok(report)
}

async fn fetch_all(
    client: &NewsApiClient,
    config: &Config,
    query: Option<&str>,
) -> (Vec<NewArticle>, Vec<String>) {
    let mut articles = Vec::new();
    let mut errors = Vec::new();

    if let Some(q) = query {
        match client.everything(q).await {
            Ok(mut batch) => articles.append(&mut batch),
            Err(e) => errors.push(format!("query '{}': {:#}", q, e)),
        }
        return (articles, errors);
    }

    for q in &config.newsapi.queries {
        match client.everything(q).await {
            Ok(mut batch) => articles.append(&mut batch),
            Err(e) => {
                tracing::warn!(query = %q, error = %e, "NewsAPI query failed");
                errors.push(format!("query '{}': {:#}", q, e));
            }
        }
    }
    for c in &config.newsapi.categories {
        match client.top_headlines(c).await {
            Ok(mut batch) => articles.append(&mut batch),
            Err(e) => {
                tracing::warn!(category = %c, error = %e, "NewsAPI headlines failed");
                errors.push(format!("category '{}': {:#}", c, e));
            }
        }
    }

    (articles, errors)
}

async fn finish_run(
    pool: &SqlitePool,
    run_id: i64,
    fetched: u64,
    inserted: u64,
    duplicates: u64,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE ingest_runs SET finished_at = ?, fetched = ?, inserted = ?, duplicates = ?, error = ? WHERE id = ?",
    )
    .bind(chrono::Utc::now().timestamp())
    .bind(fetched as i64)
    .bind(inserted as i64)
    .bind(duplicates as i64)
    .bind(error)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Stores a batch, skipping any article whose URL hash is already present
/// (in the database or earlier in the same batch).
pub async fn insert_articles(pool: &SqlitePool, articles: &[NewArticle]) -> Result<InsertReport> {
    let mut tx = pool.begin().await?;
    let mut report = InsertReport::default();
    let now = chrono::Utc::now().timestamp();

    for article in articles {
        let hash = url_hash(&article.url);

        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO articles (title, description, url, url_hash, source, published_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&article.title)
        .bind(&article.description)
        .bind(&article.url)
        .bind(&hash)
        .bind(&article.source)
        .bind(article.published_at.timestamp())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        match id {
            Some(id) => {
                sqlx::query(
                    "INSERT INTO articles_fts (article_id, title, description) VALUES (?, ?, ?)",
                )
                .bind(id)
                .bind(&article.title)
                .bind(article.description.as_deref().unwrap_or(""))
                .execute(&mut *tx)
                .await?;
                report.inserted_ids.push(id);
            }
            None => report.duplicates += 1,
        }
    }

    tx.commit().await?;
    Ok(report)
}

async fn hash_exists(pool: &SqlitePool, hash: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM articles WHERE url_hash = ?")
        .bind(hash)
        .fetch_one(pool)
        .await?;
    Ok(exists)
}

/// Canonical form of an article URL used for deduplication.
///
/// Drops the fragment and `utm_*` tracking parameters, lower-cases the host,
/// and trims a trailing slash from the path. Unparseable URLs are only
/// trimmed.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut url = match Url::parse(trimmed) {
        Ok(u) => u,
        Err(_) => return trimmed.to_string(),
    };

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    // Url already lower-cases the host of special schemes
    let mut out = url.to_string();
    if url.path() == "/" && url.query().is_none() && out.ends_with('/') {
        out.pop();
    }
    out
}

pub fn url_hash(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_url(raw).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn article(title: &str, url: &str) -> NewArticle {
        NewArticle {
            title: title.to_string(),
            description: Some(format!("{} description", title)),
            url: url.to_string(),
            source: "Wire".to_string(),
            published_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    async fn test_pool() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("news.sqlite"))
            .await
            .unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        (tmp, pool)
    }

    #[test]
    fn test_normalize_url_strips_tracking_and_fragment() {
        assert_eq!(
            normalize_url("https://Example.com/world/story/?utm_source=x&id=7#top"),
            "https://example.com/world/story?id=7"
        );
        assert_eq!(
            normalize_url("https://example.com/"),
            "https://example.com"
        );
        assert_eq!(normalize_url("  not a url  "), "not a url");
    }

    #[test]
    fn test_url_hash_equal_for_equivalent_urls() {
        assert_eq!(
            url_hash("https://example.com/a/?utm_medium=rss"),
            url_hash("https://EXAMPLE.com/a#section")
        );
        assert_ne!(url_hash("https://example.com/a"), url_hash("https://example.com/b"));
    }

    #[tokio::test]
    async fn test_insert_dedups_within_and_across_batches() {
        let (_tmp, pool) = test_pool().await;

        let batch = vec![
            article("One", "https://example.com/1"),
            article("One again", "https://example.com/1?utm_source=feed"),
            article("Two", "https://example.com/2"),
        ];
        let first = insert_articles(&pool, &batch).await.unwrap();
        assert_eq!(first.inserted_ids.len(), 2);
        assert_eq!(first.duplicates, 1);

        let second = insert_articles(&pool, &batch).await.unwrap();
        assert!(second.inserted_ids.is_empty());
        assert_eq!(second.duplicates, 3);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
            .fetch_one(&pool)
            .await
            .unwrap();
        let fts_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles_fts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(fts_count, 2);
    }
}
