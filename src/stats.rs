//! Database statistics.
//!
//! Provides a summary of what's stored: article counts, tagging and
//! embedding coverage, per-category and per-source breakdowns, chat volume,
//! and the last ingestion run. Printed by `newsdesk stats` and served as
//! JSON by `GET /api/stats`.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::models::format_ts_iso;

const TOP_SOURCES: i64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub articles: ArticleStats,
    pub by_category: Vec<Bucket>,
    pub by_source: Vec<Bucket>,
    pub chat: ChatStats,
    pub last_ingest: Option<IngestRun>,
    pub db_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArticleStats {
    pub total: i64,
    pub last_24h: i64,
    pub tagged: i64,
    pub embedded: i64,
    pub avg_sentiment: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Bucket {
    pub name: String,
    pub count: i64,
    pub avg_sentiment: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatStats {
    pub conversations: i64,
    pub active_conversations: i64,
    pub messages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRun {
    pub started_at: String,
    pub finished_at: Option<String>,
    pub fetched: i64,
    pub inserted: i64,
    pub duplicates: i64,
    pub error: Option<String>,
}

pub async fn collect_stats(pool: &SqlitePool, db_path: &Path) -> Result<Stats> {
    let since = chrono::Utc::now().timestamp() - 86_400;

    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(published_at >= ?), 0) AS last_24h,
            COALESCE(SUM(sentiment_score IS NOT NULL), 0) AS tagged,
            COALESCE(SUM(embedding IS NOT NULL), 0) AS embedded,
            AVG(sentiment_score) AS avg_sentiment
        FROM articles
        "#,
    )
    .bind(since)
    .fetch_one(pool)
    .await?;

    let articles = ArticleStats {
        total: row.get("total"),
        last_24h: row.get("last_24h"),
        tagged: row.get("tagged"),
        embedded: row.get("embedded"),
        avg_sentiment: row.get("avg_sentiment"),
    };

    let by_category = buckets(
        pool,
        "SELECT COALESCE(category, 'untagged') AS name, COUNT(*) AS count, \
         AVG(sentiment_score) AS avg_sentiment \
         FROM articles GROUP BY name ORDER BY count DESC, name ASC",
        None,
    )
    .await?;

    let by_source = buckets(
        pool,
        "SELECT source AS name, COUNT(*) AS count, AVG(sentiment_score) AS avg_sentiment \
         FROM articles GROUP BY source ORDER BY count DESC, name ASC LIMIT ?",
        Some(TOP_SOURCES),
    )
    .await?;

    let chat_row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM conversations) AS conversations,
            (SELECT COUNT(*) FROM conversations WHERE archived_at IS NULL) AS active,
            (SELECT COUNT(*) FROM messages) AS messages
        "#,
    )
    .fetch_one(pool)
    .await?;

    let chat = ChatStats {
        conversations: chat_row.get("conversations"),
        active_conversations: chat_row.get("active"),
        messages: chat_row.get("messages"),
    };

    let last_ingest = sqlx::query(
        "SELECT started_at, finished_at, fetched, inserted, duplicates, error \
         FROM ingest_runs ORDER BY id DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?
    .map(|r| IngestRun {
        started_at: format_ts_iso(r.get("started_at")),
        finished_at: r.get::<Option<i64>, _>("finished_at").map(format_ts_iso),
        fetched: r.get("fetched"),
        inserted: r.get("inserted"),
        duplicates: r.get("duplicates"),
        error: r.get("error"),
    });

    let db_size_bytes = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    Ok(Stats {
        articles,
        by_category,
        by_source,
        chat,
        last_ingest,
        db_size_bytes,
    })
}

async fn buckets(pool: &SqlitePool, sql: &str, limit: Option<i64>) -> Result<Vec<Bucket>> {
    let mut query = sqlx::query(sql);
    if let Some(limit) = limit {
        query = query.bind(limit);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|r| Bucket {
            name: r.get("name"),
            count: r.get("count"),
            avg_sentiment: r.get("avg_sentiment"),
        })
        .collect())
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool, &config.db.path).await?;
    pool.close().await;

    let a = &stats.articles;
    println!("Newsdesk Database Stats");
    println!("=======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(stats.db_size_bytes));
    println!();
    println!("  Articles:    {} ({} in last 24h)", a.total, a.last_24h);
    println!("  Tagged:      {} / {} ({}%)", a.tagged, a.total, percent(a.tagged, a.total));
    println!("  Embedded:    {} / {} ({}%)", a.embedded, a.total, percent(a.embedded, a.total));
    if let Some(avg) = a.avg_sentiment {
        println!("  Sentiment:   {:+.2} avg", avg);
    }
    println!(
        "  Chat:        {} conversations ({} active), {} messages",
        stats.chat.conversations, stats.chat.active_conversations, stats.chat.messages
    );

    match &stats.last_ingest {
        Some(run) => {
            println!(
                "  Last ingest: {} (fetched {}, inserted {}, duplicates {})",
                run.started_at, run.fetched, run.inserted, run.duplicates
            );
            if let Some(err) = &run.error {
                println!("               error: {}", err);
            }
        }
        None => println!("  Last ingest: never"),
    }

    for (label, list) in [("By category", &stats.by_category), ("By source", &stats.by_source)] {
        if list.is_empty() {
            continue;
        }
        println!();
        println!("  {}:", label);
        println!("  {:<28} {:>8} {:>10}", "NAME", "ARTICLES", "SENTIMENT");
        println!("  {}", "-".repeat(48));
        for b in list {
            let sentiment = b
                .avg_sentiment
                .map(|s| format!("{:+.2}", s))
                .unwrap_or_else(|| "-".to_string());
            println!("  {:<28} {:>8} {:>10}", b.name, b.count, sentiment);
        }
    }

    println!();
    Ok(())
}

fn percent(part: i64, total: i64) -> i64 {
    if total > 0 {
        (part * 100) / total
    } else {
        0
    }
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::insert_articles;
    use crate::models::NewArticle;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn test_collect_stats_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("news.sqlite");
        let pool = db::connect_path(&path).await.unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();

        let articles: Vec<NewArticle> = ["a", "b", "c"]
            .iter()
            .map(|s| NewArticle {
                title: format!("Story {}", s),
                description: None,
                url: format!("https://example.com/{}", s),
                source: if *s == "c" { "BBC" } else { "AP" }.to_string(),
                published_at: chrono::Utc::now(),
            })
            .collect();
        insert_articles(&pool, &articles).await.unwrap();
        sqlx::query("UPDATE articles SET sentiment_score = -0.5, category = 'conflict' WHERE source = 'AP'")
            .execute(&pool)
            .await
            .unwrap();

        let stats = collect_stats(&pool, &path).await.unwrap();
        assert_eq!(stats.articles.total, 3);
        assert_eq!(stats.articles.last_24h, 3);
        assert_eq!(stats.articles.tagged, 2);
        assert_eq!(stats.articles.embedded, 0);
        assert_eq!(stats.by_source[0].name, "AP");
        assert_eq!(stats.by_source[0].count, 2);
        assert_eq!(stats.by_category[0].name, "conflict");
        assert!(stats.last_ingest.is_none());
    }
}
