//! Sentiment and category tagging.
//!
//! Each untagged article is sent once to the LLM chain, which answers with a
//! small JSON object. The result is cached on the article row, so an article
//! with a `sentiment_score` is never sent again. Replies that cannot be parsed
//! count against `tag_attempts`; after [`MAX_TAG_ATTEMPTS`] the article is
//! no longer offered for tagging. Failed requests do not count.

use anyhow::Result;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::llm::{ChatMessage, LlmClient};

/// Categories an article can be filed under.
pub const CATEGORIES: &[&str] = &[
    "conflict",
    "diplomacy",
    "economy",
    "politics",
    "security",
    "energy",
    "technology",
    "humanitarian",
    "other",
];

pub const MAX_TAG_ATTEMPTS: i64 = 3;

const TAGGING_PROMPT: &str = "You classify geopolitical news. Reply with a single JSON object \
and nothing else: {\"sentiment\": <number from -1 (very negative) to 1 (very positive)>, \
\"category\": <one of conflict, diplomacy, economy, politics, security, energy, technology, \
humanitarian, other>}.";

#[derive(Debug, Default, Clone, Copy)]
pub struct TagReport {
    pub tagged: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub sentiment: f64,
    pub category: String,
}

#[derive(Deserialize)]
struct RawTag {
    sentiment: serde_json::Value,
    #[serde(default)]
    category: Option<String>,
}

/// Tags up to `limit` articles that have no sentiment score yet.
pub async fn tag_pending(config: &Config, pool: &SqlitePool, limit: usize) -> Result<TagReport> {
    let client = LlmClient::from_config(&config.llm)?.with_primary_model(config.tagging.model.as_deref());
    tag_pending_with_client(&client, pool, limit).await
}

pub async fn tag_pending_with_client(
    client: &LlmClient,
    pool: &SqlitePool,
    limit: usize,
) -> Result<TagReport> {
    let rows = sqlx::query(
        r#"
        SELECT id, title, description
        FROM articles
        WHERE sentiment_score IS NULL AND tag_attempts < ?
        ORDER BY tag_attempts ASC, published_at DESC, id ASC
        LIMIT ?
        "#,
    )
    .bind(MAX_TAG_ATTEMPTS)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let mut report = TagReport::default();

    for row in &rows {
        let id: i64 = row.get("id");
        let title: String = row.get("title");
        let description: Option<String> = row.get("description");

        let messages = [
            ChatMessage::system(TAGGING_PROMPT),
            ChatMessage::user(format!(
                "Title: {}\nDescription: {}",
                title,
                description.as_deref().unwrap_or("")
            )),
        ];

        let tag = match client.complete(&messages).await {
            Ok(completion) => {
                let tag = parse_tag(&completion.content);
                if tag.is_none() {
                    sqlx::query("UPDATE articles SET tag_attempts = tag_attempts + 1 WHERE id = ?")
                        .bind(id)
                        .execute(pool)
                        .await?;
                }
                tag
            }
            Err(e) => {
                tracing::warn!(article_id = id, error = %e, "tagging request failed");
                None
            }
        };

        match tag {
            Some(tag) => {
                sqlx::query("UPDATE articles SET sentiment_score = ?, category = ? WHERE id = ?")
                    .bind(tag.sentiment)
                    .bind(&tag.category)
                    .bind(id)
                    .execute(pool)
                    .await?;
                report.tagged += 1;
            }
            None => {
                tracing::debug!(article_id = id, "article left untagged");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

pub async fn run_tag(config: &Config, limit: Option<usize>) -> Result<()> {
    let pool = db::connect(config).await?;
    let report = tag_pending(config, &pool, limit.unwrap_or(config.tagging.batch_limit)).await?;

    println!("tag");
    println!("  tagged: {}", report.tagged);
    println!("  failed: {}", report.failed);

    pool.close().await;
    Ok(())
}

/// Extracts a tag from a model reply.
///
/// Tolerates code fences and prose around the object, and sentiment given
/// as a string. Returns `None` when no usable sentiment is present.
pub fn parse_tag(reply: &str) -> Option<Tag> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    let raw: RawTag = serde_json::from_str(&reply[start..=end]).ok()?;

    let sentiment = match raw.sentiment {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    if !sentiment.is_finite() {
        return None;
    }

    Some(Tag {
        sentiment: sentiment.clamp(-1.0, 1.0),
        category: normalize_category(raw.category.as_deref()),
    })
}

pub fn normalize_category(category: Option<&str>) -> String {
    let c = category.unwrap_or("").trim().to_lowercase();
    if CATEGORIES.contains(&c.as_str()) {
        c
    } else {
        "other".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::insert_articles;
    use crate::llm::{Provider, ProviderKind};
    use crate::models::NewArticle;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_plain_json() {
        let tag = parse_tag(r#"{"sentiment": -0.4, "category": "conflict"}"#).unwrap();
        assert_eq!(tag.sentiment, -0.4);
        assert_eq!(tag.category, "conflict");
    }

    #[test]
    fn test_parse_fenced_and_clamped() {
        let reply = "```json\n{\"sentiment\": \"3.5\", \"category\": \"Diplomacy\"}\n```";
        let tag = parse_tag(reply).unwrap();
        assert_eq!(tag.sentiment, 1.0);
        assert_eq!(tag.category, "diplomacy");
    }

    #[test]
    fn test_unknown_category_maps_to_other() {
        let tag = parse_tag(r#"{"sentiment": 0.1, "category": "sports"}"#).unwrap();
        assert_eq!(tag.category, "other");
        let tag = parse_tag(r#"{"sentiment": 0.1}"#).unwrap();
        assert_eq!(tag.category, "other");
    }

    #[test]
    fn test_unparseable_reply() {
        assert!(parse_tag("I cannot classify this.").is_none());
        assert!(parse_tag(r#"{"sentiment": null, "category": "economy"}"#).is_none());
    }

    #[tokio::test]
    async fn test_unparseable_replies_stop_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "I cannot classify this."}}]
            })))
            .expect(MAX_TAG_ATTEMPTS as u64)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect_path(&dir.path().join("news.sqlite")).await.unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        insert_articles(
            &pool,
            &[NewArticle {
                title: "Ambiguous item".to_string(),
                description: None,
                url: "https://example.com/ambiguous".to_string(),
                source: "AP".to_string(),
                published_at: chrono::Utc::now(),
            }],
        )
        .await
        .unwrap();

        let client = LlmClient::new(
            vec![Provider::new(ProviderKind::OpenAi, "gpt-4o-mini", Some(&server.uri()), "k".into())],
            5,
            0.0,
            50,
        )
        .unwrap();

        for _ in 0..MAX_TAG_ATTEMPTS {
            let report = tag_pending_with_client(&client, &pool, 10).await.unwrap();
            assert_eq!(report.failed, 1);
        }
        let report = tag_pending_with_client(&client, &pool, 10).await.unwrap();
        assert_eq!(report.failed + report.tagged, 0);

        let attempts: i64 = sqlx::query_scalar("SELECT tag_attempts FROM articles")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(attempts, MAX_TAG_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_tagged_articles_are_not_resent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"sentiment\": -0.5, \"category\": \"security\"}"}}]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect_path(&dir.path().join("news.sqlite")).await.unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        let articles: Vec<NewArticle> = (0..2)
            .map(|i| NewArticle {
                title: format!("Border clash {}", i),
                description: None,
                url: format!("https://example.com/clash-{}", i),
                source: "AP".to_string(),
                published_at: chrono::Utc::now(),
            })
            .collect();
        insert_articles(&pool, &articles).await.unwrap();

        let client = LlmClient::new(
            vec![Provider::new(ProviderKind::OpenAi, "gpt-4o-mini", Some(&server.uri()), "k".into())],
            5,
            0.0,
            50,
        )
        .unwrap();

        let first = tag_pending_with_client(&client, &pool, 10).await.unwrap();
        assert_eq!(first.tagged, 2);
        let second = tag_pending_with_client(&client, &pool, 10).await.unwrap();
        assert_eq!(second.tagged, 0);

        let category: String = sqlx::query_scalar("SELECT category FROM articles LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(category, "security");
    }
}
