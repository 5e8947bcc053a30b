//! Personalized article feed.
//!
//! Preferences are four term lists per user. Recent articles are scored by
//! how many terms they match, plus optional semantic similarity to the
//! profile, plus a recency bonus that halves every day. An article matching
//! any exclusion term is dropped outright.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::embedding;
use crate::models::{Article, FeedPreferences, ARTICLE_COLUMNS};

const WINDOW_SECS: i64 = 7 * 86_400;
const MAX_CANDIDATES: i64 = 500;

const KEYWORD_WEIGHT: f64 = 3.0;
const TOPIC_CATEGORY_WEIGHT: f64 = 2.0;
const TOPIC_TEXT_WEIGHT: f64 = 1.0;
const REGION_WEIGHT: f64 = 1.5;
const SEMANTIC_WEIGHT: f64 = 2.0;
const HALF_LIFE_HOURS: f64 = 24.0;

#[derive(Debug, Clone, Serialize)]
pub struct FeedItem {
    #[serde(flatten)]
    pub article: Article,
    pub score: f64,
}

pub async fn get_preferences(pool: &SqlitePool, user_id: &str) -> Result<Option<FeedPreferences>> {
    let row = sqlx::query(
        "SELECT topics, regions, keywords, exclusions FROM user_feed_preferences WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        let list = |col: &str| -> Vec<String> {
            let raw: String = row.get(col);
            serde_json::from_str(&raw).unwrap_or_default()
        };
        FeedPreferences {
            topics: list("topics"),
            regions: list("regions"),
            keywords: list("keywords"),
            exclusions: list("exclusions"),
        }
    }))
}

/// Replaces a user's preferences; terms are trimmed, lower-cased and deduplicated.
pub async fn put_preferences(
    pool: &SqlitePool,
    user_id: &str,
    prefs: &FeedPreferences,
) -> Result<FeedPreferences> {
    let prefs = FeedPreferences {
        topics: clean_terms(&prefs.topics),
        regions: clean_terms(&prefs.regions),
        keywords: clean_terms(&prefs.keywords),
        exclusions: clean_terms(&prefs.exclusions),
    };

    sqlx::query(
        r#"
        INSERT INTO user_feed_preferences (user_id, topics, regions, keywords, exclusions, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            topics = excluded.topics,
            regions = excluded.regions,
            keywords = excluded.keywords,
            exclusions = excluded.exclusions,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(serde_json::to_string(&prefs.topics)?)
    .bind(serde_json::to_string(&prefs.regions)?)
    .bind(serde_json::to_string(&prefs.keywords)?)
    .bind(serde_json::to_string(&prefs.exclusions)?)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(prefs)
}

fn clean_terms(terms: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for t in terms {
        let t = t.trim().to_lowercase();
        if !t.is_empty() && !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

/// Ranks recent articles for a user. Users without preferences get a
/// recency-ordered feed.
pub async fn personalized_feed(
    pool: &SqlitePool,
    config: &Config,
    user_id: &str,
    limit: i64,
) -> Result<Vec<FeedItem>> {
    let prefs = get_preferences(pool, user_id).await?.unwrap_or_default();
    let now = chrono::Utc::now().timestamp();

    let rows = sqlx::query(&format!(
        "SELECT {}, embedding, embedding_model FROM articles \
         WHERE published_at >= ? ORDER BY published_at DESC, id ASC LIMIT ?",
        ARTICLE_COLUMNS
    ))
    .bind(now - WINDOW_SECS)
    .bind(MAX_CANDIDATES)
    .fetch_all(pool)
    .await?;

    let profile = profile_vector(config, &prefs).await;

    let mut items: Vec<FeedItem> = rows
        .iter()
        .filter_map(|row| {
            let article = Article::from_row(row);
            let similarity = profile.as_ref().and_then(|(query_vec, model)| {
                let stored_model: Option<String> = row.get("embedding_model");
                let blob: Option<Vec<u8>> = row.get("embedding");
                match (stored_model, blob) {
                    (Some(m), Some(b)) if &m == model => {
                        Some(embedding::cosine_similarity(query_vec, &embedding::blob_to_vec(&b)))
                    }
                    _ => None,
                }
            });
            score_article(&prefs, &article, similarity, now).map(|score| FeedItem { article, score })
        })
        .collect();

    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.article.published_at.cmp(&a.article.published_at))
            .then(a.article.id.cmp(&b.article.id))
    });
    items.truncate(limit.max(1) as usize);
    Ok(items)
}

async fn profile_vector(config: &Config, prefs: &FeedPreferences) -> Option<(Vec<f32>, String)> {
    if !config.embedding.is_enabled() {
        return None;
    }
    let terms: Vec<&str> = prefs
        .topics
        .iter()
        .chain(prefs.regions.iter())
        .chain(prefs.keywords.iter())
        .map(String::as_str)
        .collect();
    if terms.is_empty() {
        return None;
    }
    match embedding::embed_query(&config.embedding, &terms.join(", ")).await {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "feed profile embedding failed, using term matching only");
            None
        }
    }
}

/// Scores one article; `None` when an exclusion matches.
pub fn score_article(
    prefs: &FeedPreferences,
    article: &Article,
    similarity: Option<f32>,
    now: i64,
) -> Option<f64> {
    let text = format!(
        "{} {} {}",
        article.title,
        article.description.as_deref().unwrap_or(""),
        article.source
    )
    .to_lowercase();

    if prefs.exclusions.iter().any(|t| text.contains(t.as_str())) {
        return None;
    }

    let category = article.category.as_deref().unwrap_or("");
    let mut relevance = 0.0;
    for k in &prefs.keywords {
        if text.contains(k.as_str()) {
            relevance += KEYWORD_WEIGHT;
        }
    }
    for t in &prefs.topics {
        if t == category {
            relevance += TOPIC_CATEGORY_WEIGHT;
        } else if text.contains(t.as_str()) {
            relevance += TOPIC_TEXT_WEIGHT;
        }
    }
    for r in &prefs.regions {
        if text.contains(r.as_str()) {
            relevance += REGION_WEIGHT;
        }
    }
    if let Some(sim) = similarity {
        relevance += SEMANTIC_WEIGHT * f64::from(sim.max(0.0));
    }

    let age_hours = ((now - article.published_at).max(0) as f64) / 3600.0;
    let recency = 0.5f64.powf(age_hours / HALF_LIFE_HOURS);

    Some(relevance + recency)
}
