//! Article retrieval: keyword (FTS5), vector, and hybrid.
//!
//! Both channels produce raw candidate scores which are min-max normalized to
//! `[0, 1]` and blended as `(1 - alpha) * keyword + alpha * vector`. Vector
//! candidates below `retrieval.similarity_threshold` are dropped before
//! normalization, so weak semantic matches never reach a prompt.
//!
//! Stored vectors are only compared against a query vector from the same
//! model. When the query cannot be embedded, retrieval degrades to keyword
//! only.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::models::{format_ts_iso, Article, Source, ARTICLE_COLUMNS};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "did", "do", "does", "for", "from", "has",
    "have", "how", "in", "is", "it", "its", "me", "of", "on", "or", "tell", "that", "the", "this",
    "to", "was", "what", "when", "where", "which", "who", "why", "will", "with", "about",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl SearchMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            _ => bail!(
                "Unknown search mode: {}. Use keyword, semantic, or hybrid.",
                mode
            ),
        }
    }

    /// Hybrid when embeddings are configured, keyword otherwise.
    pub fn default_for(config: &Config) -> Self {
        if config.embedding.is_enabled() {
            SearchMode::Hybrid
        } else {
            SearchMode::Keyword
        }
    }

    fn uses_keyword(&self) -> bool {
        matches!(self, SearchMode::Keyword | SearchMode::Hybrid)
    }

    fn uses_vector(&self) -> bool {
        matches!(self, SearchMode::Semantic | SearchMode::Hybrid)
    }
}

#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub mode: SearchMode,
    pub category: Option<String>,
    pub source: Option<String>,
    /// Unix seconds; articles published earlier are excluded.
    pub since: Option<i64>,
    pub limit: Option<i64>,
}

impl RetrieveOptions {
    pub fn new(mode: SearchMode) -> Self {
        Self {
            mode,
            category: None,
            source: None,
            since: None,
            limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArticleHit {
    pub article: Article,
    pub score: f64,
    /// Raw cosine similarity, when the article was a vector candidate.
    pub similarity: Option<f32>,
}

impl ArticleHit {
    pub fn to_source(&self) -> Source {
        Source {
            article_id: self.article.id,
            title: self.article.title.clone(),
            url: self.article.url.clone(),
            source: self.article.source.clone(),
            published_at: format_ts_iso(self.article.published_at),
            score: self.score,
        }
    }
}

/// Runs retrieval and returns ranked, filtered articles.
pub async fn retrieve(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    opts: &RetrieveOptions,
) -> Result<Vec<ArticleHit>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let retrieval = &config.retrieval;
    let final_limit = opts.limit.unwrap_or(retrieval.final_limit).max(1) as usize;

    let mut vector_candidates = Vec::new();
    let mut vector_ok = false;
    if opts.mode.uses_vector() && config.embedding.is_enabled() {
        match embedding::embed_query(&config.embedding, query).await {
            Ok((query_vec, model)) => {
                vector_candidates = fetch_vector_candidates(
                    pool,
                    &query_vec,
                    &model,
                    retrieval.similarity_threshold,
                    retrieval.candidate_k_vector,
                    opts,
                )
                .await?;
                vector_ok = true;
            }
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, using keyword retrieval only");
            }
        }
    }

    // Semantic mode still needs some channel when the vector one is down.
    let keyword_candidates = if opts.mode.uses_keyword() || !vector_ok {
        fetch_keyword_candidates(pool, query, retrieval.candidate_k_keyword, opts).await?
    } else {
        Vec::new()
    };

    let effective_alpha = if !vector_ok {
        0.0
    } else {
        match opts.mode {
            SearchMode::Keyword => 0.0,
            SearchMode::Semantic => 1.0,
            SearchMode::Hybrid => retrieval.hybrid_alpha,
        }
    };

    let mut ranked = merge_candidates(&keyword_candidates, &vector_candidates, effective_alpha);
    if ranked.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = ranked.iter().map(|r| r.article_id).collect();
    let articles = load_articles(pool, &ids).await?;

    let mut hits: Vec<ArticleHit> = ranked
        .drain(..)
        .filter_map(|r| {
            articles.get(&r.article_id).map(|a| ArticleHit {
                article: a.clone(),
                score: r.score,
                similarity: r.similarity,
            })
        })
        .collect();

    // Sort: score desc, published_at desc, id asc (deterministic)
    sort_hits(&mut hits);

    if let Some(model) = &retrieval.rerank_model {
        hits.truncate(final_limit * 3);
        hits = rerank_hits(hits, &retrieval.rerank_url, model, query).await;
    }

    hits.truncate(final_limit);
    Ok(hits)
}

fn sort_hits(hits: &mut [ArticleHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.article.published_at.cmp(&a.article.published_at))
            .then(a.article.id.cmp(&b.article.id))
    });
}

async fn rerank_hits(hits: Vec<ArticleHit>, url: &str, model: &str, query: &str) -> Vec<ArticleHit> {
    let documents: Vec<String> = hits.iter().map(|h| h.article.embedding_text()).collect();
    match embedding::rerank(url, model, query, &documents).await {
        Ok(order) => {
            let mut slots: Vec<Option<ArticleHit>> = hits.into_iter().map(Some).collect();
            order
                .into_iter()
                .filter_map(|(idx, relevance)| {
                    slots.get_mut(idx).and_then(Option::take).map(|mut hit| {
                        hit.score = relevance;
                        hit
                    })
                })
                .collect()
        }
        Err(e) => {
            tracing::warn!(error = %e, "rerank failed, keeping hybrid order");
            hits
        }
    }
}

// ============ Candidates ============

#[derive(Debug, Clone)]
struct Candidate {
    article_id: i64,
    raw_score: f64,
}

#[derive(Debug, Clone)]
struct Ranked {
    article_id: i64,
    score: f64,
    similarity: Option<f32>,
}

fn merge_candidates(keyword: &[Candidate], vector: &[Candidate], alpha: f64) -> Vec<Ranked> {
    let norm_keyword = normalize_scores(keyword);
    let norm_vector = normalize_scores(vector);

    let kw_map: HashMap<i64, f64> = norm_keyword.iter().map(|(c, s)| (c.article_id, *s)).collect();
    let vec_map: HashMap<i64, f64> = norm_vector.iter().map(|(c, s)| (c.article_id, *s)).collect();
    let sim_map: HashMap<i64, f32> = vector.iter().map(|c| (c.article_id, c.raw_score as f32)).collect();

    let mut ids: Vec<i64> = keyword.iter().chain(vector.iter()).map(|c| c.article_id).collect();
    ids.sort_unstable();
    ids.dedup();

    ids.into_iter()
        .map(|id| {
            let k = kw_map.get(&id).copied().unwrap_or(0.0);
            let v = vec_map.get(&id).copied().unwrap_or(0.0);
            Ranked {
                article_id: id,
                score: (1.0 - alpha) * k + alpha * v,
                similarity: sim_map.get(&id).copied(),
            }
        })
        .collect()
}

async fn fetch_keyword_candidates(
    pool: &SqlitePool,
    query: &str,
    candidate_k: i64,
    opts: &RetrieveOptions,
) -> Result<Vec<Candidate>> {
    let Some(match_expr) = fts_query(query) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(
        r#"
        SELECT a.id AS article_id, articles_fts.rank AS rank
        FROM articles_fts
        JOIN articles a ON a.id = articles_fts.article_id
        WHERE articles_fts MATCH ?
          AND (? IS NULL OR a.category = ?)
          AND (? IS NULL OR a.source = ?)
          AND (? IS NULL OR a.published_at >= ?)
        ORDER BY articles_fts.rank
        LIMIT ?
        "#,
    )
    .bind(&match_expr)
    .bind(&opts.category)
    .bind(&opts.category)
    .bind(&opts.source)
    .bind(&opts.source)
    .bind(opts.since)
    .bind(opts.since)
    .bind(candidate_k)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            Candidate {
                article_id: row.get("article_id"),
                raw_score: -rank, // negate so higher = better
            }
        })
        .collect())
}

async fn fetch_vector_candidates(
    pool: &SqlitePool,
    query_vec: &[f32],
    model: &str,
    threshold: f32,
    candidate_k: i64,
    opts: &RetrieveOptions,
) -> Result<Vec<Candidate>> {
    // Fetch matching vectors and compute cosine similarity in Rust
    let rows = sqlx::query(
        r#"
        SELECT id, embedding
        FROM articles
        WHERE embedding IS NOT NULL
          AND embedding_model = ?
          AND (? IS NULL OR category = ?)
          AND (? IS NULL OR source = ?)
          AND (? IS NULL OR published_at >= ?)
        "#,
    )
    .bind(model)
    .bind(&opts.category)
    .bind(&opts.category)
    .bind(&opts.source)
    .bind(&opts.source)
    .bind(opts.since)
    .bind(opts.since)
    .fetch_all(pool)
    .await?;

    let mut candidates: Vec<Candidate> = rows
        .iter()
        .filter_map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let similarity = embedding::cosine_similarity(query_vec, &embedding::blob_to_vec(&blob));
            (similarity >= threshold).then(|| Candidate {
                article_id: row.get("id"),
                raw_score: similarity as f64,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.article_id.cmp(&b.article_id))
    });
    candidates.truncate(candidate_k.max(0) as usize);

    Ok(candidates)
}

async fn load_articles(pool: &SqlitePool, ids: &[i64]) -> Result<HashMap<i64, Article>> {
    let ids_json = serde_json::to_string(ids)?;
    let rows = sqlx::query(&format!(
        "SELECT {} FROM articles WHERE id IN (SELECT value FROM json_each(?))",
        ARTICLE_COLUMNS
    ))
    .bind(ids_json)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(Article::from_row)
        .map(|a| (a.id, a))
        .collect())
}

/// Builds an FTS5 MATCH expression from free text.
///
/// Each remaining token is quoted so FTS operators in user input are inert.
/// Returns `None` when nothing searchable is left.
pub fn fts_query(text: &str) -> Option<String> {
    let mut tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .map(|t| t.to_lowercase())
        .filter(|t| t.chars().count() > 1 && !STOPWORDS.contains(&t.as_str()))
        .collect();
    tokens.dedup();
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp.
pub fn parse_since(value: &str) -> Result<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp());
    }
    match NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        Some(dt) => Ok(dt.and_utc().timestamp()),
        None => bail!("Invalid date '{}': expected YYYY-MM-DD or RFC 3339", value),
    }
}

pub async fn run_search(
    config: &Config,
    query: &str,
    mode: &str,
    category: Option<String>,
    source: Option<String>,
    since: Option<String>,
    limit: Option<i64>,
) -> Result<()> {
    let mode = SearchMode::parse(mode)?;

    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    // Semantic/hybrid require embeddings
    if mode.uses_vector() && !config.embedding.is_enabled() {
        bail!(
            "Mode '{}' requires embeddings. Set [embedding] provider in config.",
            if mode == SearchMode::Semantic { "semantic" } else { "hybrid" }
        );
    }

    let opts = RetrieveOptions {
        mode,
        category,
        source,
        since: since.as_deref().map(parse_since).transpose()?,
        limit,
    };

    let pool = db::connect(config).await?;
    let hits = retrieve(&pool, config, query, &opts).await?;
    pool.close().await;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let a = &hit.article;
        let date = DateTime::from_timestamp(a.published_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();

        println!("{}. [{:.2}] {} / {}", i + 1, hit.score, a.source, a.title);
        println!("    published: {}", date);
        if let Some(ref category) = a.category {
            println!("    category: {}", category);
        }
        if let Some(sentiment) = a.sentiment_score {
            println!("    sentiment: {:+.2}", sentiment);
        }
        println!("    url: {}", a.url);
        println!("    id: {}", a.id);
        println!();
    }

    Ok(())
}

// ============ Score normalization ============

/// Min-max normalize scores to [0, 1].
fn normalize_scores(candidates: &[Candidate]) -> Vec<(&Candidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}
