//! HTTP server.
//!
//! Exposes the dashboard REST API and the streamed chat endpoint.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/health` | Integrity probe; 200 healthy, 503 unhealthy |
//! | `GET`  | `/api/articles` | Paginated, filterable article list |
//! | `GET`  | `/api/articles/{id}` | One article |
//! | `GET`  | `/api/stats` | Aggregate statistics |
//! | `GET`  | `/api/chat/conversations` | Conversations of `?user_id=` |
//! | `POST` | `/api/chat/conversations` | Create a conversation |
//! | `GET`  | `/api/chat/conversations/{id}` | Conversation with messages |
//! | `PATCH`| `/api/chat/conversations/{id}` | Rename |
//! | `POST` | `/api/chat/conversations/{id}/archive` | Soft archive |
//! | `POST` | `/api/chat/conversations/{id}/messages` | Chat turn, streamed as SSE |
//! | `GET`  | `/api/feed/preferences/{user_id}` | Feed preferences |
//! | `PUT`  | `/api/feed/preferences/{user_id}` | Replace feed preferences |
//! | `GET`  | `/api/feed/{user_id}` | Personalized feed |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "conversation not found: ..." } }
//! ```
//!
//! # Streaming
//!
//! Each SSE frame carries one JSON object with a `type` of `sources`,
//! `chunk`, `complete`, or `error`. The relay runs in its own task; when the
//! client disconnects the response stream is dropped, the task's next send
//! fails, and it stops without storing a partial answer.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{request::Parts, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::chat::{self, ChatEvent, TurnRequest};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::feed;
use crate::health;
use crate::llm::LlmClient;
use crate::load;
use crate::models::{Article, Conversation, ConversationMetadata, FeedPreferences, Message, ARTICLE_COLUMNS};
use crate::search;
use crate::stats;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;
/// Sentiment magnitude at which an article counts as positive or negative.
const SENTIMENT_BAND: f64 = 0.2;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    /// `None` when no LLM provider has a key; chat turns then end with an error frame.
    pub llm: Option<Arc<LlmClient>>,
    pub limiter: Arc<RateLimiter>,
    pub load_probe: fn() -> Option<f64>,
}

impl AppState {
    pub fn new(config: Arc<Config>, pool: SqlitePool, llm: Option<Arc<LlmClient>>) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.server.chat_rate_limit_per_minute));
        Self {
            config,
            pool,
            llm,
            limiter,
            load_probe: load::load_percent,
        }
    }
}

/// Fixed one-minute window shared by all clients. A limit of `0` disables it.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Mutex<(Instant, u32)>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            window: Mutex::new((Instant::now(), 0)),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut window = match self.window.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        if now.duration_since(window.0) >= Duration::from_secs(60) {
            *window = (now, 0);
        }
        if window.1 >= self.limit {
            return false;
        }
        window.1 += 1;
        true
    }
}

/// Starts the HTTP server on `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::migrate_pool(&pool).await?;

    let llm = match LlmClient::from_config(&config.llm) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!(error = %e, "chat disabled: no usable LLM provider");
            None
        }
    };

    let bind_addr = config.server.bind.clone();
    let state = AppState::new(Arc::new(config.clone()), pool, llm);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "newsdesk server listening");
    println!("newsdesk listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/articles", get(handle_list_articles))
        .route("/api/articles/{id}", get(handle_get_article))
        .route("/api/stats", get(handle_stats))
        .route(
            "/api/chat/conversations",
            get(handle_list_conversations).post(handle_create_conversation),
        )
        .route(
            "/api/chat/conversations/{id}",
            get(handle_get_conversation).patch(handle_rename_conversation),
        )
        .route("/api/chat/conversations/{id}/archive", post(handle_archive_conversation))
        .route("/api/chat/conversations/{id}/messages", post(handle_chat_turn))
        .route(
            "/api/feed/preferences/{user_id}",
            get(handle_get_preferences).put(handle_put_preferences),
        )
        .route("/api/feed/{user_id}", get(handle_feed))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

// ============ Extractors ============
//
// Thin wrappers over the axum extractors so malformed input is answered with
// the JSON error body instead of plain text.

struct ApiQuery<T>(T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(ApiQuery(value))
    }
}

struct ApiPath<T>(T);

impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(ApiPath(value))
    }
}

struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

// ============ GET /api/health ============

async fn handle_health(State(state): State<AppState>) -> Response {
    let report = health::check(&state.pool).await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

// ============ Articles ============

#[derive(Debug, Deserialize)]
struct ArticlesQuery {
    category: Option<String>,
    source: Option<String>,
    q: Option<String>,
    since: Option<String>,
    /// `positive`, `negative`, or `neutral`.
    sentiment: Option<String>,
    page: Option<i64>,
    per_page: Option<i64>,
}

#[derive(Serialize)]
struct ArticlesPage {
    articles: Vec<Article>,
    page: i64,
    per_page: i64,
    total: i64,
}

async fn handle_list_articles(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<ArticlesQuery>,
) -> Result<Json<ArticlesPage>> {
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = (page - 1)
        .checked_mul(per_page)
        .ok_or_else(|| Error::BadRequest(format!("page {} is out of range", page)))?;

    let since = params
        .since
        .as_deref()
        .map(search::parse_since)
        .transpose()
        .map_err(|e| Error::BadRequest(e.to_string()))?;

    let sentiment = params.sentiment.as_deref().map(str::to_lowercase);
    if let Some(s) = sentiment.as_deref() {
        if !matches!(s, "positive" | "negative" | "neutral") {
            return Err(Error::BadRequest(format!(
                "sentiment must be positive, negative, or neutral, got '{}'",
                s
            )));
        }
    }

    let match_expr = params.q.as_deref().and_then(search::fts_query);
    if params.q.as_deref().is_some_and(|q| !q.trim().is_empty()) && match_expr.is_none() {
        // only stopwords: nothing can match
        return Ok(Json(ArticlesPage {
            articles: Vec::new(),
            page,
            per_page,
            total: 0,
        }));
    }

    let filter = r#"
        FROM articles
        WHERE (?1 IS NULL OR category = ?1)
          AND (?2 IS NULL OR source = ?2)
          AND (?3 IS NULL OR published_at >= ?3)
          AND (?4 IS NULL
               OR (?4 = 'positive' AND sentiment_score >= ?5)
               OR (?4 = 'negative' AND sentiment_score <= -?5)
               OR (?4 = 'neutral' AND sentiment_score > -?5 AND sentiment_score < ?5))
          AND (?6 IS NULL OR id IN (SELECT article_id FROM articles_fts WHERE articles_fts MATCH ?6))
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) {}", filter))
        .bind(&params.category)
        .bind(&params.source)
        .bind(since)
        .bind(&sentiment)
        .bind(SENTIMENT_BAND)
        .bind(&match_expr)
        .fetch_one(&state.pool)
        .await?;

    let rows = sqlx::query(&format!(
        "SELECT {} {} ORDER BY published_at DESC, id DESC LIMIT ?7 OFFSET ?8",
        ARTICLE_COLUMNS, filter
    ))
    .bind(&params.category)
    .bind(&params.source)
    .bind(since)
    .bind(&sentiment)
    .bind(SENTIMENT_BAND)
    .bind(&match_expr)
    .bind(per_page)
    .bind(offset)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(ArticlesPage {
        articles: rows.iter().map(Article::from_row).collect(),
        page,
        per_page,
        total,
    }))
}

async fn handle_get_article(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> Result<Json<Article>> {
    let row = sqlx::query(&format!("SELECT {} FROM articles WHERE id = ?", ARTICLE_COLUMNS))
        .bind(id)
        .fetch_optional(&state.pool)
        .await?;
    row.map(|r| Json(Article::from_row(&r)))
        .ok_or_else(|| Error::NotFound(format!("article not found: {}", id)))
}

// ============ GET /api/stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<stats::Stats>> {
    Ok(Json(stats::collect_stats(&state.pool, &state.config.db.path).await?))
}

// ============ Conversations ============

#[derive(Debug, Deserialize)]
struct ListConversationsQuery {
    user_id: String,
    #[serde(default)]
    include_archived: bool,
}

#[derive(Debug, Deserialize)]
struct CreateConversation {
    user_id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    angle: Option<String>,
    #[serde(default)]
    horizon: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenameConversation {
    title: String,
}

#[derive(Serialize)]
struct ConversationWithMessages {
    #[serde(flatten)]
    conversation: Conversation,
    messages: Vec<Message>,
}

async fn handle_list_conversations(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<ListConversationsQuery>,
) -> Result<Json<Vec<Conversation>>> {
    if params.user_id.trim().is_empty() {
        return Err(Error::BadRequest("user_id must not be empty".to_string()));
    }
    Ok(Json(
        chat::list_conversations(&state.pool, &params.user_id, params.include_archived).await?,
    ))
}

async fn handle_create_conversation(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CreateConversation>,
) -> Result<(StatusCode, Json<Conversation>)> {
    if body.user_id.trim().is_empty() {
        return Err(Error::BadRequest("user_id must not be empty".to_string()));
    }
    let metadata = ConversationMetadata {
        angle: body.angle,
        horizon: body.horizon,
    };
    let conversation =
        chat::create_conversation(&state.pool, &body.user_id, body.title.as_deref(), &metadata).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn handle_get_conversation(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
) -> Result<Json<ConversationWithMessages>> {
    let conversation = find_conversation(&state.pool, &id).await?;
    let messages = chat::list_messages(&state.pool, &id).await?;
    Ok(Json(ConversationWithMessages {
        conversation,
        messages,
    }))
}

async fn handle_rename_conversation(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    ApiJson(body): ApiJson<RenameConversation>,
) -> Result<Json<Conversation>> {
    if body.title.trim().is_empty() {
        return Err(Error::BadRequest("title must not be empty".to_string()));
    }
    if !chat::rename_conversation(&state.pool, &id, &body.title).await? {
        return Err(Error::NotFound(format!("conversation not found: {}", id)));
    }
    Ok(Json(find_conversation(&state.pool, &id).await?))
}

async fn handle_archive_conversation(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
) -> Result<Json<Conversation>> {
    if !chat::archive_conversation(&state.pool, &id).await? {
        return Err(Error::NotFound(format!("conversation not found: {}", id)));
    }
    Ok(Json(find_conversation(&state.pool, &id).await?))
}

async fn find_conversation(pool: &SqlitePool, id: &str) -> Result<Conversation> {
    chat::get_conversation(pool, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("conversation not found: {}", id)))
}

// ============ POST /api/chat/conversations/{id}/messages ============

async fn handle_chat_turn(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    body: std::result::Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>> {
    let max_load = state.config.server.max_load_percent;
    if let Some(pct) = (state.load_probe)() {
        if pct > max_load {
            tracing::warn!(load_percent = pct, max_load, "chat turn shed");
            return Err(Error::Overloaded(format!(
                "load {:.0}% exceeds {:.0}%",
                pct, max_load
            )));
        }
    }

    if !state.limiter.try_acquire() {
        return Err(Error::RateLimited(format!(
            "more than {} chat turns per minute",
            state.config.server.chat_rate_limit_per_minute
        )));
    }

    let Json(body) = body?;
    let turn = chat::prepare_turn(&state.pool, &state.config, &id, &body).await?;

    let (tx, rx) = mpsc::channel::<ChatEvent>(32);
    let pool = state.pool.clone();
    let config = state.config.clone();
    let llm = state.llm.clone();
    tokio::spawn(async move {
        chat::run_turn(pool, &config, llm.as_deref(), turn, tx).await;
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|event| (Event::default().json_data(&event), rx))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ Feed ============

#[derive(Debug, Deserialize)]
struct FeedQuery {
    limit: Option<i64>,
}

async fn handle_get_preferences(
    State(state): State<AppState>,
    ApiPath(user_id): ApiPath<String>,
) -> Result<Json<FeedPreferences>> {
    Ok(Json(
        feed::get_preferences(&state.pool, &user_id)
            .await?
            .unwrap_or_default(),
    ))
}

async fn handle_put_preferences(
    State(state): State<AppState>,
    ApiPath(user_id): ApiPath<String>,
    ApiJson(prefs): ApiJson<FeedPreferences>,
) -> Result<Json<FeedPreferences>> {
    Ok(Json(feed::put_preferences(&state.pool, &user_id, &prefs).await?))
}

async fn handle_feed(
    State(state): State<AppState>,
    ApiPath(user_id): ApiPath<String>,
    ApiQuery(params): ApiQuery<FeedQuery>,
) -> Result<Json<Vec<feed::FeedItem>>> {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    Ok(Json(
        feed::personalized_feed(&state.pool, &state.config, &user_id, limit).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::insert_articles;
    use crate::models::NewArticle;

    async fn spawn_app(mut config: Config, load_probe: fn() -> Option<f64>) -> (String, SqlitePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        config.db.path = dir.path().join("news.sqlite");
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();

        let mut state = AppState::new(Arc::new(config), pool.clone(), None);
        state.load_probe = load_probe;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (format!("http://{}", addr), pool, dir)
    }

    fn no_load() -> Option<f64> {
        None
    }

    fn high_load() -> Option<f64> {
        Some(400.0)
    }

    #[test]
    fn test_rate_limiter_window() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        assert!(limiter.try_acquire_at(start));
        assert!(limiter.try_acquire_at(start));
        assert!(!limiter.try_acquire_at(start + Duration::from_secs(30)));
        assert!(limiter.try_acquire_at(start + Duration::from_secs(61)));
        assert!(RateLimiter::new(0).try_acquire_at(start));
    }

    #[tokio::test]
    async fn test_health_and_article_endpoints() {
        let (base, pool, _dir) = spawn_app(Config::minimal("unused"), no_load).await;
        insert_articles(
            &pool,
            &[NewArticle {
                title: "Summit in Brussels".to_string(),
                description: Some("NATO ministers meet".to_string()),
                url: "https://example.com/summit".to_string(),
                source: "AP".to_string(),
                published_at: chrono::Utc::now(),
            }],
        )
        .await
        .unwrap();
        sqlx::query("UPDATE articles SET sentiment_score = 0.6, category = 'diplomacy'")
            .execute(&pool)
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let health: serde_json::Value = client
            .get(format!("{}/api/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "healthy");

        let page: serde_json::Value = client
            .get(format!("{}/api/articles?q=nato&sentiment=positive", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(page["total"], 1);
        assert_eq!(page["articles"][0]["category"], "diplomacy");

        let empty: serde_json::Value = client
            .get(format!("{}/api/articles?sentiment=negative", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(empty["total"], 0);

        let missing = client.get(format!("{}/api/articles/999", base)).send().await.unwrap();
        assert_eq!(missing.status(), 404);
        let body: serde_json::Value = missing.json().await.unwrap();
        assert_eq!(body["error"]["code"], "not_found");

        let bad = client
            .get(format!("{}/api/articles?sentiment=angry", base))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), 400);
    }

    #[tokio::test]
    async fn test_huge_page_is_rejected_not_overflowed() {
        let (base, _pool, _dir) = spawn_app(Config::minimal("unused"), no_load).await;
        let response = reqwest::Client::new()
            .get(format!(
                "{}/api/articles?page=9223372036854775807&per_page=100",
                base
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_malformed_input_uses_json_error_body() {
        let (base, _pool, _dir) = spawn_app(Config::minimal("unused"), no_load).await;
        let client = reqwest::Client::new();

        let responses = vec![
            client.get(format!("{}/api/articles?page=abc", base)).send().await.unwrap(),
            client.get(format!("{}/api/articles/abc", base)).send().await.unwrap(),
            client
                .post(format!("{}/api/chat/conversations", base))
                .header("content-type", "application/json")
                .body("{not json")
                .send()
                .await
                .unwrap(),
            client
                .post(format!("{}/api/chat/conversations/any/messages", base))
                .json(&serde_json::json!({"text": "missing content field"}))
                .send()
                .await
                .unwrap(),
        ];

        for response in responses {
            assert_eq!(response.status(), 400);
            let body: serde_json::Value = response.json().await.unwrap();
            assert_eq!(body["error"]["code"], "bad_request");
            assert!(body["error"]["message"].as_str().is_some());
        }
    }

    #[tokio::test]
    async fn test_chat_turn_status_codes() {
        let (base, _pool, _dir) = spawn_app(Config::minimal("unused"), no_load).await;
        let client = reqwest::Client::new();

        let created: serde_json::Value = client
            .post(format!("{}/api/chat/conversations", base))
            .json(&serde_json::json!({"user_id": "u1"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        let turn_url = format!("{}/api/chat/conversations/{}/messages", base, id);

        let empty = client
            .post(&turn_url)
            .json(&serde_json::json!({"content": ""}))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status(), 400);

        let unknown = client
            .post(format!("{}/api/chat/conversations/nope/messages", base))
            .json(&serde_json::json!({"content": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), 404);

        client
            .post(format!("{}/api/chat/conversations/{}/archive", base, id))
            .send()
            .await
            .unwrap();
        let archived = client
            .post(&turn_url)
            .json(&serde_json::json!({"content": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(archived.status(), 409);
    }

    #[tokio::test]
    async fn test_chat_turn_shed_under_load() {
        let (base, _pool, _dir) = spawn_app(Config::minimal("unused"), high_load).await;
        let response = reqwest::Client::new()
            .post(format!("{}/api/chat/conversations/any/messages", base))
            .json(&serde_json::json!({"content": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
    }

    #[tokio::test]
    async fn test_chat_turn_rate_limited() {
        let mut config = Config::minimal("unused");
        config.server.chat_rate_limit_per_minute = 1;
        let (base, _pool, _dir) = spawn_app(config, no_load).await;
        let client = reqwest::Client::new();
        let url = format!("{}/api/chat/conversations/any/messages", base);

        let first = client.post(&url).json(&serde_json::json!({"content": "hi"})).send().await.unwrap();
        assert_eq!(first.status(), 404);
        let second = client.post(&url).json(&serde_json::json!({"content": "hi"})).send().await.unwrap();
        assert_eq!(second.status(), 429);
    }

    #[tokio::test]
    async fn test_chat_turn_without_llm_streams_error_frame() {
        let (base, _pool, _dir) = spawn_app(Config::minimal("unused"), no_load).await;
        let client = reqwest::Client::new();
        let created: serde_json::Value = client
            .post(format!("{}/api/chat/conversations", base))
            .json(&serde_json::json!({"user_id": "u1", "title": "Sahel"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let body = client
            .post(format!(
                "{}/api/chat/conversations/{}/messages",
                base,
                created["id"].as_str().unwrap()
            ))
            .json(&serde_json::json!({"content": "What happened?"}))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert!(body.contains("\"type\":\"sources\""));
        assert!(body.contains("\"type\":\"error\""));
        assert!(!body.contains("\"type\":\"complete\""));
    }
}
