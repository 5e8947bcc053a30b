//! Conversations, messages, and the RAG chat turn.
//!
//! A turn is split in two. [`prepare_turn`] runs inside the request handler
//! and performs every check that maps to an HTTP status (empty content,
//! unknown or archived conversation), then appends the user message.
//! [`run_turn`] runs in a spawned task and emits [`ChatEvent`]s into a
//! channel that the server relays as Server-Sent Events:
//!
//! ```text
//! sources → chunk* → complete
//!                  ↘ error
//! ```
//!
//! The assistant message is only stored once the upstream stream finished
//! with a terminal marker and a non-empty answer. If the receiving side goes
//! away mid-stream the relay stops and nothing is stored.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::Error;
use crate::llm::{ChatMessage, LlmClient};
use crate::models::{
    format_ts_iso, Conversation, ConversationMetadata, Message, MessageMetadata, Role, Source,
};
use crate::search::{self, ArticleHit, RetrieveOptions, SearchMode};

pub const DEFAULT_TITLE: &str = "New conversation";
const TITLE_CHARS: usize = 60;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a geopolitical news analyst. Answer using the \
numbered sources below when they are relevant and cite them as [n]. Separate reported facts \
from your own assessment. If the sources do not cover the question, say so plainly.";

/// One frame of a streamed chat turn.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEvent {
    Chunk { content: String },
    Sources { sources: Vec<Source> },
    Complete { message_id: String, as_of: String },
    Error { message: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnRequest {
    pub content: String,
    #[serde(default = "default_use_rag")]
    pub use_rag: bool,
    #[serde(default)]
    pub angle: Option<String>,
    #[serde(default)]
    pub horizon: Option<String>,
}

fn default_use_rag() -> bool {
    true
}

/// A validated turn whose user message is already stored.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub conversation: Conversation,
    pub user_message: Message,
    /// Prior messages, oldest first, excluding the new user message.
    pub history: Vec<Message>,
    pub use_rag: bool,
    pub metadata: ConversationMetadata,
}

// ============ Store ============

pub async fn create_conversation(
    pool: &SqlitePool,
    user_id: &str,
    title: Option<&str>,
    metadata: &ConversationMetadata,
) -> Result<Conversation> {
    let now = chrono::Utc::now().timestamp();
    let id = uuid::Uuid::new_v4().to_string();
    let title = title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TITLE);

    sqlx::query(
        r#"
        INSERT INTO conversations (id, user_id, title, metadata_json, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(user_id)
    .bind(title)
    .bind(serde_json::to_string(metadata)?)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(Conversation {
        id,
        user_id: user_id.to_string(),
        title: title.to_string(),
        metadata: metadata.clone(),
        created_at: now,
        updated_at: now,
        archived: false,
    })
}

pub async fn get_conversation(pool: &SqlitePool, id: &str) -> Result<Option<Conversation>> {
    let row = sqlx::query(
        "SELECT id, user_id, title, metadata_json, created_at, updated_at, archived_at \
         FROM conversations WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(conversation_from_row))
}

pub async fn list_conversations(
    pool: &SqlitePool,
    user_id: &str,
    include_archived: bool,
) -> Result<Vec<Conversation>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, title, metadata_json, created_at, updated_at, archived_at
        FROM conversations
        WHERE user_id = ? AND (? OR archived_at IS NULL)
        ORDER BY updated_at DESC, id ASC
        "#,
    )
    .bind(user_id)
    .bind(include_archived)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(conversation_from_row).collect())
}

/// Returns `false` when no such conversation exists.
pub async fn rename_conversation(pool: &SqlitePool, id: &str, title: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
        .bind(title.trim())
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Soft-archives a conversation. Archiving twice keeps the first timestamp.
pub async fn archive_conversation(pool: &SqlitePool, id: &str) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE conversations SET archived_at = COALESCE(archived_at, ?), updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_messages(pool: &SqlitePool, conversation_id: &str) -> Result<Vec<Message>> {
    let rows = sqlx::query(
        "SELECT id, conversation_id, role, content, metadata_json, created_at \
         FROM messages WHERE conversation_id = ? ORDER BY seq ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().filter_map(message_from_row).collect())
}

/// The last `limit` messages, oldest first.
pub async fn recent_messages(pool: &SqlitePool, conversation_id: &str, limit: i64) -> Result<Vec<Message>> {
    let rows = sqlx::query(
        "SELECT id, conversation_id, role, content, metadata_json, created_at \
         FROM messages WHERE conversation_id = ? ORDER BY seq DESC LIMIT ?",
    )
    .bind(conversation_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut messages: Vec<Message> = rows.iter().filter_map(message_from_row).collect();
    messages.reverse();
    Ok(messages)
}

/// Appends a message at the end of the conversation and bumps `updated_at`.
pub async fn append_message(
    pool: &SqlitePool,
    conversation_id: &str,
    role: Role,
    content: &str,
    metadata: &MessageMetadata,
) -> Result<Message> {
    let now = chrono::Utc::now().timestamp();
    let id = uuid::Uuid::new_v4().to_string();

    let mut tx = pool.begin().await?;

    // seq is computed in the same statement so concurrent appends cannot collide
    sqlx::query(
        r#"
        INSERT INTO messages (id, conversation_id, role, content, metadata_json, created_at, seq)
        SELECT ?, ?, ?, ?, ?, ?, COALESCE(MAX(seq), 0) + 1
        FROM messages WHERE conversation_id = ?
        "#,
    )
    .bind(&id)
    .bind(conversation_id)
    .bind(role.as_str())
    .bind(content)
    .bind(serde_json::to_string(metadata)?)
    .bind(now)
    .bind(conversation_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(Message {
        id,
        conversation_id: conversation_id.to_string(),
        role,
        content: content.to_string(),
        metadata: metadata.clone(),
        created_at: now,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Conversation {
    let metadata_json: String = row.get("metadata_json");
    let archived_at: Option<i64> = row.get("archived_at");
    Conversation {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        archived: archived_at.is_some(),
    }
}

fn message_from_row(row: &SqliteRow) -> Option<Message> {
    let role: String = row.get("role");
    let metadata_json: String = row.get("metadata_json");
    Some(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: Role::parse(&role)?,
        content: row.get("content"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: row.get("created_at"),
    })
}

// ============ Turn ============

/// Validates a turn and stores the user message.
pub async fn prepare_turn(
    pool: &SqlitePool,
    config: &Config,
    conversation_id: &str,
    request: &TurnRequest,
) -> crate::error::Result<PreparedTurn> {
    let content = request.content.trim();
    if content.is_empty() {
        return Err(Error::BadRequest("content must not be empty".to_string()));
    }
    if content.chars().count() > config.chat.max_message_chars {
        return Err(Error::BadRequest(format!(
            "content exceeds {} characters",
            config.chat.max_message_chars
        )));
    }

    let conversation = get_conversation(pool, conversation_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("conversation not found: {}", conversation_id)))?;
    if conversation.archived {
        return Err(Error::Conflict(format!(
            "conversation is archived: {}",
            conversation_id
        )));
    }

    let history = recent_messages(pool, conversation_id, config.chat.history_limit).await?;

    let metadata = ConversationMetadata {
        angle: request.angle.clone().or_else(|| conversation.metadata.angle.clone()),
        horizon: request
            .horizon
            .clone()
            .or_else(|| conversation.metadata.horizon.clone()),
    };

    let user_message = append_message(
        pool,
        conversation_id,
        Role::User,
        content,
        &MessageMetadata {
            angle: metadata.angle.clone(),
            horizon: metadata.horizon.clone(),
            ..MessageMetadata::default()
        },
    )
    .await?;

    let mut conversation = conversation;
    let is_first_user_message = !history.iter().any(|m| m.role == Role::User);
    if is_first_user_message && conversation.title == DEFAULT_TITLE {
        let title = title_from(content);
        rename_conversation(pool, conversation_id, &title).await?;
        conversation.title = title;
    }

    Ok(PreparedTurn {
        conversation,
        user_message,
        history,
        use_rag: request.use_rag,
        metadata,
    })
}

/// Runs retrieval and the streamed completion, emitting events into `tx`.
///
/// Returns once the turn completed, failed, or the receiver was dropped.
pub async fn run_turn(
    pool: SqlitePool,
    config: &Config,
    llm: Option<&LlmClient>,
    turn: PreparedTurn,
    tx: mpsc::Sender<ChatEvent>,
) {
    let conversation_id = turn.conversation.id.clone();
    let question = turn.user_message.content.clone();

    let hits = if turn.use_rag {
        let opts = RetrieveOptions::new(SearchMode::default_for(config));
        match search::retrieve(&pool, config, &question, &opts).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(conversation = %conversation_id, error = %e, "retrieval failed, answering without sources");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };
    let sources: Vec<Source> = hits.iter().map(ArticleHit::to_source).collect();

    if turn.use_rag
        && tx
            .send(ChatEvent::Sources {
                sources: sources.clone(),
            })
            .await
            .is_err()
    {
        tracing::info!(conversation = %conversation_id, "client disconnected before sources");
        return;
    }

    let Some(llm) = llm else {
        let _ = tx
            .send(ChatEvent::Error {
                message: "No LLM provider has an API key configured".to_string(),
            })
            .await;
        return;
    };

    let as_of = format_ts_iso(chrono::Utc::now().timestamp());
    let system_prompt = config
        .chat
        .system_prompt
        .as_deref()
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);
    let messages = build_prompt(
        system_prompt,
        &turn.metadata,
        &hits,
        &as_of,
        &turn.history,
        &question,
    );

    let mut stream = match llm.open_stream(&messages).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(conversation = %conversation_id, error = %e, "all LLM providers failed");
            let _ = tx
                .send(ChatEvent::Error {
                    message: format!("LLM request failed: {}", e),
                })
                .await;
            return;
        }
    };

    let mut answer = String::new();
    loop {
        match stream.next_delta().await {
            Ok(Some(delta)) => {
                answer.push_str(&delta);
                if tx.send(ChatEvent::Chunk { content: delta }).await.is_err() {
                    tracing::info!(conversation = %conversation_id, "client disconnected mid-stream, answer discarded");
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(conversation = %conversation_id, provider = %stream.provider, error = %e, "stream interrupted");
                let _ = tx
                    .send(ChatEvent::Error {
                        message: format!("stream interrupted: {}", e),
                    })
                    .await;
                return;
            }
        }
    }

    if answer.trim().is_empty() {
        tracing::warn!(conversation = %conversation_id, provider = %stream.provider, "empty answer discarded");
        let _ = tx
            .send(ChatEvent::Error {
                message: "the model returned an empty answer".to_string(),
            })
            .await;
        return;
    }

    let metadata = MessageMetadata {
        sources,
        as_of: Some(as_of.clone()),
        provider: Some(stream.provider.clone()),
        model: Some(stream.model.clone()),
        angle: turn.metadata.angle.clone(),
        horizon: turn.metadata.horizon.clone(),
    };

    match append_message(&pool, &conversation_id, Role::Assistant, &answer, &metadata).await {
        Ok(message) => {
            let _ = tx
                .send(ChatEvent::Complete {
                    message_id: message.id,
                    as_of,
                })
                .await;
        }
        Err(e) => {
            tracing::error!(conversation = %conversation_id, error = %e, "failed to store assistant message");
            let _ = tx
                .send(ChatEvent::Error {
                    message: "failed to store answer".to_string(),
                })
                .await;
        }
    }
}

/// Assembles the system prompt, bounded history, and the new question.
pub fn build_prompt(
    system_prompt: &str,
    metadata: &ConversationMetadata,
    sources: &[ArticleHit],
    as_of: &str,
    history: &[Message],
    question: &str,
) -> Vec<ChatMessage> {
    let mut system = String::from(system_prompt);
    system.push_str(&format!("\n\nCurrent time (as of): {}", as_of));
    if let Some(angle) = &metadata.angle {
        system.push_str(&format!("\nAnalytical angle: {}", angle));
    }
    if let Some(horizon) = &metadata.horizon {
        system.push_str(&format!("\nTime horizon: {}", horizon));
    }

    if sources.is_empty() {
        system.push_str("\n\nNo recent articles matched this question.");
    } else {
        system.push_str("\n\nSources:");
        for (i, hit) in sources.iter().enumerate() {
            let a = &hit.article;
            system.push_str(&format!(
                "\n[{}] {} ({}, {})",
                i + 1,
                a.title,
                a.source,
                format_ts_iso(a.published_at)
            ));
            if let Some(description) = a.description.as_deref().filter(|d| !d.trim().is_empty()) {
                system.push_str(&format!("\n{}", description.trim()));
            }
            system.push_str(&format!("\n{}", a.url));
        }
    }

    let mut messages = vec![ChatMessage::system(system)];
    for m in history {
        match m.role {
            Role::User => messages.push(ChatMessage::user(&m.content)),
            Role::Assistant => messages.push(ChatMessage::assistant(&m.content)),
            Role::System => {}
        }
    }
    messages.push(ChatMessage::user(question));
    messages
}

fn title_from(content: &str) -> String {
    let line = content.lines().next().unwrap_or(content).trim();
    if line.chars().count() <= TITLE_CHARS {
        return line.to_string();
    }
    let mut title: String = line.chars().take(TITLE_CHARS - 1).collect();
    title.push('…');
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::insert_articles;
    use crate::llm::{Provider, ProviderKind};
    use crate::models::NewArticle;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_pool(dir: &tempfile::TempDir) -> SqlitePool {
        let pool = crate::db::connect_path(&dir.path().join("news.sqlite")).await.unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        pool
    }

    fn request(content: &str) -> TurnRequest {
        TurnRequest {
            content: content.to_string(),
            use_rag: true,
            angle: None,
            horizon: None,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_seq() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let conv = create_conversation(&pool, "u1", None, &ConversationMetadata::default())
            .await
            .unwrap();

        for text in ["one", "two", "three"] {
            append_message(&pool, &conv.id, Role::User, text, &MessageMetadata::default())
                .await
                .unwrap();
        }
        let messages = list_messages(&pool, &conv.id).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);

        let recent = recent_messages(&pool, &conv.id, 2).await.unwrap();
        assert_eq!(recent[0].content, "two");
        assert_eq!(recent[1].content, "three");
    }

    #[tokio::test]
    async fn test_archived_conversations_hidden_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let meta = ConversationMetadata::default();
        let a = create_conversation(&pool, "u1", Some("Keep"), &meta).await.unwrap();
        let b = create_conversation(&pool, "u1", Some("Old"), &meta).await.unwrap();
        create_conversation(&pool, "u2", None, &meta).await.unwrap();

        assert!(archive_conversation(&pool, &b.id).await.unwrap());
        let visible = list_conversations(&pool, "u1", false).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, a.id);
        assert_eq!(list_conversations(&pool, "u1", true).await.unwrap().len(), 2);
        assert!(!archive_conversation(&pool, "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_prepare_turn_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let config = Config::minimal(dir.path().join("news.sqlite"));
        let conv = create_conversation(&pool, "u1", None, &ConversationMetadata::default())
            .await
            .unwrap();

        let err = prepare_turn(&pool, &config, &conv.id, &request("   ")).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 400);

        let err = prepare_turn(&pool, &config, "nope", &request("hi")).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 404);

        archive_conversation(&pool, &conv.id).await.unwrap();
        let err = prepare_turn(&pool, &config, &conv.id, &request("hi")).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 409);
        assert!(list_messages(&pool, &conv.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_message_sets_default_title() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let config = Config::minimal(dir.path().join("news.sqlite"));
        let conv = create_conversation(&pool, "u1", None, &ConversationMetadata::default())
            .await
            .unwrap();

        let turn = prepare_turn(&pool, &config, &conv.id, &request("What changed in the Sahel?"))
            .await
            .unwrap();
        assert_eq!(turn.conversation.title, "What changed in the Sahel?");

        prepare_turn(&pool, &config, &conv.id, &request("And Niger?")).await.unwrap();
        let stored = get_conversation(&pool, &conv.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "What changed in the Sahel?");
    }

    #[test]
    fn test_prompt_numbers_sources_and_keeps_history_order() {
        let hit = ArticleHit {
            article: crate::models::Article {
                id: 3,
                title: "Talks in Doha".to_string(),
                description: Some("Mediators report progress".to_string()),
                url: "https://example.com/doha".to_string(),
                source: "AP".to_string(),
                category: None,
                sentiment_score: None,
                published_at: 0,
                created_at: 0,
                has_embedding: false,
            },
            score: 1.0,
            similarity: None,
        };
        let history = vec![Message {
            id: "m1".to_string(),
            conversation_id: "c".to_string(),
            role: Role::User,
            content: "earlier".to_string(),
            metadata: MessageMetadata::default(),
            created_at: 0,
        }];
        let meta = ConversationMetadata {
            angle: Some("security".to_string()),
            horizon: None,
        };

        let messages = build_prompt("persona", &meta, &[hit], "2024-01-01T00:00:00Z", &history, "now?");
        assert_eq!(messages.len(), 3);
        assert!(messages[0].content.contains("[1] Talks in Doha (AP, 1970-01-01T00:00:00Z)"));
        assert!(messages[0].content.contains("Analytical angle: security"));
        assert!(messages[0].content.contains("as of): 2024-01-01T00:00:00Z"));
        assert_eq!(messages[1].content, "earlier");
        assert_eq!(messages[2].content, "now?");
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(ChatEvent::Chunk {
            content: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "chunk", "content": "hi"}));
    }

    #[tokio::test]
    async fn test_run_turn_streams_and_stores_answer() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Talks \"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"resumed [1].\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let config = Config::minimal(dir.path().join("news.sqlite"));
        insert_articles(
            &pool,
            &[NewArticle {
                title: "Ceasefire talks resume in Cairo".to_string(),
                description: None,
                url: "https://example.com/cairo".to_string(),
                source: "Reuters".to_string(),
                published_at: chrono::Utc::now(),
            }],
        )
        .await
        .unwrap();

        let conv = create_conversation(&pool, "u1", None, &ConversationMetadata::default())
            .await
            .unwrap();
        let turn = prepare_turn(&pool, &config, &conv.id, &request("ceasefire talks"))
            .await
            .unwrap();

        let llm = LlmClient::new(
            vec![Provider::new(ProviderKind::OpenAi, "gpt-test", Some(&server.uri()), "k".into())],
            5,
            0.0,
            100,
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        run_turn(pool.clone(), &config, Some(&llm), turn, tx).await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        match &events[0] {
            ChatEvent::Sources { sources } => {
                assert_eq!(sources.len(), 1);
                assert_eq!(sources[0].url, "https://example.com/cairo");
            }
            other => panic!("expected sources first, got {:?}", other),
        }
        assert_eq!(
            events[1],
            ChatEvent::Chunk {
                content: "Talks ".to_string()
            }
        );
        let message_id = match events.last().unwrap() {
            ChatEvent::Complete { message_id, .. } => message_id.clone(),
            other => panic!("expected complete, got {:?}", other),
        };

        let messages = list_messages(&pool, &conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id, message_id);
        assert_eq!(messages[1].content, "Talks resumed [1].");
        assert_eq!(messages[1].metadata.provider.as_deref(), Some("openai"));
        assert_eq!(messages[1].metadata.sources.len(), 1);
    }

    fn stream_client(server: &MockServer) -> LlmClient {
        LlmClient::new(
            vec![Provider::new(ProviderKind::OpenAi, "gpt-test", Some(&server.uri()), "k".into())],
            5,
            0.0,
            100,
        )
        .unwrap()
    }

    async fn mock_stream(body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .mount(&server)
            .await;
        server
    }

    async fn collect_turn(pool: &SqlitePool, config: &Config, llm: &LlmClient, turn: PreparedTurn) -> Vec<ChatEvent> {
        let (tx, mut rx) = mpsc::channel(16);
        run_turn(pool.clone(), config, Some(llm), turn, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_truncated_stream_ends_with_error_and_stores_nothing() {
        let server = mock_stream(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Talks \"},\"finish_reason\":null}]}\n\n",
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let config = Config::minimal(dir.path().join("news.sqlite"));
        let conv = create_conversation(&pool, "u1", None, &ConversationMetadata::default())
            .await
            .unwrap();
        let turn = prepare_turn(&pool, &config, &conv.id, &request("q")).await.unwrap();

        let events = collect_turn(&pool, &config, &stream_client(&server), turn).await;
        assert!(matches!(events.last(), Some(ChatEvent::Error { .. })));
        assert!(!events.iter().any(|e| matches!(e, ChatEvent::Complete { .. })));

        let messages = list_messages(&pool, &conv.id).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q"]);
    }

    #[tokio::test]
    async fn test_empty_answer_is_not_stored() {
        for body in ["", "data: [DONE]\n\n"] {
            let server = mock_stream(body).await;
            let dir = tempfile::tempdir().unwrap();
            let pool = test_pool(&dir).await;
            let config = Config::minimal(dir.path().join("news.sqlite"));
            let conv = create_conversation(&pool, "u1", None, &ConversationMetadata::default())
                .await
                .unwrap();
            let turn = prepare_turn(&pool, &config, &conv.id, &request("q")).await.unwrap();

            let events = collect_turn(&pool, &config, &stream_client(&server), turn).await;
            assert!(
                matches!(events.last(), Some(ChatEvent::Error { .. })),
                "body {:?} gave {:?}",
                body,
                events
            );
            assert_eq!(list_messages(&pool, &conv.id).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_receiver_dropped_mid_stream_discards_answer() {
        let mut body = String::new();
        for word in ["One ", "two ", "three ", "four ", "five."] {
            body.push_str(&format!(
                "data: {}\n\n",
                serde_json::json!({"choices": [{"delta": {"content": word}, "finish_reason": null}]})
            ));
        }
        body.push_str("data: [DONE]\n\n");
        let server = mock_stream(&body).await;

        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let config = Config::minimal(dir.path().join("news.sqlite"));
        let conv = create_conversation(&pool, "u1", None, &ConversationMetadata::default())
            .await
            .unwrap();
        let turn = prepare_turn(&pool, &config, &conv.id, &request("count")).await.unwrap();

        let llm = stream_client(&server);
        let (tx, mut rx) = mpsc::channel(1);
        let task_pool = pool.clone();
        let handle = tokio::spawn(async move {
            run_turn(task_pool, &config, Some(&llm), turn, tx).await;
        });

        assert!(matches!(rx.recv().await, Some(ChatEvent::Sources { .. })));
        assert_eq!(
            rx.recv().await,
            Some(ChatEvent::Chunk {
                content: "One ".to_string()
            })
        );
        drop(rx);
        handle.await.unwrap();

        let messages = list_messages(&pool, &conv.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_turn_angle_and_horizon_saved_on_messages() {
        let server = mock_stream(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Likely.\"},\"finish_reason\":\"stop\"}]}\n\n",
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let config = Config::minimal(dir.path().join("news.sqlite"));
        let conv = create_conversation(
            &pool,
            "u1",
            None,
            &ConversationMetadata {
                angle: Some("economic".to_string()),
                horizon: None,
            },
        )
        .await
        .unwrap();

        let mut req = request("Will sanctions widen?");
        req.horizon = Some("6 months".to_string());
        let turn = prepare_turn(&pool, &config, &conv.id, &req).await.unwrap();
        let events = collect_turn(&pool, &config, &stream_client(&server), turn).await;
        assert!(matches!(events.last(), Some(ChatEvent::Complete { .. })));

        let messages = list_messages(&pool, &conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        for m in &messages {
            assert_eq!(m.metadata.angle.as_deref(), Some("economic"));
            assert_eq!(m.metadata.horizon.as_deref(), Some("6 months"));
        }
    }

    #[tokio::test]
    async fn test_dropped_receiver_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let config = Config::minimal(dir.path().join("news.sqlite"));
        let conv = create_conversation(&pool, "u1", None, &ConversationMetadata::default())
            .await
            .unwrap();
        let turn = prepare_turn(&pool, &config, &conv.id, &request("anything"))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        run_turn(pool.clone(), &config, None, turn, tx).await;

        let messages = list_messages(&pool, &conv.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }
}
