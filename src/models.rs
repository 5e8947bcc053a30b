//! Core data models.
//!
//! Rows are read with explicit `Row::get` calls in the modules that own the
//! tables; these types are what flows between ingestion, retrieval, chat and
//! the HTTP layer. Timestamps are Unix seconds internally and ISO-8601 on the
//! wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Article as produced by a news source, before it has a row id.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
}

/// Stored article.
#[derive(Debug, Clone, Serialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub source: String,
    pub category: Option<String>,
    pub sentiment_score: Option<f64>,
    #[serde(serialize_with = "serialize_ts")]
    pub published_at: i64,
    #[serde(serialize_with = "serialize_ts")]
    pub created_at: i64,
    pub has_embedding: bool,
}

/// Columns selected by [`Article::from_row`].
pub const ARTICLE_COLUMNS: &str = "id, title, description, url, source, category, sentiment_score, \
     published_at, created_at, embedding IS NOT NULL AS has_embedding";

impl Article {
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            title: row.get("title"),
            description: row.get("description"),
            url: row.get("url"),
            source: row.get("source"),
            category: row.get("category"),
            sentiment_score: row.get("sentiment_score"),
            published_at: row.get("published_at"),
            created_at: row.get("created_at"),
            has_embedding: row.get("has_embedding"),
        }
    }

    /// Text used for embedding and prompts: title plus description.
    pub fn embedding_text(&self) -> String {
        article_text(&self.title, self.description.as_deref())
    }
}

pub fn article_text(title: &str, description: Option<&str>) -> String {
    match description {
        Some(d) if !d.trim().is_empty() => format!("{}. {}", title.trim(), d.trim()),
        _ => title.trim().to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// Conversation-level tags chosen by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizon: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub metadata: ConversationMetadata,
    #[serde(serialize_with = "serialize_ts")]
    pub created_at: i64,
    #[serde(serialize_with = "serialize_ts")]
    pub updated_at: i64,
    pub archived: bool,
}

/// A retrieved article attached to an assistant answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub article_id: i64,
    pub title: String,
    pub url: String,
    pub source: String,
    pub published_at: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizon: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub metadata: MessageMetadata,
    #[serde(serialize_with = "serialize_ts")]
    pub created_at: i64,
}

/// Per-user feed configuration. Lists are stored JSON-encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedPreferences {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub exclusions: Vec<String>,
}

pub fn format_ts_iso(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn serialize_ts<S: Serializer>(ts: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_ts_iso(*ts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_article_text_joins_description() {
        assert_eq!(
            article_text("Talks resume", Some("Delegations meet in Geneva")),
            "Talks resume. Delegations meet in Geneva"
        );
        assert_eq!(article_text("Talks resume", Some("   ")), "Talks resume");
        assert_eq!(article_text(" Talks resume ", None), "Talks resume");
    }

    #[test]
    fn test_role_roundtrip_names() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("tool"), None);
    }

    #[test]
    fn test_format_ts_iso() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_ts_iso(1_700_000_000), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_metadata_skips_empty_fields() {
        let json = serde_json::to_string(&MessageMetadata::default()).unwrap();
        assert_eq!(json, "{}");
    }
}
