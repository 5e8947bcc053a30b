//! Telegram Bot API notifications.
//!
//! Used for operational alerts (failed ingest, failed backup) and the daily
//! headline digest. Notifications are enabled when both `TELEGRAM_BOT_TOKEN`
//! and `TELEGRAM_CHAT_ID` are present in the environment.

use anyhow::{anyhow, bail, Result};
use reqwest::Client;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use crate::config::{env_secret, Config, NotifyConfig};

/// Telegram rejects messages longer than this.
const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, Clone)]
pub struct Notifier {
    client: Client,
    base_url: String,
    token: String,
    chat_id: String,
}

#[derive(Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl Notifier {
    /// Builds a notifier from the environment; `None` when not configured.
    pub fn from_config(config: &NotifyConfig) -> Option<Self> {
        let token = env_secret("TELEGRAM_BOT_TOKEN")?;
        let chat_id = env_secret("TELEGRAM_CHAT_ID")?;
        Self::new(&config.telegram_url, token, chat_id).ok()
    }

    pub fn new(base_url: &str, token: String, chat_id: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            chat_id,
        })
    }

    pub async fn send(&self, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": truncate_chars(text, MAX_MESSAGE_CHARS),
            "disable_web_page_preview": true,
        });

        let response = self
            .client
            .post(format!("{}/bot{}/sendMessage", self.base_url, self.token))
            .json(&body)
            .send()
            .await
            // the URL carries the bot token
            .map_err(reqwest::Error::without_url)?;

        let status = response.status();
        let parsed: Option<TelegramResponse> = response.json().await.ok();
        match parsed {
            Some(r) if r.ok && status.is_success() => Ok(()),
            Some(r) => bail!(
                "Telegram API error {}: {}",
                status,
                r.description.unwrap_or_default()
            ),
            None => bail!("Telegram API error {}", status),
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Formats the most recent articles of the last 24 hours as a digest.
pub async fn build_digest(pool: &SqlitePool, limit: i64) -> Result<Option<String>> {
    let since = chrono::Utc::now().timestamp() - 86_400;
    let rows = sqlx::query(
        r#"
        SELECT title, url, source, sentiment_score, category
        FROM articles
        WHERE published_at >= ?
        ORDER BY ABS(COALESCE(sentiment_score, 0)) DESC, published_at DESC, id ASC
        LIMIT ?
        "#,
    )
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut text = String::from("Newsdesk digest (last 24h)\n");
    for (i, row) in rows.iter().enumerate() {
        let title: String = row.get("title");
        let url: String = row.get("url");
        let source: String = row.get("source");
        let sentiment: Option<f64> = row.get("sentiment_score");
        let category: Option<String> = row.get("category");
        text.push_str(&format!(
            "\n{}. {} ({}{})\n{}\n",
            i + 1,
            title,
            source,
            match (category, sentiment) {
                (Some(c), Some(s)) => format!(", {} {:+.2}", c, s),
                (Some(c), None) => format!(", {}", c),
                (None, Some(s)) => format!(", {:+.2}", s),
                (None, None) => String::new(),
            },
            url
        ));
    }
    Ok(Some(text))
}

pub async fn run_notify_test(config: &Config, message: &str) -> Result<()> {
    let notifier = Notifier::from_config(&config.notify)
        .ok_or_else(|| anyhow!("Telegram is not configured: set TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID"))?;
    notifier.send(message).await?;
    println!("notification sent");
    Ok(())
}

pub async fn run_notify_digest(config: &Config) -> Result<()> {
    let notifier = Notifier::from_config(&config.notify)
        .ok_or_else(|| anyhow!("Telegram is not configured: set TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID"))?;
    let pool = crate::db::connect(config).await?;
    let digest = build_digest(&pool, config.notify.digest_limit).await?;
    pool.close().await;

    match digest {
        Some(text) => {
            notifier.send(&text).await?;
            println!("digest sent");
        }
        None => println!("no articles in the last 24h; digest skipped"),
    }
    Ok(())
}
