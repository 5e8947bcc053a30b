//! NewsAPI client.
//!
//! Fetches `/v2/everything` for each configured query and
//! `/v2/top-headlines` for each configured category, normalizing the
//! results into [`NewArticle`]s. Requires `NEWSAPI_KEY` in the environment.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::config::{env_secret, NewsApiConfig};
use crate::models::NewArticle;

#[derive(Debug, Deserialize)]
struct NewsApiResponse {
    status: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    articles: Vec<NewsApiArticle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewsApiArticle {
    #[serde(default)]
    source: Option<NewsApiSource>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewsApiSource {
    #[serde(default)]
    name: Option<String>,
}

pub struct NewsApiClient {
    client: Client,
    base_url: String,
    api_key: String,
    language: String,
    page_size: u32,
}

impl NewsApiClient {
    pub fn new(config: &NewsApiConfig) -> Result<Self> {
        let api_key = env_secret("NEWSAPI_KEY")
            .ok_or_else(|| anyhow!("NEWSAPI_KEY environment variable not set"))?;
        Self::with_key(config, api_key)
    }

    pub fn with_key(config: &NewsApiConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("newsdesk/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key,
            language: config.language.clone(),
            page_size: config.page_size,
        })
    }

    /// Full-text search across all sources.
    pub async fn everything(&self, query: &str) -> Result<Vec<NewArticle>> {
        let page_size = self.page_size.to_string();
        let params = [
            ("q", query),
            ("language", self.language.as_str()),
            ("sortBy", "publishedAt"),
            ("pageSize", page_size.as_str()),
        ];
        self.fetch("/v2/everything", &params).await
    }

    /// Current headlines for one category.
    pub async fn top_headlines(&self, category: &str) -> Result<Vec<NewArticle>> {
        let page_size = self.page_size.to_string();
        let params = [
            ("category", category),
            ("language", self.language.as_str()),
            ("pageSize", page_size.as_str()),
        ];
        self.fetch("/v2/top-headlines", &params).await
    }

    async fn fetch(&self, path: &str, params: &[(&str, &str)]) -> Result<Vec<NewArticle>> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("X-Api-Key", &self.api_key)
            .query(params)
            .send()
            .await
            .with_context(|| format!("NewsAPI request to {} failed", path))?;

        let status = response.status();
        let body = response.text().await?;

        let parsed: NewsApiResponse = serde_json::from_str(&body)
            .with_context(|| format!("NewsAPI returned unparseable body (HTTP {})", status))?;

        if !status.is_success() || parsed.status != "ok" {
            bail!(
                "NewsAPI error {}: {} ({})",
                status,
                parsed.message.unwrap_or_default(),
                parsed.code.unwrap_or_else(|| "unknown".to_string())
            );
        }

        Ok(normalize(parsed.articles))
    }
}

fn normalize(articles: Vec<NewsApiArticle>) -> Vec<NewArticle> {
    articles
        .into_iter()
        .filter_map(|a| {
            let title = a.title.map(|t| t.trim().to_string())?;
            // NewsAPI marks pulled articles with this placeholder
            if title.is_empty() || title == "[Removed]" {
                return None;
            }
            let url = a.url.map(|u| u.trim().to_string())?;
            if url.is_empty() {
                return None;
            }

            let published_at = a
                .published_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            Some(NewArticle {
                title,
                description: a
                    .description
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty()),
                url,
                source: a
                    .source
                    .and_then(|s| s.name)
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "unknown".to_string()),
                published_at,
            })
        })
        .collect()
}
