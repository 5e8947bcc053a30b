//! Chat-completion providers.
//!
//! OpenAI, OpenRouter and Perplexity all speak the OpenAI
//! `POST /chat/completions` dialect, so one client covers them; they differ
//! only in base URL and API key variable. Providers are tried in configured
//! order: a provider that fails to accept the request (network error or
//! non-2xx status) hands over to the next one. Once a stream has produced
//! its first delta there is no fallback.
//!
//! `timeout_secs` bounds the wait for response headers and every read of a
//! streamed body, not the whole answer. A stream that closes without `[DONE]`
//! or a `finish_reason` is an error, never a complete answer.

mod stream;

pub use stream::{SseDecoder, StreamEvent};

use anyhow::{anyhow, bail, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{env_secret, LlmConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    OpenRouter,
    Perplexity,
}

impl ProviderKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "openai" => Some(ProviderKind::OpenAi),
            "openrouter" => Some(ProviderKind::OpenRouter),
            "perplexity" => Some(ProviderKind::Perplexity),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Perplexity => "perplexity",
        }
    }

    fn default_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::Perplexity => "https://api.perplexity.ai",
        }
    }

    fn key_var(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::OpenRouter => "OPENROUTER_API_KEY",
            ProviderKind::Perplexity => "PERPLEXITY_API_KEY",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Provider {
    pub kind: ProviderKind,
    pub model: String,
    base_url: String,
    api_key: String,
}

impl Provider {
    pub fn new(kind: ProviderKind, model: impl Into<String>, base_url: Option<&str>, api_key: String) -> Self {
        Self {
            kind,
            model: model.into(),
            base_url: base_url
                .unwrap_or(kind.default_url())
                .trim_end_matches('/')
                .to_string(),
            api_key,
        }
    }
}

/// A completed, non-streamed answer.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub provider: String,
    pub model: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

pub struct LlmClient {
    client: Client,
    providers: Vec<Provider>,
    timeout: Duration,
    temperature: f32,
    max_tokens: u32,
}

impl LlmClient {
    /// Builds the provider chain; providers without an API key are skipped.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut providers = Vec::new();
        for p in &config.providers {
            let kind = ProviderKind::parse(&p.provider)
                .ok_or_else(|| anyhow!("Unknown LLM provider: {}", p.provider))?;
            match env_secret(kind.key_var()) {
                Some(key) => providers.push(Provider::new(kind, &p.model, p.url.as_deref(), key)),
                None => tracing::warn!(
                    provider = kind.name(),
                    "{} not set; provider skipped",
                    kind.key_var()
                ),
            }
        }
        if providers.is_empty() {
            bail!("No LLM provider has an API key configured");
        }
        Self::new(providers, config.timeout_secs, config.temperature, config.max_tokens)
    }

    pub fn new(providers: Vec<Provider>, timeout_secs: u64, temperature: f32, max_tokens: u32) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            providers,
            timeout: Duration::from_secs(timeout_secs),
            temperature,
            max_tokens,
        })
    }

    /// Replaces the model of the first provider (tagging uses a cheaper one).
    pub fn with_primary_model(mut self, model: Option<&str>) -> Self {
        if let (Some(model), Some(first)) = (model, self.providers.first_mut()) {
            first.model = model.to_string();
        }
        self
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion> {
        let mut last_err = None;

        for provider in &self.providers {
            match self.send(provider, messages, false).await {
                Ok(response) => {
                    let parsed: CompletionResponse = tokio::time::timeout(self.timeout, response.json::<CompletionResponse>())
                        .await
                        .map_err(|_| anyhow!("{} response body timed out", provider.kind.name()))??;
                    let content = parsed
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| anyhow!("{} returned no choices", provider.kind.name()))?;
                    return Ok(Completion {
                        content,
                        provider: provider.kind.name().to_string(),
                        model: provider.model.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!(provider = provider.kind.name(), error = %e, "completion failed, trying next provider");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("No LLM providers configured")))
    }

    /// Opens a streamed completion on the first provider that accepts it.
    pub async fn open_stream(&self, messages: &[ChatMessage]) -> Result<CompletionStream> {
        let mut last_err = None;

        for provider in &self.providers {
            match self.send(provider, messages, true).await {
                Ok(response) => {
                    tracing::debug!(provider = provider.kind.name(), model = %provider.model, "stream opened");
                    return Ok(CompletionStream {
                        response,
                        decoder: SseDecoder::default(),
                        pending: Vec::new(),
                        finished: false,
                        read_timeout: self.timeout,
                        provider: provider.kind.name().to_string(),
                        model: provider.model.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!(provider = provider.kind.name(), error = %e, "stream failed to open, trying next provider");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("No LLM providers configured")))
    }

    async fn send(&self, provider: &Provider, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response> {
        let body = CompletionRequest {
            model: &provider.model,
            messages,
            stream,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let request = self
            .client
            .post(format!("{}/chat/completions", provider.base_url))
            .header("Authorization", format!("Bearer {}", provider.api_key))
            .json(&body)
            .send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| {
                anyhow!(
                    "{} did not respond within {}s",
                    provider.kind.name(),
                    self.timeout.as_secs()
                )
            })??;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("{} API error {}: {}", provider.kind.name(), status, text);
        }

        Ok(response)
    }
}

/// An upstream completion being relayed delta by delta.
pub struct CompletionStream {
    response: reqwest::Response,
    decoder: SseDecoder,
    pending: Vec<String>,
    finished: bool,
    read_timeout: Duration,
    pub provider: String,
    pub model: String,
}

impl CompletionStream {
    /// Next text delta, or `None` once the upstream signalled completion.
    ///
    /// Fails when the connection closes before a terminal marker or no bytes
    /// arrive within the read timeout.
    pub async fn next_delta(&mut self) -> Result<Option<String>> {
        loop {
            if !self.pending.is_empty() {
                return Ok(Some(self.pending.remove(0)));
            }
            if self.finished {
                return Ok(None);
            }

            let chunk = tokio::time::timeout(self.read_timeout, self.response.chunk())
                .await
                .map_err(|_| {
                    anyhow!(
                        "{} sent nothing for {}s",
                        self.provider,
                        self.read_timeout.as_secs()
                    )
                })??;

            match chunk {
                Some(bytes) => {
                    for event in self.decoder.push(&bytes) {
                        match event {
                            StreamEvent::Delta(text) => self.pending.push(text),
                            StreamEvent::Done => self.finished = true,
                        }
                    }
                }
                None => {
                    let mut done = false;
                    for event in self.decoder.finish() {
                        match event {
                            StreamEvent::Delta(text) => self.pending.push(text),
                            StreamEvent::Done => done = true,
                        }
                    }
                    if !done {
                        bail!("{} closed the stream before completion", self.provider);
                    }
                    self.finished = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(kind: ProviderKind, server: &MockServer, prefix: &str) -> Provider {
        Provider::new(
            kind,
            "test-model",
            Some(&format!("{}{}", server.uri(), prefix)),
            "sk-test".to_string(),
        )
    }

    #[tokio::test]
    async fn test_complete_falls_back_to_next_provider() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/primary/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/secondary/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "fallback answer"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::new(
            vec![
                provider(ProviderKind::OpenAi, &server, "/primary"),
                provider(ProviderKind::OpenRouter, &server, "/secondary"),
            ],
            10,
            0.0,
            100,
        )
        .unwrap();

        let completion = client.complete(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(completion.content, "fallback answer");
        assert_eq!(completion.provider, "openrouter");
    }

    #[tokio::test]
    async fn test_complete_reports_last_error_when_all_fail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let client = LlmClient::new(vec![provider(ProviderKind::Perplexity, &server, "")], 10, 0.0, 100).unwrap();
        let err = client.complete(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(err.to_string().contains("perplexity API error 401"));
    }

    #[tokio::test]
    async fn test_stream_yields_deltas_in_order() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let client = LlmClient::new(vec![provider(ProviderKind::OpenAi, &server, "")], 10, 0.0, 100).unwrap();
        let mut stream = client.open_stream(&[ChatMessage::user("hi")]).await.unwrap();
        let mut out = Vec::new();
        while let Some(delta) = stream.next_delta().await.unwrap() {
            out.push(delta);
        }
        assert_eq!(out, vec!["Hel".to_string(), "lo".to_string()]);
        assert_eq!(stream.provider, "openai");
    }

    #[tokio::test]
    async fn test_stream_without_terminal_marker_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Talks \"},\"finish_reason\":null}]}\n\n",
            ))
            .mount(&server)
            .await;

        let client = LlmClient::new(vec![provider(ProviderKind::OpenAi, &server, "")], 10, 0.0, 100).unwrap();
        let mut stream = client.open_stream(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(stream.next_delta().await.unwrap().as_deref(), Some("Talks "));
        let err = stream.next_delta().await.unwrap_err();
        assert!(err.to_string().contains("before completion"));
    }

    #[tokio::test]
    async fn test_open_stream_times_out_waiting_for_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("data: [DONE]\n\n")
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = LlmClient::new(vec![provider(ProviderKind::OpenAi, &server, "")], 1, 0.0, 100).unwrap();
        let err = client.open_stream(&[ChatMessage::user("hi")]).await.err().unwrap();
        assert!(err.to_string().contains("did not respond within 1s"));
    }

    #[test]
    fn test_with_primary_model_only_touches_first() {
        let a = Provider::new(ProviderKind::OpenAi, "big", None, "k".into());
        let b = Provider::new(ProviderKind::OpenRouter, "other", None, "k".into());
        let client = LlmClient::new(vec![a, b], 10, 0.0, 10)
            .unwrap()
            .with_primary_model(Some("small"));
        assert_eq!(client.providers()[0].model, "small");
        assert_eq!(client.providers()[1].model, "other");
    }
}
