//! # Newsdesk
//!
//! Backend for a geopolitical news desk: ingests headlines from NewsAPI,
//! tags them with sentiment and category, embeds them for retrieval, and
//! answers questions about the news over a streaming chat API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────────┐   ┌───────────┐
//! │ NewsAPI  │──▶│ Ingest          │──▶│  SQLite   │
//! │          │   │ Tag + Embed     │   │ FTS5+Vec  │
//! └──────────┘   └─────────────────┘   └─────┬─────┘
//!                                            │
//!                      ┌─────────────────────┤
//!                      ▼                     ▼
//!                ┌───────────┐        ┌─────────────┐
//!                │    CLI    │        │ HTTP + SSE  │
//!                │(newsdesk) │        │ REST / chat │
//!                └───────────┘        └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! newsdesk init                     # create database
//! newsdesk ingest                   # fetch headlines
//! newsdesk tag                      # sentiment + category
//! newsdesk embed pending            # generate embeddings
//! newsdesk search "ceasefire" --mode hybrid
//! newsdesk serve                    # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`newsapi`] | NewsAPI client |
//! | [`ingest`] | Deduplicating article ingestion |
//! | [`tagging`] | LLM sentiment and category tagging |
//! | [`embedding`] | Embedding providers with fallback |
//! | [`search`] | Keyword, semantic, and hybrid retrieval |
//! | [`llm`] | Chat completion providers |
//! | [`chat`] | Conversations and RAG turns |
//! | [`feed`] | Personalized feed |
//! | [`server`] | REST and SSE server |
//! | [`backup`] | Snapshots, rotation, restore |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod backup;
pub mod chat;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod feed;
pub mod health;
pub mod ingest;
pub mod llm;
pub mod load;
pub mod migrate;
pub mod models;
pub mod newsapi;
pub mod notify;
pub mod retention;
pub mod search;
pub mod server;
pub mod stats;
pub mod tagging;
