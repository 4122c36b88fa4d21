//! # Context Squeeze
//!
//! Bounded-reduction compression for long Markdown prompts.
//!
//! Given a document, the author's intent and a target reduction, the
//! pipeline shortens the least relevant parts of the document until it fits,
//! leaving code fences and headings intact and the most relevant sections
//! untouched for as long as anything else can give.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌─────────┐   ┌──────────┐   ┌──────────┐
//! │  Split   │──▶│  Rate   │──▶│  Plan   │──▶│  Reduce  │──▶│  Stitch  │
//! │ (blocks) │   │ (model) │   │ (target)│   │ (model)  │   │ (+stats) │
//! └──────────┘   └────┬────┘   └─────────┘   └────┬─────┘   └──────────┘
//!                     │                           │
//!                     └─────────┐   ┌─────────────┘
//!                               ▼   ▼
//!                           ┌──────────┐
//!                           │  SQLite  │
//!                           │  cache   │
//!                           └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn run() -> anyhow::Result<()> {
//! use context_squeeze::config::load_config;
//! use context_squeeze::engine::CancelHandle;
//! use context_squeeze::pipeline::Compressor;
//!
//! let config = load_config(std::path::Path::new("squeeze.toml"))?;
//! let compressor = Compressor::from_config(&config).await?;
//! let document = std::fs::read_to_string("prompt.md")?;
//! let output = compressor
//!     .compress(&document, "keep the API contract", 0.3, &CancelHandle::new())
//!     .await?;
//! println!("{}", output.stats);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, presets, validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Cache schema |
//! | [`sqlite_cache`] | SQLite-backed cache store and maintenance |
//! | [`llm`] | Language-model provider abstraction |
//! | [`rater`] | Concurrent relevance rating |
//! | [`engine`] | The compression loop and cancellation |
//! | [`pipeline`] | End-to-end [`Compressor`](pipeline::Compressor) |
//! | [`logging`] | Tracing subscriber setup |

pub mod config;
pub mod db;
pub mod engine;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod rater;
pub mod sqlite_cache;
