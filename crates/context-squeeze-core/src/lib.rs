//! # Context Squeeze Core
//!
//! Shared, WASM-safe logic for context-squeeze: Markdown block parsing,
//! structure-aware chunking, token counting, reduction planning and policy,
//! the cache abstraction, and stitching.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Model calls
//! and persistent caching live in the application crate.

pub mod blocks;
pub mod cache;
pub mod chunk;
pub mod error;
pub mod models;
pub mod plan;
pub mod policy;
pub mod stitch;
pub mod tokens;

pub use error::{Result, SqueezeError};
