//! # oopsnote
//!
//! Mistake-notebook backend: turns a photo of handwritten exercises into structured
//! problems, worked solutions and diagnostic tags.
//!
//! ## Pipeline
//!
//! ```text
//!   image ──▶ Extractor ──▶ Solver ──▶ Tagger ──▶ task record
//!               (OCR)        (per problem, sequential)
//!                  │            │          │
//!                  └──── streamed model output ────▶ SSE subscribers
//! ```
//!
//! ## Modules
//! - `task`: Task, problem, solution and tagging records plus the status machine
//! - `llm`: Model clients behind the `ModelPort` trait and per-stage routing
//! - `pipeline`: Prompts, JSON recovery, stage runner and the orchestrator
//! - `stream`: Per-task event broker with coalesced, persisted model output
//! - `store`: Task, trace and stream persistence (memory, file, sqlite)
//! - `tags`: Shared tag registry
//! - `service`: Task lifecycle operations used by the HTTP layer
//! - `api`: axum routes

pub mod api;
pub mod config;
pub mod llm;
pub mod pipeline;
pub mod service;
pub mod store;
pub mod stream;
pub mod tags;
pub mod task;
pub mod util;

pub use config::Config;
