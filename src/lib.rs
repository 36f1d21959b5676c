//! # Session RAG
//!
//! Local-first retrieval over AI pair-programming session transcripts.
//!
//! Transcripts are parsed into user/assistant turns, each complete turn
//! becomes one knowledge chunk, chunks are embedded into a Qdrant
//! collection, and an optional LLM pass adds a summary, topic and tags.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ Watcher /    │──▶│ ScanScheduler│──▶│ ChunkIndexer  │──▶│ Qdrant +     │
//! │ full scan    │   │ mtime + hash │   │ parse→extract │   │ SQLite       │
//! └──────────────┘   └──────────────┘   │ →embed→upsert │   └──────┬───────┘
//!                                       └───────┬───────┘          │
//!                                               ▼                  ▼
//!                                      ┌────────────────┐   ┌──────────────┐
//!                                      │ Enrichment     │   │ SearchService│
//!                                      │ queue + workers│   │ (read path)  │
//!                                      └────────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! srag init                     # create database
//! srag qdrant install           # fetch the vector store binary
//! srag scan                     # index every transcript
//! srag search "retry backoff"
//! srag watch                    # keep indexing as sessions change
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`error`] | Lifecycle error types |
//! | [`models`] | Core data types |
//! | [`transcript`] | Transcript parser |
//! | [`pairing`] | Message → turn pairing |
//! | [`extract`] | Per-turn content extraction |
//! | [`session`] | Session text provider and project directory |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Turn summarizer |
//! | [`vector`] | Vector store trait, Qdrant client and lifecycle |
//! | [`repository`] | Chunk, index status and queue persistence |
//! | [`indexer`] | Chunk indexer |
//! | [`enrichment`] | Enrichment workers |
//! | [`scanner`] | Scan scheduler |
//! | [`watcher`] | Transcript file watcher |
//! | [`search`] | Search service |
//! | [`progress`] | Scan progress reporting |
//! | [`cancel`] | Cooperative cancellation handles |
//! | [`stats`] | Index statistics (`srag stats`) |
//! | [`get`] | Chunk drill-down (`srag get`) |
//! | [`runtime`] | Service wiring |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cancel;
pub mod config;
pub mod db;
pub mod embedding;
pub mod enrichment;
pub mod error;
pub mod extract;
pub mod get;
pub mod indexer;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pairing;
pub mod progress;
pub mod repository;
pub mod runtime;
pub mod scanner;
pub mod search;
pub mod session;
pub mod stats;
pub mod transcript;
pub mod vector;
pub mod watcher;
