//! # Healthcare Assistant
//!
//! A document question-answering backend. Users register, upload PDFs, and
//! ask questions that are answered by a generative model grounded only in
//! their own documents. Every exchange is kept as chat history.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌───────────────┐
//! │  Upload  │──▶│ Extract + Chunk  │──▶│    SQLite     │
//! │  (PDF)   │   │     + Embed      │   │ docs + vecs   │
//! └──────────┘   └──────────────────┘   └──────┬────────┘
//!                                              │
//!                     ┌────────────────────────┤
//!                     ▼                        ▼
//!               ┌───────────┐           ┌─────────────┐
//!               │ Retrieve  │──────────▶│  Generate   │──▶ history
//!               │ (cosine)  │           │  (Gemini)   │
//!               └───────────┘           └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! hca init                                   # create database
//! hca serve                                  # start HTTP API
//! hca ingest leaflet.pdf --user alice        # ingest from the CLI
//! hca ask "What is the max dose?" --user alice
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Shared error type |
//! | [`models`] | Core data types |
//! | [`auth`] | Password hashing, accounts and bearer tokens |
//! | [`extract`] | PDF text extraction |
//! | [`chunk`] | Sentence-boundary chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`ingest`] | Upload → chunks → vectors pipeline |
//! | [`retrieve`] | Per-user semantic search |
//! | [`generate`] | Grounded answer generation |
//! | [`history`] | Chat history store |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod auth;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generate;
pub mod history;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod retrieve;
pub mod server;
