//! LLM orchestration workflow for semantic-change experiments.
//!
//! | Module        | Role                                                        |
//! |---------------|-------------------------------------------------------------|
//! | `models`      | Run, stage, strategy, review and ledger types               |
//! | `db`          | SQLite run store, checkpoints, ledger and provenance tables |
//! | `provenance`  | PROV-O descriptors, recorder, read models and PROV-JSON     |
//! | `documents`   | `DocumentStore` seam over experiments and documents         |
//! | `llm`         | `LlmClient` seam, Anthropic client and scripted client      |
//! | `tools`       | Built-in processing tools behind `ToolRunner`               |
//! | `stages`      | Analyze, Recommend, Review, Execute and Synthesize          |
//! | `graph`       | State machine that drives a run from durable state          |
//! | `coordinator` | Background drivers, per-run guards, resume and recovery     |
//! | `api`         | Axum routes for experiments, runs, reviews and provenance   |
//! | `server`      | Server wiring and graceful shutdown                         |

pub mod api;
pub mod coordinator;
pub mod db;
pub mod documents;
pub mod graph;
pub mod llm;
pub mod models;
pub mod provenance;
pub mod server;
pub mod stages;
pub mod tools;
