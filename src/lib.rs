//! # daydream
//!
//! Review-and-fix orchestrator for AI coding agents (Claude Code & Codex).
//!
//! This library provides:
//! - A backend-neutral event model and the `Backend` trait
//! - A Claude Code session backend and a Codex NDJSON subprocess backend
//! - An agent runner that drives one turn and tracks in-flight backends
//! - A phase orchestrator: review, parse feedback, fix in parallel, test
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │          Orchestrator            │
//!        │ (review → parse → fix → test)    │
//!        └────────────────┬─────────────────┘
//!                         │
//!                         ▼
//!                ┌─────────────────┐
//!                │   AgentRunner   │──── ActiveBackends (cancel_all)
//!                └────────┬────────┘
//!                         │ AgentEvent stream
//!              ┌──────────┴──────────┐
//!              ▼                     ▼
//!      ┌───────────────┐     ┌───────────────┐
//!      │ ClaudeBackend │     │ CodexBackend  │
//!      │ (session)     │     │ (codex exec)  │
//!      └───────────────┘     └───────────────┘
//! ```
//!
//! ## Modules
//! - `backend`: event model, backend trait, Claude and Codex backends, registry
//! - `runner`: single-turn driver and active-backend tracking
//! - `orchestrator`: phases, feedback extraction, test verdicts, run reports
//! - `config`: environment configuration

pub mod backend;
pub mod config;
pub mod orchestrator;
pub mod runner;

pub use backend::events::{AgentEvent, ContinuationToken};
pub use backend::registry::{BackendProvider, BackendRegistry};
pub use backend::{Backend, BackendError, BackendKind};
pub use config::Config;
pub use orchestrator::{Orchestrator, RunOutcome, RunReport};
pub use runner::{ActiveBackends, AgentRunner, RunnerError};
