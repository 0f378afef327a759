//! `llmproxy` — a policy-gated reverse proxy for LLM chat-completion
//! backends.
//!
//! The request path runs edge TLS → HTTP dispatch → enrichment → policy
//! decision → routing decision → provider adapter → response, with evidence
//! recording firing asynchronously off the hot path. See [`pipeline`] for the
//! wiring and each submodule for its component.

pub mod config;
pub mod error;
pub mod evidence;
pub mod handlers;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod providers;
pub mod routing;
pub mod tls;
