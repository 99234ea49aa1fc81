//! tradegate - MCP gateway for a trading platform's tool surface.
//!
//! Exposes a session-oriented, bidirectional JSON-RPC protocol server over
//! one-shot HTTP invocations, protected by a tiered rate limiter with
//! escalating blocking windows.
//!
//! # Layers
//!
//! - **Session transport** (`transport`): correlates a batch of JSON-RPC
//!   messages delivered in one HTTP invocation with responses the protocol
//!   server produces asynchronously.
//! - **Protocol gateway** (`gateway`): header/body validation, message
//!   decoding, response assembly.
//! - **Rate limiting** (`ratelimit`): per-`(identity, tool)` quotas keyed by
//!   operation risk tier, with fail-open storage semantics.

pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;
pub mod transport;
