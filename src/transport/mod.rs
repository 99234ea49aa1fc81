//! JSON-RPC transport layer.
//!
//! Handles JSON-RPC 2.0 message parsing and the per-invocation session
//! transport that correlates batched requests with asynchronously produced
//! responses.
//!
//! # Traffic Flow
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────────────────────┐     ┌──────────────────┐
//! │  MCP Host   │────▶│           tradegate             │────▶│ Protocol Server  │
//! │  (Agent)    │◀────│   [HTTP ⇄ session transport]    │◀────│ (trading tools)  │
//! └─────────────┘     └─────────────────────────────────┘     └──────────────────┘
//! ```

pub mod jsonrpc;
pub mod session;

pub use jsonrpc::{parse_body, JsonRpcId, JsonRpcMessage, MessageKind};
pub use session::{BatchOutcome, MessageCallback, ResponseSender, SessionTransport};
