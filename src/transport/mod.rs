//! Streamable HTTP + SSE transport, wire-compatible with spec.md §4.7/§6.

pub mod auth;
pub mod jsonrpc;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod sse;

pub use server::{routes, AppState};
