//! Stigmergic blackboard: a coordination substrate where agents communicate
//! indirectly through time-decaying "pheromone" signals rather than direct
//! messages. See `core` for the engine and `transport` for the JSON-RPC
//! over Streamable HTTP + SSE wire protocol.

pub mod core;
pub mod transport;
