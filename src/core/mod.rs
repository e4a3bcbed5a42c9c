//! Blackboard core
//!
//! Provides the fundamental building blocks of the stigmergic coordination
//! substrate:
//! - `decay`: pure intensity-over-time function
//! - `pheromone`: identity-addressed store and tag filtering
//! - `condition`: the scent-condition tree language and evaluator
//! - `scent`: registered triggers
//! - `blackboard`: the orchestrator owning store/scents/history/handlers
//! - `evaluator`: the periodic background evaluation loop
//! - `config`: tuning parameters
//! - `error`: the core's error type, mapped to JSON-RPC codes at the edge

pub mod blackboard;
pub mod condition;
pub mod config;
pub mod decay;
pub mod error;
pub mod evaluator;
pub mod pheromone;
pub mod scent;

pub use blackboard::Blackboard;
pub use config::Config;
pub use error::BlackboardError;
pub use pheromone::Pheromone;
