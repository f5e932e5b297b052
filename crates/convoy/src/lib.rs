//! Convoy - conversation batching and delivery pipeline for chat bots.

// ============================================================================
// Pipeline
// ============================================================================

pub mod batch;
pub mod dedup;
pub mod dispatch;
pub mod ingest;
pub mod queue;
pub mod trigger;

// ============================================================================
// Connection
// ============================================================================

pub mod identity;
pub mod supervisor;
pub mod transport;

// ============================================================================
// Runtime
// ============================================================================

pub mod config;

#[cfg(test)]
mod test_support;

pub use batch::{BatchEngine, BatchSettings};
pub use config::Config;
pub use supervisor::{ConnectionState, ConnectionSupervisor};
