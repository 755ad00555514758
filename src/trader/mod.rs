// =============================================================================
// Trader subsystem — per-trader control loop and its collaborators
// =============================================================================

pub mod context;
pub mod engine;
pub mod executor;
pub mod monitor;

pub use context::{ContextBuilder, CycleContext};
pub use engine::{TraderEngine, TraderState};
pub use executor::ExecutionSequencer;
pub use monitor::DrawdownMonitor;
