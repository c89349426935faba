//! Strata Engine -- tick driver for the Strata entity manager.
//!
//! This crate builds on [`strata_ecs`] to provide the simulation driver: a
//! fixed-timestep tick loop that runs processors inside a processing scope,
//! flushes their deferred structural changes once per tick, and spends a
//! bounded time budget compacting archetype storage. It also owns engine
//! configuration loading and logging setup.
//!
//! # Quick Start
//!
//! ```
//! use strata_engine::prelude::*;
//!
//! let config = EngineConfig::from_json_str(r#"{ "compaction_budget_us": 100 }"#).unwrap();
//! let mut tick_loop = TickLoop::from_config(config).unwrap();
//!
//! tick_loop.add_processor("example", |_manager| {
//!     // game logic here
//! });
//!
//! tick_loop.run_ticks(100);
//! assert_eq!(tick_loop.tick_count(), 100);
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod logging;
pub mod tick;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the ECS crate for convenience.
pub use strata_ecs;

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use strata_ecs::prelude::*;

    pub use crate::config::{EngineConfig, TickConfig};
    pub use crate::logging::init_tracing;
    pub use crate::tick::{ProcessorFn, TickDiagnostics, TickLoop};
}
