//! Engine configuration, loaded from JSON.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```
//! use strata_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "tick": { "fixed_dt": 0.01 } }"#).unwrap();
//! assert_eq!(config.tick.fixed_dt, 0.01);
//! assert_eq!(config.log_filter, "info");
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};

use strata_ecs::config::EntityManagerConfig;

// ---------------------------------------------------------------------------
// TickConfig
// ---------------------------------------------------------------------------

/// Configuration for the fixed-timestep tick loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Fixed time step in seconds per tick. Must be positive and finite.
    pub fixed_dt: f64,
    /// Upper bound on ticks executed by one [`run_ticks`] call; 0 means no
    /// bound.
    ///
    /// [`run_ticks`]: crate::tick::TickLoop::run_ticks
    pub max_ticks_per_run: u64,
}

impl Default for TickConfig {
    /// Defaults to 60 Hz, unbounded runs.
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            max_ticks_per_run: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick: TickConfig,
    pub ecs: EntityManagerConfig,
    /// Time spent compacting archetypes at the end of each tick, in
    /// microseconds. 0 disables compaction.
    pub compaction_budget_us: u64,
    /// Default `tracing` filter directive; `RUST_LOG` takes precedence.
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick: TickConfig::default(),
            ecs: EntityManagerConfig::default(),
            compaction_budget_us: 200,
            log_filter: "info".to_owned(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("failed to parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config '{}'", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("invalid engine config '{}'", path.display()))
    }

    /// Reject values the tick loop or entity manager cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.tick.fixed_dt > 0.0 && self.tick.fixed_dt.is_finite(),
            "fixed_dt must be positive and finite, got {}",
            self.tick.fixed_dt
        );
        self.ecs.validate()?;
        Ok(())
    }

    pub fn compaction_budget(&self) -> Duration {
        Duration::from_micros(self.compaction_budget_us)
    }
}
