//! Fixed-timestep tick loop.
//!
//! The [`TickLoop`] drives an [`EntityManager`] forward. Each tick:
//!
//! 1. A processing scope is opened and every registered processor runs in
//!    registration order. Structural changes they make (directly or from
//!    query callbacks) are queued, not applied.
//! 2. The scope closes, flushing the queued commands in FIFO order.
//! 3. Archetype compaction runs for at most the configured budget, resuming
//!    where the previous tick stopped.
//! 4. Diagnostics are recorded and the tick counter advances.
//!
//! Processors see a stable entity layout for the whole tick: nothing moves
//! between archetypes until every processor has run.
//!
//! # Example
//!
//! ```
//! use strata_engine::prelude::*;
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Age(u32);
//!
//! let mut tick_loop = TickLoop::from_config(EngineConfig::default()).unwrap();
//! let age = tick_loop.manager_mut().register_fragment::<Age>("age");
//! let archetype = tick_loop.manager_mut().create_archetype_from_types(&[age]);
//! tick_loop.manager_mut().batch_create_entities(archetype, 10);
//!
//! let mut query = EntityQuery::new();
//! query.add_requirement::<Age>(tick_loop.manager().registry(), AccessMode::ReadWrite, Presence::All);
//! tick_loop.add_query_processor("aging", query, |ctx| {
//!     for a in ctx.fragment_view_mut::<Age>() {
//!         a.0 += 1;
//!     }
//! });
//!
//! tick_loop.run_ticks(3);
//! assert_eq!(tick_loop.tick_count(), 3);
//! ```

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use strata_ecs::archetype::CompactionReport;
use strata_ecs::command::ApplyReport;
use strata_ecs::execution::ExecutionContext;
use strata_ecs::manager::EntityManager;
use strata_ecs::query::EntityQuery;

use crate::config::{EngineConfig, TickConfig};

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Timing and outcome of the last tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// Wall-clock time per processor, in execution order.
    pub processor_times: Vec<(String, Duration)>,
    /// Time spent applying deferred commands.
    pub flush_time: Duration,
    pub compaction_time: Duration,
    /// Total time for the tick.
    pub total_time: Duration,
    pub apply_report: ApplyReport,
    pub compaction: CompactionReport,
}

// ---------------------------------------------------------------------------
// Processors
// ---------------------------------------------------------------------------

/// A processor runs once per tick with the manager inside a processing scope.
pub type ProcessorFn = Box<dyn FnMut(&mut EntityManager) + Send>;

struct RegisteredProcessor {
    name: String,
    func: ProcessorFn,
    /// Names of processors that must run before this one.
    after: Vec<String>,
}

// ---------------------------------------------------------------------------
// TickLoop
// ---------------------------------------------------------------------------

pub struct TickLoop {
    manager: EntityManager,
    processors: Vec<RegisteredProcessor>,
    tick_counter: u64,
    config: EngineConfig,
    last_diagnostics: TickDiagnostics,
}

impl TickLoop {
    /// Create a tick loop around an existing manager.
    ///
    /// # Panics
    ///
    /// Panics if `config.tick.fixed_dt` is not positive and finite.
    pub fn new(manager: EntityManager, config: EngineConfig) -> Self {
        assert!(
            config.tick.fixed_dt > 0.0 && config.tick.fixed_dt.is_finite(),
            "fixed_dt must be positive and finite, got {}",
            config.tick.fixed_dt
        );
        Self {
            manager,
            processors: Vec::new(),
            tick_counter: 0,
            config,
            last_diagnostics: TickDiagnostics::default(),
        }
    }

    /// Validate `config` and create a fresh manager from its `ecs` section.
    pub fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let manager = EntityManager::with_config(config.ecs.clone())?;
        Ok(Self::new(manager, config))
    }

    /// Register a processor to run each tick, after all processors
    /// registered before it.
    ///
    /// # Panics
    ///
    /// Panics if a processor with the same name is already registered.
    pub fn add_processor<F>(&mut self, name: &str, func: F)
    where
        F: FnMut(&mut EntityManager) + Send + 'static,
    {
        self.add_processor_after(name, &[], func);
    }

    /// Register a processor that must run after the named ones.
    ///
    /// # Panics
    ///
    /// - If any processor in `after` is not already registered.
    /// - If a processor with this name already exists.
    pub fn add_processor_after<F>(&mut self, name: &str, after: &[&str], func: F)
    where
        F: FnMut(&mut EntityManager) + Send + 'static,
    {
        for dep in after {
            assert!(
                self.processors.iter().any(|p| p.name == *dep),
                "processor '{name}' declares dependency on '{dep}', but '{dep}' is not registered"
            );
        }
        assert!(
            !self.processors.iter().any(|p| p.name == name),
            "duplicate processor name: {name:?}"
        );
        self.processors.push(RegisteredProcessor {
            name: name.to_owned(),
            func: Box::new(func),
            after: after.iter().map(|s| s.to_string()).collect(),
        });
    }

    /// Register a processor that runs `callback` over every chunk matching
    /// `query`, in parallel when the manager allows it.
    pub fn add_query_processor<F>(&mut self, name: &str, mut query: EntityQuery, callback: F)
    where
        F: Fn(&ExecutionContext) + Send + Sync + 'static,
    {
        let mut ctx = ExecutionContext::new();
        self.add_processor(name, move |manager| {
            query.parallel_for_each_entity_chunk(manager, &mut ctx, &callback);
        });
    }

    /// Execute one tick and return the report of the command flush.
    pub fn tick(&mut self) -> ApplyReport {
        let tick_start = Instant::now();
        let mut processor_times = Vec::with_capacity(self.processors.len());

        // Phase 1: processors, with structural changes deferred.
        let mut scope = self.manager.processing_scope();
        for processor in &mut self.processors {
            let start = Instant::now();
            (processor.func)(&mut *scope);
            processor_times.push((processor.name.clone(), start.elapsed()));
        }

        // Phase 2: closing the scope flushes.
        let flush_start = Instant::now();
        drop(scope);
        let flush_time = flush_start.elapsed();
        let apply_report = *self.manager.last_apply_report();
        if apply_report.failed_count > 0 {
            warn!(
                tick = self.tick_counter,
                failed = apply_report.failed_count,
                "deferred commands failed during flush"
            );
        }

        // Phase 3: compaction within budget.
        let compaction_start = Instant::now();
        let budget = self.config.compaction_budget();
        let compaction = if budget.is_zero() {
            CompactionReport::default()
        } else {
            self.manager.compact_entities(budget)
        };
        let compaction_time = compaction_start.elapsed();

        self.tick_counter += 1;
        self.last_diagnostics = TickDiagnostics {
            processor_times,
            flush_time,
            compaction_time,
            total_time: tick_start.elapsed(),
            apply_report,
            compaction,
        };
        debug!(
            tick = self.tick_counter,
            applied = apply_report.success_count,
            moved = compaction.entities_moved,
            "tick complete"
        );
        apply_report
    }

    /// Run up to `count` ticks, capped by `max_ticks_per_run` when that is
    /// non-zero. Returns the number of ticks executed.
    pub fn run_ticks(&mut self, count: u64) -> u64 {
        let limit = match self.config.tick.max_ticks_per_run {
            0 => count,
            max => count.min(max),
        };
        for _ in 0..limit {
            self.tick();
        }
        limit
    }

    // -- accessors ----------------------------------------------------------

    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// Computed as `tick_count * fixed_dt` to avoid drift from repeated
    /// addition.
    pub fn sim_time(&self) -> f64 {
        self.tick_counter as f64 * self.config.tick.fixed_dt
    }

    pub fn fixed_dt(&self) -> f64 {
        self.config.tick.fixed_dt
    }

    pub fn tick_config(&self) -> &TickConfig {
        &self.config.tick
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &EntityManager {
        &self.manager
    }

    /// Direct access for setup and tests; changes apply immediately.
    pub fn manager_mut(&mut self) -> &mut EntityManager {
        &mut self.manager
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// Processor names in execution order.
    pub fn processor_names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name.as_str()).collect()
    }

    /// Names `processor` was declared to run after, if it exists.
    pub fn processor_dependencies(&self, processor: &str) -> Option<&[String]> {
        self.processors
            .iter()
            .find(|p| p.name == processor)
            .map(|p| p.after.as_slice())
    }

    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
