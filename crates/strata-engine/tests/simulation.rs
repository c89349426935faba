//! End-to-end simulation: 10K entities, several processors, many ticks.
//!
//! Validates that the tick loop produces identical results across runs even
//! with parallel query processors and structural churn every tick, and that
//! storage stays consistent throughout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use strata_engine::prelude::*;

// -- Fragment types ---------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
struct Position {
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Velocity {
    dx: f64,
    dy: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Health(u32);

#[derive(Debug, Clone, Default, PartialEq)]
struct Lifetime(u32);

struct Burning;

// -- World setup ------------------------------------------------------------

const ENTITIES: usize = 10_000;

fn build(config: EngineConfig, seed: u64) -> (TickLoop, Vec<EntityHandle>) {
    let mut tick_loop = TickLoop::from_config(config).unwrap();
    let m = tick_loop.manager_mut();
    let position = m.register_fragment::<Position>("position");
    let velocity = m.register_fragment::<Velocity>("velocity");
    let health = m.register_fragment::<Health>("health");
    let lifetime = m.register_fragment::<Lifetime>("lifetime");
    let burning = m.register_tag::<Burning>("burning");

    let mut rng = Pcg64::seed_from_u64(seed);
    let mut handles = Vec::with_capacity(ENTITIES);
    for _ in 0..ENTITIES {
        let mut types = vec![position, velocity];
        if rng.gen_bool(0.5) {
            types.push(health);
        }
        if rng.gen_bool(0.25) {
            types.push(lifetime);
        }
        let archetype = m.create_archetype_from_types(&types);
        let e = m.create_entity(archetype);
        *m.get_fragment_data_mut::<Velocity>(e).unwrap() = Velocity {
            dx: rng.gen_range(-2.0..2.0),
            dy: rng.gen_range(-2.0..2.0),
        };
        if let Some(h) = m.get_fragment_data_mut::<Health>(e) {
            *h = Health(rng.gen_range(1..20));
        }
        if let Some(l) = m.get_fragment_data_mut::<Lifetime>(e) {
            *l = Lifetime(rng.gen_range(1..30));
        }
        handles.push(e);
    }

    // movement: parallel, no structural changes.
    let mut movement = EntityQuery::new();
    movement
        .add_requirement::<Position>(m.registry(), AccessMode::ReadWrite, Presence::All)
        .add_requirement::<Velocity>(m.registry(), AccessMode::ReadOnly, Presence::All);

    // ignition: health wears down; below 10 an entity starts burning.
    let mut ignition = EntityQuery::new();
    ignition
        .add_requirement::<Health>(m.registry(), AccessMode::ReadWrite, Presence::All)
        .add_tag_requirement::<Burning>(m.registry(), Presence::None);

    // burn: burning entities lose health; dead ones are destroyed.
    let mut burn = EntityQuery::new();
    burn.add_requirement::<Health>(m.registry(), AccessMode::ReadWrite, Presence::All)
        .add_tag_requirement::<Burning>(m.registry(), Presence::All);

    // decay: lifetimes count down, expired entities lose their velocity.
    let mut decay = EntityQuery::new();
    decay
        .add_requirement::<Lifetime>(m.registry(), AccessMode::ReadWrite, Presence::All)
        .add_requirement::<Velocity>(m.registry(), AccessMode::ReadOnly, Presence::Optional);

    tick_loop.add_query_processor("movement", movement, |ctx| {
        let velocities = ctx.fragment_view::<Velocity>();
        for (p, v) in ctx.fragment_view_mut::<Position>().iter_mut().zip(velocities) {
            p.x += v.dx;
            p.y += v.dy;
        }
    });
    tick_loop.add_query_processor("ignition", ignition, move |ctx| {
        for (&e, h) in ctx.entities().iter().zip(ctx.fragment_view_mut::<Health>()) {
            h.0 = h.0.saturating_sub(1);
            if h.0 < 10 {
                ctx.defer().add_tag(e, burning);
            }
        }
    });
    tick_loop.add_query_processor("burn", burn, |ctx| {
        for (&e, h) in ctx.entities().iter().zip(ctx.fragment_view_mut::<Health>()) {
            h.0 = h.0.saturating_sub(3);
            if h.0 == 0 {
                ctx.defer().destroy_entity(e);
            }
        }
    });
    tick_loop.add_query_processor("decay", decay, move |ctx| {
        let moving = ctx.has_fragment::<Velocity>();
        for (&e, l) in ctx.entities().iter().zip(ctx.fragment_view_mut::<Lifetime>()) {
            if l.0 == 0 {
                continue;
            }
            l.0 -= 1;
            if l.0 == 0 && moving {
                ctx.defer().remove_fragment(e, velocity);
            }
        }
    });

    (tick_loop, handles)
}

/// Digest of every surviving entity's state, in handle order.
fn digest(tick_loop: &TickLoop, handles: &[EntityHandle]) -> Vec<(EntityHandle, Position, Option<u32>, bool)> {
    let m = tick_loop.manager();
    handles
        .iter()
        .filter(|&&e| m.is_entity_active(e))
        .map(|&e| {
            (
                e,
                m.get_fragment_data::<Position>(e).cloned().unwrap_or_default(),
                m.get_fragment_data::<Health>(e).map(|h| h.0),
                m.get_fragment_data::<Velocity>(e).is_some(),
            )
        })
        .collect()
}

fn check_storage(tick_loop: &TickLoop, expected_alive: usize) {
    let m = tick_loop.manager();
    assert_eq!(m.debug_entity_count(), expected_alive);
    let stored: usize = m.archetypes().iter().map(|a| a.num_entities()).sum();
    assert_eq!(stored, expected_alive);
    for archetype in m.archetypes() {
        archetype.debug_check_invariants();
    }
}

// -- Tests ------------------------------------------------------------------

#[test]
fn simulation_is_deterministic_across_runs() {
    let (mut first, handles) = build(EngineConfig::default(), 1234);
    first.run_ticks(40);
    let (mut second, handles2) = build(EngineConfig::default(), 1234);
    second.run_ticks(40);

    assert_eq!(handles, handles2);
    assert_eq!(digest(&first, &handles), digest(&second, &handles2));
}

#[test]
fn parallel_and_serial_runs_agree() {
    let mut serial_config = EngineConfig::default();
    serial_config.ecs.parallel_execution = false;

    let (mut parallel, handles) = build(EngineConfig::default(), 99);
    let (mut serial, _) = build(serial_config, 99);
    for _ in 0..25 {
        let a = parallel.tick();
        let b = serial.tick();
        assert_eq!(a, b);
    }
    assert_eq!(digest(&parallel, &handles), digest(&serial, &handles));
}

#[test]
fn churn_keeps_storage_consistent() {
    let mut config = EngineConfig::default();
    // Small chunks so deaths leave holes across many chunks.
    config.ecs.chunk_memory_size = 2048;
    config.compaction_budget_us = 50_000;
    let (mut tick_loop, handles) = build(config, 7);

    for _ in 0..30 {
        tick_loop.tick();
        let alive = handles.iter().filter(|&&e| tick_loop.manager().is_entity_active(e)).count();
        check_storage(&tick_loop, alive);
    }

    // Everything with health eventually burns out.
    let m = tick_loop.manager();
    assert!(handles.iter().all(|&e| m.get_fragment_data::<Health>(e).is_none()));
    assert!(m.debug_entity_count() < ENTITIES);
}

#[test]
fn observers_see_deferred_destruction() {
    let (mut tick_loop, _) = build(EngineConfig::default(), 5);
    let destroyed = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&destroyed);
    tick_loop.manager_mut().observe(EntityEvent::Destroyed, move |batch| {
        sink.fetch_add(batch.len(), Ordering::Relaxed);
    });

    tick_loop.run_ticks(30);
    let alive = tick_loop.manager().debug_entity_count();
    assert_eq!(destroyed.load(Ordering::Relaxed), ENTITIES - alive);
}

#[test]
fn config_file_drives_the_loop() {
    let dir = std::env::temp_dir().join(format!("strata-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("engine.json");
    std::fs::write(
        &path,
        r#"{ "tick": { "fixed_dt": 0.5, "max_ticks_per_run": 3 }, "log_filter": "warn" }"#,
    )
    .unwrap();

    let config = EngineConfig::from_json_file(&path).unwrap();
    init_tracing(&config.log_filter);
    let mut tick_loop = TickLoop::from_config(config).unwrap();
    assert_eq!(tick_loop.run_ticks(10), 3);
    assert_eq!(tick_loop.sim_time(), 1.5);

    std::fs::remove_dir_all(&dir).unwrap();
}
