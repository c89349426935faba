//! Property tests for entity manager operations.
//!
//! These tests use `proptest` to generate random sequences of structural
//! operations and check them against a simple model: every live entity is in
//! exactly one archetype, entity counts are conserved, and fragment values
//! survive archetype migration and compaction untouched.

use std::collections::HashMap;
use std::time::Duration;

use proptest::prelude::*;
use strata_ecs::prelude::*;

#[derive(Debug, Clone, Default, PartialEq)]
struct A(u32);

#[derive(Debug, Clone, Default, PartialEq)]
struct B(u64);

#[derive(Debug, Clone, Default, PartialEq)]
struct C([u16; 3]);

/// Model of one entity: which of A/B/C it has, and their values.
#[derive(Debug, Clone, Default, PartialEq)]
struct Model {
    a: Option<A>,
    b: Option<B>,
    c: Option<C>,
}

impl Model {
    fn count(&self) -> usize {
        self.a.is_some() as usize + self.b.is_some() as usize + self.c.is_some() as usize
    }
}

#[derive(Debug, Clone)]
enum Op {
    Create(u8, u32),
    BatchCreate(u8, usize),
    Destroy(usize),
    Add(usize, u8, u32),
    Remove(usize, u8),
    Compact,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u8..8, any::<u32>()).prop_map(|(mask, v)| Op::Create(mask, v)),
        1 => (1u8..8, 0usize..40).prop_map(|(mask, n)| Op::BatchCreate(mask, n)),
        3 => (0usize..200).prop_map(Op::Destroy),
        3 => (0usize..200, 0u8..3, any::<u32>()).prop_map(|(i, f, v)| Op::Add(i, f, v)),
        3 => (0usize..200, 0u8..3).prop_map(|(i, f)| Op::Remove(i, f)),
        1 => Just(Op::Compact),
    ]
}

struct Harness {
    manager: EntityManager,
    types: [FragmentTypeId; 3],
    alive: Vec<EntityHandle>,
    model: HashMap<EntityHandle, Model>,
}

impl Harness {
    fn new() -> Self {
        // Small chunks so a few dozen entities span several of them.
        let config = EntityManagerConfig {
            chunk_memory_size: 256,
            ..Default::default()
        };
        let mut manager = EntityManager::with_config(config).unwrap();
        let types = [
            manager.register_fragment::<A>("a"),
            manager.register_fragment::<B>("b"),
            manager.register_fragment::<C>("c"),
        ];
        Self {
            manager,
            types,
            alive: Vec::new(),
            model: HashMap::new(),
        }
    }

    fn types_for(&self, mask: u8) -> Vec<FragmentTypeId> {
        (0..3).filter(|i| mask & (1 << i) != 0).map(|i| self.types[i]).collect()
    }

    fn create(&mut self, mask: u8, v: u32) {
        let archetype = self.manager.create_archetype_from_types(&self.types_for(mask));
        let e = self.manager.create_entity(archetype);
        let mut model = Model::default();
        if mask & 1 != 0 {
            *self.manager.get_fragment_data_mut::<A>(e).unwrap() = A(v);
            model.a = Some(A(v));
        }
        if mask & 2 != 0 {
            *self.manager.get_fragment_data_mut::<B>(e).unwrap() = B(u64::from(v) << 8);
            model.b = Some(B(u64::from(v) << 8));
        }
        if mask & 4 != 0 {
            let c = C([v as u16, (v >> 16) as u16, 7]);
            *self.manager.get_fragment_data_mut::<C>(e).unwrap() = c.clone();
            model.c = Some(c);
        }
        self.alive.push(e);
        self.model.insert(e, model);
    }

    fn batch_create(&mut self, mask: u8, count: usize) {
        let archetype = self.manager.create_archetype_from_types(&self.types_for(mask));
        let handles = self.manager.batch_create_entities(archetype, count).entities().to_vec();
        for e in handles {
            let model = Model {
                a: (mask & 1 != 0).then(A::default),
                b: (mask & 2 != 0).then(B::default),
                c: (mask & 4 != 0).then(C::default),
            };
            self.alive.push(e);
            self.model.insert(e, model);
        }
    }

    fn pick(&self, index: usize) -> Option<EntityHandle> {
        (!self.alive.is_empty()).then(|| self.alive[index % self.alive.len()])
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Create(mask, v) => self.create(mask, v),
            Op::BatchCreate(mask, n) => self.batch_create(mask, n),
            Op::Destroy(i) => {
                if let Some(e) = self.pick(i) {
                    self.manager.destroy_entity(e);
                    self.alive.retain(|&h| h != e);
                    self.model.remove(&e);
                }
            }
            Op::Add(i, which, v) => {
                let Some(e) = self.pick(i) else { return };
                let Some(model) = self.model.get_mut(&e) else { return };
                match which {
                    0 if model.a.is_none() => {
                        self.manager.add_fragment_value(e, A(v));
                        model.a = Some(A(v));
                    }
                    1 if model.b.is_none() => {
                        self.manager.add_fragment_value(e, B(u64::from(v)));
                        model.b = Some(B(u64::from(v)));
                    }
                    2 if model.c.is_none() => {
                        self.manager.add_fragment_to_entity(e, self.types[2]);
                        model.c = Some(C::default());
                    }
                    _ => {}
                }
            }
            Op::Remove(i, which) => {
                let Some(e) = self.pick(i) else { return };
                let Some(model) = self.model.get_mut(&e) else { return };
                if model.count() < 2 {
                    return;
                }
                let present = match which {
                    0 => model.a.is_some(),
                    1 => model.b.is_some(),
                    _ => model.c.is_some(),
                };
                if !present {
                    return;
                }
                self.manager.remove_fragment_from_entity(e, self.types[which as usize]);
                match which {
                    0 => model.a = None,
                    1 => model.b = None,
                    _ => model.c = None,
                }
            }
            Op::Compact => {
                let report = self.manager.compact_entities(Duration::from_secs(10));
                assert!(report.completed);
            }
        }
    }

    fn check(&self) {
        assert_eq!(self.manager.debug_entity_count(), self.alive.len());
        let stored: usize = self.manager.archetypes().iter().map(|a| a.num_entities()).sum();
        assert_eq!(stored, self.alive.len());
        for archetype in self.manager.archetypes() {
            archetype.debug_check_invariants();
        }
        for (&e, model) in &self.model {
            assert!(self.manager.is_entity_active(e));
            assert_eq!(self.manager.get_fragment_data::<A>(e), model.a.as_ref());
            assert_eq!(self.manager.get_fragment_data::<B>(e), model.b.as_ref());
            assert_eq!(self.manager.get_fragment_data::<C>(e), model.c.as_ref());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn random_ops_conserve_entities(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let mut h = Harness::new();
        for op in ops {
            h.apply(op);
        }
        h.check();
    }

    #[test]
    fn migration_keeps_values(
        values in prop::collection::vec(any::<u32>(), 1..60),
        strip in prop::collection::vec(any::<bool>(), 60),
    ) {
        let mut h = Harness::new();
        for &v in &values {
            h.create(0b111, v);
        }
        let handles = h.alive.clone();
        for (i, &e) in handles.iter().enumerate() {
            if strip[i] {
                h.manager.remove_fragment_from_entity(e, h.types[1]);
                if let Some(model) = h.model.get_mut(&e) {
                    model.b = None;
                }
            }
        }
        h.check();

        // Move everyone back into the full archetype.
        let full = h.manager.create_archetype_from_types(&h.types);
        for &e in &handles {
            h.manager.move_entity_to_another_archetype(e, full);
            if let Some(model) = h.model.get_mut(&e) {
                model.b.get_or_insert_with(B::default);
            }
        }
        prop_assert_eq!(h.manager.debug_archetype_entities_count(full), handles.len());
        h.check();
    }

    #[test]
    fn handles_never_resurrect(rounds in 1usize..20) {
        let mut h = Harness::new();
        let mut dead = Vec::new();
        for round in 0..rounds {
            h.create(0b001, round as u32);
            h.create(0b011, round as u32);
            let victim = h.alive[0];
            h.manager.destroy_entity(victim);
            h.alive.remove(0);
            h.model.remove(&victim);
            dead.push(victim);
        }
        for e in dead {
            prop_assert!(!h.manager.is_entity_valid(e));
            prop_assert!(h.manager.get_fragment_data::<A>(e).is_none());
        }
        h.check();
    }
}
