//! Randomized workload driver for deterministic simulation testing.
//!
//! Runs a seeded mix of inserts, updates, deletes, and lookups against a
//! tree on a [`SimulatedPageStore`] and against a `BTreeMap` model, and
//! compares the two after every step. The tree's invariants are checked
//! after each mutation.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::btree::{BTree, BTreeError, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::config::TreeConfig;
use crate::store::StoreError;

use super::invariants::{InvariantChecker, InvariantViolation, TreeShape};
use super::storage::{FaultConfig, SimulatedPageStore};

/// Configuration for a workload run.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Fault injection configuration.
    pub fault_config: FaultConfig,
    /// Tree configuration.
    pub tree_config: TreeConfig,
    /// Number of distinct key stems.
    pub key_space: u32,
    /// Longest padding appended to a key stem.
    pub max_key_padding: usize,
    /// Longest generated value.
    pub max_value_len: usize,
    /// Probability that an operation is a delete (0.0 - 1.0).
    pub delete_rate: f64,
    /// Probability that an operation is a lookup (0.0 - 1.0).
    pub lookup_rate: f64,
}

impl WorkloadConfig {
    /// Create a workload config with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            fault_config: FaultConfig::default(),
            tree_config: TreeConfig::default(),
            key_space: 2000,
            max_key_padding: 64,
            max_value_len: 512,
            delete_rate: 0.3,
            lookup_rate: 0.2,
        }
    }

    /// Set the fault configuration.
    #[must_use]
    pub const fn with_fault_config(mut self, config: FaultConfig) -> Self {
        self.fault_config = config;
        self
    }

    /// Set the tree configuration.
    #[must_use]
    pub const fn with_tree_config(mut self, config: TreeConfig) -> Self {
        self.tree_config = config;
        self
    }

    /// Set the key and value size limits.
    #[must_use]
    pub const fn with_entry_sizes(mut self, max_key_padding: usize, max_value_len: usize) -> Self {
        self.max_key_padding = max_key_padding;
        self.max_value_len = max_value_len;
        self
    }

    /// Set the delete rate.
    #[must_use]
    pub const fn with_delete_rate(mut self, rate: f64) -> Self {
        self.delete_rate = rate;
        self
    }
}

/// Results from a workload run.
#[derive(Debug)]
pub struct WorkloadResult {
    /// The seed used for this run.
    pub seed: u64,
    /// Number of operations issued.
    pub operations: u64,
    /// Inserts of new keys.
    pub inserts: u64,
    /// Inserts that replaced an existing value.
    pub updates: u64,
    /// Deletes that removed a key.
    pub deletes: u64,
    /// Lookups issued.
    pub lookups: u64,
    /// Operations rejected by an injected store fault.
    pub failed_operations: u64,
    /// Disagreements between the tree and the model.
    pub mismatches: Vec<String>,
    /// Invariant violations detected.
    pub invariant_violations: Vec<InvariantViolation>,
    /// Shape of the tree at the end of the run.
    pub final_shape: TreeShape,
}

impl WorkloadResult {
    /// Check if the run passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty() && self.invariant_violations.is_empty()
    }
}

/// The workload driver.
pub struct Workload {
    config: WorkloadConfig,
    rng: StdRng,
}

/// Counters accumulated while running.
#[derive(Default)]
struct Tally {
    operations: u64,
    inserts: u64,
    updates: u64,
    deletes: u64,
    lookups: u64,
    failed_operations: u64,
    mismatches: Vec<String>,
    invariant_violations: Vec<InvariantViolation>,
}

impl Workload {
    /// Create a new workload driver.
    #[must_use]
    pub fn new(config: WorkloadConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    /// Run `op_count` operations on a fresh tree.
    pub fn run(&mut self, op_count: usize) -> WorkloadResult {
        let store =
            SimulatedPageStore::with_config(self.config.seed, self.config.fault_config.clone());
        let mut tree = BTree::with_config(store, None, self.config.tree_config);
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut tally = Tally::default();

        for step in 0..op_count {
            tally.operations += 1;
            let roll = self.rng.random::<f64>();
            if roll < self.config.lookup_rate {
                let key = self.pick_key(&model);
                lookup(&tree, &model, &key, step, &mut tally);
                continue;
            }

            let root_before = tree.root();
            let outcome = if roll < self.config.lookup_rate + self.config.delete_rate {
                let key = self.pick_key(&model);
                delete(&mut tree, &mut model, &key, step, &mut tally)
            } else {
                let key = self.new_key();
                let value = self.new_value(step);
                insert(&mut tree, &mut model, &key, &value, step, &mut tally)
            };

            match outcome {
                Ok(()) => {}
                Err(BTreeError::Store(StoreError::InjectedFault(_))) => {
                    tally.failed_operations += 1;
                    if tree.root() != root_before {
                        tally
                            .mismatches
                            .push(format!("step {step}: failed operation moved the root"));
                    }
                    continue;
                }
                Err(e) => {
                    tally.mismatches.push(format!("step {step}: {e}"));
                    continue;
                }
            }

            if let Err(violation) = InvariantChecker::new(tree.store()).check(tree.root()) {
                tracing::warn!("step {step}: invariant violated: {violation}");
                tally.invariant_violations.push(violation);
            }
        }

        let final_shape = finish(&tree, &model, &mut tally);

        WorkloadResult {
            seed: self.config.seed,
            operations: tally.operations,
            inserts: tally.inserts,
            updates: tally.updates,
            deletes: tally.deletes,
            lookups: tally.lookups,
            failed_operations: tally.failed_operations,
            mismatches: tally.mismatches,
            invariant_violations: tally.invariant_violations,
            final_shape,
        }
    }

    /// A key from the model most of the time, otherwise a fresh one.
    fn pick_key(&mut self, model: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<u8> {
        if model.is_empty() || self.rng.random_bool(0.2) {
            return self.new_key();
        }
        let idx = self.rng.random_range(0..model.len());
        model.keys().nth(idx).cloned().unwrap_or_default()
    }

    /// A key from the key space. Each stem always gets the same padding.
    fn new_key(&mut self) -> Vec<u8> {
        let stem = self.rng.random_range(0..self.config.key_space.max(1));
        let mut key = format!("k{stem:06}").into_bytes();
        let padding = (stem as usize * 7919) % (self.config.max_key_padding + 1);
        key.resize((key.len() + padding).min(MAX_KEY_SIZE), b'.');
        key
    }

    fn new_value(&mut self, step: usize) -> Vec<u8> {
        let len = self
            .rng
            .random_range(0..=self.config.max_value_len.min(MAX_VALUE_SIZE));
        #[allow(clippy::cast_possible_truncation)]
        let fill = step as u8;
        vec![fill; len]
    }
}

fn insert(
    tree: &mut BTree<SimulatedPageStore>,
    model: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    key: &[u8],
    value: &[u8],
    step: usize,
    tally: &mut Tally,
) -> Result<(), BTreeError> {
    let old = tree.insert(key, value)?;
    let expected = model.insert(key.to_vec(), value.to_vec());
    if old.is_some() {
        tally.updates += 1;
    } else {
        tally.inserts += 1;
    }
    if old != expected {
        tally
            .mismatches
            .push(format!("step {step}: insert returned the wrong old value"));
    }
    Ok(())
}

fn delete(
    tree: &mut BTree<SimulatedPageStore>,
    model: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    key: &[u8],
    step: usize,
    tally: &mut Tally,
) -> Result<(), BTreeError> {
    let removed = tree.delete(key)?;
    let expected = model.remove(key).is_some();
    if removed {
        tally.deletes += 1;
    }
    if removed != expected {
        tally.mismatches.push(format!(
            "step {step}: delete returned {removed}, expected {expected}"
        ));
    }
    Ok(())
}

fn lookup(
    tree: &BTree<SimulatedPageStore>,
    model: &BTreeMap<Vec<u8>, Vec<u8>>,
    key: &[u8],
    step: usize,
    tally: &mut Tally,
) {
    tally.lookups += 1;
    match tree.get(key) {
        Ok(value) if value.as_ref() == model.get(key) => {}
        Ok(_) => tally
            .mismatches
            .push(format!("step {step}: lookup returned the wrong value")),
        Err(e) => tally.mismatches.push(format!("step {step}: lookup failed: {e}")),
    }
}

/// Compare the full contents and page accounting at the end of a run.
fn finish(
    tree: &BTree<SimulatedPageStore>,
    model: &BTreeMap<Vec<u8>, Vec<u8>>,
    tally: &mut Tally,
) -> TreeShape {
    match tree.iter().and_then(|iter| iter.collect::<Result<Vec<_>, _>>()) {
        Ok(entries) => {
            if !entries.iter().map(|(k, v)| (k, v)).eq(model.iter()) {
                tally
                    .mismatches
                    .push("final contents differ from the model".to_string());
            }
        }
        Err(e) => tally.mismatches.push(format!("final scan failed: {e}")),
    }

    let shape = match InvariantChecker::new(tree.store()).check(tree.root()) {
        Ok(shape) => shape,
        Err(violation) => {
            tally.invariant_violations.push(violation);
            return TreeShape::default();
        }
    };

    // Failed allocations and refused releases leave orphans behind.
    let stats = tree.store().stats();
    if stats.injected_allocate_errors == 0
        && stats.injected_deallocate_errors == 0
        && tree.store().live_pages() != shape.leaves + shape.internals
    {
        tally.mismatches.push(format!(
            "{} live pages, {} reachable",
            tree.store().live_pages(),
            shape.leaves + shape.internals
        ));
    }
    if shape.entries != model.len() {
        tally.mismatches.push(format!(
            "tree holds {} entries, model {}",
            shape.entries,
            model.len()
        ));
    }
    shape
}
