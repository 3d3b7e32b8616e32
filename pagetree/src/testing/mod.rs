use tracing_subscriber::EnvFilter;

use crate::btree::BTree;
use crate::simulation::SimulatedPageStore;

/// Install a test subscriber once per process.
///
/// Output is captured by the test harness; run with
/// `RUST_LOG=pagetree=trace` to see splits and merges.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create an empty tree over a fresh simulated store.
pub fn new_test_tree() -> BTree<SimulatedPageStore> {
    init_tracing();
    BTree::new(SimulatedPageStore::new(42))
}

/// Fixed-width key that sorts in numeric order.
pub fn numbered_key(i: u32) -> Vec<u8> {
    format!("key{i:08}").into_bytes()
}
