//! Deterministic Simulation Testing (DST) infrastructure.
//!
//! This module provides tools for testing the tree with:
//! - In-memory page storage with fault injection and checksums
//! - Reproducible random workloads checked against a model
//! - Invariant checking after each operation
//!
//! # Design Principles
//!
//! 1. All page I/O goes through the `PageStore` trait and can be simulated
//! 2. All randomness is seeded for reproducibility
//! 3. Faults can be injected at the allocation boundary
//! 4. Given the same seed, execution is identical
//!
//! # Usage
//!
//! ```ignore
//! use pagetree::simulation::{FaultConfig, Workload, WorkloadConfig};
//!
//! let config = WorkloadConfig::new(12345) // seed
//!     .with_fault_config(FaultConfig::low_faults());
//!
//! let result = Workload::new(config).run(1000); // Run 1000 operations
//!
//! assert!(result.passed());
//! ```

mod invariants;
mod storage;
mod workload;

pub use invariants::{InvariantChecker, InvariantViolation, TreeShape};
pub use storage::{FaultConfig, SimulatedPageStore, SimulatedPageStoreStats};
pub use workload::{Workload, WorkloadConfig, WorkloadResult};
