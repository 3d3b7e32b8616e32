//! Copy-on-write B+tree over an external page store.
//!
//! The tree reads, allocates, and releases fixed-size pages through the
//! [`PageStore`] trait and never modifies a page in place. Every successful
//! insert or delete produces a new root; the caller decides when to publish
//! it and when superseded pages may really be reused.
//!
//! - [`page`]: page buffer and page pointer types
//! - [`store`]: the page store trait and its errors
//! - [`btree`]: node codec and tree engine
//! - [`config`]: tunables
//! - [`simulation`]: simulated store, invariant checker, randomized workloads

#![cfg_attr(
    test,
    allow(
        clippy::disallowed_methods,
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::cast_possible_truncation
    )
)]
// Pages come from an external store; a bad page must surface as an error.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod btree;
pub mod config;
pub mod page;
pub mod simulation;
pub mod store;
#[cfg(test)]
mod testing;

pub use btree::{BTree, BTreeError, BTreeIterator, EntryError, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use config::{ConfigError, TreeConfig};
pub use page::{PAGE_SIZE, Page, PagePtr};
pub use store::{PageStore, StoreError};
