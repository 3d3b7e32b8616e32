//! Simulated in-memory page store for deterministic testing.
//!
//! This module provides an in-memory implementation of the `PageStore` trait
//! with:
//! - Seeded fault injection on allocation
//! - Checksums verified on every read, plus a hook to corrupt a page
//! - Optional deferred reclamation, so older roots stay readable until
//!   [`SimulatedPageStore::reclaim`] is called

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::page::{PAGE_SIZE, Page, PagePtr};
use crate::store::{PageStore, StoreError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of an allocation error (0.0 - 1.0).
    pub allocate_error_rate: f64,
    /// Probability of a deallocation error (0.0 - 1.0).
    pub deallocate_error_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with low fault rates (for stress testing).
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            allocate_error_rate: 0.01,
            deallocate_error_rate: 0.0,
        }
    }

    /// Fail every allocation.
    #[must_use]
    pub const fn always_fail_allocate() -> Self {
        Self {
            allocate_error_rate: 1.0,
            deallocate_error_rate: 0.0,
        }
    }

    /// Refuse every deallocation.
    #[must_use]
    pub const fn always_fail_deallocate() -> Self {
        Self {
            allocate_error_rate: 0.0,
            deallocate_error_rate: 1.0,
        }
    }
}

/// Statistics about simulated page store operations.
#[derive(Debug, Default, Clone)]
pub struct SimulatedPageStoreStats {
    /// Number of successful allocations.
    pub allocations: u64,
    /// Number of deallocations.
    pub deallocations: u64,
    /// Number of pages actually released.
    pub reclaimed: u64,
    /// Number of injected allocation errors.
    pub injected_allocate_errors: u64,
    /// Number of injected deallocation errors.
    pub injected_deallocate_errors: u64,
}

/// A stored page and the checksum taken when it was allocated.
#[derive(Debug)]
struct StoredPage {
    page: Page,
    checksum: u32,
}

/// In-memory page store for deterministic testing.
///
/// Pointers are handed out sequentially starting at 1 and never reused.
/// By default deallocated pages are dropped immediately; with deferred
/// reclamation they stay readable until the next [`Self::reclaim`].
pub struct SimulatedPageStore {
    /// Live and pending-release pages.
    pages: HashMap<PagePtr, StoredPage>,
    /// Next pointer to hand out.
    next_ptr: u64,
    /// Whether deallocation waits for `reclaim`.
    deferred_reclaim: bool,
    /// Deallocated pages not yet reclaimed.
    pending: HashSet<PagePtr>,

    /// Fault injection configuration.
    fault_config: FaultConfig,
    /// Random number generator for fault injection.
    rng: StdRng,

    /// Statistics for tracking.
    stats: SimulatedPageStoreStats,
}

impl SimulatedPageStore {
    /// Create a new simulated store with the given seed.
    ///
    /// The seed ensures deterministic behavior - the same seed will
    /// produce the same sequence of faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a new simulated store with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            pages: HashMap::new(),
            next_ptr: 1,
            deferred_reclaim: false,
            pending: HashSet::new(),
            fault_config,
            rng: StdRng::seed_from_u64(seed),
            stats: SimulatedPageStoreStats::default(),
        }
    }

    /// Get the current statistics.
    #[must_use]
    pub const fn stats(&self) -> &SimulatedPageStoreStats {
        &self.stats
    }

    /// Update the fault configuration.
    pub const fn set_fault_config(&mut self, config: FaultConfig) {
        self.fault_config = config;
    }

    /// Keep deallocated pages readable until [`Self::reclaim`].
    ///
    /// Turning deferral off does not release pages already pending.
    pub const fn set_deferred_reclaim(&mut self, deferred: bool) {
        self.deferred_reclaim = deferred;
    }

    /// Release every page deallocated since the last reclaim.
    ///
    /// Returns the number of pages released.
    pub fn reclaim(&mut self) -> usize {
        let released = self.pending.len();
        for ptr in self.pending.drain() {
            self.pages.remove(&ptr);
        }
        self.stats.reclaimed += released as u64;
        released
    }

    /// Number of allocated pages that have not been deallocated.
    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.pages.len() - self.pending.len()
    }

    /// Number of deallocated pages waiting for [`Self::reclaim`].
    #[must_use]
    pub fn pending_pages(&self) -> usize {
        self.pending.len()
    }

    /// Corrupt a stored page by flipping bits in one random byte.
    ///
    /// The stored checksum is left alone, so the next `get` of this page
    /// reports corruption.
    pub fn corrupt_page(&mut self, ptr: PagePtr) {
        let byte_offset = self.rng.random_range(0..PAGE_SIZE);
        let mask = self.rng.random_range(1..=u8::MAX);
        if let Some(stored) = self.pages.get_mut(&ptr) {
            stored.page.as_bytes_mut()[byte_offset] ^= mask;
        }
    }

    /// Check if a fault should be injected based on the given rate.
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }
}

impl PageStore for SimulatedPageStore {
    fn get(&self, ptr: PagePtr) -> Result<Page, StoreError> {
        if ptr.is_null() {
            return Err(StoreError::NullPointer);
        }
        let stored = self.pages.get(&ptr).ok_or(StoreError::PageNotFound(ptr))?;

        let checksum = stored.page.compute_checksum();
        if checksum != stored.checksum {
            tracing::warn!("checksum mismatch on page {ptr}");
            return Err(StoreError::Corruption(format!(
                "page {ptr}: expected checksum {:#010x}, found {checksum:#010x}",
                stored.checksum
            )));
        }

        Ok(stored.page.clone())
    }

    fn allocate(&mut self, page: &Page) -> Result<PagePtr, StoreError> {
        if self.should_inject_fault(self.fault_config.allocate_error_rate) {
            self.stats.injected_allocate_errors += 1;
            return Err(StoreError::InjectedFault(
                "simulated allocate error".to_string(),
            ));
        }

        let ptr = PagePtr(self.next_ptr);
        self.next_ptr += 1;
        self.pages.insert(
            ptr,
            StoredPage {
                page: page.clone(),
                checksum: page.compute_checksum(),
            },
        );
        self.stats.allocations += 1;
        Ok(ptr)
    }

    fn deallocate(&mut self, ptr: PagePtr) -> Result<(), StoreError> {
        if ptr.is_null() {
            return Err(StoreError::NullPointer);
        }
        if !self.pages.contains_key(&ptr) || self.pending.contains(&ptr) {
            return Err(StoreError::PageNotFound(ptr));
        }
        if self.should_inject_fault(self.fault_config.deallocate_error_rate) {
            self.stats.injected_deallocate_errors += 1;
            return Err(StoreError::InjectedFault(
                "simulated deallocate error".to_string(),
            ));
        }

        self.stats.deallocations += 1;
        if self.deferred_reclaim {
            self.pending.insert(ptr);
        } else {
            self.pages.remove(&ptr);
            self.stats.reclaimed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(bytes: &[u8]) -> Page {
        let mut page = Page::new();
        page.write_bytes(0, bytes);
        page
    }

    #[test]
    fn test_simulated_store_basic() {
        let mut store = SimulatedPageStore::new(12345);

        let first = store.allocate(&page_with(b"hello world")).unwrap();
        let second = store.allocate(&page_with(b"second")).unwrap();
        assert_eq!(first, PagePtr(1));
        assert_eq!(second, PagePtr(2));
        assert_eq!(store.live_pages(), 2);

        let page = store.get(first).unwrap();
        assert_eq!(&page.as_bytes()[..11], b"hello world");

        store.deallocate(first).unwrap();
        assert!(matches!(
            store.get(first),
            Err(StoreError::PageNotFound(PagePtr(1)))
        ));
        assert_eq!(store.live_pages(), 1);
        assert_eq!(store.stats().deallocations, 1);
    }

    #[test]
    fn test_null_and_double_free() {
        let mut store = SimulatedPageStore::new(1);
        assert!(matches!(store.get(PagePtr::NULL), Err(StoreError::NullPointer)));
        assert!(matches!(
            store.deallocate(PagePtr::NULL),
            Err(StoreError::NullPointer)
        ));

        let ptr = store.allocate(&Page::new()).unwrap();
        store.deallocate(ptr).unwrap();
        assert!(matches!(
            store.deallocate(ptr),
            Err(StoreError::PageNotFound(_))
        ));
    }

    #[test]
    fn test_deferred_reclaim() {
        let mut store = SimulatedPageStore::new(1);
        store.set_deferred_reclaim(true);

        let ptr = store.allocate(&page_with(b"old")).unwrap();
        store.deallocate(ptr).unwrap();
        assert_eq!(store.live_pages(), 0);
        assert_eq!(store.pending_pages(), 1);
        assert_eq!(&store.get(ptr).unwrap().as_bytes()[..3], b"old");
        assert!(store.deallocate(ptr).is_err());

        assert_eq!(store.reclaim(), 1);
        assert!(store.get(ptr).is_err());
        assert_eq!(store.stats().reclaimed, 1);
    }

    #[test]
    fn test_corruption_is_detected() {
        let mut store = SimulatedPageStore::new(99);
        let ptr = store.allocate(&page_with(b"payload")).unwrap();

        store.corrupt_page(ptr);
        assert!(matches!(store.get(ptr), Err(StoreError::Corruption(_))));
    }

    #[test]
    fn test_simulated_store_fault_injection() {
        let mut store = SimulatedPageStore::with_config(12345, FaultConfig::always_fail_allocate());

        let result = store.allocate(&Page::new());
        assert!(matches!(result, Err(StoreError::InjectedFault(_))));
        assert_eq!(store.stats().injected_allocate_errors, 1);
        assert_eq!(store.stats().allocations, 0);
        assert_eq!(store.live_pages(), 0);
    }

    #[test]
    fn test_simulated_store_deallocate_fault() {
        let mut store = SimulatedPageStore::with_config(12345, FaultConfig::always_fail_deallocate());

        let ptr = store.allocate(&page_with(b"kept")).unwrap();
        assert!(matches!(
            store.deallocate(ptr),
            Err(StoreError::InjectedFault(_))
        ));
        assert_eq!(store.stats().injected_deallocate_errors, 1);
        assert_eq!(store.stats().deallocations, 0);
        assert_eq!(store.live_pages(), 1);
    }

    #[test]
    fn test_simulated_store_deterministic() {
        // Same seed should produce same behavior
        let config = FaultConfig {
            allocate_error_rate: 0.5,
            ..FaultConfig::default()
        };

        let mut results1 = Vec::new();
        let mut store1 = SimulatedPageStore::with_config(12345, config.clone());
        for _ in 0..20 {
            results1.push(store1.allocate(&Page::new()).is_ok());
        }

        let mut results2 = Vec::new();
        let mut store2 = SimulatedPageStore::with_config(12345, config);
        for _ in 0..20 {
            results2.push(store2.allocate(&Page::new()).is_ok());
        }

        assert_eq!(
            results1, results2,
            "Same seed should produce same fault pattern"
        );
    }
}
