//! Page store abstraction.
//!
//! The tree owns no storage. Every page it reads, writes, or releases goes
//! through a [`PageStore`] supplied by the embedding key-value store, which
//! keeps durability, free-space reuse, and reclamation ordering out of the
//! tree core. Tests use [`crate::simulation::SimulatedPageStore`].

use crate::page::{Page, PagePtr};

/// Errors reported by a page store.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error from a file-backed store.
    Io(std::io::Error),
    /// The pointer does not name a live page.
    PageNotFound(PagePtr),
    /// The null pointer was passed where a page was required.
    NullPointer,
    /// Corruption detected.
    Corruption(String),
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PageNotFound(ptr) => write!(f, "page {ptr} not found"),
            Self::NullPointer => write!(f, "null page pointer"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// The three page-lifecycle operations the tree consumes.
///
/// # Contract
///
/// Implementations must ensure:
/// - `get` returns exactly the bytes passed to the `allocate` call that
///   produced the pointer, for as long as the page has not been released
/// - `allocate` never returns [`PagePtr::NULL`] and never returns a pointer
///   that is still live
/// - `deallocate` may defer the actual release (readers of an older root
///   may still be walking the page)
///
/// The tree never writes to a page after `allocate` and only deallocates
/// pages it superseded during the operation in progress.
pub trait PageStore {
    /// Dereference a page pointer.
    fn get(&self, ptr: PagePtr) -> Result<Page, StoreError>;

    /// Persist a new page and return its pointer.
    fn allocate(&mut self, page: &Page) -> Result<PagePtr, StoreError>;

    /// Release a page that is no longer referenced by the new tree.
    fn deallocate(&mut self, ptr: PagePtr) -> Result<(), StoreError>;
}

impl<S: PageStore + ?Sized> PageStore for &mut S {
    fn get(&self, ptr: PagePtr) -> Result<Page, StoreError> {
        (**self).get(ptr)
    }

    fn allocate(&mut self, page: &Page) -> Result<PagePtr, StoreError> {
        (**self).allocate(page)
    }

    fn deallocate(&mut self, ptr: PagePtr) -> Result<(), StoreError> {
        (**self).deallocate(ptr)
    }
}

impl<S: PageStore + ?Sized> PageStore for Box<S> {
    fn get(&self, ptr: PagePtr) -> Result<Page, StoreError> {
        (**self).get(ptr)
    }

    fn allocate(&mut self, page: &Page) -> Result<PagePtr, StoreError> {
        (**self).allocate(page)
    }

    fn deallocate(&mut self, ptr: PagePtr) -> Result<(), StoreError> {
        (**self).deallocate(ptr)
    }
}
