//! Page types and constants.
//!
//! A page is the fixed-size unit handed between the tree and its page store.
//! The tree never looks at where a page lives; it only carries the opaque
//! [`PagePtr`] the store returned for it.

/// Page size in bytes (4KB).
pub const PAGE_SIZE: usize = 4096;

/// An opaque logical page id assigned by a page store.
///
/// Pointer value 0 is reserved as the null pointer and is never returned by
/// a store's `allocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PagePtr(pub u64);

impl PagePtr {
    /// The reserved null pointer.
    pub const NULL: Self = Self(0);

    /// Whether this is the reserved null pointer.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Get the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PagePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for PagePtr {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<PagePtr> for u64 {
    fn from(ptr: PagePtr) -> Self {
        ptr.0
    }
}

/// A raw page buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// Create a new zeroed page.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Create a page from a prefix of bytes, zero-filling the rest.
    ///
    /// Panics if `bytes` is longer than a page.
    #[must_use]
    pub fn from_prefix(bytes: &[u8]) -> Self {
        assert!(
            bytes.len() <= PAGE_SIZE,
            "page content of {} bytes exceeds page size {PAGE_SIZE}",
            bytes.len()
        );
        let mut page = Self::new();
        page.write_bytes(0, bytes);
        page
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Get mutable access to the raw page data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    /// Consume the page and return its bytes as a vector without copying.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        let data: Box<[u8]> = self.data;
        data.into_vec()
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Compute the CRC32 checksum of the whole page.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.data[..])
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("first_16_bytes", &&self.data[..16])
            .finish_non_exhaustive()
    }
}
