//! Copy-on-write B+tree over a [`PageStore`].
//!
//! Pages are immutable once allocated. Every insert or delete rebuilds the
//! nodes on the path from the root to the affected leaf in memory, allocates
//! them as new pages, and yields a new root. Siblings that were not touched
//! stay shared between the old and new versions of the tree, so a reader
//! holding the previous root keeps seeing a consistent snapshot until the
//! store reclaims the superseded pages.
//!
//! Superseded pages are only handed to [`PageStore::deallocate`] after every
//! allocation of the operation succeeded. A failed operation therefore
//! leaves the previous root intact; the only leftovers are orphaned pages
//! that were allocated before the failure.

#![allow(clippy::cast_possible_truncation)]

use crate::btree::node::{
    MAX_KEY_SIZE, MAX_VALUE_SIZE, NODE_HEADER_SIZE, Node, NodeError, NodeType, SLOT_SIZE,
};
use crate::config::TreeConfig;
use crate::page::{PAGE_SIZE, PagePtr};
use crate::store::{PageStore, StoreError};

/// A B+tree rooted at an optional page.
///
/// `root == None` is the empty tree.
pub struct BTree<S: PageStore> {
    store: S,
    root: Option<PagePtr>,
    config: TreeConfig,
}

/// A freshly allocated child and the first key it covers.
pub(super) struct Link {
    pub(super) ptr: PagePtr,
    pub(super) first_key: Vec<u8>,
}

impl<S: PageStore> BTree<S> {
    /// Create a new empty tree.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_config(store, None, TreeConfig::default())
    }

    /// Attach to an existing tree.
    #[must_use]
    pub fn open(store: S, root: Option<PagePtr>) -> Self {
        Self::with_config(store, root, TreeConfig::default())
    }

    /// Attach to an existing tree with a custom configuration.
    #[must_use]
    pub const fn with_config(store: S, root: Option<PagePtr>, config: TreeConfig) -> Self {
        Self {
            store,
            root,
            config,
        }
    }

    /// The current root. Callers publish this after a successful mutation.
    #[must_use]
    pub const fn root(&self) -> Option<PagePtr> {
        self.root
    }

    /// Whether the tree holds no entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// The underlying page store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access to the underlying page store.
    pub const fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Consume the tree and return its page store.
    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }

    /// Look up a value by key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        self.get_at(self.root, key)
    }

    /// Look up a value in the version of the tree rooted at `root`.
    ///
    /// `root` must still be readable, i.e. the store must not have reclaimed
    /// the pages it references.
    pub fn get_at(
        &self,
        root: Option<PagePtr>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, BTreeError> {
        let Some(mut ptr) = root else {
            return Ok(None);
        };

        loop {
            let node = self.read_node(ptr)?;
            match node.node_type() {
                NodeType::Internal => ptr = node.child(node.lookup_le(key)),
                NodeType::Leaf => {
                    return Ok(node.search(key).ok().map(|idx| node.value(idx).to_vec()));
                }
            }
        }
    }

    /// Insert or update a key-value pair.
    ///
    /// Returns the old value if updating, None if inserting.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        check_entry(key, value)?;

        let Some(root_ptr) = self.root else {
            let mut leaf = Node::scratch();
            leaf.set_header(NodeType::Leaf, 1);
            leaf.append_kv(0, PagePtr::NULL, key, value);
            let ptr = self.allocate(&leaf)?;
            tracing::debug!("created root leaf {ptr}");
            self.root = Some(ptr);
            return Ok(None);
        };

        let root = self.read_node(root_ptr)?;
        let mut superseded = vec![root_ptr];
        let mut old_value = None;
        let updated = self.insert_into(&root, key, value, &mut superseded, &mut old_value)?;
        let new_root = self.allocate_root(updated)?;

        self.commit(Some(new_root), superseded);
        Ok(old_value)
    }

    /// Depth of the tree: 0 when empty, 1 for a single leaf.
    pub fn height(&self) -> Result<usize, BTreeError> {
        let mut height = 0;
        let mut next = self.root;
        while let Some(ptr) = next {
            height += 1;
            let node = self.read_node(ptr)?;
            next = match node.node_type() {
                NodeType::Internal => Some(node.child(0)),
                NodeType::Leaf => None,
            };
        }
        Ok(height)
    }

    /// Insert into the subtree rooted at `node`, returning its replacement.
    ///
    /// The replacement may exceed a page; the caller splits it.
    fn insert_into(
        &mut self,
        node: &Node,
        key: &[u8],
        value: &[u8],
        superseded: &mut Vec<PagePtr>,
        old_value: &mut Option<Vec<u8>>,
    ) -> Result<Node, BTreeError> {
        match node.node_type() {
            NodeType::Leaf => match node.search(key) {
                Ok(idx) => {
                    *old_value = Some(node.value(idx).to_vec());
                    Ok(update_record(node, idx, key, value))
                }
                Err(idx) => Ok(insert_record(node, idx, PagePtr::NULL, key, value)),
            },
            NodeType::Internal => {
                let idx = node.lookup_le(key);
                let child_ptr = node.child(idx);
                let child = self.read_node(child_ptr)?;
                let updated = self.insert_into(&child, key, value, superseded, old_value)?;
                superseded.push(child_ptr);

                let parts = split(updated);
                let links = self.allocate_links(&parts)?;
                Ok(replace_links(node, idx, 1, &links))
            }
        }
    }

    /// Dereference and decode a page.
    pub(super) fn read_node(&self, ptr: PagePtr) -> Result<Node, BTreeError> {
        load_node(&self.store, ptr)
    }

    /// Allocate a page for a node that fits in a page.
    pub(super) fn allocate(&mut self, node: &Node) -> Result<PagePtr, BTreeError> {
        let page = node.to_page();
        self.store.allocate(&page).map_err(|e| {
            tracing::warn!("page allocation failed: {e}");
            BTreeError::Store(e)
        })
    }

    /// Allocate a rebuilt root, growing the tree by one level if it has to
    /// be split.
    pub(super) fn allocate_root(&mut self, node: Node) -> Result<PagePtr, BTreeError> {
        let mut parts = split(node);
        if parts.len() == 1 {
            let node = parts.swap_remove(0);
            return self.allocate(&node);
        }

        let links = self.allocate_links(&parts)?;
        let mut root = Node::scratch();
        root.set_header(NodeType::Internal, links.len() as u16);
        for (i, link) in links.iter().enumerate() {
            root.append_kv(i, link.ptr, &link.first_key, b"");
        }
        let ptr = self.allocate(&root)?;
        tracing::debug!("root split into {} children, new root {ptr}", links.len());
        Ok(ptr)
    }

    /// Allocate each node and pair it with its first key.
    pub(super) fn allocate_links(&mut self, nodes: &[Node]) -> Result<Vec<Link>, BTreeError> {
        nodes
            .iter()
            .map(|node| {
                let ptr = self.allocate(node)?;
                Ok(Link {
                    ptr,
                    first_key: node.key(0).to_vec(),
                })
            })
            .collect()
    }

    /// Publish a new root and release the pages it no longer references.
    ///
    /// The operation has succeeded once the root is published, so a page
    /// the store refuses to release is logged and leaked rather than
    /// reported to the caller.
    pub(super) fn commit(&mut self, new_root: Option<PagePtr>, superseded: Vec<PagePtr>) {
        self.root = new_root;
        for ptr in superseded {
            if let Err(e) = self.store.deallocate(ptr) {
                tracing::warn!("failed to release superseded page {ptr}: {e}");
            }
        }
    }

    pub(super) const fn merge_threshold(&self) -> usize {
        self.config.merge_threshold
    }
}

/// Dereference and decode a page from a store.
pub(super) fn load_node<S: PageStore + ?Sized>(store: &S, ptr: PagePtr) -> Result<Node, BTreeError> {
    if ptr.is_null() {
        return Err(BTreeError::Store(StoreError::NullPointer));
    }
    let page = store.get(ptr).map_err(|e| {
        tracing::warn!("failed to read page {ptr}: {e}");
        BTreeError::Store(e)
    })?;
    Ok(Node::from_page(page)?)
}

/// Reject entries that could never fit the page layout.
fn check_entry(key: &[u8], value: &[u8]) -> Result<(), BTreeError> {
    if key.len() > MAX_KEY_SIZE {
        return Err(BTreeError::InvalidEntry(EntryError::KeyTooLarge(key.len())));
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(BTreeError::InvalidEntry(EntryError::ValueTooLarge(
            value.len(),
        )));
    }
    Ok(())
}

/// Reject keys that could never be stored.
pub(super) fn check_key(key: &[u8]) -> Result<(), BTreeError> {
    check_entry(key, b"")
}

/// Copy of `old` with a new record at `idx`.
pub(super) fn insert_record(
    old: &Node,
    idx: usize,
    ptr: PagePtr,
    key: &[u8],
    value: &[u8],
) -> Node {
    let n = old.len();
    let mut new = Node::scratch();
    new.set_header(old.node_type(), (n + 1) as u16);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, ptr, key, value);
    new.append_range(old, idx + 1, idx, n - idx);
    new
}

/// Copy of leaf `old` with the value at `idx` replaced.
fn update_record(old: &Node, idx: usize, key: &[u8], value: &[u8]) -> Node {
    let n = old.len();
    let mut new = Node::scratch();
    new.set_header(old.node_type(), n as u16);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, old.child(idx), key, value);
    new.append_range(old, idx + 1, idx + 1, n - idx - 1);
    new
}

/// Copy of `old` without the record at `idx`.
pub(super) fn remove_record(old: &Node, idx: usize) -> Node {
    let n = old.len();
    let mut new = Node::scratch();
    new.set_header(old.node_type(), (n - 1) as u16);
    new.append_range(old, 0, 0, idx);
    new.append_range(old, idx, idx + 1, n - idx - 1);
    new
}

/// Copy of internal node `old` with the `removed` links starting at `idx`
/// replaced by `links`.
pub(super) fn replace_links(old: &Node, idx: usize, removed: usize, links: &[Link]) -> Node {
    let n = old.len();
    assert!(idx + removed <= n, "replaced links out of range");
    let mut new = Node::scratch();
    new.set_header(NodeType::Internal, (n - removed + links.len()) as u16);
    new.append_range(old, 0, 0, idx);
    for (i, link) in links.iter().enumerate() {
        new.append_kv(idx + i, link.ptr, &link.first_key, b"");
    }
    new.append_range(old, idx + links.len(), idx + removed, n - idx - removed);
    new
}

/// Split a node into one to three nodes that each fit in a page.
pub(super) fn split(node: Node) -> Vec<Node> {
    if node.fits_page() {
        return vec![node];
    }

    let (left, right) = split_two(&node);
    if left.fits_page() {
        tracing::trace!(
            "split {:?} node of {} bytes in two",
            node.node_type(),
            node.encoded_size()
        );
        return vec![left, right];
    }

    let (left_left, middle) = split_two(&left);
    assert!(left_left.fits_page(), "three-way split left an oversized node");
    tracing::trace!(
        "split {:?} node of {} bytes in three",
        node.node_type(),
        node.encoded_size()
    );
    vec![left_left, middle, right]
}

/// Split `old` in two around the byte midpoint. The right node always fits
/// in a page; the left one may still be oversized.
fn split_two(old: &Node) -> (Node, Node) {
    let n = old.len();
    assert!(n >= 2, "cannot split a node with {n} keys");

    let left_bytes =
        |count: usize| NODE_HEADER_SIZE + SLOT_SIZE * count + usize::from(old.offset(count));
    let right_bytes = |count: usize| old.encoded_size() - left_bytes(count) + NODE_HEADER_SIZE;

    let half = (old.encoded_size() + NODE_HEADER_SIZE) / 2;
    let mut n_left = 1;
    while n_left < n - 1 && left_bytes(n_left) < half {
        n_left += 1;
    }
    while n_left > 1 && left_bytes(n_left) > PAGE_SIZE {
        n_left -= 1;
    }
    while right_bytes(n_left) > PAGE_SIZE {
        n_left += 1;
    }
    assert!(n_left < n, "split left nothing for the right node");

    let node_type = old.node_type();
    let n_right = n - n_left;

    let mut left = Node::scratch();
    left.set_header(node_type, n_left as u16);
    left.append_range(old, 0, 0, n_left);

    let mut right = Node::with_len(PAGE_SIZE);
    right.set_header(node_type, n_right as u16);
    right.append_range(old, 0, n_left, n_right);

    (left, right)
}

/// Reasons an entry is rejected before any page is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryError {
    /// Key longer than [`MAX_KEY_SIZE`].
    KeyTooLarge(usize),
    /// Value longer than [`MAX_VALUE_SIZE`].
    ValueTooLarge(usize),
}

impl std::fmt::Display for EntryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyTooLarge(len) => {
                write!(f, "key too large: {len} bytes (max {MAX_KEY_SIZE})")
            }
            Self::ValueTooLarge(len) => {
                write!(f, "value too large: {len} bytes (max {MAX_VALUE_SIZE})")
            }
        }
    }
}

/// Errors that can occur during B-tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// The key or value violates the size limits.
    InvalidEntry(EntryError),
    /// A page did not decode into a valid node.
    Node(NodeError),
    /// The page store failed.
    Store(StoreError),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEntry(e) => write!(f, "invalid entry: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidEntry(_) => None,
            Self::Node(e) => Some(e),
            Self::Store(e) => Some(e),
        }
    }
}

impl From<NodeError> for BTreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<StoreError> for BTreeError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<EntryError> for BTreeError {
    fn from(e: EntryError) -> Self {
        Self::InvalidEntry(e)
    }
}


/// Runs the tree against a page store backed by a real file.
#[cfg(test)]
mod file_store_tests {
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::Path;

    use super::{BTree, BTreeError};
    use crate::page::{PAGE_SIZE, Page, PagePtr};
    use crate::store::{PageStore, StoreError};

    /// Pages live at `ptr * PAGE_SIZE`; page 0 is never handed out so that the
    /// null pointer stays unused. Released pages are reused last-in first-out.
    struct FileStore {
        file: File,
        page_count: u64,
        free: Vec<PagePtr>,
    }

    impl FileStore {
        fn create(path: &Path) -> Result<Self, StoreError> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            file.set_len(PAGE_SIZE as u64)?;
            Ok(Self {
                file,
                page_count: 1,
                free: Vec::new(),
            })
        }

        fn open(path: &Path) -> Result<Self, StoreError> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            let page_count = file.metadata()?.len() / PAGE_SIZE as u64;
            Ok(Self {
                file,
                page_count,
                free: Vec::new(),
            })
        }

        fn sync(&self) -> Result<(), StoreError> {
            self.file.sync_all()?;
            Ok(())
        }

        const fn offset(ptr: PagePtr) -> u64 {
            ptr.get() * PAGE_SIZE as u64
        }
    }

    impl PageStore for FileStore {
        fn get(&self, ptr: PagePtr) -> Result<Page, StoreError> {
            if ptr.is_null() {
                return Err(StoreError::NullPointer);
            }
            if ptr.get() >= self.page_count {
                return Err(StoreError::PageNotFound(ptr));
            }
            let mut page = Page::new();
            let mut file = &self.file;
            file.seek(SeekFrom::Start(Self::offset(ptr)))?;
            file.read_exact(page.as_bytes_mut())?;
            Ok(page)
        }

        fn allocate(&mut self, page: &Page) -> Result<PagePtr, StoreError> {
            let ptr = self.free.pop().unwrap_or_else(|| {
                let ptr = PagePtr(self.page_count);
                self.page_count += 1;
                ptr
            });
            self.file.seek(SeekFrom::Start(Self::offset(ptr)))?;
            self.file.write_all(page.as_bytes())?;
            Ok(ptr)
        }

        fn deallocate(&mut self, ptr: PagePtr) -> Result<(), StoreError> {
            if ptr.is_null() || ptr.get() >= self.page_count {
                return Err(StoreError::PageNotFound(ptr));
            }
            self.free.push(ptr);
            Ok(())
        }
    }

    fn key(i: u32) -> Vec<u8> {
        format!("user:{i:06}").into_bytes()
    }

    fn value(i: u32) -> Vec<u8> {
        format!("profile-{i}-").repeat(8).into_bytes()
    }

    #[test]
    fn test_file_store_roundtrip_and_reopen() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("tree.pages");

        let root = {
            let store = FileStore::create(&path).expect("create store");
            let mut tree = BTree::new(store);

            for i in 0..1500u32 {
                tree.insert(&key(i), &value(i)).expect("insert");
            }
            for i in (0..1500u32).filter(|i| i % 2 == 1) {
                assert!(tree.delete(&key(i)).expect("delete"));
            }
            assert_eq!(tree.count().expect("count"), 750);

            tree.store().sync().expect("sync");
            tree.root()
        };

        let store = FileStore::open(&path).expect("open store");
        let tree = BTree::open(store, root);

        for i in 0..1500u32 {
            let expected = (i % 2 == 0).then(|| value(i));
            assert_eq!(tree.get(&key(i)).expect("get"), expected, "key {i}");
        }

        let keys: Vec<Vec<u8>> = tree
            .iter_from(&key(1000))
            .expect("iter_from")
            .map(|entry| entry.expect("entry").0)
            .collect();
        assert_eq!(keys.len(), 250);
        assert_eq!(keys.first(), Some(&key(1000)));
    }

    #[test]
    fn test_file_store_reuses_released_pages() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("tree.pages");
        let mut tree = BTree::new(FileStore::create(&path).expect("create store"));

        for round in 0..5u32 {
            for i in 0..400u32 {
                tree.insert(&key(i), &value(i + round)).expect("insert");
            }
            for i in 0..400u32 {
                assert!(tree.delete(&key(i)).expect("delete"));
            }
            assert!(tree.is_empty());
        }

        let store = tree.into_store();
        let peak = store.page_count;
        assert_eq!(store.free.len() as u64, peak - 1);

        // A second tree over the same store grows no further than the first.
        let mut tree = BTree::new(store);
        for i in 0..400u32 {
            tree.insert(&key(i), &value(i)).expect("insert");
        }
        assert!(tree.store().page_count <= peak);
    }

    #[test]
    fn test_file_store_rejects_unknown_pages() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("tree.pages");
        let tree = BTree::open(FileStore::create(&path).expect("create store"), Some(PagePtr(9)));

        let err = tree.get(b"anything").expect_err("page 9 was never written");
        assert!(matches!(
            err,
            BTreeError::Store(StoreError::PageNotFound(PagePtr(9)))
        ));
    }
}
