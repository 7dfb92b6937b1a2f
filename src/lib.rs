#![cfg_attr(
    test,
    deny(
        missing_docs,
        future_incompatible,
        nonstandard_style,
        rust_2018_idioms,
        missing_copy_implementations,
        trivial_casts,
        trivial_numeric_casts,
        unused_qualifications,
    )
)]
#![cfg_attr(test, deny(
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::explicit_into_iter_loop,
    clippy::explicit_iter_loop,
    clippy::expl_impl_clone_on_copy,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_arithmetic,
    clippy::get_unwrap,
    clippy::if_not_else,
    clippy::inline_always,
    clippy::invalid_upcast_comparisons,
    clippy::manual_find_map,
    clippy::map_entry,
    clippy::map_flatten,
    clippy::match_like_matches_macro,
    clippy::maybe_infinite_iter,
    clippy::mem_forget,
    clippy::mut_mut,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::non_ascii_literal,
    clippy::path_buf_push_overwrite,
    clippy::redundant_closure_for_method_calls,
    clippy::string_add,
    clippy::string_add_assign,
    clippy::type_repetition_in_bounds,
    clippy::unicode_not_nfc,
    clippy::unimplemented,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding,
    clippy::wildcard_dependencies,
))]
#![cfg_attr(
    test,
    warn(
        clippy::missing_const_for_fn,
        clippy::multiple_crate_versions,
        clippy::wildcard_enum_match_arm,
    )
)]

//! A lock-free concurrent hash trie (Ctrie) with constant-time,
//! linearizable snapshots.
//!
//! [`Ctrie`] is a 64-way hash array mapped trie whose only mutable cells
//! are indirection nodes, each swapped with a generation-aware compare
//! and swap (GCAS). Taking a [`Ctrie::snapshot`] does not copy anything
//! up front: it swaps the root for a copy stamped with a new generation
//! (using an RDCSS on the root), and later writers lazily copy exactly the
//! path they touch when they notice that a node belongs to an older
//! generation.
//!
//! Iteration always runs over a read-only snapshot, so it observes a
//! single consistent point in time no matter how many threads keep
//! writing to the original. An iteration can be stopped from another
//! thread through a [`CancelSignal`].
//!
//! Keys may be of any hashable type, and the hash function is pluggable
//! through a [`BuildHasher`]. By default, keys are hashed with FNV-1a.
//!
//! This is an unordered structure. If you need ordered range scans, a
//! concurrent B+ tree is a better fit.

#[cfg(not(feature = "fault_injection"))]
#[inline]
const fn debug_delay() -> bool {
    false
}

/// This function is useful for inducing random jitter into
/// our atomic operations, shaking out more possible
/// interleavings quickly. It gets fully eliminated by the
/// compiler in non-test code.
#[cfg(feature = "fault_injection")]
fn debug_delay() -> bool {
    use rand::{thread_rng, Rng};

    let mut rng = thread_rng();

    match rng.gen_range(0..100) {
        0..=98 => false,
        _ => true,
    }
}

mod atomic;
mod bits;
mod engine;
mod gcas;
mod iter;
mod list;
mod node;
#[cfg(feature = "serde")]
mod serde;

use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use ebr::Ebr;
use fnv::FnvBuildHasher;

use crate::atomic::{AtomicArc, Deferred};
use crate::node::{Generation, INode, Root, SNode};

pub use crate::iter::{CancelSignal, Canceled, Iter};

/// Whether a snapshot may be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// All mutating methods panic. Lookups never copy nodes.
    ReadOnly,
    /// The snapshot evolves independently from the trie it was taken from.
    ReadWrite,
}

/// A lock-free concurrent hash trie.
///
/// Note that this structure is `Send` but NOT `Sync`,
/// despite being a lock-free trie. This is because the
/// inner reclamation system, provided by the `ebr` crate
/// completely avoids atomic operations in its hot path
/// for efficiency. If you want to share a [`Ctrie`]
/// between threads, simply clone it, and this will set up
/// a new efficient thread-local memory reclamation state.
/// Clones are handles to the same trie, while
/// [`Ctrie::snapshot`] creates a new, independent one.
///
/// Values are returned by cloning them, so that no node
/// ever needs to be locked or pinned by the caller. Types
/// that are expensive to clone can be wrapped in an `Arc`.
///
/// The `LOCAL_GC_BUFFER_SIZE` const generic must be greater than 0.
/// This controls the epoch-based reclamation granularity.
/// Garbage is placed into fixed-size arrays, and garbage collection
/// only happens after this array fills up and a final timestamp is
/// assigned to it. Lower values will cause replaced nodes to be dropped
/// more quickly, but the efficiency will be lower.
///
/// # Examples
///
/// ```
/// use ctrie::{Ctrie, Mode};
///
/// let trie = Ctrie::<&str, usize>::new();
///
/// // insert and remove atomically return the last value, if it was set,
/// // similarly to a HashMap
/// assert_eq!(trie.insert("a", 1), None);
/// assert_eq!(trie.insert("a", 2), Some(1));
/// assert_eq!(trie.get("a"), Some(2));
///
/// // snapshots are O(1) and fully isolated from later writes
/// let snapshot = trie.snapshot(Mode::ReadOnly);
/// trie.insert("b", 3);
/// assert_eq!(trie.remove("a"), Some(2));
///
/// assert_eq!(snapshot.get("a"), Some(2));
/// assert_eq!(snapshot.get("b"), None);
/// assert_eq!(snapshot.len(), 1);
/// ```
#[derive(Clone)]
pub struct Ctrie<K, V, S = FnvBuildHasher, const LOCAL_GC_BUFFER_SIZE: usize = 128>
where
    K: 'static + Hash + Eq + Clone + Send + Sync,
    V: 'static + Clone + Send + Sync,
    S: BuildHasher + Clone,
{
    // epoch-based reclamation
    ebr: Ebr<Deferred<K, V>, LOCAL_GC_BUFFER_SIZE>,
    // the trie structure, separate from the ebr state
    // so that a guard borrowed from `ebr` can be passed
    // into methods on `inner`.
    inner: Arc<Inner<K, V, S, LOCAL_GC_BUFFER_SIZE>>,
}

struct Inner<K, V, S, const LOCAL_GC_BUFFER_SIZE: usize> {
    root: AtomicArc<Root<K, V>>,
    read_only: bool,
    hasher: S,
}

impl<K, V, S, const LOCAL_GC_BUFFER_SIZE: usize> Inner<K, V, S, LOCAL_GC_BUFFER_SIZE> {
    fn new(root: Arc<INode<K, V>>, read_only: bool, hasher: S) -> Inner<K, V, S, LOCAL_GC_BUFFER_SIZE> {
        Inner {
            root: AtomicArc::new(Arc::new(Root::INode(root))),
            read_only,
            hasher,
        }
    }

    fn hash<Q>(&self, key: &Q) -> u64
    where
        S: BuildHasher,
        Q: Hash + ?Sized,
    {
        self.hasher.hash_one(key)
    }
}

impl<K, V> Ctrie<K, V>
where
    K: 'static + Hash + Eq + Clone + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    /// Creates an empty trie that hashes keys with FNV-1a.
    pub fn new() -> Ctrie<K, V> {
        Ctrie::with_hasher(FnvBuildHasher::default())
    }
}

impl<K, V, S, const LOCAL_GC_BUFFER_SIZE: usize> Default for Ctrie<K, V, S, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Hash + Eq + Clone + Send + Sync,
    V: 'static + Clone + Send + Sync,
    S: BuildHasher + Clone + Default,
{
    fn default() -> Ctrie<K, V, S, LOCAL_GC_BUFFER_SIZE> {
        Ctrie::with_hasher(S::default())
    }
}

impl<K, V, S, const LOCAL_GC_BUFFER_SIZE: usize> fmt::Debug for Ctrie<K, V, S, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + fmt::Debug + Hash + Eq + Clone + Send + Sync,
    V: 'static + fmt::Debug + Clone + Send + Sync,
    S: BuildHasher + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ctrie ")?;
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S, const LOCAL_GC_BUFFER_SIZE: usize> Ctrie<K, V, S, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Hash + Eq + Clone + Send + Sync,
    V: 'static + Clone + Send + Sync,
    S: BuildHasher + Clone,
{
    /// Creates an empty trie that uses `hasher` to hash keys.
    ///
    /// # Examples
    /// ```
    /// use std::collections::hash_map::RandomState;
    ///
    /// let trie = ctrie::Ctrie::<u64, u64, RandomState>::with_hasher(RandomState::new());
    /// trie.insert(1, 1);
    /// assert_eq!(trie.get(&1), Some(1));
    /// ```
    pub fn with_hasher(hasher: S) -> Ctrie<K, V, S, LOCAL_GC_BUFFER_SIZE> {
        assert!(
            LOCAL_GC_BUFFER_SIZE > 0,
            "LOCAL_GC_BUFFER_SIZE must be greater than 0"
        );

        Ctrie {
            ebr: Ebr::default(),
            inner: Arc::new(Inner::new(INode::empty(Generation::new()), false, hasher)),
        }
    }

    fn assert_writable(&self) {
        assert!(
            !self.inner.read_only,
            "cannot modify a read-only snapshot"
        );
    }

    /// Returns `true` if this trie is a read-only snapshot.
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// Atomically get a value out of the trie that is associated with this key.
    ///
    /// # Examples
    /// ```
    /// let trie = ctrie::Ctrie::<Vec<u8>, usize>::new();
    ///
    /// trie.insert(b"foo".to_vec(), 1);
    ///
    /// assert_eq!(trie.get(&b"foo"[..]), Some(1));
    /// assert_eq!(trie.get(&b"bar"[..]), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.inner.hash(key);

        loop {
            let mut guard = self.ebr.pin();
            let root = self.inner.read_root(false, &mut guard);
            if let Ok(ret) = self
                .inner
                .lookup_at(&root, key, hash, 0, None, &root.gen, &mut guard)
            {
                return ret;
            }
        }
    }

    /// Returns `true` if the trie holds a value for this key.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Atomically insert a key-value pair into the trie, returning the
    /// previous value associated with this key if one existed.
    ///
    /// # Panics
    ///
    /// Panics if this trie is a read-only snapshot.
    ///
    /// # Examples
    ///
    /// ```
    /// let trie = ctrie::Ctrie::<usize, usize>::new();
    ///
    /// assert_eq!(trie.insert(1, 1), None);
    /// assert_eq!(trie.insert(1, 2), Some(1));
    /// ```
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.assert_writable();

        let hash = self.inner.hash(&key);
        let snode = Arc::new(SNode { key, value, hash });

        loop {
            let mut guard = self.ebr.pin();
            let root = self.inner.read_root(false, &mut guard);
            if let Ok(ret) = self
                .inner
                .insert_at(&root, &snode, 0, None, &root.gen, &mut guard)
            {
                return ret;
            }
        }
    }

    /// Atomically remove the value associated with this key from the
    /// trie, returning it if it existed.
    ///
    /// # Panics
    ///
    /// Panics if this trie is a read-only snapshot.
    ///
    /// # Examples
    ///
    /// ```
    /// let trie = ctrie::Ctrie::<usize, usize>::new();
    ///
    /// assert_eq!(trie.remove(&1), None);
    /// assert_eq!(trie.insert(1, 1), None);
    /// assert_eq!(trie.remove(&1), Some(1));
    /// ```
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.assert_writable();

        let hash = self.inner.hash(key);

        loop {
            let mut guard = self.ebr.pin();
            let root = self.inner.read_root(false, &mut guard);
            if let Ok(ret) = self
                .inner
                .remove_at(&root, key, hash, 0, None, &root.gen, &mut guard)
            {
                return ret;
            }
        }
    }

    /// Take a point-in-time snapshot of the trie in O(1).
    ///
    /// A [`Mode::ReadOnly`] snapshot can only be read; every mutating
    /// method panics. A [`Mode::ReadWrite`] snapshot is a new trie that
    /// starts out with the same contents and is then modified
    /// independently of the original. In both cases the nodes are shared
    /// until someone writes to them.
    ///
    /// # Examples
    /// ```
    /// use ctrie::{Ctrie, Mode};
    ///
    /// let trie = Ctrie::<&str, &str>::new();
    /// trie.insert("foo", "bar");
    ///
    /// let fork = trie.snapshot(Mode::ReadWrite);
    /// fork.insert("foo", "baz");
    ///
    /// assert_eq!(trie.get("foo"), Some("bar"));
    /// assert_eq!(fork.get("foo"), Some("baz"));
    /// ```
    pub fn snapshot(&self, mode: Mode) -> Ctrie<K, V, S, LOCAL_GC_BUFFER_SIZE> {
        if self.inner.read_only && mode == Mode::ReadOnly {
            return self.clone();
        }

        let root = {
            let mut guard = self.ebr.pin();
            self.inner.snapshot_root(mode, &mut guard)
        };

        Ctrie {
            ebr: self.ebr.clone(),
            inner: Arc::new(Inner::new(
                root,
                mode == Mode::ReadOnly,
                self.inner.hasher.clone(),
            )),
        }
    }

    /// Shorthand for `snapshot(Mode::ReadOnly)`.
    pub fn read_only_snapshot(&self) -> Ctrie<K, V, S, LOCAL_GC_BUFFER_SIZE> {
        self.snapshot(Mode::ReadOnly)
    }

    /// Atomically remove every key. Snapshots taken before the call keep
    /// their contents.
    ///
    /// # Panics
    ///
    /// Panics if this trie is a read-only snapshot.
    pub fn clear(&self) {
        self.assert_writable();

        let mut guard = self.ebr.pin();
        self.inner.clear(&mut guard);
    }

    /// Iterate over a read-only snapshot of the trie, taken when this
    /// method is called. Entries come out in no particular order.
    ///
    /// # Examples
    /// ```
    /// let trie: ctrie::Ctrie<usize, usize> = (0..100).map(|i| (i, i * 2)).collect();
    ///
    /// let iter = trie.iter();
    ///
    /// // not visible to the iterator
    /// trie.insert(1000, 0);
    ///
    /// let mut keys: Vec<usize> = iter.map(|(k, _v)| k).collect();
    /// keys.sort_unstable();
    /// assert_eq!(keys, (0..100).collect::<Vec<_>>());
    /// ```
    pub fn iter(&self) -> Iter<K, V, S, LOCAL_GC_BUFFER_SIZE> {
        Iter::new(self.read_only_snapshot(), None)
    }

    /// Like [`Ctrie::iter`], but the iteration stops as soon as `cancel`
    /// is triggered. [`Iter::status`] reports whether that happened.
    pub fn iter_with_cancel(&self, cancel: &CancelSignal) -> Iter<K, V, S, LOCAL_GC_BUFFER_SIZE> {
        Iter::new(self.read_only_snapshot(), Some(cancel.clone()))
    }

    /// Feed every entry of a snapshot to `f`, returning `Err(Canceled)`
    /// if `cancel` fires before the traversal completes.
    ///
    /// # Examples
    /// ```
    /// let trie: ctrie::Ctrie<usize, usize> = (0..10).map(|i| (i, i)).collect();
    /// let cancel = ctrie::CancelSignal::new();
    ///
    /// let mut seen = 0;
    /// let res = trie.try_for_each_entry(Some(&cancel), |_k, _v| {
    ///     seen += 1;
    ///     if seen == 3 {
    ///         cancel.cancel();
    ///     }
    /// });
    ///
    /// assert_eq!(res, Err(ctrie::Canceled));
    /// assert_eq!(seen, 3);
    /// ```
    pub fn try_for_each_entry<F>(&self, cancel: Option<&CancelSignal>, mut f: F) -> Result<(), Canceled>
    where
        F: FnMut(K, V),
    {
        let mut iter = Iter::new(self.read_only_snapshot(), cancel.cloned());
        for (k, v) in &mut iter {
            f(k, v);
        }
        iter.status()
    }

    /// The number of entries, counted by traversing a snapshot. This is
    /// O(n); no count is maintained on the write path.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns `true` if a snapshot of the trie has no entries.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl<K, V, S, const LOCAL_GC_BUFFER_SIZE: usize> FromIterator<(K, V)> for Ctrie<K, V, S, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Hash + Eq + Clone + Send + Sync,
    V: 'static + Clone + Send + Sync,
    S: BuildHasher + Clone + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let trie = Ctrie::default();

        for (k, v) in iter {
            trie.insert(k, v);
        }

        trie
    }
}

impl<K, V, S, const LOCAL_GC_BUFFER_SIZE: usize> Extend<(K, V)> for Ctrie<K, V, S, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Hash + Eq + Clone + Send + Sync,
    V: 'static + Clone + Send + Sync,
    S: BuildHasher + Clone,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl<'a, K, V, S, const LOCAL_GC_BUFFER_SIZE: usize> IntoIterator for &'a Ctrie<K, V, S, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Hash + Eq + Clone + Send + Sync,
    V: 'static + Clone + Send + Sync,
    S: BuildHasher + Clone,
{
    type Item = (K, V);
    type IntoIter = Iter<K, V, S, LOCAL_GC_BUFFER_SIZE>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

const fn _test_impls() {
    const fn send<T: Send>() {}
    const fn clone<T: Clone>() {}
    send::<Ctrie<Vec<u8>, usize>>();
    clone::<Ctrie<Vec<u8>, usize>>();
}

#[test]
fn basic_trie() {
    let trie = Ctrie::<usize, usize>::new();

    let n = 4096;
    for i in 0..n {
        assert_eq!(trie.get(&i), None);
        assert_eq!(trie.insert(i, i), None);
        assert_eq!(trie.get(&i), Some(i), "failed to get key {i}");
    }

    let mut seen: Vec<usize> = trie.iter().map(|(k, v)| {
        assert_eq!(k, v);
        k
    }).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..n).collect::<Vec<_>>());
    assert_eq!(trie.len(), n);

    for i in 0..n {
        assert_eq!(trie.insert(i, i + 1), Some(i));
    }

    for i in (0..n).step_by(2) {
        assert_eq!(trie.remove(&i), Some(i + 1), "failed to remove key {i}");
        assert_eq!(trie.remove(&i), None);
    }

    for i in 0..n {
        let expected = if i % 2 == 0 { None } else { Some(i + 1) };
        assert_eq!(trie.get(&i), expected, "wrong value for key {i}");
    }

    assert_eq!(trie.len(), n / 2);
}

#[test]
fn byte_keys() {
    let trie = Ctrie::<Vec<u8>, &'static str>::new();

    trie.insert(b"foo".to_vec(), "bar");
    trie.insert(b"".to_vec(), "empty");

    assert_eq!(trie.get(&b"foo"[..]), Some("bar"));
    assert_eq!(trie.get(&b""[..]), Some("empty"));
    assert_eq!(trie.get(&b"fo"[..]), None);
    assert!(trie.contains_key(&b"foo"[..]));
    assert_eq!(trie.remove(&b"foo"[..]), Some("bar"));
    assert!(!trie.contains_key(&b"foo"[..]));
}

#[test]
#[should_panic(expected = "read-only")]
fn read_only_insert_panics() {
    let trie = Ctrie::<usize, usize>::new();
    trie.read_only_snapshot().insert(1, 1);
}

#[test]
#[should_panic(expected = "read-only")]
fn read_only_remove_panics() {
    let trie = Ctrie::<usize, usize>::new();
    trie.insert(1, 1);
    trie.read_only_snapshot().remove(&1);
}

#[test]
#[should_panic(expected = "read-only")]
fn read_only_clear_panics() {
    let trie = Ctrie::<usize, usize>::new();
    trie.read_only_snapshot().clear();
}

#[test]
fn debug_lists_entries() {
    let trie = Ctrie::<usize, usize>::new();
    trie.insert(7, 8);
    assert_eq!(format!("{trie:?}"), "Ctrie {7: 8}");
}
