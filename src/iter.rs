use std::hash::{BuildHasher, Hash};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use fnv::FnvBuildHasher;
use tracing::trace;

use crate::list::List;
use crate::node::{Branch, INode, Main, MainKind, SNode};
use crate::Ctrie;

/// A flag that stops iterations from another thread. Clones share the
/// same flag.
///
/// # Examples
/// ```
/// let trie: ctrie::Ctrie<usize, usize> = (0..10).map(|i| (i, i)).collect();
/// let cancel = ctrie::CancelSignal::new();
///
/// let mut iter = trie.iter_with_cancel(&cancel);
/// assert!(iter.next().is_some());
///
/// cancel.cancel();
/// assert_eq!(iter.next(), None);
/// assert_eq!(iter.status(), Err(ctrie::Canceled));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    /// A signal that has not fired yet.
    pub fn new() -> CancelSignal {
        CancelSignal::default()
    }

    /// Fire the signal. Every iteration observing it stops before its
    /// next entry. There is no way to reset it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether [`CancelSignal::cancel`] has been called on this signal or
    /// any of its clones.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Returned when an iteration was stopped by its [`CancelSignal`] before
/// visiting every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("iteration was canceled before it completed")]
pub struct Canceled;

enum Cursor<K, V> {
    INode(Arc<INode<K, V>>),
    Branches { main: Arc<Main<K, V>>, next: usize },
    Entries(List<Arc<SNode<K, V>>>),
}

/// An iterator over the entries of a read-only snapshot, in no particular
/// order. Created by [`Ctrie::iter`] and [`Ctrie::iter_with_cancel`].
pub struct Iter<K, V, S = FnvBuildHasher, const LOCAL_GC_BUFFER_SIZE: usize = 128>
where
    K: 'static + Hash + Eq + Clone + Send + Sync,
    V: 'static + Clone + Send + Sync,
    S: BuildHasher + Clone,
{
    snapshot: Ctrie<K, V, S, LOCAL_GC_BUFFER_SIZE>,
    stack: Vec<Cursor<K, V>>,
    cancel: Option<CancelSignal>,
    canceled: bool,
}

impl<K, V, S, const LOCAL_GC_BUFFER_SIZE: usize> Iter<K, V, S, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Hash + Eq + Clone + Send + Sync,
    V: 'static + Clone + Send + Sync,
    S: BuildHasher + Clone,
{
    pub(crate) fn new(
        snapshot: Ctrie<K, V, S, LOCAL_GC_BUFFER_SIZE>,
        cancel: Option<CancelSignal>,
    ) -> Iter<K, V, S, LOCAL_GC_BUFFER_SIZE> {
        debug_assert!(snapshot.is_read_only());

        let mut guard = snapshot.ebr.pin();
        let root = snapshot.inner.read_root(false, &mut guard);
        drop(guard);

        Iter {
            snapshot,
            stack: vec![Cursor::INode(root)],
            cancel,
            canceled: false,
        }
    }

    /// `Err(Canceled)` if this iteration was cut short by its
    /// [`CancelSignal`], and `Ok(())` otherwise.
    pub fn status(&self) -> Result<(), Canceled> {
        if self.canceled {
            Err(Canceled)
        } else {
            Ok(())
        }
    }

    fn check_cancel(&mut self) -> bool {
        let fired = self.cancel.as_ref().is_some_and(CancelSignal::is_canceled);

        if fired && !self.stack.is_empty() {
            trace!("iteration canceled");
            self.canceled = true;
            self.stack.clear();
        }

        fired
    }

    fn expand(&mut self, inode: &INode<K, V>) -> Option<Arc<SNode<K, V>>> {
        let main = {
            let mut guard = self.snapshot.ebr.pin();
            self.snapshot.inner.gcas_read(inode, &mut guard)
        };

        match &main.kind {
            MainKind::CNode(_) => {
                self.stack.push(Cursor::Branches {
                    main: main.clone(),
                    next: 0,
                });
                None
            }
            MainKind::LNode(lnode) => {
                self.stack.push(Cursor::Entries(lnode.0.clone()));
                None
            }
            MainKind::TNode(snode) => Some(snode.clone()),
        }
    }

    fn next_entry(&mut self) -> Option<Arc<SNode<K, V>>> {
        loop {
            if self.check_cancel() {
                return None;
            }

            let snode = match self.stack.last_mut()? {
                Cursor::INode(inode) => {
                    let inode = inode.clone();
                    self.stack.pop();
                    self.expand(&inode)
                }
                Cursor::Branches { main, next } => {
                    let branch = match &main.kind {
                        MainKind::CNode(cnode) => cnode.branches.get(*next).cloned(),
                        MainKind::TNode(_) | MainKind::LNode(_) => None,
                    };
                    *next += 1;

                    match branch {
                        Some(Branch::SNode(snode)) => Some(snode),
                        Some(Branch::INode(inode)) => {
                            self.stack.push(Cursor::INode(inode));
                            None
                        }
                        None => {
                            self.stack.pop();
                            None
                        }
                    }
                }
                Cursor::Entries(list) => match (list.head().cloned(), list.tail()) {
                    (Some(snode), Some(tail)) => {
                        *list = tail;
                        Some(snode)
                    }
                    _ => {
                        self.stack.pop();
                        None
                    }
                },
            };

            if snode.is_some() {
                return snode;
            }
        }
    }
}

impl<K, V, S, const LOCAL_GC_BUFFER_SIZE: usize> Iterator for Iter<K, V, S, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Hash + Eq + Clone + Send + Sync,
    V: 'static + Clone + Send + Sync,
    S: BuildHasher + Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let snode = self.next_entry()?;
        Some((snode.key.clone(), snode.value.clone()))
    }
}
