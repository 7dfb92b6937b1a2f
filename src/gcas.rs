//! Generation-compare-and-swap on I-nodes, and the restricted
//! double-compare single-swap (RDCSS) that replaces the root.
//!
//! A GCAS first installs the new main node with a `Pending` marker
//! pointing at the node it replaced. The write only counts once a
//! thread has seen that the trie's root still belongs to the I-node's
//! generation and has cleared the marker. If a snapshot moved the root
//! in between, the marker is flipped to `Failed` and the old main node is
//! put back. Any thread that reads an I-node helps finish whatever GCAS it
//! finds there, so nobody ever observes a write that is later undone.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::atomic::Guard;
use crate::node::{Branch, CNode, Generation, INode, Main, MainKind, Prev, Rdcss, Root};
use crate::{debug_delay, Inner, Mode};

impl<K, V, S, const LOCAL_GC_BUFFER_SIZE: usize> Inner<K, V, S, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Send + Sync,
    V: 'static + Send + Sync,
{
    /// Attempts to swap `inode.main` from `old` to a node built from
    /// `kind`. Returns `true` only if the write committed.
    pub(crate) fn gcas(
        &self,
        inode: &INode<K, V>,
        old: &Arc<Main<K, V>>,
        kind: MainKind<K, V>,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> bool {
        if debug_delay() {
            return false;
        }

        let new = Main::pending(kind, old.clone());

        if !inode.main.compare_exchange(old, new.clone(), guard) {
            return false;
        }

        self.gcas_complete(inode, new.clone(), guard);

        new.prev.is_none()
    }

    /// Reads the committed main node of `inode`, helping any in-flight
    /// GCAS to completion first.
    pub(crate) fn gcas_read(
        &self,
        inode: &INode<K, V>,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> Arc<Main<K, V>> {
        let main = inode.main.load(guard);

        if main.prev.is_none() {
            main
        } else {
            self.gcas_complete(inode, main, guard)
        }
    }

    fn gcas_complete(
        &self,
        inode: &INode<K, V>,
        mut main: Arc<Main<K, V>>,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> Arc<Main<K, V>> {
        loop {
            let Some(prev) = main.prev.load(guard) else {
                return main;
            };

            match &*prev {
                Prev::Failed(previous) => {
                    if inode.main.compare_exchange(&main, previous.clone(), guard) {
                        trace!("rolled back a write that raced with a snapshot");
                        return previous.clone();
                    }
                    main = inode.main.load(guard);
                }
                Prev::Pending(previous) => {
                    let root = self.read_root(true, guard);

                    if root.gen == inode.gen && !self.read_only {
                        if main.prev.compare_exchange(Some(&prev), None, guard) {
                            return main;
                        }
                    } else {
                        let failed = Arc::new(Prev::Failed(previous.clone()));
                        main.prev.compare_exchange(Some(&prev), Some(failed), guard);
                        main = inode.main.load(guard);
                    }
                }
            }
        }
    }

    /// The current root I-node. A root swap that is still in flight is
    /// completed, or aborted if `abort` is set.
    pub(crate) fn read_root(
        &self,
        abort: bool,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> Arc<INode<K, V>> {
        let root = self.root.load(guard);

        match &*root {
            Root::INode(inode) => inode.clone(),
            Root::Rdcss(_) => self.rdcss_complete(abort, guard),
        }
    }

    /// Replaces the root `old` with `new`, as long as `old.main` is still
    /// `expected` at the moment the swap is decided.
    fn rdcss_root(
        &self,
        old: &Arc<INode<K, V>>,
        expected: &Arc<Main<K, V>>,
        new: Arc<INode<K, V>>,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> bool {
        if debug_delay() {
            return false;
        }

        let current = self.root.load(guard);
        match &*current {
            Root::INode(inode) if Arc::ptr_eq(inode, old) => {}
            _ => return false,
        }

        let desc = Rdcss::new(old.clone(), expected.clone(), new);

        if !self
            .root
            .compare_exchange(&current, Arc::new(Root::Rdcss(desc.clone())), guard)
        {
            return false;
        }

        self.rdcss_complete(false, guard);

        // decided before the descriptor left the root, whoever resolved it
        desc.outcome() == Some(true)
    }

    fn rdcss_complete(
        &self,
        abort: bool,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> Arc<INode<K, V>> {
        loop {
            let current = self.root.load(guard);

            let desc = match &*current {
                Root::INode(inode) => return inode.clone(),
                Root::Rdcss(desc) => desc.clone(),
            };

            let commit = match desc.outcome() {
                Some(commit) => commit,
                None => {
                    let matches = !abort && Arc::ptr_eq(&self.gcas_read(&desc.old, guard), &desc.expected);
                    desc.decide(matches)
                }
            };

            let installed = if commit { desc.new.clone() } else { desc.old.clone() };

            if self
                .root
                .compare_exchange(&current, Arc::new(Root::INode(installed.clone())), guard)
            {
                if !commit {
                    trace!(abort, "root swap did not go through");
                }
                return installed;
            }
        }
    }

    /// A new I-node of generation `gen` over the committed contents of
    /// `inode`.
    pub(crate) fn copy_to_gen(
        &self,
        inode: &INode<K, V>,
        gen: Generation,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> Arc<INode<K, V>> {
        INode::new(self.gcas_read(inode, guard), gen)
    }

    /// A copy of `cnode` stamped with `gen`, whose child I-nodes are
    /// copied into `gen` as well.
    pub(crate) fn renewed(
        &self,
        cnode: &CNode<K, V>,
        gen: &Generation,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> CNode<K, V> {
        let branches = cnode
            .branches
            .iter()
            .map(|branch| match branch {
                Branch::INode(inode) => Branch::INode(self.copy_to_gen(inode, gen.clone(), guard)),
                Branch::SNode(_) => branch.clone(),
            })
            .collect();

        CNode {
            bitmap: cnode.bitmap,
            branches,
            gen: gen.clone(),
        }
    }

    /// Freezes the current contents and returns a root for the snapshot.
    ///
    /// The trie this is called on moves to a fresh copy of its root, so
    /// that its future writes copy paths instead of touching nodes the
    /// snapshot shares. A read-only snapshot keeps the frozen root itself.
    pub(crate) fn snapshot_root(
        &self,
        mode: Mode,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> Arc<INode<K, V>> {
        if self.read_only {
            // nobody writes to a read-only trie, so its root is already
            // frozen
            let root = self.read_root(false, guard);
            return match mode {
                Mode::ReadOnly => root,
                Mode::ReadWrite => self.copy_to_gen(&root, Generation::new(), guard),
            };
        }

        loop {
            let root = self.read_root(false, guard);
            let main = self.gcas_read(&root, guard);
            let renewed_root = INode::new(main.clone(), Generation::new());

            if self.rdcss_root(&root, &main, renewed_root, guard) {
                debug!(?mode, "took snapshot");
                return match mode {
                    Mode::ReadOnly => root,
                    Mode::ReadWrite => self.copy_to_gen(&root, Generation::new(), guard),
                };
            }
        }
    }

    /// Atomically swaps in an empty root of a new generation.
    pub(crate) fn clear(&self, guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>) {
        loop {
            let root = self.read_root(false, guard);
            let main = self.gcas_read(&root, guard);

            if self.rdcss_root(&root, &main, INode::empty(Generation::new()), guard) {
                debug!("cleared trie");
                return;
            }
        }
    }
}
