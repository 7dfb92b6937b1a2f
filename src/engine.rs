//! The recursive insert, lookup, and remove algorithms, plus the cleanup
//! that compresses tombstones away.
//!
//! Every function here makes one attempt. When it loses a race that can
//! only be resolved by starting over from the root, it returns
//! `Err(Restart)` and the public method on `Ctrie` re-reads the root and
//! tries again.

use std::borrow::Borrow;
use std::sync::Arc;

use crate::atomic::Guard;
use crate::bits::{self, W};
use crate::node::{Branch, CNode, Generation, INode, Main, MainKind, SNode};
use crate::Inner;

/// The attempt lost a race and must be retried from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Restart;

type Attempt<T> = Result<T, Restart>;

impl<K, V, S, const LOCAL_GC_BUFFER_SIZE: usize> Inner<K, V, S, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Eq + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    fn commit<T>(
        &self,
        inode: &INode<K, V>,
        old: &Arc<Main<K, V>>,
        kind: MainKind<K, V>,
        ret: T,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> Attempt<T> {
        if self.gcas(inode, old, kind, guard) {
            Ok(ret)
        } else {
            Err(Restart)
        }
    }

    pub(crate) fn insert_at(
        &self,
        inode: &Arc<INode<K, V>>,
        snode: &Arc<SNode<K, V>>,
        level: u32,
        parent: Option<&Arc<INode<K, V>>>,
        start_gen: &Generation,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> Attempt<Option<V>> {
        loop {
            let main = self.gcas_read(inode, guard);

            match &main.kind {
                MainKind::CNode(cnode) => {
                    let (flag, pos) = bits::flag_and_pos(snode.hash, level, cnode.bitmap);

                    if cnode.bitmap & flag == 0 {
                        let renewed;
                        let cnode = if cnode.gen == inode.gen {
                            cnode
                        } else {
                            renewed = self.renewed(cnode, &inode.gen, guard);
                            &renewed
                        };
                        let new = cnode.inserted(pos, flag, Branch::SNode(snode.clone()), inode.gen.clone());
                        return self.commit(inode, &main, MainKind::CNode(new), None, guard);
                    }

                    match &cnode.branches[pos] {
                        Branch::INode(child) => {
                            if child.gen == *start_gen {
                                return self.insert_at(child, snode, level + W, Some(inode), start_gen, guard);
                            }

                            // the child predates the last snapshot
                            let renewed = self.renewed(cnode, start_gen, guard);
                            if self.gcas(inode, &main, MainKind::CNode(renewed), guard) {
                                continue;
                            }
                            return Err(Restart);
                        }
                        Branch::SNode(existing) if existing.key == snode.key => {
                            let new = cnode.updated(pos, Branch::SNode(snode.clone()), inode.gen.clone());
                            let previous = Some(existing.value.clone());
                            return self.commit(inode, &main, MainKind::CNode(new), previous, guard);
                        }
                        Branch::SNode(existing) => {
                            let renewed;
                            let cnode = if cnode.gen == inode.gen {
                                cnode
                            } else {
                                renewed = self.renewed(cnode, &inode.gen, guard);
                                &renewed
                            };
                            let split = Main::new(MainKind::dual(
                                existing.clone(),
                                snode.clone(),
                                level + W,
                                &inode.gen,
                            ));
                            let child = INode::new(split, inode.gen.clone());
                            let new = cnode.updated(pos, Branch::INode(child), inode.gen.clone());
                            return self.commit(inode, &main, MainKind::CNode(new), None, guard);
                        }
                    }
                }
                MainKind::TNode(_) => {
                    self.clean_above(parent, level, guard);
                    return Err(Restart);
                }
                MainKind::LNode(lnode) => {
                    let previous = lnode.get(&snode.key).map(|existing| existing.value.clone());
                    let new = lnode.inserted(snode.clone());
                    return self.commit(inode, &main, MainKind::LNode(new), previous, guard);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn lookup_at<Q>(
        &self,
        inode: &Arc<INode<K, V>>,
        key: &Q,
        hash: u64,
        level: u32,
        parent: Option<&Arc<INode<K, V>>>,
        start_gen: &Generation,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> Attempt<Option<V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        loop {
            let main = self.gcas_read(inode, guard);

            match &main.kind {
                MainKind::CNode(cnode) => {
                    let (flag, pos) = bits::flag_and_pos(hash, level, cnode.bitmap);

                    if cnode.bitmap & flag == 0 {
                        return Ok(None);
                    }

                    match &cnode.branches[pos] {
                        Branch::INode(child) => {
                            if self.read_only || child.gen == *start_gen {
                                return self.lookup_at(child, key, hash, level + W, Some(inode), start_gen, guard);
                            }

                            let renewed = self.renewed(cnode, start_gen, guard);
                            if self.gcas(inode, &main, MainKind::CNode(renewed), guard) {
                                continue;
                            }
                            return Err(Restart);
                        }
                        Branch::SNode(snode) => {
                            let found = snode.key.borrow() == key;
                            return Ok(found.then(|| snode.value.clone()));
                        }
                    }
                }
                MainKind::TNode(snode) => {
                    if self.read_only {
                        // frozen, so the tombstone stays and still holds
                        // its entry
                        let found = snode.hash == hash && snode.key.borrow() == key;
                        return Ok(found.then(|| snode.value.clone()));
                    }

                    self.clean_above(parent, level, guard);
                    return Err(Restart);
                }
                MainKind::LNode(lnode) => {
                    return Ok(lnode.get(key).map(|snode| snode.value.clone()));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn remove_at<Q>(
        &self,
        inode: &Arc<INode<K, V>>,
        key: &Q,
        hash: u64,
        level: u32,
        parent: Option<&Arc<INode<K, V>>>,
        start_gen: &Generation,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> Attempt<Option<V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        loop {
            let main = self.gcas_read(inode, guard);

            match &main.kind {
                MainKind::CNode(cnode) => {
                    let (flag, pos) = bits::flag_and_pos(hash, level, cnode.bitmap);

                    if cnode.bitmap & flag == 0 {
                        return Ok(None);
                    }

                    match &cnode.branches[pos] {
                        Branch::INode(child) => {
                            if child.gen == *start_gen {
                                return self.remove_at(child, key, hash, level + W, Some(inode), start_gen, guard);
                            }

                            let renewed = self.renewed(cnode, start_gen, guard);
                            if self.gcas(inode, &main, MainKind::CNode(renewed), guard) {
                                continue;
                            }
                            return Err(Restart);
                        }
                        Branch::SNode(snode) if snode.key.borrow() != key => return Ok(None),
                        Branch::SNode(snode) => {
                            let new = cnode.removed(pos, flag, inode.gen.clone());

                            if !self.gcas(inode, &main, new.contracted(level), guard) {
                                return Err(Restart);
                            }

                            if let Some(parent) = parent {
                                let after = self.gcas_read(inode, guard);
                                if matches!(after.kind, MainKind::TNode(_)) {
                                    self.clean_parent(parent, inode, hash, level - W, start_gen, guard);
                                }
                            }

                            return Ok(Some(snode.value.clone()));
                        }
                    }
                }
                MainKind::TNode(_) => {
                    self.clean_above(parent, level, guard);
                    return Err(Restart);
                }
                MainKind::LNode(lnode) => {
                    let Some(snode) = lnode.get(key) else {
                        return Ok(None);
                    };
                    let Some(shrunk) = lnode.removed(key) else {
                        return Ok(None);
                    };
                    let previous = Some(snode.value.clone());
                    return self.commit(inode, &main, shrunk.contracted(), previous, guard);
                }
            }
        }
    }

    /// Compresses the parent of an I-node at `level` that was found
    /// holding a tombstone.
    fn clean_above(
        &self,
        parent: Option<&Arc<INode<K, V>>>,
        level: u32,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) {
        if let Some(parent) = parent {
            self.clean(parent, level - W, guard);
        }
    }

    fn clean(&self, inode: &INode<K, V>, level: u32, guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>) {
        debug_assert!(!self.read_only);

        let main = self.gcas_read(inode, guard);

        if let MainKind::CNode(cnode) = &main.kind {
            let compressed = self.compressed(cnode, level, &inode.gen, guard);
            self.gcas(inode, &main, compressed, guard);
        }
    }

    /// `cnode` with every tombstoned child I-node replaced by its entry,
    /// then contracted.
    fn compressed(
        &self,
        cnode: &CNode<K, V>,
        level: u32,
        gen: &Generation,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> MainKind<K, V> {
        let branches = cnode
            .branches
            .iter()
            .map(|branch| match branch {
                Branch::INode(child) => {
                    let main = self.gcas_read(child, guard);
                    resurrected(child, &main)
                }
                Branch::SNode(_) => branch.clone(),
            })
            .collect();

        CNode {
            bitmap: cnode.bitmap,
            branches,
            gen: gen.clone(),
        }
        .contracted(level)
    }

    /// Pulls the entry of a tombstoned `inode` up into `parent`, which
    /// sits at `level`. Gives up once `inode` is no longer a tombstone
    /// under `parent`, or once a snapshot has moved the root on.
    fn clean_parent(
        &self,
        parent: &INode<K, V>,
        inode: &Arc<INode<K, V>>,
        hash: u64,
        level: u32,
        start_gen: &Generation,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) {
        debug_assert!(!self.read_only);

        loop {
            let main = self.gcas_read(inode, guard);
            let parent_main = self.gcas_read(parent, guard);

            let MainKind::CNode(cnode) = &parent_main.kind else {
                return;
            };

            let (flag, pos) = bits::flag_and_pos(hash, level, cnode.bitmap);
            if cnode.bitmap & flag == 0 {
                return;
            }

            let Branch::INode(sub) = &cnode.branches[pos] else {
                return;
            };
            if !Arc::ptr_eq(sub, inode) || !matches!(main.kind, MainKind::TNode(_)) {
                return;
            }

            let new = cnode.updated(pos, resurrected(inode, &main), inode.gen.clone());
            if self.gcas(parent, &parent_main, new.contracted(level), guard) {
                return;
            }

            if self.read_root(false, guard).gen != *start_gen {
                return;
            }
        }
    }
}

/// The branch that should stand in for `inode`, whose main node is `main`.
fn resurrected<K, V>(inode: &Arc<INode<K, V>>, main: &Main<K, V>) -> Branch<K, V> {
    match &main.kind {
        MainKind::TNode(snode) => Branch::SNode(snode.clone()),
        MainKind::CNode(_) | MainKind::LNode(_) => Branch::INode(inode.clone()),
    }
}

#[cfg(all(test, not(feature = "fault_injection")))]
mod test {
    use std::hash::{BuildHasher, Hasher};

    use super::*;
    use crate::{Ctrie, Mode};

    #[derive(Debug, Default, Clone, Copy)]
    struct Identity;

    #[derive(Debug, Default, Clone, Copy)]
    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, bytes: &[u8]) {
            for byte in bytes {
                self.0 = (self.0 << 8) | u64::from(*byte);
            }
        }

        fn write_u64(&mut self, i: u64) {
            self.0 = i;
        }
    }

    impl BuildHasher for Identity {
        type Hasher = IdentityHasher;

        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher::default()
        }
    }

    #[test]
    fn cleanup_completes_pending_tombstones_before_copying_them() {
        let trie = Ctrie::<u64, u64, Identity>::default();

        // a and b share the first chunk, so they live in one child I-node
        let (a, b, c) = (0x40, 0x80, 0x1);
        for key in [a, b, c] {
            trie.insert(key, key);
        }

        let mut guard = trie.ebr.pin();
        let root = trie.inner.read_root(false, &mut guard);
        let root_main = trie.inner.gcas_read(&root, &mut guard);
        let MainKind::CNode(cnode) = &root_main.kind else {
            panic!("expected a C-node at the root");
        };
        let (_, pos) = bits::flag_and_pos(a, 0, cnode.bitmap);
        let Branch::INode(child) = &cnode.branches[pos] else {
            panic!("expected a child I-node");
        };
        let child = child.clone();

        // a remover of `a` has swapped in its tombstone but not finished
        let old = trie.inner.gcas_read(&child, &mut guard);
        let tombstone = Main::pending(
            MainKind::TNode(Arc::new(SNode {
                key: b,
                value: b,
                hash: b,
            })),
            old.clone(),
        );
        assert!(child.main.compare_exchange(&old, tombstone.clone(), &mut guard));

        trie.inner.clean(&root, 0, &mut guard);

        // copying the tombstone upwards committed the removal first
        assert!(tombstone.prev.load(&mut guard).is_none());
        drop(guard);

        let snapshot = trie.snapshot(Mode::ReadOnly);

        let mut guard = trie.ebr.pin();
        assert!(Arc::ptr_eq(&trie.inner.gcas_read(&child, &mut guard), &tombstone));
        drop(guard);

        for view in [&trie, &snapshot] {
            assert_eq!(view.get(&a), None);
            assert_eq!(view.get(&b), Some(b));
            assert_eq!(view.get(&c), Some(c));
        }
        assert_eq!(trie.remove(&b), Some(b));
        assert_eq!(snapshot.get(&b), Some(b));
    }
}
