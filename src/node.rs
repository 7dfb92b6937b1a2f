use std::borrow::Borrow;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use crate::atomic::{AtomicArc, AtomicOptionArc};
use crate::bits::{self, HASH_BITS, W};
use crate::list::List;

/// Stamps every structural node with the snapshot lineage it was created
/// in. Two generations are the same only if they are the same allocation,
/// never by value.
#[derive(Clone)]
pub(crate) struct Generation(Arc<()>);

impl Generation {
    pub(crate) fn new() -> Generation {
        Generation(Arc::new(()))
    }
}

impl PartialEq for Generation {
    fn eq(&self, other: &Generation) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Generation {}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Generation({:p})", Arc::as_ptr(&self.0))
    }
}

/// A key, its value, and the key's hash. Immutable once built.
pub(crate) struct SNode<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
    pub(crate) hash: u64,
}

pub(crate) enum Branch<K, V> {
    INode(Arc<INode<K, V>>),
    SNode(Arc<SNode<K, V>>),
}

impl<K, V> Clone for Branch<K, V> {
    fn clone(&self) -> Branch<K, V> {
        match self {
            Branch::INode(inode) => Branch::INode(inode.clone()),
            Branch::SNode(snode) => Branch::SNode(snode.clone()),
        }
    }
}

/// The only mutable link in the trie. `main` is swapped with GCAS.
pub(crate) struct INode<K, V> {
    pub(crate) main: AtomicArc<Main<K, V>>,
    pub(crate) gen: Generation,
}

impl<K, V> INode<K, V> {
    pub(crate) fn new(main: Arc<Main<K, V>>, gen: Generation) -> Arc<INode<K, V>> {
        Arc::new(INode {
            main: AtomicArc::new(main),
            gen,
        })
    }

    /// An I-node over an empty bitmap node, used as a fresh root.
    pub(crate) fn empty(gen: Generation) -> Arc<INode<K, V>> {
        let main = Main::new(MainKind::CNode(CNode {
            bitmap: 0,
            branches: vec![],
            gen: gen.clone(),
        }));
        INode::new(main, gen)
    }
}

/// What an I-node points at, plus the GCAS bookkeeping slot. While `prev`
/// is non-empty the write that installed this node is not yet committed.
pub(crate) struct Main<K, V> {
    pub(crate) kind: MainKind<K, V>,
    pub(crate) prev: AtomicOptionArc<Prev<K, V>>,
}

pub(crate) enum MainKind<K, V> {
    CNode(CNode<K, V>),
    TNode(Arc<SNode<K, V>>),
    LNode(LNode<K, V>),
}

/// The contents of a main node's `prev` slot during a GCAS.
pub(crate) enum Prev<K, V> {
    /// The write is in flight; this is the value it replaced.
    Pending(Arc<Main<K, V>>),
    /// The write lost to a snapshot and must be rolled back to this value.
    Failed(Arc<Main<K, V>>),
}

impl<K, V> Main<K, V> {
    pub(crate) fn new(kind: MainKind<K, V>) -> Arc<Main<K, V>> {
        Arc::new(Main {
            kind,
            prev: AtomicOptionArc::new(None),
        })
    }

    /// A main node that is about to be CAS'd over `replacing`.
    pub(crate) fn pending(kind: MainKind<K, V>, replacing: Arc<Main<K, V>>) -> Arc<Main<K, V>> {
        Arc::new(Main {
            kind,
            prev: AtomicOptionArc::new(Some(Arc::new(Prev::Pending(replacing)))),
        })
    }
}

/// The value of the trie's root slot.
pub(crate) enum Root<K, V> {
    INode(Arc<INode<K, V>>),
    Rdcss(Arc<Rdcss<K, V>>),
}

/// "Replace root `old` with `new` iff `old.main` is still `expected`."
pub(crate) struct Rdcss<K, V> {
    pub(crate) old: Arc<INode<K, V>>,
    pub(crate) expected: Arc<Main<K, V>>,
    pub(crate) new: Arc<INode<K, V>>,
    state: AtomicU8,
}

const UNDECIDED: u8 = 0;
const COMMITTED: u8 = 1;
const ABORTED: u8 = 2;

impl<K, V> Rdcss<K, V> {
    pub(crate) fn new(old: Arc<INode<K, V>>, expected: Arc<Main<K, V>>, new: Arc<INode<K, V>>) -> Arc<Rdcss<K, V>> {
        Arc::new(Rdcss {
            old,
            expected,
            new,
            state: AtomicU8::new(UNDECIDED),
        })
    }

    /// `Some(true)` once the swap is decided to commit, `Some(false)` once
    /// it is decided to abort.
    pub(crate) fn outcome(&self) -> Option<bool> {
        match self.state.load(Ordering::Acquire) {
            UNDECIDED => None,
            state => Some(state == COMMITTED),
        }
    }

    /// Records `commit` unless another thread decided first, and returns
    /// whichever decision stands. Must happen before the root slot leaves
    /// this descriptor.
    pub(crate) fn decide(&self, commit: bool) -> bool {
        let proposed = if commit { COMMITTED } else { ABORTED };
        match self
            .state
            .compare_exchange(UNDECIDED, proposed, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => commit,
            Err(decided) => decided == COMMITTED,
        }
    }
}

/// A bitmap node. `branches[i]` belongs to the i-th set bit of `bitmap`.
pub(crate) struct CNode<K, V> {
    pub(crate) bitmap: u64,
    pub(crate) branches: Vec<Branch<K, V>>,
    pub(crate) gen: Generation,
}

impl<K, V> CNode<K, V> {
    pub(crate) fn inserted(
        &self,
        pos: usize,
        flag: u64,
        branch: Branch<K, V>,
        gen: Generation,
    ) -> CNode<K, V> {
        debug_assert_eq!(self.bitmap & flag, 0);
        let mut branches = Vec::with_capacity(self.branches.len() + 1);
        branches.extend_from_slice(&self.branches[..pos]);
        branches.push(branch);
        branches.extend_from_slice(&self.branches[pos..]);

        CNode {
            bitmap: self.bitmap | flag,
            branches,
            gen,
        }
    }

    pub(crate) fn updated(&self, pos: usize, branch: Branch<K, V>, gen: Generation) -> CNode<K, V> {
        let mut branches = self.branches.clone();
        branches[pos] = branch;

        CNode {
            bitmap: self.bitmap,
            branches,
            gen,
        }
    }

    pub(crate) fn removed(&self, pos: usize, flag: u64, gen: Generation) -> CNode<K, V> {
        debug_assert_ne!(self.bitmap & flag, 0);
        let mut branches = self.branches.clone();
        branches.remove(pos);

        CNode {
            bitmap: self.bitmap ^ flag,
            branches,
            gen,
        }
    }

    /// Below the root, a bitmap node left holding a single leaf is
    /// replaced by a tombstone for that leaf.
    pub(crate) fn contracted(self, level: u32) -> MainKind<K, V> {
        if level > 0 && self.branches.len() == 1 {
            if let Some(Branch::SNode(snode)) = self.branches.first() {
                return MainKind::TNode(snode.clone());
            }
        }
        MainKind::CNode(self)
    }
}

impl<K, V> MainKind<K, V> {
    /// Builds the smallest sub-trie that tells `x` and `y` apart, starting
    /// at `level`. Keys whose hashes agree on every bit end up in a
    /// collision list.
    pub(crate) fn dual(
        x: Arc<SNode<K, V>>,
        y: Arc<SNode<K, V>>,
        level: u32,
        gen: &Generation,
    ) -> MainKind<K, V> {
        if level >= HASH_BITS {
            return MainKind::LNode(LNode(List::default().add(x).add(y)));
        }

        let x_idx = bits::index(x.hash, level);
        let y_idx = bits::index(y.hash, level);
        let bitmap = (1_u64 << x_idx) | (1_u64 << y_idx);

        let branches = match x_idx.cmp(&y_idx) {
            CmpOrdering::Equal => {
                let main = Main::new(MainKind::dual(x, y, level + W, gen));
                vec![Branch::INode(INode::new(main, gen.clone()))]
            }
            CmpOrdering::Less => vec![Branch::SNode(x), Branch::SNode(y)],
            CmpOrdering::Greater => vec![Branch::SNode(y), Branch::SNode(x)],
        };

        MainKind::CNode(CNode {
            bitmap,
            branches,
            gen: gen.clone(),
        })
    }
}

/// Entries whose hashes are identical, kept in a persistent list.
pub(crate) struct LNode<K, V>(pub(crate) List<Arc<SNode<K, V>>>);

impl<K, V> LNode<K, V> {
    pub(crate) const fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&Arc<SNode<K, V>>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.0.find(|snode| snode.key.borrow() == key)
    }

    /// A new list holding `snode`, replacing any entry with the same key.
    pub(crate) fn inserted(&self, snode: Arc<SNode<K, V>>) -> LNode<K, V>
    where
        K: Eq,
    {
        let without = self
            .0
            .find_index(|existing| existing.key == snode.key)
            .and_then(|idx| self.0.remove(idx))
            .unwrap_or_else(|| self.0.clone());

        LNode(without.add(snode))
    }

    /// A new list without `key`, or `None` if `key` is absent.
    pub(crate) fn removed<Q>(&self, key: &Q) -> Option<LNode<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let idx = self.0.find_index(|snode| snode.key.borrow() == key)?;
        self.0.remove(idx).map(LNode)
    }

    /// A list that has shrunk to one entry is tombstoned so that the
    /// parent can pull the entry up a level.
    pub(crate) fn contracted(self) -> MainKind<K, V> {
        if self.len() == 1 {
            if let Some(snode) = self.0.head() {
                return MainKind::TNode(snode.clone());
            }
        }
        MainKind::LNode(self)
    }
}

impl<K, V> Clone for LNode<K, V> {
    fn clone(&self) -> LNode<K, V> {
        LNode(self.0.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn snode(key: u64, hash: u64) -> Arc<SNode<u64, u64>> {
        Arc::new(SNode {
            key,
            value: key,
            hash,
        })
    }

    fn leaf_keys(cnode: &CNode<u64, u64>) -> Vec<u64> {
        cnode
            .branches
            .iter()
            .map(|branch| match branch {
                Branch::SNode(snode) => snode.key,
                Branch::INode(_) => panic!("expected a leaf"),
            })
            .collect()
    }

    #[test]
    fn generation_identity() {
        let a = Generation::new();
        let b = Generation::new();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn cnode_insert_update_remove() {
        let gen = Generation::new();
        let empty = CNode::<u64, u64> {
            bitmap: 0,
            branches: vec![],
            gen: gen.clone(),
        };

        let (flag, pos) = bits::flag_and_pos(5, 0, empty.bitmap);
        let one = empty.inserted(pos, flag, Branch::SNode(snode(5, 5)), gen.clone());

        let (flag, pos) = bits::flag_and_pos(2, 0, one.bitmap);
        assert_eq!(pos, 0);
        let two = one.inserted(pos, flag, Branch::SNode(snode(2, 2)), gen.clone());
        assert_eq!(two.bitmap, (1 << 5) | (1 << 2));
        assert_eq!(leaf_keys(&two), vec![2, 5]);

        let updated = two.updated(1, Branch::SNode(snode(6, 5)), gen.clone());
        assert_eq!(leaf_keys(&updated), vec![2, 6]);
        assert_eq!(leaf_keys(&two), vec![2, 5]);

        let (flag, pos) = bits::flag_and_pos(2, 0, two.bitmap);
        let removed = two.removed(pos, flag, gen);
        assert_eq!(removed.bitmap, 1 << 5);
        assert_eq!(leaf_keys(&removed), vec![5]);
    }

    #[test]
    fn contraction_only_below_root() {
        let gen = Generation::new();
        let single = || CNode::<u64, u64> {
            bitmap: 1,
            branches: vec![Branch::SNode(snode(0, 0))],
            gen: gen.clone(),
        };

        assert!(matches!(single().contracted(0), MainKind::CNode(_)));
        assert!(matches!(single().contracted(W), MainKind::TNode(_)));
    }

    #[test]
    fn dual_splits_on_first_differing_chunk() {
        let gen = Generation::new();

        // differ at level 0
        let MainKind::CNode(cnode) = MainKind::dual(snode(1, 0b01), snode(2, 0b10), 0, &gen) else {
            panic!("expected a bitmap node");
        };
        assert_eq!(cnode.bitmap, 0b110);
        assert_eq!(leaf_keys(&cnode), vec![1, 2]);

        // share the first chunk, differ at the second
        let MainKind::CNode(cnode) = MainKind::dual(snode(1, 1 << 6), snode(2, 2 << 6), 0, &gen)
        else {
            panic!("expected a bitmap node");
        };
        assert_eq!(cnode.bitmap, 1);
        assert!(matches!(cnode.branches[0], Branch::INode(_)));

        // identical hashes bottom out in a collision list
        assert!(matches!(
            MainKind::dual(snode(1, 7), snode(2, 7), HASH_BITS, &gen),
            MainKind::LNode(ref lnode) if lnode.len() == 2
        ));
    }

    #[test]
    fn lnode_replaces_and_contracts() {
        let lnode = LNode(List::default().add(snode(1, 9)).add(snode(2, 9)));

        let replaced = lnode.inserted(Arc::new(SNode {
            key: 1,
            value: 100,
            hash: 9,
        }));
        assert_eq!(replaced.len(), 2);
        assert_eq!(replaced.get(&1).map(|snode| snode.value), Some(100));
        assert_eq!(lnode.get(&1).map(|snode| snode.value), Some(1));

        assert!(lnode.removed(&3).is_none());

        let shrunk = lnode.removed(&1).unwrap();
        assert!(matches!(shrunk.contracted(), MainKind::TNode(ref snode) if snode.key == 2));
    }
}
