use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};

use ctrie::{CancelSignal, Canceled, Ctrie, Mode};

/// Hashes every key to the same value.
#[derive(Debug, Default, Clone, Copy)]
struct Collide;

#[derive(Debug, Default, Clone, Copy)]
struct CollideHasher;

impl Hasher for CollideHasher {
    fn finish(&self) -> u64 {
        0xDEAD_BEEF
    }

    fn write(&mut self, _bytes: &[u8]) {}
}

impl BuildHasher for Collide {
    type Hasher = CollideHasher;

    fn build_hasher(&self) -> CollideHasher {
        CollideHasher
    }
}

/// Uses the key itself as its hash, so tests can place keys precisely.
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

fn sorted<K: Ord, V: Ord>(iter: impl Iterator<Item = (K, V)>) -> Vec<(K, V)> {
    let mut ret: Vec<_> = iter.collect();
    ret.sort_unstable();
    ret
}

#[test]
fn read_only_snapshot_is_isolated() {
    let trie = Ctrie::<&str, &str>::new();
    trie.insert("foo", "bar");

    let snapshot = trie.snapshot(Mode::ReadOnly);
    assert!(snapshot.is_read_only());
    assert!(!trie.is_read_only());

    trie.insert("foo", "baz");
    trie.insert("qux", "1");

    assert_eq!(snapshot.get("foo"), Some("bar"));
    assert_eq!(snapshot.get("qux"), None);
    assert_eq!(trie.get("foo"), Some("baz"));
    assert_eq!(trie.get("qux"), Some("1"));

    assert_eq!(sorted(snapshot.iter()), vec![("foo", "bar")]);
    assert_eq!(sorted(trie.iter()), vec![("foo", "baz"), ("qux", "1")]);
}

#[test]
fn snapshot_of_snapshot() {
    let trie = Ctrie::<u64, u64>::new();
    for i in 0..1000 {
        trie.insert(i, i);
    }

    let frozen = trie.read_only_snapshot();
    let frozen_again = frozen.snapshot(Mode::ReadOnly);
    let thawed = frozen.snapshot(Mode::ReadWrite);
    assert!(frozen_again.is_read_only());
    assert!(!thawed.is_read_only());

    for i in 0..1000 {
        thawed.insert(i, i + 1);
        trie.remove(&i);
    }

    for i in 0..1000 {
        assert_eq!(frozen.get(&i), Some(i));
        assert_eq!(frozen_again.get(&i), Some(i));
        assert_eq!(thawed.get(&i), Some(i + 1));
        assert_eq!(trie.get(&i), None);
    }
}

#[test]
fn writable_snapshots_are_independent() {
    let trie = Ctrie::<u64, u64>::new();
    for i in 0..500 {
        trie.insert(i, i);
    }

    let a = trie.snapshot(Mode::ReadWrite);
    let b = trie.snapshot(Mode::ReadWrite);

    a.insert(1000, 1);
    b.remove(&7);
    trie.insert(7, 70);

    assert_eq!(a.get(&1000), Some(1));
    assert_eq!(b.get(&1000), None);
    assert_eq!(trie.get(&1000), None);

    assert_eq!(a.get(&7), Some(7));
    assert_eq!(b.get(&7), None);
    assert_eq!(trie.get(&7), Some(70));

    assert_eq!(a.len(), 501);
    assert_eq!(b.len(), 499);
    assert_eq!(trie.len(), 500);
}

#[test]
fn iteration_excludes_later_writes() {
    let trie = Ctrie::<u64, u64>::new();
    for i in 0..2000 {
        trie.insert(i, i);
    }

    let mut iter = trie.iter();
    let first = iter.next().unwrap();

    for i in 2000..4000 {
        trie.insert(i, i);
    }
    for i in 0..1000 {
        trie.remove(&i);
    }

    let mut rest: Vec<u64> = iter.map(|(k, _v)| k).collect();
    rest.push(first.0);
    rest.sort_unstable();
    assert_eq!(rest, (0..2000).collect::<Vec<_>>());
}

#[test]
fn clear_keeps_earlier_snapshots() {
    let trie = Ctrie::<u64, u64>::new();
    for i in 0..100 {
        trie.insert(i, i);
    }

    let before = trie.read_only_snapshot();
    trie.clear();

    assert!(trie.is_empty());
    for i in 0..100 {
        assert_eq!(trie.get(&i), None);
        assert_eq!(before.get(&i), Some(i));
    }
    assert_eq!(before.len(), 100);

    trie.insert(5, 50);
    assert_eq!(trie.len(), 1);
    assert_eq!(before.get(&5), Some(5));

    let fork = before.snapshot(Mode::ReadWrite);
    fork.clear();
    assert!(fork.is_empty());
    assert_eq!(before.len(), 100);
}

#[test]
fn forced_collisions_round_trip() {
    let trie = Ctrie::<u64, u64, Collide>::default();

    for i in 0..32 {
        assert_eq!(trie.insert(i, i), None);
    }
    for i in 0..32 {
        assert_eq!(trie.get(&i), Some(i));
    }

    // replacing inside a collision list keeps a single entry per key
    assert_eq!(trie.insert(3, 300), Some(3));
    assert_eq!(trie.get(&3), Some(300));
    assert_eq!(trie.len(), 32);

    let snapshot = trie.read_only_snapshot();

    assert_eq!(trie.remove(&100), None);
    for i in 0..31 {
        let expected = if i == 3 { 300 } else { i };
        assert_eq!(trie.remove(&i), Some(expected));
        assert_eq!(trie.get(&i), None);
        assert_eq!(trie.remove(&i), None);
    }

    assert_eq!(sorted(trie.iter()), vec![(31, 31)]);
    assert_eq!(trie.get(&31), Some(31));

    // the last entry can be replaced and removed after its list contracted
    assert_eq!(trie.insert(31, 0), Some(31));
    assert_eq!(trie.remove(&31), Some(0));
    assert!(trie.is_empty());

    // the list is back to being a fresh collision list
    assert_eq!(trie.insert(1, 1), None);
    assert_eq!(trie.insert(2, 2), None);
    assert_eq!(sorted(trie.iter()), vec![(1, 1), (2, 2)]);

    assert_eq!(snapshot.len(), 32);
    assert_eq!(snapshot.get(&3), Some(300));
}

#[test]
fn contraction_below_the_root() {
    let trie = Ctrie::<u64, u64, Identity>::default();

    // all share the low 12 bits, then split at the third level
    let keys: Vec<u64> = (0..8).map(|i| (i << 12) | 0xABC).collect();
    for key in &keys {
        trie.insert(*key, *key);
    }

    for key in &keys[1..] {
        assert_eq!(trie.remove(key), Some(*key));
    }

    // the surviving entry behaves like a fresh single-entry subtree
    assert_eq!(trie.get(&keys[0]), Some(keys[0]));
    assert_eq!(sorted(trie.iter()), vec![(keys[0], keys[0])]);

    let neighbor = (9 << 12) | 0xABC;
    assert_eq!(trie.insert(neighbor, 9), None);
    assert_eq!(trie.get(&neighbor), Some(9));
    assert_eq!(trie.get(&keys[0]), Some(keys[0]));

    assert_eq!(trie.remove(&keys[0]), Some(keys[0]));
    assert_eq!(trie.remove(&neighbor), Some(9));
    assert!(trie.is_empty());

    for key in &keys {
        assert_eq!(trie.insert(*key, 1), None);
    }
    assert_eq!(trie.len(), keys.len());
}

#[test]
fn deep_paths_survive_snapshots() {
    let trie = Ctrie::<u64, u64, Identity>::default();

    // identical in the low 60 bits, forcing ten single-branch levels
    let keys: Vec<u64> = (0..16).map(|i| (i << 60) | 0x0FFF_FFFF_FFFF_FFFF).collect();
    for key in &keys {
        trie.insert(*key, 0);
    }

    let frozen = trie.read_only_snapshot();
    let fork = trie.snapshot(Mode::ReadWrite);

    for key in &keys {
        assert_eq!(trie.insert(*key, 1), Some(0));
        assert_eq!(fork.remove(key), Some(0));
    }

    for key in &keys {
        assert_eq!(frozen.get(key), Some(0));
        assert_eq!(trie.get(key), Some(1));
        assert_eq!(fork.get(key), None);
    }
    assert!(fork.is_empty());
    assert_eq!(frozen.len(), keys.len());
}

#[test]
fn cancellation_stops_within_one_entry() {
    let trie: Ctrie<u64, u64> = (0..1000).map(|i| (i, i)).collect();
    let cancel = CancelSignal::new();

    let mut iter = trie.iter_with_cancel(&cancel);
    for _ in 0..10 {
        assert!(iter.next().is_some());
    }
    assert_eq!(iter.status(), Ok(()));

    cancel.clone().cancel();
    assert!(cancel.is_canceled());

    assert_eq!(iter.next(), None);
    assert_eq!(iter.next(), None);
    assert_eq!(iter.status(), Err(Canceled));

    // other traversals are unaffected unless they share the signal
    assert_eq!(trie.iter().count(), 1000);
    assert_eq!(trie.try_for_each_entry(None, |_k, _v| {}), Ok(()));
    assert_eq!(
        trie.try_for_each_entry(Some(&cancel), |_k, _v| panic!("already canceled")),
        Err(Canceled)
    );
}

#[test]
fn cancel_from_another_thread() {
    let trie: Ctrie<u64, u64> = (0..100_000).map(|i| (i, i)).collect();
    let cancel = CancelSignal::new();
    let started = std::sync::Barrier::new(2);

    std::thread::scope(|s| {
        let trie_2 = trie.clone();
        let cancel_2 = cancel.clone();
        let started_2 = &started;
        let walker = s.spawn(move || {
            let mut seen = 0;
            let res = trie_2.try_for_each_entry(Some(&cancel_2), |_k, _v| {
                if seen == 0 {
                    started_2.wait();
                }
                seen += 1;
                std::thread::yield_now();
            });
            (res, seen)
        });

        started.wait();
        cancel.cancel();

        let (res, seen) = walker.join().unwrap();
        if seen < 100_000 {
            assert_eq!(res, Err(Canceled));
        }
        if res.is_ok() {
            assert_eq!(seen, 100_000);
        }
    });
}

#[test]
fn collect_extend_and_debug() {
    let mut trie: Ctrie<u64, &str> = vec![(1, "a"), (2, "b")].into_iter().collect();
    trie.extend(vec![(2, "c"), (3, "d")]);

    let model: HashMap<u64, &str> = (&trie).into_iter().collect();
    let expected: HashMap<u64, &str> = vec![(1, "a"), (2, "c"), (3, "d")].into_iter().collect();
    assert_eq!(model, expected);

    let single = Ctrie::<u64, &str>::new();
    single.insert(1, "a");
    assert_eq!(format!("{single:?}"), "Ctrie {1: \"a\"}");
}
