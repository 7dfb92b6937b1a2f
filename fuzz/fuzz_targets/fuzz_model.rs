#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate arbitrary;
extern crate ctrie;

use std::collections::HashMap;

use arbitrary::Arbitrary;
use ctrie::{Ctrie, Mode};

const KEYSPACE: u64 = 128;

#[derive(Debug)]
enum Op {
    Insert { key: u64, value: u64 },
    Remove { key: u64 },
    Get { key: u64 },
    Snapshot { mode: Mode },
    Switch { to: usize },
    Clear,
}

impl<'a> Arbitrary<'a> for Op {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(if u.ratio(1, 2)? {
            Op::Insert {
                key: u.int_in_range(0..=KEYSPACE)?,
                value: u.int_in_range(0..=KEYSPACE)?,
            }
        } else if u.ratio(1, 2)? {
            Op::Remove {
                key: u.int_in_range(0..=KEYSPACE)?,
            }
        } else if u.ratio(1, 2)? {
            Op::Get {
                key: u.int_in_range(0..=KEYSPACE)?,
            }
        } else if u.ratio(1, 2)? {
            Op::Snapshot {
                mode: if u.ratio(1, 2)? {
                    Mode::ReadOnly
                } else {
                    Mode::ReadWrite
                },
            }
        } else if u.ratio(1, 8)? {
            Op::Clear
        } else {
            Op::Switch {
                to: u.int_in_range(0..=15)?,
            }
        })
    }
}

/// Hashes into a handful of buckets so that collision lists and deep
/// paths get exercised constantly.
#[derive(Debug, Default, Clone, Copy)]
struct Narrow;

#[derive(Debug, Default, Clone, Copy)]
struct NarrowHasher(u64);

impl std::hash::Hasher for NarrowHasher {
    fn finish(&self) -> u64 {
        self.0 % 5
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 = self.0.wrapping_mul(31).wrapping_add(u64::from(*byte));
        }
    }
}

impl std::hash::BuildHasher for Narrow {
    type Hasher = NarrowHasher;

    fn build_hasher(&self) -> NarrowHasher {
        NarrowHasher::default()
    }
}

fn check<S>(trie: &Ctrie<u64, u64, S>, model: &HashMap<u64, u64>)
where
    S: std::hash::BuildHasher + Clone,
{
    for (key, value) in model {
        assert_eq!(trie.get(key), Some(*value));
    }

    let mut seen = 0;
    for (key, value) in trie {
        assert_eq!(model.get(&key), Some(&value));
        seen += 1;
    }
    assert_eq!(seen, model.len());
}

fn run<S>(ops: &[Op])
where
    S: std::hash::BuildHasher + Clone + Default,
{
    // every trie ever created, next to the model of what it must hold
    let mut tries: Vec<(Ctrie<u64, u64, S>, HashMap<u64, u64>)> = vec![(Ctrie::default(), HashMap::new())];
    let mut current = 0;

    for op in ops {
        let (trie, model) = &mut tries[current];

        match *op {
            Op::Insert { key, value } => {
                if trie.is_read_only() {
                    continue;
                }
                assert_eq!(trie.insert(key, value), model.insert(key, value));
            }
            Op::Remove { key } => {
                if trie.is_read_only() {
                    continue;
                }
                assert_eq!(trie.remove(&key), model.remove(&key));
            }
            Op::Get { key } => {
                assert_eq!(trie.get(&key), model.get(&key).copied());
            }
            Op::Clear => {
                if trie.is_read_only() {
                    continue;
                }
                trie.clear();
                model.clear();
            }
            Op::Snapshot { mode } => {
                let snapshot = trie.snapshot(mode);
                let snapshot_model = model.clone();
                tries.push((snapshot, snapshot_model));
            }
            Op::Switch { to } => {
                current = to % tries.len();
            }
        }
    }

    for (trie, model) in &tries {
        check(trie, model);
    }
}

fuzz_target!(|ops: Vec<Op>| {
    run::<fnv::FnvBuildHasher>(&ops);
    run::<Narrow>(&ops);
});
