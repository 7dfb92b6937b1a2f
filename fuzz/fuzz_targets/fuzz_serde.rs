#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate ctrie;

use std::collections::HashMap;

fuzz_target!(|data: Vec<u64>| {
    let trie = ctrie::Ctrie::<u64, u64>::new();

    for item in data {
        trie.insert(item, item);
    }

    let serialized = bincode::serialize(&trie).unwrap();
    let deserialized: ctrie::Ctrie<u64, u64> = bincode::deserialize(&serialized).unwrap();

    let expected: HashMap<u64, u64> = trie.iter().collect();
    let actual: HashMap<u64, u64> = deserialized.iter().collect();
    assert_eq!(expected, actual);
});
