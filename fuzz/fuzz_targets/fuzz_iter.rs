#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate ctrie;

use std::collections::HashSet;

use ctrie::CancelSignal;

fuzz_target!(|data: (Vec<u64>, u16)| {
    let (items, cancel_after) = data;

    let model: HashSet<u64> = items.iter().copied().collect();

    let trie = ctrie::Ctrie::<u64, u64>::new();
    for item in &items {
        trie.insert(*item, *item);
    }

    let mut self_iter: Vec<u64> = trie.iter().map(|(k, _v)| k).collect();
    self_iter.sort_unstable();
    let mut model_iter: Vec<u64> = model.iter().copied().collect();
    model_iter.sort_unstable();
    assert_eq!(self_iter, model_iter);

    let cancel = CancelSignal::new();
    let mut iter = trie.iter_with_cancel(&cancel);
    let mut seen = HashSet::new();
    for (k, v) in &mut iter {
        assert_eq!(k, v);
        assert!(seen.insert(k), "key {k} visited twice");
        if seen.len() == usize::from(cancel_after) {
            cancel.cancel();
        }
    }

    if iter.status().is_ok() {
        assert_eq!(seen, model);
    } else {
        assert_eq!(seen.len(), usize::from(cancel_after));
        assert!(seen.is_subset(&model));
    }
});
