/// Number of hash bits consumed per trie level (64-way branching).
pub(crate) const W: u32 = 6;

/// Once a level reaches this many bits, every hash bit has been used
/// and colliding keys are kept in a collision list instead.
pub(crate) const HASH_BITS: u32 = 64;

const MASK: u64 = (1 << W) - 1;

/// The 6-bit branch index of `hash` at `level`.
pub(crate) const fn index(hash: u64, level: u32) -> u32 {
    debug_assert!(level < HASH_BITS);
    ((hash >> level) & MASK) as u32
}

/// Returns the single-bit flag for `hash` at `level`, and the position
/// that flag's branch occupies in a compacted array described by
/// `bitmap`.
pub(crate) const fn flag_and_pos(hash: u64, level: u32, bitmap: u64) -> (u64, usize) {
    let flag = 1_u64 << index(hash, level);
    let pos = (bitmap & (flag - 1)).count_ones() as usize;
    (flag, pos)
}

#[test]
fn flag_and_pos_counts_lower_bits() {
    // index 3 at level 0, nothing below it set
    assert_eq!(flag_and_pos(0b11, 0, 0), (1 << 3, 0));

    // bits 0, 1 and 5 are set, only 0 and 1 sit below index 3
    assert_eq!(flag_and_pos(0b11, 0, 0b10_0011), (1 << 3, 2));

    // level 6 looks at the second group of six bits
    let hash = 0b10_1010 << 6;
    assert_eq!(index(hash, 6), 0b10_1010);
    assert_eq!(flag_and_pos(hash, 6, u64::MAX), (1 << 42, 42));

    // the last level only has four bits left
    assert_eq!(index(u64::MAX, 60), 0b1111);
}
