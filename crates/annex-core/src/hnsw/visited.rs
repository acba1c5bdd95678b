//! Visited bitset for graph traversal.
//!
//! The graph is cloned on every apply, so the set is owned by a single
//! search call instead of living in a thread-local pool keyed by graph size.

pub struct VisitedSet {
    words: Vec<u64>,
}

impl VisitedSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64).max(1)],
        }
    }

    #[inline(always)]
    pub fn is_visited(&self, id: usize) -> bool {
        self.words
            .get(id / 64)
            .is_some_and(|word| word & (1u64 << (id % 64)) != 0)
    }

    /// Mark `id`; returns `true` if it had not been visited yet.
    #[inline(always)]
    pub fn visit(&mut self, id: usize) -> bool {
        let word = id / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let bit = 1u64 << (id % 64);
        let fresh = self.words[word] & bit == 0;
        self.words[word] |= bit;
        fresh
    }
}
