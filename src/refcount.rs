use std::{borrow::Borrow, collections::HashMap, hash::Hash};

/// Per-key reference counts where only the 0->1 and 1->0 transitions matter
///
/// A key is present exactly while its count is nonzero.
#[derive(Debug)]
pub struct RefCounts<K: Eq + Hash> {
    counts: HashMap<K, usize>,
}

impl<K: Eq + Hash> Default for RefCounts<K> {
    fn default() -> Self {
        RefCounts {
            counts: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> RefCounts<K> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Add a reference, returning true if this is the first one
    pub fn acquire(&mut self, key: K) -> bool {
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop a reference, returning Some(true) if it was the last one or
    /// None if the key had no references to drop
    pub fn release<Q>(&mut self, key: &Q) -> Option<bool>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let count = self.counts.get_mut(key)?;
        *count -= 1;
        if *count == 0 {
            self.counts.remove(key);
            Some(true)
        } else {
            Some(false)
        }
    }

    pub fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.counts.get(key).copied().unwrap_or(0)
    }
}
