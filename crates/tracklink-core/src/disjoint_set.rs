//! Union-find with path compression and union by rank.
//!
//! [`DisjointSet`] is the in-memory form used to group duplicate contacts.
//! [`choose_root`] holds the root-selection rule shared with the persisted
//! identity forest so both structures merge the same way.

use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct DisjointSet<K> {
    index: HashMap<K, usize>,
    keys: Vec<K>,
    parent: Vec<usize>,
    rank: Vec<u32>,
}

impl<K> Default for DisjointSet<K> {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
            keys: Vec::new(),
            parent: Vec::new(),
            rank: Vec::new(),
        }
    }
}

impl<K: Eq + Hash + Clone + Ord> DisjointSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Insert `key` as a singleton set if it is not present yet.
    pub fn insert(&mut self, key: K) -> usize {
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.keys.len();
        self.index.insert(key.clone(), idx);
        self.keys.push(key);
        self.parent.push(idx);
        self.rank.push(0);
        idx
    }

    fn find_idx(&mut self, idx: usize) -> usize {
        let mut root = idx;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Compress: point every node on the path straight at the root.
        let mut node = idx;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Root key of the set containing `key`, if `key` is known.
    pub fn find(&mut self, key: &K) -> Option<K> {
        let idx = *self.index.get(key)?;
        let root = self.find_idx(idx);
        Some(self.keys[root].clone())
    }

    /// Merge the sets of `a` and `b`, inserting either key if needed.
    /// Returns `true` when two distinct sets were joined.
    pub fn union(&mut self, a: K, b: K) -> bool {
        let a = self.insert(a);
        let b = self.insert(b);
        let ra = self.find_idx(a);
        let rb = self.find_idx(b);
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }

    /// All sets, each sorted, ordered by their smallest member.
    pub fn groups(&mut self) -> Vec<Vec<K>> {
        let mut by_root: HashMap<usize, Vec<K>> = HashMap::new();
        for idx in 0..self.keys.len() {
            let root = self.find_idx(idx);
            by_root.entry(root).or_default().push(self.keys[idx].clone());
        }
        let mut groups: Vec<Vec<K>> = by_root
            .into_values()
            .map(|mut members| {
                members.sort();
                members
            })
            .collect();
        groups.sort();
        groups
    }
}

/// A root of the persisted identity forest, as seen when unioning.
#[derive(Debug, Clone, PartialEq)]
pub struct ForestRoot {
    pub id: String,
    pub rank: i64,
    pub created_at: DateTime<Utc>,
}

/// Pick `(root, child)` for a union of two distinct roots.
///
/// Higher rank wins; on equal rank the older identity stays root (then the
/// smaller id), and the winner's rank grows by one.
pub fn choose_root(a: ForestRoot, b: ForestRoot) -> (ForestRoot, ForestRoot) {
    let a_wins = match a.rank.cmp(&b.rank) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => (a.created_at, &a.id) <= (b.created_at, &b.id),
    };
    let equal_rank = a.rank == b.rank;
    let (mut root, child) = if a_wins { (a, b) } else { (b, a) };
    if equal_rank {
        root.rank += 1;
    }
    (root, child)
}
