//! Union-Find over activity ids, used to cluster the overlap graph.

use std::collections::HashMap;

/// Disjoint-set structure with path compression and union by rank.
#[derive(Debug, Default)]
pub struct UnionFind {
    parent: HashMap<String, String>,
    rank: HashMap<String, usize>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_set(&mut self, item: &str) {
        if !self.parent.contains_key(item) {
            self.parent.insert(item.to_string(), item.to_string());
            self.rank.insert(item.to_string(), 0);
        }
    }

    /// Root of the set containing `item`; creates a singleton when absent.
    pub fn find(&mut self, item: &str) -> String {
        self.make_set(item);

        let parent = self.parent.get(item).cloned().unwrap();
        if parent == item {
            return parent;
        }

        let root = self.find(&parent);
        self.parent.insert(item.to_string(), root.clone());
        root
    }

    /// Returns true when the sets were distinct and got merged.
    pub fn union(&mut self, a: &str, b: &str) -> bool {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return false;
        }

        let rank_a = *self.rank.get(&root_a).unwrap_or(&0);
        let rank_b = *self.rank.get(&root_b).unwrap_or(&0);

        if rank_a < rank_b {
            self.parent.insert(root_a, root_b);
        } else if rank_a > rank_b {
            self.parent.insert(root_b, root_a);
        } else {
            self.parent.insert(root_b, root_a.clone());
            self.rank.insert(root_a, rank_a + 1);
        }
        true
    }

    /// All sets as root -> sorted members.
    pub fn groups(&mut self) -> HashMap<String, Vec<String>> {
        let items: Vec<String> = self.parent.keys().cloned().collect();
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for item in items {
            let root = self.find(&item);
            groups.entry(root).or_default().push(item);
        }
        for members in groups.values_mut() {
            members.sort();
        }
        groups
    }
}
