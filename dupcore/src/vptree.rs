//! Hamming metric tree: a vantage-point tree variant with leaf clusters.
//!
//! Fixed `MAX_LEAF_SIZE = 10`, vantage chosen as the item farthest from the parent's
//! vantage (root uses the farthest-from-`Hamming::ONES` heuristic), fixed partition
//! threshold `PARTITION_THRESHOLD = 23`, leaf-collapse when a partition degenerates, and
//! search via triangle-inequality pruning with results merged into ascending-distance
//! order.

use crate::hamming::Hamming;

const MAX_LEAF_SIZE: usize = 10;
const PARTITION_THRESHOLD: u32 = 23;

#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub num_nodes: usize,
    pub max_depth: usize,
    pub num_values: usize,
}

#[derive(Debug, Clone)]
enum Node<T> {
    Leaf {
        items: Vec<(Hamming, T)>,
    },
    Internal {
        vantage: Hamming,
        threshold: u32,
        left: Box<Node<T>>,
        right: Box<Node<T>>,
    },
}

/// An immutable, built-once VP-tree. Callers rebuild the whole tree on `add`/`remove`
/// rather than mutating it in place, so there is no incremental insert here — only
/// `build`.
#[derive(Debug, Clone)]
pub struct VpTree<T> {
    root: Option<Node<T>>,
    len: usize,
}

impl<T: Clone> VpTree<T> {
    pub fn build(items: Vec<(Hamming, T)>) -> Self {
        let len = items.len();
        let root = if items.is_empty() {
            None
        } else {
            Some(build_node(items, Hamming::ONES))
        };
        VpTree { root, len }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Threshold search: every indexed item `p` with `hamming(p, q) < threshold`, sorted
    /// ascending by distance. Implemented as a collect-then-sort since a plain
    /// `Vec::sort_by_key` avoids pulling in an extra dependency for a priority queue here.
    pub fn find_within(&self, query: Hamming, threshold: u32) -> Vec<(T, u32)> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            search_node(root, query, threshold, &mut out);
        }
        out.sort_by_key(|&(_, dist)| dist);
        out
    }

    pub fn stats(&self) -> Stats {
        let mut num_nodes = 0;
        let mut max_depth = 0;
        if let Some(root) = &self.root {
            node_stats(root, 1, &mut num_nodes, &mut max_depth);
        }
        Stats {
            num_nodes,
            max_depth,
            num_values: self.len,
        }
    }
}

fn build_node<T: Clone>(items: Vec<(Hamming, T)>, parent_vantage: Hamming) -> Node<T> {
    if items.len() <= MAX_LEAF_SIZE {
        return Node::Leaf { items };
    }

    // Vantage = item farthest from the parent's vantage (root passes Hamming::ONES,
    // matching vptree.h's fallback of "a distance from a fixed max value").
    let vantage_idx = items
        .iter()
        .enumerate()
        .max_by_key(|(_, (h, _))| parent_vantage.distance_to(*h))
        .map(|(i, _)| i)
        .expect("non-empty by MAX_LEAF_SIZE check above");
    let vantage = items[vantage_idx].0;

    let mut left = Vec::new();
    let mut right = Vec::new();
    for item in items {
        if vantage.distance_to(item.0) < PARTITION_THRESHOLD {
            left.push(item);
        } else {
            right.push(item);
        }
    }

    if left.is_empty() || right.is_empty() {
        // Degenerate partition (e.g. a tight cluster of near-identical hashes): collapse
        // into a single leaf rather than recursing forever on the same split.
        let mut items = left;
        items.extend(right);
        return Node::Leaf { items };
    }

    Node::Internal {
        vantage,
        threshold: PARTITION_THRESHOLD,
        left: Box::new(build_node(left, vantage)),
        right: Box::new(build_node(right, vantage)),
    }
}

fn search_node<T: Clone>(node: &Node<T>, query: Hamming, t: u32, out: &mut Vec<(T, u32)>) {
    match node {
        Node::Leaf { items } => {
            for (h, payload) in items {
                let d = h.distance_to(query);
                if d < t {
                    out.push((payload.clone(), d));
                }
            }
        }
        Node::Internal {
            vantage,
            threshold,
            left,
            right,
        } => {
            let d = vantage.distance_to(query);
            // vantage itself isn't stored with a payload separately; it lives inside one
            // of the children's leaves, so no extra emission is needed here.
            if d.saturating_sub(t) < *threshold {
                search_node(left, query, t, out);
            }
            if d + t >= *threshold {
                search_node(right, query, t, out);
            }
        }
    }
}

fn node_stats<T>(node: &Node<T>, depth: usize, num_nodes: &mut usize, max_depth: &mut usize) {
    *num_nodes += 1;
    *max_depth = (*max_depth).max(depth);
    if let Node::Internal { left, right, .. } = node {
        node_stats(left, depth + 1, num_nodes, max_depth);
        node_stats(right, depth + 1, num_nodes, max_depth);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hamming::test_utils::{random_at_distance, random_outside, random_within};
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn brute_force(items: &[(Hamming, u32)], query: Hamming, t: u32) -> Vec<(u32, u32)> {
        let mut v: Vec<(u32, u32)> = items
            .iter()
            .map(|&(h, id)| (id, h.distance_to(query)))
            .filter(|&(_, d)| d < t)
            .collect();
        v.sort_by_key(|&(_, d)| d);
        v
    }

    #[test]
    fn empty_tree() {
        let tree: VpTree<u32> = VpTree::build(vec![]);
        assert!(tree.is_empty());
        assert_eq!(tree.find_within(Hamming(0), 10), vec![]);
    }

    #[test]
    fn find_within_returns_items_under_threshold() {
        let items = vec![
            (Hamming(0x0000_0000_0000_0000), 1u32),
            (Hamming(0xFFFF_FFFF_FFFF_FFFF), 2),
            (Hamming(0x0000_0000_0000_000F), 3),
            (Hamming(0xF0F0_F0F0_F0F0_F0F0), 4),
        ];
        let tree = VpTree::build(items);

        let r = tree.find_within(Hamming(0), 5);
        assert_eq!(r, vec![(1, 0)]);

        let r = tree.find_within(Hamming(0), 17);
        assert_eq!(r, vec![(1, 0), (3, 4)]);
    }

    #[test]
    fn find_within_large_seeded_property() {
        let seed: u64 = 0xC0FF_EE15_5EED_0001;
        println!("seed = {seed:#x}");
        let mut rng = SmallRng::seed_from_u64(seed);

        let n = 10_000;
        let mut items = Vec::with_capacity(n);
        for id in 0..n as u32 {
            items.push((Hamming(rng.gen::<u64>()), id));
        }
        let tree = VpTree::build(items.clone());

        for _ in 0..200 {
            let t = rng.gen_range(1..=20);
            let query = if rng.gen_bool(0.5) {
                let (h, _) = items[rng.gen_range(0..items.len())];
                random_within(&mut rng, h, t.saturating_sub(1))
            } else {
                random_outside(&mut rng, items[0].0, t)
            };

            let expected = brute_force(&items, query, t);
            let actual = tree.find_within(query, t);
            assert_eq!(actual, expected, "mismatch for query={query:?} t={t}");
        }
    }

    #[test]
    fn results_are_sorted_ascending() {
        let mut rng = SmallRng::seed_from_u64(42);
        let center = Hamming(0);
        let mut items = Vec::new();
        for id in 0..500u32 {
            items.push((random_at_distance(&mut rng, center, id % 20), id));
        }
        let tree = VpTree::build(items);
        let r = tree.find_within(center, 20);
        let mut sorted = r.clone();
        sorted.sort_by_key(|&(_, d)| d);
        assert_eq!(r, sorted);
    }

    #[test]
    fn stats_report_sane_values() {
        let mut rng = SmallRng::seed_from_u64(7);
        let items: Vec<_> = (0..1000u32)
            .map(|id| (Hamming(rng.gen::<u64>()), id))
            .collect();
        let tree = VpTree::build(items);
        let stats = tree.stats();
        assert_eq!(stats.num_values, 1000);
        assert!(stats.num_nodes > 0);
        assert!(stats.max_depth > 0);
    }
}
