//! Clustered bit-partition tree for bulk Hamming-hash indexing.
//!
//! `CLUSTER_SIZE = 64 * 1024` bytes per leaf, insert-triggered leaf splits on
//! `bit = depth` once a leaf would exceed `CLUSTER_SIZE / size_of::<hash>()` entries,
//! depth hard-capped at 63 (a leaf at depth 63 simply grows unbounded), tombstone-by-zeroing
//! removal (payload `0` reserved as the sentinel for "removed"), a `slice` operation that
//! copies a filtered subtree, and pre-order `(bool is_leaf, ...)` persistence.
//!
//! This is deliberately a **best-effort** structure: `find` is not guaranteed to return
//! every indexed item within a Hamming threshold, only the ones reachable by descending
//! the single bit-path of the query. Used for bulk video-frame indexing, where many frame
//! hashes per video make a false negative on any one frame cheap.

use std::io::{self, Read, Write};

use crate::hamming::Hamming;

const CLUSTER_BYTES: usize = 64 * 1024;
const ENTRY_SIZE: usize = std::mem::size_of::<u32>() + std::mem::size_of::<u64>();
const MAX_LEAF_ENTRIES: usize = CLUSTER_BYTES / ENTRY_SIZE;
const MAX_DEPTH: u32 = 63;
const TOMBSTONE: u32 = 0;

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        payloads: Vec<u32>,
        hashes: Vec<Hamming>,
    },
    Internal {
        bit: u32,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub num_nodes: usize,
    pub max_height: usize,
    pub num_values: usize,
}

#[derive(Debug, Clone)]
pub struct BitTree {
    root: Node,
    len: usize,
}

impl Default for BitTree {
    fn default() -> Self {
        Self::new()
    }
}

impl BitTree {
    pub fn new() -> Self {
        BitTree {
            root: Node::Leaf {
                payloads: Vec::new(),
                hashes: Vec::new(),
            },
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload `0` is reserved for tombstones (hammingtree.h reserves index 0 the same
    /// way); callers (media ids, or `(media_index << 16) | frame_number` encodings for
    /// C4) must never use it for a live entry.
    pub fn insert(&mut self, payload: u32, hash: Hamming) {
        debug_assert_ne!(payload, TOMBSTONE, "payload 0 is reserved as a tombstone");
        insert_node(&mut self.root, 0, payload, hash);
        self.len += 1;
    }

    pub fn insert_all(&mut self, items: impl IntoIterator<Item = (u32, Hamming)>) {
        for (payload, hash) in items {
            self.insert(payload, hash);
        }
    }

    /// Best-effort: descend the single bit-path indicated by `query` at each internal
    /// node, then scan the leaf linearly.
    pub fn find(&self, query: Hamming, threshold: u32) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        find_node(&self.root, query, threshold, &mut out);
        out
    }

    /// Zero out matching payload entries rather than physically removing them, matching
    /// `hammingtree.h::remove`'s tombstone approach.
    pub fn remove_any_of(&mut self, payloads: &[u32]) -> usize {
        let removed = remove_node(&mut self.root, payloads);
        self.len -= removed;
        removed
    }

    /// Restrict to a subtree containing only entries whose payload is in `keep`, rebuilt
    /// as its own freshly structured tree owned by the caller.
    pub fn slice(&self, keep: &std::collections::HashSet<u32>) -> BitTree {
        let mut payloads = Vec::new();
        let mut hashes = Vec::new();
        collect_matching(&self.root, keep, &mut payloads, &mut hashes);
        let len = payloads.len();
        let mut tree = BitTree::new();
        for (p, h) in payloads.into_iter().zip(hashes) {
            tree.insert(p, h);
        }
        debug_assert_eq!(tree.len, len);
        tree
    }

    pub fn stats(&self) -> Stats {
        let mut num_nodes = 0;
        let mut max_height = 0;
        node_stats(&self.root, 1, &mut num_nodes, &mut max_height);
        Stats {
            num_nodes,
            max_height,
            num_values: self.len,
        }
    }

    /// Pre-order serialization: `bool is_leaf`, then either `(bit, left, right)` or
    /// `(count, payload[], hash[])`.
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        write_node(&self.root, w)
    }

    pub fn read_from(r: &mut impl Read) -> io::Result<Self> {
        let (root, len) = read_node(r)?;
        Ok(BitTree { root, len })
    }
}

fn insert_node(node: &mut Node, depth: u32, payload: u32, hash: Hamming) {
    match node {
        Node::Leaf { payloads, hashes } => {
            if payloads.len() < MAX_LEAF_ENTRIES || depth >= MAX_DEPTH {
                payloads.push(payload);
                hashes.push(hash);
                return;
            }

            // Leaf is full: split on `bit = depth` and convert to internal.
            let bit = depth;
            let mut left_p = Vec::new();
            let mut left_h = Vec::new();
            let mut right_p = Vec::new();
            let mut right_h = Vec::new();
            for (p, h) in payloads.drain(..).zip(hashes.drain(..)) {
                if h.bit(bit) {
                    right_p.push(p);
                    right_h.push(h);
                } else {
                    left_p.push(p);
                    left_h.push(h);
                }
            }
            let mut left = Node::Leaf {
                payloads: left_p,
                hashes: left_h,
            };
            let mut right = Node::Leaf {
                payloads: right_p,
                hashes: right_h,
            };
            if hash.bit(bit) {
                insert_node(&mut right, depth + 1, payload, hash);
            } else {
                insert_node(&mut left, depth + 1, payload, hash);
            }
            *node = Node::Internal {
                bit,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Node::Internal { bit, left, right } => {
            if hash.bit(*bit) {
                insert_node(right, depth + 1, payload, hash);
            } else {
                insert_node(left, depth + 1, payload, hash);
            }
        }
    }
}

fn find_node(node: &Node, query: Hamming, threshold: u32, out: &mut Vec<(u32, u32)>) {
    match node {
        Node::Leaf { payloads, hashes } => {
            for (&p, &h) in payloads.iter().zip(hashes) {
                if p == TOMBSTONE {
                    continue;
                }
                let d = h.distance_to(query);
                if d < threshold {
                    out.push((p, d));
                }
            }
        }
        Node::Internal { bit, left, right } => {
            if query.bit(*bit) {
                find_node(right, query, threshold, out);
            } else {
                find_node(left, query, threshold, out);
            }
        }
    }
}

fn remove_node(node: &mut Node, payloads_to_remove: &[u32]) -> usize {
    match node {
        Node::Leaf { payloads, .. } => {
            let mut removed = 0;
            for p in payloads.iter_mut() {
                if *p != TOMBSTONE && payloads_to_remove.contains(p) {
                    *p = TOMBSTONE;
                    removed += 1;
                }
            }
            removed
        }
        Node::Internal { left, right, .. } => {
            remove_node(left, payloads_to_remove) + remove_node(right, payloads_to_remove)
        }
    }
}

fn collect_matching(
    node: &Node,
    keep: &std::collections::HashSet<u32>,
    out_p: &mut Vec<u32>,
    out_h: &mut Vec<Hamming>,
) {
    match node {
        Node::Leaf { payloads, hashes } => {
            for (&p, &h) in payloads.iter().zip(hashes) {
                if p != TOMBSTONE && keep.contains(&p) {
                    out_p.push(p);
                    out_h.push(h);
                }
            }
        }
        Node::Internal { left, right, .. } => {
            collect_matching(left, keep, out_p, out_h);
            collect_matching(right, keep, out_p, out_h);
        }
    }
}

fn node_stats(node: &Node, depth: usize, num_nodes: &mut usize, max_height: &mut usize) {
    *num_nodes += 1;
    *max_height = (*max_height).max(depth);
    if let Node::Internal { left, right, .. } = node {
        node_stats(left, depth + 1, num_nodes, max_height);
        node_stats(right, depth + 1, num_nodes, max_height);
    }
}

fn write_node(node: &Node, w: &mut impl Write) -> io::Result<()> {
    match node {
        Node::Leaf { payloads, hashes } => {
            w.write_all(&[1u8])?;
            w.write_all(&(payloads.len() as u32).to_le_bytes())?;
            for &p in payloads {
                w.write_all(&p.to_le_bytes())?;
            }
            for h in hashes {
                w.write_all(&h.0.to_le_bytes())?;
            }
            Ok(())
        }
        Node::Internal { bit, left, right } => {
            w.write_all(&[0u8])?;
            w.write_all(&bit.to_le_bytes())?;
            write_node(left, w)?;
            write_node(right, w)
        }
    }
}

fn read_node(r: &mut impl Read) -> io::Result<(Node, usize)> {
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)?;
    if tag[0] == 1 {
        let mut count_buf = [0u8; 4];
        r.read_exact(&mut count_buf)?;
        let count = u32::from_le_bytes(count_buf) as usize;
        let mut payloads = Vec::with_capacity(count);
        for _ in 0..count {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf)?;
            payloads.push(u32::from_le_bytes(buf));
        }
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf)?;
            hashes.push(Hamming(u64::from_le_bytes(buf)));
        }
        let live = payloads.iter().filter(|&&p| p != TOMBSTONE).count();
        Ok((Node::Leaf { payloads, hashes }, live))
    } else {
        let mut bit_buf = [0u8; 4];
        r.read_exact(&mut bit_buf)?;
        let bit = u32::from_le_bytes(bit_buf);
        let (left, left_len) = read_node(r)?;
        let (right, right_len) = read_node(r)?;
        Ok((
            Node::Internal {
                bit,
                left: Box::new(left),
                right: Box::new(right),
            },
            left_len + right_len,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    #[test]
    fn empty_tree_find_and_slice() {
        let tree = BitTree::new();
        assert_eq!(tree.find(Hamming(0), 10), vec![]);
        assert_eq!(tree.slice(&Default::default()).len(), 0);
    }

    #[test]
    fn insert_find_remove_roundtrip() {
        let mut tree = BitTree::new();
        tree.insert(1, Hamming(0x00));
        tree.insert(2, Hamming(0xFF));
        tree.insert(3, Hamming(0x0F));

        let found = tree.find(Hamming(0x00), 5);
        assert!(found.iter().any(|&(p, _)| p == 1));

        let removed = tree.remove_any_of(&[1]);
        assert_eq!(removed, 1);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn slice_never_yields_ids_outside_set() {
        let mut rng = SmallRng::seed_from_u64(99);
        let mut tree = BitTree::new();
        for id in 1..2000u32 {
            tree.insert(id, Hamming(rng.gen()));
        }

        let keep: std::collections::HashSet<u32> = (1..2000u32).step_by(3).collect();
        let sliced = tree.slice(&keep);

        for id in 1..2000u32 {
            let results = sliced.find(Hamming(id as u64), 64);
            for (p, _) in results {
                assert!(keep.contains(&p));
            }
        }
    }

    #[test]
    fn split_on_many_inserts_keeps_all_live() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut tree = BitTree::new();
        let n = 20_000u32;
        for id in 1..=n {
            tree.insert(id, Hamming(rng.gen()));
        }
        assert_eq!(tree.len(), n as usize);
        let stats = tree.stats();
        assert_eq!(stats.num_values, n as usize);
        assert!(stats.num_nodes > 1, "should have split at least once");
    }

    #[test]
    fn save_then_load_preserves_stats_and_find() {
        let mut rng = SmallRng::seed_from_u64(1234);
        let mut tree = BitTree::new();
        for id in 1..5000u32 {
            tree.insert(id, Hamming(rng.gen()));
        }
        let before = tree.stats();

        let mut buf = Vec::new();
        tree.write_to(&mut buf).unwrap();
        let loaded = BitTree::read_from(&mut &buf[..]).unwrap();
        let after = loaded.stats();

        assert_eq!(before.num_values, after.num_values);
        assert_eq!(before.max_height, after.max_height);

        for query in [Hamming(0), Hamming(u64::MAX), Hamming(0xABCD)] {
            assert_eq!(tree.find(query, 10), loaded.find(query, 10));
        }
    }
}
