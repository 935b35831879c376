//! The saved-sessions store: an ordered map from `repeat_at` to the sessions due to
//! replay at that time, implemented as a red-black tree over an arena of nodes
//! addressed by integer index (spec §4.5/§9).
//!
//! Using indices instead of owning pointers means parent back-links don't form a
//! reference cycle, and `clone()` is a flat pass over the arena plus an index remap
//! rather than a deep pointer-chasing copy.

use crate::error::{Error, Result};
use crate::sessions::session::Session;
use crate::uvarint;

const NONE: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug, Clone)]
struct Node {
    key: u64,
    values: Vec<Session>,
    left: usize,
    right: usize,
    parent: usize,
    color: Color,
}

/// `repeat_at: u64 -> Vec<Session>`, ordered by `repeat_at`. Equal keys stack in
/// insertion order.
#[derive(Debug, Default)]
pub struct SavedSessions {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    root: usize,
    /// Total number of sessions across all keys (not node count).
    size: usize,
}

impl SavedSessions {
    pub fn new() -> Self {
        SavedSessions {
            nodes: Vec::new(),
            free: Vec::new(),
            root: NONE,
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Inserts `session` under `repeat_at`, appending to the existing bucket if the
    /// key is already present.
    pub fn add(&mut self, repeat_at: u64, session: Session) {
        self.size += 1;
        if self.root == NONE {
            self.root = self.alloc_node(repeat_at, session, Color::Black, NONE);
            return;
        }
        let mut cur = self.root;
        loop {
            let k = self.key(cur);
            if repeat_at == k {
                self.nodes[cur].as_mut().unwrap().values.push(session);
                return;
            } else if repeat_at < k {
                let l = self.left(cur);
                if l == NONE {
                    let idx = self.alloc_node(repeat_at, session, Color::Red, cur);
                    self.set_left(cur, idx);
                    self.insert_fixup(idx);
                    return;
                }
                cur = l;
            } else {
                let r = self.right(cur);
                if r == NONE {
                    let idx = self.alloc_node(repeat_at, session, Color::Red, cur);
                    self.set_right(cur, idx);
                    self.insert_fixup(idx);
                    return;
                }
                cur = r;
            }
        }
    }

    /// The leftmost `(repeat_at, first session)` pair, if the store is non-empty.
    pub fn first(&self) -> Option<(u64, &Session)> {
        if self.root == NONE {
            return None;
        }
        let m = self.minimum(self.root);
        let node = self.nodes[m].as_ref().unwrap();
        node.values.first().map(|s| (node.key, s))
    }

    /// Pops the first session of the leftmost key, removing the node if its bucket
    /// becomes empty.
    pub fn first_commit(&mut self) -> Option<(u64, Session)> {
        if self.root == NONE {
            return None;
        }
        let m = self.minimum(self.root);
        let key = self.key(m);
        let node = self.nodes[m].as_mut().unwrap();
        if node.values.is_empty() {
            return None;
        }
        let session = node.values.remove(0);
        let now_empty = node.values.is_empty();
        if now_empty {
            self.delete_node(m);
        }
        self.size -= 1;
        Some((key, session))
    }

    /// A structural deep copy: every node and value vector is freshly allocated, and
    /// the clone shares nothing with `self`. Intended for handing off to a background
    /// snapshotter that mutates its own copy while the live tree keeps accepting
    /// inserts.
    pub fn deep_clone(&self) -> SavedSessions {
        let mut remap = vec![NONE; self.nodes.len()];
        let mut new_nodes = Vec::with_capacity(self.nodes.len());
        for (old_idx, slot) in self.nodes.iter().enumerate() {
            if let Some(node) = slot {
                remap[old_idx] = new_nodes.len();
                new_nodes.push(Some(Node {
                    key: node.key,
                    values: node.values.clone(),
                    left: NONE,
                    right: NONE,
                    parent: NONE,
                    color: node.color,
                }));
            }
        }
        for (old_idx, slot) in self.nodes.iter().enumerate() {
            if let Some(node) = slot {
                let new_idx = remap[old_idx];
                let new_node = new_nodes[new_idx].as_mut().unwrap();
                new_node.left = remap_idx(&remap, node.left);
                new_node.right = remap_idx(&remap, node.right);
                new_node.parent = remap_idx(&remap, node.parent);
            }
        }
        SavedSessions {
            nodes: new_nodes,
            free: Vec::new(),
            root: remap_idx(&remap, self.root),
            size: self.size,
        }
    }

    /// `uvarint(total_sessions)` followed by `(repeat: u64 LE, uvarint(len), bytes)*`
    /// in ascending-key, in-order-traversal order.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        uvarint::write(out, self.size as u64)?;
        self.encode_subtree(self.root, out)
    }

    fn encode_subtree(&self, idx: usize, out: &mut Vec<u8>) -> Result<()> {
        if idx == NONE {
            return Ok(());
        }
        let node = self.nodes[idx].as_ref().unwrap();
        self.encode_subtree(node.left, out)?;
        for session in &node.values {
            let mut session_buf = Vec::new();
            session.encode(&mut session_buf)?;
            out.extend_from_slice(&node.key.to_le_bytes());
            uvarint::write(out, session_buf.len() as u64)?;
            out.extend_from_slice(&session_buf);
        }
        self.encode_subtree(node.right, out)
    }

    pub fn decode(buf: &[u8]) -> Result<SavedSessions> {
        let (count, mut rest) = uvarint::read(buf)?;
        let mut store = SavedSessions::new();
        for _ in 0..count {
            let (key_bytes, after_key) = crate::byteop::split(rest, 8)?;
            let key = u64::from_le_bytes(key_bytes.try_into().unwrap());
            let (len, after_len) = uvarint::read(after_key)?;
            let (session_buf, after_session) = crate::byteop::split(after_len, len as usize)?;
            let (session, session_rest) = Session::decode(session_buf)?;
            if !session_rest.is_empty() {
                return Err(Error::invalid_encoding(
                    0,
                    "trailing bytes after decoding one saved session",
                ));
            }
            store.add(key, session);
            rest = after_session;
        }
        Ok(store)
    }

    // --- arena plumbing ---

    fn alloc_node(&mut self, key: u64, session: Session, color: Color, parent: usize) -> usize {
        let node = Node {
            key,
            values: vec![session],
            left: NONE,
            right: NONE,
            parent,
            color,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn free_node(&mut self, idx: usize) {
        self.nodes[idx] = None;
        self.free.push(idx);
    }

    fn key(&self, i: usize) -> u64 {
        self.nodes[i].as_ref().unwrap().key
    }

    fn left(&self, i: usize) -> usize {
        if i == NONE {
            NONE
        } else {
            self.nodes[i].as_ref().unwrap().left
        }
    }

    fn right(&self, i: usize) -> usize {
        if i == NONE {
            NONE
        } else {
            self.nodes[i].as_ref().unwrap().right
        }
    }

    fn parent(&self, i: usize) -> usize {
        if i == NONE {
            NONE
        } else {
            self.nodes[i].as_ref().unwrap().parent
        }
    }

    fn color(&self, i: usize) -> Color {
        if i == NONE {
            Color::Black
        } else {
            self.nodes[i].as_ref().unwrap().color
        }
    }

    fn set_left(&mut self, i: usize, v: usize) {
        self.nodes[i].as_mut().unwrap().left = v;
    }

    fn set_right(&mut self, i: usize, v: usize) {
        self.nodes[i].as_mut().unwrap().right = v;
    }

    fn set_parent(&mut self, i: usize, v: usize) {
        if i != NONE {
            self.nodes[i].as_mut().unwrap().parent = v;
        }
    }

    fn set_color(&mut self, i: usize, c: Color) {
        if i != NONE {
            self.nodes[i].as_mut().unwrap().color = c;
        }
    }

    fn minimum(&self, mut x: usize) -> usize {
        while self.left(x) != NONE {
            x = self.left(x);
        }
        x
    }

    fn rotate_left(&mut self, x: usize) {
        let y = self.right(x);
        let y_left = self.left(y);
        self.set_right(x, y_left);
        if y_left != NONE {
            self.set_parent(y_left, x);
        }
        let px = self.parent(x);
        self.set_parent(y, px);
        if px == NONE {
            self.root = y;
        } else if x == self.left(px) {
            self.set_left(px, y);
        } else {
            self.set_right(px, y);
        }
        self.set_left(y, x);
        self.set_parent(x, y);
    }

    fn rotate_right(&mut self, x: usize) {
        let y = self.left(x);
        let y_right = self.right(y);
        self.set_left(x, y_right);
        if y_right != NONE {
            self.set_parent(y_right, x);
        }
        let px = self.parent(x);
        self.set_parent(y, px);
        if px == NONE {
            self.root = y;
        } else if x == self.left(px) {
            self.set_left(px, y);
        } else {
            self.set_right(px, y);
        }
        self.set_right(y, x);
        self.set_parent(x, y);
    }

    fn insert_fixup(&mut self, mut z: usize) {
        while self.color(self.parent(z)) == Color::Red {
            let p = self.parent(z);
            let gp = self.parent(p);
            if p == self.left(gp) {
                let y = self.right(gp);
                if self.color(y) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(y, Color::Black);
                    self.set_color(gp, Color::Red);
                    z = gp;
                } else {
                    if z == self.right(p) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.parent(z);
                    let gp = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(gp, Color::Red);
                    self.rotate_right(gp);
                }
            } else {
                let y = self.left(gp);
                if self.color(y) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(y, Color::Black);
                    self.set_color(gp, Color::Red);
                    z = gp;
                } else {
                    if z == self.left(p) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.parent(z);
                    let gp = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(gp, Color::Red);
                    self.rotate_left(gp);
                }
            }
        }
        self.set_color(self.root, Color::Black);
    }

    /// Removes `z` (whose value bucket is already empty) from the tree, rebalancing
    /// via the canonical three-case deletion (swap with in-order successor when two
    /// children; relink when one; rebalance when removing a black leaf).
    fn delete_node(&mut self, z: usize) {
        let mut y = z;
        let mut y_original_color = self.color(y);
        let x;
        let x_parent;

        if self.left(z) == NONE {
            x = self.right(z);
            x_parent = self.parent(z);
            self.transplant(z, x);
        } else if self.right(z) == NONE {
            x = self.left(z);
            x_parent = self.parent(z);
            self.transplant(z, x);
        } else {
            y = self.minimum(self.right(z));
            y_original_color = self.color(y);
            x = self.right(y);
            if self.parent(y) == z {
                x_parent = y;
            } else {
                x_parent = self.parent(y);
                self.transplant(y, self.right(y));
                let zr = self.right(z);
                self.set_right(y, zr);
                self.set_parent(zr, y);
            }
            self.transplant(z, y);
            let zl = self.left(z);
            self.set_left(y, zl);
            self.set_parent(zl, y);
            self.set_color(y, self.color(z));
        }

        self.free_node(z);

        if y_original_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }
    }

    fn transplant(&mut self, u: usize, v: usize) {
        let pu = self.parent(u);
        if pu == NONE {
            self.root = v;
        } else if u == self.left(pu) {
            self.set_left(pu, v);
        } else {
            self.set_right(pu, v);
        }
        if v != NONE {
            self.set_parent(v, pu);
        }
    }

    fn delete_fixup(&mut self, mut x: usize, mut x_parent: usize) {
        while x != self.root && self.color(x) == Color::Black {
            if x == self.left(x_parent) {
                let mut w = self.right(x_parent);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_left(x_parent);
                    w = self.right(x_parent);
                }
                if self.color(self.left(w)) == Color::Black && self.color(self.right(w)) == Color::Black {
                    self.set_color(w, Color::Red);
                    x = x_parent;
                    x_parent = self.parent(x);
                } else {
                    if self.color(self.right(w)) == Color::Black {
                        self.set_color(self.left(w), Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_right(w);
                        w = self.right(x_parent);
                    }
                    self.set_color(w, self.color(x_parent));
                    self.set_color(x_parent, Color::Black);
                    self.set_color(self.right(w), Color::Black);
                    self.rotate_left(x_parent);
                    x = self.root;
                    x_parent = NONE;
                }
            } else {
                let mut w = self.left(x_parent);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_right(x_parent);
                    w = self.left(x_parent);
                }
                if self.color(self.right(w)) == Color::Black && self.color(self.left(w)) == Color::Black {
                    self.set_color(w, Color::Red);
                    x = x_parent;
                    x_parent = self.parent(x);
                } else {
                    if self.color(self.left(w)) == Color::Black {
                        self.set_color(self.right(w), Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_left(w);
                        w = self.left(x_parent);
                    }
                    self.set_color(w, self.color(x_parent));
                    self.set_color(x_parent, Color::Black);
                    self.set_color(self.left(w), Color::Black);
                    self.rotate_right(x_parent);
                    x = self.root;
                    x_parent = NONE;
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    /// Ascending-key dump of `(repeat_at, &Session)` pairs, for tests and equality
    /// checks.
    #[cfg(test)]
    fn to_vec(&self) -> Vec<(u64, Session)> {
        let mut out = Vec::new();
        self.collect(self.root, &mut out);
        out
    }

    #[cfg(test)]
    fn collect(&self, idx: usize, out: &mut Vec<(u64, Session)>) {
        if idx == NONE {
            return;
        }
        let node = self.nodes[idx].as_ref().unwrap();
        self.collect(node.left, out);
        for s in &node.values {
            out.push((node.key, s.clone()));
        }
        self.collect(node.right, out);
    }
}

impl Clone for SavedSessions {
    fn clone(&self) -> Self {
        self.deep_clone()
    }
}

fn remap_idx(remap: &[usize], idx: usize) -> usize {
    if idx == NONE {
        NONE
    } else {
        remap[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_index::StateIndex;
    use bytes::Bytes;

    fn session(tag: &str) -> Session {
        Session::new(StateIndex::new(1, 0), 0, Bytes::from(tag.as_bytes().to_vec()))
    }

    #[test]
    fn ordering_scenario_from_spec() {
        // Scenario 4 from the testable-properties list.
        let mut store = SavedSessions::new();
        store.add(1, session("1.1"));
        store.add(2, session("2"));
        store.add(1, session("1.2"));

        assert_eq!(store.first().map(|(k, s)| (k, s.data.clone())), Some((1, Bytes::from_static(b"1.1"))));
        let (k, s) = store.first_commit().unwrap();
        assert_eq!((k, s.data), (1, Bytes::from_static(b"1.1")));

        assert_eq!(store.first().map(|(k, s)| (k, s.data.clone())), Some((1, Bytes::from_static(b"1.2"))));
        let (k, s) = store.first_commit().unwrap();
        assert_eq!((k, s.data), (1, Bytes::from_static(b"1.2")));

        assert_eq!(store.first().map(|(k, s)| (k, s.data.clone())), Some((2, Bytes::from_static(b"2"))));
        let (k, s) = store.first_commit().unwrap();
        assert_eq!((k, s.data), (2, Bytes::from_static(b"2")));

        assert!(store.first().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn stays_ordered_under_many_random_like_inserts() {
        let mut store = SavedSessions::new();
        let keys = [50u64, 10, 90, 30, 70, 20, 80, 40, 60, 5, 95, 25, 75];
        for &k in &keys {
            store.add(k, session("x"));
        }
        let mut prev = None;
        while let Some((k, _)) = store.first_commit() {
            if let Some(p) = prev {
                assert!(k >= p);
            }
            prev = Some(k);
        }
        assert!(store.is_empty());
    }

    #[test]
    fn deep_clone_is_independent_of_the_source() {
        let mut store = SavedSessions::new();
        store.add(1, session("a"));
        store.add(2, session("b"));
        let clone = store.deep_clone();

        store.add(3, session("c"));
        store.first_commit();

        assert_eq!(clone.len(), 2);
        assert_eq!(
            clone.to_vec().into_iter().map(|(k, _)| k).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn encode_decode_round_trips_preserving_per_key_order() {
        let mut store = SavedSessions::new();
        store.add(5, session("5.1"));
        store.add(1, session("1.1"));
        store.add(5, session("5.2"));
        store.add(3, session("3.1"));

        let mut buf = Vec::new();
        store.encode(&mut buf).unwrap();
        let decoded = SavedSessions::decode(&buf).unwrap();

        assert_eq!(decoded.len(), store.len());
        assert_eq!(decoded.to_vec(), store.to_vec());
    }

    proptest::proptest! {
        #[test]
        fn prop_encode_decode_round_trips_arbitrary_inserts(
            keys in proptest::collection::vec(0u64..20, 0..30),
        ) {
            let mut store = SavedSessions::new();
            for (i, k) in keys.iter().enumerate() {
                store.add(*k, session(&format!("s{i}")));
            }
            let mut buf = Vec::new();
            store.encode(&mut buf).unwrap();
            let decoded = SavedSessions::decode(&buf).unwrap();
            proptest::prop_assert_eq!(decoded.len(), store.len());
            proptest::prop_assert_eq!(decoded.to_vec(), store.to_vec());

            let mut prev = None;
            for (k, _) in decoded.to_vec() {
                if let Some(p) = prev {
                    proptest::prop_assert!(k >= p);
                }
                prev = Some(k);
            }
        }
    }
}
