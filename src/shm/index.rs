/// Ordered entry index over raw entry records.
///
/// An AVL tree whose left/right/height fields are embedded in each entry
/// and link by [`EntryId`], so the tree means the same thing wherever the
/// arena is mapped. Nodes are ordered by `(hash, key)`: the short hash
/// first, byte-wise key comparison on a hash collision.
///
/// Callers hold the cache lock and guarantee key uniqueness (a lookup in
/// the same critical section precedes every insert).
use std::cmp::Ordering;

use super::layout::{Entry, EntryId, NIL};
use crate::key::KEY_SIZE;

#[inline]
fn compare(entries: &[Entry], hash: u32, key: &[u8; KEY_SIZE], node: EntryId) -> Ordering {
    let n = &entries[node as usize];
    hash.cmp(&n.hash).then_with(|| key.cmp(&n.key))
}

#[inline]
fn height(entries: &[Entry], node: EntryId) -> u32 {
    if node == NIL {
        0
    } else {
        entries[node as usize].height
    }
}

/// Exact-match lookup. No side effects.
pub fn lookup(
    entries: &[Entry],
    root: EntryId,
    hash: u32,
    key: &[u8; KEY_SIZE],
) -> Option<EntryId> {
    let mut node = root;
    while node != NIL {
        node = match compare(entries, hash, key, node) {
            Ordering::Less => entries[node as usize].left,
            Ordering::Greater => entries[node as usize].right,
            Ordering::Equal => return Some(node),
        };
    }
    None
}

/// Insert `id`, whose hash and key are already set.
pub fn insert(entries: &mut [Entry], root: &mut EntryId, id: EntryId) {
    *root = insert_at(entries, *root, id);
}

/// Remove `id` from the tree. Returns false if it was not found.
pub fn remove(entries: &mut [Entry], root: &mut EntryId, id: EntryId) -> bool {
    let (hash, key) = {
        let e = &entries[id as usize];
        (e.hash, e.key)
    };
    let mut found = false;
    *root = remove_at(entries, *root, hash, &key, &mut found);
    if found {
        let e = &mut entries[id as usize];
        e.left = NIL;
        e.right = NIL;
        e.height = 0;
    }
    found
}

fn insert_at(entries: &mut [Entry], node: EntryId, id: EntryId) -> EntryId {
    if node == NIL {
        let e = &mut entries[id as usize];
        e.left = NIL;
        e.right = NIL;
        e.height = 1;
        return id;
    }

    let (hash, key) = {
        let e = &entries[id as usize];
        (e.hash, e.key)
    };
    if compare(entries, hash, &key, node) == Ordering::Less {
        let left = insert_at(entries, entries[node as usize].left, id);
        entries[node as usize].left = left;
    } else {
        let right = insert_at(entries, entries[node as usize].right, id);
        entries[node as usize].right = right;
    }
    rebalance(entries, node)
}

fn remove_at(
    entries: &mut [Entry],
    node: EntryId,
    hash: u32,
    key: &[u8; KEY_SIZE],
    found: &mut bool,
) -> EntryId {
    if node == NIL {
        return NIL;
    }

    match compare(entries, hash, key, node) {
        Ordering::Less => {
            let left = remove_at(entries, entries[node as usize].left, hash, key, found);
            entries[node as usize].left = left;
        }
        Ordering::Greater => {
            let right = remove_at(entries, entries[node as usize].right, hash, key, found);
            entries[node as usize].right = right;
        }
        Ordering::Equal => {
            *found = true;
            let (left, right) = {
                let n = &entries[node as usize];
                (n.left, n.right)
            };
            if left == NIL {
                return right;
            }
            if right == NIL {
                return left;
            }
            // replace the node with the minimum of its right subtree
            let (min, right) = remove_min(entries, right);
            let m = &mut entries[min as usize];
            m.left = left;
            m.right = right;
            return rebalance(entries, min);
        }
    }
    rebalance(entries, node)
}

/// Detach the leftmost node of the subtree; returns (min, new subtree root).
fn remove_min(entries: &mut [Entry], node: EntryId) -> (EntryId, EntryId) {
    let left = entries[node as usize].left;
    if left == NIL {
        return (node, entries[node as usize].right);
    }
    let (min, left) = remove_min(entries, left);
    entries[node as usize].left = left;
    (min, rebalance(entries, node))
}

fn update_height(entries: &mut [Entry], node: EntryId) {
    let (left, right) = {
        let n = &entries[node as usize];
        (n.left, n.right)
    };
    let h = 1 + height(entries, left).max(height(entries, right));
    entries[node as usize].height = h;
}

fn rotate_right(entries: &mut [Entry], node: EntryId) -> EntryId {
    let pivot = entries[node as usize].left;
    entries[node as usize].left = entries[pivot as usize].right;
    entries[pivot as usize].right = node;
    update_height(entries, node);
    update_height(entries, pivot);
    pivot
}

fn rotate_left(entries: &mut [Entry], node: EntryId) -> EntryId {
    let pivot = entries[node as usize].right;
    entries[node as usize].right = entries[pivot as usize].left;
    entries[pivot as usize].left = node;
    update_height(entries, node);
    update_height(entries, pivot);
    pivot
}

fn rebalance(entries: &mut [Entry], node: EntryId) -> EntryId {
    update_height(entries, node);
    let (left, right) = {
        let n = &entries[node as usize];
        (n.left, n.right)
    };
    let (hl, hr) = (height(entries, left), height(entries, right));

    if hl > hr + 1 {
        let l = &entries[left as usize];
        if height(entries, l.left) < height(entries, l.right) {
            let left = rotate_left(entries, left);
            entries[node as usize].left = left;
        }
        return rotate_right(entries, node);
    }
    if hr > hl + 1 {
        let r = &entries[right as usize];
        if height(entries, r.right) < height(entries, r.left) {
            let right = rotate_right(entries, right);
            entries[node as usize].right = right;
        }
        return rotate_left(entries, node);
    }
    node
}

/// Verify ordering, balance and heights; returns the node count.
///
/// Visits at most `entries.len()` nodes, so a cycle is reported rather
/// than followed forever.
pub fn check(entries: &[Entry], root: EntryId) -> Result<usize, String> {
    let mut count = 0usize;
    // (node, lower bound, upper bound) in (hash, key) order
    let mut stack: Vec<(EntryId, Option<EntryId>, Option<EntryId>)> = Vec::new();
    if root != NIL {
        stack.push((root, None, None));
    }

    while let Some((node, lo, hi)) = stack.pop() {
        let Some(n) = entries.get(node as usize) else {
            return Err(format!("index link {node} out of range"));
        };
        count += 1;
        if count > entries.len() {
            return Err("index contains a cycle".into());
        }
        if let Some(lo) = lo {
            if compare(entries, n.hash, &n.key, lo) != Ordering::Greater {
                return Err(format!("index node {node} not above its lower bound {lo}"));
            }
        }
        if let Some(hi) = hi {
            if compare(entries, n.hash, &n.key, hi) != Ordering::Less {
                return Err(format!("index node {node} not below its upper bound {hi}"));
            }
        }
        let (hl, hr) = (height(entries, n.left), height(entries, n.right));
        if n.height != 1 + hl.max(hr) || hl.abs_diff(hr) > 1 {
            return Err(format!("index node {node} is unbalanced or has a stale height"));
        }
        if n.left != NIL {
            stack.push((n.left, lo, Some(node)));
        }
        if n.right != NIL {
            stack.push((n.right, Some(node), hi));
        }
    }
    Ok(count)
}
