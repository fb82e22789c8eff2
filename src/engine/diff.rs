//! Change computation between two versions of the same target.
//!
//! Used by the reference engine to build [`RawChange`] payloads. Indices for
//! deletions and pre-change modifications refer to the old contents; indices
//! for insertions and post-change modifications refer to the new contents.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::engine::RawChange;
use crate::types::{ObjectKey, Row};

/// Diffs two key-ordered result sets.
///
/// `modified` is asked about every key present on both sides.
pub fn diff_keys(
    old: &[ObjectKey],
    new: &[ObjectKey],
    mut modified: impl FnMut(ObjectKey) -> bool,
) -> RawChange {
    let mut deletions = Vec::new();
    let mut insertions = Vec::new();
    let mut modifications = Vec::new();
    let mut modifications_new = Vec::new();

    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        match (old.get(i), new.get(j)) {
            (Some(a), Some(b)) if a == b => {
                if modified(*a) {
                    modifications.push(i);
                    modifications_new.push(j);
                }
                i += 1;
                j += 1;
            }
            (Some(a), Some(b)) if a < b => {
                deletions.push(i);
                i += 1;
            }
            (Some(_), Some(_)) => {
                insertions.push(j);
                j += 1;
            }
            (Some(_), None) => {
                deletions.push(i);
                i += 1;
            }
            (None, Some(_)) => {
                insertions.push(j);
                j += 1;
            }
            (None, None) => break,
        }
    }

    RawChange::collection(deletions, insertions, modifications, modifications_new)
}

/// Edit distance past which a list diff stops looking for a minimal script
/// and reports the differing middle as replaced wholesale.
const MAX_EDIT_DISTANCE: usize = 1024;

/// Diffs two value sequences.
///
/// The common prefix and suffix are stripped, then the middle is diffed with
/// Myers' algorithm, bounded by [`MAX_EDIT_DISTANCE`]. Values outside the
/// common subsequence are reported as deletions (old side) and insertions
/// (new side). Positional lists carry no identity, so there are never
/// modifications.
pub fn diff_values(old: &[Value], new: &[Value]) -> RawChange {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let (deletions, insertions) = myers(old_mid, new_mid, MAX_EDIT_DISTANCE)
        .unwrap_or_else(|| ((0..old_mid.len()).collect(), (0..new_mid.len()).collect()));

    RawChange::collection(
        deletions.into_iter().map(|i| i + prefix).collect(),
        insertions.into_iter().map(|j| j + prefix).collect(),
        Vec::new(),
        Vec::new(),
    )
}

/// Shortest edit script between `old` and `new` as (deleted old indices,
/// inserted new indices), or `None` if it needs more than `limit` edits.
///
/// Keeps one frontier per edit step, so memory is O(D²) and time O((N+M)·D)
/// for an edit distance D.
fn myers(old: &[Value], new: &[Value], limit: usize) -> Option<(Vec<usize>, Vec<usize>)> {
    let (n, m) = (old.len() as isize, new.len() as isize);
    let max = (old.len() + new.len()).min(limit) as isize;
    let offset = max + 1;
    // v[k + offset]: furthest x reached on diagonal k = x - y
    let mut v = vec![0isize; (2 * offset + 1) as usize];
    // trace[d]: v over diagonals -d-1..=d+1 before step d
    let mut trace: Vec<Vec<isize>> = Vec::new();

    for d in 0..=max {
        trace.push(v[(offset - d - 1) as usize..=(offset + d + 1) as usize].to_vec());
        for k in (-d..=d).step_by(2) {
            let at = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[at - 1] < v[at + 1]) {
                v[at + 1]
            } else {
                v[at - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && old[x as usize] == new[y as usize] {
                x += 1;
                y += 1;
            }
            v[at] = x;
            if x >= n && y >= m {
                return Some(backtrack(&trace, n, m));
            }
        }
    }
    None
}

fn backtrack(trace: &[Vec<isize>], n: isize, m: isize) -> (Vec<usize>, Vec<usize>) {
    let mut deletions = Vec::new();
    let mut insertions = Vec::new();
    let (mut x, mut y) = (n, m);

    for (d, frontier) in trace.iter().enumerate().skip(1).rev() {
        let d = d as isize;
        let reached = |k: isize| frontier[(k + d + 1) as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && reached(k - 1) < reached(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = reached(prev_k);
        let prev_y = prev_x - prev_k;
        if prev_k == k + 1 {
            insertions.push(prev_y as usize);
        } else {
            deletions.push(prev_x as usize);
        }
        x = prev_x;
        y = prev_y;
    }

    deletions.reverse();
    insertions.reverse();
    (deletions, insertions)
}

/// Diffs two maps by key.
pub fn diff_map(old: &BTreeMap<String, Value>, new: &BTreeMap<String, Value>) -> RawChange {
    let deleted = old
        .keys()
        .filter(|k| !new.contains_key(*k))
        .cloned()
        .collect();
    let inserted = new
        .keys()
        .filter(|k| !old.contains_key(*k))
        .cloned()
        .collect();
    let modified = new
        .iter()
        .filter(|(k, v)| old.get(*k).is_some_and(|prev| prev != *v))
        .map(|(k, _)| k.clone())
        .collect();
    RawChange::keyed(deleted, inserted, modified)
}

/// Field names whose value differs between two rows, in field order.
pub fn changed_fields(old: &Row, new: &Row) -> Vec<String> {
    let mut fields: Vec<String> = new
        .iter()
        .filter(|(name, value)| old.get(*name) != Some(*value))
        .map(|(name, _)| name.clone())
        .collect();
    fields.extend(old.keys().filter(|name| !new.contains_key(*name)).cloned());
    fields.sort();
    fields
}
