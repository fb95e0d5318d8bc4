//! Character-level diff with semantic cleanup.
//!
//! Pipeline:
//! ```text
//! a, b ──► trim common prefix/suffix ──► Myers O(ND) ──► cleanup_semantic ──► cleanup_merge
//! ```
//!
//! All offsets are counted in Unicode scalar values, never bytes. The edit
//! script itself comes from `similar` (Myers, linear space, deadline bound).

use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffTag};
use std::ops::Range;
use std::time::{Duration, Instant};

/// Budget for one edit script before falling back to a coarser one.
pub const DIFF_TIMEOUT: Duration = Duration::from_secs(1);

/// Edit operation of a single diff run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Delete,
    Insert,
    Equal,
}

/// A run of text with one operation applied to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub op: Operation,
    pub text: String,
}

impl Diff {
    pub fn new(op: Operation, text: impl Into<String>) -> Self {
        Self { op, text: text.into() }
    }

    pub fn equal(text: impl Into<String>) -> Self {
        Self::new(Operation::Equal, text)
    }

    pub fn insert(text: impl Into<String>) -> Self {
        Self::new(Operation::Insert, text)
    }

    pub fn delete(text: impl Into<String>) -> Self {
        Self::new(Operation::Delete, text)
    }

    /// Length in chars.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Compute a semantically cleaned diff transforming `a` into `b`.
pub fn diff(a: &str, b: &str) -> Vec<Diff> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut diffs = diff_chars(&a, &b);
    cleanup_semantic(&mut diffs);
    diffs
}

/// Raw minimal diff without semantic cleanup.
pub fn diff_chars(a: &[char], b: &[char]) -> Vec<Diff> {
    if a == b {
        if a.is_empty() {
            return Vec::new();
        }
        return vec![Diff::equal(a.iter().collect::<String>())];
    }

    let prefix = common_prefix(a, b);
    let (a_rest, b_rest) = (&a[prefix..], &b[prefix..]);
    let suffix = common_suffix(a_rest, b_rest);
    let a_mid = &a_rest[..a_rest.len() - suffix];
    let b_mid = &b_rest[..b_rest.len() - suffix];

    let mut diffs = Vec::new();
    if prefix > 0 {
        diffs.push(Diff::equal(a[..prefix].iter().collect::<String>()));
    }
    diffs.extend(myers(a_mid, b_mid));
    if suffix > 0 {
        diffs.push(Diff::equal(a_rest[a_rest.len() - suffix..].iter().collect::<String>()));
    }
    cleanup_merge(&mut diffs);
    diffs
}

/// Text of the source side (equalities + deletions).
pub fn source_text(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .filter(|d| d.op != Operation::Insert)
        .map(|d| d.text.as_str())
        .collect()
}

/// Text of the destination side (equalities + insertions).
pub fn destination_text(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .filter(|d| d.op != Operation::Delete)
        .map(|d| d.text.as_str())
        .collect()
}

pub(crate) fn common_prefix(a: &[char], b: &[char]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

pub(crate) fn common_suffix(a: &[char], b: &[char]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Minimal edit script from `similar`'s Myers implementation, which runs in
/// linear space. Past [`DIFF_TIMEOUT`] it settles for a coarser script that
/// still transforms `a` into `b`.
fn myers(a: &[char], b: &[char]) -> Vec<Diff> {
    if a.is_empty() && b.is_empty() {
        return Vec::new();
    }
    if a.is_empty() {
        return vec![Diff::insert(b.iter().collect::<String>())];
    }
    if b.is_empty() {
        return vec![Diff::delete(a.iter().collect::<String>())];
    }

    let ops = similar::capture_diff_slices_deadline(
        Algorithm::Myers,
        a,
        b,
        Some(Instant::now() + DIFF_TIMEOUT),
    );

    let mut diffs: Vec<Diff> = Vec::new();
    for op in &ops {
        for (operation, side, range) in runs(op.as_tag_tuple()) {
            let text: String = side_of(a, b, side)[range].iter().collect();
            if text.is_empty() {
                continue;
            }
            match diffs.last_mut() {
                Some(last) if last.op == operation => last.text.push_str(&text),
                _ => diffs.push(Diff::new(operation, text)),
            }
        }
    }
    diffs
}

#[derive(Clone, Copy)]
enum Side {
    Old,
    New,
}

fn side_of<'a>(a: &'a [char], b: &'a [char], side: Side) -> &'a [char] {
    match side {
        Side::Old => a,
        Side::New => b,
    }
}

/// Split one `(tag, old, new)` op into single-sided runs. Replace becomes a
/// delete followed by an insert.
fn runs(
    (tag, old, new): (DiffTag, Range<usize>, Range<usize>),
) -> Vec<(Operation, Side, Range<usize>)> {
    match tag {
        DiffTag::Equal => vec![(Operation::Equal, Side::Old, old)],
        DiffTag::Delete => vec![(Operation::Delete, Side::Old, old)],
        DiffTag::Insert => vec![(Operation::Insert, Side::New, new)],
        DiffTag::Replace => vec![
            (Operation::Delete, Side::Old, old),
            (Operation::Insert, Side::New, new),
        ],
    }
}

/// Fold equalities that are no longer than the edits on both of their sides
/// into a delete+insert pair, so the script reads as whole-word replacements
/// rather than a scatter of one-char matches.
pub fn cleanup_semantic(diffs: &mut Vec<Diff>) {
    let mut changed = false;
    let mut equalities: Vec<usize> = Vec::new();
    let mut last_equality: Option<String> = None;
    let mut pointer: isize = 0;
    let (mut ins_before, mut del_before, mut ins_after, mut del_after) = (0usize, 0usize, 0usize, 0usize);

    while (pointer as usize) < diffs.len() {
        let p = pointer as usize;
        if diffs[p].op == Operation::Equal {
            equalities.push(p);
            ins_before = ins_after;
            del_before = del_after;
            ins_after = 0;
            del_after = 0;
            last_equality = Some(diffs[p].text.clone());
        } else {
            if diffs[p].op == Operation::Insert {
                ins_after += diffs[p].char_len();
            } else {
                del_after += diffs[p].char_len();
            }
            if let Some(equality) = last_equality.as_ref() {
                let len = equality.chars().count();
                if len <= ins_before.max(del_before) && len <= ins_after.max(del_after) {
                    if let Some(&idx) = equalities.last() {
                        diffs.insert(idx, Diff::delete(equality.clone()));
                        diffs[idx + 1].op = Operation::Insert;
                        equalities.pop();
                        equalities.pop();
                        pointer = equalities.last().map_or(-1, |&i| i as isize);
                        ins_before = 0;
                        del_before = 0;
                        ins_after = 0;
                        del_after = 0;
                        last_equality = None;
                        changed = true;
                    }
                }
            }
        }
        pointer += 1;
    }

    if changed {
        cleanup_merge(diffs);
    }
}

/// Normalise a diff: coalesce runs, order each edit block as delete then
/// insert, and factor shared prefixes/suffixes of a block into equalities.
pub fn cleanup_merge(diffs: &mut Vec<Diff>) {
    let mut out: Vec<Diff> = Vec::with_capacity(diffs.len());
    let mut deleted = String::new();
    let mut inserted = String::new();

    for d in diffs.drain(..) {
        match d.op {
            Operation::Delete => deleted.push_str(&d.text),
            Operation::Insert => inserted.push_str(&d.text),
            Operation::Equal => {
                flush_block(&mut out, &mut deleted, &mut inserted);
                push_equal(&mut out, &d.text);
            }
        }
    }
    flush_block(&mut out, &mut deleted, &mut inserted);
    *diffs = out;
}

fn flush_block(out: &mut Vec<Diff>, deleted: &mut String, inserted: &mut String) {
    let mut suffix = String::new();
    if !deleted.is_empty() && !inserted.is_empty() {
        let del: Vec<char> = deleted.chars().collect();
        let ins: Vec<char> = inserted.chars().collect();
        let prefix = common_prefix(&del, &ins);
        let tail = common_suffix(&del[prefix..], &ins[prefix..]);
        if prefix > 0 {
            push_equal(out, &del[..prefix].iter().collect::<String>());
        }
        suffix = del[del.len() - tail..].iter().collect();
        *deleted = del[prefix..del.len() - tail].iter().collect();
        *inserted = ins[prefix..ins.len() - tail].iter().collect();
    }
    if !deleted.is_empty() {
        out.push(Diff::delete(std::mem::take(deleted)));
    }
    if !inserted.is_empty() {
        out.push(Diff::insert(std::mem::take(inserted)));
    }
    push_equal(out, &suffix);
}

fn push_equal(out: &mut Vec<Diff>, text: &str) {
    if text.is_empty() {
        return;
    }
    match out.last_mut() {
        Some(last) if last.op == Operation::Equal => last.text.push_str(text),
        _ => out.push(Diff::equal(text)),
    }
}
