//! Patch codec: textual diffs grouped into context hunks.
//!
//! ```text
//! diff(a, b) ──► make_patches ──► PatchSet ──► to_text ──► wire / storage
//!                                    │
//!                                    ▼
//!                       apply(base) → (result, applied flags)
//! ```
//!
//! `apply` never fails as a whole: each hunk is located independently and
//! either applied or reported as `false` in the returned flags.

pub mod diff;
mod text;

pub use diff::{diff, Diff, Operation};
pub use text::PatchError;

use serde::{Deserialize, Serialize};
use std::fmt;

use diff::{destination_text, source_text};

/// Context chars kept on each side of a hunk.
pub const PATCH_MARGIN: usize = 4;

/// Upper bound for a hunk's source text when growing context for uniqueness.
pub const MAX_PATTERN_LEN: usize = 32;

/// One hunk: a diff fragment plus its position in the source and
/// destination texts (char offsets).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub diffs: Vec<Diff>,
    pub start1: usize,
    pub start2: usize,
    pub length1: usize,
    pub length2: usize,
}

impl Patch {
    /// Text the hunk expects to find (equalities + deletions).
    pub fn source_text(&self) -> String {
        source_text(&self.diffs)
    }

    /// Text the hunk leaves behind (equalities + insertions).
    pub fn destination_text(&self) -> String {
        destination_text(&self.diffs)
    }

    /// Surround the hunk with context from `text`, growing it until the
    /// hunk's source text occurs exactly once (or the bound is reached).
    fn add_context(&mut self, text: &[char]) {
        let mut padding = 0;
        loop {
            let lo = self.start2.saturating_sub(padding);
            let hi = (self.start2 + self.length1 + padding).min(text.len());
            let pattern = &text[lo..hi];
            let whole_text = lo == 0 && hi == text.len();
            if whole_text
                || is_unique(text, pattern)
                || pattern.len() + 2 * PATCH_MARGIN > MAX_PATTERN_LEN
            {
                break;
            }
            padding += PATCH_MARGIN;
        }
        padding += PATCH_MARGIN;

        let prefix_start = self.start2.saturating_sub(padding);
        let prefix: String = text[prefix_start..self.start2].iter().collect();
        let suffix_start = (self.start2 + self.length1).min(text.len());
        let suffix_end = (suffix_start + padding).min(text.len());
        let suffix: String = text[suffix_start..suffix_end].iter().collect();

        let prefix_len = self.start2 - prefix_start;
        let suffix_len = suffix_end - suffix_start;
        if !prefix.is_empty() {
            self.diffs.insert(0, Diff::equal(prefix));
        }
        if !suffix.is_empty() {
            self.diffs.push(Diff::equal(suffix));
        }
        self.start1 -= prefix_len;
        self.start2 -= prefix_len;
        self.length1 += prefix_len + suffix_len;
        self.length2 += prefix_len + suffix_len;
    }
}

/// Ordered list of hunks transforming one text into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    patches: Vec<Patch>,
}

impl PatchSet {
    pub fn new(patches: Vec<Patch>) -> Self {
        Self { patches }
    }

    /// Build the hunks that turn `a` into `b`.
    pub fn between(a: &str, b: &str) -> Self {
        make_patches(a, &diff(a, b))
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Patch> {
        self.patches.iter()
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn into_patches(self) -> Vec<Patch> {
        self.patches
    }

    /// Apply to `base`; see [`apply`].
    pub fn apply(&self, base: &str) -> (String, Vec<bool>) {
        apply(base, self)
    }
}

impl fmt::Display for PatchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl<'a> IntoIterator for &'a PatchSet {
    type Item = &'a Patch;
    type IntoIter = std::slice::Iter<'a, Patch>;

    fn into_iter(self) -> Self::IntoIter {
        self.patches.iter()
    }
}

/// Compute the hunks that transform `a` into `b`.
pub fn diff_patches(a: &str, b: &str) -> PatchSet {
    PatchSet::between(a, b)
}

/// Group a diff of `text1` into context hunks.
///
/// Equalities longer than two margins split hunks; shorter ones stay inside
/// the current hunk.
pub fn make_patches(text1: &str, diffs: &[Diff]) -> PatchSet {
    let mut patches = Vec::new();
    if diffs.is_empty() {
        return PatchSet::new(patches);
    }

    let mut patch = Patch::default();
    let mut count1 = 0usize;
    let mut count2 = 0usize;
    // prepatch: text with all previous hunks applied, in which the current
    // hunk starts at `start2`.
    let mut prepatch: Vec<char> = text1.chars().collect();
    let mut postpatch: Vec<char> = prepatch.clone();

    for (i, d) in diffs.iter().enumerate() {
        let len = d.char_len();
        if patch.diffs.is_empty() && d.op != Operation::Equal {
            patch.start1 = count1;
            patch.start2 = count2;
        }

        match d.op {
            Operation::Insert => {
                patch.diffs.push(d.clone());
                patch.length2 += len;
                postpatch.splice(count2..count2, d.text.chars());
            }
            Operation::Delete => {
                patch.length1 += len;
                patch.diffs.push(d.clone());
                postpatch.drain(count2..count2 + len);
            }
            Operation::Equal => {
                if len <= 2 * PATCH_MARGIN && !patch.diffs.is_empty() && i != diffs.len() - 1 {
                    patch.diffs.push(d.clone());
                    patch.length1 += len;
                    patch.length2 += len;
                } else if len >= 2 * PATCH_MARGIN && !patch.diffs.is_empty() {
                    patch.add_context(&prepatch);
                    patches.push(std::mem::take(&mut patch));
                    prepatch = postpatch.clone();
                    count1 = count2;
                }
            }
        }

        if d.op != Operation::Insert {
            count1 += len;
        }
        if d.op != Operation::Delete {
            count2 += len;
        }
    }

    if !patch.diffs.is_empty() {
        patch.add_context(&prepatch);
        patches.push(patch);
    }
    PatchSet::new(patches)
}

/// Apply hunks in order to `base`.
///
/// Each hunk is looked up at its expected offset (its destination start
/// corrected by the drift of earlier hunks) and, failing that, at the nearest
/// exact occurrence of its source text. Hunks that cannot be located are
/// skipped and flagged `false`.
pub fn apply(base: &str, patches: &PatchSet) -> (String, Vec<bool>) {
    let mut text: Vec<char> = base.chars().collect();
    let mut flags = Vec::with_capacity(patches.len());
    let mut drift: isize = 0;

    for patch in patches {
        let expected = (patch.start2 as isize + drift).max(0) as usize;
        let source: Vec<char> = patch.source_text().chars().collect();
        match locate(&text, &source, expected) {
            Some(loc) => {
                text.splice(loc..loc + source.len(), patch.destination_text().chars());
                drift = loc as isize - patch.start2 as isize;
                flags.push(true);
            }
            None => {
                log::debug!(
                    "Hunk @{} ({} chars) not found near offset {expected}",
                    patch.start1,
                    source.len()
                );
                drift -= patch.length2 as isize - patch.length1 as isize;
                flags.push(false);
            }
        }
    }

    (text.into_iter().collect(), flags)
}

fn locate(text: &[char], pattern: &[char], expected: usize) -> Option<usize> {
    let expected = expected.min(text.len());
    if pattern.is_empty() {
        return Some(expected);
    }
    if text.get(expected..expected + pattern.len()) == Some(pattern) {
        return Some(expected);
    }
    let forward = find_from(text, pattern, expected);
    let backward = rfind_before(text, pattern, expected);
    match (forward, backward) {
        (Some(f), Some(b)) => Some(if f - expected <= expected - b { f } else { b }),
        (f, b) => f.or(b),
    }
}

fn find_from(text: &[char], pattern: &[char], from: usize) -> Option<usize> {
    if pattern.len() > text.len() {
        return None;
    }
    (from..=text.len() - pattern.len()).find(|&i| &text[i..i + pattern.len()] == pattern)
}

fn rfind_before(text: &[char], pattern: &[char], before: usize) -> Option<usize> {
    if pattern.len() > text.len() {
        return None;
    }
    let last = before.min(text.len() - pattern.len());
    (0..=last).rev().find(|&i| &text[i..i + pattern.len()] == pattern)
}

fn is_unique(text: &[char], pattern: &[char]) -> bool {
    if pattern.is_empty() {
        return false;
    }
    match find_from(text, pattern, 0) {
        Some(first) => find_from(text, pattern, first + 1).is_none(),
        None => true,
    }
}
