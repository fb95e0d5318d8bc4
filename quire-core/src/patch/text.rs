//! Text form of a [`PatchSet`], used on the wire and in logs.
//!
//! ```text
//! @@ -1,8 +1,9 @@
//!  lo World
//! +!
//! ```
//!
//! Each body line starts with ` ` (equal), `-` (delete) or `+` (insert)
//! followed by the percent-encoded run text, so newlines inside a run never
//! break the line structure.

use thiserror::Error;

use super::{Diff, Operation, Patch, PatchSet};
use crate::ErrorKind;

/// Bytes that stay literal inside a run.
const LITERAL: &[u8] = b" !#$&'()*+,-./:;=?@_~";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("malformed patch at line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

impl PatchError {
    fn at(line: usize, reason: impl Into<String>) -> Self {
        PatchError::Malformed { line: line + 1, reason: reason.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidInput
    }
}

impl PatchSet {
    /// Serialize to the hunk text form.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for patch in self.iter() {
            out.push_str(&format!(
                "@@ -{} +{} @@\n",
                format_range(patch.start1, patch.length1),
                format_range(patch.start2, patch.length2)
            ));
            for d in &patch.diffs {
                out.push(match d.op {
                    Operation::Equal => ' ',
                    Operation::Delete => '-',
                    Operation::Insert => '+',
                });
                out.push_str(&encode_run(&d.text));
                out.push('\n');
            }
        }
        out
    }

    /// Parse the hunk text form produced by [`PatchSet::to_text`].
    pub fn from_text(text: &str) -> Result<Self, PatchError> {
        let mut patches: Vec<Patch> = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix("@@ -") {
                patches.push(parse_header(header).map_err(|r| PatchError::at(line_no, r))?);
                continue;
            }
            let current = patches
                .last_mut()
                .ok_or_else(|| PatchError::at(line_no, "body line before first hunk header"))?;
            let mut chars = line.chars();
            let op = match chars.next() {
                Some(' ') => Operation::Equal,
                Some('-') => Operation::Delete,
                Some('+') => Operation::Insert,
                Some(other) => return Err(PatchError::at(line_no, format!("unknown line marker {other:?}"))),
                None => continue,
            };
            let run = decode_run(chars.as_str()).map_err(|r| PatchError::at(line_no, r))?;
            current.diffs.push(Diff::new(op, run));
        }
        Ok(PatchSet::new(patches))
    }
}

fn format_range(start: usize, len: usize) -> String {
    match len {
        0 => format!("{start},0"),
        1 => format!("{}", start + 1),
        _ => format!("{},{len}", start + 1),
    }
}

fn parse_range(range: &str) -> Result<(usize, usize), String> {
    let parse = |s: &str| s.parse::<usize>().map_err(|e| format!("bad number {s:?}: {e}"));
    match range.split_once(',') {
        None => {
            let start = parse(range)?;
            let start = start.checked_sub(1).ok_or("start must be positive")?;
            Ok((start, 1))
        }
        Some((start, "0")) => Ok((parse(start)?, 0)),
        Some((start, len)) => {
            let start = parse(start)?.checked_sub(1).ok_or("start must be positive")?;
            Ok((start, parse(len)?))
        }
    }
}

fn parse_header(header: &str) -> Result<Patch, String> {
    // header is "<range1> +<range2> @@"
    let body = header.strip_suffix(" @@").ok_or("header must end with \" @@\"")?;
    let (range1, range2) = body.split_once(" +").ok_or("header is missing \" +\"")?;
    let (start1, length1) = parse_range(range1)?;
    let (start2, length2) = parse_range(range2)?;
    Ok(Patch { diffs: Vec::new(), start1, start2, length1, length2 })
}

fn encode_run(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for &byte in text.as_bytes() {
        if byte.is_ascii_alphanumeric() || LITERAL.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_run(encoded: &str) -> Result<String, String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded
                .get(i + 1..i + 3)
                .ok_or_else(|| format!("truncated escape at column {i}"))?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| format!("bad escape %{hex}"))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|e| format!("invalid utf-8: {e}"))
}
