// Copyright 2024 The Zeta Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Line-level three-way file merging.
//!
//! The built-in driver aligns both sides against the base with a line LCS,
//! clusters overlapping change hunks, and resolves each cluster: one-sided
//! changes apply, identical changes collapse, and the rest become conflict
//! hunks rendered with `<<<<<<<`/`=======`/`>>>>>>>` markers. Callers may
//! plug in an external driver through [`MergeDriver`].

use bstr::ByteSlice as _;
use thiserror::Error;

pub const CONFLICT_MARKER_LEN: usize = 7;

// DP cell budget for the line LCS. Inputs whose trimmed middles exceed this
// are merged coarsely (whole middle as one hunk).
const MAX_LCS_CELLS: usize = 1 << 22;

#[derive(Debug, Error)]
pub enum MergeDriverError {
    #[error("Merge driver failed: {0}")]
    Driver(String),
}

/// Labels shown on conflict markers, in base/ours/theirs order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeLabels {
    pub base: String,
    pub ours: String,
    pub theirs: String,
}

impl Default for MergeLabels {
    fn default() -> Self {
        Self {
            base: "base".to_owned(),
            ours: "ours".to_owned(),
            theirs: "theirs".to_owned(),
        }
    }
}

/// The outcome of a file-level merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedText {
    pub content: Vec<u8>,
    pub had_conflict: bool,
}

/// A pluggable three-way text merger.
pub trait MergeDriver: Send + Sync {
    fn merge(
        &self,
        base: &[u8],
        ours: &[u8],
        theirs: &[u8],
        labels: &MergeLabels,
    ) -> Result<MergedText, MergeDriverError>;
}

/// The built-in line-level merger.
#[derive(Debug, Default)]
pub struct BuiltinMergeDriver;

impl MergeDriver for BuiltinMergeDriver {
    fn merge(
        &self,
        base: &[u8],
        ours: &[u8],
        theirs: &[u8],
        labels: &MergeLabels,
    ) -> Result<MergedText, MergeDriverError> {
        Ok(merge_text(base, ours, theirs, labels))
    }
}

/// Quick binary sniff: a NUL byte in the head marks content that line
/// merging must not touch.
pub fn looks_binary(content: &[u8]) -> bool {
    content[..content.len().min(8000)].contains(&0)
}

fn lines(content: &[u8]) -> Vec<&[u8]> {
    content.lines_with_terminator().collect()
}

/// A change hunk: base lines `base.0..base.1` were replaced by side lines
/// `side.0..side.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hunk {
    base: (usize, usize),
    side: (usize, usize),
}

/// Computes change hunks of `side` relative to `base` from a line LCS.
fn diff_hunks(base: &[&[u8]], side: &[&[u8]]) -> Vec<Hunk> {
    // Trim the common prefix and suffix; the DP only sees the middle.
    let mut start = 0;
    while start < base.len() && start < side.len() && base[start] == side[start] {
        start += 1;
    }
    let mut base_end = base.len();
    let mut side_end = side.len();
    while base_end > start && side_end > start && base[base_end - 1] == side[side_end - 1] {
        base_end -= 1;
        side_end -= 1;
    }
    let b = &base[start..base_end];
    let s = &side[start..side_end];
    if b.is_empty() && s.is_empty() {
        return vec![];
    }
    if b.len().saturating_mul(s.len()) > MAX_LCS_CELLS {
        return vec![Hunk {
            base: (start, base_end),
            side: (start, side_end),
        }];
    }

    // Longest common subsequence over the middle lines.
    let rows = b.len() + 1;
    let cols = s.len() + 1;
    let mut table = vec![0u32; rows * cols];
    for i in (0..b.len()).rev() {
        for j in (0..s.len()).rev() {
            table[i * cols + j] = if b[i] == s[j] {
                table[(i + 1) * cols + j + 1] + 1
            } else {
                table[(i + 1) * cols + j].max(table[i * cols + j + 1])
            };
        }
    }

    let mut hunks = Vec::new();
    let (mut i, mut j) = (0, 0);
    let (mut hunk_i, mut hunk_j) = (0, 0);
    let mut in_hunk = false;
    loop {
        let matched =
            i < b.len() && j < s.len() && b[i] == s[j] && table[i * cols + j] == table[(i + 1) * cols + j + 1] + 1;
        if matched {
            if in_hunk {
                hunks.push(Hunk {
                    base: (start + hunk_i, start + i),
                    side: (start + hunk_j, start + j),
                });
                in_hunk = false;
            }
            i += 1;
            j += 1;
            continue;
        }
        if i == b.len() && j == s.len() {
            break;
        }
        if !in_hunk {
            hunk_i = i;
            hunk_j = j;
            in_hunk = true;
        }
        if i < b.len() && (j == s.len() || table[(i + 1) * cols + j] >= table[i * cols + j + 1]) {
            i += 1;
        } else {
            j += 1;
        }
    }
    if in_hunk {
        hunks.push(Hunk {
            base: (start + hunk_i, start + i),
            side: (start + hunk_j, start + j),
        });
    }
    hunks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Ours,
    Theirs,
}

/// Merges `ours` and `theirs` against `base` line by line.
pub fn merge_text(base: &[u8], ours: &[u8], theirs: &[u8], labels: &MergeLabels) -> MergedText {
    let base_lines = lines(base);
    let our_lines = lines(ours);
    let their_lines = lines(theirs);

    let mut events: Vec<(Side, Hunk)> = diff_hunks(&base_lines, &our_lines)
        .into_iter()
        .map(|hunk| (Side::Ours, hunk))
        .chain(
            diff_hunks(&base_lines, &their_lines)
                .into_iter()
                .map(|hunk| (Side::Theirs, hunk)),
        )
        .collect();
    events.sort_by_key(|(side, hunk)| (hunk.base.0, hunk.base.1, *side == Side::Theirs));

    let mut out = Vec::new();
    let mut had_conflict = false;
    let mut base_pos = 0;
    let mut idx = 0;
    while idx < events.len() {
        // Grow a cluster of hunks whose base ranges collide. Two empty
        // ranges at the same point collide (both sides inserted there); an
        // insertion adjacent to a modification does not.
        let (_, first) = events[idx];
        let mut cluster_end = first.base.1;
        let mut cluster_until = idx + 1;
        while cluster_until < events.len() {
            let (_, next) = events[cluster_until];
            let collides = next.base.0 < cluster_end
                || (next.base.0 == cluster_end && next.base.0 == next.base.1 && first.base.0 == cluster_end);
            if !collides {
                break;
            }
            cluster_end = cluster_end.max(next.base.1);
            cluster_until += 1;
        }
        let cluster_start = first.base.0;

        // Unchanged base lines before the cluster.
        for line in &base_lines[base_pos..cluster_start] {
            out.extend_from_slice(line);
        }

        let ours_in: Vec<&(Side, Hunk)> = events[idx..cluster_until]
            .iter()
            .filter(|(side, _)| *side == Side::Ours)
            .collect();
        let theirs_in: Vec<&(Side, Hunk)> = events[idx..cluster_until]
            .iter()
            .filter(|(side, _)| *side == Side::Theirs)
            .collect();

        let our_region = side_region(&ours_in, cluster_start, cluster_end, &base_lines, &our_lines);
        let their_region =
            side_region(&theirs_in, cluster_start, cluster_end, &base_lines, &their_lines);

        if theirs_in.is_empty() || (!ours_in.is_empty() && our_region == their_region) {
            out.extend(our_region.iter().copied().flatten());
        } else if ours_in.is_empty() {
            out.extend(their_region.iter().copied().flatten());
        } else {
            had_conflict = true;
            write_conflict(&mut out, &our_region, &their_region, labels);
        }

        base_pos = cluster_end;
        idx = cluster_until;
    }
    for line in &base_lines[base_pos..] {
        out.extend_from_slice(line);
    }

    MergedText {
        content: out,
        had_conflict,
    }
}

/// The side's lines covering the cluster `[cluster_start, cluster_end)` of
/// base lines: hunk replacements plus unchanged base lines between them.
fn side_region<'a>(
    hunks: &[&(Side, Hunk)],
    cluster_start: usize,
    cluster_end: usize,
    base_lines: &[&'a [u8]],
    side_lines: &[&'a [u8]],
) -> Vec<&'a [u8]> {
    let mut region = Vec::new();
    let mut pos = cluster_start;
    for (_, hunk) in hunks {
        region.extend_from_slice(&base_lines[pos..hunk.base.0]);
        region.extend_from_slice(&side_lines[hunk.side.0..hunk.side.1]);
        pos = hunk.base.1;
    }
    region.extend_from_slice(&base_lines[pos..cluster_end]);
    region
}

fn write_conflict(
    out: &mut Vec<u8>,
    our_region: &[&[u8]],
    their_region: &[&[u8]],
    labels: &MergeLabels,
) {
    out.extend_from_slice(b"<".repeat(CONFLICT_MARKER_LEN).as_slice());
    out.push(b' ');
    out.extend_from_slice(labels.ours.as_bytes());
    out.push(b'\n');
    for line in our_region {
        out.extend_from_slice(line);
        if !line.ends_with(b"\n") {
            out.push(b'\n');
        }
    }
    out.extend_from_slice(b"=".repeat(CONFLICT_MARKER_LEN).as_slice());
    out.push(b'\n');
    for line in their_region {
        out.extend_from_slice(line);
        if !line.ends_with(b"\n") {
            out.push(b'\n');
        }
    }
    out.extend_from_slice(b">".repeat(CONFLICT_MARKER_LEN).as_slice());
    out.push(b' ');
    out.extend_from_slice(labels.theirs.as_bytes());
    out.push(b'\n');
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;

    fn merge(base: &[u8], ours: &[u8], theirs: &[u8]) -> MergedText {
        let labels = MergeLabels {
            base: "base".to_owned(),
            ours: "HEAD".to_owned(),
            theirs: "b".to_owned(),
        };
        merge_text(base, ours, theirs, &labels)
    }

    fn clean(result: &MergedText) -> &[u8] {
        assert!(!result.had_conflict);
        &result.content
    }

    #[test]
    fn test_merge_identity() {
        let result = merge(b"a\nb\n", b"a\nb\n", b"a\nb\n");
        assert_eq!(clean(&result), b"a\nb\n");
    }

    #[test]
    fn test_one_sided_change() {
        assert_eq!(clean(&merge(b"a\nb\n", b"a2\nb\n", b"a\nb\n")), b"a2\nb\n");
        assert_eq!(clean(&merge(b"a\nb\n", b"a\nb\n", b"a\nb2\n")), b"a\nb2\n");
    }

    #[test]
    fn test_both_sides_changed_different_lines() {
        let result = merge(b"a\nb\nc\n", b"a2\nb\nc\n", b"a\nb\nc2\n");
        assert_eq!(clean(&result), b"a2\nb\nc2\n");
    }

    #[test]
    fn test_same_change_both_sides() {
        let result = merge(b"a\n", b"b\n", b"b\n");
        assert_eq!(clean(&result), b"b\n");
    }

    #[test]
    fn test_conflicting_change_produces_markers() {
        let result = merge(b"A\n", b"C\n", b"B\n");
        assert!(result.had_conflict);
        assert_eq!(
            result.content,
            indoc! {b"
                <<<<<<< HEAD
                C
                =======
                B
                >>>>>>> b
            "}
        );
    }

    #[test]
    fn test_conflict_with_context_around() {
        let result = merge(b"a\nb\nc\n", b"a\nb1\nc\n", b"a\nb2\nc\n");
        assert!(result.had_conflict);
        assert_eq!(
            result.content,
            indoc! {b"
                a
                <<<<<<< HEAD
                b1
                =======
                b2
                >>>>>>> b
            "}
        );
    }

    #[test]
    fn test_both_insert_at_different_positions() {
        let result = merge(b"a\nb\n", b"x\na\nb\n", b"a\nb\ny\n");
        assert_eq!(clean(&result), b"x\na\nb\ny\n");
    }

    #[test]
    fn test_both_insert_at_same_position_conflicts() {
        let result = merge(b"a\n", b"a\nx\n", b"a\ny\n");
        assert!(result.had_conflict);
        assert_eq!(
            result.content,
            indoc! {b"
                a
                <<<<<<< HEAD
                x
                =======
                y
                >>>>>>> b
            "}
        );
    }

    #[test]
    fn test_delete_vs_keep() {
        let result = merge(b"a\nb\nc\n", b"a\nc\n", b"a\nb\nc\n");
        assert_eq!(clean(&result), b"a\nc\n");
    }

    #[test]
    fn test_delete_vs_modify_conflicts() {
        let result = merge(b"a\nb\nc\n", b"a\nc\n", b"a\nB\nc\n");
        assert!(result.had_conflict);
        assert_eq!(
            result.content,
            indoc! {b"
                a
                <<<<<<< HEAD
                =======
                B
                >>>>>>> b
            "}
        );
    }

    #[test]
    fn test_missing_trailing_newline_in_conflict() {
        let result = merge(b"A\n", b"C", b"B\n");
        assert!(result.had_conflict);
        // The markers stay line-framed even when a side has no final
        // newline.
        assert_eq!(
            result.content,
            indoc! {b"
                <<<<<<< HEAD
                C
                =======
                B
                >>>>>>> b
            "}
        );
    }

    #[test]
    fn test_determinism() {
        let base = b"one\ntwo\nthree\nfour\n";
        let ours = b"one\n2\nthree\nfour\nfive\n";
        let theirs = b"zero\none\ntwo\nthree\n4\n";
        let first = merge(base, ours, theirs);
        let second = merge(base, ours, theirs);
        assert_eq!(first, second);
    }

    #[test]
    fn test_looks_binary() {
        assert!(looks_binary(b"PK\x03\x04\0\0"));
        assert!(!looks_binary(b"plain text\n"));
    }
}
