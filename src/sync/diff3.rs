//! Three-way merging of token sequences, and the text merges built on it.

use std::hash::Hash;
use std::ops::Range;

use similar::{Algorithm, DiffTag, capture_diff_slices};

use crate::sync::merge::{MergeContext, MergeResult};

pub(crate) const MARKER_EXISTING: &str = "<<<<<<< existing";
pub(crate) const MARKER_SEPARATOR: &str = "=======";
pub(crate) const MARKER_GENERATED: &str = ">>>>>>> generated";

/// One region of a three-way merge.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Merged<'a, T> {
    /// Settled content.
    Clean(&'a [T]),
    /// Both sides changed the same base region differently.
    Conflict {
        base: &'a [T],
        ours: &'a [T],
        theirs: &'a [T],
    },
}

/// A changed base range and what one side replaced it with.
#[derive(Debug, Clone)]
struct Hunk {
    side: usize,
    base: Range<usize>,
    other: Range<usize>,
}

fn hunks<T: Eq + Hash + Ord>(side: usize, base: &[T], other: &[T]) -> Vec<Hunk> {
    capture_diff_slices(Algorithm::Myers, base, other)
        .into_iter()
        .filter_map(|op| {
            let (tag, base, other) = op.as_tag_tuple();
            (tag != DiffTag::Equal).then_some(Hunk { side, base, other })
        })
        .collect()
}

/// Merges the changes `base -> ours` and `base -> theirs`.
///
/// Changes to disjoint base regions are both applied. Changes to overlapping
/// or touching regions conflict, unless both sides made the same change.
pub(crate) fn merge3<'a, T: Eq + Hash + Ord>(
    base: &'a [T],
    ours: &'a [T],
    theirs: &'a [T],
) -> Vec<Merged<'a, T>> {
    let mut all = hunks(0, base, ours);
    all.extend(hunks(1, base, theirs));
    all.sort_by_key(|h| (h.base.start, h.base.end, h.side));

    let mut merged = Vec::new();
    // Offset of each side relative to base, before the current group.
    let mut delta = [0isize; 2];
    let mut cursor = 0;
    let mut i = 0;

    while i < all.len() {
        let lo = all[i].base.start;
        let mut hi = all[i].base.end;
        let mut j = i + 1;
        while j < all.len() && all[j].base.start <= hi {
            hi = hi.max(all[j].base.end);
            j += 1;
        }

        let group = &all[i..j];
        let mut changed = [false; 2];
        let mut growth = [0isize; 2];
        for hunk in group {
            changed[hunk.side] = true;
            growth[hunk.side] += hunk.other.len() as isize - hunk.base.len() as isize;
        }

        let range = |side: usize| {
            let start = (lo as isize + delta[side]) as usize;
            let end = (hi as isize + delta[side] + growth[side]) as usize;
            start..end
        };

        if cursor < lo {
            merged.push(Merged::Clean(&base[cursor..lo]));
        }

        let (mine, other) = (&ours[range(0)], &theirs[range(1)]);
        merged.push(match changed {
            [true, false] => Merged::Clean(mine),
            [false, true] => Merged::Clean(other),
            _ if mine == other => Merged::Clean(mine),
            _ => Merged::Conflict {
                base: &base[lo..hi],
                ours: mine,
                theirs: other,
            },
        });

        delta[0] += growth[0];
        delta[1] += growth[1];
        cursor = hi;
        i = j;
    }

    if cursor < base.len() {
        merged.push(Merged::Clean(&base[cursor..]));
    }

    merged
}

/// Splits text into lines, keeping line endings.
pub(crate) fn lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Splits text into words, runs of blanks, newlines and single symbols.
pub(crate) fn words(text: &str) -> Vec<&str> {
    #[derive(PartialEq, Clone, Copy)]
    enum Class {
        Word,
        Blank,
        Other,
    }

    fn class(c: char) -> Class {
        if c.is_alphanumeric() || c == '_' {
            Class::Word
        } else if c.is_whitespace() && c != '\n' {
            Class::Blank
        } else {
            Class::Other
        }
    }

    let mut tokens = Vec::new();
    let mut start = 0;
    let mut last: Option<Class> = None;

    for (i, c) in text.char_indices() {
        let current = class(c);
        let split = match last {
            None => false,
            Some(Class::Other) => true,
            Some(previous) => previous != current,
        };
        if split {
            tokens.push(&text[start..i]);
            start = i;
        }
        last = Some(current);
    }

    if start < text.len() {
        tokens.push(&text[start..]);
    }

    tokens
}

fn push_side(out: &mut String, text: &str) {
    out.push_str(text);
    if !text.is_empty() && !text.ends_with('\n') {
        out.push('\n');
    }
}

/// Wraps both versions of a region in conflict markers.
pub(crate) fn push_conflict(out: &mut String, existing: &str, generated: &str) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(MARKER_EXISTING);
    out.push('\n');
    push_side(out, existing);
    out.push_str(MARKER_SEPARATOR);
    out.push('\n');
    push_side(out, generated);
    out.push_str(MARKER_GENERATED);
    out.push('\n');
}

/// Heuristic for content that must not be merged as text.
pub(crate) fn looks_binary(text: &str) -> bool {
    text.contains('\0')
}

/// Merges a conflicting line region token by token.
///
/// Returns the merged text only if no token-level conflict remains.
fn merge_words(base: &str, ours: &str, theirs: &str) -> Option<String> {
    let (base, ours, theirs) = (words(base), words(ours), words(theirs));
    let mut out = String::new();

    for region in merge3(&base, &ours, &theirs) {
        match region {
            Merged::Clean(tokens) => out.extend(tokens.iter().copied()),
            Merged::Conflict { .. } => return None,
        }
    }

    Some(out)
}

/// Line-based three-way merge of working (ours) and generated (theirs)
/// text against the baseline, refining line conflicts at word level.
pub fn diff3_merge(ctx: &MergeContext<'_>) -> Option<MergeResult> {
    if looks_binary(ctx.base) || looks_binary(ctx.working) || looks_binary(ctx.generated) {
        return None;
    }

    let base = lines(ctx.base);
    let ours = lines(ctx.working);
    let theirs = lines(ctx.generated);

    let mut text = String::with_capacity(ctx.generated.len());
    let mut has_conflict = false;

    for region in merge3(&base, &ours, &theirs) {
        match region {
            Merged::Clean(lines) => text.extend(lines.iter().copied()),
            Merged::Conflict { base, ours, theirs } => {
                let (base, ours, theirs) = (base.concat(), ours.concat(), theirs.concat());
                match merge_words(&base, &ours, &theirs) {
                    Some(merged) => text.push_str(&merged),
                    None => {
                        has_conflict = true;
                        push_conflict(&mut text, &ours, &theirs);
                    }
                }
            }
        }
    }

    Some(MergeResult { text, has_conflict })
}

/// Two-way comparison without a common ancestor: runs where the files
/// differ are wrapped in conflict markers.
pub fn two_way_merge(working: &str, generated: &str) -> MergeResult {
    let ours = lines(working);
    let theirs = lines(generated);

    let mut text = String::with_capacity(working.len() + generated.len());
    let mut has_conflict = false;
    let mut existing = String::new();
    let mut incoming = String::new();

    let flush = |text: &mut String, existing: &mut String, incoming: &mut String| {
        if !existing.is_empty() || !incoming.is_empty() {
            push_conflict(text, existing, incoming);
            existing.clear();
            incoming.clear();
            true
        } else {
            false
        }
    };

    for op in capture_diff_slices(Algorithm::Myers, &ours, &theirs) {
        let (tag, old, new) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            has_conflict |= flush(&mut text, &mut existing, &mut incoming);
            text.extend(ours[old].iter().copied());
        } else {
            existing.extend(ours[old].iter().copied());
            incoming.extend(theirs[new].iter().copied());
        }
    }
    has_conflict |= flush(&mut text, &mut existing, &mut incoming);

    MergeResult { text, has_conflict }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::*;

    fn ctx<'a>(base: &'a str, working: &'a str, generated: &'a str) -> MergeContext<'a> {
        MergeContext {
            path: Utf8Path::new("file.ts"),
            base,
            working,
            generated,
        }
    }

    #[test]
    fn test_merge3_disjoint_changes() {
        let base = ["a", "b", "c", "d", "e"];
        let ours = ["a", "B", "c", "d", "e"];
        let theirs = ["a", "b", "c", "d", "E", "f"];

        let merged: Vec<&str> = merge3(&base, &ours, &theirs)
            .into_iter()
            .flat_map(|region| match region {
                Merged::Clean(tokens) => tokens.to_vec(),
                Merged::Conflict { .. } => panic!("unexpected conflict"),
            })
            .collect();

        assert_eq!(merged, vec!["a", "B", "c", "d", "E", "f"]);
    }

    #[test]
    fn test_merge3_same_change_is_clean() {
        let base = ["a", "b"];
        let ours = ["a", "x"];
        let merged = merge3(&base, &ours, &ours);
        assert!(merged.iter().all(|r| matches!(r, Merged::Clean(_))));
    }

    #[test]
    fn test_merge3_overlap_conflicts() {
        let base = ["a", "b", "c"];
        let ours = ["a", "x", "c"];
        let theirs = ["a", "y", "c"];

        let merged = merge3(&base, &ours, &theirs);
        assert_eq!(
            merged,
            vec![
                Merged::Clean(&base[0..1]),
                Merged::Conflict {
                    base: &base[1..2],
                    ours: &ours[1..2],
                    theirs: &theirs[1..2],
                },
                Merged::Clean(&base[2..3]),
            ]
        );
    }

    #[test]
    fn test_words() {
        assert_eq!(
            words("export const A = 1; // keep\n"),
            vec!["export", " ", "const", " ", "A", " ", "=", " ", "1", ";", " ", "/", "/", " ", "keep", "\n"]
        );
    }

    #[test]
    fn test_keeps_trailing_comment_and_new_value() {
        let result = diff3_merge(&ctx(
            "export const A = 1;",
            "export const A = 1; // keep me",
            "export const A = 2;",
        ))
        .unwrap();

        assert_eq!(result.text, "export const A = 2; // keep me");
        assert!(!result.has_conflict);
    }

    #[test]
    fn test_non_overlapping_line_changes() {
        let base = "one\ntwo\nthree\nfour\nfive\n";
        let working = "one\ntwo (edited)\nthree\nfour\nfive\n";
        let generated = "one\ntwo\nthree\nfour\nfive\nsix\n";

        let result = diff3_merge(&ctx(base, working, generated)).unwrap();
        assert_eq!(result.text, "one\ntwo (edited)\nthree\nfour\nfive\nsix\n");
        assert!(!result.has_conflict);
    }

    #[test]
    fn test_overlapping_changes_get_markers() {
        let base = "a\nvalue = 1\nz\n";
        let working = "a\nvalue = 10\nz\n";
        let generated = "a\nvalue = 2\nz\n";

        let result = diff3_merge(&ctx(base, working, generated)).unwrap();
        assert!(result.has_conflict);
        assert_eq!(
            result.text,
            "a\n<<<<<<< existing\nvalue = 10\n=======\nvalue = 2\n>>>>>>> generated\nz\n"
        );
    }

    #[test]
    fn test_binary_is_declined() {
        assert!(diff3_merge(&ctx("a\0", "b\0", "c\0")).is_none());
    }

    #[test]
    fn test_two_way_wraps_divergent_runs() {
        let result = two_way_merge("a\nmine\nz\n", "a\ntheirs\nz\n");
        assert!(result.has_conflict);
        assert_eq!(
            result.text,
            "a\n<<<<<<< existing\nmine\n=======\ntheirs\n>>>>>>> generated\nz\n"
        );

        let same = two_way_merge("a\n", "a\n");
        assert!(!same.has_conflict);
        assert_eq!(same.text, "a\n");
    }
}
