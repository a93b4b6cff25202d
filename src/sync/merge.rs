//! Per-file reconciliation of generated output with the working tree.

use camino::Utf8Path;

use crate::output::FileContents;
use crate::sync::diff3::{diff3_merge, two_way_merge};
use crate::sync::format::Formatter;
use crate::sync::json::json_merge;

/// The three versions of a text file being merged.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    pub path: &'a Utf8Path,
    /// What the generator produced last time.
    pub base: &'a str,
    /// What is on disk now.
    pub working: &'a str,
    /// What the generator produced this time.
    pub generated: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub text: String,
    pub has_conflict: bool,
}

/// A merge strategy. Returns `None` when it cannot handle the input, letting
/// the next strategy try.
pub type MergeAlgorithm = fn(&MergeContext<'_>) -> Option<MergeResult>;

/// Strategies tried by default, in order.
pub const DEFAULT_ALGORITHMS: &[MergeAlgorithm] = &[json_merge, diff3_merge];

/// Tries each algorithm in turn; the first answer wins. When none can
/// handle the input, both versions are kept side by side in markers.
pub fn composite_merge(ctx: &MergeContext<'_>, algorithms: &[MergeAlgorithm]) -> MergeResult {
    algorithms
        .iter()
        .find_map(|algorithm| algorithm(ctx))
        .unwrap_or_else(|| {
            let mut result = two_way_merge(ctx.working, ctx.generated);
            result.has_conflict = true;
            result
        })
}

/// What should happen to a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The working file stays exactly as it is.
    Keep,
    /// The file gets these contents.
    Write {
        contents: FileContents,
        has_conflict: bool,
    },
    /// A binary file changed on both sides: the working file stays, and the
    /// generated bytes are put next to it for manual resolution.
    Sidecar { contents: Vec<u8> },
}

/// Settings for [`merge_file`].
pub struct MergeSettings<'a> {
    pub algorithms: &'a [MergeAlgorithm],
    pub formatter: &'a dyn Formatter,
    pub skip_formatting: bool,
}

impl MergeSettings<'_> {
    fn format(&self, path: &Utf8Path, text: String) -> anyhow::Result<String> {
        if self.skip_formatting || !self.formatter.supports(path) {
            return Ok(text);
        }
        self.formatter.format(&text, path)
    }
}

/// Decides the new contents of `path`.
///
/// `generated` is expected to be formatted already; merged text is formatted
/// again before it is returned, unless it contains conflict markers.
pub fn merge_file(
    path: &Utf8Path,
    generated: &FileContents,
    baseline: Option<&FileContents>,
    working: Option<&FileContents>,
    settings: &MergeSettings<'_>,
) -> anyhow::Result<Resolution> {
    let write = |contents: FileContents, has_conflict| Resolution::Write {
        contents,
        has_conflict,
    };

    let Some(working) = working else {
        return Ok(write(generated.clone(), false));
    };

    if working.as_ref() == generated.as_ref() {
        return Ok(Resolution::Keep);
    }

    let binary = |contents: &FileContents| contents.as_text().is_none();

    let Some(baseline) = baseline else {
        return Ok(match (working.as_text(), generated.as_text()) {
            (Some(working), Some(generated)) => {
                let result = two_way_merge(working, generated);
                write(FileContents::Text(result.text), true)
            }
            _ => Resolution::Sidecar {
                contents: generated.as_ref().to_vec(),
            },
        });
    };

    if baseline.as_ref() == generated.as_ref() {
        return Ok(Resolution::Keep);
    }

    if baseline.as_ref() == working.as_ref() {
        return Ok(write(generated.clone(), false));
    }

    if binary(generated) || binary(working) || binary(baseline) {
        return Ok(Resolution::Sidecar {
            contents: generated.as_ref().to_vec(),
        });
    }

    let ctx = MergeContext {
        path,
        base: baseline.as_text().unwrap_or_default(),
        working: working.as_text().unwrap_or_default(),
        generated: generated.as_text().unwrap_or_default(),
    };

    let MergeResult { text, has_conflict } = composite_merge(&ctx, settings.algorithms);
    let text = match has_conflict {
        true => text,
        false => settings.format(path, text)?,
    };

    Ok(write(FileContents::Text(text), has_conflict))
}
