//! Reading and applying unified diffs.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hunk {
    old_start: usize,
    old_len: usize,
    lines: Vec<Line>,
}

impl Hunk {
    /// The lines this hunk expects to find.
    fn before(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                Line::Context(text) | Line::Remove(text) => Some(text.as_str()),
                Line::Add(_) => None,
            })
            .collect()
    }

    /// The lines this hunk leaves behind.
    fn after(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            Line::Context(text) | Line::Add(text) => Some(text.as_str()),
            Line::Remove(_) => None,
        })
    }

    /// Zero-based index of the first line the hunk touches.
    fn index(&self) -> usize {
        match self.old_len {
            // An empty range names the line after which to insert.
            0 => self.old_start,
            _ => self.old_start.saturating_sub(1),
        }
    }
}

/// Parses `start[,len]`.
fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

/// Parses `@@ -a,b +c,d @@`.
fn parse_header(line: &str) -> Option<(usize, usize, usize)> {
    let rest = line.strip_prefix("@@ -")?;
    let (ranges, _) = rest.split_once(" @@")?;
    let (old, new) = ranges.split_once(" +")?;
    let (old_start, old_len) = parse_range(old)?;
    let (_, new_len) = parse_range(new)?;
    Some((old_start, old_len, new_len))
}

/// Parses every hunk of a unified diff. File headers are ignored.
pub(crate) fn parse(diff: &str) -> Result<Vec<Hunk>, String> {
    let mut hunks = Vec::new();
    let mut lines = diff.split_inclusive('\n').peekable();

    while let Some(line) = lines.next() {
        if !line.starts_with("@@") {
            continue;
        }

        let (old_start, old_len, new_len) = parse_header(line.trim_end())
            .ok_or_else(|| format!("invalid hunk header `{}`", line.trim_end()))?;

        let mut hunk = Hunk {
            old_start,
            old_len,
            lines: Vec::new(),
        };
        let (mut old_seen, mut new_seen) = (0, 0);

        while old_seen < old_len || new_seen < new_len {
            let Some(line) = lines.next() else {
                return Err(format!("hunk at line {old_start} ends early"));
            };

            let mut chars = line.chars();
            let tag = chars.next();
            let mut text = chars.as_str().to_string();

            if lines.peek().is_some_and(|next| next.starts_with('\\')) {
                lines.next();
                if text.ends_with('\n') {
                    text.pop();
                }
            }

            let line = match tag {
                Some(' ') => {
                    old_seen += 1;
                    new_seen += 1;
                    Line::Context(text)
                }
                Some('-') => {
                    old_seen += 1;
                    Line::Remove(text)
                }
                Some('+') => {
                    new_seen += 1;
                    Line::Add(text)
                }
                _ => return Err(format!("unexpected line `{}` in hunk", line.trim_end())),
            };
            hunk.lines.push(line);
        }

        if old_seen != old_len || new_seen != new_len {
            return Err(format!("hunk at line {old_start} has the wrong number of lines"));
        }

        hunks.push(hunk);
    }

    Ok(hunks)
}

/// Applies `hunks` to `text`.
///
/// Each hunk must match the text exactly. A hunk that does not sit where
/// its header says is looked for at the nearest position after the previous
/// hunk.
pub(crate) fn apply(text: &str, hunks: &[Hunk]) -> Result<String, String> {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    for hunk in hunks {
        let before = hunk.before();

        let fits = |at: usize| {
            at >= cursor && at + before.len() <= lines.len() && lines[at..at + before.len()] == before[..]
        };

        let wanted = hunk.index();
        let found = (0..=lines.len())
            .flat_map(|delta| [wanted.checked_add(delta), wanted.checked_sub(delta)])
            .flatten()
            .find(|&at| fits(at))
            .ok_or_else(|| format!("hunk at line {} does not match", hunk.old_start))?;

        if found != wanted {
            tracing::debug!(wanted, found, "Hunk applied at an offset");
        }

        for line in &lines[cursor..found] {
            out.push_str(line);
        }
        for line in hunk.after() {
            out.push_str(line);
        }
        cursor = found + before.len();
    }

    for line in &lines[cursor..] {
        out.push_str(line);
    }

    Ok(out)
}
