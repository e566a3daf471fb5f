//! Patch engine: turns a search/replace proposal into new file content.
//!
//! Strategy: try an exact unique substring match first, then fall back to
//! line-oriented fuzzy matching that tolerates incidental whitespace drift.
//! Zero matches and multiple matches are both failures; applying a patch to
//! an arbitrary one of several candidates risks silently editing the wrong
//! location, so ambiguity is always rejected.
//!
//! The engine never touches disk. It returns the new content; the caller
//! owns checkpointing and persisting.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("search block not found in target file")]
    NotFound,
    #[error("ambiguous match: search block matches {0} locations; provide a larger, more specific search block")]
    Ambiguous(usize),
    #[error("search block is empty")]
    EmptySearch,
}

/// A line of the target file with its byte span, terminator included.
struct Line<'a> {
    start: usize,
    end: usize,
    text: &'a str,
}

fn index_lines(content: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut start = 0;
    let bytes = content.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'\n' {
            lines.push(Line {
                start,
                end: i + 1,
                text: &content[start..i],
            });
            start = i + 1;
        }
    }
    if start < content.len() {
        lines.push(Line {
            start,
            end: content.len(),
            text: &content[start..],
        });
    }
    lines
}

/// Apply a search/replace patch to `current`, returning the new content.
///
/// Exact single occurrences are replaced verbatim. Otherwise the search
/// block is matched line-by-line with surrounding whitespace stripped;
/// blank lines in the target may be skipped without consuming a search
/// line, and blank lines in the search block are ignored.
pub fn apply_patch(current: &str, search: &str, replace: &str) -> Result<String, PatchError> {
    if search.trim().is_empty() {
        return Err(PatchError::EmptySearch);
    }

    // Fast path: exact substring, unique.
    let exact_count = current.matches(search).count();
    if exact_count == 1 {
        return Ok(current.replacen(search, replace, 1));
    }

    let target = index_lines(current);
    let needle: Vec<&str> = search
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if needle.is_empty() {
        return Err(PatchError::EmptySearch);
    }

    let matches = fuzzy_matches(&target, &needle);
    match matches.len() {
        0 => Err(PatchError::NotFound),
        1 => {
            let (first, last) = matches[0];
            Ok(splice(current, &target, first, last, replace))
        }
        n => Err(PatchError::Ambiguous(n)),
    }
}

/// Find every contiguous run of target lines whose trimmed text equals the
/// needle, allowing blank target lines to be skipped mid-run. Returns
/// (first, last) line indices, inclusive.
fn fuzzy_matches(target: &[Line<'_>], needle: &[&str]) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    for start in 0..target.len() {
        // The run must open on a real match, not a skipped blank, so each
        // region is counted exactly once.
        if target[start].text.trim() != needle[0] {
            continue;
        }
        let mut ti = start + 1;
        let mut ni = 1;
        while ni < needle.len() && ti < target.len() {
            let line = target[ti].text.trim();
            if line == needle[ni] {
                ni += 1;
                ti += 1;
            } else if line.is_empty() {
                ti += 1;
            } else {
                break;
            }
        }
        if ni == needle.len() {
            found.push((start, ti - 1));
        }
    }
    found
}

/// Splice `replace` over the matched line region, preserving everything
/// before and after verbatim.
fn splice(
    current: &str,
    target: &[Line<'_>],
    first: usize,
    last: usize,
    replace: &str,
) -> String {
    let region_start = target[first].start;
    let region_end = target[last].end;
    let removed_had_newline = current[region_start..region_end].ends_with('\n');

    let mut out = String::with_capacity(current.len() + replace.len());
    out.push_str(&current[..region_start]);
    out.push_str(replace);
    if removed_had_newline && !replace.is_empty() && !replace.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&current[region_end..]);
    out
}
