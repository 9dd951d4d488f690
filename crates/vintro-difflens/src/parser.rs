use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};
use vintro_core::VintroError;

/// Classification of one line inside a hunk body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    /// Prefixed with a single `+`.
    Added,
    /// Prefixed with a single `-`.
    Removed,
    /// Unchanged by the hunk.
    Context,
}

/// One hunk body line, stored without its prefix character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HunkLine {
    /// What the prefix said about this line.
    pub kind: LineKind,
    /// Line text minus exactly one leading prefix character.
    pub text: String,
}

/// A single `@@` hunk with its body in document order.
#[derive(Debug, Clone, Serialize)]
pub struct Hunk {
    /// Starting line in the old version.
    pub old_start: u32,
    /// Number of lines in the old version.
    pub old_lines: u32,
    /// Starting line in the new version.
    pub new_start: u32,
    /// Number of lines in the new version.
    pub new_lines: u32,
    /// Body lines in document order.
    pub lines: Vec<HunkLine>,
}

/// All changes one patch makes to one file.
///
/// Multiple hunks accumulate into the same line lists in document order.
///
/// # Examples
///
/// ```
/// use vintro_difflens::parser::parse_patch;
///
/// let diff = "diff --git a/foo.c b/foo.c\n\
///             --- a/foo.c\n\
///             +++ b/foo.c\n\
///             @@ -1 +1 @@\n\
///             -int x = 1;\n\
///             +int x = 2;\n";
/// let parsed = parse_patch(diff);
/// let change = &parsed.files[0];
/// assert_eq!(change.path, "foo.c");
/// assert_eq!(change.removed_lines, vec!["int x = 1;"]);
/// assert_eq!(change.added_lines, vec!["int x = 2;"]);
/// ```
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileChange {
    /// Path after the change (the old path for deleted files).
    pub path: String,
    /// Path before the change; differs from `path` for renames.
    pub old_path: String,
    /// Added lines without the `+` prefix.
    pub added_lines: Vec<String>,
    /// Removed lines without the `-` prefix.
    pub removed_lines: Vec<String>,
    /// Context lines without the leading space.
    pub context_lines: Vec<String>,
    /// Raw hunks, kept for position-aware selection.
    pub hunks: Vec<Hunk>,
    /// Whether this file was created by the patch.
    pub is_new_file: bool,
    /// Whether this file was deleted by the patch.
    pub is_deleted_file: bool,
    /// Whether this file was renamed.
    pub is_rename: bool,
}

impl FileChange {
    /// Path of the file as it existed before the patch, for lookups
    /// against the parent revision.
    pub fn pre_change_path(&self) -> &str {
        if self.old_path.is_empty() {
            &self.path
        } else {
            &self.old_path
        }
    }

    fn absorb(&mut self, other: FileChange) {
        self.added_lines.extend(other.added_lines);
        self.removed_lines.extend(other.removed_lines);
        self.context_lines.extend(other.context_lines);
        self.hunks.extend(other.hunks);
        self.is_new_file |= other.is_new_file;
        self.is_deleted_file |= other.is_deleted_file;
        self.is_rename |= other.is_rename;
    }
}

impl fmt::Display for FileChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (+{} -{} ~{})",
            self.path,
            self.added_lines.len(),
            self.removed_lines.len(),
            self.context_lines.len()
        )
    }
}

/// Why a file section produced no [`FileChange`].
#[derive(Debug, Clone, Serialize)]
pub struct ParseDiagnostic {
    /// 1-based line number where the section starts.
    pub line: usize,
    /// Path, when one could be extracted.
    pub path: Option<String>,
    /// Human-readable reason.
    pub reason: String,
}

/// Result of parsing a patch: the usable file changes plus a diagnostic for
/// every section that was dropped.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedPatch {
    /// One entry per distinct file path, in order of first appearance.
    pub files: Vec<FileChange>,
    /// Sections skipped because they were binary or malformed.
    pub diagnostics: Vec<ParseDiagnostic>,
}

impl ParsedPatch {
    /// Look up a file change by its post-change path.
    pub fn get(&self, path: &str) -> Option<&FileChange> {
        self.files.iter().find(|f| f.path == path)
    }
}

struct Section {
    start_line: usize,
    change: FileChange,
    header_old: Option<String>,
    header_new: Option<String>,
    minus_path: Option<String>,
    plus_path: Option<String>,
    saw_minus_header: bool,
    is_binary: bool,
    malformed: Option<String>,
}

impl Section {
    fn new(start_line: usize) -> Self {
        Self {
            start_line,
            change: FileChange::default(),
            header_old: None,
            header_new: None,
            minus_path: None,
            plus_path: None,
            saw_minus_header: false,
            is_binary: false,
            malformed: None,
        }
    }
}

struct OpenHunk {
    hunk: Hunk,
    old_left: u32,
    new_left: u32,
}

impl OpenHunk {
    fn is_done(&self) -> bool {
        self.old_left == 0 && self.new_left == 0
    }
}

const DEV_NULL: &str = "/dev/null";

/// Parse unified diff text (plain `git diff` output or an e-mail formatted
/// `.patch`) into per-file changes.
///
/// Never fails as a whole: a section that is binary, has a malformed hunk
/// header, or has no extractable path is dropped with a
/// [`ParseDiagnostic`], and parsing continues with the next section.
///
/// Hunk bodies are bounded by the line counts in their `@@` header, so the
/// `-- ` signature trailer of a mailed patch is never read as a removed line.
///
/// # Examples
///
/// ```
/// use vintro_difflens::parser::parse_patch;
///
/// let parsed = parse_patch("");
/// assert!(parsed.files.is_empty());
/// assert!(parsed.diagnostics.is_empty());
/// ```
pub fn parse_patch(input: &str) -> ParsedPatch {
    let mut out = ParsedPatch::default();
    let mut current: Option<Section> = None;
    let mut open: Option<OpenHunk> = None;

    // Split on '\n' only: a '\r' inside a hunk body belongs to the file.
    let lines: Vec<&str> = input
        .split_inclusive('\n')
        .map(|l| l.strip_suffix('\n').unwrap_or(l))
        .collect();

    for (idx, &full) in lines.iter().enumerate() {
        let line_no = idx + 1;
        let line = full.strip_suffix('\r').unwrap_or(full);

        if let Some(hunk) = open.as_mut() {
            if consume_hunk_line(hunk, full) {
                if hunk.is_done() {
                    close_hunk(&mut current, &mut open);
                }
                continue;
            }
            // Body ended before the header's counts were satisfied.
            close_hunk(&mut current, &mut open);
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            finish_section(&mut out, current.take());
            let mut section = Section::new(line_no);
            match split_git_header(rest) {
                Some((old, new)) => {
                    section.header_old = Some(old);
                    section.header_new = Some(new);
                }
                None => debug!(line = line_no, "unrecognised diff --git header"),
            }
            current = Some(section);
            continue;
        }

        if let Some(raw) = line.strip_prefix("--- ") {
            let next_is_plus = lines
                .get(idx + 1)
                .is_some_and(|next| next.starts_with("+++ "));
            let starts_new = match current.as_ref() {
                None => next_is_plus,
                Some(section) => next_is_plus && section.saw_minus_header,
            };
            if starts_new {
                finish_section(&mut out, current.take());
                current = Some(Section::new(line_no));
            }
            if let Some(section) = current.as_mut() {
                section.saw_minus_header = true;
                section.minus_path = Some(parse_path(raw));
            }
            continue;
        }

        let Some(section) = current.as_mut() else {
            continue;
        };

        if section.malformed.is_some() {
            continue;
        }

        if let Some(raw) = line.strip_prefix("+++ ") {
            section.plus_path = Some(parse_path(raw));
            continue;
        }

        if line.starts_with("@@ ") {
            match parse_hunk_header(line) {
                Ok((old_start, old_lines, new_start, new_lines)) => {
                    let pending = OpenHunk {
                        hunk: Hunk {
                            old_start,
                            old_lines,
                            new_start,
                            new_lines,
                            lines: Vec::new(),
                        },
                        old_left: old_lines,
                        new_left: new_lines,
                    };
                    if pending.is_done() {
                        section.change.hunks.push(pending.hunk);
                    } else {
                        open = Some(pending);
                    }
                }
                Err(e) => section.malformed = Some(e.to_string()),
            }
            continue;
        }

        if (line.starts_with("Binary files ") && line.ends_with(" differ"))
            || line == "GIT binary patch"
        {
            section.is_binary = true;
            continue;
        }

        if line.starts_with("new file mode") {
            section.change.is_new_file = true;
        } else if line.starts_with("deleted file mode") {
            section.change.is_deleted_file = true;
        } else if let Some(from) = line
            .strip_prefix("rename from ")
            .or_else(|| line.strip_prefix("copy from "))
        {
            section.change.is_rename = true;
            section.minus_path = Some(unquote(from));
        } else if let Some(to) = line
            .strip_prefix("rename to ")
            .or_else(|| line.strip_prefix("copy to "))
        {
            section.change.is_rename = true;
            section.plus_path = Some(unquote(to));
        }
    }

    close_hunk(&mut current, &mut open);
    finish_section(&mut out, current.take());

    debug!(
        files = out.files.len(),
        dropped = out.diagnostics.len(),
        "parsed patch"
    );
    out
}

fn consume_hunk_line(open: &mut OpenHunk, line: &str) -> bool {
    if line.starts_with('\\') {
        return true;
    }
    let line = if line == "\r" { "" } else { line };
    let (kind, text) = match line.chars().next() {
        Some('+') => {
            open.new_left = open.new_left.saturating_sub(1);
            (LineKind::Added, &line[1..])
        }
        Some('-') => {
            open.old_left = open.old_left.saturating_sub(1);
            (LineKind::Removed, &line[1..])
        }
        Some(' ') => {
            open.old_left = open.old_left.saturating_sub(1);
            open.new_left = open.new_left.saturating_sub(1);
            (LineKind::Context, &line[1..])
        }
        // Some tools strip the single space from blank context lines.
        None => {
            open.old_left = open.old_left.saturating_sub(1);
            open.new_left = open.new_left.saturating_sub(1);
            (LineKind::Context, "")
        }
        Some(_) => return false,
    };
    open.hunk.lines.push(HunkLine {
        kind,
        text: text.to_string(),
    });
    true
}

fn close_hunk(current: &mut Option<Section>, open: &mut Option<OpenHunk>) {
    let Some(done) = open.take() else {
        return;
    };
    let Some(section) = current.as_mut() else {
        return;
    };
    for line in &done.hunk.lines {
        let bucket = match line.kind {
            LineKind::Added => &mut section.change.added_lines,
            LineKind::Removed => &mut section.change.removed_lines,
            LineKind::Context => &mut section.change.context_lines,
        };
        bucket.push(line.text.clone());
    }
    section.change.hunks.push(done.hunk);
}

fn finish_section(out: &mut ParsedPatch, section: Option<Section>) {
    let Some(mut section) = section else {
        return;
    };

    let old = section
        .minus_path
        .take()
        .filter(|p| p != DEV_NULL)
        .or(section.header_old.take());
    let new = section
        .plus_path
        .take()
        .filter(|p| p != DEV_NULL)
        .or(section.header_new.take());

    if new.is_none() && old.is_some() {
        section.change.is_deleted_file = true;
    }

    let path = if section.change.is_deleted_file {
        old.clone().or(new)
    } else {
        new.or(old.clone())
    };

    if let Some(reason) = section.malformed {
        warn!(line = section.start_line, path = ?path, %reason, "skipping malformed file section");
        out.diagnostics.push(ParseDiagnostic {
            line: section.start_line,
            path,
            reason,
        });
        return;
    }

    let Some(path) = path.filter(|p| !p.is_empty()) else {
        warn!(line = section.start_line, "skipping file section with no extractable path");
        out.diagnostics.push(ParseDiagnostic {
            line: section.start_line,
            path: None,
            reason: "no extractable file path".into(),
        });
        return;
    };

    if section.is_binary {
        debug!(%path, "skipping binary file section");
        out.diagnostics.push(ParseDiagnostic {
            line: section.start_line,
            path: Some(path),
            reason: "binary file".into(),
        });
        return;
    }

    section.change.old_path = if section.change.is_new_file {
        String::new()
    } else {
        old.unwrap_or_else(|| path.clone())
    };
    section.change.path = path;

    if let Some(existing) = out.files.iter_mut().find(|f| f.path == section.change.path) {
        existing.absorb(section.change);
    } else {
        out.files.push(section.change);
    }
}

/// Split the `a/<old> b/<new>` tail of a `diff --git` line.
///
/// When both sides name the same file the split point is unambiguous even
/// if the path contains spaces or the text ` b/`, so that case is tried
/// first.
fn split_git_header(rest: &str) -> Option<(String, String)> {
    let rest = rest.trim_end();

    if rest.starts_with('"') {
        let (old, tail) = take_quoted(rest)?;
        let tail = tail.trim_start();
        let new = if tail.starts_with('"') {
            take_quoted(tail)?.0
        } else {
            tail.to_string()
        };
        return Some((strip_side_prefix(&old), strip_side_prefix(&new)));
    }

    let len = rest.len();
    if len >= 7 && len % 2 == 1 && rest.starts_with("a/") {
        let n = (len - 5) / 2;
        let old = rest.get(2..2 + n)?;
        let sep = rest.get(2 + n..n + 5);
        let new = rest.get(n + 5..);
        if sep == Some(" b/") && new == Some(old) {
            return Some((old.to_string(), old.to_string()));
        }
    }

    let split = rest.find(" b/").or_else(|| rest.find(" \"b/"))?;
    let old = &rest[..split];
    let new = rest[split + 1..].trim_matches('"');
    Some((strip_side_prefix(old), strip_side_prefix(new)))
}

fn strip_side_prefix(raw: &str) -> String {
    raw.strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw)
        .to_string()
}

fn parse_path(raw: &str) -> String {
    // Non-git diffs may append a tab and a timestamp.
    let raw = raw.split('\t').next().unwrap_or(raw).trim_end();
    let normalized = unquote(raw);

    if normalized == DEV_NULL {
        return normalized;
    }

    strip_side_prefix(&normalized)
}

fn unquote(raw: &str) -> String {
    if raw.starts_with('"') {
        if let Some((inner, _)) = take_quoted(raw) {
            return inner;
        }
    }
    raw.to_string()
}

/// Read a C-style quoted string as git writes it, returning the decoded
/// text and whatever follows the closing quote.
fn take_quoted(raw: &str) -> Option<(String, &str)> {
    let body = raw.strip_prefix('"')?;
    let mut bytes = Vec::new();
    let mut iter = body.char_indices();

    while let Some((i, c)) = iter.next() {
        match c {
            '"' => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                return Some((text, &body[i + 1..]));
            }
            '\\' => {
                let (_, esc) = iter.next()?;
                match esc {
                    'n' => bytes.push(b'\n'),
                    't' => bytes.push(b'\t'),
                    '"' => bytes.push(b'"'),
                    '\\' => bytes.push(b'\\'),
                    '0'..='7' => {
                        let mut value = esc.to_digit(8)?;
                        for _ in 0..2 {
                            let (_, d) = iter.next()?;
                            value = value * 8 + d.to_digit(8)?;
                        }
                        bytes.push(u8::try_from(value).ok()?);
                    }
                    other => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
            other => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    None
}

fn parse_hunk_header(line: &str) -> Result<(u32, u32, u32, u32), VintroError> {
    let inner = line
        .strip_prefix("@@ ")
        .and_then(|s| {
            let end = s.find(" @@")?;
            Some(&s[..end])
        })
        .ok_or_else(|| VintroError::Parse(format!("invalid hunk header: {line}")))?;

    let parts: Vec<&str> = inner.split(' ').collect();
    if parts.len() != 2 {
        return Err(VintroError::Parse(format!("invalid hunk header: {line}")));
    }

    let old = parts[0]
        .strip_prefix('-')
        .ok_or_else(|| VintroError::Parse(format!("invalid old range in hunk: {line}")))?;
    let new = parts[1]
        .strip_prefix('+')
        .ok_or_else(|| VintroError::Parse(format!("invalid new range in hunk: {line}")))?;

    let (old_start, old_lines) = parse_range(old, line)?;
    let (new_start, new_lines) = parse_range(new, line)?;

    Ok((old_start, old_lines, new_start, new_lines))
}

fn parse_range(range: &str, context: &str) -> Result<(u32, u32), VintroError> {
    if let Some((start, count)) = range.split_once(',') {
        let s = start
            .parse()
            .map_err(|_| VintroError::Parse(format!("invalid range number in: {context}")))?;
        let c = count
            .parse()
            .map_err(|_| VintroError::Parse(format!("invalid range count in: {context}")))?;
        Ok((s, c))
    } else {
        let s = range
            .parse()
            .map_err(|_| VintroError::Parse(format!("invalid range number in: {context}")))?;
        Ok((s, 1))
    }
}
