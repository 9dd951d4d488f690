//! Choosing which lines of a file change to attribute.
//!
//! Removed lines are the direct evidence: the fix deleted or rewrote them.
//! A fix that only adds code has no such lines, so a small window of the
//! unchanged lines around the first insertion stands in for "the region
//! where the bug lived", and the result is flagged as lower confidence.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::parser::{FileChange, LineKind};

/// Lines to look up in the parent revision's blame, plus whether they came
/// from the context fallback.
///
/// # Examples
///
/// ```
/// use vintro_difflens::parser::parse_patch;
/// use vintro_difflens::select::select_targets;
///
/// let diff = "diff --git a/foo.c b/foo.c\n\
///             --- a/foo.c\n\
///             +++ b/foo.c\n\
///             @@ -1 +1 @@\n\
///             -int x = 1;\n\
///             +int x = 2;\n";
/// let change = &parse_patch(diff).files[0];
/// let target = select_targets(change, 3);
/// assert!(!target.used_context_lines);
/// assert!(target.lines.contains("int x = 1;"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttributionTarget {
    /// Whitespace-trimmed, non-blank line contents.
    pub lines: BTreeSet<String>,
    /// `true` when no line was removed and context lines were used instead.
    pub used_context_lines: bool,
}

impl AttributionTarget {
    /// Whether there is nothing to attribute.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Number of distinct target lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }
}

/// Pick the attribution target for one file.
///
/// - Any removed line: the removed lines, `used_context_lines = false`.
/// - Only added lines: up to `window` unchanged lines on either side of the
///   first added line within its hunk, `used_context_lines = true`.
/// - Neither: an empty target; the file has no evidence.
///
/// Blank lines never become targets, since they would match anything.
pub fn select_targets(change: &FileChange, window: usize) -> AttributionTarget {
    if !change.removed_lines.is_empty() {
        return AttributionTarget {
            lines: trimmed_set(change.removed_lines.iter().map(String::as_str)),
            used_context_lines: false,
        };
    }

    if change.added_lines.is_empty() {
        return AttributionTarget::default();
    }

    AttributionTarget {
        lines: trimmed_set(context_window(change, window)),
        used_context_lines: true,
    }
}

fn trimmed_set<'a>(lines: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    lines
        .into_iter()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Unchanged lines within `window` positions of the first added line.
///
/// Positions are counted in the raw hunk body, so neighbouring added lines
/// use up window slots without contributing text. The window never crosses
/// into another hunk.
fn context_window(change: &FileChange, window: usize) -> Vec<&str> {
    for hunk in &change.hunks {
        let Some(pos) = hunk
            .lines
            .iter()
            .position(|l| l.kind == LineKind::Added)
        else {
            continue;
        };

        let start = pos.saturating_sub(window);
        let end = (pos + window).min(hunk.lines.len().saturating_sub(1));

        return hunk.lines[start..=end]
            .iter()
            .filter(|l| l.kind == LineKind::Context)
            .map(|l| l.text.as_str())
            .collect();
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_patch;

    fn only_change(diff: &str) -> FileChange {
        let mut parsed = parse_patch(diff);
        assert_eq!(parsed.files.len(), 1);
        parsed.files.remove(0)
    }

    #[test]
    fn removed_lines_win() {
        let change = only_change(
            "\
diff --git a/foo.c b/foo.c
--- a/foo.c
+++ b/foo.c
@@ -1,3 +1,3 @@
 int main() {
-int x = 1;
+int x = 2;
 }
",
        );
        let target = select_targets(&change, 3);
        assert!(!target.used_context_lines);
        assert_eq!(target.lines, BTreeSet::from(["int x = 1;".to_string()]));
    }

    #[test]
    fn removed_lines_are_trimmed_and_deduplicated() {
        let change = only_change(
            "\
diff --git a/foo.c b/foo.c
--- a/foo.c
+++ b/foo.c
@@ -1,3 +1,1 @@
-    free(p);
-free(p);
-
+release(p);
",
        );
        let target = select_targets(&change, 3);
        assert!(!target.used_context_lines);
        assert_eq!(target.len(), 1);
        assert!(target.lines.contains("free(p);"));
    }

    #[test]
    fn blank_only_removal_never_falls_back() {
        let change = only_change(
            "\
diff --git a/foo.c b/foo.c
--- a/foo.c
+++ b/foo.c
@@ -1,3 +1,3 @@
 a();
-
+b();
 c();
",
        );
        let target = select_targets(&change, 3);
        assert!(!target.used_context_lines);
        assert!(target.is_empty());
    }

    #[test]
    fn addition_only_uses_surrounding_context() {
        let change = only_change(
            "\
diff --git a/foo.c b/foo.c
--- a/foo.c
+++ b/foo.c
@@ -1,8 +1,9 @@
 l1();
 l2();
 l3();
 l4();
+check();
 l5();
 l6();
 l7();
 l8();
",
        );
        let target = select_targets(&change, 3);
        assert!(target.used_context_lines);
        let expected: BTreeSet<String> = ["l2();", "l3();", "l4();", "l5();", "l6();", "l7();"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(target.lines, expected);
    }

    #[test]
    fn adjacent_additions_consume_window_slots() {
        let change = only_change(
            "\
diff --git a/foo.c b/foo.c
--- a/foo.c
+++ b/foo.c
@@ -1,2 +1,5 @@
 before();
+one();
+two();
+three();
 after();
",
        );
        let target = select_targets(&change, 1);
        assert!(target.used_context_lines);
        assert_eq!(target.lines, BTreeSet::from(["before();".to_string()]));
    }

    #[test]
    fn window_never_exceeds_seven_lines() {
        let mut diff = String::from(
            "diff --git a/big.c b/big.c\n--- a/big.c\n+++ b/big.c\n@@ -1,40 +1,41 @@\n",
        );
        for i in 0..20 {
            diff.push_str(&format!(" ctx{i}();\n"));
        }
        diff.push_str("+added();\n");
        for i in 20..40 {
            diff.push_str(&format!(" ctx{i}();\n"));
        }
        let target = select_targets(&only_change(&diff), 3);
        assert!(target.used_context_lines);
        assert!(target.len() <= 7);
        assert_eq!(target.len(), 6);
    }

    #[test]
    fn window_uses_first_hunk_with_an_addition() {
        let change = only_change(
            "\
diff --git a/foo.c b/foo.c
--- a/foo.c
+++ b/foo.c
@@ -1,1 +1,1 @@
 untouched();
@@ -20,2 +20,3 @@
 near();
+guard();
 far();
",
        );
        let target = select_targets(&change, 3);
        let expected: BTreeSet<String> = ["near();", "far();"].into_iter().map(String::from).collect();
        assert_eq!(target.lines, expected);
    }

    #[test]
    fn no_changes_gives_empty_target() {
        let change = only_change(
            "\
diff --git a/a.c b/b.c
similarity index 100%
rename from a.c
rename to b.c
",
        );
        let target = select_targets(&change, 3);
        assert!(target.is_empty());
        assert!(!target.used_context_lines);
    }
}
