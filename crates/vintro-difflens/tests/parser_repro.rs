use vintro_difflens::parser::{parse_patch, LineKind};
use vintro_difflens::select::select_targets;

#[test]
fn parse_patch_without_git_header() {
    let diff = "\
--- /dev/null
+++ b/examples/bad_code.c
@@ -0,0 +1,3 @@
+int main(void) {
+    return 0;
+}
";
    let parsed = parse_patch(diff);
    assert_eq!(parsed.files.len(), 1);
    assert_eq!(parsed.files[0].path, "examples/bad_code.c");
    assert_eq!(parsed.files[0].added_lines.len(), 3);
}

#[test]
fn every_stored_line_is_the_original_minus_one_prefix() {
    let diff = include_str!("fixtures/security_fix.patch");
    let parsed = parse_patch(diff);

    let raw: Vec<&str> = diff.lines().collect();
    for file in &parsed.files {
        for hunk in &file.hunks {
            for line in &hunk.lines {
                let prefix = match line.kind {
                    LineKind::Added => '+',
                    LineKind::Removed => '-',
                    LineKind::Context => ' ',
                };
                let original = format!("{prefix}{}", line.text);
                assert!(
                    raw.contains(&original.as_str()),
                    "no source line for {original:?}"
                );
            }
        }
    }
}

#[test]
fn mailed_fix_selects_removed_lines() {
    let parsed = parse_patch(include_str!("fixtures/security_fix.patch"));

    let header = parsed.get("src/header.c").expect("header.c parsed");
    assert_eq!(
        header.removed_lines,
        vec![
            "    field_len = buf[0];",
            "    memcpy(out->name, buf + 1, field_len);"
        ]
    );
    let target = select_targets(header, 3);
    assert!(!target.used_context_lines);
    assert!(target.lines.contains("field_len = buf[0];"));

    let util = parsed.get("src/util.h").expect("util.h parsed");
    assert!(util.removed_lines.is_empty());
    let target = select_targets(util, 3);
    assert!(target.used_context_lines);
    assert!(target.lines.contains("struct header {"));
    assert!(!target.lines.contains("#define HEADER_NAME_MAX 64"));
}
