//! Cleanup passes over htmd output.
//!
//! Passes run in order and leave fenced code blocks untouched.

use std::sync::LazyLock;

use regex::Regex;

/// Run every pass.
pub(crate) fn run(md: &str) -> String {
    let md = map_prose_lines(md, |line| {
        let line = strip_wrapper_tags(line);
        drop_permalink_anchors(&line)
    });
    let md = demote_extra_h1(&md);
    let md = fix_fence_languages(&md);
    collapse_blank_lines(&md)
}

/// Apply `f` to every line outside fenced code blocks.
fn map_prose_lines(md: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut in_fence = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                return line.to_string();
            }
            if in_fence { line.to_string() } else { f(line) }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Layout elements htmd passes through verbatim.
fn strip_wrapper_tags(line: &str) -> String {
    static WRAPPER: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"</?(?:div|span|section|figure|figcaption|details|summary|center)(?:\s[^>]*)?>")
            .expect("valid regex")
    });
    WRAPPER.replace_all(line, "").into_owned()
}

/// `## Install [#](#install)` → `## Install`.
fn drop_permalink_anchors(line: &str) -> String {
    static ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\s*\[(?:#|¶|🔗|)\]\(#[^)]*\)").expect("valid regex")
    });
    ANCHOR.replace_all(line, "").into_owned()
}

/// Keep the first `# ` heading; later ones become `## `.
fn demote_extra_h1(md: &str) -> String {
    let mut seen_h1 = false;
    map_prose_lines(md, |line| {
        if !line.starts_with("# ") {
            return line.to_string();
        }
        if std::mem::replace(&mut seen_h1, true) {
            format!("#{line}")
        } else {
            line.to_string()
        }
    })
}

/// ```` ```language-rust ```` → ```` ```rust ````.
fn fix_fence_languages(md: &str) -> String {
    static FENCE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^(\s*)```(?:language-|lang-|highlight-)([\w+-]+)").expect("valid regex")
    });
    FENCE.replace_all(md, "$1```$2").into_owned()
}

/// Trim trailing spaces, squeeze blank runs to one blank line, end with one newline.
fn collapse_blank_lines(md: &str) -> String {
    let mut out = String::with_capacity(md.len());
    let mut blank_run = 0;
    for line in md.lines().map(str::trim_end) {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 || out.is_empty() {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    while out.ends_with("\n\n") {
        out.pop();
    }
    if out.is_empty() {
        return out;
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}
