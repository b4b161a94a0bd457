//! Wikitext → plain prose. The passes run in a fixed order, repeated until
//! the text stops changing. A pass never lengthens the text.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static REF_SELF_CLOSING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<ref(\s[^>]*)?/>").unwrap());
static REF_PAIRED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<ref(\s[^>]*)?>.*?</ref\s*>").unwrap());
static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\[\]|]*)(?:\|([^\[\]]*))?\]\]").unwrap());
static EXTERNAL_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(?:(?i:https?|ftp):)?//[^\]]*\]").unwrap());
static EMPHASIS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'{2,}").unwrap());
static BLANK_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:[ \t]*\n){2,}").unwrap());

const MEDIA_PREFIXES: &[&str] = &["file:", "image:"];

pub fn clean_markup(text: &str) -> String {
    let mut current = clean_once(text);
    loop {
        let next = clean_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// One round of every pass. Stripping markup can join the halves of an
/// opener that an earlier pass already looked for, hence the loop above.
fn clean_once(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let text = strip_refs(text);
    let text = strip_templates(&text);
    let text = COMMENT_RE.replace_all(&text, "");
    let text = strip_media_links(&text);
    let text = rewrite_links(&text);
    let text = EXTERNAL_LINK_RE.replace_all(&text, "");
    let text = EMPHASIS_RE.replace_all(&text, "");
    collapse_blank_lines(&text)
}

pub fn strip_refs(text: &str) -> String {
    let text = REF_SELF_CLOSING_RE.replace_all(text, "");
    REF_PAIRED_RE.replace_all(&text, "").into_owned()
}

pub fn strip_templates(text: &str) -> String {
    strip_balanced(text, "{{", "}}", |_| true)
}

pub fn strip_media_links(text: &str) -> String {
    strip_balanced(text, "[[", "]]", is_media_target)
}

fn is_media_target(after_open: &str) -> bool {
    let head: String = after_open
        .trim_start()
        .chars()
        .take(6)
        .collect::<String>()
        .to_ascii_lowercase();
    MEDIA_PREFIXES.iter().any(|p| head.starts_with(p))
}

/// `[[target|label]]` → label, `[[target]]` → target, innermost first until
/// no link is left. Category links are dropped.
pub fn rewrite_links(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = LINK_RE.replace_all(&current, |caps: &Captures| {
            let target = caps.get(1).map_or("", |m| m.as_str());
            if target.trim_start().to_ascii_lowercase().starts_with("category:") {
                return String::new();
            }
            match caps.get(2).map(|m| m.as_str()) {
                Some(label) if !label.trim().is_empty() => label.to_string(),
                _ => target.to_string(),
            }
        });
        match next {
            Cow::Borrowed(_) => return current,
            Cow::Owned(rewritten) => current = rewritten,
        }
    }
}

pub fn collapse_blank_lines(text: &str) -> String {
    BLANK_RUN_RE.replace_all(text, "\n\n").trim().to_string()
}

/// Remove each `open .. close` span (nesting respected) whose text right after
/// `open` satisfies `strip`. An opener that never closes leaves the rest of
/// the text untouched.
pub(crate) fn strip_balanced(
    text: &str,
    open: &str,
    close: &str,
    strip: impl Fn(&str) -> bool,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(open) {
        let after = &rest[start + open.len()..];
        if !strip(after) {
            out.push_str(&rest[..start + open.len()]);
            rest = after;
            continue;
        }
        match balanced_end(after, open, close) {
            Some(end) => {
                out.push_str(&rest[..start]);
                rest = &after[end..];
            }
            None => break,
        }
    }

    out.push_str(rest);
    out
}

/// Byte offset just past the `close` that balances an already-consumed `open`.
pub(crate) fn balanced_end(after_open: &str, open: &str, close: &str) -> Option<usize> {
    let bytes = after_open.as_bytes();
    let (open, close) = (open.as_bytes(), close.as_bytes());
    let mut depth = 1usize;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i..].starts_with(open) {
            depth += 1;
            i += open.len();
        } else if bytes[i..].starts_with(close) {
            depth -= 1;
            i += close.len();
            if depth == 0 {
                return Some(i);
            }
        } else {
            i += 1;
        }
    }
    None
}

/// First `max` characters of `text`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
