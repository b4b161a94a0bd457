use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::markup::{balanced_end, clean_markup, truncate_chars};

pub const SUMMARY_MAX_CHARS: usize = 500;
pub const MAX_CATEGORIES: usize = 10;

static CATEGORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\[\s*Category\s*:([^\]|]*)(?:\|[^\]]*)?\]\]").unwrap()
});

/// Infobox fields in source order. Serialized as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Infobox {
    fields: Vec<(String, String)>,
}

impl Infobox {
    /// Insert or overwrite in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl Serialize for Infobox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Infobox {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct InfoboxVisitor;

        impl<'de> Visitor<'de> for InfoboxVisitor {
            type Value = Infobox;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of infobox fields")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Infobox, A::Error> {
                let mut infobox = Infobox::default();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    infobox.insert(k, v);
                }
                Ok(infobox)
            }
        }

        deserializer.deserialize_map(InfoboxVisitor)
    }
}

/// First `{{Infobox ...}}` block as cleaned key/value pairs.
pub fn extract_infobox(raw: &str) -> Option<Infobox> {
    let inner = find_infobox_block(raw)?;
    let mut infobox = Infobox::default();

    for param in split_top_level_pipes(inner).into_iter().skip(1) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim_matches(|c: char| c == '|' || c.is_whitespace());
        let value = clean_markup(value.trim());
        if !key.is_empty() && !value.is_empty() {
            infobox.insert(key, value);
        }
    }

    (!infobox.is_empty()).then_some(infobox)
}

fn find_infobox_block(raw: &str) -> Option<&str> {
    let mut offset = 0;
    while let Some(found) = raw[offset..].find("{{") {
        let start = offset + found + 2;
        let after = &raw[start..];
        if after
            .trim_start()
            .get(..7)
            .is_some_and(|name| name.eq_ignore_ascii_case("infobox"))
        {
            let end = balanced_end(after, "{{", "}}")?;
            return Some(&after[..end - 2]);
        }
        offset = start;
    }
    None
}

/// Split on `|` that are not nested inside `{{ }}` or `[[ ]]`.
fn split_top_level_pipes(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let (mut braces, mut brackets) = (0usize, 0usize);
    let mut last = 0;
    let mut i = 0;

    while i < bytes.len() {
        match &bytes[i..] {
            [b'{', b'{', ..] => {
                braces += 1;
                i += 2;
            }
            [b'}', b'}', ..] => {
                braces = braces.saturating_sub(1);
                i += 2;
            }
            [b'[', b'[', ..] => {
                brackets += 1;
                i += 2;
            }
            [b']', b']', ..] => {
                brackets = brackets.saturating_sub(1);
                i += 2;
            }
            [b'|', ..] if braces == 0 && brackets == 0 => {
                parts.push(&text[last..i]);
                i += 1;
                last = i;
            }
            _ => i += 1,
        }
    }
    parts.push(&text[last..]);
    parts
}

#[cfg(test)]
pub fn extract_summary(raw: &str) -> String {
    summary_of_cleaned(&clean_markup(raw))
}

/// First non-empty paragraph of text that already went through
/// `clean_markup`, at most 500 characters. The assembler cleans each body
/// once and derives both the summary and the stored body from it.
pub fn summary_of_cleaned(cleaned: &str) -> String {
    cleaned
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(|p| truncate_chars(p, SUMMARY_MAX_CHARS))
        .unwrap_or_default()
}

/// Category names in source order, sort keys dropped, first ten kept.
pub fn extract_categories(raw: &str) -> Vec<String> {
    CATEGORY_RE
        .captures_iter(raw)
        .map(|caps| caps[1].trim().to_string())
        .filter(|name| !name.is_empty())
        .take(MAX_CATEGORIES)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infobox_from_fixture() {
        let raw = std::fs::read_to_string("tests/fixtures/paris.wiki").unwrap();
        let infobox = extract_infobox(&raw).unwrap();
        assert_eq!(infobox.len(), 1);
        assert_eq!(infobox.get("population"), Some("2,000,000"));
    }

    #[test]
    fn infobox_values_are_cleaned_and_ordered() {
        let raw = "Lead {{Infobox person\n| name = '''Ada''' <ref>x</ref>\n| spouse = [[William King|William]]\n| born = {{birth date|1815|12|10}} London\n| empty =\n| name = Ada Lovelace\n}} tail";
        let infobox = extract_infobox(raw).unwrap();
        let fields: Vec<_> = infobox.iter().collect();
        assert_eq!(
            fields,
            vec![
                ("name", "Ada Lovelace"),
                ("spouse", "William"),
                ("born", "London"),
            ]
        );
    }

    #[test]
    fn infobox_absent_or_useless() {
        assert!(extract_infobox("no templates here").is_none());
        assert!(extract_infobox("{{Cite web|url=x}}").is_none());
        assert!(extract_infobox("{{Infobox thing\n| = value\n| key = {{tmpl}}\n}}").is_none());
        assert!(extract_infobox("{{Infobox open | a = b").is_none());
    }

    #[test]
    fn infobox_nested_in_other_template() {
        let raw = "{{Wrapper|{{infobox ship|name=Endeavour}}}}";
        assert_eq!(extract_infobox(raw).unwrap().get("name"), Some("Endeavour"));
    }

    #[test]
    fn infobox_serializes_as_object() {
        let mut infobox = Infobox::default();
        infobox.insert("b", "2");
        infobox.insert("a", "1");
        let json = serde_json::to_string(&infobox).unwrap();
        assert_eq!(json, r#"{"b":"2","a":"1"}"#);
        let back: Infobox = serde_json::from_str(&json).unwrap();
        assert_eq!(back, infobox);
    }

    #[test]
    fn summary_is_first_paragraph() {
        let raw = "{{Infobox x|a=b}}\n\n'''Rome''' is old.\nStill first.\n\nSecond paragraph.";
        assert_eq!(extract_summary(raw), "Rome is old.\nStill first.");
        assert_eq!(extract_summary("{{only template}}"), "");
        assert_eq!(extract_summary(""), "");
    }

    #[test]
    fn summary_is_capped() {
        let raw = "word ".repeat(400);
        assert_eq!(extract_summary(&raw).chars().count(), SUMMARY_MAX_CHARS);
    }

    #[test]
    fn categories_in_order_with_cap() {
        let raw = "[[Category:Cities|Paris]] [[category: Capitals ]] [[Category:]]";
        assert_eq!(extract_categories(raw), vec!["Cities", "Capitals"]);

        let many: String = (0..15).map(|i| format!("[[Category:C{i}]]")).collect();
        let cats = extract_categories(&many);
        assert_eq!(cats.len(), MAX_CATEGORIES);
        assert_eq!(cats[0], "C0");
        assert_eq!(cats[9], "C9");
    }

    #[test]
    fn repeated_categories_are_kept() {
        let raw = "[[Category:A]][[Category:A]]";
        assert_eq!(extract_categories(raw), vec!["A", "A"]);
    }
}
