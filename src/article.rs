use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::parser::extract::summary_of_cleaned;
use crate::parser::markup::truncate_chars;
use crate::parser::{clean_markup, extract_categories, extract_infobox, Infobox, RawRecord};

pub const BODY_MAX_CHARS: usize = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub summary: String,
    pub body: String,
    pub infobox: Option<Infobox>,
    pub categories: Vec<String>,
    /// Byte length of the raw wikitext.
    pub length: usize,
}

/// Category allow-list. Empty means every article passes.
#[derive(Debug, Clone, Default)]
pub struct ArticleFilter {
    allow: Option<HashSet<String>>,
}

impl ArticleFilter {
    pub fn new(categories: &[String]) -> Self {
        let allow: HashSet<String> = categories
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        Self {
            allow: (!allow.is_empty()).then_some(allow),
        }
    }

    pub fn admits(&self, categories: &[String]) -> bool {
        match &self.allow {
            Some(allow) => categories.iter().any(|c| allow.contains(c)),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    Accepted(Article),
    Filtered { title: String },
}

/// Build the output article, checking the allow-list before any cleaning.
pub fn assemble(raw: RawRecord, filter: &ArticleFilter) -> Assembly {
    let categories = extract_categories(&raw.raw_body);
    if !filter.admits(&categories) {
        return Assembly::Filtered { title: raw.title };
    }

    let cleaned = clean_markup(&raw.raw_body);
    Assembly::Accepted(Article {
        summary: summary_of_cleaned(&cleaned),
        body: truncate_chars(&cleaned, BODY_MAX_CHARS),
        infobox: extract_infobox(&raw.raw_body),
        categories,
        length: raw.raw_body.len(),
        title: raw.title,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::extract::{MAX_CATEGORIES, SUMMARY_MAX_CHARS};

    fn record(title: &str, body: &str) -> RawRecord {
        RawRecord {
            title: title.into(),
            raw_body: body.into(),
        }
    }

    fn accepted(a: Assembly) -> Article {
        match a {
            Assembly::Accepted(article) => article,
            Assembly::Filtered { title } => panic!("{title} was filtered"),
        }
    }

    #[test]
    fn paris_end_to_end() {
        let raw = std::fs::read_to_string("tests/fixtures/paris.wiki").unwrap();
        let article = accepted(assemble(record("Paris", &raw), &ArticleFilter::default()));

        assert_eq!(article.title, "Paris");
        assert_eq!(
            article.summary,
            "Paris is the capital and most populous city of France."
        );
        let infobox = article.infobox.unwrap();
        assert_eq!(infobox.len(), 1);
        assert_eq!(infobox.get("population"), Some("2,000,000"));
        assert_eq!(article.categories, vec!["Cities"]);
        assert_eq!(article.length, raw.len());
        assert!(article.body.starts_with(&article.summary));
        assert!(article.body.contains("It sits on the Seine"));
    }

    #[test]
    fn allow_list_is_exact() {
        let filter = ArticleFilter::new(&["History".to_string()]);
        let tagged = record("Rome", "Old. [[Category:History]]");
        let untagged = record("Plain", "Nothing.");
        let lower = record("Lower", "x [[Category:history]]");

        assert!(matches!(assemble(tagged, &filter), Assembly::Accepted(_)));
        assert_eq!(
            assemble(untagged, &filter),
            Assembly::Filtered {
                title: "Plain".into()
            }
        );
        assert!(matches!(assemble(lower, &filter), Assembly::Filtered { .. }));
    }

    #[test]
    fn blank_allow_list_admits_everything() {
        let filter = ArticleFilter::new(&["  ".to_string()]);
        assert!(filter.admits(&[]));
    }

    #[test]
    fn caps_hold_for_large_input() {
        let mut body = "paragraph ".repeat(2000);
        for i in 0..25 {
            body.push_str(&format!("[[Category:C{i}]]"));
        }
        let article = accepted(assemble(record("Big", &body), &ArticleFilter::default()));
        assert!(article.summary.chars().count() <= SUMMARY_MAX_CHARS);
        assert_eq!(article.body.chars().count(), BODY_MAX_CHARS);
        assert_eq!(article.categories.len(), MAX_CATEGORIES);
    }

    #[test]
    fn json_shape() {
        let article = accepted(assemble(record("Q", "Quiet."), &ArticleFilter::default()));
        let json: serde_json::Value = serde_json::to_value(&article).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "title": "Q",
                "summary": "Quiet.",
                "body": "Quiet.",
                "infobox": null,
                "categories": [],
                "length": 6
            })
        );
    }
}
