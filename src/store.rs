use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::ser::{SerializeSeq, Serializer as _};
use serde_json::ser::PrettyFormatter;
use tracing::debug;

use crate::article::Article;
use crate::error::StoreError;

pub const DOCUMENTS_FILE: &str = "wiki_articles.json";
pub const CATEGORY_INDEX_FILE: &str = "category_index.json";

fn sibling(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    target.with_file_name(name)
}

fn ensure_parent(target: &Path) -> Result<(), StoreError> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Write `<target>.tmp` through `fill`, then rename it over `target`.
fn replace_file(
    target: &Path,
    fill: impl FnOnce(&mut BufWriter<File>) -> Result<(), StoreError>,
) -> Result<(), StoreError> {
    let tmp = sibling(target, ".tmp");
    let mut out = BufWriter::new(File::create(&tmp)?);
    fill(&mut out)?;
    out.flush()?;
    drop(out);
    fs::rename(&tmp, target)?;
    Ok(())
}

// ── Document store ──

/// Streams accepted articles to a JSON-lines spill file and turns it into a
/// pretty-printed array at `finish`. Only the last article with a given title
/// survives, at the position where it was last written.
pub struct DocumentWriter {
    target: PathBuf,
    spill_path: PathBuf,
    spill: BufWriter<File>,
    latest: HashMap<String, u64>,
    written: u64,
}

impl DocumentWriter {
    pub fn create(target: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let target = target.into();
        ensure_parent(&target)?;
        let spill_path = sibling(&target, ".spill");
        let spill = BufWriter::new(File::create(&spill_path)?);
        Ok(Self {
            target,
            spill_path,
            spill,
            latest: HashMap::new(),
            written: 0,
        })
    }

    pub fn write(&mut self, article: &Article) -> Result<(), StoreError> {
        serde_json::to_writer(&mut self.spill, article)?;
        self.spill.write_all(b"\n")?;
        self.latest.insert(article.title.clone(), self.written);
        self.written += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<usize, StoreError> {
        self.spill.flush()?;
        let keep: HashSet<u64> = self.latest.values().copied().collect();
        let reader = BufReader::new(File::open(&self.spill_path)?);

        replace_file(&self.target, |out| {
            let mut ser =
                serde_json::Serializer::with_formatter(out, PrettyFormatter::with_indent(b"  "));
            let mut seq = ser.serialize_seq(None)?;
            for (seq_no, line) in (0u64..).zip(reader.lines()) {
                let line = line?;
                if keep.contains(&seq_no) {
                    let article: Article = serde_json::from_str(&line)?;
                    seq.serialize_element(&article)?;
                }
            }
            seq.end()?;
            Ok(())
        })?;

        debug!(
            "document store: {} lines spilled, {} kept",
            self.written,
            keep.len()
        );
        Ok(keep.len())
    }
}

impl Drop for DocumentWriter {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.spill_path);
    }
}

// ── Category index ──

/// Category → titles, in the order the titles were accepted.
#[derive(Debug, Default)]
pub struct CategoryIndex {
    entries: BTreeMap<String, Vec<String>>,
    by_title: HashMap<String, Vec<String>>,
}

impl CategoryIndex {
    pub fn add(&mut self, article: &Article) {
        if let Some(previous) = self.by_title.remove(&article.title) {
            for category in previous {
                if let Some(titles) = self.entries.get_mut(&category) {
                    titles.retain(|t| *t != article.title);
                    if titles.is_empty() {
                        self.entries.remove(&category);
                    }
                }
            }
        }

        let mut declared = Vec::with_capacity(article.categories.len());
        for category in &article.categories {
            if declared.contains(category) {
                continue;
            }
            self.entries
                .entry(category.clone())
                .or_default()
                .push(article.title.clone());
            declared.push(category.clone());
        }
        self.by_title.insert(article.title.clone(), declared);
    }

    #[cfg(test)]
    pub fn titles(&self, category: &str) -> Option<&[String]> {
        self.entries.get(category).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct CategoryIndexWriter {
    target: PathBuf,
    index: CategoryIndex,
}

impl CategoryIndexWriter {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            index: CategoryIndex::default(),
        }
    }

    pub fn add(&mut self, article: &Article) {
        self.index.add(article);
    }

    /// Returns the number of categories written.
    pub fn finish(self) -> Result<usize, StoreError> {
        ensure_parent(&self.target)?;
        replace_file(&self.target, |out| {
            serde_json::to_writer_pretty(out, &self.index.entries)?;
            Ok(())
        })?;
        Ok(self.index.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(title: &str, body: &str, categories: &[&str]) -> Article {
        Article {
            title: title.into(),
            summary: body.into(),
            body: body.into(),
            infobox: None,
            categories: categories.iter().map(|c| c.to_string()).collect(),
            length: body.len(),
        }
    }

    #[test]
    fn documents_match_pretty_array() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join(DOCUMENTS_FILE);

        let mut infoboxed = article("Paris", "Capital « de » France", &["Cities"]);
        let mut infobox = crate::parser::Infobox::default();
        infobox.insert("population", "2,000,000");
        infoboxed.infobox = Some(infobox);

        let first = article("Rome", "old text", &["History"]);
        let other = article("Oslo", "line one\nline two", &[]);
        let replaced = article("Rome", "new text", &["History", "Cities"]);

        let mut writer = DocumentWriter::create(&target).unwrap();
        for a in [&first, &infoboxed, &other, &replaced] {
            writer.write(a).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 3);

        let expected =
            serde_json::to_string_pretty(&vec![infoboxed, other, replaced]).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), expected);
        assert!(!sibling(&target, ".spill").exists());
        assert!(!sibling(&target, ".tmp").exists());
    }

    #[test]
    fn empty_document_store_is_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/out.json");
        DocumentWriter::create(&target).unwrap().finish().unwrap();
        let empty: Vec<Article> = Vec::new();
        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            serde_json::to_string_pretty(&empty).unwrap()
        );
    }

    #[test]
    fn dropped_writer_leaves_no_spill() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join(DOCUMENTS_FILE);
        let mut writer = DocumentWriter::create(&target).unwrap();
        writer.write(&article("A", "a", &[])).unwrap();
        drop(writer);
        assert!(!sibling(&target, ".spill").exists());
        assert!(!target.exists());
    }

    #[test]
    fn index_replaces_earlier_entries() {
        let mut index = CategoryIndex::default();
        index.add(&article("Rome", "", &["History", "Cities"]));
        index.add(&article("Paris", "", &["Cities"]));
        index.add(&article("Rome", "", &["History", "History"]));

        assert_eq!(index.titles("History").unwrap(), ["Rome"]);
        assert_eq!(index.titles("Cities").unwrap(), ["Paris"]);
        assert_eq!(index.len(), 2);

        index.add(&article("Paris", "", &[]));
        assert!(index.titles("Cities").is_none());
    }

    #[test]
    fn index_file_has_sorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join(CATEGORY_INDEX_FILE);
        let mut writer = CategoryIndexWriter::new(&target);
        writer.add(&article("Zurich", "", &["Cities", "Alps"]));
        writer.add(&article("Bern", "", &["Cities"]));
        assert_eq!(writer.finish().unwrap(), 2);

        let text = fs::read_to_string(&target).unwrap();
        assert_eq!(
            text,
            "{\n  \"Alps\": [\n    \"Zurich\"\n  ],\n  \"Cities\": [\n    \"Zurich\",\n    \"Bern\"\n  ]\n}"
        );
    }
}
