use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::Connection;

use crate::article::Article;
use crate::error::StoreError;
use crate::parser::Infobox;

pub const DB_FILE: &str = "wiki_game.db";

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS articles (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            title      TEXT UNIQUE NOT NULL,
            summary    TEXT,
            body       TEXT,
            infobox    TEXT,
            length     INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_title ON articles(title);

        CREATE TABLE IF NOT EXISTS categories (
            article_id INTEGER NOT NULL REFERENCES articles(id),
            category   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_category ON categories(category);
        CREATE INDEX IF NOT EXISTS idx_category_article ON categories(article_id);
        ",
    )
}

// ── Writing ──

/// Incremental writer for the relational output. Holds the database
/// exclusively and commits every `commit_every` articles.
pub struct RelationalWriter {
    conn: Connection,
    commit_every: usize,
    pending: usize,
    written: usize,
}

impl RelationalWriter {
    pub fn open(path: &Path, commit_every: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA locking_mode=EXCLUSIVE; PRAGMA foreign_keys=ON;",
        )?;
        init_schema(&conn)?;
        conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(Self {
            conn,
            commit_every: commit_every.max(1),
            pending: 0,
            written: 0,
        })
    }

    /// Insert or replace one article. A failed article is rolled back on its
    /// own and leaves the open batch intact.
    pub fn write(&mut self, article: &Article) -> Result<(), StoreError> {
        let infobox = article
            .infobox
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute_batch("SAVEPOINT article")?;
        if let Err(e) = self.write_rows(article, infobox.as_deref()) {
            self.conn.execute_batch("ROLLBACK TO article; RELEASE article;")?;
            return Err(e.into());
        }
        self.conn.execute_batch("RELEASE article")?;

        self.written += 1;
        self.pending += 1;
        if self.pending >= self.commit_every {
            self.conn.execute_batch("COMMIT; BEGIN TRANSACTION;")?;
            self.pending = 0;
        }
        Ok(())
    }

    fn write_rows(&self, article: &Article, infobox: Option<&str>) -> rusqlite::Result<()> {
        self.conn
            .prepare_cached(
                "DELETE FROM categories
                 WHERE article_id IN (SELECT id FROM articles WHERE title = ?1)",
            )?
            .execute([&article.title])?;

        self.conn
            .prepare_cached(
                "INSERT OR REPLACE INTO articles (title, summary, body, infobox, length)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(rusqlite::params![
                article.title,
                article.summary,
                article.body,
                infobox,
                article.length as i64,
            ])?;
        let article_id = self.conn.last_insert_rowid();

        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO categories (article_id, category) VALUES (?1, ?2)")?;
        for (i, category) in article.categories.iter().enumerate() {
            if article.categories[..i].contains(category) {
                continue;
            }
            stmt.execute(rusqlite::params![article_id, category])?;
        }
        Ok(())
    }

    /// Commit the open batch and fold the WAL back into the main file.
    pub fn finish(self) -> Result<usize, StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(self.written)
    }
}

// ── Queries ──

pub fn connect(path: &Path) -> Result<Connection> {
    if !path.exists() {
        bail!(
            "database {} not found, run `wikidump run` first",
            path.display()
        );
    }
    let conn = Connection::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub struct ArticleRow {
    pub id: i64,
    pub title: String,
    pub summary: String,
    pub body: String,
    pub infobox: Option<Infobox>,
    pub categories: Vec<String>,
    pub length: i64,
}

fn fetch_articles(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<ArticleRow>> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<i64>>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut cats = conn.prepare_cached(
        "SELECT category FROM categories WHERE article_id = ?1 ORDER BY rowid",
    )?;
    let mut rows = Vec::with_capacity(raw.len());
    for (id, title, summary, body, infobox, length) in raw {
        let infobox = match infobox {
            Some(json) => Some(
                serde_json::from_str::<Infobox>(&json)
                    .with_context(|| format!("bad infobox JSON for {title:?}"))?,
            ),
            None => None,
        };
        let categories = cats
            .query_map([id], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        rows.push(ArticleRow {
            id,
            title,
            summary: summary.unwrap_or_default(),
            body: body.unwrap_or_default(),
            infobox,
            categories,
            length: length.unwrap_or(0),
        });
    }
    Ok(rows)
}

const ARTICLE_COLUMNS: &str = "a.id, a.title, a.summary, a.body, a.infobox, a.length";

pub fn fetch_by_title(conn: &Connection, title: &str) -> Result<Option<ArticleRow>> {
    let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles a WHERE a.title = ?1");
    Ok(fetch_articles(conn, &sql, &[&title])?.into_iter().next())
}

/// Articles whose title or summary contains `keyword`.
pub fn search(conn: &Connection, keyword: &str, limit: usize) -> Result<Vec<ArticleRow>> {
    let pattern = format!("%{}%", escape_like(keyword));
    let sql = format!(
        "SELECT {ARTICLE_COLUMNS} FROM articles a
         WHERE a.title LIKE ?1 ESCAPE '\\' OR a.summary LIKE ?1 ESCAPE '\\'
         ORDER BY a.id
         LIMIT {limit}"
    );
    fetch_articles(conn, &sql, &[&pattern])
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn fetch_by_category(
    conn: &Connection,
    category: &str,
    limit: usize,
) -> Result<Vec<ArticleRow>> {
    let sql = format!(
        "SELECT {ARTICLE_COLUMNS} FROM articles a
         JOIN categories c ON c.article_id = a.id
         WHERE c.category = ?1
         GROUP BY a.id
         ORDER BY a.id
         LIMIT {limit}"
    );
    fetch_articles(conn, &sql, &[&category])
}

pub fn fetch_random(
    conn: &Connection,
    count: usize,
    category: Option<&str>,
) -> Result<Vec<ArticleRow>> {
    match category {
        Some(cat) => {
            let sql = format!(
                "SELECT {ARTICLE_COLUMNS} FROM articles a
                 WHERE a.id IN (SELECT article_id FROM categories WHERE category = ?1)
                 ORDER BY RANDOM()
                 LIMIT {count}"
            );
            fetch_articles(conn, &sql, &[&cat])
        }
        None => {
            let sql = format!(
                "SELECT {ARTICLE_COLUMNS} FROM articles a ORDER BY RANDOM() LIMIT {count}"
            );
            fetch_articles(conn, &sql, &[])
        }
    }
}

/// Categories by article count, largest first.
pub fn list_categories(conn: &Connection, limit: usize) -> Result<Vec<(String, usize)>> {
    let sql = format!(
        "SELECT category, COUNT(*) AS n FROM categories
         GROUP BY category
         ORDER BY n DESC, category
         LIMIT {limit}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub articles: usize,
    pub categories: usize,
    pub category_links: usize,
    pub with_infobox: usize,
    pub avg_length: f64,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let articles: usize = conn.query_row("SELECT COUNT(*) FROM articles", [], |r| r.get(0))?;
    let categories: usize = conn.query_row(
        "SELECT COUNT(DISTINCT category) FROM categories",
        [],
        |r| r.get(0),
    )?;
    let category_links: usize =
        conn.query_row("SELECT COUNT(*) FROM categories", [], |r| r.get(0))?;
    let with_infobox: usize = conn.query_row(
        "SELECT COUNT(*) FROM articles WHERE infobox IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    let avg_length: Option<f64> =
        conn.query_row("SELECT AVG(length) FROM articles", [], |r| r.get(0))?;
    Ok(Stats {
        articles,
        categories,
        category_links,
        with_infobox,
        avg_length: avg_length.unwrap_or(0.0),
    })
}
