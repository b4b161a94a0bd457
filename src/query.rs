use anyhow::Result;
use rusqlite::Connection;

use crate::db::{self, ArticleRow};

pub fn print_stats(conn: &Connection) -> Result<()> {
    let s = db::get_stats(conn)?;
    println!("Articles:        {}", s.articles);
    println!("Categories:      {}", s.categories);
    println!("Category links:  {}", s.category_links);
    println!("With infobox:    {}", s.with_infobox);
    println!("Avg length:      {:.0} bytes", s.avg_length);
    Ok(())
}

pub fn print_categories(conn: &Connection, limit: usize) -> Result<()> {
    let rows = db::list_categories(conn, limit)?;
    if rows.is_empty() {
        println!("No categories found.");
        return Ok(());
    }
    println!("{:>3} | {:<48} | {:>8}", "#", "Category", "Articles");
    println!("{}", "-".repeat(66));
    for (i, (category, count)) in rows.iter().enumerate() {
        println!("{:>3} | {:<48} | {:>8}", i + 1, truncate(category, 48), count);
    }
    Ok(())
}

pub fn print_search(conn: &Connection, keyword: &str, limit: usize) -> Result<()> {
    let rows = db::search(conn, keyword, limit)?;
    print_table(&rows, &format!("No articles matching {keyword:?}."));
    Ok(())
}

pub fn print_category(conn: &Connection, category: &str, limit: usize) -> Result<()> {
    let rows = db::fetch_by_category(conn, category, limit)?;
    print_table(&rows, &format!("No articles in category {category:?}."));
    Ok(())
}

pub fn print_random(conn: &Connection, count: usize, category: Option<&str>) -> Result<()> {
    let rows = db::fetch_random(conn, count, category)?;
    if rows.is_empty() {
        println!("No articles found.");
    }
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            println!("\n{}\n", "=".repeat(60));
        }
        print_article(row, 600);
    }
    Ok(())
}

pub fn print_title(conn: &Connection, title: &str) -> Result<()> {
    match db::fetch_by_title(conn, title)? {
        Some(row) => print_article(&row, usize::MAX),
        None => println!("No article titled {title:?}."),
    }
    Ok(())
}

fn print_table(rows: &[ArticleRow], empty: &str) {
    if rows.is_empty() {
        println!("{empty}");
        return;
    }
    println!("{:>3} | {:<36} | {:>7} | {:<40}", "#", "Title", "Length", "Summary");
    println!("{}", "-".repeat(96));
    for (i, r) in rows.iter().enumerate() {
        println!(
            "{:>3} | {:<36} | {:>7} | {:<40}",
            i + 1,
            truncate(&r.title, 36),
            r.length,
            truncate(&r.summary.replace('\n', " "), 40)
        );
    }
    println!("\n{} articles", rows.len());
}

fn print_article(row: &ArticleRow, body_chars: usize) {
    println!("{} (#{})", row.title, row.id);
    if !row.categories.is_empty() {
        println!("Categories: {}", row.categories.join(", "));
    }
    if let Some(infobox) = &row.infobox {
        println!("\n--- Infobox ({} fields) ---", infobox.len());
        for (key, value) in infobox.iter() {
            println!("  {}: {}", key, truncate(&value.replace('\n', " "), 60));
        }
    }
    println!("\n{}", row.summary);
    if row.body.len() > row.summary.len() {
        println!("\n--- Body ({} bytes raw) ---", row.length);
        println!("{}", truncate(&row.body, body_chars));
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}
