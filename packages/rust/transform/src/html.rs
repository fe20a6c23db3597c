//! HTML → Markdown.
//!
//! Content extraction with `scraper`, tables rendered by hand (htmd 0.1 has
//! no table support) and spliced back in after conversion with `htmd`, then
//! the cleanup passes and a YAML frontmatter block.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::instrument;

use indexsync_shared::{IndexSyncError, Result};

use crate::{Artifact, TransformInput, Transformer, cleanup, count_words, first_heading};

/// Content containers tried in order before falling back to `<body>`.
const CONTENT_SELECTORS: &[&str] = &["article", "main", "[role=\"main\"]", ".content", "body"];

const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "iframe", "noscript", "svg", "form",
];

static TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").expect("valid selector"));
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("valid selector"));
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th, td").expect("valid selector"));
static HEADER_CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th").expect("valid selector"));
static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").expect("valid selector"));

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlTransformer;

impl Transformer for HtmlTransformer {
    fn name(&self) -> &str {
        "html"
    }

    fn accepts_content_type(&self, content_type: &str) -> bool {
        matches!(content_type, "text/html" | "application/xhtml+xml")
    }

    fn accepts_extension(&self, extension: &str) -> bool {
        matches!(extension, "html" | "htm" | "xhtml")
    }

    #[instrument(skip_all, fields(source = input.source, path = %input.entry.path))]
    fn transform(&self, input: &TransformInput<'_>) -> Result<Artifact> {
        let html = input.text()?;
        let doc = Html::parse_document(html);

        let content = extract_content(&doc);
        let (content, tables) = render_tables(&content);

        let converter = htmd::HtmlToMarkdown::builder()
            .skip_tags(SKIPPED_TAGS.to_vec())
            .build();
        let mut raw = converter
            .convert(&content)
            .map_err(|e| IndexSyncError::Conversion(format!("{}: htmd failed: {e}", input.entry.path)))?;
        // htmd would collapse the cell padding, so tables go in afterwards.
        for (i, table) in tables.iter().enumerate().rev() {
            raw = raw.replace(&table_placeholder(i), table.trim());
        }

        let body = cleanup::run(&raw);
        let title = first_heading(&body)
            .or_else(|| document_title(&doc))
            .unwrap_or_else(|| input.entry.name.clone());
        let word_count = count_words(&body);

        Ok(Artifact {
            markdown: format!("{}\n{body}", frontmatter(input, &title)),
            title,
            word_count,
        })
    }
}

fn extract_content(doc: &Html) -> String {
    CONTENT_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|selector| doc.select(&selector).next().map(|el| el.inner_html()))
        .unwrap_or_else(|| doc.root_element().inner_html())
}

fn document_title(doc: &Html) -> Option<String> {
    doc.select(&TITLE)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Replace every `<table>` with a placeholder paragraph; returns the pipe
/// tables in placeholder order.
fn render_tables(html: &str) -> (String, Vec<String>) {
    let fragment = Html::parse_fragment(html);
    let mut out = html.to_string();
    let mut tables = Vec::new();
    for table in fragment.select(&TABLE) {
        let marker = format!("<p>{}</p>", table_placeholder(tables.len()));
        out = out.replacen(&table.html(), &marker, 1);
        tables.push(pipe_table(&table));
    }
    (out, tables)
}

fn table_placeholder(index: usize) -> String {
    format!("INDEXSYNCTABLE{index}END")
}

fn pipe_table(table: &ElementRef<'_>) -> String {
    let mut header: Option<Vec<String>> = None;
    let mut rows: Vec<Vec<String>> = Vec::new();

    for tr in table.select(&ROW) {
        let cells: Vec<String> = tr
            .select(&CELL)
            .map(|c| c.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" "))
            .map(|c| c.replace('|', "\\|"))
            .collect();
        if cells.is_empty() {
            continue;
        }
        if header.is_none() && rows.is_empty() && tr.select(&HEADER_CELL).next().is_some() {
            header = Some(cells);
        } else {
            rows.push(cells);
        }
    }

    let width = header
        .iter()
        .chain(rows.iter())
        .map(Vec::len)
        .max()
        .unwrap_or(0);
    if width == 0 {
        return String::new();
    }

    let header = header.unwrap_or_else(|| vec![String::new(); width]);
    let line = |cells: &[String]| {
        let mut padded: Vec<&str> = cells.iter().map(String::as_str).collect();
        padded.resize(width, "");
        format!("| {} |\n", padded.join(" | "))
    };

    let mut md = String::from("\n\n");
    md.push_str(&line(&header));
    md.push_str(&format!("|{}\n", " --- |".repeat(width)));
    for row in &rows {
        md.push_str(&line(row));
    }
    md.push('\n');
    md
}

fn frontmatter(input: &TransformInput<'_>, title: &str) -> String {
    let mut fm = String::from("---\n");
    fm.push_str(&format!("title: \"{}\"\n", yaml_escape(title)));
    fm.push_str(&format!("source: \"{}\"\n", yaml_escape(input.source)));
    fm.push_str(&format!("item_id: \"{}\"\n", yaml_escape(&input.entry.id)));
    fm.push_str(&format!("path: \"{}\"\n", yaml_escape(&input.entry.path)));
    if let Some(modified) = input.entry.fingerprint.modified_at() {
        fm.push_str(&format!("modified_at: \"{}\"\n", modified.to_rfc3339()));
    }
    fm.push_str("---\n");
    fm
}

fn yaml_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', " ")
}
