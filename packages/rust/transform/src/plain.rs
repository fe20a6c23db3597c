//! Pass-through transformers for Markdown and plain text.

use indexsync_shared::Result;

use crate::{Artifact, TransformInput, Transformer, count_words, first_heading};

/// Markdown is published as written (line endings normalized).
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownTransformer;

impl Transformer for MarkdownTransformer {
    fn name(&self) -> &str {
        "markdown"
    }

    fn accepts_content_type(&self, content_type: &str) -> bool {
        matches!(content_type, "text/markdown" | "text/x-markdown")
    }

    fn accepts_extension(&self, extension: &str) -> bool {
        matches!(extension, "md" | "markdown" | "mdx")
    }

    fn transform(&self, input: &TransformInput<'_>) -> Result<Artifact> {
        let markdown = normalize(input.text()?);
        Ok(Artifact {
            title: first_heading(&markdown).unwrap_or_else(|| input.entry.name.clone()),
            word_count: count_words(&markdown),
            markdown,
        })
    }
}

/// Plain text is published verbatim; the item name is the title.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextTransformer;

impl Transformer for TextTransformer {
    fn name(&self) -> &str {
        "text"
    }

    fn accepts_content_type(&self, content_type: &str) -> bool {
        content_type == "text/plain"
    }

    fn accepts_extension(&self, extension: &str) -> bool {
        extension == "txt"
    }

    fn transform(&self, input: &TransformInput<'_>) -> Result<Artifact> {
        let markdown = normalize(input.text()?);
        Ok(Artifact {
            title: input.entry.name.clone(),
            word_count: markdown.split_whitespace().count(),
            markdown,
        })
    }
}

/// Strip a BOM and convert CRLF line endings.
fn normalize(text: &str) -> String {
    text.trim_start_matches('\u{feff}').replace("\r\n", "\n")
}
