//! Turn fetched items into publishable Markdown artifacts.
//!
//! This crate provides:
//! - [`Transformer`]: one conversion per family of content types
//! - [`TransformRegistry`]: picks the transformer for an item, by content type then extension
//! - [`HtmlTransformer`], [`MarkdownTransformer`], [`TextTransformer`]: built-ins

mod cleanup;
mod html;
mod plain;

use tracing::debug;

use indexsync_shared::{IndexSyncError, ManifestEntry, Result};

pub use html::HtmlTransformer;
pub use plain::{MarkdownTransformer, TextTransformer};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One fetched item handed to a transformer.
#[derive(Debug, Clone, Copy)]
pub struct TransformInput<'a> {
    /// Source the item belongs to.
    pub source: &'a str,
    pub entry: &'a ManifestEntry,
    pub bytes: &'a [u8],
}

impl TransformInput<'_> {
    /// Item body as UTF-8 text.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(self.bytes).map_err(|e| {
            IndexSyncError::Conversion(format!("{} is not valid UTF-8: {e}", self.entry.path))
        })
    }
}

/// A publishable document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub markdown: String,
    pub title: String,
    pub word_count: usize,
}

/// Conversion for one family of content types.
pub trait Transformer: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether this transformer handles the (normalized) content type.
    fn accepts_content_type(&self, content_type: &str) -> bool;

    /// Whether this transformer handles a file extension (lowercase, no dot).
    fn accepts_extension(&self, extension: &str) -> bool;

    fn transform(&self, input: &TransformInput<'_>) -> Result<Artifact>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registered transformers in priority order.
pub struct TransformRegistry {
    transformers: Vec<Box<dyn Transformer>>,
}

impl TransformRegistry {
    /// Registry with the built-in transformers.
    pub fn new() -> Self {
        Self {
            transformers: vec![
                Box::new(HtmlTransformer),
                Box::new(MarkdownTransformer),
                Box::new(TextTransformer),
            ],
        }
    }

    pub fn empty() -> Self {
        Self {
            transformers: Vec::new(),
        }
    }

    pub fn register(&mut self, transformer: Box<dyn Transformer>) {
        self.transformers.push(transformer);
    }

    /// Transformer for an item, or `None` when the item is unsupported.
    ///
    /// The content type decides; the path extension is consulted only when
    /// the content type is generic (`application/octet-stream`) or unknown.
    pub fn detect(&self, entry: &ManifestEntry) -> Option<&dyn Transformer> {
        let content_type = normalize_content_type(&entry.content_type);
        if let Some(t) = self
            .transformers
            .iter()
            .find(|t| t.accepts_content_type(&content_type))
        {
            return Some(t.as_ref());
        }
        if !content_type.is_empty() && content_type != "application/octet-stream" {
            return None;
        }
        let extension = entry
            .path
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())?;
        self.transformers
            .iter()
            .find(|t| t.accepts_extension(&extension))
            .map(|t| t.as_ref())
    }

    pub fn is_supported(&self, entry: &ManifestEntry) -> bool {
        self.detect(entry).is_some()
    }

    /// Run the matching transformer. `Ok(None)` means unsupported.
    pub fn transform(&self, input: &TransformInput<'_>) -> Result<Option<Artifact>> {
        let Some(transformer) = self.detect(input.entry) else {
            debug!(path = %input.entry.path, content_type = %input.entry.content_type, "no transformer");
            return Ok(None);
        };
        let artifact = transformer.transform(input)?;
        debug!(
            path = %input.entry.path,
            transformer = transformer.name(),
            words = artifact.word_count,
            "item transformed"
        );
        Ok(Some(artifact))
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `Text/HTML; charset=utf-8` → `text/html`.
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whitespace-separated words outside fenced code blocks.
pub(crate) fn count_words(md: &str) -> usize {
    let mut in_fence = false;
    let mut words = 0;
    for line in md.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            words += line
                .split_whitespace()
                .filter(|w| !w.chars().all(|c| c == '#'))
                .count();
        }
    }
    words
}

/// First `# Heading` line, if any.
pub(crate) fn first_heading(md: &str) -> Option<String> {
    md.lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}
