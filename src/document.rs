//! Document collaborator used to build "interpret these pages" turns.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Separator between pages in a plain-text document
pub const PAGE_BREAK: char = '\u{0C}';

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("invalid page range '{0}', expected e.g. 01-10")]
    InvalidRange(String),

    #[error("page {page} is outside 1..={pages}")]
    PageOutOfRange { page: u32, pages: u32 },

    #[error("failed to read document: {0}")]
    Io(#[from] std::io::Error),
}

/// Inclusive, 1-based page range such as `01-10`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl FromStr for PageRange {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DocumentError::InvalidRange(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start: u32 = start.trim().parse().map_err(|_| invalid())?;
        let end: u32 = end.trim().parse().map_err(|_| invalid())?;
        if start == 0 || end < start {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.start, self.end)
    }
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn page_count(&self) -> u32;

    /// Text of the pages in `range`, one page per line. Pages past the end
    /// of the document are skipped.
    async fn extract_text(&self, range: PageRange) -> Result<String, DocumentError>;

    /// Move the viewer to `page` (1-based)
    async fn jump_to_page(&self, page: u32) -> Result<(), DocumentError>;
}

/// A document held as plain-text pages
#[derive(Debug, Default)]
pub struct TextDocument {
    pages: Vec<String>,
    current: AtomicU32,
}

impl TextDocument {
    pub fn from_pages(pages: Vec<String>) -> Self {
        Self {
            pages,
            current: AtomicU32::new(1),
        }
    }

    /// Split `text` into pages on form feeds
    pub fn from_text(text: &str) -> Self {
        Self::from_pages(text.split(PAGE_BREAK).map(str::to_string).collect())
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(Self::from_text(&text))
    }

    pub fn current_page(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DocumentSource for TextDocument {
    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    async fn extract_text(&self, range: PageRange) -> Result<String, DocumentError> {
        let mut text = String::new();
        // Pages are 1-based; a hand-built range starting at 0 reads from page 1
        for page in range.start.max(1)..=range.end {
            let Some(content) = self.pages.get((page - 1) as usize) else {
                break;
            };
            text.push_str(content);
            text.push('\n');
        }
        Ok(text.trim().to_string())
    }

    async fn jump_to_page(&self, page: u32) -> Result<(), DocumentError> {
        let pages = self.page_count().max(1);
        if page == 0 || page > pages {
            tracing::warn!("Page {} is out of range (1-{})", page, pages);
            return Err(DocumentError::PageOutOfRange { page, pages });
        }
        self.current.store(page, Ordering::Relaxed);
        Ok(())
    }
}
