//! Document reader: raw bytes → text blocks and cell grids.
//!
//! The reader knows nothing about meal reports. It only recovers structure:
//! which strings sit on the same row, which rows belong to the same table.
//! Interpreting headers and columns is the layout parser's job.
//!
//! ```text
//! RawDocument ──▶ pdf::read_pdf   (pdfium text runs → lines → aligned tables)
//!             └─▶ html::read_html (scraper tag tree → table rows, headings)
//! ```

pub mod html;
pub mod pdf;

use crate::error::DocumentError;
use crate::model::{RawDocument, SourceType};
use crate::vocabulary::Vocabulary;
use std::path::Path;
use tracing::debug;

/// One unit of extracted structure, in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Free text outside any table (titles, headings, captions).
    Text(String),
    /// A table-like grid of cells.
    Table(CellGrid),
}

/// Rows of cell text with row/column adjacency preserved. Rows may have
/// different lengths; missing trailing cells are simply absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellGrid {
    /// 1-indexed page the grid came from (PDF only).
    pub page: Option<usize>,
    pub rows: Vec<Vec<String>>,
}

impl CellGrid {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Self { page: None, rows }
    }

    pub fn on_page(mut self, page: usize) -> Self {
        self.page = Some(page);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|r| r.iter().all(|c| c.trim().is_empty()))
    }
}

/// Extract fragments from a document using the reader for its source type.
pub fn read_document(
    doc: &RawDocument,
    vocabulary: &Vocabulary,
    pdfium_library_path: Option<&Path>,
) -> Result<Vec<Fragment>, DocumentError> {
    let fragments = match doc.source_type {
        SourceType::Pdf => pdf::read_pdf(&doc.id, &doc.content, pdfium_library_path)?,
        SourceType::Html => {
            let markup = String::from_utf8_lossy(&doc.content);
            html::read_html(&doc.id, &markup, vocabulary.table_selector())?
        }
    };
    debug!(
        document = %doc.id,
        fragments = fragments.len(),
        tables = fragments.iter().filter(|f| matches!(f, Fragment::Table(_))).count(),
        "document read"
    );
    Ok(fragments)
}

/// Collapse every whitespace run to a single space and trim.
pub(crate) fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  Lane\n\t ES  "), "Lane ES");
        assert_eq!(collapse_whitespace(""), "");
    }

    #[test]
    fn empty_grid_detection() {
        assert!(CellGrid::new(vec![vec![" ".into()], vec![]]).is_empty());
        assert!(!CellGrid::new(vec![vec!["x".into()]]).is_empty());
    }

    #[test]
    fn html_documents_dispatch_to_html_reader() {
        let doc = RawDocument::html(
            "r.html",
            "<table><tr><th>School</th><th>Served</th></tr><tr><td>Lane ES</td><td>12</td></tr></table>",
        );
        let fragments = read_document(&doc, &Vocabulary::default(), None).unwrap();
        assert_eq!(fragments.len(), 1);
        match &fragments[0] {
            Fragment::Table(grid) => assert_eq!(grid.rows[1], vec!["Lane ES", "12"]),
            other => panic!("expected table, got {other:?}"),
        }
    }
}
