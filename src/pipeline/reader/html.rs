//! HTML reader: walk the tag tree and pull out tables and headings.
//!
//! Production reports are exported from a web reporting tool, so the markup
//! is noisy: layout tables, inline `<style>` and `<script>`, spans inside
//! cells. Every element matching the table selector becomes its own grid;
//! rows belong to the *nearest* enclosing `<table>`, so a table nested in a
//! cell is emitted separately instead of being flattened into its parent.

use super::{collapse_whitespace, CellGrid, Fragment};
use crate::error::DocumentError;
use scraper::{ElementRef, Html, Selector};

/// Elements whose text is kept as free-text context.
const TEXT_ELEMENTS: &[&str] = &["title", "h1", "h2", "h3", "h4", "h5", "h6", "p", "caption"];

/// Elements whose content is never visible text.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Upper bound on `colspan` so a malformed attribute cannot explode a row.
const MAX_COLSPAN: usize = 64;

/// Extract fragments from HTML markup in document order.
pub fn read_html(
    document_id: &str,
    markup: &str,
    table_selector: &str,
) -> Result<Vec<Fragment>, DocumentError> {
    let tables = Selector::parse(table_selector).map_err(|e| DocumentError::InvalidSelector {
        document: document_id.to_string(),
        selector: table_selector.to_string(),
        detail: format!("{e:?}"),
    })?;
    let html = Html::parse_document(markup);

    let mut fragments = Vec::new();
    for node in html.root_element().descendants() {
        let Some(el) = ElementRef::wrap(node) else {
            continue;
        };
        let name = el.value().name();
        if tables.matches(&el) {
            let grid = read_table(el);
            if !grid.is_empty() {
                fragments.push(Fragment::Table(grid));
            }
        } else if TEXT_ELEMENTS.contains(&name) {
            // Text inside a selected table is already part of its cells.
            let in_table = name != "caption"
                && el
                    .ancestors()
                    .filter_map(ElementRef::wrap)
                    .any(|a| tables.matches(&a));
            let hidden = el.ancestors().filter_map(ElementRef::wrap).any(|a| {
                HIDDEN_ELEMENTS.contains(&a.value().name())
            });
            if !in_table && !hidden {
                let text = visible_text(el);
                if !text.is_empty() {
                    fragments.push(Fragment::Text(text));
                }
            }
        }
    }
    Ok(fragments)
}

/// Collect the rows that belong directly to `table`.
fn read_table(table: ElementRef<'_>) -> CellGrid {
    let mut rows = Vec::new();
    for node in table.descendants() {
        let Some(tr) = ElementRef::wrap(node) else {
            continue;
        };
        if tr.value().name() != "tr" || nearest_table(tr) != Some(table) {
            continue;
        }
        let mut cells = Vec::new();
        for cell in tr.children().filter_map(ElementRef::wrap) {
            if !matches!(cell.value().name(), "td" | "th") {
                continue;
            }
            let span = cell
                .value()
                .attr("colspan")
                .and_then(|s| s.trim().parse::<usize>().ok())
                .unwrap_or(1)
                .clamp(1, MAX_COLSPAN);
            cells.push(visible_text(cell));
            cells.extend(std::iter::repeat_n(String::new(), span - 1));
        }
        if !cells.is_empty() {
            rows.push(cells);
        }
    }
    CellGrid::new(rows)
}

fn nearest_table(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().name() == "table")
}

/// Text of an element, skipping script/style content and nested tables,
/// whitespace-collapsed.
fn visible_text(el: ElementRef<'_>) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in el.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .take_while(|a| a.id() != el.id())
            .filter_map(ElementRef::wrap)
            .any(|a| {
                let name = a.value().name();
                HIDDEN_ELEMENTS.contains(&name) || name == "table"
            });
        if !hidden {
            parts.push(&**text);
        }
    }
    collapse_whitespace(&parts.join(" "))
}
