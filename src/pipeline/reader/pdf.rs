//! PDF reader: positioned text runs → lines → column-aligned tables.
//!
//! PDFs carry no table structure, only glyph runs with coordinates. We
//! rebuild it in two passes, both pure so they can be tested without pdfium:
//!
//! 1. [`group_lines`] clusters runs whose baselines lie within
//!    [`LINE_TOLERANCE`] into lines, left to right.
//! 2. [`segment_page`] walks the lines top to bottom. Consecutive lines
//!    whose cells line up (left *or* right edge within [`COLUMN_TOLERANCE`];
//!    numbers are usually right-aligned) form one table. A line with a single
//!    cell ends the table and is kept as free text.
//!
//! Tables never continue across pages; the layout parser stitches split
//! tables back together using the repeated or inherited header.

use super::{collapse_whitespace, CellGrid, Fragment};
use crate::error::DocumentError;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Max vertical distance (points) between runs on the same line.
pub const LINE_TOLERANCE: f32 = 2.5;

/// Max horizontal distance (points) between an edge and a column anchor.
pub const COLUMN_TOLERANCE: f32 = 6.0;

/// Runs closer than this (points) are words of the same cell.
const WORD_GAP: f32 = 3.0;

/// A piece of text with its position on the page (PDF user space, y up).
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub page: usize,
    pub x: f32,
    pub x_end: f32,
    pub y: f32,
    pub text: String,
}

impl TextRun {
    pub fn new(page: usize, x: f32, x_end: f32, y: f32, text: impl Into<String>) -> Self {
        Self {
            page,
            x,
            x_end,
            y,
            text: text.into(),
        }
    }

    fn center(&self) -> f32 {
        (self.x + self.x_end) / 2.0
    }
}

// ── pdfium ───────────────────────────────────────────────────────────────────

/// Read every page of a PDF into fragments.
///
/// Blocking: call from `spawn_blocking`.
pub fn read_pdf(
    document_id: &str,
    bytes: &[u8],
    library_path: Option<&Path>,
) -> Result<Vec<Fragment>, DocumentError> {
    let pdfium = bind_pdfium(library_path).map_err(|detail| DocumentError::PdfiumUnavailable {
        document: document_id.to_string(),
        detail,
    })?;

    let unreadable = |detail: String| DocumentError::Unreadable {
        document: document_id.to_string(),
        format: "pdf".into(),
        detail,
    };

    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| unreadable(format!("{e:?}")))?;

    let mut fragments = Vec::new();
    for (idx, page) in document.pages().iter().enumerate() {
        let page_no = idx + 1;
        let text = page
            .text()
            .map_err(|e| unreadable(format!("page {page_no}: {e:?}")))?;
        let runs: Vec<TextRun> = text
            .segments()
            .iter()
            .filter_map(|segment| {
                let content = segment.text();
                if content.trim().is_empty() {
                    return None;
                }
                let bounds = segment.bounds();
                Some(TextRun::new(
                    page_no,
                    bounds.left().value,
                    bounds.right().value,
                    bounds.bottom().value,
                    content,
                ))
            })
            .collect();
        debug!(document = document_id, page = page_no, runs = runs.len(), "page text read");
        fragments.extend(segment_page(page_no, group_lines(runs)));
    }
    Ok(fragments)
}

/// Bind pdfium from an explicit path, `PDFIUM_LIB_PATH`, or the system
/// loader path, in that order. A directory is resolved to the platform
/// library name inside it.
fn bind_pdfium(library_path: Option<&Path>) -> Result<Pdfium, String> {
    let configured = library_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from));

    let bindings = match configured {
        Some(path) => {
            let library: PathBuf = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&path).into()
            } else {
                path
            };
            Pdfium::bind_to_library(&library)
                .map_err(|e| format!("{}: {e:?}", library.display()))?
        }
        None => Pdfium::bind_to_system_library().map_err(|e| format!("{e:?}"))?,
    };
    Ok(Pdfium::new(bindings))
}

// ── Geometry ─────────────────────────────────────────────────────────────────

/// Cluster runs into lines, top of page first, each line sorted left to
/// right. Adjacent runs closer than a word gap are joined into one cell.
pub fn group_lines(mut runs: Vec<TextRun>) -> Vec<Vec<TextRun>> {
    runs.sort_by(|a, b| b.y.total_cmp(&a.y).then(a.x.total_cmp(&b.x)));

    let mut lines: Vec<Vec<TextRun>> = Vec::new();
    let mut baseline = f32::NAN;
    for run in runs {
        match lines.last_mut() {
            Some(line) if (baseline - run.y).abs() <= LINE_TOLERANCE => line.push(run),
            _ => {
                baseline = run.y;
                lines.push(vec![run]);
            }
        }
    }

    lines
        .into_iter()
        .map(|mut line| {
            line.sort_by(|a, b| a.x.total_cmp(&b.x));
            join_words(line)
        })
        .collect()
}

fn join_words(line: Vec<TextRun>) -> Vec<TextRun> {
    let mut cells: Vec<TextRun> = Vec::with_capacity(line.len());
    for run in line {
        match cells.last_mut() {
            Some(prev) if run.x - prev.x_end <= WORD_GAP => {
                prev.text = collapse_whitespace(&format!("{} {}", prev.text, run.text));
                prev.x_end = prev.x_end.max(run.x_end);
            }
            _ => cells.push(TextRun {
                text: collapse_whitespace(&run.text),
                ..run
            }),
        }
    }
    cells
}

/// A column position: left and right edge of the cell that introduced it.
type Anchor = (f32, f32);

fn matches_anchor(run: &TextRun, anchor: &Anchor) -> bool {
    (run.x - anchor.0).abs() <= COLUMN_TOLERANCE || (run.x_end - anchor.1).abs() <= COLUMN_TOLERANCE
}

/// Split a page's lines into tables and free text.
pub fn segment_page(page: usize, lines: Vec<Vec<TextRun>>) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    let mut anchors: Vec<Anchor> = Vec::new();
    let mut block: Vec<Vec<TextRun>> = Vec::new();

    for line in lines {
        if line.len() < 2 {
            flush_table(page, &mut block, &mut anchors, &mut fragments);
            let text = collapse_whitespace(
                &line.iter().map(|r| r.text.as_str()).collect::<Vec<_>>().join(" "),
            );
            if !text.is_empty() {
                fragments.push(Fragment::Text(text));
            }
            continue;
        }

        if !block.is_empty() {
            let all_cells_match = line.iter().all(|r| anchors.iter().any(|a| matches_anchor(r, a)));
            let all_anchors_hit = anchors.iter().all(|a| line.iter().any(|r| matches_anchor(r, a)));
            if all_cells_match || all_anchors_hit {
                for run in &line {
                    if !anchors.iter().any(|a| matches_anchor(run, a)) {
                        anchors.push((run.x, run.x_end));
                    }
                }
                block.push(line);
                continue;
            }
            flush_table(page, &mut block, &mut anchors, &mut fragments);
        }

        anchors = line.iter().map(|r| (r.x, r.x_end)).collect();
        block.push(line);
    }
    flush_table(page, &mut block, &mut anchors, &mut fragments);
    fragments
}

fn flush_table(
    page: usize,
    block: &mut Vec<Vec<TextRun>>,
    anchors: &mut Vec<Anchor>,
    out: &mut Vec<Fragment>,
) {
    if block.is_empty() {
        return;
    }
    anchors.sort_by(|a, b| a.0.total_cmp(&b.0));

    let rows = block
        .drain(..)
        .map(|line| {
            let mut row = vec![String::new(); anchors.len()];
            for run in line {
                let col = column_for(&run, anchors);
                if row[col].is_empty() {
                    row[col] = run.text;
                } else {
                    row[col] = format!("{} {}", row[col], run.text);
                }
            }
            while row.last().is_some_and(|c| c.is_empty()) {
                row.pop();
            }
            row
        })
        .collect();
    anchors.clear();

    let grid = CellGrid::new(rows).on_page(page);
    if !grid.is_empty() {
        out.push(Fragment::Table(grid));
    }
}

/// Matching anchor if any, else the anchor whose centre is nearest.
fn column_for(run: &TextRun, anchors: &[Anchor]) -> usize {
    if let Some(i) = anchors.iter().position(|a| matches_anchor(run, a)) {
        return i;
    }
    let center = run.center();
    anchors
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            let da = ((a.0 + a.1) / 2.0 - center).abs();
            let db = ((b.0 + b.1) / 2.0 - center).abs();
            da.total_cmp(&db)
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}
