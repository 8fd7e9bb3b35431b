//! Pipeline stages from report files to the canonical dataset.
//!
//! Each submodule implements exactly one transformation step and can be
//! tested on its own.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ reader ──▶ layout ──▶ normalize ──▶ merge
//! (files)   (pdf/html)  (rows)     (records)     (dataset)
//! ```
//!
//! 1. [`input`]: enumerate the input path into [`crate::model::RawDocument`]s
//!    with source type and file-name hints
//! 2. [`reader`]: turn bytes into text blocks and cell grids; PDF reading
//!    runs in `spawn_blocking` because pdfium is synchronous
//! 3. [`layout`]: find header rows, drop totals and page footers, repair
//!    numeric cells and emit labelled rows plus document context
//! 4. [`normalize`]: map labels onto canonical fields, resolve schools and
//!    fill missing values from context and hints
//! 5. [`merge`]: reconcile overlapping sources per record key into the
//!    immutable [`merge::Dataset`]

pub mod input;
pub mod layout;
pub mod merge;
pub mod normalize;
pub mod reader;
