//! Core library for importing a MediaWiki site into a LocalWiki-style CMS.
//!
//! The heart of the crate is [`pipeline::process_html`], which turns one
//! rendered MediaWiki page into the target HTML dialect. Around it sit the
//! query API client, the SQLite store the import writes into, and the
//! worker pool that drives whole-site runs.

pub mod api;
pub mod config;
pub mod extract;
pub mod forest;
pub mod images;
pub mod importer;
pub mod passes;
pub mod pipeline;
pub mod pool;
pub mod records;
pub mod store;
pub mod templates;
