// SPDX-License-Identifier: MPL-2.0
//! # stubscan
//!
//! Scans MediaWiki revision-history XML dumps for the lifecycle of a stub template (e.g. `{{Beginnetje}}`, the Dutch Wikipedia stub marker) and emits one label record per detected transition.
//!
//! ## Overview
//!
//! The appearance of a stub template in an article's history is a weak signal that the article was of low quality at that revision; its removal is a weak signal that quality improved. `stubscan` walks every page of one or more history dumps, runs a small per-page state machine over the ordered revisions, and reports:
//!
//! - `{"rev_id": ..., "label": "E"}` for the revision where the template first appears, and
//! - `{"rev_id": ..., "label": "D"}` for the first later revision where it is gone again.
//!
//! A page that never carries the template produces no records. Scanning stops after the first removal, so a template reintroduced later (e.g. by a revert) is not reported a second time. The resulting record stream feeds article-quality labeling pipelines that want per-revision weak labels at dump scale.
//!
//! **Key Features:**
//!
//! - **Streaming**: dumps are parsed page by page, memory stays flat regardless of dump size.
//! - **Parallel Processing**: independent dumps are fanned out over a worker pool; pages share no state, so workers need no locks.
//! - **Modular Design**: the parser, the detector and the scheduler can be used independently.
//!
//! ## Basic Usage
//!
//! Scan a single page pulled from a dump:
//!
//! ```rust
//! use std::io::Cursor;
//! use stubscan::detector::{scan_page, MarkerMatcher};
//! use stubscan::dump_parser::DumpParser;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let xml = r#"<mediawiki version="0.11">
//!       <siteinfo><dbname>nlwiki</dbname><namespaces><namespace key="0" /></namespaces></siteinfo>
//!       <page>
//!         <title>Aardbei</title>
//!         <ns>0</ns>
//!         <id>17</id>
//!         <revision><id>100</id><timestamp>2004-01-01T12:00:00Z</timestamp><text>{{beginnetje}}</text></revision>
//!         <revision><id>101</id><timestamp>2004-02-01T12:00:00Z</timestamp><text>a real article</text></revision>
//!       </page>
//!     </mediawiki>"#;
//!
//!     let matcher = MarkerMatcher::new("beginnetje")?;
//!     let mut parser = DumpParser::new(Cursor::new(xml))?;
//!
//!     while let Some(page) = parser.parse_page()? {
//!         for event in scan_page(&matcher, &page) {
//!             println!("{} {}", event.rev_id, event.label.as_str());
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Processing Whole Dumps in Parallel
//!
//! The [`scheduler`] module distributes dump files over a fixed-size worker pool and merges the per-page events into a single stream. Each worker owns its dump end-to-end (open, decompress, parse, filter, scan), so the merged stream has no cross-page ordering guarantees — consumers must treat the order as nondeterministic.
//!
//! ```rust,no_run
//! use std::num::NonZeroUsize;
//! use std::path::PathBuf;
//! use stubscan::detector::MarkerMatcher;
//! use stubscan::scheduler::{self, ScanOptions};
//! use stubscan::sink::LabelSink;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dumps = vec![
//!         PathBuf::from("nlwiki-20240901-pages-meta-history1.xml.zst"),
//!         PathBuf::from("nlwiki-20240901-pages-meta-history2.xml.zst"),
//!     ];
//!
//!     let mut options = ScanOptions::new(MarkerMatcher::new("beginnetje")?);
//!     options.namespaces = Some([0].into_iter().collect());
//!     options.workers = NonZeroUsize::new(8).unwrap();
//!
//!     let mut sink = LabelSink::new(std::io::stdout().lock());
//!     scheduler::run(&dumps, &options, |event| sink.write_event(&event))?;
//!     sink.finish()?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Modules and API
//!
//! ### `dump_parser` Module
//!
//! **Purpose**: Parses MediaWiki XML dumps into [`dump_parser::Page`] values, one at a time.
//!
//! - Create a [`dump_parser::DumpParser`] from any `BufRead`.
//! - Use `parse_page()` to retrieve pages one by one; revisions come oldest first.
//! - Access dump metadata (database name, namespace table) with `site_info()`.
//! - The [`dump_parser::PageSource`] trait is the seam the scan pipeline consumes; anything that can produce pages (another dump format, test fixtures) can stand in for the XML parser.
//!
//! ### `detector` Module
//!
//! **Purpose**: The per-page detection core.
//!
//! - [`detector::MarkerMatcher`] decides whether a revision's text contains the template opening — a deliberate substring-level approximation (see the type docs for what it does and does not match).
//! - [`detector::ScanState`] is the explicit absent → present → done state machine.
//! - [`detector::scan_page`] / [`detector::scan_revisions`] adapt one page's revisions into a lazy iterator of [`detector::LabelEvent`]s.
//!
//! ### `scheduler` Module
//!
//! **Purpose**: Fan-out over many dumps, merge into one event stream.
//!
//! - [`scheduler::ScanOptions`] carries the shared read-only configuration: matcher, namespace allow-set, worker count, failure policy.
//! - [`scheduler::run`] blocks until all dumps are processed and returns aggregate counts.
//! - Whether an unreadable dump aborts the run or is skipped with a diagnostic is a policy choice ([`scheduler::ArchiveFailure`]), not hardcoded.
//!
//! ### `sink` Module
//!
//! **Purpose**: Line-delimited JSON output, one self-contained record per event.
//!
//! ## Logging and Error Handling
//!
//! - Uses the `tracing` crate for warnings and diagnostics; the CLI binary installs a `tracing-subscriber` writing to stderr so stdout stays a clean record stream.
//! - The parser is designed to recover from format damage where possible (unknown tags, unbalanced end tags, revisions with missing fields are logged and skipped). Enable the `strict` feature to make such damage abort the parse instead.
//!
//! ## Limitations
//!
//! - **Substring matching**: template occurrences inside comments or nowiki blocks still count, and unusual spellings not covered by the pattern are missed. This is an accepted trade-off for scan speed at dump scale.
//! - **Single episode per page**: reverts that reintroduce the template after a genuine removal are not detected (deferred; would need revert detection à la mwreverts).
//! - **XML Format Compatibility**: tested against the Wikimedia dump format version 0.11. Other versions may have variations that cause parsing issues.

pub mod detector;
pub mod dump_parser;
pub mod scheduler;
pub mod sink;
