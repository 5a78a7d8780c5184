//! # bulksym - bulk object-file symbol & string-literal analysis
//!
//! This library powers binary-size tooling: it discovers which object files
//! or archive members contribute each linked symbol name, which names fold
//! onto a single final address (identical code folding), and the exact byte
//! range every object-file string literal occupies inside the final binary's
//! merged string sections.
//!
//! ## Background
//!
//! A linker map names only one object path per symbol, yet inline functions
//! and templates are defined in many translation units, and merge-string
//! sections deduplicate literals across them. Recovering per-path
//! attribution therefore means running the symbol-listing tool over every
//! object file and archive, and re-locating literal bytes inside the final
//! binary by search, not by metadata.
//!
//! The heavy lifting fans out across a bounded worker pool; the aggregate
//! maps live in a single [`BulkAnalyzer`] that can also be driven in a
//! delegate process over a framed stdin/stdout protocol ([`ipc`]) so the
//! caller's control flow never blocks on batch work.
//!
//! ## Usage
//!
//! ```no_run
//! use bulksym::{AnalyzerOptions, BulkAnalyzer};
//!
//! let mut analyzer = BulkAnalyzer::new(AnalyzerOptions::new()).unwrap();
//! analyzer.analyze_paths(&["obj/foo.o".into(), "obj/libbar.a".into()]).unwrap();
//! analyzer.sort_paths().unwrap();
//! for (name, paths) in analyzer.symbol_names() {
//!     println!("{name}: {paths:?}");
//! }
//! ```

mod analyzer;
pub mod ar;
mod common;
mod error;
pub mod ipc;
pub mod nm;
mod pool;
pub mod sections;
pub mod strings;
mod supervisor;
mod tool;

pub use analyzer::BulkAnalyzer;
pub use common::{
    member_path, split_member_path, AddressRange, AnalyzerOptions, StringPosition,
    StringPositions, SymbolNames, DEFAULT_BATCH_SIZE,
};
pub use error::{Error, Result};
pub use ipc::Coordinator;
pub use supervisor::Supervisor;
pub use tool::ToolRunner;
