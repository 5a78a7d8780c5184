//! Core types for bulk symbol/string analysis.
//!
//! This module defines the fundamental data structures shared by the
//! orchestrator, the worker jobs, and the IPC layer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// One `(address, size)` span of the final linked binary.
///
/// The address doubles as the file offset at which the binary is read, so
/// resolved positions come back in the same coordinate space the caller
/// supplied the range in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct AddressRange {
    /// Start of the range inside the final binary
    pub address: u64,
    /// Length of the range in bytes
    pub size: u64,
}

impl AddressRange {
    pub fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }
}

/// Resolved location of one string literal inside the final binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StringPosition {
    /// Absolute position inside the final binary (range base + match offset)
    pub address: u64,
    /// Length of the literal, including its NUL terminator when present
    pub size: u64,
}

/// Finalized symbol name -> sorted, duplicate-free contributing object paths.
pub type SymbolNames = BTreeMap<String, Vec<String>>;

/// Resolved string positions, grouped per requested range, then per object path.
pub type StringPositions = HashMap<AddressRange, BTreeMap<String, Vec<StringPosition>>>;

/// Default number of plain object files grouped into one tool invocation.
///
/// A throughput/latency tuning knob, never an invariant.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Tuning and environment knobs for the analyzer.
#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    /// Prefix prepended to `nm` / `readelf` / `c++filt` (e.g. a cross toolchain
    /// triple like `aarch64-linux-gnu-`, or a directory ending in `/`).
    pub tool_prefix: String,
    /// Directory that object paths are relative to, if any.
    pub output_directory: Option<PathBuf>,
    /// Object files per symbol-listing invocation.
    pub batch_size: usize,
    /// Parallel worker count. Zero means all available cores.
    pub workers: usize,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            tool_prefix: String::new(),
            output_directory: None,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: 0,
        }
    }
}

impl AnalyzerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool_prefix(mut self, prefix: &str) -> Self {
        self.tool_prefix = prefix.to_string();
        self
    }

    pub fn with_output_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_directory = Some(dir.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Number of pool threads after applying the all-cores default.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    /// Resolve an object path against the output directory, if one is set.
    pub fn resolve(&self, path: &str) -> PathBuf {
        match &self.output_directory {
            Some(dir) => dir.join(path),
            None => PathBuf::from(path),
        }
    }
}

/// Build the aggregate key for a member of a static archive.
///
/// Uses the `archive.a(member.o)` notation that linker map files already use
/// for archive-resident object paths.
pub fn member_path(archive: &str, member: &str) -> String {
    format!("{archive}({member})")
}

/// Split an `archive.a(member.o)` key back into its two parts.
///
/// Returns `None` for plain object paths.
pub fn split_member_path(path: &str) -> Option<(&str, &str)> {
    if !path.ends_with(')') {
        return None;
    }
    let open = path.rfind('(')?;
    Some((&path[..open], &path[open + 1..path.len() - 1]))
}
