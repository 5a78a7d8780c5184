//! Symbol-listing (nm) output parsing.
//!
//! One invocation covers a single archive or a batch of plain object files.
//! Every defined-symbol line is classified into exactly one bucket: a string
//! literal candidate address, a relevant symbol name, or noise. The grouped
//! formats nm emits for archives (`member.o:`) and for multi-file batches
//! (`path.o:`) are both handled here.

use crate::common::member_path;
use crate::error::Result;
use crate::tool::ToolRunner;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Per-path parse results for one nm invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ObjectSymbols {
    /// Relevant defined-symbol names
    pub names: Vec<String>,
    /// Local addresses of string-literal symbols, in listing order
    pub string_addresses: Vec<u64>,
}

/// Compiler-generated names that recur across translation units and would
/// otherwise look like symbols shared by many files.
const ARTIFACT_EXACT: &[&str] = &["__tcf_0", "__tcf_1"];

/// Dotted-suffix artifacts: `CSWTCH.61`, `lock.12`, `table.5`, ...
const ARTIFACT_BASES: &[&str] = &["CSWTCH", "lock", "table", "__compound_literal"];

/// String-literal naming conventions: `.L.str.42` (clang), `.LC3` (gcc).
fn is_string_literal_name(name: &str) -> bool {
    name.starts_with(".L.str") || name.starts_with(".LC")
}

/// Whether a defined symbol name should enter the name -> paths map.
fn is_relevant_name(name: &str) -> bool {
    if ARTIFACT_EXACT.contains(&name) {
        return false;
    }
    let base = name.split('.').next().unwrap_or(name);
    !ARTIFACT_BASES.contains(&base)
}

/// A `member.o:` or `path.o:` group header.
fn group_header(line: &str) -> Option<&str> {
    let line = line.trim_end();
    let name = line.strip_suffix(':')?;
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some(name)
}

/// Parse the output of one nm run.
///
/// `fallback` owns ungrouped lines (nm omits headers for a single plain
/// input). When `archive` is set, group headers are member names and results
/// key as `archive(member)`; otherwise headers are the paths as passed to nm.
pub fn parse_object_listing(
    output: &str,
    fallback: &str,
    archive: Option<&str>,
) -> HashMap<String, ObjectSymbols> {
    let mut results: HashMap<String, ObjectSymbols> = HashMap::new();
    let mut current: String = fallback.to_string();

    for line in output.lines() {
        if line.is_empty() {
            continue;
        }
        if let Some(header) = group_header(line) {
            current = match archive {
                Some(archive) => member_path(archive, header),
                None => header.to_string(),
            };
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(address), Some(sym_type), Some(name)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        // Undefined symbols have no address column and fall out above;
        // anything left that doesn't parse as hex is noise.
        let Ok(address) = u64::from_str_radix(address, 16) else {
            continue;
        };
        if sym_type.len() != 1 {
            continue;
        }

        if name.starts_with('$') {
            // Assembler-local mapping symbols ($t, $d.3).
            continue;
        }
        if matches!(sym_type, "r" | "R") && is_string_literal_name(name) {
            results
                .entry(current.clone())
                .or_default()
                .string_addresses
                .push(address);
            continue;
        }
        if name.starts_with(".L") {
            continue;
        }
        if !is_relevant_name(name) {
            continue;
        }
        results
            .entry(current.clone())
            .or_default()
            .names
            .push(name.to_string());
    }
    results
}

/// Run nm over the final linked binary and group symbol names by address.
///
/// Only addresses claimed by two or more names survive; that is exactly the
/// aliasing identical-code-folding produces.
pub fn collect_aliases(
    runner: &ToolRunner,
    elf_path: &Path,
) -> Result<BTreeMap<u64, Vec<String>>> {
    let output = runner.run("nm", ["--no-sort".as_ref(), elf_path.as_os_str()])?;

    let mut names_by_address: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(address), Some(sym_type), Some(name)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Ok(address) = u64::from_str_radix(address, 16) else {
            continue;
        };
        if sym_type.len() != 1 || name.starts_with('$') || name.starts_with(".L") {
            continue;
        }
        names_by_address.entry(address).or_default().push(name.to_string());
    }

    names_by_address.retain(|_, names| names.len() > 1);
    tracing::debug!(
        aliased_addresses = names_by_address.len(),
        "collected symbol aliases"
    );
    Ok(names_by_address)
}
