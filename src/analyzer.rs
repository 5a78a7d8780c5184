//! The orchestrator: owns all aggregate state and phase sequencing.
//!
//! Callers feed it object/archive paths, finalize the name table once, then
//! resolve string literals against the final binary. All aggregate maps are
//! mutated only by the thread driving this struct (the delegate's background
//! loop when run out-of-process, otherwise the caller's own thread), so no
//! locking is needed. Worker jobs only ever hand back one-shot results.
//!
//! Phase order is enforced, not suggested: calling a collecting-phase
//! operation after finalization is a programmer error and panics.

use crate::ar;
use crate::common::{
    member_path, split_member_path, AddressRange, AnalyzerOptions, StringPositions, SymbolNames,
};
use crate::error::Result;
use crate::nm::{self, ObjectSymbols};
use crate::pool::WorkerPool;
use crate::sections::{self, SectionPosition};
use crate::strings::{self, RangeBlob, ResolveJob};
use crate::supervisor::Supervisor;
use crate::tool::ToolRunner;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Collecting,
    NamesFinalized,
    StringsResolved,
    Closed,
}

/// A unit of work for the pool: one whole archive, or a bounded batch of
/// plain object files. Consumed exactly once.
#[derive(Debug, Clone)]
enum AnalysisJob {
    Archive(String),
    ObjectBatch(Vec<String>),
}

pub struct BulkAnalyzer {
    options: AnalyzerOptions,
    runner: ToolRunner,
    pool: WorkerPool,
    supervisor: Arc<Supervisor>,
    phase: Phase,
    /// Raw (mangled) name -> contributing paths, until `sort_paths`
    raw_names: HashMap<String, Vec<String>>,
    /// Demangled, merged, sorted name table after `sort_paths`
    finalized_names: SymbolNames,
    /// Pending string candidates per object path
    string_candidates: HashMap<String, Vec<u64>>,
    string_positions: StringPositions,
}

impl BulkAnalyzer {
    pub fn new(options: AnalyzerOptions) -> Result<Self> {
        let supervisor = Supervisor::new();
        let runner = ToolRunner::new(&options.tool_prefix, Arc::clone(&supervisor));
        let pool = WorkerPool::new(options.effective_workers())?;
        Ok(Self {
            options,
            runner,
            pool,
            supervisor,
            phase: Phase::Collecting,
            raw_names: HashMap::new(),
            finalized_names: SymbolNames::new(),
            string_candidates: HashMap::new(),
            string_positions: StringPositions::new(),
        })
    }

    /// Analyze a set of object-file and archive paths.
    ///
    /// Partitions the paths into per-archive jobs and size-bounded batches,
    /// fans them out, and merges the results. The call is atomic: if any job
    /// fails, nothing from this call is merged and prior state is untouched.
    /// May be called repeatedly before [`Self::sort_paths`].
    pub fn analyze_paths(&mut self, paths: &[String]) -> Result<()> {
        assert_eq!(
            self.phase,
            Phase::Collecting,
            "analyze_paths called after sort_paths"
        );
        let jobs = partition_paths(paths, self.options.batch_size);
        tracing::info!(paths = paths.len(), jobs = jobs.len(), "analyzing symbol listings");

        let runner = &self.runner;
        let options = &self.options;
        let results = self
            .pool
            .run(jobs, |job| run_symbol_job(runner, options, job));

        // Atomic merge: surface the first failure before touching state.
        let mut merged = Vec::with_capacity(results.len());
        for result in results {
            merged.push(result?);
        }
        for per_path in merged {
            for (path, symbols) in per_path {
                if !symbols.names.is_empty() {
                    for name in symbols.names {
                        self.raw_names.entry(name).or_default().push(path.clone());
                    }
                }
                if !symbols.string_addresses.is_empty() {
                    self.string_candidates
                        .entry(path)
                        .or_default()
                        .extend(symbols.string_addresses);
                }
            }
        }
        Ok(())
    }

    /// Finalize the name table: demangle, merge collapsing names, and sort
    /// every path list. No further `analyze_paths` call is permitted.
    pub fn sort_paths(&mut self) -> Result<()> {
        assert_eq!(
            self.phase,
            Phase::Collecting,
            "sort_paths called twice or after string analysis"
        );

        // Demangle in sorted raw-name order so the result never depends on
        // worker completion order.
        let mut raw: Vec<String> = self.raw_names.keys().cloned().collect();
        raw.sort_unstable();
        let demangled = self.runner.demangle(&raw)?;

        let mut finalized = SymbolNames::new();
        for (raw_name, name) in raw.into_iter().zip(demangled) {
            let paths = self.raw_names.remove(&raw_name).unwrap_or_default();
            // Two raw names may collapse to one demangled key; union the
            // path lists.
            finalized.entry(name).or_default().extend(paths);
        }
        for paths in finalized.values_mut() {
            paths.sort_unstable();
            paths.dedup();
        }

        tracing::info!(names = finalized.len(), "finalized symbol name table");
        self.finalized_names = finalized;
        self.raw_names = HashMap::new();
        self.phase = Phase::NamesFinalized;
        Ok(())
    }

    /// Resolve all pending string-literal candidates against the given
    /// ranges of the final binary.
    ///
    /// Repeatable per distinct range; resolving the same range again
    /// replaces its previous resolutions rather than merging. Requires the
    /// naming phase to be finalized first (both phases share the pool, and
    /// candidates only exist for paths already analyzed).
    pub fn analyze_string_literals(
        &mut self,
        final_binary: &Path,
        ranges: &[AddressRange],
    ) -> Result<()> {
        assert!(
            matches!(self.phase, Phase::NamesFinalized | Phase::StringsResolved),
            "analyze_string_literals requires sort_paths first"
        );
        let blobs = strings::read_range_blobs(final_binary, ranges)?;
        let jobs = partition_pending(&self.string_candidates, self.options.batch_size);
        tracing::info!(
            ranges = ranges.len(),
            jobs = jobs.len(),
            candidates = self.string_candidates.len(),
            "resolving string literals"
        );

        let runner = &self.runner;
        let options = &self.options;
        let candidates = &self.string_candidates;
        let blobs_ref = &blobs;
        let results = self.pool.run(jobs, |job| {
            run_string_job(runner, options, candidates, blobs_ref, job)
        });

        let mut merged = Vec::with_capacity(results.len());
        for result in results {
            merged.push(result?);
        }

        // Replace, not merge, resolutions for every requested range.
        for range in ranges {
            self.string_positions.insert(*range, BTreeMap::new());
        }
        for per_path in merged {
            for (path, by_range) in per_path {
                for (range, positions) in by_range {
                    if positions.is_empty() {
                        continue;
                    }
                    self.string_positions
                        .entry(range)
                        .or_default()
                        .entry(path.clone())
                        .or_default()
                        .extend(positions);
                }
            }
        }
        self.phase = Phase::StringsResolved;
        Ok(())
    }

    /// The finalized symbol name -> sorted paths map.
    ///
    /// In-process all work is synchronous, so this never waits; the IPC
    /// coordinator provides the queue-draining equivalent.
    pub fn symbol_names(&self) -> &SymbolNames {
        assert!(
            self.phase >= Phase::NamesFinalized && self.phase != Phase::Closed,
            "symbol_names requires sort_paths first"
        );
        &self.finalized_names
    }

    /// Resolved string positions, grouped per requested range then per path.
    pub fn string_positions(&self) -> &StringPositions {
        assert!(
            self.phase >= Phase::NamesFinalized && self.phase != Phase::Closed,
            "string_positions requires sort_paths first"
        );
        &self.string_positions
    }

    /// Address -> alias names of the final binary (identical code folding).
    pub fn collect_aliases(&self, elf_path: &Path) -> Result<BTreeMap<u64, Vec<String>>> {
        nm::collect_aliases(&self.runner, elf_path)
    }

    /// Release the pool and terminate any still-tracked child process.
    /// Terminal; idempotent.
    pub fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.phase = Phase::Closed;
        self.raw_names = HashMap::new();
        self.string_candidates = HashMap::new();
        self.supervisor.kill_all();
    }
}

impl Drop for BulkAnalyzer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Split submitted paths into per-archive jobs and bounded object batches.
fn partition_paths(paths: &[String], batch_size: usize) -> Vec<AnalysisJob> {
    let mut jobs = Vec::new();
    let mut plain = Vec::new();
    for path in paths {
        if path.ends_with(".a") {
            jobs.push(AnalysisJob::Archive(path.clone()));
        } else {
            plain.push(path.clone());
        }
    }
    for batch in plain.chunks(batch_size.max(1)) {
        jobs.push(AnalysisJob::ObjectBatch(batch.to_vec()));
    }
    jobs
}

/// Group pending candidate paths for the string phase: archive members fold
/// back into one job per archive, plain paths batch as usual.
fn partition_pending(
    candidates: &HashMap<String, Vec<u64>>,
    batch_size: usize,
) -> Vec<AnalysisJob> {
    let mut archives = BTreeSet::new();
    let mut plain = Vec::new();
    for path in candidates.keys() {
        match split_member_path(path) {
            Some((archive, _)) => {
                archives.insert(archive.to_string());
            }
            None => plain.push(path.clone()),
        }
    }
    plain.sort_unstable();

    let mut jobs: Vec<AnalysisJob> = archives.into_iter().map(AnalysisJob::Archive).collect();
    for batch in plain.chunks(batch_size.max(1)) {
        jobs.push(AnalysisJob::ObjectBatch(batch.to_vec()));
    }
    jobs
}

/// Worker-side symbol job: one nm invocation plus parsing.
fn run_symbol_job(
    runner: &ToolRunner,
    options: &AnalyzerOptions,
    job: AnalysisJob,
) -> Result<HashMap<String, ObjectSymbols>> {
    match job {
        AnalysisJob::Archive(archive) => {
            let resolved = options.resolve(&archive);
            let output = runner.run(
                "nm",
                ["--no-sort".as_ref(), resolved.as_os_str()],
            )?;
            // Group headers inside an archive listing are member names.
            Ok(nm::parse_object_listing(&output, &archive, Some(&archive)))
        }
        AnalysisJob::ObjectBatch(paths) => {
            let resolved: Vec<OsString> = paths
                .iter()
                .map(|p| options.resolve(p).into_os_string())
                .collect();
            let mut args: Vec<OsString> = vec!["--no-sort".into()];
            args.extend(resolved.iter().cloned());
            let output = runner.run("nm", args)?;

            // nm prints headers with the path as passed; map back to the
            // caller's (possibly relative) keys.
            let fallback = resolved[0].to_string_lossy().into_owned();
            let parsed = nm::parse_object_listing(&output, &fallback, None);
            Ok(remap_keys(parsed, &resolved, &paths))
        }
    }
}

/// Worker-side string job: locate sections, slice object bytes, extract and
/// match literals. Returns per-path positions keyed by range.
#[allow(clippy::type_complexity)]
fn run_string_job(
    runner: &ToolRunner,
    options: &AnalyzerOptions,
    candidates: &HashMap<String, Vec<u64>>,
    blobs: &[RangeBlob],
    job: AnalysisJob,
) -> Result<HashMap<String, Vec<(AddressRange, Vec<crate::common::StringPosition>)>>> {
    let mut out = HashMap::new();
    match job {
        AnalysisJob::Archive(archive) => {
            let resolved = options.resolve(&archive);
            let output = runner.run(
                "readelf",
                ["-S".as_ref(), "--wide".as_ref(), resolved.as_os_str()],
            )?;
            // readelf prints `File: path(member)`; re-key onto the caller's
            // archive path.
            let mut sections_by_member: HashMap<String, Vec<SectionPosition>> = HashMap::new();
            for (printed, sections) in
                sections::parse_section_table(&output, &archive)
            {
                if let Some((_, member)) = split_member_path(&printed) {
                    sections_by_member.insert(member.to_string(), sections);
                }
            }

            for (member, bytes) in ar::iter_members(&resolved)? {
                let key = member_path(&archive, &member);
                let Some(addresses) = candidates.get(&key) else {
                    continue;
                };
                let Some(sections) = sections_by_member.remove(&member) else {
                    continue;
                };
                let job = ResolveJob {
                    path: key.clone(),
                    candidates: addresses.clone(),
                    sections,
                };
                out.insert(key, resolve_against_blobs(&job, &bytes, blobs));
            }
        }
        AnalysisJob::ObjectBatch(paths) => {
            let resolved: Vec<OsString> = paths
                .iter()
                .map(|p| options.resolve(p).into_os_string())
                .collect();
            let mut args: Vec<OsString> = vec!["-S".into(), "--wide".into()];
            args.extend(resolved.iter().cloned());
            let output = runner.run("readelf", args)?;

            let fallback = resolved[0].to_string_lossy().into_owned();
            let parsed = sections::parse_section_table(&output, &fallback);
            let sections_by_path = remap_keys(parsed, &resolved, &paths);

            for path in &paths {
                let Some(addresses) = candidates.get(path) else {
                    continue;
                };
                let Some(sections) = sections_by_path.get(path) else {
                    continue;
                };
                let bytes = std::fs::read(options.resolve(path))?;
                let job = ResolveJob {
                    path: path.clone(),
                    candidates: addresses.clone(),
                    sections: sections.clone(),
                };
                out.insert(path.clone(), resolve_against_blobs(&job, &bytes, blobs));
            }
        }
    }
    Ok(out)
}

/// Run the matcher once per blob range, so resolutions stay grouped by the
/// range they were requested for.
fn resolve_against_blobs(
    job: &ResolveJob,
    object_bytes: &[u8],
    blobs: &[RangeBlob],
) -> Vec<(AddressRange, Vec<crate::common::StringPosition>)> {
    let all = strings::resolve_strings(job, object_bytes, blobs);
    let mut by_range: Vec<(AddressRange, Vec<crate::common::StringPosition>)> = blobs
        .iter()
        .map(|b| (b.range, Vec::new()))
        .collect();
    for position in all {
        if let Some((_, positions)) = by_range.iter_mut().find(|(range, _)| {
            position.address >= range.address
                && position.address < range.address + range.size
        }) {
            positions.push(position);
        }
    }
    by_range
}

/// Rename tool-printed keys (resolved paths) back to caller keys.
fn remap_keys<V>(
    parsed: HashMap<String, V>,
    resolved: &[OsString],
    original: &[String],
) -> HashMap<String, V> {
    let lookup: HashMap<String, &String> = resolved
        .iter()
        .zip(original)
        .map(|(res, orig)| (res.to_string_lossy().into_owned(), orig))
        .collect();
    parsed
        .into_iter()
        .map(|(key, value)| match lookup.get(&key) {
            Some(original) => ((*original).clone(), value),
            None => (key, value),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_paths(job: &AnalysisJob) -> Option<&[String]> {
        match job {
            AnalysisJob::ObjectBatch(paths) => Some(paths),
            AnalysisJob::Archive(_) => None,
        }
    }

    #[test]
    fn test_partition_separates_archives_and_batches() {
        let paths = vec![
            "a.o".to_string(),
            "lib/libx.a".to_string(),
            "b.o".to_string(),
            "c.o".to_string(),
        ];
        let jobs = partition_paths(&paths, 2);
        assert_eq!(jobs.len(), 3);
        assert!(matches!(&jobs[0], AnalysisJob::Archive(p) if p == "lib/libx.a"));
        assert_eq!(batch_paths(&jobs[1]).unwrap(), &["a.o", "b.o"]);
        assert_eq!(batch_paths(&jobs[2]).unwrap(), &["c.o"]);
    }

    #[test]
    fn test_partition_pending_groups_members() {
        let mut candidates: HashMap<String, Vec<u64>> = HashMap::new();
        candidates.insert("libx.a(m1.o)".into(), vec![0]);
        candidates.insert("libx.a(m2.o)".into(), vec![0]);
        candidates.insert("plain.o".into(), vec![0]);
        let jobs = partition_pending(&candidates, 50);
        assert_eq!(jobs.len(), 2);
        assert!(matches!(&jobs[0], AnalysisJob::Archive(p) if p == "libx.a"));
        assert_eq!(batch_paths(&jobs[1]).unwrap(), &["plain.o"]);
    }

    #[test]
    fn test_remap_keys() {
        let mut parsed = HashMap::new();
        parsed.insert("/out/a.o".to_string(), 1u32);
        parsed.insert("unknown".to_string(), 2u32);
        let resolved = vec![OsString::from("/out/a.o")];
        let original = vec!["a.o".to_string()];
        let remapped = remap_keys(parsed, &resolved, &original);
        assert_eq!(remapped["a.o"], 1);
        assert_eq!(remapped["unknown"], 2);
    }

    #[test]
    #[should_panic(expected = "analyze_paths called after sort_paths")]
    fn test_collecting_only_after_finalize_panics() {
        let mut analyzer = BulkAnalyzer::new(
            AnalyzerOptions::new().with_tool_prefix("/nonexistent/prefix-"),
        )
        .unwrap();
        analyzer.sort_paths().unwrap();
        let _ = analyzer.analyze_paths(&["x.o".to_string()]);
    }

    #[test]
    fn test_empty_finalize_yields_empty_map() {
        let mut analyzer = BulkAnalyzer::new(
            AnalyzerOptions::new().with_tool_prefix("/nonexistent/prefix-"),
        )
        .unwrap();
        analyzer.sort_paths().unwrap();
        assert!(analyzer.symbol_names().is_empty());
    }
}
