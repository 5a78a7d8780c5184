//! Locates string-literal subsections from readelf section tables.
//!
//! Merge-string data lives in `.rodata.str<entsize>.<align>` subsections;
//! the alignment encoded in the name tells us which subsection most likely
//! holds a tight NUL-separated literal table. `File:` header lines group the
//! rows when readelf is run over a batch of files or an archive.

use std::collections::HashMap;

/// One `.rodata.str*` subsection inside an object file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionPosition {
    /// File offset of the section contents
    pub offset: u64,
    /// Section size in bytes
    pub size: u64,
    /// Alignment parsed from the section name suffix
    pub alignment: u64,
}

const STRING_SECTION_PREFIX: &str = ".rodata.str";

/// Parse `readelf -S --wide` output covering one or more files.
///
/// Keys are the paths exactly as readelf printed them (`File: lib.a(m.o)`
/// for archive members); ungrouped rows belong to `fallback`.
pub fn parse_section_table(
    output: &str,
    fallback: &str,
) -> HashMap<String, Vec<SectionPosition>> {
    let mut results: HashMap<String, Vec<SectionPosition>> = HashMap::new();
    let mut current: String = fallback.to_string();

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("File: ") {
            current = path.trim().to_string();
            continue;
        }
        let Some(section) = parse_section_row(line) else {
            continue;
        };
        results.entry(current.clone()).or_default().push(section);
    }

    for sections in results.values_mut() {
        order_for_extraction(sections);
    }
    results
}

/// Parse one section-header row, keeping only string-literal subsections.
///
/// Row shape (`--wide`):
/// `  [ 5] .rodata.str1.1   PROGBITS   0000000000000000 000058 00001c 01 AMS  0   0  1`
fn parse_section_row(line: &str) -> Option<SectionPosition> {
    let rest = line.trim_start().strip_prefix('[')?;
    let (_, rest) = rest.split_once(']')?;

    let mut fields = rest.split_whitespace();
    let name = fields.next()?;
    if !name.starts_with(STRING_SECTION_PREFIX) {
        return None;
    }
    let _section_type = fields.next()?;
    let _address = fields.next()?;
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let size = u64::from_str_radix(fields.next()?, 16).ok()?;

    // `.rodata.str1.1` -> 1; fall back to the trailing Al column when the
    // name has no numeric suffix.
    let alignment = name
        .rsplit('.')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .or_else(|| line.split_whitespace().last().and_then(|al| al.parse().ok()))
        .unwrap_or(0);

    Some(SectionPosition {
        offset,
        size,
        alignment,
    })
}

/// Move the first single-byte-aligned subsection to the front.
///
/// That subsection is the one most likely to hold a tight NUL-separated
/// literal table, so the extractor walks it first. A heuristic, not a
/// structural guarantee.
fn order_for_extraction(sections: &mut Vec<SectionPosition>) {
    if let Some(idx) = sections.iter().position(|s| s.alignment == 1) {
        let first = sections.remove(idx);
        sections.insert(0, first);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
There are 12 section headers, starting at offset 0x5b0:\n\
\n\
Section Headers:\n\
  [Nr] Name              Type            Address          Off    Size   ES Flg Lk Inf Al\n\
  [ 0]                   NULL            0000000000000000 000000 000000 00      0   0  0\n\
  [ 1] .text             PROGBITS        0000000000000000 000040 000018 00  AX  0   0  4\n\
  [ 4] .rodata.str4.4    PROGBITS        0000000000000000 000080 000010 04 AMS  0   0  4\n\
  [ 5] .rodata.str1.1    PROGBITS        0000000000000000 000058 00001c 01 AMS  0   0  1\n\
  [ 6] .rodata           PROGBITS        0000000000000000 0000a0 000008 00   A  0   0  8\n";

    #[test]
    fn test_keeps_only_string_subsections() {
        let results = parse_section_table(SAMPLE, "obj/foo.o");
        let sections = &results["obj/foo.o"];
        assert_eq!(sections.len(), 2);
    }

    #[test]
    fn test_align1_subsection_first() {
        let results = parse_section_table(SAMPLE, "obj/foo.o");
        let sections = &results["obj/foo.o"];
        assert_eq!(
            sections[0],
            SectionPosition {
                offset: 0x58,
                size: 0x1c,
                alignment: 1
            }
        );
        assert_eq!(sections[1].alignment, 4);
    }

    #[test]
    fn test_file_header_grouping() {
        let grouped = format!(
            "File: obj/a.o\n{SAMPLE}\nFile: lib.a(m1.o)\n  \
             [ 2] .rodata.str1.1    PROGBITS        0000000000000000 000040 000008 01 AMS  0   0  1\n"
        );
        let results = parse_section_table(&grouped, "unused");
        assert!(results.contains_key("obj/a.o"));
        assert_eq!(
            results["lib.a(m1.o)"],
            vec![SectionPosition {
                offset: 0x40,
                size: 0x8,
                alignment: 1
            }]
        );
        assert!(!results.contains_key("unused"));
    }

    #[test]
    fn test_discovery_order_kept_after_align1() {
        let table = "\
  [ 3] .rodata.str8.8    PROGBITS        0000000000000000 000010 000020 08 AMS  0   0  8\n\
  [ 4] .rodata.str2.2    PROGBITS        0000000000000000 000030 000010 02 AMS  0   0  2\n\
  [ 5] .rodata.str1.1    PROGBITS        0000000000000000 000040 000008 01 AMS  0   0  1\n";
        let results = parse_section_table(table, "x.o");
        let aligns: Vec<u64> = results["x.o"].iter().map(|s| s.alignment).collect();
        assert_eq!(aligns, vec![1, 8, 2]);
    }
}
