//! String literal extraction and final-binary matching.
//!
//! Object files only tell us where literals *start* (string-symbol
//! addresses); the linker then deduplicates and reshuffles them into merge
//! sections. With no authoritative length metadata, literal spans are
//! recovered by walking candidate addresses across the ordered string
//! subsections, and each recovered value is located in the final binary by
//! brute-force byte search with a boundary preference.

use crate::common::{AddressRange, StringPosition};
use crate::error::Result;
use crate::sections::SectionPosition;
use memchr::memmem;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Bytes read once from one requested range of the final binary, shared
/// read-only across all matcher jobs of a phase.
#[derive(Debug, Clone)]
pub struct RangeBlob {
    pub range: AddressRange,
    pub bytes: Vec<u8>,
}

/// Read the requested ranges of the final binary.
///
/// A range reaching past end-of-file is truncated rather than failed; the
/// caller may legitimately ask for the whole file as one oversized range.
pub fn read_range_blobs(path: &Path, ranges: &[AddressRange]) -> Result<Vec<RangeBlob>> {
    let mut file = File::open(path)?;
    let mut blobs = Vec::with_capacity(ranges.len());
    for range in ranges {
        file.seek(SeekFrom::Start(range.address))?;
        let mut bytes = Vec::with_capacity(range.size.min(1 << 20) as usize);
        file.by_ref().take(range.size).read_to_end(&mut bytes)?;
        blobs.push(RangeBlob {
            range: *range,
            bytes,
        });
    }
    Ok(blobs)
}

/// Slice literal values out of ordered section bytes at candidate addresses.
///
/// Addresses are local: a cursor walks the sections in order and rebases
/// whenever the remaining addresses run past the current section's length.
/// An address only opens a new literal if it sits at position 0 or right
/// after a NUL terminator; otherwise it points into the interior of a string
/// that extends an earlier one (a shorter literal stored as the byte-exact
/// suffix of a longer one), and the open span absorbs it.
pub fn extract_literals(candidates: &[u64], sections: &[&[u8]]) -> Vec<Vec<u8>> {
    let mut literals = Vec::new();
    let mut sections_iter = sections.iter();
    let Some(mut current) = sections_iter.next() else {
        return literals;
    };
    let mut base = 0u64;
    let mut open: Option<usize> = None;

    let mut sorted: Vec<u64> = candidates.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    for address in sorted {
        let mut rel = address - base;
        while rel >= current.len() as u64 {
            // The final literal of a section runs to the section's end.
            if let Some(start) = open.take() {
                literals.push(current[start..].to_vec());
            }
            base += current.len() as u64;
            current = match sections_iter.next() {
                Some(section) => section,
                None => return literals,
            };
            rel = address - base;
        }
        let position = rel as usize;
        if position == 0 || current[position - 1] == 0 {
            if let Some(start) = open.take() {
                literals.push(current[start..position].to_vec());
            }
            open = Some(position);
        }
    }
    if let Some(start) = open {
        literals.push(current[start..].to_vec());
    }
    literals
}

/// Locate one literal inside the range blobs.
///
/// An exact-boundary match (blob offset 0, or right after a NUL) anywhere
/// wins immediately; failing that, the first plain substring match across
/// the blobs is kept as a "possible" fallback. `None` means the linker
/// folded the literal away, which is expected.
///
/// Several byte-identical short literals with no boundary match anywhere are
/// attributed first-found; without length metadata there is nothing better
/// to key on.
pub fn match_literal(literal: &[u8], blobs: &[RangeBlob]) -> Option<StringPosition> {
    if literal.is_empty() {
        return None;
    }
    let finder = memmem::Finder::new(literal);
    let mut fallback = None;
    for blob in blobs {
        for at in finder.find_iter(&blob.bytes) {
            let position = StringPosition {
                address: blob.range.address + at as u64,
                size: literal.len() as u64,
            };
            if at == 0 || blob.bytes[at - 1] == 0 {
                return Some(position);
            }
            if fallback.is_none() {
                fallback = Some(position);
            }
        }
    }
    fallback
}

/// Everything one matcher job needs for a single object path.
#[derive(Debug, Clone)]
pub struct ResolveJob {
    /// Aggregate key, possibly `archive.a(member.o)`
    pub path: String,
    /// Candidate string-symbol addresses from the symbol listing
    pub candidates: Vec<u64>,
    /// String subsections in extraction order
    pub sections: Vec<SectionPosition>,
}

/// Resolve one object path's literals against the shared blobs.
///
/// `object_bytes` is the whole object-file (or archive-member) image;
/// literals with no match are dropped silently.
pub fn resolve_strings(
    job: &ResolveJob,
    object_bytes: &[u8],
    blobs: &[RangeBlob],
) -> Vec<StringPosition> {
    let section_slices: Vec<&[u8]> = job
        .sections
        .iter()
        .filter_map(|s| {
            let start = usize::try_from(s.offset).ok()?;
            let end = start.checked_add(usize::try_from(s.size).ok()?)?;
            object_bytes.get(start..end)
        })
        .collect();

    let literals = extract_literals(&job.candidates, &section_slices);
    let mut positions = Vec::with_capacity(literals.len());
    for literal in &literals {
        match match_literal(literal, blobs) {
            Some(position) => positions.push(position),
            None => {
                tracing::debug!(
                    path = %job.path,
                    len = literal.len(),
                    "string literal not present in final binary, dropped"
                );
            }
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(address: u64, bytes: &[u8]) -> RangeBlob {
        RangeBlob {
            range: AddressRange::new(address, bytes.len() as u64),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_extract_simple_table() {
        let section: &[u8] = b"OK\0OK2\0last\0";
        let literals = extract_literals(&[0, 3, 7], &[section]);
        assert_eq!(literals, vec![b"OK\0".to_vec(), b"OK2\0".to_vec(), b"last\0".to_vec()]);
    }

    #[test]
    fn test_interior_candidate_absorbed() {
        // The candidate at 2 points into "longer"'s tail (shared suffix),
        // not at a fresh literal: previous byte is not NUL.
        let section: &[u8] = b"longer\0x\0";
        let literals = extract_literals(&[0, 2, 7], &[section]);
        assert_eq!(literals, vec![b"longer\0".to_vec(), b"x\0".to_vec()]);
    }

    #[test]
    fn test_section_rollover_rebases() {
        let first: &[u8] = b"aa\0";
        let second: &[u8] = b"bbbb\0cc\0";
        // 0 -> "aa\0"; 3 is past the first section: rebases to second+0;
        // 8 -> second+5.
        let literals = extract_literals(&[0, 3, 8], &[first, second]);
        assert_eq!(
            literals,
            vec![b"aa\0".to_vec(), b"bbbb\0".to_vec(), b"cc\0".to_vec()]
        );
    }

    #[test]
    fn test_candidates_past_all_sections_ignored() {
        let section: &[u8] = b"hi\0";
        let literals = extract_literals(&[0, 100], &[section]);
        assert_eq!(literals, vec![b"hi\0".to_vec()]);
    }

    #[test]
    fn test_no_candidates_no_literals() {
        let section: &[u8] = b"hi\0";
        assert!(extract_literals(&[], &[section]).is_empty());
        assert!(extract_literals(&[0], &[]).is_empty());
    }

    #[test]
    fn test_boundary_match_beats_earlier_substring() {
        // "OK\0" appears as a substring inside "AOK\0" at offset 1 and on a
        // NUL boundary at offset 4. The boundary match must win even though
        // the substring comes first.
        let blobs = [blob(0x1000, b"AOK\0OK\0")];
        let pos = match_literal(b"OK\0", &blobs).unwrap();
        assert_eq!(pos.address, 0x1004);
        assert_eq!(pos.size, 3);
    }

    #[test]
    fn test_boundary_in_later_blob_beats_substring_in_earlier() {
        let blobs = [blob(0x1000, b"xOK\0"), blob(0x2000, b"\0OK\0")];
        let pos = match_literal(b"OK\0", &blobs).unwrap();
        assert_eq!(pos.address, 0x2001);
    }

    #[test]
    fn test_substring_fallback() {
        let blobs = [blob(0x500, b"prefixNEEDLEsuffix")];
        let pos = match_literal(b"NEEDLE", &blobs).unwrap();
        assert_eq!(pos.address, 0x500 + 6);
    }

    #[test]
    fn test_match_at_blob_start_is_boundary() {
        let blobs = [blob(0x500, b"NEEDLE\0rest")];
        let pos = match_literal(b"NEEDLE\0", &blobs).unwrap();
        assert_eq!(pos.address, 0x500);
    }

    #[test]
    fn test_folded_literal_drops() {
        let blobs = [blob(0, b"nothing to see")];
        assert!(match_literal(b"absent\0", &blobs).is_none());
        assert!(match_literal(b"", &blobs).is_none());
    }

    #[test]
    fn test_resolve_strings_end_to_end() {
        // Object image: 8 bytes of padding, then the string section.
        let mut object = vec![0xeeu8; 8];
        object.extend_from_slice(b"OK\0OK2\0");
        let job = ResolveJob {
            path: "obj/foo.o".to_string(),
            candidates: vec![0, 3],
            sections: vec![SectionPosition {
                offset: 8,
                size: 7,
                alignment: 1,
            }],
        };
        let blobs = [blob(0x4000, b"\0OK2\0OK\0junk")];
        let positions = resolve_strings(&job, &object, &blobs);
        // "OK\0" must not claim bytes inside "OK2\0".
        assert_eq!(
            positions,
            vec![
                StringPosition {
                    address: 0x4005,
                    size: 3
                },
                StringPosition {
                    address: 0x4001,
                    size: 4
                },
            ]
        );
    }
}
