//! Static-archive member access.
//!
//! Consumed as a black box by the string-resolution phase: readelf reports
//! section offsets relative to each member's start, so matcher jobs need the
//! raw member images to slice section bytes out of.

use crate::error::{Error, Result};
use object::read::archive::ArchiveFile;
use std::path::Path;

/// Yield `(member name, raw bytes)` for every member of a static archive.
pub fn iter_members(archive_path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let data = std::fs::read(archive_path)?;
    let archive = ArchiveFile::parse(&*data).map_err(|e| Error::Archive {
        path: archive_path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut members = Vec::new();
    for member in archive.members() {
        let member = member.map_err(|e| Error::Archive {
            path: archive_path.display().to_string(),
            message: e.to_string(),
        })?;
        let name = String::from_utf8_lossy(member.name()).into_owned();
        let bytes = member
            .data(&*data)
            .map_err(|e| Error::Archive {
                path: archive_path.display().to_string(),
                message: format!("member {name}: {e}"),
            })?
            .to_vec();
        members.push((name, bytes));
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Minimal GNU-style archive writer.
    fn write_archive(path: &Path, members: &[(&str, &[u8])]) {
        let mut out = std::fs::File::create(path).unwrap();
        out.write_all(b"!<arch>\n").unwrap();
        for (name, data) in members {
            let header = format!(
                "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
                format!("{name}/"),
                0,
                0,
                0,
                "100644",
                data.len()
            );
            out.write_all(header.as_bytes()).unwrap();
            out.write_all(data).unwrap();
            if data.len() % 2 == 1 {
                out.write_all(b"\n").unwrap();
            }
        }
    }

    #[test]
    fn test_iter_members_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libx.a");
        write_archive(&path, &[("m1.o", b"first"), ("m2.o", b"second!")]);

        let members = iter_members(&path).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0], ("m1.o".to_string(), b"first".to_vec()));
        assert_eq!(members[1], ("m2.o".to_string(), b"second!".to_vec()));
    }

    #[test]
    fn test_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-an-archive");
        std::fs::write(&path, b"ELF or whatever").unwrap();
        assert!(matches!(
            iter_members(&path).unwrap_err(),
            Error::Archive { .. }
        ));
    }
}
