//! Shared test harness: fake nm / readelf / c++filt shell scripts selected
//! through `tool_prefix`, plus fixture builders.
//!
//! The fake nm prints the canned listing stored next to each input file
//! (`foo.o.nm`), mimicking the real grouped output: no header for a single
//! input, `path:` headers for batches. The fake readelf emits a `File:`
//! header per input and appends the canned section table (`foo.o.sections`).

#![allow(dead_code)]

use bulksym::AnalyzerOptions;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const NM_SCRIPT: &str = r#"#!/bin/sh
files=""
for a in "$@"; do
  case "$a" in
    -*) ;;
    *) files="$files $a" ;;
  esac
done
set -- $files
status=0
if [ "$#" -eq 1 ]; then
  cat "$1.nm" || status=1
else
  for f in "$@"; do
    echo ""
    if [ -f "$f.nm" ]; then
      echo "$f:"
      cat "$f.nm"
    else
      echo "fake nm: no listing for $f" >&2
      status=1
    fi
  done
fi
exit $status
"#;

const READELF_SCRIPT: &str = r#"#!/bin/sh
status=0
for a in "$@"; do
  case "$a" in
    -*) ;;
    *)
      echo "File: $a"
      if [ -f "$a.sections" ]; then
        cat "$a.sections"
      else
        echo "fake readelf: no section table for $a" >&2
        status=1
      fi
      ;;
  esac
done
exit $status
"#;

const CXXFILT_SCRIPT: &str = "#!/bin/sh\nexec cat\n";

pub struct FakeTools {
    dir: TempDir,
}

impl FakeTools {
    pub fn new() -> Self {
        let tools = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        tools.install("nm", NM_SCRIPT);
        tools.install("readelf", READELF_SCRIPT);
        tools.install("c++filt", CXXFILT_SCRIPT);
        tools
    }

    /// (Re)install one tool script; tests override c++filt this way.
    pub fn install(&self, name: &str, script: &str) {
        let path = self.dir.path().join(name);
        fs::write(&path, script).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn prefix(&self) -> String {
        format!("{}/", self.dir.path().display())
    }

    pub fn options(&self) -> AnalyzerOptions {
        AnalyzerOptions::new()
            .with_tool_prefix(&self.prefix())
            .with_workers(2)
    }

    /// Write a fixture file into the tool directory, returning its absolute
    /// path as a string (the form tests submit to the analyzer).
    pub fn write_fixture(&self, name: &str, contents: &[u8]) -> String {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path.display().to_string()
    }

    /// An object "file" plus its canned nm listing.
    pub fn object(&self, name: &str, bytes: &[u8], nm_listing: &str) -> String {
        let path = self.write_fixture(name, bytes);
        self.write_fixture(&format!("{name}.nm"), nm_listing.as_bytes());
        path
    }
}

/// Minimal GNU-style static archive, good enough for the `object` crate.
pub fn write_archive(path: &Path, members: &[(&str, &[u8])]) {
    let mut out = fs::File::create(path).unwrap();
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

/// An object image with `section` embedded at `offset`, padded with 0xEE.
pub fn object_image(offset: usize, section: &[u8]) -> Vec<u8> {
    let mut image = vec![0xEEu8; offset];
    image.extend_from_slice(section);
    image
}

/// A canned readelf row for one `.rodata.str1.1` subsection.
pub fn str1_section_row(offset: u64, size: u64) -> String {
    format!(
        "  [ 5] .rodata.str1.1    PROGBITS        0000000000000000 {offset:06x} {size:06x} 01 AMS  0   0  1\n"
    )
}

pub fn fixture_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}
