// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Maps code addresses to the source files of their compilation units.
//!
//! Two construction paths exist: parsing the textual output of an external
//! `dwarfdump` ([`SourceMapper::from_dwarfdump`]) and reading compile unit
//! ranges directly from the binary's DWARF sections ([`SourceMapper::from_dwarf`]).
//! Both produce the same sorted interval list.

use crate::{objfile, AnyError, VirtAddr};
use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

/// Shorthand for the [`gimli`] reader type.
type R<'dwarf> = gimli::EndianSlice<'dwarf, gimli::LittleEndian>;

/// Flags passed to `dwarfdump`. Only top level DIEs are needed.
const DWARFDUMP_FLAGS: &[&str] = &["--debug-info", "--recurse-depth=0", "--summarize-types"];

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur while building a [`SourceMapper`].
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Reader currently doesn't support big endian binaries")]
    BigEndian,

    #[error("dwarfdump failed with {}", .0)]
    DwarfdumpFailed(std::process::ExitStatus),

    #[error("objfile error")]
    Objfile(#[from] objfile::Error),

    #[error("IO error")]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Other(AnyError),
}

impl Error {
    /// Classification into the fatal error taxonomy.
    pub fn kind(&self) -> crate::ErrorKind {
        match self {
            Error::IO(_) | Error::DwarfdumpFailed(_) => crate::ErrorKind::Io,
            _ => crate::ErrorKind::MalformedInput,
        }
    }
}

impl From<gimli::Error> for Error {
    fn from(e: gimli::Error) -> Self {
        Self::Other(Box::new(e))
    }
}

/// Answers "which source file owns this address?".
#[derive(Debug, Default)]
pub struct SourceMapper {
    /// Sorted by range start.
    ranges: Vec<(Range<VirtAddr>, String)>,
    queries: AtomicU64,
    unmatched: AtomicU64,
}

impl SourceMapper {
    fn new(mut ranges: Vec<(Range<VirtAddr>, String)>) -> Self {
        ranges.retain(|(rng, _)| !rng.is_empty());
        ranges.sort_by(|a, b| (a.0.start, a.0.end, &a.1).cmp(&(b.0.start, b.0.end, &b.1)));
        SourceMapper {
            ranges,
            queries: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
        }
    }

    /// Parses the output of `dwarfdump --debug-info --recurse-depth=0 --summarize-types`.
    ///
    /// Only `DW_TAG_compile_unit` blocks are considered. Lines that don't
    /// fit the expected grammar are skipped.
    pub fn from_dwarfdump(output: &str) -> Self {
        let mut ranges = Vec::new();
        let mut lines = output.lines().peekable();

        while let Some(line) = lines.next() {
            if !line.contains("DW_TAG_compile_unit") {
                continue;
            }

            let unit = parse_compile_unit(&mut lines);
            let Some(path) = unit.name.or(unit.dwo_name) else {
                continue;
            };
            let path = strip_comp_dir(path, unit.comp_dir.as_deref());

            for rng in unit.ranges {
                ranges.push((rng, path.clone()));
            }
        }

        Self::new(ranges)
    }

    /// Runs `dwarfdump` on the given binary and parses its output.
    pub fn run_dwarfdump(dwarfdump: &Path, binary: &Path) -> Result<Self> {
        log::debug!("running {} on {}", dwarfdump.display(), binary.display());
        let output = Command::new(dwarfdump)
            .arg(binary)
            .args(DWARFDUMP_FLAGS)
            .stderr(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(Error::DwarfdumpFailed(output.status));
        }

        Ok(Self::from_dwarfdump(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Reads compile unit ranges from the DWARF sections of an object.
    pub fn from_dwarf(obj: &objfile::Reader<'_>) -> Result<Self> {
        if !obj.is_little_endian() {
            return Err(Error::BigEndian);
        }

        fn borrow<'a>(section: &'a Option<objfile::Section<'a>>) -> R<'a> {
            let data: &[u8] = match section {
                Some(x) => x,
                None => &[][..],
            };

            R::new(data, gimli::LittleEndian)
        }

        let sections = gimli::DwarfSections::load(|id| obj.load_section(id.name().as_bytes()))?;
        let dwarf = sections.borrow(borrow);

        let mut ranges = Vec::new();
        let mut headers = dwarf.units();
        while let Some(header) = headers.next()? {
            let unit = dwarf.unit(header)?;
            let Some(name) = unit.name else {
                continue;
            };

            let comp_dir = unit.comp_dir.map(|x| x.to_string_lossy().into_owned());
            let name = strip_comp_dir(name.to_string_lossy().into_owned(), comp_dir.as_deref());
            let mut iter = dwarf.unit_ranges(&unit)?;
            while let Some(rng) = iter.next()? {
                ranges.push((rng.begin..rng.end, name.clone()));
            }
        }

        Ok(Self::new(ranges))
    }

    /// Looks up the source path of the interval containing `addr`.
    pub fn find_source(&self, addr: VirtAddr) -> Option<&str> {
        self.queries.fetch_add(1, Ordering::Relaxed);

        let idx = match self.ranges.binary_search_by_key(&addr, |(rng, _)| rng.start) {
            Ok(idx) => Some(idx),
            Err(idx) => idx.checked_sub(1),
        };

        let found = idx
            .map(|idx| &self.ranges[idx])
            .filter(|(rng, _)| rng.contains(&addr))
            .map(|(_, path)| path.as_str());

        if found.is_none() {
            self.unmatched.fetch_add(1, Ordering::Relaxed);
        }

        found
    }

    /// Number of address intervals.
    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    /// Number of distinct source paths.
    pub fn num_paths(&self) -> usize {
        self.ranges
            .iter()
            .map(|(_, path)| path.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Returns `(queries, unmatched)` counts.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.queries.load(Ordering::Relaxed),
            self.unmatched.load(Ordering::Relaxed),
        )
    }

    /// Fraction of queries that no interval covered.
    pub fn unmatched_ratio(&self) -> f64 {
        match self.stats() {
            (0, _) => 0.0,
            (queries, unmatched) => unmatched as f64 / queries as f64,
        }
    }

    /// Emits the lookup statistics as a log record.
    pub fn log_stats(&self, binary: &str) {
        let (queries, unmatched) = self.stats();
        log::info!(
            "{binary}: {} source paths across {} ranges, {unmatched} / {queries} lookups unmatched",
            self.num_paths(),
            self.num_ranges(),
        );
    }
}

/// Makes an absolute compile unit name relative to the unit's
/// `DW_AT_comp_dir`, if it lies within it.
fn strip_comp_dir(name: String, comp_dir: Option<&str>) -> String {
    let Some(dir) = comp_dir.map(|x| x.trim_end_matches('/')).filter(|x| !x.is_empty()) else {
        return name;
    };

    match name.strip_prefix(dir).and_then(|x| x.strip_prefix('/')) {
        Some(rest) if Path::new(dir).is_absolute() => rest.to_owned(),
        _ => name,
    }
}

/// Normalizes a DWARF source path into a repository-relative one.
///
/// Leading `../` components (paths relative to the output directory) are
/// dropped, as is the root of absolute paths outside of the compilation
/// directory. Returns whether the file is a generated source.
pub fn normalize_source_path(path: &str) -> (String, bool) {
    let mut path = path.trim_start_matches('/');
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest;
        } else if let Some(rest) = path.strip_prefix("../") {
            path = rest;
        } else {
            break;
        }
    }

    let generated = path.starts_with("gen/");
    (path.to_owned(), generated)
}

#[derive(Debug, Default)]
struct CompileUnit {
    name: Option<String>,
    dwo_name: Option<String>,
    comp_dir: Option<String>,
    ranges: Vec<Range<VirtAddr>>,
}

fn parse_compile_unit<'a, I>(lines: &mut std::iter::Peekable<I>) -> CompileUnit
where
    I: Iterator<Item = &'a str>,
{
    let mut unit = CompileUnit::default();
    let mut low_pc = None;
    let mut high_pc = None;

    while let Some(&line) = lines.peek() {
        let Some(dw_idx) = line.find("DW_") else {
            lines.next();
            continue;
        };

        let attr = &line[dw_idx..];
        if attr.starts_with("DW_TAG") {
            break;
        }

        lines.next();
        if attr.starts_with("DW_AT_low_pc") {
            low_pc = extract_value(attr).and_then(parse_hex);
        } else if attr.starts_with("DW_AT_high_pc") {
            high_pc = extract_value(attr).and_then(parse_hex);
        } else if attr.starts_with("DW_AT_name") {
            unit.name = extract_value(attr).map(str::to_owned);
        } else if attr.starts_with("DW_AT_comp_dir") {
            unit.comp_dir = extract_value(attr).map(str::to_owned);
        } else if attr.starts_with("DW_AT_GNU_dwo_name") || attr.starts_with("DW_AT_dwo_name") {
            unit.dwo_name = extract_value(attr).map(str::to_owned);
        } else if attr.starts_with("DW_AT_ranges") {
            unit.ranges = parse_ranges(lines);
        }
    }

    match low_pc {
        Some(low) if unit.ranges.is_empty() && low > 0 => {
            let high = high_pc.unwrap_or(low + 1);
            unit.ranges.push(low..high);
        }
        Some(low) if low > 0 => {
            log::debug!("ignoring DW_AT_low_pc base {low:#x} of unit with DW_AT_ranges");
        }
        _ => {}
    }

    unit
}

/// Parses the interval list following a `DW_AT_ranges` line.
///
/// ```text
/// [0x1, 0x2)
/// [0x5, 0x10))
/// ```
fn parse_ranges<'a, I>(lines: &mut std::iter::Peekable<I>) -> Vec<Range<VirtAddr>>
where
    I: Iterator<Item = &'a str>,
{
    let mut ranges = Vec::new();

    for line in lines.by_ref() {
        let opening = line.matches(['(', '[']).count();
        let closing = line.matches([')', ']']).count();

        let trimmed = line.trim_matches(|c: char| "([]) \t".contains(c));
        if let Some((start, end)) = trimmed.split_once(',') {
            match (parse_hex(start.trim()), parse_hex(end.trim())) {
                (Some(start), Some(end)) if start < end => ranges.push(start..end),
                (Some(_), Some(_)) => {}
                _ => log::debug!("skipping malformed range line: {line:?}"),
            }
        }

        if closing > opening {
            break;
        }
    }

    ranges
}

/// Extracts the value between the last pair of parentheses, unquoting strings.
fn extract_value(line: &str) -> Option<&str> {
    let lparen = line.rfind('(')?;
    let rparen = lparen + 1 + line[lparen + 1..].find(')')?;
    let value = &line[lparen + 1..rparen];

    match value.strip_prefix('"').and_then(|x| x.strip_suffix('"')) {
        Some(unquoted) => Some(unquoted),
        None => Some(value),
    }
}

fn parse_hex(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"
out/Release/libfoo.so:	file format elf64-littleaarch64

.debug_info contents:
0x0000000b: DW_TAG_compile_unit
              DW_AT_producer	("clang version 17")
              DW_AT_name	("../../base/foo.cc")
              DW_AT_low_pc	(0x0000000000001000)
              DW_AT_high_pc	(0x0000000000001100)

0x00000030: DW_TAG_compile_unit
              DW_AT_name	("../../base/bar.cc")
              DW_AT_low_pc	(0x0000000000000000)
              DW_AT_ranges	(0x00000000
                 [0x0000000000002000, 0x0000000000002020)
                 [0x0000000000002100, 0x0000000000002100)
                 [0x0000000000003000, 0x0000000000003040))

0x00000050: DW_TAG_compile_unit
              DW_AT_name	("gen/base/baz.cc")
              DW_AT_low_pc	(0x0000000000004000)

0x00000070: DW_TAG_compile_unit
              DW_AT_GNU_dwo_name	("obj/base/qux.dwo")
              DW_AT_low_pc	(0x0000000000005000)
              DW_AT_high_pc	(0x0000000000005010)

0x00000090: DW_TAG_compile_unit
              DW_AT_name	("empty.cc")

0x000000b0: DW_TAG_compile_unit
              DW_AT_name	("/build/src/app/main.c")
              DW_AT_comp_dir	("/build/src/")
              DW_AT_low_pc	(0x0000000000006000)
              DW_AT_high_pc	(0x0000000000006040)
"#;

    #[test]
    fn dwarfdump() {
        let mapper = SourceMapper::from_dwarfdump(DUMP);
        assert_eq!(mapper.num_ranges(), 6);
        assert_eq!(mapper.num_paths(), 5);

        assert_eq!(mapper.find_source(0x1000), Some("../../base/foo.cc"));
        assert_eq!(mapper.find_source(0x10ff), Some("../../base/foo.cc"));
        assert_eq!(mapper.find_source(0x1100), None);
        assert_eq!(mapper.find_source(0x2010), Some("../../base/bar.cc"));
        assert_eq!(mapper.find_source(0x2100), None);
        assert_eq!(mapper.find_source(0x303f), Some("../../base/bar.cc"));
        assert_eq!(mapper.find_source(0x4000), Some("gen/base/baz.cc"));
        assert_eq!(mapper.find_source(0x4001), None);
        assert_eq!(mapper.find_source(0x5008), Some("obj/base/qux.dwo"));
        assert_eq!(mapper.find_source(0x10), None);
        assert_eq!(mapper.find_source(0x6020), Some("app/main.c"));

        assert_eq!(mapper.stats(), (11, 4));
        assert!((mapper.unmatched_ratio() - 4.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn garbage_lines() {
        let dump = "DW_TAG_compile_unit\n  DW_AT_name (\"a.c\")\n  DW_AT_low_pc (0xzz)\n  DW_AT_ranges (0x0\n  [nope, 0x10))\n";
        let mapper = SourceMapper::from_dwarfdump(dump);
        assert_eq!(mapper.num_ranges(), 0);
        assert_eq!(mapper.find_source(0), None);
    }

    #[test]
    fn values() {
        assert_eq!(extract_value("DW_AT_name\t(\"foo.cc\")"), Some("foo.cc"));
        assert_eq!(extract_value("DW_AT_low_pc (0x2)"), Some("0x2"));
        assert_eq!(extract_value("DW_AT_low_pc"), None);
        assert_eq!(parse_hex("0x0010"), Some(16));
    }

    #[test]
    fn source_paths() {
        assert_eq!(
            normalize_source_path("../../base/foo.cc"),
            ("base/foo.cc".to_owned(), false)
        );
        assert_eq!(
            normalize_source_path("gen/foo/bar.cc"),
            ("gen/foo/bar.cc".to_owned(), true)
        );
        assert_eq!(
            normalize_source_path("/usr/include/stdio.h"),
            ("usr/include/stdio.h".to_owned(), false)
        );
        assert_eq!(normalize_source_path("./../../base/a.cc").0, "base/a.cc");
    }

    #[test]
    fn comp_dir() {
        assert_eq!(strip_comp_dir("/tmp/work/a.c".into(), Some("/tmp/work")), "a.c");
        assert_eq!(strip_comp_dir("/tmp/work/a.c".into(), Some("/tmp/work/")), "a.c");
        assert_eq!(strip_comp_dir("/tmp/workspace/a.c".into(), Some("/tmp/work")), "/tmp/workspace/a.c");
        assert_eq!(strip_comp_dir("../../base/a.cc".into(), Some("/out/Release")), "../../base/a.cc");
        assert_eq!(strip_comp_dir("/src/a.c".into(), None), "/src/a.c");
        assert_eq!(strip_comp_dir("out/a.c".into(), Some("out")), "out/a.c");
    }

    #[test]
    fn dwarfdump_flags() {
        assert_eq!(DWARFDUMP_FLAGS, ["--debug-info", "--recurse-depth=0", "--summarize-types"]);
    }

    #[test]
    fn no_debug_info() {
        let data = crate::tests::build_object(&[crate::tests::TestSection {
            name: ".text",
            kind: object::SectionKind::Text,
            size: 4,
            symbols: &[],
        }]);
        let file = objfile::File::from_bytes(data);
        let mapper = SourceMapper::from_dwarf(&file.parse().unwrap()).unwrap();
        assert_eq!(mapper.num_ranges(), 0);
    }
}
