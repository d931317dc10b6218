// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Implements the `.size` file format.
//!
//! A `.size` file starts with a textual header:
//!
//! ```text
//! # Created by //tools/binary_size
//! Size File Format v1
//! build_config={"git_revision":"abc123"}
//! timestamp="1700000000"
//!
//! ```
//!
//! Every header value is JSON encoded; `build_config` holds an object, all
//! other keys are [`SizeInfo::metadata`] strings. The blank line is followed
//! by the binary body. All integers in the body are ULEB-128 var-ints
//! unless noted otherwise; signed deltas are zig-zag encoded.
//!
//! 1. Containers: count, then per container its name, kind, metadata pairs
//!    and `(section id: u8, size)` pairs. Strings are length-prefixed.
//! 2. String pool: count, then length-prefixed strings in order of first
//!    appearance within the symbol stream.
//! 3. Segments: count, then per `(container, section)` segment the
//!    container index, the section id (`u8`), the symbol count and the
//!    columns `address` (delta), `size_without_padding` (delta), `padding`,
//!    the six string columns as pool indices and `flags`.
//! 4. Alias clusters: count, then `(start, count, kind: u8)` triplets.
//!
//! The file ends with the SHA-256 of every preceding byte.
//!
//! [`SizeInfo::metadata`]: crate::models::SizeInfo::metadata

pub mod read;
mod strpool;
pub mod write;

pub use read::{read, read_path};
pub use write::{write, write_path, Writer};

/// First line of every `.size` file.
const COMMON_HEADER: &str = "# Created by //tools/binary_size";

/// Prefix of the version line.
const VERSION_PREFIX: &str = "Size File Format v";

/// Format version written by this implementation.
const VERSION: u32 = 1;

/// Header key holding the JSON encoded build config.
const BUILD_CONFIG_KEY: &str = "build_config";

/// Length of the SHA-256 trailer.
const CHECKSUM_SIZE: usize = 32;

/// Result type used throughout this module.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur when reading or writing `.size` files.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("File does not start with the expected header")]
    InvalidMagic,

    #[error("Size file format version {} is unsupported", .0)]
    UnsupportedVersion(String),

    #[error("Malformed header line: {:?}", .0)]
    InvalidHeader(String),

    #[error("Header key {:?} cannot be stored", .0)]
    InvalidKey(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("File ended prematurely")]
    Truncated,

    #[error("Variable-length integer is too big")]
    VarIntTooLong,

    #[error("Invalid section id {}", .0)]
    InvalidSection(u8),

    #[error("Invalid container kind {:?}", .0)]
    InvalidContainerKind(String),

    #[error("Reference to container {} out of range", .0)]
    InvalidContainerIndex(u64),

    #[error("String pool reference {} out of range", .0)]
    InvalidStringIndex(u64),

    #[error("Alias cluster {} is invalid", .0)]
    InvalidCluster(usize),

    #[error("String is not valid UTF-8")]
    InvalidString,

    #[error("{} unexpected bytes after the alias cluster table", .0)]
    TrailingData(usize),

    #[error("Value {} doesn't fit its column", .0)]
    ValueOutOfRange(u64),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    #[error("unable to read size file")]
    Read(#[source] std::io::Error),

    #[error("IO error")]
    IO(#[from] std::io::Error),
}

impl Error {
    /// Classification into the fatal error taxonomy.
    pub fn kind(&self) -> crate::ErrorKind {
        use crate::ErrorKind as K;
        match self {
            Error::IO(_) => K::Io,
            Error::InvalidKey(_) => K::InvariantViolation,
            _ => K::MalformedInput,
        }
    }
}

/// Maps signed integers to unsigned ones, keeping small magnitudes small.
fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
fn zigzag_decode(v: u64) -> i64 {
    (v >> 1) as i64 ^ -((v & 1) as i64)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::*;

    /// A small size info with two containers, aliases and metadata.
    pub(crate) fn make_test_info() -> SizeInfo {
        let mut apk = Container::new("Foo.apk", ContainerKind::Apk);
        apk.metadata.insert(keys::ZIPALIGN_OVERHEAD.into(), "12".into());
        apk.metadata.insert(keys::SIGNING_BLOCK_SIZE.into(), "4096".into());
        apk.section_sizes.insert(SectionName::Other, 300);
        apk.section_sizes.insert(SectionName::PakNontranslated, 128);

        let mut lib = Container::new("Foo.apk/lib/arm64-v8a/libfoo.so", ContainerKind::Native);
        lib.metadata.insert(keys::ELF_BUILD_ID.into(), "deadbeef".into());
        lib.section_sizes.insert(SectionName::Text, 0x58);

        let sym = |container, section, address, size, padding, name: &str| Symbol {
            container,
            padding,
            object_path: "obj/foo.o".into(),
            source_path: if name.is_empty() { String::new() } else { "foo.cc".into() },
            ..Symbol::new(section, address, size, name)
        };

        let mut symbols = vec![
            sym(0, SectionName::PakNontranslated, 0x40, 106, 0, "IDR_A"),
            sym(0, SectionName::PakNontranslated, 0x40, 4, 0, "IDR_B"),
            sym(0, SectionName::PakNontranslated, 0, 18, 0, "Overhead: a.pak"),
            sym(0, SectionName::Other, 0x100, 200, 0, "res/a.png"),
            sym(0, SectionName::Other, 0, 100, 0, APK_OVERHEAD_NAME),
            sym(1, SectionName::Text, 0x1000, 16, 8, "foo()"),
            sym(1, SectionName::Text, 0x1018, 40, 0, "bar()"),
            sym(1, SectionName::Text, 0x1018, 40, 0, "baz()"),
        ];
        symbols[5].flags = Flags::STARTUP | Flags::ANONYMOUS;
        symbols[6].template_name = "bar<>()".into();
        symbols[7].component = "Blink>DOM".into();
        symbols[0].aliases = Some(0);
        symbols[1].aliases = Some(0);
        symbols[6].aliases = Some(1);
        symbols[7].aliases = Some(1);

        let mut info = SizeInfo {
            containers: vec![apk, lib],
            symbols,
            clusters: vec![
                AliasCluster { start: 0, count: 2, kind: AliasKind::Pak },
                AliasCluster { start: 6, count: 2, kind: AliasKind::Shared },
            ],
            ..Default::default()
        };
        info.metadata.insert(keys::TIMESTAMP.into(), "1700000000".into());
        info.metadata.insert(keys::SOURCE_COMMIT.into(), "0123abcd".into());
        info.build_config.insert(keys::BUILD_CONFIG_GN_ARGS.into(), "is_debug=false\nsymbol_level=1".into());
        info
    }

    #[test]
    fn zigzag() {
        for v in [0, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            assert_eq!(zigzag_decode(zigzag_encode(v)), v);
        }
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
    }

    #[test]
    fn round_trip() {
        let info = make_test_info();
        let mut buf = Vec::new();
        write(&info, &mut buf).unwrap();

        let read_back = read(&buf).unwrap();
        assert_eq!(read_back, info);

        // Writing the result again yields the very same bytes.
        let mut buf2 = Vec::new();
        write(&read_back, &mut buf2).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn header_is_textual() {
        let mut buf = Vec::new();
        write(&make_test_info(), &mut buf).unwrap();

        let header_end = buf.windows(2).position(|w| w == b"\n\n").unwrap();
        let header = std::str::from_utf8(&buf[..header_end]).unwrap();
        let lines: Vec<_> = header.lines().collect();
        assert_eq!(lines[0], COMMON_HEADER);
        assert_eq!(lines[1], "Size File Format v1");
        assert_eq!(
            lines[2],
            r#"build_config={"gn_args":"is_debug=false\nsymbol_level=1"}"#
        );
        assert!(lines.contains(&r#"timestamp="1700000000""#));
    }

    #[test]
    fn corruption_is_detected() {
        let mut buf = Vec::new();
        write(&make_test_info(), &mut buf).unwrap();

        let mut flipped = buf.clone();
        let mid = flipped.len() / 2;
        flipped[mid] ^= 0x40;
        assert!(matches!(read(&flipped), Err(Error::ChecksumMismatch)));

        assert!(read(&buf[..buf.len() - 1]).is_err());
        assert!(matches!(read(b"hello"), Err(Error::Truncated | Error::InvalidMagic)));

        let text = String::from_utf8_lossy(&buf).replace("Format v1", "Format v9");
        let err = read(text.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch | Error::UnsupportedVersion(_)));
        assert_eq!(err.kind(), crate::ErrorKind::MalformedInput);
    }

    #[test]
    fn unknown_version() {
        use sha2::{Digest, Sha256};

        let mut buf = format!("{COMMON_HEADER}\n{VERSION_PREFIX}2\n\n").into_bytes();
        let digest = Sha256::digest(&buf);
        buf.extend_from_slice(&digest);

        assert!(matches!(read(&buf), Err(Error::UnsupportedVersion(v)) if v == "2"));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.size");
        let info = make_test_info();

        write_path(&info, &path).unwrap();
        assert_eq!(read_path(&path).unwrap(), info);

        // No temporary files are left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);

        let missing = read_path(&dir.path().join("missing.size")).unwrap_err();
        assert_eq!(missing.kind(), crate::ErrorKind::MalformedInput);
    }
}
