// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Implements a reader for the `.size` file format.

use super::*;
use crate::models::{AliasCluster, AliasKind, Container, ContainerKind, Flags, SectionName};
use crate::models::{SizeInfo, Symbol};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{self, Read as _};
use std::path::Path;

/// Reads and verifies the `.size` file at `path`.
pub fn read_path(path: &Path) -> Result<SizeInfo> {
    let data = std::fs::read(path).map_err(Error::Read)?;
    let info = read(&data)?;
    log::debug!("read {} symbols from {}", info.symbols.len(), path.display());
    Ok(info)
}

/// Parses a complete `.size` file.
///
/// The checksum is verified before anything else is looked at.
pub fn read(data: &[u8]) -> Result<SizeInfo> {
    let Some(body_len) = data.len().checked_sub(CHECKSUM_SIZE) else {
        return Err(Error::Truncated);
    };
    let (content, checksum) = data.split_at(body_len);
    if Sha256::digest(content).as_slice() != checksum {
        return Err(Error::ChecksumMismatch);
    }

    let mut info = SizeInfo::default();
    let mut body = read_header(content, &mut info)?;
    let body = &mut body;

    info.containers = read_containers(body)?;

    let pool_len = read_leb128(body)?;
    let mut pool = Vec::new();
    for _ in 0..pool_len {
        pool.push(read_str(body)?);
    }

    let num_segments = read_leb128(body)?;
    for _ in 0..num_segments {
        read_segment(body, &pool, &mut info)?;
    }

    let num_clusters = read_leb128(body)?;
    for idx in 0..num_clusters as usize {
        let start = read_leb128(body)?;
        let count = read_leb128(body)?;
        let kind = AliasKind::from_id(read_u8(body)?).ok_or(Error::InvalidCluster(idx))?;
        let end = start.checked_add(count).ok_or(Error::InvalidCluster(idx))?;
        if count < 2 || end > info.symbols.len() as u64 {
            return Err(Error::InvalidCluster(idx));
        }

        let cluster_idx = idx as u32;
        for sym in &mut info.symbols[start as usize..end as usize] {
            if sym.aliases.replace(cluster_idx).is_some() {
                return Err(Error::InvalidCluster(idx));
            }
        }
        info.clusters.push(AliasCluster {
            start: start as u32,
            count: count as u32,
            kind,
        });
    }

    if !body.is_empty() {
        return Err(Error::TrailingData(body.len()));
    }

    Ok(info)
}

/// Parses the textual header, returning the remaining body.
fn read_header<'a>(data: &'a [u8], info: &mut SizeInfo) -> Result<&'a [u8]> {
    let mut rest = data;
    let mut next_line = || -> Result<&'a str> {
        let cur: &'a [u8] = rest;
        let end = cur.iter().position(|&b| b == b'\n').ok_or(Error::Truncated)?;
        let line = std::str::from_utf8(&cur[..end]).map_err(|_| Error::InvalidString)?;
        rest = &cur[end + 1..];
        Ok(line)
    };

    if !next_line()?.starts_with(COMMON_HEADER) {
        return Err(Error::InvalidMagic);
    }

    let version_line = next_line()?;
    let Some(version) = version_line.strip_prefix(VERSION_PREFIX) else {
        return Err(Error::InvalidMagic);
    };
    if version != VERSION.to_string() {
        return Err(Error::UnsupportedVersion(version.to_owned()));
    }

    loop {
        let line = next_line()?;
        if line.is_empty() {
            break;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::InvalidHeader(line.to_owned()));
        };

        if key == BUILD_CONFIG_KEY {
            info.build_config = serde_json::from_str(value)?;
        } else {
            info.metadata.insert(key.to_owned(), serde_json::from_str(value)?);
        }
    }

    Ok(rest)
}

fn read_containers(body: &mut &[u8]) -> Result<Vec<Container>> {
    let count = read_leb128(body)?;
    let mut containers = Vec::new();
    for _ in 0..count {
        let name = read_str(body)?;
        let kind = read_str(body)?;
        let kind = ContainerKind::from_name(&kind).ok_or(Error::InvalidContainerKind(kind))?;
        let mut container = Container::new(name, kind);

        let num_metadata = read_leb128(body)?;
        for _ in 0..num_metadata {
            let key = read_str(body)?;
            let value = read_str(body)?;
            container.metadata.insert(key, value);
        }

        let num_sections = read_leb128(body)?;
        let mut section_sizes = BTreeMap::new();
        for _ in 0..num_sections {
            let section = read_section(body)?;
            section_sizes.insert(section, read_leb128(body)?);
        }
        container.section_sizes = section_sizes;

        containers.push(container);
    }
    Ok(containers)
}

fn read_segment(body: &mut &[u8], pool: &[String], info: &mut SizeInfo) -> Result {
    let container = read_leb128(body)?;
    if container >= info.containers.len() as u64 {
        return Err(Error::InvalidContainerIndex(container));
    }
    let container = container as u32;
    let section = read_section(body)?;
    let count = read_leb128(body)? as usize;

    // Guard allocations against absurd counts in corrupt files.
    if count > body.len() {
        return Err(Error::Truncated);
    }

    let first = info.symbols.len();
    let mut prev = 0u64;
    for _ in 0..count {
        let address = prev.wrapping_add(zigzag_decode(read_leb128(body)?) as u64);
        prev = address;
        info.symbols.push(Symbol {
            section,
            address,
            container,
            ..Default::default()
        });
    }
    let syms = &mut info.symbols[first..];

    let mut prev = 0u64;
    for sym in syms.iter_mut() {
        sym.size_without_padding = prev.wrapping_add(zigzag_decode(read_leb128(body)?) as u64);
        prev = sym.size_without_padding;
    }

    for sym in syms.iter_mut() {
        sym.padding = read_leb128(body)?;
    }

    for column in 0..6 {
        for sym in syms.iter_mut() {
            let idx = read_leb128(body)?;
            let s = pool.get(idx as usize).ok_or(Error::InvalidStringIndex(idx))?.clone();
            match column {
                0 => sym.full_name = s,
                1 => sym.template_name = s,
                2 => sym.name = s,
                3 => sym.object_path = s,
                4 => sym.source_path = s,
                _ => sym.component = s,
            }
        }
    }

    for sym in syms.iter_mut() {
        let flags = read_leb128(body)?;
        sym.flags = Flags(u32::try_from(flags).map_err(|_| Error::ValueOutOfRange(flags))?);
    }

    Ok(())
}

fn read_section(body: &mut &[u8]) -> Result<SectionName> {
    let id = read_u8(body)?;
    SectionName::from_id(id).ok_or(Error::InvalidSection(id))
}

fn read_u8(body: &mut &[u8]) -> Result<u8> {
    let mut buf = [0u8];
    body.read_exact(&mut buf).map_err(map_eof)?;
    Ok(buf[0])
}

fn read_str(body: &mut &[u8]) -> Result<String> {
    let len = read_leb128(body)? as usize;
    if len > body.len() {
        return Err(Error::Truncated);
    }
    let data: &[u8] = *body;
    let (s, rest) = data.split_at(len);
    *body = rest;
    String::from_utf8(s.to_vec()).map_err(|_| Error::InvalidString)
}

fn map_eof(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::Truncated
    } else {
        Error::Read(e)
    }
}

/// Read an ULEB-128 encoded variable-length integer.
fn read_leb128(body: &mut &[u8]) -> Result<u64> {
    let mut result = 0;
    let mut shift = 0;
    let mut buf = [0u8];

    for _ in 0..10 {
        body.read_exact(&mut buf).map_err(map_eof)?;
        result |= ((buf[0] & 0x7F) as u64) << shift;

        if buf[0] & 0x80 == 0 {
            return Ok(result);
        }

        shift += 7;
    }

    Err(Error::VarIntTooLong)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leb128() {
        assert!(matches!(read_leb128(&mut &[0xE5, 0x8E, 0xA6][..]), Err(Error::Truncated)));
        assert!(matches!(read_leb128(&mut &[][..]), Err(Error::Truncated)));
        assert!(matches!(read_leb128(&mut &[0x95, 0x9a, 0xef, 0x3a][..]), Ok(123456789)));
        assert!(matches!(
            read_leb128(&mut &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01][..]),
            Ok(u64::MAX),
        ));
        assert!(matches!(read_leb128(&mut &[0x80, 0x01][..]), Ok(128)));
        assert!(matches!(read_leb128(&mut &[0xff; 11][..]), Err(Error::VarIntTooLong)));
    }

    #[test]
    fn header() {
        let mut info = SizeInfo::default();
        let data = b"# Created by //tools/binary_size\nSize File Format v1\nbuild_config={\"title\":\"x\"}\nfoo=\"bar\"\n\nBODY";
        let rest = read_header(data, &mut info).unwrap();
        assert_eq!(rest, b"BODY");
        assert_eq!(info.build_config["title"], "x");
        assert_eq!(info.metadata["foo"], "bar");

        let data = b"# Created by //tools/binary_size\nSize File Format v1\nno equals sign\n\n";
        assert!(matches!(read_header(data, &mut info), Err(Error::InvalidHeader(_))));

        let data = b"garbage\n";
        assert!(matches!(read_header(data, &mut info), Err(Error::InvalidMagic)));
    }

    #[test]
    fn segments_reference_containers() {
        let mut info = SizeInfo::default();
        info.containers.push(Container::new("a", ContainerKind::Native));
        let pool = vec![String::new()];

        // container 5 doesn't exist
        let mut body: &[u8] = &[5, b't', 0];
        assert!(matches!(
            read_segment(&mut body, &pool, &mut info),
            Err(Error::InvalidContainerIndex(5))
        ));

        // one symbol referencing string 3
        let mut body: &[u8] = &[0, b't', 1, 0x20, 8, 0, 3];
        assert!(matches!(
            read_segment(&mut body, &pool, &mut info),
            Err(Error::InvalidStringIndex(3))
        ));
    }
}
