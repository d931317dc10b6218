// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Symbol extraction from `.pak` resource packs.
//!
//! Two on-disk versions exist:
//!
//! - v4: `u32 version, u32 count, u8 encoding` followed by `count + 1`
//!   `(u16 id, u32 offset)` entries. Aliases are entries sharing an offset.
//! - v5: `u32 version, u8 encoding, [u8; 3], u16 count, u16 alias_count`
//!   followed by `count + 1` entries and `alias_count` `(u16 id, u16 index)`
//!   alias records.
//!
//! The last entry of both versions is a sentinel marking the end of the
//! final resource.

use super::{Error, Result};
use crate::models::{Flags, SectionName, Symbol, OVERHEAD_PREFIX};
use crate::VirtAddr;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write as _;

const ENTRY_SIZE: u64 = 6;
const V5_ALIAS_SIZE: u64 = 4;

/// Resources smaller than this are never flagged as uncompressed.
const MIN_COMPRESSIBLE_SIZE: usize = 100;

/// Compressed-to-raw ratio at or above which content counts as uncompressible.
const UNCOMPRESSED_RATIO: f64 = 0.9;

/// Resource names and sources, read from `.pak.info` files.
///
/// Each line holds `name,id,source_path`.
#[derive(Debug, Default, Clone)]
pub struct PakInfo(HashMap<u16, (String, String)>);

impl PakInfo {
    /// Parses the contents of a `.pak.info` file. Malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut map = HashMap::new();
        for line in text.lines() {
            let mut parts = line.splitn(3, ',');
            let (Some(name), Some(id), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            let Ok(id) = id.trim().parse() else {
                log::debug!("skipping malformed pak info line: {line:?}");
                continue;
            };
            map.insert(id, (name.trim().to_owned(), path.trim().to_owned()));
        }
        PakInfo(map)
    }

    /// Merges the entries of another side file.
    pub fn extend(&mut self, other: PakInfo) {
        self.0.extend(other.0);
    }

    fn lookup(&self, id: u16) -> Option<(&str, &str)> {
        self.0.get(&id).map(|(name, path)| (name.as_str(), path.as_str()))
    }
}

/// Assigns non-overlapping address ranges to the pak files of a section.
#[derive(Debug, Default)]
pub struct Layout(HashMap<SectionName, VirtAddr>);

impl Layout {
    fn place(&mut self, section: SectionName, size: u64) -> VirtAddr {
        let cursor = self.0.entry(section).or_insert(0);
        let base = *cursor;
        *cursor += size;
        base
    }
}

/// Section a pak file's resources are attributed to.
///
/// Locale packs are named after their locale: `en-GB.pak`, `fil.pak`.
pub fn section_for(file_name: &str) -> SectionName {
    if file_name.contains('-') || file_name.len() <= 7 {
        SectionName::PakTranslations
    } else {
        SectionName::PakNontranslated
    }
}

/// Parsed resource table.
#[derive(Debug)]
struct Pak {
    header_size: u64,
    /// `(id, offset)`, sentinel included.
    entries: Vec<(u16, u32)>,
    /// `(id, entry index)`.
    aliases: Vec<(u16, u16)>,
}

fn u16_at(data: &[u8], off: usize) -> Result<u16> {
    let b = data.get(off..off + 2).ok_or(Error::BadPak("truncated"))?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn u32_at(data: &[u8], off: usize) -> Result<u32> {
    let b = data.get(off..off + 4).ok_or(Error::BadPak("truncated"))?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

impl Pak {
    fn parse(data: &[u8]) -> Result<Self> {
        let (header_size, count, alias_count) = match u32_at(data, 0)? {
            4 => (9, u32_at(data, 4)? as usize, 0),
            5 => (12, u16_at(data, 8)? as usize, u16_at(data, 10)? as usize),
            _ => return Err(Error::BadPak("unsupported version")),
        };

        let table_size = (count as u64 + 1) * ENTRY_SIZE + alias_count as u64 * V5_ALIAS_SIZE;
        if header_size as u64 + table_size > data.len() as u64 {
            return Err(Error::BadPak("resource table exceeds file size"));
        }

        let mut entries = Vec::with_capacity(count + 1);
        for i in 0..=count {
            let off = header_size + i * ENTRY_SIZE as usize;
            entries.push((u16_at(data, off)?, u32_at(data, off + 2)?));
        }

        let aliases_start = header_size + (count + 1) * ENTRY_SIZE as usize;
        let mut aliases = Vec::with_capacity(alias_count);
        for i in 0..alias_count {
            let off = aliases_start + i * V5_ALIAS_SIZE as usize;
            let alias = (u16_at(data, off)?, u16_at(data, off + 2)?);
            if alias.1 as usize >= count {
                return Err(Error::BadPak("alias index out of range"));
            }
            aliases.push(alias);
        }

        let in_bounds = entries.windows(2).all(|w| w[0].1 <= w[1].1)
            && entries.last().is_some_and(|x| x.1 as usize <= data.len());
        if !in_bounds {
            return Err(Error::BadPak("resource offsets out of order"));
        }

        Ok(Pak {
            header_size: header_size as u64,
            entries,
            aliases,
        })
    }
}

/// Checks whether content barely shrinks when compressed.
fn is_uncompressible(content: &[u8]) -> bool {
    if content.len() < MIN_COMPRESSIBLE_SIZE {
        return false;
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    let compressed = encoder
        .write_all(content)
        .and_then(|()| encoder.finish());

    match compressed {
        Ok(compressed) => compressed.len() as f64 / content.len() as f64 >= UNCOMPRESSED_RATIO,
        Err(_) => false,
    }
}

/// Symbols of one pak file.
#[derive(Debug, Clone, PartialEq)]
pub struct PakSymbols {
    pub section: SectionName,
    pub symbols: Vec<Symbol>,
}

fn resource_symbol(
    section: SectionName,
    address: VirtAddr,
    size: u64,
    id: u16,
    file_name: &str,
    info: &PakInfo,
) -> Symbol {
    let (name, source_path) = match info.lookup(id) {
        Some((name, path)) => (name.to_owned(), path.to_owned()),
        None => (id.to_string(), String::new()),
    };

    let full_name = if source_path.is_empty() {
        format!("{file_name}: {name}")
    } else {
        format!("{source_path}: {name}")
    };

    Symbol {
        section,
        address,
        size_without_padding: size,
        full_name,
        template_name: name.clone(),
        name,
        object_path: file_name.to_owned(),
        source_path,
        ..Default::default()
    }
}

/// Extracts one symbol per resource, plus an overhead symbol for the header.
///
/// Resources sharing their payload get the same address: the first one
/// carries the payload and its table entry, the others only their own table
/// entry.
pub fn extract(path: &str, data: &[u8], layout: &mut Layout, info: &PakInfo) -> Result<PakSymbols> {
    let file_name = super::file_name(path);
    let section = section_for(file_name);
    let pak = Pak::parse(data)?;
    let base = layout.place(section, data.len() as u64);

    let overhead = pak.header_size + ENTRY_SIZE;
    let mut symbols = vec![Symbol::new(
        section,
        0,
        overhead,
        &format!("{OVERHEAD_PREFIX}{path}"),
    )];

    let resources = &pak.entries[..pak.entries.len() - 1];
    let mut payers: HashMap<u32, usize> = HashMap::new();
    for (idx, &(id, start)) in resources.iter().enumerate() {
        let address = base + u64::from(start);

        if payers.contains_key(&start) {
            // v4 alias: same payload referenced by an earlier entry.
            symbols.push(resource_symbol(section, address, ENTRY_SIZE, id, path, info));
            continue;
        }

        // The payload runs up to the next distinct offset, sentinel included.
        let end = pak.entries[idx + 1..]
            .iter()
            .map(|x| x.1)
            .find(|&x| x > start)
            .unwrap_or(start);
        let payload = &data[start as usize..end as usize];
        let mut sym = resource_symbol(
            section,
            address,
            payload.len() as u64 + ENTRY_SIZE,
            id,
            path,
            info,
        );
        if section == SectionName::PakNontranslated && is_uncompressible(payload) {
            sym.flags |= Flags::UNCOMPRESSED;
        }

        payers.insert(start, idx);
        symbols.push(sym);
    }

    for &(id, entry_idx) in &pak.aliases {
        let address = base + u64::from(pak.entries[entry_idx as usize].1);
        symbols.push(resource_symbol(section, address, V5_ALIAS_SIZE, id, path, info));
    }

    let total: u64 = symbols.iter().map(|x| x.size_without_padding).sum();
    if total != data.len() as u64 {
        log::warn!("{path}: resources account for {total} of {} bytes", data.len());
    }

    Ok(PakSymbols { section, symbols })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a v5 pak with the given resources and `(alias id, entry index)` pairs.
    pub(crate) fn build_pak(resources: &[(u16, &[u8])], aliases: &[(u16, u16)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(5u32.to_le_bytes());
        out.extend([1, 0, 0, 0]);
        out.extend((resources.len() as u16).to_le_bytes());
        out.extend((aliases.len() as u16).to_le_bytes());

        let data_start = 12 + 6 * (resources.len() + 1) + 4 * aliases.len();
        let mut offset = data_start as u32;
        for (id, content) in resources {
            out.extend(id.to_le_bytes());
            out.extend(offset.to_le_bytes());
            offset += content.len() as u32;
        }
        out.extend(0u16.to_le_bytes());
        out.extend(offset.to_le_bytes());

        for (id, idx) in aliases {
            out.extend(id.to_le_bytes());
            out.extend(idx.to_le_bytes());
        }
        for (_, content) in resources {
            out.extend(*content);
        }
        out
    }

    #[test]
    fn resources_and_aliases() {
        let data = build_pak(&[(100, b"hello world"), (101, b"abc")], &[(102, 0)]);
        let info = PakInfo::parse("IDR_HELLO,100,ui/hello.txt\nIDR_ABC,101,ui/abc.txt\nIDR_ALIAS,102,ui/alias.txt\n");
        let mut layout = Layout::default();
        let out = extract("assets/resources.pak", &data, &mut layout, &info).unwrap();

        assert_eq!(out.section, SectionName::PakNontranslated);
        let sizes: Vec<_> = out
            .symbols
            .iter()
            .map(|x| (x.full_name.as_str(), x.size_without_padding))
            .collect();
        assert_eq!(
            sizes,
            [
                ("Overhead: assets/resources.pak", 18),
                ("ui/hello.txt: IDR_HELLO", 11 + 6),
                ("ui/abc.txt: IDR_ABC", 3 + 6),
                ("ui/alias.txt: IDR_ALIAS", 4),
            ]
        );

        // The alias shares the payload address.
        assert_eq!(out.symbols[1].address, out.symbols[3].address);
        assert_eq!(out.symbols[1].name, "IDR_HELLO");
        assert_eq!(out.symbols[1].source_path, "ui/hello.txt");

        let total: u64 = out.symbols.iter().map(|x| x.size_without_padding).sum();
        assert_eq!(total, data.len() as u64);

        // A second file in the same section doesn't overlap the first.
        let second = extract("assets/resources.pak", &data, &mut layout, &info).unwrap();
        assert_eq!(second.symbols[1].address, out.symbols[1].address + data.len() as u64);
    }

    #[test]
    fn v4_duplicate_offsets() {
        let mut data = Vec::new();
        data.extend(4u32.to_le_bytes());
        data.extend(2u32.to_le_bytes());
        data.push(1);
        let start = 9 + 6 * 3;
        for (id, off) in [(1u16, start), (2, start), (0, start + 5)] {
            data.extend(id.to_le_bytes());
            data.extend((off as u32).to_le_bytes());
        }
        data.extend(b"12345");

        let out = extract("fr.pak", &data, &mut Layout::default(), &PakInfo::default()).unwrap();
        assert_eq!(out.section, SectionName::PakTranslations);
        let sizes: Vec<_> = out.symbols.iter().map(|x| x.size_without_padding).collect();
        assert_eq!(sizes, [15, 5 + 6, 6]);
        assert_eq!(out.symbols[1].full_name, "fr.pak: 1");
        assert_eq!(out.symbols[1].address, out.symbols[2].address);
        assert_eq!(sizes.iter().sum::<u64>(), data.len() as u64);
    }

    #[test]
    fn v4_shared_payload_between_distinct_ones() {
        // Entries 2 and 3 share a payload that sits between two others.
        let mut data = Vec::new();
        data.extend(4u32.to_le_bytes());
        data.extend(4u32.to_le_bytes());
        data.push(1);
        let start = 9 + 6 * 5;
        let offsets = [(1u16, start), (2, start + 3), (3, start + 3), (4, start + 7), (0, start + 9)];
        for (id, off) in offsets {
            data.extend(id.to_le_bytes());
            data.extend((off as u32).to_le_bytes());
        }
        data.extend(b"abcdefghi");

        let out = extract("de.pak", &data, &mut Layout::default(), &PakInfo::default()).unwrap();
        let sizes: Vec<_> = out
            .symbols
            .iter()
            .map(|x| (x.full_name.as_str(), x.size_without_padding))
            .collect();
        assert_eq!(
            sizes,
            [
                ("Overhead: de.pak", 15),
                ("de.pak: 1", 3 + 6),
                ("de.pak: 2", 4 + 6),
                ("de.pak: 3", 6),
                ("de.pak: 4", 2 + 6),
            ]
        );
        let total: u64 = out.symbols.iter().map(|x| x.size_without_padding).sum();
        assert_eq!(total, data.len() as u64);
    }

    #[test]
    fn oversized_resource_count() {
        // A v4 header claiming u32::MAX resources in a 9 byte file.
        let mut data = Vec::new();
        data.extend(4u32.to_le_bytes());
        data.extend(u32::MAX.to_le_bytes());
        data.push(1);
        let err = extract("x.pak", &data, &mut Layout::default(), &PakInfo::default()).unwrap_err();
        assert!(matches!(err, Error::BadPak("resource table exceeds file size")));
        assert_eq!(err.kind(), crate::ErrorKind::MalformedInput);

        // Same for a v5 header whose alias table doesn't fit.
        let mut data = build_pak(&[(1, b"abc")], &[]);
        data[10..12].copy_from_slice(&u16::MAX.to_le_bytes());
        assert!(matches!(
            extract("x.pak", &data, &mut Layout::default(), &PakInfo::default()),
            Err(Error::BadPak("resource table exceeds file size"))
        ));
    }

    #[test]
    fn uncompressible() {
        let zeros = vec![0u8; 4096];
        assert!(!is_uncompressible(&zeros));

        // xorshift noise doesn't compress.
        let mut x = 0x2545F491u32;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect();
        assert!(is_uncompressible(&noise));
        assert!(!is_uncompressible(&noise[..50]));
    }

    #[test]
    fn sections() {
        assert_eq!(section_for("en-GB.pak"), SectionName::PakTranslations);
        assert_eq!(section_for("fil.pak"), SectionName::PakTranslations);
        assert_eq!(section_for("resources.pak"), SectionName::PakNontranslated);
    }

    #[test]
    fn malformed() {
        assert!(matches!(
            extract("x.pak", b"\x07\0\0\0", &mut Layout::default(), &PakInfo::default()),
            Err(Error::BadPak("unsupported version"))
        ));
        let mut data = build_pak(&[(1, b"abc")], &[]);
        data.truncate(data.len() - 1);
        assert!(extract("x.pak", &data, &mut Layout::default(), &PakInfo::default()).is_err());
    }
}
