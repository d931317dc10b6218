// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! APK / AAB container parsing.
//!
//! The ZIP layout (entry offsets, extra fields, signing block) is read
//! directly from the central directory since the `zip` crate doesn't expose
//! local headers. Entry contents are then decompressed through `zip`.
//!
//! Every entry either feeds one of the specialized extractors or becomes a
//! single `.other` symbol. Native libraries are extracted into containers of
//! their own, so that their address spaces don't collide.

use super::{dex, native, pak, pool, Error, Extraction, Options, Result};
use crate::models::{keys, Container, ContainerKind, SectionName, Symbol, APK_OVERHEAD_NAME};
use crate::objfile;
use std::collections::HashMap;
use std::io::{self, Read as _};

const EOCD_MAGIC: u32 = 0x0605_4b50;
const CENTRAL_MAGIC: u32 = 0x0201_4b50;
const LOCAL_MAGIC: u32 = 0x0403_4b50;
const EOCD_SIZE: usize = 22;
const CENTRAL_HEADER_SIZE: usize = 46;
const LOCAL_HEADER_SIZE: usize = 30;
const MAX_COMMENT_SIZE: usize = 0xFFFF;

/// Trailing magic of the APK Signing Block (signature schemes v2 and v3).
const SIGNING_BLOCK_MAGIC: &[u8; 16] = b"APK Sig Block 42";

/// Prefix of module entries in app bundles and split APKs.
const BASE_PREFIX: &str = "base/";

/// Maps obfuscated resource paths back to their original names.
#[derive(Debug, Default, Clone)]
pub struct PathMap(HashMap<String, String>);

impl PathMap {
    /// Parses a `.pathmap.txt` file: `original -> obfuscated` lines.
    pub fn parse_pathmap(text: &str) -> Self {
        let pairs = text.lines().filter_map(|line| line.split_once(" -> "));
        Self::from_pairs(pairs)
    }

    /// Parses a res-info file: `original\tobfuscated` lines.
    pub fn parse_res_info(text: &str) -> Self {
        let pairs = text.lines().filter_map(|line| line.split_once('\t'));
        Self::from_pairs(pairs)
    }

    fn from_pairs<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> Self {
        PathMap(
            pairs
                .map(|(orig, obf)| (obf.trim().to_owned(), orig.trim().to_owned()))
                .collect(),
        )
    }

    /// Merges the entries of another map.
    pub fn extend(&mut self, other: PathMap) {
        self.0.extend(other.0);
    }

    /// Number of mapped paths.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks up the original path of an entry.
    ///
    /// Module prefixes are ignored when the map doesn't know the full name.
    pub fn lookup(&self, path: &str) -> Option<&str> {
        if let Some(orig) = self.0.get(path) {
            return Some(orig);
        }

        match path.strip_prefix(BASE_PREFIX) {
            Some(stripped) => self.0.get(stripped),
            None => self.0.get(&format!("{BASE_PREFIX}{path}")),
        }
        .map(String::as_str)
    }
}

/// Side files consulted while extracting an APK.
#[derive(Debug, Default, Clone)]
pub struct SideFiles {
    pub pathmap: PathMap,
    pub jar_info: dex::JarInfo,
    pub pak_info: pak::PakInfo,
}

/// An APK entry as laid out in the ZIP file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: String,
    /// Index in the central directory.
    index: usize,
    compressed: u64,
    uncompressed: u64,
    /// Offset of the entry's data within the APK.
    data_offset: u64,
    /// Length of the local and central extra fields.
    extra: u64,
}

/// Physical layout of the ZIP file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ZipLayout {
    entries: Vec<Entry>,
    signing_block: u64,
}

fn read_u16(data: &[u8], off: usize) -> Result<u16> {
    data.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| Error::BadApk(format!("truncated at offset {off}")))
}

fn read_u32(data: &[u8], off: usize) -> Result<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::BadApk(format!("truncated at offset {off}")))
}

fn read_u64(data: &[u8], off: usize) -> Result<u64> {
    let lo = read_u32(data, off)?;
    let hi = read_u32(data, off + 4)?;
    Ok(u64::from(hi) << 32 | u64::from(lo))
}

fn find_eocd(data: &[u8]) -> Result<usize> {
    let Some(last) = data.len().checked_sub(EOCD_SIZE) else {
        return Err(Error::BadApk("file too small".into()));
    };

    let first = last.saturating_sub(MAX_COMMENT_SIZE);
    (first..=last)
        .rev()
        .find(|&off| read_u32(data, off).is_ok_and(|x| x == EOCD_MAGIC))
        .ok_or_else(|| Error::BadApk("no end of central directory record".into()))
}

/// Measures the APK Signing Block immediately preceding the central directory.
fn signing_block_size(data: &[u8], cd_offset: usize) -> Result<u64> {
    let Some(magic_start) = cd_offset.checked_sub(SIGNING_BLOCK_MAGIC.len()) else {
        return Ok(0);
    };
    if &data[magic_start..cd_offset] != SIGNING_BLOCK_MAGIC {
        return Ok(0);
    }

    // The size field excludes itself, so the block is 8 bytes larger.
    let Some(size_start) = magic_start.checked_sub(8) else {
        return Err(Error::BadApk("truncated signing block".into()));
    };
    let size = read_u64(data, size_start)?;
    let total = size + 8;
    let start = (cd_offset as u64)
        .checked_sub(total)
        .ok_or_else(|| Error::BadApk("signing block exceeds file".into()))?;
    if read_u64(data, start as usize)? != size {
        return Err(Error::BadApk("signing block size mismatch".into()));
    }

    Ok(total)
}

impl ZipLayout {
    fn parse(data: &[u8]) -> Result<Self> {
        let eocd = find_eocd(data)?;
        let num_entries = read_u16(data, eocd + 10)? as usize;
        let cd_offset = read_u32(data, eocd + 16)? as usize;
        if cd_offset > eocd {
            return Err(Error::BadApk("central directory out of bounds".into()));
        }

        let mut entries = Vec::with_capacity(num_entries);
        let mut pos = cd_offset;
        for index in 0..num_entries {
            if read_u32(data, pos)? != CENTRAL_MAGIC {
                return Err(Error::BadApk(format!("bad central directory entry {index}")));
            }

            let compressed = read_u32(data, pos + 20)?;
            let uncompressed = read_u32(data, pos + 24)?;
            let name_len = read_u16(data, pos + 28)? as usize;
            let extra_len = read_u16(data, pos + 30)? as usize;
            let comment_len = read_u16(data, pos + 32)? as usize;
            let local_offset = read_u32(data, pos + 42)? as usize;
            if compressed == u32::MAX || uncompressed == u32::MAX || local_offset == u32::MAX as usize {
                return Err(Error::BadApk("zip64 archives are not supported".into()));
            }

            let name_start = pos + CENTRAL_HEADER_SIZE;
            let name = data
                .get(name_start..name_start + name_len)
                .ok_or_else(|| Error::BadApk("truncated entry name".into()))?;
            let name = String::from_utf8_lossy(name).into_owned();

            if read_u32(data, local_offset)? != LOCAL_MAGIC {
                return Err(Error::BadApk(format!("{name}: bad local header")));
            }
            let local_name_len = read_u16(data, local_offset + 26)? as usize;
            let local_extra_len = read_u16(data, local_offset + 28)? as usize;

            entries.push(Entry {
                name,
                index,
                compressed: u64::from(compressed),
                uncompressed: u64::from(uncompressed),
                data_offset: (local_offset + LOCAL_HEADER_SIZE + local_name_len + local_extra_len) as u64,
                extra: (local_extra_len + extra_len) as u64,
            });

            pos = name_start + name_len + extra_len + comment_len;
        }

        Ok(ZipLayout {
            entries,
            signing_block: signing_block_size(data, cd_offset)?,
        })
    }

    fn zipalign_overhead(&self) -> u64 {
        self.entries.iter().map(|x| x.extra).sum()
    }
}

/// What to do with an APK entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Native,
    Dex,
    Pak,
    Other,
}

fn route(name: &str) -> Route {
    if name.ends_with(".so") && name.contains("lib/") {
        Route::Native
    } else if name.ends_with(".dex") {
        Route::Dex
    } else if name.ends_with(".pak") {
        Route::Pak
    } else {
        Route::Other
    }
}

/// Name of the symbol and source path for an entry not analyzed further.
fn other_names<'a>(name: &'a str, pathmap: &'a PathMap) -> (&'a str, String) {
    match pathmap.lookup(name) {
        Some(orig) => (orig, orig.to_owned()),
        None => (name, format!("apk::{name}")),
    }
}

/// Extracts the symbols of an APK or AAB.
///
/// The first returned extraction describes the APK itself, followed by one
/// extraction per native library in entry order.
pub fn extract(
    name: &str,
    file: &objfile::File,
    side: &SideFiles,
    opts: &Options<'_>,
) -> Result<Vec<Extraction>> {
    let data = file.data();
    let layout = ZipLayout::parse(data)?;
    let mut archive = zip::ZipArchive::new(io::Cursor::new(data))?;

    let kind = if name.ends_with(".aab") {
        ContainerKind::Aab
    } else {
        ContainerKind::Apk
    };
    let mut out = Extraction::new(Container::new(name, kind));

    let mut read_entry = |entry: &Entry| -> Result<Vec<u8>> {
        let zf = archive.by_index(entry.index)?;
        let mut buf = Vec::new();
        zf.take(entry.uncompressed).read_to_end(&mut buf)?;
        Ok(buf)
    };

    let mut natives = Vec::new();
    let mut pak_layout = pak::Layout::default();
    let mut pak_names = Vec::new();
    let mut dex_base = 0;
    let mut compression_savings = 0i64;
    let mut total_compressed = 0;
    let mut embedded_size = 0;

    for entry in &layout.entries {
        total_compressed += entry.compressed;
        if entry.name.ends_with('/') {
            continue;
        }

        let route = route(&entry.name);
        if route != Route::Other {
            compression_savings += entry.uncompressed as i64 - entry.compressed as i64;
        }

        match route {
            Route::Native => {
                let content = read_entry(entry)?;
                embedded_size += content.len() as u64;
                natives.push(native::NativeInput {
                    name: entry.name.clone(),
                    file: objfile::File::from_bytes(content),
                    path: None,
                    apk_path: Some(entry.name.clone()),
                    mtime: None,
                });
            }
            Route::Dex => {
                let content = read_entry(entry)?;
                let dex = dex::extract(&content, dex_base, &entry.name, &side.jar_info)
                    .map_err(|e| e.in_input(&entry.name))?;
                dex_base += content.len() as u64;
                out.add_section_size(SectionName::Dex, dex.dex_size);
                out.add_section_size(SectionName::DexMethod, dex.method_size);
                out.symbols.extend(dex.symbols);
            }
            Route::Pak => {
                let content = read_entry(entry)?;
                let pak = pak::extract(&entry.name, &content, &mut pak_layout, &side.pak_info)
                    .map_err(|e| e.in_input(&entry.name))?;
                out.add_section_size(pak.section, content.len() as u64);
                out.symbols.extend(pak.symbols);
                pak_names.push(entry.name.clone());
            }
            Route::Other => {
                let (full_name, source_path) = other_names(&entry.name, &side.pathmap);
                let mut sym = Symbol::new(SectionName::Other, entry.data_offset, entry.compressed, full_name);
                sym.object_path = entry.name.clone();
                sym.source_path = source_path;
                out.add_section_size(SectionName::Other, entry.compressed);
                out.symbols.push(sym);
            }
        }
    }

    let apk_size = data.len() as u64;
    let zipalign = layout.zipalign_overhead();
    let overhead = apk_size as i64 - total_compressed as i64 - zipalign as i64 - layout.signing_block as i64;
    if overhead < 0 {
        return Err(Error::NegativeOverhead {
            name: format!("{APK_OVERHEAD_NAME} ({name})"),
            size: overhead,
        });
    }
    out.symbols.push(Symbol::new(SectionName::Other, 0, overhead as u64, APK_OVERHEAD_NAME));
    out.add_section_size(SectionName::Other, overhead as u64);

    let meta = &mut out.container.metadata;
    meta.insert(keys::APK_FILE_NAME.into(), super::file_name(name).to_owned());
    meta.insert(keys::APK_SIZE.into(), apk_size.to_string());
    meta.insert(keys::ZIPALIGN_OVERHEAD.into(), zipalign.to_string());
    meta.insert(keys::SIGNING_BLOCK_SIZE.into(), layout.signing_block.to_string());
    meta.insert(keys::COMPRESSION_SAVINGS.into(), compression_savings.to_string());
    meta.insert(keys::EMBEDDED_LIBRARY_SIZE.into(), embedded_size.to_string());
    if !pak_names.is_empty() {
        meta.insert(keys::PAK_FILE_NAMES.into(), pak_names.join(","));
    }

    log::info!(
        "{name}: {} entries, {} native libraries, zipalign {zipalign}, signing block {}",
        layout.entries.len(),
        natives.len(),
        layout.signing_block,
    );

    let mut results = vec![out];
    results.extend(pool::run(natives, |input| {
        native::extract(&input, opts).map_err(|e| e.in_input(&input.name))
    })?);

    for native in &mut results[1..] {
        native.container.name = format!("{name}/{}", native.container.name);
    }

    Ok(results)
}
