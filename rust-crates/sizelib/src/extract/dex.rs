// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Symbol extraction from DEX files.
//!
//! Every class becomes a `.dex` symbol sized by its `class_def_item` and
//! `class_data_item`; every method with code becomes a `.dex.method` symbol
//! sized by its `code_item`. Whatever is left (string data, type and proto
//! tables, annotations, ...) is reported as one unattributed symbol.

use super::{Error, Result};
use crate::funcsig;
use crate::models::{SectionName, Symbol};
use crate::VirtAddr;
use std::collections::HashMap;

/// Full name of the symbol holding all bytes not attributed to a class or method.
pub const UNATTRIBUTED_NAME: &str = "** .dex (unattributed - includes string literals)";

const HEADER_SIZE: usize = 0x70;
const CLASS_DEF_SIZE: u64 = 32;
const CODE_ITEM_HEADER_SIZE: u64 = 16;
const TRY_ITEM_SIZE: u64 = 8;

/// Symbols of one DEX file.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DexSymbols {
    pub symbols: Vec<Symbol>,
    /// Total of `.dex` symbols, unattributed bytes included.
    pub dex_size: u64,
    /// Total of `.dex.method` symbols.
    pub method_size: u64,
}

/// Maps class names to source paths, read from `.jar.info` files.
///
/// Each line holds `fully.qualified.Class,path/to/Source.java`.
#[derive(Debug, Default, Clone)]
pub struct JarInfo(HashMap<String, String>);

impl JarInfo {
    /// Parses the contents of a `.jar.info` file.
    pub fn parse(text: &str) -> Self {
        let map = text
            .lines()
            .filter_map(|line| line.split_once(','))
            .map(|(class, path)| (class.trim().to_owned(), path.trim().to_owned()))
            .collect();
        JarInfo(map)
    }

    /// Merges the entries of another side file.
    pub fn extend(&mut self, other: JarInfo) {
        self.0.extend(other.0);
    }

    /// Looks up a class, falling back to the outer class of nested ones.
    pub fn lookup(&self, class: &str) -> Option<&str> {
        if let Some(path) = self.0.get(class) {
            return Some(path);
        }
        let outer = &class[..class.find('$')?];
        self.0.get(outer).map(String::as_str)
    }
}

/// Little-endian reader over the bytes of a DEX file.
#[derive(Clone, Copy)]
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(data: &'a [u8], pos: usize) -> Self {
        Cursor { data, pos }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(Error::BadDex("offset overflow"))?;
        let out = self.data.get(self.pos..end).ok_or(Error::BadDex("truncated"))?;
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn uleb(&mut self) -> Result<u32> {
        let mut result = 0u32;
        for i in 0..5 {
            let byte = self.bytes(1)?[0];
            result |= u32::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(Error::BadDex("uleb128 too long"))
    }

    fn sleb(&mut self) -> Result<i32> {
        let mut result = 0i32;
        let mut shift = 0;
        loop {
            let byte = self.bytes(1)?[0];
            result |= i32::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 32 && byte & 0x40 != 0 {
                    result |= -1 << shift;
                }
                return Ok(result);
            }
            if shift >= 35 {
                return Err(Error::BadDex("sleb128 too long"));
            }
        }
    }
}

/// Parsed index tables of a DEX file.
struct Dex<'a> {
    data: &'a [u8],
    string_ids: (usize, usize),
    type_ids: (usize, usize),
    proto_ids: (usize, usize),
    method_ids: (usize, usize),
    class_defs: (usize, usize),
}

impl<'a> Dex<'a> {
    fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE || &data[..4] != b"dex\n" {
            return Err(Error::BadDex("bad magic"));
        }

        let table = |off: usize| -> Result<(usize, usize)> {
            let mut c = Cursor::at(data, off);
            let size = c.u32()? as usize;
            let offset = c.u32()? as usize;
            Ok((size, offset))
        };

        Ok(Dex {
            data,
            string_ids: table(0x38)?,
            type_ids: table(0x40)?,
            proto_ids: table(0x48)?,
            method_ids: table(0x58)?,
            class_defs: table(0x60)?,
        })
    }

    fn item(&self, table: (usize, usize), idx: usize, item_size: usize) -> Result<Cursor<'a>> {
        if idx >= table.0 {
            return Err(Error::BadDex("index out of range"));
        }
        Ok(Cursor::at(self.data, table.1 + idx * item_size))
    }

    fn string(&self, idx: u32) -> Result<String> {
        let off = self.item(self.string_ids, idx as usize, 4)?.u32()?;
        let mut c = Cursor::at(self.data, off as usize);
        c.uleb()?; // UTF-16 length
        let rest = self.data.get(c.pos..).ok_or(Error::BadDex("truncated"))?;
        let len = rest.iter().position(|&x| x == 0).ok_or(Error::BadDex("unterminated string"))?;
        // MUTF-8 only differs from UTF-8 for NUL and supplementary characters.
        Ok(String::from_utf8_lossy(&rest[..len]).into_owned())
    }

    fn type_name(&self, idx: u32) -> Result<String> {
        let descriptor_idx = self.item(self.type_ids, idx as usize, 4)?.u32()?;
        Ok(java_type_name(&self.string(descriptor_idx)?))
    }

    fn method_name(&self, idx: u32) -> Result<String> {
        let mut m = self.item(self.method_ids, idx as usize, 8)?;
        let class_idx = m.u16()?;
        let proto_idx = m.u16()?;
        let name_idx = m.u32()?;

        let mut p = self.item(self.proto_ids, proto_idx as usize, 12)?;
        let _shorty = p.u32()?;
        let return_idx = p.u32()?;
        let params_off = p.u32()?;

        let mut params = Vec::new();
        if params_off != 0 {
            let mut c = Cursor::at(self.data, params_off as usize);
            for _ in 0..c.u32()? {
                params.push(self.type_name(u32::from(c.u16()?))?);
            }
        }

        Ok(format!(
            "{} {} {}({})",
            self.type_name(u32::from(class_idx))?,
            self.type_name(return_idx)?,
            self.string(name_idx)?,
            params.join(","),
        ))
    }

    /// Byte length of the `code_item` at `off`.
    fn code_item_size(&self, off: usize) -> Result<u64> {
        let mut c = Cursor::at(self.data, off);
        c.bytes(6)?; // registers, ins, outs
        let tries_size = c.u16()?;
        c.u32()?; // debug_info_off
        let insns_size = c.u32()?;

        let mut size = CODE_ITEM_HEADER_SIZE + 2 * u64::from(insns_size);
        if tries_size == 0 {
            return Ok(size);
        }

        if insns_size % 2 == 1 {
            size += 2;
        }
        size += TRY_ITEM_SIZE * u64::from(tries_size);

        let handlers_start = off + size as usize;
        let mut h = Cursor::at(self.data, handlers_start);
        for _ in 0..h.uleb()? {
            let count = h.sleb()?;
            for _ in 0..count.unsigned_abs() {
                h.uleb()?; // type_idx
                h.uleb()?; // addr
            }
            if count <= 0 {
                h.uleb()?; // catch_all_addr
            }
        }

        Ok(size + (h.pos - handlers_start) as u64)
    }
}

/// Converts a type descriptor into its Java source form.
///
/// `Lorg/chromium/Foo$Bar;` becomes `org.chromium.Foo$Bar`, `[I` becomes `int[]`.
pub fn java_type_name(descriptor: &str) -> String {
    let dims = descriptor.bytes().take_while(|&x| x == b'[').count();
    let base = &descriptor[dims..];
    let mut name = match base {
        "V" => "void".to_owned(),
        "Z" => "boolean".to_owned(),
        "B" => "byte".to_owned(),
        "S" => "short".to_owned(),
        "C" => "char".to_owned(),
        "I" => "int".to_owned(),
        "J" => "long".to_owned(),
        "F" => "float".to_owned(),
        "D" => "double".to_owned(),
        _ => base
            .strip_prefix('L')
            .and_then(|x| x.strip_suffix(';'))
            .unwrap_or(base)
            .replace('/', "."),
    };
    for _ in 0..dims {
        name.push_str("[]");
    }
    name
}

fn make_symbol(section: SectionName, address: VirtAddr, size: u64, raw_name: &str) -> Symbol {
    let parsed = funcsig::parse_java(raw_name);
    Symbol {
        section,
        address,
        size_without_padding: size,
        full_name: parsed.full_name,
        template_name: parsed.template_name,
        name: parsed.name,
        ..Default::default()
    }
}

/// Extracts class and method symbols from a DEX file.
///
/// Symbol addresses are file offsets shifted by `base`, which keeps the
/// symbols of several DEX files within one container apart.
pub fn extract(
    data: &[u8],
    base: VirtAddr,
    object_path: &str,
    jar_info: &JarInfo,
) -> Result<DexSymbols> {
    let dex = Dex::parse(data)?;
    let mut out = DexSymbols::default();

    for class_idx in 0..dex.class_defs.0 {
        let class_off = dex.class_defs.1 + class_idx * CLASS_DEF_SIZE as usize;
        let mut c = dex.item(dex.class_defs, class_idx, CLASS_DEF_SIZE as usize)?;
        let type_idx = c.u32()?;
        c.bytes(20)?; // access_flags .. annotations_off
        let class_data_off = c.u32()? as usize;

        let class_name = dex.type_name(type_idx)?;
        let source_path = jar_info.lookup(&class_name).unwrap_or_default().to_owned();
        let mut class_size = CLASS_DEF_SIZE;
        let mut methods = Vec::new();

        if class_data_off != 0 {
            let mut d = Cursor::at(data, class_data_off);
            let static_fields = d.uleb()?;
            let instance_fields = d.uleb()?;
            let direct_methods = d.uleb()?;
            let virtual_methods = d.uleb()?;

            for _ in 0..u64::from(static_fields) + u64::from(instance_fields) {
                d.uleb()?; // field_idx_diff
                d.uleb()?; // access_flags
            }

            for count in [direct_methods, virtual_methods] {
                let mut method_idx = 0u32;
                for _ in 0..count {
                    method_idx = method_idx.wrapping_add(d.uleb()?);
                    d.uleb()?; // access_flags
                    let code_off = d.uleb()?;
                    if code_off != 0 {
                        methods.push((method_idx, code_off as usize));
                    }
                }
            }

            class_size += (d.pos - class_data_off) as u64;
        }

        let mut sym = make_symbol(SectionName::Dex, base + class_off as u64, class_size, &class_name);
        sym.object_path = object_path.to_owned();
        sym.source_path.clone_from(&source_path);
        out.dex_size += class_size;
        out.symbols.push(sym);

        for (method_idx, code_off) in methods {
            let size = dex.code_item_size(code_off)?;
            let raw_name = dex.method_name(method_idx)?;
            let mut sym = make_symbol(SectionName::DexMethod, base + code_off as u64, size, &raw_name);
            sym.object_path = object_path.to_owned();
            sym.source_path.clone_from(&source_path);
            out.method_size += size;
            out.symbols.push(sym);
        }
    }

    // Code items shared by several methods are only counted once.
    let mut seen = std::collections::HashSet::new();
    let shared: u64 = out
        .symbols
        .iter()
        .filter(|x| x.section == SectionName::DexMethod)
        .filter(|x| !seen.insert(x.address))
        .map(|x| x.size_without_padding)
        .sum();
    out.method_size -= shared;

    let attributed = out.dex_size + out.method_size;
    let total = data.len() as u64;
    let Some(unattributed) = total.checked_sub(attributed) else {
        return Err(Error::BadDex("classes and methods exceed the file size"));
    };

    if unattributed > 0 {
        let mut sym = Symbol::new(SectionName::Dex, 0, unattributed, UNATTRIBUTED_NAME);
        sym.object_path = object_path.to_owned();
        out.symbols.push(sym);
        out.dex_size += unattributed;
    }

    log::debug!(
        "{object_path}: {} classes, {} dex symbols",
        dex.class_defs.0,
        out.symbols.len()
    );

    Ok(out)
}
