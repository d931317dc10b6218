// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Symbol extraction from native executables, libraries and static archives.

use super::{Error, Extraction, Options, Result};
use crate::diag::Diagnostic;
use crate::demangle::demangle;
use crate::models::{keys, Container, ContainerKind, Flags, SectionName, Symbol, ELF_OVERHEAD_NAME};
use crate::objfile::{self, Format, SectionInfo};
use crate::srcmap::{self, SourceMapper};
use crate::toolchain::{Arch, Tool};
use crate::{funcsig, VirtAddr};
use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;

/// Address at which sections of relocatable objects are laid out.
const RELOC_BASE: VirtAddr = 0x1000;

/// Prefix of anonymous namespaces in demangled names.
const ANONYMOUS_NAMESPACE: &str = "(anonymous namespace)::";

/// A native binary to extract symbols from.
pub struct NativeInput {
    /// Build-relative name, e.g. `libfoo.so` or `lib/arm64-v8a/libfoo.so`.
    pub name: String,
    /// File contents.
    pub file: objfile::File,
    /// Location on disk, if the binary isn't embedded in another container.
    pub path: Option<PathBuf>,
    /// Path of the APK the binary was found in.
    pub apk_path: Option<String>,
    /// Modification time in seconds since the epoch.
    pub mtime: Option<u64>,
}

/// Extracts the symbols of one native binary.
pub fn extract(input: &NativeInput, opts: &Options<'_>) -> Result<Extraction> {
    let members = input.file.members()?;
    let Some(first) = members.first() else {
        return Err(Error::Unsupported(format!("{}: archive is empty", input.name)));
    };

    let arch = Arch::from_object(first.reader.architecture());
    let mut container = Container::new(input.name.clone(), ContainerKind::Native);
    let meta = &mut container.metadata;
    meta.insert(
        keys::ELF_ARCH.into(),
        match arch {
            Some(arch) => arch.as_str().to_owned(),
            None => format!("{:?}", first.reader.architecture()).to_lowercase(),
        },
    );
    meta.insert(keys::ELF_FILE_NAME.into(), input.name.clone());
    if let Some(build_id) = first.reader.build_id()? {
        meta.insert(keys::ELF_BUILD_ID.into(), build_id);
    }
    if let Some(mtime) = input.mtime {
        meta.insert(keys::ELF_MTIME.into(), mtime.to_string());
    }
    if let Some(apk_path) = &input.apk_path {
        meta.insert(keys::ELF_APK_PATH.into(), apk_path.clone());
    }

    let mut out = Extraction::new(container);

    let is_archive = members.iter().any(|x| x.name.is_some());
    let mut state = State::default();
    for member in &members {
        let object_path = match &member.name {
            Some(member_name) => format!("{}({member_name})", input.name),
            None if member.reader.is_relocatable() => input.name.clone(),
            None => String::new(),
        };

        let mapper = source_mapper(input, &member.reader, arch, opts)?;
        extract_object(&member.reader, &object_path, mapper.as_ref(), &mut state, &mut out);
        if let Some(mapper) = mapper {
            mapper.log_stats(&input.name);
            let (queries, unmatched) = mapper.stats();
            if unmatched > 0 {
                out.diagnostics.push(Diagnostic::UnmatchedAddresses {
                    binary: input.name.clone(),
                    unmatched,
                    queries,
                });
            }
        }
    }

    if !is_archive {
        let on_disk: u64 = first
            .reader
            .sections()
            .iter()
            .filter(|x| x.alloc)
            .map(|x| x.file_size)
            .sum();

        let overhead = input.file.len() as i64 - on_disk as i64;
        if overhead < 0 {
            return Err(Error::NegativeOverhead {
                name: format!("{ELF_OVERHEAD_NAME} ({})", input.name),
                size: overhead,
            });
        }
        if overhead > 0 {
            let mut sym = Symbol::new(SectionName::Other, 0, overhead as u64, ELF_OVERHEAD_NAME);
            sym.object_path = input.name.clone();
            out.symbols.push(sym);
            out.add_section_size(SectionName::Other, overhead as u64);
        }
    }

    log::debug!("{}: extracted {} symbols", input.name, out.symbols.len());
    Ok(out)
}

/// Creates the source mapper for a linked binary.
///
/// Relocatable objects have no final addresses and are never mapped.
fn source_mapper(
    input: &NativeInput,
    reader: &objfile::Reader<'_>,
    arch: Option<Arch>,
    opts: &Options<'_>,
) -> Result<Option<SourceMapper>> {
    if reader.is_relocatable() {
        return Ok(None);
    }

    if !opts.use_dwarfdump {
        return match SourceMapper::from_dwarf(reader) {
            Ok(mapper) => Ok(Some(mapper)),
            Err(e) => {
                log::warn!("{}: unable to read DWARF, skipping source paths: {e}", input.name);
                Ok(None)
            }
        };
    }

    let Some(arch) = arch else {
        return Err(Error::Unsupported(format!(
            "{}: no dwarfdump for architecture {:?}",
            input.name,
            reader.architecture(),
        )));
    };

    let dwarfdump = opts.resolver.resolve(Tool::Dwarfdump, arch)?;
    let mapper = match &input.path {
        Some(path) => SourceMapper::run_dwarfdump(&dwarfdump, path)?,
        None => {
            // Embedded binary: the tool needs a file on disk.
            let mut temp = tempfile::NamedTempFile::new()?;
            temp.write_all(input.file.data())?;
            temp.flush()?;
            SourceMapper::run_dwarfdump(&dwarfdump, temp.path())?
        }
    };

    Ok(Some(mapper))
}

/// State carried across the members of a static archive.
#[derive(Debug, Default)]
struct State {
    /// Next free synthetic address per section, for relocatable objects.
    cursors: HashMap<SectionName, VirtAddr>,
    /// Counter for `** symbol gap` names.
    num_gaps: u32,
}

impl State {
    /// Assigns a synthetic address range to a section of a relocatable object.
    fn place(&mut self, section: SectionName, size: u64) -> VirtAddr {
        let cursor = self.cursors.entry(section).or_insert(RELOC_BASE);
        let base = *cursor;
        *cursor += size;
        base
    }

    fn next_gap_name(&mut self, end_of_section: bool) -> String {
        let n = self.num_gaps;
        self.num_gaps += 1;
        if end_of_section {
            format!("** symbol gap {n} (end of section)")
        } else {
            format!("** symbol gap {n}")
        }
    }
}

/// Object file section mapped into a [`SectionName`].
struct MappedSection<'obj> {
    info: SectionInfo<'obj>,
    section: SectionName,
    flags: Flags,
    /// Address of the section in the symbol address space.
    base: VirtAddr,
}

impl MappedSection<'_> {
    fn end(&self) -> VirtAddr {
        self.base + self.info.virt_size
    }
}

fn extract_object(
    reader: &objfile::Reader<'_>,
    object_path: &str,
    mapper: Option<&SourceMapper>,
    state: &mut State,
    out: &mut Extraction,
) {
    let format = reader.format();
    let relocatable = reader.is_relocatable();
    let sections = reader.sections();

    // Thread-local symbols of linked images are offsets into the TLS segment,
    // which starts with the first TLS section.
    let tls_start = sections
        .iter()
        .filter(|x| x.tls && !relocatable)
        .map(|x| x.virt_addr)
        .min();

    let mut mapped = Vec::new();
    for info in sections {
        if !info.alloc {
            continue;
        }

        match map_section(format, &info) {
            Some((section, flags)) => {
                let base = if relocatable {
                    state.place(section, info.virt_size)
                } else {
                    info.virt_addr
                };

                out.add_section_size(section, info.virt_size);
                out.section_ranges.push((section, base..base + info.virt_size));
                mapped.push(MappedSection {
                    info,
                    section,
                    flags: if relocatable { flags } else { Flags::default() },
                    base,
                });
            }
            None if info.file_size > 0 => {
                let name = format!("** ELF Section: {}", info.name);
                let mut sym = Symbol::new(SectionName::Other, 0, info.file_size, &name);
                sym.object_path = object_path.to_owned();
                out.symbols.push(sym);
                out.add_section_size(SectionName::Other, info.file_size);
            }
            None => {}
        }
    }

    // Raw symbols per mapped section: (address, size, name).
    let mut by_section: HashMap<usize, Vec<(VirtAddr, u64, &str)>> = HashMap::new();
    for sym in reader.symbols() {
        // ARM mapping symbols ($a, $d, $t, $x).
        if sym.name.starts_with('$') {
            continue;
        }

        let Some(sec) = mapped.iter().find(|x| x.info.index == sym.section) else {
            continue;
        };

        let value = match tls_start {
            Some(start) if sym.tls => start + sym.virt_addr,
            _ => sym.virt_addr,
        };
        let addr = sec.base + value.saturating_sub(sec.info.virt_addr);
        by_section
            .entry(sec.info.index)
            .or_default()
            .push((addr, sym.length, sym.name));
    }

    for sec in &mapped {
        let mut raw = by_section.remove(&sec.info.index).unwrap_or_default();
        raw.sort_by(|a, b| (a.0, std::cmp::Reverse(a.1), a.2).cmp(&(b.0, std::cmp::Reverse(b.1), b.2)));
        raw.dedup_by(|b, a| a.0 == b.0 && a.2 == b.2);

        if format == Format::MachO {
            assign_macho_sizes(&mut raw, sec.end());
        }

        let raw = drop_shadowed(raw, sec.end());
        if raw.is_empty() {
            let name = format!("** ELF Section: {}", sec.info.name);
            let mut sym = Symbol::new(sec.section, sec.base, sec.info.virt_size, &name);
            sym.object_path = object_path.to_owned();
            if sec.info.virt_size > 0 {
                out.symbols.push(sym);
            }
            continue;
        }

        let first_addr = raw[0].0;
        let max_end = raw.iter().map(|x| x.0 + x.1).max().unwrap_or(first_addr);
        let track_gaps = sec.section != SectionName::Bss;

        if track_gaps && first_addr > sec.base {
            let name = state.next_gap_name(false);
            let mut sym = Symbol::new(sec.section, sec.base, first_addr - sec.base, &name);
            sym.object_path = object_path.to_owned();
            out.symbols.push(sym);
        }

        for (addr, size, raw_name) in raw {
            // Source mapping needs the address as seen by the debug info.
            let debug_addr = addr - sec.base + sec.info.virt_addr;
            out.symbols.push(make_symbol(
                sec,
                addr,
                size,
                raw_name,
                object_path,
                mapper.filter(|_| sec.section == SectionName::Text).map(|m| (m, debug_addr)),
            ));
        }

        if track_gaps && max_end < sec.end() {
            let name = state.next_gap_name(true);
            let mut sym = Symbol::new(sec.section, max_end, sec.end() - max_end, &name);
            sym.object_path = object_path.to_owned();
            out.symbols.push(sym);
        }
    }
}

fn make_symbol(
    sec: &MappedSection<'_>,
    addr: VirtAddr,
    size: u64,
    raw_name: &str,
    object_path: &str,
    mapper: Option<(&SourceMapper, VirtAddr)>,
) -> Symbol {
    let (parsed, name_flags) = normalize_name(raw_name, sec.section);
    let mut sym = Symbol {
        section: sec.section,
        address: addr,
        size_without_padding: size,
        full_name: parsed.full_name,
        template_name: parsed.template_name,
        name: parsed.name,
        object_path: object_path.to_owned(),
        flags: sec.flags | name_flags,
        ..Default::default()
    };

    if let Some(source) = mapper.and_then(|(m, addr)| m.find_source(addr)) {
        let (source, generated) = srcmap::normalize_source_path(source);
        // Linked images name no inputs; the compile unit stands in for one.
        if sym.object_path.is_empty() {
            sym.object_path = source.clone();
        }
        sym.source_path = source;
        if generated {
            sym.flags |= Flags::GENERATED_SOURCE;
        }
    }

    sym
}

/// Mach-O symbol tables carry no sizes: each symbol extends to the next
/// symbol with a higher address, or to the end of its section.
fn assign_macho_sizes(raw: &mut [(VirtAddr, u64, &str)], section_end: VirtAddr) {
    for idx in 0..raw.len() {
        let addr = raw[idx].0;
        let next = raw[idx + 1..]
            .iter()
            .map(|x| x.0)
            .find(|&x| x > addr)
            .unwrap_or(section_end);
        raw[idx].1 = next.saturating_sub(addr);
    }
}

/// Removes zero-size symbols (except at the section end) and symbols that
/// share their address with a bigger one.
///
/// Expects input sorted by `(address, -size)`.
fn drop_shadowed(raw: Vec<(VirtAddr, u64, &str)>, section_end: VirtAddr) -> Vec<(VirtAddr, u64, &str)> {
    let mut out: Vec<(VirtAddr, u64, &str)> = Vec::with_capacity(raw.len());
    for sym in raw {
        if sym.1 == 0 && sym.0 != section_end {
            continue;
        }

        if let Some(prev) = out.last() {
            if prev.0 == sym.0 && prev.1 != sym.1 {
                log::debug!("dropping {} shadowed by {} at {:#x}", sym.2, prev.2, sym.0);
                continue;
            }
            if sym.1 == 0 && prev.1 == 0 {
                continue;
            }
        }

        // Partial overlap: the earlier symbol (and its aliases) end where the
        // next one starts.
        let overlapped = out
            .last()
            .filter(|prev| prev.0 < sym.0 && prev.0 + prev.1 > sym.0)
            .map(|prev| prev.0);
        if let Some(start) = overlapped {
            log::debug!("truncating symbols at {start:#x} overlapping {} at {:#x}", sym.2, sym.0);
            for prev in out.iter_mut().rev().take_while(|x| x.0 == start) {
                prev.1 = sym.0 - start;
            }
        }

        out.push(sym);
    }
    out
}

/// Maps an object file section to a [`SectionName`] and input section flags.
///
/// Returns [`None`] for sections outside of the fixed mapping.
fn map_section(format: Format, info: &SectionInfo<'_>) -> Option<(SectionName, Flags)> {
    match format {
        Format::Elf => map_elf_section(info.name),
        Format::MachO => map_macho_section(info.segment.as_deref().unwrap_or(""), info.name),
    }
}

fn map_elf_section(name: &str) -> Option<(SectionName, Flags)> {
    let has_prefix = |prefix: &str| {
        name == prefix || name.strip_prefix(prefix).is_some_and(|x| x.starts_with('.'))
    };

    if has_prefix(".text") {
        let rest = &name[".text".len()..];
        let flags = if rest.starts_with(".startup") {
            Flags::STARTUP
        } else if rest.starts_with(".unlikely") {
            Flags::UNLIKELY
        } else if rest.starts_with(".hot") {
            Flags::HOT
        } else {
            Flags::default()
        };
        Some((SectionName::Text, flags))
    } else if has_prefix(".rodata") {
        Some((SectionName::Rodata, Flags::default()))
    } else if has_prefix(".data.rel.ro.local") {
        Some((SectionName::DataRelRo, Flags::REL_LOCAL))
    } else if has_prefix(".data.rel.ro") {
        Some((SectionName::DataRelRo, Flags::REL))
    } else if has_prefix(".data") || has_prefix(".tdata") {
        Some((SectionName::Data, Flags::default()))
    } else if has_prefix(".bss") || has_prefix(".tbss") {
        Some((SectionName::Bss, Flags::default()))
    } else {
        None
    }
}

fn map_macho_section(segment: &str, name: &str) -> Option<(SectionName, Flags)> {
    let section = match (segment, name) {
        (_, "__text") => SectionName::Text,
        ("__TEXT", "__const" | "__cstring") => SectionName::Rodata,
        ("__DATA_CONST", "__const" | "__cstring") => SectionName::DataRelRo,
        (_, "__data") => SectionName::Data,
        (_, "__bss" | "__common") => SectionName::Bss,
        _ => return None,
    };
    Some((section, Flags::default()))
}

/// Demangles and normalizes a native symbol name.
///
/// Clone suffixes are stripped, `vtable for X`-style prefixes are moved into
/// a `X [vtable]` suffix and anonymous namespaces are removed.
pub fn normalize_name(raw: &str, section: SectionName) -> (funcsig::ParsedName, Flags) {
    let demangled = demangle(raw);
    let mut flags = demangled.flags;
    let mut full_name: &str = &demangled.name;

    // GCC style demangler output, e.g. "foo() [clone .part.0]".
    if let Some(idx) = full_name.find(" [clone ") {
        full_name = &full_name[..idx];
        flags |= Flags::CLONE;
    }

    // C clones, e.g. "foo.123".
    if section == SectionName::Text {
        if let Some(idx) = full_name.rfind('.') {
            let (stem, digits) = (&full_name[..idx], &full_name[idx + 1..]);
            if !digits.is_empty()
                && digits.chars().all(|x| x.is_ascii_digit())
                && !matches!(stem, "__tcf_0" | "startup")
            {
                full_name = stem;
                flags |= Flags::CLONE;
            }
        }
    }

    let mut full_name = gnu_special_name(full_name).unwrap_or_else(|| full_name.to_owned());
    for infix in [" for ", " to "] {
        let window = &full_name[..floor_char_boundary(&full_name, 30)];
        if let Some(idx) = window.find(infix) {
            full_name = format!("{} [{}]", &full_name[idx + infix.len()..], &full_name[..idx]);
        }
    }

    let mut parsed = funcsig::parse(&full_name);
    parsed.full_name = parsed.full_name.replace(ANONYMOUS_NAMESPACE, "");
    parsed.template_name = parsed.template_name.replace(ANONYMOUS_NAMESPACE, "");
    if parsed.name.contains(ANONYMOUS_NAMESPACE) {
        parsed.name = parsed.name.replace(ANONYMOUS_NAMESPACE, "");
        flags |= Flags::ANONYMOUS;
    }

    (parsed, flags)
}

/// Rewrites the braced special names emitted by the demangler, e.g.
/// `{vtable(foo::Bar)}`, into the `vtable for foo::Bar` form used by GNU tools.
fn gnu_special_name(name: &str) -> Option<String> {
    let inner = name.strip_prefix('{')?.strip_suffix(")}")?;
    if let Some(ty) = inner.strip_prefix("vtable(") {
        return Some(format!("vtable for {ty}"));
    }
    if let Some(ty) = inner.strip_prefix("vtt(") {
        return Some(format!("VTT for {ty}"));
    }

    // Thunks: one or two call offsets, followed by the target function.
    let mut rest = inner.strip_prefix("virtual override thunk(")?;
    let mut offsets = Vec::new();
    while rest.starts_with('{') {
        let end = rest.find("}, ")?;
        offsets.push(&rest[..=end]);
        rest = &rest[end + 3..];
    }
    let kind = match offsets[..] {
        [this] if this.starts_with("{virtual offset(") => "virtual thunk",
        [_] => "non-virtual thunk",
        [_, _] => "covariant return thunk",
        _ => return None,
    };
    Some(format!("{kind} to {rest}"))
}

/// Largest char boundary `<= idx`.
fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
