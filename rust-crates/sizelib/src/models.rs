// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Core data model: symbols, alias clusters, containers and size infos.
//!
//! Symbols never point back into their container or cluster: both are
//! referenced through integer indices into the owning [`SizeInfo`].

use crate::VirtAddr;
use std::collections::BTreeMap;
use std::{fmt, ops};

/// Index of a [`Container`] within [`SizeInfo::containers`].
pub type ContainerIdx = u32;

/// Index of an [`AliasCluster`] within [`SizeInfo::clusters`].
pub type ClusterIdx = u32;

/// Full name prefix of overhead pseudo-symbols.
pub const OVERHEAD_PREFIX: &str = "Overhead: ";

/// Full name prefix of padding / unattributed pseudo-symbols.
pub const PSEUDO_PREFIX: &str = "** ";

/// Name of the pseudo-symbol collecting APK bytes not owned by any entry.
pub const APK_OVERHEAD_NAME: &str = "Overhead: APK file";

/// Name of the pseudo-symbol collecting ELF bytes outside of any section.
pub const ELF_OVERHEAD_NAME: &str = "Overhead: ELF file";

/// Name of the per-section pseudo-symbol aggregating nameless symbols.
pub const ANONYMOUS_AGGREGATE_NAME: &str = "** aggregate padding of anonymous symbols";

/// Coarse section bucket a symbol belongs to.
///
/// The declaration order doubles as the canonical sort order of sections
/// within a container.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionName {
    /// Executable code.
    Text,
    /// Read-only data.
    Rodata,
    /// Read-only-after-relocation data.
    DataRelRo,
    /// Initialized, writable data.
    Data,
    /// Zero-initialized data; never present on disk.
    Bss,
    /// DEX class definitions and other non-method DEX data.
    Dex,
    /// DEX methods.
    DexMethod,
    /// Resources in untranslated `.pak` files.
    PakNontranslated,
    /// Resources in locale `.pak` files.
    PakTranslations,
    /// Anything else: APK entries, ELF overhead, uncovered ELF sections.
    #[default]
    Other,
}

impl SectionName {
    /// All sections, in canonical order.
    pub const ALL: [SectionName; 10] = [
        SectionName::Text,
        SectionName::Rodata,
        SectionName::DataRelRo,
        SectionName::Data,
        SectionName::Bss,
        SectionName::Dex,
        SectionName::DexMethod,
        SectionName::PakNontranslated,
        SectionName::PakTranslations,
        SectionName::Other,
    ];

    /// Display name, e.g. `.text`.
    pub const fn as_str(self) -> &'static str {
        match self {
            SectionName::Text => ".text",
            SectionName::Rodata => ".rodata",
            SectionName::DataRelRo => ".data.rel.ro",
            SectionName::Data => ".data",
            SectionName::Bss => ".bss",
            SectionName::Dex => ".dex",
            SectionName::DexMethod => ".dex.method",
            SectionName::PakNontranslated => ".pak.nontranslated",
            SectionName::PakTranslations => ".pak.translations",
            SectionName::Other => ".other",
        }
    }

    /// Single character id used by the on-disk format.
    pub const fn id(self) -> u8 {
        match self {
            SectionName::Text => b't',
            SectionName::Rodata => b'r',
            SectionName::DataRelRo => b'R',
            SectionName::Data => b'd',
            SectionName::Bss => b'b',
            SectionName::Dex => b'x',
            SectionName::DexMethod => b'm',
            SectionName::PakNontranslated => b'P',
            SectionName::PakTranslations => b'p',
            SectionName::Other => b'o',
        }
    }

    /// Inverse of [`Self::id`].
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|x| x.id() == id)
    }

    /// Inverse of [`Self::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|x| x.as_str() == name)
    }

    /// Whether symbols in this section come from native binaries.
    pub const fn is_native(self) -> bool {
        matches!(
            self,
            SectionName::Text
                | SectionName::Rodata
                | SectionName::DataRelRo
                | SectionName::Data
                | SectionName::Bss
        )
    }

    /// Whether this section occupies bytes on disk.
    pub const fn is_on_disk(self) -> bool {
        !matches!(self, SectionName::Bss)
    }

    /// Whether this section holds DEX symbols.
    pub const fn is_dex(self) -> bool {
        matches!(self, SectionName::Dex | SectionName::DexMethod)
    }

    /// Whether this section holds `.pak` resources.
    pub const fn is_pak(self) -> bool {
        matches!(
            self,
            SectionName::PakNontranslated | SectionName::PakTranslations
        )
    }
}

impl fmt::Display for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bit set of symbol attributes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(pub u32);

impl Flags {
    /// Symbol lived in an anonymous namespace.
    pub const ANONYMOUS: Flags = Flags(1);
    /// Symbol was placed in a startup-only input section.
    pub const STARTUP: Flags = Flags(2);
    /// Symbol was placed in an unlikely-executed input section.
    pub const UNLIKELY: Flags = Flags(4);
    /// Data requiring relocation.
    pub const REL: Flags = Flags(8);
    /// Data requiring only local relocations.
    pub const REL_LOCAL: Flags = Flags(16);
    /// Symbol stems from a generated source file.
    pub const GENERATED_SOURCE: Flags = Flags(32);
    /// Symbol is a compiler-generated clone of another function.
    pub const CLONE: Flags = Flags(64);
    /// Symbol was placed in a hot input section.
    pub const HOT: Flags = Flags(128);
    /// Symbol is covered by code coverage instrumentation.
    pub const COVERED: Flags = Flags(256);
    /// Resource that doesn't compress well.
    pub const UNCOMPRESSED: Flags = Flags(512);

    const NAMES: [(Flags, &'static str); 10] = [
        (Self::ANONYMOUS, "anon"),
        (Self::STARTUP, "startup"),
        (Self::UNLIKELY, "unlikely"),
        (Self::REL, "rel"),
        (Self::REL_LOCAL, "rel.loc"),
        (Self::GENERATED_SOURCE, "gen"),
        (Self::CLONE, "clone"),
        (Self::HOT, "hot"),
        (Self::COVERED, "covered"),
        (Self::UNCOMPRESSED, "uncompressed"),
    ];

    /// Checks whether all bits of `other` are set.
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Checks whether no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Self) -> Self {
        Flags(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Formats as comma separated names, e.g. `anon,clone`.
impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A contiguous range of bytes attributed to a source symbol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Symbol {
    /// Section bucket.
    pub section: SectionName,
    /// Virtual address; 0 for aggregate and pseudo-symbols.
    pub address: VirtAddr,
    /// Bytes owned by the symbol itself.
    pub size_without_padding: u64,
    /// Bytes between this symbol and the next one in the same section.
    pub padding: u64,
    /// Demangled name, return type stripped.
    pub full_name: String,
    /// `full_name` without template arguments.
    pub template_name: String,
    /// `template_name` without parameter lists.
    pub name: String,
    /// Build-relative path of the compilation input.
    pub object_path: String,
    /// Repository-relative source path, empty when unknown.
    pub source_path: String,
    /// Owner tag, empty when unknown.
    pub component: String,
    pub flags: Flags,
    pub container: ContainerIdx,
    pub aliases: Option<ClusterIdx>,
}

impl Symbol {
    /// Creates a symbol with all names set to `full_name`.
    pub fn new(section: SectionName, address: VirtAddr, size: u64, full_name: &str) -> Self {
        Symbol {
            section,
            address,
            size_without_padding: size,
            full_name: full_name.to_owned(),
            template_name: full_name.to_owned(),
            name: full_name.to_owned(),
            ..Default::default()
        }
    }

    /// Section bucket of the symbol.
    pub fn section(&self) -> SectionName {
        self.section
    }

    /// `size_without_padding + padding`.
    pub fn size(&self) -> u64 {
        self.size_without_padding + self.padding
    }

    /// `Overhead: ...` pseudo-symbol.
    pub fn is_overhead(&self) -> bool {
        self.full_name.starts_with(OVERHEAD_PREFIX)
    }

    /// `** ...` pseudo-symbol (gaps, padding, unattributed ranges).
    pub fn is_pseudo(&self) -> bool {
        self.full_name.starts_with(PSEUDO_PREFIX)
    }

    /// Whether the symbol's bytes consist solely of padding placeholders.
    pub fn is_padding_only(&self) -> bool {
        self.full_name.starts_with("** symbol gap")
            || self.full_name.starts_with("** section ")
            || self.full_name == ANONYMOUS_AGGREGATE_NAME
    }

    /// Merged string literal placeholder.
    pub fn is_string_literal(&self) -> bool {
        self.full_name.starts_with('"') || self.full_name == "string literal"
    }

    /// Whether `full_name` identifies this symbol among its peers.
    pub fn is_name_unique(&self) -> bool {
        !(self.is_string_literal()
            || self.is_overhead()
            || self.full_name.starts_with('*')
            || (self.section().is_native() && self.full_name.contains('.')))
    }

    /// Path used to tell apart same-named symbols.
    pub fn id_path(&self) -> &str {
        if self.source_path.is_empty() {
            &self.object_path
        } else {
            &self.source_path
        }
    }
}

/// How the members of an [`AliasCluster`] share their bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AliasKind {
    /// Members occupy the very same bytes (identical code / data folding).
    Shared,
    /// `.pak` resources referencing the same payload. The first member pays
    /// for the payload, the others only for their table entry.
    Pak,
}

impl AliasKind {
    pub(crate) const fn id(self) -> u8 {
        match self {
            AliasKind::Shared => 0,
            AliasKind::Pak => 1,
        }
    }

    pub(crate) const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(AliasKind::Shared),
            1 => Some(AliasKind::Pak),
            _ => None,
        }
    }
}

/// Group of symbols occupying the same address range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasCluster {
    /// Index of the first member in [`SizeInfo::symbols`].
    pub start: u32,
    /// Number of members; always at least 2.
    pub count: u32,
    /// Sharing semantics.
    pub kind: AliasKind,
}

impl AliasCluster {
    /// Range of member indices in [`SizeInfo::symbols`].
    pub fn members(&self) -> ops::Range<usize> {
        self.start as usize..self.start as usize + self.count as usize
    }

    /// Bytes shared by the members of the cluster.
    pub fn size_without_padding(&self, symbols: &[Symbol]) -> u64 {
        match self.kind {
            AliasKind::Shared => symbols[self.start as usize].size_without_padding,
            AliasKind::Pak => symbols[self.members()]
                .iter()
                .map(|x| x.size_without_padding)
                .sum(),
        }
    }
}

/// Kind of on-disk artifact a [`Container`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    /// Android application package.
    Apk,
    /// Android app bundle.
    Aab,
    /// Loose native binary (ELF, mach-O or static archive).
    Native,
    /// Loose `.pak` files.
    Pak,
}

impl ContainerKind {
    /// Name as stored in `.size` files.
    pub const fn as_str(self) -> &'static str {
        match self {
            ContainerKind::Apk => "apk",
            ContainerKind::Aab => "aab",
            ContainerKind::Native => "native",
            ContainerKind::Pak => "pak",
        }
    }

    /// Inverse of [`Self::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        [
            ContainerKind::Apk,
            ContainerKind::Aab,
            ContainerKind::Native,
            ContainerKind::Pak,
        ]
        .into_iter()
        .find(|x| x.as_str() == name)
    }
}

/// An on-disk artifact that contributed symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub kind: ContainerKind,
    pub metadata: BTreeMap<String, String>,
    /// Total size of every section the container contributed to.
    pub section_sizes: BTreeMap<SectionName, u64>,
}

impl Container {
    /// Creates an empty container.
    pub fn new(name: impl Into<String>, kind: ContainerKind) -> Self {
        Container {
            name: name.into(),
            kind,
            metadata: BTreeMap::new(),
            section_sizes: BTreeMap::new(),
        }
    }
}

/// Metadata and build config keys.
pub mod keys {
    #![allow(missing_docs)]

    pub const APK_FILE_NAME: &str = "apk_file_name";
    pub const APK_SIZE: &str = "apk_size";
    pub const ZIPALIGN_OVERHEAD: &str = "zipalign_overhead";
    pub const SIGNING_BLOCK_SIZE: &str = "signing_block_size";
    pub const COMPRESSION_SAVINGS: &str = "compression_savings";
    pub const EMBEDDED_LIBRARY_SIZE: &str = "embedded_library_size";
    pub const ELF_ARCH: &str = "elf_arch";
    pub const ELF_BUILD_ID: &str = "elf_build_id";
    pub const ELF_FILE_NAME: &str = "elf_file_name";
    pub const ELF_MTIME: &str = "elf_mtime";
    pub const ELF_APK_PATH: &str = "elf_apk_path";
    pub const PAK_FILE_NAMES: &str = "pak_file_names";

    pub const SOURCE_COMMIT: &str = "source_commit";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SOURCE_MAPPER: &str = "source_mapper";
    pub const TOOL_VERSION: &str = "tool_version";

    pub const BUILD_CONFIG_GIT_REVISION: &str = "git_revision";
    pub const BUILD_CONFIG_GN_ARGS: &str = "gn_args";
    pub const BUILD_CONFIG_OUT_DIRECTORY: &str = "out_directory";
    pub const BUILD_CONFIG_TITLE: &str = "title";
    pub const BUILD_CONFIG_URL: &str = "url";
}

/// Finalized catalog of every attributed byte of one build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SizeInfo {
    pub containers: Vec<Container>,
    pub symbols: Vec<Symbol>,
    pub clusters: Vec<AliasCluster>,
    pub metadata: BTreeMap<String, String>,
    pub build_config: BTreeMap<String, String>,
}

impl SizeInfo {
    /// Proportional size of the symbol at `idx`, padding included.
    pub fn pss(&self, idx: usize) -> f64 {
        let sym = &self.symbols[idx];
        self.pss_without_padding(idx) + sym.padding as f64
    }

    /// Proportional size of the symbol at `idx`, padding excluded.
    pub fn pss_without_padding(&self, idx: usize) -> f64 {
        let sym = &self.symbols[idx];
        match sym.aliases.map(|x| &self.clusters[x as usize]) {
            Some(AliasCluster {
                kind: AliasKind::Shared,
                count,
                ..
            }) => sym.size_without_padding as f64 / f64::from(*count),
            _ => sym.size_without_padding as f64,
        }
    }

    /// Number of symbols sharing bytes with the symbol at `idx` (itself included).
    pub fn num_aliases(&self, idx: usize) -> u32 {
        match self.symbols[idx].aliases {
            Some(c) => self.clusters[c as usize].count,
            None => 1,
        }
    }

    /// Splits the symbol stream into `(container, section)` segments.
    ///
    /// Relies on the canonical ordering established by [`sort_symbols`].
    pub fn segments(&self) -> Vec<Segment> {
        let mut segments: Vec<Segment> = Vec::new();
        for (idx, sym) in self.symbols.iter().enumerate() {
            match segments.last_mut() {
                Some(seg) if seg.container == sym.container && seg.section == sym.section() => {
                    seg.range.end = idx + 1;
                }
                _ => segments.push(Segment {
                    container: sym.container,
                    section: sym.section(),
                    range: idx..idx + 1,
                }),
            }
        }
        segments
    }

    /// Total proportional size of all symbols within the given section.
    pub fn section_pss(&self, section: SectionName) -> f64 {
        (0..self.symbols.len())
            .filter(|&i| self.symbols[i].section() == section)
            .map(|i| self.pss(i))
            .sum()
    }
}

/// Run of symbols belonging to the same container and section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub container: ContainerIdx,
    pub section: SectionName,
    pub range: ops::Range<usize>,
}

/// Brings symbols into the canonical order.
///
/// Order is `(container, section, address with 0 last, -size_without_padding)`.
/// Ties keep their relative order, so repeated runs on the same input are
/// deterministic.
pub fn sort_symbols(symbols: &mut [Symbol]) {
    symbols.sort_by_key(|x| {
        (
            x.container,
            x.section(),
            x.address == 0,
            x.address,
            std::cmp::Reverse(x.size_without_padding),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_ids_round_trip() {
        for section in SectionName::ALL {
            assert_eq!(SectionName::from_id(section.id()), Some(section));
            assert_eq!(SectionName::from_name(section.as_str()), Some(section));
        }
        assert_eq!(SectionName::from_id(b'?'), None);
    }

    #[test]
    fn flags_display() {
        let flags = Flags::ANONYMOUS | Flags::CLONE | Flags::UNCOMPRESSED;
        assert_eq!(flags.to_string(), "anon,clone,uncompressed");
        assert!(flags.contains(Flags::CLONE));
        assert!(!flags.contains(Flags::HOT));
        assert_eq!(Flags::default().to_string(), "");
    }

    #[test]
    fn name_uniqueness() {
        let sym = |section, name: &str| Symbol::new(section, 0x10, 4, name);
        assert!(sym(SectionName::Text, "foo::bar()").is_name_unique());
        assert!(!sym(SectionName::Text, "foo.cold").is_name_unique());
        assert!(sym(SectionName::Other, "res/a.png").is_name_unique());
        assert!(!sym(SectionName::Rodata, "\"hello\"").is_name_unique());
        assert!(!sym(SectionName::Other, ELF_OVERHEAD_NAME).is_name_unique());
        assert!(!sym(SectionName::Text, "** symbol gap 0").is_name_unique());
    }

    #[test]
    fn canonical_order() {
        let mut syms = vec![
            Symbol::new(SectionName::Other, 0, 10, "Overhead: APK file"),
            Symbol::new(SectionName::Text, 0, 3, "** agg"),
            Symbol::new(SectionName::Text, 0x20, 8, "b"),
            Symbol::new(SectionName::Text, 0x10, 4, "a1"),
            Symbol::new(SectionName::Text, 0x10, 8, "a0"),
            Symbol::new(SectionName::Rodata, 0x5, 1, "r"),
        ];
        sort_symbols(&mut syms);
        let names: Vec<_> = syms.iter().map(|x| x.full_name.as_str()).collect();
        assert_eq!(names, ["a0", "a1", "b", "** agg", "r", "Overhead: APK file"]);
    }

    #[test]
    fn pss_of_clusters() {
        let mut info = SizeInfo::default();
        info.containers.push(Container::new("", ContainerKind::Native));
        info.symbols = vec![
            Symbol::new(SectionName::Text, 0x2000, 40, "a"),
            Symbol::new(SectionName::Text, 0x2000, 40, "b"),
            Symbol::new(SectionName::PakNontranslated, 0x20, 100, "c"),
            Symbol::new(SectionName::PakNontranslated, 0x20, 4, "d"),
        ];
        info.symbols[1].padding = 8;
        info.clusters = vec![
            AliasCluster { start: 0, count: 2, kind: AliasKind::Shared },
            AliasCluster { start: 2, count: 2, kind: AliasKind::Pak },
        ];
        for (i, c) in [0, 0, 1, 1].into_iter().enumerate() {
            info.symbols[i].aliases = Some(c);
        }

        assert_eq!(info.pss(0), 20.0);
        assert_eq!(info.pss(1), 28.0);
        assert_eq!(info.pss(2), 100.0);
        assert_eq!(info.pss(3), 4.0);
        assert_eq!(info.clusters[1].size_without_padding(&info.symbols), 104);
        assert_eq!(info.num_aliases(3), 2);
        assert_eq!(info.segments().len(), 2);
    }
}
