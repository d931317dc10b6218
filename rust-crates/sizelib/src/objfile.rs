// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! High-level abstractions for working with object files and static archives.

use crate::{AnyError, VirtAddr};

use std::io::Read as _;
use std::{fmt, fs, io, ops, path};

use flate2::read::ZlibDecoder;
use memmap2::{Mmap, MmapMut};
use object::read::archive::ArchiveFile;
use object::{
    CompressionFormat, FileKind, Object as _, ObjectSection as _, ObjectSymbol as _,
};
use zstd::stream::read::Decoder as ZstdDecoder;

/// Maximum size of an individual object section to keep in memory.
///
/// All sections where the decompressed representation is larger than this
/// constant are instead read into anonymous temporary files and  `mmap`ed.
const SWAP_THRESH: usize = 16 * 1024 * 1024;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur during object file parsing.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Sections are compressed in an unsupported format")]
    UnsupportedCompressionFormat,

    #[error("Object file is too big to be loaded")]
    FileTooBig,

    #[error("Unsupported file kind (PDB / COFF / unknown)")]
    UnsupportedFileKind,

    #[error("Archive member name is not valid UTF-8")]
    BadMemberName,

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error(transparent)]
    Other(AnyError),
}

impl Error {
    /// Classification into the fatal error taxonomy.
    pub fn kind(&self) -> crate::ErrorKind {
        crate::ErrorKind::MalformedInput
    }
}

/// Conversion of [`object`] errors into ours, with type erasure.
///
/// We erase the type here to prevent leaking [`object`] library types into our
/// public interface. If code needs to special-case based on particular [`object`]
/// errors, we should instead lift them into custom error variants.
impl From<object::Error> for Error {
    fn from(e: object::Error) -> Self {
        Self::Other(Box::new(e))
    }
}

/// Backing storage of a [`File`].
enum Storage {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

/// An object file, executable or static archive held in memory.
///
/// Files on disk are `mmap`ed; files extracted from containers (e.g. native
/// libraries inside of an APK) are held in an owned buffer. This currently
/// uses the [`object`] library to perform the actual heavy lifting, however
/// this should be considered an implementation detail.
pub struct File(Storage);

impl File {
    /// Map the file at the given path into memory.
    pub fn load(path: &path::Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        Ok(Self(Storage::Mapped(unsafe { Mmap::map(&file)? })))
    }

    /// Wrap an in-memory copy of a file.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self(Storage::Owned(data))
    }

    /// Size of the file in bytes.
    pub fn len(&self) -> u64 {
        self.data().len() as u64
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Raw contents of the file.
    pub fn data(&self) -> &[u8] {
        match &self.0 {
            Storage::Mapped(x) => &x[..],
            Storage::Owned(x) => &x[..],
        }
    }

    /// Parse the header and create a reader.
    ///
    /// Fails for static archives: use [`Self::members`] for those.
    pub fn parse(&self) -> Result<Reader<'_>> {
        Reader::parse(self.data())
    }

    /// Parse all objects contained in the file.
    ///
    /// Returns a single unnamed member for plain object files and one named
    /// member per object for static archives. Archive members that are not
    /// object files (e.g. the symbol index) are skipped.
    pub fn members(&self) -> Result<Vec<Member<'_>>> {
        let data = self.data();
        if FileKind::parse(data)? != FileKind::Archive {
            return Ok(vec![Member {
                name: None,
                reader: self.parse()?,
            }]);
        }

        let archive = ArchiveFile::parse(data)?;
        let mut members = Vec::new();
        for member in archive.members() {
            let member = member?;
            let name = std::str::from_utf8(member.name()).map_err(|_| Error::BadMemberName)?;
            let member_data = member.data(data)?;
            match Reader::parse(member_data) {
                Ok(reader) => members.push(Member {
                    name: Some(name.to_owned()),
                    reader,
                }),
                Err(e) => log::debug!("skipping archive member {name}: {e}"),
            }
        }

        Ok(members)
    }
}

/// An object file within a [`File`].
pub struct Member<'obj> {
    /// Archive member name, [`None`] for plain object files.
    pub name: Option<String>,
    /// Reader for the member.
    pub reader: Reader<'obj>,
}

/// Container format of an object file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// ELF.
    Elf,
    /// mach-O.
    MachO,
}

/// Provides read access to the data in an object file.
///
/// Created via [`File::parse`].
pub struct Reader<'obj>(object::File<'obj>);

impl<'obj> Reader<'obj> {
    fn parse(data: &'obj [u8]) -> Result<Self> {
        match FileKind::parse(data)? {
            FileKind::Elf32
            | FileKind::Elf64
            | FileKind::MachO32
            | FileKind::MachO64
            | FileKind::MachOFat32
            | FileKind::MachOFat64 => Ok(Reader(object::File::parse(data)?)),
            _ => Err(Error::UnsupportedFileKind),
        }
    }

    /// Loads the section with the given name into memory.
    ///
    /// Depending on whether the section is compressed in the input file or not,
    /// this can be an expensive operation.
    pub fn load_section(&self, name: &[u8]) -> Result<Option<Section<'obj>>> {
        let Some(obj_sec) = self.0.section_by_name_bytes(name) else {
            return Ok(None);
        };

        Section::load_from_obj_section(&obj_sec).map(Some)
    }

    /// Checks whether this file has little-endian byte-order.
    pub fn is_little_endian(&self) -> bool {
        self.0.is_little_endian()
    }

    /// Returns the container format.
    pub fn format(&self) -> Format {
        match self.0.format() {
            object::BinaryFormat::MachO => Format::MachO,
            _ => Format::Elf,
        }
    }

    /// Whether this is a relocatable object (`.o`) rather than a linked image.
    pub fn is_relocatable(&self) -> bool {
        self.0.kind() == object::ObjectKind::Relocatable
    }

    /// Returns the raw [`object`] architecture.
    pub fn architecture(&self) -> object::Architecture {
        self.0.architecture()
    }

    /// Reads the GNU build ID (or mach-O UUID) as lower-case hex string.
    pub fn build_id(&self) -> Result<Option<String>> {
        let id = match self.0.build_id()? {
            Some(id) => id.to_vec(),
            None => match self.0.mach_uuid()? {
                Some(uuid) => uuid.to_vec(),
                None => return Ok(None),
            },
        };

        Ok(Some(id.iter().map(|x| format!("{x:02x}")).collect()))
    }

    /// Describes all sections of the file.
    pub fn sections(&self) -> Vec<SectionInfo<'obj>> {
        self.0
            .sections()
            .map(|sec| SectionInfo {
                index: sec.index().0,
                name: sec.name().unwrap_or(""),
                segment: sec.segment_name().ok().flatten().map(str::to_owned),
                virt_addr: sec.address(),
                virt_size: sec.size(),
                file_size: sec.file_range().map_or(0, |(_, size)| size),
                alloc: is_alloc(&sec),
                tls: is_tls(&sec),
            })
            .collect()
    }

    /// Iterate over all defined symbols that have a name.
    pub fn symbols(&self) -> impl Iterator<Item = Symbol<'obj>> + '_ {
        self.0
            .symbols()
            // `is_definition` is false for `STT_TLS`.
            .filter(|x| x.is_definition() || (x.kind() == object::SymbolKind::Tls && x.section_index().is_some()))
            .filter(|x| !matches!(x.kind(), object::SymbolKind::Section | object::SymbolKind::File))
            .filter_map(|x| {
                Some(Symbol {
                    name: x.name().ok()?, // just skip non-utf8 symbols
                    virt_addr: x.address(),
                    length: x.size(),
                    section: x.section_index()?.0,
                    tls: x.kind() == object::SymbolKind::Tls,
                })
            })
    }
}

fn is_alloc(sec: &object::Section<'_, '_>) -> bool {
    match sec.flags() {
        object::SectionFlags::Elf { sh_flags } => sh_flags & u64::from(object::elf::SHF_ALLOC) != 0,
        // Everything in a mach-O segment is mapped, except for debug info.
        object::SectionFlags::MachO { .. } => sec.segment_name().ok().flatten() != Some("__DWARF"),
        _ => false,
    }
}

fn is_tls(sec: &object::Section<'_, '_>) -> bool {
    match sec.flags() {
        object::SectionFlags::Elf { sh_flags } => sh_flags & u64::from(object::elf::SHF_TLS) != 0,
        _ => false,
    }
}

/// Metadata of an object file section, without its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo<'obj> {
    /// Section index, as referenced by [`Symbol::section`].
    pub index: usize,
    /// Section name, e.g. `.text` or `__text`.
    pub name: &'obj str,
    /// Segment name (mach-O only).
    pub segment: Option<String>,
    pub virt_addr: VirtAddr,
    pub virt_size: u64,
    /// Bytes occupied in the file; 0 for `NOBITS` sections.
    pub file_size: u64,
    /// Whether the section is loaded into memory at runtime.
    pub alloc: bool,
    /// Whether the section holds thread-local data (`.tdata`, `.tbss`).
    pub tls: bool,
}

/// Raw data of an object file section.
#[derive(Debug)]
pub struct Section<'obj> {
    data: SectionData<'obj>,
}

impl<'obj> Section<'obj> {
    /// Construction from an [`object::Section`].
    fn load_from_obj_section(obj_sec: &object::Section<'obj, '_>) -> Result<Self> {
        Ok(Section {
            data: SectionData::load_from_obj_sec(obj_sec)?,
        })
    }
}

/// Allow using section objects where slices are expected.
impl<'obj> ops::Deref for Section<'obj> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match &self.data {
            SectionData::Borrowed(x) => x,
            SectionData::InMemory(x) => &x[..],
            SectionData::Swapped(x) => &x[..],
        }
    }
}

/// Storage for object file sections.
pub enum SectionData<'obj> {
    /// Section was uncompressed in the input file and we simply kept a ref.
    Borrowed(&'obj [u8]),

    /// Section was originally compressed and we decompressed it into memory.
    InMemory(Vec<u8>),

    /// Section was originally compressed and we decompressed it into a
    /// memory-mapped temporary file.
    Swapped(MmapMut),
}

impl<'obj> SectionData<'obj> {
    /// Decodes a compressed section either into memory or into an `mmap`ed
    /// temporary file, depending on its size.
    fn read_smart(final_size: usize, mut reader: impl io::Read) -> Result<Self> {
        if final_size < SWAP_THRESH {
            let mut mem_buf = Vec::with_capacity(final_size);
            reader.read_to_end(&mut mem_buf)?;
            return Ok(SectionData::InMemory(mem_buf));
        }

        let mut file = tempfile::tempfile()?;
        io::copy(&mut reader, &mut file)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(SectionData::Swapped(mmap))
    }

    /// Load the data from the given [`object::Section`].
    fn load_from_obj_sec(sec: &object::Section<'obj, '_>) -> Result<Self> {
        let data = sec.compressed_data()?;

        // Ensure that the file fits into memory.
        let final_size: usize = data
            .uncompressed_size
            .try_into()
            .map_err(|_| Error::FileTooBig)?;

        let decoder: Box<dyn io::Read> = match data.format {
            CompressionFormat::Zlib => Box::new(ZlibDecoder::new(data.data)),
            CompressionFormat::Zstandard => Box::new(ZstdDecoder::new(data.data)?),
            CompressionFormat::None => return Ok(SectionData::Borrowed(data.data)),
            _ => return Err(Error::UnsupportedCompressionFormat),
        };

        // Still here? Compressed section: unpack it.
        let decoder = decoder.take(final_size as u64);
        Self::read_smart(final_size, decoder)
    }
}

impl<'obj> fmt::Debug for SectionData<'obj> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (storage, len) = match self {
            Self::Borrowed(x) => ("borrowed", x.len()),
            Self::InMemory(x) => ("in-memory", x.len()),
            Self::Swapped(x) => ("mmapped", x.len()),
        };

        write!(f, "SectionData([{} bytes, {}])", len, storage)
    }
}

/// Defined symbol of an object file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol<'a> {
    /// Symbol name. Might be mangled.
    pub name: &'a str,
    /// Start address of the symbol.
    pub virt_addr: VirtAddr,
    /// Length of the symbol. Always 0 for mach-O.
    pub length: u64,
    /// Index of the section that defines the symbol.
    pub section: usize,
    /// Thread-local symbol. In linked images, `virt_addr` is an offset into
    /// the TLS segment rather than an address.
    pub tls: bool,
}
