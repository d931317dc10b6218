// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Locates external toolchain binaries.
//!
//! Resolution only inspects the file system: it never executes anything.
//! Results are cached per resolver, and the resolver is meant to be created
//! once at startup and then shared read-only.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::{env, fmt};

/// Environment variable overriding the toolchain prefix.
pub const TOOL_PREFIX_ENV: &str = "BINARY_SIZE_TOOL_PREFIX";

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur during tool resolution.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("required tool `{}` for architecture {} was not found", .tool, .arch)]
    ToolchainMissing { tool: Tool, arch: Arch },
}

impl Error {
    /// Classification into the fatal error taxonomy.
    pub fn kind(&self) -> crate::ErrorKind {
        crate::ErrorKind::ToolchainMissing
    }
}

/// Target architectures supported by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 32-bit ARM.
    Arm,
    /// `aarch64` aka `arm64`.
    Arm64,
    /// 32-bit x86.
    X86,
    /// `x86_64` aka `amd64`.
    X86_64,
    /// Little-endian 32-bit MIPS.
    Mipsel,
}

impl Arch {
    /// Name as used in metadata and on the command line.
    pub const fn as_str(self) -> &'static str {
        match self {
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
            Arch::Mipsel => "mipsel",
        }
    }

    /// Inverse of [`Self::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        [Arch::Arm, Arch::Arm64, Arch::X86, Arch::X86_64, Arch::Mipsel]
            .into_iter()
            .find(|x| x.as_str() == name)
    }

    /// Maps an [`object`] architecture, or [`None`] if unsupported.
    pub fn from_object(arch: object::Architecture) -> Option<Self> {
        match arch {
            object::Architecture::Arm => Some(Arch::Arm),
            object::Architecture::Aarch64 => Some(Arch::Arm64),
            object::Architecture::I386 => Some(Arch::X86),
            object::Architecture::X86_64 => Some(Arch::X86_64),
            object::Architecture::Mips => Some(Arch::Mipsel),
            _ => None,
        }
    }

    /// GNU target triple prefix of cross toolchains for this architecture.
    fn gnu_triple(self) -> &'static str {
        match self {
            Arch::Arm => "arm-linux-androideabi",
            Arch::Arm64 => "aarch64-linux-android",
            Arch::X86 => "i686-linux-android",
            Arch::X86_64 => "x86_64-linux-android",
            Arch::Mipsel => "mipsel-linux-android",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External tools the extractors may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    /// Symbol lister.
    Nm,
    /// ELF metadata dumper.
    Readelf,
    /// DWARF dumper.
    Dwarfdump,
    /// Disassembler / object dumper.
    Objdump,
    /// Breakpad symbol dumper.
    DumpSyms,
    /// Architecture-specific disassembler variant.
    Disassembler,
}

impl Tool {
    /// Candidate basenames, most preferred first.
    fn candidates(self, arch: Arch) -> Vec<String> {
        let llvm = |name: &str| [format!("llvm-{name}"), name.to_owned()];
        match self {
            Tool::Nm => llvm("nm").into(),
            Tool::Readelf => llvm("readelf").into(),
            Tool::Dwarfdump => llvm("dwarfdump").into(),
            Tool::Objdump => llvm("objdump").into(),
            Tool::DumpSyms => vec!["dump_syms".to_owned()],
            // llvm-objdump handles every target; GNU objdump is per-triple.
            Tool::Disassembler => vec![
                "llvm-objdump".to_owned(),
                format!("{}-objdump", arch.gnu_triple()),
            ],
        }
    }

    /// Short name used in messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Tool::Nm => "nm",
            Tool::Readelf => "readelf",
            Tool::Dwarfdump => "dwarfdump",
            Tool::Objdump => "objdump",
            Tool::DumpSyms => "dump_syms",
            Tool::Disassembler => "disassembler",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Toolchain path resolver.
///
/// The prefix can either be a directory (`/opt/llvm/bin/`) or a directory
/// followed by a file name prefix (`/opt/ndk/bin/aarch64-linux-android-`).
/// Without a prefix, tools are looked up in `PATH`.
#[derive(Debug)]
pub struct Resolver {
    prefix: Option<PathBuf>,
    search_path: Option<OsString>,
    cache: Mutex<HashMap<(Tool, Arch), Option<PathBuf>>>,
}

impl Resolver {
    /// Creates a resolver with an explicit prefix.
    ///
    /// An explicit prefix takes precedence over [`TOOL_PREFIX_ENV`].
    pub fn new(prefix: Option<PathBuf>) -> Self {
        let prefix = prefix.or_else(|| env::var_os(TOOL_PREFIX_ENV).map(PathBuf::from));
        Resolver {
            prefix: prefix.filter(|x| !x.as_os_str().is_empty()),
            search_path: env::var_os("PATH"),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a resolver that searches the given `PATH`-style list instead
    /// of the process environment.
    pub fn with_search_path(prefix: Option<PathBuf>, search_path: impl Into<OsString>) -> Self {
        Resolver {
            prefix,
            search_path: Some(search_path.into()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The configured tool prefix, if any.
    pub fn prefix(&self) -> Option<&Path> {
        self.prefix.as_deref()
    }

    /// Returns the absolute path of `tool` for `arch`.
    pub fn resolve(&self, tool: Tool, arch: Arch) -> Result<PathBuf> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let found = cache
            .entry((tool, arch))
            .or_insert_with(|| self.lookup(tool, arch))
            .clone();

        match found {
            Some(path) => Ok(path),
            None => Err(Error::ToolchainMissing { tool, arch }),
        }
    }

    /// Resolves all tools needed for native extraction.
    pub fn resolve_all(&self, arch: Arch) -> Result<ToolPaths> {
        Ok(ToolPaths {
            nm: self.resolve(Tool::Nm, arch)?,
            readelf: self.resolve(Tool::Readelf, arch)?,
            dwarfdump: self.resolve(Tool::Dwarfdump, arch)?,
            objdump: self.resolve(Tool::Objdump, arch)?,
            dump_syms: self.resolve(Tool::DumpSyms, arch).ok(),
            disassembler: self.resolve(Tool::Disassembler, arch)?,
        })
    }

    fn lookup(&self, tool: Tool, arch: Arch) -> Option<PathBuf> {
        let candidates = tool.candidates(arch);

        if let Some(prefix) = &self.prefix {
            let found = candidates.iter().find_map(|name| {
                let path = if prefix.is_dir() {
                    prefix.join(name)
                } else {
                    let mut joined = prefix.clone().into_os_string();
                    joined.push(name);
                    PathBuf::from(joined)
                };
                is_executable(&path).then_some(path)
            });

            log::debug!("resolved {tool} for {arch} under prefix: {found:?}");
            return found;
        }

        let search_path = self.search_path.as_ref()?;
        let found = candidates.iter().find_map(|name| {
            env::split_paths(search_path)
                .map(|dir| dir.join(name))
                .find(|path| is_executable(path))
        });

        log::debug!("resolved {tool} for {arch} via PATH: {found:?}");
        found
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Resolved paths of every tool for one architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub nm: PathBuf,
    pub readelf: PathBuf,
    pub dwarfdump: PathBuf,
    pub objdump: PathBuf,
    /// Optional: only needed for breakpad based flows.
    pub dump_syms: Option<PathBuf>,
    pub disassembler: PathBuf,
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
