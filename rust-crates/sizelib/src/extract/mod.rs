// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Symbol extraction from the supported input formats.
//!
//! Every extractor produces a self-contained [`Extraction`]: one container
//! plus the raw symbols attributed to it. Raw symbols are not yet sorted,
//! padded or grouped into alias clusters; that is the job of
//! [`crate::resolve`].

use crate::diag::Diagnostic;
use crate::models::{Container, SectionName, Symbol};
use crate::{objfile, srcmap, toolchain, AnyError, VirtAddr};
use std::{io, ops};

pub mod apk;
pub mod dex;
pub mod native;
pub mod pak;
pub mod pool;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur during symbol extraction.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("objfile error")]
    Objfile(#[from] objfile::Error),

    #[error("source mapping failed")]
    SourceMap(#[from] srcmap::Error),

    #[error(transparent)]
    Toolchain(#[from] toolchain::Error),

    #[error("Malformed APK: {}", .0)]
    BadApk(String),

    #[error("Malformed DEX file: {}", .0)]
    BadDex(&'static str),

    #[error("Malformed pak file: {}", .0)]
    BadPak(&'static str),

    #[error("Unsupported input: {}", .0)]
    Unsupported(String),

    #[error("{} is negative: {} bytes", .name, .size)]
    NegativeOverhead { name: String, size: i64 },

    #[error("{}: {}", .path, .source)]
    Input {
        path: String,
        #[source]
        source: Box<Error>,
    },

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error(transparent)]
    Other(AnyError),
}

impl Error {
    /// Classification into the fatal error taxonomy.
    pub fn kind(&self) -> crate::ErrorKind {
        use crate::ErrorKind as K;
        match self {
            Error::Objfile(e) => e.kind(),
            Error::SourceMap(e) => e.kind(),
            Error::Toolchain(e) => e.kind(),
            Error::NegativeOverhead { .. } => K::InvariantViolation,
            Error::Input { source, .. } => source.kind(),
            _ => K::MalformedInput,
        }
    }

    /// Attaches the path of the input that failed.
    pub fn in_input(self, path: impl Into<String>) -> Self {
        Error::Input {
            path: path.into(),
            source: Box::new(self),
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Other(Box::new(e))
    }
}

impl From<rayon::ThreadPoolBuildError> for Error {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        Self::Other(Box::new(e))
    }
}

/// Output of one extractor run.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Container describing the input. Its `section_sizes` hold the total
    /// size of every section the symbols were extracted from.
    pub container: Container,
    /// Raw, unresolved symbols. `Symbol::container` is not yet assigned.
    pub symbols: Vec<Symbol>,
    /// Non-fatal findings raised while extracting.
    pub diagnostics: Vec<Diagnostic>,
    /// Address ranges of the object file sections behind each native
    /// section. Padding never extends past the end of one of these.
    pub section_ranges: Vec<(SectionName, ops::Range<VirtAddr>)>,
}

impl Extraction {
    /// Creates an empty extraction for `container`.
    pub fn new(container: Container) -> Self {
        Extraction {
            container,
            symbols: Vec::new(),
            diagnostics: Vec::new(),
            section_ranges: Vec::new(),
        }
    }

    /// Adds `size` to the container's running total of `section`.
    pub(crate) fn add_section_size(&mut self, section: SectionName, size: u64) {
        *self.container.section_sizes.entry(section).or_default() += size;
    }
}

/// Options shared by all extractors.
#[derive(Debug)]
pub struct Options<'a> {
    /// Toolchain lookup.
    pub resolver: &'a toolchain::Resolver,
    /// Map addresses to sources via an external `dwarfdump` instead of
    /// reading DWARF directly.
    pub use_dwarfdump: bool,
}

/// File name part of a `/`-separated path.
pub(crate) fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
