// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Coordinates the creation of a [`SizeInfo`] from a set of build outputs.
//!
//! Containers are extracted in the order they were specified. Loose native
//! binaries are handed to the extraction pool; everything else is cheap
//! enough to be processed on the calling thread.

use crate::diag::{self, Diagnostic};
use crate::extract::{self, apk, dex, native, pak, pool, Extraction};
use crate::models::{keys, Container, ContainerKind, SizeInfo};
use crate::{objfile, quality, resolve, toolchain};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur while creating a size info.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Extract(#[from] extract::Error),

    #[error(transparent)]
    Resolve(#[from] resolve::Error),

    #[error(transparent)]
    Quality(#[from] quality::Error),

    #[error("unable to read {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: objfile::Error,
    },

    #[error("no input containers given")]
    NoInputs,
}

impl Error {
    /// Classification into the fatal error taxonomy.
    pub fn kind(&self) -> crate::ErrorKind {
        match self {
            Error::Extract(e) => e.kind(),
            Error::Resolve(e) => e.kind(),
            Error::Quality(e) => e.kind(),
            Error::Read { source, .. } => source.kind(),
            Error::NoInputs => crate::ErrorKind::MalformedInput,
        }
    }
}

/// Optional side files of an APK.
#[derive(Debug, Default, Clone)]
pub struct ApkSideFiles {
    /// `original -> obfuscated` resource path map.
    pub pathmap: Option<PathBuf>,
    /// Tab separated `original\tobfuscated` resource info.
    pub res_info: Option<PathBuf>,
    /// `class,path` files mapping Java classes to sources.
    pub jar_info: Vec<PathBuf>,
    /// `name,id,path` files describing `.pak` resources.
    pub pak_info: Vec<PathBuf>,
}

/// A build output to analyze.
#[derive(Debug, Clone)]
pub enum ContainerSpec {
    /// Loose ELF / Mach-O binary or static archive.
    Native { path: PathBuf },
    /// APK or AAB, including the libraries, DEX and pak files within.
    Apk { path: PathBuf, side: ApkSideFiles },
    /// Loose `.pak` files, grouped into one container.
    Pak {
        paths: Vec<PathBuf>,
        pak_info: Vec<PathBuf>,
    },
}

/// Archive options.
#[derive(Debug, Default, Clone)]
pub struct Options {
    /// Inputs, in the order their containers should appear.
    pub containers: Vec<ContainerSpec>,
    /// Resolve source paths through an external `dwarfdump`.
    pub use_dwarfdump: bool,
    /// Run [`quality::check`] on the result.
    pub check_data_quality: bool,
    /// Stored as the `source_commit` metadata entry.
    pub source_commit: Option<String>,
    /// Stored verbatim in [`SizeInfo::build_config`].
    pub build_config: BTreeMap<String, String>,
    /// Input paths are recorded relative to this directory.
    pub output_directory: Option<PathBuf>,
}

impl Options {
    /// Path as it should appear in the size info.
    fn display_path(&self, path: &Path) -> String {
        let relative = self
            .output_directory
            .as_deref()
            .and_then(|dir| path.strip_prefix(dir).ok())
            .unwrap_or(path);
        relative.to_string_lossy().into_owned()
    }
}

/// Modification time of `path` in seconds since the epoch.
fn mtime(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_secs())
}

fn load(path: &Path) -> Result<objfile::File> {
    objfile::File::load(path).map_err(|source| Error::Read {
        path: path.to_owned(),
        source,
    })
}

/// Reads an optional side file, recording a diagnostic if that fails.
fn read_side_file(path: &Path, diagnostics: &mut Vec<Diagnostic>) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) => {
            let diagnostic = Diagnostic::MissingSideFile {
                path: path.to_string_lossy().into_owned(),
                reason: e.to_string(),
            };
            diagnostic.log();
            diagnostics.push(diagnostic);
            None
        }
    }
}

fn load_pak_info(paths: &[PathBuf], diagnostics: &mut Vec<Diagnostic>) -> pak::PakInfo {
    let mut info = pak::PakInfo::default();
    for path in paths {
        if let Some(text) = read_side_file(path, diagnostics) {
            info.extend(pak::PakInfo::parse(&text));
        }
    }
    info
}

fn load_apk_side_files(side: &ApkSideFiles, diagnostics: &mut Vec<Diagnostic>) -> apk::SideFiles {
    let mut out = apk::SideFiles::default();
    if let Some(path) = &side.pathmap {
        if let Some(text) = read_side_file(path, diagnostics) {
            out.pathmap.extend(apk::PathMap::parse_pathmap(&text));
        }
    }
    if let Some(path) = &side.res_info {
        if let Some(text) = read_side_file(path, diagnostics) {
            out.pathmap.extend(apk::PathMap::parse_res_info(&text));
        }
    }
    for path in &side.jar_info {
        if let Some(text) = read_side_file(path, diagnostics) {
            out.jar_info.extend(dex::JarInfo::parse(&text));
        }
    }
    out.pak_info = load_pak_info(&side.pak_info, diagnostics);
    out
}

/// Extracts loose `.pak` files into a single container.
fn extract_paks(opts: &Options, paths: &[PathBuf], info: &pak::PakInfo) -> Result<Extraction> {
    let names: Vec<String> = paths.iter().map(|x| opts.display_path(x)).collect();
    let mut out = Extraction::new(Container::new(names.join(","), ContainerKind::Pak));
    let mut layout = pak::Layout::default();

    for (path, name) in paths.iter().zip(&names) {
        let file = load(path)?;
        let pak = pak::extract(name, file.data(), &mut layout, info).map_err(|e| e.in_input(name))?;
        out.add_section_size(pak.section, file.len());
        out.symbols.extend(pak.symbols);
    }

    out.container.metadata.insert(keys::PAK_FILE_NAMES.into(), names.join(","));
    Ok(out)
}

/// Extracts, resolves and annotates all inputs of `opts`.
pub fn create_size_info(opts: &Options, resolver: &toolchain::Resolver) -> Result<SizeInfo> {
    if opts.containers.is_empty() {
        return Err(Error::NoInputs);
    }

    let extract_opts = extract::Options {
        resolver,
        use_dwarfdump: opts.use_dwarfdump,
    };

    let mut diagnostics = Vec::new();
    let mut newest_mtime = None;
    let mut slots: Vec<Vec<Extraction>> = Vec::with_capacity(opts.containers.len());
    let mut natives = Vec::new();

    for spec in &opts.containers {
        match spec {
            ContainerSpec::Native { path } => {
                let input = native::NativeInput {
                    name: opts.display_path(path),
                    file: load(path)?,
                    path: Some(path.clone()),
                    apk_path: None,
                    mtime: mtime(path),
                };
                newest_mtime = newest_mtime.max(input.mtime);
                natives.push((slots.len(), input));
                slots.push(Vec::new());
            }
            ContainerSpec::Apk { path, side } => {
                let side = load_apk_side_files(side, &mut diagnostics);
                let file = load(path)?;
                newest_mtime = newest_mtime.max(mtime(path));
                slots.push(apk::extract(&opts.display_path(path), &file, &side, &extract_opts)?);
            }
            ContainerSpec::Pak { paths, pak_info } => {
                let info = load_pak_info(pak_info, &mut diagnostics);
                for path in paths {
                    newest_mtime = newest_mtime.max(mtime(path));
                }
                slots.push(vec![extract_paks(opts, paths, &info)?]);
            }
        }
    }

    let results = pool::run(natives, |(slot, input)| {
        let extraction = native::extract(&input, &extract_opts).map_err(|e| e.in_input(&input.name))?;
        Ok((slot, extraction))
    })?;
    for (slot, extraction) in results {
        slots[slot].push(extraction);
    }

    let extractions: Vec<Extraction> = slots.into_iter().flatten().collect();
    for extraction in &extractions {
        diagnostics.extend(extraction.diagnostics.iter().cloned());
    }

    let mut info = resolve::resolve(extractions)?;
    annotate(&mut info, opts, newest_mtime);
    diag::store(&diagnostics, &mut info.metadata);

    log::info!(
        "created size info: {} containers, {} symbols, {} alias clusters, {} diagnostics",
        info.containers.len(),
        info.symbols.len(),
        info.clusters.len(),
        diagnostics.len(),
    );

    if opts.check_data_quality {
        quality::check(&info)?;
    }

    Ok(info)
}

/// Fills in the top-level metadata and build config.
fn annotate(info: &mut SizeInfo, opts: &Options, newest_mtime: Option<u64>) {
    let meta = &mut info.metadata;
    meta.insert(keys::TOOL_VERSION.into(), env!("CARGO_PKG_VERSION").to_owned());
    meta.insert(
        keys::SOURCE_MAPPER.into(),
        if opts.use_dwarfdump { "dwarfdump" } else { "dwarf" }.to_owned(),
    );
    if let Some(mtime) = newest_mtime {
        meta.insert(keys::TIMESTAMP.into(), mtime.to_string());
    }
    if let Some(commit) = opts
        .source_commit
        .as_ref()
        .or_else(|| opts.build_config.get(keys::BUILD_CONFIG_GIT_REVISION))
    {
        meta.insert(keys::SOURCE_COMMIT.into(), commit.clone());
    }

    let first_with = |kinds: &[ContainerKind], key: &str| {
        info.containers
            .iter()
            .filter(|x| kinds.contains(&x.kind))
            .find_map(|x| x.metadata.get(key).cloned())
    };
    let copied = [
        (keys::ELF_BUILD_ID, first_with(&[ContainerKind::Native], keys::ELF_BUILD_ID)),
        (
            keys::ZIPALIGN_OVERHEAD,
            first_with(&[ContainerKind::Apk, ContainerKind::Aab], keys::ZIPALIGN_OVERHEAD),
        ),
        (
            keys::SIGNING_BLOCK_SIZE,
            first_with(&[ContainerKind::Apk, ContainerKind::Aab], keys::SIGNING_BLOCK_SIZE),
        ),
    ];
    for (key, value) in copied {
        if let Some(value) = value {
            info.metadata.insert(key.to_owned(), value);
        }
    }

    info.build_config = opts.build_config.clone();
}
