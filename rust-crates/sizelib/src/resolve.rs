// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Turns raw extractor output into a finalized [`SizeInfo`].
//!
//! Per `(container, section)` segment the resolver:
//!
//! 1. sorts symbols by `(address, -size)`, pseudo-symbols last,
//! 2. validates runs of symbols sharing an address,
//! 3. assigns padding between neighbours (native sections only),
//! 4. folds nameless symbols into an aggregate pseudo-symbol,
//! 5. reconciles the symbol total with the section size reported by the
//!    extractor.
//!
//! Alias clusters are derived from the final order in a single linear pass.

use crate::extract::Extraction;
use crate::models::{self, AliasCluster, AliasKind, SectionName, SizeInfo, Symbol};
use crate::models::{ClusterIdx, ContainerIdx, ANONYMOUS_AGGREGATE_NAME};
use crate::VirtAddr;
use std::ops::Range;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur during resolution.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{section}: `{first}` overlaps `{second}` at {address:#x}")]
    Overlap {
        section: SectionName,
        address: VirtAddr,
        first: String,
        second: String,
    },

    #[error("{section}: symbols at {address:#x} share an address but differ in size ({a} vs {b})")]
    AliasSizeMismatch {
        section: SectionName,
        address: VirtAddr,
        a: u64,
        b: u64,
    },

    #[error("too many containers or clusters")]
    TooMany,
}

impl Error {
    /// Classification into the fatal error taxonomy.
    pub fn kind(&self) -> crate::ErrorKind {
        crate::ErrorKind::InvariantViolation
    }
}

/// Name of the pseudo-symbol absorbing bytes of a section not covered by
/// any symbol.
pub fn section_padding_name(section: SectionName) -> String {
    format!("** section {section} padding")
}

/// Merges extractions into a finalized [`SizeInfo`].
///
/// Containers keep the order of `extractions`. Metadata and build config
/// are left empty for the caller to fill in.
pub fn resolve(extractions: Vec<Extraction>) -> Result<SizeInfo> {
    let mut containers = Vec::with_capacity(extractions.len());
    let mut ranges = Vec::with_capacity(extractions.len());
    let mut symbols = Vec::new();
    for (idx, extraction) in extractions.into_iter().enumerate() {
        let idx = ContainerIdx::try_from(idx).map_err(|_| Error::TooMany)?;
        symbols.extend(extraction.symbols.into_iter().map(|mut sym| {
            sym.container = idx;
            sym.padding = 0;
            sym.aliases = None;
            sym
        }));
        containers.push(extraction.container);
        ranges.push(extraction.section_ranges);
    }

    models::sort_symbols(&mut symbols);

    let mut segments: Vec<Vec<Symbol>> = Vec::new();
    for sym in symbols {
        match segments.last_mut() {
            Some(seg) if seg[0].container == sym.container && seg[0].section == sym.section => {
                seg.push(sym);
            }
            _ => segments.push(vec![sym]),
        }
    }

    let mut symbols = Vec::new();
    for mut seg in segments {
        let (container, section) = (seg[0].container as usize, seg[0].section);
        let total = containers[container].section_sizes.get(&section).copied();
        let bounds: Vec<Range<VirtAddr>> = ranges[container]
            .iter()
            .filter(|x| x.0 == section)
            .map(|x| x.1.clone())
            .collect();
        resolve_segment(&mut seg, total, &bounds)?;
        symbols.extend(seg);
    }

    let clusters = assign_clusters(&mut symbols)?;
    log::debug!(
        "resolved {} symbols in {} containers, {} alias clusters",
        symbols.len(),
        containers.len(),
        clusters.len()
    );

    Ok(SizeInfo {
        containers,
        symbols,
        clusters,
        ..Default::default()
    })
}

/// Ranges of symbols sharing the same non-zero address.
///
/// Expects input sorted by address with pseudo-symbols last.
fn address_runs(seg: &[Symbol]) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = 0;
    while start < seg.len() && seg[start].address != 0 {
        let addr = seg[start].address;
        let len = seg[start..].iter().take_while(|x| x.address == addr).count();
        runs.push(start..start + len);
        start += len;
    }
    runs
}

/// Resolves one `(container, section)` segment in place.
///
/// `bounds` are the address ranges of the input sections making up the
/// segment. Padding is only assigned between neighbours within one of them.
fn resolve_segment(seg: &mut Vec<Symbol>, total: Option<u64>, bounds: &[Range<VirtAddr>]) -> Result {
    let section = seg[0].section;
    let runs = address_runs(seg);

    if !section.is_pak() {
        for run in &runs {
            let first = &seg[run.start];
            if let Some(other) = seg[run.clone()].iter().find(|x| x.size_without_padding != first.size_without_padding) {
                return Err(Error::AliasSizeMismatch {
                    section,
                    address: first.address,
                    a: first.size_without_padding,
                    b: other.size_without_padding,
                });
            }
        }
    }

    if section.is_native() {
        for pair in runs.windows(2) {
            let (cur, next) = (&seg[pair[0].start], &seg[pair[1].start]);
            let end = cur.address + cur.size_without_padding;
            let Some(padding) = next.address.checked_sub(end) else {
                return Err(Error::Overlap {
                    section,
                    address: next.address,
                    first: cur.full_name.clone(),
                    second: next.full_name.clone(),
                });
            };
            let same_section = bounds.is_empty()
                || bounds.iter().any(|x| x.contains(&next.address) && cur.address >= x.start);
            if same_section {
                seg[pair[0].end - 1].padding = padding;
            }
        }
    }

    // Shared runs own their bytes once.
    let shared_extra: u64 = if section.is_pak() {
        0
    } else {
        runs.iter()
            .map(|run| (run.len() as u64 - 1) * seg[run.start].size_without_padding)
            .sum()
    };

    let singles: Vec<bool> = {
        let mut singles = vec![true; seg.len()];
        for run in runs.iter().filter(|x| x.len() > 1) {
            singles[run.clone()].fill(false);
        }
        singles
    };

    let mut anonymous = 0;
    let mut idx = 0;
    seg.retain(|sym| {
        let fold = singles[idx] && sym.full_name.is_empty();
        idx += 1;
        if fold {
            anonymous += sym.size();
        }
        !fold
    });
    if anonymous > 0 {
        let mut sym = Symbol::new(section, 0, anonymous, ANONYMOUS_AGGREGATE_NAME);
        sym.container = seg.first().map_or(0, |x| x.container);
        seg.push(sym);
    }

    if let Some(total) = total {
        let covered = seg.iter().map(Symbol::size).sum::<u64>() - shared_extra;
        if total > covered {
            let mut sym = Symbol::new(section, 0, total - covered, &section_padding_name(section));
            sym.container = seg.first().map_or(0, |x| x.container);
            seg.push(sym);
        } else if total < covered {
            log::warn!("{section}: symbols cover {covered} bytes, section holds {total}");
        }
    }

    models::sort_symbols(seg);
    Ok(())
}

/// Derives alias clusters from runs of symbols sharing an address.
///
/// Expects the canonical symbol order. Existing cluster references are
/// replaced.
pub(crate) fn assign_clusters(symbols: &mut [Symbol]) -> Result<Vec<AliasCluster>> {
    let mut clusters = Vec::new();
    let mut start = 0;
    while start < symbols.len() {
        let first = &symbols[start];
        let len = if first.address == 0 {
            1
        } else {
            symbols[start..]
                .iter()
                .take_while(|x| {
                    x.container == first.container
                        && x.section == first.section
                        && x.address == first.address
                })
                .count()
        };

        if len > 1 {
            let cluster_idx = ClusterIdx::try_from(clusters.len()).map_err(|_| Error::TooMany)?;
            clusters.push(AliasCluster {
                start: u32::try_from(start).map_err(|_| Error::TooMany)?,
                count: len as u32,
                kind: if first.section.is_pak() {
                    AliasKind::Pak
                } else {
                    AliasKind::Shared
                },
            });
            for sym in &mut symbols[start..start + len] {
                sym.aliases = Some(cluster_idx);
            }
        } else {
            symbols[start].aliases = None;
        }

        start += len;
    }
    Ok(clusters)
}
