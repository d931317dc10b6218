// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Sanity checks on a finalized [`SizeInfo`].
//!
//! Every check works per `(container, section)` segment. Any finding means
//! that an extractor produced bogus data, so all of them are reported as
//! invariant violations.

use crate::models::{keys, Container, SectionName, SizeInfo};
use std::path::Path;

/// Maximum number of findings logged individually.
const MAX_LOGGED: usize = 40;

/// Tolerance for float comparisons of proportional sizes.
const EPSILON: f64 = 1e-6;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors reported by [`check`].
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("data quality check found {} problem(s), first: {}", .count, .first)]
    Failed { count: usize, first: String },
}

impl Error {
    /// Classification into the fatal error taxonomy.
    pub fn kind(&self) -> crate::ErrorKind {
        crate::ErrorKind::InvariantViolation
    }
}

/// Maximum share of a section that may be attributed to padding.
fn padding_limit(section: SectionName) -> f64 {
    match section {
        SectionName::Other => 0.05,
        _ => 0.01,
    }
}

fn is_absolute(path: &str) -> bool {
    !path.is_empty() && (path.starts_with('/') || Path::new(path).is_absolute())
}

/// Bytes of an APK that its own symbols must account for.
///
/// Embedded native libraries are charged to containers of their own and
/// analyzed entries count with their uncompressed size.
fn apk_attributable_size(container: &Container) -> Option<std::result::Result<i64, String>> {
    let apk_size = container.metadata.get(keys::APK_SIZE)?;
    let mut total = 0i64;
    for (key, sign) in [
        (keys::APK_SIZE, 1),
        (keys::ZIPALIGN_OVERHEAD, -1),
        (keys::SIGNING_BLOCK_SIZE, -1),
        (keys::COMPRESSION_SAVINGS, 1),
        (keys::EMBEDDED_LIBRARY_SIZE, -1),
    ] {
        let value = match container.metadata.get(key) {
            Some(x) => x.as_str(),
            None if key == keys::EMBEDDED_LIBRARY_SIZE => "0",
            None => return Some(Err(format!("apk_size {apk_size} given without {key}"))),
        };
        match value.parse::<i64>() {
            Ok(x) => total += sign * x,
            Err(_) => return Some(Err(format!("malformed {key} {value:?}"))),
        }
    }
    Some(Ok(total))
}

/// Collects a human readable description of every problem in `info`.
pub fn find_problems(info: &SizeInfo) -> Vec<String> {
    let mut problems = Vec::new();

    let segments = info.segments();
    for (idx, container) in info.containers.iter().enumerate() {
        let expected = match apk_attributable_size(container) {
            None => continue,
            Some(Ok(x)) => x,
            Some(Err(msg)) => {
                problems.push(format!("container {:?}: {msg}", container.name));
                continue;
            }
        };

        let pss: f64 = segments
            .iter()
            .filter(|x| x.container as usize == idx && x.section.is_on_disk())
            .flat_map(|x| x.range.clone())
            .map(|i| info.pss(i))
            .sum();
        if pss.round() as i64 != expected {
            problems.push(format!(
                "container {:?}: symbols sum to {pss:.0} bytes, file accounts for {expected}",
                container.name
            ));
        }
    }

    for seg in segments {
        let container = &info.containers[seg.container as usize];
        let section = seg.section;
        let mut report = |msg: String| {
            problems.push(format!("container {:?}, section {section}: {msg}", container.name));
        };

        let syms = &info.symbols[seg.range.clone()];
        let pss: f64 = seg.range.clone().map(|i| info.pss(i)).sum();
        let padding: u64 = syms.iter().map(|x| x.padding).sum();

        if let Some(&expected) = container.section_sizes.get(&section) {
            if pss.round() as u64 != expected {
                report(format!("symbols sum to {pss:.0} bytes, section holds {expected}"));
            } else if padding as f64 > padding_limit(section) * expected as f64 {
                report(format!(
                    "{padding} bytes of padding exceed {:.0}% of {expected}",
                    padding_limit(section) * 100.0
                ));
            }
        }

        for sym in syms {
            if is_absolute(&sym.source_path) {
                report(format!("absolute source_path {:?}", sym.source_path));
            }
            if is_absolute(&sym.object_path) {
                report(format!("absolute object_path {:?}", sym.object_path));
            }
        }

        for pair in syms.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.address == 0 || b.address == 0 {
                continue;
            }
            if a.aliases.is_some() && a.aliases == b.aliases {
                continue;
            }
            if a.address + a.size_without_padding > b.address {
                report(format!(
                    "{:?} at {:#x} overlaps {:?} at {:#x}",
                    a.full_name, a.address, b.full_name, b.address
                ));
            }
        }
    }

    for (idx, cluster) in info.clusters.iter().enumerate() {
        let members = cluster.members();
        if members.end > info.symbols.len() {
            problems.push(format!("alias cluster {idx} is out of range"));
            continue;
        }
        let shared = cluster.size_without_padding(&info.symbols) as f64;
        let pss: f64 = members.map(|i| info.pss_without_padding(i)).sum();
        if (shared - pss).abs() > EPSILON {
            problems.push(format!("alias cluster {idx}: members sum to {pss}, cluster holds {shared}"));
        }
    }

    problems
}

/// Runs all checks, logging every finding.
pub fn check(info: &SizeInfo) -> Result {
    let problems = find_problems(info);
    let Some(first) = problems.first() else {
        log::debug!("data quality check passed");
        return Ok(());
    };

    log::error!("data quality check found {} problem(s)", problems.len());
    for msg in problems.iter().take(MAX_LOGGED) {
        log::error!("  {msg}");
    }
    if problems.len() > MAX_LOGGED {
        log::error!("  ... and {} more", problems.len() - MAX_LOGGED);
    }

    Err(Error::Failed {
        count: problems.len(),
        first: first.clone(),
    })
}
