// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Non-fatal diagnostics.
//!
//! Diagnostics are logged when raised and persisted in the size info
//! metadata, so that later diffs can tell noise from real changes.

use std::collections::BTreeMap;
use std::fmt;

/// Metadata key holding the JSON encoded diagnostics.
pub const METADATA_KEY: &str = "diagnostics";

/// A non-fatal finding.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A matched symbol has a different number of aliases on both sides.
    InconsistentAlias {
        full_name: String,
        before: u32,
        after: u32,
    },

    /// Addresses the source mapper couldn't attribute to a compile unit.
    UnmatchedAddresses {
        binary: String,
        unmatched: u64,
        queries: u64,
    },

    /// An optional side file couldn't be read.
    MissingSideFile { path: String, reason: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::InconsistentAlias {
                full_name,
                before,
                after,
            } => write!(f, "inconsistent aliases for {full_name}: {before} before, {after} after"),
            Diagnostic::UnmatchedAddresses {
                binary,
                unmatched,
                queries,
            } => write!(f, "{binary}: {unmatched} of {queries} addresses without source path"),
            Diagnostic::MissingSideFile { path, reason } => {
                write!(f, "side file {path} unavailable: {reason}")
            }
        }
    }
}

impl Diagnostic {
    /// Logs the diagnostic at the level matching its severity.
    pub fn log(&self) {
        match self {
            Diagnostic::MissingSideFile { .. } => log::warn!("{self}"),
            _ => log::info!("{self}"),
        }
    }
}

/// Stores `diagnostics` in `metadata`.
///
/// Existing entries are kept; nothing is stored when there's nothing to say.
pub fn store(diagnostics: &[Diagnostic], metadata: &mut BTreeMap<String, String>) {
    if diagnostics.is_empty() {
        return;
    }

    let mut messages = load(metadata);
    messages.extend(diagnostics.iter().map(ToString::to_string));

    // Encoding a list of strings can't fail.
    if let Ok(json) = serde_json::to_string(&messages) {
        metadata.insert(METADATA_KEY.to_owned(), json);
    }
}

/// Reads back the messages persisted by [`store`].
pub fn load(metadata: &BTreeMap<String, String>) -> Vec<String> {
    metadata
        .get(METADATA_KEY)
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default()
}
