// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Internal helper for string pool construction during writing.

use std::collections::HashMap;

/// Index in the final pool.
///
/// Values are indices into the final `Vec<String>` table.
pub type Idx = u32;

/// Incrementally de-duplicates strings.
///
/// Indices are handed out in order of first appearance, so the pool of a
/// given symbol stream is always the same.
#[derive(Debug, Default)]
pub struct Builder {
    entries: HashMap<String, Idx>,
    table: Vec<String>,
    size_estimate: usize,
}

impl Builder {
    /// Look up or allocate the index for the given string.
    pub fn index_for_str(&mut self, s: &str) -> Idx {
        if let Some(&idx) = self.entries.get(s) {
            return idx;
        }

        // 5 = maximum length of var-int u32
        self.size_estimate += 5 + s.len();
        let idx = self.table.len() as Idx;
        self.entries.insert(s.to_owned(), idx);
        self.table.push(s.to_owned());
        idx
    }

    /// Number of unique strings.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Estimated serialized size of the pool, in bytes.
    pub fn size_estimate(&self) -> usize {
        self.size_estimate
    }

    /// Consume the builder, returning the final table.
    pub fn into_table(self) -> Vec<String> {
        self.table
    }
}
