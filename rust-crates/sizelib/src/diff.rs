// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Computes the difference between two [`SizeInfo`]s.
//!
//! Symbols are paired up in a series of passes, each one only looking at
//! symbols that the previous passes left unmatched:
//!
//! 1. exact key: `(container, section, full_name, object_path)`,
//! 2. `(container, section, full_name, size)`, unique on both sides,
//! 3. `full_name` with digits stripped, plus the source (or object) path,
//! 4. `name` plus the source (or object) path,
//! 5. `(container, section, full_name)` for globally unique non-native names.
//!
//! Whatever remains unmatched is reported as added or removed.

use crate::diag::Diagnostic;
use crate::models::{SectionName, SizeInfo, Symbol};
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// How a [`DeltaSymbol`] came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchKind {
    /// Paired through the exact key.
    Key,
    /// Paired through one of the fuzzy name passes.
    Name,
    /// Only present in `after`.
    Added,
    /// Only present in `before`.
    Removed,
}

/// Diff classification of a [`DeltaSymbol`].
///
/// The declaration order is the tie-break order of the delta listing.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiffStatus {
    Added,
    Changed,
    Unchanged,
    Removed,
}

impl DiffStatus {
    /// Single character marker used in reports.
    pub fn marker(self) -> char {
        match self {
            DiffStatus::Added => '+',
            DiffStatus::Changed => '~',
            DiffStatus::Unchanged => '=',
            DiffStatus::Removed => '-',
        }
    }
}

/// Paired `before` / `after` symbol with its deltas.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaSymbol {
    /// Index into the `before` symbols.
    pub before: Option<usize>,
    /// Index into the `after` symbols.
    pub after: Option<usize>,
    pub pss: f64,
    pub size_without_padding: i64,
    pub padding: i64,
    pub kind: MatchKind,
    pub status: DiffStatus,
}

/// Number of delta symbols per [`DiffStatus`].
#[allow(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusCounts {
    pub added: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub removed: usize,
}

/// Node of the hierarchical grouping index.
///
/// Levels are section, component, source path. Only the innermost level
/// references delta symbols.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaGroup {
    /// Section, component or path; see [`NO_COMPONENT`] and [`NO_PATH`].
    pub name: String,
    /// Sum of the PSS deltas of every symbol beneath this node.
    pub pss: f64,
    /// Next level, largest absolute change first.
    pub children: Vec<DeltaGroup>,
    /// Indices into [`DeltaSizeInfo::symbols`].
    pub symbols: Vec<usize>,
}

/// Result of [`diff`].
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct DeltaSizeInfo {
    pub before: SizeInfo,
    pub after: SizeInfo,
    /// Ordered by descending absolute PSS delta.
    pub symbols: Vec<DeltaSymbol>,
    /// One group per section, in section order.
    pub groups: Vec<DeltaGroup>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Group name for symbols without a component.
pub const NO_COMPONENT: &str = "(No component)";

/// Group name for symbols without a source path.
pub const NO_PATH: &str = "(No path)";

impl DeltaSizeInfo {
    /// The `after` symbol of `delta`, falling back to the `before` one.
    pub fn symbol(&self, delta: &DeltaSymbol) -> &Symbol {
        match (delta.after, delta.before) {
            (Some(idx), _) => &self.after.symbols[idx],
            (None, Some(idx)) => &self.before.symbols[idx],
            (None, None) => unreachable!("bug: delta symbol without sides"),
        }
    }

    /// Counts delta symbols by status.
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for delta in &self.symbols {
            match delta.status {
                DiffStatus::Added => counts.added += 1,
                DiffStatus::Changed => counts.changed += 1,
                DiffStatus::Unchanged => counts.unchanged += 1,
                DiffStatus::Removed => counts.removed += 1,
            }
        }
        counts
    }

    /// Sum of all PSS deltas.
    pub fn pss(&self) -> f64 {
        self.symbols.iter().map(|x| x.pss).sum()
    }

    /// PSS delta per section.
    pub fn section_pss(&self) -> BTreeMap<SectionName, f64> {
        let mut out = BTreeMap::new();
        for delta in &self.symbols {
            *out.entry(self.symbol(delta).section).or_default() += delta.pss;
        }
        out
    }
}

/// Diffs `before` against `after`.
pub fn diff(before: SizeInfo, after: SizeInfo) -> DeltaSizeInfo {
    let mut matcher = Matcher {
        before: &before,
        after: &after,
        before_left: (0..before.symbols.len()).collect(),
        after_left: (0..after.symbols.len()).collect(),
        pairs: Vec::new(),
    };

    matcher.pass(MatchKind::Key, false, exact_key);
    matcher.pass(MatchKind::Name, true, size_key);
    matcher.pass(MatchKind::Name, false, stripped_name_key);
    matcher.pass(MatchKind::Name, false, short_name_key);
    matcher.pass(MatchKind::Name, true, unique_name_key);

    let Matcher {
        pairs,
        before_left,
        after_left,
        ..
    } = matcher;

    log::debug!(
        "diff: {} pairs, {} removed, {} added",
        pairs.len(),
        before_left.len(),
        after_left.len()
    );

    let mut diagnostics = Vec::new();
    let mut symbols = Vec::with_capacity(pairs.len() + before_left.len() + after_left.len());
    for (b, a, kind) in pairs {
        let (before_aliases, after_aliases) = (before.num_aliases(b), after.num_aliases(a));
        if before_aliases != after_aliases {
            let diagnostic = Diagnostic::InconsistentAlias {
                full_name: after.symbols[a].full_name.clone(),
                before: before_aliases,
                after: after_aliases,
            };
            diagnostic.log();
            diagnostics.push(diagnostic);
        }
        symbols.push(delta(&before, &after, Some(b), Some(a), kind));
    }
    symbols.extend(before_left.into_iter().map(|b| delta(&before, &after, Some(b), None, MatchKind::Removed)));
    symbols.extend(after_left.into_iter().map(|a| delta(&before, &after, None, Some(a), MatchKind::Added)));

    let mut info = DeltaSizeInfo {
        before,
        after,
        symbols,
        groups: Vec::new(),
        diagnostics,
    };
    sort_deltas(&mut info);
    info.groups = build_groups(&info);
    info
}

fn delta(
    before: &SizeInfo,
    after: &SizeInfo,
    b: Option<usize>,
    a: Option<usize>,
    kind: MatchKind,
) -> DeltaSymbol {
    let sizes = |info: &SizeInfo, idx: Option<usize>| match idx {
        Some(idx) => {
            let sym = &info.symbols[idx];
            (info.pss(idx), sym.size_without_padding as i64, sym.padding as i64)
        }
        None => (0.0, 0, 0),
    };

    let (before_pss, before_size, before_padding) = sizes(before, b);
    let (after_pss, after_size, after_padding) = sizes(after, a);

    let mut out = DeltaSymbol {
        before: b,
        after: a,
        pss: after_pss - before_pss,
        size_without_padding: after_size - before_size,
        padding: after_padding - before_padding,
        kind,
        status: DiffStatus::Unchanged,
    };

    out.status = match (b, a) {
        (None, _) => DiffStatus::Added,
        (_, None) => DiffStatus::Removed,
        _ if out.pss != 0.0 || out.size_without_padding != 0 || out.padding != 0 => {
            DiffStatus::Changed
        }
        _ => DiffStatus::Unchanged,
    };

    out
}

/// Sorts by `|pss|` descending, then status, then name.
fn sort_deltas(info: &mut DeltaSizeInfo) {
    let mut order: Vec<usize> = (0..info.symbols.len()).collect();
    order.sort_by(|&x, &y| {
        let (dx, dy) = (&info.symbols[x], &info.symbols[y]);
        let (sx, sy) = (info.symbol(dx), info.symbol(dy));
        dy.pss
            .abs()
            .total_cmp(&dx.pss.abs())
            .then(dx.status.cmp(&dy.status))
            .then_with(|| sx.section.cmp(&sy.section))
            .then_with(|| sx.full_name.cmp(&sy.full_name))
            .then_with(|| (dx.before, dx.after).cmp(&(dy.before, dy.after)))
    });

    let mut sorted: Vec<Option<DeltaSymbol>> = std::mem::take(&mut info.symbols)
        .into_iter()
        .map(Some)
        .collect();
    info.symbols = order.into_iter().filter_map(|idx| sorted[idx].take()).collect();
}

/// Builds the section → component → source path index.
fn build_groups(info: &DeltaSizeInfo) -> Vec<DeltaGroup> {
    type Paths<'a> = BTreeMap<&'a str, Vec<usize>>;
    let mut tree: BTreeMap<SectionName, BTreeMap<&str, Paths<'_>>> = BTreeMap::new();

    for (idx, delta) in info.symbols.iter().enumerate() {
        let sym = info.symbol(delta);
        let component = if sym.component.is_empty() { NO_COMPONENT } else { sym.component.as_str() };
        let path = match sym.id_path() {
            "" => NO_PATH,
            path => path,
        };
        tree.entry(sym.section)
            .or_default()
            .entry(component)
            .or_default()
            .entry(path)
            .or_default()
            .push(idx);
    }

    let leaf = |name: &str, symbols: Vec<usize>| DeltaGroup {
        name: name.to_owned(),
        pss: symbols.iter().map(|&x| info.symbols[x].pss).sum(),
        children: Vec::new(),
        symbols,
    };

    let node = |name: &str, mut children: Vec<DeltaGroup>| {
        children.sort_by(|x, y| y.pss.abs().total_cmp(&x.pss.abs()).then_with(|| x.name.cmp(&y.name)));
        DeltaGroup {
            name: name.to_owned(),
            pss: children.iter().map(|x| x.pss).sum(),
            children,
            symbols: Vec::new(),
        }
    };

    tree.into_iter()
        .map(|(section, components)| {
            let components = components
                .into_iter()
                .map(|(component, paths)| {
                    let paths = paths.into_iter().map(|(path, syms)| leaf(path, syms)).collect();
                    node(component, paths)
                })
                .collect();
            node(section.as_str(), components)
        })
        .collect()
}

type Key<'a> = (&'a str, SectionName, Cow<'a, str>, Cow<'a, str>);

struct Matcher<'a> {
    before: &'a SizeInfo,
    after: &'a SizeInfo,
    before_left: Vec<usize>,
    after_left: Vec<usize>,
    pairs: Vec<(usize, usize, MatchKind)>,
}

impl<'a> Matcher<'a> {
    /// Pairs still-unmatched symbols with equal keys, in symbol order.
    ///
    /// With `unique`, keys must occur exactly once on each side.
    fn pass(&mut self, kind: MatchKind, unique: bool, key: fn(&'a SizeInfo, usize) -> Option<Key<'a>>) {
        let mut by_key: HashMap<Key<'a>, VecDeque<usize>> = HashMap::new();
        for &idx in &self.before_left {
            if let Some(k) = key(self.before, idx) {
                by_key.entry(k).or_default().push_back(idx);
            }
        }

        let after_keys: Vec<(usize, Key<'a>)> = self
            .after_left
            .iter()
            .filter_map(|&idx| Some((idx, key(self.after, idx)?)))
            .collect();

        let mut after_counts: HashMap<&Key<'a>, usize> = HashMap::new();
        if unique {
            for (_, k) in &after_keys {
                *after_counts.entry(k).or_default() += 1;
            }
        }

        let mut matched_before = HashSet::new();
        let mut matched_after = HashSet::new();
        for (idx, k) in &after_keys {
            let Some(queue) = by_key.get_mut(k) else {
                continue;
            };
            if unique && (queue.len() != 1 || after_counts.get(k) != Some(&1)) {
                continue;
            }
            let Some(b) = queue.pop_front() else {
                continue;
            };
            self.pairs.push((b, *idx, kind));
            matched_before.insert(b);
            matched_after.insert(*idx);
        }

        self.before_left.retain(|x| !matched_before.contains(x));
        self.after_left.retain(|x| !matched_after.contains(x));
    }
}

fn container_name(info: &SizeInfo, idx: usize) -> &str {
    info.containers
        .get(info.symbols[idx].container as usize)
        .map_or("", |x| x.name.as_str())
}

fn exact_key(info: &SizeInfo, idx: usize) -> Option<Key<'_>> {
    let sym = &info.symbols[idx];
    let container = container_name(info, idx);
    let name = Cow::Borrowed(sym.full_name.as_str());
    Some(if sym.is_pseudo() || sym.is_overhead() {
        (container, sym.section, name, Cow::Borrowed(""))
    } else if sym.full_name.is_empty() {
        (container, sym.section, Cow::Borrowed(""), Cow::Borrowed(sym.object_path.as_str()))
    } else {
        (container, sym.section, name, Cow::Borrowed(sym.object_path.as_str()))
    })
}

fn size_key(info: &SizeInfo, idx: usize) -> Option<Key<'_>> {
    let sym = &info.symbols[idx];
    if !sym.is_name_unique() {
        return None;
    }
    Some((
        container_name(info, idx),
        sym.section,
        Cow::Borrowed(sym.full_name.as_str()),
        Cow::Owned(sym.size_without_padding.to_string()),
    ))
}

fn stripped_name_key(info: &SizeInfo, idx: usize) -> Option<Key<'_>> {
    let sym = &info.symbols[idx];
    let path = if sym.is_padding_only() { "" } else { sym.id_path() };
    Some((
        container_name(info, idx),
        sym.section,
        strip_digits(&sym.full_name),
        Cow::Borrowed(path),
    ))
}

fn short_name_key(info: &SizeInfo, idx: usize) -> Option<Key<'_>> {
    let sym = &info.symbols[idx];
    if sym.name.is_empty() {
        return None;
    }
    Some((
        container_name(info, idx),
        sym.section,
        Cow::Borrowed(sym.name.as_str()),
        Cow::Borrowed(sym.id_path()),
    ))
}

fn unique_name_key(info: &SizeInfo, idx: usize) -> Option<Key<'_>> {
    let sym = &info.symbols[idx];
    if sym.section.is_native() || !sym.is_name_unique() {
        return None;
    }
    Some((
        container_name(info, idx),
        sym.section,
        Cow::Borrowed(sym.full_name.as_str()),
        Cow::Borrowed(""),
    ))
}

static DIGITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]+").unwrap_or_else(|e| unreachable!("bug: bad regex: {e}")));

/// Removes all digit runs, e.g. `.L__unnamed_12` → `.L__unnamed_`.
fn strip_digits(s: &str) -> Cow<'_, str> {
    DIGITS.replace_all(s, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AliasCluster, AliasKind, Container, ContainerKind};

    fn sym(section: SectionName, size: u64, path: &str, name: Option<&str>) -> Symbol {
        // Trailing letter matters since digits get stripped.
        let name = name.map_or_else(|| format!("{}_{size}A", &section.as_str()[1..]), str::to_owned);
        Symbol {
            object_path: path.to_owned(),
            ..Symbol::new(section, 0, size, &name)
        }
    }

    fn make_info() -> SizeInfo {
        let mut container = Container::new("", ContainerKind::Native);
        container.section_sizes.insert(SectionName::Text, 100);
        container.section_sizes.insert(SectionName::Bss, 40);

        SizeInfo {
            containers: vec![container],
            symbols: vec![
                sym(SectionName::DexMethod, 10, "a", Some("com.Foo#bar()")),
                sym(SectionName::Text, 20, "a", Some(".Lfoo")),
                sym(SectionName::Text, 30, "b", None),
                sym(SectionName::Text, 40, "b", None),
                sym(SectionName::Text, 50, "b", None),
                sym(SectionName::Text, 60, "", None),
            ],
            ..Default::default()
        }
    }

    fn with_aliases(mut info: SizeInfo, ranges: &[(u32, u32)]) -> SizeInfo {
        for &(start, end) in ranges {
            let cluster = info.clusters.len() as u32;
            info.clusters.push(AliasCluster {
                start,
                count: end - start,
                kind: AliasKind::Shared,
            });
            for sym in &mut info.symbols[start as usize..end as usize] {
                sym.aliases = Some(cluster);
            }
        }
        info
    }

    fn set_name(sym: &mut Symbol, full_name: &str, name: &str) {
        sym.full_name = full_name.to_owned();
        sym.template_name = full_name.to_owned();
        sym.name = name.to_owned();
    }

    /// `(changed, added, removed)` and the summed size delta.
    fn summary(d: &DeltaSizeInfo) -> ((usize, usize, usize), i64) {
        let counts = d.counts();
        let size = d.symbols.iter().map(|x| x.size_without_padding).sum();
        ((counts.changed, counts.added, counts.removed), size)
    }

    #[test]
    fn identity() {
        let d = diff(make_info(), make_info());
        assert_eq!(summary(&d), ((0, 0, 0), 0));
        assert_eq!(d.counts().unchanged, 6);
        assert!(d.symbols.iter().all(|x| x.kind == MatchKind::Key));
        assert!(d.diagnostics.is_empty());
    }

    #[test]
    fn add_and_remove() {
        let mut before = make_info();
        before.symbols.remove(0);
        let d = diff(before, make_info());
        assert_eq!(summary(&d), ((0, 1, 0), 10));
        assert_eq!(d.symbols.iter().find(|x| x.kind == MatchKind::Added).unwrap().pss, 10.0);

        let mut after = make_info();
        after.symbols.remove(0);
        let d = diff(make_info(), after);
        assert_eq!(summary(&d), ((0, 0, 1), -10));
    }

    #[test]
    fn change() {
        let mut after = make_info();
        after.symbols[0].size_without_padding += 11;
        after.symbols[0].padding += 20;
        after.symbols[5].size_without_padding += 11;
        let d = diff(make_info(), after);
        assert_eq!(summary(&d), ((2, 0, 0), 22));
        assert_eq!(d.symbols.iter().map(|x| x.padding).sum::<i64>(), 20);
    }

    #[test]
    fn dont_match_across_sections() {
        let mut before = make_info();
        before.symbols.push(sym(SectionName::Text, 11, "asdf", Some("Hello")));
        let mut after = make_info();
        after.symbols.push(sym(SectionName::Rodata, 11, "asdf", Some("Hello")));
        let d = diff(before, after);
        assert_eq!(summary(&d), ((0, 1, 1), 0));
    }

    #[test]
    fn dont_match_across_containers() {
        let containers = vec![
            Container::new("A", ContainerKind::Native),
            Container::new("B", ContainerKind::Native),
        ];
        let mut before = make_info();
        before.containers = containers.clone();
        before.symbols[0].container = 1;
        let mut after = make_info();
        after.containers = containers;
        let d = diff(before, after);
        assert_eq!(summary(&d), ((0, 1, 1), 0));
    }

    #[test]
    fn alias_changes() {
        for (before, after, changed) in [
            (&[(0, 3)][..], &[(0, 2)][..], 3),
            (&[(0, 2)][..], &[(0, 3)][..], 3),
            (&[(0, 2), (2, 5)][..], &[(0, 3), (3, 5)][..], 4),
        ] {
            let d = diff(with_aliases(make_info(), before), with_aliases(make_info(), after));
            assert_eq!(summary(&d), ((changed, 0, 0), 0));
            assert!(!d.diagnostics.is_empty());
        }
    }

    #[test]
    fn star_symbol_normalization() {
        let mut before = make_info();
        set_name(&mut before.symbols[0], "* symbol gap 1 (end of section)", "* symbol gap 1 (end of section)");
        let mut after = make_info();
        set_name(&mut after.symbols[0], "* symbol gap 2 (end of section)", "* symbol gap 2 (end of section)");
        let d = diff(before, after);
        assert_eq!(summary(&d), ((0, 0, 0), 0));
    }

    #[test]
    fn number_normalization() {
        let text = |size, name| sym(SectionName::Text, size, "a", Some(name));
        let mut before = make_info();
        before.symbols.extend([
            text(11, ".L__unnamed_1193"),
            text(22, ".L__unnamed_1194"),
            text(33, "SingleCategoryPreferences$3#this$0"),
            text(44, ".L.ref.tmp.2"),
        ]);
        let mut after = make_info();
        after.symbols.extend([
            text(11, ".L__unnamed_2194"),
            text(22, ".L__unnamed_2195"),
            text(33, "SingleCategoryPreferences$9#this$009"),
            text(44, ".L.ref.tmp.137"),
        ]);
        let d = diff(before, after);
        assert_eq!(summary(&d), ((0, 0, 0), 0));
    }

    #[test]
    fn changed_params() {
        let mut before = make_info();
        set_name(&mut before.symbols[0], "Foo()", "Foo");
        let mut after = make_info();
        set_name(&mut after.symbols[0], "Foo(bool)", "Foo");
        let d = diff(before.clone(), after.clone());
        assert_eq!(summary(&d), ((0, 0, 0), 0));

        // Params and path both changing is one step too far.
        after.symbols[0].object_path = "asdf".into();
        let d = diff(before, after);
        assert_eq!(summary(&d), ((0, 1, 1), 0));
    }

    #[test]
    fn changed_paths() {
        // Native names that aren't globally unique need a stable path.
        let mut after = make_info();
        after.symbols[1].object_path = "asdf".into();
        assert_eq!(summary(&diff(make_info(), after)), ((0, 1, 1), 0));

        // String literals never match across paths.
        let mut before = make_info();
        set_name(&mut before.symbols[0], "string literal", "string literal");
        let mut after = before.clone();
        after.symbols[0].object_path = "asdf".into();
        assert_eq!(summary(&diff(before, after)), ((0, 1, 1), 0));

        // Java names are unique enough.
        let mut after = make_info();
        after.symbols[0].object_path = "asdf".into();
        let d = diff(make_info(), after);
        assert_eq!(summary(&d), ((0, 0, 0), 0));
        assert!(d.symbols.iter().any(|x| x.kind == MatchKind::Name));
    }

    #[test]
    fn grown_and_removed_function() {
        let mut after = make_info();
        after.symbols[2].size_without_padding += 12;
        after.symbols.remove(3);
        let d = diff(make_info(), after);

        assert_eq!(summary(&d), ((1, 0, 1), 12 - 40));
        let changed = d.symbols.iter().find(|x| x.status == DiffStatus::Changed).unwrap();
        assert_eq!(changed.pss, 12.0);
        let removed = d.symbols.iter().find(|x| x.status == DiffStatus::Removed).unwrap();
        assert_eq!(removed.pss, -40.0);
        assert_eq!(d.section_pss()[&SectionName::Text], 12.0 - 40.0);

        // Largest change first.
        assert_eq!(d.symbols[0].status, DiffStatus::Removed);
        assert_eq!(d.symbols[1].status, DiffStatus::Changed);
    }

    #[test]
    fn antisymmetry() {
        let mut after = make_info();
        after.symbols.remove(0);
        let mut after = with_aliases(after, &[(1, 3)]);
        after.symbols[3].size_without_padding += 7;

        let forward = diff(make_info(), after.clone());
        let backward = diff(after, make_info());
        assert!((forward.pss() + backward.pss()).abs() < 1e-9);

        let (f, b) = (forward.counts(), backward.counts());
        assert_eq!((f.added, f.removed, f.changed), (b.removed, b.added, b.changed));
    }

    #[test]
    fn status_tie_break() {
        let mut before = make_info();
        before.symbols.push(sym(SectionName::Rodata, 5, "x", Some("gone")));
        let mut after = make_info();
        after.symbols.push(sym(SectionName::Rodata, 5, "x", Some("new")));
        let d = diff(before, after);

        let statuses: Vec<_> = d.symbols.iter().take(2).map(|x| x.status).collect();
        assert_eq!(statuses, [DiffStatus::Added, DiffStatus::Removed]);
    }

    #[test]
    fn grouping() {
        let mut before = make_info();
        before.symbols[2].component = "Blink".into();
        before.symbols[2].source_path = "third_party/blink/a.cc".into();
        let mut after = before.clone();
        after.symbols[2].size_without_padding += 5;
        after.symbols[3].size_without_padding -= 3;
        let d = diff(before, after);

        let text = d.groups.iter().find(|x| x.name == ".text").unwrap();
        assert_eq!(text.pss, 2.0);
        let blink = text.children.iter().find(|x| x.name == "Blink").unwrap();
        assert_eq!(blink.pss, 5.0);
        assert_eq!(blink.children[0].name, "third_party/blink/a.cc");
        assert_eq!(blink.children[0].symbols.len(), 1);

        let other = text.children.iter().find(|x| x.name == NO_COMPONENT).unwrap();
        assert_eq!(other.pss, -3.0);
        assert!(other.children.iter().any(|x| x.name == NO_PATH));

        // Component with the biggest absolute change first.
        assert_eq!(text.children[0].name, "Blink");
    }
}
