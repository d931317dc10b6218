// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Human readable reports for [`SizeInfo`] and [`DeltaSizeInfo`].

use crate::diag;
use crate::diff::{DeltaGroup, DeltaSizeInfo, DiffStatus};
use crate::models::{Container, Flags, SectionName, SizeInfo, Symbol};
use std::collections::{BTreeMap, BTreeSet};

/// Formats a byte count with a unit, keeping three significant digits.
pub fn pretty_size(size: f64) -> String {
    if size.abs() < 2000.0 {
        return format!("{size:.0} bytes");
    }
    let kb = size / 1024.0;
    match kb.abs() {
        x if x < 10.0 => format!("{kb:.2}kb"),
        x if x < 100.0 => format!("{kb:.1}kb"),
        x if x < 1024.0 => format!("{kb:.0}kb"),
        _ => {
            let mb = kb / 1024.0;
            if mb.abs() < 10.0 {
                format!("{mb:.2}mb")
            } else {
                format!("{mb:.1}mb")
            }
        }
    }
}

/// Formats a proportional size.
///
/// Small values keep a decimal so that shared symbols don't show up as 0.
pub fn format_pss(pss: f64, force_sign: bool) -> String {
    if pss.abs() > 10.0 {
        let pss = pss.trunc();
        return if force_sign { format!("{pss:+.0}") } else { format!("{pss:.0}") };
    }
    let near_int = pss.abs().fract() < 0.05;
    if near_int && pss.abs() < 1.0 && pss != 0.0 {
        return "~0".to_owned();
    }
    match (force_sign, near_int) {
        (true, true) => format!("{pss:+.0}"),
        (true, false) => format!("{pss:+.1}"),
        (false, true) => format!("{pss:.0}"),
        (false, false) => format!("{pss:.1}"),
    }
}

fn percent(part: f64, total: f64) -> String {
    if total == 0.0 {
        return "0.0%".to_owned();
    }
    format!("{:.1}%", part / total * 100.0)
}

fn describe_dict(out: &mut Vec<String>, indent: &str, dict: &BTreeMap<String, String>) {
    for (key, value) in dict {
        if value.contains('\n') {
            out.push(format!("{indent}{key}="));
            out.extend(value.lines().map(|line| format!("{indent}    {line}")));
        } else {
            out.push(format!("{indent}{key}={value}"));
        }
    }
}

fn describe_section_sizes(out: &mut Vec<String>, indent: &str, container: &Container) {
    let total: u64 = container
        .section_sizes
        .iter()
        .filter(|(section, _)| section.is_on_disk())
        .map(|(_, size)| size)
        .sum();

    out.push(format!(
        "{indent}Section Sizes (Total={} ({total} bytes)):",
        pretty_size(total as f64)
    ));
    for (section, &size) in &container.section_sizes {
        if section.is_on_disk() {
            out.push(format!(
                "{indent}    {section}: {} ({size} bytes) ({})",
                pretty_size(size as f64),
                percent(size as f64, total as f64)
            ));
        } else {
            out.push(format!(
                "{indent}    {section}: {} ({size} bytes) (not included in totals)",
                pretty_size(size as f64)
            ));
        }
    }
}

/// Lines describing how well the symbols of one container cover its sections.
fn describe_coverage(out: &mut Vec<String>, info: &SizeInfo, container_idx: u32) {
    let container = &info.containers[container_idx as usize];
    let mut sections: BTreeSet<SectionName> = container.section_sizes.keys().copied().collect();
    let mut by_section: BTreeMap<SectionName, Vec<usize>> = BTreeMap::new();
    for (idx, sym) in info.symbols.iter().enumerate() {
        if sym.container == container_idx {
            by_section.entry(sym.section).or_default().push(idx);
            sections.insert(sym.section);
        }
    }

    for section in sections {
        let idxs = by_section.remove(&section).unwrap_or_default();
        let syms: Vec<&Symbol> = idxs.iter().map(|&i| &info.symbols[i]).collect();
        let actual: f64 = idxs.iter().map(|&i| info.pss(i)).sum();

        match container.section_sizes.get(&section) {
            Some(&expected) => out.push(format!(
                "Section {section}: has {} of {expected} bytes accounted for from {} symbols. \
                 {:.0} bytes are unaccounted for.",
                percent(actual, expected as f64),
                syms.len(),
                expected as f64 - actual,
            )),
            None => out.push(format!(
                "Section {section}: {actual:.0} bytes from {} symbols.",
                syms.len()
            )),
        }

        let padding: u64 = syms.iter().map(|x| x.padding).sum();
        out.push(format!(
            "* Padding accounts for {padding} bytes ({})",
            percent(padding as f64, actual)
        ));

        let mut count = |pred: &dyn Fn(&Symbol) -> bool, what: &str, always: bool| {
            let matching: Vec<usize> = idxs.iter().copied().filter(|&i| pred(&info.symbols[i])).collect();
            if matching.is_empty() && !always {
                return;
            }
            let size: f64 = matching.iter().map(|&i| info.pss(i)).sum();
            out.push(format!(
                "* {} {what}. Accounts for {size:.0} bytes ({}).",
                matching.len(),
                percent(size, actual)
            ));
        };

        count(&|s: &Symbol| !s.source_path.is_empty(), "have source paths", true);
        count(&|s: &Symbol| !s.component.is_empty(), "have a component assigned", true);
        count(&|s: &Symbol| s.full_name.starts_with('*'), "placeholders exist (symbols that start with **)", false);
        count(
            &|s: &Symbol| s.full_name.is_empty() && s.source_path.is_empty() && s.object_path.is_empty(),
            "symbols have no name or path",
            false,
        );
        if section == SectionName::Rodata {
            count(&|s: &Symbol| s.is_string_literal(), "string literals exist", true);
        }
        for (flag, desc) in [
            (Flags::HOT, "symbols are marked as \"hot\""),
            (Flags::UNLIKELY, "symbols are marked as \"unlikely\""),
            (Flags::STARTUP, "symbols are marked as \"startup\""),
            (Flags::CLONE, "symbols are clones"),
            (Flags::GENERATED_SOURCE, "symbols are from generated sources"),
            (Flags::UNCOMPRESSED, "symbols are uncompressed"),
        ] {
            count(&|s: &Symbol| s.flags.contains(flag), desc, false);
        }

        let aliased: Vec<usize> = idxs.iter().copied().filter(|&i| info.symbols[i].aliases.is_some()).collect();
        if !aliased.is_empty() {
            let clusters: BTreeSet<u32> = aliased.iter().filter_map(|&i| info.symbols[i].aliases).collect();
            let saved: u64 = clusters
                .iter()
                .map(|&c| &info.clusters[c as usize])
                .filter(|c| c.kind == crate::models::AliasKind::Shared)
                .map(|c| info.symbols[c.start as usize].size_without_padding * u64::from(c.count - 1))
                .sum();
            out.push(format!(
                "* {} aliases exist, mapped to {} unique addresses ({saved} bytes saved)",
                aliased.len(),
                clusters.len()
            ));
        }
    }
}

/// Describes containers, metadata and section coverage of `info`.
pub fn describe_size_info(info: &SizeInfo) -> Vec<String> {
    let mut out = Vec::new();

    if !info.build_config.is_empty() {
        out.push("Build config:".to_owned());
        describe_dict(&mut out, "    ", &info.build_config);
    }
    if !info.metadata.is_empty() {
        out.push("Metadata:".to_owned());
        let mut metadata = info.metadata.clone();
        metadata.remove(diag::METADATA_KEY);
        describe_dict(&mut out, "    ", &metadata);
    }

    for (idx, container) in info.containers.iter().enumerate() {
        out.push(String::new());
        out.push(format!("Container <{}> ({})", container.name, container.kind.as_str()));
        if !container.metadata.is_empty() {
            out.push("    Metadata:".to_owned());
            describe_dict(&mut out, "        ", &container.metadata);
        }
        describe_section_sizes(&mut out, "    ", container);
        out.push(String::new());
        describe_coverage(&mut out, info, idx as u32);
    }

    let diagnostics = diag::load(&info.metadata);
    if !diagnostics.is_empty() {
        out.push(String::new());
        out.push(format!("Diagnostics ({}):", diagnostics.len()));
        out.extend(diagnostics.iter().map(|x| format!("    {x}")));
    }

    out
}

fn describe_metadata_delta(out: &mut Vec<String>, before: &BTreeMap<String, String>, after: &BTreeMap<String, String>) {
    let changed: BTreeSet<&String> = before
        .keys()
        .chain(after.keys())
        .filter(|k| before.get(*k) != after.get(*k))
        .collect();
    if changed.is_empty() {
        return;
    }

    out.push("Changed metadata:".to_owned());
    for key in changed {
        let fmt = |v: Option<&String>| v.map_or_else(|| "(none)".to_owned(), |v| v.replace('\n', " "));
        out.push(format!("    {key}: {} -> {}", fmt(before.get(key)), fmt(after.get(key))));
    }
}

fn describe_group(out: &mut Vec<String>, group: &DeltaGroup, depth: usize, max_depth: usize) {
    if group.pss == 0.0 && depth > 0 {
        return;
    }
    out.push(format!(
        "{:indent$}{}: {}",
        "",
        group.name,
        format_pss(group.pss, true),
        indent = depth * 4
    ));
    if depth + 1 < max_depth {
        for child in &group.children {
            describe_group(out, child, depth + 1, max_depth);
        }
    }
}

fn describe_delta_symbol(diff: &DeltaSizeInfo, idx: usize) -> String {
    let delta = &diff.symbols[idx];
    let sym = diff.symbol(delta);
    let mut line = format!(
        "{} {}@{:#x} pss={} padding={:+} size_without_padding={:+}",
        delta.status.marker(),
        sym.section,
        sym.address,
        format_pss(delta.pss, true),
        delta.padding,
        delta.size_without_padding,
    );
    line += &format!(" {}", sym.full_name);
    if !sym.id_path().is_empty() {
        line += &format!(" ({})", sym.id_path());
    }
    if !sym.flags.is_empty() {
        line += &format!(" flags={{{}}}", sym.flags);
    }
    line
}

/// Describes a diff: summary, grouped deltas and the largest changes.
///
/// At most `limit` changed symbols are listed.
pub fn describe_delta(diff: &DeltaSizeInfo, limit: usize) -> Vec<String> {
    let mut out = Vec::new();

    describe_metadata_delta(&mut out, &diff.before.metadata, &diff.after.metadata);

    let counts = diff.counts();
    out.push(format!(
        "{} symbols added (+), {} changed (~), {} removed (-), {} unchanged (not shown)",
        counts.added, counts.changed, counts.removed, counts.unchanged
    ));

    let mut by_section: BTreeMap<SectionName, i64> = BTreeMap::new();
    let (mut grew, mut shrank) = (0, 0);
    for delta in &diff.symbols {
        let section = diff.symbol(delta).section;
        match delta.status {
            DiffStatus::Added => *by_section.entry(section).or_default() += 1,
            DiffStatus::Removed => *by_section.entry(section).or_default() -= 1,
            DiffStatus::Changed if delta.pss > 0.0 => grew += 1,
            DiffStatus::Changed if delta.pss < 0.0 => shrank += 1,
            _ => {}
        }
    }
    if !by_section.is_empty() {
        let parts: Vec<String> = by_section.iter().map(|(s, n)| format!("{s}: {n:+}")).collect();
        out.push(format!("Added/Removed by section: {}", parts.join(" ")));
    }
    out.push(format!("Of changed symbols, {grew} grew, {shrank} shrank"));

    out.push(String::new());
    out.push(format!(
        "Section PSS deltas (Total={}):",
        format_pss(diff.pss(), true)
    ));
    for (section, pss) in diff.section_pss() {
        if pss != 0.0 {
            out.push(format!("    {section}: {}", format_pss(pss, true)));
        }
    }

    out.push(String::new());
    out.push("By section, component and path:".to_owned());
    for group in &diff.groups {
        describe_group(&mut out, group, 1, 4);
    }

    let shown: Vec<usize> = (0..diff.symbols.len())
        .filter(|&i| diff.symbols[i].status != DiffStatus::Unchanged)
        .collect();
    out.push(String::new());
    out.push(format!("Showing {} of {} changed symbols:", shown.len().min(limit), shown.len()));
    out.extend(shown.iter().take(limit).map(|&i| describe_delta_symbol(diff, i)));

    if !diff.diagnostics.is_empty() {
        out.push(String::new());
        out.push(format!("Diagnostics ({}):", diff.diagnostics.len()));
        out.extend(diff.diagnostics.iter().map(|x| format!("    {x}")));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{keys, ContainerKind};

    #[test]
    fn sizes() {
        assert_eq!(pretty_size(0.0), "0 bytes");
        assert_eq!(pretty_size(1999.0), "1999 bytes");
        assert_eq!(pretty_size(-1999.0), "-1999 bytes");
        assert_eq!(pretty_size(4096.0), "4.00kb");
        assert_eq!(pretty_size(20480.0), "20.0kb");
        assert_eq!(pretty_size(512.0 * 1024.0), "512kb");
        assert_eq!(pretty_size(3.0 * 1024.0 * 1024.0), "3.00mb");
        assert_eq!(pretty_size(-30.0 * 1024.0 * 1024.0), "-30.0mb");
    }

    #[test]
    fn pss() {
        assert_eq!(format_pss(12.7, false), "12");
        assert_eq!(format_pss(12.0, true), "+12");
        assert_eq!(format_pss(-40.0, true), "-40");
        assert_eq!(format_pss(0.0, true), "+0");
        assert_eq!(format_pss(0.01, false), "~0");
        assert_eq!(format_pss(2.5, false), "2.5");
        assert_eq!(format_pss(-2.5, true), "-2.5");
        assert_eq!(format_pss(3.0, false), "3");
    }

    fn make_info() -> SizeInfo {
        let mut container = Container::new("libfoo.so", ContainerKind::Native);
        container.section_sizes.insert(SectionName::Text, 100);
        container.section_sizes.insert(SectionName::Bss, 40);
        container.metadata.insert(keys::ELF_ARCH.into(), "x86_64".into());

        let mut symbols = vec![
            Symbol::new(SectionName::Text, 0x1000, 40, "foo()"),
            Symbol::new(SectionName::Text, 0x1028, 60, "bar()"),
            Symbol::new(SectionName::Bss, 0x4000, 40, "g_counter"),
        ];
        symbols[0].source_path = "base/foo.cc".into();
        symbols[1].flags = Flags::HOT;

        let mut info = SizeInfo {
            containers: vec![container],
            symbols,
            ..Default::default()
        };
        info.build_config.insert(keys::BUILD_CONFIG_GN_ARGS.into(), "is_debug=false\nuse_lld=true".into());
        info
    }

    #[test]
    fn size_info_report() {
        let lines = describe_size_info(&make_info());
        let has = |s: &str| lines.iter().any(|x| x == s);

        assert!(has("Build config:"));
        assert!(has("    gn_args="));
        assert!(has("        use_lld=true"));
        assert!(has("Container <libfoo.so> (native)"));
        assert!(has("    Section Sizes (Total=100 bytes (100 bytes)):"));
        assert!(has("        .text: 100 bytes (100 bytes) (100.0%)"));
        assert!(has("        .bss: 40 bytes (40 bytes) (not included in totals)"));
        assert!(has(
            "Section .text: has 100.0% of 100 bytes accounted for from 2 symbols. 0 bytes are unaccounted for."
        ));
        assert!(has("* 1 have source paths. Accounts for 40 bytes (40.0%)."));
        assert!(has("* 1 symbols are marked as \"hot\". Accounts for 60 bytes (60.0%)."));
    }

    #[test]
    fn delta_report() {
        let before = make_info();
        let mut after = make_info();
        after.symbols[0].size_without_padding = 52;
        after.symbols.remove(1);
        after.metadata.insert(keys::SOURCE_COMMIT.into(), "abc".into());

        let diff = crate::diff::diff(before, after);
        let lines = describe_delta(&diff, 1);
        let has = |s: &str| lines.iter().any(|x| x == s);

        assert!(has("Changed metadata:"));
        assert!(has("    source_commit: (none) -> abc"));
        assert!(has("0 symbols added (+), 1 changed (~), 1 removed (-), 1 unchanged (not shown)"));
        assert!(has("Added/Removed by section: .text: -1"));
        assert!(has("Of changed symbols, 1 grew, 0 shrank"));
        assert!(has("    .text: -48"));
        assert!(has("Showing 1 of 2 changed symbols:"));
        assert!(lines.iter().any(|x| x.starts_with("- .text@0x1028 pss=-60") && x.contains("bar()")));
        assert!(!lines.iter().any(|x| x.contains("foo()") && x.starts_with('~')));
    }
}
