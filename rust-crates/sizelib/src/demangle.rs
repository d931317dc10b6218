// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Cross-language symbol demangling.

use crate::models::Flags;
use std::borrow::Cow;

/// Suffixes appended by optimization passes that create specialized copies
/// of a function. Each is followed by a numeric disambiguator.
const CLONE_SUFFIXES: &[&str] = &[".clone.", ".constprop.", ".isra.", ".part."];

/// Result of demangling a symbol name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Demangled<'a> {
    /// Human readable name.
    pub name: Cow<'a, str>,
    /// Flags derived from suffixes that were stripped from the name.
    pub flags: Flags,
}

/// Strips disambiguation suffixes commonly appended to function clones.
///
/// binutils' demangler will simply consider anything after a `.` to be a
/// clone suffix. C symbols can legitimately end in `.N` though, so we keep
/// a list of specific known suffixes instead. Returns the stripped name and
/// the flags implied by what was removed.
fn strip_clone_suffixes(mut name: &str) -> (&str, Flags) {
    let mut flags = Flags::default();

    // Strip ".cold" suffix first: it follows all others.
    if let Some(stripped) = name.strip_suffix(".cold") {
        name = stripped;
        flags |= Flags::UNLIKELY;
    }

    // LTO appends ".llvm.<hash>" to promoted locals. Not a clone.
    if let Some(pos) = name.rfind(".llvm.") {
        if name[pos + 6..].chars().all(|x| x.is_ascii_digit()) {
            name = &name[..pos];
        }
    }

    // Multiple suffixes can be stacked, e.g. ".constprop.0.isra.0".
    loop {
        let before = name.len();
        for suffix in CLONE_SUFFIXES {
            if let Some(pos) = name.rfind(suffix) {
                let tail = &name[pos + suffix.len()..];
                if !tail.is_empty() && tail.chars().all(|x| x.is_ascii_digit()) {
                    name = &name[..pos];
                    flags |= Flags::CLONE;
                }
            }
        }
        if name.len() == before {
            break;
        }
    }

    (name, flags)
}

fn could_be_rust_symbol(name: &str) -> bool {
    // V0 mangling.
    if name.starts_with("_R") {
        return true;
    }

    // Legacy mangling: _ZN.*17h[a-zA-Z0-9]{16}E
    name.starts_with("_ZN")
        && name.ends_with('E')
        && name.len() > 3 + 3 + 16 + 1
        && &name[name.len() - 3 - 16 - 1..][..3] == "17h"
        && name[name.len() - 16 - 1..][..16]
            .chars()
            .all(|x| x.is_ascii_hexdigit())
}

fn could_be_itanium_abi_cxx_symbol(name: &str) -> bool {
    // mach-O prefixes every symbol with an additional underscore.
    name.starts_with("_Z") || name.starts_with("__Z")
}

/// Demangles the given symbol name.
///
/// Unlike a plain demangler this keeps template arguments: they are part of
/// the symbol's identity and are only stripped later when deriving the
/// `template_name`.
pub fn demangle(name: &str) -> Demangled<'_> {
    let (name, flags) = strip_clone_suffixes(name);

    if could_be_rust_symbol(name) {
        if let Ok(demangler) = rustc_demangle::try_demangle(name) {
            // The alternate formatting using `#` suppresses the hash suffix.
            return Demangled {
                name: Cow::Owned(format!("{:#}", demangler)),
                flags,
            };
        }
    }

    if could_be_itanium_abi_cxx_symbol(name) {
        let mangled = name.strip_prefix('_').filter(|x| x.starts_with("_Z"));
        let mangled = mangled.unwrap_or(name);
        if let Ok(sym) = cpp_demangle::BorrowedSymbol::new(mangled.as_bytes()) {
            let options = cpp_demangle::DemangleOptions::default();
            if let Ok(demangled) = sym.demangle(&options) {
                return Demangled {
                    name: Cow::Owned(demangled),
                    flags,
                };
            }
        }
    }

    Demangled {
        name: Cow::Borrowed(name),
        flags,
    }
}
