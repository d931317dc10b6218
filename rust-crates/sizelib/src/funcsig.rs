// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Splitting of demangled signatures into `full_name`, `template_name` and `name`.
//!
//! Demangled C++ names are notoriously hard to take apart: parentheses and
//! angle brackets appear in parameter lists, template arguments, lambdas,
//! `decltype` expressions and operator names. The helpers in here track
//! bracket balance while scanning and special-case the handful of constructs
//! that would otherwise throw the balance off.

/// The three name forms of a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// Name without the return type.
    pub full_name: String,
    /// `full_name` with template argument lists emptied (`foo<>`).
    pub template_name: String,
    /// `template_name` without parameter lists.
    pub name: String,
}

fn count(name: &str, ch: u8, start: usize, end: usize) -> i64 {
    let end = end.min(name.len());
    if start >= end {
        return 0;
    }
    name.as_bytes()[start..end].iter().filter(|&&x| x == ch).count() as i64
}

/// `str::find` restricted to `name[start..end]`, returning absolute indices.
fn find_in(name: &str, pat: &str, start: usize, end: usize) -> Option<usize> {
    let end = end.min(name.len());
    if start >= end {
        return None;
    }
    name.get(start..end)?.find(pat).map(|x| x + start)
}

/// Finds the `(` that starts the outer-most parameter list.
fn find_parameter_list_paren(name: &str) -> Option<usize> {
    let bytes = name.as_bytes();
    let mut start = 0;
    let mut template_balance = 0;
    let mut paren_balance = 0;

    loop {
        let idx = find_in(name, "(", start, name.len())?;
        template_balance += count(name, b'<', start, idx) - count(name, b'>', start, idx);

        // Operators with angle brackets.
        if let Some(op) = find_in(name, "operator<", start, idx) {
            template_balance -= if bytes.get(op + 9) == Some(&b'<') { 2 } else { 1 };
        } else if let Some(op) = find_in(name, "operator>", start, idx) {
            template_balance += if bytes.get(op + 9) == Some(&b'>') { 2 } else { 1 };
        }

        paren_balance += count(name, b'(', start, idx) - count(name, b')', start, idx);
        if template_balance == 0 && paren_balance == 0 {
            if find_in(name, "(anonymous namespace)", idx, idx + 21).is_some() {
                start = idx + 21;
                continue;
            }

            // Skip `decltype (...)` and `{lambda(PaintOp*)#63}`.
            if idx == 0
                || (bytes[idx - 1] != b' '
                    && name.get(idx.saturating_sub(7)..idx) != Some("{lambda"))
            {
                return Some(idx);
            }
        }

        start = idx + 1;
        paren_balance += 1;
    }
}

/// Returns the last index of `target` that is not within `()` nor `<>`.
fn find_last_char_outside_of_brackets(name: &str, target: char, end: Option<usize>) -> Option<usize> {
    let mut prev = end.unwrap_or(name.len()).min(name.len());
    let mut paren_balance = 0;
    let mut template_balance = 0;

    loop {
        let idx = name[..prev].rfind(target)?;
        template_balance += count(name, b'<', idx, prev) - count(name, b'>', idx, prev);
        paren_balance += count(name, b'(', idx, prev) - count(name, b')', idx, prev);
        if template_balance == 0 && paren_balance == 0 {
            return Some(idx);
        }
        prev = idx;
    }
}

/// Returns the index of the space that separates return type and name.
fn find_return_value_space(name: &str, paren_idx: usize) -> Option<usize> {
    let mut space = paren_idx;

    // Const cast operators: `operator Foo const()`.
    if find_in(name, " const", paren_idx.saturating_sub(6), paren_idx).is_some() {
        space = paren_idx - 6;
    }

    loop {
        space = find_last_char_outside_of_brackets(name, ' ', Some(space))?;

        // `operator new`, `operator< <T>`, `operator<< <T>`.
        if find_in(name, "operator", space.saturating_sub(8), space).is_some() {
            space -= 8;
        } else if find_in(name, "operator<", space.saturating_sub(9), space).is_some() {
            space -= 9;
        } else if find_in(name, "operator<<", space.saturating_sub(10), space).is_some() {
            space -= 10;
        } else {
            return Some(space);
        }
    }
}

/// Removes clang ABI tags, e.g. `construct[abi:100]<Bar>` -> `construct<Bar>`.
fn strip_abi_tag(mut name: String) -> String {
    let mut start = 0;
    while let Some(tag) = find_in(&name, "[abi:", start, name.len().saturating_sub(1)) {
        let Some(end) = find_in(&name, "]", tag + 5, name.len()) else {
            break;
        };
        name.replace_range(tag..end + 1, "");
        start = tag;
    }
    name
}

/// Empties template argument lists, leaving `<>` to denote a template.
pub fn strip_template_args(name: &str) -> String {
    let mut name = name.to_owned();
    let mut end = name.len();

    loop {
        let Some(right) = name[..end].rfind('>') else {
            return name;
        };

        match find_last_char_outside_of_brackets(&name, '<', Some(right + 1)) {
            Some(left) => {
                name.replace_range(left + 1..right, "");
                end = left;
            }
            None => end = right,
        }
    }
}

/// `cc::{lambda(PaintOp*)#63}::_FUN()` -> `cc::$lambda#63()`
fn normalize_gcc_lambda(name: &str, paren_idx: usize) -> Option<String> {
    let left_brace = name.find('{')?;
    let hash = left_brace + 1 + name[left_brace + 1..].find('#')?;
    let right_brace = hash + 1 + name[hash + 1..].find('}')?;
    let number = &name[hash + 1..right_brace];
    Some(format!(
        "{}$lambda#{}{}",
        &name[..left_brace],
        number,
        &name[paren_idx..]
    ))
}

/// `cc::$_21::__invoke()` -> `cc::$lambda#21()`
fn normalize_clang_lambda(name: &str, paren_idx: usize) -> Option<String> {
    let dollar = name.find('$')?;
    let colon = dollar + 1 + name[dollar + 1..].find(':')?;
    let number = name.get(dollar + 2..colon)?;
    Some(format!(
        "{}$lambda#{}{}",
        &name[..dollar],
        number,
        &name[paren_idx..]
    ))
}

/// Strips the return type and breaks a native signature into its parts.
pub fn parse(signature: &str) -> ParsedName {
    let mut full_name = signature.to_owned();
    let mut no_params = signature.to_owned();

    let paren = find_parameter_list_paren(signature).filter(|&x| x > 0);
    let right_paren = signature.rfind(')');
    if let (Some(left), Some(right)) = (paren, right_paren) {
        if right > left {
            let start = find_return_value_space(signature, left).map_or(0, |x| x + 1);
            let name_no_params = &signature[start..left];

            // Top-level lambdas.
            if name_no_params.ends_with("}::_FUN") {
                if let Some(normalized) = normalize_gcc_lambda(signature, left) {
                    return parse(&normalized);
                }
            }
            if name_no_params.ends_with("::__invoke") && name_no_params.contains("$_") {
                if let Some(normalized) = normalize_clang_lambda(signature, left) {
                    return parse(&normalized);
                }
            }

            full_name = signature[start..].to_owned();
            no_params = format!("{}{}", name_no_params, &signature[right + 1..]);
        }
    }

    let template_name = strip_template_args(&strip_abi_tag(full_name.clone()));
    let name = strip_template_args(&strip_abi_tag(no_params));

    ParsedName {
        full_name,
        template_name,
        name,
    }
}

/// Breaks a Java signature into its parts.
///
/// DEX names carry no generics, so unlike [`parse`] nothing is stripped
/// besides parameter lists and the member type.
///
/// Accepts both the raw `Class [Type] member[(Args)]` form and the
/// normalized `Class member[(Args)][:Type]` form produced by this function,
/// so parsing is idempotent. Members merged from another class keep that
/// class as prefix (`NewClass org.OldClass.member`); `template_name` and
/// `name` then refer to the old class.
pub fn parse_java(signature: &str) -> ParsedName {
    let parts: Vec<&str> = signature.split(' ').collect();
    let (class, member, member_type) = match parts[..] {
        [class] => (class, None, ""),
        [class, rest] => match rest.find(':') {
            Some(colon) => (class, Some(&rest[..colon]), &rest[colon + 1..]),
            None => (class, Some(rest), ""),
        },
        [class, ty, .., member] => (class, Some(member), ty),
        [] => (signature, None, ""),
    };

    let Some(member) = member else {
        return ParsedName {
            full_name: signature.to_owned(),
            template_name: class.to_owned(),
            name: class.rsplit('.').next().unwrap_or(class).to_owned(),
        };
    };

    let full_name = if member_type.is_empty() {
        format!("{class} {member}")
    } else {
        format!("{class} {member}:{member_type}")
    };

    let mut bare_member = match member.find('(') {
        Some(paren) => &member[..paren],
        None => member,
    };

    // Class merging.
    let mut old_class = class;
    if let Some(dot) = bare_member.rfind('.') {
        old_class = &bare_member[..dot];
        bare_member = &bare_member[dot + 1..];
    }
    let short_class = old_class.rsplit('.').next().unwrap_or(old_class);

    ParsedName {
        full_name,
        template_name: format!("{old_class} {bare_member}"),
        name: format!("{short_class} {bare_member}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Checks parsing of `ret name params after` with and without return type.
    fn check(ret: &str, name: &str, params: &str, after: &str, expected_name: &str) {
        for sig in [format!("{name}{params}{after}"), format!("{ret}{name}{params}{after}")] {
            let parsed = parse(&sig);
            assert_eq!(parsed.full_name, format!("{name}{params}{after}"), "{sig}");
            assert_eq!(parsed.name, expected_name, "{sig}");
            assert_eq!(
                parsed.template_name,
                strip_template_args(&parsed.full_name),
                "{sig}"
            );
        }
    }

    #[test]
    fn native_signatures() {
        check(
            "bool ",
            "foo::Bar<unsigned int, int>::Do<unsigned int>",
            "(unsigned int)",
            "",
            "foo::Bar<>::Do<>",
        );
        check(
            "base::internal::CheckedNumeric<int>& ",
            "base::internal::CheckedNumeric<int>::operator+=<int>",
            "(int)",
            "",
            "base::internal::CheckedNumeric<>::operator+=<>",
        );
        check(
            "",
            "(anonymous namespace)::GetBridge",
            "(long long)",
            "",
            "(anonymous namespace)::GetBridge",
        );
        check("", "operator delete", "(void*)", "", "operator delete");
        check(
            "",
            "cc::LayerIterator::operator cc::LayerIteratorPosition const",
            "()",
            " const",
            "cc::LayerIterator::operator cc::LayerIteratorPosition const const",
        );
        check(
            "decltype ({parm#1}((SkRecords::NoOp)())) ",
            "SkRecord::Record::visit<SkRecords::Draw&>",
            "(SkRecords::Draw&)",
            " const",
            "SkRecord::Record::visit<> const",
        );
        check(
            "std::basic_ostream<char, std::char_traits<char> >& ",
            "std::operator<< <std::char_traits<char> >",
            "(std::basic_ostream<char, std::char_traits<char> >&, char)",
            "",
            "std::operator<< <>",
        );
        check(
            "",
            "std::basic_istream<char>::operator>",
            "(unsigned int&)",
            "",
            "std::basic_istream<>::operator>",
        );
        check("int ", "Foo<int()>::bar<a<b> >", "()", "", "Foo<>::bar<>");
        check("", "Foo", "()", " [virtual thunk]", "Foo [virtual thunk]");
        check(
            "",
            "blink::CSSValueKeywordsHash::findValueImpl",
            "(char const*)",
            "::value_word_list",
            "blink::CSSValueKeywordsHash::findValueImpl::value_word_list",
        );
    }

    #[test]
    fn nested_class_in_function() {
        let sig = "(anonymous namespace)::Foo::Baz() const::GLSLFP::onData(Foo, Bar)";
        let parsed = parse(sig);
        assert_eq!(parsed.full_name, sig);
        assert_eq!(parsed.name, "(anonymous namespace)::Foo::Baz");
    }

    #[test]
    fn lambdas() {
        for sig in [
            "cc::{lambda(cc::PaintOp*)#63}::_FUN(cc::PaintOp*)",
            "cc::$_63::__invoke(cc::PaintOp*)",
        ] {
            let parsed = parse(sig);
            assert_eq!(parsed.full_name, "cc::$lambda#63(cc::PaintOp*)");
            assert_eq!(parsed.name, "cc::$lambda#63");
        }
    }

    #[test]
    fn abi_tags() {
        let parsed = parse("std::allocator<Foo>::construct[abi:v160006]<Bar>(Bar*)");
        assert_eq!(parsed.name, "std::allocator<>::construct<>");
    }

    #[test]
    fn plain_names() {
        let parsed = parse("kSomeTable");
        assert_eq!(parsed.full_name, "kSomeTable");
        assert_eq!(parsed.template_name, "kSomeTable");
        assert_eq!(parsed.name, "kSomeTable");
    }

    #[test]
    fn java() {
        let parsed = parse_java("org.ClassName java.util.List getCameraInfo()");
        assert_eq!(parsed.full_name, "org.ClassName getCameraInfo():java.util.List");
        assert_eq!(parsed.template_name, "org.ClassName getCameraInfo");
        assert_eq!(parsed.name, "ClassName getCameraInfo");
        assert_eq!(parse_java(&parsed.full_name), parsed);

        let parsed = parse_java("org.ClassName$Inner <init>(byte[])");
        assert_eq!(parsed.full_name, "org.ClassName$Inner <init>(byte[])");
        assert_eq!(parsed.name, "ClassName$Inner <init>");
        assert_eq!(parse_java(&parsed.full_name), parsed);

        let parsed = parse_java("org.ClassName");
        assert_eq!(parsed.template_name, "org.ClassName");
        assert_eq!(parsed.name, "ClassName");

        let parsed = parse_java("org.ClassName some.Type mField");
        assert_eq!(parsed.full_name, "org.ClassName mField:some.Type");
        assert_eq!(parsed.name, "ClassName mField");

        let parsed = parse_java("org.NewClass int org.OldClass.readShort(int,int)");
        assert_eq!(parsed.full_name, "org.NewClass org.OldClass.readShort(int,int):int");
        assert_eq!(parsed.template_name, "org.OldClass readShort");
        assert_eq!(parsed.name, "OldClass readShort");
        assert_eq!(parse_java(&parsed.full_name), parsed);
    }
}
