//! Route matching — pairs an inbound method/path with a declared function.
//!
//! Matching is intentionally simple: first declaration in scan order whose
//! method and pattern both match wins. There is no specificity ranking; the
//! tie-break is the documented contract, so declaration order (the sorted
//! scan) decides ambiguous paths.

use crate::config::types::FunctionDefinition;
use regex::Regex;

/// Find the first definition matching the request, in scan order.
///
/// Method comparison is case-insensitive. Definitions carrying validation
/// errors are not eligible. Returns `None` when nothing matches.
pub fn find_match<'a>(
    method: &str,
    path: &str,
    definitions: &'a [FunctionDefinition],
) -> Option<&'a FunctionDefinition> {
    definitions.iter().find(|def| {
        def.is_valid()
            && def.method.eq_ignore_ascii_case(method)
            && route_matches(&def.route, path)
    })
}

/// Test a declared route pattern against a request path.
///
/// Leading and trailing slashes are stripped from both sides. An exact
/// string match succeeds immediately; otherwise the pattern is compiled:
/// `{name}` matches one or more non-slash characters, `{name?}` zero or
/// more non-slash characters, and a bare `*` zero or more characters of any
/// kind (it crosses slashes). The compiled matcher is anchored at both ends.
pub fn route_matches(pattern: &str, path: &str) -> bool {
    let pattern = strip_slashes(pattern);
    let path = strip_slashes(path);

    if pattern == path {
        return true;
    }

    match compile_pattern(pattern) {
        Ok(re) => re.is_match(path),
        Err(_invalid) => false,
    }
}

fn strip_slashes(s: &str) -> &str {
    s.trim_start_matches('/').trim_end_matches('/')
}

/// Compile a route pattern into an anchored regex.
fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');

    let mut literal = String::new();
    let mut chars = pattern.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '*' => {
                regex.push_str(&regex::escape(&literal));
                literal.clear();
                regex.push_str(".*");
            }
            '{' => {
                if let Some(close) = pattern[i..].find('}') {
                    regex.push_str(&regex::escape(&literal));
                    literal.clear();

                    let name = &pattern[i + 1..i + close];
                    if name.ends_with('?') {
                        regex.push_str("[^/]*");
                    } else {
                        regex.push_str("[^/]+");
                    }
                    // Consume through the closing brace.
                    for (_, consumed) in chars.by_ref() {
                        if consumed == '}' {
                            break;
                        }
                    }
                } else {
                    literal.push(c);
                }
            }
            _ => literal.push(c),
        }
    }
    regex.push_str(&regex::escape(&literal));
    regex.push('$');

    Regex::new(&regex)
}
