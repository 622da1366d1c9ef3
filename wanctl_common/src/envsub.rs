//! `${VAR}` environment interpolation for config files.
//!
//! Runs over the raw config text before YAML parsing, so secrets such as
//! router passwords never live in the file itself. Every referenced variable
//! must be set; missing ones are collected and reported together as a fatal
//! validation error.

/// Interpolation error listing every unresolved variable.
#[derive(Debug, thiserror::Error)]
#[error("undefined environment variable(s) in config: {}", missing.join(", "))]
pub struct EnvSubError {
    /// Names referenced but not set.
    pub missing: Vec<String>,
}

/// Substitute each `${NAME}` with the value of the environment variable.
///
/// `NAME` is `[A-Za-z_][A-Za-z0-9_]*`. A `$` not followed by `{` and
/// malformed references pass through verbatim — YAML content like `$$` or
/// shell snippets in comments must not break the load.
pub fn substitute(input: &str) -> Result<String, EnvSubError> {
    let mut out = String::with_capacity(input.len());
    let mut missing: Vec<String> = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = input[i + 2..].find('}') {
                let name = &input[i + 2..i + 2 + end];
                if is_var_name(name) {
                    match std::env::var(name) {
                        Ok(val) => out.push_str(&val),
                        Err(_) => {
                            if !missing.iter().any(|m| m == name) {
                                missing.push(name.to_string());
                            }
                        }
                    }
                    i += 2 + end + 1;
                    continue;
                }
            }
        }
        let ch = input[i..].chars().next().unwrap_or('\u{fffd}');
        out.push(ch);
        i += ch.len_utf8();
    }

    if missing.is_empty() {
        Ok(out)
    } else {
        Err(EnvSubError { missing })
    }
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_var<F: FnOnce()>(name: &str, value: &str, f: F) {
        // SAFETY: test-local env mutation.
        unsafe { std::env::set_var(name, value) };
        f();
        unsafe { std::env::remove_var(name) };
    }

    #[test]
    fn substitutes_known_variable() {
        with_var("WANCTL_TEST_PW", "s3cret", || {
            let out = substitute("password: ${WANCTL_TEST_PW}\n").unwrap();
            assert_eq!(out, "password: s3cret\n");
        });
    }

    #[test]
    fn missing_variable_is_fatal_and_named() {
        let err = substitute("password: ${WANCTL_TEST_DEFINITELY_UNSET}").unwrap_err();
        assert_eq!(err.missing, vec!["WANCTL_TEST_DEFINITELY_UNSET"]);
    }

    #[test]
    fn all_missing_variables_are_reported_once() {
        let err =
            substitute("a: ${WANCTL_MISS_A}\nb: ${WANCTL_MISS_B}\nc: ${WANCTL_MISS_A}").unwrap_err();
        assert_eq!(err.missing, vec!["WANCTL_MISS_A", "WANCTL_MISS_B"]);
    }

    #[test]
    fn bare_dollar_passes_through() {
        assert_eq!(substitute("cost: $5 and $ {x}").unwrap(), "cost: $5 and $ {x}");
    }

    #[test]
    fn malformed_reference_passes_through() {
        assert_eq!(substitute("${not a name}").unwrap(), "${not a name}");
        assert_eq!(substitute("${").unwrap(), "${");
        assert_eq!(substitute("${}").unwrap(), "${}");
    }

    #[test]
    fn adjacent_references_both_resolve() {
        with_var("WANCTL_TEST_X", "1", || {
            with_var("WANCTL_TEST_Y", "2", || {
                assert_eq!(
                    substitute("${WANCTL_TEST_X}${WANCTL_TEST_Y}").unwrap(),
                    "12"
                );
            });
        });
    }
}
