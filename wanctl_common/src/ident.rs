//! Router-side identifier validation.
//!
//! Queue names and rule comments travel into RouterOS CLI commands and REST
//! payloads; the accepted shape is `[A-Za-z0-9][A-Za-z0-9_-]{0,62}` — one
//! leading alphanumeric, then up to 62 alphanumerics, underscores or
//! hyphens. Anything else is rejected at config load, long before a command
//! is built.

/// Identifier validation error.
#[derive(Debug, thiserror::Error)]
#[error("invalid identifier {name:?}: {reason}")]
pub struct IdentError {
    pub name: String,
    pub reason: &'static str,
}

/// Validate a router-side identifier (queue name, rule comment).
pub fn validate_identifier(name: &str) -> Result<(), IdentError> {
    let fail = |reason| {
        Err(IdentError {
            name: name.to_string(),
            reason,
        })
    };

    let mut chars = name.chars();
    match chars.next() {
        None => return fail("empty"),
        Some(c) if c.is_ascii_alphanumeric() => {}
        Some(_) => return fail("must start with an ASCII letter or digit"),
    }
    if name.len() > 63 {
        return fail("longer than 63 characters");
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return fail("contains characters outside [A-Za-z0-9_-]");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_names() {
        for name in ["wan1-down", "WAN_UP", "q0", "a", "ADAPTIVE-STEER"] {
            assert!(validate_identifier(name).is_ok(), "{name} should pass");
        }
    }

    #[test]
    fn accepts_max_length() {
        let name = format!("a{}", "b".repeat(62));
        assert_eq!(name.len(), 63);
        assert!(validate_identifier(&name).is_ok());
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("-leading").is_err());
        assert!(validate_identifier("_leading").is_err());
        assert!(validate_identifier("has space").is_err());
        assert!(validate_identifier("semi;colon").is_err());
        assert!(validate_identifier("quote\"d").is_err());
        let too_long = format!("a{}", "b".repeat(63));
        assert!(validate_identifier(&too_long).is_err());
    }
}
