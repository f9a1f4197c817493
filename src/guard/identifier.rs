use crate::error::GuardError;

/// Longest name the server accepts for a database, table or routine.
pub const MAX_IDENTIFIER_LEN: usize = 64;

const MAX_PARTS: usize = 3;

/// A caller-supplied object name that passed [`validate_identifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    parts: Vec<String>,
}

impl QualifiedName {
    /// The last part: the object itself.
    pub fn object(&self) -> &str {
        // validate_identifier never produces an empty name
        self.parts.last().map(String::as_str).unwrap_or_default()
    }

    /// The part directly before the object, if the name was qualified.
    pub fn qualifier(&self) -> Option<&str> {
        if self.parts.len() >= 2 {
            Some(&self.parts[self.parts.len() - 2])
        } else {
            None
        }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }
}

/// Validates that a caller-supplied name contains only letters, digits and
/// underscores, optionally dot-qualified and with each part wrapped in `[…]` or
/// backticks. This is the only way a caller-supplied name reaches a generated
/// statement.
pub fn validate_identifier(name: &str) -> Result<QualifiedName, GuardError> {
    if name.is_empty() {
        return Err(GuardError::InvalidIdentifier(
            "identifier cannot be empty".to_string(),
        ));
    }

    let raw_parts: Vec<&str> = name.split('.').collect();
    if raw_parts.len() > MAX_PARTS {
        return Err(invalid(name, "too many qualification levels"));
    }

    let mut parts = Vec::with_capacity(raw_parts.len());
    for raw in raw_parts {
        let inner = unwrap_delimiters(raw).ok_or_else(|| invalid(name, "unbalanced brackets or quotes"))?;
        if inner.is_empty() {
            return Err(invalid(name, "empty name part"));
        }
        if inner.chars().count() > MAX_IDENTIFIER_LEN {
            return Err(invalid(
                name,
                &format!("name parts are limited to {MAX_IDENTIFIER_LEN} characters"),
            ));
        }
        if !inner.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(invalid(
                name,
                "only letters, digits, underscores, dots and brackets are allowed",
            ));
        }
        parts.push(inner.to_string());
    }

    Ok(QualifiedName { parts })
}

/// Validates a name that must not be qualified, such as a database name.
pub fn validate_simple_identifier(name: &str) -> Result<String, GuardError> {
    let qualified = validate_identifier(name)?;
    if qualified.parts.len() != 1 {
        return Err(invalid(name, "a qualified name is not allowed here"));
    }
    Ok(qualified.object().to_string())
}

pub fn quote_part(part: &str) -> String {
    format!("`{}`", part.replace('`', "``"))
}

fn unwrap_delimiters(part: &str) -> Option<&str> {
    let opened = part.starts_with('[') || part.starts_with('`');
    let closed = part.ends_with(']') || part.ends_with('`');
    match (opened, closed) {
        (false, false) => Some(part),
        (true, true) if part.len() >= 2 => {
            let valid_pair = (part.starts_with('[') && part.ends_with(']'))
                || (part.starts_with('`') && part.ends_with('`'));
            valid_pair.then(|| &part[1..part.len() - 1])
        }
        _ => None,
    }
}

fn invalid(name: &str, reason: &str) -> GuardError {
    // Echo at most a short prefix of hostile input back to the caller.
    let shown: String = name.chars().take(80).collect();
    GuardError::InvalidIdentifier(format!("'{shown}': {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert_eq!(validate_identifier("users").unwrap().object(), "users");
        assert_eq!(validate_identifier("my_table_123").unwrap().object(), "my_table_123");
        assert_eq!(validate_identifier("_hidden").unwrap().object(), "_hidden");
        assert_eq!(validate_identifier("123").unwrap().object(), "123");

        let name = validate_identifier("dbo.Users").unwrap();
        assert_eq!(name.qualifier(), Some("dbo"));
        assert_eq!(name.object(), "Users");

        let name = validate_identifier("[dbo].[Users]").unwrap();
        assert_eq!(name.parts(), &["dbo".to_string(), "Users".to_string()]);

        let name = validate_identifier("`sales`.orders").unwrap();
        assert_eq!(name.qualifier(), Some("sales"));
    }

    #[test]
    fn test_invalid_identifiers() {
        for name in [
            "",
            "Users; DROP TABLE Users",
            "users--",
            "users/*",
            "table with spaces",
            "table-with-dashes",
            "' OR '1'='1",
            "a..b",
            ".users",
            "users.",
            "[users",
            "users]",
            "[users`",
            "[]",
            "a.b.c.d",
            "users\n",
            "us`ers",
        ] {
            assert!(
                matches!(validate_identifier(name), Err(GuardError::InvalidIdentifier(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_length_limit() {
        let ok = "a".repeat(MAX_IDENTIFIER_LEN);
        assert!(validate_identifier(&ok).is_ok());
        let too_long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(validate_identifier(&too_long).is_err());
    }

    #[test]
    fn test_simple_identifier_rejects_qualification() {
        assert_eq!(validate_simple_identifier("Sales").unwrap(), "Sales");
        assert_eq!(validate_simple_identifier("[Sales]").unwrap(), "Sales");
        assert!(validate_simple_identifier("Sales.dbo").is_err());
    }

    #[test]
    fn test_quote_part_escapes_backticks() {
        assert_eq!(quote_part("orders"), "`orders`");
        assert_eq!(quote_part("a`b"), "`a``b`");
    }
}
