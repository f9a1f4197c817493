use std::collections::HashSet;

use crate::error::GuardError;
use crate::guard::{Token, TokenKind};

/// Database allow/block lists. Names compare case-insensitively and exactly;
/// there are no wildcards.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allowed: HashSet<String>,
    blocked: HashSet<String>,
}

impl AccessPolicy {
    pub fn new<A, B, S, T>(allowed: A, blocked: B) -> Self
    where
        A: IntoIterator<Item = S>,
        B: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        Self {
            allowed: normalize_names(allowed),
            blocked: normalize_names(blocked),
        }
    }

    pub fn is_allowed(&self, database: &str) -> bool {
        let key = database.to_lowercase();
        if self.blocked.contains(&key) {
            return false;
        }
        self.allowed.is_empty() || self.allowed.contains(&key)
    }

    pub fn check(&self, database: &str) -> Result<(), GuardError> {
        if self.is_allowed(database) {
            Ok(())
        } else {
            Err(GuardError::DatabaseNotAllowed(database.to_string()))
        }
    }

    /// Rejects free text that reaches a database the policy does not allow.
    ///
    /// A qualifier in table-reference position is always a database: `X . Y`
    /// right after FROM, JOIN, a FROM-list comma or DESCRIBE, the first part
    /// of a three-part name, and the database operand of `SHOW … FROM|IN X`.
    /// Those must pass [`AccessPolicy::check`]. Any other `X .` may be a table
    /// alias, so only the block list applies to it.
    pub fn check_references(&self, tokens: &[Token<'_>]) -> Result<(), GuardError> {
        if self.blocked.is_empty() && self.allowed.is_empty() {
            return Ok(());
        }
        let significant: Vec<&Token<'_>> = tokens.iter().filter(|t| t.is_significant()).collect();
        let Some(leading_at) = significant.iter().position(|t| !t.is_punct('(')) else {
            return Ok(());
        };
        let leading = significant[leading_at];
        let describe = ["DESCRIBE", "DESC", "EXPLAIN"].iter().any(|w| leading.word_eq(w));
        let show = leading.word_eq("SHOW");
        // SHOW COLUMNS|INDEX FROM tbl [FROM db]: the first operand is a table.
        let show_table_first = show
            && significant[leading_at + 1..]
                .iter()
                .take(2)
                .any(|t| SHOW_TABLE_FORMS.iter().any(|w| t.word_eq(w)));
        let mut show_operands = 0;

        let mut expect_table = false;
        // One entry per parenthesis depth: whether a comma starts a new table
        // reference at that depth.
        let mut from_list = vec![false];

        for (i, token) in significant.iter().enumerate() {
            let followed_by_dot = significant.get(i + 1).is_some_and(|t| t.is_punct('.'));
            let after_dot = i > 0 && significant[i - 1].is_punct('.');

            if let Some(name) = name_of(token).filter(|_| !after_dot) {
                if followed_by_dot {
                    let three_part = significant.get(i + 3).is_some_and(|t| t.is_punct('.'));
                    if expect_table || three_part {
                        self.check(&name)?;
                    } else if self.blocked.contains(&name.to_lowercase()) {
                        return Err(GuardError::DatabaseNotAllowed(name));
                    }
                } else if show && expect_table && (!show_table_first || show_operands > 1) {
                    self.check(&name)?;
                }
            }

            let top = from_list.len() - 1;
            if i == leading_at {
                expect_table = describe;
            } else if token.is_punct('(') {
                from_list.push(expect_table);
            } else if token.is_punct(')') {
                if from_list.len() > 1 {
                    from_list.pop();
                }
                expect_table = false;
            } else if token.is_punct(',') {
                expect_table = from_list[top];
            } else if token.word_eq("FROM") || (show && token.word_eq("IN")) {
                from_list[top] = true;
                expect_table = true;
                if show {
                    show_operands += 1;
                }
            } else if token.word_eq("JOIN") || token.word_eq("STRAIGHT_JOIN") {
                expect_table = true;
            } else if CLAUSE_WORDS.iter().any(|w| token.word_eq(w)) {
                from_list[top] = false;
                expect_table = false;
            } else if !token.is_punct('.') && !after_dot {
                expect_table = false;
            }
        }
        Ok(())
    }
}

/// Words that end a FROM list.
const CLAUSE_WORDS: &[&str] = &[
    "SELECT", "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "UNION", "EXCEPT", "INTERSECT",
    "WINDOW", "FOR", "INTO",
];

const SHOW_TABLE_FORMS: &[&str] = &["COLUMNS", "FIELDS", "INDEX", "INDEXES", "KEYS"];

fn name_of(token: &Token<'_>) -> Option<String> {
    match token.kind {
        TokenKind::Identifier { quoted: true } => Some(unquote_backticks(token.text)),
        TokenKind::Identifier { quoted: false } | TokenKind::Keyword => Some(token.text.to_string()),
        _ => None,
    }
}

fn normalize_names<I, S>(names: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|n| n.as_ref().trim().to_lowercase())
        .filter(|n| !n.is_empty())
        .collect()
}

fn unquote_backticks(text: &str) -> String {
    text.trim_matches('`').replace("``", "`")
}
