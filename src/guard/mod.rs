//! Statement safety guard: lexical classification, statement policy and the
//! identifier grammar for generated catalog statements.

pub mod identifier;
pub mod lexer;
pub mod policy;

pub use identifier::validate_simple_identifier;
pub use lexer::{tokenize, Token, TokenKind};

use crate::error::GuardError;

/// Classifies free text and returns its tokens when it is a single read-only
/// statement. Malformed input is rejected before the policy runs.
pub fn check_statement(sql: &str) -> Result<Vec<Token<'_>>, GuardError> {
    if sql.trim().is_empty() {
        return Err(GuardError::EmptyStatement);
    }
    let tokens = tokenize(sql)?;
    policy::evaluate(tokens.iter().copied()).into_result()?;
    Ok(tokens)
}
