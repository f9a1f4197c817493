//! Lexical classification of raw SQL text.
//!
//! The lexer never interprets the statement. It only splits the text into
//! tokens so that string literals, quoted identifiers and comments can be kept
//! out of keyword matching. Quoting and comment rules follow the MySQL server:
//!
//! - `'…'` and `"…"` are string literals, closed by the same quote, with both
//!   doubled-quote and backslash escapes.
//! - `` `…` `` is a quoted identifier, escaped by a doubled backtick.
//! - `#` and `-- ` start line comments. `--` must be followed by whitespace, a
//!   control character or end of input, otherwise it is two minus signs.
//! - `/* … */` is a block comment closed by the first `*/`. Executable comments
//!   (`/*! … */`, `/*M! … */`) are run by the server and are refused.
//!
//! Anything left unterminated fails the whole input.
//!
//! These are the server's rules only while `sql_mode` lacks
//! NO_BACKSLASH_ESCAPES and ANSI_QUOTES; `db::connect_with_retry` clears both
//! from every pooled session and refuses connections that keep them.

use crate::error::GuardError;

/// Words the classifier reports as [`TokenKind::Keyword`]. Every other bare word
/// is an unquoted identifier.
const KEYWORDS: &[&str] = &[
    "ALL", "ALTER", "ANALYZE", "AND", "AS", "ASC", "BACKUP", "BETWEEN", "BULK", "BY", "CALL",
    "CASE", "CREATE", "CROSS", "DEALLOCATE", "DELETE", "DENY", "DESC", "DESCRIBE", "DISTINCT",
    "DROP", "DUMPFILE", "ELSE", "END", "EXCEPT", "EXEC", "EXECUTE", "EXISTS", "EXPLAIN", "FLUSH",
    "FOR", "FROM", "FULL", "GRANT", "GROUP", "HANDLER", "HAVING", "IN", "INNER", "INSERT",
    "INSTALL", "INTERSECT", "INTO", "IS", "JOIN", "KILL", "LATERAL", "LEFT", "LIKE", "LIMIT",
    "LOAD", "LOCK", "MERGE", "NATURAL", "NOT", "NULL", "OFFSET", "ON", "OPTIMIZE", "OR", "ORDER",
    "OUTER", "OUTFILE", "OVER", "PARTITION", "PREPARE", "PROCEDURE", "PURGE", "RECURSIVE",
    "RENAME", "REPAIR", "REPLACE", "RESET", "RESTORE", "REVOKE", "RIGHT", "SELECT", "SET",
    "SHOW", "SHUTDOWN", "TABLE", "THEN", "TOP", "TRUNCATE", "UNINSTALL", "UNION", "UNLOCK",
    "UPDATE", "UPSERT", "USING", "VALUES", "WHEN", "WHERE", "WINDOW", "WITH",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Keyword,
    /// A bare word that is not a keyword, or a backtick-quoted name.
    Identifier { quoted: bool },
    StringLiteral,
    Comment,
    Punctuation,
    Number,
    Whitespace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset of the token in the source text.
    pub offset: usize,
}

impl<'a> Token<'a> {
    /// Whitespace and comments carry no meaning for the policy.
    pub fn is_significant(&self) -> bool {
        !matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }

    /// An unquoted word, keyword or not. These are the only tokens matched
    /// against statement keywords and routine names.
    pub fn is_bare_word(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Keyword | TokenKind::Identifier { quoted: false }
        )
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punctuation && self.text.len() == c.len_utf8() && self.text.starts_with(c)
    }

    pub fn word_eq(&self, word: &str) -> bool {
        self.is_bare_word() && self.text.eq_ignore_ascii_case(word)
    }
}

/// Single-pass token stream over a SQL string. After the first error the
/// iterator is exhausted.
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    failed: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            failed: false,
        }
    }

    fn bytes(&self) -> &'a [u8] {
        self.src.as_bytes()
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes().get(self.pos + ahead).copied()
    }

    fn emit(&mut self, kind: TokenKind, end: usize) -> Token<'a> {
        let token = Token {
            kind,
            text: &self.src[self.pos..end],
            offset: self.pos,
        };
        self.pos = end;
        token
    }

    fn scan(&mut self) -> Result<Token<'a>, GuardError> {
        let bytes = self.bytes();
        let start = self.pos;
        let b = bytes[start];

        if b.is_ascii_whitespace() || b == 0x0b {
            let end = scan_while(bytes, start, |c| c.is_ascii_whitespace() || c == 0x0b);
            return Ok(self.emit(TokenKind::Whitespace, end));
        }

        if b == b'#' || (b == b'-' && self.peek(1) == Some(b'-') && starts_dash_comment(self.peek(2))) {
            let end = scan_while(bytes, start, |c| c != b'\n');
            return Ok(self.emit(TokenKind::Comment, end));
        }

        if b == b'/' && self.peek(1) == Some(b'*') {
            if self.peek(2) == Some(b'!') || (self.peek(2) == Some(b'M') && self.peek(3) == Some(b'!')) {
                return Err(GuardError::MalformedInput(format!(
                    "executable comment at offset {start} is not permitted"
                )));
            }
            return match self.src[start + 2..].find("*/") {
                Some(rel) => Ok(self.emit(TokenKind::Comment, start + 2 + rel + 2)),
                None => Err(GuardError::MalformedInput(format!(
                    "unterminated block comment starting at offset {start}"
                ))),
            };
        }

        if b == b'\'' || b == b'"' {
            let end = scan_quoted(bytes, start, b, true).ok_or_else(|| {
                GuardError::MalformedInput(format!(
                    "unterminated string literal starting at offset {start}"
                ))
            })?;
            return Ok(self.emit(TokenKind::StringLiteral, end));
        }

        if b == b'`' {
            let end = scan_quoted(bytes, start, b, false).ok_or_else(|| {
                GuardError::MalformedInput(format!(
                    "unterminated quoted identifier starting at offset {start}"
                ))
            })?;
            return Ok(self.emit(TokenKind::Identifier { quoted: true }, end));
        }

        if b.is_ascii_digit() || (b == b'.' && self.peek(1).is_some_and(|c| c.is_ascii_digit())) {
            let number_end = scan_number(bytes, start);
            // MySQL identifiers may begin with digits, e.g. `1st_quarter`.
            if number_end < bytes.len() && is_word_byte(bytes[number_end]) {
                let end = scan_while(bytes, number_end, is_word_byte);
                return Ok(self.emit(TokenKind::Identifier { quoted: false }, end));
            }
            return Ok(self.emit(TokenKind::Number, number_end));
        }

        if is_word_byte(b) {
            let end = scan_while(bytes, start, is_word_byte);
            let word = &self.src[start..end];
            let kind = if is_keyword(word) {
                TokenKind::Keyword
            } else {
                TokenKind::Identifier { quoted: false }
            };
            return Ok(self.emit(kind, end));
        }

        // Everything else is a single ASCII punctuation byte; word bytes above
        // already took every non-ASCII byte, so this slice is on a char boundary.
        Ok(self.emit(TokenKind::Punctuation, start + 1))
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token<'a>, GuardError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.src.len() {
            return None;
        }
        let result = self.scan();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

/// Tokenizes the whole input, failing on the first lexical error.
pub fn tokenize(src: &str) -> Result<Vec<Token<'_>>, GuardError> {
    Lexer::new(src).collect()
}

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

fn is_word_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || c >= 0x80
}

fn starts_dash_comment(next: Option<u8>) -> bool {
    match next {
        None => true,
        Some(c) => c <= b' ' || c == 0x7f,
    }
}

fn scan_while(bytes: &[u8], from: usize, pred: impl Fn(u8) -> bool) -> usize {
    let mut i = from;
    while i < bytes.len() && pred(bytes[i]) {
        i += 1;
    }
    i
}

/// Returns the end offset (exclusive) of a quoted run that opens at `start`,
/// or `None` when the closing quote is missing.
fn scan_quoted(bytes: &[u8], start: usize, quote: u8, backslash_escapes: bool) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        let c = bytes[i];
        if backslash_escapes && c == b'\\' {
            i += 2;
            continue;
        }
        if c == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

fn scan_number(bytes: &[u8], start: usize) -> usize {
    let mut i = scan_while(bytes, start, |c| c.is_ascii_digit());
    if bytes.get(i) == Some(&b'.') {
        i = scan_while(bytes, i + 1, |c| c.is_ascii_digit());
    }
    if matches!(bytes.get(i), Some(b'e') | Some(b'E')) {
        let mut j = i + 1;
        if matches!(bytes.get(j), Some(b'+') | Some(b'-')) {
            j += 1;
        }
        if bytes.get(j).is_some_and(|c| c.is_ascii_digit()) {
            i = scan_while(bytes, j, |c| c.is_ascii_digit());
        }
    }
    i
}
