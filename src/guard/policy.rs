//! Accept/reject decisions over a token stream.
//!
//! The engine is deny-unless-allowed: a statement must open with one of the
//! read-only forms in [`ALLOWED_LEADING`]. [`DENIED_KEYWORDS`] and
//! [`DENIED_ROUTINES`] are checked across the whole statement on top of that,
//! so a mutating clause or routine cannot hide inside an allowed shape.

use crate::error::GuardError;
use crate::guard::lexer::{Token, TokenKind};

pub const ALLOWED_LEADING: &[&str] = &["SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];

pub const DENIED_KEYWORDS: &[&str] = &[
    // data modification
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "REPLACE", "LOAD", "HANDLER",
    // data definition
    "CREATE", "ALTER", "DROP", "TRUNCATE", "RENAME",
    // privileges
    "GRANT", "REVOKE", "DENY",
    // procedure invocation and dynamic SQL
    "EXEC", "EXECUTE", "CALL", "PROCEDURE", "PREPARE", "DEALLOCATE",
    // locking and administration
    "LOCK", "UNLOCK", "KILL", "SHUTDOWN", "FLUSH", "RESET", "PURGE", "INSTALL", "UNINSTALL",
    "OPTIMIZE", "REPAIR", "ANALYZE", "BACKUP", "RESTORE", "BULK",
    // server-side file output
    "OUTFILE", "DUMPFILE",
];

/// Routines that read server files, run dynamic SQL, reach other servers,
/// advance sequences or hold named locks past the call.
pub const DENIED_ROUTINES: &[&str] = &[
    "LOAD_FILE",
    "SP_EXECUTESQL",
    "OPENROWSET",
    "OPENQUERY",
    "OPENDATASOURCE",
    "NEXTVAL",
    "SETVAL",
    "LASTVAL",
    "GET_LOCK",
    "RELEASE_LOCK",
    "RELEASE_ALL_LOCKS",
];

const DENIED_ROUTINE_PREFIXES: &[&str] = &["XP_"];

/// Denied words that are also ordinary scalar functions. They are only
/// accepted in call position, directly followed by `(`.
const SCALAR_FUNCTION_NAMES: &[&str] = &["REPLACE", "INSERT", "TRUNCATE"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(GuardError),
}

impl Verdict {
    pub fn into_result(self) -> Result<(), GuardError> {
        match self {
            Verdict::Accept => Ok(()),
            Verdict::Reject(err) => Err(err),
        }
    }
}

impl From<Result<(), GuardError>> for Verdict {
    fn from(result: Result<(), GuardError>) -> Self {
        match result {
            Ok(()) => Verdict::Accept,
            Err(err) => Verdict::Reject(err),
        }
    }
}

/// Consumes a token stream once and decides whether it is a single read-only
/// statement.
pub fn evaluate<'a, I>(tokens: I) -> Verdict
where
    I: IntoIterator<Item = Token<'a>>,
{
    let mut significant: Vec<Token<'a>> = tokens.into_iter().filter(Token::is_significant).collect();
    while significant.last().is_some_and(|t| t.is_punct(';')) {
        significant.pop();
    }
    check(&significant).into()
}

fn check(tokens: &[Token<'_>]) -> Result<(), GuardError> {
    if tokens.is_empty() {
        return Err(GuardError::EmptyStatement);
    }
    if tokens.iter().any(|t| t.is_punct(';')) {
        return Err(GuardError::MultipleStatements);
    }

    let leading_at = tokens
        .iter()
        .position(|t| !t.is_punct('('))
        .ok_or_else(|| not_allowed("statement has no leading keyword"))?;
    let leading = &tokens[leading_at];
    if !leading.is_bare_word() {
        return Err(not_allowed(
            "a statement must begin with SELECT, WITH, SHOW, DESCRIBE or EXPLAIN",
        ));
    }
    if !ALLOWED_LEADING.iter().any(|w| leading.word_eq(w)) {
        return Err(not_allowed(&format!(
            "{} statements are not allowed; only read-only queries are permitted",
            leading.text.to_ascii_uppercase()
        )));
    }
    if leading.word_eq("WITH") {
        check_cte_body(&tokens[leading_at + 1..])?;
    }

    scan_denied_words(tokens)?;
    check_session_state(tokens)
}

/// The statement after a `WITH` list must itself be a `SELECT`.
fn check_cte_body(tokens: &[Token<'_>]) -> Result<(), GuardError> {
    let mut depth: usize = 0;
    let mut closed_cte = false;
    for token in tokens {
        if token.is_punct('(') {
            depth += 1;
            continue;
        }
        if token.is_punct(')') {
            depth = depth.saturating_sub(1);
            closed_cte = depth == 0;
            continue;
        }
        if depth > 0 {
            continue;
        }
        if closed_cte {
            // `name(col, …) AS (…)`: the parenthesis closed a column list.
            if token.is_punct(',') || token.word_eq("AS") {
                closed_cte = false;
                continue;
            }
            if token.word_eq("SELECT") {
                return Ok(());
            }
            return Err(not_allowed(&format!(
                "a WITH clause must be followed by SELECT, found '{}'",
                token.text
            )));
        }
    }
    Err(not_allowed("a WITH clause must be followed by SELECT"))
}

fn scan_denied_words(tokens: &[Token<'_>]) -> Result<(), GuardError> {
    for (i, token) in tokens.iter().enumerate() {
        if !token.is_bare_word() {
            continue;
        }
        let upper = token.text.to_ascii_uppercase();
        let word = upper.as_str();

        if DENIED_ROUTINES.contains(&word) || DENIED_ROUTINE_PREFIXES.iter().any(|p| word.starts_with(p)) {
            return Err(not_allowed(&format!(
                "routine {word} is not permitted in a read-only query"
            )));
        }

        // MariaDB `NEXT VALUE FOR seq` advances a sequence.
        if word == "NEXT" && tokens.get(i + 1).is_some_and(|next| next.word_eq("VALUE")) {
            return Err(not_allowed("NEXT VALUE FOR advances a sequence"));
        }

        if DENIED_KEYWORDS.contains(&word) {
            let call_position = tokens.get(i + 1).is_some_and(|next| next.is_punct('('));
            if call_position && SCALAR_FUNCTION_NAMES.contains(&word) {
                continue;
            }
            return Err(not_allowed(&format!(
                "{word} at offset {} is not permitted in a read-only query",
                token.offset
            )));
        }
    }
    Ok(())
}

/// Pooled sessions outlive a call, so nothing may be written into them: no
/// `SELECT … INTO` of any target and no `:=` assignment.
fn check_session_state(tokens: &[Token<'_>]) -> Result<(), GuardError> {
    for (i, token) in tokens.iter().enumerate() {
        if token.kind == TokenKind::Keyword && token.word_eq("INTO") {
            return Err(not_allowed(
                "SELECT ... INTO is not allowed; only read-only operations are permitted",
            ));
        }
        let assigns = token.is_punct(':')
            && tokens
                .get(i + 1)
                .is_some_and(|next| next.is_punct('=') && next.offset == token.offset + 1);
        if assigns {
            return Err(not_allowed(&format!(
                "variable assignment at offset {} is not allowed",
                token.offset
            )));
        }
    }
    Ok(())
}

fn not_allowed(reason: &str) -> GuardError {
    GuardError::StatementNotAllowed(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::lexer::tokenize;

    fn verdict(sql: &str) -> Verdict {
        match tokenize(sql) {
            Ok(tokens) => evaluate(tokens),
            Err(err) => Verdict::Reject(err),
        }
    }

    fn assert_accept(sql: &str) {
        assert_eq!(verdict(sql), Verdict::Accept, "should accept: {sql}");
    }

    fn assert_not_allowed(sql: &str) {
        assert!(
            matches!(verdict(sql), Verdict::Reject(GuardError::StatementNotAllowed(_))),
            "should reject as not allowed: {sql} (got {:?})",
            verdict(sql)
        );
    }

    #[test]
    fn test_valid_selects() {
        for sql in [
            "SELECT * FROM users",
            "SELECT * FROM dbo.Users",
            "select id, name from customers where active = 1",
            "SELECT COUNT(*) FROM orders",
            "SELECT u.name, o.total FROM users u JOIN orders o ON u.id = o.user_id",
            "WITH cte AS (SELECT * FROM users) SELECT * FROM cte",
            "SELECT TOP 10 * FROM products ORDER BY price DESC",
            "SELECT * FROM users WHERE name LIKE '%test%'",
            "SELECT * FROM users;",
            "SELECT 1;;  ",
            "(SELECT 1) UNION (SELECT 2)",
            "SELECT REPLACE(name, 'a', 'b'), INSERT(code, 1, 2, 'x'), TRUNCATE(price, 2) FROM items",
            "SELECT last_update, deleted_at, created_by FROM audit",
            "SELECT `update`, `drop` FROM t",
            "SELECT 'DELETE FROM users' AS example",
            "SHOW TABLES",
            "SHOW GRANTS",
            "DESCRIBE users",
            "EXPLAIN SELECT * FROM users",
        ] {
            assert_accept(sql);
        }
    }

    #[test]
    fn test_scenario_comment_hides_stacked_statement() {
        assert_accept("SELECT * FROM x WHERE 1=1 -- ; DROP TABLE x");
        assert_accept("SELECT * FROM x /* ; DROP TABLE x */");
        assert_accept("SELECT * FROM x # ; DROP TABLE x");
    }

    #[test]
    fn test_scenario_multiple_statements() {
        assert_eq!(
            verdict("SELECT 1; DROP TABLE dbo.Users"),
            Verdict::Reject(GuardError::MultipleStatements)
        );
        assert_eq!(
            verdict("SELECT 1 ; SELECT 2"),
            Verdict::Reject(GuardError::MultipleStatements)
        );
        assert_eq!(
            verdict("; SELECT 1"),
            Verdict::Reject(GuardError::MultipleStatements)
        );
        assert_eq!(
            verdict("SELECT 1 --1; DROP TABLE t"),
            Verdict::Reject(GuardError::MultipleStatements)
        );
        assert_eq!(
            verdict(r"SELECT 'a\\'; DROP TABLE t"),
            Verdict::Reject(GuardError::MultipleStatements)
        );
    }

    #[test]
    fn test_scenario_insert_rejected() {
        assert_not_allowed("INSERT INTO dbo.Users(Username) VALUES('x')");
    }

    #[test]
    fn test_denied_leading_keywords_with_obfuscation() {
        for keyword in DENIED_KEYWORDS {
            let lower = keyword.to_ascii_lowercase();
            for sql in [
                format!("{keyword} x"),
                format!("{lower} x"),
                format!("  \n\t{keyword} x"),
                format!("/* hello */ {keyword} x"),
                format!("-- note\n{lower} x"),
                format!("# note\n({keyword} x)"),
            ] {
                assert_not_allowed(&sql);
            }
        }
    }

    #[test]
    fn test_unknown_leading_keyword_rejected() {
        for sql in [
            "SET GLOBAL read_only = 0",
            "USE mysql",
            "BEGIN",
            "DO SLEEP(1)",
            "VALUES ROW(1)",
            "TABLE users",
            "FROBNICATE users",
            "'SELECT'",
            "42",
            "()",
        ] {
            assert_not_allowed(sql);
        }
    }

    #[test]
    fn test_mutating_cte_body_rejected() {
        assert_not_allowed("WITH d AS (SELECT 1) DELETE FROM t");
        assert_not_allowed("WITH d AS (SELECT 1), e AS (SELECT 2) UPDATE t SET a = 1");
        assert_not_allowed("WITH d AS (DELETE FROM t RETURNING *) SELECT * FROM d");
        assert_not_allowed("WITH d AS (SELECT 1)");
        assert_accept(
            "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 5), \
             m AS (SELECT * FROM n) SELECT * FROM m",
        );
    }

    #[test]
    fn test_nested_mutations_rejected() {
        assert_not_allowed("SELECT * FROM users FOR UPDATE");
        assert_not_allowed("SELECT * FROM users LOCK IN SHARE MODE");
        assert_not_allowed("SELECT LOAD_FILE('/etc/passwd')");
        assert_not_allowed("SELECT * FROM xp_cmdshell('dir')");
        assert_not_allowed("SELECT * FROM OPENROWSET('test')");
        assert_not_allowed("EXEC sp_executesql N'SELECT 1'");
        assert_not_allowed("EXPLAIN DELETE FROM users");
        assert_not_allowed("EXPLAIN ANALYZE SELECT 1");
        assert_not_allowed("SELECT * FROM t PROCEDURE ANALYSE()");
        assert_not_allowed("SELECT REPLACE INTO t VALUES (1)");
    }

    #[test]
    fn test_select_into_rejected() {
        assert_not_allowed("SELECT * INTO new_table FROM users");
        assert_not_allowed("SELECT id INTO @last_id FROM users LIMIT 1");
        assert_not_allowed("SELECT 1 INTO @persist");
        assert_not_allowed("SELECT id, name INTO backup FROM users");
        assert_not_allowed("SELECT * FROM users INTO OUTFILE '/tmp/users.csv'");
        assert_not_allowed("SELECT * FROM users INTO DUMPFILE '/tmp/users.bin'");
    }

    #[test]
    fn test_session_variables_cannot_be_assigned() {
        assert_not_allowed("SELECT @n := 1");
        assert_not_allowed("SELECT @n:=@n+1 AS row_num FROM users");
        assert_accept("SELECT @n, @@version");
        assert_accept("SELECT * FROM t WHERE note = 'a := b'");
    }

    #[test]
    fn test_sequence_and_lock_routines_rejected() {
        for sql in [
            "SELECT SETVAL(seq1, 1000)",
            "SELECT NEXTVAL(seq1)",
            "SELECT nextval(seq1) FROM dual",
            "SELECT LASTVAL(seq1)",
            "SELECT NEXT VALUE FOR seq1",
            "SELECT GET_LOCK('app', 10)",
            "SELECT RELEASE_LOCK('app')",
            "SELECT RELEASE_ALL_LOCKS()",
        ] {
            assert_not_allowed(sql);
        }
        assert_accept("SELECT next_run, `value` FROM jobs");
    }

    #[test]
    fn test_empty_statements() {
        for sql in ["", "   \n\t  ", "-- only a comment", "/* nothing */", ";", " ; ; "] {
            assert_eq!(verdict(sql), Verdict::Reject(GuardError::EmptyStatement), "{sql:?}");
        }
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(
            verdict("SELECT 'unterminated"),
            Verdict::Reject(GuardError::MalformedInput(_))
        ));
        assert!(matches!(
            verdict("SELECT /*!50000 1 */"),
            Verdict::Reject(GuardError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_stripping_comments_does_not_change_verdict() {
        for sql in [
            "SELECT * FROM x WHERE 1=1 -- ; DROP TABLE x",
            "/* lead */ SELECT /* mid */ 1 # tail",
            "-- c\nDELETE FROM t",
            "SELECT 1; /* c */ DROP TABLE t",
            "WITH a AS (SELECT 1) /* c */ SELECT * FROM a",
        ] {
            let tokens = tokenize(sql).unwrap();
            let stripped: String = tokens
                .iter()
                .map(|t| if t.kind == TokenKind::Comment { " " } else { t.text })
                .collect();
            assert_eq!(verdict(sql), verdict(&stripped), "{sql}");
        }
    }

    #[test]
    fn test_verdict_is_idempotent() {
        for sql in [
            "SELECT * FROM dbo.Users",
            "SELECT 1; DROP TABLE dbo.Users",
            "INSERT INTO t VALUES (1)",
            "SELECT 'x",
        ] {
            assert_eq!(verdict(sql), verdict(sql));
        }
    }

    #[test]
    fn test_multiple_statements_take_precedence() {
        assert_eq!(
            verdict("DROP TABLE a; DROP TABLE b"),
            Verdict::Reject(GuardError::MultipleStatements)
        );
    }
}
