/// Token types for the SQL lexer
use phf::phf_set;
use std::fmt;

/// Reserved words, matched case-insensitively. Quoted identifiers bypass this
/// set entirely.
static KEYWORDS: phf::Set<&'static str> = phf_set! {
    // clause words
    "SELECT", "FROM", "WHERE", "GROUP", "BY", "HAVING", "ORDER", "LIMIT",
    "OFFSET", "DISTINCT", "AS", "TOP", "INTO",
    // DML / DDL verbs
    "INSERT", "UPDATE", "DELETE", "SET", "VALUES", "CREATE", "ALTER", "DROP",
    "ADD", "TABLE", "COLUMN", "RENAME", "TO",
    // joins
    "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "ON",
    // expression keywords
    "AND", "OR", "NOT", "IN", "BETWEEN", "LIKE", "IS", "CASE", "WHEN", "THEN",
    "ELSE", "END", "ASC", "DESC", "TRUE", "FALSE", "CAST", "CONVERT",
    // triggers and functions
    "BEGIN", "RETURN", "RETURNS", "BEFORE", "AFTER", "FOR", "EACH", "ROW",
    "TRIGGER", "FUNCTION", "IF", "ELSEIF",
    // constraints
    "PRIMARY", "KEY", "UNIQUE", "DEFAULT", "REFERENCES", "CONSTRAINT",
    "IDENTITY", "AUTO_INCREMENT", "CHECK", "NULL", "EXISTS", "INDEX",
    "FOREIGN",
    // type names
    "INT", "INTEGER", "BIGINT", "SMALLINT", "TINYINT", "LONG",
    "FLOAT", "REAL", "DOUBLE", "DECIMAL", "NUMERIC", "MONEY",
    "VARCHAR", "NVARCHAR", "CHAR", "NCHAR", "TEXT", "STRING",
    "BIT", "BOOL", "BOOLEAN",
    "DATETIME", "DATETIME2", "DATE", "TIME", "TIMESTAMP", "SMALLDATETIME",
    "UNIQUEIDENTIFIER", "GUID", "UUID",
};

/// Look up a word in the reserved set; returns the canonical uppercase form.
pub fn lookup_keyword(word: &str) -> Option<&'static str> {
    KEYWORDS.get_key(word.to_uppercase().as_str()).copied()
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Reserved word, stored uppercased
    Keyword(&'static str),
    /// Identifier, stored verbatim (quoted identifiers keep their case)
    Identifier(String),
    Integer(i64),
    Float(f64),
    StringLit(String),

    // operators
    Eq,      // =
    Ne,      // <> or !=
    Lt,      // <
    Gt,      // >
    Le,      // <=
    Ge,      // >=
    Assign,  // :=
    Plus,    // +
    Minus,   // -
    Star,    // *
    Slash,   // /
    Percent, // %
    Caret,   // ^

    // punctuation
    LParen,    // (
    RParen,    // )
    Comma,     // ,
    Semicolon, // ;
    Dot,       // .

    Eof,
}

impl TokenKind {
    pub fn is_kw(&self, word: &str) -> bool {
        matches!(self, TokenKind::Keyword(k) if k.eq_ignore_ascii_case(word))
    }

    /// Word form of the token, for identifiers and keywords alike. Function
    /// names can be either (LEFT, RIGHT and the type names are reserved).
    pub fn word(&self) -> Option<&str> {
        match self {
            TokenKind::Keyword(k) => Some(k),
            TokenKind::Identifier(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for TokenKind {
    /// Render back to SQL text. Used to build canonical aggregate keys and to
    /// reassemble trigger-body DML, so string literals re-quote and re-escape.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Keyword(k) => write!(f, "{}", k),
            TokenKind::Identifier(s) => write!(f, "{}", s),
            TokenKind::Integer(i) => write!(f, "{}", i),
            TokenKind::Float(x) => write!(f, "{}", x),
            TokenKind::StringLit(s) => write!(f, "'{}'", s.replace('\'', "''")),
            TokenKind::Eq => write!(f, "="),
            TokenKind::Ne => write!(f, "<>"),
            TokenKind::Lt => write!(f, "<"),
            TokenKind::Gt => write!(f, ">"),
            TokenKind::Le => write!(f, "<="),
            TokenKind::Ge => write!(f, ">="),
            TokenKind::Assign => write!(f, ":="),
            TokenKind::Plus => write!(f, "+"),
            TokenKind::Minus => write!(f, "-"),
            TokenKind::Star => write!(f, "*"),
            TokenKind::Slash => write!(f, "/"),
            TokenKind::Percent => write!(f, "%"),
            TokenKind::Caret => write!(f, "^"),
            TokenKind::LParen => write!(f, "("),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::Comma => write!(f, ","),
            TokenKind::Semicolon => write!(f, ";"),
            TokenKind::Dot => write!(f, "."),
            TokenKind::Eof => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn new(kind: TokenKind, line: usize, column: usize) -> Self {
        Self { kind, line, column }
    }
}

/// Join a token slice into canonical SQL text with no separators. Aggregate
/// keys depend on this being identical between the SELECT-list pre-compute and
/// the evaluator's probe.
pub fn tokens_text(tokens: &[Token]) -> String {
    let mut out = String::new();
    for t in tokens {
        out.push_str(&t.kind.to_string());
    }
    out
}
