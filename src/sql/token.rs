//! SQL tokens
//!
//! Token kinds produced by the lexer.

use std::fmt;

/// A lexical token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    Create,
    Drop,
    Table,
    Tables,
    Index,
    Show,
    Desc,
    From,
    Insert,
    Into,
    Values,
    Delete,
    Update,
    Set,
    Select,
    Where,
    Join,
    On,
    And,
    Order,
    By,
    Asc,
    Limit,
    As,
    Begin,
    Commit,
    Abort,
    Rollback,
    Help,
    Exit,
    // Aggregates
    Count,
    Sum,
    Min,
    Max,
    // Types
    Int,
    BigInt,
    Float,
    Char,
    Datetime,
    // Literals and identifiers
    Identifier(String),
    IntegerLiteral(i64),
    FloatLiteral(f64),
    StringLiteral(String),
    // Symbols
    LParen,
    RParen,
    Comma,
    Semicolon,
    Dot,
    Asterisk,
    Plus,
    Minus,
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    // End of input
    Eof,
}

impl Token {
    /// Map an identifier to its keyword token, if it is one.
    pub fn keyword(word: &str) -> Option<Token> {
        let token = match word.to_ascii_uppercase().as_str() {
            "CREATE" => Token::Create,
            "DROP" => Token::Drop,
            "TABLE" => Token::Table,
            "TABLES" => Token::Tables,
            "INDEX" => Token::Index,
            "SHOW" => Token::Show,
            "DESC" => Token::Desc,
            "FROM" => Token::From,
            "INSERT" => Token::Insert,
            "INTO" => Token::Into,
            "VALUES" => Token::Values,
            "DELETE" => Token::Delete,
            "UPDATE" => Token::Update,
            "SET" => Token::Set,
            "SELECT" => Token::Select,
            "WHERE" => Token::Where,
            "JOIN" => Token::Join,
            "ON" => Token::On,
            "AND" => Token::And,
            "ORDER" => Token::Order,
            "BY" => Token::By,
            "ASC" => Token::Asc,
            "LIMIT" => Token::Limit,
            "AS" => Token::As,
            "BEGIN" => Token::Begin,
            "COMMIT" => Token::Commit,
            "ABORT" => Token::Abort,
            "ROLLBACK" => Token::Rollback,
            "HELP" => Token::Help,
            "EXIT" => Token::Exit,
            "COUNT" => Token::Count,
            "SUM" => Token::Sum,
            "MIN" => Token::Min,
            "MAX" => Token::Max,
            "INT" => Token::Int,
            "BIGINT" => Token::BigInt,
            "FLOAT" => Token::Float,
            "CHAR" => Token::Char,
            "DATETIME" => Token::Datetime,
            _ => return None,
        };
        Some(token)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Identifier(s) => write!(f, "{}", s),
            Token::IntegerLiteral(n) => write!(f, "{}", n),
            Token::FloatLiteral(n) => write!(f, "{}", n),
            Token::StringLiteral(s) => write!(f, "'{}'", s),
            other => write!(f, "{:?}", other),
        }
    }
}
