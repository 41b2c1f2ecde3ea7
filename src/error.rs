//! Error types for OakDB
//!
//! This module defines all error types used throughout the database engine.

use thiserror::Error;

/// Transaction ID type
pub type TxnId = i32;

/// Reason a transaction was forced to abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    UpgradeConflict,
    DeadlockPrevention,
    FailedToLock,
    AttemptedUnlockButNoLockHeld,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::LockOnShrinking => {
                write!(f, "cannot request locks on SHRINKING phase")
            }
            AbortReason::UpgradeConflict => {
                write!(f, "another transaction is already waiting to upgrade")
            }
            AbortReason::DeadlockPrevention => write!(f, "aborted for deadlock prevention"),
            AbortReason::FailedToLock => write!(f, "failed to lock"),
            AbortReason::AttemptedUnlockButNoLockHeld => {
                write!(f, "attempted to unlock but no lock held")
            }
        }
    }
}

/// The main error type for OakDB
#[derive(Error, Debug)]
pub enum Error {
    // ========== Lexer Errors ==========
    #[error("Lexer error: unexpected character '{0}' at position {1}")]
    UnexpectedCharacter(char, usize),

    #[error("Lexer error: unterminated string literal starting at position {0}")]
    UnterminatedString(usize),

    #[error("Lexer error: invalid number format at position {0}")]
    InvalidNumber(usize),

    // ========== Parser Errors ==========
    #[error("Parse error: unexpected token '{found}', expected {expected}")]
    UnexpectedToken { expected: String, found: String },

    #[error("Parse error: unexpected end of input, expected {0}")]
    UnexpectedEof(String),

    // ========== Catalog Errors ==========
    #[error("Catalog error: table '{0}' not found")]
    TableNotFound(String),

    #[error("Catalog error: table '{0}' already exists")]
    TableExists(String),

    #[error("Catalog error: column '{0}' not found")]
    ColumnNotFound(String),

    #[error("Catalog error: column '{0}' is ambiguous")]
    AmbiguousColumn(String),

    #[error("Catalog error: index '{0}' not found")]
    IndexNotFound(String),

    #[error("Catalog error: index '{0}' already exists")]
    IndexExists(String),

    // ========== Type Errors ==========
    #[error("Type error: expected {0} values, got {1}")]
    InvalidValueCount(usize, usize),

    #[error("Type error: incompatible types {lhs} and {rhs}")]
    IncompatibleType { lhs: String, rhs: String },

    #[error("Type error: string value too long for CHAR({0})")]
    StringOverflow(usize),

    #[error("Type error: invalid datetime '{0}'")]
    InvalidDatetime(String),

    // ========== Storage Errors ==========
    #[error("Storage error: page {1} does not exist in file {0}")]
    PageNotExist(i32, i32),

    #[error("Storage error: no record at page {0} slot {1}")]
    RecordNotFound(i32, i32),

    #[error("Storage error: index entry not found")]
    IndexEntryNotFound,

    // ========== Transaction Errors ==========
    #[error("Transaction {0} aborted: {1}")]
    TransactionAbort(TxnId, AbortReason),

    // ========== I/O Errors ==========
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ========== Internal Errors ==========
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for OakDB operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that abort the whole transaction rather than just the
    /// current statement.
    pub fn aborts_transaction(&self) -> bool {
        matches!(self, Error::TransactionAbort(_, _))
    }
}
