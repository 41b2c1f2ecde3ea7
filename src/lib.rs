//! OakDB - a single-node relational storage engine written in Rust
//!
//! This library provides the core components of a SQL database:
//! - SQL parsing (lexer, parser, AST)
//! - Storage engine (pages, buffer pool, heap files, B+ tree, WAL)
//! - Crash recovery (redo/undo over the write-ahead log)
//! - Strict two-phase locking with deadlock detection
//! - Query execution (volcano executors)
//! - System catalog
//! - TCP server

pub mod catalog;
pub mod db;
pub mod error;
pub mod executor;
pub mod recovery;
pub mod server;
pub mod sql;
pub mod storage;
pub mod transaction;

pub use db::{Db, Session};
pub use error::{Error, Result};
