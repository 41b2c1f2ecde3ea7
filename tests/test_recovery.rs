//! Crash recovery scenarios: a dropped (never closed) Db stands in for a
//! crash, since the log is write-through but heap pages may never have
//! left the buffer pool.

use oakdb::catalog::types::Value;
use oakdb::db::Db;
use tempfile::TempDir;

#[test]
fn test_redo_committed_undo_uncommitted() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path()).unwrap();
        let mut s1 = db.session();
        s1.execute("CREATE TABLE t (id INT);").unwrap();
        s1.execute("begin;").unwrap();
        s1.execute("INSERT INTO t VALUES (1);").unwrap();
        s1.execute("INSERT INTO t VALUES (2);").unwrap();
        s1.execute("INSERT INTO t VALUES (3);").unwrap();
        s1.execute("commit;").unwrap();

        let mut s2 = db.session();
        s2.execute("begin;").unwrap();
        s2.execute("INSERT INTO t VALUES (4);").unwrap();
        // Crash: neither commit nor clean close.
    }

    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();
    let result = session.execute("SELECT * FROM t ORDER BY id;").unwrap();
    assert_eq!(
        result.rows,
        vec![
            vec![Value::Int(1)],
            vec![Value::Int(2)],
            vec![Value::Int(3)],
        ]
    );
}

#[test]
fn test_recovery_restores_indexes() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path()).unwrap();
        let mut session = db.session();
        session.execute("CREATE TABLE t (id INT, v CHAR(4));").unwrap();
        session.execute("CREATE INDEX t(id);").unwrap();
        session
            .execute("INSERT INTO t VALUES (1,'a'), (2,'b'), (3,'c');")
            .unwrap();
        session.execute("begin;").unwrap();
        session.execute("INSERT INTO t VALUES (4,'d');").unwrap();
        // Crash with one loser transaction in flight.
    }

    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();
    // The index serves the committed keys and excludes the undone one.
    let result = session.execute("SELECT v FROM t WHERE id = 2;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Str("b".to_string())]]);
    let result = session.execute("SELECT * FROM t WHERE id >= 4;").unwrap();
    assert!(result.rows.is_empty());
}

#[test]
fn test_recovery_after_aborted_work() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path()).unwrap();
        let mut session = db.session();
        session.execute("CREATE TABLE t (id INT);").unwrap();
        session.execute("INSERT INTO t VALUES (1);").unwrap();
        session.execute("begin;").unwrap();
        session.execute("DELETE FROM t WHERE id = 1;").unwrap();
        session.execute("abort;").unwrap();
    }

    // The log replays the delete and its compensation.
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();
    let result = session.execute("SELECT * FROM t;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Int(1)]]);
}

#[test]
fn test_work_continues_after_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path()).unwrap();
        let mut session = db.session();
        session.execute("CREATE TABLE t (id INT);").unwrap();
        session.execute("INSERT INTO t VALUES (1);").unwrap();
    }
    {
        // First restart: recover, then write more.
        let db = Db::open(dir.path()).unwrap();
        let mut session = db.session();
        session.execute("INSERT INTO t VALUES (2);").unwrap();
    }
    // Second restart replays both generations of log records.
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();
    let result = session.execute("SELECT * FROM t ORDER BY id;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
}

#[test]
fn test_clean_shutdown_then_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path()).unwrap();
        let mut session = db.session();
        session.execute("CREATE TABLE t (id INT, v CHAR(8));").unwrap();
        session.execute("CREATE INDEX t(id);").unwrap();
        for i in 1..=50 {
            session
                .execute(&format!("INSERT INTO t VALUES ({}, 'r{}');", i, i))
                .unwrap();
        }
        db.close().unwrap();
    }

    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();
    let result = session.execute("SELECT COUNT(*) AS n FROM t;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Int(50)]]);
    let result = session.execute("SELECT v FROM t WHERE id = 37;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Str("r37".to_string())]]);
}
