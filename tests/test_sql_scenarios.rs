//! End-to-end SQL scenarios driven through a session.

use oakdb::catalog::types::Value;
use oakdb::db::Db;
use tempfile::TempDir;

fn int(v: i32) -> Value {
    Value::Int(v)
}

fn s(v: &str) -> Value {
    Value::Str(v.to_string())
}

#[test]
fn test_insert_scan() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session.execute("CREATE TABLE t (id INT, v CHAR(4));").unwrap();
    session
        .execute("INSERT INTO t VALUES (1,'aa'), (2,'bb'), (3,'cc');")
        .unwrap();

    let result = session.execute("SELECT * FROM t;").unwrap();
    assert_eq!(result.columns, vec!["id", "v"]);
    assert_eq!(
        result.rows,
        vec![
            vec![int(1), s("aa")],
            vec![int(2), s("bb")],
            vec![int(3), s("cc")],
        ]
    );
}

#[test]
fn test_index_point_lookup() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session.execute("CREATE TABLE t (id INT, v CHAR(4));").unwrap();
    session
        .execute("INSERT INTO t VALUES (1,'aa'), (2,'bb'), (3,'cc');")
        .unwrap();
    session.execute("CREATE INDEX t(id);").unwrap();

    let result = session.execute("SELECT v FROM t WHERE id = 2;").unwrap();
    assert_eq!(result.columns, vec!["v"]);
    assert_eq!(result.rows, vec![vec![s("bb")]]);

    let result = session.execute("SHOW INDEX FROM t;").unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0][1], s("t_id"));
}

#[test]
fn test_split_and_range_scan_order_four() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session.execute("CREATE TABLE t (id INT);").unwrap();
    // Small order so twenty keys force several splits.
    db.sm().create_index("t", &["id".to_string()], Some(4)).unwrap();

    for i in 1..=20 {
        session
            .execute(&format!("INSERT INTO t VALUES ({});", i))
            .unwrap();
    }

    let result = session.execute("SELECT * FROM t WHERE id >= 10;").unwrap();
    let ids: Vec<Value> = result.rows.iter().map(|r| r[0].clone()).collect();
    assert_eq!(ids, (10..=20).map(int).collect::<Vec<Value>>());
}

#[test]
fn test_index_scan_returns_key_order() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session.execute("CREATE TABLE t (id INT);").unwrap();
    session.execute("CREATE INDEX t(id);").unwrap();
    for i in [9, 3, 12, 1, 7, 15, 5, 11] {
        session
            .execute(&format!("INSERT INTO t VALUES ({});", i))
            .unwrap();
    }

    // An index range scan yields key order, not insertion order.
    let result = session.execute("SELECT * FROM t WHERE id > 4;").unwrap();
    let ids: Vec<Value> = result.rows.iter().map(|r| r[0].clone()).collect();
    assert_eq!(ids, vec![int(5), int(7), int(9), int(11), int(12), int(15)]);
}

#[test]
fn test_update_uniqueness_violation() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session.execute("CREATE TABLE t (id INT, v CHAR(4));").unwrap();
    session.execute("CREATE INDEX t(id);").unwrap();
    session
        .execute("INSERT INTO t VALUES (1,'a'), (2,'b');")
        .unwrap();

    let err = session
        .execute("UPDATE t SET id = 2 WHERE id = 1;")
        .unwrap_err();
    assert!(err.to_string().contains("uniqueness"));

    let result = session.execute("SELECT * FROM t;").unwrap();
    assert_eq!(
        result.rows,
        vec![vec![int(1), s("a")], vec![int(2), s("b")]]
    );
}

#[test]
fn test_update_arithmetic_and_index_maintenance() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session.execute("CREATE TABLE t (id INT, n INT);").unwrap();
    session.execute("CREATE INDEX t(id);").unwrap();
    session
        .execute("INSERT INTO t VALUES (1, 10), (2, 20);")
        .unwrap();

    session.execute("UPDATE t SET n = n + 5 WHERE id = 2;").unwrap();
    session.execute("UPDATE t SET id = id + 10 WHERE id = 1;").unwrap();

    let result = session.execute("SELECT n FROM t WHERE id = 11;").unwrap();
    assert_eq!(result.rows, vec![vec![int(10)]]);
    let result = session.execute("SELECT n FROM t WHERE id = 2;").unwrap();
    assert_eq!(result.rows, vec![vec![int(25)]]);
}

#[test]
fn test_delete_with_predicate() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session.execute("CREATE TABLE t (id INT);").unwrap();
    session.execute("CREATE INDEX t(id);").unwrap();
    for i in 1..=10 {
        session
            .execute(&format!("INSERT INTO t VALUES ({});", i))
            .unwrap();
    }
    let result = session.execute("DELETE FROM t WHERE id > 5;").unwrap();
    assert_eq!(result.affected_rows, 5);

    let result = session.execute("SELECT * FROM t;").unwrap();
    assert_eq!(result.rows.len(), 5);
    // The index no longer finds a deleted key.
    let result = session.execute("SELECT * FROM t WHERE id = 7;").unwrap();
    assert!(result.rows.is_empty());
}

#[test]
fn test_join_two_tables() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session
        .execute("CREATE TABLE users (uid INT, name CHAR(8));")
        .unwrap();
    session
        .execute("CREATE TABLE orders (oid INT, uid INT, amount INT);")
        .unwrap();
    session
        .execute("INSERT INTO users VALUES (1,'alice'), (2,'bob');")
        .unwrap();
    session
        .execute("INSERT INTO orders VALUES (100,1,500), (101,1,300), (102,2,700);")
        .unwrap();

    let result = session
        .execute("SELECT name, amount FROM users JOIN orders WHERE users.uid = orders.uid;")
        .unwrap();
    assert_eq!(result.rows.len(), 3);
    let alice_total: i32 = result
        .rows
        .iter()
        .filter(|r| r[0] == s("alice"))
        .map(|r| match r[1] {
            Value::Int(n) => n,
            _ => 0,
        })
        .sum();
    assert_eq!(alice_total, 800);
}

#[test]
fn test_order_by_and_limit() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session.execute("CREATE TABLE t (id INT, v CHAR(4));").unwrap();
    session
        .execute("INSERT INTO t VALUES (3,'c'), (1,'a'), (2,'b');")
        .unwrap();

    let result = session
        .execute("SELECT id FROM t ORDER BY id DESC LIMIT 2;")
        .unwrap();
    assert_eq!(result.rows, vec![vec![int(3)], vec![int(2)]]);

    let result = session.execute("SELECT v FROM t ORDER BY id;").unwrap();
    assert_eq!(result.rows, vec![vec![s("a")], vec![s("b")], vec![s("c")]]);
}

#[test]
fn test_aggregates() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session.execute("CREATE TABLE t (id INT, n INT);").unwrap();
    session
        .execute("INSERT INTO t VALUES (1,10), (2,30), (3,20);")
        .unwrap();

    let result = session.execute("SELECT COUNT(*) AS cnt FROM t;").unwrap();
    assert_eq!(result.columns, vec!["cnt"]);
    assert_eq!(result.rows, vec![vec![int(3)]]);

    let result = session.execute("SELECT SUM(n) FROM t;").unwrap();
    assert_eq!(result.rows, vec![vec![int(60)]]);

    let result = session.execute("SELECT MAX(n) FROM t;").unwrap();
    assert_eq!(result.rows, vec![vec![int(30)]]);

    let result = session.execute("SELECT MIN(n) FROM t WHERE id > 1;").unwrap();
    assert_eq!(result.rows, vec![vec![int(20)]]);
}

#[test]
fn test_datetime_validation_and_coercion() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session
        .execute("CREATE TABLE t (id INT, at DATETIME, note CHAR(20));")
        .unwrap();
    session
        .execute("INSERT INTO t VALUES (1, '2024-02-29 08:30:00', 'leap');")
        .unwrap();

    // Feb 29 outside a leap year is rejected.
    let err = session
        .execute("INSERT INTO t VALUES (2, '2023-02-29 08:30:00', 'bad');")
        .unwrap_err();
    assert!(err.to_string().contains("datetime"));

    let result = session
        .execute("SELECT at FROM t WHERE at > '2024-01-01 00:00:00';")
        .unwrap();
    assert_eq!(result.rows, vec![vec![s("2024-02-29 08:30:00")]]);
}

#[test]
fn test_bigint_coercion() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session.execute("CREATE TABLE t (id BIGINT);").unwrap();
    // An INT literal coerces into a BIGINT column; a large literal is
    // already BIGINT.
    session.execute("INSERT INTO t VALUES (7);").unwrap();
    session.execute("INSERT INTO t VALUES (5000000000);").unwrap();

    let result = session.execute("SELECT * FROM t WHERE id > 100;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::BigInt(5_000_000_000)]]);
}

#[test]
fn test_ddl_errors() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session.execute("CREATE TABLE t (id INT);").unwrap();
    assert!(session.execute("CREATE TABLE t (id INT);").is_err());
    assert!(session.execute("SELECT * FROM missing;").is_err());
    assert!(session.execute("SELECT nope FROM t;").is_err());
    assert!(session.execute("DROP INDEX t(id);").is_err());

    session.execute("DROP TABLE t;").unwrap();
    let result = session.execute("SHOW TABLES;").unwrap();
    assert!(result.rows.is_empty());
}

#[test]
fn test_type_mismatch_in_predicate() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    let mut session = db.session();

    session.execute("CREATE TABLE t (id INT, v CHAR(4));").unwrap();
    session.execute("INSERT INTO t VALUES (1,'a');").unwrap();
    let err = session.execute("SELECT * FROM t WHERE id = 'x';").unwrap_err();
    assert!(err.to_string().contains("incompatible types"));
}
