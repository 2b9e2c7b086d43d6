//! End-to-end engine scenarios: transactions, parallel execution,
//! durability, and cross-restart behavior.

use dotdb_core::{
    from_json, Aggregate, BatchOp, CoreError, Database, Durability, Filter, FilterOp, IndexSpec,
    Options, Value,
};
use tempfile::tempdir;

fn number(n: f64) -> Value {
    Value::Number(n)
}

#[test]
fn transaction_commits_on_ok() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("db.json")).unwrap();

    let total = db
        .transaction(|tx| {
            tx.set("bank.alice", number(50.0))?;
            tx.set("bank.bob", number(80.0))?;
            tx.add("bank.total", 130.0)
        })
        .unwrap();

    assert_eq!(total, 130.0);
    assert_eq!(db.get("bank.alice").unwrap(), Some(number(50.0)));
    assert_eq!(db.get("bank.total").unwrap(), Some(number(130.0)));
}

#[test]
fn transaction_rolls_back_on_error() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("db.json")).unwrap();
    db.set("bank.alice", number(10.0)).unwrap();
    let before = db.get("").unwrap().unwrap();

    let result: Result<(), CoreError> = db.transaction(|tx| {
        tx.set("bank.alice", number(0.0))?;
        tx.set("bank.mallory", number(1_000_000.0))?;
        Err(CoreError::type_error("insufficient funds"))
    });

    assert!(result.is_err());
    assert_eq!(db.get("").unwrap().unwrap(), before);
    assert!(!db.has("bank.mallory").unwrap());
}

#[test]
fn savepoint_rollback_keeps_earlier_writes() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("db.json")).unwrap();
    db.set("bank.bob", number(30.0)).unwrap();

    db.transaction(|tx| {
        tx.set("bank.alice", number(50.0))?;
        tx.savepoint("sp1");
        tx.set("bank.bob", number(80.0))?;
        tx.set("bank.charlie", number(20.0))?;
        tx.rollback_to("sp1")?;
        Ok(())
    })
    .unwrap();

    assert_eq!(
        db.get("bank").unwrap().unwrap(),
        from_json(r#"{"bob":30,"alice":50}"#).unwrap()
    );
    assert!(!db.has("bank.charlie").unwrap());
}

#[test]
fn rollback_to_unknown_savepoint_is_tx_conflict() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("db.json")).unwrap();

    let result: Result<(), CoreError> = db.transaction(|tx| {
        tx.set("a", number(1.0))?;
        tx.rollback_to("nope")?;
        Ok(())
    });
    assert!(matches!(result, Err(CoreError::TxConflict { .. })));
    // The failed transaction rolled back entirely.
    assert!(!db.has("a").unwrap());
}

#[test]
fn nested_transaction_is_a_savepoint() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("db.json")).unwrap();

    db.transaction(|tx| {
        tx.set("outer", number(1.0))?;
        let inner: Result<(), CoreError> = tx.nested(|tx| {
            tx.set("inner", number(2.0))?;
            Err(CoreError::type_error("abort inner"))
        });
        assert!(inner.is_err());
        tx.set("outer2", number(3.0))?;
        Ok(())
    })
    .unwrap();

    assert_eq!(db.get("outer").unwrap(), Some(number(1.0)));
    assert_eq!(db.get("outer2").unwrap(), Some(number(3.0)));
    assert!(!db.has("inner").unwrap());
}

#[test]
fn aborted_span_never_survives_replay() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.json");
    let options = || Options::new().durability(Durability::Sync);

    {
        let db = Database::open_with_options(&path, options()).unwrap();
        db.set("keep", number(1.0)).unwrap();

        let result: Result<(), CoreError> = db.transaction(|tx| {
            tx.set("ghost", number(666.0))?;
            Err(CoreError::type_error("abort"))
        });
        assert!(result.is_err());

        db.sync().unwrap();
        std::mem::forget(db); // crash: no checkpoint on the way out
    }

    let db = Database::open_with_options(&path, options()).unwrap();
    assert_eq!(db.get("keep").unwrap(), Some(number(1.0)));
    assert!(!db.has("ghost").unwrap(), "aborted write replayed");
}

#[test]
fn committed_transaction_survives_replay() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.json");
    let options = || Options::new().durability(Durability::Sync);

    {
        let db = Database::open_with_options(&path, options()).unwrap();
        db.transaction(|tx| {
            tx.set("bank.alice", number(50.0))?;
            tx.savepoint("sp");
            tx.set("bank.bob", number(80.0))?;
            tx.rollback_to("sp")?;
            tx.set("bank.carol", number(5.0))?;
            Ok(())
        })
        .unwrap();
        db.sync().unwrap();
        std::mem::forget(db);
    }

    let db = Database::open_with_options(&path, options()).unwrap();
    assert_eq!(
        db.get("bank").unwrap().unwrap(),
        from_json(r#"{"alice":50,"carol":5}"#).unwrap()
    );
    assert!(!db.has("bank.bob").unwrap());
}

fn seed_users(db: &Database, count: usize) {
    db.transaction(|tx| {
        for i in 0..count {
            let age = 18 + (i * 13) % 60; // spans 18..=77
            let doc = from_json(&format!(
                r#"{{"id":{i},"age":{age},"active":{}}}"#,
                i % 2 == 0
            ))
            .unwrap();
            tx.set(&format!("u.user{i:04}"), doc)?;
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn parallel_query_matches_sequential_filter() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("db.json")).unwrap();
    seed_users(&db, 500);

    let filters = vec![
        Filter::new("age", FilterOp::Gte, number(50.0)),
        Filter::new("active", FilterOp::Eq, Value::Bool(true)),
    ];
    let results = db.parallel_query("u", &filters).unwrap();

    // Sequential reference over the collection snapshot.
    let collection = db.get("u").unwrap().unwrap();
    let expected: Vec<Value> = collection
        .as_object()
        .unwrap()
        .values()
        .filter(|doc| {
            let map = doc.as_object().unwrap();
            map.get("age").unwrap().as_f64().unwrap() >= 50.0
                && map.get("active").unwrap() == &Value::Bool(true)
        })
        .cloned()
        .collect();

    assert!(!results.is_empty());
    assert_eq!(results, expected);
}

#[test]
fn parallel_aggregate_bounds() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("db.json")).unwrap();
    seed_users(&db, 500);

    assert_eq!(
        db.parallel_aggregate("u", Aggregate::Count, None).unwrap(),
        Some(number(500.0))
    );
    assert_eq!(
        db.parallel_aggregate("u", Aggregate::Min, Some("age"))
            .unwrap(),
        Some(number(18.0))
    );
    assert_eq!(
        db.parallel_aggregate("u", Aggregate::Max, Some("age"))
            .unwrap(),
        Some(number(77.0))
    );

    // Empty collection semantics.
    assert_eq!(
        db.parallel_aggregate("empty", Aggregate::Min, Some("age"))
            .unwrap(),
        None
    );
    assert_eq!(
        db.parallel_aggregate("empty", Aggregate::Avg, Some("age"))
            .unwrap(),
        Some(number(0.0))
    );
}

#[test]
fn parallel_lookup_joins_users_to_orders() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("db.json")).unwrap();

    db.batch(vec![
        BatchOp::Set {
            path: "users.alice".into(),
            value: from_json(r#"{"id":1,"name":"Alice"}"#).unwrap(),
        },
        BatchOp::Set {
            path: "users.bob".into(),
            value: from_json(r#"{"id":2,"name":"Bob"}"#).unwrap(),
        },
        BatchOp::Set {
            path: "users.charlie".into(),
            value: from_json(r#"{"id":3,"name":"Charlie"}"#).unwrap(),
        },
        BatchOp::Set {
            path: "orders.o1".into(),
            value: from_json(r#"{"userId":1,"sku":"a"}"#).unwrap(),
        },
        BatchOp::Set {
            path: "orders.o2".into(),
            value: from_json(r#"{"userId":1,"sku":"b"}"#).unwrap(),
        },
        BatchOp::Set {
            path: "orders.o3".into(),
            value: from_json(r#"{"userId":2,"sku":"c"}"#).unwrap(),
        },
        BatchOp::Set {
            path: "orders.o4".into(),
            value: from_json(r#"{"userId":2,"sku":"d"}"#).unwrap(),
        },
        BatchOp::Set {
            path: "orders.o5".into(),
            value: from_json(r#"{"userId":2,"sku":"e"}"#).unwrap(),
        },
    ])
    .unwrap();

    let joined = db
        .parallel_lookup("users", "orders", "id", "userId", "orders")
        .unwrap();

    let summary: Vec<(String, usize)> = joined
        .iter()
        .map(|user| {
            let map = user.as_object().unwrap();
            (
                map.get("name").unwrap().as_str().unwrap().to_owned(),
                map.get("orders").unwrap().as_array().unwrap().len(),
            )
        })
        .collect();

    assert_eq!(
        summary,
        vec![
            ("Alice".to_owned(), 2),
            ("Bob".to_owned(), 3),
            ("Charlie".to_owned(), 0),
        ]
    );
}

#[test]
fn indexed_query_equals_full_scan() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(
        dir.path().join("db.json"),
        Options::new().index(IndexSpec::new("by_team", "players", "team")),
    )
    .unwrap();

    db.transaction(|tx| {
        for i in 0..200 {
            let team = ["red", "blue", "green"][i % 3];
            let doc = from_json(&format!(r#"{{"n":{i},"team":"{team}"}}"#)).unwrap();
            tx.set(&format!("players.p{i:03}"), doc)?;
        }
        Ok(())
    })
    .unwrap();

    let filters = vec![
        Filter::new("team", FilterOp::Eq, Value::from("blue")),
        Filter::new("n", FilterOp::Lt, number(100.0)),
    ];
    let indexed = db.parallel_query("players", &filters).unwrap();

    // Reference without the index: same filters on an unindexed copy.
    let everyone = db.parallel_query("players", &[]).unwrap();
    let expected: Vec<&Value> = everyone
        .iter()
        .filter(|doc| {
            let map = doc.as_object().unwrap();
            map.get("team").unwrap().as_str() == Some("blue")
                && map.get("n").unwrap().as_f64().unwrap() < 100.0
        })
        .collect();

    assert_eq!(indexed.len(), expected.len());
    for doc in &indexed {
        assert!(expected.contains(&doc));
    }
}

#[test]
fn find_by_index_is_ordered_with_writes() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(
        dir.path().join("db.json"),
        Options::new().index(IndexSpec::new("email", "users", "email")),
    )
    .unwrap();

    db.set("users.a", from_json(r#"{"email":"x@x"}"#).unwrap())
        .unwrap();
    assert!(db.find_by_index("email", &Value::from("x@x")).unwrap().is_some());

    // Rewriting the field moves the entry immediately.
    db.set("users.a.email", Value::from("y@y")).unwrap();
    assert!(db.find_by_index("email", &Value::from("x@x")).unwrap().is_none());
    assert!(db.find_by_index("email", &Value::from("y@y")).unwrap().is_some());

    db.delete("users.a").unwrap();
    assert!(db.find_by_index("email", &Value::from("y@y")).unwrap().is_none());
}

#[test]
fn concurrent_readers_never_observe_torn_documents() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path().join("db.json")).unwrap());
    db.set("doc", from_json(r#"{"a":0,"b":0}"#).unwrap()).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let db = Arc::clone(&db);
        let stop = Arc::clone(&stop);
        readers.push(std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if let Some(doc) = db.get("doc").unwrap() {
                    let map = doc.as_object().unwrap();
                    let a = map.get("a").unwrap().as_f64().unwrap();
                    let b = map.get("b").unwrap().as_f64().unwrap();
                    assert_eq!(a, b, "torn read: a={a} b={b}");
                }
            }
        }));
    }

    for i in 1..=200 {
        let doc = from_json(&format!(r#"{{"a":{i},"b":{i}}}"#)).unwrap();
        db.set("doc", doc).unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn push_single_wal_record_replays_dedup() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.json");
    let options = || Options::new().durability(Durability::Sync);

    {
        let db = Database::open_with_options(&path, options()).unwrap();
        db.push(
            "tags",
            vec![Value::from("x"), Value::from("x"), Value::from("y")],
        )
        .unwrap();
        db.push("tags", vec![Value::from("y"), Value::from("z")])
            .unwrap();
        std::mem::forget(db);
    }

    let db = Database::open_with_options(&path, options()).unwrap();
    assert_eq!(
        db.get("tags").unwrap(),
        Some(from_json(r#"["x","y","z"]"#).unwrap())
    );
}

#[test]
fn lazy_mode_accepts_writes_without_guarantee() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(
        dir.path().join("db.json"),
        Options::new().durability(Durability::Lazy),
    )
    .unwrap();
    db.set("k", number(1.0)).unwrap();
    assert!(db.wal_status().enabled);
    db.close().unwrap();
}
