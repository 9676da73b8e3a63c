//! Batched execution through a connection.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use txguard::config::ConnectionConfig;
use txguard::service::{CallKind, MockQueryService, StatusCode, Value};
use txguard::tx::TxState;
use txguard::{Driver, TxGuardError};

use super::common::{SharedMockFactory, MARKERS};

const INSERT: &str = "INSERT INTO items (id, name) VALUES (?, ?)";

async fn items_connection(auto_commit: bool) -> (Arc<MockQueryService>, txguard::Connection) {
    let service = Arc::new(MockQueryService::new().with_table("items", &["id", "name"]));
    let driver = Driver::with_factory(Arc::new(SharedMockFactory {
        service: service.clone(),
    }));
    let mut config = ConnectionConfig::memory("batch").with_validation_table(MARKERS);
    config.auto_commit = auto_commit;
    let conn = driver.connect(&config).await.unwrap();
    (service, conn)
}

#[tokio::test]
async fn test_batch_entries_keep_their_own_values() {
    let (service, mut conn) = items_connection(true).await;
    let mut stmt = conn.prepare(INSERT).unwrap();
    assert_eq!(stmt.slot_names(), vec!["p1", "p2"]);

    stmt.set_by_index(1, Value::Int(1), None).unwrap();
    stmt.set_by_index(2, Value::from("bolt"), None).unwrap();
    stmt.add_to_batch().unwrap();

    stmt.clear_parameters();
    stmt.set_by_index(1, Value::Int(2), None).unwrap();
    stmt.set_by_index(2, Value::from("nut"), None).unwrap();
    stmt.add_to_batch().unwrap();

    let values: Vec<Vec<Value>> = stmt
        .batch()
        .iter()
        .map(|set| set.iter().map(|p| p.value.clone()).collect())
        .collect();
    assert_eq!(
        values,
        vec![
            vec![Value::Int(1), Value::from("bolt")],
            vec![Value::Int(2), Value::from("nut")],
        ]
    );

    let results = conn.execute_batch(&mut stmt).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(stmt.batch().is_empty());

    // Auto-commit runs the whole batch as one transaction.
    assert_eq!(service.call_count(CallKind::Begin), 1);
    assert_eq!(service.call_count(CallKind::Commit), 1);
    assert_eq!(conn.state(), TxState::Committed);
    assert_eq!(service.table_rows("items").len(), 2);
    assert_eq!(service.table_rows(MARKERS).len(), 1);
}

#[tokio::test]
async fn test_failed_batch_rolls_back_everything() {
    let (service, mut conn) = items_connection(true).await;
    let mut stmt = conn.prepare(INSERT).unwrap();
    for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
        stmt.set_by_index(1, Value::Int(id), None).unwrap();
        stmt.set_by_index(2, Value::from(name), None).unwrap();
        stmt.add_to_batch().unwrap();
    }

    // Let the first entry succeed, then fail the second.
    service.script(
        CallKind::Send,
        txguard::service::ScriptedFailure::Delay(std::time::Duration::ZERO),
    );
    service.fail_next(CallKind::Send, StatusCode::PreconditionFailed);

    let err = conn.execute_batch(&mut stmt).await.unwrap_err();
    assert!(matches!(err, TxGuardError::Fatal { .. }));
    assert_eq!(conn.state(), TxState::RolledBack);
    assert!(service.table_rows("items").is_empty());
    assert_eq!(service.open_transactions(), 0);
}

#[tokio::test]
async fn test_explicit_batch_waits_for_commit() {
    let (service, mut conn) = items_connection(false).await;
    let mut stmt = conn
        .prepare("DECLARE $id AS Int64; DECLARE $name AS Utf8; INSERT INTO items (id, name) VALUES ($id, $name)")
        .unwrap();
    stmt.set_by_name("id", Value::Int(10), None).unwrap();
    stmt.set_by_name("name", Value::from("washer"), None).unwrap();
    stmt.add_to_batch().unwrap();
    stmt.set_by_name("$id", Value::Int(11), None).unwrap();
    stmt.set_by_name("$name", Value::from("spring"), None).unwrap();
    stmt.add_to_batch().unwrap();

    conn.execute_batch(&mut stmt).await.unwrap();
    assert_eq!(conn.state(), TxState::Active);
    assert!(service.table_rows("items").is_empty());

    conn.commit().await.unwrap();
    let ids: Vec<Value> = service
        .table_rows("items")
        .into_iter()
        .map(|row| row[0].clone())
        .collect();
    assert_eq!(ids, vec![Value::Int(10), Value::Int(11)]);
}

#[tokio::test]
async fn test_unbound_required_parameter_is_rejected_before_send() {
    let (service, mut conn) = items_connection(true).await;
    let mut stmt = conn.prepare(INSERT).unwrap();
    stmt.set_by_index(1, Value::Int(1), None).unwrap();

    let err = stmt.add_to_batch().unwrap_err();
    assert!(matches!(err, TxGuardError::Parameter(_)));
    assert!(stmt.batch().is_empty());

    let err = conn.execute(&stmt).await.unwrap_err();
    assert!(matches!(err, TxGuardError::Parameter(_)));
    assert_eq!(service.call_count(CallKind::Send), 0);
}

#[tokio::test]
async fn test_connections_share_prepared_queries() {
    let service = Arc::new(MockQueryService::new());
    let driver = Driver::with_factory(Arc::new(SharedMockFactory { service }));
    let config = ConnectionConfig::memory("shared");

    let a = driver.connect(&config).await.unwrap();
    let b = driver.connect(&config).await.unwrap();
    assert!(Arc::ptr_eq(a.context(), b.context()));
    assert_eq!(a.context().ref_count(), 2);

    let first = a.prepare("SELECT * FROM t WHERE id = $id").unwrap();
    let second = b.prepare("SELECT * FROM t WHERE id = $id").unwrap();
    assert!(Arc::ptr_eq(first.query(), second.query()));
    assert_eq!(a.context().cached_queries(), 1);

    a.close().await.unwrap();
    b.close().await.unwrap();
    assert!(driver.cache().is_empty());
}
