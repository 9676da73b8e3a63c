//! Retry and commit-resolution behavior through a full connection.

use pretty_assertions::assert_eq;
use txguard::query::ParamSet;
use txguard::service::{CallKind, ScriptedFailure, Status, StatusCode, Value};
use txguard::tx::{CommitOutcome, TxState};
use txguard::TxGuardError;

use super::common::{scripted_connection, MARKERS};

const INSERT: &str = "DECLARE $id AS Int64; INSERT INTO orders (id) VALUES ($id)";

#[tokio::test]
async fn test_first_statement_session_failure_is_retried() {
    let (service, _driver, mut conn) = scripted_connection("scenario-a").await;
    service.fail_next(CallKind::Send, StatusCode::BadSession);

    let mut stmt = conn.prepare(INSERT).unwrap();
    stmt.set_by_name("id", Value::Int(1), None).unwrap();
    conn.execute(&stmt).await.unwrap();

    assert_eq!(conn.state(), TxState::Active);
    assert_eq!(service.call_count(CallKind::Send), 2);
    assert_eq!(service.call_count(CallKind::Begin), 2);
    assert_eq!(conn.transaction().statement_count(), 1);

    assert_eq!(conn.commit().await.unwrap(), CommitOutcome::Committed);
}

#[tokio::test]
async fn test_session_failure_after_first_statement_is_fatal() {
    let (service, _driver, mut conn) = scripted_connection("scenario-b").await;

    let mut stmt = conn.prepare(INSERT).unwrap();
    stmt.set_by_name("id", Value::Int(1), None).unwrap();
    conn.execute(&stmt).await.unwrap();

    service.fail_next(CallKind::Send, StatusCode::SessionExpired);
    stmt.set_by_name("id", Value::Int(2), None).unwrap();
    let err = conn.execute(&stmt).await.unwrap_err();

    assert!(matches!(err, TxGuardError::Fatal { .. }));
    assert!(err.to_string().contains("transaction already active"));
    assert_eq!(err.status(), Some(StatusCode::SessionExpired));
    assert_eq!(service.call_count(CallKind::Send), 2);
    assert_eq!(conn.state(), TxState::Active);

    conn.rollback().await.unwrap();
    assert_eq!(conn.state(), TxState::RolledBack);
}

#[tokio::test]
async fn test_ambiguous_commit_resolved_by_marker() {
    let (service, _driver, mut conn) = scripted_connection("scenario-c").await;

    conn.execute_sql("UPDATE orders SET paid = true", &ParamSet::new())
        .await
        .unwrap();
    let tx_id = conn.transaction().id().unwrap().to_string();

    service.fail_commit_after_apply(StatusCode::TransportUnavailable);
    let outcome = conn.commit().await.unwrap();

    assert_eq!(outcome, CommitOutcome::ConfirmedByMarker);
    assert_eq!(conn.state(), TxState::Committed);
    assert_eq!(service.call_count(CallKind::ReadByKey), 1);
    assert_eq!(service.table_rows(MARKERS)[0][0], Value::String(tx_id));
    assert_eq!(
        service.committed_statements(),
        vec!["UPDATE orders SET paid = true".to_string()]
    );
}

#[tokio::test]
async fn test_ambiguous_commit_without_marker_is_not_committed() {
    let (service, _driver, mut conn) = scripted_connection("scenario-d").await;

    conn.execute_sql("UPDATE orders SET paid = true", &ParamSet::new())
        .await
        .unwrap();
    let tx_id = conn.transaction().id().unwrap().to_string();

    service.fail_next(CallKind::Commit, StatusCode::TransportUnavailable);
    let err = conn.commit().await.unwrap_err();

    match &err {
        TxGuardError::NotCommitted { status, tx_id: id } => {
            assert_eq!(*status, StatusCode::TransportUnavailable);
            assert_eq!(id, &tx_id);
        }
        other => panic!("expected NotCommitted, got {:?}", other),
    }
    assert!(err.is_retryable_by_caller());
    assert_eq!(conn.state(), TxState::RolledBack);
    assert!(service.table_rows(MARKERS).is_empty());
    assert!(service.committed_statements().is_empty());
}

#[tokio::test]
async fn test_failed_lookup_leaves_commit_unresolved() {
    let (service, _driver, mut conn) = scripted_connection("unresolved").await;

    conn.execute_sql("UPDATE orders SET paid = true", &ParamSet::new())
        .await
        .unwrap();

    service.fail_commit_after_apply(StatusCode::Undetermined);
    service.fail_next(CallKind::ReadByKey, StatusCode::Unavailable);
    let err = conn.commit().await.unwrap_err();

    assert!(matches!(err, TxGuardError::AmbiguousCommitUnresolved { .. }));
    assert_eq!(err.status(), Some(StatusCode::Undetermined));
    assert_eq!(service.call_count(CallKind::ReadByKey), 1);
    assert_eq!(conn.state(), TxState::RolledBack);
}

#[tokio::test]
async fn test_commit_is_never_resent() {
    let (service, _driver, mut conn) = scripted_connection("idempotent").await;

    conn.execute_sql("UPDATE orders SET paid = true", &ParamSet::new())
        .await
        .unwrap();
    conn.commit().await.unwrap();

    let err = conn.commit().await.unwrap_err();
    assert!(matches!(err, TxGuardError::TransactionInvalid(_)));
    assert_eq!(service.call_count(CallKind::Commit), 1);
}

#[tokio::test]
async fn test_next_statement_after_commit_starts_new_transaction() {
    let (service, _driver, mut conn) = scripted_connection("fresh").await;

    conn.execute_sql("UPDATE a SET x = 1", &ParamSet::new())
        .await
        .unwrap();
    let first = conn.transaction().id().map(String::from);
    conn.commit().await.unwrap();

    conn.execute_sql("UPDATE a SET x = 2", &ParamSet::new())
        .await
        .unwrap();
    assert_eq!(conn.state(), TxState::Active);
    assert_ne!(conn.transaction().id().map(String::from), first);
    assert!(conn.transaction().statement_count() == 1);
    assert_eq!(service.call_count(CallKind::Begin), 2);
}

#[tokio::test]
async fn test_marker_write_failure_rolls_back() {
    let (service, _driver, mut conn) = scripted_connection("marker-fail").await;

    conn.execute_sql("UPDATE a SET x = 1", &ParamSet::new())
        .await
        .unwrap();
    service.script(
        CallKind::Send,
        ScriptedFailure::Fail(Status::new(StatusCode::Overloaded, "too many requests")),
    );

    let err = conn.commit().await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::Overloaded));
    assert_eq!(conn.state(), TxState::RolledBack);
    assert_eq!(service.call_count(CallKind::Commit), 0);
}

#[tokio::test]
async fn test_rollback_after_commit_pending_failure_is_noop() {
    let (service, _driver, mut conn) = scripted_connection("rollback-noop").await;

    conn.execute_sql("UPDATE a SET x = 1", &ParamSet::new())
        .await
        .unwrap();
    service.fail_next(CallKind::Commit, StatusCode::InternalError);
    assert!(conn.commit().await.is_err());
    assert_eq!(conn.state(), TxState::RolledBack);

    let rollbacks = service.call_count(CallKind::Rollback);
    conn.rollback().await.unwrap();
    assert_eq!(service.call_count(CallKind::Rollback), rollbacks);
}

#[tokio::test]
async fn test_dropping_connection_rolls_back_open_transaction() {
    let (service, driver, mut conn) = scripted_connection("dropped-tx").await;

    conn.execute_sql("UPDATE orders SET paid = true", &ParamSet::new())
        .await
        .unwrap();
    assert_eq!(service.open_transactions(), 1);
    let context = conn.context().clone();

    drop(conn);
    assert!(driver.cache().is_empty());

    for _ in 0..10 {
        if service.is_closed() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(service.call_count(CallKind::Rollback), 1);
    assert_eq!(service.open_transactions(), 0);
    assert!(context.is_closed());
    assert!(service.committed_statements().is_empty());
}
