//! End-to-end session tests against the in-memory sync server.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use vellum_common::config::{ClientResyncMode, StopPolicy, SyncConfig, SyncMode};
use vellum_common::{ErrorCode, Status};
use vellum_sync::protocol::{CompensatingWriteInfo, ProtocolError, ProtocolErrorInfo};
use vellum_sync::transport::GenericNetworkTransport;
use vellum_sync::{
    Action, ClientResetHooks, ConnectionState, ProgressDirection, SessionErrorInfo, SessionState,
    SyncManager, SyncSession,
};
use vellum_txn::Db;

use common::{add_item, item_keys, sync_db, wait_until, Harness, TokenEndpoint, ITEMS, SALT};

fn partition() -> SyncConfig {
    SyncConfig::partition("alice", "shared")
}

fn collect_errors(session: &SyncSession) -> Arc<Mutex<Vec<SessionErrorInfo>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    session.set_error_handler(Arc::new(move |e| sink.lock().push(e)));
    errors
}

fn commit_item(session: &SyncSession, db: &Db, key: i64) {
    let version = add_item(db, key);
    session.nonsync_transact_notify(version);
}

#[tokio::test]
async fn test_changes_flow_between_clients() {
    let harness = Harness::start();
    let manager_a = harness.manager(None);
    let manager_b = harness.manager(None);
    let (db_a, db_b) = (sync_db(), sync_db());
    let a = manager_a.get_session("/a.vellum", &db_a, partition()).unwrap();
    let b = manager_b.get_session("/b.vellum", &db_b, partition()).unwrap();

    commit_item(&a, &db_a, 1);
    commit_item(&a, &db_a, 2);
    a.upload_completion().await.unwrap();
    b.download_completion().await.unwrap();
    assert_eq!(item_keys(&db_b), vec![1, 2]);

    commit_item(&b, &db_b, 3);
    b.upload_completion().await.unwrap();
    a.download_completion().await.unwrap();
    assert_eq!(item_keys(&db_a), vec![1, 2, 3]);

    // downloads integrated by b are never echoed back
    assert_eq!(harness.server.history_len(), 3);
    assert_eq!(harness.server.file_count(), 2);
    let (ident_a, ident_b) = (a.file_ident().unwrap(), b.file_ident().unwrap());
    assert_ne!(ident_a.ident, ident_b.ident);
    assert_eq!(ident_a.salt, SALT);
    assert_eq!(a.connection_state(), ConnectionState::Connected);
    assert!(a.sync_progress().upload.client_version >= 2);
}

#[tokio::test]
async fn test_completion_waits_on_an_idle_session() {
    let harness = Harness::start();
    let manager = harness.manager(None);
    let db = sync_db();
    let session = manager
        .get_session("/flx.vellum", &db, SyncConfig::flexible("alice"))
        .unwrap();
    assert_eq!(session.sync_mode(), SyncMode::Flx);

    // nothing committed, nothing to wait for
    session.upload_completion().await.unwrap();
    session.download_completion().await.unwrap();
    assert!(session.file_ident().is_some());
    assert_eq!(harness.server.binds(), 1);
}

#[tokio::test]
async fn test_stop_policy_immediately() {
    let harness = Harness::start();
    let manager = harness.manager(None);
    let db = sync_db();
    let config = partition().with_stop_policy(StopPolicy::Immediately);
    let session = manager.get_session("/a.vellum", &db, config).unwrap();
    session.download_completion().await.unwrap();

    session.close();
    assert_eq!(session.state(), SessionState::Inactive);
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);

    session.revive_if_needed();
    assert_eq!(session.state(), SessionState::Active);
    session.download_completion().await.unwrap();
}

#[tokio::test]
async fn test_stop_policy_live_indefinitely() {
    let harness = Harness::start();
    let manager = harness.manager(None);
    let db = sync_db();
    let config = partition().with_stop_policy(StopPolicy::LiveIndefinitely);
    let session = manager.get_session("/a.vellum", &db, config).unwrap();

    session.close();
    assert_eq!(session.state(), SessionState::Active);
    session.download_completion().await.unwrap();
}

#[tokio::test]
async fn test_closing_session_uploads_before_going_inactive() {
    let harness = Harness::start();
    let manager = harness.manager(None);
    let db = sync_db();
    let session = manager.get_session("/a.vellum", &db, partition()).unwrap();
    assert_eq!(session.stop_policy(), StopPolicy::AfterChangesUploaded);

    // the connection task has not run yet, so the change is still pending
    commit_item(&session, &db, 7);
    session.close();
    assert_eq!(session.state(), SessionState::Dying);

    wait_until("session to finish dying", || {
        session.state() == SessionState::Inactive
    })
    .await;
    assert_eq!(harness.server.history_len(), 1);
}

#[tokio::test]
async fn test_revived_dying_session_keeps_running() {
    let harness = Harness::start();
    let manager = harness.manager(None);
    let db = sync_db();
    let session = manager.get_session("/a.vellum", &db, partition()).unwrap();

    commit_item(&session, &db, 1);
    session.close();
    assert_eq!(session.state(), SessionState::Dying);
    session.revive_if_needed();
    assert_eq!(session.state(), SessionState::Active);

    session.upload_completion().await.unwrap();
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn test_pause_cancels_waiters_and_resume_reconnects() {
    let harness = Harness::start();
    let manager = harness.manager(None);
    let db = sync_db();
    let session = manager.get_session("/a.vellum", &db, partition()).unwrap();

    let seen: Arc<Mutex<Option<Status>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    session.wait_for_download_completion(Box::new(move |status| {
        *sink.lock() = Some(status);
    }));

    session.pause();
    assert_eq!(session.state(), SessionState::Paused);
    let status = seen.lock().take().expect("waiter was called");
    assert_eq!(status.code(), ErrorCode::Cancelled);

    // closing or reviving a paused session does nothing
    session.close();
    session.revive_if_needed();
    assert_eq!(session.state(), SessionState::Paused);

    session.resume();
    assert_eq!(session.state(), SessionState::Active);
    session.download_completion().await.unwrap();
}

#[tokio::test]
async fn test_expired_token_is_refreshed() {
    let harness = Harness::start();
    harness.server.require_token("access-2");
    let tokens = TokenEndpoint::new("access-2");
    let network: Arc<dyn GenericNetworkTransport> = tokens.clone();
    let manager = harness.manager(Some(network));
    let db = sync_db();
    let session = manager.get_session("/a.vellum", &db, partition()).unwrap();

    session.download_completion().await.unwrap();
    assert_eq!(harness.server.tokens_seen(), vec!["access-1", "access-2"]);
    assert_eq!(tokens.request_count(), 1);
    assert_eq!(
        tokens.last_url().as_deref(),
        Some("http://sync.test:9090/api/client/v2.0/auth/session")
    );
    assert_eq!(session.user().access_token(), "access-2");
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn test_waits_for_token_without_network_transport() {
    let harness = Harness::start();
    harness.server.require_token("access-2");
    let manager = harness.manager(None);
    let db = sync_db();
    let session = manager.get_session("/a.vellum", &db, partition()).unwrap();

    wait_until("session to wait for a token", || {
        session.state() == SessionState::WaitingForAccessToken
    })
    .await;
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);

    session.update_access_token("access-2");
    assert_eq!(session.state(), SessionState::Active);
    session.download_completion().await.unwrap();
}

#[tokio::test]
async fn test_reconnects_after_failed_connects() {
    let harness = Harness::start();
    harness.sockets.fail_next_connects(2);
    let manager = harness.manager(None);
    let db = sync_db();
    let session = manager.get_session("/a.vellum", &db, partition()).unwrap();
    let errors = collect_errors(&session);

    commit_item(&session, &db, 1);
    session.upload_completion().await.unwrap();
    assert_eq!(harness.sockets.connect_count(), 3);
    assert_eq!(harness.server.connections(), 1);
    // connection failures are retried silently
    assert!(errors.lock().is_empty());
}

#[tokio::test]
async fn test_reconnects_after_server_closes_connection() {
    let harness = Harness::start();
    harness.server.close_next_bind(1001);
    let manager = harness.manager(None);
    let db = sync_db();
    let session = manager.get_session("/a.vellum", &db, partition()).unwrap();

    session.download_completion().await.unwrap();
    assert_eq!(harness.server.binds(), 2);
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn test_fatal_error_stops_session() {
    let harness = Harness::start();
    harness.server.fail_next_bind(
        ProtocolErrorInfo::from_error(ProtocolError::IllegalRealmPath, false)
            .with_log_url("https://logs.test/42"),
    );
    let manager = harness.manager(None);
    let db = sync_db();
    let session = manager.get_session("/a.vellum", &db, partition()).unwrap();
    let errors = collect_errors(&session);

    let err = session.download_completion().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SyncSessionError);
    assert_eq!(session.state(), SessionState::Inactive);

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_fatal);
    assert_eq!(errors[0].action, Action::ApplicationBug);
    assert_eq!(errors[0].log_url.as_deref(), Some("https://logs.test/42"));
    assert!(errors[0].status.reason().contains("Logs: https://logs.test/42"));
    assert_eq!(session.last_error(), Some(errors[0].status.clone()));
}

#[tokio::test]
async fn test_compensating_write_is_reported_as_warning() {
    let harness = Harness::start();
    let mut info = ProtocolErrorInfo::from_error(ProtocolError::CompensatingWrite, false);
    info.compensating_writes.push(CompensatingWriteInfo {
        object_name: ITEMS.to_string(),
        primary_key: "1".to_string(),
        reason: "write not allowed".to_string(),
    });
    harness.server.fail_next_upload(info);
    let manager = harness.manager(None);
    let db = sync_db();
    let session = manager.get_session("/a.vellum", &db, partition()).unwrap();
    let errors = collect_errors(&session);

    commit_item(&session, &db, 1);
    session.upload_completion().await.unwrap();
    wait_until("warning to be reported", || !errors.lock().is_empty()).await;

    let errors = errors.lock();
    assert!(!errors[0].is_fatal);
    assert_eq!(errors[0].action, Action::Warning);
    assert_eq!(errors[0].status.code(), ErrorCode::SyncCompensatingWrite);
    assert_eq!(errors[0].compensating_writes[0].object_name, ITEMS);
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn test_upload_progress_reaches_transferrable() {
    let harness = Harness::start();
    let manager = harness.manager(None);
    let db = sync_db();
    let session = manager.get_session("/a.vellum", &db, partition()).unwrap();

    let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let token = session.register_progress_notifier(
        ProgressDirection::Upload,
        true,
        Box::new(move |transferred, transferrable| sink.lock().push((transferred, transferrable))),
    );

    commit_item(&session, &db, 1);
    session.upload_completion().await.unwrap();
    wait_until("upload progress to complete", || {
        seen.lock()
            .last()
            .map_or(false, |&(done, total)| total > 0 && done == total)
    })
    .await;
    assert!(seen.lock().iter().all(|&(done, total)| done <= total));

    session.unregister_progress_notifier(token);
    let count = seen.lock().len();
    commit_item(&session, &db, 2);
    session.upload_completion().await.unwrap();
    assert_eq!(seen.lock().len(), count);
}

struct ResetFixture {
    harness: Harness,
    _manager: SyncManager,
    session: SyncSession,
    db: Db,
    recovered: Arc<Mutex<Vec<bool>>>,
}

/// Uploads item 1, loses it on the server, commits item 2 while paused,
/// then reconnects into a client reset.
async fn reset_after_restore(mode: ClientResyncMode) -> ResetFixture {
    let harness = Harness::start();
    let manager = harness.manager(None);
    let db = sync_db();
    let session = manager
        .get_session("/a.vellum", &db, partition().with_client_resync_mode(mode))
        .unwrap();
    let recovered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&recovered);
    session.set_client_reset_hooks(ClientResetHooks {
        before: Some(Box::new(|before| {
            let table = before.find_table(ITEMS).unwrap().unwrap();
            assert_eq!(before.table_size(table).unwrap(), 2);
        })),
        after: Some(Box::new(move |_, _, did_recover| sink.lock().push(did_recover))),
    });

    commit_item(&session, &db, 1);
    session.upload_completion().await.unwrap();
    assert_eq!(session.file_ident().unwrap().ident, 1);

    session.pause();
    harness.server.restore_backup(0);
    commit_item(&session, &db, 2);
    session.resume();
    ResetFixture {
        harness,
        _manager: manager,
        session,
        db,
        recovered,
    }
}

#[tokio::test]
async fn test_client_reset_recovers_unsynced_changes() {
    let ResetFixture {
        harness,
        session,
        db,
        recovered,
        _manager,
    } = reset_after_restore(ClientResyncMode::Recover).await;

    wait_until("recovered change to reach the server", || {
        harness.server.history_len() == 1
    })
    .await;
    assert_eq!(item_keys(&db), vec![2]);
    assert_eq!(*recovered.lock(), vec![true]);
    assert_eq!(session.file_ident().unwrap().ident, 2);
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn test_client_reset_discards_local_changes() {
    let ResetFixture {
        harness,
        session,
        db,
        recovered,
        _manager,
    } = reset_after_restore(ClientResyncMode::DiscardLocal).await;

    wait_until("local state to be discarded", || item_keys(&db).is_empty()).await;
    wait_until("reset to finish", || !recovered.lock().is_empty()).await;
    assert_eq!(*recovered.lock(), vec![false]);
    session.download_completion().await.unwrap();
    assert_eq!(session.file_ident().unwrap().ident, 2);
    assert_eq!(harness.server.history_len(), 0);
}

#[tokio::test]
async fn test_manual_client_reset_is_left_to_the_application() {
    let harness = Harness::start();
    let manager = harness.manager(None);
    let db = sync_db();
    let config = partition().with_client_resync_mode(ClientResyncMode::Manual);
    let session = manager.get_session("/a.vellum", &db, config).unwrap();
    let errors = collect_errors(&session);

    commit_item(&session, &db, 1);
    session.upload_completion().await.unwrap();
    session.pause();
    harness.server.restore_backup(0);
    session.resume();

    wait_until("session to stop", || session.state() == SessionState::Inactive).await;
    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_fatal);
    assert_eq!(errors[0].action, Action::ClientReset);
    assert_eq!(errors[0].status.code(), ErrorCode::SyncClientResetRequired);
    assert_eq!(item_keys(&db), vec![1]);
}

#[tokio::test]
async fn test_migration_to_flexible_sync() {
    let harness = Harness::start();
    harness
        .server
        .fail_next_bind(ProtocolErrorInfo::from_error(ProtocolError::MigrateToFlx, false));
    let manager = harness.manager(None);
    let db = sync_db();
    let session = manager.get_session("/a.vellum", &db, partition()).unwrap();
    assert_eq!(session.sync_mode(), SyncMode::Pbs);

    wait_until("session to switch protocols", || {
        session.sync_mode() == SyncMode::Flx && session.file_ident().is_some()
    })
    .await;
    session.download_completion().await.unwrap();
    assert_eq!(session.state(), SessionState::Active);
}
