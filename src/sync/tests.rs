//! Integration Tests for Sync Module
//!
//! Drives the pool, orchestrator, prefetcher and scheduler against a scripted
//! in-memory IMAP server and an in-memory database:
//! - Incremental sync, cursors and duplicate-free import
//! - Read-flag reconciliation and notifications
//! - Retry, idle teardown and connection reuse
//! - Concurrent sync requests

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::db::{Database, MailStore, NewAccount};
    use crate::mail::{
        FetchedBody, ImapConfig, MailError, MailResult, MailSession, MailboxInfo, MailboxSyncRequest,
        MailboxSyncResult, RemoteMessage, SessionConnector, SpecialUse,
    };
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    // ========================================================================
    // Scripted IMAP server
    // ========================================================================

    struct FakeMailbox {
        path: String,
        selectable: bool,
        messages: BTreeMap<u32, RemoteMessage>,
    }

    #[derive(Default)]
    struct ServerState {
        mailboxes: Vec<FakeMailbox>,
        connects: usize,
        logouts: usize,
        sync_calls: usize,
        /// Errors returned by the next session commands, in order
        failures: VecDeque<MailError>,
        connect_failures: VecDeque<MailError>,
        failing_body_mailboxes: HashSet<String>,
        /// Listed but answered with NO on SELECT
        rejected_mailboxes: HashSet<String>,
        connect_passwords: Vec<String>,
        body_fetches: usize,
        sync_delay: Option<Duration>,
        break_sessions: bool,
        seen_updates: Vec<(String, Vec<u32>, bool)>,
    }

    #[derive(Clone, Default)]
    struct FakeServer {
        state: Arc<StdMutex<ServerState>>,
    }

    fn remote(mailbox: &str, uid: u32) -> RemoteMessage {
        RemoteMessage {
            uid,
            message_id: Some(format!("<{}-{}@example.com>", mailbox.to_lowercase(), uid)),
            subject: format!("Message {}", uid),
            from_address: "alice@example.com".to_string(),
            from_name: Some("Alice".to_string()),
            to_addresses: vec!["me@example.com".to_string()],
            date: "Mon, 1 Jan 2024 00:00:00 +0000".to_string(),
            ..Default::default()
        }
    }

    impl FakeServer {
        fn with_mailboxes(paths: &[&str]) -> Self {
            let server = Self::default();
            {
                let mut state = server.state.lock().unwrap();
                for path in paths {
                    state.mailboxes.push(FakeMailbox {
                        path: path.to_string(),
                        selectable: true,
                        messages: BTreeMap::new(),
                    });
                }
            }
            server
        }

        fn add_noselect(&self, path: &str) {
            self.state.lock().unwrap().mailboxes.push(FakeMailbox {
                path: path.to_string(),
                selectable: false,
                messages: BTreeMap::new(),
            });
        }

        fn add_message(&self, mailbox: &str, message: RemoteMessage) {
            let mut state = self.state.lock().unwrap();
            let target = state
                .mailboxes
                .iter_mut()
                .find(|m| m.path == mailbox)
                .expect("unknown mailbox");
            target.messages.insert(message.uid, message);
        }

        fn add_messages(&self, mailbox: &str, uids: impl IntoIterator<Item = u32>) {
            for uid in uids {
                self.add_message(mailbox, remote(mailbox, uid));
            }
        }

        fn set_remote_read(&self, mailbox: &str, uid: u32, read: bool) {
            let mut state = self.state.lock().unwrap();
            let target = state.mailboxes.iter_mut().find(|m| m.path == mailbox).unwrap();
            target.messages.get_mut(&uid).unwrap().is_read = read;
        }

        fn fail_next(&self, error: MailError) {
            self.state.lock().unwrap().failures.push_back(error);
        }

        fn fail_next_connect(&self, error: MailError) {
            self.state.lock().unwrap().connect_failures.push_back(error);
        }

        fn fail_bodies_for(&self, mailbox: &str) {
            self.state.lock().unwrap().failing_body_mailboxes.insert(mailbox.to_string());
        }

        fn reject_select(&self, mailbox: &str) {
            self.state.lock().unwrap().rejected_mailboxes.insert(mailbox.to_string());
        }

        fn connect_passwords(&self) -> Vec<String> {
            self.state.lock().unwrap().connect_passwords.clone()
        }

        fn set_sync_delay(&self, delay: Duration) {
            self.state.lock().unwrap().sync_delay = Some(delay);
        }

        fn break_sessions(&self) {
            self.state.lock().unwrap().break_sessions = true;
        }

        fn connects(&self) -> usize {
            self.state.lock().unwrap().connects
        }

        fn logouts(&self) -> usize {
            self.state.lock().unwrap().logouts
        }

        fn body_fetches(&self) -> usize {
            self.state.lock().unwrap().body_fetches
        }

        fn sync_calls(&self) -> usize {
            self.state.lock().unwrap().sync_calls
        }

        fn seen_updates(&self) -> Vec<(String, Vec<u32>, bool)> {
            self.state.lock().unwrap().seen_updates.clone()
        }
    }

    #[async_trait]
    impl SessionConnector for FakeServer {
        async fn connect(&self, config: &ImapConfig) -> MailResult<Box<dyn MailSession>> {
            let mut state = self.state.lock().unwrap();
            state.connects += 1;
            state.connect_passwords.push(config.password.to_string());
            if let Some(error) = state.connect_failures.pop_front() {
                return Err(error);
            }
            state.break_sessions = false;
            Ok(Box::new(FakeSession {
                server: self.clone(),
                logged_out: false,
            }))
        }
    }

    struct FakeSession {
        server: FakeServer,
        logged_out: bool,
    }

    impl FakeSession {
        fn next_failure(&self) -> MailResult<()> {
            match self.server.state.lock().unwrap().failures.pop_front() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl MailSession for FakeSession {
        async fn list_mailboxes(&mut self) -> MailResult<Vec<MailboxInfo>> {
            self.next_failure()?;
            let state = self.server.state.lock().unwrap();
            Ok(state
                .mailboxes
                .iter()
                .map(|m| MailboxInfo {
                    path: m.path.clone(),
                    special_use: if m.path == "INBOX" {
                        Some(SpecialUse::Inbox)
                    } else {
                        SpecialUse::from_attribute(&m.path)
                    },
                    selectable: m.selectable,
                })
                .collect())
        }

        async fn sync_mailboxes(
            &mut self,
            requests: &[MailboxSyncRequest],
        ) -> MailResult<Vec<MailboxSyncResult>> {
            self.next_failure()?;

            let delay = {
                let mut state = self.server.state.lock().unwrap();
                state.sync_calls += 1;
                state.sync_delay
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let state = self.server.state.lock().unwrap();
            let mut results = Vec::new();
            for request in requests {
                if state.rejected_mailboxes.contains(&request.path) {
                    continue;
                }
                let Some(mailbox) = state.mailboxes.iter().find(|m| m.path == request.path) else {
                    return Err(MailError::Imap(format!("NO no such mailbox {}", request.path)));
                };

                let new_messages: Vec<RemoteMessage> = mailbox
                    .messages
                    .range(request.since_uid + 1..)
                    .map(|(_, m)| m.clone())
                    .collect();
                let uids_newly_seen = request
                    .local_unread_uids
                    .iter()
                    .copied()
                    .filter(|uid| mailbox.messages.get(uid).is_some_and(|m| m.is_read))
                    .collect();
                let max_uid = mailbox
                    .messages
                    .keys()
                    .next_back()
                    .copied()
                    .unwrap_or(0)
                    .max(request.since_uid);

                results.push(MailboxSyncResult {
                    path: request.path.clone(),
                    new_messages,
                    uids_newly_seen,
                    max_uid,
                });
            }
            Ok(results)
        }

        async fn fetch_bodies(
            &mut self,
            mailbox: &str,
            uids: &[u32],
        ) -> MailResult<HashMap<u32, FetchedBody>> {
            self.next_failure()?;
            let mut state = self.server.state.lock().unwrap();
            state.body_fetches += 1;
            if state.failing_body_mailboxes.contains(mailbox) {
                return Err(MailError::Imap(format!("NO cannot open {}", mailbox)));
            }
            Ok(uids
                .iter()
                .map(|uid| {
                    (
                        *uid,
                        FetchedBody {
                            body_text: Some(format!("Body of {} {}", mailbox, uid)),
                            body_html: None,
                            list_unsubscribe: None,
                        },
                    )
                })
                .collect())
        }

        async fn set_seen(&mut self, mailbox: &str, uids: &[u32], seen: bool) -> MailResult<()> {
            self.next_failure()?;
            let mut state = self.server.state.lock().unwrap();
            state.seen_updates.push((mailbox.to_string(), uids.to_vec(), seen));
            if let Some(target) = state.mailboxes.iter_mut().find(|m| m.path == mailbox) {
                for uid in uids {
                    if let Some(message) = target.messages.get_mut(uid) {
                        message.is_read = seen;
                    }
                }
            }
            Ok(())
        }

        fn is_usable(&self) -> bool {
            !self.logged_out && !self.server.state.lock().unwrap().break_sessions
        }

        async fn logout(&mut self) -> MailResult<()> {
            self.logged_out = true;
            self.server.state.lock().unwrap().logouts += 1;
            Ok(())
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn new_account(email: &str) -> NewAccount {
        NewAccount {
            email: email.to_string(),
            display_name: "Test".to_string(),
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            imap_security: "SSL".to_string(),
            imap_username: None,
            password: Some("secret".to_string()),
            accept_invalid_certs: false,
        }
    }

    struct Harness {
        db: Arc<Database>,
        server: FakeServer,
        orchestrator: SyncOrchestrator,
        account_id: i64,
    }

    fn harness(server: FakeServer) -> Harness {
        let db = Arc::new(Database::in_memory().expect("Failed to create in-memory database"));
        let account_id = db.add_account(&new_account("me@example.com")).unwrap();
        let pools = Arc::new(PoolManager::new(Arc::new(server.clone())));
        let orchestrator = SyncOrchestrator::new(db.clone(), pools, StatusBus::new()).with_prefetch(false);

        Harness {
            db,
            server,
            orchestrator,
            account_id,
        }
    }

    fn test_pool(server: &FakeServer) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            1,
            ImapConfig::default(),
            Arc::new(server.clone()),
            IDLE_TIMEOUT,
        ))
    }

    async fn list(pool: &Arc<ConnectionPool>) -> MailResult<Vec<MailboxInfo>> {
        pool.run(|session| Box::pin(async move { session.list_mailboxes().await }))
            .await
    }

    fn completed(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(report) => report,
            SyncOutcome::AlreadyRunning => panic!("expected a completed sync"),
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: StdMutex<Vec<NotificationSummary>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, summary: &NotificationSummary) {
            self.sent.lock().unwrap().push(summary.clone());
        }
    }

    // ========================================================================
    // Connection Pool
    // ========================================================================

    #[tokio::test]
    async fn test_pool_connects_lazily_and_reuses_session() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        let pool = test_pool(&server);

        assert_eq!(pool.state(), PoolState::Disconnected);
        assert_eq!(server.connects(), 0);

        list(&pool).await.unwrap();
        list(&pool).await.unwrap();

        assert_eq!(server.connects(), 1);
        assert_eq!(pool.state(), PoolState::Connected);
    }

    #[tokio::test]
    async fn test_pool_retries_transient_failure_once() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        let pool = test_pool(&server);

        server.fail_next(MailError::ConnectionClosed("server hung up".into()));

        let mailboxes = list(&pool).await.expect("retry should succeed");
        assert_eq!(mailboxes.len(), 1);
        assert_eq!(server.connects(), 2);
    }

    #[tokio::test]
    async fn test_pool_surfaces_second_failure() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        let pool = test_pool(&server);

        server.fail_next(MailError::Timeout("first".into()));
        server.fail_next(MailError::Timeout("second".into()));

        match list(&pool).await {
            Err(MailError::Timeout(what)) => assert_eq!(what, "second"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(server.connects(), 2);
        assert_eq!(pool.state(), PoolState::Disconnected);

        // Next call starts over with a fresh connection
        list(&pool).await.unwrap();
        assert_eq!(server.connects(), 3);
    }

    #[tokio::test]
    async fn test_pool_does_not_retry_permanent_errors() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        let pool = test_pool(&server);

        server.fail_next(MailError::Imap("NO permission denied".into()));

        assert!(matches!(list(&pool).await, Err(MailError::Imap(_))));
        assert_eq!(server.connects(), 1);

        // Session survives a protocol-level rejection
        list(&pool).await.unwrap();
        assert_eq!(server.connects(), 1);
    }

    #[tokio::test]
    async fn test_pool_authentication_failure_not_retried() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        let pool = test_pool(&server);

        server.fail_next_connect(MailError::Authentication("bad password".into()));

        assert!(matches!(list(&pool).await, Err(MailError::Authentication(_))));
        assert_eq!(server.connects(), 1);
        assert_eq!(pool.state(), PoolState::Disconnected);
    }

    #[tokio::test]
    async fn test_pool_replaces_unusable_session() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        let pool = test_pool(&server);

        list(&pool).await.unwrap();
        server.break_sessions();

        list(&pool).await.expect("broken session should be replaced silently");
        assert_eq!(server.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_idle_timeout_closes_session() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        let pool = test_pool(&server);

        list(&pool).await.unwrap();
        assert_eq!(pool.state(), PoolState::Connected);

        tokio::time::sleep(IDLE_TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(pool.state(), PoolState::Disconnected);
        assert_eq!(server.logouts(), 1);

        list(&pool).await.unwrap();
        assert_eq!(server.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_activity_resets_idle_timer() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        let pool = test_pool(&server);

        list(&pool).await.unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;
        list(&pool).await.unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;

        // 80s since connect but only 40s idle
        assert_eq!(pool.state(), PoolState::Connected);
        assert_eq!(server.logouts(), 0);
        assert_eq!(server.connects(), 1);
    }

    #[tokio::test]
    async fn test_pool_manager_registry() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        let db = Database::in_memory().unwrap();
        let id = db.add_account(&new_account("a@example.com")).unwrap();
        let account = db.get_account(id).unwrap();

        let manager = PoolManager::new(Arc::new(server.clone()));
        assert!(manager.is_empty());

        let first = manager.get(&account);
        let second = manager.get(&account);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);

        list(&first).await.unwrap();
        manager.close_all().await;

        assert!(manager.is_empty());
        assert_eq!(server.logouts(), 1);
        assert_eq!(first.state(), PoolState::Disconnected);
    }

    #[tokio::test]
    async fn test_pool_manager_applies_changed_settings() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        let db = Database::in_memory().unwrap();
        let id = db.add_account(&new_account("a@example.com")).unwrap();
        let manager = PoolManager::new(Arc::new(server.clone()));

        let pool = manager.get(&db.get_account(id).unwrap());
        list(&pool).await.unwrap();

        // Unchanged settings keep the session
        let same = manager.get(&db.get_account(id).unwrap());
        assert!(!same.update_config(&db.get_account(id).unwrap().imap));
        list(&same).await.unwrap();
        assert_eq!(server.connects(), 1);

        let mut changed = new_account("a@example.com");
        changed.password = Some("new-secret".to_string());
        db.update_account(id, &changed).unwrap();

        let refreshed = manager.get(&db.get_account(id).unwrap());
        assert!(Arc::ptr_eq(&pool, &refreshed));
        list(&refreshed).await.unwrap();

        assert_eq!(server.connects(), 2);
        assert_eq!(server.logouts(), 1);
        assert_eq!(server.connect_passwords(), vec!["secret", "new-secret"]);
    }

    // ========================================================================
    // Orchestrator
    // ========================================================================

    #[tokio::test]
    async fn test_sync_inbox_and_sent() {
        let server = FakeServer::with_mailboxes(&["INBOX", "Sent"]);
        server.add_messages("INBOX", [10, 11, 12]);
        let h = harness(server);
        let mut events = h.orchestrator.status().subscribe();

        let report = completed(h.orchestrator.sync_account(h.account_id).await.unwrap());

        assert_eq!(report.new_messages, 3);
        assert_eq!(report.mailboxes, 2);
        assert_eq!(h.db.get_mailbox_cursor(h.account_id, "INBOX").unwrap(), 12);
        assert_eq!(h.db.get_mailbox_cursor(h.account_id, "Sent").unwrap(), 0);
        assert_eq!(h.db.count_messages(h.account_id).unwrap(), 3);

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }

        let progress: Vec<_> = received
            .iter()
            .filter_map(|e| e.progress.as_ref())
            .map(|p| (p.current, p.total, p.mailbox.as_str()))
            .collect();
        assert_eq!(progress, vec![(1, 2, "INBOX"), (2, 2, "Sent")]);

        let done: Vec<_> = received.iter().filter(|e| e.status == SyncPhase::Done).collect();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].message, "3 neue E-Mail(s)");
        assert_eq!(received.last().map(|e| e.status), Some(SyncPhase::Done));
    }

    #[tokio::test]
    async fn test_sync_skips_noselect_mailboxes() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_noselect("[Gmail]");
        server.add_messages("INBOX", [1]);
        let h = harness(server);

        let report = completed(h.orchestrator.sync_account(h.account_id).await.unwrap());

        assert_eq!(report.mailboxes, 1);
        assert_eq!(h.db.get_cursors(h.account_id).unwrap(), vec![("INBOX".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_incremental_sync_imports_only_new_messages() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", 1..=5);
        let h = harness(server);

        completed(h.orchestrator.sync_account(h.account_id).await.unwrap());
        let cursor_before = h.db.get_mailbox_cursor(h.account_id, "INBOX").unwrap();

        let report = completed(h.orchestrator.sync_account(h.account_id).await.unwrap());
        assert_eq!(report.new_messages, 0);
        assert!(h.db.get_mailbox_cursor(h.account_id, "INBOX").unwrap() >= cursor_before);

        h.server.add_messages("INBOX", [6, 7]);
        let report = completed(h.orchestrator.sync_account(h.account_id).await.unwrap());
        assert_eq!(report.new_messages, 2);
        assert_eq!(h.db.get_mailbox_cursor(h.account_id, "INBOX").unwrap(), 7);
        assert_eq!(h.db.count_messages(h.account_id).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_full_resync_does_not_duplicate() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", 1..=50);
        let h = harness(server);

        completed(h.orchestrator.sync_account(h.account_id).await.unwrap());
        assert_eq!(h.db.count_messages(h.account_id).unwrap(), 50);

        let report = completed(h.orchestrator.full_resync(h.account_id).await.unwrap());

        assert_eq!(report.new_messages, 0);
        assert_eq!(h.db.count_messages(h.account_id).unwrap(), 50);
        assert_eq!(h.db.get_mailbox_cursor(h.account_id, "INBOX").unwrap(), 50);
    }

    #[tokio::test]
    async fn test_remote_seen_flag_marks_local_read() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [1, 2, 3]);
        let h = harness(server);

        completed(h.orchestrator.sync_account(h.account_id).await.unwrap());
        assert_eq!(h.db.get_unread_uids(h.account_id, "INBOX").unwrap().len(), 3);

        h.server.set_remote_read("INBOX", 2, true);
        let report = completed(h.orchestrator.sync_account(h.account_id).await.unwrap());

        assert_eq!(report.marked_read, 1);
        let unread: Vec<u32> = h
            .db
            .get_unread_uids(h.account_id, "INBOX")
            .unwrap()
            .iter()
            .map(|u| u.uid)
            .collect();
        assert_eq!(unread, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_concurrent_sync_runs_once() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [1, 2]);
        server.set_sync_delay(Duration::from_millis(50));
        let h = harness(server);

        let (first, second) = tokio::join!(
            h.orchestrator.sync_account(h.account_id),
            h.orchestrator.sync_account(h.account_id)
        );

        assert!(matches!(first.unwrap(), SyncOutcome::Completed(_)));
        assert_eq!(second.unwrap(), SyncOutcome::AlreadyRunning);
        assert_eq!(h.server.sync_calls(), 1);
        assert!(!h.orchestrator.is_syncing(h.account_id));
    }

    #[tokio::test]
    async fn test_failed_sync_reports_error_and_releases_guard() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [1]);
        server.fail_next_connect(MailError::Authentication("invalid credentials".into()));
        let h = harness(server);
        let mut events = h.orchestrator.status().subscribe();

        let result = h.orchestrator.sync_account(h.account_id).await;
        assert!(matches!(result, Err(SyncError::Mail(MailError::Authentication(_)))));

        let event = events.try_recv().unwrap();
        assert_eq!(event.status, SyncPhase::Error);
        assert!(event.message.contains("invalid credentials"));

        // Account is not locked out
        let report = completed(h.orchestrator.sync_account(h.account_id).await.unwrap());
        assert_eq!(report.new_messages, 1);
    }

    #[tokio::test]
    async fn test_sync_retries_after_dropped_connection() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [1, 2]);
        let h = harness(server);

        // The first command of the pass loses the connection
        h.server.fail_next(MailError::ConnectionClosed("reset".into()));

        let report = completed(h.orchestrator.sync_account(h.account_id).await.unwrap());
        assert_eq!(report.new_messages, 2);
        assert_eq!(h.server.connects(), 2);
    }

    #[tokio::test]
    async fn test_sync_retries_failed_connect() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [1, 2]);
        server.fail_next_connect(MailError::Connection("connection refused".into()));
        let h = harness(server);

        let report = completed(h.orchestrator.sync_account(h.account_id).await.unwrap());

        assert_eq!(report.new_messages, 2);
        assert_eq!(h.server.connects(), 2);
        assert_eq!(h.db.get_mailbox_cursor(h.account_id, "INBOX").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sync_uses_updated_password() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [1]);
        let h = harness(server);

        completed(h.orchestrator.sync_account(h.account_id).await.unwrap());

        let mut changed = new_account("me@example.com");
        changed.password = Some("changed".to_string());
        h.db.update_account(h.account_id, &changed).unwrap();

        completed(h.orchestrator.sync_account(h.account_id).await.unwrap());

        assert_eq!(h.server.connects(), 2);
        assert_eq!(h.server.connect_passwords().last().map(String::as_str), Some("changed"));
    }

    #[tokio::test]
    async fn test_sync_skips_rejected_mailbox() {
        let server = FakeServer::with_mailboxes(&["INBOX", "Archive"]);
        server.add_messages("INBOX", [1, 2]);
        server.add_messages("Archive", [5]);
        server.reject_select("Archive");
        let h = harness(server);

        let report = completed(h.orchestrator.sync_account(h.account_id).await.unwrap());

        assert_eq!(report.new_messages, 2);
        assert_eq!(h.db.get_mailbox_cursor(h.account_id, "INBOX").unwrap(), 2);
        assert_eq!(h.db.get_mailbox_cursor(h.account_id, "Archive").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let h = harness(FakeServer::with_mailboxes(&["INBOX"]));
        let result = h.orchestrator.sync_account(h.account_id + 100).await;
        assert!(matches!(result, Err(SyncError::Database(_))));
    }

    #[tokio::test]
    async fn test_single_notification_per_pass() {
        let server = FakeServer::with_mailboxes(&["INBOX", "Sent"]);
        server.add_messages("INBOX", 1..=3);

        let mut newsletter = remote("INBOX", 4);
        newsletter.list_unsubscribe = Some("<https://example.com/unsub>".into());
        server.add_message("INBOX", newsletter);

        let mut already_read = remote("INBOX", 5);
        already_read.is_read = true;
        server.add_message("INBOX", already_read);

        server.add_messages("Sent", [1]);

        let notifier = Arc::new(RecordingNotifier::default());
        let mut h = harness(server);
        h.orchestrator = h.orchestrator.clone().with_notifier(notifier.clone());

        let report = completed(h.orchestrator.sync_account(h.account_id).await.unwrap());
        assert_eq!(report.new_messages, 6);
        assert_eq!(report.important, 3);

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].count, 3);
    }

    #[tokio::test]
    async fn test_no_notification_without_new_mail() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut h = harness(FakeServer::with_mailboxes(&["INBOX"]));
        h.orchestrator = h.orchestrator.clone().with_notifier(notifier.clone());

        completed(h.orchestrator.sync_account(h.account_id).await.unwrap());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_all_accounts() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [1, 2]);
        let h = harness(server);
        let second = h.db.add_account(&new_account("other@example.com")).unwrap();

        let results = h.orchestrator.sync_all_accounts().await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| matches!(r, Ok(SyncOutcome::Completed(_)))));
        assert_eq!(h.db.count_messages(h.account_id).unwrap(), 2);
        assert_eq!(h.db.count_messages(second).unwrap(), 2);
        assert_eq!(h.orchestrator.pools().len(), 2);
    }

    #[tokio::test]
    async fn test_set_read_state_propagates_to_server() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [7]);
        let h = harness(server);

        completed(h.orchestrator.sync_account(h.account_id).await.unwrap());
        let message_id = h.db.get_unread_uids(h.account_id, "INBOX").unwrap()[0].id;

        h.orchestrator.set_read_state(message_id, true).await.unwrap();

        assert!(h.db.get_message(message_id).unwrap().is_read);
        assert_eq!(h.server.seen_updates(), vec![("INBOX".to_string(), vec![7], true)]);
    }

    #[tokio::test]
    async fn test_remove_account() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [1]);
        let h = harness(server);

        completed(h.orchestrator.sync_account(h.account_id).await.unwrap());
        assert!(h.orchestrator.pools().contains(h.account_id));

        h.orchestrator.remove_account(h.account_id).await.unwrap();

        assert!(!h.orchestrator.pools().contains(h.account_id));
        assert_eq!(h.server.logouts(), 1);
        assert_eq!(h.db.count_messages(h.account_id).unwrap(), 0);
        assert!(h.db.list_accounts().unwrap().is_empty());
    }

    // ========================================================================
    // Prefetch
    // ========================================================================

    #[tokio::test]
    async fn test_prefetch_isolates_failing_mailbox() {
        let server = FakeServer::with_mailboxes(&["INBOX", "Archive"]);
        server.add_messages("INBOX", [1, 2]);
        server.add_messages("Archive", [1, 2]);
        server.fail_bodies_for("Archive");
        let h = harness(server);

        completed(h.orchestrator.sync_account(h.account_id).await.unwrap());

        let stored = h
            .orchestrator
            .prefetcher()
            .prefetch_bodies_for_account(h.account_id)
            .await;
        assert_eq!(stored, 2);

        let missing = h.db.messages_missing_body(h.account_id, PREFETCH_LIMIT).unwrap();
        assert_eq!(missing.len(), 2);
        assert!(missing.iter().all(|m| m.mailbox == "Archive"));
    }

    #[tokio::test]
    async fn test_prefetch_is_bounded() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", 1..=30);
        let h = harness(server);

        completed(h.orchestrator.sync_account(h.account_id).await.unwrap());

        let stored = h
            .orchestrator
            .prefetcher()
            .prefetch_bodies_for_account(h.account_id)
            .await;
        assert_eq!(stored, PREFETCH_LIMIT);

        let missing = h.db.messages_missing_body(h.account_id, 100).unwrap();
        assert_eq!(missing.len(), 10);
        // The newest ones were fetched first
        assert!(missing.iter().all(|m| m.uid <= 10));
    }

    #[tokio::test]
    async fn test_sync_spawns_prefetch() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [1, 2, 3]);
        let mut h = harness(server);
        h.orchestrator = h.orchestrator.clone().with_prefetch(true);

        completed(h.orchestrator.sync_account(h.account_id).await.unwrap());

        // Detached task; give it a moment
        for _ in 0..50 {
            if h.db.messages_missing_body(h.account_id, 10).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.db.messages_missing_body(h.account_id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_prefetch_does_not_fail_sync() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [1, 2]);
        server.fail_bodies_for("INBOX");
        let mut h = harness(server);
        h.orchestrator = h.orchestrator.clone().with_prefetch(true);
        let mut events = h.orchestrator.status().subscribe();

        let outcome = h.orchestrator.sync_account(h.account_id).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(_)));

        // Detached task; wait until it has hit the server
        for _ in 0..50 {
            if h.server.body_fetches() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.server.body_fetches() > 0);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event.status);
        }
        assert_eq!(received.iter().filter(|s| **s == SyncPhase::Done).count(), 1);
        assert!(!received.contains(&SyncPhase::Error));
        assert_eq!(h.db.messages_missing_body(h.account_id, 10).unwrap().len(), 2);
    }

    // ========================================================================
    // Scheduler
    // ========================================================================

    #[tokio::test]
    async fn test_notify_ready_triggers_one_sync() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [1]);
        let h = harness(server);
        let orchestrator = Arc::new(h.orchestrator.clone());
        let mut events = orchestrator.status().subscribe();
        let scheduler = BackgroundScheduler::new(h.db.clone(), orchestrator);

        assert!(scheduler.notify_ready());
        assert!(!scheduler.notify_ready());

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.status == SyncPhase::Done {
                    return event;
                }
            }
        })
        .await
        .expect("initial sync did not finish");

        assert_eq!(event.message, "1 neue E-Mail(s)");
        assert_eq!(h.server.sync_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_interval_tick() {
        let server = FakeServer::with_mailboxes(&["INBOX"]);
        server.add_messages("INBOX", [1]);
        let h = harness(server);
        let scheduler = BackgroundScheduler::new(h.db.clone(), Arc::new(h.orchestrator.clone()));

        scheduler.set_interval(1).await.unwrap();

        // Nothing runs before the first period elapses
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.server.sync_calls(), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(h.server.sync_calls(), 1);
        assert!(scheduler.get_config().await.last_run.is_some());

        scheduler.set_interval(0).await.unwrap();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.server.sync_calls(), 1);
    }
}
