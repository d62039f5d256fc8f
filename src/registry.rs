use chrono::Utc;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    fs,
    io::ErrorKind,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    classifier::FailureKind,
    credentials::CredentialStore,
    session::{Resolution, Session, SessionArtifacts, SessionSignal, SessionState, SessionStatus},
};

const MAX_LOG_SESSIONS: usize = 64;

#[derive(Default)]
struct LogRings {
    lines: HashMap<String, Vec<String>>,
    order: VecDeque<String>,
}

/// Active sessions keyed by id, plus a bounded diagnostic log for the most
/// recent ids.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    logs: Mutex<LogRings>,
    credentials: Arc<dyn CredentialStore>,
    max_log_lines: usize,
}

impl SessionRegistry {
    pub fn new(credentials: Arc<dyn CredentialStore>, max_log_lines: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            logs: Mutex::new(LogRings::default()),
            credentials,
            max_log_lines: max_log_lines.max(1),
        }
    }

    pub fn append_log_with_level(&self, id: &str, level: &str, message: impl Into<String>) {
        let message = message.into();
        match level {
            "ERROR" => log::error!("[rdp {id}] {message}"),
            "WARN" => log::warn!("[rdp {id}] {message}"),
            "INFO" => log::info!("[rdp {id}] {message}"),
            _ => log::debug!("[rdp {id}] {level} {message}"),
        }
        let line = format!("[{}] [{}] {}", Utc::now().timestamp_millis(), level, message);
        let mut logs = self.logs.lock();
        if !logs.lines.contains_key(id) {
            logs.order.push_back(id.to_string());
            while logs.order.len() > MAX_LOG_SESSIONS {
                if let Some(oldest) = logs.order.pop_front() {
                    logs.lines.remove(&oldest);
                }
            }
        }
        let entry = logs.lines.entry(id.to_string()).or_default();
        entry.push(line);
        if entry.len() > self.max_log_lines {
            let overflow = entry.len() - self.max_log_lines;
            entry.drain(0..overflow);
        }
    }

    pub fn append_log(&self, id: &str, message: impl Into<String>) {
        self.append_log_with_level(id, "INFO", message);
    }

    pub fn logs(&self, id: &str, limit: usize) -> Vec<String> {
        let logs = self.logs.lock();
        let mut lines = logs.lines.get(id).cloned().unwrap_or_default();
        if limit > 0 && lines.len() > limit {
            let keep_from = lines.len() - limit;
            lines.drain(0..keep_from);
        }
        lines
    }

    pub fn clear_logs(&self, id: &str) {
        let mut logs = self.logs.lock();
        if logs.lines.remove(id).is_some() {
            logs.order.retain(|known| known != id);
        }
    }

    pub fn add(&self, session: Session) {
        let id = session.id().to_string();
        let incoming = session.artifacts().clone();
        let replaced = self.sessions.lock().insert(id.clone(), session);
        if let Some(mut previous) = replaced {
            if !previous.begin_close() {
                return;
            }
            previous.abort_listener();
            let terminated = match previous.process.as_mut() {
                Some(process) => process.terminate(),
                None => Ok(()),
            };
            // Same id means the same profile path; keep the one just written.
            let stale = SessionArtifacts {
                profile_path: previous
                    .artifacts()
                    .profile_path
                    .clone()
                    .filter(|path| incoming.profile_path.as_ref() != Some(path)),
                credential_target: previous
                    .artifacts()
                    .credential_target
                    .clone()
                    .filter(|target| incoming.credential_target.as_ref() != Some(target)),
            };
            self.release_artifacts(&id, &stale);
            previous.emit(SessionSignal::Close);
            self.append_log_with_level(&id, "WARN", "Replaced a session that was still registered");
            if let Err(err) = terminated {
                self.append_log_with_level(&id, "WARN", format!("Terminate failed: {err:#}"));
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<SessionStatus> {
        self.sessions.lock().get(id).map(Session::status)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> =
            self.sessions.lock().values().map(Session::status).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.lock().remove(id)
    }

    /// Applies a resolution if `instance` is still the registered session for
    /// `id` and it is still pending. Stale or late triggers are no-ops.
    pub fn resolve(&self, id: &str, instance: Uuid, resolution: Resolution) -> bool {
        let detail = match &resolution {
            Resolution::Connected => "Connected".to_string(),
            Resolution::Failed { message, .. } => format!("Failed: {message}"),
        };
        let resolved = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(id) {
                Some(session) if session.instance() == instance => session.resolve(resolution),
                _ => false,
            }
        };
        if resolved {
            self.append_log(id, detail);
        }
        resolved
    }

    pub fn attach_timers(&self, id: &str, instance: Uuid, timers: Vec<JoinHandle<()>>) {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(id) {
            Some(session) if session.instance() == instance => session.attach_timers(timers),
            _ => timers.into_iter().for_each(|t| t.abort()),
        }
    }

    pub fn attach_listener(&self, id: &str, instance: Uuid, listener: JoinHandle<()>) {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(id) {
            Some(session) if session.instance() == instance => session.attach_listener(listener),
            _ => listener.abort(),
        }
    }

    /// Idempotent: unknown ids are ignored.
    pub fn disconnect(&self, id: &str) {
        let (instance, artifacts, signals, terminated) = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(id) else {
                log::debug!("disconnect for unknown rdp session {id}");
                return;
            };
            if !session.begin_close() {
                return;
            }
            session.abort_listener();
            let terminated = match session.process.as_mut() {
                Some(process) => process.terminate(),
                None => Ok(()),
            };
            (
                session.instance(),
                session.artifacts().clone(),
                session.signals(),
                terminated,
            )
        };

        // Until the entry is removed below, a panic here leaves it for
        // `close_all` to find and close.
        self.release_artifacts(id, &artifacts);
        {
            let mut sessions = self.sessions.lock();
            if sessions.get(id).map(Session::instance) == Some(instance) {
                sessions.remove(id);
            }
        }
        let _ = signals.send(SessionSignal::Close);

        if let Err(err) = terminated {
            self.append_log_with_level(id, "WARN", format!("Terminate failed: {err:#}"));
        }
        self.append_log(id, "Disconnected");
    }

    /// Process exit observed by the listener. A non-zero (or signal) exit
    /// before resolution fails the session; any exit ends it.
    pub fn handle_exit(&self, id: &str, instance: Uuid, code: Option<i32>) {
        let removed = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(id) else {
                return;
            };
            if session.instance() != instance || session.state() == SessionState::Closed {
                return;
            }
            if session.state() == SessionState::Pending && code != Some(0) {
                let detail = match code {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                };
                session.resolve(Resolution::failed(FailureKind::ProcessExitFailure, detail));
            }
            session.begin_close();
            sessions.remove(id)
        };

        let Some(session) = removed else {
            return;
        };
        let signals = session.signals();
        let artifacts = session.artifacts().clone();
        drop(session);
        let _ = catch_unwind(AssertUnwindSafe(|| self.release_artifacts(id, &artifacts)));
        let _ = signals.send(SessionSignal::Close);
        self.append_log(id, format!("Client exited with code {code:?}"));
    }

    /// Disconnects every session. Used at shutdown, so no single session
    /// (or the logging around it) may stop the drain.
    pub fn close_all(&self) {
        let targets: Vec<(String, Uuid)> = catch_unwind(AssertUnwindSafe(|| {
            let sessions = self.sessions.lock();
            let mut targets: Vec<(String, Uuid)> = sessions
                .iter()
                .map(|(id, session)| (id.clone(), session.instance()))
                .collect();
            targets.sort();
            targets
        }))
        .unwrap_or_default();

        for (id, instance) in targets {
            if catch_unwind(AssertUnwindSafe(|| self.disconnect(&id))).is_ok() {
                continue;
            }
            // The entry is only gone once `Close` has been sent.
            let _ = catch_unwind(AssertUnwindSafe(|| {
                let mut sessions = self.sessions.lock();
                if sessions.get(&id).map(Session::instance) != Some(instance) {
                    return;
                }
                let leftover = sessions.remove(&id);
                drop(sessions);
                if let Some(mut session) = leftover {
                    session.begin_close();
                    session.abort_listener();
                    session.emit(SessionSignal::Close);
                }
            }));
        }
    }

    pub fn release_artifacts(&self, id: &str, artifacts: &SessionArtifacts) {
        if let Some(target) = artifacts.credential_target.as_deref() {
            if let Err(err) = self.credentials.remove(target) {
                self.append_log_with_level(
                    id,
                    "WARN",
                    format!("Failed to remove stored credential {target}: {err:#}"),
                );
            }
        }
        if let Some(path) = artifacts.profile_path.as_deref() {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => self.append_log_with_level(
                    id,
                    "WARN",
                    format!("Failed to delete profile {}: {err}", path.display()),
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        profile::SessionConfig,
        testing::{with_panicking_logger, FakeProcess, RecordingCredentialStore},
    };
    use tokio::sync::mpsc;

    fn config() -> SessionConfig {
        SessionConfig {
            host: "rdp.example.com".to_string(),
            port: 3389,
            username: "carol".to_string(),
            password: "pw".to_string(),
            domain: None,
            width: 1024,
            height: 768,
            fullscreen: false,
        }
    }

    fn registry() -> (SessionRegistry, Arc<RecordingCredentialStore>) {
        let store = Arc::new(RecordingCredentialStore::default());
        (SessionRegistry::new(store.clone(), 5), store)
    }

    fn session(
        id: &str,
        process: FakeProcess,
        artifacts: SessionArtifacts,
    ) -> (Session, mpsc::UnboundedReceiver<SessionSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Session::new(id.to_string(), config(), Some(Box::new(process)), artifacts, tx),
            rx,
        )
    }

    #[test]
    fn add_get_count_remove() {
        let (registry, _) = registry();
        let (s, _rx) = session("a", FakeProcess::new(1), SessionArtifacts::default());
        registry.add(s);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("a").map(|s| s.state), Some(SessionState::Pending));
        assert!(registry.remove("a").is_some());
        assert_eq!(registry.count(), 0);
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn disconnect_unknown_id_is_noop() {
        let (registry, _) = registry();
        registry.disconnect("missing");
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn disconnect_terminates_cleans_up_and_closes_once() {
        let (registry, store) = registry();
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = dir.path().join("p.rdp");
        fs::write(&profile, "full address:s:x\r\n").expect("write");

        let process = FakeProcess::new(7);
        let terminated = process.terminate_calls();
        let (s, mut rx) = session(
            "a",
            process,
            SessionArtifacts {
                profile_path: Some(profile.clone()),
                credential_target: Some("TERMSRV/rdp.example.com".to_string()),
            },
        );
        registry.add(s);

        registry.disconnect("a");
        registry.disconnect("a");

        assert_eq!(terminated.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!profile.exists());
        assert_eq!(store.removed(), vec!["TERMSRV/rdp.example.com".to_string()]);
        assert_eq!(registry.count(), 0);
        assert_eq!(rx.try_recv().expect("close"), SessionSignal::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stale_instance_cannot_resolve_replacement() {
        let (registry, _) = registry();
        let (first, _rx1) = session("a", FakeProcess::new(1), SessionArtifacts::default());
        let stale = first.instance();
        registry.add(first);
        registry.disconnect("a");

        let (second, mut rx2) = session("a", FakeProcess::new(2), SessionArtifacts::default());
        let current = second.instance();
        registry.add(second);

        assert!(!registry.resolve("a", stale, Resolution::Connected));
        assert!(rx2.try_recv().is_err());
        assert!(registry.resolve("a", current, Resolution::Connected));
        assert_eq!(rx2.try_recv().expect("connect"), SessionSignal::Connect);
    }

    #[test]
    fn exit_before_resolution_with_zero_code_only_closes() {
        let (registry, _) = registry();
        let (s, mut rx) = session("a", FakeProcess::new(1), SessionArtifacts::default());
        let instance = s.instance();
        registry.add(s);

        registry.handle_exit("a", instance, Some(0));
        assert_eq!(rx.try_recv().expect("close"), SessionSignal::Close);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn exit_after_disconnect_is_ignored() {
        let (registry, _) = registry();
        let (s, mut rx) = session("a", FakeProcess::new(1), SessionArtifacts::default());
        let instance = s.instance();
        registry.add(s);
        registry.disconnect("a");
        registry.handle_exit("a", instance, Some(1));

        assert_eq!(rx.try_recv().expect("close"), SessionSignal::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_all_survives_failing_and_panicking_termination() {
        let (registry, _) = registry();
        let (a, mut rx_a) = session("a", FakeProcess::new(1).failing(), SessionArtifacts::default());
        let (b, mut rx_b) = session("b", FakeProcess::new(2).panicking(), SessionArtifacts::default());
        let (c, mut rx_c) = session("c", FakeProcess::new(3), SessionArtifacts::default());
        registry.add(a);
        registry.add(b);
        registry.add(c);

        registry.close_all();

        assert_eq!(registry.count(), 0);
        assert_eq!(rx_a.try_recv().expect("close a"), SessionSignal::Close);
        assert_eq!(rx_b.try_recv().expect("close b"), SessionSignal::Close);
        assert_eq!(rx_c.try_recv().expect("close c"), SessionSignal::Close);
    }

    #[test]
    fn credential_removal_failure_is_swallowed() {
        let store = Arc::new(RecordingCredentialStore::failing());
        let registry = SessionRegistry::new(store, 10);
        let (s, mut rx) = session(
            "a",
            FakeProcess::new(1),
            SessionArtifacts {
                profile_path: None,
                credential_target: Some("TERMSRV/x".to_string()),
            },
        );
        registry.add(s);
        registry.disconnect("a");
        assert_eq!(rx.try_recv().expect("close"), SessionSignal::Close);
        assert!(registry
            .logs("a", 0)
            .iter()
            .any(|line| line.contains("Failed to remove stored credential")));
    }

    #[test]
    fn log_ring_is_bounded_and_outlives_session() {
        let (registry, _) = registry();
        for i in 0..8 {
            registry.append_log("a", format!("line {i}"));
        }
        let lines = registry.logs("a", 0);
        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("line 3"));
        assert_eq!(registry.logs("a", 2).len(), 2);
        registry.clear_logs("a");
        assert!(registry.logs("a", 0).is_empty());
    }

    #[test]
    fn log_rings_keep_only_recent_ids() {
        let (registry, _) = registry();
        for i in 0..MAX_LOG_SESSIONS + 6 {
            registry.append_log(&format!("s{i}"), "started");
        }
        assert!(registry.logs("s0", 0).is_empty());
        assert!(registry.logs("s5", 0).is_empty());
        assert_eq!(registry.logs("s6", 0).len(), 1);
        assert_eq!(registry.logs(&format!("s{}", MAX_LOG_SESSIONS + 5), 0).len(), 1);

        registry.clear_logs("s6");
        registry.append_log("fresh", "started");
        assert_eq!(registry.logs("s7", 0).len(), 1);
    }

    #[test]
    fn close_all_sends_close_when_logging_panics() {
        let (registry, store) = registry();
        let (a, mut rx_a) = session("a", FakeProcess::new(1).failing(), SessionArtifacts::default());
        let (b, mut rx_b) = session("b", FakeProcess::new(2).panicking(), SessionArtifacts::default());
        let (c, mut rx_c) = session(
            "c",
            FakeProcess::new(3),
            SessionArtifacts {
                profile_path: None,
                credential_target: Some("TERMSRV/c".to_string()),
            },
        );
        registry.add(a);
        registry.add(b);
        registry.add(c);

        with_panicking_logger(|| registry.close_all());

        assert_eq!(registry.count(), 0);
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            assert_eq!(rx.try_recv().expect("close"), SessionSignal::Close);
            assert!(rx.try_recv().is_err());
        }
        assert_eq!(store.removed(), vec!["TERMSRV/c".to_string()]);
    }

    #[test]
    fn replacing_a_session_closes_the_old_one() {
        let (registry, _) = registry();
        let old = FakeProcess::new(1);
        let terminated = old.terminate_calls();
        let (first, mut rx1) = session("a", old, SessionArtifacts::default());
        let (second, mut rx2) = session("a", FakeProcess::new(2), SessionArtifacts::default());
        registry.add(first);
        registry.add(second);

        assert_eq!(terminated.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(rx1.try_recv().expect("close"), SessionSignal::Close);
        assert!(rx2.try_recv().is_err());
        assert_eq!(registry.count(), 1);
    }
}
