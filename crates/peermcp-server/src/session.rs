//! Per-session state and the session store.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use peermcp_core::logging::{debug, targets, warn};
use peermcp_core::{McpError, McpResult};
use peermcp_protocol::{ClientCapabilities, ClientInfo};
use peermcp_transport::{PendingRequests, SessionRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Capacity of the per-session outbound send queue.
const SEND_QUEUE_CAPACITY: usize = 64;

/// Heartbeat tick interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Attempts before a failing session is reaped.
const HEARTBEAT_ATTEMPTS: u32 = 3;

/// State for one connected peer.
///
/// The handshake flags are monotonic: once `received_initialize`, `ready`, or
/// `closed` is set it stays set, and `ready` implies `received_initialize`.
pub struct SessionState {
    created_at: Instant,
    last_active_at: parking_lot::Mutex<Instant>,
    send_tx: parking_lot::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    send_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    next_request_id: AtomicI64,
    pending: PendingRequests,
    subscribed_resources: DashMap<String, ()>,
    client_info: parking_lot::RwLock<Option<ClientInfo>>,
    client_capabilities: parking_lot::RwLock<Option<ClientCapabilities>>,
    received_initialize: AtomicBool,
    ready: AtomicBool,
    closed: AtomicBool,
}

impl SessionState {
    fn new() -> Self {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        Self {
            created_at: Instant::now(),
            last_active_at: parking_lot::Mutex::new(Instant::now()),
            send_tx: parking_lot::Mutex::new(Some(send_tx)),
            send_rx: tokio::sync::Mutex::new(send_rx),
            next_request_id: AtomicI64::new(0),
            pending: PendingRequests::new(),
            subscribed_resources: DashMap::new(),
            client_info: parking_lot::RwLock::new(None),
            client_capabilities: parking_lot::RwLock::new(None),
            received_initialize: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// When this session was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Records handshake data from the initialize request.
    pub fn set_client_info(&self, info: ClientInfo, capabilities: ClientCapabilities) {
        *self.client_info.write() = Some(info);
        *self.client_capabilities.write() = Some(capabilities);
    }

    /// Client identity, once initialize was received.
    #[must_use]
    pub fn client_info(&self) -> Option<ClientInfo> {
        self.client_info.read().clone()
    }

    /// Client capabilities, once initialize was received.
    #[must_use]
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.client_capabilities.read().clone()
    }

    /// Marks the initialize request as received.
    pub fn mark_received_initialize(&self) {
        self.received_initialize.store(true, Ordering::Release);
    }

    /// Whether initialize was received.
    #[must_use]
    pub fn received_initialize(&self) -> bool {
        self.received_initialize.load(Ordering::Acquire)
    }

    /// Marks the handshake complete.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Whether the handshake completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Whether the session is closed. Terminal.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Allocates the next outbound request id, unique for the session's life.
    #[must_use]
    pub fn next_request_id(&self) -> i64 {
        self.next_request_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The session's pending-response map for outbound requests.
    #[must_use]
    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Subscribes the peer to a resource URI.
    pub fn subscribe(&self, uri: impl Into<String>) {
        self.subscribed_resources.insert(uri.into(), ());
    }

    /// Removes a resource subscription.
    pub fn unsubscribe(&self, uri: &str) {
        self.subscribed_resources.remove(uri);
    }

    /// Whether the peer subscribed to the URI.
    #[must_use]
    pub fn is_subscribed(&self, uri: &str) -> bool {
        self.subscribed_resources.contains_key(uri)
    }

    /// Refreshes the activity timestamp.
    pub fn touch(&self) {
        *self.last_active_at.lock() = Instant::now();
    }

    /// Time since the last activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_active_at.lock().elapsed()
    }

    /// Appends a message to the send queue, waiting for space. Fails once the
    /// session is closed.
    pub async fn send_message(&self, message: Vec<u8>) -> McpResult<()> {
        if self.is_closed() {
            return Err(McpError::session_closed());
        }
        let sender = self
            .send_tx
            .lock()
            .clone()
            .ok_or_else(McpError::session_closed)?;
        sender
            .send(message)
            .await
            .map_err(|_| McpError::session_closed())
    }

    /// Takes the next queued message. Returns "send EOF" once the queue is
    /// drained and the session closed, which ends the streaming reader.
    pub async fn next_message(&self) -> McpResult<Vec<u8>> {
        let mut rx = self.send_rx.lock().await;
        rx.recv().await.ok_or_else(McpError::send_eof)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the sender lets the drainer finish the queue, then see EOF.
        self.send_tx.lock().take();
    }
}

/// The session store: concurrent map of sessions plus the heartbeat reaper.
pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionState>>,
    tombstones: DashMap<String, ()>,
    max_idle_time: Option<Duration>,
    heartbeat_stop: CancellationToken,
}

impl SessionManager {
    /// Creates a store. `max_idle_time` of `None` disables idle reaping.
    #[must_use]
    pub fn new(max_idle_time: Option<Duration>) -> Self {
        Self {
            sessions: DashMap::new(),
            tombstones: DashMap::new(),
            max_idle_time,
            heartbeat_stop: CancellationToken::new(),
        }
    }

    /// Mints a session with a fresh opaque id.
    pub fn create(&self) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.sessions
            .insert(session_id.clone(), Arc::new(SessionState::new()));
        debug!(target: targets::SESSION, "session created: sessionID={session_id}");
        session_id
    }

    /// Looks a session up.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<SessionState>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    /// True when the session exists and is open.
    #[must_use]
    pub fn is_active_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// True when the session existed and was closed.
    #[must_use]
    pub fn is_closed_session(&self, session_id: &str) -> bool {
        self.tombstones.contains_key(session_id)
    }

    /// Refreshes a session's activity timestamp.
    pub fn update_last_active(&self, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            session.touch();
        }
    }

    /// Closes one session. Idempotent.
    pub fn close(&self, session_id: &str) {
        if let Some((id, session)) = self.sessions.remove(session_id) {
            session.close();
            self.tombstones.insert(id, ());
            debug!(target: targets::SESSION, "session closed: sessionID={session_id}");
        }
    }

    /// Closes every session.
    pub fn close_all_sessions(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id);
        }
    }

    /// Visits every session; stop early by returning false.
    pub fn range(&self, mut f: impl FnMut(&str, &Arc<SessionState>) -> bool) {
        for entry in self.sessions.iter() {
            if !f(entry.key(), entry.value()) {
                break;
            }
        }
    }

    /// True when no sessions exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Heartbeat loop: every minute, close sessions idle past the limit and
    /// ping the rest; a session failing `HEARTBEAT_ATTEMPTS` pings is closed.
    ///
    /// `detection` is the same code path as any server-to-client call.
    pub async fn run_heartbeat<F>(&self, detection: F)
    where
        F: Fn(String) -> futures::future::BoxFuture<'static, McpResult<()>>,
    {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                _ = self.heartbeat_stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            self.sweep(&detection).await;
        }
    }

    /// One heartbeat pass over every session.
    pub(crate) async fn sweep<F>(&self, detection: &F)
    where
        F: Fn(String) -> futures::future::BoxFuture<'static, McpResult<()>>,
    {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        'sessions: for session_id in ids {
            let Some(session) = self.get(&session_id) else {
                continue;
            };

            if let Some(max_idle) = self.max_idle_time {
                if session.idle_for() > max_idle {
                    warn!(target: targets::SESSION, "reaping idle session: sessionID={session_id}");
                    self.close(&session_id);
                    continue;
                }
            }

            for _ in 0..HEARTBEAT_ATTEMPTS {
                if detection(session_id.clone()).await.is_ok() {
                    continue 'sessions;
                }
            }
            warn!(target: targets::SESSION, "reaping unresponsive session: sessionID={session_id}");
            self.close(&session_id);
        }
    }

    /// Stops the heartbeat loop.
    pub fn stop_heartbeat(&self) {
        self.heartbeat_stop.cancel();
    }
}

#[async_trait]
impl SessionRegistry for SessionManager {
    fn create_session(&self) -> String {
        self.create()
    }

    fn is_active(&self, session_id: &str) -> bool {
        self.is_active_session(session_id)
    }

    fn is_closed(&self, session_id: &str) -> bool {
        self.is_closed_session(session_id)
    }

    async fn enqueue(&self, session_id: &str, message: Vec<u8>) -> McpResult<()> {
        match self.get(session_id) {
            Some(session) => session.send_message(message).await,
            None if self.is_closed_session(session_id) => Err(McpError::session_closed()),
            None => Err(McpError::session_missing()),
        }
    }

    async fn dequeue(&self, session_id: &str) -> McpResult<Vec<u8>> {
        match self.get(session_id) {
            Some(session) => session.next_message().await,
            None if self.is_closed_session(session_id) => Err(McpError::send_eof()),
            None => Err(McpError::session_missing()),
        }
    }

    fn close_session(&self, session_id: &str) {
        self.close(session_id);
    }

    fn close_all(&self) {
        self.close_all_sessions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peermcp_core::ErrorCode;

    #[tokio::test]
    async fn send_queue_round_trip() {
        let manager = SessionManager::new(None);
        let id = manager.create();
        manager.enqueue(&id, b"one".to_vec()).await.unwrap();
        manager.enqueue(&id, b"two".to_vec()).await.unwrap();
        assert_eq!(manager.dequeue(&id).await.unwrap(), b"one");
        assert_eq!(manager.dequeue(&id).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn close_drains_then_eofs() {
        let manager = SessionManager::new(None);
        let id = manager.create();
        manager.enqueue(&id, b"tail".to_vec()).await.unwrap();
        let session = manager.get(&id).unwrap();
        manager.close(&id);

        // Queued data still drains, then the reader sees send EOF.
        assert_eq!(session.next_message().await.unwrap(), b"tail");
        let err = session.next_message().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SendEof);
    }

    #[tokio::test]
    async fn enqueue_after_close_fails_with_session_closed() {
        let manager = SessionManager::new(None);
        let id = manager.create();
        manager.close(&id);
        let err = manager.enqueue(&id, b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionClosed);
        assert!(manager.is_closed_session(&id));
        assert!(!manager.is_active_session(&id));
    }

    #[tokio::test]
    async fn unknown_session_is_distinct_from_closed() {
        let manager = SessionManager::new(None);
        let err = manager.enqueue("nope", b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionMissing);
    }

    #[test]
    fn handshake_flags_are_monotonic() {
        let session = SessionState::new();
        assert!(!session.received_initialize());
        session.mark_received_initialize();
        session.set_ready();
        assert!(session.received_initialize());
        assert!(session.is_ready());
    }

    #[test]
    fn request_ids_are_unique_and_increasing() {
        let session = SessionState::new();
        let a = session.next_request_id();
        let b = session.next_request_id();
        assert!(b > a);
    }
}
