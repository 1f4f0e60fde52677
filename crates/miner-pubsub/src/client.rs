//! Event-bus client: connection lifecycle, session I/O and request API.
//!
//! A [`PubSubClient`] owns one logical connection. `connect()` starts a
//! supervisor task that opens the socket, re-sends every registered topic,
//! reads frames, and reconnects with backoff after transport loss. Auth
//! failures and `close()` are the only things that stop it.
//!
//! All mutable state (lifecycle state, socket link, topic registry, pending
//! table, listeners) lives behind one mutex, so a reconnect can never race a
//! `send` or a topic mutation.

use std::slice;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use miner_core::{Nonce, next_backoff_delay};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{
    InboundFrame, OutboundCommand, ResponseFrame, decode_frame, encode_command, is_auth_failure,
};
use crate::config::ClientConfig;
use crate::dispatch::{CloseInfo, Dispatcher, ListenerEvent, PubSubListener};
use crate::errors::{PubSubError, RequestError};
use crate::keepalive::{KeepaliveResult, Liveness, run_keepalive};
use crate::pending::{PendingRequests, ReplyReceiver};
use crate::state::ConnectionState;
use crate::topic::{Topic, TopicRegistry};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Close code some servers use for rejected credentials.
const CLOSE_CODE_AUTH_FAILED: u16 = 4003;
/// Close code reported when the link died without a close handshake.
const CLOSE_CODE_ABNORMAL: u16 = 1006;
/// Close code reported when the server asked us to reconnect.
const CLOSE_CODE_SERVICE_RESTART: u16 = 1012;

/// Handle returned by [`PubSubClient::add_listener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Work for the socket writer.
enum Outgoing {
    Text(String),
    Close(String),
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    RemoteClosed { code: u16, reason: String },
    TransportError(String),
    KeepaliveTimeout,
    ServerReconnect,
    AuthFailed { code: u16, reason: String, remote: bool },
    LocalClose,
}

impl SessionEnd {
    /// Fold auth-flavoured remote closes into `AuthFailed`.
    fn classify(self) -> Self {
        match self {
            Self::RemoteClosed { code, reason }
                if code == CLOSE_CODE_AUTH_FAILED || is_auth_failure(&reason) =>
            {
                Self::AuthFailed {
                    code,
                    reason,
                    remote: true,
                }
            }
            other => other,
        }
    }

    /// Whether the supervisor stops instead of reconnecting.
    fn is_terminal(&self) -> bool {
        matches!(self, Self::AuthFailed { .. } | Self::LocalClose)
    }

    fn close_info(&self) -> CloseInfo {
        let (code, reason, remote) = match self {
            Self::RemoteClosed { code, reason } => (*code, reason.clone(), true),
            Self::TransportError(reason) => (CLOSE_CODE_ABNORMAL, reason.clone(), true),
            Self::KeepaliveTimeout => (CLOSE_CODE_ABNORMAL, "keepalive timeout".into(), false),
            Self::ServerReconnect => (
                CLOSE_CODE_SERVICE_RESTART,
                "server requested reconnect".into(),
                true,
            ),
            Self::AuthFailed {
                code,
                reason,
                remote,
            } => (*code, reason.clone(), *remote),
            Self::LocalClose => (u16::from(CloseCode::Normal), "client closed".into(), false),
        };
        CloseInfo {
            code,
            reason,
            remote,
        }
    }
}

/// The live socket, as seen from outside the session task.
struct Link {
    outbound: mpsc::UnboundedSender<Outgoing>,
}

struct ClientState {
    state: ConnectionState,
    topics: TopicRegistry,
    pending: PendingRequests,
    listeners: Vec<(ListenerId, Arc<dyn PubSubListener>)>,
    next_listener_id: u64,
    link: Option<Link>,
    auth_token: Option<String>,
    reconnect_attempt: u32,
    last_error: Option<String>,
    shutdown: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

impl ClientState {
    fn supervisor_running(&self) -> bool {
        self.supervisor.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn PubSubListener>> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    /// Register `command` (which must carry a nonce) and queue it.
    fn start_request(&mut self, command: &OutboundCommand) -> Result<ReplyReceiver, RequestError> {
        let Some(link) = &self.link else {
            return Err(RequestError::NotConnected);
        };
        let nonce = command.nonce.clone().unwrap_or_default();
        let label = format!("{} {}", command.kind.as_str(), nonce);
        let rx = self.pending.register(nonce.clone(), label)?;
        if link
            .outbound
            .send(Outgoing::Text(encode_command(command)))
            .is_err()
        {
            let _ = self.pending.cancel(&nonce);
            return Err(RequestError::ConnectionLost);
        }
        Ok(rx)
    }

    /// Queue a command that expects no reply.
    fn send_untracked(&self, command: &OutboundCommand) -> Result<(), RequestError> {
        let link = self.link.as_ref().ok_or(RequestError::NotConnected)?;
        link.outbound
            .send(Outgoing::Text(encode_command(command)))
            .map_err(|_| RequestError::ConnectionLost)
    }
}

struct Shared {
    config: ClientConfig,
    inner: Mutex<ClientState>,
    state_tx: watch::Sender<ConnectionState>,
    dispatcher: Dispatcher,
}

impl Shared {
    fn set_state(&self, inner: &mut ClientState, next: ConnectionState) {
        if inner.state == next {
            return;
        }
        info!(from = %inner.state, to = %next, url = %self.config.url, "connection state changed");
        inner.state = next;
        let _ = self.state_tx.send_replace(next);
    }

    fn emit(&self, inner: &ClientState, event: ListenerEvent) {
        self.dispatcher.dispatch(event, inner.listener_snapshot());
    }
}

/// Client for one event-bus connection.
///
/// Cheap to clone; clones share the connection. Must be created inside a
/// Tokio runtime. Call [`close`](Self::close) to stop the background task.
#[derive(Clone)]
pub struct PubSubClient {
    shared: Arc<Shared>,
}

impl PubSubClient {
    /// Create a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let inner = ClientState {
            state: ConnectionState::Disconnected,
            topics: TopicRegistry::new(config.max_topics),
            pending: PendingRequests::new(config.request_timeout),
            listeners: Vec::new(),
            next_listener_id: 0,
            link: None,
            auth_token: None,
            reconnect_attempt: 0,
            last_error: None,
            shutdown: CancellationToken::new(),
            supervisor: None,
        };
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(inner),
                state_tx,
                dispatcher: Dispatcher::spawn(),
            }),
        }
    }

    /// Set the token sent with LISTEN commands.
    #[must_use]
    pub fn with_auth_token(self, token: impl Into<String>) -> Self {
        self.set_auth_token(token);
        self
    }

    /// Replace the token used by future LISTEN commands.
    pub fn set_auth_token(&self, token: impl Into<String>) {
        self.shared.inner.lock().auth_token = Some(token.into());
    }

    /// Register a listener for lifecycle events and unconsumed frames.
    pub fn add_listener(&self, listener: Arc<dyn PubSubListener>) -> ListenerId {
        let mut inner = self.shared.inner.lock();
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.listeners.push((id, listener));
        id
    }

    /// Unregister a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.shared.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Watch lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Whether the socket is up.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Registered topics, in order.
    pub fn topics(&self) -> Vec<Topic> {
        self.shared.inner.lock().topics.snapshot()
    }

    /// Number of registered topics.
    pub fn topic_count(&self) -> usize {
        self.shared.inner.lock().topics.len()
    }

    /// Whether `topic` is registered.
    pub fn has_topic(&self, topic: &Topic) -> bool {
        self.shared.inner.lock().topics.contains(topic)
    }

    /// Whether another topic fits on this connection.
    pub fn has_capacity(&self) -> bool {
        self.shared.inner.lock().topics.has_capacity()
    }

    /// Requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.inner.lock().pending.len()
    }

    /// Open the connection.
    ///
    /// Returns at once if already connected. Otherwise starts the supervisor
    /// when needed and waits for the handshake, bounded by the connect
    /// timeout. The supervisor keeps retrying in the background after a
    /// failed first attempt.
    pub async fn connect(&self) -> Result<(), PubSubError> {
        let mut state_rx = self.shared.state_tx.subscribe();
        {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closing => return Err(PubSubError::Closed),
                ConnectionState::Connecting | ConnectionState::Disconnected
                    if inner.supervisor_running() => {}
                _ => self.start_supervisor(&mut inner),
            }
        }

        let timeout = self.shared.config.connect_timeout;
        let wait = async {
            let mut saw_attempt = false;
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Closing | ConnectionState::Closed => {
                        return Err(PubSubError::Closed);
                    }
                    ConnectionState::Connecting => saw_attempt = true,
                    ConnectionState::Disconnected if saw_attempt => {
                        let reason = self.shared.inner.lock().last_error.clone();
                        return Err(PubSubError::Connect {
                            url: self.shared.config.url.clone(),
                            reason: reason.unwrap_or_else(|| "connection lost".into()),
                        });
                    }
                    ConnectionState::Disconnected => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(PubSubError::Closed);
                }
            }
        };
        time::timeout(timeout, wait)
            .await
            .map_err(|_| PubSubError::Timeout {
                timeout_ms: millis(timeout),
                context: format!("connect to {}", self.shared.config.url),
            })?
    }

    fn start_supervisor(&self, inner: &mut ClientState) {
        inner.shutdown = CancellationToken::new();
        inner.reconnect_attempt = 0;
        inner.last_error = None;
        self.shared.set_state(inner, ConnectionState::Connecting);
        let shared = Arc::clone(&self.shared);
        let shutdown = inner.shutdown.clone();
        inner.supervisor = Some(tokio::spawn(supervise(shared, shutdown)));
    }

    /// Close gracefully and stop reconnecting.
    ///
    /// Sends a close frame when connected, waits for the supervisor to wind
    /// down within the close timeout, and returns once listeners have seen
    /// the closed callback.
    pub async fn close(&self) {
        let supervisor = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ConnectionState::Closed && !inner.supervisor_running() {
                return;
            }
            inner.shutdown.cancel();
            self.shared.set_state(&mut inner, ConnectionState::Closing);
            inner.supervisor.take()
        };

        let close_timeout = self.shared.config.close_timeout;
        if let Some(mut handle) = supervisor {
            if time::timeout(close_timeout * 2, &mut handle).await.is_err() {
                warn!(url = %self.shared.config.url, "supervisor did not stop in time, aborting");
                handle.abort();
            }
        }

        {
            let mut inner = self.shared.inner.lock();
            let _ = inner.pending.fail_all(&RequestError::Closed);
            inner.link = None;
            self.shared.set_state(&mut inner, ConnectionState::Closed);
        }
        if time::timeout(close_timeout, self.shared.dispatcher.flush())
            .await
            .is_err()
        {
            warn!("listeners did not drain before close returned");
        }
    }

    /// Add `topic` to the registry and, when connected, LISTEN to it now.
    ///
    /// While disconnected the topic is sent on the next successful connect.
    /// A rejected LISTEN removes the topic again. A credentials failure
    /// keeps it, so a `connect()` with a fresh token re-sends it.
    pub async fn subscribe(&self, topic: Topic) -> Result<(), PubSubError> {
        let (nonce, rx) = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if !inner.topics.add(topic.clone())? {
                return Ok(());
            }
            if inner.state != ConnectionState::Connected {
                debug!(topic = %topic, state = %inner.state, "topic queued until connected");
                return Ok(());
            }
            let nonce = Nonce::new();
            let command = OutboundCommand::listen(slice::from_ref(&topic), inner.auth_token.as_deref())
                .with_nonce(nonce.clone());
            match inner.start_request(&command) {
                Ok(rx) => (nonce, rx),
                // the registry still holds it; the next connect re-sends it
                Err(err) => {
                    debug!(topic = %topic, error = %err, "listen deferred");
                    return Ok(());
                }
            }
        };
        debug!(topic = %topic, nonce = %nonce, "listen sent");

        let deadline = Instant::now() + self.shared.config.request_timeout;
        match self.await_reply(nonce, rx, deadline).await {
            Ok(_) => Ok(()),
            Err(err @ RequestError::Rejected { .. }) => {
                let _ = self.shared.inner.lock().topics.remove(&topic);
                warn!(topic = %topic, error = %err, "listen rejected");
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Empty the registry and, when connected, UNLISTEN every dropped topic
    /// in one command.
    pub async fn clear_topics(&self) -> Result<(), PubSubError> {
        let (nonce, rx) = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            let topics = inner.topics.snapshot();
            inner.topics.clear();
            if topics.is_empty() || inner.state != ConnectionState::Connected {
                return Ok(());
            }
            let nonce = Nonce::new();
            let command = OutboundCommand::unlisten(&topics).with_nonce(nonce.clone());
            match inner.start_request(&command) {
                Ok(rx) => (nonce, rx),
                Err(_) => return Ok(()),
            }
        };
        debug!(nonce = %nonce, "unlisten all sent");

        let deadline = Instant::now() + self.shared.config.request_timeout;
        self.await_reply(nonce, rx, deadline).await?;
        Ok(())
    }

    /// Remove `topic` from the registry and, when connected, UNLISTEN now.
    pub async fn unsubscribe(&self, topic: &Topic) -> Result<(), PubSubError> {
        let (nonce, rx) = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if !inner.topics.remove(topic) {
                return Ok(());
            }
            if inner.state != ConnectionState::Connected {
                return Ok(());
            }
            let nonce = Nonce::new();
            let command =
                OutboundCommand::unlisten(slice::from_ref(topic)).with_nonce(nonce.clone());
            match inner.start_request(&command) {
                Ok(rx) => (nonce, rx),
                Err(_) => return Ok(()),
            }
        };
        debug!(topic = %topic, nonce = %nonce, "unlisten sent");

        let deadline = Instant::now() + self.shared.config.request_timeout;
        self.await_reply(nonce, rx, deadline).await?;
        Ok(())
    }

    /// Send a command, waiting up to the request timeout.
    ///
    /// See [`send_with_timeout`](Self::send_with_timeout).
    pub async fn send(&self, command: OutboundCommand) -> Result<Option<ResponseFrame>, PubSubError> {
        self.send_with_timeout(command, self.shared.config.request_timeout)
            .await
    }

    /// Send a command and wait for its `RESPONSE`.
    ///
    /// A nonce is assigned when the command has none. Commands that expect
    /// no reply (PING) resolve to `None` once queued. If a reconnect is in
    /// progress the call waits for it within `timeout`; otherwise it fails
    /// fast with [`RequestError::NotConnected`]. Dropping the returned future
    /// abandons the request.
    pub async fn send_with_timeout(
        &self,
        mut command: OutboundCommand,
        timeout: Duration,
    ) -> Result<Option<ResponseFrame>, PubSubError> {
        let deadline = Instant::now() + timeout;
        self.wait_connected(deadline).await?;

        let nonce = command.nonce.get_or_insert_with(Nonce::new).clone();
        let rx = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ConnectionState::Connected {
                return Err(RequestError::NotConnected.into());
            }
            if !command.expects_reply() {
                inner.send_untracked(&command)?;
                return Ok(None);
            }
            inner.start_request(&command)?
        };
        trace!(kind = command.kind.as_str(), nonce = %nonce, "command sent");

        let response = self.await_reply(nonce, rx, deadline).await?;
        Ok(Some(response))
    }

    async fn wait_connected(&self, deadline: Instant) -> Result<(), RequestError> {
        let mut state_rx = self.shared.state_tx.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(RequestError::Closed);
                }
                ConnectionState::Disconnected if !self.shared.inner.lock().supervisor_running() => {
                    return Err(RequestError::NotConnected);
                }
                ConnectionState::Connecting | ConnectionState::Disconnected => {}
            }
            match time::timeout_at(deadline, state_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(RequestError::Closed),
                Err(_) => return Err(RequestError::NotConnected),
            }
        }
    }

    async fn await_reply(
        &self,
        nonce: Nonce,
        rx: ReplyReceiver,
        deadline: Instant,
    ) -> Result<ResponseFrame, RequestError> {
        let _guard = PendingGuard {
            shared: &self.shared,
            nonce: &nonce,
        };
        let started = Instant::now();
        match time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RequestError::ConnectionLost),
            Err(_) => Err(RequestError::Timeout {
                nonce: nonce.to_string(),
                timeout_ms: millis(started.elapsed()),
            }),
        }
    }
}

/// Drops the pending entry when the waiting caller goes away.
struct PendingGuard<'a> {
    shared: &'a Shared,
    nonce: &'a Nonce,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.shared.inner.lock().pending.cancel(self.nonce);
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────

async fn supervise(shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        let opened = tokio::select! {
            result = open_socket(&shared.config) => result,
            () = shutdown.cancelled() => break,
        };

        match opened {
            Ok(ws) => {
                let end = run_session(&shared, ws, &shutdown).await;
                if end.is_terminal() {
                    break;
                }
            }
            Err(err) => {
                let mut guard = shared.inner.lock();
                let inner = &mut *guard;
                if shutdown.is_cancelled() {
                    break;
                }
                warn!(url = %shared.config.url, error = %err, "connect failed");
                inner.last_error = Some(err.to_string());
                shared.set_state(inner, ConnectionState::Disconnected);
                shared.emit(inner, ListenerEvent::Error(Arc::new(err)));
            }
        }

        let attempt = {
            let mut inner = shared.inner.lock();
            let attempt = inner.reconnect_attempt;
            inner.reconnect_attempt = inner.reconnect_attempt.saturating_add(1);
            attempt
        };
        let delay = next_backoff_delay(attempt, &shared.config.backoff);
        info!(attempt, delay_ms = millis(delay), "reconnecting after backoff");
        tokio::select! {
            () = time::sleep(delay) => {}
            () = shutdown.cancelled() => break,
        }

        {
            let inner = &mut *shared.inner.lock();
            if shutdown.is_cancelled() {
                break;
            }
            shared.set_state(inner, ConnectionState::Connecting);
        }
    }
    debug!(url = %shared.config.url, "supervisor stopped");
}

async fn open_socket(config: &ClientConfig) -> Result<WsStream, PubSubError> {
    match time::timeout(config.connect_timeout, connect_async(config.url.as_str())).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(err)) => Err(PubSubError::Connect {
            url: config.url.clone(),
            reason: err.to_string(),
        }),
        Err(_) => Err(PubSubError::Timeout {
            timeout_ms: millis(config.connect_timeout),
            context: format!("connect to {}", config.url),
        }),
    }
}

/// Drive one socket from handshake to teardown.
async fn run_session(shared: &Arc<Shared>, ws: WsStream, shutdown: &CancellationToken) -> SessionEnd {
    let config = &shared.config;
    let (sink, mut stream) = ws.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(run_writer(sink, out_rx));
    let liveness = Arc::new(Liveness::new());
    let session_cancel = shutdown.child_token();

    {
        let inner = &mut *shared.inner.lock();
        inner.link = Some(Link {
            outbound: out_tx.clone(),
        });
        inner.reconnect_attempt = 0;
        inner.last_error = None;
        shared.set_state(inner, ConnectionState::Connected);
        resubscribe(inner);
        shared.emit(inner, ListenerEvent::Opened);
    }

    let mut keepalive = {
        let liveness = Arc::clone(&liveness);
        let pings = out_tx.clone();
        let cancel = session_cancel.clone();
        let (interval, timeout) = (config.ping_interval, config.liveness_timeout);
        tokio::spawn(async move {
            let send_ping = || {
                let ping = OutboundCommand::ping().with_nonce(Nonce::new());
                pings.send(Outgoing::Text(encode_command(&ping))).is_ok()
            };
            run_keepalive(&liveness, interval, timeout, send_ping, cancel).await
        })
    };

    let mut sweep = time::interval(config.sweep_interval);
    sweep.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    liveness.mark_alive();
                    if let Some(end) = route_frame(shared, text.as_str()) {
                        break end;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or_else(
                        || (u16::from(CloseCode::Status), String::new()),
                        |f| (u16::from(f.code), f.reason.as_str().to_owned()),
                    );
                    break SessionEnd::RemoteClosed { code, reason };
                }
                Some(Ok(_)) => liveness.mark_alive(),
                Some(Err(err)) => break SessionEnd::TransportError(err.to_string()),
                None => break SessionEnd::TransportError("stream ended".into()),
            },
            result = &mut keepalive => break match result {
                Ok(KeepaliveResult::TimedOut) => {
                    warn!(
                        url = %config.url,
                        silent_ms = millis(liveness.last_seen_elapsed()),
                        "keepalive timeout"
                    );
                    SessionEnd::KeepaliveTimeout
                }
                Ok(KeepaliveResult::Cancelled) => SessionEnd::LocalClose,
                Ok(KeepaliveResult::LinkClosed) => SessionEnd::TransportError("writer stopped".into()),
                Err(err) => SessionEnd::TransportError(format!("keepalive task failed: {err}")),
            },
            _ = sweep.tick() => {
                let expired = shared.inner.lock().pending.sweep(Instant::now());
                if expired > 0 {
                    debug!(expired, "evicted timed-out requests");
                }
            }
            () = shutdown.cancelled() => break SessionEnd::LocalClose,
        }
    }
    .classify();

    session_cancel.cancel();
    keepalive.abort();
    teardown(shared, end, out_tx, writer).await
}

/// One LISTEN per registered topic, each with a fresh nonce.
fn resubscribe(inner: &mut ClientState) {
    for topic in inner.topics.snapshot() {
        let nonce = Nonce::new();
        let command = OutboundCommand::listen(slice::from_ref(&topic), inner.auth_token.as_deref())
            .with_nonce(nonce.clone());
        // nobody waits on these; the entry only keeps the RESPONSE off listeners
        match inner.start_request(&command) {
            Ok(rx) => drop(rx),
            Err(err) => warn!(topic = %topic, error = %err, "resubscribe failed"),
        }
        debug!(topic = %topic, nonce = %nonce, "topic re-sent");
    }
}

/// Route one inbound text frame. Returns how the session ends, if it does.
fn route_frame(shared: &Shared, text: &str) -> Option<SessionEnd> {
    let frame = match decode_frame(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "undecodable frame");
            let inner = shared.inner.lock();
            shared.emit(&inner, ListenerEvent::Error(Arc::new(err.into())));
            return None;
        }
    };
    trace!(kind = frame.kind(), "frame received");

    let inner = &mut *shared.inner.lock();
    let end = match &frame {
        InboundFrame::Response(response) => {
            let end = response.is_auth_failure().then(|| SessionEnd::AuthFailed {
                code: u16::from(CloseCode::Normal),
                reason: response.error.clone(),
                remote: true,
            });
            if inner.pending.resolve_response(response) {
                return end;
            }
            end
        }
        InboundFrame::Reconnect => {
            info!(url = %shared.config.url, "server requested reconnect");
            Some(SessionEnd::ServerReconnect)
        }
        _ => None,
    };
    shared.emit(inner, ListenerEvent::Message(Arc::new(frame)));
    end
}

/// Fail pending requests, move state, notify listeners, close the socket.
async fn teardown(
    shared: &Shared,
    end: SessionEnd,
    out_tx: mpsc::UnboundedSender<Outgoing>,
    writer: JoinHandle<()>,
) -> SessionEnd {
    let info = end.close_info();
    let graceful = end.is_terminal();
    {
        let inner = &mut *shared.inner.lock();
        let failed = inner.pending.fail_all(&RequestError::ConnectionLost);
        inner.link = None;
        info!(
            url = %shared.config.url,
            code = info.code,
            reason = %info.reason,
            remote = info.remote,
            failed_requests = failed,
            "session ended"
        );
        if let SessionEnd::AuthFailed { reason, .. } = &end {
            shared.emit(
                inner,
                ListenerEvent::Error(Arc::new(PubSubError::AuthFailed {
                    reason: reason.clone(),
                })),
            );
        }
        if graceful {
            shared.set_state(inner, ConnectionState::Closing);
        } else {
            inner.last_error = Some(info.reason.clone());
            // close() raced the failure; it owns the Closing -> Closed step
            if inner.state != ConnectionState::Closing {
                shared.set_state(inner, ConnectionState::Disconnected);
            }
            shared.emit(inner, ListenerEvent::Closed(info.clone()));
        }
    }

    if graceful {
        let _ = out_tx.send(Outgoing::Close(info.reason.clone()));
        drop(out_tx);
        if time::timeout(shared.config.close_timeout, writer).await.is_err() {
            debug!("close frame not flushed in time");
        }
        let inner = &mut *shared.inner.lock();
        // a connect() issued after close() may already have moved us on
        if inner.state == ConnectionState::Closing {
            shared.set_state(inner, ConnectionState::Closed);
        }
        shared.emit(inner, ListenerEvent::Closed(info));
    } else {
        writer.abort();
    }
    end
}

async fn run_writer(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(outgoing) = rx.recv().await {
        match outgoing {
            Outgoing::Text(text) => {
                trace!(frame = %text, "frame sent");
                if let Err(err) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %err, "socket write failed");
                    return;
                }
            }
            Outgoing::Close(reason) => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: reason.into(),
                };
                if let Err(err) = sink.send(Message::Close(Some(frame))).await {
                    debug!(error = %err, "close frame not sent");
                }
                return;
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn offline_config() -> ClientConfig {
        ClientConfig {
            request_timeout: Duration::from_millis(50),
            ..ClientConfig::default()
        }
        .with_url("ws://127.0.0.1:9")
    }

    fn topic(s: &str) -> Topic {
        Topic::parse(s).unwrap()
    }

    #[tokio::test]
    async fn new_client_is_disconnected() {
        let client = PubSubClient::new(offline_config());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_open());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_while_disconnected_only_records() {
        let client = PubSubClient::new(offline_config());
        client.subscribe(topic("raid.1")).await.unwrap();
        client.subscribe(topic("raid.1")).await.unwrap();
        client.subscribe(topic("raid.2")).await.unwrap();
        client.unsubscribe(&topic("raid.2")).await.unwrap();
        assert_eq!(client.topics(), vec![topic("raid.1")]);
        assert!(client.has_topic(&topic("raid.1")));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn clear_topics_while_disconnected_empties_registry() {
        let client = PubSubClient::new(offline_config());
        client.subscribe(topic("raid.1")).await.unwrap();
        client.subscribe(topic("raid.2")).await.unwrap();
        client.clear_topics().await.unwrap();
        assert_eq!(client.topic_count(), 0);
        assert!(client.has_capacity());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_past_capacity_fails() {
        let config = ClientConfig {
            max_topics: 1,
            ..offline_config()
        };
        let client = PubSubClient::new(config);
        client.subscribe(topic("raid.1")).await.unwrap();
        assert!(!client.has_capacity());
        assert_matches!(
            client.subscribe(topic("raid.2")).await,
            Err(PubSubError::TopicLimit { limit: 1 })
        );
    }

    #[tokio::test]
    async fn send_without_connection_fails_fast() {
        let client = PubSubClient::new(offline_config());
        let started = Instant::now();
        let err = client.send(OutboundCommand::ping()).await.unwrap_err();
        assert_matches!(err, PubSubError::Request(RequestError::NotConnected));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let client = PubSubClient::new(offline_config());
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        client.close().await;
        assert_matches!(
            client.send(OutboundCommand::ping()).await,
            Err(PubSubError::Request(RequestError::Closed))
        );
    }

    #[tokio::test]
    async fn listeners_can_be_removed() {
        struct Noop;
        impl PubSubListener for Noop {}

        let client = PubSubClient::new(offline_config());
        let a = client.add_listener(Arc::new(Noop));
        let b = client.add_listener(Arc::new(Noop));
        assert_ne!(a, b);
        assert!(client.remove_listener(a));
        assert!(!client.remove_listener(a));
    }

    #[test]
    fn auth_close_codes_are_terminal() {
        let end = SessionEnd::RemoteClosed {
            code: 4003,
            reason: String::new(),
        }
        .classify();
        assert!(end.is_terminal());
        assert!(end.close_info().remote);

        let end = SessionEnd::RemoteClosed {
            code: 1000,
            reason: "ERR_BADAUTH".into(),
        }
        .classify();
        assert!(end.is_terminal());

        let end = SessionEnd::RemoteClosed {
            code: 1001,
            reason: "going away".into(),
        }
        .classify();
        assert!(!end.is_terminal());
    }

    #[test]
    fn close_info_per_end() {
        let info = SessionEnd::KeepaliveTimeout.close_info();
        assert_eq!(info.code, 1006);
        assert!(!info.remote);

        let info = SessionEnd::TransportError("reset".into()).close_info();
        assert_eq!(info.code, 1006);
        assert!(info.remote);

        let info = SessionEnd::LocalClose.close_info();
        assert_eq!(info.code, 1000);
        assert!(!info.remote);
        assert!(SessionEnd::LocalClose.is_terminal());
        assert!(!SessionEnd::ServerReconnect.is_terminal());
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
