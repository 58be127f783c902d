use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, sleep};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

use crate::error::{ErrorMonitor, ProxyError, codes};
use crate::plugins::PluginRuntime;
use crate::registry::{Session, SessionRegistry};
use crate::validator::{MessageValidator, Validation};

/// Bound on the per-session pending buffer; overflow drops the oldest.
pub const MAX_PENDING: usize = 1000;

/// Interval of the client-socket heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long a new connection waits for an in-progress cleanup of the
/// same session id before giving up.
pub const CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Which socket a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Client,
    Browser,
}

/// A frame held back until its destination becomes ready.
#[derive(Debug)]
pub struct PendingFrame {
    pub source: Source,
    pub frame: String,
}

/// Readiness flags and the pending buffer, guarded together so that a
/// drain is atomic with respect to further buffering.
#[derive(Debug, Default)]
pub struct LinkState {
    pub client_ready: bool,
    pub browser_ready: bool,
    pub teardown: bool,
    pub pending: VecDeque<PendingFrame>,
}

/// The shared wiring of one session: an outbound writer channel per
/// socket plus the link state. Held by the session registry so the
/// plugin runtime can reach a session's sockets as well.
pub struct SessionLink {
    to_client: mpsc::UnboundedSender<Message>,
    to_browser: mpsc::UnboundedSender<Message>,
    pub(crate) state: Mutex<LinkState>,
    closed: Notify,
}

/// Receiver ends of a link's writer channels, consumed by `attach`.
pub struct LinkReceivers {
    pub client_rx: mpsc::UnboundedReceiver<Message>,
    pub browser_rx: mpsc::UnboundedReceiver<Message>,
}

impl SessionLink {
    #[must_use]
    pub fn new() -> (Arc<Self>, LinkReceivers) {
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (to_browser, browser_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                to_client,
                to_browser,
                state: Mutex::new(LinkState::default()),
                closed: Notify::new(),
            }),
            LinkReceivers {
                client_rx,
                browser_rx,
            },
        )
    }

    #[must_use]
    pub fn client_ready(&self) -> bool {
        self.state.lock().expect("link state poisoned").client_ready
    }

    #[must_use]
    pub fn browser_ready(&self) -> bool {
        self.state.lock().expect("link state poisoned").browser_ready
    }

    /// Handle the supervisor registers to close this session's client
    /// socket during browser teardown.
    #[must_use]
    pub fn client_sender(&self) -> mpsc::UnboundedSender<Message> {
        self.to_client.clone()
    }

    /// Write a frame straight to the browser socket. Used by the plugin
    /// runtime for plugin-initiated commands.
    pub fn send_to_browser(&self, frame: String) -> Result<(), ProxyError> {
        if !self.browser_ready() {
            return Err(ProxyError::plugin(
                codes::COMMAND_FAILED,
                "browser socket is not open",
            ));
        }
        self.to_browser
            .send(Message::Text(frame.into()))
            .map_err(|_| ProxyError::plugin(codes::COMMAND_FAILED, "browser writer has exited"))
    }

    /// Resolves once the session has been torn down.
    pub async fn closed(&self) {
        loop {
            if self.state.lock().expect("link state poisoned").teardown {
                return;
            }
            let notified = self.closed.notified();
            // Re-check after registering so a teardown racing the
            // registration is not missed; the timeout is a backstop.
            if self.state.lock().expect("link state poisoned").teardown {
                return;
            }
            let _ = tokio::time::timeout(Duration::from_millis(500), notified).await;
        }
    }

    /// Write a frame straight to the client socket. Used by the plugin
    /// runtime for synthetic events.
    pub fn send_to_client(&self, frame: String) -> Result<(), ProxyError> {
        if !self.client_ready() {
            return Err(ProxyError::plugin(
                codes::COMMAND_FAILED,
                "client socket is not open",
            ));
        }
        self.to_client
            .send(Message::Text(frame.into()))
            .map_err(|_| ProxyError::plugin(codes::COMMAND_FAILED, "client writer has exited"))
    }
}

/// Per-session dual-socket pump.
///
/// One relay serves every session. Each attached socket gets a writer
/// task (fed by the link's channel) and a reader pump; frames flow
/// reader → plugin chain → opposite writer, with buffering while the
/// destination is not ready.
pub struct MessageRelay {
    registry: Arc<SessionRegistry>,
    plugins: Arc<PluginRuntime>,
    validator: Arc<dyn MessageValidator>,
    errors: Arc<ErrorMonitor>,
    killing: Arc<AtomicBool>,
    cleanup_in_progress: Mutex<HashSet<String>>,
}

impl MessageRelay {
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        plugins: Arc<PluginRuntime>,
        validator: Arc<dyn MessageValidator>,
        errors: Arc<ErrorMonitor>,
        killing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            plugins,
            validator,
            errors,
            killing,
            cleanup_in_progress: Mutex::new(HashSet::new()),
        }
    }

    fn is_cleaning(&self, session_id: &str) -> bool {
        self.cleanup_in_progress
            .lock()
            .expect("cleanup set poisoned")
            .contains(session_id)
    }

    /// Admit a new connection for a session id.
    ///
    /// If a cleanup of the same id is still in flight, wait briefly and
    /// retry once before reporting a recoverable connection error.
    ///
    /// # Errors
    ///
    /// Returns a recoverable `connection` error when the cleanup does not
    /// finish within the retry window.
    pub async fn handle_connection(&self, session_id: &str) -> Result<(), ProxyError> {
        if !self.is_cleaning(session_id) {
            return Ok(());
        }
        sleep(CLEANUP_RETRY_DELAY).await;
        if !self.is_cleaning(session_id) {
            return Ok(());
        }
        let err = ProxyError::connection(
            codes::SOCKET_ABNORMAL,
            format!("session {session_id} is still being cleaned up"),
        );
        self.errors.handle(&err, Some(session_id));
        Err(err)
    }

    /// Wire one socket of a session into the relay: spawn its writer and
    /// reader tasks, mark the side ready, and drain anything deliverable.
    /// The client side also gets the heartbeat task.
    pub fn attach<T>(
        self: &Arc<Self>,
        session: &Arc<Session>,
        ws: WebSocketStream<T>,
        rx: mpsc::UnboundedReceiver<Message>,
        source: Source,
    ) where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        tokio::spawn(run_writer(sink, rx));
        if source == Source::Client {
            tokio::spawn(run_heartbeat(Arc::clone(&session.link)));
        }
        self.mark_ready(session, source);

        let relay = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            relay.pump(session, stream, source).await;
        });
    }

    /// Reader task for one socket.
    ///
    /// Correlation interception happens here, before frames enter the
    /// per-direction processing queue. The queue task runs the plugin
    /// chain one frame at a time (preserving receive order) while the
    /// reader keeps going, so a hook that awaits a plugin command never
    /// starves the socket its response arrives on.
    async fn pump<S>(self: Arc<Self>, session: Arc<Session>, mut stream: S, source: Source)
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin + Send,
    {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<Value>();
        let processor = tokio::spawn(
            Arc::clone(&self).process_queue(Arc::clone(&session), source, queue_rx),
        );

        while let Some(item) = stream.next().await {
            match item {
                Ok(Message::Text(text)) => {
                    if let Some(frame) = self.preprocess(&session, source, text.as_str()) {
                        let _ = queue_tx.send(frame);
                    }
                }
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        if let Some(frame) = self.preprocess(&session, source, text) {
                            let _ = queue_tx.send(frame);
                        }
                    }
                    Err(e) => {
                        self.errors.handle(
                            &ProxyError::protocol(format!("binary frame is not UTF-8: {e}")),
                            Some(&session.id),
                        );
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    self.socket_error(&session, source, &e);
                    break;
                }
            }
        }

        // Let queued frames finish the chain in order before teardown.
        drop(queue_tx);
        let _ = processor.await;
        self.teardown(&session).await;
    }

    /// Parse and validate one raw frame, consuming plugin command
    /// responses. Returns the frame destined for the plugin chain.
    fn preprocess(&self, session: &Arc<Session>, source: Source, raw: &str) -> Option<Value> {
        let parsed: Value = match serde_json::from_str(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.errors.handle(
                    &ProxyError::protocol(format!("unparseable frame: {e}")),
                    Some(&session.id),
                );
                return None;
            }
        };

        if let Validation::Warn(reason) = self.validator.validate(&parsed) {
            // Warnings count but never block the frame.
            self.errors
                .handle(&ProxyError::validation(reason), Some(&session.id));
        }

        // Responses to plugin-initiated commands are consumed here and
        // never reach the plugin chain or the client.
        if source == Source::Browser && self.plugins.try_resolve_response(&parsed) {
            return None;
        }

        Some(parsed)
    }

    /// Per-direction chain runner: strictly one frame at a time, in
    /// receive order.
    async fn process_queue(
        self: Arc<Self>,
        session: Arc<Session>,
        source: Source,
        mut queue_rx: mpsc::UnboundedReceiver<Value>,
    ) {
        while let Some(frame) = queue_rx.recv().await {
            let Some(message) = self.plugins.process(&session.id, frame).await else {
                continue;
            };
            self.forward(&session, source, message.to_string());
        }
    }

    /// Deliver a frame if the destination is ready, otherwise buffer it
    /// with ring semantics.
    pub(crate) fn forward(&self, session: &Arc<Session>, source: Source, frame: String) {
        let link = &session.link;
        let mut state = link.state.lock().expect("link state poisoned");
        if state.teardown {
            return;
        }
        let deliverable = match source {
            Source::Client => state.client_ready && state.browser_ready,
            Source::Browser => state.client_ready,
        };
        if deliverable {
            let _ = match source {
                Source::Client => link.to_browser.send(Message::Text(frame.into())),
                Source::Browser => link.to_client.send(Message::Text(frame.into())),
            };
        } else {
            if state.pending.len() >= MAX_PENDING {
                state.pending.pop_front();
            }
            state.pending.push_back(PendingFrame { source, frame });
        }
    }

    /// Mark one side open and flush any frames that became deliverable.
    pub(crate) fn mark_ready(&self, session: &Arc<Session>, source: Source) {
        let link = &session.link;
        let mut state = link.state.lock().expect("link state poisoned");
        if state.teardown {
            return;
        }
        match source {
            Source::Client => state.client_ready = true,
            Source::Browser => state.browser_ready = true,
        }
        drain_deliverable(&mut state, link);
    }

    fn socket_error(&self, session: &Arc<Session>, source: Source, error: &WsError) {
        // Browser-side noise during a browser kill is expected; say
        // nothing and let teardown run.
        if source == Source::Browser && self.killing.load(Ordering::SeqCst) {
            return;
        }
        let err = ProxyError::connection(
            codes::SOCKET_ABNORMAL,
            format!("{source:?} socket error: {error}"),
        );
        self.errors.handle(&err, Some(&session.id));

        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Abnormal,
            reason: "".into(),
        }));
        let _ = match source {
            Source::Client => session.link.to_client.send(close),
            Source::Browser => session.link.to_browser.send(close),
        };
    }

    /// Tear a session down once. The second socket's close lands while
    /// `teardown` is already set and is absorbed silently.
    async fn teardown(&self, session: &Arc<Session>) {
        {
            let mut state = session.link.state.lock().expect("link state poisoned");
            if state.teardown {
                return;
            }
            state.teardown = true;
            state.client_ready = false;
            state.browser_ready = false;
            state.pending.clear();
        }
        self.cleanup_in_progress
            .lock()
            .expect("cleanup set poisoned")
            .insert(session.id.clone());

        session.active.store(false, Ordering::SeqCst);
        let _ = session.link.to_client.send(Message::Close(None));
        let _ = session.link.to_browser.send(Message::Close(None));
        session.link.closed.notify_waiters();
        self.registry.remove(&session.id);
        self.errors.clear(&session.id);

        sleep(CLEANUP_RETRY_DELAY).await;
        self.cleanup_in_progress
            .lock()
            .expect("cleanup set poisoned")
            .remove(&session.id);
        debug!(session = %session.id, "session closed");
    }
}

fn drain_deliverable(state: &mut LinkState, link: &SessionLink) {
    let client_to_browser = state.client_ready && state.browser_ready;
    let browser_to_client = state.client_ready;
    if !client_to_browser && !browser_to_client {
        return;
    }
    let mut kept = VecDeque::new();
    while let Some(entry) = state.pending.pop_front() {
        match entry.source {
            Source::Client if client_to_browser => {
                let _ = link.to_browser.send(Message::Text(entry.frame.into()));
            }
            Source::Browser if browser_to_client => {
                let _ = link.to_client.send(Message::Text(entry.frame.into()));
            }
            _ => kept.push_back(entry),
        }
    }
    state.pending = kept;
}

/// Writer task: owns the sink half of a socket and drains its channel.
async fn run_writer<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Message>)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Client-socket heartbeat: a `"ping"` text frame every interval until
/// the session closes.
async fn run_heartbeat(link: Arc<SessionLink>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if link.state.lock().expect("link state poisoned").teardown {
                    break;
                }
                if link.to_client.send(Message::Text("ping".into())).is_err() {
                    break;
                }
            }
            () = link.closed.notified() => break,
        }
    }
}
