//! Integration tests for the relay and plugin pipeline.
//!
//! Each test wires a real client WebSocket pair and a mock browser
//! WebSocket server through the relay, then verifies what each end
//! observes.

#![allow(clippy::needless_pass_by_value)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use cdproxy::cdp::{self, PLUGIN_MESSAGE_ID_BASE};
use cdproxy::error::ErrorMonitor;
use cdproxy::plugins::{HookResult, HookSet, PluginContext, PluginRuntime, ProxyPlugin};
use cdproxy::registry::{Session, SessionRegistry};
use cdproxy::relay::{MessageRelay, SessionLink, Source};
use cdproxy::validator::PermissiveValidator;

type ClientEnd = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Mock browser helpers
// =============================================================================

/// Start a mock browser that records every frame it receives and sends
/// whatever the test pushes through the emit channel.
async fn start_scripted_browser() -> (
    SocketAddr,
    mpsc::UnboundedReceiver<Value>,
    mpsc::UnboundedSender<Value>,
    JoinHandle<()>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (record_tx, record_rx) = mpsc::unbounded_channel();
    let (emit_tx, mut emit_rx) = mpsc::unbounded_channel::<Value>();
    let handle = tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();
            loop {
                tokio::select! {
                    msg = source.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let frame: Value = serde_json::from_str(&text).unwrap();
                            let _ = record_tx.send(frame);
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                    frame = emit_rx.recv() => match frame {
                        Some(frame) => {
                            sink.send(Message::Text(frame.to_string().into()))
                                .await
                                .unwrap();
                        }
                        None => break,
                    }
                }
            }
        }
    });
    (addr, record_rx, emit_tx, handle)
}

/// Start a mock browser that accepts frames but never responds.
async fn start_silent_browser() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (_sink, mut source) = ws.split();
            while source.next().await.is_some() {}
        }
    });
    (addr, handle)
}

// =============================================================================
// Proxy core harness
// =============================================================================

struct ProxyCore {
    relay: Arc<MessageRelay>,
    registry: Arc<SessionRegistry>,
    plugins: Arc<PluginRuntime>,
    errors: Arc<ErrorMonitor>,
}

fn proxy_core() -> ProxyCore {
    let errors = Arc::new(ErrorMonitor::new());
    let registry = Arc::new(SessionRegistry::new());
    let plugins = Arc::new(PluginRuntime::new(
        Arc::clone(&registry),
        Arc::clone(&errors),
    ));
    let relay = Arc::new(MessageRelay::new(
        Arc::clone(&registry),
        Arc::clone(&plugins),
        Arc::new(PermissiveValidator),
        Arc::clone(&errors),
        Arc::new(AtomicBool::new(false)),
    ));
    ProxyCore {
        relay,
        registry,
        plugins,
        errors,
    }
}

/// Produce a connected client socket pair: the server half (to attach to
/// the relay) and the client half (driven by the test).
async fn client_pair() -> (WebSocketStream<TcpStream>, ClientEnd) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = tokio::spawn(async move {
        tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap()
            .0
    });
    let (stream, _) = listener.accept().await.unwrap();
    let server_ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    let client_end = connect.await.unwrap();
    (server_ws, client_end)
}

/// Establish a complete session through the relay.
async fn open_session(core: &ProxyCore, browser_addr: SocketAddr) -> (Arc<Session>, ClientEnd) {
    let (browser_ws, _) = tokio_tungstenite::connect_async(format!("ws://{browser_addr}"))
        .await
        .unwrap();
    let (client_ws, client_end) = client_pair().await;

    let (link, receivers) = SessionLink::new();
    let session = core.registry.create(
        link,
        format!("ws://{browser_addr}"),
        "/devtools/browser/test",
    );
    core.relay.handle_connection(&session.id).await.unwrap();
    core.relay
        .attach(&session, client_ws, receivers.client_rx, Source::Client);
    core.relay
        .attach(&session, browser_ws, receivers.browser_rx, Source::Browser);
    (session, client_end)
}

async fn send_json(ws: &mut ClientEnd, frame: &Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

async fn recv_recorded(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for browser to receive a frame")
        .expect("browser recording channel closed")
}

/// Next text frame the client observes (skipping control frames).
async fn client_recv(ws: &mut ClientEnd) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Assert the client observes nothing for a moment.
async fn client_expect_silence(ws: &mut ClientEnd, wait: Duration) {
    let got = tokio::time::timeout(wait, ws.next()).await;
    assert!(got.is_err(), "expected silence, got {got:?}");
}

// =============================================================================
// Test plugins
// =============================================================================

struct MethodBlocker(&'static str);

#[async_trait]
impl ProxyPlugin for MethodBlocker {
    fn name(&self) -> &str {
        "method-blocker"
    }
    fn hooks(&self) -> HookSet {
        HookSet::requests()
    }
    async fn on_request(&self, _cx: &PluginContext<'_>, request: Value) -> HookResult {
        if cdp::method(&request) == Some(self.0) {
            return Ok(None);
        }
        Ok(Some(request))
    }
}

struct UserAgentTagger;

#[async_trait]
impl ProxyPlugin for UserAgentTagger {
    fn name(&self) -> &str {
        "user-agent-tagger"
    }
    fn hooks(&self) -> HookSet {
        HookSet::requests()
    }
    async fn on_request(&self, _cx: &PluginContext<'_>, mut request: Value) -> HookResult {
        if cdp::method(&request) == Some("Network.setUserAgentOverride") {
            if let Some(ua) = request["params"]["userAgent"].as_str() {
                request["params"]["userAgent"] = json!(format!("{ua} (proxied)"));
            }
        }
        Ok(Some(request))
    }
}

/// On `Page.frameAttached`, issues `Page.createIsolatedWorld` to the
/// browser and waits for its response before letting the event through.
struct WorldCreator;

#[async_trait]
impl ProxyPlugin for WorldCreator {
    fn name(&self) -> &str {
        "world-creator"
    }
    fn hooks(&self) -> HookSet {
        HookSet::events()
    }
    async fn on_event(&self, cx: &PluginContext<'_>, event: Value) -> HookResult {
        if cdp::method(&event) == Some("Page.frameAttached") {
            let frame_id = event["params"]["frameId"].clone();
            cx.send_cdp_command(
                "/devtools/page/abc",
                cx.session_id,
                json!({"method": "Page.createIsolatedWorld", "params": {"frameId": frame_id}}),
            )
            .await
            .map_err(|e| e.to_string())?;
        }
        Ok(Some(event))
    }
}

/// Emits a synthetic client event for every request it sees.
struct Notifier;

#[async_trait]
impl ProxyPlugin for Notifier {
    fn name(&self) -> &str {
        "notifier"
    }
    fn hooks(&self) -> HookSet {
        HookSet::requests()
    }
    async fn on_request(&self, cx: &PluginContext<'_>, request: Value) -> HookResult {
        let event = json!({"method": "Proxy.requestSeen", "params": {"method": cdp::method(&request)}});
        cx.emit_client_event(cx.session_id, &event)
            .map_err(|e| e.to_string())?;
        Ok(Some(request))
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn passthrough_request_and_response() {
    let core = proxy_core();
    let (browser_addr, mut recorded, emit, _browser) = start_scripted_browser().await;
    let (_session, mut client) = open_session(&core, browser_addr).await;

    let request = json!({"id": 1, "method": "Target.getTargets"});
    send_json(&mut client, &request).await;
    assert_eq!(recv_recorded(&mut recorded).await, request);

    let response = json!({"id": 1, "result": {"targetInfos": []}});
    emit.send(response.clone()).unwrap();
    assert_eq!(client_recv(&mut client).await, response);
}

#[tokio::test]
async fn blocking_plugin_suppresses_the_frame() {
    let core = proxy_core();
    core.plugins
        .register(Box::new(MethodBlocker("Security.disable")));
    let (browser_addr, mut recorded, _emit, _browser) = start_scripted_browser().await;
    let (_session, mut client) = open_session(&core, browser_addr).await;

    send_json(&mut client, &json!({"id": 7, "method": "Security.disable"})).await;
    send_json(&mut client, &json!({"id": 8, "method": "Page.enable"})).await;

    // The browser sees only the second frame: the blocked one never
    // arrived, and no response for it ever reaches the client.
    let first = recv_recorded(&mut recorded).await;
    assert_eq!(first["method"], "Page.enable");
    client_expect_silence(&mut client, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn mutating_plugin_rewrites_params() {
    let core = proxy_core();
    core.plugins.register(Box::new(UserAgentTagger));
    let (browser_addr, mut recorded, _emit, _browser) = start_scripted_browser().await;
    let (_session, mut client) = open_session(&core, browser_addr).await;

    send_json(
        &mut client,
        &json!({"id": 3, "method": "Network.setUserAgentOverride", "params": {"userAgent": "X"}}),
    )
    .await;

    let seen = recv_recorded(&mut recorded).await;
    assert_eq!(seen["params"]["userAgent"], "X (proxied)");
    assert_eq!(seen["id"], 3);
}

#[tokio::test]
async fn plugin_command_is_correlated_and_never_reaches_the_client() {
    let core = proxy_core();
    core.plugins.register(Box::new(WorldCreator));
    let (browser_addr, mut recorded, emit, _browser) = start_scripted_browser().await;
    let (_session, mut client) = open_session(&core, browser_addr).await;

    // The browser raises an event the plugin reacts to.
    emit.send(json!({"method": "Page.frameAttached", "params": {"frameId": "f1"}}))
        .unwrap();

    // The plugin's command arrives at the browser with a high id.
    let command = recv_recorded(&mut recorded).await;
    let id = command["id"].as_u64().unwrap();
    assert!(id >= PLUGIN_MESSAGE_ID_BASE);
    assert_eq!(command["method"], "Page.createIsolatedWorld");
    assert_eq!(command["params"]["frameId"], "f1");

    // Answer it; the hook completes and the original event is forwarded.
    emit.send(json!({"id": id, "result": {"executionContextId": 7}}))
        .unwrap();
    let event = client_recv(&mut client).await;
    assert_eq!(event["method"], "Page.frameAttached");

    // The command response itself was consumed by the runtime.
    client_expect_silence(&mut client, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn frames_sent_before_browser_ready_drain_in_order() {
    let core = proxy_core();
    let (browser_addr, mut recorded, _emit, _browser) = start_scripted_browser().await;

    // Client side comes up first.
    let (client_ws, mut client) = client_pair().await;
    let (link, receivers) = SessionLink::new();
    let session = core.registry.create(
        link,
        format!("ws://{browser_addr}"),
        "/devtools/browser/test",
    );
    core.relay.handle_connection(&session.id).await.unwrap();
    core.relay
        .attach(&session, client_ws, receivers.client_rx, Source::Client);

    for i in 1..=3 {
        send_json(&mut client, &json!({"id": i, "method": "Page.enable"})).await;
    }

    // Nothing was delivered yet: the upstream socket is not open.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(recorded.try_recv().is_err());

    // The browser connects; exactly the three frames drain, in order.
    let (browser_ws, _) = tokio_tungstenite::connect_async(format!("ws://{browser_addr}"))
        .await
        .unwrap();
    core.relay
        .attach(&session, browser_ws, receivers.browser_rx, Source::Browser);

    for i in 1..=3 {
        let frame = recv_recorded(&mut recorded).await;
        assert_eq!(frame["id"], i);
    }
    assert!(recorded.try_recv().is_err());
}

#[tokio::test]
async fn sessions_are_isolated() {
    let core = proxy_core();
    let (addr_one, mut recorded_one, _emit_one, _browser_one) = start_scripted_browser().await;
    let (addr_two, mut recorded_two, _emit_two, _browser_two) = start_scripted_browser().await;

    let (_session_one, mut client_one) = open_session(&core, addr_one).await;
    let (_session_two, mut client_two) = open_session(&core, addr_two).await;

    // Interleave sends across both sessions.
    for i in 0..3 {
        send_json(&mut client_one, &json!({"id": i, "method": "One.only"})).await;
        send_json(&mut client_two, &json!({"id": i + 100, "method": "Two.only"})).await;
    }

    for i in 0..3 {
        let frame = recv_recorded(&mut recorded_one).await;
        assert_eq!(frame["method"], "One.only");
        assert_eq!(frame["id"], i);
    }
    for i in 0..3 {
        let frame = recv_recorded(&mut recorded_two).await;
        assert_eq!(frame["method"], "Two.only");
        assert_eq!(frame["id"], i + 100);
    }
    assert!(recorded_one.try_recv().is_err());
    assert!(recorded_two.try_recv().is_err());
}

#[tokio::test]
async fn filtered_frames_preserve_relative_order() {
    let core = proxy_core();
    core.plugins.register(Box::new(MethodBlocker("Drop.me")));
    let (browser_addr, mut recorded, _emit, _browser) = start_scripted_browser().await;
    let (_session, mut client) = open_session(&core, browser_addr).await;

    for i in 0..6 {
        let method = if i % 2 == 0 { "Keep.me" } else { "Drop.me" };
        send_json(&mut client, &json!({"id": i, "method": method})).await;
    }

    // The delivered sequence is the kept subsequence, in send order.
    for expected in [0, 2, 4] {
        let frame = recv_recorded(&mut recorded).await;
        assert_eq!(frame["id"], expected);
        assert_eq!(frame["method"], "Keep.me");
    }
    assert!(recorded.try_recv().is_err());
}

#[tokio::test]
async fn synthetic_events_reach_the_client() {
    let core = proxy_core();
    core.plugins.register(Box::new(Notifier));
    let (browser_addr, mut recorded, _emit, _browser) = start_scripted_browser().await;
    let (_session, mut client) = open_session(&core, browser_addr).await;

    send_json(&mut client, &json!({"id": 1, "method": "Page.enable"})).await;

    let event = client_recv(&mut client).await;
    assert_eq!(event["method"], "Proxy.requestSeen");
    assert_eq!(event["params"]["method"], "Page.enable");
    // The organic request still made it upstream.
    assert_eq!(recv_recorded(&mut recorded).await["id"], 1);
}

/// Records the outcome of one plugin command so the test can inspect it.
struct CommandProber {
    outcome: Arc<tokio::sync::Mutex<Option<Result<Value, cdproxy::error::ProxyError>>>>,
}

#[async_trait]
impl ProxyPlugin for CommandProber {
    fn name(&self) -> &str {
        "command-prober"
    }
    fn hooks(&self) -> HookSet {
        HookSet::events()
    }
    async fn on_event(&self, cx: &PluginContext<'_>, event: Value) -> HookResult {
        let result = cx
            .send_cdp_command(
                "/devtools/page/abc",
                cx.session_id,
                json!({"method": "Page.enable"}),
            )
            .await;
        *self.outcome.lock().await = Some(result);
        Ok(Some(event))
    }
}

#[tokio::test]
async fn plugin_command_times_out_without_a_response() {
    let core = proxy_core();
    let outcome = Arc::new(tokio::sync::Mutex::new(None));
    core.plugins.register(Box::new(CommandProber {
        outcome: Arc::clone(&outcome),
    }));
    let (browser_addr, _browser) = start_silent_browser().await;
    let (session, _client) = open_session(&core, browser_addr).await;

    let started = tokio::time::Instant::now();
    let _ = core
        .plugins
        .process(&session.id, json!({"method": "Test.tick"}))
        .await;

    let result = outcome.lock().await.take().expect("prober hook did not run");
    let err = result.unwrap_err();
    assert!(err.message.contains("no response"));
    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test]
async fn teardown_removes_the_session_from_the_registry() {
    let core = proxy_core();
    let (browser_addr, _recorded, _emit, _browser) = start_scripted_browser().await;
    let (session, client) = open_session(&core, browser_addr).await;
    assert!(core.registry.get(&session.id).is_some());

    drop(client);
    // Client socket closing tears the whole session down.
    tokio::time::timeout(Duration::from_secs(2), session.link.closed())
        .await
        .expect("session did not close");
    // Cleanup includes unlinking and clearing error counters.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(core.registry.get(&session.id).is_none());
    assert_eq!(
        core.errors
            .count(cdproxy::error::ErrorKind::Connection, Some(&session.id)),
        0
    );
}
