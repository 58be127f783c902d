use std::io;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::chrome::BrowserSupervisor;
use crate::config::ProxyConfig;
use crate::error::{ErrorMonitor, ProxyError, codes};
use crate::http_proxy::HttpGateway;
use crate::httpio::{self, RequestHead};
use crate::plugins::{self, PluginRuntime};
use crate::registry::SessionRegistry;
use crate::relay::{MessageRelay, SessionLink, Source};
use crate::validator::PermissiveValidator;

/// Composes every component and runs the accept loop.
pub struct ProxyServer {
    config: ProxyConfig,
    errors: Arc<ErrorMonitor>,
    registry: Arc<SessionRegistry>,
    plugins: Arc<PluginRuntime>,
    relay: Arc<MessageRelay>,
    supervisor: Arc<BrowserSupervisor>,
    gateway: HttpGateway,
}

impl ProxyServer {
    #[must_use]
    pub fn new(config: ProxyConfig) -> Self {
        let errors = Arc::new(ErrorMonitor::new());
        let registry = Arc::new(SessionRegistry::new());
        let plugin_runtime = Arc::new(PluginRuntime::new(
            Arc::clone(&registry),
            Arc::clone(&errors),
        ));
        for entry in plugins::builtin() {
            if !entry.disabled {
                plugin_runtime.register((entry.build)());
            }
        }
        let supervisor = Arc::new(BrowserSupervisor::new(
            config.supervisor.clone(),
            Arc::clone(&errors),
        ));
        let relay = Arc::new(MessageRelay::new(
            Arc::clone(&registry),
            Arc::clone(&plugin_runtime),
            Arc::new(PermissiveValidator),
            Arc::clone(&errors),
            supervisor.killing_flag(),
        ));
        let gateway = HttpGateway::new(config.port, Arc::clone(&errors));

        Self {
            config,
            errors,
            registry,
            plugins: plugin_runtime,
            relay,
            supervisor,
            gateway,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn plugins(&self) -> &Arc<PluginRuntime> {
        &self.plugins
    }

    /// Bind the listener, start the browser, and serve until a shutdown
    /// signal or fatal error.
    ///
    /// # Errors
    ///
    /// Returns the startup failure or the fatal error that ended the
    /// run; either way the caller should exit with status 1.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        // Browser startup and listener bind proceed concurrently.
        let (bound, started) = tokio::join!(
            TcpListener::bind(("127.0.0.1", self.config.port)),
            self.supervisor.start()
        );
        let listener = bound.map_err(|e| {
            let err = ProxyError::resource(
                codes::BROWSER_START,
                format!("could not bind port {}: {e}", self.config.port),
            );
            self.errors.handle(&err, None);
            err
        })?;
        let browser_url = started.map_err(|e| {
            let err: ProxyError = e.into();
            self.errors.handle(&err, None);
            err
        })?;
        info!(
            port = self.config.port,
            browser = %browser_url,
            "proxy listening"
        );

        let mut fatal = self.errors.fatal_signal();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_connection(stream).await;
                        });
                    }
                    Err(e) => warn!("accept error: {e}"),
                },
                () = shutdown_signal() => {
                    info!("shutdown signal received");
                    break;
                }
                changed = fatal.changed() => {
                    if changed.is_ok() && *fatal.borrow() {
                        error!("fatal error reported; shutting down");
                        self.shutdown().await;
                        return Err(ProxyError::resource(
                            codes::BROWSER_STOP,
                            "terminated by fatal error",
                        ));
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        self.plugins.clear_plugins().await;
        self.supervisor.stop().await;
    }

    /// Sniff one accepted connection and dispatch it: WebSocket upgrades
    /// become relay sessions, everything else goes through the HTTP
    /// gateway.
    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) {
        let head_bytes = match peek_head(&stream).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("could not read request head: {e}");
                return;
            }
        };
        let head = match httpio::parse_request_head(&head_bytes) {
            Ok(head) => head,
            Err(e) => {
                debug!("unparseable request head: {e}");
                let _ = httpio::write_response(&mut stream, 400, "Bad Request", &[], b"").await;
                return;
            }
        };

        if head.is_websocket_upgrade() {
            self.handle_upgrade(stream, &head).await;
            return;
        }

        // Now consume the request we only peeked at.
        match httpio::read_request(&mut stream).await {
            Ok((head, body)) => {
                let Some(browser_port) = self.supervisor.debug_port() else {
                    let body = serde_json::json!({"error": "browser is not running"}).to_string();
                    let headers =
                        vec![("Content-Type".to_string(), "application/json".to_string())];
                    let _ = httpio::write_response(
                        &mut stream,
                        500,
                        "Internal Server Error",
                        &headers,
                        body.as_bytes(),
                    )
                    .await;
                    return;
                };
                self.gateway.handle(&mut stream, head, body, browser_port).await;
            }
            Err(e) => debug!("bad request: {e}"),
        }
    }

    async fn handle_upgrade(&self, stream: TcpStream, head: &RequestHead) {
        let path = head.target.clone();

        // Browser-level clients get a fresh debugger URL; target-level
        // paths dial the same path on the browser's port.
        let target = if path.starts_with("/devtools/browser") {
            match self.supervisor.websocket_url().await {
                Ok(url) => url,
                Err(e) => {
                    self.errors
                        .handle(&ProxyError::connection(codes::DIAL_FAILED, e.to_string()), None);
                    return;
                }
            }
        } else {
            let Some(browser_port) = self.supervisor.debug_port() else {
                self.errors.handle(
                    &ProxyError::connection(codes::DIAL_FAILED, "browser is not running"),
                    None,
                );
                return;
            };
            format!("ws://127.0.0.1:{browser_port}{path}")
        };

        let browser_ws = match tokio_tungstenite::connect_async(target.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.errors.handle(
                    &ProxyError::connection(
                        codes::DIAL_FAILED,
                        format!("could not dial browser at {target}: {e}"),
                    ),
                    None,
                );
                return;
            }
        };
        let client_ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                self.errors.handle(
                    &ProxyError::connection(
                        codes::SOCKET_ABNORMAL,
                        format!("client handshake failed: {e}"),
                    ),
                    None,
                );
                return;
            }
        };

        let (link, receivers) = SessionLink::new();
        let session = self.registry.create(link, target.clone(), path.clone());
        if self.relay.handle_connection(&session.id).await.is_err() {
            return;
        }

        let connection_id = self
            .supervisor
            .register_connection(session.link.client_sender());
        info!(session = %session.id, path = %path, "session established");

        self.relay
            .attach(&session, client_ws, receivers.client_rx, Source::Client);
        self.relay
            .attach(&session, browser_ws, receivers.browser_rx, Source::Browser);

        let supervisor = Arc::clone(&self.supervisor);
        let session_for_cleanup = Arc::clone(&session);
        tokio::spawn(async move {
            session_for_cleanup.link.closed().await;
            supervisor.unregister_connection(connection_id);
        });
    }
}

/// Read the request head without consuming it, so a WebSocket handshake
/// can still be performed on the untouched stream.
async fn peek_head(stream: &TcpStream) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; 8192];
    loop {
        let n = stream.peek(&mut buf).await?;
        if let Some(end) = httpio::find_head_end(&buf[..n]) {
            buf.truncate(end);
            return Ok(buf);
        }
        if n == buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        // peek returns the same bytes until more arrive; back off
        // briefly instead of spinning.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
