use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ErrorMonitor, ProxyError, codes};
use crate::httpio::{self, HttpResponse, RequestHead};
use crate::rewrite;

/// Forwards non-upgrade HTTP requests to the browser's debug endpoint.
///
/// Requests pass through verbatim apart from the `Host` header (repointed
/// at the browser) and `Connection: close` (each exchange uses a fresh
/// connection). JSON response bodies get their WebSocket URLs rewritten
/// to the proxy; everything else is returned byte-identical.
pub struct HttpGateway {
    proxy_port: u16,
    errors: Arc<ErrorMonitor>,
}

impl HttpGateway {
    #[must_use]
    pub fn new(proxy_port: u16, errors: Arc<ErrorMonitor>) -> Self {
        Self { proxy_port, errors }
    }

    /// Serve one already-parsed client request and write the response
    /// back on the client's stream.
    pub async fn handle(
        &self,
        client: &mut TcpStream,
        head: RequestHead,
        body: Vec<u8>,
        browser_port: u16,
    ) {
        debug!(method = %head.method, target = %head.target, "proxying HTTP request");
        match self.forward(&head, &body, browser_port).await {
            Ok(mut response) => {
                self.rewrite_if_json(&mut response);
                let _ = httpio::write_response(
                    client,
                    response.status,
                    &response.reason,
                    &response.headers,
                    &response.body,
                )
                .await;
            }
            Err(e) => {
                let err = ProxyError::connection(
                    codes::HTTP_FORWARD,
                    format!("forwarding {} {} failed: {e}", head.method, head.target),
                );
                self.errors.handle(&err, None);
                let body = serde_json::json!({"error": err.message}).to_string();
                let headers = vec![("Content-Type".to_string(), "application/json".to_string())];
                let _ = httpio::write_response(
                    client,
                    500,
                    "Internal Server Error",
                    &headers,
                    body.as_bytes(),
                )
                .await;
            }
        }
    }

    async fn forward(
        &self,
        head: &RequestHead,
        body: &[u8],
        browser_port: u16,
    ) -> std::io::Result<HttpResponse> {
        let mut upstream = TcpStream::connect(("127.0.0.1", browser_port)).await?;

        let mut headers: Vec<(String, String)> = head
            .headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("host") && !name.eq_ignore_ascii_case("connection")
            })
            .cloned()
            .collect();
        headers.push(("Host".to_string(), format!("127.0.0.1:{browser_port}")));
        headers.push(("Connection".to_string(), "close".to_string()));

        let forwarded = RequestHead {
            method: head.method.clone(),
            target: head.target.clone(),
            version: "HTTP/1.1".to_string(),
            headers,
        };
        httpio::write_request(&mut upstream, &forwarded, body).await?;
        httpio::read_response(&mut upstream).await
    }

    /// Rewrite WebSocket URLs when the body parses as JSON; leave any
    /// other body untouched.
    fn rewrite_if_json(&self, response: &mut HttpResponse) {
        let Ok(mut parsed) = serde_json::from_slice::<serde_json::Value>(&response.body) else {
            return;
        };
        rewrite::rewrite_body(&mut parsed, self.proxy_port);
        response.body = parsed.to_string().into_bytes();
    }
}
