//! One-shot localhost listener for the OAuth redirect.

use crate::error::{DriveError, DriveResult};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use url::Url;

const SUCCESS_HTML: &str = "<h1>Successful authentication!</h1><p>You may close this window.</p>";
const MAX_REQUEST_BYTES: usize = 8192;
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF_MS: u64 = 50;
const MAX_ACCEPT_FAILURES: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Deliver(String),
    StateMismatch,
    MissingCode { error: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackQuery {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
}

impl CallbackQuery {
    pub fn from_url(url: &Url) -> Self {
        let mut query = CallbackQuery::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "state" => query.state = Some(value.into_owned()),
                "code" => query.code = Some(value.into_owned()),
                "error" => query.error = Some(value.into_owned()),
                _ => {}
            }
        }
        query
    }

    pub fn evaluate(&self, expected_state: &str) -> CallbackOutcome {
        let state = self.state.as_deref().unwrap_or_default();
        if !constant_time_eq(state.as_bytes(), expected_state.as_bytes()) {
            return CallbackOutcome::StateMismatch;
        }
        match self.code.as_deref() {
            Some(code) if !code.is_empty() => CallbackOutcome::Deliver(code.to_string()),
            _ => CallbackOutcome::MissingCode {
                error: self.error.clone(),
            },
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Owns the bound port until a code arrives, the wait times out, or the
/// listener is dropped.
pub struct CallbackListener {
    addrs: Vec<SocketAddr>,
    code_rx: oneshot::Receiver<String>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Binds `127.0.0.1:port` and `[::1]:port`; one of the two is enough.
    /// Port 0 picks an ephemeral port shared by both listeners.
    pub async fn bind(
        port: u16,
        path: impl Into<String>,
        expected_state: impl Into<String>,
    ) -> DriveResult<Self> {
        let listeners = bind_loopback(port).await?;
        let addrs = listeners
            .iter()
            .map(|l| l.local_addr())
            .collect::<Result<Vec<_>, _>>()?;
        let (code_tx, code_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tracing::info!(?addrs, "Starting OAuth callback listener");
        let task = tokio::spawn(serve(
            listeners,
            Arc::from(path.into()),
            Arc::from(expected_state.into()),
            code_tx,
            shutdown_rx,
        ));

        Ok(Self {
            addrs,
            code_rx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addrs[0]
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Waits for the first valid code. The listener is shut down before this
    /// returns, whatever the outcome.
    pub async fn wait_for_code(mut self, timeout: Duration) -> DriveResult<String> {
        let result = tokio::time::timeout(timeout, &mut self.code_rx).await;
        self.shutdown().await;
        match result {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(_)) => Err(DriveError::Authorization(
                "callback listener stopped before a code was received".to_string(),
            )),
            Err(_) => Err(DriveError::Timeout(format!(
                "no authorization code received within {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        tracing::info!(addrs = ?self.addrs, "OAuth callback listener closed");
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn bind_loopback(port: u16) -> DriveResult<Vec<TcpListener>> {
    let mut listeners = Vec::with_capacity(2);
    let mut errors = Vec::new();

    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
        Ok(listener) => listeners.push(listener),
        Err(e) => errors.push(format!("127.0.0.1:{port} ({e})")),
    }
    // Follow the ephemeral port chosen for IPv4 so both share one redirect URI.
    let v6_port = match listeners.first() {
        Some(v4) => v4.local_addr()?.port(),
        None => port,
    };
    match TcpListener::bind((Ipv6Addr::LOCALHOST, v6_port)).await {
        Ok(listener) => listeners.push(listener),
        Err(e) => errors.push(format!("[::1]:{v6_port} ({e})")),
    }

    if listeners.is_empty() {
        return Err(DriveError::Authorization(format!(
            "cannot bind callback listener: {}",
            errors.join("; ")
        )));
    }
    if !errors.is_empty() {
        tracing::debug!("Partial callback bind: {}", errors.join("; "));
    }
    Ok(listeners)
}

async fn accept_any(listeners: &[TcpListener]) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listeners {
        [only] => only.accept().await,
        [first, second, ..] => tokio::select! {
            accepted = first.accept() => accepted,
            accepted = second.accept() => accepted,
        },
        [] => std::future::pending().await,
    }
}

fn accept_backoff(consecutive_failures: u32) -> Duration {
    Duration::from_millis(ACCEPT_BACKOFF_MS << consecutive_failures.min(5))
}

async fn serve(
    listeners: Vec<TcpListener>,
    path: Arc<str>,
    expected_state: Arc<str>,
    code_tx: oneshot::Sender<String>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut code_tx = Some(code_tx);
    let mut handlers = JoinSet::new();
    let mut accept_failures = 0u32;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = accept_any(&listeners) => match accepted {
                Ok((socket, peer)) => {
                    accept_failures = 0;
                    let path = Arc::clone(&path);
                    let expected_state = Arc::clone(&expected_state);
                    handlers.spawn(async move {
                        match handle_connection(socket, &path, &expected_state).await {
                            Ok(code) => code,
                            Err(e) => {
                                tracing::warn!(%peer, "OAuth callback request failed: {e}");
                                None
                            }
                        }
                    });
                }
                Err(e) => {
                    accept_failures += 1;
                    if accept_failures >= MAX_ACCEPT_FAILURES {
                        tracing::error!("OAuth callback listener giving up after {accept_failures} accept errors: {e}");
                        break;
                    }
                    tracing::warn!("OAuth callback accept failed: {e}");
                    tokio::time::sleep(accept_backoff(accept_failures)).await;
                }
            },
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Ok(Some(code)) = joined {
                    if let Some(tx) = code_tx.take() {
                        let _ = tx.send(code);
                    }
                    break;
                }
            }
        }
    }
    // Dropping the listeners releases the port; dropping the set aborts idle connections.
}

async fn handle_connection(
    mut socket: TcpStream,
    path: &str,
    expected_state: &str,
) -> DriveResult<Option<String>> {
    let request = tokio::time::timeout(READ_TIMEOUT, read_request_head(&mut socket))
        .await
        .map_err(|_| DriveError::Timeout("reading callback request".to_string()))??;

    let Some((method, target)) = parse_request_line(&request) else {
        write_response(&mut socket, 400, "Bad Request", "Malformed request").await?;
        return Ok(None);
    };
    if method != "GET" {
        write_response(&mut socket, 405, "Method Not Allowed", "Only GET is supported").await?;
        return Ok(None);
    }
    let url = match Url::parse(&format!("http://localhost{target}")) {
        Ok(url) => url,
        Err(_) => {
            write_response(&mut socket, 400, "Bad Request", "Malformed request target").await?;
            return Ok(None);
        }
    };
    if url.path() != path {
        write_response(&mut socket, 404, "Not Found", "Not found").await?;
        return Ok(None);
    }

    match CallbackQuery::from_url(&url).evaluate(expected_state) {
        CallbackOutcome::StateMismatch => {
            tracing::warn!("Invalid oauth state");
            write_response(&mut socket, 500, "Internal Server Error", "Invalid oauth state").await?;
            Ok(None)
        }
        CallbackOutcome::MissingCode { error } => {
            tracing::warn!(provider_error = ?error, "No code has been received!");
            write_response(
                &mut socket,
                500,
                "Internal Server Error",
                "No code has been received!",
            )
            .await?;
            Ok(None)
        }
        CallbackOutcome::Deliver(code) => {
            tracing::info!("Received authorization code");
            write_response(&mut socket, 200, "OK", SUCCESS_HTML).await?;
            Ok(Some(code))
        }
    }
}

async fn read_request_head(socket: &mut TcpStream) -> DriveResult<String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn parse_request_line(request: &str) -> Option<(&str, &str)> {
    let mut parts = request.lines().next()?.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    target.starts_with('/').then_some((method, target))
}

async fn write_response(
    socket: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &str,
) -> DriveResult<()> {
    let content_type = if status == 200 {
        "text/html; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    socket.write_all(response.as_bytes()).await?;
    socket.flush().await?;
    let _ = socket.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "/auth/google/callback";

    async fn listener(state: &str) -> CallbackListener {
        CallbackListener::bind(0, PATH, state)
            .await
            .unwrap()
    }

    fn callback_url(listener: &CallbackListener, query: &str) -> String {
        format!("http://{}{PATH}?{query}", listener.local_addr())
    }

    #[test]
    fn matching_state_with_code_delivers() {
        let url = Url::parse("http://localhost/cb?state=abc123&code=XYZ").unwrap();
        assert_eq!(
            CallbackQuery::from_url(&url).evaluate("abc123"),
            CallbackOutcome::Deliver("XYZ".to_string())
        );
    }

    #[test]
    fn wrong_state_never_delivers() {
        for query in ["state=wrong&code=XYZ", "state=wrong", "code=XYZ", ""] {
            let url = Url::parse(&format!("http://localhost/cb?{query}")).unwrap();
            assert_eq!(
                CallbackQuery::from_url(&url).evaluate("abc123"),
                CallbackOutcome::StateMismatch,
                "query {query:?}"
            );
        }
    }

    #[test]
    fn empty_code_is_missing() {
        let url = Url::parse("http://localhost/cb?state=abc123&code=&error=access_denied").unwrap();
        assert_eq!(
            CallbackQuery::from_url(&url).evaluate("abc123"),
            CallbackOutcome::MissingCode {
                error: Some("access_denied".to_string())
            }
        );
    }

    #[test]
    fn parses_request_line() {
        assert_eq!(
            parse_request_line("GET /cb?x=1 HTTP/1.1\r\nHost: a\r\n\r\n"),
            Some(("GET", "/cb?x=1"))
        );
        assert_eq!(parse_request_line("garbage"), None);
    }

    #[tokio::test]
    async fn valid_callback_delivers_code() {
        let listener = listener("abc123").await;
        let url = callback_url(&listener, "state=abc123&code=XYZ");

        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.text().await.unwrap().contains("Successful authentication!"));

        let code = listener.wait_for_code(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, "XYZ");
    }

    #[tokio::test]
    async fn wrong_state_is_rejected_and_listener_keeps_waiting() {
        let listener = listener("abc123").await;

        let response = reqwest::get(callback_url(&listener, "state=wrong&code=XYZ"))
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        assert_eq!(response.text().await.unwrap(), "Invalid oauth state");

        let response = reqwest::get(callback_url(&listener, "state=abc123"))
            .await
            .unwrap();
        assert_eq!(response.status(), 500);

        let response = reqwest::get(callback_url(&listener, "state=abc123&code=REAL"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let code = listener.wait_for_code(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, "REAL");
    }

    #[tokio::test]
    async fn rejected_callback_times_out() {
        let listener = listener("abc123").await;

        let response = reqwest::get(callback_url(&listener, "state=wrong&code=XYZ"))
            .await
            .unwrap();
        assert_eq!(response.status(), 500);

        let err = listener
            .wait_for_code(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::Timeout(_)));
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let listener = listener("abc123").await;
        let url = format!("http://{}/favicon.ico", listener.local_addr());

        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn port_is_released_after_code() {
        let listener = listener("abc123").await;
        let addr = listener.local_addr();

        reqwest::get(callback_url(&listener, "state=abc123&code=XYZ"))
            .await
            .unwrap();
        listener.wait_for_code(Duration::from_secs(5)).await.unwrap();

        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn port_is_released_after_timeout() {
        let listener = listener("abc123").await;
        let addr = listener.local_addr();

        let _ = listener.wait_for_code(Duration::from_millis(50)).await;

        assert!(TcpListener::bind(addr).await.is_ok());
    }

    #[tokio::test]
    async fn idle_connection_does_not_block_real_callback() {
        let listener = listener("abc123").await;
        let _idle = TcpStream::connect(listener.local_addr()).await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap();
        let response = client
            .get(callback_url(&listener, "state=abc123&code=XYZ"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let code = listener.wait_for_code(Duration::from_secs(1)).await.unwrap();
        assert_eq!(code, "XYZ");
    }

    #[tokio::test]
    async fn both_loopback_families_share_one_port() {
        let listener = listener("abc123").await;
        let port = listener.local_addr().port();
        assert!(listener.local_addr().ip().is_loopback());
        assert!(listener.local_addrs().iter().all(|a| a.port() == port));

        // IPv6 may be disabled on the host; only exercise it when it bound.
        let target = listener
            .local_addrs()
            .iter()
            .find(|a| a.is_ipv6())
            .copied()
            .unwrap_or_else(|| listener.local_addr());
        let url = format!("http://{target}{PATH}?state=abc123&code=V6");
        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), 200);

        let code = listener.wait_for_code(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, "V6");
    }

    #[test]
    fn accept_backoff_grows_and_is_capped() {
        assert_eq!(accept_backoff(1), Duration::from_millis(100));
        assert!(accept_backoff(3) > accept_backoff(1));
        assert_eq!(accept_backoff(5), accept_backoff(50));
        assert!(accept_backoff(50) <= Duration::from_secs(2));
    }
}
