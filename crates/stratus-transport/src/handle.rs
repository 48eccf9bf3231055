//! The per-connection transport handle.
//!
//! A handle owns at most one HTTP/1 connection, dialed lazily on first use
//! and kept alive across operations so repeated requests reuse the socket,
//! the DNS answer, and the TLS session. Between operations nothing is torn
//! down; a handle is only re-dialed after the connection broke or an
//! operation was aborted mid-transfer.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tower::ServiceExt;
use tracing::debug;

use stratus_core::config::StorageConfig;
use stratus_core::error::{StorError, StorResult};

use crate::body::OutboundBody;

// Keepalive probes detect a dead peer within probe_idle + interval * retries,
// about 20 seconds.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_RETRIES: u32 = 3;

// window_size / RTT = 1 MB / 100 ms = 10 MB/s per connection.
const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

// curl's default proxy port, kept for configs that omit one.
const DEFAULT_PROXY_PORT: u16 = 1080;

/// Either side of the optional TLS wrapping.
enum TransportStream {
    Plain(TcpStream),
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

struct Http1Conn {
    sender: http1::SendRequest<OutboundBody>,
    task: tokio::task::JoinHandle<()>,
}

/// One tuned, reusable HTTP/1 connection to the storage endpoint.
pub struct TransportHandle {
    host: String,
    port: u16,
    is_https: bool,
    proxy: Option<(String, u16)>,
    connector: HttpConnector,
    tls: Option<tokio_native_tls::TlsConnector>,
    total_timeout: Duration,
    conn: Option<Http1Conn>,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("is_https", &self.is_https)
            .field("proxy", &self.proxy)
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl TransportHandle {
    /// Build a handle for the configured endpoint.
    ///
    /// The TLS connector (and with it any CA file) is prepared eagerly so a
    /// bad trust configuration fails at construction, not mid-pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`StorError::Transport`] when the trust source is unusable or
    /// the proxy string is malformed.
    pub fn new(config: &StorageConfig) -> StorResult<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(Duration::from_millis(config.connect_timeout_ms)));
        connector.set_keepalive(Some(KEEPALIVE_IDLE));
        connector.set_keepalive_interval(Some(KEEPALIVE_INTERVAL));
        connector.set_keepalive_retries(Some(KEEPALIVE_RETRIES));
        connector.set_send_buffer_size(Some(SOCKET_BUFFER_SIZE));
        connector.set_recv_buffer_size(Some(SOCKET_BUFFER_SIZE));

        let tls = if config.is_https {
            Some(crate::tls::build_connector(&config.ca_certs)?)
        } else {
            None
        };

        let proxy = config.proxy.as_deref().map(parse_proxy).transpose()?;

        Ok(Self {
            host: config.effective_host().to_owned(),
            port: config.effective_port(),
            is_https: config.is_https,
            proxy,
            connector,
            tls,
            total_timeout: Duration::from_millis(config.timeout_ms),
            conn: None,
        })
    }

    /// The total per-operation deadline.
    #[must_use]
    pub fn total_timeout(&self) -> Duration {
        self.total_timeout
    }

    /// Whether requests must carry an absolute-form target (plain HTTP
    /// through a proxy).
    #[must_use]
    pub fn uses_absolute_form(&self) -> bool {
        self.proxy.is_some() && !self.is_https
    }

    /// Whether a live connection is currently held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| !conn.sender.is_closed())
    }

    /// Drop the current connection; the next send re-dials.
    pub fn invalidate(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.task.abort();
        }
    }

    /// Send one request over the handle's connection, dialing if needed.
    ///
    /// The returned response carries the still-streaming body; the caller
    /// must drain it before the handle can be reused.
    ///
    /// # Errors
    ///
    /// Returns [`StorError::Transport`] on dial, TLS, or protocol failures.
    /// The connection is invalidated on failure so the next operation starts
    /// clean.
    pub async fn send(
        &mut self,
        request: http::Request<OutboundBody>,
    ) -> StorResult<http::Response<Incoming>> {
        self.ensure_connected().await?;

        let conn = self.conn.as_mut().expect("connected above");
        let result = async {
            conn.sender
                .ready()
                .await
                .map_err(|err| StorError::Transport(err.to_string()))?;
            conn.sender
                .send_request(request)
                .await
                .map_err(|err| StorError::Transport(err.to_string()))
        }
        .await;

        if result.is_err() {
            self.invalidate();
        }
        result
    }

    async fn ensure_connected(&mut self) -> StorResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.invalidate();

        let stream = self.dial().await?;
        let (sender, connection) = http1::Builder::new()
            .handshake::<_, OutboundBody>(TokioIo::new(stream))
            .await
            .map_err(|err| StorError::Transport(err.to_string()))?;

        let host = self.host.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(host, error = %err, "connection task ended");
            }
        });

        self.conn = Some(Http1Conn { sender, task });
        Ok(())
    }

    async fn dial(&mut self) -> StorResult<TransportStream> {
        let (dial_host, dial_port) = match &self.proxy {
            Some((host, port)) => (host.clone(), *port),
            None => (self.host.clone(), self.port),
        };

        debug!(
            host = self.host,
            port = self.port,
            via = ?self.proxy,
            tls = self.is_https,
            "dialing storage endpoint"
        );

        let uri: Uri = format!("http://{dial_host}:{dial_port}")
            .parse()
            .map_err(|err| StorError::Transport(format!("bad endpoint address: {err}")))?;

        let mut tcp = self
            .connector
            .clone()
            .oneshot(uri)
            .await
            .map_err(|err| {
                StorError::Transport(format!("connect to {dial_host}:{dial_port}: {err}"))
            })?
            .into_inner();

        if !self.is_https {
            return Ok(TransportStream::Plain(tcp));
        }

        if self.proxy.is_some() {
            connect_tunnel(&mut tcp, &self.host, self.port).await?;
        }

        let tls = self.tls.as_ref().expect("TLS connector built for https");
        let stream = tls
            .connect(&self.host, tcp)
            .await
            .map_err(|err| StorError::Transport(format!("TLS handshake with {}: {err}", self.host)))?;

        Ok(TransportStream::Tls(Box::new(stream)))
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.invalidate();
    }
}

/// Establish a CONNECT tunnel through an HTTP proxy.
async fn connect_tunnel(stream: &mut TcpStream, host: &str, port: u16) -> StorResult<()> {
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| StorError::Transport(format!("proxy CONNECT write: {err}")))?;

    // Read the proxy's response head; nothing follows it before the tunnel
    // opens, so a byte-at-a-time read cannot swallow tunneled data.
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|err| StorError::Transport(format!("proxy CONNECT read: {err}")))?;
        if n == 0 {
            return Err(StorError::Transport(
                "proxy closed the connection during CONNECT".to_owned(),
            ));
        }
        head.push(byte[0]);
        if head.len() > 16 * 1024 {
            return Err(StorError::Transport("oversized proxy CONNECT response".to_owned()));
        }
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or("");
    let ok = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code == "200");
    if !ok {
        return Err(StorError::Transport(format!(
            "proxy refused CONNECT: {status_line}"
        )));
    }

    Ok(())
}

/// Parse `host:port`, tolerating an `http://` prefix.
fn parse_proxy(proxy: &str) -> StorResult<(String, u16)> {
    let stripped = proxy
        .strip_prefix("http://")
        .unwrap_or(proxy)
        .trim_end_matches('/');

    match stripped.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| StorError::Transport(format!("bad proxy port in '{proxy}'")))?;
            Ok((host.to_owned(), port))
        }
        None => Ok((stripped.to_owned(), DEFAULT_PROXY_PORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn spawn_echo_server() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepts);

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        let mut head = Vec::new();
                        loop {
                            let n = match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => n,
                            };
                            head.extend_from_slice(&buf[..n]);
                            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        let response =
                            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\nok";
                        if socket.write_all(response).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        (addr, accepts)
    }

    fn test_config(addr: std::net::SocketAddr) -> StorageConfig {
        StorageConfig::new("ak", "sk")
            .with_host(addr.ip().to_string())
            .with_port(addr.port())
            .with_https(false)
    }

    fn get_request(host: &str) -> http::Request<OutboundBody> {
        http::Request::builder()
            .method(http::Method::GET)
            .version(http::Version::HTTP_10)
            .uri("/bucket/key")
            .header(http::header::HOST, host)
            .body(OutboundBody::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn test_should_send_and_receive_over_plain_http() {
        let (addr, _) = spawn_echo_server().await;
        let mut handle = TransportHandle::new(&test_config(addr)).expect("handle");

        let response = handle.send(get_request(&addr.to_string())).await.expect("send");
        assert_eq!(response.status(), http::StatusCode::OK);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn test_should_reuse_connection_across_requests() {
        let (addr, accepts) = spawn_echo_server().await;
        let mut handle = TransportHandle::new(&test_config(addr)).expect("handle");

        for _ in 0..3 {
            let response = handle.send(get_request(&addr.to_string())).await.expect("send");
            let _ = response.into_body().collect().await.expect("drain");
        }

        assert!(handle.is_connected());
        assert_eq!(accepts.load(Ordering::SeqCst), 1, "one socket for all requests");
    }

    #[tokio::test]
    async fn test_should_redial_after_invalidate() {
        let (addr, accepts) = spawn_echo_server().await;
        let mut handle = TransportHandle::new(&test_config(addr)).expect("handle");

        let response = handle.send(get_request(&addr.to_string())).await.expect("send");
        let _ = response.into_body().collect().await.expect("drain");

        handle.invalidate();
        assert!(!handle.is_connected());

        let response = handle.send(get_request(&addr.to_string())).await.expect("send");
        let _ = response.into_body().collect().await.expect("drain");
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_should_surface_connect_failure_as_transport_error() {
        // Port 1 on localhost is not listening.
        let config = StorageConfig::new("ak", "sk")
            .with_host("127.0.0.1")
            .with_port(1)
            .with_https(false)
            .with_connect_timeout_ms(2_000);
        let mut handle = TransportHandle::new(&config).expect("handle");

        let err = handle
            .send(get_request("127.0.0.1:1"))
            .await
            .expect_err("nothing listens on port 1");
        assert!(matches!(err, StorError::Transport(_)));
    }

    #[test]
    fn test_should_parse_proxy_strings() {
        assert_eq!(
            parse_proxy("proxy.local:3128").expect("host:port"),
            ("proxy.local".to_owned(), 3128)
        );
        assert_eq!(
            parse_proxy("http://proxy.local:8080/").expect("with scheme"),
            ("proxy.local".to_owned(), 8080)
        );
        assert_eq!(
            parse_proxy("proxy.local").expect("bare host"),
            ("proxy.local".to_owned(), DEFAULT_PROXY_PORT)
        );
        assert!(parse_proxy("proxy.local:notaport").is_err());
    }
}
