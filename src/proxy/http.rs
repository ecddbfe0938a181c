//! HTTP proxy (CONNECT tunneling + implicit proxying)
//!
//! The request head is parsed by hand: only the request line, the
//! `Proxy-Authorization` header, and the head/body boundary matter here.
//! CONNECT requests get a `200 Connection established` and then raw byte
//! relay; any other method is proxied implicitly by forwarding the bytes
//! already read and relaying from there.

use super::{relay, ProxyError};
use crate::task;
use crate::tunnel::Tunnel;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on the request head; anything larger is rejected
const MAX_HEAD_BYTES: usize = 8192;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";
const AUTH_REQUIRED: &[u8] =
    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n";

/// HTTP proxy server
pub struct HttpProxyServer {
    listener: TcpListener,
}

impl HttpProxyServer {
    /// Bind the local listener
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP proxy listening on {}", addr);
        Ok(Self { listener })
    }

    /// Actual bound address (useful with port 0)
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until cancelled, one task per client
    pub async fn run(self, tunnel: Arc<Tunnel>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("HTTP listener shutting down");
                    return;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("HTTP accept error: {}", e);
                            return;
                        }
                    };
                    debug!(%peer, "new HTTP connection");

                    let tunnel = Arc::clone(&tunnel);
                    let cancel = cancel.clone();
                    task::spawn_supervised("http-conn", async move {
                        if let Err(e) = handle_connection(tunnel, stream, cancel).await {
                            debug!(%peer, "HTTP connection error: {}", e);
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    tunnel: Arc<Tunnel>,
    mut stream: TcpStream,
    cancel: CancellationToken,
) -> Result<(), ProxyError> {
    let (head_end, buf) = match read_request_head(&mut stream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = stream.write_all(BAD_REQUEST).await;
            return Err(e);
        }
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| ProxyError::MalformedRequest("request head is not UTF-8".to_string()))?;
    let request_line = head.lines().next().unwrap_or("");
    let (method, target) = match parse_request_line(request_line) {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = stream.write_all(BAD_REQUEST).await;
            return Err(e);
        }
    };

    let http_config = &tunnel.app_config().http;
    if http_config.basic_auth {
        let credentials = header_value(head, "Proxy-Authorization");
        if !check_basic_auth(
            credentials,
            &http_config.basic_user,
            &http_config.basic_password,
        ) {
            warn!("rejected HTTP request with missing or bad proxy credentials");
            let _ = stream.write_all(AUTH_REQUIRED).await;
            return Err(ProxyError::AuthenticationFailed);
        }
    }

    let is_connect = method.eq_ignore_ascii_case("CONNECT");
    let dest = normalize_target(&method, &target)?;
    debug!(%method, %dest, "HTTP proxy request");

    let mut dest_stream = match tunnel.http_dest_conn(&dest).await {
        Ok(s) => s,
        Err(e) => {
            let _ = stream.write_all(BAD_GATEWAY).await;
            return Err(e.into());
        }
    };

    if is_connect {
        stream.write_all(CONNECT_ESTABLISHED).await?;
        // Bytes the client pipelined after the head belong to the tunnel
        if buf.len() > head_end {
            dest_stream.write_all(&buf[head_end..]).await?;
        }
    } else {
        // Implicit proxying: forward everything read so far verbatim
        dest_stream.write_all(&buf).await?;
    }

    relay(stream, dest_stream, &cancel).await;
    Ok(())
}

/// Read until the blank line ending the head; returns (head end offset,
/// everything read so far). Bytes past the head stay in the buffer.
async fn read_request_head<S>(stream: &mut S) -> Result<(usize, Vec<u8>), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::MalformedRequest(
                "connection closed before end of request head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_head_end(&buf) {
            return Ok((pos, buf));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::MalformedRequest(format!(
                "request head exceeds {} bytes",
                MAX_HEAD_BYTES
            )));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Split `METHOD target HTTP/x.y` into method and target
fn parse_request_line(line: &str) -> Result<(String, String), ProxyError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(method), Some(target)) => Ok((method.to_string(), target.to_string())),
        _ => Err(ProxyError::MalformedRequest(format!(
            "invalid request line: {:?}",
            line
        ))),
    }
}

/// Reduce the request target to a dialable `host:port`.
///
/// CONNECT targets are already authority-form (default port 443); other
/// methods carry an absolute URL whose authority is extracted (default
/// port 80, or 443 for https).
fn normalize_target(method: &str, target: &str) -> Result<String, ProxyError> {
    if method.eq_ignore_ascii_case("CONNECT") {
        return Ok(with_default_port(target, 443));
    }

    let (default_port, rest) = if let Some(rest) = target.strip_prefix("http://") {
        (80, rest)
    } else if let Some(rest) = target.strip_prefix("https://") {
        (443, rest)
    } else {
        (80, target)
    };

    let authority = rest.split('/').next().unwrap_or("");
    if authority.is_empty() {
        return Err(ProxyError::InvalidAddress(format!(
            "no host in target {:?}",
            target
        )));
    }
    Ok(with_default_port(authority, default_port))
}

fn with_default_port(authority: &str, default_port: u16) -> String {
    if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{}:{}", authority, default_port)
    }
}

/// Find a header value in the raw head, case-insensitive on the name
fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// Validate a `Proxy-Authorization: Basic <b64(user:password)>` value
fn check_basic_auth(value: Option<&str>, user: &str, password: &str) -> bool {
    let Some(value) = value else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    decoded == format!("{}:{}", user, password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn request_line_parsing() {
        let (method, target) = parse_request_line("CONNECT example.com:443 HTTP/1.1").unwrap();
        assert_eq!(method, "CONNECT");
        assert_eq!(target, "example.com:443");

        let (method, target) = parse_request_line("GET http://example.com/path HTTP/1.1").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(target, "http://example.com/path");

        assert!(parse_request_line("").is_err());
        assert!(parse_request_line("GET").is_err());
    }

    #[test]
    fn connect_targets_default_to_443() {
        assert_eq!(
            normalize_target("CONNECT", "example.com:8443").unwrap(),
            "example.com:8443"
        );
        assert_eq!(
            normalize_target("CONNECT", "example.com").unwrap(),
            "example.com:443"
        );
    }

    #[test]
    fn absolute_urls_reduce_to_authority() {
        assert_eq!(
            normalize_target("GET", "http://example.com/path?q=1").unwrap(),
            "example.com:80"
        );
        assert_eq!(
            normalize_target("GET", "http://example.com:8080/").unwrap(),
            "example.com:8080"
        );
        assert_eq!(
            normalize_target("GET", "https://example.com/").unwrap(),
            "example.com:443"
        );
        assert_eq!(
            normalize_target("POST", "example.com/api").unwrap(),
            "example.com:80"
        );
        assert!(normalize_target("GET", "http:///path").is_err());
    }

    #[test]
    fn basic_auth_validation() {
        // base64("user:secret")
        let good = Some("Basic dXNlcjpzZWNyZXQ=");
        assert!(check_basic_auth(good, "user", "secret"));
        assert!(!check_basic_auth(good, "user", "other"));
        assert!(!check_basic_auth(Some("Basic !!!!"), "user", "secret"));
        assert!(!check_basic_auth(Some("Bearer abc"), "user", "secret"));
        assert!(!check_basic_auth(None, "user", "secret"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let head = "GET / HTTP/1.1\r\nHost: example.com\r\nproxy-authorization: Basic abc\r\n\r\n";
        assert_eq!(header_value(head, "Proxy-Authorization"), Some("Basic abc"));
        assert_eq!(header_value(head, "Host"), Some("example.com"));
        assert_eq!(header_value(head, "Absent"), None);
    }

    #[tokio::test]
    async fn head_reader_finds_boundary_and_keeps_extra_bytes() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nEXTRA")
            .await
            .unwrap();
        drop(client);

        let (head_end, buf) = read_request_head(&mut server).await.unwrap();
        assert!(std::str::from_utf8(&buf[..head_end])
            .unwrap()
            .ends_with("\r\n\r\n"));
        assert_eq!(&buf[head_end..], b"EXTRA");
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let garbage = vec![b'a'; MAX_HEAD_BYTES + 100];
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        client.write_all(&garbage).await.unwrap();
        drop(client);

        let err = read_request_head(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }
}
