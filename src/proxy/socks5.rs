//! SOCKS5 proxy (RFC 1928, CONNECT only, no-auth)
//!
//! Deliberately minimal: the greeting is acknowledged with "no
//! authentication required", the connect request is decoded from a fixed
//! buffer, and the destination is always dialed through the transport
//! connection. The success reply advertises 0.0.0.0:0 since clients only
//! need the connect acknowledgment.

use super::{relay, Address, ProxyError};
use crate::task;
use crate::tunnel::Tunnel;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// SOCKS protocol version
const SOCKS_VERSION: u8 = 0x05;
/// No authentication required
const METHOD_NO_AUTH: u8 = 0x00;
/// CONNECT command
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// "succeeded, bound 0.0.0.0:0"
const REPLY_SUCCESS: [u8; 10] = [SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
/// "general SOCKS server failure"
const REPLY_FAILURE: [u8; 10] = [SOCKS_VERSION, 0x01, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
}

impl Socks5Server {
    /// Bind the local listener
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 proxy listening on {}", addr);
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
                    debug!("SOCKS5 listener shutting down");
                    return;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("SOCKS5 accept error: {}", e);
                            return;
                        }
                    };
                    debug!(%peer, "new SOCKS5 connection");

                    let tunnel = Arc::clone(&tunnel);
                    let cancel = cancel.clone();
                    task::spawn_supervised("socks5-conn", async move {
                        if let Err(e) = handle_connection(tunnel, stream, cancel).await {
                            debug!(%peer, "SOCKS5 connection error: {}", e);
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
    let address = handshake(&mut stream).await?;
    debug!(%address, "SOCKS5 CONNECT");

    match tunnel.socks_dest_conn(&address.host(), address.port()).await {
        Ok(dest) => {
            stream.write_all(&REPLY_SUCCESS).await?;
            relay(stream, dest, &cancel).await;
            Ok(())
        }
        Err(e) => {
            let _ = stream.write_all(&REPLY_FAILURE).await;
            if e.is_transport_failure() {
                // Kick off recovery without blocking this (or any) client
                tunnel.trigger_reconnect();
            }
            Err(e.into())
        }
    }
}

/// Run the minimal SOCKS5 handshake and return the requested destination
pub(crate) async fn handshake<S>(stream: &mut S) -> Result<Address, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(head[0]));
    }
    let nmethods = head[1] as usize;
    let mut methods = [0u8; 255];
    stream.read_exact(&mut methods[..nmethods]).await?;

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(request[0]));
    }
    if request[1] != CMD_CONNECT {
        return Err(ProxyError::UnsupportedCommand(request[1]));
    }

    decode_address(request[3], stream).await
}

/// Decode the destination from a fixed-size buffer into a tagged variant
async fn decode_address<S>(atyp: u8, stream: &mut S) -> Result<Address, ProxyError>
where
    S: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok(Address::V4(ip, port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| ProxyError::InvalidAddress("non-ASCII domain name".to_string()))?;
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await?;
            Ok(Address::Domain(name, u16::from_be_bytes(port_buf)))
        }
        ATYP_IPV6 => Err(ProxyError::Ipv6Unsupported),
        other => Err(ProxyError::UnsupportedAddressType(other)),
    }
}
