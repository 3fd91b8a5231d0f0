//! Plain DNS caller (RFC 1035 §4.2).
//!
//! Stateless per call: each exchange binds an ephemeral UDP socket, sends the
//! query and reads one response. A truncated response is retried over TCP
//! with length-prefix framing, matching standard client semantics. When a
//! SOCKS5 proxy is supplied the exchange runs over a tunneled TCP connection
//! instead (UDP cannot be tunneled through a CONNECT proxy).

use super::{
    query_name, read_with_length_prefix, send_with_length_prefix, Caller, Socks5Dialer,
    DEFAULT_TIMEOUT,
};
use crate::dns::wire;
use async_trait::async_trait;
use hickory_proto::op::Message;
use shunt_dns_domain::{UpstreamAddr, UpstreamError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

/// Maximum UDP DNS response size with EDNS(0)
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// DNS over UDP/TCP caller
pub struct PlainCaller {
    addr: UpstreamAddr,
    proxy: Option<Socks5Dialer>,
    timeout: Duration,
    closed: AtomicBool,
}

impl PlainCaller {
    pub fn new(addr: UpstreamAddr, proxy: Option<Socks5Dialer>) -> Self {
        Self {
            addr,
            proxy,
            timeout: DEFAULT_TIMEOUT,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn resolved_addr(&self) -> Result<SocketAddr, UpstreamError> {
        self.addr.socket_addr().ok_or_else(|| UpstreamError::Dial {
            server: self.addr.to_string(),
            reason: format!("Plain caller requires a resolved address, got: {}", self.addr),
        })
    }

    fn timeout_err(&self) -> UpstreamError {
        UpstreamError::Timeout {
            server: self.addr.to_string(),
            elapsed_ms: self.timeout.as_millis() as u64,
        }
    }

    async fn exchange_udp(&self, message_bytes: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let server_addr = self.resolved_addr()?;

        // Bind to ephemeral port (0 = OS assigns)
        let bind_addr: &str = if server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| UpstreamError::Dial {
                server: server_addr.to_string(),
                reason: format!("Failed to bind UDP socket: {}", e),
            })?;

        tokio::time::timeout(self.timeout, socket.send_to(message_bytes, server_addr))
            .await
            .map_err(|_| self.timeout_err())?
            .map_err(|e| UpstreamError::Write {
                server: server_addr.to_string(),
                reason: e.to_string(),
            })?;

        let mut recv_buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
        let (bytes_received, from_addr) =
            tokio::time::timeout(self.timeout, socket.recv_from(&mut recv_buf))
                .await
                .map_err(|_| self.timeout_err())?
                .map_err(|e| UpstreamError::Read {
                    server: server_addr.to_string(),
                    reason: e.to_string(),
                })?;

        if from_addr.ip() != server_addr.ip() {
            warn!(
                expected = %server_addr,
                received_from = %from_addr,
                "UDP response from unexpected source"
            );
        }

        recv_buf.truncate(bytes_received);
        Ok(recv_buf)
    }

    async fn exchange_tcp(&self, message_bytes: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let mut stream = match &self.proxy {
            Some(dialer) => dialer.connect(&self.addr.host(), self.addr.port()).await?,
            None => {
                let server_addr = self.resolved_addr()?;
                tokio::time::timeout(self.timeout, TcpStream::connect(server_addr))
                    .await
                    .map_err(|_| self.timeout_err())?
                    .map_err(|e| UpstreamError::Dial {
                        server: server_addr.to_string(),
                        reason: e.to_string(),
                    })?
            }
        };

        tokio::time::timeout(self.timeout, send_with_length_prefix(&mut stream, message_bytes))
            .await
            .map_err(|_| self.timeout_err())?
            .map_err(|e| UpstreamError::Write {
                server: self.addr.to_string(),
                reason: e.to_string(),
            })?;

        tokio::time::timeout(self.timeout, read_with_length_prefix(&mut stream))
            .await
            .map_err(|_| self.timeout_err())?
            .map_err(|e| UpstreamError::Read {
                server: self.addr.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Caller for PlainCaller {
    async fn call(&self, query: &Message) -> Result<Message, UpstreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UpstreamError::Closed);
        }

        let message_bytes = wire::pack_message(query)?;

        if self.proxy.is_some() {
            let response_bytes = self.exchange_tcp(&message_bytes).await?;
            return wire::unpack_message(&response_bytes);
        }

        let response_bytes = self.exchange_udp(&message_bytes).await?;
        let response = wire::unpack_message(&response_bytes)?;
        if !response.metadata.truncation {
            return Ok(response);
        }

        debug!(
            server = %self.addr,
            qname = %query_name(query),
            "UDP response truncated, retrying over TCP"
        );
        let response_bytes = self.exchange_tcp(&message_bytes).await?;
        wire::unpack_message(&response_bytes)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        if self.proxy.is_some() {
            format!("tcp+socks5://{}", self.addr)
        } else {
            format!("udp://{}", self.addr)
        }
    }
}
