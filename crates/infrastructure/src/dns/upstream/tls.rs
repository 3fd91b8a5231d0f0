//! DNS-over-TLS caller (RFC 7858).
//!
//! Holds one persistent connection, dialed on demand (directly or through a
//! SOCKS5 tunnel) and guarded by an async mutex so concurrent calls serialize
//! on the shared stream. A write or read failure invalidates the connection;
//! the next call redials instead of reusing a broken pipe. No retry happens
//! inside a single call.

use super::{
    query_name, read_with_length_prefix, send_with_length_prefix, Caller, DnsStream,
    Socks5Dialer, StreamDialer, DEFAULT_TIMEOUT,
};
use crate::dns::wire;
use async_trait::async_trait;
use hickory_proto::op::Message;
use rustls::pki_types::ServerName;
use shunt_dns_domain::{UpstreamAddr, UpstreamError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Shared TLS config — built once, reused for all DoT connections.
/// Enables TLS session resumption (session tickets) automatically.
static SHARED_TLS_CONFIG: LazyLock<Arc<rustls::ClientConfig>> = LazyLock::new(|| {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Arc::new(config)
});

/// Production dialer: TCP connect (direct or via SOCKS5) + TLS handshake.
struct TlsDialer {
    addr: UpstreamAddr,
    server_name: String,
    proxy: Option<Socks5Dialer>,
    timeout: Duration,
}

#[async_trait]
impl StreamDialer for TlsDialer {
    async fn dial(&self) -> Result<Box<dyn DnsStream>, UpstreamError> {
        let server = self.addr.to_string();
        let dial_err = |reason: String| UpstreamError::Dial {
            server: server.clone(),
            reason,
        };

        let tcp_stream = match &self.proxy {
            Some(dialer) => dialer.connect(&self.addr.host(), self.addr.port()).await?,
            None => {
                let server_addr = self.addr.socket_addr().ok_or_else(|| {
                    dial_err(format!("TLS caller requires a resolved address, got: {}", self.addr))
                })?;
                tokio::time::timeout(self.timeout, TcpStream::connect(server_addr))
                    .await
                    .map_err(|_| {
                        dial_err(format!(
                            "Timeout connecting to TLS server {}",
                            server_addr
                        ))
                    })?
                    .map_err(|e| dial_err(format!("Connection refused: {}", e)))?
            }
        };

        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|e| dial_err(format!("Invalid TLS hostname '{}': {}", self.server_name, e)))?;

        let connector = tokio_rustls::TlsConnector::from(SHARED_TLS_CONFIG.clone());

        // TLS handshake (session resumption happens automatically via rustls session cache)
        let tls_stream = tokio::time::timeout(self.timeout, connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| dial_err(format!("Timeout during TLS handshake with {}", server)))?
            .map_err(|e| dial_err(format!("TLS handshake failed: {}", e)))?;

        debug!(server = %server, hostname = %self.server_name, "TLS connection established");
        Ok(Box::new(tls_stream))
    }
}

/// DNS-over-TLS caller
pub struct TlsCaller {
    dialer: Arc<dyn StreamDialer>,
    identity: String,
    conn: Mutex<Option<Box<dyn DnsStream>>>,
    timeout: Duration,
    closed: AtomicBool,
}

impl TlsCaller {
    /// Creates a caller for `addr`, verifying the certificate against
    /// `server_name`, optionally tunneling through a SOCKS5 proxy.
    pub fn new(addr: UpstreamAddr, server_name: impl Into<String>, proxy: Option<Socks5Dialer>) -> Self {
        let server_name = server_name.into();
        let identity = format!("tls://{}", addr);
        let dialer = Arc::new(TlsDialer {
            addr,
            server_name,
            proxy,
            timeout: DEFAULT_TIMEOUT,
        });
        Self::with_dialer(dialer, identity)
    }

    /// Creates a caller over an arbitrary stream dialer. The production
    /// constructor goes through this; tests inject scripted dialers.
    pub fn with_dialer(dialer: Arc<dyn StreamDialer>, identity: impl Into<String>) -> Self {
        Self {
            dialer,
            identity: identity.into(),
            conn: Mutex::new(None),
            timeout: DEFAULT_TIMEOUT,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn timeout_err(&self) -> UpstreamError {
        UpstreamError::Timeout {
            server: self.identity.clone(),
            elapsed_ms: self.timeout.as_millis() as u64,
        }
    }
}

#[async_trait]
impl Caller for TlsCaller {
    async fn call(&self, query: &Message) -> Result<Message, UpstreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UpstreamError::Closed);
        }

        let message_bytes = wire::pack_message(query)?;

        let mut conn = self.conn.lock().await;
        let stream = match &mut *conn {
            Some(stream) => stream,
            slot => slot.insert(self.dialer.dial().await?),
        };

        let write_result =
            tokio::time::timeout(self.timeout, send_with_length_prefix(stream, &message_bytes))
                .await;
        match write_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // Broken pipe: drop the connection so the next call redials.
                *conn = None;
                return Err(UpstreamError::Write {
                    server: self.identity.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                *conn = None;
                return Err(self.timeout_err());
            }
        }

        let read_result =
            tokio::time::timeout(self.timeout, read_with_length_prefix(stream)).await;
        let response_bytes = match read_result {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                *conn = None;
                return Err(UpstreamError::Read {
                    server: self.identity.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                *conn = None;
                return Err(self.timeout_err());
            }
        };
        drop(conn);

        debug!(
            server = %self.identity,
            qname = %query_name(query),
            response_len = response_bytes.len(),
            "TLS response received"
        );
        wire::unpack_message(&response_bytes)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.conn.lock().await = None;
    }

    fn describe(&self) -> String {
        self.identity.clone()
    }
}
