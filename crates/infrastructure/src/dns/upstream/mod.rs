//! Upstream callers: one contract, three wire transports.
//!
//! A [`Caller`] forwards an opaque DNS query to its upstream and returns the
//! parsed answer. Implementations differ in transport (plain UDP/TCP, TLS,
//! HTTPS) but share the contract: no retry inside a single `call`, a
//! step-naming error on failure, idempotent `close`, and clean failure (never
//! a hang) once closed.

pub mod https;
pub mod plain;
pub mod socks;
pub mod tls;

use crate::dns::wire;
use async_trait::async_trait;
use hickory_proto::op::Message;
use shunt_dns_domain::{ResolveTrace, UpstreamError};
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use https::{HttpsCaller, HttpsCallerConfig};
pub use plain::PlainCaller;
pub use socks::Socks5Dialer;
pub use tls::TlsCaller;

/// Largest DNS message carried over a stream transport (RFC 1035 §4.2.2).
pub(crate) const MAX_STREAM_MESSAGE_SIZE: usize = 65535;

/// Default bound on a single exchange step (dial, write, read).
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One upstream transport.
#[async_trait]
pub trait Caller: Send + Sync {
    /// Sends the query and returns the parsed answer, or an error naming the
    /// step that failed. Never retries internally; retry policy belongs to
    /// the dispatcher above.
    async fn call(&self, query: &Message) -> Result<Message, UpstreamError>;

    /// Like [`Caller::call`], but continues an existing resolution chain.
    /// A dispatcher that re-enters a caller while resolving an upstream's own
    /// hostname passes the descended trace here so the hop budget holds
    /// across the round trip.
    async fn call_traced(
        &self,
        query: &Message,
        _trace: ResolveTrace,
    ) -> Result<Message, UpstreamError> {
        self.call(query).await
    }

    /// Releases held transport resources. Idempotent; `call` after `close`
    /// fails with [`UpstreamError::Closed`].
    async fn close(&self);

    /// Stable `transport://address` identity for logging.
    fn describe(&self) -> String;
}

/// Byte stream a caller can exchange framed DNS messages over.
pub trait DnsStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DnsStream for T {}

/// Boundary for establishing stream connections, so tests can inject scripted
/// fakes instead of touching the network.
#[async_trait]
pub trait StreamDialer: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn DnsStream>, UpstreamError>;
}

/// Handle to the proxy's own resolver, attached to the DoH caller so its
/// upstream hostname is resolved without consulting normal DNS.
#[async_trait]
pub trait BootstrapResolver: Send + Sync {
    async fn resolve(
        &self,
        host: &str,
        trace: ResolveTrace,
    ) -> Result<Vec<IpAddr>, UpstreamError>;
}

pub(crate) async fn send_with_length_prefix<S>(
    stream: &mut S,
    message_bytes: &[u8],
) -> std::io::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    let length = message_bytes.len() as u16;
    stream.write_all(&length.to_be_bytes()).await?;
    stream.write_all(message_bytes).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) async fn read_with_length_prefix<S>(stream: &mut S) -> std::io::Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;

    let response_len = u16::from_be_bytes(len_buf) as usize;
    if response_len > MAX_STREAM_MESSAGE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "Response too large: {} bytes (max {})",
                response_len, MAX_STREAM_MESSAGE_SIZE
            ),
        ));
    }

    let mut response = vec![0u8; response_len];
    stream.read_exact(&mut response).await?;
    Ok(response)
}

/// Qname of the first question, used in per-call diagnostics.
pub(crate) fn query_name(query: &Message) -> String {
    wire::first_qname(query).unwrap_or_default()
}
