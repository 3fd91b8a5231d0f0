//! Minimal SOCKS5 CONNECT dialer (RFC 1928/1929).
//!
//! Callers that tunnel through a proxy use this to open the TCP leg; only the
//! CONNECT command is needed for DNS-over-stream transports.

use shunt_dns_domain::UpstreamError;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_PASSWORD: u8 = 0x02;
const SOCKS5_AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const SOCKS5_CMD_CONNECT: u8 = 0x01;

const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

const SOCKS5_REP_SUCCESS: u8 = 0x00;

/// SOCKS5 proxy dialer. Target addresses may be IPs or domain names; domain
/// targets are passed to the proxy unresolved.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy_addr: SocketAddr,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl Socks5Dialer {
    pub fn new(proxy_addr: SocketAddr) -> Self {
        Self {
            proxy_addr,
            username: None,
            password: None,
            timeout: super::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_auth(
        proxy_addr: SocketAddr,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            proxy_addr,
            username: Some(username.into()),
            password: Some(password.into()),
            timeout: super::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Proxy URL form consumed by HTTP clients: `socks5h://[user:pass@]addr`.
    /// The `h` variant leaves hostname resolution to the proxy.
    pub fn proxy_url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("socks5h://{}:{}@{}", user, pass, self.proxy_addr)
            }
            _ => format!("socks5h://{}", self.proxy_addr),
        }
    }

    /// Opens a tunneled connection to `host:port` through the proxy. The
    /// whole negotiation is bounded by the dialer timeout.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, UpstreamError> {
        let target = format!("{}:{}", host, port);
        tokio::time::timeout(self.timeout, self.connect_inner(host, port))
            .await
            .map_err(|_| UpstreamError::Dial {
                server: target,
                reason: format!(
                    "SOCKS5 negotiation with {} timed out after {}ms",
                    self.proxy_addr,
                    self.timeout.as_millis()
                ),
            })?
    }

    async fn connect_inner(&self, host: &str, port: u16) -> Result<TcpStream, UpstreamError> {
        let target = format!("{}:{}", host, port);
        let dial_err = |reason: String| UpstreamError::Dial {
            server: target.clone(),
            reason,
        };

        let mut stream = TcpStream::connect(self.proxy_addr)
            .await
            .map_err(|e| dial_err(format!("Failed to connect to proxy {}: {}", self.proxy_addr, e)))?;

        // Method negotiation
        let auth_methods: &[u8] = if self.username.is_some() && self.password.is_some() {
            &[SOCKS5_AUTH_NONE, SOCKS5_AUTH_PASSWORD]
        } else {
            &[SOCKS5_AUTH_NONE]
        };
        let mut greeting = vec![SOCKS5_VERSION, auth_methods.len() as u8];
        greeting.extend(auth_methods);
        stream
            .write_all(&greeting)
            .await
            .map_err(|e| dial_err(format!("Failed to send SOCKS5 greeting: {}", e)))?;

        let mut choice = [0u8; 2];
        stream
            .read_exact(&mut choice)
            .await
            .map_err(|e| dial_err(format!("Failed to read SOCKS5 method choice: {}", e)))?;
        if choice[0] != SOCKS5_VERSION {
            return Err(dial_err(format!("Invalid SOCKS version: {}", choice[0])));
        }
        match choice[1] {
            SOCKS5_AUTH_NONE => {}
            SOCKS5_AUTH_PASSWORD => self.authenticate(&mut stream, &dial_err).await?,
            SOCKS5_AUTH_NO_ACCEPTABLE => {
                return Err(dial_err("No acceptable authentication method".to_string()));
            }
            method => {
                return Err(dial_err(format!(
                    "Unsupported authentication method: {}",
                    method
                )));
            }
        }

        // CONNECT request
        let (atyp, dst_addr) = encode_target(host);
        let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00, atyp];
        request.extend(&dst_addr);
        request.extend(&port.to_be_bytes());
        stream
            .write_all(&request)
            .await
            .map_err(|e| dial_err(format!("Failed to send CONNECT request: {}", e)))?;

        let mut reply = [0u8; 4];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|e| dial_err(format!("Failed to read CONNECT reply: {}", e)))?;
        if reply[0] != SOCKS5_VERSION {
            return Err(dial_err(format!(
                "Invalid SOCKS version in reply: {}",
                reply[0]
            )));
        }
        if reply[1] != SOCKS5_REP_SUCCESS {
            return Err(dial_err(format!(
                "SOCKS5 CONNECT failed: {}",
                reply_to_string(reply[1])
            )));
        }

        // Drain the bound address the proxy reports; it is not needed.
        let bound_len = match reply[3] {
            SOCKS5_ATYP_IPV4 => 4 + 2,
            SOCKS5_ATYP_IPV6 => 16 + 2,
            SOCKS5_ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream
                    .read_exact(&mut len)
                    .await
                    .map_err(|e| dial_err(format!("Failed to read bound address: {}", e)))?;
                len[0] as usize + 2
            }
            atyp => return Err(dial_err(format!("Unknown address type: {}", atyp))),
        };
        let mut bound = vec![0u8; bound_len];
        stream
            .read_exact(&mut bound)
            .await
            .map_err(|e| dial_err(format!("Failed to read bound address: {}", e)))?;

        debug!(proxy = %self.proxy_addr, target = %target, "SOCKS5 tunnel established");
        Ok(stream)
    }

    async fn authenticate(
        &self,
        stream: &mut TcpStream,
        dial_err: &impl Fn(String) -> UpstreamError,
    ) -> Result<(), UpstreamError> {
        let (username, password) = match (&self.username, &self.password) {
            (Some(u), Some(p)) => (u, p),
            _ => {
                return Err(dial_err(
                    "Server requires authentication but no credentials provided".to_string(),
                ));
            }
        };

        let mut auth = vec![0x01, username.len() as u8];
        auth.extend(username.as_bytes());
        auth.push(password.len() as u8);
        auth.extend(password.as_bytes());
        stream
            .write_all(&auth)
            .await
            .map_err(|e| dial_err(format!("Failed to send credentials: {}", e)))?;

        let mut status = [0u8; 2];
        stream
            .read_exact(&mut status)
            .await
            .map_err(|e| dial_err(format!("Failed to read auth status: {}", e)))?;
        if status[1] != 0x00 {
            return Err(dial_err("SOCKS5 authentication failed".to_string()));
        }
        Ok(())
    }
}

fn encode_target(host: &str) -> (u8, Vec<u8>) {
    if let Ok(ip) = host.parse::<IpAddr>() {
        match ip {
            IpAddr::V4(v4) => (SOCKS5_ATYP_IPV4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (SOCKS5_ATYP_IPV6, v6.octets().to_vec()),
        }
    } else {
        let domain = host.as_bytes();
        let mut addr = vec![domain.len() as u8];
        addr.extend(domain);
        (SOCKS5_ATYP_DOMAIN, addr)
    }
}

fn reply_to_string(rep: u8) -> &'static str {
    match rep {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "undefined",
    }
}
