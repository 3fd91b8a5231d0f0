//! DNS-over-HTTPS caller (RFC 8484).
//!
//! Sends queries as HTTP POST requests with `application/dns-message` bodies
//! through a small rotating pool of HTTP clients. The upstream's own hostname
//! is never resolved through normal DNS: a pluggable [`BootstrapResolver`]
//! (the proxy's own resolver) supplies the address, which is pinned into
//! every pooled client. A background self-check loop re-probes that
//! resolution on a timer; a probe that times out means the resolver is
//! routing the upstream's hostname back through this very caller — the
//! misconfiguration is flagged as not-live instead of deadlocking queries.

use super::{BootstrapResolver, Caller, Socks5Dialer};
use crate::dns::wire;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::Message;
use reqwest::{Client, Proxy, Url};
use shunt_dns_domain::{ResolveTrace, UpstreamError};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Content type for DNS-over-HTTPS exchanges (RFC 8484 §4.1)
const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

#[derive(Debug, Clone)]
pub struct HttpsCallerConfig {
    /// Bound on a whole `call`, pack through unpack.
    pub call_timeout: Duration,
    /// Cadence of the background self-check.
    pub probe_interval: Duration,
    /// Bound on one self-check probe.
    pub probe_timeout: Duration,
    /// Number of pooled HTTP clients rotated round-robin.
    pub pool_size: usize,
}

impl Default for HttpsCallerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            pool_size: 2,
        }
    }
}

/// DNS-over-HTTPS caller
pub struct HttpsCaller {
    url: Url,
    host: String,
    port: u16,
    proxy_url: Option<String>,
    config: HttpsCallerConfig,
    clients: ArcSwap<Vec<Client>>,
    next_client: AtomicUsize,
    resolver: RwLock<Option<Arc<dyn BootstrapResolver>>>,
    pinned: RwLock<Option<IpAddr>>,
    live: AtomicBool,
    cancel: CancellationToken,
    probe_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl HttpsCaller {
    /// Creates the caller and spawns its self-check loop; must be called
    /// from within a Tokio runtime. Fails on malformed or unsupported URLs.
    pub fn new(url: &str, proxy: Option<Socks5Dialer>) -> Result<Arc<Self>, UpstreamError> {
        Self::with_config(url, proxy, HttpsCallerConfig::default())
    }

    pub fn with_config(
        url: &str,
        proxy: Option<Socks5Dialer>,
        config: HttpsCallerConfig,
    ) -> Result<Arc<Self>, UpstreamError> {
        let parsed = Url::parse(url).map_err(|e| {
            UpstreamError::InvalidAddress(format!("'{}': {}", url.escape_default(), e))
        })?;
        if parsed.scheme() != "https" && parsed.scheme() != "http" {
            return Err(UpstreamError::InvalidAddress(format!(
                "'{}': unsupported scheme '{}'",
                url,
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| UpstreamError::InvalidAddress(format!("'{}': missing host", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| UpstreamError::InvalidAddress(format!("'{}': missing port", url)))?;

        let caller = Arc::new(Self {
            url: parsed,
            host,
            port,
            proxy_url: proxy.map(|dialer| dialer.proxy_url()),
            config,
            clients: ArcSwap::from_pointee(Vec::new()),
            next_client: AtomicUsize::new(0),
            resolver: RwLock::new(None),
            pinned: RwLock::new(None),
            live: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            probe_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        // IP-literal upstreams need no bootstrap resolution; pool is usable now.
        if caller.host.parse::<IpAddr>().is_ok() {
            caller.install_pool(None)?;
            caller.live.store(true, Ordering::SeqCst);
        }

        let runner = Arc::clone(&caller);
        let task = tokio::spawn(runner.run());
        if let Ok(mut slot) = caller.probe_task.lock() {
            *slot = Some(task);
        }
        Ok(caller)
    }

    /// Attaches the proxy's own resolver, used from then on for every
    /// resolution of the upstream hostname (including self-check probes).
    pub async fn set_resolver(&self, resolver: Arc<dyn BootstrapResolver>) {
        *self.resolver.write().await = Some(resolver);
    }

    /// Result of the last self-check: false once a probe has failed or timed
    /// out, true again after the next success.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn build_client(&self, pin: Option<IpAddr>) -> Result<Client, UpstreamError> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(self.config.call_timeout)
            .pool_max_idle_per_host(4);
        if let Some(ip) = pin {
            builder = builder.resolve(&self.host, SocketAddr::new(ip, self.port));
        }
        if let Some(proxy_url) = &self.proxy_url {
            let proxy = Proxy::all(proxy_url.as_str()).map_err(|e| {
                UpstreamError::InvalidAddress(format!("Invalid proxy '{}': {}", proxy_url, e))
            })?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| UpstreamError::BuildRequest(format!("HTTP client for {}: {}", self.url, e)))
    }

    fn install_pool(&self, pin: Option<IpAddr>) -> Result<(), UpstreamError> {
        let mut pool = Vec::with_capacity(self.config.pool_size);
        for _ in 0..self.config.pool_size {
            pool.push(self.build_client(pin)?);
        }
        self.clients.store(Arc::new(pool));
        Ok(())
    }

    fn next_client(&self) -> Result<Client, UpstreamError> {
        let pool = self.clients.load();
        if pool.is_empty() {
            return Err(UpstreamError::Dial {
                server: self.url.to_string(),
                reason: "Upstream address not resolved yet".to_string(),
            });
        }
        let index = self.next_client.fetch_add(1, Ordering::Relaxed) % pool.len();
        Ok(pool[index].clone())
    }

    /// Resolves the upstream hostname, preferring the attached resolver over
    /// system DNS. The trace is descended first so a chain that keeps
    /// re-entering this caller runs out of hops instead of recursing.
    async fn resolve_host(&self, trace: ResolveTrace) -> Result<IpAddr, UpstreamError> {
        let trace = trace.descend(&self.host)?;
        let resolver = self.resolver.read().await.clone();
        let addresses: Vec<IpAddr> = match resolver {
            Some(resolver) => resolver.resolve(&self.host, trace).await?,
            None => tokio::net::lookup_host((self.host.as_str(), self.port))
                .await
                .map_err(|e| UpstreamError::Dial {
                    server: self.url.to_string(),
                    reason: format!("System lookup for '{}' failed: {}", self.host, e),
                })?
                .map(|addr| addr.ip())
                .collect(),
        };
        addresses
            .first()
            .copied()
            .ok_or_else(|| UpstreamError::Dial {
                server: self.url.to_string(),
                reason: format!("No addresses for upstream host '{}'", self.host),
            })
    }

    /// Resolves and, when the address changed, rebuilds the client pool with
    /// the new pin.
    async fn refresh_addr(&self, trace: ResolveTrace) -> Result<IpAddr, UpstreamError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(ip); // literal upstream, nothing to resolve
        }
        let ip = self.resolve_host(trace).await?;
        let current = *self.pinned.read().await;
        if current != Some(ip) {
            self.install_pool(Some(ip))?;
            *self.pinned.write().await = Some(ip);
            info!(upstream = %self.url, address = %ip, "Upstream address pinned");
        }
        Ok(ip)
    }

    async fn ensure_ready(&self, trace: ResolveTrace) -> Result<(), UpstreamError> {
        if !self.clients.load().is_empty() {
            return Ok(());
        }
        // Concurrent first calls may each resolve; the last pool installed wins.
        self.refresh_addr(trace).await?;
        Ok(())
    }

    async fn exchange(
        &self,
        query: &Message,
        trace: ResolveTrace,
    ) -> Result<Message, UpstreamError> {
        self.ensure_ready(trace).await?;

        let message_bytes = wire::pack_message(query)?;

        let client = self.next_client()?;
        let request = client
            .post(self.url.clone())
            .header("Content-Type", DNS_MESSAGE_CONTENT_TYPE)
            .header("Accept", DNS_MESSAGE_CONTENT_TYPE)
            .body(Bytes::from(message_bytes))
            .build()
            .map_err(|e| UpstreamError::BuildRequest(e.to_string()))?;

        let response = client
            .execute(request)
            .await
            .map_err(|e| UpstreamError::Transport {
                server: self.url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Transport {
                server: self.url.to_string(),
                reason: format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                ),
            });
        }

        let body = response.bytes().await.map_err(|e| UpstreamError::Read {
            server: self.url.to_string(),
            reason: e.to_string(),
        })?;

        debug!(
            upstream = %self.url,
            response_len = body.len(),
            "DoH response received"
        );
        wire::unpack_message(&body)
    }

    async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.probe_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(upstream = %self.url, "Self-check loop stopped");
                    return;
                }
                _ = tick.tick() => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = self.probe() => {}
                    }
                }
            }
        }
    }

    /// One self-check: resolve the upstream's own hostname through the
    /// attached resolver within the probe bound. Failures only flip the
    /// liveness flag; they never surface as call errors.
    async fn probe(&self) {
        let probe = match wire::probe_query(&self.host) {
            Ok(probe) => probe,
            Err(error) => {
                self.live.store(false, Ordering::SeqCst);
                warn!(upstream = %self.url, %error, "Upstream self-check could not build probe");
                return;
            }
        };
        let trace = ResolveTrace::root(probe.metadata.id);
        match tokio::time::timeout(self.config.probe_timeout, self.refresh_addr(trace)).await {
            Ok(Ok(address)) => {
                let was_live = self.live.swap(true, Ordering::SeqCst);
                if !was_live {
                    info!(upstream = %self.url, %address, "Upstream self-check: OK");
                }
            }
            Ok(Err(error)) => {
                self.live.store(false, Ordering::SeqCst);
                warn!(upstream = %self.url, %error, "Upstream self-check failed");
            }
            Err(_) => {
                self.live.store(false, Ordering::SeqCst);
                warn!(
                    upstream = %self.url,
                    timeout_ms = self.config.probe_timeout.as_millis() as u64,
                    "Upstream self-check timed out; resolver may be looping back through this caller"
                );
            }
        }
    }
}

#[async_trait]
impl Caller for HttpsCaller {
    async fn call(&self, query: &Message) -> Result<Message, UpstreamError> {
        self.call_traced(query, ResolveTrace::root(query.metadata.id)).await
    }

    async fn call_traced(
        &self,
        query: &Message,
        trace: ResolveTrace,
    ) -> Result<Message, UpstreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UpstreamError::Closed);
        }
        let deadline = self.config.call_timeout;
        tokio::time::timeout(deadline, self.exchange(query, trace))
            .await
            .map_err(|_| UpstreamError::Timeout {
                server: self.url.to_string(),
                elapsed_ms: deadline.as_millis() as u64,
            })?
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let task = self.probe_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(error) = task.await {
                warn!(upstream = %self.url, %error, "Self-check task ended abnormally");
            }
        }
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

impl Drop for HttpsCaller {
    fn drop(&mut self) {
        // A caller dropped without close() must not leave its loop running.
        self.cancel.cancel();
    }
}
