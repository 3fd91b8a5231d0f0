//! DoH caller tests: URL validation at construction, the trace-guarded
//! resolution path (timeout and loop detection), close semantics, liveness
//! reporting, and the full POST pipeline against a local HTTP mock.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use shunt_dns_domain::{ResolveTrace, UpstreamError};
use shunt_dns_infrastructure::dns::wire;
use shunt_dns_infrastructure::{BootstrapResolver, Caller, HttpsCaller, HttpsCallerConfig};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Resolver that always answers with a fixed address, like a healthy local
/// resolver with a hosts entry for the upstream.
struct StaticResolver(IpAddr);

#[async_trait]
impl BootstrapResolver for StaticResolver {
    async fn resolve(
        &self,
        _host: &str,
        _trace: ResolveTrace,
    ) -> Result<Vec<IpAddr>, UpstreamError> {
        Ok(vec![self.0])
    }
}

/// Resolver that never answers, like a resolver stuck behind a dead route.
struct SlowResolver;

#[async_trait]
impl BootstrapResolver for SlowResolver {
    async fn resolve(
        &self,
        _host: &str,
        _trace: ResolveTrace,
    ) -> Result<Vec<IpAddr>, UpstreamError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

/// Models a dispatcher whose route for the upstream's own hostname leads back
/// through the same caller: every hop descends the trace again until the
/// budget runs out.
struct RecursiveResolver;

#[async_trait]
impl BootstrapResolver for RecursiveResolver {
    async fn resolve(
        &self,
        host: &str,
        trace: ResolveTrace,
    ) -> Result<Vec<IpAddr>, UpstreamError> {
        let mut trace = trace;
        loop {
            trace = trace.descend(host)?;
        }
    }
}

#[tokio::test]
async fn test_construction_rejects_malformed_urls() {
    for bad in ["\n", "abc", "https://abc::/", "ftp://dns.example.com/q"] {
        let result = HttpsCaller::new(bad, None);
        assert!(
            matches!(result, Err(UpstreamError::InvalidAddress(_))),
            "URL {:?} was accepted",
            bad
        );
    }
}

#[tokio::test]
async fn test_construction_accepts_well_formed_urls() {
    let caller = HttpsCaller::new("https://dns.alidns.com/dns-query", None).unwrap();
    assert_eq!(caller.describe(), "https://dns.alidns.com/dns-query");
    caller.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswerable_resolution_times_out() {
    let config = HttpsCallerConfig {
        call_timeout: Duration::from_secs(1),
        probe_interval: Duration::from_secs(3600),
        probe_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let caller =
        HttpsCaller::with_config("https://dns.upstream-test.invalid/dns-query", None, config)
            .unwrap();
    caller.set_resolver(Arc::new(SlowResolver)).await;

    let query = wire::probe_query("example.org").unwrap();
    let err = caller.call(&query).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Timeout { .. }), "{err}");
    caller.close().await;
}

#[tokio::test]
async fn test_resolution_loop_is_detected() {
    let config = HttpsCallerConfig {
        probe_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let caller =
        HttpsCaller::with_config("https://dns.upstream-test.invalid/dns-query", None, config)
            .unwrap();
    caller.set_resolver(Arc::new(RecursiveResolver)).await;

    // resolving the upstream's own hostname through the attached resolver
    let query = wire::probe_query("dns.upstream-test.invalid").unwrap();
    let err = caller.call(&query).await.unwrap_err();
    assert!(matches!(err, UpstreamError::LoopDetected { .. }), "{err}");
    caller.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent_and_fails_subsequent_calls() {
    let caller = HttpsCaller::new("https://1.1.1.1/dns-query", None).unwrap();
    caller.close().await;
    caller.close().await;

    let query = wire::probe_query("example.org").unwrap();
    let err = caller.call(&query).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Closed));
}

#[tokio::test]
async fn test_self_check_reports_liveness() {
    let config = HttpsCallerConfig {
        probe_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let caller =
        HttpsCaller::with_config("https://doh.upstream-test.invalid/dns-query", None, config)
            .unwrap();
    caller
        .set_resolver(Arc::new(StaticResolver(IpAddr::V4(Ipv4Addr::LOCALHOST))))
        .await;

    for _ in 0..100 {
        if caller.is_live() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(caller.is_live());
    caller.close().await;
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Minimal HTTP/1.1 responder speaking just enough for one DoH POST.
async fn serve_doh_once(listener: TcpListener) {
    let (mut stream, _) = listener.accept().await.unwrap();

    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut tmp).await.unwrap();
        assert!(n > 0, "client closed before sending a full request");
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
    let content_length: usize = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .map(|value| value.trim().parse().unwrap())
        .expect("request carries a content length");
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut tmp).await.unwrap();
        buf.extend_from_slice(&tmp[..n]);
    }

    let request = wire::unpack_message(&buf[header_end..header_end + content_length]).unwrap();
    let mut response = Message::new(request.metadata.id, MessageType::Response, OpCode::Query);
    for question in &request.queries {
        response.add_query(question.clone());
        response.add_answer(Record::from_rdata(
            question.name().clone(),
            60,
            RData::A(A(Ipv4Addr::new(10, 0, 0, 53))),
        ));
    }
    let body = wire::pack_message(&response).unwrap();

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/dns-message\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(&body).await.unwrap();
    stream.flush().await.unwrap();
}

#[tokio::test]
async fn test_post_pipeline_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_doh_once(listener));

    let config = HttpsCallerConfig {
        probe_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let url = format!("http://doh.upstream-test.invalid:{}/dns-query", port);
    let caller = HttpsCaller::with_config(&url, None, config).unwrap();
    caller
        .set_resolver(Arc::new(StaticResolver(IpAddr::V4(Ipv4Addr::LOCALHOST))))
        .await;

    let query = wire::probe_query("example.org").unwrap();
    let response = caller.call(&query).await.unwrap();
    assert_eq!(response.metadata.id, query.metadata.id);
    assert_eq!(response.answers.len(), 1);
    caller.close().await;
}
