//! End-to-end flow: the matcher decides, then an unmatched query is forwarded
//! through a caller to a (mock) upstream — the composition the dispatcher
//! performs per query.

use hickory_proto::op::{Message, MessageType, OpCode};
use shunt_dns_domain::UpstreamAddr;
use shunt_dns_infrastructure::dns::wire;
use shunt_dns_infrastructure::{Caller, PlainCaller, RuleAction, RuleSet};
use std::time::Duration;
use tokio::net::UdpSocket;

const RULES: &str = "\
! ads and trackers
||ads.example.com^
||*.metrics.example.com^
@@||good.example.com^
";

#[tokio::test]
async fn test_match_then_forward() {
    let mut rules = RuleSet::compile(RULES);
    rules.extend(RuleSet::compile("||banners.example.net^"));

    // verdicts the dispatcher would act on without touching an upstream
    assert_eq!(
        rules.decide("video.ads.example.com"),
        Some(RuleAction::Block)
    );
    assert_eq!(
        rules.decide("beacon.metrics.example.com"),
        Some(RuleAction::Block)
    );
    assert_eq!(rules.decide("good.example.com"), Some(RuleAction::Allow));
    assert_eq!(rules.decide("banners.example.net"), Some(RuleAction::Block));

    // no verdict: the query goes upstream
    let qname = "api.service.example.org";
    assert_eq!(rules.decide(qname), None);

    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let (n, peer) = upstream.recv_from(&mut buf).await.unwrap();
        let request = wire::unpack_message(&buf[..n]).unwrap();
        let mut response = Message::new(request.metadata.id, MessageType::Response, OpCode::Query);
        for question in &request.queries {
            response.add_query(question.clone());
        }
        let bytes = wire::pack_message(&response).unwrap();
        upstream.send_to(&bytes, peer).await.unwrap();
    });

    let caller =
        PlainCaller::new(UpstreamAddr::from(addr), None).with_timeout(Duration::from_secs(2));
    let query = wire::probe_query(qname).unwrap();

    let response = caller.call(&query).await.unwrap();
    assert_eq!(response.metadata.id, query.metadata.id);
    assert_eq!(
        wire::first_qname(&response).as_deref(),
        Some("api.service.example.org.")
    );

    caller.close().await;
}
