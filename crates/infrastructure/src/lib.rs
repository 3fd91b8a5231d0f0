//! Shunt DNS Infrastructure Layer
//!
//! The resolution core of the proxy: the AdBlock-Plus rule matcher that
//! decides whether a domain is blocked, and the upstream callers that forward
//! a query over plain DNS, DNS-over-TLS or DNS-over-HTTPS.
pub mod dns;

pub use dns::rule_filter::{RuleAction, RuleSet};
pub use dns::upstream::{
    BootstrapResolver, Caller, DnsStream, HttpsCaller, HttpsCallerConfig, PlainCaller,
    Socks5Dialer, StreamDialer, TlsCaller,
};
