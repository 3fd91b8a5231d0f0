//! DNS wire codec helpers over `hickory-proto`.
//!
//! The callers treat queries and responses as opaque messages; these wrappers
//! only pack/unpack them and build the probe query used by the DoH self-check.

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use shunt_dns_domain::UpstreamError;
use std::str::FromStr;

/// Serialize a message to wire format bytes.
pub fn pack_message(message: &Message) -> Result<Vec<u8>, UpstreamError> {
    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    message
        .emit(&mut encoder)
        .map_err(|e| UpstreamError::Pack(e.to_string()))?;
    Ok(buf)
}

/// Parse wire format bytes back into a message.
pub fn unpack_message(bytes: &[u8]) -> Result<Message, UpstreamError> {
    Message::from_vec(bytes).map_err(|e| UpstreamError::Unpack(e.to_string()))
}

/// Build a recursive A query for `hostname` with a random ID. Used by the
/// DoH self-check loop to probe the upstream's own hostname.
pub fn probe_query(hostname: &str) -> Result<Message, UpstreamError> {
    let name = Name::from_str(hostname)
        .map_err(|e| UpstreamError::Pack(format!("Invalid probe name '{}': {}", hostname, e)))?;

    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(RecordType::A);
    query.set_query_class(DNSClass::IN);

    let mut message = Message::new(fastrand::u16(..), MessageType::Query, OpCode::Query);
    message.metadata.recursion_desired = true;
    message.add_query(query);
    Ok(message)
}

/// Name in the first question section, for diagnostics.
pub fn first_qname(message: &Message) -> Option<String> {
    message.queries.first().map(|q| q.name().to_string())
}
