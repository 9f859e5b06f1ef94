//! Single-question DNS exchanges over a dialed transport

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::net::{Dialer, Network};

/// DNS query timeout
pub const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Advertised EDNS0 UDP payload size
pub const EDNS_PAYLOAD: u16 = 1232;

/// Maximum DNS response size
const MAX_RESPONSE_SIZE: usize = 65535;

/// Addresses and TTL returned by one A or AAAA query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordResult {
    pub addrs: Vec<IpAddr>,
    pub ttl: u32,
}

/// Build a recursive query for `host` with EDNS0 and the DO bit set
pub fn build_query(host: &str, record_type: RecordType) -> Result<Message> {
    let fqdn = if host.ends_with('.') {
        host.to_string()
    } else {
        format!("{}.", host)
    };
    let name = Name::from_ascii(&fqdn)
        .map_err(|e| Error::Dns(format!("invalid hostname {}: {}", host, e)))?;

    let mut edns = Edns::new();
    edns.set_max_payload(EDNS_PAYLOAD);
    edns.set_dnssec_ok(true);

    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));
    message.set_edns(edns);

    Ok(message)
}

/// Send `query` to `server` over a fresh datagram connection from `dialer`
/// and wait for the matching response
pub async fn exchange<D>(dialer: &D, server: SocketAddr, query: &Message) -> Result<Message>
where
    D: Dialer + ?Sized,
{
    let request = query
        .to_vec()
        .map_err(|e| Error::Dns(format!("failed to encode query: {}", e)))?;

    let run = async {
        let mut conn = dialer.dial(Network::Udp, &server.to_string()).await?;
        conn.write_all(&request).await?;

        let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
        loop {
            let len = conn.read(&mut buf).await?;
            let response = match Message::from_vec(&buf[..len]) {
                Ok(response) => response,
                Err(e) => {
                    log::debug!("dns: discarding malformed response from {}: {}", server, e);
                    continue;
                }
            };
            if response.id() != query.id() {
                log::debug!(
                    "dns: discarding response with id {} (expected {})",
                    response.id(),
                    query.id()
                );
                continue;
            }
            return Ok(response);
        }
    };

    tokio::time::timeout(DNS_TIMEOUT, run)
        .await
        .map_err(|_| Error::Dns(format!("query to {} timed out", server)))?
}

/// Collect the addresses of `record_type` from a response
///
/// A non-success response code or an empty answer section means the record
/// does not exist. The TTL reported is that of the first answer.
pub fn extract_records(response: &Message, record_type: RecordType) -> Result<RecordResult> {
    let missing = || match record_type {
        RecordType::AAAA => Error::NoAAAARecord,
        _ => Error::NoARecord,
    };

    if response.response_code() != ResponseCode::NoError {
        return Err(missing());
    }
    let first = response.answers().first().ok_or_else(missing)?;

    let addrs = response
        .answers()
        .iter()
        .filter_map(|record| match (record.data(), record_type) {
            (RData::A(a), RecordType::A) => Some(IpAddr::V4(a.0)),
            (RData::AAAA(aaaa), RecordType::AAAA) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect();

    Ok(RecordResult {
        addrs,
        ttl: first.ttl(),
    })
}
