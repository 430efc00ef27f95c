//! Builders and loopback fakes shared by the unit tests.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, RecordType};
use tokio::net::UdpSocket;

use crate::rules::RequestContext;
use crate::wire;

pub fn query_packet(name: &str, qtype: RecordType, qclass: DNSClass) -> Vec<u8> {
    let mut query = Query::query(wire::parse_fqdn(name).expect("query name"), qtype);
    query.set_query_class(qclass);
    let mut msg = Message::new();
    msg.set_id(fastrand::u16(..))
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(query);
    wire::encode(&msg).expect("encode query").to_vec()
}

pub fn context() -> RequestContext {
    RequestContext {
        client: "127.0.0.1:40000".parse().unwrap(),
        server: "127.0.0.1:53".parse().unwrap(),
    }
}

/// Loopback resolver answering every question with one A record for `ip`.
pub async fn spawn_upstream(ip: Ipv4Addr) -> (SocketAddr, Arc<AtomicUsize>) {
    let sock = UdpSocket::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = sock.local_addr().expect("upstream addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let Ok((len, peer)) = sock.recv_from(&mut buf).await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let Ok(req) = wire::decode(&buf[..len]) else {
                continue;
            };
            let name = req.queries()[0].name().clone();
            let answer = wire::address_record(name, ip.into());
            if let Ok(resp) = wire::build_response(&req, ResponseCode::NoError, vec![answer]) {
                let _ = sock.send_to(&resp, peer).await;
            }
        }
    });
    (addr, hits)
}

/// Loopback resolver that counts datagrams and never replies.
pub async fn spawn_blackhole() -> (SocketAddr, Arc<AtomicUsize>) {
    let sock = UdpSocket::bind("127.0.0.1:0").await.expect("bind blackhole");
    let addr = sock.local_addr().expect("blackhole addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while sock.recv_from(&mut buf).await.is_ok() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    (addr, hits)
}
