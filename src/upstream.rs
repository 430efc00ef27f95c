use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use crate::error::EngineError;
use crate::metrics::Metrics;

/// Attempts made before an upstream resolution is declared failed.
pub const RESOLVE_ATTEMPTS: usize = 3;

const MAX_RESPONSE: usize = 4096;

/// Forwards queries verbatim to upstream resolvers over UDP.
///
/// Every attempt uses a fresh ephemeral socket and picks its resolver at
/// random, so no state survives between attempts or requests.
pub struct UpstreamResolver {
    metrics: Metrics,
    attempts: usize,
}

impl UpstreamResolver {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            metrics,
            attempts: RESOLVE_ATTEMPTS,
        }
    }

    pub async fn resolve(
        &self,
        packet: &[u8],
        resolvers: &[SocketAddr],
        timeout_dur: Duration,
    ) -> Result<Bytes, EngineError> {
        if resolvers.is_empty() {
            return Err(EngineError::Network {
                attempts: 0,
                last: "no resolvers configured".to_string(),
            });
        }

        let mut last_err = None;
        for attempt in 1..=self.attempts {
            // 每次尝试随机选择上游 / random upstream per attempt
            let upstream = resolvers[fastrand::usize(..resolvers.len())];
            self.metrics.add("upstream.attempts", 1);
            let start = Instant::now();
            match exchange(packet, upstream, timeout_dur).await {
                Ok(bytes) => {
                    let elapsed = start.elapsed();
                    self.metrics
                        .add_avg("upstream.latency_ms", elapsed.as_secs_f64() * 1000.0);
                    debug!(upstream = %upstream, attempt, upstream_ns = elapsed.as_nanos() as u64, "upstream call latency");
                    return Ok(bytes);
                }
                Err(err) => {
                    self.metrics.add("upstream.failures", 1);
                    debug!(
                        event = "udp_forward_retry",
                        upstream = %upstream,
                        attempt,
                        timeout_ms = timeout_dur.as_millis() as u64,
                        error = %err,
                        "udp forward attempt failed",
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(EngineError::Network {
            attempts: self.attempts,
            last: last_err
                .map(|e| format!("{e:#}"))
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

/// One UDP round trip. Datagrams whose transaction id differs from the query
/// are discarded until the deadline.
async fn exchange(packet: &[u8], upstream: SocketAddr, timeout_dur: Duration) -> anyhow::Result<Bytes> {
    if packet.len() < 2 {
        anyhow::bail!("packet too short");
    }
    let bind: SocketAddr = if upstream.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let sock = UdpSocket::bind(bind).await.context("bind")?;
    sock.connect(upstream).await.context("connect")?;
    sock.send(packet).await.context("send")?;

    // 丢弃事务 ID 不匹配的响应，直到超时 / drop replies with a foreign transaction id until the deadline
    let mut buf = [0u8; MAX_RESPONSE];
    let recv_res = timeout(timeout_dur, async {
        loop {
            let size = sock.recv(&mut buf).await?;
            if size >= 2 && buf[0] == packet[0] && buf[1] == packet[1] {
                return Ok::<_, anyhow::Error>(Bytes::copy_from_slice(&buf[..size]));
            }
        }
    })
    .await;

    match recv_res {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(err)) => Err(err),
        Err(_) => anyhow::bail!("udp timeout"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{query_packet, spawn_blackhole, spawn_upstream};
    use hickory_proto::op::Message;
    use hickory_proto::rr::{DNSClass, RecordType};
    use hickory_proto::serialize::binary::BinDecodable;
    use std::net::Ipv4Addr;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn reachable_resolver_returns_answer() {
        let (addr, hits) = spawn_upstream(Ipv4Addr::new(192, 0, 2, 1)).await;
        let metrics = Metrics::new();
        let resolver = UpstreamResolver::new(metrics.clone());
        let packet = query_packet("google.com", RecordType::A, DNSClass::IN);

        let raw = resolver
            .resolve(&packet, &[addr], Duration::from_secs(1))
            .await
            .expect("resolve");
        let resp = Message::from_bytes(&raw).expect("parse");
        assert!(!resp.answers().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.counter("upstream.attempts"), 1);
        assert_eq!(metrics.counter("upstream.failures"), 0);
    }

    #[tokio::test]
    async fn unreachable_resolvers_exhaust_three_attempts() {
        let (a, hits_a) = spawn_blackhole().await;
        let (b, hits_b) = spawn_blackhole().await;
        let metrics = Metrics::new();
        let resolver = UpstreamResolver::new(metrics.clone());
        let packet = query_packet("google.com", RecordType::A, DNSClass::IN);

        let err = resolver
            .resolve(&packet, &[a, b], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Network { attempts: 3, .. }));
        // give the black holes a moment to count the last datagram
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            hits_a.load(Ordering::SeqCst) + hits_b.load(Ordering::SeqCst),
            RESOLVE_ATTEMPTS
        );
        assert_eq!(metrics.counter("upstream.failures"), 3);
    }

    #[tokio::test]
    async fn empty_resolver_list_fails_without_io() {
        let resolver = UpstreamResolver::new(Metrics::new());
        let err = resolver
            .resolve(&[0, 1, 0, 0], &[], Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Network { attempts: 0, .. }));
    }

    #[tokio::test]
    async fn mismatched_transaction_id_is_ignored() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let mut wrong = buf[..len].to_vec();
            wrong[0] ^= 0xff;
            server.send_to(&wrong, peer).await.unwrap();
            server.send_to(&buf[..len], peer).await.unwrap();
        });

        let packet = query_packet("example.com", RecordType::A, DNSClass::IN);
        let raw = exchange(&packet, addr, Duration::from_secs(1))
            .await
            .expect("exchange");
        assert_eq!(&raw[..2], &packet[..2]);
    }
}
