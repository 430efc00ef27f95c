use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use hickory_proto::op::ResponseCode;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::metrics::Metrics;
use crate::rules::RequestContext;
use crate::wire;

/// Largest datagram read from a client; anything longer is truncated.
pub const MAX_DATAGRAM: usize = 1024;

const SOCKET_BUFFER: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ListenerOptions {
    /// Maximum number of queries processed at once.
    pub threadpool_size: usize,
    /// Answer SERVFAIL when no rule matched or upstream resolution failed.
    pub servfail_on_error: bool,
}

struct Worker {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    engine: Engine,
    metrics: Metrics,
    active: AtomicUsize,
    servfail_on_error: bool,
}

pub struct Listener {
    socket: Arc<UdpSocket>,
    worker: Arc<Worker>,
    permits: Arc<Semaphore>,
    stop: watch::Sender<bool>,
    metrics: Metrics,
}

impl Listener {
    pub fn bind(
        addr: SocketAddr,
        engine: Engine,
        metrics: Metrics,
        options: ListenerOptions,
    ) -> anyhow::Result<Self> {
        let std_socket = create_udp_socket(addr).with_context(|| format!("bind udp {addr}"))?;
        let socket = Arc::new(UdpSocket::from_std(std_socket).context("from_std")?);
        let local = socket.local_addr().context("local addr")?;
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            socket: Arc::clone(&socket),
            worker: Arc::new(Worker {
                socket,
                local,
                engine,
                metrics: metrics.clone(),
                active: AtomicUsize::new(0),
                servfail_on_error: options.servfail_on_error,
            }),
            permits: Arc::new(Semaphore::new(options.threadpool_size.max(1))),
            stop: stop_tx,
            metrics,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.worker.local
    }

    /// Ask the receive loop to exit. Safe to call any number of times, from
    /// any task.
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            info!("listener stop requested");
        }
    }

    /// Receive until stopped, then wait for every in-flight query to finish.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut stop_rx = self.stop.subscribe();
        let mut workers = JoinSet::new();
        let mut buf = BytesMut::with_capacity(MAX_DATAGRAM);
        info!(bind = %self.local_addr(), pool = self.permits.available_permits(), "listener started");

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }
            buf.resize(MAX_DATAGRAM, 0);
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((len, peer)) => {
                        buf.truncate(len);
                        let packet = buf.split().freeze();
                        self.metrics.add("net.packets_received", 1);
                        self.metrics.add("net.bytes_received", len as u64);

                        // 接收循环从不等待 worker；许可不足时任务排队而不是丢弃
                        // the receive loop never waits on a worker; without a permit the task queues
                        let worker = Arc::clone(&self.worker);
                        let permits = Arc::clone(&self.permits);
                        workers.spawn(async move {
                            let Ok(_permit) = permits.acquire_owned().await else {
                                return;
                            };
                            worker.handle(packet, peer).await;
                        });
                    }
                    Err(err) => {
                        debug!(error = %err, "udp recv failed");
                        buf.clear();
                    }
                },
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
            }
        }

        let pending = workers.len();
        if pending > 0 {
            info!(pending, "draining in-flight queries");
        }
        // 优雅退出：等待在途查询完成 / graceful drain
        while workers.join_next().await.is_some() {}
        info!(
            bind = %self.local_addr(),
            received = self.metrics.counter("net.packets_received"),
            sent = self.metrics.counter("net.packets_sent"),
            "listener stopped"
        );
        Ok(())
    }
}

impl Worker {
    async fn handle(&self, packet: Bytes, peer: SocketAddr) {
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.add_avg("net.active_workers", active as f64);

        let ctx = RequestContext {
            client: peer,
            server: self.local,
        };
        let reply = match self.engine.process(&packet, &ctx).await {
            Ok(resp) => Some(resp),
            Err(err) => self.on_error(&packet, peer, err),
        };

        match reply {
            Some(resp) => match self.socket.send_to(&resp, peer).await {
                Ok(sent) => {
                    self.metrics.add("net.packets_sent", 1);
                    self.metrics.add("net.bytes_sent", sent as u64);
                }
                Err(err) => {
                    warn!(client = %peer, error = %err, "failed to send response");
                    self.metrics.add("net.dropped", 1);
                }
            },
            None => self.metrics.add("net.dropped", 1),
        }

        let active = self.active.fetch_sub(1, Ordering::Relaxed) - 1;
        self.metrics.add_avg("net.active_workers", active as f64);
    }

    /// Log the failure and, when enabled, turn it into a SERVFAIL reply.
    fn on_error(&self, packet: &[u8], peer: SocketAddr, err: EngineError) -> Option<Bytes> {
        match &err {
            EngineError::Decode(_) | EngineError::MissingQuestion => {
                debug!(client = %peer, error = %err, "dropping malformed query");
                return None;
            }
            _ => warn!(client = %peer, error = %err, "query failed"),
        }
        if !(self.servfail_on_error && err.is_answerable()) {
            return None;
        }

        let built = match err {
            EngineError::NoMatchingRule { message, .. } => {
                wire::build_response(&message, ResponseCode::ServFail, Vec::new())
            }
            _ => wire::decode(packet)
                .and_then(|req| wire::build_response(&req, ResponseCode::ServFail, Vec::new())),
        };
        match built {
            Ok(resp) => Some(resp),
            Err(err) => {
                warn!(client = %peer, error = %err, "failed to build servfail");
                None
            }
        }
    }
}

fn create_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    let _ = socket.set_recv_buffer_size(SOCKET_BUFFER);
    let _ = socket.set_send_buffer_size(SOCKET_BUFFER);
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket.bind(&addr.into()).context("bind socket")?;
    Ok(socket.into())
}
