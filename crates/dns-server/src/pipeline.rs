//! The UDP serving loop: one task per handed-in socket, each cycling
//! through receive-batch / answer / send-batch / rewind.
//!
//! All transient buffers come from a per-worker pool that is rewound
//! between batches, so steady-state serving does not allocate.  The
//! zone snapshot lease is taken inside the processor after a datagram
//! has been read and released before anything is sent; workers share
//! nothing else.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::layer::{serve_exchange, Layer};
use crate::metrics::{DNS_REQUESTS_TOTAL, DNS_RESPONSES_TOTAL, DNS_RESPONSE_TIME_SECONDS};
use crate::process::{QueryProcessor, TransportPolicy, DEFAULT_UDP_PAYLOAD_MAX};
use crate::ServerError;

/// The largest datagram a worker will accept.  Anything longer than
/// the EDNS payload sizes this server negotiates cannot be a valid
/// query for it.
pub const MAX_DATAGRAM: usize = 4096;

/// Tuning for one UDP worker.
#[derive(Debug, Clone, Copy)]
pub struct UdpConfig {
    /// How many datagrams one readiness wakeup will drain before
    /// flushing responses.
    pub batch_size: usize,
    /// The largest response payload this server is willing to send
    /// over UDP, EDNS or not.
    pub payload_max: u16,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            payload_max: DEFAULT_UDP_PAYLOAD_MAX,
        }
    }
}

/// The per-worker buffer pool.  `take` hands out cleared buffers,
/// `rewind` returns them; nothing taken for one batch survives it.
struct Arena {
    free: Vec<BytesMut>,
}

impl Arena {
    fn new() -> Self {
        Self { free: Vec::new() }
    }

    fn take(&mut self) -> BytesMut {
        self.free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(MAX_DATAGRAM))
    }

    fn rewind(&mut self, mut buf: BytesMut) {
        buf.clear();
        self.free.push(buf);
    }
}

/// Serve DNS over one already-bound UDP socket until cancelled.
///
/// The socket comes from the enclosing process (which may bind one
/// per worker with `SO_REUSEPORT`); this function never binds
/// anything itself.
pub async fn serve_udp(
    socket: std::net::UdpSocket,
    catalog: Arc<Catalog>,
    config: UdpConfig,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket)?;
    let local = socket.local_addr()?;
    tracing::info!(%local, "serving UDP");

    let mut processor = QueryProcessor::new(
        &catalog,
        TransportPolicy::datagram(config.payload_max),
    );
    let mut arena = Arena::new();
    let mut batch: Vec<(BytesMut, SocketAddr)> = Vec::with_capacity(config.batch_size);
    let mut outputs: Vec<(BytesMut, SocketAddr)> = Vec::with_capacity(config.batch_size);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            ready = socket.readable() => ready?,
        }

        // drain up to one batch without blocking
        while batch.len() < config.batch_size {
            let mut buf = arena.take();
            buf.resize(MAX_DATAGRAM, 0);
            match socket.try_recv_from(&mut buf) {
                Ok((len, peer)) => {
                    buf.truncate(len);
                    batch.push((buf, peer));
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    arena.rewind(buf);
                    break;
                }
                Err(error) => {
                    // transient per-datagram errors (e.g. connection
                    // refused bounces) do not take the socket down
                    arena.rewind(buf);
                    tracing::debug!(%error, "UDP receive error");
                    break;
                }
            }
        }

        // answer each datagram; no await happens in this section, so
        // the snapshot lease the processor takes is never held across
        // a suspension
        for (wire, peer) in batch.drain(..) {
            DNS_REQUESTS_TOTAL.with_label_values(&["udp"]).inc();
            let timer = DNS_RESPONSE_TIME_SECONDS
                .with_label_values(&["udp"])
                .start_timer();

            let mut out = arena.take();
            if serve_exchange(&mut processor, &wire, &mut out) {
                if let Some(summary) = processor.summary() {
                    DNS_RESPONSES_TOTAL
                        .with_label_values(&[
                            "udp",
                            &summary.authoritative.to_string(),
                            &summary.truncated.to_string(),
                            &summary.rcode.to_string(),
                        ])
                        .inc();
                }
                outputs.push((out, peer));
            } else {
                arena.rewind(out);
            }
            processor.reset();
            arena.rewind(wire);
            timer.observe_duration();
        }

        // flush the batch, waiting out backpressure
        for (out, peer) in outputs.drain(..) {
            loop {
                match socket.try_send_to(&out, peer) {
                    Ok(_) => break,
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                        if let Err(error) = socket.writable().await {
                            tracing::debug!(%error, "UDP send wait failed");
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::debug!(?peer, %error, "UDP send error");
                        break;
                    }
                }
            }
            arena.rewind(out);
        }
    }

    tracing::info!(%local, "UDP worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;
    use dns_types::protocol::types::*;
    use dns_types::zones::types::test_util::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::time::timeout;

    fn a_query(id: u16, name: &str) -> Vec<u8> {
        Message::from_question(
            id,
            Question {
                name: domain(name),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        )
        .to_octets()
        .unwrap()
        .to_vec()
    }

    async fn start_server() -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let catalog = Arc::new(Catalog::new(test_zone_set()));
        let cancel = CancellationToken::new();

        let worker_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            serve_udp(socket, catalog, UdpConfig::default(), worker_cancel)
                .await
                .unwrap();
        });

        (addr, cancel, task)
    }

    #[tokio::test]
    async fn serves_a_query() {
        let (addr, cancel, task) = start_server().await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&a_query(7, "a.example.com."), addr)
            .await
            .unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        let response = Message::from_octets(&buf[..len]).unwrap();
        assert_eq!(7, response.header.id);
        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.header.is_authoritative);
        assert_eq!(
            vec![a_record("a.example.com.", Ipv4Addr::new(192, 0, 2, 1))],
            response.answers
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn serves_a_burst_of_queries() {
        let (addr, cancel, task) = start_server().await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for id in 0..32u16 {
            client
                .send_to(&a_query(id, "a.example.com."), addr)
                .await
                .unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        let mut buf = [0u8; MAX_DATAGRAM];
        while seen.len() < 32 {
            let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let response = Message::from_octets(&buf[..len]).unwrap();
            assert_eq!(Rcode::NoError, response.header.rcode);
            seen.insert(response.header.id);
        }

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn drops_garbage_but_keeps_serving() {
        let (addr, cancel, task) = start_server().await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0x01], addr).await.unwrap();
        client
            .send_to(&a_query(9, "a.example.com."), addr)
            .await
            .unwrap();

        // only the well-formed query is answered
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = Message::from_octets(&buf[..len]).unwrap();
        assert_eq!(9, response.header.id);

        assert!(
            timeout(Duration::from_millis(200), client.recv_from(&mut buf))
                .await
                .is_err()
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stops_on_cancellation() {
        let (_addr, cancel, task) = start_server().await;
        cancel.cancel();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
