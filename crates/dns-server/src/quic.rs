//! DNS over QUIC (RFC 9250).
//!
//! Datagram classification, connection-ID demultiplexing, version
//! negotiation, and the TLS handshake all live inside the `quinn`
//! endpoint; this module is the serving side on top of it: retry-based
//! address validation for unvalidated peers, a per-endpoint connection
//! table enforcing a capacity and tracking peers, and one DNS message
//! per bidirectional stream, with the usual 2-byte length prefix.

use bytes::BytesMut;
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Connection, Endpoint, EndpointConfig, IdleTimeout, Incoming, TokioRuntime, VarInt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::layer::serve_exchange;
use crate::metrics::{
    DNS_REQUESTS_TOTAL, DNS_RESPONSES_TOTAL, DNS_RESPONSE_TIME_SECONDS, QUIC_CONNECTIONS_ACTIVE,
};
use crate::process::{QueryProcessor, TransportPolicy, STREAM_MESSAGE_MAX};
use crate::ServerError;

/// The ALPN token for DNS over dedicated QUIC connections.
pub const DOQ_ALPN: &[u8] = b"doq";

/// Application error codes from RFC 9250 section 4.3.
pub const DOQ_NO_ERROR: u32 = 0x0;
pub const DOQ_INTERNAL_ERROR: u32 = 0x1;
pub const DOQ_PROTOCOL_ERROR: u32 = 0x2;

/// Tuning for one QUIC endpoint.
#[derive(Debug, Clone, Copy)]
pub struct QuicConfig {
    /// Connections the endpoint will serve at once; excess peers are
    /// refused at the handshake.
    pub max_connections: usize,
    /// Query streams one connection may have open at once.
    pub max_streams: u32,
    /// Idle time after which a connection is dropped.
    pub idle_timeout: Duration,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            max_connections: 512,
            max_streams: 64,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-endpoint accounting of live connections.  `quinn` already
/// routes datagrams to connection state by DCID; this table covers
/// what the endpoint does not track for us: a serving capacity, and
/// the most recent peer address per connection.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    max: usize,
    entries: HashMap<usize, SocketAddr>,
}

impl ConnectionTable {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            entries: HashMap::new(),
        }
    }

    /// Claim a slot.  Fails when the table is full.
    pub fn try_register(&mut self, id: usize, peer: SocketAddr) -> bool {
        if self.entries.len() >= self.max && !self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, peer);
        true
    }

    /// Record the peer a connection was most recently seen from (it
    /// can change under connection migration).
    pub fn update_peer(&mut self, id: usize, peer: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&id) {
            *entry = peer;
        }
    }

    pub fn peer(&self, id: usize) -> Option<SocketAddr> {
        self.entries.get(&id).copied()
    }

    pub fn release(&mut self, id: usize) {
        self.entries.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// RFC 9250 section 4.2: over DoQ the DNS message ID must be zero.
fn message_id_is_zero(wire: &[u8]) -> bool {
    wire.len() >= 2 && wire[0] == 0 && wire[1] == 0
}

/// Serve DNS over QUIC on one already-bound UDP socket until
/// cancelled.  The TLS configuration's ALPN list is overridden to
/// `doq`.
pub async fn serve_quic(
    socket: std::net::UdpSocket,
    mut tls: rustls::ServerConfig,
    catalog: Arc<Catalog>,
    config: QuicConfig,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    tls.alpn_protocols = vec![DOQ_ALPN.to_vec()];
    let crypto = QuicServerConfig::try_from(tls)
        .map_err(|error| ServerError::Protocol(format!("unusable TLS configuration: {error}")))?;

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    let mut transport = quinn::TransportConfig::default();
    transport.max_concurrent_bidi_streams(VarInt::from_u32(config.max_streams));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));
    transport.max_idle_timeout(Some(IdleTimeout::try_from(config.idle_timeout).map_err(
        |_| ServerError::InvalidArgument("idle timeout out of range".to_string()),
    )?));
    server_config.transport_config(Arc::new(transport));

    socket.set_nonblocking(true)?;
    let endpoint = Endpoint::new(
        EndpointConfig::default(),
        Some(server_config),
        socket,
        Arc::new(TokioRuntime),
    )?;
    let local = endpoint.local_addr()?;
    tracing::info!(%local, "serving QUIC");

    let table = Arc::new(Mutex::new(ConnectionTable::new(config.max_connections)));

    loop {
        let incoming = tokio::select! {
            () = cancel.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };

        handle_incoming(incoming, &catalog, &table, &cancel);
    }

    // connections observe the close and unwind on their own
    endpoint.close(VarInt::from_u32(DOQ_NO_ERROR), b"server shutting down");
    endpoint.wait_idle().await;
    tracing::info!(%local, "QUIC endpoint stopped");
    Ok(())
}

fn handle_incoming(
    incoming: Incoming,
    catalog: &Arc<Catalog>,
    table: &Arc<Mutex<ConnectionTable>>,
    cancel: &CancellationToken,
) {
    // address validation: make unvalidated peers prove their source
    // address with a retry token before any state is committed
    if !incoming.remote_address_validated() {
        if let Err(error) = incoming.retry() {
            tracing::debug!(%error, "QUIC retry failed");
        }
        return;
    }

    let peer = incoming.remote_address();
    let connecting = match incoming.accept() {
        Ok(connecting) => connecting,
        Err(error) => {
            tracing::debug!(?peer, %error, "QUIC accept error");
            return;
        }
    };

    let catalog = catalog.clone();
    let table = table.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let connection = match connecting.await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::debug!(?peer, %error, "QUIC handshake failed");
                return;
            }
        };

        let id = connection.stable_id();
        let registered = table
            .lock()
            .map(|mut table| table.try_register(id, connection.remote_address()))
            .unwrap_or(false);
        if !registered {
            tracing::debug!(?peer, "QUIC connection table full");
            connection.close(VarInt::from_u32(DOQ_NO_ERROR), b"server busy");
            return;
        }
        QUIC_CONNECTIONS_ACTIVE.inc();

        serve_connection(&connection, &catalog, &table, &cancel).await;

        QUIC_CONNECTIONS_ACTIVE.dec();
        if let Ok(mut table) = table.lock() {
            table.release(id);
        }
    });
}

async fn serve_connection(
    connection: &Connection,
    catalog: &Arc<Catalog>,
    table: &Arc<Mutex<ConnectionTable>>,
    cancel: &CancellationToken,
) {
    let peer = connection.remote_address();
    tracing::debug!(?peer, "QUIC connection");

    loop {
        let stream = tokio::select! {
            () = cancel.cancelled() => {
                connection.close(VarInt::from_u32(DOQ_NO_ERROR), b"server shutting down");
                break;
            }
            stream = connection.accept_bi() => stream,
        };

        let (send, recv) = match stream {
            Ok(stream) => stream,
            Err(error) => {
                tracing::debug!(?peer, %error, "QUIC connection done");
                break;
            }
        };

        if let Ok(mut table) = table.lock() {
            table.update_peer(connection.stable_id(), connection.remote_address());
        }

        let connection = connection.clone();
        let catalog = catalog.clone();
        tokio::spawn(async move {
            serve_stream(&connection, send, recv, &catalog).await;
        });
    }
}

async fn serve_stream(
    connection: &Connection,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    catalog: &Catalog,
) {
    let mut prefix = [0u8; 2];
    if recv.read_exact(&mut prefix).await.is_err() {
        return;
    }
    let expected = usize::from(u16::from_be_bytes(prefix));

    let mut wire = vec![0u8; expected];
    if recv.read_exact(&mut wire).await.is_err() {
        return;
    }

    if !message_id_is_zero(&wire) {
        // fatal for the whole connection, per RFC 9250 section 4.2.1
        connection.close(
            VarInt::from_u32(DOQ_PROTOCOL_ERROR),
            b"DNS message ID must be zero",
        );
        return;
    }

    DNS_REQUESTS_TOTAL.with_label_values(&["quic"]).inc();
    let timer = DNS_RESPONSE_TIME_SECONDS
        .with_label_values(&["quic"])
        .start_timer();

    let mut processor = QueryProcessor::new(catalog, TransportPolicy::stream());
    let mut out = BytesMut::with_capacity(4096);
    let shipped = serve_exchange(&mut processor, &wire, &mut out);
    timer.observe_duration();

    if !shipped {
        let _ = send.finish();
        return;
    }
    if out.len() > STREAM_MESSAGE_MAX {
        connection.close(VarInt::from_u32(DOQ_INTERNAL_ERROR), b"response too large");
        return;
    }

    if let Some(summary) = processor.summary() {
        DNS_RESPONSES_TOTAL
            .with_label_values(&[
                "quic",
                &summary.authoritative.to_string(),
                &summary.truncated.to_string(),
                &summary.rcode.to_string(),
            ])
            .inc();
    }

    let prefix = u16::try_from(out.len()).unwrap_or(u16::MAX).to_be_bytes();
    if send.write_all(&prefix).await.is_err() {
        return;
    }
    if send.write_all(&out).await.is_err() {
        return;
    }
    let _ = send.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 1], port))
    }

    #[test]
    fn connection_table_enforces_capacity() {
        let mut table = ConnectionTable::new(2);

        assert!(table.try_register(1, addr(1000)));
        assert!(table.try_register(2, addr(2000)));
        assert!(!table.try_register(3, addr(3000)));

        table.release(1);
        assert!(table.try_register(3, addr(3000)));
        assert_eq!(2, table.len());
    }

    #[test]
    fn connection_table_reregistration_is_not_double_counted() {
        let mut table = ConnectionTable::new(1);

        assert!(table.try_register(1, addr(1000)));
        assert!(table.try_register(1, addr(1001)));
        assert_eq!(1, table.len());
        assert_eq!(Some(addr(1001)), table.peer(1));
    }

    #[test]
    fn connection_table_tracks_migrating_peers() {
        let mut table = ConnectionTable::new(4);

        assert!(table.try_register(7, addr(1000)));
        table.update_peer(7, addr(4000));
        assert_eq!(Some(addr(4000)), table.peer(7));

        // updates for unknown connections are dropped
        table.update_peer(8, addr(5000));
        assert_eq!(None, table.peer(8));
    }

    #[test]
    fn doq_message_id_check() {
        assert!(message_id_is_zero(&[0, 0, 1, 2, 3]));
        assert!(!message_id_is_zero(&[0, 1, 0, 0]));
        assert!(!message_id_is_zero(&[1]));
        assert!(!message_id_is_zero(&[]));
    }
}
