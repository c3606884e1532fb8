//! DNS over TCP (RFC 7766): a 2-byte length prefix both ways, no
//! truncation, consecutive queries on one connection.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::layer::{serve_exchange, Layer};
use crate::metrics::{DNS_REQUESTS_TOTAL, DNS_RESPONSES_TOTAL, DNS_RESPONSE_TIME_SECONDS};
use crate::process::{QueryProcessor, TransportPolicy, STREAM_MESSAGE_MAX};
use crate::ServerError;

/// Tuning for the TCP listener.
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
    /// How long a connection may sit idle between queries.
    pub idle_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Serve DNS over one already-bound TCP listener until cancelled.
pub async fn serve_tcp(
    listener: std::net::TcpListener,
    catalog: Arc<Catalog>,
    config: TcpConfig,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;
    let local = listener.local_addr()?;
    tracing::info!(%local, "serving TCP");

    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let catalog = catalog.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    serve_connection(stream, peer, &catalog, config, cancel).await;
                });
            }
            Err(error) => tracing::debug!(%error, "TCP accept error"),
        }
    }

    tracing::info!(%local, "TCP listener stopped");
    Ok(())
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    catalog: &Catalog,
    config: TcpConfig,
    cancel: CancellationToken,
) {
    tracing::debug!(?peer, "TCP connection");

    let mut processor = QueryProcessor::new(catalog, TransportPolicy::stream());
    let mut out = BytesMut::with_capacity(4096);

    loop {
        let wire = tokio::select! {
            () = cancel.cancelled() => break,
            read = timeout(config.idle_timeout, read_message(&mut stream)) => match read {
                // idle timeout
                Err(_) => break,
                Ok(Err(error)) => {
                    match error {
                        ReadError::Closed => (),
                        ReadError::TooShort { id: Some(id), .. } => {
                            let fault = dns_types::protocol::types::Message::make_format_error_response(id);
                            if let Ok(octets) = fault.to_octets() {
                                let _ = write_message(&mut stream, &octets).await;
                            }
                        }
                        _ => tracing::debug!(?peer, %error, "TCP read error"),
                    }
                    break;
                }
                Ok(Ok(wire)) => wire,
            },
        };

        DNS_REQUESTS_TOTAL.with_label_values(&["tcp"]).inc();
        let timer = DNS_RESPONSE_TIME_SECONDS
            .with_label_values(&["tcp"])
            .start_timer();

        out.clear();
        if serve_exchange(&mut processor, &wire, &mut out) {
            if let Some(summary) = processor.summary() {
                DNS_RESPONSES_TOTAL
                    .with_label_values(&[
                        "tcp",
                        &summary.authoritative.to_string(),
                        &summary.truncated.to_string(),
                        &summary.rcode.to_string(),
                    ])
                    .inc();
            }
            if let Err(error) = write_message(&mut stream, &out).await {
                tracing::debug!(?peer, %error, "TCP send error");
                timer.observe_duration();
                break;
            }
        }
        processor.reset();
        timer.observe_duration();
    }
}

/// Errors reading a length-prefixed message from a stream.
#[derive(Debug)]
pub enum ReadError {
    /// The peer closed the connection at a message boundary.
    Closed,
    /// The stream ended inside a message.  The ID is included when at
    /// least the first two payload octets arrived, so a FORMERR can
    /// name the query.
    TooShort {
        id: Option<u16>,
        expected: usize,
        actual: usize,
    },
    IO(io::Error),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ReadError::Closed => write!(f, "connection closed"),
            ReadError::TooShort {
                expected, actual, ..
            } => write!(f, "message ended early: wanted {expected} octets, got {actual}"),
            ReadError::IO(error) => write!(f, "{error}"),
        }
    }
}

/// Read one length-prefixed DNS message.
///
/// The prefix is redundant (the header says how many fields follow)
/// but it means a whole message can be read before parsing begins.
async fn read_message(stream: &mut TcpStream) -> Result<BytesMut, ReadError> {
    let expected = match stream.read_u16().await {
        Ok(size) => usize::from(size),
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(ReadError::Closed)
        }
        Err(error) => return Err(ReadError::IO(error)),
    };

    let mut bytes = BytesMut::with_capacity(expected);
    while bytes.len() < expected {
        let id = if bytes.len() >= 2 {
            Some(u16::from_be_bytes([bytes[0], bytes[1]]))
        } else {
            None
        };
        match stream.read_buf(&mut bytes).await {
            Ok(0) => {
                return Err(ReadError::TooShort {
                    id,
                    expected,
                    actual: bytes.len(),
                })
            }
            Ok(_) => (),
            Err(error) => return Err(ReadError::IO(error)),
        }
    }

    bytes.truncate(expected);
    Ok(bytes)
}

/// Write one length-prefixed DNS message.
async fn write_message(stream: &mut TcpStream, octets: &[u8]) -> Result<(), io::Error> {
    // the processor never builds a response this large, but the
    // prefix cannot express one either
    let len = u16::try_from(octets.len().min(STREAM_MESSAGE_MAX)).unwrap_or(u16::MAX);

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&octets[..usize::from(len)]).await?;
    stream.flush().await
}
