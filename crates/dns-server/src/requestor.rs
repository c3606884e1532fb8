//! The outbound request engine: drives a client-side query layer
//! against a remote peer over UDP.  NOTIFY (RFC 1996) is its one user.

use bytes::BytesMut;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use dns_types::protocol::types::*;
use dns_types::zones::types::Zone;

use crate::layer::{Layer, LayerState};
use crate::metrics::NOTIFY_TOTAL;

/// How one outbound exchange is attempted.
#[derive(Debug, Clone, Copy)]
pub struct Requestor {
    /// Budget for one attempt against one address, send to receive.
    pub attempt_timeout: Duration,
    /// Local address to bind, if the enclosing process cares which
    /// interface the request leaves from.
    pub source: Option<SocketAddr>,
}

impl Default for Requestor {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(5),
            source: None,
        }
    }
}

impl Requestor {
    /// Run one exchange against one address: pump the layer's
    /// `produce` side out of the socket and its `consume` side from
    /// it, until the layer terminates.
    pub async fn request<L: Layer>(
        &self,
        layer: &mut L,
        target: SocketAddr,
    ) -> Result<(), RequestError> {
        let bind_addr = self.source.unwrap_or_else(|| {
            if target.is_ipv4() {
                SocketAddr::from(([0, 0, 0, 0], 0))
            } else {
                SocketAddr::from(([0u16; 8], 0))
            }
        });
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;

        let mut out = BytesMut::with_capacity(512);
        let mut wire = [0u8; 4096];
        let mut state = layer.begin();
        loop {
            match state {
                LayerState::Produce => {
                    out.clear();
                    state = layer.produce(&mut out);
                    if !out.is_empty() {
                        socket.send(&out).await?;
                    }
                }
                LayerState::Consume => {
                    let received = timeout(self.attempt_timeout, socket.recv(&mut wire))
                        .await
                        .map_err(|_| RequestError::Timeout)??;
                    state = layer.consume(&wire[..received]);
                }
                LayerState::Done => {
                    layer.finish();
                    return Ok(());
                }
                LayerState::Fail | LayerState::Reset => {
                    layer.finish();
                    return Err(RequestError::Rejected);
                }
            }
        }
    }

    /// Try each address of a remote in order, stopping at the first
    /// address the exchange succeeds against.
    pub async fn request_any<L: Layer>(
        &self,
        layer: &mut L,
        targets: &[SocketAddr],
    ) -> Result<SocketAddr, RequestError> {
        let mut last_error = RequestError::NoAddresses;
        for &target in targets {
            match self.request(layer, target).await {
                Ok(()) => return Ok(target),
                Err(error) => {
                    tracing::debug!(?target, %error, "request attempt failed");
                    last_error = error;
                    layer.reset();
                }
            }
        }
        Err(last_error)
    }
}

/// Why an outbound exchange failed.
#[derive(Debug)]
pub enum RequestError {
    /// No addresses were configured for the remote.
    NoAddresses,
    /// No response within the attempt budget.
    Timeout,
    /// The remote answered, but the layer rejected the response.
    Rejected,
    Network(io::Error),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RequestError::NoAddresses => write!(f, "no addresses to try"),
            RequestError::Timeout => write!(f, "timed out waiting for a response"),
            RequestError::Rejected => write!(f, "response rejected"),
            RequestError::Network(error) => write!(f, "network error: {error}"),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Network(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for RequestError {
    fn from(error: io::Error) -> Self {
        RequestError::Network(error)
    }
}

/// Build the NOTIFY message for a zone: opcode NOTIFY, AA set,
/// question (apex, SOA, IN), and the current SOA in the answer
/// section as an unsecured hint of the new serial.
pub fn notify_message(id: u16, zone: &Zone) -> Message {
    let mut message = Message::from_question(
        id,
        Question {
            name: zone.apex().clone(),
            qtype: QueryType::Record(RecordType::SOA),
            qclass: QueryClass::Record(RecordClass::IN),
        },
    );
    message.header.opcode = Opcode::Notify;
    message.header.is_authoritative = true;
    message.answers.push(zone.soa_rr());
    message
}

/// The client-side layer for one NOTIFY exchange: emit the request,
/// accept any response that echoes it with rcode 0.
pub struct NotifyLayer {
    request: Message,
    response: Option<Message>,
    emitted: bool,
}

impl NotifyLayer {
    pub fn new(request: Message) -> Self {
        Self {
            request,
            response: None,
            emitted: false,
        }
    }

    /// The accepted response, for inspection by the caller.
    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }
}

impl Layer for NotifyLayer {
    fn begin(&mut self) -> LayerState {
        LayerState::Produce
    }

    fn consume(&mut self, wire: &[u8]) -> LayerState {
        let Ok(response) = Message::from_octets(wire) else {
            return LayerState::Fail;
        };

        if !response.header.is_response || response.header.id != self.request.header.id {
            return LayerState::Fail;
        }

        // success is rcode 0 with no extended bits (RFC 1996 section
        // 4.7 leaves other rcodes to the primary's discretion; we
        // treat them all as this target declining)
        let extended_ok = match response.edns() {
            Ok(edns) => edns.map_or(true, |edns| edns.extended_rcode == 0),
            Err(_) => false,
        };
        if response.header.rcode == Rcode::NoError && extended_ok {
            self.response = Some(response);
            LayerState::Done
        } else {
            LayerState::Fail
        }
    }

    fn produce(&mut self, out: &mut BytesMut) -> LayerState {
        if self.emitted {
            return LayerState::Fail;
        }
        let buf = std::mem::take(out);
        match self.request.to_octets_in(buf) {
            Ok(octets) => {
                *out = octets;
                self.emitted = true;
                LayerState::Consume
            }
            Err(error) => {
                tracing::warn!(%error, "could not serialise notify");
                LayerState::Fail
            }
        }
    }

    fn reset(&mut self) -> LayerState {
        self.response = None;
        self.emitted = false;
        LayerState::Reset
    }

    fn finish(&mut self) {}
}

/// Send NOTIFY for a zone to one remote, trying its addresses in
/// order.  Returns the accepted response.
pub async fn send_notify(
    requestor: &Requestor,
    zone: &Zone,
    targets: &[SocketAddr],
) -> Result<Message, RequestError> {
    let id = rand::random();
    let mut layer = NotifyLayer::new(notify_message(id, zone));

    match requestor.request_any(&mut layer, targets).await {
        Ok(target) => {
            NOTIFY_TOTAL.with_label_values(&["accepted"]).inc();
            tracing::info!(apex = %zone.apex(), ?target, "notify accepted");
            // a Done layer always holds a response
            Ok(layer.response().cloned().unwrap_or_else(|| {
                Message::make_format_error_response(id)
            }))
        }
        Err(error) => {
            NOTIFY_TOTAL.with_label_values(&["failed"]).inc();
            tracing::warn!(apex = %zone.apex(), %error, "notify failed");
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;
    use dns_types::zones::types::test_util::*;

    fn test_requestor() -> Requestor {
        Requestor {
            attempt_timeout: Duration::from_millis(500),
            source: None,
        }
    }

    /// A secondary that accepts every NOTIFY, after checking its
    /// shape.
    async fn accepting_secondary() -> (SocketAddr, tokio::task::JoinHandle<Message>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = Message::from_octets(&buf[..len]).unwrap();

            let response = request.make_response();
            socket
                .send_to(&response.to_octets().unwrap(), peer)
                .await
                .unwrap();
            request
        });

        (addr, task)
    }

    #[test]
    fn notify_message_shape() {
        let message = notify_message(7, &test_zone());

        assert_eq!(Opcode::Notify, message.header.opcode);
        assert!(message.header.is_authoritative);
        assert!(!message.header.is_response);
        assert_eq!(
            vec![Question {
                name: domain("example.com."),
                qtype: QueryType::Record(RecordType::SOA),
                qclass: QueryClass::Record(RecordClass::IN),
            }],
            message.questions
        );
        assert_eq!(1, message.answers.len());
        assert_eq!(
            RecordType::SOA,
            message.answers[0].rtype_with_data.rtype()
        );
    }

    #[tokio::test]
    async fn notify_roundtrip() {
        let (addr, secondary) = accepting_secondary().await;
        let zone = test_zone();

        let response = send_notify(&test_requestor(), &zone, &[addr]).await.unwrap();
        assert_eq!(Rcode::NoError, response.header.rcode);

        let seen = secondary.await.unwrap();
        assert_eq!(Opcode::Notify, seen.header.opcode);
        assert_eq!(domain("example.com."), seen.questions[0].name);
    }

    #[tokio::test]
    async fn notify_falls_through_to_the_next_address() {
        // first address never answers, second accepts
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        let (live_addr, secondary) = accepting_secondary().await;

        let zone = test_zone();
        let requestor = Requestor {
            attempt_timeout: Duration::from_millis(200),
            source: None,
        };

        let mut layer = NotifyLayer::new(notify_message(9, &zone));
        let winner = requestor
            .request_any(&mut layer, &[dead_addr, live_addr])
            .await
            .unwrap();

        assert_eq!(live_addr, winner);
        assert!(layer.response().is_some());
        secondary.await.unwrap();
    }

    #[tokio::test]
    async fn notify_rejection_is_an_error() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = Message::from_octets(&buf[..len]).unwrap();

            let mut response = request.make_response();
            response.header.rcode = Rcode::Refused;
            socket
                .send_to(&response.to_octets().unwrap(), peer)
                .await
                .unwrap();
        });

        let zone = test_zone();
        let result = send_notify(&test_requestor(), &zone, &[addr]).await;
        assert!(matches!(result, Err(RequestError::Rejected)));
    }

    #[tokio::test]
    async fn no_addresses_is_an_error() {
        let zone = test_zone();
        let result = send_notify(&test_requestor(), &zone, &[]).await;
        assert!(matches!(result, Err(RequestError::NoAddresses)));
    }
}
