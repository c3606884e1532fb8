//! The query layer: a state machine over `begin` / `consume` /
//! `produce` / `finish`, shared by everything that turns packets into
//! packets.
//!
//! The server's query processor and the outbound requestor are both
//! implementations; transports drive whichever they are given and do
//! not care which direction the exchange runs in.

use bytes::BytesMut;

/// Where an exchange currently stands.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LayerState {
    /// Waiting for an incoming packet.
    Consume,
    /// Has an outgoing packet to emit.
    Produce,
    /// The exchange finished; whatever `produce` emitted should be
    /// shipped.
    Done,
    /// The exchange failed.  One more `produce` call may still emit a
    /// fault response (FORMERR, SERVFAIL); if it emits nothing the
    /// packet is dropped.
    Fail,
    /// Between exchanges; `begin` starts the next one.
    Reset,
}

/// One party of a packet exchange.
///
/// Server-side implementations `begin` into `Consume`; client-side
/// ones `begin` into `Produce`.  `produce` writes a whole packet into
/// the provided buffer (clearing it first) or leaves it untouched when
/// there is nothing to say.
pub trait Layer {
    fn begin(&mut self) -> LayerState;
    fn consume(&mut self, wire: &[u8]) -> LayerState;
    fn produce(&mut self, out: &mut BytesMut) -> LayerState;
    /// Clear per-exchange state so `begin` can run again.  Layer-local
    /// allocations may be kept for reuse.
    fn reset(&mut self) -> LayerState;
    /// End of the exchange.  The output buffer remains the caller's to
    /// flush.
    fn finish(&mut self);
}

/// Drive one server-side exchange: feed the incoming packet in, pump
/// the layer until it settles, and report whether the output buffer
/// holds a response to ship.
pub fn serve_exchange<L: Layer>(layer: &mut L, wire: &[u8], out: &mut BytesMut) -> bool {
    let mut state = layer.begin();
    if state == LayerState::Consume {
        state = layer.consume(wire);
    }
    while state == LayerState::Produce {
        state = layer.produce(out);
    }
    if state == LayerState::Fail {
        // fault responses are still worth shipping when the layer can
        // name the query they answer
        state = layer.produce(out);
    }
    layer.finish();

    state == LayerState::Done && !out.is_empty()
}
