//! Per-connection session: the glue between one transport connection and
//! the rest of the broker.
//!
//! One [`run_connection`] task owns exactly one [`SocketActor`], decoding
//! its byte stream into complete envelopes via [`WireDecoder`] +
//! [`FrameAssembler`] and handing each off to the broker core's inbound
//! channel; on the way back it turns `PeerCmd::SendBody` (routed to this
//! connection by [`RouterHub`]) into wire bytes.
//!
//! This is where the ROUTER envelope convention documented in
//! `flotilla_wire::protocol` actually gets applied: the routing id never
//! touches the wire here, since one TCP/IPC connection already *is* one
//! peer. It only exists as the in-process key `RouterHub` uses to decide
//! which connection's [`PeerCmd`] channel a reply goes to.

use bytes::{Bytes, BytesMut};
use compio::io::{AsyncRead, AsyncWrite};

use flotilla_core::actor::{SocketActor, SocketEvent, UserCmd};
use flotilla_core::alloc::IoArena;
use flotilla_core::router::{HubEvent, PeerCmd};
use flotilla_wire::frame::{FrameAssembler, WireDecoder};
use flotilla_wire::protocol::{self, Frame};
use flotilla_core::buffer::SegmentedBuffer;

/// Longest envelope on the wire today is a worker REQUEST frame (6 parts);
/// this leaves ample headroom for future growth while still bounding a
/// misbehaving peer.
pub const MAX_ENVELOPE_FRAMES: usize = 64;
/// Bounds a single envelope's total payload size (16 MiB).
pub const MAX_ENVELOPE_BYTES: usize = 16 * 1024 * 1024;

/// Drive one connection until it disconnects.
///
/// Registers `routing_id` with the router hub on entry and deregisters it
/// on exit; every complete, well-formed envelope is parsed and forwarded
/// on `inbound_tx` tagged with `routing_id`; every `PeerCmd` addressed to
/// this connection by the hub is encoded back onto the wire.
pub async fn run_connection<S>(
    stream: S,
    routing_id: Bytes,
    hub_tx: flume::Sender<HubEvent>,
    inbound_tx: flume::Sender<(Bytes, Frame)>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    use futures::{select, FutureExt};

    let (actor_event_tx, actor_event_rx) = flume::unbounded();
    let (actor_cmd_tx, actor_cmd_rx) = flume::unbounded();
    let actor = SocketActor::new(stream, actor_event_tx, actor_cmd_rx, IoArena::new());
    compio::runtime::spawn(actor.run()).detach();

    let (peer_cmd_tx, peer_cmd_rx) = flume::unbounded();
    let _ = hub_tx.send(HubEvent::PeerUp {
        routing_id: routing_id.clone(),
        tx: peer_cmd_tx,
    });

    let mut buffer = SegmentedBuffer::new();
    let mut decoder = WireDecoder::new();
    let mut assembler = FrameAssembler::new(MAX_ENVELOPE_FRAMES, MAX_ENVELOPE_BYTES);

    'outer: loop {
        select! {
            ev = actor_event_rx.recv_async().fuse() => {
                match ev {
                    Ok(SocketEvent::Connected) => {}
                    Ok(SocketEvent::ReceivedBytes(bytes)) => {
                        buffer.push(bytes);
                        if !drain_envelopes(&mut buffer, &mut decoder, &mut assembler, &routing_id, &inbound_tx) {
                            break 'outer;
                        }
                    }
                    Ok(SocketEvent::Disconnected) | Err(_) => break 'outer,
                }
            }
            cmd = peer_cmd_rx.recv_async().fuse() => {
                match cmd {
                    Ok(PeerCmd::SendBody(parts)) => {
                        let mut buf = BytesMut::new();
                        flotilla_wire::frame::encode_multipart(&parts, &mut buf);
                        let _ = actor_cmd_tx.send(UserCmd::SendBytes(buf.freeze()));
                    }
                    Ok(PeerCmd::Close) | Err(_) => {
                        let _ = actor_cmd_tx.send(UserCmd::Close);
                        break 'outer;
                    }
                }
            }
        }
    }

    let _ = hub_tx.send(HubEvent::PeerDown {
        routing_id: routing_id.clone(),
    });
    let _ = inbound_tx.send((routing_id, Frame::Disconnect));
}

/// Decode every frame currently available in `buffer`, forwarding
/// completed envelopes to `inbound_tx`.
///
/// Returns `false` if the connection violated wire framing or multipart
/// limits and must be torn down.
fn drain_envelopes(
    buffer: &mut SegmentedBuffer,
    decoder: &mut WireDecoder,
    assembler: &mut FrameAssembler,
    routing_id: &Bytes,
    inbound_tx: &flume::Sender<(Bytes, Frame)>,
) -> bool {
    loop {
        match decoder.decode(buffer) {
            Ok(Some(wire_frame)) => match assembler.push_frame(wire_frame) {
                Ok(Some(parts)) => match protocol::parse_frame(parts) {
                    Ok(frame) => {
                        let _ = inbound_tx.send((routing_id.clone(), frame));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed envelope");
                    }
                },
                Ok(None) => {}
                Err(_e) => {
                    tracing::warn!("multipart limit exceeded, closing connection");
                    return false;
                }
            },
            Ok(None) => return true,
            Err(_e) => {
                tracing::warn!("wire framing violation, closing connection");
                return false;
            }
        }
    }
}
