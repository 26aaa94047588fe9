//! Procman's own connection to the broker: a plain client connection used
//! to push `updateWorkers` descriptor updates and to poll `getStats` for
//! liveness, per spec §4.4 ("procman pushes authoritative descriptor
//! updates into the broker").
//!
//! Procman runs under `tokio` (it also needs `tokio::process` and
//! `tokio::signal`, neither of which `compio` provides), so this talks to
//! the broker over a plain `tokio::net::TcpStream` rather than reusing
//! [`flotilla_core::actor::SocketActor`], which is generic over `compio`'s
//! I/O traits. The wire codec itself ([`flotilla_wire::frame`]) is
//! runtime-agnostic.

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use flotilla_core::buffer::SegmentedBuffer;
use flotilla_core::error::{FlotillaError, ReplyStatus};
use flotilla_wire::frame::{encode_multipart, FrameAssembler, WireDecoder};
use flotilla_wire::protocol::{self, Frame};

use super::super::worker_runtime::client::{encode_call, resolve_call};

/// One-shot request/reply call against the broker's self-API or any other
/// named worker, as an ordinary client (spec §3's `C_CLIENT` role).
///
/// Opens a fresh connection per call: procman's call volume is low
/// (startup registration plus an occasional stats poll), so the
/// simplicity of not managing a persistent connection outweighs the
/// connection-setup cost.
///
/// # Errors
///
/// Returns [`ReplyStatus::Internal`] if the connection or the wire
/// protocol fails, or whatever status the broker's reply carries.
pub async fn call(addr: std::net::SocketAddr, worker_name: &str, method: &str, args: Value) -> Result<Value, FlotillaError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| FlotillaError::reply(ReplyStatus::Internal, format!("connect to broker failed: {e}")))?;

    let input = encode_call(method, args);
    let parts = protocol::encode_frame(Frame::ClientRequest {
        worker_name: worker_name.to_string(),
        input,
    });
    let mut out = BytesMut::new();
    encode_multipart(&parts, &mut out);
    stream
        .write_all(&out)
        .await
        .map_err(|e| FlotillaError::reply(ReplyStatus::Internal, format!("send to broker failed: {e}")))?;

    let mut buffer = SegmentedBuffer::new();
    let mut decoder = WireDecoder::new();
    let mut assembler = FrameAssembler::new(64, 16 * 1024 * 1024);
    let mut read_buf = vec![0_u8; 8192];

    loop {
        let n = stream
            .read(&mut read_buf)
            .await
            .map_err(|e| FlotillaError::reply(ReplyStatus::Internal, format!("read from broker failed: {e}")))?;
        if n == 0 {
            return Err(FlotillaError::reply(ReplyStatus::Internal, "broker closed connection before replying".into()));
        }
        buffer.push(Bytes::copy_from_slice(&read_buf[..n]));

        loop {
            match decoder.decode(&mut buffer) {
                Ok(Some(wire_frame)) => match assembler.push_frame(wire_frame) {
                    Ok(Some(parts)) => {
                        let Ok(frame) = protocol::parse_frame(parts) else { continue };
                        match frame {
                            Frame::ClientReply { output, .. } => {
                                let (tx, rx) = flume::unbounded();
                                resolve_call(&output, &tx);
                                return rx
                                    .try_recv()
                                    .map_err(|_| FlotillaError::reply(ReplyStatus::Internal, "no reply decoded".into()))?;
                            }
                            Frame::ClientProgress { .. } => {}
                            _ => {}
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return Err(FlotillaError::reply(ReplyStatus::Internal, format!("multipart violation: {e:?}"))),
                },
                Ok(None) => break,
                Err(e) => return Err(FlotillaError::reply(ReplyStatus::Internal, format!("wire violation: {e}"))),
            }
        }
    }
}
