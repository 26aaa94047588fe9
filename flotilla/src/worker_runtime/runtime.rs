//! Worker process runtime: connects to the broker, announces readiness,
//! and drives the [`Dispatcher`] against the actual wire.
//!
//! This is the piece a worker binary (e.g. `demos/echo_worker.rs`) calls
//! into after building its [`MethodTable`]; everything up to here
//! (key-set locks, timeout/cancellation, progress notifications) is
//! transport-agnostic and lives in [`super::dispatch`] / [`super::methods`].

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use compio::io::{AsyncRead, AsyncWrite};
use serde_json::Value;

use flotilla_core::actor::{SocketActor, SocketEvent, UserCmd};
use flotilla_core::alloc::IoArena;
use flotilla_core::buffer::SegmentedBuffer;
use flotilla_core::error::FlotillaError;
use flotilla_wire::frame::{encode_multipart, FrameAssembler, WireDecoder};
use flotilla_wire::protocol::{self, Frame};

use super::dispatch::{encode_timeout, finalize_reply, Dispatcher, ReadyRequest};
use super::methods::{MethodTable, Progress};

/// How often the worker sends an unsolicited heartbeat frame.
pub const WORKER_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// How often the worker sweeps its own deadlines for expired requests
/// (matches the broker's own timeout-sweep cadence).
pub const WORKER_TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// One completed (or timed-out-before-completion) handler invocation
/// reported back to the main loop, which owns the [`Dispatcher`] and must
/// serialize `release()` calls against new `accept()` calls.
struct HandlerDone {
    token: super::locks::RequestToken,
    request_id: Bytes,
    method: String,
    result: Result<Value, FlotillaError>,
    cancelled: bool,
}

enum LoopEvent {
    Inbound(Frame),
    Done(HandlerDone),
    HeartbeatTick,
    TimeoutTick,
    SocketClosed,
}

/// Run one worker process's connection to the broker until the socket
/// closes.
///
/// `output_validation_enabled` mirrors spec §4.5 step 4: when `false`, a
/// method whose output fails its schema replies `INTERNAL` instead of
/// `INVALID` (treated as a bug in the handler rather than a client error).
pub async fn run<S>(stream: S, worker_name: &str, methods: MethodTable, output_validation_enabled: bool)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    use futures::{select, FutureExt};

    let (actor_event_tx, actor_event_rx) = flume::unbounded();
    let (actor_cmd_tx, actor_cmd_rx) = flume::unbounded();
    let actor = SocketActor::new(stream, actor_event_tx, actor_cmd_rx, IoArena::new());
    compio::runtime::spawn(actor.run()).detach();

    send_frame(&actor_cmd_tx, Frame::WorkerReady {
        worker_name: worker_name.to_string(),
        info: Bytes::new(),
    });

    let (loop_tx, loop_rx) = flume::unbounded::<LoopEvent>();

    {
        let loop_tx = loop_tx.clone();
        compio::runtime::spawn(async move {
            loop {
                compio::time::sleep(WORKER_HEARTBEAT_INTERVAL).await;
                if loop_tx.send(LoopEvent::HeartbeatTick).is_err() {
                    break;
                }
            }
        })
        .detach();
    }

    {
        let loop_tx = loop_tx.clone();
        compio::runtime::spawn(async move {
            loop {
                compio::time::sleep(WORKER_TIMEOUT_SWEEP_INTERVAL).await;
                if loop_tx.send(LoopEvent::TimeoutTick).is_err() {
                    break;
                }
            }
        })
        .detach();
    }

    {
        let loop_tx = loop_tx.clone();
        compio::runtime::spawn(async move {
            let mut buffer = SegmentedBuffer::new();
            let mut decoder = WireDecoder::new();
            let mut assembler = FrameAssembler::new(64, 16 * 1024 * 1024);
            loop {
                match actor_event_rx.recv_async().await {
                    Ok(SocketEvent::ReceivedBytes(bytes)) => {
                        buffer.push(bytes);
                        loop {
                            match decoder.decode(&mut buffer) {
                                Ok(Some(wire_frame)) => match assembler.push_frame(wire_frame) {
                                    Ok(Some(parts)) => {
                                        if let Ok(frame) = protocol::parse_frame(parts) {
                                            if loop_tx.send(LoopEvent::Inbound(frame)).is_err() {
                                                return;
                                            }
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(_) => {
                                        let _ = loop_tx.send(LoopEvent::SocketClosed);
                                        return;
                                    }
                                },
                                Ok(None) => break,
                                Err(_) => {
                                    let _ = loop_tx.send(LoopEvent::SocketClosed);
                                    return;
                                }
                            }
                        }
                    }
                    Ok(SocketEvent::Connected) => {}
                    Ok(SocketEvent::Disconnected) | Err(_) => {
                        let _ = loop_tx.send(LoopEvent::SocketClosed);
                        return;
                    }
                }
            }
        })
        .detach();
    }

    let mut dispatcher = Dispatcher::new(methods);

    loop {
        let event = match loop_rx.recv_async().await {
            Ok(e) => e,
            Err(_) => break,
        };
        match event {
            LoopEvent::SocketClosed => break,
            LoopEvent::HeartbeatTick => send_frame(&actor_cmd_tx, Frame::Heartbeat),
            LoopEvent::TimeoutTick => {
                for (request_id, method) in dispatcher.sweep_timeouts(std::time::Instant::now()) {
                    send_frame(&actor_cmd_tx, Frame::WorkerReply {
                        request_id,
                        output: encode_timeout(&method),
                    });
                }
            }
            LoopEvent::Inbound(Frame::WorkerRequest { request_id, input }) => {
                match dispatcher.accept(request_id.clone(), &input) {
                    Ok(Some(ready)) => spawn_handler(&dispatcher, ready, &actor_cmd_tx, &loop_tx),
                    Ok(None) => {}
                    Err(output) => send_frame(&actor_cmd_tx, Frame::WorkerReply { request_id, output }),
                }
            }
            LoopEvent::Inbound(Frame::Heartbeat) | LoopEvent::Inbound(Frame::Disconnect) => {}
            LoopEvent::Inbound(_) => {
                tracing::warn!("worker received a frame shape it never expects");
            }
            LoopEvent::Done(done) => {
                let method = dispatcher.method(&done.method);
                let validate_output = method.map(|m| m.validate_output.as_ref());
                let output = finalize_reply(
                    &done.method,
                    done.result,
                    done.cancelled,
                    validate_output,
                    output_validation_enabled,
                );
                if let Some(output) = output {
                    send_frame(&actor_cmd_tx, Frame::WorkerReply { request_id: done.request_id.clone(), output });
                }
                for ready in dispatcher.release(done.token, &done.request_id) {
                    spawn_handler(&dispatcher, ready, &actor_cmd_tx, &loop_tx);
                }
            }
        }
    }
}

/// Spawn one handler invocation: forwards progress items as they're
/// emitted and reports completion back to the main loop via `loop_tx` so
/// `Dispatcher::release` stays single-threaded.
fn spawn_handler(
    dispatcher: &Dispatcher,
    ready: ReadyRequest,
    actor_cmd_tx: &flume::Sender<UserCmd>,
    loop_tx: &flume::Sender<LoopEvent>,
) {
    let handler = dispatcher
        .method(&ready.method)
        .map(super::methods::MethodSpec::handler_arc)
        .unwrap_or_else(super::methods::unimplemented_handler);
    run_handler(ready, actor_cmd_tx.clone(), loop_tx.clone(), handler);
}

fn run_handler(
    ready: ReadyRequest,
    actor_cmd_tx: flume::Sender<UserCmd>,
    loop_tx: flume::Sender<LoopEvent>,
    handler: std::sync::Arc<dyn super::methods::Handler>,
) {
    let (progress_tx, progress_rx) = flume::unbounded::<Progress>();
    let request_id = ready.request_id.clone();
    let token = ready.token;
    let method = ready.method.clone();
    let cancel = ready.cancel.clone();
    let ctx = ready.context(progress_tx);

    {
        let actor_cmd_tx = actor_cmd_tx.clone();
        let request_id = request_id.clone();
        compio::runtime::spawn(async move {
            while let Ok(item) = progress_rx.recv_async().await {
                let payload = Bytes::from(serde_json::to_vec(&item).unwrap_or_default());
                send_frame(
                    &actor_cmd_tx,
                    Frame::WorkerProgress {
                        request_id: request_id.clone(),
                        item: payload,
                    },
                );
            }
        })
        .detach();
    }

    compio::runtime::spawn(async move {
        let result = handler.call(ctx).await;
        let cancelled = cancel.is_cancelled();
        let _ = loop_tx.send(LoopEvent::Done(HandlerDone {
            token,
            request_id,
            method,
            result,
            cancelled,
        }));
    })
    .detach();
}

fn send_frame(cmd_tx: &flume::Sender<UserCmd>, frame: Frame) {
    let parts = protocol::encode_frame(frame);
    let mut buf = BytesMut::new();
    encode_multipart(&parts, &mut buf);
    let _ = cmd_tx.send(UserCmd::SendBytes(buf.freeze()));
}
