//! The broker/worker wire protocol: a variant of the Majordomo pattern.
//!
//! Two command bytes distinguish client frames from worker frames; worker
//! frames carry a one-octet sub-command. Every envelope after the routing
//! id carries a mandatory empty delimiter frame, mirroring the
//! classic MDP framing this protocol generalizes:
//!
//! - Client -> broker request:  `[empty, C_CLIENT, workerName, input]`
//! - Broker -> worker request:  `[empty, W_WORKER, W_REQUEST, requestId, empty, input]`
//! - Worker -> broker reply:    `[empty, W_WORKER, W_REPLY, requestId, empty, output]`
//! - Worker -> broker ready:    `[empty, W_WORKER, W_READY, workerName, info]`
//! - Broker -> client reply:    `[empty, C_CLIENT, workerName, output]`
//! - Heartbeat (either way):    `[empty, W_WORKER, W_HEARTBEAT]`
//! - Disconnect (either way):   `[empty, W_WORKER, W_DISCONNECT]`
//!
//! The routing id itself is not part of these parts: it is the envelope
//! the transport's ROUTER hub strips on receive and prepends on send (see
//! `flotilla_core::router`), so every function here operates purely on
//! the body.

use bytes::Bytes;
use flotilla_core::error::FlotillaError;

/// Command byte: this envelope is a client frame.
pub const C_CLIENT: u8 = 0x01;
/// Command byte: this envelope is a worker frame.
pub const W_WORKER: u8 = 0x02;

/// Worker sub-command: announce readiness.
pub const W_READY: u8 = 0x01;
/// Worker sub-command: broker dispatching a request to a worker.
pub const W_REQUEST: u8 = 0x02;
/// Worker sub-command: worker returning a reply.
pub const W_REPLY: u8 = 0x03;
/// Worker sub-command: liveness heartbeat.
pub const W_HEARTBEAT: u8 = 0x04;
/// Worker sub-command: graceful disconnect.
pub const W_DISCONNECT: u8 = 0x05;
/// Worker sub-command: progress notification for an in-flight request.
pub const W_PROGRESS: u8 = 0x06;

/// Command byte: this envelope is a progress notification forwarded to a
/// client, on the same connection as the eventual reply.
pub const C_CLIENT_PROGRESS: u8 = 0x03;

fn empty() -> Bytes {
    Bytes::new()
}

/// `[empty, C_CLIENT, workerName, input]`
#[must_use]
pub fn encode_client_request(worker_name: &str, input: Bytes) -> Vec<Bytes> {
    vec![
        empty(),
        Bytes::from_static(&[C_CLIENT]),
        Bytes::copy_from_slice(worker_name.as_bytes()),
        input,
    ]
}

/// `[empty, C_CLIENT, workerName, output]`
#[must_use]
pub fn encode_client_reply(worker_name: &str, output: Bytes) -> Vec<Bytes> {
    vec![
        empty(),
        Bytes::from_static(&[C_CLIENT]),
        Bytes::copy_from_slice(worker_name.as_bytes()),
        output,
    ]
}

/// `[empty, W_WORKER, W_REQUEST, requestId, empty, input]`
#[must_use]
pub fn encode_worker_request(request_id: Bytes, input: Bytes) -> Vec<Bytes> {
    vec![
        empty(),
        Bytes::from_static(&[W_WORKER]),
        Bytes::from_static(&[W_REQUEST]),
        request_id,
        empty(),
        input,
    ]
}

/// `[empty, W_WORKER, W_REPLY, requestId, empty, output]`
#[must_use]
pub fn encode_worker_reply(request_id: Bytes, output: Bytes) -> Vec<Bytes> {
    vec![
        empty(),
        Bytes::from_static(&[W_WORKER]),
        Bytes::from_static(&[W_REPLY]),
        request_id,
        empty(),
        output,
    ]
}

/// `[empty, W_WORKER, W_READY, workerName, optionalInfo]`
#[must_use]
pub fn encode_worker_ready(worker_name: &str, info: Bytes) -> Vec<Bytes> {
    vec![
        empty(),
        Bytes::from_static(&[W_WORKER]),
        Bytes::from_static(&[W_READY]),
        Bytes::copy_from_slice(worker_name.as_bytes()),
        info,
    ]
}

/// `[empty, W_WORKER, W_HEARTBEAT]`
#[must_use]
pub fn encode_heartbeat() -> Vec<Bytes> {
    vec![empty(), Bytes::from_static(&[W_WORKER]), Bytes::from_static(&[W_HEARTBEAT])]
}

/// `[empty, W_WORKER, W_DISCONNECT]`
#[must_use]
pub fn encode_disconnect() -> Vec<Bytes> {
    vec![empty(), Bytes::from_static(&[W_WORKER]), Bytes::from_static(&[W_DISCONNECT])]
}

/// `[empty, W_WORKER, W_PROGRESS, requestId, empty, item]`
#[must_use]
pub fn encode_worker_progress(request_id: Bytes, item: Bytes) -> Vec<Bytes> {
    vec![
        empty(),
        Bytes::from_static(&[W_WORKER]),
        Bytes::from_static(&[W_PROGRESS]),
        request_id,
        empty(),
        item,
    ]
}

/// `[empty, C_CLIENT_PROGRESS, workerName, item]`
#[must_use]
pub fn encode_client_progress(worker_name: &str, item: Bytes) -> Vec<Bytes> {
    vec![
        empty(),
        Bytes::from_static(&[C_CLIENT_PROGRESS]),
        Bytes::copy_from_slice(worker_name.as_bytes()),
        item,
    ]
}

/// A decoded envelope, with the routing-id/empty-delimiter framing
/// already stripped.
#[derive(Debug, Clone)]
pub enum Frame {
    ClientRequest { worker_name: String, input: Bytes },
    ClientReply { worker_name: String, output: Bytes },
    /// A progress item forwarded to a client on the same connection as
    /// the eventual reply (spec §4.5 "Progress notifications").
    ClientProgress { worker_name: String, item: Bytes },
    WorkerReady { worker_name: String, info: Bytes },
    WorkerRequest { request_id: Bytes, input: Bytes },
    WorkerReply { request_id: Bytes, output: Bytes },
    WorkerProgress { request_id: Bytes, item: Bytes },
    Heartbeat,
    Disconnect,
}

fn one_octet(part: &Bytes, what: &str) -> Result<u8, FlotillaError> {
    if part.len() != 1 {
        return Err(FlotillaError::invalid_frame(format!(
            "{what} must be exactly one octet, got {} bytes",
            part.len()
        )));
    }
    Ok(part[0])
}

fn utf8(part: Bytes, what: &str) -> Result<String, FlotillaError> {
    String::from_utf8(part.to_vec())
        .map_err(|_| FlotillaError::invalid_frame(format!("{what} is not valid UTF-8")))
}

/// Encode a [`Frame`] back into wire parts, the inverse of [`parse_frame`]
/// for the directions the broker actually sends.
#[must_use]
pub fn encode_frame(frame: Frame) -> Vec<Bytes> {
    match frame {
        Frame::ClientRequest { worker_name, input } => encode_client_request(&worker_name, input),
        Frame::ClientReply { worker_name, output } => encode_client_reply(&worker_name, output),
        Frame::ClientProgress { worker_name, item } => encode_client_progress(&worker_name, item),
        Frame::WorkerReady { worker_name, info } => encode_worker_ready(&worker_name, info),
        Frame::WorkerRequest { request_id, input } => encode_worker_request(request_id, input),
        Frame::WorkerReply { request_id, output } => encode_worker_reply(request_id, output),
        Frame::WorkerProgress { request_id, item } => encode_worker_progress(request_id, item),
        Frame::Heartbeat => encode_heartbeat(),
        Frame::Disconnect => encode_disconnect(),
    }
}

/// Parse an already-demultiplexed body (routing id stripped) into a
/// [`Frame`].
///
/// # Errors
///
/// Returns [`FlotillaError::InvalidFrame`] if the envelope violates
/// framing: missing empty delimiter, non-one-octet command bytes, or an
/// unrecognized command/sub-command.
pub fn parse_frame(mut parts: Vec<Bytes>) -> Result<Frame, FlotillaError> {
    if parts.is_empty() {
        return Err(FlotillaError::invalid_frame("empty envelope"));
    }

    let delimiter = parts.remove(0);
    if !delimiter.is_empty() {
        return Err(FlotillaError::invalid_frame("missing empty delimiter frame"));
    }

    if parts.is_empty() {
        return Err(FlotillaError::invalid_frame("missing command frame"));
    }
    let command = one_octet(&parts.remove(0), "command byte")?;

    match command {
        C_CLIENT => {
            if parts.len() != 2 {
                return Err(FlotillaError::invalid_frame(
                    "client frame requires [workerName, body]",
                ));
            }
            let worker_name = utf8(parts.remove(0), "workerName")?;
            let body = parts.remove(0);
            // Ambiguous direction at this layer; the caller (broker core)
            // knows from the socket's role whether this is an inbound
            // request or an outbound-bound reply being replayed.
            Ok(Frame::ClientRequest {
                worker_name,
                input: body,
            })
        }
        C_CLIENT_PROGRESS => {
            if parts.len() != 2 {
                return Err(FlotillaError::invalid_frame(
                    "client progress frame requires [workerName, item]",
                ));
            }
            let worker_name = utf8(parts.remove(0), "workerName")?;
            let item = parts.remove(0);
            Ok(Frame::ClientProgress { worker_name, item })
        }
        W_WORKER => {
            if parts.is_empty() {
                return Err(FlotillaError::invalid_frame("missing worker sub-command"));
            }
            let sub = one_octet(&parts.remove(0), "worker sub-command byte")?;
            match sub {
                W_READY => {
                    if parts.is_empty() {
                        return Err(FlotillaError::invalid_frame("READY missing workerName"));
                    }
                    let worker_name = utf8(parts.remove(0), "workerName")?;
                    let info = parts.into_iter().next().unwrap_or_else(Bytes::new);
                    Ok(Frame::WorkerReady { worker_name, info })
                }
                W_REQUEST => {
                    if parts.len() != 3 {
                        return Err(FlotillaError::invalid_frame(
                            "REQUEST requires [requestId, empty, input]",
                        ));
                    }
                    let request_id = parts.remove(0);
                    let delim = parts.remove(0);
                    if !delim.is_empty() {
                        return Err(FlotillaError::invalid_frame(
                            "REQUEST missing empty delimiter before body",
                        ));
                    }
                    let input = parts.remove(0);
                    Ok(Frame::WorkerRequest { request_id, input })
                }
                W_REPLY => {
                    if parts.len() != 3 {
                        return Err(FlotillaError::invalid_frame(
                            "REPLY requires [requestId, empty, output]",
                        ));
                    }
                    let request_id = parts.remove(0);
                    let delim = parts.remove(0);
                    if !delim.is_empty() {
                        return Err(FlotillaError::invalid_frame(
                            "REPLY missing empty delimiter before body",
                        ));
                    }
                    let output = parts.remove(0);
                    Ok(Frame::WorkerReply { request_id, output })
                }
                W_PROGRESS => {
                    if parts.len() != 3 {
                        return Err(FlotillaError::invalid_frame(
                            "PROGRESS requires [requestId, empty, item]",
                        ));
                    }
                    let request_id = parts.remove(0);
                    let delim = parts.remove(0);
                    if !delim.is_empty() {
                        return Err(FlotillaError::invalid_frame(
                            "PROGRESS missing empty delimiter before body",
                        ));
                    }
                    let item = parts.remove(0);
                    Ok(Frame::WorkerProgress { request_id, item })
                }
                W_HEARTBEAT => Ok(Frame::Heartbeat),
                W_DISCONNECT => Ok(Frame::Disconnect),
                other => Err(FlotillaError::invalid_frame(format!(
                    "unknown worker sub-command byte {other:#04x}"
                ))),
            }
        }
        other => Err(FlotillaError::invalid_frame(format!(
            "unknown command byte {other:#04x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_request_round_trips() {
        let parts = encode_client_request("echo", Bytes::from_static(b"{}"));
        match parse_frame(parts).unwrap() {
            Frame::ClientRequest { worker_name, input } => {
                assert_eq!(worker_name, "echo");
                assert_eq!(input, Bytes::from_static(b"{}"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn worker_request_round_trips() {
        let parts = encode_worker_request(Bytes::from_static(b"rid-1"), Bytes::from_static(b"{}"));
        match parse_frame(parts).unwrap() {
            Frame::WorkerRequest { request_id, input } => {
                assert_eq!(request_id, Bytes::from_static(b"rid-1"));
                assert_eq!(input, Bytes::from_static(b"{}"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_round_trips() {
        let parts = encode_heartbeat();
        assert!(matches!(parse_frame(parts).unwrap(), Frame::Heartbeat));
    }

    #[test]
    fn worker_progress_round_trips() {
        let parts = encode_worker_progress(Bytes::from_static(b"rid-1"), Bytes::from_static(b"{\"pct\":50}"));
        match parse_frame(parts).unwrap() {
            Frame::WorkerProgress { request_id, item } => {
                assert_eq!(request_id, Bytes::from_static(b"rid-1"));
                assert_eq!(item, Bytes::from_static(b"{\"pct\":50}"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn client_progress_round_trips() {
        let parts = encode_client_progress("echo", Bytes::from_static(b"{\"pct\":50}"));
        match parse_frame(parts).unwrap() {
            Frame::ClientProgress { worker_name, item } => {
                assert_eq!(worker_name, "echo");
                assert_eq!(item, Bytes::from_static(b"{\"pct\":50}"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_delimiter() {
        let parts = vec![Bytes::from_static(&[C_CLIENT])];
        assert!(parse_frame(parts).is_err());
    }

    #[test]
    fn rejects_multi_octet_command() {
        let parts = vec![Bytes::new(), Bytes::from_static(b"xx")];
        assert!(parse_frame(parts).is_err());
    }
}
