// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The production control-tree client: the tree daemon's packet protocol
//! over a unix socket.
//!
//! Every packet is a 16-byte little-endian header (operation, request id,
//! transaction id, payload length) followed by a NUL-separated payload.
//! One background task owns the socket, matches replies to requests by
//! request id, and demultiplexes asynchronous `WATCH_EVENT` packets onto
//! the per-path channels handed out by [`ControlTree::watch`].

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use domaind_api_types::Error;
use slog::{warn, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

use super::{ControlTree, Perms, TxId, WatchStream};

pub(crate) mod op {
    pub const DIRECTORY: u32 = 1;
    pub const READ: u32 = 2;
    pub const WATCH: u32 = 4;
    pub const UNWATCH: u32 = 5;
    pub const TX_START: u32 = 6;
    pub const TX_END: u32 = 7;
    pub const WRITE: u32 = 11;
    pub const MKDIR: u32 = 12;
    pub const RM: u32 = 13;
    pub const SETPERMS: u32 = 14;
    pub const WATCH_EVENT: u32 = 15;
    pub const ERROR: u32 = 16;
}

const HEADER_LEN: usize = 16;

/// The longest payload the daemon will accept.
const MAX_PAYLOAD: u32 = 4096;

pub(crate) fn encode_frame(
    op: u32,
    req_id: u32,
    tx_id: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(op);
    buf.put_u32_le(req_id);
    buf.put_u32_le(tx_id);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub op: u32,
    pub req_id: u32,
    pub tx_id: u32,
    pub len: u32,
}

pub(crate) fn parse_header(mut raw: &[u8]) -> Result<Header, Error> {
    if raw.len() < HEADER_LEN {
        return Err(Error::InternalError("short tree packet header".into()));
    }
    let hdr = Header {
        op: raw.get_u32_le(),
        req_id: raw.get_u32_le(),
        tx_id: raw.get_u32_le(),
        len: raw.get_u32_le(),
    };
    if hdr.len > MAX_PAYLOAD {
        return Err(Error::InternalError(format!(
            "oversized tree packet ({} bytes)",
            hdr.len
        )));
    }
    Ok(hdr)
}

/// Maps an `ERROR` payload (an errno name) onto the taxonomy. `EAGAIN` is
/// not an error at this layer: it is the retry signal for transaction
/// commits, handled by `tx_end`.
fn map_error_payload(name: &str) -> Error {
    match name {
        "ENOENT" => Error::DoesNotExist,
        "EEXIST" => Error::AlreadyExists,
        other => Error::IoError(format!("tree daemon: {other}")),
    }
}

enum Cmd {
    Request {
        op: u32,
        tx_id: u32,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, Error>>,
    },
    RegisterWatch {
        token: String,
        sink: mpsc::UnboundedSender<String>,
    },
    UnregisterWatch {
        token: String,
    },
}

pub struct SocketTree {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl SocketTree {
    pub async fn connect<P: AsRef<Path>>(
        path: P,
        log: Logger,
    ) -> Result<Self, Error> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self::from_stream(stream, log))
    }

    /// Builds a client over an already-connected stream (tests use a
    /// socketpair).
    pub fn from_stream(stream: UnixStream, log: Logger) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(io_task(stream, cmd_rx, log));
        Self { cmd_tx }
    }

    async fn request(
        &self,
        op: u32,
        tx_id: TxId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Request { op, tx_id, payload, reply })
            .map_err(|_| Error::IoError("tree connection closed".into()))?;
        rx.await
            .map_err(|_| Error::IoError("tree connection closed".into()))?
    }
}

fn path_payload(path: &str) -> Vec<u8> {
    let mut p = path.as_bytes().to_vec();
    p.push(0);
    p
}

#[derive(Default)]
struct IoState {
    pending: HashMap<u32, oneshot::Sender<Result<Vec<u8>, Error>>>,
    watches: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    next_req: u32,
}

impl IoState {
    fn fail_pending(&mut self) {
        for (_, reply) in self.pending.drain() {
            let _ = reply
                .send(Err(Error::IoError("tree connection lost".into())));
        }
    }
}

/// One writer task owns the socket's send half and the request-id
/// allocation; one reader task owns the receive half. They share the
/// pending-reply and watch tables, so a reply or watch event can never
/// be torn by a concurrent request.
async fn io_task(
    stream: UnixStream,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    log: Logger,
) {
    let (mut rd, mut wr) = stream.into_split();
    let state = std::sync::Arc::new(std::sync::Mutex::new(IoState {
        next_req: 1,
        ..Default::default()
    }));

    let reader_state = state.clone();
    let reader_log = log.clone();
    let reader = tokio::spawn(async move {
        let mut header = [0u8; HEADER_LEN];
        loop {
            if rd.read_exact(&mut header).await.is_err() {
                break;
            }
            let hdr = match parse_header(&header) {
                Ok(h) => h,
                Err(e) => {
                    warn!(reader_log, "malformed tree packet, closing";
                          "error" => %e);
                    break;
                }
            };
            let mut payload = vec![0u8; hdr.len as usize];
            if rd.read_exact(&mut payload).await.is_err() {
                break;
            }
            let mut state = reader_state.lock().unwrap();
            if hdr.op == op::WATCH_EVENT {
                dispatch_watch_event(&mut state.watches, &payload);
                continue;
            }
            let Some(reply) = state.pending.remove(&hdr.req_id) else {
                warn!(reader_log, "tree reply for unknown request";
                      "req_id" => hdr.req_id);
                continue;
            };
            let result = if hdr.op == op::ERROR {
                let name = str_at(&payload, 0);
                if name == "EAGAIN" {
                    // Commit-retry marker, decoded by tx_end.
                    Ok(b"EAGAIN".to_vec())
                } else {
                    Err(map_error_payload(&name))
                }
            } else {
                Ok(payload)
            };
            let _ = reply.send(result);
        }
        reader_state.lock().unwrap().fail_pending();
    });

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Cmd::Request { op, tx_id, payload, reply } => {
                let req_id = {
                    let mut state = state.lock().unwrap();
                    let req_id = state.next_req;
                    state.next_req = state.next_req.wrapping_add(1).max(1);
                    state.pending.insert(req_id, reply);
                    req_id
                };
                let frame = encode_frame(op, req_id, tx_id, &payload);
                if let Err(e) = wr.write_all(&frame).await {
                    if let Some(reply) =
                        state.lock().unwrap().pending.remove(&req_id)
                    {
                        let _ = reply.send(Err(e.into()));
                    }
                    break;
                }
            }
            Cmd::RegisterWatch { token, sink } => {
                state
                    .lock()
                    .unwrap()
                    .watches
                    .entry(token)
                    .or_default()
                    .push(sink);
            }
            Cmd::UnregisterWatch { token } => {
                state.lock().unwrap().watches.remove(&token);
            }
        }
    }

    // Client dropped or the socket broke; tear the reader down too.
    reader.abort();
    state.lock().unwrap().fail_pending();
}

/// Payload of a watch event: `<path>\0<token>\0`.
fn dispatch_watch_event(
    watches: &mut HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    payload: &[u8],
) {
    let path = str_at(payload, 0);
    let token_off = path.len() + 1;
    let token = str_at(payload, token_off);
    if let Some(sinks) = watches.get_mut(&token) {
        sinks.retain(|s| s.send(path.clone()).is_ok());
    }
}

/// The NUL-terminated string starting at `off`, or everything from `off`
/// when no terminator is present.
fn str_at(payload: &[u8], off: usize) -> String {
    let rest = payload.get(off..).unwrap_or(&[]);
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    String::from_utf8_lossy(&rest[..end]).into_owned()
}

#[async_trait]
impl ControlTree for SocketTree {
    async fn read(&self, tx: TxId, path: &str) -> Result<String, Error> {
        let resp = self.request(op::READ, tx, path_payload(path)).await?;
        Ok(str_at(&resp, 0))
    }

    async fn write(
        &self,
        tx: TxId,
        path: &str,
        value: &str,
    ) -> Result<(), Error> {
        let mut payload = path_payload(path);
        payload.extend_from_slice(value.as_bytes());
        self.request(op::WRITE, tx, payload).await?;
        Ok(())
    }

    async fn mkdir(&self, tx: TxId, path: &str) -> Result<(), Error> {
        self.request(op::MKDIR, tx, path_payload(path)).await?;
        Ok(())
    }

    async fn rm(&self, tx: TxId, path: &str) -> Result<(), Error> {
        match self.request(op::RM, tx, path_payload(path)).await {
            // Removing an absent subtree is not an error.
            Ok(_) | Err(Error::DoesNotExist) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn directory(
        &self,
        tx: TxId,
        path: &str,
    ) -> Result<Vec<String>, Error> {
        let resp =
            self.request(op::DIRECTORY, tx, path_payload(path)).await?;
        Ok(resp
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }

    async fn setperms(
        &self,
        tx: TxId,
        path: &str,
        perms: &Perms,
    ) -> Result<(), Error> {
        let mut payload = path_payload(path);
        payload.extend_from_slice(perms.wire_string().as_bytes());
        payload.push(0);
        self.request(op::SETPERMS, tx, payload).await?;
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<WatchStream, Error> {
        let (sink, rx) = mpsc::unbounded_channel();
        self.cmd_tx
            .send(Cmd::RegisterWatch { token: path.to_owned(), sink })
            .map_err(|_| Error::IoError("tree connection closed".into()))?;
        let mut payload = path_payload(path);
        // The registered path doubles as the watch token.
        payload.extend_from_slice(path.as_bytes());
        payload.push(0);
        self.request(op::WATCH, 0, payload).await?;
        Ok(rx)
    }

    async fn unwatch(&self, path: &str) -> Result<(), Error> {
        let mut payload = path_payload(path);
        payload.extend_from_slice(path.as_bytes());
        payload.push(0);
        self.request(op::UNWATCH, 0, payload).await?;
        self.cmd_tx
            .send(Cmd::UnregisterWatch { token: path.to_owned() })
            .map_err(|_| Error::IoError("tree connection closed".into()))?;
        Ok(())
    }

    async fn tx_start(&self) -> Result<TxId, Error> {
        let resp = self.request(op::TX_START, 0, vec![0]).await?;
        str_at(&resp, 0)
            .parse::<TxId>()
            .map_err(|_| Error::InternalError("bad transaction id".into()))
    }

    async fn tx_end(&self, tx: TxId, commit: bool) -> Result<bool, Error> {
        let payload = if commit { b"T\0".to_vec() } else { b"F\0".to_vec() };
        let resp = self.request(op::TX_END, tx, payload).await?;
        Ok(resp.as_slice() != b"EAGAIN")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn frames_round_trip() {
        let frame = encode_frame(op::WRITE, 7, 3, b"/a/b\0value");
        let hdr = parse_header(&frame).unwrap();
        assert_eq!(
            hdr,
            Header { op: op::WRITE, req_id: 7, tx_id: 3, len: 10 }
        );
        assert_eq!(&frame[HEADER_LEN..], b"/a/b\0value");
    }

    #[test]
    fn oversized_length_is_rejected() {
        let frame = encode_frame(op::READ, 1, 0, &[]);
        let mut bad = frame.clone();
        bad[12..16].copy_from_slice(&(MAX_PAYLOAD + 1).to_le_bytes());
        assert!(parse_header(&bad).is_err());
    }

    #[test]
    fn error_payloads_map_to_the_taxonomy() {
        assert!(matches!(map_error_payload("ENOENT"), Error::DoesNotExist));
        assert!(matches!(map_error_payload("EEXIST"), Error::AlreadyExists));
        assert!(matches!(map_error_payload("EIO"), Error::IoError(_)));
    }

    /// A one-shot fake tree daemon: answers a READ for "/name" and then a
    /// watch registration followed by one event.
    #[tokio::test]
    async fn socket_client_round_trips_and_dispatches_watch_events() {
        let (client_side, mut server_side) = UnixStream::pair().unwrap();
        let tree = SocketTree::from_stream(client_side, test_logger());

        let server = tokio::spawn(async move {
            let mut hdr = [0u8; HEADER_LEN];

            // READ /name -> "guest"
            server_side.read_exact(&mut hdr).await.unwrap();
            let h = parse_header(&hdr).unwrap();
            assert_eq!(h.op, op::READ);
            let mut payload = vec![0u8; h.len as usize];
            server_side.read_exact(&mut payload).await.unwrap();
            assert_eq!(payload, b"/name\0");
            server_side
                .write_all(&encode_frame(op::READ, h.req_id, 0, b"guest"))
                .await
                .unwrap();

            // WATCH ack, then an unsolicited event.
            server_side.read_exact(&mut hdr).await.unwrap();
            let h = parse_header(&hdr).unwrap();
            assert_eq!(h.op, op::WATCH);
            let mut payload = vec![0u8; h.len as usize];
            server_side.read_exact(&mut payload).await.unwrap();
            server_side
                .write_all(&encode_frame(op::WATCH, h.req_id, 0, b"OK\0"))
                .await
                .unwrap();
            server_side
                .write_all(&encode_frame(
                    op::WATCH_EVENT,
                    0,
                    0,
                    b"/fired/path\0/watched\0",
                ))
                .await
                .unwrap();
        });

        assert_eq!(tree.read(0, "/name").await.unwrap(), "guest");
        let mut w = tree.watch("/watched").await.unwrap();
        assert_eq!(w.recv().await.unwrap(), "/fired/path");
        server.await.unwrap();
    }
}
