//! Implementation of [Transport] over TCP, using length-prefixed frames.
//!
//! Every frame is a big-endian `u32` length followed by that many bytes:
//!
//! ```text
//! kind: u8 | correlation id: [u8; 16] | body
//! ```
//!
//! Requests and responses carry their headers (a `u16` count, then each key
//! and value as a `u16` length and UTF-8 bytes) followed by the payload.
//! Faults carry an `i32` code and a UTF-8 reason. Pings and pongs have no
//! body. The server must answer each frame with exactly one frame carrying
//! the same correlation id.

use crate::backend::{self, Backend, Error, Outcome, Transport};
use crate::message::{CorrelationId, Fault, Message};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Frames larger than this are rejected rather than buffered.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

const REQUEST: u8 = 1;
const RESPONSE: u8 = 2;
const FAULT: u8 = 3;
const PING: u8 = 4;
const PONG: u8 = 5;

/// One unit of traffic on a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Request(Message),
    Response(Message),
    Fault(CorrelationId, Fault),
    Ping(CorrelationId),
    Pong(CorrelationId),
}

impl Frame {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            Frame::Request(message) | Frame::Response(message) => message.correlation_id,
            Frame::Fault(id, _) | Frame::Ping(id) | Frame::Pong(id) => *id,
        }
    }

    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        let (kind, id) = match self {
            Frame::Request(m) => (REQUEST, m.correlation_id),
            Frame::Response(m) => (RESPONSE, m.correlation_id),
            Frame::Fault(id, _) => (FAULT, *id),
            Frame::Ping(id) => (PING, *id),
            Frame::Pong(id) => (PONG, *id),
        };
        buf.push(kind);
        buf.extend_from_slice(id.0.as_bytes());

        match self {
            Frame::Request(message) | Frame::Response(message) => {
                let count = u16::try_from(message.headers.len())
                    .map_err(|_| invalid("too many headers"))?;
                buf.extend_from_slice(&count.to_be_bytes());
                for (key, value) in &message.headers {
                    put_str(&mut buf, key)?;
                    put_str(&mut buf, value)?;
                }
                buf.extend_from_slice(&message.payload);
            }
            Frame::Fault(_, fault) => {
                buf.extend_from_slice(&fault.code.to_be_bytes());
                buf.extend_from_slice(fault.reason.as_bytes());
            }
            Frame::Ping(_) | Frame::Pong(_) => (),
        }
        Ok(buf)
    }

    fn decode(buf: &[u8]) -> io::Result<Self> {
        let mut reader = Reader { buf };
        let kind = reader.take(1)?[0];
        let id = CorrelationId(Uuid::from_bytes(
            reader
                .take(16)?
                .try_into()
                .map_err(|_| invalid("short correlation id"))?,
        ));

        let frame = match kind {
            REQUEST | RESPONSE => {
                let count = reader.u16()?;
                let mut headers = BTreeMap::new();
                for _ in 0..count {
                    let key = reader.string()?;
                    let value = reader.string()?;
                    headers.insert(key, value);
                }
                let message = Message {
                    correlation_id: id,
                    headers,
                    payload: reader.buf.to_vec(),
                };
                if kind == REQUEST {
                    Frame::Request(message)
                } else {
                    Frame::Response(message)
                }
            }
            FAULT => {
                let code = i32::from_be_bytes(
                    reader
                        .take(4)?
                        .try_into()
                        .map_err(|_| invalid("short fault code"))?,
                );
                let reason = String::from_utf8_lossy(reader.buf).into_owned();
                Frame::Fault(id, Fault { code, reason })
            }
            PING => Frame::Ping(id),
            PONG => Frame::Pong(id),
            other => return Err(invalid(&format!("unknown frame kind {other}"))),
        };
        Ok(frame)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> io::Result<&'a [u8]> {
        if self.buf.len() < len {
            return Err(invalid("truncated frame"));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn u16(&mut self) -> io::Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn string(&mut self) -> io::Result<String> {
        let len = self.u16()?;
        let bytes = self.take(usize::from(len))?;
        String::from_utf8(bytes.to_vec()).map_err(|_| invalid("header is not UTF-8"))
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> io::Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| invalid("header too long"))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Writes one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let body = frame.encode()?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| invalid("frame too large"))?;
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Reads one frame.
///
/// A stream which ends cleanly between frames is reported as
/// [io::ErrorKind::UnexpectedEof].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(invalid("frame too large"));
    }
    let mut body = vec![0; len as usize];
    reader.read_exact(&mut body).await?;
    Frame::decode(&body)
}

/// A TCP stream carrying one request at a time.
///
/// If a caller gives up on an exchange after writing its request but
/// before reading a whole reply, the rest of that reply may still arrive,
/// and the stream can no longer be trusted to start on a frame boundary.
/// The channel is then poisoned: every later exchange fails, so that the
/// connection is replaced.
pub struct TcpChannel {
    stream: Mutex<TcpStream>,
    poisoned: AtomicBool,
}

impl TcpChannel {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Returns true if an earlier exchange was abandoned or failed midway.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    async fn exchange(&self, frame: Frame) -> io::Result<Frame> {
        let mut stream = self.stream.lock().await;
        if self.is_poisoned() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "channel is out of sync after an abandoned exchange",
            ));
        }
        // Cleared only once a whole reply has been read. Dropping this
        // future anywhere in between leaves the flag set.
        self.poisoned.store(true, Ordering::Release);
        write_frame(&mut *stream, &frame).await?;
        let reply = read_frame(&mut *stream).await?;
        self.poisoned.store(false, Ordering::Release);
        Ok(reply)
    }
}

pub struct TcpTransport {}

fn mismatched(expected: CorrelationId, frame: &Frame) -> Error {
    Error::Other(anyhow::anyhow!(
        "expected a reply to {expected}, received a frame for {}",
        frame.correlation_id()
    ))
}

#[async_trait]
impl Transport for TcpTransport {
    type Channel = TcpChannel;

    async fn open(&self, backend: &Backend) -> Result<Self::Channel, Error> {
        let stream = TcpStream::connect(backend.address).await?;
        stream.set_nodelay(true)?;
        Ok(TcpChannel::new(stream))
    }

    async fn send(&self, channel: &Self::Channel, request: Message) -> Outcome {
        let id = request.correlation_id;
        match channel.exchange(Frame::Request(request)).await {
            Ok(Frame::Response(response)) if response.correlation_id == id => {
                Outcome::Response(response)
            }
            Ok(Frame::Fault(reply_id, fault)) if reply_id == id => Outcome::ApplicationFault(fault),
            Ok(frame) => Outcome::TransportFault(mismatched(id, &frame)),
            Err(err) => Outcome::TransportFault(err.into()),
        }
    }

    async fn probe(&self, channel: &Self::Channel) -> Result<(), Error> {
        let id = CorrelationId::new();
        match channel.exchange(Frame::Ping(id)).await? {
            Frame::Pong(reply_id) if reply_id == id => Ok(()),
            frame => Err(mismatched(id, &frame)),
        }
    }

    async fn close(&self, channel: &Self::Channel) -> Result<(), backend::Error> {
        channel.stream.lock().await.shutdown().await?;
        Ok(())
    }
}
