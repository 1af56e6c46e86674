//! Line-oriented handshake and channel frames.
//!
//! # Responsibilities
//! - Encode/decode the handshake vocabulary (HELLO ... OPENED)
//! - Carry channel payloads (DATA) and closure notices (CLOSED)
//! - Hand the raw stream back for in-band TLS upgrades
//!
//! Binary payloads (SASL responses and challenges) are hex-encoded so every
//! frame stays a single line.

use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single frame, newline included.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Any bidirectional byte stream a frame codec can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    Closed,

    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLong,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: String },

    #[error("unread data buffered before transport upgrade")]
    PendingData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello { endpoint: String, starttls: bool },
    Mechs(Vec<String>),
    StartTls,
    Proceed,
    Auth { mechanism: String, payload: Vec<u8> },
    Challenge(Vec<u8>),
    Response(Vec<u8>),
    Success(String),
    Failure(String),
    Open(String),
    Opened(String),
    Closed(String),
    Data(String),
}

impl Frame {
    pub fn verb(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "HELLO",
            Frame::Mechs(_) => "MECHS",
            Frame::StartTls => "STARTTLS",
            Frame::Proceed => "PROCEED",
            Frame::Auth { .. } => "AUTH",
            Frame::Challenge(_) => "CHALLENGE",
            Frame::Response(_) => "RESPONSE",
            Frame::Success(_) => "SUCCESS",
            Frame::Failure(_) => "FAILURE",
            Frame::Open(_) => "OPEN",
            Frame::Opened(_) => "OPENED",
            Frame::Closed(_) => "CLOSED",
            Frame::Data(_) => "DATA",
        }
    }

    /// Render as a single line without the trailing newline.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let line = match self {
            Frame::Hello { endpoint, starttls } => {
                if *starttls {
                    format!("HELLO {endpoint} STARTTLS")
                } else {
                    format!("HELLO {endpoint}")
                }
            }
            Frame::Mechs(mechs) => format!("MECHS {}", mechs.join(" ")).trim_end().to_string(),
            Frame::StartTls | Frame::Proceed => self.verb().to_string(),
            Frame::Auth { mechanism, payload } if payload.is_empty() => format!("AUTH {mechanism}"),
            Frame::Auth { mechanism, payload } => format!("AUTH {mechanism} {}", hex::encode(payload)),
            Frame::Challenge(p) | Frame::Response(p) => format!("{} {}", self.verb(), hex::encode(p)),
            Frame::Success(s)
            | Frame::Failure(s)
            | Frame::Open(s)
            | Frame::Opened(s)
            | Frame::Closed(s)
            | Frame::Data(s) => format!("{} {s}", self.verb()),
        };
        if line.contains(['\n', '\r']) {
            return Err(ProtocolError::Malformed(format!("{} frame contains a line break", self.verb())));
        }
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Frame, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        let hex_payload = |raw: &str| {
            hex::decode(raw.trim()).map_err(|e| ProtocolError::Malformed(format!("{verb} payload: {e}")))
        };

        let frame = match verb {
            "HELLO" => {
                let mut parts = rest.split_whitespace();
                let endpoint = parts
                    .next()
                    .ok_or_else(|| ProtocolError::Malformed("HELLO without endpoint".into()))?
                    .to_string();
                Frame::Hello {
                    endpoint,
                    starttls: parts.next() == Some("STARTTLS"),
                }
            }
            "MECHS" => Frame::Mechs(rest.split_whitespace().map(str::to_string).collect()),
            "STARTTLS" => Frame::StartTls,
            "PROCEED" => Frame::Proceed,
            "AUTH" => {
                let (mechanism, payload) = rest.split_once(' ').unwrap_or((rest, ""));
                if mechanism.is_empty() {
                    return Err(ProtocolError::Malformed("AUTH without mechanism".into()));
                }
                Frame::Auth {
                    mechanism: mechanism.to_string(),
                    payload: hex_payload(payload)?,
                }
            }
            "CHALLENGE" => Frame::Challenge(hex_payload(rest)?),
            "RESPONSE" => Frame::Response(hex_payload(rest)?),
            "SUCCESS" => Frame::Success(rest.to_string()),
            "FAILURE" => Frame::Failure(rest.to_string()),
            "OPEN" => Frame::Open(rest.to_string()),
            "OPENED" => Frame::Opened(rest.to_string()),
            "CLOSED" => Frame::Closed(rest.to_string()),
            "DATA" => Frame::Data(rest.to_string()),
            other => return Err(ProtocolError::Malformed(format!("unknown verb '{other}'"))),
        };
        Ok(frame)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// A frame codec over a boxed stream.
pub struct FramedStream {
    inner: BufReader<BoxedStream>,
}

impl FramedStream {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let mut line = frame.encode()?;
        line.push('\n');
        let stream = self.inner.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn read_frame(&mut self) -> Result<Frame, ProtocolError> {
        let mut buf = Vec::new();
        let n = (&mut self.inner)
            .take(MAX_FRAME_LEN as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Err(ProtocolError::Closed);
        }
        if buf.last() != Some(&b'\n') {
            return Err(if n >= MAX_FRAME_LEN {
                ProtocolError::FrameTooLong
            } else {
                ProtocolError::Closed
            });
        }
        let line = std::str::from_utf8(&buf).map_err(|_| ProtocolError::Malformed("frame is not UTF-8".into()))?;
        Frame::decode(line)
    }

    /// Read a frame and require it to be `expected`-shaped via `accept`.
    pub async fn expect<T>(
        &mut self,
        expected: &'static str,
        accept: impl FnOnce(Frame) -> Result<T, Frame>,
    ) -> Result<T, ProtocolError> {
        let frame = self.read_frame().await?;
        accept(frame).map_err(|got| ProtocolError::Unexpected {
            expected,
            got: got.verb().to_string(),
        })
    }

    /// Give back the raw stream, e.g. to wrap it in TLS.
    ///
    /// Fails if the peer already sent bytes past the last frame.
    pub fn into_inner(self) -> Result<BoxedStream, ProtocolError> {
        if !self.inner.buffer().is_empty() {
            return Err(ProtocolError::PendingData);
        }
        Ok(self.inner.into_inner())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.get_mut().shutdown().await?;
        Ok(())
    }
}

impl fmt::Debug for FramedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedStream")
            .field("buffered", &self.inner.buffer().len())
            .finish()
    }
}
