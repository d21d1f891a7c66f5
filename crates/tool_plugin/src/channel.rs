//! Newline-delimited JSON channel between a supervisor and its worker.
//!
//! The channel runs over a private loopback socket rather than the worker's
//! stdio, so anything a plugin prints cannot corrupt the protocol. The host
//! binds first and hands the address plus a one-time token to the worker via
//! its environment; the worker's first line on the socket must be that token.

use std::{io, time::Duration};

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{
    TcpListener, TcpStream,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{Result, ToolHostError};
use crate::message::{Message, decode_line};

/// Address of the host's channel listener.
pub const CHANNEL_ENV: &str = "TOOL_HOST_CHANNEL";
/// Token the worker must present as its first line.
pub const TOKEN_ENV: &str = "TOOL_HOST_TOKEN";

/// Longest line either side buffers; longer lines are discarded unread.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const MAX_TOKEN_BYTES: usize = 128;
const TOKEN_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Cheap, cloneable handle for writing to a channel.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    tx: UnboundedSender<Message>,
    label: String,
}

impl ChannelSender {
    /// Wrap an existing queue; the receiving end decides where messages go.
    pub fn new(tx: UnboundedSender<Message>, label: impl Into<String>) -> Self {
        Self { tx, label: label.into() }
    }

    /// Queue a message for the writer task. Fails once the peer is gone.
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| ToolHostError::ChannelClosed(self.label.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bounded line framing that yields only valid messages.
///
/// Oversized lines, lines that are not UTF-8 and lines that fail
/// `validate_message` are dropped with a warning; the stream keeps going.
/// Only a failure of the underlying reader ends it.
#[derive(Debug)]
pub struct MessageCodec {
    lines: LinesCodec,
    max_length: usize,
    label: String,
}

impl MessageCodec {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_max_length(MAX_LINE_BYTES, label)
    }

    pub fn with_max_length(max_length: usize, label: impl Into<String>) -> Self {
        Self { lines: LinesCodec::new_with_max_length(max_length), max_length, label: label.into() }
    }

    fn next_message(&mut self, buf: &mut BytesMut, eof: bool) -> Result<Option<Message>, LinesCodecError> {
        loop {
            let line = if eof { self.lines.decode_eof(buf) } else { self.lines.decode(buf) };
            match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if let Some(message) = decode_line(trimmed) {
                        return Ok(Some(message));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(channel = %self.label, max = self.max_length, "dropping oversized line");
                }
                Err(LinesCodecError::Io(err)) if err.kind() == io::ErrorKind::InvalidData => {
                    warn!(channel = %self.label, "dropping undecodable line: {err}");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, LinesCodecError> {
        self.next_message(buf, false)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, LinesCodecError> {
        self.next_message(buf, true)
    }
}

/// Wire a reader/writer pair into a message channel.
///
/// Two tasks are spawned: a writer that drains the outbound queue, and a
/// reader that validates every inbound line before forwarding it. The
/// returned receiver yields `None` once the peer closes its side.
pub fn open_channel<R, W>(
    reader: R,
    writer: W,
    label: impl Into<String>,
) -> (ChannelSender, UnboundedReceiver<Message>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let label = label.into();
    let frames = FramedRead::new(reader, MessageCodec::new(label.clone()));
    spawn_channel(frames, writer, label)
}

fn spawn_channel<R, W>(
    mut frames: FramedRead<R, MessageCodec>,
    writer: W,
    label: String,
) -> (ChannelSender, UnboundedReceiver<Message>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Message>();

    // ── writer ───────────────────────────────────────────────────────
    let writer_label = label.clone();
    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = out_rx.recv().await {
            let line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(err) => {
                    error!(channel = %writer_label, "could not serialize message: {err}");
                    continue;
                }
            };
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                debug!(channel = %writer_label, "peer closed, stopping writer");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    // ── reader ───────────────────────────────────────────────────────
    let reader_label = label.clone();
    tokio::spawn(async move {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(message) => {
                    if in_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(channel = %reader_label, "channel read failed: {err}");
                    break;
                }
            }
        }
        debug!(channel = %reader_label, "channel reader finished");
    });

    (ChannelSender { tx: out_tx, label }, in_rx)
}

type Authenticated = (FramedRead<OwnedReadHalf, LinesCodec>, OwnedWriteHalf);

/// Host side of the loopback rendezvous.
#[derive(Debug)]
pub struct ChannelListener {
    listener: TcpListener,
    token: String,
}

impl ChannelListener {
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ToolHostError::ChannelClosed(format!("bind failed: {e}")))?;
        Ok(Self { listener, token: Uuid::new_v4().to_string() })
    }

    pub fn address(&self) -> Result<String> {
        self.listener
            .local_addr()
            .map(|addr| addr.to_string())
            .map_err(|e| ToolHostError::ChannelClosed(e.to_string()))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Wait for the worker to connect with the right token.
    ///
    /// Every connection reads its token in its own task with a short
    /// deadline, so a silent or bogus peer cannot hold up the real worker.
    pub async fn accept(
        &self,
        label: impl Into<String>,
    ) -> Result<(ChannelSender, UnboundedReceiver<Message>)> {
        let label = label.into();
        let (auth_tx, mut auth_rx) = mpsc::channel::<Authenticated>(1);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted
                        .map_err(|e| ToolHostError::ChannelClosed(format!("accept failed: {e}")))?;
                    let token = self.token.clone();
                    let label = label.clone();
                    let auth_tx = auth_tx.clone();
                    tokio::spawn(async move {
                        match authenticate(stream, &token).await {
                            Ok(pair) => {
                                debug!(channel = %label, %peer, "worker connected");
                                let _ = auth_tx.send(pair).await;
                            }
                            Err(reason) => warn!(channel = %label, %peer, "rejected connection: {reason}"),
                        }
                    });
                }
                Some((frames, write)) = auth_rx.recv() => {
                    let codec_label = label.clone();
                    let frames = frames.map_decoder(|_| MessageCodec::new(codec_label));
                    return Ok(spawn_channel(frames, write, label));
                }
            }
        }
    }
}

async fn authenticate(stream: TcpStream, token: &str) -> std::result::Result<Authenticated, String> {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_TOKEN_BYTES));
    match tokio::time::timeout(TOKEN_READ_TIMEOUT, lines.next()).await {
        Ok(Some(Ok(line))) if line.trim() == token => Ok((lines, write)),
        Ok(Some(Ok(_))) => Err("bad token".into()),
        Ok(Some(Err(err))) => Err(err.to_string()),
        Ok(None) => Err("closed before sending a token".into()),
        Err(_) => Err("no token within deadline".into()),
    }
}

/// Worker side: connect to the host and authenticate.
pub async fn connect(
    address: &str,
    token: &str,
    label: impl Into<String>,
) -> Result<(ChannelSender, UnboundedReceiver<Message>)> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| ToolHostError::ChannelClosed(format!("connect to {address} failed: {e}")))?;
    let _ = stream.set_nodelay(true);
    let (read, mut write) = stream.into_split();
    write
        .write_all(format!("{token}\n").as_bytes())
        .await
        .map_err(|e| ToolHostError::ChannelClosed(e.to_string()))?;
    Ok(open_channel(read, write, label))
}
